// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! NFS Export Infrastructure
//!
//! User-space NFSv3 server (nfsserve crate) exporting the caller's working
//! directory. It only ever listens on loopback; the container reaches it through
//! filesystem sub-channels of the SSH connection.
//!
//! ## Architecture
//! ```text
//! Container (kernel NFS client) → Docker volume / host mount / socket
//!   → gateway bridge listener → "sandshell-fs" SSH sub-channel
//!   → producer loopback TCP → LocalExport (implements nfsserve::NFSFileSystem)
//!   → caller's directory
//! ```

pub mod file_handle;
pub mod server;

pub use file_handle::{FileIdTable, ROOT_FILEID};
pub use server::{LocalExport, NfsExport, NfsExportError};
