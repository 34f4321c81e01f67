// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! NFS file id table
//!
//! NFSv3 clients address files by an opaque 64-bit `fileid3`. The export hands
//! out ids on first sight of a path and keeps the mapping for the lifetime of
//! the export, so ids stay stable across LOOKUP and READDIR.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Bidirectional fileid3 <-> export-relative path mapping

use nfsserve::nfs::fileid3;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Root of every export. NFS forbids 0.
pub const ROOT_FILEID: fileid3 = 1;

#[derive(Default)]
struct Maps {
    forward: HashMap<fileid3, PathBuf>,
    reverse: HashMap<PathBuf, fileid3>,
}

pub struct FileIdTable {
    next_fileid: std::sync::atomic::AtomicU64,
    maps: RwLock<Maps>,
}

impl Default for FileIdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileIdTable {
    pub fn new() -> Self {
        let mut maps = Maps::default();
        maps.forward.insert(ROOT_FILEID, PathBuf::new());
        maps.reverse.insert(PathBuf::new(), ROOT_FILEID);
        Self {
            next_fileid: std::sync::atomic::AtomicU64::new(ROOT_FILEID + 1),
            maps: RwLock::new(maps),
        }
    }

    /// Id for an export-relative path, allocating one if needed.
    pub fn register(&self, path: &Path) -> fileid3 {
        if let Some(&id) = self.maps.read().reverse.get(path) {
            return id;
        }

        let mut maps = self.maps.write();
        // Another task may have registered it between the two locks
        if let Some(&id) = maps.reverse.get(path) {
            return id;
        }
        let id = self
            .next_fileid
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        maps.forward.insert(id, path.to_path_buf());
        maps.reverse.insert(path.to_path_buf(), id);
        debug!("Registered fileid={} path={}", id, path.display());
        id
    }

    pub fn path_of(&self, id: fileid3) -> Option<PathBuf> {
        self.maps.read().forward.get(&id).cloned()
    }

    /// Drop a path and everything below it.
    pub fn forget(&self, path: &Path) {
        if path.as_os_str().is_empty() {
            return;
        }
        let mut maps = self.maps.write();
        let doomed: Vec<PathBuf> = maps
            .reverse
            .keys()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();
        for p in doomed {
            if let Some(id) = maps.reverse.remove(&p) {
                maps.forward.remove(&id);
            }
        }
    }

    /// Move a path and its descendants, keeping their ids.
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut maps = self.maps.write();

        // Whatever the destination replaced is gone
        let replaced: Vec<PathBuf> = maps
            .reverse
            .keys()
            .filter(|p| p.starts_with(to))
            .cloned()
            .collect();
        for p in replaced {
            if let Some(id) = maps.reverse.remove(&p) {
                maps.forward.remove(&id);
            }
        }

        let moved: Vec<(PathBuf, fileid3)> = maps
            .reverse
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, id)| (p.clone(), *id))
            .collect();
        for (old, id) in moved {
            let suffix = old.strip_prefix(from).unwrap_or(Path::new(""));
            let new = if suffix.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(suffix)
            };
            maps.reverse.remove(&old);
            maps.reverse.insert(new.clone(), id);
            maps.forward.insert(id, new);
        }
    }

    pub fn len(&self) -> usize {
        self.maps.read().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
