// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! NFS export of a local directory
//!
//! Serves one directory tree over NFSv3 using the nfsserve crate. The producer
//! side of a session runs one export on loopback and pipes every filesystem
//! sub-channel into it.
//!
//! ## Confinement
//! - Names received from clients go through [`PathSanitizer::child_name`]
//! - `..` from the export root resolves to the root itself
//! - Directory ids are re-checked with `lstat`, so a symlink is never
//!   traversed as a directory on the host
//! - New symlinks must be relative and stay inside the export
//!
//! ## Mount options
//! No NLM and no separate mount daemon: clients must mount with
//! `nolock,port=P,mountport=P,nfsvers=3,proto=tcp`.

use nfsserve::nfs::{
    fattr3, fileid3, filename3, ftype3, nfspath3, nfsstat3, nfsstring, nfstime3, sattr3, set_mode3,
    set_size3, specdata3,
};
use nfsserve::tcp::{NFSTcp, NFSTcpListener};
use nfsserve::vfs::{self, NFSFileSystem};
use parking_lot::Mutex;
use std::io::{self, SeekFrom};
use std::net::SocketAddr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::file_handle::{FileIdTable, ROOT_FILEID};
use crate::domain::path_sanitizer::PathSanitizer;

#[derive(Debug, Error)]
pub enum NfsExportError {
    #[error("Export root {path:?} is not a directory: {reason}")]
    InvalidRoot { path: PathBuf, reason: String },

    #[error("Failed to bind NFS listener on {addr}: {error}")]
    BindFailed { addr: String, error: String },
}

fn io_status(e: &io::Error) -> nfsstat3 {
    match e.kind() {
        io::ErrorKind::NotFound => nfsstat3::NFS3ERR_NOENT,
        io::ErrorKind::PermissionDenied => nfsstat3::NFS3ERR_ACCES,
        io::ErrorKind::AlreadyExists => nfsstat3::NFS3ERR_EXIST,
        io::ErrorKind::DirectoryNotEmpty => nfsstat3::NFS3ERR_NOTEMPTY,
        io::ErrorKind::NotADirectory => nfsstat3::NFS3ERR_NOTDIR,
        io::ErrorKind::IsADirectory => nfsstat3::NFS3ERR_ISDIR,
        io::ErrorKind::StorageFull => nfsstat3::NFS3ERR_NOSPC,
        io::ErrorKind::ReadOnlyFilesystem => nfsstat3::NFS3ERR_ROFS,
        _ => nfsstat3::NFS3ERR_IO,
    }
}

fn nfs_time(seconds: i64, nanos: i64) -> nfstime3 {
    nfstime3 {
        seconds: seconds.clamp(0, u32::MAX as i64) as u32,
        nseconds: nanos.clamp(0, 999_999_999) as u32,
    }
}

fn file_type(meta: &std::fs::Metadata) -> ftype3 {
    let file_type = meta.file_type();
    if file_type.is_dir() {
        ftype3::NF3DIR
    } else if file_type.is_symlink() {
        ftype3::NF3LNK
    } else if file_type.is_fifo() {
        ftype3::NF3FIFO
    } else if file_type.is_socket() {
        ftype3::NF3SOCK
    } else if file_type.is_char_device() {
        ftype3::NF3CHR
    } else if file_type.is_block_device() {
        ftype3::NF3BLK
    } else {
        ftype3::NF3REG
    }
}

/// Major and minor numbers of a Linux `dev_t`.
fn device_numbers(rdev: u64) -> specdata3 {
    specdata3 {
        specdata1: (((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff)) as u32,
        specdata2: ((rdev & 0xff) | ((rdev >> 12) & !0xff)) as u32,
    }
}

fn to_fattr(id: fileid3, meta: &std::fs::Metadata) -> fattr3 {
    let ftype = file_type(meta);
    let rdev = match ftype {
        ftype3::NF3CHR | ftype3::NF3BLK => device_numbers(meta.rdev()),
        _ => specdata3 {
            specdata1: 0,
            specdata2: 0,
        },
    };

    fattr3 {
        ftype,
        mode: meta.mode() & 0o7777,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.size(),
        used: meta.blocks() * 512,
        rdev,
        fsid: 0,
        fileid: id,
        atime: nfs_time(meta.atime(), meta.atime_nsec()),
        mtime: nfs_time(meta.mtime(), meta.mtime_nsec()),
        ctime: nfs_time(meta.ctime(), meta.ctime_nsec()),
    }
}

/// [`NFSFileSystem`] over one host directory.
pub struct LocalExport {
    root: PathBuf,
    ids: FileIdTable,
    sanitizer: PathSanitizer,
}

impl LocalExport {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, NfsExportError> {
        let root = root.as_ref();
        let canonical = std::fs::canonicalize(root).map_err(|e| NfsExportError::InvalidRoot {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !canonical.is_dir() {
            return Err(NfsExportError::InvalidRoot {
                path: canonical,
                reason: "not a directory".to_string(),
            });
        }
        Ok(Self {
            root: canonical,
            ids: FileIdTable::new(),
            sanitizer: PathSanitizer::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, rel: &Path) -> PathBuf {
        if rel.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    fn rel_path(&self, id: fileid3) -> Result<PathBuf, nfsstat3> {
        self.ids.path_of(id).ok_or(nfsstat3::NFS3ERR_STALE)
    }

    async fn lstat(&self, rel: &Path) -> Result<std::fs::Metadata, nfsstat3> {
        tokio::fs::symlink_metadata(self.host_path(rel))
            .await
            .map_err(|e| io_status(&e))
    }

    /// Directory behind `id`; symlinks are refused.
    async fn dir_path(&self, id: fileid3) -> Result<PathBuf, nfsstat3> {
        let rel = self.rel_path(id)?;
        if !self.lstat(&rel).await?.is_dir() {
            return Err(nfsstat3::NFS3ERR_NOTDIR);
        }
        Ok(rel)
    }

    /// Regular file behind `id`; symlinks are refused.
    async fn file_path(&self, id: fileid3) -> Result<PathBuf, nfsstat3> {
        let rel = self.rel_path(id)?;
        let meta = self.lstat(&rel).await?;
        if meta.is_dir() {
            return Err(nfsstat3::NFS3ERR_ISDIR);
        }
        if !meta.is_file() {
            return Err(nfsstat3::NFS3ERR_INVAL);
        }
        Ok(rel)
    }

    async fn child(&self, dirid: fileid3, name: &filename3) -> Result<(PathBuf, PathBuf), nfsstat3> {
        let dir = self.dir_path(dirid).await?;
        let name = self.sanitizer.child_name(name).map_err(|e| {
            warn!("Rejected NFS name: {}", e);
            nfsstat3::NFS3ERR_ACCES
        })?;
        let rel = dir.join(&name);
        Ok((dir, rel))
    }

    async fn attr_of(&self, rel: &Path) -> Result<(fileid3, fattr3), nfsstat3> {
        let meta = self.lstat(rel).await?;
        let id = self.ids.register(rel);
        Ok((id, to_fattr(id, &meta)))
    }

    async fn apply_sattr(&self, rel: &Path, attr: &sattr3) -> Result<(), nfsstat3> {
        let path = self.host_path(rel);
        if let set_mode3::mode(mode) = attr.mode {
            let perms = std::fs::Permissions::from_mode(mode & 0o7777);
            tokio::fs::set_permissions(&path, perms)
                .await
                .map_err(|e| io_status(&e))?;
        }
        if let set_size3::size(size) = attr.size {
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| io_status(&e))?;
            file.set_len(size).await.map_err(|e| io_status(&e))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl NFSFileSystem for LocalExport {
    fn root_dir(&self) -> fileid3 {
        ROOT_FILEID
    }

    fn capabilities(&self) -> vfs::VFSCapabilities {
        vfs::VFSCapabilities::ReadWrite
    }

    async fn lookup(&self, dirid: fileid3, filename: &filename3) -> Result<fileid3, nfsstat3> {
        debug!("NFS LOOKUP: dirid={}, filename={:?}", dirid, filename);
        let raw: &[u8] = filename;
        match raw {
            b"." => {
                self.dir_path(dirid).await?;
                return Ok(dirid);
            }
            b".." => {
                let dir = self.dir_path(dirid).await?;
                let parent = dir.parent().map(Path::to_path_buf).unwrap_or_default();
                return Ok(self.ids.register(&parent));
            }
            _ => {}
        }

        let (_, rel) = self.child(dirid, filename).await?;
        self.lstat(&rel).await?;
        Ok(self.ids.register(&rel))
    }

    async fn getattr(&self, id: fileid3) -> Result<fattr3, nfsstat3> {
        debug!("NFS GETATTR: id={}", id);
        let rel = self.rel_path(id)?;
        let meta = self.lstat(&rel).await?;
        Ok(to_fattr(id, &meta))
    }

    async fn setattr(&self, id: fileid3, setattr: sattr3) -> Result<fattr3, nfsstat3> {
        debug!("NFS SETATTR: id={}", id);
        let rel = self.rel_path(id)?;
        if self.lstat(&rel).await?.file_type().is_symlink() {
            return Err(nfsstat3::NFS3ERR_INVAL);
        }
        self.apply_sattr(&rel, &setattr).await?;
        self.getattr(id).await
    }

    async fn read(&self, id: fileid3, offset: u64, count: u32) -> Result<(Vec<u8>, bool), nfsstat3> {
        debug!("NFS READ: id={}, offset={}, count={}", id, offset, count);
        let rel = self.file_path(id).await?;
        let mut file = tokio::fs::File::open(self.host_path(&rel))
            .await
            .map_err(|e| io_status(&e))?;
        let len = file.metadata().await.map_err(|e| io_status(&e))?.len();
        if offset >= len {
            return Ok((Vec::new(), true));
        }

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_status(&e))?;
        let want = (count as u64).min(len - offset) as usize;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| io_status(&e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        let eof = offset + filled as u64 >= len;
        Ok((buf, eof))
    }

    async fn write(&self, id: fileid3, offset: u64, data: &[u8]) -> Result<fattr3, nfsstat3> {
        debug!("NFS WRITE: id={}, offset={}, len={}", id, offset, data.len());
        let rel = self.file_path(id).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.host_path(&rel))
            .await
            .map_err(|e| io_status(&e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_status(&e))?;
        file.write_all(data).await.map_err(|e| io_status(&e))?;
        file.flush().await.map_err(|e| io_status(&e))?;
        self.getattr(id).await
    }

    async fn create(
        &self,
        dirid: fileid3,
        filename: &filename3,
        attr: sattr3,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        debug!("NFS CREATE: dirid={}, filename={:?}", dirid, filename);
        let (_, rel) = self.child(dirid, filename).await?;
        tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.host_path(&rel))
            .await
            .map_err(|e| io_status(&e))?;
        self.apply_sattr(&rel, &attr).await?;
        self.attr_of(&rel).await
    }

    async fn create_exclusive(&self, dirid: fileid3, filename: &filename3) -> Result<fileid3, nfsstat3> {
        debug!("NFS CREATE EXCLUSIVE: dirid={}, filename={:?}", dirid, filename);
        let (_, rel) = self.child(dirid, filename).await?;
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.host_path(&rel))
            .await
            .map_err(|e| io_status(&e))?;
        Ok(self.ids.register(&rel))
    }

    async fn mkdir(&self, dirid: fileid3, dirname: &filename3) -> Result<(fileid3, fattr3), nfsstat3> {
        debug!("NFS MKDIR: dirid={}, dirname={:?}", dirid, dirname);
        let (_, rel) = self.child(dirid, dirname).await?;
        tokio::fs::create_dir(self.host_path(&rel))
            .await
            .map_err(|e| io_status(&e))?;
        self.attr_of(&rel).await
    }

    async fn remove(&self, dirid: fileid3, filename: &filename3) -> Result<(), nfsstat3> {
        debug!("NFS REMOVE: dirid={}, filename={:?}", dirid, filename);
        let (_, rel) = self.child(dirid, filename).await?;
        let path = self.host_path(&rel);
        let meta = self.lstat(&rel).await?;
        let result = if meta.is_dir() {
            tokio::fs::remove_dir(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        result.map_err(|e| io_status(&e))?;
        self.ids.forget(&rel);
        Ok(())
    }

    async fn rename(
        &self,
        from_dirid: fileid3,
        from_filename: &filename3,
        to_dirid: fileid3,
        to_filename: &filename3,
    ) -> Result<(), nfsstat3> {
        debug!(
            "NFS RENAME: {}:{:?} -> {}:{:?}",
            from_dirid, from_filename, to_dirid, to_filename
        );
        let (_, from) = self.child(from_dirid, from_filename).await?;
        let (_, to) = self.child(to_dirid, to_filename).await?;
        tokio::fs::rename(self.host_path(&from), self.host_path(&to))
            .await
            .map_err(|e| io_status(&e))?;
        self.ids.rename(&from, &to);
        Ok(())
    }

    async fn readdir(
        &self,
        dirid: fileid3,
        start_after: fileid3,
        max_entries: usize,
    ) -> Result<vfs::ReadDirResult, nfsstat3> {
        debug!("NFS READDIR: dirid={}, start_after={}, max={}", dirid, start_after, max_entries);
        let dir = self.dir_path(dirid).await?;

        let mut names = Vec::new();
        let mut reader = tokio::fs::read_dir(self.host_path(&dir))
            .await
            .map_err(|e| io_status(&e))?;
        while let Some(entry) = reader.next_entry().await.map_err(|e| io_status(&e))? {
            names.push(entry.file_name());
        }
        // Stable order so cookies survive between calls
        names.sort();

        let mut ids = Vec::with_capacity(names.len());
        for name in &names {
            let rel = dir.join(name);
            ids.push((self.ids.register(&rel), rel));
        }

        let start = if start_after == 0 {
            0
        } else {
            match ids.iter().position(|(id, _)| *id == start_after) {
                Some(pos) => pos + 1,
                None => return Err(nfsstat3::NFS3ERR_BAD_COOKIE),
            }
        };

        let mut entries = Vec::new();
        for (id, rel) in ids.iter().skip(start).take(max_entries) {
            // Entries can vanish between listing and stat
            let meta = match self.lstat(rel).await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let name = rel.file_name().map(|n| n.as_bytes().to_vec()).unwrap_or_default();
            entries.push(vfs::DirEntry {
                fileid: *id,
                name: nfsstring::from(name),
                attr: to_fattr(*id, &meta),
            });
        }

        Ok(vfs::ReadDirResult {
            end: start + max_entries >= ids.len(),
            entries,
        })
    }

    async fn symlink(
        &self,
        dirid: fileid3,
        linkname: &filename3,
        symlink_data: &nfspath3,
        attr: &sattr3,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        debug!("NFS SYMLINK: dirid={}, linkname={:?}", dirid, linkname);
        let (dir, rel) = self.child(dirid, linkname).await?;
        let target = self
            .sanitizer
            .symlink_target(&dir, symlink_data)
            .map_err(|e| {
                warn!("Rejected symlink target: {}", e);
                nfsstat3::NFS3ERR_ACCES
            })?;
        tokio::fs::symlink(&target, self.host_path(&rel))
            .await
            .map_err(|e| io_status(&e))?;
        if !matches!(attr.mode, set_mode3::Void) {
            debug!("Ignoring mode on symlink {}", rel.display());
        }
        self.attr_of(&rel).await
    }

    async fn readlink(&self, id: fileid3) -> Result<nfspath3, nfsstat3> {
        debug!("NFS READLINK: id={}", id);
        let rel = self.rel_path(id)?;
        let target = tokio::fs::read_link(self.host_path(&rel))
            .await
            .map_err(|e| io_status(&e))?;
        Ok(nfsstring::from(target.as_os_str().as_bytes().to_vec()))
    }
}

/// Running NFS listener for one [`LocalExport`].
pub struct NfsExport {
    root: PathBuf,
    addr: SocketAddr,
    server_handle: Mutex<Option<AbortHandle>>,
}

impl NfsExport {
    /// Bind `bind_addr` (port 0 for ephemeral) and start serving `root`.
    pub async fn serve(root: impl AsRef<Path>, bind_addr: &str) -> Result<Self, NfsExportError> {
        let export = LocalExport::new(root)?;
        let root = export.root().to_path_buf();

        let listener = NFSTcpListener::bind(bind_addr, export)
            .await
            .map_err(|e| NfsExportError::BindFailed {
                addr: bind_addr.to_string(),
                error: e.to_string(),
            })?;
        let addr = SocketAddr::new(listener.get_listen_ip(), listener.get_listen_port());

        let handle = tokio::spawn(async move {
            debug!("NFS export task started");
            if let Err(e) = listener.handle_forever().await {
                error!("NFS export error: {}", e);
            }
            debug!("NFS export task stopped");
        });

        info!("Exporting {} over NFS on {}", root.display(), addr);
        Ok(Self {
            root,
            addr,
            server_handle: Mutex::new(Some(handle.abort_handle())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        self.server_handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.server_handle.lock().take() {
            handle.abort();
            info!("Stopped NFS export of {}", self.root.display());
        }
    }
}

impl Drop for NfsExport {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn name(s: &str) -> filename3 {
        nfsstring::from(s.as_bytes().to_vec())
    }

    fn export_with_files() -> (TempDir, LocalExport) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"beta").unwrap();
        let export = LocalExport::new(dir.path()).unwrap();
        (dir, export)
    }

    #[tokio::test]
    async fn lookup_and_read() {
        let (_dir, export) = export_with_files();
        let id = export.lookup(ROOT_FILEID, &name("a.txt")).await.unwrap();
        let (data, eof) = export.read(id, 0, 1024).await.unwrap();
        assert_eq!(data, b"alpha");
        assert!(eof);

        let (data, eof) = export.read(id, 2, 2).await.unwrap();
        assert_eq!(data, b"ph");
        assert!(!eof);

        let attr = export.getattr(id).await.unwrap();
        assert_eq!(attr.size, 5);
        assert!(matches!(attr.ftype, ftype3::NF3REG));
        assert_eq!(attr.fileid, id);
    }

    #[tokio::test]
    async fn writes_land_on_host() {
        let (dir, export) = export_with_files();
        let (id, _) = export
            .create(ROOT_FILEID, &name("new.txt"), sattr3::default())
            .await
            .unwrap();
        export.write(id, 0, b"hello from container").await.unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("new.txt")).unwrap(),
            b"hello from container"
        );
    }

    #[tokio::test]
    async fn dotdot_at_root_stays_at_root() {
        let (_dir, export) = export_with_files();
        let parent = export.lookup(ROOT_FILEID, &name("..")).await.unwrap();
        assert_eq!(parent, ROOT_FILEID);

        let sub = export.lookup(ROOT_FILEID, &name("sub")).await.unwrap();
        assert_eq!(export.lookup(sub, &name("..")).await.unwrap(), ROOT_FILEID);
    }

    #[tokio::test]
    async fn rejects_separator_names_and_escaping_links() {
        let (_dir, export) = export_with_files();
        assert!(export.lookup(ROOT_FILEID, &name("sub/b.txt")).await.is_err());
        assert!(export
            .symlink(ROOT_FILEID, &name("passwd"), &name("/etc/passwd"), &sattr3::default())
            .await
            .is_err());
        assert!(export
            .symlink(ROOT_FILEID, &name("up"), &name("../outside"), &sattr3::default())
            .await
            .is_err());

        let (id, _) = export
            .symlink(ROOT_FILEID, &name("link"), &name("sub/b.txt"), &sattr3::default())
            .await
            .unwrap();
        let target = export.readlink(id).await.unwrap();
        let target: &[u8] = &target;
        assert_eq!(target, b"sub/b.txt");
    }

    #[tokio::test]
    async fn symlinked_directories_are_not_traversed() {
        let (dir, export) = export_with_files();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

        let link = export.lookup(ROOT_FILEID, &name("escape")).await.unwrap();
        assert!(matches!(
            export.lookup(link, &name("secret")).await,
            Err(nfsstat3::NFS3ERR_NOTDIR)
        ));
    }

    #[tokio::test]
    async fn readdir_pages_with_cookies() {
        let (_dir, export) = export_with_files();
        let first = export.readdir(ROOT_FILEID, 0, 1).await.unwrap();
        assert_eq!(first.entries.len(), 1);
        assert!(!first.end);
        let first_name: &[u8] = &first.entries[0].name;
        assert_eq!(first_name, b"a.txt");

        let rest = export
            .readdir(ROOT_FILEID, first.entries[0].fileid, 10)
            .await
            .unwrap();
        assert!(rest.end);
        let rest_name: &[u8] = &rest.entries[0].name;
        assert_eq!(rest_name, b"sub");

        assert!(matches!(
            export.readdir(ROOT_FILEID, 9999, 10).await,
            Err(nfsstat3::NFS3ERR_BAD_COOKIE)
        ));
    }

    #[tokio::test]
    async fn rename_and_remove_keep_ids_consistent() {
        let (dir, export) = export_with_files();
        let sub = export.lookup(ROOT_FILEID, &name("sub")).await.unwrap();
        let b = export.lookup(sub, &name("b.txt")).await.unwrap();

        export
            .rename(ROOT_FILEID, &name("sub"), ROOT_FILEID, &name("moved"))
            .await
            .unwrap();
        let (data, _) = export.read(b, 0, 16).await.unwrap();
        assert_eq!(data, b"beta");

        export.remove(sub, &name("b.txt")).await.unwrap();
        export.remove(ROOT_FILEID, &name("moved")).await.unwrap();
        assert!(!dir.path().join("moved").exists());
        assert!(matches!(export.getattr(b).await, Err(nfsstat3::NFS3ERR_STALE)));
    }

    #[tokio::test]
    async fn setattr_truncates() {
        let (dir, export) = export_with_files();
        let id = export.lookup(ROOT_FILEID, &name("a.txt")).await.unwrap();
        let attr = sattr3 {
            size: set_size3::size(2),
            ..sattr3::default()
        };
        let updated = export.setattr(id, attr).await.unwrap();
        assert_eq!(updated.size, 2);
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"al");
    }

    #[tokio::test]
    async fn special_files_keep_their_type() {
        let (dir, export) = export_with_files();
        let _socket = std::os::unix::net::UnixListener::bind(dir.path().join("agent.sock")).unwrap();

        let id = export.lookup(ROOT_FILEID, &name("agent.sock")).await.unwrap();
        let attr = export.getattr(id).await.unwrap();
        assert!(matches!(attr.ftype, ftype3::NF3SOCK));
        assert_eq!(attr.rdev.specdata1, 0);

        let sub = export.lookup(ROOT_FILEID, &name("sub")).await.unwrap();
        assert!(matches!(export.getattr(sub).await.unwrap().ftype, ftype3::NF3DIR));
    }

    #[test]
    fn device_numbers_split_major_and_minor() {
        // makedev(8, 1), /dev/sda1
        let rdev = device_numbers(0x801);
        assert_eq!((rdev.specdata1, rdev.specdata2), (8, 1));
        // makedev(259, 65536) spills the minor past the low byte.
        let rdev = device_numbers(0x1001_0300);
        assert_eq!((rdev.specdata1, rdev.specdata2), (259, 65536));
    }

    #[tokio::test]
    async fn serve_binds_ephemeral_port() {
        let dir = TempDir::new().unwrap();
        let export = NfsExport::serve(dir.path(), "127.0.0.1:0").await.unwrap();
        assert_ne!(export.local_addr().port(), 0);
        assert!(export.is_running());
        export.stop();
        assert!(!export.is_running());
    }
}
