//! The capability-set trait consumed by the (out-of-scope) FUSE binding.
//!
//! [`echofs_core::BackendRegistry`] together with a per-open-file handle
//! table implements this trait; no `fuse`/`fuser` crate is pulled in, since
//! the FUSE dispatch loop itself remains an external collaborator.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use echofs_core::{BackendRegistry, EchoFsError, FileKind, ResidentFile, Result, Stat};

/// Opaque handle returned by [`PmemFilesystem::open`], threaded through
/// subsequent `read`/`write`/`fallocate`/`release` calls.
pub type FileHandle = u64;

pub trait PmemFilesystem {
    fn stat(&self, path: &str) -> Result<Stat>;
    fn readdir(&self, path: &str) -> Result<Vec<String>>;
    fn create(&self, path: &str, mode: u32) -> Result<()>;
    fn unlink(&self, path: &str) -> Result<()>;
    fn rename(&self, old: &str, new: &str) -> Result<()>;
    fn mkdir(&self, path: &str, mode: u32) -> Result<()>;
    fn rmdir(&self, path: &str) -> Result<()>;
    fn chmod(&self, path: &str, mode: u32) -> Result<()>;
    fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()>;
    fn open(&self, path: &str) -> Result<FileHandle>;
    fn read(&self, handle: FileHandle, off: u64, len: u64, buf: &mut [u8]) -> Result<u64>;
    fn write(&self, handle: FileHandle, off: u64, buf: &[u8]) -> Result<u64>;
    fn truncate(&self, path: &str, len: u64) -> Result<()>;
    fn fallocate(&self, handle: FileHandle, off: u64, len: u64) -> Result<()>;
    fn release(&self, handle: FileHandle) -> Result<()>;
}

/// Binds [`BackendRegistry`] (pathname-addressed) to the handle-addressed
/// shape the VFS surface expects, by keeping a table of open handles ->
/// resident files.
pub struct RegistryFilesystem {
    registry: Arc<BackendRegistry>,
    handles: Mutex<std::collections::HashMap<FileHandle, Arc<ResidentFile>>>,
    next_handle: AtomicU64,
}

impl RegistryFilesystem {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            handles: Mutex::new(std::collections::HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn resolve(&self, handle: FileHandle) -> Result<Arc<ResidentFile>> {
        self.handles
            .lock()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or_else(|| EchoFsError::invalid_arguments(format!("unknown file handle {handle}")))
    }
}

impl PmemFilesystem for RegistryFilesystem {
    fn stat(&self, path: &str) -> Result<Stat> {
        self.registry.lookup_stat(path)
    }

    fn readdir(&self, path: &str) -> Result<Vec<String>> {
        self.registry.readdir(path)
    }

    fn create(&self, path: &str, mode: u32) -> Result<()> {
        self.registry.create(path, mode, FileKind::Persistent)
    }

    fn unlink(&self, path: &str) -> Result<()> {
        self.registry.unlink(path)
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.registry.rename(old, new)
    }

    fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        self.registry.mkdir(path, mode)
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        self.registry.rmdir(path)
    }

    fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.registry.chmod(path, mode)
    }

    fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.registry.chown(path, uid, gid)
    }

    fn open(&self, path: &str) -> Result<FileHandle> {
        let file = self.registry.open(path)?;
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().unwrap().insert(handle, file);
        Ok(handle)
    }

    fn read(&self, handle: FileHandle, off: u64, len: u64, buf: &mut [u8]) -> Result<u64> {
        let file = self.resolve(handle)?;
        Ok(file.read(off, len, buf))
    }

    fn write(&self, handle: FileHandle, off: u64, buf: &[u8]) -> Result<u64> {
        let file = self.resolve(handle)?;
        file.write(off, buf)
    }

    fn truncate(&self, path: &str, len: u64) -> Result<()> {
        self.registry.open(path)?.truncate(len)
    }

    fn fallocate(&self, handle: FileHandle, off: u64, len: u64) -> Result<()> {
        let file = self.resolve(handle)?;
        file.allocate(off, len)
    }

    fn release(&self, handle: FileHandle) -> Result<()> {
        self.handles
            .lock()
            .unwrap()
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| EchoFsError::invalid_arguments(format!("unknown file handle {handle}")))
    }
}

/// Resolves a pathname-with-trailing-components backing-store target for
/// an unload, used by the RPC layer.
pub fn backing_store_target(root_dir: &Path, path: &str) -> PathBuf {
    root_dir.join(path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use echofs_core::PmemPool;

    fn fs() -> RegistryFilesystem {
        let pool = Arc::new(PmemPool::open(None, 8 * 1024 * 1024, 1024 * 1024).unwrap());
        RegistryFilesystem::new(Arc::new(BackendRegistry::new(pool)))
    }

    #[test]
    fn create_open_write_read_release_roundtrip() {
        let fs = fs();
        fs.create("/a", 0o644).unwrap();
        let h = fs.open("/a").unwrap();
        fs.write(h, 0, b"HELLO").unwrap();
        let mut buf = [0u8; 5];
        let n = fs.read(h, 0, 5, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"HELLO");
        fs.release(h).unwrap();
        assert!(fs.read(h, 0, 5, &mut buf).is_err());
    }

    #[test]
    fn truncate_then_stat_reflects_new_size() {
        let fs = fs();
        fs.create("/a", 0o644).unwrap();
        let h = fs.open("/a").unwrap();
        fs.write(h, 0, b"HELLOWORLD").unwrap();
        fs.truncate("/a", 5).unwrap();
        assert_eq!(fs.stat("/a").unwrap().size, 5);
    }
}
