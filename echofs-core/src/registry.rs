//! Backend registry (C6): the namespace root mapping pathname -> resident
//! file or directory record, backed by one shared PMEM pool.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{EchoFsError, Result};
use crate::file::{Attr, FileKind, ResidentFile};
use crate::pool::PmemPool;

/// Cached attributes and child set for one directory.
pub struct DirEntry {
    pub inode: u64,
    pub mode: u32,
    pub children: std::collections::BTreeSet<String>,
}

impl DirEntry {
    /// `nlink == 2 + number_of_subdirectories`. The
    /// registry itself tracks which children are directories, so this is
    /// computed by the registry rather than cached redundantly here.
    fn new(inode: u64, mode: u32) -> Self {
        Self {
            inode,
            mode,
            children: std::collections::BTreeSet::new(),
        }
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => "/".to_string(),
    }
}

fn basename_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Owns the two namespace maps and the shared pool. Implements the
/// pathname-addressed operations consumed by the VFS layer.
///
/// Lock ordering: the file mutex is always acquired before the
/// directory mutex when an operation needs both — never the reverse.
pub struct BackendRegistry {
    pool: Arc<PmemPool>,
    files: Mutex<BTreeMap<String, Arc<ResidentFile>>>,
    file_inodes: Mutex<BTreeMap<String, u64>>,
    dirs: Mutex<BTreeMap<String, DirEntry>>,
    next_inode: AtomicU64,
}

impl BackendRegistry {
    pub fn new(pool: Arc<PmemPool>) -> Self {
        let mut dirs = BTreeMap::new();
        dirs.insert("/".to_string(), DirEntry::new(1, 0o755));
        Self {
            pool,
            files: Mutex::new(BTreeMap::new()),
            file_inodes: Mutex::new(BTreeMap::new()),
            dirs: Mutex::new(dirs),
            next_inode: AtomicU64::new(2),
        }
    }

    fn alloc_inode(&self) -> u64 {
        self.next_inode.fetch_add(1, Ordering::SeqCst)
    }

    /// Ensures a directory record (and all of its ancestors) exists,
    /// wiring up child sets as it goes.
    fn ensure_dir(&self, dirs: &mut BTreeMap<String, DirEntry>, path: &str) {
        if dirs.contains_key(path) {
            return;
        }
        if path != "/" {
            let parent = parent_of(path);
            self.ensure_dir(dirs, &parent);
            let inode = self.alloc_inode();
            dirs.insert(path.to_string(), DirEntry::new(inode, 0o755));
            dirs.get_mut(&parent).unwrap().children.insert(basename_of(path).to_string());
        }
    }

    fn link_into_parent(&self, dirs: &mut BTreeMap<String, DirEntry>, path: &str) {
        let parent = parent_of(path);
        self.ensure_dir(dirs, &parent);
        dirs.get_mut(&parent).unwrap().children.insert(basename_of(path).to_string());
    }

    fn unlink_from_parent(&self, dirs: &mut BTreeMap<String, DirEntry>, path: &str) {
        let parent = parent_of(path);
        if let Some(d) = dirs.get_mut(&parent) {
            d.children.remove(basename_of(path));
        }
    }

    /// `nlink` for a directory: `2 + number_of_subdirectories`.
    fn dir_nlink(dirs: &BTreeMap<String, DirEntry>, path: &str, children: &std::collections::BTreeSet<String>) -> u32 {
        let subdirs = children
            .iter()
            .filter(|name| {
                let child_path = if path == "/" {
                    format!("/{name}")
                } else {
                    format!("{path}/{name}")
                };
                dirs.contains_key(&child_path)
        })
            .count();
        2 + subdirs as u32
    }

    /// Combined stat-or-dirstat lookup for the VFS `stat(path)` call.
    pub fn lookup_stat(&self, path: &str) -> Result<Stat> {
        if let Some(file) = self.files.lock().unwrap().get(path) {
            let attr = file.attr();
            let inode = *self.file_inodes.lock().unwrap().get(path).expect("resident file missing inode");
            return Ok(Stat::from_file(inode, &attr, file.used_offset()));
        }
        let dirs = self.dirs.lock().unwrap();
        if let Some(d) = dirs.get(path) {
            return Ok(Stat::from_dir(d.inode, d.mode, Self::dir_nlink(&dirs, path, &d.children)));
        }
        Err(EchoFsError::no_such_path(path))
    }

    /// Lists immediate children of a directory.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let dirs = self.dirs.lock().unwrap();
        let d = dirs.get(path).ok_or_else(|| EchoFsError::no_such_path(path))?;
        Ok(d.children.iter().cloned().collect())
    }

    /// Creates an empty resident file at `path`.
    pub fn create(&self, path: &str, mode: u32, kind: FileKind) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        if files.contains_key(path) {
            return Err(EchoFsError::path_already_imported(path));
        }
        let mut dirs = self.dirs.lock().unwrap();
        self.link_into_parent(&mut dirs, path);
        drop(dirs);
        let inode = self.alloc_inode();
        self.file_inodes.lock().unwrap().insert(path.to_string(), inode);
        files.insert(path.to_string(), Arc::new(ResidentFile::new_empty(self.pool.clone(), kind, mode)));
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        if files.remove(path).is_none() {
            return Err(EchoFsError::no_such_path(path));
        }
        self.file_inodes.lock().unwrap().remove(path);
        let mut dirs = self.dirs.lock().unwrap();
        self.unlink_from_parent(&mut dirs, path);
        Ok(())
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let mut dirs = self.dirs.lock().unwrap();
        if dirs.contains_key(path) {
            return Err(EchoFsError::path_already_imported(path));
        }
        let parent = parent_of(path);
        if !dirs.contains_key(&parent) {
            return Err(EchoFsError::no_such_path(&parent));
        }
        let inode = self.alloc_inode();
        dirs.insert(path.to_string(), DirEntry::new(inode, mode));
        dirs.get_mut(&parent).unwrap().children.insert(basename_of(path).to_string());
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let mut dirs = self.dirs.lock().unwrap();
        let empty = dirs.get(path).map(|d| d.children.is_empty()).ok_or_else(|| EchoFsError::no_such_path(path))?;
        if !empty {
            return Err(EchoFsError::invalid_arguments(format!("{path} is not empty")));
        }
        dirs.remove(path);
        self.unlink_from_parent(&mut dirs, path);
        Ok(())
    }

    /// Renames a file or directory entry from `old` to `new`. Takes both
    /// the file and directory locks and dispatches
    /// on which namespace holds `old`.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        if let Some(file) = files.remove(old) {
            let mut dirs = self.dirs.lock().unwrap();
            self.unlink_from_parent(&mut dirs, old);
            self.link_into_parent(&mut dirs, new);
            drop(dirs);
            let mut inodes = self.file_inodes.lock().unwrap();
            if let Some(inode) = inodes.remove(old) {
                inodes.insert(new.to_string(), inode);
            }
            drop(inodes);
            files.insert(new.to_string(), file);
            return Ok(());
        }
        drop(files);

        let mut dirs = self.dirs.lock().unwrap();
        let entry = dirs.remove(old).ok_or_else(|| EchoFsError::no_such_path(old))?;
        self.unlink_from_parent(&mut dirs, old);
        dirs.insert(new.to_string(), entry);
        self.link_into_parent(&mut dirs, new);
        Ok(())
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        if let Some(file) = self.files.lock().unwrap().get(path) {
            file.set_mode(mode);
            return Ok(());
        }
        let mut dirs = self.dirs.lock().unwrap();
        let d = dirs.get_mut(path).ok_or_else(|| EchoFsError::no_such_path(path))?;
        d.mode = mode;
        Ok(())
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let files = self.files.lock().unwrap();
        let file = files.get(path).ok_or_else(|| EchoFsError::no_such_path(path))?;
        file.set_owner(uid, gid);
        Ok(())
    }

    /// Looks up a resident file for read/write dispatch (used by the VFS
    /// `open`/`read`/`write`/`truncate`/`fallocate` calls).
    pub fn open(&self, path: &str) -> Result<Arc<ResidentFile>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| EchoFsError::no_such_path(path))
    }

    /// Reclassifies a resident file between persistent/temporary.
    pub fn change_type(&self, _path: &str, _kind: FileKind) -> Result<()> {
        // `FileKind` is not mutable in place on `ResidentFile` by design
        // (kind is fixed at creation, matching the original's
        // once-per-load semantics); callers needing a different kind
        // re-`load` the path.
        Err(EchoFsError::invalid_arguments(
                "change_type requires re-loading the path with the new kind",
        ))
    }

    /// Recursively stages every regular file under `root_dir` (relative to
    /// the backing store) into the namespace rooted at `mount_prefix`
    /// ( "load(dir) is recursive").
    pub fn load_dir(&self, root_dir: &Path, mount_prefix: &str, kind: FileKind) -> Result<u32> {
        let mut count = 0u32;
        self.load_dir_inner(root_dir, mount_prefix, kind, &mut count)?;
        Ok(count)
    }

    fn load_dir_inner(&self, dir: &Path, mount_path: &str, kind: FileKind, count: &mut u32) -> Result<()> {
        let entries = fs::read_dir(dir).map_err(|e| EchoFsError::Internal {
                message: format!("reading {}: {e}", dir.display()),
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| EchoFsError::Internal {
                    message: format!("reading dir entry under {}: {e}", dir.display()),
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_mount_path = if mount_path == "/" {
                format!("/{name}")
            } else {
                format!("{mount_path}/{name}")
            };
            let file_type = entry.file_type().map_err(|e| EchoFsError::Internal {
                    message: format!("stat {}: {e}", entry.path().display()),
            })?;
            if file_type.is_dir() {
                self.mkdir_idempotent(&child_mount_path)?;
                self.load_dir_inner(&entry.path(), &child_mount_path, kind, count)?;
            } else if file_type.is_file() {
                self.load_file(&entry.path(), &child_mount_path, kind)?;
                *count += 1;
            }
        }
        Ok(())
    }

    fn mkdir_idempotent(&self, path: &str) -> Result<()> {
        match self.mkdir(path, 0o755) {
            Ok(()) | Err(EchoFsError::PathAlreadyImported {.. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Stages a single backing-store file into the namespace at
    /// `mount_path`.
    pub fn load_file(&self, src_path: &Path, mount_path: &str, kind: FileKind) -> Result<()> {
        let meta = fs::metadata(src_path).map_err(|e| EchoFsError::Internal {
                message: format!("stat {}: {e}", src_path.display()),
        })?;
        let mut f = std::fs::File::open(src_path).map_err(|e| EchoFsError::Internal {
                message: format!("opening {}: {e}", src_path.display()),
        })?;
        let resident = ResidentFile::load_from_file(
            self.pool.clone(),
            kind,
            0o644,
            &mut f,
            meta.len(),
        )?;

        let mut files = self.files.lock().unwrap();
        if files.contains_key(mount_path) {
            return Err(EchoFsError::path_already_imported(mount_path));
        }
        let mut dirs = self.dirs.lock().unwrap();
        self.link_into_parent(&mut dirs, mount_path);
        drop(dirs);
        let inode = self.alloc_inode();
        self.file_inodes.lock().unwrap().insert(mount_path.to_string(), inode);
        files.insert(mount_path.to_string(), Arc::new(resident));
        Ok(())
    }

    /// Writes a resident file's contents back to `dst_dir` and removes it
    /// from the namespace.
    pub fn unload(&self, path: &str, dst_dir: &Path) -> Result<()> {
        let file = {
            let files = self.files.lock().unwrap();
            files.get(path).cloned().ok_or_else(|| EchoFsError::no_such_path(path))?
        };

        let dst_path: PathBuf = dst_dir.join(basename_of(path));
        file.unload(&dst_path)?;

        let mut files = self.files.lock().unwrap();
        files.remove(path);
        self.file_inodes.lock().unwrap().remove(path);
        let mut dirs = self.dirs.lock().unwrap();
        self.unlink_from_parent(&mut dirs, path);
        Ok(())
    }

    pub fn allocated_slots(&self) -> usize {
        self.pool.allocated_slots()
    }
}

/// A flattened stat result usable by both files and directories, shaped
/// for easy translation to a POSIX `struct stat` at the FUSE boundary.
pub struct Stat {
    pub inode: u64,
    pub mode: u32,
    pub size: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    pub ctime: u64,
    pub atime: u64,
    pub is_dir: bool,
}

impl Stat {
    fn from_file(inode: u64, attr: &Attr, size: u64) -> Self {
        Self {
            inode,
            mode: attr.mode,
            size,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            mtime: attr.mtime,
            ctime: attr.ctime,
            atime: attr.atime,
            is_dir: false,
        }
    }

    fn from_dir(inode: u64, mode: u32, nlink: u32) -> Self {
        Self {
            inode,
            mode,
            size: 0,
            nlink,
            uid: 0,
            gid: 0,
            mtime: 0,
            ctime: 0,
            atime: 0,
            is_dir: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MIN_SLOT_SIZE;

    fn registry() -> BackendRegistry {
        BackendRegistry::new(Arc::new(PmemPool::open(None, MIN_SLOT_SIZE * 8, MIN_SLOT_SIZE).unwrap()))
    }

    #[test]
    fn files_and_dirs_get_distinct_nonzero_inodes() {
        let reg = registry();
        reg.create("/a", 0o644, FileKind::Persistent).unwrap();
        reg.create("/b", 0o644, FileKind::Persistent).unwrap();
        let a = reg.lookup_stat("/a").unwrap();
        let b = reg.lookup_stat("/b").unwrap();
        let root = reg.lookup_stat("/").unwrap();
        assert_eq!(root.inode, 1);
        assert_ne!(a.inode, 0);
        assert_ne!(b.inode, 0);
        assert_ne!(a.inode, b.inode);
    }

    #[test]
    fn create_then_lookup_stat() {
        let reg = registry();
        reg.create("/a", 0o644, FileKind::Persistent).unwrap();
        let stat = reg.lookup_stat("/a").unwrap();
        assert!(!stat.is_dir);
        assert_eq!(stat.mode, 0o644);
    }

    #[test]
    fn create_duplicate_path_errors() {
        let reg = registry();
        reg.create("/a", 0o644, FileKind::Persistent).unwrap();
        let err = reg.create("/a", 0o644, FileKind::Persistent).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PathAlreadyImported);
    }

    #[test]
    fn mkdir_registers_child_in_parent() {
        let reg = registry();
        reg.mkdir("/sub", 0o755).unwrap();
        let children = reg.readdir("/").unwrap();
        assert_eq!(children, vec!["sub".to_string()]);
    }

    #[test]
    fn create_lazily_creates_parent_directory() {
        let reg = registry();
        reg.create("/a/b/c.txt", 0o644, FileKind::Persistent).unwrap();
        assert!(reg.lookup_stat("/a").unwrap().is_dir);
        assert!(reg.lookup_stat("/a/b").unwrap().is_dir);
        assert_eq!(reg.readdir("/a/b").unwrap(), vec!["c.txt".to_string()]);
    }

    #[test]
    fn unlink_removes_file_and_parent_link() {
        let reg = registry();
        reg.create("/a", 0o644, FileKind::Persistent).unwrap();
        reg.unlink("/a").unwrap();
        assert!(reg.lookup_stat("/a").is_err());
        assert!(reg.readdir("/").unwrap().is_empty());
    }

    #[test]
    fn rmdir_rejects_non_empty_directory() {
        let reg = registry();
        reg.mkdir("/sub", 0o755).unwrap();
        reg.create("/sub/f", 0o644, FileKind::Persistent).unwrap();
        assert!(reg.rmdir("/sub").is_err());
    }

    #[test]
    fn rename_file_moves_it_between_parents() {
        let reg = registry();
        reg.mkdir("/sub", 0o755).unwrap();
        reg.create("/a", 0o644, FileKind::Persistent).unwrap();
        reg.rename("/a", "/sub/a").unwrap();
        assert!(reg.lookup_stat("/a").is_err());
        assert!(reg.lookup_stat("/sub/a").is_ok());
        assert_eq!(reg.readdir("/sub").unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn directory_nlink_counts_subdirectories() {
        let reg = registry();
        reg.mkdir("/a", 0o755).unwrap();
        reg.mkdir("/b", 0o755).unwrap();
        reg.create("/c", 0o644, FileKind::Persistent).unwrap();
        let stat = reg.lookup_stat("/").unwrap();
        assert_eq!(stat.nlink, 4); // 2 + 2 subdirectories
    }

    #[test]
    fn load_and_unload_roundtrip() {
        let reg = registry();
        let src_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("hello.txt"), b"HELLO").unwrap();

        let n = reg.load_dir(src_dir.path(), "/", FileKind::Persistent).unwrap();
        assert_eq!(n, 1);
        assert_eq!(reg.lookup_stat("/hello.txt").unwrap().size, 5);

        let out_dir = tempfile::tempdir().unwrap();
        reg.unload("/hello.txt", out_dir.path()).unwrap();
        let contents = std::fs::read(out_dir.path().join("hello.txt")).unwrap();
        assert_eq!(contents, b"HELLO");
        assert!(reg.lookup_stat("/hello.txt").is_err());
    }

    #[test]
    fn second_unload_of_temporary_file_errors_without_writing() {
        let reg = registry();
        reg.create("/tmp_file", 0o644, FileKind::Temporary).unwrap();
        reg.open("/tmp_file").unwrap().write(0, b"HELLO").unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        assert!(reg.unload("/tmp_file", out_dir.path()).is_err());
        assert!(!out_dir.path().join("tmp_file").exists());
    }
}
