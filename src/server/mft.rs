//! Master-file table: per-inode coordination of concurrent opens.
//!
//! One record exists per live inode, keyed by `(device, inode)` so the
//! relation survives renames. Delete-on-close is a master-level flag acted
//! on when the last open releases the record.

use crate::error::Result;
use crate::server::file::SmbFile;
use crate::vfs::Vfs;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

bitflags::bitflags! {
    /// Master-level flags shared by every open of the inode
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MasterFlags: u32 {
        /// Unlink the path when the last open goes away
        const DELETE_ON_CLOSE = 0x01;
        /// Remove the stream xattr when the opening handle closes
        const DELETE_ON_CLOSE_STREAM = 0x02;
    }
}

/// Key identifying an inode across renames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeKey {
    pub dev: u64,
    pub ino: u64,
}

/// Per-inode rendezvous record
#[derive(Debug)]
pub struct MasterFile {
    /// Identity of the backing inode
    pub key: InodeKey,
    /// Refcount of live opens
    count: AtomicU32,
    /// Flags applied across handles
    flags: Mutex<MasterFlags>,
    /// Back-edges to the opens referencing this inode
    opens: Mutex<Vec<Weak<SmbFile>>>,
    /// Current host path, updated on rename
    path: Mutex<PathBuf>,
}

impl MasterFile {
    fn new(key: InodeKey, path: PathBuf) -> Self {
        Self {
            key,
            count: AtomicU32::new(1),
            flags: Mutex::new(MasterFlags::empty()),
            opens: Mutex::new(Vec::new()),
            path: Mutex::new(path),
        }
    }

    /// Current refcount of live opens.
    pub fn open_count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Read the flag set.
    pub fn flags(&self) -> MasterFlags {
        *lock(&self.flags)
    }

    /// Set flags on the inode.
    pub fn set_flags(&self, add: MasterFlags) {
        lock(&self.flags).insert(add);
    }

    /// Clear flags on the inode.
    pub fn clear_flags(&self, remove: MasterFlags) {
        lock(&self.flags).remove(remove);
    }

    /// Current host path of the inode.
    pub fn path(&self) -> PathBuf {
        lock(&self.path).clone()
    }

    /// Record a rename of the inode.
    pub fn set_path(&self, new: PathBuf) {
        *lock(&self.path) = new;
    }

    /// Attach an open to this master.
    pub fn attach(&self, file: &Arc<SmbFile>) {
        lock(&self.opens).push(Arc::downgrade(file));
    }

    /// Detach an open, pruning dead back-edges.
    pub fn detach(&self, file: &Arc<SmbFile>) {
        let mut opens = lock(&self.opens);
        opens.retain(|w| match w.upgrade() {
            Some(fp) => !Arc::ptr_eq(&fp, file),
            None => false,
        });
    }

    /// Snapshot the live opens of this inode.
    pub fn live_opens(&self) -> Vec<Arc<SmbFile>> {
        lock(&self.opens).iter().filter_map(Weak::upgrade).collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Process-wide table of master files
#[derive(Debug, Default)]
pub struct MasterFileTable {
    map: Mutex<HashMap<InodeKey, Arc<MasterFile>>>,
}

impl MasterFileTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the master for `key`, creating it on first open. The
    /// refcount covers the caller's open either way.
    pub fn lookup_or_insert(&self, key: InodeKey, path: PathBuf) -> Arc<MasterFile> {
        let mut map = lock(&self.map);
        match map.get(&key) {
            Some(master) => {
                master.count.fetch_add(1, Ordering::SeqCst);
                Arc::clone(master)
            }
            None => {
                let master = Arc::new(MasterFile::new(key, path));
                map.insert(key, Arc::clone(&master));
                master
            }
        }
    }

    /// Existing master for `key`, without taking a reference.
    pub fn get(&self, key: InodeKey) -> Option<Arc<MasterFile>> {
        lock(&self.map).get(&key).cloned()
    }

    /// Drop one open's reference. At zero the record is removed and, if
    /// delete-on-close is set, the backing path unlinked first.
    pub fn release(&self, master: &Arc<MasterFile>, vfs: &Vfs) -> Result<()> {
        if master.count.fetch_sub(1, Ordering::SeqCst) != 1 {
            return Ok(());
        }

        let mut unlink_err = None;
        if master.flags().contains(MasterFlags::DELETE_ON_CLOSE) {
            master.clear_flags(MasterFlags::DELETE_ON_CLOSE);
            let path = master.path();
            if let Err(e) = vfs.remove(&path) {
                tracing::warn!("delete-on-close unlink of {:?} failed: {}", path, e);
                unlink_err = Some(e);
            }
        }

        lock(&self.map).remove(&master.key);
        match unlink_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether any live open exists under `dir` (refusing directory
    /// renames over open children).
    pub fn has_open_under(&self, dir: &std::path::Path) -> bool {
        let map = lock(&self.map);
        map.values().any(|m| {
            let p = m.path();
            p != dir && p.starts_with(dir)
        })
    }

    /// Number of live masters, for diagnostics.
    pub fn len(&self) -> usize {
        lock(&self.map).len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        lock(&self.map).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Vfs, MasterFileTable) {
        let dir = TempDir::new().unwrap();
        let vfs = Vfs::new(dir.path(), false).unwrap();
        (dir, vfs, MasterFileTable::new())
    }

    #[test]
    fn test_one_master_per_inode() {
        let (dir, _vfs, mft) = setup();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();

        let key = InodeKey { dev: 1, ino: 42 };
        let m1 = mft.lookup_or_insert(key, path.clone());
        let m2 = mft.lookup_or_insert(key, path);
        assert!(Arc::ptr_eq(&m1, &m2));
        assert_eq!(m1.open_count(), 2);
        assert_eq!(mft.len(), 1);
    }

    #[test]
    fn test_release_removes_at_zero() {
        let (dir, vfs, mft) = setup();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();

        let key = InodeKey { dev: 1, ino: 1 };
        let m = mft.lookup_or_insert(key, path.clone());
        let m2 = mft.lookup_or_insert(key, path.clone());

        mft.release(&m, &vfs).unwrap();
        assert_eq!(mft.len(), 1);
        mft.release(&m2, &vfs).unwrap();
        assert_eq!(mft.len(), 0);
        // No delete-on-close: the file survives
        assert!(path.exists());
    }

    #[test]
    fn test_delete_on_close_unlinks_at_last_release() {
        let (dir, vfs, mft) = setup();
        let path = dir.path().join("doomed");
        std::fs::write(&path, b"x").unwrap();

        let key = InodeKey { dev: 1, ino: 2 };
        let m1 = mft.lookup_or_insert(key, path.clone());
        let m2 = mft.lookup_or_insert(key, path.clone());
        m1.set_flags(MasterFlags::DELETE_ON_CLOSE);

        mft.release(&m1, &vfs).unwrap();
        assert!(path.exists(), "file must survive first close");
        mft.release(&m2, &vfs).unwrap();
        assert!(!path.exists(), "file unlinked at refcount zero");
    }

    #[test]
    fn test_rename_updates_path() {
        let (dir, vfs, mft) = setup();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"x").unwrap();

        let key = InodeKey { dev: 1, ino: 3 };
        let m = mft.lookup_or_insert(key, a.clone());
        m.set_flags(MasterFlags::DELETE_ON_CLOSE);

        std::fs::rename(&a, &b).unwrap();
        m.set_path(b.clone());
        mft.release(&m, &vfs).unwrap();
        assert!(!b.exists(), "delete-on-close follows the rename");
    }

    #[test]
    fn test_has_open_under() {
        let (dir, _vfs, mft) = setup();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let child = sub.join("f");
        std::fs::write(&child, b"x").unwrap();

        let key = InodeKey { dev: 1, ino: 4 };
        let _m = mft.lookup_or_insert(key, child);
        assert!(mft.has_open_under(&sub));
        assert!(!mft.has_open_under(&dir.path().join("other")));
    }
}
