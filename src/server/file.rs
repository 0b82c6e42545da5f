//! Per-open file state, safe handle teardown and the durable-handle table.
//!
//! A `SmbFile` is one open handle. Lookup hands out `FileRef` guards that
//! pin the open against teardown; close marks the state `Freeing` (hiding
//! the handle from further lookups) and waits for the guard count to reach
//! zero before the open is destroyed.

use crate::error::{Error, Result};
use crate::protocol::constants::AccessMask;
use crate::server::enumeration::DirCursor;
use crate::server::fidtable::FidTable;
use crate::server::mft::{MasterFile, MasterFileTable, MasterFlags};
use crate::vfs::{UnixStat, Vfs};
use std::fs;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Bound on the wait for in-flight users during teardown
const FREEING_WAIT: Duration = Duration::from_secs(10);

/// Handle lifecycle tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpState {
    /// Created, not yet published
    New,
    /// Published and servable
    Ready,
    /// Being torn down; never served
    Freeing,
}

/// Alternate-data-stream binding of an open
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Full xattr name, prefix included
    pub xattr_name: String,
    /// Stream name as the client spelled it
    pub name: String,
}

/// One byte range locked by a handle, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteLock {
    pub start: u64,
    pub end: u64,
    pub exclusive: bool,
    /// PID quoted by the locking request, echoed on unlock
    pub pid: u16,
}

impl ByteLock {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start <= end && start <= self.end
    }
}

/// One open handle
pub struct SmbFile {
    /// Volatile FID within the owning session
    pub fid: u16,
    /// Tree the open belongs to
    pub tid: u16,
    /// Granted rights
    pub access: AccessMask,
    /// Open names a directory
    pub is_directory: bool,
    /// Open came through NT_CREATE (full NT semantics)
    pub is_nt_open: bool,
    /// Alternate-data-stream binding, if any
    pub stream: Option<StreamInfo>,
    /// Adapter for the share the open lives on
    pub vfs: Arc<Vfs>,
    /// Per-inode rendezvous record
    pub master: Arc<MasterFile>,
    /// Host descriptor
    pub file: fs::File,
    /// Byte-range locks held by this handle
    pub locks: Mutex<Vec<ByteLock>>,
    /// Directory enumeration cursor
    pub dir_cursor: Mutex<Option<DirCursor>>,
    path: Mutex<PathBuf>,
    state: Mutex<FpState>,
    persistent: Mutex<Option<u64>>,
    users: AtomicU32,
    released: Notify,
}

impl std::fmt::Debug for SmbFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbFile")
            .field("fid", &self.fid)
            .field("tid", &self.tid)
            .field("is_directory", &self.is_directory)
            .field("state", &*lock(&self.state))
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Construction parameters for an open
pub struct OpenParams {
    pub fid: u16,
    pub tid: u16,
    pub access: AccessMask,
    pub is_directory: bool,
    pub is_nt_open: bool,
    pub stream: Option<StreamInfo>,
    pub path: PathBuf,
    pub file: fs::File,
}

impl SmbFile {
    /// Build an open in the `New` state.
    pub fn new(params: OpenParams, vfs: Arc<Vfs>, master: Arc<MasterFile>) -> Arc<Self> {
        Arc::new(Self {
            fid: params.fid,
            tid: params.tid,
            access: params.access,
            is_directory: params.is_directory,
            is_nt_open: params.is_nt_open,
            stream: params.stream,
            vfs,
            master,
            file: params.file,
            locks: Mutex::new(Vec::new()),
            dir_cursor: Mutex::new(None),
            path: Mutex::new(params.path),
            state: Mutex::new(FpState::New),
            persistent: Mutex::new(None),
            users: AtomicU32::new(0),
            released: Notify::new(),
        })
    }

    /// Persistent id of a durable handle.
    pub fn persistent_id(&self) -> Option<u64> {
        *lock(&self.persistent)
    }

    /// Mark the handle durable under `id`.
    pub fn set_persistent_id(&self, id: u64) {
        *lock(&self.persistent) = Some(id);
    }

    /// Whether the open is durable.
    pub fn is_durable(&self) -> bool {
        self.persistent_id().is_some()
    }

    /// Current host path of the handle.
    pub fn path(&self) -> PathBuf {
        lock(&self.path).clone()
    }

    /// Record a rename of the underlying object.
    pub fn set_path(&self, new: PathBuf) {
        *lock(&self.path) = new;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FpState {
        *lock(&self.state)
    }

    fn set_state(&self, next: FpState) {
        *lock(&self.state) = next;
    }

    /// Number of live `FileRef` guards.
    pub fn user_count(&self) -> u32 {
        self.users.load(Ordering::SeqCst)
    }

    /// Check a data operation on `[start, end]` against locks held by other
    /// handles of the same inode.
    pub fn check_lock_range(self: &Arc<Self>, start: u64, end: u64, is_write: bool) -> Result<()> {
        for other in self.master.live_opens() {
            if Arc::ptr_eq(&other, self) {
                continue;
            }
            let locks = lock(&other.locks);
            for l in locks.iter() {
                if l.overlaps(start, end) && (l.exclusive || is_write) {
                    return Err(Error::LockConflict);
                }
            }
        }
        Ok(())
    }

    /// Check whether a new byte-range lock can be granted.
    pub fn check_lock_grant(self: &Arc<Self>, candidate: &ByteLock) -> Result<()> {
        for other in self.master.live_opens() {
            let same_handle = Arc::ptr_eq(&other, self);
            let locks = lock(&other.locks);
            for l in locks.iter() {
                if !l.overlaps(candidate.start, candidate.end) {
                    continue;
                }
                if same_handle {
                    continue;
                }
                if l.exclusive || candidate.exclusive {
                    return Err(Error::LockConflict);
                }
            }
        }
        Ok(())
    }

    /// Add a granted lock to this handle.
    pub fn add_lock(&self, l: ByteLock) {
        lock(&self.locks).push(l);
    }

    /// Remove a lock matching the unlock range; absent ranges error.
    pub fn remove_lock(&self, start: u64, end: u64, pid: u16) -> Result<()> {
        let mut locks = lock(&self.locks);
        match locks
            .iter()
            .position(|l| l.start == start && l.end == end && l.pid == pid)
        {
            Some(idx) => {
                locks.remove(idx);
                Ok(())
            }
            None => Err(Error::InvalidParameter(format!(
                "no lock at [{}, {}]",
                start, end
            ))),
        }
    }
}

/// RAII guard pinning an open against teardown
pub struct FileRef {
    file: Arc<SmbFile>,
}

impl FileRef {
    fn new(file: Arc<SmbFile>) -> Self {
        file.users.fetch_add(1, Ordering::SeqCst);
        Self { file }
    }

    /// The underlying shared open.
    pub fn inner(&self) -> &Arc<SmbFile> {
        &self.file
    }
}

impl Deref for FileRef {
    type Target = SmbFile;

    fn deref(&self) -> &SmbFile {
        &self.file
    }
}

impl Drop for FileRef {
    fn drop(&mut self) {
        if self.file.users.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.file.released.notify_waiters();
        }
    }
}

/// Session-scoped FID table over `SmbFile` payloads
#[derive(Default)]
pub struct FileTable {
    table: FidTable<SmbFile>,
}

impl FileTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a FID for an open about to be installed.
    pub fn allocate_fid(&self) -> Result<u16> {
        self.table.allocate()
    }

    /// Roll back an allocated FID that never got an open bound.
    pub fn abandon_fid(&self, fid: u16) {
        self.table.release(fid);
    }

    /// Publish an open under its FID and mark it servable.
    pub fn install(&self, file: Arc<SmbFile>) -> Result<()> {
        let fid = file.fid;
        self.table.bind(fid, Arc::clone(&file))?;
        file.set_state(FpState::Ready);
        Ok(())
    }

    /// Look up a FID, pinning the open. Handles in teardown are invisible.
    pub fn get(&self, fid: u16) -> Option<FileRef> {
        let file = self.table.lookup(fid)?;
        if file.state() == FpState::Freeing {
            return None;
        }
        Some(FileRef::new(file))
    }

    /// Begin teardown: flip the state to `Freeing` so no new lookups
    /// succeed, returning the open for the closer to finish with.
    pub fn begin_close(&self, fid: u16) -> Result<Arc<SmbFile>> {
        let file = self
            .table
            .lookup(fid)
            .ok_or(Error::InvalidHandle(fid as u64))?;
        if file.state() == FpState::Freeing {
            return Err(Error::InvalidHandle(fid as u64));
        }
        file.set_state(FpState::Freeing);
        Ok(file)
    }

    /// Unbind the slot and wait for in-flight users to drain, bounded.
    /// Expiry of the bound is a programming error, reported not panicked.
    pub async fn remove_wait(&self, fid: u16) -> Result<Arc<SmbFile>> {
        let file = self
            .table
            .unbind(fid)
            .ok_or(Error::InvalidHandle(fid as u64))?;
        self.table.release(fid);

        let deadline = tokio::time::Instant::now() + FREEING_WAIT;
        while file.user_count() > 0 {
            let notified = file.released.notified();
            if file.user_count() == 0 {
                break;
            }
            match tokio::time::timeout_at(deadline, notified).await {
                Ok(()) => {}
                Err(_) => {
                    return Err(Error::Internal(format!(
                        "fid {} still has {} users after teardown wait",
                        fid,
                        file.user_count()
                    )));
                }
            }
        }
        Ok(file)
    }

    /// Snapshot of live opens.
    pub fn entries(&self) -> Vec<(u16, Arc<SmbFile>)> {
        self.table.entries()
    }

    /// Number of live opens.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether any open is live.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Close one open: hide it, drop its locks, honor stream delete-on-close,
/// detach from the master and release the inode reference.
pub async fn close_file(files: &FileTable, mft: &MasterFileTable, fid: u16) -> Result<()> {
    let file = files.begin_close(fid)?;

    lock(&file.locks).clear();

    if let Some(stream) = &file.stream {
        if file
            .master
            .flags()
            .contains(MasterFlags::DELETE_ON_CLOSE_STREAM)
        {
            file.master
                .clear_flags(MasterFlags::DELETE_ON_CLOSE_STREAM);
            let path = file.path();
            if let Err(e) = file.vfs.remove_xattr(&path, &stream.xattr_name) {
                tracing::warn!("stream delete-on-close failed for {}: {}", stream.xattr_name, e);
            }
        }
    }

    file.master.detach(&file);
    let file = files.remove_wait(fid).await?;
    mft.release(&file.master, &file.vfs)?;
    Ok(())
}

/// Stat snapshot kept in a durable record
pub type StatSnapshot = UnixStat;

/// Compare a durable snapshot against the current inode state.
pub fn stat_matches(durable: &StatSnapshot, current: &StatSnapshot) -> bool {
    durable.ino == current.ino
        && durable.dev == current.dev
        && durable.mode == current.mode
        && durable.nlink == current.nlink
        && durable.uid == current.uid
        && durable.gid == current.gid
        && durable.rdev == current.rdev
        && durable.size == current.size
        && durable.atime == current.atime
        && durable.mtime == current.mtime
        && durable.ctime == current.ctime
        && durable.blksize == current.blksize
        && durable.blocks == current.blocks
}

/// Persistent-handle index entry
#[derive(Debug)]
pub struct DurableRecord {
    /// UID of the owning session
    pub sess_uid: Mutex<u16>,
    /// Volatile FID bound at last update
    pub volatile_fid: Mutex<u16>,
    /// Inode stat at the last disconnect
    pub stat: Mutex<StatSnapshot>,
    refcount: AtomicU32,
}

/// Process-wide durable-handle table, parallel to the per-session FID
/// tables. Durability is scoped to the process lifetime.
#[derive(Default)]
pub struct DurableTable {
    table: FidTable<DurableRecord>,
}

impl DurableTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a durable open, returning its persistent id.
    pub fn open(&self, sess_uid: u16, volatile_fid: u16, stat: StatSnapshot) -> Result<u64> {
        let id = self.table.allocate()?;
        let record = Arc::new(DurableRecord {
            sess_uid: Mutex::new(sess_uid),
            volatile_fid: Mutex::new(volatile_fid),
            stat: Mutex::new(stat),
            refcount: AtomicU32::new(1),
        });
        if let Err(e) = self.table.bind(id, record) {
            self.table.release(id);
            return Err(e);
        }
        Ok(id as u64)
    }

    /// Fetch a durable record by persistent id.
    pub fn get(&self, id: u64) -> Option<Arc<DurableRecord>> {
        u16::try_from(id).ok().and_then(|id| self.table.lookup(id))
    }

    /// Refresh a record after a reconnect rebinds it.
    pub fn update(&self, id: u64, sess_uid: u16, volatile_fid: u16, stat: StatSnapshot) {
        if let Some(record) = self.get(id) {
            *lock(&record.sess_uid) = sess_uid;
            *lock(&record.volatile_fid) = volatile_fid;
            *lock(&record.stat) = stat;
            record.refcount.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Snapshot the stat at disconnect so a reconnect can validate it.
    pub fn disconnect(&self, id: u64, stat: StatSnapshot) {
        if let Some(record) = self.get(id) {
            *lock(&record.stat) = stat;
        }
    }

    /// Validate a reconnect against the stored stat; any mismatch destroys
    /// the record.
    pub fn reconnect(&self, id: u64, current: &StatSnapshot) -> Result<Arc<DurableRecord>> {
        let record = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("persistent id {}", id)))?;
        let matches = stat_matches(&lock(&record.stat), current);
        if !matches {
            tracing::warn!("durable reconnect {} stat mismatch, invalidating", id);
            self.close(id)?;
            return Err(Error::NotFound(format!("persistent id {} stale", id)));
        }
        Ok(record)
    }

    /// Drop one reference to a persistent id, freeing it at zero.
    pub fn close(&self, id: u64) -> Result<()> {
        let idx = u16::try_from(id)
            .map_err(|_| Error::InvalidParameter(format!("persistent id {}", id)))?;
        if let Some(record) = self.table.lookup(idx) {
            if record.refcount.fetch_sub(1, Ordering::SeqCst) > 1 {
                return Ok(());
            }
        }
        self.table.unbind(idx);
        self.table.release(idx);
        Ok(())
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
