//! Sessions and tree connections.

use crate::auth::SigningKey;
use crate::config::{ShareConfig, UserConfig};
use crate::error::{Error, Result};
use crate::server::file::{close_file, FileTable};
use crate::server::mft::MasterFileTable;
use crate::server::pipes::PipeKind;
use crate::vfs::Vfs;
use std::collections::HashMap;
use std::sync::Arc;

/// One mount of a share by a session
#[derive(Debug, Clone)]
pub struct TreeConnection {
    /// Tree id unique within the process
    pub tid: u16,
    /// The share this tree mounts
    pub share: Arc<ShareConfig>,
    /// Share policy combined with the per-user lists
    pub writable: bool,
    /// Adapter rooted at the share path; `None` for IPC$
    pub vfs: Option<Arc<Vfs>>,
}

impl TreeConnection {
    /// Whether this tree is the pipe share.
    pub fn is_pipe(&self) -> bool {
        self.vfs.is_none()
    }

    /// The adapter, or an error for pipe trees.
    pub fn vfs(&self) -> Result<&Arc<Vfs>> {
        self.vfs
            .as_ref()
            .ok_or_else(|| Error::InvalidState("data operation on the IPC$ tree".to_string()))
    }
}

/// One authenticated user on a connection
pub struct Session {
    /// UID echoed in request headers
    pub uid: u16,
    /// The authenticated account
    pub user: Arc<UserConfig>,
    /// Per-session open-handle table
    pub files: FileTable,
    /// Tree connections by TID
    pub trees: HashMap<u16, TreeConnection>,
    /// Open named pipes: FID to pipe kind
    pub pipes: HashMap<u16, PipeKind>,
    /// MAC key once signing is active
    pub signing: Option<SigningKey>,
    /// Signing sequence counter
    pub sequence: u32,
}

impl Session {
    /// Create a session for an authenticated user.
    pub fn new(uid: u16, user: Arc<UserConfig>) -> Self {
        Self {
            uid,
            user,
            files: FileTable::new(),
            trees: HashMap::new(),
            pipes: HashMap::new(),
            signing: None,
            sequence: 0,
        }
    }

    /// The tree for a TID.
    pub fn tree(&self, tid: u16) -> Result<&TreeConnection> {
        self.trees
            .get(&tid)
            .ok_or_else(|| Error::InvalidState(format!("no tree connection {}", tid)))
    }

    /// Register a new tree connection.
    pub fn connect_tree(&mut self, tree: TreeConnection) {
        self.trees.insert(tree.tid, tree);
    }

    /// Remove a tree, closing every open handle that belongs to it.
    pub async fn disconnect_tree(&mut self, tid: u16, mft: &MasterFileTable) -> Result<()> {
        let tree = self
            .trees
            .remove(&tid)
            .ok_or_else(|| Error::InvalidState(format!("no tree connection {}", tid)))?;
        tree.share.release_conn();

        for (fid, file) in self.files.entries() {
            if file.tid == tid {
                if let Err(e) = close_file(&self.files, mft, fid).await {
                    tracing::warn!(fid, "close during tree disconnect failed: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Tear down every tree and open handle of the session.
    pub async fn teardown(&mut self, mft: &MasterFileTable) {
        for (fid, _) in self.files.entries() {
            if let Err(e) = close_file(&self.files, mft, fid).await {
                tracing::warn!(fid, "close during session teardown failed: {}", e);
            }
        }
        for (_, tree) in self.trees.drain() {
            tree.share.release_conn();
        }
        self.pipes.clear();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uid", &self.uid)
            .field("user", &self.user.name)
            .field("trees", &self.trees.len())
            .field("open_files", &self.files.len())
            .finish()
    }
}

/// Global session index kept for enumeration and diagnostics
#[derive(Debug, Default)]
pub struct SessionIndex {
    entries: std::sync::Mutex<HashMap<u16, SessionInfo>>,
}

/// Snapshot row of the global session list
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub uid: u16,
    pub user: String,
    pub peer: String,
}

impl SessionIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session at setup.
    pub fn insert(&self, info: SessionInfo) {
        if let Ok(mut map) = self.entries.lock() {
            map.insert(info.uid, info);
        }
    }

    /// Drop a session at logoff or connection teardown.
    pub fn remove(&self, uid: u16) {
        if let Ok(mut map) = self.entries.lock() {
            map.remove(&uid);
        }
    }

    /// Snapshot of all live sessions.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.entries
            .lock()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShareConfig;

    fn session() -> Session {
        Session::new(1, Arc::new(UserConfig::new("alice", "pw", 1000, 1000)))
    }

    #[test]
    fn test_tree_lookup() {
        let mut sess = session();
        let share = Arc::new(ShareConfig::new("s", "/tmp"));
        share.acquire_conn();
        sess.connect_tree(TreeConnection {
            tid: 3,
            share,
            writable: true,
            vfs: None,
        });
        assert!(sess.tree(3).is_ok());
        assert!(sess.tree(4).is_err());
    }

    #[tokio::test]
    async fn test_disconnect_releases_share_slot() {
        let mut sess = session();
        let share = Arc::new(ShareConfig::new("s", "/tmp"));
        share.acquire_conn();
        assert_eq!(share.conn_count(), 1);
        sess.connect_tree(TreeConnection {
            tid: 3,
            share: Arc::clone(&share),
            writable: false,
            vfs: None,
        });

        let mft = MasterFileTable::new();
        sess.disconnect_tree(3, &mft).await.unwrap();
        assert_eq!(share.conn_count(), 0);
        assert!(sess.tree(3).is_err());
    }

    #[test]
    fn test_session_index() {
        let index = SessionIndex::new();
        index.insert(SessionInfo {
            uid: 1,
            user: "alice".to_string(),
            peer: "10.0.0.1".to_string(),
        });
        assert_eq!(index.list().len(), 1);
        index.remove(1);
        assert!(index.list().is_empty());
    }
}
