//! Server configuration: shares, users and global settings.
//!
//! The catalog is read-mostly: it is built before the listener starts and
//! shared immutably with every connection. Reloading is out of scope.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Name of the inter-process-communication pipe share.
pub const IPC_SHARE_NAME: &str = "IPC$";

/// Message-signing policy for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigningPolicy {
    /// Never sign
    Disabled,
    /// Offer signing, let the client decide
    #[default]
    Auto,
    /// Refuse unsigned sessions
    Mandatory,
}

/// Protocol dialects the listener will negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolLevel {
    /// SMB1, "NT LM 0.12"
    NtLm012,
    /// SMB2 family (handled by a separate layer)
    Smb2,
}

/// Global server settings
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Account used when a client is mapped to guest
    pub guest_account: String,
    /// Free-form server description string
    pub server_string: String,
    /// Workgroup / domain advertised to clients
    pub workgroup: String,
    /// NetBIOS machine name
    pub netbios_name: String,
    /// Signing policy
    pub signing: SigningPolicy,
    /// Map unknown users to the guest account
    pub map_to_guest: bool,
    /// Lowest dialect the server will accept
    pub min_protocol: ProtocolLevel,
    /// Highest dialect the server will accept
    pub max_protocol: ProtocolLevel,
    /// Retry failed path lookups with a case-insensitive component scan
    pub caseless_search: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            guest_account: "nobody".to_string(),
            server_string: "Rust CIFS Server".to_string(),
            workgroup: "WORKGROUP".to_string(),
            netbios_name: "RUST-CIFS".to_string(),
            signing: SigningPolicy::Auto,
            map_to_guest: false,
            min_protocol: ProtocolLevel::NtLm012,
            max_protocol: ProtocolLevel::NtLm012,
            caseless_search: true,
        }
    }
}

/// One exported share
#[derive(Debug)]
pub struct ShareConfig {
    /// Share name as presented in tree connects
    pub name: String,
    /// Absolute host directory; `None` for IPC$
    pub path: Option<PathBuf>,
    /// Free-form comment
    pub comment: String,
    /// Hosts explicitly allowed; empty means no allow filter
    pub allow_hosts: Vec<String>,
    /// Hosts explicitly denied
    pub deny_hosts: Vec<String>,
    /// Users allowed to connect; empty means everyone
    pub valid_users: Vec<String>,
    /// Users refused outright
    pub invalid_users: Vec<String>,
    /// Users forced read-only
    pub read_list: Vec<String>,
    /// Users granted write regardless of read_list
    pub write_list: Vec<String>,
    /// Share currently exported
    pub available: bool,
    /// Share appears in browse lists
    pub browsable: bool,
    /// Guest logins accepted
    pub guest_ok: bool,
    /// Only guest logins accepted
    pub guest_only: bool,
    /// Oplocks may be granted on this share
    pub oplocks: bool,
    /// DOS attributes / creation time kept in xattrs
    pub store_dos_attr: bool,
    /// Share exported read-only
    pub read_only: bool,
    /// Writes permitted when not read-only
    pub write_ok: bool,
    /// Maximum simultaneous tree connects; 0 = unlimited
    pub max_connections: u32,
    /// Live tree-connect count
    conn_count: AtomicU32,
}

impl ShareConfig {
    /// Create a disk share rooted at `path` with default policy.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: Some(path.into()),
            comment: String::new(),
            allow_hosts: Vec::new(),
            deny_hosts: Vec::new(),
            valid_users: Vec::new(),
            invalid_users: Vec::new(),
            read_list: Vec::new(),
            write_list: Vec::new(),
            available: true,
            browsable: true,
            guest_ok: false,
            guest_only: false,
            oplocks: true,
            store_dos_attr: false,
            read_only: false,
            write_ok: true,
            max_connections: 0,
            conn_count: AtomicU32::new(0),
        }
    }

    /// The built-in IPC$ share backing named-pipe traffic.
    pub fn ipc() -> Self {
        let mut share = Self::new(IPC_SHARE_NAME, PathBuf::new());
        share.path = None;
        share.comment = "IPC service".to_string();
        share.guest_ok = true;
        share.browsable = false;
        share
    }

    /// Whether this share is the IPC pipe share.
    pub fn is_pipe(&self) -> bool {
        self.path.is_none()
    }

    /// Effective default writability before per-user lists apply.
    pub fn writeable(&self) -> bool {
        self.write_ok && !self.read_only
    }

    /// Take a connection slot; fails when max_connections is reached.
    pub fn acquire_conn(&self) -> bool {
        if self.max_connections == 0 {
            self.conn_count.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        let mut cur = self.conn_count.load(Ordering::SeqCst);
        loop {
            if cur >= self.max_connections {
                return false;
            }
            match self.conn_count.compare_exchange(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Release a connection slot taken by `acquire_conn`.
    pub fn release_conn(&self) {
        let prev = self.conn_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    /// Current tree-connect count.
    pub fn conn_count(&self) -> u32 {
        self.conn_count.load(Ordering::SeqCst)
    }
}

/// One configured account
#[derive(Debug, Clone)]
pub struct UserConfig {
    /// Account name
    pub name: String,
    /// Plaintext password the NTLM hashes derive from
    pub password: String,
    /// Unix uid the account maps to
    pub uid: u32,
    /// Unix gid the account maps to
    pub gid: u32,
    /// Guest account: skips password verification
    pub guest: bool,
}

impl UserConfig {
    /// Create a regular account.
    pub fn new(name: impl Into<String>, password: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            uid,
            gid,
            guest: false,
        }
    }

    /// Create a guest account with no password.
    pub fn guest(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: String::new(),
            uid: 65534,
            gid: 65534,
            guest: true,
        }
    }
}

/// Read-mostly share catalog
#[derive(Debug, Default)]
pub struct ShareCatalog {
    shares: Vec<Arc<ShareConfig>>,
}

impl ShareCatalog {
    /// Build a catalog; an IPC$ entry is added if the caller did not.
    pub fn new(mut shares: Vec<ShareConfig>) -> Self {
        if !shares.iter().any(|s| s.name.eq_ignore_ascii_case(IPC_SHARE_NAME)) {
            shares.push(ShareConfig::ipc());
        }
        Self {
            shares: shares.into_iter().map(Arc::new).collect(),
        }
    }

    /// Case-insensitive lookup by share name.
    pub fn find(&self, name: &str) -> Option<Arc<ShareConfig>> {
        self.shares
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// All shares, for enumeration interfaces.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ShareConfig>> {
        self.shares.iter()
    }

    /// Number of configured shares.
    pub fn len(&self) -> usize {
        self.shares.len()
    }

    /// True when only the implicit IPC$ entry exists.
    pub fn is_empty(&self) -> bool {
        self.shares.len() <= 1
    }
}

/// Read-mostly account catalog
#[derive(Debug, Default)]
pub struct UserCatalog {
    users: Vec<Arc<UserConfig>>,
}

impl UserCatalog {
    /// Build the catalog from configured accounts.
    pub fn new(users: Vec<UserConfig>) -> Self {
        Self {
            users: users.into_iter().map(Arc::new).collect(),
        }
    }

    /// Exact-name account lookup.
    pub fn find(&self, name: &str) -> Option<Arc<UserConfig>> {
        self.users.iter().find(|u| u.name == name).cloned()
    }

    /// The configured guest account, if any.
    pub fn guest(&self) -> Option<Arc<UserConfig>> {
        self.users.iter().find(|u| u.guest).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lookup_is_case_insensitive() {
        let catalog = ShareCatalog::new(vec![ShareConfig::new("Public", "/srv/public")]);
        assert!(catalog.find("PUBLIC").is_some());
        assert!(catalog.find("public").is_some());
        assert!(catalog.find("other").is_none());
    }

    #[test]
    fn test_ipc_share_is_implicit() {
        let catalog = ShareCatalog::new(vec![]);
        let ipc = catalog.find("ipc$").unwrap();
        assert!(ipc.is_pipe());
        assert!(ipc.guest_ok);
    }

    #[test]
    fn test_writeable_follows_flags() {
        let mut share = ShareConfig::new("s", "/tmp");
        assert!(share.writeable());
        share.read_only = true;
        assert!(!share.writeable());
        share.read_only = false;
        share.write_ok = false;
        assert!(!share.writeable());
    }

    #[test]
    fn test_max_connections_enforced() {
        let mut share = ShareConfig::new("s", "/tmp");
        share.max_connections = 2;
        assert!(share.acquire_conn());
        assert!(share.acquire_conn());
        assert!(!share.acquire_conn());
        share.release_conn();
        assert!(share.acquire_conn());
    }
}
