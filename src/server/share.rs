//! Share resolution: tree name to share reference plus write capability.

use crate::config::{ShareCatalog, ShareConfig, UserConfig};
use crate::error::{Error, Result};
use std::sync::Arc;

/// Resolve a requested tree name for a peer and user.
///
/// Applies the host allow/deny lists and the per-user access lists, and
/// computes the session's write capability on the share. Write-list
/// membership overrides read-list membership: explicit grants win.
pub fn resolve_share(
    catalog: &ShareCatalog,
    peer_ip: &str,
    user: &UserConfig,
    share_name: &str,
) -> Result<(Arc<ShareConfig>, bool)> {
    let share = catalog
        .find(share_name)
        .ok_or_else(|| Error::NotFound(format!("share {}", share_name)))?;

    if !share.available {
        return Err(Error::NotFound(format!("share {} not available", share_name)));
    }

    if !host_allowed(&share, peer_ip) {
        return Err(Error::AccessDenied(format!(
            "host {} not allowed on {}",
            peer_ip, share.name
        )));
    }

    let writable = user_access(&share, user)?;
    Ok((share, writable))
}

/// Host filter: allow-list membership wins, deny-list membership refuses,
/// absence from both lists falls back to the default allow.
fn host_allowed(share: &ShareConfig, peer_ip: &str) -> bool {
    if share.allow_hosts.is_empty() && share.deny_hosts.is_empty() {
        return true;
    }
    if share.allow_hosts.iter().any(|h| h == peer_ip) {
        return true;
    }
    if share.deny_hosts.iter().any(|h| h == peer_ip) {
        return false;
    }
    // A non-empty allow list without a match refuses unless the deny list
    // alone was configured.
    share.allow_hosts.is_empty()
}

/// User filter returning the computed write capability.
fn user_access(share: &ShareConfig, user: &UserConfig) -> Result<bool> {
    // IPC$ carries no per-user configuration
    if share.is_pipe() {
        return Ok(false);
    }

    if share.guest_ok {
        return Ok(share.writeable());
    }
    if share.guest_only && !user.guest {
        return Err(Error::AccessDenied(format!(
            "share {} accepts guests only",
            share.name
        )));
    }

    if share.invalid_users.iter().any(|u| u == &user.name) {
        return Err(Error::AccessDenied(format!(
            "user {} refused on {}",
            user.name, share.name
        )));
    }

    let mut writable = share.writeable();
    if share.read_list.iter().any(|u| u == &user.name) {
        writable = false;
    }
    if share.write_list.iter().any(|u| u == &user.name) {
        writable = true;
    }

    if !share.valid_users.is_empty() && !share.valid_users.iter().any(|u| u == &user.name) {
        return Err(Error::AccessDenied(format!(
            "user {} not in valid users of {}",
            user.name, share.name
        )));
    }

    Ok(writable)
}
