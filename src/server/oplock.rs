//! Opportunistic-lock collaborator boundary.
//!
//! Break coordination lives outside the core; handlers call through this
//! trait before conflicting operations. The default broker grants nothing
//! and breaks nothing.

use crate::server::mft::InodeKey;
use async_trait::async_trait;

/// Oplock levels a broker may grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OplockLevel {
    None,
    Level2,
    Exclusive,
    Batch,
}

/// External oplock coordination service
#[async_trait]
pub trait OplockBroker: Send + Sync {
    /// Ask for an oplock on an inode; the granted level may be lower than
    /// requested.
    async fn grant(&self, key: InodeKey, requested: OplockLevel) -> OplockLevel;

    /// Break an existing oplock down to `level`, waiting for the holder's
    /// acknowledgement.
    async fn break_to_level(&self, key: InodeKey, level: OplockLevel);

    /// Break every level-II oplock on an inode. Invoked before any write
    /// reaches the filesystem.
    async fn break_all_level2(&self, key: InodeKey);

    /// Release bookkeeping for a closing handle.
    async fn release(&self, key: InodeKey);
}

/// Broker that never grants an oplock
#[derive(Debug, Default)]
pub struct NoopOplocks;

#[async_trait]
impl OplockBroker for NoopOplocks {
    async fn grant(&self, _key: InodeKey, _requested: OplockLevel) -> OplockLevel {
        OplockLevel::None
    }

    async fn break_to_level(&self, _key: InodeKey, _level: OplockLevel) {}

    async fn break_all_level2(&self, _key: InodeKey) {}

    async fn release(&self, _key: InodeKey) {}
}
