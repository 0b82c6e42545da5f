//! SMB1/CIFS file server in Rust
//!
//! A userspace CIFS server speaking the NT LM 0.12 dialect over TCP:
//! dialect negotiation, NTLM/NTLMv2 session setup, tree connects with
//! per-share host and user access control, file and directory operations
//! including TRANSACTION2 info levels and multi-call directory searches,
//! byte-range locks, xattr-backed alternate data streams and durable
//! handle reconnect bookkeeping.

#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod error;
pub mod netbios;
pub mod protocol;
pub mod security;
pub mod server;
pub mod transport;
pub mod vfs;

#[cfg(test)]
mod e2e_tests;

pub use error::{Error, NtStatus, Result};
