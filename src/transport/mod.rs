//! Transport abstraction for framed SMB messages.

pub mod tcp;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub use tcp::TcpTransport;

/// A bidirectional transport carrying RFC1002-framed SMB messages.
#[async_trait]
pub trait SmbTransport: Send {
    /// Send one complete SMB message (framing added by the transport).
    async fn send_message(&mut self, data: Bytes) -> Result<()>;

    /// Receive one complete SMB message (framing stripped).
    async fn receive_message(&mut self) -> Result<Vec<u8>>;

    /// Close the transport.
    async fn close(&mut self) -> Result<()>;
}
