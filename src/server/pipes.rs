//! Named-pipe service boundary.
//!
//! DCE/RPC endpoints (SRVSVC, WKSSVC, WINREG, LANMAN) are served outside
//! the core. The dispatcher wraps each pipe operation in a typed envelope,
//! queues it to the service and awaits the reply buffer, honoring
//! cancellation.

use crate::error::{Error, Result};
use tokio::sync::{mpsc, oneshot};

/// The pipe endpoints a session can open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeKind {
    Srvsvc,
    Wkssvc,
    Winreg,
    Lanman,
}

impl PipeKind {
    /// Map a pipe path from NT_CREATE/OPEN to its endpoint.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim_start_matches('\\').to_ascii_lowercase();
        match name.as_str() {
            "srvsvc" => Some(PipeKind::Srvsvc),
            "wkssvc" => Some(PipeKind::Wkssvc),
            "winreg" => Some(PipeKind::Winreg),
            "lanman" => Some(PipeKind::Lanman),
            _ => None,
        }
    }
}

/// Operations in a pipe envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOp {
    Open,
    Write,
    Read,
    Transact,
    Close,
}

/// One queued message to the pipe service
#[derive(Debug)]
pub struct PipeEnvelope {
    pub kind: PipeKind,
    pub op: PipeOp,
    /// Session UID the request executes under
    pub uid: u16,
    pub payload: Vec<u8>,
    /// Reply channel; dropped to signal service failure
    pub reply: oneshot::Sender<Result<Vec<u8>>>,
}

/// Handle to the external pipe service
#[derive(Debug, Clone)]
pub struct PipeService {
    tx: mpsc::Sender<PipeEnvelope>,
}

impl PipeService {
    /// Wrap a service queue.
    pub fn new(tx: mpsc::Sender<PipeEnvelope>) -> Self {
        Self { tx }
    }

    /// A service that answers every request with an empty buffer, for
    /// deployments without an RPC backend.
    pub fn spawn_null() -> Self {
        let (tx, mut rx) = mpsc::channel::<PipeEnvelope>(32);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let _ = envelope.reply.send(Ok(Vec::new()));
            }
        });
        Self { tx }
    }

    /// Queue one envelope and await the reply buffer.
    pub async fn call(
        &self,
        kind: PipeKind,
        op: PipeOp,
        uid: u16,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = PipeEnvelope {
            kind,
            op,
            uid,
            payload,
            reply: reply_tx,
        };
        self.tx
            .send(envelope)
            .await
            .map_err(|_| Error::PipeError("pipe service unavailable".to_string()))?;
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::PipeError("pipe service dropped request".to_string())),
        }
    }
}
