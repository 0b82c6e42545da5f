//! CIFS server: shared state and the accept loop.

pub mod connection;
pub mod enumeration;
pub mod fidtable;
pub mod file;
pub mod mft;
pub mod oplock;
pub mod pipes;
pub mod session;
pub mod share;
pub mod trans2;

use crate::config::{GlobalConfig, ShareCatalog, ShareConfig, UserCatalog, UserConfig};
use crate::error::Result;
use crate::security::{IdMapper, UnixIdMapper};
use crate::server::file::DurableTable;
use crate::server::mft::MasterFileTable;
use crate::server::oplock::{NoopOplocks, OplockBroker};
use crate::server::pipes::PipeService;
use crate::server::session::SessionIndex;
use crate::transport::{SmbTransport, TcpTransport};
use bytes::Bytes;
use connection::Connection;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Process-wide server state shared by every connection
pub struct CifsServer {
    /// Global settings
    pub config: GlobalConfig,
    /// Exported shares
    pub shares: ShareCatalog,
    /// Configured accounts
    pub users: UserCatalog,
    /// Per-inode open coordination
    pub mft: MasterFileTable,
    /// Durable-handle records, process lifetime
    pub durables: DurableTable,
    /// Global session list for enumeration
    pub sessions: SessionIndex,
    /// Oplock coordination collaborator
    pub oplocks: Arc<dyn OplockBroker>,
    /// DCE/RPC pipe service collaborator
    pub pipes: PipeService,
    /// Identity-mapping oracle
    pub idmap: Arc<dyn IdMapper>,
    next_uid: AtomicU16,
    next_tid: AtomicU16,
}

impl CifsServer {
    /// Assemble a server over the given catalogs with default
    /// collaborators (no oplocks, null pipe service, Unix id mapping).
    pub fn new(
        config: GlobalConfig,
        shares: Vec<ShareConfig>,
        users: Vec<UserConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            shares: ShareCatalog::new(shares),
            users: UserCatalog::new(users),
            mft: MasterFileTable::new(),
            durables: DurableTable::new(),
            sessions: SessionIndex::new(),
            oplocks: Arc::new(NoopOplocks),
            pipes: PipeService::spawn_null(),
            idmap: Arc::new(UnixIdMapper),
            next_uid: AtomicU16::new(1),
            next_tid: AtomicU16::new(1),
        })
    }

    /// Mint a session UID.
    pub fn mint_uid(&self) -> u16 {
        self.next_uid.fetch_add(1, Ordering::SeqCst).max(1)
    }

    /// Mint a process-wide tree id.
    pub fn mint_tid(&self) -> u16 {
        self.next_tid.fetch_add(1, Ordering::SeqCst).max(1)
    }

    /// Listen and serve until the listener fails.
    pub async fn run(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("CIFS server listening on {}", addr);
        info!("server string: {}", self.config.server_string);
        info!("workgroup: {}", self.config.workgroup);

        let use_netbios = addr.port() == 139;

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            info!("new connection from {}", remote_addr);
            let server = Arc::clone(self);

            tokio::spawn(async move {
                let mut transport = TcpTransport::from_stream(stream);

                if use_netbios {
                    if let Err(e) = transport.accept_netbios_session().await {
                        error!("NetBIOS session setup failed: {}", e);
                        return;
                    }
                }

                let conn = Arc::new(Connection::new(server, remote_addr.ip().to_string()));
                if let Err(e) = serve_connection(conn, transport).await {
                    debug!("connection from {} ended: {}", remote_addr, e);
                }
                debug!("connection from {} closed", remote_addr);
            });
        }
    }

    /// Listen on the direct-TCP SMB port.
    pub async fn run_standard(self: &Arc<Self>) -> Result<()> {
        self.run(SocketAddr::from(([0, 0, 0, 0], 445))).await
    }
}

/// Drive one connection: one reader loop pulls framed requests, each is
/// dispatched and its responses written back in order. Clients correlate
/// by MID, so responses of a multi-response command stay contiguous.
async fn serve_connection(conn: Arc<Connection>, mut transport: TcpTransport) -> Result<()> {
    let result = loop {
        let frame = match transport.receive_message().await {
            Ok(frame) => frame,
            Err(e) => break e,
        };
        let mut failed = None;
        for response in conn.process(&frame).await {
            if let Err(e) = transport.send_message(Bytes::from(response)).await {
                failed = Some(e);
                break;
            }
        }
        if let Some(e) = failed {
            break e;
        }
    };

    conn.teardown().await;
    let _ = transport.close().await;

    match result {
        crate::error::Error::ConnectionClosed => Ok(()),
        other => Err(other),
    }
}
