//! Per-connection request dispatcher for the SMB1 command set.
//!
//! One `Connection` exists per TCP peer. `process` consumes one framed
//! request and produces zero or more framed responses: zero when signing
//! verification fails or the request was cancelled, more than one for
//! multi-response ECHO. AndX chains are walked iteratively, each chained
//! block appended to the same reply with its offset patched.

use crate::auth::{self, SigningKey};
use crate::config::SigningPolicy;
use crate::error::{Error, NtStatus, Result};
use crate::protocol::codec;
use crate::protocol::constants::{
    self, command, create_action, create_options, disposition, lock_type, negotiate,
    security_mode, AccessMask, Capabilities, FileAttributes, HeaderFlags2, CRYPTO_KEY_SIZE,
    LARGE_RSP_BUF_SIZE, NTLM_AUTH_RESPONSE_SIZE, NO_MORE_ANDX_COMMAND, SMALL_RSP_BUF_SIZE,
    SMB_HEADER_SIZE, SMB_SUPPORT_SEARCH_BITS,
};
use crate::protocol::header::{AndX, ReplyBuf, Request, SmbHeader};
use crate::server::file::{close_file, ByteLock, OpenParams, SmbFile, StreamInfo};
use crate::server::mft::{InodeKey, MasterFlags};
use crate::server::oplock::OplockLevel;
use crate::server::pipes::{PipeKind, PipeOp};
use crate::server::session::{Session, SessionInfo, TreeConnection};
use crate::server::share::resolve_share;
use crate::server::trans2;
use crate::server::CifsServer;
use crate::vfs::{OpenDisp, Vfs};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Result of one command handler inside an AndX chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chained {
    /// Chain ends here
    Done,
    /// Re-enter routing at the chained block
    Next { cmd: u8, offset: usize },
}

/// Connection protocol phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    NeedNegotiate,
    NeedSessionSetup,
    Active,
    Exiting,
}

/// An in-flight request, registered for NT_CANCEL lookup by MID
#[derive(Debug)]
pub struct PendingRequest {
    pub mid: u16,
    pub cancelled: Arc<AtomicBool>,
}

/// Per-request control handed to handlers
pub struct ReqCtl {
    /// Set by NT_CANCEL; blocking waits poll it
    pub cancelled: Arc<AtomicBool>,
    /// Extra framed responses beyond the primary one (multi-response ECHO)
    pub extra: Vec<Vec<u8>>,
}

/// Mutable per-connection state
pub struct ConnState {
    pub status: ConnStatus,
    /// Challenge sent in the negotiate response
    pub challenge: [u8; 8],
    /// Signing offered by policy at negotiate
    pub sign_enabled: bool,
    /// At most one active session under SMB1 (multiplex count is 1)
    pub session: Option<Session>,
    /// In-flight request count, drained before teardown
    pub requests_running: u32,
    /// Requests eligible for cancellation
    pub pending: Vec<PendingRequest>,
}

/// One TCP peer
pub struct Connection {
    pub(crate) server: Arc<CifsServer>,
    pub(crate) state: Mutex<ConnState>,
    peer: String,
}

fn no_session() -> Error {
    Error::AccessDenied("no authenticated session".to_string())
}

impl Connection {
    /// Create connection state for a peer address.
    pub fn new(server: Arc<CifsServer>, peer: String) -> Self {
        Self {
            server,
            state: Mutex::new(ConnState {
                status: ConnStatus::NeedNegotiate,
                challenge: [0u8; 8],
                sign_enabled: false,
                session: None,
                requests_running: 0,
                pending: Vec::new(),
            }),
            peer,
        }
    }

    /// Tear down the connection: snapshot durable handles, close all
    /// session state and drop the global registration.
    pub async fn teardown(&self) {
        let mut st = self.state.lock().await;
        st.status = ConnStatus::Exiting;
        if let Some(mut session) = st.session.take() {
            for (_, file) in session.files.entries() {
                if let Some(pid) = file.persistent_id() {
                    if let Ok(stat) = file.vfs.fstat(&file.file) {
                        self.server.durables.disconnect(pid, stat);
                    }
                }
            }
            session.teardown(&self.server.mft).await;
            self.server.sessions.remove(session.uid);
        }
    }

    /// Process one framed SMB request into zero or more framed responses.
    pub async fn process(&self, frame: &[u8]) -> Vec<Vec<u8>> {
        let req = match Request::new(frame) {
            Ok(r) => r,
            Err(e) => {
                debug!("dropping malformed frame: {}", e);
                return Vec::new();
            }
        };
        let hdr = match req.header() {
            Ok(h) => h,
            Err(e) => {
                debug!("dropping frame with bad header: {}", e);
                return Vec::new();
            }
        };
        trace!(cmd = hdr.command, mid = hdr.mid, "request");

        // Signing verification; mismatches are silently dropped.
        let mut response_seq = None;
        if hdr.flags2.contains(HeaderFlags2::SECURITY_SIGNATURE)
            && hdr.command != command::SESSION_SETUP_ANDX
        {
            let mut st = self.state.lock().await;
            if let Some(sess) = st.session.as_mut() {
                if let Some(key) = sess.signing.clone() {
                    let seq = sess.sequence;
                    if key.verify(seq, frame).is_err() {
                        warn!(mid = hdr.mid, "request MAC mismatch, dropping");
                        return Vec::new();
                    }
                    response_seq = Some(seq + 1);
                    sess.sequence += 2;
                }
            }
        }

        let mut ctl = ReqCtl {
            cancelled: Arc::new(AtomicBool::new(false)),
            extra: Vec::new(),
        };

        {
            let mut st = self.state.lock().await;
            st.requests_running += 1;
            if hdr.command != command::NT_CANCEL {
                st.pending.push(PendingRequest {
                    mid: hdr.mid,
                    cancelled: Arc::clone(&ctl.cancelled),
                });
            }
        }

        let mut reply = ReplyBuf::new(&hdr, response_capacity(hdr.command));

        // AndX chain walk
        let mut cmd = hdr.command;
        let mut block = SMB_HEADER_SIZE;
        loop {
            match self.dispatch(cmd, &req, &hdr, block, &mut reply, &mut ctl).await {
                Ok(Chained::Done) => break,
                Ok(Chained::Next { cmd: next, offset }) => {
                    if next == NO_MORE_ANDX_COMMAND {
                        break;
                    }
                    if offset <= SMB_HEADER_SIZE || offset >= frame.len() {
                        reply.set_status(NtStatus::InvalidParameter);
                        break;
                    }
                    reply.patch_andx_to_here();
                    cmd = next;
                    block = offset;
                }
                Err(e) => {
                    debug!(cmd, "command failed: {}", e);
                    reply.set_status(e.status());
                    if reply.is_empty() {
                        reply.block(&[], &[]);
                    }
                    break;
                }
            }
        }

        let cancelled = ctl.cancelled.load(Ordering::SeqCst);
        {
            let mut st = self.state.lock().await;
            st.requests_running -= 1;
            st.pending.retain(|p| !Arc::ptr_eq(&p.cancelled, &ctl.cancelled));
            if cancelled {
                // The response slot goes unsent; keep signing in step.
                if let Some(sess) = st.session.as_mut() {
                    if sess.signing.is_some() {
                        sess.sequence = sess.sequence.saturating_sub(1);
                    }
                }
            }
        }

        if cancelled || reply.is_suppressed() {
            return Vec::new();
        }

        let mut responses = Vec::with_capacity(1 + ctl.extra.len());
        let mut primary = reply.into_vec();
        if let Some(seq) = response_seq {
            let key = self.signing_key().await;
            if let Some(key) = &key {
                key.sign(seq, &mut primary);
            }
            responses.push(primary);
            for (i, mut extra) in ctl.extra.into_iter().enumerate() {
                if let Some(key) = &key {
                    key.sign(seq + 1 + i as u32, &mut extra);
                }
                responses.push(extra);
            }
            let extras = responses.len() as u32 - 1;
            if extras > 0 {
                let mut st = self.state.lock().await;
                if let Some(sess) = st.session.as_mut() {
                    sess.sequence += extras;
                }
            }
        } else {
            responses.push(primary);
            responses.extend(ctl.extra);
        }
        responses
    }

    async fn signing_key(&self) -> Option<SigningKey> {
        let st = self.state.lock().await;
        st.session.as_ref().and_then(|s| s.signing.clone())
    }

    async fn dispatch(
        &self,
        cmd: u8,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
        ctl: &mut ReqCtl,
    ) -> Result<Chained> {
        match cmd {
            command::NEGOTIATE => self.cmd_negotiate(req, block, reply).await,
            command::SESSION_SETUP_ANDX => self.cmd_session_setup(req, hdr, block, reply).await,
            command::TREE_CONNECT_ANDX => self.cmd_tree_connect(req, hdr, block, reply).await,
            command::TREE_DISCONNECT => self.cmd_tree_disconnect(hdr, reply).await,
            command::LOGOFF_ANDX => self.cmd_logoff(req, block, reply).await,
            command::NT_CREATE_ANDX => self.cmd_nt_create(req, hdr, block, reply).await,
            command::OPEN_ANDX => self.cmd_open_andx(req, hdr, block, reply).await,
            command::READ_ANDX => self.cmd_read_andx(req, hdr, block, reply).await,
            command::WRITE_ANDX => self.cmd_write_andx(req, hdr, block, reply).await,
            command::WRITE => self.cmd_write(req, hdr, block, reply).await,
            command::FLUSH => self.cmd_flush(req, hdr, block, reply).await,
            command::CLOSE => self.cmd_close(req, hdr, block, reply).await,
            command::LOCKING_ANDX => self.cmd_locking(req, hdr, block, reply, ctl).await,
            command::RENAME => self.cmd_rename(req, hdr, block, reply).await,
            command::NT_RENAME => self.cmd_nt_rename(req, hdr, block, reply).await,
            command::DELETE => self.cmd_delete(req, hdr, block, reply).await,
            command::CREATE_DIRECTORY => self.cmd_mkdir(req, hdr, block, reply).await,
            command::DELETE_DIRECTORY => self.cmd_rmdir(req, hdr, block, reply).await,
            command::CHECK_DIRECTORY => self.cmd_checkdir(req, hdr, block, reply).await,
            command::QUERY_INFORMATION => self.cmd_query_information(req, hdr, block, reply).await,
            command::SET_INFORMATION => self.cmd_setattr(req, hdr, block, reply).await,
            command::ECHO => self.cmd_echo(req, hdr, block, reply, ctl).await,
            command::NT_CANCEL => self.cmd_nt_cancel(hdr, reply).await,
            command::FIND_CLOSE2 => self.cmd_find_close(req, hdr, block, reply).await,
            command::PROCESS_EXIT => {
                reply.block(&[], &[]);
                Ok(Chained::Done)
            }
            command::TRANSACTION => self.cmd_transaction(req, hdr, block, reply).await,
            command::TRANSACTION2 => trans2::handle_trans2(self, req, hdr, block, reply).await,
            other => Err(Error::NotImplemented(format!("command 0x{:02x}", other))),
        }
    }

    // ----- negotiate / session / tree -----

    async fn cmd_negotiate(
        &self,
        req: &Request<'_>,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let data = req.data(block)?;
        let dialects = parse_dialect_list(data)?;
        debug!(?dialects, "negotiate");

        let choice = choose_dialect(&dialects, &self.server.config);
        let index = match choice {
            DialectChoice::NtLm012(index) => index,
            DialectChoice::Smb2(_) => {
                // The SMB2 layer takes over from here; this build carries
                // only the handoff seam.
                return Err(Error::NotImplemented("SMB2 dialect handoff".to_string()));
            }
            DialectChoice::None => {
                reply.set_status(NtStatus::InvalidLogonType);
                reply.block(&negotiate::BAD_DIALECT.to_le_bytes(), &[]);
                return Ok(Chained::Done);
            }
        };

        let challenge = auth::generate_challenge();
        let sign = self.server.config.signing != SigningPolicy::Disabled;
        {
            let mut st = self.state.lock().await;
            if st.status != ConnStatus::NeedNegotiate {
                return Err(Error::InvalidState("negotiate after negotiate".to_string()));
            }
            st.challenge = challenge;
            st.sign_enabled = sign;
            st.status = ConnStatus::NeedSessionSetup;
        }

        let mut security = security_mode::USER_SECURITY | security_mode::ENCRYPT_PASSWORDS;
        if sign {
            security |= security_mode::SIGN_ENABLED;
        }
        if self.server.config.signing == SigningPolicy::Mandatory {
            security |= security_mode::SIGN_REQUIRED;
        }

        let caps = Capabilities::UNICODE
            | Capabilities::LARGE_FILES
            | Capabilities::NT_SMBS
            | Capabilities::STATUS32
            | Capabilities::NT_FIND
            | Capabilities::LEVEL_II_OPLOCKS
            | Capabilities::LARGE_READ_X
            | Capabilities::LARGE_WRITE_X
            | Capabilities::UNIX;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let system_time = codec::unix_to_nt_time(now.as_secs() as i64, now.subsec_nanos());

        let mut words = Vec::with_capacity(34);
        words.write_u16::<LittleEndian>(index)?;
        words.push(security);
        words.write_u16::<LittleEndian>(negotiate::MAX_MPX_COUNT)?;
        words.write_u16::<LittleEndian>(negotiate::MAX_VCS)?;
        words.write_u32::<LittleEndian>(constants::MAX_SMB_BUF_SIZE as u32)?;
        words.write_u32::<LittleEndian>(negotiate::MAX_RAW_SIZE)?;
        words.write_u32::<LittleEndian>(0)?; // SessionKey
        words.write_u32::<LittleEndian>(caps.bits())?;
        words.write_u32::<LittleEndian>((system_time & 0xFFFF_FFFF) as u32)?;
        words.write_u32::<LittleEndian>((system_time >> 32) as u32)?;
        words.write_u16::<LittleEndian>(0)?; // ServerTimeZone
        words.push(CRYPTO_KEY_SIZE as u8);

        reply.block(&words, &challenge);
        Ok(Chained::Done)
    }

    async fn cmd_session_setup(
        &self,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        if w.len() < 26 {
            return Err(Error::Malformed("short session setup".to_string()));
        }
        let andx = AndX::parse(w)?;
        let ci_len = LittleEndian::read_u16(&w[14..16]) as usize;
        let cs_len = LittleEndian::read_u16(&w[16..18]) as usize;

        let data = req.data(block)?;
        if data.len() < ci_len + cs_len {
            return Err(Error::Malformed("password blobs exceed data".to_string()));
        }
        let cs_blob = &data[ci_len..ci_len + cs_len];

        let name_pos = ci_len + cs_len;
        let abs = req.data_start(block)? + name_pos;
        let (account, used) = codec::read_wire_name(data, name_pos, abs, hdr.is_unicode())?;
        let domain = codec::read_wire_name(data, name_pos + used, abs + used, hdr.is_unicode())
            .map(|(d, _)| d)
            .unwrap_or_default();
        debug!(%account, %domain, "session setup");

        let user = match self.server.users.find(&account) {
            Some(user) => user,
            None => {
                if self.server.config.map_to_guest {
                    self.server
                        .users
                        .find(&self.server.config.guest_account)
                        .or_else(|| self.server.users.guest())
                        .ok_or_else(|| {
                            Error::AuthenticationFailed(format!("unknown user {}", account))
                        })?
                } else {
                    return Err(Error::AuthenticationFailed(format!(
                        "unknown user {}",
                        account
                    )));
                }
            }
        };

        let challenge = {
            let st = self.state.lock().await;
            if st.session.is_some() {
                // Max VC count is 1: a second live session is a protocol error.
                return Err(Error::InvalidState("session already established".to_string()));
            }
            st.challenge
        };

        let session_key = if user.guest {
            None
        } else if cs_len == NTLM_AUTH_RESPONSE_SIZE {
            Some(auth::verify_ntlm(&user, &challenge, cs_blob)?)
        } else {
            Some(auth::verify_ntlmv2(&user, &domain, &challenge, cs_blob)?)
        };

        let uid = self.server.mint_uid();
        let mut session = Session::new(uid, Arc::clone(&user));
        {
            let mut st = self.state.lock().await;
            if st.sign_enabled {
                if let Some(key) = session_key {
                    session.signing = Some(SigningKey::new(key));
                    session.sequence = 2;
                }
            }
            st.session = Some(session);
            st.status = ConnStatus::Active;
        }
        self.server.sessions.insert(SessionInfo {
            uid,
            user: user.name.clone(),
            peer: self.peer.clone(),
        });

        let action: u16 = if user.guest { 1 } else { 0 };
        reply.set_uid(uid);
        reply.andx_block(andx.command, &action.to_le_bytes(), &[]);

        if andx.is_terminator() {
            Ok(Chained::Done)
        } else {
            Ok(Chained::Next {
                cmd: andx.command,
                offset: andx.offset as usize,
            })
        }
    }

    async fn cmd_tree_connect(
        &self,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        if w.len() < 8 {
            return Err(Error::Malformed("short tree connect".to_string()));
        }
        let andx = AndX::parse(w)?;
        let password_len = LittleEndian::read_u16(&w[6..8]) as usize;

        let data = req.data(block)?;
        if data.len() < password_len {
            return Err(Error::Malformed("password exceeds data".to_string()));
        }
        let abs = req.data_start(block)? + password_len;
        let (path, _) = codec::read_wire_name(data, password_len, abs, hdr.is_unicode())?;
        let share_name = extract_share_name(&path);
        debug!(%path, %share_name, "tree connect");

        let mut st = self.state.lock().await;
        let sess = st.session.as_mut().ok_or_else(no_session)?;

        let (share, writable) =
            match resolve_share(&self.server.shares, &self.peer, &sess.user, &share_name) {
                Ok(resolved) => resolved,
                Err(Error::NotFound(msg)) => {
                    debug!("tree connect refused: {}", msg);
                    drop(st);
                    reply.set_status(NtStatus::BadNetworkName);
                    reply.block(&[], &[]);
                    return Ok(Chained::Done);
                }
                Err(e) => return Err(e),
            };
        if !share.acquire_conn() {
            return Err(Error::Resource(format!(
                "share {} at max connections",
                share.name
            )));
        }

        let vfs = match &share.path {
            Some(path) => match Vfs::new(path, self.server.config.caseless_search) {
                Ok(vfs) => Some(Arc::new(vfs)),
                Err(e) => {
                    share.release_conn();
                    return Err(e);
                }
            },
            None => None,
        };

        let tid = self.server.mint_tid();
        let service = if vfs.is_none() {
            constants::service::PIPE
        } else {
            constants::service::DISK
        };
        sess.connect_tree(TreeConnection {
            tid,
            share,
            writable,
            vfs,
        });
        drop(st);

        let mut words = Vec::with_capacity(2);
        words.write_u16::<LittleEndian>(SMB_SUPPORT_SEARCH_BITS)?;
        let mut data_out = Vec::new();
        data_out.extend_from_slice(service.as_bytes());
        data_out.push(0);

        reply.set_tid(tid);
        reply.andx_block(andx.command, &words, &data_out);

        if andx.is_terminator() {
            Ok(Chained::Done)
        } else {
            Ok(Chained::Next {
                cmd: andx.command,
                offset: andx.offset as usize,
            })
        }
    }

    async fn cmd_tree_disconnect(&self, hdr: &SmbHeader, reply: &mut ReplyBuf) -> Result<Chained> {
        let mut st = self.state.lock().await;
        let sess = st.session.as_mut().ok_or_else(no_session)?;
        sess.disconnect_tree(hdr.tid, &self.server.mft).await?;
        drop(st);
        reply.block(&[], &[]);
        Ok(Chained::Done)
    }

    async fn cmd_logoff(
        &self,
        req: &Request<'_>,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        let andx = AndX::parse(w)?;

        // Wait until this request is the only one in flight.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let running = self.state.lock().await.requests_running;
            if running <= 1 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("logoff proceeding with {} requests in flight", running);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut st = self.state.lock().await;
        if let Some(mut session) = st.session.take() {
            for (_, file) in session.files.entries() {
                if let Some(pid) = file.persistent_id() {
                    if let Ok(stat) = file.vfs.fstat(&file.file) {
                        self.server.durables.disconnect(pid, stat);
                    }
                }
            }
            session.teardown(&self.server.mft).await;
            self.server.sessions.remove(session.uid);
        }
        st.status = ConnStatus::NeedSessionSetup;
        drop(st);

        reply.andx_block(andx.command, &[], &[]);
        Ok(Chained::Done)
    }

    // ----- open / create -----

    async fn cmd_nt_create(
        &self,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        if w.len() < 48 {
            return Err(Error::Malformed("short NT create".to_string()));
        }
        let andx = AndX::parse(w)?;
        let name_length = LittleEndian::read_u16(&w[5..7]) as usize;
        let create_flags = LittleEndian::read_u32(&w[7..11]);
        let root_fid = LittleEndian::read_u32(&w[11..15]);
        let desired_access =
            AccessMask::from_bits_truncate(LittleEndian::read_u32(&w[15..19]));
        let ext_attrs = LittleEndian::read_u32(&w[27..31]);
        let create_disposition = LittleEndian::read_u32(&w[35..39]);
        let options = LittleEndian::read_u32(&w[39..43]);

        let data = req.data(block)?;
        let abs = req.data_start(block)?;
        let name = read_create_name(data, abs, name_length, hdr.is_unicode())?;
        debug!(%name, create_disposition, options, "nt create");

        let mut st = self.state.lock().await;
        let sess = st.session.as_mut().ok_or_else(no_session)?;
        let tree = sess.tree(hdr.tid)?.clone();

        if tree.is_pipe() {
            let kind = PipeKind::from_name(&name).ok_or_else(|| {
                Error::NotFound(format!("pipe {}", name))
            })?;
            let fid = sess.files.allocate_fid()?;
            sess.pipes.insert(fid, kind);
            drop(st);
            self.server
                .pipes
                .call(kind, PipeOp::Open, hdr.uid, Vec::new())
                .await?;
            let words = nt_create_rsp_words(
                andx.command,
                0,
                fid,
                create_action::OPENED,
                0,
                0,
                FileAttributes::NORMAL.bits(),
                2, // FileType: message-mode pipe
                0x05FF,
                false,
            )?;
            reply.andx_block(andx.command, &words, &[]);
            return chain_or_done(andx);
        }

        let vfs = tree.vfs()?.clone();
        let wire_path = match root_fid {
            0 => name.clone(),
            fid => {
                let dir = sess
                    .files
                    .get(fid as u16)
                    .ok_or(Error::InvalidHandle(fid as u64))?;
                let base = dir.path();
                let rel = codec::wire_path_to_local(&name);
                return_path_under(&vfs, &base, &rel)?
            }
        };

        let want_dir = options & create_options::DIRECTORY_FILE != 0;
        let durable = tree.share.oplocks && create_flags & 0x04 != 0;

        let (file, action, stat) = open_install(
            sess,
            &tree,
            &self.server.mft,
            &vfs,
            &wire_path,
            desired_access,
            create_disposition,
            want_dir,
            true,
        )?;

        if options & create_options::DELETE_ON_CLOSE != 0 {
            if !tree.writable {
                return Err(Error::AccessDenied(format!(
                    "delete-on-close on read-only tree {}",
                    tree.tid
                )));
            }
            if file.stream.is_some() {
                file.master.set_flags(MasterFlags::DELETE_ON_CLOSE_STREAM);
            } else {
                file.master.set_flags(MasterFlags::DELETE_ON_CLOSE);
            }
        }

        if durable && !file.is_directory {
            match self.server.durables.open(sess.uid, file.fid, stat) {
                Ok(pid) => {
                    file.set_persistent_id(pid);
                    debug!(fid = file.fid, pid, "durable open registered");
                }
                Err(e) => warn!("durable registration failed: {}", e),
            }
        }

        let oplock = if tree.share.oplocks && create_flags & 0x06 != 0 {
            let key = InodeKey {
                dev: stat.dev,
                ino: stat.ino,
            };
            self.server.oplocks.grant(key, OplockLevel::Exclusive).await
        } else {
            OplockLevel::None
        };
        drop(st);

        let attrs = if stat.is_dir() {
            FileAttributes::DIRECTORY.bits()
        } else if ext_attrs != 0 {
            ext_attrs
        } else {
            FileAttributes::NORMAL.bits()
        };

        let oplock_level = match oplock {
            OplockLevel::None => 0u8,
            OplockLevel::Level2 => 3,
            OplockLevel::Exclusive => 1,
            OplockLevel::Batch => 2,
        };

        let words = nt_create_rsp_words(
            andx.command,
            oplock_level,
            file.fid,
            action,
            codec::unix_to_nt_time(stat.mtime.0, stat.mtime.1),
            stat.size,
            attrs,
            0, // FileType: disk
            0,
            stat.is_dir(),
        )?;
        reply.andx_block(andx.command, &words, &[]);
        chain_or_done(andx)
    }

    async fn cmd_open_andx(
        &self,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        if w.len() < 30 {
            return Err(Error::Malformed("short open".to_string()));
        }
        let andx = AndX::parse(w)?;
        let access_mode = LittleEndian::read_u16(&w[6..8]);
        let open_function = LittleEndian::read_u16(&w[16..18]);

        let data = req.data(block)?;
        let abs = req.data_start(block)?;
        let (name, _) = codec::read_wire_name(data, 0, abs, hdr.is_unicode())?;
        debug!(%name, access_mode, open_function, "open andx");

        let desired = match access_mode & 0x07 {
            0 => AccessMask::GENERIC_READ,
            1 => AccessMask::GENERIC_WRITE,
            _ => AccessMask::GENERIC_READ | AccessMask::GENERIC_WRITE,
        };

        // OpenFunction to NT disposition
        let create_if_absent = open_function & 0x10 != 0;
        let open_action = open_function & 0x03;
        let disp = match (create_if_absent, open_action) {
            (false, 1) => disposition::OPEN,
            (false, 2) => disposition::OVERWRITE,
            (true, 0) => disposition::CREATE,
            (true, 1) => disposition::OPEN_IF,
            (true, 2) => disposition::OVERWRITE_IF,
            _ => disposition::OPEN,
        };

        let mut st = self.state.lock().await;
        let sess = st.session.as_mut().ok_or_else(no_session)?;
        let tree = sess.tree(hdr.tid)?.clone();
        let vfs = tree.vfs()?.clone();

        let (file, action, stat) = open_install(
            sess,
            &tree,
            &self.server.mft,
            &vfs,
            &name,
            desired,
            disp,
            false,
            false,
        )?;
        drop(st);

        let granted: u16 = if desired.grants_write() { 2 } else { 0 };
        let open_result: u16 = match action {
            create_action::CREATED => 2,
            create_action::OVERWRITTEN => 3,
            _ => 1,
        };

        let mut words = Vec::with_capacity(26);
        words.write_u16::<LittleEndian>(file.fid)?;
        words.write_u16::<LittleEndian>(if stat.is_dir() {
            FileAttributes::DIRECTORY.bits() as u16
        } else {
            FileAttributes::NORMAL.bits() as u16
        })?;
        words.write_u32::<LittleEndian>(stat.mtime.0 as u32)?;
        words.write_u32::<LittleEndian>(stat.size as u32)?;
        words.write_u16::<LittleEndian>(granted)?;
        words.write_u16::<LittleEndian>(0)?; // FileType: disk
        words.write_u16::<LittleEndian>(0)?; // DeviceState
        words.write_u16::<LittleEndian>(open_result)?;
        words.write_u32::<LittleEndian>(file.fid as u32)?; // ServerFid
        words.write_u16::<LittleEndian>(0)?; // Reserved

        reply.andx_block(andx.command, &words, &[]);
        chain_or_done(andx)
    }

    // ----- data path -----

    async fn cmd_read_andx(
        &self,
        req: &Request<'_>,
        _hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        if w.len() < 20 {
            return Err(Error::Malformed("short read".to_string()));
        }
        let andx = AndX::parse(w)?;
        let fid = LittleEndian::read_u16(&w[4..6]);
        let mut offset = LittleEndian::read_u32(&w[6..10]) as u64;
        let max_count = LittleEndian::read_u16(&w[10..12]) as usize;
        if w.len() >= 24 {
            offset |= (LittleEndian::read_u32(&w[20..24]) as u64) << 32;
        }

        let st = self.state.lock().await;
        let sess = st.session.as_ref().ok_or_else(no_session)?;

        if let Some(kind) = sess.pipes.get(&fid).copied() {
            let uid = sess.uid;
            drop(st);
            let data = self
                .server
                .pipes
                .call(kind, PipeOp::Read, uid, max_count.to_le_bytes().to_vec())
                .await?;
            write_read_rsp(reply, andx.command, &data);
            return chain_or_done(andx);
        }

        let file = sess.files.get(fid).ok_or(Error::InvalidHandle(fid as u64))?;
        drop(st);

        if file.is_directory {
            return Err(Error::IsADirectory(format!("fid {}", fid)));
        }
        if !file.access.grants_read() {
            return Err(Error::AccessDenied(format!("no read right on fid {}", fid)));
        }

        let data = match &file.stream {
            Some(stream) => file
                .vfs
                .read_stream(&file.path(), &stream.xattr_name, offset, max_count)?,
            None => {
                if max_count > 0 {
                    file.inner()
                        .check_lock_range(offset, offset + max_count as u64 - 1, false)?;
                }
                file.vfs.read_at(&file.file, offset, max_count)?
            }
        };
        trace!(fid, offset, len = data.len(), "read");

        write_read_rsp(reply, andx.command, &data);
        chain_or_done(andx)
    }

    async fn cmd_write_andx(
        &self,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        if w.len() < 24 {
            return Err(Error::Malformed("short write".to_string()));
        }
        let andx = AndX::parse(w)?;
        let fid = LittleEndian::read_u16(&w[4..6]);
        let mut offset = LittleEndian::read_u32(&w[6..10]) as u64;
        let data_length = LittleEndian::read_u16(&w[20..22]) as usize;
        let data_offset = LittleEndian::read_u16(&w[22..24]) as usize;
        if w.len() >= 28 {
            offset |= (LittleEndian::read_u32(&w[24..28]) as u64) << 32;
        }
        let payload = req.from_offset(data_offset, data_length)?;

        let st = self.state.lock().await;
        let sess = st.session.as_ref().ok_or_else(no_session)?;

        if let Some(kind) = sess.pipes.get(&fid).copied() {
            let uid = sess.uid;
            drop(st);
            let written = self
                .server
                .pipes
                .call(kind, PipeOp::Write, uid, payload.to_vec())
                .await
                .map(|_| payload.len())?;
            write_write_rsp(reply, andx.command, written);
            return chain_or_done(andx);
        }

        let tree_writable = sess.tree(hdr.tid)?.writable;
        let file = sess.files.get(fid).ok_or(Error::InvalidHandle(fid as u64))?;
        drop(st);

        if !tree_writable {
            return Err(Error::AccessDenied("write on read-only tree".to_string()));
        }
        if !file.access.grants_write() {
            return Err(Error::AccessDenied(format!(
                "no write right on fid {}",
                fid
            )));
        }

        let written = match &file.stream {
            Some(stream) => {
                file.vfs
                    .write_stream(&file.path(), &stream.xattr_name, offset, payload)?
            }
            None => {
                if !payload.is_empty() {
                    file.inner().check_lock_range(
                        offset,
                        offset + payload.len() as u64 - 1,
                        true,
                    )?;
                }
                let key = InodeKey {
                    dev: file.master.key.dev,
                    ino: file.master.key.ino,
                };
                self.server.oplocks.break_all_level2(key).await;
                file.vfs.write_at(&file.file, offset, payload)?
            }
        };
        trace!(fid, offset, written, "write");

        write_write_rsp(reply, andx.command, written);
        chain_or_done(andx)
    }

    async fn cmd_write(
        &self,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        if w.len() < 10 {
            return Err(Error::Malformed("short write".to_string()));
        }
        let fid = LittleEndian::read_u16(&w[0..2]);
        let count = LittleEndian::read_u16(&w[2..4]) as usize;
        let offset = LittleEndian::read_u32(&w[4..8]) as u64;

        let data = req.data(block)?;

        let st = self.state.lock().await;
        let sess = st.session.as_ref().ok_or_else(no_session)?;
        let tree_writable = sess.tree(hdr.tid)?.writable;
        let file = sess.files.get(fid).ok_or(Error::InvalidHandle(fid as u64))?;
        drop(st);

        if !tree_writable {
            return Err(Error::AccessDenied("write on read-only tree".to_string()));
        }

        // A zero-length legacy write truncates at the offset.
        let written = if count == 0 {
            file.vfs.ftruncate(&file.file, offset)?;
            0
        } else {
            if data.len() < 3 || data[0] != 0x01 {
                return Err(Error::Malformed("bad write buffer format".to_string()));
            }
            let len = LittleEndian::read_u16(&data[1..3]) as usize;
            let payload = data
                .get(3..3 + len.min(count))
                .ok_or_else(|| Error::Malformed("write data truncated".to_string()))?;
            if !payload.is_empty() {
                file.inner()
                    .check_lock_range(offset, offset + payload.len() as u64 - 1, true)?;
            }
            let key = file.master.key;
            self.server.oplocks.break_all_level2(key).await;
            file.vfs.write_at(&file.file, offset, payload)?
        };

        let mut words = Vec::with_capacity(2);
        words.write_u16::<LittleEndian>(written as u16)?;
        reply.block(&words, &[]);
        Ok(Chained::Done)
    }

    async fn cmd_flush(
        &self,
        req: &Request<'_>,
        _hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        if w.len() < 2 {
            return Err(Error::Malformed("short flush".to_string()));
        }
        let fid = LittleEndian::read_u16(&w[0..2]);

        let st = self.state.lock().await;
        let sess = st.session.as_ref().ok_or_else(no_session)?;
        if fid == 0xFFFF {
            let files: Vec<_> = sess.files.entries();
            drop(st);
            for (_, file) in files {
                file.vfs.fsync(&file.file)?;
            }
        } else {
            let file = sess.files.get(fid).ok_or(Error::InvalidHandle(fid as u64))?;
            drop(st);
            file.vfs.fsync(&file.file)?;
        }

        reply.block(&[], &[]);
        Ok(Chained::Done)
    }

    async fn cmd_close(
        &self,
        req: &Request<'_>,
        _hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        if w.len() < 6 {
            return Err(Error::Malformed("short close".to_string()));
        }
        let fid = LittleEndian::read_u16(&w[0..2]);

        let mut st = self.state.lock().await;
        let sess = st.session.as_mut().ok_or_else(no_session)?;

        if let Some(kind) = sess.pipes.remove(&fid) {
            let uid = sess.uid;
            sess.files.abandon_fid(fid);
            drop(st);
            self.server
                .pipes
                .call(kind, PipeOp::Close, uid, Vec::new())
                .await?;
            reply.block(&[], &[]);
            return Ok(Chained::Done);
        }

        let persistent = sess.files.get(fid).and_then(|f| f.persistent_id());
        close_file(&sess.files, &self.server.mft, fid).await?;
        drop(st);

        if let Some(pid) = persistent {
            self.server.durables.close(pid)?;
        }

        reply.block(&[], &[]);
        Ok(Chained::Done)
    }

    async fn cmd_find_close(
        &self,
        req: &Request<'_>,
        _hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        if w.len() < 2 {
            return Err(Error::Malformed("short find close".to_string()));
        }
        let sid = LittleEndian::read_u16(&w[0..2]);

        let mut st = self.state.lock().await;
        let sess = st.session.as_mut().ok_or_else(no_session)?;
        close_file(&sess.files, &self.server.mft, sid).await?;
        drop(st);

        reply.block(&[], &[]);
        Ok(Chained::Done)
    }

    // ----- locking -----

    async fn cmd_locking(
        &self,
        req: &Request<'_>,
        _hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
        ctl: &ReqCtl,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        if w.len() < 16 {
            return Err(Error::Malformed("short locking".to_string()));
        }
        let andx = AndX::parse(w)?;
        let fid = LittleEndian::read_u16(&w[4..6]);
        let locktype = w[6];
        let timeout = LittleEndian::read_u32(&w[8..12]);
        let num_unlocks = LittleEndian::read_u16(&w[12..14]) as usize;
        let num_locks = LittleEndian::read_u16(&w[14..16]) as usize;

        // Oplock break acknowledgements carry no response.
        if locktype & lock_type::OPLOCK_RELEASE != 0 {
            let st = self.state.lock().await;
            if let Some(sess) = st.session.as_ref() {
                if let Some(file) = sess.files.get(fid) {
                    let key = file.master.key;
                    drop(st);
                    self.server
                        .oplocks
                        .break_to_level(key, OplockLevel::None)
                        .await;
                }
            }
            reply.suppress();
            return Ok(Chained::Done);
        }

        let data = req.data(block)?;
        let large = locktype & lock_type::LARGE_FILES != 0;
        let range_size = if large { 20 } else { 10 };
        if data.len() < (num_unlocks + num_locks) * range_size {
            return Err(Error::Malformed("lock ranges exceed data".to_string()));
        }

        let st = self.state.lock().await;
        let sess = st.session.as_ref().ok_or_else(no_session)?;
        let file = sess.files.get(fid).ok_or(Error::InvalidHandle(fid as u64))?;
        drop(st);

        for i in 0..num_unlocks {
            let (pid, start, len) = parse_lock_range(&data[i * range_size..], large);
            let end = start.saturating_add(len.saturating_sub(1));
            file.remove_lock(start, end, pid)?;
        }

        let shared = locktype & lock_type::SHARED_LOCK != 0;
        let lock_base = num_unlocks * range_size;
        for i in 0..num_locks {
            let (pid, start, len) = parse_lock_range(&data[lock_base + i * range_size..], large);
            if len == 0 {
                continue;
            }
            let candidate = ByteLock {
                start,
                end: start.saturating_add(len - 1),
                exclusive: !shared,
                pid,
            };

            let deadline =
                tokio::time::Instant::now() + Duration::from_millis(timeout as u64);
            loop {
                match file.inner().check_lock_grant(&candidate) {
                    Ok(()) => {
                        file.add_lock(candidate);
                        break;
                    }
                    Err(_) if timeout == 0 => {
                        return Err(Error::LockConflict);
                    }
                    Err(_) => {
                        if ctl.cancelled.load(Ordering::SeqCst) {
                            return Err(Error::Cancelled);
                        }
                        if tokio::time::Instant::now() >= deadline {
                            return Err(Error::LockConflict);
                        }
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                }
            }
        }

        reply.andx_block(andx.command, &[], &[]);
        chain_or_done(andx)
    }

    // ----- path operations -----

    async fn cmd_rename(
        &self,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let data = req.data(block)?;
        let abs = req.data_start(block)?;
        let (old_name, new_name) = parse_two_names(data, abs, hdr.is_unicode())?;
        debug!(%old_name, %new_name, "rename");

        self.rename_paths(hdr.tid, &old_name, &new_name, false).await?;
        reply.block(&[], &[]);
        Ok(Chained::Done)
    }

    async fn cmd_nt_rename(
        &self,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        if w.len() < 8 {
            return Err(Error::Malformed("short nt rename".to_string()));
        }
        let info_level = LittleEndian::read_u16(&w[2..4]);

        let data = req.data(block)?;
        let abs = req.data_start(block)?;
        let (old_name, new_name) = parse_two_names(data, abs, hdr.is_unicode())?;
        debug!(%old_name, %new_name, info_level, "nt rename");

        match info_level {
            // SMB_NT_RENAME_SET_LINK_INFO
            0x0103 => {
                self.rename_paths(hdr.tid, &old_name, &new_name, true).await?;
            }
            0x0104 | 0x0105 => {
                self.rename_paths(hdr.tid, &old_name, &new_name, false).await?;
            }
            other => return Err(Error::NotImplemented(format!("nt rename level 0x{:x}", other))),
        }
        reply.block(&[], &[]);
        Ok(Chained::Done)
    }

    /// Shared rename/hardlink path used by RENAME, NT_RENAME and the
    /// TRANS2 rename info levels.
    pub(crate) async fn rename_paths(
        &self,
        tid: u16,
        old_name: &str,
        new_name: &str,
        hardlink: bool,
    ) -> Result<()> {
        let st = self.state.lock().await;
        let sess = st.session.as_ref().ok_or_else(no_session)?;
        let tree = sess.tree(tid)?.clone();
        drop(st);

        if !tree.writable {
            return Err(Error::AccessDenied("rename on read-only tree".to_string()));
        }
        let vfs = tree.vfs()?;
        let old_path = vfs.resolve(old_name)?;
        let (new_parent, new_leaf) = vfs.resolve_parent(new_name)?;
        let new_path = new_parent.join(&new_leaf);

        let old_stat = vfs.stat(&old_path)?;
        if new_path.exists() {
            return Err(Error::AlreadyExists(format!("{:?}", new_path)));
        }

        if hardlink {
            vfs.link(&old_path, &new_path)?;
            return Ok(());
        }

        if old_stat.is_dir() && self.server.mft.has_open_under(&old_path) {
            return Err(Error::SharingViolation(format!(
                "directory {:?} has open children",
                old_path
            )));
        }

        vfs.rename(&old_path, &new_path)?;

        // Keep the inode bookkeeping pointing at the new name.
        let key = InodeKey {
            dev: old_stat.dev,
            ino: old_stat.ino,
        };
        if let Some(master) = self.server.mft.get(key) {
            master.set_path(new_path.clone());
            for open in master.live_opens() {
                open.set_path(new_path.clone());
            }
        }
        Ok(())
    }

    async fn cmd_delete(
        &self,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let data = req.data(block)?;
        let abs = req.data_start(block)?;
        let (name, _) = read_prefixed_name(data, 0, abs, hdr.is_unicode())?;
        debug!(%name, "delete");

        let (vfs, writable) = self.tree_vfs(hdr.tid).await?;
        if !writable {
            return Err(Error::AccessDenied("delete on read-only tree".to_string()));
        }
        let path = vfs.resolve(&name)?;
        let stat = vfs.stat(&path)?;
        if stat.is_dir() {
            return Err(Error::IsADirectory(name));
        }
        vfs.unlink(&path)?;

        reply.block(&[], &[]);
        Ok(Chained::Done)
    }

    async fn cmd_mkdir(
        &self,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let data = req.data(block)?;
        let abs = req.data_start(block)?;
        let (name, _) = read_prefixed_name(data, 0, abs, hdr.is_unicode())?;
        debug!(%name, "mkdir");

        let (vfs, writable) = self.tree_vfs(hdr.tid).await?;
        if !writable {
            return Err(Error::AccessDenied("mkdir on read-only tree".to_string()));
        }
        let (parent, leaf) = vfs.resolve_parent(&name)?;
        vfs.mkdir(&parent.join(leaf), 0o755)?;

        reply.block(&[], &[]);
        Ok(Chained::Done)
    }

    async fn cmd_rmdir(
        &self,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let data = req.data(block)?;
        let abs = req.data_start(block)?;
        let (name, _) = read_prefixed_name(data, 0, abs, hdr.is_unicode())?;
        debug!(%name, "rmdir");

        let (vfs, writable) = self.tree_vfs(hdr.tid).await?;
        if !writable {
            return Err(Error::AccessDenied("rmdir on read-only tree".to_string()));
        }
        let path = vfs.resolve(&name)?;
        vfs.rmdir(&path)?;

        reply.block(&[], &[]);
        Ok(Chained::Done)
    }

    async fn cmd_checkdir(
        &self,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let data = req.data(block)?;
        let abs = req.data_start(block)?;
        let (name, _) = read_prefixed_name(data, 0, abs, hdr.is_unicode())?;

        let (vfs, _) = self.tree_vfs(hdr.tid).await?;
        let path = vfs.resolve(&name)?;
        match vfs.stat(&path) {
            Ok(stat) if stat.is_dir() => {
                reply.block(&[], &[]);
                Ok(Chained::Done)
            }
            Ok(_) => Err(Error::NotADirectory(name)),
            Err(_) => {
                // Distinguish a missing leaf from a missing path component.
                let parent = path.parent().map(|p| p.to_path_buf());
                match parent {
                    Some(parent) if vfs.stat(&parent).is_ok() => {
                        Err(Error::NotFound(name))
                    }
                    _ => {
                        reply.set_status(NtStatus::ObjectPathNotFound);
                        reply.block(&[], &[]);
                        Ok(Chained::Done)
                    }
                }
            }
        }
    }

    // ----- core-dialect info -----

    async fn cmd_query_information(
        &self,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let data = req.data(block)?;
        let abs = req.data_start(block)?;
        let (name, _) = read_prefixed_name(data, 0, abs, hdr.is_unicode())?;

        let (vfs, _) = self.tree_vfs(hdr.tid).await?;
        let path = vfs.resolve(&name)?;
        let stat = vfs.stat(&path)?;

        let attrs: u16 = match vfs.get_dos_attr(&path) {
            Ok(Some(a)) => a as u16,
            _ if stat.is_dir() => FileAttributes::DIRECTORY.bits() as u16,
            _ => FileAttributes::NORMAL.bits() as u16,
        };

        let mut words = Vec::with_capacity(20);
        words.write_u16::<LittleEndian>(attrs)?;
        words.write_u32::<LittleEndian>(stat.mtime.0 as u32)?;
        words.write_u32::<LittleEndian>(stat.size as u32)?;
        words.extend_from_slice(&[0u8; 10]);
        reply.block(&words, &[]);
        Ok(Chained::Done)
    }

    async fn cmd_setattr(
        &self,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        if w.len() < 16 {
            return Err(Error::Malformed("short setattr".to_string()));
        }
        let attrs = LittleEndian::read_u16(&w[0..2]) as u32;
        let mtime = LittleEndian::read_u32(&w[2..6]);

        let data = req.data(block)?;
        let abs = req.data_start(block)?;
        let (name, _) = read_prefixed_name(data, 0, abs, hdr.is_unicode())?;
        debug!(%name, attrs, "setattr");

        let mut st = self.state.lock().await;
        let sess = st.session.as_mut().ok_or_else(no_session)?;
        let tree = sess.tree(hdr.tid)?.clone();
        drop(st);
        if !tree.writable {
            return Err(Error::AccessDenied("setattr on read-only tree".to_string()));
        }
        let vfs = tree.vfs()?;
        let path = vfs.resolve(&name)?;
        vfs.stat(&path)?;

        if tree.share.store_dos_attr {
            vfs.set_dos_attr(&path, attrs)?;
        }
        if mtime != 0 {
            vfs.setattr(
                &path,
                &crate::vfs::SetAttrs {
                    mtime: Some((mtime as i64, 0)),
                    ..Default::default()
                },
            )?;
        }

        reply.block(&[], &[]);
        Ok(Chained::Done)
    }

    // ----- control -----

    async fn cmd_echo(
        &self,
        req: &Request<'_>,
        hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
        ctl: &mut ReqCtl,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        if w.len() < 2 {
            return Err(Error::Malformed("short echo".to_string()));
        }
        let count = LittleEndian::read_u16(&w[0..2]).min(10);
        let data = req.data(block)?;

        let mut words = Vec::with_capacity(2);
        words.write_u16::<LittleEndian>(1)?;
        reply.block(&words, data);

        // Further responses repeat the payload with rising sequence numbers.
        for seq in 2..=count {
            let mut extra = ReplyBuf::new(hdr, SMALL_RSP_BUF_SIZE + data.len());
            let mut words = Vec::with_capacity(2);
            words.write_u16::<LittleEndian>(seq)?;
            extra.block(&words, data);
            ctl.extra.push(extra.into_vec());
        }
        Ok(Chained::Done)
    }

    async fn cmd_nt_cancel(&self, hdr: &SmbHeader, reply: &mut ReplyBuf) -> Result<Chained> {
        let mut st = self.state.lock().await;
        let found = st
            .pending
            .iter()
            .find(|p| p.mid == hdr.mid)
            .map(|p| Arc::clone(&p.cancelled));
        match found {
            Some(flag) => {
                debug!(mid = hdr.mid, "cancelling in-flight request");
                flag.store(true, Ordering::SeqCst);
            }
            None => {
                // Cancelling an unknown MID is a no-op.
                debug!(mid = hdr.mid, "cancel for unknown mid");
            }
        }
        // NT_CANCEL itself never gets a response; its own unsent slot is
        // compensated here, the cancelled request adjusts for its own.
        if let Some(sess) = st.session.as_mut() {
            if sess.signing.is_some() {
                sess.sequence = sess.sequence.saturating_sub(1);
            }
        }
        drop(st);
        reply.suppress();
        Ok(Chained::Done)
    }

    async fn cmd_transaction(
        &self,
        req: &Request<'_>,
        _hdr: &SmbHeader,
        block: usize,
        reply: &mut ReplyBuf,
    ) -> Result<Chained> {
        let w = req.words(block)?;
        if w.len() < 28 {
            return Err(Error::Malformed("short transaction".to_string()));
        }
        let data_count = LittleEndian::read_u16(&w[22..24]) as usize;
        let data_offset = LittleEndian::read_u16(&w[24..26]) as usize;
        let setup_count = w[26] as usize;
        if w.len() < 28 + setup_count * 2 {
            return Err(Error::Malformed("transaction setup truncated".to_string()));
        }
        let function = if setup_count > 0 {
            LittleEndian::read_u16(&w[28..30])
        } else {
            0
        };
        let fid = if setup_count > 1 {
            LittleEndian::read_u16(&w[30..32])
        } else {
            0
        };
        let payload = req.from_offset(data_offset, data_count)?;
        debug!(function, fid, len = payload.len(), "transaction");

        let st = self.state.lock().await;
        let sess = st.session.as_ref().ok_or_else(no_session)?;
        let kind = sess
            .pipes
            .get(&fid)
            .copied()
            .ok_or(Error::InvalidHandle(fid as u64))?;
        let uid = sess.uid;
        drop(st);

        // 0x26 is TransactNmPipe; everything else is passed through as an
        // opaque transact to the service.
        let reply_buf = self
            .server
            .pipes
            .call(kind, PipeOp::Transact, uid, payload.to_vec())
            .await?;

        write_trans_rsp(reply, &[], &reply_buf);
        Ok(Chained::Done)
    }

    // ----- shared helpers -----

    /// The VFS and writability of a session tree.
    pub(crate) async fn tree_vfs(&self, tid: u16) -> Result<(Arc<Vfs>, bool)> {
        let st = self.state.lock().await;
        let sess = st.session.as_ref().ok_or_else(no_session)?;
        let tree = sess.tree(tid)?;
        Ok((tree.vfs()?.clone(), tree.writable))
    }
}

/// Known-large commands get the big response allocation up front.
fn response_capacity(cmd: u8) -> usize {
    match cmd {
        command::READ_ANDX | command::TRANSACTION | command::TRANSACTION2 | command::ECHO => {
            LARGE_RSP_BUF_SIZE
        }
        _ => SMALL_RSP_BUF_SIZE,
    }
}

fn chain_or_done(andx: AndX) -> Result<Chained> {
    if andx.is_terminator() {
        Ok(Chained::Done)
    } else {
        Ok(Chained::Next {
            cmd: andx.command,
            offset: andx.offset as usize,
        })
    }
}

/// Negotiate dialect selection
#[derive(Debug, PartialEq, Eq)]
enum DialectChoice {
    NtLm012(u16),
    Smb2(u16),
    None,
}

fn parse_dialect_list(data: &[u8]) -> Result<Vec<String>> {
    let mut dialects = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        if data[pos] != 0x02 {
            return Err(Error::Malformed("bad dialect marker".to_string()));
        }
        let (name, used) = codec::read_ascii_cstr(&data[pos + 1..])?;
        dialects.push(name);
        pos += 1 + used;
    }
    Ok(dialects)
}

fn choose_dialect(dialects: &[String], config: &crate::config::GlobalConfig) -> DialectChoice {
    use crate::config::ProtocolLevel;

    if config.max_protocol >= ProtocolLevel::Smb2 {
        if let Some(idx) = dialects.iter().position(|d| {
            d == constants::DIALECT_SMB_2_002 || d == constants::DIALECT_SMB_2_WILDCARD
        }) {
            return DialectChoice::Smb2(idx as u16);
        }
    }
    if config.min_protocol <= ProtocolLevel::NtLm012 {
        if let Some(idx) = dialects
            .iter()
            .position(|d| d == constants::DIALECT_NT_LM_012)
        {
            return DialectChoice::NtLm012(idx as u16);
        }
    }
    DialectChoice::None
}

/// `\\server\share` or `share` to the bare share name
fn extract_share_name(path: &str) -> String {
    path.split('\\')
        .filter(|s| !s.is_empty())
        .last()
        .unwrap_or("")
        .to_string()
}

/// Names in old-style commands carry a 0x04 buffer-format prefix.
fn read_prefixed_name(
    data: &[u8],
    pos: usize,
    abs: usize,
    unicode: bool,
) -> Result<(String, usize)> {
    if data.len() <= pos || data[pos] != 0x04 {
        return Err(Error::Malformed("missing buffer format".to_string()));
    }
    let (name, used) = codec::read_wire_name(data, pos + 1, abs + 1, unicode)?;
    Ok((name, used + 1))
}

/// The two prefixed names of RENAME / NT_RENAME.
fn parse_two_names(data: &[u8], abs: usize, unicode: bool) -> Result<(String, String)> {
    let (old_name, used) = read_prefixed_name(data, 0, abs, unicode)?;
    let (new_name, _) = read_prefixed_name(data, used, abs + used, unicode)?;
    Ok((old_name, new_name))
}

/// NT_CREATE name field: counted, not null-terminated.
fn read_create_name(data: &[u8], abs: usize, name_length: usize, unicode: bool) -> Result<String> {
    if unicode {
        let pad = if abs % 2 == 1 { 1 } else { 0 };
        let bytes = data
            .get(pad..pad + name_length)
            .ok_or_else(|| Error::Malformed("create name truncated".to_string()))?;
        let s = codec::decode_utf16le(bytes)?;
        Ok(s.trim_end_matches('\0').to_string())
    } else {
        let bytes = data
            .get(..name_length)
            .ok_or_else(|| Error::Malformed("create name truncated".to_string()))?;
        Ok(String::from_utf8_lossy(bytes)
            .trim_end_matches('\0')
            .to_string())
    }
}

fn parse_lock_range(buf: &[u8], large: bool) -> (u16, u64, u64) {
    let pid = LittleEndian::read_u16(&buf[0..2]);
    if large {
        let offset = ((LittleEndian::read_u32(&buf[4..8]) as u64) << 32)
            | LittleEndian::read_u32(&buf[8..12]) as u64;
        let len = ((LittleEndian::read_u32(&buf[12..16]) as u64) << 32)
            | LittleEndian::read_u32(&buf[16..20]) as u64;
        (pid, offset, len)
    } else {
        let offset = LittleEndian::read_u32(&buf[2..6]) as u64;
        let len = LittleEndian::read_u32(&buf[6..10]) as u64;
        (pid, offset, len)
    }
}

#[allow(clippy::too_many_arguments)]
fn nt_create_rsp_words(
    _next: u8,
    oplock_level: u8,
    fid: u16,
    action: u32,
    mtime_nt: u64,
    size: u64,
    attrs: u32,
    file_type: u16,
    device_state: u16,
    is_dir: bool,
) -> Result<Vec<u8>> {
    let mut words = Vec::with_capacity(64);
    words.push(oplock_level);
    words.write_u16::<LittleEndian>(fid)?;
    words.write_u32::<LittleEndian>(action)?;
    words.write_u64::<LittleEndian>(mtime_nt)?; // CreationTime
    words.write_u64::<LittleEndian>(mtime_nt)?; // LastAccessTime
    words.write_u64::<LittleEndian>(mtime_nt)?; // LastWriteTime
    words.write_u64::<LittleEndian>(mtime_nt)?; // ChangeTime
    words.write_u32::<LittleEndian>(attrs)?;
    words.write_u64::<LittleEndian>(size)?; // AllocationSize
    words.write_u64::<LittleEndian>(size)?; // EndOfFile
    words.write_u16::<LittleEndian>(file_type)?;
    words.write_u16::<LittleEndian>(device_state)?;
    words.push(is_dir as u8);
    Ok(words)
}

fn write_read_rsp(reply: &mut ReplyBuf, next: u8, data: &[u8]) {
    // Data lands at a fixed offset: header + wct + 12 words + bcc + 1 pad.
    let data_offset = (SMB_HEADER_SIZE + 1 + 24 + 2 + 1) as u16;
    let mut words = Vec::with_capacity(20);
    let _ = words.write_u16::<LittleEndian>(0); // Remaining
    let _ = words.write_u16::<LittleEndian>(0); // DataCompactionMode
    let _ = words.write_u16::<LittleEndian>(0); // Reserved
    let _ = words.write_u16::<LittleEndian>(data.len() as u16);
    let _ = words.write_u16::<LittleEndian>(data_offset);
    let _ = words.write_u16::<LittleEndian>((data.len() >> 16) as u16); // DataLengthHigh
    words.extend_from_slice(&[0u8; 8]); // Reserved2

    let mut body = Vec::with_capacity(1 + data.len());
    body.push(0); // pad to the advertised offset
    body.extend_from_slice(data);
    reply.andx_block(next, &words, &body);
}

fn write_write_rsp(reply: &mut ReplyBuf, next: u8, written: usize) {
    let mut words = Vec::with_capacity(8);
    let _ = words.write_u16::<LittleEndian>(written as u16);
    let _ = words.write_u16::<LittleEndian>((written >> 16) as u16); // CountHigh
    let _ = words.write_u32::<LittleEndian>(0); // Reserved
    reply.andx_block(next, &words, &[]);
}

/// Frame a TRANSACTION response: ten parameter words then padded
/// parameter/data sections.
pub(crate) fn write_trans_rsp(reply: &mut ReplyBuf, params: &[u8], data: &[u8]) {
    // Fixed prefix: header(32) + wct(1) + 10 words(20) + bcc(2) = 55.
    let param_offset = 56usize; // one pad byte
    let data_offset = (param_offset + params.len() + 3) & !3;

    let mut words = Vec::with_capacity(20);
    let _ = words.write_u16::<LittleEndian>(params.len() as u16); // TotalParameterCount
    let _ = words.write_u16::<LittleEndian>(data.len() as u16); // TotalDataCount
    let _ = words.write_u16::<LittleEndian>(0); // Reserved
    let _ = words.write_u16::<LittleEndian>(params.len() as u16); // ParameterCount
    let _ = words.write_u16::<LittleEndian>(param_offset as u16);
    let _ = words.write_u16::<LittleEndian>(0); // ParameterDisplacement
    let _ = words.write_u16::<LittleEndian>(data.len() as u16); // DataCount
    let _ = words.write_u16::<LittleEndian>(data_offset as u16);
    let _ = words.write_u16::<LittleEndian>(0); // DataDisplacement
    let _ = words.write_u16::<LittleEndian>(0); // SetupCount + reserved

    let mut body = Vec::with_capacity(1 + params.len() + 4 + data.len());
    body.push(0); // pad to param_offset
    body.extend_from_slice(params);
    let pad = data_offset - param_offset - params.len();
    body.extend(std::iter::repeat(0u8).take(pad));
    body.extend_from_slice(data);
    reply.block(&words, &body);
}

/// Join a relative create path onto an open directory's host path,
/// refusing escapes.
fn return_path_under(vfs: &Vfs, base: &std::path::Path, rel: &str) -> Result<String> {
    let joined = base.join(rel);
    if !joined.starts_with(vfs.root()) {
        return Err(Error::AccessDenied("relative open escapes share".to_string()));
    }
    let suffix = joined
        .strip_prefix(vfs.root())
        .map_err(|_| Error::AccessDenied("relative open escapes share".to_string()))?;
    Ok(suffix.to_string_lossy().replace('/', "\\"))
}

/// Split `file.txt:stream` into base name and stream binding.
fn split_stream_name(name: &str) -> (String, Option<String>) {
    match name.split_once(':') {
        Some((base, stream)) => {
            let stream = stream.split(':').next().unwrap_or(stream);
            if stream.is_empty() {
                (base.to_string(), None)
            } else {
                (base.to_string(), Some(stream.to_string()))
            }
        }
        None => (name.to_string(), None),
    }
}

/// Open or create a target per the disposition matrix and install it into
/// the FID table and master-file table.
#[allow(clippy::too_many_arguments)]
pub(crate) fn open_install(
    sess: &mut Session,
    tree: &TreeConnection,
    mft: &crate::server::mft::MasterFileTable,
    vfs: &Arc<Vfs>,
    wire_name: &str,
    access: AccessMask,
    disp: u32,
    want_dir: bool,
    nt_open: bool,
) -> Result<(Arc<SmbFile>, u32, crate::vfs::UnixStat)> {
    let (base_name, stream_name) = split_stream_name(wire_name);
    let path = vfs.resolve(&base_name)?;
    let present = vfs.stat(&path).is_ok();

    // Disposition matrix: presence x disposition to host flags + action
    let (create, truncate, action) = match disp {
        disposition::SUPERSEDE => {
            if present {
                (false, true, create_action::SUPERSEDED)
            } else {
                (true, false, create_action::CREATED)
            }
        }
        disposition::OPEN => {
            if !present {
                return Err(Error::NotFound(base_name));
            }
            (false, false, create_action::OPENED)
        }
        disposition::CREATE => {
            if present {
                return Err(Error::AlreadyExists(base_name));
            }
            (true, false, create_action::CREATED)
        }
        disposition::OPEN_IF => {
            if present {
                (false, false, create_action::OPENED)
            } else {
                (true, false, create_action::CREATED)
            }
        }
        disposition::OVERWRITE => {
            if !present {
                return Err(Error::NotFound(base_name));
            }
            (false, true, create_action::OVERWRITTEN)
        }
        disposition::OVERWRITE_IF => {
            if present {
                (false, true, create_action::OVERWRITTEN)
            } else {
                (true, false, create_action::CREATED)
            }
        }
        other => {
            return Err(Error::InvalidParameter(format!(
                "create disposition {}",
                other
            )))
        }
    };

    let mutating = create || truncate || access.grants_write();
    if mutating && !tree.writable {
        return Err(Error::AccessDenied(format!(
            "write access on read-only tree {}",
            tree.tid
        )));
    }

    let is_stream = stream_name.is_some();
    let host = if want_dir && !is_stream {
        if present {
            let stat = vfs.stat(&path)?;
            if !stat.is_dir() {
                return Err(Error::NotADirectory(base_name));
            }
        } else if create {
            vfs.mkdir(&path, 0o755)?;
        } else {
            return Err(Error::NotFound(base_name));
        }
        vfs.open_dir(&path)?
    } else {
        let existing_dir = present && vfs.stat(&path)?.is_dir();
        if existing_dir && (truncate || is_stream) {
            return Err(Error::IsADirectory(base_name));
        }
        if existing_dir {
            vfs.open_dir(&path)?
        } else {
            vfs.open_with(
                &path,
                OpenDisp {
                    read: true,
                    write: access.grants_write() && !is_stream,
                    create: create && !is_stream,
                    create_new: false,
                    truncate: truncate && !is_stream,
                    mode: Some(0o644),
                },
            )?
        }
    };

    let stat = vfs.fstat(&host)?;
    let key = InodeKey {
        dev: stat.dev,
        ino: stat.ino,
    };

    let stream = stream_name.map(|name| StreamInfo {
        xattr_name: format!("{}{}", crate::vfs::STREAM_PREFIX, name),
        name,
    });
    if let Some(info) = &stream {
        if create || truncate {
            vfs.set_xattr(&path, &info.xattr_name, &[])?;
        }
    }

    let fid = sess.files.allocate_fid()?;
    let master = mft.lookup_or_insert(key, path.clone());
    let file = SmbFile::new(
        OpenParams {
            fid,
            tid: tree.tid,
            access,
            is_directory: stat.is_dir(),
            is_nt_open: nt_open,
            stream,
            path,
            file: host,
        },
        Arc::clone(vfs),
        Arc::clone(&master),
    );
    master.attach(&file);
    if let Err(e) = sess.files.install(Arc::clone(&file)) {
        master.detach(&file);
        mft.release(&master, vfs)?;
        sess.files.abandon_fid(fid);
        return Err(e);
    }

    Ok((file, action, stat))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_share_name() {
        assert_eq!(extract_share_name("\\\\srv\\share"), "share");
        assert_eq!(extract_share_name("share"), "share");
        assert_eq!(extract_share_name("\\\\srv\\IPC$"), "IPC$");
    }

    #[test]
    fn test_split_stream_name() {
        assert_eq!(split_stream_name("f.txt"), ("f.txt".to_string(), None));
        assert_eq!(
            split_stream_name("f.txt:side"),
            ("f.txt".to_string(), Some("side".to_string()))
        );
        assert_eq!(
            split_stream_name("f.txt:side:$DATA"),
            ("f.txt".to_string(), Some("side".to_string()))
        );
    }

    #[test]
    fn test_parse_dialect_list() {
        let mut data = Vec::new();
        for d in ["PC NETWORK PROGRAM 1.0", "NT LM 0.12"] {
            data.push(0x02);
            data.extend_from_slice(d.as_bytes());
            data.push(0);
        }
        let list = parse_dialect_list(&data).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1], "NT LM 0.12");
    }

    #[test]
    fn test_choose_dialect() {
        let config = crate::config::GlobalConfig::default();
        let dialects = vec!["PC NETWORK PROGRAM 1.0".to_string(), "NT LM 0.12".to_string()];
        assert_eq!(
            choose_dialect(&dialects, &config),
            DialectChoice::NtLm012(1)
        );
        let old = vec!["PC NETWORK PROGRAM 1.0".to_string()];
        assert_eq!(choose_dialect(&old, &config), DialectChoice::None);
    }

    #[test]
    fn test_parse_lock_ranges() {
        let mut small = Vec::new();
        small.extend_from_slice(&7u16.to_le_bytes());
        small.extend_from_slice(&100u32.to_le_bytes());
        small.extend_from_slice(&50u32.to_le_bytes());
        assert_eq!(parse_lock_range(&small, false), (7, 100, 50));

        let mut large = Vec::new();
        large.extend_from_slice(&7u16.to_le_bytes());
        large.extend_from_slice(&0u16.to_le_bytes());
        large.extend_from_slice(&1u32.to_le_bytes()); // OffsetHigh
        large.extend_from_slice(&2u32.to_le_bytes()); // OffsetLow
        large.extend_from_slice(&0u32.to_le_bytes()); // LengthHigh
        large.extend_from_slice(&9u32.to_le_bytes()); // LengthLow
        assert_eq!(parse_lock_range(&large, true), (7, (1u64 << 32) | 2, 9));
    }
}
