//! Request builders and response walkers for the scenario tests.

use crate::auth::ntlm;
use crate::config::{GlobalConfig, ShareConfig, SigningPolicy, UserConfig};
use crate::protocol::codec;
use crate::protocol::constants::{command, HeaderFlags, HeaderFlags2, SMB_HEADER_SIZE};
use crate::protocol::header::SmbHeader;
use crate::server::connection::Connection;
use crate::server::CifsServer;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::sync::Arc;
use tempfile::TempDir;

pub const TEST_USER: &str = "alice";
pub const TEST_PASSWORD: &str = "wonderland";

/// Server + connection around a fresh scratch share.
pub struct TestRig {
    pub dir: TempDir,
    pub server: Arc<CifsServer>,
    pub conn: Connection,
    next_mid: std::cell::Cell<u16>,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_share_tweak(|_| {})
    }

    pub fn with_share_tweak(tweak: impl FnOnce(&mut ShareConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let config = GlobalConfig {
            signing: SigningPolicy::Disabled,
            ..GlobalConfig::default()
        };
        let mut share = ShareConfig::new("share", dir.path());
        tweak(&mut share);
        let users = vec![UserConfig::new(TEST_USER, TEST_PASSWORD, 1000, 1000)];
        let server = CifsServer::new(config, vec![share], users);
        let conn = Connection::new(Arc::clone(&server), "127.0.0.1".to_string());
        Self {
            dir,
            server,
            conn,
            next_mid: std::cell::Cell::new(1),
        }
    }

    pub fn mid(&self) -> u16 {
        let mid = self.next_mid.get();
        self.next_mid.set(mid + 1);
        mid
    }

    /// Send one request, expecting exactly one response.
    pub async fn roundtrip(&self, req: Vec<u8>) -> Vec<u8> {
        let mut responses = self.conn.process(&req).await;
        assert_eq!(responses.len(), 1, "expected exactly one response");
        responses.remove(0)
    }

    /// Negotiate, returning the server challenge.
    pub async fn negotiate(&self) -> [u8; 8] {
        let rsp = self.roundtrip(negotiate_req(self.mid())).await;
        assert_eq!(status_of(&rsp), 0);
        let words = words_of(&rsp);
        assert_eq!(words.len(), 34);
        let data = data_of(&rsp);
        let mut challenge = [0u8; 8];
        challenge.copy_from_slice(&data[..8]);
        challenge
    }

    /// Authenticate, returning the minted UID.
    pub async fn session_setup(&self, challenge: [u8; 8]) -> u16 {
        let req = session_setup_req(self.mid(), TEST_USER, TEST_PASSWORD, &challenge);
        let rsp = self.roundtrip(req).await;
        assert_eq!(status_of(&rsp), 0, "session setup failed");
        let hdr = SmbHeader::parse(&rsp).unwrap();
        assert_ne!(hdr.uid, 0, "no UID minted");
        hdr.uid
    }

    /// Tree connect to the scratch share, returning the TID.
    pub async fn tree_connect(&self, uid: u16) -> u16 {
        let rsp = self
            .roundtrip(tree_connect_req(self.mid(), uid, "\\\\srv\\share"))
            .await;
        assert_eq!(status_of(&rsp), 0, "tree connect failed");
        let hdr = SmbHeader::parse(&rsp).unwrap();
        assert_ne!(hdr.tid, 0, "no TID assigned");
        hdr.tid
    }

    /// Full negotiate / setup / tree-connect preamble.
    pub async fn establish(&self) -> (u16, u16) {
        let challenge = self.negotiate().await;
        let uid = self.session_setup(challenge).await;
        let tid = self.tree_connect(uid).await;
        (uid, tid)
    }
}

fn base_header(cmd: u8, tid: u16, uid: u16, mid: u16) -> SmbHeader {
    SmbHeader {
        command: cmd,
        status: 0,
        flags: HeaderFlags::CASELESS,
        flags2: HeaderFlags2::UNICODE | HeaderFlags2::ERR_STATUS,
        pid_high: 0,
        signature: [0u8; 8],
        tid,
        pid: 0x1234,
        uid,
        mid,
    }
}

pub fn build_request(cmd: u8, tid: u16, uid: u16, mid: u16, words: &[u8], data: &[u8]) -> Vec<u8> {
    assert!(words.len() % 2 == 0);
    let mut buf = Vec::with_capacity(SMB_HEADER_SIZE + 3 + words.len() + data.len());
    base_header(cmd, tid, uid, mid).write_to(&mut buf);
    buf.push((words.len() / 2) as u8);
    buf.extend_from_slice(words);
    buf.extend_from_slice(&(data.len() as u16).to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

pub fn status_of(rsp: &[u8]) -> u32 {
    LittleEndian::read_u32(&rsp[5..9])
}

pub fn words_of(rsp: &[u8]) -> &[u8] {
    let wct = rsp[SMB_HEADER_SIZE] as usize;
    &rsp[SMB_HEADER_SIZE + 1..SMB_HEADER_SIZE + 1 + wct * 2]
}

pub fn data_of(rsp: &[u8]) -> &[u8] {
    let wct = rsp[SMB_HEADER_SIZE] as usize;
    let bcc_off = SMB_HEADER_SIZE + 1 + wct * 2;
    let bcc = LittleEndian::read_u16(&rsp[bcc_off..bcc_off + 2]) as usize;
    &rsp[bcc_off + 2..bcc_off + 2 + bcc]
}

pub fn negotiate_req(mid: u16) -> Vec<u8> {
    let mut data = Vec::new();
    for dialect in ["PC NETWORK PROGRAM 1.0", "NT LM 0.12"] {
        data.push(0x02);
        data.extend_from_slice(dialect.as_bytes());
        data.push(0);
    }
    build_request(command::NEGOTIATE, 0, 0, mid, &[], &data)
}

pub fn session_setup_req(mid: u16, user: &str, password: &str, challenge: &[u8; 8]) -> Vec<u8> {
    let nt_hash = ntlm::ntlm_hash(password).unwrap();
    let response = ntlm::ntlm_response(&nt_hash, challenge).unwrap();

    let mut words = Vec::with_capacity(26);
    words.extend_from_slice(&[0xFF, 0, 0, 0]); // AndX terminator
    words.write_u16::<LittleEndian>(4356).unwrap(); // MaxBufferSize
    words.write_u16::<LittleEndian>(1).unwrap(); // MaxMpxCount
    words.write_u16::<LittleEndian>(0).unwrap(); // VcNumber
    words.write_u32::<LittleEndian>(0).unwrap(); // SessionKey
    words.write_u16::<LittleEndian>(0).unwrap(); // CaseInsensitivePasswordLength
    words
        .write_u16::<LittleEndian>(response.len() as u16)
        .unwrap();
    words.write_u32::<LittleEndian>(0).unwrap(); // Reserved
    words.write_u32::<LittleEndian>(0x0000_0080).unwrap(); // Capabilities: NT status

    // Data: the 24-byte response, then the padded unicode account/domain.
    let mut data = Vec::new();
    data.extend_from_slice(&response);
    let abs = SMB_HEADER_SIZE + 1 + words.len() + 2 + data.len();
    if abs % 2 == 1 {
        data.push(0);
    }
    data.extend_from_slice(&codec::encode_utf16le_null(user));
    data.extend_from_slice(&codec::encode_utf16le_null("WORKGROUP"));

    build_request(command::SESSION_SETUP_ANDX, 0, 0, mid, &words, &data)
}

pub fn tree_connect_req(mid: u16, uid: u16, path: &str) -> Vec<u8> {
    let mut words = Vec::with_capacity(8);
    words.extend_from_slice(&[0xFF, 0, 0, 0]);
    words.write_u16::<LittleEndian>(0).unwrap(); // Flags
    words.write_u16::<LittleEndian>(1).unwrap(); // PasswordLength

    let mut data = vec![0u8]; // empty password
    let abs = SMB_HEADER_SIZE + 1 + words.len() + 2 + data.len();
    if abs % 2 == 1 {
        data.push(0);
    }
    data.extend_from_slice(&codec::encode_utf16le_null(path));
    data.extend_from_slice(b"?????\0");

    build_request(command::TREE_CONNECT_ANDX, 0, uid, mid, &words, &data)
}

pub fn nt_create_req(
    mid: u16,
    tid: u16,
    uid: u16,
    name: &str,
    access: u32,
    disposition: u32,
    options: u32,
) -> Vec<u8> {
    let name_utf16 = codec::encode_utf16le(name);

    let mut words = Vec::with_capacity(48);
    words.extend_from_slice(&[0xFF, 0, 0, 0]);
    words.push(0); // Reserved
    words
        .write_u16::<LittleEndian>(name_utf16.len() as u16)
        .unwrap();
    words.write_u32::<LittleEndian>(0).unwrap(); // Flags
    words.write_u32::<LittleEndian>(0).unwrap(); // RootDirectoryFid
    words.write_u32::<LittleEndian>(access).unwrap();
    words.write_u64::<LittleEndian>(0).unwrap(); // AllocationSize
    words.write_u32::<LittleEndian>(0).unwrap(); // ExtFileAttributes
    words.write_u32::<LittleEndian>(0x07).unwrap(); // ShareAccess
    words.write_u32::<LittleEndian>(disposition).unwrap();
    words.write_u32::<LittleEndian>(options).unwrap();
    words.write_u32::<LittleEndian>(2).unwrap(); // ImpersonationLevel
    words.push(0); // SecurityFlags

    let mut data = Vec::new();
    let abs = SMB_HEADER_SIZE + 1 + words.len() + 2;
    if abs % 2 == 1 {
        data.push(0);
    }
    data.extend_from_slice(&name_utf16);

    build_request(command::NT_CREATE_ANDX, tid, uid, mid, &words, &data)
}

/// FID out of an NT_CREATE_ANDX response.
pub fn created_fid(rsp: &[u8]) -> u16 {
    let words = words_of(rsp);
    LittleEndian::read_u16(&words[5..7])
}

/// CreateAction out of an NT_CREATE_ANDX response.
pub fn created_action(rsp: &[u8]) -> u32 {
    let words = words_of(rsp);
    LittleEndian::read_u32(&words[7..11])
}

pub fn write_andx_req(mid: u16, tid: u16, uid: u16, fid: u16, offset: u32, payload: &[u8]) -> Vec<u8> {
    let data_offset = (SMB_HEADER_SIZE + 1 + 24 + 2 + 1) as u16;

    let mut words = Vec::with_capacity(24);
    words.extend_from_slice(&[0xFF, 0, 0, 0]);
    words.write_u16::<LittleEndian>(fid).unwrap();
    words.write_u32::<LittleEndian>(offset).unwrap();
    words.write_u32::<LittleEndian>(0).unwrap(); // Timeout
    words.write_u16::<LittleEndian>(0).unwrap(); // WriteMode
    words.write_u16::<LittleEndian>(0).unwrap(); // Remaining
    words.write_u16::<LittleEndian>(0).unwrap(); // Reserved
    words
        .write_u16::<LittleEndian>(payload.len() as u16)
        .unwrap();
    words.write_u16::<LittleEndian>(data_offset).unwrap();

    let mut data = vec![0u8]; // pad to the advertised offset
    data.extend_from_slice(payload);
    build_request(command::WRITE_ANDX, tid, uid, mid, &words, &data)
}

/// Count out of a WRITE_ANDX response.
pub fn written_count(rsp: &[u8]) -> u16 {
    LittleEndian::read_u16(&words_of(rsp)[4..6])
}

pub fn read_andx_req(mid: u16, tid: u16, uid: u16, fid: u16, offset: u32, max: u16) -> Vec<u8> {
    let mut words = Vec::with_capacity(20);
    words.extend_from_slice(&[0xFF, 0, 0, 0]);
    words.write_u16::<LittleEndian>(fid).unwrap();
    words.write_u32::<LittleEndian>(offset).unwrap();
    words.write_u16::<LittleEndian>(max).unwrap();
    words.write_u16::<LittleEndian>(0).unwrap(); // MinCount
    words.write_u32::<LittleEndian>(0).unwrap(); // MaxCountHigh
    words.write_u16::<LittleEndian>(0).unwrap(); // Remaining

    build_request(command::READ_ANDX, tid, uid, mid, &words, &[])
}

/// Data out of a READ_ANDX response.
pub fn read_data(rsp: &[u8]) -> Vec<u8> {
    let words = words_of(rsp);
    let len = LittleEndian::read_u16(&words[10..12]) as usize;
    let offset = LittleEndian::read_u16(&words[12..14]) as usize;
    rsp[offset..offset + len].to_vec()
}

pub fn close_req(mid: u16, tid: u16, uid: u16, fid: u16) -> Vec<u8> {
    let mut words = Vec::with_capacity(6);
    words.write_u16::<LittleEndian>(fid).unwrap();
    words.write_u32::<LittleEndian>(0).unwrap();
    build_request(command::CLOSE, tid, uid, mid, &words, &[])
}

pub fn logoff_req(mid: u16, uid: u16) -> Vec<u8> {
    build_request(command::LOGOFF_ANDX, 0, uid, mid, &[0xFF, 0, 0, 0], &[])
}

pub fn echo_req(mid: u16, count: u16, payload: &[u8]) -> Vec<u8> {
    build_request(
        command::ECHO,
        0,
        0,
        mid,
        &count.to_le_bytes(),
        payload,
    )
}

pub fn nt_cancel_req(mid: u16, uid: u16) -> Vec<u8> {
    build_request(command::NT_CANCEL, 0, uid, mid, &[], &[])
}

pub fn locking_req(
    mid: u16,
    tid: u16,
    uid: u16,
    fid: u16,
    locktype: u8,
    timeout: u32,
    unlocks: &[(u16, u32, u32)],
    locks: &[(u16, u32, u32)],
) -> Vec<u8> {
    let mut words = Vec::with_capacity(16);
    words.extend_from_slice(&[0xFF, 0, 0, 0]);
    words.write_u16::<LittleEndian>(fid).unwrap();
    words.push(locktype);
    words.push(0); // OplockLevel
    words.write_u32::<LittleEndian>(timeout).unwrap();
    words
        .write_u16::<LittleEndian>(unlocks.len() as u16)
        .unwrap();
    words.write_u16::<LittleEndian>(locks.len() as u16).unwrap();

    let mut data = Vec::new();
    for (pid, offset, len) in unlocks.iter().chain(locks.iter()) {
        data.write_u16::<LittleEndian>(*pid).unwrap();
        data.write_u32::<LittleEndian>(*offset).unwrap();
        data.write_u32::<LittleEndian>(*len).unwrap();
    }
    build_request(command::LOCKING_ANDX, tid, uid, mid, &words, &data)
}

pub fn trans2_req(
    mid: u16,
    tid: u16,
    uid: u16,
    sub_command: u16,
    params: &[u8],
    data: &[u8],
) -> Vec<u8> {
    // Fixed layout: words end at 63, byte section at 65, params at 68.
    let param_offset = 68usize;
    let data_offset = (param_offset + params.len() + 3) & !3;

    let mut words = Vec::with_capacity(30);
    words
        .write_u16::<LittleEndian>(params.len() as u16)
        .unwrap(); // TotalParameterCount
    words.write_u16::<LittleEndian>(data.len() as u16).unwrap(); // TotalDataCount
    words.write_u16::<LittleEndian>(64).unwrap(); // MaxParameterCount
    words.write_u16::<LittleEndian>(16384).unwrap(); // MaxDataCount
    words.push(0); // MaxSetupCount
    words.push(0); // Reserved
    words.write_u16::<LittleEndian>(0).unwrap(); // Flags
    words.write_u32::<LittleEndian>(0).unwrap(); // Timeout
    words.write_u16::<LittleEndian>(0).unwrap(); // Reserved2
    words
        .write_u16::<LittleEndian>(params.len() as u16)
        .unwrap(); // ParameterCount
    words
        .write_u16::<LittleEndian>(param_offset as u16)
        .unwrap();
    words.write_u16::<LittleEndian>(data.len() as u16).unwrap(); // DataCount
    words.write_u16::<LittleEndian>(data_offset as u16).unwrap();
    words.push(1); // SetupCount
    words.push(0); // Reserved3
    words.write_u16::<LittleEndian>(sub_command).unwrap();

    let mut body = vec![0u8; 3]; // pad 65 -> 68
    body.extend_from_slice(params);
    body.resize(body.len() + (data_offset - param_offset - params.len()), 0);
    body.extend_from_slice(data);

    build_request(command::TRANSACTION2, tid, uid, mid, &words, &body)
}

/// Parameter and data sections of a TRANS2 response.
pub fn trans2_rsp_sections(rsp: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let words = words_of(rsp);
    let param_count = LittleEndian::read_u16(&words[6..8]) as usize;
    let param_offset = LittleEndian::read_u16(&words[8..10]) as usize;
    let data_count = LittleEndian::read_u16(&words[12..14]) as usize;
    let data_offset = LittleEndian::read_u16(&words[14..16]) as usize;
    (
        rsp[param_offset..param_offset + param_count].to_vec(),
        rsp[data_offset..data_offset + data_count].to_vec(),
    )
}
