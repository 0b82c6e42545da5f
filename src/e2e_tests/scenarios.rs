//! Protocol scenario tests.

use super::helpers::*;
use crate::error::NtStatus;
use crate::protocol::constants::{
    command, create_action, disposition, find_level, security_mode, trans2,
};
use crate::protocol::header::SmbHeader;
use crate::protocol::{codec, constants};
use byteorder::{ByteOrder, LittleEndian};

#[tokio::test]
async fn test_negotiate_then_setup_then_tree() {
    let rig = TestRig::new();

    // Negotiate picks NT LM 0.12 from the listed dialects
    let rsp = rig.roundtrip(negotiate_req(rig.mid())).await;
    assert_eq!(status_of(&rsp), 0);
    let words = words_of(&rsp);
    assert_eq!(words.len(), 34, "17 parameter words");
    assert_eq!(LittleEndian::read_u16(&words[0..2]), 1, "dialect index");
    // user security + encrypted passwords; signing disabled in this rig
    assert_eq!(
        words[2],
        security_mode::USER_SECURITY | security_mode::ENCRYPT_PASSWORDS
    );
    assert_eq!(LittleEndian::read_u16(&words[3..5]), 1, "MaxMpxCount");
    let challenge_len = words[33];
    assert_eq!(challenge_len, 8);
    let data = data_of(&rsp);
    assert_eq!(data.len(), 8, "8 random challenge bytes");
    let mut challenge = [0u8; 8];
    challenge.copy_from_slice(data);

    // Session setup mints a UID and terminates its AndX chain
    let rsp = rig
        .roundtrip(session_setup_req(
            rig.mid(),
            TEST_USER,
            TEST_PASSWORD,
            &challenge,
        ))
        .await;
    assert_eq!(status_of(&rsp), 0);
    let hdr = SmbHeader::parse(&rsp).unwrap();
    assert_ne!(hdr.uid, 0);
    let words = words_of(&rsp);
    assert_eq!(words[0], constants::NO_MORE_ANDX_COMMAND);

    // Tree connect resolves the share writable and reports a disk service
    let rsp = rig
        .roundtrip(tree_connect_req(rig.mid(), hdr.uid, "\\\\srv\\share"))
        .await;
    assert_eq!(status_of(&rsp), 0);
    let tree_hdr = SmbHeader::parse(&rsp).unwrap();
    assert_ne!(tree_hdr.tid, 0);
    let data = data_of(&rsp);
    assert!(data.starts_with(b"A:\0"), "disk service string");
}

#[tokio::test]
async fn test_wrong_password_fails_logon() {
    let rig = TestRig::new();
    let challenge = rig.negotiate().await;
    let rsp = rig
        .roundtrip(session_setup_req(rig.mid(), TEST_USER, "wrong", &challenge))
        .await;
    assert_eq!(status_of(&rsp), NtStatus::LogonFailure as u32);
}

#[tokio::test]
async fn test_unknown_share_is_bad_network_name() {
    let rig = TestRig::new();
    let challenge = rig.negotiate().await;
    let uid = rig.session_setup(challenge).await;
    let rsp = rig
        .roundtrip(tree_connect_req(rig.mid(), uid, "\\\\srv\\nope"))
        .await;
    assert_eq!(status_of(&rsp), NtStatus::BadNetworkName as u32);
}

#[tokio::test]
async fn test_create_write_read_close_round_trip() {
    let rig = TestRig::new();
    let (uid, tid) = rig.establish().await;

    // OPEN_IF on an absent file creates it
    let rsp = rig
        .roundtrip(nt_create_req(
            rig.mid(),
            tid,
            uid,
            "\\file.txt",
            0x1000_0000, // GENERIC_ALL
            disposition::OPEN_IF,
            0,
        ))
        .await;
    assert_eq!(status_of(&rsp), 0);
    let fid = created_fid(&rsp);
    assert_ne!(fid, 0);
    assert_eq!(created_action(&rsp), create_action::CREATED);

    // Write five bytes at offset zero
    let rsp = rig
        .roundtrip(write_andx_req(rig.mid(), tid, uid, fid, 0, b"HELLO"))
        .await;
    assert_eq!(status_of(&rsp), 0);
    assert_eq!(written_count(&rsp), 5);

    // Read them back
    let rsp = rig
        .roundtrip(read_andx_req(rig.mid(), tid, uid, fid, 0, 16))
        .await;
    assert_eq!(status_of(&rsp), 0);
    assert_eq!(read_data(&rsp), b"HELLO");

    // Close, then the FID is dead
    let rsp = rig.roundtrip(close_req(rig.mid(), tid, uid, fid)).await;
    assert_eq!(status_of(&rsp), 0);
    let rsp = rig
        .roundtrip(read_andx_req(rig.mid(), tid, uid, fid, 0, 16))
        .await;
    assert_eq!(status_of(&rsp), NtStatus::InvalidHandle as u32);
}

#[tokio::test]
async fn test_create_disposition_matrix() {
    let rig = TestRig::new();
    let (uid, tid) = rig.establish().await;

    // CREATE on an absent file succeeds
    let rsp = rig
        .roundtrip(nt_create_req(
            rig.mid(),
            tid,
            uid,
            "\\a.txt",
            0x1000_0000,
            disposition::CREATE,
            0,
        ))
        .await;
    assert_eq!(status_of(&rsp), 0);
    let fid = created_fid(&rsp);
    rig.roundtrip(close_req(rig.mid(), tid, uid, fid)).await;

    // CREATE on a present file collides
    let rsp = rig
        .roundtrip(nt_create_req(
            rig.mid(),
            tid,
            uid,
            "\\a.txt",
            0x1000_0000,
            disposition::CREATE,
            0,
        ))
        .await;
    assert_eq!(status_of(&rsp), NtStatus::ObjectNameCollision as u32);

    // OPEN on an absent file is not found
    let rsp = rig
        .roundtrip(nt_create_req(
            rig.mid(),
            tid,
            uid,
            "\\absent.txt",
            0x8000_0000,
            disposition::OPEN,
            0,
        ))
        .await;
    assert_eq!(status_of(&rsp), NtStatus::ObjectNameNotFound as u32);

    // OVERWRITE_IF truncates the existing file
    std::fs::write(rig.dir.path().join("a.txt"), b"previous-content").unwrap();
    let rsp = rig
        .roundtrip(nt_create_req(
            rig.mid(),
            tid,
            uid,
            "\\a.txt",
            0x1000_0000,
            disposition::OVERWRITE_IF,
            0,
        ))
        .await;
    assert_eq!(status_of(&rsp), 0);
    assert_eq!(created_action(&rsp), create_action::OVERWRITTEN);
    assert_eq!(std::fs::metadata(rig.dir.path().join("a.txt")).unwrap().len(), 0);
}

#[tokio::test]
async fn test_write_refused_on_read_only_share() {
    let rig = TestRig::with_share_tweak(|share| share.read_only = true);
    let (uid, tid) = rig.establish().await;

    // Creating a file on a read-only tree is refused outright
    let rsp = rig
        .roundtrip(nt_create_req(
            rig.mid(),
            tid,
            uid,
            "\\new.txt",
            0x4000_0000, // GENERIC_WRITE
            disposition::OPEN_IF,
            0,
        ))
        .await;
    assert_eq!(status_of(&rsp), NtStatus::AccessDenied as u32);

    // Reading existing content still works
    std::fs::write(rig.dir.path().join("ro.txt"), b"data").unwrap();
    let rsp = rig
        .roundtrip(nt_create_req(
            rig.mid(),
            tid,
            uid,
            "\\ro.txt",
            0x8000_0000, // GENERIC_READ
            disposition::OPEN,
            0,
        ))
        .await;
    assert_eq!(status_of(&rsp), 0);
    let fid = created_fid(&rsp);
    let rsp = rig
        .roundtrip(read_andx_req(rig.mid(), tid, uid, fid, 0, 16))
        .await;
    assert_eq!(read_data(&rsp), b"data");
}

#[tokio::test]
async fn test_delete_on_close_across_two_handles() {
    let rig = TestRig::new();
    let (uid, tid) = rig.establish().await;
    std::fs::write(rig.dir.path().join("doomed.txt"), b"x").unwrap();

    let open = |mid| {
        nt_create_req(
            mid,
            tid,
            uid,
            "\\doomed.txt",
            0x1000_0000,
            disposition::OPEN,
            0,
        )
    };
    let rsp = rig.roundtrip(open(rig.mid())).await;
    let fid1 = created_fid(&rsp);
    let rsp = rig.roundtrip(open(rig.mid())).await;
    let fid2 = created_fid(&rsp);
    assert_ne!(fid1, fid2);

    // SET_FILE_INFORMATION disposition: DeletePending=1 on the first handle
    let mut params = Vec::new();
    params.extend_from_slice(&fid1.to_le_bytes());
    params.extend_from_slice(&0x0102u16.to_le_bytes());
    params.extend_from_slice(&0u16.to_le_bytes());
    let rsp = rig
        .roundtrip(trans2_req(
            rig.mid(),
            tid,
            uid,
            trans2::SET_FILE_INFORMATION,
            &params,
            &[1],
        ))
        .await;
    assert_eq!(status_of(&rsp), 0);

    // First close: the file must survive while the second handle lives
    rig.roundtrip(close_req(rig.mid(), tid, uid, fid1)).await;
    assert!(rig.dir.path().join("doomed.txt").exists());

    // Second close unlinks at the moment the last open goes away
    rig.roundtrip(close_req(rig.mid(), tid, uid, fid2)).await;
    assert!(!rig.dir.path().join("doomed.txt").exists());
}

fn find_first_req(mid: u16, tid: u16, uid: u16, pattern: &str, count: u16, level: u16) -> Vec<u8> {
    let mut params = Vec::new();
    params.extend_from_slice(&0x0016u16.to_le_bytes()); // SearchAttributes
    params.extend_from_slice(&count.to_le_bytes());
    params.extend_from_slice(&0u16.to_le_bytes()); // Flags: keep handle open
    params.extend_from_slice(&level.to_le_bytes());
    params.extend_from_slice(&0u32.to_le_bytes()); // SearchStorageType
    params.extend_from_slice(&codec::encode_utf16le_null(pattern));
    trans2_req(mid, tid, uid, trans2::FIND_FIRST, &params, &[])
}

fn find_next_req(mid: u16, tid: u16, uid: u16, sid: u16, count: u16, level: u16) -> Vec<u8> {
    let mut params = Vec::new();
    params.extend_from_slice(&sid.to_le_bytes());
    params.extend_from_slice(&count.to_le_bytes());
    params.extend_from_slice(&level.to_le_bytes());
    params.extend_from_slice(&0u32.to_le_bytes()); // ResumeKey
    params.extend_from_slice(&0u16.to_le_bytes()); // Flags
    params.extend_from_slice(&codec::encode_utf16le_null("")); // ResumeFileName
    trans2_req(mid, tid, uid, trans2::FIND_NEXT, &params, &[])
}

/// Decode the file names out of a BOTH_DIRECTORY_INFO entry list.
fn both_info_names(data: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let next = LittleEndian::read_u32(&data[pos..pos + 4]) as usize;
        let name_len = LittleEndian::read_u32(&data[pos + 60..pos + 64]) as usize;
        names.push(codec::decode_utf16le(&data[pos + 94..pos + 94 + name_len]).unwrap());
        if next == 0 {
            break;
        }
        pos += next;
    }
    names
}

#[tokio::test]
async fn test_find_first_pattern_and_continuation() {
    let rig = TestRig::new();
    let (uid, tid) = rig.establish().await;
    for name in ["A.TXT", "B.TXT", "C.TXT", "other.doc"] {
        std::fs::write(rig.dir.path().join(name), b"x").unwrap();
    }

    // First batch: two of the three matching entries
    let rsp = rig
        .roundtrip(find_first_req(
            rig.mid(),
            tid,
            uid,
            "\\*.TXT",
            2,
            find_level::BOTH_DIRECTORY_INFO,
        ))
        .await;
    assert_eq!(status_of(&rsp), 0);
    let (params, data) = trans2_rsp_sections(&rsp);
    let sid = LittleEndian::read_u16(&params[0..2]);
    let count = LittleEndian::read_u16(&params[2..4]);
    let end_of_search = LittleEndian::read_u16(&params[4..6]);
    let last_name_offset = LittleEndian::read_u16(&params[8..10]);
    assert_eq!(count, 2);
    assert_eq!(end_of_search, 0);
    assert_ne!(last_name_offset, 0, "resume point for the second entry");

    let names = both_info_names(&data);
    assert_eq!(names.len(), 2);
    assert!(names.iter().all(|n| n.to_uppercase().ends_with(".TXT")));

    // Continuation: the remaining entry, no gaps, no repeats
    let rsp = rig
        .roundtrip(find_next_req(
            rig.mid(),
            tid,
            uid,
            sid,
            10,
            find_level::BOTH_DIRECTORY_INFO,
        ))
        .await;
    assert_eq!(status_of(&rsp), 0);
    let (params, data) = trans2_rsp_sections(&rsp);
    let count = LittleEndian::read_u16(&params[0..2]);
    let end_of_search = LittleEndian::read_u16(&params[2..4]);
    assert_eq!(count, 1);
    assert_eq!(end_of_search, 1);
    let more = both_info_names(&data);
    assert_eq!(more.len(), 1);
    assert!(!names.contains(&more[0]), "entry repeated across batches");

    // Drained search reports no more files
    let rsp = rig
        .roundtrip(find_next_req(
            rig.mid(),
            tid,
            uid,
            sid,
            10,
            find_level::BOTH_DIRECTORY_INFO,
        ))
        .await;
    assert_eq!(status_of(&rsp), NtStatus::NoMoreFiles as u32);
}

#[tokio::test]
async fn test_lock_conflict_between_handles() {
    let rig = TestRig::new();
    let (uid, tid) = rig.establish().await;
    std::fs::write(rig.dir.path().join("locked.txt"), b"0123456789abcdef").unwrap();

    let open = |mid| {
        nt_create_req(
            mid,
            tid,
            uid,
            "\\locked.txt",
            0x1000_0000,
            disposition::OPEN,
            0,
        )
    };
    let fid1 = created_fid(&rig.roundtrip(open(rig.mid())).await);
    let fid2 = created_fid(&rig.roundtrip(open(rig.mid())).await);

    // Exclusive lock [0, 9] on the first handle
    let rsp = rig
        .roundtrip(locking_req(
            rig.mid(),
            tid,
            uid,
            fid1,
            0,
            0,
            &[],
            &[(1, 0, 10)],
        ))
        .await;
    assert_eq!(status_of(&rsp), 0);

    // A read through the other handle inside the range conflicts
    let rsp = rig
        .roundtrip(read_andx_req(rig.mid(), tid, uid, fid2, 5, 2))
        .await;
    assert_eq!(status_of(&rsp), NtStatus::FileLockConflict as u32);

    // Outside the range reads fine
    let rsp = rig
        .roundtrip(read_andx_req(rig.mid(), tid, uid, fid2, 10, 4))
        .await;
    assert_eq!(status_of(&rsp), 0);

    // Unlock, then the same read succeeds
    let rsp = rig
        .roundtrip(locking_req(
            rig.mid(),
            tid,
            uid,
            fid1,
            0,
            0,
            &[(1, 0, 10)],
            &[],
        ))
        .await;
    assert_eq!(status_of(&rsp), 0);
    let rsp = rig
        .roundtrip(read_andx_req(rig.mid(), tid, uid, fid2, 5, 2))
        .await;
    assert_eq!(status_of(&rsp), 0);
}

#[tokio::test]
async fn test_nt_cancel_of_unknown_mid_is_noop() {
    let rig = TestRig::new();
    let (uid, _tid) = rig.establish().await;
    // Cancel never carries a response, and an unknown MID changes nothing
    let responses = rig.conn.process(&nt_cancel_req(9999, uid)).await;
    assert!(responses.is_empty());
}

#[tokio::test]
async fn test_echo_multi_response() {
    let rig = TestRig::new();
    let responses = rig.conn.process(&echo_req(rig.mid(), 3, b"ping")).await;
    assert_eq!(responses.len(), 3);
    for (i, rsp) in responses.iter().enumerate() {
        assert_eq!(status_of(rsp), 0);
        let words = words_of(rsp);
        assert_eq!(LittleEndian::read_u16(&words[0..2]) as usize, i + 1);
        assert_eq!(data_of(rsp), b"ping");
    }
}

#[tokio::test]
async fn test_logoff_invalidates_fids() {
    let rig = TestRig::new();
    let (uid, tid) = rig.establish().await;

    let rsp = rig
        .roundtrip(nt_create_req(
            rig.mid(),
            tid,
            uid,
            "\\f.txt",
            0x1000_0000,
            disposition::OPEN_IF,
            0,
        ))
        .await;
    let fid = created_fid(&rsp);

    let rsp = rig.roundtrip(logoff_req(rig.mid(), uid)).await;
    assert_eq!(status_of(&rsp), 0);

    // The session is gone; quoting the old FID cannot reach a file
    let rsp = rig
        .roundtrip(read_andx_req(rig.mid(), tid, uid, fid, 0, 4))
        .await;
    assert_ne!(status_of(&rsp), 0);
}

#[tokio::test]
async fn test_andx_chain_setup_then_tree_connect() {
    let rig = TestRig::new();
    let challenge = rig.negotiate().await;

    // Chain TREE_CONNECT_ANDX behind SESSION_SETUP_ANDX in one request
    let mut setup = session_setup_req(rig.mid(), TEST_USER, TEST_PASSWORD, &challenge);
    let chain_offset = setup.len() as u16;
    // Patch the AndX command + offset inside the setup words
    setup[33] = command::TREE_CONNECT_ANDX;
    setup[35..37].copy_from_slice(&chain_offset.to_le_bytes());

    // Append the tree connect block: wct, words, bcc, data
    let mut tc_words = Vec::new();
    tc_words.extend_from_slice(&[0xFF, 0, 0, 0]);
    tc_words.extend_from_slice(&0u16.to_le_bytes()); // Flags
    tc_words.extend_from_slice(&1u16.to_le_bytes()); // PasswordLength
    let mut tc_data = vec![0u8];
    let abs = setup.len() + 1 + tc_words.len() + 2 + tc_data.len();
    if abs % 2 == 1 {
        tc_data.push(0);
    }
    tc_data.extend_from_slice(&codec::encode_utf16le_null("\\\\srv\\share"));
    tc_data.extend_from_slice(b"?????\0");

    setup.push((tc_words.len() / 2) as u8);
    setup.extend_from_slice(&tc_words);
    setup.extend_from_slice(&(tc_data.len() as u16).to_le_bytes());
    setup.extend_from_slice(&tc_data);

    let rsp = rig.roundtrip(setup).await;
    assert_eq!(status_of(&rsp), 0);
    let hdr = SmbHeader::parse(&rsp).unwrap();
    assert_ne!(hdr.uid, 0);
    assert_ne!(hdr.tid, 0, "chained tree connect assigned a TID");

    // The chained response walks to a terminated AndX block
    let words = words_of(&rsp);
    let next_cmd = words[0];
    let next_off = LittleEndian::read_u16(&words[2..4]) as usize;
    assert_eq!(next_cmd, command::TREE_CONNECT_ANDX);
    assert!(next_off > 32 && next_off < rsp.len());
    assert_eq!(rsp[next_off + 1], constants::NO_MORE_ANDX_COMMAND);
}

#[tokio::test]
async fn test_query_path_info_basic_level() {
    let rig = TestRig::new();
    let (uid, tid) = rig.establish().await;
    std::fs::write(rig.dir.path().join("q.txt"), b"12345").unwrap();

    let mut params = Vec::new();
    params.extend_from_slice(&0x0101u16.to_le_bytes()); // QUERY_FILE_BASIC_INFO
    params.extend_from_slice(&0u32.to_le_bytes());
    params.extend_from_slice(&codec::encode_utf16le_null("\\q.txt"));
    let rsp = rig
        .roundtrip(trans2_req(
            rig.mid(),
            tid,
            uid,
            trans2::QUERY_PATH_INFORMATION,
            &params,
            &[],
        ))
        .await;
    assert_eq!(status_of(&rsp), 0);
    let (_, data) = trans2_rsp_sections(&rsp);
    assert_eq!(data.len(), 40);
    // All four times are plausible FILETIME values past the NT epoch
    for field in data[..32].chunks_exact(8) {
        assert!(LittleEndian::read_u64(field) > codec::NT_EPOCH_OFFSET);
    }
}

#[tokio::test]
async fn test_mkdir_checkdir_rmdir_flow() {
    let rig = TestRig::new();
    let (uid, tid) = rig.establish().await;

    let name_block = |name: &str, base: usize| {
        let mut data = vec![0x04u8];
        if (base + 1) % 2 == 1 {
            data.push(0);
        }
        data.extend_from_slice(&codec::encode_utf16le_null(name));
        data
    };

    // MKDIR
    let data = name_block("\\newdir", 35);
    let rsp = rig
        .roundtrip(build_request(
            command::CREATE_DIRECTORY,
            tid,
            uid,
            rig.mid(),
            &[],
            &data,
        ))
        .await;
    assert_eq!(status_of(&rsp), 0);
    assert!(rig.dir.path().join("newdir").is_dir());

    // CHECKDIR on the new directory succeeds
    let rsp = rig
        .roundtrip(build_request(
            command::CHECK_DIRECTORY,
            tid,
            uid,
            rig.mid(),
            &[],
            &data,
        ))
        .await;
    assert_eq!(status_of(&rsp), 0);

    // CHECKDIR on a missing leaf is not-found
    let missing = name_block("\\missing", 35);
    let rsp = rig
        .roundtrip(build_request(
            command::CHECK_DIRECTORY,
            tid,
            uid,
            rig.mid(),
            &[],
            &missing,
        ))
        .await;
    assert_eq!(status_of(&rsp), NtStatus::ObjectNameNotFound as u32);

    // RMDIR
    let rsp = rig
        .roundtrip(build_request(
            command::DELETE_DIRECTORY,
            tid,
            uid,
            rig.mid(),
            &[],
            &data,
        ))
        .await;
    assert_eq!(status_of(&rsp), 0);
    assert!(!rig.dir.path().join("newdir").exists());
}

#[tokio::test]
async fn test_rename_updates_open_handles() {
    let rig = TestRig::new();
    let (uid, tid) = rig.establish().await;
    std::fs::write(rig.dir.path().join("old.txt"), b"content").unwrap();

    let rsp = rig
        .roundtrip(nt_create_req(
            rig.mid(),
            tid,
            uid,
            "\\old.txt",
            0x1000_0000,
            disposition::OPEN,
            0,
        ))
        .await;
    let fid = created_fid(&rsp);

    // RENAME \old.txt -> \new.txt
    let mut data = vec![0x04u8];
    let mut abs = 32 + 1 + 2 + 2 + data.len();
    if abs % 2 == 1 {
        data.push(0);
    }
    data.extend_from_slice(&codec::encode_utf16le_null("\\old.txt"));
    data.push(0x04);
    abs = 32 + 1 + 2 + 2 + data.len();
    if abs % 2 == 1 {
        data.push(0);
    }
    data.extend_from_slice(&codec::encode_utf16le_null("\\new.txt"));
    let rsp = rig
        .roundtrip(build_request(
            command::RENAME,
            tid,
            uid,
            rig.mid(),
            &0u16.to_le_bytes(),
            &data,
        ))
        .await;
    assert_eq!(status_of(&rsp), 0);
    assert!(!rig.dir.path().join("old.txt").exists());
    assert!(rig.dir.path().join("new.txt").exists());

    // The open handle still reads the renamed file
    let rsp = rig
        .roundtrip(read_andx_req(rig.mid(), tid, uid, fid, 0, 16))
        .await;
    assert_eq!(read_data(&rsp), b"content");
}

#[tokio::test]
async fn test_zero_byte_read_succeeds_empty() {
    let rig = TestRig::new();
    let (uid, tid) = rig.establish().await;
    std::fs::write(rig.dir.path().join("z.txt"), b"abc").unwrap();

    let rsp = rig
        .roundtrip(nt_create_req(
            rig.mid(),
            tid,
            uid,
            "\\z.txt",
            0x8000_0000,
            disposition::OPEN,
            0,
        ))
        .await;
    let fid = created_fid(&rsp);
    let rsp = rig
        .roundtrip(read_andx_req(rig.mid(), tid, uid, fid, 1, 0))
        .await;
    assert_eq!(status_of(&rsp), 0);
    assert_eq!(read_data(&rsp), b"");
}
