//! TRANSACTION2 envelope and sub-command handlers: directory searches,
//! filesystem information, and path/file information levels.

use crate::error::{Error, NtStatus, Result};
use crate::protocol::codec;
use crate::protocol::constants::{
    disposition, fs_level, query_level, set_level, trans2, AccessMask, FileAttributes,
};
use crate::protocol::header::{ReplyBuf, Request, SmbHeader};
use crate::security::{
    PosixAcl, SecurityDescriptor, DACL_SECINFO, GROUP_SECINFO, OWNER_SECINFO,
};
use crate::server::connection::{open_install, write_trans_rsp, Chained, Connection};
use crate::server::enumeration::{emit_next_batch, write_unix_basic, EmitParams};
use crate::server::file::{close_file, FileRef};
use crate::server::mft::MasterFlags;
use crate::vfs::{SetAttrs, UnixStat, Vfs, XATTR_SIZE_MAX};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, trace};

/// Search-flag bits of FIND_FIRST / FIND_NEXT
mod find_flags {
    pub const CLOSE_AFTER_REQUEST: u16 = 0x0001;
    pub const CLOSE_AT_END_OF_SEARCH: u16 = 0x0002;
}

/// Byte ceiling for one search response
const MAX_SEARCH_BUFFER: usize = 16384;

/// Value meaning "leave unchanged" in UNIX_BASIC set requests
const UNIX_NO_CHANGE: u64 = u64::MAX;

/// Parsed TRANSACTION2 envelope
struct Trans2Request<'a> {
    sub_command: u16,
    params: &'a [u8],
    data: &'a [u8],
}

fn parse_trans2<'a>(req: &Request<'a>, block: usize) -> Result<Trans2Request<'a>> {
    let w = req.words(block)?;
    if w.len() < 30 {
        return Err(Error::Malformed("short trans2".to_string()));
    }
    let param_count = LittleEndian::read_u16(&w[18..20]) as usize;
    let param_offset = LittleEndian::read_u16(&w[20..22]) as usize;
    let data_count = LittleEndian::read_u16(&w[22..24]) as usize;
    let data_offset = LittleEndian::read_u16(&w[24..26]) as usize;
    let setup_count = w[26] as usize;
    if setup_count < 1 || w.len() < 28 + setup_count * 2 {
        return Err(Error::Malformed("trans2 setup truncated".to_string()));
    }
    let sub_command = LittleEndian::read_u16(&w[28..30]);

    Ok(Trans2Request {
        sub_command,
        params: req.from_offset(param_offset, param_count)?,
        data: req.from_offset(data_offset, data_count)?,
    })
}

/// Route one TRANSACTION2 request.
pub(crate) async fn handle_trans2(
    conn: &Connection,
    req: &Request<'_>,
    hdr: &SmbHeader,
    block: usize,
    reply: &mut ReplyBuf,
) -> Result<Chained> {
    let t2 = parse_trans2(req, block)?;
    trace!(sub = t2.sub_command, "trans2");

    match t2.sub_command {
        trans2::FIND_FIRST => find_first(conn, hdr, &t2, reply).await,
        trans2::FIND_NEXT => find_next(conn, hdr, &t2, reply).await,
        trans2::QUERY_FS_INFORMATION => query_fs_info(conn, hdr, &t2, reply).await,
        trans2::SET_FS_INFORMATION => set_fs_info(conn, hdr, &t2, reply).await,
        trans2::QUERY_PATH_INFORMATION => query_path_info(conn, hdr, &t2, reply).await,
        trans2::QUERY_FILE_INFORMATION => query_file_info(conn, hdr, &t2, reply).await,
        trans2::SET_PATH_INFORMATION => set_path_info(conn, hdr, &t2, reply).await,
        trans2::SET_FILE_INFORMATION => set_file_info(conn, hdr, &t2, reply).await,
        trans2::CREATE_DIRECTORY => create_directory(conn, hdr, &t2, reply).await,
        trans2::GET_DFS_REFERRAL => {
            Err(Error::NotImplemented("DFS referrals".to_string()))
        }
        other => Err(Error::NotImplemented(format!("trans2 sub 0x{:x}", other))),
    }
}

// ----- directory search -----

async fn find_first(
    conn: &Connection,
    hdr: &SmbHeader,
    t2: &Trans2Request<'_>,
    reply: &mut ReplyBuf,
) -> Result<Chained> {
    if t2.params.len() < 12 {
        return Err(Error::Malformed("short find first".to_string()));
    }
    let search_count = LittleEndian::read_u16(&t2.params[2..4]) as usize;
    let flags = LittleEndian::read_u16(&t2.params[4..6]);
    let info_level = LittleEndian::read_u16(&t2.params[6..8]);
    let (file_name, _) = codec::read_wire_name(t2.params, 12, 12, hdr.is_unicode())?;
    debug!(%file_name, info_level, search_count, "find first");

    let (dir_part, pattern) = codec::split_wildcard(&file_name);

    let mut st = conn.state.lock().await;
    let sess = st
        .session
        .as_mut()
        .ok_or_else(|| Error::AccessDenied("no authenticated session".to_string()))?;
    let tree = sess.tree(hdr.tid)?.clone();
    let vfs = tree.vfs()?.clone();

    // Without a trailing wildcard the path may name a directory to list in
    // full, or a single file to search for by name.
    let (dir_wire, pattern, single) = match pattern {
        Some(p) => (dir_part, Some(p), false),
        None => {
            let full = vfs.resolve(&dir_part)?;
            match vfs.stat(&full) {
                Ok(stat) if stat.is_dir() => (dir_part, None, false),
                _ => match dir_part.rsplit_once('/') {
                    Some((dir, leaf)) => (dir.to_string(), Some(leaf.to_string()), true),
                    None => (String::new(), Some(dir_part), true),
                },
            }
        }
    };

    let (dir_fp, _, _) = open_install(
        sess,
        &tree,
        &conn.server.mft,
        &vfs,
        &dir_wire,
        AccessMask::GENERIC_READ,
        disposition::OPEN,
        true,
        false,
    )?;
    let sid = dir_fp.fid;
    drop(st);

    let result = emit_next_batch(
        &dir_fp,
        &EmitParams {
            info_level,
            pattern: pattern.as_deref(),
            single,
            max_bytes: MAX_SEARCH_BUFFER,
            max_entries: search_count.max(1),
            store_dos_attr: tree.share.store_dos_attr,
        },
    )?;

    if single && result.entries == 0 {
        let mut st = conn.state.lock().await;
        if let Some(sess) = st.session.as_mut() {
            let _ = close_file(&sess.files, &conn.server.mft, sid).await;
        }
        reply.set_status(NtStatus::NoSuchFile);
        reply.block(&[], &[]);
        return Ok(Chained::Done);
    }

    let ended = result.ended || single;
    let close_now =
        flags & find_flags::CLOSE_AFTER_REQUEST != 0
            || (ended && flags & find_flags::CLOSE_AT_END_OF_SEARCH != 0);
    if close_now {
        let mut st = conn.state.lock().await;
        if let Some(sess) = st.session.as_mut() {
            let _ = close_file(&sess.files, &conn.server.mft, sid).await;
        }
    }

    let mut params = Vec::with_capacity(10);
    params.write_u16::<LittleEndian>(sid)?;
    params.write_u16::<LittleEndian>(result.entries)?;
    params.write_u16::<LittleEndian>(ended as u16)?;
    params.write_u16::<LittleEndian>(0)?; // EAErrorOffset
    params.write_u16::<LittleEndian>(if ended {
        0
    } else {
        result.last_name_offset as u16
    })?;

    write_trans_rsp(reply, &params, &result.data);
    Ok(Chained::Done)
}

async fn find_next(
    conn: &Connection,
    hdr: &SmbHeader,
    t2: &Trans2Request<'_>,
    reply: &mut ReplyBuf,
) -> Result<Chained> {
    if t2.params.len() < 12 {
        return Err(Error::Malformed("short find next".to_string()));
    }
    let sid = LittleEndian::read_u16(&t2.params[0..2]);
    let search_count = LittleEndian::read_u16(&t2.params[2..4]) as usize;
    let info_level = LittleEndian::read_u16(&t2.params[4..6]);
    let flags = LittleEndian::read_u16(&t2.params[10..12]);
    debug!(sid, info_level, search_count, "find next");

    let st = conn.state.lock().await;
    let sess = st
        .session
        .as_ref()
        .ok_or_else(|| Error::AccessDenied("no authenticated session".to_string()))?;
    let tree = sess.tree(hdr.tid)?.clone();
    let dir_fp = sess
        .files
        .get(sid)
        .ok_or(Error::InvalidHandle(sid as u64))?;
    drop(st);

    let result = emit_next_batch(
        &dir_fp,
        &EmitParams {
            info_level,
            pattern: None,
            single: false,
            max_bytes: MAX_SEARCH_BUFFER,
            max_entries: search_count.max(1),
            store_dos_attr: tree.share.store_dos_attr,
        },
    )?;
    drop(dir_fp);

    if result.entries == 0 && result.ended {
        reply.set_status(NtStatus::NoMoreFiles);
    }

    let close_now = flags & find_flags::CLOSE_AFTER_REQUEST != 0
        || (result.ended && flags & find_flags::CLOSE_AT_END_OF_SEARCH != 0);
    if close_now {
        let mut st = conn.state.lock().await;
        if let Some(sess) = st.session.as_mut() {
            let _ = close_file(&sess.files, &conn.server.mft, sid).await;
        }
    }

    let mut params = Vec::with_capacity(8);
    params.write_u16::<LittleEndian>(result.entries)?;
    params.write_u16::<LittleEndian>(result.ended as u16)?;
    params.write_u16::<LittleEndian>(0)?; // EAErrorOffset
    params.write_u16::<LittleEndian>(if result.ended {
        0
    } else {
        result.last_name_offset as u16
    })?;

    write_trans_rsp(reply, &params, &result.data);
    Ok(Chained::Done)
}

// ----- filesystem information -----

async fn query_fs_info(
    conn: &Connection,
    hdr: &SmbHeader,
    t2: &Trans2Request<'_>,
    reply: &mut ReplyBuf,
) -> Result<Chained> {
    if t2.params.len() < 2 {
        return Err(Error::Malformed("short query fs info".to_string()));
    }
    let level = LittleEndian::read_u16(&t2.params[0..2]);
    debug!(level, "query fs info");

    let (vfs, _) = conn.tree_vfs(hdr.tid).await?;
    let fs = vfs.statfs(vfs.root())?;
    let root_stat = vfs.stat(vfs.root())?;

    let mut data = Vec::with_capacity(64);
    match level {
        fs_level::INFO_ALLOCATION => {
            let sectors_per_unit = (fs.block_size / 512).max(1);
            data.write_u32::<LittleEndian>(0)?; // idFileSystem
            data.write_u32::<LittleEndian>(sectors_per_unit as u32)?;
            data.write_u32::<LittleEndian>(fs.total_blocks as u32)?;
            data.write_u32::<LittleEndian>(fs.avail_blocks as u32)?;
            data.write_u16::<LittleEndian>(512)?;
        }
        fs_level::INFO_VOLUME => {
            let label = codec::encode_utf16le("share");
            data.write_u32::<LittleEndian>(root_stat.ino as u32)?; // serial
            data.push((label.len() / 2) as u8);
            data.extend_from_slice(&label);
        }
        fs_level::QUERY_FS_VOLUME_INFO => {
            let label = codec::encode_utf16le("share");
            data.write_u64::<LittleEndian>(root_stat.ctime_nt())?;
            data.write_u32::<LittleEndian>(root_stat.ino as u32)?; // serial
            data.write_u32::<LittleEndian>(label.len() as u32)?;
            data.write_u16::<LittleEndian>(0)?; // reserved
            data.extend_from_slice(&label);
        }
        fs_level::QUERY_FS_SIZE_INFO => {
            let sectors_per_unit = (fs.block_size / 512).max(1);
            data.write_u64::<LittleEndian>(fs.total_blocks)?;
            data.write_u64::<LittleEndian>(fs.avail_blocks)?;
            data.write_u32::<LittleEndian>(sectors_per_unit as u32)?;
            data.write_u32::<LittleEndian>(512)?;
        }
        fs_level::QUERY_FS_DEVICE_INFO => {
            data.write_u32::<LittleEndian>(0x07)?; // FILE_DEVICE_DISK
            data.write_u32::<LittleEndian>(0)?;
        }
        fs_level::QUERY_FS_ATTRIBUTE_INFO => {
            let name = codec::encode_utf16le("NTFS");
            // case-sensitive search + case-preserved names
            data.write_u32::<LittleEndian>(0x0003)?;
            data.write_u32::<LittleEndian>(255)?;
            data.write_u32::<LittleEndian>(name.len() as u32)?;
            data.extend_from_slice(&name);
        }
        fs_level::QUERY_CIFS_UNIX_INFO => {
            data.write_u16::<LittleEndian>(1)?; // major
            data.write_u16::<LittleEndian>(0)?; // minor
            data.write_u64::<LittleEndian>(0)?; // capabilities
        }
        fs_level::QUERY_POSIX_FS_INFO => {
            data.write_u32::<LittleEndian>(fs.block_size as u32)?; // optimal transfer
            data.write_u32::<LittleEndian>(fs.block_size as u32)?;
            data.write_u64::<LittleEndian>(fs.total_blocks)?;
            data.write_u64::<LittleEndian>(fs.free_blocks)?;
            data.write_u64::<LittleEndian>(fs.avail_blocks)?;
            data.write_u64::<LittleEndian>(fs.total_files)?;
            data.write_u64::<LittleEndian>(fs.free_files)?;
            data.write_u64::<LittleEndian>(0)?; // fs identifier
        }
        other => return Err(Error::UnsupportedLevel(other)),
    }

    write_trans_rsp(reply, &[], &data);
    Ok(Chained::Done)
}

async fn set_fs_info(
    conn: &Connection,
    hdr: &SmbHeader,
    t2: &Trans2Request<'_>,
    reply: &mut ReplyBuf,
) -> Result<Chained> {
    if t2.params.len() < 4 {
        return Err(Error::Malformed("short set fs info".to_string()));
    }
    let level = LittleEndian::read_u16(&t2.params[2..4]);
    conn.tree_vfs(hdr.tid).await?;

    match level {
        fs_level::SET_CIFS_UNIX_INFO => {
            if t2.data.len() < 12 {
                return Err(Error::Malformed("short unix info".to_string()));
            }
            let major = LittleEndian::read_u16(&t2.data[0..2]);
            let minor = LittleEndian::read_u16(&t2.data[2..4]);
            let caps = LittleEndian::read_u64(&t2.data[4..12]);
            if major != 1 || minor != 0 {
                return Err(Error::InvalidParameter(format!(
                    "unix extension version {}.{}",
                    major, minor
                )));
            }
            // Client capability bits are accepted but have no server effect.
            debug!(caps, "client unix capabilities");
        }
        other => return Err(Error::UnsupportedLevel(other)),
    }

    write_trans_rsp(reply, &[0, 0], &[]);
    Ok(Chained::Done)
}

// ----- query path / file information -----

/// Target of an info query: a resolved path or an open handle.
enum InfoTarget {
    Path(Arc<Vfs>, PathBuf),
    File(Arc<Vfs>, FileRef),
}

impl InfoTarget {
    fn vfs(&self) -> &Vfs {
        match self {
            InfoTarget::Path(vfs, _) => vfs,
            InfoTarget::File(vfs, _) => vfs,
        }
    }

    fn path(&self) -> PathBuf {
        match self {
            InfoTarget::Path(_, path) => path.clone(),
            InfoTarget::File(_, file) => file.path(),
        }
    }

    fn stat(&self) -> Result<UnixStat> {
        match self {
            InfoTarget::Path(vfs, path) => vfs.stat(path),
            InfoTarget::File(vfs, file) => vfs.fstat(&file.file),
        }
    }

    fn name(&self) -> String {
        self.path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn delete_pending(&self) -> bool {
        match self {
            InfoTarget::Path(_, _) => false,
            InfoTarget::File(_, file) => file
                .master
                .flags()
                .contains(MasterFlags::DELETE_ON_CLOSE),
        }
    }
}

async fn query_path_info(
    conn: &Connection,
    hdr: &SmbHeader,
    t2: &Trans2Request<'_>,
    reply: &mut ReplyBuf,
) -> Result<Chained> {
    if t2.params.len() < 6 {
        return Err(Error::Malformed("short query path info".to_string()));
    }
    let level = LittleEndian::read_u16(&t2.params[0..2]);
    let (name, _) = codec::read_wire_name(t2.params, 6, 6, hdr.is_unicode())?;
    debug!(%name, level, "query path info");

    let (vfs, _) = conn.tree_vfs(hdr.tid).await?;
    let path = vfs.resolve(&name)?;
    vfs.stat(&path)?;
    let target = InfoTarget::Path(vfs, path);

    let data = build_query_info(conn, &target, level)?;
    write_trans_rsp(reply, &[0, 0], &data);
    Ok(Chained::Done)
}

async fn query_file_info(
    conn: &Connection,
    hdr: &SmbHeader,
    t2: &Trans2Request<'_>,
    reply: &mut ReplyBuf,
) -> Result<Chained> {
    if t2.params.len() < 4 {
        return Err(Error::Malformed("short query file info".to_string()));
    }
    let fid = LittleEndian::read_u16(&t2.params[0..2]);
    let level = LittleEndian::read_u16(&t2.params[2..4]);
    debug!(fid, level, "query file info");

    let st = conn.state.lock().await;
    let sess = st
        .session
        .as_ref()
        .ok_or_else(|| Error::AccessDenied("no authenticated session".to_string()))?;
    let file = sess
        .files
        .get(fid)
        .ok_or(Error::InvalidHandle(fid as u64))?;
    let vfs = Arc::clone(&file.vfs);
    drop(st);

    let target = InfoTarget::File(vfs, file);
    let data = build_query_info(conn, &target, level)?;
    write_trans_rsp(reply, &[0, 0], &data);
    Ok(Chained::Done)
}

fn build_query_info(conn: &Connection, target: &InfoTarget, level: u16) -> Result<Vec<u8>> {
    let stat = target.stat()?;
    let path = target.path();
    let vfs = target.vfs();

    let attrs = match vfs.get_dos_attr(&path) {
        Ok(Some(a)) => a,
        _ if stat.is_dir() => FileAttributes::DIRECTORY.bits(),
        _ => FileAttributes::NORMAL.bits(),
    };
    let create_time = vfs
        .get_creation_time(&path)
        .ok()
        .flatten()
        .unwrap_or_else(|| stat.ctime_nt());

    let mut data = Vec::with_capacity(128);
    match level {
        query_level::INFO_STANDARD => {
            let (ctime, cdate) = codec::unix_to_dos_datetime(stat.ctime.0);
            let (atime, adate) = codec::unix_to_dos_datetime(stat.atime.0);
            let (mtime, mdate) = codec::unix_to_dos_datetime(stat.mtime.0);
            data.write_u16::<LittleEndian>(cdate)?;
            data.write_u16::<LittleEndian>(ctime)?;
            data.write_u16::<LittleEndian>(adate)?;
            data.write_u16::<LittleEndian>(atime)?;
            data.write_u16::<LittleEndian>(mdate)?;
            data.write_u16::<LittleEndian>(mtime)?;
            data.write_u32::<LittleEndian>(stat.size as u32)?;
            data.write_u32::<LittleEndian>(stat.allocation() as u32)?;
            data.write_u16::<LittleEndian>(attrs as u16)?;
        }
        query_level::QUERY_FILE_BASIC_INFO | query_level::PASSTHRU_BASIC_INFO => {
            data.write_u64::<LittleEndian>(create_time)?;
            data.write_u64::<LittleEndian>(stat.atime_nt())?;
            data.write_u64::<LittleEndian>(stat.mtime_nt())?;
            data.write_u64::<LittleEndian>(stat.ctime_nt())?;
            data.write_u32::<LittleEndian>(attrs)?;
            data.write_u32::<LittleEndian>(0)?; // pad
        }
        query_level::QUERY_FILE_STANDARD_INFO => {
            data.write_u64::<LittleEndian>(stat.allocation())?;
            data.write_u64::<LittleEndian>(stat.size)?;
            data.write_u32::<LittleEndian>(stat.nlink as u32)?;
            data.push(target.delete_pending() as u8);
            data.push(stat.is_dir() as u8);
            data.write_u16::<LittleEndian>(0)?; // reserved
        }
        query_level::QUERY_FILE_EA_INFO => {
            let ea_size: usize = vfs
                .list_user_xattrs(&path)?
                .iter()
                .map(|n| n.len() + 1)
                .sum();
            data.write_u32::<LittleEndian>(ea_size as u32)?;
        }
        query_level::QUERY_FILE_NAME_INFO => {
            let name = codec::encode_utf16le(&target.name());
            data.write_u32::<LittleEndian>(name.len() as u32)?;
            data.extend_from_slice(&name);
        }
        query_level::QUERY_FILE_ALL_INFO => {
            data.write_u64::<LittleEndian>(create_time)?;
            data.write_u64::<LittleEndian>(stat.atime_nt())?;
            data.write_u64::<LittleEndian>(stat.mtime_nt())?;
            data.write_u64::<LittleEndian>(stat.ctime_nt())?;
            data.write_u32::<LittleEndian>(attrs)?;
            data.write_u32::<LittleEndian>(0)?; // pad
            data.write_u64::<LittleEndian>(stat.allocation())?;
            data.write_u64::<LittleEndian>(stat.size)?;
            data.write_u32::<LittleEndian>(stat.nlink as u32)?;
            data.push(target.delete_pending() as u8);
            data.push(stat.is_dir() as u8);
            data.write_u16::<LittleEndian>(0)?; // pad
            data.write_u64::<LittleEndian>(stat.ino)?;
            data.write_u32::<LittleEndian>(0)?; // EA size
            data.write_u32::<LittleEndian>(0)?; // access flags
            data.write_u64::<LittleEndian>(stat.ino)?;
            data.write_u64::<LittleEndian>(0)?; // current byte offset
            data.write_u32::<LittleEndian>(0)?; // mode
            data.write_u32::<LittleEndian>(0)?; // alignment
            let name = codec::encode_utf16le(&target.name());
            data.write_u32::<LittleEndian>(name.len() as u32)?;
            data.extend_from_slice(&name);
        }
        query_level::QUERY_FILE_ALT_NAME_INFO => {
            let short = codec::short_name(&target.name()).unwrap_or_default();
            let name = codec::encode_utf16le(&short);
            data.write_u32::<LittleEndian>(name.len() as u32)?;
            data.extend_from_slice(&name);
        }
        query_level::QUERY_FILE_UNIX_BASIC => {
            write_unix_basic(&mut data, &stat);
        }
        query_level::QUERY_FILE_UNIX_LINK => {
            let link = vfs.readlink(&path)?;
            data.extend_from_slice(&codec::encode_utf16le_null(&link));
        }
        query_level::INFO_QUERY_ALL_EAS => {
            let names = vfs.list_user_xattrs(&path)?;
            let mut list = Vec::new();
            for full_name in &names {
                let short = full_name.trim_start_matches("user.");
                let value = vfs.get_xattr(&path, full_name)?.unwrap_or_default();
                list.push(0u8); // EaFlags
                list.push(short.len() as u8);
                list.extend_from_slice(&(value.len() as u16).to_le_bytes());
                list.extend_from_slice(short.as_bytes());
                list.push(0);
                list.extend_from_slice(&value);
            }
            data.write_u32::<LittleEndian>((4 + list.len()) as u32)?;
            data.extend_from_slice(&list);
        }
        query_level::QUERY_POSIX_ACL => {
            let access = vfs
                .get_xattr(&path, "system.posix_acl_access")?
                .map(|raw| PosixAcl::entries_from_xattr(&raw))
                .transpose()?
                .unwrap_or_default();
            let default = vfs
                .get_xattr(&path, "system.posix_acl_default")?
                .map(|raw| PosixAcl::entries_from_xattr(&raw))
                .transpose()?
                .unwrap_or_default();
            let acl = PosixAcl { access, default };
            data.extend_from_slice(&acl.to_wire());
        }
        query_level::PASSTHRU_INTERNAL_INFO => {
            data.write_u64::<LittleEndian>(stat.ino)?;
        }
        query_level::QUERY_CIFS_ACL => {
            let sd = SecurityDescriptor::build(
                OWNER_SECINFO | GROUP_SECINFO | DACL_SECINFO,
                stat.uid,
                stat.gid,
                stat.mode & 0o777,
                conn.server.idmap.as_ref(),
            )?;
            data.extend_from_slice(&sd);
        }
        other => return Err(Error::UnsupportedLevel(other)),
    }
    Ok(data)
}

// ----- set path / file information -----

async fn set_path_info(
    conn: &Connection,
    hdr: &SmbHeader,
    t2: &Trans2Request<'_>,
    reply: &mut ReplyBuf,
) -> Result<Chained> {
    if t2.params.len() < 6 {
        return Err(Error::Malformed("short set path info".to_string()));
    }
    let level = LittleEndian::read_u16(&t2.params[0..2]);
    let (name, _) = codec::read_wire_name(t2.params, 6, 6, hdr.is_unicode())?;
    debug!(%name, level, "set path info");

    match level {
        set_level::POSIX_OPEN => return posix_open(conn, hdr, t2, &name, reply).await,
        set_level::POSIX_UNLINK => {
            let (vfs, writable) = conn.tree_vfs(hdr.tid).await?;
            require_writable(writable)?;
            if t2.data.len() < 2 {
                return Err(Error::Malformed("short posix unlink".to_string()));
            }
            let is_dir = LittleEndian::read_u16(&t2.data[0..2]) == 1;
            let path = vfs.resolve(&name)?;
            if is_dir {
                vfs.rmdir(&path)?;
            } else {
                vfs.unlink(&path)?;
            }
            write_trans_rsp(reply, &[0, 0], &[]);
            return Ok(Chained::Done);
        }
        set_level::SET_FILE_UNIX_LINK => {
            let (vfs, writable) = conn.tree_vfs(hdr.tid).await?;
            require_writable(writable)?;
            let (target, _) = codec::read_wire_name(t2.data, 0, 0, hdr.is_unicode())?;
            let (parent, leaf) = vfs.resolve_parent(&name)?;
            vfs.symlink(&target, &parent.join(leaf))?;
            write_trans_rsp(reply, &[0, 0], &[]);
            return Ok(Chained::Done);
        }
        set_level::SET_FILE_UNIX_HLINK => {
            let (target, _) = codec::read_wire_name(t2.data, 0, 0, hdr.is_unicode())?;
            conn.rename_paths(hdr.tid, &target, &name, true).await?;
            write_trans_rsp(reply, &[0, 0], &[]);
            return Ok(Chained::Done);
        }
        _ => {}
    }

    let (vfs, writable) = conn.tree_vfs(hdr.tid).await?;
    require_writable(writable)?;
    let path = vfs.resolve(&name)?;
    vfs.stat(&path)?;

    apply_set_info(conn, hdr.tid, &vfs, &path, None, level, t2.data).await?;
    write_trans_rsp(reply, &[0, 0], &[]);
    Ok(Chained::Done)
}

async fn set_file_info(
    conn: &Connection,
    hdr: &SmbHeader,
    t2: &Trans2Request<'_>,
    reply: &mut ReplyBuf,
) -> Result<Chained> {
    if t2.params.len() < 4 {
        return Err(Error::Malformed("short set file info".to_string()));
    }
    let fid = LittleEndian::read_u16(&t2.params[0..2]);
    let level = LittleEndian::read_u16(&t2.params[2..4]);
    debug!(fid, level, "set file info");

    let st = conn.state.lock().await;
    let sess = st
        .session
        .as_ref()
        .ok_or_else(|| Error::AccessDenied("no authenticated session".to_string()))?;
    let writable = sess.tree(hdr.tid)?.writable;
    let file = sess
        .files
        .get(fid)
        .ok_or(Error::InvalidHandle(fid as u64))?;
    let vfs = Arc::clone(&file.vfs);
    drop(st);
    require_writable(writable)?;

    let path = file.path();
    apply_set_info(conn, hdr.tid, &vfs, &path, Some(&file), level, t2.data).await?;
    write_trans_rsp(reply, &[0, 0], &[]);
    Ok(Chained::Done)
}

/// Apply one set-info level to a path (and optionally its open handle).
async fn apply_set_info(
    conn: &Connection,
    tid: u16,
    vfs: &Arc<Vfs>,
    path: &std::path::Path,
    file: Option<&FileRef>,
    level: u16,
    data: &[u8],
) -> Result<()> {
    match level {
        set_level::INFO_STANDARD => {
            if data.len() < 12 {
                return Err(Error::Malformed("short standard info".to_string()));
            }
            let adate = LittleEndian::read_u16(&data[4..6]);
            let atime = LittleEndian::read_u16(&data[6..8]);
            let mdate = LittleEndian::read_u16(&data[8..10]);
            let mtime = LittleEndian::read_u16(&data[10..12]);

            let mut set = SetAttrs::default();
            let access = codec::dos_datetime_to_unix(atime, adate);
            if access != 0 {
                set.atime = Some((access, 0));
            }
            let modified = codec::dos_datetime_to_unix(mtime, mdate);
            if modified != 0 {
                set.mtime = Some((modified, 0));
            }
            if set.atime.is_some() || set.mtime.is_some() {
                vfs.setattr(path, &set)?;
            }
        }
        set_level::SET_FILE_BASIC_INFO | set_level::PASSTHRU_BASIC_INFO => {
            if data.len() < 36 {
                return Err(Error::Malformed("short basic info".to_string()));
            }
            let create = LittleEndian::read_u64(&data[0..8]);
            let atime = LittleEndian::read_u64(&data[8..16]);
            let mtime = LittleEndian::read_u64(&data[16..24]);
            let attrs = LittleEndian::read_u32(&data[32..36]);

            let mut set = SetAttrs::default();
            if atime != 0 {
                let (s, ns) = codec::nt_time_to_unix(atime);
                set.atime = Some((s, ns));
            }
            if mtime != 0 {
                let (s, ns) = codec::nt_time_to_unix(mtime);
                set.mtime = Some((s, ns));
            }
            if set.atime.is_some() || set.mtime.is_some() {
                vfs.setattr(path, &set)?;
            }
            if create != 0 {
                vfs.set_creation_time(path, create).ok();
            }
            if attrs != 0 {
                vfs.set_dos_attr(path, attrs).ok();
            }
        }
        set_level::SET_FILE_DISPOSITION_INFO | set_level::PASSTHRU_DISPOSITION_INFO => {
            let file = file.ok_or_else(|| {
                Error::InvalidParameter("disposition needs an open handle".to_string())
            })?;
            let delete = data.first().copied().unwrap_or(0) != 0;
            if delete {
                if file.stream.is_some() {
                    file.master.set_flags(MasterFlags::DELETE_ON_CLOSE_STREAM);
                } else {
                    file.master.set_flags(MasterFlags::DELETE_ON_CLOSE);
                }
            } else {
                file.master
                    .clear_flags(MasterFlags::DELETE_ON_CLOSE | MasterFlags::DELETE_ON_CLOSE_STREAM);
            }
        }
        set_level::SET_FILE_ALLOCATION_INFO | set_level::PASSTHRU_ALLOCATION_INFO => {
            if data.len() < 8 {
                return Err(Error::Malformed("short allocation info".to_string()));
            }
            let size = LittleEndian::read_u64(&data[0..8]);
            truncate_checked(vfs, path, file, size)?;
        }
        set_level::SET_FILE_END_OF_FILE_INFO | set_level::PASSTHRU_END_OF_FILE_INFO => {
            if data.len() < 8 {
                return Err(Error::Malformed("short end-of-file info".to_string()));
            }
            let size = LittleEndian::read_u64(&data[0..8]);
            truncate_checked(vfs, path, file, size)?;
        }
        set_level::SET_FILE_UNIX_BASIC => {
            if data.len() < 100 {
                return Err(Error::Malformed("short unix basic".to_string()));
            }
            let eof = LittleEndian::read_u64(&data[0..8]);
            let atime_nt = LittleEndian::read_u64(&data[24..32]);
            let mtime_nt = LittleEndian::read_u64(&data[32..40]);
            let uid = LittleEndian::read_u64(&data[40..48]);
            let gid = LittleEndian::read_u64(&data[48..56]);
            let permissions = LittleEndian::read_u64(&data[84..92]);

            let mut set = SetAttrs::default();
            if eof != UNIX_NO_CHANGE {
                set.size = Some(eof);
            }
            if atime_nt != UNIX_NO_CHANGE && atime_nt != 0 {
                let (s, ns) = codec::nt_time_to_unix(atime_nt);
                set.atime = Some((s, ns));
            }
            if mtime_nt != UNIX_NO_CHANGE && mtime_nt != 0 {
                let (s, ns) = codec::nt_time_to_unix(mtime_nt);
                set.mtime = Some((s, ns));
            }
            if uid != UNIX_NO_CHANGE {
                set.uid = Some(uid as u32);
            }
            if gid != UNIX_NO_CHANGE {
                set.gid = Some(gid as u32);
            }
            if permissions != UNIX_NO_CHANGE {
                set.mode = Some(permissions as u32);
            }
            vfs.setattr(path, &set)?;
        }
        set_level::SET_POSIX_ACL => {
            let acl = PosixAcl::parse_wire(data)?;
            if !acl.access.is_empty() {
                vfs.set_xattr(
                    path,
                    "system.posix_acl_access",
                    &PosixAcl::entries_to_xattr(&acl.access),
                )?;
            }
            if !acl.default.is_empty() {
                vfs.set_xattr(
                    path,
                    "system.posix_acl_default",
                    &PosixAcl::entries_to_xattr(&acl.default),
                )?;
            }
        }
        set_level::INFO_SET_EAS => {
            let mut pos = 4; // list size
            while pos + 4 <= data.len() {
                let name_len = data[pos + 1] as usize;
                let value_len = LittleEndian::read_u16(&data[pos + 2..pos + 4]) as usize;
                let name_start = pos + 4;
                let value_start = name_start + name_len + 1;
                if value_start + value_len > data.len() {
                    return Err(Error::Malformed("EA entry truncated".to_string()));
                }
                let name = String::from_utf8_lossy(&data[name_start..name_start + name_len]);
                let value = &data[value_start..value_start + value_len];
                if value.len() > XATTR_SIZE_MAX {
                    return Err(Error::InvalidParameter("EA value too large".to_string()));
                }
                let full = format!("user.{}", name);
                if value.is_empty() {
                    vfs.remove_xattr(path, &full).ok();
                } else {
                    vfs.set_xattr(path, &full, value)?;
                }
                pos = value_start + value_len;
            }
        }
        set_level::SET_CIFS_ACL => {
            let sd = SecurityDescriptor::parse(data)?;
            let current = vfs.stat(path)?;
            let (uid, gid, mode) =
                sd.to_posix(conn.server.idmap.as_ref(), current.uid, current.gid);
            let set = SetAttrs {
                uid: (uid != current.uid).then_some(uid),
                gid: (gid != current.gid).then_some(gid),
                mode,
                ..Default::default()
            };
            vfs.setattr(path, &set)?;
        }
        set_level::PASSTHRU_RENAME_INFORMATION => {
            if data.len() < 12 {
                return Err(Error::Malformed("short rename info".to_string()));
            }
            let target_len = LittleEndian::read_u32(&data[8..12]) as usize;
            let raw = data
                .get(12..12 + target_len)
                .ok_or_else(|| Error::Malformed("rename target truncated".to_string()))?;
            let target = codec::decode_utf16le(raw)?
                .trim_end_matches('\0')
                .to_string();
            let old_wire = path_to_wire(vfs, path)?;
            conn.rename_paths(tid, &old_wire, &target, false).await?;
        }
        other => return Err(Error::UnsupportedLevel(other)),
    }
    Ok(())
}

/// Truncate with the byte-range-lock conflict check of the open handles on
/// the inode.
fn truncate_checked(
    vfs: &Arc<Vfs>,
    path: &std::path::Path,
    file: Option<&FileRef>,
    size: u64,
) -> Result<()> {
    if let Some(file) = file {
        file.inner().check_lock_range(size, u64::MAX, true)?;
        vfs.ftruncate(&file.file, size)?;
    } else {
        vfs.truncate(path, size)?;
    }
    Ok(())
}

fn require_writable(writable: bool) -> Result<()> {
    if writable {
        Ok(())
    } else {
        Err(Error::AccessDenied("tree is read-only".to_string()))
    }
}

fn path_to_wire(vfs: &Vfs, path: &std::path::Path) -> Result<String> {
    let suffix = path
        .strip_prefix(vfs.root())
        .map_err(|_| Error::Internal(format!("path {:?} outside share root", path)))?;
    Ok(suffix.to_string_lossy().replace('/', "\\"))
}

// ----- posix open / mkdir -----

/// POSIX_OPEN set-path level: open flags and mode travel in the data
/// section, the response carries the new FID.
async fn posix_open(
    conn: &Connection,
    hdr: &SmbHeader,
    t2: &Trans2Request<'_>,
    name: &str,
    reply: &mut ReplyBuf,
) -> Result<Chained> {
    if t2.data.len() < 14 {
        return Err(Error::Malformed("short posix open".to_string()));
    }
    let open_flags = LittleEndian::read_u32(&t2.data[0..4]);
    let _mode = LittleEndian::read_u64(&t2.data[4..12]);
    let requested_level = LittleEndian::read_u16(&t2.data[12..14]);
    debug!(%name, open_flags, "posix open");

    const SMB_O_CREAT: u32 = 0x10;
    const SMB_O_EXCL: u32 = 0x20;
    const SMB_O_TRUNC: u32 = 0x40;
    const SMB_O_DIRECTORY: u32 = 0x200;

    let disp = match (
        open_flags & SMB_O_CREAT != 0,
        open_flags & SMB_O_EXCL != 0,
        open_flags & SMB_O_TRUNC != 0,
    ) {
        (true, true, _) => disposition::CREATE,
        (true, false, true) => disposition::OVERWRITE_IF,
        (true, false, false) => disposition::OPEN_IF,
        (false, _, true) => disposition::OVERWRITE,
        (false, _, false) => disposition::OPEN,
    };

    let access = match open_flags & 0x07 {
        0x01 => AccessMask::GENERIC_READ,
        0x02 => AccessMask::GENERIC_WRITE,
        _ => AccessMask::GENERIC_READ | AccessMask::GENERIC_WRITE,
    };

    let mut st = conn.state.lock().await;
    let sess = st
        .session
        .as_mut()
        .ok_or_else(|| Error::AccessDenied("no authenticated session".to_string()))?;
    let tree = sess.tree(hdr.tid)?.clone();
    let vfs = tree.vfs()?.clone();

    let (file, action, stat) = open_install(
        sess,
        &tree,
        &conn.server.mft,
        &vfs,
        name,
        access,
        disp,
        open_flags & SMB_O_DIRECTORY != 0,
        false,
    )?;
    drop(st);

    let mut data = Vec::with_capacity(128);
    data.write_u16::<LittleEndian>(0)?; // oplock flags
    data.write_u16::<LittleEndian>(file.fid)?;
    data.write_u32::<LittleEndian>(action)?;
    data.write_u16::<LittleEndian>(requested_level)?;
    data.write_u16::<LittleEndian>(0)?; // pad
    if requested_level == query_level::QUERY_FILE_UNIX_BASIC {
        write_unix_basic(&mut data, &stat);
    }

    write_trans_rsp(reply, &[0, 0], &data);
    Ok(Chained::Done)
}

async fn create_directory(
    conn: &Connection,
    hdr: &SmbHeader,
    t2: &Trans2Request<'_>,
    reply: &mut ReplyBuf,
) -> Result<Chained> {
    if t2.params.len() < 4 {
        return Err(Error::Malformed("short create directory".to_string()));
    }
    let (name, _) = codec::read_wire_name(t2.params, 4, 4, hdr.is_unicode())?;
    debug!(%name, "trans2 create directory");

    let (vfs, writable) = conn.tree_vfs(hdr.tid).await?;
    require_writable(writable)?;
    let (parent, leaf) = vfs.resolve_parent(&name)?;
    vfs.mkdir(&parent.join(leaf), 0o755)?;

    write_trans_rsp(reply, &[0, 0], &[]);
    Ok(Chained::Done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trans2_parse_rejects_bad_offsets() {
        // Build a minimal trans2 request whose data offset points past the end
        let hdr = SmbHeader {
            command: crate::protocol::constants::command::TRANSACTION2,
            status: 0,
            flags: Default::default(),
            flags2: Default::default(),
            pid_high: 0,
            signature: [0; 8],
            tid: 1,
            pid: 1,
            uid: 1,
            mid: 1,
        };
        let mut buf = Vec::new();
        hdr.write_to(&mut buf);
        buf.push(15); // word count
        let mut words = vec![0u8; 28];
        LittleEndian::write_u16(&mut words[22..24], 100); // data count
        LittleEndian::write_u16(&mut words[24..26], 9999); // data offset
        words[26] = 1; // setup count
        words.extend_from_slice(&trans2::FIND_FIRST.to_le_bytes());
        buf.extend_from_slice(&words);
        buf.extend_from_slice(&0u16.to_le_bytes()); // byte count

        let req = Request::new(&buf).unwrap();
        assert!(parse_trans2(&req, 32).is_err());
    }

    #[test]
    fn test_find_flag_values() {
        assert_eq!(find_flags::CLOSE_AFTER_REQUEST, 1);
        assert_eq!(find_flags::CLOSE_AT_END_OF_SEARCH, 2);
    }
}
