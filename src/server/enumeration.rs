//! Directory enumeration engine backing FIND_FIRST / FIND_NEXT.
//!
//! A directory handle owns a page-sized dirent buffer refilled from the
//! host directory stream. Entries are serialized into the response in the
//! wire layout of the requested info level; when the next record would not
//! fit, the cursor rewinds one entry so the following FIND_NEXT resumes
//! exactly there.

use crate::error::{Error, Result};
use crate::protocol::codec;
use crate::protocol::constants::{find_level, FileAttributes};
use crate::server::file::SmbFile;
use crate::vfs::{UnixStat, Vfs};
use std::fs;
use std::path::Path;

/// Dirent page budget per refill
const PAGE_SIZE: usize = 4096;

/// Fixed per-record cost used for the page budget
const DIRENT_FIXED: usize = 24;

/// One raw directory entry held in the page buffer
#[derive(Debug, Clone)]
pub struct DirentRec {
    pub name: String,
    pub ino: u64,
    pub is_dir: bool,
}

/// Per-directory-handle readdir state
pub struct DirCursor {
    entries: Vec<DirentRec>,
    pos: usize,
    stream: Option<fs::ReadDir>,
    emitted_dots: bool,
    started: bool,
    /// Wildcard bound at FIND_FIRST, applied across continuations
    pub pattern: Option<String>,
    /// End of directory reached and buffer drained
    pub ended: bool,
}

impl std::fmt::Debug for DirCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirCursor")
            .field("buffered", &self.entries.len())
            .field("pos", &self.pos)
            .field("ended", &self.ended)
            .finish()
    }
}

impl Default for DirCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl DirCursor {
    /// Fresh cursor at the start of the directory.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            pos: 0,
            stream: None,
            emitted_dots: false,
            started: false,
            pattern: None,
            ended: false,
        }
    }

    /// Next buffered entry, refilling the page when drained. `None` means
    /// end of directory.
    fn next(&mut self, vfs: &Vfs, dir: &Path) -> Result<Option<DirentRec>> {
        if self.ended {
            return Ok(None);
        }
        if self.pos >= self.entries.len() {
            self.refill(vfs, dir)?;
            if self.entries.is_empty() {
                self.ended = true;
                return Ok(None);
            }
        }
        let rec = self.entries[self.pos].clone();
        self.pos += 1;
        Ok(Some(rec))
    }

    /// Step back one entry so the next call resumes with it.
    fn rewind_one(&mut self) {
        if self.pos > 0 {
            self.pos -= 1;
        }
    }

    /// Refill the page buffer from the host stream.
    fn refill(&mut self, vfs: &Vfs, dir: &Path) -> Result<()> {
        self.entries.clear();
        self.pos = 0;

        if !self.started {
            self.started = true;
            self.stream = Some(vfs.read_dir(dir)?);
        }

        let mut used = 0;

        if !self.emitted_dots {
            self.emitted_dots = true;
            let st = vfs.stat(dir)?;
            self.entries.push(DirentRec {
                name: ".".to_string(),
                ino: st.ino,
                is_dir: true,
            });
            self.entries.push(DirentRec {
                name: "..".to_string(),
                ino: st.ino,
                is_dir: true,
            });
            used += 2 * DIRENT_FIXED;
        }

        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(()),
        };

        while used < PAGE_SIZE {
            match stream.next() {
                Some(Ok(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let meta = entry.metadata();
                    let (ino, is_dir) = match meta {
                        Ok(m) => {
                            use std::os::unix::fs::MetadataExt;
                            (m.ino(), m.is_dir())
                        }
                        Err(_) => (0, false),
                    };
                    used += (DIRENT_FIXED + name.len() + 7) & !7;
                    self.entries.push(DirentRec { name, ino, is_dir });
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    self.stream = None;
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Parameters of one emission round
pub struct EmitParams<'a> {
    pub info_level: u16,
    /// Trailing wildcard from FIND_FIRST; continuations inherit the
    /// pattern bound at the cursor
    pub pattern: Option<&'a str>,
    /// Stop after the first match (exact-name search)
    pub single: bool,
    /// Output byte budget
    pub max_bytes: usize,
    /// Entry-count budget
    pub max_entries: usize,
    /// Read creation time / DOS attributes from xattrs
    pub store_dos_attr: bool,
}

/// Result of one emission round
#[derive(Debug, Default)]
pub struct EmitResult {
    pub data: Vec<u8>,
    pub entries: u16,
    pub ended: bool,
    /// Offset of the last record in `data`, for LastNameOffset
    pub last_name_offset: usize,
}

/// Serialize the next batch of directory entries for `file` into the wire
/// layout selected by the info level.
pub fn emit_next_batch(file: &SmbFile, params: &EmitParams<'_>) -> Result<EmitResult> {
    let dir_path = file.path();
    let vfs = &file.vfs;
    let mut guard = match file.dir_cursor.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    let cursor = guard.get_or_insert_with(DirCursor::new);
    if let Some(pattern) = params.pattern {
        cursor.pattern = Some(pattern.to_string());
    }
    let pattern = cursor.pattern.clone();

    let mut result = EmitResult::default();
    let mut offsets = Vec::new();

    loop {
        if result.entries as usize >= params.max_entries {
            break;
        }
        let rec = match cursor.next(vfs, &dir_path)? {
            Some(rec) => rec,
            None => {
                result.ended = true;
                break;
            }
        };

        if let Some(pattern) = &pattern {
            if !codec::wildcard_match(pattern, &rec.name) {
                continue;
            }
        }

        // Re-stat the full path; entries that vanished mid-walk are skipped.
        let full = dir_path.join(&rec.name);
        let stat = match vfs.stat(&full) {
            Ok(st) => st,
            Err(_) => continue,
        };

        let (create_time, attrs) = entry_metadata(vfs, &full, &stat, params.store_dos_attr);
        let record = serialize_entry(params.info_level, &rec, &stat, create_time, attrs)?;

        if result.data.len() + record.len() > params.max_bytes {
            cursor.rewind_one();
            break;
        }

        result.last_name_offset = result.data.len();
        offsets.push((result.data.len(), record.len()));
        result.data.extend_from_slice(&record);
        result.entries += 1;

        if params.single {
            break;
        }
    }

    // The final record in a batch points nowhere.
    if let Some(&(off, _)) = offsets.last() {
        result.data[off..off + 4].copy_from_slice(&0u32.to_le_bytes());
    }

    Ok(result)
}

/// Creation time and DOS attributes for an entry, consulting xattrs when
/// the share stores them.
fn entry_metadata(vfs: &Vfs, path: &Path, stat: &UnixStat, store_dos_attr: bool) -> (u64, u32) {
    let mut create_time = stat.ctime_nt();
    let mut attrs = if stat.is_dir() {
        FileAttributes::DIRECTORY.bits()
    } else {
        FileAttributes::ARCHIVE.bits()
    };

    if store_dos_attr {
        if let Ok(Some(t)) = vfs.get_creation_time(path) {
            create_time = t;
        }
        if let Ok(Some(a)) = vfs.get_dos_attr(path) {
            attrs = a;
        }
    }
    (create_time, attrs)
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// File-type values of the UNIX info level
fn unix_file_type(mode: u32) -> u32 {
    match mode & 0o170000 {
        0o040000 => 1, // directory
        0o120000 => 2, // symlink
        0o020000 => 3, // character device
        0o060000 => 4, // block device
        0o010000 => 5, // fifo
        0o140000 => 6, // socket
        _ => 0,        // regular file
    }
}

/// Write the common FILE_DIRECTORY_INFO prefix shared by the NT levels.
fn write_common(out: &mut Vec<u8>, stat: &UnixStat, create_time: u64, attrs: u32) {
    out.extend_from_slice(&0u32.to_le_bytes()); // NextEntryOffset, patched
    out.extend_from_slice(&0u32.to_le_bytes()); // FileIndex
    out.extend_from_slice(&create_time.to_le_bytes());
    out.extend_from_slice(&stat.atime_nt().to_le_bytes());
    out.extend_from_slice(&stat.mtime_nt().to_le_bytes());
    out.extend_from_slice(&stat.ctime_nt().to_le_bytes());
    out.extend_from_slice(&stat.size.to_le_bytes());
    out.extend_from_slice(&stat.allocation().to_le_bytes());
    out.extend_from_slice(&attrs.to_le_bytes());
}

/// Serialize the 100-byte FILE_UNIX_BASIC block.
pub fn write_unix_basic(out: &mut Vec<u8>, stat: &UnixStat) {
    out.extend_from_slice(&stat.size.to_le_bytes());
    out.extend_from_slice(&stat.allocation().to_le_bytes());
    out.extend_from_slice(&stat.ctime_nt().to_le_bytes());
    out.extend_from_slice(&stat.atime_nt().to_le_bytes());
    out.extend_from_slice(&stat.mtime_nt().to_le_bytes());
    out.extend_from_slice(&(stat.uid as u64).to_le_bytes());
    out.extend_from_slice(&(stat.gid as u64).to_le_bytes());
    out.extend_from_slice(&unix_file_type(stat.mode).to_le_bytes());
    out.extend_from_slice(&((stat.rdev >> 8) & 0xFFF).to_le_bytes());
    out.extend_from_slice(&(stat.rdev & 0xFF).to_le_bytes());
    out.extend_from_slice(&stat.ino.to_le_bytes());
    out.extend_from_slice(&((stat.mode & 0o7777) as u64).to_le_bytes());
    out.extend_from_slice(&stat.nlink.to_le_bytes());
}

/// Serialize one directory entry in the layout of `info_level`, 8-byte
/// aligned with NextEntryOffset pointing at the following record.
fn serialize_entry(
    info_level: u16,
    rec: &DirentRec,
    stat: &UnixStat,
    create_time: u64,
    attrs: u32,
) -> Result<Vec<u8>> {
    let name_utf16 = codec::encode_utf16le(&rec.name);
    let mut out = Vec::with_capacity(128 + name_utf16.len());

    match info_level {
        find_level::DIRECTORY_INFO => {
            write_common(&mut out, stat, create_time, attrs);
            out.extend_from_slice(&(name_utf16.len() as u32).to_le_bytes());
            out.extend_from_slice(&name_utf16);
        }
        find_level::FULL_DIRECTORY_INFO => {
            write_common(&mut out, stat, create_time, attrs);
            out.extend_from_slice(&(name_utf16.len() as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // EaSize
            out.extend_from_slice(&name_utf16);
        }
        find_level::BOTH_DIRECTORY_INFO => {
            write_common(&mut out, stat, create_time, attrs);
            out.extend_from_slice(&(name_utf16.len() as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // EaSize

            let mut short = [0u8; 24];
            let mut short_len = 0u8;
            if let Some(mangled) = codec::short_name(&rec.name) {
                let enc = codec::encode_utf16le(&mangled);
                let take = enc.len().min(24);
                short[..take].copy_from_slice(&enc[..take]);
                short_len = take as u8;
            }
            out.push(short_len);
            out.push(0); // Reserved
            out.extend_from_slice(&short);
            out.extend_from_slice(&name_utf16);
        }
        find_level::ID_FULL_DIR_INFO => {
            write_common(&mut out, stat, create_time, attrs);
            out.extend_from_slice(&(name_utf16.len() as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // EaSize
            out.extend_from_slice(&0u32.to_le_bytes()); // Reserved
            out.extend_from_slice(&rec.ino.to_le_bytes());
            out.extend_from_slice(&name_utf16);
        }
        find_level::UNIX_INFO => {
            out.extend_from_slice(&0u32.to_le_bytes()); // NextEntryOffset
            out.extend_from_slice(&0u32.to_le_bytes()); // ResumeKey
            write_unix_basic(&mut out, stat);
            out.extend_from_slice(&name_utf16);
        }
        other => return Err(Error::UnsupportedLevel(other)),
    }

    let total = align8(out.len());
    out.resize(total, 0);
    out[0..4].copy_from_slice(&(total as u32).to_le_bytes());
    Ok(out)
}
