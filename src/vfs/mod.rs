//! Filesystem adapter.
//!
//! Every wire path is resolved against a share root with separator mapping
//! and jail enforcement before any host call is made. Alternate data
//! streams live in `user.stream:` extended attributes; DOS attributes and
//! creation times in their own xattrs when the share stores them.

use crate::error::{Error, Result};
use crate::protocol::codec;
use std::fs;
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Prefix for alternate-data-stream xattrs
pub const STREAM_PREFIX: &str = "user.stream:";
/// Xattr holding DOS attribute bits
pub const DOS_ATTR_XATTR: &str = "user.dos_attr";
/// Xattr holding the 64-bit FILETIME creation time
pub const CREATION_TIME_XATTR: &str = "user.creation_time";
/// Largest value an xattr-backed stream may hold
pub const XATTR_SIZE_MAX: usize = 65536;

/// Mode bits outside the permission set
const S_IALLUGO: u32 = 0o7777;
const S_ISUID: u32 = 0o4000;
const S_ISGID: u32 = 0o2000;
const S_IXGRP: u32 = 0o010;

/// Snapshot of a host inode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: (i64, u32),
    pub mtime: (i64, u32),
    pub ctime: (i64, u32),
}

impl UnixStat {
    /// Build from host metadata.
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            mode: meta.mode(),
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
            size: meta.size(),
            blksize: meta.blksize(),
            blocks: meta.blocks(),
            atime: (meta.atime(), meta.atime_nsec() as u32),
            mtime: (meta.mtime(), meta.mtime_nsec() as u32),
            ctime: (meta.ctime(), meta.ctime_nsec() as u32),
        }
    }

    /// Whether the inode is a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }

    /// Whether the inode is a symlink.
    pub fn is_symlink(&self) -> bool {
        self.mode & 0o170000 == 0o120000
    }

    /// Allocation in bytes (512-byte block units on the host).
    pub fn allocation(&self) -> u64 {
        self.blocks * 512
    }

    /// Change time as a FILETIME value.
    pub fn ctime_nt(&self) -> u64 {
        codec::unix_to_nt_time(self.ctime.0, self.ctime.1)
    }

    /// Access time as a FILETIME value.
    pub fn atime_nt(&self) -> u64 {
        codec::unix_to_nt_time(self.atime.0, self.atime.1)
    }

    /// Modification time as a FILETIME value.
    pub fn mtime_nt(&self) -> u64 {
        codec::unix_to_nt_time(self.mtime.0, self.mtime.1)
    }
}

/// Filesystem-level statistics for QUERY_FS_INFORMATION
#[derive(Debug, Clone, Copy)]
pub struct FsStat {
    pub block_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub avail_blocks: u64,
    pub total_files: u64,
    pub free_files: u64,
    pub name_max: u64,
}

/// Attribute changes for `setattr`
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<(i64, u32)>,
    pub mtime: Option<(i64, u32)>,
}

/// How `open_with` should treat existing and missing files
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenDisp {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub create_new: bool,
    pub truncate: bool,
    pub mode: Option<u32>,
}

/// Path-safe adapter rooted at one share directory
#[derive(Debug)]
pub struct Vfs {
    root: PathBuf,
    caseless: bool,
}

impl Vfs {
    /// Root the adapter at an existing directory.
    pub fn new(root: impl Into<PathBuf>, caseless: bool) -> Result<Self> {
        let root: PathBuf = root.into();
        let meta = fs::metadata(&root)
            .map_err(|_| Error::NotFound(format!("share root {:?}", root)))?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(format!("{:?}", root)));
        }
        let root = root.canonicalize()?;
        Ok(Self { root, caseless })
    }

    /// The share root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a wire path (backslash separators) to a host path inside the
    /// root. A trailing `*` component from wildcarded directory arguments is
    /// dropped. `..` never escapes the jail.
    pub fn resolve(&self, wire_path: &str) -> Result<PathBuf> {
        let local = codec::wire_path_to_local(wire_path);
        let mut out = self.root.clone();
        for component in local.split('/') {
            if component.is_empty() || component == "." || component == "*" {
                continue;
            }
            if component == ".." {
                return Err(Error::AccessDenied(
                    "path traversal outside share root".to_string(),
                ));
            }
            if self.caseless && !out.join(component).exists() {
                if let Some(found) = caseless_lookup(&out, component) {
                    out.push(found);
                    continue;
                }
            }
            out.push(component);
        }
        Ok(out)
    }

    /// Resolve the parent of a wire path plus the leaf name, for creates.
    pub fn resolve_parent(&self, wire_path: &str) -> Result<(PathBuf, String)> {
        let local = codec::wire_path_to_local(wire_path);
        match local.rsplit_once('/') {
            Some((dir, leaf)) => {
                if leaf.is_empty() || leaf == "." || leaf == ".." {
                    return Err(Error::InvalidParameter(format!("bad leaf in {}", wire_path)));
                }
                Ok((self.resolve(dir)?, leaf.to_string()))
            }
            None => {
                if local.is_empty() {
                    return Err(Error::InvalidParameter("empty path".to_string()));
                }
                Ok((self.root.clone(), local))
            }
        }
    }

    /// Stat following symlinks.
    pub fn stat(&self, path: &Path) -> Result<UnixStat> {
        let meta = fs::metadata(path)
            .map_err(|e| map_path_err(e, path))?;
        Ok(UnixStat::from_metadata(&meta))
    }

    /// Stat without following symlinks.
    pub fn lstat(&self, path: &Path) -> Result<UnixStat> {
        let meta = fs::symlink_metadata(path).map_err(|e| map_path_err(e, path))?;
        Ok(UnixStat::from_metadata(&meta))
    }

    /// Stat an open descriptor.
    pub fn fstat(&self, file: &fs::File) -> Result<UnixStat> {
        Ok(UnixStat::from_metadata(&file.metadata()?))
    }

    /// Open or create a file per the disposition flags.
    pub fn open_with(&self, path: &Path, disp: OpenDisp) -> Result<fs::File> {
        let mut opts = fs::OpenOptions::new();
        opts.read(disp.read || !disp.write)
            .write(disp.write)
            .truncate(disp.truncate)
            .create(disp.create)
            .create_new(disp.create_new);
        if let Some(mode) = disp.mode {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(mode);
        }
        opts.open(path).map_err(|e| map_path_err(e, path))
    }

    /// Open a directory handle for enumeration.
    pub fn open_dir(&self, path: &Path) -> Result<fs::File> {
        let meta = fs::metadata(path).map_err(|e| map_path_err(e, path))?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(format!("{:?}", path)));
        }
        fs::File::open(path).map_err(|e| map_path_err(e, path))
    }

    /// Stream directory entries.
    pub fn read_dir(&self, path: &Path) -> Result<fs::ReadDir> {
        fs::read_dir(path).map_err(|e| map_path_err(e, path))
    }

    /// Read `count` bytes at `pos`. Zero-length reads succeed with no data
    /// and do not touch the position.
    pub fn read_at(&self, file: &fs::File, pos: u64, count: usize) -> Result<Vec<u8>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; count];
        let mut read = 0;
        while read < count {
            match file.read_at(&mut buf[read..], pos + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(read);
        Ok(buf)
    }

    /// Write `data` at `pos`, returning the bytes moved.
    pub fn write_at(&self, file: &fs::File, pos: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut written = 0;
        while written < data.len() {
            match file.write_at(&data[written..], pos + written as u64) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(written)
    }

    /// Flush file data and metadata.
    pub fn fsync(&self, file: &fs::File) -> Result<()> {
        file.sync_all()?;
        Ok(())
    }

    /// Read from an xattr-backed stream.
    pub fn read_stream(&self, path: &Path, xattr_name: &str, pos: u64, count: usize) -> Result<Vec<u8>> {
        let value = self
            .get_xattr(path, xattr_name)?
            .ok_or_else(|| Error::NotFound(format!("stream {}", xattr_name)))?;
        let pos = pos as usize;
        if pos >= value.len() || count == 0 {
            return Ok(Vec::new());
        }
        let end = (pos + count).min(value.len());
        Ok(value[pos..end].to_vec())
    }

    /// Write into an xattr-backed stream. Growth past the xattr value cap is
    /// truncated to the cap rather than rejected.
    pub fn write_stream(&self, path: &Path, xattr_name: &str, pos: u64, data: &[u8]) -> Result<usize> {
        let pos = pos as usize;
        let mut size = pos + data.len();
        let mut count = data.len();
        if size > XATTR_SIZE_MAX {
            size = XATTR_SIZE_MAX;
            count = size.saturating_sub(pos);
        }
        if count == 0 {
            return Ok(0);
        }

        let existing = self.get_xattr(path, xattr_name)?.unwrap_or_default();
        let mut value = vec![0u8; size.max(existing.len())];
        value[..existing.len()].copy_from_slice(&existing);
        value[pos..pos + count].copy_from_slice(&data[..count]);
        self.set_xattr(path, xattr_name, &value)?;
        Ok(count)
    }

    /// List all xattr names on a path.
    pub fn list_xattr(&self, path: &Path) -> Result<Vec<String>> {
        let len = rustix::fs::listxattr(path, &mut [] as &mut [u8])
            .map_err(|e| Error::Io(e.into()))?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; len];
        let len = rustix::fs::listxattr(path, &mut buf).map_err(|e| Error::Io(e.into()))?;
        buf.truncate(len);
        Ok(buf
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect())
    }

    /// Names of all stream xattrs on a path.
    pub fn list_stream_xattrs(&self, path: &Path) -> Result<Vec<String>> {
        Ok(self
            .list_xattr(path)?
            .into_iter()
            .filter(|n| n.starts_with(STREAM_PREFIX))
            .collect())
    }

    /// Names of user xattrs that are not streams or server-internal slots.
    pub fn list_user_xattrs(&self, path: &Path) -> Result<Vec<String>> {
        Ok(self
            .list_xattr(path)?
            .into_iter()
            .filter(|n| {
                n.starts_with("user.")
                    && !n.starts_with(STREAM_PREFIX)
                    && n != DOS_ATTR_XATTR
                    && n != CREATION_TIME_XATTR
            })
            .collect())
    }

    /// Fetch an xattr with the size-probe-then-read protocol; `None` when
    /// the attribute is absent.
    pub fn get_xattr(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
        let len = match rustix::fs::getxattr(path, name, &mut [] as &mut [u8]) {
            Ok(len) => len,
            Err(rustix::io::Errno::NODATA) => return Ok(None),
            Err(e) => return Err(Error::Io(e.into())),
        };
        let mut buf = vec![0u8; len];
        match rustix::fs::getxattr(path, name, &mut buf) {
            Ok(len) => {
                buf.truncate(len);
                Ok(Some(buf))
            }
            Err(rustix::io::Errno::NODATA) => Ok(None),
            Err(e) => Err(Error::Io(e.into())),
        }
    }

    /// Store an xattr.
    pub fn set_xattr(&self, path: &Path, name: &str, value: &[u8]) -> Result<()> {
        rustix::fs::setxattr(path, name, value, rustix::fs::XattrFlags::empty())
            .map_err(|e| Error::Io(e.into()))
    }

    /// Remove one xattr.
    pub fn remove_xattr(&self, path: &Path, name: &str) -> Result<()> {
        rustix::fs::removexattr(path, name).map_err(|e| Error::Io(e.into()))
    }

    /// Remove every stream xattr on a path.
    pub fn remove_all_stream_xattrs(&self, path: &Path) -> Result<()> {
        for name in self.list_stream_xattrs(path)? {
            self.remove_xattr(path, &name)?;
        }
        Ok(())
    }

    /// Create a directory.
    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .mode(mode)
            .create(path)
            .map_err(|e| map_path_err(e, path))
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path).map_err(|e| match e.raw_os_error() {
            Some(code) if code == rustix::io::Errno::NOTEMPTY.raw_os_error() => {
                Error::DirectoryNotEmpty(format!("{:?}", path))
            }
            _ => map_path_err(e, path),
        })
    }

    /// Unlink a file.
    pub fn unlink(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| map_path_err(e, path))
    }

    /// Remove a file or an empty directory.
    pub fn remove(&self, path: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(path).map_err(|e| map_path_err(e, path))?;
        if meta.is_dir() {
            self.rmdir(path)
        } else {
            self.unlink(path)
        }
    }

    /// Create a hard link.
    pub fn link(&self, old: &Path, new: &Path) -> Result<()> {
        fs::hard_link(old, new).map_err(|e| map_path_err(e, new))
    }

    /// Create a symlink at `new` pointing at `target`.
    pub fn symlink(&self, target: &str, new: &Path) -> Result<()> {
        std::os::unix::fs::symlink(target, new).map_err(|e| map_path_err(e, new))
    }

    /// Read a symlink target.
    pub fn readlink(&self, path: &Path) -> Result<String> {
        let target = fs::read_link(path).map_err(|e| map_path_err(e, path))?;
        Ok(target.to_string_lossy().into_owned())
    }

    /// Rename within one mount. Cross-device renames fail without touching
    /// either side.
    pub fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        let old_parent = old.parent().unwrap_or(&self.root);
        let new_parent = new.parent().unwrap_or(&self.root);
        let old_dev = fs::metadata(old_parent).map_err(|e| map_path_err(e, old_parent))?.dev();
        let new_dev = fs::metadata(new_parent).map_err(|e| map_path_err(e, new_parent))?.dev();
        if old_dev != new_dev {
            return Err(Error::CrossDevice);
        }
        fs::rename(old, new).map_err(|e| map_path_err(e, old))
    }

    /// Truncate by path.
    pub fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| map_path_err(e, path))?;
        file.set_len(size)?;
        Ok(())
    }

    /// Truncate an open descriptor.
    pub fn ftruncate(&self, file: &fs::File, size: u64) -> Result<()> {
        file.set_len(size)?;
        Ok(())
    }

    /// Apply attribute changes with the usual sanitization: permission bits
    /// only from the requested mode, suid/sgid stripped on ownership change.
    pub fn setattr(&self, path: &Path, attrs: &SetAttrs) -> Result<()> {
        let current = self.stat(path)?;

        if let Some(size) = attrs.size {
            self.truncate(path, size)?;
        }

        let chown_uid = attrs.uid.filter(|&uid| uid != current.uid);
        let chown_gid = attrs.gid.filter(|&gid| gid != current.gid);
        if chown_uid.is_some() || chown_gid.is_some() {
            std::os::unix::fs::chown(path, chown_uid, chown_gid)
                .map_err(|e| map_path_err(e, path))?;
        }

        if let Some(req_mode) = attrs.mode {
            let mut mode = req_mode & S_IALLUGO;
            // Revoke setuid/setgid when ownership moved on a regular file
            if !current.is_dir() && (chown_uid.is_some() || chown_gid.is_some()) {
                mode &= !S_ISUID;
                if mode & S_IXGRP != 0 {
                    mode &= !S_ISGID;
                }
            }
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .map_err(|e| map_path_err(e, path))?;
        }

        if attrs.atime.is_some() || attrs.mtime.is_some() {
            let to_ts = |t: Option<(i64, u32)>, cur: (i64, u32)| rustix::fs::Timespec {
                tv_sec: t.map(|v| v.0).unwrap_or(cur.0),
                tv_nsec: t.map(|v| v.1 as i64).unwrap_or(cur.1 as i64),
            };
            let stamps = rustix::fs::Timestamps {
                last_access: to_ts(attrs.atime, current.atime),
                last_modification: to_ts(attrs.mtime, current.mtime),
            };
            rustix::fs::utimensat(
                rustix::fs::CWD,
                path,
                &stamps,
                rustix::fs::AtFlags::empty(),
            )
            .map_err(|e| Error::Io(e.into()))?;
        }

        Ok(())
    }

    /// Filesystem statistics for the volume holding `path`.
    pub fn statfs(&self, path: &Path) -> Result<FsStat> {
        let vfs = rustix::fs::statvfs(path).map_err(|e| Error::Io(e.into()))?;
        Ok(FsStat {
            block_size: vfs.f_bsize,
            total_blocks: vfs.f_blocks,
            free_blocks: vfs.f_bfree,
            avail_blocks: vfs.f_bavail,
            total_files: vfs.f_files,
            free_files: vfs.f_ffree,
            name_max: vfs.f_namemax,
        })
    }

    /// DOS attribute bits stored on the path, when present.
    pub fn get_dos_attr(&self, path: &Path) -> Result<Option<u32>> {
        Ok(self
            .get_xattr(path, DOS_ATTR_XATTR)?
            .filter(|v| v.len() >= 4)
            .map(|v| u32::from_le_bytes([v[0], v[1], v[2], v[3]])))
    }

    /// Store DOS attribute bits on the path.
    pub fn set_dos_attr(&self, path: &Path, attrs: u32) -> Result<()> {
        self.set_xattr(path, DOS_ATTR_XATTR, &attrs.to_le_bytes())
    }

    /// Creation time stored on the path, when present.
    pub fn get_creation_time(&self, path: &Path) -> Result<Option<u64>> {
        Ok(self
            .get_xattr(path, CREATION_TIME_XATTR)?
            .filter(|v| v.len() >= 8)
            .map(|v| {
                u64::from_le_bytes([v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7]])
            }))
    }

    /// Store the creation time on the path.
    pub fn set_creation_time(&self, path: &Path, nt_time: u64) -> Result<()> {
        self.set_xattr(path, CREATION_TIME_XATTR, &nt_time.to_le_bytes())
    }
}

/// Case-insensitive lookup of `component` in `dir`.
fn caseless_lookup(dir: &Path, component: &str) -> Option<String> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.eq_ignore_ascii_case(component) {
            return Some(name.into_owned());
        }
    }
    None
}

fn map_path_err(e: io::Error, path: &Path) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(format!("{:?}", path)),
        io::ErrorKind::AlreadyExists => Error::AlreadyExists(format!("{:?}", path)),
        io::ErrorKind::PermissionDenied => Error::AccessDenied(format!("{:?}", path)),
        _ => Error::Io(e),
    }
}
