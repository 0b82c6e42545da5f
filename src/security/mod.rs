//! NT security descriptor codec: SID parsing, DACL to POSIX mode mapping,
//! the id-mapping oracle boundary and the POSIX ACL wire format.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Upper bound on sub-authorities a SID may carry
pub const SID_MAX_SUB_AUTHORITIES: usize = 15;

/// Fixed SID prefix: revision, count, 6 authority bytes
pub const SID_BASE_SIZE: usize = 8;

/// ACE types
pub const ACCESS_ALLOWED: u8 = 0;
pub const ACCESS_DENIED: u8 = 1;

/// Security descriptor revision
pub const SD_REVISION: u16 = 1;

/// Self-relative descriptor control bit
pub const SELF_RELATIVE: u16 = 0x8000;
/// Control bit: DACL present
pub const DACL_PRESENT: u16 = 0x0004;

/// AdditionalInfo selectors in security-info queries
pub const OWNER_SECINFO: u32 = 0x1;
pub const GROUP_SECINFO: u32 = 0x2;
pub const DACL_SECINFO: u32 = 0x4;

// Wire rights used by the DACL <-> mode translation
pub const FILE_READ_RIGHTS: u32 = 0x0002_0089;
pub const FILE_WRITE_RIGHTS: u32 = 0x0000_0116;
pub const FILE_EXEC_RIGHTS: u32 = 0x0000_0020;
pub const SET_FILE_READ_RIGHTS: u32 = 0x0012_0089;
pub const SET_FILE_WRITE_RIGHTS: u32 = 0x001D_0156;
pub const SET_FILE_EXEC_RIGHTS: u32 = 0x0012_00B8;
pub const SET_MINIMUM_RIGHTS: u32 = 0x0012_0088;
pub const GENERIC_ALL: u32 = 0x1000_0000;
pub const GENERIC_EXECUTE: u32 = 0x2000_0000;
pub const GENERIC_WRITE: u32 = 0x4000_0000;
pub const GENERIC_READ: u32 = 0x8000_0000;

const S_IRWXU: u32 = 0o700;
const S_IRWXG: u32 = 0o070;
const S_IRWXO: u32 = 0o007;
const S_IRUGO: u32 = 0o444;
const S_IWUGO: u32 = 0o222;
const S_IXUGO: u32 = 0o111;

/// A Windows security identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sid {
    pub revision: u8,
    pub authority: [u8; 6],
    pub subs: Vec<u32>,
}

impl Sid {
    /// S-1-1-0, world
    pub fn everyone() -> Self {
        Self {
            revision: 1,
            authority: [0, 0, 0, 0, 0, 1],
            subs: vec![0],
        }
    }

    /// S-1-5-11, authenticated users
    pub fn authenticated_users() -> Self {
        Self {
            revision: 1,
            authority: [0, 0, 0, 0, 0, 5],
            subs: vec![11],
        }
    }

    /// S-1-22-1-{uid}, the Unix-user mapping domain
    pub fn unix_user(uid: u32) -> Self {
        Self {
            revision: 1,
            authority: [0, 0, 0, 0, 0, 22],
            subs: vec![1, uid],
        }
    }

    /// S-1-22-2-{gid}, the Unix-group mapping domain
    pub fn unix_group(gid: u32) -> Self {
        Self {
            revision: 1,
            authority: [0, 0, 0, 0, 0, 22],
            subs: vec![2, gid],
        }
    }

    /// Parse a SID, validating against the end of the enclosing ACL.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < SID_BASE_SIZE {
            return Err(Error::Malformed("SID truncated".to_string()));
        }
        let revision = buf[0];
        let count = buf[1] as usize;
        if count > SID_MAX_SUB_AUTHORITIES {
            return Err(Error::Malformed(format!(
                "SID has {} sub-authorities",
                count
            )));
        }
        let need = SID_BASE_SIZE + count * 4;
        if buf.len() < need {
            return Err(Error::Malformed("SID sub-authorities truncated".to_string()));
        }
        let mut authority = [0u8; 6];
        authority.copy_from_slice(&buf[2..8]);
        let subs = (0..count)
            .map(|i| LittleEndian::read_u32(&buf[8 + i * 4..12 + i * 4]))
            .collect();
        Ok((
            Self {
                revision,
                authority,
                subs,
            },
            need,
        ))
    }

    /// Serialize this SID.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.revision);
        out.push(self.subs.len() as u8);
        out.extend_from_slice(&self.authority);
        for sub in &self.subs {
            out.extend_from_slice(&sub.to_le_bytes());
        }
    }

    /// Encoded length.
    pub fn wire_len(&self) -> usize {
        SID_BASE_SIZE + self.subs.len() * 4
    }

    /// The 48-bit identifier authority as an integer.
    pub fn authority_value(&self) -> u64 {
        self.authority
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64)
    }
}

impl std::fmt::Display for Sid {
    /// Render `S-<rev>-<authority>-<sub...>`; the authority prints in hex
    /// when it exceeds 32 bits.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auth = self.authority_value();
        if auth > u32::MAX as u64 {
            write!(f, "S-{}-0x{:012x}", self.revision, auth)?;
        } else {
            write!(f, "S-{}-{}", self.revision, auth)?;
        }
        for sub in &self.subs {
            write!(f, "-{}", sub)?;
        }
        Ok(())
    }
}

/// Which side of the owner/group split a mapping applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidKind {
    Owner,
    Group,
}

/// Descriptor string presented to the id-mapping oracle for an id lookup,
/// e.g. `oi:1000`.
pub fn id_key_desc(id: u32, kind: SidKind) -> String {
    let prefix = match kind {
        SidKind::Owner => 'o',
        SidKind::Group => 'g',
    };
    format!("{}i:{}", prefix, id)
}

/// Descriptor string presented to the oracle for a SID lookup,
/// e.g. `os:S-1-5-21-...`.
pub fn sid_key_desc(sid: &Sid, kind: SidKind) -> String {
    let prefix = match kind {
        SidKind::Owner => 'o',
        SidKind::Group => 'g',
    };
    format!("{}s:{}", prefix, sid)
}

/// External id-mapping oracle.
///
/// Implementations resolve the short printable descriptors under their own
/// credential; lookups from untrusted input must not poison any cache the
/// implementation keeps.
pub trait IdMapper: Send + Sync {
    /// Map a local id to a SID. Failure is fatal for descriptor encoding.
    fn id_to_sid(&self, id: u32, kind: SidKind) -> Result<Sid>;

    /// Map a SID to a local id. Callers fall back to mount defaults when
    /// this fails, so a miss is non-fatal.
    fn sid_to_id(&self, sid: &Sid, kind: SidKind) -> Result<u32>;
}

/// Algorithmic mapper over the S-1-22 Unix authority.
#[derive(Debug, Default)]
pub struct UnixIdMapper;

impl IdMapper for UnixIdMapper {
    fn id_to_sid(&self, id: u32, kind: SidKind) -> Result<Sid> {
        Ok(match kind {
            SidKind::Owner => Sid::unix_user(id),
            SidKind::Group => Sid::unix_group(id),
        })
    }

    fn sid_to_id(&self, sid: &Sid, kind: SidKind) -> Result<u32> {
        let expected_domain = match kind {
            SidKind::Owner => 1,
            SidKind::Group => 2,
        };
        if sid.authority_value() == 22
            && sid.subs.len() == 2
            && sid.subs[0] == expected_domain
        {
            return Ok(sid.subs[1]);
        }
        Err(Error::NotFound(format!("no mapping for {}", sid)))
    }
}

/// A single access-control entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ace {
    pub ace_type: u8,
    pub flags: u8,
    pub access: u32,
    pub sid: Sid,
}

impl Ace {
    /// Encoded length.
    pub fn wire_len(&self) -> usize {
        8 + self.sid.wire_len()
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.ace_type);
        out.push(self.flags);
        out.extend_from_slice(&(self.wire_len() as u16).to_le_bytes());
        out.extend_from_slice(&self.access.to_le_bytes());
        self.sid.write_to(out);
    }
}

/// A discretionary ACL
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dacl {
    pub revision: u16,
    pub aces: Vec<Ace>,
}

impl Dacl {
    /// Parse an ACL, validating every ACE offset against the declared end.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::Malformed("ACL header truncated".to_string()));
        }
        let revision = LittleEndian::read_u16(&buf[0..2]);
        let size = LittleEndian::read_u16(&buf[2..4]) as usize;
        let num_aces = LittleEndian::read_u32(&buf[4..8]) as usize;
        if size > buf.len() {
            return Err(Error::Malformed("ACL size exceeds buffer".to_string()));
        }
        if num_aces > size / 12 {
            return Err(Error::Malformed(format!("implausible ACE count {}", num_aces)));
        }

        let mut aces = Vec::with_capacity(num_aces);
        let mut pos = 8;
        for _ in 0..num_aces {
            if pos + 8 > size {
                return Err(Error::Malformed("ACE header past ACL end".to_string()));
            }
            let ace_type = buf[pos];
            let flags = buf[pos + 1];
            let ace_size = LittleEndian::read_u16(&buf[pos + 2..pos + 4]) as usize;
            if ace_size < 16 || pos + ace_size > size {
                return Err(Error::Malformed("ACE size past ACL end".to_string()));
            }
            let access = LittleEndian::read_u32(&buf[pos + 4..pos + 8]);
            let (sid, _) = Sid::parse(&buf[pos + 8..pos + ace_size])?;
            aces.push(Ace {
                ace_type,
                flags,
                access,
                sid,
            });
            pos += ace_size;
        }
        Ok(Self { revision, aces })
    }

    /// Serialize this ACL.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let size: usize = 8 + self.aces.iter().map(Ace::wire_len).sum::<usize>();
        out.extend_from_slice(&self.revision.to_le_bytes());
        out.extend_from_slice(&(size as u16).to_le_bytes());
        out.extend_from_slice(&(self.aces.len() as u32).to_le_bytes());
        for ace in &self.aces {
            ace.write_to(out);
        }
    }

    /// Encoded length.
    pub fn wire_len(&self) -> usize {
        8 + self.aces.iter().map(Ace::wire_len).sum::<usize>()
    }
}

fn mode_to_access_flags(mode: u32, bits_to_use: u32) -> u32 {
    let mode = mode & bits_to_use;
    let mut flags = 0;
    if mode & S_IRUGO != 0 {
        flags |= SET_FILE_READ_RIGHTS;
    }
    if mode & S_IWUGO != 0 {
        flags |= SET_FILE_WRITE_RIGHTS;
    }
    if mode & S_IXUGO != 0 {
        flags |= SET_FILE_EXEC_RIGHTS;
    }
    flags
}

fn ace_for_sid(sid: Sid, mode: u32, bits: u32) -> Ace {
    let mut access = mode_to_access_flags(mode, bits);
    if access == 0 {
        access = SET_MINIMUM_RIGHTS;
    }
    Ace {
        ace_type: ACCESS_ALLOWED,
        flags: 0,
        access,
        sid,
    }
}

/// Build the canonical three-ACE chmod DACL for a POSIX mode.
pub fn mode_to_dacl(mode: u32, owner: Sid, group: Sid) -> Dacl {
    Dacl {
        revision: 2,
        aces: vec![
            ace_for_sid(owner, mode, S_IRWXU),
            ace_for_sid(group, mode, S_IRWXG),
            ace_for_sid(Sid::everyone(), mode, S_IRWXO),
        ],
    }
}

/// Fold one ACE's access mask into the mode under construction.
///
/// Deny-before-allow is canonical: a DENY ACE strips bits from the mask a
/// later ALLOW may set, so processing stays in wire order.
fn access_flags_to_mode(access: u32, ace_type: u8, mode: &mut u32, bits_to_set: &mut u32) {
    if ace_type == ACCESS_DENIED {
        if access & GENERIC_ALL != 0 {
            *bits_to_set &= !(S_IRWXU | S_IRWXG | S_IRWXO);
        }
        if access & GENERIC_WRITE != 0 || access & FILE_WRITE_RIGHTS == FILE_WRITE_RIGHTS {
            *bits_to_set &= !S_IWUGO;
        }
        if access & GENERIC_READ != 0 || access & FILE_READ_RIGHTS == FILE_READ_RIGHTS {
            *bits_to_set &= !S_IRUGO;
        }
        if access & GENERIC_EXECUTE != 0 || access & FILE_EXEC_RIGHTS == FILE_EXEC_RIGHTS {
            *bits_to_set &= !S_IXUGO;
        }
        return;
    }
    if ace_type != ACCESS_ALLOWED {
        return;
    }
    if access & GENERIC_ALL != 0 {
        *mode |= (S_IRWXU | S_IRWXG | S_IRWXO) & *bits_to_set;
        return;
    }
    if access & GENERIC_WRITE != 0 || access & FILE_WRITE_RIGHTS == FILE_WRITE_RIGHTS {
        *mode |= S_IWUGO & *bits_to_set;
    }
    if access & GENERIC_READ != 0 || access & FILE_READ_RIGHTS == FILE_READ_RIGHTS {
        *mode |= S_IRUGO & *bits_to_set;
    }
    if access & GENERIC_EXECUTE != 0 || access & FILE_EXEC_RIGHTS == FILE_EXEC_RIGHTS {
        *mode |= S_IXUGO & *bits_to_set;
    }
}

/// Translate a DACL into permission bits for the owner/group/other triplets.
///
/// An absent DACL yields full permission; an empty one yields none.
pub fn dacl_to_mode(dacl: Option<&Dacl>, owner: &Sid, group: &Sid) -> u32 {
    let dacl = match dacl {
        Some(d) => d,
        None => return S_IRWXU | S_IRWXG | S_IRWXO,
    };

    let mut mode = 0u32;
    let mut user_mask = S_IRWXU;
    let mut group_mask = S_IRWXG;
    let mut other_mask = S_IRWXO;
    let everyone = Sid::everyone();
    let authusers = Sid::authenticated_users();

    for ace in &dacl.aces {
        if ace.sid == *owner {
            access_flags_to_mode(ace.access, ace.ace_type, &mut mode, &mut user_mask);
        }
        if ace.sid == *group {
            access_flags_to_mode(ace.access, ace.ace_type, &mut mode, &mut group_mask);
        }
        if ace.sid == everyone || ace.sid == authusers {
            access_flags_to_mode(ace.access, ace.ace_type, &mut mode, &mut other_mask);
        }
    }
    mode
}

/// Check a desired-access mask against a DACL.
pub fn check_access(dacl: &Dacl, desired: u32) -> Result<()> {
    if dacl.aces.is_empty() {
        return Err(Error::AccessDenied("empty DACL grants nothing".to_string()));
    }

    // Initialized before any branch reads it; DENY entries win in wire order.
    let mut granted: u32 = 0;
    for ace in &dacl.aces {
        match ace.ace_type {
            ACCESS_DENIED => {
                let denied = if ace.access & GENERIC_ALL != 0 {
                    u32::MAX
                } else {
                    ace.access
                };
                if denied & desired != 0 {
                    return Err(Error::AccessDenied("denied by ACE".to_string()));
                }
            }
            ACCESS_ALLOWED => {
                granted |= if ace.access & GENERIC_ALL != 0 {
                    u32::MAX
                } else {
                    ace.access
                };
            }
            _ => {}
        }
    }

    if desired & !granted != 0 {
        return Err(Error::AccessDenied("rights not granted by DACL".to_string()));
    }
    Ok(())
}

/// Parsed self-relative security descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityDescriptor {
    pub control: u16,
    pub owner: Option<Sid>,
    pub group: Option<Sid>,
    pub dacl: Option<Dacl>,
}

impl SecurityDescriptor {
    /// Parse a self-relative descriptor.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 20 {
            return Err(Error::Malformed("descriptor header truncated".to_string()));
        }
        let control = LittleEndian::read_u16(&buf[2..4]);
        let owner_off = LittleEndian::read_u32(&buf[4..8]) as usize;
        let group_off = LittleEndian::read_u32(&buf[8..12]) as usize;
        let dacl_off = LittleEndian::read_u32(&buf[16..20]) as usize;

        let owner = if owner_off != 0 {
            if owner_off >= buf.len() {
                return Err(Error::Malformed("owner SID offset out of range".to_string()));
            }
            Some(Sid::parse(&buf[owner_off..])?.0)
        } else {
            None
        };
        let group = if group_off != 0 {
            if group_off >= buf.len() {
                return Err(Error::Malformed("group SID offset out of range".to_string()));
            }
            Some(Sid::parse(&buf[group_off..])?.0)
        } else {
            None
        };
        let dacl = if dacl_off != 0 {
            if dacl_off >= buf.len() {
                return Err(Error::Malformed("DACL offset out of range".to_string()));
            }
            Some(Dacl::parse(&buf[dacl_off..])?)
        } else {
            None
        };

        Ok(Self {
            control,
            owner,
            group,
            dacl,
        })
    }

    /// Build a self-relative descriptor for the selected info classes.
    pub fn build(
        info: u32,
        uid: u32,
        gid: u32,
        mode: u32,
        mapper: &dyn IdMapper,
    ) -> Result<Vec<u8>> {
        let mut control = SELF_RELATIVE;
        let owner = if info & OWNER_SECINFO != 0 {
            Some(mapper.id_to_sid(uid, SidKind::Owner)?)
        } else {
            None
        };
        let group = if info & GROUP_SECINFO != 0 {
            Some(mapper.id_to_sid(gid, SidKind::Group)?)
        } else {
            None
        };
        let dacl = if info & DACL_SECINFO != 0 {
            control |= DACL_PRESENT;
            let owner_sid = owner
                .clone()
                .map(Ok)
                .unwrap_or_else(|| mapper.id_to_sid(uid, SidKind::Owner))?;
            let group_sid = group
                .clone()
                .map(Ok)
                .unwrap_or_else(|| mapper.id_to_sid(gid, SidKind::Group))?;
            Some(mode_to_dacl(mode, owner_sid, group_sid))
        } else {
            None
        };

        let mut offset = 20usize;
        let owner_off = owner.as_ref().map(|s| {
            let o = offset;
            offset += s.wire_len();
            o
        });
        let group_off = group.as_ref().map(|s| {
            let o = offset;
            offset += s.wire_len();
            o
        });
        let dacl_off = dacl.as_ref().map(|d| {
            let o = offset;
            offset += d.wire_len();
            o
        });

        let mut out = Vec::with_capacity(offset);
        out.extend_from_slice(&SD_REVISION.to_le_bytes());
        out.extend_from_slice(&control.to_le_bytes());
        out.extend_from_slice(&(owner_off.unwrap_or(0) as u32).to_le_bytes());
        out.extend_from_slice(&(group_off.unwrap_or(0) as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // SACL
        out.extend_from_slice(&(dacl_off.unwrap_or(0) as u32).to_le_bytes());
        if let Some(s) = &owner {
            s.write_to(&mut out);
        }
        if let Some(s) = &group {
            s.write_to(&mut out);
        }
        if let Some(d) = &dacl {
            d.write_to(&mut out);
        }
        Ok(out)
    }

    /// Resolve this descriptor into POSIX ownership and permissions, using
    /// `fallback_uid`/`fallback_gid` when the oracle has no mapping.
    pub fn to_posix(
        &self,
        mapper: &dyn IdMapper,
        fallback_uid: u32,
        fallback_gid: u32,
    ) -> (u32, u32, Option<u32>) {
        let uid = self
            .owner
            .as_ref()
            .and_then(|s| mapper.sid_to_id(s, SidKind::Owner).ok())
            .unwrap_or(fallback_uid);
        let gid = self
            .group
            .as_ref()
            .and_then(|s| mapper.sid_to_id(s, SidKind::Group).ok())
            .unwrap_or(fallback_gid);
        let mode = match (&self.owner, &self.group) {
            (Some(o), Some(g)) => Some(dacl_to_mode(self.dacl.as_ref(), o, g)),
            _ => None,
        };
        (uid, gid, mode)
    }
}

/// POSIX ACL tags, identical on the wire and in the xattr encoding
pub mod posix_acl_tag {
    pub const USER_OBJ: u16 = 0x01;
    pub const USER: u16 = 0x02;
    pub const GROUP_OBJ: u16 = 0x04;
    pub const GROUP: u16 = 0x08;
    pub const MASK: u16 = 0x10;
    pub const OTHER: u16 = 0x20;
}

/// Sentinel for entries without a qualifier id
pub const ACL_UNDEFINED_ID: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// POSIX ACL version carried on the SMB wire
pub const SMB_POSIX_ACL_VERSION: u16 = 1;
/// POSIX ACL version of the Linux xattr encoding
pub const XATTR_POSIX_ACL_VERSION: u32 = 2;

/// One POSIX ACL entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosixAclEntry {
    pub tag: u16,
    pub perm: u16,
    pub id: u64,
}

/// A POSIX ACL pair (access + default) in transit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PosixAcl {
    pub access: Vec<PosixAclEntry>,
    pub default: Vec<PosixAclEntry>,
}

impl PosixAcl {
    /// Parse the SMB wire form: a 6-byte header then 10-byte entries of
    /// (perm u8, tag u8, id u64).
    pub fn parse_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() < 6 {
            return Err(Error::Malformed("POSIX ACL header truncated".to_string()));
        }
        let version = LittleEndian::read_u16(&buf[0..2]);
        if version != SMB_POSIX_ACL_VERSION {
            return Err(Error::Malformed(format!("POSIX ACL version {}", version)));
        }
        let access_count = LittleEndian::read_u16(&buf[2..4]) as usize;
        let default_count = LittleEndian::read_u16(&buf[4..6]) as usize;
        let need = 6 + (access_count + default_count) * 10;
        if buf.len() < need {
            return Err(Error::Malformed("POSIX ACL entries truncated".to_string()));
        }

        let read_entries = |start: usize, count: usize| {
            (0..count)
                .map(|i| {
                    let off = start + i * 10;
                    PosixAclEntry {
                        perm: buf[off] as u16,
                        tag: buf[off + 1] as u16,
                        id: LittleEndian::read_u64(&buf[off + 2..off + 10]),
                    }
                })
                .collect::<Vec<_>>()
        };

        Ok(Self {
            access: read_entries(6, access_count),
            default: read_entries(6 + access_count * 10, default_count),
        })
    }

    /// Serialize to the SMB wire form.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + (self.access.len() + self.default.len()) * 10);
        out.extend_from_slice(&SMB_POSIX_ACL_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.access.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.default.len() as u16).to_le_bytes());
        for e in self.access.iter().chain(self.default.iter()) {
            out.push(e.perm as u8);
            out.push(e.tag as u8);
            out.extend_from_slice(&e.id.to_le_bytes());
        }
        out
    }

    /// Parse one list from the Linux `system.posix_acl_*` xattr encoding.
    pub fn entries_from_xattr(buf: &[u8]) -> Result<Vec<PosixAclEntry>> {
        if buf.len() < 4 {
            return Err(Error::Malformed("POSIX ACL xattr truncated".to_string()));
        }
        let version = LittleEndian::read_u32(&buf[0..4]);
        if version != XATTR_POSIX_ACL_VERSION {
            return Err(Error::Malformed(format!("ACL xattr version {}", version)));
        }
        if (buf.len() - 4) % 8 != 0 {
            return Err(Error::Malformed("ragged ACL xattr".to_string()));
        }
        Ok(buf[4..]
            .chunks_exact(8)
            .map(|c| {
                let id = LittleEndian::read_u32(&c[4..8]);
                PosixAclEntry {
                    tag: LittleEndian::read_u16(&c[0..2]),
                    perm: LittleEndian::read_u16(&c[2..4]),
                    id: if id == u32::MAX {
                        ACL_UNDEFINED_ID
                    } else {
                        id as u64
                    },
                }
            })
            .collect())
    }

    /// Serialize one list into the Linux xattr encoding.
    pub fn entries_to_xattr(entries: &[PosixAclEntry]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + entries.len() * 8);
        out.extend_from_slice(&XATTR_POSIX_ACL_VERSION.to_le_bytes());
        for e in entries {
            out.extend_from_slice(&e.tag.to_le_bytes());
            out.extend_from_slice(&e.perm.to_le_bytes());
            let id = if e.id == ACL_UNDEFINED_ID {
                u32::MAX
            } else {
                e.id as u32
            };
            out.extend_from_slice(&id.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sid_round_trip() {
        let sid = Sid::unix_user(1000);
        let mut buf = Vec::new();
        sid.write_to(&mut buf);
        let (parsed, used) = Sid::parse(&buf).unwrap();
        assert_eq!(parsed, sid);
        assert_eq!(used, sid.wire_len());
        assert_eq!(sid.to_string(), "S-1-22-1-1000");
    }

    #[test]
    fn test_sid_display_large_authority() {
        let sid = Sid {
            revision: 1,
            authority: [0x01, 0, 0, 0, 0, 0],
            subs: vec![],
        };
        assert!(sid.to_string().starts_with("S-1-0x"));
    }

    #[test]
    fn test_sid_bounds_checked() {
        assert!(Sid::parse(&[1, 200, 0, 0, 0, 0, 0, 5]).is_err());
        assert!(Sid::parse(&[1, 2, 0, 0, 0, 0, 0, 5, 1, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_key_descriptors() {
        assert_eq!(id_key_desc(1000, SidKind::Owner), "oi:1000");
        assert_eq!(id_key_desc(100, SidKind::Group), "gi:100");
        let sid = Sid::unix_group(20);
        assert_eq!(sid_key_desc(&sid, SidKind::Group), "gs:S-1-22-2-20");
    }

    #[test]
    fn test_unix_mapper_round_trip() {
        let mapper = UnixIdMapper;
        let sid = mapper.id_to_sid(1000, SidKind::Owner).unwrap();
        assert_eq!(mapper.sid_to_id(&sid, SidKind::Owner).unwrap(), 1000);
        assert!(mapper.sid_to_id(&sid, SidKind::Group).is_err());
    }

    #[test]
    fn test_mode_dacl_round_trip() {
        for mode in [0o644, 0o600, 0o755, 0o640, 0o444, 0o604, 0o000, 0o777] {
            let owner = Sid::unix_user(1);
            let group = Sid::unix_group(2);
            let dacl = mode_to_dacl(mode, owner.clone(), group.clone());
            assert_eq!(dacl.aces.len(), 3);
            assert!(dacl.aces.iter().all(|a| a.ace_type == ACCESS_ALLOWED));
            let back = dacl_to_mode(Some(&dacl), &owner, &group);
            assert_eq!(back, mode, "mode {:o} did not round trip", mode);
        }
    }

    #[test]
    fn test_absent_vs_empty_dacl() {
        let owner = Sid::unix_user(1);
        let group = Sid::unix_group(2);
        assert_eq!(dacl_to_mode(None, &owner, &group), 0o777);
        let empty = Dacl::default();
        assert_eq!(dacl_to_mode(Some(&empty), &owner, &group), 0);
    }

    #[test]
    fn test_deny_masks_later_allow() {
        let owner = Sid::unix_user(1);
        let group = Sid::unix_group(2);
        let dacl = Dacl {
            revision: 2,
            aces: vec![
                Ace {
                    ace_type: ACCESS_DENIED,
                    flags: 0,
                    access: GENERIC_WRITE,
                    sid: owner.clone(),
                },
                Ace {
                    ace_type: ACCESS_ALLOWED,
                    flags: 0,
                    access: GENERIC_ALL,
                    sid: owner.clone(),
                },
            ],
        };
        let mode = dacl_to_mode(Some(&dacl), &owner, &group);
        assert_eq!(mode & 0o700, 0o500);
    }

    #[test]
    fn test_dacl_round_trip_wire() {
        let dacl = mode_to_dacl(0o640, Sid::unix_user(5), Sid::unix_group(6));
        let mut buf = Vec::new();
        dacl.write_to(&mut buf);
        let parsed = Dacl::parse(&buf).unwrap();
        assert_eq!(parsed, dacl);
    }

    #[test]
    fn test_hostile_acl_rejected() {
        // num_aces claims more entries than the ACL can hold
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(&8u16.to_le_bytes());
        buf.extend_from_slice(&1000u32.to_le_bytes());
        assert!(Dacl::parse(&buf).is_err());
    }

    #[test]
    fn test_check_access_explicit_init() {
        let sid = Sid::unix_user(1);
        let allow_read = Dacl {
            revision: 2,
            aces: vec![Ace {
                ace_type: ACCESS_ALLOWED,
                flags: 0,
                access: FILE_READ_RIGHTS,
                sid: sid.clone(),
            }],
        };
        assert!(check_access(&allow_read, FILE_READ_RIGHTS).is_ok());
        assert!(check_access(&allow_read, FILE_WRITE_RIGHTS).is_err());
        assert!(check_access(&Dacl::default(), FILE_READ_RIGHTS).is_err());
    }

    #[test]
    fn test_descriptor_build_parse() {
        let mapper = UnixIdMapper;
        let buf = SecurityDescriptor::build(
            OWNER_SECINFO | GROUP_SECINFO | DACL_SECINFO,
            1000,
            100,
            0o644,
            &mapper,
        )
        .unwrap();
        let sd = SecurityDescriptor::parse(&buf).unwrap();
        assert_eq!(sd.owner, Some(Sid::unix_user(1000)));
        assert_eq!(sd.group, Some(Sid::unix_group(100)));
        let (uid, gid, mode) = sd.to_posix(&mapper, 0, 0);
        assert_eq!((uid, gid), (1000, 100));
        assert_eq!(mode, Some(0o644));
    }

    #[test]
    fn test_posix_acl_wire_round_trip() {
        let acl = PosixAcl {
            access: vec![
                PosixAclEntry {
                    tag: posix_acl_tag::USER_OBJ,
                    perm: 6,
                    id: ACL_UNDEFINED_ID,
                },
                PosixAclEntry {
                    tag: posix_acl_tag::GROUP_OBJ,
                    perm: 4,
                    id: ACL_UNDEFINED_ID,
                },
                PosixAclEntry {
                    tag: posix_acl_tag::OTHER,
                    perm: 4,
                    id: ACL_UNDEFINED_ID,
                },
            ],
            default: vec![],
        };
        let wire = acl.to_wire();
        assert_eq!(PosixAcl::parse_wire(&wire).unwrap(), acl);
    }

    #[test]
    fn test_posix_acl_xattr_round_trip() {
        let entries = vec![
            PosixAclEntry {
                tag: posix_acl_tag::USER_OBJ,
                perm: 7,
                id: ACL_UNDEFINED_ID,
            },
            PosixAclEntry {
                tag: posix_acl_tag::USER,
                perm: 5,
                id: 1000,
            },
        ];
        let xattr = PosixAcl::entries_to_xattr(&entries);
        assert_eq!(PosixAcl::entries_from_xattr(&xattr).unwrap(), entries);
    }
}
