//! Protocol constants for SMB1/CIFS

use bitflags::bitflags;

/// SMB1 protocol marker at the start of every message
pub const SMB_MAGIC: [u8; 4] = [0xFF, b'S', b'M', b'B'];

/// Fixed SMB1 header size (magic through MID)
pub const SMB_HEADER_SIZE: usize = 32;

/// RFC1002 length prefix on TCP
pub const NETBIOS_HEADER_SIZE: usize = 4;

/// Smallest parseable request: header + WordCount + ByteCount
pub const MIN_SMB_SIZE: usize = SMB_HEADER_SIZE + 1 + 2;

/// Largest SMB buffer advertised in negotiate
pub const MAX_SMB_BUF_SIZE: usize = 65536;

/// Default response allocation for small commands
pub const SMALL_RSP_BUF_SIZE: usize = 512;

/// Response allocation for known-large commands
pub const LARGE_RSP_BUF_SIZE: usize = MAX_SMB_BUF_SIZE;

/// Terminator value in an AndXCommand field
pub const NO_MORE_ANDX_COMMAND: u8 = 0xFF;

/// Server challenge length
pub const CRYPTO_KEY_SIZE: usize = 8;

/// Length of a classic 24-byte NTLM challenge response
pub const NTLM_AUTH_RESPONSE_SIZE: usize = 24;

/// Client-challenge suffix carried in an LMv2/NTLMv2 blob
pub const ENCPWD_SIZE: usize = 16;

/// SMB1 command codes
pub mod command {
    pub const CREATE_DIRECTORY: u8 = 0x00;
    pub const DELETE_DIRECTORY: u8 = 0x01;
    pub const CLOSE: u8 = 0x04;
    pub const FLUSH: u8 = 0x05;
    pub const DELETE: u8 = 0x06;
    pub const RENAME: u8 = 0x07;
    pub const QUERY_INFORMATION: u8 = 0x08;
    pub const SET_INFORMATION: u8 = 0x09;
    pub const WRITE: u8 = 0x0B;
    pub const CHECK_DIRECTORY: u8 = 0x10;
    pub const PROCESS_EXIT: u8 = 0x11;
    pub const LOCKING_ANDX: u8 = 0x24;
    pub const TRANSACTION: u8 = 0x25;
    pub const ECHO: u8 = 0x2B;
    pub const OPEN_ANDX: u8 = 0x2D;
    pub const READ_ANDX: u8 = 0x2E;
    pub const WRITE_ANDX: u8 = 0x2F;
    pub const TRANSACTION2: u8 = 0x32;
    pub const FIND_CLOSE2: u8 = 0x34;
    pub const TREE_DISCONNECT: u8 = 0x71;
    pub const NEGOTIATE: u8 = 0x72;
    pub const SESSION_SETUP_ANDX: u8 = 0x73;
    pub const LOGOFF_ANDX: u8 = 0x74;
    pub const TREE_CONNECT_ANDX: u8 = 0x75;
    pub const NT_CREATE_ANDX: u8 = 0xA2;
    pub const NT_CANCEL: u8 = 0xA4;
    pub const NT_RENAME: u8 = 0xA5;
}

bitflags! {
    /// Flags byte of the SMB1 header
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeaderFlags: u8 {
        const LOCK_AND_READ_OK  = 0x01;
        const BUF_AVAIL         = 0x02;
        const CASELESS          = 0x08;
        const CANONICAL_PATHS   = 0x10;
        const OPLOCK            = 0x20;
        const OPBATCH           = 0x40;
        const RESPONSE          = 0x80;
    }
}

bitflags! {
    /// Flags2 word of the SMB1 header
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeaderFlags2: u16 {
        const LONG_NAMES_ALLOWED    = 0x0001;
        const EAS                   = 0x0002;
        const SECURITY_SIGNATURE    = 0x0004;
        const IS_LONG_NAME          = 0x0040;
        const EXTENDED_SECURITY     = 0x0800;
        const DFS                   = 0x1000;
        const PAGING_IO             = 0x2000;
        const ERR_STATUS            = 0x4000;
        const UNICODE               = 0x8000;
    }
}

bitflags! {
    /// Capability bits advertised in negotiate
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u32 {
        const RAW_MODE              = 0x0000_0001;
        const MPX_MODE              = 0x0000_0002;
        const UNICODE               = 0x0000_0004;
        const LARGE_FILES           = 0x0000_0008;
        const NT_SMBS               = 0x0000_0010;
        const RPC_REMOTE_APIS       = 0x0000_0020;
        const STATUS32              = 0x0000_0040;
        const LEVEL_II_OPLOCKS      = 0x0000_0080;
        const LOCK_AND_READ         = 0x0000_0100;
        const NT_FIND               = 0x0000_0200;
        const DFS                   = 0x0000_1000;
        const INFOLEVEL_PASSTHRU    = 0x0000_2000;
        const LARGE_READ_X          = 0x0000_4000;
        const LARGE_WRITE_X         = 0x0000_8000;
        const UNIX                  = 0x0080_0000;
        const EXTENDED_SECURITY     = 0x8000_0000;
    }
}

/// SecurityMode bits in the negotiate response
pub mod security_mode {
    pub const USER_SECURITY: u8 = 0x01;
    pub const ENCRYPT_PASSWORDS: u8 = 0x02;
    pub const SIGN_ENABLED: u8 = 0x04;
    pub const SIGN_REQUIRED: u8 = 0x08;
}

/// Values negotiated alongside the dialect
pub mod negotiate {
    /// Only one outstanding request per connection in SMB1
    pub const MAX_MPX_COUNT: u16 = 1;
    /// Single virtual circuit
    pub const MAX_VCS: u16 = 1;
    /// Raw-mode buffer ceiling
    pub const MAX_RAW_SIZE: u32 = 0x10000;
    /// Index returned when no listed dialect is acceptable
    pub const BAD_DIALECT: u16 = 0xFFFF;
}

/// TRANSACTION2 sub-command codes
pub mod trans2 {
    pub const FIND_FIRST: u16 = 0x0001;
    pub const FIND_NEXT: u16 = 0x0002;
    pub const QUERY_FS_INFORMATION: u16 = 0x0003;
    pub const SET_FS_INFORMATION: u16 = 0x0004;
    pub const QUERY_PATH_INFORMATION: u16 = 0x0005;
    pub const SET_PATH_INFORMATION: u16 = 0x0006;
    pub const QUERY_FILE_INFORMATION: u16 = 0x0007;
    pub const SET_FILE_INFORMATION: u16 = 0x0008;
    pub const CREATE_DIRECTORY: u16 = 0x000D;
    pub const GET_DFS_REFERRAL: u16 = 0x0010;
}

/// FIND_FIRST / FIND_NEXT information levels
pub mod find_level {
    pub const DIRECTORY_INFO: u16 = 0x0101;
    pub const FULL_DIRECTORY_INFO: u16 = 0x0102;
    pub const BOTH_DIRECTORY_INFO: u16 = 0x0104;
    pub const ID_FULL_DIR_INFO: u16 = 0x0105;
    pub const UNIX_INFO: u16 = 0x0202;
}

/// QUERY_PATH / QUERY_FILE information levels
pub mod query_level {
    pub const INFO_STANDARD: u16 = 0x0001;
    pub const INFO_QUERY_EA_SIZE: u16 = 0x0002;
    pub const INFO_QUERY_ALL_EAS: u16 = 0x0004;
    pub const QUERY_FILE_BASIC_INFO: u16 = 0x0101;
    pub const QUERY_FILE_STANDARD_INFO: u16 = 0x0102;
    pub const QUERY_FILE_EA_INFO: u16 = 0x0103;
    pub const QUERY_FILE_NAME_INFO: u16 = 0x0104;
    pub const QUERY_FILE_ALL_INFO: u16 = 0x0107;
    pub const QUERY_FILE_ALT_NAME_INFO: u16 = 0x0108;
    pub const QUERY_FILE_UNIX_BASIC: u16 = 0x0200;
    pub const QUERY_FILE_UNIX_LINK: u16 = 0x0201;
    pub const QUERY_POSIX_ACL: u16 = 0x0204;
    /// NT passthrough: FileBasicInformation
    pub const PASSTHRU_BASIC_INFO: u16 = 0x03EC;
    /// NT passthrough: FileInternalInformation
    pub const PASSTHRU_INTERNAL_INFO: u16 = 0x03EE;
    /// Security descriptor of the object
    pub const QUERY_CIFS_ACL: u16 = 0x040F;
}

/// SET_PATH / SET_FILE information levels
pub mod set_level {
    pub const INFO_STANDARD: u16 = 0x0001;
    pub const INFO_SET_EAS: u16 = 0x0002;
    pub const SET_FILE_BASIC_INFO: u16 = 0x0101;
    pub const SET_FILE_DISPOSITION_INFO: u16 = 0x0102;
    pub const SET_FILE_ALLOCATION_INFO: u16 = 0x0103;
    pub const SET_FILE_END_OF_FILE_INFO: u16 = 0x0104;
    pub const SET_FILE_UNIX_BASIC: u16 = 0x0200;
    pub const SET_FILE_UNIX_LINK: u16 = 0x0201;
    pub const SET_FILE_UNIX_HLINK: u16 = 0x0203;
    pub const SET_POSIX_ACL: u16 = 0x0204;
    pub const POSIX_OPEN: u16 = 0x0209;
    pub const POSIX_UNLINK: u16 = 0x020A;
    /// NT passthrough: FileBasicInformation
    pub const PASSTHRU_BASIC_INFO: u16 = 0x03EC;
    /// NT passthrough: FileRenameInformation
    pub const PASSTHRU_RENAME_INFORMATION: u16 = 0x03F2;
    /// NT passthrough: FileDispositionInformation
    pub const PASSTHRU_DISPOSITION_INFO: u16 = 0x03F5;
    /// NT passthrough: FileAllocationInformation
    pub const PASSTHRU_ALLOCATION_INFO: u16 = 0x03FB;
    /// NT passthrough: FileEndOfFileInformation
    pub const PASSTHRU_END_OF_FILE_INFO: u16 = 0x03FC;
    /// Security descriptor of the object (chmod via DACL)
    pub const SET_CIFS_ACL: u16 = 0x040F;
}

/// QUERY_FS information levels
pub mod fs_level {
    pub const INFO_ALLOCATION: u16 = 0x0001;
    pub const INFO_VOLUME: u16 = 0x0002;
    pub const QUERY_FS_VOLUME_INFO: u16 = 0x0102;
    pub const QUERY_FS_SIZE_INFO: u16 = 0x0103;
    pub const QUERY_FS_DEVICE_INFO: u16 = 0x0104;
    pub const QUERY_FS_ATTRIBUTE_INFO: u16 = 0x0105;
    pub const QUERY_CIFS_UNIX_INFO: u16 = 0x0200;
    pub const QUERY_POSIX_FS_INFO: u16 = 0x0201;
    pub const SET_CIFS_UNIX_INFO: u16 = 0x0200;
}

bitflags! {
    /// DOS file attribute bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileAttributes: u32 {
        const READONLY  = 0x0001;
        const HIDDEN    = 0x0002;
        const SYSTEM    = 0x0004;
        const VOLUME    = 0x0008;
        const DIRECTORY = 0x0010;
        const ARCHIVE   = 0x0020;
        const DEVICE    = 0x0040;
        const NORMAL    = 0x0080;
        const TEMPORARY = 0x0100;
        const SPARSE    = 0x0200;
        const REPARSE   = 0x0400;
        const COMPRESSED = 0x0800;
        const OFFLINE   = 0x1000;
        const NOT_INDEXED = 0x2000;
        const ENCRYPTED = 0x4000;
    }
}

bitflags! {
    /// NT access mask bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessMask: u32 {
        const FILE_READ_DATA        = 0x0000_0001;
        const FILE_WRITE_DATA       = 0x0000_0002;
        const FILE_APPEND_DATA      = 0x0000_0004;
        const FILE_READ_EA          = 0x0000_0008;
        const FILE_WRITE_EA         = 0x0000_0010;
        const FILE_EXECUTE          = 0x0000_0020;
        const FILE_DELETE_CHILD     = 0x0000_0040;
        const FILE_READ_ATTRIBUTES  = 0x0000_0080;
        const FILE_WRITE_ATTRIBUTES = 0x0000_0100;
        const DELETE                = 0x0001_0000;
        const READ_CONTROL          = 0x0002_0000;
        const WRITE_DAC             = 0x0004_0000;
        const WRITE_OWNER           = 0x0008_0000;
        const SYNCHRONIZE           = 0x0010_0000;
        const SYSTEM_SECURITY       = 0x0100_0000;
        const MAXIMAL_ACCESS        = 0x0200_0000;
        const GENERIC_ALL           = 0x1000_0000;
        const GENERIC_EXECUTE       = 0x2000_0000;
        const GENERIC_WRITE         = 0x4000_0000;
        const GENERIC_READ          = 0x8000_0000;
    }
}

impl AccessMask {
    /// Rights that permit reading file data.
    pub fn grants_read(self) -> bool {
        self.intersects(
            AccessMask::FILE_READ_DATA
                | AccessMask::GENERIC_READ
                | AccessMask::GENERIC_ALL
                | AccessMask::MAXIMAL_ACCESS,
        )
    }

    /// Rights that permit writing file data.
    pub fn grants_write(self) -> bool {
        self.intersects(
            AccessMask::FILE_WRITE_DATA
                | AccessMask::FILE_APPEND_DATA
                | AccessMask::GENERIC_WRITE
                | AccessMask::GENERIC_ALL
                | AccessMask::MAXIMAL_ACCESS,
        )
    }

    /// Rights that permit deleting the object.
    pub fn grants_delete(self) -> bool {
        self.intersects(AccessMask::DELETE | AccessMask::GENERIC_ALL | AccessMask::MAXIMAL_ACCESS)
    }
}

/// NT_CREATE_ANDX create dispositions
pub mod disposition {
    pub const SUPERSEDE: u32 = 0;
    pub const OPEN: u32 = 1;
    pub const CREATE: u32 = 2;
    pub const OPEN_IF: u32 = 3;
    pub const OVERWRITE: u32 = 4;
    pub const OVERWRITE_IF: u32 = 5;
}

/// NT_CREATE_ANDX create options
pub mod create_options {
    pub const DIRECTORY_FILE: u32 = 0x0000_0001;
    pub const WRITE_THROUGH: u32 = 0x0000_0002;
    pub const SEQUENTIAL_ONLY: u32 = 0x0000_0004;
    pub const NON_DIRECTORY_FILE: u32 = 0x0000_0040;
    pub const DELETE_ON_CLOSE: u32 = 0x0000_1000;
    pub const OPEN_BY_FILE_ID: u32 = 0x0000_2000;
}

/// CreateAction values echoed in open responses
pub mod create_action {
    pub const SUPERSEDED: u32 = 0;
    pub const OPENED: u32 = 1;
    pub const CREATED: u32 = 2;
    pub const OVERWRITTEN: u32 = 3;
}

/// File share-access bits in NT_CREATE_ANDX
pub mod share_access {
    pub const READ: u32 = 0x01;
    pub const WRITE: u32 = 0x02;
    pub const DELETE: u32 = 0x04;
}

/// LOCKING_ANDX LockType bits
pub mod lock_type {
    pub const SHARED_LOCK: u8 = 0x01;
    pub const OPLOCK_RELEASE: u8 = 0x02;
    pub const CHANGE_LOCKTYPE: u8 = 0x04;
    pub const CANCEL_LOCK: u8 = 0x08;
    pub const LARGE_FILES: u8 = 0x10;
}

/// OptionalSupport bits in the tree connect response
pub const SMB_SUPPORT_SEARCH_BITS: u16 = 0x0001;

/// Service strings for tree connect responses
pub mod service {
    pub const DISK: &str = "A:";
    pub const PIPE: &str = "IPC";
}

/// Known dialect strings, weakest first
pub const DIALECT_NT_LM_012: &str = "NT LM 0.12";
pub const DIALECT_SMB_2_002: &str = "SMB 2.002";
pub const DIALECT_SMB_2_WILDCARD: &str = "SMB 2.???";
