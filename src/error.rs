//! Error types for the CIFS server

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for CIFS protocol operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Wire-format parsing error
    #[error("Malformed request: {0}")]
    Malformed(String),

    /// Invalid SMB header
    #[error("Invalid SMB header: {0}")]
    InvalidHeader(String),

    /// No mutually supported dialect
    #[error("Unsupported dialect: {0}")]
    UnsupportedDialect(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Buffer too small
    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    /// Timeout occurred
    #[error("Operation timed out")]
    Timeout,

    /// Not implemented
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Access denied
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Unknown or unsupported information level
    #[error("Unsupported information level: 0x{0:x}")]
    UnsupportedLevel(u16),

    /// The FID does not name a live open
    #[error("Invalid handle: {0}")]
    InvalidHandle(u64),

    /// Byte-range lock conflict
    #[error("Lock conflict")]
    LockConflict,

    /// Share mode conflict with an existing open
    #[error("Sharing violation: {0}")]
    SharingViolation(String),

    /// Rename endpoints on different mounts
    #[error("Cross-device operation")]
    CrossDevice,

    /// Directory operation on a non-directory
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// Data operation on a directory
    #[error("Is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty
    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Handle table exhausted
    #[error("Too many open files")]
    TooManyOpenFiles,

    /// Allocation failure or resource exhaustion
    #[error("Out of resources: {0}")]
    Resource(String),

    /// Cryptographic failure
    #[error("Crypto error: {0}")]
    CryptoError(String),

    /// Message signing failure
    #[error("Signing error: {0}")]
    SigningError(String),

    /// Generic protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection closed by peer
    #[error("Connection closed")]
    ConnectionClosed,

    /// Request state machine violation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Pipe service failure
    #[error("Pipe error: {0}")]
    PipeError(String),

    /// Request was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Broken internal invariant; reported, never a panic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error onto the NTSTATUS value framed back to the client.
    pub fn status(&self) -> NtStatus {
        match self {
            Error::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => NtStatus::ObjectNameNotFound,
                io::ErrorKind::PermissionDenied => NtStatus::AccessDenied,
                io::ErrorKind::AlreadyExists => NtStatus::ObjectNameCollision,
                io::ErrorKind::WouldBlock => NtStatus::FileLockConflict,
                io::ErrorKind::InvalidInput => NtStatus::InvalidParameter,
                io::ErrorKind::OutOfMemory => NtStatus::NoMemory,
                _ => NtStatus::UnexpectedIoError,
            },
            Error::Malformed(_)
            | Error::InvalidHeader(_)
            | Error::BufferTooSmall { .. }
            | Error::Protocol(_)
            | Error::InvalidParameter(_) => NtStatus::InvalidParameter,
            Error::UnsupportedDialect(_) => NtStatus::InvalidLogonType,
            Error::AuthenticationFailed(_) => NtStatus::LogonFailure,
            Error::Timeout => NtStatus::IoTimeout,
            Error::NotImplemented(_) => NtStatus::NotSupported,
            Error::UnsupportedLevel(_) => NtStatus::InvalidLevel,
            Error::AccessDenied(_) => NtStatus::AccessDenied,
            Error::NotFound(_) => NtStatus::ObjectNameNotFound,
            Error::AlreadyExists(_) => NtStatus::ObjectNameCollision,
            Error::InvalidHandle(_) => NtStatus::InvalidHandle,
            Error::LockConflict => NtStatus::FileLockConflict,
            Error::SharingViolation(_) => NtStatus::SharingViolation,
            Error::CrossDevice => NtStatus::NotSameDevice,
            Error::NotADirectory(_) => NtStatus::NotADirectory,
            Error::IsADirectory(_) => NtStatus::FileIsADirectory,
            Error::DirectoryNotEmpty(_) => NtStatus::DirectoryNotEmpty,
            Error::TooManyOpenFiles => NtStatus::TooManyOpenedFiles,
            Error::Resource(_) => NtStatus::NoMemory,
            Error::CryptoError(_) | Error::SigningError(_) => NtStatus::AccessDenied,
            Error::ConnectionClosed => NtStatus::ConnectionDisconnected,
            Error::InvalidState(_) => NtStatus::InvalidDeviceState,
            Error::PipeError(_) => NtStatus::PipeDisconnected,
            Error::Cancelled => NtStatus::Cancelled,
            Error::Internal(_) => NtStatus::InternalError,
        }
    }
}

/// NTSTATUS codes the server frames in response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NtStatus {
    /// The operation completed successfully
    Success = 0x0000_0000,
    /// Asynchronous operation pending
    Pending = 0x0000_0103,
    /// Output truncated to the supplied buffer
    BufferOverflow = 0x8000_0005,
    /// Directory enumeration exhausted
    NoMoreFiles = 0x8000_0006,
    /// Generic failure
    Unsuccessful = 0xC000_0001,
    /// The request is not implemented
    NotImplemented = 0xC000_0002,
    /// The information class is not supported
    InvalidInfoClass = 0xC000_0003,
    /// The specified handle is invalid
    InvalidHandle = 0xC000_0008,
    /// The parameter is incorrect
    InvalidParameter = 0xC000_000D,
    /// No such device
    NoSuchDevice = 0xC000_000E,
    /// No such file
    NoSuchFile = 0xC000_000F,
    /// Invalid device request
    InvalidDeviceRequest = 0xC000_0010,
    /// End of file reached
    EndOfFile = 0xC000_0011,
    /// More processing required to complete the request
    MoreProcessingRequired = 0xC000_0016,
    /// No memory available to satisfy the request
    NoMemory = 0xC000_0017,
    /// Access denied
    AccessDenied = 0xC000_0022,
    /// The buffer is too small
    BufferTooSmall = 0xC000_0023,
    /// The object name is invalid
    ObjectNameInvalid = 0xC000_0033,
    /// The object name is not found
    ObjectNameNotFound = 0xC000_0034,
    /// Cannot create a file that already exists
    ObjectNameCollision = 0xC000_0035,
    /// A path component is not found
    ObjectPathNotFound = 0xC000_003A,
    /// File is in use in an incompatible share mode
    SharingViolation = 0xC000_0043,
    /// An extended attribute is too large
    EaTooLarge = 0xC000_0050,
    /// The byte range is already locked
    FileLockConflict = 0xC000_0054,
    /// The lock was not granted
    LockNotGranted = 0xC000_0055,
    /// A delete is already pending on the file
    DeletePending = 0xC000_0056,
    /// The user name or password is incorrect
    LogonFailure = 0xC000_006D,
    /// Account is disabled
    AccountDisabled = 0xC000_0072,
    /// Resource shortage
    InsufficientResources = 0xC000_009A,
    /// Media is write protected
    MediaWriteProtected = 0xC000_00A2,
    /// Pipe disconnected
    PipeDisconnected = 0xC000_00B0,
    /// The request timed out
    IoTimeout = 0xC000_00B5,
    /// The operation targets a directory where a file was expected
    FileIsADirectory = 0xC000_00BA,
    /// The request is not supported
    NotSupported = 0xC000_00BB,
    /// Per-share access denied
    NetworkAccessDenied = 0xC000_00CA,
    /// Bad network name in tree connect
    BadNetworkName = 0xC000_00CC,
    /// The directory is not empty
    DirectoryNotEmpty = 0xC000_0101,
    /// The file is not a directory
    NotADirectory = 0xC000_0103,
    /// The requested logon type is invalid
    InvalidLogonType = 0xC000_010B,
    /// Too many open files
    TooManyOpenedFiles = 0xC000_011F,
    /// Cancelled by an NT_CANCEL
    Cancelled = 0xC000_0120,
    /// The file cannot be deleted
    CannotDelete = 0xC000_0121,
    /// The information level is invalid
    InvalidLevel = 0xC000_0148,
    /// The device state is invalid for the request
    InvalidDeviceState = 0xC000_0184,
    /// Rename endpoints are on different devices
    NotSameDevice = 0xC000_00D4,
    /// Internal invariant violation
    InternalError = 0xC000_00E5,
    /// Unexpected host I/O failure
    UnexpectedIoError = 0xC000_00E9,
    /// The connection was disconnected
    ConnectionDisconnected = 0xC000_020C,
}

impl NtStatus {
    /// Check if this is a success status
    pub fn is_success(self) -> bool {
        self == NtStatus::Success
    }

    /// Check if this is an error status
    pub fn is_error(self) -> bool {
        (self as u32) & 0xC000_0000 == 0xC000_0000
    }

    /// Check if this is a warning status
    pub fn is_warning(self) -> bool {
        (self as u32) & 0x8000_0000 == 0x8000_0000 && !self.is_error()
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:08X})", self, *self as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntstatus_classes() {
        assert!(NtStatus::Success.is_success());
        assert!(!NtStatus::Success.is_error());
        assert!(NtStatus::AccessDenied.is_error());
        assert!(NtStatus::NoMoreFiles.is_warning());
        assert!(!NtStatus::NoMoreFiles.is_error());
    }

    #[test]
    fn test_error_taxonomy_mapping() {
        assert_eq!(
            Error::NotFound("x".into()).status(),
            NtStatus::ObjectNameNotFound
        );
        assert_eq!(
            Error::AlreadyExists("x".into()).status(),
            NtStatus::ObjectNameCollision
        );
        assert_eq!(Error::LockConflict.status(), NtStatus::FileLockConflict);
        assert_eq!(
            Error::TooManyOpenFiles.status(),
            NtStatus::TooManyOpenedFiles
        );
        assert_eq!(Error::InvalidHandle(3).status(), NtStatus::InvalidHandle);
        assert_eq!(
            Error::UnsupportedLevel(0x3ff).status(),
            NtStatus::InvalidLevel
        );
        assert_eq!(Error::CrossDevice.status(), NtStatus::NotSameDevice);
    }

    #[test]
    fn test_io_error_mapping() {
        let e = Error::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(e.status(), NtStatus::ObjectNameNotFound);
        let e = Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert_eq!(e.status(), NtStatus::AccessDenied);
    }

    #[test]
    fn test_display_carries_code() {
        let s = format!("{}", NtStatus::AccessDenied);
        assert!(s.contains("0xC0000022"));
    }
}
