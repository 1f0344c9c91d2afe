//! Named error enumeration for the core.
//!
//! §9 is explicit that sentinel negative integers (`BLOCK_ERROR`,
//! `BLOCK_FAT_OOB`, ...) must not leak out of the core as return values.
//! This enum is the discriminated result type §7 asks for; `libc` errno
//! mapping for the FUSE boundary lives in [`crate::fuse_fs`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad path, empty name, non-ASCII symlink target, wrong entry kind for
    /// the requested operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Normal lookup/resolve outcome, never logged as an error (§7).
    #[error("no such entry")]
    NotFound,

    /// Normal create outcome, never logged as an error (§7).
    #[error("already exists")]
    AlreadyExists,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("permission denied")]
    PermissionDenied,

    #[error("too many open files")]
    TooManyOpenFiles,

    #[error("bad handle")]
    BadHandle,

    /// No free block, no free FAT slot extension possible, no free key
    /// slot. Distinguishable internally; folded into `EIO` at the FUSE
    /// boundary (§7).
    #[error("allocation exhausted: {0}")]
    AllocationExhausted(String),

    /// RSA/AES wrap-unwrap or decrypt failure. During unlock this aborts
    /// startup; during steady-state I/O it surfaces as I/O (§7).
    #[error("cipher failure: {0}")]
    Cipher(String),

    #[error("device I/O error: {0}")]
    Io(#[from] block_device::DeviceError),

    /// Internal invariant violation — a FAT chain ran off the table, a
    /// directory walk fell off its chain, etc. Fatal: the caller must
    /// treat the filesystem as untrusted (§7).
    #[error("internal invariant violation: {0}")]
    CorruptFilesystem(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(block_device::DeviceError::Io(e))
    }
}
