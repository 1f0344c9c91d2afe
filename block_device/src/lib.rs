//! Byte-addressable fixed-block reader/writer over a file or raw device path.
//!
//! This is the lowest layer of SherlockFS: it knows nothing about
//! encryption, the FAT, or entries. It only moves whole blocks in and out of
//! a backing file, the way `disk_driver` sits under the teacher's `RFS`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

pub mod file;

pub use file::FileBlockDevice;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("short read: expected {expected} bytes, device had {available}")]
    ShortRead { expected: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Abstract block-addressable storage backend.
///
/// Operations work in whole blocks of `block_size()` bytes. Implementations
/// are not required to cache; if they do, the cache must be write-through
/// (§4.1).
pub trait BlockDevice {
    fn block_size(&self) -> usize;

    /// Total addressable size of the device, in bytes.
    fn size_bytes(&self) -> u64;

    /// Read `n` whole blocks starting at block index `start` into `buf`.
    /// `buf` must be at least `n * block_size()` bytes. Fails on a short
    /// read past the current extent of the device.
    fn read_blocks(&mut self, start: u64, n: usize, buf: &mut [u8]) -> Result<()>;

    /// Write `n` whole blocks starting at block index `start` from `buf`.
    /// Extends the backing store if the write lands past its current
    /// length.
    fn write_blocks(&mut self, start: u64, n: usize, buf: &[u8]) -> Result<()>;
}

/// Opens (or creates) `path` as a plain-file-backed block device of
/// `block_size`-byte blocks, sized to the file's current length (or to
/// `min_size_bytes` if the file is smaller/new).
pub fn open_or_create(
    path: impl AsRef<Path>,
    block_size: usize,
    min_size_bytes: u64,
) -> Result<FileBlockDevice> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    FileBlockDevice::new(file, block_size, min_size_bytes)
}

pub(crate) fn seek_to_block(file: &mut File, block: u64, block_size: usize) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(block * block_size as u64))?;
    Ok(())
}

pub(crate) fn read_exact_or_err(
    file: &mut File,
    buf: &mut [u8],
) -> Result<()> {
    match file.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(DeviceError::ShortRead {
                expected: buf.len(),
                available: 0,
            })
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn write_all_or_err(file: &mut File, buf: &[u8]) -> Result<()> {
    file.write_all(buf)?;
    Ok(())
}
