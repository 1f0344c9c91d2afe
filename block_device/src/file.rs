use std::fs::File;

use log::debug;

use crate::{read_exact_or_err, seek_to_block, write_all_or_err, BlockDevice, Result};

/// `BlockDevice` backed by a regular file (or a block device node opened as
/// one — `OpenOptions::open` works the same way for both on Linux).
pub struct FileBlockDevice {
    file: File,
    block_size: usize,
    size_bytes: u64,
}

impl FileBlockDevice {
    pub fn new(mut file: File, block_size: usize, min_size_bytes: u64) -> Result<Self> {
        let current_len = file.metadata()?.len();
        let size_bytes = current_len.max(min_size_bytes);
        if current_len < size_bytes {
            file.set_len(size_bytes)?;
        }
        debug!(
            "opened block device: block_size={} size_bytes={}",
            block_size, size_bytes
        );
        Ok(Self {
            file,
            block_size,
            size_bytes,
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn read_blocks(&mut self, start: u64, n: usize, buf: &mut [u8]) -> Result<()> {
        let want = n * self.block_size;
        assert!(buf.len() >= want, "buffer too small for {n} blocks");
        seek_to_block(&mut self.file, start, self.block_size)?;
        read_exact_or_err(&mut self.file, &mut buf[..want])
    }

    fn write_blocks(&mut self, start: u64, n: usize, buf: &[u8]) -> Result<()> {
        let want = n * self.block_size;
        assert!(buf.len() >= want, "buffer too small for {n} blocks");
        let end = (start + n as u64) * self.block_size as u64;
        if end > self.size_bytes {
            self.file.set_len(end)?;
            self.size_bytes = end;
        }
        seek_to_block(&mut self.file, start, self.block_size)?;
        write_all_or_err(&mut self.file, &buf[..want])
    }
}
