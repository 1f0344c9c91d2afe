//! FAT (allocation table), §4.4: a linked list of FAT blocks, each holding
//! a dense array of 32-bit next-block pointers.

use block_device::BlockDevice;

use crate::block_cipher::{read_blocks_decrypted, write_blocks_encrypted};
use crate::cryptfs::{
    CryptFsHeader, CRYPTFS_BLOCK_SIZE_BYTES, FAT_END, FAT_ENTRIES_PER_BLOCK, FAT_FREE, FAT_OOB,
    FIRST_FAT_BLOCK, HEADER_BLOCK,
};
use crate::error::{Error, Result};
use crate::utils::{deserialize_row, serialize_row};

fn read_header(device: &mut dyn BlockDevice, master_key: &[u8; 32]) -> Result<CryptFsHeader> {
    let mut buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
    read_blocks_decrypted(device, master_key, HEADER_BLOCK, 1, &mut buf)?;
    Ok(unsafe { deserialize_row(&buf) })
}

fn write_header(device: &mut dyn BlockDevice, master_key: &[u8; 32], header: &CryptFsHeader) -> Result<()> {
    let mut buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
    buf[..std::mem::size_of::<CryptFsHeader>()].copy_from_slice(serialize_row(header));
    write_blocks_encrypted(device, master_key, HEADER_BLOCK, 1, &buf)
}

/// Walks the FAT chain from [`FIRST_FAT_BLOCK`] and returns the block index
/// that physically stores global FAT index `i`, along with the in-block
/// offset, or `None` if the walk runs off the chain (index is OOB).
fn locate(device: &mut dyn BlockDevice, master_key: &[u8; 32], i: u64) -> Result<Option<(u64, usize)>> {
    let block_in_chain = i / FAT_ENTRIES_PER_BLOCK as u64;
    let offset = (i % FAT_ENTRIES_PER_BLOCK as u64) as usize;

    let mut current_block = FIRST_FAT_BLOCK;
    let mut buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
    for _ in 0..block_in_chain {
        read_blocks_decrypted(device, master_key, current_block, 1, &mut buf)?;
        let next: u64 = unsafe { deserialize_row(&buf[..8]) };
        if next == FAT_END as u64 {
            return Ok(None);
        }
        current_block = next;
    }
    Ok(Some((current_block, offset)))
}

/// Returns the next-block value at global FAT index `i`, or `Ok` wrapping
/// [`FAT_OOB`] if `i` exceeds the current table span (§4.4).
pub fn read_fat(device: &mut dyn BlockDevice, master_key: &[u8; 32], i: u64) -> Result<i32> {
    match locate(device, master_key, i)? {
        None => Ok(FAT_OOB),
        Some((block, offset)) => {
            let mut buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
            read_blocks_decrypted(device, master_key, block, 1, &mut buf)?;
            let entry_start = 8 + offset * 4;
            let value: i32 = unsafe { deserialize_row(&buf[entry_start..entry_start + 4]) };
            Ok(value)
        }
    }
}

/// Sets FAT index `i` to `v`. Fails with [`Error::AllocationExhausted`] if
/// the slot does not yet exist (§4.4: "fails with OOB").
pub fn write_fat(device: &mut dyn BlockDevice, master_key: &[u8; 32], i: u64, v: i32) -> Result<()> {
    let (block, offset) = locate(device, master_key, i)?
        .ok_or_else(|| Error::AllocationExhausted(format!("FAT index {i} is out of bounds")))?;
    let mut buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
    read_blocks_decrypted(device, master_key, block, 1, &mut buf)?;
    let entry_start = 8 + offset * 4;
    buf[entry_start..entry_start + 4].copy_from_slice(&v.to_ne_bytes());
    write_blocks_encrypted(device, master_key, block, 1, &buf)
}

/// Scans FAT indices from 0 upward for the first `FREE` slot. Returns that
/// index directly if found within the current table. If the walk runs off
/// the current table, returns the negated index of the first
/// unrepresentable block (§4.4).
pub fn find_first_free_block(device: &mut dyn BlockDevice, master_key: &[u8; 32]) -> Result<i64> {
    let header = read_header(device, master_key)?;
    let last_fat = header.last_fat_block;
    let span = fat_span_blocks(device, master_key, last_fat)? as u64 * FAT_ENTRIES_PER_BLOCK as u64;

    let mut i: u64 = 0;
    while i < span {
        if read_fat(device, master_key, i)? == FAT_FREE {
            return Ok(i as i64);
        }
        i += 1;
    }
    Ok(-(i as i64))
}

fn fat_span_blocks(device: &mut dyn BlockDevice, master_key: &[u8; 32], last_fat_block: u64) -> Result<usize> {
    let mut count = 1usize;
    let mut current = FIRST_FAT_BLOCK;
    let mut buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
    while current != last_fat_block {
        read_blocks_decrypted(device, master_key, current, 1, &mut buf)?;
        let next: u64 = unsafe { deserialize_row(&buf[..8]) };
        if next == FAT_END as u64 {
            return Err(Error::CorruptFilesystem(
                "FAT chain ended before reaching the header's last-FAT block".into(),
            ));
        }
        current = next;
        count += 1;
    }
    Ok(count)
}

/// Wraps [`find_first_free_block`]: extends the table via [`create_fat`] on
/// out-of-bounds, always returning a usable positive index (§4.4).
pub fn find_first_free_block_safe(device: &mut dyn BlockDevice, master_key: &[u8; 32]) -> Result<u64> {
    match find_first_free_block(device, master_key)? {
        positive if positive >= 0 => Ok(positive as u64),
        _ => {
            create_fat(device, master_key)?;
            match find_first_free_block(device, master_key)? {
                positive if positive >= 0 => Ok(positive as u64),
                _ => Err(Error::CorruptFilesystem(
                    "FAT extension did not expose a free block".into(),
                )),
            }
        }
    }
}

/// Appends one FAT block to the chain (§4.4). Returns the index of the new
/// FAT block.
pub fn create_fat(device: &mut dyn BlockDevice, master_key: &[u8; 32]) -> Result<u64> {
    let mut header = read_header(device, master_key)?;
    let last_fat_block = header.last_fat_block;

    let span = fat_span_blocks(device, master_key, last_fat_block)? as u64 * FAT_ENTRIES_PER_BLOCK as u64;
    let mut candidate = None;
    for i in 0..span {
        if read_fat(device, master_key, i)? == FAT_FREE {
            candidate = Some(i);
            break;
        }
    }
    let new_fat_block = candidate.unwrap_or(span);

    let mut buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
    buf[..8].copy_from_slice(&(FAT_END as u64).to_ne_bytes());
    write_blocks_encrypted(device, master_key, new_fat_block, 1, &buf)?;

    let mut last_buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
    read_blocks_decrypted(device, master_key, last_fat_block, 1, &mut last_buf)?;
    last_buf[..8].copy_from_slice(&new_fat_block.to_ne_bytes());
    write_blocks_encrypted(device, master_key, last_fat_block, 1, &last_buf)?;

    // mark the new FAT block's own slot as END so it is never reported free.
    write_fat(device, master_key, new_fat_block, FAT_END)?;

    header.last_fat_block = new_fat_block;
    write_header(device, master_key, &header)?;
    Ok(new_fat_block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptfs::{CRYPTFS_MAGIC, CRYPTFS_VERSION, ROOT_DIR_BLOCK};
    use block_device::FileBlockDevice;
    use std::fs::OpenOptions;

    fn fresh_device() -> (FileBlockDevice, [u8; 32]) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(tmp.path())
            .unwrap();
        std::mem::forget(tmp);
        let mut dev = FileBlockDevice::new(
            file,
            CRYPTFS_BLOCK_SIZE_BYTES,
            CRYPTFS_BLOCK_SIZE_BYTES as u64 * (ROOT_DIR_BLOCK + 64),
        )
        .unwrap();
        let key = [0x11u8; 32];

        let header = CryptFsHeader {
            magic: CRYPTFS_MAGIC,
            version: CRYPTFS_VERSION,
            block_size: CRYPTFS_BLOCK_SIZE_BYTES as u32,
            device_size_bytes: dev.size_bytes(),
            last_fat_block: FIRST_FAT_BLOCK,
            boot: [0u8; crate::cryptfs::CRYPTFS_BOOT_SECTION_SIZE_BYTES],
        };
        write_header(&mut dev, &key, &header).unwrap();

        let mut fat_block = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
        fat_block[..8].copy_from_slice(&(FAT_END as u64).to_ne_bytes());
        write_blocks_encrypted(&mut dev, &key, FIRST_FAT_BLOCK, 1, &fat_block).unwrap();
        // Bootstrap blocks (header, key slots, first FAT, root dir) are marked END.
        write_fat(&mut dev, &key, 0, FAT_END).unwrap();

        (dev, key)
    }

    #[test]
    fn fresh_table_reports_block_one_as_first_free() {
        let (mut dev, key) = fresh_device();
        let free = find_first_free_block(&mut dev, &key).unwrap();
        assert_eq!(free, 1);
    }

    #[test]
    fn write_then_read_fat_entry() {
        let (mut dev, key) = fresh_device();
        write_fat(&mut dev, &key, 5, 42).unwrap();
        assert_eq!(read_fat(&mut dev, &key, 5).unwrap(), 42);
    }

    #[test]
    fn find_first_free_block_safe_extends_table_without_corrupting_chain() {
        let (mut dev, key) = fresh_device();
        for i in 0..FAT_ENTRIES_PER_BLOCK as u64 {
            write_fat(&mut dev, &key, i, FAT_END).unwrap();
        }
        write_fat(&mut dev, &key, 3, 99).unwrap();

        // create_fat places the new FAT block at index FAT_ENTRIES_PER_BLOCK
        // and self-marks that slot END, so the first free slot it exposes
        // is the one right after it.
        let new_free = find_first_free_block_safe(&mut dev, &key).unwrap();
        assert_eq!(new_free, FAT_ENTRIES_PER_BLOCK as u64 + 1);
        assert_eq!(read_fat(&mut dev, &key, 3).unwrap(), 99);
    }

    #[test]
    fn write_fat_fails_out_of_bounds() {
        let (mut dev, key) = fresh_device();
        let huge = FAT_ENTRIES_PER_BLOCK as u64 * 10;
        let err = write_fat(&mut dev, &key, huge, 1).unwrap_err();
        assert!(matches!(err, Error::AllocationExhausted(_)));
    }
}
