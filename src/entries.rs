//! Entry storage (§4.5): directory blocks, the four entry kinds, and the
//! operations that create/delete/read/write/truncate them.

use block_device::BlockDevice;

use crate::block_cipher::{read_blocks_decrypted, write_blocks_encrypted};
use crate::cryptfs::{
    CryptFsEntry, EntryId, EntryType, CRYPTFS_BLOCK_SIZE_BYTES, ENTRIES_PER_DIR_BLOCK,
};
use crate::error::{Error, Result};
use crate::fat::{find_first_free_block_safe, read_fat, write_fat};
use crate::utils::{deserialize_row, now_epoch, serialize_row};

const ENTRY_SIZE: usize = std::mem::size_of::<CryptFsEntry>();
const DIR_HEADER_SIZE: usize = std::mem::size_of::<EntryId>();

/// Walks the FAT chain starting at `start_block` and returns the block
/// that holds logical position `n` (0-indexed), or `None` if the chain
/// ends before reaching it.
fn nth_block_in_chain(device: &mut dyn BlockDevice, master_key: &[u8; 32], start_block: u64, n: u64) -> Result<Option<u64>> {
    let mut block = start_block;
    for _ in 0..n {
        let next = read_fat(device, master_key, block)?;
        if next <= 0 {
            return Ok(None);
        }
        block = next as u64;
    }
    Ok(Some(block))
}

/// Number of blocks currently in the chain anchored at `start_block`
/// (0 if `start_block == 0`, meaning no payload has been allocated yet).
fn chain_length(device: &mut dyn BlockDevice, master_key: &[u8; 32], start_block: u64) -> Result<u64> {
    if start_block == 0 {
        return Ok(0);
    }
    let mut count = 1u64;
    let mut block = start_block;
    loop {
        let next = read_fat(device, master_key, block)?;
        if next == crate::cryptfs::FAT_END {
            return Ok(count);
        }
        if next <= 0 {
            return Err(Error::CorruptFilesystem(format!(
                "chain anchored at {start_block} ran off without END"
            )));
        }
        block = next as u64;
        count += 1;
    }
}

/// Appends one freshly allocated block to the chain anchored at
/// `start_block` (or starts a new chain if `start_block == 0`). Returns
/// `(new_start_block, new_block_index)`.
fn append_block(device: &mut dyn BlockDevice, master_key: &[u8; 32], start_block: u64) -> Result<(u64, u64)> {
    let new_block = find_first_free_block_safe(device, master_key)?;
    write_fat(device, master_key, new_block, crate::cryptfs::FAT_END)?;
    if start_block == 0 {
        return Ok((new_block, new_block));
    }
    let tail = {
        let mut block = start_block;
        loop {
            let next = read_fat(device, master_key, block)?;
            if next == crate::cryptfs::FAT_END {
                break block;
            }
            block = next as u64;
        }
    };
    write_fat(device, master_key, tail, new_block as i32)?;
    Ok((start_block, new_block))
}

/// Frees every block in the chain anchored at `start_block`.
fn free_chain(device: &mut dyn BlockDevice, master_key: &[u8; 32], start_block: u64) -> Result<()> {
    if start_block == 0 {
        return Ok(());
    }
    let mut block = start_block;
    loop {
        let next = read_fat(device, master_key, block)?;
        write_fat(device, master_key, block, crate::cryptfs::FAT_FREE)?;
        if next == crate::cryptfs::FAT_END {
            break;
        }
        if next <= 0 {
            return Err(Error::CorruptFilesystem(format!(
                "chain anchored at {start_block} ran off while freeing"
            )));
        }
        block = next as u64;
    }
    Ok(())
}

fn write_directory_block_template(device: &mut dyn BlockDevice, master_key: &[u8; 32], block: u64, dot: EntryId) -> Result<()> {
    let mut buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
    buf[..DIR_HEADER_SIZE].copy_from_slice(serialize_row(&dot));
    write_blocks_encrypted(device, master_key, block, 1, &buf)
}

/// Reads the entry record at `id`, walking the parent chain per the
/// directory-block index arithmetic in §4.5.
pub fn read_entry(device: &mut dyn BlockDevice, master_key: &[u8; 32], id: EntryId) -> Result<CryptFsEntry> {
    let n = id.directory_index as u64 / ENTRIES_PER_DIR_BLOCK as u64;
    let offset = id.directory_index as u64 % ENTRIES_PER_DIR_BLOCK as u64;
    let block = nth_block_in_chain(device, master_key, id.directory_block, n)?
        .ok_or_else(|| Error::CorruptFilesystem(format!("entry {id:?} resolves off the directory chain")))?;

    let mut buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
    read_blocks_decrypted(device, master_key, block, 1, &mut buf)?;
    let start = DIR_HEADER_SIZE + offset as usize * ENTRY_SIZE;
    Ok(unsafe { deserialize_row(&buf[start..start + ENTRY_SIZE]) })
}

pub fn write_entry(device: &mut dyn BlockDevice, master_key: &[u8; 32], id: EntryId, entry: &CryptFsEntry) -> Result<()> {
    let n = id.directory_index as u64 / ENTRIES_PER_DIR_BLOCK as u64;
    let offset = id.directory_index as u64 % ENTRIES_PER_DIR_BLOCK as u64;
    let block = nth_block_in_chain(device, master_key, id.directory_block, n)?
        .ok_or_else(|| Error::CorruptFilesystem(format!("entry {id:?} resolves off the directory chain")))?;

    let mut buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
    read_blocks_decrypted(device, master_key, block, 1, &mut buf)?;
    let start = DIR_HEADER_SIZE + offset as usize * ENTRY_SIZE;
    buf[start..start + ENTRY_SIZE].copy_from_slice(serialize_row(entry));
    write_blocks_encrypted(device, master_key, block, 1, &buf)
}

/// Enlarges or shrinks an entry's payload to `new_size` bytes (§4.5).
/// For directories, `new_size` is interpreted in the same unit used for
/// the rest of the entry's `size` field (used-entry count); block
/// allocation for directory growth is handled separately by
/// [`find_or_grow_free_slot`], not by this function.
pub fn truncate(device: &mut dyn BlockDevice, master_key: &[u8; 32], id: EntryId, new_size: u64) -> Result<()> {
    let mut entry = read_entry(device, master_key, id)?;
    let kind = entry.entry_type()?;
    if kind == EntryType::Hardlink {
        return Err(Error::InvalidArgument("cannot truncate a hardlink directly".into()));
    }

    let unit = CRYPTFS_BLOCK_SIZE_BYTES as u64;
    let current_blocks = if entry.size == 0 { 0 } else { (entry.size + unit - 1) / unit };
    let target_blocks = if new_size == 0 { 0 } else { (new_size + unit - 1) / unit };

    if new_size == 0 {
        free_chain(device, master_key, entry.start_block)?;
        entry.start_block = 0;
    } else if target_blocks < current_blocks {
        let keep = target_blocks.max(1);
        let last_kept = nth_block_in_chain(device, master_key, entry.start_block, keep - 1)?
            .ok_or_else(|| Error::CorruptFilesystem("chain shorter than its block count".into()))?;
        let mut current = read_fat(device, master_key, last_kept)?;
        while current != crate::cryptfs::FAT_END {
            if current <= 0 {
                return Err(Error::CorruptFilesystem("chain ran off while shrinking".into()));
            }
            let to_free = current as u64;
            current = read_fat(device, master_key, to_free)?;
            write_fat(device, master_key, to_free, crate::cryptfs::FAT_FREE)?;
        }
        write_fat(device, master_key, last_kept, crate::cryptfs::FAT_END)?;
    } else {
        let mut start_block = entry.start_block;
        let mut have = current_blocks;
        while have < target_blocks {
            let (new_start, new_block) = append_block(device, master_key, start_block)?;
            start_block = new_start;
            if kind == EntryType::Directory {
                write_directory_block_template(device, master_key, new_block, id)?;
            }
            have += 1;
        }
        entry.start_block = start_block;
    }

    entry.size = new_size;
    entry.mtime = now_epoch();
    write_entry(device, master_key, id, &entry)
}

/// Reads `count` bytes at `offset` into `buffer`. Fails if
/// `offset + count > size`. Sets atime.
pub fn read_at(device: &mut dyn BlockDevice, master_key: &[u8; 32], id: EntryId, offset: u64, buffer: &mut [u8], count: usize) -> Result<usize> {
    let mut entry = read_entry(device, master_key, id)?;
    if entry.entry_type()? == EntryType::Directory {
        return Err(Error::IsADirectory);
    }
    if offset + count as u64 > entry.size {
        return Err(Error::InvalidArgument("read past end of entry".into()));
    }

    let block_size = CRYPTFS_BLOCK_SIZE_BYTES as u64;
    let mut remaining = count;
    let mut pos = offset;
    let mut written = 0usize;
    let mut block_buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];

    while remaining > 0 {
        let block_n = pos / block_size;
        let in_block = (pos % block_size) as usize;
        let block = nth_block_in_chain(device, master_key, entry.start_block, block_n)?
            .ok_or_else(|| Error::CorruptFilesystem(format!("entry {id:?} chain too short for offset {pos}")))?;
        read_blocks_decrypted(device, master_key, block, 1, &mut block_buf)?;
        let take = remaining.min(CRYPTFS_BLOCK_SIZE_BYTES - in_block);
        buffer[written..written + take].copy_from_slice(&block_buf[in_block..in_block + take]);
        written += take;
        pos += take as u64;
        remaining -= take;
    }

    entry.atime = now_epoch();
    write_entry(device, master_key, id, &entry)?;
    Ok(written)
}

/// Writes `count` bytes from `buffer` at `offset`. Enlarges the entry
/// first if the write would extend past the current size. Sets mtime.
pub fn write_at(device: &mut dyn BlockDevice, master_key: &[u8; 32], id: EntryId, offset: u64, buffer: &[u8], count: usize) -> Result<usize> {
    let entry = read_entry(device, master_key, id)?;
    if entry.entry_type()? == EntryType::Directory {
        return Err(Error::IsADirectory);
    }
    let needed = offset + count as u64;
    if needed > entry.size {
        truncate(device, master_key, id, needed)?;
    }

    let entry = read_entry(device, master_key, id)?;
    let block_size = CRYPTFS_BLOCK_SIZE_BYTES as u64;
    let mut remaining = count;
    let mut pos = offset;
    let mut read_from = 0usize;
    let mut block_buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];

    while remaining > 0 {
        let block_n = pos / block_size;
        let in_block = (pos % block_size) as usize;
        let block = nth_block_in_chain(device, master_key, entry.start_block, block_n)?
            .ok_or_else(|| Error::CorruptFilesystem(format!("entry {id:?} chain too short for offset {pos}")))?;
        let take = remaining.min(CRYPTFS_BLOCK_SIZE_BYTES - in_block);
        if take < CRYPTFS_BLOCK_SIZE_BYTES {
            read_blocks_decrypted(device, master_key, block, 1, &mut block_buf)?;
        }
        block_buf[in_block..in_block + take].copy_from_slice(&buffer[read_from..read_from + take]);
        write_blocks_encrypted(device, master_key, block, 1, &block_buf)?;
        read_from += take;
        pos += take as u64;
        remaining -= take;
    }

    let mut entry = entry;
    entry.mtime = now_epoch();
    write_entry(device, master_key, id, &entry)?;
    Ok(count)
}

/// `write_at` with `offset = 0`.
pub fn write(device: &mut dyn BlockDevice, master_key: &[u8; 32], id: EntryId, buffer: &[u8], count: usize) -> Result<usize> {
    write_at(device, master_key, id, 0, buffer, count)
}

/// Scans the directory's slot chain for a free (`used == 0`) slot,
/// appending a new directory block if every existing slot is occupied
/// (§4.5 "Free-slot search in a directory"). Does not touch the
/// directory entry's own `size` field — callers increment it after
/// actually placing a record.
fn find_or_grow_free_slot(device: &mut dyn BlockDevice, master_key: &[u8; 32], parent: &mut CryptFsEntry) -> Result<EntryId> {
    let capacity_blocks = chain_length(device, master_key, parent.start_block)?;
    let capacity = capacity_blocks * ENTRIES_PER_DIR_BLOCK as u64;

    for index in 0..capacity {
        let probe = EntryId { directory_block: parent.start_block, directory_index: index as u32 };
        let e = read_entry(device, master_key, probe)?;
        if !e.is_used() {
            return Ok(probe);
        }
    }

    let (new_start, _new_block) = append_block(device, master_key, parent.start_block)?;
    if parent.start_block == 0 {
        parent.start_block = new_start;
    }
    Ok(EntryId { directory_block: parent.start_block, directory_index: capacity as u32 })
}

fn prepare_new_directory(device: &mut dyn BlockDevice, master_key: &[u8; 32], parent_id: EntryId) -> Result<CryptFsEntry> {
    let mut parent = read_entry(device, master_key, parent_id)?;
    if parent.entry_type()? != EntryType::Directory {
        return Err(Error::NotADirectory);
    }
    if parent.start_block == 0 {
        let (new_start, new_block) = append_block(device, master_key, 0)?;
        write_directory_block_template(device, master_key, new_block, parent_id)?;
        parent.start_block = new_start;
        write_entry(device, master_key, parent_id, &parent)?;
    }
    Ok(parent)
}

fn name_exists(device: &mut dyn BlockDevice, master_key: &[u8; 32], parent: &CryptFsEntry, name: &str) -> Result<bool> {
    if parent.start_block == 0 {
        return Ok(false);
    }
    let capacity_blocks = chain_length(device, master_key, parent.start_block)?;
    let capacity = capacity_blocks * ENTRIES_PER_DIR_BLOCK as u64;
    for index in 0..capacity {
        let probe = EntryId { directory_block: parent.start_block, directory_index: index as u32 };
        let e = read_entry(device, master_key, probe)?;
        if e.is_used() && e.name_str() == name {
            return Ok(true);
        }
    }
    Ok(false)
}

fn new_entry_record(kind: EntryType, name: &str, uid: u32, gid: u32, mode: u32) -> CryptFsEntry {
    let mut entry = CryptFsEntry::empty();
    entry.used = 1;
    entry.kind = kind.into();
    entry.set_name(name);
    entry.uid = uid;
    entry.gid = gid;
    entry.mode = mode;
    let now = now_epoch();
    entry.atime = now;
    entry.mtime = now;
    entry.ctime = now;
    entry
}

fn place_new_entry(device: &mut dyn BlockDevice, master_key: &[u8; 32], parent_id: EntryId, name: &str, entry: CryptFsEntry) -> Result<EntryId> {
    let mut parent = prepare_new_directory(device, master_key, parent_id)?;
    if name_exists(device, master_key, &parent, name)? {
        return Err(Error::AlreadyExists);
    }
    let slot = find_or_grow_free_slot(device, master_key, &mut parent)?;
    write_entry(device, master_key, slot, &entry)?;
    parent.size += 1;
    parent.mtime = now_epoch();
    write_entry(device, master_key, parent_id, &parent)?;
    Ok(slot)
}

/// Creates an empty FILE entry in `parent_id`, mode 0o777, size 0 (§4.5).
pub fn create_empty_file(device: &mut dyn BlockDevice, master_key: &[u8; 32], parent_id: EntryId, name: &str, uid: u32, gid: u32) -> Result<EntryId> {
    let entry = new_entry_record(EntryType::File, name, uid, gid, 0o777);
    place_new_entry(device, master_key, parent_id, name, entry)
}

pub fn create_directory(device: &mut dyn BlockDevice, master_key: &[u8; 32], parent_id: EntryId, name: &str, uid: u32, gid: u32) -> Result<EntryId> {
    let entry = new_entry_record(EntryType::Directory, name, uid, gid, 0o777);
    place_new_entry(device, master_key, parent_id, name, entry)
}

/// Target must be a FILE; copies `start_block`/`size` into a new HARDLINK
/// entry (§4.5, §9 — shared payload, not reference-counted).
pub fn create_hardlink(device: &mut dyn BlockDevice, master_key: &[u8; 32], parent_id: EntryId, name: &str, target_id: EntryId, uid: u32, gid: u32) -> Result<EntryId> {
    let target = read_entry(device, master_key, target_id)?;
    if target.entry_type()? != EntryType::File {
        return Err(Error::InvalidArgument("hardlink target must be a file".into()));
    }
    let mut entry = new_entry_record(EntryType::Hardlink, name, uid, gid, target.mode);
    entry.start_block = target.start_block;
    entry.size = target.size;
    place_new_entry(device, master_key, parent_id, name, entry)
}

/// `target_path` must be non-empty printable ASCII; stored as the blob
/// payload of a new SYMLINK entry (§4.5).
pub fn create_symlink(device: &mut dyn BlockDevice, master_key: &[u8; 32], parent_id: EntryId, name: &str, target_path: &str, uid: u32, gid: u32) -> Result<EntryId> {
    if target_path.is_empty() || !target_path.bytes().all(|b| b.is_ascii_graphic() || b == b'/') {
        return Err(Error::InvalidArgument("symlink target must be non-empty printable ASCII".into()));
    }
    let entry = new_entry_record(EntryType::Symlink, name, uid, gid, 0o777);
    let id = place_new_entry(device, master_key, parent_id, name, entry)?;
    write(device, master_key, id, target_path.as_bytes(), target_path.len())?;
    Ok(id)
}

/// Fails on non-empty directory. Truncates the entry to 0, clears its
/// used flag, decrements the parent directory's size (§4.5).
pub fn delete(device: &mut dyn BlockDevice, master_key: &[u8; 32], parent_id: EntryId, entry_index: u32) -> Result<()> {
    let parent = read_entry(device, master_key, parent_id)?;
    let id = EntryId { directory_block: parent.start_block, directory_index: entry_index };
    let entry = read_entry(device, master_key, id)?;
    if !entry.is_used() {
        return Err(Error::NotFound);
    }
    if entry.entry_type()? == EntryType::Directory && entry.size > 0 {
        return Err(Error::InvalidArgument("directory not empty".into()));
    }

    if entry.entry_type()? != EntryType::Hardlink {
        truncate(device, master_key, id, 0)?;
    }

    let mut entry = read_entry(device, master_key, id)?;
    entry.used = 0;
    write_entry(device, master_key, id, &entry)?;

    let mut parent = read_entry(device, master_key, parent_id)?;
    parent.size = parent.size.saturating_sub(1);
    parent.mtime = now_epoch();
    write_entry(device, master_key, parent_id, &parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptfs::{
        CryptFsHeader, CRYPTFS_MAGIC, CRYPTFS_VERSION, FAT_END, FIRST_FAT_BLOCK, HEADER_BLOCK,
        ROOT_DIR_BLOCK,
    };
    use block_device::FileBlockDevice;
    use std::fs::OpenOptions;

    fn fresh_volume() -> (FileBlockDevice, [u8; 32], EntryId) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
        std::mem::forget(tmp);
        let mut dev = FileBlockDevice::new(
            file,
            CRYPTFS_BLOCK_SIZE_BYTES,
            CRYPTFS_BLOCK_SIZE_BYTES as u64 * 256,
        )
        .unwrap();
        let key = [0x33u8; 32];

        let header = CryptFsHeader {
            magic: CRYPTFS_MAGIC,
            version: CRYPTFS_VERSION,
            block_size: CRYPTFS_BLOCK_SIZE_BYTES as u32,
            device_size_bytes: dev.size_bytes(),
            last_fat_block: FIRST_FAT_BLOCK,
            boot: [0u8; crate::cryptfs::CRYPTFS_BOOT_SECTION_SIZE_BYTES],
        };
        let mut hbuf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
        hbuf[..std::mem::size_of::<CryptFsHeader>()].copy_from_slice(serialize_row(&header));
        write_blocks_encrypted(&mut dev, &key, HEADER_BLOCK, 1, &hbuf).unwrap();

        let mut fat_block = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
        fat_block[..8].copy_from_slice(&(FAT_END as u64).to_ne_bytes());
        write_blocks_encrypted(&mut dev, &key, FIRST_FAT_BLOCK, 1, &fat_block).unwrap();

        for b in [HEADER_BLOCK, FIRST_FAT_BLOCK, ROOT_DIR_BLOCK] {
            write_fat(&mut dev, &key, b, FAT_END).unwrap();
        }
        for slot in 1..=crate::cryptfs::NB_ENCRYPTION_KEYS as u64 {
            write_fat(&mut dev, &key, slot, FAT_END).unwrap();
        }

        let root_id = EntryId { directory_block: ROOT_DIR_BLOCK, directory_index: 0 };
        write_directory_block_template(&mut dev, &key, ROOT_DIR_BLOCK, root_id).unwrap();
        let mut root = new_entry_record(EntryType::Directory, "/", 0, 0, 0o777);
        root.start_block = ROOT_DIR_BLOCK;
        write_entry(&mut dev, &key, root_id, &root).unwrap();

        (dev, key, root_id)
    }

    #[test]
    fn create_file_then_write_then_read() {
        let (mut dev, key, root) = fresh_volume();
        let id = create_empty_file(&mut dev, &key, root, "hello.txt", 1000, 1000).unwrap();
        write_at(&mut dev, &key, id, 0, b"Hello, world!", 13).unwrap();

        let mut buf = vec![0u8; 13];
        let n = read_at(&mut dev, &key, id, 0, &mut buf, 13).unwrap();
        assert_eq!(n, 13);
        assert_eq!(&buf, b"Hello, world!");

        let entry = read_entry(&mut dev, &key, id).unwrap();
        assert_eq!({ entry.size }, 13);
    }

    #[test]
    fn cross_block_boundary_write_allocates_two_blocks() {
        let (mut dev, key, root) = fresh_volume();
        let id = create_empty_file(&mut dev, &key, root, "x", 0, 0).unwrap();
        let payload = vec![0xABu8; 14];
        write_at(&mut dev, &key, id, 4090, &payload, 14).unwrap();

        let entry = read_entry(&mut dev, &key, id).unwrap();
        assert_eq!({ entry.size }, 4104);
        let blocks = chain_length(&mut dev, &key, entry.start_block).unwrap();
        assert_eq!(blocks, 2);

        let mut out = vec![0u8; 14];
        read_at(&mut dev, &key, id, 4090, &mut out, 14).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn writing_exactly_to_block_boundary_does_not_allocate_extra_block() {
        let (mut dev, key, root) = fresh_volume();
        let id = create_empty_file(&mut dev, &key, root, "aligned", 0, 0).unwrap();
        let payload = vec![0x11u8; CRYPTFS_BLOCK_SIZE_BYTES];
        write_at(&mut dev, &key, id, 0, &payload, CRYPTFS_BLOCK_SIZE_BYTES).unwrap();
        let entry = read_entry(&mut dev, &key, id).unwrap();
        let blocks = chain_length(&mut dev, &key, entry.start_block).unwrap();
        assert_eq!(blocks, 1);
    }

    #[test]
    fn twenty_six_entries_allocate_a_second_directory_block() {
        let (mut dev, key, root) = fresh_volume();
        let mut last = None;
        for i in 0..26 {
            let name = format!("file{i}");
            last = Some(create_empty_file(&mut dev, &key, root, &name, 0, 0).unwrap());
        }
        let root_entry = read_entry(&mut dev, &key, root).unwrap();
        assert_eq!({ root_entry.size }, 26);
        let blocks = chain_length(&mut dev, &key, root_entry.start_block).unwrap();
        assert_eq!(blocks, 2);
        assert!(read_entry(&mut dev, &key, last.unwrap()).unwrap().is_used());
    }

    #[test]
    fn delete_then_create_reuses_freed_slot() {
        let (mut dev, key, root) = fresh_volume();
        let a = create_empty_file(&mut dev, &key, root, "a", 0, 0).unwrap();
        delete(&mut dev, &key, root, a.directory_index).unwrap();
        let b = create_empty_file(&mut dev, &key, root, "b", 0, 0).unwrap();
        assert_eq!({ b.directory_index }, { a.directory_index });
    }

    #[test]
    fn hardlink_shares_payload_with_target() {
        let (mut dev, key, root) = fresh_volume();
        let file = create_empty_file(&mut dev, &key, root, "f", 0, 0).unwrap();
        write(&mut dev, &key, file, b"payload", 7).unwrap();
        let link = create_hardlink(&mut dev, &key, root, "f2", file, 0, 0).unwrap();
        let link_entry = read_entry(&mut dev, &key, link).unwrap();
        let file_entry = read_entry(&mut dev, &key, file).unwrap();
        assert_eq!({ link_entry.start_block }, { file_entry.start_block });
        assert_eq!({ link_entry.size }, 7);
    }

    #[test]
    fn delete_nonempty_directory_fails() {
        let (mut dev, key, root) = fresh_volume();
        let dir = create_directory(&mut dev, &key, root, "d", 0, 0).unwrap();
        create_empty_file(&mut dev, &key, dir, "inside", 0, 0).unwrap();
        let err = delete(&mut dev, &key, root, dir.directory_index).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn duplicate_name_rejected() {
        let (mut dev, key, root) = fresh_volume();
        create_empty_file(&mut dev, &key, root, "dup", 0, 0).unwrap();
        let err = create_empty_file(&mut dev, &key, root, "dup", 0, 0).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));
    }
}
