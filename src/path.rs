//! Path resolver (§4.6): translates slash-delimited paths to entry ids.

use block_device::BlockDevice;

use crate::cryptfs::{CryptFsEntry, EntryId, EntryType, ENTRIES_PER_DIR_BLOCK};
use crate::entries::{self};
use crate::error::{Error, Result};

fn entries_in(device: &mut dyn BlockDevice, master_key: &[u8; 32], dir_start: u64) -> Result<Vec<(u32, CryptFsEntry)>> {
    if dir_start == 0 {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut block = dir_start;
    let mut index = 0u32;
    loop {
        for offset in 0..ENTRIES_PER_DIR_BLOCK as u32 {
            let id = EntryId { directory_block: dir_start, directory_index: index + offset };
            let entry = entries::read_entry(device, master_key, id)?;
            if entry.is_used() {
                out.push((index + offset, entry));
            }
        }
        index += ENTRIES_PER_DIR_BLOCK as u32;
        let next = crate::fat::read_fat(device, master_key, block)?;
        if next == crate::cryptfs::FAT_END {
            break;
        }
        if next <= 0 {
            return Err(Error::CorruptFilesystem("directory chain ran off during scan".into()));
        }
        block = next as u64;
    }
    Ok(out)
}

/// Lists the used entries of a directory, as `(directory_index, entry)`.
/// Exposed for the FUSE shim's `readdir`.
pub fn list_children(device: &mut dyn BlockDevice, master_key: &[u8; 32], dir: &CryptFsEntry) -> Result<Vec<(u32, CryptFsEntry)>> {
    entries_in(device, master_key, dir.start_block)
}

/// Looks up a child of `parent` by name, without walking a whole path.
/// Exposed for the FUSE shim's `lookup`/`create`/etc, which address by
/// parent entry id rather than by path string.
pub fn find_by_name(device: &mut dyn BlockDevice, master_key: &[u8; 32], parent: &CryptFsEntry, name: &str) -> Result<Option<EntryId>> {
    find_child(device, master_key, parent, name)
}

fn find_child(device: &mut dyn BlockDevice, master_key: &[u8; 32], parent: &CryptFsEntry, name: &str) -> Result<Option<EntryId>> {
    for (index, entry) in entries_in(device, master_key, parent.start_block)? {
        if entry.name_str() == name {
            return Ok(Some(EntryId { directory_block: parent.start_block, directory_index: index }));
        }
    }
    Ok(None)
}

/// Resolves an absolute path (trailing slash tolerated) to an entry id
/// (§4.6).
pub fn resolve(device: &mut dyn BlockDevice, master_key: &[u8; 32], path: &str) -> Result<EntryId> {
    let mut current_id = EntryId::root();
    let trimmed = path.trim_end_matches('/');
    let components: Vec<&str> = trimmed.split('/').filter(|c| !c.is_empty()).collect();

    if components.is_empty() {
        return Ok(current_id);
    }

    for (i, component) in components.iter().enumerate() {
        let current = entries::read_entry(device, master_key, current_id)?;
        if current.entry_type()? != EntryType::Directory {
            return Err(Error::NotADirectory);
        }
        let found = find_child(device, master_key, &current, component)?
            .ok_or(Error::NotFound)?;

        if i + 1 == components.len() {
            return Ok(found);
        }
        let child = entries::read_entry(device, master_key, found)?;
        if child.entry_type()? != EntryType::Directory {
            return Err(Error::NotADirectory);
        }
        current_id = found;
    }
    Ok(current_id)
}

fn split_parent(path: &str) -> Result<(String, String)> {
    let trimmed = path.trim_end_matches('/');
    let pos = trimmed.rfind('/').ok_or_else(|| Error::InvalidArgument("path must be absolute".into()))?;
    let parent = if pos == 0 { "/".to_string() } else { trimmed[..pos].to_string() };
    let name = trimmed[pos + 1..].to_string();
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty component".into()));
    }
    Ok((parent, name))
}

pub fn create_file_by_path(device: &mut dyn BlockDevice, master_key: &[u8; 32], path: &str, uid: u32, gid: u32) -> Result<EntryId> {
    let (parent_path, name) = split_parent(path)?;
    let parent_id = resolve(device, master_key, &parent_path)?;
    entries::create_empty_file(device, master_key, parent_id, &name, uid, gid)
}

pub fn create_directory_by_path(device: &mut dyn BlockDevice, master_key: &[u8; 32], path: &str, uid: u32, gid: u32) -> Result<EntryId> {
    let (parent_path, name) = split_parent(path)?;
    let parent_id = resolve(device, master_key, &parent_path)?;
    entries::create_directory(device, master_key, parent_id, &name, uid, gid)
}

pub fn create_hardlink_by_path(device: &mut dyn BlockDevice, master_key: &[u8; 32], path: &str, target_path: &str, uid: u32, gid: u32) -> Result<EntryId> {
    let (parent_path, name) = split_parent(path)?;
    let parent_id = resolve(device, master_key, &parent_path)?;
    let target_id = resolve(device, master_key, target_path)?;
    entries::create_hardlink(device, master_key, parent_id, &name, target_id, uid, gid)
}

pub fn create_symlink_by_path(device: &mut dyn BlockDevice, master_key: &[u8; 32], path: &str, target_path: &str, uid: u32, gid: u32) -> Result<EntryId> {
    let (parent_path, name) = split_parent(path)?;
    let parent_id = resolve(device, master_key, &parent_path)?;
    entries::create_symlink(device, master_key, parent_id, &name, target_path, uid, gid)
}

pub fn delete_entry_by_path(device: &mut dyn BlockDevice, master_key: &[u8; 32], path: &str) -> Result<()> {
    let (parent_path, name) = split_parent(path)?;
    let parent_id = resolve(device, master_key, &parent_path)?;
    let parent = entries::read_entry(device, master_key, parent_id)?;
    let found = find_child(device, master_key, &parent, &name)?.ok_or(Error::NotFound)?;
    entries::delete(device, master_key, parent_id, found.directory_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptfs::{
        CryptFsHeader, CRYPTFS_BLOCK_SIZE_BYTES, CRYPTFS_MAGIC, CRYPTFS_VERSION, FAT_END,
        FIRST_FAT_BLOCK, HEADER_BLOCK, NB_ENCRYPTION_KEYS, ROOT_DIR_BLOCK,
    };
    use crate::block_cipher::write_blocks_encrypted;
    use crate::fat::write_fat;
    use crate::utils::serialize_row;
    use block_device::FileBlockDevice;
    use std::fs::OpenOptions;

    fn fresh_volume() -> (FileBlockDevice, [u8; 32]) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
        std::mem::forget(tmp);
        let mut dev = FileBlockDevice::new(file, CRYPTFS_BLOCK_SIZE_BYTES, CRYPTFS_BLOCK_SIZE_BYTES as u64 * 256).unwrap();
        let key = [0x44u8; 32];

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
        for slot in 1..=NB_ENCRYPTION_KEYS as u64 {
            write_fat(&mut dev, &key, slot, FAT_END).unwrap();
        }

        let root_id = EntryId::root();
        // directory-block header ("dot") for the root block itself.
        let mut dirbuf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
        dirbuf[..std::mem::size_of::<EntryId>()].copy_from_slice(serialize_row(&root_id));
        write_blocks_encrypted(&mut dev, &key, ROOT_DIR_BLOCK, 1, &dirbuf).unwrap();
        crate::entries::write_entry(&mut dev, &key, root_id, &{
            let mut root = CryptFsEntry::empty();
            root.used = 1;
            root.kind = EntryType::Directory.into();
            root.set_name("/");
            root.start_block = ROOT_DIR_BLOCK;
            root
        }).unwrap();

        (dev, key)
    }

    #[test]
    fn resolve_root() {
        let (mut dev, key) = fresh_volume();
        let id = resolve(&mut dev, &key, "/").unwrap();
        assert_eq!(id, EntryId::root());
    }

    #[test]
    fn create_and_resolve_nested_path() {
        let (mut dev, key) = fresh_volume();
        create_directory_by_path(&mut dev, &key, "/d", 0, 0).unwrap();
        create_file_by_path(&mut dev, &key, "/d/file.txt", 0, 0).unwrap();
        let id = resolve(&mut dev, &key, "/d/file.txt").unwrap();
        let entry = crate::entries::read_entry(&mut dev, &key, id).unwrap();
        assert_eq!(entry.name_str(), "file.txt");
    }

    #[test]
    fn resolve_missing_path_fails_not_found() {
        let (mut dev, key) = fresh_volume();
        let err = resolve(&mut dev, &key, "/nope").unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn delete_then_resolve_fails() {
        let (mut dev, key) = fresh_volume();
        create_file_by_path(&mut dev, &key, "/gone", 0, 0).unwrap();
        delete_entry_by_path(&mut dev, &key, "/gone").unwrap();
        let err = resolve(&mut dev, &key, "/gone").unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn delete_in_nested_directory_leaves_root_untouched() {
        let (mut dev, key) = fresh_volume();
        create_directory_by_path(&mut dev, &key, "/d", 0, 0).unwrap();
        create_file_by_path(&mut dev, &key, "/d/f", 0, 0).unwrap();

        delete_entry_by_path(&mut dev, &key, "/d/f").unwrap();

        let err = resolve(&mut dev, &key, "/d/f").unwrap_err();
        assert!(matches!(err, Error::NotFound));
        // the root entry itself (directory_index 0 in ROOT_DIR_BLOCK) must
        // survive a delete scoped to a child directory's own block.
        let root_id = resolve(&mut dev, &key, "/").unwrap();
        let root = crate::entries::read_entry(&mut dev, &key, root_id).unwrap();
        assert!(root.is_used());
        let d_id = resolve(&mut dev, &key, "/d").unwrap();
        let d = crate::entries::read_entry(&mut dev, &key, d_id).unwrap();
        assert_eq!({ d.size }, 0);
    }

    #[test]
    fn many_entries_directory_resolves_seventeenth_file() {
        let (mut dev, key) = fresh_volume();
        create_directory_by_path(&mut dev, &key, "/d", 0, 0).unwrap();
        for i in 0..26 {
            create_file_by_path(&mut dev, &key, &format!("/d/file{i}"), 0, 0).unwrap();
        }
        let id = resolve(&mut dev, &key, "/d/file17").unwrap();
        let entry = crate::entries::read_entry(&mut dev, &key, id).unwrap();
        assert_eq!(entry.name_str(), "file17");
    }
}
