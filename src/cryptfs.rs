//! On-disk structures and constants (§3).
//!
//! Every struct here is `#[repr(C, packed)]` plain-old-data, serialized with
//! [`crate::utils::serialize_row`]/[`crate::utils::deserialize_row`] rather
//! than a derive-based codec, matching the teacher's `desc.rs` layout.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// "cryptfs" packed into a 64-bit magic number.
pub const CRYPTFS_MAGIC: u64 = 0x0063_7279_7074_6673;
pub const CRYPTFS_VERSION: u32 = 1;
pub const CRYPTFS_BLOCK_SIZE_BYTES: usize = 4096;
pub const CRYPTFS_BOOT_SECTION_SIZE_BYTES: usize = 1024;

pub const NB_ENCRYPTION_KEYS: usize = 64;
pub const RSA_KEY_SIZE_BITS: usize = 2048;
pub const RSA_KEY_SIZE_BYTES: usize = RSA_KEY_SIZE_BITS / 8;
pub const RSA_PUBLIC_EXPONENT: u32 = 65537;
pub const AES_KEY_SIZE_BYTES: usize = 32;
pub const ENTRY_NAME_MAX_LEN: usize = 128;

/// Block layout (§3's "Volume layout" table).
pub const HEADER_BLOCK: u64 = 0;
pub const KEYS_STORAGE_START_BLOCK: u64 = 1;
/// One block per key slot: slots occupy blocks `[1, NB_ENCRYPTION_KEYS]`.
pub const FIRST_FAT_BLOCK: u64 = KEYS_STORAGE_START_BLOCK + NB_ENCRYPTION_KEYS as u64;
pub const ROOT_DIR_BLOCK: u64 = FIRST_FAT_BLOCK + 1;
/// First block available for payload / further FAT or directory blocks.
pub const FIRST_FREE_BLOCK: u64 = ROOT_DIR_BLOCK + 1;

/// FAT sentinel values, stored as the 32-bit "next block" entries described
/// in §3. Only `FREE` and `END` are ever written to disk; `ERROR`/`OOB` are
/// in-memory-only return values (§9: "treat as a precise three-way
/// discriminated result").
pub const FAT_FREE: i32 = 0;
pub const FAT_END: i32 = -1;
pub const FAT_ERROR: i32 = -2;
pub const FAT_OOB: i32 = -3;

/// Entries per FAT block: `(block_size - size_of(next_pointer)) / 4`.
pub const FAT_ENTRIES_PER_BLOCK: usize =
    (CRYPTFS_BLOCK_SIZE_BYTES - std::mem::size_of::<u64>()) / std::mem::size_of::<i32>();

/// Entries per directory block: `(block_size - size_of(EntryId)) /
/// size_of(CryptFsEntry)`.
pub const ENTRIES_PER_DIR_BLOCK: usize =
    (CRYPTFS_BLOCK_SIZE_BYTES - std::mem::size_of::<EntryId>()) / std::mem::size_of::<CryptFsEntry>();

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum EntryType {
    File = 0,
    Directory = 1,
    Hardlink = 2,
    Symlink = 3,
}

/// On-disk volume header, occupies block 0 whole.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct CryptFsHeader {
    pub magic: u64,
    pub version: u32,
    pub block_size: u32,
    pub device_size_bytes: u64,
    pub last_fat_block: u64,
    pub boot: [u8; CRYPTFS_BOOT_SECTION_SIZE_BYTES],
}

impl CryptFsHeader {
    pub fn is_valid(&self) -> bool {
        let magic = self.magic;
        let version = self.version;
        let block_size = self.block_size;
        magic == CRYPTFS_MAGIC
            && version == CRYPTFS_VERSION
            && block_size as usize == CRYPTFS_BLOCK_SIZE_BYTES
    }
}

/// One key slot, occupies one block (padded to block size on disk); the
/// struct itself is the 517-byte payload described in §3.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct KeySlot {
    pub occupied: u8,
    pub aes_key_ciphered: [u8; RSA_KEY_SIZE_BYTES],
    pub modulus: [u8; RSA_KEY_SIZE_BYTES],
    /// Big-endian, per §6.
    pub exponent: [u8; 4],
}

impl KeySlot {
    pub fn empty() -> Self {
        KeySlot {
            occupied: 0,
            aes_key_ciphered: [0u8; RSA_KEY_SIZE_BYTES],
            modulus: [0u8; RSA_KEY_SIZE_BYTES],
            exponent: [0u8; 4],
        }
    }

    /// "Slot considered free iff the occupied flag is zero and N is all
    /// zero" (§3).
    pub fn is_free(&self) -> bool {
        self.occupied == 0 && self.modulus.iter().all(|&b| b == 0)
    }
}

/// Stable external reference to an entry (§3 "Entry identifier").
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    pub directory_block: u64,
    pub directory_index: u32,
}

impl EntryId {
    pub fn root() -> Self {
        EntryId {
            directory_block: ROOT_DIR_BLOCK,
            directory_index: 0,
        }
    }
}

/// One directory-entry record (§3 "Entry record").
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct CryptFsEntry {
    pub used: u8,
    pub kind: u8,
    pub start_block: u64,
    pub name: [u8; ENTRY_NAME_MAX_LEN],
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

impl CryptFsEntry {
    pub fn empty() -> Self {
        CryptFsEntry {
            used: 0,
            kind: 0,
            start_block: 0,
            name: [0u8; ENTRY_NAME_MAX_LEN],
            size: 0,
            uid: 0,
            gid: 0,
            mode: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
        }
    }

    pub fn is_used(&self) -> bool {
        self.used != 0
    }

    pub fn entry_type(&self) -> crate::Result<EntryType> {
        EntryType::try_from(self.kind).map_err(|_| {
            crate::Error::CorruptFilesystem(format!("invalid entry type tag {}", self.kind))
        })
    }

    pub fn name_str(&self) -> String {
        crate::utils::unpack_fixed_str(&self.name)
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = crate::utils::pack_fixed_str(name);
    }
}

/// Header of a directory block: names the directory's own entry ("dot",
/// §3). Followed on disk by [`ENTRIES_PER_DIR_BLOCK`] [`CryptFsEntry`]
/// records.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct DirectoryBlockHeader {
    pub dot: EntryId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_record_is_170_bytes() {
        assert_eq!(std::mem::size_of::<CryptFsEntry>(), 170);
    }

    #[test]
    fn entry_id_is_12_bytes() {
        assert_eq!(std::mem::size_of::<EntryId>(), 12);
    }

    #[test]
    fn fat_entries_per_block_is_1022() {
        assert_eq!(FAT_ENTRIES_PER_BLOCK, 1022);
    }

    #[test]
    fn entries_per_dir_block_is_24() {
        assert_eq!(ENTRIES_PER_DIR_BLOCK, 24);
    }

    #[test]
    fn key_slot_free_iff_unoccupied_and_zero_modulus() {
        let mut slot = KeySlot::empty();
        assert!(slot.is_free());
        slot.occupied = 1;
        assert!(!slot.is_free());
        slot.occupied = 0;
        slot.modulus[0] = 1;
        assert!(!slot.is_free());
    }

    #[test]
    fn header_validates_magic_version_block_size() {
        let mut h = CryptFsHeader {
            magic: CRYPTFS_MAGIC,
            version: CRYPTFS_VERSION,
            block_size: CRYPTFS_BLOCK_SIZE_BYTES as u32,
            device_size_bytes: 0,
            last_fat_block: FIRST_FAT_BLOCK,
            boot: [0u8; CRYPTFS_BOOT_SECTION_SIZE_BYTES],
        };
        assert!(h.is_valid());
        h.magic = 0xdead;
        assert!(!h.is_valid());
    }
}
