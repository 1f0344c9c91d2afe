//! Multi-user manager (§4.7): format, add user, remove user, unlock.

use block_device::BlockDevice;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::block_cipher::{read_blocks_decrypted, write_blocks_encrypted};
use crate::cryptfs::{
    CryptFsEntry, CryptFsHeader, EntryId, EntryType, CRYPTFS_BLOCK_SIZE_BYTES, CRYPTFS_BOOT_SECTION_SIZE_BYTES,
    CRYPTFS_MAGIC, CRYPTFS_VERSION, FAT_END, FIRST_FAT_BLOCK, HEADER_BLOCK, KEYS_STORAGE_START_BLOCK,
    KeySlot, NB_ENCRYPTION_KEYS, ROOT_DIR_BLOCK,
};
use crate::entries::write_entry as write_entry_record;
use crate::error::{Error, Result};
use crate::fat::write_fat;
use crate::keyslots::{self};
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

/// Checks whether `device` already carries a valid SherlockFS header.
/// A device too small to hold one, or one whose block 0 doesn't parse to
/// the right magic/version, is treated as unformatted.
pub fn is_already_formatted(device: &mut dyn BlockDevice) -> bool {
    if device.size_bytes() < CRYPTFS_BLOCK_SIZE_BYTES as u64 {
        return false;
    }
    let mut buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
    // The header block is stored in the clear; any key works for decoding it.
    if read_blocks_decrypted(device, &[0u8; 32], HEADER_BLOCK, 1, &mut buf).is_err() {
        return false;
    }
    let header: CryptFsHeader = unsafe { deserialize_row(&buf) };
    header.is_valid()
}

fn read_key_slots(device: &mut dyn BlockDevice, master_key: &[u8; 32]) -> Result<[KeySlot; NB_ENCRYPTION_KEYS]> {
    let mut slots = [KeySlot::empty(); NB_ENCRYPTION_KEYS];
    let mut buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
    for (i, slot) in slots.iter_mut().enumerate() {
        let block = KEYS_STORAGE_START_BLOCK + i as u64;
        read_blocks_decrypted(device, master_key, block, 1, &mut buf)?;
        *slot = unsafe { deserialize_row(&buf) };
    }
    Ok(slots)
}

fn write_key_slots(device: &mut dyn BlockDevice, master_key: &[u8; 32], slots: &[KeySlot; NB_ENCRYPTION_KEYS]) -> Result<()> {
    for (i, slot) in slots.iter().enumerate() {
        let block = KEYS_STORAGE_START_BLOCK + i as u64;
        let mut buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
        buf[..std::mem::size_of::<KeySlot>()].copy_from_slice(serialize_row(slot));
        write_blocks_encrypted(device, master_key, block, 1, &buf)?;
    }
    Ok(())
}

fn write_directory_template(device: &mut dyn BlockDevice, master_key: &[u8; 32], block: u64, dot: EntryId) -> Result<()> {
    let mut buf = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
    buf[..std::mem::size_of::<EntryId>()].copy_from_slice(serialize_row(&dot));
    write_blocks_encrypted(device, master_key, block, 1, &buf)
}

/// Result of [`format`]: the fresh master key, kept in the caller's
/// process-state store and otherwise never written to disk in the clear.
#[derive(Debug)]
pub struct FormatOutcome {
    pub master_key: [u8; 32],
}

/// Formats a fresh volume (§4.7).
///
/// `existing_rsa` lets the caller reuse a keypair already present at the
/// default home paths instead of generating a new one (§B.2); `force`
/// bypasses the already-formatted check (§B.1).
pub fn format(
    device: &mut dyn BlockDevice,
    pub_path: &std::path::Path,
    priv_path: &std::path::Path,
    passphrase: Option<&str>,
    existing_rsa: Option<RsaPrivateKey>,
    force: bool,
) -> Result<FormatOutcome> {
    if is_already_formatted(device) && !force {
        return Err(Error::AlreadyExists);
    }

    let master_key = keyslots::generate_aes_key();
    let rsa_priv = match existing_rsa {
        Some(k) => k,
        None => keyslots::generate_rsa_keypair()?,
    };
    let rsa_pub = RsaPublicKey::from(&rsa_priv);

    keyslots::save_public_key(pub_path, &rsa_pub)?;
    keyslots::save_private_key(priv_path, &rsa_priv, passphrase)?;

    let header = CryptFsHeader {
        magic: CRYPTFS_MAGIC,
        version: CRYPTFS_VERSION,
        block_size: CRYPTFS_BLOCK_SIZE_BYTES as u32,
        device_size_bytes: device.size_bytes(),
        last_fat_block: FIRST_FAT_BLOCK,
        boot: [0u8; CRYPTFS_BOOT_SECTION_SIZE_BYTES],
    };
    write_header(device, &master_key, &header)?;

    let mut slots = [KeySlot::empty(); NB_ENCRYPTION_KEYS];
    keyslots::wrap_into_slot(&mut slots, &rsa_pub, &master_key)?;
    write_key_slots(device, &master_key, &slots)?;

    let mut fat_block = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
    fat_block[..8].copy_from_slice(&(FAT_END as u64).to_ne_bytes());
    write_blocks_encrypted(device, &master_key, FIRST_FAT_BLOCK, 1, &fat_block)?;

    for reserved in [HEADER_BLOCK, FIRST_FAT_BLOCK, ROOT_DIR_BLOCK] {
        write_fat(device, &master_key, reserved, FAT_END)?;
    }
    for slot in 0..NB_ENCRYPTION_KEYS as u64 {
        write_fat(device, &master_key, KEYS_STORAGE_START_BLOCK + slot, FAT_END)?;
    }

    let root_id = EntryId::root();
    write_directory_template(device, &master_key, ROOT_DIR_BLOCK, root_id)?;
    let mut root = CryptFsEntry::empty();
    root.used = 1;
    root.kind = EntryType::Directory.into();
    root.set_name("/");
    root.start_block = ROOT_DIR_BLOCK;
    let now = crate::utils::now_epoch();
    root.atime = now;
    root.mtime = now;
    root.ctime = now;
    root.mode = 0o777;
    write_entry_record(device, &master_key, root_id, &root)?;

    Ok(FormatOutcome { master_key })
}

/// Wraps the current master key under `other_pub` into the first free
/// slot (§4.7). `my_priv` authenticates the caller already holds a slot.
pub fn add_user(device: &mut dyn BlockDevice, master_key: &[u8; 32], my_priv: &RsaPrivateKey, other_pub: &RsaPublicKey) -> Result<()> {
    let mut slots = read_key_slots(device, master_key)?;

    if slot_has_modulus(&slots, other_pub) {
        return Err(Error::AlreadyExists);
    }
    if keyslots::find_matching_slot(&slots, my_priv).is_none() {
        return Err(Error::PermissionDenied);
    }

    keyslots::wrap_into_slot(&mut slots, other_pub, master_key)?;
    write_key_slots(device, master_key, &slots)
}

fn slot_has_modulus(slots: &[KeySlot; NB_ENCRYPTION_KEYS], pub_key: &RsaPublicKey) -> bool {
    let mut n = [0u8; 256];
    let raw = pub_key.n().to_bytes_be();
    n[256 - raw.len()..].copy_from_slice(&raw);
    slots.iter().any(|s| s.occupied != 0 && s.modulus == n)
}

/// Clears the victim's slot (§4.7). Refuses to remove the last occupied
/// slot. Interactive confirmation for self-removal is a CLI concern, not
/// enforced here.
pub fn remove_user(device: &mut dyn BlockDevice, master_key: &[u8; 32], my_priv: &RsaPrivateKey, victim_pub: &RsaPublicKey) -> Result<()> {
    let mut slots = read_key_slots(device, master_key)?;

    if keyslots::find_matching_slot(&slots, my_priv).is_none() {
        return Err(Error::PermissionDenied);
    }
    let victim_index = slots
        .iter()
        .position(|s| {
            s.occupied != 0 && {
                let mut n = [0u8; 256];
                let raw = victim_pub.n().to_bytes_be();
                n[256 - raw.len()..].copy_from_slice(&raw);
                s.modulus == n
            }
        })
        .ok_or(Error::NotFound)?;

    if keyslots::occupied_slots(&slots) <= 1 {
        return Err(Error::InvalidArgument("cannot remove the last remaining user".into()));
    }

    slots[victim_index] = KeySlot::empty();
    write_key_slots(device, master_key, &slots)
}

/// Finds the slot matching `my_priv` and unwraps the master key (§4.7).
pub fn unlock(device: &mut dyn BlockDevice, my_priv: &RsaPrivateKey) -> Result<[u8; 32]> {
    // Key slots are stored unencrypted; any key works to read them back.
    let slots = read_key_slots(device, &[0u8; 32])?;
    let index = keyslots::find_matching_slot(&slots, my_priv).ok_or(Error::NotFound)?;
    keyslots::unwrap_from_slot(&slots[index], my_priv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::FileBlockDevice;
    use std::fs::OpenOptions;

    fn tmp_device() -> FileBlockDevice {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
        std::mem::forget(tmp);
        FileBlockDevice::new(file, CRYPTFS_BLOCK_SIZE_BYTES, CRYPTFS_BLOCK_SIZE_BYTES as u64 * 256).unwrap()
    }

    fn tmp_pem_paths() -> (tempfile::TempDir, std::path::PathBuf, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let pub_path = dir.path().join("public.pem");
        let priv_path = dir.path().join("private.pem");
        (dir, pub_path, priv_path)
    }

    #[test]
    fn format_then_read_back_header() {
        let mut dev = tmp_device();
        let (_dir, pub_path, priv_path) = tmp_pem_paths();
        let outcome = format(&mut dev, &pub_path, &priv_path, None, None, false).unwrap();

        let mut raw = vec![0u8; CRYPTFS_BLOCK_SIZE_BYTES];
        dev.read_blocks(HEADER_BLOCK, 1, &mut raw).unwrap();
        let header: CryptFsHeader = unsafe { deserialize_row(&raw) };
        assert_eq!({ header.magic }, CRYPTFS_MAGIC);
        assert_eq!({ header.version }, CRYPTFS_VERSION);
        assert_eq!(outcome.master_key.len(), 32);
    }

    #[test]
    fn format_refuses_overwrite_without_force() {
        let mut dev = tmp_device();
        let (_dir, pub_path, priv_path) = tmp_pem_paths();
        format(&mut dev, &pub_path, &priv_path, None, None, false).unwrap();
        let err = format(&mut dev, &pub_path, &priv_path, None, None, false).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));
    }

    #[test]
    fn unlock_returns_same_master_key_as_format() {
        let mut dev = tmp_device();
        let (_dir, pub_path, priv_path) = tmp_pem_paths();
        let outcome = format(&mut dev, &pub_path, &priv_path, None, None, false).unwrap();
        let rsa_priv = keyslots::load_private_key(&priv_path, None).unwrap();
        let unlocked = unlock(&mut dev, &rsa_priv).unwrap();
        assert_eq!(unlocked, outcome.master_key);
    }

    #[test]
    fn three_users_scenario() {
        let mut dev = tmp_device();
        let (_dir_a, pub_a, priv_a) = tmp_pem_paths();
        let outcome = format(&mut dev, &pub_a, &priv_a, None, None, false).unwrap();
        let rsa_a = keyslots::load_private_key(&priv_a, None).unwrap();

        let rsa_b = keyslots::generate_rsa_keypair().unwrap();
        let pub_b = RsaPublicKey::from(&rsa_b);
        add_user(&mut dev, &outcome.master_key, &rsa_a, &pub_b).unwrap();

        let rsa_c = keyslots::generate_rsa_keypair().unwrap();
        let pub_c = RsaPublicKey::from(&rsa_c);
        add_user(&mut dev, &outcome.master_key, &rsa_a, &pub_c).unwrap();

        remove_user(&mut dev, &outcome.master_key, &rsa_a, &pub_b).unwrap();

        let unlocked_c = unlock(&mut dev, &rsa_c).unwrap();
        assert_eq!(unlocked_c, outcome.master_key);
        assert!(unlock(&mut dev, &rsa_b).is_err());
    }

    #[test]
    fn removing_last_user_fails() {
        let mut dev = tmp_device();
        let (_dir, pub_path, priv_path) = tmp_pem_paths();
        let outcome = format(&mut dev, &pub_path, &priv_path, None, None, false).unwrap();
        let rsa_priv = keyslots::load_private_key(&priv_path, None).unwrap();
        let pub_key = RsaPublicKey::from(&rsa_priv);
        let err = remove_user(&mut dev, &outcome.master_key, &rsa_priv, &pub_key).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
