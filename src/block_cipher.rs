//! Cipher layer (§4.2): wraps a [`BlockDevice`] so that every block except
//! the header and key slots is AES-256-CBC encrypted on disk and decrypted
//! transparently on read.
//!
//! The IV is fixed per volume: the first 16 bytes of SHA-256 of the master
//! key (§6, §9 "Crypto provider" — a documented compatibility point, not an
//! accidental weakness). Because every unit we encrypt is an exact multiple
//! of the AES block size, padding is disabled (`NoPadding`): ciphertext
//! length always equals plaintext length.

use aes::Aes256;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};

use block_device::BlockDevice;

use crate::cryptfs::{CRYPTFS_BLOCK_SIZE_BYTES, HEADER_BLOCK, KEYS_STORAGE_START_BLOCK, NB_ENCRYPTION_KEYS};
use crate::error::{Error, Result};

type Enc = cbc::Encryptor<Aes256>;
type Dec = cbc::Decryptor<Aes256>;

const AES_BLOCK_LEN: usize = 16;

fn derive_iv(master_key: &[u8; 32]) -> [u8; AES_BLOCK_LEN] {
    let digest = Sha256::digest(master_key);
    let mut iv = [0u8; AES_BLOCK_LEN];
    iv.copy_from_slice(&digest[..AES_BLOCK_LEN]);
    iv
}

/// True for the header block and the 64 key-slot blocks, which are stored
/// in the clear (§4.2: "the key-slot blocks are not encrypted either, they
/// contain RSA-wrapped material already").
pub fn is_plaintext_block(index: u64) -> bool {
    index == HEADER_BLOCK
        || (KEYS_STORAGE_START_BLOCK..KEYS_STORAGE_START_BLOCK + NB_ENCRYPTION_KEYS as u64)
            .contains(&index)
}

/// Reads `n` blocks starting at `start`, decrypting every block that isn't
/// plaintext-by-policy, into `out` (must be `n * block_size` bytes).
pub fn read_blocks_decrypted(
    device: &mut dyn BlockDevice,
    master_key: &[u8; 32],
    start: u64,
    n: usize,
    out: &mut [u8],
) -> Result<()> {
    device.read_blocks(start, n, out)?;
    let iv = derive_iv(master_key);
    for i in 0..n {
        let block_index = start + i as u64;
        if is_plaintext_block(block_index) {
            continue;
        }
        let chunk = &mut out[i * CRYPTFS_BLOCK_SIZE_BYTES..(i + 1) * CRYPTFS_BLOCK_SIZE_BYTES];
        Dec::new(master_key.into(), &iv.into())
            .decrypt_padded_mut::<NoPadding>(chunk)
            .map_err(|e| Error::Cipher(format!("block {block_index} decrypt failed: {e}")))?;
    }
    Ok(())
}

/// Encrypts `data` (`n * block_size` bytes, plaintext) and writes it
/// starting at `start`, leaving plaintext-by-policy blocks untouched.
pub fn write_blocks_encrypted(
    device: &mut dyn BlockDevice,
    master_key: &[u8; 32],
    start: u64,
    n: usize,
    data: &[u8],
) -> Result<()> {
    let iv = derive_iv(master_key);
    let mut buf = data[..n * CRYPTFS_BLOCK_SIZE_BYTES].to_vec();
    for i in 0..n {
        let block_index = start + i as u64;
        if is_plaintext_block(block_index) {
            continue;
        }
        let chunk = &mut buf[i * CRYPTFS_BLOCK_SIZE_BYTES..(i + 1) * CRYPTFS_BLOCK_SIZE_BYTES];
        Enc::new(master_key.into(), &iv.into())
            .encrypt_padded_mut::<NoPadding>(chunk, CRYPTFS_BLOCK_SIZE_BYTES)
            .map_err(|e| Error::Cipher(format!("block {block_index} encrypt failed: {e}")))?;
    }
    device.write_blocks(start, n, &buf)?;
    Ok(())
}
