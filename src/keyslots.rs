//! Key-slot primitives (§4.3): RSA keypair generation and PEM persistence,
//! AES master-key generation, and per-slot wrap/unwrap of the master key.

use std::fs;
use std::path::{Path, PathBuf};

use pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::cryptfs::{KeySlot, AES_KEY_SIZE_BYTES, NB_ENCRYPTION_KEYS, RSA_KEY_SIZE_BITS, RSA_PUBLIC_EXPONENT};
use crate::error::{Error, Result};

/// 32 random bytes from a cryptographically secure source (§4.3).
pub fn generate_aes_key() -> [u8; AES_KEY_SIZE_BYTES] {
    let mut key = [0u8; AES_KEY_SIZE_BYTES];
    OsRng.fill_bytes(&mut key);
    key
}

/// RSA-2048, public exponent 65537 (the `rsa` crate always uses 65537).
pub fn generate_rsa_keypair() -> Result<RsaPrivateKey> {
    let key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_SIZE_BITS)
        .map_err(|e| Error::Cipher(format!("RSA keypair generation failed: {e}")))?;
    debug_assert_eq!(key.e(), &rsa::BigUint::from(RSA_PUBLIC_EXPONENT));
    Ok(key)
}

fn modulus_bytes(n: &rsa::BigUint) -> [u8; 256] {
    let mut out = [0u8; 256];
    let raw = n.to_bytes_be();
    let start = 256 - raw.len();
    out[start..].copy_from_slice(&raw);
    out
}

fn exponent_bytes(e: &rsa::BigUint) -> [u8; 4] {
    let mut out = [0u8; 4];
    let raw = e.to_bytes_be();
    let start = 4 - raw.len();
    out[start..].copy_from_slice(&raw);
    out
}

/// Finds the first free slot (occupied=0, modulus all-zero) and fills it
/// with `rsa_pub`'s modulus/exponent and an RSA-OAEP wrap of `aes_key`.
/// Fails with [`Error::AllocationExhausted`] if no free slot.
pub fn wrap_into_slot(slots: &mut [KeySlot; NB_ENCRYPTION_KEYS], rsa_pub: &RsaPublicKey, aes_key: &[u8; AES_KEY_SIZE_BYTES]) -> Result<usize> {
    let index = slots
        .iter()
        .position(|s| s.is_free())
        .ok_or_else(|| Error::AllocationExhausted("no free key slot".into()))?;

    let padding = Oaep::new::<Sha256>();
    let ciphered = rsa_pub
        .encrypt(&mut OsRng, padding, aes_key)
        .map_err(|e| Error::Cipher(format!("RSA-OAEP wrap failed: {e}")))?;

    let slot = &mut slots[index];
    slot.modulus = modulus_bytes(rsa_pub.n());
    slot.exponent = exponent_bytes(rsa_pub.e());
    slot.aes_key_ciphered[..ciphered.len()].copy_from_slice(&ciphered);
    slot.occupied = 1;
    Ok(index)
}

/// Returns the index of the occupied slot whose modulus equals
/// `rsa_priv`'s modulus, matching by modulus only (§4.3, §B.4).
pub fn find_matching_slot(slots: &[KeySlot; NB_ENCRYPTION_KEYS], rsa_priv: &RsaPrivateKey) -> Option<usize> {
    let target = modulus_bytes(rsa_priv.n());
    slots
        .iter()
        .position(|s| s.occupied != 0 && s.modulus == target)
}

/// RSA-OAEP decrypts the slot's ciphered AES key; fails unless the result
/// is exactly [`AES_KEY_SIZE_BYTES`] bytes.
pub fn unwrap_from_slot(slot: &KeySlot, rsa_priv: &RsaPrivateKey) -> Result<[u8; AES_KEY_SIZE_BYTES]> {
    let padding = Oaep::new::<Sha256>();
    let plain = rsa_priv
        .decrypt(padding, &slot.aes_key_ciphered)
        .map_err(|e| Error::Cipher(format!("RSA-OAEP unwrap failed: {e}")))?;
    plain
        .try_into()
        .map_err(|v: Vec<u8>| Error::Cipher(format!("unwrapped key had wrong length {}", v.len())))
}

pub fn available_slots(slots: &[KeySlot; NB_ENCRYPTION_KEYS]) -> usize {
    slots.iter().filter(|s| s.is_free()).count()
}

pub fn occupied_slots(slots: &[KeySlot; NB_ENCRYPTION_KEYS]) -> usize {
    slots.iter().filter(|s| s.occupied != 0).count()
}

/// Default key-file locations, `$HOME/.cryptfs/{public,private}.pem` (§6).
/// Creates the `.cryptfs` directory (mode 0o755) if absent.
pub fn default_key_paths() -> Result<(PathBuf, PathBuf)> {
    let home = std::env::var("HOME")
        .map_err(|_| Error::InvalidArgument("HOME is not set".into()))?;
    let dir = Path::new(&home).join(".cryptfs");
    if !dir.exists() {
        fs::create_dir(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
        }
    }
    Ok((dir.join("public.pem"), dir.join("private.pem")))
}

pub fn save_public_key(path: &Path, key: &RsaPublicKey) -> Result<()> {
    key.write_public_key_pem_file(path, LineEnding::LF)
        .map_err(|e| Error::Cipher(format!("failed to write public key: {e}")))
}

pub fn load_public_key(path: &Path) -> Result<RsaPublicKey> {
    RsaPublicKey::read_public_key_pem_file(path)
        .map_err(|e| Error::Cipher(format!("failed to read public key {}: {e}", path.display())))
}

/// Writes the private key PEM, optionally passphrase-encrypted (§6).
pub fn save_private_key(path: &Path, key: &RsaPrivateKey, passphrase: Option<&str>) -> Result<()> {
    match passphrase {
        Some(pass) if !pass.is_empty() => key
            .to_pkcs8_encrypted_pem(&mut OsRng, pass, LineEnding::LF)
            .map_err(|e| Error::Cipher(format!("failed to write encrypted private key: {e}")))
            .and_then(|pem| {
                fs::write(path, pem.as_bytes())
                    .map_err(|e| Error::Cipher(format!("failed to write encrypted private key: {e}")))
            }),
        _ => key
            .write_pkcs8_pem_file(path, LineEnding::LF)
            .map_err(|e| Error::Cipher(format!("failed to write private key: {e}"))),
    }
}

pub fn load_private_key(path: &Path, passphrase: Option<&str>) -> Result<RsaPrivateKey> {
    match passphrase {
        Some(pass) if !pass.is_empty() => fs::read_to_string(path)
            .map_err(|e| Error::Cipher(format!("failed to read encrypted private key {}: {e}", path.display())))
            .and_then(|pem| {
                RsaPrivateKey::from_pkcs8_encrypted_pem(&pem, pass)
                    .map_err(|e| Error::Cipher(format!("failed to read encrypted private key: {e}")))
            }),
        _ => RsaPrivateKey::read_pkcs8_pem_file(path)
            .map_err(|e| Error::Cipher(format!("failed to read private key {}: {e}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_slots() -> [KeySlot; NB_ENCRYPTION_KEYS] {
        [KeySlot::empty(); NB_ENCRYPTION_KEYS]
    }

    #[test]
    fn aes_key_is_32_bytes_and_varies() {
        let a = generate_aes_key();
        let b = generate_aes_key();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn wrap_then_unwrap_roundtrip() {
        let rsa_priv = generate_rsa_keypair().unwrap();
        let rsa_pub = RsaPublicKey::from(&rsa_priv);
        let aes_key = generate_aes_key();
        let mut slots = empty_slots();

        let index = wrap_into_slot(&mut slots, &rsa_pub, &aes_key).unwrap();
        assert_eq!(occupied_slots(&slots), 1);
        assert_eq!(available_slots(&slots), NB_ENCRYPTION_KEYS - 1);

        let found = find_matching_slot(&slots, &rsa_priv).unwrap();
        assert_eq!(found, index);

        let unwrapped = unwrap_from_slot(&slots[found], &rsa_priv).unwrap();
        assert_eq!(unwrapped, aes_key);
    }

    #[test]
    fn wrong_key_does_not_match_any_slot() {
        let rsa_priv = generate_rsa_keypair().unwrap();
        let rsa_pub = RsaPublicKey::from(&rsa_priv);
        let other_priv = generate_rsa_keypair().unwrap();
        let mut slots = empty_slots();
        wrap_into_slot(&mut slots, &rsa_pub, &generate_aes_key()).unwrap();
        assert!(find_matching_slot(&slots, &other_priv).is_none());
    }

    #[test]
    fn wrap_fails_when_all_slots_occupied() {
        let mut slots = empty_slots();
        for slot in slots.iter_mut() {
            slot.occupied = 1;
            slot.modulus[0] = 1;
        }
        let rsa_priv = generate_rsa_keypair().unwrap();
        let rsa_pub = RsaPublicKey::from(&rsa_priv);
        let err = wrap_into_slot(&mut slots, &rsa_pub, &generate_aes_key()).unwrap_err();
        assert!(matches!(err, Error::AllocationExhausted(_)));
    }
}
