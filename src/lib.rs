//! SherlockFS: a userspace encrypted filesystem, exposed over FUSE.
//!
//! A whole-disk image is carved into fixed-size blocks; every block except
//! the header is encrypted under a single symmetric master key. The master
//! key never touches disk in the clear — it lives only in RAM, and is
//! copied into up to [`cryptfs::NB_ENCRYPTION_KEYS`] key slots, each wrapped
//! under a different user's RSA public key.
extern crate core;

pub mod block_cipher;
pub mod cryptfs;
pub mod entries;
pub mod error;
pub mod fat;
pub mod fuse_fs;
pub mod keyslots;
pub mod manager;
pub mod path;
pub mod state;
pub mod utils;

use lazy_static::lazy_static;
use mut_static::MutStatic;

pub use error::{Error, Result};

lazy_static! {
    /// Process-global device path, set once before any block I/O (§5
    /// "Shared-resource policy").
    pub static ref DEVICE_FILE: MutStatic<String> = MutStatic::new();
}

/// Initializes the `env_logger` backend. Call once from each binary's
/// `main`, mirroring the teacher's `init_logs()`.
pub fn init_logs() {
    let _ = env_logger::builder().is_test(false).try_init();
}
