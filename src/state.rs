//! Process-state store (§4.8): the unwrapped master-key cell and the
//! FUSE shim's open-handle table. Both are process-wide mutable state,
//! mutated only from the dispatch thread (§5).

use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use zeroize::Zeroize;

use crate::cryptfs::EntryId;
use crate::error::{Error, Result};

/// Handle ids start at 3 to avoid colliding with stdin/stdout/stderr
/// (§4.8, §B.3).
pub const FD_MIN: u64 = 3;

/// Holds the master key XOR-masked with a random pad while idle. This is
/// a mitigation against casual memory disclosure, not a security
/// boundary (§4.8).
#[derive(Default)]
pub struct MasterKeyCell {
    masked: Option<(Vec<u8>, Vec<u8>)>,
}

impl MasterKeyCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Masks and stores `key`, zeroing the caller's copy afterward.
    pub fn set(&mut self, mut key: [u8; 32]) {
        let mut mask = vec![0u8; key.len()];
        OsRng.fill_bytes(&mut mask);
        let masked: Vec<u8> = key.iter().zip(mask.iter()).map(|(k, m)| k ^ m).collect();
        self.masked = Some((masked, mask));
        key.zeroize();
    }

    /// Returns a freshly unmasked copy, or `None` if unset.
    pub fn get(&self) -> Option<[u8; 32]> {
        let (masked, mask) = self.masked.as_ref()?;
        let mut out = [0u8; 32];
        for i in 0..32 {
            out[i] = masked[i] ^ mask[i];
        }
        Some(out)
    }

    /// Zeroes the stored material.
    pub fn clear(&mut self) {
        if let Some((mut masked, mut mask)) = self.masked.take() {
            masked.zeroize();
            mask.zeroize();
        }
    }

    pub fn is_set(&self) -> bool {
        self.masked.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub readable: bool,
    pub writable: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct OpenHandle {
    pub entry_id: EntryId,
    pub offset: u64,
    pub mode: OpenMode,
}

/// Open-handle table for the FUSE shim: monotonically increasing handle
/// ids starting at [`FD_MIN`] (§4.8).
#[derive(Default)]
pub struct HandleTable {
    next: u64,
    handles: HashMap<u64, OpenHandle>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: FD_MIN,
            handles: HashMap::new(),
        }
    }

    pub fn allocate(&mut self, entry_id: EntryId, mode: OpenMode) -> Result<u64> {
        if self.handles.len() >= u16::MAX as usize {
            return Err(Error::TooManyOpenFiles);
        }
        let handle = self.next;
        self.next += 1;
        self.handles.insert(handle, OpenHandle { entry_id, offset: 0, mode });
        Ok(handle)
    }

    pub fn release(&mut self, handle: u64) -> Result<()> {
        self.handles.remove(&handle).map(|_| ()).ok_or(Error::BadHandle)
    }

    pub fn get(&self, handle: u64) -> Result<&OpenHandle> {
        self.handles.get(&handle).ok_or(Error::BadHandle)
    }

    pub fn get_mut(&mut self, handle: u64) -> Result<&mut OpenHandle> {
        self.handles.get_mut(&handle).ok_or(Error::BadHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_roundtrips_through_mask() {
        let mut cell = MasterKeyCell::new();
        assert!(!cell.is_set());
        cell.set([7u8; 32]);
        assert_eq!(cell.get(), Some([7u8; 32]));
        cell.clear();
        assert!(!cell.is_set());
        assert_eq!(cell.get(), None);
    }

    #[test]
    fn handles_start_at_fd_min_and_increase() {
        let mut table = HandleTable::new();
        let mode = OpenMode { readable: true, writable: false };
        let a = table.allocate(EntryId::root(), mode).unwrap();
        let b = table.allocate(EntryId::root(), mode).unwrap();
        assert_eq!(a, FD_MIN);
        assert_eq!(b, FD_MIN + 1);
    }

    #[test]
    fn double_release_fails_bad_handle() {
        let mut table = HandleTable::new();
        let mode = OpenMode { readable: true, writable: true };
        let h = table.allocate(EntryId::root(), mode).unwrap();
        table.release(h).unwrap();
        assert!(matches!(table.release(h), Err(Error::BadHandle)));
    }

    #[test]
    fn releasing_unknown_handle_fails() {
        let mut table = HandleTable::new();
        assert!(matches!(table.release(999), Err(Error::BadHandle)));
    }
}
