//! FUSE dispatch shim (§6, §9 "consumed contract"): maps kernel upcalls
//! onto the core operations in [`crate::entries`]/[`crate::path`].
//!
//! Mirrors the teacher's `fuse.rs`: one inherent "core" method per FUSE
//! callback, with the trait impl itself staying a thin `rep!`-style
//! dispatcher. Here the dispatcher is the [`reply_result!`] macro and a
//! `From<&Error> for c_int` mapping, replacing the teacher's sentinel-int
//! `ret()`/`rep!` helpers with the named [`Error`] enum (§A.3).

use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyWrite, Request, TimeOrNow,
};
use libc::{c_int, EACCES, EEXIST, EINVAL, EIO, EISDIR, EMFILE, ENOENT, ENOSYS, ENOTDIR};
use log::{debug, error};

use block_device::BlockDevice;

use crate::cryptfs::{CryptFsEntry, EntryId, EntryType};
use crate::entries;
use crate::error::Error;
use crate::path;
use crate::state::{HandleTable, OpenMode};

/// Kernel attribute cache lifetime. A fresh value every call would work
/// just as well since there's no invalidation channel; one second matches
/// the teacher's `TTL`.
const TTL: Duration = Duration::from_secs(1);

impl From<&Error> for c_int {
    fn from(e: &Error) -> c_int {
        match e {
            Error::NotFound => ENOENT,
            Error::AlreadyExists => EEXIST,
            Error::NotADirectory => ENOTDIR,
            Error::IsADirectory => EISDIR,
            Error::InvalidArgument(_) => EINVAL,
            Error::PermissionDenied => EACCES,
            Error::TooManyOpenFiles => EMFILE,
            Error::BadHandle => EINVAL,
            Error::AllocationExhausted(_) | Error::Io(_) | Error::Cipher(_) => EIO,
            Error::CorruptFilesystem(msg) => {
                error!("internal invariant violation, aborting: {msg}");
                std::process::abort();
            }
        }
    }
}

/// Maps an [`EntryId`] to a stable inode number. Inode 1 is reserved for
/// FUSE's mandatory root; everything else packs `(directory_block,
/// directory_index)` into 64 bits.
fn entry_id_to_ino(id: EntryId) -> u64 {
    if id == EntryId::root() {
        1
    } else {
        (id.directory_block << 20) | (id.directory_index as u64 & 0xFFFFF)
    }
}

fn ino_to_entry_id(ino: u64) -> EntryId {
    if ino == 1 {
        EntryId::root()
    } else {
        EntryId {
            directory_block: ino >> 20,
            directory_index: (ino & 0xFFFFF) as u32,
        }
    }
}

fn file_type_of(kind: EntryType) -> FileType {
    match kind {
        EntryType::File | EntryType::Hardlink => FileType::RegularFile,
        EntryType::Directory => FileType::Directory,
        EntryType::Symlink => FileType::Symlink,
    }
}

fn to_attr(ino: u64, entry: &CryptFsEntry, block_size: u32) -> FileAttr {
    let kind = entry.entry_type().unwrap_or(EntryType::File);
    let size = entry.size;
    let blocks = (size + block_size as u64 - 1) / block_size as u64;
    FileAttr {
        ino,
        size,
        blocks,
        atime: UNIX_EPOCH + Duration::from_secs(entry.atime as u64),
        mtime: UNIX_EPOCH + Duration::from_secs(entry.mtime as u64),
        ctime: UNIX_EPOCH + Duration::from_secs(entry.ctime as u64),
        crtime: UNIX_EPOCH + Duration::from_secs(entry.ctime as u64),
        kind: file_type_of(kind),
        perm: (entry.mode & 0o7777) as u16,
        nlink: 1,
        uid: entry.uid,
        gid: entry.gid,
        rdev: 0,
        blksize: block_size,
        flags: 0,
    }
}

fn time_or_now(t: Option<TimeOrNow>) -> Option<u32> {
    t.map(|t| match t {
        TimeOrNow::SpecificTime(st) => st
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32,
        TimeOrNow::Now => crate::utils::now_epoch(),
    })
}

/// Concrete FUSE filesystem: owns the underlying device, the unwrapped
/// master key for the duration of the mount, and the open-handle table
/// (§4.8, §5 "one mount per volume").
pub struct SherlockFuse<D: BlockDevice> {
    device: D,
    master_key: [u8; 32],
    handles: HandleTable,
    block_size: u32,
}

impl<D: BlockDevice> SherlockFuse<D> {
    pub fn new(device: D, master_key: [u8; 32]) -> Self {
        let block_size = device.block_size() as u32;
        Self {
            device,
            master_key,
            handles: HandleTable::new(),
            block_size,
        }
    }

    fn attr_for(&mut self, id: EntryId) -> Result<FileAttr, Error> {
        let entry = entries::read_entry(&mut self.device, &self.master_key, id)?;
        Ok(to_attr(entry_id_to_ino(id), &entry, self.block_size))
    }
}

impl<D: BlockDevice> Filesystem for SherlockFuse<D> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        // Scheduling model is single-threaded cooperative (§5): we never
        // opt into FUSE_ASYNC_READ, so the kernel serializes read dispatch.
        debug!("sherlockfs mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("sherlockfs unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_id = ino_to_entry_id(parent);
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(EINVAL),
        };
        let parent_entry = match entries::read_entry(&mut self.device, &self.master_key, parent_id) {
            Ok(e) => e,
            Err(e) => return reply.error((&e).into()),
        };
        match path::find_by_name(&mut self.device, &self.master_key, &parent_entry, name) {
            Ok(Some(id)) => match self.attr_for(id) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error((&e).into()),
            },
            Ok(None) => reply.error(ENOENT),
            Err(e) => reply.error((&e).into()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.attr_for(ino_to_entry_id(ino)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error((&e).into()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // chmod/chown are not yet implemented (§6).
        if mode.is_some() || uid.is_some() || gid.is_some() {
            return reply.error(ENOSYS);
        }
        let id = ino_to_entry_id(ino);

        if let Some(new_size) = size {
            if let Err(e) = entries::truncate(&mut self.device, &self.master_key, id, new_size) {
                return reply.error((&e).into());
            }
        }

        if atime.is_some() || mtime.is_some() {
            match entries::read_entry(&mut self.device, &self.master_key, id) {
                Ok(mut entry) => {
                    if let Some(a) = time_or_now(atime) {
                        entry.atime = a;
                    }
                    if let Some(m) = time_or_now(mtime) {
                        entry.mtime = m;
                    }
                    if let Err(e) = entries::write_entry(&mut self.device, &self.master_key, id, &entry) {
                        return reply.error((&e).into());
                    }
                }
                Err(e) => return reply.error((&e).into()),
            }
        }

        match self.attr_for(id) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error((&e).into()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let id = ino_to_entry_id(ino);
        let entry = match entries::read_entry(&mut self.device, &self.master_key, id) {
            Ok(e) => e,
            Err(e) => return reply.error((&e).into()),
        };
        let mut buf = vec![0u8; entry.size as usize];
        match entries::read_at(&mut self.device, &self.master_key, id, 0, &mut buf, entry.size as usize) {
            Ok(_) => reply.data(&buf),
            Err(e) => reply.error((&e).into()),
        }
    }

    fn mknod(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, _rdev: u32, reply: ReplyEntry) {
        self.create_and_reply(parent, name, reply);
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, reply: ReplyEntry) {
        let parent_id = ino_to_entry_id(parent);
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(EINVAL),
        };
        match entries::create_directory(&mut self.device, &self.master_key, parent_id, name, 0, 0) {
            Ok(id) => match self.attr_for(id) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error((&e).into()),
            },
            Err(e) => reply.error((&e).into()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.delete_and_reply(parent, name, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.delete_and_reply(parent, name, reply);
    }

    fn symlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, link: &Path, reply: ReplyEntry) {
        let parent_id = ino_to_entry_id(parent);
        let (name, target) = match (name.to_str(), link.to_str()) {
            (Some(n), Some(t)) => (n, t),
            _ => return reply.error(EINVAL),
        };
        match entries::create_symlink(&mut self.device, &self.master_key, parent_id, name, target, 0, 0) {
            Ok(id) => match self.attr_for(id) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error((&e).into()),
            },
            Err(e) => reply.error((&e).into()),
        }
    }

    fn link(&mut self, _req: &Request<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let target_id = ino_to_entry_id(ino);
        let parent_id = ino_to_entry_id(newparent);
        let name = match newname.to_str() {
            Some(n) => n,
            None => return reply.error(EINVAL),
        };
        match entries::create_hardlink(&mut self.device, &self.master_key, parent_id, name, target_id, 0, 0) {
            Ok(id) => match self.attr_for(id) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error((&e).into()),
            },
            Err(e) => reply.error((&e).into()),
        }
    }

    fn rename(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr, _flags: u32, reply: ReplyEmpty) {
        // Not part of the core operation set (§4.5); rename via entries is
        // a future rewrite opportunity, not specified behavior.
        let _ = (parent, name, newparent, newname);
        reply.error(ENOSYS);
    }

    fn read(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, size: u32, _flags: i32, _lock_owner: Option<u64>, reply: ReplyData) {
        let id = ino_to_entry_id(ino);
        let entry = match entries::read_entry(&mut self.device, &self.master_key, id) {
            Ok(e) => e,
            Err(e) => return reply.error((&e).into()),
        };
        let offset = offset as u64;
        let want = (size as u64).min(entry.size.saturating_sub(offset)) as usize;
        let mut buf = vec![0u8; want];
        if want == 0 {
            return reply.data(&buf);
        }
        match entries::read_at(&mut self.device, &self.master_key, id, offset, &mut buf, want) {
            Ok(_) => reply.data(&buf),
            Err(e) => reply.error((&e).into()),
        }
    }

    fn write(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, data: &[u8], _write_flags: u32, _flags: i32, _lock_owner: Option<u64>, reply: ReplyWrite) {
        let id = ino_to_entry_id(ino);
        match entries::write_at(&mut self.device, &self.master_key, id, offset as u64, data, data.len()) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error((&e).into()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let id = ino_to_entry_id(ino);
        if let Err(e) = entries::read_entry(&mut self.device, &self.master_key, id) {
            return reply.error((&e).into());
        }
        let mode = OpenMode {
            readable: flags & libc::O_WRONLY == 0,
            writable: flags & (libc::O_WRONLY | libc::O_RDWR) != 0,
        };
        match self.handles.allocate(id, mode) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error((&e).into()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        let id = ino_to_entry_id(ino);
        let mode = OpenMode { readable: true, writable: false };
        match self.handles.allocate(id, mode) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error((&e).into()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        // No write buffering above the device; flush/fsync are no-ops (§5).
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, _lock_owner: Option<u64>, _flush: bool, reply: ReplyEmpty) {
        match self.handles.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error((&e).into()),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.handles.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error((&e).into()),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let id = ino_to_entry_id(ino);
        let entry = match entries::read_entry(&mut self.device, &self.master_key, id) {
            Ok(e) => e,
            Err(e) => return reply.error((&e).into()),
        };
        if entry.entry_type().ok() != Some(EntryType::Directory) {
            return reply.error(ENOTDIR);
        }
        let children = match path::list_children(&mut self.device, &self.master_key, &entry) {
            Ok(c) => c,
            Err(e) => return reply.error((&e).into()),
        };

        let mut synthetic = vec![(id, ".".to_string(), FileType::Directory)];
        synthetic.push((id, "..".to_string(), FileType::Directory));
        for (index, child) in &children {
            let child_id = EntryId { directory_block: entry.start_block, directory_index: *index };
            let kind = child.entry_type().unwrap_or(EntryType::File);
            synthetic.push((child_id, child.name_str(), file_type_of(kind)));
        }

        for (i, (child_id, name, kind)) in synthetic.into_iter().enumerate().skip(offset as usize) {
            let full = reply.add(entry_id_to_ino(child_id), (i + 1) as i64, kind, name);
            if full {
                break;
            }
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        let id = ino_to_entry_id(ino);
        match entries::read_entry(&mut self.device, &self.master_key, id) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error((&e).into()),
        }
    }

    fn create(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, _flags: i32, reply: ReplyCreate) {
        let parent_id = ino_to_entry_id(parent);
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(EINVAL),
        };
        match entries::create_empty_file(&mut self.device, &self.master_key, parent_id, name, 0, 0) {
            Ok(id) => {
                let mode = OpenMode { readable: true, writable: true };
                let fh = match self.handles.allocate(id, mode) {
                    Ok(fh) => fh,
                    Err(e) => return reply.error((&e).into()),
                };
                match self.attr_for(id) {
                    Ok(attr) => reply.created(&TTL, &attr, 0, fh, 0),
                    Err(e) => reply.error((&e).into()),
                }
            }
            Err(e) => reply.error((&e).into()),
        }
    }
}

impl<D: BlockDevice> SherlockFuse<D> {
    fn create_and_reply(&mut self, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_id = ino_to_entry_id(parent);
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(EINVAL),
        };
        match entries::create_empty_file(&mut self.device, &self.master_key, parent_id, name, 0, 0) {
            Ok(id) => match self.attr_for(id) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error((&e).into()),
            },
            Err(e) => reply.error((&e).into()),
        }
    }

    fn delete_and_reply(&mut self, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_id = ino_to_entry_id(parent);
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(EINVAL),
        };
        let parent_entry = match entries::read_entry(&mut self.device, &self.master_key, parent_id) {
            Ok(e) => e,
            Err(e) => return reply.error((&e).into()),
        };
        let found = match path::find_by_name(&mut self.device, &self.master_key, &parent_entry, name) {
            Ok(Some(id)) => id,
            Ok(None) => return reply.error(ENOENT),
            Err(e) => return reply.error((&e).into()),
        };
        match entries::delete(&mut self.device, &self.master_key, parent_id, found.directory_index) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error((&e).into()),
        }
    }
}
