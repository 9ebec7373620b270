//! reply structures.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::abi::{
    fuse_attr, fuse_attr_out, fuse_entry_out, fuse_kstatfs, fuse_lk_out, fuse_lseek_out,
    fuse_statfs_out, fuse_statx, fuse_sx_time, fuse_write_out, fuse_file_lock,
};
use crate::helper::mode_from_kind_and_perm;
use crate::{FileType, Timestamp};

/// file attributes
#[derive(Clone, Copy, Debug, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct FileAttr {
    /// Inode number. `0` lets the session fill in the node id.
    pub ino: u64,
    /// Size in bytes
    pub size: u64,
    /// Size in blocks
    pub blocks: u64,
    /// Time of last access
    pub atime: Timestamp,
    /// Time of last modification
    pub mtime: Timestamp,
    /// Time of last change
    pub ctime: Timestamp,
    /// Kind of file (directory, file, pipe, etc)
    pub kind: FileType,
    /// Permissions
    pub perm: u16,
    /// Number of hard links
    pub nlink: u32,
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
    /// Rdev
    pub rdev: u32,
    /// Block size
    pub blksize: u32,
}

impl FileAttr {
    /// a minimal attribute of the given kind; zeroed permissions are later
    /// widened to 0755 (directories) or 0644 (anything else).
    pub fn new(kind: FileType) -> Self {
        let zero = Timestamp::new(0, 0);

        Self {
            ino: 0,
            size: 0,
            blocks: 0,
            atime: zero,
            mtime: zero,
            ctime: zero,
            kind,
            perm: 0,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 0,
        }
    }
}

impl From<FileAttr> for fuse_attr {
    fn from(attr: FileAttr) -> Self {
        fuse_attr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            // NB: fuse_kernel.h defines the seconds fields as "uint64_t", but
            // they actually get cast to time_t (e.g. int64_t) inside the
            // kernel.
            atime: attr.atime.sec as u64,
            mtime: attr.mtime.sec as u64,
            ctime: attr.ctime.sec as u64,
            atimensec: attr.atime.nsec,
            mtimensec: attr.mtime.nsec,
            ctimensec: attr.ctime.nsec,
            mode: mode_from_kind_and_perm(attr.kind, attr.perm),
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: if attr.blksize == 0 { 4096 } else { attr.blksize },
            flags: 0,
        }
    }
}

/// attr reply.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ReplyAttr {
    /// the attribute TTL.
    pub ttl: Duration,
    /// the attribute.
    pub attr: FileAttr,
}

impl From<ReplyAttr> for fuse_attr_out {
    fn from(attr: ReplyAttr) -> Self {
        fuse_attr_out {
            attr_valid: attr.ttl.as_secs(),
            attr_valid_nsec: attr.ttl.subsec_nanos(),
            dummy: 0,
            attr: attr.attr.into(),
        }
    }
}

pub(crate) fn entry_out(
    nodeid: u64,
    generation: u64,
    ttl: Duration,
    attr: FileAttr,
) -> fuse_entry_out {
    fuse_entry_out {
        nodeid,
        generation,
        entry_valid: ttl.as_secs(),
        attr_valid: ttl.as_secs(),
        entry_valid_nsec: ttl.subsec_nanos(),
        attr_valid_nsec: ttl.subsec_nanos(),
        attr: attr.into(),
    }
}

/// The payload of a read reply.
///
/// [`ReadResult::fd`] identifies the bytes by a file descriptor instead of
/// buffering them; the session writer then tries to splice them to the
/// kernel without a userspace copy, falling back to a plain buffered write
/// when splice is unavailable.
#[derive(Debug, Clone)]
pub struct ReadResult(pub(crate) ReadResultInner);

#[derive(Debug, Clone)]
pub(crate) enum ReadResultInner {
    Data(Bytes),
    Fd {
        fd: Arc<OwnedFd>,
        offset: u64,
        size: u32,
    },
}

impl ReadResult {
    /// reply with an in-memory payload.
    pub fn data(data: impl Into<Bytes>) -> Self {
        Self(ReadResultInner::Data(data.into()))
    }

    /// reply with `size` bytes read from `fd` at `offset`.
    pub fn fd(fd: Arc<OwnedFd>, offset: u64, size: u32) -> Self {
        Self(ReadResultInner::Fd { fd, offset, size })
    }
}

impl From<Bytes> for ReadResult {
    fn from(data: Bytes) -> Self {
        Self::data(data)
    }
}

impl From<Vec<u8>> for ReadResult {
    fn from(data: Vec<u8>) -> Self {
        Self::data(data)
    }
}

/// write reply.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ReplyWrite {
    /// the data written.
    pub written: u32,
}

impl From<ReplyWrite> for fuse_write_out {
    fn from(written: ReplyWrite) -> Self {
        fuse_write_out {
            size: written.written,
            _padding: 0,
        }
    }
}

/// statfs reply.
#[derive(Debug, Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ReplyStatFs {
    /// the number of blocks in the filesystem.
    pub blocks: u64,
    /// the number of free blocks.
    pub bfree: u64,
    /// the number of free blocks for non-priviledge users.
    pub bavail: u64,
    /// the number of inodes.
    pub files: u64,
    /// the number of free inodes.
    pub ffree: u64,
    /// the block size.
    pub bsize: u32,
    /// the maximum length of file name.
    pub namelen: u32,
    /// the fragment size.
    pub frsize: u32,
}

impl From<ReplyStatFs> for fuse_statfs_out {
    fn from(stat_fs: ReplyStatFs) -> Self {
        fuse_statfs_out {
            st: fuse_kstatfs {
                blocks: stat_fs.blocks,
                bfree: stat_fs.bfree,
                bavail: stat_fs.bavail,
                files: stat_fs.files,
                ffree: stat_fs.ffree,
                bsize: stat_fs.bsize,
                namelen: stat_fs.namelen,
                frsize: stat_fs.frsize,
                _padding: 0,
                spare: [0; 6],
            },
        }
    }
}

/// xattr reply.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum ReplyXAttr {
    Size(u32),
    Data(Bytes),
}

/// file lock reply.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ReplyLock {
    /// starting offset for lock.
    pub start: u64,
    /// end offset for lock.
    pub end: u64,
    /// type of lock, such as: [`F_RDLCK`], [`F_WRLCK`] and [`F_UNLCK`]
    ///
    /// [`F_RDLCK`]: libc::F_RDLCK
    /// [`F_WRLCK`]: libc::F_WRLCK
    /// [`F_UNLCK`]: libc::F_UNLCK
    pub r#type: u32,
    /// PID of process blocking our lock
    pub pid: u32,
}

impl From<ReplyLock> for fuse_lk_out {
    fn from(lock: ReplyLock) -> Self {
        fuse_lk_out {
            lk: fuse_file_lock {
                start: lock.start,
                end: lock.end,
                r#type: lock.r#type,
                pid: lock.pid,
            },
        }
    }
}

/// the lseek reply.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ReplyLSeek {
    /// lseek offset.
    pub offset: u64,
}

impl From<ReplyLSeek> for fuse_lseek_out {
    fn from(seek: ReplyLSeek) -> Self {
        fuse_lseek_out {
            offset: seek.offset,
        }
    }
}

/// copy_file_range reply.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ReplyCopyFileRange {
    /// data copied size.
    pub copied: u64,
}

impl From<ReplyCopyFileRange> for fuse_write_out {
    fn from(copied: ReplyCopyFileRange) -> Self {
        fuse_write_out {
            size: copied.copied as u32,
            _padding: 0,
        }
    }
}

/// ioctl reply.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ReplyIoctl {
    /// the ioctl result value.
    pub result: i32,
    /// output data, truncated to the size the caller asked for.
    pub data: Bytes,
}

/// extended attributes of a statx reply.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ReplyStatx {
    /// the attribute TTL.
    pub ttl: Duration,
    /// mask of filled fields, see statx(2).
    pub mask: u32,
    /// the attribute.
    pub attr: FileAttr,
    /// creation time, if known.
    pub btime: Option<Timestamp>,
}

impl From<ReplyStatx> for fuse_statx {
    fn from(statx: ReplyStatx) -> Self {
        let attr = statx.attr;

        fuse_statx {
            mask: statx.mask,
            blksize: if attr.blksize == 0 { 4096 } else { attr.blksize },
            attributes: 0,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            mode: mode_from_kind_and_perm(attr.kind, attr.perm) as u16,
            _spare0: 0,
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            attributes_mask: 0,
            atime: timestamp_to_sx(attr.atime),
            btime: statx.btime.map(timestamp_to_sx).unwrap_or_default(),
            ctime: timestamp_to_sx(attr.ctime),
            mtime: timestamp_to_sx(attr.mtime),
            rdev_major: attr.rdev >> 8,
            rdev_minor: attr.rdev & 0xff,
            dev_major: 0,
            dev_minor: 0,
            _spare2: [0; 14],
        }
    }
}

fn timestamp_to_sx(timestamp: Timestamp) -> fuse_sx_time {
    fuse_sx_time {
        tv_sec: timestamp.sec,
        tv_nsec: timestamp.nsec,
        _reserved: 0,
    }
}

/// directory entry.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct DirectoryEntry {
    /// entry inode.
    pub inode: u64,
    /// entry kind.
    pub kind: FileType,
    /// entry name.
    pub name: std::ffi::OsString,
}
