use std::ffi::OsStr;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::dir::DirStream;
use super::handle::FileHandle;
use crate::reply::{
    FileAttr, ReadResult, ReplyAttr, ReplyCopyFileRange, ReplyIoctl, ReplyLSeek, ReplyLock,
    ReplyStatFs, ReplyStatx, ReplyWrite, ReplyXAttr,
};
use crate::{Errno, Request, Result, SetAttr};

/// What an entry-producing operation hands back to the session: the child's
/// operations, its attributes and cache TTL.
///
/// When `attr.ino` is zero the session mints an automatic inode number;
/// returning the same non-zero `attr.ino` from several places makes the
/// names hard links to one inode.
pub struct Entry {
    pub ops: Arc<dyn NodeOps>,
    pub attr: FileAttr,
    pub generation: u64,
    pub ttl: Duration,
}

impl Entry {
    pub fn new(ops: Arc<dyn NodeOps>, attr: FileAttr) -> Self {
        Self {
            ops,
            attr,
            generation: 0,
            ttl: Duration::from_secs(1),
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;

        self
    }

    pub fn generation(mut self, generation: u64) -> Self {
        self.generation = generation;

        self
    }
}

/// open/opendir reply: the handle the session will own, plus FOPEN flags
/// such as [`FOPEN_DIRECT_IO`] or [`FOPEN_KEEP_CACHE`].
///
/// [`FOPEN_DIRECT_IO`]: crate::flags::FOPEN_DIRECT_IO
/// [`FOPEN_KEEP_CACHE`]: crate::flags::FOPEN_KEEP_CACHE
#[derive(Debug, Default)]
pub struct Opened {
    pub handle: FileHandle,
    pub flags: u32,
}

impl Opened {
    pub fn new(handle: FileHandle) -> Self {
        Self { handle, flags: 0 }
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;

        self
    }
}

const NOT_IMPLEMENTED: Errno = Errno(libc::ENOSYS);

/// The operations a node may support.
///
/// Every method has a default body returning ENOSYS, which the dispatcher
/// turns into the opcode's documented default reply (noted per method);
/// override only what the node actually implements. Nodes are shared
/// between concurrent requests, so state needs interior mutability.
#[async_trait]
#[allow(unused_variables)]
pub trait NodeOps: Send + Sync + 'static {
    /// look up a direct child by name. Entry-producing: on success the
    /// child is inserted into the tree and its kernel lookup count rises by
    /// one.
    ///
    /// Default: consult the children currently in the tree, ENOENT if the
    /// name is unknown.
    async fn lookup(&self, req: &Request, name: &OsStr) -> Result<Entry> {
        Err(NOT_IMPLEMENTED)
    }

    /// get attributes. `fh` is set when the kernel identified an open
    /// handle.
    ///
    /// Default: attributes synthesized from the stable attr, with 0755
    /// (directories) or 0644 (other files) permissions.
    async fn getattr(&self, req: &Request, fh: Option<Arc<FileHandle>>) -> Result<ReplyAttr> {
        Err(NOT_IMPLEMENTED)
    }

    /// set attributes. Default: ENOTSUP.
    async fn setattr(
        &self,
        req: &Request,
        fh: Option<Arc<FileHandle>>,
        set_attr: SetAttr,
    ) -> Result<ReplyAttr> {
        Err(NOT_IMPLEMENTED)
    }

    /// read the content of a symlink. Default: EINVAL.
    async fn readlink(&self, req: &Request) -> Result<Bytes> {
        Err(NOT_IMPLEMENTED)
    }

    /// create a symbolic link entry under this directory. Default: ENOTSUP.
    async fn symlink(&self, req: &Request, name: &OsStr, link: &OsStr) -> Result<Entry> {
        Err(NOT_IMPLEMENTED)
    }

    /// create a file node (regular, device, fifo or socket). Default:
    /// ENOTSUP.
    async fn mknod(&self, req: &Request, name: &OsStr, mode: u32, rdev: u32) -> Result<Entry> {
        Err(NOT_IMPLEMENTED)
    }

    /// create a directory. Default: ENOTSUP.
    async fn mkdir(&self, req: &Request, name: &OsStr, mode: u32, umask: u32) -> Result<Entry> {
        Err(NOT_IMPLEMENTED)
    }

    /// remove a file from this directory. On success (including the
    /// default) the edge is removed from the tree. Default: OK.
    async fn unlink(&self, req: &Request, name: &OsStr) -> Result<()> {
        Err(NOT_IMPLEMENTED)
    }

    /// remove an empty directory from this directory. Default: OK.
    async fn rmdir(&self, req: &Request, name: &OsStr) -> Result<()> {
        Err(NOT_IMPLEMENTED)
    }

    /// move a child to `new_parent` under `new_name`. `flags` carries
    /// RENAME_NOREPLACE / RENAME_EXCHANGE; the tree mutation (including the
    /// exchange case) is applied by the session once this returns OK.
    /// Default: ENOTSUP.
    async fn rename(
        &self,
        req: &Request,
        name: &OsStr,
        new_parent: Arc<dyn NodeOps>,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<()> {
        Err(NOT_IMPLEMENTED)
    }

    /// create a hard link to `target` under this directory. On success the
    /// existing inode gains the new name. Default: ENOTSUP.
    async fn link(
        &self,
        req: &Request,
        target: Arc<dyn NodeOps>,
        name: &OsStr,
    ) -> Result<ReplyAttr> {
        Err(NOT_IMPLEMENTED)
    }

    /// open this node. Default: OK with an empty stateless handle; when
    /// [`passthrough_fd`] yields a descriptor and passthrough was
    /// negotiated, the kernel gets a passthrough reference instead.
    ///
    /// [`passthrough_fd`]: NodeOps::passthrough_fd
    async fn open(&self, req: &Request, flags: u32) -> Result<Opened> {
        Err(NOT_IMPLEMENTED)
    }

    /// read from this node. The reply is truncated to `size` bytes.
    ///
    /// Default: served from the handle's backing fd when it has one,
    /// ENOTSUP otherwise.
    async fn read(
        &self,
        req: &Request,
        fh: Option<Arc<FileHandle>>,
        offset: u64,
        size: u32,
    ) -> Result<ReadResult> {
        Err(NOT_IMPLEMENTED)
    }

    /// write to this node. `flags` carries the kernel write flags; with a
    /// writeback cache, [`FUSE_WRITE_CACHE`] marks a delayed write whose
    /// file handle is guessed. Default: ENOTSUP.
    ///
    /// [`FUSE_WRITE_CACHE`]: crate::flags::FUSE_WRITE_CACHE
    async fn write(
        &self,
        req: &Request,
        fh: Option<Arc<FileHandle>>,
        offset: u64,
        data: &[u8],
        flags: u32,
    ) -> Result<ReplyWrite> {
        Err(NOT_IMPLEMENTED)
    }

    /// called on each close(2) of a descriptor for this node. Default: OK.
    async fn flush(
        &self,
        req: &Request,
        fh: Option<Arc<FileHandle>>,
        lock_owner: u64,
    ) -> Result<()> {
        Err(NOT_IMPLEMENTED)
    }

    /// flush data to stable storage. `datasync` restricts the flush to user
    /// data. Default: OK.
    async fn fsync(&self, req: &Request, fh: Option<Arc<FileHandle>>, datasync: bool) -> Result<()> {
        Err(NOT_IMPLEMENTED)
    }

    /// the last reference to an open handle is gone; the handle leaves the
    /// session's table after this returns. Default: OK.
    async fn release(
        &self,
        req: &Request,
        fh: Option<Arc<FileHandle>>,
        flags: u32,
        flush: bool,
    ) -> Result<()> {
        Err(NOT_IMPLEMENTED)
    }

    /// open this directory. Default: OK with an empty handle.
    async fn opendir(&self, req: &Request, flags: u32) -> Result<Opened> {
        Err(NOT_IMPLEMENTED)
    }

    /// enumerate this directory. The stream must be deterministic; see
    /// [`DirStream`].
    ///
    /// Default: the children currently in the tree, in insertion order.
    async fn readdir(&self, req: &Request) -> Result<Box<dyn DirStream>> {
        Err(NOT_IMPLEMENTED)
    }

    /// release an open directory. Default: OK.
    async fn releasedir(
        &self,
        req: &Request,
        fh: Option<Arc<FileHandle>>,
        flags: u32,
    ) -> Result<()> {
        Err(NOT_IMPLEMENTED)
    }

    /// flush directory contents. Default: OK.
    async fn fsyncdir(
        &self,
        req: &Request,
        fh: Option<Arc<FileHandle>>,
        datasync: bool,
    ) -> Result<()> {
        Err(NOT_IMPLEMENTED)
    }

    /// create and open a file under this directory. Default: EROFS.
    async fn create(
        &self,
        req: &Request,
        name: &OsStr,
        flags: u32,
        mode: u32,
    ) -> Result<(Entry, Opened)> {
        Err(NOT_IMPLEMENTED)
    }

    /// check access permissions. Default: ENOSYS, which makes the kernel
    /// fall back to its own checks and stop sending ACCESS. Note that a
    /// process serving its own mount should keep this default, or spawning
    /// subprocesses with a working directory inside the mount can deadlock.
    async fn access(&self, req: &Request, mask: u32) -> Result<()> {
        Err(NOT_IMPLEMENTED)
    }

    /// filesystem statistics. Default: zeroed statistics with OK.
    async fn statfs(&self, req: &Request) -> Result<ReplyStatFs> {
        Err(NOT_IMPLEMENTED)
    }

    /// read an extended attribute. Return `ReplyXAttr::Size` when `size` is
    /// zero, ERANGE when it is too small. Default: ENODATA.
    async fn getxattr(&self, req: &Request, name: &OsStr, size: u32) -> Result<ReplyXAttr> {
        Err(NOT_IMPLEMENTED)
    }

    /// store an extended attribute. Default: ENODATA.
    async fn setxattr(
        &self,
        req: &Request,
        name: &OsStr,
        value: &[u8],
        flags: u32,
    ) -> Result<()> {
        Err(NOT_IMPLEMENTED)
    }

    /// list extended attribute names, NUL separated. Default: empty list.
    async fn listxattr(&self, req: &Request, size: u32) -> Result<ReplyXAttr> {
        Err(NOT_IMPLEMENTED)
    }

    /// delete an extended attribute. Default: ENODATA.
    async fn removexattr(&self, req: &Request, name: &OsStr) -> Result<()> {
        Err(NOT_IMPLEMENTED)
    }

    /// test for a POSIX file lock. Default: ENOTSUP.
    #[allow(clippy::too_many_arguments)]
    async fn getlk(
        &self,
        req: &Request,
        fh: Option<Arc<FileHandle>>,
        lock_owner: u64,
        start: u64,
        end: u64,
        r#type: u32,
        pid: u32,
    ) -> Result<ReplyLock> {
        Err(NOT_IMPLEMENTED)
    }

    /// acquire, modify or release a POSIX file lock. `block` distinguishes
    /// SETLKW from SETLK. Default: ENOTSUP.
    #[allow(clippy::too_many_arguments)]
    async fn setlk(
        &self,
        req: &Request,
        fh: Option<Arc<FileHandle>>,
        lock_owner: u64,
        start: u64,
        end: u64,
        r#type: u32,
        pid: u32,
        block: bool,
    ) -> Result<()> {
        Err(NOT_IMPLEMENTED)
    }

    /// preallocate space. Default: ENOTSUP.
    async fn allocate(
        &self,
        req: &Request,
        fh: Option<Arc<FileHandle>>,
        offset: u64,
        length: u64,
        mode: u32,
    ) -> Result<()> {
        Err(NOT_IMPLEMENTED)
    }

    /// copy a range of data to `target` without routing it through the
    /// kernel. Default: ENOTSUP.
    #[allow(clippy::too_many_arguments)]
    async fn copy_file_range(
        &self,
        req: &Request,
        fh_in: Option<Arc<FileHandle>>,
        offset_in: u64,
        target: Arc<dyn NodeOps>,
        fh_out: Option<Arc<FileHandle>>,
        offset_out: u64,
        length: u64,
        flags: u64,
    ) -> Result<ReplyCopyFileRange> {
        Err(NOT_IMPLEMENTED)
    }

    /// find the next data or hole after `offset`. Default: ENOTSUP.
    async fn lseek(
        &self,
        req: &Request,
        fh: Option<Arc<FileHandle>>,
        offset: u64,
        whence: u32,
    ) -> Result<ReplyLSeek> {
        Err(NOT_IMPLEMENTED)
    }

    /// extended attributes for statx(2). Default: ENOSYS, which makes the
    /// kernel synthesize statx from getattr.
    async fn statx(
        &self,
        req: &Request,
        fh: Option<Arc<FileHandle>>,
        flags: u32,
        mask: u32,
    ) -> Result<ReplyStatx> {
        Err(NOT_IMPLEMENTED)
    }

    /// ioctl on an open file. `out_size` bounds the reply data. Default:
    /// ENOTTY.
    #[allow(clippy::too_many_arguments)]
    async fn ioctl(
        &self,
        req: &Request,
        fh: Option<Arc<FileHandle>>,
        flags: u32,
        cmd: u32,
        arg: u64,
        input: &[u8],
        out_size: u32,
    ) -> Result<ReplyIoctl> {
        Err(NOT_IMPLEMENTED)
    }

    /// a descriptor the kernel may read and write directly, bypassing this
    /// process. Consulted once per open when passthrough was negotiated;
    /// return a freshly duplicated descriptor each call.
    fn passthrough_fd(&self) -> Option<OwnedFd> {
        None
    }

    /// called when this node is inserted into the tree.
    fn on_add(&self) {}

    /// called when this node has become unreachable: the kernel forgot it,
    /// its last name was removed, or the session shut down. Never called
    /// with tree locks held, and never called twice.
    fn on_forget(&self) {}
}
