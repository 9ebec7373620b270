//! per-request operation dispatch.
//!
//! A reader hands each decoded request to [`Dispatcher::handle_request`],
//! which resolves the target node, invokes the matching [`NodeOps`] method
//! (or the opcode's documented default when the node left it unimplemented),
//! and serializes exactly one reply. Cancellation is checked when the
//! handler returns: an interrupted request replies EINTR and the handler
//! result is discarded.
//!
//! [`NodeOps`]: crate::node::NodeOps

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::ffi::OsStringExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bincode::Options;
use bytes::Bytes;
use futures_channel::mpsc::UnboundedSender;
use futures_util::SinkExt;
use serde::Serialize;
use tracing::{debug, warn};

use crate::abi::*;
use crate::connection::FuseConnection;
use crate::helper::{get_bincode_config, get_first_null_position, get_padding_size,
    mode_from_kind_and_perm};
use crate::node::{
    DirStream, Entry, FileHandle, HandleEntry, HandleTable, InodeTable, NodeOps, Opened,
    VecDirStream,
};
use crate::reply::{
    DirectoryEntry, FileAttr, ReadResult, ReadResultInner, ReplyAttr, ReplyXAttr, entry_out,
};
use crate::request::{Interrupt, Request};
use crate::{Errno, FileType, Inode, MountOptions, Result, SetAttr};

/// one message for the session writer: either a fully serialized reply, or
/// a header plus an fd-identified payload the writer will splice.
pub(crate) enum ReplyMessage {
    Data(Vec<u8>),
    FdData {
        header: Vec<u8>,
        fd: Arc<OwnedFd>,
        offset: u64,
        size: u32,
    },
}

/// Per-mount dispatch state shared by the readers, the handlers and the
/// writer.
pub(crate) struct Dispatcher {
    pub tree: InodeTable,
    pub handles: HandleTable,
    pub connection: Arc<FuseConnection>,
    pub sender: UnboundedSender<ReplyMessage>,
    /// unique id → cancellation token of every request being handled
    pub in_flight: Mutex<HashMap<u64, Interrupt>>,
    pub initialized: AtomicBool,
    pub proto_minor: AtomicU32,
    pub max_write: AtomicU32,
    pub splice_read_replies: AtomicBool,
    pub passthrough: AtomicBool,
    pub mount_options: MountOptions,
}

impl Dispatcher {
    pub fn new(
        root: Arc<dyn NodeOps>,
        connection: Arc<FuseConnection>,
        sender: UnboundedSender<ReplyMessage>,
        mount_options: MountOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            tree: InodeTable::new(root),
            handles: HandleTable::new(),
            connection,
            sender,
            in_flight: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            proto_minor: AtomicU32::new(0),
            max_write: AtomicU32::new(MAX_WRITE_SIZE as u32),
            splice_read_replies: AtomicBool::new(false),
            passthrough: AtomicBool::new(false),
            mount_options,
        })
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// FORGET and BATCH_FORGET never reply and never fail the session;
    /// unknown node ids are silently ignored.
    pub fn forget(&self, inode: Inode, nlookup: u64) {
        debug!("forget inode {} nlookup {}", inode, nlookup);

        fire_on_forget(self.tree.forget(inode, nlookup));
    }

    /// route an INTERRUPT to its target request; a no-op when the target
    /// already completed.
    pub fn interrupt(&self, unique: u64) {
        let target = self.in_flight.lock().unwrap().get(&unique).cloned();

        match target {
            None => debug!("interrupt for unknown request unique {}", unique),
            Some(interrupt) => {
                debug!("interrupt request unique {}", unique);

                interrupt.interrupt();
            }
        }
    }

    /// handle one request and emit its reply. Runs as its own task.
    pub async fn handle_request(
        self: Arc<Self>,
        request: Request,
        in_header: fuse_in_header,
        opcode: fuse_opcode,
        data: Bytes,
    ) {
        let result = self
            .process(&request, in_header.nodeid, opcode, &data)
            .await;

        // a cancelled request replies EINTR no matter what the handler said
        let result = if request.interrupt.is_interrupted() {
            Err(Errno::new_interrupted())
        } else {
            result
        };

        self.in_flight.lock().unwrap().remove(&request.unique);

        let message = match result {
            Err(errno) => ReplyMessage::Data(reply_error(request.unique, errno)),
            Ok(message) => message,
        };

        let mut sender = self.sender.clone();
        let _ = sender.send(message).await;
    }

    async fn process(
        &self,
        request: &Request,
        nodeid: u64,
        opcode: fuse_opcode,
        data: &[u8],
    ) -> Result<ReplyMessage> {
        match opcode {
            fuse_opcode::FUSE_LOOKUP => self.do_lookup(request, nodeid, data).await,
            fuse_opcode::FUSE_GETATTR => self.do_getattr(request, nodeid, data).await,
            fuse_opcode::FUSE_SETATTR => self.do_setattr(request, nodeid, data).await,
            fuse_opcode::FUSE_READLINK => self.do_readlink(request, nodeid).await,
            fuse_opcode::FUSE_SYMLINK => self.do_symlink(request, nodeid, data).await,
            fuse_opcode::FUSE_MKNOD => self.do_mknod(request, nodeid, data).await,
            fuse_opcode::FUSE_MKDIR => self.do_mkdir(request, nodeid, data).await,
            fuse_opcode::FUSE_UNLINK => self.do_unlink(request, nodeid, data).await,
            fuse_opcode::FUSE_RMDIR => self.do_rmdir(request, nodeid, data).await,
            fuse_opcode::FUSE_RENAME => self.do_rename(request, nodeid, data).await,
            fuse_opcode::FUSE_RENAME2 => self.do_rename2(request, nodeid, data).await,
            fuse_opcode::FUSE_LINK => self.do_link(request, nodeid, data).await,
            fuse_opcode::FUSE_OPEN => self.do_open(request, nodeid, data).await,
            fuse_opcode::FUSE_READ => self.do_read(request, nodeid, data).await,
            fuse_opcode::FUSE_WRITE => self.do_write(request, nodeid, data).await,
            fuse_opcode::FUSE_STATFS => self.do_statfs(request, nodeid).await,
            fuse_opcode::FUSE_RELEASE => self.do_release(request, nodeid, data).await,
            fuse_opcode::FUSE_FSYNC => self.do_fsync(request, nodeid, data).await,
            fuse_opcode::FUSE_SETXATTR => self.do_setxattr(request, nodeid, data).await,
            fuse_opcode::FUSE_GETXATTR => self.do_getxattr(request, nodeid, data).await,
            fuse_opcode::FUSE_LISTXATTR => self.do_listxattr(request, nodeid, data).await,
            fuse_opcode::FUSE_REMOVEXATTR => self.do_removexattr(request, nodeid, data).await,
            fuse_opcode::FUSE_FLUSH => self.do_flush(request, nodeid, data).await,
            fuse_opcode::FUSE_OPENDIR => self.do_opendir(request, nodeid, data).await,
            fuse_opcode::FUSE_READDIR => self.do_readdir(request, nodeid, data).await,
            fuse_opcode::FUSE_RELEASEDIR => self.do_releasedir(request, nodeid, data).await,
            fuse_opcode::FUSE_FSYNCDIR => self.do_fsyncdir(request, nodeid, data).await,
            fuse_opcode::FUSE_GETLK => self.do_getlk(request, nodeid, data).await,
            fuse_opcode::FUSE_SETLK | fuse_opcode::FUSE_SETLKW => {
                self.do_setlk(request, nodeid, data, opcode == fuse_opcode::FUSE_SETLKW)
                    .await
            }
            fuse_opcode::FUSE_ACCESS => self.do_access(request, nodeid, data).await,
            fuse_opcode::FUSE_CREATE => self.do_create(request, nodeid, data).await,
            fuse_opcode::FUSE_FALLOCATE => self.do_fallocate(request, nodeid, data).await,
            fuse_opcode::FUSE_LSEEK => self.do_lseek(request, nodeid, data).await,
            fuse_opcode::FUSE_COPY_FILE_RANGE => {
                self.do_copy_file_range(request, nodeid, data).await
            }
            fuse_opcode::FUSE_IOCTL => self.do_ioctl(request, nodeid, data).await,
            fuse_opcode::FUSE_STATX => self.do_statx(request, nodeid, data).await,

            // replying ENOSYS here before anything could epoll a file on
            // this mount is what prevents a self-poll deadlock
            fuse_opcode::FUSE_POLL => Err(Errno(libc::ENOSYS)),

            // not negotiated, the kernel falls back to plain READDIR
            fuse_opcode::FUSE_READDIRPLUS => Err(Errno(libc::ENOSYS)),

            fuse_opcode::FUSE_BMAP | fuse_opcode::FUSE_NOTIFY_REPLY => Err(Errno(libc::ENOSYS)),

            // INIT / DESTROY / FORGET / BATCH_FORGET / INTERRUPT are
            // consumed by the session reader before dispatch
            fuse_opcode::FUSE_INIT
            | fuse_opcode::FUSE_DESTROY
            | fuse_opcode::FUSE_FORGET
            | fuse_opcode::FUSE_BATCH_FORGET
            | fuse_opcode::FUSE_INTERRUPT => Err(Errno(libc::EIO)),
        }
    }

    fn ops(&self, nodeid: u64) -> Result<Arc<dyn NodeOps>> {
        self.tree.get_ops(nodeid).ok_or_else(Errno::new_not_exist)
    }

    fn handle(&self, fh: u64) -> Option<HandleEntry> {
        self.handles.get(fh)
    }

    fn file_handle(&self, fh: u64) -> Option<Arc<FileHandle>> {
        self.handles.get(fh).map(|entry| entry.handle)
    }

    /// the documented default attributes: synthesized from the stable
    /// identity, permissions widened from zero.
    fn default_attr(&self, nodeid: u64) -> Result<ReplyAttr> {
        let stable = self.tree.stable(nodeid).ok_or_else(Errno::new_not_exist)?;

        let mut attr = FileAttr::new(stable.kind);
        attr.ino = stable.ino;

        Ok(ReplyAttr {
            ttl: Duration::from_secs(1),
            attr,
        })
    }

    /// widen missing fields the kernel requires: node id and non-null
    /// permissions.
    fn finalize_attr(&self, nodeid: u64, attr: &mut FileAttr) {
        if attr.ino == 0 {
            attr.ino = nodeid;
        }

        if attr.perm == 0 {
            attr.perm = if attr.kind == FileType::Directory {
                0o755
            } else {
                0o644
            };
        }
    }

    /// insert the outcome of an entry-producing operation into the tree and
    /// serialize the fuse_entry_out reply.
    fn insert_entry(&self, unique: u64, parent: u64, name: &OsStr, entry: Entry) -> Result<Vec<u8>> {
        let Entry {
            ops,
            mut attr,
            generation,
            ttl,
        } = entry;

        let outcome = self.tree.lookup_or_create(
            parent,
            name,
            ops.clone(),
            attr.kind,
            attr.ino,
            generation,
        )?;
        fire_on_forget(outcome.forgotten);

        if outcome.is_new {
            ops.on_add();
        }

        attr.ino = outcome.stable.ino;
        self.finalize_attr(outcome.stable.ino, &mut attr);

        Ok(reply_struct(
            unique,
            FUSE_ENTRY_OUT_SIZE,
            &entry_out(outcome.stable.ino, outcome.stable.generation, ttl, attr),
        ))
    }

    async fn do_lookup(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let name = parse_name(data)?;
        let ops = self.ops(nodeid)?;

        debug!("lookup unique {} parent {} name {:?}", request.unique, nodeid, name);

        match ops.lookup(request, &name).await {
            Ok(entry) => Ok(ReplyMessage::Data(self.insert_entry(
                request.unique,
                nodeid,
                &name,
                entry,
            )?)),

            Err(errno) if errno.is_not_implemented() => {
                // default: resolve against the children already in the tree
                let (stable, child_ops) = self.tree.lookup_child(nodeid, &name)?;

                let mut attr = match child_ops.getattr(request, None).await {
                    Err(errno) if errno.is_not_implemented() => {
                        self.default_attr(stable.ino)?
                    }
                    result => result?,
                };
                attr.attr.ino = stable.ino;
                self.finalize_attr(stable.ino, &mut attr.attr);

                Ok(ReplyMessage::Data(reply_struct(
                    request.unique,
                    FUSE_ENTRY_OUT_SIZE,
                    &entry_out(stable.ino, stable.generation, attr.ttl, attr.attr),
                )))
            }

            Err(errno) => Err(errno),
        }
    }

    async fn do_getattr(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let getattr_in = parse_struct::<fuse_getattr_in>(data)?;
        let ops = self.ops(nodeid)?;

        let fh = if getattr_in.getattr_flags & FUSE_GETATTR_FH > 0 {
            self.file_handle(getattr_in.fh)
        } else {
            None
        };

        let mut attr = match ops.getattr(request, fh).await {
            Err(errno) if errno.is_not_implemented() => self.default_attr(nodeid)?,
            result => result?,
        };
        self.finalize_attr(nodeid, &mut attr.attr);

        Ok(ReplyMessage::Data(reply_struct(
            request.unique,
            FUSE_ATTR_OUT_SIZE,
            &fuse_attr_out::from(attr),
        )))
    }

    async fn do_setattr(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let setattr_in = parse_struct::<fuse_setattr_in>(data)?;
        let ops = self.ops(nodeid)?;

        let fh = if setattr_in.valid & FATTR_FH > 0 {
            self.file_handle(setattr_in.fh)
        } else {
            None
        };

        let set_attr = SetAttr::from(&setattr_in);

        debug!(
            "setattr unique {} inode {} set_attr {:?}",
            request.unique, nodeid, set_attr
        );

        let mut attr = match ops.setattr(request, fh, set_attr).await {
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENOTSUP)),
            result => result?,
        };
        self.finalize_attr(nodeid, &mut attr.attr);

        Ok(ReplyMessage::Data(reply_struct(
            request.unique,
            FUSE_ATTR_OUT_SIZE,
            &fuse_attr_out::from(attr),
        )))
    }

    async fn do_readlink(&self, request: &Request, nodeid: u64) -> Result<ReplyMessage> {
        let ops = self.ops(nodeid)?;

        let target = match ops.readlink(request).await {
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::EINVAL)),
            result => result?,
        };

        Ok(ReplyMessage::Data(reply_data(request.unique, &target)))
    }

    async fn do_symlink(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let (name, rest) = parse_name_and_rest(data)?;
        let link = parse_name(rest)?;
        let ops = self.ops(nodeid)?;

        let entry = match ops.symlink(request, &name, &link).await {
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENOTSUP)),
            result => result?,
        };

        Ok(ReplyMessage::Data(self.insert_entry(
            request.unique,
            nodeid,
            &name,
            entry,
        )?))
    }

    async fn do_mknod(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let mknod_in = parse_struct::<fuse_mknod_in>(data)?;
        let name = parse_name(&data[FUSE_MKNOD_IN_SIZE..])?;
        let ops = self.ops(nodeid)?;

        let entry = match ops.mknod(request, &name, mknod_in.mode, mknod_in.rdev).await {
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENOTSUP)),
            result => result?,
        };

        Ok(ReplyMessage::Data(self.insert_entry(
            request.unique,
            nodeid,
            &name,
            entry,
        )?))
    }

    async fn do_mkdir(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let mkdir_in = parse_struct::<fuse_mkdir_in>(data)?;
        let name = parse_name(&data[FUSE_MKDIR_IN_SIZE..])?;
        let ops = self.ops(nodeid)?;

        debug!(
            "mkdir unique {} parent {} name {:?} mode {:o}",
            request.unique, nodeid, name, mkdir_in.mode
        );

        let entry = match ops.mkdir(request, &name, mkdir_in.mode, mkdir_in.umask).await {
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENOTSUP)),
            result => result?,
        };

        Ok(ReplyMessage::Data(self.insert_entry(
            request.unique,
            nodeid,
            &name,
            entry,
        )?))
    }

    async fn do_unlink(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let name = parse_name(data)?;
        let ops = self.ops(nodeid)?;

        match ops.unlink(request, &name).await {
            Ok(()) => {}
            Err(errno) if errno.is_not_implemented() => {}
            Err(errno) => return Err(errno),
        }

        // a hard-linked child survives through its remaining names
        if let Ok(forgotten) = self.tree.rm_child(nodeid, &name) {
            fire_on_forget(forgotten);
        }

        Ok(ReplyMessage::Data(reply_empty(request.unique)))
    }

    async fn do_rmdir(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let name = parse_name(data)?;
        let ops = self.ops(nodeid)?;

        match ops.rmdir(request, &name).await {
            Ok(()) => {}
            Err(errno) if errno.is_not_implemented() => {}
            Err(errno) => return Err(errno),
        }

        if let Ok(forgotten) = self.tree.rm_child(nodeid, &name) {
            fire_on_forget(forgotten);
        }

        Ok(ReplyMessage::Data(reply_empty(request.unique)))
    }

    async fn do_rename(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let rename_in = parse_struct::<fuse_rename_in>(data)?;
        let (name, rest) = parse_name_and_rest(&data[FUSE_RENAME_IN_SIZE..])?;
        let new_name = parse_name(rest)?;

        self.rename_common(request, nodeid, &name, rename_in.newdir, &new_name, 0)
            .await
    }

    async fn do_rename2(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let rename2_in = parse_struct::<fuse_rename2_in>(data)?;
        let (name, rest) = parse_name_and_rest(&data[FUSE_RENAME2_IN_SIZE..])?;
        let new_name = parse_name(rest)?;

        if rename2_in.flags & RENAME_EXCHANGE > 0 && rename2_in.flags & RENAME_NOREPLACE > 0 {
            return Err(Errno(libc::EINVAL));
        }

        self.rename_common(
            request,
            nodeid,
            &name,
            rename2_in.newdir,
            &new_name,
            rename2_in.flags,
        )
        .await
    }

    async fn rename_common(
        &self,
        request: &Request,
        parent: u64,
        name: &OsStr,
        new_dir: u64,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<ReplyMessage> {
        let ops = self.ops(parent)?;
        let new_parent_ops = self.ops(new_dir)?;

        debug!(
            "rename unique {} parent {} name {:?} new parent {} new name {:?} flags {}",
            request.unique, parent, name, new_dir, new_name, flags
        );

        match ops.rename(request, name, new_parent_ops, new_name, flags).await {
            Ok(()) => {}
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENOTSUP)),
            Err(errno) => return Err(errno),
        }

        let exchange = flags & RENAME_EXCHANGE > 0;
        let overwrite = flags & RENAME_NOREPLACE == 0;

        // the moved edge may never have been looked up; the namespace in
        // the tree is a cache, so a missing edge is not an error here
        match self
            .tree
            .mv_child(parent, name, new_dir, new_name, exchange, overwrite)
        {
            Ok(forgotten) => fire_on_forget(forgotten),
            Err(errno) if errno.is_not_exist() => {}
            Err(errno) => return Err(errno),
        }

        Ok(ReplyMessage::Data(reply_empty(request.unique)))
    }

    async fn do_link(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let link_in = parse_struct::<fuse_link_in>(data)?;
        let name = parse_name(&data[FUSE_LINK_IN_SIZE..])?;

        let ops = self.ops(nodeid)?;
        let target = self.ops(link_in.oldnodeid)?;
        let stable = self
            .tree
            .stable(link_in.oldnodeid)
            .ok_or_else(Errno::new_not_exist)?;

        if stable.kind == FileType::Directory {
            return Err(Errno(libc::EPERM));
        }

        let attr = match ops.link(request, target.clone(), &name).await {
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENOTSUP)),
            result => result?,
        };

        let entry = Entry {
            ops: target,
            attr: FileAttr {
                ino: stable.ino,
                ..attr.attr
            },
            generation: stable.generation,
            ttl: attr.ttl,
        };

        Ok(ReplyMessage::Data(self.insert_entry(
            request.unique,
            nodeid,
            &name,
            entry,
        )?))
    }

    async fn do_open(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let open_in = parse_struct::<fuse_open_in>(data)?;
        let ops = self.ops(nodeid)?;

        debug!(
            "open unique {} inode {} flags {}",
            request.unique, nodeid, open_in.flags
        );

        let opened = match ops.open(request, open_in.flags).await {
            Err(errno) if errno.is_not_implemented() => Opened::default(),
            result => result?,
        };

        let open_out = self.register_open(nodeid, opened, ops.as_ref(), true);

        Ok(ReplyMessage::Data(reply_struct(
            request.unique,
            FUSE_OPEN_OUT_SIZE,
            &open_out,
        )))
    }

    /// mint the handle id, registering a passthrough backing file when the
    /// node provides one and the kernel negotiated it.
    fn register_open(
        &self,
        nodeid: u64,
        opened: Opened,
        ops: &dyn NodeOps,
        passthrough_capable: bool,
    ) -> fuse_open_out {
        let mut handle = opened.handle;
        let mut open_flags = opened.flags;
        let mut backing_id = None;

        if passthrough_capable && self.passthrough.load(Ordering::Relaxed) {
            if let Some(fd) = ops.passthrough_fd() {
                match self.connection.backing_open(fd.as_raw_fd()) {
                    Ok(id) => {
                        backing_id = Some(id);
                        open_flags |= FOPEN_PASSTHROUGH;
                        handle = handle.fd(fd);
                    }

                    Err(err) => {
                        warn!("register passthrough backing failed {}", err);
                    }
                }
            } else if open_flags & FOPEN_PASSTHROUGH > 0 {
                if let Some(fd) = handle.raw_fd() {
                    match self.connection.backing_open(fd) {
                        Ok(id) => backing_id = Some(id),
                        Err(err) => {
                            warn!("register passthrough backing failed {}", err);
                        }
                    }
                }
            }
        }

        if backing_id.is_none() {
            open_flags &= !FOPEN_PASSTHROUGH;
        }

        let fh = self.handles.insert(nodeid, handle, backing_id);

        fuse_open_out {
            fh,
            open_flags,
            backing_id: backing_id.unwrap_or(0),
        }
    }

    async fn do_read(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let read_in = parse_struct::<fuse_read_in>(data)?;
        let ops = self.ops(nodeid)?;
        let handle = self.file_handle(read_in.fh);

        debug!(
            "read unique {} inode {} fh {} offset {} size {}",
            request.unique, nodeid, read_in.fh, read_in.offset, read_in.size
        );

        let result = match ops
            .read(request, handle.clone(), read_in.offset, read_in.size)
            .await
        {
            Err(errno) if errno.is_not_implemented() => {
                // default: serve from the handle's backing descriptor
                let fd = handle
                    .as_ref()
                    .and_then(|handle| handle.get_fd())
                    .ok_or(Errno(libc::ENOTSUP))?;

                ReadResult::fd(fd.clone(), read_in.offset, read_in.size)
            }
            result => result?,
        };

        match result.0 {
            ReadResultInner::Data(mut bytes) => {
                // never send more than the kernel asked for
                bytes.truncate(read_in.size as usize);

                Ok(ReplyMessage::Data(reply_data(request.unique, &bytes)))
            }

            ReadResultInner::Fd { fd, offset, size } => Ok(ReplyMessage::FdData {
                header: data_header(request.unique, 0),
                fd,
                offset,
                size: size.min(read_in.size),
            }),
        }
    }

    async fn do_write(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let write_in = parse_struct::<fuse_write_in>(data)?;
        let payload = &data[FUSE_WRITE_IN_SIZE..];

        if write_in.size as usize != payload.len() {
            warn!("write unique {} body len is invalid", request.unique);

            return Err(Errno(libc::EINVAL));
        }

        let ops = self.ops(nodeid)?;
        let handle = self.file_handle(write_in.fh);

        let written = match ops
            .write(
                request,
                handle,
                write_in.offset,
                payload,
                write_in.write_flags,
            )
            .await
        {
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENOTSUP)),
            result => result?,
        };

        Ok(ReplyMessage::Data(reply_struct(
            request.unique,
            FUSE_WRITE_OUT_SIZE,
            &fuse_write_out::from(written),
        )))
    }

    async fn do_statfs(&self, request: &Request, nodeid: u64) -> Result<ReplyMessage> {
        let ops = self.ops(nodeid)?;

        let stat = match ops.statfs(request).await {
            // default: zeroed statistics, which OSX-style userspace relies on
            Err(errno) if errno.is_not_implemented() => Default::default(),
            result => result?,
        };

        Ok(ReplyMessage::Data(reply_struct(
            request.unique,
            FUSE_STATFS_OUT_SIZE,
            &fuse_statfs_out::from(stat),
        )))
    }

    async fn do_release(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let release_in = parse_struct::<fuse_release_in>(data)?;
        let ops = self.ops(nodeid)?;
        let entry = self.handle(release_in.fh);

        let flush = release_in.release_flags & FUSE_RELEASE_FLUSH > 0;

        match ops
            .release(
                request,
                entry.as_ref().map(|entry| entry.handle.clone()),
                release_in.flags,
                flush,
            )
            .await
        {
            Ok(()) => {}
            Err(errno) if errno.is_not_implemented() => {}
            Err(errno) => return Err(errno),
        }

        if let Some(entry) = self.handles.remove(release_in.fh) {
            if let Some(backing_id) = entry.backing_id {
                self.connection.backing_close(backing_id);
            }
        }

        Ok(ReplyMessage::Data(reply_empty(request.unique)))
    }

    async fn do_fsync(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let fsync_in = parse_struct::<fuse_fsync_in>(data)?;
        let ops = self.ops(nodeid)?;
        let handle = self.file_handle(fsync_in.fh);

        let datasync = fsync_in.fsync_flags & 1 > 0;

        match ops.fsync(request, handle, datasync).await {
            Ok(()) => {}
            Err(errno) if errno.is_not_implemented() => {}
            Err(errno) => return Err(errno),
        }

        Ok(ReplyMessage::Data(reply_empty(request.unique)))
    }

    async fn do_setxattr(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let setxattr_in = parse_struct::<fuse_setxattr_in>(data)?;
        let rest = &data[FUSE_SETXATTR_IN_SIZE..];
        let (name, rest) = parse_name_and_rest(rest)?;

        if rest.len() < setxattr_in.size as usize {
            return Err(Errno(libc::EINVAL));
        }
        let value = &rest[..setxattr_in.size as usize];

        let ops = self.ops(nodeid)?;

        match ops
            .setxattr(request, &name, value, setxattr_in.flags)
            .await
        {
            Ok(()) => {}
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENODATA)),
            Err(errno) => return Err(errno),
        }

        Ok(ReplyMessage::Data(reply_empty(request.unique)))
    }

    async fn do_getxattr(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let getxattr_in = parse_struct::<fuse_getxattr_in>(data)?;
        let name = parse_name(&data[std::mem::size_of::<fuse_getxattr_in>()..])?;
        let ops = self.ops(nodeid)?;

        let reply = match ops.getxattr(request, &name, getxattr_in.size).await {
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENODATA)),
            result => result?,
        };

        self.xattr_reply(request.unique, getxattr_in.size, reply)
    }

    async fn do_listxattr(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let getxattr_in = parse_struct::<fuse_getxattr_in>(data)?;
        let ops = self.ops(nodeid)?;

        let reply = match ops.listxattr(request, getxattr_in.size).await {
            // default: no extended attributes at all
            Err(errno) if errno.is_not_implemented() => {
                if getxattr_in.size == 0 {
                    ReplyXAttr::Size(0)
                } else {
                    ReplyXAttr::Data(Bytes::new())
                }
            }
            result => result?,
        };

        self.xattr_reply(request.unique, getxattr_in.size, reply)
    }

    fn xattr_reply(&self, unique: u64, size: u32, reply: ReplyXAttr) -> Result<ReplyMessage> {
        match reply {
            ReplyXAttr::Size(attr_size) => Ok(ReplyMessage::Data(reply_struct(
                unique,
                FUSE_GETXATTR_OUT_SIZE,
                &fuse_getxattr_out {
                    size: attr_size,
                    _padding: 0,
                },
            ))),

            ReplyXAttr::Data(bytes) => {
                if bytes.len() > size as usize {
                    Err(Errno(libc::ERANGE))
                } else {
                    Ok(ReplyMessage::Data(reply_data(unique, &bytes)))
                }
            }
        }
    }

    async fn do_removexattr(
        &self,
        request: &Request,
        nodeid: u64,
        data: &[u8],
    ) -> Result<ReplyMessage> {
        let name = parse_name(data)?;
        let ops = self.ops(nodeid)?;

        match ops.removexattr(request, &name).await {
            Ok(()) => {}
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENODATA)),
            Err(errno) => return Err(errno),
        }

        Ok(ReplyMessage::Data(reply_empty(request.unique)))
    }

    async fn do_flush(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let flush_in = parse_struct::<fuse_flush_in>(data)?;
        let ops = self.ops(nodeid)?;
        let handle = self.file_handle(flush_in.fh);

        match ops.flush(request, handle, flush_in.lock_owner).await {
            Ok(()) => {}
            Err(errno) if errno.is_not_implemented() => {}
            Err(errno) => return Err(errno),
        }

        Ok(ReplyMessage::Data(reply_empty(request.unique)))
    }

    async fn do_opendir(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let open_in = parse_struct::<fuse_open_in>(data)?;
        let ops = self.ops(nodeid)?;

        let opened = match ops.opendir(request, open_in.flags).await {
            Err(errno) if errno.is_not_implemented() => Opened::default(),
            result => result?,
        };

        let open_out = self.register_open(nodeid, opened, ops.as_ref(), false);

        Ok(ReplyMessage::Data(reply_struct(
            request.unique,
            FUSE_OPEN_OUT_SIZE,
            &open_out,
        )))
    }

    async fn do_readdir(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let read_in = parse_struct::<fuse_read_in>(data)?;
        let ops = self.ops(nodeid)?;

        let entry = self.handle(read_in.fh).ok_or(Errno(libc::EBADF))?;

        debug!(
            "readdir unique {} inode {} fh {} offset {}",
            request.unique, nodeid, read_in.fh, read_in.offset
        );

        let rewind = {
            let cursor = entry.dir_cursor.lock().unwrap();
            cursor.stream.is_none() || cursor.offset != read_in.offset
        };

        if rewind {
            let mut stream: Box<dyn DirStream> = match ops.readdir(request).await {
                Err(errno) if errno.is_not_implemented() => {
                    // default: the children currently in the tree
                    let entries = self
                        .tree
                        .dir_entries(nodeid)?
                        .into_iter()
                        .map(|(name, inode, kind)| DirectoryEntry { inode, kind, name })
                        .collect();

                    Box::new(VecDirStream::new(entries))
                }
                result => result?,
            };

            // the kernel resumes mid-stream by offset; skip what it has seen
            let mut skipped = 0;
            while skipped < read_in.offset && stream.has_next() {
                stream.next_entry()?;
                skipped += 1;
            }

            let mut cursor = entry.dir_cursor.lock().unwrap();
            if let Some(old) = cursor.stream.as_mut() {
                old.close();
            }
            cursor.offset = skipped;
            cursor.stream = Some(stream);
        }

        let (stream, mut offset) = {
            let mut cursor = entry.dir_cursor.lock().unwrap();

            (cursor.stream.take(), cursor.offset)
        };

        // a concurrent READDIR on the same handle may have taken the
        // stream; it will put it back, we answer end-of-directory
        let mut stream: Box<dyn DirStream> = match stream {
            None => Box::new(VecDirStream::new(Vec::new())),
            Some(stream) => stream,
        };

        let max_size = read_in.size as usize;
        let mut entry_data = Vec::with_capacity(max_size.min(4096));

        while stream.has_next() {
            // the cursor contract has no peek, so measure after the fact
            let dir_entry = stream.next_entry()?;
            let name = dir_entry.name.as_os_str();

            let dir_entry_size = FUSE_DIRENT_SIZE + name.len();
            let padding_size = get_padding_size(dir_entry_size);

            if entry_data.len() + dir_entry_size + padding_size > max_size {
                // keep it for the next READDIR round
                stream = Box::new(PushedBackStream {
                    head: Some(dir_entry),
                    rest: stream,
                });

                break;
            }

            offset += 1;

            let dirent = fuse_dirent {
                ino: dir_entry.inode,
                off: offset,
                namelen: name.len() as u32,
                r#type: mode_from_kind_and_perm(dir_entry.kind, 0) >> 12,
            };

            get_bincode_config()
                .serialize_into(&mut entry_data, &dirent)
                .expect("won't happened");

            entry_data.extend_from_slice(name.as_bytes());
            entry_data.resize(entry_data.len() + padding_size, 0);
        }

        let mut cursor = entry.dir_cursor.lock().unwrap();
        cursor.stream = Some(stream);
        cursor.offset = offset;

        Ok(ReplyMessage::Data(reply_data(request.unique, &entry_data)))
    }

    async fn do_releasedir(
        &self,
        request: &Request,
        nodeid: u64,
        data: &[u8],
    ) -> Result<ReplyMessage> {
        let release_in = parse_struct::<fuse_release_in>(data)?;
        let ops = self.ops(nodeid)?;
        let entry = self.handle(release_in.fh);

        match ops
            .releasedir(
                request,
                entry.as_ref().map(|entry| entry.handle.clone()),
                release_in.flags,
            )
            .await
        {
            Ok(()) => {}
            Err(errno) if errno.is_not_implemented() => {}
            Err(errno) => return Err(errno),
        }

        if let Some(entry) = self.handles.remove(release_in.fh) {
            let mut cursor = entry.dir_cursor.lock().unwrap();
            if let Some(stream) = cursor.stream.as_mut() {
                stream.close();
            }
        }

        Ok(ReplyMessage::Data(reply_empty(request.unique)))
    }

    async fn do_fsyncdir(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let fsync_in = parse_struct::<fuse_fsync_in>(data)?;
        let ops = self.ops(nodeid)?;
        let handle = self.file_handle(fsync_in.fh);

        let datasync = fsync_in.fsync_flags & 1 > 0;

        match ops.fsyncdir(request, handle, datasync).await {
            Ok(()) => {}
            Err(errno) if errno.is_not_implemented() => {}
            Err(errno) => return Err(errno),
        }

        Ok(ReplyMessage::Data(reply_empty(request.unique)))
    }

    async fn do_getlk(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let lk_in = parse_struct::<fuse_lk_in>(data)?;
        let ops = self.ops(nodeid)?;
        let handle = self.file_handle(lk_in.fh);

        let lock = match ops
            .getlk(
                request,
                handle,
                lk_in.owner,
                lk_in.lk.start,
                lk_in.lk.end,
                lk_in.lk.r#type,
                lk_in.lk.pid,
            )
            .await
        {
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENOTSUP)),
            result => result?,
        };

        Ok(ReplyMessage::Data(reply_struct(
            request.unique,
            FUSE_LK_OUT_SIZE,
            &fuse_lk_out::from(lock),
        )))
    }

    async fn do_setlk(
        &self,
        request: &Request,
        nodeid: u64,
        data: &[u8],
        block: bool,
    ) -> Result<ReplyMessage> {
        let lk_in = parse_struct::<fuse_lk_in>(data)?;
        let ops = self.ops(nodeid)?;
        let handle = self.file_handle(lk_in.fh);

        match ops
            .setlk(
                request,
                handle,
                lk_in.owner,
                lk_in.lk.start,
                lk_in.lk.end,
                lk_in.lk.r#type,
                lk_in.lk.pid,
                block,
            )
            .await
        {
            Ok(()) => {}
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENOTSUP)),
            Err(errno) => return Err(errno),
        }

        Ok(ReplyMessage::Data(reply_empty(request.unique)))
    }

    async fn do_access(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let access_in = parse_struct::<fuse_access_in>(data)?;
        let ops = self.ops(nodeid)?;

        // an ENOSYS reply makes the kernel do its own checks and stop
        // sending ACCESS entirely
        ops.access(request, access_in.mask).await?;

        Ok(ReplyMessage::Data(reply_empty(request.unique)))
    }

    async fn do_create(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let create_in = parse_struct::<fuse_create_in>(data)?;
        let name = parse_name(&data[FUSE_CREATE_IN_SIZE..])?;
        let ops = self.ops(nodeid)?;

        debug!(
            "create unique {} parent {} name {:?} mode {:o}",
            request.unique, nodeid, name, create_in.mode
        );

        let (entry, opened) = match ops
            .create(request, &name, create_in.flags, create_in.mode)
            .await
        {
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::EROFS)),
            result => result?,
        };

        let child_ops = entry.ops.clone();
        let entry_data = self.insert_entry(request.unique, nodeid, &name, entry)?;
        let open_out = self.register_open(nodeid, opened, child_ops.as_ref(), true);

        // CREATE replies with an entry_out immediately followed by an
        // open_out under one header
        let mut data = Vec::with_capacity(entry_data.len() + FUSE_OPEN_OUT_SIZE);
        data.extend_from_slice(&entry_data);
        get_bincode_config()
            .serialize_into(&mut data, &open_out)
            .expect("won't happened");

        let total = data.len() as u32;
        data[..4].copy_from_slice(&total.to_ne_bytes());

        Ok(ReplyMessage::Data(data))
    }

    async fn do_fallocate(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let fallocate_in = parse_struct::<fuse_fallocate_in>(data)?;
        let ops = self.ops(nodeid)?;
        let handle = self.file_handle(fallocate_in.fh);

        match ops
            .allocate(
                request,
                handle,
                fallocate_in.offset,
                fallocate_in.length,
                fallocate_in.mode,
            )
            .await
        {
            Ok(()) => {}
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENOTSUP)),
            Err(errno) => return Err(errno),
        }

        Ok(ReplyMessage::Data(reply_empty(request.unique)))
    }

    async fn do_lseek(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let lseek_in = parse_struct::<fuse_lseek_in>(data)?;
        let ops = self.ops(nodeid)?;
        let handle = self.file_handle(lseek_in.fh);

        let seek = match ops
            .lseek(request, handle, lseek_in.offset, lseek_in.whence)
            .await
        {
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENOTSUP)),
            result => result?,
        };

        Ok(ReplyMessage::Data(reply_struct(
            request.unique,
            FUSE_LSEEK_OUT_SIZE,
            &fuse_lseek_out::from(seek),
        )))
    }

    async fn do_copy_file_range(
        &self,
        request: &Request,
        nodeid: u64,
        data: &[u8],
    ) -> Result<ReplyMessage> {
        let copy_in = parse_struct::<fuse_copy_file_range_in>(data)?;
        let ops = self.ops(nodeid)?;
        let target = self.ops(copy_in.nodeid_out)?;

        let fh_in = self.file_handle(copy_in.fh_in);
        let fh_out = self.file_handle(copy_in.fh_out);

        let copied = match ops
            .copy_file_range(
                request,
                fh_in,
                copy_in.off_in,
                target,
                fh_out,
                copy_in.off_out,
                copy_in.len,
                copy_in.flags,
            )
            .await
        {
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENOTSUP)),
            result => result?,
        };

        Ok(ReplyMessage::Data(reply_struct(
            request.unique,
            FUSE_WRITE_OUT_SIZE,
            &fuse_write_out::from(copied),
        )))
    }

    async fn do_ioctl(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let ioctl_in = parse_struct::<fuse_ioctl_in>(data)?;
        let rest = &data[FUSE_IOCTL_IN_SIZE..];

        if rest.len() < ioctl_in.in_size as usize {
            return Err(Errno(libc::EINVAL));
        }
        let input = &rest[..ioctl_in.in_size as usize];

        let ops = self.ops(nodeid)?;
        let handle = self.file_handle(ioctl_in.fh);

        let reply = match ops
            .ioctl(
                request,
                handle,
                ioctl_in.flags,
                ioctl_in.cmd,
                ioctl_in.arg,
                input,
                ioctl_in.out_size,
            )
            .await
        {
            Err(errno) if errno.is_not_implemented() => return Err(Errno(libc::ENOTTY)),
            result => result?,
        };

        let mut output = reply.data;
        output.truncate(ioctl_in.out_size as usize);

        let ioctl_out = fuse_ioctl_out {
            result: reply.result,
            flags: 0,
            in_iovs: 0,
            out_iovs: 0,
        };

        let mut data =
            Vec::with_capacity(FUSE_OUT_HEADER_SIZE + FUSE_IOCTL_OUT_SIZE + output.len());
        data.extend_from_slice(&data_header(
            request.unique,
            FUSE_IOCTL_OUT_SIZE + output.len(),
        ));
        get_bincode_config()
            .serialize_into(&mut data, &ioctl_out)
            .expect("won't happened");
        data.extend_from_slice(&output);

        Ok(ReplyMessage::Data(data))
    }

    async fn do_statx(&self, request: &Request, nodeid: u64, data: &[u8]) -> Result<ReplyMessage> {
        let statx_in = parse_struct::<fuse_statx_in>(data)?;
        let ops = self.ops(nodeid)?;

        let fh = if statx_in.getattr_flags & FUSE_GETATTR_FH > 0 {
            self.file_handle(statx_in.fh)
        } else {
            None
        };

        let mut statx = ops
            .statx(request, fh, statx_in.sx_flags, statx_in.sx_mask)
            .await?;
        self.finalize_attr(nodeid, &mut statx.attr);

        let ttl = statx.ttl;
        let statx_out = fuse_statx_out {
            attr_valid: ttl.as_secs(),
            attr_valid_nsec: ttl.subsec_nanos(),
            flags: 0,
            spare: [0; 2],
            stat: statx.into(),
        };

        Ok(ReplyMessage::Data(reply_struct(
            request.unique,
            FUSE_STATX_OUT_SIZE,
            &statx_out,
        )))
    }
}

/// an entry that did not fit the READDIR buffer, pushed back in front of
/// the remaining stream.
struct PushedBackStream {
    head: Option<DirectoryEntry>,
    rest: Box<dyn DirStream>,
}

impl DirStream for PushedBackStream {
    fn has_next(&self) -> bool {
        self.head.is_some() || self.rest.has_next()
    }

    fn next_entry(&mut self) -> Result<DirectoryEntry> {
        match self.head.take() {
            Some(entry) => Ok(entry),
            None => self.rest.next_entry(),
        }
    }

    fn close(&mut self) {
        self.rest.close()
    }
}

pub(crate) fn fire_on_forget(forgotten: Vec<Arc<dyn NodeOps>>) {
    for ops in forgotten {
        ops.on_forget();
    }
}

fn parse_struct<'a, T: serde::Deserialize<'a>>(data: &'a [u8]) -> Result<T> {
    get_bincode_config().deserialize(data).map_err(|err| {
        warn!("deserialize request argument failed {}", err);

        Errno(libc::EINVAL)
    })
}

fn parse_name(data: &[u8]) -> Result<OsString> {
    match get_first_null_position(data) {
        None => Err(Errno(libc::EINVAL)),
        Some(index) => Ok(OsString::from_vec(data[..index].to_vec())),
    }
}

fn parse_name_and_rest(data: &[u8]) -> Result<(OsString, &[u8])> {
    match get_first_null_position(data) {
        None => Err(Errno(libc::EINVAL)),
        Some(index) => Ok((
            OsString::from_vec(data[..index].to_vec()),
            &data[index + 1..],
        )),
    }
}

/// an out header for a reply carrying `payload` raw bytes after it.
pub(crate) fn data_header(unique: u64, payload: usize) -> Vec<u8> {
    let out_header = fuse_out_header {
        len: (FUSE_OUT_HEADER_SIZE + payload) as u32,
        error: 0,
        unique,
    };

    get_bincode_config()
        .serialize(&out_header)
        .expect("won't happened")
}

pub(crate) fn reply_error(unique: u64, errno: Errno) -> Vec<u8> {
    let out_header = fuse_out_header {
        len: FUSE_OUT_HEADER_SIZE as u32,
        error: errno.into(),
        unique,
    };

    get_bincode_config()
        .serialize(&out_header)
        .expect("won't happened")
}

pub(crate) fn reply_empty(unique: u64) -> Vec<u8> {
    data_header(unique, 0)
}

fn reply_struct<T: Serialize>(unique: u64, size: usize, body: &T) -> Vec<u8> {
    let out_header = fuse_out_header {
        len: (FUSE_OUT_HEADER_SIZE + size) as u32,
        error: 0,
        unique,
    };

    let mut data = Vec::with_capacity(FUSE_OUT_HEADER_SIZE + size);

    get_bincode_config()
        .serialize_into(&mut data, &out_header)
        .expect("won't happened");
    get_bincode_config()
        .serialize_into(&mut data, body)
        .expect("won't happened");

    data
}

fn reply_data(unique: u64, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(FUSE_OUT_HEADER_SIZE + payload.len());

    data.extend_from_slice(&data_header(unique, payload.len()));
    data.extend_from_slice(payload);

    data
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write as _;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    use async_notify::Notify as UnmountNotify;
    use async_trait::async_trait;
    use futures_channel::mpsc::{unbounded, UnboundedReceiver};
    use futures_util::StreamExt;
    use tokio::time;

    use super::*;
    use crate::node::ROOT_INODE;
    use crate::reply::ReplyWrite;

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        receiver: UnboundedReceiver<ReplyMessage>,
        unique: AtomicU64,
        _pipe_read: std::os::fd::OwnedFd,
    }

    impl Harness {
        fn new(root: Arc<dyn NodeOps>) -> Self {
            let (pipe_read, pipe_write) = nix::unistd::pipe().unwrap();
            let connection = Arc::new(
                FuseConnection::from_fd(pipe_write, Arc::new(UnmountNotify::new())).unwrap(),
            );

            let (sender, receiver) = unbounded();
            let dispatcher =
                Dispatcher::new(root, connection, sender, crate::MountOptions::default());

            Self {
                dispatcher,
                receiver,
                unique: AtomicU64::new(1),
                _pipe_read: pipe_read,
            }
        }

        fn request(&self) -> (Request, fuse_in_header) {
            let unique = self.unique.fetch_add(1, Ordering::Relaxed);
            let in_header = fuse_in_header {
                len: 0,
                opcode: 0,
                unique,
                nodeid: ROOT_INODE,
                uid: 0,
                gid: 0,
                pid: 0,
                _padding: 0,
            };

            (Request::from(&in_header), in_header)
        }

        async fn run(
            &mut self,
            nodeid: u64,
            opcode: fuse_opcode,
            data: Vec<u8>,
        ) -> ReplyMessage {
            let (request, mut in_header) = self.request();
            in_header.nodeid = nodeid;

            self.dispatcher
                .in_flight
                .lock()
                .unwrap()
                .insert(request.unique, request.interrupt.clone());

            self.dispatcher
                .clone()
                .handle_request(request, in_header, opcode, Bytes::from(data))
                .await;

            self.receiver.next().await.unwrap()
        }
    }

    fn header_of(message: &ReplyMessage) -> fuse_out_header {
        let data = match message {
            ReplyMessage::Data(data) => &data[..FUSE_OUT_HEADER_SIZE],
            ReplyMessage::FdData { header, .. } => &header[..],
        };

        get_bincode_config().deserialize(data).unwrap()
    }

    fn body_of(message: &ReplyMessage) -> &[u8] {
        match message {
            ReplyMessage::Data(data) => &data[FUSE_OUT_HEADER_SIZE..],
            ReplyMessage::FdData { .. } => panic!("fd-backed reply has no inline body"),
        }
    }

    fn name_bytes(name: &str) -> Vec<u8> {
        let mut data = name.as_bytes().to_vec();
        data.push(0);

        data
    }

    struct EmptyDir;

    impl NodeOps for EmptyDir {}

    struct StaticDir;

    #[async_trait]
    impl NodeOps for StaticDir {
        async fn lookup(&self, _req: &Request, name: &OsStr) -> Result<Entry> {
            if name == "hello" {
                Ok(Entry::new(
                    Arc::new(HelloFile),
                    FileAttr::new(FileType::RegularFile),
                ))
            } else {
                Err(Errno::new_not_exist())
            }
        }
    }

    struct HelloFile;

    #[async_trait]
    impl NodeOps for HelloFile {
        async fn read(
            &self,
            _req: &Request,
            _fh: Option<Arc<FileHandle>>,
            offset: u64,
            size: u32,
        ) -> Result<ReadResult> {
            let content = b"hello world";
            let offset = (offset as usize).min(content.len());
            let end = (offset + size as usize).min(content.len());

            Ok(ReadResult::data(content[offset..end].to_vec()))
        }

        async fn write(
            &self,
            _req: &Request,
            _fh: Option<Arc<FileHandle>>,
            _offset: u64,
            data: &[u8],
            _flags: u32,
        ) -> Result<ReplyWrite> {
            Ok(ReplyWrite {
                written: data.len() as u32,
            })
        }
    }

    struct SlowFile;

    #[async_trait]
    impl NodeOps for SlowFile {
        async fn read(
            &self,
            req: &Request,
            _fh: Option<Arc<FileHandle>>,
            _offset: u64,
            _size: u32,
        ) -> Result<ReadResult> {
            // an interruptible handler waits on the request token
            req.interrupt.interrupted().await;

            Err(Errno::new_interrupted())
        }
    }

    struct FdBackedDir {
        file: std::sync::Mutex<Option<File>>,
    }

    #[async_trait]
    impl NodeOps for FdBackedDir {
        async fn open(&self, _req: &Request, _flags: u32) -> Result<Opened> {
            let file = self.file.lock().unwrap().take().unwrap();

            Ok(Opened::new(FileHandle::new().fd(file.into())))
        }
    }

    struct CreateDir;

    #[async_trait]
    impl NodeOps for CreateDir {
        async fn create(
            &self,
            _req: &Request,
            _name: &OsStr,
            _flags: u32,
            _mode: u32,
        ) -> Result<(Entry, Opened)> {
            let entry = Entry::new(Arc::new(HelloFile), FileAttr::new(FileType::RegularFile));

            Ok((entry, Opened::default()))
        }
    }

    fn serialize<T: Serialize>(body: &T) -> Vec<u8> {
        get_bincode_config().serialize(body).unwrap()
    }

    #[tokio::test]
    async fn lookup_inserts_and_forget_reaps() {
        let mut harness = Harness::new(Arc::new(StaticDir));

        let message = harness
            .run(ROOT_INODE, fuse_opcode::FUSE_LOOKUP, name_bytes("hello"))
            .await;

        let header = header_of(&message);
        assert_eq!(header.error, 0);
        assert_eq!(
            header.len as usize,
            FUSE_OUT_HEADER_SIZE + FUSE_ENTRY_OUT_SIZE
        );

        let entry: fuse_entry_out = get_bincode_config().deserialize(body_of(&message)).unwrap();
        assert_ne!(entry.nodeid, 0);
        assert_eq!(entry.attr.ino, entry.nodeid);
        // permissions are widened from zero
        assert_eq!(entry.attr.mode & 0o777, 0o644);

        assert!(harness.dispatcher.tree.contains(entry.nodeid));

        harness.dispatcher.forget(entry.nodeid, 1);
        assert!(!harness.dispatcher.tree.contains(entry.nodeid));
    }

    #[tokio::test]
    async fn lookup_missing_name_is_enoent() {
        let mut harness = Harness::new(Arc::new(StaticDir));

        let message = harness
            .run(ROOT_INODE, fuse_opcode::FUSE_LOOKUP, name_bytes("missing"))
            .await;

        assert_eq!(header_of(&message).error, -libc::ENOENT);
    }

    #[tokio::test]
    async fn unknown_nodeid_is_enoent() {
        let mut harness = Harness::new(Arc::new(EmptyDir));

        let message = harness
            .run(42424242, fuse_opcode::FUSE_GETATTR, {
                serialize(&fuse_getattr_in {
                    getattr_flags: 0,
                    dummy: 0,
                    fh: 0,
                })
            })
            .await;

        assert_eq!(header_of(&message).error, -libc::ENOENT);
    }

    #[tokio::test]
    async fn default_getattr_synthesizes_from_stable_attr() {
        let mut harness = Harness::new(Arc::new(EmptyDir));

        let message = harness
            .run(ROOT_INODE, fuse_opcode::FUSE_GETATTR, {
                serialize(&fuse_getattr_in {
                    getattr_flags: 0,
                    dummy: 0,
                    fh: 0,
                })
            })
            .await;

        let header = header_of(&message);
        assert_eq!(header.error, 0);

        let attr_out: fuse_attr_out = get_bincode_config()
            .deserialize(body_of(&message))
            .unwrap();
        assert_eq!(attr_out.attr.ino, ROOT_INODE);
        assert_eq!(attr_out.attr.mode, libc::S_IFDIR as u32 | 0o755);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interrupt_produces_exactly_one_eintr_reply() {
        let mut harness = Harness::new(Arc::new(SlowFile));

        let (request, mut in_header) = harness.request();
        in_header.nodeid = ROOT_INODE;
        let unique = request.unique;

        harness
            .dispatcher
            .in_flight
            .lock()
            .unwrap()
            .insert(unique, request.interrupt.clone());

        let read_in = serialize(&fuse_read_in {
            fh: 0,
            offset: 0,
            size: 4096,
            read_flags: 0,
            lock_owner: 0,
            flags: 0,
            _padding: 0,
        });

        let task = tokio::spawn(harness.dispatcher.clone().handle_request(
            request,
            in_header,
            fuse_opcode::FUSE_READ,
            Bytes::from(read_in),
        ));

        // let the handler park on the interrupt token, then fire it
        time::sleep(Duration::from_millis(20)).await;
        harness.dispatcher.interrupt(unique);

        task.await.unwrap();

        let message = harness.receiver.next().await.unwrap();
        let header = header_of(&message);
        assert_eq!(header.unique, unique);
        assert_eq!(header.error, -libc::EINTR);

        // never two replies, and the request left the in-flight map
        assert!(harness.receiver.try_next().is_err());
        assert_eq!(harness.dispatcher.in_flight_count(), 0);

        // interrupting a completed request is a no-op
        harness.dispatcher.interrupt(unique);
    }

    #[tokio::test]
    async fn read_from_backing_fd_is_fd_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        let mut file = File::create(&path).unwrap();
        file.write_all(&[7u8; 8192]).unwrap();

        let root = Arc::new(FdBackedDir {
            file: std::sync::Mutex::new(Some(File::open(&path).unwrap())),
        });
        let mut harness = Harness::new(root);

        let message = harness
            .run(ROOT_INODE, fuse_opcode::FUSE_OPEN, {
                serialize(&fuse_open_in {
                    flags: 0,
                    open_flags: 0,
                })
            })
            .await;

        let open_out: fuse_open_out = get_bincode_config()
            .deserialize(body_of(&message))
            .unwrap();
        assert_ne!(open_out.fh, 0);

        let message = harness
            .run(ROOT_INODE, fuse_opcode::FUSE_READ, {
                serialize(&fuse_read_in {
                    fh: open_out.fh,
                    offset: 4096,
                    size: 4096,
                    read_flags: 0,
                    lock_owner: 0,
                    flags: 0,
                    _padding: 0,
                })
            })
            .await;

        // the default read identifies the payload by descriptor; the
        // writer splices it or falls back to a buffered write
        match message {
            ReplyMessage::FdData { offset, size, .. } => {
                assert_eq!(offset, 4096);
                assert_eq!(size, 4096);
            }

            ReplyMessage::Data(_) => panic!("expected an fd-backed reply"),
        }
    }

    #[tokio::test]
    async fn read_reply_is_truncated_to_requested_size() {
        let mut harness = Harness::new(Arc::new(HelloFile));

        let message = harness
            .run(ROOT_INODE, fuse_opcode::FUSE_READ, {
                serialize(&fuse_read_in {
                    fh: 0,
                    offset: 0,
                    size: 5,
                    read_flags: 0,
                    lock_owner: 0,
                    flags: 0,
                    _padding: 0,
                })
            })
            .await;

        assert_eq!(body_of(&message), b"hello");
    }

    #[tokio::test]
    async fn write_reports_written_bytes() {
        let mut harness = Harness::new(Arc::new(HelloFile));

        let mut data = serialize(&fuse_write_in {
            fh: 0,
            offset: 0,
            size: 4,
            write_flags: 0,
            lock_owner: 0,
            flags: 0,
            _padding: 0,
        });
        data.extend_from_slice(b"data");

        let message = harness
            .run(ROOT_INODE, fuse_opcode::FUSE_WRITE, data)
            .await;

        let write_out: fuse_write_out = get_bincode_config()
            .deserialize(body_of(&message))
            .unwrap();
        assert_eq!(write_out.size, 4);
    }

    #[tokio::test]
    async fn default_readdir_lists_tree_children_in_order() {
        let mut harness = Harness::new(Arc::new(StaticDir));

        // populate the tree through lookups
        harness
            .run(ROOT_INODE, fuse_opcode::FUSE_LOOKUP, name_bytes("hello"))
            .await;

        let message = harness
            .run(ROOT_INODE, fuse_opcode::FUSE_OPENDIR, {
                serialize(&fuse_open_in {
                    flags: 0,
                    open_flags: 0,
                })
            })
            .await;
        let open_out: fuse_open_out = get_bincode_config()
            .deserialize(body_of(&message))
            .unwrap();

        let message = harness
            .run(ROOT_INODE, fuse_opcode::FUSE_READDIR, {
                serialize(&fuse_read_in {
                    fh: open_out.fh,
                    offset: 0,
                    size: 4096,
                    read_flags: 0,
                    lock_owner: 0,
                    flags: 0,
                    _padding: 0,
                })
            })
            .await;

        let mut body = body_of(&message);
        let mut names = vec![];
        while body.len() >= FUSE_DIRENT_SIZE {
            let dirent: fuse_dirent = get_bincode_config().deserialize(body).unwrap();
            let name_start = FUSE_DIRENT_SIZE;
            let name_end = name_start + dirent.namelen as usize;
            names.push(String::from_utf8_lossy(&body[name_start..name_end]).into_owned());

            let advance = name_end + get_padding_size(name_end);
            body = &body[advance.min(body.len())..];
        }

        assert_eq!(names, vec![".", "..", "hello"]);
    }

    #[tokio::test]
    async fn create_replies_with_entry_and_open() {
        let mut harness = Harness::new(Arc::new(CreateDir));

        let mut data = serialize(&fuse_create_in {
            flags: 0,
            mode: 0o644,
            umask: 0,
            open_flags: 0,
        });
        data.extend_from_slice(&name_bytes("new-file"));

        let message = harness
            .run(ROOT_INODE, fuse_opcode::FUSE_CREATE, data)
            .await;

        let header = header_of(&message);
        assert_eq!(header.error, 0);
        assert_eq!(
            header.len as usize,
            FUSE_OUT_HEADER_SIZE + FUSE_ENTRY_OUT_SIZE + FUSE_OPEN_OUT_SIZE
        );

        let body = body_of(&message);
        let entry: fuse_entry_out = get_bincode_config().deserialize(body).unwrap();
        let open_out: fuse_open_out = get_bincode_config()
            .deserialize(&body[FUSE_ENTRY_OUT_SIZE..])
            .unwrap();

        assert!(harness.dispatcher.tree.contains(entry.nodeid));
        assert!(harness.dispatcher.handles.get(open_out.fh).is_some());
    }

    #[tokio::test]
    async fn poll_is_enosys() {
        let mut harness = Harness::new(Arc::new(EmptyDir));

        let message = harness
            .run(ROOT_INODE, fuse_opcode::FUSE_POLL, vec![0; 24])
            .await;

        assert_eq!(header_of(&message).error, -libc::ENOSYS);
    }

    #[tokio::test]
    async fn rename_exchange_swaps_tree_bindings() {
        struct RenamableDir;

        #[async_trait]
        impl NodeOps for RenamableDir {
            async fn lookup(&self, _req: &Request, _name: &OsStr) -> Result<Entry> {
                Ok(Entry::new(
                    Arc::new(HelloFile),
                    FileAttr::new(FileType::RegularFile),
                ))
            }

            async fn rename(
                &self,
                _req: &Request,
                _name: &OsStr,
                _new_parent: Arc<dyn NodeOps>,
                _new_name: &OsStr,
                _flags: u32,
            ) -> Result<()> {
                Ok(())
            }
        }

        let mut harness = Harness::new(Arc::new(RenamableDir));

        let message = harness
            .run(ROOT_INODE, fuse_opcode::FUSE_LOOKUP, name_bytes("x"))
            .await;
        let x: fuse_entry_out = get_bincode_config().deserialize(body_of(&message)).unwrap();

        let message = harness
            .run(ROOT_INODE, fuse_opcode::FUSE_LOOKUP, name_bytes("y"))
            .await;
        let y: fuse_entry_out = get_bincode_config().deserialize(body_of(&message)).unwrap();

        let mut data = serialize(&fuse_rename2_in {
            newdir: ROOT_INODE,
            flags: RENAME_EXCHANGE,
            _padding: 0,
        });
        data.extend_from_slice(&name_bytes("x"));
        data.extend_from_slice(&name_bytes("y"));

        let message = harness
            .run(ROOT_INODE, fuse_opcode::FUSE_RENAME2, data)
            .await;
        assert_eq!(header_of(&message).error, 0);

        // both targets survive with their lookup counts intact, swapped
        let (x_now, _) = harness
            .dispatcher
            .tree
            .lookup_child(ROOT_INODE, OsStr::new("x"))
            .unwrap();
        let (y_now, _) = harness
            .dispatcher
            .tree
            .lookup_child(ROOT_INODE, OsStr::new("y"))
            .unwrap();
        assert_eq!(x_now.ino, y.nodeid);
        assert_eq!(y_now.ino, x.nodeid);
    }
}
