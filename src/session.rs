//! The FUSE session server.
//!
//! A [`Session`] owns the mount descriptor, runs the configured number of
//! request readers, and writes replies from one writer task. Readers handle
//! INIT, DESTROY, FORGET, BATCH_FORGET and INTERRUPT inline; everything
//! else is dispatched as its own task through the [`Dispatcher`].
//!
//! [`Dispatcher`]: crate::dispatch::Dispatcher

use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_notify::Notify as UnmountNotify;
use bincode::Options;
use bytes::Bytes;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::future;
use futures_util::stream::StreamExt;
#[cfg(target_os = "linux")]
use nix::mount;
use tokio::fs::read_dir;
use tokio::task;
use tokio::time;
use tracing::{debug, debug_span, error, warn, Instrument};

use crate::abi::*;
use crate::buffer::BufferPool;
use crate::connection::FuseConnection;
use crate::dispatch::{fire_on_forget, reply_empty, reply_error, Dispatcher, ReplyMessage};
use crate::helper::get_bincode_config;
use crate::node::{NodeOps, ROOT_INODE};
use crate::notify::Notify;
use crate::request::Request;
use crate::{Errno, MountOptions};

/// how long shutdown waits for in-flight handlers before abandoning them.
const DRAIN_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// A Future which returns when a file system is unmounted
pub struct MountHandle {
    handle: task::JoinHandle<IoResult<()>>,
    unmount_notify: Arc<UnmountNotify>,
}

impl MountHandle {
    /// stop serving and wait for the session to finish its shutdown
    /// sequence.
    pub async fn unmount(mut self) -> IoResult<()> {
        self.unmount_notify.notify();

        (&mut self.handle).await.unwrap()
    }
}

impl Future for MountHandle {
    type Output = IoResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // The unwrap flattens the JoinHandle
        Pin::new(&mut self.handle).poll(cx).map(Result::unwrap)
    }
}

/// fuse filesystem session, inode based.
pub struct Session {
    mount_options: MountOptions,
    fuse_connection: Option<Arc<FuseConnection>>,
    root: Option<Arc<dyn NodeOps>>,
    mount_path: Option<PathBuf>,
    response_sender: UnboundedSender<ReplyMessage>,
    response_receiver: Option<UnboundedReceiver<ReplyMessage>>,
    unmount_notify: Arc<UnmountNotify>,
}

impl Session {
    /// new a fuse filesystem session.
    pub fn new(mount_options: MountOptions) -> Self {
        let (sender, receiver) = unbounded();

        Self {
            mount_options,
            fuse_connection: None,
            root: None,
            mount_path: None,
            response_sender: sender,
            response_receiver: Some(receiver),
            unmount_notify: Arc::new(UnmountNotify::new()),
        }
    }

    /// get a [`Notify`] for pushing cache invalidation to the kernel once
    /// the session is mounted.
    pub fn get_notify(&self) -> Notify {
        Notify::new(self.response_sender.clone())
    }

    async fn mount_empty_check(&self, mount_path: &Path) -> IoResult<()> {
        if !self.mount_options.nonempty
            && matches!(read_dir(mount_path).await?.next_entry().await, Ok(Some(_)))
        {
            return Err(IoError::new(
                ErrorKind::AlreadyExists,
                "mount point is not empty",
            ));
        }

        Ok(())
    }

    /// mount the filesystem. The returned handle resolves once the
    /// filesystem is unmounted.
    #[cfg(target_os = "linux")]
    pub async fn mount(
        mut self,
        root: Arc<dyn NodeOps>,
        mount_path: impl AsRef<Path>,
    ) -> IoResult<MountHandle> {
        let mount_path = mount_path.as_ref();

        self.mount_empty_check(mount_path).await?;

        let fuse_connection = FuseConnection::new(self.unmount_notify.clone())?;

        let fd = std::os::fd::AsRawFd::as_raw_fd(&fuse_connection.as_fd());

        let options = self.mount_options.build(fd);

        let fs_name = self
            .mount_options
            .fs_name
            .clone()
            .unwrap_or_else(|| "fuse".into());

        debug!("mount options {:?}", options);

        if let Err(err) = mount::mount(
            Some(fs_name.as_os_str()),
            mount_path,
            Some("fuse"),
            mount::MsFlags::MS_NOSUID | mount::MsFlags::MS_NODEV,
            Some(options.as_os_str()),
        ) {
            error!("mount {:?} failed", mount_path);

            return Err(err.into());
        }

        self.fuse_connection.replace(Arc::new(fuse_connection));
        self.root.replace(root);
        self.mount_path.replace(mount_path.to_owned());

        debug!("mount {:?} success", mount_path);

        let unmount_notify = self.unmount_notify.clone();

        Ok(MountHandle {
            handle: task::spawn(self.inner_mount()),
            unmount_notify,
        })
    }

    /// mount the filesystem without root permission by using the
    /// `fusermount3` binary.
    #[cfg(all(target_os = "linux", feature = "unprivileged"))]
    pub async fn mount_with_unprivileged(
        mut self,
        root: Arc<dyn NodeOps>,
        mount_path: impl AsRef<Path>,
    ) -> IoResult<MountHandle> {
        let mount_path = mount_path.as_ref();

        self.mount_empty_check(mount_path).await?;

        let fuse_connection = FuseConnection::new_with_unprivileged(
            self.mount_options.clone(),
            mount_path,
            self.unmount_notify.clone(),
        )
        .await?;

        self.fuse_connection.replace(Arc::new(fuse_connection));
        self.root.replace(root);
        self.mount_path.replace(mount_path.to_owned());

        debug!("mount {:?} success", mount_path);

        let unmount_notify = self.unmount_notify.clone();

        Ok(MountHandle {
            handle: task::spawn(self.inner_mount()),
            unmount_notify,
        })
    }

    /// serve a descriptor an external mount helper opened and mounted for
    /// us; the session never opens /dev/fuse itself in this mode.
    pub fn mount_from_fd(mut self, root: Arc<dyn NodeOps>, fd: OwnedFd) -> IoResult<MountHandle> {
        let fuse_connection = FuseConnection::from_fd(fd, self.unmount_notify.clone())?;

        self.fuse_connection.replace(Arc::new(fuse_connection));
        self.root.replace(root);

        let unmount_notify = self.unmount_notify.clone();

        Ok(MountHandle {
            handle: task::spawn(self.inner_mount()),
            unmount_notify,
        })
    }

    async fn inner_mount(mut self) -> IoResult<()> {
        let fuse_connection = self.fuse_connection.take().unwrap();
        let root = self.root.take().expect("filesystem not init");
        let receiver = self.response_receiver.take().unwrap();

        let dispatcher = Dispatcher::new(
            root,
            fuse_connection.clone(),
            self.response_sender.clone(),
            self.mount_options.clone(),
        );

        let readers = self.mount_options.effective_readers();
        let buffer_pool = BufferPool::new(BUFFER_SIZE, readers + 2);

        let reply_task = task::spawn(Self::reply_fuse(
            fuse_connection.clone(),
            dispatcher.clone(),
            receiver,
        ));

        let mut reader_tasks = Vec::with_capacity(readers);
        for reader in 0..readers {
            let task = task::spawn(
                Self::read_loop(
                    fuse_connection.clone(),
                    dispatcher.clone(),
                    buffer_pool.clone(),
                )
                .instrument(debug_span!("fuse_reader", reader)),
            );

            reader_tasks.push(task);
        }

        // the first reader to stop ends the session
        let (first_result, _, remaining) = future::select_all(reader_tasks).await;
        let read_result = first_result.unwrap();

        fuse_connection.notify_unmount();
        for reader in remaining {
            let _ = reader.await;
        }

        // drain in-flight handlers, bounded by a grace period
        let deadline = time::Instant::now() + DRAIN_GRACE_PERIOD;
        while dispatcher.in_flight_count() > 0 && time::Instant::now() < deadline {
            time::sleep(Duration::from_millis(10)).await;
        }

        // stop the writer once the handlers had their chance to reply
        self.response_sender.close_channel();
        let write_result = reply_task.await.unwrap();

        // release remaining handles and their passthrough backings
        for entry in dispatcher.handles.drain() {
            if let Some(backing_id) = entry.backing_id {
                fuse_connection.backing_close(backing_id);
            }
        }

        // drop the namespace; every node learns it is unreachable
        fire_on_forget(dispatcher.tree.clear());

        drop(fuse_connection);

        if let Some(mount_path) = self.mount_path.take() {
            Self::cleanup_mount_point(&mount_path).await;
        }

        debug!("fuse session ended");

        read_result.and(write_result)
    }

    async fn cleanup_mount_point(mount_path: &Path) {
        #[cfg(target_os = "linux")]
        {
            let path = mount_path.to_owned();

            let result = task::spawn_blocking(move || {
                mount::umount2(&path, mount::MntFlags::MNT_DETACH)
            })
            .await
            .unwrap();

            match result {
                Ok(()) => return,
                Err(err) => debug!("umount {:?} failed {}", mount_path, err),
            }
        }

        #[cfg(all(target_os = "linux", feature = "unprivileged"))]
        if let Ok(binary_path) = crate::find_fusermount3() {
            let _ = tokio::process::Command::new(binary_path)
                .arg("-u")
                .arg("-q")
                .arg("-z")
                .arg("--")
                .arg(mount_path)
                .status()
                .await;
        }
    }

    async fn reply_fuse(
        fuse_connection: Arc<FuseConnection>,
        dispatcher: Arc<Dispatcher>,
        mut response_receiver: UnboundedReceiver<ReplyMessage>,
    ) -> IoResult<()> {
        while let Some(response) = response_receiver.next().await {
            let result = match response {
                ReplyMessage::Data(data) => fuse_connection.write(&data).await.map(|_| ()),

                ReplyMessage::FdData {
                    header,
                    fd,
                    offset,
                    size,
                } => {
                    Self::write_fd_reply(&fuse_connection, &dispatcher, header, fd, offset, size)
                        .await
                }
            };

            if let Err(err) = result {
                if err.kind() == ErrorKind::NotFound {
                    warn!(
                        "may reply interrupted fuse request, ignore this error {}",
                        err
                    );

                    continue;
                }

                error!("reply fuse failed {}", err);

                // a partial or failed reply write poisons the stream
                fuse_connection.notify_unmount();

                return Err(err);
            }
        }

        Ok(())
    }

    /// emit an fd-backed read reply: splice when negotiated, otherwise read
    /// the payload into a buffer and writev (header, data).
    async fn write_fd_reply(
        fuse_connection: &Arc<FuseConnection>,
        dispatcher: &Arc<Dispatcher>,
        mut header: Vec<u8>,
        fd: Arc<OwnedFd>,
        offset: u64,
        size: u32,
    ) -> IoResult<()> {
        #[cfg(target_os = "linux")]
        if dispatcher.splice_read_replies.load(Ordering::Relaxed) {
            match fuse_connection
                .splice_payload(header.clone(), fd.clone(), offset, size)
                .await
            {
                Ok(_) => return Ok(()),

                Err(err) => {
                    debug!("splice reply failed, falling back to buffered write {}", err);
                }
            }
        }

        #[cfg(not(target_os = "linux"))]
        let _ = dispatcher;

        let data = task::spawn_blocking(move || {
            let mut buffer = vec![0; size as usize];
            let mut read = 0;

            while read < buffer.len() {
                match nix::sys::uio::pread(
                    fd.as_fd(),
                    &mut buffer[read..],
                    (offset + read as u64) as libc::off_t,
                ) {
                    Ok(0) => break,
                    Ok(n) => read += n,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(err) => return Err(IoError::from(err)),
                }
            }

            buffer.truncate(read);

            Ok(buffer)
        })
        .await
        .unwrap()?;

        let total = (FUSE_OUT_HEADER_SIZE + data.len()) as u32;
        header[..4].copy_from_slice(&total.to_ne_bytes());

        fuse_connection.write_vectored(&header, &data).await?;

        Ok(())
    }

    async fn read_loop(
        fuse_connection: Arc<FuseConnection>,
        dispatcher: Arc<Dispatcher>,
        buffer_pool: Arc<BufferPool>,
    ) -> IoResult<()> {
        loop {
            let mut buffer = buffer_pool.acquire();

            let n = match fuse_connection.read(&mut buffer).await {
                Ok(None) => return Ok(()),

                Ok(Some(n)) => n,

                Err(err) => {
                    if let Some(errno) = err.raw_os_error() {
                        if errno == libc::ENODEV {
                            debug!("kernel tore down the mount");

                            return Ok(());
                        }

                        if errno == libc::EINTR || errno == libc::EAGAIN {
                            continue;
                        }
                    }

                    error!("read from /dev/fuse failed {}", err);

                    return Err(err);
                }
            };

            let data = &buffer[..n];

            let in_header = match get_bincode_config().deserialize::<fuse_in_header>(data) {
                Err(err) => {
                    error!("deserialize fuse_in_header failed {}", err);

                    return Err(IoError::from_raw_os_error(libc::EIO));
                }

                Ok(in_header) => in_header,
            };

            // the declared length must match the bytes actually received
            if in_header.len as usize != n {
                error!(
                    "request unique {} declared {} bytes but {} were read",
                    in_header.unique, in_header.len, n
                );

                return Err(IoError::from_raw_os_error(libc::EIO));
            }

            let request = Request::from(&in_header);

            let opcode = match fuse_opcode::try_from(in_header.opcode) {
                Err(err) => {
                    debug!("receive unknown opcode {}", err.0);

                    Self::send_reply(
                        &dispatcher,
                        reply_error(request.unique, Errno(libc::ENOSYS)),
                    );

                    continue;
                }

                Ok(opcode) => opcode,
            };

            debug!("receive opcode {}", opcode);

            let data = &data[FUSE_IN_HEADER_SIZE..];

            if !dispatcher.initialized.load(Ordering::Acquire)
                && opcode != fuse_opcode::FUSE_INIT
            {
                warn!("opcode {} received before INIT completed", opcode);

                Self::send_reply(&dispatcher, reply_error(request.unique, Errno(libc::EIO)));

                continue;
            }

            match opcode {
                fuse_opcode::FUSE_INIT => {
                    Self::handle_init(&fuse_connection, &dispatcher, request, data).await?;
                }

                fuse_opcode::FUSE_DESTROY => {
                    debug!("receive fuse destroy");

                    let _ = fuse_connection.write(&reply_empty(request.unique)).await;

                    return Ok(());
                }

                fuse_opcode::FUSE_FORGET => {
                    if let Ok(forget_in) =
                        get_bincode_config().deserialize::<fuse_forget_in>(data)
                    {
                        dispatcher.forget(in_header.nodeid, forget_in.nlookup);
                    }
                }

                fuse_opcode::FUSE_BATCH_FORGET => {
                    Self::handle_batch_forget(&dispatcher, &request, data);
                }

                fuse_opcode::FUSE_INTERRUPT => {
                    match get_bincode_config().deserialize::<fuse_interrupt_in>(data) {
                        Err(err) => {
                            error!(
                                "deserialize fuse_interrupt_in failed {}, request unique {}",
                                err, request.unique
                            );
                        }

                        // there is no reply to INTERRUPT itself
                        Ok(interrupt_in) => dispatcher.interrupt(interrupt_in.unique),
                    }
                }

                _ => {
                    dispatcher
                        .in_flight
                        .lock()
                        .unwrap()
                        .insert(request.unique, request.interrupt.clone());

                    let data = Bytes::copy_from_slice(data);
                    let unique = request.unique;

                    task::spawn(
                        dispatcher
                            .clone()
                            .handle_request(request, in_header, opcode, data)
                            .instrument(debug_span!("fuse_request", unique)),
                    );
                }
            }
        }
    }

    fn send_reply(dispatcher: &Arc<Dispatcher>, data: Vec<u8>) {
        let _ = dispatcher
            .sender
            .clone()
            .unbounded_send(ReplyMessage::Data(data));
    }

    fn handle_batch_forget(dispatcher: &Arc<Dispatcher>, request: &Request, mut data: &[u8]) {
        let batch_forget_in =
            match get_bincode_config().deserialize::<fuse_batch_forget_in>(data) {
                Err(err) => {
                    error!(
                        "deserialize fuse_batch_forget_in failed {}, request unique {}",
                        err, request.unique
                    );

                    // no need to reply
                    return;
                }

                Ok(batch_forget_in) => batch_forget_in,
            };

        data = &data[FUSE_BATCH_FORGET_IN_SIZE..];

        let mut count = 0;
        while count < batch_forget_in.count && data.len() >= FUSE_FORGET_ONE_SIZE {
            match get_bincode_config().deserialize::<fuse_forget_one>(data) {
                Err(err) => {
                    error!(
                        "deserialize fuse_forget_one failed {}, request unique {}",
                        err, request.unique
                    );

                    return;
                }

                Ok(forget_one) => {
                    data = &data[FUSE_FORGET_ONE_SIZE..];
                    count += 1;

                    dispatcher.forget(forget_one.nodeid, forget_one.nlookup);
                }
            }
        }
    }

    async fn handle_init(
        fuse_connection: &Arc<FuseConnection>,
        dispatcher: &Arc<Dispatcher>,
        request: Request,
        data: &[u8],
    ) -> IoResult<()> {
        let init_in = match get_bincode_config().deserialize::<fuse_init_in>(data) {
            Err(err) => {
                error!(
                    "deserialize fuse_init_in failed {}, request unique {}",
                    err, request.unique
                );

                let _ = fuse_connection
                    .write(&reply_error(request.unique, Errno(libc::EINVAL)))
                    .await;

                return Err(IoError::from_raw_os_error(libc::EINVAL));
            }

            Ok(init_in) => init_in,
        };

        debug!("fuse_init {:?}", init_in);

        if init_in.major != FUSE_KERNEL_VERSION || init_in.minor < FUSE_MIN_KERNEL_MINOR_VERSION {
            error!(
                "unsupported fuse protocol version {}.{}",
                init_in.major, init_in.minor
            );

            let _ = fuse_connection
                .write(&reply_error(request.unique, Errno(libc::EPROTO)))
                .await;

            return Err(IoError::from_raw_os_error(libc::EPROTO));
        }

        let kernel_flags2 = if init_in.minor >= 36
            && init_in.flags & FUSE_INIT_EXT > 0
            && data.len() >= FUSE_INIT_IN_SIZE + std::mem::size_of::<fuse_init_in_ext>()
        {
            get_bincode_config()
                .deserialize::<fuse_init_in_ext>(&data[FUSE_INIT_IN_SIZE..])
                .map(|ext| ext.flags2)
                .unwrap_or(0)
        } else {
            0
        };

        let mount_options = &dispatcher.mount_options;

        let mut reply_flags = 0;

        if init_in.flags & FUSE_ASYNC_READ > 0 {
            debug!("enable FUSE_ASYNC_READ");

            reply_flags |= FUSE_ASYNC_READ;
        }

        if init_in.flags & FUSE_POSIX_LOCKS > 0 {
            debug!("enable FUSE_POSIX_LOCKS");

            reply_flags |= FUSE_POSIX_LOCKS;
        }

        if init_in.flags & FUSE_ATOMIC_O_TRUNC > 0 {
            debug!("enable FUSE_ATOMIC_O_TRUNC");

            reply_flags |= FUSE_ATOMIC_O_TRUNC;
        }

        if init_in.flags & FUSE_BIG_WRITES > 0 {
            debug!("enable FUSE_BIG_WRITES");

            reply_flags |= FUSE_BIG_WRITES;
        }

        if init_in.flags & FUSE_DONT_MASK > 0 && mount_options.dont_mask {
            debug!("enable FUSE_DONT_MASK");

            reply_flags |= FUSE_DONT_MASK;
        }

        let mut splice_replies = false;
        if !mount_options.no_splice {
            if init_in.flags & FUSE_SPLICE_WRITE > 0 {
                debug!("enable FUSE_SPLICE_WRITE");

                reply_flags |= FUSE_SPLICE_WRITE;
                splice_replies = true;
            }

            if init_in.flags & FUSE_SPLICE_MOVE > 0 {
                debug!("enable FUSE_SPLICE_MOVE");

                reply_flags |= FUSE_SPLICE_MOVE;
            }

            if init_in.flags & FUSE_SPLICE_READ > 0 {
                debug!("enable FUSE_SPLICE_READ");

                reply_flags |= FUSE_SPLICE_READ;
            }
        }

        if init_in.flags & FUSE_AUTO_INVAL_DATA > 0 {
            debug!("enable FUSE_AUTO_INVAL_DATA");

            reply_flags |= FUSE_AUTO_INVAL_DATA;
        }

        if init_in.flags & FUSE_ASYNC_DIO > 0 {
            debug!("enable FUSE_ASYNC_DIO");

            reply_flags |= FUSE_ASYNC_DIO;
        }

        if init_in.flags & FUSE_WRITEBACK_CACHE > 0 && mount_options.write_back {
            debug!("enable FUSE_WRITEBACK_CACHE");

            reply_flags |= FUSE_WRITEBACK_CACHE;
        }

        if init_in.flags & FUSE_PARALLEL_DIROPS > 0 {
            debug!("enable FUSE_PARALLEL_DIROPS");

            reply_flags |= FUSE_PARALLEL_DIROPS;
        }

        if init_in.flags & FUSE_HANDLE_KILLPRIV > 0 && mount_options.handle_killpriv {
            debug!("enable FUSE_HANDLE_KILLPRIV");

            reply_flags |= FUSE_HANDLE_KILLPRIV;
        }

        if init_in.flags & FUSE_POSIX_ACL > 0 && mount_options.default_permissions {
            debug!("enable FUSE_POSIX_ACL");

            reply_flags |= FUSE_POSIX_ACL;
        }

        if init_in.flags & FUSE_MAX_PAGES > 0 {
            debug!("enable FUSE_MAX_PAGES");

            reply_flags |= FUSE_MAX_PAGES;
        }

        if init_in.flags & FUSE_CACHE_SYMLINKS > 0 {
            debug!("enable FUSE_CACHE_SYMLINKS");

            reply_flags |= FUSE_CACHE_SYMLINKS;
        }

        let mut reply_flags2 = 0;
        let mut max_stack_depth = 0;

        if mount_options.passthrough && kernel_flags2 & FUSE_PASSTHROUGH > 0 {
            debug!("enable FUSE_PASSTHROUGH");

            reply_flags2 |= FUSE_PASSTHROUGH;
            max_stack_depth = 1;
            dispatcher.passthrough.store(true, Ordering::Relaxed);
        }

        if reply_flags2 != 0 {
            reply_flags |= FUSE_INIT_EXT;
        }

        let minor = init_in.minor.min(FUSE_KERNEL_MINOR_VERSION);

        dispatcher.proto_minor.store(minor, Ordering::Relaxed);
        dispatcher
            .max_write
            .store(MAX_WRITE_SIZE as u32, Ordering::Relaxed);
        dispatcher
            .splice_read_replies
            .store(splice_replies, Ordering::Relaxed);

        let init_out = fuse_init_out {
            major: FUSE_KERNEL_VERSION,
            minor,
            max_readahead: init_in.max_readahead,
            flags: reply_flags,
            max_background: DEFAULT_MAX_BACKGROUND,
            congestion_threshold: DEFAULT_CONGESTION_THRESHOLD,
            max_write: MAX_WRITE_SIZE as u32,
            time_gran: DEFAULT_TIME_GRAN,
            max_pages: (MAX_WRITE_SIZE / 4096) as u16,
            map_alignment: DEFAULT_MAP_ALIGNMENT,
            flags2: reply_flags2,
            max_stack_depth,
            unused: [0; 6],
        };

        debug!("fuse init out {:?}", init_out);

        // kernels before 7.23 expect the abbreviated init_out
        let out_size = if minor < 23 { 24 } else { FUSE_INIT_OUT_SIZE };

        let out_header = fuse_out_header {
            len: (FUSE_OUT_HEADER_SIZE + out_size) as u32,
            error: 0,
            unique: request.unique,
        };

        let mut data = Vec::with_capacity(FUSE_OUT_HEADER_SIZE + FUSE_INIT_OUT_SIZE);

        get_bincode_config()
            .serialize_into(&mut data, &out_header)
            .expect("won't happened");
        get_bincode_config()
            .serialize_into(&mut data, &init_out)
            .expect("won't happened");
        data.truncate(FUSE_OUT_HEADER_SIZE + out_size);

        if let Err(err) = fuse_connection.write(&data).await {
            error!("write init out data to /dev/fuse failed {}", err);

            return Err(err);
        }

        dispatcher.initialized.store(true, Ordering::Release);

        if let Some(root_ops) = dispatcher.tree.get_ops(ROOT_INODE) {
            root_ops.on_add();
        }

        debug!("fuse init done");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    use super::*;
    use crate::node::NodeOps;

    struct EmptyRoot;

    impl NodeOps for EmptyRoot {}

    /// a seqpacket socketpair stands in for /dev/fuse: message boundaries
    /// are preserved in both directions.
    fn kernel_pair() -> (Arc<OwnedFd>, OwnedFd) {
        let (kernel_side, session_side) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )
        .unwrap();

        (Arc::new(kernel_side), session_side)
    }

    async fn send_message(fd: &Arc<OwnedFd>, data: Vec<u8>) {
        let fd = fd.clone();

        task::spawn_blocking(move || {
            nix::unistd::write(fd.as_fd(), &data).unwrap();
        })
        .await
        .unwrap();
    }

    async fn recv_message(fd: &Arc<OwnedFd>) -> Vec<u8> {
        let fd = fd.clone();

        task::spawn_blocking(move || {
            let mut buffer = vec![0u8; BUFFER_SIZE];
            let n = nix::unistd::read(fd.as_raw_fd(), &mut buffer).unwrap();
            buffer.truncate(n);

            buffer
        })
        .await
        .unwrap()
    }

    fn request_message<T: serde::Serialize>(
        opcode: fuse_opcode,
        unique: u64,
        nodeid: u64,
        body: &T,
    ) -> Vec<u8> {
        let body = get_bincode_config().serialize(body).unwrap();

        let in_header = fuse_in_header {
            len: (FUSE_IN_HEADER_SIZE + body.len()) as u32,
            opcode: opcode as u32,
            unique,
            nodeid,
            uid: 0,
            gid: 0,
            pid: 0,
            _padding: 0,
        };

        let mut data = get_bincode_config().serialize(&in_header).unwrap();
        data.extend_from_slice(&body);

        data
    }

    fn parse_header(data: &[u8]) -> fuse_out_header {
        get_bincode_config()
            .deserialize(&data[..FUSE_OUT_HEADER_SIZE])
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn init_handshake_negotiates_and_serves() {
        let (kernel, session_side) = kernel_pair();

        let mount_handle = Session::new(MountOptions::default())
            .mount_from_fd(Arc::new(EmptyRoot), session_side)
            .unwrap();

        // anything before INIT is answered EIO
        send_message(
            &kernel,
            request_message(
                fuse_opcode::FUSE_GETATTR,
                7,
                ROOT_INODE,
                &fuse_getattr_in {
                    getattr_flags: 0,
                    dummy: 0,
                    fh: 0,
                },
            ),
        )
        .await;

        let reply = recv_message(&kernel).await;
        let header = parse_header(&reply);
        assert_eq!(header.unique, 7);
        assert_eq!(header.error, -libc::EIO);

        send_message(
            &kernel,
            request_message(
                fuse_opcode::FUSE_INIT,
                1,
                0,
                &fuse_init_in {
                    major: FUSE_KERNEL_VERSION,
                    minor: 43,
                    max_readahead: 65536,
                    flags: FUSE_ASYNC_READ | FUSE_BIG_WRITES | FUSE_PARALLEL_DIROPS,
                },
            ),
        )
        .await;

        let reply = recv_message(&kernel).await;
        let header = parse_header(&reply);
        assert_eq!(header.error, 0);
        assert_eq!(header.unique, 1);

        let init_out: fuse_init_out = get_bincode_config()
            .deserialize(&reply[FUSE_OUT_HEADER_SIZE..])
            .unwrap();
        assert_eq!(init_out.major, FUSE_KERNEL_VERSION);
        // negotiated minor is the smaller of the two
        assert_eq!(init_out.minor, FUSE_KERNEL_MINOR_VERSION);
        assert_eq!(init_out.max_write, MAX_WRITE_SIZE as u32);
        assert_eq!(init_out.max_readahead, 65536);
        assert_eq!(init_out.flags & FUSE_ASYNC_READ, FUSE_ASYNC_READ);
        // splice was not offered, so it must not be enabled
        assert_eq!(init_out.flags & FUSE_SPLICE_WRITE, 0);

        // now regular requests are served
        send_message(
            &kernel,
            request_message(
                fuse_opcode::FUSE_GETATTR,
                2,
                ROOT_INODE,
                &fuse_getattr_in {
                    getattr_flags: 0,
                    dummy: 0,
                    fh: 0,
                },
            ),
        )
        .await;

        let reply = recv_message(&kernel).await;
        let header = parse_header(&reply);
        assert_eq!(header.unique, 2);
        assert_eq!(header.error, 0);
        assert_eq!(
            header.len as usize,
            FUSE_OUT_HEADER_SIZE + FUSE_ATTR_OUT_SIZE
        );

        mount_handle.unmount().await.unwrap();

        // the session closed its end of the channel
        let eof = recv_message(&kernel).await;
        assert!(eof.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn init_with_unsupported_major_is_eproto() {
        let (kernel, session_side) = kernel_pair();

        let mount_handle = Session::new(MountOptions::default())
            .mount_from_fd(Arc::new(EmptyRoot), session_side)
            .unwrap();

        send_message(
            &kernel,
            request_message(
                fuse_opcode::FUSE_INIT,
                1,
                0,
                &fuse_init_in {
                    major: 8,
                    minor: 0,
                    max_readahead: 65536,
                    flags: 0,
                },
            ),
        )
        .await;

        let reply = recv_message(&kernel).await;
        assert_eq!(parse_header(&reply).error, -libc::EPROTO);

        // the session shuts down on its own
        let result = mount_handle.await;
        assert_eq!(result.unwrap_err().raw_os_error(), Some(libc::EPROTO));
    }
}
