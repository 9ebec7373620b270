use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, Write};
#[cfg(all(target_os = "linux", feature = "unprivileged"))]
use std::io::{ErrorKind, IoSliceMut};
#[cfg(all(target_os = "linux", feature = "unprivileged"))]
use std::os::fd::FromRawFd;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
#[cfg(all(target_os = "linux", feature = "unprivileged"))]
use std::{ffi::OsString, path::Path};
use std::pin::pin;
use std::sync::Arc;

use async_notify::Notify;
use futures_util::lock::Mutex;
use futures_util::{select, FutureExt, TryFutureExt};
use nix::unistd;
#[cfg(all(target_os = "linux", feature = "unprivileged"))]
use nix::sys::socket::{self, AddressFamily, ControlMessageOwned, MsgFlags, SockFlag, SockType};
#[cfg(target_os = "linux")]
use nix::fcntl::SpliceFFlags;
use tokio::io::unix::AsyncFd;
#[cfg(all(target_os = "linux", feature = "unprivileged"))]
use tokio::process::Command;
use tokio::task;
#[cfg(all(target_os = "linux", feature = "unprivileged"))]
use tracing::debug;
use tracing::warn;

use crate::abi::fuse_backing_map;
#[cfg(all(target_os = "linux", feature = "unprivileged"))]
use crate::find_fusermount3;
#[cfg(all(target_os = "linux", feature = "unprivileged"))]
use crate::MountOptions;

nix::ioctl_write_ptr!(fuse_dev_ioc_backing_open, 229, 1, fuse_backing_map);
nix::ioctl_write_ptr!(fuse_dev_ioc_backing_close, 229, 2, u32);

/// The channel to the kernel: the mounted /dev/fuse descriptor plus the
/// locking that keeps reads and reply writes whole.
///
/// Writes are atomic per reply: one plain write, one writev of
/// (header, payload), or one terminal splice of the assembled reply.
pub(crate) struct FuseConnection {
    unmount_notify: Arc<Notify>,
    mode: ConnectionMode,
    write: Mutex<()>,
    // keeps fds 0..=3 occupied so that subprocess fd remapping in the
    // serving process cannot collide with mount infrastructure
    _reserved_fds: Vec<OwnedFd>,
}

enum ConnectionMode {
    Block(BlockFuseConnection),
    NonBlock(NonBlockFuseConnection),
}

impl FuseConnection {
    /// open /dev/fuse directly; requires privilege to mount afterwards.
    pub fn new(unmount_notify: Arc<Notify>) -> io::Result<Self> {
        let reserved = reserve_low_fds()?;
        let connection = BlockFuseConnection::new()?;

        Ok(Self {
            unmount_notify,
            mode: ConnectionMode::Block(connection),
            write: Mutex::new(()),
            _reserved_fds: reserved,
        })
    }

    /// adopt a descriptor an external mount helper handed us, already
    /// mounted.
    pub fn from_fd(fd: OwnedFd, unmount_notify: Arc<Notify>) -> io::Result<Self> {
        let reserved = reserve_low_fds()?;

        set_fd_non_blocking(fd.as_raw_fd())?;

        Ok(Self {
            unmount_notify,
            mode: ConnectionMode::NonBlock(NonBlockFuseConnection {
                fd: AsyncFd::new(fd)?,
                read: Mutex::new(()),
            }),
            write: Mutex::new(()),
            _reserved_fds: reserved,
        })
    }

    #[cfg(all(target_os = "linux", feature = "unprivileged"))]
    pub async fn new_with_unprivileged(
        mount_options: MountOptions,
        mount_path: impl AsRef<Path>,
        unmount_notify: Arc<Notify>,
    ) -> io::Result<Self> {
        let reserved = reserve_low_fds()?;
        let connection =
            NonBlockFuseConnection::new_with_unprivileged(mount_options, mount_path).await?;

        Ok(Self {
            unmount_notify,
            mode: ConnectionMode::NonBlock(connection),
            write: Mutex::new(()),
            _reserved_fds: reserved,
        })
    }

    /// read one request message. Returns `None` when the session is asked
    /// to stop.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut unmount_fut = pin!(self.unmount_notify.notified().fuse());
        let mut read_fut = pin!(self.inner_read(buf).map_ok(Some).fuse());

        select! {
            _ = unmount_fut => Ok(None),
            res = read_fut => res
        }
    }

    async fn inner_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.mode {
            ConnectionMode::Block(connection) => connection.read(buf).await,
            ConnectionMode::NonBlock(connection) => connection.read(buf).await,
        }
    }

    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let _guard = self.write.lock().await;

        match &self.mode {
            ConnectionMode::Block(connection) => connection.write(buf).await,
            ConnectionMode::NonBlock(connection) => connection.write(buf).await,
        }
    }

    /// one atomic (header, payload) reply.
    pub async fn write_vectored(&self, header: &[u8], data: &[u8]) -> io::Result<usize> {
        let _guard = self.write.lock().await;

        let written = match &self.mode {
            ConnectionMode::Block(connection) => connection.write_vectored(header, data).await?,
            ConnectionMode::NonBlock(connection) => {
                connection.write_vectored(header, data).await?
            }
        };

        if written != header.len() + data.len() {
            // a partial reply write corrupts the stream
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "partial reply write to /dev/fuse",
            ));
        }

        Ok(written)
    }

    /// Move `size` bytes from `fd` at `offset` to the kernel without a
    /// userspace copy: file → pipe, header + pipe → pipe, pipe → device in
    /// a single terminal splice. The header's length field is fixed up to
    /// the byte count actually spliced out of the file.
    ///
    /// Any error leaves the device untouched, so the caller can fall back
    /// to a buffered write.
    #[cfg(target_os = "linux")]
    pub async fn splice_payload(
        &self,
        mut header: Vec<u8>,
        fd: Arc<OwnedFd>,
        offset: u64,
        size: u32,
    ) -> io::Result<usize> {
        let _guard = self.write.lock().await;

        let device_fd = self.raw_fd();

        task::spawn_blocking(move || {
            // Safety: the connection outlives this blocking task, the
            // session holds it for the whole write
            let device = unsafe { BorrowedFd::borrow_raw(device_fd) };

            let (payload_read, payload_write) = unistd::pipe()?;
            grow_pipe(payload_write.as_raw_fd(), size as usize);

            let mut file_offset = offset as libc::loff_t;
            let mut loaded = 0;
            while loaded < size as usize {
                let n = nix::fcntl::splice(
                    fd.as_fd(),
                    Some(&mut file_offset),
                    payload_write.as_fd(),
                    None,
                    size as usize - loaded,
                    SpliceFFlags::SPLICE_F_MOVE,
                )?;
                if n == 0 {
                    break;
                }

                loaded += n;
            }

            // now that the payload length is known, finish the header
            let total = header.len() + loaded;
            header[..4].copy_from_slice(&(total as u32).to_ne_bytes());

            let (reply_read, reply_write) = unistd::pipe()?;
            grow_pipe(reply_write.as_raw_fd(), total);

            if unistd::write(reply_write.as_fd(), &header)? != header.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "short header write into splice pipe",
                ));
            }

            let mut moved = 0;
            while moved < loaded {
                let n = nix::fcntl::splice(
                    payload_read.as_fd(),
                    None,
                    reply_write.as_fd(),
                    None,
                    loaded - moved,
                    SpliceFFlags::SPLICE_F_MOVE,
                )?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "splice pipe drained early",
                    ));
                }

                moved += n;
            }

            // the terminal splice must deliver the reply whole
            let written = nix::fcntl::splice(
                reply_read.as_fd(),
                None,
                device,
                None,
                total,
                SpliceFFlags::SPLICE_F_MOVE,
            )?;
            if written != total {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "partial splice reply to /dev/fuse",
                ));
            }

            Ok(loaded)
        })
        .await
        .unwrap()
    }

    /// register a passthrough backing file with the kernel, returning its
    /// backing id.
    pub fn backing_open(&self, fd: RawFd) -> io::Result<i32> {
        let map = fuse_backing_map {
            fd,
            flags: 0,
            padding: 0,
        };

        // Safety: map outlives the call and matches the ioctl definition
        let backing_id =
            unsafe { fuse_dev_ioc_backing_open(self.raw_fd(), &map) }.map_err(io::Error::from)?;

        Ok(backing_id)
    }

    pub fn backing_close(&self, backing_id: i32) {
        let backing_id = backing_id as u32;

        // Safety: plain integer argument
        if let Err(err) = unsafe { fuse_dev_ioc_backing_close(self.raw_fd(), &backing_id) } {
            warn!("close backing id {} failed {}", backing_id, err);
        }
    }

    pub fn notify_unmount(&self) {
        self.unmount_notify.notify();
    }

    fn raw_fd(&self) -> RawFd {
        match &self.mode {
            ConnectionMode::Block(connection) => connection.file.as_raw_fd(),
            ConnectionMode::NonBlock(connection) => connection.fd.as_raw_fd(),
        }
    }
}

impl AsFd for FuseConnection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match &self.mode {
            ConnectionMode::Block(connection) => connection.file.as_fd(),
            ConnectionMode::NonBlock(connection) => connection.fd.get_ref().as_fd(),
        }
    }
}

struct BlockFuseConnection {
    file: File,
    read: Mutex<Option<Vec<u8>>>,
}

impl BlockFuseConnection {
    fn new() -> io::Result<Self> {
        const DEV_FUSE: &str = "/dev/fuse";

        let file = OpenOptions::new().write(true).read(true).open(DEV_FUSE)?;

        Ok(Self {
            file,
            read: Mutex::new(Some(vec![0; 4096])),
        })
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner_buf_guard = self.read.lock().await;
        let mut inner_buf = inner_buf_guard.take().expect("read inner buf should exist");
        if inner_buf.len() < buf.len() {
            inner_buf.resize(buf.len(), 0);
        }
        let fd = self.file.as_raw_fd();

        let (inner_buf, res) = task::spawn_blocking(move || {
            // Safety: the session keeps the connection open for the whole
            // blocking read
            let fd = unsafe { BorrowedFd::borrow_raw(fd) };
            let res = unistd::read(fd.as_raw_fd(), &mut inner_buf).map_err(io::Error::from);

            (inner_buf, res)
        })
        .await
        .unwrap();

        match res {
            Err(err) => {
                inner_buf_guard.replace(inner_buf);

                Err(err)
            }

            Ok(n) => {
                buf[..n].copy_from_slice(&inner_buf[..n]);
                inner_buf_guard.replace(inner_buf);

                Ok(n)
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }

    async fn write_vectored(&self, header: &[u8], data: &[u8]) -> io::Result<usize> {
        let iov = [IoSlice::new(header), IoSlice::new(data)];

        nix::sys::uio::writev(self.file.as_fd(), &iov).map_err(io::Error::from)
    }
}

struct NonBlockFuseConnection {
    fd: AsyncFd<OwnedFd>,
    read: Mutex<()>,
}

impl NonBlockFuseConnection {
    #[cfg(all(target_os = "linux", feature = "unprivileged"))]
    async fn new_with_unprivileged(
        mount_options: MountOptions,
        mount_path: impl AsRef<Path>,
    ) -> io::Result<Self> {
        let (sock0, sock1) = match socket::socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        ) {
            Err(err) => return Err(err.into()),

            Ok((sock0, sock1)) => (sock0, sock1),
        };

        let binary_path = find_fusermount3()?;

        const ENV: &str = "_FUSE_COMMFD";

        let options = mount_options.build_with_unprivileged();

        debug!("mount options {:?}", options);

        let mount_path = mount_path.as_ref().as_os_str().to_os_string();

        let fd0 = sock0.as_raw_fd();
        let mut child = Command::new(binary_path)
            .env(ENV, fd0.to_string())
            .args(vec![OsString::from("-o"), options, mount_path])
            .spawn()?;

        if !child.wait().await?.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "fusermount run failed",
            ));
        }

        let fd1 = sock1.as_raw_fd();
        let fd = task::spawn_blocking(move || {
            // it seems 0 len buf still works well
            let mut buf = vec![];

            let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

            let mut bufs = [IoSliceMut::new(&mut buf)];

            let msg = match socket::recvmsg::<()>(
                fd1,
                &mut bufs[..],
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            ) {
                Err(err) => return Err(err.into()),

                Ok(msg) => msg,
            };

            let fd = if let Some(Ok(ControlMessageOwned::ScmRights(fds))) =
                msg.cmsgs().map(|cmsgs| cmsgs.next()).transpose()
            {
                if fds.is_empty() {
                    return Err(io::Error::new(ErrorKind::Other, "no fuse fd"));
                }

                fds[0]
            } else {
                return Err(io::Error::new(ErrorKind::Other, "get fuse fd failed"));
            };

            Ok(fd)
        })
        .await
        .unwrap()?;

        set_fd_non_blocking(fd)?;

        // Safety: fd is valid
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            read: Mutex::new(()),
        })
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let _guard = self.read.lock().await;

        loop {
            let mut read_guard = self.fd.readable().await?;

            if let Ok(result) =
                read_guard.try_io(|fd| unistd::read(fd.as_raw_fd(), buf).map_err(io::Error::from))
            {
                return result;
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut write_guard = self.fd.writable().await?;

            if let Ok(result) =
                write_guard.try_io(|fd| unistd::write(fd.as_fd(), buf).map_err(io::Error::from))
            {
                return result;
            }
        }
    }

    async fn write_vectored(&self, header: &[u8], data: &[u8]) -> io::Result<usize> {
        let iov = [IoSlice::new(header), IoSlice::new(data)];

        loop {
            let mut write_guard = self.fd.writable().await?;

            if let Ok(result) = write_guard
                .try_io(|fd| nix::sys::uio::writev(fd.as_fd(), &iov).map_err(io::Error::from))
            {
                return result;
            }
        }
    }
}

fn set_fd_non_blocking(fd: RawFd) -> io::Result<()> {
    // Safety: fcntl on a valid descriptor
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    // Safety: same
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// grow a pipe towards `size` so a whole reply fits; failure just means
/// more splice round trips.
#[cfg(target_os = "linux")]
fn grow_pipe(fd: RawFd, size: usize) {
    // Safety: fcntl on a valid descriptor
    unsafe {
        libc::fcntl(fd, libc::F_SETPIPE_SZ, size as libc::c_int);
    }
}

fn reserve_low_fds() -> io::Result<Vec<OwnedFd>> {
    let mut reserved = vec![];

    loop {
        let file = File::open("/dev/null")?;

        if file.as_raw_fd() > 3 {
            break;
        }

        reserved.push(OwnedFd::from(file));
    }

    Ok(reserved)
}
