use std::ffi::OsString;
use std::os::unix::io::RawFd;

use nix::unistd;

/// mount options.
#[derive(Debug, Clone)]
pub struct MountOptions {
    // mount syscall data field option
    pub(crate) uid: Option<u32>,
    pub(crate) gid: Option<u32>,

    pub(crate) fs_name: Option<OsString>,

    // default 40000
    pub(crate) rootmode: Option<u32>,

    pub(crate) allow_root: bool,
    pub(crate) allow_other: bool,

    pub(crate) read_only: Option<bool>,

    // when run in privileged mode, it is lib self option
    pub(crate) nonempty: bool,

    // lib self option
    pub(crate) default_permissions: bool,

    pub(crate) dont_mask: bool,

    pub(crate) write_back: bool,

    pub(crate) handle_killpriv: bool,

    pub(crate) passthrough: bool,

    pub(crate) single_reader: bool,

    pub(crate) reader_count: usize,

    pub(crate) no_splice: bool,

    pub(crate) custom_options: Option<OsString>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            uid: None,
            gid: None,
            fs_name: None,
            rootmode: None,
            allow_root: false,
            allow_other: false,
            read_only: None,
            nonempty: false,
            default_permissions: false,
            dont_mask: false,
            write_back: false,
            handle_killpriv: false,
            passthrough: false,
            single_reader: false,
            reader_count: 2,
            no_splice: false,
            custom_options: None,
        }
    }
}

impl MountOptions {
    /// set fuse filesystem mount `user_id`, default is current uid.
    pub fn uid(mut self, uid: u32) -> Self {
        self.uid.replace(uid);

        self
    }

    /// set fuse filesystem mount `group_id`, default is current gid.
    pub fn gid(mut self, gid: u32) -> Self {
        self.gid.replace(gid);

        self
    }

    /// set fuse filesystem name, default is **fuse**.
    pub fn fs_name(mut self, name: impl Into<OsString>) -> Self {
        self.fs_name.replace(name.into());

        self
    }

    /// set fuse filesystem `rootmode`, default is 40000.
    pub fn rootmode(mut self, rootmode: u32) -> Self {
        self.rootmode.replace(rootmode);

        self
    }

    /// set fuse filesystem `allow_root` mount option, default is disable.
    pub fn allow_root(mut self, allow_root: bool) -> Self {
        self.allow_root = allow_root;

        self
    }

    /// set fuse filesystem `allow_other` mount option, default is disable.
    pub fn allow_other(mut self, allow_other: bool) -> Self {
        self.allow_other = allow_other;

        self
    }

    /// set fuse filesystem `ro` mount option, default is disable.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only.replace(read_only);

        self
    }

    /// allow fuse filesystem mount on a non-empty directory, default is not allowed.
    pub fn nonempty(mut self, nonempty: bool) -> Self {
        self.nonempty = nonempty;

        self
    }

    /// set fuse filesystem `default_permissions` mount option, default is disable.
    ///
    /// When `default_permissions` is set, the kernel checks permissions
    /// itself and the `access` operation is useless.
    pub fn default_permissions(mut self, default_permissions: bool) -> Self {
        self.default_permissions = default_permissions;

        self
    }

    /// don't apply umask to file mode on create operations, default is disable.
    pub fn dont_mask(mut self, dont_mask: bool) -> Self {
        self.dont_mask = dont_mask;

        self
    }

    /// enable write back cache for buffered writes, default is disable.
    pub fn write_back(mut self, write_back: bool) -> Self {
        self.write_back = write_back;

        self
    }

    /// fs handle killing `suid`/`sgid`/`cap` on `write`/`chown`/`trunc`, default is disable.
    pub fn handle_killpriv(mut self, handle_killpriv: bool) -> Self {
        self.handle_killpriv = handle_killpriv;

        self
    }

    /// negotiate kernel passthrough for nodes that expose a backing fd,
    /// default is disable. Requires protocol 7.40 on the kernel side.
    pub fn passthrough(mut self, passthrough: bool) -> Self {
        self.passthrough = passthrough;

        self
    }

    /// run a single request reader instead of concurrent ones.
    ///
    /// On some platforms multiple readers race with unmount; non-Linux
    /// targets are always single-reader regardless of this option.
    pub fn single_reader(mut self, single_reader: bool) -> Self {
        self.single_reader = single_reader;

        self
    }

    /// how many concurrent request readers to run, default is 2. Only
    /// meaningful on Linux and when [`single_reader`] is off.
    ///
    /// [`single_reader`]: MountOptions::single_reader
    pub fn reader_count(mut self, reader_count: usize) -> Self {
        self.reader_count = reader_count.max(1);

        self
    }

    /// never splice read replies, always copy through userspace. Default is
    /// to splice when the kernel negotiated it.
    pub fn no_splice(mut self, no_splice: bool) -> Self {
        self.no_splice = no_splice;

        self
    }

    /// set custom options for fuse filesystem, the custom options will be used in mount
    pub fn custom_options(mut self, custom_options: impl Into<OsString>) -> Self {
        self.custom_options = Some(custom_options.into());

        self
    }

    pub(crate) fn build(&self, fd: RawFd) -> OsString {
        let mut opts = vec![
            format!("fd={}", fd),
            format!("user_id={}", self.uid.unwrap_or(unistd::getuid().as_raw())),
            format!("group_id={}", self.gid.unwrap_or(unistd::getgid().as_raw())),
            format!("rootmode={}", self.rootmode.unwrap_or(40000)),
        ];

        if self.allow_root {
            opts.push("allow_root".to_string());
        }

        if self.allow_other {
            opts.push("allow_other".to_string());
        }

        if matches!(self.read_only, Some(true)) {
            opts.push("ro".to_string());
        }

        if self.default_permissions {
            opts.push("default_permissions".to_string());
        }

        let mut options = OsString::from(opts.join(","));

        if let Some(custom_options) = &self.custom_options {
            options.push(",");
            options.push(custom_options);
        }

        options
    }

    #[cfg(feature = "unprivileged")]
    pub(crate) fn build_with_unprivileged(&self) -> OsString {
        let mut opts = vec![
            format!("user_id={}", self.uid.unwrap_or(unistd::getuid().as_raw())),
            format!("group_id={}", self.gid.unwrap_or(unistd::getgid().as_raw())),
            format!("rootmode={}", self.rootmode.unwrap_or(40000)),
            format!(
                "fsname={:?}",
                self.fs_name.as_ref().unwrap_or(&OsString::from("fuse"))
            ),
        ];

        if self.allow_root {
            opts.push("allow_root".to_string());
        }

        if self.allow_other {
            opts.push("allow_other".to_string());
        }

        if matches!(self.read_only, Some(true)) {
            opts.push("ro".to_string());
        }

        if self.default_permissions {
            opts.push("default_permissions".to_string());
        }

        let mut options = OsString::from(opts.join(","));

        if let Some(custom_options) = &self.custom_options {
            options.push(",");
            options.push(custom_options);
        }

        options
    }

    /// effective number of reader tasks for this platform.
    pub(crate) fn effective_readers(&self) -> usize {
        // OSX and FreeBSD have races when multiple routines read from the
        // FUSE device: on unmount, sometimes some reads do not error out,
        // meaning that unmount will hang.
        if cfg!(not(target_os = "linux")) || self.single_reader {
            1
        } else {
            self.reader_count
        }
    }
}
