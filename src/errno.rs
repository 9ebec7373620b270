use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io::Error as IoError;
use std::os::raw::c_int;

/// An errno as the FUSE protocol reports it: `0` is success, everything else
/// is a positive error number that is negated in the reply header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Errno(pub c_int);

impl Errno {
    pub const fn new_not_exist() -> Self {
        Self(libc::ENOENT)
    }

    pub const fn new_exist() -> Self {
        Self(libc::EEXIST)
    }

    pub const fn new_is_dir() -> Self {
        Self(libc::EISDIR)
    }

    pub const fn new_not_dir() -> Self {
        Self(libc::ENOTDIR)
    }

    pub const fn new_interrupted() -> Self {
        Self(libc::EINTR)
    }

    pub fn is_not_exist(&self) -> bool {
        self.0 == libc::ENOENT
    }

    pub fn is_exist(&self) -> bool {
        self.0 == libc::EEXIST
    }

    pub fn is_dir(&self) -> bool {
        self.0 == libc::EISDIR
    }

    pub fn is_not_dir(&self) -> bool {
        self.0 == libc::ENOTDIR
    }

    /// The sentinel returned by unimplemented [`NodeOps`] methods; the
    /// dispatcher replaces it with the documented per-opcode default.
    ///
    /// [`NodeOps`]: crate::node::NodeOps
    pub(crate) fn is_not_implemented(&self) -> bool {
        self.0 == libc::ENOSYS
    }
}

impl From<Errno> for c_int {
    fn from(errno: Errno) -> Self {
        -errno.0
    }
}

impl From<c_int> for Errno {
    fn from(errno: c_int) -> Self {
        Self(errno)
    }
}

impl From<nix::errno::Errno> for Errno {
    fn from(errno: nix::errno::Errno) -> Self {
        Self(errno as c_int)
    }
}

/// When raw os error is undefined, will return Errno(libc::EIO)
impl From<IoError> for Errno {
    fn from(err: IoError) -> Self {
        if let Some(errno) = err.raw_os_error() {
            Self(errno)
        } else {
            Self(libc::EIO)
        }
    }
}

impl Display for Errno {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "errno is {}", self.0)
    }
}

impl Error for Errno {}
