use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::dir::DirStream;

/// Per-open state, minted by the session on open/create/opendir and owned
/// by it until release/releasedir.
///
/// A handle may carry arbitrary author state and an OS file descriptor; the
/// descriptor is what enables zero-copy read replies and passthrough.
#[derive(Default)]
pub struct FileHandle {
    state: Option<Box<dyn Any + Send + Sync>>,
    fd: Option<Arc<OwnedFd>>,
}

impl FileHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// attach author state, retrievable with [`state`].
    ///
    /// [`state`]: FileHandle::state
    pub fn state(mut self, state: impl Any + Send + Sync) -> Self {
        self.state.replace(Box::new(state));

        self
    }

    /// attach a backing file descriptor.
    pub fn fd(mut self, fd: OwnedFd) -> Self {
        self.fd.replace(Arc::new(fd));

        self
    }

    /// the author state, if any was attached with a matching type.
    pub fn get_state<T: Any>(&self) -> Option<&T> {
        self.state.as_ref()?.downcast_ref()
    }

    /// the backing file descriptor, if any.
    pub fn get_fd(&self) -> Option<&Arc<OwnedFd>> {
        self.fd.as_ref()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }
}

impl Debug for FileHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("has_state", &self.state.is_some())
            .field("fd", &self.raw_fd())
            .finish()
    }
}

/// the cursor of an open directory: the stream plus the offset the next
/// entry will get.
pub(crate) struct DirCursor {
    pub offset: u64,
    pub stream: Option<Box<dyn DirStream>>,
}

#[derive(Clone)]
pub(crate) struct HandleEntry {
    pub inode: u64,
    pub handle: Arc<FileHandle>,
    /// passthrough backing id registered with the kernel, closed on release.
    pub backing_id: Option<i32>,
    pub dir_cursor: Arc<Mutex<DirCursor>>,
}

/// Concurrent map from handle id to per-open state; insert on open, remove
/// on release.
pub(crate) struct HandleTable {
    next_handle: AtomicU64,
    handles: Mutex<HashMap<u64, HandleEntry>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, inode: u64, handle: FileHandle, backing_id: Option<i32>) -> u64 {
        let fh = self.next_handle.fetch_add(1, Ordering::Relaxed);

        self.handles.lock().unwrap().insert(
            fh,
            HandleEntry {
                inode,
                handle: Arc::new(handle),
                backing_id,
                dir_cursor: Arc::new(Mutex::new(DirCursor {
                    offset: 0,
                    stream: None,
                })),
            },
        );

        fh
    }

    pub fn get(&self, fh: u64) -> Option<HandleEntry> {
        self.handles.lock().unwrap().get(&fh).cloned()
    }

    pub fn remove(&self, fh: u64) -> Option<HandleEntry> {
        self.handles.lock().unwrap().remove(&fh)
    }

    /// take every remaining handle, used on session shutdown.
    pub fn drain(&self) -> Vec<HandleEntry> {
        self.handles.lock().unwrap().drain().map(|(_, v)| v).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_distinct_ids() {
        let table = HandleTable::new();

        let a = table.insert(2, FileHandle::new(), None);
        let b = table.insert(2, FileHandle::new(), None);
        assert_ne!(a, b);

        assert!(table.get(a).is_some());
        assert!(table.remove(a).is_some());
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());
    }

    #[test]
    fn state_downcast() {
        let handle = FileHandle::new().state(42u32);

        assert_eq!(handle.get_state::<u32>(), Some(&42));
        assert_eq!(handle.get_state::<String>(), None);
    }
}
