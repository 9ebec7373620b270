use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_notify::Notify;

use crate::abi::fuse_in_header;

/// Request data
#[derive(Debug, Clone)]
pub struct Request {
    /// the unique identifier of this request.
    pub unique: u64,
    /// the uid of this request.
    pub uid: u32,
    /// the gid of this request.
    pub gid: u32,
    /// the pid of this request.
    pub pid: u32,
    /// the cancellation token of this request, set when the kernel sends an
    /// INTERRUPT for it.
    pub interrupt: Interrupt,
}

impl From<&fuse_in_header> for Request {
    fn from(header: &fuse_in_header) -> Self {
        Self {
            unique: header.unique,
            uid: header.uid,
            gid: header.gid,
            pid: header.pid,
            interrupt: Interrupt::new(),
        }
    }
}

/// Advisory cancellation token for one in-flight request.
///
/// Handlers may poll [`is_interrupted`] opportunistically or `select!` on
/// [`interrupted`] against their own work; when the flag is set at the time
/// the handler returns, the reply is EINTR and the handler result is
/// discarded. There are no forced aborts.
///
/// [`is_interrupted`]: Interrupt::is_interrupted
/// [`interrupted`]: Interrupt::interrupted
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptInner>,
}

#[derive(Default)]
struct InterruptInner {
    flag: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// whether the kernel has interrupted this request.
    pub fn is_interrupted(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// resolves when the request is interrupted; resolves immediately if it
    /// already was.
    pub async fn interrupted(&self) {
        if self.is_interrupted() {
            return;
        }

        self.inner.notify.notified().await
    }

    pub(crate) fn interrupt(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.notify.notify();
    }
}

impl Debug for Interrupt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupt")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn interrupt_sets_flag_and_wakes() {
        let interrupt = Interrupt::new();
        assert!(!interrupt.is_interrupted());

        let waiter = interrupt.clone();
        let task = tokio::spawn(async move { waiter.interrupted().await });

        interrupt.interrupt();
        task.await.unwrap();

        assert!(interrupt.is_interrupted());

        // resolves immediately once set
        interrupt.interrupted().await;
    }
}
