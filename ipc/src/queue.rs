use std::collections::VecDeque;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

use nix::errno::Errno;
use tracing::trace;

use crate::error::IpcError;

/// Pollable wake-up flag: an eventfd in semaphore mode, one `raise` per
/// queued item so level-triggered polls keep firing until the queue drains.
pub(crate) struct EventNotifier(OwnedFd);

impl EventNotifier {
    pub fn new() -> Result<Self, IpcError> {
        let fd = unsafe {
            libc::eventfd(
                0,
                libc::EFD_CLOEXEC | libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE,
            )
        };
        if fd < 0 {
            return Err(Errno::last().into());
        }
        Ok(EventNotifier(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    pub fn raise(&self) {
        let one = 1u64.to_ne_bytes();
        let ret = unsafe { libc::write(self.0.as_raw_fd(), one.as_ptr() as *const libc::c_void, 8) };
        if ret < 0 {
            trace!("eventfd raise failed: {}", Errno::last());
        }
    }

    pub fn ack(&self) {
        let mut buf = [0u8; 8];
        let ret = unsafe {
            libc::read(
                self.0.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                8,
            )
        };
        if ret < 0 && Errno::last() != Errno::EAGAIN {
            trace!("eventfd ack failed: {}", Errno::last());
        }
    }
}

impl AsRawFd for EventNotifier {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// The only channel between application threads and the processor thread.
pub(crate) struct RequestQueue<R> {
    items: Mutex<VecDeque<R>>,
    notifier: EventNotifier,
}

impl<R> RequestQueue<R> {
    pub fn new() -> Result<Self, IpcError> {
        Ok(RequestQueue {
            items: Mutex::new(VecDeque::new()),
            notifier: EventNotifier::new()?,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.notifier.as_raw_fd()
    }

    pub fn push_back(&self, request: R) {
        self.items.lock().unwrap().push_back(request);
        self.notifier.raise();
    }

    pub fn pop(&self) -> Option<R> {
        self.notifier.ack();
        self.items.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    /// Drops matching requests; the eventfd keeps its raised count, leaving
    /// at worst a few empty pops behind.
    pub fn remove_if(&self, predicate: impl Fn(&R) -> bool) {
        self.items.lock().unwrap().retain(|r| !predicate(r));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_fifo_order() {
        let q: RequestQueue<u32> = RequestQueue::new().unwrap();
        q.push_back(1);
        q.push_back(2);
        q.push_back(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn remove_if_filters() {
        let q: RequestQueue<u32> = RequestQueue::new().unwrap();
        q.push_back(1);
        q.push_back(2);
        q.push_back(3);
        q.remove_if(|v| *v == 2);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(3));
    }
}
