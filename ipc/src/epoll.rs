use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use tracing::{trace, warn};

use crate::error::IpcError;
use crate::queue::EventNotifier;

/// Bitset over readable/writable/hangup/remote-hangup/error.
pub type Events = EpollFlags;

/// Returning false removes the fd from the poll.
pub type EventHandler = Box<dyn FnMut(RawFd, Events) -> bool + Send>;

/// Level-triggered fd reactor. The poll never owns the registered fds; the
/// registrant keeps them alive for as long as they are registered.
pub struct EventPoll {
    epoll: Epoll,
    handlers: Mutex<HashMap<RawFd, Arc<Mutex<EventHandler>>>>,
}

impl EventPoll {
    pub fn new() -> Result<Self, IpcError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(EventPoll {
            epoll,
            handlers: Mutex::new(HashMap::new()),
        })
    }

    /// The epoll fd itself: readable iff a `dispatch_iteration(0)` would do
    /// work, which lets one poll nest inside another reactor.
    pub fn poll_handle(&self) -> RawFd {
        self.epoll.0.as_raw_fd()
    }

    pub fn add_fd(&self, fd: RawFd, events: Events, handler: EventHandler) -> Result<(), IpcError> {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(&fd) {
            return Err(IpcError::FdAlreadyRegistered);
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.add(borrowed, EpollEvent::new(events, fd as u64))?;
        handlers.insert(fd, Arc::new(Mutex::new(handler)));
        trace!("added fd {} to poll", fd);
        Ok(())
    }

    pub fn modify_fd(&self, fd: RawFd, events: Events) -> Result<(), IpcError> {
        let handlers = self.handlers.lock().unwrap();
        if !handlers.contains_key(&fd) {
            return Err(IpcError::FdNotFound);
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .modify(borrowed, &mut EpollEvent::new(events, fd as u64))?;
        Ok(())
    }

    /// Removing an fd that is not registered is a no-op.
    pub fn remove_fd(&self, fd: RawFd) {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.remove(&fd).is_some() {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            if let Err(e) = self.epoll.delete(borrowed) {
                // the fd may already be closed; the kernel dropped it then
                trace!("epoll delete of fd {} failed: {}", fd, e);
            }
        }
    }

    /// One poll round; returns whether at least one handler ran. Must not be
    /// called concurrently with itself on the same instance. Registration
    /// changes made by handlers take effect on the next iteration.
    pub fn dispatch_iteration(&self, timeout_ms: i32) -> Result<bool, IpcError> {
        const MAX_EVENTS: usize = 16;
        let mut events = [EpollEvent::empty(); MAX_EVENTS];

        let count = {
            let ret = unsafe {
                libc::epoll_wait(
                    self.epoll.0.as_raw_fd(),
                    events.as_mut_ptr() as *mut libc::epoll_event,
                    MAX_EVENTS as i32,
                    timeout_ms,
                )
            };
            if ret < 0 {
                let errno = Errno::last();
                if errno == Errno::EINTR {
                    // interrupted waits count as an empty iteration
                    return Ok(false);
                }
                return Err(errno.into());
            }
            ret as usize
        };

        let mut ran = false;
        for event in &events[..count] {
            let fd = event.data() as RawFd;
            let observed = event.events();

            // take a reference to the handler without holding the table lock
            // while it runs, so handlers can add and remove fds freely
            let handler = match self.handlers.lock().unwrap().get(&fd) {
                Some(h) => Arc::clone(h),
                // removed by an earlier handler this round
                None => continue,
            };

            ran = true;
            let keep = {
                let mut handler = handler.lock().unwrap();
                catch_unwind(AssertUnwindSafe(|| handler(fd, observed))).unwrap_or_else(|_| {
                    warn!("event handler for fd {} panicked", fd);
                    true
                })
            };
            if !keep {
                self.remove_fd(fd);
            }
        }
        Ok(ran)
    }
}

/// Drives an [`EventPoll`] from a dedicated thread until stopped.
pub struct ThreadDispatcher {
    poll: Arc<EventPoll>,
    stopping: Arc<AtomicBool>,
    wakeup: Arc<EventNotifier>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadDispatcher {
    pub fn new(poll: Arc<EventPoll>) -> Result<Self, IpcError> {
        let stopping = Arc::new(AtomicBool::new(false));
        let wakeup = Arc::new(EventNotifier::new()?);

        {
            let wakeup = Arc::clone(&wakeup);
            poll.add_fd(
                wakeup.as_raw_fd(),
                EpollFlags::EPOLLIN,
                Box::new(move |_, _| {
                    wakeup.ack();
                    true
                }),
            )?;
        }

        let thread = {
            let poll = Arc::clone(&poll);
            let stopping = Arc::clone(&stopping);
            std::thread::spawn(move || {
                while !stopping.load(Ordering::Acquire) {
                    if let Err(e) = poll.dispatch_iteration(-1) {
                        warn!("poll dispatch failed: {}", e);
                        break;
                    }
                }
                trace!("dispatcher thread exiting");
            })
        };

        Ok(ThreadDispatcher {
            poll,
            stopping,
            wakeup,
            thread: Some(thread),
        })
    }

    pub fn poll(&self) -> &Arc<EventPoll> {
        &self.poll
    }

    pub fn stop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        self.wakeup.raise();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.poll.remove_fd(self.wakeup.as_raw_fd());
    }
}

impl Drop for ThreadDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{pipe, write};
    use std::os::fd::AsFd;

    #[test]
    fn dispatches_readable_fd() {
        let poll = EventPoll::new().unwrap();
        let (rx, tx) = pipe().unwrap();
        let hits = Arc::new(AtomicBool::new(false));

        let seen = Arc::clone(&hits);
        poll.add_fd(
            rx.as_raw_fd(),
            EpollFlags::EPOLLIN,
            Box::new(move |_, ev| {
                assert!(ev.contains(EpollFlags::EPOLLIN));
                seen.store(true, Ordering::SeqCst);
                false
            }),
        )
        .unwrap();

        assert!(!poll.dispatch_iteration(0).unwrap());
        write(tx.as_fd(), b"x").unwrap();
        assert!(poll.dispatch_iteration(100).unwrap());
        assert!(hits.load(Ordering::SeqCst));

        // handler returned false: fd is gone, next round is idle
        write(tx.as_fd(), b"y").unwrap();
        assert!(!poll.dispatch_iteration(0).unwrap());
    }

    #[test]
    fn double_add_fails() {
        let poll = EventPoll::new().unwrap();
        let (rx, _tx) = pipe().unwrap();
        poll.add_fd(rx.as_raw_fd(), EpollFlags::EPOLLIN, Box::new(|_, _| true))
            .unwrap();
        assert!(matches!(
            poll.add_fd(rx.as_raw_fd(), EpollFlags::EPOLLIN, Box::new(|_, _| true)),
            Err(IpcError::FdAlreadyRegistered)
        ));
        // removing twice is fine
        poll.remove_fd(rx.as_raw_fd());
        poll.remove_fd(rx.as_raw_fd());
    }

    #[test]
    fn poll_handle_signals_pending_work() {
        let outer = EventPoll::new().unwrap();
        let inner = Arc::new(EventPoll::new().unwrap());
        let (rx, tx) = pipe().unwrap();

        inner
            .add_fd(rx.as_raw_fd(), EpollFlags::EPOLLIN, Box::new(|_, _| true))
            .unwrap();

        let nested = Arc::clone(&inner);
        let fired = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&fired);
        outer
            .add_fd(
                inner.poll_handle(),
                EpollFlags::EPOLLIN,
                Box::new(move |_, _| {
                    nested.dispatch_iteration(0).unwrap();
                    seen.store(true, Ordering::SeqCst);
                    true
                }),
            )
            .unwrap();

        write(tx.as_fd(), b"x").unwrap();
        assert!(outer.dispatch_iteration(100).unwrap());
        assert!(fired.load(Ordering::SeqCst));
    }
}
