//! Readiness watching for descriptors the application owns.
//!
//! A [`PollWatcher`] attaches reactor-driven readiness notifications to an
//! arbitrary file descriptor without taking it over: the watcher never reads,
//! writes, or closes the descriptor, it only reports edges. Useful for
//! integrating foreign descriptors (timers, signals, devices, sockets owned
//! by other libraries) into the loop.

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::error::{Result, TidewayError};
use crate::events::{Listeners, SubId};
use crate::handle::{Handle, HandleCore, HandleState};
use crate::reactor::Reactor;

/// Readiness classes a watcher can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollEvents {
    bits: u8,
}

impl PollEvents {
    /// The descriptor is readable.
    pub const READABLE: PollEvents = PollEvents { bits: 1 };
    /// The descriptor is writable.
    pub const WRITABLE: PollEvents = PollEvents { bits: 2 };

    /// No readiness class.
    pub fn empty() -> Self {
        Self::default()
    }

    /// `true` when no class is set.
    pub fn is_empty(self) -> bool {
        self.bits == 0
    }

    /// `true` when the readable class is set.
    pub fn readable(self) -> bool {
        self.bits & Self::READABLE.bits != 0
    }

    /// `true` when the writable class is set.
    pub fn writable(self) -> bool {
        self.bits & Self::WRITABLE.bits != 0
    }

    /// `true` when every class in `other` is present in `self`.
    pub fn contains(self, other: PollEvents) -> bool {
        self.bits & other.bits == other.bits
    }
}

impl std::ops::BitOr for PollEvents {
    type Output = PollEvents;

    fn bitor(self, rhs: PollEvents) -> PollEvents {
        PollEvents {
            bits: self.bits | rhs.bits,
        }
    }
}

impl std::ops::BitOrAssign for PollEvents {
    fn bitor_assign(&mut self, rhs: PollEvents) {
        self.bits |= rhs.bits;
    }
}

/// Reactor-driven readiness notifications for a caller-owned descriptor.
///
/// The watcher is a [`Handle`] (exactly-once close, closed-handle guards)
/// but does not own the descriptor; closing the watcher leaves the
/// descriptor open.
pub struct PollWatcher {
    inner: Rc<WatcherInner>,
}

static_assertions::assert_not_impl_any!(PollWatcher: Send, Sync);

struct WatcherInner {
    handle: Rc<HandleCore>,
    events: Listeners<PollEvents>,
    armed: Cell<bool>,
}

impl PollWatcher {
    /// Wraps `fd` for readiness watching on `reactor`.
    ///
    /// # Errors
    ///
    /// Fails with an `InvalidInput` I/O error for a negative descriptor.
    pub fn new(reactor: &Reactor, fd: RawFd) -> Result<Self> {
        if fd < 0 {
            return Err(TidewayError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "poll watcher requires a valid file descriptor",
            )));
        }
        let inner = Rc::new(WatcherInner {
            handle: HandleCore::new(reactor, fd, false),
            events: Listeners::new(),
            armed: Cell::new(false),
        });

        let weak = Rc::downgrade(&inner);
        inner.handle.set_teardown(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.events.clear();
            }
        }));

        Ok(Self { inner })
    }

    /// Arms (or rearms with a new mask) readiness reporting.
    ///
    /// Each readiness edge in `interest` emits one event notification
    /// carrying the classes that were ready.
    pub fn start(&self, interest: PollEvents) -> Result<()> {
        self.inner.handle.ensure_active()?;
        if interest.is_empty() {
            return Err(TidewayError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "poll watcher interest must name at least one readiness class",
            )));
        }

        self.inner.armed.set(true);
        let weak = Rc::downgrade(&self.inner);
        self.inner.handle.reactor().watch_level(
            self.inner.handle.fd(),
            interest.readable(),
            interest.writable(),
            Box::new(move |readable, writable| {
                let Some(inner) = weak.upgrade() else { return };
                let mut ready = PollEvents::empty();
                if readable {
                    ready |= PollEvents::READABLE;
                }
                if writable {
                    ready |= PollEvents::WRITABLE;
                }
                if !ready.is_empty() {
                    inner.events.emit(&ready);
                }
            }),
        );
        Ok(())
    }

    /// Disarms readiness reporting and drops the event handlers.
    ///
    /// Infallible and idempotent, like pausing a stream: safe during
    /// teardown.
    pub fn stop(&self) {
        if self.inner.handle.state() != HandleState::Active {
            return;
        }
        if self.inner.armed.replace(false) {
            self.inner.handle.reactor().unwatch(self.inner.handle.fd());
        }
        self.inner.events.clear();
    }

    /// Subscribes to readiness notifications.
    pub fn on_event(&self, mut handler: impl FnMut(PollEvents) + 'static) -> SubId {
        self.inner.events.subscribe(Box::new(move |ready| handler(*ready)))
    }

    /// Removes a readiness handler. Returns `false` if it was already gone.
    pub fn remove_event_handler(&self, id: SubId) -> bool {
        self.inner.events.unsubscribe(id)
    }
}

impl Handle for PollWatcher {
    fn state(&self) -> HandleState {
        self.inner.handle.state()
    }

    fn close(&self) {
        HandleCore::close_with(&self.inner.handle, None);
    }

    fn close_with(&self, on_complete: Box<dyn FnOnce()>) {
        HandleCore::close_with(&self.inner.handle, Some(on_complete));
    }
}

impl Drop for PollWatcher {
    fn drop(&mut self) {
        if self.inner.handle.state() == HandleState::Active {
            HandleCore::close_with(&self.inner.handle, None);
        }
    }
}

impl std::fmt::Debug for PollWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollWatcher")
            .field("fd", &self.inner.handle.fd())
            .field("state", &self.inner.handle.state())
            .field("armed", &self.inner.armed.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_bits_compose() {
        let both = PollEvents::READABLE | PollEvents::WRITABLE;
        assert!(both.readable());
        assert!(both.writable());
        assert!(both.contains(PollEvents::READABLE));
        assert!(both.contains(PollEvents::WRITABLE));

        assert!(!PollEvents::READABLE.writable());
        assert!(!PollEvents::empty().contains(PollEvents::READABLE));
        assert!(PollEvents::WRITABLE.contains(PollEvents::empty()));
    }

    #[cfg(target_os = "linux")]
    mod with_reactor {
        use super::*;
        use std::cell::RefCell;

        #[test]
        fn reports_readability_without_consuming() {
            let reactor = Reactor::new().unwrap();
            let mut fds = [0 as RawFd; 2];
            let ret =
                unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
            assert_eq!(ret, 0);
            let (read_fd, write_fd) = (fds[0], fds[1]);

            let watcher = PollWatcher::new(&reactor, read_fd).unwrap();
            let seen = Rc::new(RefCell::new(Vec::new()));
            let sink = Rc::clone(&seen);
            watcher.on_event(move |ready| sink.borrow_mut().push(ready));
            watcher.start(PollEvents::READABLE).unwrap();

            let wrote = unsafe { libc::write(write_fd, b"x".as_ptr().cast(), 1) };
            assert_eq!(wrote, 1);

            while seen.borrow().is_empty() {
                reactor.run_once().unwrap();
            }
            assert!(seen.borrow()[0].readable());

            // The watcher never drained the pipe.
            let mut byte = [0u8; 1];
            let n = unsafe { libc::read(read_fd, byte.as_mut_ptr().cast(), 1) };
            assert_eq!(n, 1);

            watcher.close();
            reactor.run().unwrap();

            // Closing the watcher left the descriptor usable.
            let wrote = unsafe { libc::write(write_fd, b"y".as_ptr().cast(), 1) };
            assert_eq!(wrote, 1);

            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
        }

        #[test]
        fn stop_silences_and_start_rearms() {
            let reactor = Reactor::new().unwrap();
            let mut fds = [0 as RawFd; 2];
            let ret =
                unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
            assert_eq!(ret, 0);
            let (read_fd, write_fd) = (fds[0], fds[1]);

            let watcher = PollWatcher::new(&reactor, write_fd).unwrap();
            let count = Rc::new(Cell::new(0u32));
            let counter = Rc::clone(&count);
            watcher.on_event(move |_| counter.set(counter.get() + 1));
            watcher.start(PollEvents::WRITABLE).unwrap();

            while count.get() == 0 {
                reactor.run_once().unwrap();
            }

            watcher.stop();
            let silenced_at = count.get();
            reactor.run_nowait().unwrap();
            assert_eq!(count.get(), silenced_at);

            // Stop dropped the handlers; rearm with a fresh one.
            let counter = Rc::clone(&count);
            watcher.on_event(move |_| counter.set(counter.get() + 10));
            watcher.start(PollEvents::WRITABLE).unwrap();
            while count.get() == silenced_at {
                reactor.run_once().unwrap();
            }

            watcher.close();
            reactor.run().unwrap();
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
        }
    }
}
