//! Handle lifecycle: the state machine every native resource wrapper shares.
//!
//! A handle owns one native resource binding (a file descriptor) and the
//! rules for tearing it down: once closing begins no new operation may be
//! submitted, already-submitted requests still resolve, the native close
//! happens exactly once, and every close continuation ever registered runs
//! exactly once, in registration order, after the native close.
//!
//! Streams, listeners, and poll watchers all embed a [`HandleCore`] and
//! expose the public [`Handle`] trait over it.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::error::{Result, TidewayError};
use crate::log_debug;
use crate::reactor::Reactor;

/// Lifecycle state of a handle.
///
/// Transitions are irreversible: `Active → Closing → Closed`. Construction
/// binds the native resource, so a handle is already `Active` when its
/// constructor returns; an unbound state is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// The native resource is bound and operations may be submitted.
    Active,
    /// Close has been requested; no new operations are accepted, but
    /// already-submitted requests still resolve.
    Closing,
    /// The native close has completed and every close continuation has run.
    Closed,
}

/// The lifecycle contract shared by every handle type.
pub trait Handle {
    /// Current lifecycle state.
    fn state(&self) -> HandleState;

    /// `true` while operations may still be submitted.
    fn is_active(&self) -> bool {
        self.state() == HandleState::Active
    }

    /// Requests close. Idempotent: calling it again while closing or closed
    /// is not an error.
    fn close(&self);

    /// Requests close and registers `on_complete` to run after the native
    /// close has finished.
    ///
    /// Continuations registered while the handle is already closing (or
    /// closed) are still honored exactly once, in registration order.
    fn close_with(&self, on_complete: Box<dyn FnOnce()>);
}

/// Shared lifecycle state embedded in every concrete handle.
pub(crate) struct HandleCore {
    reactor: Reactor,
    fd: RawFd,
    owns_fd: bool,
    state: Cell<HandleState>,
    close_queue: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    /// Runs after the close-continuation queue drains; used by wrappers to
    /// drop observer lists that may capture the wrapper itself.
    teardown: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl HandleCore {
    /// Binds `fd` to `reactor` as a live handle.
    ///
    /// `owns_fd` decides whether close finalization closes the descriptor or
    /// leaves it to the caller (poll watchers never own theirs).
    pub(crate) fn new(reactor: &Reactor, fd: RawFd, owns_fd: bool) -> Rc<Self> {
        reactor.register_handle();
        Rc::new(Self {
            reactor: reactor.clone(),
            fd,
            owns_fd,
            state: Cell::new(HandleState::Active),
            close_queue: RefCell::new(VecDeque::new()),
            teardown: RefCell::new(None),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn state(&self) -> HandleState {
        self.state.get()
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Guard for every public operation: fails once closing has begun.
    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.state.get() {
            HandleState::Active => Ok(()),
            _ => Err(TidewayError::HandleClosed),
        }
    }

    pub(crate) fn set_teardown(&self, teardown: Box<dyn FnOnce()>) {
        *self.teardown.borrow_mut() = Some(teardown);
    }

    /// Enters `Closing` (idempotently) and queues `continuation`.
    ///
    /// The first call schedules the native close with the reactor; the
    /// finalizer runs at the end of a reactor iteration, never inside the
    /// caller. A continuation registered after the handle is fully closed
    /// runs immediately, since the close it would wait for already finished.
    pub(crate) fn close_with(this: &Rc<Self>, continuation: Option<Box<dyn FnOnce()>>) {
        match this.state.get() {
            HandleState::Closed => {
                if let Some(continuation) = continuation {
                    continuation();
                }
            }
            HandleState::Closing => {
                if let Some(continuation) = continuation {
                    this.close_queue.borrow_mut().push_back(continuation);
                }
            }
            HandleState::Active => {
                log_debug!("handle", "closing fd={}", this.fd);
                this.state.set(HandleState::Closing);
                if let Some(continuation) = continuation {
                    this.close_queue.borrow_mut().push_back(continuation);
                }
                let core = Rc::clone(this);
                this.reactor
                    .schedule_close(this.fd, this.owns_fd, Box::new(move || core.finalize()));
            }
        }
    }

    /// Invoked by the reactor exactly once, after the native close.
    fn finalize(&self) {
        self.state.set(HandleState::Closed);
        loop {
            let next = self.close_queue.borrow_mut().pop_front();
            match next {
                Some(continuation) => continuation(),
                None => break,
            }
        }
        if let Some(teardown) = self.teardown.borrow_mut().take() {
            teardown();
        }
    }
}

impl std::fmt::Debug for HandleCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleCore")
            .field("fd", &self.fd)
            .field("state", &self.state.get())
            .field("queued_continuations", &self.close_queue.borrow().len())
            .finish()
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn socket_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn close_continuations_run_once_in_order() {
        let reactor = Reactor::new().unwrap();
        let (a, b) = socket_pair();
        let core = HandleCore::new(&reactor, a, true);

        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in 1..=3 {
            let sink = Rc::clone(&order);
            HandleCore::close_with(&core, Some(Box::new(move || sink.borrow_mut().push(tag))));
        }
        assert_eq!(core.state(), HandleState::Closing);

        reactor.run().unwrap();
        assert_eq!(core.state(), HandleState::Closed);
        assert_eq!(*order.borrow(), vec![1, 2, 3]);

        unsafe {
            libc::close(b);
        }
    }

    #[test]
    fn operations_fail_once_closing() {
        let reactor = Reactor::new().unwrap();
        let (a, b) = socket_pair();
        let core = HandleCore::new(&reactor, a, true);

        assert!(core.ensure_active().is_ok());
        HandleCore::close_with(&core, None);
        assert!(matches!(
            core.ensure_active(),
            Err(TidewayError::HandleClosed)
        ));

        reactor.run().unwrap();
        assert!(matches!(
            core.ensure_active(),
            Err(TidewayError::HandleClosed)
        ));

        unsafe {
            libc::close(b);
        }
    }

    #[test]
    fn continuation_after_closed_runs_immediately() {
        let reactor = Reactor::new().unwrap();
        let (a, b) = socket_pair();
        let core = HandleCore::new(&reactor, a, true);

        HandleCore::close_with(&core, None);
        reactor.run().unwrap();

        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        HandleCore::close_with(&core, Some(Box::new(move || flag.set(true))));
        assert!(ran.get());

        unsafe {
            libc::close(b);
        }
    }

    #[test]
    fn teardown_runs_after_continuations() {
        let reactor = Reactor::new().unwrap();
        let (a, b) = socket_pair();
        let core = HandleCore::new(&reactor, a, true);

        let order = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&order);
        core.set_teardown(Box::new(move || sink.borrow_mut().push("teardown")));

        let sink = Rc::clone(&order);
        HandleCore::close_with(&core, Some(Box::new(move || sink.borrow_mut().push("closed"))));
        reactor.run().unwrap();

        assert_eq!(*order.borrow(), vec!["closed", "teardown"]);

        unsafe {
            libc::close(b);
        }
    }
}
