//! The single-threaded event loop.
//!
//! A [`Reactor`] owns the readiness poller, the table of in-flight requests,
//! and one entry per watched file descriptor. Handles submit work and the
//! reactor delivers the outcomes: standing read subscriptions get their
//! chunks during event servicing, one-shot operations (connect, write,
//! shutdown) complete through the request table in strict per-fd FIFO order,
//! and close finalization always runs at the end of an iteration so close
//! continuations never fire inside the call that requested them.
//!
//! Everything runs on the thread that calls [`Reactor::run`]; there is no
//! locking anywhere in this module, only `RefCell` discipline: no borrow is
//! held across an invocation of user code.

mod poller;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::buffer::{BufferPool, ByteLease};
use crate::config::LoopConfig;
use crate::error::{Result, TidewayError};
use crate::request::{OpKind, RequestTable};
use crate::status;
use crate::{log_debug, log_warn};

use poller::{Interest, Poller};

/// Handle to one event loop.
///
/// Cloning is cheap and shares the same loop; every handle type keeps a clone
/// so the loop outlives anything still attached to it. The reactor is
/// single-threaded by construction and none of its types are `Send`.
#[derive(Clone)]
pub struct Reactor {
    shared: Rc<Shared>,
}

static_assertions::assert_not_impl_any!(Reactor: Send, Sync);

struct Shared {
    poller: Poller,
    pool: BufferPool,
    config: LoopConfig,
    fds: RefCell<HashMap<RawFd, FdEntry>>,
    requests: RefCell<RequestTable>,
    /// Completions waiting for the dispatch phase: (token, status).
    ready: RefCell<VecDeque<(u64, i32)>>,
    /// Close records due for finalization at iteration end.
    closing: RefCell<VecDeque<CloseRecord>>,
    active_handles: Cell<usize>,
    stop_requested: Cell<bool>,
    in_turn: Cell<bool>,
}

/// Per-fd scheduling state: at most one standing watch plus a FIFO queue of
/// one-shot ops, of which only the head is ever armed.
struct FdEntry {
    watch: Option<Watch>,
    queue: VecDeque<QueuedOp>,
    close_on_drain: Option<CloseRecord>,
    registered: Interest,
}

impl FdEntry {
    fn new() -> Self {
        Self {
            watch: None,
            queue: VecDeque::new(),
            close_on_drain: None,
            registered: Interest::default(),
        }
    }

    fn desired_interest(&self) -> Interest {
        let mut interest = Interest::default();
        match &self.watch {
            Some(Watch::Stream { .. }) => interest.readable = true,
            Some(Watch::Level {
                readable, writable, ..
            }) => {
                interest.readable = *readable;
                interest.writable = *writable;
            }
            None => {}
        }
        if !self.queue.is_empty() {
            interest.writable = true;
        }
        interest
    }

    fn is_idle(&self) -> bool {
        self.watch.is_none() && self.queue.is_empty() && self.close_on_drain.is_none()
    }
}

enum Watch {
    /// Standing byte subscription: the reactor reads and delivers chunks.
    Stream {
        deliver: Rc<RefCell<Box<dyn FnMut(i32, &[u8])>>>,
    },
    /// Raw readiness subscription: the reactor only reports the edge.
    Level {
        readable: bool,
        writable: bool,
        deliver: Rc<RefCell<Box<dyn FnMut(bool, bool)>>>,
    },
}

struct QueuedOp {
    token: u64,
    kind: OpKind,
}

struct CloseRecord {
    fd: RawFd,
    owns_fd: bool,
    finalizer: Box<dyn FnOnce()>,
}

impl Reactor {
    /// Creates a reactor with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(LoopConfig::default())
    }

    /// Creates a reactor from an explicit configuration.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the platform has no poller.
    pub fn with_config(config: LoopConfig) -> Result<Self> {
        config.validate()?;

        if config.logging.enabled {
            if let Ok(mut logger) = crate::logging::init_logger().lock() {
                logger.set_level(config.logging.level);
            }
        }

        let poller = Poller::new()?;
        let pool = BufferPool::new(config.buffer.pool_capacity, config.buffer.lease_size);

        Ok(Self {
            shared: Rc::new(Shared {
                poller,
                pool,
                config,
                fds: RefCell::new(HashMap::new()),
                requests: RefCell::new(RequestTable::new()),
                ready: RefCell::new(VecDeque::new()),
                closing: RefCell::new(VecDeque::new()),
                active_handles: Cell::new(0),
                stop_requested: Cell::new(false),
                in_turn: Cell::new(false),
            }),
        })
    }

    /// The transfer buffer pool backing reads and writes on this loop.
    pub fn buffer_pool(&self) -> BufferPool {
        self.shared.pool.clone()
    }

    /// `true` while anything keeps the loop alive: active handles, pending
    /// requests, undispatched completions, or unfinalized closes.
    pub fn alive(&self) -> bool {
        self.shared.active_handles.get() > 0
            || !self.shared.requests.borrow().is_empty()
            || !self.shared.ready.borrow().is_empty()
            || !self.shared.closing.borrow().is_empty()
    }

    /// Drives the loop until nothing keeps it alive or [`stop`](Self::stop)
    /// is called from a callback.
    pub fn run(&self) -> Result<()> {
        self.shared.stop_requested.set(false);
        log_debug!("reactor", "run: entering loop");
        while self.alive() && !self.shared.stop_requested.get() {
            self.turn(true)?;
        }
        log_debug!("reactor", "run: loop finished");
        Ok(())
    }

    /// Runs one iteration, blocking until at least one event or due
    /// completion is processed. Returns `true` if any work was done.
    pub fn run_once(&self) -> Result<bool> {
        self.turn(true)
    }

    /// Runs one iteration without blocking. Returns `true` if any work was
    /// done.
    pub fn run_nowait(&self) -> Result<bool> {
        self.turn(false)
    }

    /// Makes [`run`](Self::run) return after the current iteration.
    pub fn stop(&self) {
        self.shared.stop_requested.set(true);
    }

    /// Drives the loop until `future` resolves, then returns its output.
    ///
    /// The future must make progress through this reactor; if it is still
    /// pending when the loop has nothing left to wait on, the call panics
    /// rather than sleeping forever.
    pub fn run_until<F: Future>(&self, future: F) -> F::Output {
        let mut future = std::pin::pin!(future);
        let waker = crate::bridge::loop_waker();
        let mut cx = Context::from_waker(&waker);

        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }
            if !self.alive() {
                panic!("future cannot make progress: reactor has nothing to wait on");
            }
            if let Err(err) = self.turn(true) {
                panic!("reactor iteration failed: {err}");
            }
        }
    }

    // ---- iteration ----------------------------------------------------

    fn turn(&self, blocking: bool) -> Result<bool> {
        if self.shared.in_turn.replace(true) {
            panic!("reactor iteration re-entered from a callback");
        }
        let result = self.turn_inner(blocking);
        self.shared.in_turn.set(false);
        result
    }

    fn turn_inner(&self, blocking: bool) -> Result<bool> {
        let immediate = !self.shared.ready.borrow().is_empty()
            || !self.shared.closing.borrow().is_empty();
        let timeout_ms = if immediate || !blocking { 0 } else { -1 };

        let events = self
            .shared
            .poller
            .wait(timeout_ms, self.shared.config.poll.max_events)?;
        let mut worked = !events.is_empty() || immediate;

        for event in &events {
            let watch = {
                let fds = self.shared.fds.borrow();
                match fds.get(&event.fd) {
                    Some(entry) => match &entry.watch {
                        Some(Watch::Stream { deliver }) => Snapshot::Stream(Rc::clone(deliver)),
                        Some(Watch::Level {
                            readable,
                            writable,
                            deliver,
                        }) => Snapshot::Level(*readable, *writable, Rc::clone(deliver)),
                        None => Snapshot::QueueOnly,
                    },
                    // Closed while an earlier event in this batch ran.
                    None => continue,
                }
            };

            match watch {
                Snapshot::Stream(deliver) => {
                    if event.readable {
                        self.service_stream_read(event.fd, &deliver);
                    }
                    if event.writable {
                        self.drive_queue(event.fd, true);
                    }
                }
                Snapshot::Level(want_r, want_w, deliver) => {
                    let readable = event.readable && want_r;
                    let writable = event.writable && want_w;
                    if readable || writable {
                        (deliver.borrow_mut())(readable, writable);
                    }
                }
                Snapshot::QueueOnly => {
                    if event.writable {
                        self.drive_queue(event.fd, true);
                    }
                }
            }
        }

        worked |= self.dispatch_ready();
        worked |= self.finalize_closes();
        Ok(worked)
    }

    /// Reads one chunk for a standing stream subscription and delivers it.
    ///
    /// The lease is dropped (returned to the pool) only after the delivery
    /// callback comes back, so observers borrow the bytes rather than own
    /// them.
    fn service_stream_read(&self, fd: RawFd, deliver: &Rc<RefCell<Box<dyn FnMut(i32, &[u8])>>>) {
        let mut lease = self.shared.pool.lease();
        let status = loop {
            let block = lease.block_mut();
            // SAFETY: block is a live unique slice for the duration of the call.
            let n = unsafe { libc::read(fd, block.as_mut_ptr().cast(), block.len()) };
            if n > 0 {
                break n as i32;
            }
            if n == 0 {
                break status::EOF;
            }
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            match errno {
                libc::EINTR => continue,
                // Spurious wake: stay subscribed, deliver nothing.
                libc::EAGAIN => return,
                _ => break -errno,
            }
        };

        if status > 0 {
            lease.set_len(status as usize);
        }
        (deliver.borrow_mut())(status, &lease);
    }

    /// Advances the one-shot queue for `fd` as far as it will go.
    ///
    /// Completions discovered here are only recorded; user continuations run
    /// later in the dispatch phase, after every borrow is released.
    fn drive_queue(&self, fd: RawFd, mut writable_now: bool) {
        loop {
            let head = {
                let mut fds = self.shared.fds.borrow_mut();
                let Some(entry) = fds.get_mut(&fd) else { return };
                match entry.queue.front() {
                    Some(op) => Some((op.token, op.kind)),
                    None => {
                        if let Some(record) = entry.close_on_drain.take() {
                            self.shared.closing.borrow_mut().push_back(record);
                        }
                        None
                    }
                }
            };

            let Some((token, kind)) = head else {
                self.sync_interest(fd);
                return;
            };

            let status = match kind {
                OpKind::Shutdown => Some(shutdown_write_side(fd)),
                OpKind::Connect => {
                    if writable_now {
                        writable_now = false;
                        Some(take_socket_error(fd))
                    } else {
                        self.sync_interest(fd);
                        return;
                    }
                }
                OpKind::Write => match self.write_step(fd, token) {
                    Some(status) => Some(status),
                    None => {
                        self.sync_interest(fd);
                        return;
                    }
                },
                other => {
                    // Read/Accept are standing subscriptions, never queued.
                    unreachable!("{other} operations are not queued");
                }
            };

            if let Some(status) = status {
                self.pop_queue_head(fd, token);
                self.shared.ready.borrow_mut().push_back((token, status));
            }
        }
    }

    /// Pushes as much of the head write as the socket accepts.
    ///
    /// Returns the final status once the payload is fully out or failed, or
    /// `None` while the kernel wants us to wait for writability.
    fn write_step(&self, fd: RawFd, token: u64) -> Option<i32> {
        let mut requests = self.shared.requests.borrow_mut();
        let request = requests.get_mut(token);

        loop {
            let remaining = request.remaining();
            if remaining.is_empty() {
                return Some(request.payload_len() as i32);
            }

            // SAFETY: remaining borrows the request's owned lease, which
            // stays pinned in the table for the duration of the call.
            // MSG_NOSIGNAL: a vanished peer must surface as EPIPE, not
            // SIGPIPE.
            let n = unsafe {
                libc::send(
                    fd,
                    remaining.as_ptr().cast(),
                    remaining.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n > 0 {
                if request.advance(n as usize) {
                    return Some(request.payload_len() as i32);
                }
                continue;
            }

            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            match errno {
                libc::EINTR => continue,
                libc::EAGAIN => return None,
                _ => return Some(-errno),
            }
        }
    }

    fn pop_queue_head(&self, fd: RawFd, token: u64) {
        let mut fds = self.shared.fds.borrow_mut();
        if let Some(entry) = fds.get_mut(&fd) {
            let popped = entry.queue.pop_front();
            debug_assert!(matches!(popped, Some(op) if op.token == token));
        }
    }

    /// Runs every due completion continuation. Continuations may submit new
    /// work or close handles; anything they make due is processed before
    /// this returns.
    fn dispatch_ready(&self) -> bool {
        let mut worked = false;
        loop {
            let next = self.shared.ready.borrow_mut().pop_front();
            let Some((token, status)) = next else {
                break;
            };
            let request = self.shared.requests.borrow_mut().remove(token);
            if let Some(request) = request {
                worked = true;
                request.complete(status);
            }
        }
        worked
    }

    /// Finalizes every close that became due this iteration: releases the
    /// kernel registration, closes owned fds, and runs the handle finalizer
    /// (which drains the close-continuation queue in registration order).
    fn finalize_closes(&self) -> bool {
        let mut worked = false;
        loop {
            let record = self.shared.closing.borrow_mut().pop_front();
            let Some(record) = record else { break };
            worked = true;

            {
                let mut fds = self.shared.fds.borrow_mut();
                if let Some(entry) = fds.remove(&record.fd) {
                    debug_assert!(entry.queue.is_empty());
                    if !entry.registered.is_empty() {
                        if let Err(err) = self.shared.poller.remove(record.fd) {
                            log_warn!("reactor", "deregister fd={} failed: {}", record.fd, err);
                        }
                    }
                }
            }

            if record.owns_fd {
                // SAFETY: the fd belongs to the closing handle and nothing
                // else references it once its entry is gone.
                unsafe {
                    libc::close(record.fd);
                }
            }

            self.shared
                .active_handles
                .set(self.shared.active_handles.get() - 1);
            log_debug!("reactor", "close finalized fd={}", record.fd);
            (record.finalizer)();
        }
        worked
    }

    // ---- submission API (crate internal) ------------------------------

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.shared.pool
    }

    /// Registers a new handle attached to this loop.
    pub(crate) fn register_handle(&self) {
        self.shared
            .active_handles
            .set(self.shared.active_handles.get() + 1);
    }

    /// Queues a one-shot op on `fd` and returns its token.
    pub(crate) fn submit_queued(
        &self,
        fd: RawFd,
        kind: OpKind,
        buffer: Option<ByteLease>,
        continuation: Box<dyn FnOnce(i32)>,
    ) -> u64 {
        let token = self
            .shared
            .requests
            .borrow_mut()
            .insert(fd, kind, buffer, continuation);

        let first = {
            let mut fds = self.shared.fds.borrow_mut();
            let entry = fds.entry(fd).or_insert_with(FdEntry::new);
            entry.queue.push_back(QueuedOp { token, kind });
            entry.queue.len() == 1
        };

        if first && self.shared.config.poll.immediate_write {
            self.drive_queue(fd, false);
        } else {
            self.sync_interest(fd);
        }
        token
    }

    /// Registers a request that is not fd-queued; it completes only through
    /// [`push_ready`](Self::push_ready).
    pub(crate) fn submit_detached(
        &self,
        fd: RawFd,
        kind: OpKind,
        continuation: Box<dyn FnOnce(i32)>,
    ) -> u64 {
        self.shared
            .requests
            .borrow_mut()
            .insert(fd, kind, None, continuation)
    }

    /// Marks a request complete; its continuation runs in the next dispatch
    /// phase.
    pub(crate) fn push_ready(&self, token: u64, status: i32) {
        self.shared.ready.borrow_mut().push_back((token, status));
    }

    /// Installs the standing byte subscription for a stream fd.
    pub(crate) fn watch_stream(&self, fd: RawFd, deliver: Box<dyn FnMut(i32, &[u8])>) {
        {
            let mut fds = self.shared.fds.borrow_mut();
            let entry = fds.entry(fd).or_insert_with(FdEntry::new);
            entry.watch = Some(Watch::Stream {
                deliver: Rc::new(RefCell::new(deliver)),
            });
        }
        self.sync_interest(fd);
    }

    /// Installs or rearms a raw readiness subscription.
    pub(crate) fn watch_level(
        &self,
        fd: RawFd,
        readable: bool,
        writable: bool,
        deliver: Box<dyn FnMut(bool, bool)>,
    ) {
        {
            let mut fds = self.shared.fds.borrow_mut();
            let entry = fds.entry(fd).or_insert_with(FdEntry::new);
            entry.watch = Some(Watch::Level {
                readable,
                writable,
                deliver: Rc::new(RefCell::new(deliver)),
            });
        }
        self.sync_interest(fd);
    }

    /// Removes the standing subscription, leaving queued ops running.
    pub(crate) fn unwatch(&self, fd: RawFd) {
        let present = {
            let mut fds = self.shared.fds.borrow_mut();
            match fds.get_mut(&fd) {
                Some(entry) => {
                    entry.watch = None;
                    true
                }
                None => false,
            }
        };
        if present {
            self.sync_interest(fd);
        }
    }

    /// Schedules close finalization for a handle.
    ///
    /// If the fd still has queued ops they are flushed first and the close
    /// finalizes when the queue drains; otherwise it finalizes at the end of
    /// the current (or next) iteration. The standing watch is cancelled
    /// either way, so no further deliveries happen after this call.
    pub(crate) fn schedule_close(&self, fd: RawFd, owns_fd: bool, finalizer: Box<dyn FnOnce()>) {
        let record = CloseRecord {
            fd,
            owns_fd,
            finalizer,
        };

        // The deferral branch keeps the record inside the fd entry; the
        // record comes back out only when the close is due now.
        let due_now = {
            let mut fds = self.shared.fds.borrow_mut();
            match fds.get_mut(&fd) {
                Some(entry) => {
                    entry.watch = None;
                    if entry.queue.is_empty() {
                        Some(record)
                    } else {
                        entry.close_on_drain = Some(record);
                        None
                    }
                }
                None => Some(record),
            }
        };

        match due_now {
            Some(record) => {
                log_debug!("reactor", "close scheduled fd={}", fd);
                self.shared.closing.borrow_mut().push_back(record);
            }
            None => {
                log_debug!("reactor", "close deferred until drain fd={}", fd);
            }
        }
        self.sync_interest(fd);
    }

    /// Reconciles the kernel registration for `fd` with its entry state and
    /// garbage-collects idle entries.
    fn sync_interest(&self, fd: RawFd) {
        let change = {
            let mut fds = self.shared.fds.borrow_mut();
            let Some(entry) = fds.get_mut(&fd) else {
                return;
            };
            let desired = entry.desired_interest();
            let current = entry.registered;
            entry.registered = desired;
            if entry.is_idle() && desired.is_empty() {
                fds.remove(&fd);
            }
            (current, desired)
        };

        let (current, desired) = change;
        let result = if current == desired {
            Ok(())
        } else if current.is_empty() {
            self.shared.poller.add(fd, desired)
        } else if desired.is_empty() {
            self.shared.poller.remove(fd)
        } else {
            self.shared.poller.modify(fd, desired)
        };

        if let Err(err) = result {
            log_warn!("reactor", "interest update fd={} failed: {}", fd, err);
        }
    }
}

enum Snapshot {
    Stream(Rc<RefCell<Box<dyn FnMut(i32, &[u8])>>>),
    Level(bool, bool, Rc<RefCell<Box<dyn FnMut(bool, bool)>>>),
    QueueOnly,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let in_flight = self.requests.borrow().len();
        if in_flight > 0 && !std::thread::panicking() {
            let details = self.requests.borrow().debug_info().join("\n  ");
            panic!(
                "{}:\n  {}",
                TidewayError::RequestsInFlight { count: in_flight },
                details
            );
        }

        // Orphaned close records still own their fds.
        for record in self.closing.borrow_mut().drain(..) {
            if record.owns_fd {
                unsafe {
                    libc::close(record.fd);
                }
            }
        }
        for (fd, entry) in self.fds.borrow_mut().drain() {
            if let Some(record) = entry.close_on_drain {
                if record.owns_fd {
                    unsafe {
                        libc::close(fd);
                    }
                }
            }
        }
    }
}

fn shutdown_write_side(fd: RawFd) -> i32 {
    // SAFETY: plain syscall on a caller-owned fd.
    let ret = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
    if ret == 0 {
        0
    } else {
        status::from_errno()
    }
}

fn take_socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: err/len are valid out-pointers for SO_ERROR.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if ret != 0 {
        return status::from_errno();
    }
    if err == 0 {
        0
    } else {
        -err
    }
}
