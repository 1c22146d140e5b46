//! The stream state machine: flow-controlled reads, ordered writes, drain
//! accounting, and shutdown coupled to close.
//!
//! A [`Stream`] is a [`Handle`] specialized with byte semantics. Reads are a
//! standing subscription toggled between `Paused` and `Reading`; every chunk
//! the reactor delivers while reading is pushed to the data observers. Writes
//! queue a [`PendingRequest`](crate::request) each, complete strictly in
//! submission order, and fire the drain notification exactly when the
//! outstanding count returns to zero. Shutdown deliberately tears the whole
//! stream down: there is no half-closed-forever state.
//!
//! The bridged one-shot forms ([`read_one`](Stream::read_one),
//! [`shutdown_one`](Stream::shutdown_one)) sit on the same machinery through
//! single-flight slots and change none of the lifecycle rules.

use std::cell::Cell;
use std::rc::Rc;

use crate::bridge::{BridgeSlot, SlotFuture};
use crate::error::{Result, TidewayError};
use crate::events::{Listeners, SubId};
use crate::handle::{Handle, HandleCore, HandleState};
use crate::reactor::Reactor;
use crate::request::OpKind;
use crate::{log_trace, status};

/// Flow-control state of a stream's read side. Streams start `Paused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// No subscription; arriving bytes stay in the kernel buffer.
    Paused,
    /// Standing subscription; every chunk is delivered to the data observers.
    Reading,
}

/// A flow-controlled, write-queued byte stream over one native descriptor.
///
/// Concrete transports ([`TcpStream`](crate::net::tcp::TcpStream),
/// [`PipeStream`](crate::net::pipe::PipeStream)) deref to this type.
pub struct Stream {
    inner: Rc<StreamInner>,
}

static_assertions::assert_not_impl_any!(Stream: Send, Sync);

pub(crate) struct StreamInner {
    handle: Rc<HandleCore>,
    read_state: Cell<ReadState>,
    pending_writes: Cell<usize>,
    shutting_down: Cell<bool>,
    data: Listeners<[u8]>,
    error: Listeners<TidewayError>,
    complete: Listeners<()>,
    drain: Listeners<()>,
    read_slot: Rc<BridgeSlot<Option<Vec<u8>>>>,
    shutdown_slot: Rc<BridgeSlot<()>>,
}

impl Stream {
    /// Wraps an already-connected non-blocking descriptor.
    pub(crate) fn from_fd(reactor: &Reactor, fd: std::os::unix::io::RawFd) -> Self {
        let inner = Rc::new(StreamInner {
            handle: HandleCore::new(reactor, fd, true),
            read_state: Cell::new(ReadState::Paused),
            pending_writes: Cell::new(0),
            shutting_down: Cell::new(false),
            data: Listeners::new(),
            error: Listeners::new(),
            complete: Listeners::new(),
            drain: Listeners::new(),
            read_slot: Rc::new(BridgeSlot::new(OpKind::Read)),
            shutdown_slot: Rc::new(BridgeSlot::new(OpKind::Shutdown)),
        });

        // Observer lists hold handlers that commonly capture the stream;
        // dropping them at teardown breaks those cycles.
        let weak = Rc::downgrade(&inner);
        inner.handle.set_teardown(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.data.clear();
                inner.error.clear();
                inner.complete.clear();
                inner.drain.clear();
            }
        }));

        Self { inner }
    }

    /// Current flow-control state of the read side.
    pub fn read_state(&self) -> ReadState {
        self.inner.read_state.get()
    }

    /// Writes submitted but not yet acknowledged by the reactor.
    pub fn pending_writes(&self) -> usize {
        self.inner.pending_writes.get()
    }

    // ---- flow control --------------------------------------------------

    /// Starts delivering arriving chunks to the data observers.
    ///
    /// Idempotent: resuming while already `Reading` changes nothing and
    /// installs no second subscription.
    ///
    /// # Errors
    ///
    /// Fails with [`TidewayError::HandleClosed`] once closing has begun.
    pub fn resume(&self) -> Result<()> {
        self.inner.handle.ensure_active()?;
        if self.inner.read_state.get() == ReadState::Reading {
            return Ok(());
        }
        self.inner.read_state.set(ReadState::Reading);
        log_trace!("stream", "resume fd={}", self.inner.handle.fd());

        let weak = Rc::downgrade(&self.inner);
        self.inner.handle.reactor().watch_stream(
            self.inner.handle.fd(),
            Box::new(move |streamstatus, bytes| {
                if let Some(inner) = weak.upgrade() {
                    StreamInner::on_read(&inner, streamstatus, bytes);
                }
            }),
        );
        Ok(())
    }

    /// Stops read delivery.
    ///
    /// Valid in any state and infallible; pausing an already-paused or
    /// closing stream is a no-op, so teardown code never has to check first.
    /// One delivery already in flight when the pause lands may still arrive.
    pub fn pause(&self) {
        if self.inner.read_state.replace(ReadState::Paused) == ReadState::Paused {
            return;
        }
        // Closing already cancelled the watch; only record the state flip.
        if self.inner.handle.state() != HandleState::Active {
            return;
        }
        log_trace!("stream", "pause fd={}", self.inner.handle.fd());
        self.inner
            .handle
            .reactor()
            .unwatch(self.inner.handle.fd());
    }

    // ---- writes --------------------------------------------------------

    /// Queues `data` for ordered delivery, discarding the completion status.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.write_with(data, |_| {})
    }

    /// Queues `data` for ordered delivery and runs `on_complete` with the
    /// outcome once the reactor acknowledges the write.
    ///
    /// `data` is copied into an owned transfer lease, so the caller's buffer
    /// is free for reuse as soon as this returns. Completions fire in
    /// submission order; a write failure does not close the stream.
    pub fn write_with(
        &self,
        data: &[u8],
        on_complete: impl FnOnce(Result<usize>) + 'static,
    ) -> Result<()> {
        self.inner.handle.ensure_active()?;
        self.inner
            .pending_writes
            .set(self.inner.pending_writes.get() + 1);

        let reactor = self.inner.handle.reactor().clone();
        let lease = reactor.pool().lease_copy(data);
        // The strong reference keeps the stream's accounting alive until
        // every one of its writes has resolved.
        let inner = Rc::clone(&self.inner);
        reactor.submit_queued(
            self.inner.handle.fd(),
            OpKind::Write,
            Some(lease),
            Box::new(move |write_status| {
                inner.pending_writes.set(inner.pending_writes.get() - 1);
                if write_status >= 0 {
                    on_complete(Ok(write_status as usize));
                } else {
                    on_complete(Err(TidewayError::Io(status::to_io_error(write_status))));
                }
                if inner.pending_writes.get() == 0 {
                    inner.drain.emit(&());
                }
            }),
        );
        Ok(())
    }

    /// Synchronous best-effort write.
    ///
    /// Returns the number of bytes the descriptor accepted right now. Never
    /// queues a request and never participates in the pending-write counter
    /// or the drain notification.
    ///
    /// # Errors
    ///
    /// [`TidewayError::HandleClosed`] once closing has begun; a `WouldBlock`
    /// I/O error when the descriptor cannot accept any data.
    pub fn try_write(&self, data: &[u8]) -> Result<usize> {
        self.inner.handle.ensure_active()?;
        loop {
            // SAFETY: data is a live slice for the duration of the call.
            // MSG_NOSIGNAL: a vanished peer must surface as EPIPE, not
            // SIGPIPE.
            let n = unsafe {
                libc::send(
                    self.inner.handle.fd(),
                    data.as_ptr().cast(),
                    data.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(TidewayError::Io(err));
        }
    }

    // ---- shutdown ------------------------------------------------------

    /// Signals "no more writes from this side", discarding the outcome.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown_with(|_| {})
    }

    /// Signals "no more writes from this side" and tears the stream down.
    ///
    /// The shutdown handshake queues behind pending writes. Whatever its
    /// outcome, the stream then proceeds to close; `on_complete` runs as a
    /// close continuation carrying the handshake result, so it observes the
    /// fully-closed stream.
    pub fn shutdown_with(
        &self,
        on_complete: impl FnOnce(Result<()>) + 'static,
    ) -> Result<()> {
        self.inner.handle.ensure_active()?;
        if self.inner.shutting_down.replace(true) {
            return Err(TidewayError::OperationInProgress {
                kind: OpKind::Shutdown,
            });
        }

        let inner = Rc::clone(&self.inner);
        self.inner.handle.reactor().submit_queued(
            self.inner.handle.fd(),
            OpKind::Shutdown,
            None,
            Box::new(move |shutdown_status| {
                let outcome = if shutdown_status >= 0 {
                    Ok(())
                } else {
                    Err(TidewayError::Io(status::to_io_error(shutdown_status)))
                };
                StreamInner::begin_close(
                    &inner,
                    Some(Box::new(move || on_complete(outcome))),
                );
            }),
        );
        Ok(())
    }

    // ---- observers -----------------------------------------------------

    /// Subscribes to arriving chunks. Only fires while `Reading`.
    pub fn on_data(&self, mut handler: impl FnMut(&[u8]) + 'static) -> SubId {
        self.inner.data.subscribe(Box::new(move |bytes| handler(bytes)))
    }

    /// Subscribes to read-side failures. A read error closes the stream.
    pub fn on_error(&self, mut handler: impl FnMut(&TidewayError) + 'static) -> SubId {
        self.inner.error.subscribe(Box::new(move |err| handler(err)))
    }

    /// Subscribes to graceful end-of-stream.
    ///
    /// Fires exactly once, after the close that end-of-stream initiates has
    /// finished, so the handler observes the final state.
    pub fn on_complete(&self, mut handler: impl FnMut() + 'static) -> SubId {
        self.inner.complete.subscribe(Box::new(move |_| handler()))
    }

    /// Subscribes to the drain notification: the pending-write count just
    /// returned to zero.
    pub fn on_drain(&self, mut handler: impl FnMut() + 'static) -> SubId {
        self.inner.drain.subscribe(Box::new(move |_| handler()))
    }

    /// Removes a data handler. Returns `false` if it was already gone.
    pub fn remove_data_handler(&self, id: SubId) -> bool {
        self.inner.data.unsubscribe(id)
    }

    /// Removes an error handler.
    pub fn remove_error_handler(&self, id: SubId) -> bool {
        self.inner.error.unsubscribe(id)
    }

    /// Removes a complete handler.
    pub fn remove_complete_handler(&self, id: SubId) -> bool {
        self.inner.complete.unsubscribe(id)
    }

    /// Removes a drain handler.
    pub fn remove_drain_handler(&self, id: SubId) -> bool {
        self.inner.drain.unsubscribe(id)
    }

    // ---- bridged one-shot operations -----------------------------------

    /// Awaits exactly one discrete unit of input.
    ///
    /// Resumes reading if paused, resolves on the next chunk (`Some(bytes)`),
    /// end-of-stream (`None`), or read error, then pauses again so callers
    /// receive one unit per call instead of a continuous push.
    ///
    /// # Errors
    ///
    /// [`TidewayError::OperationInProgress`] while another `read_one` is
    /// outstanding; [`TidewayError::HandleClosed`] if the stream is closing,
    /// or closes while the call is pending.
    pub async fn read_one(&self) -> Result<Option<Vec<u8>>> {
        self.inner.handle.ensure_active()?;
        self.inner.read_slot.claim()?;

        let result = SlotFuture::new(Rc::clone(&self.inner.read_slot));
        if let Err(err) = self.resume() {
            return Err(err);
        }
        let result = result.await;
        self.pause();
        result
    }

    /// Awaits the full [`shutdown_with`](Self::shutdown_with) contract: the
    /// future resolves with the handshake outcome only after the underlying
    /// close has completed.
    pub async fn shutdown_one(&self) -> Result<()> {
        self.inner.handle.ensure_active()?;
        self.inner.shutdown_slot.claim()?;

        let future = SlotFuture::new(Rc::clone(&self.inner.shutdown_slot));
        let slot = Rc::clone(&self.inner.shutdown_slot);
        self.shutdown_with(move |outcome| slot.fulfill(outcome))?;
        future.await
    }
}

impl StreamInner {
    /// Standing-subscription delivery, invoked by the reactor per chunk.
    fn on_read(this: &Rc<Self>, read_status: i32, bytes: &[u8]) {
        if read_status == 0 {
            // Spurious wake, not end-of-stream.
            return;
        }
        if read_status > 0 {
            this.data.emit(bytes);
            this.read_slot.fulfill(Ok(Some(bytes.to_vec())));
            return;
        }
        if read_status == status::EOF {
            log_trace!("stream", "eof fd={}", this.handle.fd());
            this.read_slot.fulfill(Ok(None));
            let weak = Rc::downgrade(this);
            Self::begin_close(
                this,
                Some(Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.complete.emit(&());
                    }
                })),
            );
            return;
        }

        log_trace!(
            "stream",
            "read error fd={} status={}",
            this.handle.fd(),
            read_status
        );
        this.error
            .emit(&TidewayError::Io(status::to_io_error(read_status)));
        this.read_slot
            .fulfill(Err(TidewayError::Io(status::to_io_error(read_status))));
        Self::begin_close(this, None);
    }

    /// Shared close entry for user calls, end-of-stream, and read errors.
    ///
    /// The first entry into `Closing` fails a waiting bridged read with the
    /// closed-handle error. The shutdown slot is never failed here: a claimed
    /// shutdown is fulfilled by its own close continuation, which any close
    /// path runs.
    fn begin_close(this: &Rc<Self>, continuation: Option<Box<dyn FnOnce()>>) {
        if this.handle.state() == HandleState::Active {
            this.read_slot.fail_if_waiting(TidewayError::HandleClosed);
        }
        HandleCore::close_with(&this.handle, continuation);
    }
}

impl Handle for Stream {
    fn state(&self) -> HandleState {
        self.inner.handle.state()
    }

    fn close(&self) {
        StreamInner::begin_close(&self.inner, None);
    }

    fn close_with(&self, on_complete: Box<dyn FnOnce()>) {
        StreamInner::begin_close(&self.inner, Some(on_complete));
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.inner.handle.state() == HandleState::Active {
            StreamInner::begin_close(&self.inner, None);
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("fd", &self.inner.handle.fd())
            .field("state", &self.inner.handle.state())
            .field("read_state", &self.inner.read_state.get())
            .field("pending_writes", &self.inner.pending_writes.get())
            .finish()
    }
}
