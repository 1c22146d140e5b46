//! Event-to-future conversion.
//!
//! Each bridged operation kind (read, connect, accept, shutdown) has one
//! [`BridgeSlot`]: a single-flight continuation register. An async operation
//! claims the slot, the event layer fulfills it exactly once when the
//! corresponding notification fires, and a [`SlotFuture`] hands the outcome
//! back to the awaiting task. Notifications arriving after resolution are
//! ignored; they can never double-resolve a slot.
//!
//! There is no external cancellation. Closing the underlying handle fails a
//! waiting slot with the closed-handle error instead of leaving its future
//! pending forever. Dropping an unresolved future merely releases the slot so
//! the next bridged call of that kind can proceed.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::error::{Result, TidewayError};
use crate::request::OpKind;

enum SlotState<T> {
    Idle,
    Waiting(Option<Waker>),
    Resolved(Result<T>),
}

/// Single-flight one-shot register for one bridged operation kind.
pub(crate) struct BridgeSlot<T> {
    kind: OpKind,
    state: RefCell<SlotState<T>>,
}

impl<T> BridgeSlot<T> {
    pub(crate) fn new(kind: OpKind) -> Self {
        Self {
            kind,
            state: RefCell::new(SlotState::Idle),
        }
    }

    /// Reserves the slot for one operation.
    ///
    /// Fails with [`TidewayError::OperationInProgress`] while a previous
    /// claim is unresolved.
    pub(crate) fn claim(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        match *state {
            SlotState::Idle => {
                *state = SlotState::Waiting(None);
                Ok(())
            }
            _ => Err(TidewayError::OperationInProgress { kind: self.kind }),
        }
    }

    pub(crate) fn is_waiting(&self) -> bool {
        matches!(*self.state.borrow(), SlotState::Waiting(_))
    }

    /// Resolves a waiting claim. Does nothing when the slot is idle or
    /// already resolved, so late notifications are simply dropped.
    pub(crate) fn fulfill(&self, result: Result<T>) {
        let waker = {
            let mut state = self.state.borrow_mut();
            match std::mem::replace(&mut *state, SlotState::Idle) {
                SlotState::Waiting(waker) => {
                    *state = SlotState::Resolved(result);
                    waker
                }
                other => {
                    *state = other;
                    return;
                }
            }
        };
        // Wake only after the borrow is released; the waker may poll.
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Fails a waiting claim, leaving idle or resolved slots untouched.
    pub(crate) fn fail_if_waiting(&self, err: TidewayError) {
        if self.is_waiting() {
            self.fulfill(Err(err));
        }
    }

    /// Abandons an unresolved claim so the slot can be claimed again.
    fn release(&self) {
        let mut state = self.state.borrow_mut();
        if matches!(*state, SlotState::Waiting(_)) {
            *state = SlotState::Idle;
        }
    }

    fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let mut state = self.state.borrow_mut();
        match std::mem::replace(&mut *state, SlotState::Idle) {
            SlotState::Resolved(result) => Poll::Ready(result),
            SlotState::Waiting(_) => {
                *state = SlotState::Waiting(Some(cx.waker().clone()));
                Poll::Pending
            }
            SlotState::Idle => panic!("{} future polled without a claimed slot", self.kind),
        }
    }
}

/// Future over one claimed [`BridgeSlot`]; resolves exactly once.
pub(crate) struct SlotFuture<T> {
    slot: Rc<BridgeSlot<T>>,
    finished: bool,
}

impl<T> SlotFuture<T> {
    /// The caller must have claimed `slot` already.
    pub(crate) fn new(slot: Rc<BridgeSlot<T>>) -> Self {
        Self {
            slot,
            finished: false,
        }
    }
}

impl<T> Future for SlotFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.slot.poll_take(cx) {
            Poll::Ready(result) => {
                this.finished = true;
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Unpin for SlotFuture<T> {}

impl<T> Drop for SlotFuture<T> {
    fn drop(&mut self) {
        if !self.finished {
            self.slot.release();
        }
    }
}

/// Waker for futures driven by [`Reactor::run_until`](crate::Reactor::run_until).
///
/// The loop re-polls its future every iteration, so the wake calls carry no
/// information and the waker is a no-op.
pub(crate) fn loop_waker() -> Waker {
    const VTABLE: RawWakerVTable = RawWakerVTable::new(|_| RAW, |_| {}, |_| {}, |_| {});
    const RAW: RawWaker = RawWaker::new(std::ptr::null(), &VTABLE);
    // SAFETY: every vtable entry ignores the data pointer.
    unsafe { Waker::from_raw(RAW) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll_once<T>(future: &mut SlotFuture<T>) -> Poll<Result<T>> {
        let waker = loop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(future).poll(&mut cx)
    }

    #[test]
    fn second_claim_is_rejected_until_resolution() {
        let slot: Rc<BridgeSlot<u32>> = Rc::new(BridgeSlot::new(OpKind::Read));
        slot.claim().unwrap();

        match slot.claim() {
            Err(TidewayError::OperationInProgress { kind }) => assert_eq!(kind, OpKind::Read),
            other => panic!("expected in-progress error, got {other:?}"),
        }

        slot.fulfill(Ok(7));
        let mut future = SlotFuture::new(Rc::clone(&slot));
        assert!(matches!(poll_once(&mut future), Poll::Ready(Ok(7))));

        // Resolved and consumed: the slot is free again.
        slot.claim().unwrap();
    }

    #[test]
    fn pending_until_fulfilled() {
        let slot: Rc<BridgeSlot<()>> = Rc::new(BridgeSlot::new(OpKind::Shutdown));
        slot.claim().unwrap();

        let mut future = SlotFuture::new(Rc::clone(&slot));
        assert!(poll_once(&mut future).is_pending());
        assert!(poll_once(&mut future).is_pending());

        slot.fulfill(Ok(()));
        assert!(matches!(poll_once(&mut future), Poll::Ready(Ok(()))));
    }

    #[test]
    fn late_notifications_never_double_resolve() {
        let slot: Rc<BridgeSlot<u32>> = Rc::new(BridgeSlot::new(OpKind::Read));
        slot.claim().unwrap();

        slot.fulfill(Ok(1));
        slot.fulfill(Ok(2));

        let mut future = SlotFuture::new(Rc::clone(&slot));
        assert!(matches!(poll_once(&mut future), Poll::Ready(Ok(1))));
    }

    #[test]
    fn fulfill_without_claim_is_ignored() {
        let slot: BridgeSlot<u32> = BridgeSlot::new(OpKind::Accept);
        slot.fulfill(Ok(9));
        assert!(!slot.is_waiting());
        slot.claim().unwrap();
    }

    #[test]
    fn dropping_unresolved_future_releases_the_slot() {
        let slot: Rc<BridgeSlot<u32>> = Rc::new(BridgeSlot::new(OpKind::Connect));
        slot.claim().unwrap();

        let mut future = SlotFuture::new(Rc::clone(&slot));
        assert!(poll_once(&mut future).is_pending());
        drop(future);

        slot.claim().unwrap();
    }

    #[test]
    fn fail_if_waiting_targets_only_waiting_slots() {
        let slot: Rc<BridgeSlot<u32>> = Rc::new(BridgeSlot::new(OpKind::Read));

        slot.fail_if_waiting(TidewayError::HandleClosed);
        slot.claim().unwrap();
        slot.fulfill(Ok(3));
        slot.fail_if_waiting(TidewayError::HandleClosed);

        let mut future = SlotFuture::new(Rc::clone(&slot));
        assert!(matches!(poll_once(&mut future), Poll::Ready(Ok(3))));
    }
}
