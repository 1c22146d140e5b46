//! Per-instance observer lists backing the stream and watcher notifications.
//!
//! Each notification channel (data, error, complete, drain, connection, poll
//! readiness) is one [`Listeners`] value. Dispatch runs on the reactor thread
//! and must survive handlers that subscribe, unsubscribe, or close handles
//! re-entrantly, so `emit` snapshots the list and re-checks membership before
//! every call instead of iterating a held borrow.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Identifier for one subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubId(u64);

type Handler<A> = Rc<RefCell<Box<dyn FnMut(&A)>>>;

/// An ordered list of subscribers to one notification channel.
///
/// Handlers run in subscription order. A handler removed while a dispatch is
/// in progress is skipped if its turn has not come yet; a handler added
/// during dispatch first sees the next emission. Re-entrant emission of the
/// same channel from inside one of its own handlers is not supported.
pub(crate) struct Listeners<A: ?Sized> {
    next: Cell<u64>,
    subs: RefCell<Vec<(u64, Handler<A>)>>,
}

impl<A: ?Sized> Listeners<A> {
    pub(crate) fn new() -> Self {
        Self {
            next: Cell::new(1),
            subs: RefCell::new(Vec::new()),
        }
    }

    /// Adds a handler, returning the id that removes it.
    pub(crate) fn subscribe(&self, handler: Box<dyn FnMut(&A)>) -> SubId {
        let id = self.next.get();
        self.next.set(id.wrapping_add(1));
        self.subs
            .borrow_mut()
            .push((id, Rc::new(RefCell::new(handler))));
        SubId(id)
    }

    /// Removes a handler. Returns `false` if it was already gone.
    pub(crate) fn unsubscribe(&self, id: SubId) -> bool {
        let mut subs = self.subs.borrow_mut();
        match subs.iter().position(|(sub, _)| *sub == id.0) {
            Some(index) => {
                subs.remove(index);
                true
            }
            None => false,
        }
    }

    /// Invokes every current handler with `arg`.
    pub(crate) fn emit(&self, arg: &A) {
        let snapshot: Vec<(u64, Handler<A>)> = self
            .subs
            .borrow()
            .iter()
            .map(|(id, h)| (*id, Rc::clone(h)))
            .collect();

        for (id, handler) in snapshot {
            let still_subscribed = self.subs.borrow().iter().any(|(sub, _)| *sub == id);
            if still_subscribed {
                (handler.borrow_mut())(arg);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.subs.borrow().len()
    }

    /// Drops every handler. Used at handle teardown so handlers that capture
    /// their own handle do not keep it alive forever.
    pub(crate) fn clear(&self) {
        self.subs.borrow_mut().clear();
    }
}

impl<A: ?Sized> Default for Listeners<A> {
    fn default() -> Self {
        Self::new()
    }
}
