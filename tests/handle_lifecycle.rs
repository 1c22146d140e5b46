//! Handle lifecycle integration coverage: exactly-once close, continuation
//! ordering, and close interacting with in-flight work.

#![cfg(target_os = "linux")]

use std::cell::RefCell;
use std::rc::Rc;

use tideway::{Handle, HandleState, LoopConfig, PipeStream, Reactor, TidewayError};

#[test]
fn every_close_continuation_runs_exactly_once() {
    let reactor = Reactor::new().unwrap();
    let (a, b) = PipeStream::pair(&reactor).unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));
    for tag in 1..=4 {
        let sink = Rc::clone(&order);
        a.close_with(Box::new(move || sink.borrow_mut().push(tag)));
    }
    assert_eq!(a.state(), HandleState::Closing);

    // A plain close while already closing is not an error either.
    a.close();

    b.close();
    reactor.run().unwrap();

    assert_eq!(a.state(), HandleState::Closed);
    assert_eq!(*order.borrow(), vec![1, 2, 3, 4]);
}

#[test]
fn close_continuation_registered_after_closed_still_runs() {
    let reactor = Reactor::new().unwrap();
    let (a, b) = PipeStream::pair(&reactor).unwrap();

    a.close();
    b.close();
    reactor.run().unwrap();
    assert_eq!(a.state(), HandleState::Closed);

    let ran = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&ran);
    a.close_with(Box::new(move || *counter.borrow_mut() += 1));
    assert_eq!(*ran.borrow(), 1);
}

#[test]
fn operations_after_close_fail_synchronously() {
    let reactor = Reactor::new().unwrap();
    let (a, b) = PipeStream::pair(&reactor).unwrap();

    a.close();
    assert!(matches!(a.write(b"late"), Err(TidewayError::HandleClosed)));
    assert!(matches!(a.resume(), Err(TidewayError::HandleClosed)));
    assert!(matches!(a.shutdown(), Err(TidewayError::HandleClosed)));

    b.close();
    reactor.run().unwrap();
}

#[test]
fn close_with_writes_in_flight_flushes_before_close_completes() {
    // Disable the synchronous write fast path so all three writes are still
    // queued when close is requested.
    let reactor = Reactor::with_config(LoopConfig::development()).unwrap();
    let (a, b) = PipeStream::pair(&reactor).unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));
    for i in 1..=3 {
        let sink = Rc::clone(&order);
        a.write_with(format!("w{i}").as_bytes(), move |outcome| {
            assert!(outcome.is_ok());
            sink.borrow_mut().push(format!("w{i}"));
        })
        .unwrap();
    }
    assert_eq!(a.pending_writes(), 3);

    let sink = Rc::clone(&order);
    a.close_with(Box::new(move || sink.borrow_mut().push("closed".into())));

    b.close();
    reactor.run().unwrap();

    assert_eq!(a.pending_writes(), 0);
    assert_eq!(
        *order.borrow(),
        vec![
            "w1".to_string(),
            "w2".to_string(),
            "w3".to_string(),
            "closed".to_string()
        ]
    );
}

#[test]
fn close_continuations_never_run_inside_the_requesting_call() {
    let reactor = Reactor::new().unwrap();
    let (a, b) = PipeStream::pair(&reactor).unwrap();

    let fired = Rc::new(RefCell::new(false));
    let flag = Rc::clone(&fired);
    a.close_with(Box::new(move || *flag.borrow_mut() = true));

    // Deferred to the end of a reactor iteration.
    assert!(!*fired.borrow());
    reactor.run_nowait().unwrap();
    assert!(*fired.borrow());

    b.close();
    reactor.run().unwrap();
}
