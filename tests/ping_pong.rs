//! End-to-end event-based scenario: a TCP echo handshake driven entirely by
//! notifications, finishing with every handle closed exactly once.

#![cfg(target_os = "linux")]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tideway::{Handle, HandleState, Reactor, TcpListener, TcpStream};

/// Runs one full handshake on a fresh reactor and returns how many close
/// completions were observed. A clean round closes exactly three handles:
/// client stream, server stream, listener.
fn ping_pong_round(client_shuts_down: bool) -> u32 {
    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind(&reactor, "127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(8).unwrap();
    let addr = listener.local_addr().unwrap();

    let client_cell: Rc<RefCell<Option<TcpStream>>> = Rc::new(RefCell::new(None));
    let arrived = Rc::clone(&client_cell);
    TcpStream::connect_with(&reactor, addr, move |result| {
        *arrived.borrow_mut() = Some(result.unwrap());
    })
    .unwrap();

    let connection_pending = Rc::new(Cell::new(false));
    let flag = Rc::clone(&connection_pending);
    listener.on_connection(move || flag.set(true));

    let mut server = None;
    while server.is_none() || client_cell.borrow().is_none() {
        reactor.run_once().unwrap();
        if connection_pending.replace(false) {
            server = Some(listener.accept().unwrap());
        }
    }
    let server = server.unwrap();
    let client = client_cell.borrow_mut().take().unwrap();

    let closes = Rc::new(Cell::new(0u32));

    let inbox = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&inbox);
    server.on_data(move |bytes| sink.borrow_mut().extend_from_slice(bytes));
    server.resume().unwrap();

    let reply = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&reply);
    client.on_data(move |bytes| sink.borrow_mut().extend_from_slice(bytes));
    client.resume().unwrap();

    // The client going away is the server's end-of-stream.
    let counter = Rc::clone(&closes);
    server.on_complete(move || counter.set(counter.get() + 1));

    client.write(b"PING").unwrap();

    let mut echoed = false;
    let mut finished = false;
    while server.state() != HandleState::Closed || client.state() != HandleState::Closed {
        reactor.run_once().unwrap();

        if !echoed && *inbox.borrow() == b"PING" {
            echoed = true;
            server.write(b"PONG").unwrap();
        }
        if !finished && *reply.borrow() == b"PONG" {
            finished = true;
            let counter = Rc::clone(&closes);
            if client_shuts_down {
                client
                    .shutdown_with(move |outcome| {
                        outcome.unwrap();
                        counter.set(counter.get() + 1);
                    })
                    .unwrap();
            } else {
                client.close_with(Box::new(move || counter.set(counter.get() + 1)));
            }
        }
    }
    assert_eq!(*inbox.borrow(), b"PING");
    assert_eq!(*reply.borrow(), b"PONG");
    assert_eq!(client.pending_writes(), 0);
    assert_eq!(server.pending_writes(), 0);

    let counter = Rc::clone(&closes);
    listener.close_with(Box::new(move || counter.set(counter.get() + 1)));
    reactor.run().unwrap();

    closes.get()
}

#[test]
fn single_round_closes_all_three_handles() {
    assert_eq!(ping_pong_round(true), 3);
}

#[test]
fn abrupt_client_close_still_completes_the_server() {
    assert_eq!(ping_pong_round(false), 3);
}

#[test]
fn repeated_rounds_on_fresh_reactors() {
    for _ in 0..10 {
        assert_eq!(ping_pong_round(true), 3);
    }
}
