//! Stream-level integration coverage: write ordering and drain accounting,
//! and the two ways a read side ends (end-of-stream vs. failure).

#![cfg(target_os = "linux")]

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use tideway::{
    ConfigBuilder, Handle, HandleState, LoopConfig, PipeStream, PollConfig, Reactor, TcpListener,
};

/// All writes travel the full queue-and-complete machinery.
fn queued_writes_config() -> LoopConfig {
    ConfigBuilder::new()
        .poll(PollConfig {
            max_events: 64,
            immediate_write: false,
        })
        .build()
        .unwrap()
}

#[test]
fn writes_complete_in_submission_order_and_arrive_in_order() {
    let reactor = Reactor::with_config(queued_writes_config()).unwrap();
    let (a, b) = PipeStream::pair(&reactor).unwrap();

    let completions = Rc::new(RefCell::new(Vec::new()));
    for i in 0..5u8 {
        let sink = Rc::clone(&completions);
        a.write_with(&[b'a' + i; 3], move |outcome| {
            assert_eq!(outcome.unwrap(), 3);
            sink.borrow_mut().push(i);
        })
        .unwrap();
    }

    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&received);
    b.on_data(move |bytes| sink.borrow_mut().extend_from_slice(bytes));
    b.resume().unwrap();

    while received.borrow().len() < 15 {
        reactor.run_once().unwrap();
    }

    assert_eq!(*completions.borrow(), vec![0, 1, 2, 3, 4]);
    assert_eq!(&*received.borrow(), b"aaabbbcccdddeee");

    a.close();
    b.close();
    reactor.run().unwrap();
}

#[test]
fn drain_fires_exactly_on_each_return_to_zero() {
    let reactor = Reactor::with_config(queued_writes_config()).unwrap();
    let (a, b) = PipeStream::pair(&reactor).unwrap();

    let drains = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&drains);
    a.on_drain(move || counter.set(counter.get() + 1));

    a.write(b"one").unwrap();
    a.write(b"two").unwrap();
    assert_eq!(a.pending_writes(), 2);

    while a.pending_writes() > 0 {
        reactor.run_once().unwrap();
    }
    // Two completions, one transition to zero.
    assert_eq!(drains.get(), 1);

    // A synchronous try_write never participates in drain accounting.
    a.try_write(b"direct").unwrap();
    reactor.run_nowait().unwrap();
    assert_eq!(drains.get(), 1);

    a.write(b"three").unwrap();
    while a.pending_writes() > 0 {
        reactor.run_once().unwrap();
    }
    assert_eq!(drains.get(), 2);

    a.close();
    b.close();
    reactor.run().unwrap();
}

#[test]
fn eof_delivers_complete_not_error_and_closes_once() {
    let reactor = Reactor::new().unwrap();
    let (a, b) = PipeStream::pair(&reactor).unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    let completes = Rc::new(Cell::new(0u32));
    let errors = Rc::new(Cell::new(0u32));

    let sink = Rc::clone(&received);
    a.on_data(move |bytes| sink.borrow_mut().extend_from_slice(bytes));
    let counter = Rc::clone(&completes);
    a.on_complete(move || counter.set(counter.get() + 1));
    let counter = Rc::clone(&errors);
    a.on_error(move |_| counter.set(counter.get() + 1));
    a.resume().unwrap();

    b.write(b"bye").unwrap();
    b.close();

    while completes.get() == 0 {
        reactor.run_once().unwrap();
    }

    // Data ahead of the end of stream was delivered first, and the complete
    // notification observed the fully-closed stream.
    assert_eq!(&*received.borrow(), b"bye");
    assert_eq!(completes.get(), 1);
    assert_eq!(errors.get(), 0);
    assert_eq!(a.state(), HandleState::Closed);

    reactor.run().unwrap();
}

#[test]
fn read_failure_delivers_error_not_complete_and_closes_once() {
    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind(&reactor, "127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(8).unwrap();
    let addr = listener.local_addr().unwrap();

    let raw = raw_blocking_connect(addr);

    let server = loop {
        reactor.run_once().unwrap();
        match listener.accept() {
            Ok(stream) => break stream,
            Err(err) => assert!(!err.is_closed(), "listener closed unexpectedly: {err}"),
        }
    };

    let completes = Rc::new(Cell::new(0u32));
    let error_kinds = Rc::new(RefCell::new(Vec::new()));

    let counter = Rc::clone(&completes);
    server.on_complete(move || counter.set(counter.get() + 1));
    let sink = Rc::clone(&error_kinds);
    server.on_error(move |err| {
        let tideway::TidewayError::Io(io) = err else {
            panic!("read failure must surface as an I/O error, got {err:?}");
        };
        sink.borrow_mut().push(io.kind());
    });
    server.resume().unwrap();

    // Closing with linger(0) aborts the connection with a reset instead of
    // the orderly FIN handshake.
    set_linger_zero(raw);
    unsafe {
        libc::close(raw);
    }

    while error_kinds.borrow().is_empty() {
        reactor.run_once().unwrap();
    }
    while server.state() != HandleState::Closed {
        reactor.run_once().unwrap();
    }

    assert_eq!(
        *error_kinds.borrow(),
        vec![std::io::ErrorKind::ConnectionReset]
    );
    assert_eq!(completes.get(), 0);

    listener.close();
    reactor.run().unwrap();
}

#[test]
fn a_failed_write_does_not_tear_the_stream_down() {
    let reactor = Reactor::with_config(queued_writes_config()).unwrap();
    let (a, b) = PipeStream::pair(&reactor).unwrap();

    // The peer vanishing makes subsequent writes fail with EPIPE.
    b.close();
    reactor.run_nowait().unwrap();

    let outcomes = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&outcomes);
    a.write_with(b"into the void", move |outcome| {
        sink.borrow_mut().push(outcome.map_err(|err| {
            let tideway::TidewayError::Io(io) = err else {
                panic!("expected an I/O failure");
            };
            io.kind()
        }));
    })
    .unwrap();

    while outcomes.borrow().is_empty() {
        reactor.run_once().unwrap();
    }
    assert_eq!(
        *outcomes.borrow(),
        vec![Err(std::io::ErrorKind::BrokenPipe)]
    );

    // The failure was reported to the write, not escalated to a close.
    assert_eq!(a.state(), HandleState::Active);

    a.close();
    reactor.run().unwrap();
}

fn raw_blocking_connect(addr: SocketAddr) -> RawFd {
    let SocketAddr::V4(v4) = addr else {
        panic!("test listener is IPv4");
    };
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    assert!(fd >= 0);

    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: v4.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(v4.ip().octets()),
        },
        sin_zero: [0; 8],
    };
    let ret = unsafe {
        libc::connect(
            fd,
            (&sin as *const libc::sockaddr_in).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    assert_eq!(ret, 0, "loopback connect failed");
    fd
}

fn set_linger_zero(fd: RawFd) {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            (&linger as *const libc::linger).cast(),
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(ret, 0);
}
