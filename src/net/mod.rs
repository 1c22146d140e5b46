//! Concrete transports over the generic stream contract.
//!
//! [`tcp`] and [`pipe`] provide the endpoint-specific constructors (bind,
//! listen, connect, pair); everything byte-shaped afterwards is the generic
//! [`Stream`](crate::stream::Stream) the transports deref to. This module
//! holds the plumbing they share: non-blocking socket creation, sockaddr
//! conversion, the listener core, and the queued-connect state machine.

pub mod pipe;
pub mod tcp;

use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::bridge::{BridgeSlot, SlotFuture};
use crate::error::{Result, TidewayError};
use crate::events::Listeners;
use crate::handle::{HandleCore, HandleState};
use crate::reactor::Reactor;
use crate::request::OpKind;
use crate::status;

/// Creates a non-blocking, close-on-exec stream socket.
pub(crate) fn new_socket(domain: libc::c_int) -> io::Result<RawFd> {
    // SAFETY: plain socket creation, no pointers.
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Converts a socket address into the storage/len pair the syscalls take.
pub(crate) fn socket_addr_to_storage(
    addr: &std::net::SocketAddr,
) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is valid when zeroed.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        std::net::SocketAddr::V4(v4) => {
            // SAFETY: storage is large enough for sockaddr_in.
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        std::net::SocketAddr::V6(v6) => {
            // SAFETY: storage is large enough for sockaddr_in6.
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Parses a kernel-filled sockaddr back into a socket address.
pub(crate) fn storage_to_socket_addr(
    storage: &libc::sockaddr_storage,
) -> io::Result<std::net::SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: ss_family says this is a sockaddr_in.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Ok(std::net::SocketAddr::V4(std::net::SocketAddrV4::new(
                std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: ss_family says this is a sockaddr_in6.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(std::net::SocketAddr::V6(std::net::SocketAddrV6::new(
                std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected address family {family}"),
        )),
    }
}

/// The socket's locally-bound address.
pub(crate) fn local_addr(fd: RawFd) -> io::Result<std::net::SocketAddr> {
    // SAFETY: storage/len are valid out-pointers for getsockname.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    storage_to_socket_addr(&storage)
}

/// Fills a sockaddr_un (inside storage) for a filesystem path.
pub(crate) fn unix_addr(
    path: &std::path::Path,
) -> io::Result<(libc::sockaddr_storage, libc::socklen_t)> {
    use std::os::unix::ffi::OsStrExt;

    // SAFETY: sockaddr_storage is valid when zeroed.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    // SAFETY: storage is large enough for sockaddr_un.
    let sun = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_un) };
    sun.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() || bytes.len() >= sun.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path is empty or too long",
        ));
    }
    for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let base = std::mem::size_of::<libc::sockaddr_un>() - sun.sun_path.len();
    Ok((storage, (base + bytes.len() + 1) as libc::socklen_t))
}

/// Shared listener machinery: a bound socket, a standing incoming-connection
/// watch, the connection observers, and the single-flight accept slot.
///
/// `S` is the concrete accepted stream type; `make` wraps an accepted
/// descriptor into it.
pub(crate) struct ListenerCore<S: 'static> {
    reactor: Reactor,
    pub(crate) handle: Rc<HandleCore>,
    connection: Listeners<()>,
    accept_slot: Rc<BridgeSlot<S>>,
    make: fn(&Reactor, RawFd) -> S,
    listening: Cell<bool>,
}

impl<S: 'static> ListenerCore<S> {
    pub(crate) fn new(reactor: &Reactor, fd: RawFd, make: fn(&Reactor, RawFd) -> S) -> Rc<Self> {
        let core = Rc::new(Self {
            reactor: reactor.clone(),
            handle: HandleCore::new(reactor, fd, true),
            connection: Listeners::new(),
            accept_slot: Rc::new(BridgeSlot::new(OpKind::Accept)),
            make,
            listening: Cell::new(false),
        });

        let weak = Rc::downgrade(&core);
        core.handle.set_teardown(Box::new(move || {
            if let Some(core) = weak.upgrade() {
                core.connection.clear();
            }
        }));
        core
    }

    /// Marks the socket passive and arms the incoming-connection watch.
    /// Idempotent.
    pub(crate) fn listen(this: &Rc<Self>, backlog: i32) -> Result<()> {
        this.handle.ensure_active()?;
        if this.listening.replace(true) {
            return Ok(());
        }

        // SAFETY: plain syscall on our own fd.
        let ret = unsafe { libc::listen(this.handle.fd(), backlog) };
        if ret != 0 {
            this.listening.set(false);
            return Err(TidewayError::Io(io::Error::last_os_error()));
        }

        let weak = Rc::downgrade(this);
        this.reactor.watch_level(
            this.handle.fd(),
            true,
            false,
            Box::new(move |readable, _| {
                let Some(core) = weak.upgrade() else { return };
                if readable {
                    core.on_incoming();
                }
            }),
        );
        Ok(())
    }

    /// One readiness edge: a bridged accept consumes the connection, the
    /// observers are told otherwise.
    fn on_incoming(&self) {
        if self.accept_slot.is_waiting() {
            match self.try_accept() {
                Ok(Some(stream)) => self.accept_slot.fulfill(Ok(stream)),
                // Another process won the race; keep waiting.
                Ok(None) => {}
                Err(err) => self.accept_slot.fulfill(Err(err)),
            }
        } else {
            self.connection.emit(&());
        }
    }

    fn try_accept(&self) -> Result<Option<S>> {
        loop {
            // SAFETY: null addr pointers are allowed; we do not need the peer.
            let client = unsafe {
                libc::accept4(
                    self.handle.fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if client >= 0 {
                return Ok(Some((self.make)(&self.reactor, client)));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(TidewayError::Io(err)),
            }
        }
    }

    /// Accepts one pending connection, or fails with `WouldBlock` when none
    /// is queued. Accept failures leave the listener open.
    pub(crate) fn accept(&self) -> Result<S> {
        self.handle.ensure_active()?;
        match self.try_accept()? {
            Some(stream) => Ok(stream),
            None => Err(TidewayError::Io(io::ErrorKind::WouldBlock.into())),
        }
    }

    /// Awaits exactly one incoming connection.
    pub(crate) async fn accept_one(&self) -> Result<S> {
        self.handle.ensure_active()?;
        if !self.listening.get() {
            return Err(TidewayError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener is not listening",
            )));
        }
        self.accept_slot.claim()?;
        SlotFuture::new(Rc::clone(&self.accept_slot)).await
    }

    pub(crate) fn on_connection(&self, mut handler: impl FnMut() + 'static) -> crate::events::SubId {
        self.connection.subscribe(Box::new(move |_| handler()))
    }

    pub(crate) fn remove_connection_handler(&self, id: crate::events::SubId) -> bool {
        self.connection.unsubscribe(id)
    }

    pub(crate) fn state(&self) -> HandleState {
        self.handle.state()
    }

    /// Close entry shared with the public wrappers: the first entry into
    /// `Closing` fails a waiting bridged accept with the closed-handle error.
    pub(crate) fn close_with(this: &Rc<Self>, continuation: Option<Box<dyn FnOnce()>>) {
        if this.handle.state() == HandleState::Active {
            this.accept_slot.fail_if_waiting(TidewayError::HandleClosed);
        }
        HandleCore::close_with(&this.handle, continuation);
    }
}

/// Starts a non-blocking connect on `fd` and delivers the wrapped stream (or
/// the failure, after closing `fd`) through `on_connect`.
///
/// Immediate kernel-level completion is still reported through the reactor's
/// dispatch phase, never synchronously inside this call, so callers observe
/// one consistent delivery path.
pub(crate) fn start_connect<S: 'static>(
    reactor: &Reactor,
    fd: RawFd,
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
    make: fn(&Reactor, RawFd) -> S,
    on_connect: Box<dyn FnOnce(Result<S>)>,
) -> Result<()> {
    // SAFETY: storage holds a valid sockaddr of length len.
    let ret = unsafe {
        libc::connect(fd, storage as *const _ as *const libc::sockaddr, len)
    };

    let reactor_for_make = reactor.clone();
    let continuation: Box<dyn FnOnce(i32)> = Box::new(move |connect_status| {
        if connect_status == 0 {
            on_connect(Ok(make(&reactor_for_make, fd)));
        } else {
            // SAFETY: the fd was never wrapped; close it before surfacing.
            unsafe {
                libc::close(fd);
            }
            on_connect(Err(TidewayError::Io(status::to_io_error(connect_status))));
        }
    });

    if ret == 0 {
        let token = reactor.submit_detached(fd, OpKind::Connect, continuation);
        reactor.push_ready(token, 0);
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) => {
            reactor.submit_queued(fd, OpKind::Connect, None, continuation);
            Ok(())
        }
        _ => {
            // SAFETY: nothing else references the fresh fd.
            unsafe {
                libc::close(fd);
            }
            Err(TidewayError::Io(err))
        }
    }
}
