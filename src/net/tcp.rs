//! TCP transport: listeners and connected streams.

use std::net::SocketAddr;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::bridge::{BridgeSlot, SlotFuture};
use crate::error::{Result, TidewayError};
use crate::events::SubId;
use crate::handle::{Handle, HandleState};
use crate::reactor::Reactor;
use crate::request::OpKind;
use crate::stream::Stream;

use super::{local_addr, new_socket, socket_addr_to_storage, start_connect, ListenerCore};

/// A connected TCP stream. Derefs to the generic [`Stream`] for all
/// byte-level operations.
pub struct TcpStream {
    stream: Stream,
}

impl TcpStream {
    pub(crate) fn from_fd(reactor: &Reactor, fd: RawFd) -> Self {
        Self {
            stream: Stream::from_fd(reactor, fd),
        }
    }

    /// Event-based connect: starts a non-blocking connection and delivers
    /// the connected stream (or the failure) through `on_connect` on the
    /// reactor thread.
    ///
    /// On failure the underlying descriptor is closed before the error is
    /// delivered. Synchronous precondition failures (bad address, socket
    /// creation) are returned directly instead.
    pub fn connect_with(
        reactor: &Reactor,
        addr: SocketAddr,
        on_connect: impl FnOnce(Result<TcpStream>) + 'static,
    ) -> Result<()> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = new_socket(domain).map_err(TidewayError::Io)?;
        let (storage, len) = socket_addr_to_storage(&addr);
        start_connect(
            reactor,
            fd,
            &storage,
            len,
            TcpStream::from_fd,
            Box::new(on_connect),
        )
    }

    /// Bridged connect: awaits exactly one connection-established
    /// completion and surfaces the connected stream.
    pub async fn connect(reactor: &Reactor, addr: SocketAddr) -> Result<TcpStream> {
        let slot = Rc::new(BridgeSlot::new(OpKind::Connect));
        slot.claim()?;

        let fulfill = Rc::clone(&slot);
        Self::connect_with(reactor, addr, move |result| fulfill.fulfill(result))?;
        SlotFuture::new(slot).await
    }
}

impl Deref for TcpStream {
    type Target = Stream;

    fn deref(&self) -> &Stream {
        &self.stream
    }
}

impl std::fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TcpStream").field(&self.stream).finish()
    }
}

/// A listening TCP socket.
///
/// `bind` then [`listen`](Self::listen); incoming connections surface either
/// as connection notifications consumed by explicit [`accept`](Self::accept)
/// calls, or one at a time through the bridged
/// [`accept_one`](Self::accept_one).
pub struct TcpListener {
    core: Rc<ListenerCore<TcpStream>>,
}

static_assertions::assert_not_impl_any!(TcpListener: Send, Sync);

impl TcpListener {
    /// Binds a listening socket to `addr` (port 0 picks a free port).
    pub fn bind(reactor: &Reactor, addr: SocketAddr) -> Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = new_socket(domain).map_err(TidewayError::Io)?;

        let reuse: libc::c_int = 1;
        // SAFETY: reuse is a live c_int for the duration of the call.
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&reuse as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: the fresh fd is ours alone.
            unsafe {
                libc::close(fd);
            }
            return Err(TidewayError::Io(err));
        }

        let (storage, len) = socket_addr_to_storage(&addr);
        // SAFETY: storage holds a valid sockaddr of length len.
        let ret = unsafe {
            libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: the fresh fd is ours alone.
            unsafe {
                libc::close(fd);
            }
            return Err(TidewayError::Io(err));
        }

        Ok(Self {
            core: ListenerCore::new(reactor, fd, TcpStream::from_fd),
        })
    }

    /// The locally-bound address; the way to learn an ephemeral port.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        local_addr(self.core.handle.fd()).map_err(TidewayError::Io)
    }

    /// Marks the socket passive and starts reporting incoming connections.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        ListenerCore::listen(&self.core, backlog)
    }

    /// Subscribes to incoming-connection notifications. Handlers should call
    /// [`accept`](Self::accept); an unaccepted connection reports again on
    /// the next iteration.
    pub fn on_connection(&self, handler: impl FnMut() + 'static) -> SubId {
        self.core.on_connection(handler)
    }

    /// Removes a connection handler. Returns `false` if it was already gone.
    pub fn remove_connection_handler(&self, id: SubId) -> bool {
        self.core.remove_connection_handler(id)
    }

    /// Accepts one pending connection without blocking.
    pub fn accept(&self) -> Result<TcpStream> {
        self.core.accept()
    }

    /// Awaits exactly one incoming connection.
    pub async fn accept_one(&self) -> Result<TcpStream> {
        self.core.accept_one().await
    }
}

impl Handle for TcpListener {
    fn state(&self) -> HandleState {
        self.core.state()
    }

    fn close(&self) {
        ListenerCore::close_with(&self.core, None);
    }

    fn close_with(&self, on_complete: Box<dyn FnOnce()>) {
        ListenerCore::close_with(&self.core, Some(on_complete));
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        if self.core.state() == HandleState::Active {
            ListenerCore::close_with(&self.core, None);
        }
    }
}

impl std::fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListener")
            .field("fd", &self.core.handle.fd())
            .field("state", &self.core.state())
            .finish()
    }
}
