//! Unix-domain (pipe) transport: listeners, connected streams, and
//! socketpair construction for in-process harnesses.

use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::rc::Rc;

use crate::bridge::{BridgeSlot, SlotFuture};
use crate::error::{Result, TidewayError};
use crate::events::SubId;
use crate::handle::{Handle, HandleState};
use crate::reactor::Reactor;
use crate::request::OpKind;
use crate::stream::Stream;

use super::{new_socket, start_connect, unix_addr, ListenerCore};

/// A connected Unix-domain stream. Derefs to the generic [`Stream`].
pub struct PipeStream {
    stream: Stream,
}

impl PipeStream {
    pub(crate) fn from_fd(reactor: &Reactor, fd: RawFd) -> Self {
        Self {
            stream: Stream::from_fd(reactor, fd),
        }
    }

    /// Creates a connected pair of pipe streams on the same reactor.
    ///
    /// The pair needs no filesystem path or listener, which makes it the
    /// natural fixture for in-process tests and worker channels.
    pub fn pair(reactor: &Reactor) -> Result<(PipeStream, PipeStream)> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds is a valid out-array of two descriptors.
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if ret != 0 {
            return Err(TidewayError::Io(std::io::Error::last_os_error()));
        }
        Ok((
            PipeStream::from_fd(reactor, fds[0]),
            PipeStream::from_fd(reactor, fds[1]),
        ))
    }

    /// Event-based connect to a filesystem socket path; the connected stream
    /// (or the failure, after the descriptor is closed) arrives through
    /// `on_connect` on the reactor thread.
    pub fn connect_with(
        reactor: &Reactor,
        path: impl AsRef<Path>,
        on_connect: impl FnOnce(Result<PipeStream>) + 'static,
    ) -> Result<()> {
        let (storage, len) = unix_addr(path.as_ref()).map_err(TidewayError::Io)?;
        let fd = new_socket(libc::AF_UNIX).map_err(TidewayError::Io)?;
        start_connect(
            reactor,
            fd,
            &storage,
            len,
            PipeStream::from_fd,
            Box::new(on_connect),
        )
    }

    /// Bridged connect to a filesystem socket path.
    pub async fn connect(reactor: &Reactor, path: impl AsRef<Path>) -> Result<PipeStream> {
        let slot = Rc::new(BridgeSlot::new(OpKind::Connect));
        slot.claim()?;

        let fulfill = Rc::clone(&slot);
        Self::connect_with(reactor, path, move |result| fulfill.fulfill(result))?;
        SlotFuture::new(slot).await
    }
}

impl Deref for PipeStream {
    type Target = Stream;

    fn deref(&self) -> &Stream {
        &self.stream
    }
}

impl std::fmt::Debug for PipeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PipeStream").field(&self.stream).finish()
    }
}

/// A listening Unix-domain socket bound to a filesystem path.
///
/// The path is not unlinked on close; callers own the filesystem name, the
/// same way they own the descriptor of a poll watcher.
pub struct PipeListener {
    core: Rc<ListenerCore<PipeStream>>,
}

static_assertions::assert_not_impl_any!(PipeListener: Send, Sync);

impl PipeListener {
    /// Binds a listening socket at `path`. Fails if the path already exists.
    pub fn bind(reactor: &Reactor, path: impl AsRef<Path>) -> Result<Self> {
        let (storage, len) = unix_addr(path.as_ref()).map_err(TidewayError::Io)?;
        let fd = new_socket(libc::AF_UNIX).map_err(TidewayError::Io)?;

        // SAFETY: storage holds a valid sockaddr_un of length len.
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
            core: ListenerCore::new(reactor, fd, PipeStream::from_fd),
        })
    }

    /// Marks the socket passive and starts reporting incoming connections.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        ListenerCore::listen(&self.core, backlog)
    }

    /// Subscribes to incoming-connection notifications.
    pub fn on_connection(&self, handler: impl FnMut() + 'static) -> SubId {
        self.core.on_connection(handler)
    }

    /// Removes a connection handler. Returns `false` if it was already gone.
    pub fn remove_connection_handler(&self, id: SubId) -> bool {
        self.core.remove_connection_handler(id)
    }

    /// Accepts one pending connection without blocking.
    pub fn accept(&self) -> Result<PipeStream> {
        self.core.accept()
    }

    /// Awaits exactly one incoming connection.
    pub async fn accept_one(&self) -> Result<PipeStream> {
        self.core.accept_one().await
    }
}

impl Handle for PipeListener {
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

impl Drop for PipeListener {
    fn drop(&mut self) {
        if self.core.state() == HandleState::Active {
            ListenerCore::close_with(&self.core, None);
        }
    }
}

impl std::fmt::Debug for PipeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeListener")
            .field("fd", &self.core.handle.fd())
            .field("state", &self.core.state())
            .finish()
    }
}
