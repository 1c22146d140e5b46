//! Readiness source for the reactor.
//!
//! A thin, level-triggered epoll wrapper. Interest is recomputed by the
//! reactor from each fd entry's state (standing watch plus op queue) and
//! pushed down here; the poller itself holds no per-fd bookkeeping beyond
//! what the kernel tracks.
//!
//! Linux only. On other platforms construction fails with an `Unsupported`
//! error so the crate still compiles and unit tests that never build a
//! reactor keep running.

use std::os::unix::io::RawFd;

/// Which readiness classes an fd is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Interest {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

impl Interest {
    pub(crate) fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// One readiness report from the kernel.
///
/// Error and hangup conditions are folded into both flags; the servicing
/// syscall discovers the specific condition and reports it as a status.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub(crate) fd: RawFd,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

#[cfg(target_os = "linux")]
pub(crate) use linux::Poller;

#[cfg(target_os = "linux")]
mod linux {
    use super::{Interest, Readiness};
    use std::io;
    use std::os::unix::io::RawFd;

    pub(crate) struct Poller {
        epfd: RawFd,
    }

    impl Poller {
        pub(crate) fn new() -> io::Result<Self> {
            // SAFETY: epoll_create1 takes no pointers.
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { epfd })
        }

        pub(crate) fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
        }

        pub(crate) fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
        }

        pub(crate) fn remove(&self, fd: RawFd) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_DEL, fd, Interest::default())
        }

        fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events: event_mask(interest),
                u64: fd as u64,
            };
            // SAFETY: event outlives the call; fd validity is the caller's
            // contract with the kernel, which reports EBADF otherwise.
            let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Waits up to `timeout_ms` (-1 blocks) for at most `max_events`
        /// reports.
        ///
        /// An interrupted wait returns an empty batch rather than an error;
        /// the reactor simply runs its next iteration.
        pub(crate) fn wait(&self, timeout_ms: i32, max_events: usize) -> io::Result<Vec<Readiness>> {
            let mut events =
                vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)];

            // SAFETY: the events buffer is valid for max_events entries and
            // only the first `count` are read back.
            let count = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    timeout_ms,
                )
            };

            if count < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(Vec::new());
                }
                return Err(err);
            }

            Ok(events[..count as usize]
                .iter()
                .map(|event| {
                    let failed = event.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
                    Readiness {
                        fd: event.u64 as RawFd,
                        readable: failed || event.events & libc::EPOLLIN as u32 != 0,
                        writable: failed || event.events & libc::EPOLLOUT as u32 != 0,
                    }
                })
                .collect())
        }
    }

    fn event_mask(interest: Interest) -> u32 {
        let mut mask = 0u32;
        if interest.readable {
            mask |= libc::EPOLLIN as u32;
        }
        if interest.writable {
            mask |= libc::EPOLLOUT as u32;
        }
        mask
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            // SAFETY: epfd was returned by epoll_create1 and is closed once.
            unsafe {
                libc::close(self.epfd);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) use fallback::Poller;

#[cfg(not(target_os = "linux"))]
mod fallback {
    use super::{Interest, Readiness};
    use std::io;
    use std::os::unix::io::RawFd;

    pub(crate) struct Poller;

    impl Poller {
        pub(crate) fn new() -> io::Result<Self> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "tideway requires epoll, which this platform does not provide",
            ))
        }

        pub(crate) fn add(&self, _fd: RawFd, _interest: Interest) -> io::Result<()> {
            Err(io::ErrorKind::Unsupported.into())
        }

        pub(crate) fn modify(&self, _fd: RawFd, _interest: Interest) -> io::Result<()> {
            Err(io::ErrorKind::Unsupported.into())
        }

        pub(crate) fn remove(&self, _fd: RawFd) -> io::Result<()> {
            Err(io::ErrorKind::Unsupported.into())
        }

        pub(crate) fn wait(
            &self,
            _timeout_ms: i32,
            _max_events: usize,
        ) -> io::Result<Vec<Readiness>> {
            Err(io::ErrorKind::Unsupported.into())
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::io;

    fn nonblocking_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0, "pipe2 failed: {}", io::Error::last_os_error());
        (fds[0], fds[1])
    }

    #[test]
    fn writable_end_reports_immediately() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = nonblocking_pipe();

        poller
            .add(
                write_fd,
                Interest {
                    readable: false,
                    writable: true,
                },
            )
            .unwrap();

        let ready = poller.wait(100, 8).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].fd, write_fd);
        assert!(ready[0].writable);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn readable_waits_for_data() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = nonblocking_pipe();

        poller
            .add(
                read_fd,
                Interest {
                    readable: true,
                    writable: false,
                },
            )
            .unwrap();

        assert!(poller.wait(0, 8).unwrap().is_empty());

        let payload = b"x";
        let wrote = unsafe { libc::write(write_fd, payload.as_ptr().cast(), 1) };
        assert_eq!(wrote, 1);

        let ready = poller.wait(100, 8).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].fd, read_fd);
        assert!(ready[0].readable);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn remove_silences_reports() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = nonblocking_pipe();

        poller
            .add(
                write_fd,
                Interest {
                    readable: false,
                    writable: true,
                },
            )
            .unwrap();
        poller.remove(write_fd).unwrap();

        assert!(poller.wait(0, 8).unwrap().is_empty());

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
