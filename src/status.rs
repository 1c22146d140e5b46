//! Completion status codes shared by the reactor, requests, and streams.
//!
//! Every native completion is reported as a single `i32`:
//!
//! - `> 0`: success, carrying a byte or result count
//! - `0`: success with nothing to report, or a spurious readiness wake
//! - [`EOF`]: the read side reached end-of-stream
//! - any other negative value: a negated errno
//!
//! The sentinel keeps end-of-stream distinguishable from every real errno so
//! the read path can treat it as a graceful terminal event rather than a
//! failure.

use std::io;

/// End-of-stream sentinel, reserved below the errno range.
pub const EOF: i32 = -4095;

/// `true` for statuses that report a failure (negative and not end-of-stream).
pub fn is_error(status: i32) -> bool {
    status < 0 && status != EOF
}

/// Converts a failure status back into the `std::io::Error` it encodes.
///
/// Calling this with a non-error status is a logic bug; it yields an
/// `InvalidData` error rather than fabricating an errno.
pub fn to_io_error(status: i32) -> io::Error {
    if is_error(status) {
        io::Error::from_raw_os_error(-status)
    } else {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("status {status} is not an error"),
        )
    }
}

/// Encodes an `std::io::Error` as a negative status.
///
/// Errors without an OS errno (synthesized errors) map onto `EIO`.
pub fn from_io_error(err: &io::Error) -> i32 {
    match err.raw_os_error() {
        Some(errno) => -errno,
        None => -libc::EIO,
    }
}

/// Captures the calling thread's current errno as a negative status.
pub(crate) fn from_errno() -> i32 {
    from_io_error(&io::Error::last_os_error())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_is_not_an_errno() {
        // Linux errnos stop well short of 4095; the sentinel must never
        // collide with a real failure code.
        assert!(EOF < -4000);
        assert!(!is_error(EOF));
    }

    #[test]
    fn errno_round_trip() {
        let status = -libc::ECONNRESET;
        assert!(is_error(status));

        let err = to_io_error(status);
        assert_eq!(err.raw_os_error(), Some(libc::ECONNRESET));
        assert_eq!(from_io_error(&err), status);
    }

    #[test]
    fn positive_statuses_are_success() {
        assert!(!is_error(0));
        assert!(!is_error(1));
        assert!(!is_error(4096));
    }

    #[test]
    fn synthesized_errors_become_eio() {
        let err = io::Error::new(io::ErrorKind::Other, "no errno attached");
        assert_eq!(from_io_error(&err), -libc::EIO);
    }
}
