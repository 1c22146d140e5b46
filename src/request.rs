//! Pending request correlation between native operations and continuations.
//!
//! Every one-shot native operation (write, shutdown, connect) is recorded as
//! a [`PendingRequest`] keyed by an opaque token. The reactor only ever sees
//! tokens; when a completion arrives the request is removed from the table
//! and completed exactly once. Completion releases the buffer lease before
//! invoking the continuation, so a continuation that panics or re-submits can
//! never corrupt buffer accounting.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::buffer::ByteLease;
use crate::log_trace;

/// The kinds of operations the reactor correlates and the bridge gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Standing read delivery (bridged as read-one).
    Read,
    /// Queued write of one owned payload.
    Write,
    /// Outbound connection establishment.
    Connect,
    /// Incoming connection acceptance.
    Accept,
    /// Write-side shutdown handshake.
    Shutdown,
}

impl OpKind {
    /// Lowercase name used in log lines and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::Connect => "connect",
            OpKind::Accept => "accept",
            OpKind::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One in-flight native operation: the buffer it must keep alive and the
/// continuation to run on completion.
pub(crate) struct PendingRequest {
    token: u64,
    fd: RawFd,
    kind: OpKind,
    buffer: Option<ByteLease>,
    written: usize,
    continuation: Option<Box<dyn FnOnce(i32)>>,
}

impl PendingRequest {
    /// The bytes of the owned payload not yet accepted by the kernel.
    pub(crate) fn remaining(&self) -> &[u8] {
        match self.buffer.as_ref() {
            Some(lease) => &lease[self.written..],
            None => &[],
        }
    }

    /// Records `n` more bytes accepted; `true` once the payload is fully out.
    pub(crate) fn advance(&mut self, n: usize) -> bool {
        self.written += n;
        self.written >= self.buffer.as_ref().map_or(0, |lease| lease.len())
    }

    /// Total payload length, used as the success status of a full write.
    pub(crate) fn payload_len(&self) -> usize {
        self.buffer.as_ref().map_or(0, |lease| lease.len())
    }

    /// Completes the request exactly once.
    ///
    /// The lease is released first so the pool sees the block back before any
    /// user code runs; the continuation is invoked second with the raw
    /// status. Order is load-bearing: an error handler may immediately lease
    /// a new buffer for its own reply.
    pub(crate) fn complete(mut self, status: i32) {
        log_trace!("request", "complete token={} status={}", self.token, status);
        drop(self.buffer.take());
        if let Some(continuation) = self.continuation.take() {
            continuation(status);
        }
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("token", &self.token)
            .field("fd", &self.fd)
            .field("kind", &self.kind)
            .field("written", &self.written)
            .field("has_buffer", &self.buffer.is_some())
            .finish()
    }
}

/// Token-keyed table of in-flight requests.
pub(crate) struct RequestTable {
    requests: HashMap<u64, PendingRequest>,
    next_token: u64,
}

impl RequestTable {
    pub(crate) fn new() -> Self {
        Self {
            requests: HashMap::new(),
            next_token: 1,
        }
    }

    /// Registers a new request and returns its token.
    pub(crate) fn insert(
        &mut self,
        fd: RawFd,
        kind: OpKind,
        buffer: Option<ByteLease>,
        continuation: Box<dyn FnOnce(i32)>,
    ) -> u64 {
        let token = self.allocate_token();
        log_trace!("request", "submit token={} kind={} fd={}", token, kind, fd);
        self.requests.insert(
            token,
            PendingRequest {
                token,
                fd,
                kind,
                buffer,
                written: 0,
                continuation: Some(continuation),
            },
        );
        token
    }

    /// Takes the request out of the table so it can be completed.
    pub(crate) fn remove(&mut self, token: u64) -> Option<PendingRequest> {
        self.requests.remove(&token)
    }

    pub(crate) fn get_mut(&mut self, token: u64) -> &mut PendingRequest {
        self.requests
            .get_mut(&token)
            .unwrap_or_else(|| panic!("request token {token} is not in flight"))
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// One line per in-flight request, for teardown diagnostics.
    pub(crate) fn debug_info(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .requests
            .values()
            .map(|request| {
                format!(
                    "token={} kind={} fd={}",
                    request.token, request.kind, request.fd
                )
            })
            .collect();
        lines.sort();
        lines
    }

    fn allocate_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        if self.next_token == 0 {
            self.next_token = 1;
        }
        token
    }
}
