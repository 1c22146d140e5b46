//! # Tideway: lifecycle-safe reactor I/O
//!
//! A single-threaded, readiness-driven I/O layer: an epoll-backed reactor
//! drives native handles (streams, listeners, poll watchers), delivers
//! completions through callbacks, and a bridge layer exposes the same
//! operations as one-shot awaitable futures. The crate's focus is the
//! handle/stream lifecycle: a resource is opened once, kept alive exactly as
//! long as operations are pending on it, flow-controlled between paused and
//! reading, drained of queued writes in order, and closed exactly once.
//!
//! ## Guarantees
//!
//! - **Exactly-once close**: any number of close requests on one handle
//!   yield one native close, and every close continuation runs exactly once,
//!   in registration order.
//! - **Buffer safety**: every byte crossing the reactor travels in an owned
//!   [`ByteLease`]; a pending operation owns its lease until completion and
//!   releases it before any user code observes the outcome.
//! - **Write ordering**: writes on one stream complete in submission order,
//!   and the drain notification fires exactly when the outstanding count
//!   returns to zero.
//! - **EOF is not an error**: end-of-stream is a graceful terminal event
//!   with its own notification; read failures take a separate path. Both
//!   close the stream exactly once.
//! - **Single-flight bridging**: each bridged operation kind (read, connect,
//!   accept, shutdown) admits one outstanding future per handle; closing the
//!   handle resolves pending futures with a closed error instead of leaking
//!   them.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tideway::{Handle, PipeStream, Reactor};
//!
//! fn main() -> tideway::Result<()> {
//!     let reactor = Reactor::new()?;
//!     let (client, server) = PipeStream::pair(&reactor)?;
//!
//!     reactor.run_until(async {
//!         client.write(b"PING")?;
//!         let request = server.read_one().await?;
//!         assert_eq!(request.as_deref(), Some(&b"PING"[..]));
//!
//!         server.write(b"PONG")?;
//!         server.shutdown_one().await?;
//!
//!         let reply = client.read_one().await?;
//!         assert_eq!(reply.as_deref(), Some(&b"PONG"[..]));
//!         Ok::<_, tideway::TidewayError>(())
//!     })?;
//!
//!     client.close();
//!     reactor.run()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Event-based API
//!
//! The same operations are available callback-first: subscribe to the
//! `data`/`error`/`complete`/`drain` notifications, `resume()` the stream,
//! and drive the loop with [`Reactor::run`]. The bridged futures are a thin
//! layer over exactly these notifications and change none of the lifecycle
//! rules.
//!
//! ## Concurrency model
//!
//! Everything runs on the thread that drives the reactor. Handle types are
//! deliberately `!Send`: there are no locks, and correctness relies on
//! non-reentrant, single-threaded callback delivery. Multi-threaded callers
//! marshal onto the reactor thread at the boundary.
//!
//! ## Platform support
//!
//! The poller is epoll-based; constructing a [`Reactor`] on non-Linux
//! platforms fails with an `Unsupported` error.

#![warn(missing_docs, rust_2018_idioms)]

mod bridge;
pub mod buffer;
pub mod config;
pub mod error;
mod events;
pub mod handle;
pub mod logging;
pub mod net;
pub mod poll;
pub mod reactor;
mod request;
pub mod status;
pub mod stream;

pub use buffer::{BufferPool, ByteLease, PoolStats};
pub use config::{BufferConfig, ConfigBuilder, LoggingConfig, LoopConfig, PollConfig};
pub use error::{Result, TidewayError};
pub use events::SubId;
pub use handle::{Handle, HandleState};
pub use logging::LogLevel;
pub use net::pipe::{PipeListener, PipeStream};
pub use net::tcp::{TcpListener, TcpStream};
pub use poll::{PollEvents, PollWatcher};
pub use reactor::Reactor;
pub use request::OpKind;
pub use stream::{ReadState, Stream};
