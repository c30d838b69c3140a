//! ringsock — io_uring-native asynchronous socket I/O engine for Linux.
//!
//! ringsock drives socket reads and writes through a single `io_uring`
//! owned by a dedicated I/O thread. Client threads submit operations on
//! per-socket, per-direction queues; each operation first attempts a
//! non-blocking syscall and otherwise rides a linked (poll, readv/writev)
//! pair through the ring, completing via a one-shot callback.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::io::Write;
//! use std::os::fd::AsRawFd;
//! use std::os::unix::net::UnixStream;
//! use ringsock::{AsyncSocket, Config, IoThread};
//!
//! fn main() -> Result<(), ringsock::Error> {
//!     let io = IoThread::spawn(Config::default())?;
//!
//!     let (local, mut peer) = UnixStream::pair().expect("socketpair");
//!     let socket = AsyncSocket::register(&io, local.as_raw_fd());
//!
//!     let (tx, rx) = std::sync::mpsc::channel();
//!     socket.recv(
//!         vec![0u8; 1024],
//!         Box::new(move |completion| {
//!             let _ = tx.send(completion);
//!         }),
//!     )?;
//!     peer.write_all(b"hello").expect("peer write");
//!     let completion = rx.recv().expect("completion");
//!     println!("received {} bytes", completion.bytes);
//!     Ok(())
//! }
//! ```
//!
//! # Guarantees
//!
//! Within one direction of one socket, operations start and finish in
//! submission order. Across directions or sockets, no ordering is
//! promised. Cancellation is cooperative: it takes effect at the next
//! yielding point or when the kernel reports `ECANCELED`, and a result
//! that races ahead of it still wins.
//!
//! # Platform
//!
//! Linux only. Requires io_uring with the `NODROP` and `SUBMIT_STABLE`
//! feature bits (kernel 5.4+).

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod completion;
pub(crate) mod io_thread;
pub(crate) mod metrics;
pub(crate) mod operation;
pub(crate) mod queue;
pub(crate) mod ring;
pub(crate) mod socket;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod error;

// ── Re-exports ──────────────────────────────────────────────────────────

/// Runtime configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Engine errors.
pub use error::Error;
/// Domain classification of a failed socket operation.
pub use error::SocketError;
/// The dedicated event-loop thread owning one `io_uring`.
pub use io_thread::IoThread;
/// Result published to a completion sink.
pub use operation::Completion;
/// Terminal classification of how an operation ended.
pub use operation::CompletionKind;
/// One-shot continuation fired when an operation completes.
pub use operation::CompletionSink;
/// Client-visible handle to an in-flight operation.
pub use operation::OperationHandle;
/// Per-socket surface: per-direction queues bound to an I/O thread.
pub use socket::AsyncSocket;
