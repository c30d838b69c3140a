use std::io;

use thiserror::Error;

/// Errors returned by the ringsock engine.
#[derive(Debug, Error)]
pub enum Error {
    /// io_uring setup or operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Ring setup failed (e.g., unsupported kernel features).
    #[error("ring setup: {0}")]
    RingSetup(String),
    /// I/O thread setup failed (e.g., CPU affinity could not be applied).
    #[error("I/O thread setup: {0}")]
    ThreadSetup(String),
    /// Operation submitted to a disposed socket queue.
    #[error("socket queue disposed")]
    Disposed,
    /// The I/O thread has exited and no longer accepts work.
    #[error("I/O thread terminated")]
    ThreadTerminated,
}

/// Domain-level classification of a failed socket operation.
///
/// Produced by translating the raw errno carried in a CQE. Retryable
/// conditions (`EINTR`, `EAGAIN`) and cancellation (`ECANCELED`) never
/// surface here — they are absorbed by the operation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SocketError {
    /// Connection reset by peer (`ECONNRESET`).
    #[error("connection reset by peer")]
    ConnectionReset,
    /// Connection aborted (`ECONNABORTED`).
    #[error("connection aborted")]
    ConnectionAborted,
    /// Connection refused (`ECONNREFUSED`).
    #[error("connection refused")]
    ConnectionRefused,
    /// Local end already shut down (`EPIPE`).
    #[error("broken pipe")]
    BrokenPipe,
    /// Socket is not connected (`ENOTCONN`).
    #[error("socket not connected")]
    NotConnected,
    /// Operation timed out at the transport layer (`ETIMEDOUT`).
    #[error("operation timed out")]
    TimedOut,
    /// Not a valid open file descriptor (`EBADF`).
    #[error("bad file descriptor")]
    BadDescriptor,
    /// Kernel buffer space exhausted (`ENOBUFS` / `ENOMEM`).
    #[error("no buffer space available")]
    NoBufferSpace,
    /// Any other errno, preserved verbatim.
    #[error("os error {0}")]
    Os(i32),
}

impl SocketError {
    /// Translate a positive errno value to the nearest domain error.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ECONNRESET => SocketError::ConnectionReset,
            libc::ECONNABORTED => SocketError::ConnectionAborted,
            libc::ECONNREFUSED => SocketError::ConnectionRefused,
            libc::EPIPE => SocketError::BrokenPipe,
            libc::ENOTCONN => SocketError::NotConnected,
            libc::ETIMEDOUT => SocketError::TimedOut,
            libc::EBADF => SocketError::BadDescriptor,
            libc::ENOBUFS | libc::ENOMEM => SocketError::NoBufferSpace,
            other => SocketError::Os(other),
        }
    }

    /// The raw errno this error was translated from, when one maps back.
    pub fn raw_os_error(&self) -> i32 {
        match self {
            SocketError::ConnectionReset => libc::ECONNRESET,
            SocketError::ConnectionAborted => libc::ECONNABORTED,
            SocketError::ConnectionRefused => libc::ECONNREFUSED,
            SocketError::BrokenPipe => libc::EPIPE,
            SocketError::NotConnected => libc::ENOTCONN,
            SocketError::TimedOut => libc::ETIMEDOUT,
            SocketError::BadDescriptor => libc::EBADF,
            SocketError::NoBufferSpace => libc::ENOBUFS,
            SocketError::Os(errno) => *errno,
        }
    }
}
