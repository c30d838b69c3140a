use std::os::fd::RawFd;
use std::sync::Arc;

use crate::error::Error;
use crate::io_thread::IoThread;
use crate::operation::{CompletionSink, Direction, OperationHandle, SocketOperation};
use crate::queue::OperationQueue;

/// Higher-level surface over one socket: a pair of per-direction operation
/// queues bound to an I/O thread.
///
/// The file descriptor is borrowed, not owned — socket creation, option
/// setting, and closing remain the caller's concern. The caller must keep
/// the descriptor open until the socket is disposed and every completion
/// has fired.
pub struct AsyncSocket {
    fd: RawFd,
    recv_queue: Arc<OperationQueue>,
    send_queue: Arc<OperationQueue>,
}

impl AsyncSocket {
    /// Bind a socket descriptor to the given I/O thread.
    pub fn register(io: &IoThread, fd: RawFd) -> Self {
        AsyncSocket {
            fd,
            recv_queue: OperationQueue::new(Direction::Read, io.shared().clone()),
            send_queue: OperationQueue::new(Direction::Write, io.shared().clone()),
        }
    }

    /// Receive into `buf`, preferring the synchronous fast path when the
    /// read queue is empty. The sink fires exactly once with the outcome
    /// and the buffer.
    pub fn recv(&self, buf: Vec<u8>, sink: CompletionSink) -> Result<OperationHandle, Error> {
        self.recv_with(buf, sink, true)
    }

    /// Receive with explicit control over the synchronous fast path.
    pub fn recv_with(
        &self,
        buf: Vec<u8>,
        sink: CompletionSink,
        prefer_sync: bool,
    ) -> Result<OperationHandle, Error> {
        let op = SocketOperation::new(self.fd, Direction::Read, buf, sink);
        self.recv_queue.execute_async(op.clone(), prefer_sync)?;
        Ok(OperationHandle::new(op))
    }

    /// Send the contents of `buf`, preferring the synchronous fast path
    /// when the write queue is empty. A partial transfer completes with the
    /// byte count actually written; resubmitting the remainder is the
    /// caller's concern.
    pub fn send(&self, buf: Vec<u8>, sink: CompletionSink) -> Result<OperationHandle, Error> {
        self.send_with(buf, sink, true)
    }

    /// Send with explicit control over the synchronous fast path.
    pub fn send_with(
        &self,
        buf: Vec<u8>,
        sink: CompletionSink,
        prefer_sync: bool,
    ) -> Result<OperationHandle, Error> {
        let op = SocketOperation::new(self.fd, Direction::Write, buf, sink);
        self.send_queue.execute_async(op.clone(), prefer_sync)?;
        Ok(OperationHandle::new(op))
    }

    /// Zero-byte readiness probe: completes with 0 bytes once the socket is
    /// readable, without transferring anything.
    pub fn poll_readable(&self, sink: CompletionSink) -> Result<OperationHandle, Error> {
        self.recv_with(Vec::new(), sink, false)
    }

    /// Zero-byte readiness probe for writability.
    pub fn poll_writable(&self, sink: CompletionSink) -> Result<OperationHandle, Error> {
        self.send_with(Vec::new(), sink, false)
    }

    /// Dispose both direction queues, completing every pending operation as
    /// cancelled. Returns whether this call disposed a live queue.
    pub fn dispose(&self) -> bool {
        let recv = self.recv_queue.dispose();
        let send = self.send_queue.dispose();
        recv || send
    }

    /// The underlying descriptor.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }
}
