use std::cell::UnsafeCell;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::completion::AsyncResult;
use crate::error::SocketError;
use crate::io_thread::with_ring;
use crate::metrics;
use crate::queue::OperationQueue;
use crate::ring::PinnedSlice;

/// Side of the socket an operation belongs to. Each direction has its own
/// queue and poll mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

impl Direction {
    /// The poll mask used as the opaque data tag for this direction.
    pub(crate) fn poll_mask(self) -> u32 {
        match self {
            Direction::Read => libc::POLLIN as u32,
            Direction::Write => libc::POLLOUT as u32,
        }
    }
}

/// Terminal classification of how an operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionKind {
    /// Completed inline on the caller's thread, without touching the ring.
    FinishedSync = 1,
    /// Completed through the ring on the I/O thread.
    FinishedAsync = 2,
    /// Completed as cancelled (explicit cancel or queue disposal).
    Canceled = 3,
}

const KIND_PENDING: u8 = 0;

/// Result published to the completion sink when an operation finishes.
#[derive(Debug)]
pub struct Completion {
    /// How the operation ended.
    pub kind: CompletionKind,
    /// Bytes transferred. Zero for readiness probes and cancelled ops.
    pub bytes: usize,
    /// Domain error, when the kernel reported one.
    pub error: Option<SocketError>,
    /// The caller's buffer, handed back. `None` when the kernel still owned
    /// the buffer at cancellation time — the allocation is released once
    /// the in-flight request drains.
    pub buffer: Option<Vec<u8>>,
}

/// Continuation fired exactly once when an operation completes.
pub type CompletionSink = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Outcome of giving an operation a chance to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecResult {
    /// A kernel submission is outstanding; the callback will re-drive.
    Executing,
    /// The fd is not ready and no poll could be armed; stay queued.
    WaitForPoll,
    /// Result recorded; the op can be completed and dequeued.
    Finished,
    /// Cancellation took effect; complete as cancelled and dequeue.
    Cancelled,
}

/// Interpretation of a raw CQE value, factored out for unit testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interpreted {
    /// `EINTR`: resubmit on the spot.
    Resubmit,
    /// `ECANCELED`: the kernel cancelled our submission.
    Cancelled,
    /// `EAGAIN`: not ready, wait for readiness.
    WaitForPoll,
    /// Terminal result. `errno == 0` means success with `bytes` transferred.
    Complete { bytes: usize, errno: i32 },
}

/// Translate a CQE value. Readiness probes clamp positive results (poll
/// masks) to zero bytes.
pub(crate) fn interpret(res: i32, probe: bool) -> Interpreted {
    if res >= 0 {
        let bytes = if probe { 0 } else { res as usize };
        return Interpreted::Complete { bytes, errno: 0 };
    }
    match -res {
        libc::EINTR => Interpreted::Resubmit,
        libc::ECANCELED => Interpreted::Cancelled,
        libc::EAGAIN => Interpreted::WaitForPoll,
        errno => Interpreted::Complete { bytes: 0, errno },
    }
}

/// One logical client request: a pooled state machine that first attempts a
/// non-blocking syscall and otherwise drives a linked poll + transfer
/// through the execution queue.
///
/// Lives on exactly one [`OperationQueue`] at a time. The queue's protocol
/// serializes every buffer access: the caller's thread touches it only on
/// the inline fast path (empty queue), the kernel only between submission
/// and CQE, and completion only after either.
pub(crate) struct SocketOperation {
    fd: RawFd,
    direction: Direction,
    buf: UnsafeCell<Vec<u8>>,
    /// Buffer length, fixed at construction. Zero marks a readiness probe.
    len: u32,
    cancel_requested: AtomicBool,
    bytes: AtomicUsize,
    /// Raw errno of a failed transfer; 0 while pending or on success.
    errno: AtomicI32,
    kind: AtomicU8,
    sink: Mutex<Option<CompletionSink>>,
}

// Safety: the buffer behind `buf` is accessed by at most one party at a
// time (see the type-level comment); every other field is atomic or
// internally locked.
unsafe impl Send for SocketOperation {}
unsafe impl Sync for SocketOperation {}

enum SyncOutcome {
    Completed,
    WouldBlock,
}

impl SocketOperation {
    pub(crate) fn new(
        fd: RawFd,
        direction: Direction,
        buf: Vec<u8>,
        sink: CompletionSink,
    ) -> Arc<Self> {
        let len = buf.len() as u32;
        Arc::new(SocketOperation {
            fd,
            direction,
            buf: UnsafeCell::new(buf),
            len,
            cancel_requested: AtomicBool::new(false),
            bytes: AtomicUsize::new(0),
            errno: AtomicI32::new(0),
            kind: AtomicU8::new(KIND_PENDING),
            sink: Mutex::new(Some(sink)),
        })
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    fn is_probe(&self) -> bool {
        self.len == 0
    }

    fn buffer_raw(&self) -> *mut u8 {
        // Safety: serialized access per the type-level comment; the Vec
        // itself is never reallocated while an operation is live.
        unsafe { (*self.buf.get()).as_mut_ptr() }
    }

    /// Attempt the non-blocking syscall on the caller's thread. Returns
    /// true when a terminal result (success or error) was recorded.
    /// Readiness probes always report false: a zero-length `recv` would
    /// succeed unconditionally, so probes take the poll path.
    pub(crate) fn try_execute_sync(&self) -> bool {
        if self.is_probe() {
            return false;
        }
        matches!(self.sync_call(), SyncOutcome::Completed)
    }

    fn sync_call(&self) -> SyncOutcome {
        loop {
            let n = unsafe {
                // Safety: fd and buffer are valid for the duration of the
                // call; MSG_DONTWAIT keeps it non-blocking regardless of
                // the fd's own flags.
                match self.direction {
                    Direction::Read => libc::recv(
                        self.fd,
                        self.buffer_raw() as *mut libc::c_void,
                        self.len as usize,
                        libc::MSG_DONTWAIT,
                    ),
                    Direction::Write => libc::send(
                        self.fd,
                        self.buffer_raw() as *const libc::c_void,
                        self.len as usize,
                        libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                    ),
                }
            };
            if n >= 0 {
                self.bytes.store(n as usize, Ordering::Relaxed);
                return SyncOutcome::Completed;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EAGAIN) => return SyncOutcome::WouldBlock,
                Some(libc::EINTR) => continue,
                Some(errno) => {
                    self.errno.store(errno, Ordering::Relaxed);
                    return SyncOutcome::Completed;
                }
                None => {
                    self.errno.store(libc::EIO, Ordering::Relaxed);
                    return SyncOutcome::Completed;
                }
            }
        }
    }

    /// Give the operation a chance: interpret an incoming CQE result, or
    /// submit if this is a fresh tick.
    pub(crate) fn try_execute(
        self: &Arc<Self>,
        queue: &Arc<OperationQueue>,
        data: u32,
        result: AsyncResult,
    ) -> ExecResult {
        if result.has_result() {
            self.handle_result(result.value(), queue, data)
        } else {
            self.try_execute_async(queue, data)
        }
    }

    fn handle_result(
        self: &Arc<Self>,
        res: i32,
        queue: &Arc<OperationQueue>,
        data: u32,
    ) -> ExecResult {
        match interpret(res, self.is_probe()) {
            Interpreted::Complete { bytes, errno } => {
                // A result that raced ahead of cancellation still wins;
                // callers must tolerate late success.
                self.bytes.store(bytes, Ordering::Relaxed);
                self.errno.store(errno, Ordering::Relaxed);
                ExecResult::Finished
            }
            Interpreted::Cancelled => ExecResult::Cancelled,
            Interpreted::Resubmit | Interpreted::WaitForPoll => {
                if self.cancel_requested() {
                    return ExecResult::Cancelled;
                }
                // The ring always supports readiness polling, so both
                // retryable outcomes resubmit on the spot.
                self.try_execute_async(queue, data)
            }
        }
    }

    fn try_execute_async(self: &Arc<Self>, queue: &Arc<OperationQueue>, data: u32) -> ExecResult {
        let submitted = with_ring(|ring| {
            let pin = PinnedSlice::new(
                self.buffer_raw(),
                self.len,
                self.clone() as Arc<dyn std::any::Any + Send + Sync>,
            );
            let q = queue.clone();
            let callback = Box::new(move |result: AsyncResult, _data: u32| {
                q.execute_queued(result);
            });
            match self.direction {
                Direction::Read => ring.add_read(self.fd, pin, callback, data),
                Direction::Write => ring.add_write(self.fd, pin, callback, data),
            }
        });
        if submitted.is_some() {
            return ExecResult::Executing;
        }

        // No execution queue reachable from this context (shutdown drain);
        // fall back to the non-blocking syscall.
        match self.sync_call() {
            SyncOutcome::Completed => ExecResult::Finished,
            SyncOutcome::WouldBlock => ExecResult::WaitForPoll,
        }
    }

    pub(crate) fn complete_sync(&self) {
        self.finish(CompletionKind::FinishedSync, true);
    }

    pub(crate) fn complete_async(&self) {
        self.finish(CompletionKind::FinishedAsync, true);
    }

    /// Complete as cancelled. `keep_buffer` is false when the kernel still
    /// owns the buffer — the allocation then stays inside the operation and
    /// is freed once the in-flight request drains and the pin drops.
    pub(crate) fn complete_cancelled(&self, keep_buffer: bool) {
        self.finish(CompletionKind::Canceled, keep_buffer);
    }

    /// Publish the result fields and fire the sink. Idempotent: later calls
    /// (e.g. a dispose racing a kernel completion) are dropped.
    fn finish(&self, kind: CompletionKind, keep_buffer: bool) {
        let sink = match self.sink.lock().take() {
            Some(sink) => sink,
            None => return,
        };
        self.kind.store(kind as u8, Ordering::Release);

        let cancelled = kind == CompletionKind::Canceled;
        let bytes = if cancelled {
            0
        } else {
            self.bytes.load(Ordering::Relaxed)
        };
        let errno = if cancelled {
            0
        } else {
            self.errno.load(Ordering::Relaxed)
        };
        let error = if errno == 0 {
            None
        } else {
            Some(SocketError::from_errno(errno))
        };
        let buffer = if keep_buffer {
            // Safety: the kernel holds no reference to the allocation on
            // this path, and the op is terminal — no further access.
            Some(std::mem::take(unsafe { &mut *self.buf.get() }))
        } else {
            None
        };

        match kind {
            CompletionKind::FinishedSync => metrics::OPS_COMPLETED_SYNC.increment(),
            CompletionKind::FinishedAsync => metrics::OPS_COMPLETED_ASYNC.increment(),
            CompletionKind::Canceled => metrics::OPS_CANCELED.increment(),
        };

        sink(Completion {
            kind,
            bytes,
            error,
            buffer,
        });
    }

    fn completion_kind(&self) -> Option<CompletionKind> {
        match self.kind.load(Ordering::Acquire) {
            1 => Some(CompletionKind::FinishedSync),
            2 => Some(CompletionKind::FinishedAsync),
            3 => Some(CompletionKind::Canceled),
            _ => None,
        }
    }
}

/// Client-visible handle to an in-flight operation.
///
/// Observation methods are meaningful once the completion sink has fired.
pub struct OperationHandle {
    op: Arc<SocketOperation>,
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle").finish()
    }
}

impl OperationHandle {
    pub(crate) fn new(op: Arc<SocketOperation>) -> Self {
        OperationHandle { op }
    }

    /// Request cooperative cancellation. Advisory: takes effect at the
    /// operation's next yielding point, or when the kernel reports
    /// `ECANCELED`. A result that arrives first still wins.
    pub fn cancel(&self) {
        self.op.request_cancel();
    }

    /// Terminal classification, or `None` while the operation is pending.
    pub fn completion_kind(&self) -> Option<CompletionKind> {
        self.op.completion_kind()
    }

    /// Bytes transferred, valid once completed.
    pub fn bytes_transferred(&self) -> usize {
        self.op.bytes.load(Ordering::Relaxed)
    }

    /// Domain error, valid once completed.
    pub fn error(&self) -> Option<SocketError> {
        match self.op.errno.load(Ordering::Relaxed) {
            0 => None,
            errno => Some(SocketError::from_errno(errno)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpret_success() {
        assert_eq!(
            interpret(17, false),
            Interpreted::Complete {
                bytes: 17,
                errno: 0
            }
        );
        // EOF is a terminal zero-byte success.
        assert_eq!(
            interpret(0, false),
            Interpreted::Complete { bytes: 0, errno: 0 }
        );
    }

    #[test]
    fn interpret_probe_clamps_poll_mask() {
        // A readiness probe completes with the poll mask as its CQE value;
        // the byte count it reports must still be zero.
        assert_eq!(
            interpret(libc::POLLIN as i32, true),
            Interpreted::Complete { bytes: 0, errno: 0 }
        );
    }

    #[test]
    fn interpret_retryable() {
        assert_eq!(interpret(-libc::EINTR, false), Interpreted::Resubmit);
        assert_eq!(interpret(-libc::EAGAIN, false), Interpreted::WaitForPoll);
    }

    #[test]
    fn interpret_cancel_and_errors() {
        assert_eq!(interpret(-libc::ECANCELED, false), Interpreted::Cancelled);
        assert_eq!(
            interpret(-libc::ECONNRESET, false),
            Interpreted::Complete {
                bytes: 0,
                errno: libc::ECONNRESET
            }
        );
    }

    #[test]
    fn finish_fires_sink_once() {
        let (tx, rx) = std::sync::mpsc::channel();
        let op = SocketOperation::new(
            -1,
            Direction::Read,
            vec![0u8; 4],
            Box::new(move |c| {
                let _ = tx.send(c.kind);
            }),
        );
        op.complete_async();
        op.complete_cancelled(true);
        assert_eq!(rx.try_recv(), Ok(CompletionKind::FinishedAsync));
        assert!(rx.try_recv().is_err());
        assert_eq!(op.completion_kind(), Some(CompletionKind::FinishedAsync));
    }

    #[test]
    fn cancelled_completion_masks_result_fields() {
        let (tx, rx) = std::sync::mpsc::channel();
        let op = SocketOperation::new(
            -1,
            Direction::Read,
            vec![0u8; 4],
            Box::new(move |c| {
                let _ = tx.send((c.bytes, c.error));
            }),
        );
        op.bytes.store(3, Ordering::Relaxed);
        op.complete_cancelled(true);
        assert_eq!(rx.try_recv(), Ok((0, None)));
    }

    #[test]
    fn cancelled_in_flight_withholds_buffer() {
        let (tx, rx) = std::sync::mpsc::channel();
        let op = SocketOperation::new(
            -1,
            Direction::Read,
            vec![0u8; 4],
            Box::new(move |c: Completion| {
                let _ = tx.send(c.buffer.is_none());
            }),
        );
        op.complete_cancelled(false);
        assert_eq!(rx.try_recv(), Ok(true));
    }
}
