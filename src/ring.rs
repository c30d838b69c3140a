use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use io_uring::types::{Fd, Timespec};
use io_uring::{opcode, squeue, IoUring};

use crate::completion::{AsyncResult, ExecutionCallback, OpKey};
use crate::config::Config;
use crate::error::Error;
use crate::metrics;

/// Reserved user_data for the shutdown-drain timeout SQE. Bit 31 is set so
/// the completion-drain discard path accepts it without a table entry.
const TIMEOUT_KEY: u64 = 1 << 31;
/// Reserved user_data for AsyncCancel SQEs issued during shutdown.
const CANCEL_KEY: u64 = (1 << 31) | 1;

/// Kind of kernel request carried by an [`Operation`] record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Read,
    Write,
    PollIn,
    PollOut,
}

impl OpKind {
    /// SQEs consumed when this kind is encoded (read/write submit a linked
    /// poll + readv/writev pair).
    fn sqe_count(self) -> u32 {
        match self {
            OpKind::Read | OpKind::Write => 2,
            OpKind::PollIn | OpKind::PollOut => 1,
        }
    }
}

/// A byte buffer handed to the kernel, with a keep-alive that pins the
/// owning allocation until the CQE is consumed.
///
/// The owner is released exactly once, when the completion is drained and
/// before the callback runs. Callers must not touch the memory behind `ptr`
/// while the pin is live.
pub(crate) struct PinnedSlice {
    ptr: *mut u8,
    len: u32,
    owner: Arc<dyn Any + Send + Sync>,
}

impl PinnedSlice {
    pub(crate) fn new(ptr: *mut u8, len: u32, owner: Arc<dyn Any + Send + Sync>) -> Self {
        PinnedSlice { ptr, len, owner }
    }
}

/// Pooled descriptor for one in-flight kernel request.
struct Operation {
    kind: OpKind,
    fd: RawFd,
    ptr: *mut u8,
    len: u32,
    data: u32,
    pin: Option<Arc<dyn Any + Send + Sync>>,
    callback: Option<ExecutionCallback>,
}

impl Operation {
    fn vacant() -> Self {
        Operation {
            kind: OpKind::PollIn,
            fd: -1,
            ptr: std::ptr::null_mut(),
            len: 0,
            data: 0,
            pin: None,
            callback: None,
        }
    }
}

/// Stack-discipline free list of [`Operation`] records.
///
/// `rent` pops or grows, `release` clears the record (dropping the pin) and
/// pushes the slot back. Unbounded; the live set is capped by peak
/// concurrency.
struct OperationPool {
    slots: Vec<Operation>,
    free: Vec<u32>,
}

impl OperationPool {
    fn new() -> Self {
        OperationPool {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn rent(&mut self) -> u32 {
        match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Operation::vacant());
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Drop the pin, take the callback, and return the slot to the free list.
    fn release(&mut self, slot: u32) -> (Option<ExecutionCallback>, u32) {
        let op = &mut self.slots[slot as usize];
        op.pin = None;
        let callback = op.callback.take();
        let data = op.data;
        op.ptr = std::ptr::null_mut();
        op.len = 0;
        self.free.push(slot);
        (callback, data)
    }

    #[cfg(test)]
    fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// One cache-line-aligned iovec entry.
#[repr(C, align(64))]
struct IoVecSlot {
    iov: libc::iovec,
}

/// Fixed table of iovec entries, one per read/write op in the current
/// submission batch.
///
/// `IORING_FEAT_SUBMIT_STABLE` guarantees the kernel consumes the iovec at
/// submit, so the cursor resets as soon as a batch is fully accepted.
struct IoVecTable {
    slots: Box<[IoVecSlot]>,
    next: usize,
}

impl IoVecTable {
    fn new(entries: u32) -> Self {
        let mut slots = Vec::with_capacity(entries as usize);
        for _ in 0..entries {
            slots.push(IoVecSlot {
                iov: libc::iovec {
                    iov_base: std::ptr::null_mut(),
                    iov_len: 0,
                },
            });
        }
        IoVecTable {
            slots: slots.into_boxed_slice(),
            next: 0,
        }
    }

    /// Claim the next entry for the current batch. `None` when the batch is full.
    fn rent(&mut self, ptr: *mut u8, len: u32) -> Option<*const libc::iovec> {
        let slot = self.slots.get_mut(self.next)?;
        slot.iov.iov_base = ptr as *mut libc::c_void;
        slot.iov.iov_len = len as usize;
        self.next += 1;
        Some(&slot.iov as *const libc::iovec)
    }

    fn reset(&mut self) {
        self.next = 0;
    }
}

/// Thin adapter over a single `io_uring`: accepts read/write/poll
/// submissions, manages the submission/completion lifecycle, pins buffers
/// for the duration of a kernel call, and hands completions back for
/// callback dispatch.
///
/// Not thread-safe. Every method must be called from the I/O thread that
/// owns the instance (the raw pointers held in records make the type
/// `!Send`, which the compiler enforces).
pub(crate) struct ExecutionQueue {
    ring: IoUring,
    /// Outstanding records, keyed by `(fd << 32) | data`.
    operations: HashMap<u64, u32>,
    pool: OperationPool,
    /// Slots added but not yet encoded as SQEs, in submission order.
    new_ops: VecDeque<u32>,
    /// Prefix of `new_ops` already encoded into the SQ.
    encoded_ops: usize,
    /// SQEs encoded but not yet accepted by the kernel.
    sqes_queued: u32,
    iovecs: IoVecTable,
    /// Reusable CQE drain buffer.
    cqe_batch: Vec<(u64, i32)>,
    /// Timespec for the shutdown-drain timeout; must outlive its SQE.
    drain_ts: Timespec,
}

impl ExecutionQueue {
    /// Build the ring and verify the kernel features this engine relies on.
    ///
    /// `NODROP` guarantees CQEs are never dropped; `SUBMIT_STABLE` allows
    /// the iovec table to be reused across submissions. Construction is
    /// all-or-nothing: on error everything acquired so far is released by
    /// drop glue.
    pub(crate) fn setup(config: &Config) -> Result<Self, Error> {
        let ring = IoUring::new(config.sq_entries)?;

        let params = ring.params();
        if !params.is_feature_nodrop() {
            return Err(Error::RingSetup(
                "kernel does not advertise IORING_FEAT_NODROP".into(),
            ));
        }
        if !params.is_feature_submit_stable() {
            return Err(Error::RingSetup(
                "kernel does not advertise IORING_FEAT_SUBMIT_STABLE".into(),
            ));
        }

        Ok(ExecutionQueue {
            ring,
            operations: HashMap::new(),
            pool: OperationPool::new(),
            new_ops: VecDeque::new(),
            encoded_ops: 0,
            sqes_queued: 0,
            iovecs: IoVecTable::new(config.iovec_entries),
            cqe_batch: Vec::with_capacity(config.sq_entries as usize),
            drain_ts: Timespec::new().nsec(100_000_000),
        })
    }

    /// Enqueue a read. Zero-length buffers degrade to a readiness poll, so
    /// the completion reports 0 bytes without a `READV` ever being issued.
    pub(crate) fn add_read(
        &mut self,
        fd: RawFd,
        buf: PinnedSlice,
        callback: ExecutionCallback,
        data: u32,
    ) {
        if buf.len == 0 {
            return self.add_poll_in(fd, callback, data);
        }
        self.push_op(
            OpKind::Read,
            fd,
            buf.ptr,
            buf.len,
            Some(buf.owner),
            callback,
            data,
        );
    }

    /// Enqueue a write. Zero-length buffers degrade to a writability poll.
    pub(crate) fn add_write(
        &mut self,
        fd: RawFd,
        buf: PinnedSlice,
        callback: ExecutionCallback,
        data: u32,
    ) {
        if buf.len == 0 {
            return self.add_poll_out(fd, callback, data);
        }
        self.push_op(
            OpKind::Write,
            fd,
            buf.ptr,
            buf.len,
            Some(buf.owner),
            callback,
            data,
        );
    }

    /// Enqueue a readability poll whose completion invokes the callback.
    pub(crate) fn add_poll_in(&mut self, fd: RawFd, callback: ExecutionCallback, data: u32) {
        self.push_op(
            OpKind::PollIn,
            fd,
            std::ptr::null_mut(),
            0,
            None,
            callback,
            data,
        );
    }

    /// Enqueue a writability poll whose completion invokes the callback.
    pub(crate) fn add_poll_out(&mut self, fd: RawFd, callback: ExecutionCallback, data: u32) {
        self.push_op(
            OpKind::PollOut,
            fd,
            std::ptr::null_mut(),
            0,
            None,
            callback,
            data,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn push_op(
        &mut self,
        kind: OpKind,
        fd: RawFd,
        ptr: *mut u8,
        len: u32,
        pin: Option<Arc<dyn Any + Send + Sync>>,
        callback: ExecutionCallback,
        data: u32,
    ) {
        let key = OpKey::encode(fd, data).raw();
        debug_assert!(
            !self.operations.contains_key(&key),
            "caller must keep keys unique among outstanding operations"
        );

        let slot = self.pool.rent();
        let op = &mut self.pool.slots[slot as usize];
        op.kind = kind;
        op.fd = fd;
        op.ptr = ptr;
        op.len = len;
        op.data = data;
        op.pin = pin;
        op.callback = Some(callback);

        self.operations.insert(key, slot);
        self.new_ops.push_back(slot);
    }

    /// Encode as many pending operations as SQ slots and iovec entries
    /// allow. Not re-entered until the currently encoded batch has been
    /// fully accepted by the kernel — there is no per-operation SQE count
    /// with which to resume a partial encoding.
    fn write_submissions(&mut self) {
        debug_assert_eq!(self.encoded_ops, 0);

        let mut sq = self.ring.submission();
        while self.encoded_ops < self.new_ops.len() {
            let slot = self.new_ops[self.encoded_ops];
            let op = &self.pool.slots[slot as usize];
            let need = op.kind.sqe_count();
            if ((sq.capacity() - sq.len()) as u32) < need {
                break;
            }

            let key = OpKey::encode(op.fd, op.data);
            let pushed = match op.kind {
                OpKind::Read | OpKind::Write => {
                    let iov = match self.iovecs.rent(op.ptr, op.len) {
                        Some(iov) => iov,
                        None => break,
                    };
                    let (mask, transfer) = if op.kind == OpKind::Read {
                        (
                            libc::POLLIN as u32,
                            opcode::Readv::new(Fd(op.fd), iov, 1).build(),
                        )
                    } else {
                        (
                            libc::POLLOUT as u32,
                            opcode::Writev::new(Fd(op.fd), iov, 1).build(),
                        )
                    };
                    // Linked pair: the readv/writev runs only once the fd is
                    // actually ready, so a non-blocking socket never burns a
                    // kernel worker on EAGAIN.
                    let poll = opcode::PollAdd::new(Fd(op.fd), mask)
                        .build()
                        .user_data(key.as_poll().raw())
                        .flags(squeue::Flags::IO_LINK);
                    let transfer = transfer.user_data(key.raw());
                    // Safety: buffer and iovec stay valid until the CQE is
                    // consumed (pin) / the batch is submitted (SUBMIT_STABLE).
                    unsafe { sq.push_multiple(&[poll, transfer]).is_ok() }
                }
                OpKind::PollIn | OpKind::PollOut => {
                    let mask = if op.kind == OpKind::PollIn {
                        libc::POLLIN as u32
                    } else {
                        libc::POLLOUT as u32
                    };
                    let entry = opcode::PollAdd::new(Fd(op.fd), mask)
                        .build()
                        .user_data(key.raw());
                    // Safety: no user memory referenced.
                    unsafe { sq.push(&entry).is_ok() }
                }
            };
            if !pushed {
                // Free space was checked above; a failed push means the SQ
                // state is inconsistent with our accounting.
                debug_assert!(false, "SQ push failed despite free space");
                break;
            }

            self.sqes_queued += need;
            self.encoded_ops += 1;
        }
    }

    /// Flush submissions to the kernel, then optionally block until at
    /// least one completion is available.
    ///
    /// `may_wait` is consulted only when no further batches remain to
    /// encode. Kernel backpressure (`EBUSY`, `EAGAIN`) and `EINTR` are
    /// swallowed; the event loop drains completions and retries.
    pub(crate) fn submit_and_wait(&mut self, may_wait: &dyn Fn() -> bool) -> Result<(), Error> {
        loop {
            if self.encoded_ops == 0 {
                self.write_submissions();
            }
            let last_batch = self.encoded_ops == self.new_ops.len();
            let want = if last_batch && may_wait() { 1 } else { 0 };
            if self.sqes_queued == 0 && want == 0 {
                return Ok(());
            }

            let submitted = match self.ring.submitter().submit_and_wait(want) {
                Ok(n) => n as u32,
                Err(e) => {
                    return match e.raw_os_error() {
                        Some(libc::EBUSY) | Some(libc::EAGAIN) => {
                            metrics::SUBMIT_BACKPRESSURE.increment();
                            Ok(())
                        }
                        Some(libc::EINTR) => Ok(()),
                        _ => Err(Error::Io(e)),
                    };
                }
            };

            if submitted < self.sqes_queued {
                // Kernel accepted only part of the batch. Keep the encoded
                // remainder in the SQ and retry on the next loop iteration.
                metrics::SUBMIT_PARTIAL.increment();
                self.sqes_queued -= submitted;
                return Ok(());
            }

            self.sqes_queued = 0;
            self.new_ops.drain(..self.encoded_ops);
            self.encoded_ops = 0;
            self.iovecs.reset();

            if self.new_ops.is_empty() {
                return Ok(());
            }
        }
    }

    /// Drain all ready CQEs.
    ///
    /// For each known key: release the pin, return the record to the pool,
    /// and hand back `(callback, result, data)` for dispatch once the
    /// mutable borrow of the queue has ended (callbacks re-enter the
    /// execution queue to resubmit). Unknown keys must carry the poll flag
    /// — they are the discarded halves of linked pairs — or one of the
    /// reserved shutdown keys, which share that bit.
    pub(crate) fn execute_completions(
        &mut self,
    ) -> Vec<(ExecutionCallback, AsyncResult, u32)> {
        self.cqe_batch.clear();
        {
            let cq = self.ring.completion();
            for cqe in cq {
                self.cqe_batch.push((cqe.user_data(), cqe.result()));
            }
        }

        let mut ready = Vec::with_capacity(self.cqe_batch.len());
        for i in 0..self.cqe_batch.len() {
            let (key, res) = self.cqe_batch[i];
            metrics::CQE_PROCESSED.increment();
            match self.operations.remove(&key) {
                Some(slot) => {
                    let (callback, data) = self.pool.release(slot);
                    if let Some(callback) = callback {
                        ready.push((callback, AsyncResult::new(res), data));
                    }
                }
                None => {
                    debug_assert!(
                        OpKey(key).is_poll(),
                        "completion for unknown key without poll flag"
                    );
                    metrics::POLL_CQE_DISCARDED.increment();
                }
            }
        }
        ready
    }

    /// Number of records still registered with the kernel.
    pub(crate) fn outstanding(&self) -> usize {
        self.operations.len()
    }

    /// Push an `AsyncCancel` for every outstanding record. Used by the
    /// shutdown drain so in-flight buffers are handed back before the ring
    /// is torn down. Read/write pairs get a second cancel targeting the
    /// linked poll, which is what actually breaks a chain still waiting on
    /// readiness.
    pub(crate) fn cancel_all(&mut self) -> io::Result<()> {
        let targets: Vec<(u64, bool)> = self
            .operations
            .iter()
            .map(|(&key, &slot)| {
                let kind = self.pool.slots[slot as usize].kind;
                (key, matches!(kind, OpKind::Read | OpKind::Write))
            })
            .collect();
        for (key, linked) in targets {
            if linked {
                let poll = opcode::AsyncCancel::new(OpKey(key).as_poll().raw())
                    .build()
                    .user_data(CANCEL_KEY);
                self.push_control(poll)?;
            }
            let entry = opcode::AsyncCancel::new(key).build().user_data(CANCEL_KEY);
            self.push_control(entry)?;
        }
        self.ring.submit()?;
        Ok(())
    }

    /// Submit with a bounded wait: arms a 100ms timeout SQE so the enter
    /// call cannot block indefinitely when a completion never arrives.
    pub(crate) fn submit_and_wait_bounded(&mut self) -> io::Result<()> {
        let entry = opcode::Timeout::new(&self.drain_ts as *const Timespec)
            .build()
            .user_data(TIMEOUT_KEY);
        self.push_control(entry)?;
        match self.ring.submitter().submit_and_wait(1) {
            Ok(_) => Ok(()),
            Err(e) => match e.raw_os_error() {
                Some(libc::EBUSY) | Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(()),
                _ => Err(e),
            },
        }
    }

    /// Push a control SQE (cancel, timeout) outside the batching path,
    /// submitting first if the SQ is full.
    fn push_control(&mut self, entry: squeue::Entry) -> io::Result<()> {
        // Safety: control entries reference either nothing or `drain_ts`,
        // which lives as long as the queue.
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                if self.ring.submission().push(&entry).is_err() {
                    return Err(io::Error::other("SQ still full after submit"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_rents_and_reuses() {
        let mut pool = OperationPool::new();
        let a = pool.rent();
        let b = pool.rent();
        assert_ne!(a, b);
        assert_eq!(pool.live(), 2);

        pool.slots[a as usize].callback = Some(Box::new(|_, _| {}));
        let (callback, _) = pool.release(a);
        assert!(callback.is_some());
        assert_eq!(pool.live(), 1);

        // LIFO free list hands the released slot straight back.
        let c = pool.rent();
        assert_eq!(c, a);
    }

    #[test]
    fn pool_release_clears_record() {
        let mut pool = OperationPool::new();
        let slot = pool.rent();
        {
            let op = &mut pool.slots[slot as usize];
            op.ptr = 0x1000 as *mut u8;
            op.len = 64;
            op.pin = Some(Arc::new(42u32));
            op.callback = Some(Box::new(|_, _| {}));
        }
        pool.release(slot);
        let op = &pool.slots[slot as usize];
        assert!(op.ptr.is_null());
        assert_eq!(op.len, 0);
        assert!(op.pin.is_none());
        assert!(op.callback.is_none());
    }

    #[test]
    fn pin_dropped_on_release() {
        let mut pool = OperationPool::new();
        let owner = Arc::new(vec![0u8; 8]);
        let slot = pool.rent();
        pool.slots[slot as usize].pin = Some(owner.clone());
        assert_eq!(Arc::strong_count(&owner), 2);
        pool.release(slot);
        assert_eq!(Arc::strong_count(&owner), 1);
    }

    #[test]
    fn iovec_table_bounds_batch() {
        let mut table = IoVecTable::new(2);
        let mut buf = [0u8; 16];
        assert!(table.rent(buf.as_mut_ptr(), 16).is_some());
        assert!(table.rent(buf.as_mut_ptr(), 16).is_some());
        assert!(table.rent(buf.as_mut_ptr(), 16).is_none());
        table.reset();
        assert!(table.rent(buf.as_mut_ptr(), 16).is_some());
    }

    #[test]
    fn iovec_entries_are_aligned() {
        let table = IoVecTable::new(4);
        for slot in table.slots.iter() {
            assert_eq!(slot as *const IoVecSlot as usize % 64, 0);
        }
    }

    #[test]
    fn reserved_keys_carry_poll_flag() {
        // The discard path asserts the poll bit on unknown keys; the
        // shutdown sentinels must satisfy it.
        assert!(OpKey(TIMEOUT_KEY).is_poll());
        assert!(OpKey(CANCEL_KEY).is_poll());
    }
}
