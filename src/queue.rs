use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::completion::AsyncResult;
use crate::error::Error;
use crate::io_thread::IoShared;
use crate::operation::{Direction, ExecResult, SocketOperation};

const NONE: u32 = u32::MAX;

struct Node {
    op: Arc<SocketOperation>,
    next: u32,
    executing: bool,
}

/// Circular singly-linked list of pending operations, arena + index
/// rendition: each node carries its successor's slot index and the list
/// keeps only a `tail` pointer (`head = node[tail].next`; a single-element
/// list has `next == self`). Append is O(1); arbitrary removal walks the
/// ring.
struct OpList {
    slots: Vec<Option<Node>>,
    free: Vec<u32>,
    tail: u32,
}

impl OpList {
    fn new() -> Self {
        OpList {
            slots: Vec::new(),
            free: Vec::new(),
            tail: NONE,
        }
    }

    fn is_empty(&self) -> bool {
        self.tail == NONE
    }

    fn head(&self) -> Option<u32> {
        if self.tail == NONE {
            None
        } else {
            self.slots[self.tail as usize].as_ref().map(|n| n.next)
        }
    }

    fn node(&self, idx: u32) -> Option<&Node> {
        self.slots.get(idx as usize)?.as_ref()
    }

    fn op(&self, idx: u32) -> Option<Arc<SocketOperation>> {
        Some(self.node(idx)?.op.clone())
    }

    fn executing(&self, idx: u32) -> bool {
        self.node(idx).map(|n| n.executing).unwrap_or(false)
    }

    fn set_executing(&mut self, idx: u32, executing: bool) {
        if let Some(node) = self.slots.get_mut(idx as usize).and_then(|s| s.as_mut()) {
            node.executing = executing;
        }
    }

    /// Append after the tail and make the new node the tail.
    fn push_back(&mut self, op: Arc<SocketOperation>) -> u32 {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
        };
        let next = if self.tail == NONE {
            idx // single-element list points at itself
        } else {
            let head = self.slots[self.tail as usize]
                .as_ref()
                .map(|n| n.next)
                .unwrap_or(idx);
            if let Some(tail) = self.slots[self.tail as usize].as_mut() {
                tail.next = idx;
            }
            head
        };
        self.slots[idx as usize] = Some(Node {
            op,
            next,
            executing: false,
        });
        self.tail = idx;
        idx
    }

    /// Unlink a node. O(1) for the head, O(n) elsewhere: the predecessor is
    /// found by walking the ring starting from the tail.
    fn remove(&mut self, idx: u32) -> Option<(Arc<SocketOperation>, bool)> {
        if self.tail == NONE {
            return None;
        }
        let mut prev = self.tail;
        loop {
            let cur = self.slots[prev as usize].as_ref()?.next;
            if cur == idx {
                break;
            }
            if cur == self.tail {
                return None; // wrapped without finding it
            }
            prev = cur;
        }

        let node = self.slots[idx as usize].take()?;
        if node.next == idx {
            self.tail = NONE;
        } else {
            if let Some(prev_node) = self.slots[prev as usize].as_mut() {
                prev_node.next = node.next;
            }
            if self.tail == idx {
                self.tail = prev;
            }
        }
        self.free.push(idx);
        Some((node.op, node.executing))
    }

    /// Remove every node in FIFO order.
    fn drain(&mut self) -> Vec<(Arc<SocketOperation>, bool)> {
        let mut out = Vec::new();
        while let Some(head) = self.head() {
            match self.remove(head) {
                Some(entry) => out.push(entry),
                None => break,
            }
        }
        out
    }
}

struct QueueInner {
    list: OpList,
    /// Terminal state: set once, after which no operations are accepted.
    /// Stands in for the original's distinguished tail sentinel.
    disposed: bool,
}

/// Per-socket FIFO of logical operations in one direction.
///
/// Serializes execution so operations start and finish in submission order
/// within the direction, coordinates the handoff between client threads and
/// the I/O thread, and drives each head operation's state machine.
///
/// The lock is held across submissions into the execution queue; that is
/// safe because submission never blocks and only the I/O thread — the same
/// thread running under the lock — touches the ring.
pub(crate) struct OperationQueue {
    direction: Direction,
    io: Arc<IoShared>,
    /// Relaxed mirror of list emptiness for the lock-free fast-path probe.
    empty: AtomicBool,
    inner: Mutex<QueueInner>,
}

impl OperationQueue {
    pub(crate) fn new(direction: Direction, io: Arc<IoShared>) -> Arc<Self> {
        Arc::new(OperationQueue {
            direction,
            io,
            empty: AtomicBool::new(true),
            inner: Mutex::new(QueueInner {
                list: OpList::new(),
                disposed: false,
            }),
        })
    }

    /// Entry point from client threads. Returns whether the operation was
    /// queued (false = completed inline on the synchronous fast path).
    pub(crate) fn execute_async(
        self: &Arc<Self>,
        op: Arc<SocketOperation>,
        prefer_sync: bool,
    ) -> Result<bool, Error> {
        // Unlocked emptiness probe: a stale read only costs the fast path.
        if prefer_sync && self.empty.load(Ordering::Relaxed) && op.try_execute_sync() {
            op.complete_sync();
            return Ok(false);
        }

        let (was_empty, idx) = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return Err(Error::Disposed);
            }
            let was_empty = inner.list.is_empty();
            let idx = inner.list.push_back(op);
            self.empty.store(false, Ordering::Relaxed);
            (was_empty, idx)
        };

        if was_empty {
            let queue = self.clone();
            let posted = self
                .io
                .post(Box::new(move || queue.execute_queued(AsyncResult::none())));
            if !posted {
                // The I/O thread is gone; roll the enqueue back so the
                // caller sees the failure instead of a hung operation.
                let mut inner = self.inner.lock();
                let _ = inner.list.remove(idx);
                self.empty.store(inner.list.is_empty(), Ordering::Relaxed);
                return Err(Error::ThreadTerminated);
            }
        }
        Ok(true)
    }

    /// The driving engine, on the I/O thread: advance as many head
    /// operations as possible, given either a fresh tick or a CQE result
    /// for the currently executing head.
    ///
    /// User continuations fire strictly after the lock is released, in
    /// completion order.
    pub(crate) fn execute_queued(self: &Arc<Self>, result: AsyncResult) {
        let mut finished: Vec<(Arc<SocketOperation>, bool)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.disposed {
                // Dispose drained everything; a late kernel completion for
                // an already-cancelled operation is dropped here.
                return;
            }

            let mut result = result;
            while let Some(head) = inner.list.head() {
                let executing = inner.list.executing(head);
                if executing && !result.has_result() {
                    break; // still waiting on the kernel
                }
                let op = match inner.list.op(head) {
                    Some(op) => op,
                    None => break,
                };

                let exec = if !executing && !result.has_result() && op.cancel_requested() {
                    // Last polite yielding point before the first kernel
                    // submission; the ring path has no WaitForPoll boundary
                    // where cancellation could otherwise take effect.
                    ExecResult::Cancelled
                } else {
                    op.try_execute(self, self.direction.poll_mask(), result)
                };
                inner.list.set_executing(head, exec == ExecResult::Executing);
                let exec = if exec == ExecResult::WaitForPoll && op.cancel_requested() {
                    ExecResult::Cancelled
                } else {
                    exec
                };

                match exec {
                    ExecResult::Finished => {
                        let _ = inner.list.remove(head);
                        finished.push((op, false));
                    }
                    ExecResult::Cancelled => {
                        let _ = inner.list.remove(head);
                        finished.push((op, true));
                    }
                    ExecResult::Executing | ExecResult::WaitForPoll => break,
                }
                result = AsyncResult::none();
            }
            self.empty
                .store(inner.list.is_empty(), Ordering::Relaxed);
        }

        for (op, cancelled) in finished {
            if cancelled {
                op.complete_cancelled(true);
            } else {
                op.complete_async();
            }
        }
    }

    /// Dispose the queue: reject all future operations and complete every
    /// queued one as cancelled. Idempotent; returns whether this call was
    /// the one that disposed.
    pub(crate) fn dispose(&self) -> bool {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return false;
            }
            inner.disposed = true;
            self.empty.store(true, Ordering::Relaxed);
            inner.list.drain()
        };

        for (op, executing) in drained {
            // An executing op's buffer is still with the kernel; withhold
            // it from the completion and let the pin release it later.
            op.complete_cancelled(!executing);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_op() -> Arc<SocketOperation> {
        SocketOperation::new(-1, Direction::Read, Vec::new(), Box::new(|_| {}))
    }

    fn collect(list: &OpList) -> Vec<u32> {
        let mut out = Vec::new();
        if let Some(head) = list.head() {
            let mut cur = head;
            loop {
                out.push(cur);
                cur = list.node(cur).map(|n| n.next).unwrap_or(head);
                if cur == head {
                    break;
                }
            }
        }
        out
    }

    #[test]
    fn empty_list() {
        let list = OpList::new();
        assert!(list.is_empty());
        assert!(list.head().is_none());
    }

    #[test]
    fn single_element_points_at_itself() {
        let mut list = OpList::new();
        let idx = list.push_back(test_op());
        assert_eq!(list.head(), Some(idx));
        assert_eq!(list.node(idx).map(|n| n.next), Some(idx));
        assert_eq!(list.tail, idx);
    }

    #[test]
    fn fifo_order() {
        let mut list = OpList::new();
        let a = list.push_back(test_op());
        let b = list.push_back(test_op());
        let c = list.push_back(test_op());
        assert_eq!(collect(&list), vec![a, b, c]);
        assert_eq!(list.tail, c);

        assert!(list.remove(a).is_some());
        assert_eq!(collect(&list), vec![b, c]);
        assert!(list.remove(b).is_some());
        assert_eq!(collect(&list), vec![c]);
        assert!(list.remove(c).is_some());
        assert!(list.is_empty());
    }

    #[test]
    fn remove_middle_and_tail() {
        let mut list = OpList::new();
        let a = list.push_back(test_op());
        let b = list.push_back(test_op());
        let c = list.push_back(test_op());

        assert!(list.remove(b).is_some());
        assert_eq!(collect(&list), vec![a, c]);

        // Removing the tail retargets the tail pointer at its predecessor.
        assert!(list.remove(c).is_some());
        assert_eq!(list.tail, a);
        assert_eq!(collect(&list), vec![a]);
    }

    #[test]
    fn remove_unknown_index() {
        let mut list = OpList::new();
        let a = list.push_back(test_op());
        assert!(list.remove(a + 10).is_none());
        assert_eq!(collect(&list), vec![a]);
    }

    #[test]
    fn slots_are_reused() {
        let mut list = OpList::new();
        let a = list.push_back(test_op());
        list.push_back(test_op());
        list.remove(a);
        let c = list.push_back(test_op());
        assert_eq!(c, a);
        assert_eq!(list.slots.len(), 2);
    }

    #[test]
    fn drain_preserves_order() {
        let mut list = OpList::new();
        for _ in 0..4 {
            list.push_back(test_op());
        }
        list.set_executing(list.head().unwrap(), true);
        let drained = list.drain();
        assert_eq!(drained.len(), 4);
        assert!(drained[0].1, "head was marked executing");
        assert!(!drained[1].1);
        assert!(list.is_empty());
    }
}
