use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};

use crate::config::Config;
use crate::error::Error;
use crate::metrics;
use crate::ring::{ExecutionQueue, PinnedSlice};

/// Data tag for the engine-internal eventfd read.
const EVENTFD_DATA: u32 = 1;

/// Bounded shutdown drain: iterations of (100ms timeout, drain) before the
/// ring is torn down with requests still outstanding.
const DRAIN_ROUNDS: usize = 100;

thread_local! {
    /// The execution queue owned by this thread's event loop, reachable by
    /// queue code and completion callbacks that need to resubmit.
    static CURRENT_RING: Cell<*mut ExecutionQueue> = const { Cell::new(std::ptr::null_mut()) };
}

/// Run `f` against the current thread's execution queue, if this thread is
/// an I/O thread. The pointer is parked while borrowed so re-entry cannot
/// alias the `&mut`.
pub(crate) fn with_ring<R>(f: impl FnOnce(&mut ExecutionQueue) -> R) -> Option<R> {
    CURRENT_RING.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            return None;
        }
        cell.set(std::ptr::null_mut());
        // Safety: the pointer was installed by this thread's run loop, the
        // queue outlives the loop, and parking the cell above rules out a
        // second live `&mut`.
        let result = f(unsafe { &mut *ptr });
        cell.set(ptr);
        Some(result)
    })
}

struct RingGuard;

impl RingGuard {
    fn install(ring: &mut ExecutionQueue) -> RingGuard {
        CURRENT_RING.with(|cell| cell.set(ring as *mut ExecutionQueue));
        RingGuard
    }
}

impl Drop for RingGuard {
    fn drop(&mut self) {
        CURRENT_RING.with(|cell| cell.set(std::ptr::null_mut()));
    }
}

/// Work item injected into the I/O thread's run loop.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cross-thread handle to a running I/O thread: the posted-work channel,
/// the eventfd that interrupts a blocked ring enter, and the shutdown flag.
pub(crate) struct IoShared {
    tx: Sender<Job>,
    eventfd: RawFd,
    shutdown: AtomicBool,
}

impl IoShared {
    /// Deliver a callable to the run loop. Returns false when the thread
    /// has exited.
    pub(crate) fn post(&self, job: Job) -> bool {
        if self.tx.send(job).is_err() {
            return false;
        }
        metrics::WAKEUPS.increment();
        self.wake();
        true
    }

    fn wake(&self) {
        let val: u64 = 1;
        // Safety: eventfd stays open for the lifetime of IoShared.
        unsafe {
            libc::write(
                self.eventfd,
                &val as *const u64 as *const libc::c_void,
                8,
            );
        }
    }
}

impl Drop for IoShared {
    fn drop(&mut self) {
        // Safety: sole owner of the descriptor.
        unsafe {
            libc::close(self.eventfd);
        }
    }
}

/// 8-byte eventfd read target. Written by the kernel only while the read is
/// in flight; the value itself is discarded.
struct EventBuf(UnsafeCell<[u8; 8]>);

// Safety: only the kernel writes the buffer, and only between submission
// and CQE of the single in-flight eventfd read.
unsafe impl Send for EventBuf {}
unsafe impl Sync for EventBuf {}

/// Dedicated thread owning one `io_uring` instance and driving the event
/// loop: flush submissions, wait for completions, dispatch callbacks,
/// repeat. Work from other threads arrives via [`IoShared::post`].
pub struct IoThread {
    shared: Arc<IoShared>,
    handle: Option<thread::JoinHandle<Result<(), Error>>>,
}

impl IoThread {
    /// Spawn the I/O thread. Ring construction happens on the new thread;
    /// failures (including missing kernel features) are reported here
    /// synchronously.
    pub fn spawn(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if eventfd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let shared = Arc::new(IoShared {
            tx,
            eventfd,
            shutdown: AtomicBool::new(false),
        });

        let (init_tx, init_rx) = std::sync::mpsc::sync_channel::<Result<(), Error>>(1);
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                if let Err(e) = config.apply_affinity() {
                    let _ = init_tx.send(Err(e));
                    return Ok(());
                }
                let mut ring = match ExecutionQueue::setup(&config) {
                    Ok(ring) => ring,
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return Ok(());
                    }
                };
                let _ = init_tx.send(Ok(()));
                run(&mut ring, &thread_shared, &rx)
            })
            .map_err(Error::Io)?;

        match init_rx.recv() {
            Ok(Ok(())) => Ok(IoThread {
                shared,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::ThreadTerminated)
            }
        }
    }

    pub(crate) fn shared(&self) -> &Arc<IoShared> {
        &self.shared
    }

    /// Signal the run loop to exit and join it. Idempotent.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake();
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(Error::ThreadTerminated),
            },
            None => Ok(()),
        }
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// The event loop. All ring access goes through the thread-local pointer so
/// completion callbacks and posted jobs can re-enter.
fn run(ring: &mut ExecutionQueue, shared: &IoShared, rx: &Receiver<Job>) -> Result<(), Error> {
    let guard = RingGuard::install(ring);

    let event_buf = Arc::new(EventBuf(UnsafeCell::new([0u8; 8])));
    let rearm = Rc::new(Cell::new(true));

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        if rearm.get() {
            rearm.set(false);
            arm_eventfd_read(shared.eventfd, &event_buf, &rearm);
        }

        while let Ok(job) = rx.try_recv() {
            job();
        }

        let may_wait = || rx.is_empty() && !shared.shutdown.load(Ordering::Acquire);
        with_ring(|ring| ring.submit_and_wait(&may_wait)).unwrap_or(Ok(()))?;

        dispatch_completions();
    }

    // Uninstall the thread-local before draining: callbacks that fire during
    // the drain must not be able to resubmit into a ring that is going away.
    drop(guard);
    drain_on_shutdown(ring);
    Ok(())
}

/// Drain ready CQEs and fire their callbacks with no outstanding ring
/// borrow — callbacks re-enter the ring to resubmit.
fn dispatch_completions() {
    let ready = with_ring(|ring| ring.execute_completions()).unwrap_or_default();
    for (callback, result, data) in ready {
        callback(result, data);
    }
}

/// Cancel everything still registered with the kernel and drain until the
/// operation table empties, bounded so a wedged request cannot block exit
/// forever. Keeps pinned buffers alive until the kernel lets go of them.
fn drain_on_shutdown(ring: &mut ExecutionQueue) {
    // Flush operations added by the final completion dispatch so every
    // table entry is actually known to the kernel before cancelling.
    let _ = ring.submit_and_wait(&|| false);
    let _ = ring.cancel_all();
    for _ in 0..DRAIN_ROUNDS {
        if ring.outstanding() == 0 {
            break;
        }
        if ring.submit_and_wait_bounded().is_err() {
            break;
        }
        let ready = ring.execute_completions();
        for (callback, result, data) in ready {
            callback(result, data);
        }
    }
}

/// Arm the engine-internal eventfd read. Its completion only flags the loop
/// to re-arm; draining the counter is the point.
fn arm_eventfd_read(eventfd: RawFd, buf: &Arc<EventBuf>, rearm: &Rc<Cell<bool>>) {
    let ptr = buf.0.get() as *mut u8;
    let pin = PinnedSlice::new(ptr, 8, buf.clone() as Arc<dyn Any + Send + Sync>);
    let flag = rearm.clone();
    let _ = with_ring(|ring| {
        ring.add_read(
            eventfd,
            pin,
            Box::new(move |_result, _data| flag.set(true)),
            EVENTFD_DATA,
        )
    });
}
