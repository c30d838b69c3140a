//! Integration tests: the engine driving real sockets.
//!
//! Each test spawns an I/O thread, registers one side of a `UnixStream`
//! pair, and verifies completion order, flags, and byte counts against
//! traffic written from the peer side.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::time::Duration;

use ringsock::{
    AsyncSocket, Completion, CompletionKind, CompletionSink, ConfigBuilder, Error, IoThread,
};

// ── Helpers ─────────────────────────────────────────────────────────

/// Socket pair with the engine-side end in non-blocking mode.
fn socket_pair() -> (UnixStream, UnixStream) {
    let (local, peer) = UnixStream::pair().unwrap();
    local.set_nonblocking(true).unwrap();
    (local, peer)
}

fn engine() -> IoThread {
    let config = ConfigBuilder::new()
        .sq_entries(64)
        .iovec_entries(16)
        .thread_name("ringsock-test")
        .build()
        .expect("config");
    IoThread::spawn(config).expect("spawn I/O thread")
}

/// A sink that forwards the completion, tagged, into a channel.
fn sink(tx: &mpsc::Sender<(usize, Completion)>, tag: usize) -> CompletionSink {
    let tx = tx.clone();
    Box::new(move |completion| {
        let _ = tx.send((tag, completion));
    })
}

fn recv_completion(rx: &mpsc::Receiver<(usize, Completion)>) -> (usize, Completion) {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("completion within timeout")
}

fn assert_pending(rx: &mpsc::Receiver<(usize, Completion)>) {
    assert!(
        rx.recv_timeout(Duration::from_millis(100)).is_err(),
        "operation completed prematurely"
    );
}

// ── Receive path ────────────────────────────────────────────────────

#[test]
fn sync_recv_on_ready_socket() {
    let io = engine();
    let (local, mut peer) = socket_pair();
    let socket = AsyncSocket::register(&io, local.as_raw_fd());

    peer.write_all(b"HELLO").unwrap();

    let (tx, rx) = mpsc::channel();
    socket.recv(vec![0u8; 1024], sink(&tx, 0)).unwrap();

    // The fast path completes inline, before recv() returns.
    let (tag, completion) = rx.try_recv().expect("inline completion");
    assert_eq!(tag, 0);
    assert_eq!(completion.kind, CompletionKind::FinishedSync);
    assert_eq!(completion.bytes, 5);
    assert!(completion.error.is_none());
    let buf = completion.buffer.expect("buffer returned");
    assert_eq!(&buf[..5], b"HELLO");
}

#[test]
fn async_recv_on_empty_socket() {
    let io = engine();
    let (local, mut peer) = socket_pair();
    let socket = AsyncSocket::register(&io, local.as_raw_fd());

    let (tx, rx) = mpsc::channel();
    let handle = socket.recv(vec![0u8; 1024], sink(&tx, 0)).unwrap();

    assert_pending(&rx);
    assert!(handle.completion_kind().is_none());

    peer.write_all(b"X").unwrap();

    let (_, completion) = recv_completion(&rx);
    assert_eq!(completion.kind, CompletionKind::FinishedAsync);
    assert_eq!(completion.bytes, 1);
    assert_eq!(&completion.buffer.expect("buffer")[..1], b"X");
    assert_eq!(handle.completion_kind(), Some(CompletionKind::FinishedAsync));
    assert_eq!(handle.bytes_transferred(), 1);
}

#[test]
fn fifo_under_trickled_reads() {
    let io = engine();
    let (local, mut peer) = socket_pair();
    let socket = AsyncSocket::register(&io, local.as_raw_fd());

    let (tx, rx) = mpsc::channel();
    for tag in 0..3 {
        socket
            .recv_with(vec![0u8; 10], sink(&tx, tag), false)
            .unwrap();
    }

    // Trickle 5, 5, 10 bytes; each queued read completes with whatever the
    // socket held, in submission order.
    peer.write_all(b"aaaaa").unwrap();
    let (tag, completion) = recv_completion(&rx);
    assert_eq!((tag, completion.bytes), (0, 5));

    peer.write_all(b"bbbbb").unwrap();
    let (tag, completion) = recv_completion(&rx);
    assert_eq!((tag, completion.bytes), (1, 5));

    peer.write_all(b"cccccccccc").unwrap();
    let (tag, completion) = recv_completion(&rx);
    assert_eq!((tag, completion.bytes), (2, 10));
    assert_eq!(&completion.buffer.expect("buffer")[..], b"cccccccccc");
}

#[test]
fn queued_recv_drains_in_order_after_burst() {
    let io = engine();
    let (local, mut peer) = socket_pair();
    let socket = AsyncSocket::register(&io, local.as_raw_fd());

    peer.write_all(&[7u8; 2000]).unwrap();

    let (tx, rx) = mpsc::channel();
    socket.recv(vec![0u8; 1024], sink(&tx, 0)).unwrap();
    socket.recv(vec![0u8; 1024], sink(&tx, 1)).unwrap();

    let (tag, completion) = recv_completion(&rx);
    assert_eq!((tag, completion.bytes), (0, 1024));
    let (tag, completion) = recv_completion(&rx);
    assert_eq!((tag, completion.bytes), (1, 976));
}

#[test]
fn recv_after_peer_close_reports_eof() {
    let io = engine();
    let (local, peer) = socket_pair();
    let socket = AsyncSocket::register(&io, local.as_raw_fd());
    drop(peer);

    let (tx, rx) = mpsc::channel();
    socket.recv(vec![0u8; 64], sink(&tx, 0)).unwrap();

    let (_, completion) = recv_completion(&rx);
    assert_eq!(completion.kind, CompletionKind::FinishedSync);
    assert_eq!(completion.bytes, 0);
    assert!(completion.error.is_none());
}

// ── Readiness probes ────────────────────────────────────────────────

#[test]
fn zero_byte_probe_completes_without_transfer() {
    let io = engine();
    let (local, mut peer) = socket_pair();
    let socket = AsyncSocket::register(&io, local.as_raw_fd());

    let (tx, rx) = mpsc::channel();
    socket.poll_readable(sink(&tx, 0)).unwrap();
    assert_pending(&rx);

    peer.write_all(b"data").unwrap();

    let (_, completion) = recv_completion(&rx);
    assert_eq!(completion.kind, CompletionKind::FinishedAsync);
    assert_eq!(completion.bytes, 0);
    assert!(completion.error.is_none());

    // The probe consumed nothing: a follow-up read sees all four bytes.
    socket.recv(vec![0u8; 16], sink(&tx, 1)).unwrap();
    let (tag, completion) = recv_completion(&rx);
    assert_eq!((tag, completion.bytes), (1, 4));
    assert_eq!(&completion.buffer.expect("buffer")[..4], b"data");
}

#[test]
fn writable_probe_on_fresh_socket() {
    let io = engine();
    let (local, _peer) = socket_pair();
    let socket = AsyncSocket::register(&io, local.as_raw_fd());

    let (tx, rx) = mpsc::channel();
    socket.poll_writable(sink(&tx, 0)).unwrap();

    // An idle stream socket is immediately writable.
    let (_, completion) = recv_completion(&rx);
    assert_eq!(completion.bytes, 0);
    assert!(completion.error.is_none());
}

// ── Send path ───────────────────────────────────────────────────────

#[test]
fn send_completes_and_peer_receives() {
    let io = engine();
    let (local, mut peer) = socket_pair();
    let socket = AsyncSocket::register(&io, local.as_raw_fd());

    let (tx, rx) = mpsc::channel();
    socket.send(b"ping".to_vec(), sink(&tx, 0)).unwrap();

    let (_, completion) = recv_completion(&rx);
    assert_eq!(completion.kind, CompletionKind::FinishedSync);
    assert_eq!(completion.bytes, 4);

    let mut buf = [0u8; 4];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
}

#[test]
fn queued_sends_complete_in_order() {
    let io = engine();
    let (local, mut peer) = socket_pair();
    let socket = AsyncSocket::register(&io, local.as_raw_fd());

    let (tx, rx) = mpsc::channel();
    socket
        .send_with(b"first.".to_vec(), sink(&tx, 0), false)
        .unwrap();
    socket
        .send_with(b"second".to_vec(), sink(&tx, 1), false)
        .unwrap();

    let (tag, completion) = recv_completion(&rx);
    assert_eq!((tag, completion.bytes), (0, 6));
    assert_eq!(completion.kind, CompletionKind::FinishedAsync);
    let (tag, completion) = recv_completion(&rx);
    assert_eq!((tag, completion.bytes), (1, 6));

    let mut buf = [0u8; 12];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"first.second");
}

// ── Cancellation ────────────────────────────────────────────────────

#[test]
fn cancel_takes_effect_when_op_reaches_head() {
    let io = engine();
    let (local, mut peer) = socket_pair();
    let socket = AsyncSocket::register(&io, local.as_raw_fd());

    let (tx, rx) = mpsc::channel();
    socket
        .recv_with(vec![0u8; 16], sink(&tx, 0), false)
        .unwrap();
    let second = socket
        .recv_with(vec![0u8; 16], sink(&tx, 1), false)
        .unwrap();

    // Cancel while still the non-head waiter.
    second.cancel();
    assert_pending(&rx);

    peer.write_all(b"z").unwrap();

    let (tag, completion) = recv_completion(&rx);
    assert_eq!((tag, completion.bytes), (0, 1));

    // The cancelled op is promoted to finished when it becomes head,
    // without a kernel submission; its buffer comes back untouched.
    let (tag, completion) = recv_completion(&rx);
    assert_eq!(tag, 1);
    assert_eq!(completion.kind, CompletionKind::Canceled);
    assert_eq!(completion.bytes, 0);
    assert!(completion.buffer.is_some());
    assert_eq!(second.completion_kind(), Some(CompletionKind::Canceled));
}

#[test]
fn late_result_beats_cancellation() {
    let io = engine();
    let (local, mut peer) = socket_pair();
    let socket = AsyncSocket::register(&io, local.as_raw_fd());

    peer.write_all(b"w").unwrap();

    let (tx, rx) = mpsc::channel();
    let handle = socket.recv(vec![0u8; 16], sink(&tx, 0)).unwrap();
    // The op already completed synchronously; cancelling now is a no-op.
    handle.cancel();

    let (_, completion) = rx.try_recv().expect("inline completion");
    assert_eq!(completion.kind, CompletionKind::FinishedSync);
    assert_eq!(completion.bytes, 1);
}

// ── Disposal ────────────────────────────────────────────────────────

#[test]
fn dispose_cancels_pending_and_is_idempotent() {
    let io = engine();
    let (local, _peer) = socket_pair();
    let socket = AsyncSocket::register(&io, local.as_raw_fd());

    let (tx, rx) = mpsc::channel();
    socket
        .recv_with(vec![0u8; 16], sink(&tx, 0), false)
        .unwrap();
    socket
        .recv_with(vec![0u8; 16], sink(&tx, 1), false)
        .unwrap();

    // Let the head reach the kernel before disposing.
    std::thread::sleep(Duration::from_millis(200));

    assert!(socket.dispose());

    let (tag, completion) = recv_completion(&rx);
    assert_eq!(tag, 0);
    assert_eq!(completion.kind, CompletionKind::Canceled);
    // The head was in flight; its buffer stays with the engine.
    assert!(completion.buffer.is_none());

    let (tag, completion) = recv_completion(&rx);
    assert_eq!(tag, 1);
    assert_eq!(completion.kind, CompletionKind::Canceled);
    assert!(completion.buffer.is_some());

    assert!(!socket.dispose());
}

#[test]
fn post_dispose_rejected() {
    let io = engine();
    let (local, _peer) = socket_pair();
    let socket = AsyncSocket::register(&io, local.as_raw_fd());

    assert!(socket.dispose());

    let (tx, _rx) = mpsc::channel();
    let err = socket.recv(vec![0u8; 16], sink(&tx, 0)).unwrap_err();
    assert!(matches!(err, Error::Disposed));
}

// ── Engine lifecycle ────────────────────────────────────────────────

#[test]
fn shutdown_with_in_flight_op() {
    let mut io = engine();
    let (local, _peer) = socket_pair();
    let socket = AsyncSocket::register(&io, local.as_raw_fd());

    let (tx, rx) = mpsc::channel();
    socket
        .recv_with(vec![0u8; 16], sink(&tx, 0), false)
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));

    // Shutdown cancels the in-flight read and joins cleanly.
    io.shutdown().expect("clean shutdown");
    let (_, completion) = recv_completion(&rx);
    assert_eq!(completion.kind, CompletionKind::Canceled);
}

#[test]
fn queueing_after_engine_exit_fails() {
    let io = engine();
    let (local, _peer) = socket_pair();
    let socket = AsyncSocket::register(&io, local.as_raw_fd());
    drop(io);

    let (tx, _rx) = mpsc::channel();
    let err = socket
        .recv_with(vec![0u8; 16], sink(&tx, 0), false)
        .unwrap_err();
    assert!(matches!(err, Error::ThreadTerminated));
}

#[test]
fn two_sockets_make_independent_progress() {
    let io = engine();
    let (local_a, mut peer_a) = socket_pair();
    let (local_b, mut peer_b) = socket_pair();
    let socket_a = AsyncSocket::register(&io, local_a.as_raw_fd());
    let socket_b = AsyncSocket::register(&io, local_b.as_raw_fd());

    let (tx, rx) = mpsc::channel();
    socket_a
        .recv_with(vec![0u8; 16], sink(&tx, 0), false)
        .unwrap();
    socket_b
        .recv_with(vec![0u8; 16], sink(&tx, 1), false)
        .unwrap();

    // Completing B while A stays parked proves no cross-socket ordering.
    peer_b.write_all(b"bb").unwrap();
    let (tag, completion) = recv_completion(&rx);
    assert_eq!((tag, completion.bytes), (1, 2));

    peer_a.write_all(b"a").unwrap();
    let (tag, completion) = recv_completion(&rx);
    assert_eq!((tag, completion.bytes), (0, 1));
}
