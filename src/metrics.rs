//! ringsock runtime metrics.
//!
//! Counters for ring utilization, submission backpressure, and operation
//! outcomes. Exposed via Prometheus when registered with an exposition
//! layer that reads the metriken registry.

use metriken::{metric, Counter};

// ── Ring utilization ─────────────────────────────────────────────

#[metric(name = "ringsock/cqe/processed", description = "Total CQEs processed")]
pub static CQE_PROCESSED: Counter = Counter::new();

#[metric(
    name = "ringsock/cqe/poll_discarded",
    description = "Linked-poll CQEs discarded without a callback"
)]
pub static POLL_CQE_DISCARDED: Counter = Counter::new();

#[metric(
    name = "ringsock/sqe/partial_submits",
    description = "Ring enters that accepted fewer SQEs than were queued"
)]
pub static SUBMIT_PARTIAL: Counter = Counter::new();

#[metric(
    name = "ringsock/sqe/backpressure",
    description = "Ring enters rejected with EBUSY or EAGAIN"
)]
pub static SUBMIT_BACKPRESSURE: Counter = Counter::new();

// ── Operation outcomes ───────────────────────────────────────────

#[metric(
    name = "ringsock/ops/completed_sync",
    description = "Operations completed on the synchronous fast path"
)]
pub static OPS_COMPLETED_SYNC: Counter = Counter::new();

#[metric(
    name = "ringsock/ops/completed_async",
    description = "Operations completed through the ring"
)]
pub static OPS_COMPLETED_ASYNC: Counter = Counter::new();

#[metric(
    name = "ringsock/ops/canceled",
    description = "Operations completed as cancelled"
)]
pub static OPS_CANCELED: Counter = Counter::new();

// ── I/O thread ───────────────────────────────────────────────────

#[metric(
    name = "ringsock/io_thread/wakeups",
    description = "Cross-thread wakeups delivered via eventfd"
)]
pub static WAKEUPS: Counter = Counter::new();
