//! Runtime metrics, exposed through the metriken registry.

use metriken::{Counter, Gauge, metric};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "eventline/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "eventline/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "eventline/connections/active",
    description = "Currently open connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "eventline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "eventline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── Task queues and wakes ────────────────────────────────────────

#[metric(
    name = "eventline/tasks/enqueued",
    description = "Tasks handed to pollers from any thread"
)]
pub static TASKS_ENQUEUED: Counter = Counter::new();

#[metric(
    name = "eventline/tasks/executed",
    description = "Tasks drained and run by workers"
)]
pub static TASKS_EXECUTED: Counter = Counter::new();

#[metric(
    name = "eventline/poller/wakeups",
    description = "eventfd notifications written"
)]
pub static POLLER_WAKEUPS: Counter = Counter::new();
