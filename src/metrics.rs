//! Adoption metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "slots_adopted",
    description = "Descriptors successfully adopted into slots"
)]
pub static SLOTS_ADOPTED: Counter = Counter::new();

#[metric(
    name = "adopt_failures",
    description = "Adoptions that failed and were unwound"
)]
pub static ADOPT_FAILURES: Counter = Counter::new();

#[metric(
    name = "peer_limit_denied",
    description = "Socket adoptions denied by the per-peer connection ceiling"
)]
pub static PEER_LIMIT_DENIED: Counter = Counter::new();

#[metric(name = "slots_active", description = "Live connection slots")]
pub static SLOTS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "readbuf_deferred",
    description = "Replay buffers parked until a parse context frees up"
)]
pub static READBUF_DEFERRED: Counter = Counter::new();
