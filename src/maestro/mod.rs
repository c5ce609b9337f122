//! # Maestro
//!
//! The pizza maker. It pulls orders waiting to be cooked from the stream in batches,
//! asks the panettiere for dough, and republishes each cooked order to the next stage.
//!
//! ## Per-order flow
//!
//! 1. Decode. A malformed payload is acknowledged and dropped.
//! 2. Wait out any break, then mark the order in flight: the acknowledgement deadline is
//!    extended and an `in_progress` event is published.
//! 3. Acquire the maestro. If it cannot be acquired the order is left for redelivery.
//! 4. Ask for dough. A capacity rejection leaves the order un-acknowledged, naks it for
//!    the cooldown and sends the maestro on a break of the same length.
//! 5. Publish the order on `waiting_delivery`, then acknowledge it.
//! 6. Smoke: a short break after every delivered order, sometimes a long one.
//!
//! Acknowledgement only happens after both the dough call and the republish succeeded,
//! so a crash anywhere earlier means the order is delivered again.

mod worker;

pub use worker::Maestro;

use pipeline_framework::BreakDraw;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaestroConfig {
    pub batch_size: usize,
    pub fetch_max_wait: Duration,
    /// Break taken after each delivered order.
    pub smoke: BreakDraw,
    /// How long an order rejected for capacity waits before it is offered again,
    /// and how long the maestro rests meanwhile.
    pub capacity_cooldown: Duration,
    /// Pause after a failed fetch.
    pub fetch_error_backoff: Duration,
}

impl Default for MaestroConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            fetch_max_wait: Duration::from_secs(1),
            smoke: BreakDraw::fixed(Duration::ZERO),
            capacity_cooldown: Duration::from_secs(1),
            fetch_error_backoff: Duration::from_millis(500),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Republished and acknowledged.
    Delivered,
    /// Left for redelivery because the maestro or the panettiere was not available.
    Deferred,
    /// Acknowledged without processing.
    Dropped,
    /// Left for redelivery after an unexpected error.
    Failed,
}

#[derive(Debug, Default)]
pub struct MaestroCounters {
    delivered: AtomicU64,
    deferred: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaestroStats {
    pub delivered: u64,
    pub deferred: u64,
    pub dropped: u64,
    pub failed: u64,
}

impl MaestroCounters {
    pub fn record(&self, outcome: ItemOutcome) {
        let counter = match outcome {
            ItemOutcome::Delivered => &self.delivered,
            ItemOutcome::Deferred => &self.deferred,
            ItemOutcome::Dropped => &self.dropped,
            ItemOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MaestroStats {
        MaestroStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
