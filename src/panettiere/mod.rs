//! # Panettiere
//!
//! The in-process dough-making peer. It makes one dough at a time and naps on a
//! schedule. Asked for dough while napping or busy, it answers
//! [`DoughError::ResourceExhausted`] and the caller is expected to come back later.
//!
//! Dough is remembered per order, so a repeated request for the same order returns
//! the dough already made instead of making a second one. Only the most recent
//! `prepared_capacity` doughs are remembered; the oldest is forgotten first.

use crate::dough::{Dough, DoughError, DoughRequest, DoughService};
use crate::model::OrderId;
use async_trait::async_trait;
use pipeline_framework::availability::scale_saturating;
use pipeline_framework::{Availability, BreakPolicy, Headers, WorkerAvailability};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

const SLEEPING: &str = "panettiere is sleeping and cannot make dough right now";
const BUSY: &str = "panettiere is busy with another dough";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanettiereConfig {
    /// Naps: how often and for how long.
    pub sleep: BreakPolicy,
    pub dough_time: Duration,
    /// Preparation takes between `dough_time / factor` and `dough_time * factor`.
    pub dough_time_variance_factor: f64,
    pub prepared_capacity: usize,
}

/// Finished doughs by order, evicted oldest first.
#[derive(Debug, Default)]
struct PreparedDoughs {
    by_order: HashMap<OrderId, Dough>,
    order: VecDeque<OrderId>,
}

impl PreparedDoughs {
    fn get(&self, order_id: &OrderId) -> Option<&Dough> {
        self.by_order.get(order_id)
    }

    fn insert(&mut self, order_id: OrderId, dough: Dough, capacity: usize) {
        if self.by_order.insert(order_id, dough).is_none() {
            self.order.push_back(order_id);
        }
        while self.order.len() > capacity.max(1) {
            if let Some(oldest) = self.order.pop_front() {
                self.by_order.remove(&oldest);
                debug!(order_id = %oldest, "Forgot prepared dough");
            }
        }
    }

    fn len(&self) -> usize {
        self.by_order.len()
    }
}

pub struct Panettiere {
    availability: Arc<WorkerAvailability>,
    config: PanettiereConfig,
    rng: Mutex<StdRng>,
    prepared: Mutex<PreparedDoughs>,
    doughs_made: AtomicU64,
}

impl Panettiere {
    pub fn new(config: PanettiereConfig) -> Arc<Self> {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: PanettiereConfig, rng: StdRng) -> Arc<Self> {
        Arc::new(Self {
            availability: WorkerAvailability::new("panettiere", config.sleep),
            config,
            rng: Mutex::new(rng),
            prepared: Mutex::new(PreparedDoughs::default()),
            doughs_made: AtomicU64::new(0),
        })
    }

    /// Starts the nap schedule.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        info!(
            sleep_every = ?self.config.sleep.period,
            dough_time = ?self.config.dough_time,
            "Panettiere started"
        );
        self.availability.spawn_break_timer(cancel)
    }

    pub fn availability(&self) -> &Arc<WorkerAvailability> {
        &self.availability
    }

    /// Doughs actually made, not counting repeated requests.
    pub fn doughs_made(&self) -> u64 {
        self.doughs_made.load(Ordering::Relaxed)
    }

    /// Doughs currently remembered for repeated requests.
    pub fn prepared_count(&self) -> usize {
        self.prepared().len()
    }

    fn prepared(&self) -> MutexGuard<'_, PreparedDoughs> {
        self.prepared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached(&self, order_id: &OrderId) -> Option<Dough> {
        self.prepared().get(order_id).cloned()
    }

    fn preparation_time(&self) -> Duration {
        let factor = self.config.dough_time_variance_factor;
        if factor.is_nan() || factor <= 1.0 {
            return self.config.dough_time;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        scale_saturating(self.config.dough_time, rng.gen_range(1.0 / factor..=factor))
    }
}

#[async_trait]
impl DoughService for Panettiere {
    #[instrument(
        skip(self, request, metadata),
        fields(order_id = %request.order_id, correlation_id = metadata.correlation_id().unwrap_or("-"))
    )]
    async fn make_dough(&self, request: DoughRequest, metadata: &Headers) -> Result<Dough, DoughError> {
        if let Some(dough) = self.cached(&request.order_id) {
            debug!("Dough already made, returning it again");
            return Ok(dough);
        }

        let Some(_guard) = self.availability.acquire(request.order_id.to_string()) else {
            let reason = match self.availability.status() {
                Availability::OnBreak => SLEEPING,
                _ => BUSY,
            };
            debug!(reason, "Refusing dough request");
            return Err(DoughError::ResourceExhausted(reason.to_string()));
        };

        let took = self.preparation_time();
        tokio::time::sleep(took).await;

        let dough = Dough {
            content: format!("Dough with {} border, size {}", request.border, request.size),
        };
        self.prepared().insert(request.order_id, dough.clone(), self.config.prepared_capacity);
        self.doughs_made.fetch_add(1, Ordering::Relaxed);
        info!(?took, "Dough ready");
        Ok(dough)
    }

    async fn status(&self) -> String {
        match self.availability.status() {
            Availability::Idle => "idle".to_string(),
            Availability::OnBreak => "sleeping".to_string(),
            Availability::Busy => {
                let order = self.availability.current_item().unwrap_or_default();
                if self.availability.is_break_due() {
                    format!("making dough of order {order} (should sleep after current work)")
                } else {
                    format!("making dough of order {order}")
                }
            }
        }
    }
}
