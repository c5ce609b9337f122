use super::{ItemOutcome, MaestroConfig, MaestroCounters};
use crate::dough::{DoughClient, DoughError, DoughRequest};
use crate::model::{Order, Stage};
use crate::subjects::Subjects;
use pipeline_framework::{BatchConsumer, Delivery, Headers, Publisher, QueueError, WorkerAvailability};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
enum RepublishError {
    #[error("Failed to encode order: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// The maestro's batch loop.
///
/// Generic over the queue seams so tests can drive it with any consumer and publisher.
pub struct Maestro<C, P> {
    consumer: C,
    publisher: P,
    dough: DoughClient,
    availability: Arc<WorkerAvailability>,
    subjects: Subjects,
    config: MaestroConfig,
    rng: StdRng,
    counters: Arc<MaestroCounters>,
}

impl<C, P> Maestro<C, P>
where
    C: BatchConsumer,
    P: Publisher,
{
    pub fn new(
        consumer: C,
        publisher: P,
        dough: DoughClient,
        availability: Arc<WorkerAvailability>,
        subjects: Subjects,
        config: MaestroConfig,
    ) -> Self {
        Self {
            consumer,
            publisher,
            dough,
            availability,
            subjects,
            config,
            rng: StdRng::from_entropy(),
            counters: Arc::new(MaestroCounters::default()),
        }
    }

    /// Uses `rng` for smoke break draws.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn availability(&self) -> &Arc<WorkerAvailability> {
        &self.availability
    }

    pub fn counters(&self) -> Arc<MaestroCounters> {
        Arc::clone(&self.counters)
    }

    /// Pulls and processes batches until `cancel` fires.
    ///
    /// The order being processed when `cancel` fires is finished; the rest of its batch
    /// is left un-acknowledged.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            fetch_max_wait = ?self.config.fetch_max_wait,
            "Maestro started"
        );

        loop {
            if !self.availability.wait_until_available(&cancel).await {
                break;
            }
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.consumer.fetch(self.config.batch_size, self.config.fetch_max_wait) => batch,
            };
            let deliveries = match batch {
                Ok(deliveries) => deliveries,
                Err(error) => {
                    error!(%error, backoff = ?self.config.fetch_error_backoff, "Fetch failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.fetch_error_backoff) => continue,
                    }
                }
            };

            let total = deliveries.len();
            for (index, delivery) in deliveries.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    debug!(left = total - index, "Shutting down, leaving the rest of the batch for redelivery");
                    break;
                }
                let outcome = self.process(&delivery, &cancel).await;
                self.counters.record(outcome);
            }
        }

        info!(stats = ?self.counters.snapshot(), "Shutdown");
    }

    async fn process(&mut self, delivery: &Delivery, cancel: &CancellationToken) -> ItemOutcome {
        let order = match Order::from_payload(delivery.payload()) {
            Ok(order) => order,
            Err(error) => {
                warn!(
                    subject = delivery.subject(),
                    sequence = delivery.sequence(),
                    %error,
                    "Malformed order, dropping"
                );
                if let Err(error) = delivery.ack().await {
                    warn!(%error, "Failed to ack malformed order");
                }
                return ItemOutcome::Dropped;
            }
        };
        self.cook(delivery, order, cancel).await
    }

    #[instrument(
        skip_all,
        fields(
            order_id = %order.order_id,
            correlation_id = delivery.headers().correlation_id().unwrap_or("-"),
            delivery = delivery.delivery_count()
        )
    )]
    async fn cook(&mut self, delivery: &Delivery, order: Order, cancel: &CancellationToken) -> ItemOutcome {
        let headers = delivery.headers().clone();

        if !self.availability.wait_until_available(cancel).await {
            return ItemOutcome::Deferred;
        }

        let order = match order.advance(Stage::InFlight) {
            Ok(order) => order,
            Err(error) => {
                warn!(%error, "Order already past the kitchen, dropping");
                if let Err(error) = delivery.ack().await {
                    warn!(%error, "Failed to ack stale order");
                }
                return ItemOutcome::Dropped;
            }
        };
        if let Err(error) = delivery.in_progress().await {
            warn!(%error, "Failed to extend ack deadline");
        }
        let subject = self.subjects.in_progress(&order.order_id);
        if let Err(error) = self.republish(&subject, &headers, &order).await {
            warn!(%error, "Failed to publish progress event");
        }

        let Some(guard) = self.availability.acquire(order.order_id.to_string()) else {
            debug!(status = %self.availability.status(), "Maestro not available, leaving order for redelivery");
            return ItemOutcome::Deferred;
        };

        match self.dough.invoke(DoughRequest::for_order(&order), &headers).await {
            Ok(dough) => debug!(dough = %dough.content, "Dough received"),
            Err(DoughError::ResourceExhausted(reason)) => {
                drop(guard);
                let cooldown = self.config.capacity_cooldown;
                info!(%reason, ?cooldown, "Panettiere at capacity, leaving order for redelivery");
                if let Err(error) = delivery.nak(cooldown).await {
                    warn!(%error, "Failed to nak order");
                }
                self.availability.request_break(cooldown);
                return ItemOutcome::Deferred;
            }
            Err(error) => {
                error!(%error, "Dough request failed, leaving order for redelivery");
                return ItemOutcome::Failed;
            }
        }

        let order = match order.advance(Stage::Delivered) {
            Ok(order) => order,
            Err(error) => {
                error!(%error, "Could not mark order delivered");
                return ItemOutcome::Failed;
            }
        };
        let subject = self.subjects.waiting_delivery(&order.order_id);
        if let Err(error) = self.republish(&subject, &headers, &order).await {
            error!(%error, "Failed to publish cooked order, leaving it for redelivery");
            return ItemOutcome::Failed;
        }
        if let Err(error) = delivery.ack().await {
            warn!(%error, "Failed to ack cooked order");
        }
        info!("Pizza ready, waiting for delivery");
        drop(guard);

        self.smoke();
        ItemOutcome::Delivered
    }

    fn smoke(&mut self) {
        let smoke = self.config.smoke.draw(&mut self.rng);
        if smoke.duration.is_zero() {
            return;
        }
        if smoke.extended {
            info!(duration = ?smoke.duration, "Oversmoking");
        } else {
            debug!(duration = ?smoke.duration, "Smoking");
        }
        self.availability.request_break(smoke.duration);
    }

    async fn republish(&self, subject: &str, headers: &Headers, order: &Order) -> Result<u64, RepublishError> {
        let payload = order.to_payload()?;
        Ok(self.publisher.publish(subject, headers.clone(), payload).await?)
    }
}
