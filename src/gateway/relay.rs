//! Stream-to-broadcaster relay.

use crate::model::Order;
use pipeline_framework::{BatchConsumer, Broadcaster};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Forwards every order event on the stream to live observers.
///
/// Reads through a monitor consumer, so nothing is acknowledged and nothing is redelivered.
pub struct Relay<C> {
    consumer: C,
    broadcaster: Broadcaster<Order>,
    batch_size: usize,
    max_wait: Duration,
}

impl<C: BatchConsumer> Relay<C> {
    pub fn new(consumer: C, broadcaster: Broadcaster<Order>, batch_size: usize, max_wait: Duration) -> Self {
        Self {
            consumer,
            broadcaster,
            batch_size,
            max_wait,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(batch_size = self.batch_size, "Relay started");
        let mut relayed = 0u64;

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.consumer.fetch(self.batch_size, self.max_wait) => batch,
            };
            let deliveries = match batch {
                Ok(deliveries) => deliveries,
                Err(error) => {
                    error!(%error, "Relay fetch failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.max_wait) => continue,
                    }
                }
            };

            for delivery in deliveries {
                let order = match Order::from_payload(delivery.payload()) {
                    Ok(order) => order,
                    Err(error) => {
                        warn!(subject = delivery.subject(), %error, "Skipping malformed event");
                        continue;
                    }
                };
                let order_id = order.order_id;
                let report = self.broadcaster.publish(order);
                relayed += 1;
                debug!(
                    %order_id,
                    subject = delivery.subject(),
                    delivered = report.delivered,
                    dropped = report.dropped,
                    "Event relayed"
                );
            }
        }

        info!(relayed, "Shutdown");
    }
}
