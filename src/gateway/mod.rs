//! # Gateway
//!
//! The customer-facing edge of the pipeline.
//!
//! - **Ingress**: [`Gateway::submit_order`] validates a [`NewOrderRequest`], stamps it
//!   with an id, a timestamp and a correlation id, and publishes it on
//!   `orders.waiting_to_cook.<id>`.
//! - **Live updates**: the [`relay::Relay`] feeds every order event seen on the stream
//!   into a [`Broadcaster`]. Observers attach with [`Gateway::subscribe`] or stream
//!   frames straight to a sink with [`Gateway::stream_to`].
//! - **Health**: [`health::HealthMonitor`] answers whether the pipeline can make progress.

pub mod health;
pub mod relay;
pub mod sse;

use crate::model::{FieldError, NewOrderRequest, Order, OrderReceipt};
use crate::subjects::Subjects;
use pipeline_framework::broadcast::forward;
use pipeline_framework::{
    Broadcaster, EventSink, ForwardOutcome, Headers, Publisher, QueueError, Subscription, CORRELATION_ID_HEADER,
};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngressError {
    #[error(transparent)]
    InvalidField(#[from] FieldError),

    #[error("Failed to encode order: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to queue order: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Clone)]
pub struct Gateway {
    publisher: Arc<dyn Publisher>,
    subjects: Subjects,
    broadcaster: Broadcaster<Order>,
}

impl Gateway {
    pub fn new(publisher: Arc<dyn Publisher>, subjects: Subjects, broadcaster: Broadcaster<Order>) -> Self {
        Self {
            publisher,
            subjects,
            broadcaster,
        }
    }

    /// Validates and queues a new order. A correlation id is generated when none is given.
    #[instrument(skip(self, request, correlation_id), fields(order_id, correlation_id))]
    pub async fn submit_order(
        &self,
        request: NewOrderRequest,
        correlation_id: Option<String>,
    ) -> Result<OrderReceipt, IngressError> {
        let order = request.into_order().inspect_err(|error| {
            warn!(%error, "Order rejected");
        })?;
        let correlation_id = correlation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Span::current()
            .record("order_id", tracing::field::display(&order.order_id))
            .record("correlation_id", correlation_id.as_str());

        let mut headers = Headers::new();
        headers.insert(CORRELATION_ID_HEADER, correlation_id.clone());
        let subject = self.subjects.waiting_to_cook(&order.order_id);
        let sequence = self.publisher.publish(&subject, headers, order.to_payload()?).await?;

        info!(sequence, size = %order.size, destination = %order.destination, "Order queued");
        Ok(OrderReceipt {
            order_id: order.order_id,
            ordered_at: order.ordered_at,
            correlation_id,
        })
    }

    /// Events published from now on. Dropping the subscription unsubscribes it.
    pub fn subscribe(&self) -> Subscription<Order> {
        let subscription = self.broadcaster.subscribe();
        debug!(subscriber_id = subscription.id(), "Observer subscribed");
        subscription
    }

    /// Writes every subsequent event to `sink` as an SSE frame until the sink fails or
    /// `cancel` fires.
    pub async fn stream_to<S>(&self, sink: &mut S, cancel: &CancellationToken) -> ForwardOutcome
    where
        S: EventSink + ?Sized,
    {
        let subscription = self.subscribe();
        let subscriber_id = subscription.id();
        let outcome = forward(subscription, sink, sse::encode_event, cancel).await;
        info!(subscriber_id, ?outcome, "Observer stream ended");
        outcome
    }

    pub fn broadcaster(&self) -> &Broadcaster<Order> {
        &self.broadcaster
    }

    pub fn subjects(&self) -> &Subjects {
        &self.subjects
    }
}
