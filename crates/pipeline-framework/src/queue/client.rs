//! # Stream Client
//!
//! The cloneable interface to a [`StreamActor`](super::StreamActor), plus the
//! [`Publisher`] and [`BatchConsumer`] seams workers are written against.

use super::config::ConsumerConfig;
use super::message::{FetchBatch, Message, Response, StreamInfo, StreamRequest};
use crate::error::QueueError;
use crate::headers::Headers;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;

/// Anything that can append a message to the stream.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Appends a message and returns its sequence number.
    async fn publish(&self, subject: &str, headers: Headers, payload: Vec<u8>) -> Result<u64, QueueError>;
}

/// A pull consumer that hands out batches of deliveries.
#[async_trait]
pub trait BatchConsumer: Send + Sync {
    /// Returns at most `max_items` deliveries, waiting up to `max_wait` for them to
    /// accumulate. An empty batch after `max_wait` is not an error.
    async fn fetch(&self, max_items: usize, max_wait: Duration) -> Result<Vec<Delivery>, QueueError>;
}

/// A type-safe client for a running stream. Cheap to clone.
#[derive(Clone, Debug)]
pub struct StreamClient {
    sender: mpsc::Sender<StreamRequest>,
    published: Arc<Notify>,
}

impl StreamClient {
    pub fn new(sender: mpsc::Sender<StreamRequest>, published: Arc<Notify>) -> Self {
        Self { sender, published }
    }

    /// True while the stream task is still accepting requests.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    pub async fn publish(&self, subject: &str, headers: Headers, payload: Vec<u8>) -> Result<u64, QueueError> {
        let subject = subject.to_string();
        self.request(|respond_to| StreamRequest::Publish {
            subject,
            headers,
            payload,
            respond_to,
        })
        .await
    }

    /// Creates a consumer, or reattaches to an existing durable one.
    pub async fn create_consumer(&self, config: ConsumerConfig) -> Result<PullConsumer, QueueError> {
        let name = self
            .request(|respond_to| StreamRequest::CreateConsumer { config, respond_to })
            .await?;
        Ok(PullConsumer {
            client: self.clone(),
            name,
        })
    }

    pub async fn delete_consumer(&self, name: &str) -> Result<bool, QueueError> {
        let name = name.to_string();
        self.request(|respond_to| StreamRequest::DeleteConsumer { name, respond_to })
            .await
    }

    pub async fn info(&self) -> Result<StreamInfo, QueueError> {
        self.request(|respond_to| StreamRequest::Info { respond_to }).await
    }

    /// A single fetch round-trip without waiting.
    pub async fn fetch_once(&self, consumer: &str, max_items: usize) -> Result<FetchBatch, QueueError> {
        let consumer = consumer.to_string();
        self.request(|respond_to| StreamRequest::Fetch {
            consumer,
            max_items,
            respond_to,
        })
        .await
    }

    pub async fn ack(&self, consumer: &str, sequence: u64) -> Result<(), QueueError> {
        let consumer = consumer.to_string();
        self.request(|respond_to| StreamRequest::Ack {
            consumer,
            sequence,
            respond_to,
        })
        .await
    }

    pub async fn nak(&self, consumer: &str, sequence: u64, delay: Duration) -> Result<(), QueueError> {
        let consumer = consumer.to_string();
        self.request(|respond_to| StreamRequest::Nak {
            consumer,
            sequence,
            delay,
            respond_to,
        })
        .await
    }

    pub async fn in_progress(&self, consumer: &str, sequence: u64) -> Result<(), QueueError> {
        let consumer = consumer.to_string();
        self.request(|respond_to| StreamRequest::InProgress {
            consumer,
            sequence,
            respond_to,
        })
        .await
    }

    async fn request<T>(&self, build: impl FnOnce(Response<T>) -> StreamRequest) -> Result<T, QueueError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(build(respond_to))
            .await
            .map_err(|_| QueueError::StreamClosed)?;
        response.await.map_err(|_| QueueError::StreamDropped)?
    }
}

#[async_trait]
impl Publisher for StreamClient {
    async fn publish(&self, subject: &str, headers: Headers, payload: Vec<u8>) -> Result<u64, QueueError> {
        StreamClient::publish(self, subject, headers, payload).await
    }
}

/// A named pull consumer bound to a stream.
#[derive(Clone, Debug)]
pub struct PullConsumer {
    client: StreamClient,
    name: String,
}

impl PullConsumer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accumulates deliveries until `max_items` are collected or `max_wait` elapses.
    ///
    /// Between round-trips it sleeps until either something is published or the
    /// earliest pending message becomes eligible for redelivery.
    pub async fn fetch(&self, max_items: usize, max_wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        if max_items == 0 {
            return Ok(Vec::new());
        }
        let deadline = super::deadline_from(Instant::now(), max_wait);
        let mut batch = Vec::new();

        loop {
            // Registered before the round-trip so a publish in between is not missed.
            let published = self.client.published.notified();

            let FetchBatch {
                messages,
                next_redelivery,
            } = self.client.fetch_once(&self.name, max_items - batch.len()).await?;
            batch.extend(messages.into_iter().map(|fetched| Delivery {
                message: fetched.message,
                delivery_count: fetched.delivery_count,
                consumer: self.name.clone(),
                client: self.client.clone(),
            }));

            if batch.len() >= max_items || Instant::now() >= deadline {
                return Ok(batch);
            }

            let wake_at = next_redelivery.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = published => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

#[async_trait]
impl BatchConsumer for PullConsumer {
    async fn fetch(&self, max_items: usize, max_wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        PullConsumer::fetch(self, max_items, max_wait).await
    }
}

/// A message handed to a consumer, with the means to acknowledge it.
#[derive(Debug)]
pub struct Delivery {
    message: Message,
    delivery_count: u32,
    consumer: String,
    client: StreamClient,
}

impl Delivery {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    pub fn headers(&self) -> &Headers {
        &self.message.headers
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn sequence(&self) -> u64 {
        self.message.sequence
    }

    /// 1 on first delivery, incremented on every redelivery.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub async fn ack(&self) -> Result<(), QueueError> {
        self.client.ack(&self.consumer, self.message.sequence).await
    }

    /// Makes the message eligible for redelivery after `delay`.
    pub async fn nak(&self, delay: Duration) -> Result<(), QueueError> {
        self.client.nak(&self.consumer, self.message.sequence, delay).await
    }

    /// Resets the acknowledgement deadline while work is still underway.
    pub async fn in_progress(&self) -> Result<(), QueueError> {
        self.client.in_progress(&self.consumer, self.message.sequence).await
    }
}
