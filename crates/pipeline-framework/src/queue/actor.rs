//! # Stream Actor
//!
//! The server half of the queue. It owns the message log, every consumer cursor and
//! every pending acknowledgement, and processes requests one at a time. That sequential
//! loop is what makes a fetch atomic: a message handed to one fetch is never handed to
//! a concurrent fetch on the same consumer until its acknowledgement deadline passes.
//!
//! The log only keeps what some consumer may still need. After every request that can
//! move a cursor or settle a pending message, the prefix that all consumers are done
//! with is dropped.

use super::client::StreamClient;
use super::deadline_from;
use super::config::{AckPolicy, ConsumerConfig, DeliverPolicy, StreamConfig};
use super::message::{FetchBatch, FetchedMessage, Message, StreamInfo, StreamRequest};
use super::subject::{is_valid_pattern, is_valid_subject, subject_matches};
use crate::error::QueueError;
use crate::headers::Headers;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The stream: an append-only log plus pull consumers over it.
///
/// # Usage Pattern
///
/// ```rust
/// use pipeline_framework::{ConsumerConfig, Headers, StreamActor, StreamConfig};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let (actor, client) = StreamActor::new(StreamConfig::new("ORDERS", ["orders.>"]), 32);
///     tokio::spawn(actor.run());
///
///     let consumer = client
///         .create_consumer(ConsumerConfig::durable("maestro", "orders.waiting_to_cook.*"))
///         .await
///         .unwrap();
///     client
///         .publish("orders.waiting_to_cook.1", Headers::new(), b"{}".to_vec())
///         .await
///         .unwrap();
///
///     let batch = consumer.fetch(1, Duration::from_millis(100)).await.unwrap();
///     batch[0].ack().await.unwrap();
/// }
/// ```
pub struct StreamActor {
    receiver: mpsc::Receiver<StreamRequest>,
    config: StreamConfig,
    log: MessageLog,
    consumers: HashMap<String, ConsumerState>,
    published: Arc<Notify>,
    next_ephemeral: u64,
}

struct ConsumerState {
    config: ConsumerConfig,
    /// Next log sequence this consumer has not looked at yet.
    next_sequence: u64,
    pending: BTreeMap<u64, PendingAck>,
}

impl ConsumerState {
    /// Lowest sequence this consumer may still be handed.
    fn low_water(&self) -> u64 {
        self.pending
            .keys()
            .next()
            .map_or(self.next_sequence, |oldest| (*oldest).min(self.next_sequence))
    }
}

struct PendingAck {
    eligible_at: Instant,
    deliveries: u32,
}

/// The retained tail of the stream. Sequences keep counting from 1 across discards.
struct MessageLog {
    messages: VecDeque<Message>,
    /// Sequence of `messages[0]`.
    first_sequence: u64,
}

impl MessageLog {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            first_sequence: 1,
        }
    }

    fn get(&self, sequence: u64) -> Option<&Message> {
        let offset = sequence.checked_sub(self.first_sequence)?;
        self.messages.get(usize::try_from(offset).ok()?)
    }

    /// The sequence the next published message gets.
    fn next_sequence(&self) -> u64 {
        self.first_sequence + self.messages.len() as u64
    }

    fn push(&mut self, subject: String, headers: Headers, payload: Vec<u8>) -> u64 {
        let sequence = self.next_sequence();
        self.messages.push_back(Message {
            sequence,
            subject,
            headers,
            payload,
        });
        sequence
    }

    /// Drops every message below `sequence` and returns how many went.
    fn discard_before(&mut self, sequence: u64) -> usize {
        let mut discarded = 0;
        while self.first_sequence < sequence && self.messages.pop_front().is_some() {
            self.first_sequence += 1;
            discarded += 1;
        }
        discarded
    }

    fn len(&self) -> usize {
        self.messages.len()
    }
}

impl StreamActor {
    /// Creates the stream and its client.
    ///
    /// `buffer_size` bounds the request channel; callers wait when it is full.
    pub fn new(config: StreamConfig, buffer_size: usize) -> (Self, StreamClient) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        let published = Arc::new(Notify::new());
        let actor = Self {
            receiver,
            config,
            log: MessageLog::new(),
            consumers: HashMap::new(),
            published: published.clone(),
            next_ephemeral: 0,
        };
        (actor, StreamClient::new(sender, published))
    }

    /// Runs until every client has been dropped.
    pub async fn run(self) {
        self.run_until(CancellationToken::new()).await
    }

    /// Runs until every client has been dropped or `cancel` fires.
    pub async fn run_until(mut self, cancel: CancellationToken) {
        let stream = self.config.name.clone();
        info!(%stream, subjects = ?self.config.subjects, "Stream started");

        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = self.receiver.recv() => request,
            };
            match request {
                Some(request) => self.handle(request),
                None => break,
            }
        }

        info!(%stream, messages = self.log.len(), consumers = self.consumers.len(), "Shutdown");
    }

    fn handle(&mut self, request: StreamRequest) {
        match request {
            StreamRequest::Publish {
                subject,
                headers,
                payload,
                respond_to,
            } => {
                let _ = respond_to.send(self.publish(subject, headers, payload));
            }
            StreamRequest::CreateConsumer { config, respond_to } => {
                let _ = respond_to.send(self.create_consumer(config));
            }
            StreamRequest::DeleteConsumer { name, respond_to } => {
                let removed = self.consumers.remove(&name).is_some();
                info!(stream = %self.config.name, consumer = %name, removed, "Consumer deleted");
                self.discard_consumed();
                let _ = respond_to.send(Ok(removed));
            }
            StreamRequest::Fetch {
                consumer,
                max_items,
                respond_to,
            } => {
                let batch = self.fetch(&consumer, max_items);
                self.discard_consumed();
                let _ = respond_to.send(batch);
            }
            StreamRequest::Ack {
                consumer,
                sequence,
                respond_to,
            } => {
                let acked = self.ack(&consumer, sequence);
                self.discard_consumed();
                let _ = respond_to.send(acked);
            }
            StreamRequest::Nak {
                consumer,
                sequence,
                delay,
                respond_to,
            } => {
                let _ = respond_to.send(self.postpone(&consumer, sequence, Some(delay)));
            }
            StreamRequest::InProgress {
                consumer,
                sequence,
                respond_to,
            } => {
                let _ = respond_to.send(self.postpone(&consumer, sequence, None));
            }
            StreamRequest::Info { respond_to } => {
                let _ = respond_to.send(Ok(StreamInfo {
                    name: self.config.name.clone(),
                    messages: self.log.len() as u64,
                    first_sequence: self.log.first_sequence,
                    last_sequence: self.log.next_sequence() - 1,
                    consumers: self.consumers.len(),
                }));
            }
        }
    }

    fn publish(&mut self, subject: String, headers: Headers, payload: Vec<u8>) -> Result<u64, QueueError> {
        if !is_valid_subject(&subject) {
            warn!(stream = %self.config.name, %subject, "Rejected invalid subject");
            return Err(QueueError::InvalidSubject(subject));
        }
        if !self.config.subjects.iter().any(|pattern| subject_matches(pattern, &subject)) {
            warn!(stream = %self.config.name, %subject, "Subject not captured");
            return Err(QueueError::SubjectNotCaptured {
                stream: self.config.name.clone(),
                subject,
            });
        }

        debug!(stream = %self.config.name, %subject, sequence = self.log.next_sequence(), "Published");
        let sequence = self.log.push(subject, headers, payload);
        self.published.notify_waiters();
        Ok(sequence)
    }

    fn create_consumer(&mut self, config: ConsumerConfig) -> Result<String, QueueError> {
        if !is_valid_pattern(&config.filter_subject) {
            return Err(QueueError::InvalidSubject(config.filter_subject));
        }

        let name = match &config.durable_name {
            Some(name) => name.clone(),
            None => {
                self.next_ephemeral += 1;
                format!("ephemeral_{}", self.next_ephemeral)
            }
        };

        if let Some(existing) = self.consumers.get_mut(&name) {
            info!(
                consumer = %name,
                pending = existing.pending.len(),
                next_sequence = existing.next_sequence,
                "Consumer reattached"
            );
            existing.config = config;
            return Ok(name);
        }

        let next_sequence = match config.deliver_policy {
            DeliverPolicy::All => self.log.first_sequence,
            DeliverPolicy::New => self.log.next_sequence(),
        };
        info!(
            consumer = %name,
            filter = %config.filter_subject,
            ack_policy = ?config.ack_policy,
            "Consumer created"
        );
        self.consumers.insert(
            name.clone(),
            ConsumerState {
                config,
                next_sequence,
                pending: BTreeMap::new(),
            },
        );
        Ok(name)
    }

    /// Hands out up to `max_items` messages: expired pending ones first, then new ones.
    fn fetch(&mut self, consumer: &str, max_items: usize) -> Result<FetchBatch, QueueError> {
        let state = self
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| QueueError::ConsumerNotFound(consumer.to_string()))?;
        let now = Instant::now();
        let ack_wait = state.config.ack_wait;
        let mut messages = Vec::new();

        let due: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, pending)| pending.eligible_at <= now)
            .map(|(sequence, _)| *sequence)
            .collect();
        for sequence in due {
            if messages.len() >= max_items {
                break;
            }
            let Some(pending) = state.pending.get_mut(&sequence) else {
                continue;
            };
            if state.config.max_deliver.is_some_and(|max| pending.deliveries >= max) {
                warn!(consumer, sequence, deliveries = pending.deliveries, "Max deliveries reached, dropping message");
                state.pending.remove(&sequence);
                continue;
            }
            let Some(message) = self.log.get(sequence) else {
                continue;
            };
            pending.deliveries += 1;
            pending.eligible_at = deadline_from(now, ack_wait);
            debug!(consumer, sequence, delivery_count = pending.deliveries, "Redelivering");
            messages.push(FetchedMessage {
                message: message.clone(),
                delivery_count: pending.deliveries,
            });
        }

        while messages.len() < max_items {
            let Some(message) = self.log.get(state.next_sequence) else {
                break;
            };
            state.next_sequence += 1;
            if !subject_matches(&state.config.filter_subject, &message.subject) {
                continue;
            }
            if state.config.ack_policy == AckPolicy::Explicit {
                state.pending.insert(
                    message.sequence,
                    PendingAck {
                        eligible_at: deadline_from(now, ack_wait),
                        deliveries: 1,
                    },
                );
            }
            messages.push(FetchedMessage {
                message: message.clone(),
                delivery_count: 1,
            });
        }

        if !messages.is_empty() {
            debug!(consumer, count = messages.len(), pending = state.pending.len(), "Fetched");
        }
        Ok(FetchBatch {
            messages,
            next_redelivery: state.pending.values().map(|pending| pending.eligible_at).min(),
        })
    }

    fn ack(&mut self, consumer: &str, sequence: u64) -> Result<(), QueueError> {
        let state = self
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| QueueError::ConsumerNotFound(consumer.to_string()))?;
        if state.config.ack_policy == AckPolicy::None {
            return Ok(());
        }
        match state.pending.remove(&sequence) {
            Some(_) => {
                debug!(consumer, sequence, "Acked");
                Ok(())
            }
            None => Err(QueueError::NotPending {
                consumer: consumer.to_string(),
                sequence,
            }),
        }
    }

    /// Drops the log prefix no consumer can be handed again.
    fn discard_consumed(&mut self) {
        let Some(low_water) = self.consumers.values().map(ConsumerState::low_water).min() else {
            return;
        };
        let discarded = self.log.discard_before(low_water);
        if discarded > 0 {
            debug!(
                stream = %self.config.name,
                discarded,
                first_sequence = self.log.first_sequence,
                "Discarded consumed messages"
            );
        }
    }

    /// Moves a pending message's eligibility: by `delay` for a nak, by `ack_wait` for
    /// an in-progress signal.
    fn postpone(&mut self, consumer: &str, sequence: u64, delay: Option<Duration>) -> Result<(), QueueError> {
        let state = self
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| QueueError::ConsumerNotFound(consumer.to_string()))?;
        if state.config.ack_policy == AckPolicy::None {
            return Ok(());
        }
        let extension = delay.unwrap_or(state.config.ack_wait);
        match state.pending.get_mut(&sequence) {
            Some(pending) => {
                pending.eligible_at = deadline_from(Instant::now(), extension);
                debug!(consumer, sequence, nak = delay.is_some(), ?extension, "Postponed");
                Ok(())
            }
            None => Err(QueueError::NotPending {
                consumer: consumer.to_string(),
                sequence,
            }),
        }
    }
}
