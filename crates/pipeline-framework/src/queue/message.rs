//! # Stream Messages
//!
//! The request protocol between [`StreamClient`](super::StreamClient) and
//! [`StreamActor`](super::StreamActor). Every request carries a oneshot `respond_to`
//! channel; the actor answers each request exactly once.

use super::config::ConsumerConfig;
use crate::error::QueueError;
use crate::headers::Headers;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Type alias for the one-shot response channel used by the stream.
pub type Response<T> = oneshot::Sender<Result<T, QueueError>>;

/// A message stored in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Position in the stream log, starting at 1.
    pub sequence: u64,
    pub subject: String,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

/// One message handed out by a fetch, with how many times it has been delivered.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub message: Message,
    pub delivery_count: u32,
}

/// The answer to a single fetch round-trip.
#[derive(Debug, Clone, Default)]
pub struct FetchBatch {
    pub messages: Vec<FetchedMessage>,
    /// The earliest instant at which a pending message becomes eligible again.
    pub next_redelivery: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    /// Messages still retained.
    pub messages: u64,
    /// Sequence of the oldest retained message, or of the next one when empty.
    pub first_sequence: u64,
    /// Sequence of the newest message ever published, 0 before the first.
    pub last_sequence: u64,
    pub consumers: usize,
}

/// Requests understood by the stream.
#[derive(Debug)]
pub enum StreamRequest {
    Publish {
        subject: String,
        headers: Headers,
        payload: Vec<u8>,
        respond_to: Response<u64>,
    },
    CreateConsumer {
        config: ConsumerConfig,
        respond_to: Response<String>,
    },
    DeleteConsumer {
        name: String,
        respond_to: Response<bool>,
    },
    Fetch {
        consumer: String,
        max_items: usize,
        respond_to: Response<FetchBatch>,
    },
    Ack {
        consumer: String,
        sequence: u64,
        respond_to: Response<()>,
    },
    Nak {
        consumer: String,
        sequence: u64,
        delay: Duration,
        respond_to: Response<()>,
    },
    InProgress {
        consumer: String,
        sequence: u64,
        respond_to: Response<()>,
    },
    Info {
        respond_to: Response<StreamInfo>,
    },
}
