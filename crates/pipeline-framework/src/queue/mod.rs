//! # Durable Work Queue
//!
//! An in-process stream with the semantics the pipeline relies on:
//!
//! - Messages are appended to a single ordered log and addressed by subject
//!   (`orders.waiting_to_cook.<id>`). Filters support `*` for one token and `>` for
//!   the remainder.
//! - Consumers are pull-based. A durable consumer keeps its cursor across reconnects.
//! - With [`AckPolicy::Explicit`] every delivered message stays pending until acked.
//!   Anything not acked within `ack_wait` is redelivered on a later fetch, and
//!   [`Delivery::nak`] makes it eligible again after the given delay.
//! - With [`AckPolicy::None`] messages are fire-and-forget; this is what live observers use.
//! - A message is discarded once every consumer has moved past it and none still has
//!   it pending. A stream without consumers keeps everything.
//!
//! The [`StreamActor`] owns all of this state and processes requests sequentially. Use the
//! cloneable [`StreamClient`] to publish and to create [`PullConsumer`]s.

mod actor;
mod client;
mod config;
mod message;
pub mod subject;

pub use actor::StreamActor;
pub use client::{BatchConsumer, Delivery, Publisher, PullConsumer, StreamClient};
pub use config::{AckPolicy, ConsumerConfig, DeliverPolicy, StreamConfig};
pub use message::{FetchBatch, FetchedMessage, Message, Response, StreamInfo, StreamRequest};

use std::time::Duration;
use tokio::time::Instant;

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + delay`, capped at about thirty years out.
pub(crate) fn deadline_from(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}
