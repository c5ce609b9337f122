//! # Pipeline Framework
//!
//! Building blocks for staged work pipelines: durable work queues with
//! at-least-once delivery, capacity-constrained workers that take breaks,
//! live fan-out of events to observers, and resilient calls to peers.
//!
//! ## Architecture Overview
//!
//! The framework is split into layers that the application wires together:
//!
//! 1. **Queue Layer** ([`queue`]) - An in-process, JetStream-shaped stream. A [`StreamActor`]
//!    owns the message log and every consumer cursor; callers talk to it through the cloneable
//!    [`StreamClient`]. Explicit-ack consumers redeliver anything not acknowledged within
//!    `ack_wait`.
//! 2. **Worker Layer** ([`availability`]) - [`WorkerAvailability`] tracks whether a worker is
//!    `Idle`, `Busy` or `OnBreak`. A break that comes due while the worker is busy is deferred
//!    until the current item is released.
//! 3. **Observer Layer** ([`broadcast`]) - [`Broadcaster`] fans events out to live subscribers.
//!    A slow subscriber loses events instead of stalling the publisher.
//! 4. **Call Layer** ([`call`]) - [`call_with_retry`] invokes a peer with bounded, jittered
//!    backoff for transient failures. Capacity rejections are returned immediately so the
//!    caller can yield its work item.
//!
//! ## Concurrency Model
//!
//! - The stream runs in its own Tokio task and processes requests sequentially, so the log and
//!   consumer state need no locks.
//! - Worker availability is shared state behind a short `std::sync::Mutex`; every transition is
//!   a single critical section and no lock is held across an `.await`.
//! - Long-running loops take a [`CancellationToken`](tokio_util::sync::CancellationToken) and
//!   stop promptly when it fires.
//!
//! ## Testing
//!
//! The [`mock`] module mirrors the real stream client over a channel you control, and provides
//! a scripted responder for peers. See the module docs for usage.

pub mod availability;
pub mod broadcast;
pub mod call;
pub mod error;
pub mod headers;
pub mod mock;
pub mod queue;
pub mod tracing;

// Re-export core types for convenience
pub use availability::{
    Availability, BreakDraw, BreakKind, BreakLength, BreakPolicy, BreakStats, BusyGuard,
    WorkerAvailability,
};
pub use broadcast::{Broadcaster, EventSink, ForwardOutcome, PublishReport, Subscription};
pub use call::{call_with_retry, Classify, FailureClass, RetryPolicy};
pub use error::QueueError;
pub use headers::{Headers, CORRELATION_ID_HEADER};
pub use queue::{
    AckPolicy, BatchConsumer, ConsumerConfig, Delivery, DeliverPolicy, Message, Publisher,
    PullConsumer, StreamActor, StreamClient, StreamConfig, StreamInfo, StreamRequest,
};
