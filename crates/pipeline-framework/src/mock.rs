//! # Mock Framework
//!
//! Utilities for testing pipeline components in isolation.
//!
//! - [`create_mock_stream`] returns a real [`StreamClient`] whose requests arrive on a
//!   receiver you control. Use helpers like [`expect_publish`] or [`expect_fetch`] to
//!   assert what a component sends and to script the replies.
//! - [`MockResponder`] scripts the replies of a peer: queue expectations with
//!   [`expect_call`](MockResponder::expect_call), run the code under test, then
//!   [`verify`](MockResponder::verify) that every expectation was used.

use crate::error::QueueError;
use crate::headers::Headers;
use crate::queue::{FetchBatch, Response, StreamClient, StreamRequest};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

// =============================================================================
// SCRIPTED PEER
// =============================================================================

/// Replays queued responses in order and records every request it sees.
///
/// # Example
/// ```ignore
/// let mock = MockResponder::<DoughRequest, DoughResponse, DoughError>::new();
/// mock.expect_call().return_err(DoughError::ResourceExhausted("sleeping".into()));
/// mock.expect_call().return_ok(response);
///
/// // ... exercise the code under test ...
/// mock.verify(); // Ensures all expectations were met
/// ```
pub struct MockResponder<Req, T, E> {
    expectations: Arc<Mutex<VecDeque<Result<T, E>>>>,
    calls: Arc<Mutex<Vec<Req>>>,
}

impl<Req, T, E> Clone for MockResponder<Req, T, E> {
    fn clone(&self) -> Self {
        Self {
            expectations: Arc::clone(&self.expectations),
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<Req: Clone, T, E> Default for MockResponder<Req, T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req: Clone, T, E> MockResponder<Req, T, E> {
    pub fn new() -> Self {
        Self {
            expectations: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queues the response for the next call.
    pub fn expect_call(&self) -> CallExpectationBuilder<T, E> {
        CallExpectationBuilder {
            expectations: self.expectations.clone(),
        }
    }

    /// Records `request` and pops the next scripted response.
    ///
    /// # Panics
    /// When no expectation is left.
    pub fn respond(&self, request: Req) -> Result<T, E> {
        self.calls.lock().unwrap().push(request);
        let next = self.expectations.lock().unwrap().pop_front();
        match next {
            Some(response) => response,
            None => panic!("Unexpected call: no expectation left"),
        }
    }

    /// Every request seen so far, in order.
    pub fn calls(&self) -> Vec<Req> {
        self.calls.lock().unwrap().clone()
    }

    /// Verifies that all expectations were met.
    pub fn verify(&self) {
        let remaining = self.expectations.lock().unwrap().len();
        if remaining > 0 {
            panic!("Not all expectations were met. {} remaining", remaining);
        }
    }
}

/// Builder for one scripted response.
pub struct CallExpectationBuilder<T, E> {
    expectations: Arc<Mutex<VecDeque<Result<T, E>>>>,
}

impl<T, E> CallExpectationBuilder<T, E> {
    /// Sets the expectation to return a successful result.
    pub fn return_ok(self, value: T) {
        self.expectations.lock().unwrap().push_back(Ok(value));
    }

    /// Sets the expectation to return an error.
    pub fn return_err(self, error: E) {
        self.expectations.lock().unwrap().push_back(Err(error));
    }
}

// =============================================================================
// CHANNEL HELPERS
// =============================================================================

/// Creates a stream client and the receiver its requests arrive on.
///
/// No stream task runs behind it: every request waits until the test answers it
/// through the `respond_to` channel returned by the `expect_*` helpers.
pub fn create_mock_stream(buffer_size: usize) -> (StreamClient, mpsc::Receiver<StreamRequest>) {
    let (sender, receiver) = mpsc::channel(buffer_size);
    (StreamClient::new(sender, Arc::new(Notify::new())), receiver)
}

/// Helper to verify that the next message is a Publish request
pub async fn expect_publish(
    receiver: &mut mpsc::Receiver<StreamRequest>,
) -> Option<(String, Headers, Vec<u8>, Response<u64>)> {
    match receiver.recv().await {
        Some(StreamRequest::Publish {
            subject,
            headers,
            payload,
            respond_to,
        }) => Some((subject, headers, payload, respond_to)),
        _ => None,
    }
}

/// Helper to verify that the next message is a Fetch request
pub async fn expect_fetch(
    receiver: &mut mpsc::Receiver<StreamRequest>,
) -> Option<(String, usize, Response<FetchBatch>)> {
    match receiver.recv().await {
        Some(StreamRequest::Fetch {
            consumer,
            max_items,
            respond_to,
        }) => Some((consumer, max_items, respond_to)),
        _ => None,
    }
}

/// Helper to verify that the next message is an Ack request
pub async fn expect_ack(
    receiver: &mut mpsc::Receiver<StreamRequest>,
) -> Option<(String, u64, Response<()>)> {
    match receiver.recv().await {
        Some(StreamRequest::Ack {
            consumer,
            sequence,
            respond_to,
        }) => Some((consumer, sequence, respond_to)),
        _ => None,
    }
}

/// Answers the next request, whatever it is, with `error`. Handy for fault injection.
pub async fn fail_next(receiver: &mut mpsc::Receiver<StreamRequest>, error: QueueError) -> bool {
    let Some(request) = receiver.recv().await else {
        return false;
    };
    match request {
        StreamRequest::Publish { respond_to, .. } => respond_to.send(Err(error)).is_ok(),
        StreamRequest::CreateConsumer { respond_to, .. } => respond_to.send(Err(error)).is_ok(),
        StreamRequest::DeleteConsumer { respond_to, .. } => respond_to.send(Err(error)).is_ok(),
        StreamRequest::Fetch { respond_to, .. } => respond_to.send(Err(error)).is_ok(),
        StreamRequest::Ack { respond_to, .. }
        | StreamRequest::Nak { respond_to, .. }
        | StreamRequest::InProgress { respond_to, .. } => respond_to.send(Err(error)).is_ok(),
        StreamRequest::Info { respond_to } => respond_to.send(Err(error)).is_ok(),
    }
}
