//! Scripted dough service for tests.

use super::{Dough, DoughError, DoughRequest, DoughService};
use async_trait::async_trait;
use pipeline_framework::mock::{CallExpectationBuilder, MockResponder};
use pipeline_framework::Headers;
use std::time::Duration;

/// A [`DoughService`] that replays queued responses in order.
///
/// # Example
/// ```ignore
/// let mock = MockDoughService::new();
/// mock.expect_make_dough().return_err(DoughError::ResourceExhausted("sleeping".into()));
/// mock.expect_make_dough().return_ok(Dough { content: "Dough".into() });
///
/// // ... run the maestro against it ...
/// mock.verify();
/// ```
#[derive(Clone, Default)]
pub struct MockDoughService {
    responder: MockResponder<(DoughRequest, Headers), Dough, DoughError>,
    latency: Duration,
}

impl MockDoughService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every response by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn expect_make_dough(&self) -> CallExpectationBuilder<Dough, DoughError> {
        self.responder.expect_call()
    }

    /// Every request received so far, with the metadata it carried.
    pub fn calls(&self) -> Vec<(DoughRequest, Headers)> {
        self.responder.calls()
    }

    pub fn verify(&self) {
        self.responder.verify()
    }
}

#[async_trait]
impl DoughService for MockDoughService {
    async fn make_dough(&self, request: DoughRequest, metadata: &Headers) -> Result<Dough, DoughError> {
        let response = self.responder.respond((request, metadata.clone()));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        response
    }

    async fn status(&self) -> String {
        "mock".to_string()
    }
}
