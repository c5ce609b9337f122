//! # Dough Client
//!
//! Provides a high-level API for asking the panettiere for dough.
//! It wraps any [`DoughService`] and adds per-attempt timeouts and bounded retries.

use super::{Dough, DoughError, DoughRequest, DoughService};
use pipeline_framework::{call_with_retry, Headers, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Client for the dough-making peer.
#[derive(Clone)]
pub struct DoughClient {
    service: Arc<dyn DoughService>,
    retry: RetryPolicy,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl DoughClient {
    pub fn new(service: Arc<dyn DoughService>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            service,
            retry,
            call_timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Stops waiting between retries once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Asks for dough, forwarding `metadata` unchanged on every attempt.
    #[instrument(
        skip(self, request, metadata),
        fields(order_id = %request.order_id, correlation_id = metadata.correlation_id().unwrap_or("-"))
    )]
    pub async fn invoke(&self, request: DoughRequest, metadata: &Headers) -> Result<Dough, DoughError> {
        debug!("Sending request");
        let idempotent = request.is_idempotent();
        call_with_retry(&self.retry, idempotent, &self.cancel, |attempt| {
            let request = request.clone();
            async move {
                debug!(attempt, "Requesting dough");
                match tokio::time::timeout(self.call_timeout, self.service.make_dough(request, metadata)).await {
                    Ok(result) => result,
                    Err(_) => Err(DoughError::DeadlineExceeded(self.call_timeout)),
                }
            }
        })
        .await
    }

    pub async fn status(&self) -> String {
        self.service.status().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dough::mock::MockDoughService;
    use crate::model::{OrderId, PizzaSize};
    use crate::dough::BorderKind;

    fn request() -> DoughRequest {
        DoughRequest {
            order_id: OrderId::new(),
            size: PizzaSize::Medium,
            border: BorderKind::NoBorder,
        }
    }

    fn client(mock: &MockDoughService) -> DoughClient {
        DoughClient::new(
            Arc::new(mock.clone()),
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
            },
            Duration::from_secs(1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_same_metadata() {
        let mock = MockDoughService::new();
        mock.expect_make_dough().return_err(DoughError::Unavailable("connection reset".into()));
        mock.expect_make_dough().return_ok(Dough { content: "Dough".into() });

        let metadata = Headers::with_correlation_id("corr-1");
        let dough = client(&mock).invoke(request(), &metadata).await.unwrap();
        assert_eq!(dough.content, "Dough");

        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, headers)| headers == &metadata));
        mock.verify();
    }

    #[tokio::test]
    async fn capacity_exhaustion_is_not_retried() {
        let mock = MockDoughService::new();
        mock.expect_make_dough().return_err(DoughError::ResourceExhausted("sleeping".into()));

        let err = client(&mock).invoke(request(), &Headers::new()).await.unwrap_err();
        assert!(matches!(err, DoughError::ResourceExhausted(_)));
        assert_eq!(mock.calls().len(), 1);
        mock.verify();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_peer_times_out_per_attempt() {
        let mock = MockDoughService::new().with_latency(Duration::from_secs(5));
        for _ in 0..3 {
            mock.expect_make_dough().return_ok(Dough { content: "late".into() });
        }

        let err = client(&mock).invoke(request(), &Headers::new()).await.unwrap_err();
        assert_eq!(err, DoughError::DeadlineExceeded(Duration::from_secs(1)));
    }
}
