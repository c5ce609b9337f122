//! Readiness of the pipeline.

use pipeline_framework::{Availability, StreamClient, WorkerAvailability};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Available,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerHealth {
    pub name: String,
    pub availability: Availability,
    pub on_break_for_ms: Option<u64>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub queue_connected: bool,
    pub workers: Vec<WorkerHealth>,
}

/// Unavailable when the stream is gone or a watched worker has been on break for
/// longer than `max_break`.
pub struct HealthMonitor {
    stream: StreamClient,
    watched: Vec<Arc<WorkerAvailability>>,
    max_break: Duration,
}

impl HealthMonitor {
    pub fn new(stream: StreamClient, watched: Vec<Arc<WorkerAvailability>>, max_break: Duration) -> Self {
        Self {
            stream,
            watched,
            max_break,
        }
    }

    pub fn measure(&self) -> HealthReport {
        let queue_connected = self.stream.is_connected();
        let mut healthy = queue_connected;
        if !queue_connected {
            warn!("Stream disconnected");
        }

        let workers = self
            .watched
            .iter()
            .map(|worker| {
                let on_break_for = worker.on_break_for();
                if let Some(elapsed) = on_break_for.filter(|elapsed| *elapsed > self.max_break) {
                    warn!(worker = worker.name(), ?elapsed, max_break = ?self.max_break, "Worker on break too long");
                    healthy = false;
                }
                WorkerHealth {
                    name: worker.name().to_string(),
                    availability: worker.status(),
                    on_break_for_ms: on_break_for.map(|elapsed| elapsed.as_millis() as u64),
                    description: worker.describe(),
                }
            })
            .collect();

        HealthReport {
            status: if healthy {
                HealthStatus::Available
            } else {
                HealthStatus::Unavailable
            },
            queue_connected,
            workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_framework::mock::create_mock_stream;
    use pipeline_framework::BreakPolicy;

    #[tokio::test(start_paused = true)]
    async fn long_break_makes_the_pipeline_unavailable() {
        let (stream, _requests) = create_mock_stream(4);
        let worker = WorkerAvailability::new("panettiere", BreakPolicy::never());
        let monitor = HealthMonitor::new(stream, vec![worker.clone()], Duration::from_secs(10));

        assert_eq!(monitor.measure().status, HealthStatus::Available);

        worker.request_break(Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(5)).await;
        let report = monitor.measure();
        assert_eq!(report.status, HealthStatus::Available);
        assert_eq!(report.workers[0].availability, Availability::OnBreak);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(monitor.measure().status, HealthStatus::Unavailable);
    }

    #[tokio::test]
    async fn disconnected_stream_is_unavailable() {
        let (stream, requests) = create_mock_stream(4);
        let monitor = HealthMonitor::new(stream, Vec::new(), Duration::from_secs(10));
        drop(requests);

        let report = monitor.measure();
        assert!(!report.queue_connected);
        assert_eq!(report.status, HealthStatus::Unavailable);
    }
}
