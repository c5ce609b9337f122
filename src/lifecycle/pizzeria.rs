use crate::dough::{DoughClient, DoughService};
use crate::gateway::health::HealthMonitor;
use crate::gateway::relay::Relay;
use crate::gateway::Gateway;
use crate::maestro::{Maestro, MaestroCounters};
use crate::panettiere::Panettiere;
use crate::settings::Settings;
use crate::subjects::Subjects;
use pipeline_framework::{
    Broadcaster, ConsumerConfig, QueueError, StreamActor, StreamClient, StreamConfig, WorkerAvailability,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum SystemError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Task `{task}` failed: {reason}")]
    TaskFailed { task: &'static str, reason: String },
}

/// The whole pipeline in one process.
///
/// `Pizzeria` is responsible for:
/// - **Lifecycle Management**: starting the stream, the panettiere, the maestro and the
///   gateway relay, and stopping them in order
/// - **Dependency Wiring**: the maestro gets its consumer, its publisher and a dough client;
///   the gateway gets the publisher and the broadcaster the relay feeds
///
/// # Example
///
/// ```ignore
/// let pizzeria = Pizzeria::start(&settings).await?;
///
/// let mut updates = pizzeria.gateway.subscribe();
/// let receipt = pizzeria.gateway.submit_order(request, None).await?;
///
/// // Gracefully shut down when done
/// pizzeria.shutdown().await?;
/// ```
pub struct Pizzeria {
    /// Ingress and live updates.
    pub gateway: Gateway,

    /// Client for the order stream.
    pub stream: StreamClient,

    pub health: HealthMonitor,

    maestro: Arc<WorkerAvailability>,
    maestro_counters: Arc<MaestroCounters>,
    panettiere: Option<Arc<Panettiere>>,

    /// The relay's consumer, removed once the relay has stopped.
    monitor_consumer: String,

    /// Stops the workers, the timers and the relay.
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,

    /// The stream stops last, once nothing can publish or ack anymore.
    stream_cancel: CancellationToken,
    stream_handle: JoinHandle<()>,
}

impl Pizzeria {
    /// Starts everything with the in-process panettiere as the dough peer.
    pub async fn start(settings: &Settings) -> Result<Self, SystemError> {
        let panettiere = Panettiere::new(settings.panettiere.panettiere_config());
        let peer: Arc<dyn DoughService> = panettiere.clone();
        Self::assemble(settings, peer, Some(panettiere)).await
    }

    /// Starts everything against another dough peer, such as a mock.
    pub async fn start_with_peer(settings: &Settings, peer: Arc<dyn DoughService>) -> Result<Self, SystemError> {
        Self::assemble(settings, peer, None).await
    }

    async fn assemble(
        settings: &Settings,
        peer: Arc<dyn DoughService>,
        panettiere: Option<Arc<Panettiere>>,
    ) -> Result<Self, SystemError> {
        let subjects = Subjects::new(settings.stream.subject_root.clone());
        let cancel = CancellationToken::new();
        let stream_cancel = CancellationToken::new();
        let mut handles = Vec::new();

        // 1. The stream
        let (stream_actor, stream) = StreamActor::new(
            StreamConfig::new(settings.stream.name.clone(), [subjects.all()]),
            settings.stream.buffer_size,
        );
        let stream_handle = tokio::spawn(stream_actor.run_until(stream_cancel.clone()));

        // 2. Consumers exist before anything is published
        let orders = stream
            .create_consumer(
                ConsumerConfig::durable(settings.maestro.consumer_name.clone(), subjects.waiting_to_cook_filter())
                    .with_ack_wait(settings.stream.ack_wait())
                    .with_max_deliver(settings.stream.max_deliver),
            )
            .await?;
        let monitor = stream.create_consumer(ConsumerConfig::monitor(subjects.all())).await?;
        let monitor_consumer = monitor.name().to_string();

        // 3. Live updates
        let broadcaster = Broadcaster::new(settings.gateway.subscriber_buffer);
        let relay = Relay::new(
            monitor,
            broadcaster.clone(),
            settings.gateway.relay_batch_size,
            settings.gateway.relay_max_wait(),
        );
        handles.push(("relay", tokio::spawn(relay.run(cancel.clone()))));

        // 4. The panettiere's naps
        if let Some(panettiere) = &panettiere {
            handles.push(("panettiere timer", panettiere.start(cancel.clone())));
        }

        // 5. The maestro and its lunch breaks
        let availability = WorkerAvailability::new("maestro", settings.maestro.lunch_policy());
        handles.push(("maestro timer", availability.spawn_break_timer(cancel.clone())));
        let client = &settings.maestro.panettiere_client;
        let dough = DoughClient::new(peer, client.retry_policy(), client.call_timeout())
            .with_cancellation(cancel.clone());
        let maestro = Maestro::new(
            orders,
            stream.clone(),
            dough,
            Arc::clone(&availability),
            subjects.clone(),
            settings.maestro.maestro_config(),
        );
        let maestro_counters = maestro.counters();
        handles.push(("maestro", tokio::spawn(maestro.run(cancel.clone()))));

        let mut watched = vec![Arc::clone(&availability)];
        if let Some(panettiere) = &panettiere {
            watched.push(Arc::clone(panettiere.availability()));
        }
        let health = HealthMonitor::new(stream.clone(), watched, settings.health.max_break());
        let gateway = Gateway::new(Arc::new(stream.clone()), subjects, broadcaster);

        info!(app = %settings.app.name, stream = %settings.stream.name, "Pizzeria open");
        Ok(Self {
            gateway,
            stream,
            health,
            maestro: availability,
            maestro_counters,
            panettiere,
            monitor_consumer,
            cancel,
            handles,
            stream_cancel,
            stream_handle,
        })
    }

    pub fn maestro(&self) -> &Arc<WorkerAvailability> {
        &self.maestro
    }

    pub fn maestro_counters(&self) -> &Arc<MaestroCounters> {
        &self.maestro_counters
    }

    /// The in-process dough peer, when it is the one in use.
    pub fn panettiere(&self) -> Option<&Arc<Panettiere>> {
        self.panettiere.as_ref()
    }

    /// Gracefully shuts down the pipeline.
    ///
    /// The maestro finishes the order it is working on, then every task is awaited and
    /// the stream is stopped last. A task that panicked is reported after the rest
    /// have stopped.
    pub async fn shutdown(self) -> Result<(), SystemError> {
        info!("Shutting down pizzeria...");
        self.cancel.cancel();

        let mut failure = None;
        for (task, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(task, error = %e, "Task failed");
                failure.get_or_insert(SystemError::TaskFailed {
                    task,
                    reason: e.to_string(),
                });
            }
        }

        if let Err(e) = self.stream.delete_consumer(&self.monitor_consumer).await {
            warn!(consumer = %self.monitor_consumer, error = %e, "Failed to delete relay consumer");
        }

        drop(self.gateway);
        drop(self.health);
        drop(self.stream);
        self.stream_cancel.cancel();
        if let Err(e) = self.stream_handle.await {
            error!(task = "stream", error = %e, "Task failed");
            failure.get_or_insert(SystemError::TaskFailed {
                task: "stream",
                reason: e.to_string(),
            });
        }

        match failure {
            Some(failure) => Err(failure),
            None => {
                info!(stats = ?self.maestro_counters.snapshot(), "Pizzeria closed");
                Ok(())
            }
        }
    }
}
