use box_box::gateway::sse::SseWriter;
use box_box::gateway::{Gateway, IngressError};
use box_box::lifecycle::Pizzeria;
use box_box::model::{NewOrderRequest, Order, Stage};
use box_box::settings::Settings;
use box_box::subjects::Subjects;
use pipeline_framework::{Broadcaster, ConsumerConfig, ForwardOutcome, StreamActor, StreamConfig, CORRELATION_ID_HEADER};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

fn request(size: &str) -> NewOrderRequest {
    NewOrderRequest {
        size: size.to_string(),
        toppings: vec!["basil".to_string()],
        destination: "Garage #16".to_string(),
        username: "lando".to_string(),
    }
}

fn settings() -> Settings {
    Settings::from_yaml(
        r#"
maestro:
  period_between_lunch_ms: 3600000
  smoking_duration_ms: 0
panettiere:
  period_between_sleep_ms: 3600000
  time_to_make_a_dough_ms: 100
  dough_time_variance_factor: 1.0
gateway:
  relay_max_wait_ms: 50
"#,
    )
    .expect("Failed to load test settings")
}

#[tokio::test]
async fn test_submit_order_publishes_with_correlation_header() {
    let (actor, stream) = StreamActor::new(StreamConfig::new("ORDERS", ["orders.>"]), 16);
    tokio::spawn(actor.run());
    let consumer = stream
        .create_consumer(ConsumerConfig::durable("kitchen", "orders.waiting_to_cook.*"))
        .await
        .expect("Failed to create consumer");
    let gateway = Gateway::new(Arc::new(stream.clone()), Subjects::default(), Broadcaster::new(4));

    let given = gateway
        .submit_order(request("Medium"), Some("corr-1".to_string()))
        .await
        .expect("Failed to submit order");
    let generated = gateway
        .submit_order(request("small"), None)
        .await
        .expect("Failed to submit order");
    assert_eq!(given.correlation_id, "corr-1");
    assert!(!generated.correlation_id.is_empty());
    assert_ne!(generated.correlation_id, given.correlation_id);

    let deliveries = consumer
        .fetch(2, Duration::from_millis(100))
        .await
        .expect("Failed to fetch");
    assert_eq!(deliveries.len(), 2);
    assert_eq!(
        deliveries[0].subject(),
        format!("orders.waiting_to_cook.{}", given.order_id)
    );
    assert_eq!(deliveries[0].headers().get(CORRELATION_ID_HEADER), Some("corr-1"));
    assert_eq!(
        deliveries[1].headers().get(CORRELATION_ID_HEADER),
        Some(generated.correlation_id.as_str())
    );

    let queued = Order::from_payload(deliveries[0].payload()).expect("Invalid payload");
    assert_eq!(queued.order_id, given.order_id);
    assert_eq!(queued.status, Stage::Pending);
    assert_eq!(queued.ordered_at, given.ordered_at);
}

#[tokio::test]
async fn test_invalid_order_is_rejected_before_queueing() {
    let (actor, stream) = StreamActor::new(StreamConfig::new("ORDERS", ["orders.>"]), 16);
    tokio::spawn(actor.run());
    let gateway = Gateway::new(Arc::new(stream.clone()), Subjects::default(), Broadcaster::new(4));

    let err = gateway
        .submit_order(request("enormous"), None)
        .await
        .expect_err("Order should be rejected");
    match err {
        IngressError::InvalidField(field) => assert_eq!(field.field, "size"),
        other => panic!("Unexpected error: {other}"),
    }

    let err = gateway
        .submit_order(
            NewOrderRequest {
                destination: String::new(),
                ..request("large")
            },
            None,
        )
        .await
        .expect_err("Order should be rejected");
    assert!(err.to_string().contains("destination"));

    let info = stream.info().await.expect("Failed to read stream info");
    assert_eq!(info.messages, 0);
}

#[tokio::test(start_paused = true)]
async fn test_late_subscriber_sees_no_replay() {
    let pizzeria = Pizzeria::start(&settings()).await.expect("Failed to start pizzeria");
    let mut early = pizzeria.gateway.subscribe();

    let first = pizzeria
        .gateway
        .submit_order(request("large"), None)
        .await
        .expect("Failed to submit order");
    loop {
        let order = early.recv().await.expect("Broadcaster closed");
        if order.order_id == first.order_id && order.status == Stage::Delivered {
            break;
        }
    }

    let mut late = pizzeria.gateway.subscribe();
    let second = pizzeria
        .gateway
        .submit_order(request("small"), None)
        .await
        .expect("Failed to submit order");
    let seen = tokio::time::timeout(Duration::from_secs(10), late.recv())
        .await
        .expect("No event for late subscriber")
        .expect("Broadcaster closed");
    assert_eq!(seen.order_id, second.order_id);
    assert_eq!(seen.status, Stage::Pending);

    pizzeria.shutdown().await.expect("Shutdown failed");
}

#[tokio::test(start_paused = true)]
async fn test_stream_to_writes_sse_frames_until_cancelled() {
    let pizzeria = Pizzeria::start(&settings()).await.expect("Failed to start pizzeria");
    let (client, server) = tokio::io::duplex(64 * 1024);
    let cancel = CancellationToken::new();

    let gateway = pizzeria.gateway.clone();
    let streaming = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sink = SseWriter::new(client);
            gateway.stream_to(&mut sink, &cancel).await
        })
    };
    while pizzeria.gateway.broadcaster().subscriber_count() == 0 {
        tokio::task::yield_now().await;
    }

    let receipt = pizzeria
        .gateway
        .submit_order(request("large"), None)
        .await
        .expect("Failed to submit order");

    let mut lines = BufReader::new(server).lines();
    let mut stages = Vec::new();
    while stages.last() != Some(&Stage::Delivered) {
        let line = lines
            .next_line()
            .await
            .expect("Failed to read frame")
            .expect("Stream ended early");
        if line.is_empty() {
            continue;
        }
        let json = line.strip_prefix("data: ").expect("Frame without data prefix");
        let order: Order = serde_json::from_str(json).expect("Invalid event payload");
        assert_eq!(order.order_id, receipt.order_id);
        stages.push(order.status);
    }
    assert_eq!(stages, vec![Stage::Pending, Stage::InFlight, Stage::Delivered]);

    cancel.cancel();
    let outcome = streaming.await.expect("Streaming task panicked");
    assert!(matches!(outcome, ForwardOutcome::Cancelled));
    assert_eq!(pizzeria.gateway.broadcaster().subscriber_count(), 0);

    pizzeria.shutdown().await.expect("Shutdown failed");
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_observer_is_unsubscribed() {
    let pizzeria = Pizzeria::start(&settings()).await.expect("Failed to start pizzeria");
    let (client, server) = tokio::io::duplex(1024);
    drop(server);

    let gateway = pizzeria.gateway.clone();
    let streaming = tokio::spawn(async move {
        let mut sink = SseWriter::new(client);
        gateway.stream_to(&mut sink, &CancellationToken::new()).await
    });
    while pizzeria.gateway.broadcaster().subscriber_count() == 0 {
        tokio::task::yield_now().await;
    }

    pizzeria
        .gateway
        .submit_order(request("large"), None)
        .await
        .expect("Failed to submit order");

    let outcome = tokio::time::timeout(Duration::from_secs(10), streaming)
        .await
        .expect("Stream did not notice the disconnect")
        .expect("Streaming task panicked");
    assert!(matches!(outcome, ForwardOutcome::Disconnected(_)));
    assert_eq!(pizzeria.gateway.broadcaster().subscriber_count(), 0);

    pizzeria.shutdown().await.expect("Shutdown failed");
}
