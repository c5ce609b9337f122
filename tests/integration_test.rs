use box_box::dough::mock::MockDoughService;
use box_box::dough::{Dough, DoughError};
use box_box::lifecycle::Pizzeria;
use box_box::model::{NewOrderRequest, Order, OrderId, Stage};
use box_box::settings::Settings;
use pipeline_framework::{ConsumerConfig, Headers, Subscription, CORRELATION_ID_HEADER};
use std::sync::Arc;
use std::time::Duration;

const FAST_KITCHEN: &str = r#"
maestro:
  period_between_lunch_ms: 3600000
  smoking_duration_ms: 0
  capacity_cooldown_ms: 500
  fetch_max_wait_ms: 200
panettiere:
  period_between_sleep_ms: 3600000
  time_to_make_a_dough_ms: 100
  dough_time_variance_factor: 1.0
gateway:
  relay_max_wait_ms: 50
"#;

fn settings() -> Settings {
    Settings::from_yaml(FAST_KITCHEN).expect("Failed to load test settings")
}

fn garage_16() -> NewOrderRequest {
    NewOrderRequest {
        size: "large".to_string(),
        toppings: vec![],
        destination: "Garage #16".to_string(),
        username: "lando".to_string(),
    }
}

/// Collects the stages one order goes through until it is delivered.
async fn stages_until_delivered(updates: &mut Subscription<Order>, order_id: OrderId) -> Vec<Stage> {
    let mut stages = Vec::new();
    while let Some(order) = updates.recv().await {
        if order.order_id != order_id {
            continue;
        }
        stages.push(order.status);
        if order.status == Stage::Delivered {
            break;
        }
    }
    stages
}

/// Full end-to-end test with the real panettiere.
#[tokio::test(start_paused = true)]
async fn test_order_reaches_delivery_for_prior_subscriber() {
    let pizzeria = Pizzeria::start(&settings()).await.expect("Failed to start pizzeria");
    let mut updates = pizzeria.gateway.subscribe();

    let receipt = pizzeria
        .gateway
        .submit_order(garage_16(), None)
        .await
        .expect("Failed to submit order");

    let stages = tokio::time::timeout(
        Duration::from_secs(60),
        stages_until_delivered(&mut updates, receipt.order_id),
    )
    .await
    .expect("Order was not delivered in time");

    assert_eq!(stages, vec![Stage::Pending, Stage::InFlight, Stage::Delivered]);
    assert_eq!(pizzeria.panettiere().expect("No panettiere").doughs_made(), 1);

    pizzeria.shutdown().await.expect("Shutdown failed");
}

/// The panettiere refuses three times; the order still gets exactly one dough.
#[tokio::test(start_paused = true)]
async fn test_capacity_rejections_end_in_single_delivery() {
    let mock = MockDoughService::new();
    for _ in 0..3 {
        mock.expect_make_dough()
            .return_err(DoughError::ResourceExhausted("panettiere is sleeping".to_string()));
    }
    mock.expect_make_dough().return_ok(Dough {
        content: "Dough with no border, size large".to_string(),
    });

    let pizzeria = Pizzeria::start_with_peer(&settings(), Arc::new(mock.clone()))
        .await
        .expect("Failed to start pizzeria");
    let delivery = pizzeria
        .stream
        .create_consumer(ConsumerConfig::durable("delivery", "orders.waiting_delivery.*"))
        .await
        .expect("Failed to create delivery consumer");
    let mut updates = pizzeria.gateway.subscribe();
    let counters = Arc::clone(pizzeria.maestro_counters());

    let receipt = pizzeria
        .gateway
        .submit_order(garage_16(), Some("corr-abc".to_string()))
        .await
        .expect("Failed to submit order");
    let stages = tokio::time::timeout(
        Duration::from_secs(60),
        stages_until_delivered(&mut updates, receipt.order_id),
    )
    .await
    .expect("Order was not delivered in time");
    assert_eq!(stages.last(), Some(&Stage::Delivered));
    assert_eq!(stages.iter().filter(|stage| **stage == Stage::InFlight).count(), 4);

    // Exactly one order moved on to delivery, carrying the submitter's correlation id.
    let delivered = delivery
        .fetch(10, Duration::from_secs(1))
        .await
        .expect("Failed to fetch delivered orders");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].headers().get(CORRELATION_ID_HEADER), Some("corr-abc"));

    // Every attempt forwarded the same correlation id.
    let calls = mock.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls.iter().all(|(request, headers)| {
        request.order_id == receipt.order_id && headers.correlation_id() == Some("corr-abc")
    }));
    mock.verify();

    pizzeria.shutdown().await.expect("Shutdown failed");
    let stats = counters.snapshot();
    assert_eq!(stats.deferred, 3);
    assert_eq!(stats.delivered, 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_order_is_dropped_and_pipeline_continues() {
    let pizzeria = Pizzeria::start(&settings()).await.expect("Failed to start pizzeria");
    let mut updates = pizzeria.gateway.subscribe();
    let counters = Arc::clone(pizzeria.maestro_counters());

    pizzeria
        .stream
        .publish("orders.waiting_to_cook.broken", Headers::new(), b"{\"size\":".to_vec())
        .await
        .expect("Failed to publish");
    let receipt = pizzeria
        .gateway
        .submit_order(garage_16(), None)
        .await
        .expect("Failed to submit order");

    let stages = tokio::time::timeout(
        Duration::from_secs(60),
        stages_until_delivered(&mut updates, receipt.order_id),
    )
    .await
    .expect("Order was not delivered in time");
    assert_eq!(stages.last(), Some(&Stage::Delivered));

    pizzeria.shutdown().await.expect("Shutdown failed");
    assert_eq!(counters.snapshot().dropped, 1);
    assert_eq!(counters.snapshot().delivered, 1);
}

/// Naps deferred while working start right after the dough is done.
#[tokio::test(start_paused = true)]
async fn test_panettiere_nap_does_not_lose_orders() {
    let settings = Settings::from_yaml(
        r#"
maestro:
  period_between_lunch_ms: 3600000
  smoking_duration_ms: 0
  capacity_cooldown_ms: 500
  fetch_max_wait_ms: 200
panettiere:
  period_between_sleep_ms: 250
  sleep_duration_ms: 300
  probability_of_oversleeping: 0.0
  time_to_make_a_dough_ms: 100
  dough_time_variance_factor: 1.0
"#,
    )
    .expect("Failed to load test settings");
    let pizzeria = Pizzeria::start(&settings).await.expect("Failed to start pizzeria");
    let mut updates = pizzeria.gateway.subscribe();

    let mut order_ids = Vec::new();
    for _ in 0..3 {
        let receipt = pizzeria
            .gateway
            .submit_order(garage_16(), None)
            .await
            .expect("Failed to submit order");
        order_ids.push(receipt.order_id);
    }

    let mut delivered = Vec::new();
    let collect = async {
        while delivered.len() < order_ids.len() {
            match updates.recv().await {
                Some(order) if order.status == Stage::Delivered => delivered.push(order.order_id),
                Some(_) => {}
                None => break,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(120), collect)
        .await
        .expect("Orders were not delivered in time");

    for order_id in &order_ids {
        assert!(delivered.contains(order_id));
    }
    let panettiere = pizzeria.panettiere().expect("No panettiere");
    assert_eq!(panettiere.doughs_made(), 3);
    assert!(panettiere.availability().stats().breaks_taken >= 1);

    pizzeria.shutdown().await.expect("Shutdown failed");
}
