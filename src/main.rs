use box_box::lifecycle::{setup_tracing, Pizzeria};
use box_box::model::{NewOrderRequest, Stage};
use box_box::settings::Settings;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn, Instrument};

/// How long the demo waits for its order before giving up.
const DEMO_TIMEOUT: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var_os("BOXBOX_CONFIG").map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref())?;
    setup_tracing(&settings.app.log_level);

    info!(app = %settings.app.name, "Starting pizzeria");
    let pizzeria = Pizzeria::start(&settings).await?;

    // Subscribe before ordering; there is no replay.
    let mut updates = pizzeria.gateway.subscribe();

    let request = NewOrderRequest {
        size: "large".to_string(),
        toppings: vec!["mozzarella".to_string(), "basil".to_string()],
        destination: "Garage #16".to_string(),
        username: "lando".to_string(),
    };
    let span = tracing::info_span!("order_submission");
    let receipt = async {
        info!("Submitting demo order");
        pizzeria.gateway.submit_order(request, None).await
    }
    .instrument(span)
    .await?;
    info!(order_id = %receipt.order_id, correlation_id = %receipt.correlation_id, "Order accepted");

    let watch = async {
        while let Some(order) = updates.recv().await {
            if order.order_id != receipt.order_id {
                continue;
            }
            info!(order_id = %order.order_id, status = ?order.status, "Order update");
            if order.status == Stage::Delivered {
                return true;
            }
        }
        false
    };

    tokio::select! {
        delivered = tokio::time::timeout(DEMO_TIMEOUT, watch) => match delivered {
            Ok(true) => info!("Pizza is waiting for delivery"),
            Ok(false) => error!("Update stream closed before the order was ready"),
            Err(_) => warn!(timeout = ?DEMO_TIMEOUT, health = ?pizzeria.health.measure(), "Gave up waiting"),
        },
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    pizzeria.shutdown().await?;
    Ok(())
}
