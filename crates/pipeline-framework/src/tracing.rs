//! # Observability & Tracing
//!
//! Structured logging for every pipeline component.
//!
//! ## Overview
//!
//! [`setup_tracing`] installs a compact `tracing-subscriber` formatter. The filter comes from
//! `RUST_LOG` when it is set, otherwise from the level configured for the process.
//!
//! ## What Gets Traced
//!
//! - **Stream**: startup, publishes, consumer creation, redeliveries and terminated messages
//! - **Workers**: availability transitions, break start and end, deferred breaks
//! - **Calls**: each retry with its backoff, capacity rejections
//! - **Observers**: subscribe, unsubscribe, dropped events for slow subscribers
//!
//! Every order-scoped log line carries `order_id` and `correlation_id` as structured fields.
//!
//! ## Usage Examples
//!
//! ```bash
//! # Compact logs (default)
//! RUST_LOG=info cargo run
//!
//! # Every queue operation and state transition
//! RUST_LOG=debug cargo run
//!
//! # Filter to the stream only
//! RUST_LOG=pipeline_framework::queue=debug cargo run
//! ```

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber.
///
/// `default_filter` is used when `RUST_LOG` is unset or unparsable. Calling this more than
/// once is harmless; later calls leave the first subscriber in place.
pub fn setup_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false) // order_id and worker fields identify the source
        .compact()
        .try_init();
}
