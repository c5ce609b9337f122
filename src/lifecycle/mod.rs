//! Starting and stopping the pipeline.

mod pizzeria;

pub use pipeline_framework::tracing::setup_tracing;
pub use pizzeria::{Pizzeria, SystemError};
