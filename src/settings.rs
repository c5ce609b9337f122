//! # Settings
//!
//! Configuration is layered, later sources overriding earlier ones:
//!
//! 1. `configuration/base.yaml`, compiled into the binary.
//! 2. An optional YAML file given at startup.
//! 3. Environment variables prefixed with `BOXBOX_`. Nested keys use double
//!    underscores, e.g. `BOXBOX_MAESTRO__BATCH_SIZE=20`.
//!
//! Durations are plain millisecond counts. Every section is validated after loading.

use crate::maestro::MaestroConfig;
use crate::panettiere::PanettiereConfig;
use config::builder::{ConfigBuilder, DefaultState};
use config::{Environment, File, FileFormat};
use pipeline_framework::{BreakDraw, BreakPolicy, RetryPolicy};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const BASE_CONFIGURATION: &str = include_str!("../configuration/base.yaml");

/// Prefix for environment variable configuration overrides.
const ENV_PREFIX: &str = "BOXBOX";

/// Separator between environment variable prefix and key segments.
const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested configuration keys in environment variables.
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub app: AppSettings,
    pub stream: StreamSettings,
    pub maestro: MaestroSettings,
    pub panettiere: PanettiereSettings,
    pub gateway: GatewaySettings,
    pub health: HealthSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppSettings {
    pub name: String,
    /// Default `tracing` filter when `RUST_LOG` is not set.
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamSettings {
    pub name: String,
    pub subject_root: String,
    pub buffer_size: usize,
    pub ack_wait_ms: u64,
    #[serde(default)]
    pub max_deliver: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MaestroSettings {
    pub consumer_name: String,
    pub batch_size: usize,
    pub fetch_max_wait_ms: u64,
    /// Absent disables lunch.
    #[serde(default)]
    pub period_between_lunch_ms: Option<u64>,
    pub lunch_duration_ms: u64,
    /// Zero disables smoking.
    pub smoking_duration_ms: u64,
    pub probability_of_oversmoking: f64,
    pub oversmoking_factor: f64,
    pub capacity_cooldown_ms: u64,
    pub fetch_error_backoff_ms: u64,
    pub panettiere_client: ClientSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSettings {
    pub call_timeout_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PanettiereSettings {
    /// Absent disables naps.
    #[serde(default)]
    pub period_between_sleep_ms: Option<u64>,
    pub sleep_duration_ms: u64,
    pub probability_of_oversleeping: f64,
    pub oversleeping_factor: f64,
    pub time_to_make_a_dough_ms: u64,
    pub dough_time_variance_factor: f64,
    /// How many finished doughs are remembered for repeated requests.
    pub prepared_dough_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewaySettings {
    pub subscriber_buffer: usize,
    pub relay_batch_size: usize,
    pub relay_max_wait_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthSettings {
    /// A watched worker on break longer than this makes the pipeline unavailable.
    pub max_break_ms: u64,
}

impl Settings {
    /// Loads the base configuration, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = base_builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_PREFIX_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true);
        Self::build(builder.add_source(environment))
    }

    /// Base configuration overridden by an inline YAML document.
    pub fn from_yaml(overrides: &str) -> Result<Self, ConfigError> {
        Self::build(base_builder().add_source(File::from_str(overrides, FileFormat::Yaml)))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.stream.validate()?;
        self.maestro.validate()?;
        self.panettiere.validate()?;
        self.gateway.validate()?;
        positive("health.max_break_ms", self.health.max_break_ms)
    }
}

fn base_builder() -> ConfigBuilder<DefaultState> {
    config::Config::builder().add_source(File::from_str(BASE_CONFIGURATION, FileFormat::Yaml))
}

impl StreamSettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(invalid("stream.name", "must not be empty"));
        }
        if self.subject_root.is_empty() || self.subject_root.contains(['.', '*', '>', ' ']) {
            return Err(invalid("stream.subject_root", "must be a single subject token"));
        }
        positive("stream.buffer_size", self.buffer_size as u64)?;
        positive("stream.ack_wait_ms", self.ack_wait_ms)?;
        if self.max_deliver == Some(0) {
            return Err(invalid("stream.max_deliver", "must be greater than 0 when set"));
        }
        Ok(())
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }
}

impl MaestroSettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.consumer_name.trim().is_empty() {
            return Err(invalid("maestro.consumer_name", "must not be empty"));
        }
        positive("maestro.batch_size", self.batch_size as u64)?;
        positive("maestro.fetch_max_wait_ms", self.fetch_max_wait_ms)?;
        if let Some(period) = self.period_between_lunch_ms {
            positive("maestro.period_between_lunch_ms", period)?;
            positive("maestro.lunch_duration_ms", self.lunch_duration_ms)?;
        }
        probability("maestro.probability_of_oversmoking", self.probability_of_oversmoking)?;
        at_least_one("maestro.oversmoking_factor", self.oversmoking_factor)?;
        positive("maestro.capacity_cooldown_ms", self.capacity_cooldown_ms)?;
        self.panettiere_client.validate("maestro.panettiere_client")
    }

    /// Lunch schedule.
    pub fn lunch_policy(&self) -> BreakPolicy {
        match self.period_between_lunch_ms {
            Some(period) => BreakPolicy::every(
                Duration::from_millis(period),
                BreakDraw::fixed(Duration::from_millis(self.lunch_duration_ms)),
            ),
            None => BreakPolicy::never(),
        }
    }

    pub fn maestro_config(&self) -> MaestroConfig {
        MaestroConfig {
            batch_size: self.batch_size,
            fetch_max_wait: Duration::from_millis(self.fetch_max_wait_ms),
            smoke: BreakDraw {
                base: Duration::from_millis(self.smoking_duration_ms),
                extension_probability: self.probability_of_oversmoking,
                extension_factor: self.oversmoking_factor,
            },
            capacity_cooldown: Duration::from_millis(self.capacity_cooldown_ms),
            fetch_error_backoff: Duration::from_millis(self.fetch_error_backoff_ms),
        }
    }
}

impl ClientSettings {
    fn validate(&self, prefix: &str) -> Result<(), ValidationError> {
        positive(&format!("{prefix}.call_timeout_ms"), self.call_timeout_ms)?;
        if self.max_attempts == 0 {
            return Err(invalid(format!("{prefix}.max_attempts"), "must be at least 1"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(invalid(
                format!("{prefix}.max_backoff_ms"),
                "must not be less than initial_backoff_ms",
            ));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

impl PanettiereSettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(period) = self.period_between_sleep_ms {
            positive("panettiere.period_between_sleep_ms", period)?;
            positive("panettiere.sleep_duration_ms", self.sleep_duration_ms)?;
        }
        probability("panettiere.probability_of_oversleeping", self.probability_of_oversleeping)?;
        at_least_one("panettiere.oversleeping_factor", self.oversleeping_factor)?;
        at_least_one("panettiere.dough_time_variance_factor", self.dough_time_variance_factor)?;
        positive("panettiere.prepared_dough_capacity", self.prepared_dough_capacity as u64)
    }

    pub fn panettiere_config(&self) -> PanettiereConfig {
        let sleep = match self.period_between_sleep_ms {
            Some(period) => BreakPolicy::every(
                Duration::from_millis(period),
                BreakDraw {
                    base: Duration::from_millis(self.sleep_duration_ms),
                    extension_probability: self.probability_of_oversleeping,
                    extension_factor: self.oversleeping_factor,
                },
            ),
            None => BreakPolicy::never(),
        };
        PanettiereConfig {
            sleep,
            dough_time: Duration::from_millis(self.time_to_make_a_dough_ms),
            dough_time_variance_factor: self.dough_time_variance_factor,
            prepared_capacity: self.prepared_dough_capacity,
        }
    }
}

impl GatewaySettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        positive("gateway.subscriber_buffer", self.subscriber_buffer as u64)?;
        positive("gateway.relay_batch_size", self.relay_batch_size as u64)?;
        positive("gateway.relay_max_wait_ms", self.relay_max_wait_ms)
    }

    pub fn relay_max_wait(&self) -> Duration {
        Duration::from_millis(self.relay_max_wait_ms)
    }
}

impl HealthSettings {
    pub fn max_break(&self) -> Duration {
        Duration::from_millis(self.max_break_ms)
    }
}

fn invalid(field: impl Into<String>, constraint: &str) -> ValidationError {
    ValidationError::InvalidFieldValue {
        field: field.into(),
        constraint: constraint.to_string(),
    }
}

fn positive(field: &str, value: u64) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(invalid(field, "must be greater than 0"));
    }
    Ok(())
}

fn probability(field: &str, value: f64) -> Result<(), ValidationError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(field, "must be between 0 and 1"));
    }
    Ok(())
}

fn at_least_one(field: &str, value: f64) -> Result<(), ValidationError> {
    if value.is_nan() || value < 1.0 {
        return Err(invalid(field, "must be at least 1"));
    }
    Ok(())
}
