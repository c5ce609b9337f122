//! # Dough Service
//!
//! The contract between the maestro and the panettiere, the capacity-constrained
//! peer that prepares dough for each order.
//!
//! - [`DoughService`] is the peer seam. [`Panettiere`](crate::panettiere::Panettiere)
//!   implements it in-process; [`mock::MockDoughService`] scripts it in tests.
//! - [`DoughClient`] is what the maestro calls. It forwards the order's correlation
//!   headers on every attempt and retries only transient failures.
//! - [`DoughError::ResourceExhausted`] means "not now". It is never retried by the
//!   client; the maestro leaves the order on the queue instead.

pub mod client;
pub mod mock;

pub use client::DoughClient;

use crate::model::{Order, OrderId, PizzaSize};
use async_trait::async_trait;
use pipeline_framework::{Classify, FailureClass, Headers};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorderKind {
    #[default]
    NoBorder,
    Stuffed,
}

impl Display for BorderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BorderKind::NoBorder => write!(f, "no"),
            BorderKind::Stuffed => write!(f, "stuffed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoughRequest {
    pub order_id: OrderId,
    pub size: PizzaSize,
    pub border: BorderKind,
}

impl DoughRequest {
    pub fn for_order(order: &Order) -> Self {
        Self {
            order_id: order.order_id,
            size: order.size,
            border: BorderKind::default(),
        }
    }

    /// Dough is keyed by order id, so asking twice yields the same dough.
    pub fn is_idempotent(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dough {
    pub content: String,
}

/// Errors that can occur while asking for dough.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DoughError {
    /// The peer is resting or already busy; try again later via redelivery.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The peer could not be reached.
    #[error("Dough service unavailable: {0}")]
    Unavailable(String),

    /// One attempt took longer than the call timeout.
    #[error("Dough request timed out after {0:?}")]
    DeadlineExceeded(Duration),

    /// The request itself is wrong; retrying will not help.
    #[error("Invalid dough request: {0}")]
    InvalidRequest(String),
}

impl Classify for DoughError {
    fn class(&self) -> FailureClass {
        match self {
            DoughError::ResourceExhausted(_) => FailureClass::CapacityExhausted,
            DoughError::Unavailable(_) | DoughError::DeadlineExceeded(_) => FailureClass::Transient,
            DoughError::InvalidRequest(_) => FailureClass::Permanent,
        }
    }
}

/// The dough-making peer.
#[async_trait]
pub trait DoughService: Send + Sync {
    /// Prepares dough for one order. `metadata` carries the correlation headers.
    async fn make_dough(&self, request: DoughRequest, metadata: &Headers) -> Result<Dough, DoughError>;

    /// A short human-readable description of what the peer is doing.
    async fn status(&self) -> String;
}
