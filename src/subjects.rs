//! Stream subjects for each pipeline stage.

use crate::model::OrderId;

/// Builds subjects under a common root, `orders` by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    root: String,
}

impl Default for Subjects {
    fn default() -> Self {
        Self::new("orders")
    }
}

impl Subjects {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Where ingress publishes new orders.
    pub fn waiting_to_cook(&self, order_id: &OrderId) -> String {
        format!("{}.waiting_to_cook.{}", self.root, order_id)
    }

    /// Progress events emitted while an order is being cooked.
    pub fn in_progress(&self, order_id: &OrderId) -> String {
        format!("{}.in_progress.{}", self.root, order_id)
    }

    /// The next stage after the kitchen.
    pub fn waiting_delivery(&self, order_id: &OrderId) -> String {
        format!("{}.waiting_delivery.{}", self.root, order_id)
    }

    pub fn waiting_to_cook_filter(&self) -> String {
        format!("{}.waiting_to_cook.*", self.root)
    }

    /// Every subject under the root.
    pub fn all(&self) -> String {
        format!("{}.>", self.root)
    }
}
