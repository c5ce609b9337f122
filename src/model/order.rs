use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Type-safe identifier for Orders, assigned at ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub Uuid);

impl OrderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrderId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PizzaSize {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown pizza size: {0}")]
pub struct UnknownSize(pub String);

impl FromStr for PizzaSize {
    type Err = UnknownSize;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(PizzaSize::Small),
            "medium" => Ok(PizzaSize::Medium),
            "large" => Ok(PizzaSize::Large),
            _ => Err(UnknownSize(s.to_string())),
        }
    }
}

impl Display for PizzaSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PizzaSize::Small => write!(f, "small"),
            PizzaSize::Medium => write!(f, "medium"),
            PizzaSize::Large => write!(f, "large"),
        }
    }
}

/// Where an order is in the pipeline. Only ever moves forward.
///
/// On the wire the stages use the names of the subjects they are published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_progress")]
    InFlight,
    #[serde(rename = "waiting_delivery")]
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// An order was asked to move back to an earlier stage.
    #[error("Order {order_id} cannot move from {from:?} back to {to:?}")]
    Regression { order_id: OrderId, from: Stage, to: Stage },
}

/// An order as it travels through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub size: PizzaSize,
    pub toppings: Vec<String>,
    pub destination: String,
    pub username: String,
    pub ordered_at: DateTime<Utc>,
    pub status: Stage,
}

impl Order {
    /// A new `Pending` order stamped with a fresh id and the current time.
    pub fn new(size: PizzaSize, toppings: Vec<String>, destination: String, username: String) -> Self {
        Self {
            order_id: OrderId::new(),
            size,
            toppings,
            destination,
            username,
            ordered_at: Utc::now(),
            status: Stage::Pending,
        }
    }

    /// Moves the order to `next`. Staying at the same stage is allowed, since
    /// redelivered orders replay their last transition.
    pub fn advance(mut self, next: Stage) -> Result<Self, StageError> {
        if next < self.status {
            return Err(StageError::Regression {
                order_id: self.order_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(self)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// The order as submitted by a customer, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderRequest {
    pub size: String,
    #[serde(default)]
    pub toppings: Vec<String>,
    pub destination: String,
    pub username: String,
}

/// A rejected attribute of a [`NewOrderRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid `{field}`: {reason}")]
pub struct FieldError {
    pub field: &'static str,
    pub reason: String,
}

impl NewOrderRequest {
    /// Checks every attribute and builds the `Pending` order.
    pub fn into_order(self) -> Result<Order, FieldError> {
        let size = self.size.parse::<PizzaSize>().map_err(|e| FieldError {
            field: "size",
            reason: format!("{e}; expected one of small, medium, large"),
        })?;
        if let Some(index) = self.toppings.iter().position(|t| t.trim().is_empty()) {
            return Err(FieldError {
                field: "toppings",
                reason: format!("topping {index} is empty"),
            });
        }
        if self.destination.trim().is_empty() {
            return Err(FieldError {
                field: "destination",
                reason: "is required".to_string(),
            });
        }
        if self.username.trim().is_empty() {
            return Err(FieldError {
                field: "username",
                reason: "is required".to_string(),
            });
        }
        Ok(Order::new(size, self.toppings, self.destination, self.username))
    }
}

/// What the submitter gets back once an order is queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: OrderId,
    pub ordered_at: DateTime<Utc>,
    pub correlation_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> NewOrderRequest {
        NewOrderRequest {
            size: "Large".to_string(),
            toppings: vec!["basil".to_string()],
            destination: "Garage #16".to_string(),
            username: "lando".to_string(),
        }
    }

    #[test]
    fn size_parsing_ignores_case() {
        assert_eq!("LARGE".parse::<PizzaSize>(), Ok(PizzaSize::Large));
        assert_eq!(" small ".parse::<PizzaSize>(), Ok(PizzaSize::Small));
        assert!("huge".parse::<PizzaSize>().is_err());
    }

    #[test]
    fn valid_request_becomes_pending_order() {
        let order = request().into_order().unwrap();
        assert_eq!(order.size, PizzaSize::Large);
        assert_eq!(order.status, Stage::Pending);
        assert_eq!(order.destination, "Garage #16");
    }

    #[test]
    fn validation_names_the_failing_attribute() {
        let err = NewOrderRequest { size: "huge".into(), ..request() }.into_order().unwrap_err();
        assert_eq!(err.field, "size");

        let err = NewOrderRequest { destination: " ".into(), ..request() }.into_order().unwrap_err();
        assert_eq!(err.field, "destination");

        let err = NewOrderRequest { username: String::new(), ..request() }.into_order().unwrap_err();
        assert_eq!(err.field, "username");

        let err = NewOrderRequest { toppings: vec!["".into()], ..request() }.into_order().unwrap_err();
        assert_eq!(err.field, "toppings");
    }

    #[test]
    fn stages_only_move_forward() {
        let order = request().into_order().unwrap();
        let order = order.advance(Stage::InFlight).unwrap();
        let order = order.advance(Stage::InFlight).unwrap();
        let order = order.advance(Stage::Delivered).unwrap();

        let err = order.clone().advance(Stage::Pending).unwrap_err();
        assert!(matches!(err, StageError::Regression { from: Stage::Delivered, to: Stage::Pending, .. }));
    }

    #[test]
    fn wire_format_uses_subject_stage_names() {
        let order = request().into_order().unwrap().advance(Stage::Delivered).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&order.to_payload().unwrap()).unwrap();
        assert_eq!(json["status"], "waiting_delivery");
        assert_eq!(json["size"], "large");
        assert_eq!(json["order_id"], order.order_id.to_string());
    }
}
