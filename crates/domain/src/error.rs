//! Domain error types.

use thiserror::Error;

use crate::order::OrderStatus;

/// Errors raised by domain rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// The requested status is not reachable from the current one.
    #[error("Invalid transition: cannot move order from {current} to {requested}")]
    InvalidTransition {
        current: OrderStatus,
        requested: OrderStatus,
    },

    /// A free-form status string did not match the closed vocabulary.
    #[error("Unrecognized {field} value: {value:?}")]
    UnrecognizedStatus { field: &'static str, value: String },

    /// Quantities must be at least one.
    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    InvalidQuantity { quantity: u32 },

    /// A price computation does not fit in the money representation.
    #[error("Amount overflow while pricing order lines")]
    AmountOverflow,

    /// An order must contain at least one item.
    #[error("Order has no items")]
    NoItems,
}
