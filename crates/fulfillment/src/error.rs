//! Fulfillment error types.

use common::{OrderId, ProductId, StoreId, UserId};
use domain::{DomainError, OrderStatus};
use repository::RepositoryError;
use thiserror::Error;

/// Errors returned by fulfillment operations.
///
/// Everything except `Repository` is a synchronous, recoverable rejection
/// that leaves stored state unchanged.
#[derive(Debug, Error)]
pub enum FulfillmentError {
    /// The actor lacks the capability the operation needs.
    #[error("User {actor} is not allowed to {action}")]
    Forbidden { actor: UserId, action: &'static str },

    /// The transition table does not allow the requested move.
    #[error("Invalid transition: cannot move order from {current} to {requested}")]
    InvalidTransition {
        current: OrderStatus,
        requested: OrderStatus,
    },

    /// Not enough stock left to cover the requested quantity.
    #[error("Insufficient stock for product {product_id}: requested {requested}")]
    InsufficientStock { product_id: ProductId, requested: u32 },

    /// The user's cart has no lines for the store.
    #[error("Cart has no items for store {store_id}")]
    EmptyCart { store_id: StoreId },

    /// A cart line references a soft-deleted product.
    #[error("Product unavailable: {0}")]
    ProductUnavailable(ProductId),

    /// The store is closed or deleted.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(StoreId),

    /// Every candidate declined, timed out or was taken.
    #[error("No delivery partner available for order {0}")]
    NoPartnerAvailable(OrderId),

    /// Another dispatch holds a live lease on the same order.
    #[error("Dispatch already in progress for order {0}")]
    DispatchInProgress(OrderId),

    /// The partner still carries orders.
    #[error("Delivery partner {0} has assigned orders")]
    PartnerBusy(UserId),

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Storage error, surfaced unchanged.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Domain rule violation other than a transition.
    #[error("Domain error: {0}")]
    Domain(DomainError),
}

impl FulfillmentError {
    pub(crate) fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Forbidden { .. } => "forbidden",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::EmptyCart { .. } => "empty_cart",
            Self::ProductUnavailable(_) => "product_unavailable",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::NoPartnerAvailable(_) => "no_partner_available",
            Self::DispatchInProgress(_) => "dispatch_in_progress",
            Self::PartnerBusy(_) => "partner_busy",
            Self::NotFound { .. } => "not_found",
            Self::Repository(_) => "repository",
            Self::Domain(_) => "domain",
        }
    }
}

impl From<DomainError> for FulfillmentError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { current, requested } => {
                Self::InvalidTransition { current, requested }
            }
            other => Self::Domain(other),
        }
    }
}

/// Convenience type alias for fulfillment results.
pub type Result<T> = std::result::Result<T, FulfillmentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_transition_error_is_lifted() {
        let err: FulfillmentError = DomainError::InvalidTransition {
            current: OrderStatus::Pending,
            requested: OrderStatus::Delivered,
        }
        .into();
        assert!(matches!(
            err,
            FulfillmentError::InvalidTransition {
                current: OrderStatus::Pending,
                requested: OrderStatus::Delivered,
            }
        ));
        assert_eq!(err.kind(), "invalid_transition");
    }

    #[test]
    fn test_other_domain_errors_stay_wrapped() {
        let err: FulfillmentError = DomainError::NoItems.into();
        assert!(matches!(err, FulfillmentError::Domain(DomainError::NoItems)));
    }

    #[test]
    fn test_messages_name_the_offending_entity() {
        let product_id = ProductId::new();
        let err = FulfillmentError::InsufficientStock {
            product_id,
            requested: 3,
        };
        assert!(err.to_string().contains(&product_id.to_string()));

        let err = FulfillmentError::not_found("order", OrderId::new());
        assert!(err.to_string().starts_with("order not found"));
    }
}
