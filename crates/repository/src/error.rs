use common::OrderId;
use domain::{DomainError, OrderStatus};
use thiserror::Error;

/// Errors that can occur when interacting with the repository.
///
/// Transient storage failures are surfaced unchanged; the repository never
/// retries on its own.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// An order referenced by an atomic operation does not exist.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// The requested move must go through a dedicated atomic operation.
    #[error("Transition to {0} is not supported by transition_order")]
    UnsupportedTransition(OrderStatus),

    /// A stored value no longer fits the engine's closed vocabulary.
    #[error("Invalid stored value: {0}")]
    InvalidData(#[from] DomainError),

    /// A stored number does not fit the engine's type.
    #[error("Stored {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;
