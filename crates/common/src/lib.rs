//! Shared types for the fulfillment engine.
//!
//! Every entity id is a distinct UUID newtype so a `StoreId` can never be
//! passed where an `OrderId` is expected. Monetary amounts are fixed-point
//! integer cents.

mod money;
mod types;

pub use money::Money;
pub use types::{DispatchId, OrderId, ProductId, ReservationId, StoreId, UserId};
