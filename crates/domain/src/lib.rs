//! Domain layer for the fulfillment engine.
//!
//! This crate holds the platform entities and the rules that do not need
//! storage to be evaluated:
//! - closed status vocabularies (`OrderStatus`, `StoreStatus`, `PartnerStatus`, ...)
//! - the order transition table and the `StatusChange` it produces
//! - capability checks (`Store::is_owned_by`, `DeliveryProfile` presence)

pub mod cart;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod geo;
pub mod order;
pub mod product;
pub mod reservation;
pub mod store;
pub mod user;

pub use cart::CartItem;
pub use common::{DispatchId, Money, OrderId, ProductId, ReservationId, StoreId, UserId};
pub use delivery::{DeliveryProfile, PartnerStatus};
pub use dispatch::DispatchLease;
pub use error::DomainError;
pub use geo::GeoPoint;
pub use order::{Order, OrderItem, OrderStatus, StatusChange};
pub use product::Product;
pub use reservation::{Reservation, ReservationState};
pub use store::{Store, StoreStatus};
pub use user::{User, UserRole};
