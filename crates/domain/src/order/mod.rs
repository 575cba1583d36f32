//! Order entity and its transition rules.

mod model;
mod status;

pub use model::{Order, OrderItem, StatusChange};
pub use status::OrderStatus;
