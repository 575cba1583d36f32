//! Storage collaborator for the fulfillment engine.
//!
//! The engine never touches a database directly. It talks to a
//! [`Repository`], which offers plain reads/writes plus the handful of
//! atomic conditional updates the engine's correctness depends on:
//!
//! - [`Repository::decrement_stock_if_available`] (`stock = stock - n WHERE stock >= n`)
//! - [`Repository::reserve_stock`] (the guarded decrement plus the reservation row)
//! - [`Repository::claim_partner_if_available`] (partner flip + order transition as one unit)
//! - [`Repository::transition_order`] (compare-and-set on order status)
//! - [`Repository::release_reservation`] / [`Repository::commit_reservation`]
//! - [`Repository::finish_delivery`]
//! - [`Repository::acquire_dispatch_lease`] / [`Repository::withdraw_dispatch`]
//!
//! Two adapters ship with the crate: [`InMemoryRepository`] for tests and
//! single-process use, and [`PostgresRepository`] backed by sqlx.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{RepositoryError, Result};
pub use memory::InMemoryRepository;
pub use postgres::PostgresRepository;
pub use store::{ClaimOutcome, Repository};
