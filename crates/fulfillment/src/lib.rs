//! Order fulfillment and delivery dispatch engine.
//!
//! Drives an order from cart checkout through acceptance, preparation and
//! pickup to delivery or cancellation, keeping stock and prices consistent
//! under concurrent access:
//!
//! 1. [`CartSnapshotter`] freezes the user's cart lines for one store
//! 2. [`InventoryReservations`] reserves stock with atomic decrements
//! 3. [`OrderStateMachine`] persists the PENDING order and every later move
//! 4. [`Dispatcher`] offers READY_FOR_PICKUP orders to nearby partners
//!
//! [`FulfillmentOrchestrator`] ties the steps together and exposes the
//! public operations. Storage, notifications, partner offers and time are
//! injected through [`repository::Repository`], [`Notifier`],
//! [`PartnerGateway`] and [`Clock`].

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod inventory;
pub mod notifier;
pub mod orchestrator;
pub mod snapshot;
pub mod state_machine;
pub mod sweep;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FulfillmentConfig, LogFormat};
pub use dispatch::{
    DispatchOutcome, Dispatcher, GatewayError, OfferOutcome, OfferResponse, PartnerGateway,
    ScriptedPartnerGateway, ScriptedReply,
};
pub use error::{FulfillmentError, Result};
pub use inventory::{InventoryReservations, ReservationToken};
pub use notifier::{FulfillmentEvent, InMemoryNotifier, NoopNotifier, Notifier, NotifyError};
pub use orchestrator::FulfillmentOrchestrator;
pub use snapshot::{CartSnapshot, CartSnapshotter, OrderItemDraft};
pub use state_machine::OrderStateMachine;
pub use sweep::{ReofferSweep, SweepReport};
pub use telemetry::{init_tracing, install_metrics_recorder};
