//! Stock reservations.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{ProductId, ReservationId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle of a reservation.
///
/// ```text
/// HELD ──┬──► COMMITTED
///        └──► RELEASED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    /// Stock decremented; may still be released.
    Held,
    /// Order delivered; the decrement is permanent.
    Committed,
    /// Stock given back to the product.
    Released,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Held => "HELD",
            ReservationState::Committed => "COMMITTED",
            ReservationState::Released => "RELEASED",
        }
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReservationState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HELD" => Ok(ReservationState::Held),
            "COMMITTED" => Ok(ReservationState::Committed),
            "RELEASED" => Ok(ReservationState::Released),
            other => Err(DomainError::UnrecognizedStatus {
                field: "reservation state",
                value: other.to_string(),
            }),
        }
    }
}

/// A stock decrement for one product/quantity pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    /// A freshly held reservation.
    pub fn held(product_id: ProductId, quantity: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: ReservationId::new(),
            product_id,
            quantity,
            state: ReservationState::Held,
            created_at: now,
        }
    }

    pub fn is_held(&self) -> bool {
        self.state == ReservationState::Held
    }
}
