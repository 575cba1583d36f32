//! Delivery partner profiles.

use std::collections::BTreeSet;
use std::str::FromStr;

use common::{OrderId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::geo::GeoPoint;

/// Availability of a delivery partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartnerStatus {
    /// Online and free to receive offers.
    Available,
    /// Carrying at least one order.
    Busy,
    Offline,
}

impl PartnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartnerStatus::Available => "AVAILABLE",
            PartnerStatus::Busy => "BUSY",
            PartnerStatus::Offline => "OFFLINE",
        }
    }
}

impl std::fmt::Display for PartnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PartnerStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(PartnerStatus::Available),
            "BUSY" => Ok(PartnerStatus::Busy),
            "OFFLINE" => Ok(PartnerStatus::Offline),
            other => Err(DomainError::UnrecognizedStatus {
                field: "partner status",
                value: other.to_string(),
            }),
        }
    }
}

/// The delivery profile of a partner, keyed by the partner's user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryProfile {
    pub user_id: UserId,
    pub location: Option<GeoPoint>,
    pub status: PartnerStatus,
    /// Orders currently out for delivery with this partner.
    pub assigned_orders: BTreeSet<OrderId>,
}

impl DeliveryProfile {
    /// Creates an available profile with no orders.
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            location: None,
            status: PartnerStatus::Available,
            assigned_orders: BTreeSet::new(),
        }
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_status(mut self, status: PartnerStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_available(&self) -> bool {
        self.status == PartnerStatus::Available
    }

    pub fn is_carrying(&self, order_id: OrderId) -> bool {
        self.assigned_orders.contains(&order_id)
    }

    /// Distance to `point`, or `None` when either side has no position.
    pub fn distance_km(&self, point: Option<&GeoPoint>) -> Option<f64> {
        match (self.location.as_ref(), point) {
            (Some(here), Some(there)) => Some(here.distance_km(there)),
            _ => None,
        }
    }
}
