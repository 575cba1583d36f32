//! Stores.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{StoreId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::geo::GeoPoint;

/// Whether a store takes new orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreStatus {
    Open,
    Closed,
}

impl StoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreStatus::Open => "OPEN",
            StoreStatus::Closed => "CLOSED",
        }
    }
}

impl std::fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StoreStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(StoreStatus::Open),
            "CLOSED" => Ok(StoreStatus::Closed),
            other => Err(DomainError::UnrecognizedStatus {
                field: "store status",
                value: other.to_string(),
            }),
        }
    }
}

/// A store that lists products and receives orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub id: StoreId,
    pub owner_id: UserId,
    pub address: String,
    /// Geocoded position of `address`, when known.
    pub location: Option<GeoPoint>,
    pub status: StoreStatus,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Store {
    /// Creates an open store.
    pub fn new(owner_id: UserId, address: impl Into<String>) -> Self {
        Self {
            id: StoreId::new(),
            owner_id,
            address: address.into(),
            location: None,
            status: StoreStatus::Open,
            deleted_at: None,
        }
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.owner_id == user_id
    }

    /// Open and not soft-deleted.
    pub fn accepts_orders(&self) -> bool {
        self.status == StoreStatus::Open && self.deleted_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing_rejects_unknown_values() {
        assert_eq!("OPEN".parse::<StoreStatus>().unwrap(), StoreStatus::Open);
        assert_eq!("CLOSED".parse::<StoreStatus>().unwrap(), StoreStatus::Closed);
        let err = "open".parse::<StoreStatus>().unwrap_err();
        assert_eq!(
            err,
            DomainError::UnrecognizedStatus {
                field: "store status",
                value: "open".to_string(),
            }
        );
    }

    #[test]
    fn test_ownership_and_availability() {
        let owner = UserId::new();
        let mut store = Store::new(owner, "1 Main St");
        assert!(store.is_owned_by(owner));
        assert!(!store.is_owned_by(UserId::new()));
        assert!(store.accepts_orders());

        store.status = StoreStatus::Closed;
        assert!(!store.accepts_orders());

        store.status = StoreStatus::Open;
        store.deleted_at = Some(Utc::now());
        assert!(!store.accepts_orders());
    }
}
