//! Dispatch leases.

use chrono::{DateTime, Utc};
use common::{DispatchId, OrderId, UserId};
use serde::{Deserialize, Serialize};

/// Stored marker that an order is being dispatched.
///
/// At most one live lease exists per order, so only one engine instance
/// offers a given order at a time. `partner_id` is the partner currently
/// holding the offer. A cancel from READY_FOR_PICKUP deletes the lease in
/// the same atomic step that cancels the order, which is how the running
/// dispatch learns it was withdrawn. An instance that dies mid-dispatch
/// leaves a lease that simply expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchLease {
    pub order_id: OrderId,
    pub dispatch_id: DispatchId,
    pub partner_id: Option<UserId>,
    pub expires_at: DateTime<Utc>,
}

impl DispatchLease {
    /// A fresh lease with no offer out yet.
    pub fn new(order_id: OrderId, expires_at: DateTime<Utc>) -> Self {
        Self {
            order_id,
            dispatch_id: DispatchId::new(),
            partner_id: None,
            expires_at,
        }
    }

    /// The same dispatch, now offering to `partner_id` until `expires_at`.
    pub fn offering_to(self, partner_id: Option<UserId>, expires_at: DateTime<Utc>) -> Self {
        Self {
            partner_id,
            expires_at,
            ..self
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_lease_expires_at_its_deadline() {
        let now = Utc::now();
        let lease = DispatchLease::new(OrderId::new(), now + Duration::seconds(30));
        assert!(lease.is_live(now));
        assert!(!lease.is_live(now + Duration::seconds(30)));
    }

    #[test]
    fn test_offering_keeps_the_dispatch_identity() {
        let now = Utc::now();
        let lease = DispatchLease::new(OrderId::new(), now);
        let partner = UserId::new();
        let renewed = lease.offering_to(Some(partner), now + Duration::seconds(60));
        assert_eq!(renewed.dispatch_id, lease.dispatch_id);
        assert_eq!(renewed.order_id, lease.order_id);
        assert_eq!(renewed.partner_id, Some(partner));
        assert!(renewed.is_live(now));
    }
}
