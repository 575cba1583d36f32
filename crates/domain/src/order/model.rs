//! Order entity.

use chrono::{DateTime, Utc};
use common::{Money, OrderId, ProductId, ReservationId, StoreId, UserId};
use serde::{Deserialize, Serialize};

use super::OrderStatus;
use crate::error::DomainError;

/// A line of an order.
///
/// `unit_price` is the product price frozen at checkout; later price changes
/// on the product never reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Money,
    /// Reservation holding the stock for this line.
    pub reservation_id: ReservationId,
}

impl OrderItem {
    /// Returns the total price for this line (quantity * unit_price).
    pub fn line_total(&self) -> Result<Money, DomainError> {
        self.unit_price
            .checked_multiply(self.quantity)
            .ok_or(DomainError::AmountOverflow)
    }
}

/// An order placed by a user at a single store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub store_id: StoreId,
    pub delivery_partner_id: Option<UserId>,
    pub items: Vec<OrderItem>,
    /// Sum of line totals at creation. Never recomputed.
    pub total_price: Money,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// A single status move computed from the transition table.
///
/// Repositories apply it as a compare-and-set: the write only happens if the
/// stored status still equals `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub order_id: OrderId,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub at: DateTime<Utc>,
    /// Set only when moving to `OUT_FOR_DELIVERY`.
    pub delivery_partner_id: Option<UserId>,
}

impl StatusChange {
    /// Applies the change to an in-memory copy of the order.
    pub fn apply_to(&self, order: &mut Order) {
        order.status = self.to;
        match self.to {
            OrderStatus::Accepted => order.accepted_at = Some(self.at),
            OrderStatus::OutForDelivery => order.delivery_partner_id = self.delivery_partner_id,
            OrderStatus::Delivered => order.delivered_at = Some(self.at),
            OrderStatus::Cancelled => order.cancelled_at = Some(self.at),
            _ => {}
        }
    }
}

impl Order {
    /// Creates a `PENDING` order from reserved lines.
    pub fn place(
        user_id: UserId,
        store_id: StoreId,
        items: Vec<OrderItem>,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if items.is_empty() {
            return Err(DomainError::NoItems);
        }
        if let Some(item) = items.iter().find(|item| item.quantity == 0) {
            return Err(DomainError::InvalidQuantity {
                quantity: item.quantity,
            });
        }

        let line_totals = items
            .iter()
            .map(OrderItem::line_total)
            .collect::<Result<Vec<_>, _>>()?;
        let total_price = Money::checked_sum(line_totals).ok_or(DomainError::AmountOverflow)?;
        Ok(Self {
            id: OrderId::new(),
            user_id,
            store_id,
            delivery_partner_id: None,
            items,
            total_price,
            status: OrderStatus::Pending,
            created_at: now,
            accepted_at: None,
            delivered_at: None,
            cancelled_at: None,
        })
    }

    /// Returns true if the order is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Ready for pickup with nobody assigned yet.
    pub fn is_awaiting_courier(&self) -> bool {
        self.status == OrderStatus::ReadyForPickup && self.delivery_partner_id.is_none()
    }

    /// Total number of units across all lines.
    pub fn total_quantity(&self) -> u32 {
        self.items
            .iter()
            .fold(0u32, |acc, item| acc.saturating_add(item.quantity))
    }

    /// Reservations backing this order's lines.
    pub fn reservation_ids(&self) -> impl Iterator<Item = ReservationId> + '_ {
        self.items.iter().map(|item| item.reservation_id)
    }

    fn transition(
        &self,
        to: OrderStatus,
        at: DateTime<Utc>,
        delivery_partner_id: Option<UserId>,
    ) -> Result<StatusChange, DomainError> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::InvalidTransition {
                current: self.status,
                requested: to,
            });
        }
        Ok(StatusChange {
            order_id: self.id,
            from: self.status,
            to,
            at,
            delivery_partner_id,
        })
    }

    /// `PENDING → ACCEPTED`.
    pub fn accept(&self, at: DateTime<Utc>) -> Result<StatusChange, DomainError> {
        self.transition(OrderStatus::Accepted, at, None)
    }

    /// `ACCEPTED → PROCESSING`.
    pub fn start_preparing(&self, at: DateTime<Utc>) -> Result<StatusChange, DomainError> {
        self.transition(OrderStatus::Processing, at, None)
    }

    /// `PROCESSING → READY_FOR_PICKUP`.
    pub fn mark_ready(&self, at: DateTime<Utc>) -> Result<StatusChange, DomainError> {
        self.transition(OrderStatus::ReadyForPickup, at, None)
    }

    /// `READY_FOR_PICKUP → OUT_FOR_DELIVERY` with `partner` assigned.
    pub fn assign_partner(
        &self,
        partner: UserId,
        at: DateTime<Utc>,
    ) -> Result<StatusChange, DomainError> {
        self.transition(OrderStatus::OutForDelivery, at, Some(partner))
    }

    /// `OUT_FOR_DELIVERY → DELIVERED`.
    pub fn mark_delivered(&self, at: DateTime<Utc>) -> Result<StatusChange, DomainError> {
        self.transition(OrderStatus::Delivered, at, None)
    }

    /// `PENDING | ACCEPTED | PROCESSING → CANCELLED`.
    pub fn cancel(&self, at: DateTime<Utc>) -> Result<StatusChange, DomainError> {
        self.transition(OrderStatus::Cancelled, at, None)
    }

    /// `READY_FOR_PICKUP → CANCELLED` while a dispatch offer is being withdrawn.
    ///
    /// Only valid before any partner has been assigned. Repositories apply it
    /// only together with removing a live dispatch lease.
    pub fn withdraw_from_dispatch(&self, at: DateTime<Utc>) -> Result<StatusChange, DomainError> {
        if !self.is_awaiting_courier() {
            return Err(DomainError::InvalidTransition {
                current: self.status,
                requested: OrderStatus::Cancelled,
            });
        }
        Ok(StatusChange {
            order_id: self.id,
            from: OrderStatus::ReadyForPickup,
            to: OrderStatus::Cancelled,
            at,
            delivery_partner_id: None,
        })
    }
}
