use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DispatchId, OrderId, ProductId, ReservationId, StoreId, UserId};
use domain::{
    CartItem, DeliveryProfile, DispatchLease, GeoPoint, Order, OrderStatus, PartnerStatus,
    Product, Reservation, StatusChange, Store, User,
};

use crate::Result;

/// Result of [`Repository::claim_partner_if_available`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Partner flipped to BUSY and the order moved to OUT_FOR_DELIVERY.
    Claimed(Order),
    /// The partner was no longer AVAILABLE; nothing changed.
    PartnerUnavailable,
    /// The order had left READY_FOR_PICKUP (e.g. it was cancelled); nothing changed.
    OrderNotReady(OrderStatus),
}

/// Storage contract consumed by the fulfillment engine.
///
/// All implementations must be thread-safe (Send + Sync). Operations
/// documented as atomic must hold across concurrent callers and across
/// engine instances sharing the same storage.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn save_user(&self, user: &User) -> Result<()>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>>;

    async fn save_store(&self, store: &Store) -> Result<()>;

    async fn get_store(&self, id: StoreId) -> Result<Option<Store>>;

    /// Inserts or replaces a product, including its stock level.
    async fn save_product(&self, product: &Product) -> Result<()>;

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>>;

    /// Inserts or replaces the (user, product) cart line.
    async fn save_cart_item(&self, item: &CartItem) -> Result<()>;

    /// All cart lines of a user, ordered by product id.
    async fn cart_items(&self, user_id: UserId) -> Result<Vec<CartItem>>;

    async fn remove_cart_items(&self, user_id: UserId, product_ids: &[ProductId]) -> Result<()>;

    /// Atomically decrements stock by `quantity` if at least that much is left.
    ///
    /// Returns `false` (and changes nothing) when stock is insufficient or the
    /// product is unknown. [`Repository::reserve_stock`] performs the same
    /// guarded decrement together with the reservation write.
    async fn decrement_stock_if_available(&self, product_id: ProductId, quantity: u32)
    -> Result<bool>;

    /// Reserves stock for one order line as a single atomic unit.
    ///
    /// Decrements the product's stock by `reservation.quantity` if at least
    /// that much is left and records the HELD reservation. Returns `false`
    /// (and writes nothing) when stock is insufficient or the product is
    /// unknown.
    async fn reserve_stock(&self, reservation: &Reservation) -> Result<bool>;

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>>;

    /// Atomically moves a HELD reservation to RELEASED and restores its stock.
    ///
    /// Returns `None` if the reservation is unknown or no longer held.
    async fn release_reservation(&self, id: ReservationId) -> Result<Option<Reservation>>;

    /// Atomically moves a HELD reservation to COMMITTED.
    ///
    /// Returns `None` if the reservation is unknown or no longer held.
    async fn commit_reservation(&self, id: ReservationId) -> Result<Option<Reservation>>;

    /// HELD reservations backing lines of orders that already reached a
    /// terminal status, paired with that status.
    ///
    /// These are left behind when a cancel or delivery could not finish
    /// releasing or committing its stock.
    async fn stranded_reservations(&self) -> Result<Vec<(ReservationId, OrderStatus)>>;

    async fn insert_order(&self, order: &Order) -> Result<()>;

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>>;

    /// Orders in READY_FOR_PICKUP with no partner, oldest first.
    async fn orders_awaiting_courier(&self) -> Result<Vec<Order>>;

    /// Compare-and-set on order status.
    ///
    /// Applies `change` only if the stored status still equals `change.from`
    /// and returns the updated order; returns `None` otherwise. Moves into
    /// OUT_FOR_DELIVERY or DELIVERED are rejected with
    /// [`RepositoryError::UnsupportedTransition`](crate::RepositoryError::UnsupportedTransition):
    /// they touch partner state and have their own atomic operations. So is
    /// READY_FOR_PICKUP → CANCELLED, which goes through
    /// [`Repository::withdraw_dispatch`].
    async fn transition_order(&self, change: &StatusChange) -> Result<Option<Order>>;

    /// Starts a dispatch by storing `lease`.
    ///
    /// Returns `false` (and changes nothing) if the order already has a lease
    /// that is live at `now`. An expired lease is replaced.
    async fn acquire_dispatch_lease(&self, lease: &DispatchLease, now: DateTime<Utc>)
    -> Result<bool>;

    /// Overwrites partner and expiry of the stored lease with the same
    /// dispatch id.
    ///
    /// Returns `false` if the lease is gone (withdrawn or released) or now
    /// belongs to another dispatch.
    async fn renew_dispatch_lease(&self, lease: &DispatchLease) -> Result<bool>;

    async fn get_dispatch_lease(&self, order_id: OrderId) -> Result<Option<DispatchLease>>;

    /// Deletes the order's lease if it still belongs to `dispatch_id`.
    async fn release_dispatch_lease(&self, order_id: OrderId, dispatch_id: DispatchId)
    -> Result<bool>;

    /// Atomically cancels an order whose dispatch is still running.
    ///
    /// `change` must be the READY_FOR_PICKUP → CANCELLED change. In one unit:
    /// the order must still be READY_FOR_PICKUP with no partner, a lease
    /// live at `change.at` must exist, the order is cancelled and the lease
    /// deleted. Returns the cancelled order and the removed lease, or `None`
    /// with nothing written.
    async fn withdraw_dispatch(&self, change: &StatusChange)
    -> Result<Option<(Order, DispatchLease)>>;

    async fn save_delivery_profile(&self, profile: &DeliveryProfile) -> Result<()>;

    async fn get_delivery_profile(&self, user_id: UserId) -> Result<Option<DeliveryProfile>>;

    /// Profiles whose status is AVAILABLE.
    async fn available_partners(&self) -> Result<Vec<DeliveryProfile>>;

    /// Sets a partner's status only while they carry no orders.
    ///
    /// Returns `false` if the partner is unknown or has assigned orders.
    async fn set_idle_partner_status(&self, user_id: UserId, status: PartnerStatus)
    -> Result<bool>;

    /// Returns `false` if the partner is unknown.
    async fn update_partner_location(&self, user_id: UserId, location: GeoPoint) -> Result<bool>;

    /// Atomically claims a partner for an order.
    ///
    /// `change` must be a READY_FOR_PICKUP → OUT_FOR_DELIVERY change carrying
    /// the partner id. In one unit: the order must still be READY_FOR_PICKUP,
    /// the partner must be AVAILABLE, the partner flips to BUSY, the order
    /// gets the partner and the new status, and the order joins the
    /// partner's assigned orders. If any check fails nothing is written.
    async fn claim_partner_if_available(&self, change: &StatusChange) -> Result<ClaimOutcome>;

    /// Atomically completes a delivery.
    ///
    /// Applies the OUT_FOR_DELIVERY → DELIVERED `change` only if the order is
    /// still out for delivery with `partner_id`, removes it from the
    /// partner's assigned orders and makes the partner AVAILABLE again when
    /// nothing else is assigned. Returns `None` if the order did not match.
    async fn finish_delivery(
        &self,
        change: &StatusChange,
        partner_id: UserId,
    ) -> Result<Option<Order>>;
}

/// Sanity check shared by adapters for [`Repository::transition_order`].
pub(crate) fn ensure_plain_transition(change: &StatusChange) -> Result<()> {
    match (change.from, change.to) {
        (_, OrderStatus::OutForDelivery | OrderStatus::Delivered)
        | (OrderStatus::ReadyForPickup, OrderStatus::Cancelled) => Err(
            crate::RepositoryError::UnsupportedTransition(change.to),
        ),
        _ => Ok(()),
    }
}
