use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{DispatchId, OrderId, ProductId, ReservationId, StoreId, UserId};
use domain::{
    CartItem, DeliveryProfile, DispatchLease, GeoPoint, Order, OrderStatus, PartnerStatus,
    Product, Reservation, ReservationState, StatusChange, Store, User,
};
use tokio::sync::RwLock;

use crate::store::{ClaimOutcome, Repository, ensure_plain_transition};
use crate::{RepositoryError, Result};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    stores: HashMap<StoreId, Store>,
    products: HashMap<ProductId, Product>,
    carts: BTreeMap<(UserId, ProductId), CartItem>,
    reservations: HashMap<ReservationId, Reservation>,
    orders: HashMap<OrderId, Order>,
    partners: HashMap<UserId, DeliveryProfile>,
    leases: HashMap<OrderId, DispatchLease>,
    fail_on_insert_order: bool,
    fail_on_release: bool,
}

impl Tables {
    fn set_reservation_state(
        &mut self,
        id: ReservationId,
        state: ReservationState,
    ) -> Option<Reservation> {
        let reservation = self.reservations.get_mut(&id)?;
        if !reservation.is_held() {
            return None;
        }
        reservation.state = state;
        Some(reservation.clone())
    }

    fn add_stock(&mut self, product_id: ProductId, quantity: u32) -> Result<()> {
        if let Some(product) = self.products.get_mut(&product_id) {
            product.stock =
                product
                    .stock
                    .checked_add(quantity)
                    .ok_or(RepositoryError::OutOfRange {
                        field: "stock",
                        value: i64::from(product.stock) + i64::from(quantity),
                    })?;
        }
        Ok(())
    }
}

/// In-memory repository for testing and single-process use.
///
/// Every table lives behind one lock, so each trait method is atomic with
/// respect to all others, which is exactly what the conditional updates
/// require.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryRepository {
    /// Creates a new empty in-memory repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stock of a product.
    pub async fn stock_of(&self, product_id: ProductId) -> Option<u32> {
        self.tables
            .read()
            .await
            .products
            .get(&product_id)
            .map(|p| p.stock)
    }

    /// Number of reservations currently in `state`.
    pub async fn reservation_count(&self, state: ReservationState) -> usize {
        self.tables
            .read()
            .await
            .reservations
            .values()
            .filter(|r| r.state == state)
            .count()
    }

    /// Total number of orders stored.
    pub async fn order_count(&self) -> usize {
        self.tables.read().await.orders.len()
    }

    /// Configures the repository to fail the next order inserts.
    pub async fn set_fail_on_insert_order(&self, fail: bool) {
        self.tables.write().await.fail_on_insert_order = fail;
    }

    /// Configures the repository to fail reservation releases.
    pub async fn set_fail_on_release(&self, fail: bool) {
        self.tables.write().await.fail_on_release = fail;
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn save_user(&self, user: &User) -> Result<()> {
        self.tables.write().await.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn save_store(&self, store: &Store) -> Result<()> {
        self.tables
            .write()
            .await
            .stores
            .insert(store.id, store.clone());
        Ok(())
    }

    async fn get_store(&self, id: StoreId) -> Result<Option<Store>> {
        Ok(self.tables.read().await.stores.get(&id).cloned())
    }

    async fn save_product(&self, product: &Product) -> Result<()> {
        self.tables
            .write()
            .await
            .products
            .insert(product.id, product.clone());
        Ok(())
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        Ok(self.tables.read().await.products.get(&id).cloned())
    }

    async fn save_cart_item(&self, item: &CartItem) -> Result<()> {
        self.tables
            .write()
            .await
            .carts
            .insert((item.user_id, item.product_id), item.clone());
        Ok(())
    }

    async fn cart_items(&self, user_id: UserId) -> Result<Vec<CartItem>> {
        let tables = self.tables.read().await;
        Ok(tables
            .carts
            .range((user_id, ProductId::from_uuid(uuid::Uuid::nil()))..)
            .take_while(|((owner, _), _)| *owner == user_id)
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn remove_cart_items(&self, user_id: UserId, product_ids: &[ProductId]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for product_id in product_ids {
            tables.carts.remove(&(user_id, *product_id));
        }
        Ok(())
    }

    async fn decrement_stock_if_available(
        &self,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.products.get_mut(&product_id) {
            Some(product) if product.stock >= quantity => {
                product.stock -= quantity;
                Ok(true)
            }
            _ => {
                metrics::counter!("stock_decrement_rejected_total").increment(1);
                Ok(false)
            }
        }
    }

    async fn reserve_stock(&self, reservation: &Reservation) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.products.get_mut(&reservation.product_id) {
            Some(product) if product.stock >= reservation.quantity => {
                product.stock -= reservation.quantity;
            }
            _ => {
                metrics::counter!("stock_decrement_rejected_total").increment(1);
                return Ok(false);
            }
        }
        tables
            .reservations
            .insert(reservation.id, reservation.clone());
        Ok(true)
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        Ok(self.tables.read().await.reservations.get(&id).cloned())
    }

    async fn release_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        let mut tables = self.tables.write().await;
        if tables.fail_on_release {
            return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        }
        let held = match tables.reservations.get(&id) {
            Some(reservation) if reservation.is_held() => reservation.clone(),
            _ => return Ok(None),
        };
        tables.add_stock(held.product_id, held.quantity)?;
        Ok(tables.set_reservation_state(id, ReservationState::Released))
    }

    async fn commit_reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        let mut tables = self.tables.write().await;
        Ok(tables.set_reservation_state(id, ReservationState::Committed))
    }

    async fn stranded_reservations(&self) -> Result<Vec<(ReservationId, OrderStatus)>> {
        let tables = self.tables.read().await;
        let mut stranded = Vec::new();
        for order in tables.orders.values().filter(|order| order.is_terminal()) {
            for id in order.reservation_ids() {
                if tables.reservations.get(&id).is_some_and(|r| r.is_held()) {
                    stranded.push((id, order.status));
                }
            }
        }
        Ok(stranded)
    }

    async fn insert_order(&self, order: &Order) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.fail_on_insert_order {
            return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        }
        tables.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.tables.read().await.orders.get(&id).cloned())
    }

    async fn orders_awaiting_courier(&self) -> Result<Vec<Order>> {
        let tables = self.tables.read().await;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|order| order.is_awaiting_courier())
            .cloned()
            .collect();
        orders.sort_by_key(|order| (order.created_at, order.id));
        Ok(orders)
    }

    async fn transition_order(&self, change: &StatusChange) -> Result<Option<Order>> {
        ensure_plain_transition(change)?;

        let mut tables = self.tables.write().await;
        match tables.orders.get_mut(&change.order_id) {
            Some(order) if order.status == change.from => {
                change.apply_to(order);
                Ok(Some(order.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn acquire_dispatch_lease(
        &self,
        lease: &DispatchLease,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables
            .leases
            .get(&lease.order_id)
            .is_some_and(|held| held.is_live(now))
        {
            return Ok(false);
        }
        tables.leases.insert(lease.order_id, *lease);
        Ok(true)
    }

    async fn renew_dispatch_lease(&self, lease: &DispatchLease) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.leases.get_mut(&lease.order_id) {
            Some(held) if held.dispatch_id == lease.dispatch_id => {
                *held = *lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_dispatch_lease(&self, order_id: OrderId) -> Result<Option<DispatchLease>> {
        Ok(self.tables.read().await.leases.get(&order_id).copied())
    }

    async fn release_dispatch_lease(
        &self,
        order_id: OrderId,
        dispatch_id: DispatchId,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.leases.get(&order_id) {
            Some(held) if held.dispatch_id == dispatch_id => {
                tables.leases.remove(&order_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn withdraw_dispatch(
        &self,
        change: &StatusChange,
    ) -> Result<Option<(Order, DispatchLease)>> {
        if (change.from, change.to) != (OrderStatus::ReadyForPickup, OrderStatus::Cancelled) {
            return Err(RepositoryError::UnsupportedTransition(change.to));
        }

        let mut tables = self.tables.write().await;
        let lease = match tables.leases.get(&change.order_id) {
            Some(lease) if lease.is_live(change.at) => *lease,
            _ => return Ok(None),
        };
        let order = match tables.orders.get_mut(&change.order_id) {
            Some(order) if order.is_awaiting_courier() => {
                change.apply_to(order);
                order.clone()
            }
            _ => return Ok(None),
        };
        tables.leases.remove(&change.order_id);
        Ok(Some((order, lease)))
    }

    async fn save_delivery_profile(&self, profile: &DeliveryProfile) -> Result<()> {
        self.tables
            .write()
            .await
            .partners
            .insert(profile.user_id, profile.clone());
        Ok(())
    }

    async fn get_delivery_profile(&self, user_id: UserId) -> Result<Option<DeliveryProfile>> {
        Ok(self.tables.read().await.partners.get(&user_id).cloned())
    }

    async fn available_partners(&self) -> Result<Vec<DeliveryProfile>> {
        let tables = self.tables.read().await;
        Ok(tables
            .partners
            .values()
            .filter(|p| p.is_available())
            .cloned()
            .collect())
    }

    async fn set_idle_partner_status(
        &self,
        user_id: UserId,
        status: PartnerStatus,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.partners.get_mut(&user_id) {
            Some(profile) if profile.assigned_orders.is_empty() => {
                profile.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_partner_location(&self, user_id: UserId, location: GeoPoint) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.partners.get_mut(&user_id) {
            Some(profile) => {
                profile.location = Some(location);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn claim_partner_if_available(&self, change: &StatusChange) -> Result<ClaimOutcome> {
        let Some(partner_id) = change.delivery_partner_id else {
            return Err(RepositoryError::UnsupportedTransition(change.to));
        };

        let mut tables = self.tables.write().await;
        let status = tables
            .orders
            .get(&change.order_id)
            .map(|order| order.status)
            .ok_or(RepositoryError::OrderNotFound(change.order_id))?;
        if status != OrderStatus::ReadyForPickup {
            return Ok(ClaimOutcome::OrderNotReady(status));
        }

        match tables.partners.get_mut(&partner_id) {
            Some(profile) if profile.is_available() => {
                profile.status = PartnerStatus::Busy;
                profile.assigned_orders.insert(change.order_id);
            }
            _ => return Ok(ClaimOutcome::PartnerUnavailable),
        }

        let order = tables
            .orders
            .get_mut(&change.order_id)
            .ok_or(RepositoryError::OrderNotFound(change.order_id))?;
        change.apply_to(order);
        Ok(ClaimOutcome::Claimed(order.clone()))
    }

    async fn finish_delivery(
        &self,
        change: &StatusChange,
        partner_id: UserId,
    ) -> Result<Option<Order>> {
        let mut tables = self.tables.write().await;
        let order = match tables.orders.get_mut(&change.order_id) {
            Some(order)
                if order.status == change.from
                    && order.status == OrderStatus::OutForDelivery
                    && order.delivery_partner_id == Some(partner_id) =>
            {
                change.apply_to(order);
                order.clone()
            }
            _ => return Ok(None),
        };

        if let Some(profile) = tables.partners.get_mut(&partner_id) {
            profile.assigned_orders.remove(&change.order_id);
            if profile.assigned_orders.is_empty() && profile.status == PartnerStatus::Busy {
                profile.status = PartnerStatus::Available;
            }
        }
        Ok(Some(order))
    }
}
