//! Order state machine: persisted transitions and their side effects.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{OrderId, UserId};
use domain::{DispatchLease, DomainError, Order, OrderItem, OrderStatus, StatusChange};
use repository::{ClaimOutcome, Repository};

use crate::error::{FulfillmentError, Result};
use crate::inventory::{InventoryReservations, ReservationToken};
use crate::snapshot::CartSnapshot;

/// Applies transitions as compare-and-set on the stored status.
///
/// The stored order is re-read for every transition. A lost race surfaces as
/// `InvalidTransition` against the status that won; nothing is retried.
/// Moves into CANCELLED or DELIVERED leave the order's reservations HELD;
/// callers settle them with [`release_items`](Self::release_items) or
/// [`commit_items`](Self::commit_items).
pub struct OrderStateMachine<R> {
    repository: Arc<R>,
    inventory: InventoryReservations<R>,
}

impl<R: Repository> OrderStateMachine<R> {
    pub fn new(repository: Arc<R>, inventory: InventoryReservations<R>) -> Self {
        Self {
            repository,
            inventory,
        }
    }

    /// Loads the current stored order.
    pub async fn load(&self, order_id: OrderId) -> Result<Order> {
        self.repository
            .get_order(order_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found("order", order_id))
    }

    /// Persists a new PENDING order backed by `tokens`.
    ///
    /// `tokens` must line up with `snapshot.items`.
    pub async fn create(
        &self,
        snapshot: &CartSnapshot,
        tokens: &[ReservationToken],
        now: DateTime<Utc>,
    ) -> Result<Order> {
        let items = snapshot
            .items
            .iter()
            .zip(tokens)
            .map(|(draft, token)| OrderItem {
                product_id: draft.product_id,
                product_name: draft.product_name.clone(),
                quantity: draft.quantity,
                unit_price: draft.unit_price,
                reservation_id: token.reservation_id,
            })
            .collect();

        let order = Order::place(snapshot.user_id, snapshot.store_id, items, now)?;
        self.repository.insert_order(&order).await?;
        tracing::info!(
            order_id = %order.id,
            status = %order.status,
            total = %order.total_price,
            "order created"
        );
        Ok(order)
    }

    async fn apply(
        &self,
        order_id: OrderId,
        step: impl FnOnce(&Order) -> std::result::Result<StatusChange, DomainError>,
    ) -> Result<Order> {
        let current = self.load(order_id).await?;
        let change = step(&current)?;

        match self.repository.transition_order(&change).await? {
            Some(order) => {
                tracing::info!(%order_id, from = %change.from, to = %change.to, "order transitioned");
                Ok(order)
            }
            None => Err(self.lost_race(order_id, change.to).await),
        }
    }

    async fn lost_race(&self, order_id: OrderId, requested: OrderStatus) -> FulfillmentError {
        match self.load(order_id).await {
            Ok(order) => FulfillmentError::InvalidTransition {
                current: order.status,
                requested,
            },
            Err(e) => e,
        }
    }

    /// `PENDING → ACCEPTED`.
    pub async fn accept(&self, order_id: OrderId, now: DateTime<Utc>) -> Result<Order> {
        self.apply(order_id, |order| order.accept(now)).await
    }

    /// `ACCEPTED → PROCESSING`.
    pub async fn start_preparing(&self, order_id: OrderId, now: DateTime<Utc>) -> Result<Order> {
        self.apply(order_id, |order| order.start_preparing(now)).await
    }

    /// `PROCESSING → READY_FOR_PICKUP`.
    pub async fn mark_ready(&self, order_id: OrderId, now: DateTime<Utc>) -> Result<Order> {
        self.apply(order_id, |order| order.mark_ready(now)).await
    }

    /// `PENDING | ACCEPTED | PROCESSING → CANCELLED`.
    pub async fn cancel(&self, order_id: OrderId, now: DateTime<Utc>) -> Result<Order> {
        self.apply(order_id, |order| order.cancel(now)).await
    }

    /// `READY_FOR_PICKUP → CANCELLED` while a dispatch is running.
    ///
    /// Succeeds only if a live dispatch lease exists; it is removed in the
    /// same step and returned so the partner holding the offer can be told.
    pub async fn withdraw(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<(Order, DispatchLease)> {
        let current = self.load(order_id).await?;
        let change = current.withdraw_from_dispatch(now)?;

        match self.repository.withdraw_dispatch(&change).await? {
            Some((order, lease)) => {
                tracing::info!(%order_id, from = %change.from, to = %change.to, "order transitioned");
                Ok((order, lease))
            }
            None => Err(self.lost_race(order_id, change.to).await),
        }
    }

    /// `READY_FOR_PICKUP → OUT_FOR_DELIVERY` through the atomic partner claim.
    pub async fn assign(
        &self,
        order: &Order,
        partner_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let change = order.assign_partner(partner_id, now)?;
        let outcome = self.repository.claim_partner_if_available(&change).await?;
        if let ClaimOutcome::Claimed(_) = &outcome {
            tracing::info!(
                order_id = %order.id,
                %partner_id,
                from = %change.from,
                to = %change.to,
                "order transitioned"
            );
        }
        Ok(outcome)
    }

    /// `OUT_FOR_DELIVERY → DELIVERED`, freeing the partner.
    pub async fn deliver(
        &self,
        order_id: OrderId,
        partner_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Order> {
        let current = self.load(order_id).await?;
        let change = current.mark_delivered(now)?;

        let Some(order) = self.repository.finish_delivery(&change, partner_id).await? else {
            return Err(self.lost_race(order_id, change.to).await);
        };
        tracing::info!(%order_id, from = %change.from, to = %change.to, "order transitioned");
        Ok(order)
    }

    /// Gives every line's stock back. Lines already settled are skipped.
    pub async fn release_items(&self, order: &Order) -> Result<()> {
        let tokens: Vec<_> = order.items.iter().map(ReservationToken::for_item).collect();
        self.inventory.release_all(&tokens).await
    }

    /// Makes every line's decrement permanent.
    pub async fn commit_items(&self, order: &Order) -> Result<()> {
        let tokens: Vec<_> = order.items.iter().map(ReservationToken::for_item).collect();
        self.inventory.commit_all(&tokens).await
    }
}

#[cfg(test)]
mod tests {
    use common::{Money, StoreId};
    use domain::{DeliveryProfile, PartnerStatus, Product, ReservationState};
    use repository::InMemoryRepository;

    use super::*;
    use crate::snapshot::OrderItemDraft;

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        machine: OrderStateMachine<InMemoryRepository>,
        inventory: InventoryReservations<InMemoryRepository>,
        product: Product,
    }

    impl Fixture {
        async fn new() -> Self {
            let repo = Arc::new(InMemoryRepository::new());
            let inventory = InventoryReservations::new(repo.clone());
            let product = Product::new(StoreId::new(), "Tea", "drinks", Money::from_cents(300), 4);
            repo.save_product(&product).await.unwrap();
            Self {
                machine: OrderStateMachine::new(repo.clone(), inventory.clone()),
                inventory,
                repo,
                product,
            }
        }

        async fn pending_order(&self, quantity: u32) -> Order {
            let now = Utc::now();
            let snapshot = CartSnapshot {
                user_id: UserId::new(),
                store_id: self.product.store_id,
                items: vec![OrderItemDraft {
                    product_id: self.product.id,
                    product_name: self.product.name.clone(),
                    quantity,
                    unit_price: self.product.price,
                }],
                total: self.product.price.checked_multiply(quantity).unwrap(),
            };
            let tokens = self.inventory.reserve_all(&snapshot.items, now).await.unwrap();
            self.machine.create(&snapshot, &tokens, now).await.unwrap()
        }

        async fn ready_order(&self) -> Order {
            let order = self.pending_order(1).await;
            let now = Utc::now();
            self.machine.accept(order.id, now).await.unwrap();
            self.machine.start_preparing(order.id, now).await.unwrap();
            self.machine.mark_ready(order.id, now).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_create_persists_pending_order() {
        let f = Fixture::new().await;
        let order = f.pending_order(2).await;

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total_price.cents(), 600);
        assert_eq!(f.machine.load(order.id).await.unwrap(), order);
        assert_eq!(f.repo.stock_of(f.product.id).await, Some(2));
    }

    #[tokio::test]
    async fn test_out_of_table_move_leaves_order_unchanged() {
        let f = Fixture::new().await;
        let order = f.pending_order(1).await;

        let err = f.machine.mark_ready(order.id, Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            FulfillmentError::InvalidTransition {
                current: OrderStatus::Pending,
                requested: OrderStatus::ReadyForPickup,
            }
        ));
        assert_eq!(f.machine.load(order.id).await.unwrap().status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_releases_stock() {
        let f = Fixture::new().await;
        let order = f.pending_order(3).await;
        assert_eq!(f.repo.stock_of(f.product.id).await, Some(1));

        let cancelled = f.machine.cancel(order.id, Utc::now()).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
        assert_eq!(f.repo.stock_of(f.product.id).await, Some(1));
        f.machine.release_items(&cancelled).await.unwrap();
        assert_eq!(f.repo.stock_of(f.product.id).await, Some(4));

        let err = f.machine.cancel(order.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::InvalidTransition { .. }));
        assert_eq!(f.repo.stock_of(f.product.id).await, Some(4));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_accept_and_cancel_have_one_winner() {
        let f = Fixture::new().await;
        let order_id = f.pending_order(1).await.id;
        let machine = Arc::new(f.machine);

        let accept = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.accept(order_id, Utc::now()).await })
        };
        let cancel = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.cancel(order_id, Utc::now()).await })
        };
        let accepted = accept.await.unwrap();
        let cancelled = cancel.await.unwrap();

        let final_status = machine.load(order_id).await.unwrap().status;
        match (accepted, cancelled) {
            (Ok(_), Ok(_)) => assert_eq!(final_status, OrderStatus::Cancelled),
            (Ok(_), Err(_)) => assert_eq!(final_status, OrderStatus::Accepted),
            (Err(_), Ok(_)) => assert_eq!(final_status, OrderStatus::Cancelled),
            (Err(a), Err(c)) => panic!("both failed: {a}, {c}"),
        }
    }

    #[tokio::test]
    async fn test_withdraw_needs_ready_order_and_running_dispatch() {
        let f = Fixture::new().await;
        let pending = f.pending_order(1).await;
        assert!(f.machine.withdraw(pending.id, Utc::now()).await.is_err());

        let ready = f.ready_order().await;
        let err = f.machine.withdraw(ready.id, Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            FulfillmentError::InvalidTransition {
                current: OrderStatus::ReadyForPickup,
                requested: OrderStatus::Cancelled,
            }
        ));

        let now = Utc::now();
        let lease = DispatchLease::new(ready.id, now + chrono::Duration::seconds(60));
        f.repo.acquire_dispatch_lease(&lease, now).await.unwrap();
        let (withdrawn, removed) = f.machine.withdraw(ready.id, now).await.unwrap();
        assert_eq!(withdrawn.status, OrderStatus::Cancelled);
        assert_eq!(removed.dispatch_id, lease.dispatch_id);
    }

    #[tokio::test]
    async fn test_assign_then_deliver_commits_stock() {
        let f = Fixture::new().await;
        let order = f.ready_order().await;
        let partner = DeliveryProfile::new(UserId::new());
        f.repo.save_delivery_profile(&partner).await.unwrap();

        let outcome = f.machine.assign(&order, partner.user_id, Utc::now()).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed(_)));

        let stranger = UserId::new();
        let err = f.machine.deliver(order.id, stranger, Utc::now()).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::InvalidTransition { .. }));

        let delivered = f
            .machine
            .deliver(order.id, partner.user_id, Utc::now())
            .await
            .unwrap();
        assert_eq!(delivered.status, OrderStatus::Delivered);
        assert_eq!(f.repo.reservation_count(ReservationState::Held).await, 1);
        f.machine.commit_items(&delivered).await.unwrap();
        assert_eq!(f.repo.reservation_count(ReservationState::Committed).await, 1);

        let profile = f
            .repo
            .get_delivery_profile(partner.user_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(profile.status, PartnerStatus::Available);
    }

    #[tokio::test]
    async fn test_unknown_order_is_not_found() {
        let f = Fixture::new().await;
        let err = f.machine.accept(OrderId::new(), Utc::now()).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::NotFound { entity: "order", .. }));
    }
}
