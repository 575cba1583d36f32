//! Fulfillment orchestrator: the engine's public operations.

use std::sync::Arc;

use common::{OrderId, StoreId, UserId};
use domain::{GeoPoint, Order, OrderStatus, PartnerStatus, Store};
use repository::Repository;

use crate::clock::Clock;
use crate::config::FulfillmentConfig;
use crate::dispatch::{DispatchOutcome, Dispatcher, PartnerGateway};
use crate::error::{FulfillmentError, Result};
use crate::inventory::InventoryReservations;
use crate::notifier::{FulfillmentEvent, Notifier, notify_bounded};
use crate::snapshot::CartSnapshotter;
use crate::state_machine::OrderStateMachine;

/// Drives orders from checkout to delivery or cancellation.
///
/// Every operation checks the caller's capability, then delegates to the
/// component that owns the step. Operations are safe to call concurrently,
/// also from several engine instances sharing one repository; correctness
/// rests on the repository's atomic updates. Notifications run on spawned
/// tasks, so operations must be called inside a Tokio runtime.
pub struct FulfillmentOrchestrator<R, G, N, C>
where
    R: Repository,
    G: PartnerGateway,
    N: Notifier + 'static,
    C: Clock,
{
    repository: Arc<R>,
    notifier: Arc<N>,
    clock: Arc<C>,
    config: FulfillmentConfig,
    inventory: InventoryReservations<R>,
    snapshotter: CartSnapshotter<R>,
    state_machine: Arc<OrderStateMachine<R>>,
    dispatcher: Dispatcher<R, G, C>,
}

impl<R, G, N, C> FulfillmentOrchestrator<R, G, N, C>
where
    R: Repository,
    G: PartnerGateway,
    N: Notifier + 'static,
    C: Clock,
{
    /// Creates a new orchestrator.
    pub fn new(repository: R, gateway: G, notifier: N, clock: C, config: FulfillmentConfig) -> Self {
        let repository = Arc::new(repository);
        let clock = Arc::new(clock);
        let inventory = InventoryReservations::new(Arc::clone(&repository));
        let state_machine = Arc::new(OrderStateMachine::new(
            Arc::clone(&repository),
            inventory.clone(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&repository),
            Arc::new(gateway),
            Arc::clone(&clock),
            Arc::clone(&state_machine),
            config.offer_window,
            config.max_offers_per_dispatch,
        );

        Self {
            snapshotter: CartSnapshotter::new(Arc::clone(&repository)),
            repository,
            notifier: Arc::new(notifier),
            clock,
            config,
            inventory,
            state_machine,
            dispatcher,
        }
    }

    pub fn config(&self) -> &FulfillmentConfig {
        &self.config
    }

    /// Checks out the user's cart lines for `store_id` into a PENDING order.
    ///
    /// Stock for every line is reserved before the order exists; any
    /// failure leaves stock, orders and the cart untouched.
    #[tracing::instrument(skip(self))]
    pub async fn place_order(&self, user_id: UserId, store_id: StoreId) -> Result<Order> {
        match self.checkout(user_id, store_id).await {
            Ok(order) => {
                metrics::counter!("orders_placed_total").increment(1);
                Ok(order)
            }
            Err(e) => {
                metrics::counter!("checkout_rejected_total", "reason" => e.kind()).increment(1);
                tracing::info!(error = %e, "checkout rejected");
                Err(e)
            }
        }
    }

    async fn checkout(&self, user_id: UserId, store_id: StoreId) -> Result<Order> {
        match self.repository.get_user(user_id).await? {
            Some(user) if user.is_active() => {}
            _ => return Err(FulfillmentError::not_found("user", user_id)),
        }
        let store = self.load_store(store_id).await?;
        if !store.accepts_orders() {
            return Err(FulfillmentError::StoreUnavailable(store_id));
        }

        let snapshot = self.snapshotter.snapshot(user_id, store_id).await?;
        let now = self.clock.now();
        let tokens = self.inventory.reserve_all(&snapshot.items, now).await?;

        let order = match self.state_machine.create(&snapshot, &tokens, now).await {
            Ok(order) => order,
            Err(e) => {
                if let Err(undo) = self.inventory.release_all(&tokens).await {
                    tracing::error!(error = %undo, "failed to roll back checkout reservations");
                }
                return Err(e);
            }
        };

        if let Err(e) = self
            .repository
            .remove_cart_items(user_id, &snapshot.product_ids())
            .await
        {
            tracing::warn!(order_id = %order.id, error = %e, "failed to clear checked-out cart lines");
        }

        self.notify(store.owner_id, FulfillmentEvent::OrderPlaced { order_id: order.id });
        Ok(order)
    }

    /// `PENDING → ACCEPTED` by the store owner.
    #[tracing::instrument(skip(self))]
    pub async fn accept_order(&self, order_id: OrderId, actor_id: UserId) -> Result<Order> {
        self.authorize_store_owner(order_id, actor_id, "accept orders for this store")
            .await?;
        let order = self.state_machine.accept(order_id, self.clock.now()).await?;
        self.notify(order.user_id, FulfillmentEvent::OrderAccepted { order_id });
        Ok(order)
    }

    /// Store owner declines the order; same effects as a cancel.
    #[tracing::instrument(skip(self))]
    pub async fn reject_order(&self, order_id: OrderId, actor_id: UserId) -> Result<Order> {
        let (order, _) = self
            .authorize_store_owner(order_id, actor_id, "reject orders for this store")
            .await?;
        self.cancel_authorized(order, actor_id).await
    }

    /// `ACCEPTED → PROCESSING` by the store owner.
    #[tracing::instrument(skip(self))]
    pub async fn start_preparing(&self, order_id: OrderId, actor_id: UserId) -> Result<Order> {
        self.authorize_store_owner(order_id, actor_id, "prepare orders for this store")
            .await?;
        self.state_machine
            .start_preparing(order_id, self.clock.now())
            .await
    }

    /// `PROCESSING → READY_FOR_PICKUP` by the store owner, then dispatch.
    ///
    /// Finding no partner is not an error: the order stays READY_FOR_PICKUP,
    /// the owner is told, and the outcome says `AwaitingCourier`.
    #[tracing::instrument(skip(self))]
    pub async fn mark_ready(&self, order_id: OrderId, actor_id: UserId) -> Result<DispatchOutcome> {
        let (_, store) = self
            .authorize_store_owner(order_id, actor_id, "mark orders ready for this store")
            .await?;
        self.state_machine
            .mark_ready(order_id, self.clock.now())
            .await?;

        match self.dispatch_and_report(order_id, &store).await {
            Err(FulfillmentError::DispatchInProgress(_)) => Ok(DispatchOutcome::AwaitingCourier),
            other => other,
        }
    }

    /// Runs dispatch again for an order still awaiting a courier.
    #[tracing::instrument(skip(self))]
    pub async fn retry_dispatch(&self, order_id: OrderId, actor_id: UserId) -> Result<DispatchOutcome> {
        let (order, store) = self
            .authorize_store_owner(order_id, actor_id, "dispatch orders for this store")
            .await?;
        if !order.is_awaiting_courier() {
            return Err(FulfillmentError::InvalidTransition {
                current: order.status,
                requested: OrderStatus::OutForDelivery,
            });
        }
        self.dispatch_and_report(order_id, &store).await
    }

    /// Dispatch without an actor, for the re-offer sweep. The owner is not
    /// notified again when nobody is found. Fails with `DispatchInProgress`
    /// when another dispatch holds the order.
    pub(crate) async fn redispatch(&self, order_id: OrderId) -> Result<DispatchOutcome> {
        match self.dispatcher.dispatch(order_id).await {
            Ok(outcome) => {
                self.report_dispatch(order_id, outcome).await;
                Ok(outcome)
            }
            Err(FulfillmentError::NoPartnerAvailable(_)) => Ok(DispatchOutcome::AwaitingCourier),
            Err(e) => Err(e),
        }
    }

    /// Releases or commits reservations left HELD by orders that already
    /// reached CANCELLED or DELIVERED. Returns how many were settled.
    pub(crate) async fn settle_stranded_reservations(&self) -> Result<usize> {
        let mut settled = 0;
        for (reservation_id, status) in self.repository.stranded_reservations().await? {
            let done = match status {
                OrderStatus::Cancelled => self
                    .repository
                    .release_reservation(reservation_id)
                    .await?
                    .is_some(),
                OrderStatus::Delivered => self
                    .repository
                    .commit_reservation(reservation_id)
                    .await?
                    .is_some(),
                _ => false,
            };
            if done {
                tracing::info!(%reservation_id, %status, "stranded reservation settled");
                settled += 1;
            }
        }
        Ok(settled)
    }

    async fn dispatch_and_report(&self, order_id: OrderId, store: &Store) -> Result<DispatchOutcome> {
        match self.dispatcher.dispatch(order_id).await {
            Ok(outcome) => {
                self.report_dispatch(order_id, outcome).await;
                Ok(outcome)
            }
            Err(FulfillmentError::NoPartnerAvailable(_)) => {
                self.notify(store.owner_id, FulfillmentEvent::NoPartnerAvailable { order_id });
                Ok(DispatchOutcome::AwaitingCourier)
            }
            Err(e) => Err(e),
        }
    }

    async fn report_dispatch(&self, order_id: OrderId, outcome: DispatchOutcome) {
        if let DispatchOutcome::Assigned { partner_id } = outcome {
            match self.repository.get_order(order_id).await {
                Ok(Some(order)) => {
                    self.notify(
                        order.user_id,
                        FulfillmentEvent::OrderOutForDelivery {
                            order_id,
                            partner_id,
                        },
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(%order_id, error = %e, "could not load order for notification");
                }
            }
        }
    }

    /// `OUT_FOR_DELIVERY → DELIVERED` by the assigned partner.
    #[tracing::instrument(skip(self))]
    pub async fn mark_delivered(&self, order_id: OrderId, actor_id: UserId) -> Result<Order> {
        let order = self.state_machine.load(order_id).await?;
        if order.status != OrderStatus::OutForDelivery {
            return Err(FulfillmentError::InvalidTransition {
                current: order.status,
                requested: OrderStatus::Delivered,
            });
        }
        if order.delivery_partner_id != Some(actor_id) {
            return Err(FulfillmentError::Forbidden {
                actor: actor_id,
                action: "deliver an order assigned to someone else",
            });
        }

        let order = self
            .state_machine
            .deliver(order_id, actor_id, self.clock.now())
            .await?;
        let committed = self.state_machine.commit_items(&order).await;
        self.notify(order.user_id, FulfillmentEvent::OrderDelivered { order_id });
        if let Err(e) = committed {
            tracing::error!(%order_id, error = %e, "delivered order still holds reservations");
            return Err(e);
        }
        Ok(order)
    }

    /// Cancels the order on behalf of its customer or the store owner.
    ///
    /// Allowed from PENDING, ACCEPTED and PROCESSING. A READY_FOR_PICKUP
    /// order can only be cancelled while a dispatch for it is running, in
    /// this or any other engine instance; that dispatch makes no further
    /// offers, the partner holding the current offer is told it is
    /// withdrawn, and a late acceptance fails as stale.
    ///
    /// If releasing stock fails after the order is CANCELLED, the error is
    /// returned and the order stays CANCELLED; the re-offer sweep releases
    /// what is still held.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: OrderId, actor_id: UserId) -> Result<Order> {
        let order = self.state_machine.load(order_id).await?;
        if order.user_id != actor_id {
            let store = self.load_store(order.store_id).await?;
            if !store.is_owned_by(actor_id) {
                return Err(FulfillmentError::Forbidden {
                    actor: actor_id,
                    action: "cancel this order",
                });
            }
        }
        self.cancel_authorized(order, actor_id).await
    }

    async fn cancel_authorized(&self, order: Order, actor_id: UserId) -> Result<Order> {
        let now = self.clock.now();
        let (cancelled, offer_holder) = if order.status == OrderStatus::ReadyForPickup {
            let (cancelled, lease) = self.state_machine.withdraw(order.id, now).await?;
            tracing::info!(order_id = %order.id, "dispatch withdrawn by cancellation");
            (cancelled, lease.partner_id)
        } else {
            (self.state_machine.cancel(order.id, now).await?, None)
        };

        let released = self.state_machine.release_items(&cancelled).await;
        if let Some(partner_id) = offer_holder {
            self.dispatcher.withdraw_offer(partner_id, cancelled.id).await;
        }
        metrics::counter!("orders_cancelled_total").increment(1);

        let event = FulfillmentEvent::OrderCancelled {
            order_id: cancelled.id,
            by: actor_id,
        };
        if cancelled.user_id == actor_id {
            match self.load_store(cancelled.store_id).await {
                Ok(store) => self.notify(store.owner_id, event),
                Err(e) => tracing::warn!(
                    order_id = %cancelled.id,
                    error = %e,
                    "could not load store for notification"
                ),
            }
        } else {
            self.notify(cancelled.user_id, event);
        }

        if let Err(e) = released {
            tracing::error!(order_id = %cancelled.id, error = %e, "cancelled order still holds stock");
            return Err(e);
        }
        Ok(cancelled)
    }

    /// Reads an order.
    pub async fn get_order(&self, order_id: OrderId) -> Result<Order> {
        self.state_machine.load(order_id).await
    }

    /// Puts an idle partner on (AVAILABLE) or off (OFFLINE) duty.
    #[tracing::instrument(skip(self))]
    pub async fn set_partner_availability(&self, partner_id: UserId, available: bool) -> Result<()> {
        if self.repository.get_delivery_profile(partner_id).await?.is_none() {
            return Err(FulfillmentError::not_found("delivery profile", partner_id));
        }
        let status = if available {
            PartnerStatus::Available
        } else {
            PartnerStatus::Offline
        };
        if !self
            .repository
            .set_idle_partner_status(partner_id, status)
            .await?
        {
            return Err(FulfillmentError::PartnerBusy(partner_id));
        }
        tracing::info!(%partner_id, %status, "partner availability changed");
        Ok(())
    }

    /// Records a partner's current position.
    #[tracing::instrument(skip(self))]
    pub async fn update_partner_location(&self, partner_id: UserId, location: GeoPoint) -> Result<()> {
        if !self
            .repository
            .update_partner_location(partner_id, location)
            .await?
        {
            return Err(FulfillmentError::not_found("delivery profile", partner_id));
        }
        Ok(())
    }

    /// Orders waiting for a courier, oldest first.
    pub async fn orders_awaiting_courier(&self) -> Result<Vec<Order>> {
        Ok(self.repository.orders_awaiting_courier().await?)
    }

    async fn load_store(&self, store_id: StoreId) -> Result<Store> {
        self.repository
            .get_store(store_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found("store", store_id))
    }

    async fn authorize_store_owner(
        &self,
        order_id: OrderId,
        actor_id: UserId,
        action: &'static str,
    ) -> Result<(Order, Store)> {
        let order = self.state_machine.load(order_id).await?;
        let store = self.load_store(order.store_id).await?;
        if !store.is_owned_by(actor_id) {
            return Err(FulfillmentError::Forbidden {
                actor: actor_id,
                action,
            });
        }
        Ok((order, store))
    }

    /// Hands the event to a background task; the caller never waits on the sink.
    fn notify(&self, user_id: UserId, event: FulfillmentEvent) {
        let notifier = Arc::clone(&self.notifier);
        let timeout = self.config.notify_timeout;
        tokio::spawn(async move {
            notify_bounded(notifier.as_ref(), timeout, user_id, event).await;
        });
    }
}
