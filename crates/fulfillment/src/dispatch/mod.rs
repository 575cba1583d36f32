//! Delivery partner dispatch.
//!
//! A dispatch walks the nearest AVAILABLE partners one at a time. It runs
//! under a [`DispatchLease`] stored in the repository, so at most one engine
//! instance dispatches a given order. Each offer is awaited under the offer
//! window with nothing else held; an acceptance only counts once the
//! repository's atomic claim succeeds, which also rejects acceptances for
//! orders that left READY_FOR_PICKUP meanwhile. A cancellation deletes the
//! lease, and the dispatch stops before making another offer.

pub mod gateway;

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::{OrderId, UserId};
use domain::{DeliveryProfile, DispatchLease, GeoPoint, Order, OrderStatus};
use repository::{ClaimOutcome, Repository};

pub use gateway::{
    GatewayError, OfferResponse, PartnerGateway, ScriptedPartnerGateway, ScriptedReply,
};

use crate::clock::Clock;
use crate::error::{FulfillmentError, Result};
use crate::state_machine::OrderStateMachine;

/// Result of offering an order to a single partner.
#[derive(Debug, Clone, PartialEq)]
pub enum OfferOutcome {
    /// The partner accepted and was claimed; holds the updated order.
    Accepted(Order),
    Declined,
    TimedOut,
    /// The partner accepted but was no longer AVAILABLE.
    PartnerUnavailable,
    /// The partner accepted but the order had left READY_FOR_PICKUP.
    Stale(OrderStatus),
}

impl OfferOutcome {
    fn label(&self) -> &'static str {
        match self {
            OfferOutcome::Accepted(_) => "accepted",
            OfferOutcome::Declined => "declined",
            OfferOutcome::TimedOut => "timed_out",
            OfferOutcome::PartnerUnavailable => "partner_unavailable",
            OfferOutcome::Stale(_) => "stale",
        }
    }
}

/// How a successful dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A partner claimed the order; it is OUT_FOR_DELIVERY.
    Assigned { partner_id: UserId },
    /// Nobody took the order; it stays READY_FOR_PICKUP.
    AwaitingCourier,
    /// The order was cancelled while offers were out.
    Withdrawn,
}

/// Matches READY_FOR_PICKUP orders with delivery partners.
pub struct Dispatcher<R, G, C> {
    repository: Arc<R>,
    gateway: Arc<G>,
    clock: Arc<C>,
    state_machine: Arc<OrderStateMachine<R>>,
    offer_window: Duration,
    max_offers: usize,
    /// How long a lease stays live after each renewal.
    lease_ttl: chrono::Duration,
}

impl<R, G, C> Dispatcher<R, G, C>
where
    R: Repository,
    G: PartnerGateway,
    C: Clock,
{
    pub fn new(
        repository: Arc<R>,
        gateway: Arc<G>,
        clock: Arc<C>,
        state_machine: Arc<OrderStateMachine<R>>,
        offer_window: Duration,
        max_offers: usize,
    ) -> Self {
        // One full window for the reply plus as much again for the claim.
        let lease_ttl = chrono::Duration::from_std(offer_window.saturating_mul(2))
            .unwrap_or(chrono::Duration::MAX);
        Self {
            repository,
            gateway,
            clock,
            state_machine,
            offer_window,
            max_offers,
            lease_ttl,
        }
    }

    /// AVAILABLE partners, nearest to `store_location` first.
    ///
    /// Partners without a known location (or every partner, when the store
    /// has none) come after located ones. Ties go to the lower partner id.
    pub async fn find_candidates(
        &self,
        store_location: Option<&GeoPoint>,
    ) -> Result<Vec<DeliveryProfile>> {
        let mut candidates: Vec<(Option<f64>, DeliveryProfile)> = self
            .repository
            .available_partners()
            .await?
            .into_iter()
            .map(|profile| (profile.distance_km(store_location), profile))
            .collect();

        candidates.sort_by(|(da, a), (db, b)| {
            let by_distance = match (da, db) {
                (Some(x), Some(y)) => x.total_cmp(y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            by_distance.then_with(|| a.user_id.cmp(&b.user_id))
        });

        Ok(candidates
            .into_iter()
            .map(|(_, profile)| profile)
            .take(self.max_offers)
            .collect())
    }

    /// Offers `order` to one partner and claims them on acceptance.
    #[tracing::instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn offer(&self, order: &Order, partner_id: UserId) -> Result<OfferOutcome> {
        let reply = tokio::time::timeout(self.offer_window, self.gateway.offer(partner_id, order)).await;

        let outcome = match reply {
            Err(_) => {
                self.withdraw_offer(partner_id, order.id).await;
                OfferOutcome::TimedOut
            }
            Ok(Err(e)) => {
                tracing::warn!(%partner_id, error = %e, "offer failed, treating as declined");
                OfferOutcome::Declined
            }
            Ok(Ok(OfferResponse::Declined)) => OfferOutcome::Declined,
            Ok(Ok(OfferResponse::Accepted)) => {
                let now = self.clock.now();
                match self.state_machine.assign(order, partner_id, now).await? {
                    ClaimOutcome::Claimed(order) => OfferOutcome::Accepted(order),
                    ClaimOutcome::PartnerUnavailable => OfferOutcome::PartnerUnavailable,
                    ClaimOutcome::OrderNotReady(status) => {
                        tracing::info!(%partner_id, %status, "stale acceptance rejected");
                        OfferOutcome::Stale(status)
                    }
                }
            }
        };

        metrics::counter!("dispatch_offers_total", "outcome" => outcome.label()).increment(1);
        tracing::debug!(%partner_id, outcome = outcome.label(), "offer finished");
        Ok(outcome)
    }

    /// Offers the order to candidates until one is claimed.
    ///
    /// Fails with `NoPartnerAvailable` once the candidates are exhausted and
    /// with `DispatchInProgress` while another dispatch holds a live lease
    /// on the order.
    #[tracing::instrument(skip(self))]
    pub async fn dispatch(&self, order_id: OrderId) -> Result<DispatchOutcome> {
        let now = self.clock.now();
        let lease = DispatchLease::new(order_id, self.lease_deadline(now));
        if !self.repository.acquire_dispatch_lease(&lease, now).await? {
            return Err(FulfillmentError::DispatchInProgress(order_id));
        }
        let started = Instant::now();

        let result = self.run_dispatch(lease).await;

        if let Err(e) = self
            .repository
            .release_dispatch_lease(order_id, lease.dispatch_id)
            .await
        {
            // It expires on its own.
            tracing::warn!(%order_id, error = %e, "failed to release dispatch lease");
        }
        metrics::histogram!("dispatch_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    async fn run_dispatch(&self, mut lease: DispatchLease) -> Result<DispatchOutcome> {
        let order_id = lease.order_id;
        let order = self
            .repository
            .get_order(order_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found("order", order_id))?;
        if !order.is_awaiting_courier() {
            return Err(FulfillmentError::InvalidTransition {
                current: order.status,
                requested: OrderStatus::OutForDelivery,
            });
        }
        let store = self
            .repository
            .get_store(order.store_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found("store", order.store_id))?;

        let candidates = self.find_candidates(store.location.as_ref()).await?;
        tracing::debug!(candidates = candidates.len(), "dispatch candidates found");

        for candidate in candidates {
            let deadline = self.lease_deadline(self.clock.now());
            lease = lease.offering_to(Some(candidate.user_id), deadline);
            if !self.repository.renew_dispatch_lease(&lease).await? {
                tracing::info!(%order_id, "dispatch withdrawn, no further offers");
                return Ok(DispatchOutcome::Withdrawn);
            }

            match self.offer(&order, candidate.user_id).await? {
                OfferOutcome::Accepted(_) => {
                    return Ok(DispatchOutcome::Assigned {
                        partner_id: candidate.user_id,
                    });
                }
                OfferOutcome::Stale(_) => return Ok(DispatchOutcome::Withdrawn),
                OfferOutcome::Declined
                | OfferOutcome::TimedOut
                | OfferOutcome::PartnerUnavailable => {}
            }
        }

        let still_ours = self
            .repository
            .get_dispatch_lease(order_id)
            .await?
            .is_some_and(|held| held.dispatch_id == lease.dispatch_id);
        if !still_ours {
            tracing::info!(%order_id, "dispatch withdrawn during the last offer");
            return Ok(DispatchOutcome::Withdrawn);
        }

        metrics::counter!("dispatch_no_partner_total").increment(1);
        tracing::info!(%order_id, "no delivery partner available");
        Err(FulfillmentError::NoPartnerAvailable(order_id))
    }

    /// Tells `partner_id` that their offer for the order is withdrawn.
    ///
    /// Their acceptance, if it still arrives, fails the claim as stale.
    pub async fn withdraw_offer(&self, partner_id: UserId, order_id: OrderId) {
        if let Err(e) = self.gateway.withdraw(partner_id, order_id).await {
            tracing::warn!(%partner_id, %order_id, error = %e, "failed to withdraw offer");
        }
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.lease_ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
