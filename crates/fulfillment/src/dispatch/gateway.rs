//! Partner offer gateway trait and a scripted in-memory implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{OrderId, UserId};
use domain::Order;
use thiserror::Error;
use tokio::sync::{Notify, RwLock};

/// A partner's answer to an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferResponse {
    Accepted,
    Declined,
}

/// Failure reported by the gateway.
#[derive(Debug, Error)]
#[error("partner gateway error: {0}")]
pub struct GatewayError(pub String);

/// Channel to delivery partners.
///
/// `offer` may take as long as the partner does; the dispatcher bounds it
/// with the offer window.
#[async_trait]
pub trait PartnerGateway: Send + Sync {
    async fn offer(&self, partner_id: UserId, order: &Order) -> Result<OfferResponse, GatewayError>;

    /// Tells the partner an offer is no longer valid.
    async fn withdraw(&self, partner_id: UserId, order_id: OrderId) -> Result<(), GatewayError>;
}

/// How a scripted partner answers the next offer.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Accept,
    Decline,
    Fail,
    /// Never answers.
    Ignore,
    /// Accepts after a delay.
    AcceptAfter(Duration),
    /// Accepts once the gate is opened.
    AcceptWhen(Arc<Notify>),
}

#[derive(Debug)]
struct ScriptedGatewayState {
    scripts: HashMap<UserId, VecDeque<ScriptedReply>>,
    default_reply: ScriptedReply,
    offers: Vec<(UserId, OrderId)>,
    withdrawals: Vec<(UserId, OrderId)>,
    fail_on_withdraw: bool,
}

impl Default for ScriptedGatewayState {
    fn default() -> Self {
        Self {
            scripts: HashMap::new(),
            default_reply: ScriptedReply::Accept,
            offers: Vec::new(),
            withdrawals: Vec::new(),
            fail_on_withdraw: false,
        }
    }
}

/// Gateway whose partners answer from per-partner scripts, for testing.
///
/// Partners without a script answer with the default reply (`Accept`
/// unless changed).
#[derive(Debug, Clone, Default)]
pub struct ScriptedPartnerGateway {
    state: Arc<RwLock<ScriptedGatewayState>>,
}

impl ScriptedPartnerGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues replies for `partner_id`, consumed one per offer.
    pub async fn script(&self, partner_id: UserId, replies: impl IntoIterator<Item = ScriptedReply>) {
        self.state
            .write()
            .await
            .scripts
            .entry(partner_id)
            .or_default()
            .extend(replies);
    }

    pub async fn set_default_reply(&self, reply: ScriptedReply) {
        self.state.write().await.default_reply = reply;
    }

    pub async fn set_fail_on_withdraw(&self, fail: bool) {
        self.state.write().await.fail_on_withdraw = fail;
    }

    /// Offers made so far, in order.
    pub async fn offers(&self) -> Vec<(UserId, OrderId)> {
        self.state.read().await.offers.clone()
    }

    /// Withdrawals received so far, in order.
    pub async fn withdrawals(&self) -> Vec<(UserId, OrderId)> {
        self.state.read().await.withdrawals.clone()
    }

    /// Waits until at least `count` offers have been made.
    pub async fn wait_for_offers(&self, count: usize) {
        while self.state.read().await.offers.len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl PartnerGateway for ScriptedPartnerGateway {
    async fn offer(&self, partner_id: UserId, order: &Order) -> Result<OfferResponse, GatewayError> {
        let reply = {
            let mut state = self.state.write().await;
            state.offers.push((partner_id, order.id));
            let scripted = state
                .scripts
                .get_mut(&partner_id)
                .and_then(VecDeque::pop_front);
            scripted.unwrap_or_else(|| state.default_reply.clone())
        };

        match reply {
            ScriptedReply::Accept => Ok(OfferResponse::Accepted),
            ScriptedReply::Decline => Ok(OfferResponse::Declined),
            ScriptedReply::Fail => Err(GatewayError("partner unreachable".to_string())),
            ScriptedReply::Ignore => {
                std::future::pending::<()>().await;
                Ok(OfferResponse::Declined)
            }
            ScriptedReply::AcceptAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(OfferResponse::Accepted)
            }
            ScriptedReply::AcceptWhen(gate) => {
                gate.notified().await;
                Ok(OfferResponse::Accepted)
            }
        }
    }

    async fn withdraw(&self, partner_id: UserId, order_id: OrderId) -> Result<(), GatewayError> {
        let mut state = self.state.write().await;
        if state.fail_on_withdraw {
            return Err(GatewayError("withdraw not delivered".to_string()));
        }
        state.withdrawals.push((partner_id, order_id));
        Ok(())
    }
}
