//! Notification sink.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{OrderId, UserId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

/// Something a user should hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FulfillmentEvent {
    OrderPlaced { order_id: OrderId },
    OrderAccepted { order_id: OrderId },
    OrderCancelled { order_id: OrderId, by: UserId },
    OrderOutForDelivery { order_id: OrderId, partner_id: UserId },
    OrderDelivered { order_id: OrderId },
    NoPartnerAvailable { order_id: OrderId },
}

impl FulfillmentEvent {
    pub fn order_id(&self) -> OrderId {
        match self {
            Self::OrderPlaced { order_id }
            | Self::OrderAccepted { order_id }
            | Self::OrderCancelled { order_id, .. }
            | Self::OrderOutForDelivery { order_id, .. }
            | Self::OrderDelivered { order_id }
            | Self::NoPartnerAvailable { order_id } => *order_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OrderPlaced { .. } => "ORDER_PLACED",
            Self::OrderAccepted { .. } => "ORDER_ACCEPTED",
            Self::OrderCancelled { .. } => "ORDER_CANCELLED",
            Self::OrderOutForDelivery { .. } => "ORDER_OUT_FOR_DELIVERY",
            Self::OrderDelivered { .. } => "ORDER_DELIVERED",
            Self::NoPartnerAvailable { .. } => "NO_PARTNER_AVAILABLE",
        }
    }
}

/// Failure reported by a notification sink.
#[derive(Debug, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Delivers events to users.
///
/// The engine calls it from a spawned task and never waits for the result.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: UserId, event: FulfillmentEvent) -> Result<(), NotifyError>;
}

/// Sends `event`, giving up after `timeout`. Failures are logged and dropped.
pub(crate) async fn notify_bounded<N: Notifier + ?Sized>(
    notifier: &N,
    timeout: Duration,
    user_id: UserId,
    event: FulfillmentEvent,
) {
    let name = event.name();
    let order_id = event.order_id();
    match tokio::time::timeout(timeout, notifier.notify(user_id, event)).await {
        Ok(Ok(())) => {
            tracing::debug!(%user_id, %order_id, event = name, "notification sent");
        }
        Ok(Err(e)) => {
            metrics::counter!("notifications_failed_total").increment(1);
            tracing::warn!(%user_id, %order_id, event = name, error = %e, "notification failed");
        }
        Err(_) => {
            metrics::counter!("notifications_failed_total").increment(1);
            tracing::warn!(%user_id, %order_id, event = name, ?timeout, "notification timed out");
        }
    }
}

#[derive(Debug, Default)]
struct InMemoryNotifierState {
    sent: Vec<(UserId, FulfillmentEvent)>,
    fail: bool,
}

/// Records notifications in memory, for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotifier {
    state: Arc<RwLock<InMemoryNotifierState>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `notify` call fail.
    pub async fn set_fail(&self, fail: bool) {
        self.state.write().await.fail = fail;
    }

    /// Every notification delivered so far, in order.
    pub async fn sent(&self) -> Vec<(UserId, FulfillmentEvent)> {
        self.state.read().await.sent.clone()
    }

    /// Waits until at least `count` notifications have been delivered.
    pub async fn wait_for_events(&self, count: usize) {
        while self.state.read().await.sent.len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Events delivered to `user_id`.
    pub async fn events_for(&self, user_id: UserId) -> Vec<FulfillmentEvent> {
        self.state
            .read()
            .await
            .sent
            .iter()
            .filter(|(to, _)| *to == user_id)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(&self, user_id: UserId, event: FulfillmentEvent) -> Result<(), NotifyError> {
        let mut state = self.state.write().await;
        if state.fail {
            return Err(NotifyError("sink unavailable".to_string()));
        }
        state.sent.push((user_id, event));
        Ok(())
    }
}

/// Drops every notification. Useful when nobody listens.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _user_id: UserId, _event: FulfillmentEvent) -> Result<(), NotifyError> {
        Ok(())
    }
}
