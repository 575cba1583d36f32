//! Periodic re-offer of orders stuck awaiting a courier.

use std::sync::Arc;

use repository::Repository;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::Clock;
use crate::dispatch::{DispatchOutcome, PartnerGateway};
use crate::error::{FulfillmentError, Result};
use crate::notifier::Notifier;
use crate::orchestrator::FulfillmentOrchestrator;

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Orders a dispatch was started for.
    pub attempted: usize,
    pub assigned: usize,
    pub still_waiting: usize,
    /// Orders skipped because another dispatch held them.
    pub skipped: usize,
    pub failed: usize,
    /// Reservations of cancelled or delivered orders released or committed.
    pub settled: usize,
}

/// Re-dispatches READY_FOR_PICKUP orders that have no partner and no
/// running dispatch, and settles reservations that terminal orders left
/// HELD.
pub struct ReofferSweep<R, G, N, C>
where
    R: Repository,
    G: PartnerGateway,
    N: Notifier + 'static,
    C: Clock,
{
    orchestrator: Arc<FulfillmentOrchestrator<R, G, N, C>>,
}

impl<R, G, N, C> ReofferSweep<R, G, N, C>
where
    R: Repository + 'static,
    G: PartnerGateway + 'static,
    N: Notifier + 'static,
    C: Clock + 'static,
{
    pub fn new(orchestrator: Arc<FulfillmentOrchestrator<R, G, N, C>>) -> Self {
        Self { orchestrator }
    }

    /// One pass over every order awaiting a courier, oldest first.
    ///
    /// A failure on one order is logged and counted; the pass continues.
    pub async fn run_once(&self) -> Result<SweepReport> {
        self.pass(None).await
    }

    #[tracing::instrument(skip_all)]
    async fn pass(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<SweepReport> {
        let stopping = || shutdown.is_some_and(|rx| *rx.borrow());
        let mut report = SweepReport::default();

        match self.orchestrator.settle_stranded_reservations().await {
            Ok(settled) => report.settled = settled,
            Err(e) => tracing::warn!(error = %e, "settling stranded reservations failed"),
        }

        for order in self.orchestrator.orders_awaiting_courier().await? {
            if stopping() {
                tracing::info!("re-offer sweep interrupted by shutdown");
                break;
            }
            match self.orchestrator.redispatch(order.id).await {
                Err(FulfillmentError::DispatchInProgress(_)) => {
                    report.skipped += 1;
                    continue;
                }
                Ok(DispatchOutcome::Assigned { .. }) => report.assigned += 1,
                Ok(DispatchOutcome::AwaitingCourier) => report.still_waiting += 1,
                Ok(DispatchOutcome::Withdrawn) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(order_id = %order.id, error = %e, "re-offer failed");
                }
            }
            report.attempted += 1;
        }

        tracing::info!(
            attempted = report.attempted,
            assigned = report.assigned,
            still_waiting = report.still_waiting,
            skipped = report.skipped,
            settled = report.settled,
            "re-offer sweep finished"
        );
        Ok(report)
    }

    /// Runs a pass every `sweep_interval` of the orchestrator's config until
    /// `shutdown` flips to `true` or its sender is dropped.
    ///
    /// A running pass checks `shutdown` before each order, so a stop request
    /// waits for at most one dispatch.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = self.orchestrator.config().sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.pass(Some(&shutdown)).await {
                            tracing::warn!(error = %e, "re-offer sweep failed");
                        }
                        if *shutdown.borrow() {
                            tracing::info!("re-offer sweep stopping");
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("re-offer sweep stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
