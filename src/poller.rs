use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::backend::BackendClient;
use crate::types::{Domain, SyncTrigger, TriggerReason};

/// Fixed-interval reliability backstop for the push channel.
///
/// Every tick fires the backend's two bulk refresh jobs concurrently and
/// inspects each result on its own — a failed markets refresh never blocks
/// a successful transactions refresh, and vice versa. A succeeded job marks
/// its domain stale so the coordinator re-reads even if the corresponding
/// change notifications were lost. Failures are logged only; the next tick
/// is the retry.
pub struct PollScheduler {
    backend: Arc<BackendClient>,
    trigger_tx: mpsc::Sender<SyncTrigger>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl PollScheduler {
    pub fn new(
        backend: Arc<BackendClient>,
        trigger_tx: mpsc::Sender<SyncTrigger>,
        interval_secs: u64,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            backend,
            trigger_tx,
            interval: Duration::from_secs(interval_secs),
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        // The first tick of `interval` fires immediately — the initial
        // refresh runs on start, then every interval after.
        let mut ticker = interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "poll scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("poll scheduler stopped");
                        return;
                    }
                    continue;
                }
            }
            self.tick().await;
        }
    }

    async fn tick(&self) {
        debug!("poll tick: firing refresh jobs");
        let (markets_result, transactions_result) = tokio::join!(
            self.backend.refresh_markets(),
            self.backend.refresh_transactions(),
        );

        match markets_result {
            Ok(()) => self.mark_stale(Domain::Markets).await,
            Err(e) => error!("markets refresh job failed: {e}"),
        }
        match transactions_result {
            Ok(()) => self.mark_stale(Domain::Transactions).await,
            Err(e) => error!("transactions refresh job failed: {e}"),
        }
    }

    /// The push channel is best-effort; a completed poll explicitly marks
    /// the domain stale so the coordinator re-fetches without waiting for a
    /// notification that may never come.
    async fn mark_stale(&self, domain: Domain) {
        let trigger = SyncTrigger {
            domain,
            reason: TriggerReason::PollCompleted,
        };
        if let Err(e) = self.trigger_tx.send(trigger).await {
            debug!(domain = %domain, "coordinator gone, dropping poll trigger: {e}");
        }
    }
}
