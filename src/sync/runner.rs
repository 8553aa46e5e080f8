use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::debug;

use crate::api::latency::SyncLatency;
use crate::backend::{BackendClient, MarketQuery};
use crate::types::{Domain, FetchCommand, FetchOutcome, FetchPayload};

/// Turns the coordinator's fetch commands into backend reads.
///
/// Runs as a dedicated task so the coordinator never blocks on I/O; each
/// command is executed on its own spawned task, so reads for different
/// domains proceed independently. The coordinator's state machine is what
/// guarantees at most one command per domain is ever outstanding.
pub struct FetchRunner {
    backend: Arc<BackendClient>,
    query: MarketQuery,
    cmd_rx: mpsc::Receiver<FetchCommand>,
    outcome_tx: mpsc::Sender<FetchOutcome>,
    latency: Arc<SyncLatency>,
}

impl FetchRunner {
    pub fn new(
        backend: Arc<BackendClient>,
        query: MarketQuery,
        cmd_rx: mpsc::Receiver<FetchCommand>,
        outcome_tx: mpsc::Sender<FetchOutcome>,
        latency: Arc<SyncLatency>,
    ) -> Self {
        Self {
            backend,
            query,
            cmd_rx,
            outcome_tx,
            latency,
        }
    }

    pub async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            let backend = Arc::clone(&self.backend);
            let query = self.query.clone();
            let outcome_tx = self.outcome_tx.clone();
            let latency = Arc::clone(&self.latency);

            tokio::spawn(async move {
                let result = match cmd.domain {
                    Domain::Markets => {
                        let started = Instant::now();
                        let result = backend
                            .list_markets(&query)
                            .await
                            .map(FetchPayload::Markets);
                        if result.is_ok() {
                            latency.record(started.elapsed());
                        }
                        result
                    }
                    Domain::Transactions => backend
                        .list_transactions()
                        .await
                        .map(FetchPayload::Transactions),
                    Domain::Profile => {
                        backend.fetch_profile().await.map(FetchPayload::Profile)
                    }
                };

                let outcome = FetchOutcome {
                    domain: cmd.domain,
                    generation: cmd.generation,
                    result,
                };
                if outcome_tx.send(outcome).await.is_err() {
                    debug!(domain = %cmd.domain, "coordinator gone, dropping fetch outcome");
                }
            });
        }
    }
}
