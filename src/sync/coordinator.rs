use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::api::health::HealthState;
use crate::bus::{ChangeBus, SubscriptionSet};
use crate::config::{ACTIVE_HIGHLIGHT_MS, REALTIME_TABLES};
use crate::delta::DeltaTracker;
use crate::state::ViewState;
use crate::types::{
    ChangeEvent, Domain, FetchCommand, FetchOutcome, FetchPayload, Snapshot, SyncTrigger,
    TriggerReason,
};

/// Fetch lifecycle of one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    FetchPending,
    Fetching,
}

/// Per-domain coalescing state. This flag-pair, not any timer, is the sole
/// concurrency control: one in-flight fetch at a time, and at most one
/// queued re-run no matter how many triggers arrive mid-fetch.
#[derive(Debug)]
struct DomainState {
    state: FetchState,
    rerun_queued: bool,
    generation: u64,
}

impl DomainState {
    fn new() -> Self {
        Self {
            state: FetchState::Idle,
            rerun_queued: false,
            generation: 0,
        }
    }

    /// Record a trigger. Returns true when a fetch should begin now.
    /// Triggers landing in `FetchPending` are absorbed outright; triggers
    /// landing mid-`Fetching` queue exactly one follow-up.
    fn note_trigger(&mut self) -> bool {
        match self.state {
            FetchState::Idle => {
                self.state = FetchState::FetchPending;
                true
            }
            FetchState::FetchPending => false,
            FetchState::Fetching => {
                self.rerun_queued = true;
                false
            }
        }
    }

    /// Begin the read. Returns the generation tag carried by the fetch.
    fn begin_fetch(&mut self) -> u64 {
        self.state = FetchState::Fetching;
        self.generation += 1;
        self.generation
    }

    /// Whether an outcome belongs to the fetch currently in flight.
    fn accepts(&self, generation: u64) -> bool {
        self.state == FetchState::Fetching && generation == self.generation
    }

    /// Finish the current fetch. Returns true when a queued re-run should
    /// start.
    fn note_complete(&mut self) -> bool {
        self.state = FetchState::Idle;
        std::mem::take(&mut self.rerun_queued)
    }
}

/// The reconciliation engine: owns the per-domain state machines, listens
/// to the change bus, debounces bursts into single refreshes, and publishes
/// applied snapshots into the shared view.
pub struct SyncCoordinator {
    view: Arc<ViewState>,
    bus: Arc<ChangeBus>,
    health: Arc<HealthState>,
    trigger_tx: mpsc::Sender<SyncTrigger>,
    trigger_rx: mpsc::Receiver<SyncTrigger>,
    cmd_tx: mpsc::Sender<FetchCommand>,
    outcome_rx: mpsc::Receiver<FetchOutcome>,
    shutdown_rx: watch::Receiver<bool>,
    markets: DomainState,
    transactions: DomainState,
    profile: DomainState,
    tracker: DeltaTracker,
    subscriptions: Option<SubscriptionSet>,
    torn_down: bool,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        view: Arc<ViewState>,
        bus: Arc<ChangeBus>,
        health: Arc<HealthState>,
        trigger_tx: mpsc::Sender<SyncTrigger>,
        trigger_rx: mpsc::Receiver<SyncTrigger>,
        cmd_tx: mpsc::Sender<FetchCommand>,
        outcome_rx: mpsc::Receiver<FetchOutcome>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            view,
            bus,
            health,
            trigger_tx,
            trigger_rx,
            cmd_tx,
            outcome_rx,
            shutdown_rx,
            markets: DomainState::new(),
            transactions: DomainState::new(),
            profile: DomainState::new(),
            tracker: DeltaTracker::new(),
            subscriptions: None,
            torn_down: false,
        }
    }

    pub async fn run(mut self) {
        self.open_subscriptions();

        // Initial mount — load every domain once without waiting for the
        // first poll tick or notification.
        for domain in Domain::ALL {
            self.handle_trigger(SyncTrigger {
                domain,
                reason: TriggerReason::Mount,
            })
            .await;
        }

        loop {
            tokio::select! {
                Some(trigger) = self.trigger_rx.recv() => {
                    self.handle_trigger(trigger).await;
                }
                Some(outcome) = self.outcome_rx.recv() => {
                    self.handle_outcome(outcome).await;
                }
                changed = self.shutdown_rx.changed() => {
                    // A dropped sender means the process is going away too.
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        self.teardown();
                        info!("sync coordinator stopped");
                        return;
                    }
                }
                else => {
                    self.teardown();
                    return;
                }
            }
        }
    }

    /// Open one bus subscription per watched table and forward its
    /// notifications as triggers. The ids are tracked as a set so teardown
    /// releases them together — subscriptions and teardown stay paired.
    fn open_subscriptions(&mut self) {
        let mut set = SubscriptionSet::new(Arc::clone(&self.bus));
        for &table in REALTIME_TABLES {
            let Some(domain) = Domain::for_table(table) else {
                continue;
            };
            let handle = self.bus.subscribe(table, ChangeEvent::All);
            set.track(handle.id);

            let tx = self.trigger_tx.clone();
            let mut rx = handle.rx;
            tokio::spawn(async move {
                // The notification body is untrusted — receipt only means
                // "invalidate and re-read", so the trigger carries nothing.
                while rx.recv().await.is_some() {
                    let trigger = SyncTrigger {
                        domain,
                        reason: TriggerReason::Notification,
                    };
                    if tx.send(trigger).await.is_err() {
                        break;
                    }
                }
            });
        }
        info!(subscriptions = set.len(), "change bus subscriptions opened");
        self.subscriptions = Some(set);
    }

    async fn handle_trigger(&mut self, trigger: SyncTrigger) {
        if self.torn_down {
            return;
        }
        debug!(domain = %trigger.domain, reason = %trigger.reason, "sync trigger");
        if self.domain_mut(trigger.domain).note_trigger() {
            self.dispatch_fetch(trigger.domain).await;
        }
    }

    async fn dispatch_fetch(&mut self, domain: Domain) {
        let generation = self.domain_mut(domain).begin_fetch();
        let cmd = FetchCommand { domain, generation };
        if let Err(e) = self.cmd_tx.send(cmd).await {
            warn!(domain = %domain, "fetch command channel closed: {e}");
            let _ = self.domain_mut(domain).note_complete();
        }
    }

    async fn handle_outcome(&mut self, outcome: FetchOutcome) {
        if self.torn_down {
            debug!(domain = %outcome.domain, "fetch completed after teardown, discarding");
            return;
        }
        if !self.domain(outcome.domain).accepts(outcome.generation) {
            debug!(
                domain = %outcome.domain,
                generation = outcome.generation,
                "stale fetch result discarded"
            );
            return;
        }

        match outcome.result {
            Ok(payload) => self.apply(payload, outcome.generation),
            Err(e) => {
                // Previous snapshot stays visible; the next trigger or poll
                // tick retries naturally.
                warn!(domain = %outcome.domain, "sync fetch failed, previous state retained: {e}");
            }
        }

        if self.domain_mut(outcome.domain).note_complete() {
            debug!(domain = %outcome.domain, "running queued re-fetch");
            let _ = self.domain_mut(outcome.domain).note_trigger();
            self.dispatch_fetch(outcome.domain).await;
        }
    }

    fn apply(&mut self, payload: FetchPayload, generation: u64) {
        match payload {
            FetchPayload::Markets(markets) => {
                let now = now_ms();
                let snapshot = Arc::new(Snapshot {
                    markets,
                    generation,
                    fetched_at: Instant::now(),
                    fetched_at_ms: now,
                });

                let deltas = self.tracker.observe(&snapshot.markets, now);
                if !deltas.active.is_empty() {
                    let epoch = self.view.active.replace(deltas.active.iter().cloned());
                    Arc::clone(&self.view.active)
                        .schedule_clear(epoch, Duration::from_millis(ACTIVE_HIGHLIGHT_MS));
                }

                info!(
                    markets = snapshot.markets.len(),
                    changed = deltas.events.len(),
                    active = deltas.active.len(),
                    "markets snapshot published"
                );
                self.view.publish_markets(snapshot, deltas.events);
                self.health.set_last_sync_at_ms(now);
                self.health.inc_syncs_completed();
            }
            FetchPayload::Transactions(transactions) => {
                debug!(count = transactions.len(), "transactions updated");
                self.view.set_transactions(transactions);
                self.health.inc_syncs_completed();
            }
            FetchPayload::Profile(profile) => {
                self.view.set_profile(profile);
                self.health.inc_syncs_completed();
            }
        }
    }

    /// Release every bus subscription and stop accepting results. Fetches
    /// already in flight finish on their own; their outcomes are discarded
    /// at the top of `handle_outcome`.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(set) = self.subscriptions.take() {
            let released = set.release();
            info!(released, "change bus subscriptions released");
        }
    }

    fn domain(&self, domain: Domain) -> &DomainState {
        match domain {
            Domain::Markets => &self.markets,
            Domain::Transactions => &self.transactions,
            Domain::Profile => &self.profile,
        }
    }

    fn domain_mut(&mut self, domain: Domain) -> &mut DomainState {
        match domain {
            Domain::Markets => &mut self.markets,
            Domain::Transactions => &mut self.transactions,
            Domain::Profile => &mut self.profile,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, Market, MarketStatus};

    fn market(market_id: &str, yes_price: f64) -> Market {
        Market {
            id: format!("row-{market_id}"),
            market_id: market_id.to_string(),
            source: "polymarket".to_string(),
            title: "Test market".to_string(),
            description: None,
            category: Category::Other,
            end_date: None,
            status: MarketStatus::Active,
            yes_price,
            no_price: 1.0 - yes_price,
            volume: None,
            liquidity: None,
            last_updated: None,
        }
    }

    struct Harness {
        coordinator: SyncCoordinator,
        cmd_rx: mpsc::Receiver<FetchCommand>,
    }

    fn harness() -> Harness {
        let (trigger_tx, trigger_rx) = mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (_outcome_tx, outcome_rx) = mpsc::channel(64);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let coordinator = SyncCoordinator::new(
            ViewState::new(),
            ChangeBus::new(),
            Arc::new(HealthState::new()),
            trigger_tx,
            trigger_rx,
            cmd_tx,
            outcome_rx,
            shutdown_rx,
        );
        Harness {
            coordinator,
            cmd_rx,
        }
    }

    fn trigger(domain: Domain) -> SyncTrigger {
        SyncTrigger {
            domain,
            reason: TriggerReason::Notification,
        }
    }

    fn ok_markets(generation: u64, markets: Vec<Market>) -> FetchOutcome {
        FetchOutcome {
            domain: Domain::Markets,
            generation,
            result: Ok(FetchPayload::Markets(markets)),
        }
    }

    #[test]
    fn domain_state_coalesces_triggers() {
        let mut ds = DomainState::new();
        assert!(ds.note_trigger(), "first trigger starts a fetch");
        assert!(!ds.note_trigger(), "trigger while pending is absorbed");
        let generation = ds.begin_fetch();
        assert_eq!(generation, 1);
        // A burst mid-fetch queues exactly one re-run.
        assert!(!ds.note_trigger());
        assert!(!ds.note_trigger());
        assert!(!ds.note_trigger());
        assert!(ds.note_complete(), "one queued re-run");
        assert!(ds.note_trigger());
        let generation = ds.begin_fetch();
        assert_eq!(generation, 2);
        assert!(!ds.note_complete(), "no further re-run queued");
    }

    #[tokio::test]
    async fn trigger_dispatches_one_fetch_command() {
        let mut h = harness();
        h.coordinator.handle_trigger(trigger(Domain::Markets)).await;

        let cmd = h.cmd_rx.try_recv().expect("fetch command expected");
        assert_eq!(cmd.domain, Domain::Markets);
        assert_eq!(cmd.generation, 1);
        assert!(h.cmd_rx.try_recv().is_err(), "exactly one command");
    }

    #[tokio::test]
    async fn notification_burst_coalesces_into_single_refetch() {
        let mut h = harness();
        h.coordinator.handle_trigger(trigger(Domain::Markets)).await;
        let first = h.cmd_rx.try_recv().expect("first fetch");

        // A burst of notifications while the fetch is in flight.
        for _ in 0..5 {
            h.coordinator.handle_trigger(trigger(Domain::Markets)).await;
        }
        assert!(h.cmd_rx.try_recv().is_err(), "burst must not stack fetches");

        h.coordinator
            .handle_outcome(ok_markets(first.generation, vec![market("m1", 0.4)]))
            .await;

        let rerun = h.cmd_rx.try_recv().expect("exactly one follow-up fetch");
        assert_eq!(rerun.generation, 2);
        assert!(h.cmd_rx.try_recv().is_err());

        // Completing the follow-up quiesces the domain.
        h.coordinator
            .handle_outcome(ok_markets(rerun.generation, vec![market("m1", 0.4)]))
            .await;
        assert!(h.cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn successful_outcome_publishes_snapshot() {
        let mut h = harness();
        h.coordinator.handle_trigger(trigger(Domain::Markets)).await;
        let cmd = h.cmd_rx.try_recv().expect("fetch command");

        h.coordinator
            .handle_outcome(ok_markets(cmd.generation, vec![market("m1", 0.4)]))
            .await;

        let snapshot = h
            .coordinator
            .view
            .latest_snapshot()
            .expect("snapshot published");
        assert_eq!(snapshot.markets.len(), 1);
        assert_eq!(h.coordinator.health.syncs_completed(), 1);
    }

    #[tokio::test]
    async fn failed_outcome_retains_previous_snapshot() {
        let mut h = harness();
        h.coordinator.handle_trigger(trigger(Domain::Markets)).await;
        let cmd = h.cmd_rx.try_recv().expect("fetch command");
        h.coordinator
            .handle_outcome(ok_markets(cmd.generation, vec![market("m1", 0.4)]))
            .await;

        h.coordinator.handle_trigger(trigger(Domain::Markets)).await;
        let cmd = h.cmd_rx.try_recv().expect("second fetch");
        h.coordinator
            .handle_outcome(FetchOutcome {
                domain: Domain::Markets,
                generation: cmd.generation,
                result: Err(crate::error::AppError::Upstream {
                    status: 502,
                    message: "backend down".to_string(),
                }),
            })
            .await;

        let snapshot = h.coordinator.view.latest_snapshot().expect("still present");
        assert_eq!(snapshot.generation, 1, "failed fetch applied nothing");
    }

    #[tokio::test]
    async fn stale_generation_outcome_is_discarded() {
        let mut h = harness();
        h.coordinator.handle_trigger(trigger(Domain::Markets)).await;
        let cmd = h.cmd_rx.try_recv().expect("fetch command");

        h.coordinator
            .handle_outcome(ok_markets(cmd.generation + 7, vec![market("m1", 0.4)]))
            .await;
        assert!(h.coordinator.view.latest_snapshot().is_none());
        assert_eq!(
            h.coordinator.domain(Domain::Markets).state,
            FetchState::Fetching,
            "real fetch still in flight"
        );
    }

    #[tokio::test]
    async fn teardown_discards_inflight_result_and_releases_subscriptions() {
        let mut h = harness();
        h.coordinator.open_subscriptions();
        assert_eq!(h.coordinator.bus.subscription_count(), 3);

        h.coordinator.handle_trigger(trigger(Domain::Markets)).await;
        let cmd = h.cmd_rx.try_recv().expect("fetch command");

        h.coordinator.teardown();
        assert_eq!(h.coordinator.bus.subscription_count(), 0);

        // The in-flight fetch completes after teardown — nothing may apply.
        h.coordinator
            .handle_outcome(ok_markets(cmd.generation, vec![market("m1", 0.4)]))
            .await;
        assert!(h.coordinator.view.latest_snapshot().is_none());

        // Nor may fresh triggers restart fetches.
        h.coordinator.handle_trigger(trigger(Domain::Markets)).await;
        assert!(h.cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn domains_fetch_independently_and_apply_in_completion_order() {
        let mut h = harness();
        h.coordinator.handle_trigger(trigger(Domain::Markets)).await;
        h.coordinator
            .handle_trigger(trigger(Domain::Transactions))
            .await;
        let markets_cmd = h.cmd_rx.try_recv().expect("markets fetch");
        let tx_cmd = h.cmd_rx.try_recv().expect("transactions fetch");

        // The later-started transactions fetch completes first and applies.
        h.coordinator
            .handle_outcome(FetchOutcome {
                domain: Domain::Transactions,
                generation: tx_cmd.generation,
                result: Ok(FetchPayload::Transactions(vec![])),
            })
            .await;
        assert_eq!(h.coordinator.health.syncs_completed(), 1);

        h.coordinator
            .handle_outcome(ok_markets(markets_cmd.generation, vec![market("m1", 0.4)]))
            .await;
        assert_eq!(h.coordinator.health.syncs_completed(), 2);
    }
}
