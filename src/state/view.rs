use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;

use crate::delta::ActiveSet;
use crate::history::{HistorySummarizer, Sparkline};
use crate::types::{Market, PriceChangeEvent, Snapshot, Transaction};

/// Age classification of the published snapshot against the freshness
/// threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Nothing published yet.
    Empty,
    Fresh,
    Stale,
}

/// The published side of the synchronization: what readers (API handlers)
/// see. Written only by the sync coordinator; the coordinator's teardown
/// guard is what keeps late fetches from ever reaching this.
pub struct ViewState {
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    /// Latest tick's change events, keyed by market id. Replaced wholesale
    /// each tick.
    changes: DashMap<String, PriceChangeEvent>,
    pub active: Arc<ActiveSet>,
    history: Mutex<HistorySummarizer>,
    transactions: RwLock<Vec<Transaction>>,
    profile: RwLock<Option<serde_json::Value>>,
}

impl ViewState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(None),
            changes: DashMap::new(),
            active: ActiveSet::new(),
            history: Mutex::new(HistorySummarizer::new()),
            transactions: RwLock::new(Vec::new()),
            profile: RwLock::new(None),
        })
    }

    /// Publish a fresh markets snapshot along with the tick's change
    /// events, and fold the new samples into the history windows.
    pub fn publish_markets(
        &self,
        snapshot: Arc<Snapshot>,
        events: HashMap<String, PriceChangeEvent>,
    ) {
        if let Ok(mut history) = self.history.lock() {
            history.record(&snapshot.markets, snapshot.fetched_at_ms);
        }
        self.changes.clear();
        for (id, event) in events {
            self.changes.insert(id, event);
        }
        if let Ok(mut current) = self.snapshot.write() {
            *current = Some(snapshot);
        }
    }

    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.read().ok().and_then(|g| g.clone())
    }

    pub fn freshness(&self, max_age: Duration) -> Freshness {
        match self.latest_snapshot() {
            None => Freshness::Empty,
            Some(s) if s.fetched_at.elapsed() <= max_age => Freshness::Fresh,
            Some(_) => Freshness::Stale,
        }
    }

    pub fn market(&self, market_id: &str) -> Option<Market> {
        self.latest_snapshot()?.market(market_id).cloned()
    }

    pub fn market_count(&self) -> usize {
        self.latest_snapshot().map_or(0, |s| s.markets.len())
    }

    pub fn changes(&self) -> Vec<PriceChangeEvent> {
        self.changes.iter().map(|e| e.value().clone()).collect()
    }

    pub fn sparkline(&self, market_id: &str) -> Option<Sparkline> {
        self.history
            .lock()
            .ok()
            .and_then(|h| h.sparkline(market_id))
    }

    pub fn set_transactions(&self, transactions: Vec<Transaction>) {
        if let Ok(mut current) = self.transactions.write() {
            *current = transactions;
        }
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions
            .read()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    pub fn set_profile(&self, profile: serde_json::Value) {
        if let Ok(mut current) = self.profile.write() {
            *current = Some(profile);
        }
    }

    pub fn profile(&self) -> Option<serde_json::Value> {
        self.profile.read().ok().and_then(|p| p.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, MarketStatus};
    use std::time::Instant;

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

    fn snapshot_at(markets: Vec<Market>, fetched_at: Instant) -> Arc<Snapshot> {
        Arc::new(Snapshot {
            markets,
            generation: 1,
            fetched_at,
            fetched_at_ms: 1_000,
        })
    }

    #[tokio::test]
    async fn publish_replaces_snapshot_and_changes() {
        let view = ViewState::new();
        assert_eq!(view.freshness(Duration::from_secs(5)), Freshness::Empty);

        view.publish_markets(
            snapshot_at(vec![market("m1", 0.4)], Instant::now()),
            HashMap::new(),
        );
        assert_eq!(view.market_count(), 1);
        assert_eq!(view.freshness(Duration::from_secs(5)), Freshness::Fresh);
        assert!(view.market("m1").is_some());
        assert!(view.market("m2").is_none());
    }

    #[tokio::test]
    async fn old_snapshot_classifies_stale() {
        let view = ViewState::new();
        let old = Instant::now()
            .checked_sub(Duration::from_secs(6))
            .expect("clock has history");
        view.publish_markets(snapshot_at(vec![market("m1", 0.4)], old), HashMap::new());
        assert_eq!(view.freshness(Duration::from_secs(5)), Freshness::Stale);
    }

    #[tokio::test]
    async fn publish_folds_history_windows() {
        let view = ViewState::new();
        view.publish_markets(
            snapshot_at(vec![market("m1", 0.4)], Instant::now()),
            HashMap::new(),
        );
        view.publish_markets(
            snapshot_at(vec![market("m1", 0.5)], Instant::now()),
            HashMap::new(),
        );
        let spark = view.sparkline("m1").expect("sparkline expected");
        assert_eq!(spark.samples, 2);
        assert!(spark.is_positive);
    }
}
