use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tracing::debug;

use crate::config::ACTIVE_CHANGE_THRESHOLD_PCT;
use crate::types::{Market, PriceChangeEvent};

/// Everything one reconciliation tick produced: the per-market change
/// events (only markets whose price moved) and the ids whose move was
/// significant enough to highlight.
#[derive(Debug, Default)]
pub struct TickDeltas {
    pub events: HashMap<String, PriceChangeEvent>,
    pub active: HashSet<String>,
}

/// Computes per-market price deltas between consecutive snapshots.
///
/// The prior-price memory is keyed by market id and owned here — it
/// survives snapshot replacement, so a market absent for a tick still
/// diffs against its last observed price when it returns.
pub struct DeltaTracker {
    prior: HashMap<String, f64>,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self {
            prior: HashMap::new(),
        }
    }

    /// Fold one fresh snapshot into the tracker.
    ///
    /// First observation of a market records its price and emits nothing.
    /// An unchanged price emits nothing. A prior price of zero emits the
    /// event with `change_percent: None` — the percent is undefined and by
    /// convention never significant. The prior memory is overwritten for
    /// every market present, whether or not an event fired.
    pub fn observe(&mut self, markets: &[Market], now_ms: u64) -> TickDeltas {
        let mut deltas = TickDeltas::default();

        for market in markets {
            let new_price = market.yes_price;
            let previous = self.prior.insert(market.key().to_string(), new_price);
            let Some(old_price) = previous else {
                continue;
            };

            let change = new_price - old_price;
            if change == 0.0 {
                continue;
            }

            let change_percent = if old_price == 0.0 {
                None
            } else {
                Some(change / old_price * 100.0)
            };

            if let Some(pct) = change_percent {
                if pct.abs() > ACTIVE_CHANGE_THRESHOLD_PCT {
                    deltas.active.insert(market.key().to_string());
                }
            }

            deltas.events.insert(
                market.key().to_string(),
                PriceChangeEvent {
                    market_id: market.key().to_string(),
                    old_price,
                    new_price,
                    change,
                    change_percent,
                    timestamp_ms: now_ms,
                    is_increasing: change > 0.0,
                },
            );
        }

        debug!(
            changed = deltas.events.len(),
            active = deltas.active.len(),
            tracked = self.prior.len(),
            "delta tick complete"
        );
        deltas
    }

    pub fn tracked_count(&self) -> usize {
        self.prior.len()
    }
}

impl Default for DeltaTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ActiveSet
// ---------------------------------------------------------------------------

/// Time-boxed set of market ids that just underwent a significant move.
///
/// Each non-empty replacement bumps the epoch, and the matching scheduled
/// clear only fires if its epoch is still current — a newer tick's
/// highlight is never wiped by an older tick's timer. Expiry is a
/// scheduled clear, not a check on read.
pub struct ActiveSet {
    ids: DashSet<String>,
    epoch: AtomicU64,
}

impl ActiveSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ids: DashSet::new(),
            epoch: AtomicU64::new(0),
        })
    }

    /// Replace the membership and return the new epoch to schedule a clear
    /// against.
    pub fn replace<I>(&self, ids: I) -> u64
    where
        I: IntoIterator<Item = String>,
    {
        self.ids.clear();
        for id in ids {
            self.ids.insert(id);
        }
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn clear_if_epoch(&self, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.ids.clear();
        }
    }

    /// Schedule the highlight expiry for the given epoch.
    pub fn schedule_clear(self: Arc<Self>, epoch: u64, after: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            self.clear_if_epoch(epoch);
        });
    }

    pub fn contains(&self, market_id: &str) -> bool {
        self.ids.contains(market_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.ids.iter().map(|r| r.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
