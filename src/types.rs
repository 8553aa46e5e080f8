use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::AppError;

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

/// One market record as stored in the source of truth. Identity is
/// `market_id` scoped by `source`; `id` is the storage-assigned surrogate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub market_id: String,
    pub source: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: Category,
    #[serde(default)]
    pub end_date: Option<String>,
    pub status: MarketStatus,
    /// Both prices live in [0,1]; yes + no ≈ 1 is expected but not enforced.
    pub yes_price: f64,
    pub no_price: f64,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub liquidity: Option<f64>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

impl Market {
    /// Identity key used by delta/history tracking across snapshots.
    pub fn key(&self) -> &str {
        &self.market_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Active,
    Closed,
    Resolved,
    #[serde(other)]
    Other,
}

impl std::fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MarketStatus::Active => "active",
            MarketStatus::Closed => "closed",
            MarketStatus::Resolved => "resolved",
            MarketStatus::Other => "other",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Sports,
    Weather,
    Crypto,
    Politics,
    Economics,
    #[serde(other)]
    Other,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Category::Sports => "sports",
            Category::Weather => "weather",
            Category::Crypto => "crypto",
            Category::Politics => "politics",
            Category::Economics => "economics",
            Category::Other => "other",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One full, consistent read of all synchronized markets. Immutable once
/// published; the view keeps only the current one.
#[derive(Debug)]
pub struct Snapshot {
    pub markets: Vec<Market>,
    /// Fetch generation that produced this snapshot (per-domain counter).
    pub generation: u64,
    pub fetched_at: Instant,
    /// Millisecond UTC epoch of the fetch, for API responses.
    pub fetched_at_ms: u64,
}

impl Snapshot {
    pub fn market(&self, market_id: &str) -> Option<&Market> {
        self.markets.iter().find(|m| m.market_id == market_id)
    }
}

// ---------------------------------------------------------------------------
// Delta tracking
// ---------------------------------------------------------------------------

/// A single sample in a market's rolling price history.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PriceSample {
    pub yes_price: f64,
    pub no_price: f64,
    pub timestamp_ms: u64,
}

/// Price movement of one market between two consecutive snapshots.
/// Ephemeral — superseded wholesale on the next tick.
#[derive(Debug, Clone, Serialize)]
pub struct PriceChangeEvent {
    pub market_id: String,
    pub old_price: f64,
    pub new_price: f64,
    pub change: f64,
    /// None when the prior price was zero — percent change is undefined
    /// there, and an undefined percent never qualifies as significant.
    pub change_percent: Option<f64>,
    pub timestamp_ms: u64,
    pub is_increasing: bool,
}

// ---------------------------------------------------------------------------
// Auxiliary domain data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub market_id: String,
    pub side: String,
    pub amount: f64,
    pub price: f64,
    #[serde(default)]
    pub created_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Change notifications
// ---------------------------------------------------------------------------

/// Event kind carried by a change notification. `All` is the wildcard used
/// both as a subscription filter and by upstream coalesced notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    Insert,
    Update,
    Delete,
    #[serde(rename = "*")]
    All,
}

impl ChangeEvent {
    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(ChangeEvent::Insert),
            "UPDATE" => Some(ChangeEvent::Update),
            "DELETE" => Some(ChangeEvent::Delete),
            "*" => Some(ChangeEvent::All),
            _ => None,
        }
    }

    /// Whether a notification carrying `event` passes this filter.
    pub fn matches(self, event: ChangeEvent) -> bool {
        self == ChangeEvent::All || event == ChangeEvent::All || self == event
    }
}

impl std::fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeEvent::Insert => "INSERT",
            ChangeEvent::Update => "UPDATE",
            ChangeEvent::Delete => "DELETE",
            ChangeEvent::All => "*",
        };
        write!(f, "{s}")
    }
}

/// One change notification off the realtime feed. Payload bodies are
/// untrusted and deliberately not carried — receipt means "re-read the
/// table", never "apply this diff".
#[derive(Debug, Clone)]
pub struct Notification {
    pub table: String,
    pub event: ChangeEvent,
}

// ---------------------------------------------------------------------------
// Sync domains
// ---------------------------------------------------------------------------

/// Logical data domains the coordinator tracks independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Markets,
    Transactions,
    Profile,
}

impl Domain {
    pub fn for_table(table: &str) -> Option<Self> {
        match table {
            "markets" => Some(Domain::Markets),
            "transactions" => Some(Domain::Transactions),
            "profiles" => Some(Domain::Profile),
            _ => None,
        }
    }

    pub const ALL: [Domain; 3] = [Domain::Markets, Domain::Transactions, Domain::Profile];
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Domain::Markets => "markets",
            Domain::Transactions => "transactions",
            Domain::Profile => "profile",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Channel message types
// ---------------------------------------------------------------------------

/// Why a refresh was requested. Informational — every reason coalesces the
/// same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// A change notification arrived for the domain's table.
    Notification,
    /// A poll tick completed its backend refresh job for this domain.
    PollCompleted,
    /// Initial load on coordinator start.
    Mount,
    /// A reader observed a stale snapshot.
    Revalidate,
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerReason::Notification => "notification",
            TriggerReason::PollCompleted => "poll",
            TriggerReason::Mount => "mount",
            TriggerReason::Revalidate => "revalidate",
        };
        write!(f, "{s}")
    }
}

/// Routed into the sync coordinator from the bus, the poller, and readers.
#[derive(Debug, Clone, Copy)]
pub struct SyncTrigger {
    pub domain: Domain,
    pub reason: TriggerReason,
}

/// Coordinator → fetch runner: begin one read for this domain.
#[derive(Debug, Clone, Copy)]
pub struct FetchCommand {
    pub domain: Domain,
    pub generation: u64,
}

/// Fetch runner → coordinator: the read finished.
#[derive(Debug)]
pub struct FetchOutcome {
    pub domain: Domain,
    pub generation: u64,
    pub result: std::result::Result<FetchPayload, AppError>,
}

#[derive(Debug)]
pub enum FetchPayload {
    Markets(Vec<Market>),
    Transactions(Vec<Transaction>),
    Profile(serde_json::Value),
}
