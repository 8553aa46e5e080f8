use crate::error::{AppError, Result};

pub const BACKEND_API_URL: &str = "http://localhost:8787";
pub const REALTIME_WS_URL: &str = "ws://localhost:8787/realtime/v1";

/// Tables watched on the realtime channel. Each maps to a sync domain
/// (see `Domain::for_table`).
pub const REALTIME_TABLES: &[&str] = &["markets", "transactions", "profiles"];

/// Heartbeat ping interval (seconds).
pub const WS_PING_INTERVAL_SECS: u64 = 30;

/// Reconnect backoff values in milliseconds.
pub const RECONNECT_BACKOFF_MS: &[u64] = &[100, 200, 400, 800];

/// Channel capacity for internal message routing.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Hard cap on the number of markets a single read query returns.
/// The backend clamps server-side; the client clamps before asking.
pub const MAX_READ_LIMIT: usize = 50;

/// Snapshots younger than this are served without revalidation; older ones
/// are served stale while a background refresh is triggered.
pub const SNAPSHOT_FRESH_SECS: u64 = 5;

/// A price move whose percent magnitude exceeds this marks the market active.
pub const ACTIVE_CHANGE_THRESHOLD_PCT: f64 = 0.5;

/// How long a market stays in the active set after a significant move.
pub const ACTIVE_HIGHLIGHT_MS: u64 = 3000;

/// Per-market price history window: oldest sample evicted past this count.
pub const HISTORY_WINDOW_CAP: usize = 10;

/// Sparkline drawing box.
pub const SPARKLINE_WIDTH: f64 = 100.0;
pub const SPARKLINE_HEIGHT: f64 = 24.0;

/// Substituted for the price range when a window is perfectly flat.
pub const PRICE_RANGE_EPSILON: f64 = 1e-4;

/// Cache lifetime advertised on proxied upstream responses (seconds).
pub const PROXY_CACHE_MAX_AGE_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub backend_api_url: String,
    pub realtime_ws_url: String,
    pub log_level: String,
    pub api_port: u16,
    /// Seconds between bulk refresh ticks (POLL_INTERVAL_SECS).
    pub poll_interval_secs: u64,
    /// Restrict the synchronized view to one source (SYNC_SOURCE).
    pub source_filter: Option<String>,
    /// Restrict the synchronized view to one category (SYNC_CATEGORY).
    pub category_filter: Option<String>,
    /// Hosts the proxy pass-through will forward to (PROXY_ALLOWED_HOSTS,
    /// comma-separated). Example: "api.coingecko.com,clob.polymarket.com"
    pub proxy_allowed_hosts: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            backend_api_url: std::env::var("BACKEND_API_URL")
                .unwrap_or_else(|_| BACKEND_API_URL.to_string()),
            realtime_ws_url: std::env::var("REALTIME_WS_URL")
                .unwrap_or_else(|_| REALTIME_WS_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            poll_interval_secs: std::env::var("POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse::<u64>()
                .unwrap_or(60),
            source_filter: std::env::var("SYNC_SOURCE").ok().filter(|s| !s.is_empty()),
            category_filter: std::env::var("SYNC_CATEGORY").ok().filter(|s| !s.is_empty()),
            proxy_allowed_hosts: std::env::var("PROXY_ALLOWED_HOSTS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}
