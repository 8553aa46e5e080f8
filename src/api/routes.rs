use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::api::health::HealthState;
use crate::api::latency::SyncLatency;
use crate::config::{MAX_READ_LIMIT, PROXY_CACHE_MAX_AGE_SECS, SNAPSHOT_FRESH_SECS};
use crate::error::AppError;
use crate::history::Sparkline;
use crate::state::{Freshness, ViewState};
use crate::types::{Domain, Market, PriceChangeEvent, SyncTrigger, Transaction, TriggerReason};

#[derive(Clone)]
pub struct ApiState {
    pub view: Arc<ViewState>,
    pub health: Arc<HealthState>,
    pub latency: Arc<SyncLatency>,
    pub trigger_tx: mpsc::Sender<SyncTrigger>,
    pub proxy_client: reqwest::Client,
    pub proxy_allowed_hosts: Arc<Vec<String>>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/markets", get(get_markets))
        .route("/markets/:id", get(get_market))
        .route("/markets/:id/sparkline", get(get_sparkline))
        .route("/changes", get(get_changes))
        .route("/transactions", get(get_transactions))
        .route("/profile", get(get_profile))
        .route("/proxy", get(proxy_passthrough))
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct MarketsQuery {
    pub source: Option<String>,
    pub category: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct ProxyQuery {
    pub url: Option<String>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct MarketsResponse {
    pub markets: Vec<Market>,
    pub fetched_at_ms: Option<u64>,
    /// False until the first successful sync has published a snapshot.
    pub synced: bool,
    pub stale: bool,
}

#[derive(Serialize)]
pub struct ChangesResponse {
    pub events: Vec<PriceChangeEvent>,
    pub active: Vec<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub bus_connected: bool,
    pub last_sync_at_ms: u64,
    pub syncs_completed: u64,
    pub markets: usize,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Serves the synchronized view. A stale snapshot is returned immediately
/// while a background revalidation is enqueued — readers never wait on a
/// fetch.
async fn get_markets(
    State(state): State<ApiState>,
    Query(params): Query<MarketsQuery>,
) -> Json<MarketsResponse> {
    let freshness = state
        .view
        .freshness(Duration::from_secs(SNAPSHOT_FRESH_SECS));
    if freshness != Freshness::Fresh {
        let trigger = SyncTrigger {
            domain: Domain::Markets,
            reason: TriggerReason::Revalidate,
        };
        if state.trigger_tx.try_send(trigger).is_err() {
            debug!("trigger channel full, revalidation already pending");
        }
    }

    let limit = params.limit.unwrap_or(MAX_READ_LIMIT).min(MAX_READ_LIMIT);
    let snapshot = state.view.latest_snapshot();
    let markets = snapshot
        .as_ref()
        .map(|s| {
            s.markets
                .iter()
                .filter(|m| params.source.as_ref().map_or(true, |src| &m.source == src))
                .filter(|m| {
                    params
                        .category
                        .as_ref()
                        .map_or(true, |c| m.category.to_string() == *c)
                })
                .take(limit)
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    Json(MarketsResponse {
        markets,
        fetched_at_ms: snapshot.as_ref().map(|s| s.fetched_at_ms),
        synced: snapshot.is_some(),
        stale: freshness == Freshness::Stale,
    })
}

async fn get_market(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Market>, AppError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(AppError::Validation("market id is required".to_string()));
    }
    state
        .view
        .market(id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("market {id} not in latest snapshot")))
}

async fn get_sparkline(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Sparkline>, AppError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(AppError::Validation("market id is required".to_string()));
    }
    state
        .view
        .sparkline(id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no price history for market {id}")))
}

async fn get_changes(State(state): State<ApiState>) -> Json<ChangesResponse> {
    Json(ChangesResponse {
        events: state.view.changes(),
        active: state.view.active.ids(),
    })
}

async fn get_transactions(State(state): State<ApiState>) -> Json<Vec<Transaction>> {
    Json(state.view.transactions())
}

async fn get_profile(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .view
        .profile()
        .map(Json)
        .ok_or_else(|| AppError::NotFound("profile not synced yet".to_string()))
}

/// Forwards a GET to an allow-listed external host and relays the upstream
/// response verbatim. Exists so browser clients can reach aggregators that
/// do not send CORS headers; it carries no sync logic.
async fn proxy_passthrough(
    State(state): State<ApiState>,
    Query(params): Query<ProxyQuery>,
) -> Result<Response, AppError> {
    let Some(target) = params.url else {
        return Err(AppError::Validation("url parameter is required".to_string()));
    };
    let parsed = reqwest::Url::parse(&target)
        .map_err(|_| AppError::Validation(format!("invalid url: {target}")))?;
    let Some(host) = parsed.host_str() else {
        return Err(AppError::Validation("url has no host".to_string()));
    };
    if !host_allowed(host, &state.proxy_allowed_hosts) {
        return Ok((StatusCode::FORBIDDEN, format!("host not allow-listed: {host}"))
            .into_response());
    }

    let upstream = state.proxy_client.get(parsed).send().await?;
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let body = upstream.bytes().await?;

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type);
    if status.is_success() {
        builder = builder.header(
            header::CACHE_CONTROL,
            format!("public, max-age={PROXY_CACHE_MAX_AGE_SECS}"),
        );
    }
    builder
        .body(axum::body::Body::from(body))
        .map_err(|e| AppError::Config(format!("proxy response build failed: {e}")))
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        bus_connected: state.health.bus_connected(),
        last_sync_at_ms: state.health.last_sync_at_ms(),
        syncs_completed: state.health.syncs_completed(),
        markets: state.view.market_count(),
    })
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<serde_json::Value> {
    match state.latency.percentiles() {
        Some(p) => Json(serde_json::json!({
            "samples": state.latency.len(),
            "p50_ms": p.p50_ms,
            "p95_ms": p.p95_ms,
            "p99_ms": p.p99_ms,
        })),
        None => Json(serde_json::json!({
            "samples": 0,
            "p50_ms": null,
            "p95_ms": null,
            "p99_ms": null,
        })),
    }
}

/// Exact match or subdomain of an allow-listed host.
fn host_allowed(host: &str, allowed: &[String]) -> bool {
    allowed
        .iter()
        .any(|a| host == a || host.ends_with(&format!(".{a}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist(hosts: &[&str]) -> Vec<String> {
        hosts.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn exact_host_is_allowed() {
        let allowed = allowlist(&["api.coingecko.com"]);
        assert!(host_allowed("api.coingecko.com", &allowed));
    }

    #[test]
    fn subdomain_of_allowed_host_is_allowed() {
        let allowed = allowlist(&["coingecko.com"]);
        assert!(host_allowed("api.coingecko.com", &allowed));
    }

    #[test]
    fn unlisted_host_is_rejected() {
        let allowed = allowlist(&["api.coingecko.com"]);
        assert!(!host_allowed("evil.example.com", &allowed));
    }

    #[test]
    fn suffix_lookalike_is_rejected() {
        let allowed = allowlist(&["coingecko.com"]);
        assert!(!host_allowed("notcoingecko.com", &allowed));
        assert!(!host_allowed("coingecko.com.evil.example", &allowed));
    }

    #[test]
    fn empty_allowlist_rejects_everything() {
        assert!(!host_allowed("api.coingecko.com", &[]));
    }
}
