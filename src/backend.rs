use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::config::MAX_READ_LIMIT;
use crate::error::{AppError, Result};
use crate::types::{Market, Transaction};

/// Query shape accepted by the backend's bulk market read.
#[derive(Debug, Clone, Default)]
pub struct MarketQuery {
    pub source: Option<String>,
    pub category: Option<String>,
    pub limit: Option<usize>,
}

impl MarketQuery {
    /// The backend clamps `limit` server-side to `MAX_READ_LIMIT` regardless
    /// of what is requested; clamp here too so the request states what it
    /// will actually get.
    pub fn clamped_limit(&self) -> usize {
        self.limit.unwrap_or(MAX_READ_LIMIT).min(MAX_READ_LIMIT)
    }
}

#[derive(Debug, Deserialize)]
struct MarketsEnvelope {
    markets: Vec<Market>,
}

#[derive(Debug, Deserialize)]
struct TransactionsEnvelope {
    transactions: Vec<Transaction>,
}

/// HTTP client for the backend — bulk reads and the fire-and-forget
/// refresh jobs that make the backend re-ingest from the external
/// aggregator.
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn list_markets(&self, query: &MarketQuery) -> Result<Vec<Market>> {
        let mut url = format!("{}/markets?limit={}", self.base_url, query.clamped_limit());
        if let Some(source) = &query.source {
            url.push_str(&format!("&source={source}"));
        }
        if let Some(category) = &query.category {
            url.push_str(&format!("&category={category}"));
        }

        let resp = self.http.get(&url).send().await?;
        let resp = check_status(resp).await?;
        let envelope: MarketsEnvelope = resp.json().await?;
        debug!(count = envelope.markets.len(), "markets read complete");
        Ok(envelope.markets)
    }

    pub async fn list_transactions(&self) -> Result<Vec<Transaction>> {
        let url = format!("{}/transactions?limit={}", self.base_url, MAX_READ_LIMIT);
        let resp = self.http.get(&url).send().await?;
        let resp = check_status(resp).await?;
        let envelope: TransactionsEnvelope = resp.json().await?;
        Ok(envelope.transactions)
    }

    pub async fn fetch_profile(&self) -> Result<serde_json::Value> {
        let url = format!("{}/profile", self.base_url);
        let resp = self.http.get(&url).send().await?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await?)
    }

    /// Kick the backend's bulk market ingestion job. The job itself is a
    /// black box — it eventually writes rows into the source of truth and
    /// the change feed announces them.
    pub async fn refresh_markets(&self) -> Result<()> {
        self.run_job("refresh-markets").await
    }

    pub async fn refresh_transactions(&self) -> Result<()> {
        self.run_job("refresh-transactions").await
    }

    async fn run_job(&self, job: &str) -> Result<()> {
        let url = format!("{}/jobs/{job}", self.base_url);
        let resp = self.http.post(&url).send().await?;
        check_status(resp).await?;
        Ok(())
    }
}

/// Map a non-2xx backend response to a typed upstream failure, keeping a
/// bounded slice of the body for the log line.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = body.chars().take(200).collect();
    Err(AppError::Upstream {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_clamped_to_maximum() {
        let q = MarketQuery {
            limit: Some(500),
            ..Default::default()
        };
        assert_eq!(q.clamped_limit(), MAX_READ_LIMIT);
    }

    #[test]
    fn limit_below_maximum_passes_through() {
        let q = MarketQuery {
            limit: Some(10),
            ..Default::default()
        };
        assert_eq!(q.clamped_limit(), 10);
    }

    #[test]
    fn missing_limit_defaults_to_maximum() {
        let q = MarketQuery::default();
        assert_eq!(q.clamped_limit(), MAX_READ_LIMIT);
    }
}
