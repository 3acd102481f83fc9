//! HTTP client for the leaderboard API
//!
//! This client handles the transport concerns of the upstream API:
//! - Bearer authentication and request timeouts
//! - Retry with exponential backoff for transport errors and 5xx responses
//! - Decoding of the quota block the server attaches to every response
//! - Mapping of error statuses onto the crate error taxonomy
//!
//! Rate-limit responses are never retried here; they surface to the caller.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};

use super::{Dataset, LeaderboardApi, Page, PageRequest};
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::models::{BuildRecord, RankingRecord, RateLimitInfo, Record, ReportRecord, WorkUnit};
use crate::ratelimit::retry::{with_retry, RetryPolicy};
use crate::ratelimit::RateLimitGovernor;

/// Quota block as the API reports it
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRateLimit {
    limit_per_hour: f64,
    points_spent_this_hour: f64,
    points_reset_in: u64,
}

impl WireRateLimit {
    fn into_info(self) -> RateLimitInfo {
        let reset_in = self.points_reset_in;
        RateLimitInfo {
            remaining_points: (self.limit_per_hour - self.points_spent_this_hour).max(0.0),
            points_per_hour: self.limit_per_hour,
            reset_in_secs: reset_in,
            next_refresh: Utc::now() + chrono::Duration::seconds(reset_in as i64),
        }
    }
}

/// Response envelope
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    data: Vec<serde_json::Value>,
    #[serde(default)]
    rate_limit: Option<WireRateLimit>,
    #[serde(default)]
    error: Option<String>,
}

/// reqwest-backed [`LeaderboardApi`]
pub struct HttpLeaderboardClient {
    client: Client,
    base_url: String,
    api_token: Option<String>,
    retry: RetryPolicy,
}

impl HttpLeaderboardClient {
    /// Create a client from configuration
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .gzip(true)
            .user_agent(format!("ranksync/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            retry: RetryPolicy::with_delays(config.max_request_retries + 1, 500, 10_000),
        })
    }

    /// Create a client against an explicit base URL
    pub fn with_base_url(base_url: &str, max_request_retries: u32) -> Result<Self> {
        let config = ApiConfig {
            base_url: base_url.to_string(),
            api_token: None,
            requests_per_second: 100,
            request_timeout_secs: 10,
            page_size: 100,
            max_request_retries,
        };
        Self::new(&config)
    }

    /// Override the per-request retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn query_params(request: &PageRequest) -> Vec<(&'static str, String)> {
        let mut params = match &request.unit {
            WorkUnit::Leaderboard {
                season,
                region,
                dungeon,
            } => vec![
                ("season", season.clone()),
                ("region", region.clone()),
                ("dungeon", dungeon.to_string()),
            ],
            WorkUnit::SpecDungeon { spec, dungeon } => {
                vec![("spec", spec.clone()), ("dungeon", dungeon.to_string())]
            }
        };
        params.push(("page", request.page.to_string()));
        params.push(("limit", request.page_size.to_string()));
        params
    }

    fn decode_records(dataset: Dataset, data: Vec<serde_json::Value>) -> Result<Vec<Record>> {
        data.into_iter()
            .map(|value| -> Result<Record> {
                let record = match dataset {
                    Dataset::Rankings => {
                        Record::Ranking(serde_json::from_value::<RankingRecord>(value)?)
                    }
                    Dataset::Reports => {
                        Record::Report(serde_json::from_value::<ReportRecord>(value)?)
                    }
                    Dataset::Builds => Record::Build(serde_json::from_value::<BuildRecord>(value)?),
                };
                Ok(record)
            })
            .collect()
    }

    async fn fetch_once(&self, request: &PageRequest) -> Result<Page> {
        let url = format!("{}/{}", self.base_url, request.dataset.as_str());
        let started = Instant::now();

        let mut builder = self.client.get(&url).query(&Self::query_params(request));
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                Error::Network(e.to_string())
            } else {
                Error::Http(e)
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        crate::metrics::record_api_request(
            request.dataset.as_str(),
            status,
            started.elapsed().as_secs_f64(),
        );

        let envelope: Option<Envelope> = serde_json::from_str(&body).ok();

        if !(200..300).contains(&status) {
            let (message, info) = match envelope {
                Some(env) => (
                    env.error.unwrap_or_else(|| format!("status {status}")),
                    env.rate_limit.map(WireRateLimit::into_info),
                ),
                None => (format!("status {status}"), None),
            };
            tracing::debug!(url = %url, status, message = %message, "API request failed");
            return Err(RateLimitGovernor::classify_status(status, message, info));
        }

        let envelope = match envelope {
            Some(env) => env,
            None => serde_json::from_str::<Envelope>(&body)?,
        };

        let records = Self::decode_records(request.dataset, envelope.data)?;

        tracing::debug!(
            dataset = %request.dataset,
            unit = %request.unit,
            page = request.page,
            records = records.len(),
            "Fetched page"
        );

        Ok(Page {
            records,
            rate_limit: envelope.rate_limit.map(WireRateLimit::into_info),
        })
    }
}

#[async_trait]
impl LeaderboardApi for HttpLeaderboardClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        with_retry(&self.retry, || self.fetch_once(request)).await
    }
}
