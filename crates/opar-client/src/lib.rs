//! Campaign-platform HTTP client: rate-limited fetch + cursor pagination.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "opar-client";

/// Type tag the events endpoint uses for outbound campaign sends.
pub const OUTBOUND_EVENT_TYPE: i64 = 3;

const PAGE_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited on {path} after {attempts} attempts")]
    RateLimited { path: String, attempts: usize },
    #[error("http status {status} for {path}: {body}")]
    HttpStatus {
        status: u16,
        path: String,
        body: String,
    },
    #[error("request for {path} failed: {source}")]
    Request {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("decoding response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Cursor page envelope shared by the campaigns and events endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub next_starting_after: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email_list: Vec<String>,
}

/// One raw item from the events endpoint. Everything is optional; the
/// collector decides what is usable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub lead: Option<String>,
    #[serde(default)]
    pub from_address_email: Option<String>,
    #[serde(default)]
    pub ue_type: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
}

#[async_trait]
pub trait CampaignApi: Send + Sync {
    async fn campaigns_page(
        &self,
        starting_after: Option<&str>,
    ) -> Result<Page<Campaign>, FetchError>;

    async fn emails_page(
        &self,
        starting_after: Option<&str>,
        campaign_id: Option<&str>,
    ) -> Result<Page<EmailEvent>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

#[derive(Debug)]
pub struct CampaignClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    backoff: BackoffPolicy,
}

impl CampaignClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            backoff: config.backoff,
        })
    }

    /// GET `path` with the given query parameters, skipping empty values.
    /// HTTP 429 is retried with exponential backoff up to the retry
    /// ceiling; any other non-2xx fails immediately with the response body
    /// attached.
    pub async fn fetch(
        &self,
        path: &str,
        query: &[(&str, Option<String>)],
    ) -> Result<serde_json::Value, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        let params: Vec<(&str, String)> = query
            .iter()
            .filter_map(|(key, value)| {
                value
                    .as_ref()
                    .filter(|v| !v.is_empty())
                    .map(|v| (*key, v.clone()))
            })
            .collect();

        let span = info_span!("campaign_fetch", path);
        async {
            for attempt in 0..=self.backoff.max_retries {
                let response = self
                    .client
                    .get(&url)
                    .bearer_auth(&self.api_key)
                    .query(&params)
                    .send()
                    .await
                    .map_err(|source| FetchError::Request {
                        path: path.to_string(),
                        source,
                    })?;

                let status = response.status();
                if status == StatusCode::TOO_MANY_REQUESTS {
                    if attempt < self.backoff.max_retries {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(
                            path,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "rate limited, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(FetchError::RateLimited {
                        path: path.to_string(),
                        attempts: attempt + 1,
                    });
                }

                let body = response.text().await.map_err(|source| FetchError::Request {
                    path: path.to_string(),
                    source,
                })?;
                if !status.is_success() {
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        path: path.to_string(),
                        body,
                    });
                }
                return serde_json::from_str(&body).map_err(|source| FetchError::Decode {
                    path: path.to_string(),
                    source,
                });
            }

            Err(FetchError::RateLimited {
                path: path.to_string(),
                attempts: self.backoff.max_retries + 1,
            })
        }
        .instrument(span)
        .await
    }

    async fn fetch_page<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, Option<String>)],
    ) -> Result<Page<T>, FetchError> {
        let value = self.fetch(path, query).await?;
        serde_json::from_value(value).map_err(|source| FetchError::Decode {
            path: path.to_string(),
            source,
        })
    }
}

#[async_trait]
impl CampaignApi for CampaignClient {
    async fn campaigns_page(
        &self,
        starting_after: Option<&str>,
    ) -> Result<Page<Campaign>, FetchError> {
        self.fetch_page(
            "/campaigns",
            &[
                ("limit", Some(PAGE_LIMIT.to_string())),
                ("starting_after", starting_after.map(str::to_string)),
            ],
        )
        .await
    }

    async fn emails_page(
        &self,
        starting_after: Option<&str>,
        campaign_id: Option<&str>,
    ) -> Result<Page<EmailEvent>, FetchError> {
        self.fetch_page(
            "/emails",
            &[
                ("limit", Some(PAGE_LIMIT.to_string())),
                ("starting_after", starting_after.map(str::to_string)),
                ("campaign_id", campaign_id.map(str::to_string)),
            ],
        )
        .await
    }
}
