//! Subgraph client for Uniswap-style swap queries.
//!
//! ## Query
//!
//! ```graphql
//! swaps(where: {timestamp_lte: T, pool_in: [...]}, first: 1000,
//!       orderBy: timestamp, orderDirection: desc) { ... }
//! ```
//!
//! ## Response
//!
//! `{"data": {"swaps": [...]}}`. A GraphQL `errors` array or a missing
//! `data.swaps` list is treated as a malformed response.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use swapshard_core::config::SubgraphConfig;
use swapshard_core::{Error, Result, SwapPayload, TimestampSecs, PAGE_SIZE};
use tracing::debug;

use crate::retry::ExponentialBackoff;

/// A remote source of swap pages.
#[async_trait]
pub trait SwapSource: Send + Sync {
    /// Fetch up to `page_size()` swaps with `timestamp <= as_of_time`,
    /// newest first.
    async fn fetch_page(&self, as_of_time: TimestampSecs) -> Result<Vec<SwapPayload>>;

    /// Maximum number of swaps a page can hold.
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }
}

#[derive(Deserialize)]
struct Envelope {
    data: Option<SwapsData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct SwapsData {
    swaps: Option<Vec<SwapPayload>>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

/// Parse and validate a subgraph response body.
pub fn parse_swaps_response(body: &[u8]) -> Result<Vec<SwapPayload>> {
    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| Error::malformed(format!("invalid response body: {}", e)))?;

    if !envelope.errors.is_empty() {
        let messages: Vec<&str> = envelope.errors.iter().map(|e| e.message.as_str()).collect();
        return Err(Error::malformed(format!("query errors: {}", messages.join("; "))));
    }

    let swaps = envelope
        .data
        .and_then(|d| d.swaps)
        .ok_or_else(|| Error::malformed("response has no data.swaps"))?;

    for swap in &swaps {
        swap.validate()?;
    }
    Ok(swaps)
}

/// HTTP client for a GraphQL subgraph.
pub struct SubgraphClient {
    http: reqwest::Client,
    url: String,
    pools: Vec<String>,
    page_size: usize,
    retry: ExponentialBackoff,
}

impl SubgraphClient {
    /// Create a client from configuration.
    pub fn new(config: &SubgraphConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::transport(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            http,
            url: config.url.clone(),
            pools: config.pools.iter().map(|p| p.to_lowercase()).collect(),
            page_size: config.page_size.clamp(1, PAGE_SIZE),
            retry: ExponentialBackoff::new(config.retry_base_delay_ms, config.max_retries),
        })
    }

    /// Build the GraphQL query text for one page.
    pub fn build_query(&self, as_of_time: TimestampSecs) -> String {
        let pools = self
            .pools
            .iter()
            .map(|p| format!("\"{}\"", p))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            r#"{{
  swaps(where: {{timestamp_lte: {as_of}, pool_in: [{pools}]}}, first: {first}, orderBy: timestamp, orderDirection: desc) {{
    id
    transaction {{
      id
      blockNumber
    }}
    pool {{
      id
      token0 {{
        id
        symbol
      }}
      token1 {{
        id
        symbol
      }}
    }}
    sender
    recipient
    amount0
    amount1
    timestamp
  }}
}}"#,
            as_of = as_of_time,
            pools = pools,
            first = self.page_size,
        )
    }

    async fn request_once(&self, as_of_time: TimestampSecs) -> Result<Vec<SwapPayload>> {
        let body = serde_json::json!({ "query": self.build_query(as_of_time) });

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::transport(format!("query failed with status code {}", status)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::transport(format!("failed to read body: {}", e)))?;
        parse_swaps_response(&bytes)
    }
}

#[async_trait]
impl SwapSource for SubgraphClient {
    async fn fetch_page(&self, as_of_time: TimestampSecs) -> Result<Vec<SwapPayload>> {
        debug!(as_of_time, "querying swaps");
        self.retry.execute(|| self.request_once(as_of_time)).await
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
