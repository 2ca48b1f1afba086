//! Configuration structures for the swapshard system.

use crate::error::{Error, Result};
use crate::types::{PriceConvention, TimestampSecs, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote subgraph configuration.
    pub subgraph: SubgraphConfig,
    /// Shard storage configuration.
    pub shards: ShardConfig,
    /// Asset pair the series is built for.
    pub pair: PairConfig,
    /// Series and candle configuration.
    pub series: SeriesConfig,
}

impl Config {
    /// Load configuration from a JSON file. Missing sections use defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Override fields from environment variables when they are set.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = env::var("SWAPSHARD_SUBGRAPH_URL") {
            self.subgraph.url = url;
        }
        if let Ok(pools) = env::var("SWAPSHARD_POOLS") {
            self.subgraph.pools = pools
                .split(',')
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect();
        }
        if let Ok(path) = env::var("UNISWAP_SHARDS_PATH") {
            self.shards.shards_path = path;
        }
        if let Ok(ts) = env::var("UNISWAP_INITIAL_TIMESTAMP") {
            self.shards.initial_timestamp = ts
                .trim()
                .parse()
                .map_err(|_| {
                    Error::config(format!("UNISWAP_INITIAL_TIMESTAMP is not an integer: {}", ts))
                })?;
        }
        if let Ok(base) = env::var("SWAPSHARD_BASE_ASSET") {
            self.pair.base_asset = base;
        }
        if let Ok(quote) = env::var("SWAPSHARD_QUOTE_ASSET") {
            self.pair.quote_asset = quote;
        }
        Ok(())
    }

    /// Check invariants and clamp the sync hour into range.
    pub fn validate(&mut self) -> Result<()> {
        if self.subgraph.url.is_empty() {
            return Err(Error::config("subgraph url is empty"));
        }
        if self.subgraph.pools.is_empty() {
            return Err(Error::config("no pools configured"));
        }
        if self.subgraph.page_size == 0 || self.subgraph.page_size > PAGE_SIZE {
            return Err(Error::config(format!(
                "page_size must be within 1..={}, got {}",
                PAGE_SIZE, self.subgraph.page_size
            )));
        }
        if self.subgraph.request_timeout_secs == 0 {
            return Err(Error::config("request_timeout_secs must be positive"));
        }
        if self.pair.base_asset.eq_ignore_ascii_case(&self.pair.quote_asset) {
            return Err(Error::config("base and quote asset are the same"));
        }
        if self.series.mad_window == 0 {
            return Err(Error::config("mad_window must be at least 1"));
        }
        if self.series.candle_period_secs <= 0 {
            return Err(Error::config("candle_period_secs must be positive"));
        }
        if self.shards.sync_hour > 23 {
            tracing::warn!(hour = self.shards.sync_hour, "invalid sync hour, defaulting to 23");
            self.shards.sync_hour = 23;
        }
        Ok(())
    }
}

/// Subgraph endpoint and query configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubgraphConfig {
    /// GraphQL endpoint.
    pub url: String,
    /// Pool addresses the query is restricted to.
    pub pools: Vec<String>,
    /// Swaps requested per page.
    pub page_size: usize,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Backoff base delay in milliseconds.
    pub retry_base_delay_ms: u64,
}

impl Default for SubgraphConfig {
    fn default() -> Self {
        Self {
            url: "https://api.thegraph.com/subgraphs/name/uniswap/uniswap-v3".to_string(),
            pools: vec![
                "0x7bea39867e4169dbe237d55c8242a8f2fcdcc387".to_string(),
                "0x8ad599c3a0ff1de082011efddc58f1908eb6e6d8".to_string(),
                "0x88e6a0c2ddd26feeb64f039a2c41296fcb3f5640".to_string(),
                "0xe0554a476a092703abdb3ef35c80e0d76d32939f".to_string(),
            ],
            page_size: PAGE_SIZE,
            request_timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 500,
        }
    }
}

/// Day-shard storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Directory holding one SQLite file per day.
    pub shards_path: String,
    /// Oldest day to sync (seconds).
    pub initial_timestamp: TimestampSecs,
    /// Local hour of the daily sync.
    pub sync_hour: u32,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            shards_path: "./db/shards".to_string(),
            initial_timestamp: 1_672_531_200,
            sync_hour: 1,
        }
    }
}

/// Asset pair of interest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairConfig {
    /// Base asset address.
    pub base_asset: String,
    /// Quote asset address.
    pub quote_asset: String,
    /// How prices are expressed.
    pub price_convention: PriceConvention,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            base_asset: "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2".to_string(),
            quote_asset: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".to_string(),
            price_convention: PriceConvention::QuotePerBase,
        }
    }
}

/// Series aggregation and candle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesConfig {
    /// Rolling MAD window in points.
    pub mad_window: usize,
    /// Candle bucket length in seconds.
    pub candle_period_secs: i64,
    /// Drop outliers beyond this many MADs from candle extremes.
    pub mad_filter_threshold: Option<f64>,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            mad_window: 50,
            candle_period_secs: 3600,
            mad_filter_threshold: None,
        }
    }
}
