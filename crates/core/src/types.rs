//! Core data types for the swapshard system.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Timestamp in seconds since Unix epoch (UTC).
pub type TimestampSecs = i64;

/// Maximum number of swaps requested per page.
pub const PAGE_SIZE: usize = 1000;

/// One side of a pool: token address and symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetLeg {
    /// Token contract address.
    pub id: String,
    /// Token symbol (e.g., "WETH").
    #[serde(default)]
    pub symbol: String,
}

impl AssetLeg {
    /// Whether this leg refers to the given address, ignoring case.
    #[inline]
    pub fn is(&self, address: &str) -> bool {
        self.id.eq_ignore_ascii_case(address)
    }
}

/// Transaction a swap was included in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRef {
    /// Transaction hash.
    pub id: String,
    /// Block number, as a decimal string.
    #[serde(rename = "blockNumber", default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<String>,
}

/// Pool a swap was executed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRef {
    /// Pool contract address.
    pub id: String,
    pub token0: AssetLeg,
    pub token1: AssetLeg,
}

/// A swap as returned by the subgraph.
///
/// This is also the payload persisted in each shard. Amounts keep their
/// decimal text so nothing is lost between the wire and the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapPayload {
    /// Globally unique swap identifier.
    pub id: String,
    pub transaction: TransactionRef,
    pub pool: PoolRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Signed flow of token0 (decimal string).
    pub amount0: String,
    /// Signed flow of token1 (decimal string).
    pub amount1: String,
    /// Block timestamp in seconds.
    #[serde(with = "epoch_seconds")]
    pub timestamp: TimestampSecs,
}

impl SwapPayload {
    /// Parse the token0 flow.
    pub fn amount0(&self) -> Result<f64> {
        parse_amount(&self.amount0, "amount0")
    }

    /// Parse the token1 flow.
    pub fn amount1(&self) -> Result<f64> {
        parse_amount(&self.amount1, "amount1")
    }

    /// Check required fields so bad records fail here rather than downstream.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::malformed("swap without id"));
        }
        if self.pool.token0.id.is_empty() || self.pool.token1.id.is_empty() {
            return Err(Error::malformed(format!(
                "swap {} has a pool leg without address",
                self.id
            )));
        }
        if self.timestamp < 0 {
            return Err(Error::malformed(format!(
                "swap {} has negative timestamp {}",
                self.id, self.timestamp
            )));
        }
        self.amount0()
            .and(self.amount1())
            .map_err(|e| Error::malformed(format!("swap {}: {}", self.id, e)))?;
        Ok(())
    }
}

fn parse_amount(text: &str, field: &str) -> Result<f64> {
    let value: f64 = text
        .trim()
        .parse()
        .map_err(|_| Error::data(format!("{} is not a number: {:?}", field, text)))?;
    if !value.is_finite() {
        return Err(Error::data(format!("{} is not finite: {:?}", field, text)));
    }
    Ok(value)
}

/// Timestamps arrive as decimal strings from the subgraph but may be plain
/// integers in hand-written fixtures. Always written back as strings.
mod epoch_seconds {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Int(i64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(ts: &i64, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Int(v) => Ok(v),
            Repr::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        }
    }
}

/// A persisted swap row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrade {
    /// Natural key used for idempotent upsert.
    pub trade_id: String,
    pub payload: SwapPayload,
    /// Copy of `payload.timestamp` for indexing.
    pub event_time: TimestampSecs,
}

impl RawTrade {
    /// Build a row from a validated payload.
    pub fn from_payload(payload: SwapPayload) -> Result<Self> {
        payload.validate()?;
        Ok(Self {
            trade_id: payload.id.clone(),
            event_time: payload.timestamp,
            payload,
        })
    }
}

/// How a price is expressed from oriented flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceConvention {
    /// Quote units per one base unit: `abs(quote / base)`.
    #[default]
    QuotePerBase,
    /// Base units per one quote unit: `abs(base / quote)`.
    BasePerQuote,
}

impl PriceConvention {
    /// Price from non-zero oriented flows.
    #[inline]
    pub fn price(self, base_amount: f64, quote_amount: f64) -> f64 {
        match self {
            PriceConvention::QuotePerBase => (quote_amount / base_amount).abs(),
            PriceConvention::BasePerQuote => (base_amount / quote_amount).abs(),
        }
    }
}

/// A swap oriented to the configured base/quote pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTrade {
    /// Signed flow of the base asset.
    pub base_amount: f64,
    /// Signed flow of the quote asset.
    pub quote_amount: f64,
    pub price: f64,
    pub timestamp: TimestampSecs,
}

/// A single point of the merged price series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: TimestampSecs,
    pub price: f64,
}

/// Time-bucketed OHLC candle over normalized trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    /// Bucket start (seconds).
    pub time: TimestampSecs,
    /// Bucket length (seconds).
    pub period: i64,
    pub price_open: f64,
    pub price_close: f64,
    pub min_price: f64,
    pub max_price: f64,
    /// Sum of absolute base flows.
    pub volume_base: f64,
    /// Sum of absolute quote flows.
    pub volume_quote: f64,
    pub trade_count: u32,
}

/// Round a timestamp down to a bucket boundary.
#[inline]
pub fn ts_to_bucket(ts: TimestampSecs, period: i64) -> TimestampSecs {
    ts.div_euclid(period) * period
}
