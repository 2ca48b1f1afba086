//! Price series for the swapshard system.
//!
//! This crate handles:
//! - Orienting raw swaps to a base/quote pair
//! - Rolling median absolute deviation
//! - Merging shards into one ordered series
//! - Time-bucketed candles with an optional MAD outlier filter

pub mod aggregator;
pub mod candles;
pub mod dispersion;
pub mod normalizer;

pub use aggregator::{open_shards, PriceSeries, SeriesAggregator};
pub use candles::{build_candles_until, latest_candles, CandleBuilder};
pub use dispersion::{median_absolute_deviation, rolling_mad, RollingMad};
pub use normalizer::{normalize, NormalizationStats, Rejection, TradeNormalizer};
