//! Merge shards into one time-ordered price series with rolling MAD.

use std::path::PathBuf;

use swapshard_core::{Config, Error, NormalizedTrade, PricePoint, Result};
use swapshard_ingestion::shards::list_shard_files;
use swapshard_ingestion::{ShardStore, TradeReader};
use tracing::{debug, info, warn};

use crate::dispersion::rolling_mad;
use crate::normalizer::{NormalizationStats, TradeNormalizer};

/// Normalized trades in ascending time order with the rolling MAD of
/// their prices.
#[derive(Debug, Clone, Default)]
pub struct PriceSeries {
    pub trades: Vec<NormalizedTrade>,
    /// Aligned with `trades`; `None` until the window is full.
    pub rolling_mad: Vec<Option<f64>>,
    pub stats: NormalizationStats,
    /// Stored rows that could not be decoded.
    pub unreadable_rows: u64,
}

impl PriceSeries {
    /// Number of trades in the series.
    pub fn len(&self) -> usize {
        self.trades.len()
    }

    /// Whether the series holds no trades.
    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// `(timestamp, price)` pairs in time order.
    pub fn points(&self) -> impl Iterator<Item = PricePoint> + '_ {
        self.trades.iter().map(|t| PricePoint {
            timestamp: t.timestamp,
            price: t.price,
        })
    }

    /// Prices in time order.
    pub fn prices(&self) -> Vec<f64> {
        self.trades.iter().map(|t| t.price).collect()
    }

    /// Each trade paired with its rolling MAD.
    pub fn iter(&self) -> impl Iterator<Item = (&NormalizedTrade, Option<f64>)> + '_ {
        self.trades.iter().zip(self.rolling_mad.iter().copied())
    }

    /// Rolling MAD at `index`, or an insufficient-data error before the
    /// window fills.
    pub fn mad_at(&self, index: usize) -> Result<f64> {
        match self.rolling_mad.get(index) {
            Some(Some(mad)) => Ok(*mad),
            Some(None) => Err(Error::insufficient_data(format!(
                "rolling MAD undefined at index {} before the window fills",
                index
            ))),
            None => Err(Error::data(format!(
                "index {} out of range for series of {}",
                index,
                self.len()
            ))),
        }
    }
}

/// Builds a [`PriceSeries`] from any number of shards.
pub struct SeriesAggregator {
    normalizer: TradeNormalizer,
    window: usize,
}

impl SeriesAggregator {
    /// Create an aggregator with a MAD window of `window` trades.
    pub fn new(normalizer: TradeNormalizer, window: usize) -> Self {
        Self {
            normalizer,
            window: window.max(1),
        }
    }

    /// Create an aggregator for the configured pair and window.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            TradeNormalizer::from_config(&config.pair),
            config.series.mad_window,
        )
    }

    /// Normalize every row of every shard, sort by time and compute the
    /// rolling MAD.
    ///
    /// Rows that fail to decode are skipped with a warning. Read failures
    /// of the store itself are returned.
    pub fn aggregate<R: TradeReader>(&mut self, shards: &[R]) -> Result<PriceSeries> {
        let mut series = PriceSeries::default();

        for shard in shards {
            let label = shard.label();
            for row in shard.scan_all() {
                let raw = match row {
                    Ok(raw) => raw,
                    Err(Error::Data(msg)) => {
                        warn!(shard = %label, error = %msg, "skipping unreadable row");
                        series.unreadable_rows += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if let Some(trade) = self.normalizer.normalize(&raw) {
                    series.trades.push(trade);
                }
            }

            let stats = self.normalizer.take_stats();
            info!(
                shard = %label,
                "{} out of {} swaps kept",
                stats.kept,
                stats.total
            );
            debug!(
                shard = %label,
                kept_frac = stats.kept_frac(),
                wrong_pair = stats.wrong_pair,
                self_trades = stats.self_trades,
                zero_flow = stats.zero_flow,
                unparsable = stats.unparsable,
                "normalization rejects"
            );
            series.stats.merge(&stats);
        }

        // Stable: equal timestamps keep shard then row order.
        series.trades.sort_by_key(|t| t.timestamp);
        series.rolling_mad = rolling_mad(&series.prices(), self.window);
        Ok(series)
    }
}

/// Open every finalized shard in `dir` read-only.
pub fn open_shards(dir: impl Into<PathBuf>) -> Result<Vec<ShardStore>> {
    let dir = dir.into();
    let paths = list_shard_files(&dir)?;
    info!(dir = %dir.display(), shards = paths.len(), "opening shards");
    paths.iter().map(|p| ShardStore::open_read_only(p)).collect()
}
