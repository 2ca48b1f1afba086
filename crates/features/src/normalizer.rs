//! Orient raw swaps to a base/quote pair.
//!
//! A swap is kept only when its two legs are exactly the configured pair,
//! in either order, and both flows are non-zero.

use swapshard_core::{NormalizedTrade, PairConfig, PriceConvention, RawTrade};

/// Why a raw swap produced no normalized trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Both legs are the same asset.
    SelfTrade,
    /// The legs are not the configured pair.
    WrongPair,
    /// An amount is not a finite number.
    Unparsable,
    /// One of the flows is zero.
    ZeroFlow,
}

/// Counters per normalization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizationStats {
    /// Swaps seen.
    pub total: u64,
    /// Swaps that produced a normalized trade.
    pub kept: u64,
    /// Both legs were the same asset.
    pub self_trades: u64,
    /// Legs did not match the configured pair.
    pub wrong_pair: u64,
    /// An amount was not a finite number.
    pub unparsable: u64,
    /// One of the flows was zero.
    pub zero_flow: u64,
}

impl NormalizationStats {
    fn record(&mut self, outcome: Result<(), Rejection>) {
        self.total += 1;
        match outcome {
            Ok(()) => self.kept += 1,
            Err(Rejection::SelfTrade) => self.self_trades += 1,
            Err(Rejection::WrongPair) => self.wrong_pair += 1,
            Err(Rejection::Unparsable) => self.unparsable += 1,
            Err(Rejection::ZeroFlow) => self.zero_flow += 1,
        }
    }

    /// Fraction of swaps kept.
    pub fn kept_frac(&self) -> f64 {
        if self.total > 0 {
            self.kept as f64 / self.total as f64
        } else {
            0.0
        }
    }

    /// Add another pass's counters to these.
    pub fn merge(&mut self, other: &NormalizationStats) {
        self.total += other.total;
        self.kept += other.kept;
        self.self_trades += other.self_trades;
        self.wrong_pair += other.wrong_pair;
        self.unparsable += other.unparsable;
        self.zero_flow += other.zero_flow;
    }
}

/// Orient `raw` to `(base, quote)` and price it.
pub fn classify(
    raw: &RawTrade,
    base: &str,
    quote: &str,
    convention: PriceConvention,
) -> Result<NormalizedTrade, Rejection> {
    let pool = &raw.payload.pool;
    if pool.token0.id.eq_ignore_ascii_case(&pool.token1.id) {
        return Err(Rejection::SelfTrade);
    }

    let flipped = if pool.token0.is(base) && pool.token1.is(quote) {
        false
    } else if pool.token0.is(quote) && pool.token1.is(base) {
        true
    } else {
        return Err(Rejection::WrongPair);
    };

    let amount0 = raw.payload.amount0().map_err(|_| Rejection::Unparsable)?;
    let amount1 = raw.payload.amount1().map_err(|_| Rejection::Unparsable)?;
    let (base_amount, quote_amount) = if flipped {
        (amount1, amount0)
    } else {
        (amount0, amount1)
    };

    if base_amount == 0.0 || quote_amount == 0.0 {
        return Err(Rejection::ZeroFlow);
    }

    Ok(NormalizedTrade {
        base_amount,
        quote_amount,
        price: convention.price(base_amount, quote_amount),
        timestamp: raw.event_time,
    })
}

/// Normalize with the default price convention.
pub fn normalize(raw: &RawTrade, base: &str, quote: &str) -> Option<NormalizedTrade> {
    classify(raw, base, quote, PriceConvention::default()).ok()
}

/// Normalizer bound to one pair, tracking rejection counts.
#[derive(Debug, Clone)]
pub struct TradeNormalizer {
    base: String,
    quote: String,
    convention: PriceConvention,
    stats: NormalizationStats,
}

impl TradeNormalizer {
    /// Create a normalizer for `base`/`quote` addresses.
    pub fn new(
        base: impl Into<String>,
        quote: impl Into<String>,
        convention: PriceConvention,
    ) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
            convention,
            stats: NormalizationStats::default(),
        }
    }

    /// Create a normalizer for the configured pair.
    pub fn from_config(pair: &PairConfig) -> Self {
        Self::new(&pair.base_asset, &pair.quote_asset, pair.price_convention)
    }

    /// Normalize one swap, counting the outcome.
    pub fn normalize(&mut self, raw: &RawTrade) -> Option<NormalizedTrade> {
        let result = classify(raw, &self.base, &self.quote, self.convention);
        self.stats.record(result.as_ref().map(|_| ()).map_err(|r| *r));
        result.ok()
    }

    /// Return the counters and start a new pass.
    pub fn take_stats(&mut self) -> NormalizationStats {
        std::mem::take(&mut self.stats)
    }
}
