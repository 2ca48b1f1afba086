//! Time-bucketed candles from a normalized price series.
//!
//! Candles are contiguous: a bucket with no trades becomes a flat candle
//! at the previous close. Each candle opens at the previous candle's close,
//! the first one at its first trade.

use swapshard_core::{ts_to_bucket, Candle, Error, NormalizedTrade, Result, TimestampSecs};

use crate::aggregator::PriceSeries;

/// A candle that's currently being built.
#[derive(Debug, Clone)]
struct CandleInProgress {
    time: TimestampSecs,
    open: f64,
    close: f64,
    volume_base: f64,
    volume_quote: f64,
    trade_count: u32,
    /// Prices seen in this bucket with their rolling MAD.
    prices: Vec<(f64, Option<f64>)>,
}

impl CandleInProgress {
    fn new(time: TimestampSecs, open: f64) -> Self {
        Self {
            time,
            open,
            close: open,
            volume_base: 0.0,
            volume_quote: 0.0,
            trade_count: 0,
            prices: Vec::new(),
        }
    }

    fn add_trade(&mut self, trade: &NormalizedTrade, mad: Option<f64>) {
        self.close = trade.price;
        self.volume_base += trade.base_amount.abs();
        self.volume_quote += trade.quote_amount.abs();
        self.trade_count += 1;
        self.prices.push((trade.price, mad));
    }

    fn to_candle(&self, period: i64, mad_threshold: Option<f64>) -> Candle {
        let mut min_price = self.open;
        let mut max_price = self.open;
        for &(price, mad) in &self.prices {
            let allowed = match mad_threshold {
                Some(threshold) => within_mad_band(price, mad, self.open, self.close, threshold),
                None => true,
            };
            if allowed {
                min_price = min_price.min(price);
                max_price = max_price.max(price);
            }
        }

        Candle {
            time: self.time,
            period,
            price_open: self.open,
            price_close: self.close,
            min_price,
            max_price,
            volume_base: self.volume_base,
            volume_quote: self.volume_quote,
            trade_count: self.trade_count,
        }
    }
}

/// Whether `price` may extend the candle range.
///
/// Prices between open and close always pass. Outside that band the
/// distance, measured in rolling MADs, must not exceed `threshold`. An
/// undefined MAD lets the price through; a zero MAD rejects any excursion.
pub fn within_mad_band(
    price: f64,
    mad: Option<f64>,
    open: f64,
    close: f64,
    threshold: f64,
) -> bool {
    let lo = open.min(close);
    let hi = open.max(close);
    let excursion = if price < lo {
        lo - price
    } else if price > hi {
        price - hi
    } else {
        return true;
    };
    match mad {
        Some(mad) => excursion / mad <= threshold,
        None => true,
    }
}

/// Builder for fixed-period candles from time-ordered trades.
pub struct CandleBuilder {
    period: i64,
    mad_threshold: Option<f64>,
    running: Option<CandleInProgress>,
    series: Vec<Candle>,
}

impl CandleBuilder {
    /// Create a builder with `period` seconds per candle.
    pub fn new(period: i64, mad_threshold: Option<f64>) -> Result<Self> {
        if period <= 0 {
            return Err(Error::config(format!(
                "candle period must be positive, got {}",
                period
            )));
        }
        Ok(Self {
            period,
            mad_threshold,
            running: None,
            series: Vec::new(),
        })
    }

    /// Add a trade. Trades must arrive in non-decreasing time order.
    pub fn add_trade(&mut self, trade: &NormalizedTrade, mad: Option<f64>) -> Result<()> {
        let bucket = ts_to_bucket(trade.timestamp, self.period);

        let mut running = match self.running.take() {
            Some(running) if bucket < running.time => {
                let time = running.time;
                self.running = Some(running);
                return Err(Error::data(format!(
                    "trade at {} precedes open candle at {}",
                    trade.timestamp, time
                )));
            }
            Some(running) => running,
            None => CandleInProgress::new(bucket, trade.price),
        };

        while running.time + self.period <= bucket {
            self.series.push(running.to_candle(self.period, self.mad_threshold));
            running = CandleInProgress::new(running.time + self.period, running.close);
        }

        running.add_trade(trade, mad);
        self.running = Some(running);
        Ok(())
    }

    /// Emit flat candles until the open candle covers `ts`.
    pub fn advance_to(&mut self, ts: TimestampSecs) {
        let bucket = ts_to_bucket(ts, self.period);
        if let Some(mut running) = self.running.take() {
            while running.time + self.period <= bucket {
                self.series.push(running.to_candle(self.period, self.mad_threshold));
                running = CandleInProgress::new(running.time + self.period, running.close);
            }
            self.running = Some(running);
        }
    }

    /// Close the open candle and return the whole series.
    pub fn finish(mut self) -> Vec<Candle> {
        if let Some(running) = self.running.take() {
            self.series.push(running.to_candle(self.period, self.mad_threshold));
        }
        self.series
    }
}

/// Build candles over an aggregated series, carrying flat candles at the
/// last close until the candle covering `end_time`.
pub fn build_candles_until(
    series: &PriceSeries,
    period: i64,
    mad_threshold: Option<f64>,
    end_time: TimestampSecs,
) -> Result<Vec<Candle>> {
    let mut builder = CandleBuilder::new(period, mad_threshold)?;
    for (trade, mad) in series.iter() {
        builder.add_trade(trade, mad)?;
    }
    builder.advance_to(end_time);
    Ok(builder.finish())
}

/// Up to `n` most recent candles starting at or before `reference_time`.
pub fn latest_candles(candles: &[Candle], n: usize, reference_time: TimestampSecs) -> &[Candle] {
    let end = candles.partition_point(|c| c.time <= reference_time);
    &candles[end.saturating_sub(n)..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn make_trade(ts: i64, price: f64, base: f64) -> NormalizedTrade {
        NormalizedTrade {
            base_amount: base,
            quote_amount: -base * price,
            price,
            timestamp: ts,
        }
    }

    #[test]
    fn test_single_bucket() {
        let mut builder = CandleBuilder::new(3600, None).unwrap();
        builder.add_trade(&make_trade(3_600 + 10, 2000.0, 1.0), None).unwrap();
        builder.add_trade(&make_trade(3_600 + 20, 2050.0, -0.5), None).unwrap();
        builder.add_trade(&make_trade(3_600 + 30, 1990.0, 2.0), None).unwrap();
        builder.add_trade(&make_trade(3_600 + 40, 2010.0, 1.0), None).unwrap();

        let candles = builder.finish();
        assert_eq!(candles.len(), 1);
        let c = &candles[0];
        assert_eq!(c.time, 3_600);
        assert_eq!(c.period, 3_600);
        assert_relative_eq!(c.price_open, 2000.0);
        assert_relative_eq!(c.price_close, 2010.0);
        assert_relative_eq!(c.max_price, 2050.0);
        assert_relative_eq!(c.min_price, 1990.0);
        assert_relative_eq!(c.volume_base, 4.5);
        assert_relative_eq!(c.volume_quote, 2000.0 + 1025.0 + 3980.0 + 2010.0);
        assert_eq!(c.trade_count, 4);
    }

    #[test]
    fn test_gap_filled_with_flat_candles() {
        let mut builder = CandleBuilder::new(60, None).unwrap();
        builder.add_trade(&make_trade(0, 100.0, 1.0), None).unwrap();
        builder.add_trade(&make_trade(30, 101.0, 1.0), None).unwrap();
        builder.add_trade(&make_trade(190, 105.0, 1.0), None).unwrap();

        let candles = builder.finish();
        let times: Vec<_> = candles.iter().map(|c| c.time).collect();
        assert_eq!(times, vec![0, 60, 120, 180]);

        let flat = &candles[1];
        assert_eq!(flat.trade_count, 0);
        assert_relative_eq!(flat.price_open, 101.0);
        assert_relative_eq!(flat.price_close, 101.0);
        assert_relative_eq!(flat.volume_base, 0.0);

        // Continuity: the next candle opens at the previous close.
        assert_relative_eq!(candles[3].price_open, 101.0);
        assert_relative_eq!(candles[3].price_close, 105.0);
        assert_relative_eq!(candles[3].max_price, 105.0);
    }

    #[test]
    fn test_out_of_order_trade_rejected() {
        let mut builder = CandleBuilder::new(60, None).unwrap();
        builder.add_trade(&make_trade(130, 100.0, 1.0), None).unwrap();
        let err = builder.add_trade(&make_trade(10, 100.0, 1.0), None);
        assert!(matches!(err, Err(Error::Data(_))));
        // The open candle survives the rejected trade.
        assert_eq!(builder.finish().len(), 1);
    }

    #[test]
    fn test_invalid_period() {
        assert!(matches!(CandleBuilder::new(0, None), Err(Error::Config(_))));
    }

    #[test]
    fn test_mad_filter_excludes_spike() {
        let mut builder = CandleBuilder::new(60, Some(5.0)).unwrap();
        builder.add_trade(&make_trade(0, 100.0, 1.0), Some(1.0)).unwrap();
        // 50 MADs above the band.
        builder.add_trade(&make_trade(10, 152.0, 1.0), Some(1.0)).unwrap();
        // 3 MADs below the band.
        builder.add_trade(&make_trade(20, 97.0, 1.0), Some(1.0)).unwrap();
        builder.add_trade(&make_trade(30, 102.0, 1.0), Some(1.0)).unwrap();

        let c = &builder.finish()[0];
        assert_relative_eq!(c.max_price, 102.0);
        assert_relative_eq!(c.min_price, 97.0);
        // Filtered trades still count toward volume.
        assert_eq!(c.trade_count, 4);
    }

    #[test]
    fn test_mad_band() {
        assert!(within_mad_band(101.0, Some(0.0), 100.0, 102.0, 3.0));
        assert!(!within_mad_band(103.0, Some(0.0), 100.0, 102.0, 3.0));
        assert!(within_mad_band(500.0, None, 100.0, 102.0, 3.0));
        assert!(within_mad_band(105.0, Some(1.0), 100.0, 102.0, 3.0));
        assert!(!within_mad_band(105.5, Some(1.0), 100.0, 102.0, 3.0));
    }

    #[test]
    fn test_advance_to_emits_flat_candles() {
        let mut builder = CandleBuilder::new(60, None).unwrap();
        builder.add_trade(&make_trade(5, 100.0, 1.0), None).unwrap();
        builder.advance_to(200);
        let candles = builder.finish();
        let times: Vec<_> = candles.iter().map(|c| c.time).collect();
        assert_eq!(times, vec![0, 60, 120, 180]);
        assert!(candles[1..].iter().all(|c| c.trade_count == 0));
        assert_relative_eq!(candles[3].price_close, 100.0);
    }

    #[test]
    fn test_advance_to_earlier_time_is_noop() {
        let mut builder = CandleBuilder::new(60, None).unwrap();
        builder.add_trade(&make_trade(130, 100.0, 1.0), None).unwrap();
        builder.advance_to(10);
        assert_eq!(builder.finish().len(), 1);
    }

    #[test]
    fn test_latest_candles() {
        let mut builder = CandleBuilder::new(60, None).unwrap();
        for i in 0..10 {
            builder.add_trade(&make_trade(i * 60, 100.0 + i as f64, 1.0), None).unwrap();
        }
        let candles = builder.finish();

        let recent = latest_candles(&candles, 3, 300);
        let times: Vec<_> = recent.iter().map(|c| c.time).collect();
        assert_eq!(times, vec![180, 240, 300]);

        assert_eq!(latest_candles(&candles, 100, 130).len(), 3);
        assert!(latest_candles(&candles, 5, -1).is_empty());
        assert!(latest_candles(&candles, 0, 600).is_empty());
    }
}
