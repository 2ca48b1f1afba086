//! Rolling median absolute deviation.
//!
//! `MAD = median(|x - median(x)|)` over the last `window` prices. No value
//! is reported until the window is full.

use std::collections::VecDeque;

use statrs::statistics::{Data, Median};

/// Median absolute deviation of a non-empty slice.
pub fn median_absolute_deviation(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let median = Data::new(values.to_vec()).median();
    let deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
    Some(Data::new(deviations).median())
}

/// Rolling MAD calculator over a fixed number of observations.
pub struct RollingMad {
    /// Window size in observations.
    window: usize,
    values: VecDeque<f64>,
}

impl RollingMad {
    /// Create a calculator over `window` observations (at least 1).
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            values: VecDeque::with_capacity(window),
        }
    }

    /// Add a price observation.
    ///
    /// Returns the current MAD if the window is full.
    pub fn add_price(&mut self, price: f64) -> Option<f64> {
        if self.values.len() >= self.window {
            self.values.pop_front();
        }
        self.values.push_back(price);
        self.mad()
    }

    /// MAD of the current window, `None` until it is full.
    pub fn mad(&self) -> Option<f64> {
        if !self.is_ready() {
            return None;
        }
        let (a, b) = self.values.as_slices();
        let mut values = Vec::with_capacity(self.values.len());
        values.extend_from_slice(a);
        values.extend_from_slice(b);
        median_absolute_deviation(&values)
    }

    /// Whether the window is full.
    pub fn is_ready(&self) -> bool {
        self.values.len() >= self.window
    }
}

/// Rolling MAD aligned with `prices`; `None` before the window fills.
pub fn rolling_mad(prices: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut roller = RollingMad::new(window);
    prices.iter().map(|&p| roller.add_price(p)).collect()
}
