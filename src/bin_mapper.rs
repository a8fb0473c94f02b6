//! Continuous-to-discrete value mapping

use serde::{Deserialize, Serialize};

/// A closed numeric interval `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        debug_assert!(min <= max, "range min must not exceed max");
        Self { min, max }
    }

    pub fn length(&self) -> f64 {
        self.max - self.min
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn constrain(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    /// Position of `value` within the range, 0 at min and 1 at max
    pub fn normalize(&self, value: f64) -> f64 {
        let length = self.length();
        if length == 0.0 {
            0.0
        } else {
            (value - self.min) / length
        }
    }
}

/// Options for [`BinMapper`]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BinMapperOptions {
    /// Clamp out-of-range values instead of treating them as a programmer
    /// error
    pub tolerate_out_of_range_values: bool,
}

/// Maps a value in a range onto one of `num_bins` equal-width bins.
///
/// The range max lands in the last bin, so every bin but the last is
/// half-open.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinMapper {
    num_bins: usize,
    range: ValueRange,
    options: BinMapperOptions,
}

impl BinMapper {
    pub fn new(num_bins: usize, range: ValueRange) -> Self {
        Self::with_options(num_bins, range, BinMapperOptions::default())
    }

    pub fn with_options(num_bins: usize, range: ValueRange, options: BinMapperOptions) -> Self {
        debug_assert!(num_bins > 0, "num_bins must be positive");
        debug_assert!(range.max > range.min, "value range must have positive length");
        Self {
            num_bins,
            range,
            options,
        }
    }

    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    pub fn range(&self) -> ValueRange {
        self.range
    }

    pub fn map_to_bin(&self, value: f64) -> usize {
        debug_assert!(
            self.options.tolerate_out_of_range_values || self.range.contains(value),
            "value {} is outside of the range [{}, {}]",
            value,
            self.range.min,
            self.range.max
        );
        let value = self.range.constrain(value);
        let bin = (self.range.normalize(value) * self.num_bins as f64).floor() as usize;
        bin.min(self.num_bins.saturating_sub(1))
    }
}
