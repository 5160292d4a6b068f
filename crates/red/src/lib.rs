// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Random Early Detection (RED) admission control.
//!
//! [`RedDropper`] is a stateless probability function plus a private PRNG: given a
//! queue fill ratio it decides, independently per call, whether the current
//! admission should be shed. Unlike the AIMD governor it carries no memory of past
//! decisions: the same fill ratio always yields the same drop *probability*, only
//! the coin flip differs.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Configuration for a [`RedDropper`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedConfig {
    /// Fill ratio below which nothing is ever dropped.
    pub min_fill: f64,
    /// Fill ratio at or above which the drop probability saturates at `max_drop_prob`.
    pub max_fill: f64,
    /// The drop probability ceiling, reached at `max_fill`.
    pub max_drop_prob: f64,
}

impl Default for RedConfig {
    fn default() -> Self {
        Self {
            min_fill: 0.6,
            max_fill: 1.0,
            max_drop_prob: 0.3,
        }
    }
}

/// A Random Early Detection admission-control decision function.
///
/// Holds no mutable state beyond its PRNG; `drop_probability` is a pure function
/// of `fill` and the configuration.
#[derive(Debug)]
pub struct RedDropper {
    config: RedConfig,
    rng: Mutex<StdRng>,
}

impl RedDropper {
    /// Creates a dropper seeded from OS entropy.
    #[must_use]
    pub fn new(config: RedConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Creates a dropper with a fixed PRNG seed, for deterministic tests.
    #[must_use]
    pub fn with_seed(config: RedConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// The configuration this dropper was constructed with.
    #[must_use]
    pub fn config(&self) -> RedConfig {
        self.config
    }

    /// The probability of dropping an admission at the given fill ratio.
    ///
    /// `fill` is expected in `[0, 1]` but is not clamped on entry; values below
    /// `min_fill` still yield `0.0` and values above `max_fill` still saturate at
    /// `max_drop_prob`, so out-of-range inputs degrade gracefully.
    #[must_use]
    pub fn drop_probability(&self, fill: f64) -> f64 {
        let RedConfig {
            min_fill,
            max_fill,
            max_drop_prob,
        } = self.config;
        if fill <= min_fill {
            0.0
        } else if fill >= max_fill {
            max_drop_prob
        } else {
            (fill - min_fill) / (max_fill - min_fill) * max_drop_prob
        }
    }

    /// Samples a single admission decision at the given fill ratio.
    ///
    /// Deterministically `false` for `fill <= min_fill`, regardless of PRNG state.
    pub fn should_drop(&self, fill: f64) -> bool {
        let p = self.drop_probability(fill);
        if p <= 0.0 {
            return false;
        }
        let sample: f64 = self.rng.lock().random();
        sample < p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_min_fill_never_drops() {
        let dropper = RedDropper::with_seed(RedConfig::default(), 1);
        for _ in 0..1000 {
            assert!(!dropper.should_drop(0.0));
            assert!(!dropper.should_drop(0.6));
        }
    }

    #[test]
    fn at_or_above_max_fill_saturates_probability() {
        let dropper = RedDropper::with_seed(RedConfig::default(), 1);
        assert_eq!(dropper.drop_probability(1.0), 0.3);
        assert_eq!(dropper.drop_probability(5.0), 0.3);
    }

    #[test]
    fn interpolates_linearly_between_bounds() {
        let dropper = RedDropper::with_seed(RedConfig::default(), 1);
        let midpoint = 0.8; // halfway between 0.6 and 1.0
        let p = dropper.drop_probability(midpoint);
        assert!((p - 0.15).abs() < 1e-9);
    }

    #[test]
    fn drop_probability_is_monotonically_non_decreasing() {
        let dropper = RedDropper::with_seed(RedConfig::default(), 1);
        let mut prev = 0.0;
        let mut fill = 0.0;
        while fill <= 1.0 {
            let p = dropper.drop_probability(fill);
            assert!(p >= prev - 1e-12);
            assert!((0.0..=0.3).contains(&p));
            prev = p;
            fill += 0.01;
        }
    }

    #[test]
    fn converges_to_drop_probability_over_many_samples() {
        let dropper = RedDropper::with_seed(RedConfig::default(), 42);
        let fill = 0.8;
        let expected = dropper.drop_probability(fill);
        let trials = 20_000;
        let dropped = (0..trials).filter(|_| dropper.should_drop(fill)).count();
        let observed = dropped as f64 / f64::from(trials);
        assert!((observed - expected).abs() < 0.02, "observed={observed} expected={expected}");
    }
}
