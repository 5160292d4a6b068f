// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Typed configuration for the load-shedding engine.
//!
//! [`EngineConfig`] starts from compiled-in defaults, can be overlaid with
//! environment-variable overrides via [`EngineConfig::from_env`], and is
//! validated once at construction time via [`EngineConfig::validate`], never
//! at runtime, matching the error taxonomy's "configuration errors are fatal
//! to engine start" rule.

use std::time::Duration;

use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised constructing or validating an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// One or more validation rules failed. Carries every violation found, not
    /// just the first, so operators can fix a broken config in one pass.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

fn default_memory_enter_pct() -> f64 {
    0.70
}
fn default_memory_exit_pct() -> f64 {
    0.55
}
fn default_memory_critical_pct() -> f64 {
    0.90
}
fn default_governor_poll() -> Duration {
    Duration::from_millis(50)
}
fn default_control_cooldown() -> Duration {
    Duration::from_secs(30)
}
fn default_aimd_incr() -> f64 {
    0.05
}
fn default_aimd_decr() -> f64 {
    0.5
}
fn default_error_bus_buffer() -> usize {
    32
}
fn default_flight_recorder_size() -> usize {
    100
}
fn default_flight_recorder_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_memory_limit_bytes() -> u64 {
    0
}

/// The complete set of tunables for the load-shedding engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Governor enter threshold (`MEMORY_ENTER_PCT`).
    #[serde(default = "default_memory_enter_pct")]
    pub memory_enter_pct: f64,
    /// Governor exit threshold (`MEMORY_EXIT_PCT`).
    #[serde(default = "default_memory_exit_pct")]
    pub memory_exit_pct: f64,
    /// Critical-pressure threshold (`MEMORY_CRITICAL_PCT`).
    #[serde(default = "default_memory_critical_pct")]
    pub memory_critical_pct: f64,
    /// Control-lab tick period (`GOVERNOR_POLL_MS`).
    #[serde(default = "default_governor_poll", with = "humantime_serde")]
    pub governor_poll: Duration,
    /// Governor cooldown (`CONTROL_COOLDOWN`).
    #[serde(default = "default_control_cooldown", with = "humantime_serde")]
    pub control_cooldown: Duration,
    /// AIMD additive increase step (`AIMD_INCR`).
    #[serde(default = "default_aimd_incr")]
    pub aimd_incr: f64,
    /// AIMD multiplicative decrease factor (`AIMD_DECR`).
    #[serde(default = "default_aimd_decr")]
    pub aimd_decr: f64,
    /// Per-subscription error-bus queue capacity (`ERROR_BUS_BUFFER`).
    #[serde(default = "default_error_bus_buffer")]
    pub error_bus_buffer: usize,
    /// Flight-recorder ring-buffer size (`FLIGHT_RECORDER_SIZE`).
    #[serde(default = "default_flight_recorder_size")]
    pub flight_recorder_size: usize,
    /// Flight-recorder snapshot period (`FLIGHT_RECORDER_INTERVAL`).
    #[serde(default = "default_flight_recorder_interval", with = "humantime_serde")]
    pub flight_recorder_interval: Duration,
    /// Manual memory-limit override in bytes; `0` means auto-detect (`MEMORY_LIMIT_BYTES`).
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_enter_pct: default_memory_enter_pct(),
            memory_exit_pct: default_memory_exit_pct(),
            memory_critical_pct: default_memory_critical_pct(),
            governor_poll: default_governor_poll(),
            control_cooldown: default_control_cooldown(),
            aimd_incr: default_aimd_incr(),
            aimd_decr: default_aimd_decr(),
            error_bus_buffer: default_error_bus_buffer(),
            flight_recorder_size: default_flight_recorder_size(),
            flight_recorder_interval: default_flight_recorder_interval(),
            memory_limit_bytes: default_memory_limit_bytes(),
        }
    }
}

/// Parses a byte-size override that may be given either as a plain integer
/// (bytes) or as a human string with units (e.g. `"512 MiB"`), matching the
/// byte-unit convention used elsewhere for memory-size configuration.
fn parse_byte_size(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if let Ok(bytes) = trimmed.parse::<u64>() {
        return Some(bytes);
    }
    trimmed.parse::<Byte>().ok().map(|b| b.as_u64())
}

macro_rules! overlay_f64 {
    ($target:expr, $env_name:literal) => {
        if let Ok(raw) = std::env::var($env_name) {
            if let Ok(value) = raw.trim().parse::<f64>() {
                $target = value;
            }
        }
    };
}

macro_rules! overlay_usize {
    ($target:expr, $env_name:literal) => {
        if let Ok(raw) = std::env::var($env_name) {
            if let Ok(value) = raw.trim().parse::<usize>() {
                $target = value;
            }
        }
    };
}

impl EngineConfig {
    /// Starts from [`EngineConfig::default`] and overlays any recognized
    /// environment variables that are set and parse successfully. Unset or
    /// unparseable variables are silently left at their prior value.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        overlay_f64!(config.memory_enter_pct, "MEMORY_ENTER_PCT");
        overlay_f64!(config.memory_exit_pct, "MEMORY_EXIT_PCT");
        overlay_f64!(config.memory_critical_pct, "MEMORY_CRITICAL_PCT");
        overlay_f64!(config.aimd_incr, "AIMD_INCR");
        overlay_f64!(config.aimd_decr, "AIMD_DECR");
        overlay_usize!(config.error_bus_buffer, "ERROR_BUS_BUFFER");
        overlay_usize!(config.flight_recorder_size, "FLIGHT_RECORDER_SIZE");

        if let Ok(raw) = std::env::var("GOVERNOR_POLL_MS") {
            if let Ok(ms) = raw.trim().parse::<u64>() {
                config.governor_poll = Duration::from_millis(ms);
            }
        }
        if let Ok(raw) = std::env::var("CONTROL_COOLDOWN") {
            if let Ok(secs) = raw.trim().parse::<u64>() {
                config.control_cooldown = Duration::from_secs(secs);
            }
        }
        if let Ok(raw) = std::env::var("FLIGHT_RECORDER_INTERVAL") {
            if let Ok(secs) = raw.trim().parse::<u64>() {
                config.flight_recorder_interval = Duration::from_secs(secs);
            }
        }
        if let Ok(raw) = std::env::var("MEMORY_LIMIT_BYTES") {
            if let Some(bytes) = parse_byte_size(&raw) {
                config.memory_limit_bytes = bytes;
            }
        }

        config
    }

    /// Validates this configuration, aggregating every violated rule rather
    /// than failing on the first.
    ///
    /// Rules: `enter > exit`; `critical >= enter`; `decr_factor in (0, 1]`;
    /// every percent threshold in `(0, 1)`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if !(self.memory_enter_pct > self.memory_exit_pct) {
            errors.push(format!(
                "memory_enter_pct ({}) must be greater than memory_exit_pct ({})",
                self.memory_enter_pct, self.memory_exit_pct
            ));
        }
        if !(self.memory_critical_pct >= self.memory_enter_pct) {
            errors.push(format!(
                "memory_critical_pct ({}) must be greater than or equal to memory_enter_pct ({})",
                self.memory_critical_pct, self.memory_enter_pct
            ));
        }
        for (name, value) in [
            ("memory_enter_pct", self.memory_enter_pct),
            ("memory_exit_pct", self.memory_exit_pct),
            ("memory_critical_pct", self.memory_critical_pct),
        ] {
            if !(value > 0.0 && value < 1.0) {
                errors.push(format!("{name} ({value}) must be in (0, 1)"));
            }
        }
        if !(self.aimd_decr > 0.0 && self.aimd_decr <= 1.0) {
            errors.push(format!("aimd_decr ({}) must be in (0, 1]", self.aimd_decr));
        }
        if self.error_bus_buffer == 0 {
            errors.push("error_bus_buffer must be greater than 0".to_string());
        }
        if self.flight_recorder_size == 0 {
            errors.push("flight_recorder_size must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.memory_enter_pct, 0.70);
        assert_eq!(config.memory_exit_pct, 0.55);
        assert_eq!(config.memory_critical_pct, 0.90);
        assert_eq!(config.governor_poll, Duration::from_millis(50));
        assert_eq!(config.control_cooldown, Duration::from_secs(30));
        assert_eq!(config.aimd_incr, 0.05);
        assert_eq!(config.aimd_decr, 0.5);
        assert_eq!(config.error_bus_buffer, 32);
        assert_eq!(config.flight_recorder_size, 100);
        assert_eq!(config.flight_recorder_interval, Duration::from_secs(1));
        assert_eq!(config.memory_limit_bytes, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_enter_not_greater_than_exit() {
        let mut config = EngineConfig::default();
        config.memory_enter_pct = 0.5;
        config.memory_exit_pct = 0.5;
        let err = config.validate().unwrap_err();
        match err {
            ConfigError::Invalid(violations) => {
                assert!(violations.iter().any(|v| v.contains("memory_enter_pct")));
            }
        }
    }

    #[test]
    fn rejects_critical_below_enter() {
        let mut config = EngineConfig::default();
        config.memory_critical_pct = 0.60;
        let err = config.validate().unwrap_err();
        match err {
            ConfigError::Invalid(violations) => {
                assert!(violations.iter().any(|v| v.contains("memory_critical_pct")));
            }
        }
    }

    #[test]
    fn rejects_decr_factor_out_of_range() {
        let mut config = EngineConfig::default();
        config.aimd_decr = 0.0;
        assert!(config.validate().is_err());
        config.aimd_decr = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_plain_and_unit_byte_sizes() {
        assert_eq!(parse_byte_size("1024"), Some(1024));
        assert_eq!(parse_byte_size("1 KiB"), Some(1024));
        assert_eq!(parse_byte_size("2MiB"), Some(2 * 1024 * 1024));
        assert_eq!(parse_byte_size("not-a-size"), None);
    }

    #[test]
    fn aggregates_multiple_violations() {
        let mut config = EngineConfig::default();
        config.memory_enter_pct = 0.5;
        config.memory_exit_pct = 0.5;
        config.aimd_decr = 0.0;
        let err = config.validate().unwrap_err();
        match err {
            ConfigError::Invalid(violations) => assert!(violations.len() >= 2),
        }
    }
}
