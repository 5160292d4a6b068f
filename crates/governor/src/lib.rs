// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The AIMD (Additive-Increase, Multiplicative-Decrease) load-shedding governor.
//!
//! [`Governor`] tracks a single scalar `scale` in `[min_scale, max_scale]` and a
//! three-state mode (`Normal | Degraded | Recovering`), driven by repeated calls
//! to [`Governor::update`] with an observed memory-pressure value. Multiplicative
//! decreases respond immediately to pressure; additive increases recover slowly
//! and are rate-limited by a cooldown, so the governor cannot panic-saw.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use loadshed_clock::{Clock, MonoTime};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The governor's current operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorState {
    /// No throttling in effect; `scale == max_scale`.
    Normal,
    /// Throttling in effect; pressure is or recently was above `enter_threshold`.
    Degraded,
    /// Pressure has fallen below `exit_threshold` and the governor is
    /// additively easing throttling back toward `Normal`.
    Recovering,
}

impl fmt::Display for GovernorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GovernorState::Normal => "NORMAL",
            GovernorState::Degraded => "DEGRADED",
            GovernorState::Recovering => "RECOVERING",
        };
        f.write_str(s)
    }
}

/// Immutable governor configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GovernorConfig {
    /// Pressure at or above which the governor degrades. Must exceed `exit_threshold`.
    pub enter_threshold: f64,
    /// Pressure strictly below which the governor starts recovering.
    pub exit_threshold: f64,
    /// Pressure above which a degraded governor decreases scale again.
    pub critical_threshold: f64,
    /// Additive per-tick recovery step.
    pub incr_step: f64,
    /// Multiplicative decrease factor, applied on every decrease.
    pub decr_factor: f64,
    /// The floor `scale` is clamped to.
    pub min_scale: f64,
    /// The ceiling `scale` is clamped to, and the value it takes in `Normal`.
    pub max_scale: f64,
    /// Minimum real-time interval between periodic (non-one-shot) scale mutations.
    pub cooldown: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            enter_threshold: 0.70,
            exit_threshold: 0.55,
            critical_threshold: 0.90,
            incr_step: 0.05,
            decr_factor: 0.5,
            min_scale: 0.20,
            max_scale: 1.0,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// A request to override the governor's scale directly, bypassing the AIMD
/// state machine's own triggers (but not its clamping or cooldown stamping).
#[derive(Debug, Clone)]
pub struct OverrideCommand {
    /// The requested scale. Values outside `[0, 1]` are silently dropped.
    pub target_scale: f64,
    /// A human-readable reason, for logs and flight-recorder dumps.
    pub reason: String,
    /// The component that issued the override.
    pub source: String,
    /// When the override was issued.
    pub timestamp: MonoTime,
}

struct Inner {
    scale: f64,
    state: GovernorState,
    last_scale_change: MonoTime,
}

/// The AIMD governor.
///
/// All mutable state lives behind a single reader-writer lock: reads (`scale`,
/// `state`) take a read guard spanning both fields so a caller never observes a
/// scale/state pair that straddles two different `update` calls; `update` and
/// override application take the write guard.
pub struct Governor {
    config: GovernorConfig,
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
}

impl fmt::Debug for Governor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Governor")
            .field("scale", &inner.scale)
            .field("state", &inner.state)
            .finish()
    }
}

/// A snapshot-consistent read of `(scale, state)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GovernorReading {
    /// The current scale.
    pub scale: f64,
    /// The current state.
    pub state: GovernorState,
}

impl Governor {
    /// Creates a governor starting in `Normal` at `max_scale`.
    ///
    /// Panics if `enter_threshold <= exit_threshold`; this invariant is also
    /// enforced by the configuration layer's validation before construction, so
    /// in practice this should never fire outside of tests that deliberately
    /// construct an invalid config.
    #[must_use]
    pub fn new(config: GovernorConfig, clock: Arc<dyn Clock>) -> Self {
        assert!(
            config.enter_threshold > config.exit_threshold,
            "enter_threshold must exceed exit_threshold to guarantee a hysteresis gap"
        );
        let now = clock.now();
        Self {
            config,
            clock,
            inner: RwLock::new(Inner {
                scale: config.max_scale,
                state: GovernorState::Normal,
                last_scale_change: now,
            }),
        }
    }

    /// The configuration this governor was constructed with.
    #[must_use]
    pub fn config(&self) -> GovernorConfig {
        self.config
    }

    /// The current scale, in `[min_scale, max_scale]`.
    #[must_use]
    pub fn scale(&self) -> f64 {
        self.inner.read().scale
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> GovernorState {
        self.inner.read().state
    }

    /// Reads `scale` and `state` together, guaranteeing they come from the same
    /// update tick.
    #[must_use]
    pub fn reading(&self) -> GovernorReading {
        let inner = self.inner.read();
        GovernorReading {
            scale: inner.scale,
            state: inner.state,
        }
    }

    fn clamp_scale(&self, scale: f64) -> f64 {
        scale.clamp(self.config.min_scale, self.config.max_scale)
    }

    /// Feeds an observed pressure value (expected in `[0, 1]`, but not clamped
    /// on entry) through the AIMD state machine. See the module docs for the
    /// full transition table.
    pub fn update(&self, pressure: f64) {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        let cfg = &self.config;

        match inner.state {
            GovernorState::Normal => {
                if pressure >= cfg.enter_threshold {
                    let new_scale = self.clamp_scale(inner.scale * cfg.decr_factor);
                    inner.scale = new_scale;
                    inner.state = GovernorState::Degraded;
                    inner.last_scale_change = now;
                    info!(pressure, scale = new_scale, "governor: NORMAL -> DEGRADED");
                }
            }
            GovernorState::Degraded => {
                if pressure < cfg.exit_threshold {
                    inner.state = GovernorState::Recovering;
                    info!(pressure, "governor: DEGRADED -> RECOVERING");
                } else if pressure > cfg.critical_threshold && now.duration_since(inner.last_scale_change) >= cfg.cooldown
                {
                    let new_scale = self.clamp_scale(inner.scale * cfg.decr_factor);
                    inner.scale = new_scale;
                    inner.last_scale_change = now;
                    info!(pressure, scale = new_scale, "governor: DEGRADED further decrease");
                } else {
                    debug!(pressure, "governor: DEGRADED no-op");
                }
            }
            GovernorState::Recovering => {
                if pressure >= cfg.enter_threshold {
                    let new_scale = self.clamp_scale(inner.scale * cfg.decr_factor);
                    inner.scale = new_scale;
                    inner.state = GovernorState::Degraded;
                    inner.last_scale_change = now;
                    info!(pressure, scale = new_scale, "governor: RECOVERING -> DEGRADED");
                } else if pressure < cfg.exit_threshold
                    && now.duration_since(inner.last_scale_change) >= cfg.cooldown
                {
                    let mut new_scale = inner.scale + cfg.incr_step;
                    if new_scale >= cfg.max_scale {
                        new_scale = cfg.max_scale;
                        inner.state = GovernorState::Normal;
                        info!(scale = new_scale, "governor: RECOVERING -> NORMAL");
                    } else {
                        debug!(scale = new_scale, "governor: RECOVERING additive increase");
                    }
                    inner.scale = self.clamp_scale(new_scale);
                    inner.last_scale_change = now;
                } else {
                    debug!(pressure, "governor: RECOVERING no-op");
                }
            }
        }

        inner.scale = self.clamp_scale(inner.scale);
    }

    /// Applies a validated override command directly, bypassing the automatic
    /// state machine's triggers. Out-of-range targets (`< 0` or `> 1`) are
    /// silently dropped. Always stamps the cooldown timer.
    ///
    /// Reclassification on success: `target >= max_scale` -> `Normal`;
    /// `target < previous scale` -> `Degraded`; `target > previous scale` ->
    /// `Recovering`. If `target == previous scale` exactly, state is left
    /// unchanged (unspecified by design; callers should not depend on this).
    pub fn apply_override(&self, command: &OverrideCommand) -> bool {
        if !(0.0..=1.0).contains(&command.target_scale) {
            debug!(target = command.target_scale, "governor: override out of range, dropped");
            return false;
        }
        let now = self.clock.now();
        let mut inner = self.inner.write();
        let previous_scale = inner.scale;
        let new_scale = self.clamp_scale(command.target_scale);
        inner.scale = new_scale;
        inner.last_scale_change = now;
        if new_scale >= self.config.max_scale {
            inner.state = GovernorState::Normal;
        } else if new_scale < previous_scale {
            inner.state = GovernorState::Degraded;
        } else if new_scale > previous_scale {
            inner.state = GovernorState::Recovering;
        }
        info!(
            source = %command.source,
            reason = %command.reason,
            scale = new_scale,
            state = %inner.state,
            "governor: override applied"
        );
        true
    }

    /// Spawns a background task that applies override commands as they arrive
    /// on `receiver`, until the stream closes or `cancellation_token` fires.
    ///
    /// The task shares this governor's lock with `update`; only one of
    /// override application and automatic AIMD logic runs at a time.
    #[must_use]
    pub fn bind_command_stream(
        self: &Arc<Self>,
        mut receiver: tokio::sync::mpsc::Receiver<OverrideCommand>,
        cancellation_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let governor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancellation_token.cancelled() => break,
                    command = receiver.recv() => match command {
                        Some(command) => { let _ = governor.apply_override(&command); }
                        None => break,
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadshed_clock::FakeClock;

    fn governor_with_clock() -> (Arc<Governor>, Arc<FakeClock>) {
        let clock = FakeClock::shared();
        let governor = Arc::new(Governor::new(GovernorConfig::default(), clock.clone()));
        (governor, clock)
    }

    #[test]
    fn scenario_a_normal_to_degraded() {
        let (governor, _clock) = governor_with_clock();
        governor.update(0.65);
        assert_eq!(governor.state(), GovernorState::Normal);
        assert_eq!(governor.scale(), 1.0);

        governor.update(0.75);
        assert_eq!(governor.state(), GovernorState::Degraded);
        assert_eq!(governor.scale(), 0.50);
    }

    #[test]
    fn scenario_b_hysteresis_dead_zone() {
        let (governor, _clock) = governor_with_clock();
        governor.update(0.75);
        assert_eq!(governor.scale(), 0.50);

        governor.update(0.68);
        assert_eq!(governor.state(), GovernorState::Degraded);
        assert_eq!(governor.scale(), 0.50);

        governor.update(0.54);
        assert_eq!(governor.state(), GovernorState::Recovering);
        assert_eq!(governor.scale(), 0.50);
    }

    #[test]
    fn scenario_c_additive_recovery_to_normal() {
        let (governor, clock) = governor_with_clock();
        governor.update(0.75); // NORMAL -> DEGRADED, scale 0.5
        governor.update(0.54); // DEGRADED -> RECOVERING, scale 0.5
        assert_eq!(governor.scale(), 0.50);
        assert_eq!(governor.state(), GovernorState::Recovering);

        clock.advance(Duration::from_secs(31));
        governor.update(0.50);
        assert!((governor.scale() - 0.55).abs() < 1e-9);
        assert_eq!(governor.state(), GovernorState::Recovering);

        clock.advance(Duration::from_secs(31));
        for _ in 0..8 {
            governor.update(0.50);
            if governor.state() == GovernorState::Normal {
                break;
            }
            clock.advance(Duration::from_secs(31));
        }
        assert_eq!(governor.state(), GovernorState::Normal);
        assert_eq!(governor.scale(), 1.0);
    }

    #[test]
    fn scenario_c_exact_two_ticks_to_normal() {
        let (governor, clock) = governor_with_clock();
        // Start already RECOVERING at scale 0.90, as specified directly.
        governor.update(0.75); // -> DEGRADED, scale 0.5
        // manufacture scale=0.90, RECOVERING via overrides to match scenario wording
        let cmd = OverrideCommand {
            target_scale: 0.90,
            reason: "test setup".into(),
            source: "test".into(),
            timestamp: governor.clock.now(),
        };
        governor.apply_override(&cmd);
        // apply_override may reclassify to Recovering since 0.90 > previous 0.5.
        assert_eq!(governor.state(), GovernorState::Recovering);
        assert_eq!(governor.scale(), 0.90);

        clock.advance(Duration::from_secs(31));
        governor.update(0.50);
        assert!((governor.scale() - 0.95).abs() < 1e-9);
        assert_eq!(governor.state(), GovernorState::Recovering);

        clock.advance(Duration::from_secs(31));
        governor.update(0.50);
        assert!((governor.scale() - 1.0).abs() < 1e-9);
        assert_eq!(governor.state(), GovernorState::Normal);
    }

    #[test]
    fn scenario_d_panic_saw_prevention() {
        let (governor, clock) = governor_with_clock();
        governor.update(0.75); // t=0: NORMAL -> DEGRADED, scale 0.5, cooldown stamped
        assert_eq!(governor.scale(), 0.50);

        for _ in 0..5 {
            clock.advance(Duration::from_secs(5));
            governor.update(0.95);
            assert_eq!(governor.scale(), 0.50, "scale must not move before cooldown elapses");
        }

        // total elapsed so far: 25s; advance past 30s cooldown from t=0.
        clock.advance(Duration::from_secs(6)); // elapsed = 31s
        governor.update(0.95);
        assert_eq!(governor.scale(), 0.25);
    }

    #[test]
    fn scenario_e_min_scale_floor() {
        let (governor, clock) = governor_with_clock();
        governor.update(0.95); // NORMAL -> DEGRADED, scale 1.0 * 0.5 = 0.5
        assert_eq!(governor.scale(), 0.50);

        clock.advance(Duration::from_secs(31));
        governor.update(0.95); // 0.5 * 0.5 = 0.25
        assert_eq!(governor.scale(), 0.25);

        clock.advance(Duration::from_secs(31));
        governor.update(0.95); // 0.25 * 0.5 = 0.125 -> clamped to 0.20
        assert_eq!(governor.scale(), 0.20);

        clock.advance(Duration::from_secs(31));
        governor.update(0.95); // 0.20 * 0.5 = 0.10 -> clamped to 0.20
        assert_eq!(governor.scale(), 0.20);
    }

    #[test]
    fn scale_is_always_within_bounds() {
        let (governor, clock) = governor_with_clock();
        let pressures = [0.1, 0.72, 0.95, 0.95, 0.3, 0.95, 0.95, 0.95, 0.95, 0.2];
        for p in pressures {
            governor.update(p);
            let reading = governor.reading();
            assert!(reading.scale >= governor.config().min_scale);
            assert!(reading.scale <= governor.config().max_scale);
            clock.advance(Duration::from_secs(31));
        }
    }

    #[test]
    fn override_out_of_range_is_dropped() {
        let (governor, _clock) = governor_with_clock();
        let before = governor.reading();
        let cmd = OverrideCommand {
            target_scale: 1.5,
            reason: "bogus".into(),
            source: "test".into(),
            timestamp: governor.clock.now(),
        };
        assert!(!governor.apply_override(&cmd));
        assert_eq!(governor.reading(), before);
    }

    #[test]
    fn override_above_max_scale_classifies_normal() {
        let (governor, _clock) = governor_with_clock();
        let cmd = OverrideCommand {
            target_scale: 1.0,
            reason: "reset".into(),
            source: "test".into(),
            timestamp: governor.clock.now(),
        };
        governor.update(0.95);
        assert!(governor.apply_override(&cmd));
        assert_eq!(governor.state(), GovernorState::Normal);
        assert_eq!(governor.scale(), 1.0);
    }

    #[tokio::test]
    async fn command_stream_applies_overrides_until_cancelled() {
        let (governor, _clock) = governor_with_clock();
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let token = CancellationToken::new();
        let handle = governor.bind_command_stream(rx, token.clone());

        tx.send(OverrideCommand {
            target_scale: 0.3,
            reason: "manual".into(),
            source: "operator".into(),
            timestamp: governor.clock.now(),
        })
        .await
        .expect("send override");

        // give the task a chance to run
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(governor.scale(), 0.3);

        token.cancel();
        handle.await.expect("task joins cleanly");
    }
}
