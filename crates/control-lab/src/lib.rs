// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The control lab: a fixed-cadence poll loop that reads memory pressure,
//! drives the AIMD governor, and emits observability events whenever the
//! governor's state or scale moves enough to matter.

use std::sync::Arc;
use std::time::Duration;

use loadshed_clock::Clock;
use loadshed_errorbus::{ErrorBus, ErrorCode, ErrorEvent, Severity, Signal};
use loadshed_governor::{Governor, GovernorState};
use loadshed_memory::read_memory_stats_fast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Minimum absolute scale delta that is worth surfacing as a scale-change event.
const SCALE_CHANGE_THRESHOLD: f64 = 0.05;

const COMPONENT_NAME: &str = "control-lab";

/// Configuration for a single [`ControlLab`] instance.
#[derive(Debug, Clone, Copy)]
pub struct ControlLabConfig {
    /// How often to poll memory stats and update the governor.
    pub poll_interval: Duration,
    /// The memory limit to compute pressure against (`0` disables pressure
    /// computation; the lab still polls and still emits snapshots upstream).
    pub memory_limit_bytes: u64,
}

/// Drives a [`Governor`] from periodic memory-pressure readings.
pub struct ControlLab {
    governor: Arc<Governor>,
    bus: ErrorBus,
    clock: Arc<dyn Clock>,
    config: ControlLabConfig,
}

fn state_change_event(
    clock: &dyn Clock,
    previous: GovernorState,
    current: GovernorState,
) -> ErrorEvent {
    let (code, severity, signal, message) = match (previous, current) {
        (GovernorState::Normal, GovernorState::Degraded) => (
            ErrorCode::DegradedMode,
            Severity::Warning,
            Signal::Degraded,
            "memory pressure crossed enter threshold, entering degraded mode",
        ),
        (GovernorState::Recovering, GovernorState::Normal) => (
            ErrorCode::RecoveredMode,
            Severity::Info,
            Signal::Recovered,
            "memory pressure recovered fully, returning to normal mode",
        ),
        (GovernorState::Degraded, GovernorState::Recovering) => (
            ErrorCode::MemRelief,
            Severity::Info,
            Signal::None,
            "memory pressure fell below exit threshold, beginning recovery",
        ),
        (GovernorState::Recovering, GovernorState::Degraded) => (
            ErrorCode::MemPressure,
            Severity::Warning,
            Signal::Degraded,
            "memory pressure returned during recovery, re-entering degraded mode",
        ),
        _ => (
            ErrorCode::MemPressure,
            Severity::Info,
            Signal::None,
            "governor state changed",
        ),
    };
    ErrorEvent::new(severity, signal, code, COMPONENT_NAME, message, clock.now(), true)
        .with_context("previous_state", previous.to_string())
        .with_context("current_state", current.to_string())
}

fn scale_change_event(clock: &dyn Clock, previous_scale: f64, current_scale: f64) -> ErrorEvent {
    let (code, message) = if current_scale > previous_scale {
        (ErrorCode::WorkerScaleUp, "governor scale increased")
    } else {
        (ErrorCode::WorkerScaleDown, "governor scale decreased")
    };
    ErrorEvent::new(Severity::Info, Signal::None, code, COMPONENT_NAME, message, clock.now(), true)
        .with_context("previous_scale", previous_scale)
        .with_context("current_scale", current_scale)
}

impl ControlLab {
    /// Creates a new control lab wired to the given governor and error bus.
    #[must_use]
    pub fn new(
        governor: Arc<Governor>,
        bus: ErrorBus,
        clock: Arc<dyn Clock>,
        config: ControlLabConfig,
    ) -> Self {
        Self {
            governor,
            bus,
            clock,
            config,
        }
    }

    /// Runs one poll tick: reads memory stats, updates the governor, and
    /// emits events for any observed state or scale change. Returns the
    /// events that were published, for tests that want to assert on them
    /// without a real ticking loop.
    pub fn tick(&self) -> Vec<ErrorEvent> {
        let stats = read_memory_stats_fast(self.config.memory_limit_bytes);
        let previous_scale = self.governor.scale();
        let previous_state = self.governor.state();

        self.governor.update(stats.usage_pct);

        let mut emitted = Vec::new();
        let current_state = self.governor.state();
        if current_state != previous_state {
            let event = state_change_event(self.clock.as_ref(), previous_state, current_state);
            let _ = self.bus.publish(event.clone());
            emitted.push(event);
        }

        let current_scale = self.governor.scale();
        if (current_scale - previous_scale).abs() > SCALE_CHANGE_THRESHOLD {
            let event = scale_change_event(self.clock.as_ref(), previous_scale, current_scale);
            let _ = self.bus.publish(event.clone());
            emitted.push(event);
        }

        debug!(pressure = stats.usage_pct, scale = current_scale, state = %current_state, "control-lab tick");
        emitted
    }

    fn health_check_event(&self) -> ErrorEvent {
        ErrorEvent::new(
            Severity::Info,
            Signal::None,
            ErrorCode::HealthCheck,
            COMPONENT_NAME,
            "control lab starting",
            self.clock.now(),
            true,
        )
    }

    /// Spawns the control lab's background polling task. The task emits a
    /// one-shot `HEALTH_CHECK` event immediately, then ticks at
    /// `poll_interval` until `cancellation_token` fires, at which point it
    /// exits without emitting further events.
    #[must_use]
    pub fn spawn(self: Arc<Self>, cancellation_token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let _ = self.bus.publish(self.health_check_event());

            let mut interval = tokio::time::interval(self.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancellation_token.cancelled() => {
                        warn!(component = COMPONENT_NAME, "control lab shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let _ = self.tick();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadshed_clock::FakeClock;
    use loadshed_governor::GovernorConfig;

    fn lab_with_limit(limit: u64) -> (Arc<ControlLab>, ErrorBus) {
        let clock: Arc<dyn Clock> = FakeClock::shared();
        let governor = Arc::new(Governor::new(GovernorConfig::default(), clock.clone()));
        let bus = ErrorBus::new();
        let lab = Arc::new(ControlLab::new(
            governor,
            bus.clone(),
            clock,
            ControlLabConfig {
                poll_interval: Duration::from_millis(50),
                memory_limit_bytes: limit,
            },
        ));
        (lab, bus)
    }

    #[test]
    fn tick_with_no_limit_never_mutates_governor() {
        let (lab, _bus) = lab_with_limit(0);
        let events = lab.tick();
        assert!(events.is_empty());
        assert_eq!(lab.governor.state(), GovernorState::Normal);
    }

    #[tokio::test]
    async fn spawn_emits_health_check_and_stops_on_cancel() {
        let (lab, bus) = lab_with_limit(0);
        let token = CancellationToken::new();
        let sub = bus.subscribe_with_capacity(8, token.clone());

        let handle = lab.spawn(token.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let first = sub.try_recv().expect("health check present");
        assert_eq!(first.code.to_string(), "HEALTH_CHECK");

        token.cancel();
        handle.await.expect("task joins cleanly");
    }
}
