// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The engine facade: wires together the clock, memory probe, governor, RED
//! dropper, error bus, control lab, and flight recorder, and owns their
//! combined lifecycle (start, run, and a bounded-grace-period shutdown).

use std::fs::File;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loadshed_clock::{Clock, MonoTime, SystemClock};
use loadshed_config::EngineConfig;
use loadshed_control_lab::{ControlLab, ControlLabConfig};
use loadshed_errorbus::{ErrorBus, ErrorCode, ErrorEvent, Severity, Signal};
use loadshed_flight_recorder::{FlightRecorder, Snapshot};
use loadshed_governor::{Governor, GovernorConfig};
use loadshed_memory::{detect_memory_limit, read_memory_stats_fast};
use loadshed_red::{RedConfig, RedDropper};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// The bounded grace period the engine waits for background tasks to exit on
/// shutdown, per the concurrency model's "5s then force-close" rule.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Crash dumps are rate-limited to at most one per minute, so a burst of
/// panicking tasks cannot itself become an I/O storm on the way down.
const CRASH_DUMP_RATE_LIMIT: Duration = Duration::from_secs(60);

const CRASH_DUMP_DIR: &str = "crash-logs";

const COMPONENT_NAME: &str = "engine";

/// Runtime faults at the engine-facade level.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A background task panicked instead of returning normally.
    #[error("background task panicked: {0}")]
    TaskPanicked(#[from] tokio::task::JoinError),
    /// Shutdown did not complete within the grace period; the bus was force-closed.
    #[error("shutdown grace period of {0:?} exceeded; bus force-closed")]
    ShutdownGracePeriodExceeded(Duration),
}

/// The wired-together engine: construct with [`Engine::new`], start
/// background tasks with [`Engine::start`], and tear down with
/// [`Engine::shutdown`].
pub struct Engine {
    clock: Arc<dyn Clock>,
    governor: Arc<Governor>,
    red: Arc<RedDropper>,
    bus: ErrorBus,
    flight_recorder: Arc<FlightRecorder>,
    control_lab: Arc<ControlLab>,
    memory_limit_bytes: u64,
    flight_recorder_interval: Duration,
    cancellation_token: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    active_task_count: Arc<AtomicUsize>,
    last_crash_dump: Mutex<Option<MonoTime>>,
}

impl Engine {
    /// Validates `config` and constructs every component, without starting any
    /// background task. Memory-limit auto-detection runs here so that
    /// `control_lab`'s pressure computation has a limit available from the
    /// first tick.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, loadshed_config::ConfigError> {
        config.validate()?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

        let memory_limit_bytes = if config.memory_limit_bytes > 0 {
            config.memory_limit_bytes
        } else {
            let detected = detect_memory_limit();
            if detected.ok {
                info!(bytes = detected.bytes, source = detected.source.description(), "memory limit detected");
            } else {
                warn!("no memory limit detected; control lab will operate with pressure=0");
            }
            detected.bytes
        };

        let governor_config = GovernorConfig {
            enter_threshold: config.memory_enter_pct,
            exit_threshold: config.memory_exit_pct,
            critical_threshold: config.memory_critical_pct,
            incr_step: config.aimd_incr,
            decr_factor: config.aimd_decr,
            min_scale: 0.20,
            max_scale: 1.0,
            cooldown: config.control_cooldown,
        };
        let governor = Arc::new(Governor::new(governor_config, clock.clone()));

        let red = Arc::new(RedDropper::new(RedConfig::default()));
        let bus = ErrorBus::new();
        let flight_recorder = Arc::new(FlightRecorder::new(config.flight_recorder_size));

        let control_lab = Arc::new(ControlLab::new(
            governor.clone(),
            bus.clone(),
            clock.clone(),
            ControlLabConfig {
                poll_interval: config.governor_poll,
                memory_limit_bytes,
            },
        ));

        Ok(Arc::new(Self {
            clock,
            governor,
            red,
            bus,
            flight_recorder,
            control_lab,
            memory_limit_bytes,
            flight_recorder_interval: config.flight_recorder_interval,
            cancellation_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            active_task_count: Arc::new(AtomicUsize::new(0)),
            last_crash_dump: Mutex::new(None),
        }))
    }

    /// The governor instance this engine owns.
    #[must_use]
    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    /// The RED dropper instance this engine owns.
    #[must_use]
    pub fn red_dropper(&self) -> &Arc<RedDropper> {
        &self.red
    }

    /// The error bus instance this engine owns.
    #[must_use]
    pub fn error_bus(&self) -> &ErrorBus {
        &self.bus
    }

    /// The flight recorder instance this engine owns.
    #[must_use]
    pub fn flight_recorder(&self) -> &Arc<FlightRecorder> {
        &self.flight_recorder
    }

    /// Starts every background task: the control lab's poll loop and the
    /// flight recorder's snapshot loop. Idempotent only in the sense that
    /// calling it twice spawns a second set of tasks sharing the same
    /// cancellation token; callers should call it exactly once per engine.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        tasks.push(("control-lab", self.control_lab.clone().spawn(self.cancellation_token.clone())));
        tasks.push(("flight-recorder-snapshot", self.spawn_snapshot_task()));

        self.active_task_count.store(tasks.len(), Ordering::Relaxed);
        info!(tasks = tasks.len(), "engine started");
    }

    fn spawn_snapshot_task(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.flight_recorder_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = interval.tick() => {
                        engine.capture_snapshot();
                    }
                }
            }
        })
    }

    fn capture_snapshot(&self) {
        let stats = read_memory_stats_fast(self.memory_limit_bytes);
        let reading = self.governor.reading();
        let snapshot = Snapshot {
            timestamp: self.clock.now(),
            wall_clock: chrono::Utc::now(),
            heap_bytes: stats.heap_alloc_bytes,
            mem_limit: stats.limit_bytes,
            task_count: self.active_task_count.load(Ordering::Relaxed),
            gc_count: stats.gc_cycles,
            queue_depths: std::collections::BTreeMap::new(),
            latencies: std::collections::BTreeMap::new(),
            governor_scale: reading.scale,
            governor_state: reading.state,
        };
        self.flight_recorder.record(snapshot);

        if stats.usage_pct > self.governor.config().critical_threshold {
            let event = ErrorEvent::new(
                Severity::Critical,
                Signal::None,
                ErrorCode::MemCritical,
                COMPONENT_NAME,
                "memory usage crossed critical threshold",
                self.clock.now(),
                true,
            )
            .with_context("usage_pct", stats.usage_pct);
            let _ = self.bus.publish(event);
        }
    }

    /// Requests cancellation of all background tasks and waits up to the
    /// shutdown grace period for them to exit. If the grace period elapses,
    /// the error bus is force-closed and
    /// [`EngineError::ShutdownGracePeriodExceeded`] is returned; callers may
    /// treat this as a best-effort shutdown rather than a hard failure.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.cancellation_token.cancel();

        let handles: Vec<(&'static str, JoinHandle<()>)> = std::mem::take(&mut *self.tasks.lock());
        let join_all = async {
            for (name, handle) in handles {
                if let Err(err) = handle.await {
                    error!(task = name, error = %err, "background task panicked");
                    self.report_task_panic(name, &err);
                }
            }
        };

        match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, join_all).await {
            Ok(()) => {
                self.bus.close();
                info!("engine shut down cleanly");
                Ok(())
            }
            Err(_) => {
                self.bus.close();
                warn!("shutdown grace period exceeded; bus force-closed");
                Err(EngineError::ShutdownGracePeriodExceeded(SHUTDOWN_GRACE_PERIOD))
            }
        }
    }

    /// Handles a panicked background task at the task boundary: publishes a
    /// critical `PANIC` event on the error bus and writes a best-effort
    /// crash dump, rate-limited to one per minute so a burst of panicking
    /// tasks cannot itself flood the filesystem.
    fn report_task_panic(&self, task_name: &str, err: &tokio::task::JoinError) {
        let event = ErrorEvent::new(
            Severity::Critical,
            Signal::None,
            ErrorCode::Panic,
            COMPONENT_NAME,
            format!("background task '{task_name}' panicked: {err}"),
            self.clock.now(),
            false,
        )
        .with_context("task", task_name.to_string());
        let _ = self.bus.publish(event);

        let now = self.clock.now();
        let mut last_dump = self.last_crash_dump.lock();
        let should_dump = last_dump.is_none_or(|prev| now.duration_since(prev) >= CRASH_DUMP_RATE_LIMIT);
        if !should_dump {
            warn!(task = task_name, "skipping crash dump; rate limit not yet elapsed");
            return;
        }
        *last_dump = Some(now);
        drop(last_dump);

        if let Err(io_err) = self.write_crash_dump(task_name) {
            warn!(task = task_name, error = %io_err, "failed to write crash dump");
        }
    }

    fn write_crash_dump(&self, task_name: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(CRASH_DUMP_DIR)?;
        let path = format!(
            "{CRASH_DUMP_DIR}/crash_{}_{task_name}.log",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        );
        let mut file = File::create(&path)?;
        self.flight_recorder.dump(&mut file)?;
        info!(task = task_name, path = %path, "crash dump written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn construction_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.memory_enter_pct = 0.1;
        config.memory_exit_pct = 0.9;
        assert!(Engine::new(config).is_err());
    }

    #[tokio::test]
    async fn start_and_shutdown_round_trip() {
        let mut config = EngineConfig::default();
        config.governor_poll = Duration::from_millis(5);
        config.flight_recorder_interval = Duration::from_millis(5);
        let engine = Engine::new(config).expect("valid config");

        engine.start();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!engine.flight_recorder.snapshots().is_empty());

        engine.shutdown().await.expect("clean shutdown within grace period");
    }
}
