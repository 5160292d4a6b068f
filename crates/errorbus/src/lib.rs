// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! A bounded, never-blocking, lossy fan-out bus for diagnostic error events.
//!
//! [`ErrorBus::publish`] must never block a caller on a slow or absent
//! subscriber: the live subscription list is read through a lock-free
//! [`arc_swap::ArcSwap`] load, and delivery into each subscription's bounded
//! queue is a non-blocking `try_send`. A full queue simply increments the
//! bus-wide dropped-event counter and moves on.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

use arc_swap::ArcSwap;
use loadshed_clock::MonoTime;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default per-subscription queue capacity, matching `ERROR_BUS_BUFFER`'s default.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 32;

/// Severity of an [`ErrorEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Routine, high-volume diagnostic detail.
    Debug,
    /// Normal operational signal (state changes, scale changes).
    Info,
    /// A recovered or non-fatal anomaly.
    Warning,
    /// An operator-actionable fault.
    Error,
    /// A fault severe enough to threaten process health.
    Critical,
}

/// Orthogonal control-intent tag carried alongside severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// No control intent; informational only.
    None,
    /// Throttle intent.
    Throttle,
    /// Shed intent.
    Shed,
    /// A circuit breaker opened.
    BreakerOpen,
    /// A circuit breaker entered half-open probing.
    BreakerHalf,
    /// A circuit breaker closed.
    BreakerClose,
    /// The governor entered a degraded state.
    Degraded,
    /// The governor recovered to normal.
    Recovered,
}

/// Stable, operator-facing error-code identifiers.
///
/// These codes are part of the system's external ABI: operators and
/// dashboards key off them, so variants are never renumbered or repurposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Memory pressure crossed the enter threshold.
    MemPressure,
    /// Memory pressure fell back below the exit threshold.
    MemRelief,
    /// Memory pressure crossed the critical threshold.
    MemCritical,
    /// A PSI-style "about to OOM" signal (reserved for future probes).
    PsiPreOom,
    /// The governor entered degraded mode.
    DegradedMode,
    /// The governor returned to normal mode.
    RecoveredMode,
    /// A buffer saturated.
    BufSat,
    /// A buffer grew.
    BufGrow,
    /// A buffer shrank.
    BufShrink,
    /// Generic back-pressure signal.
    BackPressure,
    /// A drop due to a slow consumer.
    DropSlow,
    /// A drop due to RED admission control.
    DropRed,
    /// A drop due to a full queue.
    DropFull,
    /// The governor scale increased.
    WorkerScaleUp,
    /// The governor scale decreased.
    WorkerScaleDown,
    /// A one-shot startup health check.
    HealthCheck,
    /// A background task panicked.
    Panic,
    /// Orderly shutdown in progress.
    Shutdown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::MemPressure => "MEM_PRESSURE",
            ErrorCode::MemRelief => "MEM_RELIEF",
            ErrorCode::MemCritical => "MEM_CRITICAL",
            ErrorCode::PsiPreOom => "PSI_PRE_OOM",
            ErrorCode::DegradedMode => "DEGRADED_MODE",
            ErrorCode::RecoveredMode => "RECOVERED_MODE",
            ErrorCode::BufSat => "BUF_SAT",
            ErrorCode::BufGrow => "BUF_GROW",
            ErrorCode::BufShrink => "BUF_SHRINK",
            ErrorCode::BackPressure => "BACK_PRESSURE",
            ErrorCode::DropSlow => "DROP_SLOW",
            ErrorCode::DropRed => "DROP_RED",
            ErrorCode::DropFull => "DROP_FULL",
            ErrorCode::WorkerScaleUp => "WORKER_SCALE_UP",
            ErrorCode::WorkerScaleDown => "WORKER_SCALE_DOWN",
            ErrorCode::HealthCheck => "HEALTH_CHECK",
            ErrorCode::Panic => "PANIC",
            ErrorCode::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

/// An immutable diagnostic record published on the [`ErrorBus`].
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// How severe this event is.
    pub severity: Severity,
    /// The control intent this event carries, if any.
    pub signal: Signal,
    /// A stable, operator-facing code.
    pub code: ErrorCode,
    /// The component that raised this event (e.g. `"control-lab"`).
    pub component: String,
    /// A human-readable message.
    pub message: String,
    /// When this event was raised.
    pub timestamp: MonoTime,
    /// Arbitrary structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// Whether the condition this event describes is expected to self-heal.
    pub recoverable: bool,
}

impl ErrorEvent {
    /// Builds an event with an empty context map; use [`ErrorEvent::with_context`]
    /// to attach structured fields afterward.
    #[must_use]
    pub fn new(
        severity: Severity,
        signal: Signal,
        code: ErrorCode,
        component: impl Into<String>,
        message: impl Into<String>,
        timestamp: MonoTime,
        recoverable: bool,
    ) -> Self {
        Self {
            severity,
            signal,
            code,
            component: component.into(),
            message: message.into(),
            timestamp,
            context: BTreeMap::new(),
            recoverable,
        }
    }

    /// Attaches a structured context field, returning `self` for chaining.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let _ = self.context.insert(key.into(), value.into());
        self
    }
}

struct SubscriptionSlot {
    id: u64,
    sender: SyncSender<ErrorEvent>,
    closed: AtomicBool,
}

/// A live subscription handle returned by [`ErrorBus::subscribe`].
///
/// Dropping this handle does not unsubscribe automatically; call
/// [`Subscription::close`] or cancel the token passed to `subscribe` to stop
/// receiving events and free the slot in the bus's subscription list.
pub struct Subscription {
    id: u64,
    receiver: Receiver<ErrorEvent>,
    bus: ErrorBus,
}

impl Subscription {
    /// This subscription's opaque ID.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Blocks the current thread until an event arrives or the bus closes this
    /// subscription.
    pub fn recv(&self) -> Option<ErrorEvent> {
        self.receiver.recv().ok()
    }

    /// Non-blocking receive.
    #[must_use]
    pub fn try_recv(&self) -> Option<ErrorEvent> {
        self.receiver.try_recv().ok()
    }

    /// Explicitly closes this subscription, removing it from the bus.
    pub fn close(&self) {
        self.bus.unsubscribe(self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

struct Inner {
    subscriptions: ArcSwap<Vec<Arc<SubscriptionSlot>>>,
    mutation_lock: Mutex<u64>,
    dropped_count: AtomicU64,
    closed: AtomicBool,
}

/// A bounded, never-blocking, lossy multi-subscriber bus for [`ErrorEvent`]s.
///
/// Cheaply cloneable: all clones share the same underlying subscription list
/// and counters.
#[derive(Clone)]
pub struct ErrorBus {
    inner: Arc<Inner>,
}

impl fmt::Debug for ErrorBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorBus")
            .field("dropped_count", &self.dropped_count())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Default for ErrorBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorBus {
    /// Creates a new, empty, open bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscriptions: ArcSwap::from_pointee(Vec::new()),
                mutation_lock: Mutex::new(0),
                dropped_count: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribes with the default queue capacity.
    ///
    /// If `cancellation_token` is cancelled, this subscription is closed
    /// automatically: a background task waits on the token and calls
    /// [`ErrorBus::unsubscribe`] when it fires.
    #[must_use]
    pub fn subscribe(&self, cancellation_token: CancellationToken) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIPTION_CAPACITY, cancellation_token)
    }

    /// Subscribes with an explicit bounded queue capacity.
    #[must_use]
    pub fn subscribe_with_capacity(
        &self,
        capacity: usize,
        cancellation_token: CancellationToken,
    ) -> Subscription {
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        let id = {
            let mut next_id = self.inner.mutation_lock.lock();
            *next_id += 1;
            *next_id
        };
        let slot = Arc::new(SubscriptionSlot {
            id,
            sender,
            closed: AtomicBool::new(false),
        });

        {
            let _guard = self.inner.mutation_lock.lock();
            let current = self.inner.subscriptions.load();
            let mut next: Vec<Arc<SubscriptionSlot>> = (**current).clone();
            next.push(slot);
            self.inner.subscriptions.store(Arc::new(next));
        }

        let bus = self.clone();
        let _ = tokio::spawn(async move {
            cancellation_token.cancelled().await;
            bus.unsubscribe(id);
        });

        Subscription {
            id,
            receiver,
            bus: self.clone(),
        }
    }

    /// Publishes an event to every live subscription, never blocking.
    ///
    /// Returns the number of subscriptions the event was successfully
    /// delivered to. Full queues increment [`ErrorBus::dropped_count`] instead
    /// of blocking or erroring.
    pub fn publish(&self, event: ErrorEvent) -> usize {
        if self.inner.closed.load(Ordering::Acquire) {
            return 0;
        }
        let slots = self.inner.subscriptions.load();
        let mut delivered = 0;
        for slot in slots.iter() {
            if slot.closed.load(Ordering::Acquire) {
                continue;
            }
            match slot.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    let _ = self.inner.dropped_count.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => {
                    slot.closed.store(true, Ordering::Release);
                }
            }
        }
        trace!(delivered, code = %event.code, "published error event");
        delivered
    }

    /// Removes a subscription by ID. Safe to call more than once.
    pub fn unsubscribe(&self, id: u64) {
        let _guard = self.inner.mutation_lock.lock();
        let current = self.inner.subscriptions.load();
        if let Some(slot) = current.iter().find(|s| s.id == id) {
            slot.closed.store(true, Ordering::Release);
        }
        let next: Vec<Arc<SubscriptionSlot>> = current.iter().filter(|s| s.id != id).cloned().collect();
        self.inner.subscriptions.store(Arc::new(next));
    }

    /// Closes the bus: marks every subscription closed and clears the list.
    /// Further publishes are silently ignored.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let _guard = self.inner.mutation_lock.lock();
        let current = self.inner.subscriptions.load();
        for slot in current.iter() {
            slot.closed.store(true, Ordering::Release);
        }
        self.inner.subscriptions.store(Arc::new(Vec::new()));
    }

    /// Total number of events dropped across all subscriptions due to full
    /// queues, since bus construction.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped_count.load(Ordering::Relaxed)
    }

    /// Number of currently live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.load().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadshed_clock::{Clock, FakeClock};
    use std::time::{Duration, Instant};

    fn sample_event(clock: &FakeClock) -> ErrorEvent {
        ErrorEvent::new(
            Severity::Info,
            Signal::None,
            ErrorCode::HealthCheck,
            "test",
            "hello",
            clock.now(),
            true,
        )
    }

    #[tokio::test]
    async fn round_trips_events_in_order() {
        let clock = FakeClock::new();
        let bus = ErrorBus::new();
        let token = CancellationToken::new();
        let sub = bus.subscribe_with_capacity(8, token);

        for i in 0..5 {
            let delivered = bus.publish(sample_event(&clock).with_context("i", i));
            assert_eq!(delivered, 1);
        }

        for i in 0..5 {
            let evt = sub.try_recv().expect("event present");
            assert_eq!(evt.context.get("i").and_then(serde_json::Value::as_i64), Some(i));
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn publish_never_blocks_even_when_full() {
        let clock = FakeClock::new();
        let bus = ErrorBus::new();
        let token = CancellationToken::new();
        let _sub = bus.subscribe_with_capacity(4, token);

        let start = Instant::now();
        let mut delivered_total = 0;
        for _ in 0..1000 {
            delivered_total += bus.publish(sample_event(&clock));
        }
        let elapsed = start.elapsed();

        assert!(elapsed < Duration::from_millis(50), "publish took too long: {elapsed:?}");
        assert!(delivered_total <= 4);
        assert!(bus.dropped_count() >= 996, "dropped={}", bus.dropped_count());
    }

    #[tokio::test]
    async fn closed_subscription_swallows_further_publishes() {
        let clock = FakeClock::new();
        let bus = ErrorBus::new();
        let token = CancellationToken::new();
        let sub = bus.subscribe_with_capacity(8, token);
        sub.close();

        let delivered = bus.publish(sample_event(&clock));
        assert_eq!(delivered, 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_token_unsubscribes_automatically() {
        let clock = FakeClock::new();
        let bus = ErrorBus::new();
        let token = CancellationToken::new();
        let _sub = bus.subscribe_with_capacity(8, token.clone());
        assert_eq!(bus.subscriber_count(), 1);

        token.cancel();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(bus.subscriber_count(), 0);
        let delivered = bus.publish(sample_event(&clock));
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn close_clears_all_subscriptions() {
        let clock = FakeClock::new();
        let bus = ErrorBus::new();
        let token = CancellationToken::new();
        let _sub_a = bus.subscribe_with_capacity(8, token.clone());
        let _sub_b = bus.subscribe_with_capacity(8, token);
        assert_eq!(bus.subscriber_count(), 2);

        bus.close();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(sample_event(&clock)), 0);
    }
}
