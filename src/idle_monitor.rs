//! Edge-triggered idle detection driven by an injectable input source.
//!
//! A single process-wide last-activity timestamp is bumped by input events;
//! a fixed-cadence poll compares it against the idle threshold and notifies
//! subscribers only when the computed state actually changes. Listeners and
//! the poll task start lazily with the first subscriber and are torn down
//! when the last one unregisters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::traits::InputSource;

/// One idle/active edge. `idle_for` is how long the user had been
/// inactive when the edge was observed; on an Active→Idle edge it lets
/// consumers backdate the idle period to when input actually stopped.
#[derive(Debug, Clone, Copy)]
pub struct IdleEvent {
    pub idle: bool,
    pub idle_for: Duration,
}

/// Invoked on every idle/active edge.
pub type IdleCallback = Arc<dyn Fn(IdleEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

pub struct IdleMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    input: Arc<dyn InputSource>,
    threshold: Duration,
    poll_interval: Duration,
    last_activity: Mutex<Instant>,
    idle: AtomicBool,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, IdleCallback>>,
    poll_cancel: Mutex<Option<CancellationToken>>,
}

impl IdleMonitor {
    pub fn new(input: Arc<dyn InputSource>, threshold: Duration, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                input,
                threshold,
                poll_interval,
                last_activity: Mutex::new(Instant::now()),
                idle: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
                poll_cancel: Mutex::new(None),
            }),
        }
    }

    /// Register an edge callback. The first subscriber starts the input
    /// listeners and the poll loop. Must be called within a tokio runtime.
    pub fn subscribe(&self, callback: IdleCallback) -> SubscriberId {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let is_first = {
            let mut subs = self.inner.subscribers.lock().unwrap();
            subs.insert(id, callback);
            subs.len() == 1
        };
        if is_first {
            self.start_listeners();
        }
        SubscriberId(id)
    }

    /// Remove a subscriber; the last one tears the listeners down.
    /// Unknown ids are a no-op, so double-unsubscribe is harmless.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let was_last = {
            let mut subs = self.inner.subscribers.lock().unwrap();
            subs.remove(&id.0).is_some() && subs.is_empty()
        };
        if was_last {
            if let Some(token) = self.inner.poll_cancel.lock().unwrap().take() {
                token.cancel();
            }
            self.inner.input.stop();
            tracing::debug!("Idle monitoring stopped (last subscriber left)");
        }
    }

    /// Unconditional, cheap timestamp bump. Safe with no subscribers.
    pub fn record_activity(&self) {
        self.inner.touch();
    }

    pub fn is_idle(&self) -> bool {
        self.inner.idle.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    fn start_listeners(&self) {
        let inner = self.inner.clone();
        *inner.last_activity.lock().unwrap() = Instant::now();
        inner.idle.store(false, Ordering::SeqCst);

        let for_handler = inner.clone();
        if let Err(e) = inner.input.start(Arc::new(move || for_handler.touch())) {
            tracing::warn!(
                error = %e,
                "Input source unavailable — idle detection relies on explicitly reported activity"
            );
        }

        let token = CancellationToken::new();
        {
            let mut slot = inner.poll_cancel.lock().unwrap();
            if let Some(old) = slot.replace(token.clone()) {
                old.cancel();
            }
        }
        tokio::spawn(poll_loop(inner.clone(), token));
        tracing::debug!(
            threshold_secs = inner.threshold.as_secs(),
            poll_secs = inner.poll_interval.as_secs(),
            "Idle monitoring started"
        );
    }
}

impl MonitorInner {
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn poll_once(&self) {
        let idle_for = self.last_activity.lock().unwrap().elapsed();
        let now_idle = idle_for >= self.threshold;
        let was_idle = self.idle.swap(now_idle, Ordering::SeqCst);
        if was_idle == now_idle {
            return;
        }

        tracing::info!(idle = now_idle, idle_for_secs = idle_for.as_secs(), "Idle state changed");
        let event = IdleEvent {
            idle: now_idle,
            idle_for,
        };
        // Clone out of the lock so a callback can subscribe/unsubscribe
        let callbacks: Vec<IdleCallback> =
            self.subscribers.lock().unwrap().values().cloned().collect();
        for callback in callbacks {
            callback(event);
        }
    }
}

async fn poll_loop(inner: Arc<MonitorInner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval yields immediately; skip that tick so the first real check
    // happens one poll interval in
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => inner.poll_once(),
            _ = cancel.cancelled() => break,
        }
    }
}

/// Converts idle time into an activity percentage for screenshot records.
///
/// Fed by the tracker's idle-edge callback; the screenshot producer calls
/// `take_percent` once per capture, which also resets the window.
pub struct ActivityMeter {
    inner: Mutex<MeterInner>,
}

struct MeterInner {
    window_start: Instant,
    idle_accum: Duration,
    idle_since: Option<Instant>,
}

impl ActivityMeter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MeterInner {
                window_start: Instant::now(),
                idle_accum: Duration::ZERO,
                idle_since: None,
            }),
        }
    }

    pub fn set_idle(&self, idle: bool) {
        let mut inner = self.inner.lock().unwrap();
        if idle {
            if inner.idle_since.is_none() {
                inner.idle_since = Some(Instant::now());
            }
        } else if let Some(since) = inner.idle_since.take() {
            inner.idle_accum += since.elapsed();
        }
    }

    /// Percentage of the elapsed window spent active; resets the window.
    pub fn take_percent(&self) -> u8 {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(inner.window_start);

        let mut idle = inner.idle_accum;
        if let Some(since) = inner.idle_since {
            idle += now.duration_since(since);
        }

        inner.window_start = now;
        inner.idle_accum = Duration::ZERO;
        // An idle period spanning the boundary restarts in the new window
        inner.idle_since = inner.idle_since.map(|_| now);

        if elapsed.is_zero() {
            return 100;
        }
        let active = elapsed.saturating_sub(idle);
        ((active.as_secs_f64() / elapsed.as_secs_f64()) * 100.0).round() as u8
    }
}

impl Default for ActivityMeter {
    fn default() -> Self {
        Self::new()
    }
}
