//! Injected runtime services: wall clock, delayed-callback scheduler and
//! network reachability.
//!
//! ```text
//! ┌──────────────┐   arm(delay, cb)   ┌────────────────────┐
//! │ Orchestrator │ ─────────────────► │ Scheduler          │
//! │              │ ◄───── cb() ────── │  TokioScheduler    │ (production)
//! └──────┬───────┘                    │  ManualScheduler   │ (tests)
//!        │ now_ms()                   └────────────────────┘
//!        ▼
//! ┌──────────────┐   watch<bool>      ┌────────────────────┐
//! │ Clock        │                    │ NetworkMonitor     │ ──► OfflineQueue
//! └──────────────┘                    └────────────────────┘
//! ```
//!
//! Nothing in the engine reads the system time or spawns timers directly,
//! so every timing-dependent path can be driven deterministically.

use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Millisecond wall clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// System time since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ─── Scheduler ────────────────────────────────────────────────────────────

/// Callback fired when a timer elapses.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Arm and cancel delayed callbacks.
///
/// A callback may still fire after `cancel` returned `false` (it was
/// already running); callers guard against stale fires themselves.
pub trait Scheduler: Send + Sync {
    fn arm(&self, delay: Duration, callback: TimerCallback) -> TimerId;

    /// Returns `true` if the timer was pending and will not fire.
    fn cancel(&self, id: TimerId) -> bool;
}

/// Timers backed by `tokio::time::sleep` tasks.
pub struct TokioScheduler {
    runtime: Handle,
    next_id: AtomicU64,
    timers: Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>,
}

impl TokioScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Scheduler bound to the runtime of the calling task, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Number of armed timers that have not fired yet.
    pub fn pending(&self) -> usize {
        self.timers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Scheduler for TokioScheduler {
    fn arm(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let timers = Arc::clone(&self.timers);

        // Hold the map lock across spawn so the task cannot remove its
        // entry before it is inserted.
        let mut guard = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let still_armed = timers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id)
                .is_some();
            if still_armed {
                callback();
            }
        });
        guard.insert(id, handle);
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        let removed = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match removed {
            Some(handle) => {
                handle.abort();
                trace!("timer {id:?} cancelled");
                true
            }
            None => false,
        }
    }
}

/// Logical-time scheduler: timers fire only from [`advance`](Self::advance).
pub struct ManualScheduler {
    clock: Arc<ManualClock>,
    next_id: AtomicU64,
    timers: Mutex<BTreeMap<(u64, TimerId), TimerCallback>>,
}

impl ManualScheduler {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            next_id: AtomicU64::new(1),
            timers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        Arc::clone(&self.clock)
    }

    /// Move logical time forward, firing due timers in deadline order.
    ///
    /// Callbacks run on the caller's thread after the timer lock is
    /// released, so they may arm new timers. Returns the number fired.
    pub fn advance(&self, by: Duration) -> usize {
        self.clock.advance(by);
        let now = self.clock.now_ms();
        let mut fired = 0;
        loop {
            let due = {
                let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
                let key = match timers.keys().next() {
                    Some(&key) if key.0 <= now => key,
                    _ => break,
                };
                timers.remove(&key)
            };
            if let Some(callback) = due {
                callback();
                fired += 1;
            }
        }
        fired
    }

    pub fn pending(&self) -> usize {
        self.timers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Scheduler for ManualScheduler {
    fn arm(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let due = self.clock.now_ms() + delay.as_millis() as u64;
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((due, id), callback);
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        let key = timers.keys().find(|(_, timer)| *timer == id).copied();
        key.and_then(|k| timers.remove(&k)).is_some()
    }
}

// ─── Network reachability ─────────────────────────────────────────────────

/// Coarse reachability, recorded on samples and surfaced in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Online,
    Offline,
}

/// Online/offline flag with edge notifications.
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn status(&self) -> NetworkStatus {
        if self.is_online() {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        }
    }

    /// Flip reachability. Returns `true` if the value changed.
    pub fn set_online(&self, online: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    /// Receiver that observes every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_manual_scheduler_fires_in_order() {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = ManualScheduler::new(Arc::clone(&clock));
        let log = Arc::new(Mutex::new(Vec::new()));

        for (delay, tag) in [(300, "c"), (100, "a"), (200, "b")] {
            let log = Arc::clone(&log);
            scheduler.arm(
                Duration::from_millis(delay),
                Box::new(move || log.lock().unwrap().push(tag)),
            );
        }

        assert_eq!(scheduler.advance(Duration::from_millis(150)), 1);
        assert_eq!(scheduler.advance(Duration::from_millis(1000)), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(clock.now_ms(), 1150);
    }

    #[test]
    fn test_manual_scheduler_cancel() {
        let scheduler = ManualScheduler::new(Arc::new(ManualClock::new(0)));
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let id = scheduler.arm(
            Duration::from_millis(10),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        scheduler.advance(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_manual_scheduler_rearm_from_callback() {
        let scheduler = Arc::new(ManualScheduler::new(Arc::new(ManualClock::new(0))));
        let fired = Arc::new(AtomicUsize::new(0));

        let s = Arc::clone(&scheduler);
        let f = Arc::clone(&fired);
        scheduler.arm(
            Duration::from_millis(10),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
                let f2 = Arc::clone(&f);
                s.arm(
                    Duration::from_millis(10),
                    Box::new(move || {
                        f2.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );

        scheduler.advance(Duration::from_millis(10));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 1);
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_fire_and_cancel() {
        let scheduler = TokioScheduler::current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        scheduler.arm(
            Duration::from_millis(50),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let f = Arc::clone(&fired);
        let cancelled = scheduler.arm(
            Duration::from_millis(50),
            Box::new(move || {
                f.fetch_add(10, Ordering::SeqCst);
            }),
        );
        assert!(scheduler.cancel(cancelled));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_network_monitor_edges() {
        let monitor = NetworkMonitor::new(true);
        let mut rx = monitor.subscribe();

        assert!(!monitor.set_online(true));
        assert!(monitor.set_online(false));
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert_eq!(monitor.status(), NetworkStatus::Offline);
    }
}
