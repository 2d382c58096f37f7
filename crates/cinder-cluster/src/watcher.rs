//! Slow-operation detection.
//!
//! Subsystems register a timestamp and a threshold when they start
//! something that should finish quickly, and unregister on completion.
//! A background sweeper periodically scans the registry and invokes the
//! entry's action for anything still pending past its threshold. The
//! action fires on every sweep while the entry remains overdue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

use crate::shutdown::Shutdown;
use crate::time::{self, Timestamp};

/// Identifies a registered watch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// Invoked with the elapsed time when an entry is overdue.
pub type WatchAction = Arc<dyn Fn(Duration) + Send + Sync>;

struct Entry {
    registered_at: Timestamp,
    threshold: Duration,
    action: WatchAction,
}

struct Inner {
    entries: HashMap<WatchId, Entry>,
    next_id: u64,
}

/// Registry of in-flight operations being watched for slowness.
pub struct TimeWatcher {
    inner: Mutex<Inner>,
}

impl TimeWatcher {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers the current timestamp under a fresh id. The action runs
    /// on every sweep that finds the entry older than `threshold`.
    pub fn register(
        &self,
        threshold: Duration,
        action: impl Fn(Duration) + Send + Sync + 'static,
    ) -> WatchId {
        let mut inner = self.lock();
        let id = WatchId(inner.next_id);
        inner.next_id += 1;
        inner.entries.insert(
            id,
            Entry {
                registered_at: time::now(),
                threshold,
                action: Arc::new(action),
            },
        );
        id
    }

    /// Removes an entry. Returns false if it was already gone.
    pub fn unregister(&self, id: WatchId) -> bool {
        self.lock().entries.remove(&id).is_some()
    }

    /// Sweeps the registry, firing the action of every overdue entry.
    ///
    /// Actions run outside the registry lock so they may register or
    /// unregister entries themselves.
    pub fn check_timestamps(&self) {
        let due: Vec<(WatchAction, Duration)> = {
            let inner = self.lock();
            inner
                .entries
                .values()
                .filter_map(|entry| {
                    let elapsed = time::elapsed_since(entry.registered_at);
                    (elapsed > entry.threshold).then(|| (Arc::clone(&entry.action), elapsed))
                })
                .collect()
        };

        for (action, elapsed) in due {
            action(elapsed);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

impl Default for TimeWatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives a [`TimeWatcher`] on a fixed polling interval until shutdown.
pub struct TimeWatcherProcessor {
    watcher: Arc<TimeWatcher>,
    polling_interval: Duration,
    shutdown: Shutdown,
}

impl TimeWatcherProcessor {
    pub fn new(watcher: Arc<TimeWatcher>, polling_interval: Duration, shutdown: Shutdown) -> Self {
        Self {
            watcher,
            polling_interval,
            shutdown,
        }
    }

    /// Runs the sweep loop. Exits promptly on shutdown; a zero polling
    /// interval means the watcher is disabled and the loop exits at
    /// once.
    pub async fn run(mut self) {
        loop {
            if self.shutdown.is_requested() {
                info!("shutdown requested, stopping time watcher");
                break;
            }
            if self.polling_interval.is_zero() {
                info!("time watcher disabled, stopping");
                break;
            }

            self.watcher.check_timestamps();
            debug!("time watcher sweep complete");

            tokio::select! {
                _ = self.shutdown.requested() => {}
                _ = sleep(self.polling_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownController;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn overdue_entries_fire_every_sweep() {
        let watcher = TimeWatcher::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        let id = watcher.register(Duration::ZERO, move |elapsed| {
            assert!(elapsed > Duration::ZERO);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(2));
        watcher.check_timestamps();
        watcher.check_timestamps();
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        assert!(watcher.unregister(id));
        watcher.check_timestamps();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn entries_below_threshold_stay_quiet() {
        let watcher = TimeWatcher::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        watcher.register(Duration::from_secs(3600), move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        watcher.check_timestamps();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregister_unknown_id_is_false() {
        let watcher = TimeWatcher::new();
        let id = watcher.register(Duration::ZERO, |_| {});
        assert!(watcher.unregister(id));
        assert!(!watcher.unregister(id));
    }

    #[test]
    fn actions_may_touch_the_registry() {
        let watcher = Arc::new(TimeWatcher::new());
        let watcher_clone = Arc::clone(&watcher);
        watcher.register(Duration::ZERO, move |_| {
            // must not deadlock
            let _ = watcher_clone.len();
        });
        std::thread::sleep(Duration::from_millis(2));
        watcher.check_timestamps();
    }

    #[tokio::test]
    async fn processor_exits_on_zero_interval() {
        let controller = ShutdownController::new();
        let processor = TimeWatcherProcessor::new(
            Arc::new(TimeWatcher::new()),
            Duration::ZERO,
            controller.subscribe(),
        );

        tokio::time::timeout(Duration::from_secs(1), processor.run())
            .await
            .expect("disabled processor should exit immediately");
    }

    #[tokio::test]
    async fn processor_exits_promptly_on_shutdown_mid_sleep() {
        let controller = ShutdownController::new();
        let processor = TimeWatcherProcessor::new(
            Arc::new(TimeWatcher::new()),
            Duration::from_secs(60),
            controller.subscribe(),
        );

        let join = tokio::spawn(processor.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.request();

        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .expect("processor should exit well before the polling interval")
            .unwrap();
    }

    #[tokio::test]
    async fn processor_sweeps_repeatedly() {
        let controller = ShutdownController::new();
        let watcher = Arc::new(TimeWatcher::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        watcher.register(Duration::ZERO, move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let processor = TimeWatcherProcessor::new(
            Arc::clone(&watcher),
            Duration::from_millis(10),
            controller.subscribe(),
        );
        let join = tokio::spawn(processor.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.request();
        join.await.unwrap();

        assert!(fired.load(Ordering::SeqCst) >= 2);
    }
}
