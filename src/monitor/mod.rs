//! Study inactivity monitor (§4.5): tracks `lastActivityAt` per study under
//! one mutex and ticks a background worker every second, firing registered
//! completion callbacks for studies that have gone quiet for longer than
//! `timeout`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TICK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Invoked once a study is judged complete (no C-STORE activity for more
/// than the configured timeout). Implementations MUST be idempotent: the
/// monitor guarantees at-most-one invocation per finalization transition,
/// not per process lifetime, since a studyUID reactivated after completion
/// starts a fresh cycle.
#[async_trait]
pub trait CompletionCallback: Send + Sync {
    async fn on_study_complete(&self, study_instance_uid: &str);
}

/// Tracks per-study activity and drives completion callbacks.
pub struct StudyMonitor {
    active: Mutex<HashMap<String, Instant>>,
    timeout: Duration,
    callbacks: Vec<Arc<dyn CompletionCallback>>,
}

impl StudyMonitor {
    pub fn new(timeout: Duration, callbacks: Vec<Arc<dyn CompletionCallback>>) -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(HashMap::new()),
            timeout,
            callbacks,
        })
    }

    pub fn with_default_timeout(callbacks: Vec<Arc<dyn CompletionCallback>>) -> Arc<Self> {
        Self::new(DEFAULT_INACTIVITY_TIMEOUT, callbacks)
    }

    /// Record activity for a study, extending its inactivity deadline. Called
    /// by the store handler after every successful C-STORE.
    pub fn update_activity(&self, study_instance_uid: &str) {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        active.insert(study_instance_uid.to_string(), Instant::now());
    }

    /// Number of studies currently tracked as in-progress. Exposed for tests
    /// and health reporting.
    pub fn active_count(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn take_expired(&self) -> Vec<String> {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        let expired: Vec<String> = active
            .iter()
            .filter(|(_, last_activity)| now.duration_since(**last_activity) > self.timeout)
            .map(|(uid, _)| uid.clone())
            .collect();
        for uid in &expired {
            active.remove(uid);
        }
        expired
    }

    async fn run_one_tick(&self) {
        for study_instance_uid in self.take_expired() {
            info!(study_instance_uid = %study_instance_uid, "study inactive, firing completion callbacks");
            for callback in &self.callbacks {
                callback.on_study_complete(&study_instance_uid).await;
            }
        }
    }

    /// Spawn the 1 s ticker. Exits once `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_one_tick().await,
                    _ = shutdown.cancelled() => {
                        debug!("study monitor shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{advance, pause};

    struct CountingCallback {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CompletionCallback for CountingCallback {
        async fn on_study_complete(&self, _study_instance_uid: &str) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn fires_callback_after_timeout_elapses() {
        pause();
        let count = Arc::new(AtomicUsize::new(0));
        let monitor = StudyMonitor::new(
            Duration::from_secs(5),
            vec![Arc::new(CountingCallback { count: count.clone() })],
        );

        monitor.update_activity("1.2.3");
        assert_eq!(monitor.active_count(), 1);

        advance(Duration::from_secs(10)).await;
        monitor.run_one_tick().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.active_count(), 0);
    }

    #[tokio::test]
    async fn does_not_fire_before_timeout() {
        pause();
        let count = Arc::new(AtomicUsize::new(0));
        let monitor = StudyMonitor::new(
            Duration::from_secs(60),
            vec![Arc::new(CountingCallback { count: count.clone() })],
        );

        monitor.update_activity("1.2.3");
        advance(Duration::from_secs(5)).await;
        monitor.run_one_tick().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.active_count(), 1);
    }

    #[tokio::test]
    async fn reactivation_after_completion_starts_a_new_cycle() {
        pause();
        let count = Arc::new(AtomicUsize::new(0));
        let monitor = StudyMonitor::new(
            Duration::from_secs(5),
            vec![Arc::new(CountingCallback { count: count.clone() })],
        );

        monitor.update_activity("1.2.3");
        advance(Duration::from_secs(10)).await;
        monitor.run_one_tick().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        monitor.update_activity("1.2.3");
        advance(Duration::from_secs(10)).await;
        monitor.run_one_tick().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
