//! Scenario 3 (spec.md §8): a study with no further C-STORE activity for
//! longer than its inactivity timeout is handed to the completion callback
//! exactly once, and drops out of the monitor's active set.

use async_trait::async_trait;
use pacsproxy::monitor::{CompletionCallback, StudyMonitor};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct RecordingCallback {
    completed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl CompletionCallback for RecordingCallback {
    async fn on_study_complete(&self, study_instance_uid: &str) {
        self.completed.lock().unwrap().push(study_instance_uid.to_string());
    }
}

#[tokio::test]
async fn inactive_study_completes_exactly_once_after_its_timeout() {
    let completed = Arc::new(Mutex::new(Vec::new()));
    let monitor = StudyMonitor::new(
        Duration::from_millis(50),
        vec![Arc::new(RecordingCallback { completed: completed.clone() })],
    );
    let shutdown = CancellationToken::new();
    let handle = monitor.clone().spawn(shutdown.clone());

    monitor.update_activity("1.2.840.113619.2.88.1");
    assert_eq!(monitor.active_count(), 1);

    // The ticker runs every second; sleeping past one tick guarantees the
    // 50ms timeout has long since elapsed by the time it fires.
    tokio::time::sleep(Duration::from_millis(1300)).await;

    assert_eq!(completed.lock().unwrap().as_slice(), ["1.2.840.113619.2.88.1"]);
    assert_eq!(monitor.active_count(), 0);

    shutdown.cancel();
    let _ = handle.await;
}
