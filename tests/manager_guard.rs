use std::time::Duration;

use playback_arbiter::{MediaConfig, MediaError, MediaManager};
use tokio::time::timeout;

#[tokio::test]
async fn test_second_start_is_rejected_until_shutdown() {
    let (controller, _update_rx) =
        MediaManager::start(MediaConfig::default()).expect("first start should succeed");
    assert!(controller.is_running());

    let second = MediaManager::start(MediaConfig::default());
    assert!(
        matches!(second, Err(MediaError::AlreadyRunning)),
        "a second start while running must be rejected"
    );

    controller.shutdown().unwrap();
    timeout(Duration::from_secs(5), async {
        while controller.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker should stop after shutdown");

    let (restarted, _update_rx) =
        MediaManager::start(MediaConfig::default()).expect("restart after shutdown should succeed");
    assert!(restarted.is_running());
    restarted.shutdown().unwrap();
}
