use std::time::{Duration, Instant};

use playback_arbiter::{MediaConfig, MediaManager, MediaUpdate};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace")).init();

    let out_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "thumbnail.png".to_string());

    let (controller, mut update_rx) = MediaManager::start(MediaConfig::default())?;

    // 等待第一次进入播放状态，最多 30 秒
    let playing = tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(update) = update_rx.recv().await {
            if matches!(update, MediaUpdate::PlaybackChanged(true)) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if !playing {
        log::warn!("30 秒内没有检测到任何播放。");
        controller.shutdown()?;
        return Ok(());
    }

    let started = Instant::now();
    match controller.current_thumbnail().await? {
        Some(thumbnail) => {
            log::info!(
                "得到 {}x{} 的缩略图 ({} 字节)，耗时 {:?}",
                thumbnail.width,
                thumbnail.height,
                thumbnail.bytes.len(),
                started.elapsed()
            );
            std::fs::write(&out_path, &thumbnail.bytes)?;
            log::info!("已写入 {out_path}");
        }
        None => log::warn!("没有可用的缩略图，耗时 {:?}", started.elapsed()),
    }

    controller.shutdown()?;
    Ok(())
}
