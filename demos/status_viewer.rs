use std::time::Duration;

use playback_arbiter::{
    MediaConfig, MediaController, MediaManager, MediaUpdate, PlaybackSource, RepeatMode,
    TimelineInfo,
};

fn secs_to_ms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

fn timeline_status(timeline: &TimelineInfo) {
    log::info!(
        "时间线: {} / {}",
        secs_to_ms(timeline.position),
        secs_to_ms(timeline.duration)
    );
}

async fn log_now_playing(controller: &MediaController) -> Result<(), Box<dyn std::error::Error>> {
    let state = controller.playback_state();
    let source = match state.source {
        PlaybackSource::Modern => "系统媒体会话",
        PlaybackSource::Legacy => "传统播放器",
        PlaybackSource::None => "无",
    };
    log::info!(
        "播放中: {} | 来源: {source} | 播放器: {}",
        state.is_playing,
        state.display_name.as_deref().unwrap_or("N/A")
    );

    let info = controller.current_media_info().await?;
    log::info!("当前媒体: {}", info.as_deref().unwrap_or("N/A"));

    let controls = controller.playback_controls_state().await?;
    let repeat_state = match controls.repeat_mode {
        RepeatMode::Off => "关闭",
        RepeatMode::One => "单曲",
        RepeatMode::All => "列表",
    };
    log::info!(
        "随机: {:?} (可切换: {}) | 循环: {repeat_state} (可切换: {})",
        controls.shuffle_on,
        controls.shuffle_supported,
        controls.repeat_supported
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    let (controller, mut update_rx) = MediaManager::start(MediaConfig::default())?;
    let mut interval = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            biased;

            maybe_update = update_rx.recv() => {
                let Some(update) = maybe_update else {
                    log::info!("媒体事件通道已关闭，程序退出。");
                    break;
                };

                match update {
                    MediaUpdate::PlaybackChanged(_) | MediaUpdate::TrackChanged => {
                        log_now_playing(&controller).await?;
                    }
                    MediaUpdate::TimelineChanged(timeline) => timeline_status(&timeline),
                    MediaUpdate::SessionsChanged(sessions) => {
                        if sessions.is_empty() {
                            log::warn!("当前没有可用的媒体会话。");
                        }
                        for (i, session) in sessions.iter().enumerate() {
                            log::info!("  [{}] {}", i + 1, session.display_name);
                        }
                    }
                    MediaUpdate::Diagnostic(diagnostic) => {
                        log::warn!("[{:?}] {}", diagnostic.level, diagnostic.message);
                    }
                }
            },

            _ = interval.tick() => {
                if controller.is_media_playing()
                    && let Some(timeline) = controller.timeline_info().await?
                {
                    timeline_status(&timeline);
                }
            }
        }
    }

    controller.shutdown()?;
    Ok(())
}
