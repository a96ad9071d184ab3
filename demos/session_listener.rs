use std::io::{BufRead, stdin};

use log::{error, info, warn};
use playback_arbiter::{MediaConfig, MediaManager, MediaUpdate};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => MediaConfig::load(path)?,
        None => MediaConfig::default(),
    };
    info!("传统播放器白名单共 {} 项。", config.allow_list().len());

    let (controller, mut update_rx) = match MediaManager::start(config) {
        Ok((c, rx)) => (c, rx),
        Err(e) => {
            error!("服务启动失败: {e}");
            return Err(e.into());
        }
    };

    let update_task = tokio::spawn(async move {
        while let Some(update) = update_rx.recv().await {
            match update {
                MediaUpdate::SessionsChanged(sessions) => {
                    info!("[会话列表更新] 当前共有 {} 个媒体会话:", sessions.len());
                    for session in sessions {
                        info!(
                            "  - AUMID: {}, Display: {}",
                            session.app_id, session.display_name
                        );
                    }
                }
                MediaUpdate::PlaybackChanged(playing) => info!("[播放状态] {playing}"),
                MediaUpdate::TrackChanged => info!("[曲目变更]"),
                MediaUpdate::Diagnostic(diagnostic) => {
                    warn!("[诊断 {:?}] {}", diagnostic.level, diagnostic.message);
                }
                MediaUpdate::TimelineChanged(_) => {}
            }
        }
    });

    info!("按 Enter 键即可退出程序。");

    let input_task = tokio::task::spawn_blocking(|| {
        let mut buffer = String::new();
        stdin().lock().read_line(&mut buffer)
    });

    input_task.await??;

    controller.shutdown()?;

    update_task.await?;

    Ok(())
}
