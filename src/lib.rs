#![warn(missing_docs)]

//! 一个把系统媒体会话 (SMTC) 和传统播放器的音频活动合并成单一“正在播放”状态的 Rust 库。
//!
//! 很多老式播放器 (Winamp、foobar2000、VLC 等) 不会向系统媒体会话注册自己，
//! 只能通过它们的音频会话是否处于活跃状态来判断是否在播放。`playback-arbiter`
//! 同时观察这两类来源，按固定的规则仲裁出一个结果，并提供以下能力：
//!
//! * **播放状态**: 当前是否在播放、来自哪个来源、哪个播放器。
//! * **事件**: 播放状态变化、曲目变化、时间轴变化、会话列表变化。
//! * **控制**: 对系统媒体会话发送播放、暂停、切歌、跳转、随机和循环命令。
//! * **缩略图**: 获取当前曲目的封面，失败时回落到播放器的程序图标。
//!   所有等待都有上限，请求总会在有限时间内返回。
//!
//! ## 使用方法
//!
//! 1.  调用 [`MediaManager::start()`] 启动后台的协调线程，得到一个
//!     `(MediaController, mpsc::UnboundedReceiver<MediaUpdate>)` 元组。
//! 2.  [`MediaController`] 可以自由克隆，用于发送命令和查询状态。
//! 3.  在一个独立的任务中循环接收 [`MediaUpdate`]。
//! 4.  退出前调用 [`MediaController::shutdown()`] 关闭后台线程。
//!
//! 需要自定义平台实现 (例如在测试中) 时，使用 [`PlaybackService::start()`] 并传入
//! 一个实现了 [`Backend`] 的后端。
//!
//! ## 示例
//!
//! ```no_run
//! use playback_arbiter::{MediaConfig, MediaManager, MediaUpdate};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (controller, mut update_rx) = MediaManager::start(MediaConfig::default())?;
//!
//!     let update_task = tokio::spawn(async move {
//!         while let Some(update) = update_rx.recv().await {
//!             match update {
//!                 MediaUpdate::PlaybackChanged(playing) => println!("正在播放: {playing}"),
//!                 MediaUpdate::TrackChanged => println!("曲目已变更"),
//!                 _ => {}
//!             }
//!         }
//!     });
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     if let Some(info) = controller.current_media_info().await? {
//!         println!("当前媒体: {info}");
//!     }
//!
//!     controller.shutdown()?;
//!     update_task.await?;
//!     Ok(())
//! }
//! ```

mod aggregator;
mod api;
pub mod backend;
mod config;
mod error;
mod legacy;
mod modern;
pub mod platform;
mod tasks;
mod utils;
mod worker;

pub use api::{
    Controls, DiagnosticInfo, DiagnosticLevel, MediaCommand, MediaController, MediaUpdate,
    PlaybackControlsState, PlaybackInfo, PlaybackSource, PlaybackState, PlaybackStatus,
    RepeatMode, SessionInfo, Thumbnail, TimelineInfo, TransportCommand,
};
pub use backend::Backend;
pub use config::{DEFAULT_LEGACY_PLAYERS, LegacyAllowList, MediaConfig};
pub use error::{BackendError, BackendResult, MediaError, Result};

use std::sync::{Arc, LazyLock, Mutex};

use tokio::sync::mpsc;

use crate::worker::WorkerHandle;

static WORKER_HANDLE: LazyLock<Mutex<Option<Arc<WorkerHandle>>>> =
    LazyLock::new(|| Mutex::new(None));

/// 以任意后端启动服务。
///
/// 每次调用都会创建一个独立的协调线程，不受 [`MediaManager`] 的单实例限制。
pub struct PlaybackService;

impl PlaybackService {
    /// 启动协调线程，返回控制器和事件接收器。
    ///
    /// 会话管理器的请求在后台进行，本函数不会等待它完成。
    pub fn start<B: Backend>(
        config: MediaConfig,
        backend: B,
    ) -> Result<(MediaController, mpsc::UnboundedReceiver<MediaUpdate>)> {
        worker::start_media_worker_thread(config, backend)
    }
}

/// `MediaManager` 是本库使用平台默认后端的静态入口点。
pub struct MediaManager;

impl MediaManager {
    /// 启动后台服务，并返回一个控制器和事件接收器。
    ///
    /// 同一时间只允许运行一个实例；上一个实例退出之后可以再次启动。
    ///
    /// # 返回
    /// - `Ok((controller, update_rx))`: 成功启动。
    /// - `Err(MediaError::AlreadyRunning)`: 服务已在运行。
    /// - `Err(MediaError)`: 启动过程中发生了其他错误。
    pub fn start(
        config: MediaConfig,
    ) -> Result<(MediaController, mpsc::UnboundedReceiver<MediaUpdate>)> {
        // 在整个启动过程中持有锁，避免并发的两次启动都通过检查。
        let mut handle_guard = WORKER_HANDLE.lock()?;
        if let Some(handle) = handle_guard.as_ref()
            && handle.is_running()
        {
            return Err(MediaError::AlreadyRunning);
        }

        let (controller, update_rx) =
            PlaybackService::start(config, platform::PlatformBackend::new())?;
        *handle_guard = Some(Arc::clone(&controller.worker));

        Ok((controller, update_rx))
    }
}
