use std::{fmt, sync::Arc, time::Duration};

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{MediaError, Result},
    worker::{MediaQuery, WorkerHandle, WorkerMessage},
};

bitflags! {
    /// 当前可用的控制操作
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Controls: u8 {
        /// 是否可以播放
        const CAN_PLAY            = 1 << 0;
        /// 是否可以暂停
        const CAN_PAUSE           = 1 << 1;
        /// 是否可以跳到下一首
        const CAN_SKIP_NEXT       = 1 << 2;
        /// 是否可以跳到上一首
        const CAN_SKIP_PREVIOUS   = 1 << 3;
        /// 是否可以跳转进度
        const CAN_SEEK            = 1 << 4;
        /// 是否可以改变随机播放模式
        const CAN_CHANGE_SHUFFLE  = 1 << 5;
        /// 是否可以改变重复播放模式
        const CAN_CHANGE_REPEAT   = 1 << 6;
    }
}

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlaybackStatus {
    #[default]
    /// 已停止
    Stopped,
    /// 播放中
    Playing,
    /// 已暂停
    Paused,
}

/// 定义重复播放模式的枚举。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RepeatMode {
    #[default]
    /// 不重复播放。
    Off,
    /// 单曲循环。
    One,
    /// 歌单循环。
    All,
}

impl RepeatMode {
    /// 托盘弹窗上“循环”按钮的切换顺序：关闭 → 列表循环 → 单曲循环 → 关闭。
    pub const fn next_in_cycle(self) -> Self {
        match self {
            Self::Off => Self::All,
            Self::All => Self::One,
            Self::One => Self::Off,
        }
    }
}

/// 当前被采信的播放来源。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlaybackSource {
    /// 没有任何来源在播放。
    #[default]
    None,
    /// 系统媒体会话 (SMTC)。
    Modern,
    /// 通过音频会话识别出的传统播放器。
    Legacy,
}

/// 对外发布的聚合播放状态。
///
/// 每次仲裁都会生成一个新值并整体替换旧值，从不原地修改。
/// `is_playing == false` 时 `source` 一定是 [`PlaybackSource::None`]。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlaybackState {
    /// 是否有任何来源正在播放。
    pub is_playing: bool,
    /// 当前被采信的来源。
    pub source: PlaybackSource,
    /// 播放者的身份：SMTC 会话的 AUMID，或传统播放器的可执行文件名。
    pub player_identity: String,
    /// 用于界面显示的播放器名称。
    pub display_name: Option<String>,
}

impl PlaybackState {
    /// 空闲状态。
    pub fn idle() -> Self {
        Self::default()
    }

    pub(crate) fn playing(
        source: PlaybackSource,
        player_identity: impl Into<String>,
        display_name: Option<String>,
    ) -> Self {
        Self {
            is_playing: true,
            source,
            player_identity: player_identity.into(),
            display_name,
        }
    }
}

/// 一张已解析的缩略图。
///
/// `bytes` 是编码后的图片数据 (PNG、JPEG 等)。它要么来自媒体会话的封面，
/// 要么来自传统播放器可执行文件的图标。
#[derive(Clone, PartialEq, Eq)]
pub struct Thumbnail {
    /// 编码后的图片字节。
    pub bytes: Vec<u8>,
    /// 像素宽度。
    pub width: u32,
    /// 像素高度。
    pub height: u32,
}

impl fmt::Debug for Thumbnail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thumbnail")
            .field("len", &self.bytes.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// 当前会话的时间轴。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimelineInfo {
    /// 当前播放位置。
    pub position: Duration,
    /// 曲目时长 (结束时间减去开始时间)。
    pub duration: Duration,
}

/// 会话的播放信息快照。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackInfo {
    /// 播放状态。
    pub status: PlaybackStatus,
    /// 随机播放是否开启。会话未报告时为 `None`。
    pub is_shuffle_active: Option<bool>,
    /// 重复播放模式。会话未报告时为 `None`。
    pub repeat_mode: Option<RepeatMode>,
    /// 会话支持的控制操作。
    pub controls: Controls,
}

/// 弹窗上随机/循环按钮需要的状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlaybackControlsState {
    /// 随机播放是否开启，未知时为 `None`。
    pub shuffle_on: Option<bool>,
    /// 是否处于任意一种循环模式，未知时为 `None`。
    pub repeat_on: Option<bool>,
    /// 当前循环模式。
    pub repeat_mode: RepeatMode,
    /// 会话是否允许切换随机播放。
    pub shuffle_supported: bool,
    /// 会话是否允许切换循环模式。
    pub repeat_supported: bool,
}

impl From<&PlaybackInfo> for PlaybackControlsState {
    fn from(info: &PlaybackInfo) -> Self {
        Self {
            shuffle_on: info.is_shuffle_active,
            repeat_on: info.repeat_mode.map(|mode| mode != RepeatMode::Off),
            repeat_mode: info.repeat_mode.unwrap_or_default(),
            shuffle_supported: info.controls.contains(Controls::CAN_CHANGE_SHUFFLE),
            repeat_supported: info.controls.contains(Controls::CAN_CHANGE_REPEAT),
        }
    }
}

/// 表示一个可用的系统媒体会话。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionInfo {
    /// 会话来源应用的 AUMID。
    pub app_id: String,
    /// 用于在 UI 中显示的名称。
    pub display_name: String,
}

/// 发给单个媒体会话的传输控制操作。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportCommand {
    /// 开始或恢复播放。
    Play,
    /// 暂停播放。
    Pause,
    /// 跳到下一首。
    SkipNext,
    /// 跳到上一首。
    SkipPrevious,
    /// 跳转到指定位置。
    SeekTo(Duration),
    /// 设置随机播放模式。
    SetShuffle(bool),
    /// 设置重复播放模式。
    SetRepeatMode(RepeatMode),
}

/// 发送给后台服务的控制命令。
///
/// 所有命令都是“尽力而为”：当前没有会话，或当前采信的是传统播放器时，它们什么也不做。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MediaCommand {
    /// 正在播放则暂停，否则播放。
    PlayPause,
    /// 开始或恢复播放。
    Play,
    /// 暂停播放。
    Pause,
    /// 跳到下一首。
    Next,
    /// 跳到上一首。
    Previous,
    /// 跳转到指定位置。
    SeekTo(Duration),
    /// 切换随机播放。
    ToggleShuffle,
    /// 按 关闭 → 列表循环 → 单曲循环 的顺序切换循环模式。
    ToggleRepeat,
    /// 请求关闭整个后台服务。
    Shutdown,
}

/// 从后台服务接收的事件。
///
/// 所有事件都在协调线程上按照触发它们的原始信号的顺序发出，且只在值真正变化时发出。
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum MediaUpdate {
    /// 是否正在播放发生了翻转。
    PlaybackChanged(bool),
    /// 播放仍在继续，但播放者或曲目发生了变化。
    TrackChanged,
    /// 当前会话的时间轴发生了变化。
    TimelineChanged(TimelineInfo),
    /// 可用的媒体会话列表已更新。
    SessionsChanged(Vec<SessionInfo>),
    /// 报告一个非致命的运行时诊断信息。
    Diagnostic(DiagnosticInfo),
}

/// 诊断信息的严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    /// 功能降级，但服务仍可用。
    Warning,
    /// 某个子系统无法工作。
    Error,
}

/// 封装一条诊断信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticInfo {
    /// 严重级别。
    pub level: DiagnosticLevel,
    /// 可读的描述。
    pub message: String,
    /// 产生时间。
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticInfo {
    pub(crate) fn now(level: DiagnosticLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 与后台服务交互的控制器。
///
/// 可以自由克隆并在线程间传递。同步查询读取的是最近一次发布的状态快照，
/// 异步查询则在协调线程上求值。
#[derive(Clone)]
pub struct MediaController {
    pub(crate) message_tx: mpsc::UnboundedSender<WorkerMessage>,
    pub(crate) state_rx: watch::Receiver<PlaybackState>,
    pub(crate) worker: Arc<WorkerHandle>,
}

impl MediaController {
    /// 发送一个控制命令。
    pub fn send(&self, command: MediaCommand) -> Result<()> {
        self.message_tx
            .send(WorkerMessage::Command(command))
            .map_err(|_| MediaError::ServiceStopped)
    }

    /// 正在播放则暂停，否则播放。
    pub fn play_pause(&self) -> Result<()> {
        self.send(MediaCommand::PlayPause)
    }

    /// 开始或恢复播放。
    pub fn play(&self) -> Result<()> {
        self.send(MediaCommand::Play)
    }

    /// 暂停播放。
    pub fn pause(&self) -> Result<()> {
        self.send(MediaCommand::Pause)
    }

    /// 跳到下一首。
    pub fn next(&self) -> Result<()> {
        self.send(MediaCommand::Next)
    }

    /// 跳到上一首。
    pub fn previous(&self) -> Result<()> {
        self.send(MediaCommand::Previous)
    }

    /// 跳转到指定位置。
    pub fn seek_to(&self, position: Duration) -> Result<()> {
        self.send(MediaCommand::SeekTo(position))
    }

    /// 切换随机播放。
    pub fn toggle_shuffle(&self) -> Result<()> {
        self.send(MediaCommand::ToggleShuffle)
    }

    /// 切换循环模式。
    pub fn toggle_repeat(&self) -> Result<()> {
        self.send(MediaCommand::ToggleRepeat)
    }

    /// 终止后台线程。
    pub fn shutdown(&self) -> Result<()> {
        self.send(MediaCommand::Shutdown)
    }

    /// 后台线程是否仍在运行。
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// 是否有任何来源正在播放。
    pub fn is_media_playing(&self) -> bool {
        self.state_rx.borrow().is_playing
    }

    /// 当前采信的是否是传统播放器。
    pub fn is_using_legacy_player(&self) -> bool {
        self.state_rx.borrow().source == PlaybackSource::Legacy
    }

    /// 当前播放器的显示名称。
    pub fn current_player_display_name(&self) -> Option<String> {
        self.state_rx.borrow().display_name.clone()
    }

    /// 最近一次发布的完整状态。
    pub fn playback_state(&self) -> PlaybackState {
        self.state_rx.borrow().clone()
    }

    /// 订阅状态快照的变化。适合有多个消费者需要跟踪状态的场景。
    pub fn state_changes(&self) -> watch::Receiver<PlaybackState> {
        self.state_rx.clone()
    }

    /// 当前媒体的描述，格式为 "艺术家 - 标题"，没有艺术家时只有标题。
    pub async fn current_media_info(&self) -> Result<Option<String>> {
        self.query(MediaQuery::MediaInfo).await
    }

    /// 解析当前播放内容的缩略图。
    ///
    /// 每个阶段都有独立的超时，因此这个调用总会在有限时间内返回。
    pub async fn current_thumbnail(&self) -> Result<Option<Thumbnail>> {
        self.current_thumbnail_with(CancellationToken::new()).await
    }

    /// 与 [`Self::current_thumbnail`] 相同，但可以通过 `cancel` 放弃这次请求。
    pub async fn current_thumbnail_with(
        &self,
        cancel: CancellationToken,
    ) -> Result<Option<Thumbnail>> {
        self.query(|reply| MediaQuery::Thumbnail { cancel, reply })
            .await
    }

    /// 当前会话的时间轴。
    pub async fn timeline_info(&self) -> Result<Option<TimelineInfo>> {
        self.query(MediaQuery::Timeline).await
    }

    /// 随机/循环按钮的状态。
    pub async fn playback_controls_state(&self) -> Result<PlaybackControlsState> {
        self.query(MediaQuery::ControlsState).await
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> MediaQuery) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.message_tx
            .send(WorkerMessage::Query(make(reply_tx)))
            .map_err(|_| MediaError::ServiceStopped)?;
        reply_rx.await.map_err(|_| MediaError::ServiceStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_cycle_visits_every_mode() {
        let mut mode = RepeatMode::Off;
        let mut seen = Vec::new();
        for _ in 0..3 {
            mode = mode.next_in_cycle();
            seen.push(mode);
        }
        assert_eq!(seen, vec![RepeatMode::All, RepeatMode::One, RepeatMode::Off]);
    }

    #[test]
    fn test_controls_state_from_playback_info() {
        let info = PlaybackInfo {
            status: PlaybackStatus::Playing,
            is_shuffle_active: Some(true),
            repeat_mode: Some(RepeatMode::One),
            controls: Controls::CAN_CHANGE_REPEAT | Controls::CAN_PLAY,
        };
        let state = PlaybackControlsState::from(&info);
        assert_eq!(state.shuffle_on, Some(true));
        assert_eq!(state.repeat_on, Some(true));
        assert_eq!(state.repeat_mode, RepeatMode::One);
        assert!(!state.shuffle_supported);
        assert!(state.repeat_supported);

        let unknown = PlaybackControlsState::from(&PlaybackInfo::default());
        assert_eq!(unknown.shuffle_on, None);
        assert_eq!(unknown.repeat_on, None);
        assert_eq!(unknown.repeat_mode, RepeatMode::Off);
    }

    #[test]
    fn test_idle_state_has_no_source() {
        let idle = PlaybackState::idle();
        assert!(!idle.is_playing);
        assert_eq!(idle.source, PlaybackSource::None);
        assert!(idle.player_identity.is_empty());
        assert_eq!(idle.display_name, None);
    }

    #[test]
    fn test_thumbnail_debug_hides_bytes() {
        let thumb = Thumbnail {
            bytes: vec![0xAB; 64],
            width: 8,
            height: 8,
        };
        let printed = format!("{thumb:?}");
        assert!(printed.contains("len: 64"));
        assert!(!printed.contains("171"));
    }
}
