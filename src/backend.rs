//! 平台协作者的抽象。
//!
//! 聚合器只通过这里的 trait 与操作系统打交道：Windows 上由 [`crate::platform`]
//! 实现，其他平台上由一个永远“什么都没有”的后端实现，测试里则使用假的实现。
//!
//! 会话相关的 trait 返回的 Future 不要求 `Send`，它们只在协调线程的 `LocalSet` 上被驱动。

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::mpsc;

use crate::{
    api::{PlaybackInfo, Thumbnail, TimelineInfo, TransportCommand},
    error::BackendResult,
};

/// 操作系统回调投递给协调线程的原始信号。
///
/// 回调本身从不触碰状态，只负责把信号放进队列。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// 会话列表发生了变化。
    SessionsChanged,
    /// 系统认定的“当前会话”发生了变化。
    CurrentSessionChanged,
    /// 某个会话的播放信息发生了变化。参数是会话的 AUMID。
    PlaybackInfoChanged(String),
    /// 某个会话的媒体属性 (标题、艺术家等) 发生了变化。
    MediaPropertiesChanged(String),
    /// 某个会话的时间轴发生了变化。
    TimelineChanged(String),
}

/// 原始信号的投递端。可以在任意线程上使用。
#[derive(Debug, Clone)]
pub struct SignalSink {
    tx: mpsc::UnboundedSender<SessionSignal>,
}

impl SignalSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionSignal>) -> Self {
        Self { tx }
    }

    /// 投递一个信号。协调线程已经退出时返回 `false`。
    pub fn emit(&self, signal: SessionSignal) -> bool {
        self.tx.send(signal).is_ok()
    }
}

/// 会话的媒体属性。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaProperties<T> {
    /// 曲目标题。
    pub title: String,
    /// 艺术家。
    pub artist: String,
    /// 专辑标题。
    pub album_title: String,
    /// 封面的引用，尚未打开。
    pub thumbnail: Option<T>,
}

/// 系统媒体会话注册表的入口。
pub trait SessionRegistry: 'static {
    /// 会话管理器。
    type Manager: SessionManager;

    /// 异步地请求会话管理器。调用方负责为这个等待设置上限。
    fn request_manager(&self) -> impl Future<Output = BackendResult<Self::Manager>>;
}

/// 会话管理器。
pub trait SessionManager: 'static {
    /// 会话句柄。
    type Session: MediaSession;
    /// 列表/当前会话通知的注册凭据，被 drop 时注销监听。
    type Watch;

    /// 列出所有会话。
    fn sessions(&self) -> BackendResult<Vec<Self::Session>>;

    /// 系统认定的当前会话。
    fn current_session(&self) -> BackendResult<Option<Self::Session>>;

    /// 注册会话列表变化和当前会话变化的监听。
    fn watch(&self, sink: SignalSink) -> BackendResult<Self::Watch>;
}

/// 一个系统媒体会话的句柄。适配器只观察它，从不拥有它的生命周期。
pub trait MediaSession: Clone + 'static {
    /// 封面引用。
    type Thumbnail: ThumbnailReference;
    /// 会话通知的注册凭据，被 drop 时注销全部三类监听。
    type Watch;

    /// 来源应用的 AUMID。
    fn app_id(&self) -> BackendResult<String>;

    /// 两个句柄是否指向同一个底层会话对象。
    fn is_same(&self, other: &Self) -> bool;

    /// 播放信息。
    fn playback_info(&self) -> BackendResult<PlaybackInfo>;

    /// 时间轴。
    fn timeline(&self) -> BackendResult<TimelineInfo>;

    /// 异步读取媒体属性。
    fn media_properties(
        &self,
    ) -> impl Future<Output = BackendResult<MediaProperties<Self::Thumbnail>>>;

    /// 注册播放信息、媒体属性和时间轴三类监听，信号中携带 `app_id`。
    fn watch(&self, app_id: &str, sink: SignalSink) -> BackendResult<Self::Watch>;

    /// 执行一个传输控制操作。返回会话是否接受了这个请求。
    fn transport(&self, command: TransportCommand) -> impl Future<Output = BackendResult<bool>>;
}

/// 尚未打开的封面引用。
pub trait ThumbnailReference: 'static {
    /// 打开后的流。
    type Stream: ThumbnailStream;

    /// 异步打开封面流。
    fn open_read(&self) -> impl Future<Output = BackendResult<Self::Stream>>;
}

/// 已打开的封面流。
pub trait ThumbnailStream: 'static {
    /// 流的总字节数。
    fn size(&self) -> BackendResult<u64>;

    /// 异步读取 `len` 个字节。
    fn read_all(&self, len: u32) -> impl Future<Output = BackendResult<Vec<u8>>>;
}

/// 音频会话组的状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioSessionState {
    /// 没有在输出声音。
    Inactive,
    /// 正在输出声音。
    Active,
    /// 已经结束。
    Expired,
}

/// 某个应用在一个播放设备上的音频会话组。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSessionGroup {
    /// 组的状态。同一应用的多个会话中只要有一个活跃，组就是活跃的。
    pub state: AudioSessionState,
    /// 拥有者进程的可执行文件名，例如 "vlc.exe"。
    pub exe_name: Option<String>,
    /// 应用给会话设置的显示名称。
    pub display_name: Option<String>,
}

/// 一个播放设备及其上的会话组。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDevice {
    /// 设备 ID。
    pub id: String,
    /// 设备上的会话组。
    pub groups: Vec<AudioSessionGroup>,
}

/// 音频会话快照的提供者。只读，被轮询。
pub trait AudioSessionSnapshotProvider: 'static {
    /// 枚举所有播放设备及其会话组。
    fn devices(&self) -> BackendResult<Vec<AudioDevice>>;
}

/// Program Files 目录的种类。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramFilesKind {
    /// 与系统位数一致的 Program Files。
    Native,
    /// 32 位程序使用的 Program Files (x86)。
    X86,
}

/// 进程与文件系统查询。会在阻塞线程池中被调用。
pub trait ProcessLocator: Send + Sync + 'static {
    /// 按名称 (不带扩展名) 查找正在运行的进程，返回其可执行文件路径。
    fn running_executable_path(&self, process_name: &str) -> Option<PathBuf>;

    /// 路径是否存在。
    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// 按名称 (不带扩展名) 查找进程的主窗口标题。
    fn main_window_title(&self, process_name: &str) -> Option<String>;

    /// Program Files 根目录。
    fn program_files(&self, kind: ProgramFilesKind) -> Option<PathBuf> {
        let var = match kind {
            ProgramFilesKind::Native => "ProgramFiles",
            ProgramFilesKind::X86 => "ProgramFiles(x86)",
        };
        std::env::var_os(var).map(PathBuf::from)
    }
}

/// 从可执行文件中提取图标。会在阻塞线程池中被调用。
pub trait IconExtractor: Send + Sync + 'static {
    /// 提取 `path` 的主图标并编码为图片。
    fn extract(&self, path: &Path) -> BackendResult<Thumbnail>;
}

/// 一个平台后端拆分后的协作者。
pub struct BackendParts<R, S, P, I> {
    /// 会话注册表。
    pub registry: R,
    /// 音频会话快照。
    pub snapshots: S,
    /// 进程查询。
    pub processes: Arc<P>,
    /// 图标提取。
    pub icons: Arc<I>,
}

/// 把四个协作者打包成一个可以移动到协调线程的后端。
pub trait Backend: Send + 'static {
    /// 会话注册表。
    type Registry: SessionRegistry;
    /// 音频会话快照。
    type Snapshots: AudioSessionSnapshotProvider;
    /// 进程查询。
    type Processes: ProcessLocator;
    /// 图标提取。
    type Icons: IconExtractor;
    /// 线程初始化的凭据，在协调线程退出时被 drop。
    type ThreadGuard;

    /// 在协调线程上、任何其他调用之前执行一次。
    fn attach_thread(&self) -> BackendResult<Self::ThreadGuard>;

    /// 拆分出各个协作者。在协调线程上调用。
    fn into_parts(
        self,
    ) -> BackendParts<Self::Registry, Self::Snapshots, Self::Processes, Self::Icons>;
}
