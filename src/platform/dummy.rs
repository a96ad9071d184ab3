//! 非 Windows 平台上的后端。没有系统媒体会话，也没有音频会话。

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    api::{PlaybackInfo, Thumbnail, TimelineInfo, TransportCommand},
    backend::{
        AudioDevice, AudioSessionSnapshotProvider, Backend, BackendParts, IconExtractor,
        MediaProperties, MediaSession, ProcessLocator, SessionManager, SessionRegistry,
        SignalSink, ThumbnailReference, ThumbnailStream,
    },
    error::{BackendError, BackendResult},
};

/// 永远不可用的会话注册表。
#[derive(Debug, Default)]
pub struct UnavailableRegistry;

/// 不存在的会话管理器。
#[derive(Debug)]
pub enum NoManager {}

/// 不存在的会话。
#[derive(Debug, Clone)]
pub enum NoSession {}

/// 不存在的封面。
#[derive(Debug)]
pub enum NoThumbnail {}

impl SessionRegistry for UnavailableRegistry {
    type Manager = NoManager;

    async fn request_manager(&self) -> BackendResult<NoManager> {
        Err(BackendError::Unavailable(
            "当前平台没有系统媒体会话".to_string(),
        ))
    }
}

impl SessionManager for NoManager {
    type Session = NoSession;
    type Watch = ();

    fn sessions(&self) -> BackendResult<Vec<NoSession>> {
        match *self {}
    }

    fn current_session(&self) -> BackendResult<Option<NoSession>> {
        match *self {}
    }

    fn watch(&self, _sink: SignalSink) -> BackendResult<()> {
        match *self {}
    }
}

impl MediaSession for NoSession {
    type Thumbnail = NoThumbnail;
    type Watch = ();

    fn app_id(&self) -> BackendResult<String> {
        match *self {}
    }

    fn is_same(&self, _other: &Self) -> bool {
        match *self {}
    }

    fn playback_info(&self) -> BackendResult<PlaybackInfo> {
        match *self {}
    }

    fn timeline(&self) -> BackendResult<TimelineInfo> {
        match *self {}
    }

    async fn media_properties(&self) -> BackendResult<MediaProperties<NoThumbnail>> {
        match *self {}
    }

    fn watch(&self, _app_id: &str, _sink: SignalSink) -> BackendResult<()> {
        match *self {}
    }

    async fn transport(&self, _command: TransportCommand) -> BackendResult<bool> {
        match *self {}
    }
}

impl ThumbnailReference for NoThumbnail {
    type Stream = NoThumbnail;

    async fn open_read(&self) -> BackendResult<NoThumbnail> {
        match *self {}
    }
}

impl ThumbnailStream for NoThumbnail {
    fn size(&self) -> BackendResult<u64> {
        match *self {}
    }

    async fn read_all(&self, _len: u32) -> BackendResult<Vec<u8>> {
        match *self {}
    }
}

/// 没有任何音频会话。
#[derive(Debug, Default)]
pub struct NoAudioSessions;

impl AudioSessionSnapshotProvider for NoAudioSessions {
    fn devices(&self) -> BackendResult<Vec<AudioDevice>> {
        Ok(Vec::new())
    }
}

/// 找不到任何进程。
#[derive(Debug, Default)]
pub struct NoProcesses;

impl ProcessLocator for NoProcesses {
    fn running_executable_path(&self, _process_name: &str) -> Option<PathBuf> {
        None
    }

    fn main_window_title(&self, _process_name: &str) -> Option<String> {
        None
    }
}

/// 不支持图标提取。
#[derive(Debug, Default)]
pub struct NoIcons;

impl IconExtractor for NoIcons {
    fn extract(&self, _path: &Path) -> BackendResult<Thumbnail> {
        Err(BackendError::Unsupported("当前平台不支持提取程序图标"))
    }
}

/// 非 Windows 平台上的默认后端。聚合器在它上面永远报告“没有播放”。
#[derive(Debug, Default)]
pub struct DummyBackend;

impl DummyBackend {
    /// 创建后端。
    pub const fn new() -> Self {
        Self
    }
}

impl Backend for DummyBackend {
    type Registry = UnavailableRegistry;
    type Snapshots = NoAudioSessions;
    type Processes = NoProcesses;
    type Icons = NoIcons;
    type ThreadGuard = ();

    fn attach_thread(&self) -> BackendResult<()> {
        Ok(())
    }

    fn into_parts(self) -> BackendParts<UnavailableRegistry, NoAudioSessions, NoProcesses, NoIcons> {
        BackendParts {
            registry: UnavailableRegistry,
            snapshots: NoAudioSessions,
            processes: Arc::new(NoProcesses),
            icons: Arc::new(NoIcons),
        }
    }
}
