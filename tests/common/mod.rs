#![allow(dead_code)]

use std::{
    collections::HashMap,
    future::pending,
    io::Cursor,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use image::{ImageFormat, RgbaImage};
use playback_arbiter::{
    BackendError, BackendResult, Controls, MediaConfig, MediaController, MediaUpdate,
    PlaybackInfo, PlaybackService, PlaybackState, PlaybackStatus, RepeatMode, Thumbnail,
    TimelineInfo, TransportCommand,
    backend::{
        AudioDevice, AudioSessionGroup, AudioSessionSnapshotProvider, AudioSessionState, Backend,
        BackendParts, IconExtractor, MediaProperties, MediaSession, ProcessLocator,
        ProgramFilesKind, SessionManager, SessionRegistry, SessionSignal, SignalSink,
        ThumbnailReference, ThumbnailStream,
    },
};
use tokio::{sync::mpsc::UnboundedReceiver, time::timeout};

pub const WAIT: Duration = Duration::from_secs(3);

/// 会话在被请求封面时的表现。
#[derive(Debug, Clone)]
pub enum ThumbnailBehaviour {
    Missing,
    Bytes(Vec<u8>),
    HangOnOpen,
    HangOnRead,
}

struct SessionData {
    app_id: String,
    info: PlaybackInfo,
    title: String,
    artist: String,
    album: String,
    timeline: TimelineInfo,
    thumbnail: ThumbnailBehaviour,
    properties_hang: bool,
    listeners: usize,
    registrations: usize,
    opens: usize,
    transports: Vec<TransportCommand>,
}

/// 一个假的系统媒体会话。克隆得到的是同一个会话。
#[derive(Clone)]
pub struct FakeSession {
    data: Arc<Mutex<SessionData>>,
}

impl FakeSession {
    fn new(app_id: &str) -> Self {
        Self {
            data: Arc::new(Mutex::new(SessionData {
                app_id: app_id.to_string(),
                info: PlaybackInfo {
                    status: PlaybackStatus::Paused,
                    is_shuffle_active: Some(false),
                    repeat_mode: Some(RepeatMode::Off),
                    controls: Controls::all(),
                },
                title: String::new(),
                artist: String::new(),
                album: String::new(),
                timeline: TimelineInfo::default(),
                thumbnail: ThumbnailBehaviour::Missing,
                properties_hang: false,
                listeners: 0,
                registrations: 0,
                opens: 0,
                transports: Vec::new(),
            })),
        }
    }

    pub fn app_id(&self) -> String {
        self.data.lock().unwrap().app_id.clone()
    }

    pub fn set_status(&self, status: PlaybackStatus) {
        self.data.lock().unwrap().info.status = status;
    }

    pub fn set_track(&self, title: &str, artist: &str) {
        let mut data = self.data.lock().unwrap();
        data.title = title.to_string();
        data.artist = artist.to_string();
    }

    pub fn set_timeline(&self, position: Duration, duration: Duration) {
        self.data.lock().unwrap().timeline = TimelineInfo { position, duration };
    }

    pub fn set_thumbnail(&self, thumbnail: ThumbnailBehaviour) {
        self.data.lock().unwrap().thumbnail = thumbnail;
    }

    pub fn set_repeat(&self, mode: Option<RepeatMode>) {
        self.data.lock().unwrap().info.repeat_mode = mode;
    }

    pub fn hang_properties(&self) {
        self.data.lock().unwrap().properties_hang = true;
    }

    pub fn listeners(&self) -> usize {
        self.data.lock().unwrap().listeners
    }

    /// 历史上注册过的监听总数，包括已注销的。
    pub fn registrations(&self) -> usize {
        self.data.lock().unwrap().registrations
    }

    pub fn opens(&self) -> usize {
        self.data.lock().unwrap().opens
    }

    pub fn transports(&self) -> Vec<TransportCommand> {
        self.data.lock().unwrap().transports.clone()
    }
}

/// 会话级监听的凭据，drop 时减少计数。
pub struct SessionListener(Arc<Mutex<SessionData>>);

impl Drop for SessionListener {
    fn drop(&mut self) {
        self.0.lock().unwrap().listeners -= 1;
    }
}

impl MediaSession for FakeSession {
    type Thumbnail = FakeThumbnail;
    type Watch = SessionListener;

    fn app_id(&self) -> BackendResult<String> {
        Ok(self.app_id())
    }

    fn is_same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    fn playback_info(&self) -> BackendResult<PlaybackInfo> {
        Ok(self.data.lock().unwrap().info)
    }

    fn timeline(&self) -> BackendResult<TimelineInfo> {
        Ok(self.data.lock().unwrap().timeline)
    }

    async fn media_properties(&self) -> BackendResult<MediaProperties<FakeThumbnail>> {
        let (hang, properties) = {
            let data = self.data.lock().unwrap();
            let thumbnail = match &data.thumbnail {
                ThumbnailBehaviour::Missing => None,
                behaviour => Some(FakeThumbnail {
                    behaviour: behaviour.clone(),
                    session: Arc::clone(&self.data),
                }),
            };
            (
                data.properties_hang,
                MediaProperties {
                    title: data.title.clone(),
                    artist: data.artist.clone(),
                    album_title: data.album.clone(),
                    thumbnail,
                },
            )
        };
        if hang {
            pending::<()>().await;
        }
        Ok(properties)
    }

    fn watch(&self, _app_id: &str, _sink: SignalSink) -> BackendResult<SessionListener> {
        let mut data = self.data.lock().unwrap();
        data.listeners += 1;
        data.registrations += 1;
        Ok(SessionListener(Arc::clone(&self.data)))
    }

    async fn transport(&self, command: TransportCommand) -> BackendResult<bool> {
        let mut data = self.data.lock().unwrap();
        data.transports.push(command);
        match command {
            TransportCommand::Play => data.info.status = PlaybackStatus::Playing,
            TransportCommand::Pause => data.info.status = PlaybackStatus::Paused,
            TransportCommand::SetShuffle(active) => data.info.is_shuffle_active = Some(active),
            TransportCommand::SetRepeatMode(mode) => data.info.repeat_mode = Some(mode),
            _ => {}
        }
        Ok(true)
    }
}

pub struct FakeThumbnail {
    behaviour: ThumbnailBehaviour,
    session: Arc<Mutex<SessionData>>,
}

impl ThumbnailReference for FakeThumbnail {
    type Stream = FakeStream;

    async fn open_read(&self) -> BackendResult<FakeStream> {
        self.session.lock().unwrap().opens += 1;
        if matches!(self.behaviour, ThumbnailBehaviour::HangOnOpen) {
            pending::<()>().await;
        }
        Ok(FakeStream {
            behaviour: self.behaviour.clone(),
        })
    }
}

pub struct FakeStream {
    behaviour: ThumbnailBehaviour,
}

impl ThumbnailStream for FakeStream {
    fn size(&self) -> BackendResult<u64> {
        Ok(match &self.behaviour {
            ThumbnailBehaviour::Bytes(bytes) => bytes.len() as u64,
            _ => 4096,
        })
    }

    async fn read_all(&self, _len: u32) -> BackendResult<Vec<u8>> {
        match &self.behaviour {
            ThumbnailBehaviour::Bytes(bytes) => Ok(bytes.clone()),
            _ => {
                pending::<()>().await;
                Ok(Vec::new())
            }
        }
    }
}

#[derive(Default)]
struct WorldData {
    sessions: Vec<FakeSession>,
    current: Option<FakeSession>,
    manager_listeners: usize,
    sink: Option<SignalSink>,
}

/// 假的会话注册表的全部状态，测试线程和协调线程共享。
#[derive(Clone, Default)]
pub struct FakeWorld {
    data: Arc<Mutex<WorldData>>,
}

impl FakeWorld {
    /// 添加一个会话并把它设为当前会话。不会发出任何信号。
    pub fn add_session(&self, app_id: &str) -> FakeSession {
        let session = FakeSession::new(app_id);
        let mut data = self.data.lock().unwrap();
        data.sessions.push(session.clone());
        data.current = Some(session.clone());
        session
    }

    pub fn remove_session(&self, app_id: &str) {
        let mut data = self.data.lock().unwrap();
        data.sessions.retain(|session| session.app_id() != app_id);
        if data
            .current
            .as_ref()
            .is_some_and(|session| session.app_id() == app_id)
        {
            data.current = data.sessions.first().cloned();
        }
    }

    /// 只移除这一个会话对象，同 AUMID 的其他会话保留。
    pub fn remove(&self, target: &FakeSession) {
        let mut data = self.data.lock().unwrap();
        data.sessions.retain(|session| !session.is_same(target));
        if data
            .current
            .as_ref()
            .is_some_and(|session| session.is_same(target))
        {
            data.current = data.sessions.first().cloned();
        }
    }

    pub fn set_current(&self, session: Option<&FakeSession>) {
        self.data.lock().unwrap().current = session.cloned();
    }

    pub fn manager_listeners(&self) -> usize {
        self.data.lock().unwrap().manager_listeners
    }

    /// 模拟一个系统回调。
    pub fn emit(&self, signal: SessionSignal) {
        let sink = self.data.lock().unwrap().sink.clone();
        let sink = sink.expect("manager has not been watched yet");
        assert!(sink.emit(signal), "coordinator is gone");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryMode {
    Ready,
    Unavailable,
    Hang,
}

pub struct FakeRegistry {
    mode: RegistryMode,
    world: FakeWorld,
}

impl SessionRegistry for FakeRegistry {
    type Manager = FakeManager;

    async fn request_manager(&self) -> BackendResult<FakeManager> {
        match self.mode {
            RegistryMode::Ready => Ok(FakeManager {
                world: self.world.clone(),
            }),
            RegistryMode::Unavailable => Err(BackendError::Unavailable(
                "no session registry in tests".to_string(),
            )),
            RegistryMode::Hang => pending().await,
        }
    }
}

pub struct FakeManager {
    world: FakeWorld,
}

pub struct ManagerListener(FakeWorld);

impl Drop for ManagerListener {
    fn drop(&mut self) {
        self.0.data.lock().unwrap().manager_listeners -= 1;
    }
}

impl SessionManager for FakeManager {
    type Session = FakeSession;
    type Watch = ManagerListener;

    fn sessions(&self) -> BackendResult<Vec<FakeSession>> {
        Ok(self.world.data.lock().unwrap().sessions.clone())
    }

    fn current_session(&self) -> BackendResult<Option<FakeSession>> {
        Ok(self.world.data.lock().unwrap().current.clone())
    }

    fn watch(&self, sink: SignalSink) -> BackendResult<ManagerListener> {
        let mut data = self.world.data.lock().unwrap();
        data.manager_listeners += 1;
        data.sink = Some(sink);
        Ok(ManagerListener(self.world.clone()))
    }
}

/// 可以在运行中修改的音频会话快照。`None` 表示快照失败。
#[derive(Clone)]
pub struct FakeSnapshots {
    devices: Arc<Mutex<Option<Vec<AudioDevice>>>>,
}

impl Default for FakeSnapshots {
    fn default() -> Self {
        Self {
            devices: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }
}

impl FakeSnapshots {
    pub fn set_groups(&self, groups: &[(&str, AudioSessionState)]) {
        let groups = groups
            .iter()
            .map(|(exe, state)| AudioSessionGroup {
                state: *state,
                exe_name: Some((*exe).to_string()),
                display_name: None,
            })
            .collect();
        *self.devices.lock().unwrap() = Some(vec![AudioDevice {
            id: "speakers".to_string(),
            groups,
        }]);
    }

    pub fn set_active(&self, exe: &str) {
        self.set_groups(&[(exe, AudioSessionState::Active)]);
    }

    pub fn clear(&self) {
        *self.devices.lock().unwrap() = Some(Vec::new());
    }

    pub fn fail(&self) {
        *self.devices.lock().unwrap() = None;
    }
}

impl AudioSessionSnapshotProvider for FakeSnapshots {
    fn devices(&self) -> BackendResult<Vec<AudioDevice>> {
        self.devices
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BackendError::Faulted("snapshot failed".to_string()))
    }
}

#[derive(Default)]
pub struct FakeProcesses {
    running: Mutex<HashMap<String, PathBuf>>,
    titles: Mutex<HashMap<String, String>>,
}

impl FakeProcesses {
    pub fn add_running(&self, name: &str, path: &str) {
        self.running
            .lock()
            .unwrap()
            .insert(name.to_string(), PathBuf::from(path));
    }

    pub fn set_window_title(&self, name: &str, title: &str) {
        self.titles
            .lock()
            .unwrap()
            .insert(name.to_string(), title.to_string());
    }
}

impl ProcessLocator for FakeProcesses {
    fn running_executable_path(&self, process_name: &str) -> Option<PathBuf> {
        self.running.lock().unwrap().get(process_name).cloned()
    }

    fn path_exists(&self, _path: &Path) -> bool {
        false
    }

    fn main_window_title(&self, process_name: &str) -> Option<String> {
        self.titles.lock().unwrap().get(process_name).cloned()
    }

    fn program_files(&self, _kind: ProgramFilesKind) -> Option<PathBuf> {
        None
    }
}

#[derive(Default)]
pub struct FakeIcons {
    extracted: Mutex<Vec<PathBuf>>,
    blocked: AtomicBool,
}

impl FakeIcons {
    pub fn extracted(&self) -> Vec<PathBuf> {
        self.extracted.lock().unwrap().clone()
    }

    /// 之后的提取会一直阻塞，直到 `unblock`。
    pub fn block(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }

    pub fn unblock(&self) {
        self.blocked.store(false, Ordering::SeqCst);
    }
}

impl IconExtractor for FakeIcons {
    fn extract(&self, path: &Path) -> BackendResult<Thumbnail> {
        self.extracted.lock().unwrap().push(path.to_path_buf());
        while self.blocked.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(Thumbnail {
            bytes: png_bytes(16, 16),
            width: 16,
            height: 16,
        })
    }
}

pub struct FakeBackend {
    registry: FakeRegistry,
    snapshots: FakeSnapshots,
    processes: Arc<FakeProcesses>,
    icons: Arc<FakeIcons>,
}

impl Backend for FakeBackend {
    type Registry = FakeRegistry;
    type Snapshots = FakeSnapshots;
    type Processes = FakeProcesses;
    type Icons = FakeIcons;
    type ThreadGuard = ();

    fn attach_thread(&self) -> BackendResult<()> {
        Ok(())
    }

    fn into_parts(self) -> BackendParts<FakeRegistry, FakeSnapshots, FakeProcesses, FakeIcons> {
        BackendParts {
            registry: self.registry,
            snapshots: self.snapshots,
            processes: self.processes,
            icons: self.icons,
        }
    }
}

/// 一套假的平台协作者，以及测试可以直接操纵的句柄。
pub struct Harness {
    pub mode: RegistryMode,
    pub world: FakeWorld,
    pub snapshots: FakeSnapshots,
    pub processes: Arc<FakeProcesses>,
    pub icons: Arc<FakeIcons>,
}

impl Harness {
    pub fn new(mode: RegistryMode) -> Self {
        Self {
            mode,
            world: FakeWorld::default(),
            snapshots: FakeSnapshots::default(),
            processes: Arc::new(FakeProcesses::default()),
            icons: Arc::new(FakeIcons::default()),
        }
    }

    pub fn backend(&self) -> FakeBackend {
        FakeBackend {
            registry: FakeRegistry {
                mode: self.mode,
                world: self.world.clone(),
            },
            snapshots: self.snapshots.clone(),
            processes: Arc::clone(&self.processes),
            icons: Arc::clone(&self.icons),
        }
    }

    pub fn start(&self) -> (MediaController, UnboundedReceiver<MediaUpdate>) {
        self.start_with(test_config())
    }

    pub fn start_with(
        &self,
        config: MediaConfig,
    ) -> (MediaController, UnboundedReceiver<MediaUpdate>) {
        PlaybackService::start(config, self.backend()).expect("service should start")
    }

    /// 启动服务并等待会话管理器就绪。
    pub async fn start_ready(&self) -> (MediaController, UnboundedReceiver<MediaUpdate>) {
        let started = self.start();
        let world = self.world.clone();
        wait_until(move || world.manager_listeners() == 1).await;
        started
    }
}

/// 测试用的配置：很短的轮询周期和超时，没有启动延迟。
pub fn test_config() -> MediaConfig {
    MediaConfig {
        legacy_poll_interval_ms: 20,
        legacy_start_delay_ms: 0,
        manager_request_timeout_ms: 300,
        properties_timeout_ms: 150,
        thumbnail_stream_timeout_ms: 150,
        thumbnail_read_timeout_ms: 150,
        icon_timeout_ms: 500,
        transport_timeout_ms: 300,
        ..MediaConfig::default()
    }
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_pixel(width, height, image::Rgba([200, 40, 40, 255]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("png encoding should succeed");
    out.into_inner()
}

/// 等待下一个满足条件的事件，跳过其他事件。
pub async fn wait_for_update(
    rx: &mut UnboundedReceiver<MediaUpdate>,
    mut predicate: impl FnMut(&MediaUpdate) -> bool,
) -> MediaUpdate {
    timeout(WAIT, async {
        loop {
            let update = rx.recv().await.expect("update channel closed");
            if predicate(&update) {
                return update;
            }
        }
    })
    .await
    .expect("timed out waiting for update")
}

/// 断言在 `quiet` 时间内没有任何事件。
pub async fn assert_no_update(rx: &mut UnboundedReceiver<MediaUpdate>, quiet: Duration) {
    if let Ok(Some(update)) = timeout(quiet, rx.recv()).await {
        panic!("unexpected update: {update:?}");
    }
}

/// 丢弃所有已经到达的事件。
pub fn drain(rx: &mut UnboundedReceiver<MediaUpdate>) {
    while rx.try_recv().is_ok() {}
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

pub async fn wait_for_state(
    controller: &MediaController,
    predicate: impl FnMut(&PlaybackState) -> bool,
) -> PlaybackState {
    let mut changes = controller.state_changes();
    let state = timeout(WAIT, changes.wait_for(predicate))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed")
        .clone();
    state
}
