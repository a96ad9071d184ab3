use std::{future::IntoFuture, time::Duration};

use windows::{
    Foundation::{TimeSpan, TypedEventHandler},
    Media::{
        Control::{
            GlobalSystemMediaTransportControlsSession as WinSession,
            GlobalSystemMediaTransportControlsSessionManager as WinManager,
            GlobalSystemMediaTransportControlsSessionPlaybackStatus, PlaybackInfoChangedEventArgs,
            TimelinePropertiesChangedEventArgs,
        },
        MediaPlaybackAutoRepeatMode,
    },
    Storage::Streams::{
        Buffer, DataReader, IRandomAccessStreamReference, IRandomAccessStreamWithContentType,
        InputStreamOptions,
    },
    core::{HSTRING, IUnknown, Interface, Result as WinResult},
};
use windows_future::IAsyncInfo;

use crate::{
    api::{Controls, PlaybackInfo, PlaybackStatus, RepeatMode, TimelineInfo, TransportCommand},
    backend::{
        MediaProperties, MediaSession, SessionManager, SessionRegistry, SessionSignal, SignalSink,
        ThumbnailReference, ThumbnailStream,
    },
    error::BackendResult,
};

/// 在被 drop 时取消一个尚未完成的 WinRT 异步操作。
///
/// 外层的超时会直接 drop 等待中的 Future，这里负责把取消传递给系统。
struct CancelOnDrop(Option<IAsyncInfo>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(info) = self.0.take() {
            log::trace!("[Windows] 正在取消未完成的 WinRT 异步操作。");
            if let Err(e) = info.Cancel() {
                log::warn!("[Windows] 取消 WinRT 异步操作失败: {e:?}");
            }
        }
    }
}

async fn await_operation<F, T>(operation: F) -> BackendResult<T>
where
    F: IntoFuture<Output = WinResult<T>> + Interface,
{
    let guard = match operation.cast::<IAsyncInfo>() {
        Ok(info) => CancelOnDrop(Some(info)),
        Err(e) => {
            log::warn!("[Windows] 无法将异步操作转换为 IAsyncInfo，超时后将无法取消: {e:?}");
            CancelOnDrop(None)
        }
    };
    let result = operation.into_future().await;
    guard.disarm();
    Ok(result?)
}

fn hstring_to_string(hstr: &HSTRING) -> String {
    if hstr.is_empty() {
        String::new()
    } else {
        hstr.to_string_lossy()
    }
}

fn timespan_to_duration(span: TimeSpan) -> Duration {
    // TimeSpan 的单位是 100 纳秒
    Duration::from_nanos(u64::try_from(span.Duration).unwrap_or(0).saturating_mul(100))
}

fn duration_to_ticks(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos() / 100).unwrap_or(i64::MAX)
}

/// 系统媒体会话注册表 (SMTC)。
#[derive(Debug, Default)]
pub struct SmtcRegistry;

impl SessionRegistry for SmtcRegistry {
    type Manager = SmtcManager;

    async fn request_manager(&self) -> BackendResult<SmtcManager> {
        let operation = WinManager::RequestAsync()?;
        let manager = await_operation(operation).await?;
        Ok(SmtcManager { manager })
    }
}

/// SMTC 会话管理器。
pub struct SmtcManager {
    manager: WinManager,
}

impl SessionManager for SmtcManager {
    type Session = SmtcSession;
    type Watch = ManagerWatch;

    fn sessions(&self) -> BackendResult<Vec<SmtcSession>> {
        Ok(self
            .manager
            .GetSessions()?
            .into_iter()
            .map(|session| SmtcSession { session })
            .collect())
    }

    fn current_session(&self) -> BackendResult<Option<SmtcSession>> {
        match self.manager.GetCurrentSession() {
            Ok(session) => Ok(Some(SmtcSession { session })),
            // 没有当前会话时，返回的是一个 HRESULT 为 S_OK 的空错误
            Err(e) if e.code().is_ok() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn watch(&self, sink: SignalSink) -> BackendResult<ManagerWatch> {
        Ok(ManagerWatch::new(self.manager.clone(), sink)?)
    }
}

/// 管理器级事件的 RAII 注册凭据。
pub struct ManagerWatch {
    manager: WinManager,
    tokens: (i64, i64),
}

impl ManagerWatch {
    fn new(manager: WinManager, sink: SignalSink) -> WinResult<Self> {
        let sessions_sink = sink.clone();
        let sessions_token = manager.SessionsChanged(&TypedEventHandler::new(move |_, _| {
            sessions_sink.emit(SessionSignal::SessionsChanged);
            Ok(())
        }))?;

        let current_session_token =
            manager.CurrentSessionChanged(&TypedEventHandler::new(move |_, _| {
                sink.emit(SessionSignal::CurrentSessionChanged);
                Ok(())
            }))?;

        Ok(Self {
            manager,
            tokens: (sessions_token, current_session_token),
        })
    }
}

impl Drop for ManagerWatch {
    fn drop(&mut self) {
        if let Err(e) = self.manager.RemoveSessionsChanged(self.tokens.0) {
            log::warn!("[ManagerWatch] 注销 SessionsChanged 事件失败: {e:?}");
        }
        if let Err(e) = self.manager.RemoveCurrentSessionChanged(self.tokens.1) {
            log::warn!("[ManagerWatch] 注销 CurrentSessionChanged 事件失败: {e:?}");
        }
    }
}

/// 一个 SMTC 会话。
#[derive(Clone)]
pub struct SmtcSession {
    session: WinSession,
}

impl MediaSession for SmtcSession {
    type Thumbnail = SmtcThumbnail;
    type Watch = SessionWatch;

    fn app_id(&self) -> BackendResult<String> {
        Ok(hstring_to_string(&self.session.SourceAppUserModelId()?))
    }

    fn is_same(&self, other: &Self) -> bool {
        // COM 对象的身份以 IUnknown 指针为准
        match (
            self.session.cast::<IUnknown>(),
            other.session.cast::<IUnknown>(),
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    fn playback_info(&self) -> BackendResult<PlaybackInfo> {
        Ok(extract_playback_info(&self.session)?)
    }

    fn timeline(&self) -> BackendResult<TimelineInfo> {
        let timeline = self.session.GetTimelineProperties()?;
        let start = timespan_to_duration(timeline.StartTime()?);
        let end = timespan_to_duration(timeline.EndTime()?);
        Ok(TimelineInfo {
            position: timespan_to_duration(timeline.Position()?),
            duration: end.saturating_sub(start),
        })
    }

    async fn media_properties(&self) -> BackendResult<MediaProperties<SmtcThumbnail>> {
        let properties = await_operation(self.session.TryGetMediaPropertiesAsync()?).await?;
        let text = |value: WinResult<HSTRING>, name: &str| {
            value.map_or_else(
                |e| {
                    log::debug!("[Windows] 获取媒体属性 '{name}' 失败: {e:?}");
                    String::new()
                },
                |hstr| hstring_to_string(&hstr),
            )
        };

        Ok(MediaProperties {
            title: text(properties.Title(), "Title"),
            artist: text(properties.Artist(), "Artist"),
            album_title: text(properties.AlbumTitle(), "AlbumTitle"),
            thumbnail: properties.Thumbnail().ok().map(SmtcThumbnail),
        })
    }

    fn watch(&self, app_id: &str, sink: SignalSink) -> BackendResult<SessionWatch> {
        Ok(SessionWatch::new(self.session.clone(), app_id, sink)?)
    }

    async fn transport(&self, command: TransportCommand) -> BackendResult<bool> {
        let session = &self.session;
        let operation = match command {
            TransportCommand::Play => session.TryPlayAsync()?,
            TransportCommand::Pause => session.TryPauseAsync()?,
            TransportCommand::SkipNext => session.TrySkipNextAsync()?,
            TransportCommand::SkipPrevious => session.TrySkipPreviousAsync()?,
            TransportCommand::SeekTo(position) => {
                session.TryChangePlaybackPositionAsync(duration_to_ticks(position))?
            }
            TransportCommand::SetShuffle(active) => session.TryChangeShuffleActiveAsync(active)?,
            TransportCommand::SetRepeatMode(mode) => {
                let mode = match mode {
                    RepeatMode::Off => MediaPlaybackAutoRepeatMode::None,
                    RepeatMode::One => MediaPlaybackAutoRepeatMode::Track,
                    RepeatMode::All => MediaPlaybackAutoRepeatMode::List,
                };
                session.TryChangeAutoRepeatModeAsync(mode)?
            }
        };
        await_operation(operation).await
    }
}

/// 会话级事件的 RAII 注册凭据。
pub struct SessionWatch {
    session: WinSession,
    tokens: (i64, i64, i64),
}

impl SessionWatch {
    fn new(session: WinSession, app_id: &str, sink: SignalSink) -> WinResult<Self> {
        let media_token = {
            let id = app_id.to_string();
            let sink = sink.clone();
            session.MediaPropertiesChanged(&TypedEventHandler::new(move |_, _| {
                sink.emit(SessionSignal::MediaPropertiesChanged(id.clone()));
                Ok(())
            }))?
        };

        let playback_token = {
            let id = app_id.to_string();
            let sink = sink.clone();
            session.PlaybackInfoChanged(&TypedEventHandler::<
                WinSession,
                PlaybackInfoChangedEventArgs,
            >::new(move |_, _| {
                sink.emit(SessionSignal::PlaybackInfoChanged(id.clone()));
                Ok(())
            }))?
        };

        let timeline_token = {
            let id = app_id.to_string();
            session.TimelinePropertiesChanged(&TypedEventHandler::<
                WinSession,
                TimelinePropertiesChangedEventArgs,
            >::new(move |_, _| {
                sink.emit(SessionSignal::TimelineChanged(id.clone()));
                Ok(())
            }))?
        };

        Ok(Self {
            session,
            tokens: (media_token, playback_token, timeline_token),
        })
    }
}

impl Drop for SessionWatch {
    fn drop(&mut self) {
        if let Err(e) = self.session.RemoveMediaPropertiesChanged(self.tokens.0) {
            log::warn!("[SessionWatch] 注销 MediaPropertiesChanged 事件失败: {e:?}");
        }
        if let Err(e) = self.session.RemovePlaybackInfoChanged(self.tokens.1) {
            log::warn!("[SessionWatch] 注销 PlaybackInfoChanged 事件失败: {e:?}");
        }
        if let Err(e) = self.session.RemoveTimelinePropertiesChanged(self.tokens.2) {
            log::warn!("[SessionWatch] 注销 TimelinePropertiesChanged 事件失败: {e:?}");
        }
    }
}

/// 会话封面的引用。
pub struct SmtcThumbnail(IRandomAccessStreamReference);

impl ThumbnailReference for SmtcThumbnail {
    type Stream = SmtcThumbnailStream;

    async fn open_read(&self) -> BackendResult<SmtcThumbnailStream> {
        let stream = await_operation(self.0.OpenReadAsync()?).await?;
        log::trace!("[Windows] 成功获取到封面流 (IRandomAccessStreamWithContentType)。");
        Ok(SmtcThumbnailStream(stream))
    }
}

/// 已打开的封面流。
pub struct SmtcThumbnailStream(IRandomAccessStreamWithContentType);

impl ThumbnailStream for SmtcThumbnailStream {
    fn size(&self) -> BackendResult<u64> {
        Ok(self.0.Size()?)
    }

    async fn read_all(&self, len: u32) -> BackendResult<Vec<u8>> {
        let buffer = Buffer::Create(len)?;
        let read_operation = self
            .0
            .ReadAsync(&buffer, buffer.Capacity()?, InputStreamOptions::None)?;
        let bytes_buffer = await_operation(read_operation).await?;

        let reader = DataReader::FromBuffer(&bytes_buffer)?;
        let mut bytes = vec![0u8; bytes_buffer.Length()? as usize];
        reader.ReadBytes(&mut bytes)?;
        Ok(bytes)
    }
}

fn extract_playback_info(session: &WinSession) -> WinResult<PlaybackInfo> {
    let info = session.GetPlaybackInfo()?;
    let status = match info.PlaybackStatus()? {
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Playing => PlaybackStatus::Playing,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Paused => PlaybackStatus::Paused,
        _ => PlaybackStatus::Stopped,
    };

    let is_shuffle_active = info.IsShuffleActive().and_then(|opt| opt.Value()).ok();

    let repeat_mode = info
        .AutoRepeatMode()
        .and_then(|opt| opt.Value())
        .map(|mode| match mode {
            MediaPlaybackAutoRepeatMode::Track => RepeatMode::One,
            MediaPlaybackAutoRepeatMode::List => RepeatMode::All,
            _ => RepeatMode::Off,
        })
        .ok();

    let c = info.Controls()?;
    let mut controls = Controls::empty();
    let mut add_control = |flag, check: WinResult<bool>| {
        if check.unwrap_or(false) {
            controls.insert(flag);
        }
    };

    add_control(Controls::CAN_PLAY, c.IsPlayEnabled());
    add_control(Controls::CAN_PAUSE, c.IsPauseEnabled());
    add_control(Controls::CAN_SKIP_NEXT, c.IsNextEnabled());
    add_control(Controls::CAN_SKIP_PREVIOUS, c.IsPreviousEnabled());
    add_control(Controls::CAN_SEEK, c.IsPlaybackPositionEnabled());
    add_control(Controls::CAN_CHANGE_SHUFFLE, c.IsShuffleEnabled());
    add_control(Controls::CAN_CHANGE_REPEAT, c.IsRepeatEnabled());

    Ok(PlaybackInfo {
        status,
        is_shuffle_active,
        repeat_mode,
        controls,
    })
}
