// 本模块只在协调线程的 LocalSet 中运行
#![allow(clippy::future_not_send)]

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    api::{
        DiagnosticInfo, DiagnosticLevel, MediaCommand, MediaUpdate, PlaybackControlsState,
        PlaybackSource, PlaybackState, SessionInfo, Thumbnail, TimelineInfo,
    },
    backend::{
        AudioSessionSnapshotProvider, IconExtractor, MediaSession, ProcessLocator, SessionManager,
        SessionSignal,
    },
    error::BackendResult,
    legacy::{ExecutableResolver, LegacyObservation, LegacyPoller},
    modern::{ModernPlaying, ModernSessionAdapter},
    tasks::{ArtOrigin, ArtResolver, fetch_properties},
    utils::compose_media_info,
    worker::MediaQuery,
};

/// 会话在加载新曲目时短暂报告的占位标题，不算一次曲目变化。
const TRANSIENT_TITLES: &[&str] = &["正在连接…", "Connecting…"];

/// 仲裁规则：系统媒体会话只要在播放就是权威来源；
/// 只有它没有在播放时才采信传统播放器；都没有则为空闲。
pub(crate) fn arbitrate(
    modern: Option<&ModernPlaying>,
    legacy: &LegacyObservation,
) -> PlaybackState {
    if let Some(playing) = modern {
        return PlaybackState::playing(
            PlaybackSource::Modern,
            playing.app_id.clone(),
            Some(playing.display_name()),
        );
    }
    if legacy.playing {
        return PlaybackState::playing(
            PlaybackSource::Legacy,
            legacy.exe_name.clone(),
            legacy.display_name.clone(),
        );
    }
    PlaybackState::idle()
}

/// 用于判断元数据通知是否真的换了曲目。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TrackKey {
    app_id: String,
    title: String,
    artist: String,
    album: String,
}

/// 最近一次从会话封面解析出的缩略图，以及它所属的来源和曲目。
///
/// `generation` 与聚合器的失效计数不一致的结果不会进入缓存。
#[derive(Debug, Clone)]
pub(crate) struct CachedArt {
    generation: u64,
    source: PlaybackSource,
    identity: String,
    track: Option<TrackKey>,
    thumbnail: Thumbnail,
}

/// 读取当前曲目的键。超时、失败或占位标题都视为“没有答案”。
async fn read_track_key<S: MediaSession>(session: &S, limit: Duration) -> Option<TrackKey> {
    let app_id = session
        .app_id()
        .inspect_err(|e| log::debug!("[Aggregator] 读取当前会话 AUMID 失败: {e}"))
        .ok()?;
    let properties = match fetch_properties(session, limit).await {
        Ok(properties) => properties,
        Err(e) => {
            log::debug!("[Aggregator] 读取 '{app_id}' 的媒体属性失败: {e}");
            return None;
        }
    };
    if TRANSIENT_TITLES.contains(&properties.title.as_str()) {
        log::trace!("[Aggregator] 忽略占位标题 '{}'。", properties.title);
        return None;
    }
    if properties.title.is_empty() && properties.artist.is_empty() {
        return None;
    }
    Some(TrackKey {
        app_id,
        title: properties.title,
        artist: properties.artist,
        album: properties.album_title,
    })
}

/// 聚合器。拥有唯一的已发布状态，所有写入和事件发布都发生在协调线程上。
pub(crate) struct Aggregator<M: SessionManager, S, P, I> {
    modern: ModernSessionAdapter<M>,
    legacy: LegacyPoller<S>,
    executables: Arc<ExecutableResolver<P>>,
    art: ArtResolver<P, I>,
    properties_timeout: Duration,

    published: watch::Sender<PlaybackState>,
    update_tx: mpsc::UnboundedSender<MediaUpdate>,
    command_tx: mpsc::UnboundedSender<(M::Session, MediaCommand)>,
    art_tx: mpsc::UnboundedSender<CachedArt>,

    last_track: Option<TrackKey>,
    last_timeline: Option<TimelineInfo>,
    last_sessions: Vec<SessionInfo>,
    art_cache: Option<CachedArt>,
    art_generation: u64,
}

/// 构造聚合器需要的通道。
pub(crate) struct AggregatorChannels<T> {
    pub published: watch::Sender<PlaybackState>,
    pub update_tx: mpsc::UnboundedSender<MediaUpdate>,
    pub command_tx: mpsc::UnboundedSender<(T, MediaCommand)>,
    pub art_tx: mpsc::UnboundedSender<CachedArt>,
}

impl<M, S, P, I> Aggregator<M, S, P, I>
where
    M: SessionManager,
    S: AudioSessionSnapshotProvider,
    P: ProcessLocator,
    I: IconExtractor,
{
    pub fn new(
        modern: ModernSessionAdapter<M>,
        legacy: LegacyPoller<S>,
        executables: Arc<ExecutableResolver<P>>,
        art: ArtResolver<P, I>,
        properties_timeout: Duration,
        channels: AggregatorChannels<M::Session>,
    ) -> Self {
        Self {
            modern,
            legacy,
            executables,
            art,
            properties_timeout,
            published: channels.published,
            update_tx: channels.update_tx,
            command_tx: channels.command_tx,
            art_tx: channels.art_tx,
            last_track: None,
            last_timeline: None,
            last_sessions: Vec::new(),
            art_cache: None,
            art_generation: 0,
        }
    }

    fn emit(&self, update: MediaUpdate) {
        if self.update_tx.send(update).is_err() {
            log::trace!("[Aggregator] 没有事件接收者，丢弃更新。");
        }
    }

    /// 发布一个新状态。值未变时什么都不做。
    ///
    /// 返回是否因此发出了 `PlaybackChanged` 或 `TrackChanged`。
    fn publish(&mut self, next: PlaybackState) -> bool {
        let previous = self.published.borrow().clone();
        if previous == next {
            return false;
        }

        log::debug!(
            "[Aggregator] 状态变化: {:?}('{}') -> {:?}('{}')",
            previous.source,
            previous.player_identity,
            next.source,
            next.player_identity
        );
        let playback_flipped = previous.is_playing != next.is_playing;
        let player_switched = next.is_playing && previous.player_identity != next.player_identity;
        let is_playing = next.is_playing;
        self.published.send_replace(next);

        if playback_flipped {
            self.emit(MediaUpdate::PlaybackChanged(is_playing));
        } else if player_switched {
            self.emit(MediaUpdate::TrackChanged);
        }
        playback_flipped || player_switched
    }

    /// 重新查询系统媒体会话，并结合传统播放器的最新观测重新仲裁。
    fn recompute(&mut self) -> bool {
        let modern = self.modern.any_playing();
        let next = arbitrate(modern.as_ref(), self.legacy.observation());
        self.publish(next)
    }

    fn invalidate_art(&mut self) {
        self.art_cache = None;
        self.art_generation = self.art_generation.wrapping_add(1);
    }

    pub async fn on_manager_ready(&mut self, result: BackendResult<M>) {
        if let Err(e) = self.modern.on_manager_ready(result) {
            self.emit(MediaUpdate::Diagnostic(DiagnosticInfo::now(
                DiagnosticLevel::Warning,
                format!("系统媒体会话不可用，仅使用传统播放器检测: {e}"),
            )));
            return;
        }

        self.refresh_sessions();
        self.recompute();
        if let Some(session) = self.modern.current_session() {
            self.last_track = read_track_key(&session, self.properties_timeout).await;
            self.last_timeline = session.timeline().ok();
        }
    }

    fn refresh_sessions(&mut self) {
        let Some(infos) = self.modern.sync_subscriptions() else {
            return;
        };
        log::trace!(
            "[Aggregator] 会话列表已同步，共监听 {} 个会话。",
            self.modern.monitored_count()
        );
        if infos != self.last_sessions {
            self.last_sessions.clone_from(&infos);
            self.emit(MediaUpdate::SessionsChanged(infos));
        }
    }

    /// 处理一个来自系统媒体会话的原始信号。
    pub async fn on_signal(&mut self, signal: SessionSignal) {
        log::trace!("[Aggregator] 收到信号: {signal:?}");
        match signal {
            SessionSignal::SessionsChanged => {
                self.refresh_sessions();
                self.recompute();
            }
            SessionSignal::CurrentSessionChanged => {
                // 一次切换只通知一次
                let announced = self.recompute();
                self.probe_track(announced).await;
                self.check_timeline();
            }
            SessionSignal::PlaybackInfoChanged(_) => {
                self.recompute();
            }
            SessionSignal::MediaPropertiesChanged(app_id) => {
                // 封面常常晚于标题单独到达，曲目键不变也要丢弃缓存
                let is_current = self
                    .modern
                    .current_session()
                    .and_then(|session| session.app_id().ok())
                    .is_some_and(|current| current == app_id);
                if is_current {
                    self.invalidate_art();
                }
                self.probe_track(false).await;
            }
            SessionSignal::TimelineChanged(_) => self.check_timeline(),
        }
    }

    /// 在超时约束下读取当前曲目；与上一次不同才发出 `TrackChanged`。
    ///
    /// `announced` 为真时本次信号已经发出过事件，只记录新曲目。
    async fn probe_track(&mut self, announced: bool) {
        let Some(session) = self.modern.current_session() else {
            return;
        };
        let Some(key) = read_track_key(&session, self.properties_timeout).await else {
            return;
        };
        if self.last_track.as_ref() == Some(&key) {
            log::trace!("[Aggregator] 元数据通知未改变曲目，忽略。");
            return;
        }
        log::info!("[Aggregator] 新曲目: '{}' - '{}'", key.artist, key.title);
        self.last_track = Some(key);
        if !announced {
            self.emit(MediaUpdate::TrackChanged);
        }
    }

    fn check_timeline(&mut self) {
        let Some(session) = self.modern.current_session() else {
            return;
        };
        match session.timeline() {
            Ok(timeline) if self.last_timeline != Some(timeline) => {
                self.last_timeline = Some(timeline);
                self.emit(MediaUpdate::TimelineChanged(timeline));
            }
            Ok(_) => {}
            Err(e) => log::debug!("[Aggregator] 读取时间轴失败: {e}"),
        }
    }

    /// 传统播放器轮询。变化被采信之前，先重新查询一次系统媒体会话。
    pub fn on_legacy_tick(&mut self) {
        if !self.legacy.poll().any() {
            return;
        }

        let modern = self.modern.any_playing();
        if modern.is_some() && self.published.borrow().source == PlaybackSource::Modern {
            log::trace!("[Aggregator] 系统媒体会话仍在播放，忽略传统播放器的变化。");
            return;
        }
        let next = arbitrate(modern.as_ref(), self.legacy.observation());
        self.publish(next);
    }

    pub fn on_command(&mut self, command: MediaCommand) {
        if self.published.borrow().source == PlaybackSource::Legacy {
            log::debug!("[Aggregator] 传统播放器没有传输控制接口，忽略 {command:?}。");
            return;
        }
        let Some(session) = self.modern.current_session() else {
            log::debug!("[Aggregator] 没有当前会话，忽略 {command:?}。");
            return;
        };
        if self.command_tx.send((session, command)).is_err() {
            log::warn!("[Aggregator] 命令执行器已退出，无法执行 {command:?}。");
        }
    }

    pub fn on_query(&mut self, query: MediaQuery) {
        match query {
            MediaQuery::MediaInfo(reply) => self.answer_media_info(reply),
            MediaQuery::Thumbnail { cancel, reply } => self.answer_thumbnail(cancel, reply),
            MediaQuery::Timeline(reply) => {
                let _ = reply.send(self.current_timeline());
            }
            MediaQuery::ControlsState(reply) => {
                let _ = reply.send(self.controls_state());
            }
        }
    }

    fn is_legacy(&self) -> bool {
        self.published.borrow().source == PlaybackSource::Legacy
    }

    fn current_timeline(&self) -> Option<TimelineInfo> {
        if self.is_legacy() {
            return None;
        }
        self.modern.current_session()?.timeline().ok()
    }

    fn controls_state(&self) -> PlaybackControlsState {
        if self.is_legacy() {
            return PlaybackControlsState::default();
        }
        self.modern
            .current_session()
            .and_then(|session| session.playback_info().ok())
            .map(|info| PlaybackControlsState::from(&info))
            .unwrap_or_default()
    }

    fn answer_media_info(&self, reply: oneshot::Sender<Option<String>>) {
        if self.is_legacy() {
            let _ = reply.send(self.executables.media_info(self.legacy.observation()));
            return;
        }
        let Some(session) = self.modern.current_session() else {
            let _ = reply.send(None);
            return;
        };

        let limit = self.properties_timeout;
        tokio::task::spawn_local(async move {
            let info = match fetch_properties(&session, limit).await {
                Ok(properties) => compose_media_info(&properties.title, &properties.artist),
                Err(e) => {
                    log::debug!("[Aggregator] 读取媒体描述失败: {e}");
                    None
                }
            };
            let _ = reply.send(info);
        });
    }

    fn answer_thumbnail(&self, cancel: CancellationToken, reply: oneshot::Sender<Option<Thumbnail>>) {
        let state = self.published.borrow().clone();
        let session = match state.source {
            PlaybackSource::Legacy => None,
            PlaybackSource::Modern | PlaybackSource::None => self.modern.current_session(),
        };
        let icon_identity = match state.source {
            PlaybackSource::Legacy | PlaybackSource::Modern => Some(state.player_identity.clone()),
            PlaybackSource::None => session.as_ref().and_then(|s| s.app_id().ok()),
        };
        let identity = icon_identity.clone().unwrap_or_default();
        let track = match state.source {
            PlaybackSource::Legacy => None,
            _ => self.last_track.clone(),
        };

        if let Some(cached) = &self.art_cache
            && cached.source == state.source
            && cached.identity == identity
            && cached.track == track
        {
            log::trace!("[ArtResolver] 命中缓存。");
            let _ = reply.send(Some(cached.thumbnail.clone()));
            return;
        }

        let resolver = self.art.clone();
        let art_tx = self.art_tx.clone();
        let source = state.source;
        let generation = self.art_generation;
        tokio::task::spawn_local(async move {
            let mut reply = reply;
            let resolved = tokio::select! {
                biased;
                () = reply.closed() => {
                    log::debug!("[ArtResolver] 请求方已离开，放弃解析。");
                    return;
                }
                resolved = resolver.resolve(session, icon_identity, cancel) => resolved,
            };
            // 图标只是回落，会话稍后可能补上封面，不缓存
            if let Some(art) = &resolved
                && art.origin == ArtOrigin::Session
            {
                let _ = art_tx.send(CachedArt {
                    generation,
                    source,
                    identity,
                    track,
                    thumbnail: art.thumbnail.clone(),
                });
            }
            let _ = reply.send(resolved.map(|art| art.thumbnail));
        });
    }

    pub fn on_art_resolved(&mut self, art: CachedArt) {
        if art.generation != self.art_generation {
            log::trace!("[ArtResolver] 解析期间媒体属性已变化，结果不进入缓存。");
            return;
        }
        self.art_cache = Some(art);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy(playing: bool, exe: &str) -> LegacyObservation {
        LegacyObservation {
            playing,
            exe_name: if playing { exe.to_string() } else { String::new() },
            display_name: playing.then(|| exe.trim_end_matches(".exe").to_string()),
        }
    }

    #[test]
    fn test_arbitration_precedence_over_all_combinations() {
        let modern_cases = [None, Some(ModernPlaying { app_id: "Spotify.exe".to_string() })];
        let legacy_cases = [legacy(false, ""), legacy(true, "vlc.exe")];

        for modern in &modern_cases {
            for observation in &legacy_cases {
                let state = arbitrate(modern.as_ref(), observation);
                let expected = match (modern, observation.playing) {
                    (Some(_), _) => PlaybackSource::Modern,
                    (None, true) => PlaybackSource::Legacy,
                    (None, false) => PlaybackSource::None,
                };
                assert_eq!(state.source, expected, "modern={modern:?} legacy={observation:?}");
                assert_eq!(state.is_playing, expected != PlaybackSource::None);
            }
        }
    }

    #[test]
    fn test_arbitration_carries_identity_and_display_name() {
        let modern = ModernPlaying {
            app_id: "AppleInc.AppleMusicWin_nzyj5cx40ttqa!App".to_string(),
        };
        let state = arbitrate(Some(&modern), &legacy(true, "vlc.exe"));
        assert_eq!(state.player_identity, modern.app_id);
        assert_eq!(state.display_name.as_deref(), Some("Apple Music"));

        let state = arbitrate(None, &legacy(true, "vlc.exe"));
        assert_eq!(state.player_identity, "vlc.exe");
        assert_eq!(state.display_name.as_deref(), Some("vlc"));
    }

    #[test]
    fn test_idle_arbitration_has_no_identity() {
        let state = arbitrate(None, &legacy(false, ""));
        assert_eq!(state, PlaybackState::idle());
    }
}
