// 本模块只在协调线程的 LocalSet 中运行
#![allow(clippy::future_not_send)]

use std::{
    collections::HashMap,
    time::Duration,
};

use crate::{
    api::{MediaCommand, PlaybackStatus, SessionInfo, TransportCommand},
    backend::{MediaSession, SessionManager, SessionRegistry, SignalSink},
    error::BackendResult,
    tasks::bounded,
    utils::display_name_from_app_id,
};

/// 一个被监听的会话。`_watch` 被 drop 时注销该会话的全部监听。
struct MonitoredSession<S: MediaSession> {
    session: S,
    _watch: S::Watch,
}

enum AdapterState<M: SessionManager> {
    /// 管理器请求尚未完成。
    Pending,
    /// 注册表不可用，适配器永久报告“没有会话”。
    Inert,
    Ready {
        manager: M,
        _manager_watch: M::Watch,
        /// 按 AUMID 分组；同一 AUMID 下每个底层会话对象恰好一份监听。
        sessions: HashMap<String, Vec<MonitoredSession<M::Session>>>,
    },
}

/// 正在播放的系统媒体会话。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ModernPlaying {
    pub app_id: String,
}

impl ModernPlaying {
    pub fn display_name(&self) -> String {
        display_name_from_app_id(&self.app_id)
    }
}

/// 包装系统媒体会话注册表，维护每个会话恰好一份监听。
pub(crate) struct ModernSessionAdapter<M: SessionManager> {
    sink: SignalSink,
    state: AdapterState<M>,
}

/// 在超时约束下请求会话管理器。
pub(crate) async fn request_manager<R: SessionRegistry>(
    registry: R,
    limit: Duration,
) -> BackendResult<R::Manager> {
    log::debug!("[ModernSessions] 正在请求会话管理器...");
    bounded(limit, registry.request_manager()).await
}

impl<M: SessionManager> ModernSessionAdapter<M> {
    pub fn new(sink: SignalSink) -> Self {
        Self {
            sink,
            state: AdapterState::Pending,
        }
    }

    /// 处理管理器请求的结果。失败时适配器进入永久的惰性状态。
    pub fn on_manager_ready(&mut self, result: BackendResult<M>) -> BackendResult<()> {
        let ready = result.and_then(|manager| {
            let watch = manager.watch(self.sink.clone())?;
            Ok((manager, watch))
        });

        match ready {
            Ok((manager, watch)) => {
                log::info!("[ModernSessions] 会话管理器已就绪。");
                self.state = AdapterState::Ready {
                    manager,
                    _manager_watch: watch,
                    sessions: HashMap::new(),
                };
                Ok(())
            }
            Err(e) => {
                log::warn!("[ModernSessions] 会话管理器不可用，将只使用传统播放器检测: {e}");
                self.state = AdapterState::Inert;
                Err(e)
            }
        }
    }

    /// 重新遍历会话列表，只注册新增的会话、注销消失的会话。
    ///
    /// 同一个 AUMID 下可能有多个会话，已注册的会话按底层对象 (`is_same`) 认领，
    /// 与它在列表中的位置无关。消失的会话先注销，再为新会话注册。
    /// 返回当前的会话列表 (按注册表给出的顺序)；列表读取失败时返回 `None`。
    pub fn sync_subscriptions(&mut self) -> Option<Vec<SessionInfo>> {
        let AdapterState::Ready {
            manager, sessions, ..
        } = &mut self.state
        else {
            return None;
        };

        let listed = match manager.sessions() {
            Ok(listed) => listed,
            Err(e) => {
                log::warn!("[ModernSessions] 获取会话列表失败: {e}");
                return None;
            }
        };

        let mut previous = std::mem::take(sessions);
        let mut fresh = Vec::new();
        let mut infos = Vec::with_capacity(listed.len());

        for session in listed {
            let app_id = match session.app_id() {
                Ok(id) => id,
                Err(e) => {
                    log::debug!("[ModernSessions] 跳过无法读取 AUMID 的会话: {e}");
                    continue;
                }
            };
            infos.push(SessionInfo {
                display_name: display_name_from_app_id(&app_id),
                app_id: app_id.clone(),
            });

            let claimed = previous.get_mut(&app_id).and_then(|group| {
                let pos = group.iter().position(|m| m.session.is_same(&session))?;
                Some(group.swap_remove(pos))
            });
            match claimed {
                Some(monitored) => sessions.entry(app_id).or_default().push(monitored),
                None => fresh.push((app_id, session)),
            }
        }

        for (app_id, group) in previous {
            if !group.is_empty() {
                log::trace!(
                    "[ModernSessions] 会话 '{app_id}' 有 {} 个实例已消失，注销监听。",
                    group.len()
                );
            }
        }

        for (app_id, session) in fresh {
            match session.watch(&app_id, self.sink.clone()) {
                Ok(watch) => {
                    log::trace!("[ModernSessions] 已为 '{app_id}' 注册监听。");
                    sessions.entry(app_id).or_default().push(MonitoredSession {
                        session,
                        _watch: watch,
                    });
                }
                Err(e) => log::warn!("[ModernSessions] 为 '{app_id}' 注册监听失败: {e}"),
            }
        }

        Some(infos)
    }

    /// 扫描全部会话，返回第一个正在播放的会话。
    ///
    /// 单个会话的失败只会被记录并跳过。每次调用都重新查询，从不缓存。
    pub fn any_playing(&self) -> Option<ModernPlaying> {
        let manager = self.manager()?;
        let sessions = match manager.sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                log::debug!("[ModernSessions] 查询会话列表失败: {e}");
                return None;
            }
        };

        sessions.into_iter().find_map(|session| {
            match session.playback_info() {
                Ok(info) if info.status == PlaybackStatus::Playing => {}
                Ok(_) => return None,
                Err(e) => {
                    log::debug!("[ModernSessions] 读取会话播放信息失败，跳过: {e}");
                    return None;
                }
            }
            session
                .app_id()
                .inspect_err(|e| log::debug!("[ModernSessions] 读取 AUMID 失败，跳过: {e}"))
                .ok()
                .map(|app_id| ModernPlaying { app_id })
        })
    }

    /// 注册表给出的当前会话。
    pub fn current_session(&self) -> Option<M::Session> {
        match self.manager()?.current_session() {
            Ok(session) => session,
            Err(e) => {
                log::debug!("[ModernSessions] 获取当前会话失败: {e}");
                None
            }
        }
    }

    /// 已注册监听的会话数。
    pub fn monitored_count(&self) -> usize {
        match &self.state {
            AdapterState::Ready { sessions, .. } => sessions.values().map(Vec::len).sum(),
            _ => 0,
        }
    }

    fn manager(&self) -> Option<&M> {
        match &self.state {
            AdapterState::Ready { manager, .. } => Some(manager),
            AdapterState::Pending | AdapterState::Inert => None,
        }
    }
}

/// 在给定会话上执行一个控制命令。
///
/// 切换类命令需要先读取会话的当前状态。失败只记录日志，返回 `false`。
pub(crate) async fn execute_command<S: MediaSession>(
    session: &S,
    command: MediaCommand,
    limit: Duration,
) -> bool {
    let transport = match resolve_transport(session, command) {
        Ok(Some(transport)) => transport,
        Ok(None) => return false,
        Err(e) => {
            log::warn!("[ModernSessions] 无法为 {command:?} 读取会话状态: {e}");
            return false;
        }
    };

    match bounded(limit, session.transport(transport)).await {
        Ok(accepted) => {
            if !accepted {
                log::debug!("[ModernSessions] 会话拒绝了 {transport:?}。");
            }
            accepted
        }
        Err(e) => {
            log::warn!("[ModernSessions] 执行 {transport:?} 失败: {e}");
            false
        }
    }
}

fn resolve_transport<S: MediaSession>(
    session: &S,
    command: MediaCommand,
) -> BackendResult<Option<TransportCommand>> {
    let transport = match command {
        MediaCommand::Play => TransportCommand::Play,
        MediaCommand::Pause => TransportCommand::Pause,
        MediaCommand::Next => TransportCommand::SkipNext,
        MediaCommand::Previous => TransportCommand::SkipPrevious,
        MediaCommand::SeekTo(position) => TransportCommand::SeekTo(position),
        MediaCommand::PlayPause => {
            if session.playback_info()?.status == PlaybackStatus::Playing {
                TransportCommand::Pause
            } else {
                TransportCommand::Play
            }
        }
        MediaCommand::ToggleShuffle => {
            let active = session.playback_info()?.is_shuffle_active.unwrap_or(false);
            TransportCommand::SetShuffle(!active)
        }
        MediaCommand::ToggleRepeat => {
            let mode = session.playback_info()?.repeat_mode.unwrap_or_default();
            TransportCommand::SetRepeatMode(mode.next_in_cycle())
        }
        MediaCommand::Shutdown => return Ok(None),
    };
    Ok(Some(transport))
}
