// 协调线程的事件循环运行在 LocalSet 中
#![allow(clippy::future_not_send)]

use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use tokio::{
    runtime::Runtime,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, watch,
    },
    task::LocalSet,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    aggregator::{Aggregator, AggregatorChannels},
    api::{
        DiagnosticInfo, DiagnosticLevel, MediaCommand, MediaController, MediaUpdate,
        PlaybackControlsState, PlaybackState, Thumbnail, TimelineInfo,
    },
    backend::{Backend, SessionManager, SessionRegistry, SignalSink},
    config::MediaConfig,
    error::{BackendError, MediaError, Result},
    legacy::{ExecutableResolver, LegacyPoller},
    modern::{self, ModernSessionAdapter},
    tasks::ArtResolver,
};

type ManagerOf<B> = <<B as Backend>::Registry as SessionRegistry>::Manager;
type SessionOf<B> = <ManagerOf<B> as SessionManager>::Session;

/// 需要在协调线程上求值并回复的查询。
#[derive(Debug)]
pub(crate) enum MediaQuery {
    MediaInfo(oneshot::Sender<Option<String>>),
    Thumbnail {
        cancel: CancellationToken,
        reply: oneshot::Sender<Option<Thumbnail>>,
    },
    Timeline(oneshot::Sender<Option<TimelineInfo>>),
    ControlsState(oneshot::Sender<PlaybackControlsState>),
}

/// `MediaController` 发往协调线程的消息。
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Command(MediaCommand),
    Query(MediaQuery),
}

/// 协调线程的句柄。
pub(crate) struct WorkerHandle {
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    fn new(thread: JoinHandle<()>) -> Self {
        Self {
            thread: Mutex::new(Some(thread)),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.thread
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }
}

/// 启动协调线程，返回控制器和事件接收器。
///
/// 运行时在调用方线程上创建，这样创建失败可以直接作为错误返回。
pub(crate) fn start_media_worker_thread<B: Backend>(
    config: MediaConfig,
    backend: B,
) -> Result<(MediaController, UnboundedReceiver<MediaUpdate>)> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let (message_tx, message_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let (update_tx, update_rx) = mpsc::unbounded_channel::<MediaUpdate>();
    let (state_tx, state_rx) = watch::channel(PlaybackState::idle());

    let thread = thread::Builder::new()
        .name("playback_arbiter_worker".to_string())
        .spawn(move || MediaWorker::run(runtime, config, backend, message_rx, update_tx, state_tx))
        .map_err(|e| MediaError::WorkerThread(e.to_string()))?;

    let controller = MediaController {
        message_tx,
        state_rx,
        worker: Arc::new(WorkerHandle::new(thread)),
    };
    Ok((controller, update_rx))
}

struct MediaWorker;

impl MediaWorker {
    /// 协调线程的入口点。
    fn run<B: Backend>(
        runtime: Runtime,
        config: MediaConfig,
        backend: B,
        message_rx: UnboundedReceiver<WorkerMessage>,
        update_tx: UnboundedSender<MediaUpdate>,
        state_tx: watch::Sender<PlaybackState>,
    ) {
        log::info!("[MediaWorker] 协调线程正在启动...");

        let thread_guard = match backend.attach_thread() {
            Ok(guard) => Some(guard),
            Err(e) => {
                log::error!("[MediaWorker] 初始化线程环境失败: {e}");
                let _ = update_tx.send(MediaUpdate::Diagnostic(DiagnosticInfo::now(
                    DiagnosticLevel::Error,
                    format!("初始化线程环境失败: {e}"),
                )));
                None
            }
        };

        let local_set = LocalSet::new();
        local_set.block_on(
            &runtime,
            Self::event_loop(config, backend, message_rx, update_tx, state_tx),
        );

        // 先让所有仍持有会话对象的本地任务随 LocalSet 一起销毁，再释放线程环境。
        drop(local_set);
        drop(runtime);
        drop(thread_guard);
        log::info!("[MediaWorker] 协调线程已退出。");
    }

    /// 核心事件循环。所有原始信号都在这里按到达顺序处理。
    async fn event_loop<B: Backend>(
        config: MediaConfig,
        backend: B,
        mut message_rx: UnboundedReceiver<WorkerMessage>,
        update_tx: UnboundedSender<MediaUpdate>,
        state_tx: watch::Sender<PlaybackState>,
    ) {
        let parts = backend.into_parts();

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (art_tx, mut art_rx) = mpsc::unbounded_channel();
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<(SessionOf<B>, MediaCommand)>();

        // 命令执行器：按顺序执行控制命令，不阻塞事件循环。
        let transport_timeout = config.transport_timeout();
        let command_executor = tokio::task::spawn_local(async move {
            while let Some((session, command)) = command_rx.recv().await {
                modern::execute_command(&session, command, transport_timeout).await;
            }
            log::trace!("[Command Executor] 通道已关闭，任务结束。");
        });

        let (manager_tx, manager_rx) = oneshot::channel();
        let manager_timeout = config.manager_request_timeout();
        let registry = parts.registry;
        tokio::task::spawn_local(async move {
            let _ = manager_tx.send(modern::request_manager(registry, manager_timeout).await);
        });
        let mut manager_rx = Some(manager_rx);

        let executables = Arc::new(ExecutableResolver::new(parts.processes));
        let mut aggregator = Aggregator::new(
            ModernSessionAdapter::<ManagerOf<B>>::new(SignalSink::new(signal_tx)),
            LegacyPoller::new(parts.snapshots, config.allow_list()),
            Arc::clone(&executables),
            ArtResolver::new(executables, parts.icons, &config),
            config.properties_timeout(),
            AggregatorChannels {
                published: state_tx,
                update_tx,
                command_tx,
                art_tx,
            },
        );

        let mut legacy_timer = tokio::time::interval_at(
            Instant::now() + config.legacy_start_delay(),
            config.legacy_poll_interval(),
        );
        legacy_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        log::debug!("[MediaWorker] 初始化完成，进入事件循环。");

        loop {
            tokio::select! {
                // 缩略图结果先于外部消息处理，紧随其后的查询才能命中缓存；
                // 外部消息随后，保证 Shutdown 能被及时处理。
                biased;

                Some(art) = art_rx.recv() => aggregator.on_art_resolved(art),

                message = message_rx.recv() => match message {
                    Some(WorkerMessage::Command(MediaCommand::Shutdown)) | None => {
                        log::debug!("[MediaWorker] 收到关闭请求，准备退出...");
                        break;
                    }
                    Some(WorkerMessage::Command(command)) => aggregator.on_command(command),
                    Some(WorkerMessage::Query(query)) => aggregator.on_query(query),
                },

                result = async {
                    match manager_rx.as_mut() {
                        Some(rx) => rx.await,
                        None => std::future::pending().await,
                    }
                }, if manager_rx.is_some() => {
                    manager_rx = None;
                    let result = result.unwrap_or_else(|_| {
                        Err(BackendError::Unavailable("会话管理器请求任务已中止".to_string()))
                    });
                    aggregator.on_manager_ready(result).await;
                },

                Some(signal) = signal_rx.recv() => aggregator.on_signal(signal).await,

                _ = legacy_timer.tick() => aggregator.on_legacy_tick(),
            }
        }

        // 先 drop 聚合器以注销所有系统监听，再结束命令执行器。
        drop(aggregator);
        if let Err(e) = command_executor.await {
            log::warn!("[MediaWorker] 等待命令执行器退出时发生错误: {e:?}");
        }
    }
}
