// 本模块只在协调线程的 LocalSet 中运行
#![allow(clippy::future_not_send)]

use std::{future::Future, sync::Arc, time::Instant};

use tokio::time::{Duration, timeout as tokio_timeout};
use tokio_util::sync::CancellationToken;

use crate::{
    api::Thumbnail,
    backend::{
        IconExtractor, MediaProperties, MediaSession, ProcessLocator, ThumbnailReference,
        ThumbnailStream,
    },
    config::MediaConfig,
    error::{BackendError, BackendResult},
    legacy::ExecutableResolver,
    utils::{calculate_cover_hash, probe_image_dimensions},
};

/// 为一个可能永远不完成的等待设置上限。超时的 Future 会被 drop，
/// 平台实现负责在 drop 时取消底层的异步操作。
pub(crate) async fn bounded<T, F>(limit: Duration, operation: F) -> BackendResult<T>
where
    F: Future<Output = BackendResult<T>>,
{
    match tokio_timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::TimedOut(limit)),
    }
}

/// 在超时约束下读取会话的媒体属性。
pub(crate) async fn fetch_properties<S: MediaSession>(
    session: &S,
    limit: Duration,
) -> BackendResult<MediaProperties<S::Thumbnail>> {
    bounded(limit, session.media_properties()).await
}

/// 缩略图的来源。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArtOrigin {
    /// 会话自己提供的封面。
    Session,
    /// 回落得到的可执行文件图标。
    ExecutableIcon,
}

/// 一次解析的结果。
#[derive(Debug, Clone)]
pub(crate) struct ResolvedArt {
    pub thumbnail: Thumbnail,
    pub origin: ArtOrigin,
}

#[derive(Debug, Clone, Copy)]
struct StageLimits {
    properties: Duration,
    stream: Duration,
    read: Duration,
    icon: Duration,
}

/// 缩略图解析器。
///
/// 依次尝试 会话属性 → 打开封面流 → 读取封面，每个阶段都有独立的超时；
/// 任一阶段失败或超时后回落到提取可执行文件的图标。
pub(crate) struct ArtResolver<P, I> {
    executables: Arc<ExecutableResolver<P>>,
    icons: Arc<I>,
    limits: StageLimits,
    max_bytes: u64,
}

impl<P, I> Clone for ArtResolver<P, I> {
    fn clone(&self) -> Self {
        Self {
            executables: Arc::clone(&self.executables),
            icons: Arc::clone(&self.icons),
            limits: self.limits,
            max_bytes: self.max_bytes,
        }
    }
}

impl<P: ProcessLocator, I: IconExtractor> ArtResolver<P, I> {
    pub fn new(executables: Arc<ExecutableResolver<P>>, icons: Arc<I>, config: &MediaConfig) -> Self {
        Self {
            executables,
            icons,
            limits: StageLimits {
                properties: config.properties_timeout(),
                stream: config.thumbnail_stream_timeout(),
                read: config.thumbnail_read_timeout(),
                icon: config.icon_timeout(),
            },
            max_bytes: config.max_thumbnail_bytes,
        }
    }

    /// 解析一次缩略图。从不返回错误：所有失败都会被记录并回落，最终结果可能是 `None`。
    ///
    /// `session` 为会话封面的来源；`icon_identity` 为回落时用来查找可执行文件的标识。
    pub async fn resolve<S: MediaSession>(
        &self,
        session: Option<S>,
        icon_identity: Option<String>,
        cancel: CancellationToken,
    ) -> Option<ResolvedArt> {
        let start_time = Instant::now();

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                log::debug!("[ArtResolver] 请求被取消。");
                return None;
            }
            thumb = self.resolve_stages(session, icon_identity) => thumb,
        };

        match &result {
            Some(ResolvedArt {
                thumbnail: thumb,
                origin,
            }) => log::trace!(
                "[ArtResolver] 得到 {}x{} 的缩略图 ({origin:?}, {} 字节, hash {:x})，总耗时: {:?}",
                thumb.width,
                thumb.height,
                thumb.bytes.len(),
                calculate_cover_hash(&thumb.bytes),
                start_time.elapsed()
            ),
            None => log::debug!(
                "[ArtResolver] 没有可用的缩略图，总耗时: {:?}",
                start_time.elapsed()
            ),
        }
        result
    }

    async fn resolve_stages<S: MediaSession>(
        &self,
        session: Option<S>,
        icon_identity: Option<String>,
    ) -> Option<ResolvedArt> {
        if let Some(session) = session {
            match self.session_art(&session).await {
                Ok(thumbnail) => {
                    return Some(ResolvedArt {
                        thumbnail,
                        origin: ArtOrigin::Session,
                    });
                }
                Err(e) => log::debug!("[ArtResolver] 会话封面不可用，回落到程序图标: {e}"),
            }
        }

        let identity = icon_identity.filter(|id| !id.is_empty())?;
        match self.executable_icon(identity).await {
            Ok(thumbnail) => Some(ResolvedArt {
                thumbnail,
                origin: ArtOrigin::ExecutableIcon,
            }),
            Err(e) => {
                log::debug!("[ArtResolver] 提取程序图标失败: {e}");
                None
            }
        }
    }

    async fn session_art<S: MediaSession>(&self, session: &S) -> BackendResult<Thumbnail> {
        let properties = fetch_properties(session, self.limits.properties).await?;
        let reference = properties
            .thumbnail
            .ok_or_else(|| BackendError::Faulted("会话没有提供封面".to_string()))?;

        let stream = bounded(self.limits.stream, reference.open_read()).await?;
        let size = stream.size()?;
        if size == 0 {
            return Err(BackendError::Faulted("封面流大小为 0".to_string()));
        }
        if size > self.max_bytes {
            return Err(BackendError::Faulted(format!(
                "封面数据 ({size} 字节) 超出最大限制 ({} 字节)",
                self.max_bytes
            )));
        }
        let len = u32::try_from(size)
            .map_err(|_| BackendError::Faulted(format!("封面数据过大: {size} 字节")))?;

        let bytes = bounded(self.limits.read, stream.read_all(len)).await?;
        if bytes.is_empty() {
            return Err(BackendError::Faulted("读取到的封面数据为空".to_string()));
        }
        let (width, height) = probe_image_dimensions(&bytes)?;
        Ok(Thumbnail {
            bytes,
            width,
            height,
        })
    }

    async fn executable_icon(&self, identity: String) -> BackendResult<Thumbnail> {
        let executables = Arc::clone(&self.executables);
        let icons = Arc::clone(&self.icons);
        let job = tokio::task::spawn_blocking(move || {
            let path = executables.executable_path(&identity).ok_or_else(|| {
                BackendError::Faulted(format!("找不到 '{identity}' 的可执行文件"))
            })?;
            log::trace!("[ArtResolver] 正在从 {} 提取图标。", path.display());
            icons.extract(&path)
        });

        // 超时后阻塞任务仍会在后台跑完，但结果会被丢弃。
        match tokio_timeout(self.limits.icon, job).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(BackendError::Faulted(format!(
                "图标提取任务异常退出: {join_error}"
            ))),
            Err(_) => Err(BackendError::TimedOut(self.limits.icon)),
        }
    }
}
