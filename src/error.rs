use thiserror::Error;

/// 定义库对外的统一错误枚举。
///
/// 运行期间的绝大多数故障都不会到达这里：它们在后台线程内被记录并降级处理。
/// 只有启动阶段的问题和服务停止后的调用会以错误的形式返回给调用方。
#[derive(Debug, Error)]
pub enum MediaError {
    /// 无法启动后台协调线程。
    ///
    /// 这通常发生在 `std::thread::Builder::spawn` 失败时。
    #[error("无法启动后台协调线程: {0}")]
    WorkerThread(String),

    /// 创建 Tokio 异步运行时失败。
    #[error("Tokio 运行时创建失败: {0}")]
    TokioRuntime(#[from] std::io::Error),

    /// 尝试启动一个已经在运行的媒体服务。
    ///
    /// 在上一个服务关闭之前，`MediaManager::start()` 在一个进程中只能成功一次。
    #[error("媒体服务已在运行，无法重复启动。")]
    AlreadyRunning,

    /// 锁已被毒化。
    #[error("锁已被毒化: {0}")]
    MutexPoisoned(String),

    /// 后台服务已经停止，命令或查询无法送达。
    #[error("媒体服务已停止")]
    ServiceStopped,

    /// 读取配置文件失败。
    #[error("无法读取配置文件 {path}: {source}")]
    ConfigRead {
        /// 配置文件路径。
        path: String,
        /// 底层的 I/O 错误。
        source: std::io::Error,
    },

    /// 配置文件内容不是合法的 TOML，或字段类型不匹配。
    #[error("配置解析失败: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// 平台后端报告的错误。
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl<T> From<std::sync::PoisonError<T>> for MediaError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        MediaError::MutexPoisoned(err.to_string())
    }
}

/// 平台协作者 (会话注册表、音频快照、进程查询、图标提取) 的错误。
///
/// 聚合器把这些错误当作“这一次没有答案”，而不是致命错误。
#[derive(Debug, Error)]
pub enum BackendError {
    /// 会话注册表在本机上不可用，或请求它失败。
    #[error("媒体会话注册表不可用: {0}")]
    Unavailable(String),

    /// 会话句柄所指向的会话已经消失。
    #[error("媒体会话已失效")]
    SessionGone,

    /// 一次调用失败，但下一次可能成功。
    #[error("平台调用失败: {0}")]
    Faulted(String),

    /// 当前平台不支持该操作。
    #[error("当前平台不支持: {0}")]
    Unsupported(&'static str),

    /// 一个有界等待超时。
    #[error("操作在 {0:?} 内未完成")]
    TimedOut(std::time::Duration),

    /// 图像解码或编码失败。
    #[error("图像处理失败: {0}")]
    Image(#[from] image::ImageError),

    /// 底层的 Windows API 或 COM 调用失败。
    #[cfg(windows)]
    #[error("Windows API 调用失败: {0}")]
    Windows(#[from] windows::core::Error),
}

/// 本库统一的 `Result` 类型别名。
pub type Result<T> = std::result::Result<T, MediaError>;

/// 平台协作者使用的 `Result` 类型别名。
pub type BackendResult<T> = std::result::Result<T, BackendError>;
