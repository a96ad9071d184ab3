use std::{collections::HashSet, path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{MediaError, Result},
    utils::normalize_executable_name,
};

/// 内置的传统播放器白名单 (小写，不带扩展名)。
///
/// 这些播放器不会 (或不总是) 注册系统媒体会话，只能通过它们的音频会话来识别。
pub const DEFAULT_LEGACY_PLAYERS: &[&str] = &[
    "vlc",
    "wmplayer",
    "mpc-hc",
    "mpc-hc64",
    "mpc-be",
    "mpc-be64",
    "potplayer",
    "potplayer64",
    "potplayermini",
    "potplayermini64",
    "foobar2000",
    "winamp",
    "aimp",
    "musicbee",
    "mediamonkey",
    "kmplayer",
    "gom",
    "smplayer",
    "mpv",
    "clementine",
    "audacity",
];

/// 服务配置。
///
/// 所有字段都有默认值，TOML 中缺省的字段会回落到默认值。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// 传统播放器轮询周期 (毫秒)。
    pub legacy_poll_interval_ms: u64,
    /// 服务启动后第一次轮询之前的延迟 (毫秒)。
    pub legacy_start_delay_ms: u64,
    /// 请求会话管理器的超时 (毫秒)。
    pub manager_request_timeout_ms: u64,
    /// 读取媒体属性的超时 (毫秒)。
    pub properties_timeout_ms: u64,
    /// 打开封面流的超时 (毫秒)。
    pub thumbnail_stream_timeout_ms: u64,
    /// 读取封面数据的超时 (毫秒)。
    pub thumbnail_read_timeout_ms: u64,
    /// 提取可执行文件图标的超时 (毫秒)。
    pub icon_timeout_ms: u64,
    /// 传输控制命令的超时 (毫秒)。
    pub transport_timeout_ms: u64,
    /// 允许读取的封面最大字节数。
    pub max_thumbnail_bytes: u64,
    /// 追加到内置白名单的播放器可执行文件名。
    pub extra_legacy_players: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            legacy_poll_interval_ms: 500,
            legacy_start_delay_ms: 2000,
            manager_request_timeout_ms: 5000,
            properties_timeout_ms: 2000,
            thumbnail_stream_timeout_ms: 2000,
            thumbnail_read_timeout_ms: 2000,
            icon_timeout_ms: 2000,
            transport_timeout_ms: 5000,
            max_thumbnail_bytes: 20 * 1024 * 1024,
            extra_legacy_players: Vec::new(),
        }
    }
}

impl MediaConfig {
    /// 从 TOML 文本解析配置。
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// 从 TOML 文件加载配置。
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| MediaError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        log::debug!("[Config] 已从 {} 加载配置。", path.display());
        Ok(config)
    }

    /// 传统播放器轮询周期。
    pub fn legacy_poll_interval(&self) -> Duration {
        Duration::from_millis(self.legacy_poll_interval_ms.max(1))
    }

    /// 第一次轮询前的延迟。
    pub fn legacy_start_delay(&self) -> Duration {
        Duration::from_millis(self.legacy_start_delay_ms)
    }

    /// 请求会话管理器的超时。
    pub fn manager_request_timeout(&self) -> Duration {
        Duration::from_millis(self.manager_request_timeout_ms)
    }

    /// 读取媒体属性的超时。
    pub fn properties_timeout(&self) -> Duration {
        Duration::from_millis(self.properties_timeout_ms)
    }

    /// 打开封面流的超时。
    pub fn thumbnail_stream_timeout(&self) -> Duration {
        Duration::from_millis(self.thumbnail_stream_timeout_ms)
    }

    /// 读取封面数据的超时。
    pub fn thumbnail_read_timeout(&self) -> Duration {
        Duration::from_millis(self.thumbnail_read_timeout_ms)
    }

    /// 提取图标的超时。
    pub fn icon_timeout(&self) -> Duration {
        Duration::from_millis(self.icon_timeout_ms)
    }

    /// 传输控制命令的超时。
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    /// 构建不可变的传统播放器白名单。
    pub fn allow_list(&self) -> Arc<LegacyAllowList> {
        Arc::new(LegacyAllowList::new(
            DEFAULT_LEGACY_PLAYERS
                .iter()
                .copied()
                .chain(self.extra_legacy_players.iter().map(String::as_str)),
        ))
    }
}

/// 传统播放器白名单。构建后不可变，在线程间通过 `Arc` 共享。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyAllowList {
    entries: HashSet<String>,
}

impl LegacyAllowList {
    /// 由任意形式的可执行文件名构建白名单。大小写和 `.exe` 后缀会被规范化。
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let entries = names
            .into_iter()
            .map(normalize_executable_name)
            .filter(|name| !name.is_empty())
            .collect();
        Self { entries }
    }

    /// 判断一个可执行文件名是否在白名单内。
    pub fn contains(&self, exe_name: &str) -> bool {
        self.entries.contains(&normalize_executable_name(exe_name))
    }

    /// 白名单条目数。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 白名单是否为空。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
