use std::io::Cursor;

use image::{DynamicImage, ImageFormat, ImageReader, RgbaImage};

use crate::{
    api::Thumbnail,
    error::{BackendError, BackendResult},
};

/// 把可执行文件名规范化为白名单使用的形式：去掉目录、转为小写、去掉 `.exe` 后缀。
pub fn normalize_executable_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    let file_name = lower.rsplit(['\\', '/']).next().unwrap_or_default();
    file_name
        .strip_suffix(".exe")
        .unwrap_or(file_name)
        .to_string()
}

/// 从播放器标识 (可执行文件名或 AUMID) 中提取用于查找安装路径的名称主干。
///
/// - "VLC.exe" → "vlc"
/// - "`Microsoft.ZuneMusic_8wekyb3d8bbwe!Microsoft.ZuneMusic`" → "zunemusic"
/// - "`org.videolan.vlc`" → "vlc"
pub fn player_stem_from_identifier(identifier: &str) -> String {
    let mut stem = identifier.trim().to_lowercase();
    if let Some(stripped) = stem.strip_suffix(".exe") {
        stem = stripped.to_string();
    }
    if let Some((_, app)) = stem.rsplit_once('!') {
        stem = app.to_string();
    }
    if !stem.contains('\\')
        && let Some((_, last)) = stem.rsplit_once('.')
    {
        stem = last.to_string();
    }
    stem
}

/// 从会话 AUMID（或可执行文件名）中提取一个更易读的显示名称。
///
/// ## 解析逻辑
/// 1.  **对于可执行文件名** (如 "Spotify.exe"): 去掉 `.exe` 后缀。
/// 2.  **对于 UWP 应用的 AUMID** (如 "`AppleInc.AppleMusicWin_nzyj5cx40ttqa!App`"):
///     a. 取 `!` 之前的部分，再取 `_` 之前的部分，最后取最后一个 `.` 之后的部分: "`AppleMusicWin`"
///     b. 在小写字母和大写字母之间插入空格，并移除常见后缀: "`Apple Music`"
/// 3.  如果任何步骤失败，则返回原始 ID 作为后备。
pub fn display_name_from_app_id(app_id: &str) -> String {
    if !app_id.contains('!') {
        let trimmed = app_id.trim();
        let lower = trimmed.to_ascii_lowercase();
        return match lower.strip_suffix(".exe") {
            Some(stem) if !stem.is_empty() => trimmed[..stem.len()].to_string(),
            _ => trimmed.to_string(),
        };
    }

    app_id
        .split('!')
        .next()
        .and_then(|pfn| pfn.split('_').next())
        .and_then(|name_part| name_part.rsplit('.').next())
        .map(|app_name| {
            let mut pretty = String::with_capacity(app_name.len() + 5);
            let mut chars = app_name.chars().peekable();
            while let Some(current) = chars.next() {
                pretty.push(current);
                if let Some(&next) = chars.peek()
                    && current.is_lowercase()
                    && next.is_uppercase()
                {
                    pretty.push(' ');
                }
            }
            pretty
                .trim_end_matches("Win")
                .trim_end_matches("Uwp")
                .trim()
                .to_string()
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| app_id.to_string())
}

/// 组合弹窗上显示的媒体描述："艺术家 - 标题"，没有艺术家时只有标题。
pub fn compose_media_info(title: &str, artist: &str) -> Option<String> {
    let title = title.trim();
    let artist = artist.trim();
    match (artist.is_empty(), title.is_empty()) {
        (_, true) => None,
        (true, false) => Some(title.to_string()),
        (false, false) => Some(format!("{artist} - {title}")),
    }
}

const PLAYER_TITLE_SUFFIXES: &[&str] = &[
    " - VLC media player",
    " - Windows Media Player",
    " - foobar2000",
    " - MPC-HC",
    " - MPC-BE",
    " [foobar2000]",
];

/// 从传统播放器的主窗口标题中去掉播放器自己的名字，只保留正在播放的内容。
pub fn clean_player_window_title(title: &str) -> Option<String> {
    let mut cleaned = title.trim_end();
    for suffix in PLAYER_TITLE_SUFFIXES {
        if let Some(stripped) = cleaned.strip_suffix(suffix) {
            cleaned = stripped;
            break;
        }
    }
    let cleaned = cleaned.trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// 计算封面图片数据的哈希值 (u64)，用于日志和缓存命中判断。
pub fn calculate_cover_hash(data: &[u8]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

/// 只读取图片头，得到编码图片的宽高。
pub fn probe_image_dimensions(bytes: &[u8]) -> BackendResult<(u32, u32)> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| BackendError::Faulted(format!("无法识别图片格式: {e}")))?;
    Ok(reader.into_dimensions()?)
}

/// 把 GDI 返回的自上而下 BGRA 像素编码为 PNG 缩略图。
///
/// 旧式图标没有 alpha 通道，此时所有像素的 alpha 都是 0，需要当作不透明处理。
pub fn encode_bgra_icon(width: u32, height: u32, mut bgra: Vec<u8>) -> BackendResult<Thumbnail> {
    let expected = width as usize * height as usize * 4;
    if width == 0 || height == 0 || bgra.len() != expected {
        return Err(BackendError::Faulted(format!(
            "图标像素数据长度不匹配: {}x{} 需要 {expected} 字节，实际 {} 字节",
            width,
            height,
            bgra.len()
        )));
    }

    let has_alpha = bgra.chunks_exact(4).any(|px| px[3] != 0);
    for px in bgra.chunks_exact_mut(4) {
        px.swap(0, 2);
        if !has_alpha {
            px[3] = 0xFF;
        }
    }

    let rgba = RgbaImage::from_raw(width, height, bgra)
        .ok_or_else(|| BackendError::Faulted("无法构建图标图像".to_string()))?;
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(rgba).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;

    Ok(Thumbnail {
        bytes,
        width,
        height,
    })
}
