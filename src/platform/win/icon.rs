use std::{os::windows::ffi::OsStrExt, path::Path};

use windows::{
    Win32::{
        Graphics::Gdi::{
            BI_RGB, BITMAP, BITMAPINFO, BITMAPINFOHEADER, DIB_RGB_COLORS, DeleteObject, GetDC,
            GetDIBits, GetObjectW, HBITMAP, HGDIOBJ, ReleaseDC,
        },
        UI::{
            Shell::ExtractIconExW,
            WindowsAndMessaging::{DestroyIcon, GetIconInfo, HICON, ICONINFO},
        },
    },
    core::PCWSTR,
};

use crate::{
    api::Thumbnail,
    backend::IconExtractor,
    error::{BackendError, BackendResult},
    utils::encode_bgra_icon,
};

struct IconGuard(HICON);

impl Drop for IconGuard {
    fn drop(&mut self) {
        if let Err(e) = unsafe { DestroyIcon(self.0) } {
            log::trace!("[Icon] DestroyIcon 失败: {e:?}");
        }
    }
}

struct BitmapGuard(HBITMAP);

impl Drop for BitmapGuard {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = DeleteObject(HGDIOBJ::from(self.0));
            }
        }
    }
}

/// 使用 Shell 提取可执行文件的主图标，编码为 PNG。
#[derive(Debug, Default)]
pub struct ShellIconExtractor;

impl ShellIconExtractor {
    fn bitmap_pixels(bitmap: HBITMAP) -> BackendResult<(u32, u32, Vec<u8>)> {
        let mut info = BITMAP::default();
        let written = unsafe {
            GetObjectW(
                HGDIOBJ::from(bitmap),
                std::mem::size_of::<BITMAP>() as i32,
                Some((&mut info as *mut BITMAP).cast()),
            )
        };
        if written == 0 || info.bmWidth <= 0 || info.bmHeight <= 0 {
            return Err(BackendError::Faulted("无法读取图标位图的尺寸".to_string()));
        }

        let width = info.bmWidth as u32;
        let height = info.bmHeight as u32;
        let mut header = BITMAPINFO {
            bmiHeader: BITMAPINFOHEADER {
                biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                biWidth: info.bmWidth,
                // 负高度表示自上而下的行序
                biHeight: -info.bmHeight,
                biPlanes: 1,
                biBitCount: 32,
                biCompression: BI_RGB.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut pixels = vec![0u8; (width * height * 4) as usize];

        let hdc = unsafe { GetDC(None) };
        let lines = unsafe {
            GetDIBits(
                hdc,
                bitmap,
                0,
                height,
                Some(pixels.as_mut_ptr().cast()),
                &mut header,
                DIB_RGB_COLORS,
            )
        };
        unsafe { ReleaseDC(None, hdc) };

        if lines == 0 {
            return Err(BackendError::Faulted("GetDIBits 没有返回任何数据".to_string()));
        }
        Ok((width, height, pixels))
    }
}

impl IconExtractor for ShellIconExtractor {
    fn extract(&self, path: &Path) -> BackendResult<Thumbnail> {
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();

        let mut large = HICON::default();
        let extracted =
            unsafe { ExtractIconExW(PCWSTR(wide.as_ptr()), 0, Some(&mut large), None, 1) };
        if extracted == 0 || large.is_invalid() {
            return Err(BackendError::Faulted(format!(
                "{} 中没有可用的图标",
                path.display()
            )));
        }
        let icon = IconGuard(large);

        let mut icon_info = ICONINFO::default();
        unsafe { GetIconInfo(icon.0, &mut icon_info)? };
        let _mask = BitmapGuard(icon_info.hbmMask);
        let color = BitmapGuard(icon_info.hbmColor);
        if color.0.is_invalid() {
            return Err(BackendError::Unsupported("单色图标"));
        }

        let (width, height, pixels) = Self::bitmap_pixels(color.0)?;
        encode_bgra_icon(width, height, pixels)
    }
}
