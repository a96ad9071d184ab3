//! Windows 后端：SMTC 会话、WASAPI 音频会话快照、Tool Help 进程查询和 Shell 图标提取。

use std::sync::Arc;

use windows::Win32::System::Com::{COINIT_MULTITHREADED, CoInitializeEx, CoUninitialize};

use crate::{
    backend::{Backend, BackendParts},
    error::BackendResult,
};

mod audio;
mod icon;
mod process;
mod smtc;

pub use audio::WasapiSnapshots;
pub use icon::ShellIconExtractor;
pub use process::Win32Processes;
pub use smtc::{
    ManagerWatch, SessionWatch, SmtcManager, SmtcRegistry, SmtcSession, SmtcThumbnail,
    SmtcThumbnailStream,
};

/// COM 初始化/反初始化 RAII Guard。
///
/// 协调线程以 MTA 模式初始化 COM，Guard 离开作用域时自动反初始化。
pub struct ComApartment(());

impl ComApartment {
    fn initialize() -> BackendResult<Self> {
        unsafe { CoInitializeEx(None, COINIT_MULTITHREADED).ok()? };
        log::trace!("[Windows] COM (MTA) 初始化成功。");
        Ok(Self(()))
    }
}

impl Drop for ComApartment {
    fn drop(&mut self) {
        unsafe { CoUninitialize() };
        log::trace!("[Windows] COM 已通过 RAII Guard 自动反初始化。");
    }
}

/// Windows 上的默认后端。
#[derive(Debug, Default)]
pub struct WindowsBackend;

impl WindowsBackend {
    /// 创建后端。真正的系统调用要等到协调线程启动后才会发生。
    pub const fn new() -> Self {
        Self
    }
}

impl Backend for WindowsBackend {
    type Registry = SmtcRegistry;
    type Snapshots = WasapiSnapshots;
    type Processes = Win32Processes;
    type Icons = ShellIconExtractor;
    type ThreadGuard = ComApartment;

    fn attach_thread(&self) -> BackendResult<ComApartment> {
        ComApartment::initialize()
    }

    fn into_parts(self) -> BackendParts<SmtcRegistry, WasapiSnapshots, Win32Processes, ShellIconExtractor> {
        BackendParts {
            registry: SmtcRegistry,
            snapshots: WasapiSnapshots,
            processes: Arc::new(Win32Processes),
            icons: Arc::new(ShellIconExtractor),
        }
    }
}
