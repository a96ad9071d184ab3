//! 平台后端。
//!
//! Windows 上使用系统媒体会话和 WASAPI；其他平台上使用一个什么都报告不到的后端，
//! 使库仍然可以编译和测试。

#[cfg(not(windows))]
pub mod dummy;
#[cfg(windows)]
pub mod win;

/// 当前平台的默认后端。
#[cfg(windows)]
pub type PlatformBackend = win::WindowsBackend;

/// 当前平台的默认后端。
#[cfg(not(windows))]
pub type PlatformBackend = dummy::DummyBackend;
