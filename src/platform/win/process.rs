use std::{
    collections::HashSet,
    ffi::OsString,
    os::windows::ffi::OsStringExt,
    path::{Path, PathBuf},
};

use windows::{
    Win32::{
        Foundation::{CloseHandle, ERROR_NO_MORE_FILES, HANDLE, HWND, LPARAM},
        System::{
            Diagnostics::ToolHelp::{
                CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW,
                TH32CS_SNAPPROCESS,
            },
            Threading::{
                OpenProcess, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION,
                QueryFullProcessImageNameW,
            },
        },
        UI::WindowsAndMessaging::{
            EnumWindows, GW_OWNER, GetWindow, GetWindowTextLengthW, GetWindowTextW,
            GetWindowThreadProcessId, IsWindowVisible,
        },
    },
    core::{PWSTR, Result as WinResult},
};
use windows_core::BOOL;

use crate::{backend::ProcessLocator, utils::normalize_executable_name};

/// 系统中的一个进程。
#[derive(Debug, Clone)]
pub(super) struct ProcessEntry {
    pub pid: u32,
    pub exe_name: String,
}

/// 在作用域结束时关闭句柄。
struct HandleGuard(HANDLE);

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe { CloseHandle(self.0).ok() };
        }
    }
}

fn wide_to_string(wide: &[u16]) -> String {
    let len = wide.iter().take_while(|&&c| c != 0).count();
    OsString::from_wide(&wide[..len])
        .to_string_lossy()
        .into_owned()
}

/// 使用 Tool Help 快照列出系统中的所有进程。
pub(super) fn process_entries() -> WinResult<Vec<ProcessEntry>> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0)? };
    let _guard = HandleGuard(snapshot);

    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };
    let mut entries = Vec::new();

    if unsafe { Process32FirstW(snapshot, &mut entry) }.is_err() {
        let err = windows::core::Error::from_win32();
        if err.code() != ERROR_NO_MORE_FILES.to_hresult() {
            log::warn!("[Windows] Process32FirstW 失败或快照为空: {err:?}");
        }
        return Ok(entries);
    }

    loop {
        entries.push(ProcessEntry {
            pid: entry.th32ProcessID,
            exe_name: wide_to_string(&entry.szExeFile),
        });

        if unsafe { Process32NextW(snapshot, &mut entry) }.is_err() {
            let err = windows::core::Error::from_win32();
            if err.code() != ERROR_NO_MORE_FILES.to_hresult() {
                log::error!("[Windows] Process32NextW 失败: {err:?}");
            }
            break;
        }
    }
    Ok(entries)
}

fn pids_for_process(process_name: &str) -> HashSet<u32> {
    let wanted = normalize_executable_name(process_name);
    match process_entries() {
        Ok(entries) => entries
            .into_iter()
            .filter(|entry| normalize_executable_name(&entry.exe_name) == wanted)
            .map(|entry| entry.pid)
            .collect(),
        Err(e) => {
            log::warn!("[Windows] 创建进程快照失败: {e:?}");
            HashSet::new()
        }
    }
}

fn image_path_of(pid: u32) -> WinResult<PathBuf> {
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid)? };
    let _guard = HandleGuard(handle);

    let mut buffer = vec![0u16; 1024];
    let mut size = buffer.len() as u32;
    unsafe {
        QueryFullProcessImageNameW(
            handle,
            PROCESS_NAME_WIN32,
            PWSTR(buffer.as_mut_ptr()),
            &mut size,
        )?;
    }
    Ok(PathBuf::from(OsString::from_wide(&buffer[..size as usize])))
}

struct WindowSearch {
    pids: HashSet<u32>,
    title: Option<String>,
}

unsafe extern "system" fn find_main_window(hwnd: HWND, lparam: LPARAM) -> BOOL {
    let search = unsafe { &mut *(lparam.0 as *mut WindowSearch) };

    let mut pid = 0u32;
    unsafe { GetWindowThreadProcessId(hwnd, Some(&mut pid)) };
    if !search.pids.contains(&pid) || !unsafe { IsWindowVisible(hwnd) }.as_bool() {
        return BOOL(1);
    }
    // 只看顶层的主窗口
    if let Ok(owner) = unsafe { GetWindow(hwnd, GW_OWNER) }
        && !owner.is_invalid()
    {
        return BOOL(1);
    }

    let len = unsafe { GetWindowTextLengthW(hwnd) };
    if len <= 0 {
        return BOOL(1);
    }
    let mut buffer = vec![0u16; len as usize + 1];
    let copied = unsafe { GetWindowTextW(hwnd, &mut buffer) };
    if copied > 0 {
        search.title = Some(wide_to_string(&buffer[..copied as usize]));
        return BOOL(0);
    }
    BOOL(1)
}

/// 基于 Tool Help 和窗口枚举的进程查询。
#[derive(Debug, Default)]
pub struct Win32Processes;

impl ProcessLocator for Win32Processes {
    fn running_executable_path(&self, process_name: &str) -> Option<PathBuf> {
        pids_for_process(process_name)
            .into_iter()
            .find_map(|pid| match image_path_of(pid) {
                Ok(path) => Some(path),
                Err(e) => {
                    log::debug!("[Windows] 无法读取进程 {pid} 的映像路径: {e:?}");
                    None
                }
            })
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn main_window_title(&self, process_name: &str) -> Option<String> {
        let pids = pids_for_process(process_name);
        if pids.is_empty() {
            return None;
        }

        let mut search = WindowSearch { pids, title: None };
        // 回调返回 FALSE 中止枚举时 EnumWindows 也会报告失败，这里不关心。
        let _ = unsafe {
            EnumWindows(
                Some(find_main_window),
                LPARAM(&mut search as *mut WindowSearch as isize),
            )
        };
        search.title.filter(|title| !title.trim().is_empty())
    }
}
