use std::collections::HashMap;

use windows::{
    Win32::{
        Foundation::S_OK,
        Media::Audio::{
            AudioSessionState as WinAudioSessionState, AudioSessionStateActive,
            AudioSessionStateExpired, DEVICE_STATE_ACTIVE, IAudioSessionControl,
            IAudioSessionControl2, IAudioSessionManager2, IMMDevice, IMMDeviceEnumerator,
            MMDeviceEnumerator, eRender,
        },
        System::Com::{CLSCTX_ALL, CoCreateInstance, CoTaskMemFree},
    },
    core::{Interface, PWSTR, Result as WinResult},
};

use super::process::process_entries;
use crate::{
    backend::{AudioDevice, AudioSessionGroup, AudioSessionSnapshotProvider, AudioSessionState},
    error::BackendResult,
};

/// 读取一个由 COM 分配的字符串并释放它。
///
/// # Safety
/// `value` 必须来自 COM 分配器，且之后不再被使用。
unsafe fn take_co_string(value: PWSTR) -> Option<String> {
    if value.is_null() {
        return None;
    }
    let text = unsafe { value.to_string() }.ok();
    unsafe { CoTaskMemFree(Some(value.0 as *const _)) };
    text.filter(|s| !s.is_empty())
}

fn map_state(state: WinAudioSessionState) -> AudioSessionState {
    if state == AudioSessionStateActive {
        AudioSessionState::Active
    } else if state == AudioSessionStateExpired {
        AudioSessionState::Expired
    } else {
        AudioSessionState::Inactive
    }
}

/// 基于 WASAPI 的音频会话快照。需要调用线程已经初始化 COM。
#[derive(Debug, Default)]
pub struct WasapiSnapshots;

impl WasapiSnapshots {
    fn device_snapshot(
        device: &IMMDevice,
        process_names: &HashMap<u32, String>,
    ) -> WinResult<AudioDevice> {
        let id = unsafe { take_co_string(device.GetId()?) }.unwrap_or_default();
        let manager: IAudioSessionManager2 = unsafe { device.Activate(CLSCTX_ALL, None)? };
        let sessions = unsafe { manager.GetSessionEnumerator()? };
        let count = unsafe { sessions.GetCount()? };

        let mut groups: Vec<AudioSessionGroup> = Vec::new();
        for i in 0..count {
            let control: IAudioSessionControl = match unsafe { sessions.GetSession(i) } {
                Ok(control) => control,
                Err(e) => {
                    log::trace!("[WASAPI] 跳过无法读取的会话 #{i}: {e:?}");
                    continue;
                }
            };
            let control2: IAudioSessionControl2 = control.cast()?;

            if unsafe { control2.IsSystemSoundsSession() } == S_OK {
                continue;
            }

            let pid = unsafe { control2.GetProcessId() }.unwrap_or(0);
            let exe_name = process_names.get(&pid).cloned();
            let state = map_state(unsafe { control.GetState()? });
            let display_name = unsafe { control.GetDisplayName() }
                .ok()
                .and_then(|name| unsafe { take_co_string(name) });

            // 同一个可执行文件的多个会话合并为一组
            match groups
                .iter_mut()
                .find(|group| exe_name.is_some() && group.exe_name == exe_name)
            {
                Some(group) => {
                    if state == AudioSessionState::Active {
                        group.state = AudioSessionState::Active;
                    }
                    if group.display_name.is_none() {
                        group.display_name = display_name;
                    }
                }
                None => groups.push(AudioSessionGroup {
                    state,
                    exe_name,
                    display_name,
                }),
            }
        }

        Ok(AudioDevice { id, groups })
    }
}

impl AudioSessionSnapshotProvider for WasapiSnapshots {
    fn devices(&self) -> BackendResult<Vec<AudioDevice>> {
        let process_names: HashMap<u32, String> = process_entries()?
            .into_iter()
            .map(|entry| (entry.pid, entry.exe_name))
            .collect();

        let enumerator: IMMDeviceEnumerator =
            unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)? };
        let collection = unsafe { enumerator.EnumAudioEndpoints(eRender, DEVICE_STATE_ACTIVE)? };
        let count = unsafe { collection.GetCount()? };

        let mut devices = Vec::with_capacity(count as usize);
        for i in 0..count {
            let snapshot = unsafe { collection.Item(i) }
                .and_then(|device| Self::device_snapshot(&device, &process_names));
            match snapshot {
                Ok(device) => devices.push(device),
                Err(e) => log::debug!("[WASAPI] 读取播放设备 #{i} 失败，跳过: {e:?}"),
            }
        }
        Ok(devices)
    }
}
