use std::{path::PathBuf, sync::Arc};

use crate::{
    backend::{AudioSessionSnapshotProvider, AudioSessionState, ProcessLocator, ProgramFilesKind},
    config::LegacyAllowList,
    utils::{
        clean_player_window_title, display_name_from_app_id, normalize_executable_name,
        player_stem_from_identifier,
    },
};

/// 一次轮询得到的传统播放器观测结果。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct LegacyObservation {
    pub playing: bool,
    /// 会话组报告的可执行文件名，例如 "vlc.exe"。
    pub exe_name: String,
    pub display_name: Option<String>,
}

/// 一次轮询相对上一次的变化。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct LegacyChange {
    pub playback_changed: bool,
    pub track_changed: bool,
}

impl LegacyChange {
    pub fn any(self) -> bool {
        self.playback_changed || self.track_changed
    }
}

/// 轮询音频会话快照，找出正在出声的白名单播放器。
pub(crate) struct LegacyPoller<S> {
    snapshots: S,
    allow_list: Arc<LegacyAllowList>,
    current: LegacyObservation,
}

impl<S: AudioSessionSnapshotProvider> LegacyPoller<S> {
    pub fn new(snapshots: S, allow_list: Arc<LegacyAllowList>) -> Self {
        Self {
            snapshots,
            allow_list,
            current: LegacyObservation::default(),
        }
    }

    pub fn observation(&self) -> &LegacyObservation {
        &self.current
    }

    /// 执行一次轮询并更新观测结果。
    ///
    /// 快照失败被当作“这一次没有答案”：保留上一次的观测，不报告任何变化。
    pub fn poll(&mut self) -> LegacyChange {
        let next = match self.scan() {
            Ok(observation) => observation,
            Err(e) => {
                log::debug!("[LegacyPoller] 读取音频会话快照失败，沿用上一次结果: {e}");
                return LegacyChange::default();
            }
        };

        let previous = std::mem::replace(&mut self.current, next);
        let change = detect_change(&previous, &self.current);
        if change.any() {
            log::debug!(
                "[LegacyPoller] 观测变化: playing {} -> {}, 播放器 '{}' -> '{}'",
                previous.playing,
                self.current.playing,
                previous.exe_name,
                self.current.exe_name
            );
        }
        change
    }

    fn scan(&self) -> crate::error::BackendResult<LegacyObservation> {
        for device in self.snapshots.devices()? {
            let found = device.groups.into_iter().find(|group| {
                group.state == AudioSessionState::Active
                    && group
                        .exe_name
                        .as_deref()
                        .is_some_and(|exe| self.allow_list.contains(exe))
            });

            if let Some(group) = found {
                let exe_name = group.exe_name.unwrap_or_default();
                let display_name = group
                    .display_name
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| display_name_from_app_id(&exe_name));
                return Ok(LegacyObservation {
                    playing: true,
                    exe_name,
                    display_name: Some(display_name),
                });
            }
        }
        Ok(LegacyObservation::default())
    }
}

fn detect_change(previous: &LegacyObservation, next: &LegacyObservation) -> LegacyChange {
    let playback_changed = previous.playing != next.playing;
    let track_changed = previous.playing
        && next.playing
        && !previous.exe_name.is_empty()
        && !next.exe_name.is_empty()
        && normalize_executable_name(&previous.exe_name) != normalize_executable_name(&next.exe_name);
    LegacyChange {
        playback_changed,
        track_changed,
    }
}

/// 常见播放器的默认安装位置 (相对于 Program Files 根目录)。
const KNOWN_INSTALL_PATHS: &[(&str, ProgramFilesKind, &[&str])] = &[
    ("vlc", ProgramFilesKind::Native, &["VideoLAN", "VLC", "vlc.exe"]),
    ("vlc", ProgramFilesKind::X86, &["VideoLAN", "VLC", "vlc.exe"]),
    (
        "wmplayer",
        ProgramFilesKind::Native,
        &["Windows Media Player", "wmplayer.exe"],
    ),
    (
        "wmplayer",
        ProgramFilesKind::X86,
        &["Windows Media Player", "wmplayer.exe"],
    ),
    ("mpc-hc64", ProgramFilesKind::Native, &["MPC-HC", "mpc-hc64.exe"]),
    ("mpc-hc", ProgramFilesKind::X86, &["MPC-HC", "mpc-hc.exe"]),
    ("mpc-be64", ProgramFilesKind::Native, &["MPC-BE x64", "mpc-be64.exe"]),
    ("mpc-be", ProgramFilesKind::X86, &["MPC-BE", "mpc-be.exe"]),
    ("foobar2000", ProgramFilesKind::X86, &["foobar2000", "foobar2000.exe"]),
    (
        "potplayermini64",
        ProgramFilesKind::Native,
        &["DAUM", "PotPlayer", "PotPlayerMini64.exe"],
    ),
];

/// 把播放器标识解析为可执行文件路径。尽力而为。
pub(crate) struct ExecutableResolver<P> {
    processes: Arc<P>,
}

impl<P: ProcessLocator> ExecutableResolver<P> {
    pub fn new(processes: Arc<P>) -> Self {
        Self { processes }
    }

    /// 先找正在运行的同名进程，再查常见安装位置。
    pub fn executable_path(&self, identifier: &str) -> Option<PathBuf> {
        let stem = player_stem_from_identifier(identifier);
        if stem.is_empty() {
            return None;
        }

        if let Some(path) = self.processes.running_executable_path(&stem) {
            log::trace!("[LegacyPoller] '{identifier}' 对应运行中的进程: {}", path.display());
            return Some(path);
        }

        let found = KNOWN_INSTALL_PATHS
            .iter()
            .filter(|(name, _, _)| name.contains(stem.as_str()) || stem.contains(name))
            .filter_map(|(_, kind, components)| {
                let root = self.processes.program_files(*kind)?;
                Some(components.iter().fold(root, |path, part| path.join(part)))
            })
            .find(|candidate| self.processes.path_exists(candidate));

        if found.is_none() {
            log::debug!("[LegacyPoller] 无法为 '{identifier}' 找到可执行文件。");
        }
        found
    }

    /// 传统播放器的媒体描述：主窗口标题去掉播放器后缀，
    /// 没有标题时依次回落到显示名称和可执行文件名。
    pub fn media_info(&self, observation: &LegacyObservation) -> Option<String> {
        if !observation.playing {
            return None;
        }
        let stem = normalize_executable_name(&observation.exe_name);
        self.processes
            .main_window_title(&stem)
            .and_then(|title| clean_player_window_title(&title))
            .or_else(|| observation.display_name.clone())
            .or_else(|| (!stem.is_empty()).then_some(stem))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, HashSet},
        path::Path,
        sync::Mutex,
    };

    use super::*;
    use crate::{
        backend::{AudioDevice, AudioSessionGroup},
        config::MediaConfig,
        error::{BackendError, BackendResult},
    };

    #[derive(Default)]
    struct ScriptedSnapshots {
        script: Mutex<Vec<BackendResult<Vec<AudioDevice>>>>,
    }

    impl ScriptedSnapshots {
        fn push(&self, result: BackendResult<Vec<AudioDevice>>) {
            self.script.lock().unwrap().push(result);
        }
    }

    impl AudioSessionSnapshotProvider for Arc<ScriptedSnapshots> {
        fn devices(&self) -> BackendResult<Vec<AudioDevice>> {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(Vec::new())
            } else {
                script.remove(0)
            }
        }
    }

    fn group(state: AudioSessionState, exe: &str) -> AudioSessionGroup {
        AudioSessionGroup {
            state,
            exe_name: Some(exe.to_string()),
            display_name: None,
        }
    }

    fn device(groups: Vec<AudioSessionGroup>) -> Vec<AudioDevice> {
        vec![AudioDevice {
            id: "speakers".to_string(),
            groups,
        }]
    }

    fn poller() -> (Arc<ScriptedSnapshots>, LegacyPoller<Arc<ScriptedSnapshots>>) {
        let snapshots = Arc::new(ScriptedSnapshots::default());
        let poller = LegacyPoller::new(snapshots.clone(), MediaConfig::default().allow_list());
        (snapshots, poller)
    }

    #[test]
    fn test_detects_active_allow_listed_player() {
        let (snapshots, mut poller) = poller();
        snapshots.push(Ok(device(vec![
            group(AudioSessionState::Active, "chrome.exe"),
            group(AudioSessionState::Inactive, "foobar2000.exe"),
            group(AudioSessionState::Active, "VLC.exe"),
        ])));

        let change = poller.poll();
        assert!(change.playback_changed);
        assert!(!change.track_changed);
        assert!(poller.observation().playing);
        assert_eq!(poller.observation().exe_name, "VLC.exe");
        assert_eq!(poller.observation().display_name.as_deref(), Some("VLC"));
    }

    #[test]
    fn test_inactive_or_unknown_sessions_are_ignored() {
        let (snapshots, mut poller) = poller();
        snapshots.push(Ok(device(vec![
            group(AudioSessionState::Inactive, "vlc.exe"),
            group(AudioSessionState::Expired, "mpv.exe"),
            group(AudioSessionState::Active, "spotify.exe"),
        ])));

        assert_eq!(poller.poll(), LegacyChange::default());
        assert!(!poller.observation().playing);
    }

    #[test]
    fn test_player_switch_while_playing_is_a_track_change() {
        let (snapshots, mut poller) = poller();
        snapshots.push(Ok(device(vec![group(AudioSessionState::Active, "vlc.exe")])));
        snapshots.push(Ok(device(vec![group(AudioSessionState::Active, "mpv.exe")])));

        poller.poll();
        let change = poller.poll();
        assert!(!change.playback_changed);
        assert!(change.track_changed);
    }

    #[test]
    fn test_stop_then_different_start_is_not_a_track_change() {
        let (snapshots, mut poller) = poller();
        snapshots.push(Ok(device(vec![group(AudioSessionState::Active, "vlc.exe")])));
        snapshots.push(Ok(Vec::new()));
        snapshots.push(Ok(device(vec![group(AudioSessionState::Active, "mpv.exe")])));

        let changes: Vec<_> = (0..3).map(|_| poller.poll()).collect();
        assert!(changes.iter().all(|c| c.playback_changed));
        assert!(changes.iter().all(|c| !c.track_changed));
    }

    #[test]
    fn test_snapshot_failure_keeps_previous_observation() {
        let (snapshots, mut poller) = poller();
        snapshots.push(Ok(device(vec![group(AudioSessionState::Active, "vlc.exe")])));
        snapshots.push(Err(BackendError::Faulted("device removed".to_string())));

        poller.poll();
        assert_eq!(poller.poll(), LegacyChange::default());
        assert!(poller.observation().playing);
    }

    #[test]
    fn test_second_device_is_scanned() {
        let (snapshots, mut poller) = poller();
        snapshots.push(Ok(vec![
            AudioDevice {
                id: "speakers".to_string(),
                groups: vec![],
            },
            AudioDevice {
                id: "headphones".to_string(),
                groups: vec![AudioSessionGroup {
                    state: AudioSessionState::Active,
                    exe_name: Some("foobar2000.exe".to_string()),
                    display_name: Some("foobar2000 v2".to_string()),
                }],
            },
        ]));

        poller.poll();
        assert_eq!(
            poller.observation().display_name.as_deref(),
            Some("foobar2000 v2")
        );
    }

    #[derive(Default)]
    struct FakeProcesses {
        running: HashMap<String, PathBuf>,
        titles: HashMap<String, String>,
        existing: HashSet<PathBuf>,
    }

    impl ProcessLocator for FakeProcesses {
        fn running_executable_path(&self, process_name: &str) -> Option<PathBuf> {
            self.running.get(process_name).cloned()
        }

        fn path_exists(&self, path: &Path) -> bool {
            self.existing.contains(path)
        }

        fn main_window_title(&self, process_name: &str) -> Option<String> {
            self.titles.get(process_name).cloned()
        }

        fn program_files(&self, kind: ProgramFilesKind) -> Option<PathBuf> {
            Some(PathBuf::from(match kind {
                ProgramFilesKind::Native => "/pf",
                ProgramFilesKind::X86 => "/pf86",
            }))
        }
    }

    #[test]
    fn test_running_process_wins_over_install_table() {
        let mut processes = FakeProcesses::default();
        processes
            .running
            .insert("vlc".to_string(), PathBuf::from("/portable/vlc.exe"));
        processes
            .existing
            .insert(PathBuf::from("/pf/VideoLAN/VLC/vlc.exe"));

        let resolver = ExecutableResolver::new(Arc::new(processes));
        assert_eq!(
            resolver.executable_path("VLC.exe"),
            Some(PathBuf::from("/portable/vlc.exe"))
        );
    }

    #[test]
    fn test_install_table_is_consulted() {
        let mut processes = FakeProcesses::default();
        processes
            .existing
            .insert(PathBuf::from("/pf86/foobar2000/foobar2000.exe"));
        processes
            .existing
            .insert(PathBuf::from("/pf/DAUM/PotPlayer/PotPlayerMini64.exe"));

        let resolver = ExecutableResolver::new(Arc::new(processes));
        assert_eq!(
            resolver.executable_path("foobar2000.exe"),
            Some(PathBuf::from("/pf86/foobar2000/foobar2000.exe"))
        );
        assert_eq!(
            resolver.executable_path("PotPlayerMini64.exe"),
            Some(PathBuf::from("/pf/DAUM/PotPlayer/PotPlayerMini64.exe"))
        );
        assert_eq!(resolver.executable_path("winamp.exe"), None);
        assert_eq!(resolver.executable_path(""), None);
    }

    #[test]
    fn test_media_info_prefers_window_title() {
        let mut processes = FakeProcesses::default();
        processes.titles.insert(
            "vlc".to_string(),
            "holiday.mp4 - VLC media player".to_string(),
        );
        let resolver = ExecutableResolver::new(Arc::new(processes));

        let playing = LegacyObservation {
            playing: true,
            exe_name: "vlc.exe".to_string(),
            display_name: Some("vlc".to_string()),
        };
        assert_eq!(resolver.media_info(&playing).as_deref(), Some("holiday.mp4"));

        let untitled = LegacyObservation {
            exe_name: "mpv.exe".to_string(),
            ..playing.clone()
        };
        assert_eq!(resolver.media_info(&untitled).as_deref(), Some("vlc"));

        assert_eq!(resolver.media_info(&LegacyObservation::default()), None);
    }
}
