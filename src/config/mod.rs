use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths;

const CONFIG_FILENAME: &str = "config.toml";

/// How to reach the device through adb.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdbSettings {
    #[serde(default = "default_adb_path")]
    pub path: String,
    /// Device serial (`adb -s`). Empty means "the only attached device".
    #[serde(default)]
    pub serial: String,
    #[serde(default = "default_adb_server_port")]
    pub server_port: u16,
    #[serde(default = "default_adb_timeout_secs")]
    pub default_timeout_secs: u64,
}

fn default_adb_path() -> String {
    "adb".to_string()
}

fn default_adb_server_port() -> u16 {
    5037
}

fn default_adb_timeout_secs() -> u64 {
    120
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            path: default_adb_path(),
            serial: String::new(),
            server_port: default_adb_server_port(),
            default_timeout_secs: default_adb_timeout_secs(),
        }
    }
}

impl AdbSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerSettings {
    #[serde(default = "default_max_bad_states")]
    pub max_bad_states: u32,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_max_steps_per_sec")]
    pub max_steps_per_sec: f64,
    #[serde(default)]
    pub periodic_restart_time_min: f64,
    #[serde(default = "default_force_simulator_launch")]
    pub force_simulator_launch: bool,
    #[serde(default = "default_num_fingers")]
    pub num_fingers: u32,
}

fn default_max_bad_states() -> u32 {
    3
}

fn default_step_timeout_secs() -> u64 {
    10
}

fn default_max_steps_per_sec() -> f64 {
    5.0
}

fn default_force_simulator_launch() -> bool {
    true
}

fn default_num_fingers() -> u32 {
    1
}

impl ControllerSettings {
    /// Reject rates and periods that cannot be turned into a duration.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("max_steps_per_sec", self.max_steps_per_sec),
            ("periodic_restart_time_min", self.periodic_restart_time_min),
        ] {
            if !value.is_finite() {
                bail!("[controller] {key} must be a finite number, got {value}");
            }
        }
        Ok(())
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_bad_states: default_max_bad_states(),
            step_timeout_secs: default_step_timeout_secs(),
            max_steps_per_sec: default_max_steps_per_sec(),
            periodic_restart_time_min: 0.0,
            force_simulator_launch: default_force_simulator_launch(),
            num_fingers: default_num_fingers(),
        }
    }
}

/// Screen poller throttling.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollerSettings {
    /// Only every Nth step triggers a dumpsys check.
    #[serde(default = "default_check_frequency")]
    pub check_frequency: u32,
    #[serde(default = "default_max_failed_current_activity")]
    pub max_failed_current_activity: u32,
}

fn default_check_frequency() -> u32 {
    150
}

fn default_max_failed_current_activity() -> u32 {
    10
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            check_frequency: default_check_frequency(),
            max_failed_current_activity: default_max_failed_current_activity(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TaskSettings {
    /// Task definition file, relative to the project root.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub poller: PollerSettings,
    #[serde(default)]
    pub task: TaskSettings,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.droidvisor/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            config
                .controller
                .validate()
                .with_context(|| format!("invalid {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = paths::state_dir(&dir).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Resolve the task file against the directory holding `.droidvisor/`.
    pub fn task_path(&self, config_path: Option<&Path>, cwd: &Path) -> Option<PathBuf> {
        let task = self.task.path.as_ref()?;
        if task.is_absolute() {
            return Some(task.clone());
        }
        let root = config_path
            .and_then(paths::project_root_of_config)
            .unwrap_or(cwd);
        Some(root.join(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ProjectConfig::default();
        assert_eq!(config.adb.path, "adb");
        assert!(config.adb.serial.is_empty());
        assert_eq!(config.adb.server_port, 5037);
        assert_eq!(config.adb.default_timeout(), Duration::from_secs(120));
        assert_eq!(config.controller.max_bad_states, 3);
        assert_eq!(config.controller.step_timeout_secs, 10);
        assert_eq!(config.controller.max_steps_per_sec, 5.0);
        assert_eq!(config.controller.periodic_restart_time_min, 0.0);
        assert!(config.controller.force_simulator_launch);
        assert_eq!(config.controller.num_fingers, 1);
        assert_eq!(config.poller.check_frequency, 150);
        assert_eq!(config.poller.max_failed_current_activity, 10);
        assert!(config.task.path.is_none());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[adb]
path = "/opt/android/platform-tools/adb"
serial = "emulator-5554"
server_port = 5038
default_timeout_secs = 30

[controller]
max_bad_states = 5
step_timeout_secs = 0
max_steps_per_sec = 10.0
periodic_restart_time_min = 60.0
force_simulator_launch = false
num_fingers = 2

[poller]
check_frequency = 20
max_failed_current_activity = 4

[task]
path = "tasks/clock.toml"
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.adb.serial, "emulator-5554");
        assert_eq!(config.adb.server_port, 5038);
        assert_eq!(config.controller.max_bad_states, 5);
        assert_eq!(config.controller.step_timeout_secs, 0);
        assert_eq!(config.controller.periodic_restart_time_min, 60.0);
        assert!(!config.controller.force_simulator_launch);
        assert_eq!(config.controller.num_fingers, 2);
        assert_eq!(config.poller.check_frequency, 20);
        assert_eq!(config.poller.max_failed_current_activity, 4);
        assert_eq!(config.task.path, Some(PathBuf::from("tasks/clock.toml")));
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[poller]
check_frequency = 1
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.poller.check_frequency, 1);
        assert_eq!(config.poller.max_failed_current_activity, 10);
        assert_eq!(config.controller.max_bad_states, 3);
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path().join(".droidvisor");
        fs::create_dir_all(&state).unwrap();
        fs::write(
            state.join("config.toml"),
            r#"
[adb]
serial = "R58M123"

[task]
path = "task.toml"
"#,
        )
        .unwrap();

        let nested = tmp.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ProjectConfig::load(&nested).unwrap();
        let path = path.unwrap();
        assert_eq!(config.adb.serial, "R58M123");
        assert_eq!(
            config.task_path(Some(&path), &nested),
            Some(tmp.path().join("task.toml"))
        );
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.adb.path, "adb");
        assert_eq!(config.task_path(None, tmp.path()), None);
    }

    #[test]
    fn non_finite_controller_values_are_rejected() {
        for toml in [
            "[controller]\nmax_steps_per_sec = nan\n",
            "[controller]\nperiodic_restart_time_min = inf\n",
            "[controller]\nmax_steps_per_sec = -inf\n",
        ] {
            let tmp = tempfile::tempdir().unwrap();
            let state = tmp.path().join(".droidvisor");
            fs::create_dir_all(&state).unwrap();
            fs::write(state.join("config.toml"), toml).unwrap();

            let err = ProjectConfig::load(tmp.path()).unwrap_err();
            assert!(format!("{err:#}").contains("must be a finite number"), "{toml}");
        }
        assert!(ControllerSettings::default().validate().is_ok());
    }

    #[test]
    fn absolute_task_path_is_kept() {
        let config: ProjectConfig = toml::from_str("[task]\npath = \"/srv/task.toml\"\n").unwrap();
        assert_eq!(
            config.task_path(None, Path::new("/home")),
            Some(PathBuf::from("/srv/task.toml"))
        );
    }
}
