use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::screen::tree;

/// A task definition: what to run to bring the device into shape, and what
/// the device should look like while an episode is running.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Run once after launch and after every restart.
    #[serde(default)]
    pub setup_steps: Vec<SetupStep>,
    /// Run at the start of every episode.
    #[serde(default)]
    pub reset_steps: Vec<SetupStep>,
    #[serde(default)]
    pub expected_app_screen: AppScreen,
    #[serde(default)]
    pub log_parsing: LogParsing,
    /// Steps after which an episode is truncated. 0 means unbounded.
    #[serde(default)]
    pub max_episode_steps: u32,
    /// Wall-clock seconds after which an episode is truncated. 0 means unbounded.
    #[serde(default)]
    pub max_episode_sec: f64,
    #[serde(skip)]
    pub source_path: PathBuf,
}

/// Expected foreground activity and view hierarchy path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AppScreen {
    /// `package/activity`. Empty disables the check.
    #[serde(default)]
    pub activity: String,
    /// Regexps matched from the start of each label, one per tree level.
    #[serde(default)]
    pub view_hierarchy_path: Vec<String>,
}

/// One command plus an optional verification, retried as a unit.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SetupStep {
    #[serde(default)]
    pub command: Option<StepCommand>,
    #[serde(default)]
    pub success: Option<SuccessCondition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepCommand {
    Sleep {
        secs: f64,
    },
    Shell {
        args: Vec<String>,
        #[serde(default)]
        timeout_secs: Option<f64>,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SuccessCondition {
    /// Requested attempts. Never fewer than three are made.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub check: Option<Check>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Check {
    WaitForAppScreen {
        app_screen: AppScreen,
        #[serde(default = "default_check_timeout_secs")]
        timeout_secs: f64,
    },
    CheckInstall {
        package: String,
        #[serde(default = "default_check_timeout_secs")]
        timeout_secs: f64,
    },
    WaitForMessage {
        message: String,
        #[serde(default = "default_check_timeout_secs")]
        timeout_secs: f64,
    },
    #[serde(other)]
    Unsupported,
}

fn default_check_timeout_secs() -> f64 {
    10.0
}

/// Logcat filters and the regexps that turn log lines into task signals.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LogParsing {
    /// `tag:priority` filters passed to logcat. Everything else is silenced.
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub regexps: LogRegexps,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LogRegexps {
    /// Capture group 1 is a reward increment.
    #[serde(default)]
    pub reward: Vec<String>,
    #[serde(default)]
    pub reward_event: Vec<RewardEvent>,
    /// Capture group 1 is the running score; reward is the delta.
    #[serde(default)]
    pub score: String,
    #[serde(default)]
    pub episode_end: Vec<String>,
    /// Named groups `name` and optional `extra`.
    #[serde(default)]
    pub extra: Vec<String>,
    /// Named group `json_extra` holding a JSON object.
    #[serde(default)]
    pub json_extra: Vec<String>,
}

/// Fixed reward granted whenever `event` matches.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RewardEvent {
    pub event: String,
    #[serde(default)]
    pub reward: f64,
}

impl Task {
    /// Parse a task definition from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read task file: {}", path.display()))?;
        let mut task = Self::parse(&contents)
            .with_context(|| format!("failed to parse task file: {}", path.display()))?;
        task.source_path = path.to_path_buf();
        Ok(task)
    }

    /// Parse a task definition from TOML text and validate its regexps.
    pub fn parse(content: &str) -> Result<Self> {
        let task: Task = toml::from_str(content).context("invalid task TOML")?;
        task.validate()?;
        Ok(task)
    }

    fn validate(&self) -> Result<()> {
        tree::compile_path(&self.expected_app_screen.view_hierarchy_path)
            .context("invalid expected_app_screen.view_hierarchy_path")?;

        for (i, step) in self.setup_steps.iter().chain(&self.reset_steps).enumerate() {
            if let Some(SuccessCondition {
                check: Some(Check::WaitForAppScreen { app_screen, .. }),
                ..
            }) = &step.success
            {
                tree::compile_path(&app_screen.view_hierarchy_path)
                    .with_context(|| format!("invalid view_hierarchy_path in step {i}"))?;
            }
        }

        if self.max_episode_sec.is_nan() || self.max_episode_sec < 0.0 {
            bail!(
                "max_episode_sec must be a non-negative number, got {}",
                self.max_episode_sec
            );
        }

        let r = &self.log_parsing.regexps;
        let patterns = r
            .reward
            .iter()
            .chain(std::iter::once(&r.score))
            .chain(&r.episode_end)
            .chain(&r.extra)
            .chain(&r.json_extra)
            .chain(r.reward_event.iter().map(|e| &e.event));
        for pattern in patterns {
            if let Err(e) = Regex::new(pattern) {
                bail!("invalid log regexp `{pattern}`: {e}");
            }
        }
        Ok(())
    }
}

/// Convert a non-negative seconds value from a task file into a duration.
pub fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}
