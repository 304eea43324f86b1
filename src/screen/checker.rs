use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tracing::{error, info, warn};

use super::tree;
use crate::errors::StepError;
use crate::shell::ShellChannel;
use crate::task::AppScreen;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Depth searched below the dump root for the view hierarchy marker.
const VIEW_HIERARCHY_MAX_LEVELS: i32 = 3;

/// Result of one evaluation of the expected screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Success,
    EmptyExpectedActivity,
    FailedActivityExtraction,
    UnexpectedActivity,
    UnexpectedViewHierarchy,
}

impl CheckOutcome {
    /// Whether the outcome means the user left the expected screen.
    pub fn is_divergence(self) -> bool {
        matches!(self, Self::UnexpectedActivity | Self::UnexpectedViewHierarchy)
    }
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::EmptyExpectedActivity => "empty expected activity",
            Self::FailedActivityExtraction => "failed activity extraction",
            Self::UnexpectedActivity => "unexpected activity",
            Self::UnexpectedViewHierarchy => "unexpected view hierarchy",
        };
        f.write_str(s)
    }
}

/// Anything that can judge the current device screen.
pub trait ScreenCheck: Send + Sync {
    fn evaluate(&self) -> CheckOutcome;
}

/// Compares the foreground activity and view hierarchy with an [`AppScreen`].
pub struct AppScreenChecker {
    shell: Arc<dyn ShellChannel>,
    activity: String,
    view_hierarchy_path: Vec<Regex>,
}

impl AppScreenChecker {
    pub fn new(shell: Arc<dyn ShellChannel>, screen: &AppScreen) -> Result<Self, regex::Error> {
        Ok(Self {
            shell,
            activity: screen.activity.clone(),
            view_hierarchy_path: tree::compile_path(&screen.view_hierarchy_path)?,
        })
    }

    pub fn expected_activity(&self) -> &str {
        &self.activity
    }

    /// Poll [`evaluate`](ScreenCheck::evaluate) every 100ms until it reports
    /// `Success` or `timeout` elapses. Returns the time spent waiting.
    pub fn wait_for(&self, timeout: Duration) -> Result<Duration, StepError> {
        info!(activity = %self.activity, timeout_secs = timeout.as_secs_f64(), "waiting for app screen");
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.evaluate() == CheckOutcome::Success {
                let waited = start.elapsed();
                info!(
                    activity = %self.activity,
                    waited_secs = waited.as_secs_f64(),
                    "app screen reached"
                );
                return Ok(waited);
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
        error!(
            activity = %self.activity,
            waited_secs = start.elapsed().as_secs_f64(),
            "app screen did not appear"
        );
        Err(StepError::AppScreenTimeout)
    }
}

impl ScreenCheck for AppScreenChecker {
    fn evaluate(&self) -> CheckOutcome {
        if self.activity.is_empty() {
            return CheckOutcome::EmptyExpectedActivity;
        }

        let Some(current) = self.shell.current_activity() else {
            return CheckOutcome::FailedActivityExtraction;
        };
        if current != self.activity {
            warn!(current = %current, expected = %self.activity, "unexpected activity");
            return CheckOutcome::UnexpectedActivity;
        }

        if self.view_hierarchy_path.is_empty() {
            return CheckOutcome::Success;
        }

        let package = self
            .activity
            .split('/')
            .next()
            .unwrap_or(self.activity.as_str())
            .to_string();
        let dump = self
            .shell
            .dumpsys("activity", &[package.clone(), package]);
        if !dump.is_ok() {
            return CheckOutcome::FailedActivityExtraction;
        }
        if !dump.payload.is_empty()
            && !tree::matches_path(&dump.text(), &self.view_hierarchy_path, VIEW_HIERARCHY_MAX_LEVELS)
        {
            return CheckOutcome::UnexpectedViewHierarchy;
        }
        CheckOutcome::Success
    }
}
