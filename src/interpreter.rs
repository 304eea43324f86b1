//! Retrying executor for task setup and reset steps.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::errors::{InterpretError, StepError};
use crate::logcat::LogWatcher;
use crate::screen::AppScreenChecker;
use crate::shell::{ShellChannel, ShellCommand};
use crate::task::{self, AppScreen, Check, SetupStep, StepCommand};

/// Attempts made per step even when the task asks for fewer.
pub const MIN_ATTEMPTS: u32 = 3;

const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);
const INSTALL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Failure counters, summed over every `interpret` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InterpreterStats {
    pub error_count_adb_request: u32,
    pub error_count_wait_for_app_screen: u32,
    pub error_count_check_install: u32,
    pub error_count_wait_for_message: u32,
    /// Seconds spent in app-screen waits that succeeded.
    pub total_time_waiting_for_app_screen: f64,
}

pub struct SetupStepInterpreter {
    shell: Arc<dyn ShellChannel>,
    watcher: Option<Arc<LogWatcher>>,
    settle_delay: Duration,
    stats: InterpreterStats,
}

impl SetupStepInterpreter {
    /// `watcher` is needed only by `wait_for_message` checks.
    pub fn new(shell: Arc<dyn ShellChannel>, watcher: Option<Arc<LogWatcher>>) -> Self {
        Self {
            shell,
            watcher,
            settle_delay: DEFAULT_SETTLE_DELAY,
            stats: InterpreterStats::default(),
        }
    }

    /// Pause between a step's command and its success check.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn stats(&self) -> &InterpreterStats {
        &self.stats
    }

    /// Run `steps` in order. Stops at the first step that runs out of attempts.
    pub fn interpret(&mut self, steps: &[SetupStep]) -> Result<(), InterpretError> {
        if steps.is_empty() {
            return Ok(());
        }
        info!(steps = steps.len(), "executing setup steps");
        for (index, step) in steps.iter().enumerate() {
            self.process_step(index, step)?;
        }
        info!("done executing setup steps");
        Ok(())
    }

    fn process_step(&mut self, index: usize, step: &SetupStep) -> Result<(), InterpretError> {
        let check = step.success.as_ref().and_then(|s| s.check.as_ref());
        if step.command.is_none() && check.is_none() {
            return Err(InterpretError::EmptyStep { index });
        }

        let requested = step.success.as_ref().map_or(0, |s| s.retries);
        let max_attempts = requested.max(MIN_ATTEMPTS);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.attempt(step.command.as_ref(), check) {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => {
                    error!(step = index, error = %e, "skipping step");
                    return Ok(());
                }
                Err(e) => {
                    self.count(&e);
                    warn!(step = index, attempt, max = max_attempts, error = %e, "setup step attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(InterpretError::StepFailed {
            index,
            attempts: max_attempts,
            source: last_error.unwrap_or(StepError::AppScreenTimeout),
        })
    }

    fn attempt(&mut self, command: Option<&StepCommand>, check: Option<&Check>) -> Result<(), StepError> {
        if let Some(command) = command {
            self.execute(command)?;
        }
        thread::sleep(self.settle_delay);
        match check {
            Some(check) => self.check_success(check),
            None => Ok(()),
        }
    }

    fn execute(&self, command: &StepCommand) -> Result<(), StepError> {
        match command {
            StepCommand::Sleep { secs } => {
                thread::sleep(task::secs(*secs));
                Ok(())
            }
            StepCommand::Shell { args, timeout_secs } => {
                let mut cmd = ShellCommand::new(args.iter().cloned());
                if let Some(t) = timeout_secs {
                    cmd = cmd.with_timeout(task::secs(*t));
                }
                let response = self.shell.execute(&cmd);
                if response.is_ok() {
                    Ok(())
                } else {
                    Err(StepError::Shell(format!("`{cmd}`: {}", response.error_message)))
                }
            }
            StepCommand::Unsupported => Err(StepError::Unsupported("step command".to_string())),
        }
    }

    fn check_success(&mut self, check: &Check) -> Result<(), StepError> {
        match check {
            Check::WaitForAppScreen {
                app_screen,
                timeout_secs,
            } => self.wait_for_app_screen(app_screen, task::secs(*timeout_secs)),
            Check::CheckInstall {
                package,
                timeout_secs,
            } => self.check_install(package, task::secs(*timeout_secs)),
            Check::WaitForMessage {
                message,
                timeout_secs,
            } => self.wait_for_message(message, task::secs(*timeout_secs)),
            Check::Unsupported => Err(StepError::Unsupported("success check".to_string())),
        }
    }

    fn wait_for_app_screen(&mut self, screen: &AppScreen, timeout: Duration) -> Result<(), StepError> {
        let checker = AppScreenChecker::new(Arc::clone(&self.shell), screen)
            .map_err(|e| StepError::Unsupported(format!("view hierarchy pattern: {e}")))?;
        let waited = checker.wait_for(timeout)?;
        self.stats.total_time_waiting_for_app_screen += waited.as_secs_f64();
        Ok(())
    }

    fn check_install(&self, package: &str, timeout: Duration) -> Result<(), StepError> {
        let start = Instant::now();
        loop {
            match self.shell.installed_packages() {
                Ok(packages) if packages.contains(package) => {
                    info!(package, waited_ms = start.elapsed().as_millis() as u64, "package installed");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => warn!(package, error = %e, "failed to list installed packages"),
            }
            if start.elapsed() >= timeout {
                return Err(StepError::CheckInstallTimeout {
                    package: package.to_string(),
                    timeout,
                });
            }
            thread::sleep(INSTALL_POLL_INTERVAL);
        }
    }

    fn wait_for_message(&self, message: &str, timeout: Duration) -> Result<(), StepError> {
        let Some(watcher) = self.watcher.as_ref() else {
            return Err(StepError::Unsupported(
                "wait_for_message without a log watcher".to_string(),
            ));
        };
        let pattern = Regex::new(&format!("^(?:{message})$"))
            .map_err(|e| StepError::Unsupported(format!("message pattern: {e}")))?;

        info!(message, "waiting for log message");
        let (tx, rx) = mpsc::sync_channel(1);
        let handle = watcher.add_listener(pattern, move |_| {
            let _ = tx.try_send(());
        });
        let got = rx.recv_timeout(timeout).is_ok();
        let _ = watcher.remove_listener(&handle);

        if got {
            Ok(())
        } else {
            Err(StepError::WaitForMessageTimeout {
                message: message.to_string(),
                timeout,
            })
        }
    }

    fn count(&mut self, error: &StepError) {
        match error {
            StepError::Shell(_) => self.stats.error_count_adb_request += 1,
            StepError::AppScreenTimeout => self.stats.error_count_wait_for_app_screen += 1,
            StepError::CheckInstallTimeout { .. } => self.stats.error_count_check_install += 1,
            StepError::WaitForMessageTimeout { .. } => self.stats.error_count_wait_for_message += 1,
            StepError::Unsupported(_) => {}
        }
    }
}
