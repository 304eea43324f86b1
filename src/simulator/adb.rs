//! A physical device or running emulator reached through `adb`.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{Action, ActionType, Observation, Simulator};
use crate::config::AdbSettings;
use crate::errors::{SimulatorError, TransportError};
use crate::logcat::{AdbLogStream, LogStream};
use crate::shell::ShellChannel;
use crate::shell::adb::AdbShell;

const BOOT_TIMEOUT: Duration = Duration::from_secs(300);
const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const INPUT_TIMEOUT: Duration = Duration::from_secs(10);
const SCREENCAP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AdbDevice {
    settings: AdbSettings,
    shell: Arc<AdbShell>,
    launched: bool,
    boot_timeout: Duration,
}

impl AdbDevice {
    pub fn new(settings: &AdbSettings) -> Self {
        Self {
            settings: settings.clone(),
            shell: Arc::new(AdbShell::new(settings)),
            launched: false,
            boot_timeout: BOOT_TIMEOUT,
        }
    }

    pub fn with_boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = timeout;
        self
    }

    fn wait_for_boot(&self) -> Result<(), SimulatorError> {
        self.shell
            .adb(["wait-for-device"], Some(self.boot_timeout))
            .map_err(|e| SimulatorError::Launch(format!("device never came online: {e}")))?;

        let start = Instant::now();
        loop {
            match self.shell.adb(boot_completed_args(), None) {
                Ok(out) if out.success && is_boot_completed(&out.stdout) => {
                    info!(waited_ms = start.elapsed().as_millis() as u64, "device booted");
                    return Ok(());
                }
                Ok(_) => debug!("device still booting"),
                Err(e) => debug!(error = %e, "boot property query failed"),
            }
            if start.elapsed() >= self.boot_timeout {
                return Err(SimulatorError::Launch(format!(
                    "boot did not complete within {:?}",
                    self.boot_timeout
                )));
            }
            thread::sleep(BOOT_POLL_INTERVAL);
        }
    }
}

impl Simulator for AdbDevice {
    fn launch(&mut self) -> Result<(), SimulatorError> {
        info!(serial = %self.settings.serial, "connecting to device");
        self.wait_for_boot()?;
        self.launched = true;
        Ok(())
    }

    fn restart(&mut self) -> Result<(), SimulatorError> {
        warn!(serial = %self.settings.serial, "rebooting device");
        self.launched = false;
        let out = self.shell.adb(["reboot"], Some(INPUT_TIMEOUT))?;
        if !out.success {
            return Err(SimulatorError::Crash(format!(
                "reboot refused: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        self.launch()
    }

    fn close(&mut self) -> Result<(), SimulatorError> {
        // the device outlives us; nothing to tear down beyond forgetting it
        self.launched = false;
        Ok(())
    }

    fn is_launched(&self) -> bool {
        self.launched
    }

    fn send_action(&mut self, action: &Action) -> Result<(), TransportError> {
        let Some(args) = input_args(action) else {
            debug!(action = %action, "action has no input command");
            return Ok(());
        };
        let out = self.shell.adb(args.clone(), Some(INPUT_TIMEOUT))?;
        if out.success {
            Ok(())
        } else {
            Err(TransportError::CommandFailed {
                command: args.join(" "),
                detail: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            })
        }
    }

    fn get_observation(&mut self) -> Result<Observation, SimulatorError> {
        let out = self
            .shell
            .adb(["exec-out", "screencap", "-p"], Some(SCREENCAP_TIMEOUT))?;
        if !out.success || out.stdout.is_empty() {
            return Err(SimulatorError::Transport(TransportError::CommandFailed {
                command: "screencap -p".to_string(),
                detail: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            }));
        }
        Ok(Observation {
            data: out.stdout,
            captured_at: Instant::now(),
        })
    }

    fn create_shell_channel(&mut self) -> Result<Arc<dyn ShellChannel>, SimulatorError> {
        self.shell = Arc::new(AdbShell::new(&self.settings));
        Ok(self.shell.clone())
    }

    fn create_log_stream(&mut self, filters: &[String]) -> Result<Arc<dyn LogStream>, SimulatorError> {
        Ok(Arc::new(AdbLogStream::new(&self.settings, filters)))
    }
}

fn boot_completed_args() -> Vec<String> {
    ["shell", "getprop", "sys.boot_completed"].map(String::from).to_vec()
}

fn is_boot_completed(stdout: &[u8]) -> bool {
    String::from_utf8_lossy(stdout).trim() == "1"
}

/// `adb` arguments that deliver `action`, or `None` when nothing is sent.
fn input_args(action: &Action) -> Option<Vec<String>> {
    match action.action_type {
        ActionType::Touch => Some(vec![
            "shell".into(),
            "input".into(),
            "tap".into(),
            action.x.to_string(),
            action.y.to_string(),
        ]),
        ActionType::KeyPress => action.keycode.map(|code| {
            vec![
                "shell".into(),
                "input".into(),
                "keyevent".into(),
                code.to_string(),
            ]
        }),
        ActionType::Lift | ActionType::Repeat => None,
    }
}
