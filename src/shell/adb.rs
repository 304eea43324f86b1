//! `adb`-backed shell channel.
//!
//! Each call spawns `adb [-P port] [-s serial] <args..>` and waits for it with
//! a deadline. Calls are serialized through a mutex because the device-side
//! shell tolerates only one pending command per session.

use std::collections::BTreeSet;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::{LazyLock, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, warn};

use super::{Response, ShellChannel, ShellCommand};
use crate::config::AdbSettings;
use crate::errors::TransportError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

static VISIBLE_ACTIVITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r".*\{(.*)\}").expect("valid visible activity regex"));

/// Captured output of one finished `adb` invocation.
#[derive(Debug)]
pub struct AdbOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Shell channel that talks to one device through the `adb` binary.
pub struct AdbShell {
    prefix: Vec<String>,
    default_timeout: Duration,
    lock: Mutex<()>,
}

impl AdbShell {
    pub fn new(settings: &AdbSettings) -> Self {
        Self {
            prefix: adb_prefix(settings),
            default_timeout: settings.default_timeout(),
            lock: Mutex::new(()),
        }
    }

    /// Run `adb <args..>` (not `adb shell`), serialized with every other call.
    pub fn adb<I, S>(&self, args: I, timeout: Option<Duration>) -> Result<AdbOutput, TransportError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let timeout = timeout.unwrap_or(self.default_timeout);
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        run_command(&self.prefix, &args, timeout)
    }

    fn shell(&self, args: &[String], timeout: Option<Duration>) -> Result<Vec<u8>, TransportError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push("shell".to_string());
        full.extend(args.iter().cloned());
        let output = self.adb(full, timeout)?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(TransportError::CommandFailed {
                command: args.join(" "),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl ShellChannel for AdbShell {
    fn execute(&self, command: &ShellCommand) -> Response {
        debug!(command = %command, "adb shell");
        let result = self.shell(&command.args, command.timeout);
        if let Err(ref e) = result {
            warn!(command = %command, error = %e, "adb shell command failed");
        }
        result.into()
    }

    fn current_activity(&self) -> Option<String> {
        let args = vec![
            "am stack list | grep -E visible=true".to_string(),
        ];
        match self.shell(&args, None) {
            Ok(out) => parse_visible_activity(&String::from_utf8_lossy(&out)),
            Err(e) => {
                debug!(error = %e, "failed to query current activity");
                None
            }
        }
    }

    fn dumpsys(&self, service: &str, args: &[String]) -> Response {
        let mut full = vec!["dumpsys".to_string(), service.to_string()];
        full.extend(args.iter().cloned());
        self.shell(&full, None).into()
    }

    fn installed_packages(&self) -> Result<BTreeSet<String>, TransportError> {
        let args = ["pm", "list", "packages"].map(String::from);
        let out = self.shell(&args, None)?;
        Ok(parse_package_list(&String::from_utf8_lossy(&out)))
    }
}

/// Leading `adb` arguments selecting the server and device.
pub(crate) fn adb_prefix(settings: &AdbSettings) -> Vec<String> {
    let mut prefix = vec![
        settings.path.clone(),
        "-P".to_string(),
        settings.server_port.to_string(),
    ];
    if !settings.serial.is_empty() {
        prefix.push("-s".to_string());
        prefix.push(settings.serial.clone());
    }
    prefix
}

/// Spawn `prefix[0] prefix[1..] args..` and wait at most `timeout` for it.
///
/// The child is killed on timeout. Output pipes are drained on helper
/// threads so a chatty command cannot block on a full pipe.
pub(crate) fn run_command(
    prefix: &[String],
    args: &[String],
    timeout: Duration,
) -> Result<AdbOutput, TransportError> {
    let (program, base) = prefix
        .split_first()
        .ok_or_else(|| TransportError::Disconnected("empty adb command line".to_string()))?;
    let command_line = args.join(" ");

    let mut child = Command::new(program)
        .args(base)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = drain(&mut child, true);
    let stderr = drain(&mut child, false);

    let start = Instant::now();
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None if start.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TransportError::Timeout {
                    command: command_line,
                    timeout,
                });
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    Ok(AdbOutput {
        success: status.success(),
        stdout: join_drain(stdout),
        stderr: join_drain(stderr),
    })
}

fn drain(child: &mut Child, stdout: bool) -> Option<thread::JoinHandle<Vec<u8>>> {
    let mut reader: Box<dyn Read + Send> = if stdout {
        Box::new(child.stdout.take()?)
    } else {
        Box::new(child.stderr.take()?)
    };
    Some(thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    }))
}

fn join_drain(handle: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Extract `package/activity` from `am stack list` output filtered to the
/// visible task. Returns `None` when nothing is visible.
pub fn parse_visible_activity(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let caps = VISIBLE_ACTIVITY_RE.captures(line)?;
    let activity = caps.get(1)?.as_str().trim();
    if activity.is_empty() {
        None
    } else {
        Some(activity.to_string())
    }
}

/// Parse `pm list packages` output (`package:<name>` per line).
pub fn parse_package_list(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|l| l.trim().strip_prefix("package:"))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}
