//! In-memory collaborators shared by unit tests.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::errors::{SimulatorError, TransportError};
use crate::logcat::stream::{Lines, LogStream, StreamGate};
use crate::shell::{Response, ShellChannel, ShellCommand};
use crate::simulator::{Action, Observation, Simulator};

// ── Shell ──

#[derive(Default)]
struct ShellState {
    activity: Option<String>,
    activity_queries: usize,
    dumpsys: Option<Response>,
    dumpsys_calls: Vec<(String, Vec<String>)>,
    executed: Vec<ShellCommand>,
    scripted: VecDeque<Response>,
    fail_executes: bool,
    packages: BTreeSet<String>,
    package_queries: usize,
    install_after: Option<(usize, String)>,
    fail_package_queries: bool,
}

/// Scriptable shell channel that records every call.
#[derive(Default)]
pub struct FakeShell {
    state: Mutex<ShellState>,
}

impl FakeShell {
    pub fn set_activity(&self, activity: Option<&str>) {
        self.state.lock().unwrap().activity = activity.map(str::to_string);
    }

    pub fn activity_queries(&self) -> usize {
        self.state.lock().unwrap().activity_queries
    }

    pub fn set_dumpsys(&self, response: Response) {
        self.state.lock().unwrap().dumpsys = Some(response);
    }

    pub fn dumpsys_calls(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().dumpsys_calls.clone()
    }

    /// Queue a response for the next `execute` call.
    pub fn push_response(&self, response: Response) {
        self.state.lock().unwrap().scripted.push_back(response);
    }

    /// Make every unscripted `execute` call fail.
    pub fn fail_executes(&self, fail: bool) {
        self.state.lock().unwrap().fail_executes = fail;
    }

    pub fn executed(&self) -> Vec<ShellCommand> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn set_packages(&self, packages: &[&str]) {
        self.state.lock().unwrap().packages = packages.iter().map(|p| p.to_string()).collect();
    }

    /// `package` shows up starting with query number `queries + 1`.
    pub fn install_after(&self, queries: usize, package: &str) {
        self.state.lock().unwrap().install_after = Some((queries, package.to_string()));
    }

    pub fn fail_package_queries(&self, fail: bool) {
        self.state.lock().unwrap().fail_package_queries = fail;
    }

    pub fn package_queries(&self) -> usize {
        self.state.lock().unwrap().package_queries
    }
}

impl ShellChannel for FakeShell {
    fn execute(&self, command: &ShellCommand) -> Response {
        let mut s = self.state.lock().unwrap();
        s.executed.push(command.clone());
        if let Some(r) = s.scripted.pop_front() {
            return r;
        }
        if s.fail_executes {
            Response::error(format!("`{command}` failed"))
        } else {
            Response::ok(Vec::new())
        }
    }

    fn current_activity(&self) -> Option<String> {
        let mut s = self.state.lock().unwrap();
        s.activity_queries += 1;
        s.activity.clone()
    }

    fn dumpsys(&self, service: &str, args: &[String]) -> Response {
        let mut s = self.state.lock().unwrap();
        s.dumpsys_calls.push((service.to_string(), args.to_vec()));
        s.dumpsys.clone().unwrap_or_else(|| Response::ok(Vec::new()))
    }

    fn installed_packages(&self) -> Result<BTreeSet<String>, TransportError> {
        let mut s = self.state.lock().unwrap();
        s.package_queries += 1;
        if s.fail_package_queries {
            return Err(TransportError::Disconnected("pm unavailable".into()));
        }
        let mut packages = s.packages.clone();
        if let Some((after, pkg)) = &s.install_after {
            if s.package_queries > *after {
                packages.insert(pkg.clone());
            }
        }
        Ok(packages)
    }
}

// ── Log stream ──

/// Log stream fed from an mpsc channel.
pub struct ChannelLogStream {
    rx: Mutex<Option<Receiver<String>>>,
    gate: StreamGate,
    stopped: Arc<AtomicBool>,
}

impl ChannelLogStream {
    pub fn new() -> (Sender<String>, Self) {
        let (tx, rx) = mpsc::channel();
        (
            tx,
            Self {
                rx: Mutex::new(Some(rx)),
                gate: StreamGate::default(),
                stopped: Arc::new(AtomicBool::new(false)),
            },
        )
    }
}

impl LogStream for ChannelLogStream {
    fn lines(&self) -> Result<Lines, TransportError> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::Disconnected("stream already consumed".into()))?;
        let stopped = Arc::clone(&self.stopped);
        let iter = std::iter::from_fn(move || {
            loop {
                if stopped.load(Ordering::SeqCst) {
                    return None;
                }
                match rx.recv_timeout(Duration::from_millis(10)) {
                    Ok(line) => return Some(line),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return None,
                }
            }
        });
        Ok(self.gate.wrap(iter))
    }

    fn pause(&self) {
        self.gate.close();
    }

    fn resume(&self) {
        self.gate.open();
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// ── Simulator ──

#[derive(Default)]
pub struct SimState {
    pub launches: u32,
    pub restarts: u32,
    pub closes: u32,
    pub launched: bool,
    /// Remaining launch calls that fail.
    pub launch_failures: u32,
    /// Remaining restart calls that fail.
    pub restart_failures: u32,
    pub fail_send_action: bool,
    pub fail_observation: bool,
    pub fail_close: bool,
    pub actions: Vec<Action>,
    pub observations: u32,
    pub log_streams: u32,
}

/// Simulator whose state is shared with the test through clones.
#[derive(Clone)]
pub struct FakeSimulator {
    pub state: Arc<Mutex<SimState>>,
    pub shell: Arc<FakeShell>,
    log_tx: Arc<Mutex<Option<Sender<String>>>>,
}

impl Default for FakeSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSimulator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            shell: Arc::new(FakeShell::default()),
            log_tx: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Push a logcat record with `message` into the latest log stream.
    pub fn log(&self, message: &str) {
        if let Some(tx) = self.log_tx.lock().unwrap().as_ref() {
            let _ = tx.send(format!("  1700000000.000  100  101 I AndroidRLTask: {message}"));
        }
    }
}

impl Simulator for FakeSimulator {
    fn launch(&mut self) -> Result<(), SimulatorError> {
        let mut s = self.state.lock().unwrap();
        s.launches += 1;
        if s.launch_failures > 0 {
            s.launch_failures -= 1;
            return Err(SimulatorError::Launch("emulator did not boot".into()));
        }
        s.launched = true;
        Ok(())
    }

    fn restart(&mut self) -> Result<(), SimulatorError> {
        let mut s = self.state.lock().unwrap();
        s.restarts += 1;
        if s.restart_failures > 0 {
            s.restart_failures -= 1;
            return Err(SimulatorError::Crash("emulator crashed during restart".into()));
        }
        s.launched = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SimulatorError> {
        let mut s = self.state.lock().unwrap();
        s.closes += 1;
        s.launched = false;
        if s.fail_close {
            return Err(SimulatorError::Crash("close failed".into()));
        }
        Ok(())
    }

    fn is_launched(&self) -> bool {
        self.state.lock().unwrap().launched
    }

    fn send_action(&mut self, action: &Action) -> Result<(), TransportError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_send_action {
            return Err(TransportError::Disconnected("input channel closed".into()));
        }
        s.actions.push(action.clone());
        Ok(())
    }

    fn get_observation(&mut self) -> Result<Observation, SimulatorError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_observation {
            return Err(SimulatorError::Transport(TransportError::Disconnected(
                "screencap failed".into(),
            )));
        }
        s.observations += 1;
        Ok(Observation {
            data: vec![0x89, b'P', b'N', b'G'],
            captured_at: Instant::now(),
        })
    }

    fn create_shell_channel(&mut self) -> Result<Arc<dyn ShellChannel>, SimulatorError> {
        Ok(self.shell.clone())
    }

    fn create_log_stream(&mut self, _filters: &[String]) -> Result<Arc<dyn LogStream>, SimulatorError> {
        let (tx, stream) = ChannelLogStream::new();
        *self.log_tx.lock().unwrap() = Some(tx);
        self.state.lock().unwrap().log_streams += 1;
        Ok(Arc::new(stream))
    }
}
