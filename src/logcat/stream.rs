//! Device log sources.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::AdbSettings;
use crate::errors::TransportError;
use crate::shell::adb::{adb_prefix, run_command};

/// Blocking iterator of raw log lines.
pub type Lines = Box<dyn Iterator<Item = String> + Send>;

const CLEAR_BUFFERS_TIMEOUT: Duration = Duration::from_secs(100);

/// A continuous text stream coming off the device.
pub trait LogStream: Send + Sync {
    /// Start streaming. The iterator ends once the stream is stopped.
    fn lines(&self) -> Result<Lines, TransportError>;
    /// Drop lines until [`resume`](LogStream::resume).
    fn pause(&self);
    fn resume(&self);
    /// Close the upstream source so a blocked reader wakes up.
    fn stop(&self);
}

/// Pause switch shared between a stream and the iterator it hands out.
#[derive(Debug, Clone)]
pub struct StreamGate(Arc<AtomicBool>);

impl Default for StreamGate {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

impl StreamGate {
    pub fn open(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Wrap `lines` so that lines arriving while the gate is closed are dropped.
    pub fn wrap<I>(&self, lines: I) -> Lines
    where
        I: Iterator<Item = String> + Send + 'static,
    {
        let gate = self.clone();
        Box::new(lines.filter(move |_| gate.is_open()))
    }
}

/// `adb logcat -v epoch <filters> *:S`, after clearing every log buffer.
///
/// Stopping is final: a later [`lines`](LogStream::lines) call yields nothing.
pub struct AdbLogStream {
    prefix: Vec<String>,
    filters: Vec<String>,
    gate: StreamGate,
    child: Mutex<Option<Child>>,
    /// Written under the `child` lock so a spawn racing `stop` is never missed.
    stopped: AtomicBool,
}

impl AdbLogStream {
    pub fn new(settings: &AdbSettings, filters: &[String]) -> Self {
        let mut filters = filters.to_vec();
        filters.push("*:S".to_string());
        Self {
            prefix: adb_prefix(settings),
            filters,
            gate: StreamGate::default(),
            child: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    fn command_args(&self) -> Vec<String> {
        let mut args = vec!["logcat".to_string(), "-v".to_string(), "epoch".to_string()];
        args.extend(self.filters.iter().cloned());
        args
    }
}

impl LogStream for AdbLogStream {
    fn lines(&self) -> Result<Lines, TransportError> {
        if self.stopped.load(Ordering::SeqCst) {
            debug!("logcat stream already stopped");
            return Ok(Box::new(std::iter::empty::<String>()));
        }
        let clear = ["logcat", "-b", "all", "-c"].map(String::from);
        let out = run_command(&self.prefix, &clear, CLEAR_BUFFERS_TIMEOUT)?;
        debug!(success = out.success, "cleared logcat buffers");

        let args = self.command_args();
        let (program, base) = self
            .prefix
            .split_first()
            .ok_or_else(|| TransportError::Disconnected("empty adb command line".to_string()))?;
        let mut child = Command::new(program)
            .args(base)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Disconnected("logcat stdout unavailable".to_string()))?;

        let mut slot = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if self.stopped.load(Ordering::SeqCst) {
            info!("logcat stream stopped while starting; killing the new process");
            let _ = child.kill();
            let _ = child.wait();
            return Ok(Box::new(std::iter::empty::<String>()));
        }
        if let Some(mut old) = slot.replace(child) {
            let _ = old.kill();
            let _ = old.wait();
        }
        drop(slot);
        info!(args = %args.join(" "), "logcat stream started");

        let lines = BufReader::new(stdout).lines().map_while(Result::ok);
        Ok(self.gate.wrap(lines))
    }

    fn pause(&self) {
        info!("pausing logcat stream");
        self.gate.close();
    }

    fn resume(&self) {
        info!("resuming logcat stream");
        self.gate.open();
    }

    fn stop(&self) {
        let mut slot = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        self.stopped.store(true, Ordering::SeqCst);
        match slot.take() {
            Some(mut child) => {
                if let Err(e) = child.kill() {
                    warn!(error = %e, "failed to kill logcat process");
                }
                let _ = child.wait();
            }
            None => debug!("logcat stream stopped before a process was running"),
        }
    }
}
