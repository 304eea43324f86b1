//! Error taxonomy for the supervision core.
//!
//! Errors are layered by how far they are allowed to travel:
//! - [`TransportError`] is raised by shell channels and simulators and is
//!   usually retried by whoever issued the call.
//! - [`StepError`] is one failed attempt of one setup step; the interpreter
//!   counts it and retries.
//! - [`InterpretError`] escapes `interpret()` once a step runs out of attempts.
//! - [`ControllerError`] is terminal: the caller must tear down the controller.

use std::time::Duration;

use thiserror::Error;

/// Failure talking to the device through a shell channel or simulator transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("command `{command}` failed: {detail}")]
    CommandFailed { command: String, detail: String },
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("device connection lost: {0}")]
    Disconnected(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single failed attempt of a setup step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("shell call failed: {0}")]
    Shell(String),
    #[error("app screen did not appear in time")]
    AppScreenTimeout,
    #[error("package `{package}` not installed after {timeout:?}")]
    CheckInstallTimeout { package: String, timeout: Duration },
    #[error("message `{message}` not seen in logcat after {timeout:?}")]
    WaitForMessageTimeout { message: String, timeout: Duration },
    #[error("unsupported {0}")]
    Unsupported(String),
}

impl StepError {
    /// Whether the interpreter should spend another attempt on this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }
}

/// Error returned by `SetupStepInterpreter::interpret`.
#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("setup step {index} defines neither a command nor a success check")]
    EmptyStep { index: usize },
    #[error("setup step {index} failed after {attempts} attempts")]
    StepFailed {
        index: usize,
        attempts: u32,
        #[source]
        source: StepError,
    },
}

/// Failure of a simulator lifecycle operation.
#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("simulator crashed: {0}")]
    Crash(String),
    #[error("simulator launch failed: {0}")]
    Launch(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Listener registry misuse on the log watcher.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("no listener registered for pattern `{pattern}` with id {id}")]
    NotRegistered { pattern: String, id: u64 },
    #[error("failed to spawn log watcher thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Terminal controller failures. Nothing inside the controller recovers from these.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("unable to launch the simulator after {attempts} attempts")]
    InitFailed {
        attempts: u32,
        #[source]
        source: SimulatorError,
    },
    #[error("maximum number of restart attempts ({attempts}) reached")]
    TooManyRestarts {
        attempts: u32,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    #[error("task definition is invalid")]
    InvalidTask(#[source] InterpretError),
    #[error("task pattern does not compile")]
    InvalidPattern(#[from] regex::Error),
    #[error(transparent)]
    Watch(#[from] WatchError),
}
