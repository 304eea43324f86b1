//! Shell channel abstraction.
//!
//! Every check and setup command reaches the device through a [`ShellChannel`].
//! The underlying session is stateful (one prompt, one pending command), so
//! implementations must serialize calls: concurrent callers queue.

pub mod adb;

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::errors::TransportError;

/// Outcome of a shell round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

/// Structured response from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub payload: Vec<u8>,
    pub error_message: String,
}

impl Response {
    pub fn ok(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            status: Status::Ok,
            payload: payload.into(),
            error_message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            payload: Vec::new(),
            error_message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Payload decoded as UTF-8 (lossy; dumpsys output occasionally carries junk bytes).
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl From<Result<Vec<u8>, TransportError>> for Response {
    fn from(result: Result<Vec<u8>, TransportError>) -> Self {
        match result {
            Ok(payload) => Response::ok(payload),
            Err(e) => Response::error(e.to_string()),
        }
    }
}

/// A command to run in the device shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub args: Vec<String>,
    /// Per-command limit; `None` uses the channel default.
    pub timeout: Option<Duration>,
}

impl ShellCommand {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}

/// Command/response link to the controlled device.
pub trait ShellChannel: Send + Sync {
    /// Run a shell command. Transport failures come back as `Status::Error`.
    fn execute(&self, command: &ShellCommand) -> Response;

    /// Fully qualified `package/activity` currently in the foreground.
    fn current_activity(&self) -> Option<String>;

    /// Structured dump of a system service (`dumpsys <service> <args..>`).
    fn dumpsys(&self, service: &str, args: &[String]) -> Response;

    /// Package names currently installed on the device.
    fn installed_packages(&self) -> Result<BTreeSet<String>, TransportError>;
}

/// Shell channel whose backing connection can be replaced after a restart.
///
/// Components built once (checker, interpreter) hold this and keep working
/// when the controller recreates the underlying channel.
pub struct SwappableShell {
    inner: RwLock<Arc<dyn ShellChannel>>,
}

impl SwappableShell {
    pub fn new(inner: Arc<dyn ShellChannel>) -> Self {
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub fn replace(&self, inner: Arc<dyn ShellChannel>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = inner;
    }

    fn current(&self) -> Arc<dyn ShellChannel> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ShellChannel for SwappableShell {
    fn execute(&self, command: &ShellCommand) -> Response {
        self.current().execute(command)
    }

    fn current_activity(&self) -> Option<String> {
        self.current().current_activity()
    }

    fn dumpsys(&self, service: &str, args: &[String]) -> Response {
        self.current().dumpsys(service, args)
    }

    fn installed_packages(&self) -> Result<BTreeSet<String>, TransportError> {
        self.current().installed_packages()
    }
}
