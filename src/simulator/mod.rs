//! The device under control, as seen by the controller.

pub mod adb;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::errors::{SimulatorError, TransportError};
use crate::logcat::LogStream;
use crate::shell::ShellChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Touch,
    Lift,
    /// Keep doing whatever the previous action did. Never sent to the device.
    Repeat,
    KeyPress,
}

/// One input event for the device. Positions are screen pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub action_type: ActionType,
    #[serde(default)]
    pub x: u32,
    #[serde(default)]
    pub y: u32,
    #[serde(default)]
    pub finger: u32,
    #[serde(default)]
    pub keycode: Option<u32>,
}

impl Action {
    pub fn touch(x: u32, y: u32) -> Self {
        Self {
            action_type: ActionType::Touch,
            x,
            y,
            finger: 0,
            keycode: None,
        }
    }

    pub fn lift(finger: u32) -> Self {
        Self {
            action_type: ActionType::Lift,
            x: 0,
            y: 0,
            finger,
            keycode: None,
        }
    }

    pub fn repeat() -> Self {
        Self {
            action_type: ActionType::Repeat,
            x: 0,
            y: 0,
            finger: 0,
            keycode: None,
        }
    }

    pub fn key(keycode: u32) -> Self {
        Self {
            action_type: ActionType::KeyPress,
            x: 0,
            y: 0,
            finger: 0,
            keycode: Some(keycode),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action_type {
            ActionType::Touch => write!(f, "touch({}, {}) finger {}", self.x, self.y, self.finger),
            ActionType::Lift => write!(f, "lift finger {}", self.finger),
            ActionType::Repeat => f.write_str("repeat"),
            ActionType::KeyPress => write!(f, "key {}", self.keycode.unwrap_or_default()),
        }
    }
}

/// Raw screen capture. Decoding is left to the caller.
#[derive(Debug, Clone)]
pub struct Observation {
    pub data: Vec<u8>,
    pub captured_at: Instant,
}

/// Lifecycle and I/O of the controlled device.
pub trait Simulator: Send {
    fn launch(&mut self) -> Result<(), SimulatorError>;
    fn restart(&mut self) -> Result<(), SimulatorError>;
    fn close(&mut self) -> Result<(), SimulatorError>;
    fn is_launched(&self) -> bool;
    fn send_action(&mut self, action: &Action) -> Result<(), TransportError>;
    fn get_observation(&mut self) -> Result<Observation, SimulatorError>;
    fn create_shell_channel(&mut self) -> Result<Arc<dyn ShellChannel>, SimulatorError>;
    /// A fresh device log stream restricted to `filters` (`tag:priority`).
    fn create_log_stream(&mut self, filters: &[String]) -> Result<Arc<dyn LogStream>, SimulatorError>;
}
