//! Supervision core for a flaky Android device.
//!
//! The pieces, bottom up: a serialized [`shell`] channel and [`logcat`]
//! stream to the device, the [`screen`] checker built on a dumpsys tree
//! parser, the throttled [`poller`] around it, the retrying setup step
//! [`interpreter`], and the [`controller`] that sequences all of them.

pub mod config;
pub mod controller;
pub mod errors;
pub mod interpreter;
pub mod log;
pub mod logcat;
pub mod paths;
pub mod poller;
pub mod screen;
pub mod shell;
pub mod signals;
pub mod simulator;
pub mod task;

#[cfg(test)]
mod testing;
