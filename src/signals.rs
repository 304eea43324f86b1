//! Task signals parsed out of the device log.
//!
//! Each configured regexp becomes a [`LogWatcher`] listener that folds
//! matches into a shared accumulator. The controller drains it every step.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use regex::{Captures, Regex};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::logcat::{ListenerHandle, LogWatcher};
use crate::task::LogRegexps;

/// Values kept per extra name before the oldest is dropped.
pub const EXTRAS_MAX_BUFFER_SIZE: usize = 100;

/// Extras collected since the last drain, oldest first.
pub type Extras = BTreeMap<String, Vec<Value>>;

#[derive(Debug, Default)]
struct Latest {
    reward: f64,
    score: f64,
    episode_end: bool,
    extras: BTreeMap<String, VecDeque<Value>>,
}

impl Latest {
    fn push_extra(&mut self, name: &str, value: Value) {
        let ring = self.extras.entry(name.to_string()).or_default();
        if ring.len() >= EXTRAS_MAX_BUFFER_SIZE {
            ring.pop_front();
        }
        ring.push_back(value);
    }
}

/// Accumulates reward, score, episode end and extras from log listeners.
pub struct TaskSignals {
    latest: Arc<Mutex<Latest>>,
    handles: Vec<ListenerHandle>,
}

impl TaskSignals {
    /// Register one listener per non-empty regexp on `watcher`.
    pub fn register(watcher: &LogWatcher, regexps: &LogRegexps) -> Result<Self, regex::Error> {
        let latest = Arc::new(Mutex::new(Latest::default()));
        let mut handles = Vec::new();

        for pattern in nonempty(&regexps.reward) {
            let latest = Arc::clone(&latest);
            handles.push(watcher.add_listener(Regex::new(pattern)?, move |caps| {
                if let Some(r) = float_group(caps, 1) {
                    lock(&latest).reward += r;
                }
            }));
        }

        for event in regexps.reward_event.iter().filter(|e| !e.event.is_empty()) {
            let latest = Arc::clone(&latest);
            let reward = event.reward;
            handles.push(watcher.add_listener(Regex::new(&event.event)?, move |_| {
                lock(&latest).reward += reward;
            }));
        }

        if !regexps.score.is_empty() {
            let latest = Arc::clone(&latest);
            handles.push(watcher.add_listener(Regex::new(&regexps.score)?, move |caps| {
                if let Some(score) = float_group(caps, 1) {
                    let mut l = lock(&latest);
                    let delta = score - l.score;
                    l.reward += delta;
                    l.score = score;
                }
            }));
        }

        for pattern in nonempty(&regexps.episode_end) {
            let latest = Arc::clone(&latest);
            handles.push(watcher.add_listener(Regex::new(pattern)?, move |_| {
                debug!("episode end seen in logcat");
                lock(&latest).episode_end = true;
            }));
        }

        for pattern in nonempty(&regexps.extra) {
            let latest = Arc::clone(&latest);
            handles.push(watcher.add_listener(Regex::new(pattern)?, move |caps| {
                let Some(name) = caps.name("name").map(|m| m.as_str()) else {
                    warn!("extra regexp matched without a `name` group");
                    return;
                };
                let value = match caps.name("extra").map(|m| m.as_str()).filter(|s| !s.is_empty()) {
                    None => Value::from(1),
                    Some(raw) => match serde_json::from_str::<Value>(raw) {
                        Ok(v) => v,
                        Err(e) => {
                            error!(extra = name, raw, error = %e, "could not parse extra");
                            return;
                        }
                    },
                };
                lock(&latest).push_extra(name, value);
            }));
        }

        for pattern in nonempty(&regexps.json_extra) {
            let latest = Arc::clone(&latest);
            handles.push(watcher.add_listener(Regex::new(pattern)?, move |caps| {
                let raw = caps.name("json_extra").map_or("", |m| m.as_str());
                match serde_json::from_str::<Value>(raw) {
                    Ok(Value::Object(map)) => {
                        let mut l = lock(&latest);
                        for (name, value) in map {
                            l.push_extra(&name, value);
                        }
                    }
                    Ok(_) | Err(_) => error!(raw, "json extra is not a JSON object"),
                }
            }));
        }

        Ok(Self { latest, handles })
    }

    /// Reward accumulated since the last call.
    pub fn take_reward(&self) -> f64 {
        std::mem::take(&mut lock(&self.latest).reward)
    }

    /// Whether an episode end was logged since the last call.
    pub fn take_episode_end(&self) -> bool {
        std::mem::take(&mut lock(&self.latest).episode_end)
    }

    pub fn take_extras(&self) -> Extras {
        std::mem::take(&mut lock(&self.latest).extras)
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().collect()))
            .collect()
    }

    /// Clear every per-episode value, including the running score.
    pub fn reset(&self) {
        *lock(&self.latest) = Latest::default();
    }

    /// Remove every listener this instance registered.
    pub fn unregister(self, watcher: &LogWatcher) {
        for handle in &self.handles {
            let _ = watcher.remove_listener(handle);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.handles.len()
    }
}

fn lock(latest: &Mutex<Latest>) -> std::sync::MutexGuard<'_, Latest> {
    latest.lock().unwrap_or_else(PoisonError::into_inner)
}

fn nonempty(patterns: &[String]) -> impl Iterator<Item = &String> {
    patterns.iter().filter(|p| !p.is_empty())
}

fn float_group(caps: &Captures<'_>, group: usize) -> Option<f64> {
    let raw = caps.get(group)?.as_str();
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(raw, "log value is not a number");
            None
        }
    }
}
