//! Throttled, off-thread screen checking.
//!
//! The dumpsys round trip behind [`ScreenCheck::evaluate`] is too slow for the
//! per-step path. [`ScreenPoller`] runs it on a short-lived thread every Nth
//! call and hands the outcome back over a single-slot channel. The failure
//! counter lives here, on the caller's thread; the spawned evaluation only
//! returns its raw outcome, so an abandoned evaluation can never touch it.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::PollerSettings;
use crate::screen::{CheckOutcome, ScreenCheck};

struct InFlight {
    rx: Receiver<CheckOutcome>,
    started: Instant,
}

pub struct ScreenPoller {
    checker: Arc<dyn ScreenCheck>,
    check_frequency: u32,
    max_failed_current_activity: u32,
    call_counter: u32,
    failed_extractions: u32,
    in_flight: Option<InFlight>,
    paused: bool,
    evaluations_started: u64,
}

impl ScreenPoller {
    pub fn new(checker: Arc<dyn ScreenCheck>, settings: &PollerSettings) -> Self {
        Self {
            checker,
            check_frequency: settings.check_frequency,
            max_failed_current_activity: settings.max_failed_current_activity,
            call_counter: 0,
            failed_extractions: 0,
            in_flight: None,
            paused: false,
            evaluations_started: 0,
        }
    }

    /// Whether the user left the expected screen.
    ///
    /// Only every `check_frequency`th call does any work. The first triggering
    /// call starts an evaluation and returns `false`; a later triggering call
    /// collects it, waiting at most `timeout` when one is given. A wait that
    /// times out abandons the evaluation.
    pub fn check_user_exited(&mut self, timeout: Option<Duration>) -> bool {
        if self.paused || self.check_frequency == 0 {
            return false;
        }

        self.call_counter += 1;
        if self.call_counter < self.check_frequency {
            return false;
        }
        self.call_counter = 0;

        let Some(in_flight) = self.in_flight.as_ref() else {
            self.spawn_evaluation();
            return false;
        };

        let received = match in_flight.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Disconnected) => {
                error!("screen check thread exited without an outcome");
                None
            }
            Err(TryRecvError::Empty) => match timeout {
                None => return false,
                Some(timeout) => match in_flight.rx.recv_timeout(timeout) {
                    Ok(outcome) => Some(outcome),
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(
                            running_ms = in_flight.started.elapsed().as_millis() as u64,
                            "screen check timed out; abandoning it"
                        );
                        None
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        error!("screen check thread exited without an outcome");
                        None
                    }
                },
            },
        };

        self.in_flight = None;
        received.is_some_and(|outcome| self.merge(outcome))
    }

    fn spawn_evaluation(&mut self) {
        let (tx, rx) = mpsc::sync_channel(1);
        let checker = Arc::clone(&self.checker);
        let spawned = thread::Builder::new()
            .name("screen-check".to_string())
            .spawn(move || {
                let _ = tx.send(checker.evaluate());
            });
        match spawned {
            Ok(_) => {
                self.evaluations_started += 1;
                self.in_flight = Some(InFlight {
                    rx,
                    started: Instant::now(),
                });
                debug!(n = self.evaluations_started, "screen check started");
            }
            Err(e) => warn!(error = %e, "failed to spawn screen check"),
        }
    }

    /// Map an outcome to an exit verdict, tracking consecutive extraction failures.
    fn merge(&mut self, outcome: CheckOutcome) -> bool {
        if outcome == CheckOutcome::FailedActivityExtraction {
            self.failed_extractions += 1;
            info!(
                failures = self.failed_extractions,
                max = self.max_failed_current_activity,
                "failed to extract current activity"
            );
            if self.failed_extractions >= self.max_failed_current_activity {
                error!("maximum number of failed activity extractions reached");
                self.failed_extractions = 0;
                return true;
            }
            return false;
        }
        self.failed_extractions = 0;
        if outcome.is_divergence() {
            warn!(outcome = %outcome, "user left the expected screen");
        }
        outcome.is_divergence()
    }

    /// Stop checking and drop any in-flight evaluation.
    pub fn pause(&mut self) {
        self.paused = true;
        self.in_flight = None;
    }

    /// Resume checking with fresh counters.
    pub fn resume(&mut self) {
        self.paused = false;
        self.call_counter = 0;
        self.failed_extractions = 0;
        self.in_flight = None;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn evaluations_started(&self) -> u64 {
        self.evaluations_started
    }
}
