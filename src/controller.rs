//! Top-level supervision loop around one device.
//!
//! [`RemoteController`] owns the simulator and everything that watches it: the
//! log watcher and its task signals, the screen poller, and the setup step
//! interpreter. It sequences launch, setup, reset, restart and close, and
//! turns transport failures into a deferred [`should_restart`] flag that the
//! caller acts on between steps.
//!
//! [`should_restart`]: RemoteController::should_restart

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{ControllerSettings, PollerSettings};
use crate::errors::{ControllerError, InterpretError, SimulatorError};
use crate::interpreter::{InterpreterStats, SetupStepInterpreter};
use crate::log::{ExecutionLog, LogEvent};
use crate::logcat::{LogStream, LogWatcher};
use crate::poller::ScreenPoller;
use crate::screen::AppScreenChecker;
use crate::shell::{ShellChannel, SwappableShell};
use crate::signals::{Extras, TaskSignals};
use crate::simulator::{Action, ActionType, Observation, Simulator};
use crate::task::{SetupStep, Task};

/// Launch attempts before construction gives up.
pub const MAX_SIMULATOR_INIT_TRIES: u32 = 3;
/// Restart attempts before a restart is fatal.
pub const MAX_RESTART_TRIES: u32 = 3;
/// Upper bound on waiting for the log watcher to finish the current line.
const LINE_READY_TIMEOUT: Duration = Duration::from_secs(1);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Runtime knobs, resolved from the `[controller]` and `[poller]` config sections.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Consecutive bad states tolerated before a restart is requested. 0 ignores bad states.
    pub max_bad_states: u32,
    pub step_timeout: Option<Duration>,
    pub max_steps_per_sec: f64,
    /// Restart on reset once the simulator has been up this long.
    pub periodic_restart: Option<Duration>,
    pub force_simulator_launch: bool,
    pub num_fingers: u32,
    pub poller: PollerSettings,
    /// Pause between a setup step's command and its check.
    pub settle_delay: Duration,
}

impl ControllerConfig {
    pub fn from_settings(controller: &ControllerSettings, poller: &PollerSettings) -> Self {
        Self {
            max_bad_states: controller.max_bad_states,
            step_timeout: (controller.step_timeout_secs > 0)
                .then(|| Duration::from_secs(controller.step_timeout_secs)),
            max_steps_per_sec: controller.max_steps_per_sec,
            periodic_restart: (controller.periodic_restart_time_min > 0.0)
                .then(|| {
                    Duration::try_from_secs_f64(controller.periodic_restart_time_min * 60.0).ok()
                })
                .flatten(),
            force_simulator_launch: controller.force_simulator_launch,
            num_fingers: controller.num_fingers,
            poller: poller.clone(),
            settle_delay: Duration::from_millis(500),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from_settings(&ControllerSettings::default(), &PollerSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Launching,
    Ready,
    Stepping,
    Resetting,
    Restarting,
    /// A restart ran out of attempts. Only `close` is meaningful now.
    Failed,
    Closed,
}

/// Counters kept by the controller, merged with the interpreter's on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerStats {
    pub restart_count_fetch_observation: u32,
    pub restart_count_simulator_setup: u32,
    pub restart_count_simulator_reset: u32,
    pub restart_count_simulator_restart: u32,
    pub restart_count_restart_setup_steps: u32,
    pub restart_count_execute_action: u32,
    pub restart_count_max_bad_states: u32,
    /// Uptime-triggered restarts. Not a failure.
    pub restart_count_periodic: u32,
    pub reset_count_user_exited: u32,
    pub reset_count_episode_end: u32,
    pub reset_count_step_timeout: u32,
    /// Episodes truncated by the task's step or time limit.
    pub reset_count_max_duration_reached: u32,
    /// Steps taken since the last reset.
    pub episode_steps: u32,
    #[serde(flatten)]
    pub interpreter: InterpreterStats,
}

/// What one [`RemoteController::step`] produced.
#[derive(Debug)]
pub struct StepOutcome {
    /// `None` when the fetch failed; a restart has been requested.
    pub observation: Option<Observation>,
    pub reward: f64,
    pub extras: Extras,
    /// The task's step or time limit was crossed; the episode should end.
    pub truncated: bool,
}

pub struct RemoteController {
    simulator: Box<dyn Simulator>,
    task: Task,
    config: ControllerConfig,
    shell: Arc<SwappableShell>,
    watcher: Arc<LogWatcher>,
    signals: TaskSignals,
    interpreter: SetupStepInterpreter,
    poller: ScreenPoller,
    stats: ControllerStats,
    state: ControllerState,
    should_restart: bool,
    bad_state_counter: u32,
    is_bad_episode: bool,
    last_observation: Option<Instant>,
    simulator_started: Option<Instant>,
    episode_started: Option<Instant>,
    log: Option<Arc<ExecutionLog>>,
}

impl RemoteController {
    /// Launch the simulator, wire up the watchers and run the task's setup steps.
    ///
    /// A setup failure is handled with a restart; only a restart that runs out
    /// of attempts, a failed launch or a malformed task is returned as an error.
    pub fn new(
        mut simulator: Box<dyn Simulator>,
        task: Task,
        config: ControllerConfig,
        log: Option<Arc<ExecutionLog>>,
    ) -> Result<Self, ControllerError> {
        let launched = launch_simulator(simulator.as_mut(), &task, config.force_simulator_launch)?;

        let shell = Arc::new(SwappableShell::new(launched.channel));
        let watcher = Arc::new(LogWatcher::start(launched.stream)?);
        let checker = AppScreenChecker::new(shell.clone(), &task.expected_app_screen)?;
        let signals = TaskSignals::register(&watcher, &task.log_parsing.regexps)?;
        let interpreter = SetupStepInterpreter::new(shell.clone(), Some(Arc::clone(&watcher)))
            .with_settle_delay(config.settle_delay);
        let poller = ScreenPoller::new(Arc::new(checker), &config.poller);

        let mut controller = Self {
            simulator,
            task,
            config,
            shell,
            watcher,
            signals,
            interpreter,
            poller,
            stats: ControllerStats::default(),
            state: ControllerState::Launching,
            should_restart: false,
            bad_state_counter: 0,
            is_bad_episode: false,
            last_observation: None,
            simulator_started: launched.started,
            episode_started: None,
            log,
        };
        controller.record(LogEvent::SimulatorLaunched {
            attempt: launched.attempt,
        });
        controller.setup()?;
        Ok(controller)
    }

    fn setup(&mut self) -> Result<(), ControllerError> {
        match self.interpreter.interpret(&self.task.setup_steps) {
            Ok(()) => {
                self.record(LogEvent::SetupCompleted {
                    steps: self.task.setup_steps.len(),
                });
                self.state = ControllerState::Ready;
                Ok(())
            }
            Err(e @ InterpretError::EmptyStep { .. }) => self.fail(ControllerError::InvalidTask(e)),
            Err(e) => {
                error!(error = %e, "setup steps failed; restarting simulator");
                self.stats.restart_count_simulator_setup += 1;
                self.restart()
            }
        }
    }

    /// Restart the simulator and re-run setup, up to [`MAX_RESTART_TRIES`] times.
    pub fn restart(&mut self) -> Result<(), ControllerError> {
        info!("restarting the remote controller");
        self.state = ControllerState::Restarting;
        self.should_restart = false;
        self.bad_state_counter = 0;
        self.record(LogEvent::RestartStarted {
            reason: "requested".to_string(),
        });

        self.poller.pause();
        self.watcher.pause();

        let mut last_error: Option<BoxError> = None;
        for attempt in 1..=MAX_RESTART_TRIES {
            info!(attempt, max = MAX_RESTART_TRIES, "restart attempt");

            if let Err(e) = self.restart_simulator() {
                error!(attempt, error = %e, "error restarting the simulator");
                self.stats.restart_count_simulator_restart += 1;
                self.record(LogEvent::RestartAttempt {
                    attempt,
                    error: Some(e.to_string()),
                });
                last_error = Some(e);
                continue;
            }

            match self.interpreter.interpret(&self.task.setup_steps) {
                Ok(()) => {
                    self.record(LogEvent::RestartAttempt { attempt, error: None });
                    self.watcher.resume();
                    self.poller.resume();
                    self.signals.reset();
                    self.last_observation = None;
                    self.state = ControllerState::Ready;
                    self.record(LogEvent::RestartCompleted { attempts: attempt });
                    info!(attempt, "done restarting the remote controller");
                    return Ok(());
                }
                Err(e @ InterpretError::EmptyStep { .. }) => {
                    return self.fail(ControllerError::InvalidTask(e));
                }
                Err(e) => {
                    error!(attempt, error = %e, "setup steps failed after restart");
                    self.stats.restart_count_restart_setup_steps += 1;
                    self.record(LogEvent::RestartAttempt {
                        attempt,
                        error: Some(e.to_string()),
                    });
                    last_error = Some(Box::new(e));
                }
            }
        }

        error!(attempts = MAX_RESTART_TRIES, "maximum number of restarts reached");
        self.record(LogEvent::RestartFailed {
            attempts: MAX_RESTART_TRIES,
            reason: last_error
                .as_ref()
                .map_or_else(String::new, |e| e.to_string()),
        });
        self.fail(ControllerError::TooManyRestarts {
            attempts: MAX_RESTART_TRIES,
            source: last_error,
        })
    }

    fn restart_simulator(&mut self) -> Result<(), BoxError> {
        self.simulator.restart()?;
        self.simulator_started = Some(Instant::now());
        self.shell.replace(self.simulator.create_shell_channel()?);
        let stream = self
            .simulator
            .create_log_stream(&self.task.log_parsing.filters)?;
        self.watcher.attach(stream)?;
        Ok(())
    }

    /// Start a new episode.
    ///
    /// A failing reset step does not raise: it sets [`should_restart`](Self::should_restart)
    /// and leaves the screen poller paused until the restart.
    pub fn reset(&mut self) -> Result<(), ControllerError> {
        if let (Some(limit), Some(started)) = (self.config.periodic_restart, self.simulator_started) {
            let uptime = started.elapsed();
            debug!(uptime_min = uptime.as_secs_f64() / 60.0, "simulator uptime");
            if uptime > limit {
                info!("maximum simulator uptime reached; triggering a restart");
                self.stats.restart_count_periodic += 1;
                self.restart()?;
            }
        }

        info!("resetting the remote controller");
        self.state = ControllerState::Resetting;
        for finger in 0..self.config.num_fingers {
            self.execute_action(Some(&Action::lift(finger)));
        }

        self.last_observation = None;
        self.episode_started = Some(Instant::now());
        self.stats.episode_steps = 0;
        if !self.is_bad_episode {
            self.bad_state_counter = 0;
        }
        self.is_bad_episode = false;

        self.poller.pause();
        match self.interpreter.interpret(&self.task.reset_steps) {
            Ok(()) => {}
            Err(e @ InterpretError::EmptyStep { .. }) => {
                return self.fail(ControllerError::InvalidTask(e));
            }
            Err(e) => {
                error!(error = %e, "reset steps failed; restart requested");
                self.stats.restart_count_simulator_reset += 1;
                self.should_restart = true;
                self.state = ControllerState::Ready;
                // Poller stays paused and signals keep their values until the
                // restart, which resumes the one and resets the other.
                return Ok(());
            }
        }

        self.signals.reset();
        self.poller.resume();
        self.state = ControllerState::Ready;
        self.record(LogEvent::ResetCompleted {
            steps: self.task.reset_steps.len(),
        });
        info!("done resetting the remote controller");
        Ok(())
    }

    /// Send `action` to the simulator. `None` and repeat actions are skipped.
    pub fn execute_action(&mut self, action: Option<&Action>) {
        let Some(action) = action else { return };
        if action.action_type == ActionType::Repeat {
            return;
        }
        if let Err(e) = self.simulator.send_action(action) {
            error!(action = %action, error = %e, "unable to execute action; restart requested");
            self.stats.restart_count_execute_action += 1;
            self.should_restart = true;
        }
    }

    /// Sleep whatever is left of the current frame at `max_steps_per_sec`.
    pub fn wait_for_next_frame(&self) {
        if self.config.max_steps_per_sec <= 0.0 {
            return;
        }
        let Some(since) = self.time_since_last_observation() else {
            return;
        };
        let Ok(frame) = Duration::try_from_secs_f64(1.0 / self.config.max_steps_per_sec) else {
            return;
        };
        if let Some(remaining) = frame.checked_sub(since) {
            thread::sleep(remaining);
        }
    }

    /// Grab a screen capture. A failure requests a restart and yields `None`.
    pub fn fetch_observation(&mut self) -> Option<Observation> {
        self.last_observation = Some(Instant::now());
        match self.simulator.get_observation() {
            Ok(observation) => Some(observation),
            Err(e) => {
                error!(error = %e, "unable to fetch observation; restart requested");
                self.stats.restart_count_fetch_observation += 1;
                self.should_restart = true;
                None
            }
        }
    }

    /// Execute `action`, wait out the frame, then collect observation, reward and extras.
    ///
    /// Signals are read only once the log watcher has finished the line in
    /// flight, so one line never contributes to two steps.
    pub fn step(&mut self, action: Option<&Action>) -> StepOutcome {
        self.state = ControllerState::Stepping;
        self.stats.episode_steps += 1;
        self.execute_action(action);
        self.wait_for_next_frame();
        let observation = self.fetch_observation();
        self.wait_line_ready();
        let outcome = StepOutcome {
            observation,
            reward: self.signals.take_reward(),
            extras: self.signals.take_extras(),
            truncated: self.check_max_duration(),
        };
        self.state = ControllerState::Ready;
        outcome
    }

    /// Whether the episode ran past the task's step or time limit.
    fn check_max_duration(&mut self) -> bool {
        let max_steps = self.task.max_episode_steps;
        if max_steps > 0 && self.stats.episode_steps > max_steps {
            info!(max_steps, "maximum episode steps reached; truncating the episode");
            return self.truncate("max_episode_steps");
        }
        let max_sec = self.task.max_episode_sec;
        if max_sec > 0.0 {
            let elapsed = self.episode_started.map(|t| t.elapsed());
            if elapsed.is_some_and(|e| e > crate::task::secs(max_sec)) {
                info!(max_sec, "maximum episode duration reached; truncating the episode");
                return self.truncate("max_episode_sec");
            }
        }
        false
    }

    fn truncate(&mut self, reason: &str) -> bool {
        self.stats.reset_count_max_duration_reached += 1;
        self.record(LogEvent::EpisodeTruncated {
            reason: reason.to_string(),
        });
        true
    }

    fn wait_line_ready(&self) {
        if !self.watcher.wait_line_ready(LINE_READY_TIMEOUT) {
            warn!(
                timeout = ?LINE_READY_TIMEOUT,
                "log watcher still busy with a line; reading signals anyway"
            );
        }
    }

    /// Whether more than the step timeout passed since the last observation.
    /// A timeout is counted as an episode reset.
    pub fn check_timeout(&mut self) -> bool {
        let timed_out = match (self.config.step_timeout, self.time_since_last_observation()) {
            (Some(limit), Some(since)) => since > limit,
            _ => false,
        };
        if timed_out {
            info!("step timed out");
            self.stats.reset_count_step_timeout += 1;
        }
        timed_out
    }

    /// Non-blocking: whether the screen poller saw the user leave the app.
    pub fn check_player_exited(&mut self) -> bool {
        if !self.poller.check_user_exited(None) {
            return false;
        }
        self.stats.reset_count_user_exited += 1;
        self.increment_bad_state("user_exited");
        true
    }

    /// Whether the task logged an episode end since the last call.
    pub fn check_episode_end(&mut self) -> bool {
        self.wait_line_ready();
        let ended = self.signals.take_episode_end();
        if ended {
            self.stats.reset_count_episode_end += 1;
            self.record(LogEvent::EpisodeEnded);
        }
        ended
    }

    fn increment_bad_state(&mut self, reason: &str) {
        warn!(reason, "bad state detected");
        if self.config.max_bad_states == 0 {
            warn!("max bad states not set; ignoring bad state");
            return;
        }
        self.is_bad_episode = true;
        self.bad_state_counter += 1;
        warn!(count = self.bad_state_counter, max = self.config.max_bad_states, "bad state counter");
        self.record(LogEvent::BadState {
            reason: reason.to_string(),
            count: self.bad_state_counter,
        });
        if self.bad_state_counter >= self.config.max_bad_states {
            error!("too many consecutive bad states; restart requested");
            self.stats.restart_count_max_bad_states += 1;
            self.should_restart = true;
        }
    }

    pub fn should_restart(&self) -> bool {
        self.should_restart
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            interpreter: self.interpreter.stats().clone(),
            ..self.stats.clone()
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// The shell channel, which follows the simulator across restarts.
    pub fn shell(&self) -> Arc<dyn ShellChannel> {
        self.shell.clone()
    }

    /// Run arbitrary steps through the controller's interpreter.
    pub fn interpret(&mut self, steps: &[SetupStep]) -> Result<(), InterpretError> {
        self.interpreter.interpret(steps)
    }

    /// Tear everything down. Each part is closed even if an earlier one failed.
    pub fn close(&mut self) {
        info!("cleaning up remote controller");
        self.poller.pause();
        self.watcher.stop();
        if let Err(e) = self.simulator.close() {
            warn!(error = %e, "failed to close simulator");
        }
        self.state = ControllerState::Closed;
        self.record(LogEvent::Closed);
        info!("done cleaning up remote controller");
    }

    fn time_since_last_observation(&self) -> Option<Duration> {
        self.last_observation.map(|t| t.elapsed())
    }

    fn fail<T>(&mut self, error: ControllerError) -> Result<T, ControllerError> {
        self.state = ControllerState::Failed;
        Err(error)
    }

    fn record(&self, event: LogEvent) {
        if let Some(log) = &self.log {
            if let Err(e) = log.log(event) {
                warn!(error = %e, "failed to write execution log");
            }
        }
    }
}

struct Launched {
    channel: Arc<dyn ShellChannel>,
    stream: Arc<dyn LogStream>,
    /// `None` when an already running simulator was reused.
    started: Option<Instant>,
    attempt: u32,
}

fn launch_simulator(
    simulator: &mut dyn Simulator,
    task: &Task,
    force_launch: bool,
) -> Result<Launched, ControllerError> {
    let mut last_error = None;
    for attempt in 1..=MAX_SIMULATOR_INIT_TRIES {
        match try_launch(simulator, task, force_launch, attempt) {
            Ok(launched) => return Ok(launched),
            Err(e) => {
                warn!(attempt, max = MAX_SIMULATOR_INIT_TRIES, error = %e, "error launching the simulator");
                last_error = Some(e);
            }
        }
    }
    error!("unable to launch the simulator");
    Err(ControllerError::InitFailed {
        attempts: MAX_SIMULATOR_INIT_TRIES,
        source: last_error.unwrap_or_else(|| SimulatorError::Launch("no attempt made".to_string())),
    })
}

fn try_launch(
    simulator: &mut dyn Simulator,
    task: &Task,
    force_launch: bool,
    attempt: u32,
) -> Result<Launched, SimulatorError> {
    let mut started = None;
    if force_launch || !simulator.is_launched() {
        simulator.launch()?;
        started = Some(Instant::now());
    } else {
        info!("simulator already launched; not relaunching");
    }
    Ok(Launched {
        channel: simulator.create_shell_channel()?,
        stream: simulator.create_log_stream(&task.log_parsing.filters)?,
        started,
        attempt,
    })
}
