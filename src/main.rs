mod cli;

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use cli::{Cli, Command};
use droidvisor::config::ProjectConfig;
use droidvisor::controller::{ControllerConfig, RemoteController};
use droidvisor::interpreter::SetupStepInterpreter;
use droidvisor::log::{ExecutionLog, LogEvent};
use droidvisor::logcat::{AdbLogStream, LogWatcher};
use droidvisor::paths;
use droidvisor::screen::{AppScreenChecker, ScreenCheck};
use droidvisor::shell::adb::AdbShell;
use droidvisor::simulator::Action;
use droidvisor::simulator::adb::AdbDevice;
use droidvisor::task::Task;

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .droidvisor/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl Display) {
    output.push_str(&format!("  {key:<28} {value}\n"));
}

fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Adb\n");
    push_kv(&mut output, "path", &config.adb.path);
    push_kv(
        &mut output,
        "serial",
        if config.adb.serial.is_empty() {
            "(any)"
        } else {
            config.adb.serial.as_str()
        },
    );
    push_kv(&mut output, "server_port", config.adb.server_port);
    push_kv(
        &mut output,
        "default_timeout",
        format!("{}s", config.adb.default_timeout_secs),
    );
    output.push('\n');

    output.push_str("Controller\n");
    let c = &config.controller;
    push_kv(&mut output, "max_bad_states", c.max_bad_states);
    push_kv(&mut output, "step_timeout", format!("{}s", c.step_timeout_secs));
    push_kv(&mut output, "max_steps_per_sec", c.max_steps_per_sec);
    push_kv(
        &mut output,
        "periodic_restart_time_min",
        c.periodic_restart_time_min,
    );
    push_kv(&mut output, "force_simulator_launch", c.force_simulator_launch);
    push_kv(&mut output, "num_fingers", c.num_fingers);
    output.push('\n');

    output.push_str("Poller\n");
    push_kv(&mut output, "check_frequency", config.poller.check_frequency);
    push_kv(
        &mut output,
        "max_failed_current_activity",
        config.poller.max_failed_current_activity,
    );
    output.push('\n');

    output.push_str("Task\n");
    push_kv(
        &mut output,
        "path",
        config
            .task
            .path
            .as_ref()
            .map_or_else(|| "(none)".to_string(), |p| p.display().to_string()),
    );
    output.push('\n');

    output.push_str(&format!("Source: {}\n", config_source_label(config_path)));
    output
}

fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    payload["source"] = serde_json::Value::String(config_source_label(config_path));
    serde_json::to_string_pretty(&payload).context("failed to render config JSON")
}

fn load_task(
    cli_task: Option<&Path>,
    config: &ProjectConfig,
    config_path: Option<&Path>,
    cwd: &Path,
) -> Result<Task> {
    let path = match cli_task {
        Some(p) => cwd.join(p),
        None => config.task_path(config_path, cwd).context(
            "no task configured: pass --task or set `[task] path` in .droidvisor/config.toml",
        )?,
    };
    let task = Task::from_file(&path)?;
    info!(task = %task.id, path = %path.display(), "loaded task");
    Ok(task)
}

fn project_root(config_path: Option<&Path>, cwd: &Path) -> PathBuf {
    config_path
        .and_then(paths::project_root_of_config)
        .unwrap_or(cwd)
        .to_path_buf()
}

fn check_screen(config: &ProjectConfig, task: &Task) -> Result<()> {
    let shell = Arc::new(AdbShell::new(&config.adb));
    let checker = AppScreenChecker::new(shell, &task.expected_app_screen)
        .context("invalid view hierarchy pattern in task")?;
    let outcome = checker.evaluate();
    println!("{}: {outcome}", checker.expected_activity());
    if outcome.is_divergence() {
        anyhow::bail!("device is not on the expected app screen");
    }
    Ok(())
}

fn run_setup(config: &ProjectConfig, task: &Task) -> Result<()> {
    let shell = Arc::new(AdbShell::new(&config.adb));
    let stream = Arc::new(AdbLogStream::new(&config.adb, &task.log_parsing.filters));
    let watcher = Arc::new(LogWatcher::start(stream).context("failed to start log watcher")?);

    let mut interpreter = SetupStepInterpreter::new(shell, Some(Arc::clone(&watcher)));
    let result = interpreter.interpret(&task.setup_steps);
    watcher.stop();

    println!(
        "{}",
        serde_json::to_string_pretty(interpreter.stats()).context("failed to render stats")?
    );
    result.context("setup steps failed")
}

fn run_episodes(
    config: &ProjectConfig,
    task: Task,
    steps: u32,
    episodes: u32,
    log_path: &Path,
) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl-C handler")?;

    let log = Arc::new(ExecutionLog::new(log_path)?);
    info!(log = %log.path().display(), "writing execution log");

    let device = AdbDevice::new(&config.adb);
    let controller_config = ControllerConfig::from_settings(&config.controller, &config.poller);
    let mut controller = RemoteController::new(
        Box::new(device),
        task,
        controller_config,
        Some(Arc::clone(&log)),
    )
    .context("failed to start the remote controller")?;

    let result = drive(&mut controller, steps, episodes, &stop);

    let stats = serde_json::to_value(controller.stats()).context("failed to serialize stats")?;
    if let Err(e) = log.log(LogEvent::Stats {
        stats: stats.clone(),
    }) {
        warn!(error = %e, "failed to log final stats");
    }
    controller.close();
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).context("failed to render stats")?
    );
    result
}

fn drive(
    controller: &mut RemoteController,
    steps: u32,
    episodes: u32,
    stop: &AtomicBool,
) -> Result<()> {
    let noop = Action::repeat();
    for episode in 1..=episodes {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        controller.reset()?;

        let mut total_reward = 0.0;
        let mut taken = 0;
        while taken < steps && !stop.load(Ordering::SeqCst) {
            if controller.should_restart() {
                warn!(episode, "restart requested; ending episode");
                controller.restart()?;
                break;
            }
            if controller.check_timeout() {
                info!(episode, "step timed out; ending episode");
                break;
            }
            let outcome = controller.step(Some(&noop));
            total_reward += outcome.reward;
            taken += 1;
            if outcome.truncated
                || controller.check_player_exited()
                || controller.check_episode_end()
            {
                break;
            }
        }
        info!(episode, steps = taken, reward = total_reward, "episode finished");
    }
    if stop.load(Ordering::SeqCst) {
        info!("interrupted; shutting down");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "droidvisor=warn",
        0 => "droidvisor=info",
        1 => "droidvisor=debug",
        _ => "droidvisor=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .droidvisor/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
        Command::Check => {
            let task = load_task(cli.task.as_deref(), &config, config_path.as_deref(), &cwd)?;
            check_screen(&config, &task)?;
        }
        Command::Setup => {
            let task = load_task(cli.task.as_deref(), &config, config_path.as_deref(), &cwd)?;
            run_setup(&config, &task)?;
        }
        Command::Run {
            steps,
            episodes,
            log,
        } => {
            let task = load_task(cli.task.as_deref(), &config, config_path.as_deref(), &cwd)?;
            let log_path = log.unwrap_or_else(|| {
                paths::default_log_path(&project_root(config_path.as_deref(), &cwd))
            });
            run_episodes(&config, task, steps, episodes, &log_path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_config_lists_every_section() {
        let out = render_config_human(&ProjectConfig::default(), None);
        for section in ["Adb\n", "Controller\n", "Poller\n", "Task\n"] {
            assert!(out.contains(section), "missing {section:?} in:\n{out}");
        }
        assert!(out.contains("(any)"));
        assert!(out.contains("no .droidvisor/config.toml found"));
    }

    #[test]
    fn json_config_carries_source() {
        let json = render_config_json(&ProjectConfig::default(), Some(Path::new("/p/.droidvisor/config.toml")))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["source"], "/p/.droidvisor/config.toml");
        assert_eq!(value["poller"]["check_frequency"], 150);
    }

    #[test]
    fn load_task_prefers_cli_path() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("t.toml"), "id = \"from_cli\"\n").unwrap();
        let task = load_task(
            Some(Path::new("t.toml")),
            &ProjectConfig::default(),
            None,
            tmp.path(),
        )
        .unwrap();
        assert_eq!(task.id, "from_cli");
    }

    #[test]
    fn load_task_without_any_path_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load_task(None, &ProjectConfig::default(), None, tmp.path()).unwrap_err();
        assert!(err.to_string().contains("no task configured"));
    }

    #[test]
    fn project_root_falls_back_to_cwd() {
        assert_eq!(project_root(None, Path::new("/work")), PathBuf::from("/work"));
        assert_eq!(
            project_root(Some(Path::new("/repo/.droidvisor/config.toml")), Path::new("/work")),
            PathBuf::from("/repo")
        );
    }
}
