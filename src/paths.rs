use std::path::{Path, PathBuf};

const STATE_DIR: &str = ".droidvisor";

/// Project state directory (`<base>/.droidvisor`).
pub fn state_dir(base: &Path) -> PathBuf {
    base.join(STATE_DIR)
}

/// Default location of the supervision log for a project.
pub fn default_log_path(base: &Path) -> PathBuf {
    state_dir(base).join("logs").join("supervision.jsonl")
}

/// The project root for a config file at `<root>/.droidvisor/config.toml`.
///
/// Returns `None` when the path does not sit inside a state directory.
pub fn project_root_of_config(config_path: &Path) -> Option<&Path> {
    let state = config_path.parent()?;
    if state.file_name()? != STATE_DIR {
        return None;
    }
    state.parent()
}
