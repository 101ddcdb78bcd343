use std::path::PathBuf;

/// Returns the config/data directory path for taskd.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("taskd")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("taskd")
    } else {
        PathBuf::from("/tmp/taskd")
    }
}

/// Returns the config file path for the taskd server.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}

/// Default directory under which every task gets `<id>/{input,output,model}`.
pub fn default_tasks_root() -> PathBuf {
    PathBuf::from("tasks")
}
