use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use libtaskd::{CommandSet, EngineConfig};
use serde::Deserialize;
use taskd_protocol::paths;

const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
const DEFAULT_PURGE_INTERVAL_MS: u64 = 60_000;
const DEFAULT_MAX_UPLOAD_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Command-line flags. Every flag can also come from the environment.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "taskd task orchestration server")]
pub struct Args {
    /// TOML config file. Defaults to `$XDG_CONFIG_HOME/taskd/config.toml` when present.
    #[arg(long, env = "TASKD_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long, env = "TASKD_LISTEN")]
    pub listen: Option<String>,
    /// Directory holding one subdirectory per task.
    #[arg(long, env = "TASKS_ROOT")]
    pub tasks_root: Option<PathBuf>,
    /// Milliseconds between purge sweeps.
    #[arg(long, env = "PERIODIC_PURGE_INTERVAL")]
    pub purge_interval_ms: Option<u64>,
    /// Milliseconds a finished task stays downloadable. Defaults to the purge interval.
    #[arg(long, env = "TASK_RETENTION")]
    pub retention_ms: Option<u64>,
    /// Largest accepted request body and uploaded file, in bytes.
    #[arg(long, env = "MAX_UPLOAD_SIZE")]
    pub max_upload_size: Option<u64>,
    #[arg(long = "allow-origin", env = "ALLOW_ORIGINS", value_delimiter = ',')]
    pub allow_origins: Vec<String>,
    /// Static front-end served at `/`.
    #[arg(long, env = "UI_DIR")]
    pub ui_dir: Option<PathBuf>,
}

/// Contents of the optional TOML file.
#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub tasks_root: Option<PathBuf>,
    pub purge_interval_ms: Option<u64>,
    pub retention_ms: Option<u64>,
    pub max_upload_size: Option<u64>,
    pub allow_origins: Option<Vec<String>>,
    pub ui_dir: Option<PathBuf>,
    pub commands: CommandSet,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub tasks_root: PathBuf,
    pub purge_interval: Duration,
    pub retention: Duration,
    pub max_upload_size: u64,
    pub allow_origins: Vec<String>,
    pub ui_dir: Option<PathBuf>,
    pub commands: CommandSet,
}

impl ServerConfig {
    /// Resolve flags, environment, config file and defaults, in that order.
    pub fn load(args: Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::read(path)?,
            None => {
                let path = paths::config_path();
                if path.exists() {
                    FileConfig::read(&path)?
                } else {
                    FileConfig::default()
                }
            }
        };
        Self::resolve(args, file)
    }

    pub fn resolve(args: Args, file: FileConfig) -> Result<Self> {
        let listen = args
            .listen
            .or(file.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen: SocketAddr = listen
            .parse()
            .with_context(|| format!("invalid listen address {listen}"))?;

        let purge_interval_ms = args
            .purge_interval_ms
            .or(file.purge_interval_ms)
            .unwrap_or(DEFAULT_PURGE_INTERVAL_MS);
        if purge_interval_ms == 0 {
            bail!("purge interval must be > 0");
        }
        let retention_ms = args
            .retention_ms
            .or(file.retention_ms)
            .unwrap_or(purge_interval_ms);

        let max_upload_size = args
            .max_upload_size
            .or(file.max_upload_size)
            .unwrap_or(DEFAULT_MAX_UPLOAD_SIZE);
        if max_upload_size == 0 {
            bail!("max upload size must be > 0");
        }

        let allow_origins = if args.allow_origins.is_empty() {
            file.allow_origins.unwrap_or_else(|| vec!["*".to_string()])
        } else {
            args.allow_origins
        };

        Ok(Self {
            listen,
            tasks_root: args
                .tasks_root
                .or(file.tasks_root)
                .unwrap_or_else(paths::default_tasks_root),
            purge_interval: Duration::from_millis(purge_interval_ms),
            retention: Duration::from_millis(retention_ms),
            max_upload_size,
            allow_origins,
            ui_dir: args.ui_dir.or(file.ui_dir),
            commands: file.commands,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            tasks_root: self.tasks_root.clone(),
            retention: self.retention,
            max_upload_size: self.max_upload_size,
            commands: self.commands.clone(),
            ..EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_flags_or_file() {
        let config = ServerConfig::resolve(Args::default(), FileConfig::default()).unwrap();
        assert_eq!(config.listen, DEFAULT_LISTEN.parse::<SocketAddr>().unwrap());
        assert_eq!(config.tasks_root, PathBuf::from("tasks"));
        assert_eq!(config.purge_interval, Duration::from_secs(60));
        assert_eq!(config.retention, config.purge_interval);
        assert_eq!(config.max_upload_size, DEFAULT_MAX_UPLOAD_SIZE);
        assert_eq!(config.allow_origins, vec!["*"]);
        assert_eq!(config.commands, CommandSet::default());
    }

    #[test]
    fn flags_override_file() {
        let file: FileConfig = toml::from_str(
            r#"
            listen = "0.0.0.0:9000"
            purge_interval_ms = 5000
            max_upload_size = 1024

            [commands.train]
            program = "/usr/bin/python3"
            args = ["train.py", "{task_id}", "{epochs}"]
            "#,
        )
        .unwrap();
        let args = Args {
            listen: Some("127.0.0.1:7000".to_string()),
            ..Args::default()
        };

        let config = ServerConfig::resolve(args, file).unwrap();
        assert_eq!(config.listen.port(), 7000);
        assert_eq!(config.purge_interval, Duration::from_millis(5000));
        assert_eq!(config.retention, Duration::from_millis(5000));
        assert_eq!(config.max_upload_size, 1024);
        assert_eq!(config.commands.train.program, "/usr/bin/python3");
        assert_eq!(config.commands.infer, CommandSet::default().infer);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad_listen = Args {
            listen: Some("not-an-address".to_string()),
            ..Args::default()
        };
        assert!(ServerConfig::resolve(bad_listen, FileConfig::default()).is_err());

        let zero_interval = Args {
            purge_interval_ms: Some(0),
            ..Args::default()
        };
        assert!(ServerConfig::resolve(zero_interval, FileConfig::default()).is_err());

        assert!(toml::from_str::<FileConfig>("unknown_key = 1").is_err());
    }

    #[test]
    fn engine_config_carries_limits() {
        let args = Args {
            retention_ms: Some(1500),
            max_upload_size: Some(4096),
            ..Args::default()
        };
        let engine = ServerConfig::resolve(args, FileConfig::default())
            .unwrap()
            .engine_config();
        assert_eq!(engine.retention, Duration::from_millis(1500));
        assert_eq!(engine.max_upload_size, 4096);
    }

    #[test]
    fn args_parse_from_command_line() {
        let args = Args::try_parse_from([
            "taskd",
            "--listen",
            "127.0.0.1:1234",
            "--allow-origin",
            "http://a.test,http://b.test",
        ])
        .unwrap();
        assert_eq!(args.listen.as_deref(), Some("127.0.0.1:1234"));
        assert_eq!(args.allow_origins, vec!["http://a.test", "http://b.test"]);
    }
}
