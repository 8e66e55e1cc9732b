use crate::controller::COMMAND_WORDS;
use crate::errors::LabError;
use crate::logging::{DEFAULT_DISK_BUDGET_BYTES, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub store_root: Option<PathBuf>,
    pub no_echo: bool,
    pub no_log: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabConfig {
    pub storage: StorageConfig,
    pub execution: ExecutionConfig,
    pub controller: ControllerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    pub skip_if_record_exists: bool,
    pub wait_for_lock: bool,
    pub echo_console: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerConfig {
    pub prompt: String,
    pub confirm_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// Defaults to `<storage.root>/logs`.
    pub dir: Option<PathBuf>,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                root: PathBuf::from(".labbook"),
                database: "records.sqlite".to_string(),
            },
            execution: ExecutionConfig {
                skip_if_record_exists: false,
                wait_for_lock: true,
                echo_console: true,
            },
            controller: ControllerConfig {
                prompt: "labbook> ".to_string(),
                confirm_token: "yes".to_string(),
            },
            logging: LoggingConfig {
                enabled: true,
                dir: None,
                max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
                budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
            },
        }
    }
}

impl LabConfig {
    pub fn database_path(&self) -> PathBuf {
        self.storage.root.join(&self.storage.database)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.logging
            .dir
            .clone()
            .unwrap_or_else(|| self.storage.root.join("logs"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLabConfig {
    storage: Option<PartialStorageConfig>,
    execution: Option<PartialExecutionConfig>,
    controller: Option<PartialControllerConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialStorageConfig {
    root: Option<PathBuf>,
    database: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialExecutionConfig {
    skip_if_record_exists: Option<bool>,
    wait_for_lock: Option<bool>,
    echo_console: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialControllerConfig {
    prompt: Option<String>,
    confirm_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    enabled: Option<bool>,
    dir: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    budget_bytes: Option<u64>,
}

/// Defaults, then the TOML file named by `--config`, then CLI flags.
/// Relative paths resolve against `process_cwd`.
pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<LabConfig, LabError> {
    let mut cfg = LabConfig::default();
    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(&absolutize_path(process_cwd, path))?;
        let partial: PartialLabConfig =
            toml::from_str(&file_contents).map_err(|e| LabError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }
    apply_cli_overrides(&mut cfg, overrides);

    cfg.storage.root = absolutize_path(process_cwd, &cfg.storage.root);
    if let Some(dir) = &cfg.logging.dir {
        cfg.logging.dir = Some(absolutize_path(process_cwd, dir));
    }

    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut LabConfig, partial: PartialLabConfig) {
    if let Some(storage) = partial.storage {
        if let Some(root) = storage.root {
            cfg.storage.root = root;
        }
        if let Some(database) = storage.database {
            cfg.storage.database = database;
        }
    }
    if let Some(execution) = partial.execution {
        if let Some(value) = execution.skip_if_record_exists {
            cfg.execution.skip_if_record_exists = value;
        }
        if let Some(value) = execution.wait_for_lock {
            cfg.execution.wait_for_lock = value;
        }
        if let Some(value) = execution.echo_console {
            cfg.execution.echo_console = value;
        }
    }
    if let Some(controller) = partial.controller {
        if let Some(prompt) = controller.prompt {
            cfg.controller.prompt = prompt;
        }
        if let Some(token) = controller.confirm_token {
            cfg.controller.confirm_token = token;
        }
    }
    if let Some(logging) = partial.logging {
        if let Some(value) = logging.enabled {
            cfg.logging.enabled = value;
        }
        if let Some(dir) = logging.dir {
            cfg.logging.dir = Some(dir);
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut LabConfig, overrides: &CliOverrides) {
    if let Some(root) = &overrides.store_root {
        cfg.storage.root = root.clone();
    }
    if overrides.no_echo {
        cfg.execution.echo_console = false;
    }
    if overrides.no_log {
        cfg.logging.enabled = false;
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &LabConfig) -> Result<(), LabError> {
    if cfg.storage.database.trim().is_empty() {
        return Err(LabError::InvalidConfig(
            "storage.database must not be empty".to_string(),
        ));
    }

    let token = cfg.controller.confirm_token.trim();
    if token.is_empty() {
        return Err(LabError::InvalidConfig(
            "controller.confirm_token must not be empty".to_string(),
        ));
    }
    if COMMAND_WORDS.contains(&token) {
        return Err(LabError::InvalidConfig(format!(
            "controller.confirm_token `{token}` collides with a command"
        )));
    }

    if cfg.logging.max_payload_bytes == 0 {
        return Err(LabError::InvalidConfig(
            "logging.max_payload_bytes must be greater than zero".to_string(),
        ));
    }

    Ok(())
}
