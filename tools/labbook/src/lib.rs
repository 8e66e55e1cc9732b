pub mod capture;
pub mod codec;
pub mod computation;
pub mod config;
pub mod controller;
pub mod demos;
pub mod display;
pub mod engine;
pub mod errors;
pub mod identity;
pub mod lab;
pub mod log_retention;
pub mod logging;
pub mod record;
pub mod record_store;
pub mod registry;
pub mod runtime;
pub mod selector;
pub mod types;

use clap::{error::ErrorKind, Parser};
use config::{load_config, CliOverrides};
use controller::{Controller, ControllerOptions};
use errors::LabError;
use lab::{clear_default_lab, install_default_lab, Lab};
use logging::{append_run_log, init_run_logger, session_log_file_name, JsonlLogger};
use runtime::LabRuntime;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Parser)]
#[command(name = "labbook")]
#[command(about = "Interactive experiment runner with persistent run records")]
#[command(version)]
pub struct Cli {
    /// TOML file layered over the built-in defaults.
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
    /// Directory holding the record database and logs.
    #[arg(long)]
    pub store_root: Option<std::path::PathBuf>,
    /// Do not mirror run console output while experiments execute.
    #[arg(long, default_value_t = false)]
    pub no_echo: bool,
    #[arg(long, default_value_t = false)]
    pub no_log: bool,
}

pub fn run() -> Result<i32, LabError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| LabError::Io(e.to_string()))?;
    let runtime = LabRuntime::new();
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &std::path::Path,
    runtime: &LabRuntime,
) -> Result<i32, LabError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(LabError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        store_root: cli.store_root.clone(),
        no_echo: cli.no_echo,
        no_log: cli.no_log,
    };
    let cfg = load_config(&overrides, cwd, runtime.file_system.as_ref())?;
    runtime.file_system.create_dir_all(&cfg.storage.root)?;

    if cfg.logging.enabled {
        let mut logger =
            JsonlLogger::new(cfg.log_dir().join(session_log_file_name(runtime.clock.now())));
        logger.max_payload_bytes = cfg.logging.max_payload_bytes;
        logger.budget_bytes = cfg.logging.budget_bytes;
        init_run_logger(logger)?;
    }
    append_run_log(
        "info",
        "session.started",
        json!({
            "store_root": cfg.storage.root.display().to_string(),
            "interactive": runtime.terminal.stdin_is_tty(),
        }),
    );

    let lab = install_default_lab(Lab::open(
        &cfg,
        Arc::clone(&runtime.clock),
        Some(Arc::clone(&runtime.terminal)),
    )?);
    let experiments = demos::register_demos(lab.registry())?;
    append_run_log(
        "info",
        "session.registered",
        json!({ "experiments": experiments.len() }),
    );

    let summary = Controller::new(
        &lab,
        runtime.terminal.as_ref(),
        ControllerOptions::from_config(&cfg),
    )
    .run();
    clear_default_lab();
    let summary = summary?;
    append_run_log(
        "info",
        "session.finished",
        json!({
            "commands": summary.commands,
            "runs": summary.runs,
            "failed_runs": summary.failed_runs,
            "deleted_records": summary.deleted_records,
        }),
    );
    Ok(0)
}
