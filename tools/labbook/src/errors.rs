use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabError {
    #[error("duplicate identity: {0}")]
    DuplicateIdentity(String),
    #[error("malformed lineage: {0}")]
    MalformedLineage(String),
    #[error("experiment not found: {0}")]
    NotFound(String),
    #[error("record not found: {experiment_id} #{run_id}")]
    RecordNotFound { experiment_id: String, run_id: u64 },
    #[error("selector resolution failed: {0}")]
    SelectorResolution(String),
    #[error("experiment busy: {0}")]
    ExperimentBusy(String),
    #[error("capture conflict: {0}")]
    CaptureConflict(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("computation failed for {experiment_id} #{run_id}: {message}")]
    Computation {
        experiment_id: String,
        run_id: u64,
        message: String,
    },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("hook error: {0}")]
    Hook(String),
}
