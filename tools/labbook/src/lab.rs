use crate::config::LabConfig;
use crate::engine::{ExecutionEngine, RunPolicy};
use crate::errors::LabError;
use crate::logging::append_run_log;
use crate::record::Record;
use crate::record_store::RecordStore;
use crate::registry::{Experiment, Registry};
use crate::runtime::{Clock, Terminal};
use crate::types::Overrides;
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Registry, record store and execution engine sharing one storage root.
pub struct Lab {
    registry: Registry,
    store: Arc<RecordStore>,
    engine: ExecutionEngine,
}

impl Lab {
    /// Opens the store named by `cfg`. When `echo` is set, console output of
    /// runs is mirrored to it line by line.
    pub fn open(
        cfg: &LabConfig,
        clock: Arc<dyn Clock>,
        echo: Option<Arc<dyn Terminal>>,
    ) -> Result<Self, LabError> {
        let store = Arc::new(RecordStore::open_with_clock(cfg.database_path(), clock)?);
        let mut engine = ExecutionEngine::new(Arc::clone(&store));
        if let Some(terminal) = echo.filter(|_| cfg.execution.echo_console) {
            engine = engine.with_echo(terminal);
        }
        append_run_log(
            "info",
            "lab.opened",
            json!({ "database": cfg.database_path().display().to_string() }),
        );
        Ok(Self::from_parts(store, engine))
    }

    /// A lab over the database at `path` with default settings and no echo.
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self, LabError> {
        let store = Arc::new(RecordStore::open(path)?);
        let engine = ExecutionEngine::new(Arc::clone(&store));
        Ok(Self::from_parts(store, engine))
    }

    pub fn from_parts(store: Arc<RecordStore>, engine: ExecutionEngine) -> Self {
        Self {
            registry: Registry::bound_to(Arc::clone(&store)),
            store,
            engine,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn run(
        &self,
        experiment: &Experiment,
        overrides: &Overrides,
        policy: &RunPolicy,
    ) -> Result<Record, LabError> {
        self.engine.run(experiment, overrides, policy)
    }
}

static DEFAULT_LAB: OnceLock<Mutex<Option<Arc<Lab>>>> = OnceLock::new();

fn default_slot() -> &'static Mutex<Option<Arc<Lab>>> {
    DEFAULT_LAB.get_or_init(|| Mutex::new(None))
}

/// Makes `lab` the process-wide default, replacing any previous one.
pub fn install_default_lab(lab: Lab) -> Arc<Lab> {
    let lab = Arc::new(lab);
    *default_slot().lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&lab));
    lab
}

pub fn default_lab() -> Option<Arc<Lab>> {
    default_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

pub fn clear_default_lab() -> Option<Arc<Lab>> {
    default_slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
}
