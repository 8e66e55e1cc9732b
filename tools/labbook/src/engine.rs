use crate::capture::{BufferSink, CaptureScope, CaptureSink};
use crate::codec::{JsonCodec, ResultCodec};
use crate::computation::{CancellationToken, Cancelled, RunContext};
use crate::errors::LabError;
use crate::identity::validate_parameter_names;
use crate::logging::append_run_log;
use crate::record::{FailureInfo, Record, RunOutcome};
use crate::record_store::RecordStore;
use crate::registry::Experiment;
use crate::runtime::Terminal;
use crate::types::{merge_arguments, Overrides};
use serde_json::json;
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

#[derive(Debug, Clone)]
pub struct RunPolicy {
    /// Return an existing completed record with identical arguments instead of running.
    pub skip_if_record_exists: bool,
    /// Report failures through the returned record only.
    pub suppress_errors: bool,
    /// Block until a concurrent run of the same id finishes, instead of `ExperimentBusy`.
    pub wait_for_lock: bool,
    pub cancellation: CancellationToken,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            skip_if_record_exists: false,
            suppress_errors: false,
            wait_for_lock: true,
            cancellation: CancellationToken::new(),
        }
    }
}

/// One lock per experiment id; unrelated ids never contend.
#[derive(Default)]
pub struct ExperimentLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl ExperimentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, id: &str, wait: bool) -> Result<ExperimentLockGuard<'_>, LabError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(id) {
            if !wait {
                return Err(LabError::ExperimentBusy(format!(
                    "`{id}` is already running"
                )));
            }
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(id.to_string());
        Ok(ExperimentLockGuard {
            locks: self,
            id: id.to_string(),
        })
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

pub struct ExperimentLockGuard<'a> {
    locks: &'a ExperimentLocks,
    id: String,
}

impl Drop for ExperimentLockGuard<'_> {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        self.locks.released.notify_all();
    }
}

pub struct ExecutionEngine {
    store: Arc<RecordStore>,
    locks: ExperimentLocks,
    codec: Arc<dyn ResultCodec>,
    echo: Option<Arc<dyn Terminal>>,
}

impl ExecutionEngine {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self {
            store,
            locks: ExperimentLocks::new(),
            codec: Arc::new(JsonCodec),
            echo: None,
        }
    }

    /// Encodes return values with `codec`. The codec is also registered on
    /// the store so records it wrote decode on read.
    pub fn with_codec(mut self, codec: Arc<dyn ResultCodec>) -> Self {
        self.store.register_codec(Arc::clone(&codec));
        self.codec = codec;
        self
    }

    /// Echo console lines to `terminal` while runs are in progress.
    pub fn with_echo(mut self, terminal: Arc<dyn Terminal>) -> Self {
        self.echo = Some(terminal);
        self
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn locks(&self) -> &ExperimentLocks {
        &self.locks
    }

    pub fn codec(&self) -> &Arc<dyn ResultCodec> {
        &self.codec
    }

    /// Executes `experiment` with `overrides` applied over its defaults and
    /// returns the finalized record.
    pub fn run(
        &self,
        experiment: &Experiment,
        overrides: &Overrides,
        policy: &RunPolicy,
    ) -> Result<Record, LabError> {
        validate_parameter_names(experiment.signature(), overrides)?;
        let args = merge_arguments(experiment.defaults(), overrides);
        let experiment_id = experiment.id();

        let _lock = self.locks.acquire(experiment_id, policy.wait_for_lock)?;

        if policy.skip_if_record_exists {
            if let Some(existing) = self.store.find_completed(experiment_id, &args)? {
                append_run_log(
                    "info",
                    "engine.run.cached",
                    json!({ "experiment_id": experiment_id, "run_id": existing.run_id() }),
                );
                return Ok(existing);
            }
        }

        let buffer = Arc::new(match &self.echo {
            Some(terminal) => BufferSink::echoing(Arc::clone(terminal)),
            None => BufferSink::new(),
        });
        let sink: Arc<dyn CaptureSink> = buffer.clone();
        let scope = CaptureScope::enter(Arc::clone(&sink))?;
        let handle = self.store.begin(experiment_id, &args)?;
        let run_id = handle.run_id();
        append_run_log(
            "info",
            "engine.run.started",
            json!({ "experiment_id": experiment_id, "run_id": run_id, "args": args }),
        );

        let ctx = RunContext::new(
            experiment_id,
            run_id,
            args,
            sink,
            policy.cancellation.clone(),
        );
        let computation = experiment.computation();
        let result = panic::catch_unwind(AssertUnwindSafe(|| computation.call(&ctx)))
            .unwrap_or_else(|payload| {
                Err(anyhow::anyhow!(
                    "computation panicked: {}",
                    panic_message(payload.as_ref())
                ))
            });
        drop(scope);
        let (console, artifacts) = buffer.take();

        let outcome = match result {
            Ok(value) => match self.codec.encode(&value) {
                Ok(bytes) => RunOutcome::Completed {
                    codec: self.codec.name().to_string(),
                    bytes,
                },
                Err(e) => RunOutcome::Failed(FailureInfo {
                    message: format!("could not encode return value: {e}"),
                    trace: e.to_string(),
                    cancelled: false,
                }),
            },
            Err(err) => RunOutcome::Failed(FailureInfo {
                message: err.to_string(),
                trace: format!("{err:?}"),
                cancelled: err.chain().any(|cause| cause.is::<Cancelled>()),
            }),
        };

        let record = self.store.finalize(handle, outcome, console, artifacts)?;
        match record.failure().cloned() {
            None => {
                append_run_log(
                    "info",
                    "engine.run.completed",
                    json!({ "experiment_id": experiment_id, "run_id": run_id }),
                );
                Ok(record)
            }
            Some(failure) => {
                append_run_log(
                    "warn",
                    "engine.run.failed",
                    json!({
                        "experiment_id": experiment_id,
                        "run_id": run_id,
                        "cancelled": failure.cancelled,
                        "error": failure.message,
                    }),
                );
                if policy.suppress_errors {
                    Ok(record)
                } else {
                    Err(LabError::Computation {
                        experiment_id: experiment_id.to_string(),
                        run_id,
                        message: failure.message,
                    })
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
