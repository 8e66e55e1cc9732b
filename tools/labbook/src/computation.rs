use crate::capture::CaptureSink;
use crate::record::Artifact;
use crate::types::Arguments;
use anyhow::{anyhow, Context};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A user computation: resolved arguments in, JSON value out.
pub trait Computation: Send + Sync {
    fn call(&self, ctx: &RunContext) -> anyhow::Result<Value>;
}

impl<F> Computation for F
where
    F: Fn(&RunContext) -> anyhow::Result<Value> + Send + Sync,
{
    fn call(&self, ctx: &RunContext) -> anyhow::Result<Value> {
        self(ctx)
    }
}

/// Cooperative cancellation flag shared between a caller and a run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Returned by a computation that stopped because its token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("run cancelled")]
pub struct Cancelled;

pub struct RunContext {
    experiment_id: String,
    run_id: u64,
    args: Arguments,
    sink: Arc<dyn CaptureSink>,
    cancellation: CancellationToken,
}

impl RunContext {
    pub fn new(
        experiment_id: impl Into<String>,
        run_id: u64,
        args: Arguments,
        sink: Arc<dyn CaptureSink>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            run_id,
            args,
            sink,
            cancellation,
        }
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn args(&self) -> &Arguments {
        &self.args
    }

    pub fn arg(&self, name: &str) -> anyhow::Result<&Value> {
        self.args
            .get(name)
            .ok_or_else(|| anyhow!("missing argument `{name}`"))
    }

    pub fn arg_f64(&self, name: &str) -> anyhow::Result<f64> {
        self.arg(name)?
            .as_f64()
            .with_context(|| format!("argument `{name}` is not a number"))
    }

    pub fn arg_u64(&self, name: &str) -> anyhow::Result<u64> {
        self.arg(name)?
            .as_u64()
            .with_context(|| format!("argument `{name}` is not a non-negative integer"))
    }

    pub fn arg_i64(&self, name: &str) -> anyhow::Result<i64> {
        self.arg(name)?
            .as_i64()
            .with_context(|| format!("argument `{name}` is not an integer"))
    }

    pub fn arg_bool(&self, name: &str) -> anyhow::Result<bool> {
        self.arg(name)?
            .as_bool()
            .with_context(|| format!("argument `{name}` is not a boolean"))
    }

    pub fn arg_str(&self, name: &str) -> anyhow::Result<&str> {
        self.arg(name)?
            .as_str()
            .with_context(|| format!("argument `{name}` is not a string"))
    }

    pub fn print(&self, text: &str) {
        self.sink.write_console(text);
    }

    pub fn println(&self, text: &str) {
        self.sink.write_console(&format!("{text}\n"));
    }

    pub fn emit_artifact(&self, artifact: Artifact) {
        self.sink.push_artifact(artifact);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// `Err(Cancelled)` once the token has been cancelled.
    pub fn check_cancelled(&self) -> anyhow::Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(())
    }
}
