//! Records: the persisted capture of one execution of an experiment.
//!
//! Metadata and console text are loaded together; the return value and
//! artifacts are fetched through a [`PayloadLoader`] on first access and
//! cached inside the record, so listing many records stays cheap.

use crate::codec::{builtin_codec, ResultCodec};
use crate::errors::LabError;
use crate::types::Arguments;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Opaque output of a computation (a figure, a table, a file) plus a type tag
/// such as `image/png` or `text/csv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    type_tag: String,
    bytes: Vec<u8>,
}

impl Artifact {
    pub fn new(type_tag: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            type_tag: type_tag.into(),
            bytes: bytes.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new("text/plain", text.into().into_bytes())
    }

    pub fn json(value: &Value) -> Result<Self, LabError> {
        let bytes = serde_json::to_vec(value).map_err(|e| LabError::Serialization(e.to_string()))?;
        Ok(Self::new("application/json", bytes))
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Text view for `text/*` and JSON artifacts that hold valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        if self.type_tag.starts_with("text/") || self.type_tag == "application/json" {
            std::str::from_utf8(&self.bytes).ok()
        } else {
            None
        }
    }

    pub fn digest(&self) -> String {
        sha256_digest(&self.bytes)
    }
}

pub fn sha256_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(7 + digest.len() * 2);
    out.push_str("sha256:");
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    pub trace: String,
    pub cancelled: bool,
}

/// How an execution ended, as handed to the store for finalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { codec: String, bytes: Vec<u8> },
    Failed(FailureInfo),
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed { .. } => RunStatus::Completed,
            Self::Failed(_) => RunStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub experiment_id: String,
    pub run_id: u64,
    pub status: RunStatus,
    pub args: Arguments,
    pub console: String,
    pub failure: Option<FailureInfo>,
    pub codec: Option<String>,
    pub artifact_count: usize,
    pub created_at_ms: i64,
    pub finished_at_ms: Option<i64>,
    pub orphaned: bool,
}

pub trait PayloadLoader: Send + Sync {
    fn load_result(&self, experiment_id: &str, run_id: u64) -> Result<Option<Vec<u8>>, LabError>;
    fn load_artifacts(&self, experiment_id: &str, run_id: u64) -> Result<Vec<Artifact>, LabError>;

    /// Resolves a codec named in record metadata.
    fn codec(&self, name: &str) -> Option<Arc<dyn ResultCodec>> {
        builtin_codec(name)
    }
}

struct LazyPayload {
    loader: Option<Arc<dyn PayloadLoader>>,
    result: OnceLock<Option<Vec<u8>>>,
    artifacts: OnceLock<Vec<Artifact>>,
}

#[derive(Clone)]
pub struct Record {
    meta: RecordMeta,
    payload: Arc<LazyPayload>,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("meta", &self.meta)
            .field("heavy_fields_loaded", &self.heavy_fields_loaded())
            .finish()
    }
}

impl Record {
    pub fn lazy(meta: RecordMeta, loader: Arc<dyn PayloadLoader>) -> Self {
        Self {
            meta,
            payload: Arc::new(LazyPayload {
                loader: Some(loader),
                result: OnceLock::new(),
                artifacts: OnceLock::new(),
            }),
        }
    }

    pub fn loaded(meta: RecordMeta, result: Option<Vec<u8>>, artifacts: Vec<Artifact>) -> Self {
        let payload = LazyPayload {
            loader: None,
            result: OnceLock::new(),
            artifacts: OnceLock::new(),
        };
        let _ = payload.result.set(result);
        let _ = payload.artifacts.set(artifacts);
        Self {
            meta,
            payload: Arc::new(payload),
        }
    }

    pub fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    pub fn experiment_id(&self) -> &str {
        &self.meta.experiment_id
    }

    pub fn run_id(&self) -> u64 {
        self.meta.run_id
    }

    /// Selector-facing name of the record, `#<run_id>`.
    pub fn label(&self) -> String {
        format!("#{}", self.meta.run_id)
    }

    pub fn status(&self) -> RunStatus {
        self.meta.status
    }

    pub fn args(&self) -> &Arguments {
        &self.meta.args
    }

    pub fn console(&self) -> &str {
        &self.meta.console
    }

    pub fn failure(&self) -> Option<&FailureInfo> {
        self.meta.failure.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.meta.failure.as_ref().is_some_and(|f| f.cancelled)
    }

    pub fn is_orphaned(&self) -> bool {
        self.meta.orphaned
    }

    pub fn created_at_ms(&self) -> i64 {
        self.meta.created_at_ms
    }

    pub fn finished_at_ms(&self) -> Option<i64> {
        self.meta.finished_at_ms
    }

    pub fn artifact_count(&self) -> usize {
        self.meta.artifact_count
    }

    pub fn heavy_fields_loaded(&self) -> bool {
        self.payload.result.get().is_some() || self.payload.artifacts.get().is_some()
    }

    pub fn result_bytes(&self) -> Result<Option<&[u8]>, LabError> {
        if self.payload.result.get().is_none() {
            let loaded = match (&self.payload.loader, self.meta.status) {
                (Some(loader), RunStatus::Completed) => {
                    loader.load_result(&self.meta.experiment_id, self.meta.run_id)?
                }
                _ => None,
            };
            let _ = self.payload.result.set(loaded);
        }
        Ok(self.payload.result.get().and_then(Option::as_deref))
    }

    pub fn artifacts(&self) -> Result<&[Artifact], LabError> {
        if self.payload.artifacts.get().is_none() {
            let loaded = match &self.payload.loader {
                Some(loader) if self.meta.artifact_count > 0 => {
                    loader.load_artifacts(&self.meta.experiment_id, self.meta.run_id)?
                }
                _ => Vec::new(),
            };
            let _ = self.payload.artifacts.set(loaded);
        }
        Ok(self
            .payload
            .artifacts
            .get()
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    /// Decodes the return value with the codec named in the record metadata,
    /// looked up through the loader that produced the record.
    pub fn return_value(&self) -> Result<Option<Value>, LabError> {
        let Some(name) = self.meta.codec.as_deref() else {
            return Ok(None);
        };
        let codec = match &self.payload.loader {
            Some(loader) => loader.codec(name),
            None => builtin_codec(name),
        };
        let codec = codec.ok_or_else(|| {
            LabError::Serialization(format!(
                "record {} {} uses unknown codec `{name}`",
                self.meta.experiment_id,
                self.label()
            ))
        })?;
        self.decode_with(codec.as_ref())
    }

    pub fn decode_with(&self, codec: &dyn ResultCodec) -> Result<Option<Value>, LabError> {
        match self.result_bytes()? {
            Some(bytes) => codec.decode(bytes).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader {
        result_loads: AtomicUsize,
        artifact_loads: AtomicUsize,
    }

    impl PayloadLoader for CountingLoader {
        fn load_result(&self, _: &str, _: u64) -> Result<Option<Vec<u8>>, LabError> {
            self.result_loads.fetch_add(1, Ordering::SeqCst);
            Ok(Some(b"{\"score\":1}".to_vec()))
        }

        fn load_artifacts(&self, _: &str, _: u64) -> Result<Vec<Artifact>, LabError> {
            self.artifact_loads.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Artifact::text("plot")])
        }
    }

    fn meta(status: RunStatus) -> RecordMeta {
        RecordMeta {
            experiment_id: "walk".to_string(),
            run_id: 3,
            status,
            args: Arguments::new(),
            console: "hello\n".to_string(),
            failure: None,
            codec: Some("json".to_string()),
            artifact_count: 1,
            created_at_ms: 10,
            finished_at_ms: Some(11),
            orphaned: false,
        }
    }

    #[test]
    fn heavy_fields_load_once_on_first_access() {
        let loader = Arc::new(CountingLoader {
            result_loads: AtomicUsize::new(0),
            artifact_loads: AtomicUsize::new(0),
        });
        let record = Record::lazy(meta(RunStatus::Completed), loader.clone());
        assert!(!record.heavy_fields_loaded());
        assert_eq!(loader.result_loads.load(Ordering::SeqCst), 0);

        assert_eq!(record.return_value().expect("value"), Some(json!({"score": 1})));
        assert_eq!(record.return_value().expect("value"), Some(json!({"score": 1})));
        assert_eq!(loader.result_loads.load(Ordering::SeqCst), 1);

        let clone = record.clone();
        assert_eq!(clone.artifacts().expect("artifacts").len(), 1);
        assert_eq!(record.artifacts().expect("artifacts").len(), 1);
        assert_eq!(loader.artifact_loads.load(Ordering::SeqCst), 1);
        assert!(record.heavy_fields_loaded());
    }

    #[test]
    fn failed_records_never_ask_for_a_result() {
        let loader = Arc::new(CountingLoader {
            result_loads: AtomicUsize::new(0),
            artifact_loads: AtomicUsize::new(0),
        });
        let mut failed = meta(RunStatus::Failed);
        failed.codec = None;
        failed.failure = Some(FailureInfo {
            message: "boom".to_string(),
            trace: "boom".to_string(),
            cancelled: true,
        });
        let record = Record::lazy(failed, loader.clone());
        assert_eq!(record.result_bytes().expect("bytes"), None);
        assert_eq!(record.return_value().expect("value"), None);
        assert!(record.is_cancelled());
        assert_eq!(loader.result_loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn loaded_records_decode_with_explicit_codec() {
        let record = Record::loaded(
            meta(RunStatus::Completed),
            Some(b"[1,2]".to_vec()),
            Vec::new(),
        );
        assert_eq!(record.decode_with(&JsonCodec).expect("decode"), Some(json!([1, 2])));
        assert_eq!(record.label(), "#3");
    }

    #[test]
    fn unknown_codec_is_reported() {
        let mut custom = meta(RunStatus::Completed);
        custom.codec = Some("msgpack".to_string());
        let record = Record::loaded(custom, Some(vec![1, 2]), Vec::new());
        assert!(matches!(
            record.return_value(),
            Err(LabError::Serialization(message)) if message.contains("msgpack")
        ));
    }

    #[test]
    fn artifact_digest_and_text_views() {
        let artifact = Artifact::text("abc");
        assert_eq!(
            artifact.digest(),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(artifact.as_text(), Some("abc"));
        assert_eq!(Artifact::new("image/png", vec![0u8, 1]).as_text(), None);
        let json_artifact = Artifact::json(&json!({"a": 1})).expect("json");
        assert_eq!(json_artifact.type_tag(), "application/json");
        assert_eq!(json_artifact.as_text(), Some("{\"a\":1}"));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(RunStatus::from_db(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::from_db("paused"), None);
    }
}
