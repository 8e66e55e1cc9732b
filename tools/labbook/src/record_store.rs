use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::codec::{CodecRegistry, ResultCodec};
use crate::errors::LabError;
use crate::logging::append_run_log;
use crate::record::{
    sha256_digest, Artifact, FailureInfo, PayloadLoader, Record, RecordMeta, RunOutcome,
    RunStatus,
};
use crate::runtime::{unix_millis, Clock, ProductionClock};
use crate::types::{canonical_arguments_json, Arguments};

const READ_POOL_SIZE: usize = 4;
const INTERRUPTED_MESSAGE: &str = "interrupted: the process exited before the run finished";
const META_COLUMNS: &str = "experiment_id, run_id, status, args_json, console, error_message, \
                            error_trace, cancelled, codec, artifact_count, created_at, \
                            finished_at, orphaned";

type StoreResult<T> = Result<T, LabError>;

/// A record allocated by [`RecordStore::begin`] and not yet finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHandle {
    experiment_id: String,
    run_id: u64,
    args: Arguments,
    created_at_ms: i64,
}

impl RecordHandle {
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn args(&self) -> &Arguments {
        &self.args
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }
}

#[derive(Debug)]
enum WriteCmd {
    Begin {
        experiment_id: String,
        args_json: String,
        now: i64,
        reply: oneshot::Sender<StoreResult<u64>>,
    },
    Finalize {
        experiment_id: String,
        run_id: u64,
        outcome: RunOutcome,
        console: String,
        artifacts: Vec<Artifact>,
        now: i64,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    Delete {
        experiment_id: String,
        run_id: u64,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    DeleteExperiments {
        experiment_ids: Vec<String>,
        reply: oneshot::Sender<StoreResult<usize>>,
    },
    MarkOrphaned {
        experiment_ids: Vec<String>,
        reply: oneshot::Sender<StoreResult<usize>>,
    },
    RecoverInterrupted {
        now: i64,
        reply: oneshot::Sender<StoreResult<usize>>,
    },
}

pub struct RecordStore {
    write_tx: Option<mpsc::Sender<WriteCmd>>,
    read_pool: ReadPool,
    loader: Arc<dyn PayloadLoader>,
    codecs: CodecRegistry,
    writer_join: Option<thread::JoinHandle<()>>,
    db_path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        // Closing the sender ends the writer loop; joining flushes in-flight writes.
        drop(self.write_tx.take());
        if let Some(handle) = self.writer_join.take() {
            let _ = handle.join();
        }
    }
}

impl RecordStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_clock(path, Arc::new(ProductionClock))
    }

    pub fn open_with_clock(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        append_run_log(
            "info",
            "record_store.open",
            json!({ "path": path.display().to_string() }),
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LabError::Database(e.to_string()))?;
        }

        let existed_before_open = path.exists();

        // Zero-byte files are left behind by an interrupted create.
        if existed_before_open {
            let meta =
                std::fs::metadata(&path).map_err(|e| LabError::Database(e.to_string()))?;
            if meta.len() == 0 {
                return Err(LabError::Database(format!(
                    "record database is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let mut write_conn = Connection::open(&path).map_err(db_err)?;
        configure_write_connection(&write_conn)?;

        if existed_before_open {
            let integrity: String = write_conn
                .pragma_query_value(None, "quick_check", |row| row.get(0))
                .map_err(db_err)?;
            if integrity != "ok" {
                return Err(LabError::Database(format!(
                    "record database failed integrity check: {integrity}"
                )));
            }
        }

        run_migrations(&mut write_conn, unix_millis(clock.now()))?;

        let (write_tx, mut write_rx) = mpsc::channel(128);
        let writer_join = thread::spawn(move || {
            while let Some(cmd) = write_rx.blocking_recv() {
                match cmd {
                    WriteCmd::Begin {
                        experiment_id,
                        args_json,
                        now,
                        reply,
                    } => {
                        let result = begin_record(&mut write_conn, &experiment_id, &args_json, now);
                        let _ = reply.send(result);
                    }
                    WriteCmd::Finalize {
                        experiment_id,
                        run_id,
                        outcome,
                        console,
                        artifacts,
                        now,
                        reply,
                    } => {
                        let result = finalize_record(
                            &mut write_conn,
                            &experiment_id,
                            run_id,
                            &outcome,
                            &console,
                            &artifacts,
                            now,
                        );
                        let _ = reply.send(result);
                    }
                    WriteCmd::Delete {
                        experiment_id,
                        run_id,
                        reply,
                    } => {
                        let result = delete_record(&mut write_conn, &experiment_id, run_id);
                        let _ = reply.send(result);
                    }
                    WriteCmd::DeleteExperiments {
                        experiment_ids,
                        reply,
                    } => {
                        let result = delete_experiment_records(&mut write_conn, &experiment_ids);
                        let _ = reply.send(result);
                    }
                    WriteCmd::MarkOrphaned {
                        experiment_ids,
                        reply,
                    } => {
                        let result = mark_orphaned(&mut write_conn, &experiment_ids);
                        let _ = reply.send(result);
                    }
                    WriteCmd::RecoverInterrupted { now, reply } => {
                        let result = recover_interrupted(&write_conn, now);
                        let _ = reply.send(result);
                    }
                }
            }
        });

        let read_pool = ReadPool::open(&path, READ_POOL_SIZE)?;
        let codecs = CodecRegistry::with_builtins();
        let loader: Arc<dyn PayloadLoader> = Arc::new(StoreLoader {
            read_pool: read_pool.clone(),
            codecs: codecs.clone(),
        });
        let store = Self {
            write_tx: Some(write_tx),
            read_pool,
            loader,
            codecs,
            writer_join: Some(writer_join),
            db_path: path.clone(),
            clock,
        };
        let recovered = store.recover_interrupted()?;
        append_run_log(
            "info",
            "record_store.opened",
            json!({
                "path": path.display().to_string(),
                "interrupted_recovered": recovered,
            }),
        );

        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Makes records written with `codec` decodable through this store.
    pub fn register_codec(&self, codec: Arc<dyn ResultCodec>) {
        append_run_log(
            "info",
            "record_store.codec_registered",
            json!({ "codec": codec.name() }),
        );
        self.codecs.register(codec);
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    fn now(&self) -> i64 {
        unix_millis(self.clock.now())
    }

    fn submit<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> WriteCmd,
    ) -> StoreResult<T> {
        let sender = self
            .write_tx
            .as_ref()
            .ok_or_else(|| LabError::Database("store is closed".to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .blocking_send(make(reply_tx))
            .map_err(|e| LabError::Database(e.to_string()))?;
        reply_rx
            .blocking_recv()
            .map_err(|e| LabError::Database(e.to_string()))?
    }

    /// Allocates a running record with the next run id for `experiment_id`.
    pub fn begin(&self, experiment_id: &str, args: &Arguments) -> StoreResult<RecordHandle> {
        let args_json = canonical_arguments_json(args)?;
        let now = self.now();
        let experiment = experiment_id.to_string();
        let run_id = self.submit(|reply| WriteCmd::Begin {
            experiment_id: experiment,
            args_json,
            now,
            reply,
        })?;
        append_run_log(
            "info",
            "record_store.begin",
            json!({ "experiment_id": experiment_id, "run_id": run_id }),
        );
        Ok(RecordHandle {
            experiment_id: experiment_id.to_string(),
            run_id,
            args: args.clone(),
            created_at_ms: now,
        })
    }

    /// Publishes the outcome of a run in a single transaction.
    pub fn finalize(
        &self,
        handle: RecordHandle,
        outcome: RunOutcome,
        console: String,
        artifacts: Vec<Artifact>,
    ) -> StoreResult<Record> {
        let status = outcome.status();
        let artifact_count = artifacts.len();
        let now = self.now();
        let result = self.submit(|reply| WriteCmd::Finalize {
            experiment_id: handle.experiment_id.clone(),
            run_id: handle.run_id,
            outcome,
            console,
            artifacts,
            now,
            reply,
        });
        match &result {
            Ok(()) => append_run_log(
                "info",
                "record_store.finalized",
                json!({
                    "experiment_id": handle.experiment_id,
                    "run_id": handle.run_id,
                    "status": status.as_str(),
                    "artifact_count": artifact_count,
                }),
            ),
            Err(e) => append_run_log(
                "error",
                "record_store.finalize.failed",
                json!({
                    "experiment_id": handle.experiment_id,
                    "run_id": handle.run_id,
                    "error": e.to_string(),
                }),
            ),
        }
        result?;
        self.get(&handle.experiment_id, handle.run_id)
    }

    /// Records of `experiment_id`, oldest first.
    pub fn list(&self, experiment_id: &str) -> StoreResult<Vec<Record>> {
        let metas = self.read_pool.with_conn(|conn| {
            let mut statement = conn
                .prepare(&format!(
                    "SELECT {META_COLUMNS} FROM records
                     WHERE experiment_id = ?1
                     ORDER BY created_at ASC, run_id ASC"
                ))
                .map_err(db_err)?;
            let rows = statement
                .query_map([experiment_id], row_to_meta)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })?;
        Ok(metas.into_iter().map(|meta| self.lazy(meta)).collect())
    }

    pub fn latest(&self, experiment_id: &str) -> StoreResult<Option<Record>> {
        let meta = self.read_pool.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {META_COLUMNS} FROM records
                     WHERE experiment_id = ?1 AND orphaned = 0
                     ORDER BY created_at DESC, run_id DESC
                     LIMIT 1"
                ),
                [experiment_id],
                row_to_meta,
            )
            .optional()
            .map_err(db_err)
        })?;
        Ok(meta.map(|meta| self.lazy(meta)))
    }

    pub fn get(&self, experiment_id: &str, run_id: u64) -> StoreResult<Record> {
        let meta = self.read_pool.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {META_COLUMNS} FROM records
                     WHERE experiment_id = ?1 AND run_id = ?2"
                ),
                params![experiment_id, db_run_id(run_id)],
                row_to_meta,
            )
            .optional()
            .map_err(db_err)
        })?;
        meta.map(|meta| self.lazy(meta))
            .ok_or_else(|| LabError::RecordNotFound {
                experiment_id: experiment_id.to_string(),
                run_id,
            })
    }

    /// Newest non-orphaned completed record whose arguments equal `args`.
    pub fn find_completed(
        &self,
        experiment_id: &str,
        args: &Arguments,
    ) -> StoreResult<Option<Record>> {
        let args_json = canonical_arguments_json(args)?;
        let meta = self.read_pool.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {META_COLUMNS} FROM records
                     WHERE experiment_id = ?1 AND status = 'completed'
                       AND args_json = ?2 AND orphaned = 0
                     ORDER BY created_at DESC, run_id DESC
                     LIMIT 1"
                ),
                params![experiment_id, args_json],
                row_to_meta,
            )
            .optional()
            .map_err(db_err)
        })?;
        Ok(meta.map(|meta| self.lazy(meta)))
    }

    /// Every experiment id that currently has at least one record.
    pub fn experiment_ids(&self) -> StoreResult<Vec<String>> {
        self.read_pool.with_conn(|conn| {
            let mut statement = conn
                .prepare("SELECT DISTINCT experiment_id FROM records ORDER BY experiment_id")
                .map_err(db_err)?;
            let rows = statement
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    pub fn delete(&self, experiment_id: &str, run_id: u64) -> StoreResult<()> {
        let experiment = experiment_id.to_string();
        let deleted = self.submit(|reply| WriteCmd::Delete {
            experiment_id: experiment,
            run_id,
            reply,
        })?;
        if !deleted {
            return Err(LabError::RecordNotFound {
                experiment_id: experiment_id.to_string(),
                run_id,
            });
        }
        append_run_log(
            "info",
            "record_store.deleted",
            json!({ "experiment_id": experiment_id, "run_id": run_id }),
        );
        Ok(())
    }

    pub fn delete_experiment(&self, experiment_id: &str) -> StoreResult<usize> {
        self.delete_experiments(&[experiment_id.to_string()])
    }

    /// Deletes every record of every experiment in `experiment_ids` in one
    /// transaction. Either all of them go or none do.
    pub fn delete_experiments(&self, experiment_ids: &[String]) -> StoreResult<usize> {
        if experiment_ids.is_empty() {
            return Ok(0);
        }
        let ids = experiment_ids.to_vec();
        let count = self.submit(|reply| WriteCmd::DeleteExperiments {
            experiment_ids: ids,
            reply,
        })?;
        append_run_log(
            "info",
            "record_store.experiments_deleted",
            json!({ "experiment_ids": experiment_ids, "records": count }),
        );
        Ok(count)
    }

    pub fn mark_orphaned(&self, experiment_ids: &[String]) -> StoreResult<usize> {
        if experiment_ids.is_empty() {
            return Ok(0);
        }
        let ids = experiment_ids.to_vec();
        let count = self.submit(|reply| WriteCmd::MarkOrphaned {
            experiment_ids: ids,
            reply,
        })?;
        append_run_log(
            "info",
            "record_store.orphaned",
            json!({ "experiments": experiment_ids.len(), "records": count }),
        );
        Ok(count)
    }

    /// Marks records still `running` from a previous process as failed.
    pub fn recover_interrupted(&self) -> StoreResult<usize> {
        let now = self.now();
        let result = self.submit(|reply| WriteCmd::RecoverInterrupted { now, reply });
        match &result {
            Ok(count) if *count > 0 => {
                append_run_log(
                    "warn",
                    "record_store.interrupted.recovered",
                    json!({ "count": count }),
                );
            }
            Ok(_) => {}
            Err(e) => {
                append_run_log(
                    "error",
                    "record_store.interrupted.recovery_failed",
                    json!({ "error": e.to_string() }),
                );
            }
        }
        result
    }

    fn lazy(&self, meta: RecordMeta) -> Record {
        Record::lazy(meta, Arc::clone(&self.loader))
    }
}

struct StoreLoader {
    read_pool: ReadPool,
    codecs: CodecRegistry,
}

impl PayloadLoader for StoreLoader {
    fn codec(&self, name: &str) -> Option<Arc<dyn ResultCodec>> {
        self.codecs.get(name)
    }

    fn load_result(&self, experiment_id: &str, run_id: u64) -> StoreResult<Option<Vec<u8>>> {
        let row = self.read_pool.with_conn(|conn| {
            conn.query_row(
                "SELECT digest, data FROM record_blobs
                 WHERE experiment_id = ?1 AND run_id = ?2 AND kind = 'result' AND ordinal = 0",
                params![experiment_id, db_run_id(run_id)],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()
            .map_err(db_err)
        })?;
        match row {
            Some((digest, data)) => {
                verify_digest(experiment_id, run_id, "result", &digest, &data)?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    fn load_artifacts(&self, experiment_id: &str, run_id: u64) -> StoreResult<Vec<Artifact>> {
        let rows = self.read_pool.with_conn(|conn| {
            let mut statement = conn
                .prepare(
                    "SELECT type_tag, digest, data FROM record_blobs
                     WHERE experiment_id = ?1 AND run_id = ?2 AND kind = 'artifact'
                     ORDER BY ordinal ASC",
                )
                .map_err(db_err)?;
            let rows = statement
                .query_map(params![experiment_id, db_run_id(run_id)], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(type_tag, digest, data)| {
                verify_digest(experiment_id, run_id, &type_tag, &digest, &data)?;
                Ok(Artifact::new(type_tag, data))
            })
            .collect()
    }
}

fn verify_digest(
    experiment_id: &str,
    run_id: u64,
    what: &str,
    expected: &str,
    data: &[u8],
) -> StoreResult<()> {
    let actual = sha256_digest(data);
    if actual != expected {
        return Err(LabError::Database(format!(
            "digest mismatch for {what} of {experiment_id} #{run_id}: expected {expected}, got {actual}"
        )));
    }
    Ok(())
}

#[derive(Clone)]
struct ReadPool {
    conns: Arc<Vec<Mutex<Connection>>>,
    next: Arc<AtomicUsize>,
}

impl ReadPool {
    fn open(path: &Path, size: usize) -> StoreResult<Self> {
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(db_err)?;
            conn.busy_timeout(Duration::from_secs(3)).map_err(db_err)?;
            conns.push(Mutex::new(conn));
        }

        Ok(Self {
            conns: Arc::new(conns),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        let guard = self.conns[idx]
            .lock()
            .map_err(|_| LabError::Database("read connection lock poisoned".to_string()))?;
        f(&guard)
    }
}

fn configure_write_connection(conn: &Connection) -> StoreResult<()> {
    let mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .map_err(db_err)?;
    if !mode.eq_ignore_ascii_case("wal") {
        return Err(LabError::Database(format!(
            "could not enable WAL journal (got {mode})"
        )));
    }
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection, now: i64) -> StoreResult<()> {
    let migrations = [(1_i64, include_str!("../migrations/0001_records.sql"))];

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL);",
    )
    .map_err(db_err)?;

    for (version, sql) in migrations {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();

        if exists {
            continue;
        }

        append_run_log(
            "info",
            "record_store.migration.applying",
            json!({ "version": version }),
        );
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
    }

    Ok(())
}

fn begin_record(
    conn: &mut Connection,
    experiment_id: &str,
    args_json: &str,
    now: i64,
) -> StoreResult<u64> {
    let tx = conn.transaction().map_err(db_err)?;
    let last = tx
        .query_row(
            "SELECT last_run_id FROM run_counters WHERE experiment_id = ?1",
            [experiment_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(db_err)?;
    let run_id = last.unwrap_or(0).saturating_add(1);
    tx.execute(
        "INSERT INTO run_counters (experiment_id, last_run_id) VALUES (?1, ?2)
         ON CONFLICT(experiment_id) DO UPDATE SET last_run_id = excluded.last_run_id",
        params![experiment_id, run_id],
    )
    .map_err(db_err)?;
    tx.execute(
        "INSERT INTO records (experiment_id, run_id, status, args_json, created_at)
         VALUES (?1, ?2, 'running', ?3, ?4)",
        params![experiment_id, run_id, args_json, now],
    )
    .map_err(db_err)?;
    tx.commit().map_err(db_err)?;
    u64::try_from(run_id).map_err(|e| LabError::Database(e.to_string()))
}

fn finalize_record(
    conn: &mut Connection,
    experiment_id: &str,
    run_id: u64,
    outcome: &RunOutcome,
    console: &str,
    artifacts: &[Artifact],
    now: i64,
) -> StoreResult<()> {
    let key = db_run_id(run_id);
    let tx = conn.transaction().map_err(db_err)?;
    let status = tx
        .query_row(
            "SELECT status FROM records WHERE experiment_id = ?1 AND run_id = ?2",
            params![experiment_id, key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(db_err)?;
    match status.as_deref() {
        None => {
            return Err(LabError::RecordNotFound {
                experiment_id: experiment_id.to_string(),
                run_id,
            })
        }
        Some("running") => {}
        Some(other) => {
            return Err(LabError::InvalidState(format!(
                "record {experiment_id} #{run_id} is already {other}"
            )))
        }
    }

    let (codec, error_message, error_trace, cancelled) = match outcome {
        RunOutcome::Completed { codec, bytes } => {
            tx.execute(
                "INSERT INTO record_blobs (experiment_id, run_id, kind, ordinal, type_tag, digest, data)
                 VALUES (?1, ?2, 'result', 0, ?3, ?4, ?5)",
                params![experiment_id, key, codec, sha256_digest(bytes), bytes],
            )
            .map_err(db_err)?;
            (Some(codec.as_str()), None, None, false)
        }
        RunOutcome::Failed(failure) => (
            None,
            Some(failure.message.as_str()),
            Some(failure.trace.as_str()),
            failure.cancelled,
        ),
    };

    for (ordinal, artifact) in artifacts.iter().enumerate() {
        tx.execute(
            "INSERT INTO record_blobs (experiment_id, run_id, kind, ordinal, type_tag, digest, data)
             VALUES (?1, ?2, 'artifact', ?3, ?4, ?5, ?6)",
            params![
                experiment_id,
                key,
                ordinal as i64,
                artifact.type_tag(),
                artifact.digest(),
                artifact.bytes()
            ],
        )
        .map_err(db_err)?;
    }

    tx.execute(
        "UPDATE records
         SET status = ?3, console = ?4, error_message = ?5, error_trace = ?6, cancelled = ?7,
             codec = ?8, artifact_count = ?9, finished_at = ?10
         WHERE experiment_id = ?1 AND run_id = ?2",
        params![
            experiment_id,
            key,
            outcome.status().as_str(),
            console,
            error_message,
            error_trace,
            cancelled,
            codec,
            artifacts.len() as i64,
            now
        ],
    )
    .map_err(db_err)?;
    tx.commit().map_err(db_err)
}

fn delete_record(conn: &mut Connection, experiment_id: &str, run_id: u64) -> StoreResult<bool> {
    let key = db_run_id(run_id);
    let tx = conn.transaction().map_err(db_err)?;
    tx.execute(
        "DELETE FROM record_blobs WHERE experiment_id = ?1 AND run_id = ?2",
        params![experiment_id, key],
    )
    .map_err(db_err)?;
    let changed = tx
        .execute(
            "DELETE FROM records WHERE experiment_id = ?1 AND run_id = ?2",
            params![experiment_id, key],
        )
        .map_err(db_err)?;
    tx.commit().map_err(db_err)?;
    Ok(changed > 0)
}

fn delete_experiment_records(
    conn: &mut Connection,
    experiment_ids: &[String],
) -> StoreResult<usize> {
    let tx = conn.transaction().map_err(db_err)?;
    let mut changed = 0usize;
    for experiment_id in experiment_ids {
        tx.execute(
            "DELETE FROM record_blobs WHERE experiment_id = ?1",
            [experiment_id],
        )
        .map_err(db_err)?;
        changed += tx
            .execute("DELETE FROM records WHERE experiment_id = ?1", [experiment_id])
            .map_err(db_err)?;
    }
    tx.commit().map_err(db_err)?;
    Ok(changed)
}

fn mark_orphaned(conn: &mut Connection, experiment_ids: &[String]) -> StoreResult<usize> {
    let tx = conn.transaction().map_err(db_err)?;
    let mut changed = 0usize;
    for experiment_id in experiment_ids {
        changed += tx
            .execute(
                "UPDATE records SET orphaned = 1 WHERE experiment_id = ?1 AND orphaned = 0",
                [experiment_id],
            )
            .map_err(db_err)?;
    }
    tx.commit().map_err(db_err)?;
    Ok(changed)
}

fn recover_interrupted(conn: &Connection, now: i64) -> StoreResult<usize> {
    conn.execute(
        "UPDATE records
         SET status = 'failed', error_message = ?1, error_trace = '', finished_at = ?2
         WHERE status = 'running'",
        params![INTERRUPTED_MESSAGE, now],
    )
    .map_err(db_err)
}

fn row_to_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordMeta> {
    let run_id = row.get::<_, i64>(1)?;
    let status = row.get::<_, String>(2)?;
    let args_json = row.get::<_, String>(3)?;
    let status = RunStatus::from_db(&status).ok_or_else(|| conversion_error(2, "invalid status"))?;
    let args = serde_json::from_str::<Arguments>(&args_json)
        .map_err(|_| conversion_error(3, "invalid args_json"))?;
    let error_message = row.get::<_, Option<String>>(5)?;
    let error_trace = row.get::<_, Option<String>>(6)?;
    let cancelled = row.get::<_, bool>(7)?;
    let failure = (status == RunStatus::Failed).then(|| FailureInfo {
        message: error_message.unwrap_or_default(),
        trace: error_trace.unwrap_or_default(),
        cancelled,
    });
    let artifact_count = row.get::<_, i64>(9)?;

    Ok(RecordMeta {
        experiment_id: row.get(0)?,
        run_id: u64::try_from(run_id).map_err(|_| conversion_error(1, "negative run_id"))?,
        status,
        args,
        console: row.get(4)?,
        failure,
        codec: row.get(8)?,
        artifact_count: usize::try_from(artifact_count).unwrap_or_default(),
        created_at_ms: row.get(10)?,
        finished_at_ms: row.get(11)?,
        orphaned: row.get(12)?,
    })
}

fn conversion_error(column: usize, message: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.to_string(),
        )),
    )
}

fn db_run_id(run_id: u64) -> i64 {
    i64::try_from(run_id).unwrap_or(i64::MAX)
}

fn db_err(error: rusqlite::Error) -> LabError {
    LabError::Database(error.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, UNIX_EPOCH};

    use rusqlite::{params, Connection};
    use serde_json::json;
    use tempfile::TempDir;

    use super::{RecordStore, INTERRUPTED_MESSAGE};
    use crate::errors::LabError;
    use crate::record::{Artifact, FailureInfo, RunOutcome, RunStatus};
    use crate::runtime::FakeClock;
    use crate::types::Arguments;

    fn temp_store() -> (RecordStore, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("records.sqlite");
        let clock = FakeClock::ticking(UNIX_EPOCH, Duration::from_millis(1));
        (
            RecordStore::open_with_clock(&db, Arc::new(clock)).expect("open store"),
            dir,
        )
    }

    fn args(value: i64) -> Arguments {
        let mut args = Arguments::new();
        args.insert("n".to_string(), json!(value));
        args
    }

    fn completed(value: &serde_json::Value) -> RunOutcome {
        RunOutcome::Completed {
            codec: "json".to_string(),
            bytes: serde_json::to_vec(value).expect("encode"),
        }
    }

    #[test]
    fn begin_then_finalize_round_trips_every_field() {
        let (store, _dir) = temp_store();
        let handle = store.begin("walk", &args(3)).expect("begin");
        assert_eq!(handle.run_id(), 1);

        let running = store.get("walk", 1).expect("running record");
        assert_eq!(running.status(), RunStatus::Running);

        let record = store
            .finalize(
                handle,
                completed(&json!({"distance": 2.5})),
                "step 1\nstep 2\n".to_string(),
                vec![Artifact::new("text/csv", b"x,y\n0,1\n".to_vec()), Artifact::text("note")],
            )
            .expect("finalize");

        assert_eq!(record.status(), RunStatus::Completed);
        assert_eq!(record.console(), "step 1\nstep 2\n");
        assert_eq!(record.args(), &args(3));
        assert!(!record.heavy_fields_loaded());
        assert_eq!(record.return_value().expect("value"), Some(json!({"distance": 2.5})));
        let artifacts = record.artifacts().expect("artifacts");
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].type_tag(), "text/csv");
        assert_eq!(artifacts[1].as_text(), Some("note"));
        assert!(record.finished_at_ms().is_some());
    }

    #[test]
    fn failed_outcome_keeps_error_and_partial_console() {
        let (store, _dir) = temp_store();
        let handle = store.begin("walk", &args(1)).expect("begin");
        let record = store
            .finalize(
                handle,
                RunOutcome::Failed(FailureInfo {
                    message: "diverged".to_string(),
                    trace: "diverged\n  at step 4".to_string(),
                    cancelled: false,
                }),
                "partial".to_string(),
                Vec::new(),
            )
            .expect("finalize");
        assert_eq!(record.status(), RunStatus::Failed);
        assert_eq!(record.console(), "partial");
        let failure = record.failure().expect("failure");
        assert_eq!(failure.message, "diverged");
        assert!(failure.trace.contains("step 4"));
        assert_eq!(record.return_value().expect("no value"), None);
    }

    #[test]
    fn run_ids_increase_and_are_never_reused() {
        let (store, _dir) = temp_store();
        for _ in 0..3 {
            let handle = store.begin("walk", &args(0)).expect("begin");
            store
                .finalize(handle, completed(&json!(null)), String::new(), Vec::new())
                .expect("finalize");
        }
        store.delete("walk", 3).expect("delete newest");
        let next = store.begin("walk", &args(0)).expect("begin");
        assert_eq!(next.run_id(), 4);
        let other = store.begin("other", &args(0)).expect("begin other");
        assert_eq!(other.run_id(), 1);

        let ids = store
            .list("walk")
            .expect("list")
            .iter()
            .map(|r| r.run_id())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 4]);
    }

    #[test]
    fn concurrent_begins_get_distinct_run_ids() {
        let (store, _dir) = temp_store();
        let store = Arc::new(store);
        let mut joins = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            joins.push(thread::spawn(move || {
                store.begin("walk", &Arguments::new()).expect("begin").run_id()
            }));
        }
        let ids = joins
            .into_iter()
            .map(|join| join.join().expect("join"))
            .collect::<HashSet<_>>();
        assert_eq!(ids.len(), 16);
        assert_eq!(ids.iter().max(), Some(&16));
    }

    #[test]
    fn finalizing_twice_is_rejected() {
        let (store, _dir) = temp_store();
        let handle = store.begin("walk", &args(0)).expect("begin");
        store
            .finalize(handle.clone(), completed(&json!(1)), String::new(), Vec::new())
            .expect("first");
        let err = store
            .finalize(handle, completed(&json!(2)), String::new(), Vec::new())
            .expect_err("second");
        assert!(matches!(err, LabError::InvalidState(message) if message.contains("completed")));
        assert_eq!(
            store.get("walk", 1).expect("get").return_value().expect("value"),
            Some(json!(1))
        );
    }

    #[test]
    fn missing_records_report_record_not_found() {
        let (store, _dir) = temp_store();
        assert!(matches!(
            store.get("walk", 9),
            Err(LabError::RecordNotFound { run_id: 9, .. })
        ));
        assert!(matches!(
            store.delete("walk", 9),
            Err(LabError::RecordNotFound { .. })
        ));
        assert!(store.latest("walk").expect("latest").is_none());
    }

    #[test]
    fn find_completed_matches_arguments_and_skips_orphans() {
        let (store, _dir) = temp_store();
        let first = store.begin("walk", &args(1)).expect("begin");
        store
            .finalize(first, completed(&json!("one")), String::new(), Vec::new())
            .expect("finalize");
        let second = store.begin("walk", &args(2)).expect("begin");
        store
            .finalize(second, completed(&json!("two")), String::new(), Vec::new())
            .expect("finalize");

        let hit = store
            .find_completed("walk", &args(1))
            .expect("query")
            .expect("cached");
        assert_eq!(hit.run_id(), 1);
        assert!(store.find_completed("walk", &args(5)).expect("query").is_none());

        assert_eq!(store.mark_orphaned(&["walk".to_string()]).expect("orphan"), 2);
        assert!(store.find_completed("walk", &args(1)).expect("query").is_none());
        assert!(store.get("walk", 1).expect("still there").is_orphaned());
        assert_eq!(store.experiment_ids().expect("ids"), vec!["walk".to_string()]);
    }

    #[test]
    fn latest_ignores_orphaned_records() {
        let (store, _dir) = temp_store();
        let old = store.begin("walk", &args(1)).expect("begin");
        store
            .finalize(old, completed(&json!("old")), String::new(), Vec::new())
            .expect("finalize");
        assert_eq!(store.latest("walk").expect("latest").expect("record").run_id(), 1);

        store.mark_orphaned(&["walk".to_string()]).expect("orphan");
        assert!(store.latest("walk").expect("latest").is_none());
        assert_eq!(store.list("walk").expect("list").len(), 1);

        let fresh = store.begin("walk", &args(1)).expect("begin");
        store
            .finalize(fresh, completed(&json!("fresh")), String::new(), Vec::new())
            .expect("finalize");
        let latest = store.latest("walk").expect("latest").expect("record");
        assert_eq!(latest.run_id(), 2);
        assert!(!latest.is_orphaned());
    }

    #[test]
    fn delete_experiments_removes_all_ids_together() {
        let (store, _dir) = temp_store();
        for id in ["walk", "walk.n=2", "swim"] {
            let handle = store.begin(id, &args(0)).expect("begin");
            store
                .finalize(handle, completed(&json!(0)), String::new(), Vec::new())
                .expect("finalize");
        }
        let subtree = vec!["walk".to_string(), "walk.n=2".to_string()];
        assert_eq!(store.delete_experiments(&subtree).expect("delete"), 2);
        assert!(store.list("walk").expect("list").is_empty());
        assert!(store.list("walk.n=2").expect("list").is_empty());
        assert_eq!(store.list("swim").expect("list").len(), 1);
        assert_eq!(store.delete_experiments(&[]).expect("noop"), 0);
    }

    #[test]
    fn delete_experiment_removes_every_record_and_blob() {
        let (store, dir) = temp_store();
        for _ in 0..2 {
            let handle = store.begin("walk", &args(0)).expect("begin");
            store
                .finalize(handle, completed(&json!(0)), String::new(), vec![Artifact::text("a")])
                .expect("finalize");
        }
        assert_eq!(store.delete_experiment("walk").expect("delete"), 2);
        assert!(store.list("walk").expect("list").is_empty());

        let conn = Connection::open(dir.path().join("records.sqlite")).expect("open");
        let blobs: i64 = conn
            .query_row("SELECT COUNT(*) FROM record_blobs", [], |row| row.get(0))
            .expect("count");
        assert_eq!(blobs, 0);
    }

    #[test]
    fn reopen_marks_interrupted_runs_failed() {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("records.sqlite");
        {
            let store = RecordStore::open(&db).expect("open");
            let _handle = store.begin("walk", &Arguments::new()).expect("begin");
            // dropped without finalize, as a crash would leave it
        }
        let reopened = RecordStore::open(&db).expect("reopen");
        let record = reopened.get("walk", 1).expect("record");
        assert_eq!(record.status(), RunStatus::Failed);
        assert_eq!(
            record.failure().map(|f| f.message.as_str()),
            Some(INTERRUPTED_MESSAGE)
        );
    }

    #[test]
    fn tampered_artifact_fails_digest_check() {
        let (store, dir) = temp_store();
        let handle = store.begin("walk", &args(0)).expect("begin");
        store
            .finalize(
                handle,
                completed(&json!(0)),
                String::new(),
                vec![Artifact::text("original")],
            )
            .expect("finalize");

        let conn = Connection::open(dir.path().join("records.sqlite")).expect("open");
        conn.execute(
            "UPDATE record_blobs SET data = ?1 WHERE kind = 'artifact'",
            params![b"tampered".to_vec()],
        )
        .expect("tamper");

        let record = store.get("walk", 1).expect("record");
        assert!(matches!(
            record.artifacts(),
            Err(LabError::Database(message)) if message.contains("digest mismatch")
        ));
    }

    #[test]
    fn open_rejects_zero_byte_file() {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("records.sqlite");
        std::fs::write(&db, b"").expect("create zero-byte file");
        match RecordStore::open(&db) {
            Err(LabError::Database(msg)) => {
                assert!(msg.contains("0 bytes"), "unexpected message: {msg}");
            }
            Err(e) => panic!("expected Database error, got: {e}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }

    #[test]
    fn open_rejects_corrupt_file() {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("records.sqlite");
        std::fs::write(&db, b"this is not a sqlite database at all").expect("write garbage");
        assert!(matches!(RecordStore::open(&db), Err(LabError::Database(_))));
    }

    #[test]
    fn drop_flushes_pending_writes() {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("records.sqlite");
        {
            let store = RecordStore::open(&db).expect("open store");
            let handle = store.begin("walk", &args(0)).expect("begin");
            store
                .finalize(handle, completed(&json!("kept")), String::new(), Vec::new())
                .expect("finalize");
        }
        let reopened = RecordStore::open(&db).expect("reopen");
        let records = reopened.list("walk").expect("list");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].return_value().expect("value"), Some(json!("kept")));
    }
}
