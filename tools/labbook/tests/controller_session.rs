use labbook::codec::{JsonCodec, ResultCodec};
use labbook::controller::{Controller, ControllerOptions, ControllerState};
use labbook::demos::register_demos;
use labbook::engine::ExecutionEngine;
use labbook::errors::LabError;
use labbook::lab::Lab;
use labbook::record_store::RecordStore;
use labbook::run_with_runtime;
use labbook::runtime::{FakeClock, FakeTerminal, LabRuntime, ProductionFileSystem};
use std::ffi::OsString;
use std::sync::Arc;

fn demo_lab() -> (tempfile::TempDir, Lab) {
    let dir = tempfile::tempdir().expect("tempdir");
    let lab = Lab::open_at(dir.path().join("records.sqlite")).expect("open lab");
    register_demos(lab.registry()).expect("register demos");
    (dir, lab)
}

fn session(lab: &Lab, lines: &[&str]) -> (FakeTerminal, labbook::controller::ControllerSummary) {
    let terminal = FakeTerminal::scripted(lines.iter().copied());
    let mut controller = Controller::new(lab, &terminal, ControllerOptions::default());
    let summary = controller.run().expect("session");
    assert_eq!(controller.state(), ControllerState::Terminated);
    (terminal, summary)
}

#[test]
fn run_show_and_compare_use_the_experiment_hooks() {
    let (_dir, lab) = demo_lab();
    let (terminal, summary) = session(
        &lab,
        &[
            "list",
            "run 0",
            "run 1-2 n_steps=50",
            "show drunkards_walk",
            "compare 0-2",
            "quit",
            "list",
        ],
    );

    assert_eq!(summary.runs, 3);
    assert_eq!(summary.failed_runs, 0);
    assert_eq!(summary.command_errors, 0);
    let output = terminal.output();
    assert!(output.contains("0 record(s)  last: -"));
    assert!(output.contains("experiment_id=drunkards_walk state=completed message=#1"));
    assert!(output.contains(
        "experiment_id=drunkards_walk.homing_instinct=0.1 state=completed message=#1"
    ));
    assert!(output.contains("drunkards_walk #1 (homing_instinct=0.0) [completed]"));
    assert!(output.contains("homing_instinct  final_distance  record"));

    let variant = lab
        .store()
        .latest("drunkards_walk.homing_instinct=0.01")
        .expect("latest")
        .expect("record");
    assert_eq!(variant.args()["n_steps"], serde_json::json!(50));
    assert_eq!(
        variant.return_value().expect("decode").expect("value")["steps"],
        serde_json::json!(50)
    );
    // Input after `quit` is never read.
    assert_eq!(terminal.prompts().len(), 6);
}

#[test]
fn bad_commands_are_reported_and_the_loop_continues() {
    let (_dir, lab) = demo_lab();
    let (terminal, summary) = session(
        &lab,
        &["launch 0", "run 9", "run 0 bogus=1", "show", "", "list"],
    );

    assert_eq!(summary.command_errors, 4);
    assert_eq!(summary.runs, 0);
    let errors = terminal
        .written_lines()
        .into_iter()
        .filter(|line| line.starts_with("error: "))
        .collect::<Vec<_>>();
    assert_eq!(errors.len(), 4);
    assert!(errors[0].contains("unknown command"));
    assert!(errors[1].contains("selector resolution failed"));
    assert!(terminal.output().contains("demo_error"));
    assert!(lab.store().list("drunkards_walk").expect("list").is_empty());
}

#[test]
fn failed_runs_are_recorded_without_ending_the_session() {
    let (_dir, lab) = demo_lab();
    let (terminal, summary) = session(&lab, &["run demo_error", "run demo_error fail_after=1", "records 3"]);

    assert_eq!(summary.runs, 2);
    assert_eq!(summary.failed_runs, 2);
    let output = terminal.output();
    assert!(output.contains(
        "experiment_id=demo_error state=failed message=#1 demo failure after 3 steps"
    ));
    assert!(output.contains("#2"));
    let first = lab.store().get("demo_error", 1).expect("record");
    assert_eq!(
        first.console(),
        "working on step 0\nworking on step 1\nworking on step 2\n"
    );
}

#[test]
fn delete_requires_the_confirmation_token() {
    let (_dir, lab) = demo_lab();
    let (terminal, summary) = session(
        &lab,
        &[
            "run 0",
            "run 0",
            "delete 0",
            "no",
            "delete 0 #1",
            "yes",
            "records 0",
        ],
    );

    assert_eq!(summary.deleted_records, 1);
    let output = terminal.output();
    assert!(output.contains("about to delete 2 record(s)"));
    assert!(output.contains("delete cancelled"));
    assert!(output.contains("deleted 1 record(s)"));
    assert!(terminal
        .prompts()
        .iter()
        .any(|prompt| prompt == "confirm [yes]> "));

    let remaining = lab.store().list("drunkards_walk").expect("list");
    assert_eq!(
        remaining.iter().map(|record| record.run_id()).collect::<Vec<_>>(),
        vec![2]
    );
}

#[test]
fn deleting_all_records_keeps_the_experiment_listed() {
    let (_dir, lab) = demo_lab();
    let (terminal, _) = session(&lab, &["run 3", "delete demo_error", "yes", "list"]);

    assert!(lab.store().list("demo_error").expect("list").is_empty());
    assert!(lab.registry().contains("demo_error"));
    let listing = terminal
        .written_lines()
        .into_iter()
        .find(|line| line.trim_start().starts_with("3  demo_error"))
        .expect("demo_error still listed");
    assert!(listing.contains("0 record(s)"));
}

#[test]
fn end_of_input_during_confirmation_deletes_nothing() {
    let (_dir, lab) = demo_lab();
    let (_terminal, summary) = session(&lab, &["run 3", "delete 3"]);
    assert_eq!(summary.deleted_records, 0);
    assert_eq!(lab.store().list("demo_error").expect("list").len(), 1);
}

#[test]
fn list_reports_records_orphaned_by_clear_all() {
    let (_dir, lab) = demo_lab();
    let (_terminal, _) = session(&lab, &["run 0"]);

    lab.registry().clear_all().expect("clear");
    register_demos(lab.registry()).expect("register again");
    let (terminal, _) = session(&lab, &["list"]);

    let lines = terminal.written_lines();
    let header = lines
        .iter()
        .position(|line| line == "orphaned records:")
        .expect("orphan section");
    assert_eq!(lines[header + 1], "  drunkards_walk  1 record(s)");
    assert!(lines[0].contains("0 record(s)"));
}

#[test]
fn show_skips_records_orphaned_by_clear_all() {
    let (_dir, lab) = demo_lab();
    let (_terminal, _) = session(&lab, &["run 0"]);

    lab.registry().clear_all().expect("clear");
    register_demos(lab.registry()).expect("register again");
    let (terminal, summary) = session(&lab, &["show 0", "records 0"]);

    assert_eq!(summary.command_errors, 0);
    let output = terminal.output();
    assert!(output.contains("drunkards_walk: no records yet"));
    assert!(!output.contains("final distance"));
    // The orphaned record is still reachable by explicit listing.
    assert!(output.contains("(orphaned)"));
}

/// JSON with the bytes stored back to front.
struct MirroredJson;

impl ResultCodec for MirroredJson {
    fn name(&self) -> &'static str {
        "mirrored-json"
    }

    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, LabError> {
        let mut bytes = JsonCodec.encode(value)?;
        bytes.reverse();
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, LabError> {
        let mut bytes = bytes.to_vec();
        bytes.reverse();
        JsonCodec.decode(&bytes)
    }
}

#[test]
fn show_and_compare_decode_records_written_with_a_custom_codec() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(RecordStore::open(dir.path().join("records.sqlite")).expect("store"));
    let engine = ExecutionEngine::new(Arc::clone(&store)).with_codec(Arc::new(MirroredJson));
    let lab = Lab::from_parts(store, engine);
    register_demos(lab.registry()).expect("register demos");

    let (terminal, summary) = session(&lab, &["run 0-1", "show 0", "compare 0-1"]);

    assert_eq!(summary.runs, 2);
    assert_eq!(summary.command_errors, 0);
    let output = terminal.output();
    assert!(output.contains("final distance"));
    assert!(output.contains("homing_instinct  final_distance  record"));
    assert!(!output.contains("unknown codec"));

    let record = lab
        .store()
        .latest("drunkards_walk")
        .expect("latest")
        .expect("record");
    assert_eq!(record.meta().codec.as_deref(), Some("mirrored-json"));
    assert_eq!(
        record.return_value().expect("decode").expect("value")["steps"],
        serde_json::json!(1000)
    );
}

#[test]
fn binary_entry_point_runs_a_scripted_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let terminal = FakeTerminal::scripted(["run 1", "quit"]);
    let runtime = LabRuntime {
        clock: Arc::new(FakeClock::default()),
        file_system: Arc::new(ProductionFileSystem),
        terminal: Arc::new(terminal.clone()),
    };
    let args = ["labbook", "--store-root", "store", "--no-log"]
        .into_iter()
        .map(OsString::from)
        .collect::<Vec<_>>();

    let code = run_with_runtime(&args, dir.path(), &runtime).expect("session");
    assert_eq!(code, 0);
    assert!(terminal.output().contains("step"));

    let lab = Lab::open_at(dir.path().join("store/records.sqlite")).expect("reopen");
    let records = lab
        .store()
        .list("drunkards_walk.homing_instinct=0.01")
        .expect("list");
    assert_eq!(records.len(), 1);
    assert!(!dir.path().join("store/logs").exists());
}
