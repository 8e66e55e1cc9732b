use crate::record::{Record, RunStatus};
use crate::runtime::Terminal;
use crate::types::render_value;
use serde_json::Value;
use std::collections::BTreeSet;

const MAX_CELL_WIDTH: usize = 32;

/// One-line summary used by `records` listings.
pub fn record_summary_line(record: &Record) -> String {
    let args = record
        .args()
        .iter()
        .map(|(key, value)| format!("{key}={}", render_value(value)))
        .collect::<Vec<_>>()
        .join(", ");
    let mut line = format!(
        "{:<6} {:<9} {}",
        record.label(),
        record.status().as_str(),
        args
    );
    if record.is_orphaned() {
        line.push_str(" (orphaned)");
    }
    if record.is_cancelled() {
        line.push_str(" (cancelled)");
    }
    line
}

pub fn default_display(record: &Record, terminal: &dyn Terminal) -> anyhow::Result<()> {
    terminal.write_line(&format!(
        "== {} {} [{}] ==",
        record.experiment_id(),
        record.label(),
        record.status().as_str()
    ))?;
    for (key, value) in record.args() {
        terminal.write_line(&format!("  {key} = {}", render_value(value)))?;
    }
    match record.status() {
        RunStatus::Completed => {
            let value = record.return_value()?.unwrap_or(Value::Null);
            terminal.write_line(&format!("result: {}", render_value(&value)))?;
        }
        RunStatus::Failed => {
            if let Some(failure) = record.failure() {
                let marker = if failure.cancelled { " (cancelled)" } else { "" };
                terminal.write_line(&format!("error{marker}: {}", failure.message))?;
            }
        }
        RunStatus::Running => terminal.write_line("still running")?,
    }
    if record.artifact_count() > 0 {
        let summary = record
            .artifacts()?
            .iter()
            .map(|artifact| format!("{} ({} bytes)", artifact.type_tag(), artifact.len()))
            .collect::<Vec<_>>()
            .join(", ");
        terminal.write_line(&format!("artifacts: {summary}"))?;
    }
    if !record.console().is_empty() {
        terminal.write_line("--- console ---")?;
        for line in record.console().lines() {
            terminal.write_line(line)?;
        }
    }
    Ok(())
}

/// Side-by-side table of arguments and return values. Rows whose values
/// differ between records are marked with `*`.
pub fn default_compare(records: &[Record], terminal: &dyn Terminal) -> anyhow::Result<()> {
    if records.is_empty() {
        terminal.write_line("nothing to compare")?;
        return Ok(());
    }

    let results = records
        .iter()
        .map(|record| record.return_value().map(|value| value.unwrap_or(Value::Null)))
        .collect::<Result<Vec<_>, _>>()?;

    let arg_keys = records
        .iter()
        .flat_map(|record| record.args().keys().cloned())
        .collect::<BTreeSet<_>>();
    let mut rows: Vec<(String, Vec<String>)> = arg_keys
        .into_iter()
        .map(|key| {
            let cells = records
                .iter()
                .map(|record| record.args().get(&key).map(render_value).unwrap_or_default())
                .collect();
            (key, cells)
        })
        .collect();

    let result_keys = results
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|object| object.keys().cloned())
        .collect::<BTreeSet<_>>();
    if result_keys.is_empty() || results.iter().any(|value| !value.is_object()) {
        rows.push((
            "result".to_string(),
            results.iter().map(render_value).collect(),
        ));
    } else {
        for key in result_keys {
            let cells = results
                .iter()
                .map(|value| value.get(&key).map(render_value).unwrap_or_default())
                .collect();
            rows.push((format!("result.{key}"), cells));
        }
    }
    rows.push((
        "status".to_string(),
        records
            .iter()
            .map(|record| record.status().as_str().to_string())
            .collect(),
    ));

    let headers = records
        .iter()
        .map(|record| format!("{} {}", record.experiment_id(), record.label()))
        .collect::<Vec<_>>();
    let key_width = rows
        .iter()
        .map(|(key, _)| key.len() + 2)
        .max()
        .unwrap_or(0)
        .max(3);
    let widths = (0..records.len())
        .map(|column| {
            rows.iter()
                .map(|(_, cells)| clip(&cells[column]).chars().count())
                .chain(std::iter::once(clip(&headers[column]).chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect::<Vec<_>>();

    let header = headers
        .iter()
        .zip(&widths)
        .map(|(cell, &width)| format!("{:<width$}", clip(cell)))
        .collect::<Vec<_>>()
        .join(" | ");
    terminal.write_line(&format!("{:<key_width$} | {header}", "key"))?;
    for (key, cells) in &rows {
        let differs = cells.iter().any(|cell| cell != &cells[0]);
        let label = format!("{} {key}", if differs { "*" } else { " " });
        let line = cells
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!("{:<width$}", clip(cell)))
            .collect::<Vec<_>>()
            .join(" | ");
        terminal.write_line(&format!("{label:<key_width$} | {line}").trim_end().to_string())?;
    }
    Ok(())
}

fn clip(cell: &str) -> String {
    if cell.chars().count() <= MAX_CELL_WIDTH {
        return cell.to_string();
    }
    let kept = cell.chars().take(MAX_CELL_WIDTH - 3).collect::<String>();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FailureInfo, RecordMeta};
    use crate::runtime::FakeTerminal;
    use crate::types::Arguments;
    use serde_json::json;

    fn record(run_id: u64, homing: f64, result: Option<Value>) -> Record {
        let mut args = Arguments::new();
        args.insert("homing_instinct".to_string(), json!(homing));
        args.insert("n_steps".to_string(), json!(100));
        let failed = result.is_none();
        let meta = RecordMeta {
            experiment_id: "walk".to_string(),
            run_id,
            status: if failed {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            },
            args,
            console: "line one\nline two\n".to_string(),
            failure: failed.then(|| FailureInfo {
                message: "diverged".to_string(),
                trace: String::new(),
                cancelled: false,
            }),
            codec: (!failed).then(|| "json".to_string()),
            artifact_count: 0,
            created_at_ms: 0,
            finished_at_ms: Some(1),
            orphaned: false,
        };
        let bytes = result.map(|value| serde_json::to_vec(&value).expect("encode"));
        Record::loaded(meta, bytes, Vec::new())
    }

    #[test]
    fn display_shows_status_arguments_result_and_console() {
        let terminal = FakeTerminal::new(false);
        default_display(&record(2, 0.1, Some(json!({"distance": 4}))), &terminal)
            .expect("display");
        let output = terminal.output();
        assert!(output.contains("== walk #2 [completed] =="));
        assert!(output.contains("homing_instinct = 0.1"));
        assert!(output.contains("result: {\"distance\":4}"));
        assert!(output.contains("--- console ---\nline one\nline two"));
    }

    #[test]
    fn display_of_failed_record_shows_the_error() {
        let terminal = FakeTerminal::new(false);
        default_display(&record(1, 0.0, None), &terminal).expect("display");
        assert!(terminal.output().contains("error: diverged"));
    }

    #[test]
    fn compare_marks_rows_that_differ() {
        let terminal = FakeTerminal::new(false);
        let records = vec![
            record(1, 0.01, Some(json!({"distance": 4, "steps": 100}))),
            record(2, 0.1, Some(json!({"distance": 1, "steps": 100}))),
        ];
        default_compare(&records, &terminal).expect("compare");
        let lines = terminal.written_lines();
        assert!(lines[0].starts_with("key"));
        assert!(lines[0].contains("walk #1"));
        let row = |key: &str| {
            lines
                .iter()
                .find(|line| line[2..].starts_with(key))
                .cloned()
                .expect("row present")
        };
        assert!(row("homing_instinct").starts_with('*'));
        assert!(row("result.distance").starts_with('*'));
        assert!(row("n_steps").starts_with(' '));
        assert!(row("result.steps").starts_with(' '));
    }

    #[test]
    fn summary_line_flags_failures() {
        let line = record_summary_line(&record(7, 0.0, None));
        assert!(line.starts_with("#7"));
        assert!(line.contains("failed"));
        assert!(line.contains("n_steps=100"));
    }
}
