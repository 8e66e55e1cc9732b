//! Experiments registered by the `labbook` binary.

use crate::computation::RunContext;
use crate::errors::LabError;
use crate::record::{Artifact, Record};
use crate::registry::{Experiment, Hooks, Registry};
use crate::runtime::Terminal;
use crate::types::{Arguments, Overrides};
use anyhow::bail;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::{json, Value};
use std::fmt::Write as _;

pub const DRUNKARDS_WALK: &str = "drunkards_walk";
pub const DEMO_ERROR: &str = "demo_error";

/// 2-D random walk. With probability `homing_instinct` a step heads back
/// toward the origin instead of in a random direction.
pub fn drunkards_walk(ctx: &RunContext) -> anyhow::Result<Value> {
    let n_steps = ctx.arg_u64("n_steps")?;
    let homing_instinct = ctx.arg_f64("homing_instinct")?;
    let seed = ctx.arg_u64("seed")?;
    if !(0.0..=1.0).contains(&homing_instinct) {
        bail!("homing_instinct must be within [0, 1], got {homing_instinct}");
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let (mut x, mut y) = (0.0_f64, 0.0_f64);
    let mut max_distance = 0.0_f64;
    let mut csv = String::from("step,x,y\n0,0,0\n");
    let report_every = (n_steps / 5).max(1);

    for step in 1..=n_steps {
        ctx.check_cancelled()?;
        let angle = if rng.gen_bool(homing_instinct) {
            (-y).atan2(-x)
        } else {
            rng.gen_range(0.0..std::f64::consts::TAU)
        };
        x += angle.cos();
        y += angle.sin();
        let distance = x.hypot(y);
        max_distance = max_distance.max(distance);
        let _ = writeln!(csv, "{step},{x:.4},{y:.4}");
        if step % report_every == 0 {
            ctx.println(&format!(
                "step {step:>6}: position ({x:>8.2}, {y:>8.2}) distance {distance:.2}"
            ));
        }
    }

    ctx.emit_artifact(Artifact::new("text/csv", csv.into_bytes()));
    let final_distance = x.hypot(y);
    Ok(json!({
        "final_distance": round4(final_distance),
        "max_distance": round4(max_distance),
        "steps": n_steps,
    }))
}

fn demo_error(ctx: &RunContext) -> anyhow::Result<Value> {
    let fail_after = ctx.arg_u64("fail_after")?;
    for step in 0..fail_after {
        ctx.println(&format!("working on step {step}"));
    }
    bail!("demo failure after {fail_after} steps")
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn walk_display(record: &Record, terminal: &dyn Terminal) -> anyhow::Result<()> {
    let homing = record
        .args()
        .get("homing_instinct")
        .cloned()
        .unwrap_or(Value::Null);
    terminal.write_line(&format!(
        "{} {} (homing_instinct={homing}) [{}]",
        record.experiment_id(),
        record.label(),
        record.status().as_str()
    ))?;
    match record.return_value()? {
        Some(value) => terminal.write_line(&format!(
            "  final distance {} after {} steps (max {})",
            value["final_distance"], value["steps"], value["max_distance"]
        ))?,
        None => {
            let message = record
                .failure()
                .map(|failure| failure.message.as_str())
                .unwrap_or("no result");
            terminal.write_line(&format!("  {message}"))?;
        }
    }
    for artifact in record.artifacts()? {
        let rows = artifact.as_text().map(|text| text.lines().count()).unwrap_or(0);
        terminal.write_line(&format!(
            "  artifact {}: {rows} rows",
            artifact.type_tag()
        ))?;
    }
    Ok(())
}

fn walk_compare(records: &[Record], terminal: &dyn Terminal) -> anyhow::Result<()> {
    terminal.write_line("homing_instinct  final_distance  record")?;
    for record in records {
        let homing = record
            .args()
            .get("homing_instinct")
            .map(ToString::to_string)
            .unwrap_or_default();
        let distance = record
            .return_value()?
            .and_then(|value| value.get("final_distance").cloned())
            .map(|value| value.to_string())
            .unwrap_or_else(|| "-".to_string());
        terminal.write_line(&format!(
            "{homing:<16} {distance:<15} {} {}",
            record.experiment_id(),
            record.label()
        ))?;
    }
    Ok(())
}

/// Registers the random walk with two homing variants, and an experiment
/// that always fails.
pub fn register_demos(registry: &Registry) -> Result<Vec<Experiment>, LabError> {
    let mut defaults = Arguments::new();
    defaults.insert("n_steps".to_string(), json!(1000));
    defaults.insert("homing_instinct".to_string(), json!(0.0));
    defaults.insert("seed".to_string(), json!(1234));
    let walk = registry.register(
        DRUNKARDS_WALK,
        drunkards_walk,
        defaults,
        Hooks::none()
            .with_display(walk_display)
            .with_compare(walk_compare),
    )?;

    let mut experiments = vec![walk.clone()];
    for homing in [0.01, 0.1] {
        let mut overrides = Overrides::new();
        overrides.insert("homing_instinct".to_string(), json!(homing));
        experiments.push(registry.add_variant(&walk, overrides, Hooks::none())?);
    }

    let mut error_defaults = Arguments::new();
    error_defaults.insert("fail_after".to_string(), json!(3));
    experiments.push(registry.register(DEMO_ERROR, demo_error, error_defaults, Hooks::none())?);
    Ok(experiments)
}
