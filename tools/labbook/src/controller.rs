//! Line-oriented command loop over a [`Lab`].

use crate::config::LabConfig;
use crate::display::{default_compare, default_display, record_summary_line};
use crate::engine::RunPolicy;
use crate::errors::LabError;
use crate::identity::validate_parameter_names;
use crate::lab::Lab;
use crate::logging::{append_run_log, structured_fallback_line};
use crate::record::{Record, RunStatus};
use crate::registry::Experiment;
use crate::runtime::Terminal;
use crate::selector::{parse_selector, resolve_experiments, resolve_records, Selector};
use crate::types::{parse_assignments, Overrides};
use serde_json::json;
use std::collections::BTreeMap;

/// Words that start a command. A confirmation token may not be one of them.
pub const COMMAND_WORDS: &[&str] = &[
    "run", "show", "compare", "delete", "records", "list", "help", "quit", "exit",
];

const HELP_LINES: &[&str] = &[
    "commands:",
    "  list                                   experiments with record counts",
    "  records <sel>                          records of each selected experiment",
    "  run <sel> [param=value,...]            run experiments",
    "  show <sel> [<record-sel>]              display latest (or selected) records",
    "  compare <sel> [<record-sel>]           compare latest (or selected) records",
    "  delete <sel> [<record-sel>]            delete all (or selected) records",
    "  help                                   this text",
    "  quit                                   leave",
    "selectors: 0  0-2  walk  walk.homing*  all  last  (comma separated; records use #<run>)",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Browsing,
    Executing,
    Displaying,
    ConfirmingDelete,
    Terminated,
}

impl ControllerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Browsing => "browsing",
            Self::Executing => "executing",
            Self::Displaying => "displaying",
            Self::ConfirmingDelete => "confirming-delete",
            Self::Terminated => "terminated",
        }
    }
}

pub fn validate_transition(from: ControllerState, to: ControllerState) -> Result<(), LabError> {
    use ControllerState as S;

    let allowed = match from {
        S::Browsing => matches!(
            to,
            S::Executing | S::Displaying | S::ConfirmingDelete | S::Terminated
        ),
        S::Executing | S::Displaying => matches!(to, S::Browsing),
        S::ConfirmingDelete => matches!(to, S::Browsing | S::Terminated),
        S::Terminated => false,
    };

    if !allowed {
        return Err(LabError::InvalidState(format!(
            "illegal transition: {} -> {}",
            from.as_str(),
            to.as_str()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run {
        experiments: Selector,
        overrides: Overrides,
    },
    Show {
        experiments: Selector,
        records: Option<Selector>,
    },
    Compare {
        experiments: Selector,
        records: Option<Selector>,
    },
    Delete {
        experiments: Selector,
        records: Option<Selector>,
    },
    Records {
        experiments: Selector,
    },
    List,
    Help,
    Quit,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Run { .. } => "run",
            Self::Show { .. } => "show",
            Self::Compare { .. } => "compare",
            Self::Delete { .. } => "delete",
            Self::Records { .. } => "records",
            Self::List => "list",
            Self::Help => "help",
            Self::Quit => "quit",
        }
    }
}

/// Parses one input line; `Ok(None)` for a blank line.
pub fn parse_command(line: &str) -> Result<Option<Command>, LabError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = split_first_word(line);
    let command = match verb {
        "list" => Command::List,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "records" => Command::Records {
            experiments: required_selector(verb, rest)?,
        },
        "run" => {
            let (selector, assignments) = split_first_word(rest);
            Command::Run {
                experiments: required_selector(verb, selector)?,
                overrides: parse_assignments(assignments)?,
            }
        }
        "show" | "compare" | "delete" => {
            let (selector, record_selector) = split_first_word(rest);
            let experiments = required_selector(verb, selector)?;
            let records = if record_selector.is_empty() {
                None
            } else {
                Some(parse_selector(record_selector)?)
            };
            match verb {
                "show" => Command::Show {
                    experiments,
                    records,
                },
                "compare" => Command::Compare {
                    experiments,
                    records,
                },
                _ => Command::Delete {
                    experiments,
                    records,
                },
            }
        }
        other => {
            return Err(LabError::UnknownCommand(format!(
                "`{other}` (type `help` for the command list)"
            )))
        }
    };
    Ok(Some(command))
}

fn required_selector(verb: &str, text: &str) -> Result<Selector, LabError> {
    if text.trim().is_empty() {
        return Err(LabError::SelectorResolution(format!(
            "`{verb}` needs an experiment selector"
        )));
    }
    parse_selector(text)
}

/// Splits off the first whitespace-delimited word, keeping bracketed or
/// quoted spans together.
fn split_first_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    let mut depth = 0usize;
    let mut in_quotes = false;
    for (idx, ch) in text.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '[' | '{' | '(' if !in_quotes => depth += 1,
            ']' | '}' | ')' if !in_quotes => depth = depth.saturating_sub(1),
            c if c.is_whitespace() && depth == 0 && !in_quotes => {
                return (&text[..idx], text[idx..].trim());
            }
            _ => {}
        }
    }
    (text, "")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerOptions {
    pub prompt: String,
    pub confirm_token: String,
    pub skip_if_record_exists: bool,
    pub wait_for_lock: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from_config(&LabConfig::default())
    }
}

impl ControllerOptions {
    pub fn from_config(cfg: &LabConfig) -> Self {
        Self {
            prompt: cfg.controller.prompt.clone(),
            confirm_token: cfg.controller.confirm_token.trim().to_string(),
            skip_if_record_exists: cfg.execution.skip_if_record_exists,
            wait_for_lock: cfg.execution.wait_for_lock,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerSummary {
    pub commands: usize,
    pub runs: usize,
    pub failed_runs: usize,
    pub command_errors: usize,
    pub deleted_records: usize,
}

pub struct Controller<'a> {
    lab: &'a Lab,
    terminal: &'a dyn Terminal,
    options: ControllerOptions,
    state: ControllerState,
    pending_delete: Vec<Record>,
    summary: ControllerSummary,
}

impl<'a> Controller<'a> {
    pub fn new(lab: &'a Lab, terminal: &'a dyn Terminal, options: ControllerOptions) -> Self {
        Self {
            lab,
            terminal,
            options,
            state: ControllerState::Browsing,
            pending_delete: Vec::new(),
            summary: ControllerSummary::default(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn summary(&self) -> &ControllerSummary {
        &self.summary
    }

    /// Reads and handles lines until `quit` or end of input. Only terminal
    /// I/O failures end the loop early.
    pub fn run(&mut self) -> Result<ControllerSummary, LabError> {
        append_run_log("info", "controller.started", json!({}));
        while self.state != ControllerState::Terminated {
            let prompt = if self.state == ControllerState::ConfirmingDelete {
                format!("confirm [{}]> ", self.options.confirm_token)
            } else {
                self.options.prompt.clone()
            };
            match self.terminal.read_line(&prompt)? {
                Some(line) => {
                    self.step(&line)?;
                }
                None => self.transition(ControllerState::Terminated)?,
            }
        }
        append_run_log(
            "info",
            "controller.terminated",
            json!({
                "commands": self.summary.commands,
                "runs": self.summary.runs,
                "failed_runs": self.summary.failed_runs,
                "command_errors": self.summary.command_errors,
            }),
        );
        Ok(self.summary.clone())
    }

    /// Handles one input line and returns the resulting state.
    pub fn step(&mut self, line: &str) -> Result<ControllerState, LabError> {
        match self.state {
            ControllerState::Terminated => {
                return Err(LabError::InvalidState(
                    "controller has terminated".to_string(),
                ))
            }
            ControllerState::ConfirmingDelete => {
                self.confirm_delete(line)?;
                return Ok(self.state);
            }
            _ => {}
        }

        let command = match parse_command(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(self.state),
            Err(error) => {
                self.report(&error)?;
                return Ok(self.state);
            }
        };
        self.summary.commands += 1;
        append_run_log(
            "info",
            "controller.command",
            json!({ "command": command.name(), "line": line.trim() }),
        );

        if let Err(error) = self.execute(command) {
            if matches!(error, LabError::Io(_)) {
                return Err(error);
            }
            if self.state != ControllerState::Browsing {
                self.transition(ControllerState::Browsing)?;
            }
            self.report(&error)?;
        }
        Ok(self.state)
    }

    fn execute(&mut self, command: Command) -> Result<(), LabError> {
        match command {
            Command::List => self.list(),
            Command::Help => {
                for line in HELP_LINES {
                    self.terminal.write_line(line)?;
                }
                Ok(())
            }
            Command::Quit => self.transition(ControllerState::Terminated),
            Command::Records { experiments } => {
                let experiments = self.resolve(&experiments)?;
                self.records(&experiments)
            }
            Command::Run {
                experiments,
                overrides,
            } => {
                let experiments = self.resolve(&experiments)?;
                self.run_experiments(&experiments, &overrides)
            }
            Command::Show {
                experiments,
                records,
            } => {
                let experiments = self.resolve(&experiments)?;
                let groups = self.gather(&experiments, records.as_ref(), false)?;
                self.show(&groups)
            }
            Command::Compare {
                experiments,
                records,
            } => {
                let experiments = self.resolve(&experiments)?;
                let groups = self.gather(&experiments, records.as_ref(), false)?;
                self.compare(&groups)
            }
            Command::Delete {
                experiments,
                records,
            } => {
                let experiments = self.resolve(&experiments)?;
                let groups = self.gather(&experiments, records.as_ref(), true)?;
                self.request_delete(groups)
            }
        }
    }

    fn resolve(&self, selector: &Selector) -> Result<Vec<Experiment>, LabError> {
        resolve_experiments(selector, &self.lab.registry().experiments())
    }

    /// Records per experiment: the selected ones, else all of them (`all`)
    /// or only the latest.
    fn gather(
        &self,
        experiments: &[Experiment],
        records: Option<&Selector>,
        all: bool,
    ) -> Result<Vec<(Experiment, Vec<Record>)>, LabError> {
        let store = self.lab.store();
        experiments
            .iter()
            .map(|experiment| -> Result<(Experiment, Vec<Record>), LabError> {
                let picked = match records {
                    Some(selector) => resolve_records(selector, &store.list(experiment.id())?)?,
                    None if all => store.list(experiment.id())?,
                    None => store.latest(experiment.id())?.into_iter().collect(),
                };
                Ok((experiment.clone(), picked))
            })
            .collect()
    }

    fn run_experiments(
        &mut self,
        experiments: &[Experiment],
        overrides: &Overrides,
    ) -> Result<(), LabError> {
        for experiment in experiments {
            validate_parameter_names(experiment.signature(), overrides)?;
        }

        self.transition(ControllerState::Executing)?;
        let policy = RunPolicy {
            skip_if_record_exists: self.options.skip_if_record_exists,
            suppress_errors: true,
            wait_for_lock: self.options.wait_for_lock,
            ..RunPolicy::default()
        };
        for experiment in experiments {
            self.summary.runs += 1;
            match self.lab.engine().run(experiment, overrides, &policy) {
                Ok(record) => {
                    if record.status() == RunStatus::Failed {
                        self.summary.failed_runs += 1;
                    }
                    self.report_run(&record)?;
                }
                Err(error) => {
                    self.summary.failed_runs += 1;
                    self.terminal
                        .write_line(&format!("{}: {error}", experiment.id()))?;
                }
            }
        }
        self.transition(ControllerState::Browsing)
    }

    fn report_run(&self, record: &Record) -> Result<(), LabError> {
        let detail = match record.failure() {
            Some(failure) => failure.message.clone(),
            None => String::new(),
        };
        let line = if self.terminal.stdin_is_tty() {
            if detail.is_empty() {
                format!(
                    "{} {} {}",
                    record.experiment_id(),
                    record.label(),
                    record.status().as_str()
                )
            } else {
                format!(
                    "{} {} {}: {detail}",
                    record.experiment_id(),
                    record.label(),
                    record.status().as_str()
                )
            }
        } else {
            structured_fallback_line(
                record.experiment_id(),
                record.status().as_str(),
                &format!("{} {detail}", record.label()).trim_end().to_string(),
            )
        };
        self.terminal.write_line(&line)
    }

    fn show(&mut self, groups: &[(Experiment, Vec<Record>)]) -> Result<(), LabError> {
        self.transition(ControllerState::Displaying)?;
        for (experiment, records) in groups {
            if records.is_empty() {
                self.terminal
                    .write_line(&format!("{}: no records yet", experiment.id()))?;
            }
            for record in records {
                let rendered = match experiment.display_hook() {
                    Some(hook) => hook(record, self.terminal),
                    None => default_display(record, self.terminal),
                };
                if let Err(error) = rendered {
                    self.report(&LabError::Hook(format!(
                        "display of {} {} failed: {error:#}",
                        experiment.id(),
                        record.label()
                    )))?;
                }
            }
        }
        self.transition(ControllerState::Browsing)
    }

    fn compare(&mut self, groups: &[(Experiment, Vec<Record>)]) -> Result<(), LabError> {
        let records = groups
            .iter()
            .flat_map(|(_, records)| records.iter().cloned())
            .collect::<Vec<_>>();
        if records.is_empty() {
            self.terminal.write_line("nothing to compare")?;
            return Ok(());
        }
        let hook = groups
            .iter()
            .find_map(|(experiment, _)| experiment.compare_hook().cloned());

        self.transition(ControllerState::Displaying)?;
        let rendered = match hook {
            Some(hook) => hook(records.as_slice(), self.terminal),
            None => default_compare(&records, self.terminal),
        };
        if let Err(error) = rendered {
            self.report(&LabError::Hook(format!("compare failed: {error:#}")))?;
        }
        self.transition(ControllerState::Browsing)
    }

    fn request_delete(&mut self, groups: Vec<(Experiment, Vec<Record>)>) -> Result<(), LabError> {
        let records = groups
            .into_iter()
            .flat_map(|(_, records)| records)
            .collect::<Vec<_>>();
        if records.is_empty() {
            self.terminal.write_line("nothing to delete")?;
            return Ok(());
        }
        let names = records
            .iter()
            .map(|record| format!("{} {}", record.experiment_id(), record.label()))
            .collect::<Vec<_>>()
            .join(", ");
        self.terminal.write_line(&format!(
            "about to delete {} record(s): {names}",
            records.len()
        ))?;
        self.terminal.write_line(&format!(
            "type `{}` to confirm, anything else cancels",
            self.options.confirm_token
        ))?;
        self.pending_delete = records;
        self.transition(ControllerState::ConfirmingDelete)
    }

    fn confirm_delete(&mut self, line: &str) -> Result<(), LabError> {
        let pending = std::mem::take(&mut self.pending_delete);
        if line.trim() != self.options.confirm_token {
            self.terminal.write_line("delete cancelled")?;
            append_run_log(
                "info",
                "controller.delete.cancelled",
                json!({ "records": pending.len() }),
            );
            return self.transition(ControllerState::Browsing);
        }

        let mut deleted = 0usize;
        for record in &pending {
            match self
                .lab
                .store()
                .delete(record.experiment_id(), record.run_id())
            {
                Ok(()) => deleted += 1,
                Err(error) => self.report(&error)?,
            }
        }
        self.summary.deleted_records += deleted;
        self.terminal
            .write_line(&format!("deleted {deleted} record(s)"))?;
        self.transition(ControllerState::Browsing)
    }

    fn list(&self) -> Result<(), LabError> {
        let store = self.lab.store();
        let experiments = self.lab.registry().experiments();
        if experiments.is_empty() {
            self.terminal.write_line("no experiments registered")?;
        }
        let id_width = experiments
            .iter()
            .map(|experiment| experiment.id().len())
            .max()
            .unwrap_or(0)
            .max(2);
        let mut orphans: BTreeMap<String, usize> = BTreeMap::new();
        for (index, experiment) in experiments.iter().enumerate() {
            let records = store.list(experiment.id())?;
            let (orphaned, live): (Vec<_>, Vec<_>) =
                records.into_iter().partition(Record::is_orphaned);
            if !orphaned.is_empty() {
                orphans.insert(experiment.id().to_string(), orphaned.len());
            }
            let last = live
                .last()
                .map(|record| record.status().as_str())
                .unwrap_or("-");
            self.terminal.write_line(&format!(
                "{index:>3}  {:<id_width$}  {:>3} record(s)  last: {last}",
                experiment.id(),
                live.len()
            ))?;
        }

        for id in store.experiment_ids()? {
            if self.lab.registry().contains(&id) {
                continue;
            }
            let count = store.list(&id)?.len();
            *orphans.entry(id).or_default() += count;
        }
        if !orphans.is_empty() {
            self.terminal.write_line("orphaned records:")?;
            for (id, count) in orphans {
                self.terminal
                    .write_line(&format!("  {id}  {count} record(s)"))?;
            }
        }
        Ok(())
    }

    fn records(&self, experiments: &[Experiment]) -> Result<(), LabError> {
        for experiment in experiments {
            let records = self.lab.store().list(experiment.id())?;
            self.terminal.write_line(&format!("{}:", experiment.id()))?;
            if records.is_empty() {
                self.terminal.write_line("  (no records)")?;
            }
            for record in &records {
                self.terminal
                    .write_line(&format!("  {}", record_summary_line(record)))?;
            }
        }
        Ok(())
    }

    fn transition(&mut self, next: ControllerState) -> Result<(), LabError> {
        validate_transition(self.state, next)?;
        self.state = next;
        Ok(())
    }

    fn report(&mut self, error: &LabError) -> Result<(), LabError> {
        self.summary.command_errors += 1;
        append_run_log(
            "warn",
            "controller.command.failed",
            json!({ "error": error.to_string() }),
        );
        self.terminal.write_line(&format!("error: {error}"))
    }
}
