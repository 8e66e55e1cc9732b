//! Textual selectors such as `0-2,walk*,last` resolved against an ordered list.

use crate::errors::LabError;
use crate::identity::{match_id, IdMatch};
use crate::record::Record;
use crate::registry::Experiment;
use crate::types::split_top_level;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorToken {
    Index(usize),
    /// Inclusive on both ends.
    Range(usize, usize),
    /// Exact id, or a prefix matching exactly one id.
    Id(String),
    /// Every id starting with the prefix.
    Prefix(String),
    All,
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    tokens: Vec<SelectorToken>,
}

impl Selector {
    pub fn parse(text: &str) -> Result<Self, LabError> {
        parse_selector(text)
    }

    pub fn tokens(&self) -> &[SelectorToken] {
        &self.tokens
    }
}

pub fn parse_selector(text: &str) -> Result<Selector, LabError> {
    if text.trim().is_empty() {
        return Err(LabError::SelectorResolution("empty selector".to_string()));
    }
    let tokens = split_top_level(text)
        .into_iter()
        .map(parse_token)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Selector { tokens })
}

fn parse_token(raw: &str) -> Result<SelectorToken, LabError> {
    let token = raw.trim();
    if token.is_empty() {
        return Err(LabError::SelectorResolution(
            "empty token in selector".to_string(),
        ));
    }
    if token == "all" {
        return Ok(SelectorToken::All);
    }
    if token == "last" {
        return Ok(SelectorToken::Last);
    }
    if let Ok(index) = token.parse::<usize>() {
        return Ok(SelectorToken::Index(index));
    }
    if let Some((start, end)) = token.split_once('-') {
        if let (Ok(start), Ok(end)) = (start.trim().parse::<usize>(), end.trim().parse::<usize>())
        {
            if start > end {
                return Err(LabError::SelectorResolution(format!(
                    "inverted range `{token}`"
                )));
            }
            return Ok(SelectorToken::Range(start, end));
        }
    }
    if let Some(prefix) = token.strip_suffix('*') {
        return Ok(SelectorToken::Prefix(prefix.to_string()));
    }
    Ok(SelectorToken::Id(token.to_string()))
}

/// Positions in `labels` picked by `selector`, first occurrence order, no
/// duplicates. `kind` names the items in error messages.
pub fn resolve_indices(
    selector: &Selector,
    labels: &[String],
    kind: &str,
) -> Result<Vec<usize>, LabError> {
    let mut picked = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |index: usize| {
        if seen.insert(index) {
            picked.push(index);
        }
    };
    let out_of_range = |index: usize| {
        LabError::SelectorResolution(format!(
            "index {index} is out of range ({} {kind}s)",
            labels.len()
        ))
    };

    for token in &selector.tokens {
        match token {
            SelectorToken::Index(index) => {
                if *index >= labels.len() {
                    return Err(out_of_range(*index));
                }
                push(*index);
            }
            SelectorToken::Range(start, end) => {
                if *end >= labels.len() {
                    return Err(out_of_range(*end));
                }
                (*start..=*end).for_each(&mut push);
            }
            SelectorToken::All => (0..labels.len()).for_each(&mut push),
            SelectorToken::Last => {
                let last = labels.len().checked_sub(1).ok_or_else(|| {
                    LabError::SelectorResolution(format!("there is no last {kind}"))
                })?;
                push(last);
            }
            SelectorToken::Prefix(prefix) => {
                let matched = labels
                    .iter()
                    .enumerate()
                    .filter(|(_, label)| label.starts_with(prefix.as_str()))
                    .map(|(index, _)| index)
                    .collect::<Vec<_>>();
                if matched.is_empty() {
                    return Err(LabError::SelectorResolution(format!(
                        "no {kind} matches `{prefix}*`"
                    )));
                }
                matched.into_iter().for_each(&mut push);
            }
            SelectorToken::Id(query) => push(resolve_id(query, labels, kind)?),
        }
    }

    if picked.is_empty() {
        return Err(LabError::SelectorResolution(format!(
            "selector matched no {kind}"
        )));
    }
    Ok(picked)
}

fn resolve_id(query: &str, labels: &[String], kind: &str) -> Result<usize, LabError> {
    let mut prefixed = Vec::new();
    for (index, label) in labels.iter().enumerate() {
        match match_id(label, query) {
            IdMatch::Exact => return Ok(index),
            IdMatch::Prefix => prefixed.push(index),
            IdMatch::Miss => {}
        }
    }
    match prefixed.as_slice() {
        [] => Err(LabError::SelectorResolution(format!(
            "unknown {kind} `{query}`"
        ))),
        [only] => Ok(*only),
        many => {
            let candidates = many
                .iter()
                .map(|index| labels[*index].as_str())
                .collect::<Vec<_>>()
                .join(", ");
            Err(LabError::SelectorResolution(format!(
                "`{query}` is ambiguous between {candidates}"
            )))
        }
    }
}

/// Resolves against the registry listing order.
pub fn resolve_experiments(
    selector: &Selector,
    experiments: &[Experiment],
) -> Result<Vec<Experiment>, LabError> {
    let labels = experiments
        .iter()
        .map(|experiment| experiment.id().to_string())
        .collect::<Vec<_>>();
    Ok(resolve_indices(selector, &labels, "experiment")?
        .into_iter()
        .map(|index| experiments[index].clone())
        .collect())
}

/// Resolves against one experiment's records, oldest first, labelled `#<run_id>`.
pub fn resolve_records(selector: &Selector, records: &[Record]) -> Result<Vec<Record>, LabError> {
    let labels = records.iter().map(Record::label).collect::<Vec<_>>();
    Ok(resolve_indices(selector, &labels, "record")?
        .into_iter()
        .map(|index| records[index].clone())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| (*item).to_string()).collect()
    }

    fn resolve(text: &str, items: &[&str]) -> Result<Vec<usize>, LabError> {
        resolve_indices(&parse_selector(text)?, &labels(items), "experiment")
    }

    const WALKS: [&str; 4] = [
        "walk",
        "walk.homing_instinct=0.01",
        "walk.homing_instinct=0.1",
        "demo_error",
    ];

    #[test]
    fn parses_every_token_form() {
        let selector = parse_selector("0, 1-3,walk*,walk.x=[1,2],all,last").expect("parse");
        assert_eq!(
            selector.tokens(),
            &[
                SelectorToken::Index(0),
                SelectorToken::Range(1, 3),
                SelectorToken::Prefix("walk".to_string()),
                SelectorToken::Id("walk.x=[1,2]".to_string()),
                SelectorToken::All,
                SelectorToken::Last,
            ]
        );
    }

    #[test]
    fn ranges_and_all_follow_listing_order() {
        assert_eq!(resolve("0-2", &WALKS).expect("range"), vec![0, 1, 2]);
        assert_eq!(resolve("all", &WALKS).expect("all"), vec![0, 1, 2, 3]);
        assert_eq!(resolve("3,0-1,0", &WALKS).expect("dedup"), vec![3, 0, 1]);
        assert_eq!(resolve("last", &WALKS).expect("last"), vec![3]);
    }

    #[test]
    fn ids_match_exactly_or_by_unique_prefix() {
        assert_eq!(resolve("walk", &WALKS).expect("exact wins"), vec![0]);
        assert_eq!(resolve("demo", &WALKS).expect("unique prefix"), vec![3]);
        assert_eq!(resolve("walk.homing*", &WALKS).expect("glob"), vec![1, 2]);
        assert!(matches!(
            resolve("walk.homing", &WALKS),
            Err(LabError::SelectorResolution(message)) if message.contains("ambiguous")
        ));
        assert!(matches!(
            resolve("swim", &WALKS),
            Err(LabError::SelectorResolution(message)) if message.contains("unknown")
        ));
    }

    #[test]
    fn bad_selectors_are_resolution_errors() {
        for text in ["", "  ", "7", "2-9", "3-1", "0,,1", "swim*"] {
            assert!(
                matches!(resolve(text, &WALKS), Err(LabError::SelectorResolution(_))),
                "`{text}` should fail"
            );
        }
        assert!(matches!(resolve("all", &[]), Err(LabError::SelectorResolution(_))));
        assert!(matches!(resolve("last", &[]), Err(LabError::SelectorResolution(_))));
    }

    #[test]
    fn record_labels_use_run_ids() {
        let records = labels(&["#1", "#2", "#5"]);
        let selector = parse_selector("#5,0").expect("parse");
        assert_eq!(
            resolve_indices(&selector, &records, "record").expect("records"),
            vec![2, 0]
        );
    }
}
