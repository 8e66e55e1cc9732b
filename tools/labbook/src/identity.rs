use crate::errors::LabError;
use crate::types::{merge_arguments, Arguments, Overrides};
use serde_json::Value;

/// Path from a root experiment down to a variant: the base name plus one
/// override mapping per derivation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lineage {
    base: String,
    steps: Vec<Overrides>,
}

impl Lineage {
    pub fn root(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            steps: Vec::new(),
        }
    }

    pub fn child(&self, overrides: Overrides) -> Self {
        let mut steps = self.steps.clone();
        steps.push(overrides);
        Self {
            base: self.base.clone(),
            steps,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn steps(&self) -> &[Overrides] {
        &self.steps
    }

    pub fn depth(&self) -> usize {
        self.steps.len()
    }

    /// Overrides of the last derivation step; empty for roots.
    pub fn own_overrides(&self) -> Option<&Overrides> {
        self.steps.last()
    }

    /// Left-to-right merge of every step over the root defaults.
    pub fn resolve_arguments(&self, root_defaults: &Arguments) -> Arguments {
        self.steps
            .iter()
            .fold(root_defaults.clone(), |acc, step| merge_arguments(&acc, step))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdMatch {
    Exact,
    Prefix,
    Miss,
}

pub fn compute_id(lineage: &Lineage) -> Result<String, LabError> {
    let mut id = lineage.base.clone();
    for (depth, step) in lineage.steps.iter().enumerate() {
        if step.is_empty() {
            return Err(LabError::MalformedLineage(format!(
                "override step {} of `{}` is empty",
                depth + 1,
                lineage.base
            )));
        }
        for (param, value) in step {
            id.push('.');
            id.push_str(param);
            id.push('=');
            id.push_str(&render_component(value));
        }
    }
    Ok(id)
}

/// Renders one override value inside an id. Strings stay bare only when they
/// are plain words that could not be read back as any other value; all else
/// is written as JSON, so `5` and `"5"` give different ids.
pub fn render_component(value: &Value) -> String {
    match value {
        Value::String(text) if is_bare_word(text) => text.clone(),
        other => other.to_string(),
    }
}

fn is_bare_word(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'))
        && serde_json::from_str::<Value>(text).is_err()
}

pub fn match_id(id: &str, query: &str) -> IdMatch {
    if id == query {
        IdMatch::Exact
    } else if !query.is_empty() && id.starts_with(query) {
        IdMatch::Prefix
    } else {
        IdMatch::Miss
    }
}

pub fn matches(id: &str, query: &str) -> bool {
    match_id(id, query) != IdMatch::Miss
}

pub fn validate_name(kind: &str, name: &str) -> Result<(), LabError> {
    if name.is_empty() {
        return Err(LabError::MalformedLineage(format!("{kind} name is empty")));
    }
    if let Some(bad) = name
        .chars()
        .find(|ch| ch.is_whitespace() || matches!(ch, '=' | ','))
    {
        return Err(LabError::MalformedLineage(format!(
            "{kind} name `{name}` contains forbidden character {bad:?}"
        )));
    }
    Ok(())
}

/// Checks a variant's overrides against the computation's parameter set.
pub fn validate_overrides(signature: &Arguments, overrides: &Overrides) -> Result<(), LabError> {
    if overrides.is_empty() {
        return Err(LabError::MalformedLineage(
            "a variant must override at least one parameter".to_string(),
        ));
    }
    validate_parameter_names(signature, overrides)
}

/// Like [`validate_overrides`] but accepts an empty mapping (run-time overrides).
pub fn validate_parameter_names(
    signature: &Arguments,
    overrides: &Overrides,
) -> Result<(), LabError> {
    for param in overrides.keys() {
        validate_name("parameter", param)?;
        if param.contains('.') {
            return Err(LabError::MalformedLineage(format!(
                "parameter name `{param}` must not contain '.'"
            )));
        }
        if !signature.contains_key(param) {
            let known = signature.keys().cloned().collect::<Vec<_>>().join(", ");
            return Err(LabError::MalformedLineage(format!(
                "unknown parameter `{param}` (known: {known})"
            )));
        }
    }
    Ok(())
}
