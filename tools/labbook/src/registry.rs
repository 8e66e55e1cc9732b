//! The variant tree: root experiments and the variants derived from them.

use crate::computation::Computation;
use crate::errors::LabError;
use crate::identity::{compute_id, validate_name, validate_overrides, validate_parameter_names, Lineage};
use crate::logging::append_run_log;
use crate::record::Record;
use crate::record_store::RecordStore;
use crate::runtime::Terminal;
use crate::types::{merge_arguments, Arguments, Overrides};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

pub type DisplayHook = Arc<dyn Fn(&Record, &dyn Terminal) -> anyhow::Result<()> + Send + Sync>;
pub type CompareHook = Arc<dyn Fn(&[Record], &dyn Terminal) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    pub display: Option<DisplayHook>,
    pub compare: Option<CompareHook>,
}

impl Hooks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_display<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Record, &dyn Terminal) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.display = Some(Arc::new(hook));
        self
    }

    pub fn with_compare<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[Record], &dyn Terminal) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.compare = Some(Arc::new(hook));
        self
    }

    /// Hooks set here win; unset ones fall back to `parent`.
    fn inherit_from(self, parent: &Hooks) -> Self {
        Self {
            display: self.display.or_else(|| parent.display.clone()),
            compare: self.compare.or_else(|| parent.compare.clone()),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("display", &self.display.is_some())
            .field("compare", &self.compare.is_some())
            .finish()
    }
}

struct ExperimentNode {
    id: String,
    lineage: Lineage,
    defaults: Arguments,
    signature: Arc<Arguments>,
    parent_id: Option<String>,
    hooks: Hooks,
    computation: Arc<dyn Computation>,
}

/// Shared handle to a registered experiment node.
#[derive(Clone)]
pub struct Experiment(Arc<ExperimentNode>);

impl Experiment {
    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn lineage(&self) -> &Lineage {
        &self.0.lineage
    }

    /// Default arguments after applying every override on the lineage.
    pub fn defaults(&self) -> &Arguments {
        &self.0.defaults
    }

    /// Root defaults; their keys are the parameters the computation accepts.
    pub fn signature(&self) -> &Arguments {
        &self.0.signature
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.0.parent_id.as_deref()
    }

    pub fn is_root(&self) -> bool {
        self.0.parent_id.is_none()
    }

    pub fn hooks(&self) -> &Hooks {
        &self.0.hooks
    }

    pub fn display_hook(&self) -> Option<&DisplayHook> {
        self.0.hooks.display.as_ref()
    }

    pub fn compare_hook(&self) -> Option<&CompareHook> {
        self.0.hooks.compare.as_ref()
    }

    pub fn computation(&self) -> &Arc<dyn Computation> {
        &self.0.computation
    }

    fn same_node(&self, other: &Experiment) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("id", &self.0.id)
            .field("parent_id", &self.0.parent_id)
            .field("defaults", &self.0.defaults)
            .field("hooks", &self.0.hooks)
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    nodes: HashMap<String, Experiment>,
    children: HashMap<String, Vec<String>>,
    /// Every registered id in registration order.
    order: Vec<String>,
}

impl RegistryState {
    fn current(&self, experiment: &Experiment) -> Result<&Experiment, LabError> {
        self.nodes
            .get(experiment.id())
            .filter(|node| node.same_node(experiment))
            .ok_or_else(|| {
                LabError::NotFound(format!(
                    "experiment `{}` is no longer registered",
                    experiment.id()
                ))
            })
    }

    fn subtree_ids(&self, root_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![root_id.to_string()];
        while let Some(id) = stack.pop() {
            if let Some(children) = self.children.get(&id) {
                stack.extend(children.iter().rev().cloned());
            }
            out.push(id);
        }
        out
    }

    fn listing(&self) -> Vec<Experiment> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect()
    }
}

pub struct Registry {
    state: RwLock<RegistryState>,
    store: Option<Arc<RecordStore>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A registry that manages the tree only; deletes never touch records.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            store: None,
        }
    }

    /// A registry whose `clear_all` and `delete` cascade into `store`.
    pub fn bound_to(store: Arc<RecordStore>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            store: Some(store),
        }
    }

    pub fn store(&self) -> Option<&Arc<RecordStore>> {
        self.store.as_ref()
    }

    pub fn register(
        &self,
        name: &str,
        computation: impl Computation + 'static,
        defaults: Arguments,
        hooks: Hooks,
    ) -> Result<Experiment, LabError> {
        self.register_shared(name, Arc::new(computation), defaults, hooks)
    }

    pub fn register_shared(
        &self,
        name: &str,
        computation: Arc<dyn Computation>,
        defaults: Arguments,
        hooks: Hooks,
    ) -> Result<Experiment, LabError> {
        validate_name("experiment", name)?;
        if name.contains('.') {
            return Err(LabError::MalformedLineage(format!(
                "experiment name `{name}` must not contain '.'"
            )));
        }
        validate_parameter_names(&defaults, &defaults)?;

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.nodes.contains_key(name) {
            return Err(LabError::DuplicateIdentity(format!(
                "experiment `{name}` is already registered"
            )));
        }
        let experiment = Experiment(Arc::new(ExperimentNode {
            id: name.to_string(),
            lineage: Lineage::root(name),
            signature: Arc::new(defaults.clone()),
            defaults,
            parent_id: None,
            hooks,
            computation,
        }));
        state.nodes.insert(name.to_string(), experiment.clone());
        state.order.push(name.to_string());
        drop(state);

        append_run_log(
            "info",
            "registry.registered",
            json!({ "experiment_id": name }),
        );
        Ok(experiment)
    }

    /// Derives a child of `parent` that differs by `overrides`.
    pub fn add_variant(
        &self,
        parent: &Experiment,
        overrides: Overrides,
        hooks: Hooks,
    ) -> Result<Experiment, LabError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let parent = state.current(parent)?.clone();
        validate_overrides(parent.signature(), &overrides)?;

        let lineage = parent.lineage().child(overrides.clone());
        let id = compute_id(&lineage)?;

        let siblings = state
            .children
            .get(parent.id())
            .map(Vec::as_slice)
            .unwrap_or_default();
        if let Some(existing) = siblings
            .iter()
            .filter_map(|sibling| state.nodes.get(sibling))
            .find(|sibling| sibling.lineage().own_overrides() == Some(&overrides))
        {
            return Err(LabError::DuplicateIdentity(format!(
                "`{}` already has a variant with these overrides: `{}`",
                parent.id(),
                existing.id()
            )));
        }
        if state.nodes.contains_key(&id) {
            return Err(LabError::DuplicateIdentity(format!(
                "experiment id `{id}` is already taken"
            )));
        }

        let experiment = Experiment(Arc::new(ExperimentNode {
            id: id.clone(),
            defaults: merge_arguments(parent.defaults(), &overrides),
            lineage,
            signature: Arc::clone(&parent.0.signature),
            parent_id: Some(parent.id().to_string()),
            hooks: hooks.inherit_from(parent.hooks()),
            computation: Arc::clone(parent.computation()),
        }));
        state.nodes.insert(id.clone(), experiment.clone());
        state.order.push(id.clone());
        state
            .children
            .entry(parent.id().to_string())
            .or_default()
            .push(id.clone());
        drop(state);

        append_run_log(
            "info",
            "registry.variant_added",
            json!({ "experiment_id": id, "parent_id": parent.id() }),
        );
        Ok(experiment)
    }

    /// Pre-order walk of `experiment` and its descendants. Each call starts
    /// a fresh walk; nodes are fetched as the walk advances.
    pub fn get_all_variants(&self, experiment: &Experiment) -> Result<VariantWalk<'_>, LabError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let root = state.current(experiment)?;
        Ok(VariantWalk {
            registry: self,
            stack: vec![root.id().to_string()],
        })
    }

    /// Resolves a listing index or an exact id.
    pub fn lookup(&self, token: &str) -> Result<Experiment, LabError> {
        let token = token.trim();
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if let Ok(index) = token.parse::<usize>() {
            let listing = state.listing();
            return listing.get(index).cloned().ok_or_else(|| {
                LabError::NotFound(format!(
                    "index {index} is out of range ({} experiments)",
                    listing.len()
                ))
            });
        }
        state
            .nodes
            .get(token)
            .cloned()
            .ok_or_else(|| LabError::NotFound(format!("no experiment with id `{token}`")))
    }

    pub fn get(&self, id: &str) -> Option<Experiment> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .contains_key(id)
    }

    /// Every experiment in registration order. Listing indexes count into
    /// this order.
    pub fn experiments(&self) -> Vec<Experiment> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .listing()
    }

    pub fn children(&self, experiment: &Experiment) -> Vec<Experiment> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .children
            .get(experiment.id())
            .into_iter()
            .flatten()
            .filter_map(|id| state.nodes.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the registry. Records of the removed ids are kept and marked
    /// orphaned. Returns the removed ids.
    pub fn clear_all(&self) -> Result<Vec<String>, LabError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let ids = state
            .listing()
            .iter()
            .map(|experiment| experiment.id().to_string())
            .collect::<Vec<_>>();
        let orphaned = match &self.store {
            Some(store) => store.mark_orphaned(&ids)?,
            None => 0,
        };
        *state = RegistryState::default();
        drop(state);

        append_run_log(
            "info",
            "registry.cleared",
            json!({ "experiments": ids.len(), "orphaned_records": orphaned }),
        );
        Ok(ids)
    }

    /// Removes `experiment` and its subtree and deletes their records.
    /// Returns the removed ids in pre-order.
    pub fn delete(&self, experiment: &Experiment) -> Result<Vec<String>, LabError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let target = state.current(experiment)?.clone();
        let ids = state.subtree_ids(target.id());

        let deleted_records = match &self.store {
            Some(store) => store.delete_experiments(&ids)?,
            None => 0,
        };

        for id in &ids {
            state.nodes.remove(id);
            state.children.remove(id);
        }
        state.order.retain(|id| !ids.contains(id));
        if let Some(siblings) = target
            .parent_id()
            .and_then(|parent_id| state.children.get_mut(parent_id))
        {
            siblings.retain(|id| id != target.id());
        }
        drop(state);

        append_run_log(
            "info",
            "registry.deleted",
            json!({
                "experiment_id": target.id(),
                "removed": ids.len(),
                "deleted_records": deleted_records,
            }),
        );
        Ok(ids)
    }
}

/// Restartable pre-order walk returned by [`Registry::get_all_variants`].
#[derive(Clone)]
pub struct VariantWalk<'a> {
    registry: &'a Registry,
    stack: Vec<String>,
}

impl Iterator for VariantWalk<'_> {
    type Item = Experiment;

    fn next(&mut self) -> Option<Self::Item> {
        let state = self
            .registry
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        while let Some(id) = self.stack.pop() {
            let Some(node) = state.nodes.get(&id) else {
                continue;
            };
            if let Some(children) = state.children.get(&id) {
                self.stack.extend(children.iter().rev().cloned());
            }
            return Some(node.clone());
        }
        None
    }
}
