//! Instance requirements: what a requirement task asks the engine to
//! build, and how it expands into a subgraph of concrete tasks.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{AmbiguousSpecialization, ResolutionError};
use crate::model::{ComponentModel, ModelName, ModelRegistry};
use crate::plan::{DeploymentHint, Plan, Task, TaskId};

/// A component model plus the selections and argument overrides needed to
/// instantiate it.
#[derive(Debug, Clone)]
pub struct InstanceRequirements {
    pub model: ModelName,
    pub arguments: BTreeMap<String, Value>,
    /// Dependency-injection selections: child roles to model names,
    /// `<service>_dev` keys to device names.
    pub selections: BTreeMap<String, String>,
    pub deployment_hints: Vec<DeploymentHint>,
    /// Pin the root to a specific deployed task name.
    pub orocos_name: Option<String>,
}

/// What a requirement ended up fulfilled by: the top model, the data
/// services it provides, and the arguments retained from the actual task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfilledModel {
    pub top: ModelName,
    pub services: Vec<ModelName>,
    pub arguments: BTreeMap<String, Value>,
}

impl InstanceRequirements {
    pub fn new(model: impl Into<ModelName>) -> Self {
        InstanceRequirements {
            model: model.into(),
            arguments: BTreeMap::new(),
            selections: BTreeMap::new(),
            deployment_hints: Vec::new(),
            orocos_name: None,
        }
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(name.into(), value);
        self
    }

    pub fn with_selection(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.selections.insert(key.into(), value.into());
        self
    }

    pub fn with_hint(mut self, hint: DeploymentHint) -> Self {
        self.deployment_hints.push(hint);
        self
    }

    pub fn with_orocos_name(mut self, name: impl Into<String>) -> Self {
        self.orocos_name = Some(name.into());
        self
    }

    /// Whether a task of `model` satisfies this requirement.
    pub fn fulfills(&self, model: &ComponentModel) -> bool {
        model.fulfills(&self.model)
    }

    /// The fulfilled-model triple recorded for the instantiated root.
    pub fn fulfilled_model(&self, root: &ComponentModel) -> FulfilledModel {
        FulfilledModel {
            top: root.name.clone(),
            services: root.fulfilled.iter().cloned().collect(),
            arguments: self.arguments.clone(),
        }
    }

    /// Expands the requirement into a task subgraph rooted at the
    /// returned task. Compositions recurse into their children; abstract
    /// children are narrowed to a concrete model when the registry offers
    /// exactly one.
    pub fn instantiate(
        &self,
        plan: &mut Plan,
        registry: &ModelRegistry,
        strict_specializations: bool,
    ) -> Result<TaskId, ResolutionError> {
        let root = instantiate_model(
            plan,
            registry,
            &self.model,
            &self.selections,
            strict_specializations,
        )?;
        {
            let task = plan.task_mut(root);
            for (key, value) in &self.arguments {
                task.arguments.insert(key.clone(), value.clone());
            }
            task.deployment_hints.extend(self.deployment_hints.iter().cloned());
            if task.orocos_name.is_none() {
                task.orocos_name = self.orocos_name.clone();
            }
        }
        Ok(root)
    }
}

fn instantiate_model(
    plan: &mut Plan,
    registry: &ModelRegistry,
    requested: &ModelName,
    selections: &BTreeMap<String, String>,
    strict: bool,
) -> Result<TaskId, ResolutionError> {
    let model = resolve_concrete_model(registry, requested, strict)?;
    let mut task = Task::new(model.clone());
    task.selections = selections.clone();
    let id = plan.add(task);

    if model.is_composition() {
        let mut bound: BTreeMap<String, TaskId> = BTreeMap::new();
        for child in &model.children {
            let requested_child = selections
                .get(&child.role)
                .cloned()
                .unwrap_or_else(|| child.model.clone());
            let child_id = instantiate_model(plan, registry, &requested_child, selections, strict)?;
            plan.add_dependency(id, child_id, child.role.clone());
            bound.insert(child.role.clone(), child_id);
        }
        for conn in &model.connections {
            if let (Some(&source), Some(&sink)) =
                (bound.get(&conn.source_role), bound.get(&conn.sink_role))
            {
                plan.connect(
                    source,
                    conn.source_port.clone(),
                    sink,
                    conn.sink_port.clone(),
                    conn.policy,
                );
            }
        }
    }

    Ok(id)
}

/// Maps a requested model name to something instantiable. Abstract models
/// narrow to their unique concrete specialization; with several
/// candidates, strict mode fails and lax mode leaves the task abstract
/// for the allocation validator to report.
fn resolve_concrete_model(
    registry: &ModelRegistry,
    requested: &ModelName,
    strict: bool,
) -> Result<Arc<ComponentModel>, ResolutionError> {
    let model = registry.find(requested).ok_or_else(|| {
        ResolutionError::internal(format!("model '{requested}' is not registered"))
    })?;
    if !model.is_abstract() {
        return Ok(model);
    }

    let candidates = registry.each_submodel(requested);
    match candidates.len() {
        1 => Ok(candidates.into_iter().next().expect("one candidate")),
        0 => Ok(model),
        _ if strict => Err(AmbiguousSpecialization {
            requested: requested.clone(),
            candidates: candidates.iter().map(|m| m.name.clone()).collect(),
        }
        .into()),
        _ => Ok(model),
    }
}
