//! Deployment candidate indexing and selection: which OS process hosts
//! which task context.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{DeploymentSlot, MissingDeployment, MissingReason, ResolutionError};
use crate::merge::MergeSolver;
use crate::model::{ModelKind, ModelName, ModelRegistry, ABSTRACT_ROOTS};
use crate::plan::{Plan, Task, TaskId};

/// A deployment made available to the engine: one deployment model that
/// may run on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableDeployment {
    pub host: String,
    pub model: String,
}

impl AvailableDeployment {
    pub fn new(host: impl Into<String>, model: impl Into<String>) -> Self {
        AvailableDeployment {
            host: host.into(),
            model: model.into(),
        }
    }
}

/// Maps task-context models to the slots that can host them, and tracks
/// the closure of models deployable through fulfillment.
#[derive(Debug, Default)]
pub struct DeploymentCandidateIndex {
    deployable: BTreeSet<ModelName>,
    candidates: BTreeMap<ModelName, BTreeSet<DeploymentSlot>>,
}

impl DeploymentCandidateIndex {
    /// Builds the index from the available deployments.
    ///
    /// The deployable-model closure starts from every deployed task
    /// context, then grows by (a) every component or data-service model a
    /// member fulfills and (b) every composition whose children are all
    /// deployable. The abstract roots never enter the final set.
    pub fn build(registry: &ModelRegistry, available: &[AvailableDeployment]) -> Self {
        let mut index = DeploymentCandidateIndex::default();

        for av in available {
            let Some(deployment) = registry.deployment(&av.model) else {
                tracing::warn!(model = %av.model, "available deployment has no registered model");
                continue;
            };
            for deployed in &deployment.tasks {
                let slot = DeploymentSlot {
                    host: av.host.clone(),
                    deployment: deployment.name.clone(),
                    task_name: deployed.name.clone(),
                };
                index
                    .candidates
                    .entry(deployed.model.clone())
                    .or_default()
                    .insert(slot);
                index.deployable.insert(deployed.model.clone());
            }
        }

        loop {
            let mut added: Vec<ModelName> = Vec::new();
            for name in &index.deployable {
                if let Some(model) = registry.find(name) {
                    for fulfilled in &model.fulfilled {
                        if index.deployable.contains(fulfilled) {
                            continue;
                        }
                        // Component and data-service kinds only; process
                        // pseudo-models never become deployable.
                        let kind = registry.find(fulfilled).map(|m| m.kind);
                        if !matches!(kind, Some(ModelKind::Generic)) {
                            added.push(fulfilled.clone());
                        }
                    }
                }
            }
            for model in registry.each_model() {
                if model.kind != ModelKind::Composition
                    || index.deployable.contains(&model.name)
                    || model.children.is_empty()
                {
                    continue;
                }
                let all_deployable = model.children.iter().all(|child| {
                    index.deployable.contains(&child.model)
                        || index
                            .deployable
                            .iter()
                            .any(|d| registry.find(d).is_some_and(|m| m.fulfills(&child.model)))
                });
                if all_deployable {
                    added.push(model.name.clone());
                }
            }
            if added.is_empty() {
                break;
            }
            index.deployable.extend(added);
        }

        for root in ABSTRACT_ROOTS {
            index.deployable.remove(root);
        }
        index
    }

    pub fn deployable_models(&self) -> &BTreeSet<ModelName> {
        &self.deployable
    }

    /// Candidate slots for a task's model: exact model first, then the
    /// first fulfilled model with candidates.
    pub fn candidates_for(&self, model: &crate::model::ComponentModel) -> Vec<DeploymentSlot> {
        if let Some(set) = self.candidates.get(&model.name) {
            return set.iter().cloned().collect();
        }
        for fulfilled in &model.fulfilled {
            if let Some(set) = self.candidates.get(fulfilled) {
                return set.iter().cloned().collect();
            }
        }
        Vec::new()
    }
}

/// Result of one selection pass.
#[derive(Debug, Default)]
pub struct SelectionOutcome {
    pub selected: Vec<(TaskId, DeploymentSlot)>,
    pub missing: Vec<MissingDeployment>,
}

/// Chooses one deployment slot per task context without an execution
/// agent. A slot is unique: binding it twice reports the second taker.
pub fn select_deployments(plan: &Plan, index: &DeploymentCandidateIndex) -> SelectionOutcome {
    let mut outcome = SelectionOutcome::default();
    let mut bound: BTreeMap<DeploymentSlot, TaskId> = BTreeMap::new();

    // Slots already taken by deployed tasks in the plan.
    for (id, task) in plan.tasks() {
        if let (Some(agent), Some(name)) = (task.execution_agent, &task.orocos_name) {
            if let Some(info) = plan.find_task(agent).and_then(|a| a.deployment.as_ref()) {
                bound.insert(
                    DeploymentSlot {
                        host: info.host.clone(),
                        deployment: info.model.name.clone(),
                        task_name: name.clone(),
                    },
                    id,
                );
            }
        }
    }

    for id in plan.task_ids() {
        let task = plan.task(id);
        if !task.model.is_task_context()
            || task.is_abstract
            || task.execution_agent.is_some()
            || task.finished()
        {
            continue;
        }

        let candidates = index.candidates_for(&task.model);
        if candidates.is_empty() {
            outcome.missing.push(MissingDeployment {
                task: id,
                model: task.model.name.clone(),
                reason: MissingReason::NoCandidates,
                candidates: Vec::new(),
            });
            continue;
        }

        let chosen = if candidates.len() == 1 {
            candidates[0].clone()
        } else if let Some(name) = &task.orocos_name {
            let matching: Vec<_> = candidates
                .iter()
                .filter(|c| c.task_name == *name)
                .cloned()
                .collect();
            if matching.len() == 1 {
                matching.into_iter().next().expect("one match")
            } else {
                outcome.missing.push(MissingDeployment {
                    task: id,
                    model: task.model.name.clone(),
                    reason: MissingReason::NameMismatch,
                    candidates: with_bindings(&candidates, &bound),
                });
                continue;
            }
        } else {
            let filtered: Vec<_> = if task.deployment_hints.is_empty() {
                candidates.clone()
            } else {
                candidates
                    .iter()
                    .filter(|c| task.deployment_hints.iter().any(|h| h.matches(c)))
                    .cloned()
                    .collect()
            };
            if filtered.len() == 1 {
                filtered.into_iter().next().expect("one survivor")
            } else {
                outcome.missing.push(MissingDeployment {
                    task: id,
                    model: task.model.name.clone(),
                    reason: MissingReason::Ambiguous,
                    candidates: with_bindings(&candidates, &bound),
                });
                continue;
            }
        };

        if let Some(&taker) = bound.get(&chosen) {
            outcome.missing.push(MissingDeployment {
                task: id,
                model: task.model.name.clone(),
                reason: MissingReason::SlotTaken,
                candidates: vec![(chosen, Some(taker))],
            });
            continue;
        }
        bound.insert(chosen.clone(), id);
        outcome.selected.push((id, chosen));
    }

    outcome
}

fn with_bindings(
    candidates: &[DeploymentSlot],
    bound: &BTreeMap<DeploymentSlot, TaskId>,
) -> Vec<(DeploymentSlot, Option<TaskId>)> {
    candidates
        .iter()
        .map(|c| (c.clone(), bound.get(c).copied()))
        .collect()
}

/// Materializes the selected slots: one deployment-instance task per
/// (host, deployment model), one deployed task per slot, and a merge of
/// each original task into its deployed counterpart.
pub fn apply_selected_deployments(
    plan: &mut Plan,
    registry: &ModelRegistry,
    solver: &mut MergeSolver,
    selected: &[(TaskId, DeploymentSlot)],
) -> Result<usize, ResolutionError> {
    let mut instances: BTreeMap<(String, String), TaskId> = BTreeMap::new();
    for id in plan.deployments() {
        let info = plan
            .task(id)
            .deployment
            .clone()
            .expect("deployments() returns deployment tasks");
        instances.insert((info.host, info.model.name.clone()), id);
    }

    let mut applied = 0;
    for (original, slot) in selected {
        let deployment_model = registry.deployment(&slot.deployment).ok_or_else(|| {
            ResolutionError::internal(format!(
                "selected deployment model '{}' is not registered",
                slot.deployment
            ))
        })?;
        let key = (slot.host.clone(), slot.deployment.clone());
        let instance = match instances.get(&key) {
            Some(&id) => id,
            None => {
                let id = plan.add(Task::deployment(deployment_model.clone(), slot.host.clone()));
                instances.insert(key, id);
                id
            }
        };

        let deployed = deployed_task(plan, registry, &deployment_model, instance, slot)?;
        let group = BTreeMap::from([(*original, deployed)]);
        solver.apply_merge_group(plan, &group)?;
        applied += 1;
        tracing::debug!(task = %original, slot = %slot, "deployed");
    }
    Ok(applied)
}

/// The task deployed under `slot` on `instance`, created on first use.
fn deployed_task(
    plan: &mut Plan,
    registry: &ModelRegistry,
    deployment_model: &Arc<crate::model::DeploymentModel>,
    instance: TaskId,
    slot: &DeploymentSlot,
) -> Result<TaskId, ResolutionError> {
    let existing = plan.task_ids().into_iter().find(|&id| {
        let t = plan.task(id);
        t.execution_agent == Some(instance) && t.orocos_name.as_deref() == Some(&slot.task_name)
    });
    if let Some(id) = existing {
        return Ok(id);
    }

    let deployed_model = deployment_model.find_task(&slot.task_name).ok_or_else(|| {
        ResolutionError::internal(format!(
            "deployment '{}' does not define task '{}'",
            deployment_model.name, slot.task_name
        ))
    })?;
    let model = registry.find(&deployed_model.model).ok_or_else(|| {
        ResolutionError::internal(format!(
            "deployed task model '{}' is not registered",
            deployed_model.model
        ))
    })?;

    let mut task = Task::new(model);
    task.orocos_name = Some(slot.task_name.clone());
    task.execution_agent = Some(instance);
    Ok(plan.add(task))
}
