//! Expands requirement tasks into concrete subgraphs and auto-allocates
//! devices from the dependency-injection selections of each task's
//! ancestors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use crate::error::ResolutionError;
use crate::model::ModelRegistry;
use crate::plan::{Plan, TaskId};
use crate::requirements::{FulfilledModel, InstanceRequirements};

/// Output of the instantiation stage.
#[derive(Debug, Default)]
pub struct Instantiation {
    /// Requirement task to the root of its instantiated subgraph.
    pub required_instances: BTreeMap<TaskId, TaskId>,
    /// What each root fulfills.
    pub fulfilled: BTreeMap<TaskId, FulfilledModel>,
}

/// Instantiates every requirement into the working plan, in requirement
/// order. Each root is marked permanent so it anchors garbage collection
/// until the network is finished.
pub fn instantiate_requirements(
    plan: &mut Plan,
    registry: &ModelRegistry,
    strict_specializations: bool,
    requirements: &[(TaskId, Arc<InstanceRequirements>)],
) -> Result<Instantiation, ResolutionError> {
    let mut out = Instantiation::default();
    for (req_id, req) in requirements {
        let root = req.instantiate(plan, registry, strict_specializations)?;
        plan.mark_permanent(root);
        out.required_instances.insert(*req_id, root);
        let root_model = plan.task(root).model.clone();
        out.fulfilled.insert(*req_id, req.fulfilled_model(&root_model));
        tracing::debug!(requirement = %req_id, %root, model = %root_model.name, "instantiated");
    }
    Ok(out)
}

/// Binds master driver services to devices.
///
/// For each service without a bound device, the resolved
/// dependency-injection selections of the task and its ancestors are
/// searched for the service's `<name>_dev` key. A single distinct answer
/// binds the device; disagreement or silence leaves the service unbound
/// for the allocation validator to report.
pub fn allocate_devices(plan: &mut Plan) {
    // The ancestor walk may revisit nodes through diamonds; visible
    // selections are memoized per argument name for the whole call.
    let mut memo: BTreeMap<String, BTreeMap<TaskId, BTreeSet<String>>> = BTreeMap::new();

    for id in plan.task_ids() {
        let services = plan.task(id).model.driver_services.clone();
        for service in services {
            let argument = service.device_argument();
            if plan.task(id).argument(&argument).is_some() {
                continue;
            }
            let visible = visible_selections(plan, id, &argument, memo.entry(argument.clone()).or_default());
            if visible.len() == 1 {
                let device = visible.into_iter().next().expect("one selection");
                tracing::debug!(task = %id, service = %service.name, %device, "device allocated");
                plan.task_mut(id)
                    .set_argument(argument, Value::String(device));
            }
        }
    }
}

/// The distinct selections for `argument` visible from `id`: its own
/// resolved selections plus everything its ancestors selected.
fn visible_selections(
    plan: &Plan,
    id: TaskId,
    argument: &str,
    memo: &mut BTreeMap<TaskId, BTreeSet<String>>,
) -> BTreeSet<String> {
    if let Some(cached) = memo.get(&id) {
        return cached.clone();
    }
    // Breaks diamond revisits; the dependency graph is acyclic so the
    // placeholder is only observed while the node is on the stack.
    memo.insert(id, BTreeSet::new());

    let mut visible = BTreeSet::new();
    if let Some(value) = plan.task(id).selections.get(argument) {
        visible.insert(value.clone());
    }
    for parent in plan.parents(id) {
        visible.extend(visible_selections(plan, parent, argument, memo));
    }

    memo.insert(id, visible.clone());
    visible
}
