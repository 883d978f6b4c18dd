//! Adapts the freshly deployed network against the deployments that are
//! already running, reusing compatible tasks and spawning replacements
//! with a stop-then-configure ordering where reuse is impossible.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::ResolutionError;
use crate::merge::MergeSolver;
use crate::model::ConnectionPolicy;
use crate::plan::{EventKind, ExecState, Plan, Task, TaskId};
use crate::transaction::Transaction;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Running or pending tasks reused as-is.
    pub reused: usize,
    /// Tasks replaced by a fresh spawn ordered after their stop.
    pub respawned: usize,
}

/// Reconciles the working plan against the running network.
///
/// `previous_instances` names the real tasks resolved by earlier passes;
/// their subgraphs are imported so the merge solver can unify unchanged
/// parts of the network instead of rebuilding them.
pub fn reconcile(
    real: &Plan,
    txn: &mut Transaction,
    solver: &mut MergeSolver,
    previous_instances: &BTreeMap<TaskId, TaskId>,
) -> Result<ReconcileStats, ResolutionError> {
    let mut stats = ReconcileStats::default();

    for &instance in previous_instances.values() {
        wrap_closure(txn, real, instance);
    }

    // Pair every new deployment instance with its running counterpart,
    // and every hosted task with the running task of the same name.
    let new_deployments: Vec<TaskId> = txn
        .work()
        .deployments()
        .into_iter()
        .filter(|&id| !txn.work().task(id).is_proxy())
        .collect();

    struct Pairing {
        deployment: TaskId,
        process_name: String,
        existing: Option<TaskId>,
        /// (hosted work task, wrapped running task with the same name)
        hosted: Vec<(TaskId, Option<TaskId>)>,
    }

    let mut pairings = Vec::new();
    for deployment in new_deployments {
        let process_name = match &txn.work().task(deployment).deployment {
            Some(info) => info.process_name.clone(),
            None => {
                return Err(ResolutionError::internal(format!(
                    "deployment task {deployment} has no process_name"
                )))
            }
        };

        let matching: Vec<TaskId> = real
            .deployments()
            .into_iter()
            .filter(|&id| {
                let task = real.task(id);
                !task.finished()
                    && !task.finishing()
                    && task
                        .deployment
                        .as_ref()
                        .is_some_and(|info| info.process_name == process_name)
            })
            .collect();
        if matching.len() > 1 {
            return Err(ResolutionError::internal(format!(
                "duplicate running deployments for process '{process_name}'"
            )));
        }
        let existing = matching.first().copied();

        let mut hosted = Vec::new();
        if let Some(existing_real) = existing {
            let existing_proxy = txn.wrap_task(real, existing_real);
            let hosted_tasks: Vec<TaskId> = txn
                .work()
                .task_ids()
                .into_iter()
                .filter(|&id| txn.work().task(id).execution_agent == Some(deployment))
                .collect();
            for task in hosted_tasks {
                let Some(name) = txn.work().task(task).orocos_name.clone() else {
                    continue;
                };
                let running = find_running_counterpart(real, existing_real, &name);
                let proxy = running.map(|r| txn.wrap_task(real, r));
                hosted.push((task, proxy));
            }
            pairings.push(Pairing {
                deployment,
                process_name,
                existing: Some(existing_proxy),
                hosted,
            });
        } else {
            pairings.push(Pairing {
                deployment,
                process_name,
                existing: None,
                hosted,
            });
        }
    }

    scrub(txn);

    for pairing in &pairings {
        let Some(existing_proxy) = pairing.existing else {
            continue;
        };
        for &(task, counterpart) in &pairing.hosted {
            if !txn.work().contains(task) {
                continue;
            }
            match counterpart.filter(|&c| txn.work().contains(c)) {
                Some(running) if can_be_deployed_by(txn.work(), task, running) => {
                    let group = BTreeMap::from([(task, running)]);
                    solver.apply_merge_group(txn.work_mut(), &group)?;
                    stats.reused += 1;
                    tracing::debug!(%task, %running, "reusing running task");
                }
                Some(running) => {
                    let fresh = spawn_replacement(txn.work_mut(), task, existing_proxy);
                    detach_from_component_parents(txn.work_mut(), running);
                    txn.work_mut()
                        .add_ordering((running, EventKind::Stop), (fresh, EventKind::Configure));
                    let group = BTreeMap::from([(task, fresh)]);
                    solver.apply_merge_group(txn.work_mut(), &group)?;
                    stats.respawned += 1;
                    tracing::debug!(%task, old = %running, new = %fresh, "respawning incompatible task");
                }
                None => {
                    // The task is new to this process; it moves over when
                    // the deployment instances merge below.
                }
            }
        }
        let group = BTreeMap::from([(pairing.deployment, existing_proxy)]);
        solver.apply_merge_group(txn.work_mut(), &group)?;
    }

    stats.respawned += replace_static_port_changes(real, txn, solver)?;

    // New deployments start strictly after a finishing process of the
    // same name has stopped.
    for pairing in &pairings {
        let finishing: Vec<TaskId> = real
            .deployments()
            .into_iter()
            .filter(|&id| {
                let task = real.task(id);
                task.finishing()
                    && task
                        .deployment
                        .as_ref()
                        .is_some_and(|info| info.process_name == pairing.process_name)
            })
            .collect();
        if finishing.is_empty() {
            continue;
        }
        let current = solver.replacement_for(pairing.deployment);
        if !txn.work().contains(current) {
            continue;
        }
        for old in finishing {
            let old_proxy = txn.wrap_task(real, old);
            txn.work_mut()
                .add_ordering((old_proxy, EventKind::Stop), (current, EventKind::Start));
        }
    }

    Ok(stats)
}

/// Imports a real task and its dependency closure into the transaction.
fn wrap_closure(txn: &mut Transaction, real: &Plan, root: TaskId) {
    let mut stack = vec![root];
    let mut seen = BTreeSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) || !real.contains(id) || real.task(id).finished() {
            continue;
        }
        txn.wrap_task(real, id);
        stack.extend(real.children(id));
    }
}

/// The running task deployed under `name` on `deployment`, preferring a
/// running task over a pending one.
fn find_running_counterpart(real: &Plan, deployment: TaskId, name: &str) -> Option<TaskId> {
    let mut candidates: Vec<TaskId> = real
        .task_ids()
        .into_iter()
        .filter(|&id| {
            let task = real.task(id);
            task.execution_agent == Some(deployment)
                && task.orocos_name.as_deref() == Some(name)
                && !task.finished()
        })
        .collect();
    candidates.sort_by_key(|&id| (real.task(id).state != ExecState::Running, id));
    candidates.first().copied()
}

/// Pre-merge scrubbing: non-reusable tasks lose their edges, abstract
/// proxies leave the transaction, and connection pairs that name a port
/// missing on either endpoint are dropped as stale.
fn scrub(txn: &mut Transaction) {
    for id in txn.work().task_ids() {
        let task = txn.work().task(id);
        if !task.is_proxy() {
            continue;
        }
        if task.is_abstract {
            txn.release_task(id);
            continue;
        }
        if !task.reusable {
            txn.work_mut().clear_task_edges(id);
        }
    }

    let edges = txn.work().dataflow_edges();
    for (source, sink) in edges {
        let Some(set) = txn.work().connections_between(source, sink).cloned() else {
            continue;
        };
        let source_model = txn.work().task(source).model.clone();
        let sink_model = txn.work().task(sink).model.clone();
        for (sp, dp) in set.keys() {
            let source_stale =
                !source_model.outputs.is_empty() && source_model.find_output_port(sp).is_none();
            let sink_stale =
                !sink_model.inputs.is_empty() && sink_model.find_input_port(dp).is_none();
            if source_stale || sink_stale {
                tracing::debug!(%source, %sink, source_port = %sp, sink_port = %dp, "dropping stale connection");
                txn.work_mut().disconnect_pair(source, sink, sp, dp);
            }
        }
    }
}

/// Whether the running task `existing` can host what `wanted` asks for.
fn can_be_deployed_by(plan: &Plan, wanted: TaskId, existing: TaskId) -> bool {
    let wanted = plan.task(wanted);
    let existing_task = plan.task(existing);
    if !existing_task.model.fulfills(&wanted.model.name) {
        return false;
    }
    if !existing_task.reusable || existing_task.finished() || existing_task.finishing() {
        return false;
    }
    for (key, value) in &wanted.arguments {
        if let Some(other) = existing_task.arguments.get(key) {
            if value != other {
                return false;
            }
        }
    }
    true
}

/// A fresh task shaped like `template`, hosted by `agent`.
fn spawn_replacement(plan: &mut Plan, template: TaskId, agent: TaskId) -> TaskId {
    let source = plan.task(template).clone();
    let mut fresh = Task::new(source.model.clone());
    fresh.arguments = source.arguments;
    fresh.selections = source.selections;
    fresh.orocos_name = source.orocos_name;
    fresh.deployment_hints = source.deployment_hints;
    fresh.execution_agent = Some(agent);
    plan.add(fresh)
}

/// Removes the dependency edges binding `id` under component parents,
/// leaving only its runtime anchoring.
fn detach_from_component_parents(plan: &mut Plan, id: TaskId) {
    for parent in plan.parents(id) {
        if !plan.task(parent).is_deployment() {
            plan.remove_dependency(parent, id);
        }
    }
}

/// Already-configured tasks whose static ports the staged changes would
/// rewire cannot be reconfigured in place: a fresh task takes over their
/// relations, ordered to configure after the old task stops.
fn replace_static_port_changes(
    real: &Plan,
    txn: &mut Transaction,
    solver: &mut MergeSolver,
) -> Result<usize, ResolutionError> {
    let mut replaced = 0;
    for id in txn.work().task_ids() {
        let task = txn.work().task(id);
        let Some(real_id) = task.proxy_of else {
            continue;
        };
        if !task.setup || task.is_deployment() {
            continue;
        }
        let model = task.model.clone();
        let static_ports: Vec<(String, bool)> = model
            .inputs
            .iter()
            .filter(|p| p.is_static)
            .map(|p| (p.name.clone(), true))
            .chain(
                model
                    .outputs
                    .iter()
                    .filter(|p| p.is_static)
                    .map(|p| (p.name.clone(), false)),
            )
            .collect();
        if static_ports.is_empty() {
            continue;
        }

        let changed = static_ports.iter().any(|(port, is_input)| {
            let old = real_port_connections(real, real_id, port, *is_input);
            let new = work_port_connections(txn, id, port, *is_input);
            old != new
        });
        if !changed {
            continue;
        }

        let agent = txn
            .work()
            .task(id)
            .execution_agent
            .ok_or_else(|| ResolutionError::internal(format!("configured task {id} has no execution agent")))?;
        let fresh = spawn_replacement(txn.work_mut(), id, agent);
        txn.work_mut().replace(id, fresh);
        txn.work_mut()
            .add_ordering((id, EventKind::Stop), (fresh, EventKind::Configure));
        solver.register_replacement(id, fresh);
        replaced += 1;
        tracing::debug!(old = %id, new = %fresh, "static port change forces reconfiguration");
    }
    Ok(replaced)
}

type PortPeers = BTreeSet<(TaskId, String, String, ConnectionPolicy)>;

fn real_port_connections(real: &Plan, id: TaskId, port: &str, is_input: bool) -> PortPeers {
    let mut out = PortPeers::new();
    if is_input {
        for (peer, sp, dp, policy) in real.in_connections(id) {
            if dp == port {
                out.insert((peer, sp, dp, policy));
            }
        }
    } else {
        for (peer, sp, dp, policy) in real.out_connections(id) {
            if sp == port {
                out.insert((peer, sp, dp, policy));
            }
        }
    }
    out
}

/// Work-side connections on a port, with proxy peers mapped to their real
/// task so they compare equal to the running network's edges. Handles of
/// tasks created in the transaction never collide with real handles, so
/// a genuinely new peer always reads as a change.
fn work_port_connections(txn: &Transaction, id: TaskId, port: &str, is_input: bool) -> PortPeers {
    let map_peer = |peer: TaskId| txn.real_for(peer).unwrap_or(peer);
    let mut out = PortPeers::new();
    if is_input {
        for (peer, sp, dp, policy) in txn.work().in_connections(id) {
            if dp == port {
                out.insert((map_peer(peer), sp, dp, policy));
            }
        }
    } else {
        for (peer, sp, dp, policy) in txn.work().out_connections(id) {
            if sp == port {
                out.insert((map_peer(peer), sp, dp, policy));
            }
        }
    }
    out
}
