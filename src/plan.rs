//! The working plan: tasks, the relation graphs between them, and the
//! operations the resolver uses to rewrite them.
//!
//! Tasks are identified by a stable integer handle assigned at insertion.
//! Every relation graph keys on handles, never on object identity, so
//! substituting a staging proxy for its real task is a first-class
//! rewrite. Iteration orders follow the handle order, which is the
//! creation order, keeping every pass deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use regex::Regex;
use serde_json::Value;

use crate::error::DeploymentSlot;
use crate::model::{ComponentModel, ConnectionPolicy, DeploymentModel};
use crate::requirements::InstanceRequirements;

/// Stable handle of a task within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn index(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a task, as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecState {
    Pending,
    Starting,
    Running,
    Finishing,
    Finished,
}

/// Task events that ordering constraints can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    Configure,
    Start,
    Stop,
}

pub type EventRef = (TaskId, EventKind);

/// `before` must be emitted strictly before `after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderingConstraint {
    pub before: EventRef,
    pub after: EventRef,
}

/// A matcher narrowing which deployment slots a task accepts.
#[derive(Debug, Clone)]
pub enum DeploymentHint {
    /// Matches a deployment model by exact identity.
    Deployment(String),
    /// Matches the deployment model name or the deployment-local task name.
    NameMatch(Regex),
}

impl DeploymentHint {
    pub fn matches(&self, slot: &DeploymentSlot) -> bool {
        match self {
            DeploymentHint::Deployment(name) => slot.deployment == *name,
            DeploymentHint::NameMatch(re) => {
                re.is_match(&slot.deployment) || re.is_match(&slot.task_name)
            }
        }
    }
}

/// Connection set labelling a dataflow edge: (source port, sink port) to
/// transport policy.
pub type ConnectionSet = BTreeMap<(String, String), ConnectionPolicy>;

/// Labels of a dependency edge: the roles the child fills in the parent.
#[derive(Debug, Clone, Default)]
pub struct DependencyInfo {
    pub roles: BTreeSet<String>,
}

/// State carried by a task representing an OS process.
#[derive(Debug, Clone)]
pub struct DeploymentInfo {
    pub process_name: String,
    pub host: String,
    pub model: Arc<DeploymentModel>,
}

/// A mutable node of the plan.
#[derive(Clone)]
pub struct Task {
    pub model: Arc<ComponentModel>,
    /// Set arguments; an argument absent from the map is unset.
    pub arguments: BTreeMap<String, Value>,
    /// Resolved dependency-injection selections this task was
    /// instantiated with. Consulted by device auto-allocation.
    pub selections: BTreeMap<String, String>,
    pub is_abstract: bool,
    pub execution_agent: Option<TaskId>,
    pub orocos_name: Option<String>,
    pub deployment_hints: Vec<DeploymentHint>,
    pub state: ExecState,
    pub reusable: bool,
    /// Whether the task has already gone through configuration.
    pub setup: bool,
    /// Real-plan task this staging copy stands for, if any.
    pub proxy_of: Option<TaskId>,
    pub deployment: Option<DeploymentInfo>,
    /// Device tasks attached to this bus task.
    pub attachments: BTreeSet<TaskId>,
    /// For requirement tasks: what must be planned.
    pub requirements: Option<Arc<InstanceRequirements>>,
}

impl Task {
    pub fn new(model: Arc<ComponentModel>) -> Self {
        let is_abstract = model.is_abstract();
        Task {
            model,
            arguments: BTreeMap::new(),
            selections: BTreeMap::new(),
            is_abstract,
            execution_agent: None,
            orocos_name: None,
            deployment_hints: Vec::new(),
            state: ExecState::Pending,
            reusable: true,
            setup: false,
            proxy_of: None,
            deployment: None,
            attachments: BTreeSet::new(),
            requirements: None,
        }
    }

    /// A task standing for one OS process described by `model` on `host`.
    pub fn deployment(model: Arc<DeploymentModel>, host: impl Into<String>) -> Self {
        let host = host.into();
        let pseudo = ComponentModel::generic(format!("deployment::{}", model.name));
        let mut task = Task::new(Arc::new(pseudo));
        task.deployment = Some(DeploymentInfo {
            process_name: model.name.clone(),
            host,
            model,
        });
        task
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(name.into(), value);
        self
    }

    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }

    pub fn set_argument(&mut self, name: impl Into<String>, value: Value) {
        self.arguments.insert(name.into(), value);
    }

    /// Device bound to the given master driver service, if any.
    pub fn bound_device(&self, service: &crate::model::DriverService) -> Option<&str> {
        self.argument(&service.device_argument()).and_then(Value::as_str)
    }

    pub fn is_proxy(&self) -> bool {
        self.proxy_of.is_some()
    }

    pub fn is_deployment(&self) -> bool {
        self.deployment.is_some()
    }

    pub fn finished(&self) -> bool {
        self.state == ExecState::Finished
    }

    pub fn finishing(&self) -> bool {
        self.state == ExecState::Finishing
    }

    pub fn running(&self) -> bool {
        self.state == ExecState::Running
    }

    pub fn pending(&self) -> bool {
        self.state == ExecState::Pending
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("model", &self.model.name)
            .field("abstract", &self.is_abstract)
            .field("agent", &self.execution_agent)
            .field("orocos_name", &self.orocos_name)
            .field("state", &self.state)
            .field("proxy_of", &self.proxy_of)
            .finish_non_exhaustive()
    }
}

/// A plan: tasks plus the dependency, dataflow and event-ordering
/// relations between them.
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
    dependency: DiGraphMap<TaskId, DependencyInfo>,
    dataflow: DiGraphMap<TaskId, ConnectionSet>,
    ordering: BTreeSet<OrderingConstraint>,
    permanent: BTreeSet<TaskId>,
    /// Requirement task to the task currently planned for it.
    planning: BTreeMap<TaskId, TaskId>,
    next_id: u64,
}

impl Plan {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// A plan whose handles start at `next_id`. Staging plans continue the
    /// handle sequence of the plan they stage for, so that handles stay
    /// unique across both.
    pub fn starting_at(next_id: u64) -> Self {
        Plan {
            tasks: BTreeMap::new(),
            dependency: DiGraphMap::new(),
            dataflow: DiGraphMap::new(),
            ordering: BTreeSet::new(),
            permanent: BTreeSet::new(),
            planning: BTreeMap::new(),
            next_id,
        }
    }

    pub fn next_task_id(&self) -> u64 {
        self.next_id
    }

    /// Advances the handle counter so future insertions stay above
    /// handles a staging plan already allocated.
    pub(crate) fn bump_next_task_id(&mut self, at_least: u64) {
        self.next_id = self.next_id.max(at_least);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn add(&mut self, task: Task) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.insert(id, task);
        self.dependency.add_node(id);
        self.dataflow.add_node(id);
        id
    }

    pub fn add_permanent_task(&mut self, task: Task) -> TaskId {
        let id = self.add(task);
        self.permanent.insert(id);
        id
    }

    pub fn mark_permanent(&mut self, id: TaskId) {
        self.permanent.insert(id);
    }

    pub fn unmark_permanent_task(&mut self, id: TaskId) {
        self.permanent.remove(&id);
    }

    pub fn clear_permanent_marks(&mut self) {
        self.permanent.clear();
    }

    pub fn is_permanent(&self, id: TaskId) -> bool {
        self.permanent.contains(&id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// The task behind a handle. Panics if the handle does not belong to
    /// this plan; handles are only ever produced by plan insertion.
    pub fn task(&self, id: TaskId) -> &Task {
        self.tasks.get(&id).expect("task handle not in plan")
    }

    pub fn task_mut(&mut self, id: TaskId) -> &mut Task {
        self.tasks.get_mut(&id).expect("task handle not in plan")
    }

    pub fn find_task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Handles in creation order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.keys().copied().collect()
    }

    /// Tasks in creation order.
    pub fn tasks(&self) -> impl Iterator<Item = (TaskId, &Task)> {
        self.tasks.iter().map(|(&id, task)| (id, task))
    }

    pub fn remove_task(&mut self, id: TaskId) -> Option<Task> {
        let task = self.tasks.remove(&id)?;
        self.dependency.remove_node(id);
        self.dataflow.remove_node(id);
        self.ordering
            .retain(|c| c.before.0 != id && c.after.0 != id);
        self.permanent.remove(&id);
        self.planning.retain(|&req, &mut planned| req != id && planned != id);
        Some(task)
    }

    // --- dependency relation -------------------------------------------

    pub fn add_dependency(&mut self, parent: TaskId, child: TaskId, role: impl Into<String>) {
        let role = role.into();
        match self.dependency.edge_weight_mut(parent, child) {
            Some(info) => {
                info.roles.insert(role);
            }
            None => {
                let mut info = DependencyInfo::default();
                info.roles.insert(role);
                self.dependency.add_edge(parent, child, info);
            }
        }
    }

    pub fn remove_dependency(&mut self, parent: TaskId, child: TaskId) {
        self.dependency.remove_edge(parent, child);
    }

    pub fn dependency_roles(&self, parent: TaskId, child: TaskId) -> Option<&BTreeSet<String>> {
        self.dependency.edge_weight(parent, child).map(|i| &i.roles)
    }

    /// Narrows the roles of a dependency edge, removing the edge when none
    /// survive.
    pub fn narrow_dependency_roles(
        &mut self,
        parent: TaskId,
        child: TaskId,
        keep: &BTreeSet<String>,
    ) {
        let drop_edge = match self.dependency.edge_weight_mut(parent, child) {
            Some(info) => {
                info.roles.retain(|r| keep.contains(r));
                info.roles.is_empty()
            }
            None => false,
        };
        if drop_edge {
            self.dependency.remove_edge(parent, child);
        }
    }

    pub fn parents(&self, id: TaskId) -> Vec<TaskId> {
        let mut out: Vec<_> = self
            .dependency
            .neighbors_directed(id, Direction::Incoming)
            .collect();
        out.sort();
        out
    }

    pub fn children(&self, id: TaskId) -> Vec<TaskId> {
        let mut out: Vec<_> = self
            .dependency
            .neighbors_directed(id, Direction::Outgoing)
            .collect();
        out.sort();
        out
    }

    pub fn has_dependency_path(&self, from: TaskId, to: TaskId) -> bool {
        has_path_connecting(&self.dependency, from, to, None)
    }

    /// Dependency edges incident on `id`, as (parent, child, info).
    pub fn incident_dependencies(&self, id: TaskId) -> Vec<(TaskId, TaskId, DependencyInfo)> {
        let mut out = Vec::new();
        for parent in self.parents(id) {
            if let Some(info) = self.dependency.edge_weight(parent, id) {
                out.push((parent, id, info.clone()));
            }
        }
        for child in self.children(id) {
            if let Some(info) = self.dependency.edge_weight(id, child) {
                out.push((id, child, info.clone()));
            }
        }
        out
    }

    // --- dataflow relation ---------------------------------------------

    pub fn connect(
        &mut self,
        source: TaskId,
        source_port: impl Into<String>,
        sink: TaskId,
        sink_port: impl Into<String>,
        policy: ConnectionPolicy,
    ) {
        let key = (source_port.into(), sink_port.into());
        match self.dataflow.edge_weight_mut(source, sink) {
            Some(set) => {
                set.insert(key, policy);
            }
            None => {
                let mut set = ConnectionSet::new();
                set.insert(key, policy);
                self.dataflow.add_edge(source, sink, set);
            }
        }
    }

    pub fn connections_between(&self, source: TaskId, sink: TaskId) -> Option<&ConnectionSet> {
        self.dataflow.edge_weight(source, sink)
    }

    pub fn disconnect_pair(
        &mut self,
        source: TaskId,
        sink: TaskId,
        source_port: &str,
        sink_port: &str,
    ) {
        let drop_edge = match self.dataflow.edge_weight_mut(source, sink) {
            Some(set) => {
                set.remove(&(source_port.to_string(), sink_port.to_string()));
                set.is_empty()
            }
            None => false,
        };
        if drop_edge {
            self.dataflow.remove_edge(source, sink);
        }
    }

    /// Incoming connections of `id`, as (source, source port, sink port,
    /// policy), sorted.
    pub fn in_connections(&self, id: TaskId) -> Vec<(TaskId, String, String, ConnectionPolicy)> {
        let mut sources: Vec<_> = self
            .dataflow
            .neighbors_directed(id, Direction::Incoming)
            .collect();
        sources.sort();
        let mut out = Vec::new();
        for source in sources {
            if let Some(set) = self.dataflow.edge_weight(source, id) {
                for ((sp, dp), &policy) in set {
                    out.push((source, sp.clone(), dp.clone(), policy));
                }
            }
        }
        out
    }

    /// Outgoing connections of `id`, as (sink, source port, sink port,
    /// policy), sorted.
    pub fn out_connections(&self, id: TaskId) -> Vec<(TaskId, String, String, ConnectionPolicy)> {
        let mut sinks: Vec<_> = self
            .dataflow
            .neighbors_directed(id, Direction::Outgoing)
            .collect();
        sinks.sort();
        let mut out = Vec::new();
        for sink in sinks {
            if let Some(set) = self.dataflow.edge_weight(id, sink) {
                for ((sp, dp), &policy) in set {
                    out.push((sink, sp.clone(), dp.clone(), policy));
                }
            }
        }
        out
    }

    /// Dataflow edges as (source, sink) pairs, sorted.
    pub fn dataflow_edges(&self) -> Vec<(TaskId, TaskId)> {
        let mut out: Vec<_> = self.dataflow.all_edges().map(|(a, b, _)| (a, b)).collect();
        out.sort();
        out
    }

    /// Every dataflow edge with its connection set, sorted.
    pub fn dataflow_edge_sets(&self) -> Vec<(TaskId, TaskId, ConnectionSet)> {
        let mut out: Vec<_> = self
            .dataflow
            .all_edges()
            .map(|(a, b, set)| (a, b, set.clone()))
            .collect();
        out.sort_by_key(|&(a, b, _)| (a, b));
        out
    }

    /// Every dependency edge with its info, sorted.
    pub fn dependency_edges(&self) -> Vec<(TaskId, TaskId, DependencyInfo)> {
        let mut out: Vec<_> = self
            .dependency
            .all_edges()
            .map(|(a, b, info)| (a, b, info.clone()))
            .collect();
        out.sort_by_key(|&(a, b, _)| (a, b));
        out
    }

    /// Permanent handles, sorted.
    pub fn permanent_tasks(&self) -> Vec<TaskId> {
        self.permanent.iter().copied().collect()
    }

    pub fn remove_dataflow_edge(&mut self, source: TaskId, sink: TaskId) {
        self.dataflow.remove_edge(source, sink);
    }

    /// Removes every dependency and dataflow edge incident on `id`.
    pub fn clear_task_edges(&mut self, id: TaskId) {
        for parent in self.parents(id) {
            self.dependency.remove_edge(parent, id);
        }
        for child in self.children(id) {
            self.dependency.remove_edge(id, child);
        }
        let incoming: Vec<_> = self
            .dataflow
            .neighbors_directed(id, Direction::Incoming)
            .collect();
        for source in incoming {
            self.dataflow.remove_edge(source, id);
        }
        let outgoing: Vec<_> = self
            .dataflow
            .neighbors_directed(id, Direction::Outgoing)
            .collect();
        for sink in outgoing {
            self.dataflow.remove_edge(id, sink);
        }
    }

    // --- event ordering -------------------------------------------------

    pub fn add_ordering(&mut self, before: EventRef, after: EventRef) {
        self.ordering.insert(OrderingConstraint { before, after });
    }

    pub fn ordering(&self) -> impl Iterator<Item = &OrderingConstraint> {
        self.ordering.iter()
    }

    pub fn has_ordering(&self, before: EventRef, after: EventRef) -> bool {
        self.ordering.contains(&OrderingConstraint { before, after })
    }

    /// Drops every ordering constraint whose endpoints both belong to
    /// `ids`. Used when a staging plan re-states the constraints between
    /// tasks it wrapped.
    pub(crate) fn clear_ordering_between(&mut self, ids: &BTreeSet<TaskId>) {
        self.ordering
            .retain(|c| !(ids.contains(&c.before.0) && ids.contains(&c.after.0)));
    }

    /// Rewrites every ordering constraint endpoint from `from` to `to`.
    pub fn retarget_ordering(&mut self, from: TaskId, to: TaskId) {
        let affected: Vec<_> = self
            .ordering
            .iter()
            .filter(|c| c.before.0 == from || c.after.0 == from)
            .copied()
            .collect();
        for old in affected {
            self.ordering.remove(&old);
            let mut new = old;
            if new.before.0 == from {
                new.before.0 = to;
            }
            if new.after.0 == from {
                new.after.0 = to;
            }
            if new.before.0 != new.after.0 {
                self.ordering.insert(new);
            }
        }
    }

    // --- planning relation ----------------------------------------------

    pub fn set_planning(&mut self, requirement: TaskId, planned: TaskId) {
        self.planning.insert(requirement, planned);
    }

    pub fn planned_task(&self, requirement: TaskId) -> Option<TaskId> {
        self.planning.get(&requirement).copied()
    }

    pub fn planning(&self) -> impl Iterator<Item = (TaskId, TaskId)> + '_ {
        self.planning.iter().map(|(&r, &p)| (r, p))
    }

    // --- whole-plan rewrites --------------------------------------------

    /// Points every reference to `from` held by other tasks at `to`.
    pub fn retarget_references(&mut self, from: TaskId, to: TaskId) {
        let ids = self.task_ids();
        for id in ids {
            let task = self.tasks.get_mut(&id).expect("id from task_ids");
            if task.execution_agent == Some(from) {
                task.execution_agent = Some(to);
            }
            if task.attachments.remove(&from) {
                task.attachments.insert(to);
            }
        }
        self.retarget_ordering(from, to);
        let planned: Vec<_> = self
            .planning
            .iter()
            .filter(|&(_, &p)| p == from)
            .map(|(&r, _)| r)
            .collect();
        for req in planned {
            self.planning.insert(req, to);
        }
    }

    /// Moves every relation of `from` onto `to` and drops `from`.
    /// Connection sets are unioned with `to`'s entries winning on
    /// conflicts; use the merge solver when conflicts must be detected.
    pub fn replace(&mut self, from: TaskId, to: TaskId) {
        for (parent, child, info) in self.incident_dependencies(from) {
            self.dependency.remove_edge(parent, child);
            let (parent, child) = if parent == from {
                (to, child)
            } else {
                (parent, to)
            };
            if parent == child {
                continue;
            }
            for role in info.roles {
                self.add_dependency(parent, child, role);
            }
        }

        for (source, sp, dp, policy) in self.in_connections(from) {
            self.disconnect_pair(source, from, &sp, &dp);
            if source != to {
                let existing = self
                    .connections_between(source, to)
                    .and_then(|set| set.get(&(sp.clone(), dp.clone())))
                    .copied();
                if existing.is_none() {
                    self.connect(source, sp, to, dp, policy);
                }
            }
        }
        for (sink, sp, dp, policy) in self.out_connections(from) {
            self.disconnect_pair(from, sink, &sp, &dp);
            if sink != to {
                let existing = self
                    .connections_between(to, sink)
                    .and_then(|set| set.get(&(sp.clone(), dp.clone())))
                    .copied();
                if existing.is_none() {
                    self.connect(to, sp, sink, dp, policy);
                }
            }
        }

        self.retarget_references(from, to);
        if self.permanent.remove(&from) {
            self.permanent.insert(to);
        }
    }

    // --- discovery ------------------------------------------------------

    /// Tasks whose model fulfills `model`, in creation order.
    pub fn find_local_tasks(&self, model: &str) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|(_, t)| t.model.fulfills(model))
            .map(|(&id, _)| id)
            .collect()
    }

    /// Deployment-instance tasks, in creation order.
    pub fn deployments(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|(_, t)| t.is_deployment())
            .map(|(&id, _)| id)
            .collect()
    }

    // --- garbage collection ---------------------------------------------

    /// Removes every task unreachable from a permanent root, following
    /// dependency edges and execution-agent references. Returns the
    /// removed handles in creation order.
    pub fn static_garbage_collect(&mut self, mut on_remove: impl FnMut(TaskId, &Task)) -> Vec<TaskId> {
        let mut keep: BTreeSet<TaskId> = self.permanent.clone();
        loop {
            let mut added = Vec::new();
            for &id in &keep {
                for child in self.children(id) {
                    if !keep.contains(&child) {
                        added.push(child);
                    }
                }
                if let Some(task) = self.tasks.get(&id) {
                    if let Some(agent) = task.execution_agent {
                        if !keep.contains(&agent) {
                            added.push(agent);
                        }
                    }
                }
            }
            if added.is_empty() {
                break;
            }
            keep.extend(added);
        }

        let doomed: Vec<TaskId> = self
            .tasks
            .keys()
            .copied()
            .filter(|id| !keep.contains(id))
            .collect();
        for &id in &doomed {
            if let Some(task) = self.tasks.get(&id) {
                on_remove(id, task);
            }
            self.remove_task(id);
        }
        doomed
    }
}

impl Default for Plan {
    fn default() -> Self {
        Plan::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ComponentModel, ConnectionPolicy};

    fn model(name: &str) -> Arc<ComponentModel> {
        Arc::new(ComponentModel::task_context(name))
    }

    #[test]
    fn handles_are_assigned_in_creation_order() {
        let mut plan = Plan::new();
        let a = plan.add(Task::new(model("a")));
        let b = plan.add(Task::new(model("b")));
        assert!(a < b);
        assert_eq!(plan.task_ids(), vec![a, b]);
    }

    #[test]
    fn dependency_roles_accumulate() {
        let mut plan = Plan::new();
        let parent = plan.add(Task::new(model("parent")));
        let child = plan.add(Task::new(model("child")));
        plan.add_dependency(parent, child, "left");
        plan.add_dependency(parent, child, "right");
        let roles = plan.dependency_roles(parent, child).unwrap();
        assert_eq!(roles.len(), 2);
        assert_eq!(plan.children(parent), vec![child]);
    }

    #[test]
    fn narrowing_roles_to_nothing_drops_the_edge() {
        let mut plan = Plan::new();
        let parent = plan.add(Task::new(model("parent")));
        let child = plan.add(Task::new(model("child")));
        plan.add_dependency(parent, child, "only");
        plan.narrow_dependency_roles(parent, child, &BTreeSet::new());
        assert!(plan.dependency_roles(parent, child).is_none());
    }

    #[test]
    fn connections_are_labelled_per_port_pair() {
        let mut plan = Plan::new();
        let src = plan.add(Task::new(model("src")));
        let dst = plan.add(Task::new(model("dst")));
        plan.connect(src, "out", dst, "in", ConnectionPolicy::Data);
        plan.connect(src, "out2", dst, "in2", ConnectionPolicy::Buffer(4));

        let ins = plan.in_connections(dst);
        assert_eq!(ins.len(), 2);
        assert_eq!(ins[0], (src, "out".into(), "in".into(), ConnectionPolicy::Data));

        plan.disconnect_pair(src, dst, "out", "in");
        plan.disconnect_pair(src, dst, "out2", "in2");
        assert!(plan.connections_between(src, dst).is_none());
    }

    #[test]
    fn replace_moves_relations() {
        let mut plan = Plan::new();
        let parent = plan.add(Task::new(model("parent")));
        let old = plan.add(Task::new(model("x")));
        let new = plan.add(Task::new(model("x")));
        let sink = plan.add(Task::new(model("sink")));
        plan.add_dependency(parent, old, "role");
        plan.connect(old, "out", sink, "in", ConnectionPolicy::Data);
        plan.mark_permanent(old);
        plan.add_ordering((old, EventKind::Stop), (sink, EventKind::Configure));

        plan.replace(old, new);

        assert!(plan.dependency_roles(parent, new).is_some());
        assert!(plan.dependency_roles(parent, old).is_none());
        assert_eq!(plan.out_connections(new).len(), 1);
        assert!(plan.is_permanent(new));
        assert!(!plan.is_permanent(old));
        assert!(plan.has_ordering((new, EventKind::Stop), (sink, EventKind::Configure)));
    }

    #[test]
    fn garbage_collect_keeps_permanent_closure() {
        let mut plan = Plan::new();
        let root = plan.add_permanent_task(Task::new(model("root")));
        let child = plan.add(Task::new(model("child")));
        let orphan = plan.add(Task::new(model("orphan")));
        let agent = plan.add(Task::new(model("agent")));
        plan.add_dependency(root, child, "role");
        plan.task_mut(child).execution_agent = Some(agent);

        let removed = plan.static_garbage_collect(|_, _| {});
        assert_eq!(removed, vec![orphan]);
        assert!(plan.contains(root));
        assert!(plan.contains(child));
        assert!(plan.contains(agent));
    }

    #[test]
    fn dependency_path_queries() {
        let mut plan = Plan::new();
        let a = plan.add(Task::new(model("a")));
        let b = plan.add(Task::new(model("b")));
        let c = plan.add(Task::new(model("c")));
        plan.add_dependency(a, b, "x");
        plan.add_dependency(b, c, "y");
        assert!(plan.has_dependency_path(a, c));
        assert!(!plan.has_dependency_path(c, a));
    }

    #[test]
    fn hint_matching() {
        let slot = DeploymentSlot {
            host: "h1".into(),
            deployment: "D1".into(),
            task_name: "front_camera".into(),
        };
        assert!(DeploymentHint::Deployment("D1".into()).matches(&slot));
        assert!(!DeploymentHint::Deployment("D2".into()).matches(&slot));
        assert!(DeploymentHint::NameMatch(Regex::new("front_.*").unwrap()).matches(&slot));
        assert!(DeploymentHint::NameMatch(Regex::new("D1").unwrap()).matches(&slot));
        assert!(!DeploymentHint::NameMatch(Regex::new("rear_.*").unwrap()).matches(&slot));
    }
}
