//! The merge solver: finds equivalence classes of tasks that can be
//! unified and rewrites the plan accordingly.
//!
//! Every merge records `from -> into` in a replacement graph that stays
//! valid for the whole pass; [`MergeSolver::replacement_for`] follows the
//! transitive closure so stored handles can always be mapped to the
//! current representative.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::MergeConflict;
use crate::model::ConnectionPolicy;
use crate::plan::{Plan, TaskId};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    /// Fixed-point iterations that performed at least one merge.
    pub cycles: usize,
    /// Tasks merged away.
    pub merged: usize,
}

impl std::ops::AddAssign for MergeStats {
    fn add_assign(&mut self, rhs: MergeStats) {
        self.cycles += rhs.cycles;
        self.merged += rhs.merged;
    }
}

#[derive(Debug, Default)]
pub struct MergeSolver {
    replacements: BTreeMap<TaskId, TaskId>,
}

impl MergeSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current representative of `id`, following every recorded
    /// replacement.
    pub fn replacement_for(&self, mut id: TaskId) -> TaskId {
        while let Some(&next) = self.replacements.get(&id) {
            id = next;
        }
        id
    }

    /// Records that `from` is replaced by `to` without touching any plan.
    /// Used when committing the staging transaction maps proxies to their
    /// real tasks.
    pub fn register_replacement(&mut self, from: TaskId, to: TaskId) {
        if from != to {
            self.replacements.insert(from, to);
        }
    }

    /// Applies a group of merges: for every `from -> into` pair, all
    /// relations incident on `from` are redirected onto `into`, edge
    /// labels are unioned, and `from` is removed from the plan.
    ///
    /// Conflicting policies for the same (source port, sink port) pair on
    /// a unioned connection set fail the whole group.
    pub fn apply_merge_group(
        &mut self,
        plan: &mut Plan,
        group: &BTreeMap<TaskId, TaskId>,
    ) -> Result<(), MergeConflict> {
        for (&from, &into) in group {
            let from = self.replacement_for(from);
            let into = self.replacement_for(into);
            if from == into {
                continue;
            }
            tracing::debug!(%from, %into, "merging task");
            merge_into(plan, from, into)?;
            self.replacements.insert(from, into);
        }
        Ok(())
    }

    /// Iterates to a fixed point, merging every pair of structurally
    /// identical tasks. Terminates because each cycle strictly reduces
    /// the task count or leaves the plan unchanged.
    pub fn merge_identical_tasks(&mut self, plan: &mut Plan) -> Result<MergeStats, MergeConflict> {
        let mut stats = MergeStats::default();
        loop {
            let group = find_merge_group(plan);
            if group.is_empty() {
                break;
            }
            stats.cycles += 1;
            stats.merged += group.len();
            self.apply_merge_group(plan, &group)?;
        }
        tracing::debug!(cycles = stats.cycles, merged = stats.merged, "merge fixed point");
        Ok(stats)
    }
}

/// One round of candidate search. Each task is paired with its best merge
/// candidate; the surviving side of each pair is chosen by [`rank`].
fn find_merge_group(plan: &Plan) -> BTreeMap<TaskId, TaskId> {
    let ids = plan.task_ids();
    let mut taken: BTreeSet<TaskId> = BTreeSet::new();
    let mut group = BTreeMap::new();

    for &a in &ids {
        if taken.contains(&a) {
            continue;
        }
        let mut bucket: Vec<TaskId> = ids
            .iter()
            .copied()
            .filter(|&b| b != a && !taken.contains(&b) && mergeable(plan, a, b))
            .collect();
        if bucket.is_empty() {
            continue;
        }
        bucket.push(a);
        bucket.sort_by(|&x, &y| rank(plan, x, y));
        let winner = bucket[0];
        let loser = if winner == a { bucket[1] } else { a };
        group.insert(loser, winner);
        taken.insert(winner);
        taken.insert(loser);
    }
    group
}

/// Orders merge candidates: more assigned arguments first, then tasks
/// already anchored in the running network (deployed, or standing for a
/// real task), then creation order.
fn rank(plan: &Plan, x: TaskId, y: TaskId) -> std::cmp::Ordering {
    let tx = plan.task(x);
    let ty = plan.task(y);
    let anchored = |t: &crate::plan::Task| t.execution_agent.is_some() || t.is_proxy();
    ty.arguments
        .len()
        .cmp(&tx.arguments.len())
        .then_with(|| anchored(ty).cmp(&anchored(tx)))
        .then(x.cmp(&y))
}

fn mergeable(plan: &Plan, a: TaskId, b: TaskId) -> bool {
    let ta = plan.task(a);
    let tb = plan.task(b);

    if ta.model.name != tb.model.name {
        return false;
    }
    // Two tasks standing for distinct real tasks stay distinct; collapsing
    // them would discard one side of the running network.
    if ta.is_proxy() && tb.is_proxy() {
        return false;
    }
    if ta.finished() || ta.finishing() || tb.finished() || tb.finishing() {
        return false;
    }
    match (&ta.deployment, &tb.deployment) {
        (Some(da), Some(db)) => {
            if da.process_name != db.process_name || da.host != db.host {
                return false;
            }
        }
        (None, None) => {}
        _ => return false,
    }

    // Arguments must agree on every key set in both, and the union must
    // still be admissible for the model.
    for (key, value) in &ta.arguments {
        if let Some(other) = tb.arguments.get(key) {
            if value != other {
                return false;
            }
        }
    }
    let union: Vec<&String> = ta.arguments.keys().chain(tb.arguments.keys()).collect();
    if !ta.model.admits_arguments(union) {
        return false;
    }

    if ta.execution_agent != tb.execution_agent {
        return false;
    }

    // Input connection sets must be structurally compatible: identical
    // (source, source port, policy) sets on every shared sink port.
    let ins_a = in_connection_map(plan, a, b);
    let ins_b = in_connection_map(plan, b, a);
    for (port, set_a) in &ins_a {
        if let Some(set_b) = ins_b.get(port) {
            if set_a != set_b {
                return false;
            }
        }
    }

    // Every role bound by both tasks must resolve to the same children;
    // unioning observably different role bindings is not a unification.
    let kids_a = children_by_role(plan, a);
    let kids_b = children_by_role(plan, b);
    for (role, set_a) in &kids_a {
        if let Some(set_b) = kids_b.get(role) {
            if set_a != set_b {
                return false;
            }
        }
    }

    // A connection between the two would become a self-loop.
    if plan.connections_between(a, b).is_some() || plan.connections_between(b, a).is_some() {
        return false;
    }
    // A dependency path between the two would become a cycle.
    if plan.has_dependency_path(a, b) || plan.has_dependency_path(b, a) {
        return false;
    }
    // An event ordering between the two means they are deliberately
    // sequenced, such as a replacement configuring after its predecessor
    // stops. Unifying them would collapse the sequence.
    if plan
        .ordering()
        .any(|c| {
            (c.before.0 == a && c.after.0 == b) || (c.before.0 == b && c.after.0 == a)
        })
    {
        return false;
    }

    true
}

fn children_by_role(plan: &Plan, id: TaskId) -> BTreeMap<String, BTreeSet<TaskId>> {
    let mut out: BTreeMap<String, BTreeSet<TaskId>> = BTreeMap::new();
    for child in plan.children(id) {
        if let Some(roles) = plan.dependency_roles(id, child) {
            for role in roles {
                out.entry(role.clone()).or_default().insert(child);
            }
        }
    }
    out
}

/// Incoming connections of `id` grouped by sink port, with sources
/// normalized so that `other` counts as `id`'s own peer.
fn in_connection_map(
    plan: &Plan,
    id: TaskId,
    other: TaskId,
) -> BTreeMap<String, BTreeSet<(TaskId, String, ConnectionPolicy)>> {
    let mut out: BTreeMap<String, BTreeSet<(TaskId, String, ConnectionPolicy)>> = BTreeMap::new();
    for (source, sp, dp, policy) in plan.in_connections(id) {
        let source = if source == other { id } else { source };
        out.entry(dp).or_default().insert((source, sp, policy));
    }
    out
}

fn merge_into(plan: &mut Plan, from: TaskId, into: TaskId) -> Result<(), MergeConflict> {
    // Check dataflow unions for policy conflicts before mutating anything.
    for (source, sp, dp, policy) in plan.in_connections(from) {
        let source = if source == from { into } else { source };
        if source == into {
            continue;
        }
        if let Some(existing) = plan
            .connections_between(source, into)
            .and_then(|set| set.get(&(sp.clone(), dp.clone())))
        {
            if *existing != policy {
                return Err(MergeConflict {
                    from,
                    into,
                    source_port: sp,
                    sink_port: dp,
                });
            }
        }
    }
    for (sink, sp, dp, policy) in plan.out_connections(from) {
        let sink = if sink == from { into } else { sink };
        if sink == into {
            continue;
        }
        if let Some(existing) = plan
            .connections_between(into, sink)
            .and_then(|set| set.get(&(sp.clone(), dp.clone())))
        {
            if *existing != policy {
                return Err(MergeConflict {
                    from,
                    into,
                    source_port: sp,
                    sink_port: dp,
                });
            }
        }
    }

    // Union scalar state. The surviving task keeps its own values where
    // both sides set one.
    let absorbed = plan.task(from).clone();
    {
        let target = plan.task_mut(into);
        for (key, value) in absorbed.arguments {
            target.arguments.entry(key).or_insert(value);
        }
        for (key, value) in absorbed.selections {
            target.selections.entry(key).or_insert(value);
        }
        if target.orocos_name.is_none() {
            target.orocos_name = absorbed.orocos_name;
        }
        target.deployment_hints.extend(absorbed.deployment_hints);
        if target.execution_agent.is_none() {
            target.execution_agent = absorbed.execution_agent;
        }
        target.is_abstract = target.is_abstract && absorbed.is_abstract;
        target
            .attachments
            .extend(absorbed.attachments.iter().copied());
        if target.requirements.is_none() {
            target.requirements = absorbed.requirements;
        }
    }

    // Redirect dependency edges, unioning roles.
    for (parent, child, info) in plan.incident_dependencies(from) {
        plan.remove_dependency(parent, child);
        let (parent, child) = if parent == from {
            (into, child)
        } else {
            (parent, into)
        };
        if parent == child {
            continue;
        }
        for role in info.roles {
            plan.add_dependency(parent, child, role);
        }
    }

    // Redirect dataflow edges; conflicts were ruled out above.
    for (source, sp, dp, policy) in plan.in_connections(from) {
        plan.disconnect_pair(source, from, &sp, &dp);
        let source = if source == from { into } else { source };
        if source != into {
            plan.connect(source, sp, into, dp, policy);
        }
    }
    for (sink, sp, dp, policy) in plan.out_connections(from) {
        plan.disconnect_pair(from, sink, &sp, &dp);
        let sink = if sink == from { into } else { sink };
        if sink != into {
            plan.connect(into, sp, sink, dp, policy);
        }
    }

    plan.retarget_references(from, into);
    if plan.is_permanent(from) {
        plan.mark_permanent(into);
    }
    plan.remove_task(from);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::model::{ComponentModel, ConnectionPolicy};
    use crate::plan::Task;

    fn model(name: &str) -> Arc<ComponentModel> {
        Arc::new(ComponentModel::task_context(name))
    }

    #[test]
    fn identical_tasks_merge_into_the_earlier_one() {
        let mut plan = Plan::new();
        let a = plan.add(Task::new(model("m")));
        let b = plan.add(Task::new(model("m")));

        let mut solver = MergeSolver::new();
        let stats = solver.merge_identical_tasks(&mut plan).unwrap();

        assert_eq!(stats.merged, 1);
        assert!(plan.contains(a));
        assert!(!plan.contains(b));
        assert_eq!(solver.replacement_for(b), a);
    }

    #[test]
    fn more_arguments_win_the_tie_break() {
        let mut plan = Plan::new();
        let bare = plan.add(Task::new(model("m")));
        let richer = plan.add(Task::new(model("m")).with_argument("rate", json!(10)));

        let mut solver = MergeSolver::new();
        solver.merge_identical_tasks(&mut plan).unwrap();

        assert!(!plan.contains(bare));
        assert!(plan.contains(richer));
        assert_eq!(solver.replacement_for(bare), richer);
    }

    #[test]
    fn anchored_task_wins_the_tie_break_over_creation_order() {
        let mut plan = Plan::new();
        let fresh = plan.add(Task::new(model("m")));
        // Created later, but stands for a task of the running plan.
        let anchored = plan.add(Task::new(model("m")));
        plan.task_mut(anchored).proxy_of = Some(TaskId(999));

        let mut solver = MergeSolver::new();
        solver.merge_identical_tasks(&mut plan).unwrap();

        assert!(plan.contains(anchored));
        assert!(!plan.contains(fresh));
        assert_eq!(solver.replacement_for(fresh), anchored);
    }

    #[test]
    fn conflicting_arguments_do_not_merge() {
        let mut plan = Plan::new();
        let a = plan.add(Task::new(model("m")).with_argument("rate", json!(10)));
        let b = plan.add(Task::new(model("m")).with_argument("rate", json!(20)));

        let mut solver = MergeSolver::new();
        let stats = solver.merge_identical_tasks(&mut plan).unwrap();
        assert_eq!(stats.merged, 0);
        assert!(plan.contains(a) && plan.contains(b));
    }

    #[test]
    fn differing_agents_do_not_merge() {
        let mut plan = Plan::new();
        let agent1 = plan.add(Task::new(model("agent1")));
        let agent2 = plan.add(Task::new(model("agent2")));
        let a = plan.add(Task::new(model("m")));
        let b = plan.add(Task::new(model("m")));
        plan.task_mut(a).execution_agent = Some(agent1);
        plan.task_mut(b).execution_agent = Some(agent2);

        let mut solver = MergeSolver::new();
        let stats = solver.merge_identical_tasks(&mut plan).unwrap();
        assert_eq!(stats.merged, 0);
    }

    #[test]
    fn incompatible_input_connections_do_not_merge() {
        let mut plan = Plan::new();
        let src1 = plan.add(Task::new(model("src1")));
        let src2 = plan.add(Task::new(model("src2")));
        let a = plan.add(Task::new(model("m")));
        let b = plan.add(Task::new(model("m")));
        plan.connect(src1, "out", a, "in", ConnectionPolicy::Data);
        plan.connect(src2, "out", b, "in", ConnectionPolicy::Data);

        let mut solver = MergeSolver::new();
        let stats = solver.merge_identical_tasks(&mut plan).unwrap();
        assert_eq!(stats.merged, 0);
    }

    #[test]
    fn parent_and_child_never_merge() {
        let mut plan = Plan::new();
        let parent = plan.add(Task::new(model("m")));
        let child = plan.add(Task::new(model("m")));
        plan.add_dependency(parent, child, "part");

        let mut solver = MergeSolver::new();
        let stats = solver.merge_identical_tasks(&mut plan).unwrap();
        assert_eq!(stats.merged, 0);
    }

    #[test]
    fn merging_cascades_to_parents() {
        // Two compositions each with their own copy of the same producer;
        // once the producers merge, the compositions become identical and
        // merge too.
        let mut plan = Plan::new();
        let comp_model = Arc::new(ComponentModel::composition("comp"));
        let p1 = plan.add(Task::new(model("producer")));
        let p2 = plan.add(Task::new(model("producer")));
        let c1 = plan.add(Task::new(comp_model.clone()));
        let c2 = plan.add(Task::new(comp_model));
        plan.add_dependency(c1, p1, "source");
        plan.add_dependency(c2, p2, "source");

        let mut solver = MergeSolver::new();
        let stats = solver.merge_identical_tasks(&mut plan).unwrap();

        // Producers merge first; only then do the compositions become
        // identical and collapse in a later cycle.
        assert_eq!(stats.merged, 2);
        assert!(stats.cycles >= 2);
        assert_eq!(plan.len(), 2);
        assert_eq!(solver.replacement_for(p2), p1);
        assert_eq!(solver.replacement_for(c2), c1);
    }

    #[test]
    fn explicit_merge_with_conflicting_policies_fails() {
        let mut plan = Plan::new();
        let src = plan.add(Task::new(model("src")));
        let a = plan.add(Task::new(model("m")));
        let b = plan.add(Task::new(model("m")));
        plan.connect(src, "out", a, "in", ConnectionPolicy::Data);
        plan.connect(src, "out", b, "in", ConnectionPolicy::Buffer(8));

        let mut solver = MergeSolver::new();
        let group = BTreeMap::from([(a, b)]);
        let err = solver.apply_merge_group(&mut plan, &group).unwrap_err();
        assert_eq!(err.source_port, "out");
        assert_eq!(err.sink_port, "in");
    }

    #[test]
    fn ordered_tasks_never_merge() {
        use crate::plan::EventKind;

        let mut plan = Plan::new();
        let old = plan.add(Task::new(model("m")));
        let new = plan.add(Task::new(model("m")));
        plan.add_ordering((old, EventKind::Stop), (new, EventKind::Configure));

        let mut solver = MergeSolver::new();
        let stats = solver.merge_identical_tasks(&mut plan).unwrap();
        assert_eq!(stats.merged, 0);
        assert!(plan.contains(old) && plan.contains(new));
    }

    #[test]
    fn replacement_chains_are_followed() {
        let mut solver = MergeSolver::new();
        solver.register_replacement(TaskId(1), TaskId(2));
        solver.register_replacement(TaskId(2), TaskId(5));
        assert_eq!(solver.replacement_for(TaskId(1)), TaskId(5));
        assert_eq!(solver.replacement_for(TaskId(3)), TaskId(3));
    }

    #[test]
    fn merge_unions_connection_sets() {
        let mut plan = Plan::new();
        let src = plan.add(Task::new(model("src")));
        let sink = plan.add(Task::new(model("sink")));
        let a = plan.add(Task::new(model("m")));
        let b = plan.add(Task::new(model("m")));
        plan.connect(src, "out", a, "in", ConnectionPolicy::Data);
        plan.connect(b, "res", sink, "acc", ConnectionPolicy::Buffer(2));

        let mut solver = MergeSolver::new();
        let group = BTreeMap::from([(b, a)]);
        solver.apply_merge_group(&mut plan, &group).unwrap();

        assert_eq!(plan.in_connections(a).len(), 1);
        let outs = plan.out_connections(a);
        assert_eq!(outs, vec![(sink, "res".into(), "acc".into(), ConnectionPolicy::Buffer(2))]);
    }

    #[test]
    fn fixed_point_is_order_insensitive() {
        // The same structure built in two different creation orders must
        // collapse to the same shape.
        let build = |interleaved: bool| {
            let mut plan = Plan::new();
            let (p1, f1, p2, f2);
            if interleaved {
                p1 = plan.add(Task::new(model("producer")));
                f1 = plan.add(Task::new(model("filter")));
                p2 = plan.add(Task::new(model("producer")));
                f2 = plan.add(Task::new(model("filter")));
            } else {
                p1 = plan.add(Task::new(model("producer")));
                p2 = plan.add(Task::new(model("producer")));
                f1 = plan.add(Task::new(model("filter")));
                f2 = plan.add(Task::new(model("filter")));
            }
            plan.connect(p1, "out", f1, "in", ConnectionPolicy::Data);
            plan.connect(p2, "out", f2, "in", ConnectionPolicy::Data);

            let mut solver = MergeSolver::new();
            solver.merge_identical_tasks(&mut plan).unwrap();

            let mut models: Vec<String> =
                plan.tasks().map(|(_, t)| t.model.name.clone()).collect();
            models.sort();
            let edges = plan.dataflow_edges().len();
            (models, edges)
        };
        assert_eq!(build(false), build(true));
        assert_eq!(build(false).0, vec!["filter".to_string(), "producer".to_string()]);
    }
}
