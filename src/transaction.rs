//! The staging transaction a resolution pass works in.
//!
//! The transaction owns a working plan whose handle sequence continues
//! the real plan's, so handles stay unique across both. Real tasks enter
//! the working plan as *proxies*; edges between wrapped tasks are
//! mirrored on entry. Nothing touches the real plan until [`commit`]
//! applies the staged state back: proxies write their mutated attributes
//! through, new tasks are inserted, and proxies that were merged away
//! replace their real task.
//!
//! [`commit`]: Transaction::commit

use std::collections::{BTreeMap, BTreeSet};

use crate::merge::MergeSolver;
use crate::plan::{Plan, TaskId};

pub struct Transaction {
    work: Plan,
    proxy_to_real: BTreeMap<TaskId, TaskId>,
    real_to_proxy: BTreeMap<TaskId, TaskId>,
    finalized: bool,
}

/// What a commit did to the real plan.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    /// Working-plan handle to the real handle created for it.
    pub created: BTreeMap<TaskId, TaskId>,
    /// Real tasks replaced by another task, as (old, new).
    pub replaced: BTreeMap<TaskId, TaskId>,
    /// Real tasks removed outright.
    pub removed: Vec<TaskId>,
}

impl CommitOutcome {
    /// Maps a working-plan handle to its committed real handle.
    pub fn resolve(&self, id: TaskId) -> TaskId {
        self.created.get(&id).copied().unwrap_or(id)
    }

    /// Whether the commit changed anything observable in the real plan.
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.replaced.is_empty() && self.removed.is_empty()
    }
}

impl Transaction {
    pub fn new(real: &Plan) -> Self {
        Transaction {
            work: Plan::starting_at(real.next_task_id()),
            proxy_to_real: BTreeMap::new(),
            real_to_proxy: BTreeMap::new(),
            finalized: false,
        }
    }

    pub fn work(&self) -> &Plan {
        &self.work
    }

    pub fn work_mut(&mut self) -> &mut Plan {
        &mut self.work
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn proxy_for(&self, real_id: TaskId) -> Option<TaskId> {
        self.real_to_proxy.get(&real_id).copied()
    }

    pub fn real_for(&self, proxy_id: TaskId) -> Option<TaskId> {
        self.proxy_to_real.get(&proxy_id).copied()
    }

    /// Imports a real task into the working plan as a proxy, mirroring its
    /// relations to every task already wrapped. The execution agent is
    /// wrapped along with it. Wrapping the same task twice returns the
    /// existing proxy.
    pub fn wrap_task(&mut self, real: &Plan, real_id: TaskId) -> TaskId {
        if let Some(&proxy) = self.real_to_proxy.get(&real_id) {
            return proxy;
        }

        let mut task = real.task(real_id).clone();
        task.proxy_of = Some(real_id);
        if let Some(agent) = task.execution_agent {
            task.execution_agent = Some(self.wrap_task(real, agent));
        }
        // Attachment sets reference peers that may not be wrapped; keep
        // only the wrapped ones, mapped to their proxies.
        task.attachments = task
            .attachments
            .iter()
            .filter_map(|peer| self.real_to_proxy.get(peer).copied())
            .collect();

        let proxy = self.work.add(task);
        if real.is_permanent(real_id) {
            self.work.mark_permanent(proxy);
        }
        self.proxy_to_real.insert(proxy, real_id);
        self.real_to_proxy.insert(real_id, proxy);

        self.mirror_relations(real, real_id, proxy);
        proxy
    }

    fn mirror_relations(&mut self, real: &Plan, real_id: TaskId, proxy: TaskId) {
        for parent in real.parents(real_id) {
            if let Some(&parent_proxy) = self.real_to_proxy.get(&parent) {
                if let Some(roles) = real.dependency_roles(parent, real_id) {
                    for role in roles.clone() {
                        self.work.add_dependency(parent_proxy, proxy, role);
                    }
                }
            }
        }
        for child in real.children(real_id) {
            if let Some(&child_proxy) = self.real_to_proxy.get(&child) {
                if let Some(roles) = real.dependency_roles(real_id, child) {
                    for role in roles.clone() {
                        self.work.add_dependency(proxy, child_proxy, role);
                    }
                }
            }
        }

        for (source, sp, dp, policy) in real.in_connections(real_id) {
            if let Some(&source_proxy) = self.real_to_proxy.get(&source) {
                self.work.connect(source_proxy, sp, proxy, dp, policy);
            }
        }
        for (sink, sp, dp, policy) in real.out_connections(real_id) {
            if let Some(&sink_proxy) = self.real_to_proxy.get(&sink) {
                self.work.connect(proxy, sp, sink_proxy, dp, policy);
            }
        }

        let mut mirrored = Vec::new();
        for constraint in real.ordering() {
            let (bt, be) = constraint.before;
            let (at, ae) = constraint.after;
            if bt != real_id && at != real_id {
                continue;
            }
            let map = |t: TaskId| -> Option<TaskId> {
                if t == real_id {
                    Some(proxy)
                } else {
                    self.real_to_proxy.get(&t).copied()
                }
            };
            if let (Some(b), Some(a)) = (map(bt), map(at)) {
                mirrored.push(((b, be), (a, ae)));
            }
        }
        for (before, after) in mirrored {
            self.work.add_ordering(before, after);
        }
    }

    /// Forgets a proxy without scheduling any change to its real task.
    /// Used when a wrapped task turns out to be irrelevant to the pass.
    pub fn release_task(&mut self, proxy_id: TaskId) {
        if let Some(real_id) = self.proxy_to_real.remove(&proxy_id) {
            self.real_to_proxy.remove(&real_id);
        }
        self.work.remove_task(proxy_id);
    }

    /// Discards the staged state. The real plan is untouched.
    pub fn discard(mut self) {
        self.finalized = true;
    }

    /// Applies the staged state to the real plan.
    ///
    /// The merge solver resolves proxies that were merged away during the
    /// pass: their real task is replaced by the merge target's committed
    /// task. For pairs of wrapped tasks the staged relations win; edges
    /// to tasks the transaction never saw are left alone.
    pub fn commit(mut self, real: &mut Plan, solver: &MergeSolver) -> CommitOutcome {
        self.finalized = true;
        let mut outcome = CommitOutcome::default();

        // New real tasks come after every staged handle, keeping handles
        // unique across the transaction boundary.
        real.bump_next_task_id(self.work.next_task_id());

        for id in self.work.task_ids() {
            let task = self.work.task(id);
            if task.proxy_of.is_none() {
                let real_id = real.add(task.clone());
                outcome.created.insert(id, real_id);
            }
        }

        // Any staged handle to its committed real handle.
        let resolve = |id: TaskId, outcome: &CommitOutcome| -> TaskId {
            if let Some(&created) = outcome.created.get(&id) {
                created
            } else if let Some(&real_id) = self.proxy_to_real.get(&id) {
                real_id
            } else {
                id
            }
        };

        // Proxies merged away during the pass: replace their real task
        // with the merge target. Proxies removed without a replacement
        // take their real task down with them.
        for (&proxy, &real_id) in &self.proxy_to_real {
            if self.work.contains(proxy) {
                continue;
            }
            let target = solver.replacement_for(proxy);
            if target != proxy {
                let committed = resolve(target, &outcome);
                if real.contains(committed) {
                    real.replace(real_id, committed);
                    real.remove_task(real_id);
                    outcome.replaced.insert(real_id, committed);
                    continue;
                }
            }
            real.remove_task(real_id);
            outcome.removed.push(real_id);
        }

        // Write mutated proxy state through.
        for (&proxy, &real_id) in &self.proxy_to_real {
            if !self.work.contains(proxy) || !real.contains(real_id) {
                continue;
            }
            let staged = self.work.task(proxy);
            let arguments = staged.arguments.clone();
            let selections = staged.selections.clone();
            let is_abstract = staged.is_abstract;
            let orocos_name = staged.orocos_name.clone();
            let hints = staged.deployment_hints.clone();
            let agent = staged.execution_agent.map(|a| resolve(a, &outcome));
            let attachments: BTreeSet<TaskId> = staged
                .attachments
                .iter()
                .map(|&a| resolve(a, &outcome))
                .collect();
            let permanent = self.work.is_permanent(proxy);

            let target = real.task_mut(real_id);
            target.arguments = arguments;
            target.selections = selections;
            target.is_abstract = is_abstract;
            target.orocos_name = orocos_name;
            target.deployment_hints = hints;
            target.execution_agent = agent;
            target.attachments = attachments;
            if permanent {
                real.mark_permanent(real_id);
            } else {
                real.unmark_permanent_task(real_id);
            }
        }

        // Fix references held by created tasks.
        for &real_id in outcome.created.values() {
            let task = real.task(real_id);
            let agent = task.execution_agent.map(|a| resolve(a, &outcome));
            let attachments: BTreeSet<TaskId> = task
                .attachments
                .iter()
                .map(|&a| resolve(a, &outcome))
                .collect();
            let task = real.task_mut(real_id);
            task.execution_agent = agent;
            task.attachments = attachments;
        }

        // Relations between wrapped tasks: the staged edges win.
        let wrapped: BTreeSet<TaskId> = self
            .proxy_to_real
            .iter()
            .filter(|(proxy, real_id)| self.work.contains(**proxy) && real.contains(**real_id))
            .map(|(_, &real_id)| real_id)
            .collect();
        let wrapped_list: Vec<TaskId> = wrapped.iter().copied().collect();
        for (i, &a) in wrapped_list.iter().enumerate() {
            for &b in &wrapped_list[i + 1..] {
                real.remove_dependency(a, b);
                real.remove_dependency(b, a);
                real.remove_dataflow_edge(a, b);
                real.remove_dataflow_edge(b, a);
            }
        }
        real.clear_ordering_between(&wrapped);

        for (parent, child, info) in self.work.dependency_edges() {
            let (parent, child) = (resolve(parent, &outcome), resolve(child, &outcome));
            if real.contains(parent) && real.contains(child) {
                for role in info.roles {
                    real.add_dependency(parent, child, role);
                }
            }
        }
        for (source, sink, set) in self.work.dataflow_edge_sets() {
            let (source, sink) = (resolve(source, &outcome), resolve(sink, &outcome));
            if real.contains(source) && real.contains(sink) {
                for ((sp, dp), policy) in set {
                    real.connect(source, sp, sink, dp, policy);
                }
            }
        }
        let constraints: Vec<_> = self.work.ordering().copied().collect();
        for c in constraints {
            let before = (resolve(c.before.0, &outcome), c.before.1);
            let after = (resolve(c.after.0, &outcome), c.after.1);
            if real.contains(before.0) && real.contains(after.0) {
                real.add_ordering(before, after);
            }
        }

        // Permanence and planning of created tasks.
        for id in self.work.permanent_tasks() {
            let committed = resolve(id, &outcome);
            if real.contains(committed) {
                real.mark_permanent(committed);
            }
        }
        let planning: Vec<_> = self.work.planning().collect();
        for (req, planned) in planning {
            let (req, planned) = (resolve(req, &outcome), resolve(planned, &outcome));
            if real.contains(req) && real.contains(planned) {
                real.set_planning(req, planned);
            }
        }

        real.bump_next_task_id(self.work.next_task_id());
        outcome
    }
}
