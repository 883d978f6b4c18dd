//! Connection-policy computation over the deployed network.
//!
//! The actual dataflow-dynamics model lives outside the engine; it is a
//! pure function over the deployed plan. The engine only keeps the result
//! around and rewrites its keys when tasks merge.

use std::collections::BTreeMap;

use crate::merge::MergeSolver;
use crate::model::ConnectionPolicy;
use crate::plan::{Plan, TaskId};

/// Computed policies keyed by (source, source port, sink, sink port).
pub type PolicyMap = BTreeMap<(TaskId, String, TaskId, String), ConnectionPolicy>;

/// The seam to the dataflow-dynamics collaborator.
pub trait DataflowDynamics: Send + Sync {
    fn compute_connection_policies(&self, plan: &Plan) -> anyhow::Result<PolicyMap>;
}

/// Reads the policies straight off the plan's connection sets.
#[derive(Debug, Default)]
pub struct DeclaredPolicies;

impl DataflowDynamics for DeclaredPolicies {
    fn compute_connection_policies(&self, plan: &Plan) -> anyhow::Result<PolicyMap> {
        let mut out = PolicyMap::new();
        for (source, sink, set) in plan.dataflow_edge_sets() {
            for ((sp, dp), policy) in set {
                out.insert((source, sp, sink, dp), policy);
            }
        }
        Ok(out)
    }
}

/// Rewrites every task handle in the map through the replacement graph.
pub fn apply_merges(policies: &mut PolicyMap, solver: &MergeSolver) {
    let rewritten: PolicyMap = std::mem::take(policies)
        .into_iter()
        .map(|((source, sp, sink, dp), policy)| {
            (
                (
                    solver.replacement_for(source),
                    sp,
                    solver.replacement_for(sink),
                    dp,
                ),
                policy,
            )
        })
        .collect();
    *policies = rewritten;
}
