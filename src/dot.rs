//! Graphviz dumps of a plan's dataflow and hierarchy, for debugging
//! failed or suspicious resolutions.

use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};

use crate::plan::Plan;

fn node_label(plan: &Plan, id: crate::plan::TaskId) -> String {
    let task = plan.task(id);
    let mut label = format!("{}\\n{}", id, task.model.name);
    if let Some(name) = &task.orocos_name {
        label.push_str("\\n");
        label.push_str(name);
    }
    label
}

fn escape(text: &str) -> String {
    text.replace('"', "\\\"")
}

/// The dataflow graph in dot format, nodes in creation order.
pub fn dataflow(plan: &Plan) -> String {
    let mut out = String::from("digraph dataflow {\n  rankdir=LR;\n  node [shape=box];\n");
    for id in plan.task_ids() {
        out.push_str(&format!(
            "  t{} [label=\"{}\"];\n",
            id.index(),
            escape(&node_label(plan, id))
        ));
    }
    for (source, sink) in plan.dataflow_edges() {
        if let Some(set) = plan.connections_between(source, sink) {
            for ((sp, dp), policy) in set {
                out.push_str(&format!(
                    "  t{} -> t{} [label=\"{}:{} ({:?})\"];\n",
                    source.index(),
                    sink.index(),
                    escape(sp),
                    escape(dp),
                    policy
                ));
            }
        }
    }
    out.push_str("}\n");
    out
}

/// The dependency hierarchy in dot format, nodes in creation order.
pub fn hierarchy(plan: &Plan) -> String {
    let mut out = String::from("digraph hierarchy {\n  node [shape=box];\n");
    for id in plan.task_ids() {
        out.push_str(&format!(
            "  t{} [label=\"{}\"];\n",
            id.index(),
            escape(&node_label(plan, id))
        ));
    }
    for (parent, child, info) in plan.dependency_edges() {
        let roles: Vec<&str> = info.roles.iter().map(String::as_str).collect();
        out.push_str(&format!(
            "  t{} -> t{} [label=\"{}\"];\n",
            parent.index(),
            child.index(),
            escape(&roles.join(","))
        ));
    }
    out.push_str("}\n");
    out
}

/// Writes indexed dump pairs into a log directory.
#[derive(Debug)]
pub struct PlanDumper {
    directory: Utf8PathBuf,
    index: u64,
}

impl PlanDumper {
    pub fn new(directory: impl AsRef<Utf8Path>) -> Self {
        PlanDumper {
            directory: directory.as_ref().to_path_buf(),
            index: 0,
        }
    }

    /// Dumps the plan as `rigging-plan-<index>.dataflow.dot` and
    /// `rigging-plan-<index>.hierarchy.dot`, returning both paths.
    pub fn save(&mut self, plan: &Plan) -> io::Result<(Utf8PathBuf, Utf8PathBuf)> {
        self.index += 1;
        fs::create_dir_all(&self.directory)?;
        let dataflow_path = self
            .directory
            .join(format!("rigging-plan-{}.dataflow.dot", self.index));
        let hierarchy_path = self
            .directory
            .join(format!("rigging-plan-{}.hierarchy.dot", self.index));
        fs::write(&dataflow_path, dataflow(plan))?;
        fs::write(&hierarchy_path, hierarchy(plan))?;
        tracing::info!(%dataflow_path, %hierarchy_path, "plan dumped");
        Ok((dataflow_path, hierarchy_path))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::{ComponentModel, ConnectionPolicy};
    use crate::plan::Task;

    fn sample_plan() -> Plan {
        let mut plan = Plan::new();
        let a = plan.add(Task::new(Arc::new(ComponentModel::task_context("cam"))));
        let b = plan.add(Task::new(Arc::new(ComponentModel::task_context("det"))));
        plan.add_dependency(a, b, "detector");
        plan.connect(a, "frame", b, "frame", ConnectionPolicy::Data);
        plan
    }

    #[test]
    fn dot_output_contains_nodes_and_edges() {
        let plan = sample_plan();
        let flow = dataflow(&plan);
        assert!(flow.contains("digraph dataflow"));
        assert!(flow.contains("cam"));
        assert!(flow.contains("frame:frame"));

        let tree = hierarchy(&plan);
        assert!(tree.contains("digraph hierarchy"));
        assert!(tree.contains("detector"));
    }

    #[test]
    fn dumper_writes_indexed_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let mut dumper = PlanDumper::new(base);
        let plan = sample_plan();

        let (flow1, tree1) = dumper.save(&plan).unwrap();
        let (flow2, _) = dumper.save(&plan).unwrap();

        assert!(flow1.as_str().ends_with("rigging-plan-1.dataflow.dot"));
        assert!(tree1.as_str().ends_with("rigging-plan-1.hierarchy.dot"));
        assert!(flow2.as_str().ends_with("rigging-plan-2.dataflow.dot"));
        assert!(flow1.as_std_path().exists());
        assert!(tree1.as_std_path().exists());
    }
}
