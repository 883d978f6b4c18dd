//! Staged network validators. Each check runs independently and raises a
//! typed error; nothing recovers internally.

use std::collections::BTreeMap;

use crate::deploy::DeploymentCandidateIndex;
use crate::error::{
    ConflictingDeviceAllocation, DeviceAllocationFailed, MissingDeployment, MissingDeployments,
    MissingReason, MultiplexingError, ResolutionError, TaskAllocationFailed,
};
use crate::plan::{Plan, TaskId};

/// The four validation stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationStage {
    Abstract,
    Generated,
    Deployed,
    Final,
}

/// A validator chained after the built-in checks of one stage.
pub struct ChainedValidator {
    pub name: String,
    pub callback: Box<dyn Fn(&Plan) -> Result<(), ResolutionError> + Send + Sync>,
}

impl ChainedValidator {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Plan) -> Result<(), ResolutionError> + Send + Sync + 'static,
    {
        ChainedValidator {
            name: name.into(),
            callback: Box::new(callback),
        }
    }
}

/// Abstract network: every non-multiplexing input port has at most one
/// distinct driver.
pub fn abstract_network(plan: &Plan) -> Result<(), ResolutionError> {
    for id in plan.task_ids() {
        let task = plan.task(id);
        if !task.model.is_task_context() {
            continue;
        }
        let mut drivers: BTreeMap<String, Vec<(TaskId, String)>> = BTreeMap::new();
        for (source, sp, dp, _policy) in plan.in_connections(id) {
            if let Some(port) = task.model.find_input_port(&dp) {
                if port.multiplexes {
                    continue;
                }
            }
            let entry = drivers.entry(dp).or_default();
            if !entry.contains(&(source, sp.clone())) {
                entry.push((source, sp));
            }
        }
        for (port, sources) in drivers {
            if sources.len() > 1 {
                return Err(MultiplexingError {
                    task: id,
                    port,
                    sources,
                }
                .into());
            }
        }
    }
    Ok(())
}

/// Generated network: nothing abstract remains, every master driver
/// service is bound, and no device is bound twice.
pub fn generated_network(plan: &Plan) -> Result<(), ResolutionError> {
    let abstract_tasks: Vec<(TaskId, String)> = plan
        .tasks()
        .filter(|(_, t)| t.is_abstract)
        .map(|(id, t)| (id, t.model.name.clone()))
        .collect();
    if !abstract_tasks.is_empty() {
        return Err(TaskAllocationFailed {
            tasks: abstract_tasks,
        }
        .into());
    }

    let mut bound: BTreeMap<String, TaskId> = BTreeMap::new();
    for id in plan.task_ids() {
        let task = plan.task(id);
        for service in &task.model.driver_services {
            let Some(device) = task.bound_device(service) else {
                return Err(DeviceAllocationFailed {
                    task: id,
                    service: service.name.clone(),
                }
                .into());
            };
            if let Some(&first) = bound.get(device) {
                if first != id {
                    return Err(ConflictingDeviceAllocation {
                        device: device.to_string(),
                        first,
                        second: id,
                    }
                    .into());
                }
            } else {
                bound.insert(device.to_string(), id);
            }
        }
    }
    Ok(())
}

/// Deployed network: every non-abstract, non-finished task context has an
/// execution agent. Selection diagnostics collected earlier are attached
/// to the failure; tasks missing without diagnostics get their candidates
/// recomputed from the index.
pub fn deployed_network(
    plan: &Plan,
    index: &DeploymentCandidateIndex,
    diagnostics: &[MissingDeployment],
) -> Result<(), ResolutionError> {
    let mut missing = Vec::new();
    for id in plan.task_ids() {
        let task = plan.task(id);
        if !task.model.is_task_context()
            || task.is_abstract
            || task.finished()
            || task.execution_agent.is_some()
        {
            continue;
        }
        match diagnostics.iter().find(|d| d.task == id) {
            Some(diagnostic) => missing.push(diagnostic.clone()),
            None => missing.push(MissingDeployment {
                task: id,
                model: task.model.name.clone(),
                reason: MissingReason::NoCandidates,
                candidates: index
                    .candidates_for(&task.model)
                    .into_iter()
                    .map(|c| (c, None))
                    .collect(),
            }),
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(MissingDeployments(missing).into())
    }
}

/// Final network: every required instance resolves to a task that is
/// still attached to a plan and does not stand in for something else.
pub fn final_network(
    work: &Plan,
    real: &Plan,
    required_instances: &BTreeMap<TaskId, TaskId>,
) -> Result<(), ResolutionError> {
    for (&requirement, &instance) in required_instances {
        if let Some(task) = work.find_task(instance) {
            if task.is_proxy() {
                return Err(ResolutionError::internal(format!(
                    "required instance {instance} for requirement {requirement} \
                     is still a transaction proxy"
                )));
            }
        } else if !real.contains(instance) {
            return Err(ResolutionError::internal(format!(
                "required instance {instance} for requirement {requirement} \
                 is not attached to any plan"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::model::{ComponentModel, ConnectionPolicy, ModelRegistry, PortModel};
    use crate::plan::Task;

    fn sink_model(multiplexes: bool) -> Arc<ComponentModel> {
        let port = if multiplexes {
            PortModel::input("in", "Sample").multiplexing()
        } else {
            PortModel::input("in", "Sample")
        };
        Arc::new(ComponentModel::task_context("sink::Task").with_port(port))
    }

    fn source(plan: &mut Plan, name: &str) -> TaskId {
        plan.add(Task::new(Arc::new(
            ComponentModel::task_context(name).with_port(PortModel::output("out", "Sample")),
        )))
    }

    #[test]
    fn distinct_drivers_on_plain_port_fail() {
        let mut plan = Plan::new();
        let s1 = source(&mut plan, "src::A");
        let s2 = source(&mut plan, "src::B");
        let sink = plan.add(Task::new(sink_model(false)));
        plan.connect(s1, "out", sink, "in", ConnectionPolicy::Data);
        plan.connect(s2, "out", sink, "in", ConnectionPolicy::Data);

        let err = abstract_network(&plan).unwrap_err();
        match err {
            ResolutionError::Multiplexing(e) => {
                assert_eq!(e.task, sink);
                assert_eq!(e.port, "in");
                assert_eq!(e.sources.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn multiplexing_port_accepts_several_drivers() {
        let mut plan = Plan::new();
        let s1 = source(&mut plan, "src::A");
        let s2 = source(&mut plan, "src::B");
        let sink = plan.add(Task::new(sink_model(true)));
        plan.connect(s1, "out", sink, "in", ConnectionPolicy::Data);
        plan.connect(s2, "out", sink, "in", ConnectionPolicy::Data);

        abstract_network(&plan).unwrap();
    }

    #[test]
    fn same_driver_twice_is_one_source() {
        let mut plan = Plan::new();
        let s1 = source(&mut plan, "src::A");
        let sink = plan.add(Task::new(sink_model(false)));
        plan.connect(s1, "out", sink, "in", ConnectionPolicy::Data);

        abstract_network(&plan).unwrap();
    }

    #[test]
    fn abstract_tasks_fail_allocation() {
        let mut plan = Plan::new();
        let service = plan.add(Task::new(Arc::new(ComponentModel::data_service(
            "ImageSource",
        ))));
        let err = generated_network(&plan).unwrap_err();
        match err {
            ResolutionError::TaskAllocation(e) => {
                assert_eq!(e.tasks, vec![(service, "ImageSource".to_string())]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unbound_driver_service_fails() {
        let mut plan = Plan::new();
        let cam = plan.add(Task::new(Arc::new(
            ComponentModel::task_context("camera::Driver").with_driver_service("camera"),
        )));
        let err = generated_network(&plan).unwrap_err();
        match err {
            ResolutionError::DeviceAllocation(e) => {
                assert_eq!(e.task, cam);
                assert_eq!(e.service, "camera");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn device_bound_twice_conflicts() {
        let model = Arc::new(
            ComponentModel::task_context("camera::Driver").with_driver_service("camera"),
        );
        let mut plan = Plan::new();
        let a = plan.add(Task::new(model.clone()).with_argument("camera_dev", json!("cam0")));
        let b = plan.add(Task::new(model).with_argument("camera_dev", json!("cam0")));

        let err = generated_network(&plan).unwrap_err();
        match err {
            ResolutionError::ConflictingDevices(e) => {
                assert_eq!(e.device, "cam0");
                assert_eq!((e.first, e.second), (a, b));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn deployed_network_reports_agentless_tasks_with_diagnostics() {
        let registry = ModelRegistry::new();
        let index = DeploymentCandidateIndex::build(&registry, &[]);
        let mut plan = Plan::new();
        let cam = plan.add(Task::new(Arc::new(ComponentModel::task_context(
            "camera::Driver",
        ))));

        let err = deployed_network(&plan, &index, &[]).unwrap_err();
        match err {
            ResolutionError::MissingDeployments(e) => {
                assert_eq!(e.0.len(), 1);
                assert_eq!(e.0[0].task, cam);
                assert_eq!(e.0[0].reason, MissingReason::NoCandidates);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn final_network_rejects_detached_and_proxy_instances() {
        let mut work = Plan::new();
        let real = Plan::new();
        let mut proxy = Task::new(Arc::new(ComponentModel::task_context("camera::Driver")));
        proxy.proxy_of = Some(TaskId(7));
        let proxy = work.add(proxy);

        let required = BTreeMap::from([(TaskId(1), proxy)]);
        assert!(final_network(&work, &real, &required).is_err());

        let required = BTreeMap::from([(TaskId(1), TaskId(12345))]);
        assert!(final_network(&work, &real, &required).is_err());

        let ok = work.add(Task::new(Arc::new(ComponentModel::task_context(
            "camera::Driver",
        ))));
        let required = BTreeMap::from([(TaskId(1), ok)]);
        assert!(final_network(&work, &real, &required).is_ok());
    }
}
