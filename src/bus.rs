//! Attaches device-carrying tasks to their communication-bus tasks.

use std::collections::BTreeMap;

use crate::error::ResolutionError;
use crate::model::{BusDef, DeviceDef, ModelRegistry};
use crate::plan::{EventKind, Plan, Task, TaskId};

/// For every task whose bound devices sit on a communication bus, ensures
/// the plan holds exactly one bus task per bus, records the attachment,
/// adds a dependency on the bus task and orders the device task's
/// configuration strictly after the bus start.
pub fn link_to_busses(
    plan: &mut Plan,
    registry: &ModelRegistry,
    devices: &BTreeMap<String, DeviceDef>,
    buses: &BTreeMap<String, BusDef>,
) -> Result<(), ResolutionError> {
    let mut bus_tasks: BTreeMap<String, TaskId> = BTreeMap::new();

    for id in plan.task_ids() {
        let services = plan.task(id).model.driver_services.clone();
        for service in services {
            let Some(device_name) = plan.task(id).bound_device(&service).map(str::to_string)
            else {
                continue;
            };
            let Some(device) = devices.get(&device_name) else {
                continue;
            };
            let Some(bus_name) = device.bus.clone() else {
                continue;
            };
            let bus = buses.get(&bus_name).ok_or_else(|| {
                ResolutionError::internal(format!(
                    "device '{device_name}' sits on undeclared bus '{bus_name}'"
                ))
            })?;

            let bus_task = ensure_bus_task(plan, registry, &mut bus_tasks, bus)?;
            if bus_task == id {
                continue;
            }
            plan.task_mut(bus_task).attachments.insert(id);
            plan.add_dependency(id, bus_task, bus_name.clone());
            plan.add_ordering((bus_task, EventKind::Start), (id, EventKind::Configure));
            tracing::debug!(task = %id, bus = %bus_name, "attached to bus");
        }
    }
    Ok(())
}

/// One bus task per bus, memoized for the pass and reusing any matching
/// task the plan already holds.
fn ensure_bus_task(
    plan: &mut Plan,
    registry: &ModelRegistry,
    memo: &mut BTreeMap<String, TaskId>,
    bus: &BusDef,
) -> Result<TaskId, ResolutionError> {
    if let Some(&id) = memo.get(&bus.name) {
        return Ok(id);
    }

    let existing = plan.find_local_tasks(&bus.driver).into_iter().find(|&id| {
        plan.task(id)
            .argument("dev")
            .and_then(serde_json::Value::as_str)
            == Some(bus.name.as_str())
    });
    let id = match existing {
        Some(id) => id,
        None => {
            let model = registry.find(&bus.driver).ok_or_else(|| {
                ResolutionError::internal(format!(
                    "bus '{}' names unregistered driver model '{}'",
                    bus.name, bus.driver
                ))
            })?;
            let task = Task::new(model).with_argument("dev", bus.name.clone().into());
            plan.add(task)
        }
    };
    memo.insert(bus.name.clone(), id);
    Ok(id)
}
