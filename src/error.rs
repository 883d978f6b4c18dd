//! Typed failures raised by the resolver pipeline.
//!
//! Validators and solvers raise these; no stage recovers internally. The
//! pipeline driver decides what happens to the staging transaction after a
//! failure, then surfaces the error unchanged.

use thiserror::Error;

use crate::model::ModelName;
use crate::plan::TaskId;

/// A deployable slot: one task context hosted by one deployment model on
/// one machine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeploymentSlot {
    pub host: String,
    pub deployment: String,
    pub task_name: String,
}

impl std::fmt::Display for DeploymentSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}.{}", self.host, self.deployment, self.task_name)
    }
}

/// Why a task context could not be bound to an execution agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingReason {
    /// No deployment hosts the task's model at all.
    NoCandidates,
    /// The task requested a specific deployed name and nothing matched.
    NameMismatch,
    /// Several candidates survived hint filtering.
    Ambiguous,
    /// The only acceptable slot is already bound to another task.
    SlotTaken,
}

/// Per-task diagnostics carried by [`MissingDeployments`].
#[derive(Debug, Clone)]
pub struct MissingDeployment {
    pub task: TaskId,
    pub model: ModelName,
    pub reason: MissingReason,
    /// Candidate slots, each with the task currently bound to it, if any.
    pub candidates: Vec<(DeploymentSlot, Option<TaskId>)>,
}

#[derive(Debug, Error)]
#[error("{} task context(s) have no deployable slot", .0.len())]
pub struct MissingDeployments(pub Vec<MissingDeployment>);

#[derive(Debug, Error)]
#[error("{} task(s) remained abstract after network generation", .tasks.len())]
pub struct TaskAllocationFailed {
    /// Abstract tasks with the model that could not be made concrete.
    pub tasks: Vec<(TaskId, ModelName)>,
}

#[derive(Debug, Error)]
#[error("no device bound for master driver service '{service}' of task {task}")]
pub struct DeviceAllocationFailed {
    pub task: TaskId,
    pub service: String,
}

#[derive(Debug, Error)]
#[error("device '{device}' is bound to both {first} and {second}")]
pub struct ConflictingDeviceAllocation {
    pub device: String,
    pub first: TaskId,
    pub second: TaskId,
}

#[derive(Debug, Error)]
#[error(
    "input port '{port}' of {task} does not multiplex but is driven by {} distinct sources",
    .sources.len()
)]
pub struct MultiplexingError {
    pub task: TaskId,
    pub port: String,
    /// The distinct (source task, source port) pairs driving the port.
    pub sources: Vec<(TaskId, String)>,
}

#[derive(Debug, Error)]
#[error(
    "selecting a concrete model for '{requested}' is ambiguous between {}",
    .candidates.join(", ")
)]
pub struct AmbiguousSpecialization {
    pub requested: ModelName,
    pub candidates: Vec<ModelName>,
}

#[derive(Debug, Error)]
#[error(
    "cannot merge {from} into {into}: connection {source_port} -> {sink_port} \
     carries conflicting policies"
)]
pub struct MergeConflict {
    pub from: TaskId,
    pub into: TaskId,
    pub source_port: String,
    pub sink_port: String,
}

/// Top-level error of a [`resolve`](crate::Engine::resolve) pass.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error(transparent)]
    TaskAllocation(#[from] TaskAllocationFailed),

    #[error(transparent)]
    DeviceAllocation(#[from] DeviceAllocationFailed),

    #[error(transparent)]
    ConflictingDevices(#[from] ConflictingDeviceAllocation),

    #[error(transparent)]
    Multiplexing(#[from] MultiplexingError),

    #[error(transparent)]
    MissingDeployments(#[from] MissingDeployments),

    #[error(transparent)]
    AmbiguousSpecialization(#[from] AmbiguousSpecialization),

    #[error(transparent)]
    MergeConflict(#[from] MergeConflict),

    #[error("dataflow dynamics computation failed: {0}")]
    Dynamics(#[source] anyhow::Error),

    #[error("hook '{0}' failed: {1}")]
    Hook(String, #[source] anyhow::Error),

    #[error("failed to write plan dumps: {0}")]
    Dump(#[from] std::io::Error),

    /// Invariant violations that should not be reachable.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ResolutionError {
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        ResolutionError::Internal(msg.into())
    }
}
