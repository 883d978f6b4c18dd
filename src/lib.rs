#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod bus;
mod deploy;
mod dot;
mod dynamics;
mod engine;
mod error;
mod instantiate;
mod merge;
mod model;
mod plan;
mod reconcile;
mod requirements;
mod transaction;
mod validate;

pub use crate::deploy::{
    apply_selected_deployments, select_deployments, AvailableDeployment,
    DeploymentCandidateIndex, SelectionOutcome,
};
pub use crate::dot::{dataflow, hierarchy, PlanDumper};
pub use crate::dynamics::{DataflowDynamics, DeclaredPolicies, PolicyMap};
pub use crate::engine::{
    Engine, Hook, HookStage, OnError, ResolveOptions, ResolveReport, SystemConfig,
};
pub use crate::error::*;
pub use crate::instantiate::{allocate_devices, instantiate_requirements, Instantiation};
pub use crate::merge::{MergeSolver, MergeStats};
pub use crate::model::{
    BusDef, ChildModel, ComponentModel, ConnectionPolicy, DeployedTaskModel, DeploymentModel,
    DeviceDef, DriverService, InternalConnection, ModelKind, ModelName, ModelRegistry, PortModel,
    ABSTRACT_ROOTS,
};
pub use crate::plan::{
    ConnectionSet, DependencyInfo, DeploymentHint, DeploymentInfo, EventKind, EventRef,
    ExecState, OrderingConstraint, Plan, Task, TaskId,
};
pub use crate::reconcile::{reconcile, ReconcileStats};
pub use crate::requirements::{FulfilledModel, InstanceRequirements};
pub use crate::transaction::{CommitOutcome, Transaction};
pub use crate::validate::{ChainedValidator, ValidationStage};
