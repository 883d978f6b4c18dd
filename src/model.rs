//! Immutable component and deployment model descriptors, and the registry
//! the engine resolves model names against.
//!
//! Models are pure data: the engine never mutates them, and tasks share
//! them through `Arc`. Tasks are dispatched on the model's [`ModelKind`]
//! tag rather than on structural probing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub type ModelName = String;

/// Names of the abstract root models. They anchor the fulfillment
/// hierarchy but are never deployable or instantiable on their own.
pub const ABSTRACT_ROOTS: [&str; 4] = ["Component", "TaskContext", "DataService", "Composition"];

/// Category tag of a component model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModelKind {
    /// A primitive component with ports and arguments, deployable into an
    /// OS process.
    TaskContext,
    /// A hierarchical component whose children are bound under role names.
    Composition,
    /// An abstract data-service interface fulfilled by concrete models.
    DataService,
    /// Anything else the plan tracks (requirement tasks, process tasks).
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// A single input or output port of a task-context model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortModel {
    pub name: String,
    pub data_type: String,
    pub direction: PortDirection,
    /// Static ports cannot change while the task is configured; modifying
    /// one requires a full stop-reconfigure cycle.
    pub is_static: bool,
    /// Whether the port accepts several distinct drivers at once.
    pub multiplexes: bool,
}

impl PortModel {
    pub fn input(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        PortModel {
            name: name.into(),
            data_type: data_type.into(),
            direction: PortDirection::Input,
            is_static: false,
            multiplexes: false,
        }
    }

    pub fn output(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        PortModel {
            name: name.into(),
            data_type: data_type.into(),
            direction: PortDirection::Output,
            is_static: false,
            multiplexes: false,
        }
    }

    pub fn static_port(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn multiplexing(mut self) -> Self {
        self.multiplexes = true;
        self
    }
}

/// A named child of a composition model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildModel {
    pub role: String,
    pub model: ModelName,
    /// Optional children may be dropped when they cannot be resolved.
    pub optional: bool,
}

/// A master driver service exposed by a task-context model. The device
/// bound to the service is carried by the `<name>_dev` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverService {
    pub name: String,
}

impl DriverService {
    pub fn device_argument(&self) -> String {
        format!("{}_dev", self.name)
    }
}

/// Transport policy of a single port-to-port connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum ConnectionPolicy {
    #[default]
    Data,
    Buffer(usize),
}

/// A connection declared between two children of a composition model,
/// materialized as a dataflow edge at instantiation time.
#[derive(Debug, Clone)]
pub struct InternalConnection {
    pub source_role: String,
    pub source_port: String,
    pub sink_role: String,
    pub sink_port: String,
    pub policy: ConnectionPolicy,
}

/// An immutable component model descriptor.
#[derive(Debug, Clone)]
pub struct ComponentModel {
    pub name: ModelName,
    pub kind: ModelKind,
    /// Models this one is substitutable for, not including itself.
    pub fulfilled: BTreeSet<ModelName>,
    /// Declared argument names. Empty means the model accepts anything.
    pub arguments: BTreeSet<String>,
    pub children: Vec<ChildModel>,
    pub inputs: Vec<PortModel>,
    pub outputs: Vec<PortModel>,
    pub driver_services: Vec<DriverService>,
    pub connections: Vec<InternalConnection>,
}

impl ComponentModel {
    fn base(name: impl Into<ModelName>, kind: ModelKind) -> Self {
        ComponentModel {
            name: name.into(),
            kind,
            fulfilled: BTreeSet::new(),
            arguments: BTreeSet::new(),
            children: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            driver_services: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn task_context(name: impl Into<ModelName>) -> Self {
        Self::base(name, ModelKind::TaskContext)
    }

    pub fn composition(name: impl Into<ModelName>) -> Self {
        Self::base(name, ModelKind::Composition)
    }

    pub fn data_service(name: impl Into<ModelName>) -> Self {
        Self::base(name, ModelKind::DataService)
    }

    pub fn generic(name: impl Into<ModelName>) -> Self {
        Self::base(name, ModelKind::Generic)
    }

    pub fn fulfills_model(mut self, name: impl Into<ModelName>) -> Self {
        self.fulfilled.insert(name.into());
        self
    }

    pub fn with_argument(mut self, name: impl Into<String>) -> Self {
        self.arguments.insert(name.into());
        self
    }

    pub fn with_child(mut self, role: impl Into<String>, model: impl Into<ModelName>) -> Self {
        self.children.push(ChildModel {
            role: role.into(),
            model: model.into(),
            optional: false,
        });
        self
    }

    pub fn with_optional_child(
        mut self,
        role: impl Into<String>,
        model: impl Into<ModelName>,
    ) -> Self {
        self.children.push(ChildModel {
            role: role.into(),
            model: model.into(),
            optional: true,
        });
        self
    }

    pub fn with_port(mut self, port: PortModel) -> Self {
        match port.direction {
            PortDirection::Input => self.inputs.push(port),
            PortDirection::Output => self.outputs.push(port),
        }
        self
    }

    pub fn with_driver_service(mut self, name: impl Into<String>) -> Self {
        let service = DriverService { name: name.into() };
        self.arguments.insert(service.device_argument());
        self.driver_services.push(service);
        self
    }

    pub fn with_connection<A, B, C, D>(
        mut self,
        source: (A, B),
        sink: (C, D),
        policy: ConnectionPolicy,
    ) -> Self
    where
        A: Into<String>,
        B: Into<String>,
        C: Into<String>,
        D: Into<String>,
    {
        self.connections.push(InternalConnection {
            source_role: source.0.into(),
            source_port: source.1.into(),
            sink_role: sink.0.into(),
            sink_port: sink.1.into(),
            policy,
        });
        self
    }

    pub fn is_task_context(&self) -> bool {
        self.kind == ModelKind::TaskContext
    }

    pub fn is_composition(&self) -> bool {
        self.kind == ModelKind::Composition
    }

    /// Whether the model stands for an interface rather than something
    /// instantiable.
    pub fn is_abstract(&self) -> bool {
        self.kind == ModelKind::DataService || ABSTRACT_ROOTS.contains(&self.name.as_str())
    }

    /// Whether this model can substitute for `name`.
    pub fn fulfills(&self, name: &str) -> bool {
        self.name == name || self.fulfilled.contains(name)
    }

    pub fn find_input_port(&self, name: &str) -> Option<&PortModel> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn find_output_port(&self, name: &str) -> Option<&PortModel> {
        self.outputs.iter().find(|p| p.name == name)
    }

    pub fn find_child(&self, role: &str) -> Option<&ChildModel> {
        self.children.iter().find(|c| c.role == role)
    }

    /// Whether an argument map only uses declared argument names. Models
    /// that declare no arguments accept anything.
    pub fn admits_arguments<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> bool {
        if self.arguments.is_empty() {
            return true;
        }
        names.into_iter().all(|n| self.arguments.contains(n))
    }
}

/// One task context hosted by a deployment model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedTaskModel {
    /// Deployment-local task name.
    pub name: String,
    pub model: ModelName,
}

/// An immutable deployment model: the task contexts one OS process hosts.
#[derive(Debug, Clone)]
pub struct DeploymentModel {
    pub name: String,
    pub tasks: Vec<DeployedTaskModel>,
}

impl DeploymentModel {
    pub fn new(name: impl Into<String>) -> Self {
        DeploymentModel {
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    pub fn with_task(mut self, name: impl Into<String>, model: impl Into<ModelName>) -> Self {
        self.tasks.push(DeployedTaskModel {
            name: name.into(),
            model: model.into(),
        });
        self
    }

    pub fn find_task(&self, name: &str) -> Option<&DeployedTaskModel> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

/// A hardware device made available to the system. The device satisfies
/// the master driver service named by `service`, optionally through a
/// communication bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDef {
    pub name: String,
    pub service: String,
    pub bus: Option<String>,
}

impl DeviceDef {
    pub fn new(name: impl Into<String>, service: impl Into<String>) -> Self {
        DeviceDef {
            name: name.into(),
            service: service.into(),
            bus: None,
        }
    }

    pub fn on_bus(mut self, bus: impl Into<String>) -> Self {
        self.bus = Some(bus.into());
        self
    }
}

/// A communication bus and the task-context model that drives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusDef {
    pub name: String,
    pub driver: ModelName,
}

impl BusDef {
    pub fn new(name: impl Into<String>, driver: impl Into<ModelName>) -> Self {
        BusDef {
            name: name.into(),
            driver: driver.into(),
        }
    }
}

/// The model registry the engine resolves names against.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: BTreeMap<ModelName, Arc<ComponentModel>>,
    deployments: BTreeMap<String, Arc<DeploymentModel>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: ComponentModel) -> Arc<ComponentModel> {
        let model = Arc::new(model);
        self.models.insert(model.name.clone(), model.clone());
        model
    }

    pub fn register_deployment(&mut self, model: DeploymentModel) -> Arc<DeploymentModel> {
        let model = Arc::new(model);
        self.deployments.insert(model.name.clone(), model.clone());
        model
    }

    pub fn find(&self, name: &str) -> Option<Arc<ComponentModel>> {
        self.models.get(name).cloned()
    }

    pub fn deployment(&self, name: &str) -> Option<Arc<DeploymentModel>> {
        self.deployments.get(name).cloned()
    }

    /// All registered models, in name order.
    pub fn each_model(&self) -> impl Iterator<Item = &Arc<ComponentModel>> {
        self.models.values()
    }

    /// Non-abstract models that can substitute for `name`, in name order.
    pub fn each_submodel(&self, name: &str) -> Vec<Arc<ComponentModel>> {
        self.models
            .values()
            .filter(|m| !m.is_abstract() && m.fulfills(name))
            .cloned()
            .collect()
    }
}
