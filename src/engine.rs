//! The pipeline driver: sequences the resolution stages over a staging
//! transaction and commits or discards the result.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::bus;
use crate::deploy::{self, AvailableDeployment, DeploymentCandidateIndex};
use crate::dot::PlanDumper;
use crate::dynamics::{self, DataflowDynamics, DeclaredPolicies, PolicyMap};
use crate::error::ResolutionError;
use crate::instantiate;
use crate::merge::{MergeSolver, MergeStats};
use crate::model::{BusDef, ComponentModel, DeviceDef, ModelRegistry};
use crate::plan::{Plan, Task, TaskId};
use crate::reconcile::{self, ReconcileStats};
use crate::requirements::InstanceRequirements;
use crate::transaction::Transaction;
use crate::validate::{self, ChainedValidator, ValidationStage};

/// The five hook points of a resolution pass, in invocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookStage {
    Instantiation,
    InstantiatedNetwork,
    SystemNetwork,
    Deployment,
    FinalNetwork,
}

/// A named callback invoked synchronously with the working plan. Hooks
/// must not open transactions of their own.
pub struct Hook {
    pub name: String,
    callback: Box<dyn Fn(&mut Plan) -> anyhow::Result<()> + Send + Sync>,
}

impl Hook {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&mut Plan) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Hook {
            name: name.into(),
            callback: Box::new(callback),
        }
    }
}

/// Process-wide configuration injected into the engine: the model
/// registry, what can be deployed where, the robot's devices and buses,
/// hooks and debug switches.
pub struct SystemConfig {
    pub registry: Arc<ModelRegistry>,
    pub available_deployments: Vec<AvailableDeployment>,
    pub devices: BTreeMap<String, DeviceDef>,
    pub buses: BTreeMap<String, BusDef>,
    pub log_dir: Utf8PathBuf,
    pub keep_internal_data_structures: bool,
    pub strict_specializations: bool,
    hooks: Vec<(HookStage, Hook)>,
    validators: Vec<(ValidationStage, ChainedValidator)>,
}

impl SystemConfig {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        SystemConfig {
            registry,
            available_deployments: Vec::new(),
            devices: BTreeMap::new(),
            buses: BTreeMap::new(),
            log_dir: Utf8PathBuf::from("log"),
            keep_internal_data_structures: false,
            strict_specializations: false,
            hooks: Vec::new(),
            validators: Vec::new(),
        }
    }

    pub fn with_deployment(mut self, host: impl Into<String>, model: impl Into<String>) -> Self {
        self.available_deployments
            .push(AvailableDeployment::new(host, model));
        self
    }

    pub fn with_device(mut self, device: DeviceDef) -> Self {
        self.devices.insert(device.name.clone(), device);
        self
    }

    pub fn with_bus(mut self, bus: BusDef) -> Self {
        self.buses.insert(bus.name.clone(), bus);
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Registers a hook; hooks of one stage run in registration order.
    pub fn add_hook(mut self, stage: HookStage, hook: Hook) -> Self {
        self.hooks.push((stage, hook));
        self
    }

    /// Chains a validator after the built-in checks of a stage.
    pub fn chain_validator(mut self, stage: ValidationStage, validator: ChainedValidator) -> Self {
        self.validators.push((stage, validator));
        self
    }

    fn hooks_for(&self, stage: HookStage) -> impl Iterator<Item = &Hook> {
        self.hooks
            .iter()
            .filter(move |(s, _)| *s == stage)
            .map(|(_, h)| h)
    }

    fn validators_for(&self, stage: ValidationStage) -> impl Iterator<Item = &ChainedValidator> {
        self.validators
            .iter()
            .filter(move |(s, _)| *s == stage)
            .map(|(_, v)| v)
    }
}

/// What to do with the staging transaction when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    /// Dump dataflow and hierarchy graphs, then discard.
    Save,
    /// Commit the staging state anyway, for debugging.
    Commit,
    /// Discard silently.
    #[default]
    Drop,
}

/// Options of one [`Engine::resolve`] pass.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Override the set of requirement tasks; defaults to discovering
    /// them from the real plan.
    pub requirement_tasks: Option<Vec<TaskId>>,
    /// Stop after the generated network when false.
    pub compute_deployments: bool,
    /// Skip dataflow-dynamics computation when false.
    pub compute_policies: bool,
    /// Keep instantiated-but-unused tasks when false.
    pub garbage_collect: bool,
    /// Always dump dot files on success.
    pub save_plans: bool,
    pub on_error: OnError,
    pub validate_abstract_network: bool,
    pub validate_generated_network: bool,
    pub validate_deployed_network: bool,
    pub validate_final_network: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        ResolveOptions {
            requirement_tasks: None,
            compute_deployments: true,
            compute_policies: true,
            garbage_collect: true,
            save_plans: false,
            on_error: OnError::Drop,
            validate_abstract_network: true,
            validate_generated_network: true,
            validate_deployed_network: true,
            validate_final_network: true,
        }
    }
}

/// Summary of a successful pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolveReport {
    pub instantiated: usize,
    pub merge: MergeStats,
    pub deployed: usize,
    pub reconcile: ReconcileStats,
    /// Real tasks the commit created.
    pub created: usize,
    /// Real tasks the commit replaced with another task.
    pub replaced: usize,
    pub dumps: Option<(Utf8PathBuf, Utf8PathBuf)>,
}

/// The network generation engine. Owns the real plan; every
/// [`resolve`](Engine::resolve) call works in a staging transaction and
/// only a successful commit modifies the plan.
pub struct Engine {
    config: SystemConfig,
    plan: Plan,
    required_instances: BTreeMap<TaskId, TaskId>,
    dumper: PlanDumper,
    dynamics: Box<dyn DataflowDynamics>,
    policies: Option<PolicyMap>,
    candidate_index: Option<DeploymentCandidateIndex>,
    merge_graph: Option<MergeSolver>,
}

impl Engine {
    pub fn new(config: SystemConfig) -> Self {
        let dumper = PlanDumper::new(&config.log_dir);
        Engine {
            config,
            plan: Plan::new(),
            required_instances: BTreeMap::new(),
            dumper,
            dynamics: Box::new(DeclaredPolicies),
            policies: None,
            candidate_index: None,
            merge_graph: None,
        }
    }

    pub fn with_dynamics(mut self, dynamics: Box<dyn DataflowDynamics>) -> Self {
        self.dynamics = dynamics;
        self
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn plan_mut(&mut self) -> &mut Plan {
        &mut self.plan
    }

    /// Requirement task to the resolved task of the last successful pass.
    pub fn required_instances(&self) -> &BTreeMap<TaskId, TaskId> {
        &self.required_instances
    }

    pub fn connection_policies(&self) -> Option<&PolicyMap> {
        self.policies.as_ref()
    }

    /// The replacement graph of the last pass, retained only when
    /// `keep_internal_data_structures` is set.
    pub fn merge_graph(&self) -> Option<&MergeSolver> {
        self.merge_graph.as_ref()
    }

    /// The candidate index of the last pass, retained only when
    /// `keep_internal_data_structures` is set.
    pub fn deployment_index(&self) -> Option<&DeploymentCandidateIndex> {
        self.candidate_index.as_ref()
    }

    /// Adds a requirement task and its placeholder to the real plan.
    /// Both are permanent; the placeholder is replaced by the resolved
    /// implementation on commit.
    pub fn add_requirement(&mut self, requirements: InstanceRequirements) -> TaskId {
        let requirements = Arc::new(requirements);
        let mut task = Task::new(Arc::new(ComponentModel::generic("requirement")));
        task.requirements = Some(requirements.clone());
        let requirement = self.plan.add_permanent_task(task);

        let placeholder_model = self
            .config
            .registry
            .find(&requirements.model)
            .unwrap_or_else(|| Arc::new(ComponentModel::data_service(requirements.model.clone())));
        let mut placeholder = Task::new(placeholder_model);
        placeholder.is_abstract = true;
        let placeholder = self.plan.add_permanent_task(placeholder);
        self.plan.set_planning(requirement, placeholder);
        requirement
    }

    /// Drops a requirement. Its resolved network loses its permanence
    /// anchor unless another requirement still plans the same task, so a
    /// later garbage collection removes exactly the subgraph that was
    /// unique to it.
    pub fn remove_requirement(&mut self, requirement: TaskId) {
        let planned = self.plan.planned_task(requirement);
        self.plan.remove_task(requirement);
        self.required_instances.remove(&requirement);
        if let Some(planned) = planned {
            let still_planned = self.plan.planning().any(|(_, t)| t == planned);
            if !still_planned {
                self.plan.unmark_permanent_task(planned);
            }
        }
    }

    /// One full resolution pass. See the crate docs for the stage
    /// sequence.
    pub fn resolve(&mut self, options: ResolveOptions) -> Result<ResolveReport, ResolutionError> {
        let requirements = self.requirement_set(&options)?;
        tracing::info!(count = requirements.len(), "resolving requirements");

        let mut txn = Transaction::new(&self.plan);
        let mut solver = MergeSolver::new();
        let outcome = resolve_network(
            &self.config,
            &self.plan,
            self.dynamics.as_ref(),
            &self.required_instances,
            &mut txn,
            &mut solver,
            &requirements,
            &options,
        );

        match outcome {
            Ok(mut net) => {
                let dumps = if options.save_plans {
                    match self.dumper.save(txn.work()) {
                        Ok(paths) => Some(paths),
                        Err(err) => {
                            txn.discard();
                            self.finalize(solver);
                            return Err(err.into());
                        }
                    }
                } else {
                    None
                };

                let commit = txn.commit(&mut self.plan, &solver);
                let required: BTreeMap<TaskId, TaskId> = net
                    .required
                    .iter()
                    .map(|(&req, &task)| (req, commit.resolve(solver.replacement_for(task))))
                    .collect();
                self.required_instances.extend(required);

                if let Some(policies) = net.policies.as_mut() {
                    dynamics::apply_merges(policies, &solver);
                    let rewritten: PolicyMap = std::mem::take(policies)
                        .into_iter()
                        .map(|((source, sp, sink, dp), policy)| {
                            ((commit.resolve(source), sp, commit.resolve(sink), dp), policy)
                        })
                        .collect();
                    *policies = rewritten;
                }
                self.policies = net.policies;
                self.candidate_index = net.index;

                let report = ResolveReport {
                    instantiated: net.instantiated,
                    merge: net.merge,
                    deployed: net.deployed,
                    reconcile: net.reconcile,
                    created: commit.created.len(),
                    replaced: commit.replaced.len(),
                    dumps,
                };
                tracing::info!(
                    created = report.created,
                    replaced = report.replaced,
                    "resolution committed"
                );
                self.finalize(solver);
                Ok(report)
            }
            Err(err) => {
                tracing::warn!(error = %err, "resolution failed");
                match options.on_error {
                    OnError::Save => {
                        if let Err(dump_err) = self.dumper.save(txn.work()) {
                            tracing::warn!(error = %dump_err, "could not dump failed plan");
                        }
                        txn.discard();
                    }
                    OnError::Commit => {
                        let _ = txn.commit(&mut self.plan, &solver);
                    }
                    OnError::Drop => txn.discard(),
                }
                self.finalize(solver);
                Err(err)
            }
        }
    }

    fn requirement_set(
        &self,
        options: &ResolveOptions,
    ) -> Result<Vec<(TaskId, Arc<InstanceRequirements>)>, ResolutionError> {
        match &options.requirement_tasks {
            Some(ids) => ids
                .iter()
                .map(|&id| {
                    self.plan
                        .find_task(id)
                        .and_then(|t| t.requirements.clone())
                        .map(|req| (id, req))
                        .ok_or_else(|| {
                            ResolutionError::internal(format!(
                                "task {id} is not a requirement task"
                            ))
                        })
                })
                .collect(),
            None => Ok(self
                .plan
                .tasks()
                .filter(|(_, t)| t.requirements.is_some() && !t.finished())
                .map(|(id, t)| (id, t.requirements.clone().expect("filtered on requirements")))
                .collect()),
        }
    }

    /// Releases per-pass state. The required-instance map is the engine's
    /// output and survives; everything else is debug data retained only
    /// on request.
    fn finalize(&mut self, solver: MergeSolver) {
        if self.config.keep_internal_data_structures {
            self.merge_graph = Some(solver);
        } else {
            self.merge_graph = None;
            self.policies = None;
            self.candidate_index = None;
        }
    }
}

#[derive(Default)]
struct NetworkOutcome {
    required: BTreeMap<TaskId, TaskId>,
    instantiated: usize,
    merge: MergeStats,
    deployed: usize,
    reconcile: ReconcileStats,
    policies: Option<PolicyMap>,
    index: Option<DeploymentCandidateIndex>,
}

#[allow(clippy::too_many_arguments)]
fn resolve_network(
    config: &SystemConfig,
    real: &Plan,
    dynamics_provider: &dyn DataflowDynamics,
    previous_instances: &BTreeMap<TaskId, TaskId>,
    txn: &mut Transaction,
    solver: &mut MergeSolver,
    requirements: &[(TaskId, Arc<InstanceRequirements>)],
    options: &ResolveOptions,
) -> Result<NetworkOutcome, ResolutionError> {
    let mut outcome = NetworkOutcome::default();

    // --- system network -------------------------------------------------
    tracing::debug!("computing system network");
    let instantiation = instantiate::instantiate_requirements(
        txn.work_mut(),
        &config.registry,
        config.strict_specializations,
        requirements,
    )?;
    outcome.instantiated = instantiation.required_instances.len();
    outcome.required = instantiation.required_instances;
    instantiate::allocate_devices(txn.work_mut());
    run_hooks(config, HookStage::Instantiation, txn.work_mut())?;

    outcome.merge += solver.merge_identical_tasks(txn.work_mut())?;
    run_hooks(config, HookStage::InstantiatedNetwork, txn.work_mut())?;

    bus::link_to_busses(txn.work_mut(), &config.registry, &config.devices, &config.buses)?;
    outcome.merge += solver.merge_identical_tasks(txn.work_mut())?;

    remove_optional_unresolved_children(txn.work_mut());
    freeze_default_configuration(txn.work_mut());

    if options.garbage_collect {
        txn.work_mut().static_garbage_collect(|id, task| {
            tracing::debug!(%id, model = %task.model.name, "collecting unused task");
        });
    }
    txn.work_mut().clear_permanent_marks();
    run_hooks(config, HookStage::SystemNetwork, txn.work_mut())?;

    for target in outcome.required.values_mut() {
        *target = solver.replacement_for(*target);
    }

    if options.validate_abstract_network {
        validate::abstract_network(txn.work())?;
        run_chained_validators(config, ValidationStage::Abstract, txn.work())?;
    }
    if options.validate_generated_network {
        validate::generated_network(txn.work())?;
        run_chained_validators(config, ValidationStage::Generated, txn.work())?;
    }

    // --- deployed network -----------------------------------------------
    if options.compute_deployments {
        tracing::debug!("computing deployed network");
        let index =
            DeploymentCandidateIndex::build(&config.registry, &config.available_deployments);
        let selection = deploy::select_deployments(txn.work(), &index);
        outcome.deployed = deploy::apply_selected_deployments(
            txn.work_mut(),
            &config.registry,
            solver,
            &selection.selected,
        )?;
        if options.validate_deployed_network {
            validate::deployed_network(txn.work(), &index, &selection.missing)?;
            run_chained_validators(config, ValidationStage::Deployed, txn.work())?;
        }
        if options.compute_policies {
            let policies = dynamics_provider
                .compute_connection_policies(txn.work())
                .map_err(ResolutionError::Dynamics)?;
            outcome.policies = Some(policies);
        }
        run_hooks(config, HookStage::Deployment, txn.work_mut())?;

        outcome.reconcile = reconcile::reconcile(real, txn, solver, previous_instances)?;
        outcome.merge += solver.merge_identical_tasks(txn.work_mut())?;
        outcome.index = Some(index);
    }

    // --- stored instances and toplevel fixes -----------------------------
    for target in outcome.required.values_mut() {
        *target = solver.replacement_for(*target);
    }
    fix_toplevel_tasks(real, txn, &outcome.required);

    // Register the proxy-to-real substitutions for the commit, then map
    // the stored instances through them.
    for id in txn.work().task_ids() {
        if let Some(real_id) = txn.work().task(id).proxy_of {
            if solver.replacement_for(id) == id {
                solver.register_replacement(id, real_id);
            }
        }
    }
    for target in outcome.required.values_mut() {
        *target = solver.replacement_for(*target);
    }

    run_hooks(config, HookStage::FinalNetwork, txn.work_mut())?;
    if options.validate_final_network {
        validate::final_network(txn.work(), real, &outcome.required)?;
        run_chained_validators(config, ValidationStage::Final, txn.work())?;
    }

    Ok(outcome)
}

/// Replaces each requirement's placeholder with its resolved task and
/// switches the planning relation.
fn fix_toplevel_tasks(real: &Plan, txn: &mut Transaction, required: &BTreeMap<TaskId, TaskId>) {
    for (&requirement, &resolved) in required {
        if !real.contains(requirement) {
            continue;
        }
        let requirement_proxy = txn.wrap_task(real, requirement);
        let Some(placeholder) = real.planned_task(requirement) else {
            continue;
        };
        let already_resolved = txn
            .work()
            .find_task(resolved)
            .is_some_and(|t| t.proxy_of == Some(placeholder));
        if !already_resolved {
            let placeholder_proxy = txn.wrap_task(real, placeholder);
            if placeholder_proxy != resolved {
                txn.work_mut().replace(placeholder_proxy, resolved);
                txn.work_mut().remove_task(placeholder_proxy);
            }
        }
        txn.work_mut().set_planning(requirement_proxy, resolved);
    }
}

/// Unresolved composition children bound only under optional roles are
/// dropped; children with a mix keep the required roles only.
fn remove_optional_unresolved_children(plan: &mut Plan) {
    for id in plan.task_ids() {
        let model = plan.task(id).model.clone();
        if !model.is_composition() {
            continue;
        }
        for child in plan.children(id) {
            if !plan.task(child).is_abstract {
                continue;
            }
            let roles = plan
                .dependency_roles(id, child)
                .cloned()
                .unwrap_or_default();
            let required: std::collections::BTreeSet<String> = roles
                .iter()
                .filter(|role| model.find_child(role).map_or(true, |c| !c.optional))
                .cloned()
                .collect();
            if required.is_empty() {
                tracing::debug!(composition = %id, %child, "dropping unresolved optional child");
                plan.remove_dependency(id, child);
            } else if required.len() < roles.len() {
                plan.narrow_dependency_roles(id, child, &required);
            }
        }
    }
}

/// Task contexts without an explicit configuration get the default one,
/// so later passes see a stable argument set.
fn freeze_default_configuration(plan: &mut Plan) {
    for id in plan.task_ids() {
        let task = plan.task(id);
        let admits_conf =
            task.model.arguments.is_empty() || task.model.arguments.contains("conf");
        if task.model.is_task_context() && admits_conf && task.argument("conf").is_none() {
            plan.task_mut(id)
                .set_argument("conf", serde_json::json!(["default"]));
        }
    }
}

fn run_hooks(
    config: &SystemConfig,
    stage: HookStage,
    plan: &mut Plan,
) -> Result<(), ResolutionError> {
    for hook in config.hooks_for(stage) {
        tracing::debug!(?stage, hook = %hook.name, "running hook");
        (hook.callback)(plan).map_err(|err| ResolutionError::Hook(hook.name.clone(), err))?;
    }
    Ok(())
}

fn run_chained_validators(
    config: &SystemConfig,
    stage: ValidationStage,
    plan: &Plan,
) -> Result<(), ResolutionError> {
    for validator in config.validators_for(stage) {
        tracing::debug!(?stage, validator = %validator.name, "running chained validator");
        (validator.callback)(plan)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use regex::Regex;

    use super::*;
    use crate::model::{ConnectionPolicy, DeploymentModel, PortModel};
    use crate::plan::{DeploymentHint, EventKind, ExecState};

    fn camera_registry() -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        registry.register(ComponentModel::task_context("camera::Driver"));
        registry.register_deployment(
            DeploymentModel::new("camera_deployment").with_task("cam", "camera::Driver"),
        );
        registry
    }

    fn camera_engine() -> (Engine, TaskId) {
        let config = SystemConfig::new(Arc::new(camera_registry()))
            .with_deployment("h1", "camera_deployment");
        let mut engine = Engine::new(config);
        let req = engine.add_requirement(InstanceRequirements::new("camera::Driver"));
        (engine, req)
    }

    #[test]
    fn resolves_single_task_onto_single_deployment() {
        let (mut engine, req) = camera_engine();
        let report = engine.resolve(ResolveOptions::default()).unwrap();
        assert_eq!(report.instantiated, 1);
        assert_eq!(report.deployed, 1);

        let resolved = engine.required_instances()[&req];
        let plan = engine.plan();
        let task = plan.task(resolved);
        assert_eq!(task.model.name, "camera::Driver");
        assert!(!task.is_proxy());
        assert_eq!(task.orocos_name.as_deref(), Some("cam"));

        let agent = task.execution_agent.expect("deployed task has an agent");
        let info = plan.task(agent).deployment.as_ref().unwrap();
        assert_eq!(info.process_name, "camera_deployment");
        assert_eq!(info.host, "h1");
        assert_eq!(plan.planned_task(req), Some(resolved));

        // The resolved task satisfies what the requirement asked for.
        let requirements = plan.task(req).requirements.clone().unwrap();
        assert!(requirements.fulfills(&plan.task(resolved).model));
    }

    #[test]
    fn resolving_twice_changes_nothing() {
        let (mut engine, req) = camera_engine();
        let first = engine.resolve(ResolveOptions::default()).unwrap();
        assert!(first.created > 0);
        let resolved = engine.required_instances()[&req];
        let task_count = engine.plan().len();

        let second = engine.resolve(ResolveOptions::default()).unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.replaced, 0);
        assert_eq!(engine.required_instances()[&req], resolved);
        assert_eq!(engine.plan().len(), task_count);
    }

    #[test]
    fn ambiguity_fails_and_a_hint_disambiguates() {
        let mut registry = camera_registry();
        registry.register_deployment(
            DeploymentModel::new("camera_deployment_b").with_task("cam", "camera::Driver"),
        );
        let registry = Arc::new(registry);

        let config = SystemConfig::new(registry.clone())
            .with_deployment("h1", "camera_deployment")
            .with_deployment("h2", "camera_deployment_b");
        let mut engine = Engine::new(config);
        engine.add_requirement(InstanceRequirements::new("camera::Driver"));
        let err = engine.resolve(ResolveOptions::default()).unwrap_err();
        match err {
            ResolutionError::MissingDeployments(e) => {
                assert_eq!(e.0.len(), 1);
                assert_eq!(e.0[0].candidates.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }

        let config = SystemConfig::new(registry)
            .with_deployment("h1", "camera_deployment")
            .with_deployment("h2", "camera_deployment_b");
        let mut engine = Engine::new(config);
        let req = engine.add_requirement(
            InstanceRequirements::new("camera::Driver")
                .with_hint(DeploymentHint::NameMatch(Regex::new("deployment_b").unwrap())),
        );
        engine.resolve(ResolveOptions::default()).unwrap();
        let resolved = engine.required_instances()[&req];
        let agent = engine.plan().task(resolved).execution_agent.unwrap();
        let info = engine.plan().task(agent).deployment.as_ref().unwrap();
        assert_eq!(info.process_name, "camera_deployment_b");
    }

    #[test]
    fn device_task_is_linked_to_its_bus() {
        let mut registry = ModelRegistry::new();
        registry.register(ComponentModel::task_context("imu::Driver").with_driver_service("imu"));
        registry.register(ComponentModel::task_context("canbus::Driver"));

        let config = SystemConfig::new(Arc::new(registry))
            .with_device(DeviceDef::new("imu0", "imu").on_bus("can0"))
            .with_bus(BusDef::new("can0", "canbus::Driver"));
        let mut engine = Engine::new(config);
        let req = engine.add_requirement(
            InstanceRequirements::new("imu::Driver").with_selection("imu_dev", "imu0"),
        );
        let options = ResolveOptions {
            compute_deployments: false,
            ..ResolveOptions::default()
        };
        engine.resolve(options).unwrap();

        let sensor = engine.required_instances()[&req];
        let plan = engine.plan();
        let buses = plan.find_local_tasks("canbus::Driver");
        assert_eq!(buses.len(), 1);
        let bus = buses[0];
        assert!(plan.dependency_roles(sensor, bus).is_some());
        assert!(plan.task(bus).attachments.contains(&sensor));
        assert!(plan.has_ordering((bus, EventKind::Start), (sensor, EventKind::Configure)));
    }

    #[test]
    fn all_optional_unresolved_child_is_dropped() {
        let mut registry = camera_registry();
        registry.register(ComponentModel::data_service("log::Service"));
        registry.register(
            ComponentModel::composition("pipeline::Watcher")
                .with_child("camera", "camera::Driver")
                .with_optional_child("logger", "log::Service"),
        );
        let config =
            SystemConfig::new(Arc::new(registry)).with_deployment("h1", "camera_deployment");
        let mut engine = Engine::new(config);
        let req = engine.add_requirement(InstanceRequirements::new("pipeline::Watcher"));
        engine.resolve(ResolveOptions::default()).unwrap();

        let resolved = engine.required_instances()[&req];
        let plan = engine.plan();
        assert!(!plan.task(resolved).is_abstract);
        let children = plan.children(resolved);
        assert_eq!(children.len(), 1);
        assert_eq!(plan.task(children[0]).model.name, "camera::Driver");
    }

    #[test]
    fn conflicting_device_bindings_fail() {
        let mut registry = ModelRegistry::new();
        registry.register(ComponentModel::task_context("lidar::Front").with_driver_service("lidar"));
        registry.register(ComponentModel::task_context("lidar::Rear").with_driver_service("lidar"));

        let config = SystemConfig::new(Arc::new(registry));
        let mut engine = Engine::new(config);
        engine.add_requirement(
            InstanceRequirements::new("lidar::Front").with_selection("lidar_dev", "lid0"),
        );
        engine.add_requirement(
            InstanceRequirements::new("lidar::Rear").with_selection("lidar_dev", "lid0"),
        );
        let options = ResolveOptions {
            compute_deployments: false,
            ..ResolveOptions::default()
        };
        let err = engine.resolve(options).unwrap_err();
        match err {
            ResolutionError::ConflictingDevices(e) => assert_eq!(e.device, "lid0"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn failed_resolution_leaves_the_plan_untouched() {
        let mut registry = ModelRegistry::new();
        registry.register(ComponentModel::task_context("camera::Driver"));
        // No deployments at all: the deployed-network validation fails.
        let config = SystemConfig::new(Arc::new(registry));
        let mut engine = Engine::new(config);
        engine.add_requirement(InstanceRequirements::new("camera::Driver"));
        let before = engine.plan().len();

        let err = engine.resolve(ResolveOptions::default()).unwrap_err();
        assert!(matches!(err, ResolutionError::MissingDeployments(_)));
        assert_eq!(engine.plan().len(), before);
        assert!(engine.required_instances().is_empty());
    }

    #[test]
    fn abstract_network_can_be_computed_then_deployed() {
        let (mut engine, req) = camera_engine();
        let options = ResolveOptions {
            compute_deployments: false,
            ..ResolveOptions::default()
        };
        engine.resolve(options).unwrap();
        let undeployed = engine.required_instances()[&req];
        assert!(engine.plan().task(undeployed).execution_agent.is_none());

        engine.resolve(ResolveOptions::default()).unwrap();
        let deployed = engine.required_instances()[&req];
        let agent = engine.plan().task(deployed).execution_agent.unwrap();
        let info = engine.plan().task(agent).deployment.as_ref().unwrap();
        assert_eq!(info.process_name, "camera_deployment");
        assert_eq!(engine.plan().planned_task(req), Some(deployed));
    }

    #[test]
    fn removing_a_requirement_collects_exactly_its_subgraph() {
        let mut registry = camera_registry();
        registry.register(ComponentModel::task_context("lidar::Driver"));
        registry.register_deployment(
            DeploymentModel::new("lidar_deployment").with_task("lid", "lidar::Driver"),
        );
        let config = SystemConfig::new(Arc::new(registry))
            .with_deployment("h1", "camera_deployment")
            .with_deployment("h1", "lidar_deployment");
        let mut engine = Engine::new(config);
        let cam_req = engine.add_requirement(InstanceRequirements::new("camera::Driver"));
        let lidar_req = engine.add_requirement(InstanceRequirements::new("lidar::Driver"));
        engine.resolve(ResolveOptions::default()).unwrap();

        let cam = engine.required_instances()[&cam_req];
        let lidar = engine.required_instances()[&lidar_req];

        engine.remove_requirement(lidar_req);
        engine.plan_mut().static_garbage_collect(|_, _| {});

        let plan = engine.plan();
        assert!(plan.contains(cam));
        assert!(plan.contains(plan.task(cam).execution_agent.unwrap()));
        assert!(!plan.contains(lidar));
        assert!(plan.find_local_tasks("lidar::Driver").is_empty());
    }

    #[test]
    fn static_port_rewiring_respawns_the_running_task() {
        let mut registry = ModelRegistry::new();
        registry.register(
            ComponentModel::task_context("camera::Driver")
                .with_port(PortModel::output("frame", "Image").static_port()),
        );
        registry.register(
            ComponentModel::task_context("viewer::Color")
                .with_port(PortModel::input("frame", "Image")),
        );
        registry.register(
            ComponentModel::task_context("viewer::Mono")
                .with_port(PortModel::input("frame", "Image")),
        );
        registry.register(
            ComponentModel::composition("pipeline::Color")
                .with_child("camera", "camera::Driver")
                .with_child("viewer", "viewer::Color")
                .with_connection(("camera", "frame"), ("viewer", "frame"), ConnectionPolicy::Data),
        );
        registry.register(
            ComponentModel::composition("pipeline::Mono")
                .with_child("camera", "camera::Driver")
                .with_child("viewer", "viewer::Mono")
                .with_connection(("camera", "frame"), ("viewer", "frame"), ConnectionPolicy::Data),
        );
        registry.register_deployment(
            DeploymentModel::new("camera_deployment").with_task("cam", "camera::Driver"),
        );
        registry.register_deployment(
            DeploymentModel::new("viewer_deployment")
                .with_task("color", "viewer::Color")
                .with_task("mono", "viewer::Mono"),
        );

        let config = SystemConfig::new(Arc::new(registry))
            .with_deployment("h1", "camera_deployment")
            .with_deployment("h1", "viewer_deployment");
        let mut engine = Engine::new(config);
        let color_req = engine.add_requirement(InstanceRequirements::new("pipeline::Color"));
        engine.resolve(ResolveOptions::default()).unwrap();

        let cam_old = engine.plan().find_local_tasks("camera::Driver")[0];
        {
            let plan = engine.plan_mut();
            let agent = plan.task(cam_old).execution_agent.unwrap();
            plan.task_mut(agent).state = ExecState::Running;
            plan.task_mut(cam_old).state = ExecState::Running;
            plan.task_mut(cam_old).setup = true;
        }

        engine.remove_requirement(color_req);
        engine.add_requirement(InstanceRequirements::new("pipeline::Mono"));
        engine.resolve(ResolveOptions::default()).unwrap();

        let plan = engine.plan();
        let cameras = plan.find_local_tasks("camera::Driver");
        assert_eq!(cameras.len(), 2, "old and replacement camera coexist");
        let cam_new = cameras
            .into_iter()
            .find(|&id| id != cam_old)
            .expect("replacement camera");
        assert!(plan.has_ordering(
            (cam_old, EventKind::Stop),
            (cam_new, EventKind::Configure)
        ));
        assert_eq!(
            plan.task(cam_new).execution_agent,
            plan.task(cam_old).execution_agent
        );
        // The replacement feeds the mono viewer.
        let outs = plan.out_connections(cam_new);
        assert_eq!(outs.len(), 1);
        assert_eq!(plan.task(outs[0].0).model.name, "viewer::Mono");
    }

    #[test]
    fn hooks_run_and_hook_failures_abort() {
        let (mut engine, _req) = {
            let config = SystemConfig::new(Arc::new(camera_registry()))
                .with_deployment("h1", "camera_deployment")
                .add_hook(
                    HookStage::SystemNetwork,
                    Hook::new("count-tasks", |plan: &mut Plan| {
                        anyhow::ensure!(!plan.is_empty(), "network is empty");
                        Ok(())
                    }),
                );
            let mut engine = Engine::new(config);
            let req = engine.add_requirement(InstanceRequirements::new("camera::Driver"));
            (engine, req)
        };
        engine.resolve(ResolveOptions::default()).unwrap();

        let config = SystemConfig::new(Arc::new(camera_registry()))
            .with_deployment("h1", "camera_deployment")
            .add_hook(
                HookStage::FinalNetwork,
                Hook::new("always-fails", |_: &mut Plan| anyhow::bail!("boom")),
            );
        let mut engine = Engine::new(config);
        engine.add_requirement(InstanceRequirements::new("camera::Driver"));
        let err = engine.resolve(ResolveOptions::default()).unwrap_err();
        match err {
            ResolutionError::Hook(name, _) => assert_eq!(name, "always-fails"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn save_on_error_dumps_the_staged_plan() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = camino::Utf8Path::from_path(dir.path()).unwrap().to_path_buf();

        let mut registry = ModelRegistry::new();
        registry.register(ComponentModel::task_context("camera::Driver"));
        let config = SystemConfig::new(Arc::new(registry)).with_log_dir(log_dir.clone());
        let mut engine = Engine::new(config);
        engine.add_requirement(InstanceRequirements::new("camera::Driver"));

        let options = ResolveOptions {
            on_error: OnError::Save,
            ..ResolveOptions::default()
        };
        engine.resolve(options).unwrap_err();

        assert!(log_dir.join("rigging-plan-1.dataflow.dot").as_std_path().exists());
        assert!(log_dir.join("rigging-plan-1.hierarchy.dot").as_std_path().exists());
    }

    #[test]
    fn policies_are_computed_over_the_deployed_network() {
        let mut registry = ModelRegistry::new();
        registry.register(
            ComponentModel::task_context("camera::Driver")
                .with_port(PortModel::output("frame", "Image")),
        );
        registry.register(
            ComponentModel::task_context("viewer::Color")
                .with_port(PortModel::input("frame", "Image")),
        );
        registry.register(
            ComponentModel::composition("pipeline::View")
                .with_child("camera", "camera::Driver")
                .with_child("viewer", "viewer::Color")
                .with_connection(
                    ("camera", "frame"),
                    ("viewer", "frame"),
                    ConnectionPolicy::Buffer(8),
                ),
        );
        registry.register_deployment(
            DeploymentModel::new("all_in_one")
                .with_task("cam", "camera::Driver")
                .with_task("view", "viewer::Color"),
        );
        let config = SystemConfig::new(Arc::new(registry)).with_deployment("h1", "all_in_one");
        let mut engine = Engine::new(config);
        engine.add_requirement(InstanceRequirements::new("pipeline::View"));

        // Retain the policy map for inspection.
        let mut config_probe = ResolveOptions::default();
        config_probe.compute_policies = true;
        engine.config.keep_internal_data_structures = true;
        engine.resolve(config_probe).unwrap();

        let policies = engine.connection_policies().expect("policies retained");
        assert_eq!(policies.len(), 1);
        let ((source, sp, sink, dp), policy) = policies.iter().next().unwrap();
        assert_eq!(policy, &ConnectionPolicy::Buffer(8));
        assert_eq!(sp, "frame");
        assert_eq!(dp, "frame");
        let plan = engine.plan();
        assert_eq!(plan.task(*source).model.name, "camera::Driver");
        assert_eq!(plan.task(*sink).model.name, "viewer::Color");
    }
}
