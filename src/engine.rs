// src/engine.rs
//
// =============================================================================
// GRAPHLOOM: ENGINE FACADE
// =============================================================================
//
// The wiring center of the entire architecture.
//
// Responsibilities:
// 1. Build the topology (connections, DAG, jumps) from the declarative
//    project description and validate it.
// 2. Construct one forward and one backward solid per item and hand the
//    pipeline to the step executor on a background runtime thread.
// 3. Run the resource pipeline per filtered forward execution.
// 4. Translate step events into the public event stream, expose stop() and
//    prompt answering.

use crate::connection::Connection;
use crate::core::{
    create_timestamp, inverted, resolve_python_interpreter, AppSettings, EngineInitFailed,
    EngineState, ExecutionDirection, FinishState,
};
use crate::dag::{filter_unneeded_jumps, items_by_jump, validate_jumps, Dag};
use crate::db::SharedDbServerManager;
use crate::event::{
    event_channel, AnsweredPrompts, Event, EventKind, EventReceiver, EventSender, ItemLogger,
    PromptChannel,
};
use crate::filter_config::{ExecutionDescriptor, FilterConfig};
use crate::item::{
    required_items_for_execution, ExecutableItem, ExecutionContext, ItemLock, ItemRegistry,
    ItemSpecification, Specifications,
};
use crate::jump::{ConditionToolRunner, Jump, JumpConditionContext};
use crate::limiter::ProcessLimits;
use crate::pipeline;
use crate::resource::{CmdLineArg, MetadataPatch, Resource};
use crate::scheduler::{
    execute_pipeline, InputDef, JumpSpec, OutputEmitter, PipelineDefinition, SolidCompute,
    SolidDefinition, SolidInputs, SolidOutput, StepEvent, StepFailure,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// ============================================================================
// 1. THE PROJECT DESCRIPTION
// ============================================================================

/// Declarative input the engine is constructed from. Mirrors the on-disk
/// project format of the embedding application.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineRequest {
    #[serde(default)]
    pub items: HashMap<String, Value>,
    #[serde(default)]
    pub specifications: HashMap<String, Vec<Value>>,
    #[serde(default)]
    pub connections: Vec<Value>,
    #[serde(default)]
    pub jumps: Vec<Value>,
    /// Duplicates the connection edges; used for DAG construction when
    /// present so isolated items keep their nodes.
    #[serde(default)]
    pub node_successors: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub execution_permits: HashMap<String, bool>,
    /// Name of the plug-in collection the items come from. Informational:
    /// the registry itself is passed to [`Engine::new`].
    #[serde(default)]
    pub items_module_name: String,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
    #[serde(default)]
    pub project_dir: String,
}

impl EngineRequest {
    pub fn from_value(value: Value) -> Result<Self, EngineInitFailed> {
        serde_json::from_value(value).map_err(|e| EngineInitFailed::BadRequest(e.to_string()))
    }
}

// ============================================================================
// 2. ENGINE INTERNALS
// ============================================================================

struct EngineInner {
    items: HashMap<String, Value>,
    execution_permits: HashMap<String, bool>,
    connections_by_source: HashMap<String, Vec<Arc<Connection>>>,
    connections_by_destination: HashMap<String, Vec<Arc<Connection>>>,
    back_injectors: HashMap<String, Vec<String>>,
    forth_injectors: HashMap<String, Vec<String>>,
    jumps: Vec<Arc<Jump>>,
    item_names: Vec<String>,
    registry: Arc<ItemRegistry>,
    db_server: SharedDbServerManager,
    context: ExecutionContext,
    process_limits: Arc<ProcessLimits>,
    event_tx: EventSender,
    state: Mutex<EngineState>,
    running_items: Mutex<Vec<Arc<dyn ExecutableItem>>>,
    /// Forward/backward resources of the last filtered execution per item;
    /// loop updates replay them into `ExecutableItem::update`.
    resources_per_item: Mutex<HashMap<String, (Vec<Resource>, Vec<Resource>)>>,
    answered_prompts: AnsweredPrompts,
    prompt_senders: Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
    next_prompter_id: AtomicU64,
    timestamp: String,
}

impl EngineInner {
    fn state(&self) -> EngineState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap() = state;
    }

    fn permitted(&self, item_name: &str) -> bool {
        self.execution_permits
            .get(item_name)
            .copied()
            .unwrap_or(false)
    }

    fn settings(&self) -> &AppSettings {
        &self.context.settings
    }

    /// Recreates an item for a particular execution. Called multiple times
    /// per item: once for the backward sweep, once per filtered forward run
    /// and once per loop update.
    fn make_item(
        &self,
        item_name: &str,
        direction: ExecutionDirection,
    ) -> Result<(Arc<dyn ExecutableItem>, ItemLogger), StepFailure> {
        let item_dict = self
            .items
            .get(item_name)
            .ok_or_else(|| StepFailure::new(format!("unknown item '{item_name}'")))?;
        let item_type = item_dict
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| StepFailure::new(format!("item '{item_name}' has no type")))?;
        let factory = self
            .registry
            .factory(item_type)
            .ok_or_else(|| StepFailure::new(format!("unknown item type '{item_type}'")))?;
        let prompter_id = self.next_prompter_id.fetch_add(1, Ordering::SeqCst);
        let (channel, sender) = PromptChannel::new(prompter_id);
        self.prompt_senders
            .lock()
            .unwrap()
            .insert(prompter_id, sender);
        let logger = ItemLogger::new(
            self.event_tx.clone(),
            item_name,
            Some(channel),
            self.answered_prompts.clone(),
            direction == ExecutionDirection::Backward,
        );
        let item = factory
            .make(item_name, item_dict, &self.context, logger.clone())
            .map_err(|e| StepFailure::new(format!("creating item '{item_name}' failed: {e}")))?;
        Ok((Arc::from(item), logger))
    }

    // --- The resource pipeline ---

    /// Filter stacks for one resource: the cross-product of the online
    /// filter configs the traversed connection exposes for it.
    fn filter_stacks(
        &self,
        item_name: &str,
        provider_name: &str,
        resource_label: &str,
    ) -> Result<Vec<Vec<FilterConfig>>, StepFailure> {
        let connection = self
            .connections_by_destination
            .get(item_name)
            .into_iter()
            .flatten()
            .find(|c| c.source == provider_name)
            .ok_or_else(|| StepFailure::new("logic error: no connection from resource provider"))?;
        match connection.enabled_filter_configs(resource_label) {
            None => Ok(Vec::new()),
            Some(config_lists) => Ok(pipeline::filter_stacks_product(&config_lists)),
        }
    }

    /// Applies backward conversions on every resource coming from this
    /// item's successors: purge, write ordering, memory-DB flags.
    fn convert_backward_resources(
        &self,
        item_name: &str,
        resources: Vec<Resource>,
    ) -> Result<Vec<Resource>, StepFailure> {
        let mut by_provider: BTreeMap<String, Vec<Resource>> = BTreeMap::new();
        for resource in resources {
            by_provider
                .entry(resource.provider_name.clone())
                .or_default()
                .push(resource);
        }
        for connection in self
            .connections_by_source
            .get(item_name)
            .into_iter()
            .flatten()
        {
            let Some(from_destination) = by_provider.get(&connection.destination) else {
                continue;
            };
            if self.permitted(item_name) {
                connection
                    .clean_up_backward_resources(from_destination)
                    .map_err(|e| StepFailure::new(e.to_string()))?;
            }
            let siblings: Vec<(String, i32)> = self
                .connections_by_destination
                .get(&connection.destination)
                .into_iter()
                .flatten()
                .filter(|sibling| !Arc::ptr_eq(sibling, connection))
                .map(|sibling| (sibling.name(), sibling.options.write_index))
                .collect();
            let converted = connection.convert_backward_resources(from_destination, &siblings);
            by_provider.insert(connection.destination.clone(), converted);
        }
        Ok(by_provider.into_values().flatten().collect())
    }

    /// Applies forward conversions on every resource coming from this item's
    /// predecessors: datapackage collapse, memory-DB flags.
    fn convert_forward_resources(
        &self,
        item_name: &str,
        resources: &[Resource],
    ) -> Result<Vec<Resource>, StepFailure> {
        let mut by_provider: BTreeMap<String, Vec<Resource>> = BTreeMap::new();
        for resource in resources {
            by_provider
                .entry(resource.provider_name.clone())
                .or_default()
                .push(resource.clone());
        }
        for connection in self
            .connections_by_destination
            .get(item_name)
            .into_iter()
            .flatten()
        {
            let Some(from_source) = by_provider.get(&connection.source) else {
                continue;
            };
            let converted = connection
                .convert_forward_resources(from_source)
                .map_err(|e| StepFailure::new(e.to_string()))?;
            by_provider.insert(connection.source.clone(), converted);
        }
        Ok(by_provider.into_values().flatten().collect())
    }

    /// Builds the filtered input combinations of one forward execution: the
    /// cross-product of the expanded forward resources, each combination
    /// paired with execution-filtered backward resources and a filter id.
    fn filtered_resource_combinations(
        &self,
        item_name: &str,
        forward_stacks: &[Vec<Resource>],
        backward_resources: Vec<Resource>,
    ) -> Result<Vec<(Vec<Resource>, Vec<Resource>, String)>, StepFailure> {
        let mut resource_filter_stacks: Vec<(Resource, Vec<Vec<FilterConfig>>)> = Vec::new();
        let mut unfiltered_lists: pipeline::UnfilteredLists = BTreeMap::new();
        for stack in forward_stacks {
            if stack.is_empty() {
                continue;
            }
            let mut unfiltered = Vec::new();
            for resource in stack {
                let stacks =
                    self.filter_stacks(item_name, &resource.provider_name, &resource.label)?;
                if stacks.is_empty() {
                    unfiltered.push(resource.clone());
                } else {
                    resource_filter_stacks.push((resource.clone(), stacks));
                }
            }
            if !unfiltered.is_empty() {
                unfiltered_lists
                    .entry(stack[0].provider_name.clone())
                    .or_default()
                    .push(unfiltered);
            }
        }
        let backward_resources = self.convert_backward_resources(item_name, backward_resources)?;
        let mut axes: Vec<pipeline::ProductAxis> = Vec::new();
        for lists in unfiltered_lists.values() {
            axes.push(lists.clone());
        }
        for (resource, stacks) in &resource_filter_stacks {
            let expanded = pipeline::expand_resource_stack(resource, stacks);
            axes.push(expanded.into_iter().map(|r| vec![r]).collect());
        }
        let mut combinations = Vec::new();
        for combination in pipeline::cross_product(&axes) {
            if !pipeline::check_resource_affinity(&combination) {
                continue;
            }
            let converted = self.convert_forward_resources(item_name, &combination)?;
            let resource_stacks: Vec<(Resource, Vec<FilterConfig>)> = converted
                .iter()
                .map(|r| (r.clone(), r.metadata.filter_stack.clone()))
                .collect();
            let scenarios =
                pipeline::scenario_names_from_stacks(resource_stacks.iter().map(|(_, s)| s));
            let execution_config = FilterConfig::execution(ExecutionDescriptor {
                execution_item: item_name.to_string(),
                scenarios,
                timestamp: self.timestamp.clone(),
            });
            let mut filtered_backward = Vec::new();
            for resource in &backward_resources {
                if let Some(part_count) = &resource.metadata.part_count {
                    part_count.increment();
                }
                let mut clone = resource.clone_with(MetadataPatch {
                    filter_stack: Some(vec![execution_config.clone()]),
                    ..Default::default()
                });
                clone.apply_filter_config(&execution_config);
                filtered_backward.push(clone);
            }
            let filter_id = pipeline::make_filter_id(&resource_stacks);
            combinations.push((converted, filtered_backward, filter_id));
        }
        Ok(combinations)
    }

    // --- Item execution ---

    async fn execute_item(
        self: &Arc<Self>,
        item_name: &str,
        forward_stacks: Vec<Vec<Resource>>,
        backward_resources: Vec<Resource>,
    ) -> Result<(FinishState, Vec<Vec<Resource>>), StepFailure> {
        let (probe, _logger) = self.make_item(item_name, ExecutionDirection::None)?;
        if !probe.ready_to_execute(self.settings()) {
            if !self.permitted(item_name) {
                return Ok((FinishState::Excluded, Vec::new()));
            }
            return Ok((FinishState::Failure, Vec::new()));
        }
        let combinations =
            self.filtered_resource_combinations(item_name, &forward_stacks, backward_resources)?;
        let item_lock: ItemLock = Arc::new(tokio::sync::Mutex::new(()));
        let output_list: Arc<Mutex<Vec<Vec<Resource>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for (filtered_forward, filtered_backward, filter_id) in combinations {
            self.resources_per_item.lock().unwrap().insert(
                item_name.to_string(),
                (filtered_forward.clone(), filtered_backward.clone()),
            );
            let (item, logger) = self.make_item(item_name, ExecutionDirection::Forward)?;
            logger.set_filter_id(&filter_id);
            item.set_filter_id(&filter_id);
            let inner = self.clone();
            let lock = item_lock.clone();
            let outputs = output_list.clone();
            tasks.push(tokio::spawn(async move {
                inner
                    .execute_item_filtered(
                        item,
                        filtered_forward,
                        filtered_backward,
                        filter_id,
                        outputs,
                        lock,
                    )
                    .await
            }));
        }
        let mut states = Vec::new();
        for task in tasks {
            match task.await {
                Ok(state) => states.push(state),
                Err(e) => {
                    return Err(StepFailure::new(format!(
                        "filtered execution of '{item_name}' crashed: {e}"
                    )))
                }
            }
        }
        if states.contains(&FinishState::Failure) {
            return Err(StepFailure::new(format!("executing '{item_name}' failed")));
        }
        let output_list = std::mem::take(&mut *output_list.lock().unwrap());
        for resources in &output_list {
            for connection in self
                .connections_by_source
                .get(item_name)
                .into_iter()
                .flatten()
            {
                connection.receive_resources_from_source(resources);
            }
        }
        let state = states.last().copied().unwrap_or(FinishState::NeverFinished);
        Ok((state, output_list))
    }

    /// One filtered execution. Runs on its own task; failures are funnelled
    /// back through the returned state.
    async fn execute_item_filtered(
        self: Arc<Self>,
        item: Arc<dyn ExecutableItem>,
        filtered_forward: Vec<Resource>,
        filtered_backward: Vec<Resource>,
        filter_id: String,
        output_list: Arc<Mutex<Vec<Vec<Resource>>>>,
        item_lock: ItemLock,
    ) -> FinishState {
        self.running_items.lock().unwrap().push(item.clone());
        let state = if self.permitted(item.name()) {
            let state = item
                .execute(&filtered_forward, &filtered_backward, item_lock)
                .await;
            item.finish_execution(state);
            state
        } else {
            item.exclude_execution(&filtered_forward, &filtered_backward, item_lock)
                .await;
            FinishState::Excluded
        };
        // Outbound resources inherit the concatenation of the distinct
        // inbound stacks plus this run's filter id.
        let mut unique_stacks: Vec<Vec<FilterConfig>> = Vec::new();
        for resource in &filtered_forward {
            let stack = &resource.metadata.filter_stack;
            if !unique_stacks.contains(stack) {
                unique_stacks.push(stack.clone());
            }
        }
        let combined_stack: Vec<FilterConfig> = unique_stacks.into_iter().flatten().collect();
        let mut output_resources = item.output_resources(ExecutionDirection::Forward);
        for resource in &mut output_resources {
            resource.metadata.filter_stack = combined_stack.clone();
            resource.metadata.filter_id = Some(filter_id.clone());
            resource.metadata.db_server = Some(self.db_server.clone());
        }
        output_list.lock().unwrap().push(output_resources);
        let mut running = self.running_items.lock().unwrap();
        if let Some(position) = running.iter().position(|other| Arc::ptr_eq(other, &item)) {
            running.remove(position);
        }
        state
    }

    /// Replays the latest resources into each loop item's update hook before
    /// the next iteration.
    fn update_loop_items(&self, item_names: &BTreeSet<String>) {
        for item_name in item_names {
            let Ok((item, _logger)) = self.make_item(item_name, ExecutionDirection::None) else {
                continue;
            };
            let snapshot = self
                .resources_per_item
                .lock()
                .unwrap()
                .get(item_name)
                .cloned();
            let (forward, backward) = snapshot.unwrap_or_default();
            item.update(&forward, &backward);
        }
    }

    // --- Event translation ---

    fn process_step_event(&self, event: &StepEvent) {
        match event {
            StepEvent::Start { key } => {
                let _ = self.event_tx.send(Event::new(
                    EventKind::ExecStarted,
                    json!({ "item_name": key.0, "direction": key.1 }),
                ));
            }
            StepEvent::Failure { key, error } => {
                if self.state() != EngineState::UserStopped {
                    self.set_state(EngineState::Failed);
                }
                log::debug!("solid {} ({}) failed: {error}", key.0, key.1);
                let _ = self.event_tx.send(Event::new(
                    EventKind::ExecFinished,
                    json!({
                        "item_name": key.0,
                        "direction": key.1,
                        "item_state": FinishState::Failure,
                    }),
                ));
            }
            StepEvent::Finish { key, state } => {
                let _ = self.event_tx.send(Event::new(
                    EventKind::ExecFinished,
                    json!({ "item_name": key.0, "direction": key.1, "item_state": state }),
                ));
            }
            StepEvent::Output { .. } => {}
        }
    }

    // --- The run loop ---

    fn make_pipeline(self: &Arc<Self>) -> PipelineDefinition {
        let mut solids = Vec::new();
        for item_name in &self.item_names {
            let mut input_defs: Vec<InputDef> = self
                .forth_injectors
                .get(item_name)
                .into_iter()
                .flatten()
                .map(|injector| InputDef {
                    item_name: injector.clone(),
                    direction: ExecutionDirection::Forward,
                })
                .collect();
            input_defs.extend(
                self.back_injectors
                    .get(item_name)
                    .into_iter()
                    .flatten()
                    .map(|injector| InputDef {
                        item_name: injector.clone(),
                        direction: ExecutionDirection::Backward,
                    }),
            );
            solids.push(SolidDefinition {
                item_name: item_name.clone(),
                direction: ExecutionDirection::Forward,
                input_defs,
                compute: Arc::new(ForwardCompute {
                    inner: self.clone(),
                    item_name: item_name.clone(),
                }),
            });
            solids.push(SolidDefinition {
                item_name: item_name.clone(),
                direction: ExecutionDirection::Backward,
                input_defs: Vec::new(),
                compute: Arc::new(BackwardCompute {
                    inner: self.clone(),
                    item_name: item_name.clone(),
                }),
            });
        }
        let jumps = self
            .jumps
            .iter()
            .map(|jump| JumpSpec {
                source: jump.source.clone(),
                destination: jump.destination.clone(),
                item_names: jump.item_names.clone(),
            })
            .collect();
        PipelineDefinition {
            solids,
            jumps,
            max_concurrent: None,
        }
    }

    async fn run(self: Arc<Self>) {
        self.set_state(EngineState::Running);
        let pipeline = self.make_pipeline();
        let (step_tx, mut step_rx) = mpsc::unbounded_channel();
        let controller: Arc<dyn crate::scheduler::LoopController> = self.clone();
        let executor = tokio::spawn(execute_pipeline(pipeline, step_tx, controller));
        while let Some(event) = step_rx.recv().await {
            self.process_step_event(&event);
        }
        match executor.await {
            Ok(Ok(())) => {}
            Ok(Err(composite)) => {
                if self.state() != EngineState::UserStopped {
                    self.set_state(EngineState::Failed);
                }
                log::error!("{composite}");
                let _ = self.event_tx.send(Event::new(
                    EventKind::EventMsg,
                    json!({
                        "item_name": "",
                        "filter_id": "",
                        "msg_type": "msg_error",
                        "msg_text": composite.to_string(),
                    }),
                ));
            }
            Err(join_error) => {
                if self.state() != EngineState::UserStopped {
                    self.set_state(EngineState::Failed);
                }
                log::error!("executor crashed: {join_error}");
            }
        }
        if self.state() == EngineState::Running {
            self.set_state(EngineState::Completed);
        }
        let _ = self.event_tx.send(Event::new(
            EventKind::DagExecFinished,
            json!(self.state().to_string()),
        ));
    }
}

#[async_trait]
impl crate::scheduler::LoopController for EngineInner {
    async fn is_jump_condition_true(
        &self,
        jump_index: usize,
        iteration_counter: u32,
        forward_resources: Vec<Resource>,
        backward_resources: Vec<Resource>,
    ) -> bool {
        let jump = &self.jumps[jump_index];
        jump.receive_resources_from_source(forward_resources);
        jump.receive_resources_from_destination(backward_resources);
        let context = JumpConditionContext {
            interpreter: resolve_python_interpreter(self.settings()),
            tool_runner: self,
        };
        let iterate = jump.is_condition_true(iteration_counter, &context).await;
        if iterate {
            jump.emit_flash();
            self.update_loop_items(&jump.item_names);
        }
        iterate
    }
}

#[async_trait]
impl ConditionToolRunner for EngineInner {
    async fn execute_condition_tool(
        &self,
        jump_name: &str,
        specification: &str,
        cmd_line_args: Vec<CmdLineArg>,
        forward_resources: &[Resource],
        backward_resources: &[Resource],
    ) -> FinishState {
        let serialized_args: Vec<Value> = cmd_line_args
            .iter()
            .map(|arg| serde_json::to_value(arg).unwrap_or(Value::Null))
            .collect();
        let item_dict = json!({
            "type": "Tool",
            "execute_in_work": false,
            "specification": specification,
            "cmd_line_args": serialized_args,
        });
        let Some(factory) = self.registry.factory("Tool") else {
            log::warn!("no Tool factory registered; loop condition of {jump_name} fails");
            return FinishState::Failure;
        };
        let logger = ItemLogger::new(
            self.event_tx.clone(),
            jump_name,
            None,
            self.answered_prompts.clone(),
            false,
        );
        let item = match factory.make(jump_name, &item_dict, &self.context, logger) {
            Ok(item) => item,
            Err(e) => {
                log::warn!("creating condition tool for {jump_name} failed: {e}");
                return FinishState::Failure;
            }
        };
        item.execute(
            forward_resources,
            backward_resources,
            Arc::new(tokio::sync::Mutex::new(())),
        )
        .await
    }
}

struct ForwardCompute {
    inner: Arc<EngineInner>,
    item_name: String,
}

#[async_trait]
impl SolidCompute for ForwardCompute {
    async fn compute(
        &self,
        inputs: SolidInputs,
        output: OutputEmitter,
    ) -> Result<FinishState, StepFailure> {
        let inner = &self.inner;
        if inner.state() == EngineState::UserStopped {
            return Err(StepFailure::new("execution stopped by user"));
        }
        for connection in inner
            .connections_by_destination
            .get(&self.item_name)
            .into_iter()
            .flatten()
        {
            connection.visit_destination();
        }
        let forward_stacks = pipeline::assemble_forward_stacks(&inputs.forward_stacks);
        let (state, output_stacks) = inner
            .execute_item(&self.item_name, forward_stacks, inputs.backward_resources)
            .await?;
        if !output_stacks.is_empty() {
            output.emit(SolidOutput::Stacks(output_stacks));
        }
        for connection in inner
            .connections_by_source
            .get(&self.item_name)
            .into_iter()
            .flatten()
        {
            connection.visit_source();
        }
        Ok(state)
    }
}

struct BackwardCompute {
    inner: Arc<EngineInner>,
    item_name: String,
}

#[async_trait]
impl SolidCompute for BackwardCompute {
    async fn compute(
        &self,
        _inputs: SolidInputs,
        output: OutputEmitter,
    ) -> Result<FinishState, StepFailure> {
        let inner = &self.inner;
        if inner.state() == EngineState::UserStopped {
            return Err(StepFailure::new("execution stopped by user"));
        }
        let (item, _logger) = inner.make_item(&self.item_name, ExecutionDirection::Backward)?;
        let mut resources = item.output_resources(ExecutionDirection::Backward);
        for resource in &mut resources {
            resource.metadata.db_server = Some(inner.db_server.clone());
        }
        output.emit(SolidOutput::Resources(resources));
        Ok(if inner.permitted(&self.item_name) {
            FinishState::Success
        } else {
            FinishState::Excluded
        })
    }
}

// ============================================================================
// 3. THE FACADE
// ============================================================================

/// An engine for executing one DAG-shaped workflow.
///
/// Construction validates the whole topology synchronously; execution starts
/// lazily on a background runtime thread when the first event is pulled.
pub struct Engine {
    inner: Arc<EngineInner>,
    events: Mutex<EventReceiver>,
    started: AtomicBool,
    finished: AtomicBool,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Engine {
    /// Builds the engine from a project description, an item registry and
    /// the database collaborator.
    pub fn new(
        request: EngineRequest,
        registry: Arc<ItemRegistry>,
        db_server: SharedDbServerManager,
    ) -> Result<Self, EngineInitFailed> {
        let mut connections = Vec::with_capacity(request.connections.len());
        for dict in &request.connections {
            let connection = Connection::from_dict(dict)
                .map_err(|e| EngineInitFailed::BadRequest(e.to_string()))?;
            connections.push(connection);
        }
        let required_items = required_items_for_execution(
            &request.items,
            &connections,
            &registry,
            &request.execution_permits,
        );
        connections.retain(|c| {
            required_items.contains(&c.source) && required_items.contains(&c.destination)
        });
        for connection in &connections {
            if !connection.ready_to_execute() {
                return Err(EngineInitFailed::ConnectionNotReady {
                    name: connection.name(),
                    notifications: connection.notifications().join(" "),
                });
            }
        }
        let back_injectors = dag_edges(&connections);
        check_write_index(&connections)?;
        let settings = AppSettings::new(request.settings.clone());
        let process_limits = Arc::new(ProcessLimits::default());
        process_limits.configure(&settings);
        process_limits.enable_persistent_process_creation();
        let specifications = make_item_specifications(&request, &registry, &settings);
        let dag_successors = if request.node_successors.is_empty() {
            back_injectors.clone()
        } else {
            let mut filtered: HashMap<String, Vec<String>> = HashMap::new();
            for (name, successors) in &request.node_successors {
                if !required_items.contains(name) {
                    continue;
                }
                let kept: Vec<String> = successors
                    .iter()
                    .filter(|s| required_items.contains(*s))
                    .cloned()
                    .collect();
                filtered.insert(name.clone(), kept);
            }
            filtered
        };
        let dag = Dag::from_successors(required_items.iter().cloned(), &dag_successors);
        dag.validate()?;
        let item_names = dag.node_names();
        let mut jumps = Vec::with_capacity(request.jumps.len());
        for dict in &request.jumps {
            let jump =
                Jump::from_dict(dict).map_err(|e| EngineInitFailed::BadRequest(e.to_string()))?;
            jumps.push(jump);
        }
        let bodies = items_by_jump(&jumps, &dag);
        let (mut jumps, bodies) =
            filter_unneeded_jumps(jumps, bodies, &request.execution_permits);
        validate_jumps(&jumps, &bodies, &dag)?;
        let (event_tx, event_rx) = event_channel();
        let answered_prompts: AnsweredPrompts = Arc::new(Mutex::new(HashMap::new()));
        for (jump, body) in jumps.iter_mut().zip(&bodies) {
            let mut item_names: BTreeSet<String> =
                [jump.source.clone(), jump.destination.clone()].into();
            item_names.extend(body.iter().cloned());
            jump.item_names = item_names;
            jump.make_logger(ItemLogger::new(
                event_tx.clone(),
                jump.name(),
                None,
                answered_prompts.clone(),
                false,
            ));
        }
        let mut prepared_connections = Vec::with_capacity(connections.len());
        for mut connection in connections {
            connection.prepare(
                ItemLogger::new(
                    event_tx.clone(),
                    connection.name(),
                    None,
                    answered_prompts.clone(),
                    false,
                ),
                db_server.clone(),
            );
            prepared_connections.push(Arc::new(connection));
        }
        let mut connections_by_source: HashMap<String, Vec<Arc<Connection>>> = HashMap::new();
        let mut connections_by_destination: HashMap<String, Vec<Arc<Connection>>> = HashMap::new();
        for connection in &prepared_connections {
            connections_by_source
                .entry(connection.source.clone())
                .or_default()
                .push(connection.clone());
            connections_by_destination
                .entry(connection.destination.clone())
                .or_default()
                .push(connection.clone());
        }
        let forth_injectors = inverted(&back_injectors);
        let context = ExecutionContext {
            project_dir: PathBuf::from(&request.project_dir),
            settings: settings.clone(),
            specifications,
            process_limits: process_limits.clone(),
            db_server: db_server.clone(),
        };
        let inner = Arc::new(EngineInner {
            items: request.items,
            execution_permits: request.execution_permits,
            connections_by_source,
            connections_by_destination,
            back_injectors,
            forth_injectors,
            jumps: jumps.into_iter().map(Arc::new).collect(),
            item_names,
            registry,
            db_server,
            context,
            process_limits,
            event_tx,
            state: Mutex::new(EngineState::Sleeping),
            running_items: Mutex::new(Vec::new()),
            resources_per_item: Mutex::new(HashMap::new()),
            answered_prompts,
            prompt_senders: Mutex::new(HashMap::new()),
            next_prompter_id: AtomicU64::new(1),
            timestamp: create_timestamp(),
        });
        Ok(Self {
            inner,
            events: Mutex::new(event_rx),
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    fn ensure_started(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let handle = std::thread::spawn(move || match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime.block_on(inner.run()),
            Err(e) => {
                log::error!("starting engine runtime failed: {e}");
                inner.set_state(EngineState::Failed);
                let _ = inner.event_tx.send(Event::new(
                    EventKind::DagExecFinished,
                    json!(inner.state().to_string()),
                ));
            }
        });
        *self.thread.lock().unwrap() = Some(handle);
    }

    /// Blocks until the next event. Returns `None` once the final
    /// `dag_exec_finished` event has been delivered.
    pub fn get_event(&self) -> Option<(EventKind, Value)> {
        if self.finished.load(Ordering::SeqCst) {
            return None;
        }
        self.ensure_started();
        let event = self.events.lock().unwrap().blocking_recv()?;
        if event.kind == EventKind::DagExecFinished {
            self.finished.store(true, Ordering::SeqCst);
        }
        Some((event.kind, event.payload))
    }

    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// Cooperative stop: running items are told to stop, new persistent
    /// processes are disabled, and the final event is posted.
    pub fn stop(&self) {
        self.inner.set_state(EngineState::UserStopped);
        self.inner
            .process_limits
            .disable_persistent_process_creation();
        let running: Vec<Arc<dyn ExecutableItem>> =
            self.inner.running_items.lock().unwrap().clone();
        for item in running {
            item.stop_execution();
            let _ = self.inner.event_tx.send(Event::new(
                EventKind::ExecFinished,
                json!({
                    "item_name": item.name(),
                    "direction": ExecutionDirection::Forward,
                    "item_state": FinishState::Stopped,
                }),
            ));
        }
        let _ = self.inner.event_tx.send(Event::new(
            EventKind::DagExecFinished,
            json!(self.inner.state().to_string()),
        ));
    }

    /// Delivers the caller's answer to a waiting prompt.
    pub fn answer_prompt(&self, prompter_id: u64, answer: &str) {
        let senders = self.inner.prompt_senders.lock().unwrap();
        match senders.get(&prompter_id) {
            Some(sender) => {
                let _ = sender.send(answer.to_string());
            }
            None => log::warn!("no prompter with id {prompter_id}"),
        }
    }

    /// Waits until the background run has finished.
    pub fn wait(&self) {
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// 4. TOPOLOGY HELPERS
// ============================================================================

/// Successor edges derived from connections: source item to destinations.
fn dag_edges(connections: &[Connection]) -> HashMap<String, Vec<String>> {
    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    for connection in connections {
        edges
            .entry(connection.source.clone())
            .or_default()
            .push(connection.destination.clone());
    }
    edges
}

fn make_item_specifications(
    request: &EngineRequest,
    registry: &ItemRegistry,
    settings: &AppSettings,
) -> Specifications {
    let mut specifications: Specifications = HashMap::new();
    for (item_type, spec_dicts) in &request.specifications {
        let Some(factory) = registry.factory(item_type) else {
            continue;
        };
        let by_name: &mut HashMap<String, ItemSpecification> =
            specifications.entry(item_type.clone()).or_default();
        for spec_dict in spec_dicts {
            match factory.make_specification(spec_dict, settings) {
                Ok(specification) => {
                    by_name.insert(specification.name.clone(), specification);
                }
                Err(e) => log::warn!("skipping bad {item_type} specification: {e}"),
            }
        }
    }
    specifications
}

/// Rejects topologies in which an item would have to wait for one of its own
/// descendants to write first: for each connection, any sibling writing to
/// the same destination with a smaller write index must not originate from a
/// descendant of the connection's source.
fn check_write_index(connections: &[Connection]) -> Result<(), EngineInitFailed> {
    let mut by_source: HashMap<&str, Vec<&Connection>> = HashMap::new();
    let mut by_destination: HashMap<&str, Vec<&Connection>> = HashMap::new();
    for connection in connections {
        by_source
            .entry(connection.source.as_str())
            .or_default()
            .push(connection);
        by_destination
            .entry(connection.destination.as_str())
            .or_default()
            .push(connection);
    }
    fn descendants<'a>(
        item: &str,
        by_source: &HashMap<&str, Vec<&'a Connection>>,
        collected: &mut BTreeSet<&'a str>,
    ) {
        for connection in by_source.get(item).into_iter().flatten() {
            if collected.insert(connection.destination.as_str()) {
                descendants(&connection.destination, by_source, collected);
            }
        }
    }
    let mut rows = Vec::new();
    let mut sources: Vec<&str> = by_source.keys().copied().collect();
    sources.sort_unstable();
    for item_name in sources {
        let mut item_descendants = BTreeSet::new();
        descendants(item_name, &by_source, &mut item_descendants);
        let mut conflicting = Vec::new();
        for connection in by_source.get(item_name).into_iter().flatten() {
            for sibling in by_destination
                .get(connection.destination.as_str())
                .into_iter()
                .flatten()
            {
                if std::ptr::eq(*sibling, *connection) {
                    continue;
                }
                if sibling.options.write_index < connection.options.write_index
                    && item_descendants.contains(sibling.source.as_str())
                {
                    conflicting.push(format!(
                        "{}, but {} is set to write earlier to {}",
                        sibling.source, sibling.source, sibling.destination
                    ));
                }
            }
        }
        if !conflicting.is_empty() {
            rows.push(format!(
                "Item {} cannot execute because it is a dependency to {}",
                item_name,
                conflicting.join(", ")
            ));
        }
    }
    if rows.is_empty() {
        Ok(())
    } else {
        Err(EngineInitFailed::WriteIndexConflict(rows.join("\n")))
    }
}
