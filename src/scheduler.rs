// src/scheduler.rs
//
// =============================================================================
// GRAPHLOOM: STEP EXECUTOR
// =============================================================================
//
// The pipeline engine.
//
// Responsibilities:
// 1. Schedule solids (one forward + one backward unit per project item) on a
//    bounded pool of tokio tasks, honoring edge dependencies.
// 2. Drain each running solid's event channel on a short tick and forward
//    the events to the engine.
// 3. Gate forward solids behind unfinished loops that feed them.
// 4. Re-queue loop bodies when a jump condition holds, serialising re-entry
//    so one iteration finishes before the next begins.
// 5. Collect task crashes and aggregate them into one composite error.

use crate::core::{ExecutionDirection, FinishState};
use crate::resource::Resource;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// The minimum interval at which to poll solid event channels.
const TICK: Duration = Duration::from_millis(20);

const DEFAULT_MAX_CONCURRENT: usize = 100;

// ============================================================================
// 1. SOLIDS
// ============================================================================

/// Unique id of a solid: item name plus sweep direction.
pub type SolidKey = (String, ExecutionDirection);

/// One input slot of a solid, fed by the output of the named solid.
#[derive(Debug, Clone)]
pub struct InputDef {
    pub item_name: String,
    pub direction: ExecutionDirection,
}

impl InputDef {
    pub fn key(&self) -> SolidKey {
        (self.item_name.clone(), self.direction)
    }
}

/// What a solid emits: forward solids produce one resource list per filtered
/// run, backward solids a single resource list.
#[derive(Debug, Clone)]
pub enum SolidOutput {
    Stacks(Vec<Vec<Resource>>),
    Resources(Vec<Resource>),
}

/// Inputs assembled for one solid execution.
#[derive(Debug, Default)]
pub struct SolidInputs {
    /// One stack per filtered run of each predecessor.
    pub forward_stacks: Vec<Vec<Resource>>,
    /// One resource list per successor.
    pub backward_resources: Vec<Resource>,
}

/// Failure raised by a solid's compute function.
#[derive(Debug)]
pub struct StepFailure {
    pub message: String,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Output channel handed to a running compute function.
pub struct OutputEmitter {
    key: SolidKey,
    sender: mpsc::UnboundedSender<StepEvent>,
}

impl OutputEmitter {
    pub fn emit(&self, value: SolidOutput) {
        let _ = self.sender.send(StepEvent::Output {
            key: self.key.clone(),
            value,
        });
    }
}

/// The work of one solid. Implementations live in the engine facade.
#[async_trait]
pub trait SolidCompute: Send + Sync {
    async fn compute(
        &self,
        inputs: SolidInputs,
        output: OutputEmitter,
    ) -> Result<FinishState, StepFailure>;
}

pub struct SolidDefinition {
    pub item_name: String,
    pub direction: ExecutionDirection,
    pub input_defs: Vec<InputDef>,
    pub compute: Arc<dyn SolidCompute>,
}

impl SolidDefinition {
    pub fn key(&self) -> SolidKey {
        (self.item_name.clone(), self.direction)
    }
}

/// Events produced by running solids, in production order per solid.
#[derive(Debug, Clone)]
pub enum StepEvent {
    Start {
        key: SolidKey,
    },
    Output {
        key: SolidKey,
        value: SolidOutput,
    },
    Finish {
        key: SolidKey,
        state: FinishState,
    },
    Failure {
        key: SolidKey,
        error: String,
    },
}

impl StepEvent {
    pub fn key(&self) -> &SolidKey {
        match self {
            StepEvent::Start { key }
            | StepEvent::Output { key, .. }
            | StepEvent::Finish { key, .. }
            | StepEvent::Failure { key, .. } => key,
        }
    }
}

// ============================================================================
// 2. JUMP SPECS & LOOP CONTROL
// ============================================================================

/// The scheduler's view of a jump: endpoints plus the closed loop body.
#[derive(Debug, Clone)]
pub struct JumpSpec {
    pub source: String,
    pub destination: String,
    pub item_names: BTreeSet<String>,
}

/// Evaluates loop conditions. Implemented by the engine, which owns the
/// actual jump objects and their collaborators.
#[async_trait]
pub trait LoopController: Send + Sync {
    async fn is_jump_condition_true(
        &self,
        jump_index: usize,
        iteration_counter: u32,
        forward_resources: Vec<Resource>,
        backward_resources: Vec<Resource>,
    ) -> bool;
}

pub struct PipelineDefinition {
    pub solids: Vec<SolidDefinition>,
    pub jumps: Vec<JumpSpec>,
    pub max_concurrent: Option<usize>,
}

/// Aggregate of every execution-task crash observed during a run.
#[derive(Debug, Error)]
#[error("errors occurred in execution tasks:\n{}", .errors.join("\n"))]
pub struct ExecutorError {
    pub errors: Vec<String>,
}

// ============================================================================
// 3. STEPS
// ============================================================================

struct Step {
    def: Arc<SolidDefinition>,
    inputs: HashMap<SolidKey, SolidOutput>,
    ready_once: bool,
}

impl Step {
    fn new(def: Arc<SolidDefinition>) -> Self {
        Self {
            def,
            inputs: HashMap::new(),
            ready_once: false,
        }
    }

    /// A step becomes ready exactly once, when every input slot is filled.
    fn check_ready(&mut self) -> bool {
        if self.ready_once {
            return false;
        }
        self.ready_once = self.def.input_defs.len() == self.inputs.len();
        self.ready_once
    }

    fn dependency_keys(&self) -> HashSet<SolidKey> {
        self.def.input_defs.iter().map(InputDef::key).collect()
    }

    fn assemble_inputs(&self) -> SolidInputs {
        let mut inputs = SolidInputs::default();
        for input_def in &self.def.input_defs {
            match self.inputs.get(&input_def.key()) {
                Some(SolidOutput::Stacks(stacks)) => {
                    inputs.forward_stacks.extend(stacks.iter().cloned());
                }
                Some(SolidOutput::Resources(resources)) => {
                    inputs.backward_resources.extend(resources.iter().cloned());
                }
                None => {}
            }
        }
        inputs
    }
}

// ============================================================================
// 4. THE EXECUTOR
// ============================================================================

pub struct MultithreadExecutor {
    jumps: Vec<JumpSpec>,
    max_concurrent: usize,
    steps: HashMap<SolidKey, Step>,
    steps_by_input_key: HashMap<SolidKey, Vec<SolidKey>>,
    ready_to_execute: HashSet<SolidKey>,
    in_flight: HashSet<SolidKey>,
    output_value: HashMap<SolidKey, SolidOutput>,
}

impl MultithreadExecutor {
    pub fn new(pipeline: PipelineDefinition) -> Self {
        let max_concurrent = pipeline.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT);
        let mut steps = HashMap::new();
        let mut steps_by_input_key: HashMap<SolidKey, Vec<SolidKey>> = HashMap::new();
        let mut ready_to_execute = HashSet::new();
        for solid in pipeline.solids {
            let key = solid.key();
            let mut step = Step::new(Arc::new(solid));
            if step.check_ready() {
                ready_to_execute.insert(key.clone());
            } else {
                for input_def in &step.def.input_defs {
                    steps_by_input_key
                        .entry(input_def.key())
                        .or_default()
                        .push(key.clone());
                }
            }
            steps.insert(key, step);
        }
        Self {
            jumps: pipeline.jumps,
            max_concurrent,
            steps,
            steps_by_input_key,
            ready_to_execute,
            in_flight: HashSet::new(),
            output_value: HashMap::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.in_flight.is_empty() && self.ready_to_execute.is_empty()
    }

    fn pop_ready(&mut self, limit: usize) -> Vec<SolidKey> {
        let mut popped = Vec::new();
        while popped.len() < limit {
            let Some(key) = self.ready_to_execute.iter().next().cloned() else {
                break;
            };
            self.ready_to_execute.remove(&key);
            self.in_flight.insert(key.clone());
            popped.push(key);
        }
        popped
    }

    fn handle_event(&mut self, event: &StepEvent) {
        match event {
            StepEvent::Finish { key, .. } | StepEvent::Failure { key, .. } => {
                self.in_flight.remove(key);
            }
            StepEvent::Output { key, value } => {
                self.output_value.insert(key.clone(), value.clone());
                let consumers = self
                    .steps_by_input_key
                    .get(key)
                    .cloned()
                    .unwrap_or_default();
                for consumer in consumers {
                    if let Some(step) = self.steps.get_mut(&consumer) {
                        step.inputs.insert(key.clone(), value.clone());
                        if step.check_ready() {
                            self.ready_to_execute.insert(consumer);
                        }
                    }
                }
            }
            StepEvent::Start { .. } => {}
        }
    }

    /// True when the step depends on a pending forward solid of a jump that
    /// does not contain the step's own item.
    fn gated_by_jump(
        &self,
        key: &SolidKey,
        unfinished_jumps: &HashSet<usize>,
        dispatched: &HashSet<SolidKey>,
    ) -> bool {
        let mut predecessor_items: HashSet<&str> = HashSet::new();
        for &index in unfinished_jumps {
            let jump = &self.jumps[index];
            if jump.item_names.contains(&key.0) {
                continue;
            }
            predecessor_items.extend(jump.item_names.iter().map(String::as_str));
        }
        if predecessor_items.is_empty() {
            return false;
        }
        let Some(step) = self.steps.get(key) else {
            return false;
        };
        step.dependency_keys().iter().any(|(item, direction)| {
            *direction == ExecutionDirection::Forward
                && predecessor_items.contains(item.as_str())
                && dispatched.contains(&(item.clone(), ExecutionDirection::Forward))
        })
    }

    fn spawn_step(
        &self,
        key: &SolidKey,
        errors: &Arc<Mutex<Vec<String>>>,
    ) -> mpsc::UnboundedReceiver<StepEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let step = &self.steps[key];
        let def = step.def.clone();
        let inputs = step.assemble_inputs();
        let errors = errors.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let _ = tx.send(StepEvent::Start { key: key.clone() });
            let emitter = OutputEmitter {
                key: key.clone(),
                sender: tx.clone(),
            };
            let compute = def.compute.clone();
            let task = tokio::spawn(async move { compute.compute(inputs, emitter).await });
            match task.await {
                Ok(Ok(state)) => {
                    let _ = tx.send(StepEvent::Finish { key, state });
                }
                Ok(Err(failure)) => {
                    let _ = tx.send(StepEvent::Failure {
                        key,
                        error: failure.message,
                    });
                }
                Err(join_error) => {
                    // The compute task panicked or was cancelled; synthesise
                    // a failure so the run can unwind normally.
                    let message = format!(
                        "execution task for {} ({}) crashed: {join_error}",
                        key.0, key.1
                    );
                    errors.lock().unwrap().push(message.clone());
                    let _ = tx.send(StepEvent::Failure {
                        key,
                        error: message,
                    });
                }
            }
        });
        rx
    }

    /// Runs the pipeline to exhaustion, forwarding every event to `sink`.
    pub async fn run(
        mut self,
        sink: mpsc::UnboundedSender<StepEvent>,
        loop_controller: Arc<dyn LoopController>,
    ) -> Result<(), ExecutorError> {
        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut active: HashMap<SolidKey, mpsc::UnboundedReceiver<StepEvent>> = HashMap::new();
        let mut waiting: HashSet<SolidKey> = HashSet::new();
        let mut iterating: HashSet<SolidKey> = HashSet::new();
        let mut iterating_active: HashSet<SolidKey> = HashSet::new();
        let mut iterating_failed: HashSet<SolidKey> = HashSet::new();
        let mut dispatched: HashSet<SolidKey> = HashSet::new();
        let mut unfinished_jumps: HashSet<usize> = (0..self.jumps.len()).collect();
        let mut iteration_counters: HashMap<usize, u32> = HashMap::new();
        let jump_by_source: HashMap<String, usize> = self
            .jumps
            .iter()
            .enumerate()
            .map(|(i, jump)| (jump.source.clone(), i))
            .collect();
        let jump_by_item = self.innermost_jump_by_item();

        while !self.is_complete() || !active.is_empty() {
            // --- Dispatch ---
            while active.len() < self.max_concurrent {
                let mut candidates = self.pop_ready(self.max_concurrent - active.len());
                dispatched.extend(candidates.iter().cloned());
                candidates.extend(waiting.iter().cloned());
                // Iterating steps run only when none of their dependencies
                // is itself re-iterating; this serialises loop re-entry.
                let mut iterating_skipped: HashSet<SolidKey> = HashSet::new();
                for key in iterating.iter() {
                    let deps = self.steps[key].dependency_keys();
                    let blocked = deps.iter().any(|dep| {
                        iterating_active.contains(dep)
                            || iterating_skipped.contains(dep)
                            || iterating_failed.contains(dep)
                    });
                    if blocked {
                        iterating_skipped.insert(key.clone());
                        continue;
                    }
                    iterating_active.insert(key.clone());
                    candidates.push(key.clone());
                }
                let mut executable = Vec::new();
                for key in candidates {
                    if key.1 == ExecutionDirection::Backward {
                        executable.push(key);
                        continue;
                    }
                    if self.gated_by_jump(&key, &unfinished_jumps, &dispatched) {
                        if !iterating.contains(&key) {
                            waiting.insert(key);
                        }
                        continue;
                    }
                    waiting.remove(&key);
                    iterating.remove(&key);
                    executable.push(key);
                }
                if executable.is_empty() {
                    break;
                }
                for key in executable {
                    let receiver = self.spawn_step(&key, &errors);
                    active.insert(key, receiver);
                }
            }

            // --- Drain: one event per live solid per pass ---
            let mut exhausted = Vec::new();
            let mut handled_any = false;
            let keys: Vec<SolidKey> = active.keys().cloned().collect();
            for key in keys {
                let received = match active.get_mut(&key) {
                    Some(receiver) => receiver.try_recv(),
                    None => continue,
                };
                match received {
                    Ok(event) => {
                        handled_any = true;
                        self.handle_event(&event);
                        let _ = sink.send(event.clone());
                        if key.1 != ExecutionDirection::Forward {
                            continue;
                        }
                        match &event {
                            StepEvent::Failure { .. } => {
                                iterating_active.remove(&key);
                                self.retire_failed_loops(
                                    &key,
                                    &jump_by_item,
                                    &mut unfinished_jumps,
                                    &mut iteration_counters,
                                    &mut iterating_failed,
                                );
                            }
                            StepEvent::Finish { .. } => {
                                iterating_active.remove(&key);
                                if let Some(&index) = jump_by_source.get(&key.0) {
                                    self.process_loop_condition(
                                        index,
                                        loop_controller.as_ref(),
                                        &jump_by_item,
                                        &mut unfinished_jumps,
                                        &mut iteration_counters,
                                        &mut iterating,
                                        &dispatched,
                                    )
                                    .await;
                                }
                            }
                            _ => {}
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => {}
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        exhausted.push(key);
                    }
                }
            }
            for key in exhausted {
                active.remove(&key);
            }
            if !handled_any {
                tokio::time::sleep(TICK).await;
            }
        }

        let errors = std::mem::take(&mut *errors.lock().unwrap());
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ExecutorError { errors })
        }
    }

    /// Maps each item to the innermost jump it belongs to.
    fn innermost_jump_by_item(&self) -> HashMap<String, usize> {
        let mut jump_by_item = HashMap::new();
        for (i, jump) in self.jumps.iter().enumerate() {
            let mut non_nested = jump.item_names.clone();
            for (j, other) in self.jumps.iter().enumerate() {
                if i == j {
                    continue;
                }
                let strict_superset = other.item_names.len() > jump.item_names.len()
                    && other.item_names.is_superset(&jump.item_names);
                if strict_superset {
                    continue;
                }
                for item in &other.item_names {
                    non_nested.remove(item);
                }
            }
            for item in non_nested {
                jump_by_item.insert(item, i);
            }
        }
        jump_by_item
    }

    /// A failure inside a loop body retires that loop and every loop sharing
    /// items with it for the remainder of the run.
    fn retire_failed_loops(
        &self,
        key: &SolidKey,
        jump_by_item: &HashMap<String, usize>,
        unfinished_jumps: &mut HashSet<usize>,
        iteration_counters: &mut HashMap<usize, u32>,
        iterating_failed: &mut HashSet<SolidKey>,
    ) {
        let Some(&failed_index) = jump_by_item.get(&key.0) else {
            return;
        };
        let failed_items = self.jumps[failed_index].item_names.clone();
        for (index, jump) in self.jumps.iter().enumerate() {
            if !jump.item_names.is_disjoint(&failed_items) {
                unfinished_jumps.remove(&index);
                iteration_counters.remove(&index);
            }
        }
        iterating_failed.insert(key.clone());
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_loop_condition(
        &mut self,
        index: usize,
        loop_controller: &dyn LoopController,
        jump_by_item: &HashMap<String, usize>,
        unfinished_jumps: &mut HashSet<usize>,
        iteration_counters: &mut HashMap<usize, u32>,
        iterating: &mut HashSet<SolidKey>,
        dispatched: &HashSet<SolidKey>,
    ) {
        let (source, destination, item_names) = {
            let jump = &self.jumps[index];
            (
                jump.source.clone(),
                jump.destination.clone(),
                jump.item_names.clone(),
            )
        };
        let forward_resources: Vec<Resource> = match self
            .output_value
            .get(&(source, ExecutionDirection::Forward))
        {
            Some(SolidOutput::Stacks(stacks)) => stacks.iter().flatten().cloned().collect(),
            _ => Vec::new(),
        };
        let backward_resources: Vec<Resource> = match self
            .output_value
            .get(&(destination, ExecutionDirection::Backward))
        {
            Some(SolidOutput::Resources(resources)) => resources.clone(),
            _ => Vec::new(),
        };
        let counter = *iteration_counters.entry(index).or_insert(1);
        let iterate = loop_controller
            .is_jump_condition_true(index, counter, forward_resources, backward_resources)
            .await;
        if iterate {
            // Re-queue every dispatched forward solid of the loop body.
            for key in dispatched {
                if key.1 == ExecutionDirection::Forward && item_names.contains(&key.0) {
                    iterating.insert(key.clone());
                }
            }
            // Nested loops start over on the next pass of the outer body.
            for item in &item_names {
                if let Some(&nested) = jump_by_item.get(item) {
                    unfinished_jumps.insert(nested);
                }
            }
            if let Some(counter) = iteration_counters.get_mut(&index) {
                *counter += 1;
            }
        } else {
            unfinished_jumps.remove(&index);
            iteration_counters.remove(&index);
        }
    }
}

/// Convenience entry point mirroring the engine's use: build and run.
pub async fn execute_pipeline(
    pipeline: PipelineDefinition,
    sink: mpsc::UnboundedSender<StepEvent>,
    loop_controller: Arc<dyn LoopController>,
) -> Result<(), ExecutorError> {
    MultithreadExecutor::new(pipeline).run(sink, loop_controller).await
}
