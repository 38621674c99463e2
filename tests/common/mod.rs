// Shared test fixtures: scripted items, a counter-based condition tool and
// an in-memory database collaborator.
#![allow(dead_code)]

use async_trait::async_trait;
use graphloom::core::{AppSettings, ExecutionDirection, FinishState};
use graphloom::db::{DbServerHandle, DbServerManager, PurgeSettings, WriteOrdering};
use graphloom::engine::{Engine, EngineRequest};
use graphloom::event::{EventKind, ItemLogger};
use graphloom::filter_config::clear_filter_configs;
use graphloom::item::{ExecutableItem, ExecutionContext, ItemFactory, ItemLock, ItemRegistry};
use graphloom::resource::Resource;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// In-memory database collaborator
// ============================================================================

#[derive(Default)]
pub struct MemoryDbServer {
    scenarios: Mutex<HashMap<String, Vec<String>>>,
    alternatives: Mutex<HashMap<String, Vec<String>>>,
    pub purged: Mutex<Vec<String>>,
}

impl MemoryDbServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_scenarios(&self, url: &str, names: &[&str]) {
        self.scenarios
            .lock()
            .unwrap()
            .insert(url.to_string(), names.iter().map(|n| n.to_string()).collect());
    }

    pub fn add_alternatives(&self, url: &str, names: &[&str]) {
        self.alternatives
            .lock()
            .unwrap()
            .insert(url.to_string(), names.iter().map(|n| n.to_string()).collect());
    }
}

struct PassthroughHandle {
    url: String,
}

impl DbServerHandle for PassthroughHandle {
    fn server_url(&self) -> &str {
        &self.url
    }

    fn checkin(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn checkout(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl DbServerManager for MemoryDbServer {
    fn open_server(
        &self,
        url: &str,
        _memory: bool,
        _ordering: WriteOrdering,
    ) -> anyhow::Result<Box<dyn DbServerHandle>> {
        Ok(Box::new(PassthroughHandle {
            url: url.to_string(),
        }))
    }

    fn quick_checkout(&self, _ordering: WriteOrdering) -> anyhow::Result<()> {
        Ok(())
    }

    fn purge_url(
        &self,
        url: &str,
        _settings: &PurgeSettings,
        _logger: &ItemLogger,
    ) -> anyhow::Result<()> {
        self.purged.lock().unwrap().push(url.to_string());
        Ok(())
    }

    fn scenario_names(&self, url: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .scenarios
            .lock()
            .unwrap()
            .get(&clear_filter_configs(url))
            .cloned()
            .unwrap_or_default())
    }

    fn alternative_names(&self, url: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .alternatives
            .lock()
            .unwrap()
            .get(&clear_filter_configs(url))
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// Execution recorder
// ============================================================================

#[derive(Clone, Debug)]
pub struct Execution {
    pub item: String,
    pub filter_id: String,
    pub forward: Vec<Resource>,
    pub backward: Vec<Resource>,
}

#[derive(Default)]
pub struct Recorder {
    pub executions: Mutex<Vec<Execution>>,
    pub updates: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn executions_of(&self, item: &str) -> Vec<Execution> {
        self.executions
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.item == item)
            .cloned()
            .collect()
    }

    pub fn execution_count(&self, item: &str) -> usize {
        self.executions_of(item).len()
    }
}

// ============================================================================
// Scripted items
// ============================================================================

#[derive(Clone, Default)]
pub struct ItemScript {
    pub forward_outputs: Vec<Resource>,
    pub backward_outputs: Vec<Resource>,
    pub execute_result: Option<FinishState>,
    pub execute_delay: Option<Duration>,
}

pub struct ScriptedItem {
    name: String,
    script: ItemScript,
    recorder: Arc<Recorder>,
    filter_id: Mutex<String>,
}

#[async_trait]
impl ExecutableItem for ScriptedItem {
    fn name(&self) -> &str {
        &self.name
    }

    fn item_type(&self) -> &str {
        "Scripted"
    }

    async fn execute(
        &self,
        forward_resources: &[Resource],
        backward_resources: &[Resource],
        _lock: ItemLock,
    ) -> FinishState {
        if let Some(delay) = self.script.execute_delay {
            tokio::time::sleep(delay).await;
        }
        self.recorder.executions.lock().unwrap().push(Execution {
            item: self.name.clone(),
            filter_id: self.filter_id.lock().unwrap().clone(),
            forward: forward_resources.to_vec(),
            backward: backward_resources.to_vec(),
        });
        self.script.execute_result.unwrap_or(FinishState::Success)
    }

    fn output_resources(&self, direction: ExecutionDirection) -> Vec<Resource> {
        match direction {
            ExecutionDirection::Forward => self.script.forward_outputs.clone(),
            ExecutionDirection::Backward => self.script.backward_outputs.clone(),
            ExecutionDirection::None => Vec::new(),
        }
    }

    fn update(&self, _forward: &[Resource], _backward: &[Resource]) {
        self.recorder.updates.lock().unwrap().push(self.name.clone());
    }

    fn stop_execution(&self) {
        self.recorder.stopped.lock().unwrap().push(self.name.clone());
    }

    fn set_filter_id(&self, filter_id: &str) {
        *self.filter_id.lock().unwrap() = filter_id.to_string();
    }
}

pub struct ScriptedFactory {
    scripts: Mutex<HashMap<String, ItemScript>>,
    pub recorder: Arc<Recorder>,
}

impl ScriptedFactory {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            recorder,
        }
    }

    pub fn script(&self, item_name: &str, script: ItemScript) {
        self.scripts
            .lock()
            .unwrap()
            .insert(item_name.to_string(), script);
    }
}

impl ItemFactory for ScriptedFactory {
    fn make(
        &self,
        name: &str,
        _item_dict: &Value,
        _context: &ExecutionContext,
        _logger: ItemLogger,
    ) -> anyhow::Result<Box<dyn ExecutableItem>> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(ScriptedItem {
            name: name.to_string(),
            script,
            recorder: self.recorder.clone(),
            filter_id: Mutex::new(String::new()),
        }))
    }
}

// ============================================================================
// Counter-based condition tool
// ============================================================================

/// A "Tool" stand-in for loop conditions: succeeds while the iteration
/// counter (last command line argument) is below the limit encoded in the
/// specification name, e.g. "iterate_below_2".
pub struct CounterToolFactory;

struct CounterTool {
    name: String,
    limit: u32,
    counter: u32,
}

#[async_trait]
impl ExecutableItem for CounterTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn item_type(&self) -> &str {
        "Tool"
    }

    async fn execute(
        &self,
        _forward_resources: &[Resource],
        _backward_resources: &[Resource],
        _lock: ItemLock,
    ) -> FinishState {
        if self.counter < self.limit {
            FinishState::Success
        } else {
            FinishState::Failure
        }
    }

    fn output_resources(&self, _direction: ExecutionDirection) -> Vec<Resource> {
        Vec::new()
    }

    fn stop_execution(&self) {}
}

impl ItemFactory for CounterToolFactory {
    fn make(
        &self,
        name: &str,
        item_dict: &Value,
        _context: &ExecutionContext,
        _logger: ItemLogger,
    ) -> anyhow::Result<Box<dyn ExecutableItem>> {
        let specification = item_dict
            .get("specification")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let limit = specification
            .rsplit('_')
            .next()
            .and_then(|part| part.parse().ok())
            .unwrap_or(0);
        let counter = item_dict
            .get("cmd_line_args")
            .and_then(Value::as_array)
            .and_then(|args| args.last())
            .and_then(|arg| arg.get("arg"))
            .and_then(Value::as_str)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        Ok(Box::new(CounterTool {
            name: name.to_string(),
            limit,
            counter,
        }))
    }
}

// ============================================================================
// Request building & event collection
// ============================================================================

pub fn connection_dict(source: &str, destination: &str) -> Value {
    json!({ "from": [source, "right"], "to": [destination, "left"] })
}

pub fn jump_dict(source: &str, destination: &str, limit: u32) -> Value {
    json!({
        "from": [source, "bottom"],
        "to": [destination, "bottom"],
        "condition": {
            "type": "tool-specification",
            "specification": format!("iterate_below_{limit}"),
        },
    })
}

pub fn build_request(items: &[&str], connections: Vec<Value>, jumps: Vec<Value>) -> EngineRequest {
    let mut item_dicts = HashMap::new();
    let mut permits = HashMap::new();
    for item in items {
        item_dicts.insert(item.to_string(), json!({ "type": "Scripted" }));
        permits.insert(item.to_string(), true);
    }
    let mut node_successors: HashMap<String, Vec<String>> =
        items.iter().map(|i| (i.to_string(), Vec::new())).collect();
    for connection in &connections {
        let source = connection["from"][0].as_str().unwrap().to_string();
        let destination = connection["to"][0].as_str().unwrap().to_string();
        node_successors.entry(source).or_default().push(destination);
    }
    EngineRequest {
        items: item_dicts,
        connections,
        jumps,
        node_successors,
        execution_permits: permits,
        items_module_name: "test_items".to_string(),
        ..Default::default()
    }
}

pub struct TestHarness {
    pub engine: Engine,
    pub recorder: Arc<Recorder>,
    pub db: Arc<MemoryDbServer>,
}

/// Builds an engine over scripted items. `configure` scripts the items
/// before the engine is constructed.
pub fn harness(
    request: EngineRequest,
    configure: impl FnOnce(&ScriptedFactory, &MemoryDbServer),
) -> Result<TestHarness, graphloom::core::EngineInitFailed> {
    let recorder = Arc::new(Recorder::default());
    let factory = ScriptedFactory::new(recorder.clone());
    let db = Arc::new(MemoryDbServer::new());
    configure(&factory, &db);
    let mut registry = ItemRegistry::new();
    registry.register("Scripted", Arc::new(factory));
    registry.register("Tool", Arc::new(CounterToolFactory));
    let engine = Engine::new(request, Arc::new(registry), db.clone())?;
    Ok(TestHarness {
        engine,
        recorder,
        db,
    })
}

/// Drains the event stream to completion.
pub fn collect_events(engine: &Engine) -> Vec<(EventKind, Value)> {
    let mut events = Vec::new();
    while let Some(event) = engine.get_event() {
        events.push(event);
    }
    events
}

pub fn count_events(
    events: &[(EventKind, Value)],
    kind: EventKind,
    item: &str,
    direction: &str,
) -> usize {
    events
        .iter()
        .filter(|(event_kind, payload)| {
            *event_kind == kind
                && payload["item_name"] == item
                && payload["direction"] == direction
        })
        .count()
}

#[allow(dead_code)]
pub fn default_settings() -> AppSettings {
    AppSettings::new(HashMap::new())
}
