// src/item.rs
//
// =============================================================================
// GRAPHLOOM: EXECUTABLE ITEM PORT
// =============================================================================
//
// The Hexagonal Port.
//
// Responsibilities:
// 1. Define the `ExecutableItem` trait (The Contract).
// 2. Define the factory trait and the closed registry keyed by item type.
// 3. Compute the set of items required for an execution (permitted items
//    plus the unpermitted neighbors that still forward resources).

use crate::connection::Connection;
use crate::core::{AppSettings, ExecutionDirection, FinishState};
use crate::db::SharedDbServerManager;
use crate::event::ItemLogger;
use crate::limiter::ProcessLimits;
use crate::resource::Resource;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ============================================================================
// 1. THE ITEM TRAIT (The Contract)
// ============================================================================

/// Shared lock handed to every filtered execution of one item, for items
/// that must serialise work across their fan-out siblings.
pub type ItemLock = Arc<tokio::sync::Mutex<()>>;

/// A project item's counterpart in execution.
///
/// Items are constructed per execution: once for the backward sweep and once
/// for every filtered forward run. Concrete implementations (tool runners,
/// importers, data connections) live outside this crate.
#[async_trait]
pub trait ExecutableItem: Send + Sync {
    fn name(&self) -> &str;

    fn item_type(&self) -> &str;

    /// Validates the item's internal state before execution.
    fn ready_to_execute(&self, _settings: &AppSettings) -> bool {
        true
    }

    /// Executes the item with the given filtered resources.
    async fn execute(
        &self,
        forward_resources: &[Resource],
        backward_resources: &[Resource],
        lock: ItemLock,
    ) -> FinishState;

    /// Called instead of `execute` when the item is not permitted. Only
    /// lightweight bookkeeping should happen here.
    async fn exclude_execution(
        &self,
        _forward_resources: &[Resource],
        _backward_resources: &[Resource],
        _lock: ItemLock,
    ) {
    }

    /// Called after `execute` with the resulting state.
    fn finish_execution(&self, _state: FinishState) {}

    /// The resources this item advertises in the given direction.
    fn output_resources(&self, direction: ExecutionDirection) -> Vec<Resource>;

    /// Called before the next loop iteration re-runs this item.
    fn update(&self, _forward_resources: &[Resource], _backward_resources: &[Resource]) {}

    /// Cooperative stop; called from `Engine::stop` on running items.
    fn stop_execution(&self);

    /// The engine announces the filtered run's id before `execute`.
    fn set_filter_id(&self, _filter_id: &str) {}
}

// ============================================================================
// 2. SPECIFICATIONS
// ============================================================================

/// A named, declarative template an item is instantiated from.
#[derive(Debug, Clone)]
pub struct ItemSpecification {
    pub name: String,
    pub item_type: String,
    pub definition: Value,
}

/// Specifications grouped by item type, then by name.
pub type Specifications = HashMap<String, HashMap<String, ItemSpecification>>;

// ============================================================================
// 3. THE FACTORY & REGISTRY
// ============================================================================

/// Everything an item needs from the engine besides its own dict: explicit
/// objects instead of process-wide singletons.
pub struct ExecutionContext {
    pub project_dir: PathBuf,
    pub settings: AppSettings,
    pub specifications: Specifications,
    pub process_limits: Arc<ProcessLimits>,
    pub db_server: SharedDbServerManager,
}

impl ExecutionContext {
    /// Data directory items may write under; created on demand by items.
    pub fn item_data_dir(&self, item_name: &str) -> PathBuf {
        self.project_dir
            .join(".graphloom")
            .join("items")
            .join(crate::core::shorten(item_name))
    }
}

/// Constructs executable items of one type.
pub trait ItemFactory: Send + Sync {
    /// Builds an executable item from its dict form.
    fn make(
        &self,
        name: &str,
        item_dict: &Value,
        context: &ExecutionContext,
        logger: ItemLogger,
    ) -> Result<Box<dyn ExecutableItem>>;

    /// Builds a specification from its dict form.
    fn make_specification(
        &self,
        spec_dict: &Value,
        _settings: &AppSettings,
    ) -> Result<ItemSpecification> {
        let name = spec_dict
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let item_type = spec_dict
            .get("item_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(ItemSpecification {
            name,
            item_type,
            definition: spec_dict.clone(),
        })
    }

    /// True when items of this type consume filters without forwarding them:
    /// resource flow stops at such an item when it is not permitted.
    fn is_filter_terminus(&self) -> bool {
        false
    }
}

/// Closed registry of item factories keyed by item type. Replaces the
/// original's dynamic plug-in discovery; the embedder assembles it once.
#[derive(Default)]
pub struct ItemRegistry {
    factories: HashMap<String, Arc<dyn ItemFactory>>,
}

impl ItemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, item_type: impl Into<String>, factory: Arc<dyn ItemFactory>) {
        self.factories.insert(item_type.into(), factory);
    }

    pub fn factory(&self, item_type: &str) -> Option<&Arc<dyn ItemFactory>> {
        self.factories.get(item_type)
    }

    pub fn contains(&self, item_type: &str) -> bool {
        self.factories.contains_key(item_type)
    }
}

// ============================================================================
// 4. REQUIRED ITEMS
// ============================================================================

fn item_type_of(item_dict: &Value) -> Option<&str> {
    item_dict.get("type").and_then(Value::as_str)
}

/// Collects the items required for an execution: every permitted item plus
/// the unpermitted items adjacent to them that still forward resources.
/// Resource flow stops at filter-terminus items, so an unpermitted terminus
/// never pulls its own neighborhood in.
pub fn required_items_for_execution(
    items: &HashMap<String, Value>,
    connections: &[Connection],
    registry: &ItemRegistry,
    execution_permits: &HashMap<String, bool>,
) -> BTreeSet<String> {
    let forwards_resources = |name: &str| -> bool {
        let Some(item_dict) = items.get(name) else {
            return false;
        };
        match item_type_of(item_dict).and_then(|t| registry.factory(t)) {
            Some(factory) => !factory.is_filter_terminus(),
            None => false,
        }
    };
    let mut required: BTreeSet<String> = items
        .keys()
        .filter(|name| execution_permits.get(*name).copied().unwrap_or(false))
        .cloned()
        .collect();
    loop {
        let mut added = Vec::new();
        for connection in connections {
            let source_in = required.contains(&connection.source);
            let destination_in = required.contains(&connection.destination);
            if source_in && !destination_in && forwards_resources(&connection.destination) {
                added.push(connection.destination.clone());
            }
            if destination_in && !source_in && forwards_resources(&connection.source) {
                added.push(connection.source.clone());
            }
        }
        if added.is_empty() {
            break;
        }
        required.extend(added);
    }
    required
}

/// Writes the filter id of a filtered run into its work directory so later
/// tooling can identify which view the outputs were produced under.
pub fn write_filter_id_file(filter_id: &str, directory: &Path) -> std::io::Result<()> {
    std::fs::write(directory.join(".filter_id"), format!("{filter_id}\n"))
}
