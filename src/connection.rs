// src/connection.rs
//
// =============================================================================
// GRAPHLOOM: CONNECTIONS
// =============================================================================
//
// The typed links between project items.
//
// Responsibilities:
// 1. Per-edge filter settings: which scenarios/alternatives are online.
// 2. Forward resource conversion (datapackage collapse, memory-DB flag).
// 3. Backward resource conversion (purge, write-index ordering tags).
// 4. Dict round-trips for the declarative project description.

use crate::core::PartCount;
use crate::db::SharedDbServerManager;
use crate::event::ItemLogger;
use crate::filter_config::{
    FilterConfig, ALTERNATIVE_FILTER_TYPE, SCENARIO_FILTER_TYPE, SUPPORTED_FILTER_TYPES,
};
use crate::resource::{file_resource, MetadataPatch, Resource, ResourceKind};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// ============================================================================
// 1. FILTER SETTINGS
// ============================================================================

/// Online statuses keyed by resource label, then filter type, then filter
/// name. Filters missing from the map follow `auto_online`.
pub type KnownFilters = HashMap<String, HashMap<String, HashMap<String, bool>>>;

fn default_enabled_filter_types() -> HashMap<String, bool> {
    HashMap::from([
        (ALTERNATIVE_FILTER_TYPE.to_string(), false),
        (SCENARIO_FILTER_TYPE.to_string(), true),
    ])
}

fn default_auto_online() -> bool {
    true
}

/// Filter settings of one resource-converting connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSettings {
    #[serde(default)]
    pub known_filters: KnownFilters,
    /// If true, filters not mentioned in `known_filters` are online.
    #[serde(default = "default_auto_online")]
    pub auto_online: bool,
    #[serde(default = "default_enabled_filter_types")]
    pub enabled_filter_types: HashMap<String, bool>,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            known_filters: KnownFilters::default(),
            auto_online: true,
            enabled_filter_types: default_enabled_filter_types(),
        }
    }
}

impl FilterSettings {
    pub fn new(known_filters: KnownFilters) -> Self {
        let mut settings = Self {
            known_filters,
            ..Default::default()
        };
        settings.drop_unsupported_types();
        settings
    }

    /// Unsupported filter types are dropped so stale project files do not
    /// resurrect removed filter kinds.
    fn drop_unsupported_types(&mut self) {
        for online_filters in self.known_filters.values_mut() {
            online_filters.retain(|filter_type, _| {
                SUPPORTED_FILTER_TYPES.contains(&filter_type.as_str())
            });
        }
    }

    fn type_enabled(&self, filter_type: &str) -> bool {
        self.enabled_filter_types
            .get(filter_type)
            .copied()
            .unwrap_or(false)
    }

    /// True when filters of any enabled type exist at all.
    pub fn has_filters(&self) -> bool {
        self.known_filters.values().any(|filters_by_type| {
            filters_by_type
                .iter()
                .any(|(filter_type, filters)| self.type_enabled(filter_type) && !filters.is_empty())
        })
    }

    /// True when any filter of any enabled type is online.
    pub fn has_any_filter_online(&self) -> bool {
        self.known_filters.values().any(|filters_by_type| {
            filters_by_type.iter().any(|(filter_type, filters)| {
                self.type_enabled(filter_type) && filters.values().any(|online| *online)
            })
        })
    }

    /// True when any filter of the given type is online.
    pub fn has_filter_online(&self, filter_type: &str) -> bool {
        if !self.type_enabled(filter_type) {
            return false;
        }
        self.known_filters.values().any(|filters_by_type| {
            filters_by_type
                .get(filter_type)
                .is_some_and(|filters| filters.values().any(|online| *online))
        })
    }

    fn online_status(&self, label: &str, filter_type: &str, filter_name: &str) -> bool {
        self.known_filters
            .get(label)
            .and_then(|by_type| by_type.get(filter_type))
            .and_then(|filters| filters.get(filter_name))
            .copied()
            .unwrap_or(self.auto_online)
    }
}

// ============================================================================
// 2. OPTIONS
// ============================================================================

fn default_write_index() -> i32 {
    1
}

fn is_default_write_index(index: &i32) -> bool {
    *index == 1
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Per-connection behaviour toggles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    #[serde(default, skip_serializing_if = "is_false")]
    pub use_datapackage: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub use_memory_db: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub purge_before_writing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purge_settings: Option<HashMap<String, bool>>,
    /// Priority among concurrent writers to one destination; lower writes
    /// earlier. Equal indices enforce no order.
    #[serde(default = "default_write_index", skip_serializing_if = "is_default_write_index")]
    pub write_index: i32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub require_scenario_filter: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub require_alternative_filter: bool,
}

// ============================================================================
// 3. THE CONNECTION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConnectionDict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    from: (String, String),
    to: (String, String),
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<ConnectionOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter_settings: Option<FilterSettings>,
}

/// Run-time state the connection accumulates during execution.
#[derive(Default)]
struct ConnectionState {
    /// Filterable database resources advertised by the source item.
    source_resources: Vec<Resource>,
    /// Lazily fetched online filter values, keyed by resource label. The
    /// outer Vec holds one config list per filter type.
    enabled_filter_values: Option<HashMap<String, Vec<Vec<FilterConfig>>>>,
    source_visited: bool,
}

/// A connection between two project items.
pub struct Connection {
    pub source: String,
    pub source_position: String,
    pub destination: String,
    pub destination_position: String,
    pub options: ConnectionOptions,
    pub filter_settings: FilterSettings,
    state: Mutex<ConnectionState>,
    logger: Option<ItemLogger>,
    db_server: Option<SharedDbServerManager>,
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
            && self.source_position == other.source_position
            && self.destination == other.destination
            && self.destination_position == other.destination_position
            && self.options == other.options
            && self.filter_settings == other.filter_settings
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("source", &self.source)
            .field("source_position", &self.source_position)
            .field("destination", &self.destination)
            .field("destination_position", &self.destination_position)
            .field("options", &self.options)
            .field("filter_settings", &self.filter_settings)
            .finish()
    }
}

impl Connection {
    pub fn new(
        source: impl Into<String>,
        source_position: impl Into<String>,
        destination: impl Into<String>,
        destination_position: impl Into<String>,
        options: ConnectionOptions,
        filter_settings: FilterSettings,
    ) -> Self {
        let mut filter_settings = filter_settings;
        filter_settings.drop_unsupported_types();
        Self {
            source: source.into(),
            source_position: source_position.into(),
            destination: destination.into(),
            destination_position: destination_position.into(),
            options,
            filter_settings,
            state: Mutex::new(ConnectionState::default()),
            logger: None,
            db_server: None,
        }
    }

    pub fn name(&self) -> String {
        format!("from {} to {}", self.source, self.destination)
    }

    /// Attaches the run-scoped collaborators. Called once by the engine
    /// before execution starts.
    pub fn prepare(&mut self, logger: ItemLogger, db_server: SharedDbServerManager) {
        self.logger = Some(logger);
        self.db_server = Some(db_server);
    }

    // --- Validation ---

    fn require_filter_online(&self, filter_type: &str) -> bool {
        if !self.filter_settings.type_enabled(filter_type) {
            return false;
        }
        match filter_type {
            SCENARIO_FILTER_TYPE => self.options.require_scenario_filter,
            ALTERNATIVE_FILTER_TYPE => self.options.require_alternative_filter,
            _ => false,
        }
    }

    /// A connection is ready when every required filter type has at least
    /// one online filter.
    pub fn ready_to_execute(&self) -> bool {
        for filter_type in [SCENARIO_FILTER_TYPE, ALTERNATIVE_FILTER_TYPE] {
            if self.require_filter_online(filter_type)
                && !self.filter_settings.has_filter_online(filter_type)
            {
                return false;
            }
        }
        true
    }

    pub fn notifications(&self) -> Vec<String> {
        let mut notifications = Vec::new();
        for (filter_type, pretty) in [
            (SCENARIO_FILTER_TYPE, "scenario"),
            (ALTERNATIVE_FILTER_TYPE, "alternative"),
        ] {
            let missing = if self.filter_settings.has_filters() {
                !self.filter_settings.has_filter_online(filter_type)
            } else {
                !self.filter_settings.auto_online
            };
            if self.require_filter_online(filter_type) && missing {
                notifications.push(format!("At least one {pretty} filter must be active."));
            }
        }
        notifications
    }

    pub fn has_filters_online(&self) -> bool {
        self.filter_settings.has_any_filter_online()
    }

    // --- Flash bookkeeping ---

    pub fn visit_source(&self) {
        self.state.lock().unwrap().source_visited = true;
    }

    /// Emits the link flash once per source-to-destination traversal. A
    /// destination visit without a preceding source visit happens during
    /// loop execution and is ignored.
    pub fn visit_destination(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.source_visited {
                return;
            }
            state.source_visited = false;
        }
        self.emit_flash();
    }

    pub fn emit_flash(&self) {
        if let Some(logger) = &self.logger {
            logger.flash();
        }
    }

    // --- Resource intake ---

    /// Remembers the source item's filterable database resources; these are
    /// the resources the connection can expand by scenario.
    pub fn receive_resources_from_source(&self, resources: &[Resource]) {
        let mut state = self.state.lock().unwrap();
        state.source_resources = resources
            .iter()
            .filter(|r| r.kind == ResourceKind::Database && r.filterable())
            .cloned()
            .collect();
    }

    // --- Enabled filters ---

    /// Returns the online filter configs for the given resource label, one
    /// config list per filter type. Reads each database once per run.
    pub fn enabled_filter_configs(&self, resource_label: &str) -> Option<Vec<Vec<FilterConfig>>> {
        let mut state = self.state.lock().unwrap();
        if state.enabled_filter_values.is_none() {
            let values = self.fetch_enabled_filter_values(&state.source_resources);
            state.enabled_filter_values = Some(values);
        }
        state
            .enabled_filter_values
            .as_ref()
            .and_then(|values| values.get(resource_label))
            .cloned()
    }

    fn fetch_enabled_filter_values(
        &self,
        resources: &[Resource],
    ) -> HashMap<String, Vec<Vec<FilterConfig>>> {
        let mut values: HashMap<String, Vec<Vec<FilterConfig>>> = HashMap::new();
        let Some(db_server) = &self.db_server else {
            return values;
        };
        for resource in resources {
            let Some(url) = resource.url() else {
                continue;
            };
            let mut config_lists = Vec::new();
            if self.filter_settings.type_enabled(SCENARIO_FILTER_TYPE) {
                match db_server.scenario_names(url) {
                    Ok(names) => {
                        let mut online: Vec<String> = names
                            .into_iter()
                            .filter(|name| {
                                self.filter_settings.online_status(
                                    &resource.label,
                                    SCENARIO_FILTER_TYPE,
                                    name,
                                )
                            })
                            .collect();
                        online.sort();
                        online.dedup();
                        if !online.is_empty() {
                            config_lists
                                .push(online.into_iter().map(FilterConfig::scenario).collect());
                        }
                    }
                    Err(e) => {
                        log::debug!("scenario listing failed for {}: {e}", resource.label);
                        continue;
                    }
                }
            }
            if self.filter_settings.type_enabled(ALTERNATIVE_FILTER_TYPE) {
                match db_server.alternative_names(url) {
                    Ok(names) => {
                        let online: Vec<String> = names
                            .into_iter()
                            .filter(|name| {
                                self.filter_settings.online_status(
                                    &resource.label,
                                    ALTERNATIVE_FILTER_TYPE,
                                    name,
                                )
                            })
                            .collect();
                        if !online.is_empty() {
                            // All online alternatives form one combined view.
                            config_lists.push(vec![FilterConfig::alternatives(online)]);
                        }
                    }
                    Err(e) => {
                        log::debug!("alternative listing failed for {}: {e}", resource.label);
                        continue;
                    }
                }
            }
            values.insert(resource.label.clone(), config_lists);
        }
        values
    }

    // --- Conversions ---

    /// Converts resources advertised through this connection forward.
    pub fn convert_forward_resources(&self, resources: &[Resource]) -> Result<Vec<Resource>> {
        let packaged = self.apply_use_datapackage(resources)?;
        Ok(self.apply_use_memory_db(&packaged))
    }

    /// Converts resources advertised through this connection backward.
    /// `siblings` are the other connections sharing this one's destination.
    pub fn convert_backward_resources(
        &self,
        resources: &[Resource],
        siblings: &[(String, i32)],
    ) -> Vec<Resource> {
        let ordered = self.apply_write_index(resources, siblings);
        self.apply_use_memory_db(&ordered)
    }

    /// Purges destination databases before anything writes to them.
    pub fn clean_up_backward_resources(&self, resources: &[Resource]) -> Result<()> {
        if !self.options.purge_before_writing {
            return Ok(());
        }
        let db_server = self
            .db_server
            .as_ref()
            .ok_or_else(|| anyhow!("connection {} has no DB server manager", self.name()))?;
        let logger = self
            .logger
            .as_ref()
            .ok_or_else(|| anyhow!("connection {} has no logger", self.name()))?;
        for resource in resources {
            if resource.kind != ResourceKind::Database {
                continue;
            }
            if let Some(url) = resource.url() {
                db_server
                    .purge_url(url, &self.options.purge_settings, logger)
                    .with_context(|| format!("purging {url} failed"))?;
            }
        }
        Ok(())
    }

    fn apply_use_memory_db(&self, resources: &[Resource]) -> Vec<Resource> {
        if !self.options.use_memory_db {
            return resources.to_vec();
        }
        resources
            .iter()
            .map(|r| {
                if r.kind == ResourceKind::Database {
                    r.clone_with(MetadataPatch {
                        memory: Some(true),
                        ..Default::default()
                    })
                } else {
                    r.clone()
                }
            })
            .collect()
    }

    fn apply_write_index(
        &self,
        resources: &[Resource],
        siblings: &[(String, i32)],
    ) -> Vec<Resource> {
        let precursors: BTreeSet<String> = siblings
            .iter()
            .filter(|(_, index)| *index < self.options.write_index)
            .map(|(name, _)| name.clone())
            .collect();
        resources
            .iter()
            .map(|r| {
                if r.kind == ResourceKind::Database {
                    r.clone_with(MetadataPatch {
                        current: Some(self.name()),
                        precursors: Some(precursors.clone()),
                        part_count: Some(PartCount::new()),
                        ..Default::default()
                    })
                } else {
                    r.clone()
                }
            })
            .collect()
    }

    fn apply_use_datapackage(&self, resources: &[Resource]) -> Result<Vec<Resource>> {
        if !self.options.use_datapackage {
            return Ok(resources.to_vec());
        }
        // Split CSVs from the rest of the resources.
        let mut final_resources = Vec::new();
        let mut csv_paths: Vec<PathBuf> = Vec::new();
        for resource in resources {
            if resource.hasfilepath() {
                let path = PathBuf::from(resource.path());
                let extension = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_ascii_lowercase());
                if extension.as_deref() == Some("csv") {
                    csv_paths.push(path);
                    continue;
                }
                if path.file_name().and_then(|n| n.to_str()) == Some("datapackage.json") {
                    continue;
                }
            }
            final_resources.push(resource.clone());
        }
        if csv_paths.is_empty() {
            return Ok(final_resources);
        }
        let base_path = datapackage_base_path(&csv_paths);
        let descriptor = build_datapackage_descriptor(&base_path, &csv_paths);
        let package_path = base_path.join("datapackage.json");
        std::fs::write(&package_path, serde_json::to_vec_pretty(&descriptor)?)
            .with_context(|| format!("writing {package_path:?} failed"))?;
        let provider = &resources[0].provider_name;
        let mut package_resource = file_resource(
            provider,
            &package_path.to_string_lossy(),
            Some(&format!("datapackage@{provider}")),
        );
        package_resource.metadata = resources[0].metadata.clone();
        final_resources.push(package_resource);
        Ok(final_resources)
    }

    // --- Dict round-trip ---

    pub fn from_dict(dict: &Value) -> Result<Self> {
        let parsed: ConnectionDict =
            serde_json::from_value(dict.clone()).context("bad connection dict")?;
        Ok(Self::new(
            parsed.from.0,
            parsed.from.1,
            parsed.to.0,
            parsed.to.1,
            parsed.options.unwrap_or_default(),
            parsed.filter_settings.unwrap_or_default(),
        ))
    }

    pub fn to_dict(&self) -> Value {
        let dict = ConnectionDict {
            name: Some(self.name()),
            from: (self.source.clone(), self.source_position.clone()),
            to: (self.destination.clone(), self.destination_position.clone()),
            options: if self.options == ConnectionOptions::default() {
                None
            } else {
                Some(self.options.clone())
            },
            filter_settings: Some(self.filter_settings.clone()),
        };
        serde_json::to_value(dict).unwrap_or(Value::Null)
    }
}

/// The directory the datapackage descriptor lands in: the parent of the
/// deepest path component the CSVs share.
fn datapackage_base_path(paths: &[PathBuf]) -> PathBuf {
    let mut common: Option<PathBuf> = None;
    for path in paths {
        common = Some(match common {
            None => path.clone(),
            Some(current) => {
                let shared: PathBuf = current
                    .components()
                    .zip(path.components())
                    .take_while(|(a, b)| a == b)
                    .map(|(a, _)| a.as_os_str().to_os_string())
                    .collect();
                shared
            }
        });
    }
    let common = common.unwrap_or_default();
    common
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or(common)
}

fn build_datapackage_descriptor(base_path: &Path, csv_paths: &[PathBuf]) -> Value {
    let resources: Vec<Value> = csv_paths
        .iter()
        .map(|path| {
            let relative = path
                .strip_prefix(base_path)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| path.clone());
            serde_json::json!({ "path": relative.to_string_lossy() })
        })
        .collect();
    serde_json::json!({
        "profile": "data-package",
        "resources": resources,
    })
}
