// src/resource.rs
//
// =============================================================================
// GRAPHLOOM: PROJECT ITEM RESOURCES
// =============================================================================
//
// The currency of the DAG.
//
// Responsibilities:
// 1. Typed handles to files, directories, file packs, databases and URLs.
// 2. Clone semantics: clones share the identifier and the part counter,
//    everything else is copied.
// 3. Scoped opening: database resources go through the DB proxy, file
//    resources resolve to local paths.
// 4. Command line argument expansion for items and jump conditions.

use crate::core::PartCount;
use crate::db::{DbServerHandle, SharedDbServerManager, WriteOrdering};
use crate::event::ItemLogger;
use crate::filter_config::{self, clear_filter_configs, urls_equal, FilterConfig};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// 1. RESOURCE KINDS & METADATA
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    File,
    Directory,
    FilePack,
    Database,
    Url,
}

/// Metadata carried by a resource. Cloning copies the filter stack and the
/// ordering fields but *aliases* the part counter and the DB server manager.
#[derive(Debug, Clone, Default)]
pub struct ResourceMetadata {
    /// Ordered filter configs applied to this resource's view.
    pub filter_stack: Vec<FilterConfig>,
    /// Human readable id of the filtered run that produced this resource.
    pub filter_id: Option<String>,
    /// Database schema, for database resources that have one.
    pub schema: Option<String>,
    /// Shared write-part counter, present on write-ordered databases.
    pub part_count: Option<PartCount>,
    /// Name of the connection currently writing.
    pub current: Option<String>,
    /// Sibling connections that must commit before this one.
    pub precursors: BTreeSet<String>,
    /// Ask the proxy for an in-memory replica.
    pub memory: bool,
    /// Proxy manager for this engine run. Not part of resource identity.
    pub db_server: Option<SharedDbServerManager>,
}

impl PartialEq for ResourceMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.filter_stack == other.filter_stack
            && self.filter_id == other.filter_id
            && self.schema == other.schema
            && self.part_count == other.part_count
            && self.current == other.current
            && self.precursors == other.precursors
            && self.memory == other.memory
    }
}

/// Metadata fields a clone may override. Everything left `None` is inherited
/// from the original.
#[derive(Default)]
pub struct MetadataPatch {
    pub filter_stack: Option<Vec<FilterConfig>>,
    pub filter_id: Option<String>,
    pub part_count: Option<PartCount>,
    pub current: Option<String>,
    pub precursors: Option<BTreeSet<String>>,
    pub memory: Option<bool>,
}

// ============================================================================
// 2. THE RESOURCE
// ============================================================================

/// A resource made available by one project item and consumed by another.
///
/// Resources are immutable apart from filter-config application during the
/// clone flows; all derived variants are produced through [`Resource::clone_with`].
#[derive(Clone)]
pub struct Resource {
    pub provider_name: String,
    pub kind: ResourceKind,
    pub label: String,
    url: Option<String>,
    pub metadata: ResourceMetadata,
    filterable: bool,
    identifier: String,
}

impl Resource {
    pub fn new(
        provider_name: impl Into<String>,
        kind: ResourceKind,
        label: impl Into<String>,
        url: Option<String>,
        metadata: ResourceMetadata,
        filterable: bool,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            kind,
            label: label.into(),
            url,
            metadata,
            filterable,
            identifier: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Clones this resource. The clone shares the identifier and the part
    /// counter with the original; `patch` overrides selected metadata.
    pub fn clone_with(&self, patch: MetadataPatch) -> Resource {
        let mut clone = self.clone();
        if let Some(stack) = patch.filter_stack {
            clone.metadata.filter_stack = stack;
        }
        if let Some(filter_id) = patch.filter_id {
            clone.metadata.filter_id = Some(filter_id);
        }
        if let Some(part_count) = patch.part_count {
            clone.metadata.part_count = Some(part_count);
        }
        if let Some(current) = patch.current {
            clone.metadata.current = Some(current);
        }
        if let Some(precursors) = patch.precursors {
            clone.metadata.precursors = precursors;
        }
        if let Some(memory) = patch.memory {
            clone.metadata.memory = memory;
        }
        clone
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Rewrites the URL by appending a filter config to its query string.
    pub fn apply_filter_config(&mut self, config: &FilterConfig) {
        if let Some(url) = &self.url {
            self.url = Some(filter_config::append_filter_config(url, config));
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn filterable(&self) -> bool {
        self.filterable
    }

    /// Resource path in local syntax, parsed from the URL.
    pub fn path(&self) -> String {
        self.url
            .as_deref()
            .map(filter_config::url_path)
            .unwrap_or_default()
    }

    pub fn scheme(&self) -> &str {
        self.url
            .as_deref()
            .map(filter_config::url_scheme)
            .unwrap_or("")
    }

    pub fn hasfilepath(&self) -> bool {
        if self.url.is_none() {
            return false;
        }
        matches!(
            self.kind,
            ResourceKind::File | ResourceKind::Directory | ResourceKind::FilePack
        ) || (self.kind == ResourceKind::Database && self.scheme() == "sqlite")
    }

    /// The string handed to command lines: URL for databases, path otherwise.
    pub fn arg(&self) -> String {
        if self.kind == ResourceKind::Database {
            self.url.clone().unwrap_or_default()
        } else {
            self.path()
        }
    }

    fn write_ordering(&self) -> WriteOrdering {
        WriteOrdering {
            id: self.identifier.clone(),
            part_count: self.metadata.part_count.clone().unwrap_or_default(),
            current: self.metadata.current.clone(),
            precursors: self.metadata.precursors.clone(),
        }
    }

    /// Opens the resource for consumption.
    ///
    /// Databases are served through a short-lived proxy; the returned handle
    /// carries the proxy URL and checks out on drop when `db_checkout` is
    /// set. Files and directories resolve to their local path, generic URLs
    /// pass through.
    pub fn open(&self, db_checkin: bool, db_checkout: bool) -> Result<OpenedResource> {
        if self.kind == ResourceKind::Database {
            let manager = self
                .metadata
                .db_server
                .as_ref()
                .ok_or_else(|| anyhow!("resource '{}' has no DB server manager", self.label))?;
            let url = self
                .url
                .as_deref()
                .ok_or_else(|| anyhow!("database resource '{}' has no URL", self.label))?;
            let server =
                manager.open_server(url, self.metadata.memory, self.write_ordering())?;
            if db_checkin {
                server.checkin()?;
            }
            return Ok(OpenedResource {
                value: server.server_url().to_string(),
                server: Some(server),
                checkout_on_drop: db_checkout,
            });
        }
        let value = if self.kind == ResourceKind::Url {
            self.url.clone().unwrap_or_default()
        } else if self.hasfilepath() {
            self.path()
        } else {
            String::new()
        };
        Ok(OpenedResource {
            value,
            server: None,
            checkout_on_drop: false,
        })
    }

    /// Checkout without opening, for tagged databases that were never
    /// written through.
    pub fn quick_db_checkout(&self) -> Result<()> {
        if self.kind != ResourceKind::Database {
            return Ok(());
        }
        let manager = self
            .metadata
            .db_server
            .as_ref()
            .ok_or_else(|| anyhow!("resource '{}' has no DB server manager", self.label))?;
        manager.quick_checkout(self.write_ordering())
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        let urls_match = match (&self.url, &other.url) {
            (Some(left), Some(right)) => urls_equal(left, right),
            (None, None) => true,
            _ => false,
        };
        self.provider_name == other.provider_name
            && self.kind == other.kind
            && urls_match
            && self.metadata == other.metadata
            && self.filterable == other.filterable
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("provider", &self.provider_name)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("url", &self.url)
            .field("filterable", &self.filterable)
            .finish()
    }
}

/// A resource opened for the duration of one consumption. For databases the
/// proxy stays up while this value lives and checks out on drop.
pub struct OpenedResource {
    value: String,
    server: Option<Box<dyn DbServerHandle>>,
    checkout_on_drop: bool,
}

impl OpenedResource {
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl Drop for OpenedResource {
    fn drop(&mut self) {
        if self.checkout_on_drop {
            if let Some(server) = &self.server {
                if let Err(e) = server.checkout() {
                    log::warn!("DB checkout failed: {e}");
                }
            }
        }
    }
}

// ============================================================================
// 3. CONSTRUCTORS
// ============================================================================

/// Constructs a database resource. The label defaults to the URL with any
/// embedded filter configs stripped.
pub fn database_resource(
    provider_name: &str,
    url: &str,
    label: Option<&str>,
    filterable: bool,
    schema: Option<&str>,
) -> Resource {
    let label = label
        .map(str::to_string)
        .unwrap_or_else(|| clear_filter_configs(url));
    let metadata = ResourceMetadata {
        schema: schema.map(str::to_string),
        ..Default::default()
    };
    Resource::new(
        provider_name,
        ResourceKind::Database,
        label,
        Some(url.to_string()),
        metadata,
        filterable,
    )
}

/// Constructs a generic URL resource.
pub fn url_resource(provider_name: &str, url: &str, label: &str, schema: Option<&str>) -> Resource {
    let metadata = ResourceMetadata {
        schema: schema.map(str::to_string),
        ..Default::default()
    };
    Resource::new(
        provider_name,
        ResourceKind::Url,
        label,
        Some(url.to_string()),
        metadata,
        false,
    )
}

fn file_url(path: &str) -> String {
    if path.starts_with('/') {
        format!("file://{path}")
    } else {
        format!("file:///{path}")
    }
}

/// Constructs a file resource. The label defaults to the path.
pub fn file_resource(provider_name: &str, file_path: &str, label: Option<&str>) -> Resource {
    Resource::new(
        provider_name,
        ResourceKind::File,
        label.unwrap_or(file_path),
        Some(file_url(file_path)),
        ResourceMetadata::default(),
        false,
    )
}

/// Constructs a directory resource. The label defaults to the path.
pub fn directory_resource(provider_name: &str, path: &str, label: Option<&str>) -> Resource {
    Resource::new(
        provider_name,
        ResourceKind::Directory,
        label.unwrap_or(path),
        Some(file_url(path)),
        ResourceMetadata::default(),
        false,
    )
}

/// Constructs a transient file resource: the label is fixed, the file may
/// not exist yet.
pub fn transient_file_resource(
    provider_name: &str,
    label: &str,
    file_path: Option<&str>,
) -> Resource {
    Resource::new(
        provider_name,
        ResourceKind::File,
        label,
        file_path.map(file_url),
        ResourceMetadata::default(),
        false,
    )
}

/// Constructs a file resource that belongs to a pack identified by label.
pub fn file_resource_in_pack(
    provider_name: &str,
    label: &str,
    file_path: Option<&str>,
) -> Resource {
    Resource::new(
        provider_name,
        ResourceKind::FilePack,
        label,
        file_path.map(file_url),
        ResourceMetadata::default(),
        false,
    )
}

// ============================================================================
// 4. PACKS & LABELLED ARGUMENTS
// ============================================================================

/// Splits resources into single resources and packs keyed by label.
pub fn extract_packs(
    resources: &[Resource],
) -> (Vec<Resource>, HashMap<String, Vec<Resource>>) {
    let mut singles = Vec::new();
    let mut packs: HashMap<String, Vec<Resource>> = HashMap::new();
    for resource in resources {
        if resource.kind != ResourceKind::FilePack {
            singles.push(resource.clone());
        } else {
            packs.entry(resource.label.clone()).or_default().push(resource.clone());
        }
    }
    (singles, packs)
}

/// Maps resource labels to file paths for resources that have one.
pub fn labelled_resource_filepaths(resources: &[Resource]) -> HashMap<String, String> {
    resources
        .iter()
        .filter(|r| r.hasfilepath())
        .map(|r| (r.label.clone(), r.path()))
        .collect()
}

// ============================================================================
// 5. COMMAND LINE ARGUMENTS
// ============================================================================

/// Command line argument for items and jump conditions: either a literal or
/// a resource label replaced by the resource's URL/path at expansion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "arg", rename_all = "lowercase")]
pub enum CmdLineArg {
    Literal(String),
    Resource(String),
}

impl fmt::Display for CmdLineArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmdLineArg::Literal(arg) | CmdLineArg::Resource(arg) => f.write_str(arg),
        }
    }
}

/// Deserializes an argument: bare strings become literals, dicts carry an
/// explicit type.
pub fn make_cmd_line_arg(spec: &Value) -> Result<CmdLineArg> {
    match spec {
        Value::String(s) => Ok(CmdLineArg::Literal(s.clone())),
        Value::Object(_) => {
            serde_json::from_value(spec.clone()).map_err(|e| anyhow!("bad command line argument: {e}"))
        }
        other => Err(anyhow!("bad command line argument: {other}")),
    }
}

/// Opened resources keyed by label, ready for argument expansion. The guards
/// keep database proxies alive until the value is dropped.
pub struct LabelledArgs {
    values: HashMap<String, Vec<String>>,
    _guards: Vec<OpenedResource>,
}

impl LabelledArgs {
    pub fn values(&self) -> &HashMap<String, Vec<String>> {
        &self.values
    }
}

/// Opens every resource and maps labels to the resulting args. Packs map to
/// one arg per member.
pub fn labelled_resource_args(
    resources: &[Resource],
    db_checkin: bool,
    db_checkout: bool,
) -> Result<LabelledArgs> {
    let mut values: HashMap<String, Vec<String>> = HashMap::new();
    let mut guards = Vec::new();
    let (singles, packs) = extract_packs(resources);
    for resource in &singles {
        let opened = resource.open(db_checkin, db_checkout)?;
        values.insert(resource.label.clone(), vec![opened.as_str().to_string()]);
        guards.push(opened);
    }
    for (label, members) in &packs {
        let mut args = Vec::new();
        for member in members {
            let opened = member.open(db_checkin, db_checkout)?;
            args.push(opened.as_str().to_string());
            guards.push(opened);
        }
        values.insert(label.clone(), args);
    }
    Ok(LabelledArgs {
        values,
        _guards: guards,
    })
}

/// Expands command line arguments, replacing resource labels by URLs/paths.
/// Labels with no matching resource are dropped with a warning.
pub fn expand_cmd_line_args(
    args: &[CmdLineArg],
    label_to_arg: &HashMap<String, Vec<String>>,
    logger: &ItemLogger,
) -> Vec<String> {
    let mut expanded = Vec::new();
    for arg in args {
        match arg {
            CmdLineArg::Literal(text) => expanded.push(text.clone()),
            CmdLineArg::Resource(label) => match label_to_arg.get(label) {
                Some(values) if values.iter().all(|v| !v.is_empty()) => {
                    expanded.extend(values.iter().cloned());
                }
                _ => {
                    logger.msg_warning(&format!("No resources matching argument '{label}'."));
                }
            },
        }
    }
    expanded
}
