// src/db.rs
//
// The database collaborator port.
//
// The engine never talks SQL. Everything database-shaped goes through these
// traits: listing the scenarios/alternatives a filterable resource offers,
// bringing up a short-lived local proxy server for one item execution, and
// purging a target before writing. Concrete implementations live outside
// this crate (and in tests/common for the test suite).

use crate::core::PartCount;
use crate::event::ItemLogger;
use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Write-ordering tag handed to the proxy when a database resource is opened.
/// `precursors` names the sibling connections that must commit first;
/// `part_count` is shared by every clone of the logical resource.
#[derive(Debug, Clone)]
pub struct WriteOrdering {
    pub id: String,
    pub part_count: PartCount,
    pub current: Option<String>,
    pub precursors: BTreeSet<String>,
}

/// Which database item types a purge should wipe. `None` purges everything.
pub type PurgeSettings = Option<HashMap<String, bool>>;

/// A live proxy server scoped to one resource open. Checked out on drop.
pub trait DbServerHandle: Send {
    /// URL the consuming process should talk to instead of the raw target.
    fn server_url(&self) -> &str;

    /// Registers this consumer with the write-ordering machinery.
    fn checkin(&self) -> Result<()>;

    /// Signals that this consumer committed its part.
    fn checkout(&self) -> Result<()>;
}

/// The manager that owns proxy servers for one engine run.
pub trait DbServerManager: Send + Sync {
    /// Brings up a proxy for `url` and returns its handle. `memory` asks for
    /// an in-memory replica; `ordering` carries the write-ordering tag.
    fn open_server(
        &self,
        url: &str,
        memory: bool,
        ordering: WriteOrdering,
    ) -> Result<Box<dyn DbServerHandle>>;

    /// Checkout without opening a server, for resources that were tagged but
    /// never written through.
    fn quick_checkout(&self, ordering: WriteOrdering) -> Result<()>;

    /// Wipes data from the database at `url` according to `settings`.
    fn purge_url(&self, url: &str, settings: &PurgeSettings, logger: &ItemLogger) -> Result<()>;

    /// Scenario names stored in the database at `url`.
    fn scenario_names(&self, url: &str) -> Result<Vec<String>>;

    /// Alternative names stored in the database at `url`.
    fn alternative_names(&self, url: &str) -> Result<Vec<String>>;
}

/// Shared handle stored in resource metadata so consumers anywhere in the
/// DAG can open their databases through the same manager.
pub type SharedDbServerManager = Arc<dyn DbServerManager>;

impl fmt::Debug for dyn DbServerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DbServerManager")
    }
}
