// src/core.rs
//
// =============================================================================
// GRAPHLOOM: CORE SCHEMA AUTHORITY
// =============================================================================
//
// The shared vocabulary of the engine.
//
// This file defines the strict data contracts every other module speaks:
// execution directions, finish states, the engine state machine, the error
// taxonomy raised from engine construction, and the settings lookup handed
// down to items.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// 1. EXECUTION DIRECTIONS & STATES
// ============================================================================

/// The sweep a solid belongs to. Every project item executes once backward
/// (advertising resources to its predecessors) and once forward per filtered
/// run (consuming resources from its predecessors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionDirection {
    Forward,
    Backward,
    /// Used for bookkeeping items that are constructed outside either sweep
    /// (readiness probes, loop update hooks).
    None,
}

impl fmt::Display for ExecutionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionDirection::Forward => "FORWARD",
            ExecutionDirection::Backward => "BACKWARD",
            ExecutionDirection::None => "NONE",
        };
        write!(f, "{name}")
    }
}

/// How one item execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishState {
    Success,
    Failure,
    Skipped,
    Excluded,
    Stopped,
    NeverFinished,
}

impl fmt::Display for FinishState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FinishState::Success => "SUCCESS",
            FinishState::Failure => "FAILURE",
            FinishState::Skipped => "SKIPPED",
            FinishState::Excluded => "EXCLUDED",
            FinishState::Stopped => "STOPPED",
            FinishState::NeverFinished => "NEVER_FINISHED",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle of one engine run. Terminal states are `UserStopped`, `Failed`
/// and `Completed`; the final `dag_exec_finished` event carries one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Sleeping,
    Running,
    UserStopped,
    Failed,
    Completed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Sleeping => "SLEEPING",
            EngineState::Running => "RUNNING",
            EngineState::UserStopped => "USER_STOPPED",
            EngineState::Failed => "FAILED",
            EngineState::Completed => "COMPLETED",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// 2. INIT ERRORS
// ============================================================================

/// Raised synchronously from engine construction. Anything that goes wrong
/// after construction is reported through the event stream instead.
#[derive(Debug, Error)]
pub enum EngineInitFailed {
    #[error("Invalid DAG")]
    InvalidDag,

    #[error("DAG contains unconnected items.")]
    UnconnectedDag,

    #[error("{0}")]
    WriteIndexConflict(String),

    #[error("Link {name} is not ready for execution. {notifications}")]
    ConnectionNotReady { name: String, notifications: String },

    #[error("Jump {0} is not ready for execution.")]
    JumpNotReady(String),

    #[error("{0} cannot have the same source as {1}.")]
    SharedJumpSource(String, String),

    #[error("{0} cannot partially overlap {1}.")]
    OverlappingJumps(String, String),

    #[error("Loop destination '{0}' not found in DAG")]
    JumpDestinationMissing(String),

    #[error("Loop source '{0}' not found in DAG")]
    JumpSourceMissing(String),

    #[error("Cannot loop in forward direction.")]
    ForwardJump,

    #[error("Cannot loop between DAG branches.")]
    JumpAcrossBranches,

    #[error("Unknown item type '{0}'.")]
    UnknownItemType(String),

    #[error("Malformed project description: {0}")]
    BadRequest(String),
}

// ============================================================================
// 3. SETTINGS
// ============================================================================

/// String-keyed settings consulted by the engine and by items. The engine
/// itself only reads the process limiter keys; everything else is opaque
/// pass-through for item implementations.
#[derive(Debug, Clone, Default)]
pub struct AppSettings {
    values: HashMap<String, Value>,
}

impl AppSettings {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Returns the setting as a string, falling back to `default` when the
    /// key is missing or null.
    pub fn str_value(&self, key: &str, default: &str) -> String {
        match self.values.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => default.to_string(),
        }
    }
}

/// Resolves the interpreter used for script-based jump conditions.
pub fn resolve_python_interpreter(settings: &AppSettings) -> String {
    let configured = settings.str_value("appSettings/pythonPath", "");
    if !configured.is_empty() {
        return configured;
    }
    "python3".to_string()
}

// ============================================================================
// 4. SHARED COUNTERS & SMALL HELPERS
// ============================================================================

/// Counter for the parts of a multi-part database write.
///
/// Cloning yields a handle to the *same* counter: every clone of a resource
/// must observe the writes registered through any of its siblings. The DB
/// proxy decrements as parts commit; the engine only increments.
#[derive(Debug, Clone, Default)]
pub struct PartCount(Arc<AtomicI64>);

impl PartCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    /// True when both handles alias one underlying counter.
    pub fn same_counter(&self, other: &PartCount) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for PartCount {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl Eq for PartCount {}

/// Returns the 'short name' version of given name (directory-safe).
pub fn shorten(name: &str) -> String {
    name.to_lowercase().replace(' ', "_")
}

/// Timestamp tagged onto execution filters, one per engine run.
pub fn create_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Timestamp suitable for log file names.
pub fn create_log_file_timestamp() -> String {
    chrono::Local::now().format("%Y%m%dT%H%M%S").to_string()
}

/// Inverts a mapping of list values: keys become listed items, values become
/// the keys that listed them.
pub fn inverted(input: &HashMap<String, Vec<String>>) -> HashMap<String, Vec<String>> {
    let mut output: HashMap<String, Vec<String>> = HashMap::new();
    for (key, values) in input {
        for value in values {
            output.entry(value.clone()).or_default().push(key.clone());
        }
    }
    output
}
