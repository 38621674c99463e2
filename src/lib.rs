// src/lib.rs
//
// =============================================================================
// GRAPHLOOM: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.

// 1. Declare Modules
pub mod connection;
pub mod core;
pub mod dag;
pub mod db;
pub mod engine;
pub mod event;
pub mod filter_config;
pub mod item;
pub mod jump;
pub mod limiter;
pub mod pipeline;
pub mod resource;
pub mod scheduler;

// 2. Re-exports (The Public API)
// These allow `use graphloom::Engine` or `use graphloom::Resource` to work
// for embedders.

pub use crate::connection::{Connection, ConnectionOptions, FilterSettings};
pub use crate::core::{
    AppSettings, EngineInitFailed, EngineState, ExecutionDirection, FinishState, PartCount,
};
pub use crate::db::{DbServerHandle, DbServerManager, SharedDbServerManager, WriteOrdering};
pub use crate::engine::{Engine, EngineRequest};
pub use crate::event::{Event, EventKind, ItemLogger};
pub use crate::item::{ExecutableItem, ExecutionContext, ItemFactory, ItemRegistry};
pub use crate::jump::{Jump, JumpCondition};
pub use crate::limiter::{ProcessLimit, ProcessLimits, ProcessSemaphore};
pub use crate::resource::{
    database_resource, directory_resource, file_resource, file_resource_in_pack, url_resource,
    CmdLineArg, Resource, ResourceKind, ResourceMetadata,
};
