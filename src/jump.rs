// src/jump.rs
//
// =============================================================================
// GRAPHLOOM: JUMPS
// =============================================================================
//
// Conditional loop-back edges.
//
// A jump re-executes every item on the paths from its destination to its
// source for as long as its condition holds. The condition is external: a
// script fed to an interpreter on stdin, or a one-shot tool built from a
// specification. Either way the iteration counter rides along as the last
// command line argument.

use crate::core::FinishState;
use crate::event::ItemLogger;
use crate::resource::{
    expand_cmd_line_args, labelled_resource_args, make_cmd_line_arg, CmdLineArg, Resource,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

// ============================================================================
// 1. CONDITIONS
// ============================================================================

/// How a jump decides whether to iterate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JumpCondition {
    /// Script piped to the interpreter's stdin; exit code 0 means iterate.
    /// An empty script never iterates.
    #[serde(rename = "python-script")]
    PythonScript {
        #[serde(default)]
        script: String,
        #[serde(default)]
        specification: String,
    },
    /// One-shot tool built from a specification; SUCCESS means iterate.
    #[serde(rename = "tool-specification")]
    ToolSpecification {
        #[serde(default)]
        specification: String,
        #[serde(default)]
        script: String,
    },
}

impl Default for JumpCondition {
    fn default() -> Self {
        JumpCondition::PythonScript {
            script: "exit(1)".to_string(),
            specification: String::new(),
        }
    }
}

/// Runs tool-specification conditions. Implemented by the engine on top of
/// the item registry.
#[async_trait]
pub trait ConditionToolRunner: Send + Sync {
    async fn execute_condition_tool(
        &self,
        jump_name: &str,
        specification: &str,
        cmd_line_args: Vec<CmdLineArg>,
        forward_resources: &[Resource],
        backward_resources: &[Resource],
    ) -> FinishState;
}

/// Collaborators a condition evaluation needs from the engine.
pub struct JumpConditionContext<'a> {
    pub interpreter: String,
    pub tool_runner: &'a dyn ConditionToolRunner,
}

// ============================================================================
// 2. THE JUMP
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JumpDict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    from: (String, String),
    to: (String, String),
    condition: JumpCondition,
    #[serde(default)]
    cmd_line_args: Vec<Value>,
}

#[derive(Default)]
struct JumpState {
    resources_from_source: Vec<Resource>,
    resources_from_destination: Vec<Resource>,
}

/// A conditional jump between two project items.
pub struct Jump {
    pub source: String,
    pub source_position: String,
    pub destination: String,
    pub destination_position: String,
    pub condition: JumpCondition,
    pub cmd_line_args: Vec<CmdLineArg>,
    /// The loop body: every item on a simple path from destination to
    /// source, endpoints included. Filled in by the engine.
    pub item_names: BTreeSet<String>,
    state: Mutex<JumpState>,
    logger: Option<ItemLogger>,
}

impl PartialEq for Jump {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
            && self.source_position == other.source_position
            && self.destination == other.destination
            && self.destination_position == other.destination_position
            && self.condition == other.condition
            && self.cmd_line_args == other.cmd_line_args
    }
}

impl std::fmt::Debug for Jump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jump")
            .field("source", &self.source)
            .field("source_position", &self.source_position)
            .field("destination", &self.destination)
            .field("destination_position", &self.destination_position)
            .field("condition", &self.condition)
            .field("cmd_line_args", &self.cmd_line_args)
            .field("item_names", &self.item_names)
            .finish()
    }
}

impl Jump {
    pub fn new(
        source: impl Into<String>,
        source_position: impl Into<String>,
        destination: impl Into<String>,
        destination_position: impl Into<String>,
        condition: JumpCondition,
        cmd_line_args: Vec<CmdLineArg>,
    ) -> Self {
        Self {
            source: source.into(),
            source_position: source_position.into(),
            destination: destination.into(),
            destination_position: destination_position.into(),
            condition,
            cmd_line_args,
            item_names: BTreeSet::new(),
            state: Mutex::new(JumpState::default()),
            logger: None,
        }
    }

    pub fn name(&self) -> String {
        format!("from {} to {}", self.source, self.destination)
    }

    pub fn make_logger(&mut self, logger: ItemLogger) {
        self.logger = Some(logger);
    }

    pub fn ready_to_execute(&self) -> bool {
        match &self.condition {
            JumpCondition::PythonScript { .. } => true,
            JumpCondition::ToolSpecification { specification, .. } => !specification.is_empty(),
        }
    }

    pub fn emit_flash(&self) {
        if let Some(logger) = &self.logger {
            logger.flash();
        }
    }

    pub fn receive_resources_from_source(&self, resources: Vec<Resource>) {
        self.state.lock().unwrap().resources_from_source = resources;
    }

    pub fn receive_resources_from_destination(&self, resources: Vec<Resource>) {
        self.state.lock().unwrap().resources_from_destination = resources;
    }

    fn snapshot_resources(&self) -> (Vec<Resource>, Vec<Resource>) {
        let state = self.state.lock().unwrap();
        (
            state.resources_from_source.clone(),
            state.resources_from_destination.clone(),
        )
    }

    /// Evaluates the loop condition for the given iteration counter.
    pub async fn is_condition_true(
        &self,
        iteration_counter: u32,
        context: &JumpConditionContext<'_>,
    ) -> bool {
        match &self.condition {
            JumpCondition::PythonScript { script, .. } => self
                .evaluate_script(script, iteration_counter, context)
                .await
                .unwrap_or_else(|e| {
                    if let Some(logger) = &self.logger {
                        logger.msg_error(&format!("Loop condition of {} failed: {e}", self.name()));
                    }
                    false
                }),
            JumpCondition::ToolSpecification { specification, .. } => {
                let (forward, backward) = self.snapshot_resources();
                let mut args = self.cmd_line_args.clone();
                args.push(CmdLineArg::Literal(iteration_counter.to_string()));
                context
                    .tool_runner
                    .execute_condition_tool(&self.name(), specification, args, &forward, &backward)
                    .await
                    == FinishState::Success
            }
        }
    }

    async fn evaluate_script(
        &self,
        script: &str,
        iteration_counter: u32,
        context: &JumpConditionContext<'_>,
    ) -> Result<bool> {
        if script.trim().is_empty() {
            return Ok(false);
        }
        let (forward, backward) = self.snapshot_resources();
        let mut resources = forward;
        resources.extend(backward);
        // The labelled args guard keeps database proxies alive for the whole
        // script run.
        let labelled = labelled_resource_args(&resources, false, false)?;
        let mut args = self.cmd_line_args.clone();
        args.push(CmdLineArg::Literal(iteration_counter.to_string()));
        let expanded = match &self.logger {
            Some(logger) => expand_cmd_line_args(&args, labelled.values(), logger),
            None => args.iter().map(|a| a.to_string()).collect(),
        };
        let mut child = Command::new(&context.interpreter)
            .arg("-")
            .args(&expanded)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {} failed", context.interpreter))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            drop(stdin);
        }
        let output = child.wait_with_output().await?;
        if let Some(logger) = &self.logger {
            if !output.stdout.is_empty() {
                logger.msg_proc(&String::from_utf8_lossy(&output.stdout));
            }
            if !output.stderr.is_empty() {
                logger.msg_proc_error(&String::from_utf8_lossy(&output.stderr));
            }
        }
        Ok(output.status.success())
    }

    // --- Dict round-trip ---

    pub fn from_dict(dict: &Value) -> Result<Self> {
        let parsed: JumpDict = serde_json::from_value(dict.clone()).context("bad jump dict")?;
        let cmd_line_args = parsed
            .cmd_line_args
            .iter()
            .map(make_cmd_line_arg)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(
            parsed.from.0,
            parsed.from.1,
            parsed.to.0,
            parsed.to.1,
            parsed.condition,
            cmd_line_args,
        ))
    }

    pub fn to_dict(&self) -> Value {
        let dict = JumpDict {
            name: Some(self.name()),
            from: (self.source.clone(), self.source_position.clone()),
            to: (self.destination.clone(), self.destination_position.clone()),
            condition: self.condition.clone(),
            cmd_line_args: self
                .cmd_line_args
                .iter()
                .map(|arg| serde_json::to_value(arg).unwrap_or(Value::Null))
                .collect(),
        };
        serde_json::to_value(dict).unwrap_or(Value::Null)
    }
}
