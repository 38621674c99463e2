// src/event.rs
//
// =============================================================================
// GRAPHLOOM: EVENT BUS & ITEM LOGGER
// =============================================================================
//
// The nervous system.
//
// Responsibilities:
// 1. Define the typed event vocabulary the caller consumes.
// 2. Carry events over a single multi-producer channel.
// 3. Tag per-item messages with item name and filter id before forwarding.
// 4. Run the synchronous prompt round-trip (ask once, cache the answer).

use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// 1. EVENT VOCABULARY
// ============================================================================

/// Every kind of event the engine can put on the bus. The wire names are the
/// snake_case strings callers match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExecStarted,
    ExecFinished,
    EventMsg,
    ProcessMsg,
    StandardExecutionMsg,
    PersistentExecutionMsg,
    KernelExecutionMsg,
    Flash,
    Prompt,
    ServerStatusMsg,
    DagExecFinished,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ExecStarted => "exec_started",
            EventKind::ExecFinished => "exec_finished",
            EventKind::EventMsg => "event_msg",
            EventKind::ProcessMsg => "process_msg",
            EventKind::StandardExecutionMsg => "standard_execution_msg",
            EventKind::PersistentExecutionMsg => "persistent_execution_msg",
            EventKind::KernelExecutionMsg => "kernel_execution_msg",
            EventKind::Flash => "flash",
            EventKind::Prompt => "prompt",
            EventKind::ServerStatusMsg => "server_status_msg",
            EventKind::DagExecFinished => "dag_exec_finished",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event on the bus: a kind plus a JSON payload.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
}

impl Event {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self { kind, payload }
    }
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

// ============================================================================
// 2. PROMPTS
// ============================================================================

#[derive(Debug, Clone)]
enum PromptState {
    Pending,
    Answered(String),
}

/// Per-run cache of prompt answers, shared by every logger. A question that
/// was already asked (by any prompter) is answered from the cache.
pub type AnsweredPrompts = Arc<Mutex<HashMap<String, PromptAnswer>>>;

#[derive(Debug, Clone)]
pub struct PromptAnswer(PromptState);

/// The reply side of one prompter: the engine pushes the caller's answer
/// here when `answer_prompt` is invoked.
pub struct PromptChannel {
    pub prompter_id: u64,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl PromptChannel {
    pub fn new(prompter_id: u64) -> (Self, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                prompter_id,
                receiver: tokio::sync::Mutex::new(rx),
            },
            tx,
        )
    }
}

// ============================================================================
// 3. THE ITEM LOGGER
// ============================================================================

type Slot = Box<dyn Fn(EventKind, &Value) + Send + Sync>;

struct LoggerInner {
    queue: EventSender,
    item_name: String,
    filter_id: Mutex<String>,
    silent: bool,
    slots: Mutex<Vec<Slot>>,
    prompt: Option<PromptChannel>,
    answered_prompts: AnsweredPrompts,
}

/// Per-item, filter-aware logger.
///
/// Message emitters tag payloads with the owning item's name and the current
/// filter id and forward them to the shared event queue, plus to any locally
/// connected slots. A *silent* logger (used for the backward sweep) drops
/// every message except prompts and flashes.
#[derive(Clone)]
pub struct ItemLogger {
    inner: Arc<LoggerInner>,
}

impl ItemLogger {
    pub fn new(
        queue: EventSender,
        item_name: impl Into<String>,
        prompt: Option<PromptChannel>,
        answered_prompts: AnsweredPrompts,
        silent: bool,
    ) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                queue,
                item_name: item_name.into(),
                filter_id: Mutex::new(String::new()),
                silent,
                slots: Mutex::new(Vec::new()),
                prompt,
                answered_prompts,
            }),
        }
    }

    pub fn item_name(&self) -> &str {
        &self.inner.item_name
    }

    pub fn is_silent(&self) -> bool {
        self.inner.silent
    }

    pub fn set_filter_id(&self, filter_id: &str) {
        let mut guard = self.inner.filter_id.lock().unwrap();
        *guard = filter_id.to_string();
    }

    pub fn filter_id(&self) -> String {
        self.inner.filter_id.lock().unwrap().clone()
    }

    /// Connects a local slot that observes every message this logger emits.
    pub fn connect_slot(&self, slot: impl Fn(EventKind, &Value) + Send + Sync + 'static) {
        self.inner.slots.lock().unwrap().push(Box::new(slot));
    }

    fn emit(&self, kind: EventKind, mut payload: Value) {
        if self.inner.silent {
            return;
        }
        if let Value::Object(map) = &mut payload {
            map.insert("filter_id".to_string(), json!(self.filter_id()));
            map.insert("item_name".to_string(), json!(self.inner.item_name));
        }
        for slot in self.inner.slots.lock().unwrap().iter() {
            slot(kind, &payload);
        }
        let _ = self.inner.queue.send(Event::new(kind, payload));
    }

    fn emit_text(&self, kind: EventKind, msg_type: &str, msg_text: &str) {
        self.emit(
            kind,
            json!({ "msg_type": msg_type, "msg_text": msg_text }),
        );
    }

    // --- Text messages ---

    pub fn msg(&self, text: &str) {
        self.emit_text(EventKind::EventMsg, "msg", text);
    }

    pub fn msg_success(&self, text: &str) {
        self.emit_text(EventKind::EventMsg, "msg_success", text);
    }

    pub fn msg_warning(&self, text: &str) {
        self.emit_text(EventKind::EventMsg, "msg_warning", text);
    }

    pub fn msg_error(&self, text: &str) {
        self.emit_text(EventKind::EventMsg, "msg_error", text);
    }

    pub fn msg_proc(&self, text: &str) {
        self.emit_text(EventKind::ProcessMsg, "msg", text);
    }

    pub fn msg_proc_error(&self, text: &str) {
        self.emit_text(EventKind::ProcessMsg, "msg_error", text);
    }

    // --- Structured execution messages ---

    pub fn msg_standard_execution(&self, payload: Value) {
        self.emit(EventKind::StandardExecutionMsg, payload);
    }

    pub fn msg_persistent_execution(&self, payload: Value) {
        self.emit(EventKind::PersistentExecutionMsg, payload);
    }

    pub fn msg_kernel_execution(&self, payload: Value) {
        self.emit(EventKind::KernelExecutionMsg, payload);
    }

    // --- Flash ---

    /// Flash is never silenced: the UI animates the link even during the
    /// backward sweep.
    pub fn flash(&self) {
        let _ = self.inner.queue.send(Event::new(
            EventKind::Flash,
            json!({ "item_name": self.inner.item_name }),
        ));
    }

    // --- Prompts ---

    /// Puts a prompt on the bus and blocks until the caller answers it.
    /// Identical prompts are asked at most once per engine run; later callers
    /// are served from the answer cache.
    pub async fn prompt(&self, data: Value) -> String {
        let Some(channel) = &self.inner.prompt else {
            // Loggers without a prompt channel (connections, jumps) cannot
            // ask questions.
            return String::new();
        };
        let key = data.to_string();
        let ask = {
            let mut answered = self.inner.answered_prompts.lock().unwrap();
            if answered.contains_key(&key) {
                false
            } else {
                answered.insert(key.clone(), PromptAnswer(PromptState::Pending));
                true
            }
        };
        if ask {
            let _ = self.inner.queue.send(Event::new(
                EventKind::Prompt,
                json!({ "prompter_id": channel.prompter_id, "data": data }),
            ));
            let answer = channel
                .receiver
                .lock()
                .await
                .recv()
                .await
                .unwrap_or_default();
            self.inner
                .answered_prompts
                .lock()
                .unwrap()
                .insert(key, PromptAnswer(PromptState::Answered(answer.clone())));
            return answer;
        }
        // Another prompter already asked; wait for its answer to land.
        loop {
            {
                let answered = self.inner.answered_prompts.lock().unwrap();
                if let Some(PromptAnswer(PromptState::Answered(answer))) = answered.get(&key) {
                    return answer.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
