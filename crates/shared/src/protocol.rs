use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{DeltaPath, RunId, SessionId};

/// Payload of one UI-change record. `NewElement` fully replaces whatever
/// the browser renders at the delta path; `AddRows` grows an existing
/// tabular element in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DeltaPayload {
    NewElement { element: Value },
    AddRows { rows: Vec<Value> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub path: DeltaPath,
    pub payload: DeltaPayload,
}

impl Delta {
    pub fn new_element(path: DeltaPath, element: Value) -> Self {
        Self {
            path,
            payload: DeltaPayload::NewElement { element },
        }
    }

    pub fn add_rows(path: DeltaPath, rows: Vec<Value>) -> Self {
        Self {
            path,
            payload: DeltaPayload::AddRows { rows },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    StoppedEarly,
    CompletedWithError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlEvent {
    ScriptStarted {
        run_id: RunId,
    },
    ScriptFinished {
        run_id: RunId,
        outcome: RunOutcome,
    },
    RerunTriggered {
        run_id: RunId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStatus {
        session_id: SessionId,
        run_count: u64,
        active: bool,
        connected_at: DateTime<Utc>,
    },
}

/// The discriminated envelope the browser receives. Emission order is the
/// order the browser must apply them; the single place messages are
/// interpreted matches exhaustively on this enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutgoingMessage {
    Delta(Delta),
    CachedRef { hash: String, path: DeltaPath },
    Session(SessionEvent),
    Control(ControlEvent),
}

impl OutgoingMessage {
    pub fn delta_path(&self) -> Option<&DeltaPath> {
        match self {
            OutgoingMessage::Delta(delta) => Some(&delta.path),
            OutgoingMessage::CachedRef { path, .. } => Some(path),
            OutgoingMessage::Session(_) | OutgoingMessage::Control(_) => None,
        }
    }
}

/// Inbound frames from a connected browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    WidgetUpdate { values: HashMap<String, Value> },
    Rerun,
    Stop,
    ClearCache,
}

/// Builds the element payload used to render a recovered script failure in
/// place, so the session survives a bad run.
pub fn exception_element(message: &str, detail: Option<&str>) -> Value {
    serde_json::json!({
        "kind": "exception",
        "message": message,
        "detail": detail,
    })
}
