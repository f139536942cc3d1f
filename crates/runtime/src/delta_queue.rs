use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use shared::{
    domain::DeltaPath,
    protocol::{DeltaPayload, OutgoingMessage},
};
use serde_json::Value;
use tracing::warn;

#[derive(Default, Clone)]
struct QueueInner {
    items: Vec<OutgoingMessage>,
    /// Index of the pending delta for each path. At most one pending delta
    /// per path exists at any time.
    by_path: HashMap<DeltaPath, usize>,
}

/// Ordered queue of pending outgoing messages for one session. The worker
/// thread produces, the event loop consumes; one mutex guards both sides.
#[derive(Default)]
pub struct DeltaQueue {
    inner: Mutex<QueueInner>,
}

impl DeltaQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message, composing same-path deltas: a full replacement
    /// overwrites the queued delta outright, and a row append merges into
    /// the queued payload. Control and session messages never compose.
    pub fn enqueue(&self, message: OutgoingMessage) {
        let mut inner = self.lock();

        let path = match &message {
            OutgoingMessage::Delta(delta) => Some(delta.path.clone()),
            _ => None,
        };
        let Some(path) = path else {
            inner.items.push(message);
            return;
        };
        let Some(&slot) = inner.by_path.get(&path) else {
            let slot = inner.items.len();
            inner.items.push(message);
            inner.by_path.insert(path, slot);
            return;
        };

        let OutgoingMessage::Delta(new_delta) = message else {
            unreachable!("by_path only indexes deltas");
        };
        match new_delta.payload {
            DeltaPayload::NewElement { .. } => {
                // Last write wins; the queued slot keeps its position.
                inner.items[slot] = OutgoingMessage::Delta(new_delta);
            }
            DeltaPayload::AddRows { rows } => match &mut inner.items[slot] {
                OutgoingMessage::Delta(existing) => match &mut existing.payload {
                    DeltaPayload::NewElement { element } => merge_rows(element, rows),
                    DeltaPayload::AddRows { rows: pending } => pending.extend(rows),
                },
                _ => unreachable!("by_path only indexes deltas"),
            },
        }
    }

    /// Drains every pending message in emission order.
    pub fn flush(&self) -> Vec<OutgoingMessage> {
        let mut inner = self.lock();
        inner.by_path.clear();
        std::mem::take(&mut inner.items)
    }

    /// Deep copy for a newly attached consumer; the copy's pending state is
    /// independent of this queue from here on.
    pub fn deep_clone(&self) -> Self {
        let inner = self.lock();
        Self {
            inner: Mutex::new(inner.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        // A poisoning panic cannot happen while the lock is held (no user
        // code runs under it), but the worker survives script panics, so
        // recover rather than propagate.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn merge_rows(element: &mut Value, rows: Vec<Value>) {
    // Only a full table (an element already carrying a rows array) can
    // absorb appended rows.
    match element.as_object_mut().and_then(|object| object.get_mut("rows")) {
        Some(Value::Array(existing)) => existing.extend(rows),
        _ => warn!("add_rows targeted a non-tabular element; rows dropped"),
    }
}

#[cfg(test)]
mod tests {
    use shared::{
        domain::RunId,
        protocol::{ControlEvent, Delta, RunOutcome},
    };

    use super::*;

    fn element(path: Vec<u32>, body: &str) -> OutgoingMessage {
        OutgoingMessage::Delta(Delta::new_element(
            DeltaPath(path),
            serde_json::json!({"kind": "text", "body": body}),
        ))
    }

    #[test]
    fn same_path_replacement_keeps_one_record() {
        let queue = DeltaQueue::new();
        queue.enqueue(element(vec![0], "first"));
        queue.enqueue(element(vec![1], "other"));
        queue.enqueue(element(vec![0], "second"));
        queue.enqueue(element(vec![0], "third"));

        let flushed = queue.flush();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0], element(vec![0], "third"));
        assert_eq!(flushed[1], element(vec![1], "other"));
    }

    #[test]
    fn add_rows_merges_into_queued_table() {
        let queue = DeltaQueue::new();
        queue.enqueue(OutgoingMessage::Delta(Delta::new_element(
            DeltaPath(vec![0]),
            serde_json::json!({"kind": "table", "rows": [{"i": 1}]}),
        )));
        queue.enqueue(OutgoingMessage::Delta(Delta::add_rows(
            DeltaPath(vec![0]),
            vec![serde_json::json!({"i": 2}), serde_json::json!({"i": 3})],
        )));

        let flushed = queue.flush();
        assert_eq!(flushed.len(), 1);
        let OutgoingMessage::Delta(delta) = &flushed[0] else {
            panic!("expected delta");
        };
        let DeltaPayload::NewElement { element } = &delta.payload else {
            panic!("expected merged full table");
        };
        assert_eq!(element["rows"].as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn add_rows_concatenates_with_pending_add_rows() {
        let queue = DeltaQueue::new();
        queue.enqueue(OutgoingMessage::Delta(Delta::add_rows(
            DeltaPath(vec![2]),
            vec![serde_json::json!({"i": 1})],
        )));
        queue.enqueue(OutgoingMessage::Delta(Delta::add_rows(
            DeltaPath(vec![2]),
            vec![serde_json::json!({"i": 2})],
        )));

        let flushed = queue.flush();
        assert_eq!(flushed.len(), 1);
        let OutgoingMessage::Delta(delta) = &flushed[0] else {
            panic!("expected delta");
        };
        let DeltaPayload::AddRows { rows } = &delta.payload else {
            panic!("expected pending add_rows");
        };
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn add_rows_onto_a_non_table_element_is_dropped() {
        let queue = DeltaQueue::new();
        queue.enqueue(element(vec![0], "plain text"));
        queue.enqueue(OutgoingMessage::Delta(Delta::add_rows(
            DeltaPath(vec![0]),
            vec![serde_json::json!({"i": 1})],
        )));

        // The text element passes through untouched; no rows array appears.
        assert_eq!(queue.flush(), vec![element(vec![0], "plain text")]);
    }

    #[test]
    fn replacement_after_add_rows_wins_outright() {
        let queue = DeltaQueue::new();
        queue.enqueue(OutgoingMessage::Delta(Delta::add_rows(
            DeltaPath(vec![0]),
            vec![serde_json::json!({"i": 1})],
        )));
        queue.enqueue(element(vec![0], "replacement"));

        let flushed = queue.flush();
        assert_eq!(flushed, vec![element(vec![0], "replacement")]);
    }

    #[test]
    fn control_events_are_never_composed() {
        let queue = DeltaQueue::new();
        let started = OutgoingMessage::Control(ControlEvent::ScriptStarted { run_id: RunId(1) });
        let finished = OutgoingMessage::Control(ControlEvent::ScriptFinished {
            run_id: RunId(1),
            outcome: RunOutcome::Completed,
        });
        queue.enqueue(started.clone());
        queue.enqueue(element(vec![0], "body"));
        queue.enqueue(finished.clone());

        assert_eq!(
            queue.flush(),
            vec![started, element(vec![0], "body"), finished]
        );
    }

    #[test]
    fn flushing_empty_queue_is_idempotent() {
        let queue = DeltaQueue::new();
        assert!(queue.flush().is_empty());
        assert!(queue.flush().is_empty());
    }

    #[test]
    fn deep_clone_is_independent_of_original() {
        let queue = DeltaQueue::new();
        queue.enqueue(element(vec![0], "body"));

        let clone = queue.deep_clone();
        assert_eq!(clone.flush().len(), 1);

        // The original still holds its pending message.
        assert_eq!(queue.len(), 1);
        queue.enqueue(element(vec![0], "changed"));
        assert_eq!(queue.flush(), vec![element(vec![0], "changed")]);
    }

    #[test]
    fn path_index_resets_after_flush() {
        let queue = DeltaQueue::new();
        queue.enqueue(element(vec![0], "first"));
        queue.flush();

        queue.enqueue(element(vec![0], "second"));
        assert_eq!(queue.flush(), vec![element(vec![0], "second")]);
    }
}
