use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use cache::ComputeCacheTable;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use shared::{
    domain::{DeltaPath, FunctionKey, RunId, WidgetId},
    error::EngineError,
    protocol::{Delta, DeltaPayload, OutgoingMessage},
};
use thiserror::Error;

use crate::{delta_queue::DeltaQueue, state::SessionState, widgets::compute_widget_id};

#[derive(Debug, Error)]
pub enum ScriptError {
    /// The run observed a stop or a superseding rerun at a checkpoint.
    #[error("run interrupted")]
    Interrupted,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("{0}")]
    Failed(String),
}

impl From<anyhow::Error> for ScriptError {
    fn from(error: anyhow::Error) -> Self {
        Self::Failed(format!("{error:#}"))
    }
}

/// The app script: called top-to-bottom once per run, on the session's
/// dedicated worker thread.
pub type ScriptFn = Arc<dyn Fn(&mut ScriptContext<'_>) -> Result<(), ScriptError> + Send + Sync>;

/// Cooperative-cancellation flags shared between the controller and the
/// worker. Checked at widget declarations and explicit checkpoints; a
/// statement in flight is never interrupted.
#[derive(Default)]
pub struct RunFlags {
    pub(crate) stop: AtomicBool,
    pub(crate) interrupt: AtomicBool,
}

impl RunFlags {
    pub(crate) fn reset(&self) {
        self.stop.store(false, Ordering::SeqCst);
        self.interrupt.store(false, Ordering::SeqCst);
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.interrupt.load(Ordering::SeqCst)
    }
}

/// Everything one run of the script may touch, threaded explicitly instead
/// of living in ambient thread-local state.
pub struct ScriptContext<'a> {
    run_id: RunId,
    queue: &'a DeltaQueue,
    state: &'a Mutex<SessionState>,
    compute: &'a ComputeCacheTable,
    flags: &'a RunFlags,
    forced_args: Option<Value>,
    cursor: u32,
}

impl<'a> ScriptContext<'a> {
    pub(crate) fn new(
        run_id: RunId,
        queue: &'a DeltaQueue,
        state: &'a Mutex<SessionState>,
        compute: &'a ComputeCacheTable,
        flags: &'a RunFlags,
        forced_args: Option<Value>,
    ) -> Self {
        Self {
            run_id,
            queue,
            state,
            compute,
            flags,
            forced_args,
            cursor: 0,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Arguments forced onto this run by the triggering request, e.g. from
    /// navigation.
    pub fn forced_args(&self) -> Option<&Value> {
        self.forced_args.as_ref()
    }

    /// Suspension point: returns `Interrupted` if a stop or a superseding
    /// rerun request arrived since the last check.
    pub fn checkpoint(&self) -> Result<(), ScriptError> {
        if self.flags.should_stop() {
            return Err(ScriptError::Interrupted);
        }
        Ok(())
    }

    /// Next root-level delta path in declaration order.
    pub fn next_path(&mut self) -> DeltaPath {
        let path = DeltaPath::root_child(self.cursor);
        self.cursor += 1;
        path
    }

    pub fn enqueue_delta(&self, path: DeltaPath, payload: DeltaPayload) {
        self.queue
            .enqueue(OutgoingMessage::Delta(Delta { path, payload }));
    }

    /// Two-phase widget declaration: resolves the widget's identity and its
    /// current value against session state. Rendering is the caller's
    /// second phase via [`enqueue_delta`](Self::enqueue_delta).
    pub fn declare_widget(
        &mut self,
        widget_type: &str,
        declared_args: &Value,
        default: Value,
        user_key: Option<&str>,
    ) -> Result<(WidgetId, Value), ScriptError> {
        self.checkpoint()?;
        let widget_id = compute_widget_id(widget_type, declared_args, user_key);
        let value = self
            .lock_state()
            .declare_value(&widget_id, user_key, default)?;
        Ok((widget_id, value))
    }

    /// Script-facing session state read. Reading writes nothing.
    pub fn session_get(&self, key: &str) -> Option<Value> {
        self.lock_state().get(key)
    }

    /// Script-facing session state write; visible to any widget declared
    /// later in the same run.
    pub fn session_set(&self, key: impl Into<String>, value: Value) {
        self.lock_state().set(key, value);
    }

    /// Memoizes an expensive computation through the process-wide compute
    /// cache. The value is stored serialized; every call returns a fresh
    /// deserialization, so mutating the result cannot corrupt the cache.
    pub fn cached<T, F>(
        &self,
        function_key: &FunctionKey,
        arg_hash: &str,
        compute: F,
    ) -> Result<T, ScriptError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Result<T, EngineError>,
    {
        Ok(self.compute.get_or_compute_json(function_key, arg_hash, compute)?)
    }

    // Thin marshalling wrappers. The interesting machinery is above; these
    // just build an element payload and run the two phases.

    pub fn text(&mut self, body: &str) -> Result<(), ScriptError> {
        self.checkpoint()?;
        let path = self.next_path();
        self.enqueue_delta(
            path,
            DeltaPayload::NewElement {
                element: json!({"kind": "text", "body": body}),
            },
        );
        Ok(())
    }

    pub fn checkbox(
        &mut self,
        label: &str,
        default: bool,
        user_key: Option<&str>,
    ) -> Result<bool, ScriptError> {
        let args = json!({"label": label});
        let (widget_id, value) =
            self.declare_widget("checkbox", &args, Value::Bool(default), user_key)?;
        let checked = value.as_bool().unwrap_or(default);
        let path = self.next_path();
        self.enqueue_delta(
            path,
            DeltaPayload::NewElement {
                element: json!({
                    "kind": "checkbox",
                    "label": label,
                    "widget_id": widget_id,
                    "key": user_key,
                    "value": checked,
                }),
            },
        );
        Ok(checked)
    }

    pub fn number_input(
        &mut self,
        label: &str,
        default: f64,
        user_key: Option<&str>,
    ) -> Result<f64, ScriptError> {
        let args = json!({"label": label});
        let (widget_id, value) =
            self.declare_widget("number_input", &args, json!(default), user_key)?;
        let number = value.as_f64().unwrap_or(default);
        let path = self.next_path();
        self.enqueue_delta(
            path,
            DeltaPayload::NewElement {
                element: json!({
                    "kind": "number_input",
                    "label": label,
                    "widget_id": widget_id,
                    "key": user_key,
                    "value": number,
                }),
            },
        );
        Ok(number)
    }

    /// Renders a full table and returns its path so later statements can
    /// grow it with [`add_rows`](Self::add_rows).
    pub fn table(&mut self, rows: Vec<Value>) -> Result<DeltaPath, ScriptError> {
        self.checkpoint()?;
        let path = self.next_path();
        self.enqueue_delta(
            path.clone(),
            DeltaPayload::NewElement {
                element: json!({"kind": "table", "rows": rows}),
            },
        );
        Ok(path)
    }

    pub fn add_rows(&self, path: &DeltaPath, rows: Vec<Value>) -> Result<(), ScriptError> {
        self.checkpoint()?;
        self.enqueue_delta(path.clone(), DeltaPayload::AddRows { rows });
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'a, SessionState> {
        // The worker survives script panics via catch_unwind; recover the
        // state rather than poisoning the whole session.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
