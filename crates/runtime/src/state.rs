use std::collections::{HashMap, HashSet};

use serde_json::Value;
use shared::{domain::WidgetId, error::EngineError};
use tracing::warn;

/// Storage key for a widget declared without a user key.
fn generated_key(widget_id: &WidgetId) -> String {
    format!("$$widget-{}", widget_id.as_str())
}

/// One session's key/value state: user keys written by script code plus
/// generated keys backing keyless widgets. Created once per session,
/// reconciled at the start of every run, dropped with the session.
#[derive(Default)]
pub struct SessionState {
    values: HashMap<String, Value>,
    /// Widget ids declared during the current run, for duplicate detection.
    touched_this_run: HashSet<WidgetId>,
    /// Storage keys materialized by widgets in the current run.
    active_keys: HashSet<String>,
    /// Storage keys materialized by widgets in the immediately prior run.
    previous_keys: HashSet<String>,
    /// Keys that have had at least one widget declaration.
    materialized: HashSet<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconciliation at run start: incoming widget values from the
    /// triggering request overwrite stored values; everything else carries
    /// forward untouched.
    pub fn begin_run(&mut self, incoming: HashMap<String, Value>) {
        self.touched_this_run.clear();
        self.previous_keys = std::mem::take(&mut self.active_keys);
        for (key, value) in incoming {
            self.values.insert(key, value);
        }
    }

    /// Prunes generated widget keys not seen in the current or the
    /// immediately preceding run. User keys live until the session ends.
    pub fn end_run(&mut self) {
        let active = &self.active_keys;
        let previous = &self.previous_keys;
        self.values.retain(|key, _| {
            !key.starts_with("$$widget-") || active.contains(key) || previous.contains(key)
        });
        self.materialized
            .retain(|key| self.values.contains_key(key) || !key.starts_with("$$widget-"));
    }

    /// Materializes one widget declaration and resolves its current value.
    /// Two declarations of the same id in one run are a declaration error.
    pub fn declare_value(
        &mut self,
        widget_id: &WidgetId,
        user_key: Option<&str>,
        default: Value,
    ) -> Result<Value, EngineError> {
        if !self.touched_this_run.insert(widget_id.clone()) {
            return Err(EngineError::DuplicateWidgetId {
                widget_id: widget_id.clone(),
            });
        }
        let key = match user_key {
            Some(key) => key.to_string(),
            None => generated_key(widget_id),
        };
        self.active_keys.insert(key.clone());

        if self.materialized.insert(key.clone()) {
            if let Some(existing) = self.values.get(&key) {
                // Honored as the initial value; warned once per key.
                warn!(
                    key,
                    "session state was written before the widget with this key was declared; \
                     using the stored value instead of the widget default"
                );
                return Ok(existing.clone());
            }
            self.values.insert(key, default.clone());
            return Ok(default);
        }

        match self.values.get(&key) {
            Some(value) => Ok(value.clone()),
            None => {
                // Pruned while the widget was absent, then redeclared.
                self.values.insert(key, default.clone());
                Ok(default)
            }
        }
    }

    /// True when a key holds a value that no widget has materialized yet,
    /// i.e. a pending script write that will collide with a widget default.
    pub fn is_new_value(&self, key: &str) -> bool {
        self.values.contains_key(key) && !self.materialized.contains(key)
    }

    /// Reading writes nothing.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    /// Script-facing assignment; visible to later widget declarations in
    /// the same run.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn widget(id: &str) -> WidgetId {
        WidgetId(id.to_string())
    }

    #[test]
    fn incoming_values_override_stored_ones() {
        let mut state = SessionState::new();
        state.set("count", json!(1));
        state.begin_run(HashMap::from([("count".to_string(), json!(5))]));
        assert_eq!(state.get("count"), Some(json!(5)));
    }

    #[test]
    fn duplicate_declaration_in_one_run_is_rejected() {
        let mut state = SessionState::new();
        state.begin_run(HashMap::new());
        state
            .declare_value(&widget("a"), None, json!(false))
            .expect("first declaration");
        let error = state
            .declare_value(&widget("a"), None, json!(false))
            .expect_err("second declaration");
        assert!(matches!(error, EngineError::DuplicateWidgetId { .. }));
    }

    #[test]
    fn same_id_is_legal_again_on_the_next_run() {
        let mut state = SessionState::new();
        state.begin_run(HashMap::new());
        state
            .declare_value(&widget("a"), None, json!(1))
            .expect("run one");

        state.begin_run(HashMap::new());
        state
            .declare_value(&widget("a"), None, json!(1))
            .expect("run two");
    }

    #[test]
    fn widget_value_carries_forward_across_runs() {
        let mut state = SessionState::new();
        state.begin_run(HashMap::new());
        state
            .declare_value(&widget("a"), Some("flag"), json!(false))
            .expect("declare");
        state.end_run();

        // The browser sent a new value; the run after that sends nothing.
        state.begin_run(HashMap::from([("flag".to_string(), json!(true))]));
        let value = state
            .declare_value(&widget("a"), Some("flag"), json!(false))
            .expect("declare");
        assert_eq!(value, json!(true));
        state.end_run();

        state.begin_run(HashMap::new());
        let value = state
            .declare_value(&widget("a"), Some("flag"), json!(false))
            .expect("declare");
        assert_eq!(value, json!(true));
    }

    #[test]
    fn pre_declare_write_is_honored_as_initial_value() {
        let mut state = SessionState::new();
        state.begin_run(HashMap::new());
        state.set("volume", json!(11));
        assert!(state.is_new_value("volume"));

        let value = state
            .declare_value(&widget("v"), Some("volume"), json!(5))
            .expect("declare");
        assert_eq!(value, json!(11));
        assert!(!state.is_new_value("volume"));
    }

    #[test]
    fn generated_keys_prune_after_two_absent_runs() {
        let mut state = SessionState::new();
        state.begin_run(HashMap::new());
        state
            .declare_value(&widget("gone"), None, json!(1))
            .expect("declare");
        state.end_run();
        assert_eq!(state.len(), 1);

        // Absent for one run: still carried (previous-run grace).
        state.begin_run(HashMap::new());
        state.end_run();
        assert_eq!(state.len(), 1);

        // Absent for a second run: pruned.
        state.begin_run(HashMap::new());
        state.end_run();
        assert!(state.is_empty());
    }

    #[test]
    fn user_keys_survive_widget_absence() {
        let mut state = SessionState::new();
        state.begin_run(HashMap::new());
        state.set("notes", json!("keep me"));
        state.end_run();
        state.begin_run(HashMap::new());
        state.end_run();
        state.begin_run(HashMap::new());
        state.end_run();
        assert_eq!(state.get("notes"), Some(json!("keep me")));
    }
}
