//! The script-rerun engine: a session's delta queue, widget identity and
//! state reconciliation, and the run controller that drives the dedicated
//! execution worker.

pub mod controller;
pub mod delta_queue;
pub mod script;
pub mod state;
pub mod widgets;

pub use controller::{RunController, RunEvent, RunRequest};
pub use delta_queue::DeltaQueue;
pub use script::{ScriptContext, ScriptError, ScriptFn};
pub use state::SessionState;
pub use widgets::compute_widget_id;
