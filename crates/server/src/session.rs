use std::sync::Arc;

use chrono::{DateTime, Utc};
use runtime::{DeltaQueue, RunController, RunEvent, RunRequest, ScriptFn};
use shared::{
    domain::SessionId,
    protocol::{ClientMessage, OutgoingMessage, SessionEvent},
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, warn};

use crate::context::EngineContext;

/// One connected client's isolated engine instances: run controller, delta
/// queue, widget state store (owned by the controller), wired to the
/// process-wide caches at flush time.
pub struct Session {
    pub id: SessionId,
    pub queue: Arc<DeltaQueue>,
    pub controller: RunController,
    pub connected_at: DateTime<Utc>,
}

impl Session {
    pub fn start(ctx: &EngineContext, script: ScriptFn) -> (Arc<Self>, UnboundedReceiver<RunEvent>) {
        let queue = Arc::new(DeltaQueue::new());
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let controller = RunController::spawn(
            script,
            Arc::clone(&queue),
            Arc::clone(&ctx.compute_cache),
            events_tx,
        );
        let session = Arc::new(Self {
            id: SessionId::generate(),
            queue,
            controller,
            connected_at: Utc::now(),
        });
        ctx.register(Arc::clone(&session));
        (session, events_rx)
    }

    pub fn status_message(&self) -> OutgoingMessage {
        OutgoingMessage::Session(SessionEvent::SessionStatus {
            session_id: self.id,
            run_count: self.controller.run_count(),
            active: self.controller.is_running(),
            connected_at: self.connected_at,
        })
    }

    /// Drains the delta queue, running every message through the message
    /// cache so repeated large payloads leave as short references.
    pub fn flush_outgoing(&self, ctx: &EngineContext) -> Vec<OutgoingMessage> {
        let run_count = self.controller.run_count();
        self.queue
            .flush()
            .into_iter()
            .map(|message| ctx.message_cache.add(message, self.id, run_count))
            .collect()
    }

    /// The single interpretation point for inbound client frames.
    pub fn handle_client_message(&self, ctx: &EngineContext, message: ClientMessage) {
        match message {
            ClientMessage::WidgetUpdate { values } => {
                if let Err(error) = self.controller.request_rerun(RunRequest {
                    widget_values: values,
                    forced_args: None,
                }) {
                    warn!(session_id = %self.id, %error, "dropping widget update");
                }
            }
            ClientMessage::Rerun => {
                if let Err(error) = self.controller.request_rerun(RunRequest::default()) {
                    warn!(session_id = %self.id, %error, "dropping rerun request");
                }
            }
            ClientMessage::Stop => self.controller.request_stop(),
            ClientMessage::ClearCache => {
                if let Err(error) = ctx.compute_cache.clear(None) {
                    error!(session_id = %self.id, %error, "compute cache clear failed");
                }
            }
        }
    }

    /// Disconnect path: stop the worker, then release every process-wide
    /// resource this session referenced.
    pub async fn close(self: &Arc<Self>, ctx: &EngineContext) {
        let session = Arc::clone(self);
        let _ = tokio::task::spawn_blocking(move || session.controller.shutdown()).await;
        ctx.message_cache.remove_refs_for_session(self.id);
        ctx.deregister(self.id);
    }
}
