use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread,
};

use cache::ComputeCacheTable;
use serde_json::Value;
use shared::{
    domain::RunId,
    error::EngineError,
    protocol::{exception_element, ControlEvent, Delta, OutgoingMessage, RunOutcome},
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, warn};

use crate::{
    delta_queue::DeltaQueue,
    script::{RunFlags, ScriptContext, ScriptError, ScriptFn},
    state::SessionState,
};

/// One queued rerun request. Multiple requests coalesce into the latest;
/// only the newest widget values matter.
#[derive(Debug, Default, Clone)]
pub struct RunRequest {
    pub widget_values: HashMap<String, Value>,
    pub forced_args: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
    },
    RunFinished {
        run_id: RunId,
        run_count: u64,
        outcome: RunOutcome,
    },
}

#[derive(Default)]
struct PendingSlot {
    request: Option<RunRequest>,
    shutdown: bool,
}

struct ControllerInner {
    pending: Mutex<PendingSlot>,
    wakeup: Condvar,
    flags: RunFlags,
    running: AtomicBool,
    run_count: AtomicU64,
    queue: Arc<DeltaQueue>,
    state: Mutex<SessionState>,
    compute: Arc<ComputeCacheTable>,
    events: UnboundedSender<RunEvent>,
}

impl ControllerInner {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingSlot> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns one session's dedicated execution worker and its request slot.
/// The controller lives on the session's control path; all communication
/// with the worker goes through the slot and the event channel.
pub struct RunController {
    inner: Arc<ControllerInner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RunController {
    pub fn spawn(
        script: ScriptFn,
        queue: Arc<DeltaQueue>,
        compute: Arc<ComputeCacheTable>,
        events: UnboundedSender<RunEvent>,
    ) -> Self {
        let inner = Arc::new(ControllerInner {
            pending: Mutex::new(PendingSlot::default()),
            wakeup: Condvar::new(),
            flags: RunFlags::default(),
            running: AtomicBool::new(false),
            run_count: AtomicU64::new(0),
            queue,
            state: Mutex::new(SessionState::new()),
            compute,
            events,
        });
        let worker_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("script-runner".to_string())
            .spawn(move || worker_loop(worker_inner, script))
            .expect("failed to spawn script worker thread");
        Self {
            inner,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Posts a rerun request. While a run is active the request supersedes
    /// anything already queued (coalescing, not FIFO) and raises the
    /// cooperative interrupt flag so the active run yields at its next
    /// checkpoint.
    pub fn request_rerun(&self, request: RunRequest) -> Result<(), EngineError> {
        let mut pending = self.inner.lock_pending();
        if pending.shutdown {
            return Err(EngineError::SessionClosed);
        }
        if pending.request.replace(request).is_some() {
            debug!("superseded a queued rerun request");
        }
        if self.inner.running.load(Ordering::SeqCst) {
            self.inner.flags.interrupt.store(true, Ordering::SeqCst);
            self.inner.queue.enqueue(OutgoingMessage::Control(
                ControlEvent::RerunTriggered {
                    run_id: RunId(self.inner.run_count.load(Ordering::SeqCst)),
                },
            ));
        }
        self.inner.wakeup.notify_one();
        Ok(())
    }

    /// Cooperative stop: the worker finishes its current statement and
    /// exits the run early. Any coalesced rerun request is discarded.
    pub fn request_stop(&self) {
        let mut pending = self.inner.lock_pending();
        pending.request = None;
        self.inner.flags.stop.store(true, Ordering::SeqCst);
        self.inner.wakeup.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn run_count(&self) -> u64 {
        self.inner.run_count.load(Ordering::SeqCst)
    }

    /// Stops the worker and joins it. Blocking; callers on an async
    /// runtime should wrap this in a blocking task.
    pub fn shutdown(&self) {
        {
            let mut pending = self.inner.lock_pending();
            pending.shutdown = true;
            pending.request = None;
            self.inner.flags.stop.store(true, Ordering::SeqCst);
            self.inner.wakeup.notify_one();
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("script worker thread terminated abnormally");
            }
        }
    }
}

fn worker_loop(inner: Arc<ControllerInner>, script: ScriptFn) {
    loop {
        let request = {
            let mut pending = inner.lock_pending();
            loop {
                if pending.shutdown {
                    return;
                }
                if let Some(request) = pending.request.take() {
                    // Reset under the lock so a stop serializes with the
                    // dequeue: it either cleared the slot above, or its
                    // flag survives to the run's first checkpoint.
                    inner.flags.reset();
                    break request;
                }
                pending = inner
                    .wakeup
                    .wait(pending)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        execute_run(&inner, &script, request);
        // A request coalesced during the run starts immediately on the
        // next loop iteration, without the worker going idle in between.
    }
}

fn execute_run(inner: &ControllerInner, script: &ScriptFn, request: RunRequest) {
    inner.running.store(true, Ordering::SeqCst);
    let run_id = RunId(inner.run_count.fetch_add(1, Ordering::SeqCst) + 1);

    inner
        .queue
        .enqueue(OutgoingMessage::Control(ControlEvent::ScriptStarted {
            run_id,
        }));
    let _ = inner.events.send(RunEvent::RunStarted { run_id });

    inner
        .state
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .begin_run(request.widget_values);

    let mut ctx = ScriptContext::new(
        run_id,
        &inner.queue,
        &inner.state,
        &inner.compute,
        &inner.flags,
        request.forced_args,
    );
    let result = catch_unwind(AssertUnwindSafe(|| script(&mut ctx)));

    let outcome = match result {
        Ok(Ok(())) => RunOutcome::Completed,
        Ok(Err(ScriptError::Interrupted)) => RunOutcome::StoppedEarly,
        Ok(Err(failure)) => {
            // The failure renders in place; the session stays usable.
            warn!(%run_id, error = %failure, "script run failed; rendering exception element");
            let path = ctx.next_path();
            inner.queue.enqueue(OutgoingMessage::Delta(Delta::new_element(
                path,
                exception_element(&failure.to_string(), None),
            )));
            RunOutcome::CompletedWithError
        }
        Err(panic) => {
            let message = panic_message(panic);
            error!(%run_id, message, "script panicked; rendering exception element");
            let path = ctx.next_path();
            inner.queue.enqueue(OutgoingMessage::Delta(Delta::new_element(
                path,
                exception_element("script panicked", Some(&message)),
            )));
            RunOutcome::CompletedWithError
        }
    };
    drop(ctx);

    inner
        .state
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .end_run();
    inner
        .queue
        .enqueue(OutgoingMessage::Control(ControlEvent::ScriptFinished {
            run_id,
            outcome,
        }));
    inner.running.store(false, Ordering::SeqCst);
    let _ = inner.events.send(RunEvent::RunFinished {
        run_id,
        run_count: run_id.0,
        outcome,
    });
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
