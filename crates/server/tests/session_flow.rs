use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use runtime::{RunEvent, RunRequest, ScriptContext, ScriptFn};
use serde_json::json;
use server::{AppState, EngineContext, Session, Settings};
use shared::protocol::{ControlEvent, DeltaPayload, OutgoingMessage, RunOutcome};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite;

fn demo_script() -> ScriptFn {
    Arc::new(|ctx: &mut ScriptContext<'_>| {
        let enabled = ctx.checkbox("Enable chart", true, Some("enabled"))?;
        if enabled {
            // Large enough to clear the message cache floor.
            let path = ctx.next_path();
            ctx.enqueue_delta(
                path,
                shared::protocol::DeltaPayload::NewElement {
                    element: json!({"kind": "chart", "points": vec![3u8; 2048]}),
                },
            );
        } else {
            ctx.text("chart disabled")?;
        }
        Ok(())
    })
}

fn test_context() -> Arc<EngineContext> {
    EngineContext::init(Settings {
        min_cached_message_size: 512,
        cache_expiry_runs: 2,
        ..Settings::default()
    })
    .expect("context")
}

async fn finished_run(events: &mut UnboundedReceiver<RunEvent>) -> (u64, RunOutcome) {
    loop {
        match events.recv().await.expect("events open") {
            RunEvent::RunFinished {
                run_count, outcome, ..
            } => return (run_count, outcome),
            RunEvent::RunStarted { .. } => {}
        }
    }
}

fn rerun(session: &Session, values: &[(&str, serde_json::Value)]) {
    let widget_values: HashMap<String, serde_json::Value> = values
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect();
    session
        .controller
        .request_rerun(RunRequest {
            widget_values,
            forced_args: None,
        })
        .expect("rerun accepted");
}

#[tokio::test]
async fn first_run_emits_full_payload_second_run_a_reference() {
    let ctx = test_context();
    let (session, mut events) = Session::start(&ctx, demo_script());

    rerun(&session, &[]);
    let (_, outcome) = finished_run(&mut events).await;
    assert_eq!(outcome, RunOutcome::Completed);

    let first = session.flush_outgoing(&ctx);
    let full_chart = first.iter().any(|message| {
        matches!(message, OutgoingMessage::Delta(delta) if delta.path.0 == vec![1])
    });
    assert!(full_chart, "run one must carry the full chart: {first:?}");

    // Identical bytes on run two collapse into a reference.
    rerun(&session, &[]);
    finished_run(&mut events).await;
    let second = session.flush_outgoing(&ctx);
    let reference = second
        .iter()
        .find_map(|message| match message {
            OutgoingMessage::CachedRef { hash, .. } => Some(hash.clone()),
            _ => None,
        })
        .expect("run two rewrites the chart as a reference");

    let stored = ctx.message_cache.get_by_hash(&reference).expect("bytes");
    let original: OutgoingMessage = serde_json::from_slice(&stored).expect("decode");
    assert!(matches!(original, OutgoingMessage::Delta(_)));

    session.close(&ctx).await;
}

#[tokio::test]
async fn widget_update_changes_the_next_run() {
    let ctx = test_context();
    let (session, mut events) = Session::start(&ctx, demo_script());

    rerun(&session, &[]);
    finished_run(&mut events).await;
    session.flush_outgoing(&ctx);

    rerun(&session, &[("enabled", json!(false))]);
    finished_run(&mut events).await;

    let flushed = session.flush_outgoing(&ctx);
    let disabled_text = flushed.iter().any(|message| {
        matches!(
            message,
            OutgoingMessage::Delta(delta)
                if matches!(
                    &delta.payload,
                    shared::protocol::DeltaPayload::NewElement { element }
                        if element["body"] == "chart disabled"
                )
        )
    });
    assert!(disabled_text, "expected disabled text in {flushed:?}");

    session.close(&ctx).await;
}

#[tokio::test]
async fn control_events_bracket_each_run_in_order() {
    let ctx = test_context();
    let (session, mut events) = Session::start(&ctx, demo_script());

    rerun(&session, &[]);
    finished_run(&mut events).await;

    let flushed = session.flush_outgoing(&ctx);
    assert!(matches!(
        flushed.first(),
        Some(OutgoingMessage::Control(ControlEvent::ScriptStarted { .. }))
    ));
    assert!(matches!(
        flushed.last(),
        Some(OutgoingMessage::Control(ControlEvent::ScriptFinished {
            outcome: RunOutcome::Completed,
            ..
        }))
    ));

    session.close(&ctx).await;
}

#[tokio::test]
async fn disconnect_releases_session_resources() {
    let ctx = test_context();
    let (session, mut events) = Session::start(&ctx, demo_script());
    assert_eq!(ctx.session_count(), 1);

    rerun(&session, &[]);
    finished_run(&mut events).await;
    session.flush_outgoing(&ctx);
    assert_eq!(ctx.message_cache.len(), 1);

    session.close(&ctx).await;
    assert_eq!(ctx.session_count(), 0);
    assert!(ctx.message_cache.is_empty());
}

async fn next_engine_message(
    socket: &mut (impl StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin),
) -> OutgoingMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame within deadline")
            .expect("socket open")
            .expect("frame ok");
        if let tungstenite::Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("frame decodes");
        }
    }
}

#[tokio::test]
async fn websocket_stream_serves_a_full_session() {
    let ctx = test_context();
    let state = Arc::new(AppState {
        ctx: Arc::clone(&ctx),
        script: demo_script(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, server::build_router(state))
            .await
            .expect("serve");
    });

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/stream"))
        .await
        .expect("connect");

    // The status frame arrives first, then the initial run's messages.
    let status = next_engine_message(&mut socket).await;
    assert!(matches!(status, OutgoingMessage::Session(_)));
    let mut saw_chart = false;
    loop {
        match next_engine_message(&mut socket).await {
            OutgoingMessage::Delta(delta) if delta.path.0 == vec![1] => saw_chart = true,
            OutgoingMessage::Control(ControlEvent::ScriptFinished { outcome, .. }) => {
                assert_eq!(outcome, RunOutcome::Completed);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_chart, "initial run must render the chart");

    // A widget update frame reruns the script with the new value.
    let update = r#"{"type":"widget_update","payload":{"values":{"enabled":false}}}"#;
    socket
        .send(tungstenite::Message::Text(update.into()))
        .await
        .expect("send update");
    let mut saw_disabled_text = false;
    loop {
        match next_engine_message(&mut socket).await {
            OutgoingMessage::Delta(delta) => {
                if let DeltaPayload::NewElement { element } = &delta.payload {
                    if element["body"] == "chart disabled" {
                        saw_disabled_text = true;
                    }
                }
            }
            OutgoingMessage::Control(ControlEvent::ScriptFinished { .. }) => break,
            _ => {}
        }
    }
    assert!(saw_disabled_text, "update must flip the rendered branch");

    // Disconnecting releases the session.
    socket.close(None).await.expect("close");
    for _ in 0..250 {
        if ctx.session_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(ctx.session_count(), 0);
}

#[tokio::test]
async fn stale_cache_entries_expire_after_quiet_runs() {
    let ctx = test_context();
    let (session, mut events) = Session::start(&ctx, demo_script());

    rerun(&session, &[]);
    finished_run(&mut events).await;
    session.flush_outgoing(&ctx);
    assert_eq!(ctx.message_cache.len(), 1);

    // Three runs with the chart hidden: the entry ages past expiry.
    for _ in 0..3 {
        rerun(&session, &[("enabled", json!(false))]);
        let (run_count, _) = finished_run(&mut events).await;
        session.flush_outgoing(&ctx);
        ctx.message_cache.remove_expired_entries(session.id, run_count);
    }
    assert!(ctx.message_cache.is_empty());

    session.close(&ctx).await;
}
