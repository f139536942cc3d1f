use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use runtime::ScriptFn;
use shared::error::{ErrorBody, ErrorCode};
use tracing::info;

pub mod config;
pub mod context;
pub mod session;
mod ws;

pub use config::{load_settings, load_settings_from, Settings};
pub use context::EngineContext;
pub use session::Session;

/// Shared handler state: the process context plus the app script every new
/// session executes.
pub struct AppState {
    pub ctx: Arc<EngineContext>,
    pub script: ScriptFn,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stream", get(ws::ws_handler))
        .route("/cache/:hash", get(cache_lookup))
        .route("/admin/clear_cache", post(clear_cache))
        .with_state(state)
}

pub async fn serve(settings: Settings, script: ScriptFn) -> anyhow::Result<()> {
    let addr: SocketAddr = settings.bind_addr.parse()?;
    let ctx = EngineContext::init(settings)?;
    let state = Arc::new(AppState {
        ctx: Arc::clone(&ctx),
        script,
    });
    let app = build_router(state);

    info!(%addr, "streamboard listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    ctx.shutdown().await;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

/// Side-channel lookup for payloads a session received only as a hash
/// reference.
async fn cache_lookup(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let bytes = state.ctx.message_cache.get_by_hash(&hash).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorBody::new(ErrorCode::NotFound, "unknown payload hash")),
        )
    })?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        bytes,
    ))
}

async fn clear_cache(
    State(state): State<Arc<AppState>>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    state.ctx.compute_cache.clear(None).map_err(|error| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody::new(ErrorCode::Cache, error.to_string())),
        )
    })?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use sha2::{Digest, Sha256};
    use shared::{
        domain::{DeltaPath, SessionId},
        protocol::{Delta, OutgoingMessage},
    };
    use tower::ServiceExt;

    use super::*;

    fn test_state() -> Arc<AppState> {
        let settings = Settings {
            min_cached_message_size: 64,
            ..Settings::default()
        };
        let ctx = EngineContext::init(settings).expect("context");
        let script: ScriptFn = Arc::new(|_: &mut runtime::ScriptContext<'_>| Ok(()));
        Arc::new(AppState { ctx, script })
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cache_lookup_misses_with_404() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::get("/cache/deadbeef")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cache_lookup_serves_stored_payload() {
        let state = test_state();
        let message = OutgoingMessage::Delta(Delta::new_element(
            DeltaPath(vec![0]),
            serde_json::json!({"kind": "chart", "points": vec![1u8; 512]}),
        ));
        let session = SessionId::generate();
        state.ctx.message_cache.add(message.clone(), session, 1);

        let serialized = serde_json::to_vec(&message).expect("serialize");
        let hash = hex::encode(Sha256::digest(&serialized));

        let app = build_router(Arc::clone(&state));
        let response = app
            .oneshot(
                Request::get(format!("/cache/{hash}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(body.as_ref(), serialized.as_slice());
    }

    #[tokio::test]
    async fn clear_cache_returns_no_content() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::post("/admin/clear_cache")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
