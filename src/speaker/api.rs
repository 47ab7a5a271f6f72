//! HTTP control API for the speech pipeline.
//!
//! Lets a chat client drive the live stream (`/stream/*`), speak one-off
//! text, and toggle or stop speech. Binds to localhost only.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::orchestrator::StreamingOrchestrator;
use super::state::StatusSnapshot;

#[derive(Clone)]
pub struct SpeakerApiState {
    pub speaker: Arc<StreamingOrchestrator>,
}

// --- Request/Response types ---

#[derive(Deserialize)]
struct TextRequest {
    text: String,
}

#[derive(Deserialize)]
struct TokenRequest {
    token: String,
}

#[derive(Serialize)]
struct SimpleResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SimpleResponse {
    fn ok(status: &str) -> Self {
        Self {
            status: status.into(),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            error: Some(message.into()),
        }
    }
}

/// Build the axum router.
pub fn router(state: SpeakerApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/enable", post(handle_enable))
        .route("/disable", post(handle_disable))
        .route("/stop", post(handle_stop))
        .route("/speak", post(handle_speak))
        .route("/stream/delta", post(handle_delta))
        .route("/stream/token", post(handle_token))
        .route("/stream/end", post(handle_end))
        .with_state(state)
}

/// Start the API server as a background tokio task.
pub async fn start_speaker_api(state: SpeakerApiState, port: u16) {
    let app = router(state);
    let addr = format!("127.0.0.1:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind speaker API on {addr}: {e}");
            return;
        }
    };
    info!("Speaker API listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Speaker API server error: {e}");
        }
    });
}

// --- Handlers ---

async fn handle_status(State(state): State<SpeakerApiState>) -> Json<StatusSnapshot> {
    Json(state.speaker.status())
}

async fn handle_enable(State(state): State<SpeakerApiState>) -> Json<SimpleResponse> {
    match state.speaker.enable() {
        Ok(()) => Json(SimpleResponse::ok("enabled")),
        Err(e) => Json(SimpleResponse::err(e.to_string())),
    }
}

async fn handle_disable(State(state): State<SpeakerApiState>) -> Json<SimpleResponse> {
    state.speaker.disable();
    Json(SimpleResponse::ok("disabled"))
}

async fn handle_stop(State(state): State<SpeakerApiState>) -> Json<SimpleResponse> {
    state.speaker.stop();
    Json(SimpleResponse::ok("stopped"))
}

async fn handle_speak(
    State(state): State<SpeakerApiState>,
    Json(req): Json<TextRequest>,
) -> Json<SimpleResponse> {
    if req.text.trim().is_empty() {
        return Json(SimpleResponse::err("empty text"));
    }
    if !state.speaker.is_enabled() {
        return Json(SimpleResponse::err("speech is disabled"));
    }

    let preview: String = req.text.chars().take(80).collect();
    info!(
        "HTTP /speak: \"{}{}\" ({} chars)",
        preview.replace('\n', " "),
        if req.text.chars().count() > 80 { "..." } else { "" },
        req.text.len(),
    );

    state.speaker.on_text_delta(&req.text);
    state.speaker.on_stream_end();
    Json(SimpleResponse::ok("speaking"))
}

async fn handle_delta(
    State(state): State<SpeakerApiState>,
    Json(req): Json<TextRequest>,
) -> Json<SimpleResponse> {
    if !state.speaker.is_enabled() {
        return Json(SimpleResponse::err("speech is disabled"));
    }
    state.speaker.on_text_delta(&req.text);
    Json(SimpleResponse::ok("ok"))
}

async fn handle_token(
    State(state): State<SpeakerApiState>,
    Json(req): Json<TokenRequest>,
) -> Json<SimpleResponse> {
    if !state.speaker.is_enabled() {
        return Json(SimpleResponse::err("speech is disabled"));
    }
    state.speaker.on_control_token(&req.token);
    Json(SimpleResponse::ok("ok"))
}

async fn handle_end(State(state): State<SpeakerApiState>) -> Json<SimpleResponse> {
    state.speaker.on_stream_end();
    Json(SimpleResponse::ok("ok"))
}
