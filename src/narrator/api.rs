//! Local HTTP control surface.
//!
//! Bound to 127.0.0.1 only. Routes:
//! - `GET  /status`
//! - `POST /start` `{text, voice_id?, rate?, engine?}`
//! - `POST /pause`, `POST /resume`, `POST /stop`
//! - `GET  /voices?engine=&lang=`
//! - `GET  /download` (audio/mpeg of the last finished remote session)
//! - `GET  /events` (server-sent events)

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::engine::{EngineStatus, PlaybackEngine, StartOptions};
use super::session::SessionId;
use super::voices::{neural_voices_for, EngineKind, Voice, VoiceCatalog};
use crate::error::PlaybackError;

#[derive(Clone)]
pub struct ApiState {
    pub engine: PlaybackEngine,
    pub catalog: Arc<VoiceCatalog>,
}

// --- Request/Response types ---

#[derive(Deserialize)]
struct StartRequest {
    text: String,
    #[serde(default)]
    voice_id: Option<String>,
    #[serde(default)]
    rate: Option<f32>,
    #[serde(default)]
    engine: Option<String>,
}

#[derive(Deserialize)]
struct VoicesQuery {
    engine: Option<String>,
    lang: Option<String>,
}

#[derive(Serialize)]
struct SimpleResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SimpleResponse {
    fn ok(status: &str) -> Self {
        Self {
            status: status.into(),
            session: None,
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            session: None,
            error: Some(message.into()),
        }
    }
}

fn error_status(e: &PlaybackError) -> StatusCode {
    match e {
        PlaybackError::EmptyInput => StatusCode::BAD_REQUEST,
        PlaybackError::SessionActive => StatusCode::CONFLICT,
        PlaybackError::NoVoiceAvailable | PlaybackError::BackendsExhausted(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/start", post(handle_start))
        .route("/pause", post(handle_pause))
        .route("/resume", post(handle_resume))
        .route("/stop", post(handle_stop))
        .route("/voices", get(handle_voices))
        .route("/download", get(handle_download))
        .route("/events", get(handle_events))
        .with_state(state)
}

/// Serve the API until `shutdown` fires.
pub async fn serve(state: ApiState, port: u16, shutdown: CancellationToken) -> std::io::Result<()> {
    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Read-aloud API listening on {addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// --- Handlers ---

async fn handle_status(State(state): State<ApiState>) -> Json<EngineStatus> {
    Json(state.engine.status())
}

async fn handle_start(
    State(state): State<ApiState>,
    Json(req): Json<StartRequest>,
) -> (StatusCode, Json<SimpleResponse>) {
    let engine = match req.engine.as_deref().map(str::parse::<EngineKind>).transpose() {
        Ok(engine) => engine,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(SimpleResponse::err(e))),
    };

    let preview: String = req.text.chars().take(80).collect();
    info!(
        "HTTP /start: \"{}{}\" ({} chars)",
        preview.replace('\n', " "),
        if req.text.chars().count() > 80 { "..." } else { "" },
        req.text.chars().count(),
    );

    let options = StartOptions {
        voice_id: req.voice_id,
        rate: req.rate.unwrap_or(1.0),
        engine,
    };
    match state.engine.start(&req.text, options) {
        Ok(id) => (
            StatusCode::OK,
            Json(SimpleResponse {
                session: Some(id),
                ..SimpleResponse::ok("speaking")
            }),
        ),
        Err(e) => (error_status(&e), Json(SimpleResponse::err(e.to_string()))),
    }
}

async fn handle_pause(State(state): State<ApiState>) -> Json<SimpleResponse> {
    state.engine.pause();
    Json(SimpleResponse::ok(&state.engine.status().state.to_string().to_lowercase()))
}

async fn handle_resume(State(state): State<ApiState>) -> Json<SimpleResponse> {
    state.engine.resume();
    Json(SimpleResponse::ok(&state.engine.status().state.to_string().to_lowercase()))
}

async fn handle_stop(State(state): State<ApiState>) -> Json<SimpleResponse> {
    state.engine.stop();
    Json(SimpleResponse::ok("idle"))
}

async fn handle_voices(
    State(state): State<ApiState>,
    Query(query): Query<VoicesQuery>,
) -> Result<Json<Vec<Voice>>, (StatusCode, Json<SimpleResponse>)> {
    let engines = match query.engine.as_deref() {
        Some(name) => vec![name
            .parse::<EngineKind>()
            .map_err(|e| (StatusCode::BAD_REQUEST, Json(SimpleResponse::err(e))))?],
        None => vec![EngineKind::Neural, EngineKind::Native, EngineKind::Offline],
    };
    let lang = query.lang.as_deref().filter(|l| !l.is_empty());

    let mut voices = Vec::new();
    for engine in engines {
        match (engine, lang) {
            (EngineKind::Neural, Some(lang)) => voices.extend(neural_voices_for(lang)),
            (_, Some(lang)) => voices.extend(
                state
                    .catalog
                    .list_voices(engine)
                    .into_iter()
                    .filter(|v| language_matches(&v.language, lang)),
            ),
            (_, None) => voices.extend(state.catalog.list_voices(engine)),
        }
    }
    Ok(Json(voices))
}

/// `en` matches `en-US`; `en-GB` matches only `en-GB`.
pub fn language_matches(voice_lang: &str, wanted: &str) -> bool {
    if voice_lang.eq_ignore_ascii_case(wanted) {
        return true;
    }
    let voice_primary = voice_lang.split(['-', '_']).next().unwrap_or(voice_lang);
    !wanted.contains(['-', '_']) && voice_primary.eq_ignore_ascii_case(wanted)
}

async fn handle_download(State(state): State<ApiState>) -> Response {
    match state.engine.download() {
        Some(audio) => (
            [
                (header::CONTENT_TYPE, "audio/mpeg"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"readaloud.mp3\""),
            ],
            audio,
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(SimpleResponse::err("no finished session with downloadable audio")),
        )
            .into_response(),
    }
}

async fn handle_events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.engine.subscribe()).filter_map(|msg| match msg {
        Ok(event) => match Event::default().json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                warn!("Failed to encode event: {e}");
                None
            }
        },
        // Lagged subscriber: skip what was missed.
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
