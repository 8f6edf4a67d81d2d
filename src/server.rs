//! Local HTTP API for a desktop front end.
//!
//! Serves one conversation. The UI layer forwards its `update_index`,
//! `chat_completion`, and `clear_chat_history` calls here.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/index` | Set the lookup files; rebuilds the index if they changed |
//! | `POST` | `/chat` | One chat invocation, JSON or SSE (`"stream": true`) |
//! | `POST` | `/history/clear` | Forget the conversation |
//! | `GET`  | `/history` | Conversation so far |
//!
//! # Streaming
//!
//! With `"stream": true` the reply is `text/event-stream`: one `delta` event
//! per fragment (`{"role"?, "content"?}`), then a `done` event carrying the
//! full answer, or an `error` event. The session lock is held until the
//! stream ends, so a second request waits for the first answer to finish.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `index_build` (422), `retrieval` (502),
//! `model_inference` (502), `timeout` (504).

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::AgentError;
use crate::index::IndexStats;
use crate::models::{ChatHistory, ImageRef};
use crate::pipeline::{AgentResponse, ChatRequest, ChatSession, RagAgent, StreamingReply};
use crate::progress::IndexProgressReporter;

#[derive(Clone)]
struct AppState {
    agent: Arc<RagAgent>,
    session: Arc<Mutex<ChatSession>>,
}

/// Starts the HTTP server on `[server].bind` and runs until the process exits.
pub async fn run_server(
    config: &Config,
    progress: Arc<dyn IndexProgressReporter>,
) -> anyhow::Result<()> {
    let agent = Arc::new(RagAgent::from_config(config)?);
    let session = ChatSession::from_config(config, progress)?;
    let app = router(agent, session);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("Assistant API listening on http://{}", config.server.bind);
    tracing::info!(bind = %config.server.bind, "server started");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the router around one agent and one conversation.
pub fn router(agent: Arc<RagAgent>, session: ChatSession) -> Router {
    let state = AppState {
        agent,
        session: Arc::new(Mutex::new(session)),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/index", post(handle_index))
        .route("/chat", post(handle_chat))
        .route("/history", get(handle_history))
        .route("/history/clear", post(handle_clear_history))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<AgentError> for AppError {
    fn from(err: AgentError) -> Self {
        let status = match &err {
            AgentError::Configuration(_) => StatusCode::BAD_REQUEST,
            AgentError::IndexBuild(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AgentError::Retrieval(_) | AgentError::ModelInference(_) => StatusCode::BAD_GATEWAY,
            AgentError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /index ============

#[derive(Deserialize)]
struct IndexRequest {
    #[serde(default)]
    files: Vec<PathBuf>,
}

async fn handle_index(
    State(state): State<AppState>,
    Json(req): Json<IndexRequest>,
) -> Result<Json<IndexStats>, AppError> {
    let mut session = state.session.lock().await;
    state
        .agent
        .update_index(&mut session, req.files.into_iter().collect())
        .await?;
    Ok(Json(session.index_stats()))
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatBody {
    #[serde(default)]
    query: String,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    lookup_files: Vec<PathBuf>,
    #[serde(default)]
    stream: bool,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Response, AppError> {
    let request = ChatRequest {
        query: body.query,
        image: body.image.map(ImageRef::new),
        lookup_files: body.lookup_files.into_iter().collect(),
        streaming: body.stream,
    };

    let mut session = Arc::clone(&state.session).lock_owned().await;
    let response = state.agent.chat_completion(&mut session, request).await?;
    match response {
        AgentResponse::Complete(turn) => Ok(Json(turn).into_response()),
        AgentResponse::Streaming(reply) => Ok(sse_response(reply, session).into_response()),
    }
}

struct SseState {
    reply: StreamingReply,
    _session: OwnedMutexGuard<ChatSession>,
    done: bool,
}

fn sse_response(
    reply: StreamingReply,
    session: OwnedMutexGuard<ChatSession>,
) -> Sse<impl futures::Stream<Item = Result<Event, axum::Error>>> {
    let events = futures::stream::unfold(
        SseState {
            reply,
            _session: session,
            done: false,
        },
        |mut st| async move {
            if st.done {
                return None;
            }
            let event = match st.reply.next().await {
                Some(Ok(delta)) => Event::default().event("delta").json_data(&delta),
                Some(Err(err)) => {
                    st.done = true;
                    Event::default().event("error").json_data(ErrorDetail {
                        code: err.code().to_string(),
                        message: err.to_string(),
                    })
                }
                None => {
                    st.done = true;
                    Event::default()
                        .event("done")
                        .json_data(serde_json::json!({ "answer": st.reply.answer() }))
                }
            };
            Some((event, st))
        },
    );
    Sse::new(events).keep_alive(KeepAlive::default())
}

// ============ /history ============

async fn handle_history(State(state): State<AppState>) -> Json<ChatHistory> {
    Json(state.session.lock().await.history())
}

#[derive(Serialize)]
struct ClearResponse {
    cleared: usize,
}

async fn handle_clear_history(State(state): State<AppState>) -> Json<ClearResponse> {
    let cleared = state.session.lock().await.clear_chat_history();
    Json(ClearResponse { cleared })
}
