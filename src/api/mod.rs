//! Control API
//!
//! JSON endpoints served by the Brain so an operator (or a kiosk page) can
//! trigger playback and see who is online. Handlers only talk to the
//! coordinator and the roster; they never touch the broker directly.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::playback::{Asset, FleetRoster, NodeRecord, PlaybackCoordinator, PlaybackError};

#[derive(Clone)]
pub struct ApiState {
    coordinator: PlaybackCoordinator,
    roster: Arc<FleetRoster>,
    default_offset: f64,
}

impl ApiState {
    pub fn new(coordinator: PlaybackCoordinator, roster: Arc<FleetRoster>, default_offset: f64) -> Self {
        Self {
            coordinator,
            roster,
            default_offset,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusBody {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusBody {
    fn success() -> Self {
        Self {
            status: "success".to_string(),
            message: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PlayBody {
    pub index: i64,
    pub offset: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub broker_connected: bool,
}

#[derive(Debug, Serialize)]
pub struct CountBody {
    pub count: usize,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/videos", get(videos))
        .route("/play", post(play))
        .route("/clients", get(clients))
        .route("/clients/count", get(client_count))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// Serve until `cancel` fires
pub async fn serve(bind: &str, state: ApiState, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(component = "api", outcome = "started", detail = %format!("listening on {}", bind));
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn health(State(state): State<ApiState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        broker_connected: state.coordinator.is_connected(),
    })
}

async fn videos(State(state): State<ApiState>) -> Result<Json<Vec<Asset>>, Response> {
    state
        .coordinator
        .assets()
        .map(Json)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn play(State(state): State<ApiState>, Json(body): Json<PlayBody>) -> Response {
    let Ok(index) = usize::try_from(body.index) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid video index");
    };
    let offset = body.offset.unwrap_or(state.default_offset);

    match state.coordinator.request_play(index, offset) {
        Ok(_) => (StatusCode::OK, Json(StatusBody::success())).into_response(),
        Err(PlaybackError::InvalidIndex { .. }) => error_response(StatusCode::BAD_REQUEST, "Invalid video index"),
        Err(PlaybackError::Command(e)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(PlaybackError::Broker(e)) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn clients(State(state): State<ApiState>) -> Json<Vec<NodeRecord>> {
    Json(state.roster.nodes())
}

async fn client_count(State(state): State<ApiState>) -> Json<CountBody> {
    Json(CountBody {
        count: state.roster.count(),
    })
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(StatusBody::error(message))).into_response()
}
