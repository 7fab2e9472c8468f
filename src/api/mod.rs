//! HTTP API handlers

use crate::adapters::mqtt::MqttAdapter;
use crate::adapters::speakercraft::{DispatchError, SpeakercraftAdapter};
use crate::bus::{SharedBus, ZoneCommand};
use crate::zone::{CommandOutcome, IgnoreReason, ZoneView};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub speakercraft: Arc<SpeakercraftAdapter>,
    pub mqtt: Arc<MqttAdapter>,
    pub bus: SharedBus,
    started: Instant,
}

impl AppState {
    pub fn new(
        speakercraft: Arc<SpeakercraftAdapter>,
        mqtt: Arc<MqttAdapter>,
        bus: SharedBus,
    ) -> Self {
        Self {
            speakercraft,
            mqtt,
            bus,
            started: Instant::now(),
        }
    }
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match self {
            DispatchError::ZoneNotFound(_) => StatusCode::NOT_FOUND,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// General status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub git_sha: &'static str,
    pub uptime_secs: u64,
    pub amplifiers: Vec<String>,
    pub zone_count: usize,
    pub mqtt_connected: bool,
    pub bus_subscribers: usize,
}

/// Result of a zone command
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub ok: bool,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<IgnoreReason>,
}

impl From<CommandOutcome> for CommandResponse {
    fn from(outcome: CommandOutcome) -> Self {
        match outcome {
            CommandOutcome::Sent => Self {
                ok: true,
                outcome: "sent",
                reason: None,
            },
            CommandOutcome::Ignored(reason) => Self {
                ok: true,
                outcome: "ignored",
                reason: Some(reason),
            },
        }
    }
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/zones", get(zones_handler))
        .route("/zones/{zone_id}", get(zone_handler))
        .route("/zones/{zone_id}/command", post(command_handler))
        .route("/zones/{zone_id}/snapshot", post(snapshot_handler))
        .route("/zones/{zone_id}/restore", post(restore_handler))
        // Event stream (SSE)
        .route("/events", get(events_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /status - Service health and connection status
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let mqtt_status = state.mqtt.get_status().await;
    let amplifiers = state
        .speakercraft
        .layout()
        .amps
        .iter()
        .map(|amp| amp.port.clone())
        .collect();

    Json(StatusResponse {
        service: "mzc66-bridge",
        version: env!("MZC_VERSION"),
        git_sha: env!("MZC_GIT_SHA"),
        uptime_secs: state.started.elapsed().as_secs(),
        amplifiers,
        zone_count: state.speakercraft.context().zone_count().await,
        mqtt_connected: mqtt_status.connected,
        bus_subscribers: state.bus.subscriber_count(),
    })
}

// =============================================================================
// Zone handlers
// =============================================================================

/// GET /zones - All registered zones
pub async fn zones_handler(State(state): State<AppState>) -> Json<Vec<ZoneView>> {
    Json(state.speakercraft.zone_views().await)
}

/// GET /zones/{zone_id} - One zone, by unique id or object id
pub async fn zone_handler(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
) -> Result<Json<ZoneView>, DispatchError> {
    state
        .speakercraft
        .zone_view(&zone_id)
        .await
        .map(Json)
        .ok_or(DispatchError::ZoneNotFound(zone_id))
}

/// POST /zones/{zone_id}/command - Run a zone command
pub async fn command_handler(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
    Json(command): Json<ZoneCommand>,
) -> Result<Json<CommandResponse>, DispatchError> {
    run_command(&state, &zone_id, command).await
}

/// POST /zones/{zone_id}/snapshot - Capture the zone's current state
pub async fn snapshot_handler(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
) -> Result<Json<CommandResponse>, DispatchError> {
    run_command(&state, &zone_id, ZoneCommand::Snapshot).await
}

/// POST /zones/{zone_id}/restore - Re-apply the held snapshot
pub async fn restore_handler(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
) -> Result<Json<CommandResponse>, DispatchError> {
    run_command(&state, &zone_id, ZoneCommand::Restore).await
}

async fn run_command(
    state: &AppState,
    zone_id: &str,
    command: ZoneCommand,
) -> Result<Json<CommandResponse>, DispatchError> {
    let outcome = state.speakercraft.execute(zone_id, command).await?;
    Ok(Json(outcome.into()))
}

// =============================================================================
// SSE
// =============================================================================

/// GET /events - Server-Sent Events stream of bus events
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(json) => Some(Ok(Event::default().data(json))),
            Err(_) => None,
        },
        Err(_) => None, // Skip lagged messages
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
