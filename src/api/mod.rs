//! HTTP control API
//!
//! Every handler is independent; the only shared state is the station store.
//! `/next` is the sole mutator of the active index.

use crate::bus::SharedBus;
use crate::metadata::MetadataResolver;
use crate::store::SharedStore;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::stream::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub resolver: Arc<dyn MetadataResolver>,
    pub bus: SharedBus,
    /// Fired to stop the whole process gracefully
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        store: SharedStore,
        resolver: Arc<dyn MetadataResolver>,
        bus: SharedBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            resolver,
            bus,
            shutdown,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/nowplaying", get(now_playing_handler))
        .route("/next", get(next_handler))
        .route("/current", get(current_handler))
        .route("/restart", get(restart_handler))
        .route("/stations", get(stations_handler))
        .route("/status", get(status_handler))
        .route("/events", get(events_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn plain_text_error(message: &'static str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/plain")],
        message,
    )
        .into_response()
}

#[derive(Serialize)]
pub struct NowPlayingResponse {
    pub artist: String,
    pub title: String,
}

/// GET /nowplaying - Song on air at the current station, resolved on demand
pub async fn now_playing_handler(State(state): State<AppState>) -> Response {
    let station = state.store.current_station().await;
    match state.resolver.resolve(&station).await {
        Ok(song) => Json(NowPlayingResponse {
            artist: song.artist,
            title: song.title,
        })
        .into_response(),
        Err(e) => {
            tracing::warn!("Failed to fetch metadata for {}: {}", station.name, e);
            plain_text_error("Error - Error fetching song data")
        }
    }
}

#[derive(Serialize)]
pub struct NextResponse {
    pub message: &'static str,
    pub station: String,
    pub index: usize,
}

/// GET /next - Switch to the next station, dropping the attached client
pub async fn next_handler(State(state): State<AppState>) -> Json<NextResponse> {
    let switch = state.store.advance_to_next().await;
    Json(NextResponse {
        message: "Switched to next station",
        station: switch.station,
        index: switch.index,
    })
}

#[derive(Serialize)]
pub struct CurrentResponse {
    pub station: String,
    pub index: usize,
}

/// GET /current - Active station
pub async fn current_handler(State(state): State<AppState>) -> Json<CurrentResponse> {
    let snapshot = state.store.snapshot().await;
    Json(CurrentResponse {
        station: snapshot.station,
        index: snapshot.index,
    })
}

#[derive(Serialize)]
pub struct RestartResponse {
    pub message: &'static str,
}

/// GET /restart - Persist the index and shut down for the supervisor to restart us.
///
/// The response is built first; shutdown is triggered from a separate task
/// that yields before cancelling. Graceful shutdown lets this in-flight
/// response finish before the server stops.
pub async fn restart_handler(State(state): State<AppState>) -> Json<RestartResponse> {
    tracing::info!("Received /restart request, shutting down for external restart");

    if let Err(e) = state.store.flush_index().await {
        tracing::warn!("Failed to persist station index before restart: {}", e);
    }

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        shutdown.cancel();
    });

    Json(RestartResponse {
        message: "Server restarting. Expect a brief disconnect.",
    })
}

#[derive(Serialize)]
pub struct StationEntry {
    pub index: usize,
    pub name: String,
}

/// GET /stations - Catalog listing
pub async fn stations_handler(State(state): State<AppState>) -> Json<Vec<StationEntry>> {
    Json(
        state
            .store
            .catalog()
            .iter()
            .enumerate()
            .map(|(index, station)| StationEntry {
                index,
                name: station.name.clone(),
            })
            .collect(),
    )
}

/// General status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub git_sha: &'static str,
    pub uptime_secs: u64,
    pub index: usize,
    pub station: String,
    pub station_count: usize,
    pub client: Option<String>,
    pub event_subscribers: usize,
}

/// GET /status - Service health check
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.store.snapshot().await;
    Json(StatusResponse {
        service: "radio-relay",
        version: env!("RELAY_VERSION"),
        git_sha: env!("RELAY_GIT_SHA"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        index: snapshot.index,
        station: snapshot.station,
        station_count: state.store.catalog().len(),
        client: snapshot.client.map(|c| c.peer),
        event_subscribers: state.bus.subscriber_count(),
    })
}

/// GET /events - Server-Sent Events stream of relay events.
/// Ends when shutdown fires.
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
    let stream = futures::StreamExt::take_until(stream, state.shutdown.clone().cancelled_owned());

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
