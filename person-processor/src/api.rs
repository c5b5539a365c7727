use std::future::ready;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, middleware, routing, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::health::{HealthRegistry, HealthStatus};
use crate::metrics::track_metrics;
use crate::types::Event;
use crate::worker::Worker;

#[derive(Clone)]
pub struct AppState {
    pub worker: Arc<Worker>,
    pub liveness: HealthRegistry,
}

/// Body of `POST /events`: a single event or an array of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EventBatch {
    Many(Vec<Event>),
    One(Box<Event>),
}

impl EventBatch {
    fn into_events(self) -> Vec<Event> {
        match self {
            EventBatch::Many(events) => events,
            EventBatch::One(event) => vec![*event],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsPostResponse {
    pub accepted: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn router(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(liveness))
        .route("/events", routing::post(post_events));

    let router = match metrics {
        Some(handle) => router.route("/metrics", routing::get(move || ready(handle.render()))),
        None => router,
    };

    router
        .layer(middleware::from_fn(track_metrics))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "person processor"
}

async fn liveness(State(state): State<AppState>) -> HealthStatus {
    state.liveness.get_status()
}

/// Enqueue every event of the batch, in order.
///
/// Events accepted before a lane filled up stay accepted; the response reports how many.
pub async fn post_events(
    State(state): State<AppState>,
    Json(batch): Json<EventBatch>,
) -> Result<Json<EventsPostResponse>, (StatusCode, Json<EventsPostResponse>)> {
    let events = batch.into_events();
    debug!(count = events.len(), "received events");

    let mut accepted = 0;
    for event in events {
        if let Err(error) = state.worker.try_submit(event) {
            warn!(accepted, error = %error, "rejecting events");
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(EventsPostResponse {
                    accepted,
                    error: Some(error.to_string()),
                }),
            ));
        }
        accepted += 1;
    }

    Ok(Json(EventsPostResponse {
        accepted,
        error: None,
    }))
}
