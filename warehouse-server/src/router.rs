use std::future::ready;
use std::sync::Arc;

use axum::extract::State as AxumState;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::instrument;
use warehouse::event::Event;
use warehouse::pipeline::IngestionPipeline;

use crate::api::{ApiError, PublishResponse};
use crate::prometheus::{setup_metrics_recorder, track_metrics};

#[derive(Clone)]
pub struct State {
    pub pipeline: Arc<IngestionPipeline>,
}

async fn index() -> &'static str {
    "warehouse"
}

/// Publish one event, or a JSON array of events, and answer with their
/// identities.
#[instrument(skip_all, fields(events = tracing::field::Empty))]
pub async fn publish(
    state: AxumState<State>,
    body: Bytes,
) -> Result<Json<PublishResponse>, ApiError> {
    let mut events = parse_events(&body)?;
    tracing::Span::current().record("events", events.len());

    let mut identities = Vec::with_capacity(events.len());
    for event in &mut events {
        state.pipeline.publish(event).await?;
        identities.push(event.identity().unwrap_or_default().to_owned());
    }

    Ok(Json(PublishResponse { identities }))
}

fn parse_events(body: &[u8]) -> Result<Vec<Event>, ApiError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| ApiError::RequestParsing(e.to_string()))?;

    let events = match value {
        Value::Array(values) => values
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Event>, _>>(),
        value => serde_json::from_value(value).map(|event| vec![event]),
    }
    .map_err(|e| ApiError::RequestParsing(e.to_string()))?;

    if events.is_empty() {
        return Err(ApiError::EmptyBatch);
    }
    Ok(events)
}

pub fn router(pipeline: Arc<IngestionPipeline>, metrics: bool) -> Router {
    let state = State { pipeline };

    let router = Router::new()
        .route("/", get(index))
        .route("/e", post(publish))
        .route("/e/", post(publish))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder in tests does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
