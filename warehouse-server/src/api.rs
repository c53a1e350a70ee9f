use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use warehouse::api::{EventError, PublishError, TransportError};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("failed to parse request: {0}")]
    RequestParsing(String),
    #[error("request holds no events")]
    EmptyBatch,
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] EventError),
    #[error("event is too big")]
    EventTooBig,
    #[error("event queue unavailable, please retry: {0}")]
    Unavailable(String),
}

impl From<PublishError> for ApiError {
    fn from(error: PublishError) -> Self {
        match error {
            PublishError::InvalidEvent(e) => ApiError::InvalidEvent(e),
            PublishError::Serialization(e) => ApiError::RequestParsing(e.to_string()),
            PublishError::Transport {
                source: TransportError::MessageTooLarge,
                ..
            } => ApiError::EventTooBig,
            PublishError::Transport { source, .. } => ApiError::Unavailable(source.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::RequestParsing(_)
            | ApiError::EmptyBatch
            | ApiError::InvalidEvent(_)
            | ApiError::EventTooBig => (StatusCode::BAD_REQUEST, self.to_string()),

            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        }
        .into_response()
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishResponse {
    /// One per published event, in request order
    pub identities: Vec<String>,
}
