use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::store::{BatchFailure, BatchSummary};

/// Reasons an event is rejected at construction or when read off the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event submitted without a source")]
    MissingSource,
    #[error("event submitted with an empty event_type")]
    MissingEventType,
    #[error("event submitted with an empty payload")]
    EmptyPayload,
    #[error("non-finite number in payload at {0}")]
    NonFiniteNumber(String),
    #[error("timestamp cannot be represented canonically: {0}")]
    InvalidTimestamp(String),
    #[error("event cannot be encoded canonically: {0}")]
    Encoding(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("message exceeds the maximum size accepted by the broker")]
    MessageTooLarge,
    #[error("delivery was cancelled before the broker acknowledged it")]
    DeliveryCanceled,
    #[error("transport closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] EventError),
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to send event to {destination}: {source}")]
    Transport {
        destination: String,
        #[source]
        source: TransportError,
    },
}

/// Only the receive primitive can end a consume loop with an error; everything
/// that happens to a single message is skipped instead.
#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("failed to receive from transport: {0}")]
    Receive(#[from] TransportError),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("document with key {key} already exists in {collection}")]
    DuplicateKey { collection: String, key: String },
    #[error("{0} is not a valid collection name")]
    InvalidCollection(String),
    #[error("{0} is not a valid field name")]
    InvalidField(String),
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("{} of {} operations failed in {collection}", .failures.len(), .summary.operations)]
    BatchWrite {
        collection: String,
        summary: BatchSummary,
        failures: Vec<BatchFailure>,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode document: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("document store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// PostgreSQL reports unique violations with SQLSTATE 23505.
    pub fn is_unique_violation(error: &sqlx::Error) -> bool {
        error
            .as_database_error()
            .and_then(|db_err| db_err.code())
            .as_deref()
            == Some("23505")
    }
}
