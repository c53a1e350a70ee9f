//! Idempotent writes of events into the document store.
//!
//! Every event is written under an authoritative key, so applying the same
//! batch any number of times leaves exactly one document per key. Batches are
//! split into bulk writes of at most `batch_size` operations; bulk writes are
//! unordered, so one rejected operation does not stop the others, and nothing
//! that was applied is rolled back.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::api::StoreError;
use crate::event::Event;
use crate::metrics_consts::{
    DOCUMENTS_WRITTEN_COUNTER, DUPLICATE_KEYS_COUNTER, FLUSH_DURATION_HISTOGRAM,
    FLUSH_SIZE_HISTOGRAM, QUERY_ERRORS_COUNTER,
};
use crate::time::TimeSource;

pub mod postgres;

pub type Document = Map<String, Value>;

pub const PRIMARY_KEY_FIELD: &str = "_id";
pub const IDENTITY_FIELD: &str = "identity";
pub const STORED_AT_FIELD: &str = "stored_at";

/// Set the fields of `set` on the document stored under `key`, inserting it
/// when missing and `upsert` is true.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOp {
    pub key: String,
    pub set: Document,
    pub upsert: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteError {
    /// Position of the failed operation in the submitted list
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
    pub write_errors: Vec<WriteError>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document, failing with [`StoreError::DuplicateKey`] when its
    /// `_id` is taken. Returns the key the document was stored under.
    async fn insert_one(&self, collection: &str, document: Document)
        -> Result<String, StoreError>;

    /// Apply `operations` without ordering guarantees. Per-operation failures
    /// are reported in [`BulkWriteResult::write_errors`]; `Err` means the whole
    /// call failed.
    async fn bulk_upsert(
        &self,
        collection: &str,
        operations: Vec<UpsertOp>,
    ) -> Result<BulkWriteResult, StoreError>;

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError>;

    async fn ensure_index(&self, collection: &str, field: &str) -> Result<(), StoreError>;
}

/// Which document field decides the key a batch write lands on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpsertKey {
    /// `identity` is authoritative and is copied into `_id`
    #[default]
    Identity,
    /// `_id` is authoritative, `identity` is used when `_id` is absent
    PrimaryKey,
}

impl FromStr for UpsertKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "identity" => Ok(UpsertKey::Identity),
            "primary_key" | "_id" => Ok(UpsertKey::PrimaryKey),
            _ => Err(format!("Unknown upsert key: {s}")),
        }
    }
}

/// Aggregate counts over every flush of one `store_batch` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub operations: usize,
    pub flushes: usize,
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// Position of the document in the batch handed to `store_batch`
    pub index: usize,
    pub key: Option<String>,
    pub reason: String,
}

pub struct ReconciliationStore {
    store: Arc<dyn DocumentStore>,
    batch_size: usize,
    upsert_key: UpsertKey,
    time_source: Arc<dyn TimeSource + Send + Sync>,
    span: Span,
}

impl ReconciliationStore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        batch_size: usize,
        upsert_key: UpsertKey,
        time_source: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            batch_size,
            upsert_key,
            time_source,
            span: info_span!("reconciliation_store", batch_size, upsert_key = ?upsert_key),
        }
    }

    /// Insert a single document. With an identity, the identity becomes the
    /// document key and a second insert with it fails with
    /// [`StoreError::DuplicateKey`].
    pub async fn store_one(
        &self,
        collection: &str,
        mut document: Document,
        identity: Option<&str>,
    ) -> Result<String, StoreError> {
        if let Some(identity) = identity {
            if identity.is_empty() {
                return Err(StoreError::InvalidDocument(
                    "identity must not be empty".to_string(),
                ));
            }
            document.insert(
                PRIMARY_KEY_FIELD.to_string(),
                Value::String(identity.to_owned()),
            );
        }
        document.insert(STORED_AT_FIELD.to_string(), self.stored_at()?);

        let result = self
            .store
            .insert_one(collection, document)
            .instrument(self.span.clone())
            .await;

        let _entered = self.span.enter();
        match result {
            Ok(key) => {
                counter!(DOCUMENTS_WRITTEN_COUNTER, "result" => "inserted").increment(1);
                info!(collection, key = %key, "stored document");
                Ok(key)
            }
            Err(err @ StoreError::DuplicateKey { .. }) => {
                counter!(DUPLICATE_KEYS_COUNTER).increment(1);
                warn!(collection, "{}", err);
                Err(err)
            }
            Err(err) => {
                error!(collection, "failed to store document: {}", err);
                Err(err)
            }
        }
    }

    /// Upsert every document under its authoritative key, `batch_size`
    /// operations per bulk write. Returns `Ok` only if every operation
    /// succeeded; otherwise the error carries the counts of what was applied
    /// and one entry per failed document.
    pub async fn store_batch(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<BatchSummary, StoreError> {
        let stored_at = self.stored_at()?;
        let mut batch = PendingBatch::new(self.batch_size);

        for (index, mut document) in documents.into_iter().enumerate() {
            batch.summary.operations += 1;
            document.insert(STORED_AT_FIELD.to_string(), stored_at.clone());

            match self.resolve_key(&mut document) {
                Ok(key) => batch.push(
                    index,
                    UpsertOp {
                        key,
                        set: document,
                        upsert: true,
                    },
                ),
                Err(reason) => {
                    counter!(DOCUMENTS_WRITTEN_COUNTER, "result" => "failed").increment(1);
                    batch.failures.push(BatchFailure {
                        index,
                        key: None,
                        reason,
                    });
                }
            }

            if batch.is_full() {
                self.flush(collection, &mut batch)
                    .instrument(self.span.clone())
                    .await;
            }
        }

        if !batch.is_empty() {
            self.flush(collection, &mut batch)
                .instrument(self.span.clone())
                .await;
        }

        let PendingBatch {
            summary, failures, ..
        } = batch;
        if failures.is_empty() {
            Ok(summary)
        } else {
            let _entered = self.span.enter();
            warn!(
                collection,
                failed = failures.len(),
                operations = summary.operations,
                "batch write finished with failures"
            );
            Err(StoreError::BatchWrite {
                collection: collection.to_owned(),
                summary,
                failures,
            })
        }
    }

    /// Make sure one secondary index exists per field.
    pub async fn create_indexes<S: AsRef<str>>(
        &self,
        collection: &str,
        fields: &[S],
    ) -> Result<(), StoreError> {
        for field in fields {
            let field = field.as_ref();
            self.store
                .ensure_index(collection, field)
                .instrument(self.span.clone())
                .await?;
            let _entered = self.span.enter();
            info!(collection, field, "index ready");
        }
        Ok(())
    }

    /// Read at most `limit` documents matching `filter`. A failed read is
    /// logged and answered with no documents.
    pub async fn query(&self, collection: &str, filter: &Document, limit: usize) -> Vec<Document> {
        let result = self
            .store
            .find(collection, filter, limit)
            .instrument(self.span.clone())
            .await;

        match result {
            Ok(documents) => documents,
            Err(err) => {
                let _entered = self.span.enter();
                counter!(QUERY_ERRORS_COUNTER).increment(1);
                error!(collection, "query failed, returning no documents: {}", err);
                Vec::new()
            }
        }
    }

    async fn flush(&self, collection: &str, batch: &mut PendingBatch) {
        let operations = std::mem::take(&mut batch.operations);
        let positions = std::mem::take(&mut batch.positions);
        let keys: Vec<String> = operations.iter().map(|op| op.key.clone()).collect();
        let size = operations.len();

        batch.summary.flushes += 1;
        histogram!(FLUSH_SIZE_HISTOGRAM).record(size as f64);

        let start = Instant::now();
        let result = self.store.bulk_upsert(collection, operations).await;
        histogram!(FLUSH_DURATION_HISTOGRAM).record(start.elapsed().as_secs_f64());

        match result {
            Ok(result) => {
                batch.summary.matched += result.matched;
                batch.summary.modified += result.modified;
                batch.summary.upserted += result.upserted;

                counter!(DOCUMENTS_WRITTEN_COUNTER, "result" => "matched")
                    .increment(result.matched);
                counter!(DOCUMENTS_WRITTEN_COUNTER, "result" => "modified")
                    .increment(result.modified);
                counter!(DOCUMENTS_WRITTEN_COUNTER, "result" => "upserted")
                    .increment(result.upserted);
                counter!(DOCUMENTS_WRITTEN_COUNTER, "result" => "failed")
                    .increment(result.write_errors.len() as u64);

                info!(
                    collection,
                    operations = size,
                    modified = result.modified,
                    upserted = result.upserted,
                    failed = result.write_errors.len(),
                    "flushed batch"
                );

                for write_error in result.write_errors {
                    let Some(index) = positions.get(write_error.index) else {
                        error!(
                            collection,
                            index = write_error.index,
                            "store reported a write error outside the flushed batch"
                        );
                        continue;
                    };
                    batch.failures.push(BatchFailure {
                        index: *index,
                        key: keys.get(write_error.index).cloned(),
                        reason: write_error.message,
                    });
                }
            }
            Err(err) => {
                counter!(DOCUMENTS_WRITTEN_COUNTER, "result" => "failed").increment(size as u64);
                error!(collection, operations = size, "bulk write failed: {}", err);

                let reason = err.to_string();
                for (index, key) in positions.into_iter().zip(keys) {
                    batch.failures.push(BatchFailure {
                        index,
                        key: Some(key),
                        reason: reason.clone(),
                    });
                }
            }
        }
    }

    /// Work out the key a document is upserted under and make `_id` agree with it.
    fn resolve_key(&self, document: &mut Document) -> Result<String, String> {
        let identity = document
            .get(IDENTITY_FIELD)
            .and_then(Value::as_str)
            .filter(|identity| !identity.is_empty())
            .map(str::to_owned);
        let primary = document.get(PRIMARY_KEY_FIELD).and_then(key_string);

        let key = match self.upsert_key {
            UpsertKey::Identity => {
                let identity = identity.ok_or("document has no identity")?;
                if let Some(primary) = primary.filter(|primary| *primary != identity) {
                    let _entered = self.span.enter();
                    warn!(
                        identity = %identity,
                        primary_key = %primary,
                        "document primary key differs from its identity, using identity"
                    );
                }
                identity
            }
            UpsertKey::PrimaryKey => primary
                .or(identity)
                .ok_or("document has neither _id nor identity")?,
        };

        document.insert(PRIMARY_KEY_FIELD.to_string(), Value::String(key.clone()));
        Ok(key)
    }

    fn stored_at(&self) -> Result<Value, StoreError> {
        self.time_source
            .current_time()
            .format(&Rfc3339)
            .map(Value::String)
            .map_err(|e| StoreError::InvalidDocument(format!("cannot stamp stored_at: {e}")))
    }
}

/// Document form of an event, as handed to [`ReconciliationStore`].
pub fn event_document(event: &Event) -> Result<Document, StoreError> {
    Ok(event.to_document()?)
}

fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(key) if !key.is_empty() => Some(key.clone()),
        Value::Number(key) => Some(key.to_string()),
        _ => None,
    }
}

struct PendingBatch {
    capacity: usize,
    operations: Vec<UpsertOp>,
    // Index in the caller's batch of each pending operation
    positions: Vec<usize>,
    summary: BatchSummary,
    failures: Vec<BatchFailure>,
}

impl PendingBatch {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            operations: Vec::with_capacity(capacity),
            positions: Vec::with_capacity(capacity),
            summary: BatchSummary::default(),
            failures: Vec::new(),
        }
    }

    fn push(&mut self, index: usize, operation: UpsertOp) {
        self.operations.push(operation);
        self.positions.push(index);
    }

    fn is_full(&self) -> bool {
        self.operations.len() >= self.capacity
    }

    fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
