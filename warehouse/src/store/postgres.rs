//! [`DocumentStore`] on PostgreSQL.
//!
//! Each collection is a table `(id TEXT PRIMARY KEY, document JSONB NOT NULL)`,
//! created the first time the collection is used. Upserts merge the new fields
//! into the stored document (`document || new`), filters are JSONB containment
//! and secondary indexes are expression indexes on `document->>'field'`.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::StoreError;
use crate::config::StoreConfig;
use crate::store::{
    BulkWriteResult, Document, DocumentStore, UpsertOp, WriteError, PRIMARY_KEY_FIELD,
};

// PostgreSQL truncates identifiers longer than this
const MAX_IDENTIFIER_LENGTH: usize = 63;

pub struct PgDocumentStore {
    pool: PgPool,
    known_tables: Mutex<HashSet<String>>,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            known_tables: Mutex::new(HashSet::new()),
        }
    }

    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = PgConnectOptions::from_str(&config.store_database_url)?
            .database(&config.store_database_name);
        let pool = PgPoolOptions::new()
            .max_connections(config.store_max_connections)
            .connect_with(options)
            .await?;

        info!(
            database = %config.store_database_name,
            "connected to document store"
        );
        Ok(Self::new(pool))
    }

    async fn ensure_table(&self, collection: &str) -> Result<(), StoreError> {
        validate_collection(collection)?;
        if self.tables().contains(collection) {
            return Ok(());
        }

        let statement = format!(
            r#"CREATE TABLE IF NOT EXISTS "{collection}" (id TEXT PRIMARY KEY, document JSONB NOT NULL)"#
        );
        sqlx::query(&statement).execute(&self.pool).await?;
        debug!(collection, "collection table ready");

        self.tables().insert(collection.to_owned());
        Ok(())
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.known_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert `operations` in one statement. Returns, per operation, whether
    /// the row was inserted (`Some(true)`), changed (`Some(false)`), or left
    /// as it was (`None`).
    async fn upsert_rows(
        &self,
        collection: &str,
        operations: &[CoalescedOp],
    ) -> Result<Vec<Option<bool>>, sqlx::Error> {
        let records: Vec<Value> = operations
            .iter()
            .map(|op| json!({"key": op.key, "document": op.set}))
            .collect();

        let statement = format!(
            r#"
INSERT INTO "{collection}" (id, document)
SELECT op.key, op.document
FROM jsonb_to_recordset($1::jsonb) AS op(key TEXT, document JSONB)
ON CONFLICT (id) DO UPDATE SET document = "{collection}".document || EXCLUDED.document
WHERE "{collection}".document IS DISTINCT FROM "{collection}".document || EXCLUDED.document
RETURNING id, (xmax = 0) AS inserted
            "#
        );

        let rows = sqlx::query(&statement)
            .bind(Json(Value::Array(records)))
            .fetch_all(&self.pool)
            .await?;

        let mut written = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let inserted: bool = row.try_get("inserted")?;
            written.insert(id, inserted);
        }

        Ok(operations
            .iter()
            .map(|op| written.get(&op.key).copied())
            .collect())
    }

    /// Update without inserting. Returns whether a row matched.
    async fn update_row(
        &self,
        collection: &str,
        operation: &CoalescedOp,
    ) -> Result<bool, sqlx::Error> {
        let statement =
            format!(r#"UPDATE "{collection}" SET document = document || $2 WHERE id = $1"#);
        let result = sqlx::query(&statement)
            .bind(&operation.key)
            .bind(Json(&operation.set))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn insert_one(
        &self,
        collection: &str,
        mut document: Document,
    ) -> Result<String, StoreError> {
        self.ensure_table(collection).await?;

        let key = match document.get(PRIMARY_KEY_FIELD).and_then(Value::as_str) {
            Some(key) if !key.is_empty() => key.to_owned(),
            _ => {
                let key = Uuid::now_v7().to_string();
                document.insert(PRIMARY_KEY_FIELD.to_string(), Value::String(key.clone()));
                key
            }
        };

        let statement = format!(r#"INSERT INTO "{collection}" (id, document) VALUES ($1, $2)"#);
        let result = sqlx::query(&statement)
            .bind(&key)
            .bind(Json(&document))
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(key),
            Err(e) if StoreError::is_unique_violation(&e) => Err(StoreError::DuplicateKey {
                collection: collection.to_owned(),
                key,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        operations: Vec<UpsertOp>,
    ) -> Result<BulkWriteResult, StoreError> {
        self.ensure_table(collection).await?;

        let coalesced = coalesce_operations(operations);
        let (upserts, updates): (Vec<_>, Vec<_>) =
            coalesced.into_iter().partition(|op| op.upsert);

        let mut result = BulkWriteResult::default();

        if !upserts.is_empty() {
            match self.upsert_rows(collection, &upserts).await {
                Ok(outcomes) => {
                    for (op, outcome) in upserts.iter().zip(outcomes) {
                        record_upsert(&mut result, op, outcome);
                    }
                }
                Err(e) => {
                    // One bad row fails the whole statement: retry row by row to
                    // find out which ones
                    warn!(
                        collection,
                        operations = upserts.len(),
                        "bulk upsert failed, applying operations one by one: {}",
                        e
                    );
                    for op in &upserts {
                        match self.upsert_rows(collection, std::slice::from_ref(op)).await {
                            Ok(outcomes) => {
                                record_upsert(&mut result, op, outcomes.into_iter().next().flatten())
                            }
                            Err(e) => record_failure(&mut result, op, &e),
                        }
                    }
                }
            }
        }

        for op in &updates {
            match self.update_row(collection, op).await {
                Ok(true) => {
                    result.matched += 1;
                    result.modified += 1;
                }
                Ok(false) => {}
                Err(e) => record_failure(&mut result, op, &e),
            }
        }

        Ok(result)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        self.ensure_table(collection).await?;

        let statement = format!(
            r#"SELECT document FROM "{collection}" WHERE document @> $1 ORDER BY id LIMIT $2"#
        );
        let rows = sqlx::query(&statement)
            .bind(Json(filter))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(document): Json<Document> = row.try_get("document")?;
            documents.push(document);
        }
        Ok(documents)
    }

    async fn ensure_index(&self, collection: &str, field: &str) -> Result<(), StoreError> {
        self.ensure_table(collection).await?;
        validate_field(field)?;

        if field == PRIMARY_KEY_FIELD {
            // Already covered by the primary key
            return Ok(());
        }

        let statement = format!(
            r#"CREATE INDEX IF NOT EXISTS "{}" ON "{collection}" ((document->>'{field}'))"#,
            index_name(collection, field)
        );
        sqlx::query(&statement).execute(&self.pool).await?;
        Ok(())
    }
}

/// Operations sharing a key, merged in submission order.
#[derive(Debug, PartialEq)]
struct CoalescedOp {
    key: String,
    set: Document,
    upsert: bool,
    // Positions of the merged operations in the submitted list
    indexes: Vec<usize>,
}

/// Merge operations on the same key so a single statement never touches a row
/// twice. Later fields win, and the merged operation upserts if any of its
/// parts did.
fn coalesce_operations(operations: Vec<UpsertOp>) -> Vec<CoalescedOp> {
    let mut coalesced: Vec<CoalescedOp> = Vec::with_capacity(operations.len());
    let mut by_key: HashMap<String, usize> = HashMap::with_capacity(operations.len());

    for (index, op) in operations.into_iter().enumerate() {
        match by_key.get(&op.key) {
            Some(&position) => {
                let existing = &mut coalesced[position];
                existing.set.extend(op.set);
                existing.upsert |= op.upsert;
                existing.indexes.push(index);
            }
            None => {
                by_key.insert(op.key.clone(), coalesced.len());
                coalesced.push(CoalescedOp {
                    key: op.key,
                    set: op.set,
                    upsert: op.upsert,
                    indexes: vec![index],
                });
            }
        }
    }

    coalesced
}

fn record_upsert(result: &mut BulkWriteResult, op: &CoalescedOp, outcome: Option<bool>) {
    let count = op.indexes.len() as u64;
    match outcome {
        Some(true) => {
            // The first operation inserted, the rest updated the fresh row
            result.upserted += 1;
            result.matched += count - 1;
            result.modified += count - 1;
        }
        Some(false) => {
            result.matched += count;
            result.modified += count;
        }
        None => result.matched += count,
    }
}

fn record_failure(result: &mut BulkWriteResult, op: &CoalescedOp, error: &sqlx::Error) {
    for &index in &op.indexes {
        result.write_errors.push(WriteError {
            index,
            message: error.to_string(),
        });
    }
}

/// Index names share one namespace with tables, so they are derived from a
/// digest of the pair rather than by joining the two names.
fn index_name(collection: &str, field: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collection.as_bytes());
    hasher.update(b"\0");
    hasher.update(field.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("ix_{}", &digest[..16])
}

fn validate_collection(collection: &str) -> Result<(), StoreError> {
    let valid = !collection.is_empty()
        && collection.len() <= MAX_IDENTIFIER_LENGTH
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidCollection(collection.to_owned()))
    }
}

fn validate_field(field: &str) -> Result<(), StoreError> {
    let valid = !field.is_empty()
        && field.len() <= MAX_IDENTIFIER_LENGTH
        && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidField(field.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn op(key: &str, set: Value, upsert: bool) -> UpsertOp {
        let Value::Object(set) = set else {
            panic!("not an object")
        };
        UpsertOp {
            key: key.to_string(),
            set,
            upsert,
        }
    }

    fn document(value: Value) -> Document {
        let Value::Object(document) = value else {
            panic!("not an object")
        };
        document
    }

    #[test]
    fn coalesces_operations_on_the_same_key_in_order() {
        let coalesced = coalesce_operations(vec![
            op("a", json!({"x": 1, "y": 1}), true),
            op("b", json!({"x": 2}), false),
            op("a", json!({"y": 2}), false),
        ]);

        assert_eq!(
            coalesced,
            vec![
                CoalescedOp {
                    key: "a".to_string(),
                    set: document(json!({"x": 1, "y": 2})),
                    upsert: true,
                    indexes: vec![0, 2],
                },
                CoalescedOp {
                    key: "b".to_string(),
                    set: document(json!({"x": 2})),
                    upsert: false,
                    indexes: vec![1],
                },
            ]
        );
    }

    #[test]
    fn counts_merged_operations() {
        let merged = CoalescedOp {
            key: "a".to_string(),
            set: Document::new(),
            upsert: true,
            indexes: vec![0, 3],
        };
        let mut result = BulkWriteResult::default();

        record_upsert(&mut result, &merged, Some(true));
        assert_eq!((result.upserted, result.matched, result.modified), (1, 1, 1));

        record_upsert(&mut result, &merged, None);
        assert_eq!((result.upserted, result.matched, result.modified), (1, 3, 1));
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        assert!(validate_collection("events.click").is_ok());
        assert!(validate_collection("page_view-v2").is_ok());
        assert!(validate_collection("").is_err());
        assert!(validate_collection(r#"click"; DROP TABLE x; --"#).is_err());
        assert!(validate_collection(&"c".repeat(64)).is_err());

        assert!(validate_field("timestamp").is_ok());
        assert!(validate_field("_id").is_ok());
        assert!(validate_field("payload.x").is_err());
        assert!(validate_field("x'); --").is_err());
    }

    #[test]
    fn index_names_are_distinct_for_long_identifiers() {
        let collection = "c".repeat(MAX_IDENTIFIER_LENGTH);
        let first_field = format!("{}_a", "f".repeat(60));
        let second_field = format!("{}_b", "f".repeat(60));

        let names = [
            index_name(&collection, "source"),
            index_name(&collection, &first_field),
            index_name(&collection, &second_field),
            index_name("a_b", "c"),
            index_name("a", "b_c"),
        ];

        for name in &names {
            assert_eq!(name.len(), 19);
            assert!(name.starts_with("ix_"));
            assert_ne!(name, &collection);
        }
        let unique: HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        assert_eq!(index_name("click", "source"), index_name("click", "source"));
    }

    #[sqlx::test]
    #[ignore = "needs a running PostgreSQL, set DATABASE_URL"]
    async fn upserts_are_idempotent(db: PgPool) {
        let store = PgDocumentStore::new(db);
        let operations = || {
            vec![
                op("a", json!({"_id": "a", "x": 1}), true),
                op("b", json!({"_id": "b", "x": 2}), true),
            ]
        };

        let first = store.bulk_upsert("click", operations()).await.unwrap();
        assert_eq!(first.upserted, 2);

        let second = store.bulk_upsert("click", operations()).await.unwrap();
        assert_eq!(second.upserted, 0);
        assert_eq!(second.matched, 2);
        assert_eq!(second.modified, 0);

        let found = store
            .find("click", &document(json!({"x": 2})), 10)
            .await
            .unwrap();
        assert_eq!(found, vec![document(json!({"_id": "b", "x": 2}))]);
    }

    #[sqlx::test]
    #[ignore = "needs a running PostgreSQL, set DATABASE_URL"]
    async fn insert_reports_duplicate_keys(db: PgPool) {
        let store = PgDocumentStore::new(db);

        let key = store
            .insert_one("click", document(json!({"_id": "a"})))
            .await
            .unwrap();
        assert_eq!(key, "a");

        match store
            .insert_one("click", document(json!({"_id": "a"})))
            .await
        {
            Err(StoreError::DuplicateKey { key, .. }) => assert_eq!(key, "a"),
            other => panic!("expected a duplicate key error, got {other:?}"),
        }

        store.ensure_index("click", "source").await.unwrap();
        store.ensure_index("click", "_id").await.unwrap();
    }
}
