//! In-memory stand-ins for the broker, the document store and the clock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::{StoreError, TransportError};
use crate::store::{BulkWriteResult, Document, DocumentStore, UpsertOp, WriteError};
use crate::time::TimeSource;
use crate::transport::{ReceivedMessage, Transport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct FixedTime {
    pub time: OffsetDateTime,
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> OffsetDateTime {
        self.time
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub destination: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

type Delivery = Result<ReceivedMessage, TransportError>;

/// Loopback broker: sends to a subscribed destination are queued for `recv`.
pub struct MemoryTransport {
    subscriptions: Mutex<BTreeSet<String>>,
    sender: mpsc::UnboundedSender<Delivery>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    offsets: Mutex<HashMap<String, i64>>,
    sent: Mutex<Vec<SentMessage>>,
    acknowledged: Mutex<Vec<ReceivedMessage>>,
    fail_sends: AtomicBool,
    flushes: AtomicUsize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        Self {
            subscriptions: Mutex::new(BTreeSet::new()),
            sender,
            inbox: tokio::sync::Mutex::new(inbox),
            offsets: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            acknowledged: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            flushes: AtomicUsize::new(0),
        }
    }
}

impl MemoryTransport {
    /// Queue a message for `recv` whether or not its destination is subscribed.
    pub fn push_raw(&self, destination: &str, payload: Vec<u8>) {
        let offset = {
            let mut offsets = lock(&self.offsets);
            let next = offsets.entry(destination.to_owned()).or_insert(0);
            let offset = *next;
            *next += 1;
            offset
        };

        // The receiving half lives as long as self
        drop(self.sender.send(Ok(ReceivedMessage {
            destination: destination.to_owned(),
            partition: 0,
            offset,
            payload,
        })));
    }

    /// Make the next `recv` fail with `error`.
    pub fn push_error(&self, error: TransportError) {
        drop(self.sender.send(Err(error)));
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    pub fn acknowledged(&self) -> Vec<ReceivedMessage> {
        lock(&self.acknowledged).clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).iter().cloned().collect()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(
        &self,
        destination: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Other("injected send failure".to_string()));
        }

        lock(&self.sent).push(SentMessage {
            destination: destination.to_owned(),
            key: key.map(str::to_owned),
            payload: payload.clone(),
        });

        let subscribed = lock(&self.subscriptions).contains(destination);
        if subscribed {
            self.push_raw(destination, payload);
        }
        Ok(())
    }

    async fn subscribe(&self, destinations: &[String]) -> Result<(), TransportError> {
        lock(&self.subscriptions).extend(destinations.iter().cloned());
        Ok(())
    }

    async fn recv(&self) -> Result<ReceivedMessage, TransportError> {
        let mut inbox = self.inbox.lock().await;
        inbox.recv().await.unwrap_or(Err(TransportError::Closed))
    }

    async fn acknowledge(&self, message: &ReceivedMessage) -> Result<(), TransportError> {
        lock(&self.acknowledged).push(message.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Document store keeping collections in ordered maps, with switches to make
/// individual calls fail.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Document>>>,
    indexes: Mutex<Vec<(String, String)>>,
    bulk_calls: Mutex<Vec<usize>>,
    failing_bulk_calls: AtomicUsize,
    fail_reads: AtomicBool,
    fail_indexes: AtomicBool,
    failing_keys: Mutex<HashSet<String>>,
}

impl MemoryDocumentStore {
    pub fn get(&self, collection: &str, key: &str) -> Option<Document> {
        lock(&self.collections)
            .get(collection)
            .and_then(|documents| documents.get(key))
            .cloned()
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        lock(&self.collections)
            .get(collection)
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, collection: &str) -> usize {
        lock(&self.collections)
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Number of operations in each `bulk_upsert` call, in call order.
    pub fn bulk_calls(&self) -> Vec<usize> {
        lock(&self.bulk_calls).clone()
    }

    pub fn indexes(&self) -> Vec<(String, String)> {
        lock(&self.indexes).clone()
    }

    /// Fail the next `count` bulk writes as a whole.
    pub fn fail_bulk_calls(&self, count: usize) {
        self.failing_bulk_calls.store(count, Ordering::SeqCst);
    }

    /// Reject every write to `key` with a per-operation error.
    pub fn fail_key(&self, key: &str) {
        lock(&self.failing_keys).insert(key.to_owned());
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_indexes(&self, fail: bool) {
        self.fail_indexes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert_one(
        &self,
        collection: &str,
        mut document: Document,
    ) -> Result<String, StoreError> {
        let key = match document.get("_id").and_then(Value::as_str) {
            Some(key) if !key.is_empty() => key.to_owned(),
            _ => {
                let key = Uuid::now_v7().to_string();
                document.insert("_id".to_string(), Value::String(key.clone()));
                key
            }
        };

        let mut collections = lock(&self.collections);
        let documents = collections.entry(collection.to_owned()).or_default();
        if documents.contains_key(&key) {
            return Err(StoreError::DuplicateKey {
                collection: collection.to_owned(),
                key,
            });
        }
        documents.insert(key.clone(), document);
        Ok(key)
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        operations: Vec<UpsertOp>,
    ) -> Result<BulkWriteResult, StoreError> {
        lock(&self.bulk_calls).push(operations.len());

        let failing = self
            .failing_bulk_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("injected bulk failure".to_string()));
        }

        let failing_keys = lock(&self.failing_keys).clone();
        let mut collections = lock(&self.collections);
        let documents = collections.entry(collection.to_owned()).or_default();
        let mut result = BulkWriteResult::default();

        for (index, op) in operations.into_iter().enumerate() {
            if failing_keys.contains(&op.key) {
                result.write_errors.push(WriteError {
                    index,
                    message: format!("injected write failure for {}", op.key),
                });
                continue;
            }

            match documents.get_mut(&op.key) {
                Some(existing) => {
                    result.matched += 1;
                    let before = existing.clone();
                    existing.extend(op.set);
                    if *existing != before {
                        result.modified += 1;
                    }
                }
                None if op.upsert => {
                    let mut document = op.set;
                    document.insert("_id".to_string(), Value::String(op.key.clone()));
                    documents.insert(op.key, document);
                    result.upserted += 1;
                }
                None => {}
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
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }

        Ok(lock(&self.collections)
            .get(collection)
            .map(|documents| {
                documents
                    .values()
                    .filter(|document| {
                        filter
                            .iter()
                            .all(|(field, value)| document.get(field) == Some(value))
                    })
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ensure_index(&self, collection: &str, field: &str) -> Result<(), StoreError> {
        if self.fail_indexes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected index failure".to_string()));
        }

        let mut indexes = lock(&self.indexes);
        let index = (collection.to_owned(), field.to_owned());
        if !indexes.contains(&index) {
            indexes.push(index);
        }
        Ok(())
    }
}
