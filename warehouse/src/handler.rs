use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use crate::event::Event;
use crate::store::{event_document, ReconciliationStore};

/// Receives each event the consume loop decodes. An `Err` is logged and the
/// loop moves on to the next message.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

/// Writes consumed events into the collection named after their type.
///
/// Goes through the upsert path, so a message the broker delivers twice still
/// ends up as one document. Each event is written as its own one-element
/// batch before the message is acknowledged, so `STORE_BATCH_SIZE` never
/// groups consumed events together.
pub struct StoringHandler {
    store: Arc<ReconciliationStore>,
    collection_prefix: String,
}

impl StoringHandler {
    pub fn new(store: Arc<ReconciliationStore>, collection_prefix: impl Into<String>) -> Self {
        Self {
            store,
            collection_prefix: collection_prefix.into(),
        }
    }

    pub fn collection(&self, event_type: &str) -> String {
        format!("{}{}", self.collection_prefix, event_type)
    }
}

#[async_trait]
impl EventHandler for StoringHandler {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        let collection = self.collection(event.event_type());
        let identity = event.identity().unwrap_or_default().to_owned();
        let document = event_document(&event)?;

        let summary = self
            .store
            .store_batch(&collection, vec![document])
            .await
            .with_context(|| format!("failed to store event {identity} in {collection}"))?;

        debug!(
            collection,
            identity,
            upserted = summary.upserted,
            modified = summary.modified,
            "stored event"
        );
        Ok(())
    }
}
