use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use warehouse::config::Config;
use warehouse::handler::StoringHandler;
use warehouse::pipeline::IngestionPipeline;
use warehouse::store::postgres::PgDocumentStore;
use warehouse::store::ReconciliationStore;
use warehouse::time::SystemTime;
use warehouse::transport::kafka::KafkaTransport;

use crate::router;

/// Run the publish endpoint, and the consume loop when enabled, until
/// `shutdown` is cancelled. Whichever side fails first cancels the other.
pub async fn serve(
    config: Config,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let transport = Arc::new(KafkaTransport::new(&config.kafka)?);
    let pipeline = Arc::new(IngestionPipeline::new(
        transport,
        config.destination_prefix.clone(),
    ));

    let consumer = if config.consume {
        Some(start_consumer(&config, pipeline.clone(), shutdown.clone()).await?)
    } else {
        None
    };

    let app = router::router(pipeline.clone(), config.export_prometheus);

    info!("listening on {:?}", listener.local_addr()?);
    let signal = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await;
    // Stop the consumer too if the listener died on its own
    shutdown.cancel();

    let consumed = match consumer {
        Some(handle) => handle.await?,
        None => Ok(()),
    };

    if let Err(e) = pipeline.flush().await {
        error!("failed to flush queued events: {}", e);
    }

    served?;
    consumed
}

async fn start_consumer(
    config: &Config,
    pipeline: Arc<IngestionPipeline>,
    shutdown: CancellationToken,
) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
    let event_types = config.event_types();
    let document_store = PgDocumentStore::connect(&config.store).await?;
    let store = Arc::new(ReconciliationStore::new(
        Arc::new(document_store),
        config.store.store_batch_size,
        config.store.store_upsert_key,
        Arc::new(SystemTime::default()),
    ));
    let handler = StoringHandler::new(store.clone(), config.store.store_collection_prefix.clone());

    let index_fields = config.store.index_fields();
    for event_type in &event_types {
        store
            .create_indexes(&handler.collection(event_type), index_fields.as_slice())
            .await?;
    }

    pipeline.subscribe(event_types.as_slice()).await?;

    Ok(tokio::spawn(async move {
        match pipeline.consume(&handler, shutdown.clone()).await {
            Ok(summary) => {
                info!(
                    handled = summary.handled,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    "consumer stopped"
                );
                Ok(())
            }
            Err(e) => {
                error!("consumer failed: {}", e);
                shutdown.cancel();
                Err(e.into())
            }
        }
    }))
}
