use std::sync::Arc;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::api::{ConsumeError, PublishError, TransportError};
use crate::event::Event;
use crate::handler::EventHandler;
use crate::identity;
use crate::metrics_consts::{
    ACKNOWLEDGE_ERRORS_COUNTER, EVENTS_PUBLISHED_COUNTER, MESSAGES_CONSUMED_COUNTER,
    PUBLISH_ERRORS_COUNTER,
};
use crate::transport::{ReceivedMessage, Transport};

/// What a consume loop did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub handled: usize,
    /// Decoded, but the handler returned an error
    pub failed: usize,
    /// Could not be decoded into an event
    pub skipped: usize,
}

/// Moves events between producers, the broker and a consuming handler.
///
/// Events are routed to one destination per event type,
/// `<destination_prefix><event_type>`, and are keyed by their identity so
/// redeliveries of the same event land on the same partition.
pub struct IngestionPipeline {
    transport: Arc<dyn Transport>,
    destination_prefix: String,
    span: Span,
}

impl IngestionPipeline {
    pub fn new(transport: Arc<dyn Transport>, destination_prefix: impl Into<String>) -> Self {
        let destination_prefix = destination_prefix.into();
        let span = info_span!("ingestion_pipeline", prefix = %destination_prefix);
        Self {
            transport,
            destination_prefix,
            span,
        }
    }

    pub fn destination(&self, event_type: &str) -> String {
        format!("{}{}", self.destination_prefix, event_type)
    }

    /// Fingerprint `event` if needed and send it to its destination. The event
    /// keeps its identity whether or not the send succeeds.
    pub async fn publish(&self, event: &mut Event) -> Result<(), PublishError> {
        let (identity, destination, payload) = self.span.in_scope(|| self.prepare(event))?;

        let sent = self
            .transport
            .send(&destination, Some(&identity), payload)
            .instrument(self.span.clone())
            .await;

        self.span.in_scope(|| match sent {
            Ok(()) => {
                counter!(EVENTS_PUBLISHED_COUNTER, "destination" => destination.clone())
                    .increment(1);
                debug!(identity, destination, "published event");
                Ok(())
            }
            Err(source) => {
                error!(identity, destination, "failed to publish event: {}", source);
                Err(PublishError::Transport {
                    destination,
                    source,
                })
            }
        })
    }

    /// Identity, destination and wire form of an event about to be published.
    fn prepare(&self, event: &mut Event) -> Result<(String, String, Vec<u8>), PublishError> {
        let identity = match identity::assign(event) {
            Ok(identity) => identity.to_owned(),
            Err(e) => {
                counter!(PUBLISH_ERRORS_COUNTER, "cause" => "invalid_event").increment(1);
                error!("failed to fingerprint event: {}", e);
                return Err(e.into());
            }
        };

        let payload = match serde_json::to_vec(&*event) {
            Ok(payload) => payload,
            Err(e) => {
                counter!(PUBLISH_ERRORS_COUNTER, "cause" => "serialization").increment(1);
                error!(identity, "failed to serialize event: {}", e);
                return Err(e.into());
            }
        };

        Ok((identity, self.destination(event.event_type()), payload))
    }

    /// Start receiving the destinations of `event_types`, on top of whatever
    /// was subscribed before.
    pub async fn subscribe<S: AsRef<str>>(&self, event_types: &[S]) -> Result<(), TransportError> {
        let mut destinations: Vec<String> = event_types
            .iter()
            .map(|event_type| self.destination(event_type.as_ref()))
            .collect();
        destinations.sort();
        destinations.dedup();

        self.transport
            .subscribe(&destinations)
            .instrument(self.span.clone())
            .await
    }

    /// Hand every received event to `handler` until `shutdown` is cancelled or
    /// the transport fails.
    ///
    /// Messages that do not decode into an event, and events the handler
    /// fails on, are logged and skipped. Every message is acknowledged once it
    /// has been dealt with, so a crash mid-message means a redelivery, never a
    /// loss.
    pub async fn consume<H>(
        &self,
        handler: &H,
        shutdown: CancellationToken,
    ) -> Result<ConsumeSummary, ConsumeError>
    where
        H: EventHandler + ?Sized,
    {
        self.consume_loop(handler, shutdown)
            .instrument(self.span.clone())
            .await
    }

    async fn consume_loop<H>(
        &self,
        handler: &H,
        shutdown: CancellationToken,
    ) -> Result<ConsumeSummary, ConsumeError>
    where
        H: EventHandler + ?Sized,
    {
        let mut summary = ConsumeSummary::default();
        info!("consuming events");

        loop {
            let message = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(
                        handled = summary.handled,
                        failed = summary.failed,
                        skipped = summary.skipped,
                        "consume loop stopped"
                    );
                    return Ok(summary);
                }
                received = self.transport.recv() => match received {
                    Ok(message) => message,
                    Err(e) => {
                        error!("failed to receive from transport: {}", e);
                        return Err(e.into());
                    }
                },
            };

            match decode(&message) {
                Ok(event) => {
                    let identity = event.identity().unwrap_or_default().to_owned();
                    match handler.handle(event).await {
                        Ok(()) => {
                            summary.handled += 1;
                            counter!(MESSAGES_CONSUMED_COUNTER, "outcome" => "handled")
                                .increment(1);
                        }
                        Err(e) => {
                            summary.failed += 1;
                            counter!(MESSAGES_CONSUMED_COUNTER, "outcome" => "handler_error")
                                .increment(1);
                            error!(
                                identity,
                                destination = message.destination,
                                offset = message.offset,
                                "handler failed, skipping event: {:#}",
                                e
                            );
                        }
                    }
                }
                Err(reason) => {
                    summary.skipped += 1;
                    counter!(MESSAGES_CONSUMED_COUNTER, "outcome" => "malformed").increment(1);
                    warn!(
                        destination = message.destination,
                        partition = message.partition,
                        offset = message.offset,
                        "skipping malformed message: {}",
                        reason
                    );
                }
            }

            if let Err(e) = self.transport.acknowledge(&message).await {
                counter!(ACKNOWLEDGE_ERRORS_COUNTER).increment(1);
                warn!(
                    destination = message.destination,
                    offset = message.offset,
                    "failed to acknowledge message: {}",
                    e
                );
            }
        }
    }

    /// Wait for everything published so far to reach the broker.
    pub async fn flush(&self) -> Result<(), TransportError> {
        self.transport.flush().await
    }
}

/// Decode a message and make sure the event carries an identity.
fn decode(message: &ReceivedMessage) -> Result<Event, String> {
    let mut event = Event::from_slice(&message.payload).map_err(|e| e.to_string())?;
    identity::assign(&mut event).map_err(|e| e.to_string())?;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use time::macros::datetime;

    use super::*;
    use crate::event::{Payload, PayloadValue};
    use crate::test_utils::MemoryTransport;

    fn click(x: i64) -> Event {
        Event::at(
            "svc-a",
            "click",
            datetime!(2024-01-01 0:00 UTC),
            Payload::from([("x".to_string(), PayloadValue::from(x))]),
        )
        .unwrap()
    }

    /// Records every event and cancels the loop once it has seen `stop_after`.
    struct RecordingHandler {
        seen: Mutex<Vec<Event>>,
        stop_after: usize,
        fail_on: Option<i64>,
        shutdown: CancellationToken,
    }

    impl RecordingHandler {
        fn new(stop_after: usize, shutdown: CancellationToken) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                stop_after,
                fail_on: None,
                shutdown,
            }
        }

        fn seen(&self) -> Vec<Event> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: Event) -> anyhow::Result<()> {
            let failing = self.fail_on.is_some()
                && event.payload().get("x") == self.fail_on.map(PayloadValue::from).as_ref();

            let count = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(event);
                seen.len()
            };
            if count >= self.stop_after {
                self.shutdown.cancel();
            }

            if failing {
                anyhow::bail!("refusing event");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn publish_routes_by_event_type_and_keys_by_identity() {
        let transport = Arc::new(MemoryTransport::default());
        let pipeline = IngestionPipeline::new(transport.clone(), "events.");
        let mut event = click(1);

        pipeline.publish(&mut event).await.unwrap();

        let identity = event.identity().unwrap().to_owned();
        assert!(identity::verify(&event));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, "events.click");
        assert_eq!(sent[0].key.as_deref(), Some(identity.as_str()));
        assert_eq!(Event::from_slice(&sent[0].payload).unwrap(), event);
    }

    #[tokio::test]
    async fn publish_reports_transport_failures() {
        let transport = Arc::new(MemoryTransport::default());
        transport.fail_sends(true);
        let pipeline = IngestionPipeline::new(transport.clone(), "events.");
        let mut event = click(1);

        match pipeline.publish(&mut event).await {
            Err(PublishError::Transport { destination, .. }) => {
                assert_eq!(destination, "events.click")
            }
            other => panic!("expected a transport error, got {other:?}"),
        }
        // Fingerprinted anyway, a retry publishes the same identity
        assert!(event.identity().is_some());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_accumulates() {
        let transport = Arc::new(MemoryTransport::default());
        let pipeline = IngestionPipeline::new(transport.clone(), "events.");

        pipeline.subscribe(&["click", "click"]).await.unwrap();
        pipeline.subscribe(&["click"]).await.unwrap();
        assert_eq!(transport.subscriptions(), vec!["events.click"]);

        pipeline.subscribe(&["view"]).await.unwrap();
        assert_eq!(
            transport.subscriptions(),
            vec!["events.click", "events.view"]
        );
    }

    #[tokio::test]
    async fn consume_skips_malformed_messages() {
        let transport = Arc::new(MemoryTransport::default());
        let pipeline = IngestionPipeline::new(transport.clone(), "events.");
        pipeline.subscribe(&["click"]).await.unwrap();

        pipeline.publish(&mut click(1)).await.unwrap();
        transport.push_raw("events.click", b"{not json".to_vec());
        pipeline.publish(&mut click(2)).await.unwrap();

        let shutdown = CancellationToken::new();
        let handler = RecordingHandler::new(2, shutdown.clone());
        let summary = pipeline.consume(&handler, shutdown).await.unwrap();

        assert_eq!(
            summary,
            ConsumeSummary {
                handled: 2,
                failed: 0,
                skipped: 1,
            }
        );
        let seen = handler.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].payload()["x"], PayloadValue::Int(2));
        assert!(seen.iter().all(identity::verify));
        assert_eq!(transport.acknowledged().len(), 3);
    }

    #[tokio::test]
    async fn consume_continues_after_handler_failure() {
        let transport = Arc::new(MemoryTransport::default());
        let pipeline = IngestionPipeline::new(transport.clone(), "events.");
        pipeline.subscribe(&["click"]).await.unwrap();

        for x in 1..=3 {
            pipeline.publish(&mut click(x)).await.unwrap();
        }

        let shutdown = CancellationToken::new();
        let mut handler = RecordingHandler::new(3, shutdown.clone());
        handler.fail_on = Some(2);
        let summary = pipeline.consume(&handler, shutdown).await.unwrap();

        assert_eq!(summary.handled, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(transport.acknowledged().len(), 3);
    }

    #[tokio::test]
    async fn consume_assigns_missing_identities() {
        let transport = Arc::new(MemoryTransport::default());
        let pipeline = IngestionPipeline::new(transport.clone(), "events.");
        transport.push_raw(
            "events.click",
            br#"{"source": "svc-a", "event_type": "click", "timestamp": "2024-01-01T00:00:00Z", "payload": {"x": 1}}"#.to_vec(),
        );

        let shutdown = CancellationToken::new();
        let handler = RecordingHandler::new(1, shutdown.clone());
        pipeline.consume(&handler, shutdown).await.unwrap();

        let mut expected = click(1);
        identity::assign(&mut expected).unwrap();
        assert_eq!(handler.seen(), vec![expected]);
    }

    #[tokio::test]
    async fn receive_failure_ends_the_loop() {
        let transport = Arc::new(MemoryTransport::default());
        let pipeline = IngestionPipeline::new(transport.clone(), "events.");
        pipeline.subscribe(&["click"]).await.unwrap();

        pipeline.publish(&mut click(1)).await.unwrap();
        transport.push_error(TransportError::Closed);

        let shutdown = CancellationToken::new();
        let handler = RecordingHandler::new(usize::MAX, shutdown.clone());

        match pipeline.consume(&handler, shutdown).await {
            Err(ConsumeError::Receive(TransportError::Closed)) => {}
            other => panic!("expected a receive error, got {other:?}"),
        }
        assert_eq!(handler.seen().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_an_idle_loop() {
        let transport = Arc::new(MemoryTransport::default());
        let pipeline = IngestionPipeline::new(transport.clone(), "events.");
        let shutdown = CancellationToken::new();
        let handler = RecordingHandler::new(usize::MAX, shutdown.clone());

        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            stopper.cancel();
        });

        let summary = pipeline.consume(&handler, shutdown).await.unwrap();
        assert_eq!(summary, ConsumeSummary::default());
        assert!(transport.acknowledged().is_empty());
    }
}
