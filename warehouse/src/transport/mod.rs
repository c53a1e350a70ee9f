use async_trait::async_trait;

use crate::api::TransportError;

pub mod kafka;

/// A message as handed back by [`Transport::recv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub destination: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// The broker, seen from the pipeline. Delivery is at-least-once: a message may
/// be handed out again until it has been acknowledged.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enqueue `payload` on `destination` and wait for the broker to accept it.
    async fn send(
        &self,
        destination: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Add `destinations` to the current subscription. Subscribing to a
    /// destination twice is a no-op.
    async fn subscribe(&self, destinations: &[String]) -> Result<(), TransportError>;

    async fn recv(&self) -> Result<ReceivedMessage, TransportError>;

    /// Mark a received message as finished with, so its position can be committed.
    async fn acknowledge(&self, message: &ReceivedMessage) -> Result<(), TransportError>;

    async fn flush(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
