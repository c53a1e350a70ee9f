use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message};
use tracing::{debug, error, info, instrument};

use crate::api::TransportError;
use crate::config::KafkaConfig;
use crate::metrics_consts::{
    KAFKA_BROKER_REQUESTS_PENDING_GAUGE, KAFKA_BROKER_RESPONSES_AWAITING_GAUGE,
    KAFKA_BROKER_RX_ERRORS_COUNTER, KAFKA_BROKER_TX_ERRORS_COUNTER,
    KAFKA_CALLBACK_QUEUE_DEPTH_GAUGE, KAFKA_CONSUMER_LAG_GAUGE, KAFKA_PRODUCER_QUEUE_BYTES_GAUGE,
    KAFKA_PRODUCER_QUEUE_BYTES_LIMIT_GAUGE, KAFKA_PRODUCER_QUEUE_DEPTH_GAUGE,
    KAFKA_PRODUCER_QUEUE_DEPTH_LIMIT_GAUGE, PUBLISH_DURATION_HISTOGRAM, PUBLISH_ERRORS_COUNTER,
};
use crate::transport::{ReceivedMessage, Transport};

struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        let client = stats.client_type.clone();

        gauge!(KAFKA_CALLBACK_QUEUE_DEPTH_GAUGE, "client" => client.clone())
            .set(stats.replyq as f64);

        if client == "producer" {
            gauge!(KAFKA_PRODUCER_QUEUE_DEPTH_GAUGE).set(stats.msg_cnt as f64);
            gauge!(KAFKA_PRODUCER_QUEUE_DEPTH_LIMIT_GAUGE).set(stats.msg_max as f64);
            gauge!(KAFKA_PRODUCER_QUEUE_BYTES_GAUGE).set(stats.msg_size as f64);
            gauge!(KAFKA_PRODUCER_QUEUE_BYTES_LIMIT_GAUGE).set(stats.msg_size_max as f64);
        } else {
            for (topic, topic_stats) in stats.topics {
                for (partition, partition_stats) in topic_stats.partitions {
                    // librdkafka reports -1 for the internal UA partition and unknown lag
                    if partition < 0 || partition_stats.consumer_lag < 0 {
                        continue;
                    }
                    gauge!(
                        KAFKA_CONSUMER_LAG_GAUGE,
                        "topic" => topic.clone(),
                        "partition" => partition.to_string()
                    )
                    .set(partition_stats.consumer_lag as f64);
                }
            }
        }

        for (_, broker) in stats.brokers {
            let id_string = format!("{}", broker.nodeid);
            gauge!(
                KAFKA_BROKER_REQUESTS_PENDING_GAUGE,
                "client" => client.clone(),
                "broker" => id_string.clone()
            )
            .set(broker.outbuf_cnt as f64);
            gauge!(
                KAFKA_BROKER_RESPONSES_AWAITING_GAUGE,
                "client" => client.clone(),
                "broker" => id_string.clone()
            )
            .set(broker.waitresp_cnt as f64);
            counter!(
                KAFKA_BROKER_TX_ERRORS_COUNTER,
                "client" => client.clone(),
                "broker" => id_string.clone()
            )
            .absolute(broker.txerrs);
            counter!(
                KAFKA_BROKER_RX_ERRORS_COUNTER,
                "client" => client.clone(),
                "broker" => id_string
            )
            .absolute(broker.rxerrs);
        }
    }
}

impl ConsumerContext for KafkaContext {}

/// [`Transport`] backed by a Kafka producer and a consumer group member.
///
/// Offsets are stored only when a message is acknowledged, and committed in
/// the background from the stored position.
pub struct KafkaTransport {
    producer: FutureProducer<KafkaContext>,
    consumer: StreamConsumer<KafkaContext>,
    subscriptions: Mutex<BTreeSet<String>>,
}

impl KafkaTransport {
    pub fn new(config: &KafkaConfig) -> anyhow::Result<KafkaTransport> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut common_config = ClientConfig::new();
        common_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000");

        if config.kafka_tls {
            common_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let mut producer_config = common_config.clone();
        producer_config
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        let mut consumer_config = common_config;
        consumer_config
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false");

        debug!("rdkafka producer configuration: {:?}", producer_config);
        let producer: FutureProducer<KafkaContext> =
            producer_config.create_with_context(KafkaContext)?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        drop(producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?);
        info!("connected to Kafka brokers");

        debug!("rdkafka consumer configuration: {:?}", consumer_config);
        let consumer: StreamConsumer<KafkaContext> =
            consumer_config.create_with_context(KafkaContext)?;

        Ok(KafkaTransport {
            producer,
            consumer,
            subscriptions: Mutex::new(BTreeSet::new()),
        })
    }

    fn enqueue(
        &self,
        destination: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<DeliveryFuture, TransportError> {
        match self.producer.send_result(FutureRecord {
            topic: destination,
            payload: Some(payload),
            partition: None,
            key,
            timestamp: None,
            headers: None,
        }) {
            Ok(ack) => Ok(ack),
            Err((e, _)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => {
                    counter!(PUBLISH_ERRORS_COUNTER, "cause" => "kafka_message_size").increment(1);
                    Err(TransportError::MessageTooLarge)
                }
                _ => {
                    counter!(PUBLISH_ERRORS_COUNTER, "cause" => "kafka_write_error").increment(1);
                    error!("failed to produce event: {}", e);
                    Err(TransportError::Kafka(e))
                }
            },
        }
    }

    async fn process_ack(delivery: DeliveryFuture) -> Result<(), TransportError> {
        match delivery.await {
            Err(_) => {
                // Cancelled due to timeout while retrying
                counter!(PUBLISH_ERRORS_COUNTER, "cause" => "kafka_timeout").increment(1);
                error!("failed to produce to Kafka before write timeout");
                Err(TransportError::DeliveryCanceled)
            }
            Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _))) => {
                // Rejected by broker due to message size
                counter!(PUBLISH_ERRORS_COUNTER, "cause" => "kafka_message_size").increment(1);
                Err(TransportError::MessageTooLarge)
            }
            Ok(Err((err, _))) => {
                counter!(PUBLISH_ERRORS_COUNTER, "cause" => "kafka_produce_error").increment(1);
                error!("failed to produce to Kafka: {}", err);
                Err(TransportError::Kafka(err))
            }
            Ok(Ok(_)) => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    #[instrument(skip_all, fields(destination = %destination))]
    async fn send(
        &self,
        destination: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let start = Instant::now();
        let ack = self.enqueue(destination, key, &payload)?;
        let result = Self::process_ack(ack).await;
        histogram!(PUBLISH_DURATION_HISTOGRAM).record(start.elapsed().as_secs_f64());
        result
    }

    async fn subscribe(&self, destinations: &[String]) -> Result<(), TransportError> {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let before = subscriptions.len();
        subscriptions.extend(destinations.iter().cloned());
        if subscriptions.len() == before {
            return Ok(());
        }

        let topics: Vec<&str> = subscriptions.iter().map(String::as_str).collect();
        if let Err(e) = self.consumer.subscribe(&topics) {
            // Keep the recorded set in line with what the consumer actually follows
            for destination in destinations {
                subscriptions.remove(destination);
            }
            return Err(e.into());
        }
        info!(topics = ?topics, "subscribed");
        Ok(())
    }

    async fn recv(&self) -> Result<ReceivedMessage, TransportError> {
        let message = self.consumer.recv().await?;

        Ok(ReceivedMessage {
            destination: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    async fn acknowledge(&self, message: &ReceivedMessage) -> Result<(), TransportError> {
        self.consumer
            .store_offset(&message.destination, message.partition, message.offset)?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.producer.flush(Duration::new(30, 0))?;
        Ok(())
    }
}
