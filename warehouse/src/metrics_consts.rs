// ==== Publish side ====
/// Counter for events accepted by the broker
pub const EVENTS_PUBLISHED_COUNTER: &str = "warehouse_events_published_total";

/// Counter for events that could not be published, with a `cause` label
pub const PUBLISH_ERRORS_COUNTER: &str = "warehouse_publish_errors_total";

/// Histogram for the time spent waiting on the broker acknowledgement
pub const PUBLISH_DURATION_HISTOGRAM: &str = "warehouse_publish_duration_seconds";

// ==== Consume side ====
/// Counter for received messages, with an `outcome` label: handled, handler_error, malformed
pub const MESSAGES_CONSUMED_COUNTER: &str = "warehouse_messages_consumed_total";

/// Counter for failed acknowledgements
pub const ACKNOWLEDGE_ERRORS_COUNTER: &str = "warehouse_acknowledge_errors_total";

// ==== Store side ====
/// Histogram for the number of operations sent in one bulk write
pub const FLUSH_SIZE_HISTOGRAM: &str = "warehouse_store_flush_size";

/// Histogram for bulk write duration
pub const FLUSH_DURATION_HISTOGRAM: &str = "warehouse_store_flush_duration_seconds";

/// Counter for documents written, with a `result` label: upserted, modified, matched, failed
pub const DOCUMENTS_WRITTEN_COUNTER: &str = "warehouse_store_documents_total";

/// Counter for plain inserts rejected because the key already exists
pub const DUPLICATE_KEYS_COUNTER: &str = "warehouse_store_duplicate_keys_total";

/// Counter for reads that failed and were answered with an empty result
pub const QUERY_ERRORS_COUNTER: &str = "warehouse_store_query_errors_total";

// ==== Kafka client statistics ====
pub const KAFKA_CALLBACK_QUEUE_DEPTH_GAUGE: &str = "warehouse_kafka_callback_queue_depth";
pub const KAFKA_PRODUCER_QUEUE_DEPTH_GAUGE: &str = "warehouse_kafka_producer_queue_depth";
pub const KAFKA_PRODUCER_QUEUE_DEPTH_LIMIT_GAUGE: &str =
    "warehouse_kafka_producer_queue_depth_limit";
pub const KAFKA_PRODUCER_QUEUE_BYTES_GAUGE: &str = "warehouse_kafka_producer_queue_bytes";
pub const KAFKA_PRODUCER_QUEUE_BYTES_LIMIT_GAUGE: &str =
    "warehouse_kafka_producer_queue_bytes_limit";
pub const KAFKA_BROKER_REQUESTS_PENDING_GAUGE: &str = "warehouse_kafka_broker_requests_pending";
pub const KAFKA_BROKER_RESPONSES_AWAITING_GAUGE: &str =
    "warehouse_kafka_broker_responses_awaiting";
pub const KAFKA_BROKER_TX_ERRORS_COUNTER: &str = "warehouse_kafka_broker_tx_errors_total";
pub const KAFKA_BROKER_RX_ERRORS_COUNTER: &str = "warehouse_kafka_broker_rx_errors_total";
pub const KAFKA_CONSUMER_LAG_GAUGE: &str = "warehouse_kafka_consumer_lag";
