use thiserror::Error;

/// Enumeration of errors for a single topic subscription. None of these stop the topic.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("failed to decode notification: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("received empty payload")]
    EmptyPayload,
}

/// Enumeration of errors related to resolving a business key against the registry.
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("no passport registered for {0}")]
    NotFound(String),
    #[error("registry answered {status} for {key}")]
    Status {
        key: String,
        status: http::StatusCode,
    },
    #[error("registry request failed: {0}")]
    Request(reqwest::Error),
    #[error("failed to decode registry response: {0}")]
    Decode(reqwest::Error),
    #[error("invalid registry url: {0}")]
    Url(String),
}

/// The enricher gave up on an event.
#[derive(Error, Debug)]
#[error("lookup failed for {business_key} after {attempts} attempt(s): {source}")]
pub struct LookupFailed {
    pub business_key: String,
    pub attempts: u32,
    #[source]
    pub source: LookupError,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WriteQueueError {
    #[error("the store writer has stopped")]
    Closed,
}

/// Enumeration of errors related to initialization of the indexer.
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("failed to subscribe to {topic}: {error}")]
    SubscribeError {
        topic: String,
        error: rdkafka::error::KafkaError,
    },
    #[error("failed to build registry client: {0}")]
    RegistryError(#[from] LookupError),
    #[error("failed to serve http endpoints: {0}")]
    ServeError(#[from] std::io::Error),
}
