//! One consumer loop per ledger topic.
//!
//! Each loop receives notifications in topic order, turns them into
//! `RawEvent`s and pushes them through the pipeline before receiving the next
//! one. Errors are contained per message: a broken topic logs, backs off and
//! keeps going, and never affects the other topics.
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use health::HealthHandle;
use passport_common::event::{Notification, PassportCreated, RawEvent, TransactionKind};
use passport_common::time::TimeSource;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, Message};
use serde_json::from_slice;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::KafkaConfig;
use crate::error::TransportError;
use crate::lookup::EntityLookup;
use crate::pipeline::Pipeline;

/// A message as handed over by the transport, not yet decoded.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub payload: Vec<u8>,
    /// When the transport recorded the message, if it carries that.
    pub timestamp: Option<DateTime<Utc>>,
}

/// The transport side of a single topic subscription.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Next message in topic order. `Ok(None)` means the stream has ended.
    async fn recv(&self) -> Result<Option<InboundMessage>, TransportError>;
}

pub struct KafkaNotificationSource {
    consumer: StreamConsumer,
}

impl KafkaNotificationSource {
    pub fn new(config: &KafkaConfig, topic: &str) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set("enable.auto.commit", "true");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[topic])?;
        info!(topic, "subscribed to topic");

        Ok(Self { consumer })
    }
}

#[async_trait]
impl NotificationSource for KafkaNotificationSource {
    async fn recv(&self) -> Result<Option<InboundMessage>, TransportError> {
        let message = self.consumer.recv().await?;

        let payload = message
            .payload()
            .ok_or(TransportError::EmptyPayload)?
            .to_vec();
        let timestamp = message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis);

        Ok(Some(InboundMessage { payload, timestamp }))
    }
}

/// Runs the topic loops against a shared pipeline and stops them together.
pub struct SubscriptionManager<L, T> {
    pipeline: Arc<Pipeline<L, T>>,
    poll_interval: time::Duration,
    error_backoff: time::Duration,
    shutdown: watch::Sender<bool>,
}

impl<L, T> SubscriptionManager<L, T>
where
    L: EntityLookup + 'static,
    T: TimeSource + Send + Sync + 'static,
{
    /// `poll_interval` bounds how long a loop waits on an idle topic before
    /// reporting liveness again; `error_backoff` is the pause after a transport error.
    pub fn new(
        pipeline: Arc<Pipeline<L, T>>,
        poll_interval: time::Duration,
        error_backoff: time::Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            pipeline,
            poll_interval,
            error_backoff,
            shutdown,
        }
    }

    /// Start consuming one transaction topic into the pipeline.
    pub fn subscribe<S>(
        &self,
        kind: TransactionKind,
        source: S,
        liveness: HealthHandle,
    ) -> JoinHandle<()>
    where
        S: NotificationSource + 'static,
    {
        let pipeline = self.pipeline.clone();
        let poll = TopicPoll {
            topic: kind.label(),
            source,
            liveness,
            poll_interval: self.poll_interval,
            error_backoff: self.error_backoff,
            shutdown: self.shutdown.subscribe(),
        };

        tokio::spawn(poll.run(move |message| {
            let pipeline = pipeline.clone();
            async move { handle_transaction(&pipeline, kind, message).await }
        }))
    }

    /// Start logging `PassportCreated` notifications. Nothing is stored.
    pub fn subscribe_passport_created<S>(
        &self,
        source: S,
        liveness: HealthHandle,
    ) -> JoinHandle<()>
    where
        S: NotificationSource + 'static,
    {
        let poll = TopicPoll {
            topic: "passport_created",
            source,
            liveness,
            poll_interval: self.poll_interval,
            error_backoff: self.error_backoff,
            shutdown: self.shutdown.subscribe(),
        };

        tokio::spawn(poll.run(|message| async move { log_passport_created(message) }))
    }

    /// Ask every loop to stop after the message it is currently handling.
    pub fn stop(&self) {
        _ = self.shutdown.send(true);
    }
}

struct TopicPoll<S> {
    topic: &'static str,
    source: S,
    liveness: HealthHandle,
    poll_interval: time::Duration,
    error_backoff: time::Duration,
    shutdown: watch::Receiver<bool>,
}

impl<S: NotificationSource> TopicPoll<S> {
    async fn run<F, Fut>(mut self, handle: F)
    where
        F: Fn(InboundMessage) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                received = tokio::time::timeout(self.poll_interval, self.source.recv()) => received,
            };
            self.liveness.report_healthy().await;

            match received {
                // Idle topic.
                Err(_) => continue,
                Ok(Ok(Some(message))) => {
                    let topic = self.topic;
                    metrics::counter!("passport_notifications_received_total", "topic" => topic)
                        .increment(1);
                    handle(message).await;
                }
                Ok(Ok(None)) => {
                    info!(topic = self.topic, "notification stream ended");
                    break;
                }
                Ok(Err(error)) => {
                    error!(topic = self.topic, "subscription error: {}", error);
                    metrics::counter!("passport_transport_errors_total", "topic" => self.topic)
                        .increment(1);
                    tokio::time::sleep(self.error_backoff).await;
                }
            }
        }

        info!(topic = self.topic, "subscription stopped");
    }
}

async fn handle_transaction<L, T>(
    pipeline: &Pipeline<L, T>,
    kind: TransactionKind,
    message: InboundMessage,
) where
    L: EntityLookup,
    T: TimeSource,
{
    let notification: Notification = match from_slice(&message.payload) {
        Ok(notification) => notification,
        Err(error) => {
            warn!(
                topic = kind.label(),
                "skipping undecodable notification: {}",
                TransportError::from(error)
            );
            metrics::counter!("passport_transport_errors_total", "topic" => kind.label())
                .increment(1);
            return;
        }
    };

    let occurred_at = message.timestamp.unwrap_or_else(Utc::now);
    let event = RawEvent::from_notification(kind, notification, occurred_at);
    info!(topic = %kind, imei = %event.business_key, "transaction received");

    pipeline.process(event).await;
}

fn log_passport_created(message: InboundMessage) {
    match from_slice::<PassportCreated>(&message.payload) {
        Ok(created) => info!(
            imei = %created.imei_number,
            phone_name = %created.phone_name,
            manufacturer = %created.manufacturer,
            expected_lifecycle = ?created.expected_lifecycle,
            manufacture_date = ?created
                .manufacture_date
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
            battery_replaceable = ?created.is_battery_replaceable,
            "passport created"
        ),
        Err(error) => warn!("skipping undecodable PassportCreated notification: {}", error),
    }
}
