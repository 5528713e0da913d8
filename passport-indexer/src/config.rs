use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use passport_common::event::TransactionKind;
use passport_common::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(default = "http://localhost:8080")]
    pub registry_url: String,

    #[envconfig(default = "5000")]
    pub lookup_timeout: EnvMsDuration,

    #[envconfig(default = "1")]
    pub lookup_max_attempts: u32,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(default = "100")]
    pub max_batch_size: NonZeroUsize,

    #[envconfig(default = "3000")]
    pub batch_interval: EnvMsDuration,

    #[envconfig(default = "transactions.json")]
    pub store_path: PathBuf,

    #[envconfig(default = "Transactions")]
    pub sheet_name: NonEmptyString,

    #[envconfig(default = "1000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub subscription_error_backoff: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub liveness_deadline: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn lookup_retry_policy(&self) -> RetryPolicy {
        let builder = RetryPolicy::build(
            self.retry_policy.backoff_coefficient,
            self.retry_policy.initial_interval.0,
        )
        .maximum_interval(self.retry_policy.maximum_interval.0)
        .max_attempts(self.lookup_max_attempts);
        builder.provide()
    }
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "passport-indexer")]
    pub kafka_consumer_group: String,

    // Events emitted before the indexer started are not replayed.
    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "SellTransaction")]
    pub sell_topic: NonEmptyString,

    #[envconfig(default = "GiveTransaction")]
    pub give_topic: NonEmptyString,

    #[envconfig(default = "ReturnTransaction")]
    pub return_topic: NonEmptyString,

    #[envconfig(default = "DisposeTransaction")]
    pub dispose_topic: NonEmptyString,

    pub passport_created_topic: Option<NonEmptyString>,
}

impl KafkaConfig {
    pub fn topic(&self, kind: TransactionKind) -> &str {
        match kind {
            TransactionKind::Sell => self.sell_topic.as_str(),
            TransactionKind::Give => self.give_topic.as_str(),
            TransactionKind::Return => self.return_topic.as_str(),
            TransactionKind::Dispose => self.dispose_topic.as_str(),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "500")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub maximum_interval: EnvMsDuration,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
