use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// The four ledger transactions that produce a row in the store.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub enum TransactionKind {
    Sell,
    Give,
    Return,
    Dispose,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid transaction kind")]
pub struct ParseTransactionKindError(pub String);

impl TransactionKind {
    pub const ALL: [TransactionKind; 4] = [
        TransactionKind::Sell,
        TransactionKind::Give,
        TransactionKind::Return,
        TransactionKind::Dispose,
    ];

    /// The verb the ledger records when a notification does not carry one.
    pub fn default_action(&self) -> &'static str {
        match self {
            TransactionKind::Sell => "sell",
            TransactionKind::Give => "give",
            TransactionKind::Return => "return",
            TransactionKind::Dispose => "dispose",
        }
    }

    /// Lowercase label used in metrics and component names.
    pub fn label(&self) -> &'static str {
        self.default_action()
    }
}

impl FromStr for TransactionKind {
    type Err = ParseTransactionKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "sell" => Ok(TransactionKind::Sell),
            "give" => Ok(TransactionKind::Give),
            "return" => Ok(TransactionKind::Return),
            "dispose" => Ok(TransactionKind::Dispose),
            invalid => Err(ParseTransactionKindError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransactionKind::Sell => write!(f, "Sell"),
            TransactionKind::Give => write!(f, "Give"),
            TransactionKind::Return => write!(f, "Return"),
            TransactionKind::Dispose => write!(f, "Dispose"),
        }
    }
}

/// A transaction notification as delivered by the event feed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(deserialize_with = "deserialize_business_key")]
    pub imei_number: String,
    #[serde(default)]
    pub action_performed: Option<String>,
    pub source_entity_type: String,
    pub source_entity_address: String,
    #[serde(default)]
    pub target_entity_type: Option<String>,
    #[serde(default)]
    pub target_entity_address: Option<String>,
    #[serde(default)]
    pub smartphone_details: Option<String>,
    #[serde(default)]
    pub additional_info: Option<String>,
    #[serde(default)]
    pub disposal_method: Option<String>,
    #[serde(default)]
    pub disposal_date: Option<String>,
    #[serde(default)]
    pub disposal_location: Option<String>,
}

/// `PassportCreated` is only logged, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassportCreated {
    #[serde(deserialize_with = "deserialize_business_key")]
    pub imei_number: String,
    #[serde(alias = "smartphoneModel")]
    pub phone_name: String,
    pub manufacturer: String,
    #[serde(default)]
    pub expected_lifecycle: Option<u64>,
    #[serde(default)]
    pub manufacture_date: Option<i64>,
    #[serde(default)]
    pub is_battery_replaceable: Option<bool>,
}

/// IMEIs show up as JSON numbers or strings depending on the emitter.
fn deserialize_business_key<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Key {
        Text(String),
        Number(u64),
    }

    match Key::deserialize(deserializer)? {
        Key::Text(text) if text.is_empty() => {
            Err(serde::de::Error::custom("business key must not be empty"))
        }
        Key::Text(text) => Ok(text),
        Key::Number(number) => Ok(number.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisposalNotice {
    pub method: String,
    pub date: String,
    pub location: String,
}

/// A normalized transaction event, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub topic: TransactionKind,
    pub business_key: String,
    pub action: String,
    pub source_entity_type: String,
    pub source_entity_address: String,
    pub target_entity_type: Option<String>,
    pub target_entity_address: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub disposal: Option<DisposalNotice>,
}

impl RawEvent {
    pub fn from_notification(
        topic: TransactionKind,
        notification: Notification,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let disposal = match topic {
            TransactionKind::Dispose => Some(DisposalNotice {
                method: notification.disposal_method.unwrap_or_default(),
                date: notification.disposal_date.unwrap_or_default(),
                location: notification.disposal_location.unwrap_or_default(),
            }),
            _ => None,
        };

        let action = notification
            .action_performed
            .filter(|action| !action.is_empty())
            .unwrap_or_else(|| topic.default_action().to_owned());

        RawEvent {
            topic,
            business_key: notification.imei_number,
            action,
            source_entity_type: notification.source_entity_type,
            source_entity_address: notification.source_entity_address,
            target_entity_type: notification.target_entity_type.filter(|t| !t.is_empty()),
            target_entity_address: notification.target_entity_address.filter(|a| !a.is_empty()),
            occurred_at,
            disposal,
        }
    }

    /// "<source> <verb> to <target>", or "<source> <verb>" without a target.
    pub fn action_description(&self) -> String {
        match &self.target_entity_type {
            Some(target) => format!("{} {} to {}", self.source_entity_type, self.action, target),
            None => format!("{} {}", self.source_entity_type, self.action),
        }
    }
}
