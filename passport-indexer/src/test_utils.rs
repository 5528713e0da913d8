//! Test doubles shared by the unit tests of this crate.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use async_trait::async_trait;
use chrono::Utc;
use passport_common::event::{RawEvent, TransactionKind};
use passport_common::passport::{AdditionalDetails, Component, Passport};
use passport_common::record::EnrichedRecord;
use passport_common::store::{StoreError, TabularStore};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{LookupError, TransportError};
use crate::lookup::EntityLookup;
use crate::subscription::{InboundMessage, NotificationSource};

pub fn passport(imei: &str, phone_name: &str) -> Passport {
    Passport {
        imei_number: imei.to_owned(),
        phone_name: phone_name.to_owned(),
        manufacturer: "Samsung".to_owned(),
        expected_lifecycle: 5,
        manufacture_date: 1603411200,
        is_battery_replaceable: true,
        additional_details: AdditionalDetails {
            is_5g_capable: true,
            release_date: 1603411200,
            os: "Android".to_owned(),
            chipset: "Exynos 990".to_owned(),
            phone_memory: 128,
            battery_type: "Lithium-ion".to_owned(),
            condition: "Very Good".to_owned(),
            expected_lifecycle: 5,
            achieved_lifecycle: 0,
        },
        components: vec![Component {
            component_name: "Battery".to_owned(),
            material: "Lithium-ion".to_owned(),
        }],
        lifecycle_events: vec![],
        disposal_event: None,
    }
}

pub fn sell_event(imei: &str) -> RawEvent {
    RawEvent {
        topic: TransactionKind::Sell,
        business_key: imei.to_owned(),
        action: "sell".to_owned(),
        source_entity_type: "manufacturer".to_owned(),
        source_entity_address: "0xabc".to_owned(),
        target_entity_type: Some("consumer".to_owned()),
        target_entity_address: Some("0xdef".to_owned()),
        occurred_at: Utc::now(),
        disposal: None,
    }
}

/// A record tagged by its IMEI column.
pub fn record(imei: &str) -> EnrichedRecord {
    EnrichedRecord::new(&sell_event(imei), &passport(imei, "Galaxy S20"), Utc::now())
}

pub struct StaticLookup {
    passports: HashMap<String, Passport>,
}

impl StaticLookup {
    pub fn with<const N: usize>(passports: [Passport; N]) -> Self {
        Self {
            passports: passports
                .into_iter()
                .map(|p| (p.imei_number.clone(), p))
                .collect(),
        }
    }
}

#[async_trait]
impl EntityLookup for StaticLookup {
    async fn get_entity_by_key(&self, business_key: &str) -> Result<Passport, LookupError> {
        self.passports
            .get(business_key)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(business_key.to_owned()))
    }
}

/// Answers `NotFound` for the first `failures` calls, then the passport.
#[derive(Clone)]
pub struct FlakyLookup {
    failures: usize,
    passport: Passport,
    calls: Arc<AtomicUsize>,
}

impl FlakyLookup {
    pub fn new(failures: usize, passport: Passport) -> Self {
        Self {
            failures,
            passport,
            calls: Default::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntityLookup for FlakyLookup {
    async fn get_entity_by_key(&self, business_key: &str) -> Result<Passport, LookupError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(LookupError::NotFound(business_key.to_owned()))
        } else {
            Ok(self.passport.clone())
        }
    }
}

/// In-memory stand-in for the workbook. Each append reads a snapshot, yields
/// for `write_delay`, then overwrites the shared rows with snapshot + row, the
/// same read-modify-write shape as `WorkbookStore`.
#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<Vec<Vec<Value>>>>,
    writes: Arc<AtomicUsize>,
    write_delay: time::Duration,
    fail_on: Option<String>,
    panic_on: Option<String>,
}

impl MemoryStore {
    pub fn with_write_delay(write_delay: time::Duration) -> Self {
        Self {
            write_delay,
            ..Default::default()
        }
    }

    pub fn failing_on(mut self, imei: &str) -> Self {
        self.fail_on = Some(imei.to_owned());
        self
    }

    pub fn panicking_on(mut self, imei: &str) -> Self {
        self.panic_on = Some(imei.to_owned());
        self
    }

    pub fn rows(&self) -> Vec<Vec<Value>> {
        self.rows.lock().unwrap().clone()
    }

    /// The IMEI column of every stored row, in storage order.
    pub fn imeis(&self) -> Vec<String> {
        self.rows()
            .iter()
            .map(|row| row[1].as_str().unwrap_or_default().to_owned())
            .collect()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TabularStore for MemoryStore {
    async fn append_row(&mut self, record: &EnrichedRecord) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);

        if self.fail_on.as_deref() == Some(record.imei_number.as_str()) {
            return Err(StoreError::WriteError {
                path: PathBuf::from("memory"),
                error: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        if self.panic_on.as_deref() == Some(record.imei_number.as_str()) {
            panic!("store blew up on {}", record.imei_number);
        }

        let mut snapshot = self.rows.lock().unwrap().clone();
        tokio::time::sleep(self.write_delay).await;
        snapshot.push(record.to_row());
        *self.rows.lock().unwrap() = snapshot;

        Ok(())
    }
}

/// A topic fed from a channel. Dropping the sender ends the stream.
pub struct ChannelSource {
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Vec<u8>, TransportError>>>,
}

impl ChannelSource {
    pub fn channel() -> (Self, mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                receiver: tokio::sync::Mutex::new(receiver),
            },
            sender,
        )
    }
}

#[async_trait]
impl NotificationSource for ChannelSource {
    async fn recv(&self) -> Result<Option<InboundMessage>, TransportError> {
        match self.receiver.lock().await.recv().await {
            Some(Ok(payload)) => Ok(Some(InboundMessage {
                payload,
                timestamp: None,
            })),
            Some(Err(error)) => Err(error),
            None => Ok(None),
        }
    }
}

/// Poll `check` until it holds or five seconds pass, then assert it.
pub async fn assert_or_retry<F>(check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + time::Duration::from_secs(5);
    while !check() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(time::Duration::from_millis(10)).await;
    }
    assert!(check())
}
