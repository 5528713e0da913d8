use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::event::RawEvent;
use crate::passport::Passport;

pub const COLUMN_COUNT: usize = 25;

/// Column names of the transactions sheet, in storage order.
pub const HEADERS: [&str; COLUMN_COUNT] = [
    "Timestamp",
    "IMEI Number",
    "Phone Name",
    "Manufacturer",
    "Event Performed",
    "Source Entity Type",
    "Source Entity Address",
    "Target Entity Type",
    "Target Entity Address",
    "Expected Lifecycle",
    "Achieved Lifecycle",
    "5G capability",
    "Release Date",
    "OS",
    "Chipset",
    "Phone Memory",
    "Battery Removable",
    "Battery Type",
    "Condition",
    "Components",
    "Lifecycle Events",
    "Disposal Method",
    "Disposal Date",
    "Disposal Location",
    "Disposed By",
];

pub fn header_row() -> Vec<Value> {
    HEADERS.iter().map(|h| Value::from(*h)).collect()
}

/// One transaction joined with the passport state at enrichment time.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    pub timestamp: String,
    pub imei_number: String,
    pub phone_name: String,
    pub manufacturer: String,
    pub event_performed: String,
    pub source_entity_type: String,
    pub source_entity_address: String,
    pub target_entity_type: String,
    pub target_entity_address: String,
    pub expected_lifecycle: u64,
    pub achieved_lifecycle: u64,
    pub is_5g_capable: bool,
    pub release_date: i64,
    pub os: String,
    pub chipset: String,
    pub phone_memory: u64,
    pub battery_removable: bool,
    pub battery_type: String,
    pub condition: String,
    /// JSON object of material -> component name.
    pub components: String,
    /// JSON object of ISO timestamp -> description.
    pub lifecycle_events: String,
    pub disposal_method: String,
    pub disposal_date: String,
    pub disposal_location: String,
    pub disposed_by: String,
}

fn iso_millis(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn components_json(passport: &Passport) -> String {
    let map: Map<String, Value> = passport
        .components
        .iter()
        .map(|c| (c.material.clone(), Value::from(c.component_name.clone())))
        .collect();
    Value::Object(map).to_string()
}

fn lifecycle_events_json(passport: &Passport) -> String {
    let map: Map<String, Value> = passport
        .lifecycle_events
        .iter()
        .map(|event| {
            let at = DateTime::<Utc>::from_timestamp(event.timestamp, 0)
                .map(iso_millis)
                .unwrap_or_else(|| event.timestamp.to_string());
            (at, Value::from(event.event_description.clone()))
        })
        .collect();
    Value::Object(map).to_string()
}

impl EnrichedRecord {
    pub fn new(event: &RawEvent, passport: &Passport, enriched_at: DateTime<Utc>) -> Self {
        let details = &passport.additional_details;

        // The registry lags behind the dispose notification, so fall back to the
        // notice carried by the event itself.
        let (disposal_method, disposal_date, disposal_location, disposed_by) =
            match (&passport.disposal_event, &event.disposal) {
                (Some(record), _) if !record.is_empty() => (
                    record.disposal_method.clone(),
                    record.disposal_date.clone(),
                    record.location.clone(),
                    record.disposed_by.clone(),
                ),
                (_, Some(notice)) => (
                    notice.method.clone(),
                    notice.date.clone(),
                    notice.location.clone(),
                    event.source_entity_address.clone(),
                ),
                _ => Default::default(),
            };

        EnrichedRecord {
            timestamp: iso_millis(enriched_at),
            imei_number: event.business_key.clone(),
            phone_name: passport.phone_name.clone(),
            manufacturer: passport.manufacturer.clone(),
            event_performed: event.action_description(),
            source_entity_type: event.source_entity_type.clone(),
            source_entity_address: event.source_entity_address.clone(),
            target_entity_type: event.target_entity_type.clone().unwrap_or_default(),
            target_entity_address: event.target_entity_address.clone().unwrap_or_default(),
            expected_lifecycle: details.expected_lifecycle,
            achieved_lifecycle: details.achieved_lifecycle,
            is_5g_capable: details.is_5g_capable,
            release_date: details.release_date,
            os: details.os.clone(),
            chipset: details.chipset.clone(),
            phone_memory: details.phone_memory,
            battery_removable: passport.is_battery_replaceable,
            battery_type: details.battery_type.clone(),
            condition: details.condition.clone(),
            components: components_json(passport),
            lifecycle_events: lifecycle_events_json(passport),
            disposal_method,
            disposal_date,
            disposal_location,
            disposed_by,
        }
    }

    /// The record as a sheet row, one cell per entry of [`HEADERS`].
    pub fn to_row(&self) -> Vec<Value> {
        let row: [Value; COLUMN_COUNT] = [
            Value::from(self.timestamp.as_str()),
            Value::from(self.imei_number.as_str()),
            Value::from(self.phone_name.as_str()),
            Value::from(self.manufacturer.as_str()),
            Value::from(self.event_performed.as_str()),
            Value::from(self.source_entity_type.as_str()),
            Value::from(self.source_entity_address.as_str()),
            Value::from(self.target_entity_type.as_str()),
            Value::from(self.target_entity_address.as_str()),
            Value::from(self.expected_lifecycle),
            Value::from(self.achieved_lifecycle),
            Value::from(self.is_5g_capable),
            Value::from(self.release_date),
            Value::from(self.os.as_str()),
            Value::from(self.chipset.as_str()),
            Value::from(self.phone_memory),
            Value::from(self.battery_removable),
            Value::from(self.battery_type.as_str()),
            Value::from(self.condition.as_str()),
            Value::from(self.components.as_str()),
            Value::from(self.lifecycle_events.as_str()),
            Value::from(self.disposal_method.as_str()),
            Value::from(self.disposal_date.as_str()),
            Value::from(self.disposal_location.as_str()),
            Value::from(self.disposed_by.as_str()),
        ];
        row.into()
    }
}
