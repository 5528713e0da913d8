//! The device passport as projected by the registry.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Passport {
    pub imei_number: String,
    pub phone_name: String,
    pub manufacturer: String,
    pub expected_lifecycle: u64,
    pub manufacture_date: i64,
    pub is_battery_replaceable: bool,
    pub additional_details: AdditionalDetails,
    pub components: Vec<Component>,
    pub lifecycle_events: Vec<LifecycleEvent>,
    pub disposal_event: Option<DisposalRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdditionalDetails {
    #[serde(rename = "is5GCapable")]
    pub is_5g_capable: bool,
    pub release_date: i64,
    pub os: String,
    pub chipset: String,
    pub phone_memory: u64,
    pub battery_type: String,
    pub condition: String,
    pub expected_lifecycle: u64,
    pub achieved_lifecycle: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub component_name: String,
    pub material: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    /// Unix seconds.
    pub timestamp: i64,
    pub event_description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DisposalRecord {
    pub disposal_method: String,
    pub disposal_date: String,
    pub location: String,
    pub disposed_by: String,
}

impl DisposalRecord {
    /// The registry returns a zeroed record for devices never disposed of.
    pub fn is_empty(&self) -> bool {
        self.disposal_method.is_empty()
            && self.disposal_date.is_empty()
            && self.location.is_empty()
            && self.disposed_by.is_empty()
    }
}
