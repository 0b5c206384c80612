//! Typed attribute sets for each entity kind.
//!
//! Snapshots carry their attributes as a JSON object so the protocol stays
//! kind-agnostic. These structs are the schema that object must satisfy:
//! [`validate_fields`] is run on every incoming snapshot, and a snapshot that
//! does not parse for its kind is rejected with a schema mismatch.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::entity::EntityKind;

/// Attribute struct bound to one entity kind.
pub trait EntityFields: Serialize + DeserializeOwned {
    const KIND: EntityKind;

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentStatus {
    #[default]
    InProgress,
    Complete,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InspectionStatus {
    #[default]
    NotStarted,
    InProgress,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pass,
    Fail,
}

/// Building-level inspection record (tree root).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssessmentFields {
    pub property_name: String,
    #[serde(default)]
    pub property_address: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub assessment_date: Option<String>,
    #[serde(default)]
    pub assessor_name: Option<String>,
    #[serde(default)]
    pub assessor_credentials: Option<String>,
    #[serde(default)]
    pub status: AssessmentStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

impl EntityFields for AssessmentFields {
    const KIND: EntityKind = EntityKind::Assessment;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FloorFields {
    #[serde(default)]
    pub floor_number: Option<i64>,
    #[serde(default)]
    pub floor_name: Option<String>,
    #[serde(default)]
    pub is_template: bool,
}

impl EntityFields for FloorFields {
    const KIND: EntityKind = EntityKind::Floor;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoomFields {
    #[serde(default)]
    pub room_number: Option<i64>,
    #[serde(default)]
    pub room_name: Option<String>,
    #[serde(default)]
    pub room_type: Option<String>,
    /// Nominal dimensions as written on the plan, e.g. "4m x 3m"
    #[serde(default)]
    pub dimensions: Option<String>,
    #[serde(default)]
    pub actual_length: Option<f64>,
    #[serde(default)]
    pub actual_width: Option<f64>,
    /// Free-form drawing; merged structurally
    #[serde(default)]
    pub schematic_layout: Option<Value>,
    /// Ids of sibling rooms (non-owning); merged as a set
    #[serde(default)]
    pub connections: Vec<String>,
    #[serde(default)]
    pub inspection_status: InspectionStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

impl EntityFields for RoomFields {
    const KIND: EntityKind = EntityKind::Room;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireSafetyItemFields {
    /// Business code, unique within an assessment
    #[serde(default)]
    pub item_code: Option<String>,
    #[serde(default)]
    pub item_number: Option<i64>,
    #[serde(default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub location_description: Option<String>,
    #[serde(default)]
    pub location_on_schematic: Option<Value>,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub remedial_action: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub requires_action: bool,
    #[serde(default = "default_compliant")]
    pub compliant_with_standard: bool,
    #[serde(default)]
    pub last_service_date: Option<String>,
    #[serde(default)]
    pub next_service_due: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_compliant() -> bool { true }

impl Default for FireSafetyItemFields {
    fn default() -> Self {
        Self {
            item_code: None,
            item_number: None,
            item_type: None,
            location_description: None,
            location_on_schematic: None,
            status: ItemStatus::default(),
            failure_reason: None,
            remedial_action: None,
            priority: None,
            requires_action: false,
            compliant_with_standard: default_compliant(),
            last_service_date: None,
            next_service_due: None,
            notes: None,
        }
    }
}

impl EntityFields for FireSafetyItemFields {
    const KIND: EntityKind = EntityKind::FireSafetyItem;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PhotoFields {
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub thumbnail_path: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub annotation_data: Option<Value>,
    #[serde(default)]
    pub taken_at: Option<String>,
    /// SHA-256 of the image bytes; the blob is transferred separately
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl EntityFields for PhotoFields {
    const KIND: EntityKind = EntityKind::Photo;
}

/// Check that `fields` parses as the attribute struct for `kind`.
///
/// Returns a human-readable reason on failure.
pub fn validate_fields(kind: EntityKind, fields: &Value) -> Result<(), String> {
    if !fields.is_object() {
        return Err(format!("{} fields must be a JSON object", kind));
    }
    let result = match kind {
        EntityKind::Assessment => AssessmentFields::from_value(fields).map(drop),
        EntityKind::Floor => FloorFields::from_value(fields).map(drop),
        EntityKind::Room => RoomFields::from_value(fields).map(drop),
        EntityKind::FireSafetyItem => FireSafetyItemFields::from_value(fields).map(drop),
        EntityKind::Photo => PhotoFields::from_value(fields).map(drop),
    };
    result.map_err(|e| format!("invalid {} fields: {}", kind, e))
}

/// Fields merged structurally (set/object union) instead of last-write-wins.
#[must_use]
pub fn structural_fields(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Room => &["schematic_layout", "connections"],
        EntityKind::FireSafetyItem => &["location_on_schematic"],
        EntityKind::Photo => &["annotation_data"],
        EntityKind::Assessment | EntityKind::Floor => &[],
    }
}
