//! Core entity model for the CIMA datastore.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cima-core";

/// Extension used for every materialized attachment regardless of the remote filename.
pub const ATTACHMENT_EXTENSION: &str = "pdf";

/// One of the independently refreshed collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Documents,
    Events,
    People,
}

impl EntityKind {
    /// Refresh order within a cycle.
    pub const ALL: [EntityKind; 3] = [EntityKind::Documents, EntityKind::Events, EntityKind::People];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Documents => "documents",
            EntityKind::Events => "events",
            EntityKind::People => "people",
        }
    }

    /// Snapshot file name under the datastore root.
    pub fn snapshot_file(self) -> &'static str {
        match self {
            EntityKind::Documents => "data.parquet",
            EntityKind::Events => "event.parquet",
            EntityKind::People => "people.parquet",
        }
    }

    /// Attachment subdirectory under the datastore root.
    pub fn attachment_dir(self) -> &'static str {
        match self {
            EntityKind::Documents => "data",
            EntityKind::Events => "events",
            EntityKind::People => "people",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized {field} value {value:?}")]
pub struct UnknownVariant {
    pub field: &'static str,
    pub value: String,
}

/// Document classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Report,
    Flash,
    Fundamentals,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Report => "report",
            DataType::Flash => "flash",
            DataType::Fundamentals => "fundamentals",
        }
    }
}

impl FromStr for DataType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "report" => Ok(DataType::Report),
            "flash" => Ok(DataType::Flash),
            "fundamentals" => Ok(DataType::Fundamentals),
            other => Err(UnknownVariant {
                field: "type",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Proposed,
    Pending,
    Confirmed,
    Cancelled,
    Postponed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Proposed => "proposed",
            EventStatus::Pending => "pending",
            EventStatus::Confirmed => "confirmed",
            EventStatus::Cancelled => "cancelled",
            EventStatus::Postponed => "postponed",
        }
    }
}

impl FromStr for EventStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(EventStatus::Proposed),
            "pending" => Ok(EventStatus::Pending),
            "confirmed" => Ok(EventStatus::Confirmed),
            "cancelled" => Ok(EventStatus::Cancelled),
            "postponed" => Ok(EventStatus::Postponed),
            other => Err(UnknownVariant {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Research document (report, flash note or fundamentals sheet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub summary: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub creation_time: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub authors: Vec<String>,
    pub data: Option<String>,
    /// Local path of the materialized attachment.
    pub attachment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub summary: String,
    pub status: EventStatus,
    pub tags: Vec<String>,
    pub date: DateTime<Utc>,
    pub location_url: Option<String>,
    pub registration_url: Option<String>,
    pub attachment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub tagline: String,
    pub description: String,
    pub email: String,
    pub linkedin: String,
    /// Local path of the materialized photo.
    pub photo: Option<String>,
}

/// Common accessors shared by every snapshot entity.
pub trait Entity {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    /// Local file path of the entity's attachment, if one was materialized.
    fn attachment_path(&self) -> Option<&str>;
}

impl Entity for Document {
    const KIND: EntityKind = EntityKind::Documents;

    fn id(&self) -> &str {
        &self.id
    }

    fn attachment_path(&self) -> Option<&str> {
        self.attachment.as_deref()
    }
}

impl Entity for Event {
    const KIND: EntityKind = EntityKind::Events;

    fn id(&self) -> &str {
        &self.id
    }

    fn attachment_path(&self) -> Option<&str> {
        self.attachment.as_deref()
    }
}

impl Entity for Person {
    const KIND: EntityKind = EntityKind::People;

    fn id(&self) -> &str {
        &self.id
    }

    fn attachment_path(&self) -> Option<&str> {
        self.photo.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_values_round_trip_through_their_wire_names() {
        for value in ["report", "flash", "fundamentals"] {
            assert_eq!(value.parse::<DataType>().unwrap().as_str(), value);
        }
        for value in ["proposed", "pending", "confirmed", "cancelled", "postponed"] {
            assert_eq!(value.parse::<EventStatus>().unwrap().as_str(), value);
        }
    }

    #[test]
    fn unknown_values_are_rejected_with_field_name() {
        let err = "draft".parse::<DataType>().unwrap_err();
        assert_eq!(err.field, "type");
        assert_eq!(err.value, "draft");

        // Matching is exact; the upstream emits lowercase option names.
        assert!("Confirmed".parse::<EventStatus>().is_err());
    }

    #[test]
    fn kind_layout_is_fixed() {
        assert_eq!(EntityKind::Documents.snapshot_file(), "data.parquet");
        assert_eq!(EntityKind::Events.snapshot_file(), "event.parquet");
        assert_eq!(EntityKind::People.snapshot_file(), "people.parquet");
        assert_eq!(EntityKind::Documents.attachment_dir(), "data");
        assert_eq!(EntityKind::People.attachment_dir(), "people");
    }

    #[test]
    fn document_serializes_classification_as_type() {
        let doc = Document {
            id: "rec1".into(),
            name: "Q3".into(),
            summary: "s".into(),
            data_type: DataType::Flash,
            creation_time: DateTime::from_timestamp(0, 0).unwrap(),
            last_modified: DateTime::from_timestamp(0, 0).unwrap(),
            authors: vec!["Ada".into()],
            data: None,
            attachment: None,
        };
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["type"], "flash");
        assert!(value.get("data_type").is_none());
    }
}
