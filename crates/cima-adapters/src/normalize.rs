//! Mapping from loosely-typed upstream records to validated entities.
//!
//! A record either becomes a fully-populated entity, is skipped (an enumerated
//! field carries a value outside its closed set), or fails with a
//! [`NormalizeError`] that aborts the whole batch for its entity kind.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use cima_core::{DataType, Document, Entity, Event, EventStatus, Person, UnknownVariant};
use cima_storage::{AttachmentError, AttachmentStore, BlobSource};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use crate::UpstreamRecord;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("record {record_id}: missing required field `{field}`")]
    MissingField {
        record_id: String,
        field: &'static str,
    },
    #[error("record {record_id}: field `{field}` is not {expected}")]
    InvalidField {
        record_id: String,
        field: &'static str,
        expected: &'static str,
    },
    #[error("record {record_id}: field `{field}` has unparseable timestamp {value:?}")]
    Timestamp {
        record_id: String,
        field: &'static str,
        value: String,
    },
    #[error("record {record_id}: attachment failed: {source}")]
    Attachment {
        record_id: String,
        #[source]
        source: AttachmentError,
    },
}

impl NormalizeError {
    pub fn record_id(&self) -> &str {
        match self {
            NormalizeError::MissingField { record_id, .. }
            | NormalizeError::InvalidField { record_id, .. }
            | NormalizeError::Timestamp { record_id, .. }
            | NormalizeError::Attachment { record_id, .. } => record_id,
        }
    }

    pub fn is_schema_violation(&self) -> bool {
        !matches!(self, NormalizeError::Attachment { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnknownValue { field: &'static str, value: String },
    Attachment { error: String },
}

impl From<UnknownVariant> for SkipReason {
    fn from(err: UnknownVariant) -> Self {
        SkipReason::UnknownValue {
            field: err.field,
            value: err.value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized<T> {
    Entity(T),
    Skipped { record_id: String, reason: SkipReason },
}

/// An entity parsed from its record, with the attachment URL still to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed<T> {
    pub entity: T,
    pub attachment_url: Option<String>,
}

/// What happens to a record whose attachment cannot be materialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttachmentPolicy {
    /// Abort the entity kind's cycle, keeping its previous snapshot.
    #[default]
    FailKind,
    /// Drop only the owning record.
    SkipRecord,
}

pub trait UpstreamEntity: Entity + Sized + Send {
    fn parse(record: &UpstreamRecord) -> Result<Normalized<Parsed<Self>>, NormalizeError>;

    fn with_attachment(self, path: String) -> Self;
}

/// Typed accessors over one record's field map.
struct Fields<'a> {
    record: &'a UpstreamRecord,
}

impl<'a> Fields<'a> {
    fn new(record: &'a UpstreamRecord) -> Self {
        Self { record }
    }

    fn id(&self) -> String {
        self.record.id.clone()
    }

    fn get(&self, field: &str) -> Option<&'a JsonValue> {
        self.record.fields.get(field).filter(|v| !v.is_null())
    }

    fn missing(&self, field: &'static str) -> NormalizeError {
        NormalizeError::MissingField {
            record_id: self.id(),
            field,
        }
    }

    fn invalid(&self, field: &'static str, expected: &'static str) -> NormalizeError {
        NormalizeError::InvalidField {
            record_id: self.id(),
            field,
            expected,
        }
    }

    fn required_str(&self, field: &'static str) -> Result<String, NormalizeError> {
        let value = self.get(field).ok_or_else(|| self.missing(field))?;
        value
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| self.invalid(field, "a string"))
    }

    fn optional_str(&self, field: &'static str) -> Result<Option<String>, NormalizeError> {
        match self.get(field) {
            None => Ok(None),
            Some(value) => {
                let text = value.as_str().ok_or_else(|| self.invalid(field, "a string"))?;
                Ok(text_or_none(text))
            }
        }
    }

    fn string_list(&self, field: &'static str) -> Result<Vec<String>, NormalizeError> {
        let Some(value) = self.get(field) else {
            return Ok(Vec::new());
        };
        let items = value
            .as_array()
            .ok_or_else(|| self.invalid(field, "a list of strings"))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(ToString::to_string)
                    .ok_or_else(|| self.invalid(field, "a list of strings"))
            })
            .collect()
    }

    /// Linked-record summaries flattened to their display names.
    fn linked_names(&self, field: &'static str) -> Result<Vec<String>, NormalizeError> {
        let Some(value) = self.get(field) else {
            return Ok(Vec::new());
        };
        let items = value
            .as_array()
            .ok_or_else(|| self.invalid(field, "a list of linked records"))?;
        items
            .iter()
            .map(|item| {
                item.get("name")
                    .and_then(JsonValue::as_str)
                    .or_else(|| item.as_str())
                    .map(ToString::to_string)
                    .ok_or_else(|| self.invalid(field, "a list of linked records with names"))
            })
            .collect()
    }

    fn timestamp(&self, field: &'static str) -> Result<DateTime<Utc>, NormalizeError> {
        let text = self.required_str(field)?;
        parse_timestamp(&text).ok_or_else(|| NormalizeError::Timestamp {
            record_id: self.id(),
            field,
            value: text,
        })
    }

    /// URL of the first file in the first present, non-empty attachment field.
    fn attachment_url(&self, candidates: &[&'static str]) -> Result<Option<String>, NormalizeError> {
        for &field in candidates {
            let Some(value) = self.get(field) else {
                continue;
            };
            let files = value
                .as_array()
                .ok_or_else(|| self.invalid(field, "a list of attachments"))?;
            let Some(first) = files.first() else {
                continue;
            };
            let url = first
                .get("url")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| self.invalid(field, "a list of attachments with urls"))?;
            return Ok(Some(url.to_string()));
        }
        Ok(None)
    }
}

/// Blank means absent; anything else is kept verbatim.
fn text_or_none(value: &str) -> Option<String> {
    (!value.trim().is_empty()).then(|| value.to_string())
}

/// ISO-8601 parsing with the leniency of the upstream's formats: full RFC 3339,
/// naive date-times (taken as UTC) and bare dates (midnight UTC).
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl UpstreamEntity for Document {
    fn parse(record: &UpstreamRecord) -> Result<Normalized<Parsed<Self>>, NormalizeError> {
        let f = Fields::new(record);
        // Classification first: draft rows are often missing everything else.
        let data_type = match f.required_str("type")?.parse::<DataType>() {
            Ok(data_type) => data_type,
            Err(err) => {
                return Ok(Normalized::Skipped {
                    record_id: f.id(),
                    reason: err.into(),
                })
            }
        };
        let name = f.required_str("name")?;
        let summary = f.required_str("summary")?;
        let creation_time = f.timestamp("creation_time")?;
        let last_modified = f.timestamp("last_modified")?;
        let authors = f.linked_names("authors")?;
        let data = f.optional_str("data")?;
        let attachment_url = f.attachment_url(&["attachment"])?;

        Ok(Normalized::Entity(Parsed {
            entity: Document {
                id: f.id(),
                name,
                summary,
                data_type,
                creation_time,
                last_modified,
                authors,
                data,
                attachment: None,
            },
            attachment_url,
        }))
    }

    fn with_attachment(self, path: String) -> Self {
        Self {
            attachment: Some(path),
            ..self
        }
    }
}

impl UpstreamEntity for Event {
    fn parse(record: &UpstreamRecord) -> Result<Normalized<Parsed<Self>>, NormalizeError> {
        let f = Fields::new(record);
        let status = match f.required_str("status")?.parse::<EventStatus>() {
            Ok(status) => status,
            Err(err) => {
                return Ok(Normalized::Skipped {
                    record_id: f.id(),
                    reason: err.into(),
                })
            }
        };
        let name = f.required_str("name")?;
        let summary = f.required_str("summary")?;
        let date = f.timestamp("date")?;
        let mut tags: Vec<String> = Vec::new();
        for tag in f.string_list("tags")? {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        let location_url = f.optional_str("location_url")?;
        let registration_url = f.optional_str("registration_url")?;
        let attachment_url = f.attachment_url(&["attachment"])?;

        Ok(Normalized::Entity(Parsed {
            entity: Event {
                id: f.id(),
                name,
                summary,
                status,
                tags,
                date,
                location_url,
                registration_url,
                attachment: None,
            },
            attachment_url,
        }))
    }

    fn with_attachment(self, path: String) -> Self {
        Self {
            attachment: Some(path),
            ..self
        }
    }
}

impl UpstreamEntity for Person {
    fn parse(record: &UpstreamRecord) -> Result<Normalized<Parsed<Self>>, NormalizeError> {
        let f = Fields::new(record);
        let entity = Person {
            id: f.id(),
            name: f.required_str("name")?,
            tagline: f.required_str("tagline")?,
            description: f.required_str("description")?,
            email: f.required_str("email")?,
            linkedin: f.required_str("linkedin")?,
            photo: None,
        };
        // The photo column has been renamed across table revisions.
        let attachment_url = f.attachment_url(&["photo", "attachment", "attachments"])?;
        Ok(Normalized::Entity(Parsed {
            entity,
            attachment_url,
        }))
    }

    fn with_attachment(self, path: String) -> Self {
        Self {
            photo: Some(path),
            ..self
        }
    }
}

/// Records normalized for one entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedBatch<T> {
    pub entities: Vec<T>,
    pub skipped: Vec<(String, SkipReason)>,
}

impl<T> Default for NormalizedBatch<T> {
    fn default() -> Self {
        Self {
            entities: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

pub struct Normalizer<'a> {
    store: &'a AttachmentStore,
    blobs: &'a dyn BlobSource,
    policy: AttachmentPolicy,
}

impl<'a> Normalizer<'a> {
    pub fn new(store: &'a AttachmentStore, blobs: &'a dyn BlobSource, policy: AttachmentPolicy) -> Self {
        Self {
            store,
            blobs,
            policy,
        }
    }

    /// Parse one record and materialize its attachment.
    pub async fn normalize<T: UpstreamEntity>(
        &self,
        record: &UpstreamRecord,
    ) -> Result<Normalized<T>, NormalizeError> {
        let parsed = match T::parse(record)? {
            Normalized::Entity(parsed) => parsed,
            Normalized::Skipped { record_id, reason } => {
                return Ok(Normalized::Skipped { record_id, reason })
            }
        };
        let Some(url) = parsed.attachment_url else {
            return Ok(Normalized::Entity(parsed.entity));
        };

        let id = parsed.entity.id().to_string();
        match self.store.materialize(self.blobs, T::KIND, &id, &url).await {
            Ok(path) => Ok(Normalized::Entity(
                parsed.entity.with_attachment(path.display().to_string()),
            )),
            Err(source) => match self.policy {
                AttachmentPolicy::FailKind => Err(NormalizeError::Attachment {
                    record_id: id,
                    source,
                }),
                AttachmentPolicy::SkipRecord => Ok(Normalized::Skipped {
                    record_id: id,
                    reason: SkipReason::Attachment {
                        error: source.to_string(),
                    },
                }),
            },
        }
    }

    /// Normalize records in order; the first error aborts the batch.
    pub async fn normalize_all<T: UpstreamEntity>(
        &self,
        records: &[UpstreamRecord],
    ) -> Result<NormalizedBatch<T>, NormalizeError> {
        let mut batch = NormalizedBatch::default();
        for record in records {
            match self.normalize::<T>(record).await? {
                Normalized::Entity(entity) => batch.entities.push(entity),
                Normalized::Skipped { record_id, reason } => {
                    warn!(kind = %T::KIND, record_id = %record_id, ?reason, "skipping record");
                    batch.skipped.push((record_id, reason));
                }
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use cima_storage::FetchError;
    use serde_json::json;
    use tempfile::tempdir;

    struct FixedBlob(Option<&'static [u8]>);

    #[async_trait]
    impl BlobSource for FixedBlob {
        async fn fetch_blob(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.0.map(<[u8]>::to_vec).ok_or_else(|| FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
            })
        }
    }

    fn document_record(id: &str, data_type: &str) -> UpstreamRecord {
        UpstreamRecord::new(
            id,
            json!({
                "name": "Copper outlook",
                "summary": "Supply tightening",
                "type": data_type,
                "creation_time": "2024-03-01T09:30:00.000Z",
                "last_modified": "2024-03-02T10:00:00+02:00",
                "authors": [{"id": "recA", "name": "Ada"}, {"id": "recB", "name": "Grace"}],
                "data": "full text"
            }),
        )
    }

    fn person_record(id: &str, extra: JsonValue) -> UpstreamRecord {
        let mut fields = json!({
            "name": "Ada Lovelace",
            "tagline": "Analyst",
            "description": "Metals desk",
            "email": "ada@example.com",
            "linkedin": "https://linkedin.example/ada"
        });
        if let (Some(map), JsonValue::Object(extra)) = (fields.as_object_mut(), extra) {
            map.extend(extra);
        }
        UpstreamRecord::new(id, fields)
    }

    fn unwrap_entity<T>(outcome: Normalized<Parsed<T>>) -> Parsed<T> {
        match outcome {
            Normalized::Entity(parsed) => parsed,
            Normalized::Skipped { reason, .. } => panic!("unexpected skip: {reason:?}"),
        }
    }

    #[test]
    fn document_with_known_classification_is_fully_populated() {
        let parsed = unwrap_entity(Document::parse(&document_record("rec123", "report")).unwrap());
        let doc = parsed.entity;
        assert_eq!(doc.id, "rec123");
        assert_eq!(doc.data_type, DataType::Report);
        assert_eq!(doc.authors, vec!["Ada".to_string(), "Grace".to_string()]);
        assert_eq!(
            doc.creation_time,
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap()
        );
        assert_eq!(
            doc.last_modified,
            Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap()
        );
        assert_eq!(doc.data.as_deref(), Some("full text"));
        assert_eq!(parsed.attachment_url, None);
    }

    #[test]
    fn unknown_classification_is_skipped_not_failed() {
        match Document::parse(&document_record("rec9", "draft")).unwrap() {
            Normalized::Skipped { record_id, reason } => {
                assert_eq!(record_id, "rec9");
                assert_eq!(
                    reason,
                    SkipReason::UnknownValue {
                        field: "type",
                        value: "draft".into()
                    }
                );
            }
            Normalized::Entity(_) => panic!("draft rows must be skipped"),
        }
    }

    #[test]
    fn sparse_draft_rows_are_skipped_before_field_checks() {
        let draft = UpstreamRecord::new(
            "recDraft",
            json!({
                "type": "draft",
                "creation_time": "2024-03-01T09:30:00Z",
                "last_modified": "2024-03-01T09:30:00Z",
                "authors": []
            }),
        );
        assert!(matches!(
            Document::parse(&draft).unwrap(),
            Normalized::Skipped { ref record_id, .. } if record_id == "recDraft"
        ));

        let tbd = UpstreamRecord::new("recTbd", json!({"status": "tbd", "date": "2024-06-01"}));
        assert!(matches!(
            Event::parse(&tbd).unwrap(),
            Normalized::Skipped { ref record_id, .. } if record_id == "recTbd"
        ));
    }

    #[test]
    fn optional_text_is_kept_verbatim() {
        let mut record = document_record("rec1", "report");
        record
            .fields
            .insert("data".into(), json!("  indented body\n"));
        let doc = unwrap_entity(Document::parse(&record).unwrap()).entity;
        assert_eq!(doc.data.as_deref(), Some("  indented body\n"));

        record.fields.insert("data".into(), json!("   "));
        let doc = unwrap_entity(Document::parse(&record).unwrap()).entity;
        assert_eq!(doc.data, None);
    }

    #[test]
    fn bad_timestamp_is_a_schema_error() {
        let mut record = document_record("rec1", "report");
        record
            .fields
            .insert("creation_time".into(), json!("last tuesday"));
        let err = Document::parse(&record).unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::Timestamp { field: "creation_time", .. }
        ));
        assert!(err.is_schema_violation());
        assert_eq!(err.record_id(), "rec1");
    }

    #[test]
    fn missing_required_field_is_reported_by_name() {
        let mut record = document_record("rec1", "report");
        record.fields.remove("summary");
        let err = Document::parse(&record).unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::MissingField { field: "summary", .. }
        ));
    }

    #[test]
    fn missing_author_list_means_no_authors() {
        let mut record = document_record("rec1", "flash");
        record.fields.remove("authors");
        let doc = unwrap_entity(Document::parse(&record).unwrap()).entity;
        assert!(doc.authors.is_empty());
    }

    #[test]
    fn event_accepts_date_only_and_dedupes_tags() {
        let record = UpstreamRecord::new(
            "recE",
            json!({
                "name": "Mining forum",
                "summary": "Annual",
                "status": "confirmed",
                "tags": ["metals", "asia", "metals"],
                "date": "2024-06-01",
                "location_url": "",
                "registration_url": "https://reg.example/e",
                "attachment": [{"url": "https://files.example/agenda.pdf", "filename": "agenda.pdf"}]
            }),
        );
        let parsed = unwrap_entity(Event::parse(&record).unwrap());
        assert_eq!(parsed.entity.status, EventStatus::Confirmed);
        assert_eq!(parsed.entity.tags, vec!["metals".to_string(), "asia".to_string()]);
        assert_eq!(parsed.entity.date, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        assert_eq!(parsed.entity.location_url, None);
        assert_eq!(parsed.attachment_url.as_deref(), Some("https://files.example/agenda.pdf"));
    }

    #[test]
    fn event_with_unknown_status_is_skipped() {
        let record = UpstreamRecord::new(
            "recE",
            json!({"name": "x", "summary": "y", "status": "tbd", "date": "2024-06-01"}),
        );
        assert!(matches!(
            Event::parse(&record).unwrap(),
            Normalized::Skipped { .. }
        ));
    }

    #[test]
    fn person_photo_falls_back_across_field_names() {
        let record = person_record(
            "recP",
            json!({
                "photo": [],
                "attachments": [{"url": "https://files.example/ada.jpg"}]
            }),
        );
        let parsed = unwrap_entity(Person::parse(&record).unwrap());
        assert_eq!(parsed.attachment_url.as_deref(), Some("https://files.example/ada.jpg"));

        let without = unwrap_entity(Person::parse(&person_record("recQ", json!({}))).unwrap());
        assert_eq!(without.attachment_url, None);
    }

    #[test]
    fn timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_timestamp("2024-01-02T03:04:05Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02T03:04:05.000Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02T03:04:05"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02 03:04:05"), Some(expected));
        assert_eq!(parse_timestamp("02/01/2024"), None);
    }

    #[tokio::test]
    async fn normalize_materializes_attachment_at_deterministic_path() {
        let dir = tempdir().unwrap();
        let store = AttachmentStore::new(dir.path());
        let blobs = FixedBlob(Some(&b"%PDF-1.7"[..]));
        let normalizer = Normalizer::new(&store, &blobs, AttachmentPolicy::FailKind);

        let mut record = document_record("rec123", "fundamentals");
        record.fields.insert(
            "attachment".into(),
            json!([{"url": "https://files.example/some-name.bin"}]),
        );
        let doc = match normalizer.normalize::<Document>(&record).await.unwrap() {
            Normalized::Entity(doc) => doc,
            other => panic!("unexpected {other:?}"),
        };
        let expected = dir.path().join("data").join("rec123.pdf");
        assert_eq!(doc.attachment.as_deref(), Some(expected.display().to_string().as_str()));
        assert_eq!(std::fs::read(expected).unwrap(), b"%PDF-1.7");
    }

    #[tokio::test]
    async fn attachment_failure_follows_policy() {
        let dir = tempdir().unwrap();
        let store = AttachmentStore::new(dir.path());
        let blobs = FixedBlob(None);
        let record = person_record(
            "recP",
            json!({"photo": [{"url": "https://files.example/p.jpg"}]}),
        );

        let strict = Normalizer::new(&store, &blobs, AttachmentPolicy::FailKind);
        let err = strict.normalize::<Person>(&record).await.unwrap_err();
        assert!(matches!(err, NormalizeError::Attachment { .. }));
        assert!(!err.is_schema_violation());

        let lenient = Normalizer::new(&store, &blobs, AttachmentPolicy::SkipRecord);
        assert!(matches!(
            lenient.normalize::<Person>(&record).await.unwrap(),
            Normalized::Skipped {
                reason: SkipReason::Attachment { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn batch_drops_exactly_the_skipped_records() {
        let dir = tempdir().unwrap();
        let store = AttachmentStore::new(dir.path());
        let blobs = FixedBlob(None);
        let normalizer = Normalizer::new(&store, &blobs, AttachmentPolicy::FailKind);

        let records = vec![
            document_record("rec1", "report"),
            document_record("rec2", "draft"),
            document_record("rec3", "flash"),
            document_record("rec4", "placeholder"),
        ];
        let batch = normalizer.normalize_all::<Document>(&records).await.unwrap();
        let ids: Vec<_> = batch.entities.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["rec1", "rec3"]);
        assert_eq!(batch.skipped.len(), 2);
    }
}
