//! Columnar snapshot files, one per entity kind, replaced wholesale on each refresh.
//!
//! Writes go through a temp file and a rename, so a reader opening the canonical
//! path sees either the previous file or the new one. Reads always go to disk.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use arrow_array::builder::{ListBuilder, StringBuilder};
use arrow_array::{Array, ArrayRef, ListArray, RecordBatch, StringArray, TimestampMicrosecondArray};
use arrow_schema::{DataType as ArrowType, Field as ArrowField, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, Utc};
use cima_core::{Document, Entity, EntityKind, Event, Person};
use cima_storage::{replace_atomically, sha256_hex};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tracing::info;

/// Outcome of one snapshot replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub kind: EntityKind,
    pub path: PathBuf,
    pub rows: usize,
    pub bytes: u64,
    pub sha256: String,
}

/// Arrow mapping for an entity kind.
pub trait SnapshotRecord: Entity + Sized {
    fn schema() -> SchemaRef;

    fn to_batch(rows: &[Self]) -> Result<RecordBatch>;

    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>>;
}

fn utf8(name: &str) -> ArrowField {
    ArrowField::new(name, ArrowType::Utf8, false)
}

fn nullable_utf8(name: &str) -> ArrowField {
    ArrowField::new(name, ArrowType::Utf8, true)
}

fn timestamp(name: &str) -> ArrowField {
    ArrowField::new(
        name,
        ArrowType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        false,
    )
}

fn string_list(name: &str) -> ArrowField {
    ArrowField::new(
        name,
        ArrowType::List(Arc::new(ArrowField::new("item", ArrowType::Utf8, true))),
        false,
    )
}

fn str_column<'a, T: 'a>(rows: &'a [T], f: impl Fn(&'a T) -> &'a str) -> ArrayRef {
    Arc::new(StringArray::from(rows.iter().map(f).collect::<Vec<_>>()))
}

fn opt_column<'a, T: 'a>(rows: &'a [T], f: impl Fn(&'a T) -> Option<&'a str>) -> ArrayRef {
    Arc::new(StringArray::from(rows.iter().map(f).collect::<Vec<_>>()))
}

fn ts_column<T>(rows: &[T], f: impl Fn(&T) -> DateTime<Utc>) -> ArrayRef {
    let micros = rows.iter().map(|r| f(r).timestamp_micros()).collect::<Vec<_>>();
    Arc::new(TimestampMicrosecondArray::from(micros).with_timezone("UTC"))
}

fn list_column<'a, T: 'a>(rows: &'a [T], f: impl Fn(&'a T) -> &'a [String]) -> ArrayRef {
    let mut builder = ListBuilder::new(StringBuilder::new());
    for row in rows {
        for item in f(row) {
            builder.values().append_value(item);
        }
        builder.append(true);
    }
    Arc::new(builder.finish())
}

/// Typed, fallible column access on a batch read back from disk.
struct Columns<'a> {
    batch: &'a RecordBatch,
}

impl<'a> Columns<'a> {
    fn column<A: Array + 'static>(&self, name: &str) -> Result<&'a A> {
        let batch: &'a RecordBatch = self.batch;
        batch
            .column_by_name(name)
            .with_context(|| format!("snapshot is missing column `{name}`"))?
            .as_any()
            .downcast_ref::<A>()
            .with_context(|| format!("snapshot column `{name}` has unexpected type"))
    }

    fn strings(&self, name: &str) -> Result<&'a StringArray> {
        self.column::<StringArray>(name)
    }

    fn timestamps(&self, name: &str) -> Result<&'a TimestampMicrosecondArray> {
        self.column::<TimestampMicrosecondArray>(name)
    }

    fn lists(&self, name: &str) -> Result<&'a ListArray> {
        self.column::<ListArray>(name)
    }
}

fn required(array: &StringArray, row: usize) -> Result<String> {
    if array.is_null(row) {
        bail!("unexpected null in row {row}");
    }
    Ok(array.value(row).to_string())
}

fn optional(array: &StringArray, row: usize) -> Option<String> {
    (!array.is_null(row)).then(|| array.value(row).to_string())
}

fn instant(array: &TimestampMicrosecondArray, row: usize) -> Result<DateTime<Utc>> {
    let micros = array.value(row);
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| anyhow!("timestamp {micros} out of range in row {row}"))
}

fn items(array: &ListArray, row: usize) -> Result<Vec<String>> {
    let values = array.value(row);
    let strings = values
        .as_any()
        .downcast_ref::<StringArray>()
        .context("list column does not hold strings")?;
    Ok(strings.iter().flatten().map(ToString::to_string).collect())
}

impl SnapshotRecord for Document {
    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            utf8("id"),
            utf8("name"),
            utf8("summary"),
            utf8("type"),
            timestamp("creation_time"),
            timestamp("last_modified"),
            string_list("authors"),
            nullable_utf8("data"),
            nullable_utf8("attachment"),
        ]))
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch> {
        RecordBatch::try_new(
            Self::schema(),
            vec![
                str_column(rows, |d| d.id.as_str()),
                str_column(rows, |d| d.name.as_str()),
                str_column(rows, |d| d.summary.as_str()),
                str_column(rows, |d| d.data_type.as_str()),
                ts_column(rows, |d| d.creation_time),
                ts_column(rows, |d| d.last_modified),
                list_column(rows, |d| d.authors.as_slice()),
                opt_column(rows, |d| d.data.as_deref()),
                opt_column(rows, |d| d.attachment.as_deref()),
            ],
        )
        .context("building documents record batch")
    }

    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>> {
        let cols = Columns { batch };
        let (ids, names, summaries, types) = (
            cols.strings("id")?,
            cols.strings("name")?,
            cols.strings("summary")?,
            cols.strings("type")?,
        );
        let (created, modified) = (cols.timestamps("creation_time")?, cols.timestamps("last_modified")?);
        let authors = cols.lists("authors")?;
        let (data, attachments) = (cols.strings("data")?, cols.strings("attachment")?);

        (0..batch.num_rows())
            .map(|row| {
                Ok(Document {
                    id: required(ids, row)?,
                    name: required(names, row)?,
                    summary: required(summaries, row)?,
                    data_type: required(types, row)?.parse()?,
                    creation_time: instant(created, row)?,
                    last_modified: instant(modified, row)?,
                    authors: items(authors, row)?,
                    data: optional(data, row),
                    attachment: optional(attachments, row),
                })
            })
            .collect()
    }
}

impl SnapshotRecord for Event {
    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            utf8("id"),
            utf8("name"),
            utf8("summary"),
            utf8("status"),
            string_list("tags"),
            timestamp("date"),
            nullable_utf8("location_url"),
            nullable_utf8("registration_url"),
            nullable_utf8("attachment"),
        ]))
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch> {
        RecordBatch::try_new(
            Self::schema(),
            vec![
                str_column(rows, |e| e.id.as_str()),
                str_column(rows, |e| e.name.as_str()),
                str_column(rows, |e| e.summary.as_str()),
                str_column(rows, |e| e.status.as_str()),
                list_column(rows, |e| e.tags.as_slice()),
                ts_column(rows, |e| e.date),
                opt_column(rows, |e| e.location_url.as_deref()),
                opt_column(rows, |e| e.registration_url.as_deref()),
                opt_column(rows, |e| e.attachment.as_deref()),
            ],
        )
        .context("building events record batch")
    }

    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>> {
        let cols = Columns { batch };
        let ids = cols.strings("id")?;
        let names = cols.strings("name")?;
        let summaries = cols.strings("summary")?;
        let statuses = cols.strings("status")?;
        let tags = cols.lists("tags")?;
        let dates = cols.timestamps("date")?;
        let locations = cols.strings("location_url")?;
        let registrations = cols.strings("registration_url")?;
        let attachments = cols.strings("attachment")?;

        (0..batch.num_rows())
            .map(|row| {
                Ok(Event {
                    id: required(ids, row)?,
                    name: required(names, row)?,
                    summary: required(summaries, row)?,
                    status: required(statuses, row)?.parse()?,
                    tags: items(tags, row)?,
                    date: instant(dates, row)?,
                    location_url: optional(locations, row),
                    registration_url: optional(registrations, row),
                    attachment: optional(attachments, row),
                })
            })
            .collect()
    }
}

impl SnapshotRecord for Person {
    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            utf8("id"),
            utf8("name"),
            utf8("tagline"),
            utf8("description"),
            utf8("email"),
            utf8("linkedin"),
            nullable_utf8("photo"),
        ]))
    }

    fn to_batch(rows: &[Self]) -> Result<RecordBatch> {
        RecordBatch::try_new(
            Self::schema(),
            vec![
                str_column(rows, |p| p.id.as_str()),
                str_column(rows, |p| p.name.as_str()),
                str_column(rows, |p| p.tagline.as_str()),
                str_column(rows, |p| p.description.as_str()),
                str_column(rows, |p| p.email.as_str()),
                str_column(rows, |p| p.linkedin.as_str()),
                opt_column(rows, |p| p.photo.as_deref()),
            ],
        )
        .context("building people record batch")
    }

    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>> {
        let cols = Columns { batch };
        let ids = cols.strings("id")?;
        let names = cols.strings("name")?;
        let taglines = cols.strings("tagline")?;
        let descriptions = cols.strings("description")?;
        let emails = cols.strings("email")?;
        let linkedins = cols.strings("linkedin")?;
        let photos = cols.strings("photo")?;

        (0..batch.num_rows())
            .map(|row| {
                Ok(Person {
                    id: required(ids, row)?,
                    name: required(names, row)?,
                    tagline: required(taglines, row)?,
                    description: required(descriptions, row)?,
                    email: required(emails, row)?,
                    linkedin: required(linkedins, row)?,
                    photo: optional(photos, row),
                })
            })
            .collect()
    }
}

fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buffer)
}

/// Snapshot files under the datastore root.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, kind: EntityKind) -> PathBuf {
        self.root.join(kind.snapshot_file())
    }

    /// Replace the kind's snapshot with `rows`. An empty slice writes an empty snapshot.
    /// Synchronous: there is no await point between encoding and the rename.
    pub fn write<T: SnapshotRecord>(&self, rows: &[T]) -> Result<SnapshotInfo> {
        let path = self.path_for(T::KIND);
        let batch = T::to_batch(rows)?;
        let bytes = encode_parquet(&batch)
            .with_context(|| format!("encoding snapshot {}", path.display()))?;

        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))?;
        replace_atomically(&path, |file| {
            file.write_all(&bytes)
                .with_context(|| format!("writing snapshot {}", path.display()))
        })?;

        let info = SnapshotInfo {
            kind: T::KIND,
            path,
            rows: rows.len(),
            bytes: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
        };
        info!(
            kind = %info.kind,
            path = %info.path.display(),
            rows = info.rows,
            bytes = info.bytes,
            sha256 = %info.sha256,
            "replaced snapshot"
        );
        Ok(info)
    }

    /// Load every row of the kind's current snapshot. No snapshot yet means no rows.
    pub fn read<T: SnapshotRecord>(&self) -> Result<Vec<T>> {
        let path = self.path_for(T::KIND);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("opening snapshot {}", path.display()))
            }
        };
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .with_context(|| format!("reading snapshot metadata {}", path.display()))?
            .build()
            .with_context(|| format!("opening snapshot reader {}", path.display()))?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch.with_context(|| format!("decoding snapshot {}", path.display()))?;
            rows.extend(
                T::from_batch(&batch).with_context(|| format!("decoding {}", path.display()))?,
            );
        }
        Ok(rows)
    }

    pub fn get<T: SnapshotRecord>(&self, id: &str) -> Result<Option<T>> {
        Ok(self.read::<T>()?.into_iter().find(|row| row.id() == id))
    }

    /// Local attachment path of entity `id`, if the entity exists and has one.
    pub fn attachment_path<T: SnapshotRecord>(&self, id: &str) -> Result<Option<PathBuf>> {
        Ok(self
            .get::<T>(id)?
            .and_then(|row| row.attachment_path().map(PathBuf::from)))
    }
}
