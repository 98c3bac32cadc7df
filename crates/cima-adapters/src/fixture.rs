//! Offline upstream backed by JSON list-response files.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use tokio::sync::Mutex;

use crate::{TableClient, UpsertSummary, UpstreamError, UpstreamRecord};

#[derive(Debug, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    records: Vec<UpstreamRecord>,
}

#[derive(Debug, Default)]
struct UpsertedRows {
    // table -> merge key -> (record id, fields)
    tables: HashMap<String, BTreeMap<String, (String, Map<String, JsonValue>)>>,
    next_id: usize,
}

/// Serves `<dir>/<table>.json` (or preloaded records) and keeps upserts in memory.
#[derive(Debug, Default)]
pub struct FixtureTableClient {
    dir: Option<PathBuf>,
    preloaded: HashMap<String, Vec<UpstreamRecord>>,
    upserted: Mutex<UpsertedRows>,
}

impl FixtureTableClient {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn with_table(mut self, table: impl Into<String>, records: Vec<UpstreamRecord>) -> Self {
        self.preloaded.insert(table.into(), records);
        self
    }

    /// Rows upserted into `table`, keyed by the merge value.
    pub async fn upserted_rows(&self, table: &str) -> BTreeMap<String, Map<String, JsonValue>> {
        let upserted = self.upserted.lock().await;
        upserted
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .map(|(key, (_, fields))| (key.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn read_fixture(dir: &Path, table: &str) -> anyhow::Result<Vec<UpstreamRecord>> {
        let path = dir.join(format!("{table}.json"));
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let file: FixtureFile =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(file.records)
    }
}

fn merge_key(merge_on: &[&str], fields: &Map<String, JsonValue>) -> String {
    merge_on
        .iter()
        .map(|name| match fields.get(*name) {
            Some(JsonValue::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        })
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

#[async_trait]
impl TableClient for FixtureTableClient {
    async fn list_records(&self, table: &str) -> Result<Vec<UpstreamRecord>, UpstreamError> {
        if let Some(records) = self.preloaded.get(table) {
            return Ok(records.clone());
        }
        let Some(dir) = &self.dir else {
            return Err(UpstreamError::Fixture {
                table: table.to_string(),
                source: anyhow::anyhow!("no fixture registered"),
            });
        };
        Self::read_fixture(dir, table)
            .await
            .map_err(|source| UpstreamError::Fixture {
                table: table.to_string(),
                source,
            })
    }

    async fn upsert_records(
        &self,
        table: &str,
        merge_on: &[&str],
        rows: Vec<Map<String, JsonValue>>,
    ) -> Result<UpsertSummary, UpstreamError> {
        let mut upserted = self.upserted.lock().await;
        let mut summary = UpsertSummary::default();
        for fields in rows {
            let key = merge_key(merge_on, &fields);
            let existing_id = upserted
                .tables
                .get(table)
                .and_then(|rows| rows.get(&key))
                .map(|(id, _)| id.clone());
            let id = match existing_id {
                Some(id) => {
                    summary.updated.push(id.clone());
                    id
                }
                None => {
                    upserted.next_id += 1;
                    let id = format!("recFixture{:05}", upserted.next_id);
                    summary.created.push(id.clone());
                    id
                }
            };
            upserted
                .tables
                .entry(table.to_string())
                .or_default()
                .insert(key, (id, fields));
        }
        Ok(summary)
    }
}
