//! Upstream tabular service contract, record normalization and mailing upserts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub mod airtable;
pub mod fixture;
pub mod mailing;
pub mod normalize;

pub use airtable::{AirtableClient, AirtableConfig};
pub use fixture::FixtureTableClient;
pub use mailing::{upsert_mailing, MailingError, MailingReceipt};
pub use normalize::{
    AttachmentPolicy, Normalized, NormalizedBatch, NormalizeError, Normalizer, Parsed, SkipReason,
    UpstreamEntity,
};

pub const CRATE_NAME: &str = "cima-adapters";

/// One loosely-typed row as returned by the upstream service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamRecord {
    pub id: String,
    #[serde(default, rename = "createdTime", skip_serializing_if = "Option::is_none")]
    pub created_time: Option<String>,
    #[serde(default)]
    pub fields: Map<String, JsonValue>,
}

impl UpstreamRecord {
    pub fn new(id: impl Into<String>, fields: JsonValue) -> Self {
        let fields = match fields {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            created_time: None,
            fields,
        }
    }
}

/// Upstream's per-batch upsert outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub created: Vec<String>,
    pub updated: Vec<String>,
}

impl UpsertSummary {
    pub fn merge(&mut self, other: UpsertSummary) {
        self.created.extend(other.created);
        self.updated.extend(other.updated);
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request for table {table} failed: {source}")]
    Request {
        table: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("upstream returned status {status} for table {table}: {body}")]
    Status {
        table: String,
        status: u16,
        body: String,
    },
    #[error("reading fixture table {table}: {source:#}")]
    Fixture {
        table: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Black-box access to the upstream tabular service.
#[async_trait]
pub trait TableClient: Send + Sync {
    /// All records of `table` in one bulk vector.
    async fn list_records(&self, table: &str) -> Result<Vec<UpstreamRecord>, UpstreamError>;

    /// Upsert rows keyed by the `merge_on` fields; rows matching an existing key update it.
    async fn upsert_records(
        &self,
        table: &str,
        merge_on: &[&str],
        rows: Vec<Map<String, JsonValue>>,
    ) -> Result<UpsertSummary, UpstreamError>;
}
