//! HTTP client for the Airtable REST API.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, info};

use crate::{TableClient, UpsertSummary, UpstreamError, UpstreamRecord};

/// Upstream limit on records per write request.
pub const MAX_RECORDS_PER_WRITE: usize = 10;

#[derive(Debug, Clone)]
pub struct AirtableConfig {
    pub api_url: String,
    pub base_id: String,
    pub token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AirtableClient {
    client: reqwest::Client,
    api_url: String,
    base_id: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    records: Vec<UpstreamRecord>,
    #[serde(default)]
    offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpsertResponse {
    #[serde(default, rename = "createdRecords")]
    created_records: Vec<String>,
    #[serde(default, rename = "updatedRecords")]
    updated_records: Vec<String>,
}

impl AirtableClient {
    pub fn new(config: AirtableConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building airtable client")?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            base_id: config.base_id,
            token: config.token,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}/{}", self.api_url, self.base_id, table)
    }

    async fn send(
        &self,
        table: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, UpstreamError> {
        let request_err = |source| UpstreamError::Request {
            table: table.to_string(),
            source,
        };
        let resp = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(request_err)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(UpstreamError::Status {
            table: table.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl TableClient for AirtableClient {
    async fn list_records(&self, table: &str) -> Result<Vec<UpstreamRecord>, UpstreamError> {
        let url = self.table_url(table);
        let mut records = Vec::new();
        let mut offset: Option<String> = None;

        loop {
            let mut request = self.client.get(&url);
            if let Some(offset) = &offset {
                request = request.query(&[("offset", offset)]);
            }
            let page: ListResponse = self
                .send(table, request)
                .await?
                .json()
                .await
                .map_err(|source| UpstreamError::Request {
                    table: table.to_string(),
                    source,
                })?;
            debug!(table, page_records = page.records.len(), "fetched page");
            records.extend(page.records);

            match page.offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        info!(table, records = records.len(), "listed upstream records");
        Ok(records)
    }

    async fn upsert_records(
        &self,
        table: &str,
        merge_on: &[&str],
        rows: Vec<Map<String, JsonValue>>,
    ) -> Result<UpsertSummary, UpstreamError> {
        let url = self.table_url(table);
        let mut summary = UpsertSummary::default();

        for chunk in rows.chunks(MAX_RECORDS_PER_WRITE) {
            let body = json!({
                "performUpsert": { "fieldsToMergeOn": merge_on },
                "records": chunk
                    .iter()
                    .map(|fields| json!({ "fields": fields }))
                    .collect::<Vec<_>>(),
            });
            let resp: UpsertResponse = self
                .send(table, self.client.patch(&url).json(&body))
                .await?
                .json()
                .await
                .map_err(|source| UpstreamError::Request {
                    table: table.to_string(),
                    source,
                })?;
            summary.merge(UpsertSummary {
                created: resp.created_records,
                updated: resp.updated_records,
            });
        }

        Ok(summary)
    }
}
