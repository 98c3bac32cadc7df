//! Runtime configuration, read from `CIMA_*` environment variables and an optional file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use cima_adapters::AttachmentPolicy;
use cima_core::EntityKind;
use serde::Deserialize;

pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root for snapshot files and attachment directories.
    pub datastore: PathBuf,
    pub airtable_pat: String,
    pub airtable_api_url: String,
    pub airtable_base: String,
    pub documents_table: String,
    pub events_table: String,
    pub people_table: String,
    pub mailing_table: String,
    pub refresh_interval_secs: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub attachment_policy: AttachmentPolicy,
    pub bind_host: String,
    pub bind_port: u16,
    pub cors_origins: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            datastore: PathBuf::from("./data"),
            airtable_pat: String::new(),
            airtable_api_url: "https://api.airtable.com/v0".to_string(),
            airtable_base: "appDwuBzzUFQKZqrx".to_string(),
            documents_table: "tblhrPSM9atIrQquv".to_string(),
            events_table: "tblz2kaxgRjPtr102".to_string(),
            people_table: "tblDzrBK7Mb7Zxe8o".to_string(),
            mailing_table: "tblSHOisjiHmIFd5P".to_string(),
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            http_timeout_secs: 20,
            user_agent: "cima-sync/0.1".to_string(),
            attachment_policy: AttachmentPolicy::default(),
            bind_host: "0.0.0.0".to_string(),
            bind_port: 8000,
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ],
        }
    }
}

impl SyncConfig {
    /// Load `.env`, then `CIMA_CONFIG` (if set), then `CIMA_*` variables, over the defaults.
    pub fn load() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("CIMA_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CIMA")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("cors_origins"),
        );
        let mut cfg: Self = builder
            .build()
            .context("reading configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;

        // Legacy deployments export the token without the CIMA_ prefix.
        if cfg.airtable_pat.is_empty() {
            if let Ok(pat) = std::env::var("AIRTABLE_CIMA_PAT") {
                cfg.airtable_pat = pat;
            }
        }
        Ok(cfg)
    }

    pub fn table_for(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Documents => &self.documents_table,
            EntityKind::Events => &self.events_table,
            EntityKind::People => &self.people_table,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }
}
