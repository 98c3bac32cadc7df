//! Refresh pipeline: fetch upstream records, normalize them, replace snapshots.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use cima_adapters::{
    AirtableClient, AirtableConfig, NormalizeError, Normalizer, TableClient, UpstreamEntity,
    UpstreamError,
};
use cima_core::{Document, EntityKind, Event, Person};
use cima_storage::{AttachmentStore, BlobSource, HttpClientConfig, HttpFetcher};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

pub mod config;
pub mod scheduler;
pub mod snapshot;

pub use config::SyncConfig;
pub use scheduler::{RefreshScheduler, SchedulerHandle};
pub use snapshot::{SnapshotInfo, SnapshotRecord, SnapshotStore};

pub const CRATE_NAME: &str = "cima-sync";

/// Where in a kind's refresh a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshPhase {
    Fetching,
    Normalizing,
    Writing,
}

impl fmt::Display for RefreshPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RefreshPhase::Fetching => "fetching",
            RefreshPhase::Normalizing => "normalizing",
            RefreshPhase::Writing => "writing",
        })
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("{kind}: upstream unavailable: {source}")]
    Upstream {
        kind: EntityKind,
        #[source]
        source: UpstreamError,
    },
    #[error("{kind}: {source}")]
    Normalize {
        kind: EntityKind,
        #[source]
        source: NormalizeError,
    },
    #[error("{kind}: snapshot write failed: {source:#}")]
    SnapshotWrite {
        kind: EntityKind,
        #[source]
        source: anyhow::Error,
    },
}

impl RefreshError {
    pub fn kind(&self) -> EntityKind {
        match self {
            RefreshError::Upstream { kind, .. }
            | RefreshError::Normalize { kind, .. }
            | RefreshError::SnapshotWrite { kind, .. } => *kind,
        }
    }

    pub fn phase(&self) -> RefreshPhase {
        match self {
            RefreshError::Upstream { .. } => RefreshPhase::Fetching,
            RefreshError::Normalize { .. } => RefreshPhase::Normalizing,
            RefreshError::SnapshotWrite { .. } => RefreshPhase::Writing,
        }
    }
}

/// A successful refresh of one entity kind.
#[derive(Debug, Clone, Serialize)]
pub struct KindReport {
    pub kind: EntityKind,
    pub fetched: usize,
    pub skipped: usize,
    pub snapshot: SnapshotInfo,
}

#[derive(Debug)]
pub struct KindOutcome {
    pub kind: EntityKind,
    pub result: Result<KindReport, RefreshError>,
}

#[derive(Debug)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<KindOutcome>,
    /// Set when shutdown was requested before every kind ran.
    pub interrupted: bool,
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        !self.interrupted && self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &RefreshError> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().err())
    }
}

pub fn airtable_client(config: &SyncConfig) -> Result<AirtableClient> {
    if config.airtable_pat.is_empty() {
        warn!("no airtable token configured; upstream requests will be rejected");
    }
    AirtableClient::new(AirtableConfig {
        api_url: config.airtable_api_url.clone(),
        base_id: config.airtable_base.clone(),
        token: config.airtable_pat.clone(),
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
    })
}

pub fn http_fetcher(config: &SyncConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
}

/// Fetch → normalize → write, per entity kind, against one datastore root.
pub struct RefreshPipeline {
    config: SyncConfig,
    upstream: Arc<dyn TableClient>,
    blobs: Arc<dyn BlobSource>,
    snapshots: SnapshotStore,
    attachments: AttachmentStore,
}

impl RefreshPipeline {
    pub fn new(
        config: SyncConfig,
        upstream: Arc<dyn TableClient>,
        blobs: Arc<dyn BlobSource>,
    ) -> Self {
        let snapshots = SnapshotStore::new(config.datastore.clone());
        let attachments = AttachmentStore::new(config.datastore.clone());
        Self {
            config,
            upstream,
            blobs,
            snapshots,
            attachments,
        }
    }

    /// Pipeline against the live upstream and attachment host.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let upstream = Arc::new(airtable_client(&config)?);
        let blobs = Arc::new(http_fetcher(&config)?);
        Ok(Self::new(config, upstream, blobs))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub async fn refresh_kind(&self, kind: EntityKind) -> Result<KindReport, RefreshError> {
        match kind {
            EntityKind::Documents => self.refresh::<Document>().await,
            EntityKind::Events => self.refresh::<Event>().await,
            EntityKind::People => self.refresh::<Person>().await,
        }
    }

    async fn refresh<T>(&self) -> Result<KindReport, RefreshError>
    where
        T: UpstreamEntity + SnapshotRecord + Send + 'static,
    {
        let kind = T::KIND;
        let table = self.config.table_for(kind);

        info!(%kind, table, phase = %RefreshPhase::Fetching, "refreshing");
        let records = self
            .upstream
            .list_records(table)
            .await
            .map_err(|source| RefreshError::Upstream { kind, source })?;

        info!(%kind, records = records.len(), phase = %RefreshPhase::Normalizing, "refreshing");
        let normalizer = Normalizer::new(
            &self.attachments,
            self.blobs.as_ref(),
            self.config.attachment_policy,
        );
        let batch = normalizer
            .normalize_all::<T>(&records)
            .await
            .map_err(|source| RefreshError::Normalize { kind, source })?;

        info!(%kind, rows = batch.entities.len(), phase = %RefreshPhase::Writing, "refreshing");
        let snapshots = self.snapshots.clone();
        let rows = batch.entities;
        let span = Span::current();
        let snapshot = tokio::task::spawn_blocking(move || span.in_scope(|| snapshots.write(&rows)))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|written| written)
            .map_err(|source| RefreshError::SnapshotWrite { kind, source })?;

        Ok(KindReport {
            kind,
            fetched: records.len(),
            skipped: batch.skipped.len(),
            snapshot,
        })
    }

    /// One full cycle over every kind, with no cancellation.
    pub async fn run_cycle(&self) -> CycleReport {
        let (_tx, rx) = watch::channel(false);
        self.run_cycle_until(&rx).await
    }

    /// Run every kind in order, checking `stop` before each one. A kind that
    /// has started always runs to completion.
    pub async fn run_cycle_until(&self, stop: &watch::Receiver<bool>) -> CycleReport {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut outcomes = Vec::with_capacity(EntityKind::ALL.len());
        let mut interrupted = false;

        async {
            info!("refresh cycle started");
            for kind in EntityKind::ALL {
                if *stop.borrow() {
                    info!(%kind, "shutdown requested; stopping before next kind");
                    interrupted = true;
                    break;
                }
                let result = self.refresh_kind(kind).await;
                if let Err(err) = &result {
                    error!(%kind, phase = %err.phase(), error = %err, "refresh failed; keeping previous snapshot");
                }
                outcomes.push(KindOutcome { kind, result });
            }
        }
        .instrument(info_span!("refresh_cycle", cycle_id = %cycle_id))
        .await;

        let report = CycleReport {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            outcomes,
            interrupted,
        };
        info!(
            cycle_id = %report.cycle_id,
            kinds = report.outcomes.len(),
            failed = report.failures().count(),
            interrupted = report.interrupted,
            "refresh cycle finished"
        );
        report
    }
}
