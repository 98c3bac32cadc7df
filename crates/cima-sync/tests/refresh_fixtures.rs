use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use cima_adapters::FixtureTableClient;
use cima_core::{Document, EntityKind, Event, Person};
use cima_storage::{BlobSource, FetchError};
use cima_sync::{RefreshPipeline, SyncConfig};

struct NoBlobs;

#[async_trait]
impl BlobSource for NoBlobs {
    async fn fetch_blob(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::HttpStatus {
            status: 404,
            url: url.to_string(),
        })
    }
}

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/airtable")
}

#[tokio::test]
async fn offline_refresh_populates_all_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        datastore: dir.path().to_path_buf(),
        ..SyncConfig::default()
    };
    let pipeline = RefreshPipeline::new(
        config,
        Arc::new(FixtureTableClient::from_dir(fixtures_dir())),
        Arc::new(NoBlobs),
    );

    let first = pipeline.run_cycle().await;
    assert!(first.is_success(), "failures: {:?}", first.failures().collect::<Vec<_>>());

    let docs: Vec<Document> = pipeline.snapshots().read().unwrap();
    assert_eq!(
        docs.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
        vec!["recDoc0001", "recDoc0002"]
    );
    assert_eq!(pipeline.snapshots().read::<Event>().unwrap().len(), 2);
    assert_eq!(pipeline.snapshots().read::<Person>().unwrap().len(), 2);

    // Same upstream data, same bytes.
    let second = pipeline.run_cycle().await;
    for (a, b) in first.outcomes.iter().zip(&second.outcomes) {
        let (a, b) = (a.result.as_ref().unwrap(), b.result.as_ref().unwrap());
        assert_eq!(a.snapshot.sha256, b.snapshot.sha256, "{} not byte-stable", a.kind);
    }
    assert!(dir
        .path()
        .join(EntityKind::Events.snapshot_file())
        .exists());
}
