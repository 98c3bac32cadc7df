use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cima_adapters::{upsert_mailing, FixtureTableClient, TableClient};
use cima_sync::{RefreshPipeline, RefreshScheduler, SyncConfig};
use cima_web::AppState;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cima")]
#[command(about = "CIMA research datastore: upstream refresh and read API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API while refreshing snapshots in the background.
    Serve {
        /// Serve existing snapshots only.
        #[arg(long)]
        no_refresh: bool,
    },
    /// Run one refresh cycle and exit non-zero if any entity kind failed.
    Refresh {
        /// Read upstream tables from `<dir>/<table>.json` instead of the live service.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Add email addresses to the mailing list.
    Subscribe {
        #[arg(required = true)]
        emails: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::load()?;

    match cli.command.unwrap_or(Commands::Serve { no_refresh: false }) {
        Commands::Serve { no_refresh } => serve(config, !no_refresh).await,
        Commands::Refresh { fixtures } => refresh_once(config, fixtures).await,
        Commands::Subscribe { emails } => {
            let client = cima_sync::airtable_client(&config)?;
            let receipt = upsert_mailing(&client, &config.mailing_table, &emails).await?;
            println!(
                "subscribed: submitted={} created={} updated={}",
                receipt.submitted, receipt.created, receipt.updated
            );
            Ok(())
        }
    }
}

async fn serve(config: SyncConfig, refresh: bool) -> Result<()> {
    let upstream: Arc<dyn TableClient> = Arc::new(cima_sync::airtable_client(&config)?);
    let blobs = Arc::new(cima_sync::http_fetcher(&config)?);
    let pipeline = Arc::new(RefreshPipeline::new(config.clone(), upstream.clone(), blobs));

    let scheduler = refresh.then(|| RefreshScheduler::new(pipeline.clone()).spawn());
    if scheduler.is_none() {
        info!("background refresh disabled");
    }

    let state = AppState::new(
        pipeline.snapshots().clone(),
        upstream,
        config.mailing_table.clone(),
    );
    let router = cima_web::app(state, &config.cors_origins);
    let addr = config.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let served = cima_web::serve(listener, router, wait_for_shutdown_signal()).await;
    if let Some(handle) = scheduler {
        handle.shutdown().await;
    }
    served
}

async fn refresh_once(config: SyncConfig, fixtures: Option<PathBuf>) -> Result<()> {
    let upstream: Arc<dyn TableClient> = match fixtures {
        Some(dir) => {
            info!(dir = %dir.display(), "refreshing from fixture tables");
            Arc::new(FixtureTableClient::from_dir(dir))
        }
        None => Arc::new(cima_sync::airtable_client(&config)?),
    };
    let blobs = Arc::new(cima_sync::http_fetcher(&config)?);
    let pipeline = RefreshPipeline::new(config, upstream, blobs);

    let report = pipeline.run_cycle().await;
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(kind) => println!(
                "{}: rows={} skipped={} bytes={} sha256={}",
                kind.kind, kind.snapshot.rows, kind.skipped, kind.snapshot.bytes, kind.snapshot.sha256
            ),
            Err(err) => println!("{}: failed while {}: {err}", outcome.kind, err.phase()),
        }
    }
    if !report.is_success() {
        bail!("refresh cycle {} did not complete cleanly", report.cycle_id);
    }
    println!("refresh complete: cycle_id={}", report.cycle_id);
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
            }
            _ => {
                warn!("could not register unix signal handlers; falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_serve() {
        let cli = Cli::parse_from(["cima"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn parses_refresh_with_fixtures() {
        let cli = Cli::parse_from(["cima", "refresh", "--fixtures", "fixtures/airtable"]);
        match cli.command {
            Some(Commands::Refresh { fixtures }) => {
                assert_eq!(fixtures, Some(PathBuf::from("fixtures/airtable")))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn subscribe_requires_an_address() {
        assert!(Cli::try_parse_from(["cima", "subscribe"]).is_err());
    }
}
