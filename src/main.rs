//! photomigrate-rs: migrate photo libraries, albums included.
//!
//! A single Puller downloads every album and loose asset of the source into a
//! local staging area; a pool of Pushers uploads the staged files to the
//! target and recreates album membership there. The two sides are connected
//! by a deduplicating work queue that throttles the Puller when Pushers fall
//! behind.

#![warn(clippy::all)]

mod cli;
mod config;
mod migrate;
mod paths;
mod repository;
mod shutdown;
mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use migrate::RunReport;
use repository::{AssetRepository, FolderRepository};

/// Run the albums command.
async fn run_albums(args: cli::AlbumsArgs) -> anyhow::Result<()> {
    let root = config::expand_tilde(&args.source);
    let library = FolderRepository::open(root.display().to_string(), &root)
        .with_context(|| format!("Failed to open library {}", root.display()))?;

    let albums = library.list_albums(args.include_shared).await?;
    let loose = library.list_unassociated_assets().await?;

    println!("Library: {}", library.root().display());
    println!();
    if albums.is_empty() {
        println!("No albums");
    }
    for album in &albums {
        println!("  {:<40} {:>6} assets", album.name, album.asset_count);
    }
    println!();
    println!("Unassociated assets: {}", loose.len());
    Ok(())
}

/// Run the migrate command.
async fn run_migrate(args: cli::MigrateArgs) -> anyhow::Result<()> {
    let config = config::Config::from_cli(args)?;
    tracing::info!(pushers = config.pushers, "Starting photomigrate-rs");

    let source = FolderRepository::open(config.source.display().to_string(), &config.source)
        .with_context(|| format!("Failed to open source library {}", config.source.display()))?;
    let target = FolderRepository::create(config.target.display().to_string(), &config.target)
        .with_context(|| format!("Failed to open target library {}", config.target.display()))?;
    tracing::debug!(
        "Staging under {} for {} -> {}",
        config.staging_dir.display(),
        source.root().display(),
        target.root().display()
    );

    let shutdown = shutdown::install_signal_handler()?;
    let report = migrate::migrate(
        Arc::new(source),
        Arc::new(target),
        &config.to_migration_config(),
        shutdown.clone(),
    )
    .await?;

    if let Some(path) = &config.report {
        write_report(path, &report).await?;
        tracing::info!("Report written to {}", path.display());
    }

    if shutdown.is_cancelled() {
        anyhow::bail!("Migration interrupted; run again to transfer the remaining assets");
    }
    if report.has_failures() {
        let c = &report.counters;
        anyhow::bail!(
            "{} assets, {} albums and {} album associations failed to migrate",
            c.failed_assets(),
            c.failed_pull_albums,
            c.failed_album_associations
        );
    }
    Ok(())
}

async fn write_report(path: &Path, report: &RunReport) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(report).context("Failed to serialize run report")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write report {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.command {
        Command::Migrate(args) => run_migrate(args).await,
        Command::Albums(args) => run_albums(args).await,
    }
}
