use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glsync_sync::{build_pipeline, build_scheduler, RefreshPolicy, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "glsync")]
#[command(about = "Sync GitLab issues into a folder of Markdown documents")]
struct Cli {
    /// Settings file (YAML or JSON). Overrides GLSYNC_SETTINGS.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Root directory documents are written under. Overrides GLSYNC_VAULT.
    #[arg(long, global = true)]
    vault: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one synchronization pass.
    Sync,
    /// Keep refreshing on the configured schedule until interrupted.
    Watch,
    /// Print the resolved sources.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(settings) = cli.settings {
        config.settings_path = settings;
    }
    if let Some(vault) = cli.vault {
        config.vault = vault;
    }
    let settings = config.load_settings()?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = build_pipeline(&config, &settings)?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} sources={} failed={} issues={} created={} updated={} deleted={}",
                summary.run_id,
                summary.sources,
                summary.failed_sources,
                summary.unique_issues,
                summary.created,
                summary.updated,
                summary.deleted
            );
            for diagnostic in &summary.diagnostics {
                eprintln!("  {diagnostic}");
            }
        }
        Commands::Watch => {
            if !settings.has_any_token() {
                tracing::warn!("no source has a token configured, not scheduling refreshes");
                return Ok(());
            }
            let policy = RefreshPolicy::from_settings(&settings);
            let pipeline = Arc::new(build_pipeline(&config, &settings)?);
            let Some(mut sched) = build_scheduler(pipeline, policy).await? else {
                tracing::warn!("refresh on startup and interval are both off, nothing to schedule");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!(interval = ?policy.interval, on_startup = policy.on_startup, "watching");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Sources => {
            for (index, source) in settings.resolve_sources().iter().enumerate() {
                println!(
                    "{index}: {} scope={} token={}",
                    source.issues_url(),
                    source.scope,
                    if source.has_token() { "<redacted>" } else { "<none>" }
                );
            }
        }
    }

    Ok(())
}
