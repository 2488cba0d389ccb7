use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use toolmirror_storage::{CatalogStore, PgCatalogStore};
use toolmirror_sync::{
    maybe_build_scheduler, pipeline_from_config, report_markdown, CancellationFlag, RunOptions,
    SyncConfig,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "toolmirror")]
#[command(about = "Mirror the Dockstore tool catalog into a local database")]
struct Cli {
    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct ConfigOverrides {
    /// PostgreSQL connection string (overrides DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Remote catalog listing URL
    #[arg(long, global = true)]
    catalog_url: Option<String>,

    /// Read the catalog from a JSON file instead of HTTP
    #[arg(long, global = true)]
    catalog_file: Option<PathBuf>,

    /// YAML field mapping
    #[arg(long, global = true)]
    mapping: Option<PathBuf>,
}

impl ConfigOverrides {
    fn apply(self, config: &mut SyncConfig) {
        if let Some(url) = self.database_url {
            config.database_url = url;
        }
        if let Some(url) = self.catalog_url {
            config.catalog_url = url;
        }
        if let Some(path) = self.catalog_file {
            config.catalog_file = Some(path);
        }
        if let Some(path) = self.mapping {
            config.mapping_file = Some(path);
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation against the remote catalog
    Sync {
        #[arg(long)]
        dry_run: bool,
        /// Create the catalog tables first if they are missing
        #[arg(long)]
        ensure_schema: bool,
    },
    /// Create the catalog tables
    Migrate,
    /// Serve the `/tools` projection
    Serve,
    /// Run reconciliations on the configured cron schedule until Ctrl-C
    Schedule,
    /// Summarize recent run reports
    Report {
        #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
        runs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    cli.overrides.apply(&mut config);

    match cli.command.unwrap_or(Commands::Sync {
        dry_run: false,
        ensure_schema: false,
    }) {
        Commands::Sync {
            dry_run,
            ensure_schema,
        } => {
            let cancel = CancellationFlag::default();
            let pipeline = pipeline_from_config(config, ensure_schema)
                .await?
                .with_cancellation(cancel.clone());

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current record");
                    cancel.cancel();
                }
            });

            let summary = pipeline.run_once(RunOptions { dry_run }).await?;
            println!(
                "sync {}: run_id={} tools={}/{} versions={}/{} skipped={} failures={} reports={}",
                summary.status.as_str(),
                summary.run_id,
                summary.local_after.tools,
                summary.remote.tools,
                summary.local_after.versions,
                summary.remote.versions,
                summary.skipped.len(),
                summary.applied.failures.len(),
                summary.reports_dir.as_deref().unwrap_or("-"),
            );
        }
        Commands::Migrate => {
            let mapping = config.load_mapping()?;
            let store = PgCatalogStore::connect(&config.database_url, &mapping)
                .await
                .context("connecting to catalog store")?;
            store
                .ensure_schema()
                .await
                .context("creating catalog tables")?;
            println!(
                "schema ready: {}, {}",
                mapping.tools_table, mapping.versions_table
            );
        }
        Commands::Serve => {
            let mapping = config.load_mapping()?;
            let store = PgCatalogStore::connect(&config.database_url, &mapping)
                .await
                .context("connecting to catalog store")?;
            toolmirror_web::serve(Arc::new(store), toolmirror_web::web_port_from_env()).await?;
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let pipeline = Arc::new(pipeline_from_config(config, false).await?);
            let Some(mut sched) = maybe_build_scheduler(pipeline).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            println!("{}", report_markdown(runs as usize, &config.reports_dir)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_runs_must_be_positive() {
        assert!(Cli::try_parse_from(["toolmirror", "report", "--runs", "0"]).is_err());
        let cli = Cli::try_parse_from(["toolmirror", "report", "--runs", "3"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Report { runs: 3 })));
    }
}
