use anyhow::Result;
use clap::{Parser, Subcommand};
use partsdesk::shopify::ShopifyClient;
use partsdesk::sync::{ContinuationToken, SyncOptions, SyncRunner};
use partsdesk::verify::{FinalStatus, IncrementalOutcome, RefreshDriver, RefreshOutcome};
use partsdesk::{config, db, verify};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Incremental sync of open orders into the local mirror.
    Sync {
        /// Continuation token from a previously paused run.
        #[arg(long)]
        resume: Option<String>,
    },
    /// Delete-and-reimport the whole mirror, with count verification.
    Refresh {
        #[arg(long)]
        resume: Option<String>,
        /// The resumed import belongs to recovery mode.
        #[arg(long, default_value_t = false)]
        recovering: bool,
    },
    /// Refresh a single order by its remote id.
    Order { remote_id: i64 },
    /// Run incremental syncs on an interval until stopped. The persisted
    /// `auto_sync` setting can disable passes without killing the process.
    Watch,
    /// Print the persisted sync status, applying the staleness timeout.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/partsdesk.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let client = ShopifyClient::from_config(&cfg)?;
    let opts = SyncOptions::from_config(&cfg.sync);

    match args.command {
        Command::Sync { resume } => {
            let token = resume.as_deref().map(ContinuationToken::decode).transpose()?;
            match verify::run_incremental(&pool, &client, opts, token).await? {
                IncrementalOutcome::Finished {
                    status,
                    sync,
                    verify,
                    audit,
                } => {
                    for line in &audit {
                        info!("{}", line);
                    }
                    if let Some(report) = sync {
                        info!(
                            imported = report.imported,
                            failed = report.failed,
                            requests = report.requests,
                            "sync finished"
                        );
                    }
                    if let Some(v) = verify {
                        info!(
                            expected = v.expected.orders,
                            actual = v.actual.orders,
                            mismatch = v.mismatch,
                            "verification"
                        );
                    }
                    report_status(status);
                }
                IncrementalOutcome::Paused(token) => {
                    println!("{}", token.encode());
                    info!("sync paused; pass the printed token to --resume");
                }
            }
        }
        Command::Refresh { resume, recovering } => {
            let token = resume.as_deref().map(ContinuationToken::decode).transpose()?;
            let mut driver = RefreshDriver::new(&pool, &client, opts)
                .with_audit_cap(cfg.sync.audit_log_cap);
            match driver.run(token.map(|t| (t, recovering))).await? {
                RefreshOutcome::Finished(report) => {
                    for line in &report.audit {
                        info!("{}", line);
                    }
                    if report.recovered {
                        warn!("refresh needed recovery mode");
                    }
                    report_status(report.status);
                }
                RefreshOutcome::Paused { token, recovering } => {
                    println!("{}", token.encode());
                    info!(recovering, "refresh paused; pass the printed token to --resume");
                }
            }
        }
        Command::Order { remote_id } => {
            let mut runner = SyncRunner::new(&pool, &client, opts);
            runner.sync_order(remote_id).await?;
            info!(remote_id, "order refreshed");
        }
        Command::Watch => {
            let interval = Duration::from_millis(cfg.app.poll_interval_ms);
            loop {
                let enabled = db::get_setting(&pool, db::keys::AUTO_SYNC)
                    .await?
                    .map(|v| v != "0" && v != "false")
                    .unwrap_or(true);
                if enabled {
                    match verify::run_incremental(&pool, &client, opts.clone(), None).await {
                        Ok(IncrementalOutcome::Finished { status, sync, .. }) => {
                            if let Some(report) = sync {
                                info!(imported = report.imported, failed = report.failed, "pass done");
                            }
                            report_status(status);
                        }
                        Ok(IncrementalOutcome::Paused(_)) => {}
                        Err(err) => warn!(?err, "sync pass failed"),
                    }
                } else {
                    info!("auto sync disabled, skipping pass");
                }
                tokio::time::sleep(interval).await;
            }
        }
        Command::Status => {
            let stored = db::read_sync_status(&pool).await?;
            let effective = stored.effective(
                Duration::from_secs(cfg.sync.status_stale_secs),
                chrono::Utc::now(),
            );
            println!("{}", effective.as_str());
        }
    }

    Ok(())
}

fn report_status(status: FinalStatus) {
    match status {
        FinalStatus::Success => info!("result: success"),
        FinalStatus::SuccessWithMismatch => warn!("result: success with count mismatch"),
        FinalStatus::Failed => warn!("result: failed"),
    }
}
