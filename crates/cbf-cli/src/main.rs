use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "cbf")]
#[command(about = "Catalog backlog finder: reconcile identifier stores and crawl category trees")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write the unprocessed work queue for one domain, or `all`.
    Reconcile {
        #[arg(default_value = cbf_sync::ALL_DOMAINS)]
        domain: String,
    },
    /// Crawl the category tree below each seed and upsert it.
    Crawl {
        #[arg(long = "seed", default_value = cbf_sync::DEFAULT_SEED)]
        seeds: Vec<String>,
        #[arg(long, default_value = cbf_sync::DEFAULT_GEO)]
        geo: String,
    },
    /// Re-run ingestion from a saved category batch.
    Replay { artifact: PathBuf },
    /// Apply database migrations.
    Migrate,
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match cli.verbose {
        0 => "cbf=info",
        1 => "cbf=debug",
        _ => "cbf=trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => fmt().with_env_filter(env_filter).with_target(false).init(),
        LogFormat::Json => fmt().json().with_env_filter(env_filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.command {
        Commands::Reconcile { domain } => {
            let summary = cbf_sync::run_reconcile_from_env(&domain).await?;
            for report in &summary.domains {
                match &report.outcome {
                    Some(outcome) => println!(
                        "{}: source={} sink={} unprocessed={} -> {}",
                        report.domain,
                        outcome.source_count,
                        outcome.sink_count,
                        outcome.unprocessed_count,
                        outcome.unprocessed.path
                    ),
                    None => println!(
                        "{}: {} ({})",
                        report.domain,
                        report.status,
                        report.error.as_deref().unwrap_or("unknown error")
                    ),
                }
            }
            println!("run_id={} report={}", summary.run_id, summary.report_path);
            if summary.failed() > 0 {
                error!(failed = summary.failed(), "some domains did not reconcile");
                bail!("{} of {} domains failed", summary.failed(), summary.domains.len());
            }
        }
        Commands::Crawl { seeds, geo } => {
            let summary = cbf_sync::run_crawl_from_env(&seeds, &geo).await?;
            for seed in &summary.seeds {
                println!(
                    "seed {}: nodes={} fetched={} failures={} truncated={} artifact={}",
                    seed.seed_id,
                    seed.nodes,
                    seed.fetched,
                    seed.failures.len(),
                    seed.truncated,
                    seed.artifact.as_deref().unwrap_or("-")
                );
            }
            println!("run_id={} report={}", summary.run_id, summary.report_path);
            if summary.failed_seeds() > 0 {
                bail!(
                    "{} seed(s) failed; replay saved batches with `cbf replay <artifact>`",
                    summary.failed_seeds()
                );
            }
        }
        Commands::Replay { artifact } => {
            let outcome = cbf_sync::replay_from_env(&artifact).await?;
            println!(
                "replayed {} rows for market {} (affected={})",
                outcome.rows, outcome.market, outcome.affected
            );
        }
        Commands::Migrate => {
            cbf_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
