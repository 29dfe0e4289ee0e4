mod checkpoint;
mod classify;
mod clock;
mod config;
mod error;
mod formatting;
mod gateway;
mod github;
mod model;
mod pipeline;
mod ratelimit;
mod report;
mod signals;
mod sink;
mod store;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use checkpoint::{CheckpointStore, PersistPolicy};
use classify::RuleSet;
use clock::{Clock, SystemClock};
use config::{Config, PipelineConfig};
use formatting::{format_count, format_duration, format_percent, Dots};
use github::GitHubGateway;
use pipeline::{Driver, Progress, RunSummary};
use report::StatusView;
use sink::ResultSink;
use store::{ObjectStore, SqliteObjectStore};

/// Exit status when the run finished with permanent failures
const EXIT_PARTIAL: i32 = 2;

#[derive(Parser)]
#[command(name = "repo-classify")]
#[command(about = "Resumable classification of a GitHub organisation's repositories")]
#[command(after_help = "\x1b[36mExamples:\x1b[0m
  repo-classify run aws-samples              # Classify every repo, resuming if interrupted
  repo-classify run aws-samples --limit 50   # Classify the next 50 pending repos
  repo-classify status aws-samples           # Show progress
  repo-classify report aws-samples -o out.csv")]
struct Cli {
    /// Database file (default: platform data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify every repository of an organisation or user
    Run {
        /// Organisation or user name
        collection: String,

        /// Repositories per checkpointed batch
        #[arg(short, long, default_value = "5")]
        batch_size: usize,

        /// Concurrent fetches within a batch
        #[arg(short, long, default_value = "1")]
        parallelism: usize,

        /// Process at most this many pending repositories
        #[arg(short, long)]
        limit: Option<usize>,

        /// GitHub token (default: GITHUB_TOKEN, GH_TOKEN or `gh auth token`)
        #[arg(long)]
        token: Option<String>,

        /// Re-list the organisation instead of using the stored snapshot
        #[arg(long)]
        refresh_worklist: bool,

        /// Give permanently failed repositories another try (not-found ones excluded)
        #[arg(long)]
        retry_failed: bool,
    },

    /// Show checkpoint progress for a collection
    Status {
        collection: String,
    },

    /// Export classification results as CSV
    Report {
        collection: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete the checkpoint and work list snapshot
    Reset {
        collection: String,

        /// Also delete classification results
        #[arg(long)]
        results: bool,
    },

    /// Show GitHub API rate limit status
    RateLimit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "repo_classify=debug" } else { "repo_classify=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let db_path = match cli.db {
        Some(path) => path,
        None => Config::db_path()?,
    };

    match cli.command {
        Commands::Run {
            collection,
            batch_size,
            parallelism,
            limit,
            token,
            refresh_worklist,
            retry_failed,
        } => {
            let config = PipelineConfig {
                batch_size,
                parallelism,
                limit,
                refresh_work_list: refresh_worklist,
                retry_failed,
                ..Default::default()
            };
            config.validate()?;

            let token = token.or_else(Config::github_token);
            if token.is_none() {
                eprintln!("\x1b[33m..\x1b[0m No GitHub token found. Rate limit: 60 req/hour");
                eprintln!("  Set GITHUB_TOKEN or run: gh auth login");
            }

            let store = open_store(&db_path)?;
            let summary = run_collection(store, &collection, token, config).await?;
            if !summary.failed_permanent.is_empty() {
                std::process::exit(EXIT_PARTIAL);
            }
            Ok(())
        }
        Commands::Status { collection } => show_status(open_store(&db_path)?, &collection),
        Commands::Report { collection, output } => write_report(open_store(&db_path)?, &collection, output),
        Commands::Reset { collection, results } => reset_collection(open_store(&db_path)?, &collection, results),
        Commands::RateLimit => check_rate_limit().await,
    }
}

fn open_store(path: &std::path::Path) -> Result<Arc<dyn ObjectStore>> {
    let store = SqliteObjectStore::open(path)?;
    Ok(Arc::new(store))
}

async fn run_collection(
    store: Arc<dyn ObjectStore>,
    collection: &str,
    token: Option<String>,
    config: PipelineConfig,
) -> Result<RunSummary> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let github = Arc::new(GitHubGateway::new(token, clock.clone())?);
    let driver = Driver::new(collection, store, github.clone(), github, clock, config);

    // Ctrl-C finishes the in-flight batch, then exits
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n\x1b[33m..\x1b[0m Interrupted, finishing current batch (Ctrl-C again to abort)");
                shutdown.store(true, Ordering::SeqCst);
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(130);
                }
            }
        });
    }

    eprintln!("\x1b[36m..\x1b[0m Classifying \x1b[1m{}\x1b[0m", collection);
    let summary = driver
        .run(print_progress, || shutdown.load(Ordering::SeqCst))
        .await
        .with_context(|| format!("Run for '{}' failed", collection))?;

    print_summary(&summary);
    Ok(summary)
}

fn print_progress(progress: &Progress) {
    match progress {
        Progress::Resumed {
            total,
            completed,
            permanent_failures,
            pending,
            extended_by,
            requeued,
        } => {
            eprintln!(
                "\x1b[36m[run]\x1b[0m {} repos: {} done, {} failed, {} to process",
                format_count(*total as u64),
                completed,
                permanent_failures,
                pending
            );
            if *extended_by > 0 {
                eprintln!("\x1b[36m[run]\x1b[0m work list grew by {} repos", extended_by);
            }
            if *requeued > 0 {
                eprintln!("\x1b[36m[run]\x1b[0m requeued {} failed repos", requeued);
            }
        }
        Progress::Throttled { wait, ids } => {
            let resume_at = chrono::Local::now() + chrono::Duration::from_std(*wait).unwrap_or_else(|_| chrono::Duration::zero());
            eprintln!(
                "\x1b[33m[throttle]\x1b[0m \u{23F8} rate limited, waiting {} for {} repos (resumes at {})...",
                format_duration(*wait),
                ids,
                resume_at.format("%H:%M")
            );
        }
        Progress::Batch(report) => {
            let failed = if report.failed > 0 {
                format!(", \x1b[31m{} failed\x1b[0m", report.failed)
            } else {
                String::new()
            };
            let gone = if report.not_found > 0 {
                format!(", {} not found", report.not_found)
            } else {
                String::new()
            };
            let deferred = if report.deferred > 0 {
                format!(", {} deferred", report.deferred)
            } else {
                String::new()
            };
            eprintln!(
                "  [batch {}] +{}{}{}{}  ({}/{}, {})",
                report.batch_num,
                report.completed,
                gone,
                failed,
                deferred,
                report.completed_total,
                report.total,
                format_percent(report.completed_total, report.total)
            );
        }
    }
}

fn print_summary(summary: &RunSummary) {
    let status = if summary.stopped {
        "\x1b[33mstopped\x1b[0m"
    } else if summary.is_clean() {
        "\x1b[32mok\x1b[0m"
    } else if summary.failed_permanent.is_empty() {
        "\x1b[36mpaused\x1b[0m"
    } else {
        "\x1b[33mpartial\x1b[0m"
    };

    eprintln!(
        "{} {}: {}/{} classified (+{} this run), {} failed, {} pending",
        status,
        summary.collection,
        summary.completed_total,
        summary.total,
        summary.completed_this_run,
        summary.failed_permanent.len(),
        summary.pending
    );
    if summary.throttle_waits > 0 {
        eprintln!("  waited out {} rate limit(s)", summary.throttle_waits);
    }
    for (id, reason) in summary.failed_permanent.iter().take(10) {
        eprintln!("  \x1b[31m\u{2717}\x1b[0m {} \x1b[90m{}\x1b[0m", id, reason);
    }
    if summary.failed_permanent.len() > 10 {
        eprintln!("  ... and {} more (see `status`)", summary.failed_permanent.len() - 10);
    }
}

fn show_status(store: Arc<dyn ObjectStore>, collection: &str) -> Result<()> {
    let checkpoints = CheckpointStore::new(store.clone(), collection, PersistPolicy::default());
    let checkpoint = checkpoints.load()?;
    let lease = checkpoints.current_lease()?;
    let results = ResultSink::new(store, collection, PersistPolicy::default()).len()?;

    let view = StatusView {
        collection,
        checkpoint: checkpoint.as_ref(),
        lease: lease.as_ref(),
        results,
        now: SystemClock.now(),
    };

    eprintln!("\x1b[36mClassification Status\x1b[0m\n");
    for line in view.render() {
        eprintln!("  {}", line);
    }
    Ok(())
}

fn write_report(store: Arc<dyn ObjectStore>, collection: &str, output: Option<PathBuf>) -> Result<()> {
    let sink = ResultSink::new(store, collection, PersistPolicy::default());
    let records = sink.records()?;
    if records.is_empty() {
        eprintln!("\x1b[31mx\x1b[0m No results for '{}'.", collection);
        eprintln!("  Run: repo-classify run {}", collection);
        std::process::exit(1);
    }

    let rules = RuleSet::builtin();
    let dimensions: Vec<&str> = rules.dimension_names().collect();

    let written = match &output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            report::write_csv(&mut std::io::BufWriter::new(file), &dimensions, &records)?
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            let n = report::write_csv(&mut lock, &dimensions, &records)?;
            lock.flush()?;
            n
        }
    };

    if let Some(path) = output {
        eprintln!("\x1b[32mok\x1b[0m Wrote {} rows to {}", written, path.display());
    }
    Ok(())
}

fn reset_collection(store: Arc<dyn ObjectStore>, collection: &str, results: bool) -> Result<()> {
    let checkpoints = CheckpointStore::new(store, collection, PersistPolicy::default());
    if let Some(lease) = checkpoints.current_lease()? {
        if !lease.is_expired(SystemClock.now()) {
            anyhow::bail!("'{}' is being processed by {} (lease until {})", collection, lease.holder, lease.expires_at);
        }
    }

    let removed = checkpoints.reset(results)?;
    if removed == 0 {
        eprintln!("\x1b[33m..\x1b[0m Nothing stored for '{}'", collection);
    } else {
        let what = if results { "checkpoint, work list and results" } else { "checkpoint and work list" };
        eprintln!("\x1b[32mok\x1b[0m Reset {} for '{}' ({} objects)", what, collection, removed);
    }
    Ok(())
}

async fn check_rate_limit() -> Result<()> {
    let gateway = GitHubGateway::new(Config::github_token(), Arc::new(SystemClock))?;

    let dots = Dots::start("Checking rate limit");
    let rate = gateway.rate_limit().await;
    dots.stop();
    let core = rate?.core;

    let reset_time = core
        .reset_at()
        .map(|dt| dt.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "?".to_string());

    eprintln!("\x1b[36mGitHub API Rate Limit\x1b[0m\n");
    eprintln!("  \x1b[90mAuthenticated:\x1b[0m {}", if gateway.has_token() { "yes" } else { "no" });
    eprintln!("  \x1b[90mLimit:\x1b[0m         {}/hour", core.limit);
    eprintln!("  \x1b[90mRemaining:\x1b[0m     {}", core.remaining);
    eprintln!("  \x1b[90mResets at:\x1b[0m     {}", reset_time);

    Ok(())
}
