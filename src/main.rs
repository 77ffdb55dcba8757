//! Listing Harvester main entry point
//!
//! This is the command-line interface for the listing harvester.

use anyhow::Context;
use clap::Parser;
use listing_harvester::config::{load_config_with_hash, Config};
use listing_harvester::crawler::{plan_only, run_crawl, work_list};
use listing_harvester::output::{load_statistics, print_crawl_report, print_statistics};
use listing_harvester::storage::{open_storage, RunStatus};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Listing Harvester: complete ingestion of window-limited search APIs
///
/// Splits each configured price range until every slice fits in the API's
/// result window, pages through every slice and upserts each listing into
/// SQLite by its identifier.
#[derive(Parser, Debug)]
#[command(name = "listing-harvester")]
#[command(version)]
#[command(about = "Harvests every listing from a window-limited search API", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Resume an unfinished run of the same configuration (default behavior)
    #[arg(long, conflicts_with = "fresh")]
    resume: bool,

    /// Start a new run, ignoring unfinished ones
    #[arg(long, conflicts_with = "resume")]
    fresh: bool,

    /// Validate config and show the work list without contacting the API
    #[arg(long, conflicts_with_all = ["plan", "stats"])]
    dry_run: bool,

    /// Probe the API and print the leaf partitions without ingesting
    #[arg(long, conflicts_with_all = ["dry_run", "stats"])]
    plan: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with_all = ["dry_run", "plan"])]
    stats: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(&config)?;
        Ok(ExitCode::SUCCESS)
    } else if cli.plan {
        handle_plan(&config).await?;
        Ok(ExitCode::SUCCESS)
    } else if cli.stats {
        handle_stats(&config)?;
        Ok(ExitCode::SUCCESS)
    } else {
        handle_crawl(config, &config_hash, cli.fresh).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("listing_harvester=info,warn"),
            1 => EnvFilter::new("listing_harvester=debug,info"),
            2 => EnvFilter::new("listing_harvester=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Cancels the returned token on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight pages");
            token.cancel();
        }
    });
    cancel
}

/// Handles the --dry-run mode: validates config and shows what would be crawled
fn handle_dry_run(config: &Config) -> anyhow::Result<()> {
    println!("=== Listing Harvester Dry Run ===\n");

    println!("API:");
    println!("  Endpoint: {}", config.api.endpoint);
    println!("  User agent: {}", config.api.user_agent);
    println!(
        "  Dimension: {} (filters {} / {}, {:?} upper bound)",
        config.api.dimension_field,
        config.api.min_filter,
        config.api.max_filter,
        config.api.max_filter_bound
    );

    println!("\nCrawler Configuration:");
    println!("  Rate limit delay: {}ms", config.crawler.rate_limit_delay);
    println!(
        "  Result window: {} (accepting leaves up to {})",
        config.crawler.result_window,
        config.crawler.window_limit()
    );
    println!("  Max depth: {}", config.crawler.max_depth);
    println!("  Min slice: {}", config.crawler.min_slice);
    println!(
        "  Page size: {} (max {} pages per leaf)",
        config.crawler.page_size,
        config.crawler.effective_max_pages()
    );
    println!("  Concurrency: {}", config.crawler.concurrency);

    println!("\nRetry:");
    println!("  Max attempts: {}", config.retry.max_attempts);
    println!(
        "  Backoff: {}ms doubling up to {}ms, jitter {}ms",
        config.retry.base_delay, config.retry.max_delay, config.retry.jitter
    );

    println!("\nOutput:");
    println!("  Database: {}", config.output.database_path);

    let work = work_list(config)?;
    println!("\nWork Items ({}):", work.len());
    for item in &work {
        println!("  - {} {}", item.segment, item.range);
    }

    println!("\n✓ Configuration is valid");
    Ok(())
}

/// Handles the --plan mode: probes the API and prints leaf partitions
async fn handle_plan(config: &Config) -> anyhow::Result<()> {
    let plans = plan_only(config, cancel_on_ctrl_c())
        .await
        .context("Planning failed")?;

    println!("=== Partition Plan ===\n");
    for (item, leaves) in &plans {
        let expected: u64 = leaves.iter().filter_map(|l| l.probed_count).sum();
        println!(
            "{} {}: {} leaves, ~{} records",
            item.segment,
            item.range,
            leaves.len(),
            expected
        );
        for leaf in leaves {
            let count = leaf
                .probed_count
                .map_or_else(|| "?".to_string(), |c| c.to_string());
            let flag = if leaf.capped { "  [capped]" } else { "" };
            println!("  {} depth {} count {}{}", leaf.range, leaf.depth, count, flag);
        }
    }
    Ok(())
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.output.database_path);

    // Open the database
    let storage = open_storage(Path::new(&config.output.database_path))
        .context("Failed to open database")?;

    let stats = load_statistics(&storage)?;
    print_statistics(&stats);
    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(config: Config, config_hash: &str, fresh: bool) -> anyhow::Result<ExitCode> {
    if fresh {
        tracing::info!("Starting fresh crawl (ignoring unfinished runs)");
    } else {
        tracing::info!("Starting crawl (will resume an unfinished run of this config)");
    }

    let report = run_crawl(config, config_hash, fresh, cancel_on_ctrl_c())
        .await
        .context("Crawl failed")?;
    print_crawl_report(&report);

    Ok(match report.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Partial => ExitCode::from(2),
        RunStatus::Interrupted => ExitCode::from(130),
        RunStatus::Running | RunStatus::Failed => ExitCode::FAILURE,
    })
}
