mod config;
mod error;
mod fetch;
mod parser;
mod scrape;
mod store;

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{Settings, DEFAULT_LOG_FILE};
use crate::store::{Dataset, RunState};

#[derive(Parser)]
#[command(
    name = "aym_scraper",
    about = "Constitutional Court decision scraper (kararlarbilgibankasi.anayasa.gov.tr)"
)]
struct Cli {
    /// Settings file (default: ./scraper.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape listing pages, resuming where the last run stopped
    Run {
        /// Last listing page to visit
        #[arg(short = 'n', long)]
        pages: Option<u32>,
        /// Max listing pages in flight
        #[arg(short, long)]
        concurrency: Option<usize>,
        /// Skip TLS certificate verification
        #[arg(long)]
        insecure: bool,
    },
    /// Show dataset and resume statistics
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = execute(cli).await;

    let code = match &result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Unexpected error during scraping: {:#}", e);
            ExitCode::FAILURE
        }
    };
    println!("Finished in {}", format_duration(t0.elapsed()));
    code
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            // no settings means no configured log path yet
            init_tracing(Path::new(DEFAULT_LOG_FILE));
            return Err(e);
        }
    };
    init_tracing(&settings.log_file);

    match cli.command {
        Commands::Run { .. } => run(settings).await,
        Commands::Stats => {
            print_stats(&settings);
            Ok(())
        }
    }
}

/// Layered settings with the `run` flags applied on top.
fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings =
        Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    if let Commands::Run {
        pages,
        concurrency,
        insecure,
    } = cli.command
    {
        if let Some(n) = pages {
            settings.total_pages = n;
        }
        if let Some(c) = concurrency {
            settings.concurrency = c;
        }
        settings.accept_invalid_certs |= insecure;
    }
    Ok(settings)
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    settings.validate()?;
    let fetcher =
        fetch::HttpFetcher::from_settings(&settings).context("Failed to build HTTP client")?;
    let data_file = settings.data_file.clone();

    let summary = scrape::run(settings, fetcher).await?;
    println!("Resumed from page {}.", summary.resume_page);
    println!(
        "Scraping complete: {} new decisions ({} skipped, {} failed) over {} pages in {}.",
        summary.scraped,
        summary.skipped,
        summary.failed,
        summary.pages,
        format_duration(summary.elapsed)
    );
    if summary.pages_incomplete > 0 {
        println!(
            "{} pages were incomplete and will be retried next run.",
            summary.pages_incomplete
        );
    }
    println!(
        "Data saved: {} records in {}",
        summary.store.total_records,
        data_file.display()
    );
    Ok(())
}

fn print_stats(settings: &Settings) {
    let dataset = Dataset::load(&settings.data_file);
    let state = RunState::load(&settings.state_file);
    let plan = scrape::plan_pages(
        dataset.len(),
        &state,
        settings.total_pages,
        settings.page_size,
    );
    let empty_text = dataset
        .records
        .iter()
        .filter(|r| r.full_text.is_empty())
        .count();

    println!("Records:         {}", dataset.len());
    println!("Empty text:      {}", empty_text);
    println!("Completed pages: {}", state.completed_pages.len());
    println!(
        "Resume page:     {} (record-count estimate: {})",
        plan.resume_page,
        store::resume_page(dataset.len(), settings.page_size)
    );
    println!("Pages remaining: {} of {}", plan.pages.len(), settings.total_pages);

    let outcomes = dataset.outcome_counts();
    if !outcomes.is_empty() {
        println!("\n--- Review outcomes ---");
        for (result, count) in &outcomes {
            let label = if result.is_empty() { "(blank)" } else { result.as_str() };
            println!("  {:>6}  {}", count, label);
        }
    }
}

/// Console gets everything the env filter allows; the log file only ERROR.
fn init_tracing(log_file: &Path) {
    let console = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    );

    let _ = tracing_subscriber::registry()
        .with(console)
        .with(error_file_layer(log_file))
        .try_init();
}

/// Timestamped, non-ANSI ERROR lines appended to `path`. `None` if the
/// file cannot be opened; logging then goes to the console only.
fn error_file_layer<S>(path: &Path) -> Option<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    open_log_file(path).map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_filter(LevelFilter::ERROR)
    })
}

fn open_log_file(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = fs::create_dir_all(parent) {
            eprintln!("log_file_error: {}: {}", parent.display(), e);
            return None;
        }
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => Some(f),
        Err(e) => {
            eprintln!("log_file_error: {}: {}", path.display(), e);
            None
        }
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.2}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
