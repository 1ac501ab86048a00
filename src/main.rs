mod crawl;
mod db;
mod export;
mod listing;
mod parser;
mod review;
mod scraper;
mod settings;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use crawl::{CrawlOptions, Pacing, StopReason};
use settings::{Credentials, Settings};

#[derive(Parser)]
#[command(name = "review_scraper", about = "Employer review scraper for paginated review listings")]
struct Cli {
    /// Settings file (default: ./review_scraper.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the targets listed in the settings file into the queue
    Init,
    /// Queue one review listing
    Add {
        /// Company name
        company: String,
        /// Review listing URL (any page, any filter)
        url: String,
        /// Location label for this listing
        #[arg(short, long)]
        location: Option<String>,
        /// Filter fragment to apply instead of the configured one
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Crawl queued listings (or one --url) until the cutoff date
    Scrape {
        /// Only crawl this listing URL (queued on the fly)
        #[arg(long)]
        url: Option<String>,
        /// Only crawl targets of this company
        #[arg(long)]
        company: Option<String>,
        /// Stop once reviews are dated on or before this day (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        since: Option<NaiveDate>,
        /// Max listing pages per target
        #[arg(long)]
        max_pages: Option<u32>,
        /// Max targets to crawl (default: all pending)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Fetch a single page and save it to disk
    Fetch {
        url: String,
        #[arg(short, long, default_value = "page.html")]
        out: PathBuf,
    },
    /// Extract reviews from saved pages and print them as JSON lines
    Parse {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Write stored reviews to CSV
    Export {
        #[arg(short, long, default_value = "data/reviews.csv")]
        out: PathBuf,
        /// Only this company
        #[arg(long)]
        company: Option<String>,
    },
    /// Show scraping statistics
    Stats,
    /// Per-listing review counts
    Overview {
        #[arg(long)]
        company: Option<String>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    let t0 = Instant::now();
    let settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Init => {
            let conn = open_db(&settings)?;
            let targets = settings
                .targets
                .iter()
                .map(|t| new_target(&t.company, t.location.clone(), &t.url, &settings.filter))
                .collect::<Result<Vec<_>>>()?;
            if targets.is_empty() {
                println!("No targets in settings. Add [[targets]] entries or use 'add'.");
                return Ok(());
            }
            let inserted = db::insert_targets(&conn, &targets)?;
            println!("Queued {} new listings ({} configured)", inserted, targets.len());
            Ok(())
        }
        Commands::Add {
            company,
            url,
            location,
            filter,
        } => {
            let conn = open_db(&settings)?;
            let filter = filter.as_deref().unwrap_or(&settings.filter);
            let target = db::upsert_target(&conn, new_target(&company, location, &url, filter)?)?;
            println!("Queued #{} {} -> {}", target.id, target.label(), target.url);
            Ok(())
        }
        Commands::Scrape {
            url,
            company,
            since,
            max_pages,
            limit,
        } => {
            let mut conn = open_db(&settings)?;
            let targets = match url {
                Some(url) => {
                    let name = company.clone().unwrap_or_else(|| "adhoc".to_string());
                    vec![db::upsert_target(&conn, new_target(&name, None, &url, &settings.filter)?)?]
                }
                None => db::fetch_pending(&conn, company.as_deref(), limit)?,
            };
            if targets.is_empty() {
                println!("No pending listings. Run 'init' or 'add' first.");
                return Ok(());
            }

            let credentials = Credentials::load(&settings.credentials_path)?;
            let source = scraper::HttpSource::new(&credentials, &settings)?;
            let opts = CrawlOptions {
                cutoff: since,
                max_pages,
                flush_every: settings.flush_every,
                pacing: Pacing::from_settings(&settings),
            };
            scrape_targets(&source, &mut conn, &targets, &opts).await
        }
        Commands::Fetch { url, out } => {
            let credentials = Credentials::load(&settings.credentials_path)?;
            let source = scraper::HttpSource::new(&credentials, &settings)?;
            let bytes = scraper::save_page(&source, &url, &out).await?;
            let found = parser::find_reviews(&std::fs::read_to_string(&out)?).len();
            println!("Saved {} bytes to {} ({} reviews embedded)", bytes, out.display(), found);
            Ok(())
        }
        Commands::Parse { files } => parse_files(&files),
        Commands::Export { out, company } => {
            let conn = open_db(&settings)?;
            if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::File::create(&out)
                .with_context(|| format!("Failed to create {}", out.display()))?;
            let rows = export::write_csv(&conn, company.as_deref(), std::io::BufWriter::new(file))?;
            println!("Wrote {} reviews to {}", rows, out.display());
            Ok(())
        }
        Commands::Overview { company, limit } => {
            let conn = open_db(&settings)?;
            let rows = db::fetch_overview(&conn, company.as_deref(), limit)?;
            if rows.is_empty() {
                println!("No listings found.");
                return Ok(());
            }

            println!(
                "{:>3} | {:<20} | {:<14} | {:>7} | {:>4} | {:<10} | {:<10}",
                "#", "Company", "Location", "Reviews", "Avg", "Newest", "Oldest"
            );
            println!("{}", "-".repeat(84));
            for (i, r) in rows.iter().enumerate() {
                let avg = r
                    .avg_overall
                    .map(|a| format!("{:.2}", a))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:>3} | {:<20} | {:<14} | {:>7} | {:>4} | {:<10} | {:<10}",
                    i + 1,
                    truncate(&r.company, 20),
                    truncate(&r.location, 14),
                    r.reviews,
                    avg,
                    day(&r.newest),
                    day(&r.oldest),
                );
            }
            println!("\n{} listings", rows.len());
            Ok(())
        }
        Commands::Stats => {
            let conn = open_db(&settings)?;
            let s = db::get_stats(&conn)?;
            println!("Listings:    {}", s.targets);
            println!("Visited:     {}", s.visited);
            println!("Pending:     {}", s.pending);
            println!("Failed:      {}", s.failed);
            println!("Pages:       {}", s.pages);
            println!("Page errors: {}", s.page_errors);
            println!("Reviews:     {}", s.reviews);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_db(settings: &Settings) -> Result<rusqlite::Connection> {
    let conn = db::connect(&settings.db_path)
        .with_context(|| format!("Failed to open database {}", settings.db_path.display()))?;
    db::init_schema(&conn)?;
    Ok(conn)
}

fn new_target(company: &str, location: Option<String>, url: &str, filter: &str) -> Result<db::NewTarget> {
    let filtered = listing::with_filter(url, filter)?;
    info!("Listing for {} is {}", company, filtered);
    Ok(db::NewTarget {
        company: company.to_string(),
        location,
        employer_id: listing::employer_id(url),
        url: filtered,
    })
}

async fn scrape_targets(
    source: &scraper::HttpSource,
    conn: &mut rusqlite::Connection,
    targets: &[db::Target],
    opts: &CrawlOptions,
) -> Result<()> {
    use indicatif::{ProgressBar, ProgressStyle};

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {pos} pages | {msg}")?,
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(200));

    let (mut reviews, mut failed) = (0usize, 0usize);
    for target in targets {
        if let Some(latest) = db::latest_review(conn, target.id)? {
            match stored_overlap(opts.cutoff, &latest) {
                Some(newest) if opts.cutoff.is_none() => warn!(
                    "{} already has reviews up to {}; without --since the whole listing is crawled again",
                    target.label(),
                    newest
                ),
                Some(newest) => info!(
                    "{} already has reviews up to {}; pages before that are fetched again",
                    target.label(),
                    newest
                ),
                None => {}
            }
        }
        let stats = crawl::crawl_target(source, conn, target, opts, Some(&pb)).await?;
        reviews += stats.saved;
        match &stats.stop {
            StopReason::Failed(e) => {
                failed += 1;
                error!("{} failed: {}", target.label(), e);
                db::record_target_error(conn, target.id, e)?;
            }
            _ => db::mark_visited(conn, target.id)?,
        }
        if stats.failures > 0 {
            warn!("{}: {} reviews could not be parsed", target.label(), stats.failures);
        }
    }

    pb.finish_and_clear();
    println!(
        "Crawled {} listings ({} failed), {} new reviews saved.",
        targets.len(),
        failed,
        reviews
    );
    Ok(())
}

fn parse_files(files: &[PathBuf]) -> Result<()> {
    use rayon::prelude::*;

    let results: Vec<_> = files
        .par_iter()
        .map(|path| -> Result<parser::PageExtract> {
            let page = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(parser::extract_page(&page))
        })
        .collect();

    let (mut records, mut failures) = (0usize, 0usize);
    for (path, result) in files.iter().zip(results) {
        let extract = result?;
        for e in &extract.failures {
            warn!("{}: {}", path.display(), e);
        }
        failures += extract.failures.len();
        for record in &extract.records {
            println!("{}", serde_json::to_string(record)?);
        }
        records += extract.records.len();
    }
    info!("Parsed {} reviews from {} files ({} failed)", records, files.len(), failures);
    Ok(())
}

/// Newest stored review day, if the crawl would reach back past it.
fn stored_overlap(cutoff: Option<NaiveDate>, latest: &str) -> Option<NaiveDate> {
    let newest = NaiveDate::parse_from_str(day(latest), "%Y-%m-%d").ok()?;
    match cutoff {
        Some(cutoff) if cutoff >= newest => None,
        _ => Some(newest),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

/// Date part of a stored `YYYY-MM-DDTHH:MM:SS` timestamp.
fn day(ts: &str) -> &str {
    ts.split('T').next().unwrap_or(ts)
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
