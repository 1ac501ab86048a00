use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::NaiveDate;
use indicatif::ProgressBar;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::db::Target;
use crate::listing;
use crate::parser;
use crate::review::ReviewRecord;
use crate::scraper::PageSource;
use crate::settings::Settings;

/// Consecutive pages whose reviews all fail to parse before giving up on a target.
const MAX_BARREN_PAGES: u32 = 3;

/// One fetched listing page, as recorded in the page log.
#[derive(Debug, Clone, Default)]
pub struct PageLog {
    pub page: u32,
    pub url: String,
    pub reviews_found: u32,
    pub reviews_kept: u32,
    pub failures: u32,
    pub error: Option<String>,
    pub latency_ms: Option<i64>,
}

/// Where crawled reviews and page logs go.
pub trait ReviewSink {
    /// Persist a batch, returning how many were new.
    fn save(&mut self, target: &Target, reviews: &[ReviewRecord]) -> Result<usize>;
    fn log_page(&mut self, target: &Target, page: &PageLog) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub delay_secs: f64,
    pub jitter_secs: f64,
    pub cooldown_min_secs: f64,
    pub cooldown_max_secs: f64,
}

impl Pacing {
    pub fn none() -> Self {
        Self {
            delay_secs: 0.0,
            jitter_secs: 0.0,
            cooldown_min_secs: 0.0,
            cooldown_max_secs: 0.0,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            delay_secs: settings.delay_secs,
            jitter_secs: settings.jitter_secs,
            cooldown_min_secs: settings.cooldown_min_secs,
            cooldown_max_secs: settings.cooldown_max_secs,
        }
    }

    fn between_pages(&self) -> Duration {
        uniform_secs(self.delay_secs - self.jitter_secs, self.delay_secs + self.jitter_secs)
    }

    fn cooldown(&self) -> Duration {
        uniform_secs(self.cooldown_min_secs, self.cooldown_max_secs)
    }
}

fn uniform_secs(lo: f64, hi: f64) -> Duration {
    let lo = lo.max(0.0);
    let hi = hi.max(lo);
    let secs = if hi > lo {
        rand::rng().random_range(lo..=hi)
    } else {
        lo
    };
    Duration::from_secs_f64(secs)
}

pub struct CrawlOptions {
    /// Reviews dated on or before this day are dropped, and reaching one ends the crawl.
    pub cutoff: Option<NaiveDate>,
    pub max_pages: Option<u32>,
    pub flush_every: u32,
    pub pacing: Pacing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    ReachedCutoff,
    Exhausted,
    PageLimit,
    Failed(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::ReachedCutoff => write!(f, "reached cutoff date"),
            StopReason::Exhausted => write!(f, "no more reviews"),
            StopReason::PageLimit => write!(f, "page limit"),
            StopReason::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

#[derive(Debug)]
pub struct CrawlStats {
    pub pages: u32,
    pub found: usize,
    pub kept: usize,
    pub saved: usize,
    pub failures: usize,
    pub stop: StopReason,
}

/// Walk a target's listing pages from page 1 until a stop condition.
///
/// Only sink errors are returned as `Err`. A page that cannot be fetched, or a
/// first page without any reviews, ends the crawl with `StopReason::Failed`
/// after flushing what was collected.
pub async fn crawl_target<S: PageSource, K: ReviewSink>(
    source: &S,
    sink: &mut K,
    target: &Target,
    opts: &CrawlOptions,
    progress: Option<&ProgressBar>,
) -> Result<CrawlStats> {
    if opts.cutoff.is_some() && !listing::sorted_by_recent(&target.url) {
        warn!(
            "{} is not sorted by most recent; the cutoff may stop too early or too late",
            target.url
        );
    }

    let flush_every = opts.flush_every.max(1);
    let mut seen: HashSet<u64> = HashSet::new();
    let mut buffer: Vec<ReviewRecord> = Vec::new();
    let mut stats = CrawlStats {
        pages: 0,
        found: 0,
        kept: 0,
        saved: 0,
        failures: 0,
        stop: StopReason::Exhausted,
    };
    let mut barren = 0u32;
    let mut page = 1u32;

    let stop = loop {
        let url = listing::page_url(&target.url, page)?;
        let start = Instant::now();
        let body = match source.fetch(&url).await {
            Ok(body) => body,
            Err(e) => {
                let msg = format!("{:#}", e);
                warn!("Giving up on {} at page {}: {}", target.label(), page, msg);
                sink.log_page(
                    target,
                    &PageLog {
                        page,
                        url,
                        error: Some(msg.clone()),
                        latency_ms: Some(start.elapsed().as_millis() as i64),
                        ..PageLog::default()
                    },
                )?;
                break StopReason::Failed(msg);
            }
        };
        let latency_ms = start.elapsed().as_millis() as i64;

        let extract = parser::extract_page(&body);
        for e in &extract.failures {
            warn!("Skipping review on {}: {}", url, e);
        }
        let parsed = extract.records.len();
        let fresh: Vec<ReviewRecord> = extract
            .records
            .into_iter()
            .filter(|r| seen.insert(r.review_id))
            .collect();
        let fresh_count = fresh.len();
        // Listing order is not guaranteed chronological, so look at every record
        let oldest = fresh.iter().map(|r| r.reviewed_at.date()).min();
        let kept: Vec<ReviewRecord> = match opts.cutoff {
            Some(cutoff) => fresh
                .into_iter()
                .filter(|r| r.reviewed_at.date() > cutoff)
                .collect(),
            None => fresh,
        };

        stats.pages = page;
        stats.found += extract.blobs;
        stats.failures += extract.failures.len();
        stats.kept += kept.len();
        sink.log_page(
            target,
            &PageLog {
                page,
                url: url.clone(),
                reviews_found: extract.blobs as u32,
                reviews_kept: kept.len() as u32,
                failures: extract.failures.len() as u32,
                error: None,
                latency_ms: Some(latency_ms),
            },
        )?;
        debug!(
            "{}: {} found, {} new, {} kept, oldest {:?}",
            url,
            extract.blobs,
            fresh_count,
            kept.len(),
            oldest
        );
        if let Some(pb) = progress {
            pb.set_message(format!("{} p{} ({} reviews)", target.label(), page, stats.kept));
            pb.inc(1);
        }
        buffer.extend(kept);

        if extract.blobs == 0 {
            if page == 1 {
                // A challenge page or a filter matching nothing, not a finished listing
                break StopReason::Failed(format!("no reviews on first page {}", url));
            }
            break StopReason::Exhausted;
        }
        if parsed > 0 && fresh_count == 0 {
            // Past the last page the site serves the last page again
            break StopReason::Exhausted;
        }
        barren = if parsed == 0 { barren + 1 } else { 0 };
        if barren >= MAX_BARREN_PAGES {
            break StopReason::Exhausted;
        }
        if let (Some(cutoff), Some(oldest)) = (opts.cutoff, oldest) {
            if oldest <= cutoff {
                break StopReason::ReachedCutoff;
            }
        }
        if opts.max_pages.is_some_and(|max| page >= max) {
            break StopReason::PageLimit;
        }

        if page % flush_every == 0 {
            stats.saved += flush(sink, target, &mut buffer)?;
            let pause = opts.pacing.cooldown();
            info!("Cooling down {:.0}s after {} pages", pause.as_secs_f64(), page);
            tokio::time::sleep(pause).await;
        } else {
            let pause = opts.pacing.between_pages();
            tokio::time::sleep(pause).await;
        }
        page += 1;
    };

    stats.saved += flush(sink, target, &mut buffer)?;
    stats.stop = stop;
    info!(
        "{}: {} pages, {} reviews kept ({} new), stopped: {}",
        target.label(),
        stats.pages,
        stats.kept,
        stats.saved,
        stats.stop
    );
    Ok(stats)
}

fn flush<K: ReviewSink>(sink: &mut K, target: &Target, buffer: &mut Vec<ReviewRecord>) -> Result<usize> {
    if buffer.is_empty() {
        return Ok(0);
    }
    let saved = sink.save(target, buffer)?;
    debug!("Flushed {} reviews for {} ({} new)", buffer.len(), target.label(), saved);
    buffer.clear();
    Ok(saved)
}
