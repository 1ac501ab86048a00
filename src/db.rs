use std::path::Path;

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};

use crate::crawl::{PageLog, ReviewSink};
use crate::review::ReviewRecord;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS targets (
            id          INTEGER PRIMARY KEY,
            company     TEXT NOT NULL,
            location    TEXT,
            employer_id INTEGER,
            url         TEXT UNIQUE NOT NULL,
            visited     BOOLEAN NOT NULL DEFAULT 0,
            visited_at  TEXT,
            last_error  TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_targets_visited ON targets(visited);

        CREATE TABLE IF NOT EXISTS page_log (
            id            INTEGER PRIMARY KEY,
            target_id     INTEGER NOT NULL REFERENCES targets(id),
            page          INTEGER NOT NULL,
            url           TEXT NOT NULL,
            reviews_found INTEGER NOT NULL DEFAULT 0,
            reviews_kept  INTEGER NOT NULL DEFAULT 0,
            failures      INTEGER NOT NULL DEFAULT 0,
            error         TEXT,
            latency_ms    INTEGER,
            fetched_at    TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_page_log_target ON page_log(target_id);

        CREATE TABLE IF NOT EXISTS reviews (
            review_id                        INTEGER PRIMARY KEY,
            target_id                        INTEGER NOT NULL REFERENCES targets(id),
            employer_id                      INTEGER,
            title                            TEXT,
            reviewed_at                      TEXT NOT NULL,
            rating_overall                   INTEGER NOT NULL CHECK(rating_overall BETWEEN 0 AND 5),
            rating_ceo                       TEXT,
            rating_business_outlook          TEXT,
            rating_work_life_balance         INTEGER,
            rating_culture_and_values        INTEGER,
            rating_diversity_and_inclusion   INTEGER,
            rating_senior_leadership         INTEGER,
            rating_recommend_to_friend       TEXT,
            rating_career_opportunities      INTEGER,
            rating_compensation_and_benefits INTEGER,
            is_current_job                   BOOLEAN,
            length_of_employment             INTEGER,
            employment_status                TEXT,
            job_ending_year                  INTEGER,
            pros                             TEXT,
            cons                             TEXT,
            advice                           TEXT,
            count_helpful                    INTEGER,
            count_not_helpful                INTEGER,
            employer_responses               TEXT,
            language_id                      TEXT,
            scraped_at                       TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_reviews_target ON reviews(target_id);
        CREATE INDEX IF NOT EXISTS idx_reviews_date ON reviews(reviewed_at);
        ",
    )?;
    Ok(())
}

// ── Targets ──

pub struct NewTarget {
    pub company: String,
    pub location: Option<String>,
    pub employer_id: Option<u64>,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct Target {
    pub id: i64,
    pub company: String,
    pub location: Option<String>,
    pub url: String,
}

impl Target {
    pub fn label(&self) -> String {
        match &self.location {
            Some(loc) => format!("{} ({})", self.company, loc),
            None => self.company.clone(),
        }
    }
}

pub fn insert_targets(conn: &Connection, targets: &[NewTarget]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO targets (company, location, employer_id, url)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for t in targets {
            count += stmt.execute(rusqlite::params![
                t.company,
                t.location,
                t.employer_id.map(|id| id as i64),
                t.url
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

/// Queue a target by URL, inserting it if new and re-queueing it if already visited.
pub fn upsert_target(conn: &Connection, target: NewTarget) -> Result<Target> {
    insert_targets(conn, std::slice::from_ref(&target))?;
    conn.execute("UPDATE targets SET visited = 0 WHERE url = ?1", [&target.url])?;
    let row = conn.query_row(
        "SELECT id, company, location, url FROM targets WHERE url = ?1",
        [&target.url],
        |row| {
            Ok(Target {
                id: row.get(0)?,
                company: row.get(1)?,
                location: row.get(2)?,
                url: row.get(3)?,
            })
        },
    )?;
    Ok(row)
}

pub fn fetch_pending(
    conn: &Connection,
    company: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<Target>> {
    let sql = format!(
        "SELECT id, company, location, url FROM targets
         WHERE visited = 0 AND (?1 IS NULL OR company = ?1 COLLATE NOCASE)
         ORDER BY id{}",
        match limit {
            Some(n) => format!(" LIMIT {}", n),
            None => String::new(),
        }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([company], |row| {
            Ok(Target {
                id: row.get(0)?,
                company: row.get(1)?,
                location: row.get(2)?,
                url: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn mark_visited(conn: &Connection, target_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE targets SET visited = 1, visited_at = datetime('now'), last_error = NULL WHERE id = ?1",
        [target_id],
    )?;
    Ok(())
}

pub fn record_target_error(conn: &Connection, target_id: i64, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE targets SET last_error = ?2 WHERE id = ?1",
        rusqlite::params![target_id, error],
    )?;
    Ok(())
}

// ── Reviews ──

pub fn save_reviews(conn: &Connection, target_id: i64, reviews: &[ReviewRecord]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO reviews
             (review_id, target_id, employer_id, title, reviewed_at, rating_overall,
              rating_ceo, rating_business_outlook, rating_work_life_balance,
              rating_culture_and_values, rating_diversity_and_inclusion,
              rating_senior_leadership, rating_recommend_to_friend,
              rating_career_opportunities, rating_compensation_and_benefits,
              is_current_job, length_of_employment, employment_status, job_ending_year,
              pros, cons, advice, count_helpful, count_not_helpful,
              employer_responses, language_id)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,
                     ?21,?22,?23,?24,?25,?26)",
        )?;
        for r in reviews {
            let responses = if r.employer_responses.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&r.employer_responses)?)
            };
            count += stmt.execute(rusqlite::params![
                r.review_id as i64,
                target_id,
                r.employer_id.map(|id| id as i64),
                r.title,
                format_timestamp(r),
                r.rating_overall,
                r.rating_ceo.map(|v| v.as_str()),
                r.rating_business_outlook.map(|v| v.as_str()),
                r.rating_work_life_balance,
                r.rating_culture_and_values,
                r.rating_diversity_and_inclusion,
                r.rating_senior_leadership,
                r.rating_recommend_to_friend.map(|v| v.as_str()),
                r.rating_career_opportunities,
                r.rating_compensation_and_benefits,
                r.is_current_job,
                r.length_of_employment,
                r.employment_status.map(|v| v.as_str()),
                r.job_ending_year,
                r.pros,
                r.cons,
                r.advice,
                r.count_helpful,
                r.count_not_helpful,
                responses,
                r.language_id,
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

/// ISO-8601 with millisecond precision so text ordering matches time ordering.
fn format_timestamp(r: &ReviewRecord) -> String {
    r.reviewed_at.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

pub fn log_page(conn: &Connection, target_id: i64, page: &PageLog) -> Result<()> {
    conn.execute(
        "INSERT INTO page_log (target_id, page, url, reviews_found, reviews_kept, failures, error, latency_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            target_id,
            page.page,
            page.url,
            page.reviews_found,
            page.reviews_kept,
            page.failures,
            page.error,
            page.latency_ms,
        ],
    )?;
    Ok(())
}

impl ReviewSink for Connection {
    fn save(&mut self, target: &Target, reviews: &[ReviewRecord]) -> Result<usize> {
        save_reviews(self, target.id, reviews)
    }

    fn log_page(&mut self, target: &Target, page: &PageLog) -> Result<()> {
        log_page(self, target.id, page)
    }
}

/// Newest stored review date for a target, if any.
pub fn latest_review(conn: &Connection, target_id: i64) -> Result<Option<String>> {
    let latest = conn
        .query_row(
            "SELECT MAX(reviewed_at) FROM reviews WHERE target_id = ?1",
            [target_id],
            |r| r.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten();
    Ok(latest)
}

// ── Overview ──

pub struct OverviewRow {
    pub company: String,
    pub location: String,
    pub reviews: i64,
    pub avg_overall: Option<f64>,
    pub newest: String,
    pub oldest: String,
}

pub fn fetch_overview(conn: &Connection, company: Option<&str>, limit: usize) -> Result<Vec<OverviewRow>> {
    let sql = format!(
        "SELECT t.company, COALESCE(t.location, ''), COUNT(r.review_id), AVG(r.rating_overall),
                COALESCE(MAX(r.reviewed_at), ''), COALESCE(MIN(r.reviewed_at), '')
         FROM targets t
         LEFT JOIN reviews r ON r.target_id = t.id
         WHERE ?1 IS NULL OR t.company = ?1 COLLATE NOCASE
         GROUP BY t.id
         ORDER BY COUNT(r.review_id) DESC, t.company
         LIMIT {}",
        limit
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([company], |row| {
            Ok(OverviewRow {
                company: row.get(0)?,
                location: row.get(1)?,
                reviews: row.get(2)?,
                avg_overall: row.get(3)?,
                newest: row.get(4)?,
                oldest: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub targets: usize,
    pub visited: usize,
    pub pending: usize,
    pub failed: usize,
    pub pages: usize,
    pub page_errors: usize,
    pub reviews: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let targets: usize = conn.query_row("SELECT COUNT(*) FROM targets", [], |r| r.get(0))?;
    let visited: usize =
        conn.query_row("SELECT COUNT(*) FROM targets WHERE visited = 1", [], |r| r.get(0))?;
    let failed: usize = conn.query_row(
        "SELECT COUNT(*) FROM targets WHERE visited = 0 AND last_error IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    let pages: usize = conn.query_row("SELECT COUNT(*) FROM page_log", [], |r| r.get(0))?;
    let page_errors: usize = conn.query_row(
        "SELECT COUNT(*) FROM page_log WHERE error IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    let reviews: usize = conn.query_row("SELECT COUNT(*) FROM reviews", [], |r| r.get(0))?;
    Ok(Stats {
        targets,
        visited,
        pending: targets - visited,
        failed,
        pages,
        page_errors,
        reviews,
    })
}
