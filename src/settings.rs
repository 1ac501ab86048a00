use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "review_scraper.toml";
pub const DEFAULT_FILTER: &str = "?sort.sortType=RD&sort.ascending=false&filter.iso3Language=eng&filter.employmentStatus=REGULAR&filter.employmentStatus=PART_TIME&filter.employmentStatus=INTERN";

/// Session cookie and user-agent, used verbatim as request headers.
#[derive(Clone)]
pub struct Credentials {
    pub cookie: String,
    pub user_agent: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("cookie", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl Credentials {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid credentials file {}", path.display()))
    }

    /// First line: cookie. Second line: user-agent.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(|l| l.trim_end_matches('\r'));
        let cookie = lines.next().unwrap_or("").trim();
        let user_agent = lines.next().unwrap_or("").trim();
        if cookie.is_empty() {
            bail!("line 1 (session cookie) is missing or blank");
        }
        if user_agent.is_empty() {
            bail!("line 2 (user-agent) is missing or blank");
        }
        Ok(Self {
            cookie: cookie.to_string(),
            user_agent: user_agent.to_string(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetSpec {
    pub company: String,
    #[serde(default)]
    pub location: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: PathBuf,
    pub credentials_path: PathBuf,
    pub filter: String,
    /// Mean pause between listing pages.
    pub delay_secs: f64,
    pub jitter_secs: f64,
    /// Flush buffered reviews every this many pages, then cool down.
    pub flush_every: u32,
    pub cooldown_min_secs: f64,
    pub cooldown_max_secs: f64,
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    pub accept_language: String,
    pub referer: Option<String>,
    pub targets: Vec<TargetSpec>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/reviews.sqlite"),
            credentials_path: PathBuf::from("credentials.txt"),
            filter: DEFAULT_FILTER.to_string(),
            delay_secs: 6.0,
            jitter_secs: 1.0,
            flush_every: 100,
            cooldown_min_secs: 90.0,
            cooldown_max_secs: 110.0,
            max_retries: 3,
            request_timeout_secs: 30,
            accept_language: "en-US,en;q=0.9".to_string(),
            referer: Some("https://www.glassdoor.com/".to_string()),
            targets: Vec::new(),
        }
    }
}

impl Settings {
    /// Defaults, overridden by the config file (if present), overridden by `REVIEWS_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from(file.as_path()).required(required))
            .add_source(config::Environment::with_prefix("REVIEWS").try_parsing(true))
            .build()
            .with_context(|| format!("Failed to load settings from {}", file.display()))?
            .try_deserialize()
            .context("Invalid settings")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.delay_secs < 0.0 || self.jitter_secs < 0.0 {
            bail!("delay_secs and jitter_secs must not be negative");
        }
        if self.cooldown_min_secs < 0.0 || self.cooldown_min_secs > self.cooldown_max_secs {
            bail!(
                "cooldown range {}..{} is invalid",
                self.cooldown_min_secs,
                self.cooldown_max_secs
            );
        }
        if self.flush_every == 0 {
            bail!("flush_every must be at least 1");
        }
        Ok(())
    }
}
