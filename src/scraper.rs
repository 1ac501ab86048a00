use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::settings::{Credentials, Settings};

const BASE_BACKOFF_MS: u64 = 2000;

/// Anything that can hand back the text of a listing page.
#[allow(async_fn_in_trait)]
pub trait PageSource {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Plain HTTP page source carrying the session cookie and user-agent.
pub struct HttpSource {
    client: reqwest::Client,
    max_retries: u32,
    base_backoff: Duration,
}

impl HttpSource {
    pub fn new(credentials: &Credentials, settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .default_headers(build_headers(credentials, settings)?)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            max_retries: settings.max_retries,
            base_backoff: Duration::from_millis(BASE_BACKOFF_MS),
        })
    }

    async fn fetch_once(&self, url: &str) -> reqwest::Result<(StatusCode, String)> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }
}

impl PageSource for HttpSource {
    async fn fetch(&self, url: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            let start = Instant::now();
            let problem = match self.fetch_once(url).await {
                Ok((status, body)) => {
                    debug!(
                        "GET {} -> {} ({} bytes, {}ms)",
                        url,
                        status.as_u16(),
                        body.len(),
                        start.elapsed().as_millis()
                    );
                    if status.is_success() {
                        return Ok(body);
                    }
                    if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
                        bail!(
                            "{} returned HTTP {}; the session cookie was probably rejected",
                            url,
                            status.as_u16()
                        );
                    }
                    if !is_retryable(status) || attempt == self.max_retries {
                        bail!("{} returned HTTP {}", url, status.as_u16());
                    }
                    format!("HTTP {}", status.as_u16())
                }
                Err(e) if is_transient(&e) && attempt < self.max_retries => e.to_string(),
                Err(e) => return Err(e).with_context(|| format!("Request to {} failed", url)),
            };

            let backoff = self.base_backoff * 2u32.pow(attempt);
            warn!(
                "{} on {} (attempt {}/{}), backing off {:.1}s",
                problem,
                url,
                attempt + 1,
                self.max_retries,
                backoff.as_secs_f64()
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
    )
}

/// Dropped connections, timeouts and truncated bodies are worth another try.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
}

fn build_headers(credentials: &Credentials, settings: &Settings) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::COOKIE,
        HeaderValue::from_str(&credentials.cookie).context("Session cookie is not a valid header value")?,
    );
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_str(&credentials.user_agent).context("User-agent is not a valid header value")?,
    );
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_str(&settings.accept_language).context("Invalid accept_language")?,
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    if let Some(referer) = &settings.referer {
        headers.insert(
            header::REFERER,
            HeaderValue::from_str(referer).context("Invalid referer")?,
        );
    }
    Ok(headers)
}

/// Fetch a single page and write it to `out` (for fixtures and offline parsing).
pub async fn save_page(source: &impl PageSource, url: &str, out: &std::path::Path) -> Result<usize> {
    let body = source.fetch(url).await?;
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(out, &body).with_context(|| format!("Failed to write {}", out.display()))?;
    Ok(body.len())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn credentials() -> Credentials {
        Credentials::parse("gdId=abc; JSESSIONID=xyz\nMozilla/5.0 (Macintosh)").unwrap()
    }

    #[test]
    fn headers_carry_credentials_verbatim() {
        let headers = build_headers(&credentials(), &Settings::default()).unwrap();
        assert_eq!(headers[header::COOKIE], "gdId=abc; JSESSIONID=xyz");
        assert_eq!(headers[header::USER_AGENT], "Mozilla/5.0 (Macintosh)");
        assert_eq!(headers[header::REFERER], "https://www.glassdoor.com/");
        assert!(!headers.keys().any(|k| k.as_str().starts_with("sec-")));
    }

    #[test]
    fn no_referer_when_unset() {
        let settings = Settings {
            referer: None,
            ..Settings::default()
        };
        let headers = build_headers(&credentials(), &settings).unwrap();
        assert!(!headers.contains_key(header::REFERER));
    }

    #[test]
    fn cookie_with_newline_is_rejected() {
        let creds = Credentials {
            cookie: "a=1\nb=2".into(),
            user_agent: "agent".into(),
        };
        assert!(build_headers(&creds, &Settings::default()).is_err());
    }

    #[test]
    fn retry_policy() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
        assert!(!is_retryable(StatusCode::FORBIDDEN));
    }

    struct Canned(&'static str);

    impl PageSource for Canned {
        async fn fetch(&self, _url: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn save_page_writes_body() {
        let dir = std::env::temp_dir().join(format!("review_scraper_save_{}", std::process::id()));
        let out = dir.join("nested/page.html");
        let n = save_page(&Canned("<html>ok</html>"), "https://x/y.htm", &out).await.unwrap();
        assert_eq!(n, 15);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "<html>ok</html>");
        std::fs::remove_dir_all(&dir).ok();
    }

    fn reply(status: &str, body: &str) -> Option<String> {
        Some(format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        ))
    }

    /// Serve one scripted reply per connection; `None` hangs up without answering.
    async fn serve(replies: Vec<Option<String>>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            for reply in replies {
                let (mut stream, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                if let Some(raw) = reply {
                    stream.write_all(raw.as_bytes()).await.unwrap();
                    stream.shutdown().await.ok();
                }
            }
        });
        (format!("http://{}/Reviews/Deloitte-Reviews-E2763_P1.htm", addr), hits)
    }

    fn local_source(max_retries: u32) -> HttpSource {
        HttpSource {
            client: reqwest::Client::new(),
            max_retries,
            base_backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn retries_after_server_error() {
        let (url, hits) = serve(vec![reply("503 Service Unavailable", "busy"), reply("200 OK", "page")]).await;
        let body = local_source(3).fetch(&url).await.unwrap();
        assert_eq!(body, "page");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_after_dropped_connection() {
        let (url, hits) = serve(vec![None, reply("200 OK", "page")]).await;
        let body = local_source(3).fetch(&url).await.unwrap();
        assert_eq!(body, "page");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn forbidden_fails_without_retry() {
        let (url, hits) = serve(vec![reply("403 Forbidden", "no"), reply("200 OK", "page")]).await;
        let err = local_source(3).fetch(&url).await.unwrap_err();
        assert!(err.to_string().contains("cookie"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let busy = || reply("503 Service Unavailable", "busy");
        let (url, hits) = serve(vec![busy(), busy(), busy(), reply("200 OK", "page")]).await;
        let err = local_source(2).fetch(&url).await.unwrap_err();
        assert!(err.to_string().contains("HTTP 503"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let (url, hits) = serve(vec![reply("404 Not Found", ""), reply("200 OK", "page")]).await;
        assert!(local_source(3).fetch(&url).await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
