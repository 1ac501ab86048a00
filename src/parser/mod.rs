pub mod fields;

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::review::ReviewRecord;
pub use fields::{extract_review, ExtractError};

// TODO: pages served as React Server Component payloads embed the same objects
// with `\"`-escaped quotes; unescape those before matching.
static REVIEW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)\{"__typename":"EmployerReview".+?"translationMethod":.+?\}"#).unwrap()
});

const REVIEW_MARKER: &str = r#""__typename":"EmployerReview""#;

pub struct PageExtract {
    pub blobs: usize,
    pub records: Vec<ReviewRecord>,
    pub failures: Vec<ExtractError>,
}

/// Every embedded `EmployerReview` object on a page, in page order.
pub fn find_reviews(page: &str) -> Vec<&str> {
    REVIEW_RE.find_iter(page).map(|m| m.as_str()).collect()
}

/// Two-pass pipeline: page text → review blobs → records.
pub fn extract_page(page: &str) -> PageExtract {
    let blobs = find_reviews(page);
    let mut records = Vec::with_capacity(blobs.len());
    let mut failures = Vec::new();

    for blob in &blobs {
        // A review without a translationMethod key makes the match run on into the next one
        if blob.matches(REVIEW_MARKER).count() > 1 {
            warn!("Review blob spans several reviews; only the first is kept");
        }
        match extract_review(blob) {
            Ok(record) => records.push(record),
            Err(e) => failures.push(e),
        }
    }

    PageExtract {
        blobs: blobs.len(),
        records,
        failures,
    }
}
