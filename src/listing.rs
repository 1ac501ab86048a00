use std::sync::LazyLock;

use regex::Regex;

static PAGE_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_P\d+$").unwrap());
static EMPLOYER_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-E(?:I_IE)?(\d+)[._]").unwrap());

const HTM: &str = ".htm";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListingError {
    #[error("not a review listing URL (no `.htm` page): {0}")]
    NotAListing(String),
}

/// Split a listing URL into (path stem without `.htm`, query including `?`).
fn split(url: &str) -> Result<(&str, &str), ListingError> {
    let path_end = url.find('?').unwrap_or(url.len());
    let stem_end = url[..path_end]
        .rfind(HTM)
        .filter(|&i| i + HTM.len() == path_end)
        .ok_or_else(|| ListingError::NotAListing(url.to_string()))?;
    Ok((&url[..stem_end], &url[path_end..]))
}

/// Listing URL with no query string and no `_P<n>` page suffix.
///
/// `https://www.glassdoor.com/Reviews/Deloitte-Reviews-E2763_P4.htm?filter.x=1`
/// becomes `https://www.glassdoor.com/Reviews/Deloitte-Reviews-E2763.htm`.
pub fn listing_base(url: &str) -> Result<String, ListingError> {
    let (stem, _) = split(url.trim())?;
    Ok(format!("{}{}", PAGE_SUFFIX_RE.replace(stem, ""), HTM))
}

/// Replace whatever filter a listing URL carries with `fragment`.
pub fn with_filter(url: &str, fragment: &str) -> Result<String, ListingError> {
    let base = listing_base(url)?;
    let fragment = fragment.trim();
    Ok(match fragment {
        "" | "?" => base,
        f if f.starts_with('?') => format!("{}{}", base, f),
        f => format!("{}?{}", base, f.trim_start_matches('&')),
    })
}

/// URL of listing page `page` (1-based), keeping the query string.
pub fn page_url(url: &str, page: u32) -> Result<String, ListingError> {
    let (stem, query) = split(url.trim())?;
    let stem = PAGE_SUFFIX_RE.replace(stem, "");
    Ok(format!("{}_P{}{}{}", stem, page, HTM, query))
}

/// Employer id encoded in the listing path (`-E2763.htm`, or `-EI_IE2763.0,8_IL…` for
/// location-scoped listings).
pub fn employer_id(url: &str) -> Option<u64> {
    EMPLOYER_ID_RE
        .captures(url)
        .and_then(|c| c[1].parse().ok())
}

/// Whether the listing asks for most-recent-first ordering.
pub fn sorted_by_recent(url: &str) -> bool {
    url.contains("sort.sortType=RD")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELOITTE: &str = "https://www.glassdoor.com/Reviews/Deloitte-Reviews-E2763.htm";
    const FILTER: &str = "?sort.sortType=RD&sort.ascending=false&filter.iso3Language=eng";

    #[test]
    fn base_strips_query_and_page() {
        let url = "https://www.glassdoor.com/Reviews/Deloitte-Belgium-Reviews-EI_IE2763.0,8_IL.9,16_IN25_P12.htm?filter.iso3Language=fra";
        assert_eq!(
            listing_base(url).unwrap(),
            "https://www.glassdoor.com/Reviews/Deloitte-Belgium-Reviews-EI_IE2763.0,8_IL.9,16_IN25.htm"
        );
    }

    #[test]
    fn filter_replaces_existing_query() {
        let url = format!("{}?filter.employmentStatus=INTERN", DELOITTE);
        assert_eq!(with_filter(&url, FILTER).unwrap(), format!("{}{}", DELOITTE, FILTER));
    }

    #[test]
    fn filter_without_question_mark() {
        assert_eq!(
            with_filter(DELOITTE, "filter.iso3Language=eng").unwrap(),
            format!("{}?filter.iso3Language=eng", DELOITTE)
        );
        assert_eq!(with_filter(DELOITTE, "").unwrap(), DELOITTE);
    }

    #[test]
    fn page_urls() {
        let url = with_filter(DELOITTE, FILTER).unwrap();
        assert_eq!(
            page_url(&url, 1).unwrap(),
            format!("https://www.glassdoor.com/Reviews/Deloitte-Reviews-E2763_P1.htm{}", FILTER)
        );
        let p3 = page_url(&url, 3).unwrap();
        assert_eq!(
            page_url(&p3, 4).unwrap(),
            format!("https://www.glassdoor.com/Reviews/Deloitte-Reviews-E2763_P4.htm{}", FILTER)
        );
    }

    #[test]
    fn not_a_listing() {
        assert!(matches!(
            page_url("https://www.glassdoor.com/Reviews/index", 1),
            Err(ListingError::NotAListing(_))
        ));
        // `.htm` must end the path, not appear inside it
        assert!(listing_base("https://example.com/a.html").is_err());
    }

    #[test]
    fn employer_ids() {
        assert_eq!(employer_id(DELOITTE), Some(2763));
        assert_eq!(
            employer_id("https://www.glassdoor.com/Reviews/PwC-Reviews-E8450_P2.htm?x=1"),
            Some(8450)
        );
        assert_eq!(
            employer_id("https://www.glassdoor.com/Reviews/Deloitte-Belgium-Reviews-EI_IE2763.0,8_IL.9,16_IN25_P3.htm"),
            Some(2763)
        );
        assert_eq!(employer_id("https://www.glassdoor.com/Reviews/index.htm"), None);
        assert_eq!(employer_id("https://www.glassdoor.com/Reviews/Acme-Engineering-Reviews.htm"), None);
    }

    #[test]
    fn recency_sort_detection() {
        assert!(sorted_by_recent(&with_filter(DELOITTE, FILTER).unwrap()));
        assert!(!sorted_by_recent(DELOITTE));
    }
}
