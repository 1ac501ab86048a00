use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::review::ReviewRecord;

static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([A-Za-z_][A-Za-z0-9_]*)"\s*:"#).unwrap());
static EMPLOYER_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Employer:(\d+)$").unwrap());

const MAX_RATING: u8 = 5;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractError {
    #[error("review has no `{0}` field")]
    Missing(&'static str),
    #[error("malformed `{field}`: {reason}")]
    Malformed { field: &'static str, reason: String },
}

/// Offsets of every `"key":` in a review blob, pointing just past the colon.
///
/// Only the first occurrence of a key is kept, so nested objects that appear
/// later in the blob never shadow a top-level field.
struct FieldIndex<'a> {
    blob: &'a str,
    offsets: HashMap<&'a str, usize>,
}

impl<'a> FieldIndex<'a> {
    fn new(blob: &'a str) -> Self {
        let mut offsets = HashMap::new();
        for caps in KEY_RE.captures_iter(blob) {
            if let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) {
                offsets.entry(key.as_str()).or_insert(whole.end());
            }
        }
        Self { blob, offsets }
    }

    /// Decode the value following `key`. Absent keys and `null` both give `None`.
    fn get<T: DeserializeOwned>(&self, key: &'static str) -> Result<Option<T>, ExtractError> {
        let Some(&at) = self.offsets.get(key) else {
            return Ok(None);
        };
        let mut values =
            serde_json::Deserializer::from_str(&self.blob[at..]).into_iter::<Option<T>>();
        match values.next() {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(ExtractError::Malformed {
                field: key,
                reason: e.to_string(),
            }),
            None => Err(ExtractError::Malformed {
                field: key,
                reason: "no value after key".into(),
            }),
        }
    }

    fn require<T: DeserializeOwned>(&self, key: &'static str) -> Result<T, ExtractError> {
        self.get(key)?.ok_or(ExtractError::Missing(key))
    }

    fn rating(&self, key: &'static str) -> Result<Option<u8>, ExtractError> {
        match self.get::<u8>(key)? {
            Some(r) if r > MAX_RATING => Err(ExtractError::Malformed {
                field: key,
                reason: format!("rating {} outside 0-{}", r, MAX_RATING),
            }),
            other => Ok(other),
        }
    }

    fn text(&self, key: &'static str) -> Result<Option<String>, ExtractError> {
        Ok(self
            .get::<String>(key)?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }
}

/// Extract one review record from an `EmployerReview` blob.
pub fn extract_review(blob: &str) -> Result<ReviewRecord, ExtractError> {
    let fields = FieldIndex::new(blob);

    let review_id = fields.require::<u64>("reviewId")?;
    let raw_time = fields.require::<String>("reviewDateTime")?;
    let reviewed_at = parse_timestamp(&raw_time).ok_or_else(|| ExtractError::Malformed {
        field: "reviewDateTime",
        reason: format!("unrecognised timestamp {:?}", raw_time),
    })?;
    let rating_overall = fields
        .rating("ratingOverall")?
        .ok_or(ExtractError::Missing("ratingOverall"))?;

    Ok(ReviewRecord {
        review_id,
        employer_id: employer_id(&fields)?,
        title: fields.text("summary")?,
        reviewed_at,
        rating_overall,
        rating_ceo: fields.get("ratingCeo")?,
        rating_business_outlook: fields.get("ratingBusinessOutlook")?,
        rating_work_life_balance: fields.rating("ratingWorkLifeBalance")?,
        rating_culture_and_values: fields.rating("ratingCultureAndValues")?,
        rating_diversity_and_inclusion: fields.rating("ratingDiversityAndInclusion")?,
        rating_senior_leadership: fields.rating("ratingSeniorLeadership")?,
        rating_recommend_to_friend: fields.get("ratingRecommendToFriend")?,
        rating_career_opportunities: fields.rating("ratingCareerOpportunities")?,
        rating_compensation_and_benefits: fields.rating("ratingCompensationAndBenefits")?,
        is_current_job: fields.get("isCurrentJob")?,
        length_of_employment: fields.get("lengthOfEmployment")?,
        employment_status: fields.get("employmentStatus")?,
        job_ending_year: fields.get("jobEndingYear")?,
        pros: fields.text("pros")?,
        cons: fields.text("cons")?,
        advice: fields.text("advice")?,
        count_helpful: fields.get("countHelpful")?,
        count_not_helpful: fields.get("countNotHelpful")?,
        employer_responses: employer_responses(&fields)?,
        language_id: fields.text("languageId")?,
    })
}

/// The employer is either inlined (`{"id":2763,..}`) or a cache reference
/// (`{"__ref":"Employer:2763"}`).
fn employer_id(fields: &FieldIndex) -> Result<Option<u64>, ExtractError> {
    let Some(employer) = fields.get::<Value>("employer")? else {
        return Ok(None);
    };
    if let Some(id) = employer.get("id").and_then(Value::as_u64) {
        return Ok(Some(id));
    }
    Ok(employer
        .get("__ref")
        .and_then(Value::as_str)
        .and_then(|r| EMPLOYER_REF_RE.captures(r))
        .and_then(|c| c[1].parse().ok()))
}

fn employer_responses(fields: &FieldIndex) -> Result<Vec<String>, ExtractError> {
    let responses = fields
        .get::<Vec<Value>>("employerResponses")?
        .unwrap_or_default();
    Ok(responses
        .iter()
        .filter_map(|r| r.get("response").and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// `2022-06-13T05:07:07.813` (no zone) is the usual shape; RFC 3339 is accepted too.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    raw.parse::<NaiveDateTime>()
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.naive_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::{CeoApproval, EmploymentStatus, Outlook};

    const MINIMAL: &str = r#"{"__typename":"EmployerReview","reviewId":42,"reviewDateTime":"2023-01-05T10:00:00","ratingOverall":3,"languageId":"eng","translationMethod":null}"#;

    #[test]
    fn minimal_review() {
        let r = extract_review(MINIMAL).unwrap();
        assert_eq!(r.review_id, 42);
        assert_eq!(r.rating_overall, 3);
        assert_eq!(r.reviewed_at.to_string(), "2023-01-05 10:00:00");
        assert_eq!(r.language_id.as_deref(), Some("eng"));
        assert!(r.pros.is_none());
        assert!(r.rating_ceo.is_none());
        assert!(r.employer_responses.is_empty());
    }

    #[test]
    fn missing_required_field() {
        let blob = MINIMAL.replace(r#""reviewId":42,"#, "");
        assert_eq!(extract_review(&blob), Err(ExtractError::Missing("reviewId")));
    }

    #[test]
    fn rating_out_of_range() {
        let blob = MINIMAL.replace(r#""ratingOverall":3"#, r#""ratingOverall":7"#);
        assert!(matches!(
            extract_review(&blob),
            Err(ExtractError::Malformed { field: "ratingOverall", .. })
        ));
    }

    #[test]
    fn unknown_ceo_token_is_malformed() {
        let blob = MINIMAL.replace(
            r#""ratingOverall":3"#,
            r#""ratingOverall":3,"ratingCeo":"MAYBE""#,
        );
        assert!(matches!(
            extract_review(&blob),
            Err(ExtractError::Malformed { field: "ratingCeo", .. })
        ));
    }

    #[test]
    fn bad_timestamp() {
        let blob = MINIMAL.replace("2023-01-05T10:00:00", "last tuesday");
        assert!(matches!(
            extract_review(&blob),
            Err(ExtractError::Malformed { field: "reviewDateTime", .. })
        ));
    }

    #[test]
    fn field_order_does_not_matter() {
        let blob = r#"{"__typename":"EmployerReview","ratingCeo":"DISAPPROVE","ratingOverall":1,"employmentStatus":"CONTRACT","reviewDateTime":"2021-12-31T23:59:59Z","ratingBusinessOutlook":"NEUTRAL","reviewId":7,"translationMethod":null}"#;
        let r = extract_review(blob).unwrap();
        assert_eq!(r.review_id, 7);
        assert_eq!(r.rating_ceo, Some(CeoApproval::Disapprove));
        assert_eq!(r.rating_business_outlook, Some(Outlook::Neutral));
        assert_eq!(r.employment_status, Some(EmploymentStatus::Contract));
        assert_eq!(r.reviewed_at.to_string(), "2021-12-31 23:59:59");
    }

    #[test]
    fn escaped_text_is_decoded() {
        let blob = MINIMAL.replace(
            r#""languageId""#,
            r#""pros":"Smart \"people\"\nand café","cons":"  ","languageId""#,
        );
        let r = extract_review(&blob).unwrap();
        assert_eq!(r.pros.as_deref(), Some("Smart \"people\"\nand café"));
        assert!(r.cons.is_none());
    }

    #[test]
    fn inline_employer_object() {
        let blob = MINIMAL.replace(
            r#""languageId""#,
            r#""employer":{"__typename":"Employer","id":2763,"shortName":"Deloitte"},"languageId""#,
        );
        assert_eq!(extract_review(&blob).unwrap().employer_id, Some(2763));
    }

    #[test]
    fn key_names_inside_text_are_ignored() {
        let blob = MINIMAL.replace(
            r#""EmployerReview","#,
            r#""EmployerReview","cons":"the \"reviewId\":99 field","#,
        );
        let r = extract_review(&blob).unwrap();
        assert_eq!(r.review_id, 42);
        assert_eq!(r.cons.as_deref(), Some("the \"reviewId\":99 field"));
    }
}
