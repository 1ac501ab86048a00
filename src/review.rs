use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// One employee review, flattened from the embedded `EmployerReview` object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewRecord {
    pub review_id: u64,
    pub employer_id: Option<u64>,
    pub title: Option<String>,
    pub reviewed_at: NaiveDateTime,
    pub rating_overall: u8,
    pub rating_ceo: Option<CeoApproval>,
    pub rating_business_outlook: Option<Outlook>,
    pub rating_work_life_balance: Option<u8>,
    pub rating_culture_and_values: Option<u8>,
    pub rating_diversity_and_inclusion: Option<u8>,
    pub rating_senior_leadership: Option<u8>,
    pub rating_recommend_to_friend: Option<Outlook>,
    pub rating_career_opportunities: Option<u8>,
    pub rating_compensation_and_benefits: Option<u8>,
    pub is_current_job: Option<bool>,
    pub length_of_employment: Option<u32>,
    pub employment_status: Option<EmploymentStatus>,
    pub job_ending_year: Option<i32>,
    pub pros: Option<String>,
    pub cons: Option<String>,
    pub advice: Option<String>,
    pub count_helpful: Option<u32>,
    pub count_not_helpful: Option<u32>,
    pub employer_responses: Vec<String>,
    pub language_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CeoApproval {
    Approve,
    Disapprove,
    NoOpinion,
}

impl CeoApproval {
    pub fn as_str(&self) -> &'static str {
        match self {
            CeoApproval::Approve => "APPROVE",
            CeoApproval::Disapprove => "DISAPPROVE",
            CeoApproval::NoOpinion => "NO_OPINION",
        }
    }
}

/// Used by both business outlook and recommend-to-friend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outlook {
    Positive,
    Neutral,
    Negative,
}

impl Outlook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outlook::Positive => "POSITIVE",
            Outlook::Neutral => "NEUTRAL",
            Outlook::Negative => "NEGATIVE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmploymentStatus {
    Regular,
    PartTime,
    Contract,
    Intern,
    Freelance,
    #[serde(other)]
    Other,
}

impl EmploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmploymentStatus::Regular => "REGULAR",
            EmploymentStatus::PartTime => "PART_TIME",
            EmploymentStatus::Contract => "CONTRACT",
            EmploymentStatus::Intern => "INTERN",
            EmploymentStatus::Freelance => "FREELANCE",
            EmploymentStatus::Other => "OTHER",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tokens_match_as_str() {
        for ceo in [CeoApproval::Approve, CeoApproval::Disapprove, CeoApproval::NoOpinion] {
            let json = serde_json::to_string(&ceo).unwrap();
            assert_eq!(json, format!("\"{}\"", ceo.as_str()));
        }
        let parsed: Outlook = serde_json::from_str("\"NEUTRAL\"").unwrap();
        assert_eq!(parsed, Outlook::Neutral);
    }

    #[test]
    fn unknown_employment_status_is_other() {
        let parsed: EmploymentStatus = serde_json::from_str("\"SELF_EMPLOYED\"").unwrap();
        assert_eq!(parsed, EmploymentStatus::Other);
        let parsed: EmploymentStatus = serde_json::from_str("\"PART_TIME\"").unwrap();
        assert_eq!(parsed, EmploymentStatus::PartTime);
    }
}
