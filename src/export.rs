use std::io::Write;

use anyhow::Result;
use rusqlite::types::ValueRef;
use rusqlite::Connection;

const EXPORT_SQL: &str = "
    SELECT t.company, t.location, r.review_id, r.employer_id, r.title, r.reviewed_at,
           r.rating_overall, r.rating_ceo, r.rating_business_outlook,
           r.rating_work_life_balance, r.rating_culture_and_values,
           r.rating_diversity_and_inclusion, r.rating_senior_leadership,
           r.rating_recommend_to_friend, r.rating_career_opportunities,
           r.rating_compensation_and_benefits, r.is_current_job, r.length_of_employment,
           r.employment_status, r.job_ending_year, r.pros, r.cons, r.advice,
           r.count_helpful, r.count_not_helpful, r.employer_responses, r.language_id,
           r.scraped_at
    FROM reviews r
    JOIN targets t ON t.id = r.target_id
    WHERE ?1 IS NULL OR t.company = ?1 COLLATE NOCASE
    ORDER BY t.company, r.reviewed_at DESC";

/// Write stored reviews as CSV (header row first). Returns the number of data rows.
pub fn write_csv<W: Write>(conn: &Connection, company: Option<&str>, out: W) -> Result<usize> {
    let mut writer = csv::Writer::from_writer(out);
    let mut stmt = conn.prepare(EXPORT_SQL)?;
    let header: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    writer.write_record(&header)?;

    let columns = header.len();
    let mut rows = stmt.query([company])?;
    let mut count = 0;
    while let Some(row) = rows.next()? {
        let mut record = Vec::with_capacity(columns);
        for i in 0..columns {
            record.push(cell(row.get_ref(i)?));
        }
        writer.write_record(&record)?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}

fn cell(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::parser::extract_page;

    #[test]
    fn exports_fixture_reviews() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        let target = db::upsert_target(
            &conn,
            db::NewTarget {
                company: "Deloitte".into(),
                location: None,
                employer_id: Some(2763),
                url: "https://www.glassdoor.com/Reviews/Deloitte-Reviews-E2763.htm".into(),
            },
        )
        .unwrap();
        let page = std::fs::read_to_string("tests/fixtures/deloitte_p1.html").unwrap();
        db::save_reviews(&conn, target.id, &extract_page(&page).records).unwrap();

        let mut out = Vec::new();
        assert_eq!(write_csv(&conn, None, &mut out).unwrap(), 3);
        let text = String::from_utf8(out).unwrap();

        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "company");
        assert_eq!(&headers[2], "review_id");

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        // newest first
        assert_eq!(&rows[0][2], "64501234");
        assert_eq!(&rows[0][1], "");
        // multi-line text survives quoting
        assert_eq!(&rows[1][21], "Micromanagement\nand no work/life balance");

        let mut none = Vec::new();
        assert_eq!(write_csv(&conn, Some("PwC"), &mut none).unwrap(), 0);
    }
}
