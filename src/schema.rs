//! Core data model: the harvested mail record, the extracted field set, and
//! the validation verdict attached to it.
//!
//! Wire form is snake_case JSON. `id` is the provider-assigned mail id and
//! the natural key; a record moves forward only: harvested, extracted,
//! validated, then optionally shredded once the downstream consumer has
//! confirmed it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One harvested mail item, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailRecord {
    pub id: i64,
    pub raw_message: String,
    /// Locator for the scanned image. Starts as the provider URL, rewritten
    /// to an `obj://` locator once the scan is archived.
    pub image_reference: String,
    pub creation_date: DateTime<Utc>,
    pub assigned_date: DateTime<Utc>,
    pub last_action_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted: Option<ExtractedFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_valid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(default)]
    pub is_shredded: bool,
}

/// Structured fields pulled off the scan, post-sanitization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub code: String,
    pub user_full_name: String,
    pub email: String,
    pub address: String,
    pub message: String,
    /// Model's own estimate of how legible the handwriting was, 0..1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handwritten_confidence: Option<f64>,
}

/// Why validation rejected a record. Serialized variant names are stable;
/// stored history depends on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    StatementInvalid,
    LowConfidence,
    InvalidCode,
    InvalidName,
    InvalidEmail,
}

/// Outcome of one validation pass. Lives on the record, never on its own.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl ValidationVerdict {
    pub fn accepted() -> Self {
        Self { is_valid: true, reason: None }
    }

    pub fn rejected(reason: RejectReason) -> Self {
        Self { is_valid: false, reason: Some(reason) }
    }
}

/// Inclusive date window a crawl run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Parse `YYYY-MM-DD` bounds, e.g. from a request body.
    pub fn parse(start: &str, end: &str) -> anyhow::Result<Self> {
        let start = NaiveDate::parse_from_str(start, "%Y-%m-%d")
            .map_err(|e| anyhow::anyhow!("invalid start date {start:?}: {e}"))?;
        let end = NaiveDate::parse_from_str(end, "%Y-%m-%d")
            .map_err(|e| anyhow::anyhow!("invalid end date {end:?}: {e}"))?;
        anyhow::ensure!(start <= end, "start date {start} is after end date {end}");
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_reason_wire_names() {
        let json = serde_json::to_string(&RejectReason::StatementInvalid).unwrap();
        assert_eq!(json, "\"StatementInvalid\"");
        let back: RejectReason = serde_json::from_str("\"LowConfidence\"").unwrap();
        assert_eq!(back, RejectReason::LowConfidence);
    }

    #[test]
    fn test_record_optional_fields_default() {
        let json = r#"{
            "id": 42,
            "raw_message": "hi",
            "image_reference": "obj://scans/images/2024-08-20/card_42.jpg",
            "creation_date": "2024-08-20T00:00:00Z",
            "assigned_date": "2024-08-20T00:00:00Z",
            "last_action_date": "2024-08-21T10:00:00Z"
        }"#;
        let record: MailRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, 42);
        assert!(record.extracted.is_none());
        assert!(record.is_valid.is_none());
        assert!(!record.is_shredded);
    }

    #[test]
    fn test_date_range_bounds_inclusive() {
        let range = DateRange::parse("2024-08-01", "2024-08-31").unwrap();
        assert!(range.contains(NaiveDate::from_ymd_opt(2024, 8, 1).unwrap()));
        assert!(range.contains(NaiveDate::from_ymd_opt(2024, 8, 31).unwrap()));
        assert!(!range.contains(NaiveDate::from_ymd_opt(2024, 7, 31).unwrap()));
        assert!(!range.contains(NaiveDate::from_ymd_opt(2024, 9, 1).unwrap()));
    }

    #[test]
    fn test_date_range_rejects_inverted_bounds() {
        assert!(DateRange::parse("2024-08-31", "2024-08-01").is_err());
    }
}
