//! Acceptance rules for extracted mail. A fixed, ordered chain: the first
//! failing rule decides the verdict. Order and thresholds are frozen so
//! verdicts stay comparable with previously processed mail.

use crate::schema::{ExtractedFields, RejectReason, ValidationVerdict};
use crate::similarity::similarity_pct;

/// Statement donors copy onto the card by hand. Overridable via
/// `CANONICAL_STATEMENT` for campaigns that use different wording.
pub const DEFAULT_CANONICAL_STATEMENT: &str =
    "I confirm my donation and agree to the terms of the postcard campaign";

#[derive(Debug, Clone)]
pub struct ValidationRules {
    pub canonical_statement: String,
    pub min_statement_similarity: f64,
    pub min_handwritten_confidence: f64,
    pub max_code_length: usize,
    pub max_email_length: usize,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            canonical_statement: DEFAULT_CANONICAL_STATEMENT.to_string(),
            min_statement_similarity: 80.0,
            min_handwritten_confidence: 0.85,
            max_code_length: 20,
            max_email_length: 255,
        }
    }
}

/// Run the rule chain over sanitized fields. Deterministic: same fields and
/// rules always yield the same verdict.
pub fn validate(fields: &ExtractedFields, rules: &ValidationRules) -> ValidationVerdict {
    let similarity = similarity_pct(&fields.message, &rules.canonical_statement);
    if similarity < rules.min_statement_similarity {
        return ValidationVerdict::rejected(RejectReason::StatementInvalid);
    }

    match fields.handwritten_confidence {
        Some(confidence) if confidence >= rules.min_handwritten_confidence => {}
        _ => return ValidationVerdict::rejected(RejectReason::LowConfidence),
    }

    if fields.code.is_empty() || fields.code.len() >= rules.max_code_length {
        return ValidationVerdict::rejected(RejectReason::InvalidCode);
    }

    if fields.user_full_name.is_empty() {
        return ValidationVerdict::rejected(RejectReason::InvalidName);
    }

    if fields.email.is_empty() || fields.email.len() >= rules.max_email_length {
        return ValidationVerdict::rejected(RejectReason::InvalidEmail);
    }

    ValidationVerdict::accepted()
}
