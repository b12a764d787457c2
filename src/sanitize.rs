//! Per-field cleanup of model-extracted strings. Handwriting OCR plus a
//! generative model produces stray punctuation, mixed case and the odd
//! control character; each field gets a fixed whitelist so downstream
//! comparisons and length checks operate on predictable text.
//!
//! Every function is total: `None` sanitizes to an empty string.

/// Donation codes are alphanumeric only.
pub fn sanitize_code(raw: Option<&str>) -> String {
    raw.unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Names keep letters and spaces.
pub fn sanitize_full_name(raw: Option<&str>) -> String {
    raw.unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphabetic() || *c == ' ')
        .collect()
}

/// Emails keep `[a-zA-Z0-9_.+-@]` and are lowercased.
pub fn sanitize_email(raw: Option<&str>) -> String {
    raw.unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '+' | '-' | '@'))
        .collect::<String>()
        .to_lowercase()
}

/// Messages keep `[a-zA-Z0-9@. ]`; newlines become spaces first so line
/// breaks in the handwriting do not glue words together.
pub fn sanitize_message(raw: Option<&str>) -> String {
    raw.unwrap_or_default()
        .replace(['\r', '\n'], " ")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | ' '))
        .collect()
}
