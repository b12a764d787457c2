//! Extraction pipeline: scan bytes in, verdict on the stored record out.
//!
//! The model sees recognized text when OCR finds any, otherwise the raw
//! scan. Model output is defensively parsed (prose stripped, truncation
//! repaired) before sanitization and validation; an unparseable payload is
//! "no extraction", never a crash.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::{ModelClient, ModelInput};
use crate::objectstore::{mail_id_from_locator, ObjectStore};
use crate::ocr::TextRecognizer;
use crate::repair::repair_json;
use crate::sanitize::{sanitize_code, sanitize_email, sanitize_full_name, sanitize_message};
use crate::schema::ExtractedFields;
use crate::sync::RecordSynchronizer;
use crate::validate::{validate, ValidationRules};

/// Confidence assumed when the model omits `handwritten_confidence`.
const DEFAULT_CONFIDENCE: f64 = 0.85;

const EXTRACTION_PROMPT: &str = "\
You are a document analysis system extracting structured user information \
from handwritten postcards.

Return a single JSON object with exactly these keys:
- code: the donation code (typically 12 digits); read each character individually
- user_full_name: the sender's full name, formatted as \"FirstName LastName\"
- email: the sender's email address
- address: the complete mailing address
- message: the handwritten statement, transcribed as written
- handwritten_confidence: your confidence in the transcription, 0 to 1

Rules:
- Use double quotes for all keys and string values
- Escape quotes inside string values with backslashes
- No trailing commas and no newline characters inside the JSON
- Return only the JSON object, with no explanation before or after";

/// Raw field set as the model emits it, everything optional.
#[derive(Debug, Default, Deserialize)]
struct ModelPayload {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    user_full_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    handwritten_confidence: Option<f64>,
}

/// Parse model output, tolerating leading prose, stray newlines and
/// truncation. `None` means the payload is unusable even after repair.
fn parse_model_payload(raw: &str) -> Option<ModelPayload> {
    if let Ok(payload) = serde_json::from_str(raw.trim()) {
        return Some(payload);
    }

    let start = raw.find('{')?;
    let candidate = raw[start..].replace("\\n", "").replace(['\n', '\r'], "");
    if let Ok(payload) = serde_json::from_str(&candidate) {
        return Some(payload);
    }

    serde_json::from_str(&repair_json(&candidate)).ok()
}

fn sanitize_payload(payload: &ModelPayload) -> ExtractedFields {
    ExtractedFields {
        code: sanitize_code(payload.code.as_deref()),
        user_full_name: sanitize_full_name(payload.user_full_name.as_deref()),
        email: sanitize_email(payload.email.as_deref()),
        address: payload.address.as_deref().unwrap_or_default().trim().to_string(),
        message: sanitize_message(payload.message.as_deref()),
        handwritten_confidence: Some(
            payload.handwritten_confidence.unwrap_or(DEFAULT_CONFIDENCE),
        ),
    }
}

/// What one extraction attempt produced. `id` is set only for records that
/// passed validation, so the orchestrator can branch on its absence.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub is_valid: bool,
}

pub struct Extractor {
    objects: Arc<dyn ObjectStore>,
    recognizer: Arc<dyn TextRecognizer>,
    model: Arc<dyn ModelClient>,
    synchronizer: Arc<RecordSynchronizer>,
    rules: ValidationRules,
}

impl Extractor {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        recognizer: Arc<dyn TextRecognizer>,
        model: Arc<dyn ModelClient>,
        synchronizer: Arc<RecordSynchronizer>,
        rules: ValidationRules,
    ) -> Self {
        Self { objects, recognizer, model, synchronizer, rules }
    }

    /// Run the full pipeline for the scan at `locator`: recognize, extract,
    /// sanitize, validate, and persist the verdict onto the stored record.
    pub async fn extract_and_validate(&self, locator: &str) -> Result<ExtractionOutcome> {
        let mail_id = mail_id_from_locator(locator)
            .ok_or_else(|| anyhow!("locator {locator:?} does not contain a mail id"))?;

        let record = self
            .synchronizer
            .get(mail_id)
            .await
            .with_context(|| format!("load mail {mail_id} for extraction"))?
            .ok_or_else(|| anyhow!("no stored record for mail {mail_id}"))?;

        // A shredded record is disposed; a late or replayed invocation must
        // not touch it.
        if record.is_shredded {
            warn!("mail {mail_id}: already shredded, skipping extraction");
            return Ok(ExtractionOutcome { id: None, is_valid: false });
        }

        let image = self
            .objects
            .fetch_bytes(locator)
            .await
            .with_context(|| format!("fetch scan for mail {mail_id}"))?;

        // OCR output is advisory; a failed or empty recognition falls back
        // to showing the model the scan itself.
        let lines = match self.recognizer.recognize(&image).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!("mail {mail_id}: text recognition failed: {e:#}");
                Vec::new()
            }
        };
        let input = if lines.is_empty() {
            debug!("mail {mail_id}: no recognized text, sending raw scan to the model");
            ModelInput::Image(image)
        } else {
            ModelInput::Text(lines.join("\n"))
        };

        let raw = self
            .model
            .invoke(EXTRACTION_PROMPT, input)
            .await
            .with_context(|| format!("model call for mail {mail_id}"))?;

        let Some(payload) = parse_model_payload(&raw) else {
            warn!("mail {mail_id}: model output unusable after repair, no extraction");
            return Ok(ExtractionOutcome { id: None, is_valid: false });
        };

        let fields = sanitize_payload(&payload);
        let verdict = validate(&fields, &self.rules);

        let mut updated = record;
        updated.extracted = Some(fields);
        updated.is_valid = Some(verdict.is_valid);
        updated.reason = verdict.reason;
        updated.last_action_date = Utc::now();
        self.synchronizer
            .upsert(&updated)
            .await
            .with_context(|| format!("persist extraction for mail {mail_id}"))?;

        if verdict.is_valid {
            info!("mail {mail_id}: extraction accepted");
            Ok(ExtractionOutcome { id: Some(mail_id), is_valid: true })
        } else {
            info!("mail {mail_id}: extraction rejected ({:?})", verdict.reason);
            Ok(ExtractionOutcome { id: None, is_valid: false })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::schema::{MailRecord, RejectReason};
    use crate::store::{MailStore, ScanPage, StoreError};
    use crate::validate::DEFAULT_CANONICAL_STATEMENT;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    // ── parse_model_payload ─────────────────────────────────────────────

    #[test]
    fn test_parse_direct_json() {
        let payload = parse_model_payload(r#"{"code": "AB12", "message": "hi"}"#).unwrap();
        assert_eq!(payload.code.as_deref(), Some("AB12"));
        assert_eq!(payload.message.as_deref(), Some("hi"));
        assert!(payload.handwritten_confidence.is_none());
    }

    #[test]
    fn test_parse_strips_leading_prose() {
        let raw = r#"Here is the extracted information: {"code": "X1"}"#;
        let payload = parse_model_payload(raw).unwrap();
        assert_eq!(payload.code.as_deref(), Some("X1"));
    }

    #[test]
    fn test_parse_strips_newline_sequences() {
        // Raw newline inside a string value is invalid JSON until stripped
        let raw = "{\"code\": \"X1\", \"message\": \"line one\nline two\"}";
        let payload = parse_model_payload(raw).unwrap();
        assert_eq!(payload.message.as_deref(), Some("line oneline two"));

        let escaped = r#"{"code": "X1",\n"email": "a@b.com"}"#;
        let payload = parse_model_payload(escaped).unwrap();
        assert_eq!(payload.email.as_deref(), Some("a@b.com"));
    }

    #[test]
    fn test_parse_keeps_odd_braces_inside_string_values() {
        // Valid once the prose is stripped; repair must not get a chance
        // to "balance" the brace inside the string
        let raw = r#"Sure: {"message": "use { to open a set"}"#;
        let payload = parse_model_payload(raw).unwrap();
        assert_eq!(payload.message.as_deref(), Some("use { to open a set"));
    }

    #[test]
    fn test_parse_repairs_truncated_output() {
        let raw = r#"{"code": "AB12", "user_full_name": "Jane Doe", "email": "a@b"#;
        let payload = parse_model_payload(raw).unwrap();
        assert_eq!(payload.code.as_deref(), Some("AB12"));
        assert_eq!(payload.email.as_deref(), Some("a@b"));
    }

    #[test]
    fn test_parse_gives_up_on_garbage() {
        assert!(parse_model_payload("I could not read the card, sorry.").is_none());
        assert!(parse_model_payload("").is_none());
    }

    #[test]
    fn test_sanitize_payload_defaults_confidence() {
        let fields = sanitize_payload(&ModelPayload::default());
        assert_eq!(fields.handwritten_confidence, Some(DEFAULT_CONFIDENCE));
        assert_eq!(fields.code, "");
        assert_eq!(fields.message, "");
    }

    // ── pipeline with fakes ─────────────────────────────────────────────

    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<HashMap<i64, MailRecord>>,
    }

    #[async_trait]
    impl MailStore for MemoryStore {
        async fn get(&self, id: i64) -> Result<Option<MailRecord>, StoreError> {
            Ok(self.records.lock().unwrap().get(&id).cloned())
        }

        async fn put(&self, record: &MailRecord) -> Result<(), StoreError> {
            self.records.lock().unwrap().insert(record.id, record.clone());
            Ok(())
        }

        async fn update(&self, record: &MailRecord) -> Result<(), StoreError> {
            self.records.lock().unwrap().insert(record.id, record.clone());
            Ok(())
        }

        async fn scan_dispatchable(&self, _offset: u64, _limit: u64) -> Result<ScanPage, StoreError> {
            Ok(ScanPage { records: Vec::new(), next_offset: None })
        }
    }

    struct StubObjects;

    #[async_trait]
    impl ObjectStore for StubObjects {
        async fn fetch_bytes(&self, _locator: &str) -> Result<Vec<u8>> {
            Ok(vec![0xFF, 0xD8, 0xFF, 0xE0])
        }

        async fn put_bytes(&self, locator: &str, _bytes: Vec<u8>) -> Result<String> {
            Ok(locator.to_string())
        }
    }

    struct StubRecognizer {
        lines: Vec<String>,
    }

    #[async_trait]
    impl TextRecognizer for StubRecognizer {
        async fn recognize(&self, _image: &[u8]) -> Result<Vec<String>> {
            Ok(self.lines.clone())
        }
    }

    struct StubModel {
        response: String,
        saw_image: AtomicBool,
        calls: AtomicUsize,
    }

    impl StubModel {
        fn new(response: &str) -> Self {
            Self {
                response: response.to_string(),
                saw_image: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelClient for StubModel {
        async fn invoke(&self, _instructions: &str, input: ModelInput) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if matches!(input, ModelInput::Image(_)) {
                self.saw_image.store(true, Ordering::SeqCst);
            }
            Ok(self.response.clone())
        }
    }

    const LOCATOR: &str = "obj://scans/images/2024-08-27/card_18464977.jpg";
    const MAIL_ID: i64 = 18464977;

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        let now = Utc::now();
        store.records.lock().unwrap().insert(
            MAIL_ID,
            MailRecord {
                id: MAIL_ID,
                raw_message: "postcard".to_string(),
                image_reference: LOCATOR.to_string(),
                creation_date: now,
                assigned_date: now,
                last_action_date: now,
                extracted: None,
                is_valid: None,
                reason: None,
                is_shredded: false,
            },
        );
        store
    }

    fn extractor(
        store: Arc<MemoryStore>,
        model: Arc<StubModel>,
        lines: Vec<String>,
    ) -> Extractor {
        let sync = Arc::new(RecordSynchronizer::new(
            store,
            RetryPolicy::new(3, Duration::from_millis(1)),
        ));
        Extractor::new(
            Arc::new(StubObjects),
            Arc::new(StubRecognizer { lines }),
            model,
            sync,
            ValidationRules::default(),
        )
    }

    fn good_response() -> String {
        format!(
            r#"{{"code": "AB12XY34", "user_full_name": "Jane Doe", "email": "Jane@Example.com", "address": "1 Main St, Springfield", "message": "{DEFAULT_CANONICAL_STATEMENT}", "handwritten_confidence": 0.93}}"#
        )
    }

    #[tokio::test]
    async fn test_valid_card_returns_id_and_persists_fields() {
        let store = seeded_store();
        let model = Arc::new(StubModel::new(&good_response()));
        let pipeline = extractor(store.clone(), model, vec!["some text".to_string()]);

        let outcome = pipeline.extract_and_validate(LOCATOR).await.unwrap();
        assert_eq!(outcome.id, Some(MAIL_ID));
        assert!(outcome.is_valid);

        let stored = store.records.lock().unwrap().get(&MAIL_ID).cloned().unwrap();
        assert_eq!(stored.is_valid, Some(true));
        assert_eq!(stored.reason, None);
        let fields = stored.extracted.unwrap();
        assert_eq!(fields.email, "jane@example.com");
        assert_eq!(fields.code, "AB12XY34");
        assert_eq!(fields.handwritten_confidence, Some(0.93));
    }

    #[tokio::test]
    async fn test_dissimilar_message_rejected_and_recorded() {
        let store = seeded_store();
        let response = r#"{"code": "AB12", "user_full_name": "Jane Doe", "email": "a@b.com", "address": "x", "message": "unrelated ramblings about the weather", "handwritten_confidence": 0.95}"#;
        let model = Arc::new(StubModel::new(response));
        let pipeline = extractor(store.clone(), model, vec!["text".to_string()]);

        let outcome = pipeline.extract_and_validate(LOCATOR).await.unwrap();
        assert_eq!(outcome.id, None);
        assert!(!outcome.is_valid);

        let stored = store.records.lock().unwrap().get(&MAIL_ID).cloned().unwrap();
        assert_eq!(stored.is_valid, Some(false));
        assert_eq!(stored.reason, Some(RejectReason::StatementInvalid));
        assert!(stored.extracted.is_some());
    }

    #[tokio::test]
    async fn test_unusable_model_output_leaves_record_untouched() {
        let store = seeded_store();
        let model = Arc::new(StubModel::new("I cannot read this card at all."));
        let pipeline = extractor(store.clone(), model, vec!["text".to_string()]);

        let outcome = pipeline.extract_and_validate(LOCATOR).await.unwrap();
        assert_eq!(outcome.id, None);
        assert!(!outcome.is_valid);

        let stored = store.records.lock().unwrap().get(&MAIL_ID).cloned().unwrap();
        assert_eq!(stored.is_valid, None);
        assert!(stored.extracted.is_none());
    }

    #[tokio::test]
    async fn test_shredded_record_is_never_reprocessed() {
        let store = seeded_store();
        store.records.lock().unwrap().get_mut(&MAIL_ID).unwrap().is_shredded = true;
        let before = store.records.lock().unwrap().get(&MAIL_ID).cloned().unwrap();

        let model = Arc::new(StubModel::new(&good_response()));
        let pipeline = extractor(store.clone(), model.clone(), vec!["text".to_string()]);

        let outcome = pipeline.extract_and_validate(LOCATOR).await.unwrap();
        assert_eq!(outcome.id, None);
        assert!(!outcome.is_valid);

        let after = store.records.lock().unwrap().get(&MAIL_ID).cloned().unwrap();
        assert_eq!(after, before);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_confidence_defaults_and_passes_threshold() {
        let store = seeded_store();
        let response = format!(
            r#"{{"code": "AB12", "user_full_name": "Jane Doe", "email": "a@b.com", "address": "x", "message": "{DEFAULT_CANONICAL_STATEMENT}"}}"#
        );
        let model = Arc::new(StubModel::new(&response));
        let pipeline = extractor(store.clone(), model, vec!["text".to_string()]);

        let outcome = pipeline.extract_and_validate(LOCATOR).await.unwrap();
        assert_eq!(outcome.id, Some(MAIL_ID));

        let stored = store.records.lock().unwrap().get(&MAIL_ID).cloned().unwrap();
        let fields = stored.extracted.unwrap();
        assert_eq!(fields.handwritten_confidence, Some(DEFAULT_CONFIDENCE));
    }

    #[tokio::test]
    async fn test_empty_recognition_falls_back_to_raw_scan() {
        let store = seeded_store();
        let model = Arc::new(StubModel::new(&good_response()));
        let pipeline = extractor(store.clone(), model.clone(), Vec::new());

        pipeline.extract_and_validate(LOCATOR).await.unwrap();
        assert!(model.saw_image.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_locator_without_mail_id_is_an_error() {
        let store = seeded_store();
        let model = Arc::new(StubModel::new(&good_response()));
        let pipeline = extractor(store, model, Vec::new());

        let err = pipeline
            .extract_and_validate("obj://scans/images/2024-08-27/photo.jpg")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not contain a mail id"));
    }

    #[tokio::test]
    async fn test_unknown_record_is_an_error() {
        let store = Arc::new(MemoryStore::default());
        let model = Arc::new(StubModel::new(&good_response()));
        let pipeline = extractor(store, model, Vec::new());

        let err = pipeline.extract_and_validate(LOCATOR).await.unwrap_err();
        assert!(err.to_string().contains("no stored record"));
    }
}
