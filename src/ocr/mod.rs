//! Text recognition over scanned mail images.
//!
//! Defines the [`TextRecognizer`] trait so the OCR backend can be swapped
//! (or faked in tests) without touching the extraction pipeline.

pub mod mistral;

/// Async trait implemented by each OCR backend.
///
/// Returns the recognized text as lines, top to bottom. An unreadable scan
/// yields an empty list, not an error.
#[async_trait::async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> anyhow::Result<Vec<String>>;
}
