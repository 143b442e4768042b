//! Request envelope: batch file parsing, checksum and wire body.
//!
//! A batch file looks like
//!
//! ```json
//! { "tenders": [ ... ], "metadata": { "created_at": "...", "page_number": 2, "total_pages": 9 } }
//! ```
//!
//! and is sent as
//!
//! ```json
//! { "tenders": [ ... ], "metadata": { "scraperId": "...", "batchId": "...", "scrapedAt": "...",
//!   "checksum": "<sha256 hex>", "pageNumber": 2, "totalPages": 9 } }
//! ```

use chrono::Utc;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{ErrorCode, ErrorContext, PipelineError, Result};
use crate::jobs::UploadJob;

/// Metadata block of the request body.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    pub scraper_id: String,
    pub batch_id: String,
    pub scraped_at: String,
    pub checksum: String,
    pub page_number: Option<u64>,
    pub total_pages: Option<u64>,
}

/// Body of one ingestion request.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Key under which `records` is sent
    pub records_field: String,
    pub records: Vec<Value>,
    pub metadata: EnvelopeMetadata,
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(&self.records_field, &self.records)?;
        map.serialize_entry("metadata", &self.metadata)?;
        map.end()
    }
}

impl Envelope {
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

/// Builds [`Envelope`]s from raw batch files.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    scraper_id: String,
    records_field: String,
}

impl Default for EnvelopeBuilder {
    fn default() -> Self {
        Self::new("local-scraper")
    }
}

impl EnvelopeBuilder {
    pub fn new(scraper_id: impl Into<String>) -> Self {
        Self {
            scraper_id: scraper_id.into(),
            records_field: "tenders".to_string(),
        }
    }

    pub fn with_records_field(mut self, field: impl Into<String>) -> Self {
        self.records_field = field.into();
        self
    }

    /// Parse `bytes` as a batch file and wrap it for `job`.
    ///
    /// A missing records array is sent as empty. Anything that is not a JSON
    /// object, or a records field that is not an array, is a
    /// `SerializationError`.
    pub fn build(&self, job: &UploadJob, bytes: &[u8]) -> Result<Envelope> {
        let document: Value = serde_json::from_slice(bytes).with_error_code(ErrorCode::SerializationError)?;

        let Value::Object(mut document) = document else {
            return Err(PipelineError::serialization(format!(
                "batch file {} is not a JSON object",
                job.source_ref
            )));
        };

        let records = match document.remove(&self.records_field) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(records)) => records,
            Some(_) => {
                return Err(PipelineError::serialization(format!(
                    "field '{}' in {} is not an array",
                    self.records_field, job.source_ref
                )))
            }
        };

        let file_meta = match document.remove("metadata") {
            Some(Value::Object(meta)) => meta,
            _ => Map::new(),
        };

        let scraped_at = file_meta
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().to_rfc3339());

        let page_number = job
            .metadata_u64("page_number")
            .or_else(|| as_u64(file_meta.get("page_number")));
        let total_pages = job
            .metadata_u64("total_pages")
            .or_else(|| as_u64(file_meta.get("total_pages")));

        let checksum = checksum(&records)?;

        Ok(Envelope {
            records_field: self.records_field.clone(),
            records,
            metadata: EnvelopeMetadata {
                scraper_id: self.scraper_id.clone(),
                batch_id: job.batch_id.clone(),
                scraped_at,
                checksum,
                page_number,
                total_pages,
            },
        })
    }
}

fn as_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Hex SHA-256 of the compact, key-sorted JSON encoding of `records`.
pub fn checksum(records: &[Value]) -> Result<String> {
    let canonical: Vec<Value> = records.iter().map(canonicalize).collect();
    let encoded = serde_json::to_vec(&canonical)?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// Rebuild objects with keys inserted in sorted order, so the encoding is
/// stable whether or not `serde_json` preserves insertion order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobId, JobMetadata, UploadStatus};
    use serde_json::json;

    fn job(metadata: JobMetadata) -> UploadJob {
        UploadJob {
            id: JobId::new(),
            source_ref: "/data/batch.json".into(),
            batch_id: "batch-42".into(),
            status: UploadStatus::Processing,
            attempts: 0,
            max_attempts: 5,
            created_at: Utc::now(),
            next_retry_at: None,
            error_message: None,
            metadata,
        }
    }

    #[test]
    fn test_build_envelope_from_batch_file() {
        let bytes = serde_json::to_vec(&json!({
            "tenders": [{"title": "Road works", "id": 1}],
            "metadata": {"created_at": "2024-05-01T10:00:00Z", "page_number": 2, "total_pages": 9}
        }))
        .unwrap();

        let envelope = EnvelopeBuilder::new("scraper-a").build(&job(JobMetadata::new()), &bytes).unwrap();

        assert_eq!(envelope.record_count(), 1);
        assert_eq!(envelope.metadata.scraper_id, "scraper-a");
        assert_eq!(envelope.metadata.batch_id, "batch-42");
        assert_eq!(envelope.metadata.scraped_at, "2024-05-01T10:00:00Z");
        assert_eq!(envelope.metadata.page_number, Some(2));
        assert_eq!(envelope.metadata.total_pages, Some(9));
        assert_eq!(envelope.metadata.checksum.len(), 64);

        let body = serde_json::to_value(&envelope).unwrap();
        assert_eq!(body["tenders"][0]["title"], "Road works");
        assert_eq!(body["metadata"]["scraperId"], "scraper-a");
        assert_eq!(body["metadata"]["pageNumber"], 2);
    }

    #[test]
    fn test_job_metadata_overrides_file_paging() {
        let mut metadata = JobMetadata::new();
        metadata.insert("page_number".into(), json!(5));

        let bytes = br#"{"tenders": [], "metadata": {"page_number": 1, "total_pages": 7}}"#;
        let envelope = EnvelopeBuilder::default().build(&job(metadata), bytes).unwrap();

        assert_eq!(envelope.metadata.page_number, Some(5));
        assert_eq!(envelope.metadata.total_pages, Some(7));
    }

    #[test]
    fn test_checksum_ignores_key_order() {
        let a = checksum(&[json!({"a": 1, "b": {"y": 2, "x": 1}})]).unwrap();
        let b = checksum(&[json!({"b": {"x": 1, "y": 2}, "a": 1})]).unwrap();
        assert_eq!(a, b);

        let empty = checksum(&[]).unwrap();
        // sha256("[]")
        assert_eq!(empty, "4f53cda18c2baa0c0354bb5f9a3ecbe5ed12ab4d8e11ba873c2f11161202b945");
    }

    #[test]
    fn test_custom_records_field_and_missing_records() {
        let bytes = br#"{"awards": [{"id": 1}, {"id": 2}]}"#;
        let envelope = EnvelopeBuilder::default()
            .with_records_field("awards")
            .build(&job(JobMetadata::new()), bytes)
            .unwrap();
        assert_eq!(envelope.record_count(), 2);
        let body = serde_json::to_value(&envelope).unwrap();
        assert!(body.get("awards").is_some());

        let envelope = EnvelopeBuilder::default().build(&job(JobMetadata::new()), b"{}").unwrap();
        assert_eq!(envelope.record_count(), 0);
        assert_eq!(envelope.metadata.page_number, None);
    }

    #[test]
    fn test_malformed_batch_is_serialization_error() {
        let builder = EnvelopeBuilder::default();
        for bytes in [&b"not json"[..], b"[1, 2]", br#"{"tenders": "nope"}"#] {
            let err = builder.build(&job(JobMetadata::new()), bytes).unwrap_err();
            assert_eq!(err.code(), ErrorCode::SerializationError);
        }
    }
}
