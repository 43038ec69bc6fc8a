//! Register-reading provider abstraction.
//!
//! Defines the [`MarkReader`] trait and the loosely-typed records a vision model
//! hands back. Everything past this module works on typed values only.

pub mod decode;
pub mod vision;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub use decode::{decode_candidates, DecodeError, DecodedRows};

const ROLL_KEYS: &[&str] = &["rollNumber", "roll_number", "roll"];
const NAME_KEYS: &[&str] = &["name"];
const MARKS_KEYS: &[&str] = &["totalMarks", "total_marks", "marks"];
const CONFIDENCE_KEYS: &[&str] = &["confidence"];

/// One uploaded register photo.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImagePayload {
    /// Build a payload, preferring the format sniffed from magic bytes over the
    /// declared content type.
    pub fn new(filename: impl Into<String>, declared_mime: Option<&str>, bytes: Vec<u8>) -> Self {
        let mime_type = sniff_mime(&bytes)
            .or_else(|| declared_mime.map(str::to_string))
            .unwrap_or_else(|| "application/octet-stream".to_string());

        Self {
            filename: filename.into(),
            mime_type,
            bytes,
        }
    }

    /// Hex SHA-256 of the image bytes.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        format!("{:x}", hasher.finalize())
    }
}

fn sniff_mime(bytes: &[u8]) -> Option<String> {
    let mime = match image::guess_format(bytes).ok()? {
        image::ImageFormat::Png => "image/png",
        image::ImageFormat::Jpeg => "image/jpeg",
        image::ImageFormat::WebP => "image/webp",
        image::ImageFormat::Gif => "image/gif",
        image::ImageFormat::Bmp => "image/bmp",
        image::ImageFormat::Tiff => "image/tiff",
        _ => return None,
    };
    Some(mime.to_string())
}

/// A row as decoded from the vision model, before any coercion.
///
/// Fields stay as raw JSON because models return roll numbers and marks as
/// either strings or numbers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCandidate {
    pub roll_number: Option<Value>,
    pub name: Option<Value>,
    pub total_marks: Option<Value>,
    pub confidence: Option<Value>,
}

impl RawCandidate {
    /// Pick each field from the first non-null key among its spellings, so a row
    /// carrying both `rollNumber` and `roll` still decodes.
    pub fn from_object(object: &Map<String, Value>) -> Self {
        let pick = |keys: &[&str]| {
            keys.iter()
                .filter_map(|k| object.get(*k))
                .find(|v| !v.is_null())
                .cloned()
        };

        Self {
            roll_number: pick(ROLL_KEYS),
            name: pick(NAME_KEYS),
            total_marks: pick(MARKS_KEYS),
            confidence: pick(CONFIDENCE_KEYS),
        }
    }
}

/// Why one image produced no records.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("vision service error: {0}")]
    Service(String),
    #[error("vision request timed out")]
    Timeout,
    #[error("unreadable response: {0}")]
    Decode(#[from] DecodeError),
}

impl ReadError {
    /// Classify a client error, separating timeouts from other failures.
    pub fn from_client(err: anyhow::Error) -> Self {
        let timed_out = err
            .chain()
            .filter_map(|cause| cause.downcast_ref::<reqwest::Error>())
            .any(|e| e.is_timeout());

        if timed_out {
            Self::Timeout
        } else {
            Self::Service(format!("{:#}", err))
        }
    }
}

/// Async trait implemented by each register-reading backend.
#[async_trait::async_trait]
pub trait MarkReader: Send + Sync {
    fn name(&self) -> &str;
    async fn read_marks(&self, image: &ImagePayload) -> Result<DecodedRows, ReadError>;
}
