//! Reconciliation configuration.
//!
//! Loaded from a JSON file (`configs/reconcile.json` by default). Every field has
//! a default, so a partial file or no file at all still yields a usable config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Top-level configuration for a reconciliation service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub prompts: Prompts,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub rules: FieldRules,
    /// Vision calls allowed in flight at once. 1 keeps processing strictly sequential.
    #[serde(default = "default_concurrency")]
    pub max_concurrent_images: usize,
    /// Per-image timeout applied to the vision HTTP client.
    #[serde(default = "default_ocr_timeout")]
    pub ocr_timeout_secs: u64,
    /// Upper bound for one multipart upload (all images plus roster).
    #[serde(default = "default_max_upload")]
    pub max_upload_bytes: usize,
}

/// Roster matching knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Minimum name similarity for a fuzzy roster match (inclusive).
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f64,
}

/// Domain bounds for extracted fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRules {
    #[serde(default = "default_roll_min")]
    pub roll_min: u32,
    #[serde(default = "default_roll_max")]
    pub roll_max: u32,
    #[serde(default = "default_name_min_chars")]
    pub name_min_chars: usize,
    #[serde(default = "default_marks_min")]
    pub marks_min: f64,
    #[serde(default = "default_marks_max")]
    pub marks_max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompts {
    /// Instructions sent with every register photo.
    #[serde(default = "default_extraction_prompt")]
    pub extraction: String,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_ocr_timeout() -> u64 {
    60
}

fn default_max_upload() -> usize {
    25 * 1024 * 1024
}

fn default_threshold() -> f64 {
    0.8
}

fn default_roll_min() -> u32 {
    1
}

fn default_roll_max() -> u32 {
    99
}

fn default_name_min_chars() -> usize {
    2
}

fn default_marks_min() -> f64 {
    0.0
}

fn default_marks_max() -> f64 {
    100.0
}

fn default_extraction_prompt() -> String {
    r#"You are reading a photo of a handwritten school marks register (khata).
Each row lists one student: a roll number, the student's name (usually in Bengali) and the total marks.
Numbers may be written with Bengali digits (০-৯) or ASCII digits; copy them exactly as written.

Return ONLY a JSON array, one object per student row:
[
  {
    "rollNumber": "roll number exactly as written",
    "name": "student name exactly as written",
    "totalMarks": 0,
    "confidence": "high|medium|low"
  }
]

Rules:
- Do not invent rows. Skip rows you cannot read at all.
- Use "low" confidence for any row with a doubtful digit or name.
- If the photo contains no register rows, return []."#
        .to_string()
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_threshold(),
        }
    }
}

impl Default for FieldRules {
    fn default() -> Self {
        Self {
            roll_min: default_roll_min(),
            roll_max: default_roll_max(),
            name_min_chars: default_name_min_chars(),
            marks_min: default_marks_min(),
            marks_max: default_marks_max(),
        }
    }
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            extraction: default_extraction_prompt(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            prompts: Prompts::default(),
            matching: MatchingConfig::default(),
            rules: FieldRules::default(),
            max_concurrent_images: default_concurrency(),
            ocr_timeout_secs: default_ocr_timeout(),
            max_upload_bytes: default_max_upload(),
        }
    }
}

impl ReconcileConfig {
    /// Load a config file. A missing file falls back to defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config = Self::from_json(&content)
            .with_context(|| format!("Failed to load config: {:?}", path))?;

        info!("Loaded config: {} from {:?}", config.name, path);
        Ok(config)
    }

    /// Parse and validate a config from JSON text.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs whose bounds cannot be satisfied.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.matching.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            anyhow::bail!("similarity_threshold must be within [0, 1], got {}", threshold);
        }
        if self.rules.roll_min == 0 {
            anyhow::bail!("roll_min must be at least 1; roll number 00 is never valid");
        }
        if self.rules.roll_min > self.rules.roll_max {
            anyhow::bail!(
                "roll_min ({}) exceeds roll_max ({})",
                self.rules.roll_min,
                self.rules.roll_max
            );
        }
        if self.rules.roll_max > 99 {
            anyhow::bail!("roll_max ({}) exceeds two digits", self.rules.roll_max);
        }
        if !(self.rules.marks_min <= self.rules.marks_max) {
            anyhow::bail!(
                "marks_min ({}) exceeds marks_max ({})",
                self.rules.marks_min,
                self.rules.marks_max
            );
        }
        if self.max_concurrent_images == 0 {
            anyhow::bail!("max_concurrent_images must be at least 1");
        }
        if self.ocr_timeout_secs == 0 {
            anyhow::bail!("ocr_timeout_secs must be at least 1");
        }
        Ok(())
    }
}
