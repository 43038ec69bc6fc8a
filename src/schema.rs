//! Marks-register data model.
//!
//! Field names serialize as camelCase to match the portal's JSON contract.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Self-reported reading confidence from the vision model. Informational only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    #[default]
    Medium,
    Low,
}

impl Confidence {
    /// Parse a model-provided label, case-insensitively.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// One candidate record for one student, read from one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedMark {
    pub roll_number: String,
    pub name: String,
    pub total_marks: f64,
    pub confidence: Confidence,
    /// 1-based index of the image this record was read from.
    pub source_image: usize,
}

impl ExtractedMark {
    /// Copy of this record carrying a different roll number.
    pub fn with_roll_number(&self, roll_number: String) -> Self {
        Self {
            roll_number,
            ..self.clone()
        }
    }
}

/// An existing student supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub id: String,
    pub name: String,
    pub roll_number: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    /// Matched an existing roster entry.
    Found,
    /// No roster match; treat as a new student.
    New,
    /// Failed validation; must be fixed before matching or saving.
    Error,
}

/// Pipeline output unit, one per unique canonical roll number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedMark {
    pub roll_number: String,
    pub name: String,
    pub total_marks: f64,
    pub confidence: Confidence,
    pub source_image: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_student: Option<RosterEntry>,
    pub match_status: MatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_confidence: Option<f64>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
}

impl MatchedMark {
    fn from_extracted(mark: &ExtractedMark, roll_number: String, status: MatchStatus) -> Self {
        Self {
            roll_number,
            name: mark.name.clone(),
            total_marks: mark.total_marks,
            confidence: mark.confidence,
            source_image: mark.source_image,
            student_id: None,
            matched_student: None,
            match_status: status,
            match_confidence: None,
            validation_errors: Vec::new(),
        }
    }

    /// A record that matched `student` with the given confidence.
    pub fn found(
        mark: &ExtractedMark,
        roll_number: String,
        student: RosterEntry,
        confidence: f64,
    ) -> Self {
        let mut matched = Self::from_extracted(mark, roll_number, MatchStatus::Found);
        matched.student_id = Some(student.id.clone());
        matched.matched_student = Some(student);
        matched.match_confidence = Some(confidence);
        matched
    }

    /// A valid record with no roster counterpart.
    pub fn new_student(mark: &ExtractedMark, roll_number: String) -> Self {
        Self::from_extracted(mark, roll_number, MatchStatus::New)
    }

    /// A record that failed validation.
    pub fn invalid(mark: &ExtractedMark, roll_number: String, errors: Vec<String>) -> Self {
        let mut matched = Self::from_extracted(mark, roll_number, MatchStatus::Error);
        matched.validation_errors = errors;
        matched
    }
}

/// Reconciled records: matched against a roster, or merged only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReconciledMarks {
    Matched(Vec<MatchedMark>),
    Extracted(Vec<ExtractedMark>),
}

impl ReconciledMarks {
    pub fn len(&self) -> usize {
        match self {
            Self::Matched(marks) => marks.len(),
            Self::Extracted(marks) => marks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Final artifact of one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub id: String,
    pub success: bool,
    pub extracted_marks: ReconciledMarks,
    /// Every diagnostic, in order: merge conflicts, per-image failures, skipped
    /// rows, identical-image notices, and a closing "No student records" line
    /// when nothing was extracted.
    pub warnings: Vec<String>,
    /// Per-image failures only.
    pub processing_errors: Vec<String>,
    pub total_images_processed: usize,
    pub total_students_extracted: usize,
}

impl ReconciliationReport {
    pub fn new(total_images_processed: usize) -> Self {
        Self {
            id: format!("rec_{}", Uuid::new_v4().simple()),
            success: false,
            extracted_marks: ReconciledMarks::Extracted(Vec::new()),
            warnings: Vec::new(),
            processing_errors: Vec::new(),
            total_images_processed,
            total_students_extracted: 0,
        }
    }
}
