//! Field validators for extracted register rows.
//!
//! Each check is independent so a caller can run all of them and report every
//! problem with a record at once.

use crate::config::FieldRules;
use crate::numerals::format_roll_number;
use crate::schema::ExtractedMark;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid roll number '{raw}': must be a two-digit number between {min:02} and {max:02}")]
    RollNumber { raw: String, min: u32, max: u32 },
    #[error("Student name '{name}' is too short: at least {min} characters required")]
    Name { name: String, min: usize },
    #[error("Marks must be a number")]
    MarksNotNumeric,
    #[error("Marks {value} out of range: must be between {min} and {max}")]
    MarksOutOfRange { value: f64, min: f64, max: f64 },
}

impl FieldRules {
    /// Validate a raw roll number, returning its canonical two-digit form.
    pub fn validate_roll_number(&self, raw: &str) -> Result<String, ValidationError> {
        let formatted = format_roll_number(raw);
        let in_range = formatted.len() == 2
            && formatted
                .parse::<u32>()
                .map(|n| n >= self.roll_min && n <= self.roll_max)
                .unwrap_or(false);

        if in_range {
            Ok(formatted)
        } else {
            Err(ValidationError::RollNumber {
                raw: raw.to_string(),
                min: self.roll_min,
                max: self.roll_max,
            })
        }
    }

    pub fn validate_name(&self, name: &str) -> Result<(), ValidationError> {
        if name.trim().chars().count() >= self.name_min_chars {
            Ok(())
        } else {
            Err(ValidationError::Name {
                name: name.to_string(),
                min: self.name_min_chars,
            })
        }
    }

    /// Out-of-range marks are rejected, never clamped.
    pub fn validate_marks(&self, marks: f64) -> Result<(), ValidationError> {
        if !marks.is_finite() {
            return Err(ValidationError::MarksNotNumeric);
        }
        if marks < self.marks_min || marks > self.marks_max {
            return Err(ValidationError::MarksOutOfRange {
                value: marks,
                min: self.marks_min,
                max: self.marks_max,
            });
        }
        Ok(())
    }

    /// Run every check and collect all failures.
    pub fn validate_all(&self, mark: &ExtractedMark) -> Vec<ValidationError> {
        [
            self.validate_roll_number(&mark.roll_number).err(),
            self.validate_name(&mark.name).err(),
            self.validate_marks(mark.total_marks).err(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}
