//! Cross-image deduplication.
//!
//! The same register page is often photographed twice, or a long register is
//! split over overlapping photos. Records sharing a canonical roll number are
//! merged into one, keeping the higher mark.

use std::collections::HashMap;

use tracing::debug;

use crate::numerals::format_roll_number;
use crate::schema::ExtractedMark;

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// One record per canonical roll number, in first-seen order.
    pub merged: Vec<ExtractedMark>,
    pub warnings: Vec<String>,
}

/// Merge records that share a roll number.
///
/// On a repeat, the strictly higher `total_marks` wins and ties keep the record
/// seen first. Every repeat adds one warning naming the roll and the kept mark.
pub fn merge_duplicates(records: &[ExtractedMark]) -> MergeOutcome {
    let mut merged: Vec<ExtractedMark> = Vec::new();
    let mut index_by_roll: HashMap<String, usize> = HashMap::new();
    let mut warnings = Vec::new();

    for record in records {
        let roll = format_roll_number(&record.roll_number);

        match index_by_roll.get(&roll) {
            Some(&idx) => {
                let existing = &merged[idx];
                let replaced = record.total_marks > existing.total_marks;
                let kept = if replaced {
                    record.with_roll_number(roll.clone())
                } else {
                    existing.clone()
                };

                let location = if existing.source_image == record.source_image {
                    format!("in image {}", record.source_image)
                } else {
                    format!("(images {} and {})", existing.source_image, record.source_image)
                };
                debug!("Duplicate roll {} {}, keeping {}", roll, location, kept.total_marks);
                warnings.push(format!(
                    "Roll {} appears more than once {}; kept the higher mark ({})",
                    roll, location, kept.total_marks
                ));
                merged[idx] = kept;
            }
            None => {
                index_by_roll.insert(roll.clone(), merged.len());
                merged.push(record.with_roll_number(roll));
            }
        }
    }

    MergeOutcome { merged, warnings }
}
