//! Roster matching: exact roll number first, fuzzy name second.

use crate::config::MatchingConfig;
use crate::numerals::format_roll_number;
use crate::schema::{ExtractedMark, RosterEntry};
use crate::similarity::similarity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    RollNumber,
    Name,
}

/// A roster entry selected for an extracted record.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterMatch<'a> {
    pub student: &'a RosterEntry,
    pub confidence: f64,
    pub kind: MatchKind,
}

pub struct RosterMatcher {
    similarity_threshold: f64,
}

impl RosterMatcher {
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
        }
    }

    /// Find the roster entry for `mark`, or `None` when it looks like a new student.
    ///
    /// An exact roll-number match always wins with confidence 1.0. Otherwise the
    /// most similar name at or above the threshold is taken; on ties the entry
    /// seen first in the roster wins.
    pub fn match_student<'a>(
        &self,
        mark: &ExtractedMark,
        roster: &'a [RosterEntry],
    ) -> Option<RosterMatch<'a>> {
        let roll = format_roll_number(&mark.roll_number);
        if let Some(student) = roster.iter().find(|s| s.roll_number == roll) {
            return Some(RosterMatch {
                student,
                confidence: 1.0,
                kind: MatchKind::RollNumber,
            });
        }

        let mut best: Option<(&RosterEntry, f64)> = None;
        for student in roster {
            let score = similarity(&mark.name, &student.name);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((student, score));
            }
        }

        best.filter(|(_, score)| *score >= self.similarity_threshold)
            .map(|(student, confidence)| RosterMatch {
                student,
                confidence,
                kind: MatchKind::Name,
            })
    }
}
