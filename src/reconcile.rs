//! Reconciliation pipeline orchestrator.
//!
//! Reads every photo through a [`MarkReader`], keeps rows that carry at least a
//! roll number and a name, merges repeats across photos, then validates and
//! matches the survivors against the caller's roster. One failing photo never
//! stops the others; everything that was merged, guessed or rejected is
//! reported back as text.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{FieldRules, ReconcileConfig};
use crate::dedup::{merge_duplicates, MergeOutcome};
use crate::matcher::RosterMatcher;
use crate::numerals::{format_roll_number, to_canonical_digits};
use crate::ocr::{DecodedRows, ImagePayload, MarkReader, RawCandidate, ReadError};
use crate::schema::{
    Confidence, ExtractedMark, MatchStatus, MatchedMark, ReconciledMarks, ReconciliationReport,
    RosterEntry,
};

pub struct Reconciler {
    reader: Arc<dyn MarkReader>,
    rules: FieldRules,
    matcher: RosterMatcher,
    max_concurrent_images: usize,
}

impl Reconciler {
    pub fn new(reader: Arc<dyn MarkReader>, config: &ReconcileConfig) -> Self {
        Self {
            reader,
            rules: config.rules.clone(),
            matcher: RosterMatcher::new(&config.matching),
            max_concurrent_images: config.max_concurrent_images.max(1),
        }
    }

    /// Reconcile all `images` into one report.
    ///
    /// With a roster, every merged record is validated and matched; without one,
    /// the merged records are returned as extracted.
    pub async fn reconcile(
        &self,
        images: &[ImagePayload],
        roster: Option<&[RosterEntry]>,
    ) -> ReconciliationReport {
        info!(
            "Starting reconciliation: {} image(s), roster={}, reader={}",
            images.len(),
            roster.map(|r| r.len().to_string()).unwrap_or_else(|| "none".to_string()),
            self.reader.name()
        );

        let mut report = ReconciliationReport::new(images.len());
        let notices = identical_image_notices(images);

        let mut candidates = Vec::new();
        let mut skipped_rows = Vec::new();
        for (i, outcome) in self.read_all(images).await.into_iter().enumerate() {
            let image_no = i + 1;
            match outcome {
                Ok(decoded) => {
                    if decoded.skipped > 0 {
                        skipped_rows.push(format!(
                            "Image {}: skipped {} unreadable row(s)",
                            image_no, decoded.skipped
                        ));
                    }
                    let found = decoded.len();
                    let usable = sanitize_candidates(decoded.rows, image_no);
                    info!("Image {}: {} of {} rows usable", image_no, usable.len(), found);
                    candidates.extend(usable);
                }
                Err(e) => {
                    warn!("Image {} failed: {}", image_no, e);
                    report
                        .processing_errors
                        .push(format!("Image {}: {}", image_no, e));
                }
            }
        }

        if candidates.is_empty() {
            report.warnings.extend(report.processing_errors.iter().cloned());
            report.warnings.extend(skipped_rows);
            report.warnings.extend(notices);
            report.warnings.push(format!(
                "No student records could be extracted from {} image(s)",
                images.len()
            ));
            warn!("Reconciliation {} produced no records", report.id);
            return report;
        }

        let MergeOutcome { merged, warnings } = merge_duplicates(&candidates);
        info!(
            "Merged {} rows into {} students ({} conflicts)",
            candidates.len(),
            merged.len(),
            warnings.len()
        );

        report.total_students_extracted = merged.len();
        report.extracted_marks = match roster {
            Some(roster) => ReconciledMarks::Matched(self.match_all(&merged, roster)),
            None => ReconciledMarks::Extracted(merged),
        };
        report.success = true;
        report.warnings = warnings;
        report.warnings.extend(report.processing_errors.iter().cloned());
        report.warnings.extend(skipped_rows);
        report.warnings.extend(notices);

        info!(
            "Reconciliation {} complete: {} students, {} warnings",
            report.id,
            report.extracted_marks.len(),
            report.warnings.len()
        );
        report
    }

    /// Read every image in input order, at most `max_concurrent_images` at a time.
    async fn read_all(
        &self,
        images: &[ImagePayload],
    ) -> Vec<Result<DecodedRows, ReadError>> {
        let total = images.len();

        // Reads are built up front as boxed futures; a closure returning an
        // `async` block here would make the handler future lose `Send`.
        let reads: Vec<_> = images
            .iter()
            .enumerate()
            .map(|(i, image)| {
                debug!("Queueing image {} of {} ({})", i + 1, total, image.filename);
                self.reader.read_marks(image)
            })
            .collect();

        stream::iter(reads)
            .buffered(self.max_concurrent_images)
            .collect()
            .await
    }

    fn match_all(&self, merged: &[ExtractedMark], roster: &[RosterEntry]) -> Vec<MatchedMark> {
        let matched: Vec<MatchedMark> = merged
            .iter()
            .map(|mark| self.match_one(mark, roster))
            .collect();

        let count = |status: MatchStatus| matched.iter().filter(|m| m.match_status == status).count();
        info!(
            "Roster matching: {} found, {} new, {} invalid",
            count(MatchStatus::Found),
            count(MatchStatus::New),
            count(MatchStatus::Error)
        );
        matched
    }

    fn match_one(&self, mark: &ExtractedMark, roster: &[RosterEntry]) -> MatchedMark {
        let roll = format_roll_number(&mark.roll_number);

        let errors = self.rules.validate_all(mark);
        if !errors.is_empty() {
            debug!("Roll {} failed validation: {:?}", roll, errors);
            let messages = errors.iter().map(ToString::to_string).collect();
            return MatchedMark::invalid(mark, roll, messages);
        }

        match self.matcher.match_student(mark, roster) {
            Some(found) => {
                debug!(
                    "Roll {} matched {} ({:?}, {:.2})",
                    roll, found.student.id, found.kind, found.confidence
                );
                MatchedMark::found(mark, roll, found.student.clone(), found.confidence)
            }
            None => MatchedMark::new_student(mark, roll),
        }
    }
}

/// Keep rows that have both a roll number and a name, coercing the rest.
fn sanitize_candidates(raw: Vec<RawCandidate>, image_no: usize) -> Vec<ExtractedMark> {
    raw.into_iter()
        .filter_map(|candidate| {
            let roll_number = candidate.roll_number.as_ref().and_then(text_field);
            let name = candidate.name.as_ref().and_then(text_field);
            let (Some(roll_number), Some(name)) = (roll_number, name) else {
                debug!("Image {}: dropping row without roll number or name", image_no);
                return None;
            };

            Some(ExtractedMark {
                roll_number,
                name,
                total_marks: coerce_marks(candidate.total_marks.as_ref()),
                confidence: candidate
                    .confidence
                    .as_ref()
                    .and_then(Value::as_str)
                    .and_then(Confidence::from_label)
                    .unwrap_or_default(),
                source_image: image_no,
            })
        })
        .collect()
}

/// Non-blank string, or a number rendered without a trailing `.0`.
fn text_field(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => n.as_f64().map(|f| f.to_string()),
        _ => None,
    }
}

/// Marks as a number; strings may use Bengali digits. Anything unparseable is 0.
fn coerce_marks(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => to_canonical_digits(s).trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|m| m.is_finite()).unwrap_or(0.0)
}

/// Flag uploads whose bytes exactly repeat an earlier image.
fn identical_image_notices(images: &[ImagePayload]) -> Vec<String> {
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    let mut notices = Vec::new();

    for (i, image) in images.iter().enumerate() {
        let image_no = i + 1;
        let digest = image.digest();
        match first_seen.get(&digest) {
            Some(&earlier) => {
                notices.push(format!("Image {} is identical to image {}", image_no, earlier))
            }
            None => {
                first_seen.insert(digest, image_no);
            }
        }
    }

    notices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchingConfig;
    use crate::ocr::decode_candidates;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const NO_STUDENTS: &[RosterEntry] = &[];

    enum Outcome {
        Rows(Value),
        Fail(&'static str),
        Timeout,
    }

    /// In-memory reader keyed by filename, recording call order and peak load.
    struct FakeReader {
        outcomes: HashMap<String, (Outcome, u64)>,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl FakeReader {
        fn new(outcomes: Vec<(&str, Outcome)>) -> Self {
            Self::with_delays(outcomes.into_iter().map(|(f, o)| (f, o, 0)).collect())
        }

        fn with_delays(outcomes: Vec<(&str, Outcome, u64)>) -> Self {
            Self {
                outcomes: outcomes
                    .into_iter()
                    .map(|(f, o, d)| (f.to_string(), (o, d)))
                    .collect(),
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl MarkReader for FakeReader {
        fn name(&self) -> &str {
            "fake"
        }

        async fn read_marks(&self, image: &ImagePayload) -> Result<DecodedRows, ReadError> {
            self.calls.lock().unwrap().push(image.filename.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            let (outcome, delay_ms) = self
                .outcomes
                .get(&image.filename)
                .expect("unexpected image");
            if *delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match outcome {
                Outcome::Rows(rows) => Ok(decode_candidates(&rows.to_string()).unwrap()),
                Outcome::Fail(msg) => Err(ReadError::Service(msg.to_string())),
                Outcome::Timeout => Err(ReadError::Timeout),
            }
        }
    }

    fn image(name: &str, seed: u8) -> ImagePayload {
        ImagePayload::new(name, Some("image/jpeg"), vec![seed, seed, seed])
    }

    fn reconciler(reader: FakeReader, config: &ReconcileConfig) -> Reconciler {
        Reconciler::new(Arc::new(reader), config)
    }

    fn roster_entry(id: &str, name: &str, roll: &str) -> RosterEntry {
        RosterEntry {
            id: id.to_string(),
            name: name.to_string(),
            roll_number: roll.to_string(),
        }
    }

    fn matched(report: &ReconciliationReport) -> &[MatchedMark] {
        match &report.extracted_marks {
            ReconciledMarks::Matched(marks) => marks,
            ReconciledMarks::Extracted(_) => panic!("expected matched marks"),
        }
    }

    fn extracted(report: &ReconciliationReport) -> &[ExtractedMark] {
        match &report.extracted_marks {
            ReconciledMarks::Extracted(marks) => marks,
            ReconciledMarks::Matched(_) => panic!("expected extracted marks"),
        }
    }

    #[tokio::test]
    async fn test_bengali_roll_new_student() {
        let reader = FakeReader::new(vec![(
            "p1.jpg",
            Outcome::Rows(json!([{"rollNumber": "০১", "name": "করিম", "totalMarks": 85}])),
        )]);
        let rec = reconciler(reader, &ReconcileConfig::default());

        let report = rec.reconcile(&[image("p1.jpg", 1)], Some(NO_STUDENTS)).await;

        assert!(report.success);
        let marks = matched(&report);
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].roll_number, "01");
        assert_eq!(marks[0].match_status, MatchStatus::New);
        assert_eq!(marks[0].match_confidence, None);
        assert_eq!(marks[0].confidence, Confidence::Medium);
        assert!(marks[0].validation_errors.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_roll_across_images_keeps_higher() {
        let reader = FakeReader::new(vec![
            (
                "p1.jpg",
                Outcome::Rows(json!([{"rollNumber": "02", "name": "Mita", "totalMarks": 60}])),
            ),
            (
                "p2.jpg",
                Outcome::Rows(json!([{"rollNumber": "02", "name": "Mita", "totalMarks": 75}])),
            ),
        ]);
        let rec = reconciler(reader, &ReconcileConfig::default());

        let report = rec
            .reconcile(&[image("p1.jpg", 1), image("p2.jpg", 2)], None)
            .await;

        let marks = extracted(&report);
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].total_marks, 75.0);
        assert_eq!(report.total_students_extracted, 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("02"));
        assert!(report.processing_errors.is_empty());
    }

    #[tokio::test]
    async fn test_exact_roll_match_found() {
        let reader = FakeReader::new(vec![(
            "p1.jpg",
            Outcome::Rows(json!([{"rollNumber": "5", "name": "Al", "totalMarks": 40}])),
        )]);
        let rec = reconciler(reader, &ReconcileConfig::default());
        let roster = vec![roster_entry("stu_5", "Alamgir Hossain", "05")];

        let report = rec.reconcile(&[image("p1.jpg", 1)], Some(roster.as_slice())).await;

        let marks = matched(&report);
        assert_eq!(marks[0].roll_number, "05");
        assert_eq!(marks[0].match_status, MatchStatus::Found);
        assert_eq!(marks[0].match_confidence, Some(1.0));
        assert_eq!(marks[0].student_id.as_deref(), Some("stu_5"));
        assert_eq!(marks[0].matched_student.as_ref(), Some(&roster[0]));
    }

    #[tokio::test]
    async fn test_invalid_record_reports_every_error() {
        let reader = FakeReader::new(vec![(
            "p1.jpg",
            Outcome::Rows(json!([{"rollNumber": "99", "name": "X", "totalMarks": 150}])),
        )]);
        let rec = reconciler(reader, &ReconcileConfig::default());
        let roster = vec![roster_entry("stu_99", "X", "99")];

        let report = rec.reconcile(&[image("p1.jpg", 1)], Some(roster.as_slice())).await;

        let marks = matched(&report);
        assert_eq!(marks[0].match_status, MatchStatus::Error);
        assert_eq!(marks[0].match_confidence, None);
        assert_eq!(marks[0].student_id, None);
        assert_eq!(marks[0].validation_errors.len(), 2);
        assert!(marks[0]
            .validation_errors
            .iter()
            .any(|e| e.contains("Marks 150 out of range")));
    }

    #[tokio::test]
    async fn test_failed_image_does_not_abort_run() {
        let reader = FakeReader::new(vec![
            ("p1.jpg", Outcome::Fail("OpenRouter API error (500): boom")),
            (
                "p2.jpg",
                Outcome::Rows(json!([{"rollNumber": "3", "name": "Rina", "totalMarks": 66}])),
            ),
        ]);
        let rec = reconciler(reader, &ReconcileConfig::default());

        let report = rec
            .reconcile(&[image("p1.jpg", 1), image("p2.jpg", 2)], Some(NO_STUDENTS))
            .await;

        assert!(report.success);
        assert_eq!(report.processing_errors.len(), 1);
        assert!(report.processing_errors[0].starts_with("Image 1:"));
        assert_eq!(matched(&report).len(), 1);
        assert_eq!(matched(&report)[0].source_image, 2);
        assert_eq!(report.warnings, report.processing_errors);
        assert_eq!(report.total_images_processed, 2);
    }

    #[tokio::test]
    async fn test_nothing_extracted_is_unsuccessful_report() {
        let reader = FakeReader::new(vec![
            ("p1.jpg", Outcome::Timeout),
            ("p2.jpg", Outcome::Rows(json!([{"name": "no roll"}]))),
        ]);
        let rec = reconciler(reader, &ReconcileConfig::default());

        let report = rec
            .reconcile(&[image("p1.jpg", 1), image("p2.jpg", 2)], Some(NO_STUDENTS))
            .await;

        assert!(!report.success);
        assert!(report.extracted_marks.is_empty());
        assert_eq!(report.total_students_extracted, 0);
        assert_eq!(
            report.processing_errors,
            vec!["Image 1: vision request timed out".to_string()]
        );
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings[1].contains("No student records"));
    }

    #[tokio::test]
    async fn test_no_images() {
        let rec = reconciler(FakeReader::new(vec![]), &ReconcileConfig::default());
        let report = rec.reconcile(&[], None).await;
        assert!(!report.success);
        assert_eq!(report.total_images_processed, 0);
        assert!(report.processing_errors.is_empty());
    }

    #[tokio::test]
    async fn test_candidates_are_sanitized() {
        let reader = FakeReader::new(vec![(
            "p1.jpg",
            Outcome::Rows(json!([
                {"rollNumber": "1", "name": "Rahim", "totalMarks": "৮৫", "confidence": "HIGH"},
                {"rollNumber": 2, "name": "Karim", "totalMarks": "absent"},
                {"rollNumber": "3", "name": ""},
                {"rollNumber": null, "name": "Nobody", "totalMarks": 10},
                {"roll": "4", "name": "Salma", "marks": 71.5, "confidence": "unsure"}
            ])),
        )]);
        let rec = reconciler(reader, &ReconcileConfig::default());

        let report = rec.reconcile(&[image("p1.jpg", 1)], None).await;

        let marks = extracted(&report);
        assert_eq!(marks.len(), 3);
        assert_eq!(marks[0].total_marks, 85.0);
        assert_eq!(marks[0].confidence, Confidence::High);
        assert_eq!(marks[1].roll_number, "02");
        assert_eq!(marks[1].total_marks, 0.0);
        assert_eq!(marks[1].confidence, Confidence::Medium);
        assert_eq!(marks[2].roll_number, "04");
        assert_eq!(marks[2].total_marks, 71.5);
    }

    #[tokio::test]
    async fn test_fuzzy_threshold_is_configurable() {
        let rows = json!([{"rollNumber": "40", "name": "rahim udin", "totalMarks": 50}]);
        let roster = vec![roster_entry("stu_1", "Rahim Uddin", "12")];

        let reader = FakeReader::new(vec![("p1.jpg", Outcome::Rows(rows.clone()))]);
        let report = reconciler(reader, &ReconcileConfig::default())
            .reconcile(&[image("p1.jpg", 1)], Some(roster.as_slice()))
            .await;
        assert_eq!(matched(&report)[0].match_status, MatchStatus::Found);
        assert!(matched(&report)[0].match_confidence.unwrap() < 1.0);

        let strict = ReconcileConfig {
            matching: MatchingConfig {
                similarity_threshold: 0.95,
            },
            ..ReconcileConfig::default()
        };
        let reader = FakeReader::new(vec![("p1.jpg", Outcome::Rows(rows))]);
        let report = reconciler(reader, &strict)
            .reconcile(&[image("p1.jpg", 1)], Some(roster.as_slice()))
            .await;
        assert_eq!(matched(&report)[0].match_status, MatchStatus::New);
    }

    #[tokio::test]
    async fn test_images_are_read_sequentially_in_order() {
        let reader = Arc::new(FakeReader::with_delays(vec![
            ("p1.jpg", Outcome::Rows(json!([])), 20),
            ("p2.jpg", Outcome::Rows(json!([])), 0),
            ("p3.jpg", Outcome::Rows(json!([])), 5),
        ]));
        let rec = Reconciler::new(reader.clone(), &ReconcileConfig::default());

        rec.reconcile(
            &[image("p1.jpg", 1), image("p2.jpg", 2), image("p3.jpg", 3)],
            None,
        )
        .await;

        assert_eq!(*reader.calls.lock().unwrap(), vec!["p1.jpg", "p2.jpg", "p3.jpg"]);
        assert_eq!(reader.peak_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bounded_concurrency_keeps_attribution() {
        let reader = FakeReader::with_delays(vec![
            ("p1.jpg", Outcome::Fail("slow failure"), 30),
            (
                "p2.jpg",
                Outcome::Rows(json!([{"rollNumber": "8", "name": "Tania", "totalMarks": 90}])),
                0,
            ),
            (
                "p3.jpg",
                Outcome::Rows(json!([{"rollNumber": "8", "name": "Tania", "totalMarks": 92}])),
                10,
            ),
        ]);
        let config = ReconcileConfig {
            max_concurrent_images: 3,
            ..ReconcileConfig::default()
        };
        let reader = Arc::new(reader);

        let report = Reconciler::new(reader.clone(), &config)
            .reconcile(
                &[image("p1.jpg", 1), image("p2.jpg", 2), image("p3.jpg", 3)],
                None,
            )
            .await;

        assert_eq!(report.processing_errors.len(), 1);
        assert!(report.processing_errors[0].starts_with("Image 1:"));
        let marks = extracted(&report);
        assert_eq!(marks[0].total_marks, 92.0);
        assert_eq!(marks[0].source_image, 3);
        assert!(report.warnings[0].contains("images 2 and 3"));
        assert!(reader.peak_in_flight.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_identical_images_are_flagged() {
        let rows = json!([{"rollNumber": "1", "name": "Rahim", "totalMarks": 80}]);
        let reader = FakeReader::new(vec![
            ("p1.jpg", Outcome::Rows(rows.clone())),
            ("p1-again.jpg", Outcome::Rows(rows)),
        ]);
        let rec = reconciler(reader, &ReconcileConfig::default());

        let report = rec
            .reconcile(&[image("p1.jpg", 7), image("p1-again.jpg", 7)], None)
            .await;

        assert_eq!(extracted(&report).len(), 1);
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(report.warnings[1], "Image 2 is identical to image 1");
    }

    #[tokio::test]
    async fn test_unreadable_rows_are_reported() {
        let reader = FakeReader::new(vec![(
            "p1.jpg",
            Outcome::Rows(json!([
                {"rollNumber": "5", "roll": "5", "name": "Al", "totalMarks": 40},
                "row 6 smudged",
                null
            ])),
        )]);
        let rec = reconciler(reader, &ReconcileConfig::default());

        let report = rec.reconcile(&[image("p1.jpg", 1)], None).await;

        assert!(report.success);
        assert_eq!(extracted(&report).len(), 1);
        assert_eq!(extracted(&report)[0].roll_number, "05");
        assert!(report.processing_errors.is_empty());
        assert_eq!(
            report.warnings,
            vec!["Image 1: skipped 2 unreadable row(s)".to_string()]
        );
    }

    fn assert_send<T: Send>(_: T) {}

    #[test]
    fn test_reconcile_future_is_send() {
        let rec = reconciler(FakeReader::new(vec![]), &ReconcileConfig::default());
        let images = vec![image("p1.jpg", 1)];
        let roster = vec![roster_entry("stu_1", "Rahim", "01")];

        // Mirrors the HTTP handler, which owns both and awaits across the call.
        assert_send(async move { rec.reconcile(&images, Some(roster.as_slice())).await });
    }

    #[test]
    fn test_text_field_renders_numbers_without_fraction() {
        assert_eq!(text_field(&json!(5)), Some("5".to_string()));
        assert_eq!(text_field(&json!(5.0)), Some("5".to_string()));
        assert_eq!(text_field(&json!("  ")), None);
        assert_eq!(text_field(&json!(true)), None);
    }

    #[test]
    fn test_coerce_marks() {
        assert_eq!(coerce_marks(Some(&json!(" ৯০ "))), 90.0);
        assert_eq!(coerce_marks(Some(&json!("88.5"))), 88.5);
        assert_eq!(coerce_marks(Some(&json!("NaN"))), 0.0);
        assert_eq!(coerce_marks(Some(&json!([1]))), 0.0);
        assert_eq!(coerce_marks(None), 0.0);
    }
}
