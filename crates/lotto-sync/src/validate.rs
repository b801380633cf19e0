//! Batch-atomic validation of raw provider rows.

use std::collections::BTreeMap;

use lotto_core::{DrawId, DrawRecord, RawDrawRow, RowDefect};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationReason {
    #[error(transparent)]
    Row(#[from] RowDefect),
    #[error("draw id {0} appears more than once in the batch")]
    DuplicateDrawId(DrawId),
}

/// The first row that failed; the whole batch is rejected with it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("row {}: {reason}", .offending_row.draw_id)]
pub struct ValidationError {
    pub reason: ValidationReason,
    pub offending_row: RawDrawRow,
}

/// Rows that passed every check, sorted by draw id, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedBatch {
    records: Vec<DrawRecord>,
}

impl ValidatedBatch {
    pub fn records(&self) -> &[DrawRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<DrawRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> Vec<DrawId> {
        self.records.iter().map(DrawRecord::draw_id).collect()
    }

    pub fn max_draw_id(&self) -> Option<DrawId> {
        self.records.last().map(DrawRecord::draw_id)
    }
}

/// Accept all rows or none.
pub fn validate(rows: Vec<RawDrawRow>) -> Result<ValidatedBatch, ValidationError> {
    let mut by_id: BTreeMap<DrawId, DrawRecord> = BTreeMap::new();
    for row in rows {
        let record = match DrawRecord::try_from(&row) {
            Ok(record) => record,
            Err(defect) => {
                return Err(ValidationError {
                    reason: defect.into(),
                    offending_row: row,
                })
            }
        };
        if by_id.contains_key(&record.draw_id()) {
            return Err(ValidationError {
                reason: ValidationReason::DuplicateDrawId(record.draw_id()),
                offending_row: row,
            });
        }
        by_id.insert(record.draw_id(), record);
    }
    Ok(ValidatedBatch {
        records: by_id.into_values().collect(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditFinding {
    pub draw_id: i64,
    pub problem: String,
}

/// Run the same checks over a whole table and report every violation,
/// including gaps in the id sequence.
pub fn audit(rows: &[RawDrawRow]) -> Vec<AuditFinding> {
    let mut findings = Vec::new();
    let mut seen: BTreeMap<i64, usize> = BTreeMap::new();

    for row in rows {
        *seen.entry(row.draw_id).or_default() += 1;
        if let Err(defect) = DrawRecord::try_from(row) {
            findings.push(AuditFinding {
                draw_id: row.draw_id,
                problem: defect.to_string(),
            });
        }
    }

    for (&draw_id, &count) in &seen {
        if count > 1 {
            findings.push(AuditFinding {
                draw_id,
                problem: format!("stored {count} times"),
            });
        }
    }

    let ids: Vec<i64> = seen.keys().copied().filter(|id| *id > 0).collect();
    for pair in ids.windows(2) {
        if pair[1] - pair[0] > 1 {
            findings.push(AuditFinding {
                draw_id: pair[0] + 1,
                problem: format!("gap: draws {}..={} missing", pair[0] + 1, pair[1] - 1),
            });
        }
    }

    findings.sort_by(|a, b| a.draw_id.cmp(&b.draw_id).then_with(|| a.problem.cmp(&b.problem)));
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotto_core::DrawField;

    fn row(draw_id: i64, numbers: &[i64], specials: &[i64]) -> RawDrawRow {
        RawDrawRow {
            draw_id,
            date: Some("2025-01-15".into()),
            numbers: numbers.to_vec(),
            specials: specials.to_vec(),
        }
    }

    #[test]
    fn valid_batch_is_sorted_by_draw_id() {
        let batch = validate(vec![
            row(277, &[1, 2, 3, 4, 5, 6], &[1, 2]),
            row(276, &[3, 7, 12, 19, 33, 50], &[1, 4]),
        ])
        .unwrap();
        assert_eq!(batch.ids(), vec![276, 277]);
        assert_eq!(batch.max_draw_id(), Some(277));
    }

    #[test]
    fn a_seventh_number_rejects_the_whole_batch() {
        let bad = row(278, &[1, 2, 3, 4, 5, 6, 7], &[1, 2]);
        let err = validate(vec![row(277, &[1, 2, 3, 4, 5, 6], &[1, 2]), bad.clone()]).unwrap_err();
        assert_eq!(err.offending_row, bad);
        assert_eq!(
            err.reason,
            ValidationReason::Row(RowDefect::WrongCount {
                field: DrawField::Numbers,
                expected: 6,
                found: 7
            })
        );
    }

    #[test]
    fn special_out_of_range_is_rejected() {
        let err = validate(vec![row(10, &[1, 2, 3, 4, 5, 6], &[1, 7])]).unwrap_err();
        assert!(matches!(
            err.reason,
            ValidationReason::Row(RowDefect::OutOfRange {
                field: DrawField::Specials,
                value: 7,
                ..
            })
        ));
    }

    #[test]
    fn duplicate_ids_in_one_batch_are_rejected() {
        let err = validate(vec![
            row(10, &[1, 2, 3, 4, 5, 6], &[1, 2]),
            row(10, &[1, 2, 3, 4, 5, 6], &[1, 2]),
        ])
        .unwrap_err();
        assert_eq!(err.reason, ValidationReason::DuplicateDrawId(10));
    }

    #[test]
    fn missing_and_impossible_dates_are_rejected() {
        let mut no_date = row(1, &[1, 2, 3, 4, 5, 6], &[1, 2]);
        no_date.date = None;
        assert_eq!(
            validate(vec![no_date]).unwrap_err().reason,
            ValidationReason::Row(RowDefect::MissingDate)
        );

        let mut feb30 = row(2, &[1, 2, 3, 4, 5, 6], &[1, 2]);
        feb30.date = Some("2025-02-30".into());
        assert!(matches!(
            validate(vec![feb30]).unwrap_err().reason,
            ValidationReason::Row(RowDefect::InvalidDate(_))
        ));
    }

    #[test]
    fn empty_batch_is_valid() {
        assert!(validate(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn audit_reports_every_problem() {
        let rows = vec![
            row(1, &[1, 2, 3, 4, 5, 6], &[1, 2]),
            row(2, &[1, 1, 3, 4, 5, 6], &[1, 2]),
            row(5, &[1, 2, 3, 4, 5, 6], &[1, 9]),
        ];
        let findings = audit(&rows);
        let ids: Vec<i64> = findings.iter().map(|f| f.draw_id).collect();
        assert_eq!(ids, vec![2, 3, 5]);
        assert!(findings[1].problem.contains("gap"));
    }

    #[test]
    fn clean_table_has_no_findings() {
        let rows = vec![
            row(1, &[1, 2, 3, 4, 5, 6], &[1, 2]),
            row(2, &[7, 8, 9, 10, 11, 12], &[3, 4]),
        ];
        assert!(audit(&rows).is_empty());
    }
}
