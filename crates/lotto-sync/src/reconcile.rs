//! Cross-source comparison of draws both providers returned.

use std::collections::BTreeMap;

use lotto_core::{DrawField, DrawId, DrawRecord, Divergence, DivergenceReport};

const COMPARED_FIELDS: [DrawField; 3] = [DrawField::Date, DrawField::Numbers, DrawField::Specials];

/// Compare every draw id present in both inputs. Pure; never resolves anything.
pub fn reconcile(primary: &[DrawRecord], secondary: &[DrawRecord]) -> DivergenceReport {
    let primary: BTreeMap<DrawId, &DrawRecord> = primary.iter().map(|r| (r.draw_id(), r)).collect();
    let secondary: BTreeMap<DrawId, &DrawRecord> =
        secondary.iter().map(|r| (r.draw_id(), r)).collect();

    let mut report = DivergenceReport::default();

    for (draw_id, a) in &primary {
        let Some(b) = secondary.get(draw_id) else {
            report.only_in_primary.push(*draw_id);
            continue;
        };
        for field in COMPARED_FIELDS {
            let (left, right) = (a.field_value(field), b.field_value(field));
            if left != right {
                report.divergences.push(Divergence {
                    draw_id: *draw_id,
                    field,
                    primary_value: left,
                    secondary_value: right,
                });
            }
        }
    }

    report.only_in_secondary = secondary
        .keys()
        .filter(|id| !primary.contains_key(id))
        .copied()
        .collect();
    report.divergences.sort();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotto_core::RawDrawRow;

    fn record(draw_id: i64, date: &str, numbers: &[i64], specials: &[i64]) -> DrawRecord {
        DrawRecord::try_from(RawDrawRow {
            draw_id,
            date: Some(date.into()),
            numbers: numbers.to_vec(),
            specials: specials.to_vec(),
        })
        .unwrap()
    }

    #[test]
    fn identical_sources_agree() {
        let a = vec![record(276, "2025-01-15", &[3, 7, 12, 19, 33, 50], &[1, 4])];
        let report = reconcile(&a, &a.clone());
        assert!(report.is_empty());
        assert!(report.only_in_primary.is_empty());
    }

    #[test]
    fn each_differing_field_is_one_divergence() {
        let a = vec![record(276, "2025-01-15", &[3, 7, 12, 19, 33, 50], &[1, 4])];
        let b = vec![record(276, "2025-01-16", &[3, 7, 12, 19, 33, 49], &[1, 4])];
        let report = reconcile(&a, &b);
        let fields: Vec<DrawField> = report.divergences.iter().map(|d| d.field).collect();
        assert_eq!(fields, vec![DrawField::Date, DrawField::Numbers]);
        assert_eq!(report.divergences[0].primary_value, "2025-01-15");
        assert_eq!(report.divergences[0].secondary_value, "2025-01-16");
    }

    #[test]
    fn reconciliation_is_symmetric() {
        let a = vec![
            record(10, "2025-01-01", &[1, 2, 3, 4, 5, 6], &[1, 2]),
            record(11, "2025-01-04", &[7, 8, 9, 10, 11, 12], &[3, 4]),
            record(12, "2025-01-08", &[1, 2, 3, 4, 5, 6], &[1, 2]),
        ];
        let b = vec![
            record(10, "2025-01-01", &[1, 2, 3, 4, 5, 7], &[1, 2]),
            record(11, "2025-01-04", &[7, 8, 9, 10, 11, 12], &[3, 5]),
            record(13, "2025-01-11", &[1, 2, 3, 4, 5, 6], &[1, 2]),
        ];

        let ab = reconcile(&a, &b);
        let ba = reconcile(&b, &a);

        let keys = |r: &DivergenceReport| -> Vec<(DrawId, DrawField)> {
            r.divergences.iter().map(|d| (d.draw_id, d.field)).collect()
        };
        assert_eq!(keys(&ab), keys(&ba));
        for (x, y) in ab.divergences.iter().zip(&ba.divergences) {
            assert_eq!(x.primary_value, y.secondary_value);
            assert_eq!(x.secondary_value, y.primary_value);
        }
        assert_eq!(ab.only_in_primary, ba.only_in_secondary);
        assert_eq!(ab.only_in_primary, vec![12]);
        assert_eq!(ab.only_in_secondary, vec![13]);
    }
}
