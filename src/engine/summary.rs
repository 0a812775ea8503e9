use std::collections::BTreeMap;

use crate::model::{FailureModeShare, LotDistribution, YieldTable};

use super::mean;

/// Sum of each fail column across rows, largest first.
pub fn failure_mode_contribution(table: &YieldTable) -> Vec<FailureModeShare> {
    let mut shares: Vec<FailureModeShare> = table
        .fail_labels
        .iter()
        .map(|label| FailureModeShare {
            label: label.clone(),
            total: table.rows.iter().filter_map(|row| row.fail_rate(label)).sum(),
        })
        .collect();

    shares.sort_by(|left, right| {
        right
            .total
            .total_cmp(&left.total)
            .then_with(|| left.label.cmp(&right.label))
    });
    shares
}

/// Pass rate spread per lot, over rows where the pass rate is defined.
pub fn lot_distribution(table: &YieldTable) -> Vec<LotDistribution> {
    let mut lots: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for row in &table.rows {
        if let Some(pass_rate) = row.pass_rate.filter(|value| value.is_finite()) {
            lots.entry(row.lot_id.as_str()).or_default().push(pass_rate);
        }
    }

    lots.into_iter()
        .filter_map(|(lot_id, mut values)| {
            values.sort_by(f64::total_cmp);
            let middle = values.len() / 2;
            let median = if values.len() % 2 == 0 {
                (values.get(middle.checked_sub(1)?)? + values.get(middle)?) / 2.0
            } else {
                *values.get(middle)?
            };

            Some(LotDistribution {
                lot_id: lot_id.to_string(),
                wafers: values.len(),
                min: *values.first()?,
                median,
                mean: mean(values.iter().copied())?,
                max: *values.last()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::{RateBasis, Stage, YieldRecord};

    fn row(lot: &str, pass: Option<f64>, open: f64, short: f64) -> YieldRecord {
        YieldRecord {
            product: "SCP117A".to_string(),
            bulk_id: None,
            lot_id: lot.to_string(),
            wafer_id: None,
            time: None,
            stage: Stage::Cp,
            basis: RateBasis::Percent,
            effective_count: Some(100.0),
            pass_rate: pass,
            fail_rates: BTreeMap::from([
                ("02_OPEN".to_string(), Some(open)),
                ("03_SHORT".to_string(), Some(short)),
            ]),
        }
    }

    fn table(rows: Vec<YieldRecord>) -> YieldTable {
        let mut table = YieldTable::empty(Stage::Cp);
        table.fail_labels = vec!["02_OPEN".to_string(), "03_SHORT".to_string()];
        table.rows = rows;
        table
    }

    #[test]
    fn failure_modes_sorted_by_total() {
        let shares = failure_mode_contribution(&table(vec![
            row("L1", Some(95.0), 1.0, 4.0),
            row("L1", Some(96.0), 2.0, 2.0),
        ]));
        assert_eq!(shares[0].label, "03_SHORT");
        assert_eq!(shares[0].total, 6.0);
        assert_eq!(shares[1].total, 3.0);
    }

    #[test]
    fn lot_distribution_summarises_defined_pass_rates() {
        let distribution = lot_distribution(&table(vec![
            row("L2", Some(90.0), 0.0, 0.0),
            row("L1", Some(98.0), 0.0, 0.0),
            row("L1", Some(94.0), 0.0, 0.0),
            row("L1", None, 0.0, 0.0),
            row("L1", Some(96.0), 0.0, 0.0),
        ]));

        assert_eq!(distribution.len(), 2);
        let l1 = &distribution[0];
        assert_eq!(l1.lot_id, "L1");
        assert_eq!(l1.wafers, 3);
        assert_eq!((l1.min, l1.median, l1.max), (94.0, 96.0, 98.0));
        assert_eq!(l1.mean, 96.0);
        assert_eq!(distribution[1].median, 90.0);
    }

    #[test]
    fn even_sized_lot_uses_midpoint_median() {
        let distribution = lot_distribution(&table(vec![
            row("L1", Some(90.0), 0.0, 0.0),
            row("L1", Some(94.0), 0.0, 0.0),
        ]));
        assert_eq!(distribution[0].median, 92.0);
    }
}
