use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::model::{
    CountMode, RateBasis, RawBinRecord, Stage, YieldPivotQuality, YieldRecord, YieldTable,
};

use super::bin_label::BinLabels;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct UnitKey {
    product: String,
    bulk_id: Option<String>,
    lot_id: String,
    wafer_id: Option<String>,
    time: Option<String>,
}

impl UnitKey {
    fn of(record: &RawBinRecord) -> Self {
        Self {
            product: record.product.clone(),
            bulk_id: record.bulk_id.clone(),
            lot_id: record.lot_id.clone(),
            wafer_id: record.wafer_id.clone(),
            time: record.time.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct UnitCounts {
    by_code: BTreeMap<u32, u64>,
    effective_count: Option<f64>,
}

fn detect_count_mode(records: &[&RawBinRecord]) -> Option<CountMode> {
    let with_count = records.iter().filter(|r| r.bin_count.is_some()).count();
    match (with_count, records.len()) {
        (_, 0) => None,
        (0, _) => Some(CountMode::PerDie),
        (with, total) if with == total => Some(CountMode::PreAggregated),
        _ => Some(CountMode::Mixed),
    }
}

/// Converts long bin records for one stage into one wide row per unit.
///
/// Counts come from `bin_count` when the source is pre-aggregated and from
/// row multiplicity when it is per-die. Rows with a known effective count
/// are scaled to percentages; a zero effective count leaves every rate
/// undefined, and a missing one keeps raw counts with `RateBasis::Count`.
pub fn pivot_yield(records: &[RawBinRecord], stage: Stage, pass_code: u32) -> YieldTable {
    let selected: Vec<&RawBinRecord> = records.iter().filter(|r| r.stage == stage).collect();
    let skipped_other_stage = records.len() - selected.len();
    if skipped_other_stage > 0 {
        debug!(
            stage = %stage,
            skipped = skipped_other_stage,
            "ignored bin records from another stage"
        );
    }

    if selected.is_empty() {
        let mut table = YieldTable::empty(stage);
        table.quality.skipped_other_stage = skipped_other_stage;
        return table;
    }

    let source_mode = detect_count_mode(&selected);
    if source_mode == Some(CountMode::Mixed) {
        warn!(
            stage = %stage,
            "bin records mix per-die rows and pre-aggregated counts"
        );
    }

    let labels = BinLabels::resolve(
        selected
            .iter()
            .map(|record| (record.bin_code, record.bin_name.as_deref())),
        pass_code,
    );

    let mut quality = YieldPivotQuality {
        skipped_other_stage,
        duplicate_bin_names: labels.duplicate_names(),
        ..YieldPivotQuality::default()
    };

    let mut units: BTreeMap<UnitKey, UnitCounts> = BTreeMap::new();
    for record in &selected {
        let unit = units.entry(UnitKey::of(record)).or_default();
        let count = unit.by_code.entry(record.bin_code).or_insert(0);
        *count = count.saturating_add(record.bin_count.unwrap_or(1));

        match (unit.effective_count, record.effective_count) {
            (None, Some(observed)) => unit.effective_count = Some(observed),
            (Some(kept), Some(observed)) if kept != observed => {
                quality.conflicting_effective_counts += 1;
                warn!(
                    lot_id = %record.lot_id,
                    wafer_id = %record.wafer_id.as_deref().unwrap_or_default(),
                    kept,
                    observed,
                    "conflicting effective counts within one unit; keeping first seen"
                );
            }
            _ => {}
        }
    }

    let pass_label = labels.pass_label().map(ToOwned::to_owned);
    let fail_codes = labels.fail_bins();

    let rows: Vec<YieldRecord> = units
        .into_iter()
        .map(|(key, unit)| {
            let (basis, scale) = match unit.effective_count {
                Some(denominator) if denominator.is_finite() && denominator > 0.0 => {
                    (RateBasis::Percent, Some(100.0 / denominator))
                }
                Some(_) => {
                    quality.undefined_denominators += 1;
                    (RateBasis::Percent, None)
                }
                None => {
                    quality.count_based_rows += 1;
                    (RateBasis::Count, Some(1.0))
                }
            };
            let value_of = |code: u32| {
                let count = unit.by_code.get(&code).copied().unwrap_or(0) as f64;
                scale.map(|factor| count * factor)
            };

            let pass_rate = pass_label.as_ref().and_then(|_| value_of(labels.pass_code()));
            let fail_rates = fail_codes
                .iter()
                .map(|(code, label)| (label.clone(), value_of(*code)))
                .collect();

            YieldRecord {
                product: key.product,
                bulk_id: key.bulk_id,
                lot_id: key.lot_id,
                wafer_id: key.wafer_id,
                time: key.time,
                stage,
                basis,
                effective_count: unit.effective_count,
                pass_rate,
                fail_rates,
            }
        })
        .collect();

    if quality.undefined_denominators > 0 {
        warn!(
            stage = %stage,
            units = quality.undefined_denominators,
            "units with zero effective count have undefined rates"
        );
    }

    YieldTable {
        stage,
        pass_label,
        fail_labels: fail_codes.into_iter().map(|(_, label)| label).collect(),
        source_mode,
        rows,
        quality,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DEFAULT_PASS_BIN_CODE, approx_eq};

    fn bin(wafer: &str, code: u32, name: Option<&str>, count: Option<u64>) -> RawBinRecord {
        RawBinRecord {
            product: "SCP117A".to_string(),
            bulk_id: Some("B100".to_string()),
            lot_id: "L1".to_string(),
            wafer_id: Some(wafer.to_string()),
            time: Some("2024-01-15 08:00:00".to_string()),
            stage: Stage::Cp,
            bin_code: code,
            bin_name: name.map(ToOwned::to_owned),
            bin_count: count,
            effective_count: Some(100.0),
        }
    }

    fn two_wafer_fixture() -> Vec<RawBinRecord> {
        vec![
            bin("W01", 1, None, Some(98)),
            bin("W01", 2, None, Some(2)),
            bin("W02", 1, None, Some(95)),
            bin("W02", 2, None, Some(3)),
            bin("W02", 3, None, Some(2)),
        ]
    }

    #[test]
    fn pre_aggregated_counts_become_percentages() {
        let table = pivot_yield(&two_wafer_fixture(), Stage::Cp, DEFAULT_PASS_BIN_CODE);

        assert_eq!(table.source_mode, Some(CountMode::PreAggregated));
        assert_eq!(table.pass_label.as_deref(), Some("01"));
        assert_eq!(table.fail_labels, vec!["02", "03"]);
        assert_eq!(table.rows.len(), 2);

        let passes: Vec<Option<f64>> = table.rows.iter().map(|row| row.pass_rate).collect();
        assert_eq!(passes, vec![Some(98.0), Some(95.0)]);
        assert_eq!(table.rows[0].fail_rate("02"), Some(2.0));
        assert_eq!(table.rows[1].fail_rate("02"), Some(3.0));
        assert_eq!(table.rows[0].fail_rate("03"), Some(0.0));
        assert_eq!(table.rows[1].fail_rate("03"), Some(2.0));
    }

    #[test]
    fn rates_sum_to_one_hundred_when_denominator_known() {
        let table = pivot_yield(&two_wafer_fixture(), Stage::Cp, DEFAULT_PASS_BIN_CODE);
        for row in &table.rows {
            let total = row.pass_rate.unwrap_or(0.0)
                + row.fail_rates.values().flatten().copied().sum::<f64>();
            assert!(approx_eq(total, 100.0), "row total was {total}");
        }
    }

    #[test]
    fn per_die_rows_are_counted_when_no_count_column() {
        let mut records = Vec::new();
        for _ in 0..3 {
            records.push(bin("W01", 1, Some("PASS"), None));
        }
        records.push(bin("W01", 4, Some("LEAK"), None));
        for record in &mut records {
            record.effective_count = Some(4.0);
        }

        let table = pivot_yield(&records, Stage::Cp, DEFAULT_PASS_BIN_CODE);
        assert_eq!(table.source_mode, Some(CountMode::PerDie));
        assert_eq!(table.pass_label.as_deref(), Some("01_PASS"));
        assert_eq!(table.rows[0].pass_rate, Some(75.0));
        assert_eq!(table.rows[0].fail_rate("04_LEAK"), Some(25.0));
    }

    #[test]
    fn missing_denominator_keeps_counts_and_marks_row() {
        let mut records = two_wafer_fixture();
        for record in &mut records {
            record.effective_count = None;
        }

        let table = pivot_yield(&records, Stage::Cp, DEFAULT_PASS_BIN_CODE);
        assert!(table.rows.iter().all(YieldRecord::is_count_based));
        assert_eq!(table.rows[1].pass_rate, Some(95.0));
        assert_eq!(table.quality.count_based_rows, 2);
    }

    #[test]
    fn zero_denominator_leaves_rates_undefined() {
        let mut records = two_wafer_fixture();
        for record in records.iter_mut().filter(|r| r.wafer_id.as_deref() == Some("W02")) {
            record.effective_count = Some(0.0);
        }

        let table = pivot_yield(&records, Stage::Cp, DEFAULT_PASS_BIN_CODE);
        let w02 = &table.rows[1];
        assert_eq!(w02.basis, RateBasis::Percent);
        assert_eq!(w02.pass_rate, None);
        assert!(w02.fail_rates.values().all(Option::is_none));
        assert_eq!(table.quality.undefined_denominators, 1);
        assert_eq!(table.rows[0].pass_rate, Some(98.0));
    }

    #[test]
    fn absent_pass_code_makes_pass_rate_undefined() {
        let records = vec![bin("W01", 2, None, Some(5)), bin("W01", 3, None, Some(5))];
        let table = pivot_yield(&records, Stage::Cp, DEFAULT_PASS_BIN_CODE);
        assert_eq!(table.pass_label, None);
        assert_eq!(table.rows[0].pass_rate, None);
        assert_eq!(table.rows[0].fail_rate("02"), Some(5.0));
    }

    #[test]
    fn pivot_is_idempotent_and_order_independent() {
        let records = two_wafer_fixture();
        let first = pivot_yield(&records, Stage::Cp, DEFAULT_PASS_BIN_CODE);
        let second = pivot_yield(&records, Stage::Cp, DEFAULT_PASS_BIN_CODE);
        assert_eq!(first, second);

        let mut reversed = records.clone();
        reversed.reverse();
        let shuffled = pivot_yield(&reversed, Stage::Cp, DEFAULT_PASS_BIN_CODE);
        assert_eq!(first.rows, shuffled.rows);
        assert_eq!(first.fail_labels, shuffled.fail_labels);
    }

    #[test]
    fn other_stage_records_are_ignored() {
        let mut records = two_wafer_fixture();
        let mut ft = bin("W09", 1, None, Some(10));
        ft.stage = Stage::Ft;
        records.push(ft);

        let table = pivot_yield(&records, Stage::Cp, DEFAULT_PASS_BIN_CODE);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.quality.skipped_other_stage, 1);
    }

    #[test]
    fn empty_input_yields_empty_table() {
        let table = pivot_yield(&[], Stage::Ft, DEFAULT_PASS_BIN_CODE);
        assert!(table.is_empty());
        assert_eq!(table.source_mode, None);
        assert_eq!(table.stage, Stage::Ft);
    }

    #[test]
    fn conflicting_effective_counts_are_reported() {
        let mut records = two_wafer_fixture();
        records[1].effective_count = Some(120.0);
        let table = pivot_yield(&records, Stage::Cp, DEFAULT_PASS_BIN_CODE);
        assert_eq!(table.quality.conflicting_effective_counts, 1);
        assert_eq!(table.rows[0].effective_count, Some(100.0));
    }

    #[test]
    fn oversized_counts_saturate_instead_of_overflowing() {
        let mut records = vec![
            bin("W01", 2, None, Some(u64::MAX)),
            bin("W01", 2, None, Some(5)),
        ];
        for record in &mut records {
            record.effective_count = None;
        }

        let table = pivot_yield(&records, Stage::Cp, DEFAULT_PASS_BIN_CODE);
        assert_eq!(table.rows[0].fail_rate("02"), Some(u64::MAX as f64));
    }
}
