use anyhow::{Context, Result};
use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{Connection, params};
use tracing::info;

use crate::cli::SeedArgs;
use crate::repository::LocalStore;
use crate::util::ensure_directory;

const DEMO_PRODUCTS: &[&str] = &["DEMO-A", "DEMO-B"];
const LOTS_PER_PRODUCT: u32 = 3;
const WAFERS_PER_LOT: u32 = 4;
const SITES_PER_WAFER: i64 = 5;
const CP_EFFECTIVE_PER_WAFER: u32 = 100;
const PER_DIE_EFFECTIVE_PER_WAFER: u32 = 20;
const FT_EFFECTIVE_PER_LOT: u32 = 200;

const CP_BINS: &[(u32, &str)] = &[(1, "PASS"), (2, "OPEN"), (3, "SHORT")];
const FT_BINS: &[(u32, &str)] = &[(1, "PASS"), (5, "LEAK")];

const DEMO_SPECS: &[(&str, Option<f64>, Option<f64>)] = &[
    ("VTH", Some(0.60), Some(0.40)),
    ("IDSAT", Some(600.0), Some(480.0)),
    ("RSH", Some(16.0), None),
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedCounts {
    pub bin_rows: usize,
    pub wat_rows: usize,
    pub spec_rows: usize,
}

pub fn run(args: SeedArgs) -> Result<()> {
    if let Some(parent) = args.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_directory(parent)?;
        }
    }

    let mut store = LocalStore::create(&args.db_path)?;
    let counts = seed_demo_dataset(store.connection_mut())
        .with_context(|| format!("failed to seed {}", args.db_path.display()))?;

    info!(
        path = %args.db_path.display(),
        products = DEMO_PRODUCTS.len(),
        bin_rows = counts.bin_rows,
        wat_rows = counts.wat_rows,
        spec_rows = counts.spec_rows,
        "seeded demo dataset"
    );
    Ok(())
}

/// Replaces the demo products with a deterministic dataset. DEMO-A carries
/// pre-aggregated CP counts; DEMO-B carries one CP row per die.
pub fn seed_demo_dataset(connection: &mut Connection) -> Result<SeedCounts> {
    let start = NaiveDate::from_ymd_opt(2024, 1, 8)
        .map(|date| date.and_time(NaiveTime::MIN))
        .context("invalid seed start date")?;

    let tx = connection.transaction()?;
    let mut counts = SeedCounts::default();

    for product in DEMO_PRODUCTS {
        tx.execute("DELETE FROM bin_data WHERE product = ?1", params![product])?;
        tx.execute("DELETE FROM wat_data WHERE product = ?1", params![product])?;
        tx.execute("DELETE FROM specs WHERE product = ?1", params![product])?;
    }

    {
        let mut bins = tx.prepare(
            "
            INSERT INTO bin_data(
              product, bulk_id, lot_id, wafer_id, time, stage,
              bin_code, bin_name, bin_count, effective_num
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
        )?;
        let mut measurements = tx.prepare(
            "
            INSERT INTO wat_data(
              product, bulk_id, wafer_id, die_x, die_y, site, time, parameter, value
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
        )?;
        let mut specs = tx.prepare(
            "INSERT INTO specs(product, parameter, usl, lsl) VALUES(?1, ?2, ?3, ?4)",
        )?;

        for (product_index, product) in DEMO_PRODUCTS.iter().enumerate() {
            let per_die = product_index == 1;

            for lot in 0..LOTS_PER_PRODUCT {
                let lot_id = format!("L{}{:02}", product_index + 1, lot + 1);
                let bulk_id = format!("BK{}{:02}", product_index + 1, lot + 1);
                let lot_start = offset_days(start, u64::from(lot) * 10)?;

                for wafer in 0..WAFERS_PER_LOT {
                    let wafer_id = format!("W{:02}", wafer + 1);
                    let tested_at = offset_days(lot_start, u64::from(wafer))?;
                    let time = tested_at.format("%Y-%m-%d %H:%M:%S").to_string();
                    let fails = cp_fail_counts(lot, wafer);

                    if per_die {
                        let effective = PER_DIE_EFFECTIVE_PER_WAFER;
                        let pass = effective.saturating_sub(fails.iter().sum::<u32>());
                        for ((code, name), dies) in CP_BINS.iter().zip([pass, fails[0], fails[1]]) {
                            for _ in 0..dies {
                                bins.execute(params![
                                    product,
                                    bulk_id,
                                    lot_id,
                                    wafer_id,
                                    time,
                                    "CP",
                                    code,
                                    name,
                                    Option::<u32>::None,
                                    effective
                                ])?;
                                counts.bin_rows += 1;
                            }
                        }
                    } else {
                        let effective = CP_EFFECTIVE_PER_WAFER;
                        let pass = effective.saturating_sub(fails.iter().sum::<u32>());
                        for ((code, name), count) in CP_BINS.iter().zip([pass, fails[0], fails[1]]) {
                            bins.execute(params![
                                product, bulk_id, lot_id, wafer_id, time, "CP", code, name, count,
                                effective
                            ])?;
                            counts.bin_rows += 1;
                        }
                    }

                    for site in 1..=SITES_PER_WAFER {
                        for (parameter, value) in wat_values(lot, wafer, site) {
                            measurements.execute(params![
                                product,
                                bulk_id,
                                wafer_id,
                                site % 3,
                                site / 3,
                                site,
                                time,
                                parameter,
                                value
                            ])?;
                            counts.wat_rows += 1;
                        }
                    }
                }

                let ft_time = offset_days(lot_start, 7)?
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string();
                let leak = 4 + lot * 3;
                for ((code, name), count) in FT_BINS
                    .iter()
                    .zip([FT_EFFECTIVE_PER_LOT - leak, leak])
                {
                    bins.execute(params![
                        product,
                        lot_id,
                        lot_id,
                        Option::<String>::None,
                        ft_time,
                        "FT",
                        code,
                        name,
                        count,
                        FT_EFFECTIVE_PER_LOT
                    ])?;
                    counts.bin_rows += 1;
                }
            }

            for (parameter, usl, lsl) in DEMO_SPECS {
                specs.execute(params![product, parameter, usl, lsl])?;
                counts.spec_rows += 1;
            }
        }
    }

    tx.commit()?;
    Ok(counts)
}

fn offset_days(start: NaiveDateTime, days: u64) -> Result<NaiveDateTime> {
    start
        .checked_add_days(Days::new(days))
        .context("seed date out of range")
}

/// OPEN and SHORT die counts for one wafer.
fn cp_fail_counts(lot: u32, wafer: u32) -> [u32; 2] {
    [(lot + wafer) % 4, (lot * 2 + wafer) % 3]
}

fn wat_values(lot: u32, wafer: u32, site: i64) -> [(&'static str, f64); 3] {
    let step = f64::from((lot * 7 + wafer * 3) % 5) + site as f64 * 0.2;
    // Lot 3, wafer 4 drifts high on VTH so the demo shows a spec violation.
    let drift = if lot == 2 && wafer == 3 { 0.12 } else { 0.0 };
    [
        ("VTH", 0.48 + step * 0.01 + drift),
        ("IDSAT", 530.0 + step * 4.0),
        ("RSH", 12.0 + step * 0.3),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        DEFAULT_PASS_BIN_CODE, aggregate, evaluate_chart_limits, parameter_series,
        pivot_parameters, pivot_yield,
    };
    use crate::model::{CountMode, Granularity, Stage};
    use crate::repository::Repository;

    fn seeded_store() -> LocalStore {
        let mut store = LocalStore::from_connection(Connection::open_in_memory().expect("db"))
            .expect("schema");
        seed_demo_dataset(store.connection_mut()).expect("seed");
        store
    }

    #[test]
    fn seeding_twice_replaces_demo_rows() {
        let mut store = seeded_store();
        let first = store.table_counts();
        let counts = seed_demo_dataset(store.connection_mut()).expect("reseed");
        assert_eq!(store.table_counts(), first);
        assert_eq!(counts.spec_rows, DEMO_PRODUCTS.len() * DEMO_SPECS.len());
    }

    #[test]
    fn pre_aggregated_product_yields_percentages() {
        let store = seeded_store();
        let records = store.fetch_bin_records("DEMO-A", Stage::Cp).expect("bins");
        let table = pivot_yield(&records, Stage::Cp, DEFAULT_PASS_BIN_CODE);

        assert_eq!(table.source_mode, Some(CountMode::PreAggregated));
        assert_eq!(table.rows.len(), (LOTS_PER_PRODUCT * WAFERS_PER_LOT) as usize);
        assert_eq!(table.pass_label.as_deref(), Some("01_PASS"));
        for row in &table.rows {
            let total = row.pass_rate.unwrap_or_default()
                + table
                    .fail_labels
                    .iter()
                    .filter_map(|label| row.fail_rate(label))
                    .sum::<f64>();
            assert!((total - 100.0).abs() < 1e-6);
        }

        let weekly = aggregate(&table, Granularity::Weekly);
        assert!(!weekly.buckets.is_empty());
        assert_eq!(weekly.excluded_rows, 0);
    }

    #[test]
    fn per_die_product_counts_rows() {
        let store = seeded_store();
        let records = store.fetch_bin_records("DEMO-B", Stage::Cp).expect("bins");
        let table = pivot_yield(&records, Stage::Cp, DEFAULT_PASS_BIN_CODE);

        assert_eq!(table.source_mode, Some(CountMode::PerDie));
        let first = &table.rows[0];
        assert_eq!(first.effective_count, Some(f64::from(PER_DIE_EFFECTIVE_PER_WAFER)));
        assert_eq!(first.pass_rate, Some(100.0));
    }

    #[test]
    fn ft_rows_are_per_lot() {
        let store = seeded_store();
        let records = store.fetch_bin_records("DEMO-A", Stage::Ft).expect("bins");
        let table = pivot_yield(&records, Stage::Ft, DEFAULT_PASS_BIN_CODE);
        assert_eq!(table.rows.len(), LOTS_PER_PRODUCT as usize);
        assert_eq!(table.rows[0].pass_rate, Some(98.0));
    }

    #[test]
    fn wat_demo_includes_a_spec_violation() {
        let store = seeded_store();
        let measurements = store.fetch_parameter_records("DEMO-A").expect("wat");
        let specs = store.fetch_spec_limits("DEMO-A").expect("specs");
        let table = pivot_parameters(&measurements);
        assert_eq!(table.parameters, vec!["IDSAT", "RSH", "VTH"]);

        let series = parameter_series(&table.rows, "VTH");
        let limits = evaluate_chart_limits(&series, &specs, "VTH");
        assert_eq!(limits.usl, Some(0.60));
        assert!(!limits.beyond_spec_limits.is_empty());
        assert!(limits.control.is_some());
    }
}
