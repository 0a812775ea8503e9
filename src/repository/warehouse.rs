use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags, params};
use tracing::debug;

use crate::config::Backend;
use crate::model::{RawBinRecord, RawParameterRecord, SpecLimit, Stage};

use super::{
    Repository, count_tables, load_spec_csv, query_bin_records, query_parameter_records,
    query_products, spec_csv_path,
};

const WAREHOUSE_TABLES: &[&str] = &[
    "semi_cp_header",
    "semi_cp_result",
    "semi_cp_bin_sum",
    "semi_ft_header",
    "semi_ft_bin_sum",
    "wat_header",
    "wat_detail",
];

// ?1 upper-cased product, ?2 process, ?3 lookback modifier such as '-6 months' or NULL.
const CP_PER_DIE_QUERY: &str = "
    SELECT h.product_id, h.substrate_id, h.lot_id, h.wafer_id, h.regist_date,
           r.bin_code, r.bin_name, NULL, h.effective_num
    FROM semi_cp_header h
    LEFT JOIN semi_cp_result r
      ON h.substrate_id = r.substrate_id
     AND h.wafer_id = r.wafer_id
     AND h.product_id = r.product_id
     AND h.rework_new = r.rework_new
    WHERE UPPER(h.product_id) = ?1
      AND h.process = ?2
      AND COALESCE(r.rework_new, 0) = 0
      AND (?3 IS NULL OR h.regist_date >= date('now', ?3))
    ORDER BY h.regist_date, h.lot_id, h.wafer_id, r.bin_code
";

const CP_BIN_SUM_QUERY: &str = "
    SELECT h.product_id, h.substrate_id, h.lot_id, h.wafer_id, h.regist_date,
           b.bin_code, b.bin_name, b.bin_count, h.effective_num
    FROM semi_cp_header h
    LEFT JOIN semi_cp_bin_sum b
      ON h.substrate_id = b.substrate_id
     AND h.wafer_id = b.wafer_id
     AND h.product_id = b.product_id
     AND h.process = b.process
     AND h.rework_new = b.rework_new
    WHERE UPPER(h.product_id) = ?1
      AND h.process = ?2
      AND COALESCE(b.rework_new, 0) = 0
      AND (?3 IS NULL OR h.regist_date >= date('now', ?3))
    ORDER BY h.regist_date, h.lot_id, h.wafer_id, b.bin_code
";

const FT_BIN_SUM_QUERY: &str = "
    SELECT h.product_id, h.assy_lot_id, h.assy_lot_id, h.wafer_id, h.regist_date,
           b.bin_code, b.bin_name, b.bin_count, h.effective_num
    FROM semi_ft_header h
    LEFT JOIN semi_ft_bin_sum b
      ON h.assy_lot_id = b.assy_lot_id
     AND COALESCE(h.wafer_id, -1) = COALESCE(b.wafer_id, -1)
     AND h.product_id = b.product_id
     AND h.process = b.process
     AND h.rework_new = b.rework_new
    WHERE UPPER(h.product_id) = ?1
      AND h.process = ?2
      AND COALESCE(b.rework_new, 0) = 0
      AND (?3 IS NULL OR h.regist_date >= date('now', ?3))
    ORDER BY h.regist_date, h.assy_lot_id, b.bin_code
";

// ?1 upper-cased product, ?2 lookback modifier or NULL.
const WAT_QUERY: &str = "
    SELECT h.product_id, h.substrate_id, d.wafer_id, d.die_x, d.die_y, d.site_no,
           h.regist_date, d.item_name, d.meas_data
    FROM wat_header h
    LEFT JOIN wat_detail d ON d.lot_id = h.lot_id
    WHERE UPPER(h.product_id) = ?1
      AND (?2 IS NULL OR h.regist_date >= date('now', ?2))
    ORDER BY h.regist_date, h.substrate_id, d.wafer_id, d.site_no
";

const PRODUCT_QUERY: &str = "
    SELECT product_id FROM semi_cp_header
    UNION
    SELECT product_id FROM semi_ft_header
    UNION
    SELECT product_id FROM wat_header
";

#[derive(Debug, Clone, Default)]
pub struct WarehouseOptions {
    /// Upper-cased products whose CP yield comes from CPY bin sums.
    pub cpy_products: Vec<String>,
    pub lookback_months: Option<u32>,
    pub spec_dir: PathBuf,
}

/// Bin query and process code used for one product and stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct YieldQuery {
    sql: &'static str,
    process: &'static str,
}

/// Warehouse extract with header/result/bin-sum tables.
pub struct WarehouseStore {
    connection: Connection,
    options: WarehouseOptions,
}

impl WarehouseStore {
    pub fn open(path: &Path, options: WarehouseOptions) -> Result<Self> {
        if !path.exists() {
            bail!("warehouse extract not found: {}", path.display());
        }

        let connection = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self::from_connection(connection, options))
    }

    pub fn from_connection(connection: Connection, options: WarehouseOptions) -> Self {
        Self {
            connection,
            options,
        }
    }

    fn yield_query(&self, product: &str, stage: Stage) -> YieldQuery {
        match stage {
            Stage::Ft => YieldQuery {
                sql: FT_BIN_SUM_QUERY,
                process: "FT",
            },
            Stage::Cp if self.options.cpy_products.iter().any(|name| name == product) => {
                YieldQuery {
                    sql: CP_BIN_SUM_QUERY,
                    process: "CPY",
                }
            }
            Stage::Cp => YieldQuery {
                sql: CP_PER_DIE_QUERY,
                process: "CP",
            },
        }
    }

    fn lookback(&self) -> Option<String> {
        self.options
            .lookback_months
            .map(|months| format!("-{months} months"))
    }
}

impl Repository for WarehouseStore {
    fn backend(&self) -> Backend {
        Backend::Warehouse
    }

    fn list_products(&self) -> Result<Vec<String>> {
        query_products(&self.connection, PRODUCT_QUERY)
    }

    fn fetch_bin_records(&self, product: &str, stage: Stage) -> Result<Vec<RawBinRecord>> {
        let product_key = product.trim().to_ascii_uppercase();
        let query = self.yield_query(&product_key, stage);
        debug!(product = %product_key, stage = %stage, process = query.process, "selected yield query");

        query_bin_records(
            &self.connection,
            query.sql,
            params![product_key, query.process, self.lookback()],
            stage,
        )
        .with_context(|| format!("failed to load {stage} bins for {product}"))
    }

    fn fetch_parameter_records(&self, product: &str) -> Result<Vec<RawParameterRecord>> {
        let product_key = product.trim().to_ascii_uppercase();
        query_parameter_records(
            &self.connection,
            WAT_QUERY,
            params![product_key, self.lookback()],
        )
        .with_context(|| format!("failed to load WAT measurements for {product}"))
    }

    fn fetch_spec_limits(&self, product: &str) -> Result<Vec<SpecLimit>> {
        let exact = spec_csv_path(&self.options.spec_dir, product);
        let path = if exact.exists() {
            exact
        } else {
            spec_csv_path(&self.options.spec_dir, &product.to_ascii_uppercase())
        };
        load_spec_csv(&path)
    }

    fn table_counts(&self) -> Vec<(String, i64)> {
        count_tables(&self.connection, WAREHOUSE_TABLES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAREHOUSE_SCHEMA: &str = "
        CREATE TABLE semi_cp_header (
          product_id TEXT, substrate_id TEXT, lot_id TEXT, wafer_id TEXT,
          regist_date TEXT, process TEXT, effective_num REAL, rework_new INTEGER
        );
        CREATE TABLE semi_cp_result (
          product_id TEXT, substrate_id TEXT, wafer_id TEXT, rework_new INTEGER,
          bin_code INTEGER, bin_name TEXT
        );
        CREATE TABLE semi_cp_bin_sum (
          product_id TEXT, substrate_id TEXT, wafer_id TEXT, process TEXT,
          rework_new INTEGER, bin_code INTEGER, bin_name TEXT, bin_count INTEGER
        );
        CREATE TABLE semi_ft_header (
          product_id TEXT, assy_lot_id TEXT, wafer_id TEXT, regist_date TEXT,
          process TEXT, effective_num REAL, rework_new INTEGER
        );
        CREATE TABLE semi_ft_bin_sum (
          product_id TEXT, assy_lot_id TEXT, wafer_id TEXT, process TEXT,
          rework_new INTEGER, bin_code INTEGER, bin_name TEXT, bin_count INTEGER
        );
        CREATE TABLE wat_header (
          product_id TEXT, substrate_id TEXT, lot_id TEXT, regist_date TEXT
        );
        CREATE TABLE wat_detail (
          lot_id TEXT, wafer_id TEXT, die_x INTEGER, die_y INTEGER, site_no INTEGER,
          item_name TEXT, meas_data REAL
        );
    ";

    fn warehouse(options: WarehouseOptions) -> WarehouseStore {
        let connection = Connection::open_in_memory().expect("db");
        connection.execute_batch(WAREHOUSE_SCHEMA).expect("schema");
        connection
            .execute_batch(
                "
                INSERT INTO semi_cp_header VALUES
                  ('scp117a', 'S1', 'L1', 'W01', '2024-01-15 08:00:00', 'CP', 4, 0),
                  ('SCP117A', 'S1', 'L1', 'W01', '2024-01-15 09:00:00', 'CPY', 100, 0),
                  ('SCP200B', 'S9', 'L9', 'W01', '2024-01-15 08:00:00', 'CP', 2, 0);

                INSERT INTO semi_cp_result VALUES
                  ('scp117a', 'S1', 'W01', 0, 1, 'PASS'),
                  ('scp117a', 'S1', 'W01', 0, 1, 'PASS'),
                  ('scp117a', 'S1', 'W01', 0, 1, 'PASS'),
                  ('scp117a', 'S1', 'W01', 0, 2, 'OPEN'),
                  ('scp117a', 'S1', 'W01', 1, 2, 'OPEN');

                INSERT INTO semi_cp_bin_sum VALUES
                  ('SCP117A', 'S1', 'W01', 'CPY', 0, 1, 'PASS', 97),
                  ('SCP117A', 'S1', 'W01', 'CPY', 0, 3, 'SHORT', 3),
                  ('SCP117A', 'S1', 'W01', 'CPY', 1, 3, 'SHORT', 50);

                INSERT INTO semi_ft_header VALUES
                  ('SCP117A', 'A1', NULL, '2024-02-01 10:00:00', 'FT', 200, 0);

                INSERT INTO semi_ft_bin_sum VALUES
                  ('SCP117A', 'A1', NULL, 'FT', 0, 1, 'PASS', 190),
                  ('SCP117A', 'A1', NULL, 'FT', 0, 5, 'LEAK', 10);

                INSERT INTO wat_header VALUES
                  ('SCP117A', 'S1', 'L1', '2024-01-14 08:00:00');

                INSERT INTO wat_detail VALUES
                  ('L1', 'W01', 0, 0, 1, 'VTH', 0.51),
                  ('L1', 'W01', 0, 0, 2, 'VTH', 0.53);
                ",
            )
            .expect("fixture rows");
        WarehouseStore::from_connection(connection, options)
    }

    #[test]
    fn per_die_cp_results_skip_rework_rows() {
        let store = warehouse(WarehouseOptions::default());
        let records = store.fetch_bin_records("scp117a", Stage::Cp).expect("fetch");
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|record| record.bin_count.is_none()));
        assert_eq!(records[0].effective_count, Some(4.0));
        assert_eq!(records[0].bulk_id.as_deref(), Some("S1"));
    }

    #[test]
    fn cpy_products_read_bin_sums() {
        let store = warehouse(WarehouseOptions {
            cpy_products: vec!["SCP117A".to_string()],
            ..WarehouseOptions::default()
        });
        let records = store.fetch_bin_records("SCP117A", Stage::Cp).expect("fetch");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].bin_count, Some(97));
        assert_eq!(records[1].bin_name.as_deref(), Some("SHORT"));
        assert_eq!(records[1].bin_count, Some(3));
    }

    #[test]
    fn ft_bin_sums_use_assembly_lot_for_bulk_and_lot() {
        let store = warehouse(WarehouseOptions::default());
        let records = store.fetch_bin_records("SCP117A", Stage::Ft).expect("fetch");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].lot_id, "A1");
        assert_eq!(records[0].bulk_id.as_deref(), Some("A1"));
        assert_eq!(records[0].wafer_id, None);
    }

    #[test]
    fn wat_detail_joins_on_lot() {
        let store = warehouse(WarehouseOptions::default());
        let records = store.fetch_parameter_records("scp117a").expect("fetch");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].site, Some(2));
        assert_eq!(records[1].value, Some(0.53));
    }

    #[test]
    fn lookback_window_excludes_old_headers() {
        let store = warehouse(WarehouseOptions {
            lookback_months: Some(1),
            ..WarehouseOptions::default()
        });
        assert!(store.fetch_bin_records("SCP117A", Stage::Ft).expect("fetch").is_empty());
    }

    #[test]
    fn products_span_all_headers() {
        let store = warehouse(WarehouseOptions::default());
        assert_eq!(
            store.list_products().expect("products"),
            vec!["SCP117A", "SCP200B", "scp117a"]
        );
        assert_eq!(store.table_counts().len(), WAREHOUSE_TABLES.len());
    }

    #[test]
    fn specs_fall_back_to_upper_case_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let product_dir = dir.path().join("SCP117A");
        std::fs::create_dir_all(&product_dir).expect("mkdir");
        std::fs::write(product_dir.join("specs.csv"), "parameter,USL,LSL\nVTH,0.7,0.3\n")
            .expect("write");

        let store = warehouse(WarehouseOptions {
            spec_dir: dir.path().to_path_buf(),
            ..WarehouseOptions::default()
        });
        let specs = store.fetch_spec_limits("scp117a").expect("specs");
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].lsl, Some(0.3));
    }
}
