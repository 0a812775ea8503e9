use std::path::Path;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags, params};

use crate::config::Backend;
use crate::model::{RawBinRecord, RawParameterRecord, SpecLimit, Stage};

use super::{
    Repository, count_tables, query_bin_records, query_parameter_records, query_products,
    real_at, text_at,
};

const LOCAL_TABLES: &[&str] = &["bin_data", "wat_data", "specs"];

const BIN_QUERY: &str = "
    SELECT product, bulk_id, lot_id, wafer_id, time, bin_code, bin_name, bin_count, effective_num
    FROM bin_data
    WHERE product = ?1
      AND UPPER(stage) = ?2
    ORDER BY time, lot_id, wafer_id, bin_code
";

const PARAMETER_QUERY: &str = "
    SELECT product, bulk_id, wafer_id, die_x, die_y, site, time, parameter, value
    FROM wat_data
    WHERE product = ?1
    ORDER BY time, bulk_id, wafer_id, site, die_x, die_y
";

const PRODUCT_QUERY: &str = "
    SELECT product FROM bin_data
    UNION
    SELECT product FROM wat_data
";

/// Local fixture store: one sqlite file in the canonical long schema.
pub struct LocalStore {
    connection: Connection,
}

impl LocalStore {
    /// Opens an existing store for reading.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("local store not found: {}", path.display());
        }

        let connection = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self { connection })
    }

    /// Opens or creates a writable store with the schema in place.
    pub fn create(path: &Path) -> Result<Self> {
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        configure_connection(&connection)?;
        Self::from_connection(connection)
    }

    pub fn from_connection(connection: Connection) -> Result<Self> {
        ensure_schema(&connection)?;
        Ok(Self { connection })
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS bin_data (
              product TEXT NOT NULL,
              bulk_id TEXT,
              lot_id TEXT NOT NULL,
              wafer_id TEXT,
              time TEXT,
              stage TEXT NOT NULL,
              bin_code INTEGER NOT NULL,
              bin_name TEXT,
              bin_count INTEGER,
              effective_num REAL
            );

            CREATE TABLE IF NOT EXISTS wat_data (
              product TEXT NOT NULL,
              bulk_id TEXT,
              wafer_id TEXT,
              die_x INTEGER,
              die_y INTEGER,
              site INTEGER,
              time TEXT,
              parameter TEXT NOT NULL,
              value REAL
            );

            CREATE TABLE IF NOT EXISTS specs (
              product TEXT NOT NULL,
              parameter TEXT NOT NULL,
              usl REAL,
              lsl REAL
            );

            CREATE INDEX IF NOT EXISTS idx_bin_data_product_stage ON bin_data(product, stage);
            CREATE INDEX IF NOT EXISTS idx_wat_data_product ON wat_data(product);
            CREATE INDEX IF NOT EXISTS idx_specs_product ON specs(product, parameter);
            ",
        )
        .context("failed to create local store schema")?;
    Ok(())
}

impl Repository for LocalStore {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    fn list_products(&self) -> Result<Vec<String>> {
        query_products(&self.connection, PRODUCT_QUERY)
    }

    fn fetch_bin_records(&self, product: &str, stage: Stage) -> Result<Vec<RawBinRecord>> {
        query_bin_records(
            &self.connection,
            BIN_QUERY,
            params![product, stage.as_str()],
            stage,
        )
        .with_context(|| format!("failed to load {stage} bins for {product}"))
    }

    fn fetch_parameter_records(&self, product: &str) -> Result<Vec<RawParameterRecord>> {
        query_parameter_records(&self.connection, PARAMETER_QUERY, params![product])
            .with_context(|| format!("failed to load WAT measurements for {product}"))
    }

    fn fetch_spec_limits(&self, product: &str) -> Result<Vec<SpecLimit>> {
        let mut statement = self.connection.prepare(
            "SELECT parameter, usl, lsl FROM specs WHERE product = ?1 ORDER BY rowid",
        )?;
        let mut rows = statement.query(params![product])?;

        let mut specs = Vec::new();
        while let Some(row) = rows.next()? {
            let Some(parameter) = text_at(row, 0)? else {
                continue;
            };
            specs.push(SpecLimit {
                parameter,
                usl: real_at(row, 1)?,
                lsl: real_at(row, 2)?,
            });
        }
        Ok(specs)
    }

    fn table_counts(&self) -> Vec<(String, i64)> {
        count_tables(&self.connection, LOCAL_TABLES)
    }
}
