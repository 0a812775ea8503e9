mod local;
mod specs_csv;
mod warehouse;

use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Params, Row};
use tracing::warn;

use crate::config::{AppConfig, Backend};
use crate::model::{RawBinRecord, RawParameterRecord, SpecLimit, Stage};

pub use local::LocalStore;
pub use specs_csv::{load_spec_csv, spec_csv_path};
pub use warehouse::{WarehouseOptions, WarehouseStore};

pub trait Repository {
    fn backend(&self) -> Backend;

    fn list_products(&self) -> Result<Vec<String>>;

    fn fetch_bin_records(&self, product: &str, stage: Stage) -> Result<Vec<RawBinRecord>>;

    fn fetch_parameter_records(&self, product: &str) -> Result<Vec<RawParameterRecord>>;

    fn fetch_spec_limits(&self, product: &str) -> Result<Vec<SpecLimit>>;

    /// Row counts per backing table; tables that cannot be counted are left out.
    fn table_counts(&self) -> Vec<(String, i64)>;
}

pub fn create_repository(config: &AppConfig) -> Result<Box<dyn Repository>> {
    let path = config.source_path();
    let repository: Box<dyn Repository> = match config.database.backend {
        Backend::Sqlite => Box::new(LocalStore::open(path)?),
        Backend::Warehouse => Box::new(WarehouseStore::open(
            path,
            WarehouseOptions {
                cpy_products: config.database.cpy_products.clone(),
                lookback_months: config.database.lookback_months,
                spec_dir: config.spec_dir.clone(),
            },
        )?),
    };
    Ok(repository)
}

/// A failed or empty fetch becomes an empty result for that unit of work.
pub fn or_unavailable<T>(result: Result<Vec<T>>, scope: &str, product: &str) -> Vec<T> {
    match result {
        Ok(records) => {
            if records.is_empty() {
                warn!(product, scope, "no records for requested scope");
            }
            records
        }
        Err(err) => {
            warn!(
                product,
                scope,
                error = %format!("{err:#}"),
                "repository fetch failed; continuing without data"
            );
            Vec::new()
        }
    }
}

pub(crate) fn text_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<String>> {
    let value = match row.get_ref(index)? {
        ValueRef::Null => None,
        ValueRef::Integer(value) => Some(value.to_string()),
        ValueRef::Real(value) => Some(value.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).trim().to_string())
        }
    };
    Ok(value.filter(|text| !text.is_empty()))
}

pub(crate) fn real_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<f64>> {
    let value = match row.get_ref(index)? {
        ValueRef::Null | ValueRef::Blob(_) => None,
        ValueRef::Integer(value) => Some(value as f64),
        ValueRef::Real(value) => Some(value),
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).trim().parse::<f64>().ok(),
    };
    Ok(value.filter(|value| value.is_finite()))
}

pub(crate) fn integer_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<i64>> {
    let value = match row.get_ref(index)? {
        ValueRef::Null | ValueRef::Blob(_) => None,
        ValueRef::Integer(value) => Some(value),
        ValueRef::Real(value) if value.fract() == 0.0 => Some(value as i64),
        ValueRef::Real(_) => None,
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).trim().parse::<i64>().ok(),
    };
    Ok(value)
}

/// Reads bin rows selected as `product, bulk_id, lot_id, wafer_id, time,
/// bin_code, bin_name, bin_count, effective_num`. Rows without a lot or a
/// non-negative bin code (outer-join gaps) are dropped and counted.
pub(crate) fn query_bin_records<P: Params>(
    connection: &Connection,
    sql: &str,
    params: P,
    stage: Stage,
) -> Result<Vec<RawBinRecord>> {
    let mut statement = connection
        .prepare(sql)
        .context("failed to prepare bin record query")?;
    let mut rows = statement.query(params).context("failed to run bin record query")?;

    let mut records = Vec::new();
    let mut skipped = 0_usize;
    while let Some(row) = rows.next()? {
        let bin_code = integer_at(row, 5)?.and_then(|code| u32::try_from(code).ok());
        let (Some(lot_id), Some(bin_code)) = (text_at(row, 2)?, bin_code) else {
            skipped += 1;
            continue;
        };

        records.push(RawBinRecord {
            product: text_at(row, 0)?.unwrap_or_default(),
            bulk_id: text_at(row, 1)?,
            lot_id,
            wafer_id: text_at(row, 3)?,
            time: text_at(row, 4)?,
            stage,
            bin_code,
            bin_name: text_at(row, 6)?,
            bin_count: integer_at(row, 7)?.and_then(|count| u64::try_from(count).ok()),
            effective_count: real_at(row, 8)?,
        });
    }

    if skipped > 0 {
        warn!(
            stage = %stage,
            skipped,
            "skipped bin rows without a lot id or valid bin code"
        );
    }

    Ok(records)
}

/// Reads parameter rows selected as `product, bulk_id, wafer_id, die_x,
/// die_y, site, time, parameter, value`.
pub(crate) fn query_parameter_records<P: Params>(
    connection: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<RawParameterRecord>> {
    let mut statement = connection
        .prepare(sql)
        .context("failed to prepare parameter record query")?;
    let mut rows = statement
        .query(params)
        .context("failed to run parameter record query")?;

    let mut records = Vec::new();
    let mut skipped = 0_usize;
    while let Some(row) = rows.next()? {
        let Some(parameter) = text_at(row, 7)? else {
            skipped += 1;
            continue;
        };

        records.push(RawParameterRecord {
            product: text_at(row, 0)?.unwrap_or_default(),
            bulk_id: text_at(row, 1)?,
            wafer_id: text_at(row, 2)?,
            die_x: integer_at(row, 3)?,
            die_y: integer_at(row, 4)?,
            site: integer_at(row, 5)?,
            time: text_at(row, 6)?,
            parameter,
            value: real_at(row, 8)?,
        });
    }

    if skipped > 0 {
        warn!(skipped, "skipped parameter rows without a parameter name");
    }

    Ok(records)
}

pub(crate) fn query_products(connection: &Connection, sql: &str) -> Result<Vec<String>> {
    let mut statement = connection
        .prepare(sql)
        .context("failed to prepare product query")?;
    let mut rows = statement.query([])?;

    let mut products = Vec::new();
    while let Some(row) = rows.next()? {
        if let Some(product) = text_at(row, 0)? {
            products.push(product);
        }
    }
    products.sort();
    products.dedup();
    Ok(products)
}

pub(crate) fn count_tables(connection: &Connection, tables: &[&str]) -> Vec<(String, i64)> {
    tables
        .iter()
        .filter_map(|table| {
            let sql = format!("SELECT COUNT(*) FROM {table}");
            match connection.query_row(&sql, [], |row| row.get::<_, i64>(0)) {
                Ok(count) => Some((table.to_string(), count)),
                Err(err) => {
                    warn!(table, error = %err, "table could not be counted");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_readers_coerce_loose_sqlite_types() {
        let connection = Connection::open_in_memory().expect("in-memory db");
        let (text, real, integer) = connection
            .query_row(
                "SELECT 42, '  3.5 ', 7.0",
                [],
                |row| Ok((text_at(row, 0)?, real_at(row, 1)?, integer_at(row, 2)?)),
            )
            .expect("query");
        assert_eq!(text.as_deref(), Some("42"));
        assert_eq!(real, Some(3.5));
        assert_eq!(integer, Some(7));
    }

    #[test]
    fn blank_text_reads_as_missing() {
        let connection = Connection::open_in_memory().expect("in-memory db");
        let (blank, null) = connection
            .query_row("SELECT '   ', NULL", [], |row| {
                Ok((text_at(row, 0)?, real_at(row, 1)?))
            })
            .expect("query");
        assert_eq!(blank, None);
        assert_eq!(null, None);
    }

    #[test]
    fn failed_fetch_degrades_to_empty() {
        let failed: Result<Vec<SpecLimit>> = Err(anyhow::anyhow!("connection reset"));
        assert!(or_unavailable(failed, "specs", "SCP117A").is_empty());
    }
}
