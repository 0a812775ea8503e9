use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::model::{DiePoint, ParameterRecord, ParameterTable, RawParameterRecord};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SiteKey {
    product: String,
    bulk_id: Option<String>,
    wafer_id: Option<String>,
    die_x: Option<i64>,
    die_y: Option<i64>,
    site: Option<i64>,
    time: Option<String>,
}

impl SiteKey {
    fn of(record: &RawParameterRecord) -> Self {
        Self {
            product: record.product.clone(),
            bulk_id: record.bulk_id.clone(),
            wafer_id: record.wafer_id.clone(),
            die_x: record.die_x,
            die_y: record.die_y,
            site: record.site,
            time: record.time.clone(),
        }
    }
}

/// Pivots long parameter measurements to one row per measurement site.
///
/// Every parameter name becomes a column; sites that never measured it hold
/// `None`. A second value for an already filled (site, parameter) cell is
/// dropped and counted in `duplicate_values`.
pub fn pivot_parameters(records: &[RawParameterRecord]) -> ParameterTable {
    if records.is_empty() {
        return ParameterTable::default();
    }

    let parameters: BTreeSet<String> = records
        .iter()
        .map(|record| record.parameter.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();

    let mut sites: BTreeMap<SiteKey, BTreeMap<String, Option<f64>>> = BTreeMap::new();
    let mut duplicate_values = 0;

    for record in records {
        let name = record.parameter.trim();
        if name.is_empty() {
            continue;
        }

        let value = record.value.filter(|value| value.is_finite());
        let cells = sites.entry(SiteKey::of(record)).or_default();
        match cells.entry(name.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
            Entry::Occupied(mut slot) => {
                let current: Option<f64> = *slot.get();
                match current {
                    None => {
                        slot.insert(value);
                    }
                    Some(kept) if value.is_some() => {
                        duplicate_values += 1;
                        warn!(
                            parameter = name,
                            wafer_id = %record.wafer_id.as_deref().unwrap_or_default(),
                            site = record.site.unwrap_or_default(),
                            kept,
                            "duplicate parameter value for one site; keeping first seen"
                        );
                    }
                    Some(_) => {}
                }
            }
        }
    }

    let rows = sites
        .into_iter()
        .map(|(key, cells)| ParameterRecord {
            values: parameters
                .iter()
                .map(|name| (name.clone(), cells.get(name).copied().flatten()))
                .collect(),
            product: key.product,
            bulk_id: key.bulk_id,
            wafer_id: key.wafer_id,
            die_x: key.die_x,
            die_y: key.die_y,
            site: key.site,
            time: key.time,
        })
        .collect();

    ParameterTable {
        parameters: parameters.into_iter().collect(),
        rows,
        source_rows: records.len(),
        duplicate_values,
    }
}

pub fn available_parameters(table: &ParameterTable) -> Vec<String> {
    table.parameters.clone()
}

pub fn list_wafers(table: &ParameterTable) -> Vec<String> {
    table
        .rows
        .iter()
        .filter_map(|row| row.wafer_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn filter_by_wafer(table: &ParameterTable, wafer_id: &str) -> Vec<ParameterRecord> {
    table
        .rows
        .iter()
        .filter(|row| row.wafer_id.as_deref() == Some(wafer_id))
        .cloned()
        .collect()
}

/// Values of one parameter in row order, `None` where the site lacks it.
pub fn parameter_series(rows: &[ParameterRecord], parameter: &str) -> Vec<Option<f64>> {
    rows.iter().map(|row| row.value(parameter)).collect()
}

pub fn parameter_range(rows: &[ParameterRecord], parameter: &str) -> (Option<f64>, Option<f64>) {
    rows.iter()
        .filter_map(|row| row.value(parameter))
        .fold((None, None), |(min, max), value| {
            (
                Some(min.map_or(value, |current: f64| current.min(value))),
                Some(max.map_or(value, |current: f64| current.max(value))),
            )
        })
}

/// Measured dies of one wafer for one parameter, ordered row by row
/// (`die_y`, then `die_x`). Sites without coordinates or a value are left out.
pub fn wafer_map(rows: &[ParameterRecord], wafer_id: &str, parameter: &str) -> Vec<DiePoint> {
    let mut points: Vec<DiePoint> = rows
        .iter()
        .filter(|row| row.wafer_id.as_deref() == Some(wafer_id))
        .filter_map(|row| {
            Some(DiePoint {
                die_x: row.die_x?,
                die_y: row.die_y?,
                value: row.value(parameter).filter(|value| value.is_finite())?,
            })
        })
        .collect();

    points.sort_by_key(|point| (point.die_y, point.die_x));
    points
}
