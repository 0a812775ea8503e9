use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::model::SpecLimit;

#[derive(Debug, Deserialize)]
struct SpecRow {
    parameter: String,
    #[serde(rename = "USL", default, deserialize_with = "csv::invalid_option")]
    usl: Option<f64>,
    #[serde(rename = "LSL", default, deserialize_with = "csv::invalid_option")]
    lsl: Option<f64>,
}

pub fn spec_csv_path(spec_dir: &Path, product: &str) -> PathBuf {
    spec_dir.join(product).join("specs.csv")
}

/// Parses a `parameter,USL,LSL` table. Blank or non-numeric limits read as
/// missing; rows without a parameter name are dropped.
pub fn read_spec_csv<R: Read>(reader: R) -> Result<Vec<SpecLimit>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut specs = Vec::new();
    for row in reader.deserialize::<SpecRow>() {
        let row = row.context("failed to parse spec row")?;
        if row.parameter.is_empty() {
            continue;
        }
        specs.push(SpecLimit {
            parameter: row.parameter,
            usl: row.usl.filter(|value| value.is_finite()),
            lsl: row.lsl.filter(|value| value.is_finite()),
        });
    }
    Ok(specs)
}

/// A product without a spec file has no limits; that is not an error.
pub fn load_spec_csv(path: &Path) -> Result<Vec<SpecLimit>> {
    if !path.exists() {
        warn!(path = %path.display(), "spec file not found; limits unavailable");
        return Ok(Vec::new());
    }

    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    read_spec_csv(file).with_context(|| format!("failed to read {}", path.display()))
}
