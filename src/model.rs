use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub const PASS_RATE_COLUMN: &str = "PASS_RATE";

pub fn fail_rate_column(label: &str) -> String {
    format!("FAIL_RATE[{label}]")
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "CP")]
    Cp,
    #[serde(rename = "FT")]
    Ft,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cp => "CP",
            Self::Ft => "FT",
        }
    }
}

impl FromStr for Stage {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CP" => Ok(Self::Cp),
            "FT" => Ok(Self::Ft),
            _ => Err(EngineError::InvalidStage(raw.to_string())),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Granularity {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    #[serde(rename = "BulkID")]
    BulkId,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "Daily",
            Self::Weekly => "Weekly",
            Self::Monthly => "Monthly",
            Self::Quarterly => "Quarterly",
            Self::BulkId => "BulkID",
        }
    }
}

impl FromStr for Granularity {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "bulkid" | "bulk_id" | "bulk" => Ok(Self::BulkId),
            _ => Err(EngineError::InvalidGranularity(raw.to_string())),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bin event in long format. `bin_count` is populated by pre-aggregated
/// sources and absent for per-die sources, where every row counts as one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBinRecord {
    pub product: String,
    pub bulk_id: Option<String>,
    pub lot_id: String,
    pub wafer_id: Option<String>,
    pub time: Option<String>,
    pub stage: Stage,
    pub bin_code: u32,
    pub bin_name: Option<String>,
    pub bin_count: Option<u64>,
    pub effective_count: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawParameterRecord {
    pub product: String,
    pub bulk_id: Option<String>,
    pub wafer_id: Option<String>,
    pub die_x: Option<i64>,
    pub die_y: Option<i64>,
    pub site: Option<i64>,
    pub time: Option<String>,
    pub parameter: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecLimit {
    pub parameter: String,
    pub usl: Option<f64>,
    pub lsl: Option<f64>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CountMode {
    PerDie,
    PreAggregated,
    Mixed,
}

/// Whether a yield row holds percentages or raw counts.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateBasis {
    Percent,
    Count,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YieldRecord {
    pub product: String,
    pub bulk_id: Option<String>,
    pub lot_id: String,
    pub wafer_id: Option<String>,
    pub time: Option<String>,
    pub stage: Stage,
    pub basis: RateBasis,
    pub effective_count: Option<f64>,
    #[serde(rename = "PASS_RATE")]
    pub pass_rate: Option<f64>,
    #[serde(rename = "FAIL_RATE")]
    pub fail_rates: BTreeMap<String, Option<f64>>,
}

impl YieldRecord {
    pub fn is_count_based(&self) -> bool {
        self.basis == RateBasis::Count
    }

    pub fn fail_rate(&self, label: &str) -> Option<f64> {
        self.fail_rates.get(label).copied().flatten()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct YieldPivotQuality {
    pub skipped_other_stage: usize,
    pub duplicate_bin_names: usize,
    pub conflicting_effective_counts: usize,
    pub undefined_denominators: usize,
    pub count_based_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YieldTable {
    pub stage: Stage,
    pub pass_label: Option<String>,
    pub fail_labels: Vec<String>,
    pub source_mode: Option<CountMode>,
    pub rows: Vec<YieldRecord>,
    pub quality: YieldPivotQuality,
}

impl YieldTable {
    pub fn empty(stage: Stage) -> Self {
        Self {
            stage,
            pass_label: None,
            fail_labels: Vec::new(),
            source_mode: None,
            rows: Vec::new(),
            quality: YieldPivotQuality::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterRecord {
    pub product: String,
    pub bulk_id: Option<String>,
    pub wafer_id: Option<String>,
    pub die_x: Option<i64>,
    pub die_y: Option<i64>,
    pub site: Option<i64>,
    pub time: Option<String>,
    pub values: BTreeMap<String, Option<f64>>,
}

impl ParameterRecord {
    pub fn value(&self, parameter: &str) -> Option<f64> {
        self.values.get(parameter).copied().flatten()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParameterTable {
    pub parameters: Vec<String>,
    pub rows: Vec<ParameterRecord>,
    pub source_rows: usize,
    pub duplicate_values: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateBucket {
    pub category: String,
    pub row_count: usize,
    #[serde(rename = "PASS_RATE")]
    pub pass_rate: Option<f64>,
    #[serde(rename = "FAIL_RATE")]
    pub fail_rates: BTreeMap<String, Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateTable {
    pub granularity: Granularity,
    pub buckets: Vec<AggregateBucket>,
    pub excluded_rows: usize,
    pub count_based_rows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlLimits {
    pub center_line: f64,
    pub ucl: f64,
    pub lcl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndividualChart {
    pub limits: ControlLimits,
    pub moving_range: ControlLimits,
    pub avg_moving_range: f64,
    pub sigma: f64,
    pub observations: usize,
    pub beyond_limits: Vec<usize>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum BatchKey {
    #[serde(rename = "BulkID")]
    BulkId,
    #[serde(rename = "WaferID")]
    WaferId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkTrendPoint {
    pub batch_id: String,
    pub mean_value: Option<f64>,
    pub moving_average: Option<f64>,
    #[serde(skip)]
    pub first_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartLimits {
    pub parameter: String,
    pub control: Option<IndividualChart>,
    pub usl: Option<f64>,
    pub lsl: Option<f64>,
    pub beyond_spec_limits: Vec<usize>,
}

/// One measured die of a wafer map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DiePoint {
    pub die_x: i64,
    pub die_y: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureModeShare {
    pub label: String,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LotDistribution {
    pub lot_id: String,
    pub wafers: usize,
    pub min: f64,
    pub median: f64,
    pub mean: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct YieldReport {
    pub product: String,
    pub backend: String,
    pub generated_at: String,
    pub table: YieldTable,
    pub summary: AggregateTable,
    pub failure_modes: Vec<FailureModeShare>,
    pub lot_distribution: Vec<LotDistribution>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatReport {
    pub product: String,
    pub backend: String,
    pub generated_at: String,
    pub parameter: String,
    pub wafer: Option<String>,
    pub parameters: Vec<String>,
    pub wafers: Vec<String>,
    pub source_rows: usize,
    pub duplicate_values: usize,
    pub points: usize,
    pub range_min: Option<f64>,
    pub range_max: Option<f64>,
    pub limits: ChartLimits,
    pub bulk_trend: Vec<BulkTrendPoint>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wafer_map: Vec<DiePoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_parses_case_insensitively_and_rejects_unknown_values() {
        assert_eq!("cp".parse::<Stage>(), Ok(Stage::Cp));
        assert_eq!(" FT ".parse::<Stage>(), Ok(Stage::Ft));
        assert_eq!(
            "WS".parse::<Stage>(),
            Err(EngineError::InvalidStage("WS".to_string()))
        );
    }

    #[test]
    fn invalid_stage_error_names_the_value() {
        let err = "CPY".parse::<Stage>().unwrap_err();
        assert!(err.to_string().contains("CPY"));
    }

    #[test]
    fn granularity_accepts_ui_labels() {
        assert_eq!("Weekly".parse::<Granularity>(), Ok(Granularity::Weekly));
        assert_eq!("BulkID".parse::<Granularity>(), Ok(Granularity::BulkId));
        assert!(matches!(
            "Hourly".parse::<Granularity>(),
            Err(EngineError::InvalidGranularity(_))
        ));
    }

    #[test]
    fn fail_rate_column_wraps_label() {
        assert_eq!(fail_rate_column("02_OPEN"), "FAIL_RATE[02_OPEN]");
    }
}
