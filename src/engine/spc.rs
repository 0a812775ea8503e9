use std::collections::BTreeMap;

use chrono::NaiveDateTime;

use crate::model::{
    BatchKey, BulkTrendPoint, ControlLimits, IndividualChart, ParameterRecord,
};
use crate::util::parse_timestamp;

use super::mean;

/// d2 for subgroups of size two. Constants per Montgomery, *Introduction to
/// Statistical Quality Control*, ch. 6, and ASTM E2587.
pub const D2: f64 = 1.128;

/// D4 for the moving-range chart (n=2).
const D4_MR: f64 = 3.267;

const SIGMA_MULTIPLIER: f64 = 3.0;

pub const MOVING_AVERAGE_WINDOW: usize = 3;

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|value| value.is_finite())
}

fn defined_values(series: &[Option<f64>]) -> Vec<f64> {
    series.iter().filter_map(|value| finite(*value)).collect()
}

/// Mean absolute difference between consecutive measured values. Gaps in
/// the series are closed first, so a sparse parameter still has a spread.
fn average_moving_range(defined: &[f64]) -> f64 {
    mean(defined.windows(2).map(|pair| (pair[1] - pair[0]).abs())).unwrap_or(0.0)
}

/// CL ± 3 sigma with sigma = MR-bar / d2. With fewer than two defined
/// points the spread is zero and the limits collapse onto the center line.
/// Returns `None` when no point is defined.
pub fn individual_control_limits(series: &[Option<f64>]) -> Option<ControlLimits> {
    let defined = defined_values(series);
    let center_line = mean(defined.iter().copied())?;
    let sigma = average_moving_range(&defined) / D2;

    Some(ControlLimits {
        center_line,
        ucl: center_line + SIGMA_MULTIPLIER * sigma,
        lcl: center_line - SIGMA_MULTIPLIER * sigma,
    })
}

/// I-MR chart over an ordered series. `beyond_limits` holds positions in
/// the original series, gaps included.
pub fn individual_chart(series: &[Option<f64>]) -> Option<IndividualChart> {
    let limits = individual_control_limits(series)?;
    let defined = defined_values(series);
    let avg_moving_range = average_moving_range(&defined);

    let beyond_limits = series
        .iter()
        .enumerate()
        .filter_map(|(index, value)| finite(*value).map(|value| (index, value)))
        .filter(|(_, value)| *value > limits.ucl || *value < limits.lcl)
        .map(|(index, _)| index)
        .collect();

    Some(IndividualChart {
        limits,
        moving_range: ControlLimits {
            center_line: avg_moving_range,
            ucl: D4_MR * avg_moving_range,
            lcl: 0.0,
        },
        avg_moving_range,
        sigma: avg_moving_range / D2,
        observations: defined.len(),
        beyond_limits,
    })
}

/// Trailing mean over up to `window` points; leading points use what is
/// available. Undefined inputs are skipped inside each window.
pub fn moving_average(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let window = window.max(1);
    (0..values.len())
        .map(|end| {
            let start = (end + 1).saturating_sub(window);
            mean(values[start..=end].iter().filter_map(|value| finite(*value)))
        })
        .collect()
}

#[derive(Default)]
struct Batch {
    values: Vec<f64>,
    earliest: Option<NaiveDateTime>,
    earliest_raw: Option<String>,
}

/// Per-batch mean of one parameter, ordered by each batch's earliest
/// timestamp, with a trailing moving average over three batches.
///
/// Batches without any parseable timestamp sort after the dated ones, by id.
pub fn bulk_trend(rows: &[ParameterRecord], key: BatchKey, parameter: &str) -> Vec<BulkTrendPoint> {
    let mut batches: BTreeMap<String, Batch> = BTreeMap::new();

    for row in rows {
        let batch_id = match key {
            BatchKey::BulkId => row.bulk_id.as_ref(),
            BatchKey::WaferId => row.wafer_id.as_ref(),
        };
        let Some(batch_id) = batch_id else {
            continue;
        };

        let batch = batches.entry(batch_id.clone()).or_default();
        if let Some(value) = row.value(parameter).filter(|value| value.is_finite()) {
            batch.values.push(value);
        }

        let parsed = row.time.as_deref().and_then(parse_timestamp);
        if let Some(timestamp) = parsed {
            if batch.earliest.is_none_or(|earliest| timestamp < earliest) {
                batch.earliest = Some(timestamp);
                batch.earliest_raw = row.time.clone();
            }
        }
    }

    let mut ordered: Vec<(String, Batch)> = batches.into_iter().collect();
    ordered.sort_by(|(left_id, left), (right_id, right)| {
        match (left.earliest, right.earliest) {
            (Some(l), Some(r)) => l.cmp(&r),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then_with(|| left_id.cmp(right_id))
    });

    let means: Vec<Option<f64>> = ordered
        .iter()
        .map(|(_, batch)| mean(batch.values.iter().copied()))
        .collect();
    let averages = moving_average(&means, MOVING_AVERAGE_WINDOW);

    ordered
        .into_iter()
        .zip(means.into_iter().zip(averages))
        .map(|((batch_id, batch), (mean_value, moving_average))| BulkTrendPoint {
            batch_id,
            mean_value,
            moving_average,
            first_time: batch.earliest_raw,
        })
        .collect()
}
