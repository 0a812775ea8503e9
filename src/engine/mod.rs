mod aggregate;
mod bin_label;
mod parameter_pivot;
mod spc;
mod spec;
mod summary;
mod yield_pivot;

pub use aggregate::aggregate;
pub use bin_label::{DEFAULT_PASS_BIN_CODE, bin_label};
pub use parameter_pivot::{
    available_parameters, filter_by_wafer, list_wafers, parameter_range, parameter_series,
    pivot_parameters, wafer_map,
};
pub use spc::bulk_trend;
pub use spec::{evaluate_chart_limits, spec_limits, spec_violations};
pub use summary::{failure_mode_contribution, lot_distribution};
pub use yield_pivot::pivot_yield;

/// Arithmetic mean of the finite values, or `None` when there are none.
pub(crate) fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .filter(|value| value.is_finite())
        .fold((0.0, 0_usize), |(sum, count), value| (sum + value, count + 1));

    (count > 0).then(|| sum / count as f64)
}

#[cfg(test)]
pub(crate) fn approx_eq(left: f64, right: f64) -> bool {
    (left - right).abs() < 1e-6
}
