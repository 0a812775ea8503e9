use tracing::warn;

use crate::model::{ChartLimits, SpecLimit};

use super::spc::individual_chart;

/// USL and LSL for a parameter. No matching row means no limit lines,
/// so both come back `None`. With several matches the first one is used.
pub fn spec_limits(specs: &[SpecLimit], parameter: &str) -> (Option<f64>, Option<f64>) {
    let wanted = parameter.trim();
    let mut matches = specs.iter().filter(|spec| spec.parameter.trim() == wanted);

    let Some(first) = matches.next() else {
        return (None, None);
    };

    let extra = matches.count();
    if extra > 0 {
        warn!(
            parameter = wanted,
            duplicates = extra,
            "multiple spec rows for one parameter; using the first"
        );
    }

    (
        first.usl.filter(|value| value.is_finite()),
        first.lsl.filter(|value| value.is_finite()),
    )
}

/// Positions of values above USL or below LSL. An absent limit never flags.
pub fn spec_violations(series: &[Option<f64>], usl: Option<f64>, lsl: Option<f64>) -> Vec<usize> {
    series
        .iter()
        .enumerate()
        .filter_map(|(index, value)| value.map(|value| (index, value)))
        .filter(|(_, value)| {
            usl.is_some_and(|usl| *value > usl) || lsl.is_some_and(|lsl| *value < lsl)
        })
        .map(|(index, _)| index)
        .collect()
}

/// Control limits for the series next to the spec limits for the parameter.
pub fn evaluate_chart_limits(
    series: &[Option<f64>],
    specs: &[SpecLimit],
    parameter: &str,
) -> ChartLimits {
    let (usl, lsl) = spec_limits(specs, parameter);
    ChartLimits {
        parameter: parameter.to_string(),
        control: individual_chart(series),
        usl,
        lsl,
        beyond_spec_limits: spec_violations(series, usl, lsl),
    }
}
