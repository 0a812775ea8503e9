use std::io::{self, Write};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::{TrendKey, WatArgs};
use crate::config::AppConfig;
use crate::engine::{
    available_parameters, bulk_trend, evaluate_chart_limits, filter_by_wafer, list_wafers,
    parameter_range, parameter_series, pivot_parameters, wafer_map,
};
use crate::model::{BatchKey, RawParameterRecord, SpecLimit, WatReport};
use crate::repository::{create_repository, or_unavailable};
use crate::util::{format_optional, now_utc_string, write_json_pretty, write_json_stdout};

impl From<TrendKey> for BatchKey {
    fn from(key: TrendKey) -> Self {
        match key {
            TrendKey::Bulk => Self::BulkId,
            TrendKey::Wafer => Self::WaferId,
        }
    }
}

pub struct WatSelection<'a> {
    pub parameter: Option<&'a str>,
    pub wafer: Option<&'a str>,
    pub trend_key: BatchKey,
}

pub fn run(args: WatArgs) -> Result<()> {
    let config = AppConfig::from_args(&args.source)?;

    info!(
        product = %args.product,
        parameter = %args.parameter.as_deref().unwrap_or("(first available)"),
        wafer = %args.wafer.as_deref().unwrap_or("(all)"),
        backend = %config.database.backend,
        "WAT report requested"
    );

    let repository = create_repository(&config)?;
    let records = or_unavailable(
        repository.fetch_parameter_records(&args.product),
        "parameter records",
        &args.product,
    );
    let specs = or_unavailable(
        repository.fetch_spec_limits(&args.product),
        "spec limits",
        &args.product,
    );

    let selection = WatSelection {
        parameter: args.parameter.as_deref(),
        wafer: args.wafer.as_deref(),
        trend_key: args.trend_key.into(),
    };
    let Some(report) = build_wat_report(
        &args.product,
        &repository.backend().to_string(),
        &records,
        &specs,
        &selection,
    ) else {
        warn!(product = %args.product, "no WAT parameters available");
        return Ok(());
    };

    if let Some(output) = &args.output {
        write_json_pretty(output, &report)
            .with_context(|| format!("failed to write WAT report {}", output.display()))?;
        info!(path = %output.display(), "wrote WAT report");
    }

    if args.json {
        write_json_stdout(&report)
    } else {
        write_text_report(&report)
    }
}

/// `None` when the product has no parameters at all.
pub(crate) fn build_wat_report(
    product: &str,
    backend: &str,
    records: &[RawParameterRecord],
    specs: &[SpecLimit],
    selection: &WatSelection<'_>,
) -> Option<WatReport> {
    let table = pivot_parameters(records);
    let parameters = available_parameters(&table);
    let parameter = match selection.parameter {
        Some(parameter) => parameter.to_string(),
        None => parameters.first()?.clone(),
    };
    if !parameters.contains(&parameter) {
        warn!(product, parameter = %parameter, "parameter not measured for product");
    }

    let wafers = list_wafers(&table);
    let scoped = match selection.wafer {
        Some(wafer) => filter_by_wafer(&table, wafer),
        None => table.rows.clone(),
    };
    if scoped.is_empty() {
        warn!(product, wafer = ?selection.wafer, "selection holds no measurement sites");
    }

    let series = parameter_series(&scoped, &parameter);
    let limits = evaluate_chart_limits(&series, specs, &parameter);
    let (range_min, range_max) = parameter_range(&scoped, &parameter);
    let trend = bulk_trend(&table.rows, selection.trend_key, &parameter);
    let die_grid = selection
        .wafer
        .map(|wafer| wafer_map(&scoped, wafer, &parameter))
        .unwrap_or_default();

    info!(
        parameter = %parameter,
        points = series.len(),
        beyond_control = limits.control.as_ref().map_or(0, |chart| chart.beyond_limits.len()),
        beyond_spec = limits.beyond_spec_limits.len(),
        batches = trend.len(),
        "WAT report built"
    );

    Some(WatReport {
        product: product.to_string(),
        backend: backend.to_string(),
        generated_at: now_utc_string(),
        parameter,
        wafer: selection.wafer.map(str::to_string),
        parameters,
        wafers,
        source_rows: table.source_rows,
        duplicate_values: table.duplicate_values,
        points: series.len(),
        range_min,
        range_max,
        limits,
        bulk_trend: trend,
        wafer_map: die_grid,
    })
}

fn write_text_report(report: &WatReport) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    let limits = &report.limits;

    writeln!(
        output,
        "Product: {}\tParameter: {}\tWafer: {}\tBackend: {}",
        report.product,
        report.parameter,
        report.wafer.as_deref().unwrap_or("(all)"),
        report.backend
    )?;
    writeln!(
        output,
        "Points: {}\tRange: {} .. {}",
        report.points,
        format_optional(report.range_min),
        format_optional(report.range_max)
    )?;
    writeln!(
        output,
        "Spec: USL={}\tLSL={}\tviolations={}",
        format_optional(limits.usl),
        format_optional(limits.lsl),
        limits.beyond_spec_limits.len()
    )?;

    match &limits.control {
        Some(chart) => {
            writeln!(
                output,
                "I chart: CL={:.4}\tUCL={:.4}\tLCL={:.4}\tsigma={:.4}",
                chart.limits.center_line, chart.limits.ucl, chart.limits.lcl, chart.sigma
            )?;
            writeln!(
                output,
                "MR chart: MR-bar={:.4}\tUCL={:.4}\tbeyond limits={}",
                chart.avg_moving_range,
                chart.moving_range.ucl,
                chart.beyond_limits.len()
            )?;
        }
        None => writeln!(output, "I chart: (no defined values)")?,
    }

    if !report.bulk_trend.is_empty() {
        writeln!(output)?;
        writeln!(output, "Trend:\tbatch\tmean\tmoving_average")?;
        for point in &report.bulk_trend {
            writeln!(
                output,
                "\t{}\t{}\t{}",
                point.batch_id,
                format_optional(point.mean_value),
                format_optional(point.moving_average)
            )?;
        }
    }

    if !report.wafer_map.is_empty() {
        writeln!(output)?;
        writeln!(output, "Wafer map:\tdie_x\tdie_y\tvalue")?;
        for point in &report.wafer_map {
            writeln!(
                output,
                "\t{}\t{}\t{:.4}",
                point.die_x, point.die_y, point.value
            )?;
        }
    }

    output.flush()?;
    Ok(())
}
