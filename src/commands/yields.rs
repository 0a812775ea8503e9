use std::io::{self, Write};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::YieldArgs;
use crate::config::AppConfig;
use crate::engine::{aggregate, failure_mode_contribution, lot_distribution, pivot_yield};
use crate::model::{
    Granularity, PASS_RATE_COLUMN, RawBinRecord, Stage, YieldReport, fail_rate_column,
};
use crate::repository::{Repository, create_repository, or_unavailable};
use crate::util::{format_optional, now_utc_string, write_json_pretty, write_json_stdout};

pub fn run(args: YieldArgs) -> Result<()> {
    let stage: Stage = args.stage.parse()?;
    let granularity: Granularity = args.granularity.parse()?;
    let config = AppConfig::from_args(&args.source)?;

    info!(
        product = %args.product,
        stage = %stage,
        granularity = %granularity,
        backend = %config.database.backend,
        environment = %config.environment,
        "yield report requested"
    );

    let repository = create_repository(&config)?;
    let records = or_unavailable(
        repository.fetch_bin_records(&args.product, stage),
        "bin records",
        &args.product,
    );

    let report = build_yield_report(
        repository.as_ref(),
        &args.product,
        &records,
        stage,
        granularity,
        config.pass_bin_code,
    );

    if let Some(output) = &args.output {
        write_json_pretty(output, &report)
            .with_context(|| format!("failed to write yield report {}", output.display()))?;
        info!(path = %output.display(), "wrote yield report");
    }

    if args.json {
        write_json_stdout(&report)
    } else {
        write_text_report(&report)
    }
}

pub(crate) fn build_yield_report(
    repository: &dyn Repository,
    product: &str,
    records: &[RawBinRecord],
    stage: Stage,
    granularity: Granularity,
    pass_code: u32,
) -> YieldReport {
    let table = pivot_yield(records, stage, pass_code);
    if table.is_empty() {
        warn!(product, stage = %stage, "no yield rows to report");
    } else if table.pass_label.is_none() {
        warn!(
            product,
            pass_code,
            "pass bin absent from selection; pass rate undefined"
        );
    }

    let summary = aggregate(&table, granularity);
    let failure_modes = failure_mode_contribution(&table);
    let lot_distribution = lot_distribution(&table);

    info!(
        rows = table.rows.len(),
        buckets = summary.buckets.len(),
        fail_labels = table.fail_labels.len(),
        "yield report built"
    );

    YieldReport {
        product: product.to_string(),
        backend: repository.backend().to_string(),
        generated_at: now_utc_string(),
        table,
        summary,
        failure_modes,
        lot_distribution,
    }
}

fn write_text_report(report: &YieldReport) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    let table = &report.table;
    let summary = &report.summary;

    writeln!(
        output,
        "Product: {}\tStage: {}\tBackend: {}",
        report.product, table.stage, report.backend
    )?;
    writeln!(
        output,
        "Rows: {}\tPass label: {}",
        table.rows.len(),
        table.pass_label.as_deref().unwrap_or("(none)")
    )?;

    let mut header = vec![summary.granularity.to_string(), "rows".to_string()];
    header.push(PASS_RATE_COLUMN.to_string());
    header.extend(table.fail_labels.iter().map(|label| fail_rate_column(label)));
    writeln!(output)?;
    writeln!(output, "{}", header.join("\t"))?;

    for bucket in &summary.buckets {
        let mut cells = vec![
            bucket.category.clone(),
            bucket.row_count.to_string(),
            format_optional(bucket.pass_rate),
        ];
        cells.extend(
            table
                .fail_labels
                .iter()
                .map(|label| format_optional(bucket.fail_rates.get(label).copied().flatten())),
        );
        writeln!(output, "{}", cells.join("\t"))?;
    }

    if summary.excluded_rows > 0 {
        writeln!(output, "Excluded rows: {}", summary.excluded_rows)?;
    }
    if summary.count_based_rows > 0 {
        writeln!(
            output,
            "Count-based rows (no effective count): {}",
            summary.count_based_rows
        )?;
    }

    if !report.failure_modes.is_empty() {
        writeln!(output)?;
        writeln!(output, "Failure modes:")?;
        for share in &report.failure_modes {
            writeln!(output, "\t{}\t{:.3}", share.label, share.total)?;
        }
    }

    if !report.lot_distribution.is_empty() {
        writeln!(output)?;
        writeln!(output, "Lots:\tlot\twafers\tmin\tmedian\tmean\tmax")?;
        for lot in &report.lot_distribution {
            writeln!(
                output,
                "\t{}\t{}\t{:.3}\t{:.3}\t{:.3}\t{:.3}",
                lot.lot_id, lot.wafers, lot.min, lot.median, lot.mean, lot.max
            )?;
        }
    }

    output.flush()?;
    Ok(())
}
