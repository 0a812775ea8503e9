use anyhow::Result;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::config::AppConfig;
use crate::repository::create_repository;

pub fn run(args: StatusArgs) -> Result<()> {
    let config = AppConfig::from_args(&args.source)?;
    let source_path = config.source_path();

    info!(
        environment = %config.environment,
        backend = %config.database.backend,
        source = %source_path.display(),
        spec_dir = %config.spec_dir.display(),
        pass_bin_code = config.pass_bin_code,
        lookback_months = ?config.database.lookback_months,
        cpy_products = ?config.database.cpy_products,
        "status requested"
    );

    if !source_path.exists() {
        warn!(path = %source_path.display(), "database file missing");
        return Ok(());
    }

    if !config.spec_dir.exists() {
        warn!(path = %config.spec_dir.display(), "spec directory missing");
    }

    let repository = create_repository(&config)?;
    for (table, rows) in repository.table_counts() {
        info!(table = %table, rows, "table status");
    }

    Ok(())
}
