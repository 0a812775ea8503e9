use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::engine::DEFAULT_PASS_BIN_CODE;

#[derive(Parser, Debug)]
#[command(
    name = "waferyield",
    version,
    about = "Wafer yield and WAT SPC analytics over bin and parametric test records"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Yield(YieldArgs),
    Wat(WatArgs),
    Products(ProductsArgs),
    Seed(SeedArgs),
    Status(StatusArgs),
}

/// Where raw records come from. Every flag falls back to an environment
/// variable so a deployment can pin the backend once.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    #[arg(long, env = "DB_BACKEND", default_value = "sqlite")]
    pub backend: String,

    #[arg(long, env = "DB_SQLITE_PATH", default_value = "data/test.db")]
    pub db_path: PathBuf,

    #[arg(long, env = "DB_WAREHOUSE_PATH")]
    pub warehouse_path: Option<PathBuf>,

    #[arg(long, env = "DB_LOOKBACK_MONTHS")]
    pub lookback_months: Option<u32>,

    #[arg(long = "cpy-product")]
    pub cpy_products: Vec<String>,

    #[arg(long, env = "SPEC_DIR", default_value = "data")]
    pub spec_dir: PathBuf,

    #[arg(long, env = "PASS_BIN_CODE", default_value_t = DEFAULT_PASS_BIN_CODE)]
    pub pass_bin_code: u32,

    #[arg(long, env = "APP_ENV", default_value = "development")]
    pub environment: String,
}

#[derive(Args, Debug, Clone)]
pub struct YieldArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[arg(long)]
    pub product: String,

    #[arg(long, default_value = "CP")]
    pub stage: String,

    #[arg(long, default_value = "Weekly")]
    pub granularity: String,

    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum TrendKey {
    Bulk,
    Wafer,
}

#[derive(Args, Debug, Clone)]
pub struct WatArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[arg(long)]
    pub product: String,

    #[arg(long)]
    pub parameter: Option<String>,

    #[arg(long)]
    pub wafer: Option<String>,

    #[arg(long, value_enum, default_value_t = TrendKey::Bulk)]
    pub trend_key: TrendKey,

    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ProductsArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SeedArgs {
    #[arg(long, env = "DB_SQLITE_PATH", default_value = "data/test.db")]
    pub db_path: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub source: SourceArgs,
}
