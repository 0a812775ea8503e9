use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::cli::SourceArgs;
use crate::error::EngineError;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Backend {
    Sqlite,
    Warehouse,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Warehouse => "warehouse",
        }
    }
}

impl FromStr for Backend {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "local" => Ok(Self::Sqlite),
            "warehouse" | "oracle" => Ok(Self::Warehouse),
            _ => Err(EngineError::InvalidBackend(raw.to_string())),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: Backend,
    pub sqlite_path: PathBuf,
    pub warehouse_path: Option<PathBuf>,
    pub lookback_months: Option<u32>,
    pub cpy_products: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: String,
    pub database: DatabaseConfig,
    pub spec_dir: PathBuf,
    pub pass_bin_code: u32,
}

impl AppConfig {
    pub fn from_args(args: &SourceArgs) -> Result<Self, EngineError> {
        let backend = args.backend.parse::<Backend>()?;
        Ok(Self {
            environment: args.environment.clone(),
            database: DatabaseConfig {
                backend,
                sqlite_path: args.db_path.clone(),
                warehouse_path: args.warehouse_path.clone(),
                lookback_months: args.lookback_months,
                cpy_products: args
                    .cpy_products
                    .iter()
                    .map(|product| product.trim().to_ascii_uppercase())
                    .filter(|product| !product.is_empty())
                    .collect(),
            },
            spec_dir: args.spec_dir.clone(),
            pass_bin_code: args.pass_bin_code,
        })
    }

    /// The file the selected backend reads from. The warehouse extract falls
    /// back to the sqlite path when no dedicated path is configured.
    pub fn source_path(&self) -> &PathBuf {
        match self.database.backend {
            Backend::Sqlite => &self.database.sqlite_path,
            Backend::Warehouse => self
                .database
                .warehouse_path
                .as_ref()
                .unwrap_or(&self.database.sqlite_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_args(backend: &str) -> SourceArgs {
        SourceArgs {
            backend: backend.to_string(),
            db_path: PathBuf::from("data/test.db"),
            warehouse_path: None,
            lookback_months: None,
            cpy_products: vec![" scp117a ".to_string(), String::new()],
            spec_dir: PathBuf::from("data"),
            pass_bin_code: 1,
            environment: "development".to_string(),
        }
    }

    #[test]
    fn backend_names_resolve() {
        assert_eq!("SQLite".parse::<Backend>(), Ok(Backend::Sqlite));
        assert_eq!("oracle".parse::<Backend>(), Ok(Backend::Warehouse));
        assert_eq!(
            "mysql".parse::<Backend>(),
            Err(EngineError::InvalidBackend("mysql".to_string()))
        );
    }

    #[test]
    fn config_normalizes_cpy_products() {
        let config = AppConfig::from_args(&source_args("warehouse")).expect("valid config");
        assert_eq!(config.database.backend, Backend::Warehouse);
        assert_eq!(config.database.cpy_products, vec!["SCP117A"]);
        assert_eq!(config.source_path(), &PathBuf::from("data/test.db"));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(AppConfig::from_args(&source_args("csv")).is_err());
    }
}
