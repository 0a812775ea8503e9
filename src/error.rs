use thiserror::Error;

/// Validation failures raised when a caller asks for something the engine
/// does not support. These stop the specific request; data gaps never do.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("unsupported stage: {0} (expected CP or FT)")]
    InvalidStage(String),

    #[error("unsupported granularity: {0} (expected Daily, Weekly, Monthly, Quarterly or BulkID)")]
    InvalidGranularity(String),

    #[error("unsupported database backend: {0} (expected sqlite or warehouse)")]
    InvalidBackend(String),
}
