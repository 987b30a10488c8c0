use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("missing config file seis-harvest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("station list {0} does not exist")]
    #[diagnostic(help("run once with down_list = false to build the station list from the data centre"))]
    MissingInput(PathBuf),

    #[error("download needs {required_gb:.3} GB of memory per chunk but only {limit_gb:.3} GB is allowed")]
    #[diagnostic(help("reduce inc_hours so each chunk holds less data"))]
    ResourceBudget { required_gb: f64, limit_gb: f64 },

    #[error("inventory query returned no channels")]
    EmptyInventory,

    #[error("no data available: {0}")]
    NoData(String),

    #[error("FDSN request failed: {0}")]
    FdsnHttp(String),

    #[error("FDSN service returned status {status}: {message}")]
    FdsnStatus { status: u16, message: String },

    #[error("malformed miniSEED: {0}")]
    MiniSeed(String),

    #[error("preprocessing failed: {0}")]
    Preprocess(String),

    #[error("station table error: {0}")]
    StationTable(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
