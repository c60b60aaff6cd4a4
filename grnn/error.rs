use crate::config::ConfigError;
use crate::storage::StorageError;
use thiserror::Error;

/// Malformed dataset shape or, in strict mode, a malformed numeric field.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Line {line}: row has {found} columns, but the engine holds at most {capacity}.")]
    TooManyColumns {
        line: u64,
        found: usize,
        capacity: usize,
    },
    #[error("Line {line}: row has {found} columns, but earlier rows have {expected}.")]
    RaggedRow {
        line: u64,
        found: usize,
        expected: usize,
    },
    #[error("Line {line}, column {column}: '{token}' is not a valid number.")]
    InvalidNumber {
        line: u64,
        column: usize,
        token: String,
    },
    #[error("Malformed delimited record: {0}")]
    Malformed(String),
}

/// Every failure the engine surfaces to its caller.
#[derive(Error, Debug)]
pub enum GrnnError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Dataset exceeds the configured capacity of {capacity} rows.")]
    ResourceExhausted { capacity: usize },

    #[error("No successful training run is available. Call `train` first.")]
    NotTrained,

    #[error("Kernel bandwidths have not been configured.")]
    NotConfigured,

    #[error("Query has {found} features, but the model was trained on {expected}.")]
    QueryShape { expected: usize, found: usize },
}
