//! Error taxonomy for the stacking pipeline.
//!
//! Every failure is fatal for the run: there are no retries anywhere, so each
//! variant carries enough context to tell the operator what to fix.

use std::path::PathBuf;

use burn::record::RecorderError;

/// Errors raised by any phase of the stacking pipeline.
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    /// Invalid or inconsistent run configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The settings source could not be read or deserialized.
    #[error("failed to load settings: {0}")]
    Settings(#[from] config::ConfigError),

    /// A required input file or directory does not exist.
    #[error("missing input {what} at {path}")]
    MissingInput { what: &'static str, path: PathBuf },

    /// Parameter shapes stored in a checkpoint differ from the architecture.
    #[error("shape mismatch for {context}: parameter {parameter} expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: String,
        parameter: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Two sequences that must line up have different lengths.
    #[error("length mismatch in {context}: expected {expected}, found {found}")]
    LengthMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    /// Two base models scored different example sets for the same fold.
    #[error("base model {model} lists different image ids than {reference} for fold {fold}")]
    IdMismatch {
        model: String,
        reference: String,
        fold: usize,
    },

    /// The builder was asked for a training split with no folds in it.
    #[error("training split for held-out fold {fold} is empty (fold count {num_folds})")]
    EmptyTrainingSet { fold: usize, num_folds: usize },

    /// A logit cache was requested before the create-data phase produced it.
    #[error("logit cache for {model} not found at {path}; run the create-data phase first")]
    CacheMissing { model: String, path: PathBuf },

    /// A checkpoint could not be written.
    #[error("failed to write checkpoint {path}: {reason}")]
    CheckpointWrite { path: PathBuf, reason: String },

    /// A checkpoint or record could not be read.
    #[error("failed to load {path}: {source}")]
    CheckpointLoad {
        path: PathBuf,
        #[source]
        source: RecorderError,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl StackError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

pub type Result<T> = std::result::Result<T, StackError>;
