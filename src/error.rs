use thiserror::Error;

use crate::collections::NodeId;

/// Pre-flight failures. The only error kind `CollectionRunner::run` returns;
/// everything that happens after a run result exists is captured into it.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Collection {0} was not found")]
    CollectionNotFound(NodeId),
    #[error("Folder `{0}` was not found in the collection")]
    FolderNotFound(String),
    #[error("The selected collection or folder contains no requests")]
    EmptyRequestList,
    #[error("Iterations must be between {min} and {max}, got {got}")]
    IterationsOutOfRange { min: u32, max: u32, got: u32 },
    #[error("Environment `{0}` was not found")]
    EnvironmentNotFound(String),
    #[error("Data file `{0}` was not found")]
    DataFileNotFound(String),
}

/// Failures building or sending one HTTP request. Always captured into the
/// request's run result, never propagated out of the pipeline.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid URL `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Invalid header line `{value}`: {message}")]
    InvalidHeader { value: String, message: String },
    #[error("Invalid parameter line `{0}`. Expected `key=value`")]
    InvalidParam(String),
    #[error("{0}")]
    InvalidAuth(String),
    #[error("Request timed out after {0} ms")]
    Timeout(u64),
    #[error("Request failed: {0}")]
    Send(String),
    #[error("Failed to read response body: {0}")]
    Body(String),
}

/// Failures inside a user script. Recorded as a failed test entry on the
/// owning request; a script error never aborts the surrounding run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("Parse error on line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("Script error on line {line}: {message}")]
    Runtime { line: usize, message: String },
    #[error("Script exceeded its {0} ms time limit")]
    Timeout(u64),
}

/// Workspace document and history database I/O.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse `{path}`: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to write `{path}`: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize workspace: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("History database error: {0}")]
    History(#[from] rusqlite::Error),
}

/// Top-level error for the binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
