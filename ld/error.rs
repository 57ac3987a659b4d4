// ========================================================================================
//
//                              The unified error surface
//
// ========================================================================================
//
// Every analysis returns `Result<_, LdError>`. Failures are detected next to their
// cause and propagate unchanged to the command driver, which aborts that analysis only.
// Nothing here retries, and partially written outputs are left in place.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LdError {
    /// The arena could not satisfy a buffer request within its byte budget.
    #[error("out of memory: {what} needs {requested} bytes but only {available} remain in the arena")]
    OutOfMemory {
        what: &'static str,
        requested: usize,
        available: usize,
    },

    #[error("failed to open {path}: {source}")]
    OpenFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("read failure in {path}: {message}")]
    ReadFailure { path: PathBuf, message: String },

    #[error("failed to write {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to spawn worker thread: {0}")]
    ThreadCreateFailure(#[source] io::Error),

    #[error("{0} has not been implemented yet")]
    NotYetImplemented(&'static str),
}

impl LdError {
    pub fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LdError::WriteFailure {
            path: path.into(),
            source,
        }
    }

    pub fn open(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LdError::OpenFailure {
            path: path.into(),
            source,
        }
    }

    pub fn read(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        LdError::ReadFailure {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Structural problems in a PLINK fileset. These surface to callers as
/// `LdError::InvalidInput` with the offending file and line attached.
#[derive(Debug, Error)]
pub enum PlinkFormatError {
    #[error("invalid PLINK .bed header: {0}")]
    InvalidHeader(String),
    #[error("unexpected .bed payload size (expected {expected} bytes, found {actual})")]
    TruncatedBed { expected: u64, actual: u64 },
    #[error("malformed record in {path} at line {line}: {message}")]
    MalformedRecord {
        path: String,
        line: usize,
        message: String,
    },
}

impl From<PlinkFormatError> for LdError {
    fn from(err: PlinkFormatError) -> Self {
        LdError::InvalidInput(err.to_string())
    }
}
