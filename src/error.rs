//! Error handling for KMX matrix assembly
//!
//! Every failure in the assembly core is fatal: there are no retries and no
//! partial matrices. The variants below carry enough context (including the
//! counting oracle's captured output) to diagnose a failed run.

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Comprehensive error type for all KMX operations
#[derive(Error, Debug)]
pub enum KmxError {
    /// I/O errors (file operations, temporary files, output writing)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The counting oracle executable could not be launched
    #[error("K-mer counter '{}' not found or not executable: {reason}", .program.display())]
    OracleNotFound { program: PathBuf, reason: String },

    /// The counting oracle exited unsuccessfully
    #[error(
        "K-mer counter '{}' failed with {status}\nStandard Output:\n{stdout}\nStandard Error:\n{stderr}",
        .program.display()
    )]
    OracleFailed {
        program: PathBuf,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    /// The counting oracle did not finish within the configured timeout
    #[error("K-mer counter '{}' timed out after {secs}s", .program.display())]
    OracleTimeout { program: PathBuf, secs: u64 },

    /// Malformed k-mer table or other structured input
    #[error("Parse error in {}: line {line}: {message}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Invalid k-mer length
    #[error("K-mer length {k} is invalid (must be between {min} and {max})")]
    InvalidKmerLength { k: usize, min: usize, max: usize },

    /// Occurrence thresholds out of order
    #[error("Maximum count ({max}) must be equal to or greater than minimum count ({min})")]
    InvalidThresholds { min: u64, max: u64 },

    /// Genome list contained no usable entries
    #[error("Genome list {} contains no genome paths", .0.display())]
    EmptyGenomeList(PathBuf),

    /// Vocabulary too large for 32-bit column indices
    #[error("Vocabulary of {0} k-mers exceeds the 32-bit column index range")]
    VocabularyTooLarge(usize),

    /// Temporary directory lacks free space
    #[error(
        "Temporary directory '{}' has insufficient space ({available_gb:.2} GB available, {required_gb:.0} GB required)",
        .path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        available_gb: f64,
        required_gb: f64,
    },

    /// Memory allocation failed while growing CSR buffers
    #[error("Memory allocation failed: requested {0} elements")]
    OutOfMemory(usize),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Background thread failure
    #[error("Thread error: {0}")]
    Thread(String),

    /// Generic anyhow error for complex nested errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KmxError {
    /// Create a Parse error for a given file and line
    pub fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    /// Create an InvalidKmerLength error with current and valid ranges
    pub fn invalid_kmer_length(k: usize, min: usize, max: usize) -> Self {
        Self::InvalidKmerLength { k, min, max }
    }

    /// Create a Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an I/O error from a message
    pub fn io_error(message: impl Into<String>) -> Self {
        Self::Io(std::io::Error::other(message.into()))
    }

    /// Captured standard error of a failed oracle run, if any
    pub fn oracle_stderr(&self) -> Option<&str> {
        match self {
            Self::OracleFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// Whether this error came from the counting oracle
    pub fn is_oracle_error(&self) -> bool {
        matches!(
            self,
            Self::OracleNotFound { .. } | Self::OracleFailed { .. } | Self::OracleTimeout { .. }
        )
    }
}

/// Result type alias for KMX operations
pub type Result<T> = std::result::Result<T, KmxError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let err = KmxError::invalid_kmer_length(200, 8, 136);
        assert_eq!(err.to_string(), "K-mer length 200 is invalid (must be between 8 and 136)");

        let err = KmxError::parse("/tmp/out.csv", 3, "missing frequency column");
        assert_eq!(err.to_string(), "Parse error in /tmp/out.csv: line 3: missing frequency column");

        let err = KmxError::InvalidThresholds { min: 5, max: 2 };
        assert!(err.to_string().contains("(2)"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let kmx_err: KmxError = io_err.into();

        match kmx_err {
            KmxError::Io(_) => (),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_oracle_error_classification() {
        let err = KmxError::OracleTimeout {
            program: PathBuf::from("gerbil"),
            secs: 30,
        };
        assert!(err.is_oracle_error());
        assert!(err.oracle_stderr().is_none());
        assert!(err.to_string().contains("timed out after 30s"));

        assert!(!KmxError::config("bad").is_oracle_error());
    }
}
