//! Error taxonomy for the alignment pipeline.
//!
//! Every failure surfaces as one of the kinds below. Worker threads record
//! the first error they hit and raise the pipeline abort flag; the workflow
//! coordinator observes it between stages and reports a single aggregated
//! diagnostic.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlignError {
    /// Missing file or invalid configuration. Fatal at startup.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Unusable reference data (bad magic, version out of range, truncated
    /// mask file). Always fatal.
    #[error("reference corrupt: {0}")]
    ReferenceCorrupt(String),

    /// Malformed cluster data. Recoverable per cluster: the cluster is
    /// aligned as all-N and a diagnostic counter is bumped. Only surfaces
    /// as an error when the input stream itself is unreadable.
    #[error("input data: {0}")]
    InputData(String),

    /// Memory or disk exhaustion, reported with the failing stage.
    #[error("resource exhausted at {stage}: {reason}")]
    Resource { stage: &'static str, reason: String },

    /// An internal invariant was violated. Indicates a bug.
    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    RawIo(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] bincode::Error),
}

impl AlignError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AlignError::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code per the CLI contract: 2 for precondition
    /// failures, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            AlignError::Precondition(_) => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, AlignError>;

/// Internal invariant check that produces `AlignError::Assertion` instead of
/// panicking, so worker threads can drain cleanly.
#[macro_export]
macro_rules! ensure_invariant {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::error::AlignError::Assertion(format!($($arg)*)));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_cli_contract() {
        assert_eq!(AlignError::Precondition("x".into()).exit_code(), 2);
        assert_eq!(AlignError::ReferenceCorrupt("x".into()).exit_code(), 1);
        assert_eq!(
            AlignError::Resource {
                stage: "bin-merge",
                reason: "disk full".into()
            }
            .exit_code(),
            1
        );
    }
}
