//! Error types for the harness core.

use std::path::PathBuf;
use thiserror::Error;

use faultline_config::ConfigError;
use faultline_decide::DecideError;
use faultline_net::NetError;
use faultline_trace::TraceError;

/// Harness errors.
///
/// Expected outcomes of a run (an actor exiting on its own, a failed
/// validation) are not errors; see [`crate::Outcome`].
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The decision engine failed or a replay diverged.
    #[error(transparent)]
    Decide(#[from] DecideError),

    /// The proxy or the correlation map failed.
    #[error(transparent)]
    Net(#[from] NetError),

    /// A trace or coverage file named by the configuration could not be
    /// opened or read when the run started.
    #[error("unusable input file: {0}")]
    Input(#[source] DecideError),

    /// Controlling a traced process failed.
    #[error(transparent)]
    Trace(#[from] TraceError),

    /// Filesystem error while maintaining crash-consistency backups.
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The validator could not be started.
    #[error("failed to run validator {program}: {source}")]
    Validator {
        program: String,
        source: std::io::Error,
    },

    /// A traced process made a syscall the harness cannot model.
    #[error("node {node} made unsupported syscall {syscall}")]
    Unsupported { node: usize, syscall: &'static str },

    /// Harness bookkeeping reached an inconsistent state.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for a run that ended with this error.
    ///
    /// Bad configuration and unreadable input files are usage errors (5);
    /// everything else is a harness failure (1).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_)
            | Self::Input(_)
            | Self::Decide(
                DecideError::MalformedTrace { .. }
                | DecideError::MalformedCoverage { .. }
                | DecideError::ChainLength { .. },
            ) => 5,
            _ => 1,
        }
    }
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_map_to_five() {
        let config = Error::from(ConfigError::ValidationError("bad".into()));
        assert_eq!(config.exit_code(), 5);

        let coverage = Error::from(DecideError::ChainLength {
            expected: 10,
            found: 4,
        });
        assert_eq!(coverage.exit_code(), 5);

        let missing = Error::Input(DecideError::Io {
            path: "trace_7".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        assert_eq!(missing.exit_code(), 5);
    }

    #[test]
    fn divergence_is_a_harness_failure() {
        let err = Error::from(DecideError::Divergence {
            expected: 'n',
            found: 's',
        });
        assert_eq!(err.exit_code(), 1);
        assert_eq!(Error::Internal("x".into()).exit_code(), 1);

        // a trace that stops being writable mid-run is not a usage error
        let flush = Error::from(DecideError::Io {
            path: "trace_7".into(),
            source: std::io::Error::from(std::io::ErrorKind::StorageFull),
        });
        assert_eq!(flush.exit_code(), 1);
    }
}
