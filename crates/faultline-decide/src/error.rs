//! Error types for the decision engine.

use std::path::PathBuf;
use thiserror::Error;

/// Decision engine errors.
#[derive(Debug, Error)]
pub enum DecideError {
    /// IO error while reading or writing a trace or coverage file.
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The recorded trace asked a different question than the live run.
    #[error("replay diverged: expected '{expected}' but trace has '{found}'")]
    Divergence { expected: char, found: char },

    /// The recorded trace ended while the live run still had questions.
    #[error("replay diverged: expected '{expected}' but trace is exhausted")]
    Exhausted { expected: char },

    /// The recorded actor cannot run in the current state.
    #[error("replay diverged: actor {actor} cannot be chosen in the current state")]
    ImpossibleActor { actor: i64 },

    /// The trace file is not a sequence of `<char><int>[,]` tokens.
    #[error("malformed trace at byte {offset}: {reason}")]
    MalformedTrace { offset: usize, reason: String },

    /// The coverage file does not parse.
    #[error("malformed coverage file at line {line}: {reason}")]
    MalformedCoverage { line: usize, reason: String },

    /// The coverage file was written with a different window.
    #[error("coverage file chain length {found} does not match configured {expected}")]
    ChainLength { expected: usize, found: usize },

    /// A transaction was started with the wrong number of past traces.
    #[error("visited window has {found} entries, expected {expected}")]
    WindowLength { expected: usize, found: usize },
}

impl DecideError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true when the error means the replayed run no longer matches
    /// the recorded one.
    pub fn is_divergence(&self) -> bool {
        matches!(
            self,
            Self::Divergence { .. } | Self::Exhausted { .. } | Self::ImpossibleActor { .. }
        )
    }
}

/// Result type for decision engine operations.
pub type Result<T> = std::result::Result<T, DecideError>;
