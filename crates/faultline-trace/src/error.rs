//! Error types for process control.

use std::path::PathBuf;
use thiserror::Error;

/// Process control errors.
#[derive(Debug, Error)]
pub enum TraceError {
    /// The launch command has no program.
    #[error("empty command line")]
    EmptyCommand,

    /// Opening the stdout capture file failed.
    #[error("failed to open output file {path}: {source}")]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Forking or executing the traced program failed.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// A ptrace or wait request was rejected by the kernel.
    #[error("{op} failed for pid {pid}: {source}")]
    Ptrace {
        op: &'static str,
        pid: i32,
        source: nix::Error,
    },

    /// Reading or writing tracee memory failed.
    #[error("memory access at {addr:#x} in pid {pid} failed: {reason}")]
    Memory { pid: i32, addr: u64, reason: String },

    /// The tracee stopped in a way the caller did not expect.
    #[error("pid {pid} stopped unexpectedly: {detail}")]
    UnexpectedStop { pid: i32, detail: String },

    /// The process has already exited or been killed.
    #[error("pid {0} is not running")]
    NotRunning(i32),

    /// A scripted launcher ran out of scripts.
    #[error("no scripted process left to launch for {0}")]
    ScriptExhausted(String),
}

impl TraceError {
    pub(crate) fn ptrace(op: &'static str, pid: i32, source: nix::Error) -> Self {
        Self::Ptrace { op, pid, source }
    }
}

/// Result type for process control.
pub type Result<T> = std::result::Result<T, TraceError>;
