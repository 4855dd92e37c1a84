//! The external consistency check run between scheduler steps.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{info, warn};

use crate::error::{Error, Result};

/// Runs the validate command to completion. Its stdout is appended to a log
/// file so every check of a run can be read back in order.
#[derive(Debug, Clone)]
pub struct Validator {
    argv: Vec<String>,
    output: PathBuf,
}

impl Validator {
    pub fn new(argv: Vec<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            argv,
            output: output.into(),
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Returns whether the cluster passed.
    pub fn run(&self) -> Result<bool> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| Error::Internal("empty validate command".to_string()))?;
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output)
            .map_err(|e| Error::io(&self.output, e))?;

        info!(command = %self.argv.join(" "), "validating");
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .status()
            .map_err(|source| Error::Validator {
                program: program.clone(),
                source,
            })?;

        if status.success() {
            Ok(true)
        } else {
            warn!(%status, "validation failed");
            Ok(false)
        }
    }
}
