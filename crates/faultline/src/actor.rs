//! Pieces shared by the node and client virtualizers.

use std::fmt;

use faultline_trace::{ProcessControl, Registers, Stop, TraceError};

use crate::error::Result;

/// Longest path read out of a tracee.
pub(crate) const PATH_MAX: usize = 4096;

/// How a traced process ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Code(i32),
    Signal(i32),
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// Runs the syscall the process is stopped at and returns the registers at
/// its exit.
pub(crate) fn step_to_exit<P: ProcessControl>(process: &mut P) -> Result<Registers> {
    loop {
        match process.step_syscall()? {
            Stop::SyscallExit => return Ok(process.registers()?),
            Stop::Signal(_) => {}
            other => {
                return Err(TraceError::UnexpectedStop {
                    pid: process.pid(),
                    detail: format!("{other:?} while stepping over a syscall"),
                }
                .into());
            }
        }
    }
}

/// Reads a NUL-terminated path argument.
pub(crate) fn read_path<P: ProcessControl>(process: &mut P, addr: u64) -> Result<String> {
    let raw = process.read_string(addr, PATH_MAX)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}
