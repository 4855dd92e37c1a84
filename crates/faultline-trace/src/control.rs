//! The interface between syscall virtualizers and a traced process.

use std::path::PathBuf;

use crate::error::Result;
use crate::regs::Registers;
use crate::syscall::Syscall;

/// Why a traced process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Entry to a syscall the seccomp filter traps.
    Seccomp,
    /// Exit from the syscall most recently stepped over.
    SyscallExit,
    /// Signal-delivery stop. The signal is delivered on the next resume.
    Signal(i32),
    /// Normal exit with a status code.
    Exited(i32),
    /// Terminated by a signal.
    Killed(i32),
}

impl Stop {
    /// True once the process no longer exists.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited(_) | Self::Killed(_))
    }
}

/// Control over one traced process.
///
/// A virtualizer resumes the process until it traps on a syscall entry,
/// inspects and rewrites registers and memory, optionally steps over the
/// syscall to inspect its result, then resumes again.
pub trait ProcessControl {
    fn pid(&self) -> i32;

    /// Runs until the next trapped syscall entry, signal, or exit.
    fn resume(&mut self) -> Result<Stop>;

    /// Executes the pending syscall and stops at its exit.
    fn step_syscall(&mut self) -> Result<Stop>;

    fn registers(&mut self) -> Result<Registers>;

    fn set_registers(&mut self, regs: &Registers) -> Result<()>;

    /// Fills `buf` from tracee memory starting at `addr`.
    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<()>;

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// Kills the process and reaps it. Killing a dead process is a no-op.
    fn kill(&mut self) -> Result<()>;

    /// Reads a NUL-terminated string of at most `max` bytes.
    ///
    /// Reads in chunks that never cross a page boundary so a string ending
    /// just before an unmapped page is still readable.
    fn read_string(&mut self, addr: u64, max: usize) -> Result<Vec<u8>> {
        const PAGE: u64 = 4096;
        let mut out = Vec::new();
        let mut cursor = addr;
        while out.len() < max {
            let to_page_end = (PAGE - cursor % PAGE) as usize;
            let mut chunk = vec![0u8; to_page_end.min(max - out.len())];
            self.read_memory(cursor, &mut chunk)?;
            if let Some(end) = chunk.iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..end]);
                return Ok(out);
            }
            cursor += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    fn read_u64(&mut self, addr: u64) -> Result<u64> {
        let mut word = [0u8; 8];
        self.read_memory(addr, &mut word)?;
        Ok(u64::from_ne_bytes(word))
    }

    fn read_u32(&mut self, addr: u64) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read_memory(addr, &mut word)?;
        Ok(u32::from_ne_bytes(word))
    }
}

/// What to start and how to trace it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// File that receives the process's stdout, appended to.
    pub stdout: PathBuf,
    /// Syscalls the seccomp filter traps.
    pub syscalls: Vec<Syscall>,
    /// Clears `AT_SYSINFO_EHDR` so time calls go through the kernel.
    pub disable_vdso: bool,
}

impl LaunchSpec {
    pub fn program(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }
}

/// Starts traced processes.
pub trait Launcher {
    type Process: ProcessControl;

    /// Starts the process and returns it stopped before its first
    /// instruction, filter installed.
    fn launch(&mut self, spec: &LaunchSpec) -> Result<Self::Process>;
}
