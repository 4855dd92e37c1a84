//! # faultline-trace
//!
//! Runs programs under ptrace with a seccomp filter that traps a chosen set
//! of syscalls, and exposes each trap through [`ProcessControl`]: read and
//! rewrite registers, read and write memory, step over the syscall, resume.
//!
//! Two implementations of the interface ship here:
//!
//! - [`Tracee`] / [`PtraceLauncher`]: real child processes on x86_64 Linux.
//! - `ScriptedProcess` / `ScriptedLauncher` (feature `scripted`): in-memory
//!   doubles that replay a syscall script, for testing virtualizers without
//!   spawning anything.
//!
//! The crate is x86_64 Linux only: syscall numbers, the register file and
//! the auxiliary vector layout are architecture specific.

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("faultline-trace supports x86_64 Linux only");

pub mod abi;
mod control;
mod error;
mod regs;
pub mod seccomp;
mod syscall;
mod tracee;

#[cfg(any(test, feature = "scripted"))]
mod scripted;

pub use control::{LaunchSpec, Launcher, ProcessControl, Stop};
pub use error::{Result, TraceError};
pub use regs::Registers;
pub use syscall::{CLIENT_SYSCALLS, NODE_SYSCALLS, Syscall};
pub use tracee::{PtraceLauncher, Tracee};

#[cfg(any(test, feature = "scripted"))]
pub use scripted::{LaunchLog, Probe, Script, ScriptedLauncher, ScriptedProcess};
