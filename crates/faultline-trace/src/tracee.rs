//! ptrace-backed processes.

use std::fs::OpenOptions;
use std::io::{self, IoSlice, IoSliceMut};
use std::process::{Command, Stdio};

use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::uio::{RemoteIoVec, process_vm_readv, process_vm_writev};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::control::{LaunchSpec, Launcher, ProcessControl, Stop};
use crate::error::{Result, TraceError};
use crate::regs::Registers;
use crate::seccomp;

const AT_NULL: u64 = 0;
const AT_SYSINFO_EHDR: u64 = 33;
const PR_SET_SECCOMP_MODE_FILTER: libc::c_ulong = 2;

/// Launches real processes under ptrace.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtraceLauncher;

impl Launcher for PtraceLauncher {
    type Process = Tracee;

    fn launch(&mut self, spec: &LaunchSpec) -> Result<Tracee> {
        Tracee::spawn(spec)
    }
}

/// A child process traced with ptrace and filtered with seccomp.
///
/// Dropping a `Tracee` kills it.
#[derive(Debug)]
pub struct Tracee {
    pid: Pid,
    running: bool,
    /// Signal observed at a signal-delivery stop, injected on the next resume.
    pending_signal: Option<Signal>,
}

impl Tracee {
    /// Forks, installs the seccomp filter in the child and execs `spec.argv`.
    ///
    /// Returns with the child stopped after exec, before its first
    /// instruction.
    pub fn spawn(spec: &LaunchSpec) -> Result<Self> {
        let (program, args) = spec.argv.split_first().ok_or(TraceError::EmptyCommand)?;
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.stdout)
            .map_err(|source| TraceError::Output {
                path: spec.stdout.clone(),
                source,
            })?;

        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).stdout(stdout);
        install_filter_hook(&mut command, seccomp::trace_filter(&spec.syscalls));

        let child = command.spawn().map_err(|source| TraceError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = Pid::from_raw(child.id() as i32);

        // From here on an early return drops the tracee, which kills the child.
        let mut tracee = Self {
            pid,
            running: true,
            pending_signal: None,
        };
        tracee.expect_exec_trap(waitpid(pid, Some(WaitPidFlag::__WALL)))?;
        ptrace::setoptions(
            pid,
            ptrace::Options::PTRACE_O_TRACESECCOMP
                | ptrace::Options::PTRACE_O_TRACESYSGOOD
                | ptrace::Options::PTRACE_O_TRACEEXEC
                | ptrace::Options::PTRACE_O_EXITKILL,
        )
        .map_err(|e| TraceError::ptrace("setoptions", pid.as_raw(), e))?;

        if spec.disable_vdso {
            tracee.disable_vdso()?;
        }
        debug!(pid = pid.as_raw(), program = %program, "tracee started");
        Ok(tracee)
    }

    /// Checks the first stop of a freshly spawned child, which must be the
    /// post-exec trap.
    fn expect_exec_trap(&mut self, status: nix::Result<WaitStatus>) -> Result<()> {
        match status {
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => Ok(()),
            Ok(other) => {
                if matches!(other, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
                    // already reaped
                    self.running = false;
                }
                Err(TraceError::UnexpectedStop {
                    pid: self.pid.as_raw(),
                    detail: format!("{other:?} instead of post-exec trap"),
                })
            }
            Err(source) => Err(TraceError::ptrace("waitpid", self.pid.as_raw(), source)),
        }
    }

    /// Zeroes `AT_SYSINFO_EHDR` in the initial auxiliary vector so the
    /// dynamic loader never maps the vDSO.
    fn disable_vdso(&mut self) -> Result<()> {
        let mut cursor = self.registers()?.sp;
        let argc = self.read_u64(cursor)?;
        // argc, argv[0..argc], NULL
        cursor += 8 * (argc + 2);
        while self.read_u64(cursor)? != 0 {
            cursor += 8;
        }
        cursor += 8;

        loop {
            let key = self.read_u64(cursor)?;
            if key == AT_SYSINFO_EHDR {
                return self.write_memory(cursor + 8, &0u64.to_ne_bytes());
            }
            if key == AT_NULL {
                warn!(pid = self.pid.as_raw(), "no vDSO entry in auxv");
                return Ok(());
            }
            cursor += 16;
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.running {
            Ok(())
        } else {
            Err(TraceError::NotRunning(self.pid.as_raw()))
        }
    }

    fn wait_stop(&mut self) -> Result<Stop> {
        loop {
            let status = waitpid(self.pid, Some(WaitPidFlag::__WALL))
                .map_err(|e| TraceError::ptrace("waitpid", self.pid.as_raw(), e))?;
            match status {
                WaitStatus::PtraceEvent(_, _, event)
                    if event == ptrace::Event::PTRACE_EVENT_SECCOMP as i32 =>
                {
                    return Ok(Stop::Seccomp);
                }
                WaitStatus::PtraceEvent(_, _, event) => {
                    debug!(pid = self.pid.as_raw(), event, "skipping ptrace event");
                    ptrace::cont(self.pid, None)
                        .map_err(|e| TraceError::ptrace("cont", self.pid.as_raw(), e))?;
                }
                WaitStatus::PtraceSyscall(_) => return Ok(Stop::SyscallExit),
                WaitStatus::Stopped(_, sig) => {
                    self.pending_signal = Some(sig);
                    return Ok(Stop::Signal(sig as i32));
                }
                WaitStatus::Exited(_, code) => {
                    self.running = false;
                    return Ok(Stop::Exited(code));
                }
                WaitStatus::Signaled(_, sig, _) => {
                    self.running = false;
                    return Ok(Stop::Killed(sig as i32));
                }
                WaitStatus::Continued(_) | WaitStatus::StillAlive => {}
            }
        }
    }
}

/// Registers the pre-exec hook that makes the child traceable and filtered.
#[allow(unsafe_code)]
fn install_filter_hook(command: &mut Command, filter: Vec<libc::sock_filter>) {
    use std::os::unix::process::CommandExt;

    // SAFETY: the hook runs between fork and exec. It only issues the
    // ptrace and prctl syscalls and reads `filter`, which was allocated
    // before the fork.
    unsafe {
        command.pre_exec(move || {
            ptrace::traceme().map_err(io::Error::from)?;
            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            let program = libc::sock_fprog {
                len: filter.len() as libc::c_ushort,
                filter: filter.as_ptr().cast_mut(),
            };
            if libc::prctl(
                libc::PR_SET_SECCOMP,
                PR_SET_SECCOMP_MODE_FILTER,
                &raw const program,
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

impl ProcessControl for Tracee {
    fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    fn resume(&mut self) -> Result<Stop> {
        self.check_running()?;
        let signal = self.pending_signal.take();
        ptrace::cont(self.pid, signal)
            .map_err(|e| TraceError::ptrace("cont", self.pid.as_raw(), e))?;
        self.wait_stop()
    }

    fn step_syscall(&mut self) -> Result<Stop> {
        self.check_running()?;
        let signal = self.pending_signal.take();
        ptrace::syscall(self.pid, signal)
            .map_err(|e| TraceError::ptrace("syscall", self.pid.as_raw(), e))?;
        self.wait_stop()
    }

    fn registers(&mut self) -> Result<Registers> {
        self.check_running()?;
        let raw = ptrace::getregs(self.pid)
            .map_err(|e| TraceError::ptrace("getregs", self.pid.as_raw(), e))?;
        Ok(Registers {
            syscall: raw.orig_rax,
            ret: raw.rax,
            args: [raw.rdi, raw.rsi, raw.rdx, raw.r10, raw.r8, raw.r9],
            sp: raw.rsp,
        })
    }

    fn set_registers(&mut self, regs: &Registers) -> Result<()> {
        self.check_running()?;
        let mut raw = ptrace::getregs(self.pid)
            .map_err(|e| TraceError::ptrace("getregs", self.pid.as_raw(), e))?;
        raw.orig_rax = regs.syscall;
        raw.rax = regs.ret;
        raw.rdi = regs.args[0];
        raw.rsi = regs.args[1];
        raw.rdx = regs.args[2];
        raw.r10 = regs.args[3];
        raw.r8 = regs.args[4];
        raw.r9 = regs.args[5];
        raw.rsp = regs.sp;
        ptrace::setregs(self.pid, raw)
            .map_err(|e| TraceError::ptrace("setregs", self.pid.as_raw(), e))
    }

    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        if len == 0 {
            return Ok(());
        }
        let remote = [RemoteIoVec {
            base: addr as usize,
            len,
        }];
        let read = process_vm_readv(self.pid, &mut [IoSliceMut::new(buf)], &remote).map_err(
            |e| TraceError::Memory {
                pid: self.pid.as_raw(),
                addr,
                reason: e.to_string(),
            },
        )?;
        if read != len {
            return Err(TraceError::Memory {
                pid: self.pid.as_raw(),
                addr,
                reason: format!("short read: {read} of {len} bytes"),
            });
        }
        Ok(())
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let remote = [RemoteIoVec {
            base: addr as usize,
            len: data.len(),
        }];
        let written = process_vm_writev(self.pid, &[IoSlice::new(data)], &remote).map_err(|e| {
            TraceError::Memory {
                pid: self.pid.as_raw(),
                addr,
                reason: e.to_string(),
            }
        })?;
        if written != data.len() {
            return Err(TraceError::Memory {
                pid: self.pid.as_raw(),
                addr,
                reason: format!("short write: {written} of {} bytes", data.len()),
            });
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => return Err(TraceError::ptrace("kill", self.pid.as_raw(), e)),
        }
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..))
                | Err(nix::errno::Errno::ECHILD) => break,
                Ok(_) => {}
                Err(e) => return Err(TraceError::ptrace("waitpid", self.pid.as_raw(), e)),
            }
        }
        self.running = false;
        debug!(pid = self.pid.as_raw(), "tracee killed");
        Ok(())
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            warn!(pid = self.pid.as_raw(), error = %e, "failed to kill tracee on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    fn untraced(program: &str, args: &[&str]) -> Tracee {
        let child = Command::new(program).args(args).spawn().unwrap();
        Tracee {
            pid: Pid::from_raw(child.id() as i32),
            running: true,
            pending_signal: None,
        }
    }

    #[test]
    fn unexpected_first_stop_kills_the_child() {
        let mut tracee = untraced("sleep", &["30"]);
        let pid = tracee.pid;

        let status = Ok(WaitStatus::Stopped(pid, Signal::SIGSTOP));
        let err = tracee.expect_exec_trap(status).unwrap_err();
        assert!(matches!(err, TraceError::UnexpectedStop { .. }), "{err}");
        assert!(tracee.running);

        drop(tracee);
        assert_eq!(signal::kill(pid, None), Err(nix::errno::Errno::ESRCH));
    }

    #[test]
    fn child_that_exits_before_exec_trap_is_not_waited_twice() {
        let mut tracee = untraced("true", &[]);
        let status = waitpid(tracee.pid, Some(WaitPidFlag::__WALL));
        assert!(matches!(status, Ok(WaitStatus::Exited(_, 0))));

        let err = tracee.expect_exec_trap(status).unwrap_err();
        assert!(matches!(err, TraceError::UnexpectedStop { .. }), "{err}");
        assert!(!tracee.running);
    }
}
