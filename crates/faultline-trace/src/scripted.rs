//! An in-memory process that replays a fixed syscall script.
//!
//! Each scripted syscall traps at entry with the given registers. When it is
//! stepped over (or resumed past) it "executes": the return register is set
//! to the scripted value, or `-ENOSYS` if the tracer skipped it, and the
//! scripted output bytes are written to memory. Registers as the tracer left
//! them at execution time are recorded in the [`Probe`] for assertions.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use crate::control::{LaunchSpec, Launcher, ProcessControl, Stop};
use crate::error::{Result, TraceError};
use crate::regs::Registers;
use crate::syscall::Syscall;

const DEFAULT_SP: u64 = 0x7fff_0000;

#[derive(Debug, Clone)]
enum Step {
    Syscall {
        regs: Registers,
        ret: i64,
        writes: Vec<(u64, Vec<u8>)>,
    },
    Signal(i32),
    Exit(i32),
}

/// Builder for a scripted process.
#[derive(Debug, Clone, Default)]
pub struct Script {
    steps: VecDeque<Step>,
    memory: BTreeMap<u64, u8>,
    sp: Option<u64>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack pointer reported at every trap.
    pub fn stack_pointer(mut self, sp: u64) -> Self {
        self.sp = Some(sp);
        self
    }

    /// Initial memory contents.
    pub fn memory(mut self, addr: u64, bytes: &[u8]) -> Self {
        for (offset, &byte) in bytes.iter().enumerate() {
            self.memory.insert(addr + offset as u64, byte);
        }
        self
    }

    /// Maps `len` zeroed bytes at `addr`.
    pub fn zeroed(self, addr: u64, len: usize) -> Self {
        self.memory(addr, &vec![0; len])
    }

    pub fn syscall(mut self, syscall: Syscall, args: &[u64], ret: i64) -> Self {
        let mut regs = Registers {
            syscall: syscall.number() as u64,
            sp: self.sp.unwrap_or(DEFAULT_SP),
            ..Registers::default()
        };
        regs.args[..args.len()].copy_from_slice(args);
        self.steps.push_back(Step::Syscall {
            regs,
            ret,
            writes: Vec::new(),
        });
        self
    }

    /// Kernel output the previous syscall writes to memory when it executes.
    ///
    /// # Panics
    ///
    /// Panics if the previous step is not a syscall.
    pub fn output(mut self, addr: u64, bytes: &[u8]) -> Self {
        match self.steps.back_mut() {
            Some(Step::Syscall { writes, .. }) => writes.push((addr, bytes.to_vec())),
            _ => panic!("output() must follow syscall()"),
        }
        self
    }

    pub fn signal(mut self, signal: i32) -> Self {
        self.steps.push_back(Step::Signal(signal));
        self
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.steps.push_back(Step::Exit(code));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Default)]
struct State {
    steps: VecDeque<Step>,
    memory: BTreeMap<u64, u8>,
    regs: Registers,
    /// Result and writes of the syscall the process is stopped in.
    in_flight: Option<(i64, Vec<(u64, Vec<u8>)>)>,
    executed: Vec<Registers>,
    finished: Option<Stop>,
    killed: bool,
}

impl State {
    fn execute_in_flight(&mut self) {
        if let Some((ret, writes)) = self.in_flight.take() {
            self.executed.push(self.regs);
            if self.regs.is_skipped() {
                self.regs.set_errno(libc::ENOSYS);
            } else {
                self.regs.set_return_value(ret);
                for (addr, bytes) in writes {
                    for (offset, byte) in bytes.into_iter().enumerate() {
                        self.memory.insert(addr + offset as u64, byte);
                    }
                }
            }
        }
    }
}

/// Read access to a scripted process after it has been handed to a
/// virtualizer.
#[derive(Debug, Clone)]
pub struct Probe(Rc<RefCell<State>>);

impl Probe {
    /// Registers of every executed syscall as the tracer left them.
    pub fn executed(&self) -> Vec<Registers> {
        self.0.borrow().executed.clone()
    }

    /// Reads memory; unmapped bytes read as `None`.
    pub fn memory(&self, addr: u64, len: usize) -> Vec<Option<u8>> {
        let state = self.0.borrow();
        (0..len as u64)
            .map(|offset| state.memory.get(&(addr + offset)).copied())
            .collect()
    }

    /// Reads mapped memory, panicking on unmapped bytes.
    pub fn bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        self.memory(addr, len)
            .into_iter()
            .enumerate()
            .map(|(i, b)| b.unwrap_or_else(|| panic!("unmapped byte at {:#x}", addr + i as u64)))
            .collect()
    }

    pub fn registers(&self) -> Registers {
        self.0.borrow().regs
    }

    pub fn remaining_steps(&self) -> usize {
        self.0.borrow().steps.len()
    }

    pub fn was_killed(&self) -> bool {
        self.0.borrow().killed
    }
}

/// A process double driven by a [`Script`].
#[derive(Debug)]
pub struct ScriptedProcess {
    pid: i32,
    state: Rc<RefCell<State>>,
}

impl ScriptedProcess {
    pub fn new(pid: i32, script: Script) -> (Self, Probe) {
        let state = Rc::new(RefCell::new(State {
            steps: script.steps,
            memory: script.memory,
            regs: Registers {
                sp: script.sp.unwrap_or(DEFAULT_SP),
                ..Registers::default()
            },
            ..State::default()
        }));
        let probe = Probe(Rc::clone(&state));
        (Self { pid, state }, probe)
    }

    fn not_running(&self) -> TraceError {
        TraceError::NotRunning(self.pid)
    }

    fn unmapped(&self, addr: u64) -> TraceError {
        TraceError::Memory {
            pid: self.pid,
            addr,
            reason: "unmapped".to_string(),
        }
    }
}

impl ProcessControl for ScriptedProcess {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn resume(&mut self) -> Result<Stop> {
        let mut state = self.state.borrow_mut();
        if let Some(stop) = state.finished {
            return Err(if state.killed {
                self.not_running()
            } else {
                TraceError::UnexpectedStop {
                    pid: self.pid,
                    detail: format!("resumed after {stop:?}"),
                }
            });
        }
        state.execute_in_flight();
        // An exhausted script behaves like a clean exit.
        let step = state.steps.pop_front().unwrap_or(Step::Exit(0));
        match step {
            Step::Syscall { regs, ret, writes } => {
                state.regs = regs;
                state.in_flight = Some((ret, writes));
                Ok(Stop::Seccomp)
            }
            Step::Signal(signal) => Ok(Stop::Signal(signal)),
            Step::Exit(code) => {
                state.finished = Some(Stop::Exited(code));
                Ok(Stop::Exited(code))
            }
        }
    }

    fn step_syscall(&mut self) -> Result<Stop> {
        let mut state = self.state.borrow_mut();
        if state.finished.is_some() {
            return Err(self.not_running());
        }
        if state.in_flight.is_none() {
            return Err(TraceError::UnexpectedStop {
                pid: self.pid,
                detail: "step without a pending syscall".to_string(),
            });
        }
        state.execute_in_flight();
        Ok(Stop::SyscallExit)
    }

    fn registers(&mut self) -> Result<Registers> {
        let state = self.state.borrow();
        if state.finished.is_some() {
            return Err(self.not_running());
        }
        Ok(state.regs)
    }

    fn set_registers(&mut self, regs: &Registers) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.finished.is_some() {
            return Err(self.not_running());
        }
        state.regs = *regs;
        Ok(())
    }

    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let state = self.state.borrow();
        for (offset, slot) in buf.iter_mut().enumerate() {
            let at = addr + offset as u64;
            *slot = *state.memory.get(&at).ok_or_else(|| self.unmapped(at))?;
        }
        Ok(())
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        for (offset, &byte) in data.iter().enumerate() {
            state.memory.insert(addr + offset as u64, byte);
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.finished.is_none() {
            state.finished = Some(Stop::Killed(libc::SIGKILL));
            state.killed = true;
        }
        Ok(())
    }
}

/// Hands out scripted processes in order, one per launch.
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    scripts: VecDeque<Script>,
    next_pid: i32,
    launched: Rc<RefCell<Vec<(LaunchSpec, Probe)>>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: 100,
            ..Self::default()
        }
    }

    pub fn push(&mut self, script: Script) -> &mut Self {
        self.scripts.push_back(script);
        self
    }

    pub fn with(mut self, script: Script) -> Self {
        self.push(script);
        self
    }

    /// Every launch so far with the probe of the process it produced.
    pub fn launches(&self) -> LaunchLog {
        LaunchLog(Rc::clone(&self.launched))
    }
}

/// Shared view of a [`ScriptedLauncher`]'s launches.
#[derive(Debug, Clone)]
pub struct LaunchLog(Rc<RefCell<Vec<(LaunchSpec, Probe)>>>);

impl LaunchLog {
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn spec(&self, index: usize) -> LaunchSpec {
        self.0.borrow()[index].0.clone()
    }

    pub fn probe(&self, index: usize) -> Probe {
        self.0.borrow()[index].1.clone()
    }
}

impl Launcher for ScriptedLauncher {
    type Process = ScriptedProcess;

    fn launch(&mut self, spec: &LaunchSpec) -> Result<ScriptedProcess> {
        let script = self
            .scripts
            .pop_front()
            .ok_or_else(|| TraceError::ScriptExhausted(spec.program().to_string()))?;
        let pid = self.next_pid;
        self.next_pid += 1;
        let (process, probe) = ScriptedProcess::new(pid, script);
        self.launched.borrow_mut().push((spec.clone(), probe));
        Ok(process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_applies_result_and_writes() {
        let script = Script::new()
            .zeroed(0x1000, 4)
            .syscall(Syscall::GetRandom, &[0x1000, 4, 0], 4)
            .output(0x1000, &[1, 2, 3, 4])
            .exit(0);
        let (mut process, probe) = ScriptedProcess::new(1, script);

        assert_eq!(process.resume().unwrap(), Stop::Seccomp);
        assert_eq!(process.registers().unwrap().syscall_number(), libc::SYS_getrandom);
        assert_eq!(process.step_syscall().unwrap(), Stop::SyscallExit);
        assert_eq!(process.registers().unwrap().return_value(), 4);
        assert_eq!(probe.bytes(0x1000, 4), vec![1, 2, 3, 4]);
        assert_eq!(process.resume().unwrap(), Stop::Exited(0));
        assert!(process.resume().is_err());
    }

    #[test]
    fn skipped_syscall_returns_enosys_without_writes() {
        let script = Script::new()
            .zeroed(0x2000, 1)
            .syscall(Syscall::RecvFrom, &[3, 0x2000, 1], 1)
            .output(0x2000, &[9]);
        let (mut process, probe) = ScriptedProcess::new(1, script);

        process.resume().unwrap();
        let mut regs = process.registers().unwrap();
        regs.skip_syscall();
        process.set_registers(&regs).unwrap();
        process.step_syscall().unwrap();

        assert_eq!(
            process.registers().unwrap().return_value(),
            -i64::from(libc::ENOSYS)
        );
        assert_eq!(probe.bytes(0x2000, 1), vec![0]);
        assert!(probe.executed()[0].is_skipped());
    }

    #[test]
    fn resume_executes_pending_syscall() {
        let script = Script::new()
            .syscall(Syscall::Write, &[3, 0, 10], 10)
            .syscall(Syscall::Fsync, &[3], 0);
        let (mut process, probe) = ScriptedProcess::new(1, script);

        process.resume().unwrap();
        let mut regs = process.registers().unwrap();
        regs.set_arg(2, 5);
        process.set_registers(&regs).unwrap();
        process.resume().unwrap();

        assert_eq!(probe.executed()[0].arg(2), 5);
        assert_eq!(probe.remaining_steps(), 0);
    }

    #[test]
    fn read_string_stops_at_nul() {
        let script = Script::new().memory(0x3000, b"/data/file\0garbage");
        let (mut process, _) = ScriptedProcess::new(1, script);
        assert_eq!(process.read_string(0x3000, 256).unwrap(), b"/data/file");
        assert!(process.read_memory(0x9000, &mut [0u8; 1]).is_err());
    }

    #[test]
    fn launcher_hands_out_scripts_in_order() {
        let mut launcher = ScriptedLauncher::new()
            .with(Script::new().exit(1))
            .with(Script::new().exit(2));
        let log = launcher.launches();
        let spec = LaunchSpec {
            argv: vec!["node".into()],
            stdout: "out".into(),
            syscalls: vec![],
            disable_vdso: false,
        };

        let mut first = launcher.launch(&spec).unwrap();
        let mut second = launcher.launch(&spec).unwrap();
        assert!(launcher.launch(&spec).is_err());
        assert_eq!(first.resume().unwrap(), Stop::Exited(1));
        assert_eq!(second.resume().unwrap(), Stop::Exited(2));
        assert_eq!(log.len(), 2);
        assert_ne!(first.pid(), second.pid());
    }
}
