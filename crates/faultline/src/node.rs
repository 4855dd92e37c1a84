//! Virtualization of one node process.
//!
//! A node runs until it traps on a syscall the harness cares about. Time,
//! address and file-tracking syscalls are answered in place; everything that
//! needs a decision is reported to the orchestrator as a [`NodeEvent`] and
//! left pending until the matching `handle_*` or [`NodeVirtualizer::allow_event`]
//! call finishes it.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use faultline_net::{CorrelationMap, Liveness};
use faultline_trace::abi::{
    SOCKADDR_IN_LEN, TIME_STRUCT_LEN, TimePair, decode_sockaddr_in, encode_sockaddr_in,
};
use faultline_trace::{LaunchSpec, Launcher, ProcessControl, Registers, Stop, Syscall};
use tracing::{debug, info, trace, warn};

use crate::actor::{Termination, read_path, step_to_exit};
use crate::clock::{VirtualClock, poll_timeout, select_timeout};
use crate::durability::DurabilityTracker;
use crate::error::{Error, Result};

/// Bytes below the stack pointer the ABI lets leaf code use freely.
const RED_ZONE: u64 = 128;

const SOCK_TYPE_MASK: i32 = 0xf;

/// What the orchestrator has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// Blocked in `poll` or `select`; the node waits for messages.
    Polling,
    /// The process ended on its own.
    Exit(Termination),
    /// The node has been stopped by the harness.
    Dead,
    /// `getrandom` entry.
    Random,
    /// `connect` entry on a TCP socket.
    Connect,
    /// `sendto` entry on a TCP socket.
    SendTo,
    /// `fsync` or `fdatasync` entry.
    Fsync,
    /// `write` entry.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Polling,
    Random,
    Files,
    Network,
    Dead,
}

/// Result of [`NodeVirtualizer::handle_write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Completed,
    /// Only half the bytes were written and the node must be crashed.
    Torn,
}

/// Everything needed to (re)start a node.
#[derive(Debug, Clone)]
pub struct NodeSetup {
    pub index: usize,
    pub launch: LaunchSpec,
    /// Address peers use; the proxy listens here.
    pub virtual_ip: Ipv4Addr,
    /// Address the process really binds.
    pub real_ip: Ipv4Addr,
    /// Directory whose files get crash-consistency tracking.
    pub data_dir: String,
}

pub struct NodeVirtualizer<P> {
    index: usize,
    launch: LaunchSpec,
    virtual_ip: Ipv4Addr,
    real_ip: Ipv4Addr,
    process: Option<P>,
    state: NodeState,
    clock: VirtualClock,
    files: DurabilityTracker,
    /// TCP sockets, and whether their bind was redirected.
    sockets: BTreeMap<i32, bool>,
}

impl<P: ProcessControl> NodeVirtualizer<P> {
    pub fn start<L>(setup: NodeSetup, launcher: &mut L) -> Result<Self>
    where
        L: Launcher<Process = P>,
    {
        let process = launcher.launch(&setup.launch)?;
        info!(
            node = setup.index,
            pid = process.pid(),
            addr = %setup.virtual_ip,
            "node started"
        );
        Ok(Self {
            index: setup.index,
            launch: setup.launch,
            virtual_ip: setup.virtual_ip,
            real_ip: setup.real_ip,
            process: Some(process),
            state: NodeState::Stopped,
            clock: VirtualClock::new(),
            files: DurabilityTracker::new(setup.data_dir),
            sockets: BTreeMap::new(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    pub fn files(&self) -> &DurabilityTracker {
        &self.files
    }

    fn process(&mut self) -> Result<&mut P> {
        self.process
            .as_mut()
            .ok_or_else(|| Error::Internal(format!("node {} is not running", self.index)))
    }

    fn registers(&mut self) -> Result<Registers> {
        Ok(self.process()?.registers()?)
    }

    fn set_registers(&mut self, regs: &Registers) -> Result<()> {
        Ok(self.process()?.set_registers(regs)?)
    }

    fn step(&mut self) -> Result<Registers> {
        step_to_exit(self.process()?)
    }

    fn expect_state(&self, expected: NodeState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "node {} is {:?}, expected {expected:?}",
                self.index, self.state
            )))
        }
    }

    /// Runs the node until the next event the orchestrator must handle.
    pub fn to_next_event(&mut self, correlation: &mut CorrelationMap) -> Result<NodeEvent> {
        match self.state {
            NodeState::Dead => return Ok(NodeEvent::Dead),
            NodeState::Polling => self.finish_poll()?,
            NodeState::Stopped => {}
            other => {
                return Err(Error::Internal(format!(
                    "node {} resumed while {other:?}",
                    self.index
                )));
            }
        }

        loop {
            let stop = self.process()?.resume()?;
            match stop {
                Stop::Seccomp => {
                    self.clock.tick();
                    let regs = self.registers()?;
                    let Some(syscall) = Syscall::from_number(regs.syscall_number()) else {
                        continue;
                    };
                    trace!(node = self.index, syscall = syscall.name(), "trap");
                    if let Some(event) = self.dispatch(syscall, &regs, correlation)? {
                        return Ok(event);
                    }
                }
                Stop::SyscallExit | Stop::Signal(_) => {}
                Stop::Exited(code) => return Ok(self.exited(Termination::Code(code))),
                Stop::Killed(signal) => return Ok(self.exited(Termination::Signal(signal))),
            }
        }
    }

    fn exited(&mut self, termination: Termination) -> NodeEvent {
        warn!(node = self.index, %termination, "node exited");
        self.process = None;
        self.state = NodeState::Dead;
        NodeEvent::Exit(termination)
    }

    fn dispatch(
        &mut self,
        syscall: Syscall,
        regs: &Registers,
        correlation: &mut CorrelationMap,
    ) -> Result<Option<NodeEvent>> {
        let event = match syscall {
            Syscall::Poll | Syscall::Select => {
                self.state = NodeState::Polling;
                Some(NodeEvent::Polling)
            }
            Syscall::GetRandom => {
                self.state = NodeState::Random;
                Some(NodeEvent::Random)
            }
            Syscall::Write => {
                self.state = NodeState::Files;
                Some(NodeEvent::Write)
            }
            Syscall::Fsync | Syscall::FdataSync => {
                self.state = NodeState::Files;
                Some(NodeEvent::Fsync)
            }
            Syscall::Connect | Syscall::SendTo => {
                if !self.sockets.contains_key(&regs.fd_arg(0)) {
                    return Ok(None);
                }
                self.state = NodeState::Network;
                Some(if syscall == Syscall::Connect {
                    NodeEvent::Connect
                } else {
                    NodeEvent::SendTo
                })
            }
            Syscall::GetTimeOfDay => {
                self.answer_gettimeofday()?;
                None
            }
            Syscall::ClockGetTime => {
                self.answer_clock_gettime()?;
                None
            }
            Syscall::Open | Syscall::Creat => {
                self.handle_open(regs.arg(0))?;
                None
            }
            Syscall::OpenAt => {
                self.handle_open(regs.arg(1))?;
                None
            }
            Syscall::Mknod => {
                self.handle_mknod(regs.arg(0))?;
                None
            }
            Syscall::MknodAt => {
                self.handle_mknod(regs.arg(1))?;
                None
            }
            Syscall::Rename => {
                self.handle_rename(regs)?;
                None
            }
            Syscall::RenameAt | Syscall::SyncFs => {
                return Err(Error::Unsupported {
                    node: self.index,
                    syscall: syscall.name(),
                });
            }
            Syscall::Socket => {
                self.handle_socket(regs)?;
                None
            }
            Syscall::Bind => {
                self.handle_bind(regs)?;
                None
            }
            Syscall::GetSockName => {
                self.handle_getsockname(regs)?;
                None
            }
            Syscall::Accept | Syscall::Accept4 => {
                self.handle_accept(correlation)?;
                None
            }
            Syscall::Close => {
                let fd = regs.fd_arg(0);
                self.files.close(fd);
                self.sockets.remove(&fd);
                None
            }
            Syscall::GetPeerName | Syscall::RecvFrom | Syscall::Shutdown => None,
        };
        Ok(event)
    }

    fn answer_gettimeofday(&mut self) -> Result<()> {
        let exit = self.step()?;
        if exit.return_value() != 0 || exit.arg(0) == 0 {
            return Ok(());
        }
        let tv = self.clock.timeval().encode();
        self.process()?.write_memory(exit.arg(0), &tv)?;
        Ok(())
    }

    fn answer_clock_gettime(&mut self) -> Result<()> {
        let exit = self.step()?;
        if exit.return_value() != 0 || exit.arg(1) == 0 {
            return Ok(());
        }
        let ts = self.clock.timespec().encode();
        self.process()?.write_memory(exit.arg(1), &ts)?;
        Ok(())
    }

    /// Zeroes the pending poll or select timeout and advances the clock by
    /// the original timeout if nothing was ready.
    fn finish_poll(&mut self) -> Result<()> {
        let mut regs = self.registers()?;
        let requested = match Syscall::from_number(regs.syscall_number()) {
            Some(Syscall::Poll) => {
                let requested = poll_timeout(regs.fd_arg(2));
                regs.set_arg(2, 0);
                requested
            }
            Some(Syscall::Select) => {
                let tv_addr = regs.arg(4);
                let requested = if tv_addr == 0 {
                    None
                } else {
                    let mut raw = [0u8; TIME_STRUCT_LEN];
                    self.process()?.read_memory(tv_addr, &mut raw)?;
                    select_timeout(TimePair::decode(&raw))
                };
                // A NULL timeout would block forever; hand select a zero
                // timeval of our own below the red zone.
                let scratch = regs.sp - RED_ZONE - TIME_STRUCT_LEN as u64;
                self.process()?
                    .write_memory(scratch, &TimePair::default().encode())?;
                regs.set_arg(4, scratch);
                requested
            }
            _ => {
                return Err(Error::Internal(format!(
                    "node {} polling in syscall {}",
                    self.index,
                    regs.syscall_number()
                )));
            }
        };
        self.set_registers(&regs)?;
        let exit = self.step()?;
        if exit.return_value() == 0
            && let Some(timeout) = requested
        {
            trace!(node = self.index, ?timeout, "poll timed out");
            self.clock.advance(timeout);
        }
        self.state = NodeState::Stopped;
        Ok(())
    }

    fn handle_open(&mut self, path_addr: u64) -> Result<()> {
        let path = read_path(self.process()?, path_addr)?;
        let Some(ticket) = self.files.prepare_open(&path)? else {
            return Ok(());
        };
        let exit = self.step()?;
        if let Ok(fd) = i32::try_from(exit.return_value())
            && fd >= 0
        {
            self.files.finish_open(ticket, fd)?;
        }
        Ok(())
    }

    fn handle_mknod(&mut self, path_addr: u64) -> Result<()> {
        let path = read_path(self.process()?, path_addr)?;
        if !self.files.tracks(&path) {
            return Ok(());
        }
        if self.step()?.return_value() == 0 {
            self.files.mknod(&path);
        }
        Ok(())
    }

    fn handle_rename(&mut self, regs: &Registers) -> Result<()> {
        let src = read_path(self.process()?, regs.arg(0))?;
        let dst = read_path(self.process()?, regs.arg(1))?;
        match (self.files.tracks(&src), self.files.tracks(&dst)) {
            (false, false) => return Ok(()),
            (true, true) => {}
            _ => {
                return Err(Error::Internal(format!(
                    "node {} renamed across the data directory: {src} -> {dst}",
                    self.index
                )));
            }
        }
        self.files.prepare_rename(&src, &dst)?;
        if self.step()?.return_value() == 0 {
            self.files.rename(&src, &dst)?;
        }
        Ok(())
    }

    fn handle_socket(&mut self, regs: &Registers) -> Result<()> {
        let domain = regs.fd_arg(0);
        let kind = regs.fd_arg(1);
        if domain != libc::AF_INET || kind & SOCK_TYPE_MASK != libc::SOCK_STREAM {
            return Ok(());
        }
        let exit = self.step()?;
        if let Ok(fd) = i32::try_from(exit.return_value())
            && fd >= 0
        {
            trace!(node = self.index, fd, "tcp socket");
            self.sockets.insert(fd, false);
        }
        Ok(())
    }

    /// Binds on the virtual address are sent to the real one, with the
    /// caller's sockaddr restored afterwards.
    fn handle_bind(&mut self, regs: &Registers) -> Result<()> {
        let fd = regs.fd_arg(0);
        let addr_ptr = regs.arg(1);
        if regs.arg(2) < SOCKADDR_IN_LEN as u64 {
            return Ok(());
        }
        let mut original = [0u8; SOCKADDR_IN_LEN];
        self.process()?.read_memory(addr_ptr, &mut original)?;
        let Some(requested) = decode_sockaddr_in(&original) else {
            return Ok(());
        };
        if *requested.ip() != self.virtual_ip {
            return Ok(());
        }

        let redirected = SocketAddrV4::new(self.real_ip, requested.port());
        debug!(node = self.index, fd, %requested, %redirected, "bind redirected");
        self.process()?
            .write_memory(addr_ptr, &encode_sockaddr_in(redirected))?;
        self.sockets.insert(fd, true);
        self.step()?;
        self.process()?.write_memory(addr_ptr, &original)?;
        Ok(())
    }

    /// Redirected sockets report the virtual address they were asked to bind.
    fn handle_getsockname(&mut self, regs: &Registers) -> Result<()> {
        let fd = regs.fd_arg(0);
        if self.sockets.get(&fd) != Some(&true) {
            return Ok(());
        }
        let len = self.process()?.read_u32(regs.arg(2))?;
        if (len as usize) < SOCKADDR_IN_LEN {
            return Err(Error::Internal(format!(
                "node {} getsockname with {len}-byte buffer",
                self.index
            )));
        }
        let exit = self.step()?;
        if exit.return_value() != 0 {
            return Ok(());
        }
        let mut raw = [0u8; SOCKADDR_IN_LEN];
        self.process()?.read_memory(exit.arg(1), &mut raw)?;
        if let Some(bound) = decode_sockaddr_in(&raw) {
            let shown = SocketAddrV4::new(self.virtual_ip, bound.port());
            self.process()?
                .write_memory(exit.arg(1), &encode_sockaddr_in(shown))?;
        }
        Ok(())
    }

    fn handle_accept(&mut self, correlation: &mut CorrelationMap) -> Result<()> {
        let exit = self.step()?;
        let Ok(fd) = i32::try_from(exit.return_value()) else {
            return Ok(());
        };
        if fd < 0 {
            return Ok(());
        }
        self.sockets.insert(fd, false);
        if exit.arg(1) == 0 {
            warn!(node = self.index, fd, "accept without peer address, cannot correlate");
            return Ok(());
        }
        let mut raw = [0u8; SOCKADDR_IN_LEN];
        self.process()?.read_memory(exit.arg(1), &mut raw)?;
        if let Some(peer) = decode_sockaddr_in(&raw) {
            correlation.register_accept(self.index, fd, peer);
        }
        Ok(())
    }

    /// Lets a pending `connect` or `sendto` run. Returns whether it succeeded
    /// from the node's point of view.
    pub fn allow_event(
        &mut self,
        event: NodeEvent,
        correlation: &mut CorrelationMap,
    ) -> Result<bool> {
        self.expect_state(NodeState::Network)?;
        self.state = NodeState::Stopped;
        match event {
            NodeEvent::Connect => {
                let exit = self.step()?;
                let fd = exit.fd_arg(0);
                let ret = exit.return_value();
                if ret >= 0 || ret == -i64::from(libc::EINPROGRESS) {
                    correlation.register_connect(self.index, fd)?;
                    Ok(true)
                } else {
                    debug!(node = self.index, fd, ret, "connect failed");
                    Ok(false)
                }
            }
            NodeEvent::SendTo => {
                let mut exit = self.step()?;
                let fd = exit.fd_arg(0);
                match correlation.liveness(self.index, fd) {
                    Liveness::Dead => {
                        debug!(node = self.index, fd, "send on dead connection");
                        exit.set_errno(libc::ECONNRESET);
                        self.set_registers(&exit)?;
                        Ok(false)
                    }
                    Liveness::Unknown => {
                        trace!(node = self.index, fd, "send on uncorrelated socket");
                        Ok(exit.return_value() >= 0)
                    }
                    Liveness::Connecting | Liveness::Alive => Ok(exit.return_value() >= 0),
                }
            }
            other => Err(Error::Internal(format!(
                "node {} cannot allow {other:?}",
                self.index
            ))),
        }
    }

    /// Makes the pending fsync durable. With `commit_all` every pending
    /// rename is committed first.
    pub fn handle_fsync(&mut self, commit_all: bool) -> Result<()> {
        self.expect_state(NodeState::Files)?;
        self.state = NodeState::Stopped;
        let fd = self.registers()?.fd_arg(0);
        if commit_all {
            self.files.commit_all()?;
        }
        self.files.persist_fd(fd)
    }

    /// Completes a pending write. For tracked descriptors `tear` decides
    /// whether only half of it reaches the disk.
    pub fn handle_write<F>(&mut self, tear: F) -> Result<WriteOutcome>
    where
        F: FnOnce() -> Result<bool>,
    {
        self.expect_state(NodeState::Files)?;
        self.state = NodeState::Stopped;
        let mut regs = self.registers()?;
        let fd = regs.fd_arg(0);
        if !self.files.has_fd(fd) || !tear()? {
            return Ok(WriteOutcome::Completed);
        }

        let requested = regs.arg(2);
        regs.set_arg(2, requested / 2);
        self.set_registers(&regs)?;
        let exit = self.step()?;
        warn!(
            node = self.index,
            fd,
            requested,
            written = exit.return_value(),
            "torn write"
        );
        self.files.commit_all()?;
        self.files.persist_fd(fd)?;
        Ok(WriteOutcome::Torn)
    }

    /// Completes a pending `getrandom`, overwriting the kernel's bytes with
    /// ones from `fill`.
    pub fn handle_getrandom<F>(&mut self, fill: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        self.expect_state(NodeState::Random)?;
        self.state = NodeState::Stopped;
        let exit = self.step()?;
        let Ok(len) = usize::try_from(exit.return_value()) else {
            return Ok(());
        };
        if len == 0 {
            return Ok(());
        }
        let mut bytes = vec![0u8; len];
        fill(&mut bytes)?;
        self.process()?.write_memory(exit.arg(0), &bytes)?;
        Ok(())
    }

    /// Crashes a running node or restarts a stopped one.
    ///
    /// A crash drops every unsynced change to the data directory; a restart
    /// rewinds the directory to what was durable and relaunches.
    pub fn toggle<L>(&mut self, launcher: &mut L, correlation: &mut CorrelationMap) -> Result<()>
    where
        L: Launcher<Process = P>,
    {
        if let Some(mut process) = self.process.take() {
            process.kill()?;
            self.state = NodeState::Dead;
            self.files.crash()?;
            self.sockets.clear();
            correlation.clear_node(self.index);
            info!(node = self.index, "node crashed");
        } else {
            self.files.restore()?;
            let process = launcher.launch(&self.launch)?;
            info!(node = self.index, pid = process.pid(), "node restarted");
            self.process = Some(process);
            self.state = NodeState::Stopped;
            self.clock = VirtualClock::new();
        }
        Ok(())
    }

    /// Kills the process without touching the data directory.
    pub fn kill(&mut self) -> Result<()> {
        if let Some(mut process) = self.process.take() {
            process.kill()?;
        }
        self.state = NodeState::Dead;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use faultline_net::ProxyFd;
    use faultline_trace::{NODE_SYSCALLS, Probe, Script, ScriptedLauncher, ScriptedProcess};

    use super::*;

    const VIRTUAL: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);
    const REAL: Ipv4Addr = Ipv4Addr::new(127, 0, 1, 2);
    const SP: u64 = 0x7fff_0000;

    fn setup(data_dir: &str) -> NodeSetup {
        NodeSetup {
            index: 0,
            launch: LaunchSpec {
                argv: vec!["/bin/node".to_string()],
                stdout: PathBuf::from("/dev/null"),
                syscalls: NODE_SYSCALLS.to_vec(),
                disable_vdso: true,
            },
            virtual_ip: VIRTUAL,
            real_ip: REAL,
            data_dir: data_dir.to_string(),
        }
    }

    fn node_with(script: Script) -> (NodeVirtualizer<ScriptedProcess>, Probe) {
        let mut launcher = ScriptedLauncher::new().with(script);
        let node = NodeVirtualizer::start(setup("/nonexistent/data"), &mut launcher).unwrap();
        (node, launcher.launches().probe(0))
    }

    fn sockaddr(ip: Ipv4Addr, port: u16) -> [u8; SOCKADDR_IN_LEN] {
        encode_sockaddr_in(SocketAddrV4::new(ip, port))
    }

    #[test]
    fn clock_gettime_reads_virtual_time() {
        let script = Script::new()
            .zeroed(0x1000, TIME_STRUCT_LEN)
            .syscall(Syscall::ClockGetTime, &[1, 0x1000], 0)
            .syscall(Syscall::Poll, &[0, 0, 500], 0);
        let (mut node, probe) = node_with(script);
        let mut map = CorrelationMap::new();

        assert_eq!(node.to_next_event(&mut map).unwrap(), NodeEvent::Polling);
        let raw: [u8; TIME_STRUCT_LEN] = probe.bytes(0x1000, TIME_STRUCT_LEN).try_into().unwrap();
        assert_eq!(TimePair::decode(&raw), TimePair::new(244_244, 244_245_244));
    }

    #[test]
    fn idle_poll_advances_clock_by_timeout() {
        let script = Script::new()
            .zeroed(0x1000, TIME_STRUCT_LEN)
            .syscall(Syscall::Poll, &[0, 1, 1500], 0)
            .syscall(Syscall::ClockGetTime, &[1, 0x1000], 0)
            .syscall(Syscall::Poll, &[0, 1, 1500], 1);
        let (mut node, probe) = node_with(script);
        let mut map = CorrelationMap::new();

        assert_eq!(node.to_next_event(&mut map).unwrap(), NodeEvent::Polling);
        assert_eq!(node.to_next_event(&mut map).unwrap(), NodeEvent::Polling);

        assert_eq!(probe.executed()[0].arg(2), 0);
        let raw: [u8; TIME_STRUCT_LEN] = probe.bytes(0x1000, TIME_STRUCT_LEN).try_into().unwrap();
        assert_eq!(TimePair::decode(&raw), TimePair::new(244_245, 744_246_244));
    }

    #[test]
    fn busy_poll_does_not_advance_clock() {
        let script = Script::new()
            .syscall(Syscall::Poll, &[0, 1, 1500], 1)
            .syscall(Syscall::Poll, &[0, 1, 1500], 0);
        let (mut node, _probe) = node_with(script);
        let mut map = CorrelationMap::new();

        node.to_next_event(&mut map).unwrap();
        node.to_next_event(&mut map).unwrap();
        let mut expected = VirtualClock::new();
        expected.tick();
        expected.tick();
        assert_eq!(*node.clock(), expected);
    }

    #[test]
    fn null_select_timeout_uses_scratch_below_red_zone() {
        let script = Script::new().syscall(Syscall::Select, &[5, 0, 0, 0, 0], 0);
        let (mut node, probe) = node_with(script);
        let mut map = CorrelationMap::new();

        assert_eq!(node.to_next_event(&mut map).unwrap(), NodeEvent::Polling);
        assert_eq!(
            node.to_next_event(&mut map).unwrap(),
            NodeEvent::Exit(Termination::Code(0))
        );

        let scratch = SP - 128 - 16;
        assert_eq!(probe.executed()[0].arg(4), scratch);
        assert_eq!(probe.bytes(scratch, TIME_STRUCT_LEN), vec![0; TIME_STRUCT_LEN]);
        assert_eq!(node.state(), NodeState::Dead);
        assert!(!node.is_running());
    }

    #[test]
    fn bind_is_redirected_and_getsockname_shows_virtual_address() {
        let script = Script::new()
            .memory(0x2000, &sockaddr(VIRTUAL, 7000))
            .zeroed(0x3000, SOCKADDR_IN_LEN)
            .memory(0x3100, &16u32.to_ne_bytes())
            .syscall(
                Syscall::Socket,
                &[libc::AF_INET as u64, libc::SOCK_STREAM as u64, 0],
                3,
            )
            .syscall(Syscall::Bind, &[3, 0x2000, 16], 0)
            .syscall(Syscall::GetSockName, &[3, 0x3000, 0x3100], 0)
            .output(0x3000, &sockaddr(REAL, 7000))
            .syscall(Syscall::Poll, &[0, 0, 10], 0);
        let (mut node, probe) = node_with(script);
        let mut map = CorrelationMap::new();

        assert_eq!(node.to_next_event(&mut map).unwrap(), NodeEvent::Polling);
        assert_eq!(probe.bytes(0x2000, SOCKADDR_IN_LEN), sockaddr(VIRTUAL, 7000));
        assert_eq!(probe.bytes(0x3000, SOCKADDR_IN_LEN), sockaddr(VIRTUAL, 7000));
    }

    #[test]
    fn bind_to_other_address_is_untouched() {
        let other = Ipv4Addr::new(127, 0, 0, 9);
        let script = Script::new()
            .memory(0x2000, &sockaddr(other, 7000))
            .syscall(Syscall::Bind, &[3, 0x2000, 16], 0);
        let (mut node, probe) = node_with(script);
        let mut map = CorrelationMap::new();

        node.to_next_event(&mut map).unwrap();
        assert_eq!(probe.bytes(0x2000, SOCKADDR_IN_LEN), sockaddr(other, 7000));
        assert_eq!(probe.executed().len(), 1);
    }

    #[test]
    fn connect_in_progress_registers_pending_connect() {
        let script = Script::new()
            .memory(0x2000, &sockaddr(Ipv4Addr::new(127, 0, 0, 3), 7000))
            .syscall(
                Syscall::Socket,
                &[libc::AF_INET as u64, libc::SOCK_STREAM as u64, 0],
                3,
            )
            .syscall(Syscall::Connect, &[3, 0x2000, 16], -i64::from(libc::EINPROGRESS));
        let (mut node, _probe) = node_with(script);
        let mut map = CorrelationMap::new();

        let event = node.to_next_event(&mut map).unwrap();
        assert_eq!(event, NodeEvent::Connect);
        assert!(node.allow_event(event, &mut map).unwrap());
        assert_eq!(map.pending_connect(), Some((0, 3)));
    }

    #[test]
    fn connect_on_untracked_descriptor_is_not_reported() {
        let script = Script::new()
            .syscall(Syscall::Connect, &[9, 0x2000, 16], 0)
            .syscall(Syscall::Poll, &[0, 0, 10], 0);
        let (mut node, _probe) = node_with(script);
        let mut map = CorrelationMap::new();

        assert_eq!(node.to_next_event(&mut map).unwrap(), NodeEvent::Polling);
        assert_eq!(map.pending_connect(), None);
    }

    #[test]
    fn send_on_dead_connection_fails_with_reset() {
        let script = Script::new()
            .syscall(
                Syscall::Socket,
                &[libc::AF_INET as u64, libc::SOCK_STREAM as u64, 0],
                3,
            )
            .syscall(Syscall::Connect, &[3, 0x2000, 16], 0)
            .syscall(Syscall::SendTo, &[3, 0x4000, 10, 0, 0, 0], 10);
        let (mut node, probe) = node_with(script);
        let mut map = CorrelationMap::new();

        let connect = node.to_next_event(&mut map).unwrap();
        node.allow_event(connect, &mut map).unwrap();
        map.discard_pending();

        let send = node.to_next_event(&mut map).unwrap();
        assert_eq!(send, NodeEvent::SendTo);
        assert!(!node.allow_event(send, &mut map).unwrap());
        assert_eq!(
            probe.registers().return_value(),
            -i64::from(libc::ECONNRESET)
        );
    }

    #[test]
    fn accept_links_descriptor_to_proxy_socket() {
        let peer = SocketAddrV4::new(VIRTUAL, 40_000);
        let script = Script::new()
            .zeroed(0x6000, SOCKADDR_IN_LEN)
            .syscall(Syscall::Accept, &[3, 0x6000, 0x6100], 7)
            .output(0x6000, &encode_sockaddr_in(peer))
            .syscall(Syscall::Poll, &[0, 0, 10], 0);
        let (mut node, _probe) = node_with(script);
        let mut map = CorrelationMap::new();
        map.expect_accept(0, ProxyFd(12), peer);

        node.to_next_event(&mut map).unwrap();
        assert_eq!(map.liveness(0, 7), Liveness::Alive);
        assert_eq!(map.related(ProxyFd(12)), Some((0, 7)));
    }

    #[test]
    fn getrandom_is_filled_by_caller() {
        let script = Script::new()
            .zeroed(0x4000, 4)
            .syscall(Syscall::GetRandom, &[0x4000, 4, 0], 4)
            .output(0x4000, &[9, 9, 9, 9]);
        let (mut node, probe) = node_with(script);
        let mut map = CorrelationMap::new();

        assert_eq!(node.to_next_event(&mut map).unwrap(), NodeEvent::Random);
        node.handle_getrandom(|buf| {
            buf.copy_from_slice(&[1, 2, 3, 4]);
            Ok(())
        })
        .unwrap();
        assert_eq!(probe.bytes(0x4000, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn write_to_untracked_descriptor_never_consults_decision() {
        let script = Script::new().syscall(Syscall::Write, &[1, 0x4000, 10], 10);
        let (mut node, probe) = node_with(script);
        let mut map = CorrelationMap::new();

        assert_eq!(node.to_next_event(&mut map).unwrap(), NodeEvent::Write);
        let outcome = node
            .handle_write(|| panic!("decision consulted for stdout"))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Completed);
        node.to_next_event(&mut map).unwrap();
        assert_eq!(probe.executed()[0].arg(2), 10);
    }

    #[test]
    fn torn_write_halves_length_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("log");
        std::fs::write(&data, b"orig").unwrap();
        let data = data.to_str().unwrap().to_string();
        let mut path_bytes = data.clone().into_bytes();
        path_bytes.push(0);

        let script = Script::new()
            .zeroed(0x5000, 4096)
            .memory(0x5000, &path_bytes)
            .syscall(Syscall::OpenAt, &[libc::AT_FDCWD as u64, 0x5000, 0, 0], 4)
            .syscall(Syscall::Write, &[4, 0x4000, 10], 5);
        let mut launcher = ScriptedLauncher::new().with(script);
        let prefix = dir.path().to_str().unwrap();
        let mut node = NodeVirtualizer::start(setup(prefix), &mut launcher).unwrap();
        let probe = launcher.launches().probe(0);
        let mut map = CorrelationMap::new();

        assert_eq!(node.to_next_event(&mut map).unwrap(), NodeEvent::Write);
        assert_eq!(node.files().path_of(4), Some(data.as_str()));
        let outcome = node.handle_write(|| Ok(true)).unwrap();

        assert_eq!(outcome, WriteOutcome::Torn);
        assert_eq!(probe.executed()[1].arg(2), 5);
        let version = node.files().version(&data).unwrap();
        assert_eq!(node.files().persisted_version(&data), Some(version));
    }

    #[test]
    fn renameat_is_unsupported() {
        let script = Script::new().syscall(Syscall::RenameAt, &[0, 0, 0, 0], 0);
        let (mut node, _probe) = node_with(script);
        let mut map = CorrelationMap::new();

        let err = node.to_next_event(&mut map).unwrap_err();
        assert!(matches!(err, Error::Unsupported { node: 0, .. }));
    }

    #[test]
    fn toggle_crashes_then_relaunches() {
        let mut launcher = ScriptedLauncher::new()
            .with(Script::new().syscall(Syscall::Poll, &[0, 0, 10], 0))
            .with(Script::new().syscall(Syscall::Poll, &[0, 0, 10], 0));
        let mut node = NodeVirtualizer::start(setup("/nonexistent/data"), &mut launcher).unwrap();
        let mut map = CorrelationMap::new();
        map.register_connect(0, 5).unwrap();

        node.toggle(&mut launcher, &mut map).unwrap();
        assert!(launcher.launches().probe(0).was_killed());
        assert_eq!(node.to_next_event(&mut map).unwrap(), NodeEvent::Dead);
        assert_eq!(map.liveness(0, 5), Liveness::Unknown);

        node.toggle(&mut launcher, &mut map).unwrap();
        assert_eq!(launcher.launches().len(), 2);
        assert_eq!(node.to_next_event(&mut map).unwrap(), NodeEvent::Polling);
    }
}
