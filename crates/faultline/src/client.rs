//! Virtualization of one client process.
//!
//! Clients see real time and real addresses; only their TCP traffic is
//! mediated, so that sends and receives on connections the proxy has torn
//! down fail the way they would on a real network.

use std::collections::BTreeSet;

use faultline_net::{CLIENT_OFFSET, CorrelationMap, Liveness};
use faultline_trace::{LaunchSpec, Launcher, ProcessControl, Registers, Stop, Syscall};
use tracing::{debug, info, trace, warn};

use crate::actor::{Termination, step_to_exit};
use crate::error::{Error, Result};

const SOCK_TYPE_MASK: i32 = 0xf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The client has been stopped by the harness.
    Dead,
    /// The process ended on its own.
    Exit(Termination),
    Connect,
    SendTo,
    /// `close` or `shutdown` of a TCP socket.
    Close,
    /// Blocked in `recvfrom`; the client waits for a reply.
    Receiving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Stopped,
    Receiving,
    Network,
    Dead,
}

pub struct ClientVirtualizer<P> {
    actor: usize,
    launch: LaunchSpec,
    process: Option<P>,
    state: ClientState,
    sockets: BTreeSet<i32>,
    /// Sockets whose connect failed; they never reach the correlation map.
    failed_connects: BTreeSet<i32>,
}

impl<P: ProcessControl> ClientVirtualizer<P> {
    /// Starts client `index`, which acts as actor `CLIENT_OFFSET + index`.
    pub fn start<L>(index: usize, launch: LaunchSpec, launcher: &mut L) -> Result<Self>
    where
        L: Launcher<Process = P>,
    {
        let actor = CLIENT_OFFSET + index;
        let process = launcher.launch(&launch)?;
        info!(client = actor, pid = process.pid(), "client started");
        Ok(Self {
            actor,
            launch,
            process: Some(process),
            state: ClientState::Stopped,
            sockets: BTreeSet::new(),
            failed_connects: BTreeSet::new(),
        })
    }

    pub fn actor(&self) -> usize {
        self.actor
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    fn process(&mut self) -> Result<&mut P> {
        self.process
            .as_mut()
            .ok_or_else(|| Error::Internal(format!("client {} is not running", self.actor)))
    }

    fn step(&mut self) -> Result<Registers> {
        step_to_exit(self.process()?)
    }

    fn is_dead(&self, correlation: &CorrelationMap, fd: i32) -> bool {
        self.failed_connects.contains(&fd)
            || correlation.liveness(self.actor, fd) == Liveness::Dead
    }

    /// Runs the client until the next event the orchestrator must handle.
    pub fn to_next_event(&mut self, correlation: &CorrelationMap) -> Result<ClientEvent> {
        match self.state {
            ClientState::Dead => return Ok(ClientEvent::Dead),
            ClientState::Receiving => self.finish_receive(correlation)?,
            ClientState::Stopped => {}
            ClientState::Network => {
                return Err(Error::Internal(format!(
                    "client {} resumed with a network event pending",
                    self.actor
                )));
            }
        }

        loop {
            let stop = self.process()?.resume()?;
            match stop {
                Stop::Seccomp => {
                    let regs = self.process()?.registers()?;
                    let Some(syscall) = Syscall::from_number(regs.syscall_number()) else {
                        continue;
                    };
                    trace!(client = self.actor, syscall = syscall.name(), "trap");
                    if let Some(event) = self.dispatch(syscall, &regs)? {
                        return Ok(event);
                    }
                }
                Stop::SyscallExit | Stop::Signal(_) => {}
                Stop::Exited(code) => return Ok(self.exited(Termination::Code(code))),
                Stop::Killed(signal) => return Ok(self.exited(Termination::Signal(signal))),
            }
        }
    }

    fn exited(&mut self, termination: Termination) -> ClientEvent {
        warn!(client = self.actor, %termination, "client exited");
        self.process = None;
        self.state = ClientState::Dead;
        ClientEvent::Exit(termination)
    }

    fn dispatch(&mut self, syscall: Syscall, regs: &Registers) -> Result<Option<ClientEvent>> {
        if syscall == Syscall::Socket {
            self.handle_socket(regs)?;
            return Ok(None);
        }
        if !self.sockets.contains(&regs.fd_arg(0)) {
            return Ok(None);
        }
        let event = match syscall {
            Syscall::Close | Syscall::Shutdown => {
                self.state = ClientState::Network;
                ClientEvent::Close
            }
            Syscall::Connect => {
                self.state = ClientState::Network;
                ClientEvent::Connect
            }
            Syscall::SendTo => {
                self.state = ClientState::Network;
                ClientEvent::SendTo
            }
            Syscall::RecvFrom => {
                self.state = ClientState::Receiving;
                ClientEvent::Receiving
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    fn handle_socket(&mut self, regs: &Registers) -> Result<()> {
        if regs.fd_arg(0) != libc::AF_INET || regs.fd_arg(1) & SOCK_TYPE_MASK != libc::SOCK_STREAM
        {
            return Ok(());
        }
        let exit = self.step()?;
        if let Ok(fd) = i32::try_from(exit.return_value())
            && fd >= 0
        {
            trace!(client = self.actor, fd, "tcp socket");
            self.sockets.insert(fd);
        }
        Ok(())
    }

    /// A receive on a connection that is gone would block forever; it times
    /// out instead.
    fn finish_receive(&mut self, correlation: &CorrelationMap) -> Result<()> {
        self.state = ClientState::Stopped;
        let mut regs = self.process()?.registers()?;
        let fd = regs.fd_arg(0);
        if !self.is_dead(correlation, fd) {
            return Ok(());
        }
        debug!(client = self.actor, fd, "receive on dead connection");
        regs.skip_syscall();
        self.process()?.set_registers(&regs)?;
        let mut exit = self.step()?;
        exit.set_errno(libc::ETIMEDOUT);
        self.process()?.set_registers(&exit)?;
        Ok(())
    }

    /// Lets a pending `connect` or `sendto` run. Returns whether it succeeded
    /// from the client's point of view.
    pub fn allow_event(
        &mut self,
        event: ClientEvent,
        correlation: &mut CorrelationMap,
    ) -> Result<bool> {
        if self.state != ClientState::Network {
            return Err(Error::Internal(format!(
                "client {} has no network event pending",
                self.actor
            )));
        }
        self.state = ClientState::Stopped;
        match event {
            ClientEvent::Connect => {
                let exit = self.step()?;
                let fd = exit.fd_arg(0);
                let ret = exit.return_value();
                if ret >= 0 || ret == -i64::from(libc::EINPROGRESS) {
                    self.failed_connects.remove(&fd);
                    correlation.register_connect(self.actor, fd)?;
                    Ok(true)
                } else {
                    debug!(client = self.actor, fd, ret, "connect failed");
                    self.failed_connects.insert(fd);
                    Ok(false)
                }
            }
            ClientEvent::SendTo => {
                let mut exit = self.step()?;
                let fd = exit.fd_arg(0);
                if self.is_dead(correlation, fd) {
                    debug!(client = self.actor, fd, "send on dead connection");
                    exit.set_errno(libc::ECONNREFUSED);
                    self.process()?.set_registers(&exit)?;
                    Ok(false)
                } else {
                    Ok(exit.return_value() >= 0)
                }
            }
            other => Err(Error::Internal(format!(
                "client {} cannot allow {other:?}",
                self.actor
            ))),
        }
    }

    /// Runs a pending `close` or `shutdown`. Returns whether the descriptor
    /// was still connected, in which case the proxy will see the end of the
    /// stream.
    pub fn handle_close(&mut self, correlation: &CorrelationMap) -> Result<bool> {
        if self.state != ClientState::Network {
            return Err(Error::Internal(format!(
                "client {} has no close pending",
                self.actor
            )));
        }
        self.state = ClientState::Stopped;
        let entry = self.process()?.registers()?;
        let closing = Syscall::from_number(entry.syscall_number()) == Some(Syscall::Close);
        let exit = self.step()?;
        let fd = exit.fd_arg(0);

        let connect_failed = if closing {
            self.sockets.remove(&fd);
            self.failed_connects.remove(&fd)
        } else {
            self.failed_connects.contains(&fd)
        };
        let live = !connect_failed
            && matches!(
                correlation.liveness(self.actor, fd),
                Liveness::Connecting | Liveness::Alive
            );
        debug!(client = self.actor, fd, closing, live, "socket closed");
        Ok(live)
    }

    /// Stops a running client or restarts a stopped one.
    pub fn toggle<L>(&mut self, launcher: &mut L, correlation: &mut CorrelationMap) -> Result<()>
    where
        L: Launcher<Process = P>,
    {
        if let Some(mut process) = self.process.take() {
            process.kill()?;
            self.state = ClientState::Dead;
            self.sockets.clear();
            self.failed_connects.clear();
            correlation.clear_node(self.actor);
            info!(client = self.actor, "client stopped");
        } else {
            let process = launcher.launch(&self.launch)?;
            info!(client = self.actor, pid = process.pid(), "client restarted");
            self.process = Some(process);
            self.state = ClientState::Stopped;
        }
        Ok(())
    }

    pub fn kill(&mut self) -> Result<()> {
        if let Some(mut process) = self.process.take() {
            process.kill()?;
        }
        self.state = ClientState::Dead;
        Ok(())
    }
}
