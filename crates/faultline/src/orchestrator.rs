//! The cooperative scheduler.
//!
//! Exactly one actor runs at a time. Each iteration the decision engine picks
//! a node or client, which is then stepped from one trapped syscall to the
//! next until it blocks (polling, receiving), dies, or makes a network call
//! whose effect has to reach the proxy before anyone else runs. Every fault
//! comes from the engine, so a recorded trace reproduces the run exactly.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use faultline_config::{HarnessConfig, Mode};
use faultline_decide::{DecideError, DecisionEngine, DecisionRates, VisitedSettings};
use faultline_net::{CLIENT_OFFSET, FaultInjectingProxy, PollMode};
use faultline_trace::{CLIENT_SYSCALLS, LaunchSpec, Launcher, NODE_SYSCALLS};
use tracing::{debug, error, info, trace, warn};

use crate::actor::Termination;
use crate::client::{ClientEvent, ClientVirtualizer};
use crate::command::{cluster_argv, node_argv, node_dir};
use crate::error::{Error, Result};
use crate::node::{NodeEvent, NodeSetup, NodeVirtualizer, WriteOutcome};
use crate::validator::Validator;

/// How a run ended, when it did not end in a harness error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every iteration ran.
    Completed { iterations: u64 },
    /// A node exited without being crashed by the harness.
    NodeExited {
        node: usize,
        termination: Termination,
    },
    /// A client exited without being stopped by the harness.
    ClientExited {
        client: usize,
        termination: Termination,
    },
    /// The validator reported an inconsistency.
    ValidationFailed { iteration: u64 },
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed { .. } => 0,
            Self::NodeExited { .. } => 2,
            Self::ClientExited { .. } => 3,
            Self::ValidationFailed { .. } => 4,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { iterations } => write!(f, "completed {iterations} iterations"),
            Self::NodeExited { node, termination } => {
                write!(f, "node {node} exited unexpectedly with {termination}")
            }
            Self::ClientExited {
                client,
                termination,
            } => write!(f, "client {client} exited unexpectedly with {termination}"),
            Self::ValidationFailed { iteration } => {
                write!(f, "validation failed at iteration {iteration}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    iterations: u64,
    validate_every: u64,
    node_settle: Duration,
    client_settle: Duration,
    send_poll: Duration,
}

/// Owns every actor, the proxy and the decision engine for one run.
pub struct Orchestrator<L: Launcher> {
    launcher: L,
    engine: DecisionEngine,
    proxy: FaultInjectingProxy,
    nodes: Vec<NodeVirtualizer<L::Process>>,
    clients: Vec<ClientVirtualizer<L::Process>>,
    validator: Validator,
    /// Nodes that are neither polling nor dead.
    runnable_nodes: BTreeSet<usize>,
    /// Client actor ids that are not waiting for a reply.
    runnable_clients: BTreeSet<usize>,
    num_alive: usize,
    timing: Timing,
}

impl<L: Launcher> Orchestrator<L> {
    /// Opens the decision engine and the proxy, then starts every node and
    /// client. The configuration is assumed to be validated.
    pub fn new(config: &HarnessConfig, mut launcher: L) -> Result<Self> {
        let virtual_ips = config.network.parsed_virtual()?;
        let real_ips = config.network.parsed_real()?;
        let port = config.network.listen_port;
        let num_nodes = virtual_ips.len();
        let num_clients = config.run.num_clients;
        let log_dir = &config.run.log_dir;

        let engine = build_engine(config, num_nodes)?;
        info!(
            mode = engine.mode_name(),
            seed = config.run.seed,
            nodes = num_nodes,
            clients = num_clients,
            "starting run"
        );

        let mut proxy = FaultInjectingProxy::new(
            real_ips.iter().map(|&ip| SocketAddrV4::new(ip, port)).collect(),
            virtual_ips.iter().map(|&ip| SocketAddrV4::new(ip, port)).collect(),
            num_clients,
        )?;

        let node_template = config.commands.node_argv();
        let mut nodes = Vec::with_capacity(num_nodes);
        for (index, (&virtual_ip, &real_ip)) in virtual_ips.iter().zip(&real_ips).enumerate() {
            let setup = NodeSetup {
                index,
                launch: LaunchSpec {
                    argv: node_argv(&node_template, index, &virtual_ips),
                    stdout: log_dir.join(format!("filter_{virtual_ip}")),
                    syscalls: NODE_SYSCALLS.to_vec(),
                    disable_vdso: true,
                },
                virtual_ip,
                real_ip,
                data_dir: node_dir(&config.storage.node_dir, virtual_ip),
            };
            nodes.push(NodeVirtualizer::start(setup, &mut launcher)?);
        }

        let client_argv = cluster_argv(&config.commands.client_argv(), &virtual_ips);
        let mut clients = Vec::with_capacity(num_clients);
        for index in 0..num_clients {
            let launch = LaunchSpec {
                argv: client_argv.clone(),
                stdout: log_dir.join(format!(
                    "client_{}_{}",
                    config.run.seed,
                    CLIENT_OFFSET + index
                )),
                syscalls: CLIENT_SYSCALLS.to_vec(),
                disable_vdso: false,
            };
            clients.push(ClientVirtualizer::start(index, launch, &mut launcher)?);
            // Clients are live in the proxy from the start so that stopping
            // one tears down its connections.
            proxy.set_alive(CLIENT_OFFSET + index);
        }

        let validator = Validator::new(
            cluster_argv(&config.commands.validate_argv(), &virtual_ips),
            log_dir.join(format!("validate_{}", config.run.seed)),
        );

        Ok(Self {
            launcher,
            engine,
            proxy,
            nodes,
            clients,
            validator,
            runnable_nodes: (0..num_nodes).collect(),
            runnable_clients: (0..num_clients).map(|i| CLIENT_OFFSET + i).collect(),
            num_alive: num_nodes,
            timing: Timing {
                iterations: config.run.iterations,
                validate_every: config.run.validate_every.max(1),
                node_settle: Duration::from_millis(config.run.node_settle_ms),
                client_settle: Duration::from_millis(config.run.client_settle_ms),
                send_poll: Duration::from_millis(config.run.send_poll_ms),
            },
        })
    }

    pub fn num_alive(&self) -> usize {
        self.num_alive
    }

    pub fn validator_output(&self) -> PathBuf {
        self.validator.output().to_path_buf()
    }

    /// Runs the scheduler loop until the iteration budget is spent or an
    /// actor exits or validation fails.
    pub fn run(&mut self) -> Result<Outcome> {
        let mut iteration: u64 = 0;
        loop {
            if self.timing.iterations > 0 && iteration >= self.timing.iterations {
                info!(iterations = iteration, "run finished");
                return Ok(Outcome::Completed {
                    iterations: iteration,
                });
            }
            iteration += 1;

            for line in self.proxy.state_lines() {
                trace!(target: "faultline::proxy", "{line}");
            }
            self.release_to_clients()?;

            let actor = self.engine.next_actor(
                self.num_alive,
                &self.runnable_nodes,
                &self.runnable_clients,
            )?;
            debug!(iteration, actor, "scheduled");

            if iteration % self.timing.validate_every == 0 && !self.validator.run()? {
                error!(iteration, "validation failed");
                return Ok(Outcome::ValidationFailed { iteration });
            }

            let outcome = if actor < CLIENT_OFFSET {
                self.step_node(actor)?
            } else {
                self.step_client(actor - CLIENT_OFFSET)?
            };
            if let Some(outcome) = outcome {
                error!(%outcome, "run aborted");
                return Ok(outcome);
            }
        }
    }

    /// Stops every actor and flushes the decision engine. Safe to call after
    /// any outcome or error from [`Self::run`].
    pub fn shutdown(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            if let Err(e) = node.kill() {
                warn!(node = node.index(), error = %e, "failed to stop node");
            }
        }
        for client in &mut self.clients {
            if let Err(e) = client.kill() {
                warn!(client = client.actor(), error = %e, "failed to stop client");
            }
        }
        self.engine.finish()?;
        info!("all actors stopped");
        Ok(())
    }

    /// Client replies are never delayed: everything queued is written.
    fn release_to_clients(&mut self) -> Result<()> {
        for index in 0..self.clients.len() {
            let actor = CLIENT_OFFSET + index;
            let mut released = 0;
            for fd in self.proxy.fds_with_messages(actor) {
                while self.proxy.has_more(fd) {
                    released += 1;
                    self.runnable_clients.insert(actor);
                    if self.proxy.release_next(fd)? {
                        released += 1;
                        break;
                    }
                }
            }
            settle(self.timing.client_settle, released);
        }
        Ok(())
    }

    fn step_node(&mut self, node: usize) -> Result<Option<Outcome>> {
        let mut released = 0;
        for fd in self.proxy.fds_with_messages(node) {
            if self.engine.should_send_msg()? {
                released += 1;
                if self.proxy.release_next(fd)? {
                    released += 1;
                }
            }
        }
        settle(self.timing.node_settle, released);

        loop {
            let event = self.nodes[node].to_next_event(self.proxy.correlation_mut())?;
            trace!(node, ?event, "node event");
            let mut sent = false;
            let proceed = match event {
                NodeEvent::Random => {
                    let engine = &mut self.engine;
                    self.nodes[node].handle_getrandom(|buf| Ok(engine.fill_random(buf)?))?;
                    true
                }
                NodeEvent::Connect | NodeEvent::SendTo => {
                    self.mark_active(node);
                    let fail = if event == NodeEvent::Connect {
                        self.engine.should_fail_on_connect()?
                    } else {
                        self.engine.should_fail_on_send()?
                    };
                    if fail {
                        self.crash_node(node, "before network call")?;
                        false
                    } else {
                        sent = self.nodes[node].allow_event(event, self.proxy.correlation_mut())?;
                        true
                    }
                }
                NodeEvent::Write => {
                    self.mark_active(node);
                    let engine = &mut self.engine;
                    let outcome = self.nodes[node]
                        .handle_write(|| Ok(engine.should_fail_on_write()?))?;
                    if outcome == WriteOutcome::Torn {
                        self.crash_node(node, "during write")?;
                        false
                    } else {
                        true
                    }
                }
                NodeEvent::Fsync => {
                    self.mark_active(node);
                    if self.engine.should_fail_on_fsync()? {
                        self.crash_node(node, "before fsync")?;
                        false
                    } else {
                        let commit_all = self.engine.should_rename_on_fsync()?;
                        self.nodes[node].handle_fsync(commit_all)?;
                        true
                    }
                }
                NodeEvent::Dead => {
                    self.runnable_nodes.remove(&node);
                    if self.engine.should_revive()? {
                        self.revive_node(node)?;
                        true
                    } else {
                        false
                    }
                }
                NodeEvent::Polling => {
                    self.proxy.set_alive(node);
                    self.runnable_nodes.remove(&node);
                    false
                }
                NodeEvent::Exit(termination) => {
                    return Ok(Some(Outcome::NodeExited { node, termination }));
                }
            };
            if sent {
                self.await_proxy()?;
            }
            if !proceed {
                return Ok(None);
            }
        }
    }

    fn step_client(&mut self, index: usize) -> Result<Option<Outcome>> {
        let actor = CLIENT_OFFSET + index;
        loop {
            let event = self.clients[index].to_next_event(self.proxy.correlation())?;
            trace!(client = actor, ?event, "client event");
            let (proceed, sent) = match event {
                ClientEvent::Close => (true, self.clients[index].handle_close(self.proxy.correlation())?),
                ClientEvent::Connect | ClientEvent::SendTo => {
                    let fail = if event == ClientEvent::Connect {
                        self.engine.client_should_fail_on_connect()?
                    } else {
                        self.engine.client_should_fail_on_send()?
                    };
                    if fail {
                        warn!(client = actor, ?event, "stopping client");
                        self.proxy.toggle(actor)?;
                        self.clients[index].toggle(&mut self.launcher, self.proxy.correlation_mut())?;
                        (false, false)
                    } else {
                        let ok = self.clients[index].allow_event(event, self.proxy.correlation_mut())?;
                        (false, ok)
                    }
                }
                ClientEvent::Dead => {
                    info!(client = actor, "reviving client");
                    self.proxy.toggle(actor)?;
                    self.clients[index].toggle(&mut self.launcher, self.proxy.correlation_mut())?;
                    (true, false)
                }
                ClientEvent::Receiving => {
                    self.runnable_clients.remove(&actor);
                    (false, false)
                }
                ClientEvent::Exit(termination) => {
                    return Ok(Some(Outcome::ClientExited {
                        client: actor,
                        termination,
                    }));
                }
            };
            if sent {
                self.await_proxy()?;
            }
            if !proceed {
                return Ok(None);
            }
        }
    }

    fn mark_active(&mut self, node: usize) {
        self.proxy.set_alive(node);
        self.runnable_nodes.insert(node);
    }

    fn crash_node(&mut self, node: usize, reason: &str) -> Result<()> {
        self.num_alive = self.num_alive.saturating_sub(1);
        warn!(node, reason, alive = self.num_alive, "crashing node");
        for (actor, fd) in self.proxy.toggle(node)? {
            if actor >= CLIENT_OFFSET {
                debug!(client = actor, fd, "client connection lost, re-enabling");
                self.runnable_clients.insert(actor);
            }
        }
        self.nodes[node].toggle(&mut self.launcher, self.proxy.correlation_mut())
    }

    fn revive_node(&mut self, node: usize) -> Result<()> {
        self.num_alive += 1;
        info!(node, alive = self.num_alive, "reviving node");
        self.nodes[node].toggle(&mut self.launcher, self.proxy.correlation_mut())?;
        self.proxy.toggle(node)?;
        Ok(())
    }

    /// Gives the proxy time to see what was just sent. A connect has to be
    /// accepted before anyone else may connect; one that never arrives is
    /// written off as dead.
    fn await_proxy(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.timing.send_poll;
        self.proxy.poll(PollMode::Blocking(self.timing.send_poll))?;
        while self.proxy.correlation().pending_connect().is_some() {
            let now = Instant::now();
            if now >= deadline {
                if let Some((actor, fd)) = self.proxy.correlation_mut().discard_pending() {
                    warn!(actor, fd, "connect never reached the proxy");
                }
                break;
            }
            self.proxy.poll(PollMode::Blocking(deadline - now))?;
        }
        Ok(())
    }
}

fn settle(per_message: Duration, released: u32) {
    if released > 0 {
        thread::sleep(per_message * released);
    }
}

fn build_engine(config: &HarnessConfig, num_nodes: usize) -> Result<DecisionEngine> {
    let decide = &config.decide;
    let rates = DecisionRates {
        node_preference: decide.node_preference,
        death_enabled: decide.death_enabled,
        death_rate: decide.death_rate,
        revive_rate: decide.revive_rate,
        fsync_rename_rate: decide.fsync_rename_rate,
        msg_delay_rate: decide.msg_delay_rate,
        primary_percent: decide.primary_percent,
    };
    let engine = match config.run.mode {
        Mode::Random => {
            DecisionEngine::random(config.run.seed, num_nodes, rates, &config.files.trace)
        }
        Mode::Replay => DecisionEngine::replay(&config.files.trace, num_nodes),
        Mode::Visited => DecisionEngine::visited(
            config.run.seed,
            num_nodes,
            DecisionRates {
                death_rate: decide.visited_death_rate,
                primary_percent: decide.visited_primary_percent,
                ..rates
            },
            VisitedSettings {
                window: decide.window,
                visit_threshold: decide.visit_threshold,
            },
            &config.files.trace,
            &config.files.visited,
        ),
    };
    engine.map_err(|err| match err {
        e @ DecideError::Io { .. } => Error::Input(e),
        other => other.into(),
    })
}
