//! The fault-injecting TCP proxy.
//!
//! Every node listens, from its peers' point of view, on a virtual address
//! owned by the proxy. Each accepted connection is paired with an outbound
//! connection to the target's real address, and bytes read on either side
//! are queued against the other side instead of being forwarded. The
//! orchestrator releases queued messages one at a time, which gives it full
//! control over delivery order and timing.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::time::Duration;

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, SockaddrIn, bind, connect, socket};
use tracing::{debug, info, trace, warn};

use crate::correlation::{CorrelationMap, ProxyFd};
use crate::error::{NetError, Result};

/// Actors with this index or above are clients.
pub const CLIENT_OFFSET: usize = 1000;

/// Largest chunk read from a proxy socket at once; each chunk becomes one
/// queued message.
const MAX_MESSAGE: usize = 2000;

const EVENT_CAPACITY: usize = 128;

/// How long [`FaultInjectingProxy::poll`] may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    NonBlocking,
    /// Wait for at least one event, up to the bound.
    Blocking(Duration),
}

/// One proxy-side socket and the messages waiting to be written to it.
#[derive(Debug)]
struct Endpoint {
    stream: TcpStream,
    /// Actor on the far end of this socket: the recipient of its writes.
    actor: usize,
    /// The other half of the link; `None` once that half has closed.
    peer: Option<Token>,
    queue: VecDeque<Bytes>,
}

/// Proxy between virtual and real node addresses.
pub struct FaultInjectingProxy {
    poll: Poll,
    events: Events,
    real_addrs: Vec<SocketAddrV4>,
    virtual_addrs: Vec<SocketAddrV4>,
    listeners: Vec<Option<TcpListener>>,
    alive: BTreeMap<usize, bool>,
    endpoints: BTreeMap<Token, Endpoint>,
    /// Endpoints per far-end actor.
    inbound: BTreeMap<usize, BTreeSet<Token>>,
    correlation: CorrelationMap,
    next_token: usize,
}

impl FaultInjectingProxy {
    /// Creates a proxy with a listener on every node's virtual address.
    ///
    /// Every actor starts out not alive; connections to an actor that has
    /// not been marked alive are refused.
    pub fn new(
        real_addrs: Vec<SocketAddrV4>,
        virtual_addrs: Vec<SocketAddrV4>,
        num_clients: usize,
    ) -> Result<Self> {
        let num_nodes = virtual_addrs.len();
        let mut proxy = Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            real_addrs,
            virtual_addrs,
            listeners: (0..num_nodes).map(|_| None).collect(),
            alive: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            inbound: BTreeMap::new(),
            correlation: CorrelationMap::new(),
            // Tokens below `num_nodes` belong to listeners.
            next_token: num_nodes,
        };
        for node in 0..num_nodes {
            proxy.alive.insert(node, false);
            proxy.inbound.insert(node, BTreeSet::new());
            proxy.listen(node)?;
        }
        for client in 0..num_clients {
            proxy.alive.insert(CLIENT_OFFSET + client, false);
            proxy.inbound.insert(CLIENT_OFFSET + client, BTreeSet::new());
        }
        info!(nodes = num_nodes, clients = num_clients, "proxy started");
        Ok(proxy)
    }

    pub fn correlation(&self) -> &CorrelationMap {
        &self.correlation
    }

    pub fn correlation_mut(&mut self) -> &mut CorrelationMap {
        &mut self.correlation
    }

    /// Address the listener for `node` is bound to, if it is open.
    pub fn listen_addr(&self, node: usize) -> Option<SocketAddr> {
        self.listeners
            .get(node)?
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub fn is_alive(&self, actor: usize) -> bool {
        self.alive.get(&actor).copied().unwrap_or(false)
    }

    pub fn set_alive(&mut self, actor: usize) {
        self.alive.insert(actor, true);
    }

    /// Stops a live actor or starts a dead one.
    ///
    /// Stopping first drains readiness without blocking, then closes every
    /// link with `actor` on the far end and, for nodes, the listener. The
    /// returned `(actor, fd)` pairs are the descriptors on the other ends
    /// of those links whose connections are now gone.
    pub fn toggle(&mut self, actor: usize) -> Result<Vec<(usize, i32)>> {
        if !self.alive.contains_key(&actor) {
            return Err(NetError::UnknownActor(actor));
        }
        if self.is_alive(actor) {
            self.poll(PollMode::NonBlocking)?;
            Ok(self.stop(actor))
        } else {
            self.alive.insert(actor, true);
            if actor < CLIENT_OFFSET {
                self.listen(actor)?;
            }
            info!(actor, "proxy accepting for actor");
            Ok(Vec::new())
        }
    }

    fn listen(&mut self, node: usize) -> Result<()> {
        let addr = self.virtual_addrs[node];
        let mut listener = TcpListener::bind(SocketAddr::V4(addr))
            .map_err(|source| NetError::Listen { addr, source })?;
        self.poll
            .registry()
            .register(&mut listener, Token(node), Interest::READABLE)?;
        debug!(node, %addr, "listening");
        self.listeners[node] = Some(listener);
        Ok(())
    }

    fn stop(&mut self, actor: usize) -> Vec<(usize, i32)> {
        let mut notify = Vec::new();
        let tokens: Vec<Token> = self
            .inbound
            .get(&actor)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for token in tokens {
            self.unregister(token, Some(&mut notify));
        }
        self.alive.insert(actor, false);
        if let Some(slot) = self.listeners.get_mut(actor)
            && let Some(mut listener) = slot.take()
            && let Err(e) = self.poll.registry().deregister(&mut listener)
        {
            warn!(actor, error = %e, "failed to deregister listener");
        }
        info!(actor, notified = notify.len(), "proxy stopped actor");
        notify
    }

    /// Closes an endpoint. Its peer is closed too if nothing is queued for
    /// it; otherwise the peer stays open until its queue is released.
    fn unregister(&mut self, token: Token, mut notify: Option<&mut Vec<(usize, i32)>>) {
        let proxy_fd = ProxyFd(token.0);
        self.correlation.unregister(proxy_fd);
        let Some(mut endpoint) = self.endpoints.remove(&token) else {
            return;
        };
        debug!(%proxy_fd, actor = endpoint.actor, "closing proxy socket");
        if let Err(e) = self.poll.registry().deregister(&mut endpoint.stream) {
            debug!(%proxy_fd, error = %e, "deregister failed");
        }
        if let Some(set) = self.inbound.get_mut(&endpoint.actor) {
            set.remove(&token);
        }
        let Some(peer) = endpoint.peer else {
            return;
        };
        let drained = match self.endpoints.get_mut(&peer) {
            Some(other) => {
                other.peer = None;
                other.queue.is_empty()
            }
            None => false,
        };
        if drained {
            if let Some(list) = notify.as_deref_mut()
                && let Some(related) = self.correlation.related(ProxyFd(peer.0))
            {
                list.push(related);
            }
            self.unregister(peer, notify);
        }
    }

    /// Handles readiness on every proxy socket. Returns whether anything
    /// happened.
    pub fn poll(&mut self, mode: PollMode) -> Result<bool> {
        let timeout = match mode {
            PollMode::NonBlocking => Duration::ZERO,
            PollMode::Blocking(bound) => bound,
        };
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let ready: Vec<(Token, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_read_closed() || event.is_error()))
            .collect();
        trace!(events = ready.len(), "proxy poll");

        let mut occurred = false;
        for (token, closed) in ready {
            if token.0 < self.listeners.len() {
                occurred |= self.accept_all(token.0)?;
            } else if self.endpoints.contains_key(&token) {
                self.drain(token, closed);
                occurred = true;
            } else {
                trace!(token = token.0, "event for closed socket");
            }
        }
        Ok(occurred)
    }

    fn accept_all(&mut self, node: usize) -> Result<bool> {
        let mut accepted = false;
        loop {
            let Some(listener) = self.listeners[node].as_ref() else {
                return Ok(accepted);
            };
            match listener.accept() {
                Ok((stream, from)) => {
                    accepted = true;
                    self.link(node, stream, from)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(accepted),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pairs a connection accepted for `target` with an outbound connection
    /// to its real address.
    fn link(&mut self, target: usize, mut inbound: TcpStream, from: SocketAddr) -> Result<()> {
        debug!(target, %from, "proxy accepted connection");
        if !self.is_alive(target) {
            warn!(target, "connection to stopped actor refused");
            self.correlation.discard_pending();
            return Ok(());
        }
        let Some((source_actor, source_fd)) = self.correlation.pending_connect() else {
            warn!(target, %from, "connection with no pending connect dropped");
            return Ok(());
        };

        let outbound = match self.connect_outbound(source_actor, target) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(source_actor, target, error = %e, "outbound connect failed");
                self.correlation.discard_pending();
                return Ok(());
            }
        };
        let local = match outbound.local_addr() {
            Ok(SocketAddr::V4(local)) => local,
            Ok(other) => {
                warn!(%other, "outbound socket has non-IPv4 address");
                self.correlation.discard_pending();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut outbound = TcpStream::from_std(outbound);

        let inbound_token = self.allocate();
        let outbound_token = self.allocate();
        let registry = self.poll.registry();
        registry.register(&mut inbound, inbound_token, Interest::READABLE)?;
        registry.register(&mut outbound, outbound_token, Interest::READABLE)?;

        self.endpoints.insert(
            inbound_token,
            Endpoint {
                stream: inbound,
                actor: source_actor,
                peer: Some(outbound_token),
                queue: VecDeque::new(),
            },
        );
        self.endpoints.insert(
            outbound_token,
            Endpoint {
                stream: outbound,
                actor: target,
                peer: Some(inbound_token),
                queue: VecDeque::new(),
            },
        );
        self.inbound
            .entry(source_actor)
            .or_default()
            .insert(inbound_token);
        self.inbound.entry(target).or_default().insert(outbound_token);

        self.correlation.link_accepted(ProxyFd(inbound_token.0));
        self.correlation
            .expect_accept(target, ProxyFd(outbound_token.0), local);
        debug!(
            source_actor,
            source_fd,
            target,
            inbound = inbound_token.0,
            outbound = outbound_token.0,
            "linked"
        );
        Ok(())
    }

    /// Connects to `target`'s real address from the source actor's virtual
    /// address, so the target sees a stable peer address per caller.
    fn connect_outbound(&self, source_actor: usize, target: usize) -> Result<std::net::TcpStream> {
        let source_ip = if source_actor < CLIENT_OFFSET {
            *self.virtual_addrs[source_actor].ip()
        } else {
            Ipv4Addr::LOCALHOST
        };
        let source_addr = SocketAddrV4::new(source_ip, 0);
        let fd = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|source| NetError::Outbound {
            source_addr,
            source,
        })?;
        bind(fd.as_raw_fd(), &SockaddrIn::from(source_addr)).map_err(|source| {
            NetError::Outbound {
                source_addr,
                source,
            }
        })?;
        connect(fd.as_raw_fd(), &SockaddrIn::from(self.real_addrs[target]))
            .map_err(|e| NetError::Io(io::Error::from(e)))?;
        let stream = std::net::TcpStream::from(fd);
        stream.set_nonblocking(true)?;
        Ok(stream)
    }

    fn allocate(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Reads everything available on `token` and queues it on the peer.
    fn drain(&mut self, token: Token, closed: bool) {
        let mut buf = [0u8; MAX_MESSAGE];
        let mut eof = closed;
        loop {
            let Some(endpoint) = self.endpoints.get_mut(&token) else {
                return;
            };
            match endpoint.stream.read(&mut buf) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    let message = Bytes::copy_from_slice(&buf[..n]);
                    let peer = endpoint.peer;
                    match peer {
                        Some(peer) => {
                            if let Some(other) = self.endpoints.get_mut(&peer) {
                                other.queue.push_back(message);
                                trace!(
                                    from = token.0,
                                    to = peer.0,
                                    len = n,
                                    queued = other.queue.len(),
                                    "message queued"
                                );
                            }
                        }
                        None => trace!(from = token.0, len = n, "peer closed, message dropped"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(token = token.0, error = %e, "read failed");
                    eof = true;
                    break;
                }
            }
        }
        if eof {
            debug!(token = token.0, "end of stream");
            self.unregister(token, None);
        }
    }

    /// Proxy sockets facing `actor` that have queued messages.
    pub fn fds_with_messages(&self, actor: usize) -> Vec<ProxyFd> {
        self.inbound
            .get(&actor)
            .into_iter()
            .flatten()
            .filter(|token| {
                self.endpoints
                    .get(token)
                    .is_some_and(|endpoint| !endpoint.queue.is_empty())
            })
            .map(|token| ProxyFd(token.0))
            .collect()
    }

    pub fn has_more(&self, fd: ProxyFd) -> bool {
        self.endpoints
            .get(&Token(fd.0))
            .is_some_and(|endpoint| !endpoint.queue.is_empty())
    }

    /// Writes the oldest queued message on `fd`.
    ///
    /// Returns true when that emptied the queue of a link whose other half
    /// had already closed; the socket is then closed as well.
    pub fn release_next(&mut self, fd: ProxyFd) -> Result<bool> {
        let token = Token(fd.0);
        let Some(endpoint) = self.endpoints.get_mut(&token) else {
            debug!(%fd, "release on closed socket");
            return Ok(false);
        };
        let Some(message) = endpoint.queue.pop_front() else {
            return Ok(false);
        };
        debug!(%fd, actor = endpoint.actor, len = message.len(), "releasing message");
        endpoint.stream.write_all(&message)?;
        if endpoint.queue.is_empty() && endpoint.peer.is_none() {
            self.unregister(token, None);
            return Ok(true);
        }
        Ok(false)
    }

    /// One line per proxy socket: far-end actor, then each queued message's
    /// first two bytes and length.
    pub fn state_lines(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .map(|(token, endpoint)| {
                let queued: Vec<String> = endpoint
                    .queue
                    .iter()
                    .map(|message| {
                        let head: String = message
                            .iter()
                            .take(2)
                            .map(|&b| {
                                if b.is_ascii_graphic() || b == b' ' {
                                    char::from(b)
                                } else {
                                    '.'
                                }
                            })
                            .collect();
                        format!("({head}, {})", message.len())
                    })
                    .collect();
                format!(
                    "fd {:>3} --> {:>4}: [{}]",
                    token.0,
                    endpoint.actor,
                    queued.join(", ")
                )
            })
            .collect()
    }
}
