//! Correlation between descriptors inside traced processes and the proxy
//! sockets that carry their traffic.
//!
//! A connection through the proxy has four sockets: the actor's own
//! connecting socket, the proxy's accepted socket, the proxy's outbound
//! socket and the target actor's accepted socket. This map ties each actor
//! descriptor to the proxy socket facing it, so the virtualizers can ask
//! whether a connection is still alive when the actor sends on it.
//!
//! Lifecycle of an actor descriptor:
//!
//! ```text
//! register_connect ──► Connecting ──link_accepted──► Alive ──unregister──► Dead
//!                          │                                                │
//!                          └──────────discard_pending───────────────────────┤
//!                                                                           ▼
//!                                                    clear_node ──► Unknown
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddrV4;

use tracing::{debug, warn};

use crate::error::{NetError, Result};

/// Identity of a proxy-side socket. Never reused within one proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProxyFd(pub usize);

impl fmt::Display for ProxyFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Liveness of an actor descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Connect issued, proxy has not accepted it yet.
    Connecting,
    /// Linked to a proxy socket.
    Alive,
    /// The proxy side has closed.
    Dead,
    /// Never seen, or forgotten by a restart.
    Unknown,
}

/// Maps `(actor, fd)` to and from proxy sockets and tracks liveness.
#[derive(Debug, Default)]
pub struct CorrelationMap {
    /// The one connect waiting for the proxy to accept it.
    pending: Option<(usize, i32)>,
    /// Outbound proxy sockets per target actor, waiting for that actor's
    /// accept, keyed by the outbound socket's local address.
    awaiting_accept: BTreeMap<usize, Vec<(ProxyFd, SocketAddrV4)>>,
    to_proxy: BTreeMap<(usize, i32), ProxyFd>,
    from_proxy: BTreeMap<ProxyFd, (usize, i32)>,
    dead: BTreeMap<usize, BTreeSet<i32>>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a connect from `(actor, fd)` that the proxy will accept next.
    pub fn register_connect(&mut self, actor: usize, fd: i32) -> Result<()> {
        if let Some((pending_actor, pending_fd)) = self.pending {
            return Err(NetError::PendingConnect {
                actor,
                fd,
                pending_actor,
                pending_fd,
            });
        }
        debug!(actor, fd, "connect pending");
        if let Some(dead) = self.dead.get_mut(&actor) {
            dead.remove(&fd);
        }
        self.pending = Some((actor, fd));
        Ok(())
    }

    pub fn pending_connect(&self) -> Option<(usize, i32)> {
        self.pending
    }

    /// Drops the pending connect; its descriptor becomes dead.
    pub fn discard_pending(&mut self) -> Option<(usize, i32)> {
        let (actor, fd) = self.pending.take()?;
        debug!(actor, fd, "pending connect discarded");
        self.to_proxy.remove(&(actor, fd));
        self.dead.entry(actor).or_default().insert(fd);
        Some((actor, fd))
    }

    /// Links the pending connect to the proxy socket that accepted it.
    ///
    /// Returns the linked `(actor, fd)`, or `None` if nothing was pending.
    pub fn link_accepted(&mut self, proxy_fd: ProxyFd) -> Option<(usize, i32)> {
        let (actor, fd) = self.pending.take()?;
        debug!(actor, fd, %proxy_fd, "proxy accepted");
        self.to_proxy.insert((actor, fd), proxy_fd);
        self.from_proxy.insert(proxy_fd, (actor, fd));
        Some((actor, fd))
    }

    /// Queues the proxy's outbound socket for `actor`'s upcoming accept.
    pub fn expect_accept(&mut self, actor: usize, proxy_fd: ProxyFd, local: SocketAddrV4) {
        debug!(actor, %proxy_fd, %local, "awaiting accept");
        self.awaiting_accept
            .entry(actor)
            .or_default()
            .push((proxy_fd, local));
    }

    /// Links an accepted descriptor to the outbound proxy socket whose local
    /// address is the accepted peer address. Returns whether a match was
    /// found.
    pub fn register_accept(&mut self, actor: usize, fd: i32, peer: SocketAddrV4) -> bool {
        let Some(waiting) = self.awaiting_accept.get_mut(&actor) else {
            warn!(actor, fd, %peer, "accept with no proxy connection outstanding");
            return false;
        };
        let Some(position) = waiting.iter().position(|(_, local)| *local == peer) else {
            warn!(actor, fd, %peer, "accept from address the proxy did not connect from");
            return false;
        };
        let (proxy_fd, _) = waiting.remove(position);
        debug!(actor, fd, %proxy_fd, "accept linked");
        if let Some(dead) = self.dead.get_mut(&actor) {
            dead.remove(&fd);
        }
        self.to_proxy.insert((actor, fd), proxy_fd);
        self.from_proxy.insert(proxy_fd, (actor, fd));
        true
    }

    /// Forgets a closed proxy socket.
    ///
    /// The actor descriptor it served becomes dead only if it still maps to
    /// this proxy socket; a descriptor number reused for a newer connection
    /// keeps its liveness.
    pub fn unregister(&mut self, proxy_fd: ProxyFd) -> Option<(usize, i32)> {
        for waiting in self.awaiting_accept.values_mut() {
            waiting.retain(|(fd, _)| *fd != proxy_fd);
        }
        let (actor, fd) = self.from_proxy.remove(&proxy_fd)?;
        if self.to_proxy.get(&(actor, fd)) == Some(&proxy_fd) {
            self.to_proxy.remove(&(actor, fd));
            self.dead.entry(actor).or_default().insert(fd);
            debug!(%proxy_fd, actor, fd, "unregistered, descriptor dead");
        } else {
            debug!(%proxy_fd, actor, fd, "unregistered, descriptor superseded");
        }
        Some((actor, fd))
    }

    pub fn liveness(&self, actor: usize, fd: i32) -> Liveness {
        if self.pending == Some((actor, fd)) {
            Liveness::Connecting
        } else if self.to_proxy.contains_key(&(actor, fd)) {
            Liveness::Alive
        } else if self.dead.get(&actor).is_some_and(|dead| dead.contains(&fd)) {
            Liveness::Dead
        } else {
            Liveness::Unknown
        }
    }

    /// True for linked descriptors, false for dead ones.
    ///
    /// A descriptor still connecting counts as alive.
    pub fn is_alive(&self, actor: usize, fd: i32) -> Result<bool> {
        match self.liveness(actor, fd) {
            Liveness::Connecting | Liveness::Alive => Ok(true),
            Liveness::Dead => Ok(false),
            Liveness::Unknown => Err(NetError::UnknownDescriptor { actor, fd }),
        }
    }

    /// Forgets `actor`'s dead and half-established descriptors after a
    /// restart. Linked entries are removed by the proxy as it closes them.
    pub fn clear_node(&mut self, actor: usize) {
        self.awaiting_accept.remove(&actor);
        self.dead.remove(&actor);
        if self.pending.is_some_and(|(pending, _)| pending == actor) {
            self.pending = None;
        }
    }

    /// The actor descriptor a proxy socket serves.
    pub fn related(&self, proxy_fd: ProxyFd) -> Option<(usize, i32)> {
        self.from_proxy.get(&proxy_fd).copied()
    }
}
