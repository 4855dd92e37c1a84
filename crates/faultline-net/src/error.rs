//! Error types for the proxy and correlation map.

use std::net::SocketAddrV4;
use thiserror::Error;

/// Proxy and correlation errors.
#[derive(Debug, Error)]
pub enum NetError {
    /// IO error on a proxy socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Creating a listener on a virtual address failed.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddrV4,
        source: std::io::Error,
    },

    /// Creating or binding an outbound socket failed.
    #[error("failed to prepare outbound socket from {source_addr}: {source}")]
    Outbound {
        source_addr: SocketAddrV4,
        source: nix::Error,
    },

    /// A connect began before the previous one was linked to an accept.
    #[error(
        "actor {actor} fd {fd} connecting while actor {pending_actor} fd {pending_fd} is still pending"
    )]
    PendingConnect {
        actor: usize,
        fd: i32,
        pending_actor: usize,
        pending_fd: i32,
    },

    /// The descriptor is neither linked nor known dead.
    #[error("actor {actor} fd {fd} is not a known connection")]
    UnknownDescriptor { actor: usize, fd: i32 },

    /// Actor index outside the configured nodes and clients.
    #[error("unknown actor {0}")]
    UnknownActor(usize),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, NetError>;
