//! # faultline-net
//!
//! Network fault injection for faultline.
//!
//! - [`FaultInjectingProxy`] owns every node's virtual address. Connections
//!   are bridged to real addresses, and bytes are held in per-socket queues
//!   until the orchestrator releases them one message at a time.
//! - [`CorrelationMap`] ties descriptors inside traced processes to the
//!   proxy sockets carrying their traffic, and is the single source of
//!   truth for whether a process-side connection is still alive.

mod correlation;
mod error;
mod proxy;

pub use correlation::{CorrelationMap, Liveness, ProxyFd};
pub use error::{NetError, Result};
pub use proxy::{CLIENT_OFFSET, FaultInjectingProxy, PollMode};
