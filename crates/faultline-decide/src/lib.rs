//! # faultline-decide
//!
//! Every nondeterministic choice faultline makes goes through a
//! [`DecisionEngine`]: which actor runs next, whether an operation fails,
//! what bytes `getrandom` returns, whether pending renames are committed by
//! an fsync.
//!
//! Three strategies share one set of questions:
//!
//! - **Random**: seeded `ChaCha8` draws, every answer written to a trace.
//! - **Replay**: answers read back from a trace; the first mismatch between
//!   the live questions and the recorded ones is a [`DecideError::Divergence`].
//! - **Visited**: random up to a threshold, then biased toward actor choices
//!   a persistent [`VisitedTrie`] has seen least, with fail rates boosted
//!   along paths that have rarely failed.
//!
//! Two runs with the same seed and the same system under test ask the same
//! questions in the same order and therefore write byte-identical traces.

mod engine;
mod error;
mod event;
mod random;
mod replay;
mod trace;
mod trie;
mod visited;

pub use engine::{DecisionEngine, RandomStrategy};
pub use error::{DecideError, Result};
pub use event::{Event, FAILURE_TOKEN, SUCCESS_TOKEN};
pub use random::DecisionRates;
pub use replay::ReplayStrategy;
pub use trace::{TraceReader, TraceWriter};
pub use trie::{TrieStats, VisitedTrie};
pub use visited::{VisitedSettings, VisitedStrategy};
