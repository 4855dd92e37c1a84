//! # faultline
//!
//! Deterministic fault injection for multi-process distributed systems.
//!
//! Real node and client binaries run as traced children. Their clocks,
//! addresses, randomness and durability are virtualized, their TCP traffic
//! flows through a proxy that holds every message until it is released, and
//! a single-threaded scheduler decides who runs next. Crashes, torn writes,
//! lost renames and delayed messages are all drawn from one decision engine,
//! so a recorded trace replays the same run byte for byte.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │         Orchestrator         │
//!                 │  next_actor ─► step ─► fault │
//!                 └──┬───────────┬────────────┬──┘
//!                    │           │            │
//!          ┌─────────▼──┐  ┌─────▼──────┐  ┌──▼─────────────┐
//!          │ Decision   │  │ Node /     │  │ FaultInjecting │
//!          │ Engine     │  │ Client     │◄─┤ Proxy +        │
//!          │ (trace,    │  │ Virtualizer│  │ CorrelationMap │
//!          │  trie)     │  │ (ptrace)   │  └────────────────┘
//!          └────────────┘  └────────────┘
//! ```
//!
//! # Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | every iteration ran |
//! | 1 | harness error |
//! | 2 | a node exited on its own |
//! | 3 | a client exited on its own |
//! | 4 | the validator failed |
//! | 5 | bad configuration or unreadable input |

mod actor;
mod client;
pub mod clock;
pub mod command;
pub mod durability;
mod error;
mod node;
mod orchestrator;
mod validator;

use faultline_config::HarnessConfig;
use faultline_trace::{Launcher, PtraceLauncher};
use tracing::{error, info};

pub use actor::Termination;
pub use client::{ClientEvent, ClientState, ClientVirtualizer};
pub use error::{Error, Result};
pub use node::{NodeEvent, NodeSetup, NodeState, NodeVirtualizer, WriteOutcome};
pub use orchestrator::{Orchestrator, Outcome};
pub use validator::Validator;

/// Exit code for a configuration that fails validation.
pub const EXIT_BAD_CONFIG: i32 = 5;

/// Runs the harness with real traced processes and returns the process exit
/// code.
pub fn run(config: &HarnessConfig) -> i32 {
    run_with(config, PtraceLauncher)
}

/// Runs the harness, launching actors through `launcher`.
pub fn run_with<L: Launcher>(config: &HarnessConfig, launcher: L) -> i32 {
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return EXIT_BAD_CONFIG;
    }
    match execute(config, launcher) {
        Ok(outcome) => {
            info!(%outcome, "run ended");
            outcome.exit_code()
        }
        Err(e) => {
            error!(error = %e, "run failed");
            e.exit_code()
        }
    }
}

fn execute<L: Launcher>(config: &HarnessConfig, launcher: L) -> Result<Outcome> {
    let mut orchestrator = Orchestrator::new(config, launcher)?;
    let result = orchestrator.run();
    let finished = orchestrator.shutdown();
    let outcome = result?;
    finished?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use faultline_config::Mode;
    use faultline_trace::ScriptedLauncher;

    use super::*;

    #[test]
    fn invalid_config_exits_five() {
        let config = HarnessConfig::default();
        assert_eq!(run_with(&config, ScriptedLauncher::new()), EXIT_BAD_CONFIG);
    }

    #[test]
    fn unreadable_replay_trace_exits_with_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::default();
        config.run.mode = Mode::Replay;
        config.run.log_dir = dir.path().to_path_buf();
        config.commands.node = "/bin/node".to_string();
        config.commands.client = "/bin/client".to_string();
        config.commands.validate = "/bin/true".to_string();
        config.network.virtual_addrs = vec!["127.0.0.2".to_string()];
        config.network.real_addrs = vec!["127.0.1.2".to_string()];
        config.network.listen_port = 7000;
        config.storage.node_dir = dir.path().join("{addr}").to_string_lossy().into_owned();
        config.files.trace = dir.path().join("missing-trace");

        assert_eq!(run_with(&config, ScriptedLauncher::new()), EXIT_BAD_CONFIG);
    }
}
