//! The decision engine the orchestrator talks to.

use std::collections::BTreeSet;
use std::path::Path;

use crate::error::Result;
use crate::event::Event;
use crate::random::{DecisionRates, RandomCore};
use crate::replay::ReplayStrategy;
use crate::trace::TraceWriter;
use crate::visited::{VisitedSettings, VisitedStrategy};

/// Seeded random decisions, each appended to a trace.
pub struct RandomStrategy {
    core: RandomCore,
    trace: TraceWriter,
}

impl RandomStrategy {
    pub fn new(
        seed: u64,
        num_nodes: usize,
        rates: DecisionRates,
        trace_path: impl AsRef<Path>,
    ) -> Result<Self> {
        Ok(Self {
            core: RandomCore::new(seed, num_nodes, rates),
            trace: TraceWriter::create(trace_path)?,
        })
    }

    fn decide(&mut self, event: Event) -> Result<bool> {
        let rates = *self.core.rates();
        let value = match event {
            Event::SendMsg => self.core.should_send_msg(),
            Event::FsyncRename => self.core.one_in(rates.fsync_rename_rate),
            Event::Revive => self.core.one_in(rates.revive_rate),
            _ => self.core.should_die(),
        };
        self.trace.record_bool(event, value)?;
        Ok(value)
    }
}

/// Answers every nondeterministic question the harness asks.
///
/// All three strategies expose the same questions; Random and Visited
/// record each answer to the trace file, Replay reads them back.
pub enum DecisionEngine {
    Random(RandomStrategy),
    Replay(ReplayStrategy),
    Visited(VisitedStrategy),
}

impl DecisionEngine {
    pub fn random(
        seed: u64,
        num_nodes: usize,
        rates: DecisionRates,
        trace_path: impl AsRef<Path>,
    ) -> Result<Self> {
        Ok(Self::Random(RandomStrategy::new(
            seed, num_nodes, rates, trace_path,
        )?))
    }

    pub fn replay(trace_path: impl AsRef<Path>, num_nodes: usize) -> Result<Self> {
        Ok(Self::Replay(ReplayStrategy::open(trace_path, num_nodes)?))
    }

    pub fn visited(
        seed: u64,
        num_nodes: usize,
        rates: DecisionRates,
        settings: VisitedSettings,
        trace_path: impl AsRef<Path>,
        coverage_path: impl AsRef<Path>,
    ) -> Result<Self> {
        Ok(Self::Visited(VisitedStrategy::new(
            seed,
            num_nodes,
            rates,
            settings,
            trace_path,
            coverage_path,
        )?))
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::Random(_) => "random",
            Self::Replay(_) => "replay",
            Self::Visited(_) => "visited",
        }
    }

    /// Fills `buf` with the bytes a `getrandom` call returns.
    pub fn fill_random(&mut self, buf: &mut [u8]) -> Result<()> {
        match self {
            Self::Random(random) => {
                let words = random.core.fill(buf);
                random.trace.record_random(&words)
            }
            Self::Replay(replay) => replay.fill_random(buf),
            Self::Visited(visited) => visited.fill_random(buf),
        }
    }

    /// Chooses which actor to step next.
    ///
    /// `nodes` and `clients` are the actors that can make progress right now;
    /// when nothing can, an idle node is chosen by tie-break.
    pub fn next_actor(
        &mut self,
        num_alive: usize,
        nodes: &BTreeSet<usize>,
        clients: &BTreeSet<usize>,
    ) -> Result<usize> {
        let actor = match self {
            Self::Random(random) => {
                let actor = random.core.pick_actor(num_alive, nodes, clients);
                random.trace.record_actor(actor)?;
                actor
            }
            Self::Replay(replay) => replay.next_actor(num_alive, nodes, clients)?,
            Self::Visited(visited) => visited.next_actor(num_alive, nodes, clients)?,
        };
        tracing::debug!(actor, num_alive, ?nodes, ?clients, "next actor");
        Ok(actor)
    }

    pub fn should_send_msg(&mut self) -> Result<bool> {
        match self {
            Self::Random(random) => random.decide(Event::SendMsg),
            Self::Replay(replay) => replay.decide(Event::SendMsg),
            Self::Visited(visited) => visited.should_send_msg(),
        }
    }

    pub fn should_fail_on_send(&mut self) -> Result<bool> {
        self.fail(Event::Send)
    }

    pub fn should_fail_on_connect(&mut self) -> Result<bool> {
        self.fail(Event::Connect)
    }

    pub fn should_fail_on_write(&mut self) -> Result<bool> {
        self.fail(Event::Write)
    }

    pub fn should_fail_on_fsync(&mut self) -> Result<bool> {
        self.fail(Event::FsyncFail)
    }

    /// True commits every pending rename before the fsync, false commits none.
    pub fn should_rename_on_fsync(&mut self) -> Result<bool> {
        match self {
            Self::Random(random) => random.decide(Event::FsyncRename),
            Self::Replay(replay) => replay.decide(Event::FsyncRename),
            Self::Visited(visited) => visited.should_rename_on_fsync(),
        }
    }

    pub fn should_revive(&mut self) -> Result<bool> {
        match self {
            Self::Random(random) => random.decide(Event::Revive),
            Self::Replay(replay) => replay.decide(Event::Revive),
            Self::Visited(visited) => visited.should_revive(),
        }
    }

    pub fn client_should_fail_on_send(&mut self) -> Result<bool> {
        self.fail(Event::ClientSend)
    }

    pub fn client_should_fail_on_connect(&mut self) -> Result<bool> {
        self.fail(Event::ClientConnect)
    }

    fn fail(&mut self, event: Event) -> Result<bool> {
        let die = match self {
            Self::Random(random) => random.decide(event)?,
            Self::Replay(replay) => replay.decide(event)?,
            Self::Visited(visited) => visited.should_die(event)?,
        };
        if die {
            tracing::debug!(event = %event.code(), "fault injected");
        }
        Ok(die)
    }

    /// Flushes the trace and, in coverage-guided mode, writes the trie.
    pub fn finish(&mut self) -> Result<()> {
        match self {
            Self::Random(random) => random.trace.flush(),
            Self::Replay(_) => Ok(()),
            Self::Visited(visited) => visited.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_fail_decisions_share_one_draw_each() {
        let dir = tempfile::tempdir().unwrap();
        let rates = DecisionRates {
            death_rate: 1,
            ..DecisionRates::default()
        };
        let mut engine = DecisionEngine::random(3, 3, rates, dir.path().join("t")).unwrap();
        assert!(engine.should_fail_on_send().unwrap());
        assert!(engine.should_fail_on_connect().unwrap());
        assert!(engine.client_should_fail_on_send().unwrap());
        engine.finish().unwrap();

        let text = std::fs::read_to_string(dir.path().join("t")).unwrap();
        assert_eq!(text, "s1\nc1\np1\n");
    }

    #[test]
    fn mode_names() {
        let dir = tempfile::tempdir().unwrap();
        let trace = dir.path().join("t");
        let random = DecisionEngine::random(1, 3, DecisionRates::default(), &trace).unwrap();
        assert_eq!(random.mode_name(), "random");
        let replay = DecisionEngine::replay(&trace, 3).unwrap();
        assert_eq!(replay.mode_name(), "replay");
    }
}
