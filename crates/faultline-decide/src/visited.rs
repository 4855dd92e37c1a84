//! Coverage-guided decisions.
//!
//! Below the visit threshold this strategy draws exactly like the random
//! one while recording what it saw into the trie. Past the threshold, actor
//! choice favours continuations of the recent window that earlier runs
//! visited least, and fail decisions along paths with unusually few
//! failures are made progressively more likely.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::event::{Event, FAILURE_TOKEN, SUCCESS_TOKEN};
use crate::random::{DecisionRates, RandomCore};
use crate::trace::TraceWriter;
use crate::trie::VisitedTrie;

const PADDING_TRACE: &str = "NONE";
const FAIL_BOOST: f64 = 1.05;

/// Tuning for the coverage-guided strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisitedSettings {
    /// Trie chain length: the window holds `window - 1` past traces.
    pub window: usize,
    /// Decisions taken randomly before switching to guided choice.
    pub visit_threshold: u64,
}

impl Default for VisitedSettings {
    fn default() -> Self {
        Self {
            window: 10,
            visit_threshold: 500,
        }
    }
}

pub struct VisitedStrategy {
    core: RandomCore,
    trace: TraceWriter,
    trie: VisitedTrie,
    coverage_path: PathBuf,
    settings: VisitedSettings,
    decisions: u64,
    past: VecDeque<String>,
    current_actor: Option<usize>,
    current_events: String,
    fail_factor: f64,
}

impl VisitedStrategy {
    pub fn new(
        seed: u64,
        num_nodes: usize,
        rates: DecisionRates,
        settings: VisitedSettings,
        trace_path: impl AsRef<Path>,
        coverage_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let coverage_path = coverage_path.as_ref().to_path_buf();
        let trie = VisitedTrie::load_or_new(&coverage_path, settings.window)?;
        Ok(Self {
            core: RandomCore::new(seed, num_nodes, rates),
            trace: TraceWriter::create(trace_path)?,
            trie,
            coverage_path,
            settings,
            decisions: 0,
            past: VecDeque::new(),
            current_actor: None,
            current_events: String::new(),
            fail_factor: 1.0,
        })
    }

    fn history_len(&self) -> usize {
        self.settings.window.saturating_sub(1)
    }

    fn below_threshold(&self) -> bool {
        self.decisions < self.settings.visit_threshold
    }

    pub fn fill_random(&mut self, buf: &mut [u8]) -> Result<()> {
        let words = self.core.fill(buf);
        self.trace.record_random(&words)
    }

    pub fn next_actor(
        &mut self,
        num_alive: usize,
        nodes: &BTreeSet<usize>,
        clients: &BTreeSet<usize>,
    ) -> Result<usize> {
        if let Some(actor) = self.current_actor {
            self.past
                .push_back(format!("{actor}-{}", self.current_events));
            self.current_events.clear();
            while self.past.len() > self.history_len() {
                self.past.pop_front();
            }
        }

        let idle = (nodes.is_empty() && clients.is_empty()) || num_alive == 0;
        let actor = if self.below_threshold() || idle {
            self.decisions += 1;
            self.core.pick_actor(num_alive, nodes, clients)
        } else {
            self.pick_least_visited(nodes, clients)?
        };

        self.trace.record_actor(actor)?;
        self.trie.register_child(actor as u32);
        self.current_actor = Some(actor);
        Ok(actor)
    }

    fn pick_least_visited(
        &mut self,
        nodes: &BTreeSet<usize>,
        clients: &BTreeSet<usize>,
    ) -> Result<usize> {
        let padding = self.history_len().saturating_sub(self.past.len());
        let window: Vec<String> = std::iter::repeat_n(PADDING_TRACE.to_string(), padding)
            .chain(self.past.iter().cloned())
            .collect();
        self.trie.start_txn(&window)?;

        let mut counts: BTreeMap<usize, u64> =
            nodes.iter().chain(clients).map(|&actor| (actor, 1)).collect();
        for (token, visits) in self.trie.counts() {
            if let Some(count) = counts.get_mut(&(token as usize)) {
                *count += visits;
            }
        }

        let max = counts.values().copied().max().unwrap_or(1);
        let total: u64 = counts.values().map(|&count| max - count + 1).sum();
        let r = u64::from(self.core.draw()) % total.max(1);

        let mut cumulative = 0;
        let mut chosen = None;
        for (&actor, &count) in &counts {
            cumulative += max - count + 1;
            if r < cumulative {
                chosen = Some(actor);
                break;
            }
        }
        tracing::debug!(?counts, r, ?chosen, "guided actor choice");
        Ok(chosen.or_else(|| counts.keys().next_back().copied()).unwrap_or_default())
    }

    pub fn should_send_msg(&mut self) -> Result<bool> {
        self.trie.register_child(Event::SendMsg.token());
        let send = self.core.should_send_msg();
        self.record_outcome(Event::SendMsg, send)?;
        Ok(send)
    }

    pub fn should_rename_on_fsync(&mut self) -> Result<bool> {
        self.trie.register_child(Event::FsyncRename.token());
        let rate = self.core.rates().fsync_rename_rate;
        let rename = self.core.one_in(rate);
        self.record_outcome(Event::FsyncRename, rename)?;
        Ok(rename)
    }

    /// Revives twice as eagerly along paths where no revival was seen yet.
    pub fn should_revive(&mut self) -> Result<bool> {
        self.trie.register_child(Event::Revive.token());
        let rate = self.core.rates().revive_rate;
        let rate = if self.trie.child_count(SUCCESS_TOKEN).is_some() {
            rate
        } else {
            rate / 2
        };
        let revive = self.core.one_in(rate);
        self.record_outcome(Event::Revive, revive)?;
        Ok(revive)
    }

    pub fn should_die(&mut self, event: Event) -> Result<bool> {
        self.trie.register_child(event.token());

        let die = if self.below_threshold() {
            self.decisions += 1;
            self.core.should_die()
        } else {
            let successes = self.trie.child_count(SUCCESS_TOKEN).unwrap_or(0);
            let failures = self.trie.child_count(FAILURE_TOKEN).unwrap_or(0);
            let rates = *self.core.rates();
            let death_rate = f64::from(rates.death_rate);

            if ((failures as f64 * death_rate * FAIL_BOOST) as u64) < successes + failures {
                self.fail_factor *= FAIL_BOOST;
            }
            let adjusted = ((death_rate / self.fail_factor) as u32).max(1);
            let fires = self.core.one_in(adjusted);
            rates.death_enabled && fires
        };

        self.trie
            .register_child(if die { FAILURE_TOKEN } else { SUCCESS_TOKEN });
        self.trace.record_bool(event, die)?;

        if die {
            self.current_events = FAILURE_TOKEN.to_string();
            self.fail_factor = 1.0;
        } else {
            let _ = write!(self.current_events, "{},", event.token());
        }
        Ok(die)
    }

    fn record_outcome(&mut self, event: Event, value: bool) -> Result<()> {
        self.trace.record_bool(event, value)?;
        self.trie
            .register_child(if value { SUCCESS_TOKEN } else { FAILURE_TOKEN });
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        self.trace.flush()?;
        self.trie.save(&self.coverage_path)?;
        tracing::info!(
            path = %self.coverage_path.display(),
            nodes = self.trie.stats().nodes,
            "coverage written"
        );
        Ok(())
    }

    pub fn trie(&self) -> &VisitedTrie {
        &self.trie
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(dir: &Path, settings: VisitedSettings) -> VisitedStrategy {
        VisitedStrategy::new(
            11,
            3,
            DecisionRates::visited(),
            settings,
            dir.join("trace"),
            dir.join("visited"),
        )
        .unwrap()
    }

    #[test]
    fn guided_choice_avoids_saturated_actor() {
        let dir = tempfile::tempdir().unwrap();
        let settings = VisitedSettings {
            window: 2,
            visit_threshold: 0,
        };
        let mut visited = strategy(dir.path(), settings);

        // Saturate actor 0 under the all-padding window.
        visited.trie.start_txn(&["NONE"]).unwrap();
        for _ in 0..1000 {
            visited.trie.register_child(0);
            visited.trie.start_txn(&["NONE"]).unwrap();
        }

        let nodes: BTreeSet<usize> = [0, 1].into();
        let clients = BTreeSet::new();
        let mut picks = [0usize; 2];
        for _ in 0..50 {
            visited.current_actor = None;
            visited.past.clear();
            picks[visited.next_actor(2, &nodes, &clients).unwrap()] += 1;
        }
        assert!(picks[1] > picks[0], "{picks:?}");
    }

    #[test]
    fn window_rolls_forward_with_actor_traces() {
        let dir = tempfile::tempdir().unwrap();
        let settings = VisitedSettings {
            window: 3,
            visit_threshold: 1_000,
        };
        let mut visited = strategy(dir.path(), settings);
        let nodes: BTreeSet<usize> = [0].into();
        let none = BTreeSet::new();

        visited.next_actor(1, &nodes, &none).unwrap();
        visited.should_die(Event::Send).unwrap();
        visited.next_actor(1, &nodes, &none).unwrap();
        visited.next_actor(1, &nodes, &none).unwrap();
        visited.next_actor(1, &nodes, &none).unwrap();

        assert_eq!(visited.past.len(), 2);
        assert_eq!(visited.past.back().map(String::as_str), Some("0-"));
    }

    #[test]
    fn finish_persists_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let mut visited = strategy(dir.path(), VisitedSettings::default());
        let nodes: BTreeSet<usize> = [0, 1, 2].into();
        visited.next_actor(3, &nodes, &BTreeSet::new()).unwrap();
        visited.should_send_msg().unwrap();
        visited.finish().unwrap();

        let reloaded = VisitedTrie::load_or_new(dir.path().join("visited"), 10).unwrap();
        assert_eq!(reloaded.stats().max_depth, 3);
    }
}
