//! Seeded random decisions.
//!
//! `RandomCore` owns the generator and the tie-break poll counters. The
//! random and coverage-guided strategies both delegate to it so that, for
//! the same seed, their draws line up one for one below the visit
//! threshold.

use std::collections::BTreeSet;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Rates and weights that shape random decisions.
///
/// A rate of `n` means "one in `n`".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionRates {
    /// Weight of each runnable node relative to a runnable client.
    pub node_preference: u32,
    /// When false, fail decisions still consume a draw but never fire.
    pub death_enabled: bool,
    pub death_rate: u32,
    pub revive_rate: u32,
    pub fsync_rename_rate: u32,
    /// One in `msg_delay_rate` release opportunities is skipped.
    pub msg_delay_rate: u32,
    /// Share (out of 100) of idle tie-breaks that go to node 0.
    pub primary_percent: u32,
}

impl Default for DecisionRates {
    fn default() -> Self {
        Self {
            node_preference: 2,
            death_enabled: true,
            death_rate: 400,
            revive_rate: 30,
            fsync_rename_rate: 10,
            msg_delay_rate: 5,
            primary_percent: 94,
        }
    }
}

impl DecisionRates {
    /// Defaults for the coverage-guided strategy, which fails less often
    /// up front and relies on adaptive boosting instead.
    pub fn visited() -> Self {
        Self {
            death_rate: 800,
            primary_percent: 96,
            ..Self::default()
        }
    }
}

pub(crate) struct RandomCore {
    rng: ChaCha8Rng,
    rates: DecisionRates,
    poll_counts: Vec<u64>,
}

impl RandomCore {
    pub(crate) fn new(seed: u64, num_nodes: usize, rates: DecisionRates) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            rates,
            poll_counts: vec![0; num_nodes],
        }
    }

    pub(crate) fn rates(&self) -> &DecisionRates {
        &self.rates
    }

    pub(crate) fn draw(&mut self) -> u32 {
        self.rng.next_u32()
    }

    /// True one time in `rate`. Always consumes a draw.
    pub(crate) fn one_in(&mut self, rate: u32) -> bool {
        self.draw() % rate.max(1) == 0
    }

    /// Fills `buf` one 32-bit word at a time and returns the words drawn.
    pub(crate) fn fill(&mut self, buf: &mut [u8]) -> Vec<i32> {
        buf.chunks_mut(4)
            .map(|chunk| {
                let word = self.draw();
                chunk.copy_from_slice(&word.to_le_bytes()[..chunk.len()]);
                word as i32
            })
            .collect()
    }

    pub(crate) fn should_die(&mut self) -> bool {
        let fires = self.one_in(self.rates.death_rate);
        self.rates.death_enabled && fires
    }

    pub(crate) fn should_send_msg(&mut self) -> bool {
        !self.one_in(self.rates.msg_delay_rate)
    }

    /// Picks the next actor: uniformly among runnable actors (nodes weighted
    /// by `node_preference`) when any node is alive and something is
    /// runnable, otherwise an idle node by tie-break.
    pub(crate) fn pick_actor(
        &mut self,
        num_alive: usize,
        nodes: &BTreeSet<usize>,
        clients: &BTreeSet<usize>,
    ) -> usize {
        let node_weight = self.rates.node_preference as usize * nodes.len();
        let total = node_weight + clients.len();
        if total > 0 && num_alive > 0 {
            let r = self.draw() as usize % total;
            if r < node_weight {
                nth(nodes, r % nodes.len())
            } else {
                nth(clients, r - node_weight)
            }
        } else {
            self.pick_idle()
        }
    }

    /// Least-polled node, or the primary-biased choice when every node has
    /// been polled equally often.
    pub(crate) fn pick_idle(&mut self) -> usize {
        let num_nodes = self.poll_counts.len();
        let min = self.poll_counts.iter().copied().min().unwrap_or(0);
        let first_min = self
            .poll_counts
            .iter()
            .position(|&count| count == min)
            .unwrap_or(0);
        let tied = self.poll_counts.iter().filter(|&&count| count == min).count();

        let prop = self.draw() % 100;
        let chosen = if tied == num_nodes {
            let primary = self.rates.primary_percent.min(100);
            let secondary = (100 - primary) / 2;
            if prop < primary {
                0
            } else if prop - primary < secondary {
                1
            } else {
                let rest = num_nodes.saturating_sub(2).max(1);
                2 + (prop - primary - secondary) as usize % rest
            }
        } else {
            first_min
        };
        let chosen = chosen.min(num_nodes.saturating_sub(1));

        if let Some(count) = self.poll_counts.get_mut(chosen) {
            *count += 1;
        }
        chosen
    }
}

fn nth(set: &BTreeSet<usize>, n: usize) -> usize {
    set.iter().nth(n).copied().unwrap_or_default()
}
