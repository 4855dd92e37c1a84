//! Replay of a recorded decision trace.

use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{DecideError, Result};
use crate::event::Event;
use crate::trace::TraceReader;

/// Answers every question from a previously recorded trace, failing on the
/// first question the trace did not record.
pub struct ReplayStrategy {
    reader: TraceReader,
    num_nodes: usize,
}

impl ReplayStrategy {
    pub fn open(trace: impl AsRef<Path>, num_nodes: usize) -> Result<Self> {
        Ok(Self::from_reader(TraceReader::open(trace)?, num_nodes))
    }

    pub fn from_reader(reader: TraceReader, num_nodes: usize) -> Self {
        Self { reader, num_nodes }
    }

    pub fn fill_random(&mut self, buf: &mut [u8]) -> Result<()> {
        for chunk in buf.chunks_mut(4) {
            let value = self.reader.next_value(Event::Random)?;
            let word = i32::try_from(value)
                .or_else(|_| u32::try_from(value).map(|w| w as i32))
                .map_err(|_| DecideError::MalformedTrace {
                    offset: 0,
                    reason: format!("random word {value} does not fit in 32 bits"),
                })?;
            chunk.copy_from_slice(&word.to_le_bytes()[..chunk.len()]);
        }
        Ok(())
    }

    pub fn next_actor(
        &mut self,
        num_alive: usize,
        nodes: &BTreeSet<usize>,
        clients: &BTreeSet<usize>,
    ) -> Result<usize> {
        let value = self.reader.next_value(Event::NextNode)?;
        let actor = usize::try_from(value).map_err(|_| DecideError::ImpossibleActor { actor: value })?;

        let possible = if num_alive > 0 && nodes.len() + clients.len() > 0 {
            nodes.contains(&actor) || clients.contains(&actor)
        } else {
            actor < self.num_nodes
        };
        if !possible {
            return Err(DecideError::ImpossibleActor { actor: value });
        }
        Ok(actor)
    }

    pub fn decide(&mut self, event: Event) -> Result<bool> {
        self.reader.next_bool(event)
    }

    /// True when every recorded decision has been consumed.
    pub fn is_exhausted(&mut self) -> bool {
        self.reader.is_exhausted()
    }
}
