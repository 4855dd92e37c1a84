//! Counting trie over small-integer trace tokens.
//!
//! Each path from the root is a window of recent per-actor traces followed
//! by the decisions made since. Every visit to a child bumps its count, so
//! after many runs the counts tell the coverage-guided strategy which
//! continuations are rare.
//!
//! Nodes live in an arena indexed by `usize`; children are kept in a
//! `BTreeMap` so the serialized form is stable for a given set of visits.
//!
//! # File format
//!
//! ```text
//! <chain length>
//! <token count>
//! <token>;<id>          (one per token, ascending id)
//! <blank line>
//! <id>;<count>;<old count>   (pre-order, one per node)
//! ---                        (after the children of each node, root included)
//! ```
//!
//! `#` is accepted in place of `---` when reading.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::{DecideError, Result};

const ROOT: usize = 0;
const VALUE_DELIMITER: char = ';';
const ROUTE_DELIMITER: &str = "---";
const LEGACY_ROUTE_DELIMITER: &str = "#";

#[derive(Debug, Default)]
struct TrieNode {
    count: u64,
    /// Portion of `count` loaded from a previous run.
    old_count: u64,
    children: BTreeMap<u32, usize>,
}

/// Summary of a trie's shape, reported by the coverage command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrieStats {
    pub tokens: usize,
    pub nodes: usize,
    pub max_depth: usize,
    pub total_visits: u64,
    pub carried_visits: u64,
}

/// Arena-backed counting trie with a transaction cursor.
#[derive(Debug)]
pub struct VisitedTrie {
    chain_length: usize,
    nodes: Vec<TrieNode>,
    cursor: usize,
    tokens: HashMap<String, u32>,
    next_token: u32,
}

impl VisitedTrie {
    /// Creates an empty trie whose transactions start with
    /// `chain_length - 1` past traces.
    pub fn new(chain_length: usize) -> Self {
        Self {
            chain_length,
            nodes: vec![TrieNode::default()],
            cursor: ROOT,
            tokens: HashMap::new(),
            next_token: 1,
        }
    }

    pub fn chain_length(&self) -> usize {
        self.chain_length
    }

    /// Moves the cursor back to the root and descends through `window`,
    /// counting each step.
    pub fn start_txn<S: AsRef<str>>(&mut self, window: &[S]) -> Result<()> {
        self.end_txn();
        let expected = self.chain_length.saturating_sub(1);
        if window.len() != expected {
            return Err(DecideError::WindowLength {
                expected,
                found: window.len(),
            });
        }
        for trace in window {
            let token = self.add_token(trace.as_ref());
            self.register_child(token);
        }
        Ok(())
    }

    /// Descends into `token` below the cursor, creating it if needed, and
    /// increments its count.
    pub fn register_child(&mut self, token: u32) {
        self.cursor = self.descend(self.cursor, token, 1, false);
    }

    /// Visit count of `token` directly below the cursor.
    pub fn child_count(&self, token: u32) -> Option<u64> {
        self.nodes[self.cursor]
            .children
            .get(&token)
            .map(|&child| self.nodes[child].count)
    }

    /// Visit counts of every child directly below the cursor.
    pub fn counts(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.nodes[self.cursor]
            .children
            .iter()
            .map(|(&token, &child)| (token, self.nodes[child].count))
    }

    pub fn end_txn(&mut self) {
        self.cursor = ROOT;
    }

    pub fn stats(&self) -> TrieStats {
        let mut max_depth = 0;
        let mut stack = vec![(ROOT, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            max_depth = max_depth.max(depth);
            stack.extend(
                self.nodes[node]
                    .children
                    .values()
                    .map(|&child| (child, depth + 1)),
            );
        }

        let (total_visits, carried_visits) = self
            .nodes
            .iter()
            .skip(1)
            .fold((0, 0), |(total, carried), node| {
                (total + node.count, carried + node.old_count)
            });

        TrieStats {
            tokens: self.tokens.len(),
            nodes: self.nodes.len() - 1,
            max_depth,
            total_visits,
            carried_visits,
        }
    }

    fn add_token(&mut self, trace: &str) -> u32 {
        if let Some(&id) = self.tokens.get(trace) {
            return id;
        }
        let id = self.next_token;
        self.next_token += 1;
        self.tokens.insert(trace.to_string(), id);
        id
    }

    fn descend(&mut self, parent: usize, token: u32, by: u64, carried: bool) -> usize {
        let child = match self.nodes[parent].children.get(&token) {
            Some(&child) => child,
            None => {
                let child = self.nodes.len();
                self.nodes.push(TrieNode::default());
                self.nodes[parent].children.insert(token, child);
                child
            }
        };
        let node = &mut self.nodes[child];
        node.count += by;
        if carried {
            node.old_count += by;
        }
        child
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Loads a coverage file, or returns an empty trie when none exists yet.
    pub fn load_or_new(path: impl AsRef<Path>, chain_length: usize) -> Result<Self> {
        let path = path.as_ref();
        match File::open(path) {
            Ok(file) => Self::read_from(BufReader::new(file), chain_length),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no coverage file yet, starting empty");
                Ok(Self::new(chain_length))
            }
            Err(e) => Err(DecideError::io(path, e)),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| DecideError::io(path, e))?;
        let mut out = BufWriter::new(file);
        self.write_to(&mut out)
            .and_then(|()| out.flush())
            .map_err(|e| DecideError::io(path, e))
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        writeln!(out, "{}", self.chain_length)?;
        writeln!(out, "{}", self.tokens.len())?;

        let mut tokens: Vec<(&String, &u32)> = self.tokens.iter().collect();
        tokens.sort_by_key(|&(_, &id)| id);
        for (trace, id) in tokens {
            writeln!(out, "{trace}{VALUE_DELIMITER}{id}")?;
        }
        writeln!(out)?;

        // Iterative pre-order walk; below the visit threshold paths grow as
        // one long chain.
        let mut stack = vec![self.nodes[ROOT].children.iter()];
        while let Some(siblings) = stack.last_mut() {
            match siblings.next() {
                Some((&token, &child)) => {
                    let node = &self.nodes[child];
                    writeln!(
                        out,
                        "{token}{VALUE_DELIMITER}{}{VALUE_DELIMITER}{}",
                        node.count, node.old_count
                    )?;
                    stack.push(node.children.iter());
                }
                None => {
                    stack.pop();
                    writeln!(out, "{ROUTE_DELIMITER}")?;
                }
            }
        }
        Ok(())
    }

    pub fn read_from<R: BufRead>(input: R, chain_length: usize) -> Result<Self> {
        let mut lines = input.lines().enumerate().map(|(i, line)| (i + 1, line));
        let mut next_line = |what: &str| -> Result<(usize, String)> {
            match lines.next() {
                Some((n, Ok(line))) => Ok((n, line)),
                Some((n, Err(e))) => Err(DecideError::MalformedCoverage {
                    line: n,
                    reason: e.to_string(),
                }),
                None => Err(DecideError::MalformedCoverage {
                    line: 0,
                    reason: format!("missing {what}"),
                }),
            }
        };

        let (n, header) = next_line("chain length")?;
        let found: usize = parse_field(&header, n)?;
        if found != chain_length {
            return Err(DecideError::ChainLength {
                expected: chain_length,
                found,
            });
        }

        let mut trie = Self::new(chain_length);

        let (n, size) = next_line("token count")?;
        let token_count: usize = parse_field(&size, n)?;
        let mut last_id = 0;
        for _ in 0..token_count {
            let (n, line) = next_line("token entry")?;
            let (trace, id) =
                line.rsplit_once(VALUE_DELIMITER)
                    .ok_or_else(|| DecideError::MalformedCoverage {
                        line: n,
                        reason: format!("token entry without '{VALUE_DELIMITER}'"),
                    })?;
            let id: u32 = parse_field(id, n)?;
            last_id = last_id.max(id);
            trie.tokens.insert(trace.to_string(), id);
        }
        trie.next_token = last_id + 1;

        let mut path: Vec<usize> = Vec::new();
        loop {
            let (n, line) = match next_line("tree") {
                Ok(entry) => entry,
                Err(DecideError::MalformedCoverage { line: 0, .. }) => break,
                Err(e) => return Err(e),
            };
            let line = line.trim_end();
            if line.is_empty() {
                path.push(ROOT);
                trie.cursor = ROOT;
            } else if line == ROUTE_DELIMITER || line == LEGACY_ROUTE_DELIMITER {
                path.pop();
                trie.cursor = path.last().copied().unwrap_or(ROOT);
            } else {
                let mut fields = line.split(VALUE_DELIMITER);
                let token: u32 = parse_field(fields.next().unwrap_or_default(), n)?;
                let count: u64 = parse_field(fields.next().unwrap_or_default(), n)?;
                trie.cursor = trie.descend(trie.cursor, token, count, true);
                path.push(trie.cursor);
            }
        }

        trie.end_txn();
        Ok(trie)
    }
}

fn parse_field<T: std::str::FromStr>(text: &str, line: usize) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| DecideError::MalformedCoverage {
            line,
            reason: format!("expected a number, found {text:?}"),
        })
}
