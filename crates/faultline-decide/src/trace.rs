//! Decision trace codec.
//!
//! A trace is a text file with one decision per line:
//!
//! ```text
//! n2
//! s0
//! r-1794516214,r88812,
//! ```
//!
//! Actor choices are `n<actor>`, boolean decisions `<code><0|1>` and random
//! fills one `r<word>,` per 32-bit word on a single line. The reader is a
//! whitespace-insensitive tokenizer so hand-edited traces still replay.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{DecideError, Result};
use crate::event::Event;

/// Appends decisions to a trace file.
pub struct TraceWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl TraceWriter {
    /// Creates (truncating) the trace file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| DecideError::io(&path, e))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    /// Path of the file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_actor(&mut self, actor: usize) -> Result<()> {
        writeln!(self.out, "{}{actor}", Event::NextNode.code())
            .map_err(|e| DecideError::io(&self.path, e))
    }

    pub fn record_bool(&mut self, event: Event, value: bool) -> Result<()> {
        writeln!(self.out, "{}{}", event.code(), u8::from(value))
            .map_err(|e| DecideError::io(&self.path, e))
    }

    pub fn record_random(&mut self, words: &[i32]) -> Result<()> {
        let code = Event::Random.code();
        for word in words {
            write!(self.out, "{code}{word},").map_err(|e| DecideError::io(&self.path, e))?;
        }
        writeln!(self.out).map_err(|e| DecideError::io(&self.path, e))
    }

    /// Flushes buffered decisions to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().map_err(|e| DecideError::io(&self.path, e))
    }
}

/// Reads decisions back from a recorded trace.
pub struct TraceReader {
    input: Vec<u8>,
    pos: usize,
}

impl TraceReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read(path).map_err(|e| DecideError::io(path, e))?;
        Ok(Self { input, pos: 0 })
    }

    pub fn from_bytes(input: impl Into<Vec<u8>>) -> Self {
        Self {
            input: input.into(),
            pos: 0,
        }
    }

    /// True when only whitespace remains.
    pub fn is_exhausted(&mut self) -> bool {
        self.skip_whitespace();
        self.pos >= self.input.len()
    }

    /// Consumes the next token, which must be tagged with `event`, and
    /// returns its value.
    pub fn next_value(&mut self, event: Event) -> Result<i64> {
        let expected = event.code();
        self.skip_whitespace();
        let Some(&tag) = self.input.get(self.pos) else {
            return Err(DecideError::Exhausted { expected });
        };
        let found = char::from(tag);
        if found != expected {
            return Err(DecideError::Divergence { expected, found });
        }
        self.pos += 1;

        let value = self.parse_int()?;

        self.skip_whitespace();
        if self.input.get(self.pos) == Some(&b',') {
            self.pos += 1;
        }
        Ok(value)
    }

    /// Consumes a `0`/`1` token for `event`.
    pub fn next_bool(&mut self, event: Event) -> Result<bool> {
        Ok(self.next_value(event)? == 1)
    }

    fn skip_whitespace(&mut self) {
        while self
            .input
            .get(self.pos)
            .is_some_and(u8::is_ascii_whitespace)
        {
            self.pos += 1;
        }
    }

    fn parse_int(&mut self) -> Result<i64> {
        self.skip_whitespace();
        let start = self.pos;
        if matches!(self.input.get(self.pos), Some(b'-' | b'+')) {
            self.pos += 1;
        }
        while self.input.get(self.pos).is_some_and(u8::is_ascii_digit) {
            self.pos += 1;
        }

        let text = std::str::from_utf8(&self.input[start..self.pos]).map_err(|_| {
            DecideError::MalformedTrace {
                offset: start,
                reason: "non-ascii value".to_string(),
            }
        })?;
        text.parse().map_err(|_| DecideError::MalformedTrace {
            offset: start,
            reason: format!("expected an integer, found {text:?}"),
        })
    }
}
