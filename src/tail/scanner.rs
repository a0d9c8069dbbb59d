// SPDX-License-Identifier: Apache-2.0

//! Delimiter scanning over raw read chunks.
//!
//! Two modes:
//! - line-end: the delimiter (`\r?\n` by default) terminates a record.
//! - front-split: a regex marks the *start* of a record; a record runs from
//!   one match up to just before the next. Used for multi-line entries whose
//!   only reliable separator is their own timestamp prefix.
//!
//! Bytes after the last boundary accumulate until the next chunk, an idle
//! flush, or the final drain.

use regex::bytes::Regex;
use std::sync::LazyLock;

pub static LINE_DELIM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\r?\n").unwrap());

pub enum SplitMode {
    /// Delimiter ends a record. Trailing `\r\n` is stripped.
    LineEnd,
    /// The regex marks the beginning of a record.
    FrontSplit(Regex),
}

pub struct LineScanner {
    mode: SplitMode,
    accum: Vec<u8>,
}

impl LineScanner {
    pub fn new(mode: SplitMode) -> Self {
        Self {
            mode,
            accum: Vec::new(),
        }
    }

    /// Feed one chunk of bytes; returns every record completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        match &self.mode {
            SplitMode::LineEnd => self.push_line_end(chunk),
            SplitMode::FrontSplit(_) => self.push_front_split(chunk),
        }
    }

    fn push_line_end(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;

        for m in LINE_DELIM.find_iter(chunk) {
            let mut line = std::mem::take(&mut self.accum);
            line.extend_from_slice(&chunk[start..m.start()]);
            lines.push(String::from_utf8_lossy(&line).into_owned());
            start = m.end();
        }

        self.accum.extend_from_slice(&chunk[start..]);
        lines
    }

    fn push_front_split(&mut self, chunk: &[u8]) -> Vec<String> {
        let delim = match &self.mode {
            SplitMode::FrontSplit(delim) => delim,
            SplitMode::LineEnd => unreachable!(),
        };

        let mut records = Vec::new();
        let mut start = 0;
        let mut first = true;

        for m in delim.find_iter(chunk) {
            if first {
                first = false;
                // Bytes before the first match complete the accumulated
                // record from previous chunks.
                let mut record = std::mem::take(&mut self.accum);
                record.extend_from_slice(&chunk[..m.start()]);
                if !record.is_empty() {
                    records.push(Self::finish_record(&record));
                }
            } else {
                records.push(Self::finish_record(&chunk[start..m.start()]));
            }
            start = m.start();
        }

        self.accum.extend_from_slice(&chunk[start..]);
        records
    }

    /// Multi-line records are emitted with their embedded newlines removed.
    fn finish_record(bytes: &[u8]) -> String {
        let cleaned: Vec<u8> = bytes.iter().copied().filter(|&b| b != b'\n').collect();
        String::from_utf8_lossy(&cleaned).into_owned()
    }

    /// Non-empty accumulator contents, emitted on idle timeout or final
    /// drain (front-split mode).
    pub fn flush(&mut self) -> Option<String> {
        if self.accum.is_empty() {
            return None;
        }
        let record = std::mem::take(&mut self.accum);
        match self.mode {
            SplitMode::LineEnd => Some(String::from_utf8_lossy(&record).into_owned()),
            SplitMode::FrontSplit(_) => Some(Self::finish_record(&record)),
        }
    }

    pub fn pending(&self) -> usize {
        self.accum.len()
    }
}
