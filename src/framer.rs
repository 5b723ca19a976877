//! Incremental line reassembly for the SMTP byte stream

use std::collections::VecDeque;

/// Collects raw bytes and hands them back as `\n`-terminated lines.
///
/// Carriage returns are dropped as bytes arrive, so a line never contains
/// `\r`. Bytes after the last `\n` stay buffered until more data comes in.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
    lines: VecDeque<Vec<u8>>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        for &b in chunk {
            match b {
                b'\r' => {}
                b'\n' => self.lines.push_back(std::mem::take(&mut self.pending)),
                _ => self.pending.push(b),
            }
        }
    }

    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        self.lines.pop_front()
    }

    /// Number of bytes received that do not yet form a complete line
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn has_line(&self) -> bool {
        !self.lines.is_empty()
    }
}

/// A read that fills the whole receive buffer and starts with NUL is taken as
/// a broken client flooding zeros rather than as data.
pub fn is_nul_flood(chunk: &[u8], capacity: usize) -> bool {
    chunk.len() == capacity && chunk.first() == Some(&0)
}

pub fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}

pub fn decode_utf8(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

pub fn encode_ascii(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}
