// MIT License - Copyright (c) 2026 Peter Wright
// Newline framing of the PCK byte stream

use crate::constants::TERMINATOR;
use crate::error::{PckError, Result};

/// Splits socket input into lines and frames outgoing lines.
///
/// Accepts `\n` and `\r\n` terminators. A partial line longer than the
/// configured bound is reported once as a protocol violation and then
/// skipped up to the next terminator.
#[derive(Debug)]
pub struct LineCodec {
    max_line_length: usize,
    buf: Vec<u8>,
    discarding: bool,
}

impl LineCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            buf: Vec::new(),
            discarding: false,
        }
    }

    /// Frame one outgoing line.
    pub fn encode(&self, line: &str) -> Result<Vec<u8>> {
        if line.contains(['\r', '\n']) {
            return Err(PckError::violation(format!(
                "outgoing line contains a terminator: {:?}",
                line
            )));
        }
        if line.len() > self.max_line_length {
            return Err(PckError::violation(format!(
                "outgoing line of {} bytes exceeds limit of {}",
                line.len(),
                self.max_line_length
            )));
        }
        let mut bytes = Vec::with_capacity(line.len() + TERMINATOR.len());
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(TERMINATOR.as_bytes());
        Ok(bytes)
    }

    /// Accept a chunk of socket input and return every line it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<String>> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }
            self.buf.extend_from_slice(head);
            let line = std::mem::take(&mut self.buf);
            out.push(self.decode_line(line));
        }

        if !self.discarding && !rest.is_empty() {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > self.max_line_length + 1 {
                let len = self.buf.len();
                self.buf.clear();
                self.discarding = true;
                out.push(Err(PckError::violation(format!(
                    "incoming line exceeds limit of {} bytes ({} buffered)",
                    self.max_line_length, len
                ))));
            }
        }
        out
    }

    /// Bytes of an incomplete line held for the next `feed`.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn decode_line(&self, mut line: Vec<u8>) -> Result<String> {
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.len() > self.max_line_length {
            return Err(PckError::violation(format!(
                "incoming line of {} bytes exceeds limit of {}",
                line.len(),
                self.max_line_length
            )));
        }
        String::from_utf8(line).map_err(|e| PckError::violation(format!("invalid UTF-8: {}", e)))
    }
}
