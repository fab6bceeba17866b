//! Incremental Server-Sent-Events parser.
//!
//! Line-oriented, fed raw byte slices as they arrive from the network.
//! Rules: lines starting with `:` are comments; `data` appends to the
//! event's data buffer with exactly one leading space stripped; `event`
//! and `id` overwrite the same-named metadata slot; other keys are
//! logged and skipped; a blank line dispatches the accumulated event.

use std::collections::HashMap;
use tracing::debug;

/// One dispatched SSE event: the concatenated `data` payload plus the
/// collected metadata fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub data: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

/// Accumulates lines into events across arbitrarily-split byte chunks.
#[derive(Debug, Default)]
pub struct SseParser {
    line_buf: Vec<u8>,
    data_buf: Vec<u8>,
    metadata: HashMap<String, String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            if byte != b'\n' {
                self.line_buf.push(byte);
                continue;
            }
            if self.line_buf.last() == Some(&b'\r') {
                self.line_buf.pop();
            }
            let line = std::mem::take(&mut self.line_buf);
            if let Some(event) = self.push_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn push_line(&mut self, line: &[u8]) -> Option<SseEvent> {
        if line.is_empty() {
            return Some(self.dispatch());
        }
        if line[0] == b':' {
            // comment line
            return None;
        }

        let colon = line.iter().position(|&b| b == b':');
        let (key, value) = match colon {
            Some(idx) => (&line[..idx], &line[idx + 1..]),
            None => (line, &[][..]),
        };

        match key {
            b"data" => {
                let value = value.strip_prefix(b" ").unwrap_or(value);
                self.data_buf.extend_from_slice(value);
            }
            b"event" | b"id" => {
                let key = String::from_utf8_lossy(key).into_owned();
                let value = String::from_utf8_lossy(value)
                    .trim_start_matches(' ')
                    .to_string();
                self.metadata.insert(key, value);
            }
            other => {
                debug!(
                    key = %String::from_utf8_lossy(other),
                    "skipping sse line with unknown field"
                );
            }
        }
        None
    }

    /// Emit the accumulated (possibly empty) event and reset the buffers.
    fn dispatch(&mut self) -> SseEvent {
        SseEvent {
            data: std::mem::take(&mut self.data_buf),
            metadata: std::mem::take(&mut self.metadata),
        }
    }
}
