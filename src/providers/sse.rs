//! Incremental server-sent-events decoder for observed response streams.
//!
//! Bytes are fed as they pass through to the caller; complete events are
//! returned as parsed JSON payloads. Anything that does not parse is skipped.

use serde_json::Value;

const COMPACT_THRESHOLD: usize = 8192;

#[derive(Debug, Default, Clone)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    pos: usize,
    events_seen: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn find_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
        let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
        let crlf = buf
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|p| (p, 4));
        match (lf, crlf) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
            (a, b) => a.or(b),
        }
    }

    fn extract_data(event_block: &str) -> Option<String> {
        let mut data = String::new();
        for line in event_block.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(rest.trim_start());
            }
        }
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return None;
        }
        Some(data.to_string())
    }

    fn parse_block(block: &[u8]) -> Option<Value> {
        let text = std::str::from_utf8(block).ok()?;
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.starts_with(':') {
            return None;
        }
        let data = Self::extract_data(text)?;
        serde_json::from_str::<Value>(&data)
            .inspect_err(|e| tracing::debug!("skipping unparsable stream event: {}", e))
            .ok()
    }

    /// Feeds raw bytes and returns every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some((rel, delim_len)) = Self::find_delimiter(&self.buffer[self.pos..]) {
            let start = self.pos;
            let end = start + rel;
            if let Some(event) = Self::parse_block(&self.buffer[start..end]) {
                events.push(event);
            }
            self.pos = end + delim_len;
        }

        if self.buffer.len() > COMPACT_THRESHOLD && self.pos > self.buffer.len() / 2 {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }

        self.events_seen += events.len();
        events
    }

    /// Flushes whatever trails the last delimiter.
    pub fn finish(&mut self) -> Vec<Value> {
        let rest = std::mem::take(&mut self.buffer);
        let tail = &rest[self.pos.min(rest.len())..];
        self.pos = 0;

        match Self::parse_block(tail) {
            Some(event) => {
                self.events_seen += 1;
                vec![event]
            }
            None => Vec::new(),
        }
    }

    pub fn events_seen(&self) -> usize {
        self.events_seen
    }
}
