//! Incremental decoder for streams framed as a single JSON array.
//!
//! Gemini's `streamGenerateContent` without `alt=sse` sends
//! `[{...},\r\n{...}]`. Each element is returned as soon as its closing
//! bracket arrives, so a stream cut off mid-array still yields every
//! complete chunk before the cut.

use serde_json::Value;

#[derive(Debug, Default, Clone)]
pub struct JsonArrayDecoder {
    element: Vec<u8>,
    opened: bool,
    depth: usize,
    in_string: bool,
    escaped: bool,
    elements_seen: usize,
}

impl JsonArrayDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every element completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Value> {
        let mut elements = Vec::new();
        for &byte in bytes {
            if !self.opened {
                self.opened = byte == b'[';
                continue;
            }
            if self.depth == 0 {
                // Between elements: separators, whitespace and the closing `]`.
                if matches!(byte, b'{' | b'[') {
                    self.element.clear();
                    self.element.push(byte);
                    self.depth = 1;
                }
                continue;
            }

            self.element.push(byte);
            if self.in_string {
                match byte {
                    _ if self.escaped => self.escaped = false,
                    b'\\' => self.escaped = true,
                    b'"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }
            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        match serde_json::from_slice::<Value>(&self.element) {
                            Ok(value) => elements.push(value),
                            Err(e) => tracing::debug!("skipping unparsable array element: {}", e),
                        }
                        self.element.clear();
                    }
                }
                _ => {}
            }
        }
        self.elements_seen += elements.len();
        elements
    }

    pub fn elements_seen(&self) -> usize {
        self.elements_seen
    }

    /// True while an element has started but not yet closed.
    pub fn has_partial(&self) -> bool {
        self.depth > 0
    }
}
