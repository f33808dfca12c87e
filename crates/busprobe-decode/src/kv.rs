//! mbed host-test key/value framing: `{{key;value}}`.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KvMessage {
    pub key: String,
    pub value: String,
}

impl KvMessage {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }

    /// Wire form sent to the device, newline terminated.
    pub fn encode(&self) -> Vec<u8> {
        format!("{self}\n").into_bytes()
    }
}

impl fmt::Display for KvMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{{{};{}}}}}", self.key, self.value)
    }
}

/// Finds the first well-formed `{{key;value}}` in a console line. Device
/// output often interleaves printf text with KV messages, so anything
/// around the frame is ignored.
pub fn parse_kv(line: &str) -> Option<KvMessage> {
    let mut rest = line;
    while let Some(open) = rest.find("{{") {
        let candidate = &rest[open + 2..];
        if let Some(msg) = parse_frame(candidate) {
            return Some(msg);
        }
        rest = &rest[open + 1..];
    }
    None
}

fn parse_frame(s: &str) -> Option<KvMessage> {
    let semi = s.find(';')?;
    let key = &s[..semi];
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return None;
    }
    let after = &s[semi + 1..];
    let close = after.find('}')?;
    if close == 0 || !after[close..].starts_with("}}") {
        return None;
    }
    Some(KvMessage::new(key, &after[..close]))
}

/// Splits a byte stream into lines. `\r\n` and `\n` both terminate a line.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                let mut line = std::mem::take(&mut self.pending);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                lines.push(line);
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Bytes received since the last newline.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}
