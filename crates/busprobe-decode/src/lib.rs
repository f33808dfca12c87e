//! Parsers for bus capture output: sigrok text annotations, Bus Pirate
//! sniffer bytes and mbed host-test key/value lines.

pub mod i2c;
pub mod kv;
pub mod sniff;
pub mod spi;

pub use i2c::{decode_i2c, format_events, I2cEvent, I2cLineParser};
pub use kv::{parse_kv, KvMessage, LineAssembler};
pub use sniff::{SniffEvent, SniffParser};
pub use spi::{decode_spi, LengthMismatch, SpiLineParser, SpiTransaction};

use serde::Serialize;

/// Result of classifying a single line of decoder output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome<T> {
    Item(T),
    /// Known line carrying nothing we keep (e.g. `i2c-1: Read`, blank lines).
    Ignored,
    Unparsed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DecodeWarning {
    /// A line that matched none of the known annotation forms.
    Unparsed(String),
    /// Bytes left over with no partner line/byte at the end of the output.
    Unpaired(Vec<u8>),
}

impl std::fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unparsed(line) => write!(f, "unparsed sigrok output: '{line}'"),
            Self::Unpaired(bytes) => write!(f, "dropping unpaired sigrok data: {}", hex::encode(bytes)),
        }
    }
}

/// Items decoded from one capture plus everything that had to be skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decoded<T> {
    pub items: Vec<T>,
    pub warnings: Vec<DecodeWarning>,
}

impl<T> Default for Decoded<T> {
    fn default() -> Self {
        Self { items: Vec::new(), warnings: Vec::new() }
    }
}

/// Parses `HH` as one byte of hex. sigrok prints exactly two digits.
pub(crate) fn hex_byte(s: &str) -> Option<u8> {
    if s.len() != 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u8::from_str_radix(s, 16).ok()
}
