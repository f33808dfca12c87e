//! SPI transactions as annotated by sigrok's `spi` protocol decoder.

use crate::{hex_byte, Decoded, DecodeWarning, LineOutcome};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("MOSI and MISO bytes are not the same length ({mosi} vs {miso})")]
pub struct LengthMismatch {
    pub mosi: usize,
    pub miso: usize,
}

/// Bytes exchanged while the bus was selected. MOSI and MISO always have
/// the same length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SpiTransaction {
    mosi: Vec<u8>,
    miso: Vec<u8>,
}

impl SpiTransaction {
    pub fn new(mosi: impl Into<Vec<u8>>, miso: impl Into<Vec<u8>>) -> Result<Self, LengthMismatch> {
        let (mosi, miso) = (mosi.into(), miso.into());
        if mosi.len() != miso.len() {
            return Err(LengthMismatch { mosi: mosi.len(), miso: miso.len() });
        }
        Ok(Self { mosi, miso })
    }

    pub fn mosi(&self) -> &[u8] {
        &self.mosi
    }

    pub fn miso(&self) -> &[u8] {
        &self.miso
    }

    pub fn len(&self) -> usize {
        self.mosi.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mosi.is_empty()
    }
}

impl fmt::Display for SpiTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[mosi: {}, miso: {}]", hex::encode(&self.mosi), hex::encode(&self.miso))
    }
}

/// Classifies lines of one `spi` decoder instance into byte lists.
///
/// `sigrok-cli` prints the MISO annotation before the MOSI one for every
/// word or transfer, so callers pair consecutive lines.
#[derive(Debug, Clone)]
pub struct SpiLineParser {
    instance: String,
}

impl Default for SpiLineParser {
    fn default() -> Self {
        Self::new("spi-1")
    }
}

impl SpiLineParser {
    pub fn new(instance: impl Into<String>) -> Self {
        Self { instance: instance.into() }
    }

    /// `spi-1: 01 02 0A` → `[0x01, 0x02, 0x0A]`. Only uppercase hex is
    /// accepted, which is what the decoder emits.
    pub fn parse_line(&self, line: &str) -> LineOutcome<Vec<u8>> {
        if line.is_empty() {
            return LineOutcome::Ignored;
        }
        let Some(body) = line
            .strip_prefix(self.instance.as_str())
            .and_then(|rest| rest.strip_prefix(": "))
        else {
            return LineOutcome::Unparsed;
        };
        if body.bytes().any(|b| b.is_ascii_lowercase()) {
            return LineOutcome::Unparsed;
        }
        let bytes: Option<Vec<u8>> = body.split(' ').map(hex_byte).collect();
        match bytes {
            Some(bytes) if !bytes.is_empty() => LineOutcome::Item(bytes),
            _ => LineOutcome::Unparsed,
        }
    }

    /// Output captured with a chip-select channel: one MISO line then one
    /// MOSI line per transfer.
    pub fn decode_transfers(&self, output: &str) -> Result<Decoded<SpiTransaction>, LengthMismatch> {
        let mut decoded = Decoded::default();
        let mut miso_line: Option<Vec<u8>> = None;
        for bytes in self.byte_lines(output, &mut decoded.warnings) {
            match miso_line.take() {
                None => miso_line = Some(bytes),
                Some(miso) => decoded.items.push(SpiTransaction::new(bytes, miso)?),
            }
        }
        if let Some(leftover) = miso_line {
            decoded.warnings.push(DecodeWarning::Unpaired(leftover));
        }
        Ok(decoded)
    }

    /// Output captured without chip select: one byte per line, MISO and
    /// MOSI alternating. Without CS there are no transaction boundaries, so
    /// everything lands in a single transaction.
    pub fn decode_words(&self, output: &str) -> Decoded<SpiTransaction> {
        let mut decoded = Decoded::default();
        let mut mosi = Vec::new();
        let mut miso = Vec::new();
        let mut next_is_miso = true;
        let lines: Vec<Vec<u8>> = self.byte_lines(output, &mut decoded.warnings).collect();
        for bytes in lines {
            let [byte] = bytes[..] else {
                decoded.warnings.push(DecodeWarning::Unparsed(format!(
                    "{}: {}",
                    self.instance,
                    hex::encode_upper(&bytes)
                )));
                continue;
            };
            if next_is_miso {
                miso.push(byte);
            } else {
                mosi.push(byte);
            }
            next_is_miso = !next_is_miso;
        }
        if miso.len() > mosi.len() {
            let leftover = miso.split_off(mosi.len());
            decoded.warnings.push(DecodeWarning::Unpaired(leftover));
        }
        decoded.items.push(SpiTransaction { mosi, miso });
        decoded
    }

    fn byte_lines<'a>(
        &'a self,
        output: &'a str,
        warnings: &'a mut Vec<DecodeWarning>,
    ) -> impl Iterator<Item = Vec<u8>> + 'a {
        output.lines().filter_map(move |line| match self.parse_line(line) {
            LineOutcome::Item(bytes) => Some(bytes),
            LineOutcome::Ignored => None,
            LineOutcome::Unparsed => {
                warnings.push(DecodeWarning::Unparsed(line.to_string()));
                None
            }
        })
    }
}

/// Decodes output of the default `spi-1` instance; `with_cs` selects
/// between transfer and per-word annotations.
pub fn decode_spi(output: &str, with_cs: bool) -> Result<Decoded<SpiTransaction>, LengthMismatch> {
    let parser = SpiLineParser::default();
    if with_cs {
        parser.decode_transfers(output)
    } else {
        Ok(parser.decode_words(output))
    }
}
