//! I2C events as annotated by sigrok's `i2c` protocol decoder.

use crate::{hex_byte, Decoded, DecodeWarning, LineOutcome};
use serde::Serialize;
use std::fmt;

/// One condition observed on an I2C bus.
///
/// Addresses are in the 8-bit form (`address_format=unshifted`), i.e. with
/// the R/W bit included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum I2cEvent {
    Start,
    RepeatedStart,
    WriteToAddr(u8),
    ReadFromAddr(u8),
    DataByte(u8),
    Ack,
    Nack,
    Stop,
}

impl fmt::Display for I2cEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("Start"),
            Self::RepeatedStart => f.write_str("RepeatedStart"),
            Self::WriteToAddr(addr) => write!(f, "Wr[0x{addr:02x}]"),
            Self::ReadFromAddr(addr) => write!(f, "Rd[0x{addr:02x}]"),
            Self::DataByte(data) => write!(f, "0x{data:02x}"),
            Self::Ack => f.write_str("Ack"),
            Self::Nack => f.write_str("Nack"),
            Self::Stop => f.write_str("Stop"),
        }
    }
}

/// Renders a sequence of events on one line, for assertion messages.
pub fn format_events(events: &[I2cEvent]) -> String {
    events.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(" ")
}

/// Classifies lines printed by `sigrok-cli` for one `i2c` decoder instance.
#[derive(Debug, Clone)]
pub struct I2cLineParser {
    instance: String,
}

impl Default for I2cLineParser {
    fn default() -> Self {
        Self::new("i2c-1")
    }
}

impl I2cLineParser {
    pub fn new(instance: impl Into<String>) -> Self {
        Self { instance: instance.into() }
    }

    pub fn parse_line(&self, line: &str) -> LineOutcome<I2cEvent> {
        if line.is_empty() {
            return LineOutcome::Ignored;
        }
        let Some(body) = line
            .strip_prefix(self.instance.as_str())
            .and_then(|rest| rest.strip_prefix(": "))
        else {
            return LineOutcome::Unparsed;
        };

        // "Start repeat" has to win over its own prefix "Start".
        let event = if body.starts_with("Start repeat") {
            Some(I2cEvent::RepeatedStart)
        } else if body.starts_with("Start") {
            Some(I2cEvent::Start)
        } else if let Some(rest) = body.strip_prefix("Address write: ") {
            leading_byte(rest).map(I2cEvent::WriteToAddr)
        } else if let Some(rest) = body.strip_prefix("Address read: ") {
            leading_byte(rest).map(I2cEvent::ReadFromAddr)
        } else if let Some(rest) = body.strip_prefix("Data ") {
            data_value(rest).map(I2cEvent::DataByte)
        } else if body.starts_with("ACK") {
            Some(I2cEvent::Ack)
        } else if body.starts_with("NACK") {
            Some(I2cEvent::Nack)
        } else if body.starts_with("Stop") {
            Some(I2cEvent::Stop)
        } else if body == "Read" || body == "Write" {
            return LineOutcome::Ignored;
        } else {
            None
        };

        match event {
            Some(event) => LineOutcome::Item(event),
            None => LineOutcome::Unparsed,
        }
    }

    /// Parses a complete capture, keeping event order.
    pub fn decode(&self, output: &str) -> Decoded<I2cEvent> {
        let mut decoded = Decoded::default();
        for line in output.lines() {
            match self.parse_line(line) {
                LineOutcome::Item(event) => decoded.items.push(event),
                LineOutcome::Ignored => {}
                LineOutcome::Unparsed => decoded.warnings.push(DecodeWarning::Unparsed(line.to_string())),
            }
        }
        decoded
    }
}

/// Decodes output of the default `i2c-1` decoder instance.
pub fn decode_i2c(output: &str) -> Decoded<I2cEvent> {
    I2cLineParser::default().decode(output)
}

fn leading_byte(s: &str) -> Option<u8> {
    s.get(..2).and_then(hex_byte)
}

// `read: HH` or `write: HH`; the direction word holds no spaces.
fn data_value(s: &str) -> Option<u8> {
    let space = s.find(' ')?;
    let word = &s[..space];
    if word.len() < 2 || !word.ends_with(':') {
        return None;
    }
    leading_byte(&s[space + 1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_register_read() {
        let output = "\
i2c-1: Start
i2c-1: Write
i2c-1: Address write: A0
i2c-1: ACK
i2c-1: Data write: 10
i2c-1: ACK
i2c-1: Start repeat
i2c-1: Read
i2c-1: Address read: A1
i2c-1: ACK
i2c-1: Data read: 5A
i2c-1: NACK
i2c-1: Stop
";
        let decoded = decode_i2c(output);
        assert!(decoded.warnings.is_empty());
        assert_eq!(
            decoded.items,
            vec![
                I2cEvent::Start,
                I2cEvent::WriteToAddr(0xA0),
                I2cEvent::Ack,
                I2cEvent::DataByte(0x10),
                I2cEvent::Ack,
                I2cEvent::RepeatedStart,
                I2cEvent::ReadFromAddr(0xA1),
                I2cEvent::Ack,
                I2cEvent::DataByte(0x5A),
                I2cEvent::Nack,
                I2cEvent::Stop,
            ]
        );
    }

    #[test]
    fn repeated_start_is_not_a_start() {
        let parser = I2cLineParser::default();
        assert_eq!(parser.parse_line("i2c-1: Start repeat"), LineOutcome::Item(I2cEvent::RepeatedStart));
        assert_eq!(parser.parse_line("i2c-1: Start"), LineOutcome::Item(I2cEvent::Start));
    }

    #[test]
    fn unknown_lines_become_warnings() {
        let decoded = decode_i2c("i2c-1: Stop\nsr: device only sent 12 samples\n\ni2c-1: Address write: zz\n");
        assert_eq!(decoded.items, vec![I2cEvent::Stop]);
        assert_eq!(
            decoded.warnings,
            vec![
                DecodeWarning::Unparsed("sr: device only sent 12 samples".into()),
                DecodeWarning::Unparsed("i2c-1: Address write: zz".into()),
            ]
        );
    }

    #[test]
    fn data_needs_a_direction_word() {
        let parser = I2cLineParser::default();
        assert_eq!(parser.parse_line("i2c-1: Data read: 7f"), LineOutcome::Item(I2cEvent::DataByte(0x7F)));
        assert_eq!(parser.parse_line("i2c-1: Data : 7f"), LineOutcome::Unparsed);
        assert_eq!(parser.parse_line("i2c-1: Data write 7f"), LineOutcome::Unparsed);
    }

    #[test]
    fn other_instances_are_configurable() {
        let parser = I2cLineParser::new("i2c-2");
        assert_eq!(parser.parse_line("i2c-2: ACK"), LineOutcome::Item(I2cEvent::Ack));
        assert_eq!(parser.parse_line("i2c-1: ACK"), LineOutcome::Unparsed);
    }

    #[test]
    fn display_matches_harness_notation() {
        let events = [
            I2cEvent::Start,
            I2cEvent::WriteToAddr(0x90),
            I2cEvent::DataByte(0x0a),
            I2cEvent::ReadFromAddr(0x91),
            I2cEvent::RepeatedStart,
            I2cEvent::Nack,
            I2cEvent::Stop,
        ];
        assert_eq!(format_events(&events), "Start Wr[0x90] 0x0a Rd[0x91] RepeatedStart Nack Stop");
    }
}
