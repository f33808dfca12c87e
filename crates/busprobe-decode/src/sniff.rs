//! Bus Pirate SPI sniffer stream.
//!
//! In sniff mode the Bus Pirate reports `[` when CS goes active, `]` when
//! it is released, and `\` followed by the MOSI and MISO bytes of every
//! word clocked on the bus.

const SELECT: u8 = b'[';
const DESELECT: u8 = b']';
const ESCAPE: u8 = b'\\';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffEvent {
    Select,
    Deselect,
    Data { mosi: u8, miso: u8 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum State {
    #[default]
    Idle,
    Mosi,
    Miso(u8),
}

/// Incremental parser; a data escape split across reads is completed by
/// the next `feed`.
#[derive(Debug, Default)]
pub struct SniffParser {
    state: State,
    discarded: usize,
}

impl SniffParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SniffEvent> {
        let mut events = Vec::new();
        for &b in bytes {
            self.state = match self.state {
                State::Idle => match b {
                    SELECT => {
                        events.push(SniffEvent::Select);
                        State::Idle
                    }
                    DESELECT => {
                        events.push(SniffEvent::Deselect);
                        State::Idle
                    }
                    ESCAPE => State::Mosi,
                    _ => {
                        self.discarded += 1;
                        State::Idle
                    }
                },
                State::Mosi => State::Miso(b),
                State::Miso(mosi) => {
                    events.push(SniffEvent::Data { mosi, miso: b });
                    State::Idle
                }
            };
        }
        events
    }

    /// True while half of a data escape is still outstanding.
    pub fn is_mid_word(&self) -> bool {
        self.state != State::Idle
    }

    /// Number of stray bytes ignored so far.
    pub fn discarded(&self) -> usize {
        self.discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_framed_message() {
        let mut p = SniffParser::new();
        let events = p.feed(b"[\\\x01\xff\\\x02\xfe]");
        assert_eq!(
            events,
            vec![
                SniffEvent::Select,
                SniffEvent::Data { mosi: 0x01, miso: 0xff },
                SniffEvent::Data { mosi: 0x02, miso: 0xfe },
                SniffEvent::Deselect,
            ]
        );
        assert!(!p.is_mid_word());
    }

    #[test]
    fn data_bytes_may_look_like_markers() {
        let mut p = SniffParser::new();
        let events = p.feed(b"\\[]\\\\\\");
        assert_eq!(
            events,
            vec![
                SniffEvent::Data { mosi: b'[', miso: b']' },
                SniffEvent::Data { mosi: b'\\', miso: b'\\' },
            ]
        );
    }

    #[test]
    fn escape_split_across_reads() {
        let mut p = SniffParser::new();
        assert!(p.feed(b"\\\x08").is_empty());
        assert!(p.is_mid_word());
        assert_eq!(p.feed(b"\x00"), vec![SniffEvent::Data { mosi: 0x08, miso: 0x00 }]);
    }

    #[test]
    fn counts_stray_bytes() {
        let mut p = SniffParser::new();
        assert!(p.feed(b"\x01\x01").is_empty());
        assert_eq!(p.discarded(), 2);
    }
}
