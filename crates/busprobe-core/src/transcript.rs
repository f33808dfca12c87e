use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct TranscriptEntry {
    /// Time since the transcript was created.
    at: Duration,
    direction: Direction,
    text: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Direction {
    Rx,
    Tx,
}

/// Bounded record of the traffic exchanged with the DUT, dumped when a
/// host test fails.
pub struct Transcript {
    started: Instant,
    entries: VecDeque<TranscriptEntry>,
    max_entries: usize,
}

pub type SharedTranscript = Arc<Mutex<Transcript>>;

impl Transcript {
    pub fn new(max_entries: usize) -> Self {
        Self {
            started: Instant::now(),
            entries: VecDeque::new(),
            max_entries,
        }
    }

    pub fn shared(max_entries: usize) -> SharedTranscript {
        Arc::new(Mutex::new(Self::new(max_entries)))
    }

    pub fn push(&mut self, direction: Direction, text: impl Into<String>) {
        self.entries.push_back(TranscriptEntry {
            at: self.started.elapsed(),
            direction,
            text: text.into(),
        });

        if self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_text(&self, show_timestamp: bool) -> String {
        let mut result = String::new();
        for entry in &self.entries {
            if show_timestamp {
                let secs = entry.at.as_secs();
                let millis = entry.at.subsec_millis();
                result.push_str(&format!("[{secs:>4}.{millis:03}] "));
            }
            result.push_str(match entry.direction {
                Direction::Rx => "RX: ",
                Direction::Tx => "TX: ",
            });
            result.push_str(entry.text.trim_end());
            result.push('\n');
        }
        result
    }
}
