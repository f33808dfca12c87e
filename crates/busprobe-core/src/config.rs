//! Settings for the logic analyzer, the Bus Pirate and the DUT link.
//!
//! Every field has a default so a partial JSON file is enough.

use crate::encoding::TextEncoding;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Sample rate in Hz, rendered the way `sigrok-cli --config` expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SampleRate(pub u64);

impl SampleRate {
    pub const fn mhz(n: u64) -> Self {
        Self(n * 1_000_000)
    }

    pub const fn khz(n: u64) -> Self {
        Self(n * 1_000)
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            hz if hz != 0 && hz % 1_000_000 == 0 => write!(f, "{} MHz", hz / 1_000_000),
            hz if hz != 0 && hz % 1_000 == 0 => write!(f, "{} kHz", hz / 1_000),
            hz => write!(f, "{hz} Hz"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sigrok: SigrokConfig,
    pub probe: ProbeConfig,
    pub dut: DutConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SigrokConfig {
    /// Program and leading arguments, e.g. `["sigrok-cli"]`.
    pub command: Vec<String>,
    pub driver: String,
    pub sample_rate: SampleRate,
    /// Percentage of samples kept from before the trigger.
    pub capture_ratio: u8,
    /// sigrok prints nothing when it is ready to capture, so wait this long
    /// after launching before letting the test drive the bus.
    pub start_delay_ms: u64,
    pub exit_timeout_ms: u64,
    pub output_encoding: TextEncoding,
}

impl Default for SigrokConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            driver: "fx2lafw".to_string(),
            // Faster rates make the fx2lafw analyzer drop samples.
            sample_rate: SampleRate::mhz(4),
            capture_ratio: 5,
            start_delay_ms: 500,
            exit_timeout_ms: 5_000,
            output_encoding: TextEncoding::Auto,
        }
    }
}

impl SigrokConfig {
    pub const COMMAND_ENV: &'static str = "MBED_SIGROK_COMMAND";

    pub fn from_env() -> Result<Self> {
        Self::default().apply_env()
    }

    /// Takes the base command from `MBED_SIGROK_COMMAND` when it is set.
    /// A config without any command is an error.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(cmd) = std::env::var(Self::COMMAND_ENV) {
            self.command = split_command(&cmd)?;
        }
        if self.command.is_empty() {
            return Err(Error::MissingSigrokCommand);
        }
        Ok(self)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }
}

/// Splits a command line the way a POSIX shell would.
pub fn split_command(cmd: &str) -> Result<Vec<String>> {
    shlex::split(cmd).ok_or_else(|| Error::InvalidSigrokCommand(cmd.to_string()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub port: Option<String>,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { port: None, baud_rate: 115_200, read_timeout_ms: 100 }
    }
}

impl ProbeConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DutConfig {
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Overall limit until the DUT announces its own `__timeout`.
    pub timeout_s: u64,
    pub console_encoding: TextEncoding,
}

impl Default for DutConfig {
    fn default() -> Self {
        Self { port: None, baud_rate: 115_200, timeout_s: 60, console_encoding: TextEncoding::Auto }
    }
}
