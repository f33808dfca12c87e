//! Captures through `sigrok-cli` and its `i2c`/`spi` protocol decoders.
//!
//! A recorder launches sigrok with a trigger and a fixed capture length,
//! gives it `start_delay` to arm, and later collects the decoded
//! annotations once the process has exited:
//!
//! ```no_run
//! # use busprobe_core::{SigrokConfig, SigrokI2cRecorder};
//! # use std::time::Duration;
//! # fn main() -> busprobe_core::Result<()> {
//! let mut rec = SigrokI2cRecorder::new(SigrokConfig::from_env()?);
//! rec.record(Duration::from_millis(50))?;
//! // ... let the firmware talk on the bus ...
//! let events = rec.get_result()?;
//! # Ok(()) }
//! ```

use crate::config::SigrokConfig;
use crate::error::{Error, Result};
use busprobe_decode::{Decoded, I2cEvent, I2cLineParser, SpiLineParser, SpiTransaction};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const I2C_ANNOTATIONS: &str = "i2c=address-read:address-write:data-read:data-write:start:repeat-start:ack:nack:stop";
const SPI_TRANSFER_ANNOTATIONS: &str = "spi=mosi-transfer:miso-transfer";
const SPI_WORD_ANNOTATIONS: &str = "spi=mosi-data:miso-data";

fn common_args(cfg: &SigrokConfig) -> Vec<String> {
    let mut args = cfg.command.clone();
    args.extend([
        "--driver".to_string(),
        cfg.driver.clone(),
        "--config".to_string(),
        format!("samplerate={}:captureratio={}", cfg.sample_rate, cfg.capture_ratio),
    ]);
    args
}

/// Whole milliseconds, ties to even.
fn record_millis(record_time: Duration) -> String {
    let micros = record_time.as_micros();
    let (ms, rest) = (micros / 1000, micros % 1000);
    let round_up = rest > 500 || (rest == 500 && ms % 2 == 1);
    (ms + u128::from(round_up)).to_string()
}

/// Full command line for an I2C capture. SCL is D0, SDA is D1; the capture
/// triggers on the first falling SCL edge.
pub fn i2c_args(cfg: &SigrokConfig, record_time: Duration) -> Vec<String> {
    let mut args = common_args(cfg);
    args.extend(
        [
            "--protocol-decoders",
            "i2c:scl=D0:sda=D1:address_format=unshifted",
            "--protocol-decoder-annotations",
            I2C_ANNOTATIONS,
            "--triggers",
            "D0=f",
            "--time",
        ]
        .map(String::from),
    );
    args.push(record_millis(record_time));
    args
}

/// Full command line for an SPI capture in mode 0 with 8-bit words. CLK,
/// MOSI and MISO are D0..D2. With a CS pin the capture triggers on its
/// falling edge and sigrok reports whole transfers; without one it
/// triggers on any clock edge and reports single words.
pub fn spi_args(cfg: &SigrokConfig, cs_pin: Option<&str>, record_time: Duration) -> Vec<String> {
    let mut args = common_args(cfg);
    let cs = cs_pin.map(|pin| format!(":cs={pin}")).unwrap_or_default();
    args.push("--protocol-decoders".to_string());
    args.push(format!("spi:clk=D0:mosi=D1:miso=D2{cs}:cpol=0:cpha=0:wordsize=8"));
    args.push("--time".to_string());
    args.push(record_millis(record_time));
    args.push("--triggers".to_string());
    match cs_pin {
        Some(pin) => {
            args.push(format!("{pin}=f"));
            args.push("--protocol-decoder-annotations".to_string());
            args.push(SPI_TRANSFER_ANNOTATIONS.to_string());
        }
        None => {
            args.push("D0=e".to_string());
            args.push("--protocol-decoder-annotations".to_string());
            args.push(SPI_WORD_ANNOTATIONS.to_string());
        }
    }
    args
}

/// A running `sigrok-cli` process. stdout is drained on a separate thread
/// so a long capture cannot stall on a full pipe.
struct Capture {
    child: Child,
    stdout: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
}

impl Capture {
    fn spawn(args: &[String]) -> Result<Self> {
        let (program, rest) = args.split_first().ok_or(Error::MissingSigrokCommand)?;
        log::debug!("executing: {}", args.join(" "));
        let mut child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(Error::Spawn)?;

        let stdout = child.stdout.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                pipe.read_to_end(&mut buf)?;
                Ok(buf)
            })
        });

        Ok(Self { child, stdout })
    }

    fn finish(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = self.child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = self.child.kill();
                let _ = self.child.wait();
                return Err(Error::Timeout(timeout));
            }
            std::thread::sleep(Duration::from_millis(10));
        };

        if !status.success() {
            return Err(Error::SigrokFailed(status));
        }

        match self.stdout.take() {
            Some(reader) => reader
                .join()
                .map_err(|_| Error::Io(std::io::Error::other("sigrok stdout reader panicked")))?
                .map_err(Error::Io),
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            log::debug!("killing abandoned sigrok capture");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn start(slot: &mut Option<Capture>, args: &[String], cfg: &SigrokConfig) -> Result<()> {
    if slot.is_some() {
        return Err(Error::CaptureInProgress);
    }
    *slot = Some(Capture::spawn(args)?);
    std::thread::sleep(cfg.start_delay());
    Ok(())
}

fn collect(slot: &mut Option<Capture>, cfg: &SigrokConfig) -> Result<String> {
    let mut capture = slot.take().ok_or(Error::NotRecording)?;
    let raw = capture.finish(cfg.exit_timeout())?;
    Ok(cfg.output_encoding.decode(&raw))
}

fn report<T>(decoded: Decoded<T>) -> Vec<T> {
    for warning in &decoded.warnings {
        log::warn!("{warning}");
    }
    decoded.items
}

pub struct SigrokI2cRecorder {
    config: SigrokConfig,
    parser: I2cLineParser,
    capture: Option<Capture>,
}

impl SigrokI2cRecorder {
    pub fn new(config: SigrokConfig) -> Self {
        Self { config, parser: I2cLineParser::default(), capture: None }
    }

    /// Starts capturing; `record_time` counts from the first SCL edge.
    pub fn record(&mut self, record_time: Duration) -> Result<()> {
        let args = i2c_args(&self.config, record_time);
        start(&mut self.capture, &args, &self.config)
    }

    /// Waits for the capture to end and returns the bus events in order.
    pub fn get_result(&mut self) -> Result<Vec<I2cEvent>> {
        let output = collect(&mut self.capture, &self.config)?;
        let events = report(self.parser.decode(&output));
        log::debug!("captured {} I2C events", events.len());
        Ok(events)
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_some()
    }
}

pub struct SigrokSpiRecorder {
    config: SigrokConfig,
    parser: SpiLineParser,
    capture: Option<Capture>,
    with_cs: bool,
}

impl SigrokSpiRecorder {
    pub fn new(config: SigrokConfig) -> Self {
        Self { config, parser: SpiLineParser::default(), capture: None, with_cs: false }
    }

    /// Starts capturing. `cs_pin` is the analyzer channel wired to chip
    /// select (e.g. `"D3"`); `None` records all clocked traffic.
    pub fn record(&mut self, cs_pin: Option<&str>, record_time: Duration) -> Result<()> {
        let args = spi_args(&self.config, cs_pin, record_time);
        start(&mut self.capture, &args, &self.config)?;
        self.with_cs = cs_pin.is_some();
        Ok(())
    }

    /// Waits for the capture to end. Without a CS pin every byte belongs to
    /// a single transaction.
    pub fn get_result(&mut self) -> Result<Vec<SpiTransaction>> {
        let output = collect(&mut self.capture, &self.config)?;
        let decoded = if self.with_cs {
            self.parser.decode_transfers(&output)?
        } else {
            self.parser.decode_words(&output)
        };
        Ok(report(decoded))
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_some()
    }
}
