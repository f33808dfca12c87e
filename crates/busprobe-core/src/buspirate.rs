//! Bus Pirate v3 binary protocol, SPI sniffing subset.
//!
//! The device is modelled as a chain of modes, each a separate type that
//! consumes the previous one:
//!
//! ```no_run
//! # use busprobe_core::buspirate::{self, SniffFilter, SpiConfig};
//! # fn main() -> Result<(), busprobe_core::ProbeError> {
//! let bp = buspirate::open("/dev/ttyUSB0", &Default::default())?;
//! let mut spi = bp.to_bitbang()?.to_spi()?;
//! spi.configure(&SpiConfig::default())?;
//! let mut sniffer = spi.sniff(SniffFilter::All)?;
//! while let Some((mosi, miso)) = sniffer.sniff_message()? {
//!     println!("{mosi:02x?} / {miso:02x?}");
//! }
//! sniffer.disconnect()?;
//! # Ok(()) }
//! ```

use crate::config::ProbeConfig;
use busprobe_decode::{SniffEvent, SniffParser};
use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{self, Read, Write};

const PROTO_VERSION_MSG: &[u8; 5] = b"BBIO1";
const PROTO_SPI_VERSION_MSG: &[u8; 4] = b"SPI1";

const CMD_RESET_BITBANG: u8 = 0b0000_0000;
const CMD_ENTER_SPI: u8 = 0b0000_0001;
const CMD_RESET_TERMINAL: u8 = 0b0000_1111;
const CMD_SNIFF_ALL: u8 = 0b0000_1101;
const CMD_SNIFF_CS_LOW: u8 = 0b0000_1110;
const CMD_SNIFF_CS_HIGH: u8 = 0b0000_1111;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The device answered something other than what the protocol requires.
    #[error("unexpected response from the Bus Pirate while {0}")]
    Protocol(&'static str),

    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A byte channel to the device. Reads must time out (`TimedOut` or
/// `WouldBlock`) rather than block forever when nothing is pending.
pub trait ProbePort: Read + Write {
    fn bytes_waiting(&self) -> io::Result<u32>;
}

impl ProbePort for Box<dyn SerialPort> {
    fn bytes_waiting(&self) -> io::Result<u32> {
        self.bytes_to_read().map_err(io::Error::from)
    }
}

/// Opens the serial port of a Bus Pirate in terminal mode.
pub fn open(port: &str, cfg: &ProbeConfig) -> Result<BusPirate<Box<dyn SerialPort>>, ProbeError> {
    log::debug!("opening bus pirate on {port} @ {} baud", cfg.baud_rate);
    let port = serialport::new(port, cfg.baud_rate)
        .timeout(cfg.read_timeout())
        .open()?;
    Ok(BusPirate::new(port))
}

struct Channel<P> {
    port: P,
}

impl<P: ProbePort> Channel<P> {
    /// `None` when the read timed out.
    fn read(&mut self) -> Result<Option<u8>, ProbeError> {
        let mut b = [0u8; 1];
        match self.read_some(&mut b)? {
            0 => Ok(None),
            _ => Ok(Some(b[0])),
        }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, ProbeError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ProbeError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn simple_command(&mut self, cmd: u8, what: &'static str) -> Result<(), ProbeError> {
        self.write(&[cmd])?;
        match self.read()? {
            Some(0x01) => Ok(()),
            _ => Err(ProbeError::Protocol(what)),
        }
    }

    fn eat_rx_buffer(&mut self) -> Result<(), ProbeError> {
        let mut buf = [0u8; 64];
        while self.read_some(&mut buf)? > 0 {}
        Ok(())
    }

    /// Sends `send` until `expect` shows up in the reply stream.
    fn handshake(&mut self, send: u8, expect: &[u8], tries: usize, what: &'static str) -> Result<(), ProbeError> {
        'tries: for _ in 0..tries {
            self.write(&[send])?;
            let mut correct = 0;
            loop {
                let Some(c) = self.read()? else {
                    continue 'tries;
                };
                if c != expect[correct] {
                    correct = 0;
                }
                if c == expect[correct] {
                    correct += 1;
                    if correct == expect.len() {
                        self.eat_rx_buffer()?;
                        return Ok(());
                    }
                }
            }
        }
        Err(ProbeError::Protocol(what))
    }
}

/// A Bus Pirate in its interactive terminal mode.
pub struct BusPirate<P> {
    ch: Channel<P>,
}

impl<P: ProbePort> BusPirate<P> {
    pub fn new(port: P) -> Self {
        Self { ch: Channel { port } }
    }

    /// Escapes whatever menu the device is in, resets it and enters binary
    /// bit-bang mode.
    pub fn to_bitbang(mut self) -> Result<BitBang<P>, ProbeError> {
        self.ch.write(&[b'\n'; 10])?;
        self.ch.write(b"#\n")?;
        self.ch.eat_rx_buffer()?;
        self.ch.handshake(CMD_RESET_BITBANG, PROTO_VERSION_MSG, 20, "entering binary mode")?;
        log::debug!("bus pirate in binary bit-bang mode");
        Ok(BitBang { ch: self.ch })
    }

    pub fn release(self) -> P {
        self.ch.port
    }
}

/// Binary bit-bang mode, the gateway to the protocol modes.
pub struct BitBang<P> {
    ch: Channel<P>,
}

impl<P: ProbePort> BitBang<P> {
    pub fn to_spi(mut self) -> Result<Spi<P>, ProbeError> {
        self.ch.handshake(CMD_ENTER_SPI, PROTO_SPI_VERSION_MSG, 10, "entering SPI mode")?;
        log::debug!("bus pirate in SPI mode");
        Ok(Spi { ch: self.ch })
    }

    /// Resets the device back to terminal mode.
    pub fn close(mut self) -> Result<BusPirate<P>, ProbeError> {
        self.ch.write(&[CMD_RESET_TERMINAL])?;
        self.ch.eat_rx_buffer()?;
        Ok(BusPirate { ch: self.ch })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinOutput {
    /// Open drain: lines float (HiZ) unless pulled.
    #[default]
    OpenDrain,
    PushPull3V3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockIdle {
    #[default]
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockEdge {
    IdleToActive,
    #[default]
    ActiveToIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleTime {
    #[default]
    Middle,
    End,
}

/// Peripheral settings for SPI mode. The default matches SPI mode 0 on a
/// bus the Bus Pirate only listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpiConfig {
    pub pin_output: PinOutput,
    pub clock_idle: ClockIdle,
    pub clock_edge: ClockEdge,
    pub sample_time: SampleTime,
}

impl SpiConfig {
    /// `0b1000wxyz`
    pub fn command_byte(&self) -> u8 {
        let mut cmd = 0b1000_0000u8;
        if self.pin_output == PinOutput::PushPull3V3 {
            cmd |= 1 << 3;
        }
        if self.clock_idle == ClockIdle::High {
            cmd |= 1 << 2;
        }
        if self.clock_edge == ClockEdge::ActiveToIdle {
            cmd |= 1 << 1;
        }
        if self.sample_time == SampleTime::End {
            cmd |= 1;
        }
        cmd
    }
}

/// Which traffic the sniffer reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffFilter {
    All,
    CsLow,
    CsHigh,
}

impl SniffFilter {
    fn command_byte(self) -> u8 {
        match self {
            Self::All => CMD_SNIFF_ALL,
            Self::CsLow => CMD_SNIFF_CS_LOW,
            Self::CsHigh => CMD_SNIFF_CS_HIGH,
        }
    }
}

pub struct Spi<P> {
    ch: Channel<P>,
}

impl<P: ProbePort> Spi<P> {
    pub fn configure(&mut self, cfg: &SpiConfig) -> Result<(), ProbeError> {
        log::debug!("spi config byte {:#010b}", cfg.command_byte());
        self.ch.simple_command(cfg.command_byte(), "configuring SPI")
    }

    pub fn sniff(mut self, filter: SniffFilter) -> Result<Sniffer<P>, ProbeError> {
        self.ch.simple_command(filter.command_byte(), "starting the sniffer")?;
        log::debug!("bus pirate sniffing ({filter:?})");
        Ok(Sniffer { ch: self.ch, parser: SniffParser::new(), queue: VecDeque::new() })
    }

    pub fn to_bitbang(mut self) -> Result<BitBang<P>, ProbeError> {
        self.ch.handshake(CMD_RESET_BITBANG, PROTO_VERSION_MSG, 10, "leaving SPI mode")?;
        Ok(BitBang { ch: self.ch })
    }
}

/// SPI mode with the sniffer running.
pub struct Sniffer<P> {
    ch: Channel<P>,
    parser: SniffParser,
    queue: VecDeque<SniffEvent>,
}

impl<P: ProbePort> Sniffer<P> {
    /// Returns the MOSI and MISO bytes of the next message: everything up
    /// to a CS release, or all data received so far. `None` when the
    /// device has nothing to report.
    pub fn sniff_message(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, ProbeError> {
        let mut mosi = Vec::new();
        let mut miso = Vec::new();
        loop {
            while let Some(event) = self.queue.pop_front() {
                match event {
                    SniffEvent::Data { mosi: m, miso: s } => {
                        mosi.push(m);
                        miso.push(s);
                    }
                    SniffEvent::Deselect if !mosi.is_empty() => return Ok(Some((mosi, miso))),
                    SniffEvent::Select | SniffEvent::Deselect => {}
                }
            }
            if !self.fill()? {
                break;
            }
        }
        Ok((!mosi.is_empty()).then_some((mosi, miso)))
    }

    /// Drops everything sniffed so far.
    pub fn discard_pending(&mut self) -> Result<(), ProbeError> {
        while self.ch.port.bytes_waiting()? > 0 {
            self.sniff_message()?;
        }
        self.queue.clear();
        Ok(())
    }

    /// Stops sniffing; any byte ends sniff mode.
    pub fn stop(mut self) -> Result<Spi<P>, ProbeError> {
        self.ch.write(&[CMD_RESET_BITBANG])?;
        self.ch.eat_rx_buffer()?;
        if self.parser.is_mid_word() {
            log::debug!("sniffer stopped in the middle of a data word");
        }
        if self.parser.discarded() > 0 {
            log::debug!("sniffer skipped {} stray bytes", self.parser.discarded());
        }
        Ok(Spi { ch: self.ch })
    }

    /// Stops sniffing and returns the device to terminal mode.
    pub fn disconnect(self) -> Result<P, ProbeError> {
        Ok(self.stop()?.to_bitbang()?.close()?.release())
    }

    fn fill(&mut self) -> Result<bool, ProbeError> {
        let mut buf = [0u8; 256];
        let n = self.ch.read_some(&mut buf)?;
        self.queue.extend(self.parser.feed(&buf[..n]));
        Ok(n > 0)
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{FakeBusPirate, Mode};
    use super::*;

    fn sniffing(fake: &FakeBusPirate) -> Sniffer<FakeBusPirate> {
        let mut spi = BusPirate::new(fake.clone()).to_bitbang().unwrap().to_spi().unwrap();
        spi.configure(&SpiConfig::default()).unwrap();
        spi.sniff(SniffFilter::All).unwrap()
    }

    #[test]
    fn config_byte_layout() {
        assert_eq!(SpiConfig::default().command_byte(), 0b1000_0010);
        let cfg = SpiConfig {
            pin_output: PinOutput::PushPull3V3,
            clock_idle: ClockIdle::High,
            clock_edge: ClockEdge::IdleToActive,
            sample_time: SampleTime::End,
        };
        assert_eq!(cfg.command_byte(), 0b1000_1101);
    }

    #[test]
    fn walks_into_sniff_mode() {
        let fake = FakeBusPirate::new();
        let _sniffer = sniffing(&fake);
        assert_eq!(fake.mode(), Mode::Sniff);
        assert_eq!(fake.0.lock().spi_config, Some(0b1000_0010));
    }

    #[test]
    fn messages_split_on_cs_release() {
        let fake = FakeBusPirate::new();
        let mut sniffer = sniffing(&fake);
        fake.bus_traffic(b"[\\\x01\x00\\\x02\x00][\\\x04\xaa]");
        assert_eq!(sniffer.sniff_message().unwrap(), Some((vec![1, 2], vec![0, 0])));
        assert_eq!(sniffer.sniff_message().unwrap(), Some((vec![4], vec![0xaa])));
        assert_eq!(sniffer.sniff_message().unwrap(), None);
    }

    #[test]
    fn traffic_without_cs_is_returned_as_received() {
        let fake = FakeBusPirate::new();
        let mut sniffer = sniffing(&fake);
        fake.bus_traffic(b"\\\x01\xff\\\x02\xff");
        assert_eq!(sniffer.sniff_message().unwrap(), Some((vec![1, 2], vec![0xff, 0xff])));
        assert_eq!(sniffer.sniff_message().unwrap(), None);
    }

    #[test]
    fn discard_pending_empties_the_device() {
        let fake = FakeBusPirate::new();
        let mut sniffer = sniffing(&fake);
        fake.bus_traffic(b"[\\\x01\x00][\\\x02\x00]");
        sniffer.discard_pending().unwrap();
        assert_eq!(sniffer.sniff_message().unwrap(), None);
    }

    #[test]
    fn disconnect_returns_to_terminal() {
        let fake = FakeBusPirate::new();
        let sniffer = sniffing(&fake);
        sniffer.disconnect().unwrap();
        assert_eq!(fake.mode(), Mode::Terminal);
        assert_eq!(fake.0.lock().written.last(), Some(&CMD_RESET_TERMINAL));
    }

    #[test]
    fn silent_device_is_a_protocol_error() {
        let fake = FakeBusPirate::new();
        fake.0.lock().mute = true;
        match BusPirate::new(fake.clone()).to_bitbang() {
            Err(ProbeError::Protocol(_)) => {}
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("handshake should fail"),
        }
        assert_eq!(fake.0.lock().written.iter().filter(|&&b| b == 0x00).count(), 20);
    }
}
