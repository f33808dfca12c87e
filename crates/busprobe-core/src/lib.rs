//! Core functionalities: sigrok captures, Bus Pirate sniffing, mbed
//! host-test plumbing.

pub mod buspirate;
pub mod config;
pub mod dut;
pub mod encoding;
pub mod error;
pub mod hosttest;
pub mod sigrok;
pub mod spi_basic;
pub mod transcript;

pub use buspirate::{BusPirate, ProbeError, ProbePort, SniffFilter, Sniffer, SpiConfig};
pub use config::{Config, DutConfig, ProbeConfig, SampleRate, SigrokConfig};
pub use dut::{DutLink, LinkEvent, PortInfo};
pub use encoding::TextEncoding;
pub use error::{Error, Result};
pub use hosttest::{HostContext, HostTest, HostTestRunner, KvEvent, KvLink, Registry, TestOutcome};
pub use sigrok::{SigrokI2cRecorder, SigrokSpiRecorder};
pub use spi_basic::{SpiBasicTest, SpiSniff};
pub use transcript::{Direction, SharedTranscript, Transcript};
