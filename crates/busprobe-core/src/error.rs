use crate::buspirate::ProbeError;
use busprobe_decode::LengthMismatch;
use std::process::ExitStatus;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("MBED_SIGROK_COMMAND must be set to use the sigrok logic analyzer")]
    MissingSigrokCommand,

    #[error("cannot parse sigrok command '{0}': unbalanced quotes")]
    InvalidSigrokCommand(String),

    #[error("failed to launch sigrok: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("sigrok failed ({0})")]
    SigrokFailed(ExitStatus),

    #[error("sigrok did not exit within {0:?}")]
    Timeout(Duration),

    #[error("no sigrok capture in progress")]
    NotRecording,

    #[error("a sigrok capture is already in progress")]
    CaptureInProgress,

    #[error("invalid SPI capture: {0}")]
    Decode(#[from] LengthMismatch),

    #[error("bus pirate: {0}")]
    Probe(#[from] ProbeError),

    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("host test: {0}")]
    HostTest(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
