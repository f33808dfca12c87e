use crate::config::DutConfig;
use crate::encoding::TextEncoding;
use crate::error::{Error, Result};
use crate::transcript::{Direction, SharedTranscript};
use busprobe_decode::{parse_kv, KvMessage, LineAssembler};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serialport::SerialPortInfo;
use std::io::{Read, Write};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PortInfo {
    pub port_name: String,
    pub port_type: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (port_type, vid, pid, serial_number, manufacturer, product) = match &info.port_type {
            serialport::SerialPortType::UsbPort(usb) => (
                "USB".to_string(),
                Some(usb.vid),
                Some(usb.pid),
                usb.serial_number.clone(),
                usb.manufacturer.clone(),
                usb.product.clone(),
            ),
            serialport::SerialPortType::PciPort => ("PCI".to_string(), None, None, None, None, None),
            serialport::SerialPortType::BluetoothPort => ("Bluetooth".to_string(), None, None, None, None, None),
            serialport::SerialPortType::Unknown => ("Unknown".to_string(), None, None, None, None, None),
        };
        Self {
            port_name: info.port_name,
            port_type,
            vid,
            pid,
            serial_number,
            manufacturer,
            product,
        }
    }
}

impl PortInfo {
    /// FTDI FT232 as fitted to the Bus Pirate v3.
    pub fn looks_like_bus_pirate(&self) -> bool {
        self.vid == Some(0x0403) && self.pid == Some(0x6001)
    }
}

pub fn list_ports() -> Vec<PortInfo> {
    serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect()
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Kv(KvMessage, Instant),
    Console(String),
    Error(String),
    Closed,
}

enum Command {
    Send(KvMessage),
    Close,
}

/// Serial connection to the device under test. A worker thread owns the
/// port, splits incoming bytes into lines and forwards KV messages; console
/// text is forwarded as-is.
pub struct DutLink {
    tx_cmd: Sender<Command>,
    rx_evt: Receiver<LinkEvent>,
    worker: Option<JoinHandle<()>>,
}

impl DutLink {
    pub fn open(port_name: &str, cfg: &DutConfig, transcript: SharedTranscript) -> Result<Self> {
        let port = serialport::new(port_name, cfg.baud_rate)
            .timeout(Duration::from_millis(50))
            .open()?;
        log::info!("connected to DUT on {port_name}");
        Ok(Self::spawn(port, cfg.console_encoding, transcript))
    }

    /// Runs the link over any byte stream whose reads time out when idle.
    pub fn spawn<P>(mut port: P, encoding: TextEncoding, transcript: SharedTranscript) -> Self
    where
        P: Read + Write + Send + 'static,
    {
        let (tx_cmd, rx_cmd) = unbounded::<Command>();
        let (tx_evt, rx_evt) = unbounded::<LinkEvent>();

        let worker = std::thread::spawn(move || {
            let mut lines = LineAssembler::new();
            let mut buf = [0u8; 4096];
            loop {
                match port.read(&mut buf) {
                    Ok(0) => {
                        let _ = tx_evt.send(LinkEvent::Closed);
                        return;
                    }
                    Ok(n) => {
                        for line in lines.push(&buf[..n]) {
                            let event = classify(&encoding.decode(&line), &transcript);
                            let _ = tx_evt.send(event);
                        }
                    }
                    Err(e) if matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock) => {}
                    Err(e) => {
                        let _ = tx_evt.send(LinkEvent::Error(e.to_string()));
                        let _ = tx_evt.send(LinkEvent::Closed);
                        return;
                    }
                }
                while let Ok(cmd) = rx_cmd.try_recv() {
                    match cmd {
                        Command::Send(msg) => {
                            transcript.lock().push(Direction::Tx, msg.to_string());
                            if let Err(e) = port.write_all(&msg.encode()).and_then(|_| port.flush()) {
                                let _ = tx_evt.send(LinkEvent::Error(e.to_string()));
                            }
                        }
                        Command::Close => {
                            let _ = tx_evt.send(LinkEvent::Closed);
                            return;
                        }
                    }
                }
            }
        });

        Self { tx_cmd, rx_evt, worker: Some(worker) }
    }

    pub fn send(&self, msg: KvMessage) -> Result<()> {
        self.tx_cmd
            .send(Command::Send(msg))
            .map_err(|_| Error::HostTest("DUT link is closed".to_string()))
    }

    pub fn events(&self) -> &Receiver<LinkEvent> {
        &self.rx_evt
    }

    pub fn close(&mut self) {
        let _ = self.tx_cmd.send(Command::Close);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for DutLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn classify(line: &str, transcript: &SharedTranscript) -> LinkEvent {
    match parse_kv(line) {
        Some(msg) => {
            transcript.lock().push(Direction::Rx, msg.to_string());
            LinkEvent::Kv(msg, Instant::now())
        }
        None => {
            log::debug!("[DUT] {line}");
            LinkEvent::Console(line.to_string())
        }
    }
}
