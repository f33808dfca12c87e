//! Host test for the "SPI Basic Test" firmware suite.
//!
//! The firmware drives SPI without a chip select, so the Bus Pirate cannot
//! tell transactions apart; all sniffed bytes are aggregated and checked
//! against the pattern each test case is expected to put on the bus.

use crate::buspirate::{self, ProbeError, ProbePort, SniffFilter, Sniffer, SpiConfig};
use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::hosttest::{HostContext, HostTest, KvEvent, Registry};
use serialport::SerialPort;

/// Message every single-message case writes.
pub const STANDARD_MESSAGE: [u8; 4] = [0x01, 0x02, 0x04, 0x08];

/// Source of sniffed SPI traffic.
pub trait SpiSniff {
    /// MOSI and MISO bytes of the next message, `None` once drained.
    fn sniff_message(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, ProbeError>;
    fn discard_pending(&mut self) -> Result<(), ProbeError>;
    fn disconnect(self) -> Result<(), ProbeError>;
}

impl<P: ProbePort> SpiSniff for Sniffer<P> {
    fn sniff_message(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, ProbeError> {
        Sniffer::sniff_message(self)
    }

    fn discard_pending(&mut self) -> Result<(), ProbeError> {
        Sniffer::discard_pending(self)
    }

    fn disconnect(self) -> Result<(), ProbeError> {
        Sniffer::disconnect(self).map(drop)
    }
}

pub fn is_standard_message(mosi: &[u8]) -> bool {
    mosi == STANDARD_MESSAGE
}

/// A message `01 02` cut short by an abort (fewer than 30 trailing zero
/// bytes), then a complete `01 02` followed by 30 zero bytes.
pub fn is_queue_and_abort_pattern(mosi: &[u8]) -> bool {
    // The leading 0x01 leaves an empty first part.
    let messages: Vec<&[u8]> = mosi.split(|&b| b == 0x01).collect();
    if messages.len() != 3 {
        log::debug!("expected 2 messages, saw {}", messages.len().saturating_sub(1));
        return false;
    }
    if !(messages[1].first() == Some(&0x02) && messages[1].len() < 31) {
        log::debug!("first message malformed: {}", hex::encode(messages[1]));
        return false;
    }
    if !(messages[2].first() == Some(&0x02) && messages[2].len() == 31) {
        log::debug!("second message malformed: {}", hex::encode(messages[2]));
        return false;
    }
    true
}

type Connect<S> = Box<dyn FnMut() -> Result<S, ProbeError>>;

pub struct SpiBasicTest<S> {
    connect: Connect<S>,
    sniffer: Option<S>,
    mosi: Vec<u8>,
    miso: Vec<u8>,
}

impl SpiBasicTest<Sniffer<Box<dyn SerialPort>>> {
    /// Sniffs with a Bus Pirate on `port`, set up for SPI mode 0 without
    /// driving the bus.
    pub fn with_bus_pirate(port: String, cfg: ProbeConfig) -> Self {
        Self::new(move || {
            let mut spi = buspirate::open(&port, &cfg)?.to_bitbang()?.to_spi()?;
            spi.configure(&SpiConfig::default())?;
            spi.sniff(SniffFilter::All)
        })
    }
}

impl<S: SpiSniff> SpiBasicTest<S> {
    pub fn new(connect: impl FnMut() -> Result<S, ProbeError> + 'static) -> Self {
        Self { connect: Box::new(connect), sniffer: None, mosi: Vec::new(), miso: Vec::new() }
    }

    pub fn mosi(&self) -> &[u8] {
        &self.mosi
    }

    pub fn miso(&self) -> &[u8] {
        &self.miso
    }

    fn sniffer(&mut self) -> Result<&mut S> {
        self.sniffer
            .as_mut()
            .ok_or_else(|| Error::HostTest("Bus Pirate is not connected".to_string()))
    }

    /// Appends everything the probe has seen since the last call.
    fn consume_spi_data(&mut self) -> Result<()> {
        loop {
            let Some((mosi, miso)) = self.sniffer()?.sniff_message()? else {
                return Ok(());
            };
            self.mosi.extend(mosi);
            self.miso.extend(miso);
        }
    }

    fn start_recording_spi(&mut self, _: &KvEvent, ctx: &mut HostContext) -> Result<()> {
        self.sniffer()?.discard_pending()?;
        self.mosi.clear();
        self.miso.clear();
        ctx.send_kv("start_recording_spi", "complete");
        Ok(())
    }

    fn verify_standard_message(&mut self, _: &KvEvent, ctx: &mut HostContext) -> Result<()> {
        self.consume_spi_data()?;
        if is_standard_message(&self.mosi) {
            ctx.send_kv("verify_standard_message", "pass");
        } else {
            log::error!("Incorrect MOSI data. Expected {}", hex::encode(STANDARD_MESSAGE));
            ctx.send_kv("verify_standard_message", "fail");
        }
        Ok(())
    }

    fn verify_queue_and_abort_test(&mut self, _: &KvEvent, ctx: &mut HostContext) -> Result<()> {
        self.consume_spi_data()?;
        if is_queue_and_abort_pattern(&self.mosi) {
            ctx.send_kv("verify_queue_and_abort_test", "pass");
        } else {
            log::error!("Incorrect MOSI data for queue and abort test");
            ctx.send_kv("verify_queue_and_abort_test", "fail");
        }
        Ok(())
    }

    fn print_spi_data(&mut self, _: &KvEvent, ctx: &mut HostContext) -> Result<()> {
        self.consume_spi_data()?;
        log::info!("Bus Pirate reads MOSI bytes as: {}", hex::encode(&self.mosi));
        log::info!("Bus Pirate reads MISO bytes as: {}", hex::encode(&self.miso));
        ctx.send_kv("print_spi_data", "complete");
        Ok(())
    }
}

impl<S: SpiSniff> HostTest for SpiBasicTest<S> {
    fn name(&self) -> &str {
        "spi_basic_test"
    }

    fn setup(&mut self, registry: &mut Registry<Self>, ctx: &mut HostContext) -> Result<()> {
        match (self.connect)() {
            Ok(sniffer) => self.sniffer = Some(sniffer),
            Err(e) => {
                log::error!("could not connect to the Bus Pirate: {e}");
                ctx.notify_complete(false);
            }
        }

        registry.register_callback("start_recording_spi", Self::start_recording_spi);
        registry.register_callback("verify_standard_message", Self::verify_standard_message);
        registry.register_callback("verify_queue_and_abort_test", Self::verify_queue_and_abort_test);
        registry.register_callback("print_spi_data", Self::print_spi_data);

        log::info!("SPI Basic Test host test setup complete.");
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        if let Some(sniffer) = self.sniffer.take() {
            sniffer.disconnect()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buspirate::fake::{FakeBusPirate, Mode};
    use crate::buspirate::BusPirate;
    use crate::hosttest::testing::ScriptedLink;
    use crate::hosttest::{HostTestRunner, TestOutcome};
    use crate::transcript::Transcript;
    use busprobe_decode::KvMessage;
    use std::time::{Duration, Instant};

    fn fake_test(fake: &FakeBusPirate) -> SpiBasicTest<Sniffer<FakeBusPirate>> {
        let fake = fake.clone();
        SpiBasicTest::new(move || {
            let mut spi = BusPirate::new(fake.clone()).to_bitbang()?.to_spi()?;
            spi.configure(&SpiConfig::default())?;
            spi.sniff(SniffFilter::All)
        })
    }

    fn event(key: &str) -> KvEvent {
        KvEvent { key: key.to_string(), value: "0".to_string(), timestamp: Instant::now() }
    }

    fn wire(bytes: &[u8]) -> Vec<u8> {
        bytes.iter().flat_map(|&b| [b'\\', b, 0xff]).collect()
    }

    #[test]
    fn standard_message_pattern() {
        assert!(is_standard_message(&[1, 2, 4, 8]));
        assert!(!is_standard_message(&[1, 2, 4, 8, 0]));
        assert!(!is_standard_message(&[]));
    }

    #[test]
    fn queue_and_abort_pattern() {
        let mut good = vec![0x01, 0x02];
        good.extend([0u8; 10]);
        good.extend([0x01, 0x02]);
        good.extend([0u8; 30]);
        assert!(is_queue_and_abort_pattern(&good));

        let mut second_short = vec![0x01, 0x02, 0x00, 0x01, 0x02];
        second_short.extend([0u8; 29]);
        assert!(!is_queue_and_abort_pattern(&second_short));

        let mut first_complete = vec![0x01, 0x02];
        first_complete.extend([0u8; 30]);
        first_complete.extend(first_complete.clone());
        assert!(!is_queue_and_abort_pattern(&first_complete));

        // An empty first message must not panic.
        let mut empty_first = vec![0x01, 0x01, 0x02];
        empty_first.extend([0u8; 30]);
        assert!(!is_queue_and_abort_pattern(&empty_first));

        assert!(!is_queue_and_abort_pattern(&[]));
    }

    #[test]
    fn callbacks_reply_and_aggregate() {
        let fake = FakeBusPirate::new();
        let mut test = fake_test(&fake);
        let mut registry = Registry::default();
        let mut ctx = HostContext::default();
        test.setup(&mut registry, &mut ctx).unwrap();
        assert_eq!(ctx.verdict(), None);
        assert_eq!(fake.mode(), Mode::Sniff);

        // Leftovers from an earlier case are thrown away.
        fake.bus_traffic(&wire(&[0xde, 0xad]));
        let start = registry.get("start_recording_spi").unwrap();
        start(&mut test, &event("start_recording_spi"), &mut ctx).unwrap();
        assert!(test.mosi().is_empty());

        fake.bus_traffic(&wire(&[0x01, 0x02]));
        fake.bus_traffic(&wire(&[0x04, 0x08]));
        let verify = registry.get("verify_standard_message").unwrap();
        verify(&mut test, &event("verify_standard_message"), &mut ctx).unwrap();
        assert_eq!(test.mosi(), STANDARD_MESSAGE);
        assert_eq!(test.miso(), [0xff; 4]);

        let print = registry.get("print_spi_data").unwrap();
        print(&mut test, &event("print_spi_data"), &mut ctx).unwrap();

        assert_eq!(
            ctx.take_outbox(),
            vec![
                KvMessage::new("start_recording_spi", "complete"),
                KvMessage::new("verify_standard_message", "pass"),
                KvMessage::new("print_spi_data", "complete"),
            ]
        );

        test.teardown().unwrap();
        assert_eq!(fake.mode(), Mode::Terminal);
    }

    #[test]
    fn full_session_over_the_runner() {
        let fake = FakeBusPirate::new();
        let mut test = fake_test(&fake);
        let (link, tx) = ScriptedLink::new(&[("start_recording_spi", "0")]);
        let mut runner = HostTestRunner::new(link, Duration::from_secs(2), Transcript::shared(64));

        // The DUT writes the wrong message before asking for verification.
        let feeder = {
            let fake = fake.clone();
            std::thread::spawn(move || {
                while fake.mode() != Mode::Sniff {
                    std::thread::sleep(Duration::from_millis(1));
                }
                std::thread::sleep(Duration::from_millis(50));
                fake.bus_traffic(&wire(&[0x01, 0x02, 0x04]));
                for (key, value) in [("verify_standard_message", "0"), ("end", "success"), ("__exit", "0")] {
                    tx.send(crate::dut::LinkEvent::Kv(KvMessage::new(key, value), Instant::now())).unwrap();
                }
            })
        };

        let outcome = runner.run(&mut test).unwrap();
        feeder.join().unwrap();
        assert_eq!(outcome, TestOutcome::Pass);
        let sent = runner.into_link().sent;
        assert_eq!(sent[0].key, "__sync");
        assert_eq!(sent[1], KvMessage::new("start_recording_spi", "complete"));
        assert_eq!(sent.last(), Some(&KvMessage::new("verify_standard_message", "fail")));
        assert_eq!(fake.mode(), Mode::Terminal);
    }

    #[test]
    fn missing_probe_fails_the_test() {
        let mut test: SpiBasicTest<Sniffer<FakeBusPirate>> =
            SpiBasicTest::new(|| Err(ProbeError::Protocol("entering binary mode")));
        let (link, _tx) = ScriptedLink::new(&[("start_recording_spi", "0")]);
        let mut runner = HostTestRunner::new(link, Duration::from_millis(200), Transcript::shared(8));
        assert_eq!(runner.run(&mut test).unwrap(), TestOutcome::Fail);
        assert!(runner.into_link().sent.is_empty());
    }
}
