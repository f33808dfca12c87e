use anyhow::{bail, Context, Result};
use busprobe_core::dut::{self, DutLink};
use busprobe_core::{
    buspirate, Config, HostTestRunner, SigrokI2cRecorder, SigrokSpiRecorder, SniffFilter, SpiBasicTest, SpiConfig,
    TestOutcome, Transcript,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Logic analyzer and Bus Pirate helper for hardware-in-the-loop tests.
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON config file [default: <config dir>/busprobe/config.json]
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List serial ports.
    Ports,

    /// Capture I2C traffic with sigrok (SCL on D0, SDA on D1).
    I2c {
        /// Capture length after the trigger, in milliseconds.
        #[clap(short, long, default_value_t = 100)]
        time: u64,
        #[clap(long)]
        json: bool,
    },

    /// Capture SPI traffic with sigrok (CLK, MOSI, MISO on D0..D2).
    Spi {
        /// Analyzer channel wired to chip select, e.g. D3.
        #[clap(long)]
        cs: Option<String>,
        #[clap(short, long, default_value_t = 100)]
        time: u64,
        #[clap(long)]
        json: bool,
    },

    /// Sniff SPI traffic with a Bus Pirate and print it.
    Sniff {
        #[clap(long)]
        probe: Option<String>,
        #[clap(long, default_value_t = 5)]
        seconds: u64,
        /// Only report traffic while CS is low.
        #[clap(long)]
        cs_low: bool,
    },

    /// Run the host side of an mbed host test.
    HostTest {
        #[clap(subcommand)]
        test: HostTestCmd,
    },
}

#[derive(Subcommand)]
enum HostTestCmd {
    /// SPI Basic Test: verifies DUT SPI output with a Bus Pirate.
    SpiBasic {
        /// Serial port of the device under test.
        #[clap(long)]
        dut: Option<String>,
        /// Serial port of the Bus Pirate.
        #[clap(long)]
        probe: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("busprobe=info")).init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Cmd::Ports => list_ports(),
        Cmd::I2c { time, json } => capture_i2c(&config, time, json),
        Cmd::Spi { cs, time, json } => capture_spi(&config, cs.as_deref(), time, json),
        Cmd::Sniff { probe, seconds, cs_low } => sniff(&config, probe, seconds, cs_low),
        Cmd::HostTest { test: HostTestCmd::SpiBasic { dut, probe } } => {
            if run_spi_basic(&config, dut, probe)? != TestOutcome::Pass {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let default_path = dirs::config_dir().map(|dir| dir.join("busprobe").join("config.json"));
    let (path, explicit) = match path {
        Some(p) => (Some(p.to_path_buf()), true),
        None => (default_path, false),
    };

    let Some(path) = path else {
        return Ok(Config::default());
    };
    if !explicit && !path.exists() {
        return Ok(Config::default());
    }

    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let config = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    log::debug!("loaded config from {}", path.display());
    Ok(config)
}

fn list_ports() -> Result<()> {
    let ports = dut::list_ports();
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        let ids = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" {vid:04x}:{pid:04x}"),
            _ => String::new(),
        };
        let hint = if port.looks_like_bus_pirate() { "  (Bus Pirate?)" } else { "" };
        println!(
            "{} [{}{}] {}{}",
            port.port_name,
            port.port_type,
            ids,
            port.product.as_deref().unwrap_or(""),
            hint
        );
    }
    Ok(())
}

fn capture_i2c(config: &Config, time_ms: u64, json: bool) -> Result<()> {
    let mut recorder = SigrokI2cRecorder::new(config.sigrok.clone().apply_env()?);
    recorder.record(Duration::from_millis(time_ms))?;
    log::info!("recording I2C for {time_ms} ms after the first SCL edge");
    let events = recorder.get_result()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
    } else {
        for event in &events {
            println!("{event}");
        }
    }
    Ok(())
}

fn capture_spi(config: &Config, cs: Option<&str>, time_ms: u64, json: bool) -> Result<()> {
    let mut recorder = SigrokSpiRecorder::new(config.sigrok.clone().apply_env()?);
    recorder.record(cs, Duration::from_millis(time_ms))?;
    log::info!("recording SPI for {time_ms} ms");
    let transactions = recorder.get_result()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&transactions)?);
    } else {
        for transaction in &transactions {
            println!("{transaction}");
        }
    }
    Ok(())
}

fn probe_port(config: &Config, flag: Option<String>) -> Result<String> {
    match flag.or_else(|| config.probe.port.clone()) {
        Some(port) => Ok(port),
        None => bail!("no Bus Pirate port given (use --probe or set probe.port in the config)"),
    }
}

fn sniff(config: &Config, probe: Option<String>, seconds: u64, cs_low: bool) -> Result<()> {
    let port = probe_port(config, probe)?;
    let mut spi = buspirate::open(&port, &config.probe)?.to_bitbang()?.to_spi()?;
    spi.configure(&SpiConfig::default())?;
    let filter = if cs_low { SniffFilter::CsLow } else { SniffFilter::All };
    let mut sniffer = spi.sniff(filter)?;

    let deadline = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < deadline {
        if let Some((mosi, miso)) = sniffer.sniff_message()? {
            println!("mosi: {}  miso: {}", hex::encode(mosi), hex::encode(miso));
        }
    }
    sniffer.disconnect()?;
    Ok(())
}

fn run_spi_basic(config: &Config, dut: Option<String>, probe: Option<String>) -> Result<TestOutcome> {
    let Some(dut_port) = dut.or_else(|| config.dut.port.clone()) else {
        bail!("no DUT port given (use --dut or set dut.port in the config)");
    };
    let probe_port = probe_port(config, probe)?;

    let transcript = Transcript::shared(1000);
    let link = DutLink::open(&dut_port, &config.dut, transcript.clone())?;
    let mut runner = HostTestRunner::new(link, Duration::from_secs(config.dut.timeout_s), transcript);
    let mut test = SpiBasicTest::with_bus_pirate(probe_port, config.probe.clone());
    Ok(runner.run(&mut test)?)
}
