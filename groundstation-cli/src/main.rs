//! Launches the station loop on a worker thread and the operator prompt on
//! this one.

mod prompt;
mod serial;
mod tracker;

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::{unbounded, Receiver};
use log::{error, LevelFilter};
use simplelog::{ColorChoice, CombinedLogger, TermLogger, TerminalMode, WriteLogger};

use groundstation::clock::SystemClock;
use groundstation::serial::TestSerial;
use groundstation::sink::LogSink;
use groundstation::station::{ControlRequest, Station};
use groundstation::tracking::TleCache;
use groundstation::uplink::UplinkCatalog;
use groundstation::{Config, StationConfig};
use serial::RealSerial;
use tracker::{Observer, Sgp4Predictor};
use std::fs;
use std::path::PathBuf;
use std::thread;

const LOGFILE: &str = "groundstation.log";

#[derive(Parser)]
#[command(name = "groundstation-cli", about = "Launch and control the groundstation")]
struct Args {
    /// Station config file.
    #[arg(long, default_value = "station.toml")]
    config: PathBuf,

    /// Radio's serial port device.
    #[arg(long = "serial_port")]
    serial_port: Option<String>,

    /// Radio's serial baud rate.
    #[arg(long = "serial_baud", default_value_t = 38400)]
    serial_baud: u32,

    /// Use serial spoofing instead of a real device.
    #[arg(long)]
    test: bool,

    /// File (hex text) to spoof serial input from.
    #[arg(long = "serial_infile")]
    serial_infile: Option<PathBuf>,

    /// File for redirecting spoofed serial output.
    #[arg(long = "serial_outfile")]
    serial_outfile: Option<PathBuf>,

    /// Pre-configure the radio's Doppler channel ladder before starting.
    #[arg(long = "radio_preconfig")]
    radio_preconfig: bool,

    /// Show debug messages on the terminal.
    #[arg(long)]
    debug: bool,

    /// Uplink command catalog.
    #[arg(long = "uplink_file", default_value = "uplink_commands.csv")]
    uplink_file: PathBuf,
}

struct RealPlatform;

impl Config for RealPlatform {
    type Clock = SystemClock;
    type Serial = RealSerial;
    type Predictor = Sgp4Predictor;
    type Sink = LogSink;
}

struct SpoofedPlatform;

impl Config for SpoofedPlatform {
    type Clock = SystemClock;
    type Serial = TestSerial;
    type Predictor = Sgp4Predictor;
    type Sink = LogSink;
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug)?;

    let config: StationConfig = toml::from_str(
        &fs::read_to_string(&args.config)
            .with_context(|| format!("cannot read {}", args.config.display()))?,
    )
    .with_context(|| format!("invalid station config {}", args.config.display()))?;

    let catalog = UplinkCatalog::load(&args.uplink_file)
        .with_context(|| format!("cannot load uplink catalog {}", args.uplink_file.display()))?;
    let uplink_names: Vec<String> = catalog.names().map(String::from).collect();

    let observer = Observer {
        lat_deg: config.station_lat,
        lon_deg: config.station_lon,
        alt_m: config.station_alt,
    };
    let predictor = Sgp4Predictor::new(
        TleCache::new(config.tle_path.clone(), config.norad_id),
        observer,
    );

    let (control_tx, control_rx) = unbounded();

    let worker = if args.test {
        let infile = match &args.serial_infile {
            Some(path) => path,
            None => bail!("--test requires --serial_infile"),
        };
        let mut spoofed = TestSerial::from_hex_file(infile)
            .with_context(|| format!("cannot load {}", infile.display()))?;
        spoofed.set_max_available(128);
        if let Some(outfile) = &args.serial_outfile {
            spoofed.record_writes_to(outfile)?;
        }
        // emulate the radio's command-mode acknowledgements
        spoofed.on("^0103..(..)00$", b"\x01\x83\x00\x7c");
        spoofed.on("^011d01e100$", b"\x01\x9d\x00\x62");

        let station = Station::<SpoofedPlatform>::new(
            config,
            SystemClock,
            spoofed,
            predictor,
            LogSink::new(),
            catalog,
        )?;
        spawn_station(station, args.radio_preconfig, control_rx)
    } else {
        let port = match &args.serial_port {
            Some(port) => port,
            None => bail!("--serial_port is required (or pass --test)"),
        };
        let device = RealSerial::open(port, args.serial_baud)
            .with_context(|| format!("cannot open serial port {}", port))?;

        let station = Station::<RealPlatform>::new(
            config,
            SystemClock,
            device,
            predictor,
            LogSink::new(),
            catalog,
        )?;
        spawn_station(station, args.radio_preconfig, control_rx)
    };

    println!("Starting groundstation... (type 'help' for commands)");
    prompt::run(&control_tx, &uplink_names);

    worker.join().ok();
    Ok(())
}

fn spawn_station<C: Config>(
    mut station: Station<C>,
    radio_preconfig: bool,
    control: Receiver<ControlRequest>,
) -> thread::JoinHandle<()>
where
    Station<C>: Send + 'static,
{
    thread::spawn(move || {
        if radio_preconfig {
            match station.preconfigure_radio() {
                Ok(true) => {}
                Ok(false) => error!("radio preconfiguration did not complete cleanly"),
                Err(e) => error!("radio preconfiguration failed: {}", e),
            }
        }
        station.run(&control);
    })
}

fn init_logging(debug: bool) -> Result<()> {
    let term_level = if debug { LevelFilter::Debug } else { LevelFilter::Info };
    let logfile = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOGFILE)
        .with_context(|| format!("cannot open {}", LOGFILE))?;
    CombinedLogger::init(vec![
        TermLogger::new(
            term_level,
            simplelog::Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Debug, simplelog::Config::default(), logfile),
    ])
    .context("logger already initialized")?;
    Ok(())
}
