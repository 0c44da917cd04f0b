//! Station configuration.
//!
//! Two things live here: the [`Config`] trait, which bundles the platform
//! services an application supplies to the station (time, serial device,
//! orbit predictions, packet consumer), and [`StationConfig`], the plain
//! value holding operator settings. Required fields carry no defaults, so a
//! config file missing one fails deserialization, and startup with it,
//! instead of limping along.
//!
//! [`Config`]: trait.Config.html
//! [`StationConfig`]: struct.StationConfig.html

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::serial::SerialPort;
use crate::sink::PacketSink;
use crate::tracking::PassPredictor;
use std::path::PathBuf;

/// Trait for station configurations.
///
/// This defines the types of the platform services used throughout the
/// station. Every application defines a type implementing this trait and
/// supplies it to [`station::Station`].
///
/// [`station::Station`]: ../station/struct.Station.html
pub trait Config {
    /// UTC time source and sleeper.
    type Clock: Clock;

    /// The serial device the radio is attached to.
    type Serial: SerialPort;

    /// Orbit predictions for the tracked satellite.
    type Predictor: PassPredictor;

    /// Consumer for received packets.
    type Sink: PacketSink;
}

fn default_norad_id() -> u32 {
    43550
}

fn default_base_freq_hz() -> u32 {
    435_550_000
}

fn default_tle_path() -> PathBuf {
    PathBuf::from("tle.txt")
}

fn default_rx_dump_path() -> Option<PathBuf> {
    Some(PathBuf::from("rx_data.log"))
}

/// Operator settings, typically loaded from `station.toml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StationConfig {
    /// Station name reported with every published packet.
    pub station_name: String,
    /// Shared secret authenticating the station to packet consumers.
    pub station_secret: String,
    /// Geodetic latitude, degrees north.
    pub station_lat: f64,
    /// Geodetic longitude, degrees east.
    pub station_lon: f64,
    /// Altitude above sea level, meters.
    pub station_alt: f64,
    /// Operator kill switch: when set, uplink attempts fail without ever
    /// keying the transmitter.
    pub tx_disabled: bool,

    /// Recipients for packet notification mails (consumed by sinks).
    #[serde(default)]
    pub packet_email_recipients: Vec<String>,
    /// NORAD catalog number of the tracked satellite.
    #[serde(default = "default_norad_id")]
    pub norad_id: u32,
    /// Base carrier frequency in Hz.
    #[serde(default = "default_base_freq_hz")]
    pub base_freq_hz: u32,
    /// Location of the TLE cache file.
    #[serde(default = "default_tle_path")]
    pub tle_path: PathBuf,
    /// Where to append the raw receive dump; `None` disables the dump.
    #[serde(default = "default_rx_dump_path")]
    pub rx_dump_path: Option<PathBuf>,
}
