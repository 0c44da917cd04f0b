//! Core control loop for a UHF amateur-radio satellite groundstation.
//!
//! This crate drives a half-duplex XDL-Micro transceiver over a serial link to
//! receive and decode framed satellite telemetry, transmit short uplink
//! command sequences, and retune the radio across each overhead pass to
//! compensate for Doppler shift.
//!
//! # Using the crate
//!
//! The station is runtime- and hardware-agnostic: every platform service
//! enters through a trait, bundled by an implementation of [`Config`]:
//!
//! * A UTC time source and sleeper, via [`Clock`].
//! * The serial device the radio hangs off of, via [`SerialPort`].
//! * Orbit predictions for the tracked satellite, via [`PassPredictor`].
//! * A consumer for decoded packets, via [`PacketSink`].
//!
//! With those in place, construct a [`station::Station`] and drive it with
//! [`station::Station::run`] on a dedicated thread; an interactive surface
//! talks to the loop through a [`station::ControlRequest`] channel.
//!
//! [`Config`]: config/trait.Config.html
//! [`Clock`]: clock/trait.Clock.html
//! [`SerialPort`]: serial/trait.SerialPort.html
//! [`PassPredictor`]: tracking/trait.PassPredictor.html
//! [`PacketSink`]: sink/trait.PacketSink.html

pub mod bytes;
pub mod clock;
pub mod config;
pub mod doppler;
mod error;
pub mod fec;
pub mod framing;
pub mod radio;
pub mod serial;
pub mod sink;
pub mod station;
pub mod telemetry;
pub mod tracking;
pub mod uplink;

pub use self::config::{Config, StationConfig};
pub use self::error::Error;

/// ASCII callsign transmitted at the start of every downlink frame.
pub const CALLSIGN: &str = "WL9XZE";
