//! Delivery of decoded packets to the outside world.
//!
//! The station hands every received frame to a [`PacketSink`], typically an
//! HTTP uploader or notifier living outside this crate. Delivery is
//! best-effort: the station logs sink failures and never retries, so sinks
//! needing reliability must be idempotent and queue internally.
//!
//! [`PacketSink`]: trait.PacketSink.html

use log::info;
use serde::Serialize;

use crate::telemetry::Preamble;

/// Everything known about one received packet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketRecord {
    /// The raw 510-hex-char frame as it appeared in the receive buffer.
    pub raw: String,
    /// Callsign plus corrected payload (hex), empty when correction failed.
    pub corrected: String,
    /// Parsed preamble, when the payload decoded and parsed.
    pub parsed: Option<Preamble>,
    /// Whether error correction succeeded.
    pub errors_corrected: bool,
    /// The correction failure, if any.
    pub error: Option<String>,
    /// Name of the receiving station.
    pub station_name: String,
}

/// Consumer for received packets.
pub trait PacketSink {
    /// Delivers one packet. Errors are reported as strings because the
    /// station only ever logs them.
    fn publish(&mut self, record: &PacketRecord) -> Result<(), String>;
}

/// A sink that only logs. The frontend's default when no uploader is
/// configured; also handy in tests.
#[derive(Debug, Default)]
pub struct LogSink {
    published: usize,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packets published so far.
    pub fn published(&self) -> usize {
        self.published
    }
}

impl PacketSink for LogSink {
    fn publish(&mut self, record: &PacketRecord) -> Result<(), String> {
        self.published += 1;
        info!(
            "publishing packet (corrected: {}, error: {:?}):\nraw:\n{}\ncorrected:\n{}\nparsed:\n{:?}",
            record.errors_corrected, record.error, record.raw, record.corrected, record.parsed
        );
        Ok(())
    }
}
