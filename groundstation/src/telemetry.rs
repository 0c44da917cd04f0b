//! Parsing of the corrected downlink payload.
//!
//! Only the 13-byte preamble is interpreted here: enough to label a
//! publication with the satellite's clock, message type and power state.
//! The message-type-specific sensor fields that follow are left to the
//! consumers behind [`PacketSink`].
//!
//! [`PacketSink`]: ../sink/trait.PacketSink.html

use serde::Serialize;

use crate::bytes::ByteReader;
use crate::Error;

/// Bytes of preamble at the start of every corrected payload.
pub const PREAMBLE_LEN: usize = 13;

/// Downlink message type, from the low three bits of the op-states byte.
///
/// Codes this station does not know are kept raw in `Unknown` so the record
/// still publishes; the satellite firmware may grow message types faster
/// than ground software updates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum MessageType {
    Idle,
    Attitude,
    FlashBurst,
    FlashCmp,
    LowPower,
    Unknown(u8),
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => MessageType::Idle,
            1 => MessageType::Attitude,
            2 => MessageType::FlashBurst,
            3 => MessageType::FlashCmp,
            4 => MessageType::LowPower,
            other => MessageType::Unknown(other),
        }
    }
}

/// Satellite operating state, from bits 3..=5 of the op-states byte.
///
/// Unrecognized codes are preserved raw, like [`MessageType`].
///
/// [`MessageType`]: enum.MessageType.html
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum SatelliteState {
    Initial,
    AntennaDeploy,
    HelloWorld,
    IdleNoFlash,
    IdleFlash,
    LowPower,
    Unknown(u8),
}

impl SatelliteState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => SatelliteState::Initial,
            1 => SatelliteState::AntennaDeploy,
            2 => SatelliteState::HelloWorld,
            3 => SatelliteState::IdleNoFlash,
            4 => SatelliteState::IdleFlash,
            5 => SatelliteState::LowPower,
            other => SatelliteState::Unknown(other),
        }
    }
}

/// The decoded packet preamble.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preamble {
    /// Callsign as transmitted (normally the station's tracked satellite).
    pub callsign: String,
    /// Satellite-side timestamp, seconds since its last reboot reference.
    pub timestamp: u32,
    pub message_type: MessageType,
    pub satellite_state: SatelliteState,
    /// Set when the single-pixel flash self-test reported a fault.
    pub flash_state: bool,
    /// Set when the MRAM copy of the program memory is active.
    pub mram_copy: bool,
    /// Payload bytes the satellite claims this message carries.
    pub data_len: u8,
    /// Entries in the satellite's error queue at transmit time.
    pub error_count: u8,
}

/// Parses the preamble off the front of a corrected payload
/// (callsign included, parity already removed).
pub fn parse_preamble(corrected: &[u8]) -> Result<Preamble, Error> {
    let mut reader = ByteReader::new(corrected);
    let callsign = reader.read_slice(6)?;
    let callsign = std::str::from_utf8(callsign)
        .map_err(|_| Error::InvalidValue)?
        .to_string();
    let timestamp = reader.read_u32_le()?;
    let op_states = reader.read_u8()?;
    let data_len = reader.read_u8()?;
    let error_count = reader.read_u8()?;

    Ok(Preamble {
        callsign,
        timestamp,
        message_type: MessageType::from_bits(op_states & 0x07),
        satellite_state: SatelliteState::from_bits((op_states >> 3) & 0x07),
        flash_state: op_states & 0x40 != 0,
        mram_copy: op_states & 0x80 != 0,
        data_len,
        error_count,
    })
}
