//! Uplink command transmission.
//!
//! Uplink commands are short ASCII sequences repeated many times into a
//! transmit burst; the satellite acknowledges with a fixed 9-byte response
//! on the downlink. The command byte strings live in an operator-provided
//! CSV catalog; the expected responses are protocol constants and are
//! compiled in.

use log::{debug, error, info};

use crate::bytes::to_hex;
use crate::clock::{to_chrono, Clock};
use crate::serial::SerialPort;
use crate::Error;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Bytes of response extracted (and logged) once the expected tag is found.
pub const RESPONSE_LEN: usize = 9;

/// Times the command bytes are repeated within one transmit burst.
pub const DEFAULT_CMD_REPEATS: usize = 15;

/// Bursts attempted before giving up on a command.
pub const DEFAULT_TX_REPEATS: usize = 12;

/// Listen window after each burst.
pub const TX_RESPONSE_TIMEOUT: Duration = Duration::from_millis(300);

const LISTEN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Delay from a received packet to the satellite's RX window, idle mode.
///
/// Hardware-specific; revalidate against satellite firmware before use.
pub const POST_PACKET_IDLE_WAIT: Duration = Duration::from_millis(450);

/// Delay from a received packet to the satellite's RX window, low-power mode.
///
/// Hardware-specific; revalidate against satellite firmware before use.
pub const POST_PACKET_LOW_POWER_WAIT: Duration = Duration::from_millis(900);

/// Length of the aligned transmit burst in post-packet mode.
pub const POST_PACKET_TX_WINDOW: Duration = Duration::from_millis(700);

/// Listen window in post-packet mode, spanning the satellite's 0.7–1.0 s
/// response latency.
pub const POST_PACKET_LISTEN: Duration = Duration::from_millis(1200);

/// Expected downlink responses, by command name.
const RESPONSES: &[(&str, &[u8])] = &[
    ("echo_cmd", b"ECHOCHOCO"),
    ("kill3_cmd", b"KILLN"), // plus 4 more bytes of revive timestamp
    ("kill7_cmd", b"KILLN"),
    ("killf_cmd", b"KILLN"),
    ("flash_cmd", b"FLASHING"), // last byte is whether it will flash
    ("reboot_cmd", b"REBOOTING"),
    ("revive_cmd", b"REVIVING!"),
    ("flashkill_cmd", b"FLASHKILL"),
    ("flashrevive_cmd", b"FLASHREV!"),
];

fn expected_response(name: &str) -> Option<&'static [u8]> {
    RESPONSES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|&(_, resp)| resp)
}

/// Satellite power mode, selecting the post-packet uplink alignment.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PostPacketMode {
    Idle,
    LowPower,
}

/// The uplink command catalog, loaded from CSV at startup.
///
/// A command is sendable only when it appears in the catalog *and* has a
/// known response; rows without one are rejected at load time.
#[derive(Debug, Clone)]
pub struct UplinkCatalog {
    commands: BTreeMap<String, Vec<u8>>,
}

impl UplinkCatalog {
    /// Loads the catalog from a `name,command` CSV file with a header row.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Loads the catalog from any CSV source.
    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, Error> {
        let mut csv_reader = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        let mut commands = BTreeMap::new();
        for record in csv_reader.records() {
            let record = record.map_err(|e| Error::Catalog(e.to_string()))?;
            if record.len() != 2 {
                return Err(Error::Catalog(format!(
                    "expected 2 fields per row, got {}",
                    record.len()
                )));
            }
            let name = record[0].trim().to_string();
            if expected_response(&name).is_none() {
                return Err(Error::Catalog(format!("unknown uplink command: {}", name)));
            }
            commands.insert(name, record[1].trim().as_bytes().to_vec());
        }
        Ok(Self { commands })
    }

    /// Returns whether `name` can be transmitted.
    pub fn is_valid(&self, name: &str) -> bool {
        self.commands.contains_key(name) && expected_response(name).is_some()
    }

    /// All catalog command names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    fn get(&self, name: &str) -> Option<(&[u8], &'static [u8])> {
        let bytes = self.commands.get(name)?;
        Some((bytes, expected_response(name)?))
    }
}

/// Transmits uplink commands and listens for their responses.
pub struct Uplink {
    catalog: UplinkCatalog,
    tx_disabled: bool,
    cmd_repeats: usize,
    repeats: usize,
    response_timeout: Duration,
}

impl Uplink {
    pub fn new(catalog: UplinkCatalog, tx_disabled: bool) -> Self {
        Self {
            catalog,
            tx_disabled,
            cmd_repeats: DEFAULT_CMD_REPEATS,
            repeats: DEFAULT_TX_REPEATS,
            response_timeout: TX_RESPONSE_TIMEOUT,
        }
    }

    pub fn catalog(&self) -> &UplinkCatalog {
        &self.catalog
    }

    /// Transmits the named command and listens for its response.
    ///
    /// Repeats the burst/listen cycle up to the configured number of times.
    /// Returns whether the response was observed, plus every byte read while
    /// listening (the read-back may contain unrelated downlink data and
    /// belongs in the receive buffer either way).
    pub fn send<S: SerialPort, K: Clock>(
        &self,
        serial: &mut S,
        clock: &K,
        name: &str,
    ) -> Result<(bool, Vec<u8>), Error> {
        let (cmd, response) = match self.catalog.get(name) {
            Some(entry) => entry,
            None => return Err(Error::Catalog(format!("invalid uplink command: {}", name))),
        };
        if self.tx_disabled {
            error!("transmission is manually DISABLED!");
            return Ok((false, Vec::new()));
        }

        let burst = cmd.repeat(self.cmd_repeats);
        let mut rx_buf = Vec::new();
        for attempt in 0..self.repeats {
            serial.write(&burst)?;
            serial.flush()?;

            let deadline = clock.now() + to_chrono(self.response_timeout);
            while clock.now() < deadline {
                debug!("searching for response ({}/{})...", attempt + 1, self.repeats);
                let available = serial.bytes_available()?;
                if available > 0 {
                    rx_buf.extend_from_slice(&serial.read(available)?);
                }
                if Self::report_response(&rx_buf, response).is_some() {
                    return Ok((true, rx_buf));
                }
                clock.sleep(LISTEN_POLL_INTERVAL);
            }
        }

        Ok((false, rx_buf))
    }

    /// Post-packet transmit: align the burst to the satellite's receive
    /// window right after a downlink packet, then listen long enough to span
    /// its response latency.
    pub fn send_post_packet<S: SerialPort, K: Clock>(
        &self,
        serial: &mut S,
        clock: &K,
        name: &str,
        mode: PostPacketMode,
    ) -> Result<(bool, Vec<u8>), Error> {
        let (cmd, response) = match self.catalog.get(name) {
            Some(entry) => entry,
            None => return Err(Error::Catalog(format!("invalid uplink command: {}", name))),
        };
        if self.tx_disabled {
            error!("transmission is manually DISABLED!");
            return Ok((false, Vec::new()));
        }

        let wait = match mode {
            PostPacketMode::Idle => POST_PACKET_IDLE_WAIT,
            PostPacketMode::LowPower => POST_PACKET_LOW_POWER_WAIT,
        };
        clock.sleep(wait);

        let burst = cmd.repeat(self.cmd_repeats);
        let tx_deadline = clock.now() + to_chrono(POST_PACKET_TX_WINDOW);
        loop {
            serial.write(&burst)?;
            serial.flush()?;
            if clock.now() >= tx_deadline {
                break;
            }
            clock.sleep(LISTEN_POLL_INTERVAL);
        }

        let mut rx_buf = Vec::new();
        let listen_deadline = clock.now() + to_chrono(POST_PACKET_LISTEN);
        while clock.now() < listen_deadline {
            let available = serial.bytes_available()?;
            if available > 0 {
                rx_buf.extend_from_slice(&serial.read(available)?);
            }
            if Self::report_response(&rx_buf, response).is_some() {
                return Ok((true, rx_buf));
            }
            clock.sleep(LISTEN_POLL_INTERVAL);
        }

        Ok((false, rx_buf))
    }

    /// Looks for `response` in `rx_buf`; logs and returns the match offset.
    fn report_response(rx_buf: &[u8], response: &[u8]) -> Option<usize> {
        if response.is_empty() || rx_buf.len() < response.len() {
            return None;
        }
        let at = rx_buf
            .windows(response.len())
            .position(|window| window == response)?;
        let end = (at + RESPONSE_LEN).min(rx_buf.len());
        let full = &rx_buf[at..end];
        info!(
            "got uplink command response: {} ({})",
            String::from_utf8_lossy(full),
            to_hex(full)
        );
        Some(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::serial::TestSerial;

    const CATALOG_CSV: &str = "name,command\n\
        echo_cmd,ECHO_CMD\n\
        reboot_cmd,RBOT_CMD\n";

    fn catalog() -> UplinkCatalog {
        UplinkCatalog::from_reader(CATALOG_CSV.as_bytes()).unwrap()
    }

    #[test]
    fn catalog_load_and_validity() {
        let cat = catalog();
        assert!(cat.is_valid("echo_cmd"));
        assert!(cat.is_valid("reboot_cmd"));
        assert!(!cat.is_valid("kill3_cmd")); // known response, not in file
        assert!(!cat.is_valid("nonsense"));
        assert_eq!(cat.names().collect::<Vec<_>>(), ["echo_cmd", "reboot_cmd"]);
    }

    #[test]
    fn catalog_rejects_unknown_names() {
        let csv = "name,command\nwarp_cmd,WARP\n";
        assert!(matches!(
            UplinkCatalog::from_reader(csv.as_bytes()),
            Err(Error::Catalog(_))
        ));
    }

    #[test]
    fn send_succeeds_when_response_arrives() {
        let uplink = Uplink::new(catalog(), false);
        let mut ser = TestSerial::new(Vec::new());
        let clock = MockClock::fixed();
        // Answer after the 4th burst, like a satellite that needs a few
        // repetitions to sync.
        ser.on_nth("4543484f5f434d44", b"\x00\x11ECHOCHOCO\x22", 4);

        let (ok, rx) = uplink.send(&mut ser, &clock, "echo_cmd").unwrap();
        assert!(ok);
        assert!(rx.windows(9).any(|w| w == b"ECHOCHOCO"));
        assert!(ser.writes().len() >= 4 && ser.writes().len() <= DEFAULT_TX_REPEATS);
        // each burst carries the repeated command bytes
        assert_eq!(ser.writes()[0].len(), "ECHO_CMD".len() * DEFAULT_CMD_REPEATS);
    }

    #[test]
    fn send_fails_on_silent_line() {
        let uplink = Uplink::new(catalog(), false);
        let mut ser = TestSerial::new(Vec::new());
        let clock = MockClock::fixed();

        let (ok, rx) = uplink.send(&mut ser, &clock, "echo_cmd").unwrap();
        assert!(!ok);
        assert!(rx.is_empty());
        assert_eq!(ser.writes().len(), DEFAULT_TX_REPEATS);
    }

    #[test]
    fn send_respects_tx_disabled() {
        let uplink = Uplink::new(catalog(), true);
        let mut ser = TestSerial::new(Vec::new());
        let clock = MockClock::fixed();

        let (ok, rx) = uplink.send(&mut ser, &clock, "echo_cmd").unwrap();
        assert!(!ok);
        assert!(rx.is_empty());
        assert!(ser.writes().is_empty());
    }

    #[test]
    fn send_rejects_unknown_command() {
        let uplink = Uplink::new(catalog(), false);
        let mut ser = TestSerial::new(Vec::new());
        let clock = MockClock::fixed();
        assert!(uplink.send(&mut ser, &clock, "nonsense").is_err());
    }

    #[test]
    fn post_packet_send_waits_then_transmits() {
        let uplink = Uplink::new(catalog(), false);
        let mut ser = TestSerial::new(Vec::new());
        let clock = MockClock::fixed();
        let start = clock.now();
        ser.on("4543484f5f434d44", b"ECHOCHOCO");

        let (ok, _) = uplink
            .send_post_packet(&mut ser, &clock, "echo_cmd", PostPacketMode::LowPower)
            .unwrap();
        assert!(ok);
        // nothing may go out before the low-power receive window opens
        let elapsed = clock.now() - start;
        assert!(elapsed >= chrono::Duration::milliseconds(900));
        assert!(!ser.writes().is_empty());
    }
}
