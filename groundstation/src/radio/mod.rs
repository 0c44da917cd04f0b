//! Session-level control of the XDL-Micro transceiver.
//!
//! [`RadioController`] sits on top of the [`codec`] framing and runs the
//! command-mode exchanges: enter/exit command mode, program channel records,
//! switch the active channel, and commit settings to nonvolatile memory.
//! Every exchange writes one frame and then polls the serial line for a
//! parseable response, retrying a bounded number of times.
//!
//! Failures here are advisory. Operations return `(ok, read_back)` instead
//! of an error so the caller can log, feed the unmatched read-back into the
//! receive buffer (it may contain unrelated downlink data), and move on.
//!
//! [`RadioController`]: struct.RadioController.html
//! [`codec`]: codec/index.html

pub mod codec;

use log::{debug, info, warn};

use self::codec::Opcode;
use crate::bytes::to_hex;
use crate::clock::{to_chrono, Clock};
use crate::serial::SerialPort;
use crate::Error;
use std::time::Duration;

/// Channel frequencies must be multiples of this step.
pub const RADIO_FREQ_STEP_HZ: u32 = 6250;

/// Highest programmable channel index.
pub const MAX_CHANNELS: u8 = 32;

/// Default number of attempts per command exchange.
pub const DEFAULT_RETRIES: u32 = 5;

/// Default pause between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(400);

/// How long a single attempt waits for a matching response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Outcome of a command exchange: whether a valid response arrived, plus
/// every byte read off the line while waiting (matched or not).
pub type Exchange = (bool, Vec<u8>);

/// One programmed channel record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelEntry {
    pub rx_freq_hz: u32,
    pub tx_freq_hz: u32,
    pub bandwidth_hz: u32,
}

/// Mirror of the channel records programmed into the radio, indexed 1..=32.
#[derive(Debug, Clone)]
pub struct ChannelTable {
    entries: [Option<ChannelEntry>; MAX_CHANNELS as usize],
}

impl ChannelTable {
    pub fn new() -> Self {
        Self {
            entries: [None; MAX_CHANNELS as usize],
        }
    }

    /// Looks up the record for `channel` (1-based).
    pub fn get(&self, channel: u8) -> Option<ChannelEntry> {
        if valid_channel(channel) {
            self.entries[usize::from(channel) - 1]
        } else {
            None
        }
    }

    fn set(&mut self, channel: u8, entry: ChannelEntry) {
        self.entries[usize::from(channel) - 1] = Some(entry);
    }

    fn update<F: FnOnce(&mut ChannelEntry)>(&mut self, channel: u8, f: F) {
        if let Some(entry) = self.entries[usize::from(channel) - 1].as_mut() {
            f(entry);
        }
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

fn valid_channel(channel: u8) -> bool {
    (1..=MAX_CHANNELS).contains(&channel)
}

fn valid_freq(freq_hz: u32) -> bool {
    freq_hz % RADIO_FREQ_STEP_HZ == 0
}

/// Drives command-mode exchanges with the radio over any [`SerialPort`].
///
/// [`SerialPort`]: ../serial/trait.SerialPort.html
pub struct RadioController {
    channels: ChannelTable,
    active_channel: Option<u8>,
    retries: u32,
    retry_delay: Duration,
    response_timeout: Duration,
}

impl RadioController {
    pub fn new() -> Self {
        Self {
            channels: ChannelTable::new(),
            active_channel: None,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            response_timeout: RESPONSE_TIMEOUT,
        }
    }

    /// The channel records successfully programmed through this controller.
    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    /// The channel last activated with [`set_channel`], if any.
    ///
    /// [`set_channel`]: #method.set_channel
    pub fn active_channel(&self) -> Option<u8> {
        self.active_channel
    }

    /// Switches the radio into command mode.
    ///
    /// The escape sequence is unframed and unacknowledged; it needs line
    /// silence before and after. With `dealer` set, dealer access is
    /// requested afterwards and its status response is validated.
    pub fn enter_command_mode<S: SerialPort, K: Clock>(
        &mut self,
        serial: &mut S,
        clock: &K,
        dealer: bool,
    ) -> Result<Exchange, Error> {
        info!("setting radio to command mode (dealer: {})", dealer);
        clock.sleep(codec::COMMAND_MODE_GUARD);
        serial.write(codec::COMMAND_MODE_ESCAPE)?;
        serial.flush()?;
        clock.sleep(codec::COMMAND_MODE_GUARD);

        if dealer {
            let (ok, status, read_back) =
                self.exchange(serial, clock, Opcode::DealerMode, &[0x01], self.retries)?;
            let ok = ok && status.as_deref() == Some(&[0x00]);
            if !ok {
                warn!("dealer mode request not acknowledged");
            }
            Ok((ok, read_back))
        } else {
            Ok((true, Vec::new()))
        }
    }

    /// Leaves command mode by warm-resetting the radio.
    pub fn exit_command_mode<S: SerialPort, K: Clock>(
        &mut self,
        serial: &mut S,
        clock: &K,
        retries: u32,
    ) -> Result<Exchange, Error> {
        info!("setting radio to normal mode");
        let (ok, _, read_back) = self.exchange(serial, clock, Opcode::WarmReset, &[0x01], retries)?;
        Ok((ok, read_back))
    }

    /// Commits the current settings to the radio's nonvolatile memory.
    pub fn program_settings<S: SerialPort, K: Clock>(
        &mut self,
        serial: &mut S,
        clock: &K,
    ) -> Result<Exchange, Error> {
        info!("programming radio settings");
        let (ok, _, read_back) = self.exchange(serial, clock, Opcode::Program, &[], self.retries)?;
        Ok((ok, read_back))
    }

    /// Switches the active channel.
    ///
    /// `retries` is explicit here because mid-pass activations run on a
    /// tighter budget than ground-side configuration.
    pub fn set_channel<S: SerialPort, K: Clock>(
        &mut self,
        serial: &mut S,
        clock: &K,
        channel: u8,
        retries: u32,
    ) -> Result<Exchange, Error> {
        if !valid_channel(channel) {
            warn!("rejecting channel {} (must be 1..={})", channel, MAX_CHANNELS);
            return Ok((false, Vec::new()));
        }
        let (ok, _, read_back) =
            self.exchange(serial, clock, Opcode::SetChannel, &[channel], retries)?;
        if ok {
            self.active_channel = Some(channel);
        }
        Ok((ok, read_back))
    }

    /// Sets the RX frequency of a channel. `freq_hz` must be a multiple of
    /// [`RADIO_FREQ_STEP_HZ`].
    ///
    /// [`RADIO_FREQ_STEP_HZ`]: constant.RADIO_FREQ_STEP_HZ.html
    pub fn set_rx_freq<S: SerialPort, K: Clock>(
        &mut self,
        serial: &mut S,
        clock: &K,
        channel: u8,
        freq_hz: u32,
    ) -> Result<Exchange, Error> {
        if !self.check_channel_freq(channel, freq_hz) {
            return Ok((false, Vec::new()));
        }
        let args = codec::freq_args(channel, freq_hz);
        let (ok, _, read_back) =
            self.exchange(serial, clock, Opcode::SetRxFreq, &args, self.retries)?;
        if ok {
            self.channels.update(channel, |e| e.rx_freq_hz = freq_hz);
        }
        Ok((ok, read_back))
    }

    /// Sets the TX frequency of a channel. `freq_hz` must be a multiple of
    /// [`RADIO_FREQ_STEP_HZ`].
    ///
    /// [`RADIO_FREQ_STEP_HZ`]: constant.RADIO_FREQ_STEP_HZ.html
    pub fn set_tx_freq<S: SerialPort, K: Clock>(
        &mut self,
        serial: &mut S,
        clock: &K,
        channel: u8,
        freq_hz: u32,
    ) -> Result<Exchange, Error> {
        if !self.check_channel_freq(channel, freq_hz) {
            return Ok((false, Vec::new()));
        }
        let args = codec::freq_args(channel, freq_hz);
        let (ok, _, read_back) =
            self.exchange(serial, clock, Opcode::SetTxFreq, &args, self.retries)?;
        if ok {
            self.channels.update(channel, |e| e.tx_freq_hz = freq_hz);
        }
        Ok((ok, read_back))
    }

    /// Programs a complete channel record (RX freq, TX freq, bandwidth).
    pub fn add_channel<S: SerialPort, K: Clock>(
        &mut self,
        serial: &mut S,
        clock: &K,
        channel: u8,
        rx_freq_hz: u32,
        tx_freq_hz: u32,
        bandwidth_hz: u32,
    ) -> Result<Exchange, Error> {
        if !self.check_channel_freq(channel, rx_freq_hz)
            || !self.check_channel_freq(channel, tx_freq_hz)
        {
            return Ok((false, Vec::new()));
        }
        let args = codec::add_channel_args(channel, rx_freq_hz, tx_freq_hz, bandwidth_hz);
        let (ok, _, read_back) =
            self.exchange(serial, clock, Opcode::AddChannel, &args, self.retries)?;
        if ok {
            self.channels.set(
                channel,
                ChannelEntry {
                    rx_freq_hz,
                    tx_freq_hz,
                    bandwidth_hz,
                },
            );
        }
        Ok((ok, read_back))
    }

    fn check_channel_freq(&self, channel: u8, freq_hz: u32) -> bool {
        if !valid_channel(channel) {
            warn!("rejecting channel {} (must be 1..={})", channel, MAX_CHANNELS);
            return false;
        }
        if !valid_freq(freq_hz) {
            warn!(
                "rejecting frequency {} Hz (must be a multiple of {} Hz)",
                freq_hz, RADIO_FREQ_STEP_HZ
            );
            return false;
        }
        true
    }

    /// Writes a command frame and polls for its response, retrying on
    /// timeout. Returns whether a valid response arrived, the response args
    /// if so, and everything read off the line while waiting.
    fn exchange<S: SerialPort, K: Clock>(
        &self,
        serial: &mut S,
        clock: &K,
        opcode: Opcode,
        args: &[u8],
        retries: u32,
    ) -> Result<(bool, Option<Vec<u8>>, Vec<u8>), Error> {
        let frame = codec::build(opcode, args);
        let tag = opcode.response_tag();
        let arg_len = opcode.response_arg_len();

        let mut read_back = Vec::new();
        for attempt in 0..retries.max(1) {
            if attempt == 0 {
                info!("sending radio command: {}", to_hex(&frame));
            } else {
                info!("sending radio command (try {}): {}", attempt + 1, to_hex(&frame));
            }
            serial.write(&frame)?;
            serial.flush()?;

            let deadline = clock.now() + to_chrono(self.response_timeout);
            while clock.now() < deadline {
                let available = serial.bytes_available()?;
                if available > 0 {
                    let data = serial.read(available)?;
                    debug!("radio response bytes: {}", to_hex(&data));
                    read_back.extend_from_slice(&data);
                    let (ok, resp_args) = codec::parse_response(&read_back, tag, arg_len);
                    if ok {
                        return Ok((true, Some(resp_args), read_back));
                    }
                }
                clock.sleep(RESPONSE_POLL_INTERVAL);
            }
            clock.sleep(self.retry_delay);
        }

        warn!(
            "no valid response to {:?} after {} attempts",
            opcode,
            retries.max(1)
        );
        Ok((false, None, read_back))
    }
}

impl Default for RadioController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::serial::TestSerial;

    fn harness() -> (RadioController, TestSerial, MockClock) {
        (RadioController::new(), TestSerial::new(Vec::new()), MockClock::fixed())
    }

    #[test]
    fn set_channel_accepts_valid_response() {
        let (mut radio, mut ser, clock) = harness();
        ser.on("^0103..(..)00$", b"\x01\x83\x00\x7c");
        let (ok, read_back) = radio.set_channel(&mut ser, &clock, 1, 2).unwrap();
        assert!(ok);
        assert_eq!(read_back, b"\x01\x83\x00\x7c".to_vec());
        assert_eq!(radio.active_channel(), Some(1));
        assert_eq!(ser.writes(), &[codec::build(Opcode::SetChannel, &[1])]);
    }

    #[test]
    fn set_channel_rejects_out_of_range() {
        let (mut radio, mut ser, clock) = harness();
        let (ok, read_back) = radio.set_channel(&mut ser, &clock, 33, 2).unwrap();
        assert!(!ok);
        assert!(read_back.is_empty());
        assert!(ser.writes().is_empty());
    }

    #[test]
    fn freq_must_be_step_multiple() {
        let (mut radio, mut ser, clock) = harness();
        let (ok, read_back) = radio.set_rx_freq(&mut ser, &clock, 2, 435_550_001).unwrap();
        assert!(!ok);
        assert!(read_back.is_empty());
        assert!(ser.writes().is_empty());
    }

    #[test]
    fn freq_command_retries_then_gives_up() {
        let (mut radio, mut ser, clock) = harness();
        let (ok, _) = radio.set_rx_freq(&mut ser, &clock, 2, 435_556_250).unwrap();
        assert!(!ok);
        // one write per attempt, all carrying the BE-encoded frequency
        assert_eq!(ser.writes().len(), DEFAULT_RETRIES as usize);
        let frame = &ser.writes()[0];
        assert_eq!(frame[3..7], [0x19, 0xf6, 0x0f, 0x9a]);
    }

    #[test]
    fn dealer_mode_checks_status_byte() {
        let (mut radio, mut ser, clock) = harness();
        // status 0x01 instead of 0x00: checksum over c4 01 is !(0xc5) = 0x3a
        ser.on("^014401ba00$", b"\x01\xc4\x01\x3a");
        let (ok, _) = radio.enter_command_mode(&mut ser, &clock, true).unwrap();
        assert!(!ok);
    }

    #[test]
    fn add_channel_tracks_table() {
        let (mut radio, mut ser, clock) = harness();
        // add-channel response: tag f0, status 00, checksum !(0xf0) = 0x0f
        ser.on("^0170", b"\x01\xf0\x00\x0f");
        let (ok, _) = radio
            .add_channel(&mut ser, &clock, 4, 435_562_500, 435_562_500, 12_500)
            .unwrap();
        assert!(ok);
        assert_eq!(
            radio.channels().get(4),
            Some(ChannelEntry {
                rx_freq_hz: 435_562_500,
                tx_freq_hz: 435_562_500,
                bandwidth_hz: 12_500,
            })
        );
    }
}
