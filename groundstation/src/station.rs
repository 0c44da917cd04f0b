//! The station state machine and cooperative main loop.
//!
//! A single loop thread owns every mutation: it pulls bytes off the serial
//! line, extracts and publishes packets, transmits queued uplink commands,
//! and walks the Doppler correction schedule. External surfaces (the
//! interactive prompt) talk to the loop through a [`ControlRequest`]
//! channel that is polled once per tick, so no state is ever shared.
//!
//! Each loop phase returns its own result and the loop carries on after
//! logging a failure; only startup errors abort. The loop itself exits when
//! a [`ControlRequest::Shutdown`] arrives or the control channel closes.
//!
//! [`ControlRequest`]: enum.ControlRequest.html
//! [`ControlRequest::Shutdown`]: enum.ControlRequest.html#variant.Shutdown

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::bytes::{from_hex, to_hex};
use crate::clock::Clock;
use crate::config::{Config, StationConfig};
use crate::doppler::{self, Correction};
use crate::fec;
use crate::framing::RxBuffer;
use crate::radio::{self, RadioController};
use crate::serial::SerialPort;
use crate::sink::{PacketRecord, PacketSink};
use crate::telemetry;
use crate::tracking::{PassData, PassPredictor};
use crate::uplink::{Uplink, UplinkCatalog};
use crate::Error;
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Pause at the end of every loop iteration.
pub const LOOP_TICK: Duration = Duration::from_millis(500);

/// One orbital period of the tracked satellite, seconds.
pub const ORBITAL_PERIOD_S: i64 = 5580;

/// Nominal interval between satellite transmissions, seconds.
pub const PACKET_SEND_FREQ_S: i64 = 20;

/// Interval of the safety-net packet rescan, seconds.
pub const PERIODIC_PACKET_SCAN_FREQ_S: i64 = 120;

/// Back-off before retrying a failed pass update, seconds.
pub const DOPPLER_FAIL_RETRY_DELAY_S: i64 = 72;

/// Bandwidth programmed into the Doppler ladder channels.
pub const DEFAULT_CHANNEL_BW_HZ: u32 = 12_500;

/// Retries for the time-pressed mid-pass channel switch.
const ACTIVATE_RETRIES: u32 = 2;

/// Flush the raw receive dump once 10 bytes (20 hex chars) are buffered.
/// Small, because unflushed capture is lost capture.
const RX_DUMP_FLUSH_THRESHOLD: usize = 20;

/// Mutations and queries submitted to the loop thread by a control surface.
///
/// Snapshot requests carry a reply channel; the loop responds between
/// iterations.
pub enum ControlRequest {
    /// Change the global log level.
    SetLogLevel(log::LevelFilter),
    /// Request a status snapshot.
    Status(Sender<StatusReport>),
    /// Request a snapshot of the uplink queue.
    TxQueue(Sender<TxQueueReport>),
    /// Request the current contents of the receive buffer.
    RxBuffer(Sender<String>),
    /// Enqueue an uplink command; with `immediate`, the loop transmits on
    /// every iteration instead of waiting for a downlink packet. Replies
    /// with whether the name was valid.
    QueueUplink {
        name: String,
        immediate: bool,
        reply: Sender<bool>,
    },
    /// Remove a queued uplink command (first occurrence, or all). Replies
    /// with whether anything was removed.
    CancelUplink {
        name: String,
        all: bool,
        reply: Sender<bool>,
    },
    /// Stop the loop.
    Shutdown,
}

/// Hooks fired at the edges of a pass.
///
/// Auxiliary equipment (antenna rotators, SDR recorders) implements this and
/// registers with [`Station::set_pass_handler`]; the station never needs to
/// be wrapped or subclassed. Hooks run on the loop thread, so they must be
/// quick.
///
/// [`Station::set_pass_handler`]: struct.Station.html#method.set_pass_handler
pub trait PassHandler {
    /// A pass has been targeted: its schedule is armed and the radio sits on
    /// the pre-pass channel.
    fn on_pass(&mut self, _pass: &PassData) {}

    /// The pass schedule has been fully played out (or abandoned).
    fn after_pass(&mut self, _pass: &PassData) {}
}

/// Point-in-time view of the station, taken by the loop thread.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub station_name: String,
    pub station_lat: f64,
    pub station_lon: f64,
    pub station_alt: f64,
    pub last_data_rx: Option<DateTime<Utc>>,
    pub last_packet_rx: Option<DateTime<Utc>>,
    pub update_pass_data_time: DateTime<Utc>,
    pub ready_for_pass: bool,
    pub current_channel: u8,
    pub next_pass: Option<PassData>,
    pub upcoming_corrections: Vec<Correction>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "station: {} ({:.4} deg, {:.4} deg, {:.0} m)",
            self.station_name, self.station_lat, self.station_lon, self.station_alt
        )?;
        writeln!(f, "last data rx:          {:?}", self.last_data_rx)?;
        writeln!(f, "last packet rx:        {:?}", self.last_packet_rx)?;
        writeln!(f, "update pass data time: {}", self.update_pass_data_time)?;
        writeln!(f, "ready for pass:        {}", self.ready_for_pass)?;
        writeln!(f, "current channel:       {}", self.current_channel)?;
        writeln!(f, "upcoming corrections:\n{}", format_schedule(&self.upcoming_corrections))?;
        match &self.next_pass {
            Some(pass) => write!(f, "next pass:\n{}", pass),
            None => write!(f, "next pass: unknown"),
        }
    }
}

/// Snapshot of the uplink queue.
#[derive(Debug, Clone, Serialize)]
pub struct TxQueueReport {
    pub queue: Vec<String>,
    /// Whether the head command transmits continuously.
    pub immediate: bool,
}

fn format_schedule(corrections: &[Correction]) -> String {
    let mut out = String::new();
    for c in corrections {
        out.push_str(&format!(
            "{:+7.2} kHz (ch {}) \t: {}\n",
            c.offset_hz / 1.0e3,
            c.channel,
            c.time.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    out
}

/// Append-only dump of everything read off the serial line, as hex text.
struct RxDump {
    file: fs::File,
    pending: String,
}

impl RxDump {
    fn open(path: &Path) -> Result<Self, Error> {
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            pending: String::new(),
        })
    }

    fn append(&mut self, hex: &str) -> Result<(), Error> {
        self.pending.push_str(hex);
        if self.pending.len() > RX_DUMP_FLUSH_THRESHOLD {
            self.file.write_all(self.pending.as_bytes())?;
            self.file.flush()?;
            self.pending.clear();
        }
        Ok(())
    }
}

impl Drop for RxDump {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            let _ = self.file.write_all(self.pending.as_bytes());
            let _ = self.file.flush();
        }
    }
}

/// The groundstation.
///
/// Owns the serial device, the receive buffer, the uplink queue and the
/// pass-correction schedule. Construct it with the platform services named
/// by a [`Config`] implementation, then call [`run`] on a dedicated thread
/// (or [`step`] directly for finer control).
///
/// [`Config`]: ../config/trait.Config.html
/// [`run`]: #method.run
/// [`step`]: #method.step
pub struct Station<C: Config> {
    config: StationConfig,
    clock: C::Clock,
    serial: C::Serial,
    predictor: C::Predictor,
    sink: C::Sink,
    radio: RadioController,
    uplink: Uplink,
    pass_handler: Option<Box<dyn PassHandler + Send>>,

    rx_buf: RxBuffer,
    rx_dump: Option<RxDump>,
    received_packets: Vec<String>,
    tx_queue: VecDeque<String>,
    only_send_tx_cmd: bool,

    last_data_rx: Option<DateTime<Utc>>,
    last_packet_rx: Option<DateTime<Utc>>,
    next_pass: Option<PassData>,
    schedule: Vec<Correction>,
    schedule_index: usize,
    ready_for_pass: bool,
    update_pass_data_time: DateTime<Utc>,
    next_packet_scan_time: DateTime<Utc>,
    current_channel: u8,
}

impl<C: Config> Station<C> {
    /// Creates a station. Fails only on startup I/O (the rx dump file).
    pub fn new(
        config: StationConfig,
        clock: C::Clock,
        serial: C::Serial,
        predictor: C::Predictor,
        sink: C::Sink,
        catalog: UplinkCatalog,
    ) -> Result<Self, Error> {
        let rx_dump = match &config.rx_dump_path {
            Some(path) => Some(RxDump::open(path)?),
            None => None,
        };
        let now = clock.now();
        let uplink = Uplink::new(catalog, config.tx_disabled);
        Ok(Self {
            config,
            clock,
            serial,
            predictor,
            sink,
            radio: RadioController::new(),
            uplink,
            pass_handler: None,
            rx_buf: RxBuffer::new(),
            rx_dump,
            received_packets: Vec::new(),
            tx_queue: VecDeque::new(),
            only_send_tx_cmd: false,
            last_data_rx: None,
            last_packet_rx: None,
            next_pass: None,
            schedule: Vec::new(),
            schedule_index: 0,
            ready_for_pass: false,
            // first iteration performs the initial pass update
            update_pass_data_time: now,
            next_packet_scan_time: now,
            current_channel: 1,
        })
    }

    /// Registers the hooks to run at the edges of each pass.
    pub fn set_pass_handler(&mut self, handler: Box<dyn PassHandler + Send>) {
        self.pass_handler = Some(handler);
    }

    /// Runs the loop until shutdown is requested (or the control surface
    /// goes away).
    pub fn run(&mut self, control: &Receiver<ControlRequest>) {
        info!(
            "starting station '{}' tracking NORAD {}",
            self.config.station_name, self.config.norad_id
        );
        loop {
            if self.handle_control(control) {
                info!("station loop shutting down");
                return;
            }
            self.step();
            self.clock.sleep(LOOP_TICK);
        }
    }

    /// Executes one loop iteration: receive, transmit, Doppler-correct,
    /// periodic rescan, publish.
    pub fn step(&mut self) {
        let got_packet = match self.receive() {
            Ok(got) => got,
            Err(e) => {
                error!("receive failed: {}", e);
                false
            }
        };

        if got_packet || self.only_send_tx_cmd {
            if let Err(e) = self.transmit() {
                error!("transmit failed: {}", e);
            }
        }

        self.correct_for_doppler();

        if self.clock.now() >= self.next_packet_scan_time {
            self.scan_for_packets();
            self.next_packet_scan_time =
                self.clock.now() + chrono::Duration::seconds(PERIODIC_PACKET_SCAN_FREQ_S);
        }

        self.publish_received_packets();
    }

    /// Programs the Doppler ladder into the radio: channel 1 at the base
    /// carrier and channels 2..=7 at {±1, ±2, ±3} frequency steps.
    ///
    /// Requires dealer access and ends with a nonvolatile commit. Run once
    /// per radio, before normal operation.
    pub fn preconfigure_radio(&mut self) -> Result<bool, Error> {
        info!("preconfiguring radio channels...");
        let base = self.config.base_freq_hz;

        let (enter_ok, rx) = self.radio.enter_command_mode(&mut self.serial, &self.clock, true)?;
        self.push_rx_bytes(&rx);
        let (base_ok, rx) = self.radio.add_channel(
            &mut self.serial,
            &self.clock,
            1,
            base,
            base,
            DEFAULT_CHANNEL_BW_HZ,
        )?;
        self.push_rx_bytes(&rx);

        let mut ladder_ok = true;
        let mut channel = 2;
        for step in 1..=3u32 {
            let shift = step * radio::RADIO_FREQ_STEP_HZ;
            let freq_in = base + shift;
            let freq_out = base - shift;
            info!(
                "setting channels {} -> {} to {:.6} -> {:.6} MHz",
                channel,
                channel + 1,
                f64::from(freq_in) / 1e6,
                f64::from(freq_out) / 1e6
            );
            let (in_ok, rx) = self.radio.add_channel(
                &mut self.serial,
                &self.clock,
                channel,
                freq_in,
                freq_in,
                DEFAULT_CHANNEL_BW_HZ,
            )?;
            self.push_rx_bytes(&rx);
            let (out_ok, rx) = self.radio.add_channel(
                &mut self.serial,
                &self.clock,
                channel + 1,
                freq_out,
                freq_out,
                DEFAULT_CHANNEL_BW_HZ,
            )?;
            self.push_rx_bytes(&rx);
            channel += 2;
            ladder_ok = ladder_ok && in_ok && out_ok;
        }

        let (program_ok, rx) = self.radio.program_settings(&mut self.serial, &self.clock)?;
        self.push_rx_bytes(&rx);
        let (exit_ok, rx) =
            self.radio
                .exit_command_mode(&mut self.serial, &self.clock, radio::DEFAULT_RETRIES)?;
        self.push_rx_bytes(&rx);

        let okay = enter_ok && base_ok && ladder_ok && program_ok && exit_ok;
        info!(
            "preconfigured radio channels: {}",
            if okay { "success" } else { "FAILURE" }
        );
        Ok(okay)
    }

    //////////////////////////////////////////////////////////////////
    // Loop phases
    //////////////////////////////////////////////////////////////////

    /// Pulls all pending bytes into the receive buffer and scans for
    /// packets. Returns whether a packet was found.
    fn receive(&mut self) -> Result<bool, Error> {
        let available = self.serial.bytes_available()?;
        if available == 0 {
            return Ok(false);
        }
        let data = self.serial.read(available)?;
        if data.is_empty() {
            return Ok(false);
        }
        self.push_rx_bytes(&data);
        self.last_data_rx = Some(self.clock.now());

        // All of the above may have completed a packet.
        Ok(self.scan_for_packets())
    }

    /// Attempts the uplink command at the head of the queue. A command whose
    /// response never arrives goes back to the head for a later attempt.
    fn transmit(&mut self) -> Result<(), Error> {
        let name = match self.tx_queue.pop_front() {
            Some(name) => name,
            None => return Ok(()),
        };
        info!("SENDING UPLINK COMMAND: {}", name);

        let (got_response, read_back) =
            match self.uplink.send(&mut self.serial, &self.clock, &name) {
                Ok(outcome) => outcome,
                Err(Error::Catalog(msg)) => {
                    // only reachable if the catalog changed under us; drop it
                    error!("dropping unsendable uplink command: {}", msg);
                    return Ok(());
                }
                Err(e) => {
                    self.tx_queue.push_front(name);
                    return Err(e);
                }
            };
        self.push_rx_bytes(&read_back);

        info!("uplink command success: {}", got_response);
        debug!("full uplink response: {} bytes", read_back.len());

        // the read-back may have contained a packet
        self.scan_for_packets();

        if got_response {
            if self.tx_queue.is_empty() {
                self.only_send_tx_cmd = false;
            }
        } else {
            self.tx_queue.push_front(name);
        }
        Ok(())
    }

    /// Walks the Doppler state machine one step.
    ///
    /// Not ready: once the update deadline passes, compute the next pass,
    /// build its schedule and activate the pre-pass channel; on failure fall
    /// back to the uncorrected channel and retry after a bounded delay.
    /// Ready: activate the next schedule entry once its (interlace-adjusted)
    /// time arrives; after the last entry, arm the update for half an orbit
    /// past the peak.
    fn correct_for_doppler(&mut self) -> bool {
        if self.ready_for_pass {
            self.interlace_with_tx_times();
        }

        let now = self.clock.now();
        if !self.ready_for_pass && now >= self.update_pass_data_time {
            if self.update_radio_for_pass() {
                self.ready_for_pass = true;
                self.update_pass_data_time =
                    self.clock.now() + chrono::Duration::seconds(ORBITAL_PERIOD_S);
                if let (Some(handler), Some(pass)) = (&mut self.pass_handler, &self.next_pass) {
                    handler.on_pass(pass);
                }
                true
            } else {
                self.update_pass_data_time =
                    self.clock.now() + chrono::Duration::seconds(DOPPLER_FAIL_RETRY_DELAY_S);
                false
            }
        } else if self.ready_for_pass {
            if self.schedule.is_empty() {
                error!("no doppler correction data, finishing this pass");
                self.move_on_to_next_pass();
                return false;
            }
            if self.schedule_index >= self.schedule.len() {
                warn!(
                    "doppler correction index ({}) past schedule end, finishing this pass",
                    self.schedule_index
                );
                self.move_on_to_next_pass();
                return false;
            }

            if now >= self.schedule[self.schedule_index].time {
                let good = self.activate_correction(self.schedule_index);
                if good {
                    self.schedule_index += 1;
                    if self.schedule_index >= self.schedule.len() {
                        self.move_on_to_next_pass();
                    }
                }
                return good;
            }
            false
        } else {
            false
        }
    }

    /// Shifts the next planned channel switch to the midpoint between
    /// expected packet arrivals, so retuning never clips a receive window.
    ///
    /// Keys off the last *verified packet* time: a burst of line noise must
    /// not drag the correction around.
    fn interlace_with_tx_times(&mut self) {
        let epoch = match self.last_packet_rx {
            Some(epoch) => epoch,
            None => return,
        };
        if self.schedule_index >= self.schedule.len() {
            return;
        }
        let next_time = self.schedule[self.schedule_index].time;

        let period_ms = PACKET_SEND_FREQ_S * 1000;
        let remainder_ms = (next_time - epoch).num_milliseconds().rem_euclid(period_ms);
        let correction_ms = period_ms / 2 - remainder_ms;
        if correction_ms != 0 {
            self.schedule[self.schedule_index].time =
                next_time + chrono::Duration::milliseconds(correction_ms);
            debug!(
                "shifted doppler correction by {:.2}s to dodge packet arrivals",
                correction_ms as f64 / 1000.0
            );
        }
    }

    //////////////////////////////////////////////////////////////////
    // Receive/decode helpers
    //////////////////////////////////////////////////////////////////

    fn push_rx_bytes(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.rx_buf.push_bytes(data);
        if let Some(dump) = &mut self.rx_dump {
            if let Err(e) = dump.append(&to_hex(data)) {
                error!("rx dump write failed: {}", e);
            }
        }
    }

    /// Extracts complete packets from the receive buffer, stamping the
    /// packet-rx time and queueing them for publication.
    fn scan_for_packets(&mut self) -> bool {
        debug!("reading buffer of size {} for packets", self.rx_buf.len());
        let (frames, _dropped) = self.rx_buf.scan();
        if frames.is_empty() {
            return false;
        }
        info!("found {} packets in buffer", frames.len());
        self.last_packet_rx = self.last_data_rx;
        self.received_packets.extend(frames);
        true
    }

    /// Corrects and publishes everything received since the last call.
    fn publish_received_packets(&mut self) {
        if self.received_packets.is_empty() {
            return;
        }
        for raw in std::mem::take(&mut self.received_packets) {
            info!("GOT PACKET: correcting & publishing...");
            let record = match fec::correct_packet(&raw) {
                Ok(corrected) => {
                    let parsed = match from_hex(&corrected)
                        .and_then(|bytes| telemetry::parse_preamble(&bytes))
                    {
                        Ok(preamble) => Some(preamble),
                        Err(e) => {
                            error!("error parsing corrected packet: {}", e);
                            None
                        }
                    };
                    PacketRecord {
                        raw,
                        corrected,
                        parsed,
                        errors_corrected: true,
                        error: None,
                        station_name: self.config.station_name.clone(),
                    }
                }
                Err(e) => PacketRecord {
                    raw,
                    corrected: String::new(),
                    parsed: None,
                    errors_corrected: false,
                    error: Some(e.to_string()),
                    station_name: self.config.station_name.clone(),
                },
            };
            if let Err(e) = self.sink.publish(&record) {
                error!("error publishing packet: {}", e);
            }
        }
    }

    //////////////////////////////////////////////////////////////////
    // Doppler/radio helpers
    //////////////////////////////////////////////////////////////////

    /// Refreshes pass data and rebuilds the correction schedule.
    fn update_pass_data(&mut self) -> bool {
        if let Err(e) = self.predictor.update_tle() {
            error!("error updating TLE data to latest: {}", e);
        }

        let now = self.clock.now();
        match self.predictor.next_pass(now) {
            None => {
                error!("error retrieving next pass data");
                self.schedule.clear();
                self.schedule_index = 0;
                false
            }
            Some(pass) => {
                let mut schedule =
                    doppler::plan(&self.predictor, &pass, f64::from(self.config.base_freq_hz));
                // the pre-pass entry is activated right away
                schedule[0].time = now;
                info!(
                    "TARGETED NEW PASS:\n{}\ndoppler corrections:\n{}",
                    pass,
                    format_schedule(&schedule)
                );
                self.next_pass = Some(pass);
                self.schedule = schedule;
                self.schedule_index = 0;
                true
            }
        }
    }

    /// Pass update plus activation of the first schedule entry. On a failed
    /// update the receiver falls back to the uncorrected channel so it keeps
    /// listening; the stale pass data is kept for timing.
    fn update_radio_for_pass(&mut self) -> bool {
        let data_good = self.update_pass_data();
        if !data_good {
            warn!("falling back to zero doppler correction");
            self.schedule = vec![Correction::at(self.clock.now(), 0.0)];
            self.schedule_index = 0;
        }

        let activate_good = self.activate_correction(self.schedule_index);
        if activate_good {
            self.schedule_index = 1;
        }
        info!(
            "UPDATED FOR NEXT PASS: | pass data: {} | activating freqs: {} |",
            data_good, activate_good
        );
        data_good && activate_good
    }

    /// Applies the channel switch of one schedule entry.
    fn activate_correction(&mut self, index: usize) -> bool {
        let correction = self.schedule[index];
        self.current_channel = correction.channel;

        let mut read_back = Vec::new();
        let run = |result: Result<(bool, Vec<u8>), Error>, read_back: &mut Vec<u8>| match result {
            Ok((ok, rx)) => {
                read_back.extend_from_slice(&rx);
                ok
            }
            Err(e) => {
                error!("radio exchange failed: {}", e);
                false
            }
        };

        let enter_ok = run(
            self.radio
                .enter_command_mode(&mut self.serial, &self.clock, false),
            &mut read_back,
        );
        let channel_ok = run(
            self.radio.set_channel(
                &mut self.serial,
                &self.clock,
                correction.channel,
                ACTIVATE_RETRIES,
            ),
            &mut read_back,
        );
        let exit_ok = run(
            self.radio
                .exit_command_mode(&mut self.serial, &self.clock, ACTIVATE_RETRIES),
            &mut read_back,
        );

        // No packet scan here: mid-pass we are pressed for time. The bytes
        // still land in the buffer for the next scan.
        self.push_rx_bytes(&read_back);

        let good = enter_ok && channel_ok && exit_ok;
        info!(
            "ADJUSTED FOR DOPPLER ({}/{} => {:+.2} kHz): {}",
            index + 1,
            self.schedule.len(),
            correction.offset_hz / 1.0e3,
            if good { "success" } else { "FAILURE" }
        );
        good
    }

    /// Marks the pass finished and arms the next update for half an orbit
    /// past the peak (or past now, whichever is later; bad pass data must
    /// not trap us in an update loop).
    fn move_on_to_next_pass(&mut self) {
        self.ready_for_pass = false;
        if let (Some(handler), Some(pass)) = (&mut self.pass_handler, &self.next_pass) {
            handler.after_pass(pass);
        }
        let half_orbit = chrono::Duration::seconds(ORBITAL_PERIOD_S / 2);
        let now = self.clock.now();
        let from_peak = self
            .next_pass
            .as_ref()
            .map(|pass| pass.max_alt_time + half_orbit)
            .unwrap_or(now + half_orbit);
        self.update_pass_data_time = from_peak.max(now + half_orbit);
    }

    //////////////////////////////////////////////////////////////////
    // Control surface
    //////////////////////////////////////////////////////////////////

    /// Drains pending control requests. Returns `true` when the loop should
    /// stop.
    fn handle_control(&mut self, control: &Receiver<ControlRequest>) -> bool {
        loop {
            match control.try_recv() {
                Ok(request) => {
                    if self.handle_request(request) {
                        return true;
                    }
                }
                Err(TryRecvError::Empty) => return false,
                // surface gone; nothing can ever stop us cleanly, so stop now
                Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    fn handle_request(&mut self, request: ControlRequest) -> bool {
        match request {
            ControlRequest::SetLogLevel(level) => {
                log::set_max_level(level);
                info!("log level set to {}", level);
            }
            ControlRequest::Status(reply) => {
                let _ = reply.send(self.status_report());
            }
            ControlRequest::TxQueue(reply) => {
                let _ = reply.send(TxQueueReport {
                    queue: self.tx_queue.iter().cloned().collect(),
                    immediate: self.only_send_tx_cmd,
                });
            }
            ControlRequest::RxBuffer(reply) => {
                let _ = reply.send(self.rx_buf.as_str().to_string());
            }
            ControlRequest::QueueUplink {
                name,
                immediate,
                reply,
            } => {
                let valid = self.uplink.catalog().is_valid(&name);
                if valid {
                    info!(
                        "uplink command{} queued: {}",
                        if immediate { " (immediate)" } else { "" },
                        name
                    );
                    self.tx_queue.push_back(name);
                    if immediate {
                        self.only_send_tx_cmd = true;
                    }
                }
                let _ = reply.send(valid);
            }
            ControlRequest::CancelUplink { name, all, reply } => {
                let before = self.tx_queue.len();
                if all {
                    self.tx_queue.retain(|queued| queued != &name);
                } else if let Some(at) = self.tx_queue.iter().position(|queued| queued == &name) {
                    self.tx_queue.remove(at);
                }
                let found = self.tx_queue.len() < before;
                if self.tx_queue.is_empty() {
                    self.only_send_tx_cmd = false;
                }
                let _ = reply.send(found);
            }
            ControlRequest::Shutdown => return true,
        }
        false
    }

    /// Builds a status snapshot.
    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            station_name: self.config.station_name.clone(),
            station_lat: self.config.station_lat,
            station_lon: self.config.station_lon,
            station_alt: self.config.station_alt,
            last_data_rx: self.last_data_rx,
            last_packet_rx: self.last_packet_rx,
            update_pass_data_time: self.update_pass_data_time,
            ready_for_pass: self.ready_for_pass,
            current_channel: self.current_channel,
            next_pass: self.next_pass.clone(),
            upcoming_corrections: self.schedule[self.schedule_index.min(self.schedule.len())..]
                .to_vec(),
        }
    }

    /// Direct access to the serial device, for test setups that inject
    /// traffic after construction. The loop thread owns the station, so
    /// going through this from another thread is not possible by
    /// construction.
    pub fn serial_mut(&mut self) -> &mut C::Serial {
        &mut self.serial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::serial::TestSerial;
    use crate::sink::LogSink;
    use crate::tracking::PassData;
    use chrono::TimeZone;

    struct TestPredictor {
        pass: Option<PassData>,
        threshold_times: Vec<(f64, Option<DateTime<Utc>>)>,
    }

    impl PassPredictor for TestPredictor {
        fn update_tle(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn next_pass(&mut self, _start: DateTime<Utc>) -> Option<PassData> {
            self.pass.clone()
        }

        fn doppler_factor(&self, _at: DateTime<Utc>) -> f64 {
            0.0
        }

        fn doppler_threshold_times(
            &self,
            _thresholds: &[f64],
            _pass: &PassData,
            _base_hz: f64,
        ) -> Vec<(f64, Option<DateTime<Utc>>)> {
            self.threshold_times.clone()
        }
    }

    struct TestConfig;

    impl Config for TestConfig {
        type Clock = MockClock;
        type Serial = TestSerial;
        type Predictor = TestPredictor;
        type Sink = LogSink;
    }

    fn station_config() -> StationConfig {
        StationConfig {
            station_name: "test".into(),
            station_secret: "secret".into(),
            station_lat: 41.826,
            station_lon: -71.403,
            station_alt: 50.0,
            tx_disabled: false,
            packet_email_recipients: Vec::new(),
            norad_id: 43550,
            base_freq_hz: 435_550_000,
            tle_path: "tle.txt".into(),
            rx_dump_path: None,
        }
    }

    fn catalog() -> UplinkCatalog {
        UplinkCatalog::from_reader("name,command\necho_cmd,ECHO_CMD\n".as_bytes()).unwrap()
    }

    fn radio_ready_serial() -> TestSerial {
        let mut ser = TestSerial::new(Vec::new());
        ser.on("^0103", b"\x01\x83\x00\x7c"); // set channel ack
        ser.on("^011d01e100$", b"\x01\x9d\x00\x62"); // warm reset ack
        ser
    }

    fn pass_at(rise: DateTime<Utc>) -> PassData {
        PassData {
            rise_time: rise,
            rise_azimuth_deg: 15.0,
            max_alt_time: rise + chrono::Duration::minutes(5),
            max_alt_deg: 55.0,
            set_time: rise + chrono::Duration::minutes(10),
            set_azimuth_deg: 230.0,
            rise_doppler_factor: 2.1e-5,
            set_doppler_factor: -2.1e-5,
        }
    }

    fn make_station(
        clock: MockClock,
        serial: TestSerial,
        predictor: TestPredictor,
    ) -> Station<TestConfig> {
        Station::<TestConfig>::new(
            station_config(),
            clock,
            serial,
            predictor,
            LogSink::new(),
            catalog(),
        )
        .unwrap()
    }

    #[test]
    fn interlace_centers_switch_between_arrivals() {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap());
        let epoch = clock.now();
        let predictor = TestPredictor {
            pass: None,
            threshold_times: Vec::new(),
        };
        let mut station = make_station(clock, TestSerial::new(Vec::new()), predictor);

        station.last_packet_rx = Some(epoch);
        station.schedule = vec![Correction::at(epoch + chrono::Duration::seconds(23), 0.0)];
        station.schedule_index = 0;

        station.interlace_with_tx_times();
        assert_eq!(
            station.schedule[0].time,
            epoch + chrono::Duration::seconds(30)
        );

        // already centered: a second run is a no-op
        station.interlace_with_tx_times();
        assert_eq!(
            station.schedule[0].time,
            epoch + chrono::Duration::seconds(30)
        );

        // invariant: distance to the grid midpoint is under half a period
        let rem = (station.schedule[0].time - epoch)
            .num_milliseconds()
            .rem_euclid(PACKET_SEND_FREQ_S * 1000);
        assert!((rem - PACKET_SEND_FREQ_S * 500).abs() < PACKET_SEND_FREQ_S * 500);
    }

    #[test]
    fn interlace_without_packet_epoch_is_a_noop() {
        let clock = MockClock::fixed();
        let at = clock.now() + chrono::Duration::seconds(23);
        let predictor = TestPredictor {
            pass: None,
            threshold_times: Vec::new(),
        };
        let mut station = make_station(clock, TestSerial::new(Vec::new()), predictor);
        station.schedule = vec![Correction::at(at, 0.0)];
        station.interlace_with_tx_times();
        assert_eq!(station.schedule[0].time, at);
    }

    #[test]
    fn pass_update_arms_schedule_and_orbital_deadline() {
        let clock = MockClock::fixed();
        let now = clock.now();
        let rise = now + chrono::Duration::minutes(20);
        let predictor = TestPredictor {
            pass: Some(pass_at(rise)),
            threshold_times: vec![
                (1.5 * doppler::FREQ_STEP_HZ, Some(rise + chrono::Duration::minutes(2))),
                (0.5 * doppler::FREQ_STEP_HZ, Some(rise + chrono::Duration::minutes(5))),
                (-0.5 * doppler::FREQ_STEP_HZ, Some(rise + chrono::Duration::minutes(8))),
                (-1.5 * doppler::FREQ_STEP_HZ, None),
            ],
        };
        let mut station = make_station(clock.clone(), radio_ready_serial(), predictor);

        assert!(station.correct_for_doppler());
        assert!(station.ready_for_pass);
        assert_eq!(station.schedule.len(), 4);
        assert_eq!(station.schedule_index, 1);
        assert_eq!(station.current_channel, 4); // pre-pass at +2 steps
        assert!(station.schedule_index <= station.schedule.len());
        assert_eq!(
            station.update_pass_data_time,
            clock.now() + chrono::Duration::seconds(ORBITAL_PERIOD_S)
        );
    }

    #[test]
    fn failed_pass_update_falls_back_and_backs_off() {
        let clock = MockClock::fixed();
        let predictor = TestPredictor {
            pass: None,
            threshold_times: Vec::new(),
        };
        let mut station = make_station(clock.clone(), radio_ready_serial(), predictor);

        assert!(!station.correct_for_doppler());
        assert!(!station.ready_for_pass);
        // receiver keeps listening on the uncorrected channel
        assert_eq!(station.current_channel, 1);
        assert_eq!(
            station.update_pass_data_time,
            clock.now() + chrono::Duration::seconds(DOPPLER_FAIL_RETRY_DELAY_S)
        );
    }

    #[test]
    fn schedule_advances_and_finishes_pass() {
        let clock = MockClock::fixed();
        let now = clock.now();
        let rise = now + chrono::Duration::minutes(20);
        let t1 = rise + chrono::Duration::minutes(4);
        let t2 = rise + chrono::Duration::minutes(6);
        let predictor = TestPredictor {
            pass: Some(pass_at(rise)),
            threshold_times: vec![
                (1.5 * doppler::FREQ_STEP_HZ, None),
                (0.5 * doppler::FREQ_STEP_HZ, Some(t1)),
                (-0.5 * doppler::FREQ_STEP_HZ, Some(t2)),
                (-1.5 * doppler::FREQ_STEP_HZ, None),
            ],
        };
        let mut station = make_station(clock.clone(), radio_ready_serial(), predictor);

        assert!(station.correct_for_doppler());
        assert_eq!(station.schedule.len(), 3);
        assert_eq!(station.schedule_index, 1);

        // nothing due yet
        assert!(!station.correct_for_doppler());
        assert_eq!(station.schedule_index, 1);

        clock.set(t1 + chrono::Duration::seconds(1));
        assert!(station.correct_for_doppler());
        assert_eq!(station.schedule_index, 2);
        assert_eq!(station.current_channel, 1);

        clock.set(t2 + chrono::Duration::seconds(1));
        assert!(station.correct_for_doppler());
        assert_eq!(station.schedule_index, 3);
        assert!(!station.ready_for_pass);

        // next update half an orbit past the peak
        let half_orbit = chrono::Duration::seconds(ORBITAL_PERIOD_S / 2);
        let expected = (pass_at(rise).max_alt_time + half_orbit).max(clock.now() + half_orbit);
        assert_eq!(station.update_pass_data_time, expected);
        assert!(station.schedule_index <= station.schedule.len());
    }

    #[test]
    fn pass_handler_hooks_fire() {
        struct Recorder(std::sync::Arc<std::sync::Mutex<Vec<&'static str>>>);

        impl PassHandler for Recorder {
            fn on_pass(&mut self, _pass: &PassData) {
                self.0.lock().unwrap().push("on");
            }

            fn after_pass(&mut self, _pass: &PassData) {
                self.0.lock().unwrap().push("after");
            }
        }

        let clock = MockClock::fixed();
        let rise = clock.now() + chrono::Duration::minutes(20);
        let predictor = TestPredictor {
            pass: Some(pass_at(rise)),
            threshold_times: Vec::new(),
        };
        let mut station = make_station(clock, radio_ready_serial(), predictor);
        let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        station.set_pass_handler(Box::new(Recorder(events.clone())));

        // targeting the pass fires on_pass
        assert!(station.correct_for_doppler());
        assert_eq!(*events.lock().unwrap(), ["on"]);

        // the single-entry schedule is already played out, so the next
        // iteration finishes the pass
        station.correct_for_doppler();
        assert_eq!(*events.lock().unwrap(), ["on", "after"]);
    }

    #[test]
    fn uplink_queue_control() {
        let clock = MockClock::fixed();
        let predictor = TestPredictor {
            pass: None,
            threshold_times: Vec::new(),
        };
        let mut station = make_station(clock, TestSerial::new(Vec::new()), predictor);

        let (tx, rx) = crossbeam_channel::bounded(1);
        station.handle_request(ControlRequest::QueueUplink {
            name: "echo_cmd".into(),
            immediate: true,
            reply: tx,
        });
        assert!(rx.try_recv().unwrap());
        assert!(station.only_send_tx_cmd);
        assert_eq!(station.tx_queue.len(), 1);

        let (tx, rx) = crossbeam_channel::bounded(1);
        station.handle_request(ControlRequest::QueueUplink {
            name: "warp_cmd".into(),
            immediate: false,
            reply: tx,
        });
        assert!(!rx.try_recv().unwrap());
        assert_eq!(station.tx_queue.len(), 1);

        let (tx, rx) = crossbeam_channel::bounded(1);
        station.handle_request(ControlRequest::CancelUplink {
            name: "echo_cmd".into(),
            all: true,
            reply: tx,
        });
        assert!(rx.try_recv().unwrap());
        assert!(station.tx_queue.is_empty());
        assert!(!station.only_send_tx_cmd);
    }

    #[test]
    fn rx_buffer_stays_bounded() {
        let clock = MockClock::fixed();
        let predictor = TestPredictor {
            pass: Some(pass_at(clock.now() + chrono::Duration::minutes(20))),
            threshold_times: Vec::new(),
        };
        let mut serial = radio_ready_serial();
        serial.set_max_available(4096);
        // junk forever, never a callsign
        let junk: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        for chunk in junk.chunks(64) {
            let mut b = chunk.to_vec();
            b.retain(|&x| x != b'W');
            serial.feed(&b);
        }
        let mut station = make_station(clock, serial, predictor);

        for _ in 0..10 {
            station.step();
            assert!(station.rx_buf.len() <= crate::framing::MAX_BUF_HEX);
        }
    }
}
