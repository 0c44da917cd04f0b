//! End-to-end receive-pipeline scenarios: bytes in on the (test) serial
//! line, corrected packets out at the sink.

use chrono::{DateTime, Utc};
use groundstation::bytes::to_hex;
use groundstation::clock::MockClock;
use groundstation::serial::TestSerial;
use groundstation::sink::{PacketRecord, PacketSink};
use groundstation::station::Station;
use groundstation::telemetry::SatelliteState;
use groundstation::tracking::{PassData, PassPredictor};
use groundstation::uplink::UplinkCatalog;
use groundstation::{fec, Config, Error, StationConfig};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct CaptureSink(Arc<Mutex<Vec<PacketRecord>>>);

impl PacketSink for CaptureSink {
    fn publish(&mut self, record: &PacketRecord) -> Result<(), String> {
        self.0.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// A predictor for a satellite that is nowhere near: one far-future pass,
/// no threshold crossings.
struct QuietPredictor;

impl PassPredictor for QuietPredictor {
    fn update_tle(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn next_pass(&mut self, start: DateTime<Utc>) -> Option<PassData> {
        let rise = start + chrono::Duration::hours(6);
        Some(PassData {
            rise_time: rise,
            rise_azimuth_deg: 20.0,
            max_alt_time: rise + chrono::Duration::minutes(5),
            max_alt_deg: 30.0,
            set_time: rise + chrono::Duration::minutes(10),
            set_azimuth_deg: 190.0,
            rise_doppler_factor: 2.0e-5,
            set_doppler_factor: -2.0e-5,
        })
    }

    fn doppler_factor(&self, _at: DateTime<Utc>) -> f64 {
        0.0
    }

    fn doppler_threshold_times(
        &self,
        thresholds: &[f64],
        _pass: &PassData,
        _base_hz: f64,
    ) -> Vec<(f64, Option<DateTime<Utc>>)> {
        thresholds.iter().map(|&t| (t, None)).collect()
    }
}

struct LoopConfig;

impl Config for LoopConfig {
    type Clock = MockClock;
    type Serial = TestSerial;
    type Predictor = QuietPredictor;
    type Sink = CaptureSink;
}

fn station_config() -> StationConfig {
    StationConfig {
        station_name: "loop-test".into(),
        station_secret: "secret".into(),
        station_lat: 41.826,
        station_lon: -71.403,
        station_alt: 50.0,
        tx_disabled: true,
        packet_email_recipients: Vec::new(),
        norad_id: 43550,
        base_freq_hz: 435_550_000,
        tle_path: "tle.txt".into(),
        rx_dump_path: None,
    }
}

fn make_station() -> (Station<LoopConfig>, CaptureSink, MockClock) {
    let clock = MockClock::fixed();
    let mut serial = TestSerial::new(Vec::new());
    serial.set_max_available(64);
    serial.on("^0103", b"\x01\x83\x00\x7c");
    serial.on("^011d01e100$", b"\x01\x9d\x00\x62");
    let sink = CaptureSink::default();
    let catalog = UplinkCatalog::from_reader("name,command\necho_cmd,ECHO_CMD\n".as_bytes()).unwrap();
    let station = Station::<LoopConfig>::new(
        station_config(),
        clock.clone(),
        serial,
        QuietPredictor,
        sink.clone(),
        catalog,
    )
    .unwrap();
    (station, sink, clock)
}

/// 217 data bytes opening with a parseable preamble.
fn sample_payload() -> Vec<u8> {
    let mut data = Vec::with_capacity(fec::DATA_LEN);
    data.extend_from_slice(&123_456u32.to_le_bytes());
    data.push(0x10); // state HelloWorld, message type Idle
    data.push(200);
    data.push(0);
    while data.len() < fec::DATA_LEN {
        data.push((data.len() % 251) as u8);
    }
    data
}

fn sample_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = b"WL9XZE".to_vec();
    frame.extend_from_slice(&fec::encode(data));
    assert_eq!(frame.len(), 255);
    frame
}

#[test]
fn clean_frame_is_extracted_corrected_and_published() {
    let (mut station, sink, _clock) = make_station();

    // first iteration arms the pass machinery before any traffic arrives
    station.step();
    assert!(sink.0.lock().unwrap().is_empty());

    let data = sample_payload();
    station.serial_mut().feed(&[0xaa]);
    station.serial_mut().feed(&sample_frame(&data));
    station.serial_mut().feed(&[0xff]);

    for _ in 0..20 {
        station.step();
    }

    let published = sink.0.lock().unwrap();
    assert_eq!(published.len(), 1, "expected exactly one publication");
    let record = &published[0];
    assert_eq!(record.raw.len(), 510);
    assert!(record.raw.starts_with("574c39585a45"));
    assert!(record.errors_corrected);
    assert!(record.error.is_none());

    let mut expected = to_hex(b"WL9XZE");
    expected.push_str(&to_hex(&data));
    assert_eq!(record.corrected, expected);

    let preamble = record.parsed.as_ref().expect("preamble should parse");
    assert_eq!(preamble.callsign, "WL9XZE");
    assert_eq!(preamble.timestamp, 123_456);
    assert_eq!(preamble.satellite_state, SatelliteState::HelloWorld);
}

#[test]
fn damaged_frame_is_corrected() {
    let (mut station, sink, _clock) = make_station();
    station.step();

    let data = sample_payload();
    let mut frame = sample_frame(&data);
    // flip a handful of payload bytes, well within the parity budget,
    // leaving the callsign tag intact
    for i in 0..10 {
        frame[20 + i * 7] ^= 0xa5;
    }
    station.serial_mut().feed(&frame);

    for _ in 0..20 {
        station.step();
    }

    let published = sink.0.lock().unwrap();
    assert_eq!(published.len(), 1);
    let record = &published[0];
    assert!(record.errors_corrected);
    let mut expected = to_hex(b"WL9XZE");
    expected.push_str(&to_hex(&data));
    assert_eq!(record.corrected, expected);
}

#[test]
fn hopeless_frame_is_published_uncorrected() {
    let (mut station, sink, _clock) = make_station();
    station.step();

    let data = sample_payload();
    let mut frame = sample_frame(&data);
    for byte in frame.iter_mut().skip(6).take(120) {
        *byte ^= 0xff;
    }
    station.serial_mut().feed(&frame);

    for _ in 0..20 {
        station.step();
    }

    let published = sink.0.lock().unwrap();
    assert_eq!(published.len(), 1);
    let record = &published[0];
    assert!(!record.errors_corrected);
    assert!(record.corrected.is_empty());
    assert!(record.parsed.is_none());
    assert!(record.error.is_some());
}

#[test]
fn two_frames_in_one_burst_both_publish() {
    let (mut station, sink, clock) = make_station();
    station.step();

    let data = sample_payload();
    let frame = sample_frame(&data);
    station.serial_mut().feed(&frame);
    station.serial_mut().feed(b"noise");
    station.serial_mut().feed(&frame);

    for _ in 0..30 {
        station.step();
        clock.advance(std::time::Duration::from_millis(500));
    }

    assert_eq!(sink.0.lock().unwrap().len(), 2);
}
