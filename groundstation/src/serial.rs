//! Byte-level serial port access.
//!
//! The station core never opens a device itself; it is handed something
//! implementing [`SerialPort`]. Reads are non-blocking: `read` returns
//! whatever is pending (possibly nothing), and callers poll
//! `bytes_available` between sleeps. No retries happen at this layer; every
//! error is surfaced to the caller.
//!
//! [`TestSerial`] is a drop-in double that replays a canned byte stream and
//! records writes, used both by the test suites and by the `--test` launch
//! mode of the frontend.
//!
//! [`SerialPort`]: trait.SerialPort.html
//! [`TestSerial`]: struct.TestSerial.html

use regex::Regex;

use crate::bytes::{from_hex, to_hex};
use crate::Error;
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Byte-level access to the radio's serial line.
pub trait SerialPort {
    /// Returns the number of bytes that can currently be read without
    /// blocking.
    fn bytes_available(&mut self) -> Result<usize, Error>;

    /// Reads up to `max` pending bytes.
    ///
    /// Never blocks; returns an empty vector when nothing is pending.
    fn read(&mut self, max: usize) -> Result<Vec<u8>, Error>;

    /// Writes all of `data` to the device.
    fn write(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Blocks until all written data has left the OS buffer.
    fn flush(&mut self) -> Result<(), Error>;
}

struct MatchRule {
    pattern: Regex,
    response: Vec<u8>,
    /// Number of matching writes needed before the rule starts answering.
    arm_after: usize,
    hits: usize,
}

/// A serial double that loops a canned input stream and emulates command
/// responses.
///
/// Incoming data is served from `input` in pseudo-random chunk sizes bounded
/// by `max_available`, wrapping around at the end (or stopping, if looping is
/// disabled). Every write is recorded, optionally mirrored to a file, and
/// matched against registered rules: when the hex encoding of a write matches
/// a rule's pattern, the rule's response is queued ahead of the canned
/// stream. A rule can be armed only after N matching writes, which models a
/// satellite that answers an uplink command after several repetitions.
pub struct TestSerial {
    input: Vec<u8>,
    pos: usize,
    looping: bool,
    max_available: usize,
    chunk_state: u32,
    pending: VecDeque<u8>,
    rules: Vec<MatchRule>,
    writes: Vec<Vec<u8>>,
    outfile: Option<fs::File>,
}

impl TestSerial {
    /// Creates a double serving the given raw bytes as its input stream.
    pub fn new(input: Vec<u8>) -> Self {
        Self {
            input,
            pos: 0,
            looping: true,
            max_available: 100,
            chunk_state: 0x2a65_3531,
            pending: VecDeque::new(),
            rules: Vec::new(),
            writes: Vec::new(),
            outfile: None,
        }
    }

    /// Creates a double from a file of hexadecimal text (the format raw
    /// captures are dumped in). Whitespace is ignored; hex case is
    /// normalized on load.
    pub fn from_hex_file(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        Ok(Self::new(from_hex(&compact)?))
    }

    /// Mirrors all written bytes to the given file.
    pub fn record_writes_to(&mut self, path: &Path) -> Result<(), Error> {
        self.outfile = Some(fs::File::create(path)?);
        Ok(())
    }

    /// Sets the upper bound on the chunk size a single poll reports.
    pub fn set_max_available(&mut self, max: usize) {
        self.max_available = max.max(1);
    }

    /// Controls whether the input stream wraps around at the end.
    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Registers a match rule: when a write's hex encoding matches
    /// `pattern`, queue `response` for the next reads.
    pub fn on(&mut self, pattern: &str, response: &[u8]) {
        self.on_nth(pattern, response, 1);
    }

    /// Like [`on`], but the rule only starts answering once `arm_after`
    /// matching writes have been seen.
    ///
    /// [`on`]: #method.on
    pub fn on_nth(&mut self, pattern: &str, response: &[u8], arm_after: usize) {
        self.rules.push(MatchRule {
            pattern: Regex::new(pattern).expect("invalid match rule pattern"),
            response: response.to_vec(),
            arm_after: arm_after.max(1),
            hits: 0,
        });
    }

    /// All writes seen so far, in order.
    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    /// Queues bytes to be served by the next reads, ahead of the canned
    /// input stream.
    pub fn feed(&mut self, data: &[u8]) {
        self.pending.extend(data.iter().copied());
    }

    fn remaining_input(&self) -> usize {
        if self.looping && !self.input.is_empty() {
            usize::MAX
        } else {
            self.input.len() - self.pos
        }
    }

    fn next_chunk(&mut self) -> usize {
        // xorshift; only has to be "uneven", not good
        let mut x = self.chunk_state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.chunk_state = x;
        1 + (x as usize % self.max_available)
    }
}

impl SerialPort for TestSerial {
    fn bytes_available(&mut self) -> Result<usize, Error> {
        if !self.pending.is_empty() {
            return Ok(self.pending.len());
        }
        let chunk = self.next_chunk();
        Ok(chunk.min(self.remaining_input()))
    }

    fn read(&mut self, max: usize) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(max);
        while out.len() < max {
            if let Some(b) = self.pending.pop_front() {
                out.push(b);
                continue;
            }
            if self.pos >= self.input.len() {
                if self.looping && !self.input.is_empty() {
                    self.pos = 0;
                } else {
                    break;
                }
            }
            out.push(self.input[self.pos]);
            self.pos += 1;
        }
        Ok(out)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let hex = to_hex(data);
        for rule in &mut self.rules {
            if rule.pattern.is_match(&hex) {
                rule.hits += 1;
                if rule.hits >= rule.arm_after {
                    self.pending.extend(rule.response.iter().copied());
                }
            }
        }
        if let Some(f) = &mut self.outfile {
            f.write_all(hex.as_bytes()).map_err(Error::Io)?;
        }
        self.writes.push(data.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        if let Some(f) = &mut self.outfile {
            f.flush().map_err(Error::Io)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loops_canned_input() {
        let mut ser = TestSerial::new(vec![1, 2, 3]);
        assert_eq!(ser.read(5).unwrap(), vec![1, 2, 3, 1, 2]);
        assert_eq!(ser.read(2).unwrap(), vec![3, 1]);
    }

    #[test]
    fn stops_at_end_when_not_looping() {
        let mut ser = TestSerial::new(vec![1, 2, 3]);
        ser.set_looping(false);
        assert_eq!(ser.read(2).unwrap(), vec![1, 2]);
        assert_eq!(ser.read(5).unwrap(), vec![3]);
        assert_eq!(ser.bytes_available().unwrap(), 0);
        assert!(ser.read(5).unwrap().is_empty());
    }

    #[test]
    fn chunk_sizes_bounded() {
        let mut ser = TestSerial::new(vec![0; 1000]);
        ser.set_max_available(10);
        for _ in 0..50 {
            let n = ser.bytes_available().unwrap();
            assert!(n >= 1 && n <= 10);
        }
    }

    #[test]
    fn match_rule_queues_response() {
        let mut ser = TestSerial::new(Vec::new());
        ser.on("^0103..(..)00$", b"\x01\x83\x00\x7c");
        ser.write(b"\x01\x03\x01\xfb\x00").unwrap();
        assert_eq!(ser.bytes_available().unwrap(), 4);
        assert_eq!(ser.read(4).unwrap(), b"\x01\x83\x00\x7c".to_vec());
    }

    #[test]
    fn match_rule_arms_after_n_writes() {
        let mut ser = TestSerial::new(Vec::new());
        ser.on_nth("4543484f", b"ECHOCHOCO", 4);
        for _ in 0..3 {
            ser.write(b"ECHO_CMD").unwrap();
            assert_eq!(ser.bytes_available().unwrap(), 0);
        }
        ser.write(b"ECHO_CMD").unwrap();
        assert_eq!(ser.read(9).unwrap(), b"ECHOCHOCO".to_vec());
    }
}
