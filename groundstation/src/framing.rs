//! Extraction of downlink frames from the hexadecimal receive stream.
//!
//! Bytes coming off the radio are kept as lowercase hexadecimal text (two
//! characters per byte), the form the surrounding tooling ships captures
//! around in. A downlink frame is 255 bytes and is located purely by its
//! callsign tag: the frame body carries no length field, so the scanner
//! matches the tag and takes the fixed frame length from there.
//!
//! The tag is the hex of the first five callsign bytes. The sixth byte is
//! part of the frame body and participates in error correction bookkeeping
//! downstream, so it is deliberately not matched here.

use crate::bytes::to_hex;

/// Hex encoding of the callsign prefix used as the synchronization tag.
pub const CALLSIGN_TAG_HEX: &str = "574c39585a";

/// Length of a downlink frame in bytes.
pub const PACKET_LEN_BYTES: usize = 255;

/// Length of a downlink frame in hex characters.
pub const PACKET_LEN_HEX: usize = 2 * PACKET_LEN_BYTES;

/// Cap on the receive buffer, in hex characters.
pub const MAX_BUF_HEX: usize = 4096;

/// Returns all non-overlapping frames in `buf` with their starting offsets.
///
/// Offsets are character positions and strictly increase; matches never
/// overlap because the scan resumes after each complete frame. A tag too
/// close to the end of the buffer to complete a frame is left alone (the
/// rest of the frame may still be in flight).
pub fn extract(buf: &str) -> Vec<(usize, &str)> {
    let mut frames = Vec::new();
    let mut from = 0;
    while let Some(found) = buf[from..].find(CALLSIGN_TAG_HEX) {
        let at = from + found;
        if buf.len() - at < PACKET_LEN_HEX {
            break;
        }
        frames.push((at, &buf[at..at + PACKET_LEN_HEX]));
        from = at + PACKET_LEN_HEX;
    }
    frames
}

/// Returns the suffix of `buf` following the frame that starts at
/// `last_offset`.
pub fn trim_after_last(buf: &str, last_offset: usize) -> &str {
    &buf[(last_offset + PACKET_LEN_HEX).min(buf.len())..]
}

/// Bounds `buf` to at most `max` characters.
///
/// When the buffer is over the limit, the prefix is dropped so that exactly
/// `keep_tail` characters remain; a frame currently arriving therefore
/// survives as long as `keep_tail >= PACKET_LEN_HEX`. Returns the kept
/// buffer and the dropped prefix.
pub fn cap(buf: &str, max: usize, keep_tail: usize) -> (&str, &str) {
    debug_assert!(max >= keep_tail);
    if buf.len() > max {
        let cut = buf.len() - keep_tail;
        (&buf[cut..], &buf[..cut])
    } else {
        (buf, "")
    }
}

/// The append-only hexadecimal receive buffer.
///
/// Owned and mutated only by the station loop thread. `scan` removes every
/// complete frame and unconditionally applies the size cap afterwards, so
/// after any scan the buffer holds at most [`MAX_BUF_HEX`] characters
/// (and at least the tail a partial frame needs).
///
/// [`MAX_BUF_HEX`]: constant.MAX_BUF_HEX.html
#[derive(Debug)]
pub struct RxBuffer {
    buf: String,
    max_hex: usize,
    keep_tail: usize,
}

impl RxBuffer {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            max_hex: MAX_BUF_HEX,
            keep_tail: PACKET_LEN_HEX,
        }
    }

    /// Hex-encodes `data` and appends it.
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buf.push_str(&to_hex(data));
    }

    /// Appends already-encoded hex text, normalizing case.
    pub fn push_hex(&mut self, hex: &str) {
        self.buf.push_str(&hex.to_ascii_lowercase());
    }

    /// Extracts all complete frames, trims them out of the buffer, and
    /// applies the size cap.
    ///
    /// Returns the frames in arrival order together with any prefix the cap
    /// dropped.
    pub fn scan(&mut self) -> (Vec<String>, String) {
        let (frames, consumed_to) = {
            let found = extract(&self.buf);
            let consumed_to = found.last().map(|&(at, _)| at + PACKET_LEN_HEX);
            let frames: Vec<String> = found.into_iter().map(|(_, f)| f.to_string()).collect();
            (frames, consumed_to)
        };
        if let Some(end) = consumed_to {
            self.buf.drain(..end);
        }

        let dropped = {
            let (kept, dropped) = cap(&self.buf, self.max_hex, self.keep_tail);
            let kept_from = self.buf.len() - kept.len();
            let dropped = dropped.to_string();
            self.buf.drain(..kept_from);
            dropped
        };
        (frames, dropped)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }
}

impl Default for RxBuffer {
    fn default() -> Self {
        Self::new()
    }
}
