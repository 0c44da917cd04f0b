//! Reed-Solomon error correction for downlink frames.
//!
//! The downlink codeword is a shortened RS(255,223) block over GF(2^8): 217
//! data bytes followed by 32 parity bytes. The 6-byte callsign that precedes
//! it in the frame is *not* covered by the code; it is stripped before
//! decoding and prepended unchanged to the corrected output.
//!
//! Codec compatibility: this uses the `reed-solomon` crate's field (reducing
//! polynomial 0x11d) with trailing parity. A peer producing parity from a
//! different generator polynomial will decode here as corrupt.

use reed_solomon::{Decoder, Encoder};

use crate::bytes::{from_hex, to_hex};
use crate::framing::PACKET_LEN_HEX;
use crate::Error;

/// Parity bytes per codeword.
pub const PARITY_LEN: usize = 32;

/// Callsign bytes preceding the codeword, excluded from error correction.
pub const CALLSIGN_LEN: usize = 6;

/// Codeword length: everything in the frame after the callsign.
pub const CODEWORD_LEN: usize = 249;

/// Data bytes recovered from one codeword.
pub const DATA_LEN: usize = CODEWORD_LEN - PARITY_LEN;

/// Appends parity to `data`, producing a codeword.
///
/// Used to build test fixtures and loopback transmissions; the satellite
/// does the encoding in flight.
pub fn encode(data: &[u8]) -> Vec<u8> {
    Encoder::new(PARITY_LEN).encode(data).to_vec()
}

/// Corrects `codeword` in place of up to [`PARITY_LEN`]`/2` corrupted bytes
/// and returns the data part.
///
/// [`PARITY_LEN`]: constant.PARITY_LEN.html
pub fn decode(codeword: &[u8]) -> Result<Vec<u8>, Error> {
    if codeword.len() != CODEWORD_LEN {
        return Err(Error::InvalidLength);
    }
    let corrected = Decoder::new(PARITY_LEN)
        .correct(codeword, None)
        .map_err(|_| Error::TooCorrupt)?;
    Ok(corrected.data().to_vec())
}

/// Runs error correction over a full 510-hex-char frame.
///
/// Strips the callsign, decodes the codeword, and returns the callsign plus
/// the corrected data (parity removed) as hex text.
pub fn correct_packet(raw_hex: &str) -> Result<String, Error> {
    if raw_hex.len() != PACKET_LEN_HEX {
        return Err(Error::InvalidLength);
    }
    let raw = from_hex(raw_hex)?;
    let (callsign, codeword) = raw.split_at(CALLSIGN_LEN);
    let data = decode(codeword)?;

    let mut out = to_hex(callsign);
    out.push_str(&to_hex(&data));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CALLSIGN;

    fn sample_data() -> Vec<u8> {
        (0..DATA_LEN).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn roundtrip_identity() {
        let data = sample_data();
        let codeword = encode(&data);
        assert_eq!(codeword.len(), CODEWORD_LEN);
        assert_eq!(decode(&codeword).unwrap(), data);
    }

    #[test]
    fn corrects_up_to_parity_budget() {
        let data = sample_data();
        let mut codeword = encode(&data);
        for i in 0..PARITY_LEN / 2 {
            codeword[i * 11] ^= 0x5a;
        }
        assert_eq!(decode(&codeword).unwrap(), data);
    }

    #[test]
    fn rejects_hopeless_codeword() {
        let data = sample_data();
        let mut codeword = encode(&data);
        for byte in codeword.iter_mut().take(100) {
            *byte ^= 0xff;
        }
        assert!(matches!(decode(&codeword), Err(Error::TooCorrupt)));
    }

    #[test]
    fn correct_packet_strips_parity_and_keeps_callsign() {
        let data = sample_data();
        let mut frame = CALLSIGN.as_bytes().to_vec();
        frame.extend_from_slice(&encode(&data));
        let raw_hex = to_hex(&frame);
        assert_eq!(raw_hex.len(), PACKET_LEN_HEX);

        let corrected = correct_packet(&raw_hex).unwrap();
        assert_eq!(corrected.len(), 2 * (CALLSIGN_LEN + DATA_LEN));
        assert!(corrected.starts_with(&to_hex(CALLSIGN.as_bytes())));
        assert_eq!(from_hex(&corrected[12..]).unwrap(), data);
    }

    #[test]
    fn correct_packet_validates_input() {
        assert!(matches!(correct_packet("abcd"), Err(Error::InvalidLength)));
        let junk = "zz".repeat(255);
        assert!(matches!(correct_packet(&junk), Err(Error::InvalidHex)));
    }
}
