use std::error;
use std::fmt;
use std::io;

/// Errors returned by the groundstation core.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A buffer or frame had an invalid length for the operation.
    InvalidLength,

    /// Invalid value supplied for field.
    InvalidValue,

    /// Unexpectedly reached EOF while reading or writing data.
    ///
    /// This is returned when encoding tries to fit too much data into a
    /// fixed-size frame buffer, and when decoding runs out of bytes.
    Eof,

    /// Text that should be hexadecimal contained other characters or had odd
    /// length.
    InvalidHex,

    /// A codeword had more corrupted symbols than the parity can repair.
    TooCorrupt,

    /// The serial device reported an I/O error.
    ///
    /// These break out of inner loops; the outer loop decides whether the
    /// port can be recovered.
    Serial(io::Error),

    /// A persistence file (rx dump, TLE cache, command catalog) failed.
    Io(io::Error),

    /// The uplink command catalog could not be loaded or is malformed.
    Catalog(String),

    /// Orbital elements could not be loaded or parsed.
    Tle(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidLength => f.write_str("invalid length for operation"),
            Error::InvalidValue => f.write_str("invalid value for field"),
            Error::Eof => f.write_str("end of buffer"),
            Error::InvalidHex => f.write_str("invalid hex string"),
            Error::TooCorrupt => f.write_str("too many corrupted symbols to correct"),
            Error::Serial(e) => write!(f, "serial I/O error: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Catalog(msg) => write!(f, "uplink catalog error: {}", msg),
            Error::Tle(msg) => write!(f, "TLE error: {}", msg),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Serial(e) | Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
