//! The real serial device behind the core's serial seam.

use groundstation::serial::SerialPort;
use groundstation::Error;
use std::io::{self, Read, Write};
use std::time::Duration;

fn serial_err(e: serialport::Error) -> Error {
    Error::Serial(io::Error::new(io::ErrorKind::Other, e.to_string()))
}

/// A `SerialPort` over an actual device, 8N1 with no flow control.
pub struct RealSerial {
    port: Box<dyn serialport::SerialPort>,
}

impl RealSerial {
    /// Opens `path` at `baud`.
    ///
    /// The OS-level read timeout is kept short; the core treats reads as
    /// non-blocking and only asks for bytes it already knows are pending.
    pub fn open(path: &str, baud: u32) -> Result<Self, Error> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(serial_err)?;
        Ok(Self { port })
    }
}

impl SerialPort for RealSerial {
    fn bytes_available(&mut self) -> Result<usize, Error> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(serial_err)
    }

    fn read(&mut self, max: usize) -> Result<Vec<u8>, Error> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0; max];
        match self.port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => {
                Ok(Vec::new())
            }
            Err(e) => Err(Error::Serial(e)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.port.write_all(data).map_err(Error::Serial)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.port.flush().map_err(Error::Serial)
    }
}
