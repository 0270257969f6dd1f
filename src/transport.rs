/* Abstraction for the serial transport semantics */

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[cfg(feature = "serial")]
use crate::config::BAUD_RATE;

/// The byte duplex the driver and the emulator speak over.
///
/// Reads and writes take `&self` so the listener thread can read while
/// caller threads write, matching how a serial port behaves.
pub trait SerialLink: Send + Sync + std::fmt::Debug {
    /// Reads until a newline or until `timeout` elapses, returning whatever
    /// arrived. A timeout is not an error; it returns the (possibly empty)
    /// partial buffer.
    fn read_line(&self, timeout: Duration) -> io::Result<Vec<u8>>;

    /// Writes the whole slice to the wire.
    fn write(&self, data: &[u8]) -> io::Result<()>;
}

/// Opens the named serial port at the 9602 line settings (19200 8-N-1).
#[cfg(feature = "serial")]
pub fn open(path: &str, read_timeout: Duration) -> io::Result<SerialPortLink> {
    let mut port = serial2::SerialPort::open(path, BAUD_RATE)?;
    port.set_read_timeout(read_timeout)?;
    Ok(SerialPortLink(Mutex::new(port)))
}

/// A [`SerialLink`] backed by a real [`serial2::SerialPort`].
///
/// `set_read_timeout` requires `&mut self` in `serial2`, so the port is kept
/// behind a [`Mutex`] to satisfy [`SerialLink`]'s `&self` methods.
#[cfg(feature = "serial")]
#[derive(Debug)]
pub struct SerialPortLink(Mutex<serial2::SerialPort>);

#[cfg(feature = "serial")]
impl SerialLink for SerialPortLink {
    fn read_line(&self, timeout: Duration) -> io::Result<Vec<u8>> {
        let mut port = self.0.lock().unwrap();
        let deadline = Instant::now() + timeout;
        let mut line = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(line);
            }
            let _ = port.set_read_timeout(remaining);
            match port.read(&mut chunk) {
                Ok(0) => return Ok(line),
                Ok(n) => {
                    line.extend_from_slice(&chunk[..n]);
                    if line.contains(&b'\n') {
                        return Ok(line);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    return Ok(line);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        let port = self.0.lock().unwrap();
        let mut written = 0;
        while written < data.len() {
            written += port.write(&data[written..])?;
        }
        Ok(())
    }
}

/// One direction of the in-memory duplex.
#[derive(Debug, Default)]
struct Channel {
    buf: Mutex<VecDeque<u8>>,
    readable: Condvar,
}

impl Channel {
    fn push(&self, data: &[u8]) {
        let mut buf = self.buf.lock().unwrap();
        buf.extend(data.iter().copied());
        self.readable.notify_all();
    }

    fn read_line(&self, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut buf = self.buf.lock().unwrap();
        loop {
            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                return buf.drain(..=pos).collect();
            }
            match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => {
                    let (guard, _) = self.readable.wait_timeout(buf, remaining).unwrap();
                    buf = guard;
                }
                _ => return buf.drain(..).collect(),
            }
        }
    }
}

/// One end of an in-memory byte duplex.
///
/// Used to wire an [`crate::IridiumEmulator`] to an
/// [`crate::IridiumCommunicator`] without hardware; see [`pipe`].
#[derive(Debug, Clone)]
pub struct PipeLink {
    rx: Arc<Channel>,
    tx: Arc<Channel>,
}

/// Creates a connected pair of in-memory links. Bytes written to one end are
/// read from the other.
pub fn pipe() -> (PipeLink, PipeLink) {
    let a = Arc::new(Channel::default());
    let b = Arc::new(Channel::default());
    (
        PipeLink {
            rx: Arc::clone(&a),
            tx: Arc::clone(&b),
        },
        PipeLink { rx: b, tx: a },
    )
}

impl SerialLink for PipeLink {
    fn read_line(&self, timeout: Duration) -> io::Result<Vec<u8>> {
        Ok(self.rx.read_line(timeout))
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        self.tx.push(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(20);

    #[test]
    fn pipe_carries_lines_both_ways() {
        let (left, right) = pipe();
        left.write(b"AT\r\n").unwrap();
        assert_eq!(right.read_line(TICK).unwrap(), b"AT\r\n");

        right.write(b"OK\r\n").unwrap();
        assert_eq!(left.read_line(TICK).unwrap(), b"OK\r\n");
    }

    #[test]
    fn read_line_stops_at_first_newline() {
        let (left, right) = pipe();
        left.write(b"first\nsecond\n").unwrap();
        assert_eq!(right.read_line(TICK).unwrap(), b"first\n");
        assert_eq!(right.read_line(TICK).unwrap(), b"second\n");
    }

    #[test]
    fn read_line_returns_partial_bytes_on_timeout() {
        let (left, right) = pipe();
        left.write(b"\x00\x02no newline here").unwrap();
        assert_eq!(right.read_line(TICK).unwrap(), b"\x00\x02no newline here");
        assert!(right.read_line(TICK).unwrap().is_empty());
    }
}
