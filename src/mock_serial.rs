//! Scripted serial line for the codec unit tests.
//!
//! The device's reply is queued up front and handed out in whatever chunk sizes
//! the codec asks for. Once the queue runs dry the line reads as a timeout,
//! which is what a real port does when the device stays silent.

use heapless::{Deque, Vec};

const CAPACITY: usize = 512;

pub struct MockSerial {
    sent: Vec<u8, CAPACITY>,
    pending: Deque<u8, CAPACITY>,
    unplugged: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum MockSerialError {
    /// Nothing queued before the port timeout.
    #[error("no reply before timeout")]
    Silent,
    /// More traffic than the script holds.
    #[error("script buffer full")]
    Full,
    /// The adapter went away.
    #[error("serial adapter unplugged")]
    Unplugged,
}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockSerialError::Silent => embedded_io::ErrorKind::TimedOut,
            MockSerialError::Full => embedded_io::ErrorKind::OutOfMemory,
            MockSerialError::Unplugged => embedded_io::ErrorKind::NotConnected,
        }
    }
}

impl MockSerial {
    /// A line whose device will answer with `reply`.
    pub fn with_reply(reply: &[u8]) -> Self {
        let mut pending = Deque::new();
        for &byte in reply {
            // Scripts are written by hand; an oversized one is a broken test.
            assert!(pending.push_back(byte).is_ok(), "reply script too long");
        }
        Self {
            sent: Vec::new(),
            pending,
            unplugged: false,
        }
    }

    pub fn silent() -> Self {
        Self::with_reply(&[])
    }

    /// Everything the codec wrote so far.
    pub fn written_data(&self) -> &[u8] {
        &self.sent
    }

    pub fn unplug(&mut self) {
        self.unplugged = true;
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.unplugged {
            return Err(MockSerialError::Unplugged);
        }
        self.sent
            .extend_from_slice(buf)
            .map_err(|_| MockSerialError::Full)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.unplugged {
            Err(MockSerialError::Unplugged)
        } else {
            Ok(())
        }
    }
}

impl embedded_io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.unplugged {
            return Err(MockSerialError::Unplugged);
        }
        if self.pending.is_empty() {
            return Err(MockSerialError::Silent);
        }
        let mut count = 0;
        for slot in buf.iter_mut() {
            let Some(byte) = self.pending.pop_front() else {
                break;
            };
            *slot = byte;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Error, Read, Write};

    #[test]
    fn records_what_was_sent() {
        let mut line = MockSerial::silent();
        line.write(b"U1").unwrap();
        line.write(b"\r\n").unwrap();
        assert_eq!(line.written_data(), b"U1\r\n");
    }

    #[test]
    fn reply_drains_then_times_out() {
        let mut line = MockSerial::with_reply(b"abc");
        let mut buffer = [0u8; 2];
        assert_eq!(line.read(&mut buffer).unwrap(), 2);
        assert_eq!(&buffer, b"ab");
        assert_eq!(line.read(&mut buffer).unwrap(), 1);
        let err = line.read(&mut buffer).unwrap_err();
        assert_eq!(err.kind(), embedded_io::ErrorKind::TimedOut);
    }

    #[test]
    fn overlong_write_is_refused() {
        let mut line = MockSerial::silent();
        assert!(matches!(
            line.write(&[0u8; CAPACITY + 1]),
            Err(MockSerialError::Full)
        ));
    }

    #[test]
    fn unplugged_line_fails_both_ways() {
        let mut line = MockSerial::with_reply(b"1000\r\n");
        line.unplug();
        assert!(line.write(b"D1").is_err());
        assert!(line.flush().is_err());
        let err = line.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), embedded_io::ErrorKind::NotConnected);
        assert_eq!(err.to_string(), "serial adapter unplugged");
    }
}
