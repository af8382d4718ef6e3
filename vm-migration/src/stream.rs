// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io::{self, BufReader, BufWriter, Read, Write};

use crate::rate_limiter::RateLimiter;

/// Buffered, rate-limited byte sink carrying a migration stream.
///
/// All multi-byte integers on the wire are big endian. Writes are
/// buffered; callers flush at frame boundaries where latency matters
/// and at the end of each transfer pass.
pub struct MigrationStream {
    writer: BufWriter<Box<dyn Write + Send>>,
    limiter: RateLimiter,
    bytes_transferred: u64,
}

impl MigrationStream {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self::with_rate_limit(writer, 0)
    }

    /// `window_bytes` caps the bytes written per transfer window; 0
    /// means unlimited.
    pub fn with_rate_limit(writer: Box<dyn Write + Send>, window_bytes: u64) -> Self {
        MigrationStream {
            writer: BufWriter::new(writer),
            limiter: RateLimiter::new(window_bytes),
            bytes_transferred: 0,
        }
    }

    fn account(&mut self, bytes: u64) {
        self.limiter.consume(bytes);
        self.bytes_transferred += bytes;
    }

    pub fn put_be64(&mut self, v: u64) -> io::Result<()> {
        self.account(8);
        self.writer.write_all(&v.to_be_bytes())
    }

    pub fn put_u8(&mut self, v: u8) -> io::Result<()> {
        self.account(1);
        self.writer.write_all(&[v])
    }

    pub fn put_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        self.account(buf.len() as u64);
        self.writer.write_all(buf)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Whether the current transfer window budget is exhausted.
    pub fn rate_limited(&self) -> bool {
        self.limiter.is_blocked()
    }

    /// Byte budget of one transfer window.
    pub fn rate_limit_window(&self) -> u64 {
        self.limiter.window_bytes()
    }

    /// Open a new transfer window. Called by the migration driver at the
    /// start of each iteration.
    pub fn replenish_rate_window(&mut self) {
        self.limiter.replenish()
    }

    /// Change the per-window byte budget; 0 removes the limit. The
    /// migration driver lifts the limit before the final pass.
    pub fn set_rate_limit_window(&mut self, window_bytes: u64) {
        self.limiter.set_window_bytes(window_bytes)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }
}

/// Byte source yielding a migration stream, mirroring [`MigrationStream`].
pub struct MigrationSource {
    reader: BufReader<Box<dyn Read + Send>>,
}

impl MigrationSource {
    pub fn new(reader: Box<dyn Read + Send>) -> Self {
        MigrationSource {
            reader: BufReader::new(reader),
        }
    }

    pub fn get_be64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.reader.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    pub fn get_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.reader.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn get_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.reader.read_exact(buf)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// In-memory sink shared with the test so the written bytes can be
    /// inspected after the stream is dropped.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_round_trip() {
        let sink = SharedSink::default();
        let mut stream = MigrationStream::new(Box::new(sink.clone()));
        stream.put_be64(0xDEAD_BEEF_0000_0201).unwrap();
        stream.put_u8(4).unwrap();
        stream.put_bytes(b"vda0").unwrap();
        stream.flush().unwrap();
        assert_eq!(stream.bytes_transferred(), 13);

        let bytes = sink.0.lock().unwrap().clone();
        let mut source = MigrationSource::new(Box::new(Cursor::new(bytes)));
        assert_eq!(source.get_be64().unwrap(), 0xDEAD_BEEF_0000_0201);
        assert_eq!(source.get_u8().unwrap(), 4);
        let mut name = [0u8; 4];
        source.get_bytes(&mut name).unwrap();
        assert_eq!(&name, b"vda0");

        // Exhausted source surfaces an I/O error.
        source.get_u8().unwrap_err();
    }

    #[test]
    fn test_rate_limit_accounting() {
        let sink = SharedSink::default();
        let mut stream = MigrationStream::with_rate_limit(Box::new(sink), 16);
        assert_eq!(stream.rate_limit_window(), 16);
        stream.put_be64(1).unwrap();
        assert!(!stream.rate_limited());
        stream.put_be64(2).unwrap();
        assert!(stream.rate_limited());

        stream.replenish_rate_window();
        assert!(!stream.rate_limited());
    }
}
