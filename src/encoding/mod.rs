//! Content-Encoding support.

use bytes::{Bytes, BytesMut};
use std::io;

mod decoder;

pub(crate) use self::decoder::GzipDecoder;

/// Special-purpose writer for streaming decompression.
///
/// Pre-allocates 8KiB of capacity.
struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn new() -> Writer {
        Writer {
            buf: BytesMut::with_capacity(8192),
        }
    }

    fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
