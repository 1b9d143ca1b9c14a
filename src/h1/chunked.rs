//! Chunked transfer-encoding framing.

use bytes::{Buf as _, Bytes, BytesMut};

use crate::connection::Connection;
use crate::error::HttpError;

/// Where the decoder stands inside the chunked framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Expecting a `<hex-size>[;ext]\r\n` line.
    SizeLine,
    /// Copying chunk data.
    Data { remaining: u64 },
    /// Expecting the CRLF that closes a data chunk.
    DataCrlf,
    /// After the zero chunk: trailer lines until an empty one.
    Trailers,
    Done,
}

/// Incremental decoder for a chunked response body.
///
/// Works a size line at a time: parse `<hex-size>[;ext]\r\n`, hand out the
/// following `size` bytes as they arrive, eat the closing CRLF, repeat. The
/// zero chunk switches to the trailer section, which is consumed and
/// discarded. Bytes past the final `\r\n` are pushed back into the
/// connection so a reused connection starts clean.
pub(crate) struct ChunkedDecoder {
    phase: Phase,
    buf: BytesMut,
}

impl ChunkedDecoder {
    pub(crate) fn new() -> ChunkedDecoder {
        ChunkedDecoder {
            phase: Phase::SizeLine,
            buf: BytesMut::new(),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Decode the next data chunk; `Ok(None)` once the zero chunk and any
    /// trailers have been consumed.
    pub(crate) fn read_chunk(
        &mut self,
        conn: &mut Connection,
    ) -> Result<Option<Bytes>, HttpError> {
        loop {
            match self.phase {
                Phase::Done => return Ok(None),

                Phase::SizeLine => {
                    let line = match self.take_line()? {
                        Some(line) => line,
                        None => {
                            self.fill(conn)?;
                            continue;
                        }
                    };
                    let size = parse_size_line(&line)?;
                    self.phase = if size == 0 {
                        Phase::Trailers
                    } else {
                        Phase::Data { remaining: size }
                    };
                }

                Phase::Data { remaining } => {
                    if self.buf.is_empty() {
                        self.fill(conn)?;
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let data = self.buf.split_to(take).freeze();
                    let left = remaining - take as u64;
                    self.phase = if left == 0 {
                        Phase::DataCrlf
                    } else {
                        Phase::Data { remaining: left }
                    };
                    return Ok(Some(data));
                }

                Phase::DataCrlf => {
                    if self.buf.len() < 2 {
                        self.fill(conn)?;
                        continue;
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(HttpError::InvalidChunkHeaders);
                    }
                    self.buf.advance(2);
                    self.phase = Phase::SizeLine;
                }

                Phase::Trailers => {
                    let line = match self.take_line()? {
                        Some(line) => line,
                        None => {
                            self.fill(conn)?;
                            continue;
                        }
                    };
                    if line.is_empty() {
                        self.phase = Phase::Done;
                        if !self.buf.is_empty() {
                            let rest = self.buf.split();
                            conn.unread(&rest);
                        }
                        return Ok(None);
                    }
                    // trailer headers are read off the wire and dropped
                }
            }
        }
    }

    /// Take one CRLF-terminated line out of the buffer, without the CRLF.
    /// `Ok(None)` means more input is needed; a bare LF is a framing error.
    fn take_line(&mut self) -> Result<Option<Bytes>, HttpError> {
        let lf = match self.buf.iter().position(|&b| b == b'\n') {
            Some(lf) => lf,
            None => return Ok(None),
        };
        if lf == 0 || self.buf[lf - 1] != b'\r' {
            return Err(HttpError::InvalidChunkHeaders);
        }
        let mut line = self.buf.split_to(lf + 1);
        line.truncate(lf - 1);
        Ok(Some(line.freeze()))
    }

    fn fill(&mut self, conn: &mut Connection) -> Result<(), HttpError> {
        let chunk = conn.read()?;
        if chunk.is_empty() {
            return Err(HttpError::ConnectionClosed);
        }
        self.buf.extend_from_slice(&chunk);
        Ok(())
    }
}

/// Parse `<hex-size>[;ext]`. The extension is skipped, though control bytes
/// in it mean a corrupt stream; a size that does not fit in u64 is nonsense.
fn parse_size_line(line: &[u8]) -> Result<u64, HttpError> {
    let (size, extension) = match line.iter().position(|&b| b == b';') {
        Some(semi) => (&line[..semi], &line[semi + 1..]),
        None => (line, &b""[..]),
    };

    if extension
        .iter()
        .any(|&b| (b < 0x20 && b != b'\t') || b == 0x7f)
    {
        return Err(HttpError::InvalidChunkHeaders);
    }

    let digits = std::str::from_utf8(size)
        .map_err(|_| HttpError::InvalidChunkHeaders)?
        .trim_matches([' ', '\t']);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(HttpError::InvalidChunkHeaders);
    }
    u64::from_str_radix(digits, 16).map_err(|_| HttpError::InvalidChunkHeaders)
}

/// Append one chunk frame to `dst`. Empty input is skipped, since a
/// zero-size frame would terminate the body.
pub(crate) fn encode_chunk(dst: &mut BytesMut, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    dst.extend_from_slice(format!("{:X}\r\n", data.len()).as_bytes());
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

/// Append the terminating zero chunk.
pub(crate) fn encode_eof(dst: &mut BytesMut) {
    dst.extend_from_slice(b"0\r\n\r\n");
}
