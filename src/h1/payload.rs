//! Response body framing.

use bytes::Bytes;
use http::{Method, StatusCode};

use crate::connection::Connection;
use crate::error::HttpError;
use crate::h1::chunked::ChunkedDecoder;
use crate::h1::parse;
use crate::response::ResponseHead;

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Framing {
    /// The response must not have a body (HEAD, 1xx, 204, 304).
    None,
    Length(u64),
    Chunked,
    /// No explicit framing: body runs to EOF and the connection cannot be
    /// reused.
    Eof,
}

/// Pick the framing for a response per RFC 7230 §3.3.3.
pub(crate) fn select_framing(
    method: &Method,
    head: &ResponseHead,
) -> Result<Framing, HttpError> {
    let status = head.status;
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(Framing::None);
    }

    let length = parse::content_length(&head.headers)?;
    if parse::is_chunked(&head.headers) {
        if length.is_some() {
            return Err(HttpError::LengthAndChunkingBothUsed);
        }
        return Ok(Framing::Chunked);
    }

    match length {
        Some(n) => Ok(Framing::Length(n)),
        None => Ok(Framing::Eof),
    }
}

enum Kind {
    None,
    Length { remaining: u64 },
    Chunked(ChunkedDecoder),
    Eof,
}

/// Lazy reader over a response body; tracks whether the framing terminator
/// was observed cleanly, which gates connection reuse.
pub(crate) struct PayloadReader {
    kind: Kind,
    done: bool,
    anomaly: bool,
}

impl PayloadReader {
    pub(crate) fn new(framing: Framing) -> PayloadReader {
        let (kind, done) = match framing {
            Framing::None => (Kind::None, true),
            Framing::Length(0) => (Kind::Length { remaining: 0 }, true),
            Framing::Length(n) => (Kind::Length { remaining: n }, false),
            Framing::Chunked => (Kind::Chunked(ChunkedDecoder::new()), false),
            Framing::Eof => (Kind::Eof, false),
        };
        PayloadReader {
            kind,
            done,
            anomaly: false,
        }
    }

    /// Next raw (not content-decoded) body chunk; `Ok(None)` at the
    /// terminator.
    pub(crate) fn next(&mut self, conn: &mut Connection) -> Result<Option<Bytes>, HttpError> {
        if self.done {
            return Ok(None);
        }
        match self.next_inner(conn) {
            Ok(item) => Ok(item),
            Err(err) => {
                self.anomaly = true;
                self.done = true;
                Err(err)
            }
        }
    }

    fn next_inner(&mut self, conn: &mut Connection) -> Result<Option<Bytes>, HttpError> {
        match &mut self.kind {
            Kind::None => {
                self.done = true;
                Ok(None)
            }
            Kind::Length { remaining } => {
                let chunk = conn.read()?;
                if chunk.is_empty() {
                    return Err(HttpError::ConnectionClosed);
                }
                let chunk = if (chunk.len() as u64) > *remaining {
                    let want = *remaining as usize;
                    conn.unread(&chunk[want..]);
                    chunk.slice(..want)
                } else {
                    chunk
                };
                *remaining -= chunk.len() as u64;
                if *remaining == 0 {
                    self.done = true;
                }
                Ok(Some(chunk))
            }
            Kind::Chunked(decoder) => {
                let item = decoder.read_chunk(conn)?;
                if item.is_none() {
                    self.done = true;
                }
                Ok(item)
            }
            Kind::Eof => {
                let chunk = conn.read()?;
                if chunk.is_empty() {
                    self.done = true;
                    Ok(None)
                } else {
                    Ok(Some(chunk))
                }
            }
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.done && !self.anomaly
    }

    /// Whether the framing layer permits handing the connection back to the
    /// pool: terminator observed, no anomaly, and framing that leaves the
    /// stream positioned at a message boundary.
    pub(crate) fn allows_reuse(&self) -> bool {
        self.is_complete() && !matches!(self.kind, Kind::Eof)
    }
}
