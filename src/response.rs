//! Streaming HTTP responses.

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};

use crate::cookies::CookieJar;
use crate::encoding::GzipDecoder;
use crate::error::HttpError;
use crate::h1::payload::PayloadReader;
use crate::pool::{Disposition, ManagedConn};

/// Status line and headers of a response.
#[derive(Clone, Debug)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    /// Reason phrase as sent on the wire; may be empty.
    pub reason: String,
    pub headers: HeaderMap,
}

/// A response whose body is streamed from the underlying connection.
///
/// Draining the body to its framing terminator hands the connection back to
/// the pool; closing (or dropping) the response early closes the socket
/// instead.
pub struct Response {
    pub(crate) head: ResponseHead,
    pub(crate) body: ResponseBody,
    pub(crate) cookie_jar: CookieJar,
    pub(crate) history: Vec<ResponseHead>,
    pub(crate) effective_url: String,
}

impl Response {
    pub(crate) fn new(
        head: ResponseHead,
        body: ResponseBody,
        cookie_jar: CookieJar,
        effective_url: String,
    ) -> Response {
        Response {
            head,
            body,
            cookie_jar,
            history: Vec::new(),
            effective_url,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn reason(&self) -> &str {
        &self.head.reason
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// Jar after folding in this response's `Set-Cookie` headers.
    pub fn cookie_jar(&self) -> &CookieJar {
        &self.cookie_jar
    }

    /// Heads of the redirect responses that led here, in chronological
    /// order.
    pub fn history(&self) -> &[ResponseHead] {
        &self.history
    }

    /// URL of this response after any redirects, used for cookie scoping
    /// and relative Location resolution.
    pub fn effective_url(&self) -> &str {
        &self.effective_url
    }

    /// Next decoded body chunk; `Ok(None)` once the body is complete.
    pub fn read_chunk(&mut self) -> Result<Option<Bytes>, HttpError> {
        self.body.next()
    }

    /// Drain the remaining body into one buffer.
    pub fn body_bytes(&mut self) -> Result<Bytes, HttpError> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.body.next()? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Read the body to completion, discarding it.
    pub fn drain(&mut self) -> Result<(), HttpError> {
        while self.body.next()?.is_some() {}
        Ok(())
    }

    /// Release the response's resources. If the body was not fully drained
    /// the connection is closed rather than pooled.
    pub fn close(&mut self) {
        self.body.abort();
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.head.status)
            .field("version", &self.head.version)
            .field("headers", &self.head.headers)
            .field("history", &self.history.len())
            .finish()
    }
}

/// Lazy body stream holding the connection until the framing terminator.
pub(crate) struct ResponseBody {
    conn: Option<ManagedConn>,
    reader: PayloadReader,
    decoder: Option<GzipDecoder>,
    keep_alive: bool,
    finished: bool,
    wrap_io: Arc<dyn Fn(io::Error) -> HttpError + Send + Sync>,
}

impl ResponseBody {
    pub(crate) fn new(
        conn: ManagedConn,
        reader: PayloadReader,
        decoder: Option<GzipDecoder>,
        keep_alive: bool,
        wrap_io: Arc<dyn Fn(io::Error) -> HttpError + Send + Sync>,
    ) -> ResponseBody {
        ResponseBody {
            conn: Some(conn),
            reader,
            decoder,
            keep_alive,
            finished: false,
            wrap_io,
        }
    }

    fn next(&mut self) -> Result<Option<Bytes>, HttpError> {
        loop {
            if self.finished {
                return Ok(None);
            }
            let conn = match self.conn.as_mut() {
                Some(conn) => conn,
                None => {
                    self.finished = true;
                    return Ok(None);
                }
            };

            match self.reader.next(conn.conn_mut()) {
                Ok(Some(chunk)) => match self.decoder.as_mut() {
                    Some(decoder) => match decoder.feed_data(&chunk) {
                        Ok(Some(decoded)) => return Ok(Some(decoded)),
                        Ok(None) => continue,
                        Err(err) => {
                            self.abort();
                            return Err((self.wrap_io)(err));
                        }
                    },
                    None => return Ok(Some(chunk)),
                },
                Ok(None) => {
                    self.finished = true;
                    let reuse = self.keep_alive && self.reader.allows_reuse();
                    if let Some(conn) = self.conn.take() {
                        conn.release(if reuse {
                            Disposition::Reuse
                        } else {
                            Disposition::DontReuse
                        });
                    }
                    return match self.decoder.as_mut() {
                        Some(decoder) => match decoder.feed_eof() {
                            Ok(tail) => Ok(tail),
                            Err(err) => Err((self.wrap_io)(err)),
                        },
                        None => Ok(None),
                    };
                }
                Err(err) => {
                    let err = conn.wrap_err(err);
                    self.abort();
                    return Err(err);
                }
            }
        }
    }

    fn abort(&mut self) {
        self.finished = true;
        if let Some(conn) = self.conn.take() {
            conn.release(Disposition::DontReuse);
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        // undrained bodies must not put a dirty connection back in the pool
        self.abort();
    }
}
