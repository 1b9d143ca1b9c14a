use std::io;

use derive_more::Display;
use http::{HeaderMap, StatusCode};

use crate::cookies::CookieJar;
use crate::response::ResponseHead;

/// A set of errors that can occur while preparing, sending, and reading an
/// HTTP exchange.
///
/// Raw `io::Error`s are funneled through the manager's `wrap_io` hook before
/// they surface, so integrations can re-type transport failures in one place.
#[derive(Debug, Display)]
#[non_exhaustive]
pub enum HttpError {
    /// URL could not be parsed into a request
    #[display("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Server response was rejected by the request's status check
    #[display("response status {status} rejected by status check")]
    Status {
        status: StatusCode,
        headers: HeaderMap,
        cookie_jar: CookieJar,
    },

    /// Redirect budget exhausted; carries prior responses in chronological order
    #[display("redirect limit reached after {} responses", _0.len())]
    TooManyRedirects(Vec<ResponseHead>),

    /// Redirect response carried a Location that could not be parsed
    #[display("redirect Location could not be parsed")]
    UnparseableRedirect(ResponseHead),

    /// Retry budget exhausted on a retryable transport failure
    #[display("too many retries")]
    TooManyRetries,

    /// Deadline over connect + send + header read expired
    #[display("timeout while waiting for response")]
    ResponseTimeout,

    /// TCP connect (or proxy dial) took too long
    #[display("timeout while establishing connection")]
    ConnectTimeout,

    /// Peer closed the connection in the middle of a frame
    #[display("connection closed mid-message")]
    ConnectionClosed,

    /// Status line was malformed
    #[display("invalid status line: {_0:?}")]
    InvalidStatusLine(String),

    /// A header line was malformed
    #[display("invalid header: {_0:?}")]
    InvalidHeader(String),

    /// Accumulated status line + headers exceeded the fixed cap
    #[display("response headers too large")]
    OverlongHeaders,

    /// Chunked transfer framing was malformed
    #[display("invalid chunk headers")]
    InvalidChunkHeaders,

    /// Response carried both Content-Length and Transfer-Encoding: chunked
    #[display("response used both Content-Length and chunked transfer encoding")]
    LengthAndChunkingBothUsed,

    /// Connection yielded EOF before the first status byte
    #[display("no response data received")]
    NoResponseDataReceived,

    /// HTTP proxy refused the CONNECT request
    #[display("proxy CONNECT to {host}:{port} failed with status {status}")]
    ProxyConnect {
        host: String,
        port: u16,
        status: StatusCode,
    },

    /// TLS handshake or record-layer failure
    #[display("TLS error: {_0}")]
    Tls(rustls::Error),

    /// Transport I/O failure
    #[display("IO error: {_0}")]
    Io(io::Error),

    /// The manager was closed while requests were still being issued
    #[display("connection manager is closed")]
    ManagerClosed,
}

impl std::error::Error for HttpError {}

impl From<io::Error> for HttpError {
    fn from(err: io::Error) -> HttpError {
        HttpError::Io(err)
    }
}

impl From<rustls::Error> for HttpError {
    fn from(err: rustls::Error) -> HttpError {
        HttpError::Tls(err)
    }
}

/// Default re-typing of raw I/O errors: timeouts become `ResponseTimeout`,
/// unexpected EOF becomes `ConnectionClosed`, the rest stay wrapped.
pub fn wrap_io_default(err: io::Error) -> HttpError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => HttpError::ResponseTimeout,
        io::ErrorKind::UnexpectedEof => HttpError::ConnectionClosed,
        _ => HttpError::Io(err),
    }
}

/// Default retry predicate: failures that occur when a pooled peer went away
/// between requests.
pub fn retryable_default(err: &HttpError) -> bool {
    match err {
        HttpError::ConnectionClosed | HttpError::NoResponseDataReceived => true,
        HttpError::Io(err) => matches!(
            err.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}
