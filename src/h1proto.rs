//! One HTTP/1.x request/response exchange on an established connection.

use std::io;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use http::header::{HeaderValue, CONTENT_LENGTH, EXPECT, HOST, TRANSFER_ENCODING};
use http::{Method, StatusCode, Version};

use crate::connection::Connection;
use crate::connector::format_authority;
use crate::error::HttpError;
use crate::h1::{chunked, parse};
use crate::request::{BodyErrorAction, BodySize, Request, RequestBody};
use crate::response::ResponseHead;

/// How long to wait for `100 Continue` before sending the body anyway.
const CONTINUE_WAIT: Duration = Duration::from_secs(1);

/// Flush threshold while streaming a chunked request body.
const WRITE_HIGH_WATER: usize = 16 * 1024;

/// Write the request and read the response head. The response body is left
/// unread on the connection.
///
/// The returned flag says whether the request was written in full; when the
/// body was aborted (a final status during the 100-continue wait, or a
/// swallowed write failure) the connection is out of sync and must not be
/// pooled.
pub(crate) fn send_request(
    conn: &mut Connection,
    req: &Request,
    absolute_form: bool,
    proxy_auth: Option<HeaderValue>,
) -> Result<(ResponseHead, bool), HttpError> {
    let head = encode_head(req, absolute_form, proxy_auth);
    conn.write_all(&head)?;

    if wants_continue(req) {
        let outer = conn.deadline();
        let wait = Instant::now() + CONTINUE_WAIT;
        conn.set_deadline(Some(outer.map_or(wait, |o| o.min(wait))));

        match parse::read_response_head(conn) {
            Ok(interim) if interim.status == StatusCode::CONTINUE => {
                conn.set_deadline(outer);
            }
            Ok(interim) => {
                // a final status during the wait aborts the body
                conn.set_deadline(outer);
                return Ok((interim, false));
            }
            Err(HttpError::Io(err)) if is_timeout(&err) => {
                conn.set_deadline(outer);
                if outer.is_some_and(|o| Instant::now() >= o) {
                    return Err(HttpError::Io(err));
                }
                log::trace!("no 100-continue within {CONTINUE_WAIT:?}, sending body");
            }
            Err(err) => {
                conn.set_deadline(outer);
                return Err(err);
            }
        }
    }

    // even when the body write failed and was swallowed, the server may
    // have answered already
    let complete = send_body(conn, req)?;
    let head = read_final_head(conn)?;
    Ok((head, complete))
}

fn wants_continue(req: &Request) -> bool {
    !req.body.is_empty()
        && req.headers.get_all(EXPECT).iter().any(|value| {
            value
                .to_str()
                .map(|v| v.eq_ignore_ascii_case("100-continue"))
                .unwrap_or(false)
        })
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

fn read_final_head(conn: &mut Connection) -> Result<ResponseHead, HttpError> {
    loop {
        let head = parse::read_response_head(conn)?;
        if head.status == StatusCode::CONTINUE {
            continue;
        }
        return Ok(head);
    }
}

fn encode_head(req: &Request, absolute_form: bool, proxy_auth: Option<HeaderValue>) -> BytesMut {
    let mut dst = BytesMut::with_capacity(256);

    dst.extend_from_slice(req.method.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    if absolute_form {
        if req.port == 80 {
            dst.extend_from_slice(format!("http://{}", bracketed(&req.host)).as_bytes());
        } else {
            dst.extend_from_slice(
                format!("http://{}", format_authority(&req.host, req.port)).as_bytes(),
            );
        }
    }
    if req.path.starts_with('/') {
        dst.extend_from_slice(req.path.as_bytes());
    } else {
        dst.extend_from_slice(b"/");
        dst.extend_from_slice(req.path.as_bytes());
    }
    dst.extend_from_slice(&req.query);
    dst.extend_from_slice(match req.version {
        Version::HTTP_10 => b" HTTP/1.0\r\n",
        _ => b" HTTP/1.1\r\n",
    });

    // Host is always computed, eliding default ports
    dst.extend_from_slice(b"host: ");
    if req.port == 80 || req.port == 443 {
        dst.extend_from_slice(bracketed(&req.host).as_bytes());
    } else {
        dst.extend_from_slice(format_authority(&req.host, req.port).as_bytes());
    }
    dst.extend_from_slice(b"\r\n");

    // so is the body length
    match req.body.size() {
        BodySize::Known(0) => {
            if matches!(req.method, Method::POST | Method::PUT | Method::PATCH) {
                dst.extend_from_slice(b"content-length: 0\r\n");
            }
        }
        BodySize::Known(len) => {
            dst.extend_from_slice(format!("content-length: {len}\r\n").as_bytes());
        }
        BodySize::Chunked => {
            dst.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }
    }

    if let Some(auth) = proxy_auth {
        dst.extend_from_slice(b"proxy-authorization: ");
        dst.extend_from_slice(auth.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    let body_empty = req.body.is_empty();
    for (name, value) in req.headers.iter() {
        if name == HOST || name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        // an Expect on a bodiless request would stall the server
        if name == EXPECT && body_empty {
            continue;
        }
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    dst.extend_from_slice(b"\r\n");
    dst
}

fn bracketed(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Write the request body. Returns `false` if the write failed but the
/// request's body-error handler elected to read a response anyway.
fn send_body(conn: &mut Connection, req: &Request) -> Result<bool, HttpError> {
    match write_body(conn, &req.body) {
        Ok(()) => Ok(true),
        Err(HttpError::Io(err)) => match (req.on_body_error)(&err) {
            BodyErrorAction::ReadResponse => {
                log::debug!("body write failed ({err}), reading response anyway");
                Ok(false)
            }
            BodyErrorAction::Raise => Err(HttpError::Io(err)),
        },
        Err(err) => Err(err),
    }
}

fn write_body(conn: &mut Connection, body: &RequestBody) -> Result<(), HttpError> {
    match body {
        RequestBody::Bytes(bytes) => {
            if !bytes.is_empty() {
                conn.write_all(bytes)?;
            }
            Ok(())
        }
        RequestBody::Builder { len, write } => {
            let mut sink = CountingWriter { conn, written: 0 };
            write(&mut sink).map_err(HttpError::Io)?;
            ensure_body_length(*len, sink.written)
        }
        RequestBody::Stream { len, source } => {
            let mut written = 0u64;
            for item in source.start() {
                let bytes = item.map_err(HttpError::Io)?;
                conn.write_all(&bytes)?;
                written += bytes.len() as u64;
            }
            ensure_body_length(*len, written)
        }
        RequestBody::StreamChunked { source } => {
            let mut buf = BytesMut::new();
            for item in source.start() {
                let bytes = item.map_err(HttpError::Io)?;
                chunked::encode_chunk(&mut buf, &bytes);
                if buf.len() >= WRITE_HIGH_WATER {
                    conn.write_all(&buf)?;
                    buf.clear();
                }
            }
            chunked::encode_eof(&mut buf);
            conn.write_all(&buf)?;
            Ok(())
        }
    }
}

fn ensure_body_length(declared: u64, written: u64) -> Result<(), HttpError> {
    if declared == written {
        Ok(())
    } else {
        Err(HttpError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("request body produced {written} bytes, declared {declared}"),
        )))
    }
}

/// `io::Write` adapter over a connection that tracks how many bytes the
/// caller's writer produced.
struct CountingWriter<'a> {
    conn: &'a mut Connection,
    written: u64,
}

impl io::Write for CountingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
