//! Status line and header parsing from a connection.

use bytes::BytesMut;
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode, Version};

use crate::connection::Connection;
use crate::error::HttpError;
use crate::response::ResponseHead;

/// Cap on the accumulated status line + header bytes.
pub(crate) const MAX_HEAD_SIZE: usize = 4096;

/// Read and parse a response head, leaving any bytes past the terminating
/// `\r\n\r\n` in the connection's pushback buffer.
///
/// On an I/O failure (including a timeout while waiting for `100 Continue`)
/// the bytes accumulated so far are pushed back, so the read can be resumed.
pub(crate) fn read_response_head(conn: &mut Connection) -> Result<ResponseHead, HttpError> {
    let mut acc = BytesMut::new();
    let mut searched: usize = 0;

    loop {
        if acc.len() >= 4 {
            let start = searched.saturating_sub(3);
            if let Some(pos) = find_terminator(&acc[start..]) {
                let head_end = start + pos;
                if head_end + 4 > MAX_HEAD_SIZE {
                    return Err(HttpError::OverlongHeaders);
                }
                conn.unread(&acc[head_end + 4..]);
                return parse_head(&acc[..head_end]);
            }
            searched = acc.len();
        }

        if acc.len() > MAX_HEAD_SIZE {
            return Err(HttpError::OverlongHeaders);
        }

        let chunk = match conn.read() {
            Ok(chunk) => chunk,
            Err(err) => {
                conn.unread(&acc);
                return Err(HttpError::Io(err));
            }
        };
        if chunk.is_empty() {
            return if acc.is_empty() {
                Err(HttpError::NoResponseDataReceived)
            } else {
                Err(HttpError::ConnectionClosed)
            };
        }
        acc.extend_from_slice(&chunk);
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(buf: &[u8]) -> Result<ResponseHead, HttpError> {
    let mut lines = buf.split(|&b| b == b'\n').map(|l| l.strip_suffix(b"\r").unwrap_or(l));

    let status_line = lines.next().unwrap_or(b"");
    let (version, status, reason) = parse_status_line(status_line)?;

    // fold continuation lines onto the previous value before typing names
    let mut raw: Vec<(&[u8], Vec<u8>)> = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            match raw.last_mut() {
                Some((_, value)) => {
                    value.push(b' ');
                    value.extend_from_slice(trim_ows(line));
                }
                None => return Err(invalid_header(line)),
            }
            continue;
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| invalid_header(line))?;
        if colon == 0 {
            return Err(invalid_header(line));
        }
        raw.push((&line[..colon], trim_ows(&line[colon + 1..]).to_vec()));
    }

    let mut headers = HeaderMap::with_capacity(raw.len());
    for (name, value) in raw {
        let name = HeaderName::from_bytes(name).map_err(|_| invalid_header(name))?;
        let value = HeaderValue::from_bytes(&value).map_err(|_| invalid_header(&value))?;
        headers.append(name, value);
    }

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
    })
}

fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode, String), HttpError> {
    let invalid = || HttpError::InvalidStatusLine(String::from_utf8_lossy(line).into_owned());

    let rest = line.strip_prefix(b"HTTP/").ok_or_else(invalid)?;
    let sp = rest.iter().position(|&b| b == b' ').ok_or_else(invalid)?;
    let version = match &rest[..sp] {
        b"1.1" => Version::HTTP_11,
        b"1.0" => Version::HTTP_10,
        b"0.9" => Version::HTTP_09,
        _ => return Err(invalid()),
    };

    let rest = &rest[sp + 1..];
    let (code, reason) = match rest.iter().position(|&b| b == b' ') {
        Some(sp) => (&rest[..sp], &rest[sp + 1..]),
        None => (rest, &b""[..]),
    };
    if code.len() != 3 {
        return Err(invalid());
    }
    let status = std::str::from_utf8(code)
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .and_then(|n| StatusCode::from_u16(n).ok())
        .ok_or_else(invalid)?;

    Ok((version, status, String::from_utf8_lossy(reason).into_owned()))
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

fn invalid_header(raw: &[u8]) -> HttpError {
    HttpError::InvalidHeader(String::from_utf8_lossy(raw).into_owned())
}

/// Parse Content-Length, rejecting conflicting duplicates.
pub(crate) fn content_length(headers: &HeaderMap) -> Result<Option<u64>, HttpError> {
    let mut len = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| invalid_header(value.as_bytes()))?;
        if len.replace(parsed).is_some_and(|prev| prev != parsed) {
            return Err(invalid_header(value.as_bytes()));
        }
    }
    Ok(len)
}

/// Whether Transfer-Encoding includes the `chunked` token.
pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
    header_has_token(headers, TRANSFER_ENCODING, "chunked")
}

/// Keep-alive eligibility of the response framing layer: HTTP/1.1 (or an
/// explicit `keep-alive`) and no `Connection: close`.
pub(crate) fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
    if header_has_token(headers, CONNECTION, "close") {
        return false;
    }
    version >= Version::HTTP_11 || header_has_token(headers, CONNECTION, "keep-alive")
}

fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}
