//! Single-hop request execution: proxy resolution, cookie application,
//! connection acquisition, the wire exchange, and retry handling.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};

use crate::connection::Connection;
use crate::connector::{self, DialPlan};
use crate::cookies::{self, CookieJar};
use crate::encoding::GzipDecoder;
use crate::error::HttpError;
use crate::h1::parse;
use crate::h1::payload::{self, PayloadReader};
use crate::h1proto;
use crate::pool::{ConnKey, Disposition, Manager};
use crate::proxy::{self, HttpProxy};
use crate::request::Request;
use crate::response::{Response, ResponseBody, ResponseHead};

/// Execute one request on the manager, without following redirects.
///
/// The request's cookie jar field is left holding the updated jar so a
/// redirect loop can keep threading it through.
pub(crate) fn perform_request(req: &mut Request, mgr: &Manager) -> Result<Response, HttpError> {
    let settings = mgr.settings();

    if let Some(hook) = &settings.modify_request {
        hook(req)?;
    }

    let proxy = proxy::resolve_proxy(req)?;

    if let Some(jar) = req.cookie_jar.take() {
        let jar = cookies::insert_cookies_into_request(req, jar, SystemTime::now());
        req.cookie_jar = Some(jar);
    }

    let use_socks = req.socks_proxy.is_some();
    let absolute_form = !use_socks && proxy.is_some() && !req.secure;
    let tunnel_or_direct_auth = proxy.as_ref().filter(|_| absolute_form);
    let proxy_auth = tunnel_or_direct_auth.and_then(HttpProxy::auth_header);

    let key = conn_key(req, proxy.as_ref());
    let deadline = req
        .response_timeout
        .resolve(settings.default_response_timeout)
        .map(|timeout| Instant::now() + timeout);

    let dial = {
        let dialer = Arc::clone(mgr.dialer());
        let socks_dialer = settings.socks_dialer.clone();
        let host = req.host.clone();
        let port = req.port;
        let secure = req.secure;
        let http_proxy = if use_socks { None } else { proxy.clone() };
        let socks_proxy = req.socks_proxy.clone();
        move || -> Result<Connection, HttpError> {
            let timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        return Err(HttpError::ConnectTimeout);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            let plan = DialPlan {
                host: &host,
                port,
                secure,
                http_proxy: http_proxy.as_ref(),
                socks_proxy: socks_proxy.as_ref(),
            };
            connector::dial(dialer.as_ref(), socks_dialer.as_deref(), &plan, timeout)
        }
    };

    // transparent retry: a pooled connection may have been closed by the
    // peer between requests; the first failed read/write on it is replayed
    // once on a fresh dial
    let mut attempts_left = settings.max_retries;
    let mut force_fresh = false;
    let (mut managed, head, request_complete) = loop {
        let mut managed = if force_fresh {
            mgr.acquire_fresh(&key, &dial)?
        } else {
            mgr.acquire(&key, &dial)?
        };
        managed.conn_mut().set_deadline(deadline);

        match h1proto::send_request(managed.conn_mut(), req, absolute_form, proxy_auth.clone()) {
            Ok((head, complete)) => break (managed, head, complete),
            Err(err) => {
                let reused = managed.is_reused();
                let err = managed.wrap_err(err);
                managed.release(Disposition::DontReuse);
                if reused && (settings.retryable)(&err) {
                    if attempts_left > 0 {
                        attempts_left -= 1;
                        force_fresh = true;
                        log::debug!("retrying request on a fresh connection after: {err}");
                        continue;
                    }
                    return Err(HttpError::TooManyRetries);
                }
                return Err(err);
            }
        }
    };

    // the deadline covers connect + send + headers only
    managed.conn_mut().set_deadline(None);

    let jar = match req.cookie_jar.take() {
        Some(jar) => {
            let jar = cookies::update_cookie_jar(jar, &head, req, SystemTime::now());
            req.cookie_jar = Some(jar.clone());
            jar
        }
        None => CookieJar::new(),
    };

    let framing = match payload::select_framing(&req.method, &head) {
        Ok(framing) => framing,
        Err(err) => {
            managed.release(Disposition::DontReuse);
            return Err(err);
        }
    };
    // an aborted request body leaves the connection out of sync with the
    // server, so it can never go back to the pool
    let keep_alive = request_complete && parse::keep_alive(head.version, &head.headers);

    let mut exposed = head.clone();
    let decoder = if should_gunzip(req, &head) {
        // callers see a decoded stream, so the encoding headers must go
        exposed.headers.remove(CONTENT_ENCODING);
        exposed.headers.remove(CONTENT_LENGTH);
        Some(GzipDecoder::new())
    } else {
        None
    };

    let body = ResponseBody::new(
        managed,
        PayloadReader::new(framing),
        decoder,
        keep_alive,
        Arc::clone(&settings.wrap_io),
    );
    let mut response = Response::new(exposed, body, jar, req.render_url());

    if !(req.check_status)(&head) {
        let status = head.status;
        let headers = head.headers;
        let cookie_jar = response.cookie_jar.clone();
        // drain so the connection can still be reused before failing
        let _ = response.drain();
        return Err(HttpError::Status {
            status,
            headers,
            cookie_jar,
        });
    }

    Ok(response)
}

fn conn_key(req: &Request, proxy: Option<&HttpProxy>) -> ConnKey {
    let proxy_key = if let Some(socks) = &req.socks_proxy {
        Some(format!("socks5://{}:{}", socks.host, socks.port))
    } else {
        proxy.map(|p| format!("http://{}:{}", p.host, p.port))
    };
    ConnKey {
        host: req.host.to_ascii_lowercase(),
        port: req.port,
        secure: req.secure,
        proxy: proxy_key,
    }
}

fn should_gunzip(req: &Request, head: &ResponseHead) -> bool {
    if req.raw_body {
        return false;
    }
    let gzipped = head.headers.get_all(CONTENT_ENCODING).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.trim().eq_ignore_ascii_case("gzip"))
            .unwrap_or(false)
    });
    if !gzipped {
        return false;
    }
    let content_type = head
        .headers
        .get(CONTENT_TYPE)
        .map(|v| v.as_bytes())
        .unwrap_or(b"");
    (req.decompress)(content_type)
}
