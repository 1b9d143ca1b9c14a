//! Redirect following with an auditable history.

use bytes::Bytes;
use http::header::{AUTHORIZATION, COOKIE, LOCATION};
use http::{Method, StatusCode};

use crate::error::HttpError;
use crate::pool::Manager;
use crate::request::{Request, RequestBody};
use crate::response::{Response, ResponseHead};
use crate::sender;

/// Send a request, following 3xx responses up to the request's redirect
/// budget. The final response carries the heads of every followed hop.
pub(crate) fn send_with_redirects(
    mut req: Request,
    mgr: &Manager,
) -> Result<Response, HttpError> {
    let budget = req.redirect_count;
    let mut history: Vec<ResponseHead> = Vec::new();

    loop {
        let mut response = sender::perform_request(&mut req, mgr)?;

        let status = response.status();
        let location = if is_redirect(status) && budget > 0 {
            response.headers().get(LOCATION).cloned()
        } else {
            None
        };
        let location = match location {
            Some(location) => location,
            None => {
                response.history = history;
                response.effective_url = req.render_url();
                return Ok(response);
            }
        };

        if history.len() == budget {
            let _ = response.drain();
            return Err(HttpError::TooManyRedirects(history));
        }

        let target = location
            .to_str()
            .ok()
            .and_then(|location| resolve_location(&req, location));
        let target = match target {
            Some(target) => target,
            None => {
                let head = response.head().clone();
                let _ = response.drain();
                return Err(HttpError::UnparseableRedirect(head));
            }
        };

        // the intermediate body must be consumed before the connection can
        // serve the next hop
        let head = response.head().clone();
        if response.drain().is_err() {
            response.close();
        }
        history.push(head);

        let cross_host = !target.host.eq_ignore_ascii_case(&req.host)
            || target.port != req.port
            || target.secure != req.secure;
        if cross_host {
            // explicit credentials do not travel to other hosts; the jar
            // still applies under its own scoping rules
            req.headers.remove(AUTHORIZATION);
            req.headers.remove(COOKIE);
        }

        match status {
            StatusCode::SEE_OTHER => {
                req.method = Method::GET;
                req.body = RequestBody::empty();
            }
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND
                if req.legacy_redirect_get
                    && req.method != Method::GET
                    && req.method != Method::HEAD =>
            {
                req.method = Method::GET;
                req.body = RequestBody::empty();
            }
            _ => {}
        }

        req.secure = target.secure;
        req.host = target.host;
        req.port = target.port;
        req.path = target.path;
        req.query = target.query;

        log::debug!("following {status} redirect to {}", req.render_url());
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

struct Target {
    secure: bool,
    host: String,
    port: u16,
    path: String,
    query: Bytes,
}

impl Target {
    fn from_request(req: &Request) -> Target {
        Target {
            secure: req.secure,
            host: req.host.clone(),
            port: req.port,
            path: String::new(),
            query: Bytes::new(),
        }
    }
}

/// Resolve a Location value against the request it redirects, per the
/// RFC 3986 merge (without dot-segment normalization).
fn resolve_location(req: &Request, location: &str) -> Option<Target> {
    let location = location.split('#').next().unwrap_or("");
    if location.is_empty() {
        return None;
    }

    if location.starts_with("http://") || location.starts_with("https://") {
        let parsed = Request::parse_url(location).ok()?;
        return Some(Target {
            secure: parsed.secure,
            host: parsed.host,
            port: parsed.port,
            path: parsed.path,
            query: parsed.query,
        });
    }

    // scheme-relative: keep the scheme, replace the authority
    if let Some(rest) = location.strip_prefix("//") {
        let scheme = if req.secure { "https" } else { "http" };
        let parsed = Request::parse_url(&format!("{scheme}://{rest}")).ok()?;
        return Some(Target {
            secure: parsed.secure,
            host: parsed.host,
            port: parsed.port,
            path: parsed.path,
            query: parsed.query,
        });
    }

    // any other scheme is not followable
    if has_scheme(location) {
        return None;
    }

    let (path_part, query) = match location.split_once('?') {
        Some((path, query)) => (path, Bytes::from(format!("?{query}"))),
        None => (location, Bytes::new()),
    };

    let path = if path_part.starts_with('/') {
        path_part.to_string()
    } else if path_part.is_empty() {
        req.path.clone()
    } else {
        // merge with the directory of the current path
        match req.path.rfind('/') {
            Some(idx) => format!("{}{}", &req.path[..=idx], path_part),
            None => format!("/{path_part}"),
        }
    };

    let mut target = Target::from_request(req);
    target.path = path;
    target.query = query;
    Some(target)
}

/// RFC 3986 scheme prefix: ALPHA *( ALPHA / DIGIT / "+" / "-" / "." ) ":".
fn has_scheme(location: &str) -> bool {
    let colon = match location.find(':') {
        Some(idx) => idx,
        None => return false,
    };
    if location[..colon].is_empty() {
        return false;
    }
    // a colon inside the path or query is not a scheme separator
    if let Some(slash) = location.find(['/', '?']) {
        if slash < colon {
            return false;
        }
    }
    location[..colon]
        .bytes()
        .enumerate()
        .all(|(i, b)| b.is_ascii_alphabetic() || (i > 0 && matches!(b, b'0'..=b'9' | b'+' | b'-' | b'.')))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Request {
        Request::parse_url("http://example.com/a/b?orig=1").unwrap()
    }

    fn resolved(location: &str) -> Target {
        resolve_location(&base(), location).expect("location should resolve")
    }

    #[test]
    fn absolute_location() {
        let target = resolved("https://other.org:8443/new?x=2");
        assert!(target.secure);
        assert_eq!(target.host, "other.org");
        assert_eq!(target.port, 8443);
        assert_eq!(target.path, "/new");
        assert_eq!(&target.query[..], b"?x=2");
    }

    #[test]
    fn path_absolute_location_stays_on_origin() {
        let target = resolved("/moved");
        assert!(!target.secure);
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 80);
        assert_eq!(target.path, "/moved");
        assert!(target.query.is_empty());
    }

    #[test]
    fn relative_location_merges_with_directory() {
        let target = resolved("c/d");
        assert_eq!(target.path, "/a/c/d");

        let target = resolved("c?x=1");
        assert_eq!(target.path, "/a/c");
        assert_eq!(&target.query[..], b"?x=1");
    }

    #[test]
    fn scheme_relative_location_keeps_scheme() {
        let target = resolved("//other.org/p");
        assert!(!target.secure);
        assert_eq!(target.host, "other.org");
        assert_eq!(target.port, 80);
        assert_eq!(target.path, "/p");
    }

    #[test]
    fn fragments_are_dropped() {
        let target = resolved("/moved#section");
        assert_eq!(target.path, "/moved");
    }

    #[test]
    fn unfollowable_locations_are_rejected() {
        assert!(resolve_location(&base(), "").is_none());
        assert!(resolve_location(&base(), "ftp://other.org/file").is_none());
        assert!(resolve_location(&base(), "mailto:someone@example.com").is_none());
    }

    #[test]
    fn colons_later_in_the_path_are_not_schemes() {
        let target = resolved("/docs/a:b");
        assert_eq!(target.path, "/docs/a:b");

        let target = resolved("docs/a:b");
        assert_eq!(target.path, "/a/docs/a:b");
    }

    #[test]
    fn redirect_status_set() {
        assert!(is_redirect(StatusCode::MOVED_PERMANENTLY));
        assert!(is_redirect(StatusCode::FOUND));
        assert!(is_redirect(StatusCode::SEE_OTHER));
        assert!(is_redirect(StatusCode::TEMPORARY_REDIRECT));
        assert!(is_redirect(StatusCode::PERMANENT_REDIRECT));
        assert!(!is_redirect(StatusCode::OK));
        assert!(!is_redirect(StatusCode::NOT_MODIFIED));
    }
}
