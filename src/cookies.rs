//! RFC 6265 cookie jar.
//!
//! The jar is caller-owned: the engine takes a jar value and hands back an
//! updated one, so concurrent requests never share mutable cookie state.

use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};

use cookie::Cookie as SetCookie;
use http::header::{HeaderValue, COOKIE, SET_COOKIE};

use crate::request::Request;
use crate::response::ResponseHead;

/// Effective lifetime given to cookies without Expires/Max-Age. They are
/// session cookies (`persistent == false`) but need a concrete expiry for
/// the eviction order.
const SESSION_LIFETIME: Duration = Duration::from_secs(1000 * 365 * 24 * 60 * 60);

/// A stored cookie. Identity is `(name, domain, path)`.
#[derive(Clone, Debug)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub expiry: SystemTime,
    pub domain: String,
    pub path: String,
    pub creation_time: SystemTime,
    pub last_access_time: SystemTime,
    pub persistent: bool,
    pub host_only: bool,
    pub secure_only: bool,
    pub http_only: bool,
}

impl PartialEq for Cookie {
    fn eq(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

impl Eq for Cookie {}

/// A set of cookies unique under `(name, domain, path)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn new() -> CookieJar {
        CookieJar::default()
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Insert, replacing any cookie with the same identity.
    pub fn insert(&mut self, cookie: Cookie) {
        self.cookies.retain(|existing| existing != &cookie);
        self.cookies.push(cookie);
    }
}

impl FromIterator<Cookie> for CookieJar {
    fn from_iter<I: IntoIterator<Item = Cookie>>(iter: I) -> CookieJar {
        let mut jar = CookieJar::new();
        for cookie in iter {
            jar.insert(cookie);
        }
        jar
    }
}

/// RFC 6265 §5.1.3. A host matches a domain either exactly or as a
/// dot-separated suffix, and never by suffix when the host is an IPv4
/// literal.
pub(crate) fn domain_matches(host: &str, domain: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();
    if host == domain {
        return true;
    }
    host.len() > domain.len()
        && host.ends_with(&domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
        && host.parse::<Ipv4Addr>().is_err()
}

/// RFC 6265 §5.1.4 path matching.
pub(crate) fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

/// RFC 6265 §5.1.4 default path: the directory component of the request
/// path, keeping the trailing slash.
pub(crate) fn default_path(request_path: &str) -> String {
    if request_path.is_empty() || !request_path.starts_with('/') {
        return "/".to_string();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => request_path[..=idx].to_string(),
    }
}

/// The "never reject" public-suffix stub; swap in a real list via
/// [`receive_set_cookie_with`] to enforce rejection.
fn is_public_suffix(_domain: &str) -> bool {
    false
}

/// Remove every cookie that has expired by `now`.
pub fn evict_expired_cookies(mut jar: CookieJar, now: SystemTime) -> CookieJar {
    jar.cookies.retain(|cookie| cookie.expiry >= now);
    jar
}

/// Apply the jar to a request: evict expired cookies, pick the cookies whose
/// domain/path/secure scope matches, and replace the request's `Cookie`
/// header with them sorted longest-path-first, then earliest-creation-first.
///
/// Returns the jar with access times refreshed.
pub fn insert_cookies_into_request(req: &mut Request, jar: CookieJar, now: SystemTime) -> CookieJar {
    let mut jar = evict_expired_cookies(jar, now);
    let host = req.host.to_ascii_lowercase();
    let path = if req.path.starts_with('/') {
        req.path.clone()
    } else {
        "/".to_string()
    };

    let mut matched: Vec<&mut Cookie> = jar
        .cookies
        .iter_mut()
        .filter(|cookie| {
            let domain_ok = if cookie.host_only {
                host == cookie.domain
            } else {
                domain_matches(&host, &cookie.domain)
            };
            domain_ok && path_matches(&path, &cookie.path) && (!cookie.secure_only || req.secure)
        })
        .collect();

    matched.sort_by(|a, b| {
        b.path
            .len()
            .cmp(&a.path.len())
            .then(a.creation_time.cmp(&b.creation_time))
    });

    req.headers.remove(COOKIE);
    if !matched.is_empty() {
        let mut header = String::new();
        for cookie in &mut matched {
            cookie.last_access_time = now;
            if !header.is_empty() {
                header.push_str("; ");
            }
            header.push_str(&cookie.name);
            header.push('=');
            header.push_str(&cookie.value);
        }
        match HeaderValue::from_str(&header) {
            Ok(value) => {
                req.headers.insert(COOKIE, value);
            }
            Err(err) => log::error!("unemittable Cookie header: {err}"),
        }
    }

    jar
}

/// Fold every `Set-Cookie` of a response into the jar.
pub fn update_cookie_jar(
    mut jar: CookieJar,
    head: &ResponseHead,
    req: &Request,
    now: SystemTime,
) -> CookieJar {
    for value in head.headers.get_all(SET_COOKIE) {
        let raw = String::from_utf8_lossy(value.as_bytes());
        jar = receive_set_cookie(jar, &raw, req, true, now);
    }
    jar
}

/// Process one `Set-Cookie` value per RFC 6265 §5.3. `http_api` says whether
/// the caller is an HTTP API, which gates HttpOnly cookies.
pub fn receive_set_cookie(
    jar: CookieJar,
    set_cookie: &str,
    req: &Request,
    http_api: bool,
    now: SystemTime,
) -> CookieJar {
    receive_set_cookie_with(jar, set_cookie, req, http_api, now, &is_public_suffix)
}

/// [`receive_set_cookie`] with an explicit public-suffix predicate.
pub fn receive_set_cookie_with(
    mut jar: CookieJar,
    set_cookie: &str,
    req: &Request,
    http_api: bool,
    now: SystemTime,
    public_suffix: &dyn Fn(&str) -> bool,
) -> CookieJar {
    let parsed = match SetCookie::parse(set_cookie) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::debug!("ignoring unparseable Set-Cookie: {err}");
            return jar;
        }
    };

    // Max-Age wins over Expires; neither makes a session cookie with an
    // effectively unbounded expiry
    let far_future = now.checked_add(SESSION_LIFETIME).unwrap_or(now);
    let (expiry, persistent) = if let Some(max_age) = parsed.max_age() {
        let secs = max_age.whole_seconds();
        if secs <= 0 {
            (SystemTime::UNIX_EPOCH, true)
        } else {
            (
                now.checked_add(Duration::from_secs(secs as u64))
                    .unwrap_or(far_future),
                true,
            )
        }
    } else if let Some(expires) = parsed.expires_datetime() {
        (SystemTime::from(expires), true)
    } else {
        (far_future, false)
    };

    let request_host = req.host.to_ascii_lowercase();
    // exactly one leading dot is tolerated
    let raw_domain = parsed.domain().unwrap_or("").trim();
    let raw_domain = raw_domain.strip_prefix('.').unwrap_or(raw_domain);
    let mut domain = raw_domain.to_ascii_lowercase();
    if domain.ends_with('.') {
        return jar;
    }
    if !domain.is_empty() && public_suffix(&domain) {
        if request_host == domain {
            domain.clear();
        } else {
            return jar;
        }
    }
    let host_only = if domain.is_empty() {
        domain = request_host.clone();
        true
    } else {
        if !domain_matches(&request_host, &domain) {
            return jar;
        }
        false
    };

    let path = match parsed.path() {
        Some(path) if path.starts_with('/') => path.to_string(),
        _ => default_path(&req.path),
    };

    let http_only = parsed.http_only().unwrap_or(false);
    if http_only && !http_api {
        return jar;
    }

    let mut creation_time = now;
    if let Some(existing) = jar
        .cookies
        .iter()
        .position(|c| c.name == parsed.name() && c.domain == domain && c.path == path)
    {
        if jar.cookies[existing].http_only && !http_api {
            return jar;
        }
        creation_time = jar.cookies[existing].creation_time;
        jar.cookies.remove(existing);
    }

    jar.cookies.push(Cookie {
        name: parsed.name().to_string(),
        value: parsed.value().to_string(),
        expiry,
        domain,
        path,
        creation_time,
        last_access_time: now,
        persistent,
        host_only,
        secure_only: parsed.secure().unwrap_or(false),
        http_only,
    });
    jar
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn request(url: &str) -> Request {
        Request::parse_url(url).unwrap()
    }

    fn cookie_header(req: &Request) -> Option<String> {
        req.headers
            .get(COOKIE)
            .map(|v| v.to_str().unwrap().to_string())
    }

    #[test]
    fn domain_matching() {
        assert!(domain_matches("example.com", "example.com"));
        assert!(domain_matches("www.example.com", "example.com"));
        assert!(domain_matches("a.b.example.com", "example.com"));
        assert!(!domain_matches("badexample.com", "example.com"));
        assert!(!domain_matches("example.com", "www.example.com"));
        // IPv4 literals never match by suffix
        assert!(!domain_matches("10.0.0.1", "0.0.1"));
        assert!(domain_matches("10.0.0.1", "10.0.0.1"));
    }

    #[test]
    fn path_matching() {
        assert!(path_matches("/a/b", "/a/b"));
        assert!(path_matches("/a/b/c", "/a/b"));
        assert!(path_matches("/a/b/c", "/a/b/"));
        assert!(!path_matches("/a/bc", "/a/b"));
        assert!(!path_matches("/x", "/a"));
        assert!(path_matches("/anything", "/"));
    }

    #[test]
    fn default_path_rules() {
        assert_eq!(default_path(""), "/");
        assert_eq!(default_path("relative"), "/");
        assert_eq!(default_path("/"), "/");
        assert_eq!(default_path("/leaf"), "/");
        assert_eq!(default_path("/a/b"), "/a/");
        assert_eq!(default_path("/a/b/"), "/a/b/");
    }

    #[test]
    fn set_cookie_scopes_to_path() {
        let origin = request("http://example.com/a/b");
        let jar = receive_set_cookie(
            CookieJar::new(),
            "foo=bar; Path=/a; Domain=example.com",
            &origin,
            true,
            at(100),
        );
        assert_eq!(jar.cookies().len(), 1);

        // sibling under /a sees the cookie
        let mut sibling = request("http://example.com/a/c");
        let jar = insert_cookies_into_request(&mut sibling, jar, at(200));
        assert_eq!(cookie_header(&sibling).as_deref(), Some("foo=bar"));

        // the root does not
        let mut root = request("http://example.com/");
        insert_cookies_into_request(&mut root, jar, at(200));
        assert_eq!(cookie_header(&root), None);
    }

    #[test]
    fn emission_orders_longer_paths_then_earlier_creation() {
        let origin = request("http://example.com/a/b/c");
        let mut jar = CookieJar::new();
        jar = receive_set_cookie(jar, "outer=1; Path=/a", &origin, true, at(10));
        jar = receive_set_cookie(jar, "late=3; Path=/a/b", &origin, true, at(30));
        jar = receive_set_cookie(jar, "early=2; Path=/a/b", &origin, true, at(20));

        let mut req = request("http://example.com/a/b/c");
        insert_cookies_into_request(&mut req, jar, at(100));
        assert_eq!(
            cookie_header(&req).as_deref(),
            Some("early=2; late=3; outer=1")
        );
    }

    #[test]
    fn max_age_wins_over_expires() {
        let origin = request("http://example.com/");
        let jar = receive_set_cookie(
            CookieJar::new(),
            "foo=bar; Max-Age=60; Expires=Wed, 09 Jun 2100 10:18:14 GMT",
            &origin,
            true,
            at(1_000),
        );
        let cookie = &jar.cookies()[0];
        assert!(cookie.persistent);
        assert_eq!(cookie.expiry, at(1_060));
    }

    #[test]
    fn non_positive_max_age_expires_immediately() {
        let origin = request("http://example.com/");
        let jar = receive_set_cookie(
            CookieJar::new(),
            "foo=bar; Max-Age=0",
            &origin,
            true,
            at(1_000),
        );
        let jar = evict_expired_cookies(jar, at(1_000));
        assert!(jar.is_empty());
    }

    #[test]
    fn session_cookies_are_not_persistent() {
        let origin = request("http://example.com/");
        let jar = receive_set_cookie(CookieJar::new(), "sid=1", &origin, true, at(0));
        let cookie = &jar.cookies()[0];
        assert!(!cookie.persistent);
        assert!(cookie.expiry > at(1_000_000));
    }

    #[test]
    fn absent_domain_is_host_only() {
        let origin = request("http://example.com/");
        let jar = receive_set_cookie(CookieJar::new(), "sid=1", &origin, true, at(0));
        assert!(jar.cookies()[0].host_only);

        // subdomain request must not see a host-only cookie
        let mut sub = request("http://www.example.com/");
        insert_cookies_into_request(&mut sub, jar, at(10));
        assert_eq!(cookie_header(&sub), None);
    }

    #[test]
    fn leading_dot_is_trimmed_and_trailing_dot_rejects() {
        let origin = request("http://www.example.com/");
        let jar = receive_set_cookie(
            CookieJar::new(),
            "a=1; Domain=.example.com",
            &origin,
            true,
            at(0),
        );
        let cookie = &jar.cookies()[0];
        assert_eq!(cookie.domain, "example.com");
        assert!(!cookie.host_only);

        let jar = receive_set_cookie(
            CookieJar::new(),
            "a=1; Domain=example.com.",
            &origin,
            true,
            at(0),
        );
        assert!(jar.is_empty());
    }

    #[test]
    fn foreign_domain_rejects() {
        let origin = request("http://example.com/");
        let jar = receive_set_cookie(
            CookieJar::new(),
            "a=1; Domain=other.org",
            &origin,
            true,
            at(0),
        );
        assert!(jar.is_empty());

        // narrower than the request host also rejects
        let jar = receive_set_cookie(
            CookieJar::new(),
            "a=1; Domain=www.example.com",
            &origin,
            true,
            at(0),
        );
        assert!(jar.is_empty());
    }

    #[test]
    fn public_suffix_rejection_behind_predicate() {
        let origin = request("http://foo.co.uk/");
        let suffixes = |domain: &str| domain == "co.uk";

        let jar = receive_set_cookie_with(
            CookieJar::new(),
            "a=1; Domain=co.uk",
            &origin,
            true,
            at(0),
            &suffixes,
        );
        assert!(jar.is_empty());

        // unless the request host IS the suffix, which stores host-only
        let origin = request("http://co.uk/");
        let jar = receive_set_cookie_with(
            CookieJar::new(),
            "a=1; Domain=co.uk",
            &origin,
            true,
            at(0),
            &suffixes,
        );
        assert_eq!(jar.cookies().len(), 1);
        assert!(jar.cookies()[0].host_only);

        // the default stub never rejects
        let origin = request("http://foo.co.uk/");
        let jar = receive_set_cookie(CookieJar::new(), "a=1; Domain=co.uk", &origin, true, at(0));
        assert_eq!(jar.cookies().len(), 1);
    }

    #[test]
    fn http_only_rules() {
        let origin = request("http://example.com/");

        // non-http caller cannot store an HttpOnly cookie
        let jar = receive_set_cookie(CookieJar::new(), "a=1; HttpOnly", &origin, false, at(0));
        assert!(jar.is_empty());

        // nor replace one stored by an http caller
        let jar = receive_set_cookie(CookieJar::new(), "a=1; HttpOnly", &origin, true, at(0));
        let replaced = receive_set_cookie(jar, "a=2", &origin, false, at(10));
        assert_eq!(replaced.cookies().len(), 1);
        assert_eq!(replaced.cookies()[0].value, "1");
    }

    #[test]
    fn replacement_inherits_creation_time() {
        let origin = request("http://example.com/");
        let jar = receive_set_cookie(CookieJar::new(), "a=1", &origin, true, at(10));
        let jar = receive_set_cookie(jar, "a=2", &origin, true, at(99));
        let cookie = &jar.cookies()[0];
        assert_eq!(cookie.value, "2");
        assert_eq!(cookie.creation_time, at(10));
        assert_eq!(cookie.last_access_time, at(99));
    }

    #[test]
    fn secure_cookies_stay_off_plain_requests() {
        let origin = request("https://example.com/");
        let jar = receive_set_cookie(CookieJar::new(), "s=1; Secure", &origin, true, at(0));

        let mut plain = request("http://example.com/");
        let jar = insert_cookies_into_request(&mut plain, jar, at(10));
        assert_eq!(cookie_header(&plain), None);

        let mut tls = request("https://example.com/");
        insert_cookies_into_request(&mut tls, jar, at(10));
        assert_eq!(cookie_header(&tls).as_deref(), Some("s=1"));
    }

    #[test]
    fn eviction_removes_everything_expired() {
        let origin = request("http://example.com/");
        let mut jar = CookieJar::new();
        jar = receive_set_cookie(jar, "a=1; Max-Age=50", &origin, true, at(0));
        jar = receive_set_cookie(jar, "b=2; Max-Age=500", &origin, true, at(0));

        let jar = evict_expired_cookies(jar, at(100));
        assert_eq!(jar.cookies().len(), 1);
        assert_eq!(jar.cookies()[0].name, "b");
        assert!(jar.cookies().iter().all(|c| c.expiry >= at(100)));
    }

    #[test]
    fn insertion_replaces_caller_cookie_header() {
        let origin = request("http://example.com/");
        let jar = receive_set_cookie(CookieJar::new(), "real=1", &origin, true, at(0));

        let mut req = request("http://example.com/").header("cookie", "stale=1");
        insert_cookies_into_request(&mut req, jar, at(10));
        assert_eq!(cookie_header(&req).as_deref(), Some("real=1"));
    }
}
