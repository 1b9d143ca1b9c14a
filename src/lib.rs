//! Synchronous HTTP/1.1 client with pooled keep-alive connections.
//!
//! `courier` performs request/response exchanges over plain TCP and TLS,
//! manages a shared pool of reusable connections with a background idle
//! reaper, supports HTTP and SOCKS proxies (including CONNECT tunneling),
//! streams request and response bodies, follows redirects with an auditable
//! history, and applies an RFC 6265 cookie jar.
//!
//! ```rust,no_run
//! use courier::{Manager, Request};
//!
//! fn main() -> Result<(), courier::HttpError> {
//!     let manager = Manager::with_default_settings();
//!
//!     let request = Request::parse_url("https://www.rust-lang.org/")?
//!         .header("user-agent", "courier");
//!     let (response, body) = courier::send_buffered(request, &manager)?;
//!
//!     println!("{} ({} bytes)", response.status(), body.len());
//!     Ok(())
//! }
//! ```
//!
//! Many callers may share one [`Manager`] concurrently; each call blocks its
//! own thread. Closing the manager (explicitly or by dropping the last
//! handle) closes every pooled connection exactly once.

#![deny(rust_2018_idioms, nonstandard_style)]
#![warn(missing_debug_implementations)]

mod config;
mod connection;
mod connector;
mod cookies;
mod encoding;
mod error;
mod h1;
mod h1proto;
mod pool;
mod proxy;
mod redirect;
mod request;
mod response;
mod sender;
#[cfg(test)]
mod test_util;

pub use self::config::ManagerSettings;
pub use self::connection::{Connection, Io};
pub use self::connector::{Dialer, RustlsDialer, SocksDialer};
pub use self::cookies::{
    evict_expired_cookies, insert_cookies_into_request, receive_set_cookie,
    receive_set_cookie_with, update_cookie_jar, Cookie, CookieJar,
};
pub use self::error::HttpError;
pub use self::pool::Manager;
pub use self::proxy::{HttpProxy, SocksProxy};
pub use self::request::{
    urlencode, BodyErrorAction, BodySource, Request, RequestBody, ResponseTimeout,
};
pub use self::response::{Response, ResponseHead};

use bytes::Bytes;

/// Send a request, following redirects, and return the streaming response.
///
/// The connection backing the response returns to the pool once the body is
/// drained, or is closed if the response is dropped early.
pub fn send(request: Request, manager: &Manager) -> Result<Response, HttpError> {
    redirect::send_with_redirects(request, manager)
}

/// Scoped streaming access: the action sees an open [`Response`] and all
/// resources are freed when it returns, whether it succeeds or fails.
pub fn with_response<T>(
    request: Request,
    manager: &Manager,
    action: impl FnOnce(&mut Response) -> Result<T, HttpError>,
) -> Result<T, HttpError> {
    let mut response = send(request, manager)?;
    let result = action(&mut response);
    response.close();
    result
}

/// Send a request and buffer the whole response body.
pub fn send_buffered(
    request: Request,
    manager: &Manager,
) -> Result<(Response, Bytes), HttpError> {
    let mut response = send(request, manager)?;
    let body = response.body_bytes()?;
    Ok((response, body))
}
