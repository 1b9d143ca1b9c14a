//! Manager configuration.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::connector::{Dialer, SocksDialer};
use crate::error::{self, HttpError};
use crate::request::Request;

/// Settings for a [`crate::Manager`].
#[derive(Clone)]
pub struct ManagerSettings {
    /// How long an idle pooled connection may live before the reaper
    /// closes it.
    pub idle_timeout: Duration,

    /// Idle connections kept per pool key; releases beyond this are closed.
    pub max_idle_per_key: usize,

    /// How many times a request may be transparently replayed after a
    /// retryable failure on a reused connection.
    pub max_retries: usize,

    /// Deadline applied to connect + send + receive-headers when the
    /// request asks for [`crate::ResponseTimeout::Default`].
    pub default_response_timeout: Option<Duration>,

    /// TLS client configuration; `None` builds a webpki-roots default.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,

    /// Establishes TCP connections and wraps them in TLS. `None` uses the
    /// rustls dialer built from `tls_config`.
    pub dialer: Option<Arc<dyn Dialer>>,

    /// External SOCKS collaborator; requests with a SOCKS proxy fail
    /// without one installed.
    pub socks_dialer: Option<Arc<dyn SocksDialer>>,

    /// The single funnel through which raw I/O errors are re-typed.
    pub wrap_io: Arc<dyn Fn(io::Error) -> HttpError + Send + Sync>,

    /// Which failures on a reused connection warrant a transparent retry.
    pub retryable: Arc<dyn Fn(&HttpError) -> bool + Send + Sync>,

    /// Applied to every request before it is sent.
    pub modify_request: Option<Arc<dyn Fn(&mut Request) -> Result<(), HttpError> + Send + Sync>>,
}

impl Default for ManagerSettings {
    fn default() -> ManagerSettings {
        ManagerSettings {
            idle_timeout: Duration::from_secs(30),
            max_idle_per_key: 10,
            max_retries: 1,
            default_response_timeout: Some(Duration::from_secs(30)),
            tls_config: None,
            dialer: None,
            socks_dialer: None,
            wrap_io: Arc::new(error::wrap_io_default),
            retryable: Arc::new(error::retryable_default),
            modify_request: None,
        }
    }
}

impl std::fmt::Debug for ManagerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerSettings")
            .field("idle_timeout", &self.idle_timeout)
            .field("max_idle_per_key", &self.max_idle_per_key)
            .field("max_retries", &self.max_retries)
            .field("default_response_timeout", &self.default_response_timeout)
            .finish()
    }
}
