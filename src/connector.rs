//! TCP and TLS dialing, including proxy tunneling.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs as _};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use http::header::HeaderValue;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};

use crate::connection::{Connection, Io};
use crate::error::HttpError;
use crate::h1::parse;
use crate::proxy::{HttpProxy, SocksProxy};

/// Establishes the transport a [`Connection`] sits on.
///
/// Split in two so a CONNECT tunnel can interleave plaintext proxy traffic
/// between the TCP dial and the TLS wrap.
pub trait Dialer: Send + Sync {
    fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<TcpStream, HttpError>;

    /// Wrap an established stream in TLS with SNI set to `host`.
    fn wrap_tls(&self, host: &str, tcp: TcpStream) -> Result<Box<dyn Io>, HttpError>;
}

/// External SOCKS collaborator contract; TLS is layered on top of the
/// returned stream when the target is secure.
pub trait SocksDialer: Send + Sync {
    fn connect(
        &self,
        proxy: &SocksProxy,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> io::Result<TcpStream>;
}

/// Default dialer: blocking TCP via the system resolver, TLS via rustls
/// with webpki roots.
pub struct RustlsDialer {
    config: Arc<ClientConfig>,
}

impl RustlsDialer {
    pub fn new(config: Arc<ClientConfig>) -> RustlsDialer {
        RustlsDialer { config }
    }
}

impl std::fmt::Debug for RustlsDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsDialer").finish()
    }
}

impl Default for RustlsDialer {
    fn default() -> RustlsDialer {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        RustlsDialer::new(Arc::new(config))
    }
}

impl Dialer for RustlsDialer {
    fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<TcpStream, HttpError> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(HttpError::Io)?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            let attempt = match timeout {
                Some(t) => TcpStream::connect_timeout(&addr, t),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(HttpError::Io)?;
                    stream.set_read_timeout(timeout).map_err(HttpError::Io)?;
                    stream.set_write_timeout(timeout).map_err(HttpError::Io)?;
                    log::trace!("connected to {host}:{port} via {addr}");
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }

        let err = last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"));
        if err.kind() == io::ErrorKind::TimedOut || err.kind() == io::ErrorKind::WouldBlock {
            Err(HttpError::ConnectTimeout)
        } else {
            Err(HttpError::Io(err))
        }
    }

    fn wrap_tls(&self, host: &str, tcp: TcpStream) -> Result<Box<dyn Io>, HttpError> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|_| rustls::Error::General(format!("invalid server name `{host}`")))?;
        let session = ClientConnection::new(Arc::clone(&self.config), name)?;
        let mut stream = StreamOwned::new(session, tcp);

        // surface handshake failures here as TLS errors rather than lazily
        // on the first request write
        while stream.conn.is_handshaking() {
            stream
                .conn
                .complete_io(&mut stream.sock)
                .map_err(handshake_err)?;
        }

        Ok(Box::new(TlsIo { stream }))
    }
}

fn handshake_err(err: io::Error) -> HttpError {
    if err.kind() == io::ErrorKind::InvalidData {
        if let Some(inner) = err.into_inner() {
            return match inner.downcast::<rustls::Error>() {
                Ok(tls) => HttpError::Tls(*tls),
                Err(other) => {
                    HttpError::Io(io::Error::new(io::ErrorKind::InvalidData, other))
                }
            };
        }
        return HttpError::Tls(rustls::Error::General("handshake failed".to_string()));
    }
    HttpError::Io(err)
}

struct TlsIo {
    stream: StreamOwned<ClientConnection, TcpStream>,
}

impl Read for TlsIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TlsIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Io for TlsIo {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.sock.set_read_timeout(timeout)?;
        self.stream.sock.set_write_timeout(timeout)
    }

    fn shutdown(&mut self) {
        self.stream.conn.send_close_notify();
        let _ = self.stream.flush();
        let _ = self.stream.sock.shutdown(std::net::Shutdown::Both);
    }
}

/// The transport-level shape of one request: where the bytes first go and
/// which hops sit in between.
pub(crate) struct DialPlan<'a> {
    pub host: &'a str,
    pub port: u16,
    pub secure: bool,
    pub http_proxy: Option<&'a HttpProxy>,
    pub socks_proxy: Option<&'a SocksProxy>,
}

/// Dial a fresh connection according to the plan.
pub(crate) fn dial(
    dialer: &dyn Dialer,
    socks_dialer: Option<&dyn SocksDialer>,
    plan: &DialPlan<'_>,
    timeout: Option<Duration>,
) -> Result<Connection, HttpError> {
    if let Some(socks) = plan.socks_proxy {
        let socks_dialer = socks_dialer.ok_or_else(|| {
            HttpError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "no SOCKS dialer installed",
            ))
        })?;
        let tcp = socks_dialer
            .connect(socks, plan.host, plan.port, timeout)
            .map_err(HttpError::Io)?;
        return if plan.secure {
            Ok(Connection::new(dialer.wrap_tls(plan.host, tcp)?))
        } else {
            Ok(Connection::new(Box::new(tcp)))
        };
    }

    match plan.http_proxy {
        Some(proxy) if plan.secure => {
            let tcp = dialer.connect_tcp(&proxy.host, proxy.port, timeout)?;
            open_tunnel(&tcp, plan.host, plan.port, proxy.auth_header())?;
            Ok(Connection::new(dialer.wrap_tls(plan.host, tcp)?))
        }
        Some(proxy) => {
            let tcp = dialer.connect_tcp(&proxy.host, proxy.port, timeout)?;
            Ok(Connection::new(Box::new(tcp)))
        }
        None => {
            let tcp = dialer.connect_tcp(plan.host, plan.port, timeout)?;
            if plan.secure {
                Ok(Connection::new(dialer.wrap_tls(plan.host, tcp)?))
            } else {
                Ok(Connection::new(Box::new(tcp)))
            }
        }
    }
}

/// Ask an HTTP proxy to open a raw tunnel to `host:port`.
///
/// Runs on a duplicated handle of the proxy socket; on success the handle is
/// detached without shutdown so the TLS session can take over the stream.
fn open_tunnel(
    tcp: &TcpStream,
    host: &str,
    port: u16,
    auth: Option<HeaderValue>,
) -> Result<(), HttpError> {
    let authority = format_authority(host, port);
    let mut head = BytesMut::with_capacity(96);
    head.extend_from_slice(format!("CONNECT {authority} HTTP/1.1\r\n").as_bytes());
    head.extend_from_slice(format!("Host: {authority}\r\n").as_bytes());
    if let Some(auth) = auth {
        head.extend_from_slice(b"Proxy-Authorization: ");
        head.extend_from_slice(auth.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    let mut conn = Connection::new(Box::new(tcp.try_clone().map_err(HttpError::Io)?));
    conn.write_all(&head).map_err(HttpError::Io)?;
    let response = parse::read_response_head(&mut conn)?;
    if !response.status.is_success() {
        log::debug!("proxy refused CONNECT {authority}: {}", response.status);
        // dropping `conn` shuts the proxy socket down
        return Err(HttpError::ProxyConnect {
            host: host.to_string(),
            port,
            status: response.status,
        });
    }

    let _ = conn.into_io();
    Ok(())
}

/// `host:port`, bracketing IPv6 literals.
pub(crate) fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_brackets_ipv6() {
        assert_eq!(format_authority("example.com", 8080), "example.com:8080");
        assert_eq!(format_authority("::1", 443), "[::1]:443");
    }
}
