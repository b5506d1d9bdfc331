use std::{
    io::{Error, ErrorKind, Result},
    sync::Arc,
    time::Duration,
};

use derive_builder::Builder;
use tokio::{net::TcpStream, time::timeout};
use tracing::debug;

use crate::{HostResolver, NoResolve, ProxyEndpoint, Socks5Error, socks5_handshake};

/// Dials destinations through a SOCKS5 proxy.
///
/// Each [`connect`](Socks5Dialer::connect) call opens its own TCP connection
/// to the proxy and runs the handshake exactly once. Nothing is shared between
/// calls except this configuration.
#[derive(Clone, Debug, Builder)]
pub struct Socks5Dialer {
    /// Upper bound for the TCP connect to the proxy. Unbounded by default.
    /// The handshake itself is never timed out.
    #[builder(default, setter(into, strip_option))]
    connect_timeout: Option<Duration>,
    /// Destination host substitution, applied before the request is encoded.
    #[builder(default = "NoResolve::arc()")]
    resolver: Arc<dyn HostResolver>,
}

impl Default for Socks5Dialer {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            resolver: NoResolve::arc(),
        }
    }
}

impl Socks5Dialer {
    /// Creates a dialer with no connect timeout and no host substitution.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a builder for a custom configuration.
    pub fn builder() -> Socks5DialerBuilder {
        Socks5DialerBuilder::default()
    }

    /// Configured connect timeout, if any.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Connects to `dest_host:dest_port` through the proxy named by `proxy_url`.
    ///
    /// # Arguments
    /// * `proxy_url` - `[socks5://][user:pass@]host:port`. Credentials are only
    ///   used when both are present and non-empty.
    /// * `dest_host` - Destination host. It is passed through the resolver first.
    /// * `dest_port` - Destination port.
    ///
    /// # Returns
    /// * `Result<TcpStream>` - A stream tunnelled to the destination. On any
    ///   failure the proxy connection is closed and the error carries a
    ///   [`Socks5Error`].
    pub async fn connect(
        &self,
        proxy_url: &str,
        dest_host: &str,
        dest_port: u16,
    ) -> Result<TcpStream> {
        if dest_host.is_empty() {
            return Err(Socks5Error::EmptyDestination.into());
        }

        let (proxy_addr, credentials) = ProxyEndpoint::parse(proxy_url).into_parts();
        let mut stream = self.connect_proxy(&proxy_addr).await?;

        let resolved = self
            .resolver
            .resolve(dest_host)
            .filter(|host| !host.is_empty());
        let host = resolved.as_deref().unwrap_or(dest_host);
        debug!(proxy = %proxy_addr, host, port = dest_port, "dialing through SOCKS5 proxy");

        if let Err(e) = socks5_handshake(&mut stream, &credentials, host, dest_port).await {
            debug!(proxy = %proxy_addr, error = %e, "SOCKS5 handshake failed, closing connection");
            return Err(e);
        }

        Ok(stream)
    }

    async fn connect_proxy(&self, addr: &str) -> Result<TcpStream> {
        let result = match self.connect_timeout {
            Some(limit) => timeout(limit, TcpStream::connect(addr))
                .await
                .unwrap_or_else(|_| Err(Error::from(ErrorKind::TimedOut))),
            None => TcpStream::connect(addr).await,
        };

        result.map_err(|e| {
            debug!(proxy = %addr, error = %e, "SOCKS5 proxy unreachable");
            Error::from(Socks5Error::ProxyUnreachable {
                endpoint: addr.to_string(),
                kind: e.kind(),
            })
        })
    }
}

/// Connects to `dest_host:dest_port` through the proxy named by `proxy_url`
/// using a default [`Socks5Dialer`].
///
/// The returned stream is owned by the caller and already tunnelled to the
/// destination. See [`Socks5Dialer::connect`].
pub async fn socks5_connect(proxy_url: &str, dest_host: &str, dest_port: u16) -> Result<TcpStream> {
    Socks5Dialer::default()
        .connect(proxy_url, dest_host, dest_port)
        .await
}
