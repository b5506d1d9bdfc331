use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

const SCHEMES: [&str; 2] = ["socks5://", "socks5h://"];

/// Username/password pair for RFC 1929 authentication.
///
/// Either part may be missing. Credentials are only *valid*, and therefore only
/// offered to the proxy, when both parts are present and non-empty.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Credentials {
    username: Option<String>,
    password: Option<String>,
}

impl Credentials {
    /// Creates credentials from a username and a password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Creates credentials that carry a username but no password.
    pub fn username_only(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: None,
        }
    }

    /// Returns the username, if any.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Returns `true` when both username and password are present and non-empty.
    pub fn is_valid(&self) -> bool {
        self.pair().is_some()
    }

    /// Returns `(username, password)` when the credentials are valid.
    pub fn pair(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some((username, password))
            }
            _ => None,
        }
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A proxy parsed from a URL of the form `[socks5://][user:pass@]host:port`.
///
/// The `host:port` part is kept verbatim and handed to the TCP connect.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxyEndpoint {
    addr: String,
    credentials: Credentials,
}

impl ProxyEndpoint {
    /// Splits a proxy URL into its address and credentials.
    ///
    /// Credentials are only looked for when the URL contains `@`. The text
    /// before the first `@` is the user info. Within it, the username ends at
    /// the first `:` and the rest is the password. Parsing never fails. A
    /// malformed address surfaces when the proxy is dialed.
    pub fn parse(url: &str) -> Self {
        let rest = SCHEMES
            .iter()
            .find_map(|scheme| url.strip_prefix(scheme))
            .unwrap_or(url);
        let rest = rest.strip_suffix('/').unwrap_or(rest);

        match rest.split_once('@') {
            Some((userinfo, addr)) => {
                let credentials = match userinfo.split_once(':') {
                    Some((username, password)) => Credentials::new(username, password),
                    None => Credentials::username_only(userinfo),
                };
                Self {
                    addr: addr.to_string(),
                    credentials,
                }
            }
            None => Self {
                addr: rest.to_string(),
                credentials: Credentials::default(),
            },
        }
    }

    /// The proxy's `host:port`.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Credentials found in the URL.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Consumes the endpoint, returning its address and credentials.
    pub fn into_parts(self) -> (String, Credentials) {
        (self.addr, self.credentials)
    }
}

/// Substitutes destination hosts before the connect request is encoded.
///
/// Returning `None` or an empty string keeps the original host.
pub trait HostResolver: Send + Sync + Debug {
    /// Returns the address string to use instead of `host`, if any.
    fn resolve(&self, host: &str) -> Option<String>;
}

/// A resolver that never substitutes anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoResolve;

impl NoResolve {
    /// Returns the resolver as a shareable trait object.
    pub fn arc() -> Arc<dyn HostResolver> {
        Arc::new(Self)
    }
}

impl HostResolver for NoResolve {
    fn resolve(&self, _host: &str) -> Option<String> {
        None
    }
}

/// A fixed alias table mapping hostnames to replacement addresses.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    entries: HashMap<String, String>,
}

impl StaticResolver {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `host` to `addr`, replacing any previous entry.
    pub fn insert(&mut self, host: impl Into<String>, addr: impl Into<String>) -> &mut Self {
        self.entries.insert(host.into(), addr.into());
        self
    }
}

impl<K, V> FromIterator<(K, V)> for StaticResolver
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(host, addr)| (host.into(), addr.into()))
                .collect(),
        }
    }
}

impl HostResolver for StaticResolver {
    fn resolve(&self, host: &str) -> Option<String> {
        self.entries.get(host).cloned()
    }
}
