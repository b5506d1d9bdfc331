use std::{
    fmt::{self, Display, Formatter},
    io::{Error, ErrorKind, Result},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::{Address, AddressType, Credentials};

const SOCKS5_VER: u8 = 0x05;
const SOCKS5_AUTH_VER: u8 = 0x01;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_RSV: u8 = 0x00;
const SOCKS5_AUTH_SUCCESS: u8 = 0x00;

/// SOCKS5 authentication methods as defined in RFC 1928 section 3.
///
/// The client only ever offers [`AuthMethod::NoAuth`] and
/// [`AuthMethod::UserPass`]. Whatever else a server selects is kept as
/// [`AuthMethod::Other`] so it can be reported.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AuthMethod {
    /// No authentication required (0x00).
    NoAuth,
    /// Username/password authentication, RFC 1929 (0x02).
    UserPass,
    /// None of the offered methods are acceptable (0xFF).
    NoAcceptable,
    /// Any other method id.
    Other(u8),
}

impl From<u8> for AuthMethod {
    fn from(value: u8) -> Self {
        match value {
            0x00 => AuthMethod::NoAuth,
            0x02 => AuthMethod::UserPass,
            0xFF => AuthMethod::NoAcceptable,
            other => AuthMethod::Other(other),
        }
    }
}

impl From<AuthMethod> for u8 {
    fn from(value: AuthMethod) -> Self {
        match value {
            AuthMethod::NoAuth => 0x00,
            AuthMethod::UserPass => 0x02,
            AuthMethod::NoAcceptable => 0xFF,
            AuthMethod::Other(other) => other,
        }
    }
}

/// SOCKS5 server reply codes as defined in RFC 1928 section 6.
///
/// The handshake only distinguishes `Succeeded` from everything else. The
/// named codes exist so a failed reply can be described in error messages.
///
/// Reference: <https://datatracker.ietf.org/doc/html/rfc1928#section-6>
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Socks5Reply {
    /// X'00', the request was granted.
    Succeeded = 0x00,
    /// X'01'
    GeneralFailure = 0x01,
    /// X'02', refused by the server's ruleset.
    ConnectionNotAllowed = 0x02,
    /// X'03'
    NetworkUnreachable = 0x03,
    /// X'04'
    HostUnreachable = 0x04,
    /// X'05', the destination refused the connection.
    ConnectionRefused = 0x05,
    /// X'06'
    TTLExpired = 0x06,
    /// X'07'
    CommandNotSupported = 0x07,
    /// X'08'
    AddressTypeNotSupported = 0x08,
}

impl TryFrom<u8> for Socks5Reply {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0x00 => Ok(Socks5Reply::Succeeded),
            0x01 => Ok(Socks5Reply::GeneralFailure),
            0x02 => Ok(Socks5Reply::ConnectionNotAllowed),
            0x03 => Ok(Socks5Reply::NetworkUnreachable),
            0x04 => Ok(Socks5Reply::HostUnreachable),
            0x05 => Ok(Socks5Reply::ConnectionRefused),
            0x06 => Ok(Socks5Reply::TTLExpired),
            0x07 => Ok(Socks5Reply::CommandNotSupported),
            0x08 => Ok(Socks5Reply::AddressTypeNotSupported),
            other => Err(other),
        }
    }
}

impl Display for Socks5Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::GeneralFailure => write!(f, "general SOCKS server failure"),
            Self::ConnectionNotAllowed => write!(f, "connection not allowed by ruleset"),
            Self::NetworkUnreachable => write!(f, "network unreachable"),
            Self::HostUnreachable => write!(f, "host unreachable"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::TTLExpired => write!(f, "TTL expired"),
            Self::CommandNotSupported => write!(f, "command not supported"),
            Self::AddressTypeNotSupported => write!(f, "address type not supported"),
        }
    }
}

fn reply_reason(code: &u8) -> String {
    match Socks5Reply::try_from(*code) {
        Ok(reply) => format!("{} ({:#04x})", reply, code),
        Err(code) => format!("unassigned reply code {:#04x}", code),
    }
}

/// Runs the complete client handshake over an already-open stream.
///
/// The three phases run strictly in order: authentication negotiation, the
/// `CONNECT` request for `host:port`, then the server's reply. The first
/// failing phase aborts the handshake. The stream is then left in an
/// unspecified state and should be dropped.
///
/// # Arguments
/// * `stream` - A mutable reference to a stream connected to the proxy.
/// * `credentials` - Username/password to offer, if any.
/// * `host` - Destination host. Dotted-quad IPv4 literals are sent as IPv4,
///   anything else as a domain name.
/// * `port` - Destination port.
///
/// # Returns
/// * `Result<()>` - Success once the proxy has confirmed the connection. Errors
///   carry a [`Socks5Error`] that can be recovered with `downcast`.
pub async fn socks5_handshake<T>(
    stream: &mut T,
    credentials: &Credentials,
    host: &str,
    port: u16,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_auth(stream, credentials).await?;
    write_connect_request(stream, host, port).await?;
    read_connect_reply(stream).await?;
    Ok(())
}

/// Negotiates the authentication method with the proxy.
///
/// Offers `NoAuth` alone, or `NoAuth` followed by `UserPass` when
/// `credentials` are valid. If the server picks `UserPass`, runs the RFC 1929
/// sub-negotiation. Any selection other than `NoAuth` or `UserPass` is rejected.
///
/// Returns the method the server selected.
pub async fn negotiate_auth<T>(stream: &mut T, credentials: &Credentials) -> Result<AuthMethod>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let offered: &[AuthMethod] = if credentials.is_valid() {
        &[AuthMethod::NoAuth, AuthMethod::UserPass]
    } else {
        &[AuthMethod::NoAuth]
    };

    // Write client greeting
    write_client_hello(stream, offered).await?;

    // Read server greeting
    let selected = read_server_hello(stream).await?;
    debug!(?offered, ?selected, "SOCKS5 auth method selected");

    match selected {
        AuthMethod::NoAuth => (), // No authentication required
        AuthMethod::UserPass => {
            let (username, password) = credentials
                .pair()
                .ok_or(Socks5Error::CredentialsUnavailable)?;
            write_auth_request(stream, username, password).await?;
            read_auth_response(stream).await?;
        }
        other => return Err(Socks5Error::AuthMethodRejected(other.into()).into()),
    }

    Ok(selected)
}

/// Sends the `CONNECT` request for `host:port`.
///
/// According to RFC 1928, connection request format is:
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
/// The address is IPv4 when `host` is a dotted-quad literal and a domain name
/// otherwise. A domain longer than 255 bytes fails before anything is written.
pub async fn write_connect_request<T>(writer: &mut T, host: &str, port: u16) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    let address = Address::for_destination(host, port);
    if let Address::DomainName((domain, _)) = &address {
        if domain.len() > 255 {
            return Err(Socks5Error::DomainTooLong(domain.len()).into());
        }
    }

    let mut request = vec![0u8; 3 + address.encoded_len()];
    request[..3].copy_from_slice(&[SOCKS5_VER, SOCKS5_CMD_CONNECT, SOCKS5_RSV]);
    address.encode_to_buf(&mut request[3..])?;

    debug!(destination = %address, "sending SOCKS5 connect request");
    write_exact(writer, &request).await
}

/// Reads and validates the proxy's reply to the `CONNECT` request.
///
/// According to RFC 1928, the connection response format is:
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
/// Exactly as many bytes as ATYP implies are consumed, so the stream is left
/// at the first byte of tunnelled data. The bound address is not validated. It
/// is returned when it decodes cleanly and `None` otherwise, e.g. for a domain
/// that is not UTF-8.
pub async fn read_connect_reply<T>(reader: &mut T) -> Result<Option<Address>>
where
    T: AsyncRead + Unpin,
{
    // VER, REP, RSV, ATYP
    let mut reply = vec![0u8; 4];
    read_exact(reader, &mut reply).await?;

    let (ver, rep, atyp) = (reply[0], reply[1], reply[3]);
    if ver != SOCKS5_VER {
        return Err(Socks5Error::ProtocolVersionMismatch {
            expected: SOCKS5_VER,
            actual: ver,
        }
        .into());
    }
    if rep != Socks5Reply::Succeeded as u8 {
        return Err(Socks5Error::ReplyCodeFailure(rep).into());
    }

    let addr_len = match AddressType::try_from(atyp) {
        Ok(AddressType::IPv4) => 4,
        Ok(AddressType::IPv6) => 16,
        Ok(AddressType::DomainName) => {
            let mut len = [0u8; 1];
            read_exact(reader, &mut len).await?;
            reply.push(len[0]);
            len[0] as usize
        }
        Err(_) => return Err(Socks5Error::UnsupportedAddressType(atyp).into()),
    };

    // BND.ADDR + BND.PORT in one read
    let start = reply.len();
    reply.resize(start + addr_len + 2, 0);
    read_exact(reader, &mut reply[start..]).await?;

    let bound = Address::decode_from_buf(&reply[3..])
        .ok()
        .map(|(address, _)| address);
    trace!(?bound, consumed = reply.len(), "SOCKS5 connect reply received");
    Ok(bound)
}

/// According to RFC 1928, client hello format is:
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
async fn write_client_hello<T>(writer: &mut T, methods: &[AuthMethod]) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    let mut hello = Vec::with_capacity(2 + methods.len());
    hello.push(SOCKS5_VER);
    hello.push(methods.len() as u8);
    hello.extend(methods.iter().map(|m| u8::from(*m)));

    write_exact(writer, &hello).await
}

/// According to RFC 1928, server hello format is:
/// ```text
/// +----+--------+
/// |VER | METHOD |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
/// METHOD: Server's selected authentication method, 0xFF means none of the client's methods are acceptable
async fn read_server_hello<T>(reader: &mut T) -> Result<AuthMethod>
where
    T: AsyncRead + Unpin,
{
    let mut hello = [0u8; 2];
    read_exact(reader, &mut hello).await?;

    if hello[0] != SOCKS5_VER {
        return Err(Socks5Error::ProtocolVersionMismatch {
            expected: SOCKS5_VER,
            actual: hello[0],
        }
        .into());
    }

    Ok(AuthMethod::from(hello[1]))
}

/// According to RFC 1929, username/password authentication request format is:
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
async fn write_auth_request<T>(writer: &mut T, username: &str, password: &str) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    let (username, password) = (username.as_bytes(), password.as_bytes());
    if username.len() > 255 || password.len() > 255 {
        return Err(Socks5Error::CredentialTooLong.into());
    }

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(SOCKS5_AUTH_VER);
    request.push(username.len() as u8);
    request.extend_from_slice(username);
    request.push(password.len() as u8);
    request.extend_from_slice(password);

    write_exact(writer, &request).await
}

/// According to RFC 1929, username/password authentication response format is:
/// ```text
/// +----+--------+
/// |VER | STATUS |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
/// STATUS: Authentication result, 0x00 means success, other values mean failure.
async fn read_auth_response<T>(reader: &mut T) -> Result<()>
where
    T: AsyncRead + Unpin,
{
    let mut response = [0u8; 2];
    read_exact(reader, &mut response).await?;

    if response[0] != SOCKS5_AUTH_VER {
        return Err(Socks5Error::ProtocolVersionMismatch {
            expected: SOCKS5_AUTH_VER,
            actual: response[0],
        }
        .into());
    }
    if response[1] != SOCKS5_AUTH_SUCCESS {
        return Err(Socks5Error::AuthStatusFailure(response[1]).into());
    }

    Ok(())
}

async fn write_exact<T>(writer: &mut T, buf: &[u8]) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    let written = match writer.write_all(buf).await {
        Ok(()) => writer.flush().await,
        Err(e) => Err(e),
    };
    written.map_err(|e| {
        debug!(error = %e, expected = buf.len(), "SOCKS5 write failed");
        Error::from(Socks5Error::ShortWrite {
            expected: buf.len(),
        })
    })
}

async fn read_exact<T>(reader: &mut T, buf: &mut [u8]) -> Result<()>
where
    T: AsyncRead + Unpin,
{
    let expected = buf.len();
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) => {
            debug!(error = %e, expected, "SOCKS5 read failed");
            Err(Socks5Error::ShortRead { expected }.into())
        }
    }
}

/// Errors that can occur while dialing through a SOCKS5 proxy.
///
/// Public functions return [`std::io::Error`]. The variant is preserved inside
/// and can be recovered with `io::Error::downcast::<Socks5Error>()`.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Socks5Error {
    /// The TCP connection to the proxy could not be established.
    #[error("Proxy {endpoint} unreachable: {kind}")]
    ProxyUnreachable {
        /// The `host:port` that was dialed.
        endpoint: String,
        /// Kind of the underlying transport error.
        kind: ErrorKind,
    },
    /// A message could not be written in full.
    #[error("Short write: could not send {expected} bytes")]
    ShortWrite {
        /// Length of the message.
        expected: usize,
    },
    /// Fewer bytes than required could be read, EOF included.
    #[error("Short read: could not receive {expected} bytes")]
    ShortRead {
        /// Number of bytes the read required.
        expected: usize,
    },
    /// The server answered with an unexpected protocol or sub-negotiation version.
    #[error("Protocol version mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ProtocolVersionMismatch {
        #[allow(missing_docs)]
        expected: u8,
        #[allow(missing_docs)]
        actual: u8,
    },
    /// The server selected NoAcceptable (0xFF) or a method the client never offered.
    #[error("Authentication method {0:#04x} rejected")]
    AuthMethodRejected(u8),
    /// The server selected username/password but no valid credentials are configured.
    #[error("Username/password authentication selected without credentials")]
    CredentialsUnavailable,
    /// The username or password exceeds 255 bytes.
    #[error("Username or password too long")]
    CredentialTooLong,
    /// The username/password sub-negotiation returned a non-zero status.
    #[error("Authentication failed with status {0:#04x}")]
    AuthStatusFailure(u8),
    /// The reply carries an address type outside IPv4, domain name and IPv6.
    #[error("Unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),
    /// The server refused the connect request.
    #[error("Connect request failed: {}", reply_reason(.0))]
    ReplyCodeFailure(u8),
    /// The destination domain name exceeds 255 bytes.
    #[error("Domain name too long: {0} bytes")]
    DomainTooLong(usize),
    /// The destination host is empty.
    #[error("Empty destination host")]
    EmptyDestination,
}

impl From<Socks5Error> for Error {
    fn from(e: Socks5Error) -> Self {
        match e {
            Socks5Error::ProxyUnreachable { kind, .. } => Error::new(kind, e),
            Socks5Error::ShortWrite { .. } => Error::new(ErrorKind::WriteZero, e),
            Socks5Error::ShortRead { .. } => Error::new(ErrorKind::UnexpectedEof, e),
            Socks5Error::ProtocolVersionMismatch { .. } => Error::new(ErrorKind::InvalidData, e),
            Socks5Error::AuthMethodRejected(_) => Error::new(ErrorKind::PermissionDenied, e),
            Socks5Error::CredentialsUnavailable => Error::new(ErrorKind::PermissionDenied, e),
            Socks5Error::CredentialTooLong => Error::new(ErrorKind::InvalidInput, e),
            Socks5Error::AuthStatusFailure(_) => Error::new(ErrorKind::PermissionDenied, e),
            Socks5Error::UnsupportedAddressType(_) => Error::new(ErrorKind::InvalidData, e),
            Socks5Error::ReplyCodeFailure(_) => Error::new(ErrorKind::ConnectionRefused, e),
            Socks5Error::DomainTooLong(_) => Error::new(ErrorKind::InvalidInput, e),
            Socks5Error::EmptyDestination => Error::new(ErrorKind::InvalidInput, e),
        }
    }
}
