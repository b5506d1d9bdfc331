//! Test doubles for the handshake: an in-memory duplex stream and a scripted
//! SOCKS5 server listening on a real TCP socket.

use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing_subscriber::EnvFilter;

use crate::Address;

/// Installs a test-friendly `tracing` subscriber filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Encodes a connect reply `[VER, REP, RSV, ATYP, BND.ADDR, BND.PORT]`.
pub fn encode_reply(reply_code: u8, bound: &Address) -> Vec<u8> {
    let mut reply = vec![0u8; 3 + bound.encoded_len()];
    reply[..3].copy_from_slice(&[0x05, reply_code, 0x00]);
    bound.encode_to_buf(&mut reply[3..]).unwrap();
    reply
}

/// A mock implementation of a bidirectional stream that can be used for testing
/// asynchronous network code without requiring actual network connections.
#[derive(Debug)]
pub struct MockStream {
    rx: Arc<Mutex<SharedState>>,
    tx: Arc<Mutex<SharedState>>,
}

/// Internal shared state for the stream's read and write buffers.
#[derive(Debug, Default)]
struct SharedState {
    buffer: VecDeque<u8>,
    closed: bool,
    waker: Option<Waker>,
}

/// Creates a pair of connected mock streams for testing bidirectional communication.
///
/// Data written to one stream can be read from the other.
pub fn create_mock_stream() -> (MockStream, MockStream) {
    let state1 = Arc::new(Mutex::new(SharedState::default()));
    let state2 = Arc::new(Mutex::new(SharedState::default()));

    // read from state1, write to state2
    let stream1 = MockStream {
        rx: state1.clone(),
        tx: state2.clone(),
    };

    // read from state2, write to state1
    let stream2 = MockStream {
        rx: state2,
        tx: state1,
    };

    (stream1, stream2)
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut rx = self.rx.lock().unwrap();

        if !rx.buffer.is_empty() {
            let to_read = std::cmp::min(buf.remaining(), rx.buffer.len());
            let chunk: Vec<u8> = rx.buffer.drain(..to_read).collect();
            buf.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else if rx.closed {
            // If the channel is closed and no data is available, return EOF.
            Poll::Ready(Ok(()))
        } else {
            // No data available, register waker for notification
            rx.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(self.write_immediate(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl MockStream {
    /// Immediately writes data to the peer without using async operations.
    ///
    /// Used to script a server's responses before the client runs.
    pub fn write_immediate(&self, data: &[u8]) -> io::Result<usize> {
        let mut tx = self.tx.lock().unwrap();

        if tx.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "writing to a closed stream",
            ));
        }

        tx.buffer.extend(data.iter().copied());

        // Notify any reader waiting for data
        if let Some(waker) = tx.waker.take() {
            waker.wake();
        }

        Ok(data.len())
    }

    /// Drains every byte the peer has written so far.
    pub fn read_available(&self) -> io::Result<Vec<u8>> {
        let mut rx = self.rx.lock().unwrap();
        Ok(rx.buffer.drain(..).collect())
    }

    /// Closes the writing half: the peer reads EOF once its buffer is empty,
    /// and further writes from this side fail.
    pub fn close(&self) {
        let mut tx = self.tx.lock().unwrap();
        tx.closed = true;

        // Notify any reader waiting for data (possibly waiting for EOF)
        if let Some(waker) = tx.waker.take() {
            waker.wake();
        }
    }
}

/// What [`FakeProxy`] does at each step of the handshake.
#[derive(Clone, Debug)]
pub struct FakeProxyScript {
    /// Method id answered to the greeting.
    pub method: u8,
    /// Sub-negotiation status, used when `method` is 0x02.
    pub auth_status: u8,
    /// REP field of the connect reply.
    pub reply_code: u8,
    /// Bound address sent in the connect reply.
    pub bound: Address,
}

impl FakeProxyScript {
    /// A proxy that selects NoAuth and accepts the request.
    pub fn no_auth(bound: Address) -> Self {
        Self {
            method: 0x00,
            auth_status: 0x00,
            reply_code: 0x00,
            bound,
        }
    }

    /// A proxy that selects UserPass, accepts any credentials and the request.
    pub fn userpass(bound: Address) -> Self {
        Self {
            method: 0x02,
            ..Self::no_auth(bound)
        }
    }
}

/// Raw client messages captured by [`FakeProxy`].
#[derive(Debug, Default)]
pub struct Transcript {
    /// Method selection message.
    pub greeting: Vec<u8>,
    /// Username/password sub-negotiation, if one took place.
    pub auth_request: Option<Vec<u8>>,
    /// Connect request.
    pub request: Vec<u8>,
}

/// A single-connection SOCKS5 server that follows a [`FakeProxyScript`].
#[derive(Debug)]
pub struct FakeProxy {
    addr: SocketAddr,
    task: JoinHandle<(Transcript, TcpStream)>,
}

impl FakeProxy {
    /// Binds to an ephemeral local port and serves one client in the background.
    pub async fn spawn(script: FakeProxyScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let transcript = serve(&mut socket, &script).await;
            (transcript, socket)
        });
        Self { addr, task }
    }

    /// Address the proxy listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Waits for the handshake to finish, checks that data written by the
    /// proxy reaches `client` through the tunnel, and returns the transcript.
    pub async fn finish(self, client: &mut TcpStream) -> Transcript {
        let (transcript, mut socket) = self.task.await.unwrap();

        socket.write_all(b"tunnel").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tunnel");

        transcript
    }

    /// Waits for the script to finish and reports whether the client has
    /// closed its end of the connection.
    pub async fn peer_closed(self) -> bool {
        let (_, mut socket) = self.task.await.unwrap();
        let mut buf = [0u8; 1];
        // A reset counts as closed: the client may drop unread reply bytes
        matches!(socket.read(&mut buf).await, Ok(0) | Err(_))
    }
}

async fn serve(socket: &mut TcpStream, script: &FakeProxyScript) -> Transcript {
    let mut transcript = Transcript::default();

    // VER, NMETHODS, METHODS
    let mut greeting = vec![0u8; 2];
    socket.read_exact(&mut greeting).await.unwrap();
    greeting.resize(2 + greeting[1] as usize, 0);
    socket.read_exact(&mut greeting[2..]).await.unwrap();
    transcript.greeting = greeting;
    socket.write_all(&[0x05, script.method]).await.unwrap();

    if script.method == 0x02 {
        // VER, ULEN, UNAME, PLEN, PASSWD
        let mut auth = vec![0u8; 2];
        socket.read_exact(&mut auth).await.unwrap();
        let ulen = auth[1] as usize;
        auth.resize(2 + ulen + 1, 0);
        socket.read_exact(&mut auth[2..]).await.unwrap();
        let plen = auth[2 + ulen] as usize;
        let start = auth.len();
        auth.resize(start + plen, 0);
        socket.read_exact(&mut auth[start..]).await.unwrap();
        transcript.auth_request = Some(auth);

        socket.write_all(&[0x01, script.auth_status]).await.unwrap();
        if script.auth_status != 0x00 {
            return transcript;
        }
    }

    // VER, CMD, RSV, ATYP and the first address byte
    let mut request = vec![0u8; 5];
    socket.read_exact(&mut request).await.unwrap();
    let remaining = match request[3] {
        0x01 => 3 + 2,
        0x03 => request[4] as usize + 2,
        0x04 => 15 + 2,
        atyp => panic!("unexpected address type {:#04x}", atyp),
    };
    let start = request.len();
    request.resize(start + remaining, 0);
    socket.read_exact(&mut request[start..]).await.unwrap();
    transcript.request = request;

    socket
        .write_all(&encode_reply(script.reply_code, &script.bound))
        .await
        .unwrap();
    transcript
}

#[tokio::test]
async fn test_basic_read_write() {
    let (mut stream1, mut stream2) = create_mock_stream();

    let data = b"Hello, world!";
    let write_len = stream1.write(data).await.unwrap();
    assert_eq!(write_len, data.len());

    let mut buf = vec![0u8; 20];
    let read_len = stream2.read(&mut buf).await.unwrap();
    assert_eq!(read_len, data.len());
    assert_eq!(&buf[..read_len], data);
}

#[tokio::test]
async fn test_shutdown() {
    let (mut stream1, mut stream2) = create_mock_stream();

    stream1.write_all(b"Last message").await.unwrap();
    stream1.shutdown().await.unwrap();

    let mut buf = vec![0u8; 20];
    let read_len = stream2.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..read_len], b"Last message");

    let read_len = stream2.read(&mut buf).await.unwrap();
    assert_eq!(read_len, 0);

    assert!(stream1.write_all(b"late").await.is_err());
}
