//! The WebSocket tunnel channel.
//!
//! One channel owns one WebSocket connection and moves encrypted IP packets
//! across it, one binary message per packet. Writes are serialized through a
//! bounded channel drained by a single writer task; reads happen on the task
//! that calls [`TunnelChannel::run`] (client) or [`accept_connection`]
//! (server). The forwarding engine is wired in through the [`PacketRouter`]
//! capability trait at construction time.

use crate::crypto::PacketCipher;
use crate::error::{VpnError, VpnResult};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::HOST;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close reason sent to peers that fail the token handshake.
pub const AUTH_FAILED_REASON: &str = "Authentication failed";

/// Buffer size of the per-connection outbound packet channel.
///
/// Sized to absorb bursts without masking backpressure; a full buffer blocks
/// the sender rather than dropping packets.
pub const OUTBOUND_CHANNEL_SIZE: usize = 1024;

/// Lifecycle of a tunnel channel. Only `Running` accepts writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Disconnected = 0,
    Connecting = 1,
    Authenticated = 2,
    Running = 3,
    Failed = 4,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ChannelState::Connecting,
            2 => ChannelState::Authenticated,
            3 => ChannelState::Running,
            4 => ChannelState::Failed,
            _ => ChannelState::Disconnected,
        }
    }
}

/// Atomically shared channel state.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: ChannelState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ChannelState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Write handle for one tunnel connection.
///
/// Cloneable; all clones feed the same writer task, which is the only task
/// touching the WebSocket sink. Sends fail once the channel leaves the
/// `Running` state or the writer task is gone.
#[derive(Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<Vec<u8>>,
    state: Arc<StateCell>,
}

impl PeerHandle {
    fn new(tx: mpsc::Sender<Vec<u8>>, state: Arc<StateCell>) -> Self {
        Self { tx, state }
    }

    /// Queue an encrypted frame for transmission.
    pub async fn send(&self, frame: Vec<u8>) -> VpnResult<()> {
        let state = self.state.get();
        if state != ChannelState::Running {
            return Err(VpnError::Transport(format!(
                "channel not running ({:?})",
                state
            )));
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| VpnError::ConnectionLost("writer task gone".into()))
    }

    /// Current state of the owning channel.
    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    /// Handle backed by a bare channel in the `Running` state, for exercising
    /// the forwarding paths without a socket.
    #[cfg(test)]
    pub(crate) fn test_pair(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self::new(tx, Arc::new(StateCell::new(ChannelState::Running)));
        (handle, rx)
    }
}

/// Result of a successful authentication: the address now bound to the
/// connection and the cipher for its session key.
pub struct AuthGrant {
    /// Virtual address assigned to the peer.
    pub ip: Ipv4Addr,
    /// Cipher keyed by the peer's session key.
    pub cipher: Arc<PacketCipher>,
}

/// Capability interface the forwarding engine exposes to its channels.
///
/// Both callbacks are invoked from the channel's read task; `peer_closed`
/// runs exactly once when a server-side connection ends, before the write
/// handle becomes invalid.
pub trait PacketRouter: Send + Sync + 'static {
    /// Validate the token presented as the first frame of a connection and
    /// bind the connection's write handle to the user's virtual address.
    /// `None` means the connection must be closed as unauthenticated.
    fn authenticate(
        &self,
        token: &str,
        conn: PeerHandle,
    ) -> impl Future<Output = Option<AuthGrant>> + Send;

    /// Handle one inbound encrypted frame from the tunnel.
    fn tunnel_to_device(
        &self,
        cipher: &PacketCipher,
        frame: &[u8],
    ) -> impl Future<Output = ()> + Send;

    /// The connection serving `ip` has terminated; release its record.
    fn peer_closed(&self, ip: Ipv4Addr);
}

/// Spawn the single writer task draining `rx` into the WebSocket sink.
fn spawn_writer<S>(mut sink: S, mut rx: mpsc::Receiver<Vec<u8>>) -> tokio::task::JoinHandle<()>
where
    S: futures::Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(Message::Binary(frame)).await {
                log::debug!("websocket write error: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    })
}

/// Drive the read side until the connection terminates. Clean close returns
/// `Ok`; a broken transport returns the terminal error.
async fn read_frames<R, S>(stream: &mut S, router: &R, cipher: &PacketCipher) -> VpnResult<()>
where
    R: PacketRouter,
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(frame)) => router.tunnel_to_device(cipher, &frame).await,
            Ok(Message::Close(_)) => return Ok(()),
            Ok(_) => {} // ping/pong/text carry no packets
            Err(e) => return Err(VpnError::ConnectionLost(e.to_string())),
        }
    }
    Ok(())
}

/// Client side of the tunnel: one dialed connection to the server.
pub struct TunnelChannel {
    state: Arc<StateCell>,
    handle: PeerHandle,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
    ws: WsStream,
}

impl TunnelChannel {
    /// Dial the server, upgrade to WebSocket and present the token as the
    /// first frame. On return the channel is `Authenticated`; a bad token
    /// only surfaces later as a server-initiated close.
    pub async fn connect(
        addr: &str,
        host_header: Option<&str>,
        token: &str,
    ) -> VpnResult<TunnelChannel> {
        let state = Arc::new(StateCell::new(ChannelState::Connecting));

        let url = if addr.starts_with("ws://") || addr.starts_with("wss://") {
            addr.to_string()
        } else {
            format!("ws://{}", addr)
        };
        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|e| VpnError::Transport(format!("invalid server address {}: {}", url, e)))?;
        if let Some(host) = host_header {
            let value = HeaderValue::from_str(host)
                .map_err(|e| VpnError::Config(format!("invalid host header {}: {}", host, e)))?;
            request.headers_mut().insert(HOST, value);
        }

        let (mut ws, _) = connect_async(request)
            .await
            .map_err(|e| VpnError::Transport(format!("failed to connect to {}: {}", url, e)))?;

        ws.send(Message::Binary(token.as_bytes().to_vec()))
            .await
            .map_err(|e| VpnError::Transport(format!("failed to send token: {}", e)))?;
        state.set(ChannelState::Authenticated);

        let (tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
        Ok(TunnelChannel {
            handle: PeerHandle::new(tx, state.clone()),
            state,
            outbound_rx,
            ws,
        })
    }

    /// Write handle for this connection.
    pub fn handle(&self) -> PeerHandle {
        self.handle.clone()
    }

    /// Current channel state.
    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    /// Run the read loop until the connection terminates, decrypting inbound
    /// frames under `cipher`. Blocks the caller; returns the terminal error,
    /// or `Ok` for a clean close.
    pub async fn run<R: PacketRouter>(
        self,
        router: Arc<R>,
        cipher: Arc<PacketCipher>,
    ) -> VpnResult<()> {
        let TunnelChannel {
            state,
            handle,
            outbound_rx,
            ws,
        } = self;

        state.set(ChannelState::Running);
        let (sink, mut stream) = ws.split();
        let writer = spawn_writer(sink, outbound_rx);

        let result = read_frames(&mut stream, router.as_ref(), &cipher).await;

        state.set(match result {
            Ok(()) => ChannelState::Disconnected,
            Err(_) => ChannelState::Failed,
        });
        drop(handle);
        writer.abort();
        result
    }
}

/// Serve one inbound server-side connection.
///
/// Upgrades the TCP stream, reads the token frame, authenticates through the
/// router, then pumps inbound frames until the connection ends. The peer's
/// table record is released before the writer task is torn down, so table
/// readers either see a live record or none.
pub async fn accept_connection<R: PacketRouter>(
    stream: TcpStream,
    router: Arc<R>,
) -> VpnResult<()> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| VpnError::Transport(format!("websocket upgrade failed: {}", e)))?;

    let state = Arc::new(StateCell::new(ChannelState::Connecting));
    let (mut sink, mut stream) = ws.split();

    // The first frame is the authentication token.
    let token = match stream.next().await {
        Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
        Some(Ok(Message::Text(text))) => text,
        _ => {
            let _ = sink.close().await;
            return Err(VpnError::AuthenticationFailed);
        }
    };

    let (tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
    let handle = PeerHandle::new(tx, state.clone());

    let grant = match router.authenticate(&token, handle).await {
        Some(grant) => grant,
        None => {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: AUTH_FAILED_REASON.into(),
                })))
                .await;
            let _ = sink.close().await;
            return Err(VpnError::AuthenticationFailed);
        }
    };
    state.set(ChannelState::Authenticated);
    log::info!("peer {} authenticated", grant.ip);

    let writer = spawn_writer(sink, outbound_rx);
    state.set(ChannelState::Running);

    let result = read_frames(&mut stream, router.as_ref(), &grant.cipher).await;

    state.set(match result {
        Ok(()) => ChannelState::Disconnected,
        Err(_) => ChannelState::Failed,
    });

    // Release the table record first: once it is gone no new lookups can
    // reach this connection, and the writer drains whatever was already
    // queued before exiting.
    router.peer_closed(grant.ip);
    writer.abort();
    result
}
