//! WebSocket client for the signaling relay
//!
//! Provides:
//! - Auth + registration handshake on every (re)connect
//! - Bounded reconnection with exponential backoff
//! - WebSocket ping heartbeat
//! - Re-announcement of hosting state after reconnecting

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::SignalingSettings;
use crate::error::{Error, Result};
use crate::events::{EventChannel, Subscription};
use crate::protocol::{Capabilities, PeerInfo, RelayMessage, Signal};
use crate::system::DeviceInfo;

use super::{MeshStatus, RosterEvent, SignalEvent, SignalSink};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for the signaling client
#[derive(Debug, Clone)]
pub struct SignalingClientConfig {
    /// WebSocket URL of the relay
    pub url: String,

    /// Socket connect timeout
    pub connect_timeout: Duration,

    /// Auth + registration must finish within this
    pub registration_timeout: Duration,

    /// Failed reconnects tolerated before the terminal error status
    pub max_reconnect_attempts: u32,

    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,

    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,

    /// WebSocket ping interval
    pub heartbeat_interval: Duration,

    /// Outbound command queue size
    pub command_queue_size: usize,
}

impl Default for SignalingClientConfig {
    fn default() -> Self {
        Self::from(&SignalingSettings::default())
    }
}

impl From<&SignalingSettings> for SignalingClientConfig {
    fn from(settings: &SignalingSettings) -> Self {
        Self {
            url: settings.url.clone(),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            registration_timeout: Duration::from_millis(settings.registration_timeout_ms),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            initial_reconnect_delay: Duration::from_millis(settings.initial_reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(settings.max_reconnect_delay_ms),
            heartbeat_interval: settings.heartbeat_interval(),
            command_queue_size: 256,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Identity & State
// ─────────────────────────────────────────────────────────────────

/// Who this node claims to be
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub peer_id: String,
    pub platform: String,
    pub capabilities: Capabilities,
}

/// Relay credentials
#[derive(Clone)]
pub struct Credentials {
    pub token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credentials { token: <redacted> }")
    }
}

/// Relay connection state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    /// Socket open, handshake in progress
    Connected,
    /// Authenticated and registered
    Registered,
    Reconnecting,
    /// Terminal; no automatic retry
    Error,
}

impl ConnectionState {
    pub fn display_status(&self) -> MeshStatus {
        match self {
            ConnectionState::Disconnected => MeshStatus::Disconnected,
            ConnectionState::Connecting | ConnectionState::Connected => MeshStatus::Connecting,
            ConnectionState::Registered => MeshStatus::Connected,
            ConnectionState::Reconnecting => MeshStatus::Reconnecting,
            ConnectionState::Error => MeshStatus::Error,
        }
    }
}

/// What we announce in `register` and `hosting-status`
#[derive(Debug, Clone, Default)]
pub struct HostingState {
    pub is_hosting: bool,
    pub models: Vec<String>,
    pub device_info: Option<DeviceInfo>,
}

#[derive(Default)]
struct ClientState {
    connection_state: ConnectionState,
    /// Id confirmed by the relay
    peer_id: Option<String>,
    reconnect_attempts: u32,
    registered_at: Option<Instant>,
    hosting: HostingState,
}

/// Commands handled by the connection loop
#[derive(Debug)]
enum ClientCommand {
    Send(RelayMessage),
    AnnounceHosting,
    Disconnect,
}

/// How a connected session ended without an error
enum SessionEnd {
    LocalDisconnect,
    RemoteClosed,
}

struct ClientInner {
    config: SignalingClientConfig,
    state: RwLock<ClientState>,
    roster: EventChannel<RosterEvent>,
    signals: EventChannel<SignalEvent>,
    status: EventChannel<MeshStatus>,
}

impl ClientInner {
    fn set_state(&self, next: ConnectionState) {
        let changed = {
            let mut s = self.state.write();
            let before = s.connection_state.display_status();
            s.connection_state = next;
            before != next.display_status()
        };
        if changed {
            debug!(status = %next.display_status(), "Signaling status changed");
            self.status.publish(&next.display_status());
        }
    }

    fn hosting_message(&self) -> RelayMessage {
        let hosting = self.state.read().hosting.clone();
        RelayMessage::HostingStatus {
            peer_id: None,
            is_hosting: hosting.is_hosting,
            models: hosting.models,
            device_info: hosting.device_info,
        }
    }

    fn own_id(&self) -> Option<String> {
        self.state.read().peer_id.clone()
    }
}

// ─────────────────────────────────────────────────────────────────
// Signaling Client
// ─────────────────────────────────────────────────────────────────

/// Persistent client for the coordination relay
pub struct SignalingClient {
    inner: Arc<ClientInner>,
    command_tx: Mutex<Option<mpsc::Sender<ClientCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    pub fn new(config: SignalingClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                state: RwLock::new(ClientState::default()),
                roster: EventChannel::new(),
                signals: EventChannel::new(),
                status: EventChannel::new(),
            }),
            command_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Connect, authenticate and register
    ///
    /// Resolves once the first registration succeeds. A rejected token is
    /// terminal and returns `AuthenticationFailed`; transport failures are
    /// retried up to the configured bound first.
    pub async fn connect(&self, identity: NodeIdentity, credentials: Credentials) -> Result<()> {
        let first_rx = {
            let mut task = self.task.lock();
            if task.as_ref().is_some_and(|t| !t.is_finished()) {
                return Err(Error::Connection("signaling client already running".to_string()));
            }

            let (command_tx, command_rx) = mpsc::channel(self.inner.config.command_queue_size);
            let (first_tx, first_rx) = oneshot::channel();
            *self.command_tx.lock() = Some(command_tx);
            {
                let mut s = self.inner.state.write();
                s.reconnect_attempts = 0;
                s.peer_id = None;
            }

            *task = Some(tokio::spawn(run_client_loop(
                Arc::clone(&self.inner),
                identity,
                credentials,
                command_rx,
                first_tx,
            )));
            first_rx
        };

        first_rx
            .await
            .map_err(|_| Error::Internal("signaling task ended unexpectedly".to_string()))?
    }

    /// Update and (if registered) broadcast our hosting state
    pub async fn announce_hosting(&self, models: Vec<String>, device_info: Option<DeviceInfo>) -> Result<()> {
        {
            let mut s = self.inner.state.write();
            s.hosting = HostingState {
                is_hosting: !models.is_empty(),
                models,
                device_info,
            };
        }
        if self.connection_state() == ConnectionState::Registered {
            self.send_command(ClientCommand::AnnounceHosting).await?;
        }
        Ok(())
    }

    /// Ask the relay for a fresh roster snapshot
    pub async fn request_peer_list(&self) -> Result<()> {
        self.send_relay(RelayMessage::RequestPeerList).await
    }

    /// Close the relay connection; no reconnect follows
    pub async fn disconnect(&self) {
        let _ = self.send_command(ClientCommand::Disconnect).await;
        *self.command_tx.lock() = None;

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(5), &mut task).await.is_err() {
                warn!("Signaling loop did not stop in time, aborting");
                task.abort();
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
        info!("Signaling client disconnected");
    }

    pub fn status(&self) -> MeshStatus {
        self.connection_state().display_status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.read().connection_state
    }

    /// Peer id confirmed by the relay at registration
    pub fn local_peer_id(&self) -> Option<String> {
        self.inner.own_id()
    }

    pub fn hosting(&self) -> HostingState {
        self.inner.state.read().hosting.clone()
    }

    /// Time since the current registration
    pub fn registered_for(&self) -> Option<Duration> {
        self.inner.state.read().registered_at.map(|t| t.elapsed())
    }

    pub fn subscribe_roster(&self) -> Subscription<RosterEvent> {
        self.inner.roster.subscribe()
    }

    pub fn subscribe_signals(&self) -> Subscription<SignalEvent> {
        self.inner.signals.subscribe()
    }

    pub fn subscribe_status(&self) -> Subscription<MeshStatus> {
        self.inner.status.subscribe()
    }

    async fn send_relay(&self, msg: RelayMessage) -> Result<()> {
        if self.connection_state() != ConnectionState::Registered {
            return Err(Error::Connection("signaling relay not connected".to_string()));
        }
        self.send_command(ClientCommand::Send(msg)).await
    }

    async fn send_command(&self, command: ClientCommand) -> Result<()> {
        let tx = self
            .command_tx
            .lock()
            .clone()
            .ok_or_else(|| Error::Connection("signaling client not started".to_string()))?;
        tx.send(command)
            .await
            .map_err(|_| Error::Connection("signaling client channel closed".to_string()))
    }
}

#[async_trait]
impl SignalSink for SignalingClient {
    async fn send_signal(&self, target: &str, signal: Signal) -> Result<()> {
        debug!(peer = %target, kind = signal.kind(), "Sending signal");
        self.send_relay(RelayMessage::signal_to(target, signal)).await
    }
}

// ─────────────────────────────────────────────────────────────────
// Client Loop
// ─────────────────────────────────────────────────────────────────

fn resolve_first(first: &mut Option<oneshot::Sender<Result<()>>>, result: Result<()>) {
    if let Some(tx) = first.take() {
        let _ = tx.send(result);
    }
}

/// Connection loop with bounded reconnection
async fn run_client_loop(
    inner: Arc<ClientInner>,
    identity: NodeIdentity,
    credentials: Credentials,
    mut command_rx: mpsc::Receiver<ClientCommand>,
    first_tx: oneshot::Sender<Result<()>>,
) {
    let mut first = Some(first_tx);
    let config = inner.config.clone();

    let url = match Url::parse(&config.url) {
        Ok(u) => u,
        Err(e) => {
            error!(url = %config.url, error = %e, "Invalid signaling URL");
            inner.set_state(ConnectionState::Error);
            resolve_first(&mut first, Err(Error::Config(format!("Invalid signaling URL: {}", e))));
            return;
        }
    };

    let mut backoff = ExponentialBackoff {
        initial_interval: config.initial_reconnect_delay,
        max_interval: config.max_reconnect_delay,
        max_elapsed_time: None,
        ..Default::default()
    };

    loop {
        inner.set_state(ConnectionState::Connecting);
        info!(url = %url, "Connecting to signaling relay");

        let outcome = match tokio::time::timeout(config.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws_stream, _response))) => {
                inner.set_state(ConnectionState::Connected);
                let (write, read) = ws_stream.split();
                handle_connection(
                    &inner,
                    &identity,
                    &credentials,
                    &mut command_rx,
                    &mut first,
                    &mut backoff,
                    write,
                    read,
                )
                .await
            }
            Ok(Err(e)) => Err(Error::WebSocket(e)),
            Err(_) => Err(Error::ConnectionTimeout {
                url: url.to_string(),
                timeout_secs: config.connect_timeout.as_secs(),
            }),
        };

        match outcome {
            Ok(SessionEnd::LocalDisconnect) => {
                inner.set_state(ConnectionState::Disconnected);
                break;
            }
            Ok(SessionEnd::RemoteClosed) => info!("Relay closed the connection"),
            Err(Error::AuthenticationFailed { message }) => {
                error!(error = %message, "Relay rejected credentials");
                inner.set_state(ConnectionState::Error);
                resolve_first(&mut first, Err(Error::AuthenticationFailed { message }));
                break;
            }
            Err(e) => warn!(error = %e, "Signaling connection lost"),
        }

        let attempts = {
            let mut s = inner.state.write();
            s.reconnect_attempts += 1;
            s.peer_id = None;
            s.registered_at = None;
            s.reconnect_attempts
        };

        if attempts > config.max_reconnect_attempts {
            error!(
                attempts = attempts - 1,
                max = config.max_reconnect_attempts,
                "Max reconnection attempts reached"
            );
            inner.set_state(ConnectionState::Error);
            resolve_first(
                &mut first,
                Err(Error::Connection(format!(
                    "signaling relay unreachable after {} reconnect attempts",
                    attempts - 1
                ))),
            );
            break;
        }

        inner.set_state(ConnectionState::Reconnecting);
        let delay = backoff.next_backoff().unwrap_or(config.max_reconnect_delay);
        info!(delay_ms = delay.as_millis() as u64, attempt = attempts, "Waiting before reconnection");

        if !wait_before_retry(delay, &mut command_rx).await {
            inner.set_state(ConnectionState::Disconnected);
            break;
        }
    }

    resolve_first(&mut first, Err(Error::Connection("signaling client stopped".to_string())));
    debug!("Signaling loop terminated");
}

/// Sleep out the backoff; false if a disconnect arrived meanwhile
async fn wait_before_retry(delay: Duration, command_rx: &mut mpsc::Receiver<ClientCommand>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = command_rx.recv() => match cmd {
                Some(ClientCommand::Disconnect) | None => return false,
                Some(other) => debug!(command = ?other, "Dropping command while reconnecting"),
            },
        }
    }
}

/// Handshake, then pump messages until the socket ends
#[allow(clippy::too_many_arguments)]
async fn handle_connection<S, R>(
    inner: &Arc<ClientInner>,
    identity: &NodeIdentity,
    credentials: &Credentials,
    command_rx: &mut mpsc::Receiver<ClientCommand>,
    first: &mut Option<oneshot::Sender<Result<()>>>,
    backoff: &mut ExponentialBackoff,
    mut write: S,
    mut read: R,
) -> Result<SessionEnd>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
    R: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let timeout = inner.config.registration_timeout;
    let mut early = Vec::new();

    send_message(
        &mut write,
        &RelayMessage::Auth {
            token: credentials.token.clone(),
            peer_id: identity.peer_id.clone(),
        },
    )
    .await?;

    let auth = wait_for(&mut write, &mut read, &mut early, timeout, |m| {
        matches!(m, RelayMessage::AuthResponse { .. } | RelayMessage::Error { .. })
    })
    .await?;

    match auth {
        RelayMessage::AuthResponse { success: true, .. } => debug!("Authenticated with relay"),
        RelayMessage::AuthResponse { error, .. } => {
            return Err(Error::AuthenticationFailed {
                message: error.unwrap_or_else(|| "rejected".to_string()),
            })
        }
        RelayMessage::Error { message } => return Err(Error::AuthenticationFailed { message }),
        other => {
            return Err(Error::Protocol(format!(
                "unexpected '{}' during authentication",
                other.type_name()
            )))
        }
    }

    let hosting = inner.state.read().hosting.clone();
    send_message(
        &mut write,
        &RelayMessage::Register {
            platform: identity.platform.clone(),
            capabilities: identity.capabilities.clone(),
            is_hosting: hosting.is_hosting,
            models: hosting.models.clone(),
        },
    )
    .await?;

    let registered = wait_for(&mut write, &mut read, &mut early, timeout, |m| {
        matches!(m, RelayMessage::Registered { .. })
    })
    .await?;

    let peer_id = match registered {
        RelayMessage::Registered { peer_id } => peer_id,
        _ => identity.peer_id.clone(),
    };

    {
        let mut s = inner.state.write();
        s.peer_id = Some(peer_id.clone());
        s.reconnect_attempts = 0;
        s.registered_at = Some(Instant::now());
    }
    backoff.reset();
    inner.set_state(ConnectionState::Registered);
    info!(peer_id = %peer_id, hosting = hosting.is_hosting, "Registered with signaling relay");
    resolve_first(first, Ok(()));

    // Peers may hold a stale view of us after a reconnect
    if hosting.is_hosting {
        send_message(&mut write, &inner.hosting_message()).await?;
    }
    send_message(&mut write, &RelayMessage::RequestPeerList).await?;

    for msg in early {
        handle_incoming(inner, &mut write, msg).await?;
    }

    let mut heartbeat = tokio::time::interval(inner.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                write.send(WsMessage::Ping(Vec::new())).await?;
                debug!("Sent heartbeat ping");
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<RelayMessage>(&text) {
                        Ok(parsed) => handle_incoming(inner, &mut write, parsed).await?,
                        Err(e) => warn!(error = %e, "Failed to parse relay message"),
                    },
                    Some(Ok(WsMessage::Binary(data))) => match serde_json::from_slice::<RelayMessage>(&data) {
                        Ok(parsed) => handle_incoming(inner, &mut write, parsed).await?,
                        Err(e) => warn!(error = %e, "Failed to parse binary relay message"),
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        write.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(frame = ?frame, "Received close frame");
                        return Ok(SessionEnd::RemoteClosed);
                    }
                    Some(Err(e)) => return Err(Error::WebSocket(e)),
                    None => return Ok(SessionEnd::RemoteClosed),
                    _ => {}
                }
            }

            cmd = command_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Send(msg)) => send_message(&mut write, &msg).await?,
                    Some(ClientCommand::AnnounceHosting) => {
                        send_message(&mut write, &inner.hosting_message()).await?;
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return Ok(SessionEnd::LocalDisconnect);
                    }
                }
            }
        }
    }
}

async fn send_message<S>(write: &mut S, msg: &RelayMessage) -> Result<()>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let json = serde_json::to_string(msg)?;
    write.send(WsMessage::Text(json)).await?;
    Ok(())
}

/// Read until `matches` accepts a message; others are kept for later
async fn wait_for<S, R, F>(
    write: &mut S,
    read: &mut R,
    early: &mut Vec<RelayMessage>,
    timeout: Duration,
    matches: F,
) -> Result<RelayMessage>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
    R: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
    F: Fn(&RelayMessage) -> bool,
{
    let wait = async {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<RelayMessage>(&text) {
                    Ok(parsed) if matches(&parsed) => return Ok(parsed),
                    Ok(parsed) => early.push(parsed),
                    Err(e) => warn!(error = %e, "Failed to parse relay message"),
                },
                Ok(WsMessage::Ping(data)) => write.send(WsMessage::Pong(data)).await?,
                Ok(WsMessage::Close(_)) => {
                    return Err(Error::Connection("relay closed during handshake".to_string()))
                }
                Err(e) => return Err(Error::WebSocket(e)),
                _ => {}
            }
        }
        Err(Error::Connection("stream ended during handshake".to_string()))
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| Error::ConnectionTimeout {
            url: "signaling relay".to_string(),
            timeout_secs: timeout.as_secs(),
        })?
}

/// Republish one relay message on the typed channels
async fn handle_incoming<S>(inner: &Arc<ClientInner>, write: &mut S, msg: RelayMessage) -> Result<()>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let own_id = inner.own_id();
    let is_self = |id: &str| own_id.as_deref() == Some(id);

    match msg {
        RelayMessage::WebrtcSignal {
            from_peer_id: Some(from),
            signal,
            ..
        } => {
            debug!(peer = %from, kind = signal.kind(), "Received signal");
            inner.signals.publish(&SignalEvent { from, signal });
        }

        RelayMessage::WebrtcSignal { from_peer_id: None, .. } => {
            warn!("Dropping signal without sender");
        }

        RelayMessage::PeerJoined {
            peer_id,
            is_hosting,
            models,
        } if !is_self(&peer_id) => {
            info!(peer = %peer_id, hosting = is_hosting, "Peer joined");
            inner.roster.publish(&RosterEvent::Joined(PeerInfo {
                peer_id,
                is_hosting,
                models,
                platform: None,
            }));
        }

        RelayMessage::PeerLeft { peer_id } if !is_self(&peer_id) => {
            info!(peer = %peer_id, "Peer left");
            inner.roster.publish(&RosterEvent::Left { peer_id });
        }

        RelayMessage::ExistingPeers { peers } => {
            let peers: Vec<PeerInfo> = peers.into_iter().filter(|p| !is_self(&p.peer_id)).collect();
            debug!(count = peers.len(), "Received peer list");
            inner.roster.publish(&RosterEvent::Snapshot(peers));
        }

        RelayMessage::HostingStatus {
            peer_id: Some(peer_id),
            is_hosting,
            models,
            ..
        } if !is_self(&peer_id) => {
            debug!(peer = %peer_id, hosting = is_hosting, models = models.len(), "Peer hosting changed");
            inner.roster.publish(&RosterEvent::HostingChanged(PeerInfo {
                peer_id,
                is_hosting,
                models,
                platform: None,
            }));
        }

        RelayMessage::ModelsRequested { from_peer_id } => {
            debug!(from = ?from_peer_id, "Relay requested our models");
            send_message(write, &inner.hosting_message()).await?;
        }

        RelayMessage::Error { message } => {
            warn!(error = %message, "Relay reported an error");
        }

        other => {
            debug!(message_type = other.type_name(), "Ignoring relay message");
        }
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
