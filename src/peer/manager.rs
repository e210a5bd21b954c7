//! Peer connection lifecycle
//!
//! Owns one link per remote peer and drives it from first signal to
//! teardown:
//! - offers create responder links; other signals for unknown peers are
//!   buffered and replayed in arrival order once a link exists
//! - every attempt has a deadline taken from the timeout profile
//! - connected peers are pinged; silent ones are evicted
//!
//! Each peer has two async locks. The signal lock keeps that peer's
//! signals (and the replay of its buffered ones) in arrival order; the op
//! lock serializes creating and destroying its link. Neither is held across
//! a credential fetch, and no lock is shared between peers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PeerSettings;
use crate::error::{ConnectionFailure, Error, Result};
use crate::events::{EventChannel, Subscription};
use crate::ice::{IceConfigResolver, IceServer};
use crate::protocol::{PeerInfo, PeerMessage, Signal};
use crate::signaling::{RosterEvent, SignalSink};

use super::link::{LinkEvent, LinkEvents, LinkSetup, PeerLink, PeerLinkFactory, TaggedLinkEvent};
use super::registry::{PeerRegistry, PeerState};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Peer manager configuration
#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    /// Our relay-assigned peer id
    pub local_id: String,

    /// Deadline for one connection attempt
    pub connect_timeout: Duration,

    /// Interval between liveness pings
    pub ping_interval: Duration,

    /// Consecutive missed pongs before eviction (0 = never evict)
    pub max_missed_pongs: u32,

    /// Pause between replayed buffered signals
    pub signal_replay_delay: Duration,

    /// Buffered signals kept per unknown peer
    pub max_buffered_signals: usize,

    /// Maximum simultaneous links
    pub max_peers: usize,

    /// Dial hosting peers as soon as the roster shows them
    pub auto_connect: bool,

    /// Token for the relay credential endpoint
    pub ice_token: Option<String>,
}

impl PeerManagerConfig {
    pub fn from_settings(
        local_id: impl Into<String>,
        settings: &PeerSettings,
        connect_timeout: Duration,
        ice_token: Option<String>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            connect_timeout,
            ping_interval: settings.ping_interval(),
            max_missed_pongs: settings.max_missed_pongs,
            signal_replay_delay: Duration::from_millis(settings.signal_replay_delay_ms),
            max_buffered_signals: settings.max_buffered_signals,
            max_peers: settings.max_peers,
            auto_connect: settings.auto_connect,
            ice_token,
        }
    }
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self::from_settings("local", &PeerSettings::default(), Duration::from_secs(90), None)
    }
}

// ─────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Data channel open
    Connected { peer_id: String },

    /// Link removed after close, eviction or local disconnect
    Disconnected { peer_id: String, reason: String },

    /// Attempt or transport failed; the record is gone
    ConnectionError {
        peer_id: String,
        kind: ConnectionFailure,
        message: String,
    },
}

impl PeerEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            PeerEvent::Connected { peer_id }
            | PeerEvent::Disconnected { peer_id, .. }
            | PeerEvent::ConnectionError { peer_id, .. } => peer_id,
        }
    }
}

/// Application message received from a connected peer
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub peer_id: String,
    pub message: PeerMessage,
}

// ─────────────────────────────────────────────────────────────────
// Bookkeeping
// ─────────────────────────────────────────────────────────────────

type Waiter = oneshot::Sender<Result<()>>;

/// Pending establishment for one entry
struct ConnectionAttempt {
    started_at: Instant,
    timeout: JoinHandle<()>,
}

#[derive(Default)]
struct Liveness {
    /// Timestamp of the ping still waiting for a pong
    outstanding: Option<i64>,
    missed: u32,
}

struct PeerEntry {
    link: Arc<dyn PeerLink>,
    generation: u64,
    initiator: bool,
    attempt: Option<ConnectionAttempt>,
    connected_at: Option<Instant>,
    liveness: Liveness,
    keepalive: Option<JoinHandle<()>>,
    waiters: Vec<Waiter>,
}

impl PeerEntry {
    fn is_connected(&self) -> bool {
        self.connected_at.is_some()
    }
}

#[derive(Default)]
struct ManagerState {
    entries: HashMap<String, PeerEntry>,
    /// Signals for peers without an entry, in arrival order
    orphans: HashMap<String, VecDeque<Signal>>,
}

/// One async lock per peer id
#[derive(Default)]
struct PeerLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PeerLocks {
    async fn lock(&self, peer_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            // Locks nobody holds or waits on can go
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(peer_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Why an entry is being removed
enum Teardown {
    Disconnect { reason: String },
    Failed { kind: ConnectionFailure, message: String },
}

// ─────────────────────────────────────────────────────────────────
// Peer Connection Manager
// ─────────────────────────────────────────────────────────────────

/// Owns every peer link
pub struct PeerConnectionManager {
    config: PeerManagerConfig,
    factory: Arc<dyn PeerLinkFactory>,
    signals: Arc<dyn SignalSink>,
    resolver: Arc<IceConfigResolver>,
    registry: Arc<PeerRegistry>,
    signal_locks: PeerLocks,
    op_locks: PeerLocks,
    state: Mutex<ManagerState>,
    next_generation: AtomicU64,
    link_tx: mpsc::UnboundedSender<TaggedLinkEvent>,
    link_rx: Mutex<Option<mpsc::UnboundedReceiver<TaggedLinkEvent>>>,
    events: EventChannel<PeerEvent>,
    messages: EventChannel<InboundMessage>,
}

impl PeerConnectionManager {
    pub fn new(
        config: PeerManagerConfig,
        factory: Arc<dyn PeerLinkFactory>,
        signals: Arc<dyn SignalSink>,
        resolver: Arc<IceConfigResolver>,
    ) -> Arc<Self> {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            factory,
            signals,
            resolver,
            registry: Arc::new(PeerRegistry::new()),
            signal_locks: PeerLocks::default(),
            op_locks: PeerLocks::default(),
            state: Mutex::new(ManagerState::default()),
            next_generation: AtomicU64::new(1),
            link_tx,
            link_rx: Mutex::new(Some(link_rx)),
            events: EventChannel::new(),
            messages: EventChannel::new(),
        })
    }

    /// Start consuming link events. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(mut rx) = self.link_rx.lock().take() else {
            return;
        };
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(tagged) = rx.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.on_link_event(tagged).await;
            }
            debug!("Link event loop terminated");
        });
    }

    pub fn local_id(&self) -> &str {
        &self.config.local_id
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn subscribe_events(&self) -> Subscription<PeerEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_messages(&self) -> Subscription<InboundMessage> {
        self.messages.subscribe()
    }

    /// Ids of peers with an open channel
    pub fn connected_peers(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.is_connected())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.state
            .lock()
            .entries
            .get(peer_id)
            .is_some_and(PeerEntry::is_connected)
    }

    /// Signals waiting for a link to `peer_id`
    pub fn buffered_signal_count(&self, peer_id: &str) -> usize {
        self.state.lock().orphans.get(peer_id).map_or(0, VecDeque::len)
    }

    /// Attempts plus open links
    pub fn tracked_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    // ─────────────────────────────────────────────────────────────
    // Signals
    // ─────────────────────────────────────────────────────────────

    /// Route one connection-setup signal from `from`
    pub async fn handle_signal(self: &Arc<Self>, from: &str, signal: Signal) -> Result<()> {
        if from == self.config.local_id {
            return Ok(());
        }
        // Held through the replay so later signals queue behind it
        let _seq = self.signal_locks.lock(from).await;

        // Only an offer can create a link; resolve before taking the op lock
        let ice_servers = if signal.is_offer() {
            self.ice_servers().await
        } else {
            Vec::new()
        };

        let (link, buffered) = {
            let _op = self.op_locks.lock(from).await;

            let existing = self.state.lock().entries.get(from).map(|e| {
                (Arc::clone(&e.link), e.initiator, e.is_connected())
            });

            let carried = match (existing, signal.is_offer()) {
                (None, false) => {
                    self.buffer_signal(from, signal);
                    return Ok(());
                }
                (Some((link, _, _)), false) | (Some((link, false, false)), true) => {
                    return self.apply_to(from, &link, signal).await;
                }
                (None, true) => Vec::new(),
                (Some((_, _, true)), true) => {
                    info!(peer = %from, "Fresh offer from connected peer, replacing stale link");
                    self.teardown(
                        from,
                        None,
                        Teardown::Disconnect {
                            reason: "superseded by new offer".to_string(),
                        },
                    )
                    .await;
                    Vec::new()
                }
                (Some((_, true, false)), true) => {
                    if self.config.local_id.as_str() < from {
                        info!(peer = %from, "Offer collision, yielding to remote offer");
                        self.detach(from).await.map(|e| e.waiters).unwrap_or_default()
                    } else {
                        debug!(peer = %from, "Offer collision, keeping our own attempt");
                        return Ok(());
                    }
                }
            };

            if self.tracked_count() >= self.config.max_peers {
                warn!(peer = %from, max_peers = self.config.max_peers, "Refusing offer, peer limit reached");
                return Err(Error::PeerLimit {
                    max_peers: self.config.max_peers,
                });
            }

            let link = self.create_link(from, false, ice_servers, carried).await?;
            self.apply_to(from, &link, signal).await?;
            (link, self.take_buffered(from))
        };

        self.replay_buffered(from, &link, buffered).await;
        Ok(())
    }

    fn buffer_signal(&self, from: &str, signal: Signal) {
        let mut state = self.state.lock();
        let queue = state.orphans.entry(from.to_string()).or_default();
        queue.push_back(signal);
        if queue.len() > self.config.max_buffered_signals {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    peer = %from,
                    kind = dropped.kind(),
                    cap = self.config.max_buffered_signals,
                    "Signal buffer full, dropped oldest signal"
                );
            }
        }
        debug!(peer = %from, buffered = queue.len(), "Buffered signal for unknown peer");
    }

    async fn apply_to(&self, peer_id: &str, link: &Arc<dyn PeerLink>, signal: Signal) -> Result<()> {
        let kind = signal.kind();
        if let Err(e) = link.apply_signal(signal).await {
            warn!(peer = %peer_id, kind, error = %e, "Failed to apply signal");
            self.teardown(
                peer_id,
                None,
                Teardown::Failed {
                    kind: ConnectionFailure::IceFailure,
                    message: e.to_string(),
                },
            )
            .await;
            return Err(Error::connection_failed(peer_id, ConnectionFailure::IceFailure));
        }
        Ok(())
    }

    fn take_buffered(&self, peer_id: &str) -> VecDeque<Signal> {
        self.state.lock().orphans.remove(peer_id).unwrap_or_default()
    }

    /// Apply signals that arrived before the link existed; callers hold the
    /// peer's signal lock but not its op lock
    async fn replay_buffered(&self, peer_id: &str, link: &Arc<dyn PeerLink>, buffered: VecDeque<Signal>) {
        if buffered.is_empty() {
            return;
        }

        debug!(peer = %peer_id, count = buffered.len(), "Replaying buffered signals");
        for signal in buffered {
            tokio::time::sleep(self.config.signal_replay_delay).await;
            let kind = signal.kind();
            if let Err(e) = link.apply_signal(signal).await {
                warn!(peer = %peer_id, kind, error = %e, "Buffered signal rejected");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Connect / Disconnect
    // ─────────────────────────────────────────────────────────────

    /// Open a link to `peer_id`, resolving once the channel is open
    pub async fn connect_to(self: &Arc<Self>, peer_id: &str) -> Result<()> {
        if peer_id == self.config.local_id {
            return Err(Error::Connection("cannot connect to self".to_string()));
        }

        if self.is_connected(peer_id) {
            return Ok(());
        }

        let seq = self.signal_locks.lock(peer_id).await;
        let ice_servers = self.ice_servers().await;

        let (tx, rx) = oneshot::channel();
        let created = {
            let _op = self.op_locks.lock(peer_id).await;

            let pending = {
                let mut state = self.state.lock();
                match state.entries.get_mut(peer_id) {
                    Some(entry) if entry.is_connected() => return Ok(()),
                    Some(entry) => {
                        entry.waiters.push(tx);
                        None
                    }
                    None => Some(tx),
                }
            };

            match pending {
                Some(tx) => {
                    if self.tracked_count() >= self.config.max_peers {
                        return Err(Error::PeerLimit {
                            max_peers: self.config.max_peers,
                        });
                    }
                    let link = self.create_link(peer_id, true, ice_servers, vec![tx]).await?;
                    Some((link, self.take_buffered(peer_id)))
                }
                None => None,
            }
        };

        if let Some((link, buffered)) = created {
            self.replay_buffered(peer_id, &link, buffered).await;
        }
        drop(seq);

        rx.await
            .unwrap_or_else(|_| Err(Error::connection_failed(peer_id, ConnectionFailure::SignalingDrop)))
    }

    /// Close the link to `peer_id`. Returns false if there was none.
    pub async fn disconnect_from(&self, peer_id: &str) -> bool {
        let _op = self.op_locks.lock(peer_id).await;
        self.state.lock().orphans.remove(peer_id);
        self.teardown(
            peer_id,
            None,
            Teardown::Disconnect {
                reason: "local disconnect".to_string(),
            },
        )
        .await
    }

    /// Close every link
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = {
            let mut state = self.state.lock();
            state.orphans.clear();
            state.entries.keys().cloned().collect()
        };

        for id in ids {
            let _op = self.op_locks.lock(&id).await;
            self.teardown(
                &id,
                None,
                Teardown::Disconnect {
                    reason: "shutdown".to_string(),
                },
            )
            .await;
        }
    }

    /// Send one envelope to a connected peer
    pub async fn send(&self, peer_id: &str, message: &PeerMessage) -> Result<()> {
        let link = self
            .state
            .lock()
            .entries
            .get(peer_id)
            .filter(|e| e.is_connected())
            .map(|e| Arc::clone(&e.link))
            .ok_or_else(|| Error::transport_send(peer_id, "peer not connected"))?;

        let text = message.encode()?;
        link.send(&text).await
    }

    // ─────────────────────────────────────────────────────────────
    // Roster
    // ─────────────────────────────────────────────────────────────

    /// Apply a roster update from the relay
    pub async fn handle_roster(self: &Arc<Self>, event: RosterEvent) {
        match event {
            RosterEvent::Joined(info) | RosterEvent::HostingChanged(info) => {
                self.registry.upsert(&info);
                self.maybe_auto_connect(&info);
            }
            RosterEvent::Snapshot(peers) => {
                for info in &peers {
                    self.registry.upsert(info);
                    self.maybe_auto_connect(info);
                }
            }
            RosterEvent::Left { peer_id } => {
                let _op = self.op_locks.lock(&peer_id).await;
                self.state.lock().orphans.remove(&peer_id);
                let had_link = self
                    .teardown(
                        &peer_id,
                        None,
                        Teardown::Disconnect {
                            reason: "peer left".to_string(),
                        },
                    )
                    .await;
                if !had_link {
                    self.registry.remove(&peer_id);
                }
            }
        }
    }

    fn maybe_auto_connect(self: &Arc<Self>, info: &PeerInfo) {
        if !self.config.auto_connect || !info.is_hosting || info.peer_id == self.config.local_id {
            return;
        }
        if self.state.lock().entries.contains_key(&info.peer_id) {
            return;
        }

        let manager = Arc::clone(self);
        let peer_id = info.peer_id.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.connect_to(&peer_id).await {
                warn!(peer = %peer_id, error = %e, "Auto-connect failed");
            }
        });
    }

    // ─────────────────────────────────────────────────────────────
    // Link lifecycle
    // ─────────────────────────────────────────────────────────────

    async fn ice_servers(&self) -> Vec<IceServer> {
        self.resolver
            .get_ice_servers(self.config.ice_token.as_deref())
            .await
    }

    /// Build and track a new link; callers hold the peer's op lock
    async fn create_link(
        self: &Arc<Self>,
        peer_id: &str,
        initiator: bool,
        ice_servers: Vec<IceServer>,
        waiters: Vec<Waiter>,
    ) -> Result<Arc<dyn PeerLink>> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        info!(
            peer = %peer_id,
            initiator,
            transport = self.factory.name(),
            ice_servers = ice_servers.len(),
            "Starting peer connection"
        );

        let setup = LinkSetup {
            local_id: self.config.local_id.clone(),
            peer_id: peer_id.to_string(),
            initiator,
            ice_servers,
            signals: Arc::clone(&self.signals),
            events: LinkEvents::new(peer_id, generation, self.link_tx.clone()),
        };

        let link = match self.factory.create(setup).await {
            Ok(link) => link,
            Err(e) => {
                let kind = match e {
                    Error::Connection(_) => ConnectionFailure::SignalingDrop,
                    _ => ConnectionFailure::IceFailure,
                };
                warn!(peer = %peer_id, error = %e, "Failed to create peer link");
                for waiter in waiters {
                    let _ = waiter.send(Err(Error::connection_failed(peer_id, kind)));
                }
                self.events.publish(&PeerEvent::ConnectionError {
                    peer_id: peer_id.to_string(),
                    kind,
                    message: e.to_string(),
                });
                return Err(Error::connection_failed(peer_id, kind));
            }
        };

        let timeout = self.spawn_attempt_timeout(peer_id.to_string(), generation);
        self.state.lock().entries.insert(
            peer_id.to_string(),
            PeerEntry {
                link: Arc::clone(&link),
                generation,
                initiator,
                attempt: Some(ConnectionAttempt {
                    started_at: Instant::now(),
                    timeout,
                }),
                connected_at: None,
                liveness: Liveness::default(),
                keepalive: None,
                waiters,
            },
        );
        self.registry.ensure(peer_id);
        self.registry.set_state(peer_id, PeerState::Connecting);

        Ok(link)
    }

    fn spawn_attempt_timeout(self: &Arc<Self>, peer_id: String, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let timeout = self.config.connect_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = weak.upgrade() {
                manager.on_attempt_timeout(&peer_id, generation).await;
            }
        })
    }

    async fn on_attempt_timeout(&self, peer_id: &str, generation: u64) {
        let _op = self.op_locks.lock(peer_id).await;
        {
            let mut state = self.state.lock();
            match state.entries.get_mut(peer_id) {
                // Detach our own handle; aborting it here would cancel this task
                Some(entry) if entry.generation == generation && !entry.is_connected() => {
                    entry.attempt.take();
                }
                _ => return,
            }
        }

        let secs = self.config.connect_timeout.as_secs();
        warn!(peer = %peer_id, timeout_secs = secs, "Peer connection attempt timed out");
        self.teardown(
            peer_id,
            Some(generation),
            Teardown::Failed {
                kind: ConnectionFailure::Timeout,
                message: format!("not connected after {}s", secs),
            },
        )
        .await;
    }

    /// Dispatch one link event
    ///
    /// Runs on the shared event loop, so nothing here waits on a peer lock:
    /// teardown is handed to its own task.
    async fn on_link_event(self: &Arc<Self>, tagged: TaggedLinkEvent) {
        let TaggedLinkEvent {
            peer_id,
            generation,
            event,
        } = tagged;

        let cause = match event {
            LinkEvent::Message(text) => {
                self.on_link_message(&peer_id, generation, &text).await;
                return;
            }
            LinkEvent::Connected => {
                self.on_connected(&peer_id, generation);
                return;
            }
            LinkEvent::Closed { reason } => {
                info!(peer = %peer_id, reason = %reason, "Peer link closed");
                Teardown::Disconnect { reason }
            }
            LinkEvent::Failed { kind, reason } => {
                warn!(peer = %peer_id, kind = %kind, reason = %reason, "Peer link failed");
                Teardown::Failed {
                    kind,
                    message: reason,
                }
            }
        };

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let _op = manager.op_locks.lock(&peer_id).await;
            if !manager.teardown(&peer_id, Some(generation), cause).await {
                debug!(peer = %peer_id, generation, "Ignoring event from stale link");
            }
        });
    }

    fn on_connected(self: &Arc<Self>, peer_id: &str, generation: u64) {
        let waiters = {
            let mut state = self.state.lock();
            let Some(entry) = state
                .entries
                .get_mut(peer_id)
                .filter(|e| e.generation == generation)
            else {
                debug!(peer = %peer_id, generation, "Ignoring event from stale link");
                return;
            };
            if entry.is_connected() {
                return;
            }
            if let Some(attempt) = entry.attempt.take() {
                attempt.timeout.abort();
                debug!(
                    peer = %peer_id,
                    elapsed_ms = attempt.started_at.elapsed().as_millis() as u64,
                    "Connection established"
                );
            }
            entry.connected_at = Some(Instant::now());
            entry.keepalive = self.spawn_keepalive(peer_id.to_string(), generation);
            std::mem::take(&mut entry.waiters)
        };

        self.registry.set_state(peer_id, PeerState::Connected);
        info!(peer = %peer_id, "Peer connected");

        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        self.events.publish(&PeerEvent::Connected {
            peer_id: peer_id.to_string(),
        });
    }

    async fn on_link_message(&self, peer_id: &str, generation: u64, text: &str) {
        let link = self
            .state
            .lock()
            .entries
            .get(peer_id)
            .filter(|e| e.generation == generation)
            .map(|e| Arc::clone(&e.link));
        let Some(link) = link else {
            return;
        };
        self.registry.touch(peer_id);

        let message = match PeerMessage::decode(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "Dropping malformed peer message");
                return;
            }
        };

        match message {
            PeerMessage::Ping { timestamp } => {
                let pong = PeerMessage::Pong { timestamp };
                match pong.encode() {
                    Ok(text) => {
                        if let Err(e) = link.send(&text).await {
                            debug!(peer = %peer_id, error = %e, "Failed to answer ping");
                        }
                    }
                    Err(e) => debug!(error = %e, "Failed to encode pong"),
                }
            }
            PeerMessage::Pong { timestamp } => {
                if let Some(entry) = self.state.lock().entries.get_mut(peer_id) {
                    entry.liveness = Liveness::default();
                }
                let rtt = chrono::Utc::now().timestamp_millis() - timestamp;
                self.registry.update_latency(peer_id, rtt.clamp(0, u32::MAX as i64) as u32);
            }
            other => self.messages.publish(&InboundMessage {
                peer_id: peer_id.to_string(),
                message: other,
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Liveness
    // ─────────────────────────────────────────────────────────────

    fn spawn_keepalive(self: &Arc<Self>, peer_id: String, generation: u64) -> Option<JoinHandle<()>> {
        if self.config.ping_interval.is_zero() {
            return None;
        }
        let weak = Arc::downgrade(self);
        let interval = self.config.ping_interval;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                if !manager.keepalive_tick(&peer_id, generation).await {
                    break;
                }
            }
        }))
    }

    /// One ping round; false once the link is gone or evicted
    async fn keepalive_tick(&self, peer_id: &str, generation: u64) -> bool {
        let max_missed = self.config.max_missed_pongs;
        let timestamp = chrono::Utc::now().timestamp_millis();

        let (link, missed, evict) = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(peer_id) else {
                return false;
            };
            if entry.generation != generation {
                return false;
            }

            let missed_now = entry.liveness.outstanding.is_some();
            if missed_now {
                entry.liveness.missed += 1;
            }
            let evict = max_missed > 0 && entry.liveness.missed >= max_missed;
            if evict {
                // Detach our own handle; teardown would otherwise abort this task
                entry.keepalive.take();
            } else {
                entry.liveness.outstanding = Some(timestamp);
            }
            (
                Arc::clone(&entry.link),
                missed_now.then_some(entry.liveness.missed),
                evict,
            )
        };

        if let Some(missed) = missed {
            warn!(peer = %peer_id, missed, max = max_missed, "Missed pong from peer");
        }

        if evict {
            let _op = self.op_locks.lock(peer_id).await;
            self.teardown(
                peer_id,
                Some(generation),
                Teardown::Disconnect {
                    reason: "liveness timeout".to_string(),
                },
            )
            .await;
            return false;
        }

        match (PeerMessage::Ping { timestamp }).encode() {
            Ok(text) => {
                if let Err(e) = link.send(&text).await {
                    debug!(peer = %peer_id, error = %e, "Failed to send ping");
                }
            }
            Err(e) => debug!(error = %e, "Failed to encode ping"),
        }
        true
    }

    // ─────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────

    /// Remove an entry without notifying anyone; callers hold the peer's op lock
    async fn detach(&self, peer_id: &str) -> Option<PeerEntry> {
        let mut entry = self.state.lock().entries.remove(peer_id)?;
        if let Some(attempt) = entry.attempt.take() {
            attempt.timeout.abort();
        }
        if let Some(keepalive) = entry.keepalive.take() {
            keepalive.abort();
        }
        entry.link.close().await;
        Some(entry)
    }

    /// Remove an entry and notify listeners; callers hold the peer's op lock
    async fn teardown(&self, peer_id: &str, generation: Option<u64>, cause: Teardown) -> bool {
        let matches = self
            .state
            .lock()
            .entries
            .get(peer_id)
            .is_some_and(|e| generation.map_or(true, |g| g == e.generation));
        if !matches {
            return false;
        }
        let Some(entry) = self.detach(peer_id).await else {
            return false;
        };
        self.registry.remove(peer_id);

        match cause {
            Teardown::Disconnect { reason } => {
                info!(peer = %peer_id, reason = %reason, "Peer disconnected");
                for waiter in entry.waiters {
                    let _ = waiter.send(Err(Error::Connection(format!(
                        "connection to {} closed: {}",
                        peer_id, reason
                    ))));
                }
                self.events.publish(&PeerEvent::Disconnected {
                    peer_id: peer_id.to_string(),
                    reason,
                });
            }
            Teardown::Failed { kind, message } => {
                for waiter in entry.waiters {
                    let _ = waiter.send(Err(Error::connection_failed(peer_id, kind)));
                }
                self.events.publish(&PeerEvent::ConnectionError {
                    peer_id: peer_id.to_string(),
                    kind,
                    message,
                });
            }
        }
        true
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
