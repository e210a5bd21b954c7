//! Peer transport strategy
//!
//! A [`PeerLinkFactory`] is picked once when the node is built and creates
//! one [`PeerLink`] per remote peer. Links report progress through
//! [`LinkEvents`]; the manager owns everything else.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ConnectionFailure, Error, Result};
use crate::ice::IceServer;
use crate::protocol::Signal;
use crate::signaling::SignalSink;

// ─────────────────────────────────────────────────────────────────
// Link Events
// ─────────────────────────────────────────────────────────────────

/// Progress reported by a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Data channel is open
    Connected,
    /// Text frame from the remote side
    Message(String),
    /// Channel closed after being open
    Closed { reason: String },
    /// Establishment or transport failure
    Failed { kind: ConnectionFailure, reason: String },
}

/// Event tagged with the attempt it belongs to
#[derive(Debug, Clone)]
pub struct TaggedLinkEvent {
    pub peer_id: String,
    pub generation: u64,
    pub event: LinkEvent,
}

/// Sender handed to each link
#[derive(Debug, Clone)]
pub struct LinkEvents {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedLinkEvent>,
}

impl LinkEvents {
    pub fn new(peer_id: impl Into<String>, generation: u64, tx: mpsc::UnboundedSender<TaggedLinkEvent>) -> Self {
        Self {
            peer_id: peer_id.into(),
            generation,
            tx,
        }
    }

    pub fn emit(&self, event: LinkEvent) {
        let _ = self.tx.send(TaggedLinkEvent {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        });
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

// ─────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────

/// Everything a factory needs to build one link
pub struct LinkSetup {
    pub local_id: String,
    pub peer_id: String,
    /// Initiators send the offer; responders wait for one
    pub initiator: bool,
    pub ice_servers: Vec<IceServer>,
    pub signals: Arc<dyn SignalSink>,
    pub events: LinkEvents,
}

/// One direct transport to a remote peer
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Apply an offer, answer or candidate from the remote side
    async fn apply_signal(&self, signal: Signal) -> Result<()>;

    /// Send one text frame; fails unless the channel is open
    async fn send(&self, text: &str) -> Result<()>;

    /// Tear the transport down. Idempotent.
    async fn close(&self);
}

/// Creates links of one transport kind
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build a link; an initiator link emits its offer before returning
    async fn create(&self, setup: LinkSetup) -> Result<Arc<dyn PeerLink>>;
}

// ─────────────────────────────────────────────────────────────────
// In-memory links
// ─────────────────────────────────────────────────────────────────

/// Shared switchboard connecting in-memory links by (local, remote) id
#[derive(Default)]
pub struct MemoryNetwork {
    links: Mutex<HashMap<(String, String), Weak<MemoryLink>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>) -> MemoryLinkFactory {
        MemoryLinkFactory {
            network: Arc::clone(self),
        }
    }

    /// Live link held by `local` towards `remote`
    pub fn link(&self, local: &str, remote: &str) -> Option<Arc<MemoryLink>> {
        self.links
            .lock()
            .get(&(local.to_string(), remote.to_string()))
            .and_then(Weak::upgrade)
    }

    fn counterpart(&self, local: &str, remote: &str) -> Option<Arc<MemoryLink>> {
        self.link(remote, local)
    }

    fn register(&self, link: &Arc<MemoryLink>) {
        self.links.lock().insert(
            (link.local_id.clone(), link.peer_id.clone()),
            Arc::downgrade(link),
        );
    }

    fn unregister(&self, link: &MemoryLink) {
        let key = (link.local_id.clone(), link.peer_id.clone());
        let mut links = self.links.lock();
        if links
            .get(&key)
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), link as *const MemoryLink))
        {
            links.remove(&key);
        }
    }
}

/// Factory for in-process links
pub struct MemoryLinkFactory {
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl PeerLinkFactory for MemoryLinkFactory {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, setup: LinkSetup) -> Result<Arc<dyn PeerLink>> {
        let link = Arc::new(MemoryLink {
            local_id: setup.local_id,
            peer_id: setup.peer_id,
            signals: setup.signals,
            events: setup.events,
            network: Arc::downgrade(&self.network),
            state: Mutex::new(MemoryLinkState::default()),
        });
        self.network.register(&link);

        if setup.initiator {
            let offer = Signal::Offer {
                sdp: format!("memory:{}", link.local_id),
            };
            link.signals.send_signal(&link.peer_id, offer).await?;
        }

        Ok(link)
    }
}

#[derive(Default)]
struct MemoryLinkState {
    open: bool,
    closed: bool,
    applied: Vec<Signal>,
}

/// In-process link; opens once the offer/answer exchange completes
pub struct MemoryLink {
    local_id: String,
    peer_id: String,
    signals: Arc<dyn SignalSink>,
    events: LinkEvents,
    network: Weak<MemoryNetwork>,
    state: Mutex<MemoryLinkState>,
}

impl MemoryLink {
    /// Signals applied so far, in order
    pub fn applied_signals(&self) -> Vec<Signal> {
        self.state.lock().applied.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn open(&self) {
        let mut state = self.state.lock();
        if !state.open && !state.closed {
            state.open = true;
            drop(state);
            self.events.emit(LinkEvent::Connected);
        }
    }

    fn remote_closed(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            state.open = false;
            drop(state);
            self.events.emit(LinkEvent::Closed {
                reason: "remote closed".to_string(),
            });
        }
    }

    fn counterpart(&self) -> Option<Arc<MemoryLink>> {
        self.network
            .upgrade()
            .and_then(|n| n.counterpart(&self.local_id, &self.peer_id))
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn apply_signal(&self, signal: Signal) -> Result<()> {
        if self.state.lock().closed {
            return Err(Error::connection_failed(&self.peer_id, ConnectionFailure::IceFailure));
        }
        self.state.lock().applied.push(signal.clone());

        match signal {
            Signal::Offer { .. } => {
                let answer = Signal::Answer {
                    sdp: format!("memory:{}", self.local_id),
                };
                self.signals.send_signal(&self.peer_id, answer).await?;
            }
            Signal::Answer { .. } => {
                // Both sides open once the initiator holds the answer
                if let Some(remote) = self.counterpart() {
                    remote.open();
                    self.open();
                }
            }
            Signal::Candidate { .. } => {}
        }
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::transport_send(&self.peer_id, "channel not open"));
        }
        let remote = self
            .counterpart()
            .ok_or_else(|| Error::transport_send(&self.peer_id, "remote side gone"))?;
        remote.events.emit(LinkEvent::Message(text.to_string()));
        Ok(())
    }

    async fn close(&self) {
        let was_open = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::replace(&mut state.open, false)
        };
        debug!(peer = %self.peer_id, was_open, "Closing in-memory link");
        // An unanswered attempt has nothing on the far side to notify
        if was_open {
            if let Some(remote) = self.counterpart() {
                remote.remote_closed();
            }
        }
        if let Some(network) = self.network.upgrade() {
            network.unregister(self);
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Records outbound signals instead of sending them
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, Signal)>>,
    }

    #[async_trait]
    impl SignalSink for RecordingSink {
        async fn send_signal(&self, target: &str, signal: Signal) -> Result<()> {
            self.sent.lock().push((target.to_string(), signal));
            Ok(())
        }
    }

    fn setup(
        local: &str,
        remote: &str,
        initiator: bool,
        sink: Arc<RecordingSink>,
    ) -> (LinkSetup, mpsc::UnboundedReceiver<TaggedLinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let setup = LinkSetup {
            local_id: local.into(),
            peer_id: remote.into(),
            initiator,
            ice_servers: vec![],
            signals: sink,
            events: LinkEvents::new(remote, 1, tx),
        };
        (setup, rx)
    }

    #[tokio::test]
    async fn test_initiator_emits_offer() {
        let network = MemoryNetwork::new();
        let sink = Arc::new(RecordingSink::default());
        let (s, _rx) = setup("a", "b", true, Arc::clone(&sink));

        network.factory().create(s).await.unwrap();

        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "b");
        assert!(sent[0].1.is_offer());
    }

    #[tokio::test]
    async fn test_offer_answer_opens_both_sides() {
        let network = MemoryNetwork::new();
        let sink_a = Arc::new(RecordingSink::default());
        let sink_b = Arc::new(RecordingSink::default());
        let (sa, mut rx_a) = setup("a", "b", true, Arc::clone(&sink_a));
        let (sb, mut rx_b) = setup("b", "a", false, Arc::clone(&sink_b));

        let a = network.factory().create(sa).await.unwrap();
        let b = network.factory().create(sb).await.unwrap();

        let offer = sink_a.sent.lock()[0].1.clone();
        b.apply_signal(offer).await.unwrap();
        let answer = sink_b.sent.lock()[0].1.clone();
        a.apply_signal(answer).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap().event, LinkEvent::Connected);
        assert_eq!(rx_b.recv().await.unwrap().event, LinkEvent::Connected);

        a.send("hello").await.unwrap();
        assert_eq!(rx_b.recv().await.unwrap().event, LinkEvent::Message("hello".into()));

        a.close().await;
        assert!(matches!(rx_b.recv().await.unwrap().event, LinkEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let network = MemoryNetwork::new();
        let sink = Arc::new(RecordingSink::default());
        let (s, _rx) = setup("a", "b", false, sink);
        let link = network.factory().create(s).await.unwrap();

        let err = link.send("x").await.unwrap_err();
        assert!(matches!(err, Error::TransportSend { .. }));
    }
}
