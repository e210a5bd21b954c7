//! WebRTC data-channel links
//!
//! One `RTCPeerConnection` per peer with a single ordered data channel.
//! Initiators create the channel and the offer; responders receive the
//! channel through `on_data_channel`. Candidates are trickled through the
//! signal sink and queued locally until the remote description is set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{ConnectionFailure, Error, Result};
use crate::ice::IceServer;
use crate::protocol::{IceCandidate, Signal};
use crate::signaling::SignalSink;

use super::link::{LinkEvent, LinkEvents, LinkSetup, PeerLink, PeerLinkFactory};

const CHANNEL_LABEL: &str = "llmesh";

fn to_rtc_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn to_rtc_candidate(c: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_mline_index: c.sdp_m_line_index,
        username_fragment: c.username_fragment,
    }
}

fn from_rtc_candidate(c: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_m_line_index: c.sdp_mline_index,
        username_fragment: c.username_fragment,
    }
}

/// Negotiation failures are reported as ICE failures for the peer
fn negotiation_error(peer_id: &str, step: &str, e: webrtc::Error) -> Error {
    warn!(peer = %peer_id, step, error = %e, "WebRTC negotiation failed");
    Error::connection_failed(peer_id, ConnectionFailure::IceFailure)
}

// ─────────────────────────────────────────────────────────────────
// Factory
// ─────────────────────────────────────────────────────────────────

/// Production link strategy
#[derive(Debug, Default)]
pub struct WebRtcLinkFactory {
    include_loopback: bool,
}

impl WebRtcLinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also gather candidates on loopback interfaces
    pub fn with_loopback_candidates(mut self, include: bool) -> Self {
        self.include_loopback = include;
        self
    }

    async fn new_link(&self, setup: &LinkSetup) -> Result<Arc<WebRtcLink>> {
        let mut settings = SettingEngine::default();
        settings.set_include_loopback_candidate(self.include_loopback);
        let api = APIBuilder::new().with_setting_engine(settings).build();

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: to_rtc_servers(&setup.ice_servers),
                ..Default::default()
            })
            .await
            .map_err(|e| negotiation_error(&setup.peer_id, "new_peer_connection", e))?;

        let link = Arc::new(WebRtcLink {
            peer_id: setup.peer_id.clone(),
            pc: Arc::new(pc),
            channel: Arc::new(Mutex::new(None)),
            opened: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            remote_described: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            signals: Arc::clone(&setup.signals),
            events: setup.events.clone(),
        });
        link.install_handlers();
        Ok(link)
    }
}

#[async_trait]
impl PeerLinkFactory for WebRtcLinkFactory {
    fn name(&self) -> &'static str {
        "webrtc"
    }

    async fn create(&self, setup: LinkSetup) -> Result<Arc<dyn PeerLink>> {
        let link = self.new_link(&setup).await?;
        if setup.initiator {
            link.begin_offer().await?;
        }
        Ok(link)
    }
}

// ─────────────────────────────────────────────────────────────────
// Link
// ─────────────────────────────────────────────────────────────────

pub struct WebRtcLink {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    opened: Arc<AtomicBool>,
    closed: AtomicBool,
    remote_described: AtomicBool,
    /// Candidates received before the remote description
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    signals: Arc<dyn SignalSink>,
    events: LinkEvents,
}

impl WebRtcLink {
    fn install_handlers(&self) {
        // Trickle local candidates to the remote side
        {
            let signals = Arc::clone(&self.signals);
            let peer_id = self.peer_id.clone();
            self.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let signals = Arc::clone(&signals);
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            let signal = Signal::Candidate {
                                candidate: from_rtc_candidate(init),
                            };
                            if let Err(e) = signals.send_signal(&peer_id, signal).await {
                                warn!(peer = %peer_id, error = %e, "Failed to send ICE candidate");
                            }
                        }
                        Err(e) => debug!(peer = %peer_id, error = %e, "Skipping unserializable candidate"),
                    }
                })
            }));
        }

        {
            let events = self.events.clone();
            let opened = Arc::clone(&self.opened);
            self.pc
                .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                    let events = events.clone();
                    let opened = Arc::clone(&opened);
                    Box::pin(async move {
                        debug!(peer = %events.peer_id(), state = %state, "Peer connection state changed");
                        match state {
                            RTCPeerConnectionState::Failed => events.emit(LinkEvent::Failed {
                                kind: ConnectionFailure::IceFailure,
                                reason: "ICE connectivity failed".to_string(),
                            }),
                            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed
                                if opened.load(Ordering::SeqCst) =>
                            {
                                events.emit(LinkEvent::Closed {
                                    reason: format!("peer connection {}", state),
                                })
                            }
                            _ => {}
                        }
                    })
                }));
        }

        // Responders get the channel from the remote side
        {
            let channel = Arc::clone(&self.channel);
            let opened = Arc::clone(&self.opened);
            let events = self.events.clone();
            self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let channel = Arc::clone(&channel);
                let opened = Arc::clone(&opened);
                let events = events.clone();
                Box::pin(async move {
                    debug!(peer = %events.peer_id(), label = %dc.label(), "Remote data channel");
                    wire_channel(dc, &channel, &opened, &events);
                })
            }));
        }
    }

    fn wire_channel(&self, dc: Arc<RTCDataChannel>) {
        wire_channel(dc, &self.channel, &self.opened, &self.events);
    }

    /// Open the channel and send the offer; the connection is closed if
    /// any step fails
    async fn begin_offer(&self) -> Result<()> {
        let result = self.send_offer().await;
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn send_offer(&self) -> Result<()> {
        let dc = self
            .pc
            .create_data_channel(CHANNEL_LABEL, None)
            .await
            .map_err(|e| negotiation_error(&self.peer_id, "create_data_channel", e))?;
        self.wire_channel(dc);

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| negotiation_error(&self.peer_id, "create_offer", e))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| negotiation_error(&self.peer_id, "set_local_description", e))?;

        self.signals
            .send_signal(&self.peer_id, Signal::Offer { sdp: offer.sdp })
            .await
    }

    async fn flush_candidates(&self) {
        let pending = std::mem::take(&mut *self.pending_candidates.lock());
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                debug!(peer = %self.peer_id, error = %e, "Queued candidate rejected");
            }
        }
    }
}

fn wire_channel(
    dc: Arc<RTCDataChannel>,
    slot: &Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    opened: &Arc<AtomicBool>,
    events: &LinkEvents,
) {
    *slot.lock() = Some(Arc::clone(&dc));

    {
        let opened = Arc::clone(opened);
        let events = events.clone();
        dc.on_open(Box::new(move || {
            let opened = Arc::clone(&opened);
            let events = events.clone();
            Box::pin(async move {
                if !opened.swap(true, Ordering::SeqCst) {
                    info!(peer = %events.peer_id(), "Data channel open");
                    events.emit(LinkEvent::Connected);
                }
            })
        }));
    }

    {
        let events = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => events.emit(LinkEvent::Message(text)),
                    Err(_) => warn!(peer = %events.peer_id(), "Dropping non-UTF-8 frame"),
                }
            })
        }));
    }

    {
        let opened = Arc::clone(opened);
        let events = events.clone();
        dc.on_close(Box::new(move || {
            let opened = Arc::clone(&opened);
            let events = events.clone();
            Box::pin(async move {
                if opened.load(Ordering::SeqCst) {
                    events.emit(LinkEvent::Closed {
                        reason: "data channel closed".to_string(),
                    });
                }
            })
        }));
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn apply_signal(&self, signal: Signal) -> Result<()> {
        match signal {
            Signal::Offer { sdp } => {
                let offer = RTCSessionDescription::offer(sdp)
                    .map_err(|e| negotiation_error(&self.peer_id, "parse offer", e))?;
                self.pc
                    .set_remote_description(offer)
                    .await
                    .map_err(|e| negotiation_error(&self.peer_id, "set_remote_description", e))?;
                self.remote_described.store(true, Ordering::SeqCst);

                let answer = self
                    .pc
                    .create_answer(None)
                    .await
                    .map_err(|e| negotiation_error(&self.peer_id, "create_answer", e))?;
                self.pc
                    .set_local_description(answer.clone())
                    .await
                    .map_err(|e| negotiation_error(&self.peer_id, "set_local_description", e))?;
                self.signals
                    .send_signal(&self.peer_id, Signal::Answer { sdp: answer.sdp })
                    .await?;
                self.flush_candidates().await;
            }
            Signal::Answer { sdp } => {
                let answer = RTCSessionDescription::answer(sdp)
                    .map_err(|e| negotiation_error(&self.peer_id, "parse answer", e))?;
                self.pc
                    .set_remote_description(answer)
                    .await
                    .map_err(|e| negotiation_error(&self.peer_id, "set_remote_description", e))?;
                self.remote_described.store(true, Ordering::SeqCst);
                self.flush_candidates().await;
            }
            Signal::Candidate { candidate } => {
                let init = to_rtc_candidate(candidate);
                if !self.remote_described.load(Ordering::SeqCst) {
                    self.pending_candidates.lock().push(init);
                    return Ok(());
                }
                if let Err(e) = self.pc.add_ice_candidate(init).await {
                    debug!(peer = %self.peer_id, error = %e, "Candidate rejected");
                }
            }
        }
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<()> {
        let channel = self
            .channel
            .lock()
            .clone()
            .filter(|_| self.opened.load(Ordering::SeqCst))
            .ok_or_else(|| Error::transport_send(&self.peer_id, "data channel not open"))?;

        channel
            .send_text(text.to_string())
            .await
            .map_err(|e| Error::transport_send(&self.peer_id, e.to_string()))?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Closing is local; suppress the close callbacks' events
        self.opened.store(false, Ordering::SeqCst);
        if let Err(e) = self.pc.close().await {
            debug!(peer = %self.peer_id, error = %e, "Error closing peer connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::link::TaggedLinkEvent;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use webrtc::peer_connection::signaling_state::RTCSignalingState;

    const WAIT: Duration = Duration::from_secs(30);

    /// Relay that is never reachable
    struct DeadSink;

    #[async_trait]
    impl SignalSink for DeadSink {
        async fn send_signal(&self, _target: &str, _signal: Signal) -> Result<()> {
            Err(Error::Connection("not registered with relay".into()))
        }
    }

    /// Hands each signal straight to the target link
    struct DirectSink {
        from: String,
        tx: mpsc::UnboundedSender<(String, Signal)>,
    }

    #[async_trait]
    impl SignalSink for DirectSink {
        async fn send_signal(&self, target: &str, signal: Signal) -> Result<()> {
            debug!(from = %self.from, to = %target, kind = signal.kind(), "Loopback signal");
            self.tx
                .send((target.to_string(), signal))
                .map_err(|_| Error::Connection("loopback closed".into()))
        }
    }

    fn setup(
        local: &str,
        remote: &str,
        initiator: bool,
        signals: Arc<dyn SignalSink>,
    ) -> (LinkSetup, mpsc::UnboundedReceiver<TaggedLinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let setup = LinkSetup {
            local_id: local.to_string(),
            peer_id: remote.to_string(),
            initiator,
            ice_servers: Vec::new(),
            signals,
            events: LinkEvents::new(remote, 1, tx),
        };
        (setup, rx)
    }

    async fn next_event<F>(rx: &mut mpsc::UnboundedReceiver<TaggedLinkEvent>, mut matches: F) -> LinkEvent
    where
        F: FnMut(&LinkEvent) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let tagged = rx.recv().await.expect("event channel closed");
                if matches(&tagged.event) {
                    return tagged.event;
                }
            }
        })
        .await
        .expect("timed out waiting for link event")
    }

    #[tokio::test]
    async fn test_failed_offer_closes_connection() {
        let factory = WebRtcLinkFactory::new();
        let (first, _events) = setup("alice", "bob", true, Arc::new(DeadSink));

        let link = factory.new_link(&first).await.unwrap();
        let err = link.begin_offer().await.unwrap_err();

        assert!(matches!(err, Error::Connection(_)));
        assert!(link.closed.load(Ordering::SeqCst));
        assert_eq!(link.pc.signaling_state(), RTCSignalingState::Closed);

        let (second, _events) = setup("alice", "bob", true, Arc::new(DeadSink));
        assert!(factory.create(second).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_links_connect_exchange_and_close() {
        let factory = WebRtcLinkFactory::new().with_loopback_candidates(true);
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Signal)>();
        let links: Arc<Mutex<HashMap<String, Arc<dyn PeerLink>>>> = Default::default();

        // Deliver signals in order, waiting for a target that is still being built
        let router_links = Arc::clone(&links);
        let router = tokio::spawn(async move {
            while let Some((target, signal)) = rx.recv().await {
                let link = loop {
                    if let Some(link) = router_links.lock().get(&target).cloned() {
                        break link;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                };
                if let Err(e) = link.apply_signal(signal).await {
                    debug!(to = %target, error = %e, "Loopback signal rejected");
                }
            }
        });

        let (bob_setup, mut bob_events) = setup(
            "bob",
            "alice",
            false,
            Arc::new(DirectSink {
                from: "bob".into(),
                tx: tx.clone(),
            }),
        );
        let bob = factory.create(bob_setup).await.unwrap();
        links.lock().insert("bob".into(), Arc::clone(&bob));

        let (alice_setup, mut alice_events) = setup(
            "alice",
            "bob",
            true,
            Arc::new(DirectSink {
                from: "alice".into(),
                tx,
            }),
        );
        let alice = factory.create(alice_setup).await.unwrap();
        links.lock().insert("alice".into(), Arc::clone(&alice));

        next_event(&mut alice_events, |e| matches!(e, LinkEvent::Connected)).await;
        next_event(&mut bob_events, |e| matches!(e, LinkEvent::Connected)).await;

        alice.send(r#"{"type":"ping","timestamp":1}"#).await.unwrap();
        let received = next_event(&mut bob_events, |e| matches!(e, LinkEvent::Message(_))).await;
        assert_eq!(received, LinkEvent::Message(r#"{"type":"ping","timestamp":1}"#.into()));

        bob.send("pong").await.unwrap();
        let received = next_event(&mut alice_events, |e| matches!(e, LinkEvent::Message(_))).await;
        assert_eq!(received, LinkEvent::Message("pong".into()));

        alice.close().await;
        let closed = next_event(&mut bob_events, |e| matches!(e, LinkEvent::Closed { .. })).await;
        assert!(matches!(closed, LinkEvent::Closed { .. }));
        assert!(alice.send("late").await.is_err());

        bob.close().await;
        router.abort();
    }

    #[test]
    fn test_ice_server_conversion() {
        let servers = vec![
            IceServer::stun("stun:stun.l.google.com:19302"),
            IceServer {
                urls: vec!["turn:relay.example.net:3478?transport=udp".into()],
                username: Some("u".into()),
                credential: Some("p".into()),
            },
        ];
        let rtc = to_rtc_servers(&servers);
        assert_eq!(rtc.len(), 2);
        assert!(rtc[0].username.is_empty());
        assert_eq!(rtc[1].credential, "p");
    }

    #[test]
    fn test_candidate_conversion_keeps_fields() {
        let c = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: Some("abcd".into()),
        };
        assert_eq!(from_rtc_candidate(to_rtc_candidate(c.clone())), c);
    }
}
