//! Request/response correlation over peer links
//!
//! `request` tags each outbound envelope with a random id and parks a
//! continuation under it. Replies resolve the matching continuation;
//! replies nobody is waiting for are dropped. Inbound requests are
//! republished for the node to serve.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{EventChannel, Subscription};
use crate::protocol::PeerMessage;

use super::manager::{InboundMessage, PeerConnectionManager, PeerEvent};

/// Request received from a peer
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRequest {
    pub peer_id: String,
    pub kind: String,
    pub request_id: String,
    pub data: Value,
}

struct PendingRequest {
    peer_id: String,
    reply: oneshot::Sender<Result<Value>>,
    cancel: CancellationToken,
}

/// Correlates replies with outstanding requests
pub struct RequestRouter {
    manager: Arc<PeerConnectionManager>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    requests: EventChannel<InboundRequest>,
    default_timeout: Duration,
}

impl RequestRouter {
    pub fn new(manager: Arc<PeerConnectionManager>, default_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            manager,
            pending: Mutex::new(HashMap::new()),
            requests: EventChannel::new(),
            default_timeout,
        })
    }

    /// Consume manager messages and lifecycle events
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut messages = self.manager.subscribe_messages();
        let mut events = self.manager.subscribe_events();
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = messages.recv() => {
                        let Some(InboundMessage { peer_id, message }) = msg else { break };
                        let Some(router) = weak.upgrade() else { break };
                        if let Some(request) = router.handle_inbound(&peer_id, message) {
                            router.requests.publish(&request);
                        }
                    }
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let Some(router) = weak.upgrade() else { break };
                        match event {
                            PeerEvent::Disconnected { peer_id, reason } => router.fail_peer(&peer_id, &reason),
                            PeerEvent::ConnectionError { peer_id, message, .. } => router.fail_peer(&peer_id, &message),
                            PeerEvent::Connected { .. } => {}
                        }
                    }
                }
            }
            debug!("Request router loop terminated");
        })
    }

    pub fn subscribe_requests(&self) -> Subscription<InboundRequest> {
        self.requests.subscribe()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fire-and-forget send
    pub async fn send(&self, peer_id: &str, message: &PeerMessage) -> Result<()> {
        self.manager.send(peer_id, message).await
    }

    /// Send a request and wait for its reply
    pub async fn request(&self, peer_id: &str, kind: &str, payload: Value, timeout: Duration) -> Result<Value> {
        let request_id = Uuid::new_v4().to_string();
        let (reply, rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        self.pending.lock().insert(
            request_id.clone(),
            PendingRequest {
                peer_id: peer_id.to_string(),
                reply,
                cancel: cancel.clone(),
            },
        );

        let message = PeerMessage::request(kind, request_id.clone(), payload);
        if let Err(e) = self.manager.send(peer_id, &message).await {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }
        debug!(peer = %peer_id, kind, request_id = %request_id, "Request sent");

        let result = tokio::select! {
            reply = rx => reply.unwrap_or_else(|_| Err(Error::Cancelled { request_id: request_id.clone() })),
            _ = cancel.cancelled() => Err(Error::Cancelled { request_id: request_id.clone() }),
            _ = tokio::time::sleep(timeout) => Err(Error::RequestTimeout {
                peer_id: peer_id.to_string(),
                request_id: request_id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        self.pending.lock().remove(&request_id);
        result
    }

    /// Abandon one outstanding request
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.pending.lock().remove(request_id) {
            Some(pending) => {
                pending.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Abandon everything outstanding
    pub fn cancel_all(&self) {
        for (_, pending) in self.pending.lock().drain() {
            pending.cancel.cancel();
        }
    }

    /// Resolve replies; hand back requests for the caller to serve
    pub fn handle_inbound(&self, peer_id: &str, message: PeerMessage) -> Option<InboundRequest> {
        match message {
            PeerMessage::Request {
                kind,
                request_id,
                data,
            } => Some(InboundRequest {
                peer_id: peer_id.to_string(),
                kind,
                request_id,
                data,
            }),
            PeerMessage::Response { request_id, data } => {
                self.resolve(peer_id, &request_id, Ok(data));
                None
            }
            PeerMessage::Error { request_id, error } => {
                self.resolve(
                    peer_id,
                    &request_id,
                    Err(Error::RemoteError {
                        peer_id: peer_id.to_string(),
                        message: error,
                    }),
                );
                None
            }
            PeerMessage::Ping { .. } | PeerMessage::Pong { .. } => None,
        }
    }

    fn resolve(&self, peer_id: &str, request_id: &str, result: Result<Value>) {
        let mut pending = self.pending.lock();
        match pending.get(request_id) {
            Some(entry) if entry.peer_id == peer_id => {
                if let Some(entry) = pending.remove(request_id) {
                    let _ = entry.reply.send(result);
                }
            }
            Some(_) => warn!(peer = %peer_id, request_id, "Reply from a peer the request was not sent to"),
            None => debug!(peer = %peer_id, request_id, "Ignoring reply with no pending request"),
        }
    }

    /// Reply to an inbound request
    pub async fn respond(&self, peer_id: &str, request_id: &str, result: std::result::Result<Value, String>) -> Result<()> {
        let message = match result {
            Ok(data) => PeerMessage::Response {
                request_id: request_id.to_string(),
                data,
            },
            Err(error) => PeerMessage::Error {
                request_id: request_id.to_string(),
                error,
            },
        };
        self.manager.send(peer_id, &message).await
    }

    /// Fail every request waiting on `peer_id`
    pub fn fail_peer(&self, peer_id: &str, reason: &str) {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.peer_id == peer_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        if !failed.is_empty() {
            debug!(peer = %peer_id, count = failed.len(), reason, "Failing pending requests");
        }
        for entry in failed {
            let _ = entry.reply.send(Err(Error::transport_send(
                peer_id,
                format!("connection lost: {}", reason),
            )));
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
