//! Shared test infrastructure
//!
//! `MockRelay` speaks enough of the relay protocol for real clients:
//! auth, register, roster broadcasts, and `webrtc-signal` forwarding.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};

/// Token the relay refuses
pub const REJECTED_TOKEN: &str = "revoked-token";

struct Session {
    conn_id: u64,
    tx: mpsc::UnboundedSender<WsMessage>,
    is_hosting: bool,
    models: Vec<String>,
}

#[derive(Default)]
struct RelayState {
    sessions: HashMap<String, Session>,
    /// (peer id, message) in arrival order
    received: Vec<(String, Value)>,
    connections: usize,
}

/// In-process signaling relay
pub struct MockRelay {
    addr: SocketAddr,
    state: Arc<Mutex<RelayState>>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(RelayState::default()));
        let next_conn = Arc::new(AtomicU64::new(1));

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                let conn_id = next_conn.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(handle_connection(stream, state, conn_id));
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// TCP connections accepted so far
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections
    }

    /// Message types received from `peer_id`, in order
    pub fn types_from(&self, peer_id: &str) -> Vec<String> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|(p, _)| p == peer_id)
            .filter_map(|(_, m)| m["type"].as_str().map(str::to_string))
            .collect()
    }

    pub fn count_from(&self, peer_id: &str, msg_type: &str) -> usize {
        self.types_from(peer_id).iter().filter(|t| *t == msg_type).count()
    }

    /// Last message of `msg_type` from `peer_id`
    pub fn last_from(&self, peer_id: &str, msg_type: &str) -> Option<Value> {
        self.state
            .lock()
            .received
            .iter()
            .rev()
            .find(|(p, m)| p == peer_id && m["type"] == msg_type)
            .map(|(_, m)| m.clone())
    }

    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.state.lock().sessions.contains_key(peer_id)
    }

    /// Push a raw message to one registered peer
    pub fn send_to(&self, peer_id: &str, msg: Value) {
        if let Some(session) = self.state.lock().sessions.get(peer_id) {
            let _ = session.tx.send(WsMessage::Text(msg.to_string()));
        }
    }

    /// Close every open connection from the relay side
    pub fn kick_all(&self) {
        for session in self.state.lock().sessions.values() {
            let _ = session.tx.send(WsMessage::Close(None));
        }
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<Mutex<RelayState>>, conn_id: u64) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    state.lock().connections += 1;

    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, WsMessage::Close(_));
            if write.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let mut peer_id: Option<String> = None;

    while let Some(Ok(frame)) = read.next().await {
        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let Ok(msg) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        let from = peer_id.clone().unwrap_or_default();
        state.lock().received.push((
            msg["peerId"].as_str().map(str::to_string).unwrap_or(from.clone()),
            msg.clone(),
        ));

        match msg["type"].as_str().unwrap_or("") {
            "auth" => {
                let token = msg["token"].as_str().unwrap_or("");
                if token == REJECTED_TOKEN {
                    let _ = tx.send(WsMessage::Text(
                        json!({"type": "auth_response", "success": false, "error": "invalid token"}).to_string(),
                    ));
                    continue;
                }
                let id = msg["peerId"].as_str().unwrap_or("anonymous").to_string();
                let _ = tx.send(WsMessage::Text(
                    json!({"type": "auth_response", "success": true, "peerId": id}).to_string(),
                ));
                peer_id = Some(id);
            }
            "register" => {
                let Some(id) = peer_id.clone() else { continue };
                let is_hosting = msg["isHosting"].as_bool().unwrap_or(false);
                let models: Vec<String> = serde_json::from_value(msg["models"].clone()).unwrap_or_default();

                let mut s = state.lock();
                for (other, session) in s.sessions.iter() {
                    if *other != id {
                        let _ = session.tx.send(WsMessage::Text(
                            json!({"type": "peer-joined", "peerId": id, "isHosting": is_hosting, "models": models})
                                .to_string(),
                        ));
                    }
                }
                s.sessions.insert(
                    id.clone(),
                    Session {
                        conn_id,
                        tx: tx.clone(),
                        is_hosting,
                        models,
                    },
                );
                let _ = tx.send(WsMessage::Text(json!({"type": "registered", "peerId": id}).to_string()));
            }
            "request-peer-list" => {
                let Some(id) = peer_id.clone() else { continue };
                let s = state.lock();
                let peers: Vec<Value> = s
                    .sessions
                    .iter()
                    .filter(|(other, _)| **other != id)
                    .map(|(other, session)| {
                        json!({"peerId": other, "isHosting": session.is_hosting, "models": session.models})
                    })
                    .collect();
                let _ = tx.send(WsMessage::Text(json!({"type": "existing-peers", "peers": peers}).to_string()));
            }
            "webrtc-signal" => {
                let Some(id) = peer_id.clone() else { continue };
                let target = msg["targetPeerId"].as_str().unwrap_or("");
                let s = state.lock();
                if let Some(session) = s.sessions.get(target) {
                    let forwarded = json!({"type": "webrtc-signal", "fromPeerId": id, "signal": msg["signal"]});
                    let _ = session.tx.send(WsMessage::Text(forwarded.to_string()));
                }
            }
            "hosting-status" => {
                let Some(id) = peer_id.clone() else { continue };
                let is_hosting = msg["isHosting"].as_bool().unwrap_or(false);
                let models: Vec<String> = serde_json::from_value(msg["models"].clone()).unwrap_or_default();

                let mut s = state.lock();
                if let Some(session) = s.sessions.get_mut(&id) {
                    session.is_hosting = is_hosting;
                    session.models = models.clone();
                }
                for (other, session) in s.sessions.iter() {
                    if *other != id {
                        let _ = session.tx.send(WsMessage::Text(
                            json!({"type": "hosting-status", "peerId": id, "isHosting": is_hosting, "models": models})
                                .to_string(),
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    // A newer connection may already have re-registered under this id
    if let Some(id) = peer_id {
        let mut s = state.lock();
        if s.sessions.get(&id).is_some_and(|session| session.conn_id == conn_id) {
            s.sessions.remove(&id);
            for session in s.sessions.values() {
                let _ = session
                    .tx
                    .send(WsMessage::Text(json!({"type": "peer-left", "peerId": id}).to_string()));
            }
        }
    }
    writer.abort();
}

/// Poll `cond` every 10ms until it holds or `timeout` passes
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
