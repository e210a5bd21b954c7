//! Helpers for exercising the peer layer without a relay

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::ice::IceConfigResolver;
use crate::protocol::Signal;
use crate::signaling::SignalSink;

use super::link::MemoryNetwork;
use super::manager::{PeerConnectionManager, PeerManagerConfig};

/// Records outbound signals instead of sending them
#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<(String, Signal)>>,
}

#[async_trait]
impl SignalSink for RecordingSink {
    async fn send_signal(&self, target: &str, signal: Signal) -> Result<()> {
        self.sent.lock().push((target.to_string(), signal));
        Ok(())
    }
}

impl RecordingSink {
    pub fn sent_kinds(&self) -> Vec<(String, &'static str)> {
        self.sent.lock().iter().map(|(t, s)| (t.clone(), s.kind())).collect()
    }
}

/// Queues signals for delivery to the target manager
pub struct LoopbackSink {
    from: String,
    tx: mpsc::UnboundedSender<(String, String, Signal)>,
}

#[async_trait]
impl SignalSink for LoopbackSink {
    async fn send_signal(&self, target: &str, signal: Signal) -> Result<()> {
        self.tx
            .send((target.to_string(), self.from.clone(), signal))
            .map_err(|_| Error::Connection("loopback closed".into()))
    }
}

pub fn stun_resolver() -> Arc<IceConfigResolver> {
    Arc::new(IceConfigResolver::new(
        vec!["stun:stun.l.google.com:19302".into()],
        0.8,
        None,
    ))
}

pub fn config(local: &str) -> PeerManagerConfig {
    PeerManagerConfig {
        local_id: local.to_string(),
        connect_timeout: std::time::Duration::from_secs(60),
        signal_replay_delay: std::time::Duration::from_millis(50),
        ..Default::default()
    }
}

/// Started manager using in-memory links
pub fn manager(
    config: PeerManagerConfig,
    network: &Arc<MemoryNetwork>,
    sink: Arc<dyn SignalSink>,
) -> Arc<PeerConnectionManager> {
    let m = PeerConnectionManager::new(config, Arc::new(network.factory()), sink, stun_resolver());
    m.start();
    m
}

/// "alice" and "bob" wired through an in-process relay
pub fn pair(network: &Arc<MemoryNetwork>) -> (Arc<PeerConnectionManager>, Arc<PeerConnectionManager>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, String, Signal)>();
    let a = manager(
        config("alice"),
        network,
        Arc::new(LoopbackSink {
            from: "alice".into(),
            tx: tx.clone(),
        }),
    );
    let b = manager(
        config("bob"),
        network,
        Arc::new(LoopbackSink {
            from: "bob".into(),
            tx,
        }),
    );

    let (wa, wb) = (Arc::downgrade(&a), Arc::downgrade(&b));
    tokio::spawn(async move {
        while let Some((target, from, signal)) = rx.recv().await {
            let target = if target == "alice" { wa.upgrade() } else { wb.upgrade() };
            if let Some(m) = target {
                let _ = m.handle_signal(&from, signal).await;
            }
        }
    });
    (a, b)
}

/// Connected pair; returns once both sides report the link open
pub async fn connected_pair(
    network: &Arc<MemoryNetwork>,
) -> (Arc<PeerConnectionManager>, Arc<PeerConnectionManager>) {
    let (a, b) = pair(network);
    a.connect_to("bob").await.expect("connect alice -> bob");
    while !b.is_connected("alice") {
        tokio::task::yield_now().await;
    }
    (a, b)
}
