//! Node context
//!
//! Owns one instance of every subsystem and wires their event channels
//! together. Built once per process; `init()` brings the node onto the
//! mesh and `shutdown()` takes it off again.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{ChatRequestHandler, SharedBackend};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::ice::IceConfigResolver;
use crate::peer::{InboundRequest, PeerConnectionManager, PeerLinkFactory, PeerManagerConfig, RequestRouter};
use crate::protocol::{Capabilities, REQUEST_CHAT, REQUEST_MODELS};
use crate::queue::{QueueConfig, QueueManager, QueueOutcome};
use crate::events::Subscription;
use crate::signaling::{
    Credentials, MeshStatus, NodeIdentity, RosterEvent, SignalEvent, SignalSink, SignalingClient,
    SignalingClientConfig,
};
use crate::system::{resolve_connect_timeout, DeviceInfo, ProbeResult};
use crate::types::{ChatMessage, ChatRequest, ChatResponse};

/// A running mesh participant
pub struct MeshNode {
    config: NodeConfig,
    local_id: String,
    backend: SharedBackend,
    resolver: Arc<IceConfigResolver>,
    signaling: Arc<SignalingClient>,
    peers: Arc<PeerConnectionManager>,
    router: Arc<RequestRouter>,
    queue: Arc<QueueManager>,
    hosted: Arc<RwLock<Vec<String>>>,
    device: Option<DeviceInfo>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    /// Build every subsystem; nothing touches the network yet
    pub fn new(
        config: NodeConfig,
        backend: SharedBackend,
        link_factory: Arc<dyn PeerLinkFactory>,
    ) -> Result<Arc<Self>> {
        Self::with_probe(config, backend, link_factory, None)
    }

    /// Like [`MeshNode::new`], using a capability probe for the connect timeout
    pub fn with_probe(
        config: NodeConfig,
        backend: SharedBackend,
        link_factory: Arc<dyn PeerLinkFactory>,
        probe: Option<ProbeResult>,
    ) -> Result<Arc<Self>> {
        let local_id = config.node_id();
        let resolver = Arc::new(IceConfigResolver::from_settings(&config.ice)?);
        let signaling = Arc::new(SignalingClient::new(SignalingClientConfig::from(&config.signaling)));

        let connect_timeout = resolve_connect_timeout(&config.peer, probe.as_ref());
        let peer_config = PeerManagerConfig::from_settings(
            local_id.clone(),
            &config.peer,
            connect_timeout,
            config.node.auth_token.clone(),
        );
        let peers = PeerConnectionManager::new(
            peer_config,
            link_factory,
            Arc::clone(&signaling) as Arc<dyn SignalSink>,
            Arc::clone(&resolver),
        );
        let router = RequestRouter::new(Arc::clone(&peers), config.peer.request_timeout());

        let handler = Arc::new(ChatRequestHandler::new(Arc::clone(&backend)));
        let queue = Arc::new(QueueManager::new(QueueConfig::from(&config.queue), handler));

        info!(
            peer_id = %local_id,
            backend = backend.name(),
            connect_timeout_secs = connect_timeout.as_secs(),
            "Mesh node created"
        );

        Ok(Arc::new(Self {
            config,
            local_id,
            backend,
            resolver,
            signaling,
            peers,
            router,
            queue,
            hosted: Arc::new(RwLock::new(Vec::new())),
            device: probe.map(|p| p.device),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Join the mesh: start dispatch, connect to the relay, announce hosting
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        // Subscribe before connecting so the first roster snapshot is seen
        let signals = self.signaling.subscribe_signals();
        let roster = self.signaling.subscribe_roster();
        let requests = self.router.subscribe_requests();

        self.peers.start();
        let router_task = self.router.start();

        {
            let mut tasks = self.tasks.lock();
            tasks.push(router_task);
            tasks.push(self.spawn_signal_loop(signals));
            tasks.push(self.spawn_roster_loop(roster));
            tasks.push(self.spawn_request_loop(requests));
        }

        let hosting = self.resolve_hosted_models().await;

        let identity = NodeIdentity {
            peer_id: self.local_id.clone(),
            platform: self.config.node.platform.clone(),
            capabilities: Capabilities {
                data_channel: true,
                inference: !hosting.is_empty(),
                node_version: crate::version::build_info().node_version(),
            },
        };
        let credentials = Credentials {
            token: self.config.node.auth_token.clone().unwrap_or_default(),
        };

        // Hosting state is sent with the registration itself
        *self.hosted.write() = hosting.clone();
        self.signaling.announce_hosting(hosting, self.device.clone()).await?;
        self.signaling.connect(identity, credentials).await?;

        info!(peer_id = %self.local_id, hosting = self.is_hosting(), "Joined the mesh");
        Ok(())
    }

    /// Leave the mesh
    pub async fn shutdown(&self) {
        info!("Shutting down mesh node");

        self.peers.disconnect_all().await;
        let cleared = self.queue.clear_all();
        if cleared > 0 {
            debug!(cleared, "Rejected queued requests");
        }
        self.router.cancel_all();
        self.signaling.disconnect().await;

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Client path
    // ─────────────────────────────────────────────────────────────

    /// Run a chat completion on a remote host
    pub async fn chat(&self, peer_id: &str, model_id: &str, messages: Vec<ChatMessage>) -> Result<ChatResponse> {
        self.ensure_connected(peer_id).await?;

        let payload = serde_json::to_value(ChatRequest {
            model_id: model_id.to_string(),
            messages,
        })?;
        let reply = self
            .router
            .request(peer_id, REQUEST_CHAT, payload, self.router.default_timeout())
            .await?;

        serde_json::from_value(reply).map_err(|e| Error::ProtocolMalformed {
            message: format!("invalid chat reply from {}: {}", peer_id, e),
        })
    }

    /// Models a remote host serves
    pub async fn peer_models(&self, peer_id: &str) -> Result<Vec<String>> {
        self.ensure_connected(peer_id).await?;

        let reply = self
            .router
            .request(peer_id, REQUEST_MODELS, Value::Null, self.router.default_timeout())
            .await?;

        serde_json::from_value(reply["models"].clone()).map_err(|e| Error::ProtocolMalformed {
            message: format!("invalid models reply from {}: {}", peer_id, e),
        })
    }

    async fn ensure_connected(&self, peer_id: &str) -> Result<()> {
        if !self.peers.is_connected(peer_id) {
            self.peers.connect_to(peer_id).await?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn status(&self) -> MeshStatus {
        self.signaling.status()
    }

    pub fn is_hosting(&self) -> bool {
        !self.hosted.read().is_empty()
    }

    pub fn hosted_models(&self) -> Vec<String> {
        self.hosted.read().clone()
    }

    pub fn signaling(&self) -> &Arc<SignalingClient> {
        &self.signaling
    }

    pub fn peers(&self) -> &Arc<PeerConnectionManager> {
        &self.peers
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn resolver(&self) -> &Arc<IceConfigResolver> {
        &self.resolver
    }

    // ─────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────

    async fn resolve_hosted_models(&self) -> Vec<String> {
        if !self.config.hosting.enabled {
            return Vec::new();
        }
        if !self.config.hosting.models.is_empty() {
            return self.config.hosting.models.clone();
        }

        match self.backend.list_models().await {
            Ok(models) => models,
            Err(e) => {
                warn!(error = %e, "Backend did not report models; hosting nothing");
                Vec::new()
            }
        }
    }

    fn spawn_signal_loop(&self, mut signals: Subscription<SignalEvent>) -> JoinHandle<()> {
        let peers = Arc::clone(&self.peers);
        tokio::spawn(async move {
            // Sequential on purpose: signals for one peer must apply in order
            while let Some(SignalEvent { from, signal }) = signals.recv().await {
                let kind = signal.kind();
                if let Err(e) = peers.handle_signal(&from, signal).await {
                    warn!(peer = %from, kind, error = %e, "Failed to apply signal");
                }
            }
            debug!("Signal dispatch loop ended");
        })
    }

    fn spawn_roster_loop(&self, mut roster: Subscription<RosterEvent>) -> JoinHandle<()> {
        let peers = Arc::clone(&self.peers);
        tokio::spawn(async move {
            while let Some(event) = roster.recv().await {
                peers.handle_roster(event).await;
            }
            debug!("Roster dispatch loop ended");
        })
    }

    fn spawn_request_loop(&self, mut requests: Subscription<InboundRequest>) -> JoinHandle<()> {
        let server = RequestServer {
            router: Arc::clone(&self.router),
            queue: Arc::clone(&self.queue),
            hosted: Arc::clone(&self.hosted),
        };
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let server = server.clone();
                tokio::spawn(async move { server.serve(request).await });
            }
            debug!("Request dispatch loop ended");
        })
    }
}

/// Answers inbound peer requests
#[derive(Clone)]
struct RequestServer {
    router: Arc<RequestRouter>,
    queue: Arc<QueueManager>,
    hosted: Arc<RwLock<Vec<String>>>,
}

impl RequestServer {
    async fn serve(&self, request: InboundRequest) {
        let InboundRequest {
            peer_id,
            kind,
            request_id,
            data,
        } = request;
        debug!(peer = %peer_id, kind = %kind, request_id = %request_id, "Serving peer request");

        let result = match kind.as_str() {
            REQUEST_CHAT => self.serve_chat(&peer_id, &request_id, data).await,
            REQUEST_MODELS => Ok(json!({ "models": *self.hosted.read() })),
            other => Err(format!("unknown request type '{}'", other)),
        };

        if let Err(e) = self.router.respond(&peer_id, &request_id, result).await {
            warn!(peer = %peer_id, request_id = %request_id, error = %e, "Could not deliver reply");
        }
    }

    async fn serve_chat(&self, peer_id: &str, request_id: &str, data: Value) -> std::result::Result<Value, String> {
        let model_id = data
            .get("modelId")
            .and_then(Value::as_str)
            .ok_or_else(|| "chat request without modelId".to_string())?
            .to_string();

        if !self.hosted.read().iter().any(|m| *m == model_id) {
            return Err(format!("model '{}' is not hosted here", model_id));
        }

        match self.queue.enqueue_and_wait(request_id, peer_id, model_id, data).await {
            QueueOutcome::Completed(value) => Ok(value),
            QueueOutcome::Failed(message) => Err(message),
            QueueOutcome::Rejected(code) => Err(code.as_str().to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
