//! Configuration for the LLMesh node
//!
//! Sources, highest precedence first:
//! 1. CLI arguments
//! 2. Environment variables (LLMESH_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::logging::LOG_LEVELS;

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity
    pub node: NodeSettings,

    /// Signaling relay connection
    pub signaling: SignalingSettings,

    /// NAT traversal servers and relay credentials
    pub ice: IceSettings,

    /// Peer connection lifecycle
    pub peer: PeerSettings,

    /// Request arbitration
    pub queue: QueueSettings,

    /// What this node offers to the mesh
    pub hosting: HostingSettings,

    /// OpenAI-compatible inference endpoint
    pub openai: OpenAiSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Node identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Stable peer identifier (generated per process if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Human-readable device name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Bearer token presented to the relay and the credential endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Platform string announced at registration
    pub platform: String,
}

/// Signaling relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingSettings {
    /// Relay WebSocket URL
    pub url: String,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Time allowed for auth + registration after the socket opens
    pub registration_timeout_ms: u64,

    /// Reconnect attempts before giving up with an error status
    pub max_reconnect_attempts: u32,

    /// First reconnect delay in milliseconds
    pub initial_reconnect_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    pub max_reconnect_delay_ms: u64,

    /// WebSocket ping interval in milliseconds
    pub heartbeat_interval_ms: u64,
}

/// ICE settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceSettings {
    /// STUN servers used always, and alone when credentials are unavailable
    pub stun_servers: Vec<String>,

    /// Relay credential endpoint (`POST /turn-token`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,

    /// Fraction of the credential TTL after which a refresh is due
    pub refresh_ratio: f64,

    /// Credential fetch timeout in milliseconds
    pub fetch_timeout_ms: u64,
}

/// Peer connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSettings {
    /// Establishment timeout override; probed when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    /// Liveness ping interval in milliseconds
    pub ping_interval_ms: u64,

    /// Consecutive missed pongs before eviction (0 = never evict)
    pub max_missed_pongs: u32,

    /// Delay inserted between replayed buffered signals
    pub signal_replay_delay_ms: u64,

    /// Orphan signals retained per unknown peer
    pub max_buffered_signals: usize,

    /// Maximum simultaneous peer connections
    pub max_peers: usize,

    /// Dial hosting peers as soon as they appear in the roster
    pub auto_connect: bool,

    /// Default correlated request timeout in milliseconds
    pub request_timeout_ms: u64,
}

/// Queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Requests allowed per client per window
    pub rate_limit_requests: usize,

    /// Rolling window length in seconds
    pub rate_limit_window_secs: u64,

    /// Execution deadline per request in seconds
    pub request_timeout_secs: u64,
}

/// Hosting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostingSettings {
    /// Announce this node as a model host
    pub enabled: bool,

    /// Models to announce (empty = ask the backend)
    pub models: Vec<String>,
}

/// OpenAI-compatible API backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    /// API base URL (e.g., "http://localhost:11434/v1")
    pub base_url: String,

    /// API key (empty string for local servers like Ollama)
    pub api_key: String,

    /// Model used when a request does not name one
    pub default_model: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum retries on transient failures
    pub max_retries: u32,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (unset = console only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            auth_token: None,
            platform: std::env::consts::OS.to_string(),
        }
    }
}

impl Default for SignalingSettings {
    fn default() -> Self {
        Self {
            url: "wss://relay.llmesh.net/ws".to_string(),
            connect_timeout_ms: 15_000,
            registration_timeout_ms: 30_000,
            max_reconnect_attempts: 5,
            initial_reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            heartbeat_interval_ms: 25_000,
        }
    }
}

impl Default for IceSettings {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            token_url: None,
            refresh_ratio: 0.8,
            fetch_timeout_ms: 10_000,
        }
    }
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: None,
            ping_interval_ms: 15_000,
            max_missed_pongs: 3,
            signal_replay_delay_ms: 50,
            max_buffered_signals: 256,
            max_peers: 32,
            auto_connect: false,
            request_timeout_ms: 600_000,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            rate_limit_requests: 10,
            rate_limit_window_secs: 60,
            request_timeout_secs: 300,
        }
    }
}

impl Default for HostingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            models: vec![],
        }
    }
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: String::new(),
            default_model: "llama3".to_string(),
            timeout_secs: 120,
            max_retries: 2,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 5,
            json_format: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Duration helpers
// ─────────────────────────────────────────────────────────────────

impl SignalingSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl PeerSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl QueueSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl NodeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path)?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e.message()),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        config.apply_env_overrides();
        config.expand_paths();
        config.validate()?;

        Ok(config)
    }

    /// Resolve the configuration file: explicit path, then standard locations
    pub fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let mut search_paths = vec![PathBuf::from("llmesh.toml")];
        if let Some(dir) = dirs::config_dir() {
            search_paths.push(dir.join("llmesh").join("node.toml"));
        }
        if let Some(home) = dirs::home_dir() {
            search_paths.push(home.join(".llmesh").join("node.toml"));
        }
        search_paths.push(PathBuf::from("/etc/llmesh/node.toml"));

        for path in search_paths {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply LLMESH_* environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(val) = env_string("LLMESH_NODE_ID") {
            self.node.id = Some(val);
        }
        if let Some(val) = env_string("LLMESH_NODE_NAME") {
            self.node.name = Some(val);
        }
        if let Some(val) = env_string("LLMESH_AUTH_TOKEN") {
            self.node.auth_token = Some(val);
        }

        if let Some(val) = env_string("LLMESH_SIGNALING_URL") {
            self.signaling.url = val;
        }
        if let Some(n) = env_parse("LLMESH_MAX_RECONNECT_ATTEMPTS") {
            self.signaling.max_reconnect_attempts = n;
        }

        if let Some(val) = env_string("LLMESH_TURN_TOKEN_URL") {
            self.ice.token_url = Some(val);
        }

        if let Some(n) = env_parse("LLMESH_CONNECT_TIMEOUT_SECS") {
            self.peer.connect_timeout_secs = Some(n);
        }
        if let Some(n) = env_parse("LLMESH_MAX_PEERS") {
            self.peer.max_peers = n;
        }
        if let Some(b) = env_bool("LLMESH_AUTO_CONNECT") {
            self.peer.auto_connect = b;
        }

        if let Some(n) = env_parse("LLMESH_RATE_LIMIT") {
            self.queue.rate_limit_requests = n;
        }
        if let Some(n) = env_parse("LLMESH_QUEUE_TIMEOUT_SECS") {
            self.queue.request_timeout_secs = n;
        }

        if let Some(b) = env_bool("LLMESH_HOSTING") {
            self.hosting.enabled = b;
        }
        if let Some(val) = env_string("LLMESH_MODELS") {
            self.hosting.models = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(val) = env_string("LLMESH_OPENAI_BASE_URL") {
            self.openai.base_url = val;
        }
        if let Some(val) = env_string("LLMESH_OPENAI_API_KEY") {
            self.openai.api_key = val;
        }
        if let Some(val) = env_string("LLMESH_OPENAI_MODEL") {
            self.openai.default_model = val;
        }

        if let Some(val) = env_string("LLMESH_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = env_string("LLMESH_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Some(b) = env_bool("LLMESH_LOG_JSON") {
            self.logging.json_format = b;
        }
    }

    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let url = &self.signaling.url;
        if url.is_empty() {
            return Err(Error::Config("Signaling URL cannot be empty".to_string()));
        }
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::Config(
                "Signaling URL must start with ws:// or wss://".to_string(),
            ));
        }

        if let Some(ref token_url) = self.ice.token_url {
            if !token_url.starts_with("http://") && !token_url.starts_with("https://") {
                return Err(Error::Config(
                    "ice.token_url must start with http:// or https://".to_string(),
                ));
            }
        }

        if !(self.ice.refresh_ratio > 0.0 && self.ice.refresh_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "ice.refresh_ratio must be in (0, 1], got {}",
                self.ice.refresh_ratio
            )));
        }

        if self.queue.rate_limit_requests == 0 {
            return Err(Error::Config(
                "queue.rate_limit_requests must be at least 1".to_string(),
            ));
        }
        if self.queue.request_timeout_secs == 0 {
            return Err(Error::Config(
                "queue.request_timeout_secs must be at least 1".to_string(),
            ));
        }

        if self.peer.max_peers == 0 {
            return Err(Error::Config("peer.max_peers must be at least 1".to_string()));
        }

        // A caller must outlast the host's own queue deadline
        let queue_ms = self.queue.request_timeout_secs.saturating_mul(1000);
        if self.peer.request_timeout_ms <= queue_ms {
            return Err(Error::Config(format!(
                "peer.request_timeout_ms ({}) must exceed queue.request_timeout_secs ({}s)",
                self.peer.request_timeout_ms, self.queue.request_timeout_secs
            )));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::Config(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Configured peer id, or a fresh random one
    pub fn node_id(&self) -> String {
        self.node
            .id
            .clone()
            .unwrap_or_else(|| format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]))
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or(std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location for `config init`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".llmesh")
        .join("node.toml")
}

/// Write a commented default configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(&config_path, generate_default_config())?;

    info!(path = %config_path.display(), "Configuration file created");
    Ok(config_path)
}

fn generate_default_config() -> String {
    r#"# LLMesh Node Configuration

[node]
# Stable peer identifier (random per process if not set)
# id = "laptop-1"

# Bearer token issued by the relay
# auth_token = "..."

[signaling]
# Relay WebSocket URL
url = "wss://relay.llmesh.net/ws"

# Reconnect attempts before reporting an error status
max_reconnect_attempts = 5

# Backoff bounds in milliseconds
initial_reconnect_delay_ms = 1000
max_reconnect_delay_ms = 30000

# WebSocket ping interval in milliseconds
heartbeat_interval_ms = 25000

[ice]
stun_servers = ["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"]

# Relay credential endpoint (STUN only when unset)
# token_url = "https://relay.llmesh.net/turn-token"

# Refresh cached credentials after this fraction of their TTL
refresh_ratio = 0.8

[peer]
# Connection establishment timeout in seconds (probed when unset: 60/90/120)
# connect_timeout_secs = 90

# Liveness ping interval in milliseconds
ping_interval_ms = 15000

# Consecutive missed pongs before a peer is dropped (0 = never)
max_missed_pongs = 3

# Maximum simultaneous peer connections
max_peers = 32

# Dial hosting peers automatically
auto_connect = false

# Correlated request timeout in milliseconds (must exceed queue.request_timeout_secs)
request_timeout_ms = 600000

[queue]
# Requests per client per rolling window
rate_limit_requests = 10
rate_limit_window_secs = 60

# Execution deadline per request in seconds
request_timeout_secs = 300

[hosting]
# Share the local inference endpoint with the mesh
enabled = false

# Models to announce (empty = ask the endpoint)
models = []

[openai]
# API base URL (OpenAI, Ollama, vLLM, LM Studio, etc.)
base_url = "http://localhost:11434/v1"

# API key (leave empty for local servers like Ollama)
api_key = ""

default_model = "llama3"
timeout_secs = 120
max_retries = 2

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# file = "~/.llmesh/logs/node.log"
max_files = 5
json_format = false
"#
    .to_string()
}
