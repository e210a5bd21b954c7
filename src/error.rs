//! Error types for the LLMesh node
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Machine-readable queue rejection codes
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    IceFailure = 302,
    SignalingDrop = 303,
    CredentialFetch = 304,

    // Protocol errors (4xx)
    ProtocolMalformed = 401,
    ProtocolUnexpected = 402,
    AuthenticationFailed = 403,

    // Queue / execution errors (5xx)
    ExecutionFailed = 500,
    QueueTimeout = 501,
    Cancelled = 502,
    RateLimited = 503,
    QueueCleared = 504,

    // Peer transport errors (6xx)
    TransportSend = 600,
    RequestTimeout = 601,
    RemoteError = 602,
    PeerLimit = 603,

    // Internal errors (9xx)
    InternalError = 900,
    NotSupported = 902,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            600..=699 => 60,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a peer connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionFailure {
    /// Establishment did not finish within the timeout profile
    Timeout,
    /// The transport reported a NAT traversal / ICE failure
    IceFailure,
    /// The relay went away while the attempt depended on it
    SignalingDrop,
}

impl fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionFailure::Timeout => "timeout",
            ConnectionFailure::IceFailure => "ice-failure",
            ConnectionFailure::SignalingDrop => "signaling-drop",
        };
        f.write_str(s)
    }
}

/// Machine-readable rejection code delivered to queue callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectCode {
    RateLimited,
    Timeout,
    Cancelled,
    QueueCleared,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::RateLimited => "RATE_LIMITED",
            RejectCode::Timeout => "TIMEOUT",
            RejectCode::Cancelled => "CANCELLED",
            RejectCode::QueueCleared => "QUEUE_CLEARED",
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the node
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO / Serialization
    // ─────────────────────────────────────────────────────────────

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // ─────────────────────────────────────────────────────────────
    // Relay / Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Relay rejected our credentials
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// Peer connection attempt failed
    #[error("Connection to peer {peer_id} failed: {kind}")]
    ConnectionFailed {
        peer_id: String,
        kind: ConnectionFailure,
    },

    /// Relay connection timed out
    #[error("Connection to {url} timed out after {timeout_secs}s")]
    ConnectionTimeout { url: String, timeout_secs: u64 },

    /// Generic relay connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Relay credential endpoint unreachable or returned no servers
    #[error("Relay credential fetch failed: {message}")]
    CredentialFetch { message: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Malformed message
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// Generic protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    // ─────────────────────────────────────────────────────────────
    // Queue Errors
    // ─────────────────────────────────────────────────────────────

    /// Client exceeded its request allowance
    #[error("Client {client_id} is rate limited")]
    RateLimited { client_id: String },

    /// Request exceeded its execution deadline
    #[error("Request {request_id} timed out after {timeout_secs}s")]
    QueueTimeout { request_id: String, timeout_secs: u64 },

    /// Request was cancelled before execution
    #[error("Request {request_id} was cancelled")]
    Cancelled { request_id: String },

    /// Queue was cleared while the request waited
    #[error("Request {request_id} dropped: queue cleared")]
    QueueCleared { request_id: String },

    /// Handler failed
    #[error("Execution failed: {0}")]
    Execution(String),

    // ─────────────────────────────────────────────────────────────
    // Peer Transport Errors
    // ─────────────────────────────────────────────────────────────

    /// Send attempted on a peer that is not connected
    #[error("Cannot send to peer {peer_id}: {message}")]
    TransportSend { peer_id: String, message: String },

    /// No response arrived for a correlated request
    #[error("Request {request_id} to peer {peer_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        peer_id: String,
        request_id: String,
        timeout_ms: u64,
    },

    /// Remote peer answered with an error envelope
    #[error("Peer {peer_id} returned an error: {message}")]
    RemoteError { peer_id: String, message: String },

    /// Connection cap reached
    #[error("Peer limit reached ({max_peers})")]
    PeerLimit { max_peers: usize },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Feature not supported
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::ProtocolMalformed,
            Error::WebSocket(_) => ErrorCode::ConnectionFailed,
            Error::Http(_) => ErrorCode::ConnectionFailed,

            Error::AuthenticationFailed { .. } => ErrorCode::AuthenticationFailed,
            Error::ConnectionFailed { kind, .. } => match kind {
                ConnectionFailure::Timeout => ErrorCode::ConnectionTimeout,
                ConnectionFailure::IceFailure => ErrorCode::IceFailure,
                ConnectionFailure::SignalingDrop => ErrorCode::SignalingDrop,
            },
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::Connection(_) => ErrorCode::ConnectionFailed,
            Error::CredentialFetch { .. } => ErrorCode::CredentialFetch,

            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::Protocol(_) => ErrorCode::ProtocolUnexpected,

            Error::RateLimited { .. } => ErrorCode::RateLimited,
            Error::QueueTimeout { .. } => ErrorCode::QueueTimeout,
            Error::Cancelled { .. } => ErrorCode::Cancelled,
            Error::QueueCleared { .. } => ErrorCode::QueueCleared,
            Error::Execution(_) => ErrorCode::ExecutionFailed,

            Error::TransportSend { .. } => ErrorCode::TransportSend,
            Error::RequestTimeout { .. } => ErrorCode::RequestTimeout,
            Error::RemoteError { .. } => ErrorCode::RemoteError,
            Error::PeerLimit { .. } => ErrorCode::PeerLimit,

            Error::NotSupported(_) => ErrorCode::NotSupported,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Queue rejection code, if this error is one
    pub fn reject_code(&self) -> Option<RejectCode> {
        match self {
            Error::RateLimited { .. } => Some(RejectCode::RateLimited),
            Error::QueueTimeout { .. } => Some(RejectCode::Timeout),
            Error::Cancelled { .. } => Some(RejectCode::Cancelled),
            Error::QueueCleared { .. } => Some(RejectCode::QueueCleared),
            _ => None,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::Connection(_)
                | Error::WebSocket(_)
                | Error::Http(_)
                | Error::CredentialFetch { .. }
                | Error::RequestTimeout { .. }
                | Error::RateLimited { .. }
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (node should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::Config(_)
                | Error::AuthenticationFailed { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'llmesh-node config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'llmesh-node config validate' to see details."
            ),
            Error::AuthenticationFailed { .. } => Some(
                "Verify the node auth token. The relay may have revoked it."
            ),
            Error::ConnectionTimeout { .. } => Some(
                "The signaling relay may be down or unreachable. Check your firewall settings."
            ),
            Error::ConnectionFailed { kind: ConnectionFailure::IceFailure, .. } => Some(
                "Direct connectivity failed. Configure a relay credential endpoint under [ice]."
            ),
            Error::ConnectionFailed { .. } => Some(
                "The peer did not complete the handshake. It may be offline or behind a strict NAT."
            ),
            Error::CredentialFetch { .. } => Some(
                "Check [ice] token_url. Connections continue with STUN only."
            ),
            Error::RateLimited { .. } => Some(
                "Too many requests in the current window. Wait and try again."
            ),
            Error::TransportSend { .. } => Some(
                "Connect to the peer first, or check that it is still online."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    /// Create a config parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a peer connection failure
    pub fn connection_failed(peer_id: impl Into<String>, kind: ConnectionFailure) -> Self {
        Error::ConnectionFailed {
            peer_id: peer_id.into(),
            kind,
        }
    }

    /// Create a transport send error
    pub fn transport_send(peer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::TransportSend {
            peer_id: peer_id.into(),
            message: message.into(),
        }
    }

    /// Create a credential fetch error
    pub fn credential_fetch(message: impl Into<String>) -> Self {
        Error::CredentialFetch {
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
