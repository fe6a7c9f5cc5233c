//! Error types for the wgbridge tunnel adapter

use thiserror::Error;

/// Main error type for wgbridge
#[derive(Error, Debug)]
pub enum WgBridgeError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Adapter lifecycle errors
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Tunnel device errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// UDP transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Adapter lifecycle errors, returned by start/update/block
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("No peer with a usable endpoint")]
    NoPeers,

    #[error("Engine initialization failed")]
    Initialization,

    #[error("Network settings rejected: {reason}")]
    NetworkSettings { reason: String },

    #[error("Network settings not acknowledged within {seconds}s")]
    NetworkSettingsTimeout { seconds: u64 },

    /// A datagram had no session to carry it. Never surfaced; the drop is
    /// logged and WireGuard's own timers recover.
    #[error("No open socket for destination")]
    NoOpenSocket,

    #[error("Adapter is shut down")]
    ShutDown,
}

/// Tunnel device errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to create TUN device: {reason}")]
    CreateFailed { reason: String },

    #[error("TUN read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("TUN write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("Route setup failed for {network}: {reason}")]
    RouteSetupFailed { network: String, reason: String },

    #[error("Insufficient privileges: {message}")]
    InsufficientPrivileges { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// UDP transport session errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Session cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WgBridgeError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Tunnel(TunnelError::InsufficientPrivileges { .. }) => 2,
            Self::Transport(_) => 3,
            Self::Adapter(_) => 4,
            Self::Tunnel(_) => 6,
            Self::System(_) => 7,
        }
    }
}

/// Result type alias for wgbridge operations
pub type Result<T> = std::result::Result<T, WgBridgeError>;
