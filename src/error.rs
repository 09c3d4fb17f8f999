//! WolfRelay Error Types

use thiserror::Error;

/// Result type alias for WolfRelay operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfRelay error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Buffer errors
    #[error("Buffer error: {0}")]
    Buffer(String),

    // DCB errors
    #[error("DCB error: {0}")]
    Dcb(String),

    #[error("DCB {uid} is closed")]
    DcbClosed { uid: u64 },

    // TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    // Server errors
    #[error("Server error: {0}")]
    Server(String),

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    // Monitor errors
    #[error("Monitor error: {0}")]
    Monitor(String),

    #[error("Server '{server}' is already monitored by '{owner}'")]
    ServerClaimed { server: String, owner: String },

    #[error("Cannot modify server status: {0}")]
    StatusChangeDenied(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("MySQL error {code}: {message}")]
    MySql { code: u16, message: String },

    // Binlog errors
    #[error("Binlog error: {0}")]
    Binlog(String),

    #[error("Binlog event corrupted at {file}:{pos}: {reason}")]
    BinlogCorrupted { file: String, pos: u64, reason: String },

    #[error("Binlog checksum mismatch at {file}:{pos}")]
    ChecksumMismatch { file: String, pos: u64 },

    #[error("GTID {0} not found in the GTID index")]
    GtidNotFound(String),

    #[error("GTID index error: {0}")]
    GtidStore(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    // Replication errors
    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Master connection lost: {0}")]
    MasterLost(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_) | Error::Network(_) | Error::MasterLost(_)
        )
    }

    /// Check if this error should tear down the master connection
    pub fn is_fatal_to_master(&self) -> bool {
        matches!(
            self,
            Error::ChecksumMismatch { .. }
                | Error::BinlogCorrupted { .. }
                | Error::MalformedPacket(_)
        )
    }
}
