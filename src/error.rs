//! # Error Types
//!
//! Error handling for the gateway.
//!
//! This module defines every error variant that can surface while bridging the
//! TLS side and the serial side, from low-level I/O failures to peer
//! verification failures.
//!
//! ## Error Categories
//! - **I/O Errors**: socket and serial port failures
//! - **TLS Errors**: certificate loading, handshake and peer verification
//! - **Decode Errors**: truncated network messages
//! - **Dispatch Errors**: unrecognised operator command codes
//! - **Configuration Errors**: invalid or unreadable configuration
//!
//! Framing problems on the serial link (bad magic, bad checksum) are *not*
//! errors: the codec recovers from them locally and reports them as
//! [`crate::core::codec::DecodeResult`] variants.
//!
//! ## Example Usage
//! ```rust
//! use serial_tls_gateway::error::{GatewayError, Result};
//! use std::fs::File;
//! use std::io::Read;
//!
//! fn read_file(path: &str) -> Result<String> {
//!     let mut file = File::open(path).map_err(GatewayError::Io)?;
//!     let mut contents = String::new();
//!     file.read_to_string(&mut contents)?;
//!     Ok(contents)
//! }
//!
//! assert!(read_file("/definitely/not/here.toml").is_err());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_SESSION_SLOT_POISONED: &str = "Failed to acquire current session slot";

    /// Certificate errors
    pub const ERR_NO_PEER_CERT: &str = "Peer presented no certificate";
    pub const ERR_PEER_CERT_UNPARSEABLE: &str = "Peer certificate could not be parsed";
    pub const ERR_PEER_NAME_MISMATCH: &str = "Peer certificate name does not match";
    pub const ERR_NO_PRIVATE_KEY: &str = "No private keys found";
    pub const ERR_NO_CERTIFICATES: &str = "No certificates found";
}

/// GatewayError is the primary error type for all gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Peer verification failed: {0}")]
    PeerVerification(String),

    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    #[error("Serial error: {0}")]
    Serial(String),

    #[error("Message truncated: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Unexpected message tag: {0}")]
    UnexpectedTag(u8),

    #[error("Unrecognised command code: {0:?}")]
    UnknownCommand(char),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Type alias for Results using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;
