//! # Transport Layer
//!
//! The two physical links the gateway bridges.
//!
//! ## Components
//! - **TLS**: certificate loading, mutual authentication and peer identity checks
//! - **Session**: listener, handshake gating and session lifecycle
//! - **Serial**: controller port discovery and splitting

pub mod serial;
pub mod session;
pub mod tls;
