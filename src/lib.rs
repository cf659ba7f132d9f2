//! # Serial TLS Gateway
//!
//! Bridges a mutually authenticated TLS connection to an embedded controller
//! on a serial link.
//!
//! Operators send short tagged commands over TLS; the gateway maps them to
//! fixed-size, checksum-protected packets on the serial line and relays the
//! controller's responses, telemetry and text back to the connected operator.
//!
//! ## Layout
//! - [`core`]: serial packet model and frame codec
//! - [`protocol`]: network messages and the relay dispatcher
//! - [`transport`]: TLS, session lifecycle and the serial port
//! - [`service`]: gateway wiring and the operator client
//! - [`config`], [`error`], [`utils`]: ambient concerns

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use error::{GatewayError, Result};
