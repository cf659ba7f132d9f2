//! # Services
//!
//! Top-level wiring of the gateway and the operator-side client.

pub mod client;
pub mod gateway;

pub use client::OperatorClient;
pub use gateway::Gateway;
