//! # Network Protocol
//!
//! Operator-facing messages and the relay that connects them to the serial
//! controller.
//!
//! ## Components
//! - **Message**: tagged network messages and their Tokio codecs
//! - **Dispatcher**: command mapping and serial-to-network relay

pub mod dispatcher;
pub mod message;

pub use dispatcher::{Forward, RelayDispatcher, RelayHandler, SessionHandle};
pub use message::{GatewayCodec, GatewayMessage, InboundFrame, OperatorCodec, OperatorCommand};
