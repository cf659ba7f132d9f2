//! # Core Serial Components
//!
//! Packet definition and the frame codec for the serial controller link.
//!
//! ## Components
//! - **Packet**: fixed-size typed packet exchanged with the controller
//! - **Codec**: incremental frame decoder and Tokio codec for byte streams
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Body(44)] [Checksum(1)]
//! ```
//!
//! ## Integrity
//! - Magic bytes locate frame boundaries and drive resynchronization
//! - XOR checksum catches every single-byte corruption of the body
//! - Frame length is constant, so no length field can be corrupted

pub mod codec;
pub mod packet;
