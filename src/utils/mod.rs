//! # Utility Modules
//!
//! Supporting utilities for logging, metrics and timeouts.
//!
//! ## Components
//! - **Logging**: structured logging configuration
//! - **Metrics**: thread-safe observability counters
//! - **Timeout**: timeout constants and async timeout wrappers

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
