//! Serial link to the embedded controller
//!
//! Opens the configured device (falling back to the secondary path) and
//! splits it into independent read and write halves so the drain task and the
//! relay can use it concurrently.

use tokio::io::{ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{info, instrument, warn};

use crate::config::SerialConfig;
use crate::error::{GatewayError, Result};

pub type SerialReader = ReadHalf<SerialStream>;
pub type SerialWriter = WriteHalf<SerialStream>;

/// Open a single device at `baud`
pub fn open_port(path: &str, baud: u32) -> Result<SerialStream> {
    tokio_serial::new(path, baud)
        .open_native_async()
        .map_err(|e| GatewayError::Serial(format!("Failed to open {path}: {e}")))
}

/// Open the primary port, or the fallback if the primary is unavailable
///
/// Returns the path that was actually opened alongside the stream.
#[instrument(skip(config), fields(port = %config.port, baud = config.baud_rate))]
pub fn open(config: &SerialConfig) -> Result<(String, SerialStream)> {
    match open_port(&config.port, config.baud_rate) {
        Ok(stream) => {
            info!("Serial port opened");
            Ok((config.port.clone(), stream))
        }
        Err(primary) => {
            let Some(fallback) = config.fallback_port.as_deref() else {
                return Err(primary);
            };
            warn!(error = %primary, fallback, "Primary serial port unavailable; trying fallback");
            let stream = open_port(fallback, config.baud_rate)?;
            info!(fallback, "Serial port opened");
            Ok((fallback.to_owned(), stream))
        }
    }
}

/// Split an opened port into reader and writer halves
pub fn split(stream: SerialStream) -> (SerialReader, SerialWriter) {
    tokio::io::split(stream)
}
