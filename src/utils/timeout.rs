//! Timeout constants and async timeout helpers

use std::future::Future;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Upper bound for a TLS handshake before the connection is dropped
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time active sessions are given to finish after shutdown is requested
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest a relay write may wait on a slow operator before the session is dropped
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the draining accept task re-checks the active session count
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time the controller needs to reboot after the serial port is opened
pub const CONTROLLER_BOOT_DELAY: Duration = Duration::from_secs(3);

/// Run `fut`, mapping an elapsed deadline to [`GatewayError::Timeout`]
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn elapsed_deadline_maps_to_timeout() {
        let result: Result<()> = with_timeout_error(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(GatewayError::Timeout)));
    }

    #[tokio::test]
    async fn inner_result_is_passed_through() {
        let result = with_timeout_error(async { Ok(7u8) }, Duration::from_secs(1)).await;
        assert_eq!(result.ok(), Some(7));
    }
}
