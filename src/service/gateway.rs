//! Gateway wiring
//!
//! Startup order follows what the controller needs: open the serial port, give
//! the controller time to reboot, start draining the link, start the TLS
//! listener, then greet the controller. The gateway runs until a shutdown
//! signal arrives or the serial link goes away.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::protocol::dispatcher::{RelayDispatcher, RelayHandler};
use crate::transport::serial;
use crate::transport::session::SessionManager;
use crate::transport::tls::TlsServerConfig;
use crate::utils::metrics::Metrics;

pub struct Gateway {
    config: GatewayConfig,
    metrics: Arc<Metrics>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Open the configured serial port and run until shutdown
    pub async fn run(self) -> Result<()> {
        let (port, stream) = serial::open(&self.config.serial)?;
        info!(
            port = %port,
            delay_ms = self.config.serial.boot_delay.as_millis() as u64,
            "Waiting for controller to reboot"
        );
        tokio::time::sleep(self.config.serial.boot_delay).await;

        let (reader, writer) = serial::split(stream);
        self.run_with_serial(reader, writer).await
    }

    /// Run over an already opened serial link
    pub async fn run_with_serial<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let relay = Arc::new(
            RelayDispatcher::new(writer, Arc::clone(&self.metrics))
                .with_write_timeout(self.config.server.write_timeout),
        );
        let mut drain = tokio::spawn(Arc::clone(&relay).serial_drain(reader));
        info!("Serial listener started");

        let manager = SessionManager::new(
            self.config.server.clone(),
            TlsServerConfig::from_config(&self.config.tls),
            Arc::clone(&self.metrics),
        );
        if let Err(e) = manager.start(RelayHandler::new(Arc::clone(&relay))).await {
            drain.abort();
            return Err(e);
        }

        if let Err(e) = relay.send_hello().await {
            manager.stop();
            manager.wait().await;
            drain.abort();
            return Err(e);
        }

        let signals = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.wait_for_shutdown_signal().await })
        };

        tokio::select! {
            _ = manager.wait() => {}
            drained = &mut drain => {
                match drained {
                    Ok(Ok(())) => warn!("Serial link closed; stopping gateway"),
                    Ok(Err(e)) => error!(error = %e, "Serial link failed; stopping gateway"),
                    Err(e) => error!(error = %e, "Serial task aborted; stopping gateway"),
                }
            }
        }

        manager.stop();
        manager.wait().await;
        signals.abort();
        drain.abort();

        info!("Gateway stopped");
        Ok(())
    }
}
