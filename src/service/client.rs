use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

use crate::core::packet::PARAM_COUNT;
use crate::error::{GatewayError, Result};
use crate::protocol::message::{GatewayMessage, OperatorCodec, OperatorCommand};
use crate::transport::tls::TlsClientConfig;

/// TLS client for driving the gateway as an operator
///
/// Presents a client certificate when one is configured, which the gateway
/// requires when mutual authentication is on.
pub struct OperatorClient {
    framed: Framed<TlsStream<TcpStream>, OperatorCodec>,
}

impl OperatorClient {
    /// Connect to a gateway
    #[instrument(skip(config))]
    pub async fn connect(addr: &str, config: TlsClientConfig) -> Result<Self> {
        let tls_config = config.load_client_config()?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));

        let stream = TcpStream::connect(addr).await?;
        let domain = config.server_name()?;

        let tls_stream = connector.connect(domain, stream).await?;
        debug!("Connected to gateway");

        Ok(Self {
            framed: Framed::new(tls_stream, OperatorCodec),
        })
    }

    /// Send a command key (`w`, `s`, `a`, `d`, `p`, `c`, `g`, `t`) with its parameters
    ///
    /// The key is not validated locally; the gateway ignores keys it does not know.
    pub async fn send_command(&mut self, key: char, params: [u32; PARAM_COUNT]) -> Result<()> {
        let key = u8::try_from(key).map_err(|_| GatewayError::UnknownCommand(key))?;
        self.send(OperatorCommand::new(key, params)).await
    }

    pub async fn send(&mut self, command: OperatorCommand) -> Result<()> {
        self.framed.send(command).await
    }

    /// Receive the next message relayed from the controller
    pub async fn next_message(&mut self) -> Result<GatewayMessage> {
        match self.framed.next().await {
            Some(result) => result,
            None => Err(GatewayError::ConnectionClosed),
        }
    }

    /// Send a command and wait for the next relayed message
    pub async fn request(&mut self, key: char, params: [u32; PARAM_COUNT]) -> Result<GatewayMessage> {
        self.send_command(key, params).await?;
        self.next_message().await
    }

    /// Close the TLS session
    pub async fn close(mut self) -> Result<()> {
        SinkExt::<OperatorCommand>::close(&mut self.framed).await
    }
}
