//! # TLS Transport Layer
//!
//! Certificate loading and peer verification for the operator-facing side of
//! the gateway.
//!
//! ## Responsibilities
//! - Load the gateway certificate chain and private key
//! - Require operator certificates signed by a trusted CA (mutual TLS)
//! - Check the operator certificate against an expected identity
//! - Build client configurations for operator tooling and tests

use std::fs;
use std::sync::Arc;

use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use tracing::{debug, warn};
use x509_parser::extensions::GeneralName;

use crate::config::TlsConfig;
use crate::error::constants::{
    ERR_NO_CERTIFICATES, ERR_NO_PEER_CERT, ERR_NO_PRIVATE_KEY, ERR_PEER_CERT_UNPARSEABLE,
    ERR_PEER_NAME_MISMATCH,
};
use crate::error::{GatewayError, Result};

fn read_pem(path: &str, what: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| GatewayError::Tls(format!("Failed to open {what} file {path}: {e}")))
}

/// Load every certificate in a PEM file
pub fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let pem = read_pem(path, "certificate")?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .map_err(|_| GatewayError::Tls(format!("Failed to parse certificate {path}")))?;

    if certs.is_empty() {
        return Err(GatewayError::Tls(format!("{ERR_NO_CERTIFICATES} in {path}")));
    }

    Ok(certs.into_iter().map(Certificate).collect())
}

/// Load the first PKCS#8 or RSA private key in a PEM file
pub fn load_private_key(path: &str) -> Result<PrivateKey> {
    let pem = read_pem(path, "key")?;

    let pkcs8 = rustls_pemfile::pkcs8_private_keys(&mut pem.as_slice())
        .map_err(|_| GatewayError::Tls(format!("Failed to parse private key {path}")))?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    let rsa = rustls_pemfile::rsa_private_keys(&mut pem.as_slice())
        .map_err(|_| GatewayError::Tls(format!("Failed to parse private key {path}")))?;
    rsa.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| GatewayError::Tls(format!("{ERR_NO_PRIVATE_KEY} in {path}")))
}

/// Build a root store from a PEM CA bundle
pub fn load_root_store(path: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(&cert)
            .map_err(|e| GatewayError::Tls(format!("Failed to add CA cert from {path}: {e}")))?;
    }
    Ok(roots)
}

/// TLS server configuration
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    cert_path: String,
    key_path: String,
    /// CA bundle used to verify operator certificates
    client_ca_path: Option<String>,
    /// Whether to require client certificates (mTLS)
    require_client_auth: bool,
    /// Identity the operator certificate must carry
    expected_peer_name: Option<String>,
}

impl TlsServerConfig {
    /// Create a new TLS server configuration without client authentication
    pub fn new<P: AsRef<std::path::Path>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_string_lossy().to_string(),
            key_path: key_path.as_ref().to_string_lossy().to_string(),
            client_ca_path: None,
            require_client_auth: false,
            expected_peer_name: None,
        }
    }

    /// Build from the `[tls]` configuration section
    pub fn from_config(config: &TlsConfig) -> Self {
        let mut tls = Self::new(config.cert_path.as_str(), config.key_path.as_str());
        if config.verify_peer {
            if let Some(ca) = &config.ca_path {
                tls = tls.with_client_auth(ca.clone());
            }
            tls.require_client_auth = true;
            tls.expected_peer_name = config.expected_peer_name.clone();
        }
        tls
    }

    /// Enable mutual TLS authentication by providing a CA certificate path
    pub fn with_client_auth<S: Into<String>>(mut self, client_ca_path: S) -> Self {
        self.client_ca_path = Some(client_ca_path.into());
        self.require_client_auth = true;
        self
    }

    /// Require the operator certificate to carry this name
    pub fn with_expected_peer_name<S: Into<String>>(mut self, name: S) -> Self {
        self.expected_peer_name = Some(name.into());
        self
    }

    pub fn requires_client_auth(&self) -> bool {
        self.require_client_auth
    }

    pub fn expected_peer_name(&self) -> Option<&str> {
        self.expected_peer_name.as_deref()
    }

    /// Load the TLS configuration from files
    pub fn load_server_config(&self) -> Result<ServerConfig> {
        if self.require_client_auth && self.expected_peer_name.is_none() {
            return Err(GatewayError::Tls(
                "Client authentication requires an expected peer name".into(),
            ));
        }

        let cert_chain = load_certs(&self.cert_path)?;
        let private_key = load_private_key(&self.key_path)?;

        let builder = ServerConfig::builder().with_safe_defaults();

        let config = if self.require_client_auth {
            let ca_path = self.client_ca_path.as_deref().ok_or_else(|| {
                GatewayError::Tls("Client authentication requires a CA bundle".into())
            })?;
            let roots = load_root_store(ca_path)?;
            let verifier = AllowAnyAuthenticatedClient::new(roots).boxed();
            debug!("mTLS enabled with client certificate verification required");
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(cert_chain, private_key)
        } else {
            warn!("Client certificate verification is disabled");
            builder
                .with_no_client_auth()
                .with_single_cert(cert_chain, private_key)
        };

        config.map_err(|e| GatewayError::Tls(format!("TLS error: {e}")))
    }
}

/// Names carried by a peer certificate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerCertificateNames {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
}

impl PeerCertificateNames {
    /// Extract the subject common name and DNS subject-alt-names
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| GatewayError::PeerVerification(format!("{ERR_PEER_CERT_UNPARSEABLE}: {e}")))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_owned);

        let mut dns_names = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    dns_names.push((*dns).to_owned());
                }
            }
        }

        Ok(Self {
            common_name,
            dns_names,
        })
    }

    /// Case-insensitive match against the CN or any DNS name
    pub fn matches(&self, expected: &str) -> bool {
        self.common_name
            .iter()
            .chain(self.dns_names.iter())
            .any(|name| name.eq_ignore_ascii_case(expected))
    }

    /// Name used to identify the peer in logs
    pub fn display_name(&self) -> Option<&str> {
        self.common_name
            .as_deref()
            .or_else(|| self.dns_names.first().map(String::as_str))
    }
}

/// Check a handshaken peer's leaf certificate
///
/// Returns the peer identity to record on the session. `peer_certs` is what
/// rustls reports for the connection; the chain itself has already been
/// validated against the CA bundle during the handshake.
pub fn verify_peer(peer_certs: Option<&[Certificate]>, expected: Option<&str>) -> Result<String> {
    let leaf = peer_certs
        .and_then(|certs| certs.first())
        .ok_or_else(|| GatewayError::PeerVerification(ERR_NO_PEER_CERT.into()))?;

    let names = PeerCertificateNames::from_der(&leaf.0)?;

    if let Some(expected) = expected {
        if !names.matches(expected) {
            return Err(GatewayError::PeerVerification(format!(
                "{ERR_PEER_NAME_MISMATCH}: expected {expected}, got {:?}",
                names.display_name()
            )));
        }
        return Ok(expected.to_owned());
    }

    Ok(names.display_name().unwrap_or("<unnamed>").to_owned())
}

/// TLS client configuration for operator tooling
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    server_name: String,
    /// CA bundle used to verify the gateway certificate
    ca_path: String,
    /// Optional client certificate path for mTLS
    client_cert_path: Option<String>,
    /// Optional client key path for mTLS
    client_key_path: Option<String>,
}

impl TlsClientConfig {
    pub fn new<S: Into<String>>(server_name: S, ca_path: S) -> Self {
        Self {
            server_name: server_name.into(),
            ca_path: ca_path.into(),
            client_cert_path: None,
            client_key_path: None,
        }
    }

    /// Configure client authentication for mTLS
    pub fn with_client_certificate<S: Into<String>>(mut self, cert_path: S, key_path: S) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    /// Load the TLS client configuration
    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let roots = load_root_store(&self.ca_path)?;
        let builder = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots);

        match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let chain = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                builder.with_client_auth_cert(chain, key).map_err(|e| {
                    GatewayError::Tls(format!("Failed to set client certificate: {e}"))
                })
            }
            _ => Ok(builder.with_no_client_auth()),
        }
    }

    /// Get the server name as a rustls::ServerName
    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| GatewayError::Tls("Invalid server name".into()))
    }
}

/// Shared acceptor for the session manager
pub fn acceptor(config: &TlsServerConfig) -> Result<tokio_rustls::TlsAcceptor> {
    let server_config = config.load_server_config()?;
    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_config)))
}
