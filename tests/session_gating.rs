//! TLS session gating and end-to-end gateway tests
//!
//! A throwaway CA is minted with `rcgen` for every test; the gateway, a valid
//! operator and an impostor all get certificates signed by it.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use serial_tls_gateway::config::{GatewayConfig, ServerConfig};
use serial_tls_gateway::core::codec::{encode, DecodeResult, FrameAccumulator, FRAME_SIZE};
use serial_tls_gateway::core::packet::{CommandOpcode, Packet, PacketType, ResponseCode};
use serial_tls_gateway::protocol::message::GatewayMessage;
use serial_tls_gateway::service::{Gateway, OperatorClient};
use serial_tls_gateway::transport::session::{
    ConnectionHandler, ServerState, Session, SessionManager,
};
use serial_tls_gateway::transport::tls::{TlsClientConfig, TlsServerConfig};
use serial_tls_gateway::utils::Metrics;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const SERVER_NAME: &str = "localhost";
const OPERATOR: &str = "operator.local";

static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

/// Test CA plus the files it has issued
struct Pki {
    dir: PathBuf,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl Pki {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!(
            "serial-tls-gateway-{}-{}",
            std::process::id(),
            NEXT_DIR.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(&dir).unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "Gateway Test CA");
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert = params.self_signed(&ca_key).unwrap();
        fs::write(dir.join("ca.pem"), ca_cert.pem()).unwrap();

        Self {
            dir,
            ca_cert,
            ca_key,
        }
    }

    fn ca_path(&self) -> String {
        self.path("ca.pem")
    }

    fn path(&self, file: &str) -> String {
        self.dir.join(file).to_string_lossy().into_owned()
    }

    /// Issue a leaf for `name`; returns (cert path, key path)
    fn issue(&self, name: &str, usage: ExtendedKeyUsagePurpose) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![usage];
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();

        let cert_path = self.path(&format!("{name}.crt"));
        let key_path = self.path(&format!("{name}.key"));
        fs::write(&cert_path, cert.pem()).unwrap();
        fs::write(&key_path, key.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    fn server_tls(&self) -> TlsServerConfig {
        let (cert, key) = self.issue(SERVER_NAME, ExtendedKeyUsagePurpose::ServerAuth);
        TlsServerConfig::new(cert, key)
            .with_client_auth(self.ca_path())
            .with_expected_peer_name(OPERATOR)
    }

    fn client(&self, name: Option<&str>) -> TlsClientConfig {
        let config = TlsClientConfig::new(SERVER_NAME.to_string(), self.ca_path());
        match name {
            Some(name) => {
                let (cert, key) = self.issue(name, ExtendedKeyUsagePurpose::ClientAuth);
                config.with_client_certificate(cert, key)
            }
            None => config,
        }
    }
}

impl Drop for Pki {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

/// Records the identity of every session it is handed, acks, then waits for EOF
#[derive(Clone, Default)]
struct Recorder {
    identities: Arc<Mutex<Vec<Option<String>>>>,
}

impl Recorder {
    fn identities(&self) -> Vec<Option<String>> {
        self.identities.lock().unwrap().clone()
    }
}

impl ConnectionHandler for Recorder {
    fn handle(&self, session: Session) -> BoxFuture<'static, ()> {
        let identities = Arc::clone(&self.identities);
        Box::pin(async move {
            identities.lock().unwrap().push(session.peer_identity.clone());
            let mut stream = session.stream;
            let _ = stream.write_all(&[0, 0]).await;
            let _ = stream.flush().await;
            let mut buf = [0u8; 64];
            while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
        })
    }
}

fn loopback() -> ServerConfig {
    ServerConfig {
        address: "127.0.0.1:0".into(),
        handshake_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    }
}

async fn start(pki: &Pki) -> (Arc<SessionManager>, Recorder, String) {
    let recorder = Recorder::default();
    let manager = SessionManager::new(loopback(), pki.server_tls(), Arc::new(Metrics::new()));
    let addr = manager.start(recorder.clone()).await.unwrap();
    (manager, recorder, addr.to_string())
}

/// Connect and read one message; any failure along the way counts as refusal
async fn try_session(addr: &str, config: TlsClientConfig) -> Option<GatewayMessage> {
    let attempt = async {
        let mut client = OperatorClient::connect(addr, config).await.ok()?;
        client.next_message().await.ok()
    };
    tokio::time::timeout(Duration::from_secs(5), attempt)
        .await
        .ok()
        .flatten()
}

/// Server-side counters are bumped around socket teardown, so poll for them
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_valid_operator_is_served() {
    let pki = Pki::new();
    let (manager, recorder, addr) = start(&pki).await;
    assert_eq!(manager.state(), ServerState::Listening);

    let ack = try_session(&addr, pki.client(Some(OPERATOR))).await;
    assert_eq!(ack, Some(GatewayMessage::Ack { code: 0 }));
    assert_eq!(recorder.identities(), vec![Some(OPERATOR.to_string())]);

    manager.stop();
    manager.wait().await;
}

#[tokio::test]
async fn test_wrong_name_is_refused_and_listener_survives() {
    let pki = Pki::new();
    let (manager, recorder, addr) = start(&pki).await;

    assert_eq!(try_session(&addr, pki.client(Some("intruder.local"))).await, None);
    assert!(eventually(|| manager.metrics().snapshot().verification_failed == 1).await);
    assert!(recorder.identities().is_empty());

    let ack = try_session(&addr, pki.client(Some(OPERATOR))).await;
    assert_eq!(ack, Some(GatewayMessage::Ack { code: 0 }));
    assert_eq!(recorder.identities(), vec![Some(OPERATOR.to_string())]);

    manager.stop();
    manager.wait().await;
}

#[tokio::test]
async fn test_missing_client_certificate_is_refused() {
    let pki = Pki::new();
    let (manager, recorder, addr) = start(&pki).await;

    assert_eq!(try_session(&addr, pki.client(None)).await, None);
    assert!(recorder.identities().is_empty());
    assert!(eventually(|| manager.metrics().snapshot().handshakes_failed == 1).await);

    let ack = try_session(&addr, pki.client(Some(OPERATOR))).await;
    assert_eq!(ack, Some(GatewayMessage::Ack { code: 0 }));

    manager.stop();
    manager.wait().await;
}

#[tokio::test]
async fn test_pending_handshakes_count_against_connection_limit() {
    let pki = Pki::new();
    let recorder = Recorder::default();
    let server = ServerConfig {
        max_connections: 1,
        ..loopback()
    };
    let manager = SessionManager::new(server, pki.server_tls(), Arc::new(Metrics::new()));
    let addr = manager.start(recorder.clone()).await.unwrap().to_string();

    // connects but never starts the handshake
    let silent = tokio::net::TcpStream::connect(&addr).await.unwrap();
    assert!(eventually(|| manager.open_connections() == 1).await);
    assert_eq!(manager.active_sessions(), 0);

    assert_eq!(try_session(&addr, pki.client(Some(OPERATOR))).await, None);
    assert!(eventually(|| manager.metrics().snapshot().connections_refused == 1).await);
    assert!(recorder.identities().is_empty());

    drop(silent);
    assert!(eventually(|| manager.open_connections() == 0).await);
    let ack = try_session(&addr, pki.client(Some(OPERATOR))).await;
    assert_eq!(ack, Some(GatewayMessage::Ack { code: 0 }));

    manager.stop();
    manager.wait().await;
}

#[tokio::test]
async fn test_stop_is_idempotent_and_closes_listener() {
    let pki = Pki::new();
    let (manager, _recorder, addr) = start(&pki).await;
    assert!(manager.is_running());

    manager.stop();
    manager.stop();
    assert!(!manager.is_running());
    tokio::time::timeout(Duration::from_secs(5), manager.wait())
        .await
        .expect("manager did not stop");
    manager.stop();

    assert_eq!(manager.state(), ServerState::Stopped);
    assert!(tokio::net::TcpStream::connect(&addr).await.is_err());
}

#[tokio::test]
async fn test_startup_fails_without_key_material() {
    let manager = SessionManager::new(
        loopback(),
        TlsServerConfig::new("/nonexistent/gw.crt", "/nonexistent/gw.key"),
        Arc::new(Metrics::new()),
    );
    assert!(manager.start(Recorder::default()).await.is_err());
    assert_eq!(manager.state(), ServerState::Idle);
}

async fn read_controller_packet(controller: &mut DuplexStream) -> Packet {
    let mut frame = [0u8; FRAME_SIZE];
    tokio::time::timeout(Duration::from_secs(5), controller.read_exact(&mut frame))
        .await
        .expect("controller read timed out")
        .unwrap();
    match FrameAccumulator::new().decode_incremental(&frame) {
        DecodeResult::Complete { packet, .. } => packet,
        other => panic!("expected a packet, got {other:?}"),
    }
}

#[tokio::test]
async fn test_gateway_relays_end_to_end() {
    let pki = Pki::new();
    let (cert, key) = pki.issue(SERVER_NAME, ExtendedKeyUsagePurpose::ServerAuth);

    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let addr = format!("127.0.0.1:{port}");

    let mut config = GatewayConfig::default();
    config.server = ServerConfig {
        address: addr.clone(),
        ..loopback()
    };
    config.tls.cert_path = cert;
    config.tls.key_path = key;
    config.tls.ca_path = Some(pki.ca_path());
    config.tls.expected_peer_name = Some(OPERATOR.into());

    let (gateway_side, mut controller) = tokio::io::duplex(8192);
    let (serial_reader, serial_writer) = tokio::io::split(gateway_side);
    let gateway = tokio::spawn(Gateway::new(config).run_with_serial(serial_reader, serial_writer));

    // hello goes out only once the listener is up
    let hello = read_controller_packet(&mut controller).await;
    assert_eq!(hello.packet_type, PacketType::Hello);

    let mut client = OperatorClient::connect(&addr, pki.client(Some(OPERATOR)))
        .await
        .unwrap();
    client.send_command('w', [10, 20]).await.unwrap();

    let command = read_controller_packet(&mut controller).await;
    assert_eq!(command.packet_type, PacketType::Command);
    assert_eq!(command.command, CommandOpcode::Forward.opcode());
    assert_eq!(command.params, [10, 20]);

    controller
        .write_all(&encode(&Packet::response(ResponseCode::Status, [42, 7])))
        .await
        .unwrap();
    let status = tokio::time::timeout(Duration::from_secs(5), client.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, GatewayMessage::Status { params: [42, 7] });

    // losing the serial link stops the gateway
    drop(controller);
    tokio::time::timeout(Duration::from_secs(10), gateway)
        .await
        .expect("gateway did not stop")
        .unwrap()
        .unwrap();
}
