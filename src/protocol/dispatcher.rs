//! # Relay Dispatcher
//!
//! Translates between operator commands arriving over TLS and packets on the
//! serial link.
//!
//! - **Network to serial**: command keys map to opcodes through a fixed,
//!   case-insensitive table and are written to the controller as `Command`
//!   packets. Unknown keys are reported and nothing is sent.
//! - **Serial to network**: `Response`, `Error` and `Message` packets are
//!   reshaped into gateway messages and written to the current session.
//!
//! Outbound relay has a single target. The most recently attached session
//! becomes current and displaces the previous one; once it detaches there is
//! no target until another session attaches, and serial traffic is dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::core::codec::{SerialCodec, SerialEvent};
use crate::core::packet::{CommandOpcode, Packet, PacketType, ResponseCode};
use crate::error::constants::ERR_SESSION_SLOT_POISONED;
use crate::error::{GatewayError, Result};
use crate::protocol::message::{GatewayCodec, GatewayMessage, InboundFrame, OperatorCommand};
use crate::transport::session::{shutdown_requested, ConnectionHandler, Session};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{with_timeout_error, WRITE_TIMEOUT};

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Outcome of relaying one serial packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    /// Written to the current session
    Sent,
    /// Forwardable, but there was no live session to receive it
    Dropped,
    /// Not something the operator is sent (hello, command, framing failures)
    NotForwardable,
}

/// Write side of an attached session
///
/// Once dead, every write is a no-op. Marking a handle dead wakes the worker
/// that owns the read side so it can close the connection.
pub struct SessionHandle {
    id: u64,
    alive: AtomicBool,
    writer: tokio::sync::Mutex<FramedWrite<BoxWriter, GatewayCodec>>,
    kill: Notify,
}

impl SessionHandle {
    fn new(id: u64, writer: BoxWriter) -> Self {
        Self {
            id,
            alive: AtomicBool::new(true),
            writer: tokio::sync::Mutex::new(FramedWrite::new(writer, GatewayCodec)),
            kill: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Returns true only for the call that killed the handle
    pub fn mark_dead(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        if was_alive {
            self.kill.notify_one();
        }
        was_alive
    }

    /// Resolves once the handle has been marked dead
    pub async fn killed(&self) {
        if !self.is_alive() {
            return;
        }
        self.kill.notified().await;
    }

    /// Write one message; `Ok(false)` if the handle is already dead
    ///
    /// Waiting for the writer and the write itself share `limit`. An elapsed
    /// limit is [`GatewayError::Timeout`].
    pub async fn send(&self, message: GatewayMessage, limit: Duration) -> Result<bool> {
        if !self.is_alive() {
            return Ok(false);
        }
        with_timeout_error(self.write(message), limit).await
    }

    async fn write(&self, message: GatewayMessage) -> Result<bool> {
        let mut writer = self.writer.lock().await;
        // liveness may have changed while waiting for the lock
        if !self.is_alive() {
            return Ok(false);
        }
        writer.send(message).await?;
        Ok(true)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

/// Bidirectional relay between operator sessions and the serial link
pub struct RelayDispatcher {
    serial: tokio::sync::Mutex<FramedWrite<BoxWriter, SerialCodec>>,
    current: Mutex<Option<Arc<SessionHandle>>>,
    write_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl RelayDispatcher {
    pub fn new<W>(serial_writer: W, metrics: Arc<Metrics>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: BoxWriter = Box::new(serial_writer);
        Self {
            serial: tokio::sync::Mutex::new(FramedWrite::new(writer, SerialCodec)),
            current: Mutex::new(None),
            write_timeout: WRITE_TIMEOUT,
            metrics,
        }
    }

    /// Bound on each write to an operator; a session that cannot take a
    /// message in time is closed
    pub fn with_write_timeout(mut self, limit: Duration) -> Self {
        self.write_timeout = limit;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<SessionHandle>>> {
        self.current.lock().unwrap_or_else(|poisoned| {
            warn!("{ERR_SESSION_SLOT_POISONED}");
            poisoned.into_inner()
        })
    }

    /// Make a new session the relay target, displacing any previous one
    pub fn attach<W>(&self, id: u64, writer: W) -> Arc<SessionHandle>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let handle = Arc::new(SessionHandle::new(id, Box::new(writer)));
        let previous = self.slot().replace(Arc::clone(&handle));
        if let Some(previous) = previous {
            info!(session = id, displaced = previous.id(), "New session displaces relay target");
        } else {
            debug!(session = id, "Session is now the relay target");
        }
        handle
    }

    /// Kill a session and clear the slot if it is still the relay target
    pub fn detach(&self, handle: &Arc<SessionHandle>) {
        handle.mark_dead();
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, handle)) {
            *slot = None;
            debug!(session = handle.id(), "Relay target cleared");
        }
    }

    /// Id of the current relay target, if any
    pub fn current_session(&self) -> Option<u64> {
        self.slot().as_ref().map(|handle| handle.id())
    }

    fn current(&self) -> Option<Arc<SessionHandle>> {
        self.slot().clone()
    }

    async fn send_serial(&self, packet: Packet) -> Result<()> {
        let mut serial = self.serial.lock().await;
        serial.send(packet).await
    }

    /// Greet the controller; sent once after the link is up
    pub async fn send_hello(&self) -> Result<()> {
        self.send_serial(Packet::hello()).await?;
        info!("Sent hello to controller");
        Ok(())
    }

    /// Map an operator command to a serial `Command` packet and write it
    pub async fn dispatch_command(&self, command: &OperatorCommand) -> Result<CommandOpcode> {
        let Some(opcode) = CommandOpcode::from_key(command.key) else {
            self.metrics.unknown_command();
            return Err(GatewayError::UnknownCommand(char::from(command.key)));
        };

        let mut params = command.params;
        if opcode == CommandOpcode::ClearStats {
            params[0] = 0;
        }

        self.send_serial(Packet::command(opcode, params)).await?;
        self.metrics.command_sent();
        debug!(?opcode, ?params, "Command sent to controller");
        Ok(opcode)
    }

    /// Reshape a decoded serial packet and forward it to the current session
    pub async fn handle_serial_packet(&self, packet: &Packet) -> Forward {
        let message = match packet.packet_type {
            PacketType::Response => match ResponseCode::from_code(packet.command) {
                Some(ResponseCode::Ok) => GatewayMessage::Ack {
                    code: ResponseCode::Ok.code(),
                },
                Some(ResponseCode::Status) => GatewayMessage::Status {
                    params: packet.params,
                },
                other => {
                    debug!(code = packet.command, response = ?other, "Response not relayed");
                    return Forward::NotForwardable;
                }
            },
            PacketType::Error => {
                warn!(opcode = packet.command, "Controller reported an error");
                GatewayMessage::Ack {
                    code: packet.command,
                }
            }
            PacketType::Message => GatewayMessage::Text { data: packet.data },
            PacketType::Command | PacketType::Hello => {
                debug!(packet_type = ?packet.packet_type, "Unexpected packet from controller");
                return Forward::NotForwardable;
            }
        };

        self.forward(message).await
    }

    async fn forward(&self, message: GatewayMessage) -> Forward {
        let Some(handle) = self.current() else {
            trace!(tag = ?message.tag(), "No session; dropping message");
            self.metrics.message_dropped();
            return Forward::Dropped;
        };

        match handle.send(message, self.write_timeout).await {
            Ok(true) => {
                self.metrics.message_forwarded();
                Forward::Sent
            }
            Ok(false) => {
                self.metrics.message_dropped();
                Forward::Dropped
            }
            Err(GatewayError::Timeout) => {
                warn!(session = handle.id(), limit = ?self.write_timeout, "Session stopped reading; closing it");
                self.detach(&handle);
                self.metrics.message_dropped();
                Forward::Dropped
            }
            Err(e) => {
                warn!(session = handle.id(), error = %e, "Write to session failed; closing it");
                self.detach(&handle);
                self.metrics.message_dropped();
                Forward::Dropped
            }
        }
    }

    /// Route one event from the serial decoder
    pub async fn handle_serial_event(&self, event: SerialEvent) -> Forward {
        match event {
            SerialEvent::Packet(packet) => {
                self.metrics.frame_ok();
                self.handle_serial_packet(&packet).await
            }
            SerialEvent::ChecksumBad => {
                self.metrics.checksum_failure();
                warn!("Bad checksum on serial frame; discarded");
                Forward::NotForwardable
            }
            SerialEvent::Malformed => {
                self.metrics.malformed_frame();
                warn!("Unknown packet type on serial frame; discarded");
                Forward::NotForwardable
            }
            SerialEvent::BadMagic { dropped } => {
                self.metrics.bad_magic(dropped as u64);
                warn!(dropped, "Bad magic number on serial link; resynchronizing");
                Forward::NotForwardable
            }
        }
    }

    /// Read the serial link until it closes, relaying every event
    ///
    /// Returns `Ok(())` on end of stream and the read error otherwise.
    pub async fn serial_drain<R>(self: Arc<Self>, reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FramedRead::new(reader, SerialCodec);
        while let Some(event) = frames.next().await {
            match event {
                Ok(event) => {
                    self.handle_serial_event(event).await;
                }
                Err(e) => {
                    error!(error = %e, "Serial read failed");
                    return Err(e);
                }
            }
        }
        info!("Serial link closed");
        Ok(())
    }

    /// Per-session worker
    ///
    /// Attaches the write half as the relay target and processes commands in
    /// arrival order until the peer disconnects, the handle is killed or the
    /// gateway shuts down. Always detaches before returning.
    #[instrument(skip(self, stream, shutdown), fields(session = id, peer = %peer))]
    pub async fn serve_session<S>(
        &self,
        stream: S,
        id: u64,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let handle = self.attach(id, writer);
        let mut frames = FramedRead::new(reader, GatewayCodec);

        let outcome = loop {
            tokio::select! {
                _ = handle.killed() => {
                    debug!("Session killed");
                    break Ok(());
                }
                _ = shutdown_requested(&mut shutdown) => {
                    debug!("Closing session for shutdown");
                    break Ok(());
                }
                frame = frames.next() => match frame {
                    Some(Ok(InboundFrame::Command(command))) => {
                        match self.dispatch_command(&command).await {
                            Ok(_) => {}
                            Err(GatewayError::UnknownCommand(key)) => {
                                warn!(key = %key.escape_default(), "Unknown command; ignored");
                            }
                            Err(e) => error!(error = %e, "Failed to send command to controller"),
                        }
                    }
                    Some(Ok(InboundFrame::Ignored(tag))) => trace!(tag, "Ignored network tag"),
                    Some(Err(e)) => break Err(e),
                    None => {
                        debug!("Peer closed the connection");
                        break Ok(());
                    }
                },
            }
        };

        self.detach(&handle);
        outcome
    }
}

impl std::fmt::Debug for RelayDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayDispatcher")
            .field("current_session", &self.current_session())
            .finish_non_exhaustive()
    }
}

/// [`ConnectionHandler`] that serves every session through a shared relay
#[derive(Debug, Clone)]
pub struct RelayHandler {
    relay: Arc<RelayDispatcher>,
}

impl RelayHandler {
    pub fn new(relay: Arc<RelayDispatcher>) -> Self {
        Self { relay }
    }
}

impl ConnectionHandler for RelayHandler {
    fn handle(&self, session: Session) -> BoxFuture<'static, ()> {
        let relay = Arc::clone(&self.relay);
        Box::pin(async move {
            let Session {
                id,
                peer,
                stream,
                shutdown,
                ..
            } = session;
            if let Err(e) = relay.serve_session(stream, id, peer, shutdown).await {
                warn!(session = id, error = %e, "Session ended with error");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::core::codec::{FRAME_SIZE, FRAME_MAGIC};
    use crate::core::packet::DATA_LEN;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn relay() -> (Arc<RelayDispatcher>, DuplexStream) {
        let (serial_ours, serial_theirs) = tokio::io::duplex(4096);
        let relay = Arc::new(RelayDispatcher::new(serial_ours, Arc::new(Metrics::new())));
        (relay, serial_theirs)
    }

    async fn read_frame(serial: &mut DuplexStream) -> Packet {
        let mut frame = [0u8; FRAME_SIZE];
        serial.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame[..4], FRAME_MAGIC);
        let mut accumulator = crate::core::codec::FrameAccumulator::new();
        match accumulator.decode_incremental(&frame) {
            crate::core::codec::DecodeResult::Complete { packet, .. } => packet,
            other => panic!("expected a complete frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clear_stats_zeroes_first_param() {
        let (relay, mut serial) = relay();
        let opcode = relay
            .dispatch_command(&OperatorCommand::new(b'C', [99, 5]))
            .await
            .unwrap();
        assert_eq!(opcode, CommandOpcode::ClearStats);

        let packet = read_frame(&mut serial).await;
        assert_eq!(packet.packet_type, PacketType::Command);
        assert_eq!(packet.command, CommandOpcode::ClearStats.opcode());
        assert_eq!(packet.params, [0, 5]);
    }

    #[tokio::test]
    async fn unknown_key_is_reported() {
        let (relay, _serial) = relay();
        let result = relay.dispatch_command(&OperatorCommand::new(b'z', [1, 2])).await;
        assert!(matches!(result, Err(GatewayError::UnknownCommand('z'))));
        assert_eq!(relay.metrics().snapshot().unknown_commands, 1);
        assert_eq!(relay.metrics().snapshot().commands_sent, 0);
    }

    #[tokio::test]
    async fn hello_reaches_the_controller() {
        let (relay, mut serial) = relay();
        relay.send_hello().await.unwrap();
        assert_eq!(read_frame(&mut serial).await, Packet::hello());
    }

    #[tokio::test]
    async fn packets_are_reshaped_for_the_operator() {
        let (relay, _serial) = relay();
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let _handle = relay.attach(1, ours);

        let cases = [
            (Packet::response(ResponseCode::Ok, [7, 7]), vec![0u8, 0]),
            (
                Packet::response(ResponseCode::Status, [1, 0x0102_0304]),
                vec![1u8, 0, 0, 0, 1, 1, 2, 3, 4],
            ),
            (Packet::error(CommandOpcode::TurnLeft.opcode()), vec![0u8, 2]),
        ];
        for (packet, expected) in cases {
            assert_eq!(relay.handle_serial_packet(&packet).await, Forward::Sent);
            let mut got = vec![0u8; expected.len()];
            theirs.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected);
        }

        let packet = Packet::message(b"battery low");
        assert_eq!(relay.handle_serial_packet(&packet).await, Forward::Sent);
        let mut got = [0u8; 1 + DATA_LEN];
        theirs.read_exact(&mut got).await.unwrap();
        assert_eq!(got[0], 2);
        assert_eq!(&got[1..], &packet.data[..]);
    }

    #[tokio::test]
    async fn hello_command_and_unknown_responses_are_not_relayed() {
        let (relay, _serial) = relay();
        let (ours, _theirs) = tokio::io::duplex(1024);
        let _handle = relay.attach(1, ours);

        assert_eq!(relay.handle_serial_packet(&Packet::hello()).await, Forward::NotForwardable);
        assert_eq!(
            relay
                .handle_serial_packet(&Packet::command(CommandOpcode::Stop, [0, 0]))
                .await,
            Forward::NotForwardable
        );
        assert_eq!(
            relay
                .handle_serial_packet(&Packet::response(ResponseCode::BadChecksum, [0, 0]))
                .await,
            Forward::NotForwardable
        );
    }

    #[tokio::test]
    async fn framing_failures_are_counted_not_forwarded() {
        let (relay, _serial) = relay();
        assert_eq!(relay.handle_serial_event(SerialEvent::ChecksumBad).await, Forward::NotForwardable);
        assert_eq!(
            relay.handle_serial_event(SerialEvent::BadMagic { dropped: 3 }).await,
            Forward::NotForwardable
        );
        let snapshot = relay.metrics().snapshot();
        assert_eq!(snapshot.checksum_failures, 1);
        assert_eq!(snapshot.bad_magic_bytes, 3);
    }

    #[tokio::test]
    async fn stale_detach_keeps_newer_target() {
        let (relay, _serial) = relay();
        let (a, _a_peer) = tokio::io::duplex(64);
        let (b, _b_peer) = tokio::io::duplex(64);
        let first = relay.attach(1, a);
        let second = relay.attach(2, b);
        assert_eq!(relay.current_session(), Some(2));

        relay.detach(&first);
        assert_eq!(relay.current_session(), Some(2));
        assert!(second.is_alive());

        relay.detach(&second);
        assert_eq!(relay.current_session(), None);
    }

    #[tokio::test]
    async fn dead_handle_writes_are_no_ops() {
        let (ours, _theirs) = tokio::io::duplex(64);
        let handle = SessionHandle::new(9, Box::new(ours));
        assert!(handle.mark_dead());
        assert!(!handle.mark_dead());
        assert!(!handle.send(GatewayMessage::Ack { code: 0 }, WRITE_TIMEOUT).await.unwrap());
        handle.killed().await;
    }
}
