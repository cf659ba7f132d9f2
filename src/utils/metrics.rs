//! Observability and Metrics
//!
//! Counters for session lifecycle, serial link integrity and relay traffic.
//!
//! Uses atomic counters for thread-safe metrics collection. A single
//! [`Metrics`] instance is shared via `Arc` between the session manager, the
//! relay dispatcher and the serial drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for gateway operations
#[derive(Debug)]
pub struct Metrics {
    /// Total sessions that passed handshake and verification
    pub sessions_total: AtomicU64,
    /// Sessions currently being served
    pub sessions_active: AtomicU64,
    /// Connections refused because `max_connections` was reached
    pub connections_refused: AtomicU64,
    /// TLS handshakes that failed or timed out
    pub handshakes_failed: AtomicU64,
    /// Handshaken peers rejected by the identity check
    pub verification_failed: AtomicU64,
    /// Valid frames decoded from the serial link
    pub frames_ok: AtomicU64,
    /// Frames discarded for a checksum mismatch
    pub checksum_failures: AtomicU64,
    /// Bytes dropped while resynchronizing
    pub bad_magic_bytes: AtomicU64,
    /// Checksum-valid frames with an unknown packet type
    pub malformed_frames: AtomicU64,
    /// Command packets written to the serial link
    pub commands_sent: AtomicU64,
    /// Operator commands with an unrecognised key
    pub unknown_commands: AtomicU64,
    /// Messages forwarded to the current session
    pub messages_forwarded: AtomicU64,
    /// Messages dropped because no live session was attached
    pub messages_dropped: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            sessions_total: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            connections_refused: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            verification_failed: AtomicU64::new(0),
            frames_ok: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
            bad_magic_bytes: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
            unknown_commands: AtomicU64::new(0),
            messages_forwarded: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn session_opened(&self) {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_refused(&self) {
        self.connections_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn verification_failed(&self) {
        self.verification_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_ok(&self) {
        self.frames_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn checksum_failure(&self) {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bad_magic(&self, dropped: u64) {
        self.bad_magic_bytes.fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_command(&self) {
        self.unknown_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_forwarded(&self) {
        self.messages_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_total: self.sessions_total.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            verification_failed: self.verification_failed.load(Ordering::Relaxed),
            frames_ok: self.frames_ok.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            bad_magic_bytes: self.bad_magic_bytes.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            unknown_commands: self.unknown_commands.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            sessions_total = snapshot.sessions_total,
            sessions_active = snapshot.sessions_active,
            connections_refused = snapshot.connections_refused,
            handshakes_failed = snapshot.handshakes_failed,
            verification_failed = snapshot.verification_failed,
            frames_ok = snapshot.frames_ok,
            checksum_failures = snapshot.checksum_failures,
            bad_magic_bytes = snapshot.bad_magic_bytes,
            malformed_frames = snapshot.malformed_frames,
            commands_sent = snapshot.commands_sent,
            unknown_commands = snapshot.unknown_commands,
            messages_forwarded = snapshot.messages_forwarded,
            messages_dropped = snapshot.messages_dropped,
            uptime_seconds = snapshot.uptime_seconds,
            "Gateway metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_total: u64,
    pub sessions_active: u64,
    pub connections_refused: u64,
    pub handshakes_failed: u64,
    pub verification_failed: u64,
    pub frames_ok: u64,
    pub checksum_failures: u64,
    pub bad_magic_bytes: u64,
    pub malformed_frames: u64,
    pub commands_sent: u64,
    pub unknown_commands: u64,
    pub messages_forwarded: u64,
    pub messages_dropped: u64,
    pub uptime_seconds: u64,
}
