//! Per-connection handshake state machine.
//!
//! A transport drives one `Session` per accepted channel:
//!
//! ```text
//! Connecting -> Subscribed -> RecoverySent -> Live
//!      \            \              \           \
//!       `------------`--------------`-----------`--> Closed
//! ```
//!
//! The session reaches `Subscribed` once the engine has registered the
//! channel. The client's `recover` frame moves it through `RecoverySent`
//! (replay in progress) to `Live`, after which new submissions are pushed
//! immediately.

use crate::delivery::engine::{DeliveryEngine, RecoveryReport};
use crate::delivery::protocol::{self, ClientFrame};
use crate::delivery::registry::Connection;
use crate::delivery::tracker::AckResult;
use crate::error::{HeraldError, Result};
use crate::types::{ConnectionId, Identity, NotificationId, Sequence};
use std::sync::Arc;
use tracing::debug;

/// Handshake phase of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    /// Channel accepted, not yet registered.
    Connecting,
    /// Registered; waiting for the client's recovery request.
    Subscribed,
    /// Replaying the outbox.
    RecoverySent,
    /// Caught up; live submissions are pushed.
    Live,
    /// Superseded, failed or disconnected.
    Closed,
}

impl SessionPhase {
    pub fn accepts_recover(self) -> bool {
        matches!(self, SessionPhase::Subscribed | SessionPhase::Live)
    }

    pub fn accepts_ack(self) -> bool {
        matches!(self, SessionPhase::RecoverySent | SessionPhase::Live)
    }
}

/// Protocol handle for one connection. Dropping it disconnects.
pub struct Session {
    engine: Arc<DeliveryEngine>,
    connection: Arc<Connection>,
}

impl Session {
    pub(crate) fn new(engine: Arc<DeliveryEngine>, connection: Arc<Connection>) -> Self {
        Self { engine, connection }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn identity(&self) -> &Identity {
        self.connection.identity()
    }

    pub fn phase(&self) -> SessionPhase {
        self.connection.phase()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Replay everything after the client's last seen sequence.
    pub fn recover(&self, last_seen: Sequence) -> Result<RecoveryReport> {
        self.engine.recover(&self.connection, last_seen)
    }

    /// Acknowledge one delivered notification.
    pub fn ack(&self, sequence: Sequence, notification_id: Option<NotificationId>) -> Result<AckResult> {
        self.engine.acknowledge(&self.connection, sequence, notification_id)
    }

    /// Decode an inbound frame and dispatch it.
    ///
    /// Acks from a superseded channel are dropped without an error; the
    /// sender is already gone.
    pub fn handle_frame(&self, bytes: &[u8]) -> Result<()> {
        match protocol::decode_client(bytes)? {
            ClientFrame::Recover { last_seen_seq } => self.recover(last_seen_seq).map(|_| ()),
            ClientFrame::Ack {
                notification_id,
                seq,
            } => match self.ack(seq, notification_id) {
                Ok(_) => Ok(()),
                Err(HeraldError::StaleChannelAck(_)) => {
                    debug!(conn = ?self.id(), seq = seq.0, "Stale ack frame dropped");
                    Ok(())
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Unregister the connection (if still current) and close its channel.
    pub fn close(&self) {
        self.engine.disconnect(&self.connection);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
