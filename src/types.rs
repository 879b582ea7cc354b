//! Core types for the delivery core.

use crate::error::HeraldError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable recipient key. Validated on construction and never mutated.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    const MAX_LEN: usize = 256;

    pub fn new(value: impl Into<String>) -> Result<Self, HeraldError> {
        let value = value.into();
        if value.is_empty() {
            return Err(HeraldError::InvalidIdentity("identity is empty".into()));
        }
        if value.len() > Self::MAX_LEN {
            return Err(HeraldError::InvalidIdentity(format!(
                "identity exceeds {} bytes",
                Self::MAX_LEN
            )));
        }
        if value.chars().any(char::is_control) {
            return Err(HeraldError::InvalidIdentity(
                "identity contains control characters".into(),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = HeraldError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Identity::new(value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position in one identity's notification stream.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl Sequence {
    /// Nothing seen yet. The first issued sequence is `Sequence(1)`.
    pub const ZERO: Sequence = Sequence(0);

    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-wide unique notification identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub u64);

impl fmt::Debug for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NotificationId({})", self.0)
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique id of one registered channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A notification addressed to one recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique identifier (assigned by the outbox).
    pub id: NotificationId,

    /// Who receives it.
    pub recipient: Identity,

    /// Position in the recipient's stream (assigned by the sequencer).
    pub sequence: Sequence,

    /// Opaque producer payload.
    pub payload: Vec<u8>,

    /// When the notification was accepted.
    pub created_at: Timestamp,
}

/// Delivery state of an outbox entry. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Stored, not yet pushed over a live channel.
    Pending,
    /// Pushed, waiting for the client's ack.
    Sent,
    /// Acknowledged by the client; awaiting garbage collection.
    Acknowledged,
}

impl DeliveryState {
    pub fn rank(self) -> u8 {
        match self {
            DeliveryState::Pending => 0,
            DeliveryState::Sent => 1,
            DeliveryState::Acknowledged => 2,
        }
    }

    /// Whether moving to `next` is a forward transition.
    pub fn advances_to(self, next: DeliveryState) -> bool {
        next.rank() > self.rank()
    }
}

/// A notification plus its delivery bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub notification: Notification,
    pub state: DeliveryState,
    pub sent_at: Option<Timestamp>,
    pub acked_at: Option<Timestamp>,
    /// Pushes that left the engine for this entry.
    pub attempts: u32,
}

impl OutboxEntry {
    pub fn pending(notification: Notification) -> Self {
        Self {
            notification,
            state: DeliveryState::Pending,
            sent_at: None,
            acked_at: None,
            attempts: 0,
        }
    }

    pub fn sequence(&self) -> Sequence {
        self.notification.sequence
    }

    pub fn is_acknowledged(&self) -> bool {
        self.state == DeliveryState::Acknowledged
    }
}
