//! # Herald
//!
//! Reliable per-recipient notification delivery.
//!
//! Every notification gets a durable, strictly increasing sequence number
//! per recipient, is pushed over the recipient's live channel when there is
//! one, and is kept until the recipient acknowledges it. A recipient that
//! reconnects asks to recover from its last seen sequence and gets every
//! unacknowledged notification after it, in order.
//!
//! ## Core Concepts
//!
//! - **Sequencer**: crash-durable per-identity counters
//! - **Outbox**: journaled per-identity mailboxes of pending notifications
//! - **Registry**: at most one live connection per identity, with supersession
//! - **Engine**: ordered pushes on submission and on recovery, ack handling
//!
//! ## Example
//!
//! ```ignore
//! use herald::{Herald, HeraldConfig, Identity, MemoryChannel, Sequence};
//! use std::sync::Arc;
//!
//! let herald = Herald::open_or_create(HeraldConfig {
//!     path: "./herald-data".into(),
//!     ..Default::default()
//! })?;
//!
//! let alice = Identity::new("alice")?;
//! herald.submit(&alice, b"hello".to_vec())?;
//!
//! // The transport hands over an authenticated channel.
//! let (channel, client) = MemoryChannel::pair(64);
//! let session = herald.connect(alice, Arc::new(channel));
//! session.recover(Sequence::ZERO)?;
//! ```

pub mod delivery;
pub mod error;
pub mod journal;
pub mod outbox;
pub mod sequencer;
pub mod service;
pub mod types;

// Re-exports
pub use delivery::{
    AckResult, Channel, ChannelReceiver, ClientFrame, CloseReason, Connection, ConnectionRegistry,
    DeliveryEngine, DeliveryStats, MemoryChannel, RecoveryReport, ServerFrame, Session,
    SessionPhase, SubmitReceipt,
};
pub use error::{HeraldError, Result};
pub use journal::Journal;
pub use outbox::{AckOutcome, Outbox};
pub use sequencer::Sequencer;
pub use service::{GcSummary, Herald, HeraldConfig};
pub use types::*;
