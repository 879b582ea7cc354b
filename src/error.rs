//! Error types for the delivery core.

use crate::types::{Identity, Sequence};
use thiserror::Error;

/// Main error type for herald operations.
#[derive(Debug, Error)]
pub enum HeraldError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Data directory is locked by another process")]
    Locked,

    #[error("Data directory not initialized")]
    NotInitialized,

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Sequencer and outbox disagree. The identity is paused until an
    /// operator resumes it.
    #[error("Duplicate sequence {sequence:?} for {identity}")]
    DuplicateSequence {
        identity: Identity,
        sequence: Sequence,
    },

    #[error("Unknown sequence {sequence:?} for {identity}")]
    UnknownSequence {
        identity: Identity,
        sequence: Sequence,
    },

    #[error("Ack from superseded channel for {0}")]
    StaleChannelAck(Identity),

    #[error("Delivery paused for {0}")]
    IdentityPaused(Identity),

    #[error("Push timed out")]
    PushTimeout,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for HeraldError {
    fn from(e: serde_json::Error) -> Self {
        HeraldError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for HeraldError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        HeraldError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for HeraldError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        HeraldError::Deserialization(e.to_string())
    }
}

/// Result type for herald operations.
pub type Result<T> = std::result::Result<T, HeraldError>;
