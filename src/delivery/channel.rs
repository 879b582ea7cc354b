//! Duplex channel abstraction supplied by the transport.

use crate::delivery::protocol::{self, ServerFrame};
use crate::error::{HeraldError, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Why a channel was closed by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// A newer connection for the same identity replaced this one.
    Superseded,
    /// A push failed or timed out; the client should reconnect and recover.
    PushFailed,
    /// The client went away.
    ClientClosed,
    /// The server is shutting down.
    Shutdown,
}

/// Outbound half of a live connection to one identity.
///
/// `send` must give up after `timeout` instead of blocking indefinitely;
/// the engine calls it while holding the identity's delivery lock.
pub trait Channel: Send + Sync {
    fn send(&self, frame: &[u8], timeout: Duration) -> Result<()>;

    fn close(&self, reason: CloseReason);

    fn is_open(&self) -> bool;
}

/// State shared between both ends of a memory channel.
struct Shared {
    open: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
}

/// In-process channel backed by a bounded crossbeam queue.
///
/// A full queue makes `send` time out, which is how a stalled peer shows up
/// to the engine.
pub struct MemoryChannel {
    sender: Sender<Vec<u8>>,
    shared: Arc<Shared>,
}

impl MemoryChannel {
    /// Create a channel and the receiving end a client would hold.
    pub fn pair(capacity: usize) -> (MemoryChannel, ChannelReceiver) {
        let (sender, receiver) = bounded(capacity);
        let shared = Arc::new(Shared {
            open: AtomicBool::new(true),
            close_reason: Mutex::new(None),
        });

        (
            MemoryChannel {
                sender,
                shared: Arc::clone(&shared),
            },
            ChannelReceiver { receiver, shared },
        )
    }
}

impl Channel for MemoryChannel {
    fn send(&self, frame: &[u8], timeout: Duration) -> Result<()> {
        if !self.is_open() {
            return Err(HeraldError::ChannelClosed);
        }
        match self.sender.send_timeout(frame.to_vec(), timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(HeraldError::PushTimeout),
            Err(SendTimeoutError::Disconnected(_)) => {
                self.shared.open.store(false, Ordering::SeqCst);
                Err(HeraldError::ChannelClosed)
            }
        }
    }

    fn close(&self, reason: CloseReason) {
        if self.shared.open.swap(false, Ordering::SeqCst) {
            *self.shared.close_reason.lock() = Some(reason);
        }
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }
}

/// Client end of a `MemoryChannel`.
pub struct ChannelReceiver {
    receiver: Receiver<Vec<u8>>,
    shared: Arc<Shared>,
}

impl ChannelReceiver {
    /// Receive the next raw frame (blocking).
    pub fn recv(&self) -> std::result::Result<Vec<u8>, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a raw frame (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<Vec<u8>, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive a raw frame with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Vec<u8>, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Receive and decode the next frame, waiting up to `timeout`.
    pub fn recv_frame(&self, timeout: Duration) -> Result<ServerFrame> {
        let bytes = self
            .receiver
            .recv_timeout(timeout)
            .map_err(|_| HeraldError::ChannelClosed)?;
        protocol::decode_server(&bytes)
    }

    /// Decode every frame currently queued.
    pub fn drain(&self) -> Result<Vec<ServerFrame>> {
        self.receiver
            .try_iter()
            .map(|bytes| protocol::decode_server(&bytes))
            .collect()
    }

    /// Simulate the peer dropping off the network: later sends fail.
    pub fn disconnect(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Reason the server closed the channel, if it did.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.shared.close_reason.lock()
    }
}
