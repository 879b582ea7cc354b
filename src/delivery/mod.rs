//! Live delivery: connections, the handshake, pushes and acknowledgements.
//!
//! The transport hands the engine an authenticated identity and a
//! [`Channel`]; the engine returns a [`Session`] that the transport feeds
//! inbound frames into.

pub mod channel;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod tracker;

pub use channel::{Channel, ChannelReceiver, CloseReason, MemoryChannel};
pub use engine::{DeliveryEngine, DeliveryStats, RecoveryReport, SubmitReceipt, DEFAULT_PUSH_TIMEOUT};
pub use protocol::{ClientFrame, ServerFrame};
pub use registry::{Connection, ConnectionRegistry};
pub use session::{Session, SessionPhase};
pub use tracker::{AckResult, AckTracker};
