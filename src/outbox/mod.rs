//! Durable outbox.
//!
//! Notifications live here from submission until they are acknowledged and
//! garbage-collected. Each identity owns an ordered mailbox; the journal
//! underneath makes every transition survive a restart.

mod mailbox;
mod store;

pub use mailbox::AckApplied;
pub use store::{AckOutcome, Outbox};
