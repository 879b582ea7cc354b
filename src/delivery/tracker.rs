//! Validation of client acknowledgements.

use crate::delivery::registry::{Connection, ConnectionRegistry};
use crate::error::{HeraldError, Result};
use crate::outbox::{AckOutcome, Outbox};
use crate::types::{NotificationId, Sequence};
use std::sync::Arc;
use tracing::{debug, warn};

/// What an accepted acknowledgement did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckResult {
    /// The entry moved to Acknowledged.
    Acknowledged,
    /// Retransmitted ack for an entry already Acknowledged or pruned.
    Duplicate,
    /// No entry matches. Treated as success so retransmissions never fail.
    Unknown,
}

/// Front door for acks: rejects acks from superseded channels and makes
/// repeated acks idempotent.
pub struct AckTracker {
    registry: Arc<ConnectionRegistry>,
    outbox: Arc<Outbox>,
}

impl AckTracker {
    pub fn new(registry: Arc<ConnectionRegistry>, outbox: Arc<Outbox>) -> Self {
        Self { registry, outbox }
    }

    /// Record an ack for `sequence` received on `connection`.
    ///
    /// Returns `StaleChannelAck` if `connection` is no longer the
    /// identity's registered connection; the outbox is not touched.
    pub fn acknowledge(
        &self,
        connection: &Connection,
        sequence: Sequence,
        notification_id: Option<NotificationId>,
    ) -> Result<AckResult> {
        let identity = connection.identity();
        if !self.registry.is_current(identity, connection.id()) {
            debug!(identity = %identity, seq = sequence.0, "Ack from superseded channel dropped");
            return Err(HeraldError::StaleChannelAck(identity.clone()));
        }

        if let Some(expected) = notification_id {
            if let Some(entry) = self.outbox.get(identity, sequence) {
                if entry.notification.id != expected {
                    warn!(
                        identity = %identity,
                        seq = sequence.0,
                        claimed = expected.0,
                        actual = entry.notification.id.0,
                        "Ack names a different notification, ignoring"
                    );
                    return Ok(AckResult::Unknown);
                }
            }
        }

        match self.outbox.acknowledge(identity, sequence) {
            Ok(AckOutcome::Acknowledged) => Ok(AckResult::Acknowledged),
            Ok(AckOutcome::AlreadyAcknowledged) => Ok(AckResult::Duplicate),
            Err(HeraldError::UnknownSequence { .. }) => {
                if self.outbox.was_pruned(identity, sequence) {
                    Ok(AckResult::Duplicate)
                } else {
                    debug!(identity = %identity, seq = sequence.0, "Ack for unknown sequence");
                    Ok(AckResult::Unknown)
                }
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::channel::MemoryChannel;
    use crate::types::{Identity, Notification, Timestamp};

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        outbox: Arc<Outbox>,
        tracker: AckTracker,
        alice: Identity,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let outbox = Arc::new(Outbox::in_memory());
        let tracker = AckTracker::new(Arc::clone(&registry), Arc::clone(&outbox));
        let alice = Identity::new("alice").unwrap();
        for seq in 1..=2 {
            outbox
                .append(Notification {
                    id: outbox.allocate_id(),
                    recipient: alice.clone(),
                    sequence: Sequence(seq),
                    payload: vec![],
                    created_at: Timestamp::now(),
                })
                .unwrap();
        }
        Fixture {
            registry,
            outbox,
            tracker,
            alice,
        }
    }

    fn connect(fx: &Fixture) -> Arc<Connection> {
        let (channel, _receiver) = MemoryChannel::pair(4);
        fx.registry.register(fx.alice.clone(), Arc::new(channel)).0
    }

    #[test]
    fn test_ack_then_duplicate() {
        let fx = fixture();
        let conn = connect(&fx);

        assert_eq!(
            fx.tracker.acknowledge(&conn, Sequence(1), None).unwrap(),
            AckResult::Acknowledged
        );
        assert_eq!(
            fx.tracker.acknowledge(&conn, Sequence(1), None).unwrap(),
            AckResult::Duplicate
        );
    }

    #[test]
    fn test_ack_after_prune_is_duplicate() {
        let fx = fixture();
        let conn = connect(&fx);

        fx.tracker.acknowledge(&conn, Sequence(1), None).unwrap();
        fx.outbox.prune(&fx.alice, Sequence(1)).unwrap();
        assert_eq!(
            fx.tracker.acknowledge(&conn, Sequence(1), None).unwrap(),
            AckResult::Duplicate
        );
        assert_eq!(
            fx.tracker.acknowledge(&conn, Sequence(50), None).unwrap(),
            AckResult::Unknown
        );
    }

    #[test]
    fn test_stale_channel_ack_has_no_effect() {
        let fx = fixture();
        let old = connect(&fx);
        let _new = connect(&fx);

        let result = fx.tracker.acknowledge(&old, Sequence(1), None);
        assert!(matches!(result, Err(HeraldError::StaleChannelAck(_))));
        assert!(!fx.outbox.get(&fx.alice, Sequence(1)).unwrap().is_acknowledged());
    }

    #[test]
    fn test_mismatched_notification_id_ignored() {
        let fx = fixture();
        let conn = connect(&fx);

        let result = fx
            .tracker
            .acknowledge(&conn, Sequence(1), Some(NotificationId(999)))
            .unwrap();
        assert_eq!(result, AckResult::Unknown);
        assert!(!fx.outbox.get(&fx.alice, Sequence(1)).unwrap().is_acknowledged());

        let id = fx.outbox.get(&fx.alice, Sequence(1)).unwrap().notification.id;
        assert_eq!(
            fx.tracker.acknowledge(&conn, Sequence(1), Some(id)).unwrap(),
            AckResult::Acknowledged
        );
    }
}
