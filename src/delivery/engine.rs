//! Delivery engine: ordered push on submission, replay on recovery, acks.
//!
//! All per-identity work (submission, recovery, ack processing, disconnect)
//! runs under that identity's delivery lock, so a notification submitted
//! while a replay is in flight is never pushed ahead of it. Unrelated
//! identities never share a lock.
//!
//! A push that fails or times out closes the connection. The entry stays
//! Pending and the client's next `recover` picks it up; there is no retry
//! timer.

use crate::delivery::channel::{Channel, CloseReason};
use crate::delivery::protocol::{self, ServerFrame};
use crate::delivery::registry::{Connection, ConnectionRegistry};
use crate::delivery::session::{Session, SessionPhase};
use crate::delivery::tracker::{AckResult, AckTracker};
use crate::error::{HeraldError, Result};
use crate::outbox::Outbox;
use crate::sequencer::Sequencer;
use crate::types::{Identity, Notification, NotificationId, Sequence, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default time a single push may wait on a slow channel.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_millis(250);

/// Returned to producers once a notification is durably enqueued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub id: NotificationId,
    pub sequence: Sequence,
}

/// Outcome of a recovery request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Cursor actually used (the client's claim, clamped to what was sent).
    pub cursor: Sequence,
    /// Notifications pushed during the replay.
    pub delivered: usize,
    /// Highest sequence pushed, or `cursor` if none.
    pub through: Sequence,
    /// False if a push failed and the connection was closed mid-replay.
    pub complete: bool,
}

/// Point-in-time delivery counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub submitted: u64,
    pub pushed: u64,
    pub push_failures: u64,
    pub acknowledged: u64,
    pub duplicate_acks: u64,
    /// Acks naming a sequence or notification the outbox never held.
    pub unknown_acks: u64,
    pub stale_acks: u64,
    pub recoveries: u64,
    pub superseded: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    pushed: AtomicU64,
    push_failures: AtomicU64,
    acknowledged: AtomicU64,
    duplicate_acks: AtomicU64,
    unknown_acks: AtomicU64,
    stale_acks: AtomicU64,
    recoveries: AtomicU64,
    superseded: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// One mutex per identity, created on demand and dropped when idle.
#[derive(Default)]
struct IdentityLocks {
    locks: Mutex<HashMap<Identity, Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    /// Run `f` with exclusive access to `identity`. Not reentrant.
    fn run<R>(&self, identity: &Identity, f: impl FnOnce() -> R) -> R {
        let lock = Arc::clone(self.locks.lock().entry(identity.clone()).or_default());
        let result = {
            let _guard = lock.lock();
            f()
        };

        let mut locks = self.locks.lock();
        drop(lock);
        if locks.get(identity).map_or(false, |l| Arc::strong_count(l) == 1) {
            locks.remove(identity);
        }
        result
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Coordinates sequencer, outbox, registry and ack tracker.
pub struct DeliveryEngine {
    sequencer: Arc<Sequencer>,
    outbox: Arc<Outbox>,
    registry: Arc<ConnectionRegistry>,
    tracker: AckTracker,
    locks: IdentityLocks,
    push_timeout: Duration,
    counters: Counters,
}

impl DeliveryEngine {
    pub fn new(sequencer: Arc<Sequencer>, outbox: Arc<Outbox>, push_timeout: Duration) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let tracker = AckTracker::new(Arc::clone(&registry), Arc::clone(&outbox));
        Self {
            sequencer,
            outbox,
            registry,
            tracker,
            locks: IdentityLocks::default(),
            push_timeout,
            counters: Counters::default(),
        }
    }

    /// Engine over in-memory storage.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(Sequencer::in_memory()),
            Arc::new(Outbox::in_memory()),
            DEFAULT_PUSH_TIMEOUT,
        )
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    // --- Producers ---

    /// Durably enqueue a notification and push it if the recipient is live.
    ///
    /// Only storage failures (or a paused identity) fail a submission;
    /// delivery problems never reach the producer.
    pub fn submit(&self, identity: &Identity, payload: Vec<u8>) -> Result<SubmitReceipt> {
        self.locks.run(identity, || {
            if self.outbox.is_paused(identity) {
                return Err(HeraldError::IdentityPaused(identity.clone()));
            }

            let sequence = self.sequencer.next(identity)?;
            let notification = Notification {
                id: self.outbox.allocate_id(),
                recipient: identity.clone(),
                sequence,
                payload,
                created_at: Timestamp::now(),
            };
            let receipt = SubmitReceipt {
                id: notification.id,
                sequence,
            };
            self.outbox.append(notification.clone())?;
            bump(&self.counters.submitted);

            match self.registry.lookup(identity) {
                Some(connection) if connection.is_live() => {
                    self.push(&connection, &notification);
                }
                _ => debug!(identity = %identity, seq = sequence.0, "Recipient offline, kept pending"),
            }

            Ok(receipt)
        })
    }

    // --- Connection lifecycle ---

    /// Register an authenticated channel for `identity`.
    ///
    /// Any previous connection for the identity is superseded: it is told
    /// why and its channel is closed before the new one can receive pushes.
    pub fn connect(self: &Arc<Self>, identity: Identity, channel: Arc<dyn Channel>) -> Session {
        let connection = self.locks.run(&identity, || {
            let (connection, superseded) = self.registry.register(identity.clone(), channel);
            if let Some(old) = superseded {
                info!(
                    identity = %identity,
                    old = ?old.id(),
                    new = ?connection.id(),
                    "Superseding previous connection"
                );
                bump(&self.counters.superseded);
                self.close_connection(&old, CloseReason::Superseded);
            }
            connection.set_phase(SessionPhase::Subscribed);
            debug!(identity = %identity, conn = ?connection.id(), "Connection subscribed");
            connection
        });

        Session::new(Arc::clone(self), connection)
    }

    /// Replay every unacknowledged notification after `last_seen`.
    ///
    /// The client cursor is advisory: it is clamped to the highest sequence
    /// the server ever pushed, so a bogus cursor cannot skip notifications
    /// that were never sent.
    pub(crate) fn recover(&self, connection: &Connection, last_seen: Sequence) -> Result<RecoveryReport> {
        let identity = connection.identity();
        self.locks.run(identity, || {
            let phase = connection.phase();
            if phase == SessionPhase::Closed || !self.registry.is_current(identity, connection.id()) {
                return Err(HeraldError::ChannelClosed);
            }
            if !phase.accepts_recover() {
                return Err(HeraldError::Protocol(format!(
                    "recover not accepted while {:?}",
                    phase
                )));
            }
            connection.set_phase(SessionPhase::RecoverySent);

            let last_sent = self.outbox.last_sent(identity);
            let cursor = last_seen.min(last_sent);
            if cursor < last_seen {
                warn!(
                    identity = %identity,
                    claimed = last_seen.0,
                    last_sent = last_sent.0,
                    "Client cursor ahead of server, clamping"
                );
            }

            let pending = if self.outbox.is_paused(identity) {
                warn!(identity = %identity, "Delivery paused, skipping replay");
                Vec::new()
            } else {
                self.outbox.list_after(identity, cursor)
            };

            let mut report = RecoveryReport {
                cursor,
                delivered: 0,
                through: cursor,
                complete: false,
            };
            for notification in &pending {
                if !self.push(connection, notification) {
                    return Ok(report);
                }
                report.delivered += 1;
                report.through = notification.sequence;
            }

            let done = ServerFrame::Recovered {
                through: report.through,
                count: report.delivered,
            };
            if !self.send_frame(connection, &done) {
                return Ok(report);
            }

            connection.set_phase(SessionPhase::Live);
            bump(&self.counters.recoveries);
            report.complete = true;
            info!(
                identity = %identity,
                cursor = cursor.0,
                delivered = report.delivered,
                "Recovery complete"
            );
            Ok(report)
        })
    }

    /// Process a client ack received on `connection`.
    pub(crate) fn acknowledge(
        &self,
        connection: &Connection,
        sequence: Sequence,
        notification_id: Option<NotificationId>,
    ) -> Result<AckResult> {
        self.locks.run(connection.identity(), || {
            let phase = connection.phase();
            // Closed connections fall through to the tracker as stale.
            if phase != SessionPhase::Closed && !phase.accepts_ack() {
                return Err(HeraldError::Protocol(format!(
                    "ack not accepted while {:?}",
                    phase
                )));
            }

            let result = self.tracker.acknowledge(connection, sequence, notification_id);
            match &result {
                Ok(AckResult::Acknowledged) => bump(&self.counters.acknowledged),
                Ok(AckResult::Duplicate) => bump(&self.counters.duplicate_acks),
                Ok(AckResult::Unknown) => bump(&self.counters.unknown_acks),
                Err(HeraldError::StaleChannelAck(_)) => bump(&self.counters.stale_acks),
                Err(_) => {}
            }
            result
        })
    }

    /// Drop `connection`. A no-op on the registry if it was already replaced.
    pub(crate) fn disconnect(&self, connection: &Connection) {
        let identity = connection.identity();
        self.locks.run(identity, || {
            let was_current = self.registry.unregister(identity, connection.id());
            connection.set_phase(SessionPhase::Closed);
            connection.channel().close(CloseReason::ClientClosed);
            if was_current {
                debug!(identity = %identity, conn = ?connection.id(), "Disconnected");
            }
        });
    }

    /// Close every connection.
    pub fn shutdown(&self) {
        let connections = self.registry.drain();
        let count = connections.len();
        for connection in connections {
            self.locks.run(connection.identity(), || {
                self.close_connection(&connection, CloseReason::Shutdown);
            });
        }
        info!(connections = count, "Delivery engine shut down");
    }

    pub fn stats(&self) -> DeliveryStats {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DeliveryStats {
            submitted: load(&c.submitted),
            pushed: load(&c.pushed),
            push_failures: load(&c.push_failures),
            acknowledged: load(&c.acknowledged),
            duplicate_acks: load(&c.duplicate_acks),
            unknown_acks: load(&c.unknown_acks),
            stale_acks: load(&c.stale_acks),
            recoveries: load(&c.recoveries),
            superseded: load(&c.superseded),
        }
    }

    // --- Internals (caller holds the identity lock) ---

    /// Push one notification. On failure the connection is closed and
    /// false returned; the entry keeps its state for the next recovery.
    fn push(&self, connection: &Connection, notification: &Notification) -> bool {
        if !self.send_frame(connection, &ServerFrame::deliver(notification)) {
            return false;
        }

        bump(&self.counters.pushed);
        if let Err(e) = self.outbox.mark_sent(connection.identity(), notification.sequence) {
            // The push went out; the entry simply stays Pending.
            error!(
                identity = %connection.identity(),
                seq = notification.sequence.0,
                error = %e,
                "Failed to record push"
            );
        }
        debug!(identity = %connection.identity(), seq = notification.sequence.0, "Pushed");
        true
    }

    fn send_frame(&self, connection: &Connection, frame: &ServerFrame) -> bool {
        let result = protocol::encode_server(frame)
            .and_then(|bytes| connection.channel().send(&bytes, self.push_timeout));

        match result {
            Ok(()) => true,
            Err(e) => {
                bump(&self.counters.push_failures);
                warn!(
                    identity = %connection.identity(),
                    conn = ?connection.id(),
                    error = %e,
                    "Push failed, closing connection until it recovers"
                );
                self.close_connection(connection, CloseReason::PushFailed);
                false
            }
        }
    }

    fn close_connection(&self, connection: &Connection, reason: CloseReason) {
        connection.set_phase(SessionPhase::Closed);
        self.registry.unregister(connection.identity(), connection.id());

        let channel = connection.channel();
        if channel.is_open() && reason != CloseReason::PushFailed {
            if let Ok(bytes) = protocol::encode_server(&ServerFrame::Closed { reason }) {
                let _ = channel.send(&bytes, Duration::ZERO);
            }
        }
        channel.close(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::channel::{ChannelReceiver, MemoryChannel};
    use std::thread;

    fn engine() -> Arc<DeliveryEngine> {
        Arc::new(DeliveryEngine::in_memory())
    }

    fn alice() -> Identity {
        Identity::new("alice").unwrap()
    }

    fn connect(engine: &Arc<DeliveryEngine>, identity: &Identity, capacity: usize) -> (Session, ChannelReceiver) {
        let (channel, receiver) = MemoryChannel::pair(capacity);
        (engine.connect(identity.clone(), Arc::new(channel)), receiver)
    }

    /// Sequences of the `deliver` frames currently queued.
    fn delivered(receiver: &ChannelReceiver) -> Vec<u64> {
        receiver
            .drain()
            .unwrap()
            .into_iter()
            .filter_map(|frame| match frame {
                ServerFrame::Deliver { seq, .. } => Some(seq.0),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_offline_then_recover_then_live() {
        let engine = engine();
        let alice = alice();

        let receipt = engine.submit(&alice, b"P1".to_vec()).unwrap();
        assert_eq!(receipt.sequence, Sequence(1));

        let (session, receiver) = connect(&engine, &alice, 16);
        assert_eq!(session.phase(), SessionPhase::Subscribed);

        let report = session.recover(Sequence::ZERO).unwrap();
        assert!(report.complete);
        assert_eq!(report.delivered, 1);
        assert_eq!(session.phase(), SessionPhase::Live);

        let frames = receiver.drain().unwrap();
        assert_eq!(
            frames[0],
            ServerFrame::Deliver {
                id: receipt.id,
                seq: Sequence(1),
                payload: b"P1".to_vec(),
                created_at: engine.outbox().get(&alice, Sequence(1)).unwrap().notification.created_at,
            }
        );
        assert!(matches!(frames[1], ServerFrame::Recovered { count: 1, .. }));

        assert_eq!(session.ack(Sequence(1), Some(receipt.id)).unwrap(), AckResult::Acknowledged);

        engine.submit(&alice, b"P2".to_vec()).unwrap();
        assert_eq!(delivered(&receiver), vec![2]);
    }

    #[test]
    fn test_no_live_push_before_recovery() {
        let engine = engine();
        let alice = alice();
        engine.submit(&alice, b"a".to_vec()).unwrap();

        let (session, receiver) = connect(&engine, &alice, 16);
        engine.submit(&alice, b"b".to_vec()).unwrap();
        assert!(delivered(&receiver).is_empty());

        session.recover(Sequence::ZERO).unwrap();
        assert_eq!(delivered(&receiver), vec![1, 2]);
    }

    #[test]
    fn test_ack_before_recover_is_protocol_error() {
        let engine = engine();
        let (session, _receiver) = connect(&engine, &alice(), 16);
        assert!(matches!(
            session.ack(Sequence(1), None),
            Err(HeraldError::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_and_duplicate_acks_counted_apart() {
        let engine = engine();
        let alice = alice();
        let receipt = engine.submit(&alice, b"x".to_vec()).unwrap();

        let (session, _receiver) = connect(&engine, &alice, 16);
        session.recover(Sequence::ZERO).unwrap();

        assert_eq!(session.ack(Sequence(9), None).unwrap(), AckResult::Unknown);
        let wrong_id = NotificationId(receipt.id.0 + 100);
        assert_eq!(session.ack(Sequence(1), Some(wrong_id)).unwrap(), AckResult::Unknown);
        assert_eq!(session.ack(Sequence(1), None).unwrap(), AckResult::Acknowledged);
        assert_eq!(session.ack(Sequence(1), None).unwrap(), AckResult::Duplicate);

        let stats = engine.stats();
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.unknown_acks, 2);
        assert_eq!(stats.duplicate_acks, 1);
    }

    #[test]
    fn test_supersession_closes_old_channel_and_drops_its_acks() {
        let engine = engine();
        let alice = alice();
        engine.submit(&alice, b"a".to_vec()).unwrap();

        let (old, old_rx) = connect(&engine, &alice, 16);
        old.recover(Sequence::ZERO).unwrap();
        old_rx.drain().unwrap();

        let (new, new_rx) = connect(&engine, &alice, 16);
        assert_eq!(old.phase(), SessionPhase::Closed);
        assert_eq!(old_rx.close_reason(), Some(CloseReason::Superseded));
        assert!(matches!(
            old_rx.drain().unwrap().last(),
            Some(ServerFrame::Closed {
                reason: CloseReason::Superseded
            })
        ));

        // Ack through the dead session changes nothing.
        assert!(matches!(
            old.ack(Sequence(1), None),
            Err(HeraldError::StaleChannelAck(_))
        ));
        assert!(old.handle_frame(br#"{"type":"ack","seq":1}"#).is_ok());
        assert!(!engine.outbox().get(&alice, Sequence(1)).unwrap().is_acknowledged());

        new.recover(Sequence::ZERO).unwrap();
        engine.submit(&alice, b"b".to_vec()).unwrap();
        assert_eq!(delivered(&new_rx), vec![1, 2]);
        assert!(delivered(&old_rx).is_empty());

        // Dropping the superseded session leaves the new one registered.
        drop(old);
        assert!(engine.registry().is_current(&alice, new.id()));
        assert_eq!(engine.stats().stale_acks, 2);
    }

    #[test]
    fn test_push_timeout_closes_and_leaves_pending() {
        let engine = Arc::new(DeliveryEngine::new(
            Arc::new(Sequencer::in_memory()),
            Arc::new(Outbox::in_memory()),
            Duration::from_millis(10),
        ));
        let alice = alice();

        let (session, receiver) = connect(&engine, &alice, 2);
        session.recover(Sequence::ZERO).unwrap();
        receiver.drain().unwrap();

        engine.submit(&alice, b"1".to_vec()).unwrap();
        engine.submit(&alice, b"2".to_vec()).unwrap();
        // Third push times out against the full buffer.
        engine.submit(&alice, b"3".to_vec()).unwrap();

        assert_eq!(session.phase(), SessionPhase::Closed);
        assert_eq!(receiver.close_reason(), Some(CloseReason::PushFailed));
        assert_eq!(
            engine.outbox().get(&alice, Sequence(3)).unwrap().state,
            crate::types::DeliveryState::Pending
        );
        assert!(engine.registry().lookup(&alice).is_none());

        // Later submissions are not pushed anywhere until a reconnect.
        engine.submit(&alice, b"4".to_vec()).unwrap();
        assert_eq!(delivered(&receiver), vec![1, 2]);

        let (session, receiver) = connect(&engine, &alice, 16);
        let report = session.recover(Sequence(2)).unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(delivered(&receiver), vec![3, 4]);
        assert_eq!(engine.stats().push_failures, 1);
    }

    #[test]
    fn test_recover_twice_is_idempotent() {
        let engine = engine();
        let alice = alice();
        engine.submit(&alice, b"a".to_vec()).unwrap();

        let (session, receiver) = connect(&engine, &alice, 16);
        session.recover(Sequence::ZERO).unwrap();
        session.recover(Sequence::ZERO).unwrap();
        assert_eq!(delivered(&receiver), vec![1, 1]);
        assert_eq!(engine.outbox().get(&alice, Sequence(1)).unwrap().attempts, 2);
    }

    #[test]
    fn test_client_cursor_is_clamped() {
        let engine = engine();
        let alice = alice();
        for i in 0..3 {
            engine.submit(&alice, vec![i]).unwrap();
        }

        let (session, receiver) = connect(&engine, &alice, 16);
        let report = session.recover(Sequence(100)).unwrap();
        assert_eq!(report.cursor, Sequence::ZERO);
        assert_eq!(delivered(&receiver), vec![1, 2, 3]);
    }

    #[test]
    fn test_paused_identity_refuses_submissions() {
        let engine = engine();
        let alice = alice();
        engine.submit(&alice, b"a".to_vec()).unwrap();

        // Force a sequencer/outbox disagreement.
        let stray = Notification {
            id: engine.outbox().allocate_id(),
            recipient: alice.clone(),
            sequence: Sequence(1),
            payload: vec![],
            created_at: Timestamp::now(),
        };
        assert!(engine.outbox().append(stray).is_err());

        assert!(matches!(
            engine.submit(&alice, b"b".to_vec()),
            Err(HeraldError::IdentityPaused(_))
        ));
        // Other identities are unaffected.
        engine
            .submit(&Identity::new("bob").unwrap(), b"c".to_vec())
            .unwrap();

        engine.outbox().resume(&alice);
        assert_eq!(engine.submit(&alice, b"b".to_vec()).unwrap().sequence, Sequence(2));
    }

    #[test]
    fn test_concurrent_submissions_arrive_in_order() {
        let engine = engine();
        let alice = alice();
        let (session, receiver) = connect(&engine, &alice, 1024);
        session.recover(Sequence::ZERO).unwrap();
        receiver.drain().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let engine = Arc::clone(&engine);
                let alice = alice.clone();
                thread::spawn(move || {
                    for i in 0..50u8 {
                        engine.submit(&alice, vec![t, i]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let seqs = delivered(&receiver);
        assert_eq!(seqs, (1..=200).collect::<Vec<u64>>());
        assert_eq!(engine.locks.len(), 0);
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let engine = engine();
        let (_a, a_rx) = connect(&engine, &alice(), 4);
        let (_b, b_rx) = connect(&engine, &Identity::new("bob").unwrap(), 4);

        engine.shutdown();
        assert!(engine.registry().is_empty());
        assert_eq!(a_rx.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(b_rx.close_reason(), Some(CloseReason::Shutdown));
    }
}
