//! In-memory state of one identity's outbox.

use crate::types::{DeliveryState, Notification, OutboxEntry, Sequence, Timestamp};
use std::collections::BTreeMap;
use std::ops::Bound;

/// What applying an acknowledgement did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckApplied {
    /// The entry moved to Acknowledged.
    Acknowledged,
    /// The entry was already Acknowledged.
    AlreadyAcknowledged,
    /// No such entry.
    Missing,
}

/// Entries for one identity, ordered by sequence.
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    pub(crate) entries: BTreeMap<Sequence, OutboxEntry>,
    /// Highest sequence ever marked Sent.
    pub(crate) last_sent: Sequence,
    /// Highest sequence ever appended.
    pub(crate) highest: Sequence,
    /// Set after a consistency violation; cleared by an operator.
    pub(crate) paused: bool,
}

impl Mailbox {
    pub(crate) fn contains(&self, sequence: Sequence) -> bool {
        self.entries.contains_key(&sequence)
    }

    pub(crate) fn insert(&mut self, notification: Notification) {
        let sequence = notification.sequence;
        self.highest = self.highest.max(sequence);
        self.entries
            .insert(sequence, OutboxEntry::pending(notification));
    }

    /// Record a push. Returns true if the entry moved Pending -> Sent.
    pub(crate) fn mark_sent(&mut self, sequence: Sequence, at: Timestamp) -> bool {
        let Some(entry) = self.entries.get_mut(&sequence) else {
            return false;
        };
        self.last_sent = self.last_sent.max(sequence);
        entry.attempts += 1;
        if entry.state.advances_to(DeliveryState::Sent) {
            entry.state = DeliveryState::Sent;
            entry.sent_at = Some(at);
            true
        } else {
            false
        }
    }

    /// Whether marking `sequence` Sent would change durable state.
    pub(crate) fn sent_is_new(&self, sequence: Sequence) -> bool {
        self.entries
            .get(&sequence)
            .map(|e| e.state == DeliveryState::Pending)
            .unwrap_or(false)
    }

    pub(crate) fn acknowledge(&mut self, sequence: Sequence, at: Timestamp) -> AckApplied {
        match self.entries.get_mut(&sequence) {
            None => AckApplied::Missing,
            Some(entry) if entry.is_acknowledged() => AckApplied::AlreadyAcknowledged,
            Some(entry) => {
                entry.state = DeliveryState::Acknowledged;
                entry.acked_at = Some(at);
                AckApplied::Acknowledged
            }
        }
    }

    /// Remove an Acknowledged entry. Other states are left alone.
    pub(crate) fn prune(&mut self, sequence: Sequence) -> bool {
        match self.entries.get(&sequence) {
            Some(entry) if entry.is_acknowledged() => {
                self.entries.remove(&sequence);
                true
            }
            _ => false,
        }
    }

    /// Non-acknowledged notifications above `after`, ascending.
    pub(crate) fn list_after(&self, after: Sequence) -> Vec<Notification> {
        self.entries
            .range((Bound::Excluded(after), Bound::Unbounded))
            .filter(|(_, entry)| !entry.is_acknowledged())
            .map(|(_, entry)| entry.notification.clone())
            .collect()
    }

    /// Acknowledged entries acked at or before `cutoff`.
    pub(crate) fn acknowledged_before(&self, cutoff: Timestamp) -> Vec<Sequence> {
        self.entries
            .values()
            .filter(|e| e.is_acknowledged() && e.acked_at.map_or(true, |at| at <= cutoff))
            .map(OutboxEntry::sequence)
            .collect()
    }

    pub(crate) fn unacknowledged_count(&self) -> usize {
        self.entries.values().filter(|e| !e.is_acknowledged()).count()
    }
}
