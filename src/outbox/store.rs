//! Durable outbox of unacknowledged notifications.

use super::mailbox::{AckApplied, Mailbox};
use crate::error::{HeraldError, Result};
use crate::journal::Journal;
use crate::types::{Identity, Notification, NotificationId, OutboxEntry, Sequence, Timestamp};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Magic bytes for the outbox journal.
const OUTBOX_MAGIC: &[u8; 4] = b"OBX\0";

/// Default number of pruned (identity, sequence) pairs remembered.
const DEFAULT_PRUNED_MEMORY: usize = 4096;

/// Outbox journal records.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum OutboxRecord {
    Appended(Notification),
    Sent {
        identity: Identity,
        sequence: Sequence,
        at: Timestamp,
    },
    Acknowledged {
        identity: Identity,
        sequence: Sequence,
        at: Timestamp,
    },
    Pruned {
        identity: Identity,
        sequence: Sequence,
    },
    /// Cursors that outlive pruned entries. Written on compaction.
    Watermark {
        identity: Identity,
        last_sent: Sequence,
        highest: Sequence,
    },
    /// Lowest notification id not yet used. Written on compaction.
    IdFloor(u64),
}

/// Result of `Outbox::acknowledge`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// The entry moved to Acknowledged.
    Acknowledged,
    /// The entry was already Acknowledged.
    AlreadyAcknowledged,
}

/// Per-identity store of notifications from submission until pruning.
///
/// Every mutation is journaled and synced before it becomes visible. Each
/// identity has its own mailbox lock, so identities never contend with each
/// other except on the journal write itself.
pub struct Outbox {
    journal: Option<Journal<OutboxRecord>>,
    mailboxes: RwLock<HashMap<Identity, Arc<RwLock<Mailbox>>>>,
    next_id: AtomicU64,
    /// Recently pruned entries, for classifying retransmitted acks.
    pruned: Mutex<LruCache<(Identity, Sequence), ()>>,
    /// Held shared by mutations, exclusively by compaction.
    compaction: RwLock<()>,
}

impl Outbox {
    /// Open or create a durable outbox, rebuilding state from its journal.
    pub fn open(path: impl AsRef<Path>, pruned_memory: usize) -> Result<Self> {
        let (journal, records) = Journal::open(path, OUTBOX_MAGIC)?;
        let replayed = records.len();

        let outbox = Self::with_journal(Some(journal), pruned_memory);
        let mut max_id = 0u64;
        {
            let mut mailboxes = outbox.mailboxes.write();
            for record in records {
                outbox.replay(&mut mailboxes, record, &mut max_id)?;
            }
        }
        outbox.next_id.store(max_id + 1, Ordering::SeqCst);

        info!(
            records = replayed,
            identities = outbox.mailboxes.read().len(),
            "Outbox opened"
        );
        Ok(outbox)
    }

    /// Outbox without durability.
    pub fn in_memory() -> Self {
        Self::with_journal(None, DEFAULT_PRUNED_MEMORY)
    }

    fn with_journal(journal: Option<Journal<OutboxRecord>>, pruned_memory: usize) -> Self {
        let capacity = NonZeroUsize::new(pruned_memory.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            journal,
            mailboxes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            pruned: Mutex::new(LruCache::new(capacity)),
            compaction: RwLock::new(()),
        }
    }

    fn replay(
        &self,
        mailboxes: &mut HashMap<Identity, Arc<RwLock<Mailbox>>>,
        record: OutboxRecord,
        max_id: &mut u64,
    ) -> Result<()> {
        match record {
            OutboxRecord::Appended(notification) => {
                *max_id = (*max_id).max(notification.id.0);
                let mailbox = mailboxes.entry(notification.recipient.clone()).or_default();
                let mut mailbox = mailbox.write();
                if mailbox.contains(notification.sequence) {
                    return Err(HeraldError::Corruption(format!(
                        "outbox journal appends {} twice for {}",
                        notification.sequence, notification.recipient
                    )));
                }
                mailbox.insert(notification);
            }
            OutboxRecord::Sent {
                identity,
                sequence,
                at,
            } => {
                let mailbox = mailboxes.entry(identity).or_default();
                mailbox.write().mark_sent(sequence, at);
            }
            OutboxRecord::Acknowledged {
                identity,
                sequence,
                at,
            } => {
                if let Some(mailbox) = mailboxes.get(&identity) {
                    mailbox.write().acknowledge(sequence, at);
                }
            }
            OutboxRecord::Pruned { identity, sequence } => {
                if let Some(mailbox) = mailboxes.get(&identity) {
                    mailbox.write().prune(sequence);
                }
            }
            OutboxRecord::Watermark {
                identity,
                last_sent,
                highest,
            } => {
                let mailbox = mailboxes.entry(identity).or_default();
                let mut mailbox = mailbox.write();
                mailbox.last_sent = mailbox.last_sent.max(last_sent);
                mailbox.highest = mailbox.highest.max(highest);
            }
            OutboxRecord::IdFloor(next) => {
                *max_id = (*max_id).max(next.saturating_sub(1));
            }
        }
        Ok(())
    }

    /// Allocate a notification id. Ids are never reused, even across restarts.
    pub fn allocate_id(&self) -> NotificationId {
        NotificationId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    // --- Mutations ---

    /// Store a new Pending entry.
    ///
    /// An existing entry at the same (identity, sequence) is a consistency
    /// violation: the identity is paused and `DuplicateSequence` returned.
    pub fn append(&self, notification: Notification) -> Result<()> {
        let _shared = self.compaction.read();
        let identity = notification.recipient.clone();
        let sequence = notification.sequence;
        let mailbox = self.mailbox(&identity);
        let mut mailbox = mailbox.write();

        if mailbox.paused {
            return Err(HeraldError::IdentityPaused(identity));
        }
        if mailbox.contains(sequence) {
            mailbox.paused = true;
            error!(identity = %identity, seq = sequence.0, "Duplicate sequence, pausing delivery");
            return Err(HeraldError::DuplicateSequence { identity, sequence });
        }

        self.journal_append(&OutboxRecord::Appended(notification.clone()))?;
        mailbox.insert(notification);
        debug!(identity = %identity, seq = sequence.0, "Appended to outbox");
        Ok(())
    }

    /// Pending -> Sent. A no-op for Sent, Acknowledged or missing entries.
    pub fn mark_sent(&self, identity: &Identity, sequence: Sequence) -> Result<()> {
        let _shared = self.compaction.read();
        let Some(mailbox) = self.existing_mailbox(identity) else {
            return Ok(());
        };
        let mut mailbox = mailbox.write();

        let at = Timestamp::now();
        if mailbox.sent_is_new(sequence) {
            self.journal_append(&OutboxRecord::Sent {
                identity: identity.clone(),
                sequence,
                at,
            })?;
        }
        mailbox.mark_sent(sequence, at);
        Ok(())
    }

    /// Move an entry to Acknowledged.
    ///
    /// Fails with `UnknownSequence` if no entry exists, which includes
    /// entries already pruned. Callers treat that as benign.
    pub fn acknowledge(&self, identity: &Identity, sequence: Sequence) -> Result<AckOutcome> {
        let _shared = self.compaction.read();
        let unknown = || HeraldError::UnknownSequence {
            identity: identity.clone(),
            sequence,
        };
        let mailbox = self.existing_mailbox(identity).ok_or_else(unknown)?;
        let mut mailbox = mailbox.write();

        match mailbox.entries.get(&sequence) {
            None => return Err(unknown()),
            Some(entry) if entry.is_acknowledged() => {
                return Ok(AckOutcome::AlreadyAcknowledged)
            }
            Some(_) => {}
        }

        let at = Timestamp::now();
        self.journal_append(&OutboxRecord::Acknowledged {
            identity: identity.clone(),
            sequence,
            at,
        })?;
        match mailbox.acknowledge(sequence, at) {
            AckApplied::Acknowledged => Ok(AckOutcome::Acknowledged),
            AckApplied::AlreadyAcknowledged => Ok(AckOutcome::AlreadyAcknowledged),
            AckApplied::Missing => Err(unknown()),
        }
    }

    /// Remove an Acknowledged entry. Returns false if it was not Acknowledged.
    pub fn prune(&self, identity: &Identity, sequence: Sequence) -> Result<bool> {
        let _shared = self.compaction.read();
        let Some(mailbox) = self.existing_mailbox(identity) else {
            return Ok(false);
        };
        let mut mailbox = mailbox.write();

        let acknowledged = mailbox
            .entries
            .get(&sequence)
            .map_or(false, OutboxEntry::is_acknowledged);
        if !acknowledged {
            return Ok(false);
        }

        self.journal_append(&OutboxRecord::Pruned {
            identity: identity.clone(),
            sequence,
        })?;
        mailbox.prune(sequence);
        self.pruned.lock().put((identity.clone(), sequence), ());
        Ok(true)
    }

    /// Prune every Acknowledged entry acked more than `retention` ago.
    pub fn prune_acknowledged(&self, retention: Duration) -> Result<usize> {
        let _shared = self.compaction.read();
        let cutoff = Timestamp(Timestamp::now().0 - retention.as_micros() as i64);
        let mailboxes: Vec<(Identity, Arc<RwLock<Mailbox>>)> = self
            .mailboxes
            .read()
            .iter()
            .map(|(identity, mailbox)| (identity.clone(), Arc::clone(mailbox)))
            .collect();

        let mut total = 0;
        for (identity, mailbox) in mailboxes {
            let mut mailbox = mailbox.write();
            let sequences = mailbox.acknowledged_before(cutoff);
            if sequences.is_empty() {
                continue;
            }

            let records: Vec<OutboxRecord> = sequences
                .iter()
                .map(|&sequence| OutboxRecord::Pruned {
                    identity: identity.clone(),
                    sequence,
                })
                .collect();
            self.journal_append_batch(&records)?;

            let mut pruned = self.pruned.lock();
            for sequence in sequences {
                mailbox.prune(sequence);
                pruned.put((identity.clone(), sequence), ());
                total += 1;
            }
        }

        if total > 0 {
            debug!(pruned = total, "Pruned acknowledged entries");
        }
        Ok(total)
    }

    // --- Reads ---

    /// All non-Acknowledged notifications for `identity` with sequence
    /// greater than `after`, ascending. The scan runs under the mailbox read
    /// lock, so it observes a single committed state.
    pub fn list_after(&self, identity: &Identity, after: Sequence) -> Vec<Notification> {
        self.existing_mailbox(identity)
            .map(|mailbox| mailbox.read().list_after(after))
            .unwrap_or_default()
    }

    pub fn get(&self, identity: &Identity, sequence: Sequence) -> Option<OutboxEntry> {
        self.existing_mailbox(identity)
            .and_then(|mailbox| mailbox.read().entries.get(&sequence).cloned())
    }

    /// Entries not yet Acknowledged.
    pub fn pending_count(&self, identity: &Identity) -> usize {
        self.existing_mailbox(identity)
            .map(|mailbox| mailbox.read().unacknowledged_count())
            .unwrap_or(0)
    }

    /// Highest sequence ever pushed to `identity`.
    pub fn last_sent(&self, identity: &Identity) -> Sequence {
        self.existing_mailbox(identity)
            .map(|mailbox| mailbox.read().last_sent)
            .unwrap_or_default()
    }

    /// Highest sequence ever appended for `identity`.
    pub fn highest_sequence(&self, identity: &Identity) -> Sequence {
        self.existing_mailbox(identity)
            .map(|mailbox| mailbox.read().highest)
            .unwrap_or_default()
    }

    /// Whether `(identity, sequence)` was pruned recently.
    pub fn was_pruned(&self, identity: &Identity, sequence: Sequence) -> bool {
        self.pruned
            .lock()
            .contains(&(identity.clone(), sequence))
    }

    pub fn identities(&self) -> Vec<Identity> {
        let mut identities: Vec<Identity> = self.mailboxes.read().keys().cloned().collect();
        identities.sort();
        identities
    }

    // --- Pausing ---

    pub fn is_paused(&self, identity: &Identity) -> bool {
        self.existing_mailbox(identity)
            .map(|mailbox| mailbox.read().paused)
            .unwrap_or(false)
    }

    pub fn paused_identities(&self) -> Vec<Identity> {
        let mut paused: Vec<Identity> = self
            .mailboxes
            .read()
            .iter()
            .filter(|(_, mailbox)| mailbox.read().paused)
            .map(|(identity, _)| identity.clone())
            .collect();
        paused.sort();
        paused
    }

    /// Clear the paused flag after an operator has resolved the conflict.
    pub fn resume(&self, identity: &Identity) -> bool {
        match self.existing_mailbox(identity) {
            Some(mailbox) => {
                let mut mailbox = mailbox.write();
                let was_paused = mailbox.paused;
                mailbox.paused = false;
                if was_paused {
                    info!(identity = %identity, "Delivery resumed");
                }
                was_paused
            }
            None => false,
        }
    }

    // --- Maintenance ---

    pub fn sync(&self) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    /// Journal records since the last compaction.
    pub fn journal_len(&self) -> u64 {
        self.journal.as_ref().map(Journal::len).unwrap_or(0)
    }

    /// Rewrite the journal with only live state if it holds more than
    /// `threshold` records. Returns whether a rewrite happened.
    pub fn compact(&self, threshold: u64) -> Result<bool> {
        let Some(journal) = &self.journal else {
            return Ok(false);
        };
        if journal.len() <= threshold {
            return Ok(false);
        }

        let _exclusive = self.compaction.write();
        let mut records = vec![OutboxRecord::IdFloor(self.next_id.load(Ordering::SeqCst))];
        {
            let mailboxes = self.mailboxes.read();
            for (identity, mailbox) in mailboxes.iter() {
                let mailbox = mailbox.read();
                records.push(OutboxRecord::Watermark {
                    identity: identity.clone(),
                    last_sent: mailbox.last_sent,
                    highest: mailbox.highest,
                });
                for entry in mailbox.entries.values() {
                    records.push(OutboxRecord::Appended(entry.notification.clone()));
                    if let Some(at) = entry.sent_at {
                        records.push(OutboxRecord::Sent {
                            identity: identity.clone(),
                            sequence: entry.sequence(),
                            at,
                        });
                    }
                    if let Some(at) = entry.acked_at {
                        records.push(OutboxRecord::Acknowledged {
                            identity: identity.clone(),
                            sequence: entry.sequence(),
                            at,
                        });
                    }
                }
            }
        }

        let before = journal.len();
        journal.rewrite(&records)?;
        info!(before, after = records.len(), "Outbox journal compacted");
        Ok(true)
    }

    fn journal_append(&self, record: &OutboxRecord) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.append(record),
            None => Ok(()),
        }
    }

    fn journal_append_batch(&self, records: &[OutboxRecord]) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.append_batch(records),
            None => Ok(()),
        }
    }

    fn existing_mailbox(&self, identity: &Identity) -> Option<Arc<RwLock<Mailbox>>> {
        self.mailboxes.read().get(identity).cloned()
    }

    fn mailbox(&self, identity: &Identity) -> Arc<RwLock<Mailbox>> {
        if let Some(mailbox) = self.existing_mailbox(identity) {
            return mailbox;
        }
        Arc::clone(self.mailboxes.write().entry(identity.clone()).or_default())
    }
}
