//! Per-identity sequence numbers that never regress across restarts.
//!
//! Numbers are issued from durably reserved blocks: before the counter for
//! an identity passes its reserved high-water mark, a `Reserve` record for
//! the next block is fsynced. After a crash the counter resumes above the
//! highest reservation, so at most one block per identity is skipped and a
//! number is never handed out twice.

use crate::error::Result;
use crate::journal::Journal;
use crate::types::{Identity, Sequence};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Magic bytes for the sequence journal.
const SEQUENCE_MAGIC: &[u8; 4] = b"SEQ\0";

#[derive(Clone, Debug, Serialize, Deserialize)]
enum SequenceRecord {
    Reserve { identity: Identity, upto: Sequence },
}

#[derive(Debug, Default)]
struct Counter {
    /// Last value handed out.
    issued: Sequence,
    /// Highest value covered by a durable reservation.
    reserved: Sequence,
}

/// Issues strictly increasing sequence numbers per identity.
pub struct Sequencer {
    journal: Option<Journal<SequenceRecord>>,
    counters: RwLock<HashMap<Identity, Arc<Mutex<Counter>>>>,
    /// Values reserved per journal write.
    block: u64,
    /// Held shared while reserving, exclusively while compacting.
    compaction: RwLock<()>,
}

impl Sequencer {
    /// Open or create a durable sequencer.
    pub fn open(path: impl AsRef<Path>, block: u64) -> Result<Self> {
        let (journal, records) = Journal::open(path, SEQUENCE_MAGIC)?;

        let mut counters: HashMap<Identity, Arc<Mutex<Counter>>> = HashMap::new();
        for record in records {
            let SequenceRecord::Reserve { identity, upto } = record;
            let counter = counters.entry(identity).or_default();
            let mut counter = counter.lock();
            // Anything reserved may have been issued before the crash.
            counter.reserved = counter.reserved.max(upto);
            counter.issued = counter.reserved;
        }

        debug!(identities = counters.len(), "Sequencer opened");

        Ok(Self {
            journal: Some(journal),
            counters: RwLock::new(counters),
            block: block.max(1),
            compaction: RwLock::new(()),
        })
    }

    /// Sequencer without durability.
    pub fn in_memory() -> Self {
        Self {
            journal: None,
            counters: RwLock::new(HashMap::new()),
            block: 1,
            compaction: RwLock::new(()),
        }
    }

    /// Issue the next sequence for `identity`.
    pub fn next(&self, identity: &Identity) -> Result<Sequence> {
        let _shared = self.compaction.read();
        let counter = self.counter(identity);
        let mut counter = counter.lock();

        let candidate = counter.issued.next();
        if candidate > counter.reserved {
            let upto = Sequence(counter.issued.0 + self.block);
            if let Some(journal) = &self.journal {
                journal.append(&SequenceRecord::Reserve {
                    identity: identity.clone(),
                    upto,
                })?;
            }
            counter.reserved = upto;
        }

        counter.issued = candidate;
        Ok(candidate)
    }

    /// Last sequence issued for `identity` (`Sequence::ZERO` if none).
    pub fn current(&self, identity: &Identity) -> Sequence {
        self.counters
            .read()
            .get(identity)
            .map(|c| c.lock().issued)
            .unwrap_or_default()
    }

    /// Raise the counter to at least `seen`.
    ///
    /// Used to seed from the outbox on open so that losing the sequence
    /// journal cannot lead to reissuing a stored sequence. The next call to
    /// `next` reserves a fresh block above `seen`.
    pub fn observe(&self, identity: &Identity, seen: Sequence) {
        let counter = self.counter(identity);
        let mut counter = counter.lock();
        if seen > counter.issued {
            counter.issued = seen;
        }
        if counter.reserved < counter.issued {
            counter.reserved = counter.issued;
        }
    }

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

    /// Rewrite the journal with one reservation per identity.
    pub fn compact(&self) -> Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };

        let _exclusive = self.compaction.write();
        let records: Vec<SequenceRecord> = self
            .counters
            .read()
            .iter()
            .map(|(identity, counter)| SequenceRecord::Reserve {
                identity: identity.clone(),
                upto: counter.lock().reserved,
            })
            .collect();

        journal.rewrite(&records)?;
        debug!(identities = records.len(), "Sequence journal compacted");
        Ok(())
    }

    fn counter(&self, identity: &Identity) -> Arc<Mutex<Counter>> {
        if let Some(counter) = self.counters.read().get(identity) {
            return Arc::clone(counter);
        }
        Arc::clone(self.counters.write().entry(identity.clone()).or_default())
    }
}
