//! Main `Herald` service tying all components together.

use crate::delivery::{Channel, DeliveryEngine, DeliveryStats, Session, SubmitReceipt};
use crate::error::{HeraldError, Result};
use crate::outbox::Outbox;
use crate::sequencer::Sequencer;
use crate::types::Identity;
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Service configuration.
#[derive(Clone, Debug)]
pub struct HeraldConfig {
    /// Base path for the data directory.
    pub path: PathBuf,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,

    /// How long one push may wait on a slow channel.
    pub push_timeout: Duration,

    /// Sequence numbers reserved per sequencer journal write.
    pub sequence_block: u64,

    /// How long acknowledged entries are kept for duplicate-ack detection.
    pub ack_retention: Duration,

    /// Journal record count above which garbage collection compacts.
    pub compact_threshold: u64,

    /// Pruned (identity, sequence) pairs remembered after garbage collection.
    pub pruned_memory: usize,
}

impl Default for HeraldConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./herald"),
            create_if_missing: true,
            push_timeout: Duration::from_millis(250),
            sequence_block: 64,
            ack_retention: Duration::from_secs(30),
            compact_threshold: 10_000,
            pruned_memory: 4096,
        }
    }
}

/// What one `collect_garbage` pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcSummary {
    pub pruned: usize,
    pub outbox_compacted: bool,
    pub sequences_compacted: bool,
}

/// Magic bytes for the data directory manifest.
const HERALD_MAGIC: &[u8; 4] = b"HRD\0";

/// Current data directory format version.
const HERALD_VERSION: u8 = 1;

/// Durable notification delivery service.
///
/// Owns the data directory for its lifetime; a second `Herald` on the same
/// path fails with `Locked`.
pub struct Herald {
    config: HeraldConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    engine: Arc<DeliveryEngine>,
}

impl Herald {
    /// Open an existing data directory or create a new one.
    pub fn open_or_create(config: HeraldConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(HeraldError::NotInitialized)
        }
    }

    /// Create a new data directory.
    pub fn create(config: HeraldConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;
        Self::start(config, lock_file)
    }

    /// Open an existing data directory.
    pub fn open(config: HeraldConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;
        Self::start(config, lock_file)
    }

    fn start(config: HeraldConfig, lock_file: File) -> Result<Self> {
        let outbox = Outbox::open(config.path.join("outbox.log"), config.pruned_memory)?;
        let sequencer = Sequencer::open(config.path.join("sequences.log"), config.sequence_block)?;

        // Never issue below what the outbox already holds.
        for identity in outbox.identities() {
            sequencer.observe(&identity, outbox.highest_sequence(&identity));
        }

        let engine = Arc::new(DeliveryEngine::new(
            Arc::new(sequencer),
            Arc::new(outbox),
            config.push_timeout,
        ));

        info!(path = %config.path.display(), "Herald opened");

        Ok(Self {
            config,
            _lock_file: lock_file,
            engine,
        })
    }

    pub fn config(&self) -> &HeraldConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<DeliveryEngine> {
        &self.engine
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        self.engine.outbox()
    }

    // --- Producers ---

    /// Durably enqueue `payload` for `identity`.
    pub fn submit(&self, identity: &Identity, payload: impl Into<Vec<u8>>) -> Result<SubmitReceipt> {
        self.engine.submit(identity, payload.into())
    }

    // --- Connections ---

    /// Attach an authenticated channel; see [`DeliveryEngine::connect`].
    pub fn connect(&self, identity: Identity, channel: Arc<dyn Channel>) -> Session {
        self.engine.connect(identity, channel)
    }

    // --- Maintenance ---

    /// Prune acknowledged entries older than `ack_retention` and compact
    /// journals that have grown past `compact_threshold`.
    pub fn collect_garbage(&self) -> Result<GcSummary> {
        let outbox = self.engine.outbox();
        let sequencer = self.engine.sequencer();

        let pruned = outbox.prune_acknowledged(self.config.ack_retention)?;
        let outbox_compacted = outbox.compact(self.config.compact_threshold)?;
        let sequences_compacted = sequencer.journal_len() > self.config.compact_threshold;
        if sequences_compacted {
            sequencer.compact()?;
        }

        let summary = GcSummary {
            pruned,
            outbox_compacted,
            sequences_compacted,
        };
        info!(
            pruned,
            outbox_compacted, sequences_compacted, "Garbage collection finished"
        );
        Ok(summary)
    }

    pub fn stats(&self) -> DeliveryStats {
        self.engine.stats()
    }

    /// Identities whose delivery stopped on a consistency violation.
    pub fn paused_identities(&self) -> Vec<Identity> {
        self.engine.outbox().paused_identities()
    }

    /// Re-enable delivery for a paused identity. Returns whether it was paused.
    pub fn resume(&self, identity: &Identity) -> bool {
        self.engine.outbox().resume(identity)
    }

    /// Sync both journals to disk.
    pub fn sync(&self) -> Result<()> {
        self.engine.outbox().sync()?;
        self.engine.sequencer().sync()
    }

    // --- Internal ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(HERALD_MAGIC)?;
        file.write_all(&[HERALD_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        if !manifest_path.exists() {
            return Err(HeraldError::NotInitialized);
        }
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != HERALD_MAGIC {
            return Err(HeraldError::InvalidFormat("Invalid herald magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != HERALD_VERSION {
            return Err(HeraldError::InvalidFormat(format!(
                "Unsupported herald version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| HeraldError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for Herald {
    fn drop(&mut self) {
        self.engine.shutdown();
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
