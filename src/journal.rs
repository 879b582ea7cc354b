//! Append-only journal for crash durability.
//!
//! Every mutation of the sequencer and the outbox is written to a journal
//! and fsynced before it is applied in memory. On open the journal is
//! replayed to rebuild state. Frames are length-prefixed MessagePack with a
//! trailing CRC32. A torn or damaged final frame left by a crash mid-write is
//! cut off; damage anywhere before the tail is reported as corruption.

use crate::error::{HeraldError, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, warn};

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Magic + version.
const HEADER_LEN: u64 = 5;

/// Frames larger than this are treated as corruption.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Durable append-only log of `T` records.
pub struct Journal<T> {
    path: PathBuf,
    magic: [u8; 4],
    writer: Mutex<BufWriter<File>>,
    /// Records written since open or the last rewrite.
    written: Mutex<u64>,
    /// Set when a failed append could not be rolled back.
    broken: AtomicBool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Journal<T> {
    /// Open or create a journal, returning it with every intact record.
    pub fn open(path: impl AsRef<Path>, magic: &[u8; 4]) -> Result<(Self, Vec<T>)> {
        let path = path.as_ref().to_path_buf();

        let records = if path.exists() {
            Self::replay_and_repair(&path, magic)?
        } else {
            Self::write_fresh(&path, magic, &[])?;
            Vec::new()
        };

        let file = OpenOptions::new().append(true).open(&path)?;
        let journal = Self {
            path,
            magic: *magic,
            writer: Mutex::new(BufWriter::new(file)),
            written: Mutex::new(records.len() as u64),
            broken: AtomicBool::new(false),
            _marker: PhantomData,
        };

        Ok((journal, records))
    }

    /// Append one record and sync it to disk.
    pub fn append(&self, record: &T) -> Result<()> {
        self.append_batch(std::slice::from_ref(record))
    }

    /// Append several records under a single fsync.
    ///
    /// Either every record is durable or none is: a failure part way
    /// through cuts the file back to where the batch started.
    pub fn append_batch(&self, records: &[T]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        if self.broken.load(Ordering::Acquire) {
            return Err(HeraldError::Corruption(format!(
                "{} holds an unrepaired partial write",
                self.path.display()
            )));
        }

        let mut writer = self.writer.lock();
        // The buffer is empty between calls.
        let start = writer.get_ref().metadata()?.len();

        let result = records
            .iter()
            .try_for_each(|record| write_frame(&mut *writer, record))
            .and_then(|()| {
                writer.flush()?;
                writer.get_ref().sync_all()?;
                Ok(())
            });

        if let Err(e) = result {
            if let Err(repair) = self.roll_back(&mut *writer, start) {
                error!(
                    path = %self.path.display(),
                    error = %repair,
                    "Journal rollback failed, refusing further appends"
                );
                self.broken.store(true, Ordering::Release);
            }
            return Err(e);
        }

        *self.written.lock() += records.len() as u64;
        Ok(())
    }

    /// Drop whatever a failed append left buffered or on disk past `len`.
    fn roll_back(&self, writer: &mut BufWriter<File>, len: u64) -> Result<()> {
        let file = writer.get_ref().try_clone()?;
        let (_, _unwritten) = std::mem::replace(writer, BufWriter::new(file)).into_parts();

        let file = writer.get_ref();
        file.set_len(len)?;
        file.sync_all()?;

        warn!(path = %self.path.display(), len, "Rolled back failed journal append");
        Ok(())
    }

    /// Replace the whole journal with `records` (compaction).
    ///
    /// The new file is written and synced beside the old one, then renamed
    /// over it, so a crash leaves either the old or the new journal intact.
    pub fn rewrite(&self, records: &[T]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;

        let tmp_path = self.path.with_extension("compact");
        Self::write_fresh(&tmp_path, &self.magic, records)?;
        fs::rename(&tmp_path, &self.path)?;

        *writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        *self.written.lock() = records.len() as u64;
        self.broken.store(false, Ordering::Release);

        debug!(path = %self.path.display(), records = records.len(), "Journal rewritten");
        Ok(())
    }

    /// Flush and fsync anything buffered.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Records written since open or the last rewrite.
    pub fn len(&self) -> u64 {
        *self.written.lock()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_fresh(path: &Path, magic: &[u8; 4], records: &[T]) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(magic)?;
        writer.write_all(&[JOURNAL_VERSION])?;
        for record in records {
            write_frame(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn replay_and_repair(path: &Path, magic: &[u8; 4]) -> Result<Vec<T>> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut header = [0u8; 5];
        reader.read_exact(&mut header)?;
        if &header[..4] != magic {
            return Err(HeraldError::InvalidFormat(format!(
                "Invalid journal magic in {}",
                path.display()
            )));
        }
        if header[4] != JOURNAL_VERSION {
            return Err(HeraldError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                header[4]
            )));
        }

        let mut records = Vec::new();
        let mut intact_len = HEADER_LEN;
        loop {
            match read_frame::<T>(&mut reader, file_len - intact_len)? {
                FrameRead::Record(record, frame_len) => {
                    records.push(record);
                    intact_len += frame_len;
                }
                FrameRead::End => break,
                FrameRead::Torn => {
                    warn!(
                        path = %path.display(),
                        offset = intact_len,
                        "Discarding torn journal tail"
                    );
                    break;
                }
                FrameRead::Damaged { frame_len, error } => {
                    if intact_len + frame_len < file_len {
                        return Err(HeraldError::Corruption(format!(
                            "damaged frame at offset {} in {}: {}",
                            intact_len,
                            path.display(),
                            error
                        )));
                    }
                    warn!(
                        path = %path.display(),
                        offset = intact_len,
                        error = %error,
                        "Discarding damaged journal tail"
                    );
                    break;
                }
            }
        }

        if intact_len < file_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(intact_len)?;
            file.sync_all()?;
        }

        Ok(records)
    }
}

fn write_frame<W: Write, T: Serialize>(writer: &mut W, record: &T) -> Result<()> {
    let encoded = rmp_serde::to_vec(record)?;

    writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
    writer.write_all(&encoded)?;
    writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
    Ok(())
}

enum FrameRead<T> {
    Record(T, u64),
    /// Clean end of file on a frame boundary.
    End,
    /// The frame runs past the end of the file.
    Torn,
    /// The frame is complete but fails its checksum or does not decode.
    Damaged { frame_len: u64, error: HeraldError },
}

/// Read one frame with `remaining` bytes left in the file.
fn read_frame<T: DeserializeOwned>(reader: &mut impl Read, remaining: u64) -> Result<FrameRead<T>> {
    if remaining == 0 {
        return Ok(FrameRead::End);
    }
    if remaining < 4 {
        return Ok(FrameRead::Torn);
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let frame_len = (4 + len + 4) as u64;
    if frame_len > remaining {
        return Ok(FrameRead::Torn);
    }
    if len > MAX_FRAME_LEN {
        return Ok(FrameRead::Damaged {
            frame_len,
            error: HeraldError::Corruption("journal frame too large".into()),
        });
    }

    let mut encoded = vec![0u8; len];
    reader.read_exact(&mut encoded)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let expected = u32::from_le_bytes(checksum_bytes);
    let got = crc32fast::hash(&encoded);
    if expected != got {
        return Ok(FrameRead::Damaged {
            frame_len,
            error: HeraldError::ChecksumMismatch { expected, got },
        });
    }

    match rmp_serde::from_slice(&encoded) {
        Ok(record) => Ok(FrameRead::Record(record, frame_len)),
        Err(e) => Ok(FrameRead::Damaged {
            frame_len,
            error: e.into(),
        }),
    }
}
