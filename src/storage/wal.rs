//! Row log for the open and closed chunks of a hypertable
//!
//! An event is framed and appended here before its insert returns. Opening a
//! hypertable replays the log into raw chunks; compressing or dropping chunks
//! rewrites it so that it only carries rows that have no chunk file yet.
//!
//! Frame layout, little endian:
//!
//! ```text
//! +---------+----------------------+---------------------------+
//! | len u32 | bincode(Event) [len] | crc32(len bytes ++ event) |
//! +---------+----------------------+---------------------------+
//! ```
//!
//! A torn or corrupt frame ends the readable log, and opening the log cuts the
//! file back to the last good frame.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::Event;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Largest frame body, enforced on append and on replay
pub const MAX_EVENT_BYTES: usize = 1_000_000;

/// Unsynced bytes tolerated in `Batched` mode
const BATCH_SYNC_BYTES: usize = 64 * 1024;

/// When appended frames reach stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalSyncMode {
    /// fsync before every append returns
    EveryWrite,
    /// fsync once 64 KiB have accumulated, and on explicit sync
    #[default]
    Batched,
    /// Flush to the OS only
    None,
}

pub struct WriteAheadLog {
    writer: BufWriter<File>,
    path: PathBuf,
    frames: u64,
    unsynced: usize,
    sync_mode: WalSyncMode,
}

impl WriteAheadLog {
    pub fn open(path: impl AsRef<Path>, sync_mode: WalSyncMode) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;
        let mut frames = 0u64;
        let readable = Self::replay(&path, |_| frames += 1)?;

        // New frames must not land behind a torn one
        if file.metadata()?.len() > readable {
            tracing::warn!(path = %path.display(), keep = readable, "Truncating unreadable WAL tail");
            file.set_len(readable)?;
        }

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            frames,
            unsynced: 0,
            sync_mode,
        })
    }

    pub fn append(&mut self, event: &Event) -> StorageResult<()> {
        self.append_batch(std::slice::from_ref(event))
    }

    /// Frame and write `events` with a single sync decision at the end
    pub fn append_batch(&mut self, events: &[Event]) -> StorageResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(events.len() * 96);
        for event in events {
            frame(event, &mut buf)?;
        }
        self.writer.write_all(&buf)?;
        self.frames += events.len() as u64;
        self.unsynced += buf.len();

        match self.sync_mode {
            WalSyncMode::EveryWrite => self.sync(),
            WalSyncMode::Batched if self.unsynced >= BATCH_SYNC_BYTES => self.sync(),
            WalSyncMode::Batched => Ok(()),
            WalSyncMode::None => Ok(self.writer.flush()?),
        }
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Every event up to the first unreadable frame
    pub fn recover(&mut self) -> StorageResult<Vec<Event>> {
        self.writer.flush()?;
        let mut events = Vec::new();
        Self::replay(&self.path, |event| events.push(event))?;
        Ok(events)
    }

    /// Replace the log with exactly `events`
    ///
    /// The new log is written beside the old one and renamed over it, so a crash
    /// leaves one of the two in place.
    pub fn rewrite(&mut self, events: &[Event]) -> StorageResult<()> {
        self.writer.flush()?;

        let staged = self.path.with_extension("wal.tmp");
        {
            let mut out = BufWriter::new(File::create(&staged)?);
            let mut buf = Vec::new();
            for event in events {
                buf.clear();
                frame(event, &mut buf)?;
                out.write_all(&buf)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        std::fs::rename(&staged, &self.path)?;

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.frames = events.len() as u64;
        self.unsynced = 0;

        tracing::debug!(entries = events.len(), "Compacted WAL");
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.frames
    }

    pub fn file_size(&self) -> StorageResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Returns the byte length of the readable prefix
    fn replay(path: &Path, mut visit: impl FnMut(Event)) -> StorageResult<u64> {
        let mut reader = BufReader::new(File::open(path)?);
        let (mut read, mut offset) = (0u64, 0u64);
        loop {
            match unframe(&mut reader) {
                Ok(Some((event, size))) => {
                    visit(event);
                    read += 1;
                    offset += size;
                }
                Ok(None) => return Ok(offset),
                Err(e) => {
                    tracing::warn!(path = %path.display(), frame = read, error = %e, "WAL replay stopped early");
                    return Ok(offset);
                }
            }
        }
    }
}

/// Reject an event whose frame replay would refuse
pub fn check_event_size(event: &Event) -> StorageResult<()> {
    let bytes = bincode::serialized_size(event)? as usize;
    if bytes > MAX_EVENT_BYTES {
        return Err(StorageError::EventTooLarge {
            bytes,
            limit: MAX_EVENT_BYTES,
        });
    }
    Ok(())
}

fn frame(event: &Event, out: &mut Vec<u8>) -> StorageResult<()> {
    let body = bincode::serialize(event)?;
    if body.len() > MAX_EVENT_BYTES {
        return Err(StorageError::EventTooLarge {
            bytes: body.len(),
            limit: MAX_EVENT_BYTES,
        });
    }
    let len = (body.len() as u32).to_le_bytes();
    out.extend_from_slice(&len);
    out.extend_from_slice(&body);
    out.extend_from_slice(&checksum(&len, &body).to_le_bytes());
    Ok(())
}

/// The next event and its frame size, `Ok(None)` on a clean end of log
fn unframe(reader: &mut impl Read) -> StorageResult<Option<(Event, u64)>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let body_len = u32::from_le_bytes(len) as usize;
    if body_len > MAX_EVENT_BYTES {
        return Err(StorageError::WalError(format!("frame of {} bytes exceeds limit", body_len)));
    }
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body)?;
    let mut crc = [0u8; 4];
    reader.read_exact(&mut crc)?;

    let (stored, actual) = (u32::from_le_bytes(crc), checksum(&len, &body));
    if stored != actual {
        return Err(StorageError::Corruption(format!(
            "WAL frame checksum {:08x} does not match {:08x}",
            stored, actual
        )));
    }
    Ok(Some((bincode::deserialize(&body)?, body_len as u64 + 8)))
}

fn checksum(len: &[u8], body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(len);
    hasher.update(body);
    hasher.finalize()
}
