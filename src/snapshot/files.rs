//! Reading dump files and tailing update logs.

use crate::error::Result;
use crate::types::{ChunkCoord, SnapshotRecord, UpdateRecord};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Path of a chunk's full dump.
pub fn snapshot_path(dir: &Path, chunk: ChunkCoord) -> PathBuf {
    dir.join(format!("{}.json", chunk.file_stem()))
}

/// Path of a chunk's update log.
pub fn update_log_path(dir: &Path, chunk: ChunkCoord) -> PathBuf {
    dir.join(format!("{}.updates.jsonl", chunk.file_stem()))
}

/// Load a full dump.
pub fn read_snapshot_file(path: &Path) -> Result<SnapshotRecord> {
    let raw = fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Write a full dump, replacing any existing file in one rename.
pub fn write_snapshot_file(path: &Path, record: &SnapshotRecord) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        serde_json::to_writer(&mut file, record)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Append one record to an update log.
pub fn append_update_line(path: &Path, record: &UpdateRecord) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    Ok(())
}

/// New lines read from one update log.
#[derive(Debug, Default)]
pub struct TailBatch {
    pub records: Vec<UpdateRecord>,
    /// Lines that did not parse; skipped.
    pub malformed: usize,
    /// The file shrank since the last read, so lines may have been lost.
    pub truncated: bool,
}

/// Remembers how far each chunk's update log has been consumed.
#[derive(Default)]
pub struct LogTailer {
    offsets: Mutex<HashMap<ChunkCoord, u64>>,
}

impl LogTailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Byte offset consumed so far for a chunk.
    pub fn offset(&self, chunk: ChunkCoord) -> u64 {
        self.offsets.lock().get(&chunk).copied().unwrap_or(0)
    }

    /// Forget the offset; the next read starts from the top of the file.
    pub fn reset(&self, chunk: ChunkCoord) {
        self.offsets.lock().remove(&chunk);
    }

    /// Read complete lines appended since the last call.
    ///
    /// A trailing line without a newline is still being written and is
    /// left for the next pass. A missing file reads as empty.
    pub fn read_new(&self, chunk: ChunkCoord, path: &Path) -> Result<TailBatch> {
        let mut batch = TailBatch::default();

        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(batch),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        let mut offset = self.offset(chunk);
        if len < offset {
            warn!(%chunk, len, offset, "update log shrank");
            batch.truncated = true;
            offset = 0;
        }
        if len == offset {
            return Ok(batch);
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity((len - offset) as usize);
        file.read_to_end(&mut buf)?;

        let consumed = match buf.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => {
                self.offsets.lock().insert(chunk, offset);
                return Ok(batch);
            }
        };

        for line in buf[..consumed].split(|b| *b == b'\n') {
            let line = trim_ascii(line);
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<UpdateRecord>(line) {
                Ok(mut record) => {
                    record.chunk = Some(chunk);
                    batch.records.push(record);
                }
                Err(e) => {
                    batch.malformed += 1;
                    warn!(%chunk, error = %e, "skipping malformed update line");
                }
            }
        }

        self.offsets.lock().insert(chunk, offset + consumed as u64);
        debug!(%chunk, records = batch.records.len(), "tailed update log");
        Ok(batch)
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}
