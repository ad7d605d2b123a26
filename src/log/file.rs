use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::model::{LogEntry, OperationBatch};
use crate::types::{LogOffset, NodeId, QueueId, Result, SnapshotId, StoreError};

use super::{LogReader, LogService};

const POLL_SLICE: Duration = Duration::from_millis(10);

/// Log backed by one JSON-lines file per node.
///
/// Appends are fsynced before returning. Readers tail the file and ignore a
/// trailing line that has not been terminated yet.
pub struct FileLog {
    dir: PathBuf,
    next_offsets: Mutex<HashMap<NodeId, LogOffset>>,
}

impl FileLog {
    /// Opens the log directory, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            next_offsets: Mutex::new(HashMap::new()),
        })
    }

    /// Path of `node`'s log file.
    pub fn path_for(&self, node: NodeId) -> PathBuf {
        self.dir.join(format!("node-{:05}.log", node.0))
    }

    /// Appends a batch for `node` and returns its offset.
    pub fn append(
        &self,
        node: NodeId,
        queue_id: QueueId,
        snapshot_id: SnapshotId,
        timestamp_ms: u64,
        batch: OperationBatch,
    ) -> Result<LogOffset> {
        let mut next_offsets = self.next_offsets.lock();
        let path = self.path_for(node);
        let offset = match next_offsets.get(&node) {
            Some(offset) => *offset,
            None => repair_tail(&path)? + 1,
        };
        let entry = LogEntry {
            offset,
            snapshot_id,
            queue_id,
            timestamp_ms,
            batch,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&line)?;
        file.sync_data()?;
        next_offsets.insert(node, offset + 1);
        Ok(offset)
    }
}

impl LogService for FileLog {
    fn create_reader(&self, node: NodeId, from_offset: LogOffset) -> Result<Box<dyn LogReader>> {
        let path = self.path_for(node);
        let head = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        Ok(Box::new(FileLogReader {
            path,
            position: 0,
            replay_end: head,
            from_offset,
            pending: Vec::new(),
        }))
    }
}

/// Drops an unterminated trailing line left by an interrupted append and
/// returns the offset of the last complete record.
fn repair_tail(path: &Path) -> Result<LogOffset> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(-1),
        Err(err) => return Err(err.into()),
    };
    let complete_len = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |idx| idx + 1);
    if complete_len < bytes.len() {
        OpenOptions::new()
            .write(true)
            .open(path)?
            .set_len(complete_len as u64)?;
    }
    let mut last = -1;
    for line in (&bytes[..complete_len]).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: LogEntry = serde_json::from_str(&line)?;
        last = entry.offset;
    }
    Ok(last)
}

struct FileLogReader {
    path: PathBuf,
    position: u64,
    replay_end: u64,
    from_offset: LogOffset,
    pending: Vec<LogEntry>,
}

impl FileLogReader {
    /// Reads complete lines between the current position and `limit`.
    fn read_complete_lines(&mut self, limit: Option<u64>) -> Result<Vec<LogEntry>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(self.position))?;
        let mut buf = Vec::new();
        match limit {
            Some(limit) => {
                let len = limit.saturating_sub(self.position);
                file.take(len).read_to_end(&mut buf)?;
            }
            None => {
                file.read_to_end(&mut buf)?;
            }
        }
        let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let complete = &buf[..=last_newline];
        let mut entries = Vec::new();
        for line in complete.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let entry: LogEntry = serde_json::from_slice(line).map_err(|err| {
                StoreError::Log(format!("{}: bad record: {err}", self.path.display()))
            })?;
            if entry.offset >= self.from_offset {
                entries.push(entry);
            }
        }
        self.position += complete.len() as u64;
        Ok(entries)
    }
}

impl LogReader for FileLogReader {
    fn read_next_record(&mut self) -> Result<Option<LogEntry>> {
        if self.pending.is_empty() && self.position < self.replay_end {
            let mut batch = self.read_complete_lines(Some(self.replay_end))?;
            batch.reverse();
            self.pending = batch;
            self.replay_end = self.position;
        }
        Ok(self.pending.pop())
    }

    fn latest_updates(&mut self, timeout: Duration) -> Result<Vec<LogEntry>> {
        let mut updates: Vec<LogEntry> = self.pending.drain(..).rev().collect();
        let deadline = Instant::now() + timeout;
        loop {
            updates.extend(self.read_complete_lines(None)?);
            if !updates.is_empty() || Instant::now() >= deadline {
                return Ok(updates);
            }
            thread::sleep(POLL_SLICE.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}
