#![forbid(unsafe_code)]

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::model::OperationBatch;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{PartitionId, Result, SnapshotId, StoreError};

const JOURNAL_MAGIC: [u8; 4] = *b"SOMJ";
const JOURNAL_FORMAT_VERSION: u16 = 1;
pub(crate) const FILE_HEADER_LEN: usize = 24;
const FRAME_HEADER_LEN: usize = 16;
const MAX_FRAME_PAYLOAD: u32 = 64 << 20;

/// File header identifying the partition and the journal generation.
///
/// The generation changes every time the journal is rewritten, which tells
/// tailing readers that their byte offset is no longer meaningful.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct JournalHeader {
    pub partition: PartitionId,
    pub generation: u32,
}

impl JournalHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&JOURNAL_MAGIC);
        buf[4..6].copy_from_slice(&JOURNAL_FORMAT_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.partition.0.to_be_bytes());
        buf[12..16].copy_from_slice(&self.generation.to_be_bytes());
        let crc = crc32fast::hash(&buf[..20]);
        buf[20..24].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; FILE_HEADER_LEN]) -> Result<Self> {
        if src[0..4] != JOURNAL_MAGIC {
            return Err(StoreError::corruption("journal magic mismatch"));
        }
        if u16::from_be_bytes([src[4], src[5]]) != JOURNAL_FORMAT_VERSION {
            return Err(StoreError::corruption("journal format version mismatch"));
        }
        if src[6..8] != [0, 0] || src[16..20] != [0, 0, 0, 0] {
            return Err(StoreError::corruption("journal reserved header bytes non-zero"));
        }
        let stored_crc = u32::from_be_bytes([src[20], src[21], src[22], src[23]]);
        if crc32fast::hash(&src[..20]) != stored_crc {
            return Err(StoreError::corruption("journal header crc mismatch"));
        }
        Ok(Self {
            partition: PartitionId(u32::from_be_bytes([src[8], src[9], src[10], src[11]])),
            generation: u32::from_be_bytes([src[12], src[13], src[14], src[15]]),
        })
    }
}

/// Logical content of one journal frame.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum JournalRecord {
    /// Operations applied at the frame's snapshot.
    Batch { ops: OperationBatch },
    /// Versions obsoleted at or before the frame's snapshot were discarded.
    Gc,
    /// State markers that must survive a journal rewrite.
    Checkpoint {
        ddl_snapshot_id: SnapshotId,
        gc_snapshot_id: SnapshotId,
    },
}

/// One decoded frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct JournalFrame {
    pub snapshot_id: SnapshotId,
    pub record: JournalRecord,
}

impl JournalFrame {
    pub fn batch(snapshot_id: SnapshotId, ops: OperationBatch) -> Self {
        Self {
            snapshot_id,
            record: JournalRecord::Batch { ops },
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(&self.record)?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_PAYLOAD)
            .ok_or_else(|| StoreError::invalid("journal frame payload too large"))?;
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.snapshot_id.to_be_bytes());
        buf.extend_from_slice(&frame_crc(&buf[0..12], &payload).to_be_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }
}

fn frame_crc(head: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(head);
    hasher.update(payload);
    hasher.finalize()
}

/// Frames decoded from a journal and the byte offset just past the last
/// intact frame.
pub(crate) struct FrameScan {
    pub frames: Vec<JournalFrame>,
    pub valid_up_to: u64,
}

/// Reads the header, or `None` when the file is shorter than a header.
pub(crate) fn read_header(io: &dyn FileIo) -> Result<Option<JournalHeader>> {
    if io.len()? < FILE_HEADER_LEN as u64 {
        return Ok(None);
    }
    let mut buf = [0u8; FILE_HEADER_LEN];
    io.read_at(0, &mut buf)?;
    JournalHeader::decode(&buf).map(Some)
}

/// Decodes frames starting at `from` until the end of the file or the first
/// torn frame.
pub(crate) fn read_frames(io: &dyn FileIo, from: u64) -> Result<FrameScan> {
    let end = io.len()?;
    let mut offset = from.max(FILE_HEADER_LEN as u64);
    let mut frames = Vec::new();
    while offset + FRAME_HEADER_LEN as u64 <= end {
        let mut head = [0u8; FRAME_HEADER_LEN];
        io.read_at(offset, &mut head)?;
        let len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
        if len > MAX_FRAME_PAYLOAD {
            break;
        }
        let payload_start = offset + FRAME_HEADER_LEN as u64;
        if payload_start + u64::from(len) > end {
            break;
        }
        let mut payload = vec![0u8; len as usize];
        io.read_at(payload_start, &mut payload)?;
        let stored_crc = u32::from_be_bytes([head[12], head[13], head[14], head[15]]);
        if frame_crc(&head[0..12], &payload) != stored_crc {
            break;
        }
        let mut snapshot = [0u8; 8];
        snapshot.copy_from_slice(&head[4..12]);
        let record: JournalRecord = serde_json::from_slice(&payload)
            .map_err(|err| StoreError::corruption(format!("journal record undecodable: {err}")))?;
        frames.push(JournalFrame {
            snapshot_id: i64::from_be_bytes(snapshot),
            record,
        });
        offset = payload_start + u64::from(len);
    }
    Ok(FrameScan {
        frames,
        valid_up_to: offset,
    })
}

/// Append-only, checksummed frame log backing one partition.
pub(crate) struct Journal {
    io: StdFileIo,
    header: JournalHeader,
    append_offset: u64,
    sync: bool,
}

impl Journal {
    /// Opens the journal at `path`, creating it for `partition` when empty.
    ///
    /// Returns every intact frame. A torn tail left by a crash mid-append is
    /// truncated so later appends start on a frame boundary.
    pub fn open(path: &Path, partition: PartitionId, sync: bool) -> Result<(Self, Vec<JournalFrame>)> {
        let io = StdFileIo::open(path)?;
        let header = match read_header(&io)? {
            Some(header) => header,
            None => {
                let header = JournalHeader {
                    partition,
                    generation: 0,
                };
                io.truncate(0)?;
                io.write_at(0, &header.encode())?;
                io.sync_all()?;
                header
            }
        };
        if header.partition != partition {
            return Err(StoreError::partition(
                partition,
                format!("journal belongs to partition {}", header.partition),
            ));
        }
        let scan = read_frames(&io, FILE_HEADER_LEN as u64)?;
        if scan.valid_up_to < io.len()? {
            io.truncate(scan.valid_up_to)?;
            io.sync_all()?;
        }
        let journal = Self {
            io,
            header,
            append_offset: scan.valid_up_to,
            sync,
        };
        Ok((journal, scan.frames))
    }

    /// Writes a fresh journal holding exactly `frames` and atomically replaces
    /// whatever was at `path`.
    pub fn rewrite(
        path: &Path,
        header: JournalHeader,
        frames: &[JournalFrame],
        sync: bool,
    ) -> Result<Self> {
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::invalid("journal path has no parent directory"))?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&header.encode())?;
        for frame in frames {
            tmp.write_all(&frame.encode()?)?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|err| StoreError::Io(err.error))?;
        let io = StdFileIo::open(path)?;
        let append_offset = io.len()?;
        Ok(Self {
            io,
            header,
            append_offset,
            sync,
        })
    }

    pub fn header(&self) -> JournalHeader {
        self.header
    }

    /// Appends frames and, when configured, fsyncs once for all of them.
    pub fn append_all(&mut self, frames: &[JournalFrame]) -> Result<()> {
        let mut buf = Vec::new();
        for frame in frames {
            buf.extend_from_slice(&frame.encode()?);
        }
        self.io.write_at(self.append_offset, &buf)?;
        self.append_offset += buf.len() as u64;
        if self.sync {
            self.io.sync_all()?;
        }
        Ok(())
    }

    pub fn append(&mut self, frame: &JournalFrame) -> Result<()> {
        self.append_all(std::slice::from_ref(frame))
    }

    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    pub fn len(&self) -> u64 {
        self.append_offset
    }
}
