//! # TrLog - Transaction Log
//!
//! Durability for ArborKV commits. Every operation of a write transaction is
//! appended to the active transaction-log file, followed by a `Commit` record.
//! On restart the logs are replayed and only operations sealed by a `Commit`
//! are applied.
//!
//! Stored (non-inline) values live *inside* the log frames: the leaf that
//! references such a value points at the absolute offset of its bytes in the
//! log file, so a committed value is never written twice.
//!
//! ## Frame Format
//!
//! ```text
//! [frame_len: varint][crc32: u32 LE][body ...]
//! ```
//!
//! `frame_len` counts the 4-byte CRC plus the body, not itself.
//!
//! Body (CreateOrUpdate): `[op=1][key_len: varint][key][tag=0][len: varint][value]`
//!                    or  `[op=1][key_len: varint][key][tag=1][size: i32 LE][abs(size) bytes]`
//! Body (Erase):          `[op=2][key_len: varint][key]`
//! Body (EraseRange):     `[op=3][first_len: varint][first][last_len: varint][last]`
//! Body (Commit):         `[op=4][transaction_id: u64 LE]`
//!
//! ## Example
//!
//! ```rust,no_run
//! use files::{FileCollection, FileKind};
//! use trlog::{TrLogReader, TrLogRecord, TrLogWriter};
//!
//! let fc = FileCollection::open("db").unwrap();
//! let (file, out) = fc.create_file(FileKind::TransactionLog, 1).unwrap();
//! let mut w = TrLogWriter::new(out);
//! w.append(&TrLogRecord::Erase { key: b"k".to_vec() }).unwrap();
//! w.append(&TrLogRecord::Commit { transaction_id: 1 }).unwrap();
//! w.flush().unwrap();
//!
//! let mut r = TrLogReader::open(&file).unwrap();
//! r.replay(|entry| println!("{:?}", entry.record)).unwrap();
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use files::{varint, AppendWriter, DataFile, HEADER_LEN};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};

use thiserror::Error;

const OP_CREATE_OR_UPDATE: u8 = 1;
const OP_ERASE: u8 = 2;
const OP_ERASE_RANGE: u8 = 3;
const OP_COMMIT: u8 = 4;

const TAG_INLINE: u8 = 0;
const TAG_STORED: u8 = 1;

/// Frames larger than this are rejected as corrupt.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// The value carried by a [`TrLogRecord::CreateOrUpdate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggedValue {
    /// Small value that the tree keeps inline.
    Inline(Vec<u8>),
    /// Value the tree will reference by offset. A negative `size` marks
    /// compressed bytes; `bytes.len()` is always `abs(size)`.
    Stored { size: i32, bytes: Vec<u8> },
}

/// One logged operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrLogRecord {
    CreateOrUpdate { key: Vec<u8>, value: LoggedValue },
    Erase { key: Vec<u8> },
    /// Removes every key `k` with `first_key <= k <= last_key`.
    EraseRange { first_key: Vec<u8>, last_key: Vec<u8> },
    /// Seals all operations since the previous commit.
    Commit { transaction_id: u64 },
}

/// A record as seen during replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrLogEntry {
    pub record: TrLogRecord,
    /// Absolute offset of the value bytes of a stored `CreateOrUpdate`.
    pub value_offset: Option<u32>,
    /// Absolute offset just past this frame.
    pub end_offset: u64,
}

/// Errors that can occur while writing or replaying a transaction log.
#[derive(Debug, Error)]
pub enum TrLogError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A frame failed CRC validation or could not be decoded.
    #[error("corrupt record at offset {0}")]
    Corrupt(u64),
}

/// Appends framed records to a transaction-log file.
pub struct TrLogWriter {
    out: AppendWriter,
    /// Reusable frame body buffer.
    body: Vec<u8>,
    frame: Vec<u8>,
}

impl TrLogWriter {
    /// Wraps an appender of a freshly created log file.
    pub fn new(out: AppendWriter) -> Self {
        Self {
            out,
            body: Vec::with_capacity(256),
            frame: Vec::with_capacity(256),
        }
    }

    #[must_use]
    pub fn file_id(&self) -> u32 {
        self.out.file_id()
    }

    /// Absolute offset the next frame will start at.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.out.position()
    }

    /// Serializes `record` and appends it to the buffered log.
    ///
    /// Returns the absolute offset of the value bytes for a stored
    /// `CreateOrUpdate`, `None` for every other record.
    pub fn append(&mut self, record: &TrLogRecord) -> Result<Option<u32>, TrLogError> {
        self.body.clear();
        let mut value_in_body = None;

        match record {
            TrLogRecord::CreateOrUpdate { key, value } => {
                self.body.write_u8(OP_CREATE_OR_UPDATE)?;
                put_bytes(&mut self.body, key);
                match value {
                    LoggedValue::Inline(bytes) => {
                        self.body.write_u8(TAG_INLINE)?;
                        put_bytes(&mut self.body, bytes);
                    }
                    LoggedValue::Stored { size, bytes } => {
                        if bytes.len() as u64 != u64::from(size.unsigned_abs()) {
                            return Err(invalid_input("stored value length does not match size"));
                        }
                        self.body.write_u8(TAG_STORED)?;
                        self.body.write_i32::<LittleEndian>(*size)?;
                        value_in_body = Some(self.body.len() as u64);
                        self.body.extend_from_slice(bytes);
                    }
                }
            }
            TrLogRecord::Erase { key } => {
                self.body.write_u8(OP_ERASE)?;
                put_bytes(&mut self.body, key);
            }
            TrLogRecord::EraseRange {
                first_key,
                last_key,
            } => {
                self.body.write_u8(OP_ERASE_RANGE)?;
                put_bytes(&mut self.body, first_key);
                put_bytes(&mut self.body, last_key);
            }
            TrLogRecord::Commit { transaction_id } => {
                self.body.write_u8(OP_COMMIT)?;
                self.body.write_u64::<LittleEndian>(*transaction_id)?;
            }
        }

        let frame_len = self.body.len() as u64 + 4;
        if frame_len > MAX_FRAME_LEN {
            return Err(invalid_input("transaction log record too large"));
        }

        let mut hasher = Crc32::new();
        hasher.update(&self.body);
        let crc = hasher.finalize();

        self.frame.clear();
        varint::encode(&mut self.frame, frame_len);
        self.frame.write_u32::<LittleEndian>(crc)?;
        let body_start = self.out.position() + self.frame.len() as u64;

        let value_offset = match value_in_body {
            Some(rel) => {
                let abs = body_start + rel;
                let end = abs + (self.body.len() as u64 - rel);
                if end > u64::from(u32::MAX) {
                    return Err(invalid_input("value would lie beyond the addressable offset range"));
                }
                Some(abs as u32)
            }
            None => None,
        };

        self.out.write_block(&self.frame)?;
        self.out.write_block(&self.body)?;
        Ok(value_offset)
    }

    /// Hands buffered frames to the OS; they become readable through the
    /// file collection.
    pub fn flush(&mut self) -> Result<(), TrLogError> {
        self.out.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs; on return every appended frame is durable.
    pub fn hard_flush(&mut self) -> Result<(), TrLogError> {
        self.out.hard_flush()?;
        Ok(())
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    varint::encode(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn invalid_input(msg: &'static str) -> TrLogError {
    TrLogError::Io(io::Error::new(io::ErrorKind::InvalidInput, msg))
}

/// Sequential reader yielding every complete, valid frame of one log.
///
/// A truncated tail frame (crash mid-append) is treated as a clean end of
/// log. A frame whose CRC does not match, or whose body cannot be decoded,
/// is reported as [`TrLogError::Corrupt`].
pub struct TrLogReader<R: Read> {
    rdr: BufReader<R>,
    /// Absolute offset of the next unread byte.
    position: u64,
}

impl TrLogReader<File> {
    /// Opens the log behind `file` and positions the reader after its header.
    pub fn open(file: &DataFile) -> Result<TrLogReader<File>, TrLogError> {
        let mut f = File::open(file.path())?;
        f.seek(SeekFrom::Start(HEADER_LEN))?;
        Ok(TrLogReader {
            rdr: BufReader::new(f),
            position: HEADER_LEN,
        })
    }
}

impl<R: Read> TrLogReader<R> {
    /// Reads frames from `reader`, whose first byte is at absolute offset
    /// `start`.
    pub fn from_reader(reader: R, start: u64) -> Self {
        TrLogReader {
            rdr: BufReader::new(reader),
            position: start,
        }
    }

    /// Absolute offset just past the last complete frame read so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Skips frames until the reader is at absolute offset `offset`.
    ///
    /// `offset` must be a frame boundary previously reported by a replay.
    /// Returns `false` if the log ends first.
    pub fn skip_to(&mut self, offset: u64) -> Result<bool, TrLogError> {
        if offset < self.position {
            return Err(TrLogError::Corrupt(offset));
        }
        let skip = offset - self.position;
        let copied = io::copy(&mut (&mut self.rdr).take(skip), &mut io::sink())?;
        self.position += copied;
        Ok(copied == skip)
    }

    /// Replays every valid frame, calling `apply` for each one. Returns the
    /// absolute offset just past the last complete frame.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<u64, TrLogError>
    where
        F: FnMut(TrLogEntry),
    {
        let mut body = Vec::with_capacity(256);

        loop {
            let frame_start = self.position;

            let frame_len = match varint::read(&mut self.rdr) {
                Ok(Some(v)) => v,
                Ok(None) => return Ok(frame_start),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(frame_start),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    return Err(TrLogError::Corrupt(frame_start))
                }
                Err(e) => return Err(TrLogError::Io(e)),
            };
            if frame_len <= 4 || frame_len > MAX_FRAME_LEN {
                return Err(TrLogError::Corrupt(frame_start));
            }

            let crc = match self.rdr.read_u32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(frame_start),
                Err(e) => return Err(TrLogError::Io(e)),
            };

            body.clear();
            body.resize((frame_len - 4) as usize, 0);
            match self.rdr.read_exact(&mut body) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(frame_start),
                Err(e) => return Err(TrLogError::Io(e)),
            }

            let mut hasher = Crc32::new();
            hasher.update(&body);
            if hasher.finalize() != crc {
                return Err(TrLogError::Corrupt(frame_start));
            }

            let body_start = frame_start + varint::encoded_len(frame_len) as u64 + 4;
            let end_offset = body_start + body.len() as u64;
            let (record, value_in_body) =
                decode_body(&body).ok_or(TrLogError::Corrupt(frame_start))?;
            let value_offset = match value_in_body {
                Some(rel) => Some(
                    u32::try_from(body_start + rel).map_err(|_| TrLogError::Corrupt(frame_start))?,
                ),
                None => None,
            };

            self.position = end_offset;
            apply(TrLogEntry {
                record,
                value_offset,
                end_offset,
            });
        }
    }
}

/// Decodes one frame body. The second element is the offset of stored value
/// bytes relative to the start of the body.
fn decode_body(body: &[u8]) -> Option<(TrLogRecord, Option<u64>)> {
    let mut r = body;
    let op = r.read_u8().ok()?;
    let (record, value_at) = match op {
        OP_CREATE_OR_UPDATE => {
            let key = take_bytes(&mut r)?;
            match r.read_u8().ok()? {
                TAG_INLINE => {
                    let bytes = take_bytes(&mut r)?;
                    (
                        TrLogRecord::CreateOrUpdate {
                            key,
                            value: LoggedValue::Inline(bytes),
                        },
                        None,
                    )
                }
                TAG_STORED => {
                    let size = r.read_i32::<LittleEndian>().ok()?;
                    let len = size.unsigned_abs() as usize;
                    if len > r.len() {
                        return None;
                    }
                    let at = (body.len() - r.len()) as u64;
                    let (bytes, rest) = r.split_at(len);
                    r = rest;
                    (
                        TrLogRecord::CreateOrUpdate {
                            key,
                            value: LoggedValue::Stored {
                                size,
                                bytes: bytes.to_vec(),
                            },
                        },
                        Some(at),
                    )
                }
                _ => return None,
            }
        }
        OP_ERASE => (TrLogRecord::Erase { key: take_bytes(&mut r)? }, None),
        OP_ERASE_RANGE => {
            let first_key = take_bytes(&mut r)?;
            let last_key = take_bytes(&mut r)?;
            (
                TrLogRecord::EraseRange {
                    first_key,
                    last_key,
                },
                None,
            )
        }
        OP_COMMIT => (
            TrLogRecord::Commit {
                transaction_id: r.read_u64::<LittleEndian>().ok()?,
            },
            None,
        ),
        _ => return None,
    };
    if !r.is_empty() {
        return None;
    }
    Some((record, value_at))
}

fn take_bytes(r: &mut &[u8]) -> Option<Vec<u8>> {
    let len = usize::try_from(varint::read(r).ok()??).ok()?;
    if len > r.len() {
        return None;
    }
    let (bytes, rest) = r.split_at(len);
    *r = rest;
    Some(bytes.to_vec())
}
