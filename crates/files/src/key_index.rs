//! Key-index checkpoint files.
//!
//! A key index is a full serialization of one tree version, written so that
//! startup does not have to replay every transaction log from the beginning.
//!
//! ```text
//! [file header]
//! [transaction_id: u64][tr_log_file_id: u32][tr_log_offset: u64][key_count: u64]
//! key_count x member:
//!     [key_len: varint][key]
//!     [tag=0: u8][value_len: varint][value]                     (inline)
//!     [tag=1: u8][file_id: u32][offset: u32][size: i32]         (stored)
//! [crc32: u32]   over everything after the file header
//! ```
//!
//! All fixed-width integers are little-endian.

use btree::{BTreeRoot, LeafMember, MemberValue, ValueRef};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::io;

use crate::collection::{AppendWriter, DataFile};
use crate::header::{FileKind, HEADER_LEN};
use crate::{varint, FileError};

const TAG_INLINE: u8 = 0;
const TAG_STORED: u8 = 1;

/// Flush the write buffer to the file after this many bytes.
const CHUNK: usize = 64 * 1024;

/// Where a key index sits in transaction history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyIndexInfo {
    pub transaction_id: u64,
    /// Log file that was current when the snapshot was taken.
    pub tr_log_file_id: u32,
    /// Position in that log up to which the snapshot already contains every
    /// commit.
    pub tr_log_offset: u64,
    pub key_count: u64,
}

/// Streams the members of one tree version into a key-index file.
pub struct KeyIndexWriter {
    out: AppendWriter,
    buf: Vec<u8>,
    hasher: Crc32,
    expected: u64,
    written: u64,
}

impl KeyIndexWriter {
    /// Starts a key index on `out`, which must be positioned right after the
    /// header of a [`FileKind::KeyIndex`] file.
    pub fn new(out: AppendWriter, info: KeyIndexInfo) -> Result<Self, FileError> {
        let mut w = Self {
            out,
            buf: Vec::with_capacity(CHUNK + 256),
            hasher: Crc32::new(),
            expected: info.key_count,
            written: 0,
        };
        w.buf.write_u64::<LittleEndian>(info.transaction_id)?;
        w.buf.write_u32::<LittleEndian>(info.tr_log_file_id)?;
        w.buf.write_u64::<LittleEndian>(info.tr_log_offset)?;
        w.buf.write_u64::<LittleEndian>(info.key_count)?;
        Ok(w)
    }

    /// Appends one member. Members must arrive in ascending key order.
    pub fn add(&mut self, member: &LeafMember) -> Result<(), FileError> {
        varint::encode(&mut self.buf, member.key.len() as u64);
        self.buf.extend_from_slice(&member.key);
        match &member.value {
            MemberValue::Inline(bytes) => {
                self.buf.write_u8(TAG_INLINE)?;
                varint::encode(&mut self.buf, bytes.len() as u64);
                self.buf.extend_from_slice(bytes);
            }
            MemberValue::Stored(r) => {
                self.buf.write_u8(TAG_STORED)?;
                self.buf.write_u32::<LittleEndian>(r.file_id)?;
                self.buf.write_u32::<LittleEndian>(r.offset)?;
                self.buf.write_i32::<LittleEndian>(r.size)?;
            }
        }
        self.written += 1;
        if self.buf.len() >= CHUNK {
            self.drain()?;
        }
        Ok(())
    }

    fn drain(&mut self) -> io::Result<()> {
        self.hasher.update(&self.buf);
        self.out.write_block(&self.buf)?;
        self.buf.clear();
        Ok(())
    }

    /// Writes the checksum and makes the file durable. Returns the file size.
    pub fn finish(mut self) -> Result<u64, FileError> {
        if self.written != self.expected {
            return Err(FileError::corrupt(
                self.out.file_id(),
                format!(
                    "key index announced {} keys but {} were written",
                    self.expected, self.written
                ),
            ));
        }
        self.drain()?;
        let crc = self.hasher.clone().finalize();
        self.out.write_block(&crc.to_le_bytes())?;
        self.out.hard_flush()?;
        Ok(self.out.position())
    }
}

/// Writes every member of `root` into `out` and returns the info recorded in
/// the file.
pub fn write_key_index(out: AppendWriter, root: &BTreeRoot) -> Result<KeyIndexInfo, FileError> {
    let info = KeyIndexInfo {
        transaction_id: root.transaction_id(),
        tr_log_file_id: root.tr_log_file_id(),
        tr_log_offset: root.tr_log_offset(),
        key_count: root.len(),
    };
    let mut writer = KeyIndexWriter::new(out, info)?;
    root.iterate(|member| writer.add(member))?;
    writer.finish()?;
    Ok(info)
}

/// Loads and validates a key-index file, rebuilding the tree it describes.
pub fn read_key_index(file: &DataFile) -> Result<(KeyIndexInfo, BTreeRoot), FileError> {
    let id = file.id();
    if file.kind() != Some(FileKind::KeyIndex) {
        return Err(FileError::corrupt(id, "not a key index file"));
    }
    let data = file.read_all()?;
    let header_len = HEADER_LEN as usize;
    if data.len() < header_len + 4 {
        return Err(FileError::corrupt(id, "key index truncated"));
    }
    let (body, crc_bytes) = data[header_len..].split_at(data.len() - header_len - 4);
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let mut hasher = Crc32::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(FileError::corrupt(id, "key index checksum mismatch"));
    }

    let mut r = body;
    let truncated = |_: io::Error| FileError::corrupt(id, "key index body truncated");
    let info = KeyIndexInfo {
        transaction_id: r.read_u64::<LittleEndian>().map_err(truncated)?,
        tr_log_file_id: r.read_u32::<LittleEndian>().map_err(truncated)?,
        tr_log_offset: r.read_u64::<LittleEndian>().map_err(truncated)?,
        key_count: r.read_u64::<LittleEndian>().map_err(truncated)?,
    };

    let mut members: Vec<LeafMember> = Vec::new();
    for _ in 0..info.key_count {
        let key = read_bytes(&mut r).map_err(truncated)?;
        if let Some(prev) = members.last() {
            if prev.key >= key {
                return Err(FileError::corrupt(id, "key index keys out of order"));
            }
        }
        let value = match r.read_u8().map_err(truncated)? {
            TAG_INLINE => MemberValue::Inline(read_bytes(&mut r).map_err(truncated)?),
            TAG_STORED => MemberValue::Stored(ValueRef {
                file_id: r.read_u32::<LittleEndian>().map_err(truncated)?,
                offset: r.read_u32::<LittleEndian>().map_err(truncated)?,
                size: r.read_i32::<LittleEndian>().map_err(truncated)?,
            }),
            tag => {
                return Err(FileError::corrupt(id, format!("unknown value tag {tag}")));
            }
        };
        members.push(LeafMember { key, value });
    }
    if !r.is_empty() {
        return Err(FileError::corrupt(id, "trailing bytes after key index members"));
    }

    let root = BTreeRoot::from_sorted(
        members,
        info.transaction_id,
        info.tr_log_file_id,
        info.tr_log_offset,
    );
    Ok((info, root))
}

fn read_bytes(r: &mut &[u8]) -> io::Result<Vec<u8>> {
    let len = varint::read_required(r)?;
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= r.len())
        .ok_or(io::ErrorKind::UnexpectedEof)?;
    let (bytes, rest) = r.split_at(len);
    *r = rest;
    Ok(bytes.to_vec())
}
