//! Common header written at the start of every data file.
//!
//! ```text
//! [magic: 4 bytes "BTKV"][version: u8][kind: u8][generation: u64 LE]
//! ```
//!
//! The header is part of the addressed space: value offsets are absolute, so
//! the first value byte of any file sits at [`HEADER_LEN`].

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::FileError;

/// Magic bytes identifying an ArborKV data file.
pub const FILE_MAGIC: [u8; 4] = *b"BTKV";

/// Current on-disk format version.
pub const FORMAT_VERSION: u8 = 1;

/// Size of the header in bytes: 4 (magic) + 1 (version) + 1 (kind) + 8 (generation).
pub const HEADER_LEN: u64 = 4 + 1 + 1 + 8;

/// What a data file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Framed transaction records; stored values live inside the frames.
    TransactionLog,
    /// Raw concatenated value bytes written by the compactor.
    PureValues,
    /// A serialized B-tree snapshot (key-index checkpoint).
    KeyIndex,
}

impl FileKind {
    fn to_u8(self) -> u8 {
        match self {
            FileKind::TransactionLog => 1,
            FileKind::PureValues => 2,
            FileKind::KeyIndex => 3,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(FileKind::TransactionLog),
            2 => Some(FileKind::PureValues),
            3 => Some(FileKind::KeyIndex),
            _ => None,
        }
    }

    /// File name extension used for this kind.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            FileKind::TransactionLog => "trl",
            FileKind::PureValues => "pvl",
            FileKind::KeyIndex => "kvi",
        }
    }

    pub(crate) fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "trl" => Some(FileKind::TransactionLog),
            "pvl" => Some(FileKind::PureValues),
            "kvi" => Some(FileKind::KeyIndex),
            _ => None,
        }
    }

    /// Whether leaf value references may point into files of this kind.
    #[must_use]
    pub fn contains_values(self) -> bool {
        matches!(self, FileKind::TransactionLog | FileKind::PureValues)
    }
}

/// Parsed file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub kind: FileKind,
    /// Monotonic creation epoch of the file.
    pub generation: u64,
}

impl FileHeader {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN as usize);
        buf.extend_from_slice(&FILE_MAGIC);
        buf.push(FORMAT_VERSION);
        buf.push(self.kind.to_u8());
        // writing into a Vec cannot fail
        let _ = buf.write_u64::<LittleEndian>(self.generation);
        buf
    }

    /// Parses and validates a header from the first [`HEADER_LEN`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, FileError> {
        if (buf.len() as u64) < HEADER_LEN {
            return Err(FileError::BadHeader(format!(
                "file too small for header ({} bytes)",
                buf.len()
            )));
        }
        if buf[..4] != FILE_MAGIC {
            return Err(FileError::BadHeader(format!("unknown magic {:02x?}", &buf[..4])));
        }
        if buf[4] != FORMAT_VERSION {
            return Err(FileError::BadHeader(format!("unsupported version {}", buf[4])));
        }
        let kind = FileKind::from_u8(buf[5])
            .ok_or_else(|| FileError::BadHeader(format!("unknown file kind {}", buf[5])))?;
        let generation = (&buf[6..14]).read_u64::<LittleEndian>()?;
        Ok(Self { kind, generation })
    }
}
