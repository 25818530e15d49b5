//! # Files - On-Disk Layout
//!
//! Everything ArborKV persists lives in one directory of numbered,
//! append-only data files. This crate owns that directory: naming, the common
//! header, random reads, sequential appends and the key-index checkpoint
//! format. It knows nothing about transactions.
//!
//! ```text
//! db/
//!   00000001.trl   transaction log     (framed records, see the trlog crate)
//!   00000002.pvl   pure values         (compactor output, raw value bytes)
//!   00000003.kvi   key index           (serialized tree snapshot)
//! ```
//!
//! Files are written once, front to back, and then only ever read or deleted.

mod collection;
mod error;
pub mod header;
mod key_index;
pub mod varint;

pub use collection::{AppendWriter, DataFile, FileCollection};
pub use error::FileError;
pub use header::{FileHeader, FileKind, HEADER_LEN};
pub use key_index::{read_key_index, write_key_index, KeyIndexInfo, KeyIndexWriter};

#[cfg(test)]
mod tests;
