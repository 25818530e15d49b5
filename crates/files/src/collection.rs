//! The directory of numbered data files.
//!
//! Every file is named `{id:08}.{ext}` where the extension names its
//! [`FileKind`]. Ids are allocated monotonically and never reused while the
//! collection is open.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::header::{FileHeader, FileKind, HEADER_LEN};
use crate::FileError;

/// One data file of the collection, open for random reads.
pub struct DataFile {
    id: u32,
    path: PathBuf,
    /// `None` when the header could not be parsed; such files are treated as
    /// unknown and become deletion candidates.
    header: Option<FileHeader>,
    file: Mutex<File>,
}

impl std::fmt::Debug for DataFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("header", &self.header)
            .finish()
    }
}

impl DataFile {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn header(&self) -> Option<FileHeader> {
        self.header
    }

    #[must_use]
    pub fn kind(&self) -> Option<FileKind> {
        self.header.map(|h| h.kind)
    }

    #[must_use]
    pub fn generation(&self) -> Option<u64> {
        self.header.map(|h| h.generation)
    }

    /// Current on-disk length, header included.
    pub fn size(&self) -> io::Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// Fills `buf` with the bytes starting at absolute `offset`.
    pub fn random_read(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    /// Reads as many bytes as are available at `offset`, up to `buf.len()`.
    /// Returns the number of bytes read.
    pub fn read_at_most(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// Reads the whole file, header included.
    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Forces the file contents to stable storage.
    pub fn hard_flush(&self) -> io::Result<()> {
        self.file.lock().sync_all()
    }
}

/// Sequential appender for a freshly created file.
///
/// Positions are absolute: the first byte after the header is at
/// [`HEADER_LEN`].
pub struct AppendWriter {
    file_id: u32,
    out: BufWriter<File>,
    position: u64,
}

impl AppendWriter {
    #[must_use]
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Absolute offset the next written byte will land at.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Appends `data` and returns the offset it starts at. The bytes may sit
    /// in the write buffer until [`flush`](Self::flush).
    pub fn write_block(&mut self, data: &[u8]) -> io::Result<u64> {
        let start = self.position;
        self.out.write_all(data)?;
        self.position += data.len() as u64;
        Ok(start)
    }

    /// Hands buffered bytes to the OS so readers of the same file see them.
    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    /// Flushes and fsyncs the file data.
    pub fn hard_flush(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_data()
    }
}

/// All data files of one database directory.
pub struct FileCollection {
    dir: PathBuf,
    files: RwLock<BTreeMap<u32, Arc<DataFile>>>,
    next_id: AtomicU32,
}

impl std::fmt::Debug for FileCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCollection")
            .field("dir", &self.dir)
            .field("file_count", &self.count())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl FileCollection {
    /// Opens (creating if needed) the directory and indexes every data file
    /// in it. Files with an unreadable header are kept with no header.
    /// Names that do not follow the `{id}.{ext}` pattern are ignored.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, FileError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut files = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some((id, ext_kind)) = parse_file_name(&path) else {
                continue;
            };
            let data_file = open_data_file(id, path, ext_kind)?;
            files.insert(id, Arc::new(data_file));
        }

        let next_id = files.keys().next_back().map_or(1, |id| id + 1);
        debug!(dir = %dir.display(), files = files.len(), next_id, "opened file collection");
        Ok(Self {
            dir,
            files: RwLock::new(files),
            next_id: AtomicU32::new(next_id),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates a new file with a fresh id, writes its header and returns the
    /// read handle plus an appender positioned after the header.
    pub fn create_file(
        &self,
        kind: FileKind,
        generation: u64,
    ) -> Result<(Arc<DataFile>, AppendWriter), FileError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(file_name(id, kind));
        let header = FileHeader { kind, generation };

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut out = BufWriter::new(file);
        out.write_all(&header.encode())?;
        out.flush()?;
        out.get_ref().sync_all()?;
        sync_dir(&self.dir);

        let read_handle = OpenOptions::new().read(true).open(&path)?;
        let data_file = Arc::new(DataFile {
            id,
            path,
            header: Some(header),
            file: Mutex::new(read_handle),
        });
        self.files.write().insert(id, Arc::clone(&data_file));
        debug!(file_id = id, ?kind, generation, "created data file");

        Ok((
            data_file,
            AppendWriter {
                file_id: id,
                out,
                position: HEADER_LEN,
            },
        ))
    }

    #[must_use]
    pub fn get_file(&self, id: u32) -> Option<Arc<DataFile>> {
        self.files.read().get(&id).cloned()
    }

    /// Like [`get_file`](Self::get_file) but reports a missing id as an error.
    pub fn file(&self, id: u32) -> Result<Arc<DataFile>, FileError> {
        self.get_file(id).ok_or(FileError::UnknownFile(id))
    }

    /// All files in ascending id order.
    #[must_use]
    pub fn enumerate(&self) -> Vec<Arc<DataFile>> {
        self.files.read().values().cloned().collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.files.read().len()
    }

    /// Removes the file from the collection and from disk. Deleting a file
    /// that is already gone from disk is not an error.
    pub fn delete_file(&self, id: u32) -> Result<(), FileError> {
        let removed = self.files.write().remove(&id);
        let Some(data_file) = removed else {
            return Err(FileError::UnknownFile(id));
        };
        match fs::remove_file(&data_file.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        sync_dir(&self.dir);
        debug!(file_id = id, "deleted data file");
        Ok(())
    }

    /// Sum of the on-disk sizes of all files.
    pub fn total_size(&self) -> io::Result<u64> {
        let mut total = 0;
        for f in self.enumerate() {
            total += f.size()?;
        }
        Ok(total)
    }
}

fn file_name(id: u32, kind: FileKind) -> String {
    format!("{:08}.{}", id, kind.extension())
}

fn parse_file_name(path: &Path) -> Option<(u32, Option<FileKind>)> {
    if !path.is_file() {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let ext = path.extension()?.to_str()?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let id = stem.parse::<u32>().ok()?;
    Some((id, FileKind::from_extension(ext)))
}

fn open_data_file(
    id: u32,
    path: PathBuf,
    ext_kind: Option<FileKind>,
) -> Result<DataFile, FileError> {
    let mut file = OpenOptions::new().read(true).open(&path)?;
    let mut buf = [0u8; HEADER_LEN as usize];
    let read = read_prefix(&mut file, &mut buf)?;

    let header = match FileHeader::decode(&buf[..read]) {
        Ok(h) if Some(h.kind) == ext_kind => Some(h),
        Ok(h) => {
            warn!(file_id = id, kind = ?h.kind, "file extension does not match header kind");
            None
        }
        Err(e) => {
            warn!(file_id = id, error = %e, "ignoring file with unreadable header");
            None
        }
    };

    Ok(DataFile {
        id,
        path,
        header,
        file: Mutex::new(file),
    })
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Best-effort fsync of the directory so created and removed names persist.
fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}
