use crate::{Config, KeyValueEngine};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Foreground-only engine settings: no compactor thread, no fsync per commit.
pub fn quiet_config() -> Config {
    Config::default()
        .background_compaction(false)
        .sync_on_commit(false)
}

/// Like [`quiet_config`] with a 64 KiB log switch size.
pub fn small_log_config() -> Config {
    quiet_config().max_tr_log_file_size(64 * 1024)
}

pub fn key(i: usize) -> Vec<u8> {
    format!("k{:03}", i).into_bytes()
}

/// `len` bytes that differ per `seed`.
pub fn value(seed: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((seed * 31 + i * 7) % 251) as u8).collect()
}

pub fn count_files(dir: &Path, ext: &str) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|x| x == ext)
                .unwrap_or(false)
        })
        .count()
}

/// File name -> contents for every file in `dir`.
pub fn dir_contents(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| {
            (
                e.file_name().to_string_lossy().into_owned(),
                fs::read(e.path()).unwrap(),
            )
        })
        .collect()
}

/// Every pair in the store, read through one transaction.
pub fn all_pairs(engine: &KeyValueEngine) -> Vec<(Vec<u8>, Vec<u8>)> {
    engine.scan(b"").unwrap()
}
