//! # CLI - ArborKV Interactive Shell
//!
//! A line-oriented shell over one ArborKV directory. Reads commands from
//! stdin, runs each in its own transaction and prints the result to stdout,
//! so it works both interactively and with piped scripts. Logs go to stderr.
//!
//! ## Commands
//!
//! ```text
//! SET key value      Insert or update a key (value may contain spaces)
//! GET key            Print the value or "(nil)"
//! DEL key            Delete a key
//! SCAN [prefix]      List pairs whose key starts with prefix
//! COMPACT            Run one compaction pass now
//! CHECKPOINT         Write a key-index checkpoint
//! STATS              Print engine state
//! EXIT / QUIT        Shut down cleanly
//! ```
//!
//! ## Configuration
//!
//! ```text
//! ARBOR_DIR          data directory (default: "data")
//! ARBOR_*            engine settings, see the config crate
//! RUST_LOG           log filter     (default: "warn")
//! ```

use anyhow::Result;
use config::Config;
use engine::{CancellationToken, KeyValueEngine};
use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let dir = std::env::var("ARBOR_DIR").unwrap_or_else(|_| "data".to_string());
    let config = Config::from_env()?;
    tracing::info!(dir = %dir, ?config, "opening store");
    let engine = KeyValueEngine::open(&dir, config)?;

    println!(
        "ArborKV started (dir={}, keys={}, txn={}, max_log={}KiB, sync={})",
        dir,
        engine.key_count(),
        engine.last_committed().transaction_id(),
        engine.config().max_tr_log_file_size / 1024,
        engine.config().sync_on_commit,
    );
    println!("Commands: SET key value | GET key | DEL key | SCAN [prefix]");
    println!("          COMPACT | CHECKPOINT | STATS | EXIT");
    prompt();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if !execute(&engine, &line) {
            println!("bye");
            break;
        }
        prompt();
    }
    Ok(())
}

fn prompt() {
    print!("> ");
    io::stdout().flush().ok();
}

/// Runs one command line. Returns `false` when the shell should exit.
fn execute(engine: &KeyValueEngine, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return true;
    };
    match cmd.to_uppercase().as_str() {
        "SET" => match parts.next() {
            Some(k) => {
                let v = parts.collect::<Vec<&str>>().join(" ");
                if v.is_empty() {
                    println!("ERR usage: SET key value");
                } else {
                    match engine.set(k.as_bytes(), v.as_bytes()) {
                        Ok(()) => println!("OK"),
                        Err(e) => println!("ERR set failed: {e:#}"),
                    }
                }
            }
            None => println!("ERR usage: SET key value"),
        },
        "GET" => match parts.next() {
            Some(k) => match engine.get(k.as_bytes()) {
                Ok(Some(v)) => println!("{}", String::from_utf8_lossy(&v)),
                Ok(None) => println!("(nil)"),
                Err(e) => println!("ERR read failed: {e:#}"),
            },
            None => println!("ERR usage: GET key"),
        },
        "DEL" => match parts.next() {
            Some(k) => match engine.delete(k.as_bytes()) {
                Ok(true) => println!("OK"),
                Ok(false) => println!("(nil)"),
                Err(e) => println!("ERR del failed: {e:#}"),
            },
            None => println!("ERR usage: DEL key"),
        },
        "SCAN" => {
            let prefix = parts.next().unwrap_or("").as_bytes();
            match engine.scan(prefix) {
                Ok(pairs) if pairs.is_empty() => println!("(empty)"),
                Ok(pairs) => {
                    for (k, v) in &pairs {
                        println!(
                            "{} -> {}",
                            String::from_utf8_lossy(k),
                            String::from_utf8_lossy(v)
                        );
                    }
                    println!("({} entries)", pairs.len());
                }
                Err(e) => println!("ERR scan failed: {e:#}"),
            }
        }
        "COMPACT" => match engine.compact(&CancellationToken::new()) {
            Ok(true) => println!("OK (files={})", engine.file_count()),
            Ok(false) => println!("OK (nothing to compact)"),
            Err(e) => println!("ERR compact failed: {e:#}"),
        },
        "CHECKPOINT" => match engine.create_index_file(&CancellationToken::new()) {
            Ok(id) => println!("OK (index file {id})"),
            Err(e) => println!("ERR checkpoint failed: {e:#}"),
        },
        "STATS" => {
            println!("{engine:?}");
            match engine.total_size() {
                Ok(bytes) => println!("total_size={bytes}"),
                Err(e) => println!("ERR stats failed: {e:#}"),
            }
        }
        "EXIT" | "QUIT" => return false,
        other => println!("unknown command: {other}"),
    }
    true
}
