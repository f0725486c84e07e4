//! # CLI — Interactive Store Shell
//!
//! A REPL-style debug shell for the storage engine. Reads commands from
//! stdin, executes them against the store, and prints results to stdout.
//! Designed for both interactive use and scripted testing (pipe commands
//! via stdin).
//!
//! ## Commands
//!
//! ```text
//! SET key value            Insert or update a key-value pair
//! GET key                  Look up a key (prints value or "(nil)")
//! DEL key                  Delete a key (writes a tombstone)
//! SETIDX key value idx v   Insert and register under index idx = v
//! FIND idx value           Exact secondary-index lookup
//! SCAN [start]             Ordered dump of all live pairs
//! FLUSH                    Force the memtable to a level-0 page
//! CHECK                    Re-walk every page verifying order and format
//! STATS                    Print store shape and cache counters
//! TRUNCATE                 Wipe the store
//! EXIT / QUIT              Shut down gracefully
//! ```
//!
//! ## Configuration
//!
//! All settings are controlled via environment variables:
//!
//! ```text
//! STORE_DIR          store directory            (default: "data")
//! STORE_MEMTABLE_KB  memtable threshold in KiB  (default: 1024)
//! STORE_SYNC         fsync every journal append (default: "true")
//! ```

use anyhow::Result;
use config::StoreOptions;
use engine::Store;
use std::io::{self, BufRead, Write};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn main() -> Result<()> {
    env_logger::init();

    let dir = env_or("STORE_DIR", "data");
    let memtable_kb: usize = env_or("STORE_MEMTABLE_KB", "1024").parse().unwrap_or(1024);
    let sync: bool = env_or("STORE_SYNC", "true").parse().unwrap_or(true);

    let opts = StoreOptions {
        max_memtable_size: memtable_kb * 1024,
        journal_sync: sync,
        ..StoreOptions::default()
    };
    let store = Store::open(&dir, opts)?;
    println!(
        "store ready (dir={}, memtable={}KiB, sync={})",
        dir, memtable_kb, sync
    );

    let stdin = io::stdin();
    let mut out = io::stdout();
    loop {
        print!("> ");
        out.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((&cmd, args)) = parts.split_first() else { continue };

        let outcome = dispatch(&store, &cmd.to_ascii_uppercase(), args);
        match outcome {
            Ok(Reply::Text(text)) => println!("{}", text),
            Ok(Reply::Quit) => break,
            Err(e) => println!("ERR {:#}", e),
        }
    }

    store.close()?;
    println!("bye");
    Ok(())
}

enum Reply {
    Text(String),
    Quit,
}

fn dispatch(store: &Store, cmd: &str, args: &[&str]) -> Result<Reply> {
    let text = match (cmd, args) {
        ("SET", [key, value]) => {
            store.set(key.as_bytes(), value.as_bytes())?;
            "OK".to_string()
        }
        ("GET", [key]) => match store.get(key.as_bytes())? {
            Some(value) => String::from_utf8_lossy(&value).into_owned(),
            None => "(nil)".to_string(),
        },
        ("DEL", [key]) => {
            store.delete(key.as_bytes())?;
            "OK".to_string()
        }
        ("SETIDX", [key, value, index, index_value]) => {
            store.set_with_index(
                key.as_bytes(),
                value.as_bytes(),
                &[(index, index_value.as_bytes())],
            )?;
            "OK".to_string()
        }
        ("FIND", [index, value]) => {
            let found = store.find(index, value.as_bytes())?;
            let mut lines: Vec<String> = found
                .iter()
                .map(|(k, v)| {
                    format!("{} -> {}", String::from_utf8_lossy(k), String::from_utf8_lossy(v))
                })
                .collect();
            lines.push(format!("({} entries)", found.len()));
            lines.join("\n")
        }
        ("SCAN", rest) => {
            let iter = match rest {
                [] => store.enumerate()?,
                [start] => store.enumerate_from(start.as_bytes())?,
                _ => anyhow::bail!("usage: SCAN [start]"),
            };
            let mut lines = Vec::new();
            for entry in iter {
                let (k, v) = entry?;
                lines.push(format!(
                    "{} -> {}",
                    String::from_utf8_lossy(&k),
                    String::from_utf8_lossy(&v)
                ));
            }
            lines.push(format!("({} entries)", lines.len()));
            lines.join("\n")
        }
        ("FLUSH", []) => {
            store.flush()?;
            "OK".to_string()
        }
        ("CHECK", []) => {
            let report = store.scan_check()?;
            if report.is_clean() {
                format!("OK ({} pages, {} records)", report.pages, report.records)
            } else {
                report.problems.join("\n")
            }
        }
        ("STATS", []) => format!("{:#?}", store.stats()),
        ("TRUNCATE", []) => {
            store.truncate()?;
            "OK".to_string()
        }
        ("EXIT", []) | ("QUIT", []) => return Ok(Reply::Quit),
        _ => anyhow::bail!("unknown command or bad arguments: {}", cmd),
    };
    Ok(Reply::Text(text))
}
