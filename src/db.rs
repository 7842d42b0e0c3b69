// Ordered key-value store with per-key TTL, persisted as a single
// append-only journal file.
//
// The whole key-space lives in an in-memory BTreeMap so lexicographic scans
// are cheap; every mutation is appended to the journal as one JSON record
// per line and replayed on open (last record for a key wins). Readers filter
// by expiry time before returning values, so TTL semantics are exact even
// between sweeps. A sweeper drops expired entries and rewrites the journal
// once dead records dominate.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Journal rewrite happens once dead records outnumber live entries by this
/// factor, with a floor so small databases never bother.
const COMPACT_FACTOR: u64 = 2;
const COMPACT_MIN_RECORDS: u64 = 1024;

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    k: String,
    v: String,
    exp: i64,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: i64,
}

struct DbInner {
    entries: BTreeMap<String, Entry>,
    journal: BufWriter<File>,
    /// Journal records written since the last compaction (live + dead).
    records: u64,
}

/// Single-file key-value store with per-key TTL.
pub struct Db {
    path: PathBuf,
    inner: RwLock<DbInner>,
}

/// Write transaction handle. All `set` calls made through one transaction
/// are flushed to the journal together.
pub struct WriteTxn<'a> {
    now: i64,
    entries: &'a mut BTreeMap<String, Entry>,
    pending: Vec<Record>,
}

impl WriteTxn<'_> {
    /// Insert or replace a key with the given time-to-live.
    pub fn set(&mut self, key: &str, value: &str, ttl: Duration) {
        let expires_at = self.now + ttl.as_secs() as i64;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        self.pending.push(Record {
            k: key.to_string(),
            v: value.to_string(),
            exp: expires_at,
        });
    }

    /// Read a live value, including writes made earlier in this transaction.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|e| e.expires_at > self.now)
            .map(|e| e.value.clone())
    }

    /// Ascending scan of live entries under a key prefix.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        scan(&*self.entries, self.now, prefix, false)
    }
}

fn scan(
    entries: &BTreeMap<String, Entry>,
    now: i64,
    prefix: &str,
    descending: bool,
) -> Vec<(String, String)> {
    let iter = entries
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .filter(|(_, e)| e.expires_at > now)
        .map(|(k, e)| (k.clone(), e.value.clone()));
    if descending {
        let mut rows: Vec<_> = iter.collect();
        rows.reverse();
        rows
    } else {
        iter.collect()
    }
}

impl Db {
    /// Open (or create) the database at `path`, creating the parent
    /// directory as needed and replaying the journal.
    pub async fn open(path: impl AsRef<Path>) -> Result<Db> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755));
            }
        }

        let now = unix_now();
        let mut entries = BTreeMap::new();
        let mut records = 0u64;
        if path.exists() {
            let reader = BufReader::new(
                File::open(&path).with_context(|| format!("opening {}", path.display()))?,
            );
            for line in reader.lines() {
                let line = line.with_context(|| format!("reading {}", path.display()))?;
                if line.trim().is_empty() {
                    continue;
                }
                records += 1;
                match serde_json::from_str::<Record>(&line) {
                    Ok(rec) => {
                        entries.insert(
                            rec.k,
                            Entry {
                                value: rec.v,
                                expires_at: rec.exp,
                            },
                        );
                    }
                    Err(e) => {
                        warn!("Skipping undecodable journal record: {}", e);
                    }
                }
            }
        }
        // Journal replay applies records in order, so expired keys may still
        // be present; drop them now that the final state is known.
        entries.retain(|_, e| e.expires_at > now);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening journal {}", path.display()))?;

        info!(
            "Opened database {} ({} live keys, {} journal records)",
            path.display(),
            entries.len(),
            records
        );

        Ok(Db {
            path,
            inner: RwLock::new(DbInner {
                entries,
                journal: BufWriter::new(file),
                records,
            }),
        })
    }

    /// Run a write transaction. All mutations are applied to the in-memory
    /// map and flushed to the journal in one step; writers serialise on the
    /// write lock.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut WriteTxn) -> Result<()>,
    {
        self.update_at(unix_now(), f).await
    }

    pub(crate) async fn update_at<F>(&self, now: i64, f: F) -> Result<()>
    where
        F: FnOnce(&mut WriteTxn) -> Result<()>,
    {
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;
        let mut txn = WriteTxn {
            now,
            entries: &mut inner.entries,
            pending: Vec::new(),
        };
        f(&mut txn)?;
        let pending = txn.pending;
        for rec in &pending {
            let line = serde_json::to_string(rec).context("encoding journal record")?;
            inner.journal.write_all(line.as_bytes())?;
            inner.journal.write_all(b"\n")?;
        }
        if !pending.is_empty() {
            inner
                .journal
                .flush()
                .with_context(|| format!("flushing journal {}", self.path.display()))?;
            inner.records += pending.len() as u64;
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.get_at(unix_now(), key).await
    }

    pub(crate) async fn get_at(&self, now: i64, key: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone())
    }

    /// Ascending scan of live entries under a key prefix.
    pub async fn scan_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.scan_prefix_at(unix_now(), prefix).await
    }

    pub(crate) async fn scan_prefix_at(&self, now: i64, prefix: &str) -> Vec<(String, String)> {
        let inner = self.inner.read().await;
        scan(&inner.entries, now, prefix, false)
    }

    /// Descending scan of live entries under a key prefix.
    pub async fn scan_prefix_rev(&self, prefix: &str) -> Vec<(String, String)> {
        self.scan_prefix_rev_at(unix_now(), prefix).await
    }

    pub(crate) async fn scan_prefix_rev_at(&self, now: i64, prefix: &str) -> Vec<(String, String)> {
        let inner = self.inner.read().await;
        scan(&inner.entries, now, prefix, true)
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = unix_now();
        let inner = self.inner.read().await;
        inner
            .entries
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    /// Drop expired entries and rewrite the journal when dead records
    /// dominate. Returns the number of entries removed.
    pub async fn sweep(&self) -> Result<usize> {
        self.sweep_at(unix_now()).await
    }

    pub(crate) async fn sweep_at(&self, now: i64) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.expires_at > now);
        let removed = before - inner.entries.len();

        let live = inner.entries.len() as u64;
        if inner.records > live * COMPACT_FACTOR + COMPACT_MIN_RECORDS {
            self.compact_locked(&mut inner)?;
        }
        if removed > 0 {
            debug!("Swept {} expired keys", removed);
        }
        Ok(removed)
    }

    /// Flush and compact. Called once on shutdown.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        let now = unix_now();
        inner.entries.retain(|_, e| e.expires_at > now);
        self.compact_locked(&mut inner)?;
        info!("Closed database {}", self.path.display());
        Ok(())
    }

    /// Rewrite the journal from the live map via a temp file + rename.
    fn compact_locked(&self, inner: &mut DbInner) -> Result<()> {
        inner.journal.flush()?;

        let tmp_path = self.path.with_extension("compact");
        {
            let tmp = File::create(&tmp_path)
                .with_context(|| format!("creating {}", tmp_path.display()))?;
            let mut writer = BufWriter::new(tmp);
            for (k, e) in &inner.entries {
                let rec = Record {
                    k: k.clone(),
                    v: e.value.clone(),
                    exp: e.expires_at,
                };
                writer.write_all(serde_json::to_string(&rec)?.as_bytes())?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replacing journal {}", self.path.display()))?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        inner.journal = BufWriter::new(file);
        inner.records = inner.entries.len() as u64;
        debug!("Compacted journal to {} records", inner.records);
        Ok(())
    }
}
