// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Persistent per-printer job store backed by SQLite.
//
// Each printer gets one database file holding a flat key/value `records`
// table (job rows, counters, the reconciled snapshot, refresh markers and the
// subscriber list) plus a `locks` table used for short-lived advisory locks
// shared by every cooperating process.  Open stores are kept in a bounded,
// reference-counted pool.

use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use spoolwerk_core::error::{Result, SpoolError};
use spoolwerk_core::{JobId, ProcessId};

use crate::host::HostProbe;

/// Bumped whenever the record layout changes; older stores are wiped on open.
const SCHEMA_VERSION: i64 = 1;

const CREATE_TABLES_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS records (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS locks (
        name TEXT PRIMARY KEY,
        holder INTEGER NOT NULL,
        token TEXT NOT NULL,
        acquired_at INTEGER NOT NULL
    );
"#;

/// SQLite-level wait before a write transaction reports SQLITE_BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Record keys.
pub mod keys {
    use spoolwerk_core::JobId;

    pub const VERSION: &str = "info/version";
    pub const NEXT_JOBID: &str = "info/nextjob";
    pub const TOTAL_JOBS: &str = "info/totaljobs";
    pub const CHANGED: &str = "info/changed";
    pub const SNAPSHOT: &str = "info/snapshot";
    pub const SUBSCRIBERS: &str = "subscribers";
    pub const JOB_PREFIX: &str = "job/";

    pub fn job(id: JobId) -> String {
        format!("{JOB_PREFIX}{}", id.0)
    }

    pub fn status(printer: &str) -> String {
        format!("status/{printer}")
    }

    pub fn cache(printer: &str) -> String {
        format!("cache/{printer}")
    }

    pub fn updating(printer: &str) -> String {
        format!("updating/{printer}")
    }

    pub fn pending(printer: &str) -> String {
        format!("pending/{printer}")
    }

    /// Advisory lock serialising refresh ownership.
    pub fn refresh_lock(printer: &str) -> String {
        format!("lock/{printer}")
    }

    /// Parse a `job/<id>` key.
    pub fn parse_job(key: &str) -> Option<JobId> {
        key.strip_prefix(JOB_PREFIX)?
            .parse::<u32>()
            .ok()
            .filter(|id| *id != 0)
            .map(JobId)
    }
}

fn db_err(what: &'static str) -> impl FnOnce(rusqlite::Error) -> SpoolError {
    move |e| SpoolError::Database(format!("{what}: {e}"))
}

fn decode_i64(key: &str, raw: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| SpoolError::RecordCorrupt(format!("{key}: expected 8 bytes, got {}", raw.len())))?;
    Ok(i64::from_le_bytes(bytes))
}

/// One open printer store.
///
/// All methods are synchronous because `rusqlite` does not support async
/// natively.  In an async context, wrap calls in `tokio::task::spawn_blocking`.
pub struct PrinterDb {
    printer: String,
    path: PathBuf,
    conn: Mutex<Connection>,
    host: Arc<dyn HostProbe>,
}

impl std::fmt::Debug for PrinterDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrinterDb")
            .field("printer", &self.printer)
            .field("path", &self.path)
            .finish()
    }
}

impl PrinterDb {
    /// Open (or create) the store for `printer` at `path`.
    ///
    /// Failure to open the file is reported as `BackendUnavailable` and is
    /// local to this printer.
    #[instrument(skip(host), fields(printer = %printer, path = %path.display()))]
    pub fn open(path: &Path, printer: &str, host: Arc<dyn HostProbe>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            SpoolError::BackendUnavailable(format!("open store {}: {e}", path.display()))
        })?;

        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err("busy timeout"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err("WAL pragma"))?;
        conn.execute_batch(CREATE_TABLES_SQL)
            .map_err(db_err("create tables"))?;

        let db = Self {
            printer: printer.to_owned(),
            path: path.to_owned(),
            conn: Mutex::new(conn),
            host,
        };
        db.check_version()?;

        debug!("printer store opened");
        Ok(db)
    }

    /// Wipe a store written with an older record layout.
    fn check_version(&self) -> Result<()> {
        match self.fetch_i64(keys::VERSION) {
            Ok(Some(SCHEMA_VERSION)) => return Ok(()),
            Ok(None) => {}
            Ok(Some(old)) => {
                info!(printer = %self.printer, old, new = SCHEMA_VERSION, "store layout changed, clearing records");
            }
            Err(SpoolError::RecordCorrupt(reason)) => {
                warn!(printer = %self.printer, %reason, "unreadable store version, clearing records");
            }
            Err(e) => return Err(e),
        }
        self.with_conn("reset store", |conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM records", [])?;
            tx.execute("DELETE FROM locks", [])?;
            tx.execute(
                "INSERT INTO records (key, value) VALUES (?1, ?2)",
                params![keys::VERSION, SCHEMA_VERSION.to_le_bytes().to_vec()],
            )?;
            tx.commit()
        })
    }

    pub fn printer(&self) -> &str {
        &self.printer
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(
        &self,
        what: &'static str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| SpoolError::Database(format!("{what}: connection mutex poisoned")))?;
        f(&conn).map_err(db_err(what))
    }

    // -- Raw records --

    pub fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_conn("fetch", |conn| {
            conn.query_row(
                "SELECT value FROM records WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.with_conn("put", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO records (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map(|_| ())
        })
    }

    /// Insert only if the key is free.  Returns whether the row was written.
    pub fn insert_if_absent(&self, key: &str, value: &[u8]) -> Result<bool> {
        self.with_conn("insert", |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO records (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map(|n| n == 1)
        })
    }

    /// Returns whether a row was removed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        self.with_conn("remove", |conn| {
            conn.execute("DELETE FROM records WHERE key = ?1", params![key])
                .map(|n| n > 0)
        })
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.with_conn("list keys", |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM records WHERE substr(key, 1, ?2) = ?1 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![prefix, prefix.len() as i64], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// Read-modify-write of one record inside a single write transaction.
    ///
    /// `f` sees the current value and returns the new one; `None` deletes it.
    pub fn update<T>(
        &self,
        key: &str,
        f: impl FnOnce(Option<Vec<u8>>) -> Result<(Option<Vec<u8>>, T)>,
    ) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| SpoolError::Database("update: connection mutex poisoned".into()))?;
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)
            .map_err(db_err("begin update"))?;
        let current: Option<Vec<u8>> = tx
            .query_row("SELECT value FROM records WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(db_err("update read"))?;

        // An error from `f` drops the transaction, which rolls it back.
        let (next, out) = f(current)?;
        let written = match next {
            Some(value) => tx.execute(
                "INSERT OR REPLACE INTO records (key, value) VALUES (?1, ?2)",
                params![key, value],
            ),
            None => tx.execute("DELETE FROM records WHERE key = ?1", params![key]),
        };
        written.map_err(db_err("update write"))?;
        tx.commit().map_err(db_err("commit update"))?;
        Ok(out)
    }

    // -- Typed helpers --

    pub fn fetch_i64(&self, key: &str) -> Result<Option<i64>> {
        self.fetch(key)?.map(|raw| decode_i64(key, &raw)).transpose()
    }

    pub fn put_i64(&self, key: &str, value: i64) -> Result<()> {
        self.put(key, &value.to_le_bytes())
    }

    /// Atomically add `delta` to a counter (absent counts as 0) and return the
    /// new value.
    pub fn add_i64(&self, key: &str, delta: i64) -> Result<i64> {
        self.update(key, |current| {
            let old = match current {
                Some(raw) => decode_i64(key, &raw)?,
                None => 0,
            };
            let new = old.saturating_add(delta);
            Ok((Some(new.to_le_bytes().to_vec()), new))
        })
    }

    /// Ids of every job row, ascending.
    pub fn job_ids(&self) -> Result<Vec<JobId>> {
        let mut ids: Vec<JobId> = self
            .keys_with_prefix(keys::JOB_PREFIX)?
            .iter()
            .filter_map(|k| keys::parse_job(k))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    // -- Advisory locks --

    /// Take the named advisory lock for the current process, waiting at most
    /// `timeout`.
    pub fn lock(&self, name: &str, timeout: Duration) -> Result<LockGuard<'_>> {
        self.lock_as(name, ProcessId::current(), timeout)
    }

    /// Take a lock on behalf of `holder`.  A lock whose holder process has
    /// died is broken.
    pub(crate) fn lock_as(
        &self,
        name: &str,
        holder: ProcessId,
        timeout: Duration,
    ) -> Result<LockGuard<'_>> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_lock(name, holder, &token)? {
                return Ok(LockGuard {
                    db: self,
                    name: name.to_owned(),
                    token,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(printer = %self.printer, lock = name, "lock wait timed out");
                return Err(SpoolError::LockTimeout(format!("{}:{name}", self.printer)));
            }
            std::thread::sleep(LOCK_POLL_INTERVAL.min(deadline - now));
        }
    }

    fn try_lock(&self, name: &str, holder: ProcessId, token: &str) -> Result<bool> {
        let host = &self.host;
        let printer = &self.printer;
        self.with_conn("lock", |conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let current: Option<u32> = tx
                .query_row("SELECT holder FROM locks WHERE name = ?1", params![name], |row| row.get(0))
                .optional()?;
            if let Some(pid) = current {
                if host.process_exists(ProcessId(pid)) {
                    return Ok(false);
                }
                warn!(%printer, lock = name, pid, "breaking lock held by dead process");
            }
            tx.execute(
                "INSERT OR REPLACE INTO locks (name, holder, token, acquired_at) VALUES (?1, ?2, ?3, ?4)",
                params![name, holder.0, token, Utc::now().timestamp()],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }
}

/// Held advisory lock; released on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    db: &'a PrinterDb,
    name: String,
    token: String,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let released = self.db.with_conn("unlock", |conn| {
            conn.execute(
                "DELETE FROM locks WHERE name = ?1 AND token = ?2",
                params![self.name, self.token],
            )
        });
        if let Err(e) = released {
            warn!(printer = %self.db.printer, lock = %self.name, error = %e, "failed to release lock");
        }
    }
}

// ---------------------------------------------------------------------------
// Store pool
// ---------------------------------------------------------------------------

struct PoolEntry {
    db: Arc<PrinterDb>,
    refs: usize,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<String, PoolEntry>,
    /// Front is the most recently promoted store.
    order: VecDeque<String>,
}

impl PoolInner {
    fn promote(&mut self, printer: &str) {
        if let Some(pos) = self.order.iter().position(|p| p == printer) {
            if let Some(name) = self.order.remove(pos) {
                self.order.push_front(name);
            }
        } else {
            self.order.push_front(printer.to_owned());
        }
    }

    /// Close the least recently promoted store nobody holds.
    fn evict_idle(&mut self) -> Option<String> {
        let pos = self
            .order
            .iter()
            .rposition(|p| self.entries.get(p).is_some_and(|e| e.refs == 0))?;
        let name = self.order.remove(pos)?;
        self.entries.remove(&name);
        Some(name)
    }
}

/// Bounded pool of open printer stores.
pub struct StorePool {
    dir: PathBuf,
    cap: usize,
    host: Arc<dyn HostProbe>,
    inner: Mutex<PoolInner>,
}

impl StorePool {
    pub fn new(dir: impl Into<PathBuf>, cap: usize, host: Arc<dyn HostProbe>) -> Self {
        Self {
            dir: dir.into(),
            cap: cap.max(1),
            host,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    fn inner(&self) -> Result<MutexGuard<'_, PoolInner>> {
        self.inner
            .lock()
            .map_err(|_| SpoolError::Database("store pool mutex poisoned".into()))
    }

    /// Database file for a printer.  Path separators and other unusual
    /// characters in the name are replaced.
    pub fn path_for(&self, printer: &str) -> PathBuf {
        let safe: String = printer
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.db"))
    }

    /// Open or reuse the store for `printer` and take a reference to it.
    pub fn acquire(&self, printer: &str) -> Result<StoreHandle<'_>> {
        let mut inner = self.inner()?;

        if let Some(entry) = inner.entries.get_mut(printer) {
            entry.refs += 1;
            let db = Arc::clone(&entry.db);
            inner.promote(printer);
            return Ok(StoreHandle { pool: self, db });
        }

        if inner.entries.len() >= self.cap {
            match inner.evict_idle() {
                Some(evicted) => debug!(%evicted, "closed idle printer store"),
                None => {
                    return Err(SpoolError::BackendUnavailable(format!(
                        "all {} printer stores are in use",
                        self.cap
                    )));
                }
            }
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| {
            SpoolError::BackendUnavailable(format!("create {}: {e}", self.dir.display()))
        })?;
        let db = Arc::new(PrinterDb::open(
            &self.path_for(printer),
            printer,
            Arc::clone(&self.host),
        )?);
        inner.entries.insert(
            printer.to_owned(),
            PoolEntry {
                db: Arc::clone(&db),
                refs: 1,
            },
        );
        inner.promote(printer);
        Ok(StoreHandle { pool: self, db })
    }

    fn release(&self, printer: &str) {
        match self.inner.lock() {
            Ok(mut inner) => {
                if let Some(entry) = inner.entries.get_mut(printer) {
                    entry.refs = entry.refs.saturating_sub(1);
                }
            }
            Err(_) => warn!(%printer, "store pool mutex poisoned on release"),
        }
    }

    pub fn open_count(&self) -> usize {
        self.inner().map(|i| i.entries.len()).unwrap_or(0)
    }

    /// Reference count of an open store, `None` if it is closed.
    pub fn refcount(&self, printer: &str) -> Option<usize> {
        self.inner().ok()?.entries.get(printer).map(|e| e.refs)
    }
}

/// Counted reference to an open store; releases it on drop.
pub struct StoreHandle<'a> {
    pool: &'a StorePool,
    db: Arc<PrinterDb>,
}

impl Deref for StoreHandle<'_> {
    type Target = PrinterDb;

    fn deref(&self) -> &PrinterDb {
        &self.db
    }
}

impl Drop for StoreHandle<'_> {
    fn drop(&mut self) {
        self.pool.release(&self.db.printer);
    }
}
