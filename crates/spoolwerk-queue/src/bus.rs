// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Messages between cooperating spooler processes.
//
// `SharedBus` keeps one mailbox per process identity in a SQLite database
// under the state directory, so any spooler process on the host can post to
// any other.  Receivers poll their mailbox.  `LocalBus` is the in-process
// equivalent over tokio channels, for programs that embed both the engine
// and the refresh worker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use spoolwerk_core::ProcessId;
use spoolwerk_core::error::{Result, SpoolError};

/// Messages exchanged between spooler processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpoolMessage {
    /// Ask the designated worker to reconcile a printer's queue.
    RefreshPrinter { printer: String },
    /// One flushed batch of change notifications for a printer.
    Notify { printer: String, blob: Vec<u8> },
}

const KIND_REFRESH: i64 = 0;
const KIND_NOTIFY: i64 = 1;

impl SpoolMessage {
    fn into_row(self) -> (i64, String, Vec<u8>) {
        match self {
            Self::RefreshPrinter { printer } => (KIND_REFRESH, printer, Vec::new()),
            Self::Notify { printer, blob } => (KIND_NOTIFY, printer, blob),
        }
    }

    fn from_row(kind: i64, printer: String, blob: Vec<u8>) -> Result<Self> {
        match kind {
            KIND_REFRESH => Ok(Self::RefreshPrinter { printer }),
            KIND_NOTIFY => Ok(Self::Notify { printer, blob }),
            other => Err(SpoolError::Messaging(format!("unknown message kind {other}"))),
        }
    }
}

/// Delivery of [`SpoolMessage`]s to other processes.
pub trait MessageBus: Send + Sync {
    /// Send without blocking.  A full or missing mailbox is an error.
    fn send(&self, to: ProcessId, message: SpoolMessage) -> Result<()>;

    /// Undelivered messages waiting for `to`, if it has a mailbox.
    fn backlog(&self, to: ProcessId) -> Option<usize>;
}

// ---------------------------------------------------------------------------
// Shared (inter-process) bus
// ---------------------------------------------------------------------------

const BUS_FILE: &str = "bus.db";

const BUS_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

const CREATE_BUS_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS mailboxes (
        pid INTEGER PRIMARY KEY,
        token TEXT NOT NULL,
        capacity INTEGER NOT NULL,
        worker INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        recipient INTEGER NOT NULL,
        kind INTEGER NOT NULL,
        printer TEXT NOT NULL,
        blob BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS messages_by_recipient ON messages (recipient, seq);
"#;

fn bus_err(what: &'static str) -> impl FnOnce(rusqlite::Error) -> SpoolError {
    move |e| SpoolError::Messaging(format!("{what}: {e}"))
}

fn open_bus(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| SpoolError::Messaging(format!("open bus {}: {e}", path.display())))?;
    conn.busy_timeout(BUS_BUSY_TIMEOUT).map_err(bus_err("busy timeout"))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(bus_err("WAL pragma"))?;
    conn.execute_batch(CREATE_BUS_SQL)
        .map_err(bus_err("create tables"))?;
    Ok(conn)
}

enum Delivery {
    Queued,
    NoMailbox,
    Full(i64),
}

/// Mailboxes shared by every spooler process using the same state directory.
///
/// All methods are synchronous; async callers wrap them in
/// `spawn_blocking` like any other store access.
pub struct SharedBus {
    path: PathBuf,
    capacity: usize,
    poll: Duration,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SharedBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBus")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl SharedBus {
    /// Open (or create) the bus database in `dir`.  Mailboxes registered
    /// through this handle hold at most `capacity` messages.
    pub fn open(dir: &Path, capacity: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(BUS_FILE);
        let conn = open_bus(&path)?;
        debug!(path = %path.display(), "message bus opened");
        Ok(Self {
            path,
            capacity: capacity.max(1),
            poll: DEFAULT_POLL_INTERVAL,
            conn: Mutex::new(conn),
        })
    }

    /// How often an idle mailbox re-checks for messages.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll.max(Duration::from_millis(1));
        self
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
            .map_err(|_| SpoolError::Messaging(format!("{what}: bus connection poisoned")))?;
        f(&conn).map_err(bus_err(what))
    }

    /// Create the mailbox for `pid`, replacing any previous one and
    /// discarding what was queued for it.
    pub fn register(&self, pid: ProcessId) -> Result<Mailbox> {
        let token = Uuid::new_v4().to_string();
        let capacity = i64::try_from(self.capacity).unwrap_or(i64::MAX);
        self.with_conn("register", |conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM messages WHERE recipient = ?1", params![pid.0])?;
            tx.execute(
                "INSERT OR REPLACE INTO mailboxes (pid, token, capacity, worker) VALUES (?1, ?2, ?3, 0)",
                params![pid.0, token, capacity],
            )?;
            tx.commit()
        })?;
        let inbox = SharedInbox {
            conn: open_bus(&self.path)?,
            pid,
            token,
            poll: self.poll,
        };
        info!(%pid, capacity = self.capacity, "shared mailbox registered");
        Ok(Mailbox {
            pid,
            inbox: Inbox::Shared(inbox),
        })
    }

    /// Remove `pid`'s mailbox and everything queued for it.
    pub fn unregister(&self, pid: ProcessId) {
        let removed = self.with_conn("unregister", |conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM messages WHERE recipient = ?1", params![pid.0])?;
            tx.execute("DELETE FROM mailboxes WHERE pid = ?1", params![pid.0])?;
            tx.commit()
        });
        if let Err(e) = removed {
            warn!(%pid, error = %e, "failed to remove mailbox");
        }
    }

    /// Advertise `pid` as the designated refresh worker.  It must already
    /// have a mailbox.
    pub fn set_worker(&self, pid: ProcessId) -> Result<()> {
        let found = self.with_conn("set worker", |conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let found = tx
                .query_row("SELECT 1 FROM mailboxes WHERE pid = ?1", params![pid.0], |_| Ok(()))
                .optional()?
                .is_some();
            if found {
                tx.execute(
                    "UPDATE mailboxes SET worker = (pid = ?1)",
                    params![pid.0],
                )?;
                tx.commit()?;
            }
            Ok(found)
        })?;
        if !found {
            return Err(SpoolError::Messaging(format!("no mailbox for process {pid}")));
        }
        info!(%pid, "designated refresh worker");
        Ok(())
    }

    /// The advertised refresh worker, if one is registered.
    pub fn worker(&self) -> Result<Option<ProcessId>> {
        self.with_conn("find worker", |conn| {
            conn.query_row("SELECT pid FROM mailboxes WHERE worker = 1 LIMIT 1", [], |row| {
                row.get(0).map(ProcessId)
            })
            .optional()
        })
    }
}

impl MessageBus for SharedBus {
    fn send(&self, to: ProcessId, message: SpoolMessage) -> Result<()> {
        let (kind, printer, blob) = message.into_row();
        let delivery = self.with_conn("send", |conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let capacity: Option<i64> = tx
                .query_row("SELECT capacity FROM mailboxes WHERE pid = ?1", params![to.0], |row| row.get(0))
                .optional()?;
            let Some(capacity) = capacity else {
                return Ok(Delivery::NoMailbox);
            };
            let queued: i64 = tx.query_row(
                "SELECT COUNT(*) FROM messages WHERE recipient = ?1",
                params![to.0],
                |row| row.get(0),
            )?;
            if queued >= capacity {
                return Ok(Delivery::Full(queued));
            }
            tx.execute(
                "INSERT INTO messages (recipient, kind, printer, blob) VALUES (?1, ?2, ?3, ?4)",
                params![to.0, kind, printer, blob],
            )?;
            tx.commit()?;
            Ok(Delivery::Queued)
        })?;
        match delivery {
            Delivery::Queued => Ok(()),
            Delivery::NoMailbox => Err(SpoolError::Messaging(format!("no mailbox for process {to}"))),
            Delivery::Full(queued) => Err(SpoolError::Messaging(format!(
                "mailbox of process {to} is full ({queued} queued)"
            ))),
        }
    }

    fn backlog(&self, to: ProcessId) -> Option<usize> {
        let counted = self.with_conn("backlog", |conn| {
            let registered = conn
                .query_row("SELECT 1 FROM mailboxes WHERE pid = ?1", params![to.0], |_| Ok(()))
                .optional()?;
            if registered.is_none() {
                return Ok(None);
            }
            conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE recipient = ?1",
                params![to.0],
                |row| row.get::<_, i64>(0),
            )
            .map(Some)
        });
        match counted {
            Ok(queued) => queued.map(|n| usize::try_from(n).unwrap_or(0)),
            Err(e) => {
                warn!(pid = %to, error = %e, "mailbox backlog unknown");
                None
            }
        }
    }
}

enum Popped {
    Message(SpoolMessage),
    Empty,
    Closed,
}

type MessageRow = (i64, i64, String, Vec<u8>);

/// Take the oldest message for a mailbox.  `None` once the registration
/// identified by `token` is gone.
fn pop_row(conn: &Connection, pid: ProcessId, token: &str) -> rusqlite::Result<Option<Option<MessageRow>>> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let registered = tx
        .query_row(
            "SELECT 1 FROM mailboxes WHERE pid = ?1 AND token = ?2",
            params![pid.0, token],
            |_| Ok(()),
        )
        .optional()?;
    if registered.is_none() {
        return Ok(None);
    }
    let next: Option<MessageRow> = tx
        .query_row(
            "SELECT seq, kind, printer, blob FROM messages WHERE recipient = ?1 ORDER BY seq LIMIT 1",
            params![pid.0],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    if let Some((seq, ..)) = &next {
        tx.execute("DELETE FROM messages WHERE seq = ?1", params![seq])?;
    }
    tx.commit()?;
    Ok(Some(next))
}

#[derive(Debug)]
struct SharedInbox {
    conn: Connection,
    pid: ProcessId,
    token: String,
    poll: Duration,
}

impl SharedInbox {
    fn pop(&self) -> Result<Popped> {
        let row = pop_row(&self.conn, self.pid, &self.token).map_err(bus_err("receive"))?;
        Ok(match row {
            None => Popped::Closed,
            Some(None) => Popped::Empty,
            Some(Some((_, kind, printer, blob))) => Popped::Message(SpoolMessage::from_row(kind, printer, blob)?),
        })
    }
}

/// Withdraw a registration and its queue, unless it was already replaced.
fn close_row(conn: &Connection, pid: ProcessId, token: &str) -> rusqlite::Result<()> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let deleted = tx.execute(
        "DELETE FROM mailboxes WHERE pid = ?1 AND token = ?2",
        params![pid.0, token],
    )?;
    if deleted > 0 {
        tx.execute("DELETE FROM messages WHERE recipient = ?1", params![pid.0])?;
    }
    tx.commit()
}

impl Drop for SharedInbox {
    fn drop(&mut self) {
        if let Err(e) = close_row(&self.conn, self.pid, &self.token) {
            warn!(pid = %self.pid, error = %e, "failed to close shared mailbox");
        }
    }
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

/// In-process bus built on bounded tokio channels, one mailbox per process
/// identity.
#[derive(Debug)]
pub struct LocalBus {
    capacity: usize,
    mailboxes: Mutex<HashMap<ProcessId, mpsc::Sender<SpoolMessage>>>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Create the mailbox for `pid`, replacing any previous one.
    pub fn register(&self, pid: ProcessId) -> Result<Mailbox> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.mailboxes
            .lock()
            .map_err(|_| SpoolError::Messaging("mailbox table poisoned".into()))?
            .insert(pid, tx);
        debug!(%pid, capacity = self.capacity, "mailbox registered");
        Ok(Mailbox {
            pid,
            inbox: Inbox::Local(rx),
        })
    }

    pub fn unregister(&self, pid: ProcessId) {
        if let Ok(mut boxes) = self.mailboxes.lock() {
            boxes.remove(&pid);
        }
    }

    fn sender(&self, pid: ProcessId) -> Option<mpsc::Sender<SpoolMessage>> {
        self.mailboxes.lock().ok()?.get(&pid).cloned()
    }
}

impl MessageBus for LocalBus {
    fn send(&self, to: ProcessId, message: SpoolMessage) -> Result<()> {
        let tx = self
            .sender(to)
            .ok_or_else(|| SpoolError::Messaging(format!("no mailbox for process {to}")))?;
        tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SpoolError::Messaging(format!("mailbox of process {to} is full")),
            TrySendError::Closed(_) => {
                SpoolError::Messaging(format!("mailbox of process {to} is closed"))
            }
        })
    }

    fn backlog(&self, to: ProcessId) -> Option<usize> {
        let tx = self.sender(to)?;
        Some(tx.max_capacity() - tx.capacity())
    }
}

// ---------------------------------------------------------------------------
// Receiving end
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Inbox {
    Local(mpsc::Receiver<SpoolMessage>),
    Shared(SharedInbox),
}

/// Receiving end of one process's mailbox.
#[derive(Debug)]
pub struct Mailbox {
    pid: ProcessId,
    inbox: Inbox,
}

impl Mailbox {
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Wait for the next message; `None` once the mailbox is closed or
    /// replaced.
    pub async fn recv(&mut self) -> Option<SpoolMessage> {
        match &mut self.inbox {
            Inbox::Local(rx) => rx.recv().await,
            Inbox::Shared(inbox) => loop {
                match inbox.pop() {
                    Ok(Popped::Message(message)) => return Some(message),
                    Ok(Popped::Closed) => return None,
                    Ok(Popped::Empty) => {}
                    Err(e) => warn!(pid = %self.pid, error = %e, "mailbox read failed"),
                }
                tokio::time::sleep(inbox.poll).await;
            },
        }
    }

    pub fn try_recv(&mut self) -> Option<SpoolMessage> {
        match &mut self.inbox {
            Inbox::Local(rx) => rx.try_recv().ok(),
            Inbox::Shared(inbox) => match inbox.pop() {
                Ok(Popped::Message(message)) => Some(message),
                Ok(Popped::Empty | Popped::Closed) => None,
                Err(e) => {
                    warn!(pid = %self.pid, error = %e, "mailbox read failed");
                    None
                }
            },
        }
    }
}
