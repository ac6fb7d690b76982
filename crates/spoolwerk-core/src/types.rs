// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Spoolwerk spooler.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, Decoder, Encoder};

/// File name prefix of every spool file created by `start`.
///
/// Reconciliation recovers the local job id from a backend listing by parsing
/// `<prefix><8-digit id>.<suffix>` out of the entry's file name.
pub const SPOOL_PREFIX: &str = "spool.";

/// Per-printer job identifier.  Never 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operating-system process identity of a cooperating spooler process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// Identity of the calling process.
    pub fn current() -> Self {
        Self(std::process::id())
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who is asking.  `user` drives ownership and operator checks; `pid` is the
/// process that will own the spool file of a job it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user: String,
    pub pid: ProcessId,
}

impl Caller {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pid: ProcessId::current(),
        }
    }
}

/// How a client closed its spool file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Document complete; submit it.
    Normal,
    /// The client is going away (session torn down).
    Shutdown,
    /// Transfer failed part-way.
    Error,
}

/// Lifecycle states of a print job.
///
/// The numeric codes are what gets persisted and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Paused,
    Spooling,
    Printing,
    Deleting,
    Offline,
    PaperOut,
    Printed,
    Deleted,
    Blocked,
    UserIntervention,
}

impl JobStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Paused => 1,
            Self::Spooling => 2,
            Self::Printing => 3,
            Self::Deleting => 5,
            Self::Offline => 6,
            Self::PaperOut => 7,
            Self::Printed => 8,
            Self::Deleted => 9,
            Self::Blocked => 10,
            Self::UserIntervention => 11,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, CodecError> {
        Ok(match code {
            0 => Self::Queued,
            1 => Self::Paused,
            2 => Self::Spooling,
            3 => Self::Printing,
            5 => Self::Deleting,
            6 => Self::Offline,
            7 => Self::PaperOut,
            8 => Self::Printed,
            9 => Self::Deleted,
            10 => Self::Blocked,
            11 => Self::UserIntervention,
            other => {
                return Err(CodecError::UnknownCode {
                    what: "job status",
                    code: u32::from(other),
                });
            }
        })
    }

    /// Status bit flags carried by job-status notifications.
    pub fn notify_flags(self) -> u32 {
        match self {
            Self::Queued => 0,
            Self::Paused => 0x001,
            Self::Deleting => 0x004,
            Self::Spooling => 0x008,
            Self::Printing => 0x010,
            Self::Offline => 0x020,
            Self::PaperOut => 0x040,
            Self::Printed => 0x080,
            Self::Deleted => 0x100,
            Self::Blocked => 0x200,
            Self::UserIntervention => 0x400,
        }
    }
}

/// One job row in a printer's store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintJob {
    /// Key of the row; not part of the encoded value.
    pub jobid: JobId,
    /// Process holding the spool file open, if any.
    pub owner: Option<ProcessId>,
    /// Job number assigned by the backend once it accepted the document.
    pub external_job_id: Option<i32>,
    pub spool_file: PathBuf,
    /// Unix seconds.
    pub start_time: i64,
    pub status: JobStatus,
    pub size: u64,
    pub page_count: u32,
    /// Handed to the backend.
    pub spooled: bool,
    /// Submitted through this spooler rather than discovered in a backend listing.
    pub originated_locally: bool,
    pub job_name: String,
    pub user: String,
    pub queue_name: String,
    /// Opaque client settings (device mode), stored verbatim.
    pub settings: Vec<u8>,
}

impl PrintJob {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(128 + self.settings.len());
        enc.u32(self.owner.map_or(0, |p| p.0))
            .i32(self.external_job_id.unwrap_or(-1))
            .str(&self.spool_file.to_string_lossy())
            .i64(self.start_time)
            .u8(self.status.code())
            .u64(self.size)
            .u32(self.page_count)
            .bool(self.spooled)
            .bool(self.originated_locally)
            .str(&self.job_name)
            .str(&self.user)
            .str(&self.queue_name)
            .bytes(&self.settings);
        enc.finish()
    }

    pub fn decode(jobid: JobId, buf: &[u8]) -> Result<Self, CodecError> {
        let mut dec = Decoder::new(buf);
        let owner = match dec.u32()? {
            0 => None,
            pid => Some(ProcessId(pid)),
        };
        let external_job_id = match dec.i32()? {
            -1 => None,
            n => Some(n),
        };
        let job = Self {
            jobid,
            owner,
            external_job_id,
            spool_file: PathBuf::from(dec.str()?),
            start_time: dec.i64()?,
            status: JobStatus::from_code(dec.u8()?)?,
            size: dec.u64()?,
            page_count: dec.u32()?,
            spooled: dec.bool()?,
            originated_locally: dec.bool()?,
            job_name: dec.str()?.to_owned(),
            user: dec.str()?.to_owned(),
            queue_name: dec.str()?.to_owned(),
            settings: dec.bytes()?.to_vec(),
        };
        dec.finish()?;
        Ok(job)
    }
}

/// Recover a job id from a spool file name such as `spool.00000042.Xa9fQ1`.
///
/// Accepts a bare file name or a path.  Returns `None` for anything that does
/// not carry the prefix followed by a positive decimal id.
pub fn parse_spool_jobid(file_name: &str) -> Option<JobId> {
    let base = Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(file_name);
    let rest = base.strip_prefix(SPOOL_PREFIX)?;
    let digits: &str = rest.split('.').next()?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match digits.parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(id) => Some(JobId(id)),
    }
}

/// One job as listed by the external print system.  Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalQueueEntry {
    /// Job number inside the backend.
    pub job: i32,
    pub size: u64,
    pub status: JobStatus,
    pub user: String,
    /// Document or spool file name as the backend reports it.
    pub file_name: String,
    pub priority: u32,
    /// Unix seconds.
    pub submitted_at: i64,
}

/// Printer-level state reported alongside a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStatus {
    pub fatal_stop: bool,
    pub message: String,
}

/// One row of the trimmed, ordered queue view handed to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub jobid: JobId,
    pub size: u64,
    pub pages: u32,
    pub status: JobStatus,
    pub priority: u32,
    /// Unix seconds.
    pub time: i64,
    pub user: String,
    pub name: String,
}

impl SnapshotEntry {
    pub fn from_job(job: &PrintJob) -> Self {
        Self {
            jobid: job.jobid,
            size: job.size,
            pages: job.page_count,
            status: job.status,
            priority: 1,
            time: job.start_time,
            user: job.user.clone(),
            name: job.job_name.clone(),
        }
    }
}

/// Serialize the linear snapshot kept under `info/snapshot`.
pub fn encode_snapshot(entries: &[SnapshotEntry]) -> Vec<u8> {
    let mut enc = Encoder::with_capacity(16 + entries.len() * 64);
    enc.u32(entries.len() as u32);
    for e in entries {
        enc.u32(e.jobid.0)
            .u64(e.size)
            .u32(e.pages)
            .u8(e.status.code())
            .u32(e.priority)
            .i64(e.time)
            .str(&e.user)
            .str(&e.name);
    }
    enc.finish()
}

pub fn decode_snapshot(buf: &[u8]) -> Result<Vec<SnapshotEntry>, CodecError> {
    let mut dec = Decoder::new(buf);
    let count = dec.u32()? as usize;
    let mut out = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        out.push(SnapshotEntry {
            jobid: JobId(dec.u32()?),
            size: dec.u64()?,
            pages: dec.u32()?,
            status: JobStatus::from_code(dec.u8()?)?,
            priority: dec.u32()?,
            time: dec.i64()?,
            user: dec.str()?.to_owned(),
            name: dec.str()?.to_owned(),
        });
    }
    dec.finish()?;
    Ok(out)
}

/// Status summary stored as JSON under `status/<printer>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Jobs counted active by the last reconciliation.
    pub job_count: usize,
    /// The backend reports the queue as stopped.
    pub fatal_stop: bool,
    pub message: String,
}
