// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job id allocation and the legacy 16-bit id map.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use spoolwerk_core::JobId;
use spoolwerk_core::error::{QuotaKind, Result, SpoolError};

use crate::store::{PrinterDb, keys};

/// Advance the persisted counter under its lock and return the candidate id.
///
/// Ids run `1..=max_jobid` and wrap back to 1; 0 is never issued.
pub(crate) fn next_jobid(db: &PrinterDb, max_jobid: u32, timeout: Duration) -> Result<JobId> {
    let _guard = db.lock(keys::NEXT_JOBID, timeout)?;
    let current = match db.fetch_i64(keys::NEXT_JOBID) {
        Ok(v) => v.unwrap_or(0),
        Err(SpoolError::RecordCorrupt(reason)) => {
            warn!(printer = db.printer(), %reason, "job id counter unreadable, restarting at 1");
            0
        }
        Err(e) => return Err(e),
    };
    let next = if current <= 0 || current >= i64::from(max_jobid) {
        1
    } else {
        current + 1
    };
    db.put_i64(keys::NEXT_JOBID, next)?;
    // `next` is within 1..=max_jobid.
    Ok(JobId(next as u32))
}

/// Draw ids until one is free and reserve its row with an empty placeholder.
///
/// Gives up with `QuotaExceeded(JobIds)` after `attempts` collisions.
pub(crate) fn allocate_jobid(
    db: &PrinterDb,
    max_jobid: u32,
    attempts: u32,
    timeout: Duration,
) -> Result<JobId> {
    for attempt in 1..=attempts {
        let id = next_jobid(db, max_jobid, timeout)?;
        if db.insert_if_absent(&keys::job(id), &[])? {
            return Ok(id);
        }
        debug!(printer = db.printer(), jobid = %id, attempt, "job id in use, drawing again");
    }
    warn!(printer = db.printer(), attempts, "no free job id");
    Err(SpoolError::QuotaExceeded(QuotaKind::JobIds))
}

/// Id given to a job that appears in a backend listing without a spool file
/// name we recognise.  Lives above the range `next_jobid` hands out.
/// `None` when the backend number is negative or the id would not fit.
pub(crate) fn synthetic_jobid(max_jobid: u32, external: i32) -> Option<JobId> {
    let ext = u32::try_from(external).ok()?;
    max_jobid.checked_add(1)?.checked_add(ext).map(JobId)
}

#[derive(Debug)]
struct LegacyInner {
    to_narrow: HashMap<(String, JobId), u16>,
    to_wide: HashMap<u16, (String, JobId)>,
    next: u16,
}

/// Process-local bidirectional map between job ids and the narrow 16-bit ids
/// older clients use.
///
/// A narrow id is assigned on first translation and kept until the job is
/// deleted.
#[derive(Debug)]
pub struct LegacyIdMap {
    inner: Mutex<LegacyInner>,
}

impl Default for LegacyIdMap {
    fn default() -> Self {
        Self {
            inner: Mutex::new(LegacyInner {
                to_narrow: HashMap::new(),
                to_wide: HashMap::new(),
                next: 1,
            }),
        }
    }
}

impl LegacyIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, LegacyInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Narrow id for a job, assigning one if needed.  `None` when all 65535
    /// narrow ids are taken.
    pub fn narrow(&self, printer: &str, jobid: JobId) -> Option<u16> {
        let mut inner = self.inner();
        let key = (printer.to_owned(), jobid);
        if let Some(n) = inner.to_narrow.get(&key) {
            return Some(*n);
        }
        if inner.to_wide.len() >= usize::from(u16::MAX) {
            return None;
        }
        let mut candidate = inner.next;
        while candidate == 0 || inner.to_wide.contains_key(&candidate) {
            candidate = candidate.wrapping_add(1);
        }
        inner.next = candidate.wrapping_add(1);
        inner.to_narrow.insert(key.clone(), candidate);
        inner.to_wide.insert(candidate, key);
        Some(candidate)
    }

    /// Job a narrow id refers to.
    pub fn wide(&self, narrow: u16) -> Option<(String, JobId)> {
        self.inner().to_wide.get(&narrow).cloned()
    }

    pub fn remove(&self, printer: &str, jobid: JobId) {
        let mut inner = self.inner();
        if let Some(n) = inner.to_narrow.remove(&(printer.to_owned(), jobid)) {
            inner.to_wide.remove(&n);
        }
    }

    pub fn len(&self) -> usize {
        self.inner().to_wide.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
