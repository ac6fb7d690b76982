// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job rows, the changed-job list and the job counter.

use tracing::{debug, warn};

use spoolwerk_core::error::{Result, SpoolError};
use spoolwerk_core::{JobId, JobStatus, PrintJob};

use crate::context::SpoolContext;
use crate::notify::{NotifyField, NotifyValue};
use crate::store::{PrinterDb, keys};

fn encode_ids(ids: &[JobId]) -> Vec<u8> {
    ids.iter().flat_map(|id| id.0.to_le_bytes()).collect()
}

fn decode_ids(raw: &[u8]) -> Result<Vec<JobId>> {
    if raw.len() % 4 != 0 {
        return Err(SpoolError::RecordCorrupt(format!(
            "{}: length {} is not a multiple of 4",
            keys::CHANGED,
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(4)
        .map(|c| JobId(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
        .collect())
}

/// Split a unix timestamp into the two notification integers.
fn time_ints(t: i64) -> NotifyValue {
    let bits = t as u64;
    NotifyValue::Ints(bits as u32, (bits >> 32) as u32)
}

impl SpoolContext {
    /// Look up one job.
    pub fn job(&self, printer: &str, jobid: JobId) -> Result<PrintJob> {
        self.printer_config(printer)?;
        let db = self.stores.acquire(printer)?;
        self.fetch_job(&db, jobid)?
            .ok_or(SpoolError::NotFound(jobid))
    }

    /// Load a job row.  Rows that fail to decode and empty placeholders left
    /// by the id allocator read as absent.
    pub(crate) fn fetch_job(&self, db: &PrinterDb, jobid: JobId) -> Result<Option<PrintJob>> {
        let Some(raw) = db.fetch(&keys::job(jobid))? else {
            return Ok(None);
        };
        if raw.is_empty() {
            return Ok(None);
        }
        match PrintJob::decode(jobid, &raw) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                warn!(printer = db.printer(), %jobid, error = %e, "corrupt job row treated as absent");
                Ok(None)
            }
        }
    }

    /// Write a job row and queue a notification for every observable field
    /// that differs from the stored row.  A new row notifies every field.
    ///
    /// Only for rows nobody else can be editing: freshly allocated ids and
    /// backend-only rows written under refresh ownership.  Changes to an
    /// existing job go through [`modify_job`](Self::modify_job).
    pub(crate) fn store_job(&self, db: &PrinterDb, job: &PrintJob) -> Result<()> {
        let old = self.fetch_job(db, job.jobid)?;
        db.put(&keys::job(job.jobid), &job.encode())?;
        self.notify_changes(db.printer(), old.as_ref(), job);
        Ok(())
    }

    /// Read-modify-write of one job row inside a single store transaction.
    ///
    /// `f` sees the current row; an error from it leaves the row untouched.
    /// A row that has disappeared (or no longer decodes) is `NotFound` and is
    /// never recreated.  Returns the row as written.
    pub(crate) fn modify_job<T>(
        &self,
        db: &PrinterDb,
        jobid: JobId,
        f: impl FnOnce(&mut PrintJob) -> Result<T>,
    ) -> Result<(PrintJob, T)> {
        let (old, job, out) = db.update(&keys::job(jobid), |raw| {
            let Some(raw) = raw.filter(|r| !r.is_empty()) else {
                return Err(SpoolError::NotFound(jobid));
            };
            let old = PrintJob::decode(jobid, &raw).map_err(|e| {
                warn!(printer = db.printer(), %jobid, error = %e, "corrupt job row left untouched");
                SpoolError::NotFound(jobid)
            })?;
            let mut job = old.clone();
            let out = f(&mut job)?;
            Ok((Some(job.encode()), (old, job, out)))
        })?;
        self.notify_changes(db.printer(), Some(&old), &job);
        Ok((job, out))
    }

    fn notify_changes(&self, printer: &str, old: Option<&PrintJob>, job: &PrintJob) {
        let changed = |f: &dyn Fn(&PrintJob) -> bool| old.is_none_or(|o| f(o));

        if changed(&|o| o.start_time != job.start_time) {
            self.notify_job(printer, job, NotifyField::JobSubmitted, time_ints(job.start_time));
        }
        if changed(&|o| o.user != job.user) {
            self.notify_job(printer, job, NotifyField::JobUser, NotifyValue::Text(job.user.clone()));
        }
        if changed(&|o| o.job_name != job.job_name) {
            self.notify_job(printer, job, NotifyField::JobName, NotifyValue::Text(job.job_name.clone()));
        }
        if changed(&|o| o.status != job.status) {
            self.notify_job(
                printer,
                job,
                NotifyField::JobStatus,
                NotifyValue::Ints(job.status.notify_flags(), 0),
            );
        }
        if changed(&|o| o.size != job.size) {
            let size = u32::try_from(job.size).unwrap_or(u32::MAX);
            self.notify_job(printer, job, NotifyField::JobTotalBytes, NotifyValue::Ints(size, 0));
        }
        if changed(&|o| o.page_count != job.page_count) {
            self.notify_job(printer, job, NotifyField::JobTotalPages, NotifyValue::Ints(job.page_count, 0));
        }
    }

    /// Delete a job row, announcing it as deleted.
    pub(crate) fn remove_job(&self, db: &PrinterDb, job: &PrintJob) -> Result<()> {
        let printer = db.printer();
        let flags = JobStatus::Deleting.notify_flags() | JobStatus::Deleted.notify_flags();
        self.notify_job(printer, job, NotifyField::JobStatus, NotifyValue::Ints(flags, 0));

        db.remove(&keys::job(job.jobid))?;
        self.changed_remove(db, job.jobid)?;
        self.legacy.remove(printer, job.jobid);
        debug!(%printer, jobid = %job.jobid, "job row removed");
        Ok(())
    }

    /// Jobs started since the last reconciliation picked them up.
    pub(crate) fn changed_jobs(&self, db: &PrinterDb) -> Result<Vec<JobId>> {
        match db.fetch(keys::CHANGED)? {
            Some(raw) => decode_ids(&raw),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn changed_add(&self, db: &PrinterDb, jobid: JobId) -> Result<()> {
        db.update(keys::CHANGED, |raw| {
            let mut ids = raw.map(|r| decode_ids(&r)).transpose()?.unwrap_or_default();
            if !ids.contains(&jobid) {
                ids.push(jobid);
            }
            Ok((Some(encode_ids(&ids)), ()))
        })
    }

    pub(crate) fn changed_remove(&self, db: &PrinterDb, jobid: JobId) -> Result<()> {
        db.update(keys::CHANGED, |raw| {
            let Some(raw) = raw else {
                return Ok((None, ()));
            };
            let mut ids = decode_ids(&raw)?;
            ids.retain(|id| *id != jobid);
            Ok((Some(encode_ids(&ids)), ()))
        })
    }

    /// Add to the stored job counter, clamping at zero.
    pub(crate) fn adjust_total(&self, db: &PrinterDb, delta: i64) -> Result<i64> {
        let total = db.add_i64(keys::TOTAL_JOBS, delta)?;
        if total < 0 {
            db.put_i64(keys::TOTAL_JOBS, 0)?;
            return Ok(0);
        }
        Ok(total)
    }
}
