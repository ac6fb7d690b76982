// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job lifecycle: start, write, submit, pause, resume, rename and delete.
//
// A job is created in `Spooling` state with an exclusively owned spool file,
// receives data from its owning process, and is handed to the backend by
// `end_job`.  Every change to an existing job is a single read-modify-write
// of its row (`modify_job`), which raises the notifications for whatever
// changed and never brings back a row deleted in the meantime.

use std::collections::hash_map::Entry;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Seek, SeekFrom, Write};

use tracing::{debug, info, instrument, warn};

use spoolwerk_core::error::{QuotaKind, Result, SpoolError};
use spoolwerk_core::{Caller, CloseKind, JobId, JobStatus, PrintJob, PrinterConfig, SPOOL_PREFIX};

use crate::allocator::allocate_jobid;
use crate::context::SpoolContext;
use crate::notify::{PRINTER_STATUS_OK, PRINTER_STATUS_PAUSED};
use crate::store::{PrinterDb, keys};

/// Owner of the job (by user name) or an operator of the queue.
fn authorize(cfg: &PrinterConfig, caller: &Caller, job: &PrintJob) -> Result<()> {
    if job.user == caller.user || cfg.is_operator(&caller.user) {
        Ok(())
    } else {
        Err(SpoolError::PermissionDenied(format!(
            "{} may not administer job {} owned by {}",
            caller.user, job.jobid, job.user
        )))
    }
}

/// Only the process that started a job may feed it.
fn require_owner(caller: &Caller, job: &PrintJob) -> Result<()> {
    if job.owner == Some(caller.pid) {
        Ok(())
    } else {
        Err(SpoolError::PermissionDenied(format!(
            "job {} is owned by another process",
            job.jobid
        )))
    }
}

fn require_unspooled(job: &PrintJob) -> Result<()> {
    if job.spooled {
        Err(SpoolError::InvalidState(format!("job {} already submitted", job.jobid)))
    } else {
        Ok(())
    }
}

/// What `delete_job` decided while holding the row.
enum DeleteStep {
    InProgress,
    Discard,
    Cancel,
}

fn remove_spool_file(job: &PrintJob) {
    match std::fs::remove_file(&job.spool_file) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(jobid = %job.jobid, path = %job.spool_file.display(), error = %e, "failed to remove spool file"),
    }
}

impl SpoolContext {
    fn load_job(&self, db: &PrinterDb, jobid: JobId) -> Result<PrintJob> {
        self.fetch_job(db, jobid)?.ok_or(SpoolError::NotFound(jobid))
    }

    /// Create a job and its spool file.
    ///
    /// Checks, in order: caller may print here, time-of-day window, free
    /// spool space, queue still present, queue depth.  Nothing is written
    /// unless every check passes.
    #[instrument(skip(self, settings), fields(printer = %printer, user = %caller.user))]
    pub fn start_job(
        &self,
        caller: &Caller,
        printer: &str,
        job_name: &str,
        settings: &[u8],
    ) -> Result<JobId> {
        let cfg = self.printer_config(printer)?;

        if !cfg.allows(&caller.user) {
            return Err(SpoolError::PermissionDenied(format!(
                "{} may not print to {printer}",
                caller.user
            )));
        }
        if let Some(hours) = cfg.print_hours
            && !hours.contains(self.clock.local_hour())
        {
            return Err(SpoolError::OutsidePrintHours(format!(
                "{printer} only accepts jobs between {}:00 and {}:00",
                hours.start, hours.end
            )));
        }
        if cfg.min_free_space_kb > 0
            && let Some(free) = self.host.free_space_kb(&cfg.spool_dir)
            && free < cfg.min_free_space_kb.saturating_mul(2)
        {
            warn!(free_kb = free, min_kb = cfg.min_free_space_kb, "spool volume low on space");
            return Err(SpoolError::QuotaExceeded(QuotaKind::DiskSpace));
        }
        if cfg.auto_discovered && !self.host.queue_listed(printer) {
            return Err(SpoolError::UnknownPrinter(format!(
                "{printer} is no longer in the system printer list"
            )));
        }
        if cfg.max_jobs > 0 {
            self.refresh_if_stale(printer)?;
            let db = self.stores.acquire(printer)?;
            let queued = db.fetch_i64(keys::TOTAL_JOBS)?.unwrap_or(0);
            if queued >= cfg.max_jobs as i64 {
                info!(queued, max = cfg.max_jobs, "queue full");
                return Err(SpoolError::QuotaExceeded(QuotaKind::QueueDepth));
            }
        }

        let db = self.stores.acquire(printer)?;
        let jobid = allocate_jobid(
            &db,
            self.config.max_jobid,
            self.config.jobid_attempts,
            self.config.jobid_lock_timeout(),
        )?;

        let spool = std::fs::create_dir_all(&cfg.spool_dir).and_then(|()| {
            tempfile::Builder::new()
                .prefix(&format!("{SPOOL_PREFIX}{:08}.", jobid.0))
                .rand_bytes(6)
                .tempfile_in(&cfg.spool_dir)
                .and_then(|f| f.keep().map_err(|e| e.error))
        });
        let (file, path) = match spool {
            Ok(created) => created,
            Err(e) => {
                db.remove(&keys::job(jobid))?;
                return Err(e.into());
            }
        };

        let job = PrintJob {
            jobid,
            owner: Some(caller.pid),
            external_job_id: None,
            spool_file: path,
            start_time: self.clock.now(),
            status: JobStatus::Spooling,
            size: 0,
            page_count: 0,
            spooled: false,
            originated_locally: true,
            job_name: job_name.to_owned(),
            user: caller.user.clone(),
            queue_name: printer.to_owned(),
            settings: settings.to_vec(),
        };
        if let Err(e) = self.store_job(&db, &job) {
            remove_spool_file(&job);
            db.remove(&keys::job(jobid))?;
            return Err(e);
        }
        self.changed_add(&db, jobid)?;
        self.adjust_total(&db, 1)?;
        self.spool_files()?.insert((printer.to_owned(), jobid), file);

        info!(%jobid, path = %job.spool_file.display(), "job started");
        Ok(jobid)
    }

    /// Append document data at `offset` in the spool file.
    pub fn write_job(
        &self,
        caller: &Caller,
        printer: &str,
        jobid: JobId,
        data: &[u8],
        offset: u64,
    ) -> Result<usize> {
        let db = self.stores.acquire(printer)?;
        let (_, written) = self.modify_job(&db, jobid, |job| {
            require_owner(caller, job)?;
            require_unspooled(job)?;

            let mut files = self.spool_files()?;
            let file = match files.entry((printer.to_owned(), jobid)) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => e.insert(OpenOptions::new().write(true).open(&job.spool_file)?),
            };
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;

            job.size += data.len() as u64;
            Ok(data.len())
        })?;
        Ok(written)
    }

    /// Count one more rendered page.
    pub fn end_page(&self, caller: &Caller, printer: &str, jobid: JobId) -> Result<()> {
        let db = self.stores.acquire(printer)?;
        self.modify_job(&db, jobid, |job| {
            require_owner(caller, job)?;
            require_unspooled(job)?;
            job.page_count += 1;
            Ok(())
        })?;
        Ok(())
    }

    pub fn set_job_name(&self, caller: &Caller, printer: &str, jobid: JobId, name: &str) -> Result<()> {
        let cfg = self.printer_config(printer)?;
        let db = self.stores.acquire(printer)?;
        self.modify_job(&db, jobid, |job| {
            authorize(cfg, caller, job)?;
            job.job_name = name.to_owned();
            Ok(())
        })?;
        Ok(())
    }

    /// Remove a job that will never reach the backend.
    fn discard_job(&self, db: &PrinterDb, job: &PrintJob) -> Result<()> {
        if let Ok(mut files) = self.spool_files() {
            files.remove(&(db.printer().to_owned(), job.jobid));
        }
        remove_spool_file(job);
        self.remove_job(db, job)?;
        self.adjust_total(db, -1)?;
        Ok(())
    }

    /// Close the spool file and, on a normal close of a non-empty job,
    /// submit it.  A failed submission discards the job and returns the
    /// backend's error; there is no retry.
    #[instrument(skip(self, caller), fields(printer = %printer, jobid = %jobid))]
    pub fn end_job(&self, caller: &Caller, printer: &str, jobid: JobId, close: CloseKind) -> Result<()> {
        let db = self.stores.acquire(printer)?;
        let mut job = self.load_job(&db, jobid)?;
        require_owner(caller, &job)?;
        require_unspooled(&job)?;

        let file = self.spool_files()?.remove(&(printer.to_owned(), jobid));
        if let Some(file) = file
            && close == CloseKind::Normal
            && let Err(e) = file.sync_all()
        {
            warn!(error = %e, "spool file sync failed");
        }

        if close != CloseKind::Normal {
            info!(?close, "job abandoned by client");
            return self.discard_job(&db, &job);
        }

        if let Ok(meta) = std::fs::metadata(&job.spool_file) {
            job.size = meta.len();
        }
        if job.size == 0 || job.status == JobStatus::Deleting {
            debug!(size = job.size, status = ?job.status, "nothing to print, job discarded");
            return self.discard_job(&db, &job);
        }

        match self.backend(printer)?.submit_job(printer, &job) {
            Ok(external) => {
                let size = job.size;
                let accepted = self.modify_job(&db, jobid, |row| {
                    row.spooled = true;
                    row.status = JobStatus::Queued;
                    row.external_job_id = external;
                    row.size = size;
                    Ok(())
                });
                match accepted {
                    Ok(_) => info!(external_job_id = ?external, size, "job submitted"),
                    Err(SpoolError::NotFound(_)) => {
                        warn!(external_job_id = ?external, "job deleted while it was being submitted");
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => {
                warn!(error = %e, "submission failed, job discarded");
                self.discard_job(&db, &job)?;
                return Err(e);
            }
        }

        let stale = self.cache_expired(&db, printer, true)?;
        drop(db);
        if stale && let Err(e) = self.request_refresh(printer, false) {
            warn!(error = %e, "post-submit refresh failed");
        }
        Ok(())
    }

    fn submitted_job(&self, db: &PrinterDb, jobid: JobId) -> Result<PrintJob> {
        let job = self.load_job(db, jobid)?;
        if !job.spooled || job.external_job_id.is_none() {
            return Err(SpoolError::InvalidState(format!(
                "job {jobid} has not been accepted by the backend"
            )));
        }
        Ok(job)
    }

    pub fn pause_job(&self, caller: &Caller, printer: &str, jobid: JobId) -> Result<()> {
        let cfg = self.printer_config(printer)?;
        let db = self.stores.acquire(printer)?;
        let job = self.submitted_job(&db, jobid)?;
        authorize(cfg, caller, &job)?;

        self.backend(printer)?.pause_job(printer, &job)?;
        self.modify_job(&db, jobid, |row| {
            row.status = JobStatus::Paused;
            Ok(())
        })?;
        self.flush_cache(&db, printer)?;
        info!(%printer, %jobid, "job paused");
        Ok(())
    }

    pub fn resume_job(&self, caller: &Caller, printer: &str, jobid: JobId) -> Result<()> {
        let cfg = self.printer_config(printer)?;
        let db = self.stores.acquire(printer)?;
        let job = self.submitted_job(&db, jobid)?;
        authorize(cfg, caller, &job)?;

        self.backend(printer)?.resume_job(printer, &job)?;
        self.modify_job(&db, jobid, |row| {
            row.status = JobStatus::Queued;
            Ok(())
        })?;
        self.flush_cache(&db, printer)?;
        info!(%printer, %jobid, "job resumed");
        Ok(())
    }

    /// Delete a job.
    ///
    /// A submitted job is marked `Deleting` before the backend is asked to
    /// cancel it, so reconciliation never mistakes it for a finished job.  If
    /// the cancel fails it reverts to `Queued`.  A job whose backend number is
    /// not known yet stays `Deleting` until reconciliation can retry.
    #[instrument(skip(self, caller), fields(printer = %printer, jobid = %jobid, user = %caller.user))]
    pub fn delete_job(&self, caller: &Caller, printer: &str, jobid: JobId) -> Result<()> {
        let cfg = self.printer_config(printer)?;
        let db = self.stores.acquire(printer)?;
        let (job, step) = self.modify_job(&db, jobid, |job| {
            authorize(cfg, caller, job)?;
            Ok(if job.status == JobStatus::Deleting {
                DeleteStep::InProgress
            } else if !job.spooled {
                DeleteStep::Discard
            } else {
                job.status = JobStatus::Deleting;
                DeleteStep::Cancel
            })
        })?;

        match step {
            DeleteStep::InProgress => {
                debug!("delete already in progress");
                return Ok(());
            }
            DeleteStep::Discard => {
                self.discard_job(&db, &job)?;
                info!("unsubmitted job deleted");
                return Ok(());
            }
            DeleteStep::Cancel => {}
        }

        if job.external_job_id.is_none() {
            info!("backend job number unknown, cancel deferred to reconciliation");
            self.flush_cache(&db, printer)?;
            return Ok(());
        }

        match self.backend(printer)?.cancel_job(printer, &job) {
            Ok(()) => {
                self.remove_job(&db, &job)?;
                self.adjust_total(&db, -1)?;
                self.flush_cache(&db, printer)?;
                info!("job cancelled and deleted");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "cancel failed, job requeued");
                let requeued = self.modify_job(&db, jobid, |row| {
                    row.status = JobStatus::Queued;
                    Ok(())
                });
                if let Err(requeue) = requeued {
                    warn!(error = %requeue, "could not requeue job after failed cancel");
                }
                Err(e)
            }
        }
    }

    /// Delete every job the caller may administer.  Returns how many were
    /// deleted; individual failures are logged and skipped.
    pub fn purge_queue(&self, caller: &Caller, printer: &str) -> Result<usize> {
        let cfg = self.printer_config(printer)?;
        self.refresh_if_stale(printer)?;

        let ids = self.stores.acquire(printer)?.job_ids()?;
        let mut deleted = 0;
        for jobid in ids {
            let job = match self.job(printer, jobid) {
                Ok(job) => job,
                Err(SpoolError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if job.user != caller.user && !cfg.is_operator(&caller.user) {
                continue;
            }
            match self.delete_job(caller, printer, jobid) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(%printer, %jobid, error = %e, "purge could not delete job"),
            }
        }

        if let Err(e) = self.request_refresh(printer, true) {
            warn!(%printer, error = %e, "refresh after purge failed");
        }
        info!(%printer, deleted, "queue purged");
        Ok(deleted)
    }

    fn require_operator<'a>(&'a self, caller: &Caller, printer: &str) -> Result<&'a PrinterConfig> {
        let cfg = self.printer_config(printer)?;
        if cfg.is_operator(&caller.user) {
            Ok(cfg)
        } else {
            Err(SpoolError::PermissionDenied(format!(
                "{} may not administer {printer}",
                caller.user
            )))
        }
    }

    pub fn pause_queue(&self, caller: &Caller, printer: &str) -> Result<()> {
        self.require_operator(caller, printer)?;
        self.backend(printer)?.pause_queue(printer)?;
        let db = self.stores.acquire(printer)?;
        self.flush_cache(&db, printer)?;
        self.notify_printer_status(printer, PRINTER_STATUS_PAUSED);
        info!(%printer, "queue paused");
        Ok(())
    }

    pub fn resume_queue(&self, caller: &Caller, printer: &str) -> Result<()> {
        self.require_operator(caller, printer)?;
        self.backend(printer)?.resume_queue(printer)?;
        let db = self.stores.acquire(printer)?;
        self.flush_cache(&db, printer)?;
        self.notify_printer_status(printer, PRINTER_STATUS_OK);
        info!(%printer, "queue resumed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{NotifyField, NotifyValue};
    use crate::testutil::{Fixture, sample_job};
    use spoolwerk_core::{PrintHours, ProcessId, parse_spool_jobid};

    fn alice() -> Caller {
        Caller::new("alice")
    }

    /// Start, fill and submit a job for `caller`.
    fn submitted(fx: &Fixture, caller: &Caller) -> JobId {
        let id = fx.ctx.start_job(caller, "lp0", "report", b"").unwrap();
        fx.ctx.write_job(caller, "lp0", id, b"%!PS-Adobe-3.0\n", 0).unwrap();
        fx.ctx.end_job(caller, "lp0", id, CloseKind::Normal).unwrap();
        id
    }

    #[test]
    fn empty_job_is_discarded_on_close() {
        let fx = Fixture::builder().build();
        let caller = alice();
        let id = fx.ctx.start_job(&caller, "lp0", "doc", b"").unwrap();
        let path = fx.ctx.job("lp0", id).unwrap().spool_file;
        assert!(path.exists());

        fx.ctx.end_job(&caller, "lp0", id, CloseKind::Normal).unwrap();

        assert!(fx.backend.submissions().is_empty());
        assert!(matches!(fx.ctx.job("lp0", id), Err(SpoolError::NotFound(_))));
        assert!(!path.exists());
        let db = fx.ctx.stores().acquire("lp0").unwrap();
        assert_eq!(db.fetch_i64(keys::TOTAL_JOBS).unwrap(), Some(0));
    }

    #[test]
    fn written_job_is_submitted_with_its_payload() {
        let fx = Fixture::builder().build();
        let caller = alice();
        let id = fx.ctx.start_job(&caller, "lp0", "doc", b"duplex").unwrap();
        let data = vec![0x42u8; 100];
        assert_eq!(fx.ctx.write_job(&caller, "lp0", id, &data, 0).unwrap(), 100);
        fx.ctx.end_job(&caller, "lp0", id, CloseKind::Normal).unwrap();

        let subs = fx.backend.submissions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].jobid, id);
        assert_eq!(subs[0].payload, data);

        let job = fx.ctx.job("lp0", id).unwrap();
        assert!(job.spooled);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.external_job_id, Some(100));
        assert_eq!(job.size, 100);
        assert_eq!(job.settings, b"duplex");
    }

    #[test]
    fn spool_file_name_carries_the_job_id() {
        let fx = Fixture::builder().build();
        let id = fx.ctx.start_job(&alice(), "lp0", "doc", b"").unwrap();
        let job = fx.ctx.job("lp0", id).unwrap();
        let name = job.spool_file.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&format!("spool.{:08}.", id.0)), "{name}");
        assert_eq!(parse_spool_jobid(&name), Some(id));
        assert_eq!(job.owner, Some(ProcessId::current()));
    }

    #[test]
    fn job_is_spooling_until_closed() {
        let fx = Fixture::builder().build();
        let caller = alice();
        let id = fx.ctx.start_job(&caller, "lp0", "doc", b"").unwrap();
        fx.ctx.write_job(&caller, "lp0", id, b"abc", 0).unwrap();

        let (entries, _) = fx.ctx.queue_status("lp0").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].jobid, id);
        assert_eq!(entries[0].status, JobStatus::Spooling);
        assert_eq!(entries[0].size, 3);
    }

    #[test]
    fn pages_and_offsets_are_tracked() {
        let fx = Fixture::builder().build();
        let caller = alice();
        let id = fx.ctx.start_job(&caller, "lp0", "doc", b"").unwrap();
        fx.ctx.write_job(&caller, "lp0", id, b"hello", 0).unwrap();
        fx.ctx.write_job(&caller, "lp0", id, b"world", 5).unwrap();
        fx.ctx.end_page(&caller, "lp0", id).unwrap();
        fx.ctx.end_page(&caller, "lp0", id).unwrap();

        let job = fx.ctx.job("lp0", id).unwrap();
        assert_eq!(job.page_count, 2);
        assert_eq!(std::fs::read(&job.spool_file).unwrap(), b"helloworld");
    }

    #[test]
    fn only_the_starting_process_may_write() {
        let fx = Fixture::builder().build();
        let id = fx.ctx.start_job(&alice(), "lp0", "doc", b"").unwrap();
        let intruder = Caller {
            user: "alice".into(),
            pid: ProcessId(999_999),
        };
        assert!(matches!(
            fx.ctx.write_job(&intruder, "lp0", id, b"x", 0),
            Err(SpoolError::PermissionDenied(_))
        ));
        assert!(matches!(
            fx.ctx.end_job(&intruder, "lp0", id, CloseKind::Normal),
            Err(SpoolError::PermissionDenied(_))
        ));
    }

    #[test]
    fn writing_after_submission_is_rejected() {
        let fx = Fixture::builder().build();
        let caller = alice();
        let id = submitted(&fx, &caller);
        assert!(matches!(
            fx.ctx.write_job(&caller, "lp0", id, b"late", 0),
            Err(SpoolError::InvalidState(_))
        ));
    }

    #[test]
    fn writer_cannot_revive_a_job_deleted_under_it() {
        let fx = Fixture::builder().build();
        let caller = alice();
        let id = fx.ctx.start_job(&caller, "lp0", "doc", b"").unwrap();
        fx.ctx.write_job(&caller, "lp0", id, b"abc", 0).unwrap();

        fx.ctx.delete_job(&Caller::new("root"), "lp0", id).unwrap();

        assert!(matches!(
            fx.ctx.write_job(&caller, "lp0", id, b"more", 3),
            Err(SpoolError::NotFound(_))
        ));
        assert!(matches!(fx.ctx.end_page(&caller, "lp0", id), Err(SpoolError::NotFound(_))));
        assert!(matches!(
            fx.ctx.set_job_name(&caller, "lp0", id, "renamed"),
            Err(SpoolError::NotFound(_))
        ));
        assert!(matches!(fx.ctx.job("lp0", id), Err(SpoolError::NotFound(_))));
        let db = fx.ctx.stores().acquire("lp0").unwrap();
        assert!(db.fetch(&keys::job(id)).unwrap().is_none());
    }

    #[test]
    fn abandoned_job_is_discarded() {
        let fx = Fixture::builder().build();
        let caller = alice();
        let id = fx.ctx.start_job(&caller, "lp0", "doc", b"").unwrap();
        fx.ctx.write_job(&caller, "lp0", id, b"partial", 0).unwrap();
        fx.ctx.end_job(&caller, "lp0", id, CloseKind::Shutdown).unwrap();

        assert!(fx.backend.submissions().is_empty());
        assert!(matches!(fx.ctx.job("lp0", id), Err(SpoolError::NotFound(_))));
    }

    #[test]
    fn failed_submission_discards_the_job() {
        let fx = Fixture::builder().build();
        fx.backend.set_fail_submit(true);
        let caller = alice();
        let id = fx.ctx.start_job(&caller, "lp0", "doc", b"").unwrap();
        fx.ctx.write_job(&caller, "lp0", id, b"data", 0).unwrap();
        let path = fx.ctx.job("lp0", id).unwrap().spool_file;

        assert!(matches!(
            fx.ctx.end_job(&caller, "lp0", id, CloseKind::Normal),
            Err(SpoolError::Backend(_))
        ));
        assert!(matches!(fx.ctx.job("lp0", id), Err(SpoolError::NotFound(_))));
        assert!(!path.exists());
    }

    #[test]
    fn start_refuses_users_outside_the_allow_list() {
        let fx = Fixture::builder()
            .printer(|p| p.allowed_users = vec!["bob".into()])
            .build();
        assert!(matches!(
            fx.ctx.start_job(&alice(), "lp0", "doc", b""),
            Err(SpoolError::PermissionDenied(_))
        ));
        assert!(fx.ctx.start_job(&Caller::new("bob"), "lp0", "doc", b"").is_ok());
    }

    #[test]
    fn start_honours_print_hours() {
        // The fixture clock sits at 22:00.
        let closed = Fixture::builder()
            .printer(|p| p.print_hours = Some(PrintHours { start: 8, end: 18 }))
            .build();
        assert!(matches!(
            closed.ctx.start_job(&alice(), "lp0", "doc", b""),
            Err(SpoolError::OutsidePrintHours(_))
        ));

        let overnight = Fixture::builder()
            .printer(|p| p.print_hours = Some(PrintHours { start: 20, end: 2 }))
            .build();
        assert!(overnight.ctx.start_job(&alice(), "lp0", "doc", b"").is_ok());
    }

    #[test]
    fn start_requires_twice_the_minimum_free_space() {
        let fx = Fixture::builder().printer(|p| p.min_free_space_kb = 100).build();
        fx.host.set_free_space_kb(Some(150));
        assert!(matches!(
            fx.ctx.start_job(&alice(), "lp0", "doc", b""),
            Err(SpoolError::QuotaExceeded(QuotaKind::DiskSpace))
        ));

        fx.host.set_free_space_kb(Some(200));
        assert!(fx.ctx.start_job(&alice(), "lp0", "doc", b"").is_ok());
    }

    #[test]
    fn start_rejects_a_vanished_discovered_queue() {
        let fx = Fixture::builder().printer(|p| p.auto_discovered = true).build();
        fx.host.unlist_queue("lp0");
        assert!(matches!(
            fx.ctx.start_job(&alice(), "lp0", "doc", b""),
            Err(SpoolError::UnknownPrinter(_))
        ));
        assert!(fx.backend.submissions().is_empty());
    }

    #[test]
    fn start_enforces_queue_depth() {
        let fx = Fixture::builder().printer(|p| p.max_jobs = 1).build();
        fx.ctx.start_job(&alice(), "lp0", "first", b"").unwrap();
        assert!(matches!(
            fx.ctx.start_job(&alice(), "lp0", "second", b""),
            Err(SpoolError::QuotaExceeded(QuotaKind::QueueDepth))
        ));
        // lp1 has no limit.
        assert!(fx.ctx.start_job(&alice(), "lp1", "second", b"").is_ok());
    }

    #[test]
    fn unknown_printer_is_rejected() {
        let fx = Fixture::builder().build();
        assert!(matches!(
            fx.ctx.start_job(&alice(), "nowhere", "doc", b""),
            Err(SpoolError::UnknownPrinter(_))
        ));
    }

    #[test]
    fn delete_cancels_then_reports_not_found() {
        let fx = Fixture::builder().build();
        let caller = alice();
        let id = submitted(&fx, &caller);

        fx.ctx.delete_job(&caller, "lp0", id).unwrap();
        assert_eq!(fx.backend.cancels(), vec![100]);
        assert!(fx.backend.listing("lp0").is_empty());
        assert!(matches!(
            fx.ctx.delete_job(&caller, "lp0", id),
            Err(SpoolError::NotFound(_))
        ));
        assert_eq!(fx.backend.cancels().len(), 1);
    }

    #[test]
    fn delete_of_a_job_already_deleting_is_a_no_op() {
        let fx = Fixture::builder().build();
        let db = fx.ctx.stores().acquire("lp0").unwrap();
        let mut job = sample_job(JobId(7));
        job.spooled = true;
        job.status = JobStatus::Queued;
        fx.ctx.store_job(&db, &job).unwrap();

        // Backend number not known yet: the cancel waits for reconciliation.
        fx.ctx.delete_job(&alice(), "lp0", JobId(7)).unwrap();
        assert_eq!(fx.ctx.job("lp0", JobId(7)).unwrap().status, JobStatus::Deleting);
        fx.ctx.delete_job(&alice(), "lp0", JobId(7)).unwrap();
        assert!(fx.backend.cancels().is_empty());
    }

    #[test]
    fn failed_cancel_requeues_the_job() {
        let fx = Fixture::builder().build();
        let caller = alice();
        let id = submitted(&fx, &caller);
        fx.backend.set_fail_cancel(true);

        assert!(matches!(
            fx.ctx.delete_job(&caller, "lp0", id),
            Err(SpoolError::Backend(_))
        ));
        assert_eq!(fx.ctx.job("lp0", id).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn only_owner_or_operator_may_administer() {
        let fx = Fixture::builder().build();
        let id = submitted(&fx, &alice());

        let bob = Caller::new("bob");
        assert!(matches!(
            fx.ctx.delete_job(&bob, "lp0", id),
            Err(SpoolError::PermissionDenied(_))
        ));
        assert!(matches!(
            fx.ctx.set_job_name(&bob, "lp0", id, "mine"),
            Err(SpoolError::PermissionDenied(_))
        ));
        fx.ctx.delete_job(&Caller::new("root"), "lp0", id).unwrap();
    }

    #[test]
    fn rename_announces_the_new_name() {
        let fx = Fixture::builder().build();
        let caller = alice();
        let id = submitted(&fx, &caller);
        fx.ctx.notifications().take_printer("lp0");

        fx.ctx.set_job_name(&caller, "lp0", id, "final draft").unwrap();
        assert_eq!(fx.ctx.job("lp0", id).unwrap().job_name, "final draft");
        let sent = fx.ctx.notifications().snapshot();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].field, NotifyField::JobName);
        assert_eq!(sent[0].value, NotifyValue::Text("final draft".into()));
    }

    #[test]
    fn pause_and_resume_reach_the_backend() {
        let fx = Fixture::builder().build();
        let caller = alice();
        let id = submitted(&fx, &caller);

        fx.ctx.pause_job(&caller, "lp0", id).unwrap();
        assert_eq!(fx.ctx.job("lp0", id).unwrap().status, JobStatus::Paused);
        assert_eq!(fx.backend.listing("lp0")[0].status, JobStatus::Paused);

        fx.ctx.resume_job(&caller, "lp0", id).unwrap();
        assert_eq!(fx.ctx.job("lp0", id).unwrap().status, JobStatus::Queued);
        assert_eq!(fx.backend.listing("lp0")[0].status, JobStatus::Queued);
    }

    #[test]
    fn pausing_an_unsubmitted_job_is_invalid() {
        let fx = Fixture::builder().build();
        let caller = alice();
        let id = fx.ctx.start_job(&caller, "lp0", "doc", b"").unwrap();
        assert!(matches!(
            fx.ctx.pause_job(&caller, "lp0", id),
            Err(SpoolError::InvalidState(_))
        ));
    }

    #[test]
    fn purge_deletes_only_what_the_caller_may_administer() {
        let fx = Fixture::builder().build();
        let alice = alice();
        let bob = Caller::new("bob");
        submitted(&fx, &alice);
        submitted(&fx, &alice);
        let kept = submitted(&fx, &bob);

        assert_eq!(fx.ctx.purge_queue(&alice, "lp0").unwrap(), 2);
        assert_eq!(fx.ctx.job("lp0", kept).unwrap().user, "bob");
        assert_eq!(fx.backend.listing("lp0").len(), 1);

        assert_eq!(fx.ctx.purge_queue(&Caller::new("root"), "lp0").unwrap(), 1);
        assert!(fx.backend.listing("lp0").is_empty());
    }

    #[test]
    fn queue_pause_is_for_operators() {
        let fx = Fixture::builder().build();
        assert!(matches!(
            fx.ctx.pause_queue(&alice(), "lp0"),
            Err(SpoolError::PermissionDenied(_))
        ));
        assert!(fx.backend.queue_calls().is_empty());

        let root = Caller::new("root");
        fx.ctx.pause_queue(&root, "lp0").unwrap();
        fx.ctx.resume_queue(&root, "lp0").unwrap();
        assert_eq!(fx.backend.queue_calls(), vec!["pause", "resume"]);

        let statuses: Vec<NotifyValue> = fx
            .ctx
            .notifications()
            .snapshot()
            .into_iter()
            .filter(|m| m.field == NotifyField::PrinterStatus)
            .map(|m| m.value)
            .collect();
        assert_eq!(
            statuses,
            vec![
                NotifyValue::Ints(PRINTER_STATUS_PAUSED, 0),
                NotifyValue::Ints(PRINTER_STATUS_OK, 0)
            ]
        );
    }
}
