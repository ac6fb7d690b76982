// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Queue reconciliation: merge a backend listing into the printer's store.
//
// Runs only under the refresh ownership protocol in `coordination`.  Three
// passes:
//
//   1. match every listed entry to a row (spool file name, else a synthetic
//      row for a job that exists only in the backend); entries with no
//      usable id or a repeated id are skipped
//   2. walk every row and prune what the listing shows has gone
//   3. persist the trimmed snapshot, the job total and the status summary

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use spoolwerk_core::error::{Result, SpoolError};
use spoolwerk_core::{
    ExternalQueueEntry, JobId, JobStatus, PrintJob, QueueStatus, SnapshotEntry, encode_snapshot,
    parse_spool_jobid,
};

use crate::allocator::synthetic_jobid;
use crate::context::SpoolContext;
use crate::notify::{PRINTER_STATUS_OK, PRINTER_STATUS_PAUSED};
use crate::store::{PrinterDb, keys};

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entries in the stored snapshot.
    pub entries: usize,
    /// Jobs counted active.
    pub total: usize,
    /// Rows deleted.
    pub pruned: usize,
}

/// A listed entry matched to a row.
struct Slot {
    entry: SnapshotEntry,
    external: i32,
}

impl SpoolContext {
    /// Create or refresh the row for a job known only from the listing.
    /// The first recorded start time and names survive repeated scans.
    fn upsert_external(&self, db: &PrinterDb, jobid: JobId, entry: &ExternalQueueEntry) -> Result<PrintJob> {
        let old = self.fetch_job(db, jobid)?;
        let job = PrintJob {
            jobid,
            owner: None,
            external_job_id: Some(entry.job),
            spool_file: old.as_ref().map_or_else(PathBuf::new, |o| o.spool_file.clone()),
            start_time: old.as_ref().map_or(entry.submitted_at, |o| o.start_time),
            status: entry.status,
            size: entry.size,
            page_count: old.as_ref().map_or(0, |o| o.page_count),
            spooled: true,
            originated_locally: false,
            job_name: old.as_ref().map_or_else(|| entry.file_name.clone(), |o| o.job_name.clone()),
            user: old.as_ref().map_or_else(|| entry.user.clone(), |o| o.user.clone()),
            queue_name: db.printer().to_owned(),
            settings: old.map(|o| o.settings).unwrap_or_default(),
        };
        self.store_job(db, &job)?;
        Ok(job)
    }

    /// Reconcile a printer against its backend.  The caller must hold refresh
    /// ownership.
    pub(crate) fn reconcile(&self, db: &PrinterDb, printer: &str) -> Result<ReconcileReport> {
        let cfg = self.printer_config(printer)?;
        let backend = self.backend(printer)?;

        // Stamp first so concurrent readers stop asking while we work.
        db.put_i64(&keys::cache(printer), self.clock.now())?;
        let scan_started = self.clock.now();

        let (mut listing, backend_status) = backend.queue_snapshot(printer)?;
        listing.sort_by_key(|e| e.submitted_at);
        debug!(%printer, listed = listing.len(), "backend listing received");

        // Pass 1: match.
        let mut slots: Vec<Slot> = Vec::with_capacity(listing.len());
        let mut matched: HashMap<JobId, usize> = HashMap::new();
        for entry in &listing {
            let parsed = parse_spool_jobid(&entry.file_name);
            let Some(jobid) = parsed.or_else(|| synthetic_jobid(self.config.max_jobid, entry.job)) else {
                warn!(%printer, external = entry.job, "listed job has no usable id, skipped");
                continue;
            };
            if matched.contains_key(&jobid) {
                warn!(%printer, %jobid, external = entry.job, "job listed twice, later entry skipped");
                continue;
            }

            let refreshed = match parsed {
                Some(_) => self.modify_job(db, jobid, |job| {
                    job.external_job_id = Some(entry.job);
                    if job.status != JobStatus::Deleting {
                        job.status = entry.status;
                    }
                    Ok(())
                }),
                None => Err(SpoolError::NotFound(jobid)),
            };
            match refreshed {
                Ok(_) => self.changed_remove(db, jobid)?,
                Err(SpoolError::NotFound(_)) => {
                    self.upsert_external(db, jobid, entry)?;
                }
                Err(e) => return Err(e),
            }
            matched.insert(jobid, slots.len());
            slots.push(Slot {
                entry: SnapshotEntry {
                    jobid,
                    size: entry.size,
                    pages: 0,
                    status: entry.status,
                    priority: entry.priority,
                    time: entry.submitted_at,
                    user: entry.user.clone(),
                    name: entry.file_name.clone(),
                },
                external: entry.job,
            });
        }

        // Pass 2: prune.
        let mut total = 0usize;
        let mut pruned = 0usize;
        for jobid in db.job_ids()? {
            let Some(mut job) = self.fetch_job(db, jobid)? else {
                continue;
            };
            let slot = matched.get(&jobid).copied();

            if !job.originated_locally {
                match slot {
                    Some(i) => {
                        total += 1;
                        slots[i].entry = SnapshotEntry {
                            priority: slots[i].entry.priority,
                            ..SnapshotEntry::from_job(&job)
                        };
                    }
                    None => {
                        debug!(%printer, %jobid, "external job finished");
                        self.remove_job(db, &job)?;
                        pruned += 1;
                    }
                }
                continue;
            }

            if !job.spooled {
                if job.owner.is_some_and(|pid| self.host.process_exists(pid)) {
                    total += 1;
                } else {
                    info!(%printer, %jobid, owner = ?job.owner, "owner gone, discarding unsubmitted job");
                    if let Err(e) = std::fs::remove_file(&job.spool_file)
                        && e.kind() != std::io::ErrorKind::NotFound
                    {
                        warn!(%printer, %jobid, error = %e, "failed to remove orphaned spool file");
                    }
                    self.remove_job(db, &job)?;
                    pruned += 1;
                }
                continue;
            }

            let Some(i) = slot else {
                // Absent from the listing.  Rows created after the scan began
                // may simply not be visible yet; they get another cycle.
                if job.start_time < scan_started {
                    debug!(%printer, %jobid, "job left the backend queue");
                    self.remove_job(db, &job)?;
                    pruned += 1;
                } else {
                    total += 1;
                }
                continue;
            };

            if job.status == JobStatus::Deleting {
                let mut target = job.clone();
                target.external_job_id = Some(slots[i].external);
                match backend.cancel_job(printer, &target) {
                    Ok(()) => {
                        info!(%printer, %jobid, "deferred cancel succeeded");
                        self.remove_job(db, &job)?;
                        slots[i].entry.status = JobStatus::Deleted;
                        pruned += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!(%printer, %jobid, error = %e, "deferred cancel failed, job requeued");
                        let requeued = self.modify_job(db, jobid, |row| {
                            row.status = JobStatus::Queued;
                            row.external_job_id = target.external_job_id;
                            Ok(())
                        });
                        match requeued {
                            Ok((row, ())) => job = row,
                            Err(SpoolError::NotFound(_)) => continue,
                            Err(e) => return Err(e),
                        }
                    }
                }
            }

            total += 1;
            slots[i].entry = SnapshotEntry {
                priority: slots[i].entry.priority,
                ..SnapshotEntry::from_job(&job)
            };
        }

        // Pass 3: persist.
        let mut visible: Vec<SnapshotEntry> = slots
            .into_iter()
            .map(|s| s.entry)
            .filter(|e| e.status != JobStatus::Deleted)
            .collect();
        let status = QueueStatus {
            job_count: visible.len(),
            fatal_stop: backend_status.fatal_stop,
            message: backend_status.message,
        };
        if cfg.max_reported_jobs > 0 {
            visible.truncate(cfg.max_reported_jobs);
        }

        db.put(keys::SNAPSHOT, &encode_snapshot(&visible))?;
        db.put_i64(keys::TOTAL_JOBS, total as i64)?;
        self.store_status(db, printer, &status)?;
        db.put_i64(&keys::cache(printer), self.clock.now())?;
        db.put_i64(&keys::pending(printer), 0)?;

        Ok(ReconcileReport {
            entries: visible.len(),
            total,
            pruned,
        })
    }

    /// Persist the status summary, announcing a change of the stopped flag.
    fn store_status(&self, db: &PrinterDb, printer: &str, status: &QueueStatus) -> Result<()> {
        let key = keys::status(printer);
        let old: Option<QueueStatus> = match db.fetch(&key)? {
            Some(raw) => serde_json::from_slice(&raw).ok(),
            None => None,
        };
        if old.as_ref().is_some_and(|o| o == status) {
            return Ok(());
        }
        db.put(&key, &serde_json::to_vec(status)?)?;
        if old.map_or(status.fatal_stop, |o| o.fatal_stop != status.fatal_stop) {
            let code = if status.fatal_stop {
                PRINTER_STATUS_PAUSED
            } else {
                PRINTER_STATUS_OK
            };
            self.notify_printer_status(printer, code);
        }
        Ok(())
    }
}
