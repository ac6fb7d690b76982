// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Client-facing queue views.

use tracing::{debug, warn};

use spoolwerk_core::error::Result;
use spoolwerk_core::{QueueStatus, SnapshotEntry, decode_snapshot};

use crate::context::SpoolContext;
use crate::store::{PrinterDb, keys};

impl SpoolContext {
    fn stored_status(&self, db: &PrinterDb, printer: &str) -> Result<QueueStatus> {
        Ok(match db.fetch(&keys::status(printer))? {
            Some(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!(%printer, error = %e, "unreadable status summary");
                QueueStatus::default()
            }),
            None => QueueStatus::default(),
        })
    }

    /// The printer's queue as clients see it.
    ///
    /// Refreshes if stale, then merges the reconciled snapshot with jobs
    /// started since (the changed list), ordered by submission time and
    /// capped at `max_reported_jobs`.
    pub fn queue_status(&self, printer: &str) -> Result<(Vec<SnapshotEntry>, QueueStatus)> {
        let cfg = self.printer_config(printer)?;
        self.refresh_if_stale(printer)?;
        let db = self.stores.acquire(printer)?;

        let mut entries = match db.fetch(keys::SNAPSHOT)? {
            Some(raw) => decode_snapshot(&raw).unwrap_or_else(|e| {
                warn!(%printer, error = %e, "unreadable queue snapshot");
                Vec::new()
            }),
            None => Vec::new(),
        };

        for jobid in self.changed_jobs(&db)? {
            match self.fetch_job(&db, jobid)? {
                Some(job) => {
                    if !entries.iter().any(|e| e.jobid == jobid) {
                        entries.push(SnapshotEntry::from_job(&job));
                    }
                }
                None => {
                    debug!(%printer, %jobid, "pruning stale changed-list entry");
                    self.changed_remove(&db, jobid)?;
                }
            }
        }

        entries.sort_by_key(|e| e.time);
        if cfg.max_reported_jobs > 0 {
            entries.truncate(cfg.max_reported_jobs);
        }
        let status = self.stored_status(&db, printer)?;
        Ok((entries, status))
    }

    /// Number of jobs in the queue and the printer's status summary.
    pub fn queue_length(&self, printer: &str) -> Result<(usize, QueueStatus)> {
        self.printer_config(printer)?;
        self.refresh_if_stale(printer)?;
        let db = self.stores.acquire(printer)?;
        let total = db.fetch_i64(keys::TOTAL_JOBS)?.unwrap_or(0).max(0) as usize;
        Ok((total, self.stored_status(&db, printer)?))
    }
}
