// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Cache staleness and refresh coordination across processes.
//
// A printer's reconciled view is trusted for `cache_time_secs`.  When it
// goes stale, exactly one process becomes the refresh owner: it takes the
// refresh lock, re-checks staleness and the owner marker, writes itself as
// owner, drops the lock and runs reconciliation.  The owner marker lives in
// the printer's store so a crashed owner is detected by liveness, not by
// trusting a timestamp.

use tracing::{debug, info, instrument, warn};

use spoolwerk_core::ProcessId;
use spoolwerk_core::error::{Result, SpoolError};

use crate::bus::SpoolMessage;
use crate::context::SpoolContext;
use crate::reconcile::ReconcileReport;
use crate::store::{PrinterDb, keys};

/// What a refresh attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Cache was still valid; nothing to do.
    Fresh,
    /// Another live process is refreshing this printer.
    Skipped,
    /// The refresh lock could not be taken in time; the cache is used as is.
    TimedOut,
    /// Request handed to the designated worker process.
    Requested,
    Refreshed(ReconcileReport),
}

impl SpoolContext {
    /// Whether the printer's cached queue needs a refresh.
    ///
    /// Stale when never refreshed, explicitly flushed, older than the cache
    /// time, or implausibly far in the future.  With `check_pending`, a
    /// refresh already requested within the pending window counts as fresh.
    pub(crate) fn cache_expired(&self, db: &PrinterDb, printer: &str, check_pending: bool) -> Result<bool> {
        let now = self.clock.now();
        let last = match db.fetch_i64(&keys::cache(printer)) {
            Ok(v) => v,
            Err(SpoolError::RecordCorrupt(_)) => None,
            Err(e) => return Err(e),
        };
        let cache_time = self.config.cache_time_secs as i64;
        let lookahead = self.config.max_cache_valid_secs as i64;

        let expired = match last {
            None | Some(-1) => true,
            Some(t) => now - t >= cache_time || t > now + lookahead,
        };
        if !expired {
            return Ok(false);
        }
        if check_pending {
            let pending = db.fetch_i64(&keys::pending(printer)).ok().flatten().unwrap_or(0);
            let window = self.config.pending_refresh_window_secs as i64;
            if pending > 0 && pending + window > now {
                debug!(%printer, pending, "refresh already requested");
                return Ok(false);
            }
        }
        debug!(%printer, ?last, now, "queue cache expired");
        Ok(true)
    }

    /// Live process currently refreshing the printer, if any.
    pub(crate) fn refresh_owner(&self, db: &PrinterDb, printer: &str) -> Result<Option<ProcessId>> {
        let owner = match db.fetch_i64(&keys::updating(printer)) {
            Ok(Some(pid)) if pid > 0 => ProcessId(pid as u32),
            Ok(_) | Err(SpoolError::RecordCorrupt(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if self.host.process_exists(owner) {
            Ok(Some(owner))
        } else {
            debug!(%printer, %owner, "refresh owner is gone");
            Ok(None)
        }
    }

    fn set_refresh_owner(&self, db: &PrinterDb, printer: &str, owner: Option<ProcessId>) -> Result<()> {
        let key = keys::updating(printer);
        match owner {
            Some(pid) => db.put_i64(&key, i64::from(pid.0)),
            None => db.remove(&key).map(|_| ()),
        }
    }

    /// Mark the printer's cache stale.
    pub(crate) fn flush_cache(&self, db: &PrinterDb, printer: &str) -> Result<()> {
        db.put_i64(&keys::cache(printer), -1)
    }

    /// Invalidate a printer's cached queue so the next read refreshes it.
    pub fn invalidate_cache(&self, printer: &str) -> Result<()> {
        self.printer_config(printer)?;
        let db = self.stores.acquire(printer)?;
        self.flush_cache(&db, printer)
    }

    /// Reconcile the printer if nobody else is, serialised across processes.
    #[instrument(skip(self), fields(printer = %printer))]
    pub fn update_with_lock(&self, printer: &str) -> Result<RefreshOutcome> {
        self.printer_config(printer)?;
        let db = self.stores.acquire(printer)?;

        if !self.cache_expired(&db, printer, false)? {
            return Ok(RefreshOutcome::Fresh);
        }
        if let Some(owner) = self.refresh_owner(&db, printer)? {
            debug!(%owner, "refresh in progress elsewhere");
            return Ok(RefreshOutcome::Skipped);
        }

        {
            let _guard = match db.lock(&keys::refresh_lock(printer), self.config.refresh_lock_timeout()) {
                Ok(guard) => guard,
                Err(SpoolError::LockTimeout(lock)) => {
                    warn!(%lock, "refresh lock timed out, using cached queue");
                    return Ok(RefreshOutcome::TimedOut);
                }
                Err(e) => return Err(e),
            };
            // Someone may have finished or started while we waited.
            if !self.cache_expired(&db, printer, false)? {
                return Ok(RefreshOutcome::Fresh);
            }
            if let Some(owner) = self.refresh_owner(&db, printer)? {
                debug!(%owner, "refresh claimed while waiting for lock");
                return Ok(RefreshOutcome::Skipped);
            }
            self.set_refresh_owner(&db, printer, Some(self.me))?;
        }

        let result = self.reconcile(&db, printer);

        if let Err(e) = self.set_refresh_owner(&db, printer, None) {
            warn!(error = %e, "failed to clear refresh owner");
        }
        match result {
            Ok(report) => {
                info!(entries = report.entries, total = report.total, pruned = report.pruned, "queue refreshed");
                Ok(RefreshOutcome::Refreshed(report))
            }
            Err(e) => {
                warn!(error = %e, "queue refresh failed, keeping cached queue");
                Err(e)
            }
        }
    }

    /// Refresh a printer's queue.
    ///
    /// Forced requests, and processes without a separate worker, refresh
    /// inline.  Otherwise the pending marker is set and the worker is asked;
    /// if the worker cannot be reached the marker is cleared and the refresh
    /// runs inline instead.
    pub fn request_refresh(&self, printer: &str, force: bool) -> Result<RefreshOutcome> {
        let delegate = match (&self.bus, self.worker) {
            (Some(bus), Some(worker)) if !force && worker != self.me => Some((bus, worker)),
            _ => None,
        };
        let Some((bus, worker)) = delegate else {
            return self.update_with_lock(printer);
        };

        let db = self.stores.acquire(printer)?;
        db.put_i64(&keys::pending(printer), self.clock.now())?;
        let sent = bus.send(
            worker,
            SpoolMessage::RefreshPrinter {
                printer: printer.to_owned(),
            },
        );
        match sent {
            Ok(()) => {
                debug!(%printer, %worker, "refresh requested from worker");
                Ok(RefreshOutcome::Requested)
            }
            Err(e) => {
                warn!(%printer, %worker, error = %e, "refresh worker unreachable, refreshing inline");
                db.put_i64(&keys::pending(printer), 0)?;
                drop(db);
                self.update_with_lock(printer)
            }
        }
    }

    /// Refresh if stale, tolerating an unreachable backend or a busy lock:
    /// readers then see the last good queue.
    pub fn refresh_if_stale(&self, printer: &str) -> Result<()> {
        let stale = {
            let db = self.stores.acquire(printer)?;
            self.cache_expired(&db, printer, true)?
        };
        if !stale {
            return Ok(());
        }
        match self.request_refresh(printer, false) {
            Ok(_) => Ok(()),
            Err(e @ (SpoolError::BackendUnavailable(_) | SpoolError::LockTimeout(_))) => {
                warn!(%printer, error = %e, "refresh skipped, serving cached queue");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::bus::{LocalBus, MessageBus};
    use crate::testutil::{Fixture, T0, external_entry};

    #[test]
    fn requests_within_the_window_query_once() {
        let fx = Fixture::builder().build();
        assert!(matches!(
            fx.ctx.request_refresh("lp0", false).unwrap(),
            RefreshOutcome::Refreshed(_)
        ));
        assert_eq!(fx.ctx.request_refresh("lp0", false).unwrap(), RefreshOutcome::Fresh);
        fx.ctx.refresh_if_stale("lp0").unwrap();
        assert_eq!(fx.backend.snapshot_calls(), 1);

        fx.clock.advance(fx.ctx.config().cache_time_secs as i64);
        fx.ctx.refresh_if_stale("lp0").unwrap();
        assert_eq!(fx.backend.snapshot_calls(), 2);
    }

    #[test]
    fn concurrent_refreshes_reconcile_once() {
        let fx = Fixture::builder().build();
        fx.backend.set_query_delay(Duration::from_millis(150));
        fx.backend.add_external("lp0", external_entry(1, "a.ps", T0 - 1));

        let outcomes: Vec<RefreshOutcome> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| fx.ctx.update_with_lock("lp0").unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(fx.backend.snapshot_calls(), 1);
        let refreshed = outcomes
            .iter()
            .filter(|o| matches!(o, RefreshOutcome::Refreshed(_)))
            .count();
        assert_eq!(refreshed, 1);
        assert!(
            outcomes
                .iter()
                .all(|o| matches!(o, RefreshOutcome::Refreshed(_) | RefreshOutcome::Fresh | RefreshOutcome::Skipped))
        );
    }

    #[test]
    fn busy_refresh_lock_times_out() {
        let fx = Fixture::builder().config(|c| c.refresh_lock_timeout_secs = 0).build();
        let other = ProcessId(6_000_001);
        fx.host.spawn(other);
        let db = fx.ctx.stores().acquire("lp0").unwrap();

        let guard = db.lock_as(&keys::refresh_lock("lp0"), other, Duration::ZERO).unwrap();
        assert_eq!(fx.ctx.update_with_lock("lp0").unwrap(), RefreshOutcome::TimedOut);
        assert_eq!(fx.backend.snapshot_calls(), 0);

        drop(guard);
        assert!(matches!(
            fx.ctx.update_with_lock("lp0").unwrap(),
            RefreshOutcome::Refreshed(_)
        ));
    }

    #[test]
    fn live_owner_is_left_alone_and_dead_owner_is_ignored() {
        let fx = Fixture::builder().build();
        let owner = ProcessId(6_000_002);
        fx.host.spawn(owner);
        let db = fx.ctx.stores().acquire("lp0").unwrap();
        db.put_i64(&keys::updating("lp0"), i64::from(owner.0)).unwrap();

        assert_eq!(fx.ctx.update_with_lock("lp0").unwrap(), RefreshOutcome::Skipped);

        fx.host.kill(owner);
        assert!(matches!(
            fx.ctx.update_with_lock("lp0").unwrap(),
            RefreshOutcome::Refreshed(_)
        ));
        assert_eq!(db.fetch_i64(&keys::updating("lp0")).unwrap(), None);
    }

    #[test]
    fn timestamps_far_in_the_future_count_as_stale() {
        let fx = Fixture::builder().build();
        let db = fx.ctx.stores().acquire("lp0").unwrap();

        db.put_i64(&keys::cache("lp0"), T0 + 100).unwrap();
        assert!(!fx.ctx.cache_expired(&db, "lp0", false).unwrap());

        let skewed = T0 + fx.ctx.config().max_cache_valid_secs as i64 + 1;
        db.put_i64(&keys::cache("lp0"), skewed).unwrap();
        assert!(fx.ctx.cache_expired(&db, "lp0", false).unwrap());
    }

    #[test]
    fn invalidated_cache_is_refreshed() {
        let fx = Fixture::builder().build();
        fx.ctx.refresh_if_stale("lp0").unwrap();
        fx.ctx.invalidate_cache("lp0").unwrap();
        fx.ctx.refresh_if_stale("lp0").unwrap();
        assert_eq!(fx.backend.snapshot_calls(), 2);
    }

    #[test]
    fn requests_are_delegated_to_the_worker_and_throttled() {
        let bus = Arc::new(LocalBus::new(8));
        let worker = ProcessId(6_000_003);
        let mut mailbox = bus.register(worker).unwrap();
        let fx = Fixture::builder().bus(bus.clone()).worker(worker).build();

        fx.ctx.refresh_if_stale("lp0").unwrap();
        assert_eq!(
            mailbox.try_recv(),
            Some(SpoolMessage::RefreshPrinter { printer: "lp0".into() })
        );
        assert_eq!(fx.backend.snapshot_calls(), 0);

        // Still pending: no second message.
        fx.ctx.refresh_if_stale("lp0").unwrap();
        assert_eq!(mailbox.try_recv(), None);

        fx.clock.advance(fx.ctx.config().pending_refresh_window_secs as i64);
        fx.ctx.refresh_if_stale("lp0").unwrap();
        assert!(mailbox.try_recv().is_some());

        // Forced requests never wait for the worker.
        assert!(matches!(
            fx.ctx.request_refresh("lp0", true).unwrap(),
            RefreshOutcome::Refreshed(_)
        ));
        assert_eq!(fx.backend.snapshot_calls(), 1);
    }

    #[test]
    fn unreachable_worker_falls_back_to_an_inline_refresh() {
        let bus = Arc::new(LocalBus::new(8));
        let worker = ProcessId(6_000_004);
        let fx = Fixture::builder().bus(bus.clone()).worker(worker).build();

        // No mailbox registered for the worker.
        fx.ctx.refresh_if_stale("lp0").unwrap();
        assert_eq!(fx.backend.snapshot_calls(), 1);
        let db = fx.ctx.stores().acquire("lp0").unwrap();
        assert_eq!(db.fetch_i64(&keys::pending("lp0")).unwrap(), Some(0));

        // A full mailbox is no better.
        let _mailbox = bus.register(worker).unwrap();
        for _ in 0..8 {
            bus.send(worker, SpoolMessage::RefreshPrinter { printer: "lp1".into() }).unwrap();
        }
        fx.ctx.invalidate_cache("lp0").unwrap();
        assert!(matches!(
            fx.ctx.request_refresh("lp0", false).unwrap(),
            RefreshOutcome::Refreshed(_)
        ));
        assert_eq!(fx.backend.snapshot_calls(), 2);
    }

    #[test]
    fn unreachable_backend_serves_the_cached_queue() {
        let fx = Fixture::builder().build();
        fx.backend.set_unavailable(true);
        fx.ctx.refresh_if_stale("lp0").unwrap();
        let (entries, status) = fx.ctx.queue_status("lp0").unwrap();
        assert!(entries.is_empty());
        assert_eq!(status.job_count, 0);

        // The failed pass still stamped the cache; force another attempt.
        fx.ctx.invalidate_cache("lp0").unwrap();
        assert!(matches!(
            fx.ctx.update_with_lock("lp0"),
            Err(SpoolError::BackendUnavailable(_))
        ));
    }
}
