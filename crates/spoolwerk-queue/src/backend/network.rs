// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// IPP network print service backend.
//
// Uses the `ipp` crate's async API:
//   - Get-Jobs                (RFC 8011 §4.2.6)  queue listing
//   - Get-Printer-Attributes  (RFC 8011 §4.2.5)  printer state
//   - Print-Job               (RFC 8011 §4.2.1)  submission
//   - Cancel-Job              (RFC 8011 §4.2.8)
//
// The spool file name is sent as the job title so that reconciliation can
// match listed jobs back to local rows.  The engine is synchronous, so each
// call blocks on a runtime owned by the service, bounded by a per-request
// timeout.  Calls must not be made from inside an async task (use
// `spawn_blocking`).

use std::future::Future;
use std::io::Cursor;
use std::time::Duration;

use chrono::Utc;
use ipp::prelude::*;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, instrument, warn};

use spoolwerk_core::error::{Result, SpoolError};
use spoolwerk_core::{BackendStatus, ExternalQueueEntry, JobStatus, PrintJob};

use super::PrintBackend;

/// IPP `printer-state` value for a stopped printer.
const PRINTER_STATE_STOPPED: i32 = 5;

/// Longest wait for one IPP exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// IPP client bound to one printer URI.
pub struct NetworkPrintService {
    uri: Uri,
    timeout: Duration,
    /// Taken on drop; only `None` while dropping.
    runtime: Option<Runtime>,
}

impl std::fmt::Debug for NetworkPrintService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkPrintService")
            .field("uri", &self.uri.to_string())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Drop for NetworkPrintService {
    fn drop(&mut self) {
        // Dropping a runtime from async code panics; never block here.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl NetworkPrintService {
    /// Bind to an `ipp://` or `ipps://` URI.  The service drives its own
    /// single-worker runtime, so the I/O makes progress whichever thread
    /// blocks on it.
    pub fn new(uri: &str) -> Result<Self> {
        let parsed: Uri = uri
            .parse()
            .map_err(|e| SpoolError::Config(format!("invalid printer URI '{uri}': {e}")))?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("spoolwerk-ipp")
            .enable_all()
            .build()?;
        Ok(Self {
            uri: parsed,
            timeout: REQUEST_TIMEOUT,
            runtime: Some(runtime),
        })
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Run one IPP exchange to completion or until the timeout elapses.
    fn wait<F, E>(&self, what: &str, request: F) -> Result<IppRequestResponse>
    where
        F: Future<Output = std::result::Result<IppRequestResponse, E>>,
        E: std::fmt::Display,
    {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| SpoolError::BackendUnavailable(format!("{what}: client shut down")))?;
        let limit = self.timeout;
        match runtime.block_on(async move { tokio::time::timeout(limit, request).await }) {
            Ok(result) => checked(result, what),
            Err(_) => {
                warn!(uri = %self.uri, ?limit, "{what} timed out");
                Err(SpoolError::BackendUnavailable(format!(
                    "{what}: no answer within {limit:?}"
                )))
            }
        }
    }

    fn external_id(job: &PrintJob) -> Result<i32> {
        job.external_job_id.ok_or_else(|| {
            SpoolError::InvalidState(format!("job {} has no printer job id", job.jobid))
        })
    }

    fn unsupported(what: &str) -> SpoolError {
        SpoolError::Backend(format!("{what} is not supported by IPP print services"))
    }
}

/// Map a transport error or a non-success status into the error taxonomy.
fn checked<E: std::fmt::Display>(
    result: std::result::Result<IppRequestResponse, E>,
    what: &str,
) -> Result<IppRequestResponse> {
    let response = result.map_err(|e| SpoolError::BackendUnavailable(format!("{what}: {e}")))?;
    if !response.header().status_code().is_success() {
        let code = response.header().status_code();
        error!(status = ?code, "{what} failed");
        return Err(SpoolError::Backend(format!("{what} returned status {code:?}")));
    }
    Ok(response)
}

fn int_attr(attrs: &std::collections::HashMap<String, IppAttribute>, name: &str) -> Option<i32> {
    match attrs.get(name)?.value() {
        IppValue::Integer(v) | IppValue::Enum(v) => Some(*v),
        _ => None,
    }
}

fn text_attr(attrs: &std::collections::HashMap<String, IppAttribute>, name: &str) -> Option<String> {
    attrs.get(name).map(|a| format!("{}", a.value()))
}

/// IPP `job-state` to local status.
fn job_state(state: i32) -> JobStatus {
    match state {
        4 => JobStatus::Paused,
        5 => JobStatus::Printing,
        6 => JobStatus::Blocked,
        7 | 8 => JobStatus::Deleted,
        9 => JobStatus::Printed,
        _ => JobStatus::Queued,
    }
}

fn parse_jobs(attrs: &IppAttributes, now: i64) -> Vec<ExternalQueueEntry> {
    let mut jobs = Vec::new();
    for (position, group) in attrs.groups_of(DelimiterTag::JobAttributes).enumerate() {
        let a = group.attributes();
        let Some(job) = int_attr(a, "job-id") else {
            continue;
        };
        let size_kb = int_attr(a, "job-k-octets").unwrap_or(0);
        jobs.push(ExternalQueueEntry {
            job,
            size: u64::try_from(size_kb).unwrap_or(0) * 1024,
            status: job_state(int_attr(a, "job-state").unwrap_or(3)),
            user: text_attr(a, "job-originating-user-name").unwrap_or_default(),
            file_name: text_attr(a, "job-name").unwrap_or_default(),
            priority: u32::try_from(int_attr(a, "job-priority").unwrap_or(50)).unwrap_or(50),
            submitted_at: int_attr(a, "time-at-creation").map_or(now, i64::from),
        });
        debug!(job, position, "listed IPP job");
    }
    jobs
}

fn parse_printer_status(attrs: &IppAttributes) -> BackendStatus {
    let mut status = BackendStatus::default();
    for group in attrs.groups_of(DelimiterTag::PrinterAttributes) {
        let a = group.attributes();
        if int_attr(a, "printer-state") == Some(PRINTER_STATE_STOPPED) {
            status.fatal_stop = true;
        }
        if let Some(msg) = text_attr(a, "printer-state-message") {
            status.message = msg;
        }
    }
    status
}

impl PrintBackend for NetworkPrintService {
    #[instrument(skip(self), fields(uri = %self.uri))]
    fn queue_snapshot(&self, _printer: &str) -> Result<(Vec<ExternalQueueEntry>, BackendStatus)> {
        let client = AsyncIppClient::new(self.uri.clone());
        let jobs_op = IppOperationBuilder::get_jobs(self.uri.clone()).build();
        let jobs = self.wait("Get-Jobs", client.send(jobs_op))?;

        let attrs_op = IppOperationBuilder::get_printer_attributes(self.uri.clone()).build();
        let printer = self.wait("Get-Printer-Attributes", client.send(attrs_op))?;

        let entries = parse_jobs(jobs.attributes(), Utc::now().timestamp());
        debug!(count = entries.len(), "received job list");
        Ok((entries, parse_printer_status(printer.attributes())))
    }

    #[instrument(skip(self, job), fields(uri = %self.uri, jobid = %job.jobid))]
    fn submit_job(&self, _printer: &str, job: &PrintJob) -> Result<Option<i32>> {
        let document = std::fs::read(&job.spool_file)?;
        let title = job
            .spool_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| job.job_name.clone());

        let payload = IppPayload::new(Cursor::new(document));
        let operation = IppOperationBuilder::print_job(self.uri.clone(), payload)
            .job_title(&title)
            .document_format("application/octet-stream")
            .build();
        let client = AsyncIppClient::new(self.uri.clone());

        info!(%title, "sending Print-Job");
        let response = self.wait("Print-Job", client.send(operation))?;

        let mut external = None;
        for group in response.attributes().groups_of(DelimiterTag::JobAttributes) {
            if let Some(id) = int_attr(group.attributes(), "job-id") {
                external = Some(id);
            }
        }
        info!(external_job_id = ?external, "print job accepted by printer");
        Ok(external)
    }

    fn cancel_job(&self, _printer: &str, job: &PrintJob) -> Result<()> {
        let id = Self::external_id(job)?;
        let operation = IppOperationBuilder::cancel_job(self.uri.clone(), id).build();
        let client = AsyncIppClient::new(self.uri.clone());

        info!(job_id = id, "sending Cancel-Job");
        self.wait("Cancel-Job", client.send(operation))?;
        Ok(())
    }

    fn pause_job(&self, _printer: &str, _job: &PrintJob) -> Result<()> {
        Err(Self::unsupported("holding a job"))
    }

    fn resume_job(&self, _printer: &str, _job: &PrintJob) -> Result<()> {
        Err(Self::unsupported("releasing a job"))
    }

    fn pause_queue(&self, _printer: &str) -> Result<()> {
        Err(Self::unsupported("pausing the queue"))
    }

    fn resume_queue(&self, _printer: &str) -> Result<()> {
        Err(Self::unsupported("resuming the queue"))
    }
}
