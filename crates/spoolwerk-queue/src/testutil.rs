// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Shared test support: a scriptable backend, a scriptable host and a
// ready-made context over a temporary directory.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use spoolwerk_core::error::{Result, SpoolError};
use spoolwerk_core::{
    BackendConfig, BackendStatus, ExternalQueueEntry, JobId, JobStatus, LocalSpoolCommands, PrintJob,
    PrinterConfig, ProcessId, SpoolConfig,
};

use crate::backend::PrintBackend;
use crate::bus::MessageBus;
use crate::context::SpoolContext;
use crate::host::{HostProbe, ManualClock};

pub const T0: i64 = 1_700_000_000;

/// Scriptable host for tests: an explicit set of live processes, a fixed free
/// space figure and a set of vanished queues.
#[derive(Debug)]
pub struct MockHost {
    live: Mutex<HashSet<ProcessId>>,
    free_kb: Mutex<Option<u64>>,
    unlisted: Mutex<HashSet<String>>,
}

impl Default for MockHost {
    fn default() -> Self {
        let mut live = HashSet::new();
        live.insert(ProcessId::current());
        Self {
            live: Mutex::new(live),
            free_kb: Mutex::new(None),
            unlisted: Mutex::new(HashSet::new()),
        }
    }
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&self, pid: ProcessId) {
        if let Ok(mut live) = self.live.lock() {
            live.insert(pid);
        }
    }

    pub fn kill(&self, pid: ProcessId) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(&pid);
        }
    }

    pub fn set_free_space_kb(&self, kb: Option<u64>) {
        if let Ok(mut free) = self.free_kb.lock() {
            *free = kb;
        }
    }

    pub fn unlist_queue(&self, printer: &str) {
        if let Ok(mut unlisted) = self.unlisted.lock() {
            unlisted.insert(printer.to_owned());
        }
    }
}

impl HostProbe for MockHost {
    fn process_exists(&self, pid: ProcessId) -> bool {
        self.live.lock().map(|l| l.contains(&pid)).unwrap_or(false)
    }

    fn free_space_kb(&self, _path: &Path) -> Option<u64> {
        self.free_kb.lock().ok().and_then(|f| *f)
    }

    fn queue_listed(&self, printer: &str) -> bool {
        self.unlisted
            .lock()
            .map(|u| !u.contains(printer))
            .unwrap_or(true)
    }
}

/// One call to `submit_job` as the mock saw it.
#[derive(Debug, Clone)]
pub struct Submission {
    pub jobid: JobId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockState {
    queues: HashMap<String, Vec<ExternalQueueEntry>>,
    status: BackendStatus,
    next_external: i32,
    snapshot_calls: usize,
    submissions: Vec<Submission>,
    cancels: Vec<i32>,
    queue_calls: Vec<&'static str>,
    fail_submit: bool,
    fail_cancel: bool,
    unavailable: bool,
    query_delay: Duration,
}

/// Backend that behaves like a small print server: submitted jobs show up
/// in its listing until cancelled or removed by the test.
#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        backend.with(|s| s.next_external = 100);
        backend
    }

    fn with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut state = self.state.lock().expect("mock backend poisoned");
        f(&mut state)
    }

    pub fn snapshot_calls(&self) -> usize {
        self.with(|s| s.snapshot_calls)
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.with(|s| s.submissions.clone())
    }

    pub fn cancels(&self) -> Vec<i32> {
        self.with(|s| s.cancels.clone())
    }

    pub fn queue_calls(&self) -> Vec<&'static str> {
        self.with(|s| s.queue_calls.clone())
    }

    pub fn set_fail_submit(&self, fail: bool) {
        self.with(|s| s.fail_submit = fail);
    }

    pub fn set_fail_cancel(&self, fail: bool) {
        self.with(|s| s.fail_cancel = fail);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.with(|s| s.unavailable = unavailable);
    }

    pub fn set_query_delay(&self, delay: Duration) {
        self.with(|s| s.query_delay = delay);
    }

    pub fn set_status(&self, status: BackendStatus) {
        self.with(|s| s.status = status);
    }

    /// Put a job straight into the backend queue, as if submitted elsewhere.
    pub fn add_external(&self, printer: &str, entry: ExternalQueueEntry) {
        self.with(|s| s.queues.entry(printer.to_owned()).or_default().push(entry));
    }

    /// Drop a job from the listing, as if it finished printing.
    pub fn finish(&self, printer: &str, external: i32) {
        self.with(|s| {
            if let Some(q) = s.queues.get_mut(printer) {
                q.retain(|e| e.job != external);
            }
        });
    }

    pub fn listing(&self, printer: &str) -> Vec<ExternalQueueEntry> {
        self.with(|s| s.queues.get(printer).cloned().unwrap_or_default())
    }

    fn set_listed_status(&self, printer: &str, job: &PrintJob, status: JobStatus) -> Result<()> {
        let external = job
            .external_job_id
            .ok_or_else(|| SpoolError::InvalidState("no external id".into()))?;
        self.with(|s| {
            let entry = s
                .queues
                .get_mut(printer)
                .and_then(|q| q.iter_mut().find(|e| e.job == external));
            match entry {
                Some(e) => {
                    e.status = status;
                    Ok(())
                }
                None => Err(SpoolError::Backend(format!("job {external} not queued"))),
            }
        })
    }
}

pub fn external_entry(job: i32, file_name: &str, submitted_at: i64) -> ExternalQueueEntry {
    ExternalQueueEntry {
        job,
        size: 4096,
        status: JobStatus::Queued,
        user: "remote".into(),
        file_name: file_name.into(),
        priority: 1,
        submitted_at,
    }
}

impl PrintBackend for MockBackend {
    fn queue_snapshot(&self, printer: &str) -> Result<(Vec<ExternalQueueEntry>, BackendStatus)> {
        let delay = self.with(|s| {
            s.snapshot_calls += 1;
            s.query_delay
        });
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.with(|s| {
            if s.unavailable {
                return Err(SpoolError::BackendUnavailable("mock backend offline".into()));
            }
            Ok((s.queues.get(printer).cloned().unwrap_or_default(), s.status.clone()))
        })
    }

    fn submit_job(&self, printer: &str, job: &PrintJob) -> Result<Option<i32>> {
        let payload = std::fs::read(&job.spool_file)?;
        self.with(|s| {
            if s.fail_submit {
                return Err(SpoolError::Backend("mock submit rejected".into()));
            }
            let external = s.next_external;
            s.next_external += 1;
            s.submissions.push(Submission {
                jobid: job.jobid,
                payload: payload.clone(),
            });
            let file_name = job
                .spool_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            s.queues.entry(printer.to_owned()).or_default().push(ExternalQueueEntry {
                job: external,
                size: payload.len() as u64,
                status: JobStatus::Queued,
                user: job.user.clone(),
                file_name,
                priority: 1,
                submitted_at: job.start_time,
            });
            Ok(Some(external))
        })
    }

    fn cancel_job(&self, printer: &str, job: &PrintJob) -> Result<()> {
        let external = job
            .external_job_id
            .ok_or_else(|| SpoolError::InvalidState("no external id".into()))?;
        self.with(|s| {
            s.cancels.push(external);
            if s.fail_cancel {
                return Err(SpoolError::Backend("mock cancel rejected".into()));
            }
            if let Some(q) = s.queues.get_mut(printer) {
                q.retain(|e| e.job != external);
            }
            Ok(())
        })
    }

    fn pause_job(&self, printer: &str, job: &PrintJob) -> Result<()> {
        self.set_listed_status(printer, job, JobStatus::Paused)
    }

    fn resume_job(&self, printer: &str, job: &PrintJob) -> Result<()> {
        self.set_listed_status(printer, job, JobStatus::Queued)
    }

    fn pause_queue(&self, _printer: &str) -> Result<()> {
        self.with(|s| s.queue_calls.push("pause"));
        Ok(())
    }

    fn resume_queue(&self, _printer: &str) -> Result<()> {
        self.with(|s| s.queue_calls.push("resume"));
        Ok(())
    }
}

pub fn sample_job(jobid: JobId) -> PrintJob {
    PrintJob {
        jobid,
        owner: Some(ProcessId::current()),
        external_job_id: None,
        spool_file: PathBuf::from(format!("/nonexistent/spool.{:08}.test", jobid.0)),
        start_time: T0,
        status: JobStatus::Spooling,
        size: 0,
        page_count: 0,
        spooled: false,
        originated_locally: true,
        job_name: "doc".into(),
        user: "alice".into(),
        queue_name: "lp0".into(),
        settings: Vec::new(),
    }
}

fn printer_config(root: &Path, name: &str) -> PrinterConfig {
    PrinterConfig {
        name: name.into(),
        spool_dir: root.join("spool").join(name),
        backend: BackendConfig::LocalSpool(LocalSpoolCommands::default()),
        max_jobs: 0,
        max_reported_jobs: 0,
        min_free_space_kb: 0,
        auto_discovered: false,
        allowed_users: Vec::new(),
        operators: vec!["root".into()],
        print_hours: None,
    }
}

/// A context over a temporary directory with printers `lp0` and `lp1`, both
/// bound to one [`MockBackend`].
pub struct Fixture {
    pub ctx: Arc<SpoolContext>,
    pub backend: Arc<MockBackend>,
    pub host: Arc<MockHost>,
    pub clock: Arc<ManualClock>,
    _dir: TempDir,
}

pub struct FixtureBuilder {
    dir: TempDir,
    config: SpoolConfig,
    bus: Option<Arc<dyn MessageBus>>,
    worker: Option<ProcessId>,
}

impl Fixture {
    pub fn builder() -> FixtureBuilder {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SpoolConfig {
            state_dir: dir.path().join("state"),
            refresh_lock_timeout_secs: 2,
            jobid_lock_timeout_secs: 2,
            subscriber_lock_timeout_secs: 2,
            printers: vec![printer_config(dir.path(), "lp0"), printer_config(dir.path(), "lp1")],
            ..SpoolConfig::default()
        };
        FixtureBuilder {
            dir,
            config,
            bus: None,
            worker: None,
        }
    }
}

impl FixtureBuilder {
    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn worker(mut self, pid: ProcessId) -> Self {
        self.worker = Some(pid);
        self
    }

    pub fn notify_backlog_limit(mut self, limit: usize) -> Self {
        self.config.notify_backlog_limit = limit;
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut SpoolConfig)) -> Self {
        f(&mut self.config);
        self
    }

    /// Edit printer `lp0`.
    pub fn printer(mut self, f: impl FnOnce(&mut PrinterConfig)) -> Self {
        f(&mut self.config.printers[0]);
        self
    }

    pub fn build(self) -> Fixture {
        let backend = Arc::new(MockBackend::new());
        let host = Arc::new(MockHost::new());
        let clock = Arc::new(ManualClock::new(T0));

        let mut builder = SpoolContext::builder(self.config)
            .clock(clock.clone())
            .host(host.clone())
            .backend("lp0", backend.clone())
            .backend("lp1", backend.clone());
        if let Some(bus) = self.bus {
            builder = builder.bus(bus);
        }
        if let Some(worker) = self.worker {
            builder = builder.worker(worker);
        }
        let ctx = Arc::new(builder.build().expect("context"));

        Fixture {
            ctx,
            backend,
            host,
            clock,
            _dir: self.dir,
        }
    }
}
