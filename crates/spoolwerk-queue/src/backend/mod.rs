// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// External print system capability surface.
//
// The lifecycle and reconciliation code only ever talk to a printer through
// [`PrintBackend`].  Production queues are bound to one of the [`Backend`]
// variants; tests substitute a scripted implementation.

pub mod local;
pub mod network;

use spoolwerk_core::error::Result;
use spoolwerk_core::{BackendConfig, BackendStatus, ExternalQueueEntry, PrintJob};

pub use local::LocalSpool;
pub use network::NetworkPrintService;

/// Operations the spooler needs from an external print system.
///
/// Calls are synchronous and may block on process spawns or network round
/// trips; async callers run them on a blocking thread.
pub trait PrintBackend: Send + Sync {
    /// Full listing of the printer's queue plus its printer-level status.
    fn queue_snapshot(&self, printer: &str) -> Result<(Vec<ExternalQueueEntry>, BackendStatus)>;

    /// Hand a finished spool file to the backend.  Returns the backend's job
    /// number when it reports one synchronously.
    fn submit_job(&self, printer: &str, job: &PrintJob) -> Result<Option<i32>>;

    fn cancel_job(&self, printer: &str, job: &PrintJob) -> Result<()>;

    fn pause_job(&self, printer: &str, job: &PrintJob) -> Result<()>;

    fn resume_job(&self, printer: &str, job: &PrintJob) -> Result<()>;

    fn pause_queue(&self, printer: &str) -> Result<()>;

    fn resume_queue(&self, printer: &str) -> Result<()>;
}

/// Production backends.
#[derive(Debug)]
pub enum Backend {
    LocalSpool(LocalSpool),
    NetworkPrintService(NetworkPrintService),
}

impl Backend {
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        Ok(match config {
            BackendConfig::LocalSpool(commands) => Self::LocalSpool(LocalSpool::new(commands.clone())),
            BackendConfig::NetworkPrintService { uri } => {
                Self::NetworkPrintService(NetworkPrintService::new(uri)?)
            }
        })
    }

    fn inner(&self) -> &dyn PrintBackend {
        match self {
            Self::LocalSpool(b) => b,
            Self::NetworkPrintService(b) => b,
        }
    }
}

impl PrintBackend for Backend {
    fn queue_snapshot(&self, printer: &str) -> Result<(Vec<ExternalQueueEntry>, BackendStatus)> {
        self.inner().queue_snapshot(printer)
    }

    fn submit_job(&self, printer: &str, job: &PrintJob) -> Result<Option<i32>> {
        self.inner().submit_job(printer, job)
    }

    fn cancel_job(&self, printer: &str, job: &PrintJob) -> Result<()> {
        self.inner().cancel_job(printer, job)
    }

    fn pause_job(&self, printer: &str, job: &PrintJob) -> Result<()> {
        self.inner().pause_job(printer, job)
    }

    fn resume_job(&self, printer: &str, job: &PrintJob) -> Result<()> {
        self.inner().resume_job(printer, job)
    }

    fn pause_queue(&self, printer: &str) -> Result<()> {
        self.inner().pause_queue(printer)
    }

    fn resume_queue(&self, printer: &str) -> Result<()> {
        self.inner().resume_queue(printer)
    }
}
