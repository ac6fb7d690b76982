// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spooler configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpoolError};

/// Process-wide spooler settings shared by every cooperating process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    /// Directory holding one store file per printer.
    pub state_dir: PathBuf,
    /// Hard cap on concurrently open printer stores.
    pub max_open_stores: usize,
    /// A reconciled queue is trusted for this many seconds.
    pub cache_time_secs: u64,
    /// Refresh timestamps further than this in the future are treated as clock skew.
    pub max_cache_valid_secs: u64,
    /// Asynchronous refresh requests are sent at most once per window.
    pub pending_refresh_window_secs: u64,
    pub refresh_lock_timeout_secs: u64,
    pub jobid_lock_timeout_secs: u64,
    pub subscriber_lock_timeout_secs: u64,
    /// Job ids wrap from here back to 1.  Also the base of the synthetic id
    /// range given to jobs found only in a backend listing.
    pub max_jobid: u32,
    /// Draws from the id counter before `start` gives up.
    pub jobid_attempts: u32,
    /// Only the first N pending notifications are scanned for coalescing.
    pub notify_coalesce_limit: usize,
    /// Subscribers with at least this many undelivered messages are skipped.
    pub notify_backlog_limit: usize,
    /// Messages a process mailbox holds before senders are refused.
    pub mailbox_capacity: usize,
    /// How often an idle shared mailbox is re-checked.
    pub mailbox_poll_ms: u64,
    /// Lists the host's print queues, one per line, to confirm that
    /// auto-discovered queues still exist.  Empty disables the check.
    pub queue_list_command: String,
    pub printers: Vec<PrinterConfig>,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/spoolwerk"),
            max_open_stores: 50,
            cache_time_secs: 30,
            max_cache_valid_secs: 3600,
            pending_refresh_window_secs: 60,
            refresh_lock_timeout_secs: 10,
            jobid_lock_timeout_secs: 20,
            subscriber_lock_timeout_secs: 10,
            max_jobid: 10_000,
            jobid_attempts: 3,
            notify_coalesce_limit: 100,
            notify_backlog_limit: 256,
            mailbox_capacity: 1024,
            mailbox_poll_ms: 250,
            queue_list_command: "lpstat -a".into(),
            printers: Vec::new(),
        }
    }
}

impl SpoolConfig {
    /// Load a JSON configuration file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_jobid < 2 {
            return Err(SpoolError::Config(format!(
                "max_jobid must be at least 2, got {}",
                self.max_jobid
            )));
        }
        if self.jobid_attempts == 0 {
            return Err(SpoolError::Config("jobid_attempts must be non-zero".into()));
        }
        if self.max_open_stores == 0 {
            return Err(SpoolError::Config("max_open_stores must be non-zero".into()));
        }
        let mut seen = HashSet::new();
        for printer in &self.printers {
            if printer.name.is_empty() {
                return Err(SpoolError::Config("printer with empty name".into()));
            }
            if !seen.insert(printer.name.as_str()) {
                return Err(SpoolError::Config(format!(
                    "printer '{}' configured twice",
                    printer.name
                )));
            }
        }
        Ok(())
    }

    pub fn printer(&self, name: &str) -> Option<&PrinterConfig> {
        self.printers.iter().find(|p| p.name == name)
    }

    pub fn cache_time(&self) -> Duration {
        Duration::from_secs(self.cache_time_secs)
    }

    pub fn refresh_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_lock_timeout_secs)
    }

    pub fn jobid_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.jobid_lock_timeout_secs)
    }

    pub fn subscriber_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.subscriber_lock_timeout_secs)
    }

    pub fn mailbox_poll_interval(&self) -> Duration {
        Duration::from_millis(self.mailbox_poll_ms)
    }
}

/// One print queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterConfig {
    pub name: String,
    /// Where spool files are created.
    pub spool_dir: PathBuf,
    pub backend: BackendConfig,
    /// Maximum jobs in the queue; 0 disables the check.
    #[serde(default)]
    pub max_jobs: usize,
    /// Maximum entries reported to clients; 0 means unlimited.
    #[serde(default)]
    pub max_reported_jobs: usize,
    /// `start` is refused while free spool space is below twice this; 0 disables.
    #[serde(default)]
    pub min_free_space_kb: u64,
    /// Queue came from the system printer list and may disappear from it.
    #[serde(default)]
    pub auto_discovered: bool,
    /// Users allowed to print; empty allows everyone.
    #[serde(default)]
    pub allowed_users: Vec<String>,
    /// Users who may administer every job and the queue itself.
    #[serde(default)]
    pub operators: Vec<String>,
    #[serde(default)]
    pub print_hours: Option<PrintHours>,
}

impl PrinterConfig {
    pub fn is_operator(&self, user: &str) -> bool {
        self.operators.iter().any(|u| u == user)
    }

    pub fn allows(&self, user: &str) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.iter().any(|u| u == user)
    }
}

/// Local-time window `[start, end)` in which jobs may be started.
///
/// Wraps past midnight when `start > end`; `start == end` never opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintHours {
    pub start: u32,
    pub end: u32,
}

impl PrintHours {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            hour >= self.start && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

/// Which external print system a queue is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Command-driven local spooler (`lpr`/`lpq` family).
    LocalSpool(LocalSpoolCommands),
    /// IPP printer or print server.
    NetworkPrintService { uri: String },
}

/// Command templates for a command-driven spooler.
///
/// Substitutions: `%p` printer, `%j` backend job number, `%s` spool file,
/// `%J` job name, `%U` user.  An empty template means unsupported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSpoolCommands {
    pub queue: String,
    pub submit: String,
    pub cancel: String,
    pub pause_job: String,
    pub resume_job: String,
    pub pause_queue: String,
    pub resume_queue: String,
}

impl Default for LocalSpoolCommands {
    fn default() -> Self {
        Self {
            queue: "lpq -P%p".into(),
            submit: "lpr -r -P%p -J%J %s".into(),
            cancel: "lprm -P%p %j".into(),
            pause_job: "lpc hold %p %j".into(),
            resume_job: "lpc release %p %j".into(),
            pause_queue: "lpc stop %p".into(),
            resume_queue: "lpc start %p".into(),
        }
    }
}
