// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Clock and host probes.
//
// Everything the engine asks of the operating system goes through these two
// traits so that tests can script time, process liveness and disk space.

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{Local, Timelike, Utc};
use tracing::{debug, warn};

use spoolwerk_core::ProcessId;
use spoolwerk_core::error::{Result, SpoolError};

/// Wall-clock source.
pub trait Clock: Send + Sync {
    /// Unix seconds.
    fn now(&self) -> i64;

    /// Hour of day (0..24) in the host's local time zone.
    fn local_hour(&self) -> u32;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn local_hour(&self) -> u32 {
        Local::now().hour()
    }
}

/// Settable clock for tests.  Its local time zone is UTC.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn local_hour(&self) -> u32 {
        (self.now().rem_euclid(86_400) / 3_600) as u32
    }
}

/// Questions about the host the spooler runs on.
pub trait HostProbe: Send + Sync {
    /// Whether a cooperating process is still alive.
    fn process_exists(&self, pid: ProcessId) -> bool;

    /// Free space available to unprivileged users, in KiB.  `None` if unknown.
    fn free_space_kb(&self, path: &Path) -> Option<u64>;

    /// Whether an auto-discovered queue is still present in the system list.
    fn queue_listed(&self, _printer: &str) -> bool {
        true
    }
}

/// Queue names from a system queue listing.
///
/// Understands `lpstat -a` / `lpstat -p` / `lpstat -v` and `lpc status`
/// output; any other unindented line contributes its first word.
pub(crate) fn parse_queue_list(text: &str) -> Vec<String> {
    let mut queues = Vec::new();
    let lines = text
        .lines()
        .filter(|l| !l.starts_with(char::is_whitespace))
        .map(str::trim)
        .filter(|l| !l.is_empty());
    for line in lines {
        let name = if let Some(rest) = line.strip_prefix("device for ") {
            rest.split(':').next()
        } else if let Some(rest) = line.strip_prefix("printer ") {
            rest.split_whitespace().next()
        } else {
            line.split_whitespace().next().map(|w| w.trim_end_matches(':'))
        };
        if let Some(name) = name.filter(|n| !n.is_empty())
            && !queues.iter().any(|q| q == name)
        {
            queues.push(name.to_owned());
        }
    }
    queues
}

/// Probes backed by the real operating system.
#[derive(Debug, Default, Clone)]
pub struct SystemHost {
    queue_list: String,
}

impl SystemHost {
    /// `queue_list` is a shell command printing the host's print queues.
    /// Empty skips the auto-discovered queue check.
    pub fn new(queue_list: impl Into<String>) -> Self {
        Self {
            queue_list: queue_list.into(),
        }
    }

    fn list_queues(&self) -> Result<Vec<String>> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.queue_list)
            .output()
            .map_err(|e| SpoolError::BackendUnavailable(format!("spawn `{}`: {e}", self.queue_list)))?;
        if !output.status.success() {
            return Err(SpoolError::Backend(format!(
                "`{}` exited with {}",
                self.queue_list, output.status
            )));
        }
        Ok(parse_queue_list(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Whether `printer` is in the system queue list.  An unreadable list
    /// counts as present so a broken listing command does not close every
    /// discovered queue.
    fn listed(&self, printer: &str) -> bool {
        if self.queue_list.trim().is_empty() {
            return true;
        }
        match self.list_queues() {
            Ok(queues) => {
                let listed = queues.iter().any(|q| q == printer);
                debug!(%printer, listed, known = queues.len(), "checked system queue list");
                listed
            }
            Err(e) => {
                warn!(%printer, error = %e, "system queue list unavailable, assuming queue present");
                true
            }
        }
    }
}

#[cfg(unix)]
impl HostProbe for SystemHost {
    fn process_exists(&self, pid: ProcessId) -> bool {
        let Ok(raw) = libc::pid_t::try_from(pid.0) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs only the existence and permission check.
        let rc = unsafe { libc::kill(raw, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn free_space_kb(&self, path: &Path) -> Option<u64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
        let mut stat = std::mem::MaybeUninit::<libc::statvfs>::uninit();
        // SAFETY: c_path is NUL-terminated and stat points to writable storage.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if rc != 0 {
            return None;
        }
        // SAFETY: statvfs returned 0 so the struct is initialised.
        let stat = unsafe { stat.assume_init() };
        #[allow(clippy::unnecessary_cast)]
        let bytes = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
        Some(bytes / 1024)
    }

    fn queue_listed(&self, printer: &str) -> bool {
        self.listed(printer)
    }
}

#[cfg(not(unix))]
impl HostProbe for SystemHost {
    fn process_exists(&self, pid: ProcessId) -> bool {
        pid == ProcessId::current()
    }

    fn free_space_kb(&self, _path: &Path) -> Option<u64> {
        None
    }

    fn queue_listed(&self, printer: &str) -> bool {
        self.listed(printer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockHost;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(30);
        assert_eq!(clock.now(), 1_030);
        clock.set(3 * 3_600 + 59);
        assert_eq!(clock.local_hour(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn system_host_sees_itself() {
        let host = SystemHost::default();
        assert!(host.process_exists(ProcessId::current()));
        assert!(!host.process_exists(ProcessId(0)));
        assert!(host.free_space_kb(Path::new("/")).is_some());
    }

    #[test]
    fn queue_list_formats_are_parsed() {
        let accepting = "lp0 accepting requests since Mon 12 Oct 2026\noffice accepting requests since Tue\n";
        assert_eq!(parse_queue_list(accepting), vec!["lp0", "office"]);

        let devices = "device for lp0: usb://HP/LaserJet\ndevice for office: ipp://10.0.0.5/ipp/print\n";
        assert_eq!(parse_queue_list(devices), vec!["lp0", "office"]);

        let printers = "printer lp0 is idle.  enabled since Mon\nprinter lp0 now printing lp0-12\n";
        assert_eq!(parse_queue_list(printers), vec!["lp0"]);

        assert_eq!(parse_queue_list("lp0:\n\tqueuing is enabled\n"), vec!["lp0"]);
        assert!(parse_queue_list("\n  \n").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn system_host_consults_the_queue_list_command() {
        let host = SystemHost::new("printf 'lp0 accepting requests\\noffice accepting requests\\n'");
        assert!(host.queue_listed("office"));
        assert!(!host.queue_listed("gone"));
    }

    #[cfg(unix)]
    #[test]
    fn broken_or_disabled_queue_list_keeps_queues() {
        assert!(SystemHost::new("exit 3").queue_listed("lp0"));
        assert!(SystemHost::new("").queue_listed("lp0"));
    }

    #[test]
    fn mock_host_tracks_liveness() {
        let host = MockHost::new();
        let other = ProcessId(999_999);
        assert!(!host.process_exists(other));
        host.spawn(other);
        assert!(host.process_exists(other));
        host.kill(other);
        assert!(!host.process_exists(other));
    }
}
