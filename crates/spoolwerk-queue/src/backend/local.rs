// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Command-driven local spooler backend (BSD `lpr`/`lpq`/`lprm`/`lpc` family).
//
// Every operation expands a configured shell command template and runs it
// through `sh -c`.  The queue listing is parsed from BSD `lpq` output:
//
//   lp0 is ready and printing
//   Rank   Owner   Job  Files                      Total Size
//   active alice   12   spool.00000042.Xa9fQ1      1024 bytes
//   1st    bob     13   report.txt                 2048 bytes

use std::path::Path;
use std::process::Command;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use spoolwerk_core::error::{Result, SpoolError};
use spoolwerk_core::{BackendStatus, ExternalQueueEntry, JobStatus, LocalSpoolCommands, PrintJob};

use super::PrintBackend;

/// Values substituted into a command template.
#[derive(Debug, Default)]
struct Substitutions<'a> {
    printer: &'a str,
    job: Option<i32>,
    spool_file: Option<&'a Path>,
    job_name: &'a str,
    user: &'a str,
}

impl<'a> Substitutions<'a> {
    fn printer(printer: &'a str) -> Self {
        Self {
            printer,
            ..Self::default()
        }
    }

    fn job(printer: &'a str, job: &'a PrintJob) -> Self {
        Self {
            printer,
            job: job.external_job_id,
            spool_file: Some(job.spool_file.as_path()),
            job_name: &job.job_name,
            user: &job.user,
        }
    }
}

/// Single-quote a value for `sh`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Expand `%p %j %s %J %U` (and `%%`) in a command template.  Unknown escapes
/// are kept literally.
fn expand(template: &str, subs: &Substitutions<'_>) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let value = match chars.peek() {
            Some('p') => shell_quote(subs.printer),
            Some('j') => subs.job.map(|j| j.to_string()).unwrap_or_default(),
            Some('s') => subs
                .spool_file
                .map(|p| shell_quote(&p.to_string_lossy()))
                .unwrap_or_default(),
            Some('J') => shell_quote(subs.job_name),
            Some('U') => shell_quote(subs.user),
            Some('%') => "%".to_owned(),
            _ => {
                out.push('%');
                continue;
            }
        };
        chars.next();
        out.push_str(&value);
    }
    out
}

/// Local spooler driven by shell commands.
#[derive(Debug, Clone)]
pub struct LocalSpool {
    commands: LocalSpoolCommands,
}

impl LocalSpool {
    pub fn new(commands: LocalSpoolCommands) -> Self {
        Self { commands }
    }

    /// Run one command template and return its stdout.
    fn run(&self, what: &str, template: &str, subs: &Substitutions<'_>) -> Result<String> {
        if template.trim().is_empty() {
            return Err(SpoolError::Backend(format!("no {what} command configured")));
        }
        let command = expand(template, subs);
        debug!(%command, "running spooler command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .map_err(|e| SpoolError::BackendUnavailable(format!("spawn `{command}`: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(%command, status = %output.status, "spooler command failed");
            return Err(SpoolError::Backend(format!(
                "`{command}` exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_for_job(&self, what: &str, template: &str, printer: &str, job: &PrintJob) -> Result<()> {
        if job.external_job_id.is_none() {
            return Err(SpoolError::InvalidState(format!(
                "job {} has no backend job number",
                job.jobid
            )));
        }
        self.run(what, template, &Substitutions::job(printer, job)).map(|_| ())
    }
}

impl PrintBackend for LocalSpool {
    #[instrument(skip(self))]
    fn queue_snapshot(&self, printer: &str) -> Result<(Vec<ExternalQueueEntry>, BackendStatus)> {
        let listing = self.run("queue", &self.commands.queue, &Substitutions::printer(printer))?;
        Ok(parse_lpq(&listing, Utc::now().timestamp()))
    }

    fn submit_job(&self, printer: &str, job: &PrintJob) -> Result<Option<i32>> {
        self.run("submit", &self.commands.submit, &Substitutions::job(printer, job))?;
        // lpr does not report the job number; reconciliation picks it up from
        // the next listing.
        Ok(None)
    }

    fn cancel_job(&self, printer: &str, job: &PrintJob) -> Result<()> {
        self.run_for_job("cancel", &self.commands.cancel, printer, job)
    }

    fn pause_job(&self, printer: &str, job: &PrintJob) -> Result<()> {
        self.run_for_job("pause job", &self.commands.pause_job, printer, job)
    }

    fn resume_job(&self, printer: &str, job: &PrintJob) -> Result<()> {
        self.run_for_job("resume job", &self.commands.resume_job, printer, job)
    }

    fn pause_queue(&self, printer: &str) -> Result<()> {
        self.run("pause queue", &self.commands.pause_queue, &Substitutions::printer(printer))
            .map(|_| ())
    }

    fn resume_queue(&self, printer: &str) -> Result<()> {
        self.run("resume queue", &self.commands.resume_queue, &Substitutions::printer(printer))
            .map(|_| ())
    }
}

/// Parse BSD `lpq` output.
///
/// `lpq` does not print submission times, so every entry is stamped `now`
/// and listing order is kept as the tie-break.  A status line mentioning the
/// queue being down, disabled or stopped sets the fatal-stop flag.
pub fn parse_lpq(listing: &str, now: i64) -> (Vec<ExternalQueueEntry>, BackendStatus) {
    let mut entries = Vec::new();
    let mut status = BackendStatus::default();
    let mut in_table = false;

    for line in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.starts_with("Rank") {
            in_table = true;
            continue;
        }
        if in_table && let Some(entry) = parse_lpq_line(line, now, entries.len()) {
            entries.push(entry);
            continue;
        }
        if line.eq_ignore_ascii_case("no entries") {
            continue;
        }
        let lower = line.to_ascii_lowercase();
        if ["down", "disabled", "stopped"].iter().any(|w| lower.contains(w)) {
            status.fatal_stop = true;
        }
        if status.message.is_empty() {
            status.message = line.to_owned();
        }
    }
    (entries, status)
}

fn parse_lpq_line(line: &str, now: i64, position: usize) -> Option<ExternalQueueEntry> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let n = tokens.len();
    if n < 6 || tokens[n - 1] != "bytes" {
        return None;
    }
    let job = tokens[2].parse::<i32>().ok()?;
    let size = tokens[n - 2].parse::<u64>().ok()?;
    let status = if tokens[0] == "active" {
        JobStatus::Printing
    } else {
        JobStatus::Queued
    };
    Some(ExternalQueueEntry {
        job,
        size,
        status,
        user: tokens[1].to_owned(),
        file_name: tokens[3..n - 2].join(" "),
        priority: position as u32 + 1,
        submitted_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use spoolwerk_core::{JobId, ProcessId};
    use std::path::PathBuf;

    const LISTING: &str = "\
lp0 is ready and printing
Rank   Owner      Job  Files                                 Total Size
active alice      12   spool.00000042.Xa9fQ1                 1024 bytes
1st    bob        13   annual report.txt                     2048 bytes
";

    fn job(ext: Option<i32>) -> PrintJob {
        PrintJob {
            jobid: JobId(42),
            owner: Some(ProcessId(1)),
            external_job_id: ext,
            spool_file: PathBuf::from("/var/spool/lp0/spool.00000042.Xa9fQ1"),
            start_time: 0,
            status: JobStatus::Queued,
            size: 10,
            page_count: 0,
            spooled: true,
            originated_locally: true,
            job_name: "it's done".into(),
            user: "alice".into(),
            queue_name: "lp0".into(),
            settings: Vec::new(),
        }
    }

    #[test]
    fn lpq_listing_is_parsed() {
        let (entries, status) = parse_lpq(LISTING, 1_000);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].job, 12);
        assert_eq!(entries[0].status, JobStatus::Printing);
        assert_eq!(entries[0].file_name, "spool.00000042.Xa9fQ1");
        assert_eq!(entries[1].file_name, "annual report.txt");
        assert_eq!(entries[1].size, 2048);
        assert_eq!(entries[1].status, JobStatus::Queued);
        assert_eq!(status.message, "lp0 is ready and printing");
        assert!(!status.fatal_stop);
    }

    #[test]
    fn down_queue_is_a_fatal_stop() {
        let (entries, status) = parse_lpq("Printer lp0 is down\nno entries\n", 0);
        assert!(entries.is_empty());
        assert!(status.fatal_stop);
    }

    #[test]
    fn templates_expand_and_quote() {
        let j = job(Some(12));
        let cmd = expand("lprm -P%p %j # %J by %U 100%%", &Substitutions::job("lp0", &j));
        assert_eq!(cmd, r"lprm -P'lp0' 12 # 'it'\''s done' by 'alice' 100%");
        assert_eq!(expand("%x", &Substitutions::printer("lp0")), "%x");
    }

    #[test]
    fn commands_run_through_the_shell() {
        let spool = LocalSpool::new(LocalSpoolCommands {
            queue: format!("printf '{}'", LISTING.replace('\n', r"\n")),
            cancel: "exit 3".into(),
            pause_queue: String::new(),
            ..LocalSpoolCommands::default()
        });
        let (entries, _) = spool.queue_snapshot("lp0").unwrap();
        assert_eq!(entries.len(), 2);

        assert!(matches!(spool.cancel_job("lp0", &job(Some(12))), Err(SpoolError::Backend(_))));
        assert!(matches!(spool.cancel_job("lp0", &job(None)), Err(SpoolError::InvalidState(_))));
        assert!(matches!(spool.pause_queue("lp0"), Err(SpoolError::Backend(_))));
    }
}
