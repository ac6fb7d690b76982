// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Change notifications.
//
// Observable field changes are queued process-wide in arrival order and
// flushed per printer as one encoded blob to every live subscriber of that
// printer.  Byte and page totals for the same job coalesce while queued.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use spoolwerk_core::codec::{CodecError, Decoder, Encoder};
use spoolwerk_core::error::{Result, SpoolError};
use spoolwerk_core::{PrintJob, ProcessId};

use crate::bus::SpoolMessage;
use crate::context::SpoolContext;
use crate::store::keys;

/// Printer status values carried by `PrinterStatus` notifications.
pub const PRINTER_STATUS_OK: u32 = 0;
pub const PRINTER_STATUS_PAUSED: u32 = 1;

/// Set on job notifications whose target is a synthetic id for a job found
/// only in the backend listing.
pub const FLAG_EXTERNAL_JOB: u32 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyKind {
    Job,
    Printer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyField {
    JobStatus,
    JobTotalBytes,
    JobTotalPages,
    JobName,
    JobUser,
    JobSubmitted,
    PrinterStatus,
    PrinterDriver,
    PrinterComment,
    PrinterShare,
    PrinterPort,
    PrinterLocation,
}

impl NotifyField {
    pub fn kind(self) -> NotifyKind {
        match self {
            Self::JobStatus
            | Self::JobTotalBytes
            | Self::JobTotalPages
            | Self::JobName
            | Self::JobUser
            | Self::JobSubmitted => NotifyKind::Job,
            _ => NotifyKind::Printer,
        }
    }

    /// Totals replace each other while queued.
    pub fn coalesces(self) -> bool {
        matches!(self, Self::JobTotalBytes | Self::JobTotalPages)
    }

    fn code(self) -> u16 {
        match self {
            Self::JobStatus => 0x0011,
            Self::JobTotalBytes => 0x0016,
            Self::JobTotalPages => 0x0014,
            Self::JobName => 0x0002,
            Self::JobUser => 0x0007,
            Self::JobSubmitted => 0x000f,
            Self::PrinterStatus => 0x0112,
            Self::PrinterDriver => 0x0106,
            Self::PrinterComment => 0x0105,
            Self::PrinterShare => 0x0102,
            Self::PrinterPort => 0x0103,
            Self::PrinterLocation => 0x0107,
        }
    }

    fn from_code(code: u16) -> std::result::Result<Self, CodecError> {
        Ok(match code {
            0x0011 => Self::JobStatus,
            0x0016 => Self::JobTotalBytes,
            0x0014 => Self::JobTotalPages,
            0x0002 => Self::JobName,
            0x0007 => Self::JobUser,
            0x000f => Self::JobSubmitted,
            0x0112 => Self::PrinterStatus,
            0x0106 => Self::PrinterDriver,
            0x0105 => Self::PrinterComment,
            0x0102 => Self::PrinterShare,
            0x0103 => Self::PrinterPort,
            0x0107 => Self::PrinterLocation,
            other => {
                return Err(CodecError::UnknownCode {
                    what: "notify field",
                    code: u32::from(other),
                });
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyValue {
    Ints(u32, u32),
    Text(String),
}

/// One pending change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyMessage {
    pub printer: String,
    pub kind: NotifyKind,
    pub field: NotifyField,
    /// Job id for job notifications, 0 for printer notifications.
    pub target: u32,
    pub value: NotifyValue,
    pub flags: u32,
    /// Unix seconds.
    pub timestamp: i64,
}

impl NotifyMessage {
    pub fn new(
        printer: &str,
        field: NotifyField,
        target: u32,
        value: NotifyValue,
        timestamp: i64,
    ) -> Self {
        Self {
            printer: printer.to_owned(),
            kind: field.kind(),
            field,
            target,
            value,
            flags: 0,
            timestamp,
        }
    }

    fn same_slot(&self, other: &NotifyMessage) -> bool {
        self.field == other.field && self.target == other.target && self.printer == other.printer
    }
}

/// Process-wide ordered list of pending notifications.
#[derive(Debug)]
pub struct NotifyQueue {
    coalesce_limit: usize,
    pending: Mutex<VecDeque<NotifyMessage>>,
}

impl NotifyQueue {
    pub fn new(coalesce_limit: usize) -> Self {
        Self {
            coalesce_limit,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<NotifyMessage>> {
        // Every mutation leaves the deque consistent, so a poisoned lock is usable.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message, folding byte/page totals into an earlier message for
    /// the same job if one sits within the first `coalesce_limit` entries.
    pub fn enqueue(&self, msg: NotifyMessage) {
        let mut pending = self.pending();
        if msg.field.coalesces()
            && let Some(existing) = pending
                .iter_mut()
                .take(self.coalesce_limit)
                .find(|m| m.same_slot(&msg))
        {
            existing.value = msg.value;
            existing.timestamp = msg.timestamp;
            existing.flags = msg.flags;
            return;
        }
        pending.push_back(msg);
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// Copy of everything queued, in order.
    pub fn snapshot(&self) -> Vec<NotifyMessage> {
        self.pending().iter().cloned().collect()
    }

    /// Printers with pending messages, in order of first appearance.
    pub fn printers(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for msg in self.pending().iter() {
            if !out.contains(&msg.printer) {
                out.push(msg.printer.clone());
            }
        }
        out
    }

    /// Remove and return one printer's messages, preserving their order.
    pub fn take_printer(&self, printer: &str) -> Vec<NotifyMessage> {
        let mut pending = self.pending();
        let (taken, kept): (Vec<_>, Vec<_>) =
            pending.drain(..).partition(|m| m.printer == printer);
        pending.extend(kept);
        taken
    }
}

// ---------------------------------------------------------------------------
// Blob and subscriber list encoding
// ---------------------------------------------------------------------------

pub fn encode_blob(messages: &[NotifyMessage]) -> Vec<u8> {
    let mut enc = Encoder::with_capacity(16 + messages.len() * 48);
    enc.u32(messages.len() as u32);
    for m in messages {
        enc.str(&m.printer)
            .u8(match m.kind {
                NotifyKind::Job => 0,
                NotifyKind::Printer => 1,
            })
            .u16(m.field.code())
            .u32(m.target)
            .u32(m.flags)
            .i64(m.timestamp);
        match &m.value {
            NotifyValue::Ints(a, b) => {
                enc.u8(0).u32(*a).u32(*b);
            }
            NotifyValue::Text(s) => {
                enc.u8(1).str(s);
            }
        }
    }
    enc.finish()
}

/// Decode a blob produced by a flush.
pub fn decode_blob(buf: &[u8]) -> std::result::Result<Vec<NotifyMessage>, CodecError> {
    let mut dec = Decoder::new(buf);
    let count = dec.u32()? as usize;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let printer = dec.str()?.to_owned();
        let kind = match dec.u8()? {
            0 => NotifyKind::Job,
            1 => NotifyKind::Printer,
            other => {
                return Err(CodecError::UnknownCode {
                    what: "notify kind",
                    code: u32::from(other),
                });
            }
        };
        let field = NotifyField::from_code(dec.u16()?)?;
        let target = dec.u32()?;
        let flags = dec.u32()?;
        let timestamp = dec.i64()?;
        let value = match dec.u8()? {
            0 => NotifyValue::Ints(dec.u32()?, dec.u32()?),
            1 => NotifyValue::Text(dec.str()?.to_owned()),
            other => {
                return Err(CodecError::UnknownCode {
                    what: "notify value",
                    code: u32::from(other),
                });
            }
        };
        out.push(NotifyMessage {
            printer,
            kind,
            field,
            target,
            value,
            flags,
            timestamp,
        });
    }
    dec.finish()?;
    Ok(out)
}

/// A process registered for a printer's notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscriber {
    pub pid: ProcessId,
    pub refcount: u32,
}

fn encode_subscribers(list: &[Subscriber]) -> Vec<u8> {
    let mut enc = Encoder::with_capacity(4 + list.len() * 8);
    enc.u32(list.len() as u32);
    for s in list {
        enc.u32(s.pid.0).u32(s.refcount);
    }
    enc.finish()
}

fn decode_subscribers(buf: &[u8]) -> std::result::Result<Vec<Subscriber>, CodecError> {
    let mut dec = Decoder::new(buf);
    let count = dec.u32()? as usize;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        out.push(Subscriber {
            pid: ProcessId(dec.u32()?),
            refcount: dec.u32()?,
        });
    }
    dec.finish()?;
    Ok(out)
}

/// Which printers a subscription covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionScope {
    Printer(String),
    /// Every configured printer.
    All,
}

// ---------------------------------------------------------------------------
// Raising, registering and delivering
// ---------------------------------------------------------------------------

impl SpoolContext {
    pub(crate) fn notify_job(&self, printer: &str, job: &PrintJob, field: NotifyField, value: NotifyValue) {
        let mut msg = NotifyMessage::new(printer, field, job.jobid.0, value, self.clock.now());
        if !job.originated_locally {
            msg.flags |= FLAG_EXTERNAL_JOB;
        }
        self.notify.enqueue(msg);
    }

    pub(crate) fn notify_printer_status(&self, printer: &str, status: u32) {
        self.notify.enqueue(NotifyMessage::new(
            printer,
            NotifyField::PrinterStatus,
            0,
            NotifyValue::Ints(status, 0),
            self.clock.now(),
        ));
    }

    /// Queue a change of a printer's descriptive text field (driver, comment,
    /// share, port or location).
    pub fn notify_printer_field(&self, printer: &str, field: NotifyField, text: &str) -> Result<()> {
        if field.kind() != NotifyKind::Printer || field == NotifyField::PrinterStatus {
            return Err(SpoolError::InvalidState(format!(
                "{field:?} is not a printer text field"
            )));
        }
        self.printer_config(printer)?;
        self.notify.enqueue(NotifyMessage::new(
            printer,
            field,
            0,
            NotifyValue::Text(text.to_owned()),
            self.clock.now(),
        ));
        Ok(())
    }

    fn scope_printers(&self, scope: &SubscriptionScope) -> Result<Vec<String>> {
        match scope {
            SubscriptionScope::Printer(name) => {
                self.printer_config(name)?;
                Ok(vec![name.clone()])
            }
            SubscriptionScope::All => Ok(self.config.printers.iter().map(|p| p.name.clone()).collect()),
        }
    }

    /// Register `pid` for notifications, incrementing its refcount.
    pub fn subscribe(&self, scope: &SubscriptionScope, pid: ProcessId) -> Result<()> {
        for printer in self.scope_printers(scope)? {
            self.edit_subscribers(&printer, |list| {
                match list.iter_mut().find(|s| s.pid == pid) {
                    Some(entry) => entry.refcount += 1,
                    None => list.push(Subscriber { pid, refcount: 1 }),
                }
            })?;
            debug!(%printer, %pid, "subscribed");
        }
        Ok(())
    }

    /// Drop one reference; the subscriber disappears when it reaches zero.
    pub fn unsubscribe(&self, scope: &SubscriptionScope, pid: ProcessId) -> Result<()> {
        for printer in self.scope_printers(scope)? {
            self.edit_subscribers(&printer, |list| {
                if let Some(entry) = list.iter_mut().find(|s| s.pid == pid) {
                    entry.refcount = entry.refcount.saturating_sub(1);
                }
                list.retain(|s| s.refcount > 0);
            })?;
            debug!(%printer, %pid, "unsubscribed");
        }
        Ok(())
    }

    pub fn subscribers(&self, printer: &str) -> Result<Vec<Subscriber>> {
        let db = self.stores.acquire(printer)?;
        match db.fetch(keys::SUBSCRIBERS)? {
            Some(raw) => Ok(decode_subscribers(&raw).unwrap_or_else(|e| {
                warn!(%printer, error = %e, "corrupt subscriber list ignored");
                Vec::new()
            })),
            None => Ok(Vec::new()),
        }
    }

    /// Edit a printer's subscriber list under its lock.
    fn edit_subscribers(&self, printer: &str, f: impl FnOnce(&mut Vec<Subscriber>)) -> Result<()> {
        let db = self.stores.acquire(printer)?;
        let _guard = db.lock(keys::SUBSCRIBERS, self.config.subscriber_lock_timeout())?;
        db.update(keys::SUBSCRIBERS, |raw| {
            let mut list = raw
                .map(|r| decode_subscribers(&r))
                .transpose()
                .unwrap_or_else(|e| {
                    warn!(%printer, error = %e, "corrupt subscriber list reset");
                    None
                })
                .unwrap_or_default();
            f(&mut list);
            Ok((Some(encode_subscribers(&list)), ()))
        })
    }

    /// Deliver every queued notification, one blob per printer.  Returns the
    /// number of blobs sent.
    pub fn flush_notifications(&self) -> Result<usize> {
        let mut sent = 0;
        for printer in self.notify.printers() {
            match self.flush_printer(&printer) {
                Ok(n) => sent += n,
                Err(e) => warn!(%printer, error = %e, "notification flush failed"),
            }
        }
        Ok(sent)
    }

    /// Subscribers are resolved before the batch leaves the queue, so a
    /// store or lock failure keeps it for the next flush.
    fn flush_printer(&self, printer: &str) -> Result<usize> {
        let Some(bus) = self.bus.as_ref() else {
            let dropped = self.notify.take_printer(printer).len();
            debug!(%printer, count = dropped, "no message bus, notifications dropped");
            return Ok(0);
        };

        let live = {
            let db = self.stores.acquire(printer)?;
            let _guard = db.lock(keys::SUBSCRIBERS, self.config.subscriber_lock_timeout())?;
            let host = &self.host;
            db.update(keys::SUBSCRIBERS, |raw| {
                let Some(raw) = raw else {
                    return Ok((None, Vec::new()));
                };
                let mut list = decode_subscribers(&raw)?;
                let before = list.len();
                list.retain(|s| s.refcount > 0 && host.process_exists(s.pid));
                if list.len() != before {
                    debug!(%printer, pruned = before - list.len(), "pruned dead subscribers");
                }
                Ok((Some(encode_subscribers(&list)), list))
            })?
        };

        let messages = self.notify.take_printer(printer);
        if messages.is_empty() {
            return Ok(0);
        }
        let blob = encode_blob(&messages);

        let mut sent = 0;
        for sub in live {
            if let Some(backlog) = bus.backlog(sub.pid)
                && backlog >= self.config.notify_backlog_limit
            {
                warn!(%printer, pid = %sub.pid, backlog, "subscriber backlogged, batch dropped");
                continue;
            }
            let msg = SpoolMessage::Notify {
                printer: printer.to_owned(),
                blob: blob.clone(),
            };
            match bus.send(sub.pid, msg) {
                Ok(()) => sent += 1,
                Err(e) => warn!(%printer, pid = %sub.pid, error = %e, "notification not delivered"),
            }
        }
        debug!(%printer, messages = messages.len(), sent, "notifications flushed");
        Ok(sent)
    }
}
