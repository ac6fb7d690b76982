// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Spoolwerk.

use std::fmt;

use thiserror::Error;

use crate::codec::CodecError;
use crate::types::JobId;

/// Which limit a rejected `start` ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    /// Free space on the spool volume is below twice the configured minimum.
    DiskSpace,
    /// The queue already holds the configured maximum number of jobs.
    QueueDepth,
    /// No free job id could be drawn within the retry budget.
    JobIds,
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DiskSpace => f.write_str("insufficient spool disk space"),
            Self::QueueDepth => f.write_str("queue is full"),
            Self::JobIds => f.write_str("no job id available"),
        }
    }
}

/// Top-level error type for all Spoolwerk operations.
#[derive(Debug, Error)]
pub enum SpoolError {
    // -- Backend --
    #[error("print backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("print backend rejected request: {0}")]
    Backend(String),

    // -- Coordination --
    #[error("timed out waiting for lock {0}")]
    LockTimeout(String),

    #[error("message delivery failed: {0}")]
    Messaging(String),

    // -- Job / queue --
    #[error("quota exceeded: {0}")]
    QuotaExceeded(QuotaKind),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("outside print hours: {0}")]
    OutsidePrintHours(String),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("unknown printer: {0}")]
    UnknownPrinter(String),

    #[error("invalid job state: {0}")]
    InvalidState(String),

    // -- Storage / persistence --
    #[error("corrupt record: {0}")]
    RecordCorrupt(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<CodecError> for SpoolError {
    fn from(e: CodecError) -> Self {
        Self::RecordCorrupt(e.to_string())
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SpoolError>;
