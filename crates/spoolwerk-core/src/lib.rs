// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spoolwerk core: types, record codec and error definitions shared across
// all crates.

pub mod codec;
pub mod config;
pub mod error;
pub mod types;

pub use config::{BackendConfig, LocalSpoolCommands, PrintHours, PrinterConfig, SpoolConfig};
pub use error::{QuotaKind, Result, SpoolError};
pub use types::*;
