// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spoolwerk queue engine: per-printer job stores, the job lifecycle, queue
// reconciliation against an external print system, cross-process refresh
// coordination and change notification.

pub mod allocator;
pub mod backend;
pub mod bus;
pub mod context;
pub mod coordination;
pub mod host;
pub mod lifecycle;
pub mod notify;
pub mod reconcile;
pub mod records;
pub mod status;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use allocator::LegacyIdMap;
pub use backend::{Backend, PrintBackend};
pub use bus::{LocalBus, Mailbox, MessageBus, SharedBus, SpoolMessage};
pub use context::{SpoolContext, SpoolContextBuilder};
pub use coordination::RefreshOutcome;
pub use host::{Clock, HostProbe, ManualClock, SystemClock, SystemHost};
pub use notify::{
    NotifyField, NotifyKind, NotifyMessage, NotifyQueue, NotifyValue, Subscriber, SubscriptionScope,
    decode_blob, encode_blob,
};
pub use reconcile::ReconcileReport;
pub use store::{PrinterDb, StorePool};
pub use worker::RefreshWorker;
