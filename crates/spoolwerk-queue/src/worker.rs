// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Background refresh worker.
//
// The designated worker process owns a mailbox on the message bus.  Each
// "refresh printer X" request runs reconciliation and a notification flush
// on the blocking pool, so interactive callers never wait on a slow backend.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{Mailbox, SpoolMessage};
use crate::context::SpoolContext;

pub struct RefreshWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RefreshWorker {
    /// Start serving `mailbox` on the current tokio runtime.
    pub fn spawn(ctx: Arc<SpoolContext>, mailbox: Mailbox) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(ctx, mailbox, cancel.clone()));
        Self { cancel, handle }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop after the request in progress and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "refresh worker task failed");
        }
    }
}

async fn run(ctx: Arc<SpoolContext>, mut mailbox: Mailbox, cancel: CancellationToken) {
    info!(pid = %mailbox.pid(), "refresh worker started");
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = mailbox.recv() => message,
        };
        match message {
            Some(SpoolMessage::RefreshPrinter { printer }) => refresh(&ctx, printer).await,
            Some(SpoolMessage::Notify { printer, blob }) => {
                debug!(%printer, bytes = blob.len(), "worker ignoring notification batch");
            }
            None => {
                debug!("mailbox closed");
                break;
            }
        }
    }
    info!("refresh worker stopped");
}

async fn refresh(ctx: &Arc<SpoolContext>, printer: String) {
    let ctx = Arc::clone(ctx);
    let joined = tokio::task::spawn_blocking(move || {
        let outcome = ctx.update_with_lock(&printer);
        if let Err(e) = ctx.flush_notifications() {
            warn!(%printer, error = %e, "notification flush failed");
        }
        (printer, outcome)
    })
    .await;

    match joined {
        Ok((printer, Ok(outcome))) => debug!(%printer, ?outcome, "refresh request handled"),
        Ok((printer, Err(e))) => warn!(%printer, error = %e, "refresh request failed"),
        Err(e) => error!(error = %e, "refresh task panicked"),
    }
}
