// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// spoolwerkd: the designated refresh worker.
//
// Loads the spooler configuration, opens the shared message bus under the
// state directory, registers this process's mailbox and advertises it as the
// refresh worker.  Serves refresh requests from other spooler processes and
// re-checks every printer once per cache period.  Stops on Ctrl-C / SIGINT.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use spoolwerk_core::{ProcessId, Result, SpoolConfig};
use spoolwerk_queue::{MessageBus, RefreshWorker, SharedBus, SpoolContext, SpoolMessage};

const DEFAULT_CONFIG: &str = "/etc/spoolwerk/spoolwerk.json";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "spoolwerkd failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG);
    let mut print_config = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--print-config" => print_config = true,
            other => config_path = PathBuf::from(other),
        }
    }

    let config = SpoolConfig::load(&config_path)?;
    if print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let me = ProcessId::current();
    info!(pid = %me, config = %config_path.display(), printers = config.printers.len(), "spoolwerkd starting");

    let bus = Arc::new(
        SharedBus::open(&config.state_dir, config.mailbox_capacity)?
            .with_poll_interval(config.mailbox_poll_interval()),
    );
    let mailbox = bus.register(me)?;
    bus.set_worker(me)?;
    info!(bus = %bus.path().display(), "refresh worker mailbox registered");
    let printers: Vec<String> = config.printers.iter().map(|p| p.name.clone()).collect();
    let period = config.cache_time().max(Duration::from_secs(1));

    let ctx = Arc::new(SpoolContext::builder(config).bus(bus.clone()).worker(me).build()?);
    let worker = RefreshWorker::spawn(Arc::clone(&ctx), mailbox);

    let ticker = {
        let bus = Arc::clone(&bus);
        let cancel = worker.cancellation_token();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let bus = Arc::clone(&bus);
                        let batch = printers.clone();
                        let queued = tokio::task::spawn_blocking(move || {
                            for printer in &batch {
                                let request = SpoolMessage::RefreshPrinter { printer: printer.clone() };
                                if let Err(e) = bus.send(me, request) {
                                    warn!(%printer, error = %e, "periodic refresh not queued");
                                }
                            }
                        })
                        .await;
                        match queued {
                            Ok(()) => debug!(printers = printers.len(), "periodic refresh queued"),
                            Err(e) => warn!(error = %e, "periodic refresh task failed"),
                        }
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    worker.shutdown().await;
    if let Err(e) = ticker.await {
        warn!(error = %e, "refresh ticker ended abnormally");
    }
    bus.unregister(me);
    info!(open_stores = ctx.stores().open_count(), "spoolwerkd stopped");
    Ok(())
}
