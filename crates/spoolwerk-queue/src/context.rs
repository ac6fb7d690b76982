// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The spooler service object.
//
// `SpoolContext` owns everything a spooler process keeps between calls: the
// store pool, the bound backends, the pending notification queue, the legacy
// id map and the spool files this process has open.  Operations are
// implemented as `impl SpoolContext` blocks in their own modules.

use std::collections::HashMap;
use std::fs::File;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::info;

use spoolwerk_core::error::{Result, SpoolError};
use spoolwerk_core::{JobId, PrinterConfig, ProcessId, SpoolConfig};

use crate::allocator::LegacyIdMap;
use crate::backend::{Backend, PrintBackend};
use crate::bus::MessageBus;
use crate::host::{Clock, HostProbe, SystemClock, SystemHost};
use crate::notify::NotifyQueue;
use crate::store::StorePool;

pub struct SpoolContext {
    pub(crate) config: SpoolConfig,
    pub(crate) stores: StorePool,
    pub(crate) backends: HashMap<String, Arc<dyn PrintBackend>>,
    pub(crate) notify: NotifyQueue,
    pub(crate) legacy: LegacyIdMap,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) host: Arc<dyn HostProbe>,
    pub(crate) bus: Option<Arc<dyn MessageBus>>,
    /// Designated background refresh process.
    pub(crate) worker: Option<ProcessId>,
    pub(crate) me: ProcessId,
    spool_files: Mutex<HashMap<(String, JobId), File>>,
}

impl std::fmt::Debug for SpoolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoolContext")
            .field("printers", &self.backends.keys().collect::<Vec<_>>())
            .field("worker", &self.worker)
            .field("me", &self.me)
            .finish()
    }
}

impl SpoolContext {
    pub fn builder(config: SpoolConfig) -> SpoolContextBuilder {
        SpoolContextBuilder::new(config)
    }

    pub fn config(&self) -> &SpoolConfig {
        &self.config
    }

    pub fn stores(&self) -> &StorePool {
        &self.stores
    }

    pub fn notifications(&self) -> &NotifyQueue {
        &self.notify
    }

    pub fn legacy_ids(&self) -> &LegacyIdMap {
        &self.legacy
    }

    pub fn process_id(&self) -> ProcessId {
        self.me
    }

    pub(crate) fn printer_config(&self, printer: &str) -> Result<&PrinterConfig> {
        self.config
            .printer(printer)
            .ok_or_else(|| SpoolError::UnknownPrinter(printer.to_owned()))
    }

    pub(crate) fn backend(&self, printer: &str) -> Result<&dyn PrintBackend> {
        self.backends
            .get(printer)
            .map(|b| b.as_ref())
            .ok_or_else(|| SpoolError::UnknownPrinter(printer.to_owned()))
    }

    pub(crate) fn spool_files(&self) -> Result<MutexGuard<'_, HashMap<(String, JobId), File>>> {
        self.spool_files
            .lock()
            .map_err(|_| SpoolError::Database("spool file table poisoned".into()))
    }
}

/// Assembles a [`SpoolContext`].  Unset seams default to the real system.
pub struct SpoolContextBuilder {
    config: SpoolConfig,
    backends: HashMap<String, Arc<dyn PrintBackend>>,
    clock: Arc<dyn Clock>,
    host: Option<Arc<dyn HostProbe>>,
    bus: Option<Arc<dyn MessageBus>>,
    worker: Option<ProcessId>,
}

impl SpoolContextBuilder {
    pub fn new(config: SpoolConfig) -> Self {
        Self {
            config,
            backends: HashMap::new(),
            clock: Arc::new(SystemClock),
            host: None,
            bus: None,
            worker: None,
        }
    }

    /// Bind a printer to a specific backend instead of the configured one.
    pub fn backend(mut self, printer: impl Into<String>, backend: Arc<dyn PrintBackend>) -> Self {
        self.backends.insert(printer.into(), backend);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn host(mut self, host: Arc<dyn HostProbe>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Process that performs reconciliation on request.
    pub fn worker(mut self, pid: ProcessId) -> Self {
        self.worker = Some(pid);
        self
    }

    pub fn build(mut self) -> Result<SpoolContext> {
        self.config.validate()?;
        for printer in &self.config.printers {
            if !self.backends.contains_key(&printer.name) {
                let backend = Backend::from_config(&printer.backend)?;
                self.backends.insert(printer.name.clone(), Arc::new(backend));
            }
        }

        let host: Arc<dyn HostProbe> = match self.host.take() {
            Some(host) => host,
            None => Arc::new(SystemHost::new(self.config.queue_list_command.clone())),
        };
        let stores = StorePool::new(
            self.config.state_dir.clone(),
            self.config.max_open_stores,
            Arc::clone(&host),
        );
        info!(
            printers = self.config.printers.len(),
            worker = ?self.worker,
            "spool context ready"
        );
        Ok(SpoolContext {
            notify: NotifyQueue::new(self.config.notify_coalesce_limit),
            config: self.config,
            stores,
            backends: self.backends,
            legacy: LegacyIdMap::new(),
            clock: self.clock,
            host,
            bus: self.bus,
            worker: self.worker,
            me: ProcessId::current(),
            spool_files: Mutex::new(HashMap::new()),
        })
    }
}
