//! Scan server: bookkeeping for many scans.
//!
//! Clients submit command lists and get back a numeric scan id. Everything else
//! (start, cancel, status, data, removal) goes through that id. Each scan runs on
//! its own [`ScanExecutor`]; the server never blocks on a running scan.
//!
//! # Retention
//!
//! Finished scans are kept for status queries. Once more than
//! `max_retained_scans` of them exist, the oldest finished scans are dropped on the
//! next submission. Idle and running scans are never dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::command::ScanCommand;
use crate::config::{EngineConfig, ServerConfig};
use crate::device::DeviceProvider;
use crate::engine::{Sample, ScanCompiler, ScanExecutor, ScanInfo};
use crate::error::{ScanError, ScanResult};
use crate::scripting::RhaiScriptLoader;

struct ScanEntry {
    commands: Vec<ScanCommand>,
    executor: Arc<ScanExecutor>,
}

/// Owns all scans of one server.
pub struct ScanServer {
    devices: Arc<dyn DeviceProvider>,
    compiler: ScanCompiler,
    settings: EngineConfig,
    max_retained_scans: usize,
    next_id: AtomicU64,
    scans: RwLock<BTreeMap<u64, ScanEntry>>,
}

impl ScanServer {
    /// Server without scans; ids start at 1.
    pub fn new(
        devices: Arc<dyn DeviceProvider>,
        compiler: ScanCompiler,
        settings: EngineConfig,
        max_retained_scans: usize,
    ) -> Self {
        Self {
            devices,
            compiler,
            settings,
            max_retained_scans,
            next_id: AtomicU64::new(1),
            scans: RwLock::new(BTreeMap::new()),
        }
    }

    /// Server with the Rhai script loader and settings from `config`.
    pub fn from_config(config: &ServerConfig, devices: Arc<dyn DeviceProvider>) -> Self {
        let loader = RhaiScriptLoader::new(
            config.scripting.script_paths.clone(),
            config.scripting.max_operations,
        );
        Self::new(
            devices,
            ScanCompiler::new().with_script_loader(Arc::new(loader)),
            config.engine.clone(),
            config.server.max_retained_scans,
        )
    }

    /// Device provider shared by all scans.
    pub fn devices(&self) -> Arc<dyn DeviceProvider> {
        Arc::clone(&self.devices)
    }

    /// Compile and register a scan, starting it unless `queue_only`.
    ///
    /// Compile errors are returned right away and nothing is registered.
    pub async fn submit(
        &self,
        name: impl Into<String>,
        commands: Vec<ScanCommand>,
        queue_only: bool,
    ) -> ScanResult<u64> {
        let name = name.into();
        let root = self.compiler.compile(&commands)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let executor = Arc::new(ScanExecutor::new(
            id,
            name.clone(),
            root,
            Arc::clone(&self.devices),
            self.settings.clone(),
        ));

        {
            let mut scans = self.scans.write().await;
            self.prune(&mut scans);
            scans.insert(
                id,
                ScanEntry {
                    commands,
                    executor: Arc::clone(&executor),
                },
            );
        }
        info!(scan = id, name = %name, work_total = executor.info().work_total, queue_only, "Scan submitted");

        if !queue_only {
            executor.start()?;
        }
        Ok(id)
    }

    /// Start a queued scan.
    pub async fn start(&self, id: u64) -> ScanResult<()> {
        self.executor(id).await?.start()
    }

    /// Request cancellation of a scan.
    pub async fn cancel(&self, id: u64) -> ScanResult<()> {
        self.executor(id).await?.cancel();
        Ok(())
    }

    /// Cancel every scan that is still idle or running.
    pub async fn cancel_all(&self) {
        let scans = self.scans.read().await;
        for entry in scans.values() {
            if entry.executor.state().is_active() {
                entry.executor.cancel();
            }
        }
    }

    /// Remove a finished scan and return its final status.
    pub async fn remove(&self, id: u64) -> ScanResult<ScanInfo> {
        let mut scans = self.scans.write().await;
        let entry = scans.get(&id).ok_or(ScanError::UnknownScan(id))?;
        if entry.executor.state().is_active() {
            return Err(ScanError::ScanStillActive(id));
        }
        let info = entry.executor.info();
        scans.remove(&id);
        debug!(scan = id, "Scan removed");
        Ok(info)
    }

    /// Remove all finished scans, returning how many were removed.
    pub async fn remove_completed(&self) -> usize {
        let mut scans = self.scans.write().await;
        let before = scans.len();
        scans.retain(|_, entry| entry.executor.state().is_active());
        before - scans.len()
    }

    /// Status snapshot of one scan.
    pub async fn scan_info(&self, id: u64) -> ScanResult<ScanInfo> {
        Ok(self.executor(id).await?.info())
    }

    /// Status of all scans, newest first.
    pub async fn scan_infos(&self) -> Vec<ScanInfo> {
        let scans = self.scans.read().await;
        scans
            .values()
            .rev()
            .map(|entry| entry.executor.info())
            .collect()
    }

    /// Samples logged by one scan.
    pub async fn scan_data(&self, id: u64) -> ScanResult<Vec<Sample>> {
        let data = self.executor(id).await?.data();
        Ok(data.samples().await)
    }

    /// Command list the scan was submitted with.
    pub async fn scan_commands(&self, id: u64) -> ScanResult<Vec<ScanCommand>> {
        let scans = self.scans.read().await;
        scans
            .get(&id)
            .map(|entry| entry.commands.clone())
            .ok_or(ScanError::UnknownScan(id))
    }

    /// Wait until a scan reaches a terminal state.
    pub async fn wait_until_done(&self, id: u64) -> ScanResult<ScanInfo> {
        let executor = self.executor(id).await?;
        Ok(executor.wait_until_done().await)
    }

    async fn executor(&self, id: u64) -> ScanResult<Arc<ScanExecutor>> {
        let scans = self.scans.read().await;
        scans
            .get(&id)
            .map(|entry| Arc::clone(&entry.executor))
            .ok_or(ScanError::UnknownScan(id))
    }

    /// Drop the oldest finished scans beyond the retention limit.
    fn prune(&self, scans: &mut BTreeMap<u64, ScanEntry>) {
        let finished: Vec<u64> = scans
            .iter()
            .filter(|(_, entry)| entry.executor.state().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        let excess = finished.len().saturating_sub(self.max_retained_scans);
        for id in finished.into_iter().take(excess) {
            scans.remove(&id);
            debug!(scan = id, "Dropped old scan");
        }
    }
}
