//! Per-host unit of work. Every failure is captured on the host row; nothing
//! propagates to the orchestrator beyond the returned [`HostOutcome`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::classify;
use crate::clock::Clock;
use crate::error::{ExecutorError, HostScanError, ParseError};
use crate::executor::ScanExecutor;
use crate::parser::{self, HostRecord};
use crate::progress::{HostOutcome, HostProgressReporter};
use crate::store::{HostDetails, HostPatch, HostResults, ScanRepository};
use crate::types::{Host, HostScanStatus, ScanId};

pub struct HostScanWorker {
    repo: Arc<dyn ScanRepository>,
    executor: Arc<dyn ScanExecutor>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl HostScanWorker {
    pub fn new(
        repo: Arc<dyn ScanRepository>,
        executor: Arc<dyn ScanExecutor>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            repo,
            executor,
            clock,
            timeout,
        }
    }

    /// Scan one host. Always returns; failures end up in `scan_error_message`.
    pub async fn scan_host(&self, scan_id: ScanId, host: &Host) -> HostOutcome {
        match self.try_scan(scan_id, host).await {
            Ok(ports) => {
                info!(scan_id = %scan_id, host = %host.ip, ports, "host scan completed");
                HostOutcome::Completed { ports }
            }
            Err(e) => {
                let message = e.to_string();
                warn!(scan_id = %scan_id, host = %host.ip, "host scan failed: {message}");
                match self
                    .repo
                    .fail_host_if_active(host.id, &message, self.clock.now())
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => debug!(host = %host.ip, "host already terminal, keeping its state"),
                    Err(store_err) => {
                        error!(host = %host.ip, "could not record host failure: {store_err}")
                    }
                }
                HostOutcome::Failed(message)
            }
        }
    }

    async fn try_scan(&self, scan_id: ScanId, host: &Host) -> Result<u32, HostScanError> {
        let addr = host.ip;
        let persistence = |source| HostScanError::Persistence { addr, source };

        self.repo
            .update_host(
                host.id,
                HostPatch {
                    status: Some(HostScanStatus::Scanning),
                    progress_percent: Some(0),
                    ..Default::default()
                },
                self.clock.now(),
            )
            .await
            .map_err(persistence)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = HostProgressReporter::new(self.repo.clone(), self.clock.clone(), host.id);
        let exec = tokio::time::timeout(
            self.timeout,
            self.executor.scan_host(scan_id, addr, self.timeout, tx),
        );
        tokio::pin!(exec);
        let result = loop {
            tokio::select! {
                res = &mut exec => break res,
                Some(p) = rx.recv() => reporter.report(p).await,
            }
        };
        while let Ok(p) = rx.try_recv() {
            reporter.report(p).await;
        }

        let raw = result
            .unwrap_or(Err(ExecutorError::Timeout(self.timeout)))
            .map_err(|source| HostScanError::Executor { addr, source })?;
        let record = parser::parse_host(&raw.xml)
            .map_err(|source| HostScanError::Parse { addr, source })?;
        if let Some(seen) = record.address {
            if seen != addr {
                return Err(HostScanError::Parse {
                    addr,
                    source: ParseError::InvalidField {
                        field: "address",
                        value: seen.to_string(),
                    },
                });
            }
        }

        let details = host_details(host, &record);
        let done = self
            .repo
            .complete_host(
                host.id,
                HostResults {
                    details,
                    ports: record.ports,
                    hops: record.hops,
                },
                self.clock.now(),
            )
            .await
            .map_err(persistence)?;
        Ok(done.ports_discovered)
    }
}

fn host_details(host: &Host, rec: &HostRecord) -> HostDetails {
    let vm = classify::classify(host.ip, rec);
    if let Some(v) = &vm {
        debug!(host = %host.ip, vm_type = %v.vm_type, signal = ?v.signal, "classified as virtual");
    }
    HostDetails {
        hostname: rec.hostname.clone(),
        os_type: rec.os_type.clone(),
        os_accuracy: rec.os_accuracy,
        mac: rec.mac.clone(),
        vendor: rec.vendor.clone(),
        is_vm: vm.is_some(),
        vm_type: vm.map(|v| v.vm_type),
        distance: rec.distance,
        uptime_seconds: rec.uptime_seconds,
    }
}
