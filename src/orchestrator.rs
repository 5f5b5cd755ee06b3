//! Scan lifecycle: PENDING -> RUNNING -> discovery -> host fan-out -> reports -> COMPLETED.
//!
//! Any scan-level error lands on the scan row as FAILED; host-level errors
//! stay on their host rows. The orchestrator has no self-timeout beyond the
//! executor invocations; a scan that hangs anyway is the monitor's concern.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::error::{ExecutorError, ScanError, StoreError};
use crate::executor::ScanExecutor;
use crate::netdetect::{self, NetworkDetector};
use crate::pool::WorkerPool;
use crate::progress::{ScanProgress, DISCOVERY_DONE, HOSTS_DONE, REPORTS_DONE};
use crate::reports::ReportGenerator;
use crate::store::{ScanPatch, ScanRepository};
use crate::types::{HostProgress, Scan, ScanId, ScanStatus, ScanStatusView};
use crate::worker::HostScanWorker;

pub struct Orchestrator {
    repo: Arc<dyn ScanRepository>,
    executor: Arc<dyn ScanExecutor>,
    reports: Arc<dyn ReportGenerator>,
    detector: Arc<dyn NetworkDetector>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn ScanRepository>,
        executor: Arc<dyn ScanExecutor>,
        reports: Arc<dyn ReportGenerator>,
        detector: Arc<dyn NetworkDetector>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            repo,
            executor,
            reports,
            detector,
            clock,
            config,
        }
    }

    /// Create the scan row and run it in the background. Errors here are
    /// input problems; the row is already FAILED when one is returned.
    pub async fn start_scan(
        self: &Arc<Self>,
        targets: Option<Vec<String>>,
    ) -> Result<ScanId, ScanError> {
        let scan = self.prepare(targets).await?;
        let id = scan.id;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drive(scan).await;
        });
        Ok(id)
    }

    /// Same as [`Orchestrator::start_scan`] but waits for the scan to reach a terminal state.
    pub async fn run_scan(&self, targets: Option<Vec<String>>) -> Result<ScanId, ScanError> {
        let scan = self.prepare(targets).await?;
        let id = scan.id;
        self.drive(scan).await;
        Ok(id)
    }

    pub async fn scan_status(&self, id: ScanId) -> Result<ScanStatusView, ScanError> {
        let scan = self.repo.get_scan(id).await?.ok_or(ScanError::NotFound(id))?;
        let hosts = self.repo.list_hosts(id).await?;
        let artifacts = self.repo.list_artifacts(id).await?;
        Ok(ScanStatusView {
            scan,
            hosts: hosts.iter().map(HostProgress::from).collect(),
            artifacts,
        })
    }

    pub async fn list_scans(&self) -> Result<Vec<Scan>, ScanError> {
        Ok(self.repo.list_scans().await?)
    }

    /// Resolve targets and persist the PENDING row. Resolution failures still
    /// leave a FAILED row behind so they show up in the scan history.
    async fn prepare(&self, targets: Option<Vec<String>>) -> Result<Scan, ScanError> {
        let requested: Vec<String> = targets
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        if requested.is_empty() {
            return match self.detector.detect_local_network() {
                Ok(cidr) => {
                    info!(%cidr, "no targets given, using detected local network");
                    Ok(self.repo.create_scan(vec![cidr], self.clock.now()).await?)
                }
                Err(e) => {
                    let scan = self.repo.create_scan(Vec::new(), self.clock.now()).await?;
                    let err = ScanError::NoTargets {
                        scan_id: scan.id,
                        reason: e.to_string(),
                    };
                    self.fail_scan(scan.id, &err).await;
                    Err(err)
                }
            };
        }

        let invalid = requested
            .iter()
            .find(|t| !netdetect::is_valid_target(t))
            .or_else(|| netdetect::mixed_family_target(&requested))
            .cloned();
        let scan = self.repo.create_scan(requested, self.clock.now()).await?;
        if let Some(target) = invalid {
            let err = ScanError::InvalidTarget {
                scan_id: scan.id,
                target,
            };
            self.fail_scan(scan.id, &err).await;
            return Err(err);
        }
        Ok(scan)
    }

    async fn drive(&self, scan: Scan) {
        let id = scan.id;
        info!(scan_id = %id, targets = ?scan.targets, "scan started");
        match self.execute(&scan).await {
            Ok(()) => info!(scan_id = %id, "scan completed"),
            Err(ScanError::Persistence(StoreError::Terminal(_))) => {
                warn!(scan_id = %id, "scan was terminated externally, abandoning run")
            }
            Err(e) => {
                error!(scan_id = %id, "scan failed: {e}");
                self.fail_scan(id, &e).await;
            }
        }
    }

    async fn execute(&self, scan: &Scan) -> Result<(), ScanError> {
        let id = scan.id;
        self.repo
            .update_scan(
                id,
                ScanPatch::progress(0, "Discovering hosts").with_status(ScanStatus::Running),
                self.clock.now(),
            )
            .await?;

        let timeout = self.config.discovery_timeout;
        let discovered = tokio::time::timeout(
            timeout,
            self.executor.discover(id, &scan.targets, timeout),
        )
        .await
        .unwrap_or(Err(ExecutorError::Timeout(timeout)))
        .map_err(ScanError::Discovery)?;
        let addrs = dedup(discovered);
        let total = addrs.len();
        debug!(scan_id = %id, total, "discovery finished");

        if total == 0 {
            self.repo
                .update_scan(
                    id,
                    ScanPatch::progress(REPORTS_DONE, "No live hosts discovered")
                        .with_total_hosts(0)
                        .with_status(ScanStatus::Completed),
                    self.clock.now(),
                )
                .await?;
            return Ok(());
        }

        self.repo
            .update_scan(
                id,
                ScanPatch::progress(DISCOVERY_DONE, format!("Discovered {total} host(s)"))
                    .with_total_hosts(total as u32),
                self.clock.now(),
            )
            .await?;

        let hosts = self.repo.create_hosts(id, &addrs).await?;
        let worker = Arc::new(HostScanWorker::new(
            self.repo.clone(),
            self.executor.clone(),
            self.clock.clone(),
            self.config.host_timeout,
        ));
        let tracker = Arc::new(ScanProgress::new(
            self.repo.clone(),
            self.clock.clone(),
            id,
            hosts.len(),
        ));

        let mut pool = WorkerPool::new(self.config.effective_parallelism());
        for host in hosts {
            let worker = worker.clone();
            let tracker = tracker.clone();
            pool.submit(async move {
                let outcome = worker.scan_host(id, &host).await;
                if let Err(e) = tracker.record_completion(&outcome).await {
                    warn!(scan_id = %id, host = %host.ip, "could not record completion: {e}");
                }
            })
            .await;
        }
        let panicked = pool.join().await;
        if panicked > 0 {
            warn!(scan_id = %id, panicked, "some host workers panicked");
        }

        // A worker that panicked never wrote a terminal state for its host.
        for host in self.repo.list_hosts(id).await? {
            if !host.scan_status.is_terminal() {
                self.repo
                    .fail_host_if_active(host.id, "host worker exited unexpectedly", self.clock.now())
                    .await?;
            }
        }

        let (done, failed) = tracker.counts().await;
        self.repo
            .update_scan(
                id,
                ScanPatch::progress(HOSTS_DONE, "Generating reports"),
                self.clock.now(),
            )
            .await?;

        let snapshot = self.repo.snapshot(id).await?;
        let artifacts = self
            .reports
            .generate(&snapshot)
            .await
            .map_err(ScanError::Report)?;
        let n_artifacts = artifacts.len();
        self.repo
            .insert_artifacts(id, artifacts, self.clock.now())
            .await?;

        let mut summary = format!("Completed: {done} host(s) scanned");
        if failed > 0 {
            summary.push_str(&format!(", {failed} failed"));
        }
        summary.push_str(&format!(", {n_artifacts} report(s)"));
        self.repo
            .update_scan(
                id,
                ScanPatch::progress(REPORTS_DONE, summary).with_status(ScanStatus::Completed),
                self.clock.now(),
            )
            .await?;
        Ok(())
    }

    async fn fail_scan(&self, id: ScanId, err: &ScanError) {
        let message = format!("Scan failed: {err}");
        let patch = ScanPatch {
            progress_message: Some(message),
            ..Default::default()
        }
        .with_error(err.to_string())
        .with_status(ScanStatus::Failed);
        match self.repo.update_scan(id, patch, self.clock.now()).await {
            Ok(_) => {}
            Err(StoreError::Terminal(_)) => debug!(scan_id = %id, "scan already terminal"),
            Err(e) => error!(scan_id = %id, "could not record scan failure: {e}"),
        }
    }
}

/// First occurrence wins; discovery order is kept.
fn dedup(addrs: Vec<IpAddr>) -> Vec<IpAddr> {
    let mut seen = HashSet::with_capacity(addrs.len());
    addrs.into_iter().filter(|a| seen.insert(*a)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let ip = |s: &str| s.parse::<IpAddr>().unwrap();
        let out = dedup(vec![ip("10.0.0.2"), ip("10.0.0.1"), ip("10.0.0.2"), ip("10.0.0.3")]);
        assert_eq!(out, vec![ip("10.0.0.2"), ip("10.0.0.1"), ip("10.0.0.3")]);
    }
}
