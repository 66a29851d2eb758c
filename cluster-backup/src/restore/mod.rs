//! Restore orchestrator.
//!
//! Each target walks a fixed sequence of states:
//!
//! ```text
//! Idle -> ScaledDown -> TransferPodReady -> DataRestored -> Verified -> ScaledUp -> Done
//! ```
//!
//! Any step may end in `Failed(reason)`. Once the deployment has been
//! scaled down it is never scaled back up after a failure; the transfer
//! pod is removed best-effort and the workload stays at zero so a half
//! written volume is not served.
//!
//! Targets are restored one at a time.

pub mod plan;

use crate::config::RestoreConfig;
use crate::gateway::{
    ByteStream, ClusterGateway, Condition, DeploymentRef, GatewayError, PodRef, ResourceRef,
    TransferPodSpec,
};
use crate::transfer::ProgressStream;
use crate::utils::fsutil::sha256_file_async;
use crate::utils::format_bytes;
use async_compression::tokio::bufread::ZstdDecoder;
use std::fmt;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use plan::{RestorePlan, RestoreStep};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreState {
    Idle,
    ScaledDown,
    TransferPodReady,
    DataRestored,
    Verified,
    ScaledUp,
    Done,
    Failed(String),
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreState::Idle => write!(f, "Idle"),
            RestoreState::ScaledDown => write!(f, "ScaledDown"),
            RestoreState::TransferPodReady => write!(f, "TransferPodReady"),
            RestoreState::DataRestored => write!(f, "DataRestored"),
            RestoreState::Verified => write!(f, "Verified"),
            RestoreState::ScaledUp => write!(f, "ScaledUp"),
            RestoreState::Done => write!(f, "Done"),
            RestoreState::Failed(reason) => write!(f, "Failed({:?})", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRestoreReport {
    pub target: String,
    pub state: RestoreState,
    /// Every state entered, in order, starting with `Idle`.
    pub history: Vec<RestoreState>,
    /// Replica count the deployment is (or would be) scaled back to.
    pub previous_replicas: Option<i32>,
    pub bytes_restored: u64,
    /// The deployment was told to scale to zero. Stays set after a failure,
    /// including one while waiting for the pods to terminate.
    pub scaled_to_zero: bool,
    /// Set when the transfer pod could not be removed after a failure.
    pub cleanup_error: Option<String>,
}

impl TargetRestoreReport {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            state: RestoreState::Idle,
            history: vec![RestoreState::Idle],
            previous_replicas: None,
            bytes_restored: 0,
            scaled_to_zero: false,
            cleanup_error: None,
        }
    }

    fn failed(target: &str, reason: String) -> Self {
        let mut report = Self::new(target);
        report.advance(RestoreState::Failed(reason));
        report
    }

    fn advance(&mut self, state: RestoreState) {
        debug!(app = %self.target, from = %self.state, to = %state, "Restore transition");
        self.history.push(state.clone());
        self.state = state;
    }

    pub fn is_done(&self) -> bool {
        self.state == RestoreState::Done
    }

    /// Failed with the deployment at zero replicas.
    pub fn left_at_zero(&self) -> bool {
        self.scaled_to_zero && matches!(self.state, RestoreState::Failed(_))
    }

    pub fn reached(&self, state: &RestoreState) -> bool {
        self.history.contains(state)
    }
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub run_id: String,
    pub targets: Vec<TargetRestoreReport>,
}

impl RestoreReport {
    pub fn all_done(&self) -> bool {
        self.targets.iter().all(|t| t.is_done())
    }

    pub fn target(&self, name: &str) -> Option<&TargetRestoreReport> {
        self.targets.iter().find(|t| t.target == name)
    }
}

impl fmt::Display for RestoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Restore of run {}", self.run_id)?;
        for t in &self.targets {
            write!(f, "  {}: {}", t.target, t.state)?;
            if t.bytes_restored > 0 {
                write!(f, " ({} restored)", format_bytes(t.bytes_restored))?;
            }
            match t.previous_replicas {
                Some(n) if t.left_at_zero() => {
                    write!(f, " deployment left at 0 replicas (was {})", n)?
                }
                Some(n) => write!(f, " replicas={}", n)?,
                None => {}
            }
            if let Some(e) = &t.cleanup_error {
                write!(f, " cleanup failed: {}", e)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

pub struct RestoreOrchestrator {
    gateway: Arc<dyn ClusterGateway>,
    config: RestoreConfig,
    cancel: CancellationToken,
}

impl RestoreOrchestrator {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        config: RestoreConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            config,
            cancel,
        }
    }

    /// Restore every step of `plan`, sequentially. Targets the plan rejected
    /// are reported as failed without touching the cluster.
    pub async fn execute(&self, plan: &RestorePlan) -> RestoreReport {
        let mut targets = Vec::with_capacity(plan.steps.len() + plan.rejected.len());

        for (target, reason) in &plan.rejected {
            warn!(app = %target, reason = %reason, "Target cannot be restored");
            targets.push(TargetRestoreReport::failed(target, reason.clone()));
        }
        for (target, reason) in &plan.skipped {
            info!(app = %target, reason = %reason, "Skipping target without restorable data");
        }

        for step in &plan.steps {
            if self.cancel.is_cancelled() {
                targets.push(TargetRestoreReport::failed(
                    &step.target,
                    GatewayError::cancelled().reason(),
                ));
                continue;
            }
            targets.push(self.restore_target(step).await);
        }

        RestoreReport {
            run_id: plan.run_id.clone(),
            targets,
        }
    }

    pub async fn restore_target(&self, step: &RestoreStep) -> TargetRestoreReport {
        info!(app = %step.target, archive = %step.archive_path.display(), "Restoring target");
        let mut report = TargetRestoreReport::new(&step.target);
        let mut transfer_pod = None;

        match self.drive(step, &mut report, &mut transfer_pod).await {
            Ok(()) => {
                info!(
                    app = %step.target,
                    restored = %format_bytes(report.bytes_restored),
                    "Target restored"
                );
            }
            Err(reason) => {
                if let Some(pod) = transfer_pod.take() {
                    if let Err(e) = self.gateway.delete_pod(&pod).await {
                        warn!(
                            app = %step.target,
                            pod = %pod,
                            error = %e,
                            "Transfer pod not removed"
                        );
                        report.cleanup_error = Some(e.to_string());
                    }
                }
                if report.scaled_to_zero {
                    error!(
                        app = %step.target,
                        reason = %reason,
                        "Restore failed, deployment left scaled to zero"
                    );
                } else {
                    error!(app = %step.target, reason = %reason, "Restore failed");
                }
                report.advance(RestoreState::Failed(reason));
            }
        }
        report
    }

    async fn drive(
        &self,
        step: &RestoreStep,
        report: &mut TargetRestoreReport,
        transfer_pod: &mut Option<PodRef>,
    ) -> Result<(), String> {
        self.preflight(step).await?;

        // Idle -> ScaledDown
        let deployment = DeploymentRef {
            namespace: step.namespace.clone(),
            name: step.deployment.clone(),
        };
        let current = self
            .gateway
            .replicas(&deployment)
            .await
            .map_err(|e| format!("reading replicas: {}", e))?;
        // A deployment already at zero (e.g. after an earlier failed restore)
        // goes back to what the backup observed.
        let previous = match (current, step.captured_replicas) {
            (0, Some(captured)) if captured > 0 => captured,
            (current, _) => current,
        };
        report.previous_replicas = Some(previous);

        self.gateway
            .scale(&deployment, 0)
            .await
            .map_err(|e| format!("scale down: {}", e))?;
        report.scaled_to_zero = true;
        self.gateway
            .wait_for_condition(
                &ResourceRef::Deployment(deployment.clone()),
                Condition::NoReadyReplicas,
                self.config.scale_timeout(),
            )
            .await
            .map_err(|e| format!("scale down: {}", e))?;
        report.advance(RestoreState::ScaledDown);
        self.check_cancelled()?;

        // ScaledDown -> TransferPodReady
        let spec = TransferPodSpec {
            name: transfer_pod_name(&step.target),
            namespace: step.namespace.clone(),
            claim: step.claim.clone(),
            mount_path: step.mount_path.clone(),
            image: self.config.transfer_image.clone(),
        };
        let pod = self
            .gateway
            .create_transfer_pod(&spec)
            .await
            .map_err(|e| format!("creating transfer pod: {}", e))?;
        *transfer_pod = Some(pod.clone());
        if let Err(e) = self
            .gateway
            .wait_for_condition(
                &ResourceRef::Pod(pod.clone()),
                Condition::Ready,
                self.config.pod_ready_timeout(),
            )
            .await
        {
            debug!(app = %step.target, pod = %pod, error = %e, "Transfer pod wait failed");
            return Err("transfer pod not ready".to_string());
        }
        report.advance(RestoreState::TransferPodReady);
        self.check_cancelled()?;

        // TransferPodReady -> DataRestored
        let file = tokio::fs::File::open(&step.archive_path)
            .await
            .map_err(|e| format!("opening archive: {}", e))?;
        let target_name = step.target.clone();
        let decoded = ReaderStream::new(ZstdDecoder::new(BufReader::new(file)));
        let progress = ProgressStream::new(decoded).with_callback(Arc::new(move |bytes| {
            debug!(
                app = %target_name,
                streamed = %format_bytes(bytes),
                "Restore stream progress"
            );
        }));
        let tally = progress.tally();
        let input: ByteStream = Box::pin(progress);

        let command = tar_in_command(&step.mount_path);
        let exit_code = tokio::select! {
            result = self.gateway.exec_stream_in(&pod, &command, input) => {
                result.map_err(|e| e.reason())?
            }
            _ = self.cancel.cancelled() => return Err(GatewayError::cancelled().reason()),
        };
        report.bytes_restored = tally.bytes();
        if exit_code != 0 {
            return Err(format!("exit {}", exit_code));
        }
        report.advance(RestoreState::DataRestored);

        // DataRestored -> Verified
        if self.config.verify {
            if tally.bytes() != step.data.stream_bytes || tally.sha256() != step.data.stream_sha256
            {
                warn!(
                    app = %step.target,
                    expected_bytes = step.data.stream_bytes,
                    actual_bytes = tally.bytes(),
                    "Restored stream does not match backup"
                );
                return Err("checksum mismatch".to_string());
            }
        } else {
            debug!(app = %step.target, "Stream verification disabled");
        }
        report.advance(RestoreState::Verified);

        // Verified -> ScaledUp
        self.gateway
            .delete_pod(&pod)
            .await
            .map_err(|e| format!("removing transfer pod: {}", e))?;
        self.gateway
            .wait_for_condition(
                &ResourceRef::Pod(pod.clone()),
                Condition::Deleted,
                self.config.pod_ready_timeout(),
            )
            .await
            .map_err(|e| format!("removing transfer pod: {}", e))?;
        *transfer_pod = None;
        self.gateway
            .scale(&deployment, previous)
            .await
            .map_err(|e| format!("scale up: {}", e))?;
        report.advance(RestoreState::ScaledUp);
        report.advance(RestoreState::Done);
        Ok(())
    }

    /// Re-hash the archive before touching the cluster.
    async fn preflight(&self, step: &RestoreStep) -> Result<(), String> {
        let actual = sha256_file_async(&step.archive_path)
            .await
            .map_err(|e| format!("archive unreadable: {}", e))?;
        if actual != step.data.archive_sha256 {
            warn!(
                app = %step.target,
                expected = %step.data.archive_sha256,
                actual = %actual,
                "Archive checksum mismatch"
            );
            return Err("checksum mismatch".to_string());
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), String> {
        if self.cancel.is_cancelled() {
            Err(GatewayError::cancelled().reason())
        } else {
            Ok(())
        }
    }
}

fn transfer_pod_name(target: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("restore-{}-{}", target, &id[..8])
}

pub fn tar_in_command(mount_path: &str) -> Vec<String> {
    ["tar", "xf", "-", "-C", mount_path]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::summary::load_run;
    use crate::archive::ArchiveWriter;
    use crate::gateway::fake::FakeGateway;
    use crate::registry::target;
    use crate::snapshot::SnapshotCollector;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn alpha_data() -> Vec<u8> {
        (0..512 * 1024u32).map(|i| (i % 251) as u8).collect()
    }

    /// Back up `alpha` through `gateway` and plan its restore.
    async fn backed_up(gateway: &Arc<FakeGateway>, root: &TempDir) -> RestorePlan {
        let writer = ArchiveWriter::open_run(root.path()).await.unwrap();
        let collector =
            SnapshotCollector::new(gateway.clone(), writer.clone(), CancellationToken::new());
        let manifest = collector.capture_target(&target("alpha")).await.unwrap();
        writer.write_manifest(&manifest).await.unwrap();
        let run = writer.finalize(&["alpha".to_string()], false).await.unwrap();
        RestorePlan::from_run(&load_run(&run.directory).unwrap(), &[]).unwrap()
    }

    fn gateway(fake: FakeGateway) -> Arc<FakeGateway> {
        Arc::new(
            fake.with_pod("alpha", "app=alpha", "alpha-0", alpha_data())
                .with_deployment("alpha", "alpha", 3),
        )
    }

    fn orchestrator(gateway: &Arc<FakeGateway>) -> RestoreOrchestrator {
        RestoreOrchestrator::new(
            gateway.clone(),
            RestoreConfig::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_restore_walks_every_state() {
        let root = TempDir::new().unwrap();
        let gw = gateway(FakeGateway::new());
        let plan = backed_up(&gw, &root).await;

        let report = orchestrator(&gw).execute(&plan).await;

        assert!(report.all_done());
        let alpha = report.target("alpha").unwrap();
        assert_eq!(
            alpha.history,
            vec![
                RestoreState::Idle,
                RestoreState::ScaledDown,
                RestoreState::TransferPodReady,
                RestoreState::DataRestored,
                RestoreState::Verified,
                RestoreState::ScaledUp,
                RestoreState::Done,
            ]
        );
        assert_eq!(alpha.previous_replicas, Some(3));
        assert_eq!(alpha.bytes_restored, alpha_data().len() as u64);
        assert_eq!(gw.replicas_of("alpha", "alpha"), Some(3));
        assert_eq!(gw.volume("alpha-data"), Some(alpha_data()));
        assert_eq!(gw.live_transfer_pods(), 0);

        let calls = gw.calls();
        let create = calls.iter().find(|c| c.starts_with("create_pod restore-alpha-")).unwrap();
        assert!(create.ends_with("claim=alpha-data"));
        assert!(calls.iter().any(|c| c.ends_with("tar xf - -C /data")));
    }

    #[tokio::test]
    async fn test_restore_twice_is_idempotent() {
        let root = TempDir::new().unwrap();
        let gw = gateway(FakeGateway::new());
        let plan = backed_up(&gw, &root).await;
        let orchestrator = orchestrator(&gw);

        let first = orchestrator.execute(&plan).await;
        let second = orchestrator.execute(&plan).await;

        assert!(first.all_done());
        assert!(second.all_done());
        assert_eq!(gw.replicas_of("alpha", "alpha"), Some(3));
        assert_eq!(gw.volume("alpha-data"), Some(alpha_data()));
    }

    #[tokio::test]
    async fn test_failed_extraction_leaves_deployment_at_zero() {
        let root = TempDir::new().unwrap();
        let gw = gateway(FakeGateway::new().with_restore_exit_code(2));
        let plan = backed_up(&gw, &root).await;

        let report = orchestrator(&gw).execute(&plan).await;

        let alpha = report.target("alpha").unwrap();
        assert_eq!(alpha.state, RestoreState::Failed("exit 2".into()));
        assert!(alpha.reached(&RestoreState::TransferPodReady));
        assert!(!alpha.reached(&RestoreState::DataRestored));
        assert!(!alpha.reached(&RestoreState::ScaledUp));
        assert_eq!(gw.replicas_of("alpha", "alpha"), Some(0));
        assert_eq!(gw.live_transfer_pods(), 0);
        assert!(gw.calls().iter().all(|c| c != "scale alpha/deployment/alpha 3"));
    }

    #[tokio::test]
    async fn test_transfer_pod_never_ready() {
        let root = TempDir::new().unwrap();
        let gw = gateway(FakeGateway::new().with_transfer_pods_never_ready());
        let plan = backed_up(&gw, &root).await;

        let report = orchestrator(&gw).execute(&plan).await;

        let alpha = report.target("alpha").unwrap();
        assert_eq!(alpha.state, RestoreState::Failed("transfer pod not ready".into()));
        assert_eq!(gw.replicas_of("alpha", "alpha"), Some(0));
        assert_eq!(gw.live_transfer_pods(), 0);
        assert_eq!(gw.volume("alpha-data"), None);
    }

    #[tokio::test]
    async fn test_scale_down_wait_timeout_reports_zero_replicas() {
        let root = TempDir::new().unwrap();
        let gw = gateway(FakeGateway::new().with_scale_down_stuck());
        let plan = backed_up(&gw, &root).await;

        let report = orchestrator(&gw).execute(&plan).await;

        let alpha = report.target("alpha").unwrap();
        match &alpha.state {
            RestoreState::Failed(reason) => assert!(reason.starts_with("scale down: timeout")),
            other => panic!("unexpected state {}", other),
        }
        assert!(!alpha.reached(&RestoreState::ScaledDown));
        assert!(alpha.scaled_to_zero);
        assert!(alpha.left_at_zero());
        assert_eq!(gw.replicas_of("alpha", "alpha"), Some(0));
        assert!(report
            .to_string()
            .contains("deployment left at 0 replicas (was 3)"));
    }

    #[tokio::test]
    async fn test_tampered_archive_fails_before_scaling() {
        let root = TempDir::new().unwrap();
        let gw = gateway(FakeGateway::new());
        let plan = backed_up(&gw, &root).await;
        let archive: PathBuf = plan.steps[0].archive_path.clone();
        let mut bytes = std::fs::read(&archive).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&archive, bytes).unwrap();

        let report = orchestrator(&gw).execute(&plan).await;

        let alpha = report.target("alpha").unwrap();
        assert_eq!(
            alpha.history,
            vec![
                RestoreState::Idle,
                RestoreState::Failed("checksum mismatch".into())
            ]
        );
        assert!(!alpha.scaled_to_zero);
        assert_eq!(gw.replicas_of("alpha", "alpha"), Some(3));
        assert!(gw.calls().iter().all(|c| !c.starts_with("scale")));
    }

    #[tokio::test]
    async fn test_stream_mismatch_fails_verification() {
        let root = TempDir::new().unwrap();
        let gw = gateway(FakeGateway::new());
        let mut plan = backed_up(&gw, &root).await;
        plan.steps[0].data.stream_sha256 = "0".repeat(64);

        let report = orchestrator(&gw).execute(&plan).await;

        let alpha = report.target("alpha").unwrap();
        assert_eq!(alpha.state, RestoreState::Failed("checksum mismatch".into()));
        assert!(alpha.reached(&RestoreState::DataRestored));
        assert!(!alpha.reached(&RestoreState::Verified));
        assert_eq!(gw.replicas_of("alpha", "alpha"), Some(0));
    }

    #[tokio::test]
    async fn test_deployment_already_at_zero_uses_captured_replicas() {
        let root = TempDir::new().unwrap();
        let gw = gateway(FakeGateway::new());
        let plan = backed_up(&gw, &root).await;
        gw.set_replicas("alpha", "alpha", 0);

        let report = orchestrator(&gw).execute(&plan).await;

        assert!(report.all_done());
        assert_eq!(report.target("alpha").unwrap().previous_replicas, Some(3));
        assert_eq!(gw.replicas_of("alpha", "alpha"), Some(3));
    }

    #[tokio::test]
    async fn test_rejected_and_cancelled_targets_fail() {
        let root = TempDir::new().unwrap();
        let gw = gateway(FakeGateway::new());
        let mut plan = backed_up(&gw, &root).await;
        plan.rejected.push(("beta".into(), "no data archive in run".into()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let orchestrator = RestoreOrchestrator::new(gw.clone(), RestoreConfig::default(), cancel);

        let report = orchestrator.execute(&plan).await;

        assert!(!report.all_done());
        assert_eq!(
            report.target("beta").unwrap().state,
            RestoreState::Failed("no data archive in run".into())
        );
        assert_eq!(report.target("alpha").unwrap().state, RestoreState::Failed("cancelled".into()));
        assert!(gw.calls().iter().all(|c| !c.starts_with("scale")));
    }
}
