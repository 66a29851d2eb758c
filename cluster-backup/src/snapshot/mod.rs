//! Snapshot collector: captures one target's declarative state and data.
//!
//! Failures are folded into the returned manifest rather than raised:
//! - a resource kind that cannot be fetched is `Skipped` on that entry
//! - no running pod makes the whole target `Skipped("no pod found")`
//! - a failing exec stream makes the target a `PartialFailure`, keeping the
//!   resources already captured
//!
//! Only a local archive write failure escapes as an error.

pub mod manifest;

use crate::archive::{ArchiveWriter, StreamOutcome};
use crate::gateway::{ClusterGateway, DeploymentRef, GatewayError, PodRef};
use crate::registry::BackupTarget;
use crate::transfer::ProgressStream;
use crate::utils::{format_bytes, Result};
use async_compression::tokio::bufread::ZstdEncoder;
use chrono::Utc;
use futures_util::StreamExt;
use manifest::{DataArchive, ResourceCapture, ResourceOutcome, SnapshotManifest, SnapshotStatus};
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const NO_POD_FOUND: &str = "no pod found";

pub struct SnapshotCollector {
    gateway: Arc<dyn ClusterGateway>,
    writer: ArchiveWriter,
    cancel: CancellationToken,
}

impl SnapshotCollector {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        writer: ArchiveWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            writer,
            cancel,
        }
    }

    /// Capture a target. Never retries.
    pub async fn capture_target(&self, target: &BackupTarget) -> Result<SnapshotManifest> {
        info!(app = %target.name, namespace = %target.namespace, "Capturing target");

        let resources = self.capture_resources(target).await;
        let replicas = self.observe_replicas(target).await;

        let (data, status) = if !target.captures_data() {
            (None, SnapshotStatus::Success)
        } else if self.cancel.is_cancelled() {
            (None, SnapshotStatus::PartialFailure(GatewayError::cancelled().reason()))
        } else {
            self.capture_data(target).await?
        };

        match &status {
            SnapshotStatus::Success => info!(app = %target.name, "Target captured"),
            other => warn!(app = %target.name, status = %other, "Target not fully captured"),
        }

        Ok(SnapshotManifest {
            target: target.clone(),
            resources,
            data,
            replicas,
            captured_at: Utc::now(),
            status,
        })
    }

    async fn capture_resources(&self, target: &BackupTarget) -> Vec<ResourceCapture> {
        let mut captured = Vec::with_capacity(target.resources.len());
        for kind in &target.resources {
            let outcome = match self
                .gateway
                .get_resource(kind, Some(&target.namespace), None)
                .await
            {
                Ok(document) => ResourceOutcome::Captured { document },
                Err(e) => {
                    warn!(app = %target.name, kind = %kind, error = %e, "Resource not captured");
                    ResourceOutcome::Skipped { reason: e.to_string() }
                }
            };
            captured.push(ResourceCapture {
                kind: kind.clone(),
                outcome,
            });
        }
        captured
    }

    async fn observe_replicas(&self, target: &BackupTarget) -> Option<i32> {
        let deployment = DeploymentRef {
            namespace: target.namespace.clone(),
            name: target.deployment_name().to_string(),
        };
        match self.gateway.replicas(&deployment).await {
            Ok(n) => Some(n),
            Err(e) => {
                debug!(app = %target.name, error = %e, "Replica count unavailable");
                None
            }
        }
    }

    async fn capture_data(
        &self,
        target: &BackupTarget,
    ) -> Result<(Option<DataArchive>, SnapshotStatus)> {
        let pods = match self
            .gateway
            .find_pods(&target.namespace, &target.selector)
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                let reason = format!("pod lookup failed: {}", e);
                return Ok((None, SnapshotStatus::PartialFailure(reason)));
            }
        };

        let Some(pod_name) = pods.first() else {
            return Ok((None, SnapshotStatus::Skipped(NO_POD_FOUND.to_string())));
        };
        if pods.len() > 1 {
            warn!(
                app = %target.name,
                pods = ?pods,
                "Several running pods match, using {}",
                pod_name
            );
        }
        let pod = PodRef {
            namespace: target.namespace.clone(),
            name: pod_name.clone(),
            container: target.container.clone(),
        };

        let command = tar_out_command(&target.mount_path);
        let exec = match self.gateway.exec_stream_out(&pod, &command).await {
            Ok(stream) => stream,
            Err(e) => return Ok((None, SnapshotStatus::PartialFailure(e.reason()))),
        };

        let target_name = target.name.clone();
        let progress = ProgressStream::new(exec.map(|r| r.map_err(std::io::Error::from)))
            .with_callback(Arc::new(move |bytes| {
                debug!(app = %target_name, streamed = %format_bytes(bytes), "Data stream progress");
            }));
        let tally = progress.tally();
        let encoder = ZstdEncoder::new(StreamReader::new(progress));

        match self
            .writer
            .write_data_stream(&target.name, encoder, &self.cancel)
            .await?
        {
            StreamOutcome::Written(artifact) => {
                info!(
                    app = %target.name,
                    pod = %pod,
                    streamed = %format_bytes(tally.bytes()),
                    archived = %format_bytes(artifact.bytes),
                    "Data archive written"
                );
                let data = DataArchive {
                    file: artifact.file,
                    pod: pod.name,
                    archive_bytes: artifact.bytes,
                    archive_sha256: artifact.sha256,
                    stream_bytes: tally.bytes(),
                    stream_sha256: tally.sha256(),
                };
                Ok((Some(data), SnapshotStatus::Success))
            }
            StreamOutcome::SourceFailed(e) => {
                let reason = GatewayError::from_io(&e)
                    .map(|g| g.reason())
                    .unwrap_or_else(|| e.to_string());
                Ok((None, SnapshotStatus::PartialFailure(reason)))
            }
        }
    }
}

pub fn tar_out_command(mount_path: &str) -> Vec<String> {
    ["tar", "cf", "-", "-C", mount_path, "."]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
