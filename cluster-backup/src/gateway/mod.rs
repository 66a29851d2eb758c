//! Cluster gateway: the only component that talks to the control plane.
//!
//! The orchestrator holds an `Arc<dyn ClusterGateway>`; production wires in
//! [`kubectl::KubectlGateway`], tests wire in an in-memory fake.

pub mod kubectl;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

/// Byte stream fed into a pod (stdin of an exec).
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Byte stream read out of a pod (stdout of an exec). A non-zero exit shows
/// up as a final `Err` item with [`GatewayErrorKind::Exit`].
pub type ExecStream = Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayErrorKind {
    Transport,
    Auth,
    NotFound,
    Timeout,
    Exit(i32),
    Cancelled,
}

impl fmt::Display for GatewayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayErrorKind::Transport => write!(f, "transport"),
            GatewayErrorKind::Auth => write!(f, "auth"),
            GatewayErrorKind::NotFound => write!(f, "not found"),
            GatewayErrorKind::Timeout => write!(f, "timeout"),
            GatewayErrorKind::Exit(code) => write!(f, "exit {}", code),
            GatewayErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {cause}")]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub cause: String,
}

impl GatewayError {
    pub fn new(kind: GatewayErrorKind, cause: impl Into<String>) -> Self {
        Self {
            kind,
            cause: cause.into(),
        }
    }

    pub fn transport(cause: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Transport, cause)
    }

    pub fn timeout(cause: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Timeout, cause)
    }

    pub fn exit(code: i32, cause: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Exit(code), cause)
    }

    pub fn cancelled() -> Self {
        Self::new(GatewayErrorKind::Cancelled, "operation cancelled")
    }

    /// Short form recorded in manifests: `exit 1`, `cancelled`, or the full
    /// message for everything else.
    pub fn reason(&self) -> String {
        match self.kind {
            GatewayErrorKind::Exit(_) | GatewayErrorKind::Cancelled => self.kind.to_string(),
            _ => self.to_string(),
        }
    }

    /// Recover a gateway error that travelled through an `io::Error`.
    pub fn from_io(err: &std::io::Error) -> Option<GatewayError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<GatewayError>())
            .cloned()
    }
}

impl From<GatewayError> for std::io::Error {
    fn from(err: GatewayError) -> Self {
        std::io::Error::other(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeploymentRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for DeploymentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/deployment/{}", self.namespace, self.name)
    }
}

/// Something `wait_for_condition` can watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
    Pod(PodRef),
    Deployment(DeploymentRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Pod reports the Ready condition
    Ready,
    /// Resource no longer exists
    Deleted,
    /// Deployment has no ready replicas left
    NoReadyReplicas,
}

/// Short-lived pod that mounts a claim for restore streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPodSpec {
    pub name: String,
    pub namespace: String,
    pub claim: String,
    pub mount_path: String,
    pub image: String,
}

#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Raw YAML for `kind` in `namespace` (all namespaces when `None`),
    /// optionally a single named object.
    async fn get_resource(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> Result<String, GatewayError>;

    /// Names of running pods matching `selector`.
    async fn find_pods(&self, namespace: &str, selector: &str) -> Result<Vec<String>, GatewayError>;

    async fn exec_stream_out(
        &self,
        pod: &PodRef,
        command: &[String],
    ) -> Result<ExecStream, GatewayError>;

    /// Feed `input` to `command`'s stdin and return its exit code.
    async fn exec_stream_in(
        &self,
        pod: &PodRef,
        command: &[String],
        input: ByteStream,
    ) -> Result<i32, GatewayError>;

    /// Desired replica count (`spec.replicas`).
    async fn replicas(&self, deployment: &DeploymentRef) -> Result<i32, GatewayError>;

    async fn scale(&self, deployment: &DeploymentRef, replicas: i32) -> Result<(), GatewayError>;

    async fn wait_for_condition(
        &self,
        resource: &ResourceRef,
        condition: Condition,
        timeout: Duration,
    ) -> Result<(), GatewayError>;

    async fn create_transfer_pod(&self, spec: &TransferPodSpec) -> Result<PodRef, GatewayError>;

    async fn delete_pod(&self, pod: &PodRef) -> Result<(), GatewayError>;
}
