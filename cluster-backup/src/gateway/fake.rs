//! In-memory gateway for tests: simulates pods, exec exit codes, stream
//! failures and readiness timeouts without a cluster.

use super::{
    ByteStream, ClusterGateway, Condition, DeploymentRef, ExecStream, GatewayError,
    GatewayErrorKind, PodRef, ResourceRef, TransferPodSpec,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

const CHUNK: usize = 64 * 1024;

#[derive(Clone)]
struct PodBehavior {
    data: Vec<u8>,
    exit_code: i32,
    /// Emit this many bytes, then fail the stream with a transport error.
    break_after: Option<usize>,
}

#[derive(Default)]
struct FakeState {
    resources: HashMap<(String, Option<String>), Result<String, GatewayError>>,
    pods: HashMap<(String, String), Vec<String>>,
    pod_behavior: HashMap<String, PodBehavior>,
    pod_lookup_error: Option<GatewayError>,
    deployments: HashMap<(String, String), i32>,
    transfer_pods: HashMap<String, String>,
    transfer_never_ready: bool,
    scale_down_stuck: bool,
    restore_exit_code: i32,
    volumes: HashMap<String, Vec<u8>>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(self, kind: &str, namespace: Option<&str>, doc: &str) -> Self {
        self.state.lock().unwrap().resources.insert(
            (kind.to_string(), namespace.map(str::to_string)),
            Ok(doc.to_string()),
        );
        self
    }

    pub fn with_resource_error(
        self,
        kind: &str,
        namespace: Option<&str>,
        err: GatewayError,
    ) -> Self {
        self.state
            .lock()
            .unwrap()
            .resources
            .insert((kind.to_string(), namespace.map(str::to_string)), Err(err));
        self
    }

    /// Running pod `pod` matching `selector`, whose tar stream yields `data`.
    pub fn with_pod(self, namespace: &str, selector: &str, pod: &str, data: Vec<u8>) -> Self {
        self.with_pod_behavior(namespace, selector, pod, PodBehavior {
            data,
            exit_code: 0,
            break_after: None,
        })
    }

    /// Running pod whose exec emits `data` and then exits with `exit_code`.
    pub fn with_failing_pod(
        self,
        namespace: &str,
        selector: &str,
        pod: &str,
        data: Vec<u8>,
        exit_code: i32,
    ) -> Self {
        self.with_pod_behavior(namespace, selector, pod, PodBehavior {
            data,
            exit_code,
            break_after: None,
        })
    }

    /// Running pod whose stream breaks after `after` bytes.
    pub fn with_broken_stream(
        self,
        namespace: &str,
        selector: &str,
        pod: &str,
        data: Vec<u8>,
        after: usize,
    ) -> Self {
        self.with_pod_behavior(namespace, selector, pod, PodBehavior {
            data,
            exit_code: 0,
            break_after: Some(after),
        })
    }

    fn with_pod_behavior(
        self,
        namespace: &str,
        selector: &str,
        pod: &str,
        behavior: PodBehavior,
    ) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state
                .pods
                .entry((namespace.to_string(), selector.to_string()))
                .or_default()
                .push(pod.to_string());
            state.pod_behavior.insert(pod.to_string(), behavior);
        }
        self
    }

    pub fn with_pod_lookup_error(self, err: GatewayError) -> Self {
        self.state.lock().unwrap().pod_lookup_error = Some(err);
        self
    }

    pub fn with_deployment(self, namespace: &str, name: &str, replicas: i32) -> Self {
        self.state
            .lock()
            .unwrap()
            .deployments
            .insert((namespace.to_string(), name.to_string()), replicas);
        self
    }

    /// Deployments accept `scale 0` but their pods never terminate.
    pub fn with_scale_down_stuck(self) -> Self {
        self.state.lock().unwrap().scale_down_stuck = true;
        self
    }

    pub fn with_transfer_pods_never_ready(self) -> Self {
        self.state.lock().unwrap().transfer_never_ready = true;
        self
    }

    pub fn with_restore_exit_code(self, code: i32) -> Self {
        self.state.lock().unwrap().restore_exit_code = code;
        self
    }

    pub fn set_replicas(&self, namespace: &str, name: &str, replicas: i32) {
        self.state
            .lock()
            .unwrap()
            .deployments
            .insert((namespace.to_string(), name.to_string()), replicas);
    }

    pub fn replicas_of(&self, namespace: &str, name: &str) -> Option<i32> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
    }

    /// Bytes last streamed into a transfer pod mounting `claim`.
    pub fn volume(&self, claim: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().volumes.get(claim).cloned()
    }

    pub fn live_transfer_pods(&self) -> usize {
        self.state.lock().unwrap().transfer_pods.len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn exec_out_calls_for(&self, pod: &str) -> usize {
        let prefix = format!("exec_out {}", pod);
        self.calls().iter().filter(|c| c.starts_with(&prefix)).count()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

fn not_found(what: impl Into<String>) -> GatewayError {
    GatewayError::new(GatewayErrorKind::NotFound, what)
}

#[async_trait]
impl ClusterGateway for FakeGateway {
    async fn get_resource(
        &self,
        kind: &str,
        namespace: Option<&str>,
        _name: Option<&str>,
    ) -> Result<String, GatewayError> {
        self.record(format!("get {} {:?}", kind, namespace));
        let state = self.state.lock().unwrap();
        state
            .resources
            .get(&(kind.to_string(), namespace.map(str::to_string)))
            .cloned()
            .unwrap_or_else(|| Err(not_found(format!("{} in {:?}", kind, namespace))))
    }

    async fn find_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>, GatewayError> {
        self.record(format!("find_pods {} {}", namespace, selector));
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.pod_lookup_error {
            return Err(err.clone());
        }
        let mut pods = state
            .pods
            .get(&(namespace.to_string(), selector.to_string()))
            .cloned()
            .unwrap_or_default();
        pods.sort();
        Ok(pods)
    }

    async fn exec_stream_out(
        &self,
        pod: &PodRef,
        command: &[String],
    ) -> Result<ExecStream, GatewayError> {
        self.record(format!("exec_out {} {}", pod.name, command.join(" ")));
        let behavior = self
            .state
            .lock()
            .unwrap()
            .pod_behavior
            .get(&pod.name)
            .cloned()
            .ok_or_else(|| not_found(format!("pod {}", pod.name)))?;

        let emitted = behavior.break_after.unwrap_or(behavior.data.len()).min(behavior.data.len());
        let chunks: Vec<Result<Bytes, GatewayError>> = behavior.data[..emitted]
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let tail = if behavior.break_after.is_some() {
            Some(Err(GatewayError::transport("connection reset by peer")))
        } else if behavior.exit_code != 0 {
            Some(Err(GatewayError::exit(
                behavior.exit_code,
                format!("command terminated with exit code {}", behavior.exit_code),
            )))
        } else {
            None
        };

        Ok(Box::pin(stream::iter(chunks.into_iter().chain(tail))))
    }

    async fn exec_stream_in(
        &self,
        pod: &PodRef,
        command: &[String],
        mut input: ByteStream,
    ) -> Result<i32, GatewayError> {
        self.record(format!("exec_in {} {}", pod.name, command.join(" ")));
        let mut received = Vec::new();
        while let Some(chunk) = input.next().await {
            let chunk = chunk.map_err(|e| GatewayError::transport(format!("input stream: {}", e)))?;
            received.extend_from_slice(&chunk);
        }

        let mut state = self.state.lock().unwrap();
        if state.restore_exit_code != 0 {
            return Ok(state.restore_exit_code);
        }
        let claim = state
            .transfer_pods
            .get(&pod.name)
            .cloned()
            .ok_or_else(|| not_found(format!("pod {}", pod.name)))?;
        state.volumes.insert(claim, received);
        Ok(0)
    }

    async fn replicas(&self, deployment: &DeploymentRef) -> Result<i32, GatewayError> {
        self.record(format!("replicas {}", deployment));
        self.replicas_of(&deployment.namespace, &deployment.name)
            .ok_or_else(|| not_found(deployment.to_string()))
    }

    async fn scale(&self, deployment: &DeploymentRef, replicas: i32) -> Result<(), GatewayError> {
        self.record(format!("scale {} {}", deployment, replicas));
        let mut state = self.state.lock().unwrap();
        let entry = state
            .deployments
            .get_mut(&(deployment.namespace.clone(), deployment.name.clone()))
            .ok_or_else(|| not_found(deployment.to_string()))?;
        *entry = replicas;
        Ok(())
    }

    async fn wait_for_condition(
        &self,
        resource: &ResourceRef,
        condition: Condition,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        self.record(format!("wait {:?} {:?}", resource, condition));
        let state = self.state.lock().unwrap();
        match (resource, condition) {
            (ResourceRef::Deployment(d), Condition::NoReadyReplicas) => {
                let still_ready = || {
                    GatewayError::timeout(format!("{} still ready after {:?}", d, timeout))
                };
                match state.deployments.get(&(d.namespace.clone(), d.name.clone())) {
                    Some(0) if state.scale_down_stuck => Err(still_ready()),
                    Some(0) => Ok(()),
                    Some(_) => Err(still_ready()),
                    None => Err(not_found(d.to_string())),
                }
            }
            (ResourceRef::Pod(pod), Condition::Ready) => {
                if !state.transfer_pods.contains_key(&pod.name) {
                    return Err(not_found(format!("pod {}", pod.name)));
                }
                if state.transfer_never_ready {
                    return Err(GatewayError::timeout(format!(
                        "pod {} not ready after {:?}",
                        pod.name, timeout
                    )));
                }
                Ok(())
            }
            (ResourceRef::Pod(pod), Condition::Deleted) => {
                if state.transfer_pods.contains_key(&pod.name) {
                    Err(GatewayError::timeout(format!("pod {} still present", pod.name)))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    async fn create_transfer_pod(&self, spec: &TransferPodSpec) -> Result<PodRef, GatewayError> {
        self.record(format!("create_pod {} claim={}", spec.name, spec.claim));
        let mut state = self.state.lock().unwrap();
        if state.transfer_pods.contains_key(&spec.name) {
            return Err(GatewayError::transport(format!("pod {} already exists", spec.name)));
        }
        state
            .transfer_pods
            .insert(spec.name.clone(), spec.claim.clone());
        Ok(PodRef {
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
            container: Some("transfer".to_string()),
        })
    }

    async fn delete_pod(&self, pod: &PodRef) -> Result<(), GatewayError> {
        self.record(format!("delete_pod {}", pod.name));
        self.state.lock().unwrap().transfer_pods.remove(&pod.name);
        Ok(())
    }
}
