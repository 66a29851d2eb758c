//! Gateway implementation that drives the `kubectl` binary.
//!
//! Every non-streaming call runs under `request_timeout`; exec streams are
//! bounded by an idle timeout per chunk instead, since archives can be large.

use super::{
    ByteStream, ClusterGateway, Condition, DeploymentRef, ExecStream, GatewayError,
    GatewayErrorKind, PodRef, ResourceRef, TransferPodSpec,
};
use crate::config::ClusterConfig;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

const TRANSFER_CONTAINER: &str = "transfer";
const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct KubectlGateway {
    binary: String,
    context: Option<String>,
    kubeconfig: Option<PathBuf>,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
}

impl KubectlGateway {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            binary: config.kubectl.clone(),
            context: config.context.clone(),
            kubeconfig: config.kubeconfig.clone(),
            request_timeout: config.request_timeout(),
            stream_idle_timeout: config.stream_idle_timeout(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        if let Some(context) = &self.context {
            cmd.arg("--context").arg(context);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    fn spawn_failed(&self, e: std::io::Error) -> GatewayError {
        GatewayError::transport(format!("failed to spawn {}: {}", self.binary, e))
    }

    /// Run a kubectl invocation to completion and return its stdout.
    async fn run(&self, args: &[String], timeout: Duration) -> Result<String, GatewayError> {
        self.run_with_input(args, None, timeout).await
    }

    async fn run_with_input(
        &self,
        args: &[String],
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<String, GatewayError> {
        debug!(args = ?args, "kubectl");
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| self.spawn_failed(e))?;

        if let (Some(body), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin
                .write_all(body)
                .await
                .map_err(|e| GatewayError::transport(format!("writing kubectl stdin: {}", e)))?;
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                GatewayError::timeout(format!("kubectl {} exceeded {:?}", args.join(" "), timeout))
            })?
            .map_err(|e| GatewayError::transport(e.to_string()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(failure(output.status.code(), &stderr))
        }
    }

    fn exec_args(pod: &PodRef, command: &[String], stdin: bool) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if stdin {
            args.push("-i".to_string());
        }
        args.extend(["-n".to_string(), pod.namespace.clone(), pod.name.clone()]);
        if let Some(container) = &pod.container {
            args.extend(["-c".to_string(), container.clone()]);
        }
        args.push("--".to_string());
        args.extend(command.iter().cloned());
        args
    }

    async fn wait_no_ready_replicas(
        &self,
        deployment: &DeploymentRef,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let args = strings(&[
            "get",
            "deployment",
            &deployment.name,
            "-n",
            &deployment.namespace,
            "-o",
            "jsonpath={.status.readyReplicas}",
        ]);
        loop {
            let ready = self.run(&args, self.request_timeout).await?;
            let ready: i32 = ready.trim().parse().unwrap_or(0);
            if ready == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::timeout(format!(
                    "{} still has {} ready replicas after {:?}",
                    deployment, ready, timeout
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ClusterGateway for KubectlGateway {
    async fn get_resource(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> Result<String, GatewayError> {
        let mut args = vec!["get".to_string(), kind.to_string()];
        if let Some(name) = name {
            args.push(name.to_string());
        }
        match namespace {
            Some(ns) => args.extend(["-n".to_string(), ns.to_string()]),
            None => args.push("-A".to_string()),
        }
        args.extend(["-o".to_string(), "yaml".to_string()]);
        self.run(&args, self.request_timeout).await
    }

    async fn find_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>, GatewayError> {
        let args = strings(&[
            "get",
            "pods",
            "-n",
            namespace,
            "-l",
            selector,
            "--field-selector=status.phase=Running",
            "-o",
            "jsonpath={.items[*].metadata.name}",
        ]);
        let out = self.run(&args, self.request_timeout).await?;
        let mut pods: Vec<String> = out.split_whitespace().map(str::to_string).collect();
        pods.sort();
        Ok(pods)
    }

    async fn exec_stream_out(
        &self,
        pod: &PodRef,
        command: &[String],
    ) -> Result<ExecStream, GatewayError> {
        let args = Self::exec_args(pod, command, false);
        debug!(args = ?args, "kubectl exec (stream out)");
        let mut child = self
            .command()
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_failed(e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::transport("kubectl stdout not captured"))?;
        let stderr = collect_stderr(&mut child);

        let state = ExecState::Reading {
            stdout: ReaderStream::new(stdout),
            child,
            stderr,
        };
        let idle = self.stream_idle_timeout;

        let stream = stream::unfold(state, move |state| async move {
            let ExecState::Reading {
                mut stdout,
                mut child,
                stderr,
            } = state
            else {
                return None;
            };

            match tokio::time::timeout(idle, stdout.next()).await {
                Err(_) => {
                    let _ = child.start_kill();
                    let err = GatewayError::timeout(format!("exec stream idle for {:?}", idle));
                    Some((Err(err), ExecState::Done))
                }
                Ok(Some(Ok(chunk))) => Some((
                    Ok(chunk),
                    ExecState::Reading {
                        stdout,
                        child,
                        stderr,
                    },
                )),
                Ok(Some(Err(e))) => {
                    let _ = child.start_kill();
                    Some((Err(GatewayError::transport(e.to_string())), ExecState::Done))
                }
                Ok(None) => {
                    let status = child.wait().await;
                    let stderr = stderr.await.unwrap_or_default();
                    let err = match status {
                        Ok(s) if s.success() => return None,
                        Ok(s) => failure(s.code(), &stderr),
                        Err(e) => GatewayError::transport(e.to_string()),
                    };
                    Some((Err(err), ExecState::Done))
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn exec_stream_in(
        &self,
        pod: &PodRef,
        command: &[String],
        mut input: ByteStream,
    ) -> Result<i32, GatewayError> {
        let args = Self::exec_args(pod, command, true);
        debug!(args = ?args, "kubectl exec (stream in)");
        let mut child = self
            .command()
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_failed(e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::transport("kubectl stdin not captured"))?;
        let stderr = collect_stderr(&mut child);

        while let Some(chunk) = input.next().await {
            let chunk = chunk.map_err(|e| {
                GatewayError::from_io(&e)
                    .unwrap_or_else(|| GatewayError::transport(format!("input stream: {}", e)))
            })?;
            match tokio::time::timeout(self.stream_idle_timeout, stdin.write_all(&chunk)).await {
                Err(_) => {
                    let _ = child.start_kill();
                    return Err(GatewayError::timeout(format!(
                        "exec stdin blocked for {:?}",
                        self.stream_idle_timeout
                    )));
                }
                // The remote side exited early; its exit code tells why.
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => break,
                Ok(Err(e)) => return Err(GatewayError::transport(e.to_string())),
                Ok(Ok(())) => {}
            }
        }
        drop(stdin);

        let status = tokio::time::timeout(self.request_timeout, child.wait())
            .await
            .map_err(|_| GatewayError::timeout("waiting for exec to finish"))?
            .map_err(|e| GatewayError::transport(e.to_string()))?;
        let stderr = stderr.await.unwrap_or_default();

        if status.success() {
            return Ok(0);
        }
        if let Some(code) = remote_exit_code(&stderr) {
            warn!(pod = %pod, code, stderr = %stderr.trim(), "Remote command failed");
            return Ok(code);
        }
        Err(failure(status.code(), &stderr))
    }

    async fn replicas(&self, deployment: &DeploymentRef) -> Result<i32, GatewayError> {
        let args = strings(&[
            "get",
            "deployment",
            &deployment.name,
            "-n",
            &deployment.namespace,
            "-o",
            "jsonpath={.spec.replicas}",
        ]);
        let out = self.run(&args, self.request_timeout).await?;
        out.trim().parse().map_err(|_| {
            GatewayError::transport(format!(
                "unexpected replica count '{}' for {}",
                out.trim(),
                deployment
            ))
        })
    }

    async fn scale(&self, deployment: &DeploymentRef, replicas: i32) -> Result<(), GatewayError> {
        let target = format!("deployment/{}", deployment.name);
        let count = format!("--replicas={}", replicas);
        let args = strings(&["scale", &target, "-n", &deployment.namespace, &count]);
        self.run(&args, self.request_timeout).await.map(|_| ())
    }

    async fn wait_for_condition(
        &self,
        resource: &ResourceRef,
        condition: Condition,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        let (object, namespace) = match resource {
            ResourceRef::Pod(pod) => (format!("pod/{}", pod.name), pod.namespace.as_str()),
            ResourceRef::Deployment(d) => {
                if condition == Condition::NoReadyReplicas {
                    return self.wait_no_ready_replicas(d, timeout).await;
                }
                (format!("deployment/{}", d.name), d.namespace.as_str())
            }
        };
        let wait_for = match condition {
            Condition::Ready => match resource {
                ResourceRef::Pod(_) => "--for=condition=Ready",
                ResourceRef::Deployment(_) => "--for=condition=Available",
            },
            Condition::Deleted => "--for=delete",
            Condition::NoReadyReplicas => {
                return Err(GatewayError::transport("NoReadyReplicas only applies to deployments"))
            }
        };
        let timeout_arg = format!("--timeout={}s", timeout.as_secs().max(1));
        let args = strings(&["wait", wait_for, &object, "-n", namespace, &timeout_arg]);
        self.run(&args, timeout + self.request_timeout).await.map(|_| ())
    }

    async fn create_transfer_pod(&self, spec: &TransferPodSpec) -> Result<PodRef, GatewayError> {
        let manifest = transfer_pod_manifest(spec);
        let args = strings(&["create", "-f", "-"]);
        self.run_with_input(&args, Some(manifest.to_string().as_bytes()), self.request_timeout)
            .await?;
        Ok(PodRef {
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
            container: Some(TRANSFER_CONTAINER.to_string()),
        })
    }

    async fn delete_pod(&self, pod: &PodRef) -> Result<(), GatewayError> {
        let args = strings(&[
            "delete",
            "pod",
            &pod.name,
            "-n",
            &pod.namespace,
            "--ignore-not-found",
            "--wait=false",
        ]);
        self.run(&args, self.request_timeout).await.map(|_| ())
    }
}

enum ExecState {
    Reading {
        stdout: ReaderStream<ChildStdout>,
        child: Child,
        stderr: JoinHandle<String>,
    },
    Done,
}

fn collect_stderr(child: &mut Child) -> JoinHandle<String> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let mut out = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut out).await;
        }
        out
    })
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// kubectl reports a remote command's status as
/// `command terminated with exit code N`.
fn remote_exit_code(stderr: &str) -> Option<i32> {
    const MARKER: &str = "command terminated with exit code ";
    let start = stderr.find(MARKER)? + MARKER.len();
    stderr[start..]
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|n| n.parse().ok())
}

fn classify(stderr: &str) -> GatewayErrorKind {
    let lower = stderr.to_lowercase();
    let denied = ["unauthorized", "forbidden", "must be logged in"];
    if denied.iter().any(|s| lower.contains(s)) {
        GatewayErrorKind::Auth
    } else if lower.contains("notfound") || lower.contains("not found") {
        GatewayErrorKind::NotFound
    } else if lower.contains("timed out") {
        GatewayErrorKind::Timeout
    } else {
        GatewayErrorKind::Transport
    }
}

fn failure(code: Option<i32>, stderr: &str) -> GatewayError {
    let stderr = stderr.trim();
    if let Some(remote) = remote_exit_code(stderr) {
        return GatewayError::exit(remote, stderr);
    }
    let code = code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string());
    GatewayError::new(classify(stderr), format!("kubectl exited with {}: {}", code, stderr))
}

fn transfer_pod_manifest(spec: &TransferPodSpec) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
            "labels": { "app.kubernetes.io/managed-by": "cluster-backup" },
        },
        "spec": {
            "restartPolicy": "Never",
            "containers": [{
                "name": TRANSFER_CONTAINER,
                "image": spec.image,
                "command": ["sleep", "86400"],
                "volumeMounts": [{ "name": "data", "mountPath": spec.mount_path }],
            }],
            "volumes": [{
                "name": "data",
                "persistentVolumeClaim": { "claimName": spec.claim },
            }],
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    /// Gateway whose kubectl is a shell script ignoring its arguments.
    #[cfg(unix)]
    fn scripted(dir: &TempDir, body: &str) -> KubectlGateway {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("kubectl");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        KubectlGateway::new(&ClusterConfig {
            kubectl: path.to_string_lossy().into_owned(),
            request_timeout_secs: 5,
            stream_idle_timeout_secs: 1,
            ..ClusterConfig::default()
        })
    }

    fn transfer_pod() -> PodRef {
        PodRef {
            namespace: "apps".to_string(),
            name: "restore-alpha-0".to_string(),
            container: Some(TRANSFER_CONTAINER.to_string()),
        }
    }

    fn chunks(count: usize) -> ByteStream {
        let chunk = Bytes::from(vec![7u8; 64 * 1024]);
        Box::pin(stream::iter(
            (0..count).map(move |_| Ok::<_, std::io::Error>(chunk.clone())),
        ))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_exec_stream_hits_idle_timeout() {
        let dir = TempDir::new().unwrap();
        let gateway = scripted(&dir, "printf abc\nexec sleep 30");
        let started = std::time::Instant::now();

        let mut out = gateway
            .exec_stream_out(&transfer_pod(), &strings(&["tar", "cf", "-"]))
            .await
            .unwrap();

        assert_eq!(&out.next().await.unwrap().unwrap()[..], b"abc");
        let err = out.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::Timeout);
        assert!(out.next().await.is_none());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_stream_reports_remote_exit_code() {
        let dir = TempDir::new().unwrap();
        let gateway = scripted(
            &dir,
            "printf abc\necho 'command terminated with exit code 1' >&2\nexit 1",
        );

        let mut out = gateway
            .exec_stream_out(&transfer_pod(), &strings(&["tar", "cf", "-"]))
            .await
            .unwrap();

        assert_eq!(&out.next().await.unwrap().unwrap()[..], b"abc");
        let err = out.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::Exit(1));
        assert!(out.next().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_stream_in_drains_input() {
        let dir = TempDir::new().unwrap();
        let gateway = scripted(&dir, "cat > /dev/null");

        let code = gateway
            .exec_stream_in(&transfer_pod(), &strings(&["tar", "xf", "-"]), chunks(32))
            .await
            .unwrap();

        assert_eq!(code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_stream_in_returns_remote_exit_code() {
        let dir = TempDir::new().unwrap();
        let gateway = scripted(
            &dir,
            "cat > /dev/null\necho 'command terminated with exit code 2' >&2\nexit 1",
        );

        let code = gateway
            .exec_stream_in(&transfer_pod(), &strings(&["tar", "xf", "-"]), chunks(32))
            .await
            .unwrap();

        assert_eq!(code, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remote_exit_before_reading_input() {
        let dir = TempDir::new().unwrap();
        let gateway = scripted(
            &dir,
            "echo 'command terminated with exit code 2' >&2\nexit 1",
        );

        // More than a pipe buffer, so the writer sees the closed pipe.
        let code = gateway
            .exec_stream_in(&transfer_pod(), &strings(&["tar", "xf", "-"]), chunks(64))
            .await
            .unwrap();

        assert_eq!(code, 2);
    }

    #[test]
    fn test_remote_exit_code_parsing() {
        assert_eq!(
            remote_exit_code("tar: can't open\ncommand terminated with exit code 2\n"),
            Some(2)
        );
        assert_eq!(remote_exit_code("error: pod not found"), None);
    }

    #[test]
    fn test_failure_classification() {
        let err = failure(Some(1), "error: You must be logged in to the server (Unauthorized)");
        assert_eq!(err.kind, GatewayErrorKind::Auth);

        let err = failure(Some(1), "Error from server (NotFound): pods \"x\" not found");
        assert_eq!(err.kind, GatewayErrorKind::NotFound);

        let err = failure(Some(1), "command terminated with exit code 1");
        assert_eq!(err.kind, GatewayErrorKind::Exit(1));

        let err = failure(Some(1), "error: timed out waiting for the condition on pods/x");
        assert_eq!(err.kind, GatewayErrorKind::Timeout);

        let err = failure(None, "connection refused");
        assert_eq!(err.kind, GatewayErrorKind::Transport);
    }

    #[test]
    fn test_exec_args() {
        let pod = PodRef {
            namespace: "apps".to_string(),
            name: "alpha-0".to_string(),
            container: Some("app".to_string()),
        };
        let args = KubectlGateway::exec_args(&pod, &strings(&["tar", "cf", "-"]), true);
        assert_eq!(
            args,
            strings(&["exec", "-i", "-n", "apps", "alpha-0", "-c", "app", "--", "tar", "cf", "-"])
        );
    }

    #[test]
    fn test_transfer_pod_manifest_mounts_claim() {
        let spec = TransferPodSpec {
            name: "restore-alpha-1a2b3c4d".to_string(),
            namespace: "apps".to_string(),
            claim: "alpha-data".to_string(),
            mount_path: "/data".to_string(),
            image: "busybox:1.36".to_string(),
        };
        let manifest = transfer_pod_manifest(&spec);
        assert_eq!(
            manifest["spec"]["volumes"][0]["persistentVolumeClaim"]["claimName"],
            "alpha-data"
        );
        assert_eq!(
            manifest["spec"]["containers"][0]["volumeMounts"][0]["mountPath"],
            "/data"
        );
    }
}
