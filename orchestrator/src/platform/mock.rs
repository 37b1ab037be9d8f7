use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentbox_types::{ClusterCapacity, NetworkConfig, ResourceSpec};
use anyhow::{Result, anyhow, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{
    ExecOutput, ExecSession, LogLines, Platform, PodConfig, PodMetrics, PodPhase, PodState,
};

#[derive(Clone)]
pub struct MockPod {
    pub config: PodConfig,
    pub phase: PodPhase,
    pub exit_code: Option<i32>,
    pub logs: String,
}

#[derive(Default)]
pub struct MockNamespace {
    pub labels: BTreeMap<String, String>,
    pub quotas: Vec<(String, ResourceSpec)>,
    pub policies: Vec<(String, NetworkConfig)>,
    pub pods: HashMap<String, MockPod>,
}

#[derive(Default)]
struct State {
    namespaces: HashMap<String, MockNamespace>,
    fail_ops: HashSet<&'static str>,
    exec_output: ExecOutput,
    /// Phase newly created pods land in.
    created_pod_phase: Option<PodPhase>,
    created_pod_logs: String,
    deleted_pods: Vec<(String, String)>,
}

/// In-memory Platform double. Namespaces and pods live in plain maps;
/// individual operations can be told to fail by name.
pub struct MockPlatform {
    state: Mutex<State>,
    stdin_captured: Arc<Mutex<Vec<u8>>>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                created_pod_phase: Some(PodPhase::Running),
                ..Default::default()
            }),
            stdin_captured: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn fail_op(&self, op: &'static str) {
        self.state.lock().unwrap().fail_ops.insert(op);
    }

    pub fn set_exec_output(&self, output: ExecOutput) {
        self.state.lock().unwrap().exec_output = output;
    }

    /// Phase assigned to pods at creation; `PodPhase::Succeeded` makes
    /// ephemeral executions complete immediately, `PodPhase::Pending` makes
    /// them hang until cancelled.
    pub fn set_created_pod_phase(&self, phase: PodPhase) {
        self.state.lock().unwrap().created_pod_phase = Some(phase);
    }

    pub fn set_created_pod_logs(&self, logs: &str) {
        self.state.lock().unwrap().created_pod_logs = logs.to_string();
    }

    pub fn set_pod_phase(&self, namespace: &str, pod: &str, phase: PodPhase) {
        let mut state = self.state.lock().unwrap();
        if let Some(ns) = state.namespaces.get_mut(namespace)
            && let Some(pod) = ns.pods.get_mut(pod)
        {
            pod.phase = phase;
        }
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().unwrap().namespaces.contains_key(name)
    }

    pub fn has_pod(&self, namespace: &str, pod: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .get(namespace)
            .is_some_and(|ns| ns.pods.contains_key(pod))
    }

    pub fn namespace_labels(&self, name: &str) -> BTreeMap<String, String> {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .get(name)
            .map(|ns| ns.labels.clone())
            .unwrap_or_default()
    }

    pub fn quota_count(&self, namespace: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .get(namespace)
            .map(|ns| ns.quotas.len())
            .unwrap_or(0)
    }

    pub fn policies(&self, namespace: &str) -> Vec<(String, NetworkConfig)> {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .get(namespace)
            .map(|ns| ns.policies.clone())
            .unwrap_or_default()
    }

    pub fn deleted_pods(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().deleted_pods.clone()
    }

    pub fn captured_stdin(&self) -> Vec<u8> {
        self.stdin_captured.lock().unwrap().clone()
    }

    fn check_fail(&self, op: &'static str) -> Result<()> {
        if self.state.lock().unwrap().fail_ops.contains(op) {
            bail!("injected {op} failure");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Platform for MockPlatform {
    async fn health_check(&self) -> Result<()> {
        self.check_fail("health_check")
    }

    async fn server_version(&self) -> Result<String> {
        self.check_fail("server_version")?;
        Ok("v1.99.0-mock".to_string())
    }

    async fn cluster_capacity(&self) -> Result<ClusterCapacity> {
        self.check_fail("cluster_capacity")?;
        Ok(ClusterCapacity {
            nodes: 3,
            cpu: "12000m".to_string(),
            memory: "49152Mi".to_string(),
        })
    }

    async fn create_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        self.check_fail("create_namespace")?;
        let mut state = self.state.lock().unwrap();
        // Idempotent: keep the existing namespace and its contents.
        state
            .namespaces
            .entry(name.to_string())
            .or_insert_with(|| MockNamespace {
                labels: labels.clone(),
                ..Default::default()
            });
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.check_fail("delete_namespace")?;
        self.state.lock().unwrap().namespaces.remove(name);
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.has_namespace(name))
    }

    async fn create_resource_quota(
        &self,
        namespace: &str,
        name: &str,
        spec: &ResourceSpec,
    ) -> Result<()> {
        self.check_fail("create_resource_quota")?;
        let mut state = self.state.lock().unwrap();
        let ns = state
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| anyhow!("namespace {namespace} not found"))?;
        ns.quotas.push((name.to_string(), spec.clone()));
        Ok(())
    }

    async fn create_network_policy(
        &self,
        namespace: &str,
        name: &str,
        config: &NetworkConfig,
    ) -> Result<()> {
        self.check_fail("create_network_policy")?;
        let mut state = self.state.lock().unwrap();
        let ns = state
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| anyhow!("namespace {namespace} not found"))?;
        ns.policies.push((name.to_string(), config.clone()));
        Ok(())
    }

    async fn create_pod(&self, namespace: &str, config: &PodConfig) -> Result<()> {
        self.check_fail("create_pod")?;
        let mut state = self.state.lock().unwrap();
        let phase = state.created_pod_phase.unwrap_or(PodPhase::Running);
        let logs = state.created_pod_logs.clone();
        let ns = state
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| anyhow!("namespace {namespace} not found"))?;
        if ns.pods.contains_key(&config.name) {
            bail!("pod {} already exists", config.name);
        }
        ns.pods.insert(
            config.name.clone(),
            MockPod {
                config: config.clone(),
                phase,
                exit_code: match phase {
                    PodPhase::Succeeded => Some(0),
                    PodPhase::Failed => Some(1),
                    _ => None,
                },
                logs,
            },
        );
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodState>> {
        self.check_fail("get_pod")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.pods.get(name))
            .map(|pod| PodState {
                name: name.to_string(),
                phase: pod.phase,
                exit_code: pod.exit_code,
            }))
    }

    async fn delete_pod(&self, namespace: &str, name: &str, _force: bool) -> Result<()> {
        self.check_fail("delete_pod")?;
        let mut state = self.state.lock().unwrap();
        if let Some(ns) = state.namespaces.get_mut(namespace) {
            ns.pods.remove(name);
        }
        state
            .deleted_pods
            .push((namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn wait_for_pod_running(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.check_fail("wait_for_pod_running")?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let state = self.state.lock().unwrap();
                let phase = state
                    .namespaces
                    .get(namespace)
                    .and_then(|ns| ns.pods.get(name))
                    .map(|pod| pod.phase);
                match phase {
                    Some(PodPhase::Running) => return Ok(()),
                    Some(PodPhase::Failed) => bail!("pod {name} failed"),
                    _ => {}
                }
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("pod {name} did not reach Running within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        _command: &[String],
    ) -> Result<ExecOutput> {
        self.check_fail("exec_in_pod")?;
        if !self.has_pod(namespace, pod) {
            bail!("pod {pod} not found in {namespace}");
        }
        Ok(self.state.lock().unwrap().exec_output.clone())
    }

    async fn open_exec(
        &self,
        namespace: &str,
        pod: &str,
        _command: &[String],
    ) -> Result<ExecSession> {
        self.check_fail("open_exec")?;
        if !self.has_pod(namespace, pod) {
            bail!("pod {pod} not found in {namespace}");
        }
        let output = self.state.lock().unwrap().exec_output.clone();

        // Stdin sink: capture whatever the attach layer writes.
        let (stdin_w, mut stdin_r) = tokio::io::duplex(4096);
        let captured = self.stdin_captured.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stdin_r.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => captured.lock().unwrap().extend_from_slice(&buf[..n]),
                }
            }
        });

        // Stdout/stderr sources: emit the configured output, then EOF.
        let (mut out_w, out_r) = tokio::io::duplex(4096);
        let (mut err_w, err_r) = tokio::io::duplex(4096);
        let exit_code = output.exit_code;
        let writer = tokio::spawn(async move {
            out_w.write_all(output.stdout.as_bytes()).await.ok();
            err_w.write_all(output.stderr.as_bytes()).await.ok();
        });
        let status = Box::pin(async move {
            writer.await.ok();
            exit_code
        });

        Ok(ExecSession {
            stdin: Some(Box::new(stdin_w)),
            stdout: Some(Box::new(out_r)),
            stderr: Some(Box::new(err_r)),
            status,
        })
    }

    async fn get_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        tail: Option<i64>,
        _timestamps: bool,
    ) -> Result<String> {
        self.check_fail("get_pod_logs")?;
        let state = self.state.lock().unwrap();
        let logs = state
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.pods.get(pod))
            .map(|p| p.logs.clone())
            .ok_or_else(|| anyhow!("pod {pod} not found in {namespace}"))?;
        match tail {
            Some(n) => {
                let lines: Vec<&str> = logs.lines().collect();
                let start = lines.len().saturating_sub(n.max(0) as usize);
                Ok(lines[start..].join("\n"))
            }
            None => Ok(logs),
        }
    }

    async fn stream_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        tail: Option<i64>,
        _follow: bool,
        _timestamps: bool,
    ) -> Result<LogLines> {
        let logs = self.get_pod_logs(namespace, pod, tail, false).await?;
        let lines: Vec<std::io::Result<String>> =
            logs.lines().map(|l| Ok(l.to_string())).collect();
        Ok(Box::pin(tokio_stream::iter(lines)))
    }

    async fn list_pods(&self, namespace: &str, _selector: Option<&str>) -> Result<Vec<PodState>> {
        self.check_fail("list_pods")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .namespaces
            .get(namespace)
            .map(|ns| {
                ns.pods
                    .iter()
                    .map(|(name, pod)| PodState {
                        name: name.clone(),
                        phase: pod.phase,
                        exit_code: pod.exit_code,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_pod_metrics(&self, _namespace: &str, _pod: &str) -> Result<PodMetrics> {
        self.check_fail("get_pod_metrics")?;
        Ok(PodMetrics {
            cpu_millis: 5,
            memory_bytes: 64 << 20,
        })
    }
}
