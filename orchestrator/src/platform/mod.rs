use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use agentbox_types::{ClusterCapacity, NetworkConfig, ResourceSpec, SecurityContext, Toleration};
use anyhow::Result;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod kube;

#[cfg(test)]
pub mod mock;

/// Name of the long-running main pod inside every environment namespace.
pub const MAIN_POD_NAME: &str = "main";

/// Everything the orchestrator asks of a pod, independent of the
/// orchestrator's own API types.
#[derive(Debug, Clone, Default)]
pub struct PodConfig {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub resources: ResourceSpec,
    pub runtime_class: Option<String>,
    pub security_context: SecurityContext,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub stdin: bool,
    pub tty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Observed pod state, reduced to what the orchestrator consumes.
#[derive(Debug, Clone)]
pub struct PodState {
    pub name: String,
    pub phase: PodPhase,
    /// Exit code of the first terminated container, when one exists.
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PodMetrics {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

/// A live bidirectional exec session, consumed by the WebSocket attach
/// path. The streams come straight from the platform; `status` resolves to
/// the process exit code once the remote side finishes.
pub struct ExecSession {
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub status: Pin<Box<dyn Future<Output = i32> + Send>>,
}

pub type LogLines = BoxStream<'static, std::io::Result<String>>;

/// The external container orchestrator, opaque to the rest of the core.
#[async_trait::async_trait]
pub trait Platform: Send + Sync {
    async fn health_check(&self) -> Result<()>;

    async fn server_version(&self) -> Result<String>;

    async fn cluster_capacity(&self) -> Result<ClusterCapacity>;

    /// Create a namespace with the given labels. Succeeds if the namespace
    /// already exists.
    async fn create_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    /// Delete a namespace and wait until the platform reports it gone.
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    async fn create_resource_quota(
        &self,
        namespace: &str,
        name: &str,
        spec: &ResourceSpec,
    ) -> Result<()>;

    /// Default-deny policy plus DNS egress, extended by the per-environment
    /// allow rules.
    async fn create_network_policy(
        &self,
        namespace: &str,
        name: &str,
        config: &NetworkConfig,
    ) -> Result<()>;

    async fn create_pod(&self, namespace: &str, config: &PodConfig) -> Result<()>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodState>>;

    async fn delete_pod(&self, namespace: &str, name: &str, force: bool) -> Result<()>;

    async fn wait_for_pod_running(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()>;

    /// Run a command to completion, capturing bounded stdout/stderr.
    async fn exec_in_pod(&self, namespace: &str, pod: &str, command: &[String])
    -> Result<ExecOutput>;

    /// Open an interactive exec session with live streams.
    async fn open_exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<ExecSession>;

    async fn get_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        tail: Option<i64>,
        timestamps: bool,
    ) -> Result<String>;

    async fn stream_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        tail: Option<i64>,
        follow: bool,
        timestamps: bool,
    ) -> Result<LogLines>;

    async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<PodState>>;

    async fn get_pod_metrics(&self, namespace: &str, pod: &str) -> Result<PodMetrics>;
}
