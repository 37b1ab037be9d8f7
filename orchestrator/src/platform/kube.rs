use std::collections::BTreeMap;
use std::time::Duration;

use agentbox_common::wait::backoff_full_jitter;
use agentbox_types::{ClusterCapacity, NetworkConfig, ResourceSpec};
use anyhow::{Context, Result, anyhow, bail};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Namespace, Node, Pod, PodSpec, ResourceQuota, ResourceQuotaSpec,
    SecurityContext as KubeSecurityContext, Toleration as KubeToleration,
};
use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, Status};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Client, Config as KubeConfig};
use tokio::io::AsyncReadExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::compat::FuturesAsyncReadCompatExt;

use super::{
    ExecOutput, ExecSession, LogLines, Platform, PodConfig, PodMetrics, PodPhase, PodState,
};
use crate::validate::{parse_bytes, parse_cpu_millis};

/// Largest stdout/stderr capture a single exec may produce.
const MAX_EXEC_CAPTURE: u64 = 1 << 20;

/// How long `delete_namespace` polls for the namespace to disappear.
const NAMESPACE_DELETE_TIMEOUT: Duration = Duration::from_secs(120);

pub struct KubePlatform {
    client: Client,
    cluster_dns_namespace: String,
}

impl KubePlatform {
    /// Build a client: in-cluster configuration first (service-account
    /// mounted), then the kubeconfig path from the args, then the default
    /// kubeconfig locations.
    pub async fn connect(
        kubeconfig_path: Option<&str>,
        cluster_dns_namespace: String,
    ) -> Result<Self> {
        let client = match KubeConfig::incluster() {
            Ok(config) => {
                Client::try_from(config).context("failed to create in-cluster client")?
            }
            Err(_) => {
                let kubeconfig = match kubeconfig_path {
                    Some(path) => {
                        Kubeconfig::read_from(path).context("failed to read kubeconfig")?
                    }
                    None => Kubeconfig::read().context("failed to read default kubeconfig")?,
                };
                let config =
                    KubeConfig::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .context("failed to build client config from kubeconfig")?;
                Client::try_from(config).context("failed to create client")?
            }
        };
        Ok(Self {
            client,
            cluster_dns_namespace,
        })
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn is_api_code(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

fn pod_phase(pod: &Pod) -> PodPhase {
    match pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
    {
        "Pending" => PodPhase::Pending,
        "Running" => PodPhase::Running,
        "Succeeded" => PodPhase::Succeeded,
        "Failed" => PodPhase::Failed,
        _ => PodPhase::Unknown,
    }
}

fn pod_state(pod: &Pod) -> PodState {
    let exit_code = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| {
            statuses
                .iter()
                .find_map(|cs| cs.state.as_ref()?.terminated.as_ref())
        })
        .map(|t| t.exit_code);
    PodState {
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase: pod_phase(pod),
        exit_code,
    }
}

/// Map the Status message delivered on the exec channel to an exit code:
/// 0 on clean return, the reported code for NonZeroExitCode failures, 1 for
/// any other failure.
fn exit_code_from_status(status: Option<&Status>) -> i32 {
    match status {
        None => 0,
        Some(s) if s.status.as_deref() == Some("Success") => 0,
        Some(s) => s
            .details
            .as_ref()
            .and_then(|d| d.causes.as_ref())
            .and_then(|causes| {
                causes
                    .iter()
                    .find(|c| c.reason.as_deref() == Some("ExitCode"))
            })
            .and_then(|c| c.message.as_deref())
            .and_then(|m| m.trim().parse().ok())
            .unwrap_or(1),
    }
}

fn quantity_map(spec: &ResourceSpec) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    map.insert("cpu".to_string(), Quantity(spec.cpu.clone()));
    map.insert("memory".to_string(), Quantity(spec.memory.clone()));
    map.insert(
        "ephemeral-storage".to_string(),
        Quantity(spec.storage.clone()),
    );
    map
}

fn dns_egress_rule(dns_namespace: &str) -> NetworkPolicyEgressRule {
    let mut match_labels = BTreeMap::new();
    match_labels.insert(
        "kubernetes.io/metadata.name".to_string(),
        dns_namespace.to_string(),
    );
    NetworkPolicyEgressRule {
        to: Some(vec![NetworkPolicyPeer {
            namespace_selector: Some(LabelSelector {
                match_labels: Some(match_labels),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ports: Some(
            ["UDP", "TCP"]
                .into_iter()
                .map(|protocol| NetworkPolicyPort {
                    protocol: Some(protocol.to_string()),
                    port: Some(IntOrString::Int(53)),
                    ..Default::default()
                })
                .collect(),
        ),
    }
}

fn parse_cpu_usage_millis(s: &str) -> u64 {
    // Metrics-server reports cpu in n (nano) or u (micro) cores.
    if let Some(n) = s.strip_suffix('n') {
        return n.parse::<u64>().unwrap_or(0) / 1_000_000;
    }
    if let Some(u) = s.strip_suffix('u') {
        return u.parse::<u64>().unwrap_or(0) / 1_000;
    }
    parse_cpu_millis(s).unwrap_or(0)
}

#[async_trait::async_trait]
impl Platform for KubePlatform {
    async fn health_check(&self) -> Result<()> {
        self.client
            .apiserver_version()
            .await
            .context("apiserver unreachable")?;
        Ok(())
    }

    async fn server_version(&self) -> Result<String> {
        let info = self
            .client
            .apiserver_version()
            .await
            .context("failed to read apiserver version")?;
        Ok(info.git_version)
    }

    async fn cluster_capacity(&self) -> Result<ClusterCapacity> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .context("failed to list nodes")?;
        let mut cpu_millis = 0u64;
        let mut memory_bytes = 0u64;
        for node in &list.items {
            if let Some(capacity) = node.status.as_ref().and_then(|s| s.capacity.as_ref()) {
                if let Some(Quantity(cpu)) = capacity.get("cpu") {
                    cpu_millis += parse_cpu_millis(cpu).unwrap_or(0);
                }
                if let Some(Quantity(memory)) = capacity.get("memory") {
                    memory_bytes += parse_bytes(memory).unwrap_or(0);
                }
            }
        }
        Ok(ClusterCapacity {
            nodes: list.items.len(),
            cpu: format!("{}m", cpu_millis),
            memory: format!("{}Mi", memory_bytes >> 20),
        })
    }

    async fn create_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        match self
            .namespaces()
            .create(&PostParams::default(), &namespace)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_api_code(&e, 409) => Ok(()),
            Err(e) => Err(e).context("namespace create rejected"),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api = self.namespaces();
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(e) if is_api_code(&e, 404) => return Ok(()),
            Err(e) => return Err(e).context("namespace delete rejected"),
        }
        // Wait for the cascade to finish; callers rely on gone-means-gone.
        let deadline = tokio::time::Instant::now() + NAMESPACE_DELETE_TIMEOUT;
        let mut attempt = 0;
        loop {
            if api
                .get_opt(name)
                .await
                .context("failed to poll namespace during deletion")?
                .is_none()
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("namespace {} still present after {:?}", name, NAMESPACE_DELETE_TIMEOUT);
            }
            tokio::time::sleep(backoff_full_jitter(
                Duration::from_millis(250),
                Duration::from_secs(5),
                attempt,
            ))
            .await;
            attempt += 1;
        }
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .namespaces()
            .get_opt(name)
            .await
            .context("failed to look up namespace")?
            .is_some())
    }

    async fn create_resource_quota(
        &self,
        namespace: &str,
        name: &str,
        spec: &ResourceSpec,
    ) -> Result<()> {
        let mut hard = BTreeMap::new();
        for (key, value) in [
            ("requests.cpu", &spec.cpu),
            ("limits.cpu", &spec.cpu),
            ("requests.memory", &spec.memory),
            ("limits.memory", &spec.memory),
            ("requests.ephemeral-storage", &spec.storage),
            ("limits.ephemeral-storage", &spec.storage),
        ] {
            hard.insert(key.to_string(), Quantity(value.clone()));
        }
        let quota = ResourceQuota {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(ResourceQuotaSpec {
                hard: Some(hard),
                ..Default::default()
            }),
            ..Default::default()
        };
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), &quota).await {
            Ok(_) => Ok(()),
            Err(e) if is_api_code(&e, 409) => Ok(()),
            Err(e) => Err(e).context("resource quota create rejected"),
        }
    }

    async fn create_network_policy(
        &self,
        namespace: &str,
        name: &str,
        config: &NetworkConfig,
    ) -> Result<()> {
        let mut egress = vec![dns_egress_rule(&self.cluster_dns_namespace)];
        let mut ingress: Vec<NetworkPolicyIngressRule> = Vec::new();

        if config.allow_internet {
            // An empty `to` list is unrestricted egress.
            egress.push(NetworkPolicyEgressRule {
                to: None,
                ports: None,
            });
        }
        if !config.allowed_egress_cidrs.is_empty() {
            egress.push(NetworkPolicyEgressRule {
                to: Some(
                    config
                        .allowed_egress_cidrs
                        .iter()
                        .map(|cidr| NetworkPolicyPeer {
                            ip_block: Some(IPBlock {
                                cidr: cidr.clone(),
                                except: None,
                            }),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ports: None,
            });
        }
        if config.allow_cluster_internal {
            let all_namespaces = NetworkPolicyPeer {
                namespace_selector: Some(LabelSelector::default()),
                ..Default::default()
            };
            egress.push(NetworkPolicyEgressRule {
                to: Some(vec![all_namespaces.clone()]),
                ports: None,
            });
            ingress.push(NetworkPolicyIngressRule {
                from: Some(vec![all_namespaces]),
                ports: None,
            });
        }
        if !config.allowed_ingress_ports.is_empty() {
            ingress.push(NetworkPolicyIngressRule {
                from: None,
                ports: Some(
                    config
                        .allowed_ingress_ports
                        .iter()
                        .map(|port| NetworkPolicyPort {
                            protocol: Some("TCP".to_string()),
                            port: Some(IntOrString::Int(i32::from(*port))),
                            ..Default::default()
                        })
                        .collect(),
                ),
            });
        }

        let policy = NetworkPolicy {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                // Empty pod selector: every pod in the namespace.
                pod_selector: Some(LabelSelector::default()),
                policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
                ingress: Some(ingress),
                egress: Some(egress),
            }),
        };
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), &policy).await {
            Ok(_) => Ok(()),
            Err(e) if is_api_code(&e, 409) => Ok(()),
            Err(e) => Err(e).context("network policy create rejected"),
        }
    }

    async fn create_pod(&self, namespace: &str, config: &PodConfig) -> Result<()> {
        let env: Vec<EnvVar> = config
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();
        let sc = &config.security_context;
        let security_context = KubeSecurityContext {
            run_as_user: sc.run_as_user,
            run_as_group: sc.run_as_group,
            run_as_non_root: sc.run_as_non_root,
            read_only_root_filesystem: sc.read_only_root_filesystem,
            allow_privilege_escalation: sc.allow_privilege_escalation,
            ..Default::default()
        };
        let container = Container {
            name: "sandbox".to_string(),
            image: Some(config.image.clone()),
            command: Some(config.command.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
                // Requests and limits both equal the environment spec.
                requests: Some(quantity_map(&config.resources)),
                limits: Some(quantity_map(&config.resources)),
                ..Default::default()
            }),
            stdin: Some(config.stdin),
            tty: Some(config.tty),
            security_context: Some(security_context),
            ..Default::default()
        };
        let tolerations: Vec<KubeToleration> = config
            .tolerations
            .iter()
            .map(|t| KubeToleration {
                key: t.key.clone(),
                operator: Some(t.operator.clone()),
                value: t.value.clone(),
                effect: t.effect.clone(),
                toleration_seconds: t.toleration_seconds,
            })
            .collect();
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(config.name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(config.labels.clone()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![container],
                restart_policy: Some("Never".to_string()),
                runtime_class_name: config.runtime_class.clone(),
                node_selector: if config.node_selector.is_empty() {
                    None
                } else {
                    Some(config.node_selector.clone())
                },
                tolerations: if tolerations.is_empty() {
                    None
                } else {
                    Some(tolerations)
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        self.pods(namespace)
            .create(&PostParams::default(), &pod)
            .await
            .context("pod create rejected")?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodState>> {
        let pod = self
            .pods(namespace)
            .get_opt(name)
            .await
            .context("failed to look up pod")?;
        Ok(pod.as_ref().map(pod_state))
    }

    async fn delete_pod(&self, namespace: &str, name: &str, force: bool) -> Result<()> {
        let params = if force {
            DeleteParams {
                grace_period_seconds: Some(0),
                ..Default::default()
            }
        } else {
            DeleteParams::default()
        };
        match self.pods(namespace).delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_api_code(&e, 404) => Ok(()),
            Err(e) => Err(e).context("pod delete rejected"),
        }
    }

    async fn wait_for_pod_running(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api = self.pods(namespace);
        tokio::time::timeout(
            timeout,
            await_condition(api, name, conditions::is_pod_running()),
        )
        .await
        .map_err(|_| anyhow!("pod {} did not reach Running within {:?}", name, timeout))?
        .context("watch for pod readiness failed")?;
        Ok(())
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        let mut attached = self
            .pods(namespace)
            .exec(pod, command.to_vec(), &AttachParams::default())
            .await
            .context("exec request rejected")?;
        let mut stdout_reader = attached
            .stdout()
            .ok_or_else(|| anyhow!("exec session has no stdout stream"))?;
        let mut stderr_reader = attached
            .stderr()
            .ok_or_else(|| anyhow!("exec session has no stderr stream"))?;
        let status_fut = attached.take_status();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stdout_limited = (&mut stdout_reader).take(MAX_EXEC_CAPTURE);
        let mut stderr_limited = (&mut stderr_reader).take(MAX_EXEC_CAPTURE);
        let (out, err) = tokio::join!(
            stdout_limited.read_to_end(&mut stdout),
            stderr_limited.read_to_end(&mut stderr),
        );
        out.context("failed to read exec stdout")?;
        err.context("failed to read exec stderr")?;

        let status = match status_fut {
            Some(fut) => fut.await,
            None => None,
        };
        attached.join().await.context("exec session failed")?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code_from_status(status.as_ref()),
        })
    }

    async fn open_exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<ExecSession> {
        let params = AttachParams::default().stdin(true).stdout(true).stderr(true);
        let mut attached = self
            .pods(namespace)
            .exec(pod, command.to_vec(), &params)
            .await
            .context("exec request rejected")?;
        let stdin = attached
            .stdin()
            .map(|w| Box::new(w) as Box<dyn tokio::io::AsyncWrite + Send + Unpin>);
        let stdout = attached
            .stdout()
            .map(|r| Box::new(r) as Box<dyn tokio::io::AsyncRead + Send + Unpin>);
        let stderr = attached
            .stderr()
            .map(|r| Box::new(r) as Box<dyn tokio::io::AsyncRead + Send + Unpin>);
        let status_fut = attached.take_status();
        let status = Box::pin(async move {
            let status = match status_fut {
                Some(fut) => fut.await,
                None => None,
            };
            attached.join().await.ok();
            exit_code_from_status(status.as_ref())
        });
        Ok(ExecSession {
            stdin,
            stdout,
            stderr,
            status,
        })
    }

    async fn get_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        tail: Option<i64>,
        timestamps: bool,
    ) -> Result<String> {
        let params = LogParams {
            tail_lines: tail,
            timestamps,
            ..Default::default()
        };
        self.pods(namespace)
            .logs(pod, &params)
            .await
            .context("log request rejected")
    }

    async fn stream_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        tail: Option<i64>,
        follow: bool,
        timestamps: bool,
    ) -> Result<LogLines> {
        let params = LogParams {
            tail_lines: tail,
            follow,
            timestamps,
            ..Default::default()
        };
        let stream = self
            .pods(namespace)
            .log_stream(pod, &params)
            .await
            .context("log stream rejected")?;
        // log_stream yields a futures AsyncBufRead; go through the compat
        // layer so tokio's line splitter can drive it.
        let reader = tokio::io::BufReader::new(stream.compat());
        let lines = LinesStream::new(tokio::io::AsyncBufReadExt::lines(reader));
        Ok(Box::pin(lines))
    }

    async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<PodState>> {
        let mut params = ListParams::default();
        if let Some(selector) = selector {
            params = params.labels(selector);
        }
        let list = self
            .pods(namespace)
            .list(&params)
            .await
            .context("failed to list pods")?;
        Ok(list.items.iter().map(pod_state).collect())
    }

    async fn get_pod_metrics(&self, namespace: &str, pod: &str) -> Result<PodMetrics> {
        let path = format!(
            "/apis/metrics.k8s.io/v1beta1/namespaces/{}/pods/{}",
            namespace, pod
        );
        let req = http::Request::get(path)
            .body(Vec::new())
            .context("failed to build metrics request")?;
        let metrics: serde_json::Value = self
            .client
            .request(req)
            .await
            .context("pod metrics unavailable")?;
        let mut cpu_millis = 0u64;
        let mut memory_bytes = 0u64;
        if let Some(containers) = metrics["containers"].as_array() {
            for container in containers {
                if let Some(cpu) = container["usage"]["cpu"].as_str() {
                    cpu_millis += parse_cpu_usage_millis(cpu);
                }
                if let Some(memory) = container["usage"]["memory"].as_str() {
                    memory_bytes += parse_bytes(memory).unwrap_or(0);
                }
            }
        }
        Ok(PodMetrics {
            cpu_millis,
            memory_bytes,
        })
    }
}
