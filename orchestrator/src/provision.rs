use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use agentbox_common::{labels, response};
use agentbox_types::{Environment, EnvironmentStatus};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use metrics::counter;
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use crate::exec::ExecutionCoordinator;
use crate::platform::{MAIN_POD_NAME, Platform, PodConfig};
use crate::registry::Registry;

pub const QUOTA_NAME: &str = "agentbox-quota";
pub const POLICY_NAME: &str = "agentbox-isolation";

/// Drives the asynchronous create/teardown workflows. Each environment gets
/// its own background task; terminal state is written back to the registry
/// by ID.
pub struct Provisioner {
    platform: Arc<dyn Platform>,
    registry: Arc<Registry>,
    coordinator: Arc<ExecutionCoordinator>,
    startup_timeout: Duration,
    cancel: CancellationToken,
}

impl Provisioner {
    pub fn new(
        platform: Arc<dyn Platform>,
        registry: Arc<Registry>,
        coordinator: Arc<ExecutionCoordinator>,
        startup_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            platform,
            registry,
            coordinator,
            startup_timeout,
            cancel,
        }
    }

    /// Fire-and-forget provisioning of a freshly inserted record.
    pub fn spawn(&self, env: Environment) {
        let platform = self.platform.clone();
        let registry = self.registry.clone();
        let startup_timeout = self.startup_timeout;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            run_provision(platform, registry, env, startup_timeout, cancel).await;
        });
    }

    /// Fire-and-forget teardown: mark the record `terminating`, delete the
    /// namespace (which cascades to everything inside it), then drop the
    /// record and its executions.
    pub fn spawn_teardown(&self, env_id: &str, force: bool) {
        let platform = self.platform.clone();
        let registry = self.registry.clone();
        let coordinator = self.coordinator.clone();
        let env_id = env_id.to_string();
        tokio::spawn(async move {
            run_teardown(platform, registry, coordinator, env_id, force).await;
        });
    }
}

async fn run_provision(
    platform: Arc<dyn Platform>,
    registry: Arc<Registry>,
    env: Environment,
    startup_timeout: Duration,
    cancel: CancellationToken,
) {
    println!(
        "{}{}",
        "⚙️ Provisioning environment • id=".green(),
        env.id.green().dimmed()
    );
    match provision_steps(platform.as_ref(), &env, startup_timeout, &cancel).await {
        Ok(()) => {
            counter!("agentbox_environments_provisioned_total").increment(1);
            registry.mutate(&env.id, |e| {
                // A concurrent delete wins; only promote records still pending.
                if e.status == EnvironmentStatus::Pending {
                    e.status = EnvironmentStatus::Running;
                    e.started_at = Some(Utc::now());
                }
            });
            println!(
                "{}{}",
                "🚀 Environment ready • id=".green(),
                env.id.green().dimmed()
            );
        }
        Err(e) => {
            counter!("agentbox_environment_provision_failures_total").increment(1);
            response::print_error(e);
            registry.mutate(&env.id, |e| {
                if !matches!(
                    e.status,
                    EnvironmentStatus::Terminating | EnvironmentStatus::Terminated
                ) {
                    e.status = EnvironmentStatus::Failed;
                }
            });
        }
    }
}

/// The ordered provisioning workflow. Every step wraps its platform error
/// with the step name so operators can see exactly where it died. There is
/// no partial rollback; the namespace is left behind for the next delete.
async fn provision_steps(
    platform: &dyn Platform,
    env: &Environment,
    startup_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    platform
        .create_namespace(&env.namespace, &namespace_labels(env))
        .await
        .context("failed to create namespace")?;

    platform
        .create_resource_quota(&env.namespace, QUOTA_NAME, &env.resources)
        .await
        .context("failed to create resource quota")?;

    platform
        .create_network_policy(&env.namespace, POLICY_NAME, &env.isolation.network)
        .await
        .context("failed to create network policy")?;

    platform
        .create_pod(&env.namespace, &main_pod_config(env))
        .await
        .context("failed to create main pod")?;

    tokio::select! {
        _ = cancel.cancelled() => bail!("shutdown while waiting for main pod"),
        res = platform.wait_for_pod_running(&env.namespace, MAIN_POD_NAME, startup_timeout) => {
            res.context("failed waiting for main pod to become ready")?;
        }
    }

    Ok(())
}

async fn run_teardown(
    platform: Arc<dyn Platform>,
    registry: Arc<Registry>,
    coordinator: Arc<ExecutionCoordinator>,
    env_id: String,
    force: bool,
) {
    let Some(env) = registry.mutate(&env_id, |e| e.status = EnvironmentStatus::Terminating) else {
        return;
    };
    println!(
        "{}{}",
        "🗑️ Deleting environment • id=".yellow(),
        env.id.yellow().dimmed()
    );
    let result = async {
        // A provision attempt that died before step one leaves nothing on
        // the platform; skip straight to dropping the record.
        if !platform
            .namespace_exists(&env.namespace)
            .await
            .context("failed to check namespace before deletion")?
        {
            return Ok(());
        }
        if force {
            // Skip grace periods on the pods before the namespace cascade.
            if let Ok(pods) = platform.list_pods(&env.namespace, None).await {
                for pod in pods {
                    let _ = platform.delete_pod(&env.namespace, &pod.name, true).await;
                }
            }
        }
        platform.delete_namespace(&env.namespace).await
    }
    .await;
    match result {
        Ok(()) => {
            registry.mutate(&env_id, |e| e.status = EnvironmentStatus::Terminated);
            coordinator.remove_for_environment(&env_id);
            registry.remove(&env_id);
            counter!("agentbox_environments_deleted_total").increment(1);
            println!(
                "{}{}",
                "✅ Environment deleted • id=".green(),
                env_id.green().dimmed()
            );
        }
        Err(e) => {
            response::print_error(e.context(format!(
                "failed to delete namespace for environment {env_id}"
            )));
            registry.mutate(&env_id, |e| e.status = EnvironmentStatus::Failed);
        }
    }
}

fn namespace_labels(env: &Environment) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = env
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    map.insert(labels::APP.into(), labels::APP_VALUE.into());
    map.insert(labels::ENV_ID.into(), env.id.clone());
    map.insert(labels::MANAGED_BY.into(), labels::MANAGED_BY_VALUE.into());
    map
}

/// Container spec for the long-running main pod. The command falls back to
/// an idle shell so the pod stays up for exec and attach.
pub fn main_pod_config(env: &Environment) -> PodConfig {
    let command = env.command.clone().unwrap_or_else(|| {
        vec!["sh".into(), "-c".into(), "sleep infinity".into()]
    });
    PodConfig {
        name: MAIN_POD_NAME.to_string(),
        image: env.image.clone(),
        command,
        env: env.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        labels: namespace_labels(env),
        resources: env.resources.clone(),
        runtime_class: env.isolation.runtime_class.clone(),
        security_context: env.isolation.security_context.clone(),
        node_selector: env
            .node_selector
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        tolerations: env.tolerations.clone(),
        stdin: true,
        tty: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;
    use agentbox_types::ResourceSpec;
    use std::collections::HashMap;

    fn test_env() -> Environment {
        let id = agentbox_types::generate_env_id();
        Environment {
            id: id.clone(),
            name: "sandbox".into(),
            image: "alpine:latest".into(),
            namespace: agentbox_types::namespace_name("agentbox-", &id),
            resources: ResourceSpec {
                cpu: "100m".into(),
                memory: "128Mi".into(),
                storage: "500Mi".into(),
            },
            labels: HashMap::from([("team".to_string(), "a".to_string())]),
            created_at: Utc::now(),
            timeout_seconds: 3600,
            ..Default::default()
        }
    }

    fn harness(platform: Arc<MockPlatform>) -> (Provisioner, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let coordinator = Arc::new(ExecutionCoordinator::new(
            platform.clone(),
            Duration::from_secs(30),
        ));
        let provisioner = Provisioner::new(
            platform,
            registry.clone(),
            coordinator,
            Duration::from_secs(2),
            CancellationToken::new(),
        );
        (provisioner, registry)
    }

    async fn wait_for_status(
        registry: &Registry,
        id: &str,
        expected: EnvironmentStatus,
    ) -> Environment {
        for _ in 0..200 {
            if let Some(env) = registry.get(id)
                && env.status == expected
            {
                return env;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("environment {id} never reached {expected}");
    }

    #[tokio::test]
    async fn successful_provision_reaches_running_with_started_at() {
        let platform = Arc::new(MockPlatform::new());
        let (provisioner, registry) = harness(platform.clone());
        let env = test_env();
        let id = env.id.clone();
        registry.insert(env.clone()).unwrap();

        provisioner.spawn(env.clone());
        let ready = wait_for_status(&registry, &id, EnvironmentStatus::Running).await;

        assert!(ready.started_at.is_some());
        assert!(platform.has_namespace(&env.namespace));
        assert!(platform.has_pod(&env.namespace, MAIN_POD_NAME));
        assert_eq!(platform.quota_count(&env.namespace), 1);
        assert_eq!(platform.policies(&env.namespace).len(), 1);

        let ns_labels = platform.namespace_labels(&env.namespace);
        assert_eq!(ns_labels.get(labels::APP).unwrap(), labels::APP_VALUE);
        assert_eq!(ns_labels.get(labels::ENV_ID).unwrap(), &id);
        assert_eq!(ns_labels.get("team").unwrap(), "a");
    }

    #[tokio::test]
    async fn provisioning_is_idempotent_on_existing_namespace() {
        let platform = Arc::new(MockPlatform::new());
        let (provisioner, registry) = harness(platform.clone());
        let env = test_env();
        let id = env.id.clone();

        // Namespace left behind by an earlier failed attempt.
        platform
            .create_namespace(&env.namespace, &BTreeMap::new())
            .await
            .unwrap();

        registry.insert(env.clone()).unwrap();
        provisioner.spawn(env);
        wait_for_status(&registry, &id, EnvironmentStatus::Running).await;
    }

    #[tokio::test]
    async fn failure_at_any_step_marks_failed_without_rollback() {
        for failing_op in [
            "create_namespace",
            "create_resource_quota",
            "create_network_policy",
            "create_pod",
            "wait_for_pod_running",
        ] {
            let platform = Arc::new(MockPlatform::new());
            platform.fail_op(failing_op);
            let (provisioner, registry) = harness(platform.clone());
            let env = test_env();
            let id = env.id.clone();
            registry.insert(env.clone()).unwrap();

            provisioner.spawn(env.clone());
            wait_for_status(&registry, &id, EnvironmentStatus::Failed).await;

            // No rollback: whatever was created before the failure stays.
            if failing_op != "create_namespace" {
                assert!(
                    platform.has_namespace(&env.namespace),
                    "step {failing_op} should leave the namespace behind"
                );
            }
        }
    }

    #[tokio::test]
    async fn startup_timeout_marks_failed() {
        let platform = Arc::new(MockPlatform::new());
        platform.set_created_pod_phase(crate::platform::PodPhase::Pending);
        let (provisioner, registry) = harness(platform.clone());
        let env = test_env();
        let id = env.id.clone();
        registry.insert(env.clone()).unwrap();

        provisioner.spawn(env);
        wait_for_status(&registry, &id, EnvironmentStatus::Failed).await;
    }

    #[tokio::test]
    async fn teardown_removes_namespace_and_record() {
        let platform = Arc::new(MockPlatform::new());
        let (provisioner, registry) = harness(platform.clone());
        let env = test_env();
        let id = env.id.clone();
        registry.insert(env.clone()).unwrap();
        provisioner.spawn(env.clone());
        wait_for_status(&registry, &id, EnvironmentStatus::Running).await;

        provisioner.spawn_teardown(&id, false);
        for _ in 0..200 {
            if registry.get(&id).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(registry.get(&id).is_none());
        assert!(!platform.has_namespace(&env.namespace));
    }

    #[tokio::test]
    async fn teardown_without_namespace_still_removes_record() {
        let platform = Arc::new(MockPlatform::new());
        // The namespace was never created; the delete path must not be hit.
        platform.fail_op("delete_namespace");
        let (provisioner, registry) = harness(platform.clone());
        let env = test_env();
        let id = env.id.clone();
        registry.insert(env).unwrap();

        provisioner.spawn_teardown(&id, false);
        for _ in 0..200 {
            if registry.get(&id).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("record for {id} survived teardown");
    }

    #[test]
    fn main_pod_defaults_to_idle_shell() {
        let mut env = test_env();
        env.command = None;
        let config = main_pod_config(&env);
        assert_eq!(config.command, vec!["sh", "-c", "sleep infinity"]);
        assert!(config.stdin);
        assert!(config.tty);

        env.command = Some(vec!["python".into(), "-m".into(), "http.server".into()]);
        assert_eq!(main_pod_config(&env).command[0], "python");
    }
}
