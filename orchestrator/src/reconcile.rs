use agentbox_types::{Environment, EnvironmentStatus};

use crate::platform::{MAIN_POD_NAME, Platform, PodPhase};
use crate::registry::Registry;

/// Observed pod phase → environment status. Unknown phases map to None,
/// which leaves the record untouched.
fn map_phase(phase: PodPhase) -> Option<EnvironmentStatus> {
    match phase {
        PodPhase::Pending => Some(EnvironmentStatus::Pending),
        PodPhase::Running => Some(EnvironmentStatus::Running),
        PodPhase::Succeeded => Some(EnvironmentStatus::Terminated),
        PodPhase::Failed => Some(EnvironmentStatus::Failed),
        PodPhase::Unknown => None,
    }
}

/// On-read reconciliation: for a `running` environment, issue one pod
/// lookup and fold the observed phase back into the registry. Lookup
/// failures leave the record unchanged; there is no background poll loop.
pub async fn refresh_status(
    registry: &Registry,
    platform: &dyn Platform,
    env: &Environment,
) -> Environment {
    if env.status != EnvironmentStatus::Running {
        return env.clone();
    }
    let observed = match platform.get_pod(&env.namespace, MAIN_POD_NAME).await {
        Ok(Some(pod)) => map_phase(pod.phase),
        Ok(None) | Err(_) => None,
    };
    let Some(next) = observed else {
        return env.clone();
    };
    if next == env.status {
        return env.clone();
    }
    registry
        .mutate(&env.id, |e| {
            // Only fold observations into records still in `running`; a
            // concurrent delete may have moved the record on already.
            if e.status == EnvironmentStatus::Running {
                e.status = next;
            }
        })
        .unwrap_or_else(|| env.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;
    use std::collections::BTreeMap;

    async fn running_env(platform: &MockPlatform, registry: &Registry) -> Environment {
        let id = agentbox_types::generate_env_id();
        let env = Environment {
            id: id.clone(),
            name: "sandbox".into(),
            namespace: agentbox_types::namespace_name("agentbox-", &id),
            status: EnvironmentStatus::Running,
            created_at: chrono::Utc::now(),
            ..Default::default()
        };
        platform
            .create_namespace(&env.namespace, &BTreeMap::new())
            .await
            .unwrap();
        platform
            .create_pod(
                &env.namespace,
                &crate::platform::PodConfig {
                    name: MAIN_POD_NAME.into(),
                    image: "alpine".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        registry.insert(env.clone()).unwrap();
        env
    }

    #[tokio::test]
    async fn running_pod_keeps_running_status() {
        let platform = MockPlatform::new();
        let registry = Registry::new();
        let env = running_env(&platform, &registry).await;

        let refreshed = refresh_status(&registry, &platform, &env).await;
        assert_eq!(refreshed.status, EnvironmentStatus::Running);
    }

    #[tokio::test]
    async fn succeeded_pod_maps_to_terminated() {
        let platform = MockPlatform::new();
        let registry = Registry::new();
        let env = running_env(&platform, &registry).await;
        platform.set_pod_phase(&env.namespace, MAIN_POD_NAME, PodPhase::Succeeded);

        let refreshed = refresh_status(&registry, &platform, &env).await;
        assert_eq!(refreshed.status, EnvironmentStatus::Terminated);
        assert_eq!(
            registry.get(&env.id).unwrap().status,
            EnvironmentStatus::Terminated
        );
    }

    #[tokio::test]
    async fn failed_pod_maps_to_failed() {
        let platform = MockPlatform::new();
        let registry = Registry::new();
        let env = running_env(&platform, &registry).await;
        platform.set_pod_phase(&env.namespace, MAIN_POD_NAME, PodPhase::Failed);

        let refreshed = refresh_status(&registry, &platform, &env).await;
        assert_eq!(refreshed.status, EnvironmentStatus::Failed);
    }

    #[tokio::test]
    async fn lookup_error_leaves_status_unchanged() {
        let platform = MockPlatform::new();
        let registry = Registry::new();
        let env = running_env(&platform, &registry).await;
        platform.fail_op("get_pod");

        let refreshed = refresh_status(&registry, &platform, &env).await;
        assert_eq!(refreshed.status, EnvironmentStatus::Running);
    }

    #[tokio::test]
    async fn non_running_environment_is_not_touched() {
        let platform = MockPlatform::new();
        let registry = Registry::new();
        let mut env = running_env(&platform, &registry).await;
        env.status = EnvironmentStatus::Pending;
        registry.mutate(&env.id, |e| e.status = EnvironmentStatus::Pending);
        platform.set_pod_phase(&env.namespace, MAIN_POD_NAME, PodPhase::Succeeded);

        let refreshed = refresh_status(&registry, &platform, &env).await;
        assert_eq!(refreshed.status, EnvironmentStatus::Pending);
    }
}
