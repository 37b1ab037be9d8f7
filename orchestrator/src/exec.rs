use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use agentbox_common::wait::backoff_full_jitter;
use agentbox_common::{labels, response};
use agentbox_types::{
    CreateExecutionRequest, Environment, EnvironmentStatus, ExecRequest, ExecResponse, Execution,
    ExecutionStatus, generate_exec_id,
};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use metrics::counter;
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::platform::{MAIN_POD_NAME, Platform, PodConfig, PodPhase};

/// Poll spacing for ephemeral pods: full-jitter backoff between these bounds.
const EXEC_POLL_BASE: Duration = Duration::from_millis(100);
const EXEC_POLL_CAP: Duration = Duration::from_secs(2);

/// Runs commands against environments: synchronous exec into the main pod,
/// and ephemeral one-pod-per-run executions with guaranteed pod cleanup.
///
/// Execution records live in a map parallel to the environment registry and
/// hold only the parent environment's ID.
pub struct ExecutionCoordinator {
    platform: Arc<dyn Platform>,
    executions: RwLock<HashMap<String, Execution>>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
    default_exec_timeout: Duration,
}

impl ExecutionCoordinator {
    pub fn new(platform: Arc<dyn Platform>, default_exec_timeout: Duration) -> Self {
        Self {
            platform,
            executions: RwLock::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            default_exec_timeout,
        }
    }

    /// Synchronous exec in the environment's main pod. Rejects with a
    /// conflict unless the environment is `running`.
    pub async fn exec_in_main_pod(
        &self,
        env: &Environment,
        req: &ExecRequest,
    ) -> Result<ExecResponse, Error> {
        if env.status != EnvironmentStatus::Running {
            return Err(Error::Conflict(format!(
                "environment {} is {}, exec requires running",
                env.id, env.status
            )));
        }
        let timeout = req
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_exec_timeout);
        let command = wrap_with_env(&req.command, &req.env);
        let started = Instant::now();
        let output = tokio::time::timeout(
            timeout,
            self.platform
                .exec_in_pod(&env.namespace, MAIN_POD_NAME, &command),
        )
        .await
        .map_err(|_| Error::platform(anyhow!("exec timed out after {timeout:?}")))?
        .map_err(Error::platform)?;
        counter!("agentbox_execs_total").increment(1);
        Ok(ExecResponse {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Submit an ephemeral execution: a fresh pod in the environment's
    /// namespace runs the command, the pod is deleted on every exit path.
    pub fn submit(
        self: &Arc<Self>,
        env: &Environment,
        principal_id: &str,
        req: CreateExecutionRequest,
    ) -> Execution {
        let id = generate_exec_id();
        let execution = Execution {
            id: id.clone(),
            environment_id: env.id.clone(),
            principal_id: principal_id.to_string(),
            command: req.command.clone(),
            env: req.env.clone(),
            status: ExecutionStatus::Pending,
            pod_name: Some(format!("{id}-pod")),
            created_at: Utc::now(),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        self.executions
            .write()
            .expect("execution lock poisoned")
            .insert(id.clone(), execution.clone());
        self.cancels
            .lock()
            .expect("cancel lock poisoned")
            .insert(id.clone(), cancel.clone());

        let coordinator = self.clone();
        let namespace = env.namespace.clone();
        let image = env.image.clone();
        tokio::spawn(async move {
            coordinator
                .run_execution(namespace, image, id, cancel)
                .await;
        });
        execution
    }

    async fn run_execution(
        self: Arc<Self>,
        namespace: String,
        image: String,
        exec_id: String,
        cancel: CancellationToken,
    ) {
        let Some(execution) = self.get(&exec_id) else {
            return;
        };
        let pod_name = execution.pod_name.clone().unwrap_or_default();
        let started = Instant::now();
        self.update(&exec_id, |e| e.status = ExecutionStatus::Running);

        let work = self.drive_pod(&namespace, &image, &pod_name, &execution);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Outcome::Canceled,
            result = work => match result {
                Ok((exit_code, logs)) => Outcome::Completed { exit_code, logs },
                Err(e) => Outcome::Failed(e),
            },
        };

        // Cleanup runs on every path out of the workflow; this is what
        // guarantees no leaked pods.
        if let Err(e) = self.platform.delete_pod(&namespace, &pod_name, true).await {
            response::print_warning(
                e.context(format!("failed to delete ephemeral pod {pod_name}")),
            );
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.update(&exec_id, |e| {
            if e.status.is_terminal() {
                return;
            }
            e.duration_ms = Some(duration_ms);
            match &outcome {
                Outcome::Completed { exit_code, logs } => {
                    e.status = if *exit_code == 0 {
                        ExecutionStatus::Completed
                    } else {
                        ExecutionStatus::Failed
                    };
                    e.exit_code = Some(*exit_code);
                    e.stdout = Some(logs.clone());
                }
                Outcome::Failed(err) => {
                    e.status = ExecutionStatus::Failed;
                    e.error = Some(format!("{err:#}"));
                }
                Outcome::Canceled => {
                    e.status = ExecutionStatus::Canceled;
                }
            }
        });
        counter!("agentbox_ephemeral_executions_total").increment(1);
        self.cancels
            .lock()
            .expect("cancel lock poisoned")
            .remove(&exec_id);
        println!(
            "{}{}{}{}",
            "🏁 Execution finished • id=".cyan(),
            exec_id.cyan().dimmed(),
            " • status=".cyan(),
            self.get(&exec_id)
                .map(|e| e.status.to_string())
                .unwrap_or_default()
                .cyan()
                .dimmed(),
        );
    }

    /// Create the pod, wait for it to reach a terminal phase, and capture
    /// its logs as stdout.
    async fn drive_pod(
        &self,
        namespace: &str,
        image: &str,
        pod_name: &str,
        execution: &Execution,
    ) -> Result<(i32, String)> {
        let config = PodConfig {
            name: pod_name.to_string(),
            image: image.to_string(),
            command: execution.command.clone(),
            env: execution
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            labels: [
                (labels::APP.to_string(), labels::APP_VALUE.to_string()),
                (labels::EXEC_ID.to_string(), execution.id.clone()),
                (
                    labels::MANAGED_BY.to_string(),
                    labels::MANAGED_BY_VALUE.to_string(),
                ),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        self.platform
            .create_pod(namespace, &config)
            .await
            .context("failed to create execution pod")?;

        let mut attempt = 0;
        let exit_code = loop {
            match self
                .platform
                .get_pod(namespace, pod_name)
                .await
                .context("failed to poll execution pod")?
            {
                Some(pod) => match pod.phase {
                    PodPhase::Succeeded => break pod.exit_code.unwrap_or(0),
                    PodPhase::Failed => break pod.exit_code.unwrap_or(1),
                    _ => {}
                },
                None => anyhow::bail!("execution pod disappeared before completion"),
            }
            tokio::time::sleep(backoff_full_jitter(EXEC_POLL_BASE, EXEC_POLL_CAP, attempt)).await;
            attempt += 1;
        };

        let logs = self
            .platform
            .get_pod_logs(namespace, pod_name, None, false)
            .await
            .unwrap_or_default();
        Ok((exit_code, logs))
    }

    /// Cancel a pending/running execution. The workflow observes the token
    /// at its next poll; a cancel racing completion loses benignly and the
    /// terminal status stays `completed`.
    pub fn cancel(&self, exec_id: &str) -> Option<Execution> {
        let execution = self.get(exec_id)?;
        if let Some(token) = self
            .cancels
            .lock()
            .expect("cancel lock poisoned")
            .get(exec_id)
        {
            token.cancel();
        }
        Some(execution)
    }

    pub fn get(&self, exec_id: &str) -> Option<Execution> {
        self.executions
            .read()
            .expect("execution lock poisoned")
            .get(exec_id)
            .cloned()
    }

    /// Executions for one environment, oldest first.
    pub fn list_for_environment(&self, env_id: &str) -> Vec<Execution> {
        let mut list: Vec<Execution> = self
            .executions
            .read()
            .expect("execution lock poisoned")
            .values()
            .filter(|e| e.environment_id == env_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }

    /// Drop all executions belonging to a deleted environment, cancelling
    /// any that are still in flight.
    pub fn remove_for_environment(&self, env_id: &str) {
        let ids: Vec<String> = {
            let executions = self.executions.read().expect("execution lock poisoned");
            executions
                .values()
                .filter(|e| e.environment_id == env_id)
                .map(|e| e.id.clone())
                .collect()
        };
        let mut cancels = self.cancels.lock().expect("cancel lock poisoned");
        let mut executions = self.executions.write().expect("execution lock poisoned");
        for id in ids {
            if let Some(token) = cancels.remove(&id) {
                token.cancel();
            }
            executions.remove(&id);
        }
    }

    fn update<F>(&self, exec_id: &str, f: F)
    where
        F: FnOnce(&mut Execution),
    {
        let mut executions = self.executions.write().expect("execution lock poisoned");
        if let Some(execution) = executions.get_mut(exec_id) {
            f(execution);
        }
    }
}

enum Outcome {
    Completed { exit_code: i32, logs: String },
    Failed(anyhow::Error),
    Canceled,
}

/// Apply the env-var overlay by prefixing the command with `env K=V …`.
fn wrap_with_env(command: &[String], env: &HashMap<String, String>) -> Vec<String> {
    if env.is_empty() {
        return command.to_vec();
    }
    let mut wrapped = Vec::with_capacity(command.len() + env.len() + 1);
    wrapped.push("env".to_string());
    let mut pairs: Vec<_> = env.iter().collect();
    pairs.sort();
    for (k, v) in pairs {
        wrapped.push(format!("{k}={v}"));
    }
    wrapped.extend(command.iter().cloned());
    wrapped
}
