use agentbox_common::{Pagination, response};
use agentbox_types::{
    CreateEnvironmentRequest, CreateExecutionRequest, EnvAction, Environment, EnvironmentStatus,
    EnvironmentUsage, ExecRequest, HealthResponse, ListEnvironmentsResponse,
    ListExecutionsResponse, LogEntry, LogsResponse, Role, generate_env_id, namespace_name,
};
use anyhow::anyhow;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use tokio_stream::StreamExt;

use crate::attach;
use crate::auth::CallerPrincipal;
use crate::error::Error;
use crate::platform::MAIN_POD_NAME;
use crate::reconcile;
use crate::registry::ListFilter;
use crate::server::AppState;

/// `Json` wrapper that renders extraction failures (malformed body, body
/// over the route's size cap) as 400 with the standard error envelope.
pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(response::bad_request(anyhow!(rejection.body_text()))),
        }
    }
}

/// GET /api/v1/health — platform connectivity plus a capacity snapshot.
/// The only route that skips authentication.
pub async fn health(State(state): State<AppState>) -> Result<Response, Error> {
    state
        .platform
        .health_check()
        .await
        .map_err(Error::platform)?;
    let version = state
        .platform
        .server_version()
        .await
        .map_err(Error::platform)?;
    let capacity = state
        .platform
        .cluster_capacity()
        .await
        .map_err(Error::platform)?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version,
        capacity,
    })
    .into_response())
}

/// POST /api/v1/environments — insert the record and kick off async
/// provisioning; the response carries the `pending` record.
pub async fn create_environment(
    State(state): State<AppState>,
    CallerPrincipal(principal): CallerPrincipal,
    AppJson(req): AppJson<CreateEnvironmentRequest>,
) -> Result<Response, Error> {
    state.validator.validate_create(&req)?;

    let id = generate_env_id();
    let config = &state.config;
    let mut isolation = req.isolation.unwrap_or_default();
    if isolation.runtime_class.is_none() {
        isolation.runtime_class = config.default_runtime_class.clone();
    }
    let env = Environment {
        id: id.clone(),
        name: req.name,
        image: req.image,
        resources: req.resources.unwrap_or_else(|| config.default_resources.clone()),
        env: req.env,
        command: req.command,
        labels: req.labels,
        node_selector: req.node_selector,
        tolerations: req.tolerations,
        isolation,
        pool: req.pool.unwrap_or_default(),
        owner_id: principal.id.clone(),
        created_at: Utc::now(),
        started_at: None,
        namespace: namespace_name(&config.namespace_prefix, &id),
        endpoint_url: None,
        timeout_seconds: req
            .timeout_seconds
            .unwrap_or(config.default_timeout_seconds),
        status: EnvironmentStatus::Pending,
    };

    state
        .registry
        .insert(env.clone())
        .map_err(|_| Error::Conflict(format!("environment {id} already exists")))?;
    state.provisioner.spawn(env.clone());

    Ok((StatusCode::CREATED, Json(env)).into_response())
}

#[derive(Deserialize, Default, Debug)]
pub struct ListEnvironmentsQuery {
    pub status: Option<String>,
    pub label: Option<String>,

    #[serde(flatten)]
    pub page: Pagination,
}

/// GET /api/v1/environments — status, label-selector and pagination
/// filters, scoped to environments the caller may read.
pub async fn list_environments(
    State(state): State<AppState>,
    CallerPrincipal(principal): CallerPrincipal,
    Query(query): Query<ListEnvironmentsQuery>,
) -> Result<Response, Error> {
    let limit = query.page.limit();
    let offset = query.page.offset();

    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(raw.parse::<EnvironmentStatus>().map_err(|_| {
            Error::Validation(format!("unknown status filter {raw:?}"))
        })?),
    };
    let selector = match query.label.as_deref() {
        None => None,
        Some(raw) => match raw.parse() {
            Ok(selector) => Some(selector),
            // An unparseable selector matches nothing; clients find out via
            // the empty response rather than an error.
            Err(_) => {
                return Ok(Json(ListEnvironmentsResponse {
                    environments: Vec::new(),
                    total: 0,
                    limit,
                    offset,
                })
                .into_response());
            }
        },
    };

    let filter = ListFilter {
        status,
        selector,
        // Pagination is applied after the visibility cut below.
        limit: usize::MAX,
        offset: 0,
    };
    let (matched, _) = state.registry.list(&filter);
    let visible: Vec<Environment> = matched
        .into_iter()
        .filter(|env| {
            principal.role == Role::SuperAdmin || principal.allows(env, EnvAction::Read)
        })
        .collect();
    let total = visible.len();
    let environments: Vec<Environment> =
        visible.into_iter().skip(offset).take(limit).collect();

    Ok(Json(ListEnvironmentsResponse {
        environments,
        total,
        limit,
        offset,
    })
    .into_response())
}

fn load_environment(state: &AppState, id: &str) -> Result<Environment, Error> {
    state
        .registry
        .get(id)
        .ok_or_else(|| Error::NotFound(format!("environment {id} not found")))
}

fn authorize(
    principal: &agentbox_types::Principal,
    env: &Environment,
    action: EnvAction,
) -> Result<(), Error> {
    if principal.allows(env, action) {
        Ok(())
    } else {
        Err(Error::Forbidden(format!(
            "principal {} may not {:?} environment {}",
            principal.id, action, env.id
        )))
    }
}

/// GET /api/v1/environments/{id} — snapshot with on-read status refresh.
pub async fn get_environment(
    State(state): State<AppState>,
    CallerPrincipal(principal): CallerPrincipal,
    Path(id): Path<String>,
) -> Result<Response, Error> {
    let env = load_environment(&state, &id)?;
    authorize(&principal, &env, EnvAction::Read)?;
    let refreshed =
        reconcile::refresh_status(&state.registry, state.platform.as_ref(), &env).await;
    Ok(Json(refreshed).into_response())
}

#[derive(Deserialize, Default, Debug)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: bool,
}

/// DELETE /api/v1/environments/{id} — marks the record `terminating` and
/// tears the namespace down in the background. A Get racing the teardown
/// may observe `terminating`; the next one sees 404.
pub async fn delete_environment(
    State(state): State<AppState>,
    CallerPrincipal(principal): CallerPrincipal,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Response, Error> {
    let env = load_environment(&state, &id)?;
    authorize(&principal, &env, EnvAction::Delete)?;
    state.provisioner.spawn_teardown(&id, query.force);
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// POST /api/v1/environments/{id}/exec — synchronous command in the main
/// pod of a running environment.
pub async fn exec_command(
    State(state): State<AppState>,
    CallerPrincipal(principal): CallerPrincipal,
    Path(id): Path<String>,
    AppJson(req): AppJson<ExecRequest>,
) -> Result<Response, Error> {
    let env = load_environment(&state, &id)?;
    authorize(&principal, &env, EnvAction::Exec)?;
    state.validator.validate_exec(&req)?;
    let result = state.coordinator.exec_in_main_pod(&env, &req).await?;
    Ok(Json(result).into_response())
}

#[derive(Deserialize, Default, Debug)]
pub struct LogsQuery {
    pub tail: Option<i64>,

    #[serde(default)]
    pub follow: bool,

    #[serde(default)]
    pub timestamps: bool,
}

fn parse_log_line(line: &str, timestamps: bool) -> LogEntry {
    if timestamps
        && let Some((ts, message)) = line.split_once(' ')
    {
        return LogEntry {
            timestamp: Some(ts.to_string()),
            stream: "stdout".to_string(),
            message: message.to_string(),
        };
    }
    LogEntry {
        timestamp: None,
        stream: "stdout".to_string(),
        message: line.to_string(),
    }
}

/// GET /api/v1/environments/{id}/logs — buffered JSON by default, SSE when
/// `follow=true` (one `data:` event per line, closing on disconnect).
pub async fn get_logs(
    State(state): State<AppState>,
    CallerPrincipal(principal): CallerPrincipal,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, Error> {
    let env = load_environment(&state, &id)?;
    authorize(&principal, &env, EnvAction::Read)?;

    if !query.follow {
        let raw = state
            .platform
            .get_pod_logs(&env.namespace, MAIN_POD_NAME, query.tail, query.timestamps)
            .await
            .map_err(Error::platform)?;
        let lines = raw
            .lines()
            .map(|line| parse_log_line(line, query.timestamps))
            .collect();
        return Ok(Json(LogsResponse { lines }).into_response());
    }

    let mut stream = state
        .platform
        .stream_pod_logs(
            &env.namespace,
            MAIN_POD_NAME,
            query.tail,
            true,
            query.timestamps,
        )
        .await
        .map_err(Error::platform)?;
    let timestamps = query.timestamps;
    let events = async_stream::stream! {
        while let Some(line) = stream.next().await {
            match line {
                Ok(line) => {
                    let entry = parse_log_line(&line, timestamps);
                    let data = serde_json::to_string(&entry).expect("log entries serialise");
                    yield Ok::<Event, std::convert::Infallible>(Event::default().data(data));
                }
                Err(e) => {
                    tracing::debug!("log stream ended: {}", e);
                    break;
                }
            }
        }
    };
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// GET /api/v1/environments/{id}/metrics — live resource usage of the main
/// pod, straight from the platform's metrics pipeline.
pub async fn get_environment_metrics(
    State(state): State<AppState>,
    CallerPrincipal(principal): CallerPrincipal,
    Path(id): Path<String>,
) -> Result<Response, Error> {
    let env = load_environment(&state, &id)?;
    authorize(&principal, &env, EnvAction::Read)?;
    if env.status != EnvironmentStatus::Running {
        return Err(Error::Conflict(format!(
            "environment {} is {}, metrics require running",
            env.id, env.status
        )));
    }
    let usage = state
        .platform
        .get_pod_metrics(&env.namespace, MAIN_POD_NAME)
        .await
        .map_err(Error::platform)?;
    Ok(Json(EnvironmentUsage {
        cpu_millis: usage.cpu_millis,
        memory_bytes: usage.memory_bytes,
    })
    .into_response())
}

fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        // Non-browser clients send no Origin; the bearer token gates them.
        None => true,
        Some(origin) => allowed.iter().any(|a| a == origin),
    }
}

/// GET /api/v1/environments/{id}/attach — upgrade to a full-duplex
/// WebSocket bridged onto an interactive shell in the main pod.
pub async fn attach_environment(
    State(state): State<AppState>,
    CallerPrincipal(principal): CallerPrincipal,
    Path(id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, Error> {
    let env = load_environment(&state, &id)?;
    authorize(&principal, &env, EnvAction::Exec)?;
    if !origin_allowed(&headers, &state.config.allowed_origins) {
        return Err(Error::Forbidden("origin not allowed".to_string()));
    }
    if env.status != EnvironmentStatus::Running {
        return Err(Error::Conflict(format!(
            "environment {} is {}, attach requires running",
            env.id, env.status
        )));
    }
    let command = vec!["/bin/sh".to_string()];
    let session = state
        .platform
        .open_exec(&env.namespace, MAIN_POD_NAME, &command)
        .await
        .map_err(Error::platform)?;
    Ok(ws
        .write_buffer_size(4 * 1024)
        .on_upgrade(move |socket| attach::serve(socket, session)))
}

/// POST /api/v1/environments/{id}/executions — submit an ephemeral
/// execution; returns the `pending` record immediately.
pub async fn create_execution(
    State(state): State<AppState>,
    CallerPrincipal(principal): CallerPrincipal,
    Path(id): Path<String>,
    AppJson(req): AppJson<CreateExecutionRequest>,
) -> Result<Response, Error> {
    let env = load_environment(&state, &id)?;
    authorize(&principal, &env, EnvAction::Exec)?;
    if req.command.is_empty() {
        return Err(Error::Validation("command must not be empty".into()));
    }
    if env.status != EnvironmentStatus::Running {
        return Err(Error::Conflict(format!(
            "environment {} is {}, executions require running",
            env.id, env.status
        )));
    }
    let execution = state.coordinator.submit(&env, &principal.id, req);
    Ok((StatusCode::CREATED, Json(execution)).into_response())
}

/// GET /api/v1/environments/{id}/executions
pub async fn list_executions(
    State(state): State<AppState>,
    CallerPrincipal(principal): CallerPrincipal,
    Path(id): Path<String>,
) -> Result<Response, Error> {
    let env = load_environment(&state, &id)?;
    authorize(&principal, &env, EnvAction::Read)?;
    let executions = state.coordinator.list_for_environment(&id);
    let total = executions.len();
    Ok(Json(ListExecutionsResponse { executions, total }).into_response())
}

fn authorize_execution(
    state: &AppState,
    principal: &agentbox_types::Principal,
    execution: &agentbox_types::Execution,
    action: EnvAction,
) -> Result<(), Error> {
    // The parent environment may already be gone; fall back to submitter
    // or super-admin in that case.
    match state.registry.get(&execution.environment_id) {
        Some(env) => authorize(principal, &env, action),
        None => {
            if principal.role == Role::SuperAdmin || principal.id == execution.principal_id {
                Ok(())
            } else {
                Err(Error::Forbidden(format!(
                    "principal {} may not access execution {}",
                    principal.id, execution.id
                )))
            }
        }
    }
}

/// GET /api/v1/executions/{id}
pub async fn get_execution(
    State(state): State<AppState>,
    CallerPrincipal(principal): CallerPrincipal,
    Path(id): Path<String>,
) -> Result<Response, Error> {
    let execution = state
        .coordinator
        .get(&id)
        .ok_or_else(|| Error::NotFound(format!("execution {id} not found")))?;
    authorize_execution(&state, &principal, &execution, EnvAction::Read)?;
    Ok(Json(execution).into_response())
}

/// DELETE /api/v1/executions/{id} — request cancellation; the workflow
/// observes it at its next poll, so the response may still show a
/// non-terminal status.
pub async fn cancel_execution(
    State(state): State<AppState>,
    CallerPrincipal(principal): CallerPrincipal,
    Path(id): Path<String>,
) -> Result<Response, Error> {
    let execution = state
        .coordinator
        .get(&id)
        .ok_or_else(|| Error::NotFound(format!("execution {id} not found")))?;
    authorize_execution(&state, &principal, &execution, EnvAction::Exec)?;
    let execution = state
        .coordinator
        .cancel(&id)
        .ok_or_else(|| Error::NotFound(format!("execution {id} not found")))?;
    Ok((StatusCode::ACCEPTED, Json(execution)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_lines_split_timestamps() {
        let entry = parse_log_line("2026-01-02T03:04:05Z hello world", true);
        assert_eq!(entry.timestamp.as_deref(), Some("2026-01-02T03:04:05Z"));
        assert_eq!(entry.message, "hello world");

        let entry = parse_log_line("hello world", false);
        assert!(entry.timestamp.is_none());
        assert_eq!(entry.message, "hello world");
        assert_eq!(entry.stream, "stdout");
    }

    #[test]
    fn origin_allowlist() {
        let allowed = vec!["https://app.example.com".to_string()];
        let mut headers = HeaderMap::new();
        assert!(origin_allowed(&headers, &allowed));

        headers.insert(header::ORIGIN, "https://app.example.com".parse().unwrap());
        assert!(origin_allowed(&headers, &allowed));

        headers.insert(header::ORIGIN, "https://evil.example.com".parse().unwrap());
        assert!(!origin_allowed(&headers, &allowed));

        assert!(origin_allowed(&headers, &[]));
    }
}
