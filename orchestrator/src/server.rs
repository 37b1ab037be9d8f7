use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use agentbox_common::metrics::MetricsLayer;
use agentbox_common::shutdown::shutdown_signal;
use agentbox_common::{access_log, cors, middleware as request_context};
use agentbox_types::ResourceSpec;
use anyhow::{Context, Result};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use owo_colors::OwoColorize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::args::ServerArgs;
use crate::auth::{self, ApiKeyAuth, AuthService};
use crate::exec::ExecutionCoordinator;
use crate::handlers;
use crate::platform::Platform;
use crate::platform::kube::KubePlatform;
use crate::provision::Provisioner;
use crate::registry::Registry;
use crate::validate::{Validator, parse_bytes, parse_cpu_millis};

/// Create-environment bodies are capped at 1 MiB, exec bodies at 64 KiB.
const CREATE_BODY_LIMIT: usize = 1 << 20;
const EXEC_BODY_LIMIT: usize = 64 << 10;

/// Boot-time configuration shared by the handlers.
pub struct ServerConfig {
    pub namespace_prefix: String,
    pub default_runtime_class: Option<String>,
    pub default_resources: ResourceSpec,
    pub default_timeout_seconds: u64,
    pub allowed_origins: Vec<String>,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub platform: Arc<dyn Platform>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub provisioner: Arc<Provisioner>,
    pub auth: Arc<dyn AuthService>,
    pub validator: Arc<Validator>,
    pub config: Arc<ServerConfig>,
}

pub fn build_state(
    platform: Arc<dyn Platform>,
    auth: Arc<dyn AuthService>,
    config: ServerConfig,
    validator: Validator,
    startup_timeout: Duration,
    default_exec_timeout: Duration,
    cancel: CancellationToken,
) -> AppState {
    let registry = Arc::new(Registry::new());
    let coordinator = Arc::new(ExecutionCoordinator::new(
        platform.clone(),
        default_exec_timeout,
    ));
    let provisioner = Arc::new(Provisioner::new(
        platform.clone(),
        registry.clone(),
        coordinator.clone(),
        startup_timeout,
        cancel,
    ));
    AppState {
        registry,
        platform,
        coordinator,
        provisioner,
        auth,
        validator: Arc::new(validator),
        config: Arc::new(config),
    }
}

pub fn router(state: AppState) -> Router {
    let health = Router::new()
        .route("/api/v1/health", get(handlers::health))
        .with_state(state.clone());
    let api = Router::new()
        .route(
            "/api/v1/environments",
            get(handlers::list_environments)
                .post(handlers::create_environment)
                .layer(DefaultBodyLimit::max(CREATE_BODY_LIMIT)),
        )
        .route(
            "/api/v1/environments/{id}",
            get(handlers::get_environment).delete(handlers::delete_environment),
        )
        .route(
            "/api/v1/environments/{id}/exec",
            post(handlers::exec_command).layer(DefaultBodyLimit::max(EXEC_BODY_LIMIT)),
        )
        .route("/api/v1/environments/{id}/logs", get(handlers::get_logs))
        .route(
            "/api/v1/environments/{id}/metrics",
            get(handlers::get_environment_metrics),
        )
        .route(
            "/api/v1/environments/{id}/attach",
            get(handlers::attach_environment),
        )
        .route(
            "/api/v1/environments/{id}/executions",
            get(handlers::list_executions)
                .post(handlers::create_execution)
                .layer(DefaultBodyLimit::max(EXEC_BODY_LIMIT)),
        )
        .route(
            "/api/v1/executions/{id}",
            get(handlers::get_execution).delete(handlers::cancel_execution),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.auth.clone(),
            auth::require_bearer,
        ))
        .with_state(state.clone());

    let cors_layer = if state.config.allowed_origins.is_empty() {
        cors::dev()
    } else {
        let origins: Vec<&str> = state
            .config
            .allowed_origins
            .iter()
            .map(|s| s.as_str())
            .collect();
        cors::prod(&origins)
    };
    let instance = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "agentbox".to_string());

    api.merge(health)
        .layer(axum::middleware::from_fn(access_log::public))
        .layer(axum::middleware::from_fn(request_context::create_context))
        .layer(cors_layer)
        .layer(MetricsLayer::new(instance))
}

/// Run the orchestrator HTTP server.
pub async fn run_server(args: ServerArgs) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let platform: Arc<dyn Platform> = Arc::new(
        KubePlatform::connect(
            args.platform.kubeconfig_path.as_deref(),
            args.platform.cluster_dns_namespace.clone(),
        )
        .await
        .context("failed to connect to the container platform")?,
    );
    platform
        .health_check()
        .await
        .context("platform health check failed at boot")?;

    let auth: Arc<dyn AuthService> = Arc::new(
        ApiKeyAuth::load(&args.api_keys_path)
            .await
            .context("failed to load api keys")?,
    );

    let validator = Validator {
        max_cpu_millis: parse_cpu_millis(&args.limits.max_cpu)
            .context("invalid MAX_CPU quantity")?,
        max_memory_bytes: parse_bytes(&args.limits.max_memory)
            .context("invalid MAX_MEMORY quantity")?,
        max_storage_bytes: parse_bytes(&args.limits.max_storage)
            .context("invalid MAX_STORAGE quantity")?,
        max_timeout_seconds: args.timeouts.max_timeout_seconds,
    };
    let config = ServerConfig {
        namespace_prefix: args.platform.namespace_prefix.clone(),
        default_runtime_class: args.platform.default_runtime_class.clone(),
        default_resources: ResourceSpec {
            cpu: args.limits.default_cpu.clone(),
            memory: args.limits.default_memory.clone(),
            storage: args.limits.default_storage.clone(),
        },
        default_timeout_seconds: args.timeouts.default_timeout_seconds,
        allowed_origins: args
            .allowed_origins
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
    };
    let state = build_state(
        platform,
        auth,
        config,
        validator,
        Duration::from_secs(args.timeouts.startup_timeout_seconds),
        Duration::from_secs(args.timeouts.default_exec_timeout_seconds),
        cancel.clone(),
    );
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", args.listen.host, args.listen.port)
        .parse()
        .context("invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind server to {addr}"))?;
    println!(
        "{}{}",
        "🚀 Starting orchestrator API server • addr=".green(),
        format!("{}", addr).green().dimmed()
    );
    agentbox_common::signal_ready();
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let cancel = cancel.clone();
            async move { cancel.cancelled().await }
        })
        .await
        .context("server error")?;
    println!("{}", "🛑 Orchestrator stopped gracefully.".red());
    Ok(())
}
