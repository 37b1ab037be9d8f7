use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct ListenArgs {
    /// Host to bind the API server to
    #[arg(long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the API server to
    #[arg(long, env = "LISTEN_PORT", default_value_t = 8080)]
    pub port: u16,
}

#[derive(Parser, Debug, Clone)]
pub struct PlatformArgs {
    /// Path to a kubeconfig file. When unset, in-cluster configuration is
    /// tried first, then the default kubeconfig locations.
    #[arg(long, env = "KUBECONFIG_PATH")]
    pub kubeconfig_path: Option<String>,

    /// Prefix for every tenant namespace this control plane creates
    #[arg(long, env = "NAMESPACE_PREFIX", default_value = "agentbox-")]
    pub namespace_prefix: String,

    /// Namespace hosting the cluster DNS service (for the DNS egress rule)
    #[arg(long, env = "CLUSTER_DNS_NAMESPACE", default_value = "kube-system")]
    pub cluster_dns_namespace: String,

    /// RuntimeClass applied to sandbox pods when the request does not name one
    #[arg(long, env = "DEFAULT_RUNTIME_CLASS")]
    pub default_runtime_class: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct ResourceLimitArgs {
    /// CPU applied when a create request omits resources
    #[arg(long, env = "DEFAULT_CPU", default_value = "500m")]
    pub default_cpu: String,

    /// Memory applied when a create request omits resources
    #[arg(long, env = "DEFAULT_MEMORY", default_value = "512Mi")]
    pub default_memory: String,

    /// Ephemeral storage applied when a create request omits resources
    #[arg(long, env = "DEFAULT_STORAGE", default_value = "1Gi")]
    pub default_storage: String,

    /// Largest CPU request a single environment may ask for
    #[arg(long, env = "MAX_CPU", default_value = "4")]
    pub max_cpu: String,

    /// Largest memory request a single environment may ask for
    #[arg(long, env = "MAX_MEMORY", default_value = "8Gi")]
    pub max_memory: String,

    /// Largest ephemeral storage request a single environment may ask for
    #[arg(long, env = "MAX_STORAGE", default_value = "20Gi")]
    pub max_storage: String,
}

#[derive(Parser, Debug, Clone)]
pub struct TimeoutArgs {
    /// Environment lifetime applied when a create request omits one (seconds)
    #[arg(long, env = "DEFAULT_TIMEOUT_SECONDS", default_value_t = 3600)]
    pub default_timeout_seconds: u64,

    /// Largest environment lifetime a request may ask for (seconds)
    #[arg(long, env = "MAX_TIMEOUT_SECONDS", default_value_t = 86400)]
    pub max_timeout_seconds: u64,

    /// How long provisioning waits for the main pod to reach Running (seconds)
    #[arg(long, env = "STARTUP_TIMEOUT_SECONDS", default_value_t = 300)]
    pub startup_timeout_seconds: u64,

    /// Exec timeout applied when the caller does not supply one (seconds)
    #[arg(long, env = "DEFAULT_EXEC_TIMEOUT_SECONDS", default_value_t = 60)]
    pub default_exec_timeout_seconds: u64,
}
