use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Lifecycle status of an environment.
///
/// Transitions are one-way except `pending → running | failed`,
/// `running → terminating → terminated`, and `running → failed`. Any state
/// may jump to `failed` on an unrecoverable provisioning error.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    #[default]
    Pending,
    Running,
    Terminating,
    Terminated,
    Failed,
}

impl EnvironmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl FromStr for EnvironmentStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "terminating" => Ok(Self::Terminating),
            "terminated" => Ok(Self::Terminated),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Terminating => write!(f, "terminating"),
            Self::Terminated => write!(f, "terminated"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Orchestrator-quantity strings, e.g. `cpu: "500m"`, `memory: "512Mi"`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ResourceSpec {
    pub cpu: String,
    pub memory: String,
    pub storage: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Toleration {
    pub key: Option<String>,
    /// `Exists` or `Equal`
    pub operator: String,
    pub value: Option<String>,
    /// `NoSchedule`, `PreferNoSchedule` or `NoExecute`
    pub effect: Option<String>,
    pub toleration_seconds: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct SecurityContext {
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub run_as_non_root: Option<bool>,
    pub read_only_root_filesystem: Option<bool>,
    pub allow_privilege_escalation: Option<bool>,
}

/// User-facing network isolation knobs, layered on top of the default-deny
/// policy every environment gets.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct NetworkConfig {
    #[serde(default)]
    pub allow_internet: bool,

    #[serde(default)]
    pub allowed_egress_cidrs: Vec<String>,

    #[serde(default)]
    pub allow_cluster_internal: bool,

    #[serde(default)]
    pub allowed_ingress_ports: Vec<u16>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct IsolationConfig {
    pub runtime_class: Option<String>,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub security_context: SecurityContext,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct PoolConfig {
    #[serde(default)]
    pub size: i64,

    #[serde(default)]
    pub min_ready: i64,
}

/// The central entity: a tenant-owned namespace + pod + isolation
/// primitives, addressable by a stable `env-<8-hex>` ID.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub image: String,
    pub resources: ResourceSpec,

    #[serde(default)]
    pub env: HashMap<String, String>,

    pub command: Option<Vec<String>>,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub node_selector: HashMap<String, String>,

    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    #[serde(default)]
    pub isolation: IsolationConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub namespace: String,
    pub endpoint_url: Option<String>,
    pub timeout_seconds: u64,
    pub status: EnvironmentStatus,
}

/// Fresh opaque environment ID.
pub fn generate_env_id() -> String {
    format!("env-{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Fresh opaque execution ID.
pub fn generate_exec_id() -> String {
    format!("exec-{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Namespace name for an environment: `<prefix><env-id>`. Stable for the
/// life of the record.
pub fn namespace_name(prefix: &str, env_id: &str) -> String {
    format!("{}{}", prefix, env_id)
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// One ephemeral command run. Holds only its parent environment's ID, not
/// the record itself; the environment may be deleted out from under it.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Execution {
    pub id: String,
    pub environment_id: String,
    pub principal_id: String,
    pub command: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    pub status: ExecutionStatus,
    pub pod_name: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct CreateEnvironmentRequest {
    pub name: String,
    pub image: String,
    pub resources: Option<ResourceSpec>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    pub command: Option<Vec<String>>,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub node_selector: HashMap<String, String>,

    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    pub isolation: Option<IsolationConfig>,
    pub pool: Option<PoolConfig>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ExecRequest {
    pub command: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Seconds; server default applies when omitted.
    pub timeout: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ExecResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ListEnvironmentsResponse {
    pub environments: Vec<Environment>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct CreateExecutionRequest {
    pub command: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ListExecutionsResponse {
    pub executions: Vec<Execution>,
    pub total: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ClusterCapacity {
    pub nodes: usize,
    pub cpu: String,
    pub memory: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub capacity: ClusterCapacity,
}

/// Live resource usage of an environment's main pod.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default)]
pub struct EnvironmentUsage {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

/// One log line as emitted on the SSE stream and in the buffered envelope.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct LogEntry {
    pub timestamp: Option<String>,
    pub stream: String,
    pub message: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct LogsResponse {
    pub lines: Vec<LogEntry>,
}

// ---------------------------------------------------------------------------
// Attach frames
// ---------------------------------------------------------------------------

/// Client → server frames on the attach WebSocket.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AttachClientFrame {
    Stdin { data: String },
}

/// Server → client frames on the attach WebSocket.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AttachServerFrame {
    Stdout { data: String },
    Stderr { data: String },
    Exit { exit_code: i32 },
}

// ---------------------------------------------------------------------------
// Principals
// ---------------------------------------------------------------------------

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Admin,
    SuperAdmin,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Viewer,
    Editor,
    Owner,
}

/// What a caller is trying to do to an environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvAction {
    Read,
    Exec,
    Delete,
}

/// The authenticated caller plus role and per-environment permission set.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Principal {
    pub id: String,
    pub role: Role,

    #[serde(default)]
    pub env_permissions: HashMap<String, Permission>,
}

impl Principal {
    /// Authorization predicate: viewers read, editors exec and attach,
    /// owners delete. Super-admins pass all checks implicitly, and a
    /// principal always passes for environments it owns.
    pub fn allows(&self, env: &Environment, action: EnvAction) -> bool {
        if self.role == Role::SuperAdmin {
            return true;
        }
        if env.owner_id == self.id {
            return true;
        }
        let Some(perm) = self.env_permissions.get(&env.id) else {
            return false;
        };
        match action {
            EnvAction::Read => *perm >= Permission::Viewer,
            EnvAction::Exec => *perm >= Permission::Editor,
            EnvAction::Delete => *perm >= Permission::Owner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with_owner(owner: &str) -> Environment {
        Environment {
            id: "env-0000aaaa".into(),
            owner_id: owner.into(),
            ..Default::default()
        }
    }

    fn principal(role: Role, perm: Option<Permission>) -> Principal {
        let mut p = Principal {
            id: "caller".into(),
            role,
            env_permissions: HashMap::new(),
        };
        if let Some(perm) = perm {
            p.env_permissions.insert("env-0000aaaa".into(), perm);
        }
        p
    }

    #[test]
    fn generated_ids_have_stable_shape() {
        let id = generate_env_id();
        assert!(id.starts_with("env-"));
        assert_eq!(id.len(), 12);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn namespace_is_prefix_plus_id() {
        assert_eq!(
            namespace_name("agentbox-", "env-12ab34cd"),
            "agentbox-env-12ab34cd"
        );
    }

    #[test]
    fn viewer_reads_but_cannot_exec() {
        let env = env_with_owner("someone-else");
        let p = principal(Role::User, Some(Permission::Viewer));
        assert!(p.allows(&env, EnvAction::Read));
        assert!(!p.allows(&env, EnvAction::Exec));
        assert!(!p.allows(&env, EnvAction::Delete));
    }

    #[test]
    fn editor_execs_but_cannot_delete() {
        let env = env_with_owner("someone-else");
        let p = principal(Role::User, Some(Permission::Editor));
        assert!(p.allows(&env, EnvAction::Exec));
        assert!(!p.allows(&env, EnvAction::Delete));
    }

    #[test]
    fn super_admin_and_owner_pass_everything() {
        let env = env_with_owner("caller");
        assert!(principal(Role::User, None).allows(&env, EnvAction::Delete));

        let other = env_with_owner("someone-else");
        assert!(principal(Role::SuperAdmin, None).allows(&other, EnvAction::Delete));
    }

    #[test]
    fn no_grant_means_no_access() {
        let env = env_with_owner("someone-else");
        assert!(!principal(Role::Admin, None).allows(&env, EnvAction::Read));
    }

    #[test]
    fn status_roundtrips_through_serde() {
        let s: EnvironmentStatus = serde_json::from_str("\"terminating\"").unwrap();
        assert_eq!(s, EnvironmentStatus::Terminating);
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"terminating\"");
    }

    #[test]
    fn attach_frames_use_tagged_json() {
        let f = AttachServerFrame::Exit { exit_code: 3 };
        assert_eq!(
            serde_json::to_string(&f).unwrap(),
            r#"{"type":"exit","exit_code":3}"#
        );
        let c: AttachClientFrame = serde_json::from_str(r#"{"type":"stdin","data":"ls\n"}"#).unwrap();
        match c {
            AttachClientFrame::Stdin { data } => assert_eq!(data, "ls\n"),
        }
    }
}
