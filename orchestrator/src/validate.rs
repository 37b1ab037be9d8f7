use std::net::IpAddr;

use agentbox_types::{CreateEnvironmentRequest, ExecRequest, ResourceSpec, Toleration};

use crate::error::Error;

/// Request validation. All rules reject with `Error::Validation`, which the
/// API surface renders as 400 with the offending field named.
pub struct Validator {
    pub max_cpu_millis: u64,
    pub max_memory_bytes: u64,
    pub max_storage_bytes: u64,
    pub max_timeout_seconds: u64,
}

const MAX_NAME_LEN: usize = 63;
const MAX_POOL_SIZE: i64 = 20;

impl Validator {
    pub fn validate_create(&self, req: &CreateEnvironmentRequest) -> Result<(), Error> {
        validate_name(&req.name)?;
        if req.image.trim().is_empty() {
            return Err(Error::Validation("image must not be empty".into()));
        }
        if let Some(resources) = &req.resources {
            self.validate_resources(resources)?;
        }
        if let Some(timeout) = req.timeout_seconds
            && timeout > self.max_timeout_seconds
        {
            return Err(Error::Validation(format!(
                "timeout_seconds {} exceeds maximum {}",
                timeout, self.max_timeout_seconds
            )));
        }
        for key in req.labels.keys() {
            if key.trim().is_empty() {
                return Err(Error::Validation("label keys must not be empty".into()));
            }
        }
        for key in req.node_selector.keys() {
            if key.trim().is_empty() {
                return Err(Error::Validation(
                    "node_selector keys must not be empty".into(),
                ));
            }
        }
        for toleration in &req.tolerations {
            validate_toleration(toleration)?;
        }
        if let Some(isolation) = &req.isolation {
            for cidr in &isolation.network.allowed_egress_cidrs {
                validate_cidr(cidr)?;
            }
            for port in &isolation.network.allowed_ingress_ports {
                if *port == 0 {
                    return Err(Error::Validation(
                        "ingress ports must be in range 1-65535".into(),
                    ));
                }
            }
            let sc = &isolation.security_context;
            if sc.run_as_user.is_some_and(|u| u < 0) {
                return Err(Error::Validation("run_as_user must be non-negative".into()));
            }
            if sc.run_as_group.is_some_and(|g| g < 0) {
                return Err(Error::Validation(
                    "run_as_group must be non-negative".into(),
                ));
            }
        }
        if let Some(pool) = &req.pool {
            if !(0..=MAX_POOL_SIZE).contains(&pool.size) {
                return Err(Error::Validation(format!(
                    "pool size must be in range 0-{MAX_POOL_SIZE}"
                )));
            }
            if pool.min_ready < 0 || pool.min_ready > pool.size {
                return Err(Error::Validation(
                    "pool min_ready must be between 0 and size".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn validate_exec(&self, req: &ExecRequest) -> Result<(), Error> {
        if req.command.is_empty() {
            return Err(Error::Validation("command must not be empty".into()));
        }
        if let Some(timeout) = req.timeout
            && timeout > self.max_timeout_seconds
        {
            return Err(Error::Validation(format!(
                "timeout {} exceeds maximum {}",
                timeout, self.max_timeout_seconds
            )));
        }
        Ok(())
    }

    pub fn validate_resources(&self, spec: &ResourceSpec) -> Result<(), Error> {
        let cpu = parse_cpu_millis(&spec.cpu)
            .map_err(|e| Error::Validation(format!("invalid cpu quantity: {e}")))?;
        if cpu > self.max_cpu_millis {
            return Err(Error::Validation(format!(
                "cpu {} exceeds the configured maximum",
                spec.cpu
            )));
        }
        let memory = parse_bytes(&spec.memory)
            .map_err(|e| Error::Validation(format!("invalid memory quantity: {e}")))?;
        if memory > self.max_memory_bytes {
            return Err(Error::Validation(format!(
                "memory {} exceeds the configured maximum",
                spec.memory
            )));
        }
        let storage = parse_bytes(&spec.storage)
            .map_err(|e| Error::Validation(format!("invalid storage quantity: {e}")))?;
        if storage > self.max_storage_bytes {
            return Err(Error::Validation(format!(
                "storage {} exceeds the configured maximum",
                spec.storage
            )));
        }
        Ok(())
    }
}

/// DNS-label names: `^[a-z0-9]([-a-z0-9]*[a-z0-9])?$`, at most 63 chars.
fn validate_name(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "name {:?} must match ^[a-z0-9]([-a-z0-9]*[a-z0-9])?$ and be at most {} characters",
            name, MAX_NAME_LEN
        )))
    }
}

fn validate_toleration(t: &Toleration) -> Result<(), Error> {
    match t.operator.as_str() {
        "Exists" => {
            if t.value.as_deref().is_some_and(|v| !v.is_empty()) {
                return Err(Error::Validation(
                    "toleration with operator Exists must not set a value".into(),
                ));
            }
        }
        "Equal" => {}
        other => {
            return Err(Error::Validation(format!(
                "toleration operator must be Exists or Equal, got {other:?}"
            )));
        }
    }
    if t.toleration_seconds.is_some() && t.effect.as_deref() != Some("NoExecute") {
        return Err(Error::Validation(
            "toleration_seconds is only valid with effect NoExecute".into(),
        ));
    }
    Ok(())
}

fn validate_cidr(cidr: &str) -> Result<(), Error> {
    let err = || Error::Validation(format!("invalid CIDR {cidr:?}"));
    let (addr, prefix) = cidr.split_once('/').ok_or_else(err)?;
    let addr: IpAddr = addr.parse().map_err(|_| err())?;
    let prefix: u8 = prefix.parse().map_err(|_| err())?;
    let max = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max {
        return Err(err());
    }
    Ok(())
}

/// Parse an orchestrator CPU quantity into millicores: `"100m"` → 100,
/// `"2"` → 2000, `"0.5"` → 500.
pub fn parse_cpu_millis(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty quantity");
    }
    if let Some(millis) = s.strip_suffix('m') {
        let n: u64 = millis.parse()?;
        return Ok(n);
    }
    let cores: f64 = s.parse()?;
    if !cores.is_finite() || cores < 0.0 {
        anyhow::bail!("negative or non-finite cpu quantity");
    }
    Ok((cores * 1000.0).round() as u64)
}

/// Parse an orchestrator memory/storage quantity into bytes. Accepts plain
/// integers plus the binary (`Ki`..`Ti`) and decimal (`K`..`T`) suffixes.
pub fn parse_bytes(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty quantity");
    }
    let suffixes: &[(&str, u64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("K", 1_000),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    for (suffix, mult) in suffixes {
        if let Some(num) = s.strip_suffix(suffix) {
            let n: f64 = num.parse()?;
            if !n.is_finite() || n < 0.0 {
                anyhow::bail!("negative or non-finite quantity");
            }
            return Ok((n * *mult as f64).round() as u64);
        }
    }
    let n: u64 = s.parse()?;
    Ok(n)
}
